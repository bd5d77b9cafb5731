//! Per-output buffer pool. A message buffer moves through three phases:
//! in-flight (being filled or awaiting transmission), final (complete and
//! dequeueable) and cleared (recycled storage waiting for a new id). Ids are
//! stable from allocation until the buffer is cleared, which lets the router
//! keep writing into a partially received message across readiness events.

use hashbrown::HashMap;
use std::collections::BTreeSet;

pub type BufId = u32;

#[derive(Debug)]
pub struct MsgBuf {
    /// Bytes of content while filling, remaining bytes while draining.
    pub size: usize,
    /// Read cursor used while the buffer is drained to an endpoint.
    pub wr_offset: usize,
    buf_id: BufId,
    bytes: Vec<u8>,
}

impl MsgBuf {
    #[inline]
    fn new() -> MsgBuf {
        MsgBuf {
            size: 0,
            wr_offset: 0,
            buf_id: 0,
            bytes: Vec::new(),
        }
    }

    #[inline]
    pub fn buf_id(&self) -> BufId {
        self.buf_id
    }

    /// Grow the backing storage to hold at least `capacity` bytes. Shrinking
    /// never happens; recycled buffers keep their allocation.
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.bytes.len() < capacity {
            self.bytes.resize(capacity, 0);
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[inline]
    fn reset_cleared(&mut self) {
        self.size = 0;
        self.wr_offset = 0;
        self.buf_id = 0;
    }
}

pub struct MsgQueue {
    inflight: HashMap<BufId, MsgBuf>,
    final_marks: BTreeSet<BufId>,
    cleared: Vec<MsgBuf>,
    current_min_id: BufId,
}

impl MsgQueue {
    #[inline]
    pub fn new() -> MsgQueue {
        MsgQueue {
            inflight: HashMap::new(),
            final_marks: BTreeSet::new(),
            cleared: Vec::new(),
            current_min_id: 0,
        }
    }

    /// Obtain an empty buffer for a new message, recycling cleared storage
    /// when possible. The assigned id stays valid for `get`, `finalize` and
    /// `clear` until the buffer leaves the queue.
    pub fn alloc(&mut self) -> BufId {
        let mut buf = self.cleared.pop().unwrap_or_else(MsgBuf::new);
        let id = self.current_min_id;

        buf.buf_id = id;
        self.inflight.insert(id, buf);

        // Advance the minimum until it is no longer occupied. Clears bring it
        // back down, so the scan is bounded by the number of live buffers.
        while self.inflight.contains_key(&self.current_min_id) {
            self.current_min_id += 1;
        }

        id
    }

    #[inline]
    pub fn get(&mut self, id: BufId) -> Option<&mut MsgBuf> {
        self.inflight.get_mut(&id)
    }

    /// Mark a buffer as complete and eligible for dequeueing. Returns false
    /// if the id is not in flight.
    pub fn finalize(&mut self, id: BufId) -> bool {
        if !self.inflight.contains_key(&id) {
            return false;
        }

        self.final_marks.insert(id);
        true
    }

    /// Take the lowest-id finalized buffer out of the queue. The returned
    /// buffer keeps its id; hand it back through `recycle` once drained.
    pub fn dequeue_final(&mut self) -> Option<MsgBuf> {
        let id = *self.final_marks.iter().next()?;

        self.final_marks.remove(&id);
        self.inflight.remove(&id)
    }

    /// Clear an in-flight buffer without dequeueing it, recycling its
    /// storage. Used for failed or dropped messages.
    pub fn clear(&mut self, id: BufId) -> bool {
        match self.inflight.remove(&id) {
            Some(mut buf) => {
                buf.reset_cleared();
                self.cleared.push(buf);
                self.final_marks.remove(&id);

                if id < self.current_min_id {
                    self.current_min_id = id;
                }

                true
            }
            None => false,
        }
    }

    /// Return a dequeued buffer to the cleared pool, releasing its id.
    pub fn recycle(&mut self, mut buf: MsgBuf) {
        let id = buf.buf_id;

        buf.reset_cleared();
        self.cleared.push(buf);

        if id < self.current_min_id {
            self.current_min_id = id;
        }
    }

    #[inline]
    pub fn has_final(&self) -> bool {
        !self.final_marks.is_empty()
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn check_invariants(q: &MsgQueue) {
        // Final marks only cover in-flight buffers
        for id in &q.final_marks {
            assert!(q.inflight.contains_key(id));
        }
        // Ids are consistent with the index
        for (id, buf) in &q.inflight {
            assert_eq!(*id, buf.buf_id);
        }
        // The minimum free id is actually free
        assert!(!q.inflight.contains_key(&q.current_min_id));
        // Cleared buffers hold no id that is also in flight
        for buf in &q.cleared {
            assert_eq!(buf.size, 0);
            assert_eq!(buf.wr_offset, 0);
        }
    }

    #[test]
    fn test_getbuf() {
        let mut q = MsgQueue::new();

        // Ask for a buffer that doesn't exist (empty queue)
        assert!(q.get(10).is_none());

        // Ask for a new buffer and fill it
        let id = q.alloc();
        {
            let buf = q.get(id).unwrap();
            buf.ensure_capacity(4);
            buf.as_mut_slice()[..4].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe]);
            buf.size = 4;
        }

        // Ask for the same buffer again
        let buf = q.get(id).unwrap();
        assert_eq!(&buf.as_slice()[..4], &[0xca, 0xfe, 0xba, 0xbe]);
        assert_eq!(buf.buf_id(), id);

        // Ask for a buffer that doesn't exist (non-empty queue)
        assert!(q.get(10).is_none());

        check_invariants(&q);
    }

    #[test]
    fn test_ids_ascend_from_zero() {
        let mut q = MsgQueue::new();

        for expected in 0..5 {
            assert_eq!(q.alloc(), expected);
        }

        check_invariants(&q);
    }

    #[test]
    fn test_finalize_dequeue() {
        let mut q = MsgQueue::new();

        for _ in 0..10 {
            q.alloc();
        }

        assert!(q.finalize(1));
        assert!(q.finalize(7));
        assert!(q.finalize(3));

        // Dequeueing drains in ascending id order
        let buf1 = q.dequeue_final().unwrap();
        assert_eq!(buf1.buf_id(), 1);
        let buf2 = q.dequeue_final().unwrap();
        assert_eq!(buf2.buf_id(), 3);
        let buf3 = q.dequeue_final().unwrap();
        assert_eq!(buf3.buf_id(), 7);

        // There are no more buffers to dequeue
        assert!(q.dequeue_final().is_none());

        check_invariants(&q);
    }

    #[test]
    fn test_finalize_unknown_id() {
        let mut q = MsgQueue::new();

        q.alloc();

        assert!(!q.finalize(5));
        assert!(q.dequeue_final().is_none());
    }

    #[test]
    fn test_round_trip_preserves_contents() {
        let mut q = MsgQueue::new();

        let id = q.alloc();
        {
            let buf = q.get(id).unwrap();
            buf.ensure_capacity(3);
            buf.as_mut_slice()[..3].copy_from_slice(b"abc");
            buf.size = 3;
        }

        assert!(q.finalize(id));

        let buf = q.dequeue_final().unwrap();
        assert_eq!(&buf.as_slice()[..3], b"abc");
        assert_eq!(buf.buf_id(), id);

        q.recycle(buf);

        // The recycled id is re-issued to the next allocation
        assert_eq!(q.alloc(), id);
        check_invariants(&q);
    }

    #[test]
    fn test_clear_lowers_min_id() {
        let mut q = MsgQueue::new();

        q.alloc();
        q.alloc();
        q.alloc();
        assert!(q.finalize(1));

        assert!(q.clear(1));

        // The cleared id is no longer finalized or fetchable
        assert!(q.dequeue_final().is_none());
        assert!(q.get(1).is_none());

        // ...and is handed out again before any higher id
        assert_eq!(q.alloc(), 1);
        assert_eq!(q.alloc(), 3);

        check_invariants(&q);
    }

    #[test]
    fn test_clear_unknown_id() {
        let mut q = MsgQueue::new();

        q.alloc();

        assert!(!q.clear(9));
    }

    #[test]
    fn test_recycled_storage_is_reused() {
        let mut q = MsgQueue::new();

        let id = q.alloc();
        q.get(id).unwrap().ensure_capacity(4096);
        assert!(q.clear(id));

        let id = q.alloc();
        // The backing allocation survived the clear
        assert!(q.get(id).unwrap().as_slice().len() >= 4096);
        assert_eq!(q.get(id).unwrap().size, 0);
    }

    #[test]
    fn test_random_churn_keeps_invariants() {
        let mut rng = rand::thread_rng();
        let mut q = MsgQueue::new();
        let mut live: Vec<BufId> = Vec::new();

        for _ in 0..1000 {
            match rng.gen_range(0..4) {
                0 => {
                    live.push(q.alloc());
                }
                1 => {
                    if let Some(&id) = live.first() {
                        q.finalize(id);
                    }
                }
                2 => {
                    if let Some(buf) = q.dequeue_final() {
                        live.retain(|&id| id != buf.buf_id());
                        q.recycle(buf);
                    }
                }
                _ => {
                    if !live.is_empty() {
                        let id = live.swap_remove(rng.gen_range(0..live.len()));
                        q.clear(id);
                    }
                }
            }

            check_invariants(&q);
        }
    }
}
