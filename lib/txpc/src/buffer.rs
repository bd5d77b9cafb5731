//! Byte FIFO backing the buffered stream adapters. Storage is a ring of
//! fixed-size segments recycled through a small spare list, so steady-state
//! traffic does not allocate. Consumers may peek buffered bytes without
//! taking them and later drop a committed prefix, which is what the relay's
//! IO reset contract needs.

use std::cmp::min;
use std::collections::VecDeque;
use std::io;

pub(crate) const SEGMENT_SIZE: usize = 4096;

// Spent segments kept for reuse before hitting the allocator again.
const RECYCLE_LIMIT: usize = 8;

/// One fixed-size storage cell with a consume cursor and a fill cursor.
/// Consuming the last queued byte snaps both cursors back to zero, making
/// the whole cell writable again.
struct Segment {
    bytes: Box<[u8; SEGMENT_SIZE]>,
    head: usize,
    tail: usize,
}

impl Segment {
    #[inline]
    fn new() -> Segment {
        Segment {
            bytes: Box::new([0; SEGMENT_SIZE]),
            head: 0,
            tail: 0,
        }
    }

    /// Bytes queued and not yet consumed.
    #[inline]
    fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Room left for filling.
    #[inline]
    fn free(&self) -> usize {
        SEGMENT_SIZE - self.tail
    }

    /// View of the queued bytes.
    #[inline]
    fn data(&self) -> &[u8] {
        &self.bytes[self.head..self.tail]
    }

    /// View of the unfilled rest of the cell.
    #[inline]
    fn space(&mut self) -> &mut [u8] {
        &mut self.bytes[self.tail..]
    }

    /// Drop up to `count` queued bytes, returning how many actually went.
    /// Draining the segment rewinds both cursors.
    fn consume(&mut self, count: usize) -> usize {
        let step = min(count, self.len());

        self.head += step;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }

        step
    }

    /// Record `count` bytes as filled behind `space()`.
    #[inline]
    fn commit(&mut self, count: usize) {
        assert!(count <= self.free(), "Segment overfilled");
        self.tail += count;
    }
}

/// A dynamically growing FIFO byte queue. Data is appended at the back and
/// consumed from the front; `copy_from` peeks without consuming.
pub struct Buffer {
    segments: VecDeque<Segment>,
    spare: Vec<Segment>,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::new());
        Buffer {
            segments,
            spare: Vec::new(),
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.len() == 0)
    }

    /// Read from the supplied reader until it runs dry or would block.
    /// Returns the number of bytes taken in.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0usize;

        loop {
            if self
                .segments
                .back()
                .map(|segment| segment.free() == 0)
                .unwrap_or(true)
            {
                let fresh = self.spare.pop().unwrap_or_else(Segment::new);
                self.segments.push_back(fresh);
            }

            let segment = self
                .segments
                .back_mut()
                .expect("Segment ring is never empty");

            match reader.read(segment.space()) {
                Ok(0) => return Ok(total),
                Ok(count) => {
                    segment.commit(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write buffered data to the supplied writer until the buffer drains or
    /// the writer stops accepting. Returns the number of bytes pushed out.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0usize;

        loop {
            self.drop_spent_front();

            let segment = self
                .segments
                .front_mut()
                .expect("Segment ring is never empty");

            if segment.len() == 0 {
                return Ok(total);
            }

            match writer.write(segment.data()) {
                Ok(0) => return Ok(total),
                Ok(count) => {
                    segment.consume(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop `count` bytes from the front of the buffer.
    pub fn discard(&mut self, count: usize) {
        if count > self.len() {
            panic!(
                "Discard of {} bytes exceeds the {} buffered",
                count,
                self.len()
            );
        }

        let mut remaining = count;
        while remaining > 0 {
            {
                let segment = self
                    .segments
                    .front_mut()
                    .expect("Segment ring is never empty");
                remaining -= segment.consume(remaining);
            }
            self.drop_spent_front();
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        if len > 0 {
            self.discard(len);
        }
    }

    /// Copy buffered bytes starting at `offset` into `dest` without
    /// consuming them. Returns the number of bytes copied.
    pub fn copy_from(&self, offset: usize, dest: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut copied = 0usize;

        for segment in &self.segments {
            let data = segment.data();

            if skip >= data.len() {
                skip -= data.len();
                continue;
            }

            let step = min(data.len() - skip, dest.len() - copied);
            dest[copied..copied + step].copy_from_slice(&data[skip..skip + step]);
            copied += step;
            skip = 0;

            if copied == dest.len() {
                break;
            }
        }

        copied
    }

    /// Retire drained front segments into the spare list, always leaving at
    /// least one segment in the ring.
    fn drop_spent_front(&mut self) {
        while self.segments.len() > 1
            && self
                .segments
                .front()
                .map(|segment| segment.len() == 0)
                .unwrap_or(false)
        {
            let spent = self
                .segments
                .pop_front()
                .expect("Segment ring is never empty");

            if self.spare.len() < RECYCLE_LIMIT {
                self.spare.push(spent);
            }
        }
    }
}

impl io::Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.egress(buf)
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ingress(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Source that delivers at most `step` bytes per call and would-blocks
    /// once its script is exhausted.
    struct TrickleReader {
        pending: VecDeque<u8>,
        step: usize,
    }

    impl TrickleReader {
        fn new(data: &[u8], step: usize) -> TrickleReader {
            TrickleReader {
                pending: data.iter().cloned().collect(),
                step,
            }
        }
    }

    impl io::Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let quota = min(self.step, buf.len());
            let mut count = 0;
            while count < quota {
                match self.pending.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }

            Ok(count)
        }
    }

    /// Sink that accepts at most `step` bytes per call up to a total limit,
    /// then would-blocks.
    struct TrickleWriter {
        accepted: Vec<u8>,
        step: usize,
        limit: usize,
    }

    impl TrickleWriter {
        fn new(step: usize, limit: usize) -> TrickleWriter {
            TrickleWriter {
                accepted: Vec::new(),
                step,
                limit,
            }
        }
    }

    impl io::Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accepted.len() >= self.limit {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let quota = min(min(self.step, buf.len()), self.limit - self.accepted.len());
            self.accepted.extend_from_slice(&buf[..quota]);
            Ok(quota)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_trickle_roundtrip() {
        let payload: Vec<_> = (0..SEGMENT_SIZE * 3).map(|item| item as u8).collect();
        let mut buffer = Buffer::new();

        let taken = buffer
            .ingress(TrickleReader::new(&payload, 500))
            .unwrap();

        assert_eq!(taken, payload.len());
        assert_eq!(buffer.len(), payload.len());

        let mut sink = TrickleWriter::new(500, payload.len());
        let pushed = buffer.egress(&mut sink).unwrap();

        assert_eq!(pushed, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.accepted, payload);
    }

    #[test]
    fn test_cursor_io() {
        let mut buffer = Buffer::new();

        buffer.ingress(&mut Cursor::new(vec![1, 2, 3])).unwrap();
        assert_eq!(buffer.len(), 3);

        let mut out = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut out).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&out.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_egress_stops_at_full_sink() {
        let mut buffer = Buffer::new();
        buffer
            .ingress(&mut Cursor::new(vec![9u8; 100]))
            .unwrap();

        let mut sink = TrickleWriter::new(16, 40);
        let pushed = buffer.egress(&mut sink).unwrap();

        assert_eq!(pushed, 40);
        assert_eq!(buffer.len(), 60);
    }

    #[test]
    fn test_discard_within_segment() {
        let mut buffer = Buffer::new();

        buffer.ingress(&mut Cursor::new(vec![1, 2, 3, 4, 5])).unwrap();
        buffer.discard(2);

        assert_eq!(buffer.len(), 3);

        let mut out = [0u8; 3];
        assert_eq!(buffer.copy_from(0, &mut out), 3);
        assert_eq!(out, [3, 4, 5]);
    }

    #[test]
    fn test_discard_across_segments() {
        let payload: Vec<_> = (0..SEGMENT_SIZE + 100).map(|item| item as u8).collect();
        let mut buffer = Buffer::new();

        buffer.ingress(TrickleReader::new(&payload, 512)).unwrap();
        buffer.discard(SEGMENT_SIZE + 50);

        assert_eq!(buffer.len(), 50);

        let mut out = [0u8; 50];
        assert_eq!(buffer.copy_from(0, &mut out), 50);
        assert_eq!(&out[..], &payload[SEGMENT_SIZE + 50..]);
    }

    #[test]
    #[should_panic(expected = "exceeds the")]
    fn test_discard_overrun() {
        let mut buffer = Buffer::new();

        buffer.ingress(&mut Cursor::new(vec![1, 2, 3])).unwrap();
        buffer.discard(4);
    }

    #[test]
    fn test_copy_from_offset() {
        let mut buffer = Buffer::new();

        buffer.ingress(&mut Cursor::new(vec![10, 20, 30, 40])).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(buffer.copy_from(1, &mut out), 2);
        assert_eq!(out, [20, 30]);

        // Peeking does not consume
        assert_eq!(buffer.len(), 4);

        // Copies are clamped to the available data
        let mut out = [0u8; 8];
        assert_eq!(buffer.copy_from(2, &mut out), 2);
        assert_eq!(&out[..2], &[30, 40]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = Buffer::new();

        buffer.ingress(&mut Cursor::new(vec![1, 2, 3])).unwrap();
        buffer.clear();

        assert!(buffer.is_empty());

        // Clearing an empty buffer is a no-op
        buffer.clear();
    }
}
