use crate::buffer::Buffer;
use crate::wire::MsgHeader;
use std::cmp::min;
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Write = 0,
    Read = 1,
}

/// How much of an adapter buffer a reset call releases.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Discard {
    All,
    Bytes(usize),
}

/// Byte stream access for a relay endpoint. Implementations must never
/// block: a read or write that cannot make progress returns 0 and the relay
/// is driven again on the next readiness event.
///
/// Reads are delivered sequentially but remain the adapter's property until
/// the relay commits them with `reset(Read, ..)`: a buffered adapter keeps
/// the bytes of the in-progress message so that a malformed frame can be
/// dropped without desynchronizing the stream.
pub trait RelayIo {
    /// Read up to `max` bytes into `buf[offset..]`, returning the count.
    fn read(&mut self, buf: &mut [u8], offset: usize, max: usize) -> usize;

    /// Write up to `max` bytes from `buf[offset..]`, returning the count.
    fn write(&mut self, buf: &[u8], offset: usize, max: usize) -> usize;

    /// Release adapter buffer space for the given direction.
    fn reset(&mut self, dir: Direction, amount: Discard);
}

/// Handler for fully received messages. Returning false signals
/// backpressure: the relay keeps the payload and retries the delivery on the
/// next read turn without touching the transport in between.
pub trait Dispatch {
    fn dispatch(&mut self, hdr: &MsgHeader, payload: &[u8]) -> bool;
}

impl<F> Dispatch for F
where
    F: FnMut(&MsgHeader, &[u8]) -> bool,
{
    #[inline]
    fn dispatch(&mut self, hdr: &MsgHeader, payload: &[u8]) -> bool {
        self(hdr, payload)
    }
}

/// Buffered `RelayIo` adapter over any non-blocking byte stream.
///
/// Incoming bytes are staged in a chunked buffer and handed to the relay
/// without being consumed; `reset(Read, ..)` commits them. Outgoing bytes
/// are accepted unconditionally into the write buffer and drained
/// opportunistically - hosts flush the remainder on write readiness.
pub struct StreamIo<S> {
    stream: S,
    rbuf: Buffer,
    wbuf: Buffer,
    delivered: usize,
}

impl<S: io::Read + io::Write> StreamIo<S> {
    #[inline]
    pub fn new(stream: S) -> StreamIo<S> {
        StreamIo {
            stream,
            rbuf: Buffer::new(),
            wbuf: Buffer::new(),
            delivered: 0,
        }
    }

    /// Drain buffered output to the underlying stream. Returns the number of
    /// bytes pushed out; 0 means the stream would block.
    #[inline]
    pub fn flush_out(&mut self) -> io::Result<usize> {
        self.wbuf.egress(&mut self.stream)
    }

    /// Bytes accepted from the relay but not yet on the wire.
    #[inline]
    pub fn pending_out(&self) -> usize {
        self.wbuf.len()
    }

    #[inline]
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: io::Read + io::Write> RelayIo for StreamIo<S> {
    fn read(&mut self, buf: &mut [u8], offset: usize, max: usize) -> usize {
        // Pull whatever the stream has before serving from the stage
        if self.rbuf.ingress(&mut self.stream).is_err() {
            return 0;
        }

        let available = self.rbuf.len() - self.delivered;
        let count = min(available, max);

        if count > 0 {
            self.rbuf
                .copy_from(self.delivered, &mut buf[offset..offset + count]);
            self.delivered += count;
        }

        count
    }

    fn write(&mut self, buf: &[u8], offset: usize, max: usize) -> usize {
        use std::io::Write;

        let end = min(buf.len(), offset + max);
        self.wbuf
            .write(&buf[offset..end])
            .expect("Stage buffer writes are infallible");
        let _ = self.flush_out();

        end - offset
    }

    fn reset(&mut self, dir: Direction, amount: Discard) {
        match dir {
            Direction::Read => {
                let count = match amount {
                    Discard::All => self.delivered,
                    Discard::Bytes(bytes) => min(bytes, self.delivered),
                };

                if count > 0 {
                    self.rbuf.discard(count);
                    self.delivered -= count;
                }
            }
            // Outgoing bytes were committed to the stage at write time
            Direction::Write => {}
        }
    }
}
