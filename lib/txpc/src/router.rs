//! The switching fabric. A router accumulates messages arriving on input
//! endpoints, looks the destination up by `(endpoint, to-channel)` and
//! queues the bytes - with the destination channel substituted into the
//! header - on the output endpoint's message queue. Negotiation traffic is
//! consumed locally and never switched.
//!
//! The router performs no IO of its own: the host hands it a readable or
//! writable stream on readiness and the router asks for future write
//! readiness through the `IoNotify` sink, so the event loop never spins on
//! writable endpoints with nothing to send.

use crate::crc::CRC32_POLYNOMIAL;
use crate::logging;
use crate::negotiation::{Negotiation, NegotiationEvent};
use crate::queue::{BufId, MsgBuf, MsgQueue};
use crate::support::{ErrorType, RelayError, RelayResult};
use crate::wire::{MsgHeader, MsgType, HEADER_SIZE};
use hashbrown::HashMap;
use std::cmp::min;
use std::io;

pub type EndpointId = usize;

// Read granularity while swallowing unroutable payloads.
const DROP_CHUNK: usize = 256;

/// Readiness-interest sink. Implemented by the host event loop; the router
/// calls these to start and stop readiness notifications per endpoint.
pub trait IoNotify {
    fn notify_read(&mut self, ep: EndpointId, enable: bool);
    fn notify_write(&mut self, ep: EndpointId, enable: bool);
}

/// Link parameters shared by every endpoint behind one router.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RouterConfig {
    pub big_endian: bool,
    pub crc_bits: u8,
    pub crc_polynomial: u32,
}

impl RouterConfig {
    #[inline]
    pub fn crc_len(&self) -> usize {
        (self.crc_bits >> 3) as usize
    }
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            big_endian: false,
            crc_bits: 0,
            crc_polynomial: CRC32_POLYNOMIAL,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RouteTarget {
    pub ep: EndpointId,
    pub to: u8,
}

/// Where an input endpoint is within the current message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum InPhase {
    /// Accumulating the five header bytes.
    Header,
    /// Streaming the message into an output queue buffer.
    Forward {
        out_ep: EndpointId,
        buf_id: BufId,
        offset: usize,
        total: usize,
    },
    /// Collecting a negotiation payload for local handling.
    Negotiate { filled: usize },
    /// Swallowing the body of an unroutable message.
    Drop { remaining: usize },
}

struct InCtx {
    hdr_bytes: [u8; HEADER_SIZE],
    hdr_filled: usize,
    hdr: MsgHeader,
    phase: InPhase,
}

impl InCtx {
    fn new() -> InCtx {
        InCtx {
            hdr_bytes: [0; HEADER_SIZE],
            hdr_filled: 0,
            hdr: MsgHeader::reset(),
            phase: InPhase::Header,
        }
    }

    #[inline]
    fn restart(&mut self) {
        self.hdr_filled = 0;
        self.phase = InPhase::Header;
    }
}

struct OutCtx {
    queue: MsgQueue,
    current: Option<MsgBuf>,
}

impl OutCtx {
    fn new() -> OutCtx {
        OutCtx {
            queue: MsgQueue::new(),
            current: None,
        }
    }
}

pub struct Router<N: IoNotify> {
    config: RouterConfig,
    in_contexts: HashMap<EndpointId, InCtx>,
    out_contexts: HashMap<EndpointId, OutCtx>,
    switch_tbl: HashMap<(EndpointId, u8), RouteTarget>,
    negotiation: Negotiation,
    events: Vec<NegotiationEvent>,
    notify: N,
    scratch: Vec<u8>,
    log: logging::Logger,
}

impl<N: IoNotify> Router<N> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(notify: N, log: L) -> Router<N> {
        let router_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };
        let negotiation = Negotiation::new(&router_log);

        Router {
            config: RouterConfig::default(),
            in_contexts: HashMap::new(),
            out_contexts: HashMap::new(),
            switch_tbl: HashMap::new(),
            negotiation,
            events: Vec::new(),
            notify,
            scratch: Vec::new(),
            log: router_log,
        }
    }

    #[inline]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[inline]
    pub fn config_mut(&mut self) -> &mut RouterConfig {
        &mut self.config
    }

    #[inline]
    pub fn notify_mut(&mut self) -> &mut N {
        &mut self.notify
    }

    /// True if the endpoint has queued output waiting to drain.
    pub fn has_pending_output(&self, ep: EndpointId) -> bool {
        self.out_contexts
            .get(&ep)
            .map(|out| out.current.is_some() || out.queue.has_final())
            .unwrap_or(false)
    }

    /// Drain the negotiation events recorded since the last call.
    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = NegotiationEvent> + '_ {
        self.events.drain(..)
    }

    /// Install the path for messages arriving on `(in_ep, in_to)`. Creates
    /// the input context and the output context (with a fresh queue) on
    /// first use, and asks the event loop to watch the input for data.
    pub fn set_route(&mut self, in_ep: EndpointId, out_ep: EndpointId, in_to: u8, out_to: u8) {
        self.switch_tbl
            .insert((in_ep, in_to), RouteTarget { ep: out_ep, to: out_to });

        if !self.in_contexts.contains_key(&in_ep) {
            self.in_contexts.insert(in_ep, InCtx::new());
            self.notify.notify_read(in_ep, true);
        }

        if !self.out_contexts.contains_key(&out_ep) {
            self.out_contexts.insert(out_ep, OutCtx::new());
        }

        logging::debug!(self.log, "route installed";
                        "context" => "set_route",
                        "in_ep" => in_ep,
                        "in_to" => in_to,
                        "out_ep" => out_ep,
                        "out_to" => out_to);
    }

    /// Remove a route. The input context goes away with the last route from
    /// its endpoint; output contexts are kept for the router's life since
    /// their queues own recycled buffers other routes may still fill.
    pub fn remove_route(&mut self, in_ep: EndpointId, in_to: u8) -> bool {
        let removed = self.switch_tbl.remove(&(in_ep, in_to)).is_some();

        if removed && !self.switch_tbl.keys().any(|&(ep, _)| ep == in_ep) {
            self.in_contexts.remove(&in_ep);
            self.notify.notify_read(in_ep, false);
        }

        logging::debug!(self.log, "route removed";
                        "context" => "remove_route",
                        "in_ep" => in_ep,
                        "in_to" => in_to,
                        "removed" => removed);

        removed
    }

    /// Pull available bytes from a read-ready input endpoint and advance its
    /// in-flight message: header accumulation, then either forwarding into
    /// the destination queue, local negotiation handling, or a drop of an
    /// unroutable body. Returns the number of bytes consumed.
    ///
    /// A would-block read folds into `Ok(0)`, so a zero return by itself
    /// does not distinguish a stalled stream from a closed one. Only a
    /// caller invoking this from a level-triggered readable event - where
    /// the kernel has vouched for pending data - may treat `Ok(0)` as
    /// end-of-stream.
    pub fn accumulate_msg<R: io::Read>(&mut self, ep: EndpointId, io: &mut R) -> RelayResult<usize> {
        let config = self.config;
        let ctx = match self.in_contexts.get_mut(&ep) {
            Some(ctx) => ctx,
            None => return Err(RelayError::Fatal(ErrorType::UnknownEndpoint)),
        };

        let mut consumed = 0;

        loop {
            match ctx.phase {
                InPhase::Header => {
                    if ctx.hdr_filled < HEADER_SIZE {
                        let count =
                            fold_would_block(io.read(&mut ctx.hdr_bytes[ctx.hdr_filled..]))?;
                        ctx.hdr_filled += count;
                        consumed += count;

                        if ctx.hdr_filled < HEADER_SIZE {
                            return Ok(consumed);
                        }
                    }

                    let hdr = match MsgHeader::decode(&ctx.hdr_bytes, config.big_endian) {
                        Ok(hdr) => hdr,
                        Err(_) => {
                            logging::debug!(self.log, "dropping unknown message type";
                                            "context" => "accumulate_msg",
                                            "endpoint" => ep,
                                            "raw_type" => ctx.hdr_bytes[2]);
                            ctx.hdr_filled = 0;
                            return Ok(consumed);
                        }
                    };
                    ctx.hdr = hdr;

                    if hdr.is_negotiation() {
                        ctx.phase = InPhase::Negotiate { filled: 0 };
                        continue;
                    }

                    // Data frames carry the negotiated checksum tail through
                    // the switch; verification is the receiving relay's job.
                    let body = hdr.size as usize
                        + match hdr.kind {
                            MsgType::Data => config.crc_len(),
                            _ => 0,
                        };

                    let target = match self.switch_tbl.get(&(ep, hdr.to)) {
                        Some(&target) => target,
                        None => {
                            logging::debug!(self.log, "no route, dropping message";
                                            "context" => "accumulate_msg",
                                            "endpoint" => ep,
                                            "to" => hdr.to,
                                            "size" => hdr.size);
                            ctx.phase = InPhase::Drop { remaining: body };
                            continue;
                        }
                    };

                    let out = match self.out_contexts.get_mut(&target.ep) {
                        Some(out) => out,
                        None => {
                            // Every routed endpoint gets its context at
                            // set_route time, so this is host misuse
                            logging::error!(self.log, "route without output context";
                                            "context" => "accumulate_msg",
                                            "out_ep" => target.ep);
                            ctx.phase = InPhase::Drop { remaining: body };
                            continue;
                        }
                    };

                    let total = HEADER_SIZE + body;
                    let buf_id = out.queue.alloc();
                    let buf = out.queue.get(buf_id).expect("Fresh buffer must exist");
                    buf.ensure_capacity(total);

                    let mut out_hdr = hdr;
                    out_hdr.to = target.to;
                    let mut hdr_bytes = [0u8; HEADER_SIZE];
                    out_hdr.encode(&mut hdr_bytes, config.big_endian);
                    buf.as_mut_slice()[..HEADER_SIZE].copy_from_slice(&hdr_bytes);
                    buf.size = HEADER_SIZE;

                    ctx.phase = InPhase::Forward {
                        out_ep: target.ep,
                        buf_id,
                        offset: HEADER_SIZE,
                        total,
                    };
                }

                InPhase::Forward {
                    out_ep,
                    buf_id,
                    offset,
                    total,
                } => {
                    let out = self
                        .out_contexts
                        .get_mut(&out_ep)
                        .expect("Forwarding to missing output context");
                    let buf = match out.queue.get(buf_id) {
                        Some(buf) => buf,
                        None => {
                            // The queue lost the buffer under us; drop the
                            // rest of the message and resynchronize
                            ctx.phase = InPhase::Drop {
                                remaining: total - offset,
                            };
                            continue;
                        }
                    };

                    let count = if offset < total {
                        fold_would_block(io.read(&mut buf.as_mut_slice()[offset..total]))?
                    } else {
                        0
                    };

                    let offset = offset + count;
                    consumed += count;
                    buf.size = offset;

                    self.notify.notify_write(out_ep, true);

                    if offset == total {
                        out.queue.finalize(buf_id);
                        ctx.restart();
                        logging::trace!(self.log, "message finalized";
                                        "context" => "accumulate_msg",
                                        "out_ep" => out_ep,
                                        "buf_id" => buf_id,
                                        "total" => total);
                    } else {
                        ctx.phase = InPhase::Forward {
                            out_ep,
                            buf_id,
                            offset,
                            total,
                        };
                    }

                    return Ok(consumed);
                }

                InPhase::Negotiate { filled } => {
                    let body = ctx.hdr.size as usize;

                    let count = if filled < body {
                        if self.scratch.len() < body {
                            self.scratch.resize(body, 0);
                        }
                        fold_would_block(io.read(&mut self.scratch[filled..body]))?
                    } else {
                        0
                    };

                    let filled = filled + count;
                    consumed += count;

                    if filled == body {
                        if let Some(event) =
                            self.negotiation
                                .handle(&ctx.hdr, &self.scratch[..body], &mut self.config)
                        {
                            self.events.push(event);
                        }
                        ctx.restart();
                    } else {
                        ctx.phase = InPhase::Negotiate { filled };
                    }

                    return Ok(consumed);
                }

                InPhase::Drop { remaining } => {
                    let count = if remaining > 0 {
                        let step = min(remaining, DROP_CHUNK);
                        if self.scratch.len() < step {
                            self.scratch.resize(step, 0);
                        }
                        fold_would_block(io.read(&mut self.scratch[..step]))?
                    } else {
                        0
                    };

                    consumed += count;
                    let remaining = remaining - count;

                    if remaining == 0 {
                        ctx.restart();
                    } else {
                        ctx.phase = InPhase::Drop { remaining };
                    }

                    return Ok(consumed);
                }
            }
        }
    }

    /// Push the next final buffer (lowest id first) out of a write-ready
    /// endpoint. One buffer drains across as many calls as the transport
    /// needs; once the queue is out of final buffers the event loop is told
    /// to stop raising write readiness for the endpoint.
    pub fn write_msg<W: io::Write>(&mut self, ep: EndpointId, io: &mut W) -> RelayResult<usize> {
        let out = match self.out_contexts.get_mut(&ep) {
            Some(out) => out,
            None => return Err(RelayError::Fatal(ErrorType::UnknownEndpoint)),
        };

        if out.current.is_none() {
            match out.queue.dequeue_final() {
                Some(buf) => {
                    logging::trace!(self.log, "draining buffer";
                                    "context" => "write_msg",
                                    "endpoint" => ep,
                                    "buf_id" => buf.buf_id(),
                                    "size" => buf.size);
                    out.current = Some(buf);
                }
                None => {
                    self.notify.notify_write(ep, false);
                    return Ok(0);
                }
            }
        }

        let mut written = 0;
        let mut finished = false;

        if let Some(buf) = out.current.as_mut() {
            let end = buf.wr_offset + buf.size;
            written = fold_would_block(io.write(&buf.as_slice()[buf.wr_offset..end]))?;
            buf.wr_offset += written;
            buf.size -= written;
            finished = buf.size == 0;
        }

        if finished {
            if let Some(buf) = out.current.take() {
                out.queue.recycle(buf);
            }
        }

        Ok(written)
    }
}

fn fold_would_block(result: io::Result<usize>) -> RelayResult<usize> {
    match result {
        Ok(count) => Ok(count),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}
