//! Connection-state management for a single point-to-point TinyXPC session.
//!
//! The relay is two parallel state machines - one per transfer direction -
//! which interact with each other through a small set of signals. Messages
//! are atomic: neither machine leaves its current operation until the
//! in-flight message is fully transferred or a reset tears it down. All IO
//! goes through an injected adapter, so the relay imposes no event system or
//! memory model on the host.

pub mod io;

pub use self::io::{Direction, Discard, Dispatch, RelayIo, StreamIo};

use crate::crc::{encode_digest, CrcProvider};
use crate::logging;
use crate::support::Status;
use crate::wire::{MsgHeader, MsgType, HEADER_SIZE};

const MAX_CRC_BYTES: usize = 4;

/// Negotiated connection parameters. Fresh sessions start little-endian
/// with checksums disabled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnConfig {
    pub crc_bits: u8,
    pub big_endian: bool,
    pub require_msg_ack: bool,
}

impl ConnConfig {
    #[inline]
    pub fn crc_len(&self) -> usize {
        (self.crc_bits >> 3) as usize
    }
}

impl Default for ConnConfig {
    fn default() -> ConnConfig {
        ConnConfig {
            crc_bits: 0,
            big_endian: false,
            require_msg_ack: false,
        }
    }
}

/// Cross-machine signals. The `*_send` flags are asserted by the entry
/// points and cleared by the receive machine when the peer acknowledges; the
/// `*_recvd` flags are asserted by the receive machine on header
/// identification and cleared by the send machine once the reply is out.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
struct Signals {
    rst_recvd: bool,
    rst_send: bool,
    disc_recvd: bool,
    disc_send: bool,
    crc_recvd: bool,
    crc_send: bool,
    endianness_recvd: bool,
    endianness_send: bool,
}

impl Signals {
    #[inline]
    fn any(&self) -> bool {
        *self != Signals::default()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOp {
    None,
    Reset,
    Msg,
    SetCrc,
    SetEndianness,
    Disconnect,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvOp {
    None,
    WaitReset,
    WaitMsg,
    WaitCrc,
    WaitEndianness,
    WaitDisconnect,
    WaitDispatch,
}

struct SendInflight {
    op: SendOp,
    total_bytes: usize,
    bytes_complete: usize,
    hdr: MsgHeader,
    hdr_bytes: [u8; HEADER_SIZE],
    payload: Vec<u8>,
    crc_bytes: [u8; MAX_CRC_BYTES],
    crc_len: usize,
    crc_ready: bool,
}

impl SendInflight {
    fn idle() -> SendInflight {
        SendInflight {
            op: SendOp::None,
            total_bytes: 0,
            bytes_complete: 0,
            hdr: MsgHeader::reset(),
            hdr_bytes: [0; HEADER_SIZE],
            payload: Vec::new(),
            crc_bytes: [0; MAX_CRC_BYTES],
            crc_len: 0,
            crc_ready: false,
        }
    }

    /// Return to the idle state, keeping the payload allocation.
    fn reset_idle(&mut self) {
        self.op = SendOp::None;
        self.total_bytes = 0;
        self.bytes_complete = 0;
        self.payload.clear();
        self.crc_len = 0;
        self.crc_ready = false;
    }

    /// Stage an outgoing message. Control frames pass their value bytes as
    /// the payload; data frames additionally reserve the checksum tail.
    fn begin(&mut self, op: SendOp, hdr: MsgHeader, payload: &[u8], config: &ConnConfig) {
        let crc_len = match op {
            SendOp::Msg => config.crc_len(),
            // The negotiation sub-protocol never carries a checksum: the CRC
            // configuration itself may be changing mid-exchange.
            _ => 0,
        };

        self.op = op;
        self.hdr = hdr;
        hdr.encode(&mut self.hdr_bytes, config.big_endian);
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.total_bytes = HEADER_SIZE + payload.len() + crc_len;
        self.bytes_complete = 0;
        self.crc_len = crc_len;
        self.crc_ready = false;
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.bytes_complete == self.total_bytes
    }
}

struct RecvInflight {
    op: RecvOp,
    total_bytes: usize,
    bytes_complete: usize,
    hdr: MsgHeader,
    hdr_bytes: [u8; HEADER_SIZE],
    payload: Vec<u8>,
}

impl RecvInflight {
    fn idle() -> RecvInflight {
        RecvInflight {
            op: RecvOp::None,
            total_bytes: 0,
            bytes_complete: 0,
            hdr: MsgHeader::reset(),
            hdr_bytes: [0; HEADER_SIZE],
            payload: Vec::new(),
        }
    }

    fn reset_idle(&mut self) {
        self.op = RecvOp::None;
        self.total_bytes = 0;
        self.bytes_complete = 0;
        self.payload.clear();
    }
}

/// A configured point-to-point relay.
///
/// The host calls `write_continue` when the transport is ready for writing
/// and `read_continue` when it is ready for reading; everything else is
/// non-blocking state manipulation.
pub struct Relay<I: RelayIo, D: Dispatch, C: CrcProvider> {
    config: ConnConfig,
    io: I,
    dispatcher: D,
    crc: C,
    signals: Signals,
    wr: SendInflight,
    rd: RecvInflight,
    pending_crc_bits: Option<u8>,
    pending_endianness: Option<bool>,
    shutdown: bool,
    log: logging::Logger,
}

impl<I: RelayIo, D: Dispatch, C: CrcProvider> Relay<I, D, C> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        io: I,
        dispatcher: D,
        crc: C,
        log: L,
    ) -> Relay<I, D, C> {
        let relay_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Relay {
            config: ConnConfig::default(),
            io,
            dispatcher,
            crc,
            signals: Signals::default(),
            wr: SendInflight::idle(),
            rd: RecvInflight::idle(),
            pending_crc_bits: None,
            pending_endianness: None,
            shutdown: false,
            log: relay_log,
        }
    }

    #[inline]
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    #[inline]
    pub fn send_op(&self) -> SendOp {
        self.wr.op
    }

    #[inline]
    pub fn recv_op(&self) -> RecvOp {
        self.rd.op
    }

    /// True once a disconnect exchange has completed. The relay is inert
    /// afterwards.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    #[inline]
    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// Initiate the reset handshake. The exchange completes once both sides
    /// have sent and acknowledged a reset frame; an in-flight read on this
    /// side is cancelled by the handshake.
    pub fn send_reset(&mut self) -> Status {
        if self.shutdown {
            return Status::BadState;
        }
        if self.wr.op != SendOp::None {
            return Status::Inflight;
        }

        logging::debug!(self.log, "reset requested"; "context" => "send_reset");
        self.signals.rst_send = true;
        Status::Done
    }

    /// Initiate the disconnect handshake. Acknowledged like a reset; once
    /// complete the relay shuts down for good.
    pub fn send_disconnect(&mut self) -> Status {
        if self.shutdown {
            return Status::BadState;
        }
        if self.wr.op != SendOp::None {
            return Status::Inflight;
        }

        logging::debug!(self.log, "disconnect requested"; "context" => "send_disconnect");
        self.signals.disc_send = true;
        Status::Done
    }

    /// Stage a data message for transmission. The payload is copied into the
    /// relay, so the caller's buffer is free as soon as this returns.
    pub fn send_msg(&mut self, to: u8, from: u8, data: &[u8]) -> Status {
        if self.shutdown || data.len() > usize::from(u16::MAX) {
            return Status::BadState;
        }
        // Messages may not be interleaved with a pending negotiation exchange
        if self.wr.op != SendOp::None || self.signals.any() {
            return Status::Inflight;
        }

        let hdr = MsgHeader::data(data.len() as u16, to, from);
        let config = self.config;
        self.wr.begin(SendOp::Msg, hdr, data, &config);

        logging::trace!(self.log, "message staged";
                        "context" => "send_msg",
                        "to" => to,
                        "from" => from,
                        "size" => data.len(),
                        "total_bytes" => self.wr.total_bytes);

        Status::Done
    }

    /// Negotiate the checksum width. Takes effect on both sides only after
    /// the peer's acknowledgement.
    pub fn send_set_crc(&mut self, bits: u8) -> Status {
        if self.shutdown || !matches!(bits, 0 | 8 | 16 | 32) {
            return Status::BadState;
        }
        if self.wr.op != SendOp::None || self.signals.any() {
            return Status::Inflight;
        }

        self.pending_crc_bits = Some(bits);
        self.signals.crc_send = true;
        Status::Done
    }

    /// Negotiate the wire endianness. Takes effect on both sides only after
    /// the peer's acknowledgement, so the exchange itself travels in the old
    /// encoding.
    pub fn send_set_endianness(&mut self, big_endian: bool) -> Status {
        if self.shutdown {
            return Status::BadState;
        }
        if self.wr.op != SendOp::None || self.signals.any() {
            return Status::Inflight;
        }

        self.pending_endianness = Some(big_endian);
        self.signals.endianness_send = true;
        Status::Done
    }

    /// Advance the send machine. Loops while the state changes or the
    /// transport accepts bytes, so one call drains as much as the endpoint
    /// permits without blocking.
    pub fn write_continue(&mut self) -> Status {
        if self.shutdown {
            return Status::BadState;
        }

        loop {
            let starting = self.wr.op;
            let mut bytes = 0;

            match self.wr.op {
                SendOp::None => {
                    if self.signals.rst_send || self.signals.rst_recvd {
                        let config = self.config;
                        self.wr.begin(SendOp::Reset, MsgHeader::reset(), &[], &config);
                    } else if self.signals.disc_recvd || self.signals.disc_send {
                        let config = self.config;
                        self.wr
                            .begin(SendOp::Disconnect, MsgHeader::disconnect(), &[], &config);
                    } else if self.signals.crc_recvd || self.signals.crc_send {
                        let bits = self.pending_crc_bits.unwrap_or(self.config.crc_bits);
                        let config = self.config;
                        self.wr.begin(
                            SendOp::SetCrc,
                            MsgHeader::negotiation(MsgType::SetCrc, 1),
                            &[bits],
                            &config,
                        );
                    } else if self.signals.endianness_recvd || self.signals.endianness_send {
                        let big = self
                            .pending_endianness
                            .unwrap_or(self.config.big_endian);
                        let config = self.config;
                        self.wr.begin(
                            SendOp::SetEndianness,
                            MsgHeader::negotiation(MsgType::SetEndianness, 1),
                            &[big as u8],
                            &config,
                        );
                    }
                }

                SendOp::Reset => {
                    if self.wr.is_complete() {
                        if self.signals.rst_recvd {
                            // The remote initiated and we just sent the reply
                            self.signals.rst_recvd = false;
                            self.wr.reset_idle();
                            self.io.reset(Direction::Write, Discard::All);
                            self.io.reset(Direction::Read, Discard::All);
                            self.release_parked_recv();
                            logging::debug!(self.log, "reset handshake complete";
                                            "context" => "write_continue",
                                            "initiator" => false);
                        } else if !self.signals.rst_send {
                            // We initiated; the receive machine saw the reply
                            self.wr.reset_idle();
                        }
                        // Otherwise the reply is still on its way
                    }
                }

                SendOp::Msg => {
                    if self.signals.rst_send || self.signals.rst_recvd {
                        // A reset preempts the message; whatever partial bytes
                        // are on the wire get flushed by the handshake
                        logging::debug!(self.log, "message aborted by reset";
                                        "context" => "write_continue",
                                        "bytes_complete" => self.wr.bytes_complete);
                        self.wr.reset_idle();
                    } else if self.wr.is_complete() {
                        self.io.reset(Direction::Write, Discard::All);
                        self.wr.reset_idle();
                    } else if self.wr.bytes_complete == HEADER_SIZE + self.wr.hdr.size as usize
                        && self.wr.crc_len > 0
                        && !self.wr.crc_ready
                    {
                        // Header and payload are out; switch to the checksum
                        self.io.reset(Direction::Write, Discard::All);
                        let digest = self.crc.digest(&self.wr.payload, self.config.crc_bits);
                        encode_digest(
                            digest,
                            self.config.crc_bits,
                            self.config.big_endian,
                            &mut self.wr.crc_bytes,
                        );
                        self.wr.crc_ready = true;
                    }
                }

                SendOp::SetCrc => {
                    if self.wr.is_complete() {
                        if self.signals.crc_recvd {
                            // Reply sent; the peer's width becomes ours
                            self.signals.crc_recvd = false;
                            if let Some(bits) = self.pending_crc_bits.take() {
                                self.config.crc_bits = bits;
                            }
                            self.io.reset(Direction::Write, Discard::All);
                            self.wr.reset_idle();
                            self.release_parked_recv();
                            logging::debug!(self.log, "crc width applied";
                                            "context" => "write_continue",
                                            "crc_bits" => self.config.crc_bits);
                        } else if !self.signals.crc_send {
                            self.wr.reset_idle();
                        }
                    }
                }

                SendOp::SetEndianness => {
                    if self.wr.is_complete() {
                        if self.signals.endianness_recvd {
                            self.signals.endianness_recvd = false;
                            if let Some(big) = self.pending_endianness.take() {
                                self.config.big_endian = big;
                            }
                            self.io.reset(Direction::Write, Discard::All);
                            self.wr.reset_idle();
                            self.release_parked_recv();
                            logging::debug!(self.log, "endianness applied";
                                            "context" => "write_continue",
                                            "big_endian" => self.config.big_endian);
                        } else if !self.signals.endianness_send {
                            self.wr.reset_idle();
                        }
                    }
                }

                SendOp::Disconnect => {
                    if self.wr.is_complete() {
                        if self.signals.disc_recvd {
                            self.signals.disc_recvd = false;
                            self.wr.reset_idle();
                            self.io.reset(Direction::Write, Discard::All);
                            self.io.reset(Direction::Read, Discard::All);
                            self.release_parked_recv();
                            self.shutdown = true;
                            logging::debug!(self.log, "disconnected";
                                            "context" => "write_continue",
                                            "initiator" => false);
                            return Status::Done;
                        } else if !self.signals.disc_send {
                            self.wr.reset_idle();
                        }
                    }
                }
            }

            // At most one write per turn: header bytes first, then the
            // payload, then the checksum tail.
            if self.wr.op != SendOp::None && self.wr.total_bytes > 0 {
                let done = self.wr.bytes_complete;
                let payload_end = HEADER_SIZE + self.wr.hdr.size as usize;

                if done < HEADER_SIZE {
                    bytes = self.io.write(&self.wr.hdr_bytes, done, HEADER_SIZE - done);
                } else if done < payload_end {
                    bytes = self
                        .io
                        .write(&self.wr.payload, done - HEADER_SIZE, payload_end - done);
                } else if self.wr.crc_ready && done < self.wr.total_bytes {
                    bytes = self.io.write(
                        &self.wr.crc_bytes[..self.wr.crc_len],
                        done - payload_end,
                        self.wr.total_bytes - done,
                    );
                }

                self.wr.bytes_complete += bytes;
            }

            if self.wr.op == starting && bytes == 0 {
                break;
            }
        }

        if self.wr.op == SendOp::None {
            Status::Done
        } else {
            Status::Inflight
        }
    }

    /// Advance the receive machine. Loops while the state changes or the
    /// transport delivers bytes.
    pub fn read_continue(&mut self) -> Status {
        if self.shutdown {
            return Status::BadState;
        }

        loop {
            let starting = self.rd.op;
            let mut bytes = 0;

            // A locally initiated reset cancels any in-flight message read
            // before further stream bytes are consumed as payload.
            if self.signals.rst_send
                && matches!(self.rd.op, RecvOp::WaitMsg | RecvOp::WaitDispatch)
            {
                logging::debug!(self.log, "read cancelled by reset";
                                "context" => "read_continue",
                                "bytes_complete" => self.rd.bytes_complete);
                self.io.reset(Direction::Read, Discard::All);
                self.rd.reset_idle();
            }

            // At most one read per turn: the header region first, then the
            // payload (and checksum tail) region.
            if self.rd.bytes_complete < HEADER_SIZE {
                bytes = self.io.read(
                    &mut self.rd.hdr_bytes,
                    self.rd.bytes_complete,
                    HEADER_SIZE - self.rd.bytes_complete,
                );
            } else if self.rd.bytes_complete < self.rd.total_bytes {
                let offset = self.rd.bytes_complete - HEADER_SIZE;
                let max = self.rd.total_bytes - self.rd.bytes_complete;
                bytes = self.io.read(&mut self.rd.payload, offset, max);
            }
            self.rd.bytes_complete += bytes;

            match self.rd.op {
                RecvOp::None => {
                    if self.rd.bytes_complete >= HEADER_SIZE {
                        match MsgHeader::decode(&self.rd.hdr_bytes, self.config.big_endian) {
                            Ok(hdr) => self.identify_header(hdr),
                            Err(_) => {
                                // Unknown message type: drop the header bytes
                                // and resynchronize on the next frame
                                logging::debug!(self.log, "dropping unknown message type";
                                                "context" => "read_continue",
                                                "raw_type" => self.rd.hdr_bytes[2]);
                                self.io.reset(Direction::Read, Discard::Bytes(HEADER_SIZE));
                                self.rd.reset_idle();
                            }
                        }
                    }
                }

                RecvOp::WaitReset => {
                    if self.rd.bytes_complete >= HEADER_SIZE {
                        let valid = MsgHeader::decode(&self.rd.hdr_bytes, self.config.big_endian)
                            .map(|hdr| hdr.is_reset_frame())
                            .unwrap_or(false);

                        if valid {
                            if self.signals.rst_send {
                                // Simultaneous initiation: treat the frame as
                                // the acknowledgement and finish on the spot
                                self.signals.rst_send = false;
                                self.signals.rst_recvd = false;
                                self.io.reset(Direction::Write, Discard::All);
                                self.io.reset(Direction::Read, Discard::All);
                                self.rd.reset_idle();
                                self.release_parked_send();
                            } else if self.signals.rst_recvd {
                                // Parked until the send machine has replied
                            } else {
                                self.rd.reset_idle();
                            }
                        } else {
                            // Not the expected reset frame; drop and retry
                            self.io.reset(Direction::Read, Discard::Bytes(HEADER_SIZE));
                            self.rd.bytes_complete = 0;
                        }
                    }
                }

                RecvOp::WaitMsg => {
                    if self.rd.bytes_complete == self.rd.total_bytes {
                        let size = self.rd.hdr.size as usize;
                        let crc_len = self.config.crc_len();

                        if crc_len > 0 {
                            let digest =
                                self.crc.digest(&self.rd.payload[..size], self.config.crc_bits);
                            let mut expected = [0u8; MAX_CRC_BYTES];
                            encode_digest(
                                digest,
                                self.config.crc_bits,
                                self.config.big_endian,
                                &mut expected,
                            );

                            if expected[..crc_len] == self.rd.payload[size..size + crc_len] {
                                self.rd.op = RecvOp::WaitDispatch;
                            } else {
                                logging::debug!(self.log, "checksum mismatch, message dropped";
                                                "context" => "read_continue",
                                                "size" => size);
                                self.io.reset(Direction::Read, Discard::All);
                                self.rd.reset_idle();
                            }
                        } else {
                            self.rd.op = RecvOp::WaitDispatch;
                        }
                    }
                }

                RecvOp::WaitDispatch => {
                    let hdr = self.rd.hdr;
                    let size = hdr.size as usize;

                    if self.dispatcher.dispatch(&hdr, &self.rd.payload[..size]) {
                        self.io.reset(Direction::Read, Discard::All);
                        self.rd.reset_idle();
                        return Status::Done;
                    }

                    // Backpressure: keep the payload and retry next turn
                    logging::trace!(self.log, "dispatch deferred";
                                    "context" => "read_continue",
                                    "size" => size);
                }

                RecvOp::WaitCrc => {
                    if self.rd.bytes_complete == self.rd.total_bytes {
                        self.finish_crc_exchange();
                    }
                }

                RecvOp::WaitEndianness => {
                    if self.rd.bytes_complete == self.rd.total_bytes {
                        self.finish_endianness_exchange();
                    }
                }

                RecvOp::WaitDisconnect => {
                    if self.rd.bytes_complete >= HEADER_SIZE {
                        let valid = MsgHeader::decode(&self.rd.hdr_bytes, self.config.big_endian)
                            .map(|hdr| hdr.is_disconnect_frame())
                            .unwrap_or(false);

                        if valid {
                            if self.signals.disc_send {
                                self.signals.disc_send = false;
                                self.signals.disc_recvd = false;
                                self.io.reset(Direction::Write, Discard::All);
                                self.io.reset(Direction::Read, Discard::All);
                                self.rd.reset_idle();
                                self.release_parked_send();
                                self.shutdown = true;
                                logging::debug!(self.log, "disconnected";
                                                "context" => "read_continue",
                                                "initiator" => true);
                                return Status::Done;
                            } else if self.signals.disc_recvd {
                                // Parked until the send machine has replied
                            } else {
                                self.rd.reset_idle();
                            }
                        } else {
                            self.io.reset(Direction::Read, Discard::Bytes(HEADER_SIZE));
                            self.rd.bytes_complete = 0;
                        }
                    }
                }
            }

            if self.rd.op == starting && bytes == 0 {
                break;
            }
        }

        if self.rd.op == RecvOp::None {
            Status::Done
        } else {
            Status::Inflight
        }
    }

    /// Classify a freshly decoded header and move the receive machine to the
    /// matching wait state.
    fn identify_header(&mut self, hdr: MsgHeader) {
        self.rd.hdr = hdr;

        logging::trace!(self.log, "header identified";
                        "context" => "read_continue",
                        "kind" => ?hdr.kind,
                        "size" => hdr.size,
                        "to" => hdr.to,
                        "from" => hdr.from);

        match hdr.kind {
            MsgType::Reset => {
                if self.signals.rst_send {
                    // We initiated and this is the acknowledgement
                    self.signals.rst_send = false;
                    self.signals.rst_recvd = false;
                    self.io.reset(Direction::Write, Discard::All);
                    self.io.reset(Direction::Read, Discard::All);
                    self.rd.reset_idle();
                    self.release_parked_send();
                    logging::debug!(self.log, "reset handshake complete";
                                    "context" => "read_continue",
                                    "initiator" => true);
                } else {
                    self.signals.rst_recvd = true;
                    self.rd.op = RecvOp::WaitReset;
                }
            }
            MsgType::Data => {
                self.rd.op = RecvOp::WaitMsg;
                self.rd.total_bytes = HEADER_SIZE + hdr.size as usize + self.config.crc_len();
                self.rd
                    .payload
                    .resize(hdr.size as usize + self.config.crc_len(), 0);
            }
            MsgType::SetCrc => {
                self.rd.op = RecvOp::WaitCrc;
                self.rd.total_bytes = HEADER_SIZE + hdr.size as usize;
                self.rd.payload.resize(hdr.size as usize, 0);
            }
            MsgType::SetEndianness => {
                self.rd.op = RecvOp::WaitEndianness;
                self.rd.total_bytes = HEADER_SIZE + hdr.size as usize;
                self.rd.payload.resize(hdr.size as usize, 0);
            }
            MsgType::Disconnect => {
                if self.signals.disc_send {
                    self.signals.disc_send = false;
                    self.signals.disc_recvd = false;
                    self.io.reset(Direction::Write, Discard::All);
                    self.io.reset(Direction::Read, Discard::All);
                    self.rd.reset_idle();
                    self.release_parked_send();
                    self.shutdown = true;
                    logging::debug!(self.log, "disconnected";
                                    "context" => "read_continue",
                                    "initiator" => true);
                } else {
                    self.signals.disc_recvd = true;
                    self.rd.op = RecvOp::WaitDisconnect;
                }
            }
        }
    }

    /// A complete SET_CRC frame is in: either the peer's acknowledgement of
    /// our request, or a fresh request we have to acknowledge.
    fn finish_crc_exchange(&mut self) {
        let value = self.rd.payload.first().copied();

        match value {
            Some(bits) if matches!(bits, 0 | 8 | 16 | 32) => {
                if self.signals.crc_send {
                    self.signals.crc_send = false;
                    if let Some(pending) = self.pending_crc_bits.take() {
                        self.config.crc_bits = pending;
                    }
                    self.io.reset(Direction::Read, Discard::All);
                    self.rd.reset_idle();
                    self.release_parked_send();
                    logging::debug!(self.log, "crc width applied";
                                    "context" => "read_continue",
                                    "crc_bits" => self.config.crc_bits);
                } else if self.signals.crc_recvd {
                    // Parked until the send machine has echoed the frame
                } else {
                    self.pending_crc_bits = Some(bits);
                    self.signals.crc_recvd = true;
                }
            }
            _ => {
                // Bad width: drop the frame without acknowledging it
                logging::debug!(self.log, "rejecting crc negotiation";
                                "context" => "read_continue",
                                "value" => ?value);
                self.io
                    .reset(Direction::Read, Discard::Bytes(self.rd.total_bytes));
                self.rd.reset_idle();
            }
        }
    }

    fn finish_endianness_exchange(&mut self) {
        let value = self.rd.payload.first().copied();

        match value {
            Some(flag) if flag <= 1 => {
                if self.signals.endianness_send {
                    self.signals.endianness_send = false;
                    if let Some(pending) = self.pending_endianness.take() {
                        self.config.big_endian = pending;
                    }
                    self.io.reset(Direction::Read, Discard::All);
                    self.rd.reset_idle();
                    self.release_parked_send();
                    logging::debug!(self.log, "endianness applied";
                                    "context" => "read_continue",
                                    "big_endian" => self.config.big_endian);
                } else if self.signals.endianness_recvd {
                    // Parked until the send machine has echoed the frame
                } else {
                    self.pending_endianness = Some(flag == 1);
                    self.signals.endianness_recvd = true;
                }
            }
            _ => {
                logging::debug!(self.log, "rejecting endianness negotiation";
                                "context" => "read_continue",
                                "value" => ?value);
                self.io
                    .reset(Direction::Read, Discard::Bytes(self.rd.total_bytes));
                self.rd.reset_idle();
            }
        }
    }

    /// The handshake this side is completing also returns the parked receive
    /// machine to idle, so both directions come out of the exchange together.
    fn release_parked_recv(&mut self) {
        match self.rd.op {
            RecvOp::WaitReset
            | RecvOp::WaitCrc
            | RecvOp::WaitEndianness
            | RecvOp::WaitDisconnect => self.rd.reset_idle(),
            _ => (),
        }
    }

    /// Counterpart of `release_parked_recv` for the initiator: the receive
    /// machine that recognised the acknowledgement frees the send machine
    /// waiting on its fully transmitted frame.
    fn release_parked_send(&mut self) {
        if self.wr.op != SendOp::None && self.wr.is_complete() {
            self.wr.reset_idle();
        }
    }
}
