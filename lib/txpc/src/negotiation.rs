//! Negotiation sub-protocol handling for the router. Messages addressed
//! `to = from = 0` configure the link itself and are consumed here instead
//! of being switched; keeping the logic out of the router proper stops the
//! switching fabric from growing protocol knowledge.

use crate::logging;
use crate::router::RouterConfig;
use crate::wire::{MsgHeader, MsgType};

/// Link-level happenings the host may want to react to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NegotiationEvent {
    Reset,
    Disconnect,
    Endianness(bool),
    CrcWidth(u8),
}

pub struct Negotiation {
    log: logging::Logger,
}

impl Negotiation {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Negotiation {
        let neg_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Negotiation { log: neg_log }
    }

    /// Consume one complete negotiation message. Valid settings are applied
    /// to the router configuration; malformed values are logged and ignored.
    pub fn handle(
        &self,
        hdr: &MsgHeader,
        payload: &[u8],
        config: &mut RouterConfig,
    ) -> Option<NegotiationEvent> {
        match hdr.kind {
            MsgType::Reset => {
                if hdr.size != 0 {
                    logging::debug!(self.log, "ignoring reset with payload";
                                    "context" => "negotiation",
                                    "size" => hdr.size);
                    return None;
                }
                Some(NegotiationEvent::Reset)
            }
            MsgType::Disconnect => Some(NegotiationEvent::Disconnect),
            MsgType::SetEndianness => match payload.first() {
                Some(&flag) if flag <= 1 => {
                    config.big_endian = flag == 1;
                    logging::debug!(self.log, "endianness negotiated";
                                    "context" => "negotiation",
                                    "big_endian" => config.big_endian);
                    Some(NegotiationEvent::Endianness(config.big_endian))
                }
                value => {
                    logging::debug!(self.log, "rejecting endianness negotiation";
                                    "context" => "negotiation",
                                    "value" => ?value);
                    None
                }
            },
            MsgType::SetCrc => match payload.first() {
                Some(&bits) if matches!(bits, 0 | 8 | 16 | 32) => {
                    config.crc_bits = bits;
                    logging::debug!(self.log, "crc width negotiated";
                                    "context" => "negotiation",
                                    "crc_bits" => bits);
                    Some(NegotiationEvent::CrcWidth(bits))
                }
                value => {
                    logging::debug!(self.log, "rejecting crc negotiation";
                                    "context" => "negotiation",
                                    "value" => ?value);
                    None
                }
            },
            MsgType::Data => {
                // Opaque data on the reserved channel has nowhere to go
                logging::debug!(self.log, "dropping data on negotiation channel";
                                "context" => "negotiation",
                                "size" => hdr.size);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endianness_applied() {
        let neg = Negotiation::new(None);
        let mut config = RouterConfig::default();

        let hdr = MsgHeader::negotiation(MsgType::SetEndianness, 1);
        let event = neg.handle(&hdr, &[1], &mut config);

        assert_eq!(event, Some(NegotiationEvent::Endianness(true)));
        assert!(config.big_endian);

        let event = neg.handle(&hdr, &[0], &mut config);
        assert_eq!(event, Some(NegotiationEvent::Endianness(false)));
        assert!(!config.big_endian);
    }

    #[test]
    fn test_bad_endianness_ignored() {
        let neg = Negotiation::new(None);
        let mut config = RouterConfig::default();

        let hdr = MsgHeader::negotiation(MsgType::SetEndianness, 1);

        assert_eq!(neg.handle(&hdr, &[7], &mut config), None);
        assert_eq!(neg.handle(&hdr, &[], &mut config), None);
        assert!(!config.big_endian);
    }

    #[test]
    fn test_crc_width_applied() {
        let neg = Negotiation::new(None);
        let mut config = RouterConfig::default();

        let hdr = MsgHeader::negotiation(MsgType::SetCrc, 1);

        assert_eq!(
            neg.handle(&hdr, &[16], &mut config),
            Some(NegotiationEvent::CrcWidth(16))
        );
        assert_eq!(config.crc_bits, 16);

        // Widths outside {0, 8, 16, 32} never stick
        assert_eq!(neg.handle(&hdr, &[12], &mut config), None);
        assert_eq!(config.crc_bits, 16);
    }

    #[test]
    fn test_reset_and_disconnect_surface_events() {
        let neg = Negotiation::new(None);
        let mut config = RouterConfig::default();

        assert_eq!(
            neg.handle(&MsgHeader::reset(), &[], &mut config),
            Some(NegotiationEvent::Reset)
        );
        assert_eq!(
            neg.handle(&MsgHeader::disconnect(), &[], &mut config),
            Some(NegotiationEvent::Disconnect)
        );
    }

    #[test]
    fn test_data_on_reserved_channel_dropped() {
        let neg = Negotiation::new(None);
        let mut config = RouterConfig::default();

        let hdr = MsgHeader::negotiation(MsgType::Data, 3);

        assert_eq!(neg.handle(&hdr, b"abc", &mut config), None);
    }
}
