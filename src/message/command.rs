//! Decoding of host bulk-OUT commands

use bytes::Bytes;

use super::{Chain, CommandKind, DecodeError, HEADER_LEN};

/// One decoded host command.
///
/// The header is parsed eagerly; the three message-specific bytes are kept
/// raw and interpreted per command (`bPowerSelect`, `wLevelParameter`, ...)
/// through the accessor methods. The raw `bMessageType` is retained even for
/// unknown commands so the dispatcher can still address a well-formed
/// `CMD_NOT_SUPPORTED` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    /// Raw `bMessageType` byte.
    pub message_type: u8,
    /// `bSlot`, not yet validated against the slot table.
    pub slot: u8,
    /// `bSeq`, echoed verbatim in the response.
    pub seq: u8,
    /// The three message-specific parameter bytes.
    pub params: [u8; 3],
    /// Command payload (`dwLength` bytes).
    pub payload: Bytes,
}

impl CommandMessage {
    /// Decode one complete bulk message.
    ///
    /// `max_message_len` is the transport-negotiated ceiling for a whole
    /// message including the header; a `dwLength` pointing past it is
    /// rejected before any payload is touched.
    pub fn decode(raw: &[u8], max_message_len: usize) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::MalformedHeader { actual: raw.len() });
        }
        let declared = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        let max_payload = max_message_len.saturating_sub(HEADER_LEN);
        if declared > max_payload {
            return Err(DecodeError::PayloadTooLarge {
                declared,
                max: max_payload,
            });
        }
        let actual = raw.len() - HEADER_LEN;
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            message_type: raw[0],
            slot: raw[5],
            seq: raw[6],
            params: [raw[7], raw[8], raw[9]],
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
        })
    }

    /// The recognized command, if `bMessageType` is in the CCID table.
    pub const fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_message_type(self.message_type)
    }

    /// `bPowerSelect` of a PowerOn command.
    pub const fn power_select(&self) -> u8 {
        self.params[0]
    }

    /// `bProtocolNum` of a SetParameters command.
    pub const fn protocol_num(&self) -> u8 {
        self.params[0]
    }

    /// `wLevelParameter` of an XfrBlock command, as a chaining indicator.
    pub const fn chain(&self) -> Option<Chain> {
        Chain::from_level_parameter(u16::from_le_bytes([self.params[1], self.params[2]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEFAULT_MAX_MESSAGE_LEN;

    fn frame(message_type: u8, slot: u8, seq: u8, params: [u8; 3], payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![message_type];
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.push(slot);
        raw.push(seq);
        raw.extend_from_slice(&params);
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn decodes_xfr_block() {
        let raw = frame(0x6f, 1, 0x42, [0x00, 0x00, 0x00], &[0x00, 0xa4, 0x04, 0x00]);
        let message = CommandMessage::decode(&raw, DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(message.kind(), Some(CommandKind::XfrBlock));
        assert_eq!(message.slot, 1);
        assert_eq!(message.seq, 0x42);
        assert_eq!(message.chain(), Some(Chain::BeginsAndEnds));
        assert_eq!(message.payload.as_ref(), &[0x00, 0xa4, 0x04, 0x00]);
    }

    #[test]
    fn short_header_is_malformed() {
        let err = CommandMessage::decode(&[0x62, 0, 0], DEFAULT_MAX_MESSAGE_LEN).unwrap_err();
        assert_eq!(err, DecodeError::MalformedHeader { actual: 3 });
    }

    #[test]
    fn declared_length_must_match_supplied_bytes() {
        let mut raw = frame(0x6f, 0, 0, [0; 3], &[0x01, 0x02]);
        raw[1] = 5; // declare 5 payload bytes, supply 2
        let err = CommandMessage::decode(&raw, DEFAULT_MAX_MESSAGE_LEN).unwrap_err();
        assert_eq!(
            err,
            DecodeError::LengthMismatch {
                declared: 5,
                actual: 2
            }
        );
    }

    #[test]
    fn declared_length_above_ceiling_is_rejected() {
        let mut raw = frame(0x6f, 0, 0, [0; 3], &[]);
        raw[1..5].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = CommandMessage::decode(&raw, DEFAULT_MAX_MESSAGE_LEN).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadTooLarge { .. }));
    }

    #[test]
    fn unknown_message_type_still_decodes() {
        let raw = frame(0x42, 0, 7, [0; 3], &[]);
        let message = CommandMessage::decode(&raw, DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(message.kind(), None);
        assert_eq!(message.seq, 7);
    }

    #[test]
    fn level_parameter_is_little_endian() {
        let raw = frame(0x6f, 0, 0, [0x00, 0x10, 0x00], &[]);
        let message = CommandMessage::decode(&raw, DEFAULT_MAX_MESSAGE_LEN).unwrap();
        assert_eq!(message.chain(), Some(Chain::ExpectingMore));
    }
}
