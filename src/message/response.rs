//! Building and encoding of reader bulk-IN responses

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    notify, Chain, CommandStatus, DecodeError, IccStatus, CLOCK_STATUS_RUNNING, HEADER_LEN,
};

/// One reader response, ready to be encoded onto the bulk-IN endpoint.
///
/// All response families share the header layout; only the meaning of the
/// last header byte differs (`bChainParameter` for data blocks,
/// `bClockStatus` for slot status, `bProtocolNum` for parameters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    /// Bulk-IN `bMessageType`.
    pub message_type: u8,
    /// `bSlot`, echoing the command.
    pub slot: u8,
    /// `bSeq`, always equal to the triggering command's sequence number.
    pub seq: u8,
    /// Card presence/power reported to the host.
    pub icc_status: IccStatus,
    /// Whether the command succeeded.
    pub command_status: CommandStatus,
    /// `bError`, meaningful when `command_status` is `Failed`.
    pub error: u8,
    /// Message-specific last header byte.
    pub param: u8,
    /// Response payload.
    pub payload: Bytes,
}

impl ResponseMessage {
    /// A successful RDR_to_PC_DataBlock carrying `payload`.
    pub fn data_block(slot: u8, seq: u8, icc_status: IccStatus, chain: Chain, payload: Bytes) -> Self {
        Self {
            message_type: super::reply::DATA_BLOCK,
            slot,
            seq,
            icc_status,
            command_status: CommandStatus::Ok,
            error: 0,
            param: chain as u8,
            payload,
        }
    }

    /// A successful RDR_to_PC_SlotStatus.
    pub fn slot_status(slot: u8, seq: u8, icc_status: IccStatus) -> Self {
        Self {
            message_type: super::reply::SLOT_STATUS,
            slot,
            seq,
            icc_status,
            command_status: CommandStatus::Ok,
            error: 0,
            param: CLOCK_STATUS_RUNNING,
            payload: Bytes::new(),
        }
    }

    /// A successful RDR_to_PC_Parameters for protocol `protocol_num`.
    pub fn parameters(
        slot: u8,
        seq: u8,
        icc_status: IccStatus,
        protocol_num: u8,
        protocol_data: Bytes,
    ) -> Self {
        Self {
            message_type: super::reply::PARAMETERS,
            slot,
            seq,
            icc_status,
            command_status: CommandStatus::Ok,
            error: 0,
            param: protocol_num,
            payload: protocol_data,
        }
    }

    /// A failed response of the given reply family carrying `error`.
    pub fn failure(message_type: u8, slot: u8, seq: u8, icc_status: IccStatus, error: u8) -> Self {
        Self {
            message_type,
            slot,
            seq,
            icc_status,
            command_status: CommandStatus::Failed,
            error,
            param: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode to raw bytes, header first.
    ///
    /// Encoding is a pure transform and never fails for a response built
    /// through this type; payload bounds are the dispatcher's business (it
    /// splits oversized card output into chained blocks before ever building
    /// a response).
    pub fn encode(&self) -> Bytes {
        let mut raw = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        raw.put_u8(self.message_type);
        raw.put_u32_le(self.payload.len() as u32);
        raw.put_u8(self.slot);
        raw.put_u8(self.seq);
        raw.put_u8(self.icc_status as u8 | ((self.command_status as u8) << 6));
        raw.put_u8(self.error);
        raw.put_u8(self.param);
        raw.put_slice(&self.payload);
        raw.freeze()
    }

    /// Decode an encoded response.
    ///
    /// The engine never receives responses; this exists for loopback tests
    /// and host-side tooling that wants to check reader output.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::MalformedHeader { actual: raw.len() });
        }
        let declared = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        let actual = raw.len() - HEADER_LEN;
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }
        let status = raw[7];
        let icc_status = match status & 0x03 {
            0 => IccStatus::Active,
            1 => IccStatus::Inactive,
            _ => IccStatus::NotPresent,
        };
        let command_status = match status >> 6 {
            0 => CommandStatus::Ok,
            2 => CommandStatus::TimeExtension,
            _ => CommandStatus::Failed,
        };
        Ok(Self {
            message_type: raw[0],
            slot: raw[5],
            seq: raw[6],
            icc_status,
            command_status,
            error: raw[8],
            param: raw[9],
            payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
        })
    }

    /// Whether this response reports success.
    pub fn is_ok(&self) -> bool {
        self.command_status == CommandStatus::Ok
    }
}

/// Per-slot state reported in an interrupt notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    /// A card is present in the slot.
    pub present: bool,
    /// Presence changed since the last notification.
    pub changed: bool,
}

/// RDR_to_PC_NotifySlotChange interrupt message.
///
/// Each slot occupies two bits in the trailing bitmap (`present` then
/// `changed`), four slots to a byte, in slot-index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySlotChange {
    states: Vec<SlotChange>,
}

impl NotifySlotChange {
    /// Build a notification covering every slot, in index order.
    pub fn new(states: Vec<SlotChange>) -> Self {
        Self { states }
    }

    /// Encode to raw bytes for the interrupt endpoint.
    pub fn encode(&self) -> Bytes {
        let bitmap_len = self.states.len().div_ceil(4);
        let mut raw = BytesMut::with_capacity(1 + bitmap_len);
        raw.put_u8(notify::SLOT_CHANGE);
        raw.resize(1 + bitmap_len, 0);
        for (index, state) in self.states.iter().enumerate() {
            let bit = (index % 4) * 2;
            if state.present {
                raw[1 + index / 4] |= 1 << bit;
            }
            if state.changed {
                raw[1 + index / 4] |= 1 << (bit + 1);
            }
        }
        raw.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_block_layout() {
        let response = ResponseMessage::data_block(
            0,
            0x11,
            IccStatus::Active,
            Chain::BeginsAndEnds,
            Bytes::from_static(&[0x3b, 0x00]),
        );
        let raw = response.encode();
        assert_eq!(
            raw.as_ref(),
            &[0x80, 0x02, 0x00, 0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x3b, 0x00]
        );
    }

    #[test]
    fn failure_packs_status_and_error() {
        let response = ResponseMessage::failure(
            super::super::reply::SLOT_STATUS,
            2,
            9,
            IccStatus::NotPresent,
            super::super::error_code::ICC_MUTE,
        );
        let raw = response.encode();
        // bmICCStatus = 2 (not present), bmCommandStatus = 1 (failed)
        assert_eq!(raw[7], 0x42);
        assert_eq!(raw[8], 0xfe);
    }

    #[test]
    fn encode_decode_round_trip_is_byte_identical() {
        let response = ResponseMessage::data_block(
            1,
            0x5a,
            IccStatus::Active,
            Chain::Ends,
            Bytes::from_static(&[0x90, 0x00]),
        );
        let raw = response.encode();
        let decoded = ResponseMessage::decode(&raw).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn notify_bitmap_packs_two_bits_per_slot() {
        let notification = NotifySlotChange::new(vec![
            SlotChange {
                present: true,
                changed: true,
            },
            SlotChange {
                present: false,
                changed: true,
            },
            SlotChange {
                present: true,
                changed: false,
            },
        ]);
        let raw = notification.encode();
        assert_eq!(raw.as_ref(), &[0x50, 0b0001_1011]);
    }

    #[test]
    fn notify_bitmap_spills_into_second_byte() {
        let mut states = vec![
            SlotChange {
                present: false,
                changed: false,
            };
            5
        ];
        states[4].present = true;
        let raw = NotifySlotChange::new(states).encode();
        assert_eq!(raw.as_ref(), &[0x50, 0x00, 0x01]);
    }
}
