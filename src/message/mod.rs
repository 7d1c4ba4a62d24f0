//! CCID wire message definitions and codec
//!
//! Every bulk message exchanged with the host carries the same fixed 10-byte
//! header (message type, little-endian payload length, slot, sequence number
//! and three message-specific bytes) followed by `length` payload bytes.
//! This module owns that layout: [`CommandMessage`] decodes host commands,
//! [`ResponseMessage`] builds and encodes the replies, and
//! [`NotifySlotChange`] covers the interrupt-endpoint notification.
//!
//! Message type and error code values follow the USB CCID rev 1.1 / ICCD
//! rev 1.0 class specifications.

mod command;
mod response;

pub use command::CommandMessage;
pub use response::{NotifySlotChange, ResponseMessage, SlotChange};

/// Length of the fixed bulk message header.
pub const HEADER_LEN: usize = 10;

/// Default ceiling for one whole bulk message (header included).
///
/// This is the `dwMaxCCIDMessageLength` a reader supporting extended APDUs
/// advertises: a 65544-byte data block plus the header. The actual ceiling is
/// negotiated by the transport and configured per reader, not hardcoded into
/// the codec.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 65554;

/// Bulk-OUT message types (host to reader).
pub mod request {
    #![allow(missing_docs)]
    pub const SET_PARAMETERS: u8 = 0x61;
    pub const POWER_ON: u8 = 0x62;
    pub const POWER_OFF: u8 = 0x63;
    pub const GET_SLOT_STATUS: u8 = 0x65;
    pub const SECURE: u8 = 0x69;
    pub const T0_APDU: u8 = 0x6a;
    pub const ESCAPE: u8 = 0x6b;
    pub const GET_PARAMETERS: u8 = 0x6c;
    pub const RESET_PARAMETERS: u8 = 0x6d;
    pub const ICC_CLOCK: u8 = 0x6e;
    pub const XFR_BLOCK: u8 = 0x6f;
    pub const MECHANICAL: u8 = 0x71;
    pub const ABORT: u8 = 0x72;
    pub const SET_RATE_AND_CLOCK: u8 = 0x73;
}

/// Bulk-IN message types (reader to host).
pub mod reply {
    #![allow(missing_docs)]
    pub const DATA_BLOCK: u8 = 0x80;
    pub const SLOT_STATUS: u8 = 0x81;
    pub const PARAMETERS: u8 = 0x82;
    pub const ESCAPE_RESPONSE: u8 = 0x83;
    pub const RATE_AND_CLOCK: u8 = 0x84;
}

/// Interrupt-IN message types (asynchronous reader to host).
pub mod notify {
    #![allow(missing_docs)]
    pub const SLOT_CHANGE: u8 = 0x50;
    pub const HARDWARE_ERROR: u8 = 0x51;
}

/// `bError` values carried in failed responses.
pub mod error_code {
    #![allow(missing_docs)]
    pub const CMD_ABORTED: u8 = 0xff;
    pub const ICC_MUTE: u8 = 0xfe;
    pub const HW_ERROR: u8 = 0xfb;
    pub const CMD_SLOT_BUSY: u8 = 0xe0;
    pub const CMD_NOT_SUPPORTED: u8 = 0x00;
    pub const BAD_LENGTH: u8 = 0x01;
    pub const SLOT_DOES_NOT_EXIST: u8 = 0x05;
    pub const POWERSELECT_NOT_SUPPORTED: u8 = 0x07;
    pub const PROTOCOLNUM_NOT_SUPPORTED: u8 = 0x07;
    pub const BAD_WLEVEL: u8 = 0x08;
}

/// `bClockStatus` value for a running clock, reported on every slot-status
/// style response (the engine has no stoppable clock).
pub const CLOCK_STATUS_RUNNING: u8 = 0x00;

/// Decoded `bMessageType` of a host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// PC_to_RDR_IccPowerOn
    PowerOn,
    /// PC_to_RDR_IccPowerOff
    PowerOff,
    /// PC_to_RDR_GetSlotStatus
    GetSlotStatus,
    /// PC_to_RDR_XfrBlock
    XfrBlock,
    /// PC_to_RDR_GetParameters
    GetParameters,
    /// PC_to_RDR_ResetParameters
    ResetParameters,
    /// PC_to_RDR_SetParameters
    SetParameters,
    /// PC_to_RDR_Escape
    Escape,
    /// PC_to_RDR_IccClock
    IccClock,
    /// PC_to_RDR_T0APDU
    T0Apdu,
    /// PC_to_RDR_Secure
    Secure,
    /// PC_to_RDR_Mechanical
    Mechanical,
    /// PC_to_RDR_Abort
    Abort,
    /// PC_to_RDR_SetDataRateAndClockFrequency
    SetRateAndClock,
}

impl CommandKind {
    /// Map a raw `bMessageType` byte to a known command.
    pub const fn from_message_type(value: u8) -> Option<Self> {
        Some(match value {
            request::SET_PARAMETERS => Self::SetParameters,
            request::POWER_ON => Self::PowerOn,
            request::POWER_OFF => Self::PowerOff,
            request::GET_SLOT_STATUS => Self::GetSlotStatus,
            request::SECURE => Self::Secure,
            request::T0_APDU => Self::T0Apdu,
            request::ESCAPE => Self::Escape,
            request::GET_PARAMETERS => Self::GetParameters,
            request::RESET_PARAMETERS => Self::ResetParameters,
            request::ICC_CLOCK => Self::IccClock,
            request::XFR_BLOCK => Self::XfrBlock,
            request::MECHANICAL => Self::Mechanical,
            request::ABORT => Self::Abort,
            request::SET_RATE_AND_CLOCK => Self::SetRateAndClock,
            _ => return None,
        })
    }

    /// The bulk-IN message type answering this command.
    pub const fn reply_type(self) -> u8 {
        match self {
            Self::PowerOn | Self::XfrBlock | Self::Secure => reply::DATA_BLOCK,
            Self::GetParameters | Self::ResetParameters | Self::SetParameters => reply::PARAMETERS,
            Self::Escape => reply::ESCAPE_RESPONSE,
            Self::SetRateAndClock => reply::RATE_AND_CLOCK,
            Self::PowerOff
            | Self::GetSlotStatus
            | Self::IccClock
            | Self::T0Apdu
            | Self::Mechanical
            | Self::Abort => reply::SLOT_STATUS,
        }
    }
}

/// `bmICCStatus` reported in the first status byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IccStatus {
    /// A card is present and powered.
    Active = 0,
    /// A card is present but not powered.
    Inactive = 1,
    /// No card in the slot.
    NotPresent = 2,
}

/// `bmCommandStatus` reported in the upper bits of the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    /// Command processed without error.
    Ok = 0,
    /// Command failed, `bError` holds the reason.
    Failed = 1,
    /// Time extension requested.
    TimeExtension = 2,
}

/// APDU chaining indicator.
///
/// Appears as `wLevelParameter` on XfrBlock commands and `bChainParameter`
/// on data block responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Chain {
    /// The whole APDU (or response) fits in this block.
    BeginsAndEnds = 0,
    /// First block of a chain.
    Begins = 1,
    /// Last block of a chain.
    Ends = 2,
    /// Intermediate block of a chain.
    Continues = 3,
    /// Empty block; the host should ask for more response data.
    ExpectingMore = 0x10,
}

impl Chain {
    /// Map an XfrBlock `wLevelParameter` to a chaining indicator.
    pub const fn from_level_parameter(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::BeginsAndEnds,
            1 => Self::Begins,
            2 => Self::Ends,
            3 => Self::Continues,
            0x10 => Self::ExpectingMore,
            _ => return None,
        })
    }

    /// Whether this block opens an APDU (clearing any stale chain buffer).
    pub const fn starts_transfer(self) -> bool {
        matches!(self, Self::BeginsAndEnds | Self::Begins)
    }

    /// Whether this block completes an APDU, ready to run against the card.
    pub const fn ends_transfer(self) -> bool {
        matches!(self, Self::BeginsAndEnds | Self::Ends)
    }

    /// Chaining indicator for one chunk of a (possibly split) response.
    pub const fn for_chunk(first: bool, last: bool) -> Self {
        match (first, last) {
            (true, true) => Self::BeginsAndEnds,
            (true, false) => Self::Begins,
            (false, true) => Self::Ends,
            (false, false) => Self::Continues,
        }
    }
}

/// Errors produced while decoding a raw bulk message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header were supplied.
    #[error("malformed header: got {actual} bytes, need {HEADER_LEN}")]
    MalformedHeader {
        /// Number of bytes actually available.
        actual: usize,
    },

    /// The `dwLength` field disagrees with the bytes actually supplied.
    #[error("length mismatch: header declares {declared} payload bytes, got {actual}")]
    LengthMismatch {
        /// Payload length declared in the header.
        declared: usize,
        /// Payload bytes actually supplied.
        actual: usize,
    },

    /// The declared payload exceeds the configured transfer ceiling.
    #[error("payload too large: {declared} bytes, transport ceiling {max}")]
    PayloadTooLarge {
        /// Payload length declared in the header.
        declared: usize,
        /// Largest payload the transport agreed to carry.
        max: usize,
    },
}
