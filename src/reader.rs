//! Reader assembly: slot table and command dispatcher
//!
//! [`CcidReader`] owns the fixed slot table and turns one raw bulk command
//! into one or more encoded bulk responses. It performs the validation the
//! wire format demands (length fields, power select, chaining level),
//! routes state transitions into the addressed [`Slot`], splits oversized
//! card output into chained data blocks and emits slot-change notifications
//! on the optional interrupt sink.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::message::{
    error_code, reply, Chain, CommandKind, CommandMessage, DecodeError, IccStatus,
    NotifySlotChange, ResponseMessage, DEFAULT_MAX_MESSAGE_LEN, HEADER_LEN,
};
use crate::slot::{Slot, SlotReply};

/// Fixed T=1 parameter block reported by Get/Reset/SetParameters.
///
/// The reader negotiates everything automatically, so these values are
/// descriptive rather than configurable: Fi/Di 0x11, TCCKS 0x11, BWI/CWI
/// 0x55, guard time and IFSC at their T=1 maxima, clock stoppable never.
const T1_PROTOCOL_NUM: u8 = 1;
const T1_PARAMETERS: [u8; 7] = [0x11, 0x11, 0xfe, 0x55, 0x03, 0xfe, 0x00];

/// Construction-time options for a reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Number of card slots, at least one.
    pub slot_count: u8,
    /// Ceiling for one whole bulk message including the header, as
    /// negotiated with the transport (`dwMaxCCIDMessageLength`).
    pub max_message_len: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            slot_count: 1,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

impl ReaderConfig {
    /// Set the slot count.
    pub const fn with_slot_count(mut self, slot_count: u8) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Set the bulk message ceiling.
    pub const fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }
}

struct Shared {
    slots: Vec<Slot>,
    max_message_len: usize,
    /// Largest payload carried by a single response block.
    max_payload: usize,
    /// Interrupt-IN sink for slot-change notifications, shared between the
    /// pump thread and embedder insert/eject calls.
    notify_sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("slots", &self.slots.len())
            .field("max_message_len", &self.max_message_len)
            .finish_non_exhaustive()
    }
}

/// The protocol engine for one CCID reader gadget.
///
/// Cheap to clone; clones share the slot table, so the embedder keeps one
/// handle for insert/eject while the event pump drives another.
#[derive(Debug, Clone)]
pub struct CcidReader {
    shared: Arc<Shared>,
}

/// Embedder-facing handle to one slot.
///
/// Wraps the slot so that insert/eject also raise the slot-change
/// notification on the reader's interrupt sink, the way a physical reader
/// reports card movement.
#[derive(Debug, Clone)]
pub struct SlotHandle {
    slot: Slot,
    shared: Arc<Shared>,
}

impl SlotHandle {
    /// Insert a card and notify the host.
    pub fn insert(&self, card: Box<dyn crate::card::Card>) -> Result<(), Error> {
        self.slot.insert(card)?;
        notify_changes(&self.shared);
        Ok(())
    }

    /// Eject the card, notify the host, and hand the card back.
    pub fn eject(&self) -> Result<Box<dyn crate::card::Card>, Error> {
        let card = self.slot.eject()?;
        notify_changes(&self.shared);
        Ok(card)
    }

    /// Signal an ABORT received on the control pipe for `seq`.
    pub fn request_abort(&self, seq: u8) {
        self.slot.request_abort(seq);
    }

    /// Whether a card is present.
    pub fn is_present(&self) -> bool {
        self.slot.is_present()
    }

    /// Current power state.
    pub fn power_state(&self) -> crate::slot::PowerState {
        self.slot.power_state()
    }
}

impl CcidReader {
    /// Build a reader with `config.slot_count` empty slots.
    pub fn new(config: ReaderConfig) -> Self {
        let slot_count = config.slot_count.max(1);
        let max_message_len = config.max_message_len.max(HEADER_LEN + 1);
        Self {
            shared: Arc::new(Shared {
                slots: (0..slot_count).map(Slot::new).collect(),
                max_message_len,
                max_payload: max_message_len - HEADER_LEN,
                notify_sink: Mutex::new(None),
            }),
        }
    }

    /// Number of slots in the reader.
    pub fn slot_count(&self) -> u8 {
        self.shared.slots.len() as u8
    }

    /// The negotiated ceiling for one whole bulk message.
    pub fn max_message_len(&self) -> usize {
        self.shared.max_message_len
    }

    /// Embedder handle for slot `index`.
    pub fn slot(&self, index: u8) -> Result<SlotHandle, Error> {
        let slot = self
            .shared
            .slots
            .get(usize::from(index))
            .cloned()
            .ok_or(Error::SlotOutOfRange {
                slot: index,
                count: self.slot_count(),
            })?;
        Ok(SlotHandle {
            slot,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Attach the interrupt-IN endpoint used for slot-change notifications
    /// and report the current slot states to the host.
    pub fn set_notify_sink(&self, sink: Box<dyn Write + Send>) {
        *self.shared.notify_sink.lock() = Some(sink);
        notify_changes(&self.shared);
    }

    /// Handle one raw bulk command and return the encoded response frames.
    ///
    /// Always produces at least one well-formed response, malformed input
    /// included; multiple frames occur only when a data block response has
    /// to be chained. Slot-change notifications go out on the interrupt
    /// sink as a side effect.
    pub fn handle(&self, raw: &[u8]) -> Vec<Bytes> {
        let responses = match CommandMessage::decode(raw, self.shared.max_message_len) {
            Ok(command) => self.dispatch(&command),
            Err(error) => vec![self.decode_failure(raw, error)],
        };
        if self.shared.slots.iter().any(Slot::has_change) {
            notify_changes(&self.shared);
        }
        responses.iter().map(ResponseMessage::encode).collect()
    }

    /// A decode error still gets a well-formed error response, addressed
    /// with whatever header bytes were salvageable.
    fn decode_failure(&self, raw: &[u8], error: DecodeError) -> ResponseMessage {
        warn!(%error, len = raw.len(), "rejecting malformed bulk message");
        let (message_type, slot, seq) = if raw.len() >= 7 {
            let reply_type = CommandKind::from_message_type(raw[0])
                .map_or(reply::SLOT_STATUS, CommandKind::reply_type);
            (reply_type, raw[5], raw[6])
        } else {
            (reply::SLOT_STATUS, 0, 0)
        };
        let icc_status = self
            .shared
            .slots
            .get(usize::from(slot))
            .map_or(IccStatus::NotPresent, Slot::icc_status);
        ResponseMessage::failure(message_type, slot, seq, icc_status, error_code::BAD_LENGTH)
    }

    fn dispatch(&self, command: &CommandMessage) -> Vec<ResponseMessage> {
        let reply_type = command
            .kind()
            .map_or(reply::SLOT_STATUS, CommandKind::reply_type);
        let Some(slot) = self.shared.slots.get(usize::from(command.slot)) else {
            debug!(slot = command.slot, "command addressed to non-existent slot");
            return vec![ResponseMessage::failure(
                reply_type,
                command.slot,
                command.seq,
                IccStatus::NotPresent,
                error_code::SLOT_DOES_NOT_EXIST,
            )];
        };
        let failure = |icc_status: IccStatus, error: u8| {
            vec![ResponseMessage::failure(
                reply_type,
                command.slot,
                command.seq,
                icc_status,
                error,
            )]
        };

        let Some(kind) = command.kind() else {
            trace!(
                message_type = format_args!("{:#04x}", command.message_type),
                "unsupported message type"
            );
            return failure(slot.icc_status(), error_code::CMD_NOT_SUPPORTED);
        };

        // Wire-level validation before any state is touched.
        match kind {
            CommandKind::PowerOn | CommandKind::GetSlotStatus | CommandKind::Abort
                if !command.payload.is_empty() =>
            {
                return failure(slot.icc_status(), error_code::BAD_LENGTH);
            }
            CommandKind::PowerOn if command.power_select() != 0 => {
                // Voltage is auto-selected; only the "automatic" value flies.
                return failure(slot.icc_status(), error_code::POWERSELECT_NOT_SUPPORTED);
            }
            CommandKind::XfrBlock if command.chain().is_none() => {
                return failure(slot.icc_status(), error_code::BAD_WLEVEL);
            }
            CommandKind::GetParameters | CommandKind::ResetParameters
                if !command.payload.is_empty() =>
            {
                return failure(slot.icc_status(), error_code::BAD_LENGTH);
            }
            CommandKind::SetParameters if command.protocol_num() != T1_PROTOCOL_NUM => {
                return failure(slot.icc_status(), error_code::PROTOCOLNUM_NOT_SUPPORTED);
            }
            CommandKind::SetParameters if command.payload.len() != T1_PARAMETERS.len() => {
                return failure(slot.icc_status(), error_code::BAD_LENGTH);
            }
            _ => {}
        }

        // Features this reader does not have: no stoppable clock, no
        // mechanical card handling, a single data rate, no vendor escape,
        // no T=0, no pinpad.
        if matches!(
            kind,
            CommandKind::IccClock
                | CommandKind::Mechanical
                | CommandKind::SetRateAndClock
                | CommandKind::Escape
                | CommandKind::T0Apdu
                | CommandKind::Secure
        ) {
            return failure(slot.icc_status(), error_code::CMD_NOT_SUPPORTED);
        }

        // Parameter commands answer from fixed data but still need a card
        // and still respect a pending abort.
        if matches!(
            kind,
            CommandKind::GetParameters | CommandKind::ResetParameters | CommandKind::SetParameters
        ) && slot.icc_status() == IccStatus::NotPresent
        {
            return failure(IccStatus::NotPresent, error_code::ICC_MUTE);
        }

        match slot.execute(kind, command.seq, command.chain(), &command.payload) {
            Ok(SlotReply::Atr(atr)) => {
                self.data_blocks(command.slot, command.seq, slot.icc_status(), atr)
            }
            Ok(SlotReply::ApduResponse(response)) => {
                self.data_blocks(command.slot, command.seq, slot.icc_status(), response)
            }
            Ok(SlotReply::MoreExpected) => vec![ResponseMessage::data_block(
                command.slot,
                command.seq,
                slot.icc_status(),
                Chain::ExpectingMore,
                Bytes::new(),
            )],
            Ok(SlotReply::Status) => match kind {
                CommandKind::GetParameters
                | CommandKind::ResetParameters
                | CommandKind::SetParameters => vec![ResponseMessage::parameters(
                    command.slot,
                    command.seq,
                    slot.icc_status(),
                    T1_PROTOCOL_NUM,
                    Bytes::from_static(&T1_PARAMETERS),
                )],
                _ => vec![ResponseMessage::slot_status(
                    command.slot,
                    command.seq,
                    slot.icc_status(),
                )],
            },
            Err(error) => {
                debug!(slot = command.slot, seq = command.seq, %error, "command failed");
                failure(slot.icc_status(), error.error_code())
            }
        }
    }

    /// Split a data block payload into as many chained frames as the
    /// negotiated message ceiling requires.
    fn data_blocks(
        &self,
        slot: u8,
        seq: u8,
        icc_status: IccStatus,
        mut payload: Bytes,
    ) -> Vec<ResponseMessage> {
        let max = self.shared.max_payload;
        let mut blocks = Vec::with_capacity(payload.len() / max + 1);
        let mut first = true;
        loop {
            let chunk = payload.split_to(payload.len().min(max));
            let last = payload.is_empty() && chunk.len() < max;
            blocks.push(ResponseMessage::data_block(
                slot,
                seq,
                icc_status,
                Chain::for_chunk(first, last),
                chunk,
            ));
            if last {
                return blocks;
            }
            first = false;
        }
    }
}

/// Build and emit a slot-change notification if a sink is attached.
///
/// Failures to write the interrupt endpoint are logged and swallowed;
/// notifications are advisory and the bulk pipe stays authoritative.
fn notify_changes(shared: &Shared) {
    let mut sink = shared.notify_sink.lock();
    let Some(sink) = sink.as_mut() else {
        return;
    };
    let states = shared.slots.iter().map(Slot::take_change).collect();
    let frame = NotifySlotChange::new(states).encode();
    trace!(frame = %hex::encode(&frame), "slot change notification");
    if let Err(error) = sink.write_all(&frame).and_then(|()| sink.flush()) {
        warn!(%error, "failed to write slot change notification");
    }
}
