//! Per-slot state machine
//!
//! A [`Slot`] owns one optional [`Card`] and everything the protocol tracks
//! about it: power state, busy flag, cached ATR, the APDU chaining buffer
//! and the two halves of the abort handshake. All of it sits behind one
//! `parking_lot::Mutex` held for the whole handling of a command, so the
//! embedder may insert or eject cards from its own thread while the event
//! pump is busy inside a different slot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::card::{Card, CardError};
use crate::message::{Chain, CommandKind, IccStatus};

/// Power state of a slot, as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// No ATR has been delivered (or the card was powered off).
    Unpowered,
    /// The card answered to reset and accepts APDUs.
    Powered,
}

/// Recoverable slot-level failures, each mapping to one CCID error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// No card is present in the slot.
    #[error("no card present")]
    NoCard,

    /// The card has not been powered on.
    #[error("card is not powered")]
    NotPowered,

    /// Another command is already in flight on this slot.
    #[error("slot is busy")]
    Busy,

    /// The command was rejected because an abort is pending.
    #[error("command aborted")]
    Aborted,

    /// A card is already present (embedder `insert` on an occupied slot).
    #[error("a card is already present")]
    CardPresent,

    /// The card capability call itself failed.
    #[error(transparent)]
    Card(#[from] CardError),
}

impl SlotError {
    /// The `bError` byte reported to the host for this failure.
    pub const fn error_code(&self) -> u8 {
        use crate::message::error_code;
        match self {
            Self::NoCard | Self::NotPowered => error_code::ICC_MUTE,
            Self::Busy => error_code::CMD_SLOT_BUSY,
            Self::Aborted => error_code::CMD_ABORTED,
            // CardPresent never reaches the wire; insert is an embedder call.
            Self::CardPresent => error_code::HW_ERROR,
            Self::Card(_) => error_code::HW_ERROR,
        }
    }
}

/// Semantic outcome of a slot command, before response framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotReply {
    /// Power-on succeeded; deliver the ATR as a data block.
    Atr(Bytes),
    /// Status-style success (power off, get status, completed abort).
    Status,
    /// A complete APDU ran; deliver the card's response.
    ApduResponse(Bytes),
    /// Mid-chain XfrBlock accepted; more command blocks expected.
    MoreExpected,
}

#[derive(Debug)]
struct SlotState {
    card: Option<Box<dyn Card>>,
    power: PowerState,
    busy: bool,
    atr: Option<Bytes>,
    /// Reassembly buffer for chained XfrBlocks.
    apdu: BytesMut,
    /// Sequence number of the last accepted command.
    seq: u8,
    /// Presence changed since the last interrupt notification.
    changed: bool,
    /// Pending ABORT received on the control pipe, by sequence number.
    control_abort: Option<u8>,
    /// Pending ABORT received on the bulk pipe, by sequence number.
    bulk_abort: Option<u8>,
}

/// One card slot of the reader.
///
/// Cheap to clone; clones share the same state and lock.
#[derive(Debug, Clone)]
pub struct Slot {
    index: u8,
    state: Arc<Mutex<SlotState>>,
}

impl Slot {
    pub(crate) fn new(index: u8) -> Self {
        Self {
            index,
            state: Arc::new(Mutex::new(SlotState {
                card: None,
                power: PowerState::Unpowered,
                busy: false,
                atr: None,
                apdu: BytesMut::new(),
                seq: 0,
                changed: false,
                control_abort: None,
                bulk_abort: None,
            })),
        }
    }

    /// Slot index, fixed at construction.
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Card presence and power as reported in response status bytes.
    pub fn icc_status(&self) -> IccStatus {
        let state = self.state.lock();
        match (&state.card, state.power) {
            (None, _) => IccStatus::NotPresent,
            (Some(_), PowerState::Powered) => IccStatus::Active,
            (Some(_), PowerState::Unpowered) => IccStatus::Inactive,
        }
    }

    /// Current power state.
    pub fn power_state(&self) -> PowerState {
        self.state.lock().power
    }

    /// Whether a card is present.
    pub fn is_present(&self) -> bool {
        self.state.lock().card.is_some()
    }

    /// Insert a card into this slot.
    ///
    /// Boundary operation for the embedder, not reachable from protocol
    /// traffic. Fails with [`SlotError::CardPresent`] if the slot is
    /// occupied; eject first.
    pub fn insert(&self, card: Box<dyn Card>) -> Result<(), SlotError> {
        let mut state = self.state.lock();
        if state.card.is_some() {
            return Err(SlotError::CardPresent);
        }
        debug!(slot = self.index, "card inserted");
        state.card = Some(card);
        state.power = PowerState::Unpowered;
        state.atr = None;
        state.apdu.clear();
        state.changed = true;
        Ok(())
    }

    /// Remove the card from this slot and return it.
    ///
    /// An eject while powered forces the slot back to `Unpowered` and tells
    /// the outgoing card to discard volatile state, so the slot is never
    /// left powered against an absent card.
    pub fn eject(&self) -> Result<Box<dyn Card>, SlotError> {
        let mut state = self.state.lock();
        let mut card = state.card.take().ok_or(SlotError::NoCard)?;
        if state.power == PowerState::Powered {
            if let Err(error) = card.clear_volatiles() {
                warn!(slot = self.index, %error, "clear_volatiles failed during eject");
            }
        }
        debug!(slot = self.index, "card ejected");
        state.power = PowerState::Unpowered;
        state.atr = None;
        state.apdu.clear();
        state.changed = true;
        Ok(card)
    }

    /// Signal an ABORT received on the control pipe for `seq`.
    ///
    /// Until the matching bulk `Abort` arrives, every other bulk command on
    /// this slot is answered with `CMD_ABORTED`. Cancellation of a card call
    /// already in flight is best-effort: the call is not interrupted, but
    /// the busy flag still clears when it returns.
    pub fn request_abort(&self, seq: u8) {
        let mut state = self.state.lock();
        state.apdu.clear();
        if state.bulk_abort == Some(seq) {
            // Bulk half already seen; the handshake is complete.
            state.bulk_abort = None;
            state.control_abort = None;
        } else {
            state.control_abort = Some(seq);
        }
        debug!(slot = self.index, seq, "abort requested");
    }

    /// Report and reset the changed flag, for the notification bitmap.
    pub(crate) fn take_change(&self) -> crate::message::SlotChange {
        let mut state = self.state.lock();
        let changed = state.changed;
        state.changed = false;
        crate::message::SlotChange {
            present: state.card.is_some(),
            changed,
        }
    }

    /// Whether the changed flag is set, without consuming it.
    pub(crate) fn has_change(&self) -> bool {
        self.state.lock().changed
    }

    /// Execute one decoded bulk command against this slot.
    ///
    /// The state lock is held for the whole sequence, card call included;
    /// this is the per-slot exclusion the protocol requires between the
    /// pump and embedder-driven insert/eject.
    pub(crate) fn execute(
        &self,
        kind: CommandKind,
        seq: u8,
        chain: Option<Chain>,
        payload: &[u8],
    ) -> Result<SlotReply, SlotError> {
        let mut state = self.state.lock();
        state.seq = seq;

        // Abort handshake gate: while a control abort is pending, only the
        // matching bulk Abort gets through.
        if let Some(pending) = state.control_abort {
            if kind == CommandKind::Abort && seq == pending {
                state.control_abort = None;
                state.bulk_abort = None;
                state.apdu.clear();
                debug!(slot = self.index, seq, "abort handshake completed");
                return Ok(SlotReply::Status);
            }
            trace!(slot = self.index, seq, "command rejected, abort pending");
            return Err(SlotError::Aborted);
        }
        if kind == CommandKind::Abort {
            // Bulk half first; remember it and acknowledge.
            state.bulk_abort = Some(seq);
            state.apdu.clear();
            return Ok(SlotReply::Status);
        }
        state.bulk_abort = None;

        match kind {
            CommandKind::PowerOn => Self::power_on(&mut state),
            CommandKind::PowerOff => Self::power_off(self.index, &mut state),
            CommandKind::GetSlotStatus => Ok(SlotReply::Status),
            CommandKind::XfrBlock => Self::xfr_block(&mut state, chain, payload),
            // Everything else is resolved by the dispatcher without slot
            // state transitions.
            _ => Ok(SlotReply::Status),
        }
    }

    fn power_on(state: &mut SlotState) -> Result<SlotReply, SlotError> {
        let card = state.card.as_mut().ok_or(SlotError::NoCard)?;
        if state.power == PowerState::Powered {
            // Hosts re-issue PowerOn without an intervening PowerOff;
            // resend the cached ATR instead of failing.
            if let Some(atr) = &state.atr {
                return Ok(SlotReply::Atr(atr.clone()));
            }
        }
        let atr = card.atr()?;
        state.power = PowerState::Powered;
        state.atr = Some(atr.clone());
        state.apdu.clear();
        Ok(SlotReply::Atr(atr))
    }

    fn power_off(index: u8, state: &mut SlotState) -> Result<SlotReply, SlotError> {
        // The volatile-clear contract holds on every explicit power-off,
        // even when the slot was never powered.
        if let Some(card) = state.card.as_mut() {
            if let Err(error) = card.clear_volatiles() {
                warn!(slot = index, %error, "clear_volatiles failed during power off");
            }
        }
        state.power = PowerState::Unpowered;
        state.atr = None;
        state.apdu.clear();
        Ok(SlotReply::Status)
    }

    fn xfr_block(
        state: &mut SlotState,
        chain: Option<Chain>,
        payload: &[u8],
    ) -> Result<SlotReply, SlotError> {
        if state.card.is_none() {
            return Err(SlotError::NoCard);
        }
        if state.power != PowerState::Powered {
            return Err(SlotError::NotPowered);
        }
        if state.busy {
            return Err(SlotError::Busy);
        }
        let chain = chain.unwrap_or(Chain::BeginsAndEnds);
        if chain.starts_transfer() {
            state.apdu.clear();
        }
        state.apdu.extend_from_slice(payload);
        if !chain.ends_transfer() {
            return Ok(SlotReply::MoreExpected);
        }
        let apdu = state.apdu.split().freeze();
        state.busy = true;
        let result = match state.card.as_mut() {
            // A card that panics must not wedge the slot; the unwind is
            // caught here so busy still clears and the host sees HW_ERROR.
            Some(card) => panic::catch_unwind(AssertUnwindSafe(|| card.run_apdu(&apdu)))
                .unwrap_or_else(|_| Err(CardError::Failed("card panicked".into()))),
            None => Err(CardError::Rejected("card vanished mid-command")),
        };
        // Busy must clear on every exit path, failed card calls included.
        state.busy = false;
        trace!(
            apdu = %hex::encode(&apdu),
            ok = result.is_ok(),
            "apdu executed"
        );
        Ok(SlotReply::ApduResponse(result?))
    }

    #[cfg(test)]
    pub(crate) fn force_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    #[cfg(test)]
    pub(crate) fn last_seq(&self) -> u8 {
        self.state.lock().seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::test_support::MockCard;

    fn powered_slot(card: MockCard) -> Slot {
        let slot = Slot::new(0);
        slot.insert(Box::new(card)).unwrap();
        slot.execute(CommandKind::PowerOn, 0, None, &[]).unwrap();
        slot
    }

    #[test]
    fn power_on_without_card_is_an_error() {
        let slot = Slot::new(0);
        let err = slot
            .execute(CommandKind::PowerOn, 1, None, &[])
            .unwrap_err();
        assert_eq!(err, SlotError::NoCard);
        assert_eq!(slot.power_state(), PowerState::Unpowered);
    }

    #[test]
    fn power_on_delivers_atr_and_powers_slot() {
        let card = MockCard::with_atr(&[0x3b, 0x00]);
        let slot = Slot::new(0);
        slot.insert(Box::new(card)).unwrap();
        let reply = slot.execute(CommandKind::PowerOn, 3, None, &[]).unwrap();
        assert_eq!(reply, SlotReply::Atr(Bytes::from_static(&[0x3b, 0x00])));
        assert_eq!(slot.power_state(), PowerState::Powered);
        assert_eq!(slot.icc_status(), IccStatus::Active);
    }

    #[test]
    fn repeated_power_on_resends_cached_atr() {
        let card = MockCard::with_atr(&[0x3b, 0x00]);
        let calls = card.calls();
        let slot = powered_slot(card);
        let reply = slot.execute(CommandKind::PowerOn, 4, None, &[]).unwrap();
        assert_eq!(reply, SlotReply::Atr(Bytes::from_static(&[0x3b, 0x00])));
        assert_eq!(slot.power_state(), PowerState::Powered);
        // Second PowerOn must not reach the card again.
        assert_eq!(calls.lock().atr, 1);
    }

    #[test]
    fn power_off_clears_volatiles_exactly_once_from_any_state() {
        for power_first in [false, true] {
            let card = MockCard::default();
            let calls = card.calls();
            let slot = Slot::new(0);
            slot.insert(Box::new(card)).unwrap();
            if power_first {
                slot.execute(CommandKind::PowerOn, 0, None, &[]).unwrap();
            }
            slot.execute(CommandKind::PowerOff, 1, None, &[]).unwrap();
            assert_eq!(slot.power_state(), PowerState::Unpowered);
            assert_eq!(calls.lock().clear_volatiles, 1);
        }
    }

    #[test]
    fn xfr_block_unpowered_never_reaches_card() {
        let card = MockCard::default();
        let calls = card.calls();
        let slot = Slot::new(0);
        slot.insert(Box::new(card)).unwrap();
        let err = slot
            .execute(CommandKind::XfrBlock, 2, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert_eq!(err, SlotError::NotPowered);
        assert_eq!(calls.lock().run_apdu, 0);
    }

    #[test]
    fn xfr_block_runs_apdu_and_clears_busy() {
        let card = MockCard::with_response(&[0x90, 0x00]);
        let slot = powered_slot(card);
        let reply = slot
            .execute(
                CommandKind::XfrBlock,
                5,
                Some(Chain::BeginsAndEnds),
                &[0x00, 0xa4, 0x04, 0x00],
            )
            .unwrap();
        assert_eq!(reply, SlotReply::ApduResponse(Bytes::from_static(&[0x90, 0x00])));
        // Busy returned to false: a second transfer goes through.
        let reply = slot
            .execute(CommandKind::XfrBlock, 6, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap();
        assert!(matches!(reply, SlotReply::ApduResponse(_)));
    }

    #[test]
    fn busy_clears_even_when_card_fails() {
        let card = MockCard::failing_apdu();
        let slot = powered_slot(card);
        let err = slot
            .execute(CommandKind::XfrBlock, 7, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert!(matches!(err, SlotError::Card(_)));
        // Slot stays usable; busy was cleared on the failure path.
        let err = slot
            .execute(CommandKind::XfrBlock, 8, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert!(matches!(err, SlotError::Card(_)));
    }

    #[test]
    fn busy_clears_even_when_card_panics() {
        let card = MockCard::panicking_apdu();
        let calls = card.calls();
        let slot = powered_slot(card);
        let err = slot
            .execute(CommandKind::XfrBlock, 7, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert!(matches!(err, SlotError::Card(_)));
        // Not stuck busy: the next transfer reaches the card again instead
        // of bouncing off CMD_SLOT_BUSY.
        let err = slot
            .execute(CommandKind::XfrBlock, 8, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert!(matches!(err, SlotError::Card(_)));
        assert_eq!(calls.lock().run_apdu, 2);
    }

    #[test]
    fn busy_slot_rejects_transfer() {
        let card = MockCard::with_response(&[0x90, 0x00]);
        let slot = powered_slot(card);
        slot.force_busy(true);
        let err = slot
            .execute(CommandKind::XfrBlock, 9, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert_eq!(err, SlotError::Busy);
    }

    #[test]
    fn chained_command_blocks_are_reassembled() {
        let card = MockCard::echoing();
        let slot = powered_slot(card);
        let reply = slot
            .execute(CommandKind::XfrBlock, 1, Some(Chain::Begins), &[0x01, 0x02])
            .unwrap();
        assert_eq!(reply, SlotReply::MoreExpected);
        let reply = slot
            .execute(CommandKind::XfrBlock, 2, Some(Chain::Ends), &[0x03])
            .unwrap();
        assert_eq!(
            reply,
            SlotReply::ApduResponse(Bytes::from_static(&[0x01, 0x02, 0x03]))
        );
    }

    #[test]
    fn eject_while_powered_clears_volatiles_once() {
        let card = MockCard::default();
        let calls = card.calls();
        let slot = powered_slot(card);
        let _card = slot.eject().unwrap();
        assert_eq!(slot.power_state(), PowerState::Unpowered);
        assert_eq!(slot.icc_status(), IccStatus::NotPresent);
        assert_eq!(calls.lock().clear_volatiles, 1);
    }

    #[test]
    fn eject_unpowered_does_not_touch_card() {
        let card = MockCard::default();
        let calls = card.calls();
        let slot = Slot::new(0);
        slot.insert(Box::new(card)).unwrap();
        let _card = slot.eject().unwrap();
        assert_eq!(calls.lock().clear_volatiles, 0);
    }

    #[test]
    fn insert_on_occupied_slot_fails() {
        let slot = Slot::new(0);
        slot.insert(Box::new(MockCard::default())).unwrap();
        let err = slot.insert(Box::new(MockCard::default())).unwrap_err();
        assert_eq!(err, SlotError::CardPresent);
    }

    #[test]
    fn control_abort_rejects_other_commands_until_bulk_abort() {
        let card = MockCard::with_response(&[0x90, 0x00]);
        let slot = powered_slot(card);
        slot.request_abort(5);
        let err = slot
            .execute(CommandKind::XfrBlock, 6, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap_err();
        assert_eq!(err, SlotError::Aborted);
        // Matching bulk abort completes the handshake.
        let reply = slot.execute(CommandKind::Abort, 5, None, &[]).unwrap();
        assert_eq!(reply, SlotReply::Status);
        // Traffic flows again.
        let reply = slot
            .execute(CommandKind::XfrBlock, 7, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap();
        assert!(matches!(reply, SlotReply::ApduResponse(_)));
    }

    #[test]
    fn bulk_abort_before_control_abort_is_acknowledged() {
        let card = MockCard::with_response(&[0x90, 0x00]);
        let slot = powered_slot(card);
        let reply = slot.execute(CommandKind::Abort, 5, None, &[]).unwrap();
        assert_eq!(reply, SlotReply::Status);
        // Matching control half clears the pending bulk abort.
        slot.request_abort(5);
        let reply = slot
            .execute(CommandKind::XfrBlock, 6, Some(Chain::BeginsAndEnds), &[0x00])
            .unwrap();
        assert!(matches!(reply, SlotReply::ApduResponse(_)));
    }

    #[test]
    fn changed_flag_is_consumed_by_notification() {
        let slot = Slot::new(0);
        slot.insert(Box::new(MockCard::default())).unwrap();
        assert!(slot.has_change());
        let change = slot.take_change();
        assert!(change.present);
        assert!(change.changed);
        let change = slot.take_change();
        assert!(change.present);
        assert!(!change.changed);
    }
}
