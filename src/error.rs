//! Central error type for the CCID engine
//!
//! The taxonomy mirrors how failures are surfaced: transport errors are
//! fatal and end the event pump; everything else is recoverable and reaches
//! the host as a well-formed error response, never as a dropped message.
//! Decode failures never show up here at all: the dispatcher resolves them
//! into in-band protocol error responses, and the codec's own entry points
//! report [`DecodeError`](crate::message::DecodeError) directly.

use crate::slot::SlotError;

/// Errors surfaced to the embedding application.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Endpoint I/O failed or the device was disconnected. Fatal: the
    /// event pump terminates and returns this to the embedder.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A slot index outside the configured slot table.
    #[error("slot {slot} does not exist (reader has {count} slots)")]
    SlotOutOfRange {
        /// Requested slot index.
        slot: u8,
        /// Number of slots in the reader.
        count: u8,
    },

    /// A slot-level failure surfaced through an embedder-facing call.
    /// Card capability failures arrive here too, wrapped in
    /// [`SlotError::Card`].
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
