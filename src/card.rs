//! Card capability contract
//!
//! The engine owns no card logic. Each slot holds one object implementing
//! [`Card`], injected by the embedder, and only ever asks it for three
//! things: discard volatile state, report an ATR, run one APDU. Applet
//! execution, APDU framing and any cryptography live behind this trait.

use bytes::Bytes;

/// Errors raised by a card capability call.
///
/// Any failure here is recoverable at the slot level: the slot clears its
/// busy flag, answers the host with a hardware error, and stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardError {
    /// The card could not execute the request.
    #[error("card failure: {0}")]
    Failed(String),

    /// The card rejected the request as malformed.
    #[error("card rejected request: {0}")]
    Rejected(&'static str),
}

impl CardError {
    /// Build a `Failed` error from any displayable cause.
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }
}

/// The three-operation contract a slot-backed card must provide.
///
/// Implementations are `Send` because the embedder constructs and inserts
/// cards from its own thread while the event pump runs.
pub trait Card: Send {
    /// Discard all volatile state.
    ///
    /// Invoked on every explicit power-off and when the card is ejected
    /// from a powered slot; the card must forget session keys, cached
    /// security state and the like.
    fn clear_volatiles(&mut self) -> Result<(), CardError>;

    /// Answer-to-reset bytes reported to the host at power-on.
    fn atr(&mut self) -> Result<Bytes, CardError>;

    /// Execute one complete APDU and return the response bytes
    /// (response body followed by the status words).
    ///
    /// The engine passes APDUs through unmodified; chaining has already
    /// been reassembled by the time this is called.
    fn run_apdu(&mut self, command: &[u8]) -> Result<Bytes, CardError>;
}

impl std::fmt::Debug for dyn Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Card")
    }
}
