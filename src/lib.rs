//! Device-side USB CCID/ICCD protocol engine
//!
//! This crate makes a process look like a hardware smart-card reader to a
//! USB host. The host drives it with standard CCID class commands over a
//! bulk endpoint pair; each of the reader's slots is backed by an object
//! the embedder injects through the three-operation [`Card`] trait (reset
//! to ATR, clear volatile state, run one APDU).
//!
//! The crate is deliberately only the protocol engine. It consumes
//! already-open, already-configured endpoint byte streams (for a Linux
//! gadget, the ep files a functionfs mount hands out) and speaks the wire
//! format over them; descriptor negotiation, configfs wiring, host-side
//! PC/SC and the card logic itself all live outside.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use nexum_ccid::{CcidReader, EventPump, ReaderConfig};
//! # struct SoftCard;
//! # impl nexum_ccid::Card for SoftCard {
//! #     fn clear_volatiles(&mut self) -> Result<(), nexum_ccid::CardError> { Ok(()) }
//! #     fn atr(&mut self) -> Result<nexum_ccid::Bytes, nexum_ccid::CardError> { Ok(nexum_ccid::Bytes::new()) }
//! #     fn run_apdu(&mut self, _: &[u8]) -> Result<nexum_ccid::Bytes, nexum_ccid::CardError> { Ok(nexum_ccid::Bytes::new()) }
//! # }
//!
//! let reader = CcidReader::new(ReaderConfig::default().with_slot_count(2));
//! reader.slot(0)?.insert(Box::new(SoftCard))?;
//!
//! // Endpoint handles come from the embedder's gadget setup.
//! let bulk_out = std::fs::File::open("/dev/ffs-ccid/ep2")?;
//! let bulk_in = std::fs::File::create("/dev/ffs-ccid/ep1")?;
//! let interrupt_in = std::fs::File::create("/dev/ffs-ccid/ep3")?;
//! reader.set_notify_sink(Box::new(interrupt_in));
//!
//! let mut pump = EventPump::new(reader.clone(), bulk_out, bulk_in);
//! let stop = pump.stop_handle();
//! std::thread::spawn(move || {
//!     // Embedder-side card movement while the pump runs elsewhere.
//!     let _ = reader.slot(1).map(|slot| slot.eject());
//!     stop.stop();
//! });
//! pump.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! [CCID Specification for Integrated Circuit(s) Cards Interface Devices, rev 1.1](https://www.usb.org/sites/default/files/DWG_Smart-Card_CCID_Rev110.pdf)
//!
//! [USB Integrated Circuit(s) Card Devices (ICCD), rev 1.0](https://www.usb.org/sites/default/files/DWG_Smart-Card_USB-ICC_ICCD_rev10.pdf)
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

// Main modules
pub mod card;
pub mod message;
pub mod pump;
pub mod reader;
pub mod slot;

// Core error types
mod error;
pub use error::{Error, Result};

// Re-exports for common types
pub use card::{Card, CardError};
pub use message::{CommandMessage, ResponseMessage};
pub use pump::{EventPump, StopHandle};
pub use reader::{CcidReader, ReaderConfig, SlotHandle};
pub use slot::{PowerState, Slot, SlotError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, BytesMut, Card, CardError, CcidReader, Error, EventPump, PowerState, ReaderConfig,
        Result, SlotHandle, StopHandle,
    };
}
