//! Client-side protocol driver for the Accu-Chek Combo insulin pump:
//! RFCOMM framing and AES-128 pairing, the RT/CMD application layer, and
//! the session orchestrator that drives them (see `DESIGN.md`).

pub mod app;
pub mod cipher;
pub mod error;
pub mod external;
pub mod framer;
pub mod logging;
pub mod nonce;
pub mod pump_io;
pub mod transport;

pub use error::{ComboError, Result};
pub use pump_io::{ComboCtlEvent, Mode, PumpIo, PumpIoConfig};
