//! Hardware abstraction layer.
//!
//! - `capabilities`: small async traits devices implement (`Instrument`,
//!   `Movable`, `ChannelReader`) plus the blocking `FrameSource`
//! - `handle`: `InstrumentHandle`, the registered device with its captured setters
//! - `arbiter`: exclusive access to shared hardware across sweep, streaming
//!   and calibration
//! - `mock`: simulated devices for tests and the CLI

pub mod arbiter;
pub mod capabilities;
pub mod handle;
pub mod mock;

pub use arbiter::{HardwareArbiter, HardwareGuard, HardwareOwner};
pub use capabilities::{ChannelReader, FrameSource, Instrument, Movable, ParameterSnapshot};
pub use handle::{InstrumentHandle, InstrumentRole, Setter};
