#![no_std]
//! Generic lock/transfer sessions for serial-style peripherals.
//!
//! A [`Session`] serializes access to one physical bus (I2C, SPI, UART...)
//! and hides whether the silicon is full- or half-duplex and whether the
//! transfer is awaited or completed through an event handler. The
//! [`StreamReader`] sits directly on a platform bus and turns its raw
//! receive events into an unbounded, double-buffered byte stream.
//!
//! The register-level driver is supplied by the platform through the
//! [`PlatformBus`] and [`StreamPlatform`] traits.

#[macro_use]
mod fmt;

mod error;
mod guard;
mod pipe;
mod platform;
mod session;
mod state;
mod stream;

pub use error::{BusError, Transferred};
pub use guard::BusGuard;
pub use pipe::Pipe;
pub use platform::{
    BusListener, Channel, Event, PlatformBus, RxBuffer, StreamPlatform,
    TxBuffer, DEFAULT_FILL_BYTE,
};
pub use session::{Session, XferHandler};
pub use state::BusState;
pub use stream::StreamReader;
