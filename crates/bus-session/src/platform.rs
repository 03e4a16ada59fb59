//! Contract between the session layer and a register-level bus driver.

use core::ptr::NonNull;

/// Byte clocked out when a transmit stream is synthesized from a fill byte
/// and the caller did not choose one.
pub const DEFAULT_FILL_BYTE: u8 = 0xff;

/// Direction of a transfer an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    /// Transmit sub-channel.
    Tx,
    /// Receive sub-channel.
    Rx,
    /// Whole transfer, across all sub-channels.
    Meta,
}

/// Kind of event raised by a platform bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Half of the channel's buffer has been transferred.
    HalfTransfer,
    /// The channel finished. On [`Channel::Meta`] this is the terminal
    /// event of the transfer and is delivered exactly once, last.
    Complete,
    /// The channel failed.
    Error,
}

/// Receiver of platform bus events.
///
/// Implementations are called wherever the driver raises completion, most
/// likely in interrupt context, and must never block.
pub trait BusListener: Sync {
    /// Handles `event` on `channel`; `total` is the number of bytes moved
    /// through that channel during the current transfer.
    fn on_event(&self, channel: Channel, event: Event, total: usize);
}

/// Transmit side of a transfer as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBuffer {
    /// Nothing to transmit.
    None,
    /// Transmit `len` bytes starting at `ptr`.
    Data { ptr: NonNull<u8>, len: usize },
    /// Transmit `byte` repeated `len` times.
    Fill { len: usize, byte: u8 },
}

impl TxBuffer {
    /// Describes the first `len` bytes of `data`.
    ///
    /// The descriptor does not borrow `data`; whoever hands it to a driver
    /// is responsible for keeping the memory alive.
    pub fn from_slice(data: &[u8], len: usize) -> Self {
        debug_assert!(len <= data.len());
        Self::Data { ptr: NonNull::from(data).cast(), len }
    }

    /// Number of bytes this descriptor transmits.
    pub fn len(&self) -> usize {
        match *self {
            TxBuffer::None => 0,
            TxBuffer::Data { len, .. } | TxBuffer::Fill { len, .. } => len,
        }
    }

    /// Returns `true` if nothing will be transmitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive side of a transfer as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxBuffer {
    /// Incoming data is not stored.
    None,
    /// Store up to `len` bytes starting at `ptr`.
    Data { ptr: NonNull<u8>, len: usize },
}

impl RxBuffer {
    /// Describes the first `len` bytes of `data`.
    ///
    /// The descriptor does not borrow `data`; whoever hands it to a driver
    /// is responsible for keeping the memory alive and otherwise untouched.
    pub fn from_slice(data: &mut [u8], len: usize) -> Self {
        debug_assert!(len <= data.len());
        Self::Data { ptr: NonNull::from(data).cast(), len }
    }

    /// Number of bytes this descriptor can receive.
    pub fn len(&self) -> usize {
        match *self {
            RxBuffer::None => 0,
            RxBuffer::Data { len, .. } => len,
        }
    }

    /// Returns `true` if nothing will be received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// SAFETY: The descriptors are plain addresses. Whoever registers one with a
// driver (see `PlatformBus::set_tx` / `set_rx`) guarantees the memory stays
// valid, so moving the address between contexts is fine.
unsafe impl Send for TxBuffer {}
unsafe impl Send for RxBuffer {}

/// Capabilities a platform-level bus driver (I2C, SPI, UART...) offers.
///
/// All methods take `&self`: the same driver is driven from thread context
/// and from its own interrupt handler, so implementations synchronize
/// register access internally.
pub trait PlatformBus {
    /// Driver specific error.
    type Error: core::fmt::Debug;

    /// Lazily initializes the peripheral.
    fn init(&self) -> Result<(), Self::Error>;

    /// Installs the listener that receives every event of this bus until
    /// [`reset_handler`](Self::reset_handler) is called.
    fn set_handler(&self, listener: &'static dyn BusListener);

    /// Removes the installed listener.
    fn reset_handler(&self);

    /// Forgets the buffers set by [`set_tx`](Self::set_tx) and
    /// [`set_rx`](Self::set_rx). The driver no longer touches them after
    /// this returns.
    fn reset_buffers(&self);

    /// Registers the transmit side of the next transfer.
    ///
    /// # Safety
    ///
    /// Memory described by `tx` must stay valid for reads until the transfer
    /// using it ends or [`reset_buffers`](Self::reset_buffers) is called.
    unsafe fn set_tx(&self, tx: TxBuffer);

    /// Registers the receive side of the next transfer.
    ///
    /// # Safety
    ///
    /// Memory described by `rx` must stay valid for writes, and must not be
    /// accessed by anyone else, until the transfer using it ends or
    /// [`reset_buffers`](Self::reset_buffers) is called.
    unsafe fn set_rx(&self, rx: RxBuffer);

    /// Starts a transfer using the registered buffers. Completion is
    /// reported through the listener; the last event is always
    /// `(Channel::Meta, Event::Complete)`.
    fn do_xfer(&self) -> Result<(), Self::Error>;

    /// Aborts the ongoing transfer. Once this returns `Ok`, no further event
    /// is delivered for that transfer.
    fn cancel_xfer(&self) -> Result<(), Self::Error>;
}

/// Independent receive and transmit for stream-oriented buses (UART).
pub trait StreamPlatform: PlatformBus {
    /// Reports every received byte as `(Channel::Rx, Event::Complete)` with
    /// the running count for the current receive buffer.
    fn enable_listen_mode(&self) -> Result<(), Self::Error>;

    /// Starts receiving into the registered receive buffer.
    fn do_rx(&self) -> Result<(), Self::Error>;

    /// Starts sending the registered transmit buffer. Completion is reported
    /// as `(Channel::Tx, Event::Complete)`.
    fn do_tx(&self) -> Result<(), Self::Error>;
}
