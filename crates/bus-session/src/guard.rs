use core::marker::PhantomData;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::MutexGuard;

use crate::error::{BusError, Transferred};
use crate::platform::{PlatformBus, RxBuffer, TxBuffer};
use crate::session::{Session, XferHandler};

/// RAII proof that the bus is locked.
///
/// Dropping the guard unlocks the bus: buffers are released right away
/// after a blocking transfer, or once the terminal event arrives if an
/// asynchronous transfer is still running.
///
/// `'b` is the lifetime of the registered buffers. Only `'static` buffers
/// can be registered safely, because the driver may outlive the guard
/// (the guard may be leaked, or an asynchronous transfer may still be
/// running after unlock). Borrowed buffers go through the `unsafe`
/// [`set_buffers_unchecked`](Self::set_buffers_unchecked).
pub struct BusGuard<'s, 'b, M: RawMutex, P: PlatformBus> {
    session: &'s Session<M, P>,
    // Dropped after `Drop::drop` has run, so the mutex is released last.
    _lock: MutexGuard<'s, M, ()>,
    buffers_set: bool,
    _buffers: PhantomData<&'b mut [u8]>,
}

/// Validates user buffers and turns them into driver descriptors.
fn describe<E: core::fmt::Debug>(
    tx: Option<&[u8]>,
    rx: Option<&mut [u8]>,
    size: usize,
) -> Result<(TxBuffer, RxBuffer), BusError<E>> {
    if tx.is_none() && rx.is_none() {
        return Err(BusError::InvalidArgument);
    }
    if tx.as_ref().is_some_and(|tx| tx.len() < size)
        || rx.as_ref().is_some_and(|rx| rx.len() < size)
    {
        return Err(BusError::InvalidArgument);
    }

    let tx = tx.map_or(TxBuffer::None, |tx| TxBuffer::from_slice(tx, size));
    let rx = rx.map_or(RxBuffer::None, |rx| RxBuffer::from_slice(rx, size));
    Ok((tx, rx))
}

impl<'s, 'b, M: RawMutex, P: PlatformBus> BusGuard<'s, 'b, M, P> {
    pub(crate) fn new(
        session: &'s Session<M, P>,
        lock: MutexGuard<'s, M, ()>,
    ) -> Self {
        Self { session, _lock: lock, buffers_set: false, _buffers: PhantomData }
    }

    /// Registers borrowed transmit and receive buffers for the next
    /// blocking transfer.
    ///
    /// Same checks as [`set_buffers`](BusGuard::set_buffers).
    ///
    /// # Safety
    ///
    /// The guard must be dropped before `'b` ends. Leaking it (e.g. with
    /// [`core::mem::forget`], or by leaking a future that owns it) leaves
    /// the driver pointing at memory that is no longer borrowed.
    pub unsafe fn set_buffers_unchecked(
        &mut self,
        tx: Option<&'b [u8]>,
        rx: Option<&'b mut [u8]>,
        size: usize,
    ) -> Result<(), BusError<P::Error>> {
        let (tx, rx) = describe(tx, rx, size)?;
        // SAFETY: The caller keeps the guard from outliving the borrow, and
        // dropping the guard resets the driver's buffers. Async transfers
        // are only reachable with `'b: 'static`.
        unsafe { self.register(tx, rx, false) }
    }

    /// Registers a transmit stream of `size` copies of `fill_byte`.
    ///
    /// Nothing is received; on a full-duplex bus incoming data is dropped.
    pub fn set_fill(
        &mut self,
        size: usize,
        fill_byte: u8,
    ) -> Result<(), BusError<P::Error>> {
        // SAFETY: Neither descriptor refers to memory.
        unsafe {
            self.register(
                TxBuffer::Fill { len: size, byte: fill_byte },
                RxBuffer::None,
                true,
            )
        }
    }

    /// Hands descriptors to the driver, replacing previous ones.
    ///
    /// # Safety
    ///
    /// Memory behind the descriptors must stay valid until the driver's
    /// buffers are reset. `is_static` may only be `true` if it is valid
    /// for `'static`.
    pub(crate) unsafe fn register(
        &mut self,
        tx: TxBuffer,
        rx: RxBuffer,
        is_static: bool,
    ) -> Result<(), BusError<P::Error>> {
        if self.session.state().is_busy() {
            return Err(BusError::Busy);
        }

        let platform = self.session.platform();
        self.session.set_static_buffers(false);
        platform.reset_buffers();
        // SAFETY: Forwarded from the caller.
        unsafe {
            platform.set_tx(tx);
            platform.set_rx(rx);
        }
        self.session.set_static_buffers(is_static);

        self.buffers_set = true;
        Ok(())
    }

    /// Performs a transfer and waits for it to complete.
    ///
    /// On a half-duplex bus transmit happens first, then receive. Returns the
    /// per-channel byte counts reported by the driver. If the transfer
    /// started but failed, the counts are carried by [`BusError::Io`]. If
    /// the driver refused to start, its error is returned right away.
    ///
    /// # Panics
    ///
    /// Panics if no buffers were registered.
    pub async fn xfer(&mut self) -> Result<Transferred, BusError<P::Error>> {
        assert!(self.buffers_set, "no buffers registered");

        if self.session.state().is_busy() {
            return Err(BusError::Busy);
        }

        self.session.start_blocking()?;
        self.session.wait_blocking().await
    }

    /// Aborts the outstanding asynchronous transfer.
    ///
    /// See [`Session::cancel_xfer`].
    pub fn cancel_xfer(&mut self) -> Result<(), BusError<P::Error>> {
        self.session.cancel_xfer()
    }

    /// Returns `true` while an asynchronous transfer is in flight.
    pub fn is_busy(&self) -> bool {
        self.session.state().is_busy()
    }

    /// Returns the underlying platform bus.
    pub fn platform(&self) -> &P {
        self.session.platform()
    }

    /// Unlocks the bus. Same as dropping the guard.
    pub fn unlock(self) {}
}

impl<'s, M: RawMutex, P: PlatformBus> BusGuard<'s, 'static, M, P> {
    /// Registers transmit and receive buffers for the next transfer.
    ///
    /// Either side may be omitted, but not both. `size` bytes are transferred
    /// on each side that is present; zero is valid and means no transfer on
    /// that channel. Previous buffers are discarded.
    pub fn set_buffers(
        &mut self,
        tx: Option<&'static [u8]>,
        rx: Option<&'static mut [u8]>,
        size: usize,
    ) -> Result<(), BusError<P::Error>> {
        let (tx, rx) = describe(tx, rx, size)?;
        // SAFETY: Both buffers live forever and `rx` is exclusively ours.
        unsafe { self.register(tx, rx, true) }
    }

    /// Starts a transfer and returns immediately.
    ///
    /// `handler` receives every sub-channel event and finally
    /// `(Channel::Meta, Event::Complete)`. It runs in the driver's event
    /// context, most likely an interrupt, and must not block. The guard may
    /// be dropped while the transfer runs; the buffers are then released
    /// once the terminal event arrives.
    ///
    /// # Panics
    ///
    /// Panics if no buffers were registered.
    pub fn xfer_with(
        &mut self,
        handler: XferHandler,
    ) -> Result<(), BusError<P::Error>> {
        self.defer_xfer(handler)?;
        self.session.start_async()
    }

    /// Stores `handler` for a transfer started later by
    /// [`trigger_xfer`](Self::trigger_xfer).
    ///
    /// # Panics
    ///
    /// Panics if no buffers were registered.
    pub fn defer_xfer(
        &mut self,
        handler: XferHandler,
    ) -> Result<(), BusError<P::Error>> {
        assert!(self.buffers_set, "no buffers registered");

        if self.session.state().is_busy() {
            return Err(BusError::Busy);
        }

        self.session.set_handler(Some(handler));
        Ok(())
    }

    /// Fires a deferred transfer with the registered buffers and handler.
    ///
    /// # Panics
    ///
    /// Panics if no buffers were registered or a transfer is in flight.
    pub fn trigger_xfer(&mut self) -> Result<(), BusError<P::Error>> {
        assert!(self.buffers_set, "no buffers registered");
        assert!(!self.is_busy(), "transfer already in flight");

        self.session.start_async()
    }
}

impl<M: RawMutex, P: PlatformBus> Drop for BusGuard<'_, '_, M, P> {
    fn drop(&mut self) {
        self.session.release();
    }
}
