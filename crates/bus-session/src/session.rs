use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::error::{BusError, Transferred};
use crate::guard::BusGuard;
use crate::platform::{BusListener, Channel, Event, PlatformBus};
use crate::state::BusState;

/// User-supplied event handler for asynchronous transfers.
///
/// Called from the platform's event context, most likely an interrupt:
/// it must never block.
pub type XferHandler = &'static (dyn Fn(Channel, Event, usize) + Sync);

/// Exclusive, transfer-oriented access to one platform bus.
///
/// One session exists per physical peripheral, usually in a `static`.
/// Access goes through [`lock`](Self::lock), which hands out a
/// [`BusGuard`]; dropping the guard unlocks the bus.
pub struct Session<M: RawMutex, P: PlatformBus> {
    platform: P,
    lock: Mutex<M, ()>,
    done: Signal<M, ()>,
    state: AtomicU8,
    cleaned: AtomicBool,
    static_buffers: AtomicBool,
    sent: AtomicUsize,
    received: AtomicUsize,
    handler: BlockingMutex<M, Cell<Option<XferHandler>>>,
}

impl<M: RawMutex, P: PlatformBus> Session<M, P> {
    /// Create a session over `platform`. Nothing touches hardware until
    /// [`init`](Self::init).
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            lock: Mutex::new(()),
            done: Signal::new(),
            state: AtomicU8::new(0),
            cleaned: AtomicBool::new(false),
            static_buffers: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            handler: BlockingMutex::new(Cell::new(None)),
        }
    }

    /// De-initializes the bus.
    ///
    /// Unregisters the event router, drops any buffers and handler, and
    /// returns the session to its pristine state.
    pub fn deinit(&self) -> Result<(), BusError<P::Error>> {
        if !self.state().contains(BusState::INITIALIZED) {
            return Err(BusError::PermissionDenied);
        }

        self.platform.reset_handler();
        self.cleanup();
        self.state.store(0, Ordering::SeqCst);

        debug!("bus session deinitialized");
        Ok(())
    }

    /// Lock the bus.
    ///
    /// Waits for the lock, then for the most recent asynchronous transfer to
    /// finish and be cleaned up, so the caller always sees an idle bus.
    ///
    /// # Panics
    ///
    /// Panics if the session is not initialized.
    pub async fn lock<'b>(&self) -> BusGuard<'_, 'b, M, P> {
        assert!(
            self.state().contains(BusState::INITIALIZED),
            "locking an uninitialized bus"
        );

        let guard = self.lock.lock().await;

        // Cleanup clears ASYNC_MODE after XFER_SERVED was raised; waiting
        // for it keeps a late cleanup from wiping our buffers.
        while self.state().contains(BusState::ASYNC_MODE) {
            self.done.wait().await;
        }

        self.state.fetch_or(BusState::LOCKED.bits(), Ordering::SeqCst);
        trace!("bus locked");
        BusGuard::new(self, guard)
    }

    /// Lock the bus if that can be done without waiting.
    ///
    /// Returns [`BusError::WouldBlock`] if another user holds the lock or
    /// an asynchronous transfer is still outstanding.
    pub fn try_lock<'b>(
        &self,
    ) -> Result<BusGuard<'_, 'b, M, P>, BusError<P::Error>> {
        assert!(
            self.state().contains(BusState::INITIALIZED),
            "locking an uninitialized bus"
        );

        let guard = self.lock.try_lock().map_err(|_| BusError::WouldBlock)?;
        if self.state().contains(BusState::ASYNC_MODE) {
            return Err(BusError::WouldBlock);
        }

        self.state.fetch_or(BusState::LOCKED.bits(), Ordering::SeqCst);
        Ok(BusGuard::new(self, guard))
    }

    /// Chains another asynchronous transfer onto the one that just finished,
    /// reusing its buffers and handler.
    ///
    /// Meant to be called from the handler while it processes the terminal
    /// event. Waiters in [`lock`](Self::lock) stay blocked and cleanup is
    /// postponed until the chain ends.
    ///
    /// Fails with [`BusError::PermissionDenied`] unless the previous
    /// transfer was asynchronous, has not been cleaned up yet, and its
    /// buffers were registered as `'static`
    /// ([`BusGuard::set_buffers`] or [`BusGuard::set_fill`]). Fails with
    /// [`BusError::Busy`] while that transfer is still in flight.
    pub fn continue_xfer(&self) -> Result<(), BusError<P::Error>> {
        let state = self.state();
        if !state.contains(BusState::ASYNC_MODE)
            || !self.static_buffers.load(Ordering::SeqCst)
        {
            return Err(BusError::PermissionDenied);
        }
        if state.is_busy() {
            return Err(BusError::Busy);
        }

        self.start_async()
    }

    /// Starts an asynchronous transfer with the buffers and handler already
    /// registered.
    pub(crate) fn start_async(&self) -> Result<(), BusError<P::Error>> {
        debug_assert!(!self.state().is_busy());

        self.done.reset();
        self.cleaned.store(false, Ordering::SeqCst);
        self.state.fetch_and(
            !(BusState::XFER_SERVED | BusState::XFER_ERROR).bits(),
            Ordering::SeqCst,
        );
        self.state.fetch_or(BusState::ASYNC_MODE.bits(), Ordering::SeqCst);

        if let Err(e) = self.platform.do_xfer() {
            // Nothing was started: behave as if a blocking transfer had been
            // served immediately.
            self.state
                .fetch_or(BusState::XFER_SERVED.bits(), Ordering::SeqCst);
            self.state
                .fetch_and(!BusState::ASYNC_MODE.bits(), Ordering::SeqCst);
            debug!("platform rejected async transfer");
            return Err(BusError::Platform(e));
        }

        Ok(())
    }

    /// Aborts the outstanding asynchronous transfer, if any.
    ///
    /// May be called with or without holding the lock, e.g. from a timeout
    /// path. After it returns `Ok` the bus is no longer busy: waiters are
    /// released and, if the bus was already unlocked, cleanup has run. The
    /// user handler is not told about the cancellation.
    pub fn cancel_xfer(&self) -> Result<(), BusError<P::Error>> {
        if !self.state().is_busy() {
            return Ok(());
        }

        self.platform.cancel_xfer().map_err(BusError::Platform)?;

        let prev = BusState::from_bits_retain(
            self.state
                .fetch_or(BusState::XFER_SERVED.bits(), Ordering::SeqCst),
        );
        if prev.contains(BusState::XFER_SERVED) {
            // The terminal event beat us to it and did all the work.
            return Ok(());
        }

        if !prev.contains(BusState::LOCKED)
            && !self.cleaned.swap(true, Ordering::SeqCst)
        {
            self.cleanup();
        }

        warn!("async transfer cancelled");
        self.done.signal(());
        Ok(())
    }

    /// Returns the underlying platform bus, for device specific operations
    /// outside the generic contract (e.g. programming a slave address).
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Snapshot of the state flags.
    pub fn state(&self) -> BusState {
        BusState::from_bits_retain(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flags(&self, flags: BusState) -> BusState {
        BusState::from_bits_retain(
            self.state.fetch_or(flags.bits(), Ordering::SeqCst),
        )
    }

    pub(crate) fn clear_flags(&self, flags: BusState) -> BusState {
        BusState::from_bits_retain(
            self.state.fetch_and(!flags.bits(), Ordering::SeqCst),
        )
    }

    pub(crate) fn set_static_buffers(&self, is_static: bool) {
        self.static_buffers.store(is_static, Ordering::SeqCst);
    }

    pub(crate) fn set_handler(&self, handler: Option<XferHandler>) {
        self.handler.lock(|h| h.set(handler));
    }

    /// Prepares the bookkeeping for a blocking transfer and starts it.
    pub(crate) fn start_blocking(&self) -> Result<(), BusError<P::Error>> {
        self.clear_flags(
            BusState::ASYNC_MODE | BusState::XFER_SERVED | BusState::XFER_ERROR,
        );
        self.done.reset();
        self.sent.store(0, Ordering::SeqCst);
        self.received.store(0, Ordering::SeqCst);

        self.platform.do_xfer().map_err(|e| {
            // Deem the transfer served, there is nothing to wait for.
            self.set_flags(BusState::XFER_SERVED);
            debug!("platform rejected blocking transfer");
            BusError::Platform(e)
        })
    }

    /// Waits for the terminal event of a blocking transfer.
    pub(crate) async fn wait_blocking(
        &self,
    ) -> Result<Transferred, BusError<P::Error>> {
        while !self.state().contains(BusState::XFER_SERVED) {
            self.done.wait().await;
        }

        // Some data may have moved even if the transfer failed.
        let transferred = Transferred {
            sent: self.sent.load(Ordering::SeqCst),
            received: self.received.load(Ordering::SeqCst),
        };

        if self.state().contains(BusState::XFER_ERROR) {
            Err(BusError::Io(transferred))
        } else {
            Ok(transferred)
        }
    }

    /// Releases the lock bit and resolves cleanup.
    pub(crate) fn release(&self) {
        let prev = self.clear_flags(BusState::LOCKED);
        assert!(prev.contains(BusState::LOCKED), "bus is not locked");
        trace!("bus unlocked");

        if prev.contains(BusState::ASYNC_MODE) {
            // The router may be finishing the transfer right now, possibly
            // from an interrupt, so the mutex is of no use here. Whoever
            // flips `cleaned` first does the cleanup.
            if self.state().contains(BusState::XFER_SERVED)
                && !self.cleaned.swap(true, Ordering::SeqCst)
            {
                self.cleanup();
            }
        } else {
            if !prev.contains(BusState::XFER_SERVED) {
                // A blocking transfer was abandoned mid-flight.
                if self.platform.cancel_xfer().is_err() {
                    warn!("failed to cancel abandoned transfer");
                }
                self.set_flags(BusState::XFER_SERVED);
            }
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        self.static_buffers.store(false, Ordering::SeqCst);
        self.platform.reset_buffers();
        self.set_handler(None);
        // Next lock() has nothing to wait for.
        self.clear_flags(BusState::ASYNC_MODE);
    }
}

impl<M, P> Session<M, P>
where
    M: RawMutex + Sync + 'static,
    P: PlatformBus + Sync + 'static,
{
    /// Initializes the bus.
    ///
    /// Registers the session as the platform's event listener and
    /// initializes the platform bus. Calling it again on an initialized
    /// session succeeds without touching the hardware.
    pub fn init(&'static self) -> Result<(), BusError<P::Error>> {
        if self.state().contains(BusState::INITIALIZED) {
            return Ok(());
        }

        self.platform.set_handler(self);

        if let Err(e) = self.platform.init() {
            self.platform.reset_handler();
            warn!("platform bus init failed");
            return Err(BusError::Platform(e));
        }

        // No transfer is outstanding yet.
        self.set_flags(BusState::INITIALIZED | BusState::XFER_SERVED);
        debug!("bus session initialized");
        Ok(())
    }
}

impl<M, P> BusListener for Session<M, P>
where
    M: RawMutex + Sync,
    P: PlatformBus + Sync,
{
    fn on_event(&self, channel: Channel, event: Event, total: usize) {
        let mut last = channel == Channel::Meta && event == Event::Complete;

        if event == Event::Error {
            self.set_flags(BusState::XFER_ERROR);
        }

        if last {
            let prev = self.set_flags(BusState::XFER_SERVED);
            assert!(
                !prev.contains(BusState::XFER_SERVED),
                "duplicate terminal event"
            );
        }

        if self.state().contains(BusState::ASYNC_MODE) {
            if let Some(handler) = self.handler.lock(|h| h.get()) {
                handler(channel, event, total);
            }

            // The handler may have chained another transfer, in which case
            // the bus is busy again and this is no longer the last event.
            let state = self.state();
            last = last && state.contains(BusState::XFER_SERVED);

            if last
                && !state.contains(BusState::LOCKED)
                && !self.cleaned.swap(true, Ordering::SeqCst)
            {
                self.cleanup();
            }
        } else {
            match channel {
                Channel::Tx => self.sent.store(total, Ordering::SeqCst),
                Channel::Rx => self.received.store(total, Ordering::SeqCst),
                Channel::Meta => {}
            }
        }

        if last {
            self.done.signal(());
        }
    }
}
