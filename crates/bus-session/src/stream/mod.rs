//! Continuous, double-buffered receive stream with a simple send path.
//!
//! The receive side alternates between two chunks of `N` bytes. The
//! producer (the event router, running in interrupt context) fills one
//! chunk while the consumer drains the other, and never starts receiving
//! into a chunk the consumer has not finished with: such a start is marked
//! pending and issued by the consumer once it releases the chunk.

mod chunk;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use grounded::uninit::GroundedCell;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::BusError;
use crate::platform::{BusListener, Channel, Event, StreamPlatform, TxBuffer};

use self::chunk::Chunk;

/// Buffered byte stream over a platform bus it owns exclusively.
///
/// `N` is the size of each receive chunk and of the transmit buffer.
pub struct StreamReader<M: RawMutex, P: StreamPlatform, const N: usize> {
    platform: P,
    chunks: [Chunk<M, N>; 2],
    consumer: AtomicUsize,
    producer: AtomicUsize,
    tx_buf: GroundedCell<[u8; N]>,
    tx_ready: Signal<M, ()>,
    inited: AtomicBool,
}

impl<M: RawMutex, P: StreamPlatform, const N: usize> StreamReader<M, P, N> {
    /// Capacity of one chunk and of one send.
    pub const CAPACITY: usize = N;

    /// Create a reader over `platform`. Nothing touches hardware until
    /// [`init`](Self::init).
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            chunks: [Chunk::new(), Chunk::new()],
            consumer: AtomicUsize::new(0),
            producer: AtomicUsize::new(0),
            tx_buf: GroundedCell::uninit(),
            tx_ready: Signal::new(),
            inited: AtomicBool::new(false),
        }
    }

    /// Stops the stream and releases the platform bus.
    ///
    /// Unread data is discarded.
    pub fn deinit(&self) -> Result<(), BusError<P::Error>> {
        if !self.inited.swap(false, Ordering::SeqCst) {
            return Err(BusError::PermissionDenied);
        }

        if self.platform.cancel_xfer().is_err() {
            warn!("failed to cancel stream transfer");
        }
        self.platform.reset_buffers();
        self.platform.reset_handler();

        for chunk in &self.chunks {
            chunk.clear();
        }
        self.consumer.store(0, Ordering::SeqCst);
        self.producer.store(0, Ordering::SeqCst);
        self.tx_ready.reset();

        debug!("stream reader deinitialized");
        Ok(())
    }

    /// Receives one byte, waiting for it if none is buffered.
    pub async fn recv_byte(&self) -> Result<u8, BusError<P::Error>> {
        let mut byte = [0u8; 1];
        self.recv_buf(&mut byte).await?;
        Ok(byte[0])
    }

    /// Receives one byte if one is buffered.
    pub fn try_recv_byte(&self) -> Result<u8, BusError<P::Error>> {
        let mut byte = [0u8; 1];
        self.try_recv_buf(&mut byte)?;
        Ok(byte[0])
    }

    /// Receives buffered bytes into `buf`, waiting until at least one is
    /// available.
    ///
    /// Returns how many bytes were stored. This is never more than what the
    /// current chunk holds, so it may be less than `buf.len()` even if more
    /// data is on its way.
    pub async fn recv_buf(
        &self,
        buf: &mut [u8],
    ) -> Result<usize, BusError<P::Error>> {
        self.assert_inited();
        if buf.is_empty() {
            return Ok(0);
        }

        let chunk = self.consumer_chunk();
        if chunk.no_data() {
            self.kick(self.consumer.load(Ordering::Acquire))?;
        }

        // The producer may fill, have drained and fill the chunk again
        // before we look, so a wakeup alone proves nothing.
        while chunk.no_data() {
            chunk.ready.wait().await;
        }

        Ok(self.take(buf))
    }

    /// Receives buffered bytes into `buf` without waiting.
    ///
    /// Fails with [`BusError::WouldBlock`] if nothing is buffered.
    pub fn try_recv_buf(
        &self,
        buf: &mut [u8],
    ) -> Result<usize, BusError<P::Error>> {
        self.assert_inited();
        if buf.is_empty() {
            return Ok(0);
        }

        let chunk = self.consumer_chunk();
        if chunk.no_data() {
            self.kick(self.consumer.load(Ordering::Acquire))?;
            return Err(BusError::WouldBlock);
        }

        Ok(self.take(buf))
    }

    /// Sends one byte, waiting for the transmitter to become free.
    pub async fn send_byte(&self, byte: u8) -> Result<(), BusError<P::Error>> {
        self.send_buf(&[byte]).await.map(|_| ())
    }

    /// Sends one byte if the transmitter is free.
    pub fn try_send_byte(&self, byte: u8) -> Result<(), BusError<P::Error>> {
        self.try_send_buf(&[byte]).map(|_| ())
    }

    /// Queues `buf` for transmission, waiting for the transmitter to become
    /// free.
    ///
    /// At most [`CAPACITY`](Self::CAPACITY) bytes are accepted per call; the
    /// returned count tells how many. Send the remainder with another call.
    pub async fn send_buf(&self, buf: &[u8]) -> Result<usize, BusError<P::Error>> {
        self.assert_inited();
        if buf.is_empty() {
            return Ok(0);
        }

        self.tx_ready.wait().await;
        self.start_tx(buf)
    }

    /// Like [`send_buf`](Self::send_buf), but fails with
    /// [`BusError::WouldBlock`] instead of waiting.
    pub fn try_send_buf(&self, buf: &[u8]) -> Result<usize, BusError<P::Error>> {
        self.assert_inited();
        if buf.is_empty() {
            return Ok(0);
        }

        if self.tx_ready.try_take().is_none() {
            return Err(BusError::WouldBlock);
        }
        self.start_tx(buf)
    }

    /// Returns the underlying platform bus.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn assert_inited(&self) {
        assert!(self.inited.load(Ordering::Acquire), "stream is not initialized");
    }

    fn consumer_chunk(&self) -> &Chunk<M, N> {
        &self.chunks[self.consumer.load(Ordering::Acquire)]
    }

    /// Copies from the consumer chunk and moves on to the other chunk once
    /// this one is used up.
    fn take(&self, buf: &mut [u8]) -> usize {
        let idx = self.consumer.load(Ordering::Acquire);
        let chunk = &self.chunks[idx];
        let count = chunk.consume(buf);

        if chunk.is_depleted() {
            chunk.reset();
            self.consumer.store(idx ^ 1, Ordering::Release);
            // The producer may have found this chunk busy and left the
            // receive for us to start.
            if self.kick(idx).is_err() {
                warn!("failed to start deferred receive");
            }
        }

        count
    }

    /// Starts the receive deferred into chunk `idx`, if any.
    fn kick(&self, idx: usize) -> Result<(), BusError<P::Error>> {
        if !self.chunks[idx].take_pending() {
            return Ok(());
        }

        self.start_rx(idx).map_err(|e| {
            // Try again on the next receive call.
            self.chunks[idx].mark_pending();
            e
        })
    }

    fn start_rx(&self, idx: usize) -> Result<(), BusError<P::Error>> {
        let rx = self.chunks[idx].rx_buffer();
        // SAFETY: The chunk is fresh: the consumer reads nothing from it
        // until the driver reports bytes, and only ever reads bytes already
        // reported. The buffer lives as long as the reader.
        unsafe { self.platform.set_rx(rx) };
        self.platform.do_rx().map_err(BusError::Platform)
    }

    fn start_tx(&self, buf: &[u8]) -> Result<usize, BusError<P::Error>> {
        let count = buf.len().min(N);
        let dst = self.tx_buf.get().cast::<u8>();

        // SAFETY: Holding the tx-ready token means the driver is done with
        // `tx_buf`, and only one token exists.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, count);
            let tx = TxBuffer::Data {
                ptr: core::ptr::NonNull::new_unchecked(dst),
                len: count,
            };
            self.platform.set_tx(tx);
        }

        if let Err(e) = self.platform.do_tx() {
            // Give the token back, nothing is in flight.
            self.tx_ready.signal(());
            return Err(BusError::Platform(e));
        }

        Ok(count)
    }

    fn on_rx(&self, total: usize) {
        let idx = self.producer.load(Ordering::Acquire);
        let chunk = &self.chunks[idx];

        if chunk.produce(total) {
            chunk.ready.signal(());
        }

        if chunk.no_space() {
            let next = idx ^ 1;
            self.producer.store(next, Ordering::Release);

            if self.chunks[next].is_fresh() {
                // Nowhere to report a failure from here; the consumer
                // retries when it runs dry.
                if self.start_rx(next).is_err() {
                    self.chunks[next].mark_pending();
                }
            } else {
                self.chunks[next].mark_pending();
            }
        }
    }
}

impl<M, P, const N: usize> StreamReader<M, P, N>
where
    M: RawMutex + Sync + 'static,
    P: StreamPlatform + Sync + 'static,
{
    /// Starts the stream.
    ///
    /// Initializes the platform bus, registers the reader as its event
    /// listener, and starts receiving into the first chunk.
    ///
    /// # Panics
    ///
    /// Panics if the reader is already initialized.
    pub fn init(&'static self) -> Result<(), BusError<P::Error>> {
        assert!(!self.inited.load(Ordering::Acquire), "stream already initialized");

        self.platform.init().map_err(BusError::Platform)?;
        self.platform.set_handler(self);

        let started = self
            .platform
            .enable_listen_mode()
            .map_err(BusError::Platform)
            .and_then(|()| {
                self.tx_ready.signal(());
                self.start_rx(0)
            });
        if let Err(e) = started {
            self.platform.reset_handler();
            self.tx_ready.reset();
            warn!("stream reader failed to start");
            return Err(e);
        }

        self.inited.store(true, Ordering::Release);
        debug!("stream reader started, {} byte chunks", N);
        Ok(())
    }
}

impl<M, P, const N: usize> BusListener for StreamReader<M, P, N>
where
    M: RawMutex + Sync,
    P: StreamPlatform + Sync,
{
    fn on_event(&self, channel: Channel, event: Event, total: usize) {
        match (channel, event) {
            (Channel::Rx, Event::Complete) => self.on_rx(total),
            (Channel::Tx, Event::Complete) => self.tx_ready.signal(()),
            _ => {}
        }
    }
}
