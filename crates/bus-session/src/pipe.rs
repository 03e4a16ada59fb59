use core::ptr::NonNull;

use embassy_sync::blocking_mutex::raw::RawMutex;
use grounded::uninit::GroundedCell;

use crate::error::{BusError, Transferred};
use crate::platform::{PlatformBus, RxBuffer, TxBuffer};
use crate::session::Session;

/// Blocking byte pipe over a [`Session`].
///
/// Every call locks the bus, moves the data in one direction and unlocks
/// it again. Data passes through an internal buffer of `N` bytes, one
/// transfer per `N` bytes, so the driver never sees caller memory.
pub struct Pipe<M: RawMutex + 'static, P: PlatformBus + 'static, const N: usize>
{
    session: &'static Session<M, P>,
    buf: GroundedCell<[u8; N]>,
}

impl<M: RawMutex + 'static, P: PlatformBus + 'static, const N: usize>
    Pipe<M, P, N>
{
    /// Create a pipe over `session`.
    pub const fn new(session: &'static Session<M, P>) -> Self {
        assert!(N > 0, "pipe buffer must not be empty");
        Self { session, buf: GroundedCell::uninit() }
    }

    /// Writes `data` to the bus.
    ///
    /// Returns the number of bytes sent, which is less than `data.len()` if
    /// the driver stopped early. If a transfer fails midway the count so far
    /// is carried by [`BusError::Io`].
    pub async fn write(
        &'static self,
        data: &[u8],
    ) -> Result<usize, BusError<P::Error>> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut bus = self.session.lock().await;
        let mut sent = 0;

        for chunk in data.chunks(N) {
            // SAFETY: The buffer is only touched by the lock holder, and the
            // driver let go of it when the previous transfer ended.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    self.buf_ptr().as_ptr(),
                    chunk.len(),
                );
            }

            let tx = TxBuffer::Data { ptr: self.buf_ptr(), len: chunk.len() };
            // SAFETY: `buf` lives as long as the pipe, which is `'static`.
            unsafe { bus.register(tx, RxBuffer::None, true)? };

            let count = match bus.xfer().await {
                Ok(t) => t.sent.min(chunk.len()),
                Err(BusError::Io(t)) => {
                    return Err(BusError::Io(Transferred {
                        sent: sent + t.sent.min(chunk.len()),
                        received: 0,
                    }));
                }
                Err(e) => return Err(e),
            };

            sent += count;
            if count < chunk.len() {
                break;
            }
        }

        Ok(sent)
    }

    /// Reads into `buf` from the bus.
    ///
    /// Returns the number of bytes stored, which may be less than
    /// `buf.len()` if the driver stopped early. Bytes received before a
    /// failure are stored as well and counted by [`BusError::Io`].
    pub async fn read(
        &'static self,
        buf: &mut [u8],
    ) -> Result<usize, BusError<P::Error>> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut bus = self.session.lock().await;
        let mut received = 0;

        for chunk in buf.chunks_mut(N) {
            let rx = RxBuffer::Data { ptr: self.buf_ptr(), len: chunk.len() };
            // SAFETY: `buf` lives as long as the pipe, which is `'static`.
            unsafe { bus.register(TxBuffer::None, rx, true)? };

            let (count, failed) = match bus.xfer().await {
                Ok(t) => (t.received.min(chunk.len()), false),
                Err(BusError::Io(t)) => (t.received.min(chunk.len()), true),
                Err(e) => return Err(e),
            };

            // SAFETY: The transfer is over and the driver reported `count`
            // bytes written to the buffer.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.buf_ptr().as_ptr(),
                    chunk.as_mut_ptr(),
                    count,
                );
            }
            received += count;

            if failed {
                return Err(BusError::Io(Transferred { sent: 0, received }));
            }
            if count < chunk.len() {
                break;
            }
        }

        Ok(received)
    }

    /// Returns the session this pipe runs on.
    pub fn session(&self) -> &'static Session<M, P> {
        self.session
    }

    fn buf_ptr(&self) -> NonNull<u8> {
        // SAFETY: Points into `self.buf`, which is never null.
        unsafe { NonNull::new_unchecked(self.buf.get().cast::<u8>()) }
    }
}

impl<M, P, const N: usize> Pipe<M, P, N>
where
    M: RawMutex + Sync + 'static,
    P: PlatformBus + Sync + 'static,
{
    /// Initializes the underlying session.
    pub fn init(&self) -> Result<(), BusError<P::Error>> {
        self.session.init()
    }
}
