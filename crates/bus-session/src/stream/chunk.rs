use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use grounded::uninit::GroundedCell;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::platform::RxBuffer;

/// One half of the receive double buffer.
///
/// `end` and `pending` are raised by the producer (the event router),
/// `start` is advanced by the consumer. `end >= start` always holds.
pub(crate) struct Chunk<M: RawMutex, const N: usize> {
    data: GroundedCell<[u8; N]>,
    start: AtomicUsize,
    end: AtomicUsize,
    pending: AtomicBool,
    pub(crate) ready: Signal<M, ()>,
}

impl<M: RawMutex, const N: usize> Chunk<M, N> {
    pub(crate) const fn new() -> Self {
        Self {
            data: GroundedCell::uninit(),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            ready: Signal::new(),
        }
    }

    /// Markers were reset and no receive is waiting to start.
    pub(crate) fn is_fresh(&self) -> bool {
        self.start.load(Ordering::Acquire) == 0
            && self.end.load(Ordering::Acquire) == 0
            && !self.pending.load(Ordering::Acquire)
    }

    /// Consumer has read the whole capacity; nothing more can arrive.
    pub(crate) fn is_depleted(&self) -> bool {
        self.start.load(Ordering::Acquire) == N
    }

    /// Nothing left to read right now.
    pub(crate) fn no_data(&self) -> bool {
        self.start.load(Ordering::Acquire) == self.end.load(Ordering::Acquire)
    }

    /// Producer filled the whole capacity.
    pub(crate) fn no_space(&self) -> bool {
        self.end.load(Ordering::Acquire) == N
    }

    /// Descriptor of the whole chunk for the driver.
    pub(crate) fn rx_buffer(&self) -> RxBuffer {
        // SAFETY: Points into `self.data`, which is never null.
        let ptr = unsafe {
            core::ptr::NonNull::new_unchecked(self.data.get().cast::<u8>())
        };
        RxBuffer::Data { ptr, len: N }
    }

    /// Producer side: the driver reported `total` bytes in this chunk.
    ///
    /// Returns `true` if the chunk was empty before, i.e. the consumer may be
    /// waiting for it.
    pub(crate) fn produce(&self, total: usize) -> bool {
        let end = self.end.load(Ordering::Acquire);
        debug_assert!(total >= end && total <= N);

        let was_empty = self.start.load(Ordering::Acquire) == end;
        self.end.store(total.min(N), Ordering::Release);
        was_empty
    }

    /// Producer side: defers the next receive into this chunk to the consumer.
    pub(crate) fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consumer side: takes the deferred receive, if one was requested.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Consumer side: copies unread bytes into `buf` and advances `start`.
    pub(crate) fn consume(&self, buf: &mut [u8]) -> usize {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        let count = buf.len().min(end - start);

        // SAFETY: Bytes in `start..end` were written by the driver and are
        // never written again until the consumer resets the chunk, so
        // reading them races with nobody.
        let src = unsafe {
            core::slice::from_raw_parts(
                self.data.get().cast::<u8>().add(start),
                count,
            )
        };
        buf[..count].copy_from_slice(src);

        self.start.store(start + count, Ordering::Release);
        count
    }

    /// Consumer side: returns a depleted chunk to the fresh state.
    pub(crate) fn reset(&self) {
        // `start` goes first so that `end >= start` holds throughout.
        self.start.store(0, Ordering::Release);
        self.end.store(0, Ordering::Release);
    }

    /// Forgets everything, including a deferred receive.
    pub(crate) fn clear(&self) {
        self.reset();
        self.pending.store(false, Ordering::Release);
        self.ready.reset();
    }
}
