//! Recording platform bus shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use bus_session::{
    BusListener, Channel, Event, PlatformBus, RxBuffer, StreamPlatform,
    TxBuffer,
};

/// Error returned by the mock when told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError(pub u8);

/// Every driver primitive the code under test invoked, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Init,
    SetHandler,
    ResetHandler,
    ResetBuffers,
    SetTx(TxBuffer),
    SetRx(RxBuffer),
    DoXfer,
    CancelXfer,
    EnableListenMode,
    DoRx,
    DoTx,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    init_results: VecDeque<Result<(), MockError>>,
    xfer_results: VecDeque<Result<(), MockError>>,
    rx_results: VecDeque<Result<(), MockError>>,
    tx_results: VecDeque<Result<(), MockError>>,
    tx: Option<TxBuffer>,
    rx: Option<RxBuffer>,
    rx_pos: usize,
    rx_armed: bool,
}

/// Platform bus double: records calls, fails on demand and plays the
/// interrupt side by firing events at the registered listener.
pub struct MockBus {
    inner: Mutex<Inner>,
    listener: Mutex<Option<&'static dyn BusListener>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), listener: Mutex::new(None) }
    }

    pub fn fail_next_init(&self, e: MockError) {
        self.inner.lock().unwrap().init_results.push_back(Err(e));
    }

    pub fn fail_next_xfer(&self, e: MockError) {
        self.inner.lock().unwrap().xfer_results.push_back(Err(e));
    }

    pub fn fail_next_rx(&self, e: MockError) {
        self.inner.lock().unwrap().rx_results.push_back(Err(e));
    }

    pub fn fail_next_tx(&self, e: MockError) {
        self.inner.lock().unwrap().tx_results.push_back(Err(e));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    /// Raises an event as the interrupt handler would.
    pub fn fire(&self, channel: Channel, event: Event, total: usize) {
        // Copy the listener out: it may call back into the mock.
        let listener = *self.listener.lock().unwrap();
        listener.expect("no listener registered").on_event(channel, event, total);
    }

    /// Ends the current transfer successfully.
    pub fn finish(&self) {
        self.fire(Channel::Meta, Event::Complete, 0);
    }

    /// Writes `data` into the registered receive buffer.
    pub fn write_rx(&self, data: &[u8]) {
        let inner = self.inner.lock().unwrap();
        match inner.rx {
            Some(RxBuffer::Data { ptr, len }) => {
                assert!(data.len() <= len);
                // SAFETY: The session registered this buffer for the
                // running transfer.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        ptr.as_ptr(),
                        data.len(),
                    )
                };
            }
            _ => panic!("no receive buffer registered"),
        }
    }

    /// Receives one byte in listen mode.
    pub fn rx_byte(&self, byte: u8) {
        let total = {
            let mut inner = self.inner.lock().unwrap();
            assert!(inner.rx_armed, "receive not started");
            let (ptr, len) = match inner.rx {
                Some(RxBuffer::Data { ptr, len }) => (ptr, len),
                _ => panic!("no receive buffer registered"),
            };
            let pos = inner.rx_pos;
            assert!(pos < len);
            // SAFETY: In bounds of the registered receive buffer.
            unsafe { ptr.as_ptr().add(pos).write(byte) };
            inner.rx_pos += 1;
            if inner.rx_pos == len {
                inner.rx_armed = false;
            }
            inner.rx_pos
        };
        self.fire(Channel::Rx, Event::Complete, total);
    }

    /// Whether a receive is running in listen mode.
    pub fn rx_armed(&self) -> bool {
        self.inner.lock().unwrap().rx_armed
    }

    /// Bytes of the registered transmit buffer.
    pub fn tx_data(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        match inner.tx {
            Some(TxBuffer::Data { ptr, len }) => {
                // SAFETY: The transmit buffer stays valid while registered.
                unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }
                    .to_vec()
            }
            Some(TxBuffer::Fill { len, byte }) => vec![byte; len],
            _ => Vec::new(),
        }
    }

    /// Address of the registered transmit buffer, if it refers to memory.
    pub fn tx_addr(&self) -> Option<usize> {
        match self.inner.lock().unwrap().tx {
            Some(TxBuffer::Data { ptr, .. }) => Some(ptr.as_ptr() as usize),
            _ => None,
        }
    }

    /// Address of the registered receive buffer, if any.
    pub fn rx_addr(&self) -> Option<usize> {
        match self.inner.lock().unwrap().rx {
            Some(RxBuffer::Data { ptr, .. }) => Some(ptr.as_ptr() as usize),
            _ => None,
        }
    }

    /// Completes the current send.
    pub fn finish_tx(&self) {
        let len = self.inner.lock().unwrap().tx.map_or(0, |tx| tx.len());
        self.fire(Channel::Tx, Event::Complete, len);
    }

    /// Yields until `call` was recorded at least `n` times.
    pub async fn wait_for(&self, call: Call, n: usize) {
        while self.count(call) < n {
            embassy_futures::yield_now().await;
        }
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

impl PlatformBus for MockBus {
    type Error = MockError;

    fn init(&self) -> Result<(), MockError> {
        self.record(Call::Init);
        self.inner.lock().unwrap().init_results.pop_front().unwrap_or(Ok(()))
    }

    fn set_handler(&self, listener: &'static dyn BusListener) {
        self.record(Call::SetHandler);
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn reset_handler(&self) {
        self.record(Call::ResetHandler);
        *self.listener.lock().unwrap() = None;
    }

    fn reset_buffers(&self) {
        self.record(Call::ResetBuffers);
        let mut inner = self.inner.lock().unwrap();
        inner.tx = None;
        inner.rx = None;
    }

    unsafe fn set_tx(&self, tx: TxBuffer) {
        self.record(Call::SetTx(tx));
        self.inner.lock().unwrap().tx = Some(tx);
    }

    unsafe fn set_rx(&self, rx: RxBuffer) {
        self.record(Call::SetRx(rx));
        let mut inner = self.inner.lock().unwrap();
        inner.rx = Some(rx);
        inner.rx_pos = 0;
    }

    fn do_xfer(&self) -> Result<(), MockError> {
        self.record(Call::DoXfer);
        self.inner.lock().unwrap().xfer_results.pop_front().unwrap_or(Ok(()))
    }

    fn cancel_xfer(&self) -> Result<(), MockError> {
        self.record(Call::CancelXfer);
        self.inner.lock().unwrap().rx_armed = false;
        Ok(())
    }
}

impl StreamPlatform for MockBus {
    fn enable_listen_mode(&self) -> Result<(), MockError> {
        self.record(Call::EnableListenMode);
        Ok(())
    }

    fn do_rx(&self) -> Result<(), MockError> {
        self.record(Call::DoRx);
        let mut inner = self.inner.lock().unwrap();
        let result = inner.rx_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            inner.rx_armed = true;
        }
        result
    }

    fn do_tx(&self) -> Result<(), MockError> {
        self.record(Call::DoTx);
        self.inner.lock().unwrap().tx_results.pop_front().unwrap_or(Ok(()))
    }
}

/// Gives a value the `'static` lifetime sessions and handlers need.
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Like [`leak`], for buffers handed out mutably.
pub fn leak_mut<T>(value: T) -> &'static mut T {
    Box::leak(Box::new(value))
}
