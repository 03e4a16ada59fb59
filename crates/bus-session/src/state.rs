use bitflags::bitflags;

bitflags! {
    /// Session state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusState: u8 {
        /// Platform bus is initialized.
        const INITIALIZED = 0x01;
        /// Most recent transfer was started with an event handler.
        const ASYNC_MODE = 0x02;
        /// Lock is held. Read by the router to learn that unlock happened.
        const LOCKED = 0x04;
        /// Terminal event of the most recent transfer was delivered.
        const XFER_SERVED = 0x08;
        /// An error event was seen during the most recent transfer.
        const XFER_ERROR = 0x10;
    }
}

impl BusState {
    /// An asynchronous transfer is still waiting for its terminal event.
    pub fn is_busy(self) -> bool {
        self.contains(Self::ASYNC_MODE) && !self.contains(Self::XFER_SERVED)
    }
}

impl Default for BusState {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BusState {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BusState({=u8:#04x})", self.bits())
    }
}
