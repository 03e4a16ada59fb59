/// Byte counts reported for a single transfer, per sub-channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transferred {
    /// Bytes pushed out on the transmit channel.
    pub sent: usize,
    /// Bytes stored from the receive channel.
    pub received: usize,
}

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError<E: core::fmt::Debug> {
    /// Neither a transmit nor a receive buffer was supplied, or a size
    /// exceeds the buffer it describes.
    InvalidArgument,
    /// An asynchronous transfer is still in flight.
    Busy,
    /// The operation would have to wait.
    WouldBlock,
    /// The transfer started but its terminal event carried the error flag.
    /// Counts of whatever was moved before the failure are preserved.
    Io(Transferred),
    /// The operation is not allowed in the current lifecycle state.
    PermissionDenied,
    /// Failure reported by the platform bus driver, passed through as is.
    Platform(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for BusError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BusError::InvalidArgument => write!(f, "invalid argument"),
            BusError::Busy => write!(f, "bus is busy"),
            BusError::WouldBlock => write!(f, "operation would block"),
            BusError::Io(t) => write!(
                f,
                "transfer failed after {} byte(s) sent, {} received",
                t.sent, t.received
            ),
            BusError::PermissionDenied => {
                write!(f, "operation not permitted in this state")
            }
            BusError::Platform(e) => write!(f, "platform bus error: {:?}", e),
        }
    }
}
