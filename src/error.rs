use derive_more::{Display, Error, From};
use embassy_executor::SpawnError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors reported by the sampling scheduler and the timer service.
#[derive(Debug, Display, Error, From)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub enum Error {
    /// The hardware reported an error for this conversion; no samples were delivered.
    #[display("hardware conversion failed")]
    Conversion,

    /// Every low-speed slot is in use.
    #[display("no low-speed slot available")]
    NoSlotAvailable,

    /// The requested conversion needs more samples than a slot can hold.
    #[display("conversion needs {needed} samples but a slot holds {capacity}")]
    TooManySamples {
        /// Samples the backend produces for the selector.
        needed: usize,
        /// Samples a low-speed slot can hold.
        capacity: usize,
    },

    /// The high-speed stream cannot be reconfigured while it is running.
    #[display("high-speed stream is active")]
    StreamActive,

    /// The high-speed stream has not been configured.
    #[display("high-speed stream is not configured")]
    StreamNotConfigured,

    /// The stream frequency is zero or above what the backend supports.
    #[display("stream frequency {requested} Hz outside 1..={max} Hz")]
    FrequencyOutOfRange {
        /// Requested frequency in Hz.
        requested: u32,
        /// Maximum frequency in Hz.
        max: u32,
    },

    /// The stream buffer or chunk length is empty, too small, or not a whole number of conversions.
    #[display("invalid stream buffer or chunk length")]
    InvalidStreamBuffer,

    /// Every timer entry is in use.
    #[display("timer capacity exhausted")]
    TimerCapacity,

    /// The timer was destroyed; its id no longer names a live entry.
    #[display("stale timer id")]
    StaleTimer,

    /// The stream broadcast has no free subscriber slots.
    #[display("no stream subscriber slot available")]
    TooManySubscribers,

    /// The dispatcher task could not be spawned.
    #[display("task spawn failed: {_0:?}")]
    #[from]
    TaskSpawn(#[error(not(source))] SpawnError),
}
