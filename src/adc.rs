//! A device abstraction that shares one analog-to-digital converter between a
//! high-speed stream and on-demand low-speed reads.
//!
//! See [`Scheduler`] for the full usage example.
//!
//! # How the converter is shared
//!
//! The hardware runs one conversion at a time. The [`Scheduler`] decides what it
//! runs next each time a conversion finishes:
//!
//! - after a low-speed slot, the next pending slot *after* it in the table,
//! - when the table scan runs out, the next chunk of the high-speed stream,
//! - when the stream is stopped, pending slots from the start of the table,
//! - after a stream chunk, or when the converter was idle, pending slots from
//!   the start of the table before the next chunk.
//!
//! With the stream running, it is therefore serviced at least once every
//! `SLOTS + 1` conversions, however busy the low-speed side is.
//!
//! Low-speed results never reach user code from interrupt context: slots are
//! flagged in the interrupt and drained by the scheduler's deferred dispatch,
//! which runs as a [`TimerService`](crate::timer::TimerService) callback.

pub mod broadcast;
pub mod interrupt;
pub mod low_speed;
pub mod scheduler;
pub mod stream;

pub use broadcast::{StreamBroadcast, StreamSubscriber};
pub use interrupt::AdcInterrupt;
pub use low_speed::{
    LowSpeedCallback, LowSpeedReader, LowSpeedReaderStatic, LowSpeedReading, LowSpeedStatus,
};
pub use scheduler::{DISPATCH_PERIOD, Scheduler, SchedulerConfig, SchedulerStatic};
pub use stream::{
    StreamChunk, StreamConfig, StreamConfigError, StreamIsrCallback, StreamNotify, StreamStatus,
};

/// One converted sample.
pub type Sample = u16;

/// Low-speed slots a platform supports at most, whatever its sample rates.
pub const PLATFORM_MAX_LOW_SPEED_SLOTS: usize = 4;

/// Names the input (or set of inputs) a conversion samples.
///
/// The meaning of the number is up to the [`AdcBackend`]; typically a channel
/// index or a channel bit mask.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct Selector(pub u8);

/// When a requested conversion starts.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub enum TriggerMode {
    /// Start converting right away.
    Immediate,
    /// Start on the next tick of the stream's trigger timer.
    NextTick,
}

/// One conversion for the backend to run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct ConversionRequest {
    /// Inputs to sample.
    pub selector: Selector,
    /// Number of samples to produce.
    pub count: usize,
    /// When to start.
    pub trigger: TriggerMode,
}

/// The platform's conversion hardware, as seen by the [`Scheduler`].
///
/// The scheduler never has more than one conversion outstanding. When it
/// finishes, the platform's interrupt handler must report it through
/// [`AdcInterrupt::on_complete`] or [`AdcInterrupt::on_error`], and each tick of
/// the stream trigger through [`AdcInterrupt::on_trigger_tick`].
///
/// Backend methods are called from both task and interrupt context and must not
/// block. `start_conversion` must not report completion synchronously.
pub trait AdcBackend: Sync {
    /// Begin a conversion. Completion is reported later through [`AdcInterrupt`].
    fn start_conversion(&self, request: ConversionRequest);

    /// Samples one conversion of `selector` produces.
    fn samples_per_conversion(&self, selector: Selector) -> usize;

    /// Start the stream's trigger timer at `frequency_hz`.
    fn start_trigger(&self, selector: Selector, frequency_hz: u32);

    /// Stop the stream's trigger timer.
    fn stop_trigger(&self, selector: Selector);

    /// Highest stream frequency the hardware sustains, in Hz.
    fn max_stream_frequency(&self) -> u32;

    /// Whether the next conversion may be started from inside the error interrupt.
    ///
    /// Some hardware revisions cannot restart from their own error interrupt;
    /// those backends return `false` and the scheduler restarts from its
    /// deferred dispatch instead. Queried once, when the scheduler is built.
    fn can_restart_from_error_isr(&self) -> bool {
        true
    }
}

/// Number of low-speed slots that fit between high-speed conversions.
///
/// `(max_sample_rate / max_stream_rate) - 1`, capped at `platform_max` and never
/// below one. Meant for const contexts:
///
/// ```rust
/// use adc_envoy::adc::{PLATFORM_MAX_LOW_SPEED_SLOTS, low_speed_slot_count};
///
/// const SLOTS: usize = low_speed_slot_count(200_000, 50_000, PLATFORM_MAX_LOW_SPEED_SLOTS);
/// assert_eq!(SLOTS, 3);
/// ```
#[must_use]
pub const fn low_speed_slot_count(
    max_sample_rate: u32,
    max_stream_rate: u32,
    platform_max: usize,
) -> usize {
    // A zero stream rate leaves the whole converter to the slots.
    let slots = match max_sample_rate.checked_div(max_stream_rate) {
        Some(ratio) => (ratio as usize).saturating_sub(1),
        None => platform_max,
    };
    let capped = if slots > platform_max { platform_max } else { slots };
    if capped == 0 { 1 } else { capped }
}
