//! The low-speed slot pool: one-shot conversion requests served between stream chunks.
//!
//! See [`LowSpeedReader`] for waiting on a reading and
//! [`Scheduler::start_low_speed`](super::Scheduler::start_low_speed) for a
//! callback instead.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use portable_atomic::{AtomicU32, Ordering};

use super::scheduler::Scheduler;
use super::{AdcBackend, ConversionRequest, Sample, Selector, TriggerMode};
use crate::{Error, Result};

/// How a low-speed conversion ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub enum LowSpeedStatus {
    /// Samples were delivered.
    Ok,
    /// The hardware reported an error; `samples` is empty.
    Error,
}

/// The result of one low-speed conversion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LowSpeedReading<const MAX_SAMPLES: usize> {
    /// Inputs that were sampled.
    pub selector: Selector,
    /// How the conversion ended.
    pub status: LowSpeedStatus,
    /// The converted samples.
    pub samples: Vec<Sample, MAX_SAMPLES>,
}

impl<const MAX_SAMPLES: usize> LowSpeedReading<MAX_SAMPLES> {
    /// The samples, or [`Error::Conversion`] if the hardware failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] when `status` is [`LowSpeedStatus::Error`].
    pub fn into_result(self) -> Result<Vec<Sample, MAX_SAMPLES>> {
        match self.status {
            LowSpeedStatus::Ok => Ok(self.samples),
            LowSpeedStatus::Error => Err(Error::Conversion),
        }
    }
}

/// Receives a low-speed reading. Runs in the timer service's dispatcher task,
/// never in interrupt context.
pub trait LowSpeedCallback<const MAX_SAMPLES: usize>: Sync {
    /// Called once per request with the finished reading.
    fn on_reading(&self, reading: LowSpeedReading<MAX_SAMPLES>);
}

impl<F, const MAX_SAMPLES: usize> LowSpeedCallback<MAX_SAMPLES> for F
where
    F: Fn(LowSpeedReading<MAX_SAMPLES>) + Sync,
{
    fn on_reading(&self, reading: LowSpeedReading<MAX_SAMPLES>) {
        self(reading);
    }
}

/// A reading tagged with the request it answers.
pub(crate) struct Delivery<const MAX_SAMPLES: usize> {
    ticket: u32,
    reading: LowSpeedReading<MAX_SAMPLES>,
}

/// Static resources for a [`LowSpeedReader`]: its private completion signal
/// and the ticket of the read it is waiting on.
pub struct LowSpeedReaderStatic<const MAX_SAMPLES: usize> {
    signal: Signal<CriticalSectionRawMutex, Delivery<MAX_SAMPLES>>,
    expected: AtomicU32,
}

impl<const MAX_SAMPLES: usize> LowSpeedReaderStatic<MAX_SAMPLES> {
    /// Create static resources for a low-speed reader.
    #[must_use]
    pub const fn new_static() -> Self {
        Self {
            signal: Signal::new(),
            expected: AtomicU32::new(u32::MAX),
        }
    }

    /// Signals `delivery` only if the reader still waits for its ticket.
    fn offer(&self, delivery: Delivery<MAX_SAMPLES>) {
        if self.expected.load(Ordering::Acquire) == delivery.ticket {
            self.signal.signal(delivery);
        } else {
            trace!("LowSpeedReaderStatic::offer: dropped reading {}", delivery.ticket);
        }
    }
}

/// Where a finished slot's reading goes.
#[derive(Clone, Copy)]
pub(crate) enum Completion<const MAX_SAMPLES: usize> {
    Callback(&'static dyn LowSpeedCallback<MAX_SAMPLES>),
    Waiter {
        reader: &'static LowSpeedReaderStatic<MAX_SAMPLES>,
        ticket: u32,
    },
}

impl<const MAX_SAMPLES: usize> Completion<MAX_SAMPLES> {
    pub(crate) fn deliver(self, reading: LowSpeedReading<MAX_SAMPLES>) {
        match self {
            Self::Callback(callback) => callback.on_reading(reading),
            Self::Waiter { reader, ticket } => reader.offer(Delivery { ticket, reading }),
        }
    }
}

// ============================================================================
// Slot table
// ============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Free,
    Active,
    Done,
    Error,
}

struct LowSpeedSlot<const MAX_SAMPLES: usize> {
    state: SlotState,
    selector: Selector,
    count: usize,
    completion: Option<Completion<MAX_SAMPLES>>,
    samples: Vec<Sample, MAX_SAMPLES>,
}

impl<const MAX_SAMPLES: usize> LowSpeedSlot<MAX_SAMPLES> {
    const fn new() -> Self {
        Self {
            state: SlotState::Free,
            selector: Selector(0),
            count: 0,
            completion: None,
            samples: Vec::new(),
        }
    }
}

/// The fixed table of low-speed slots.
///
/// Slots go Free → Active when installed (the caller holds an admission
/// permit), Active → Done/Error from the interrupt path, and Done/Error → Free
/// when the deferred dispatch takes them.
pub(crate) struct SlotTable<const SLOTS: usize, const MAX_SAMPLES: usize> {
    slots: [LowSpeedSlot<MAX_SAMPLES>; SLOTS],
}

impl<const SLOTS: usize, const MAX_SAMPLES: usize> SlotTable<SLOTS, MAX_SAMPLES> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { LowSpeedSlot::new() }; SLOTS],
        }
    }

    /// Claims a free slot. `None` only if the caller skipped admission.
    pub(crate) fn install(
        &mut self,
        selector: Selector,
        count: usize,
        completion: Completion<MAX_SAMPLES>,
    ) -> Option<usize> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Free)?;
        slot.state = SlotState::Active;
        slot.selector = selector;
        slot.count = count;
        slot.completion = Some(completion);
        slot.samples.clear();
        Some(index)
    }

    /// First slot at or after `from` (and before `until`) waiting for the hardware.
    pub(crate) fn next_active(&self, from: usize, until: usize) -> Option<usize> {
        self.slots
            .get(from..until.min(SLOTS))?
            .iter()
            .position(|slot| slot.state == SlotState::Active)
            .map(|position| from.saturating_add(position))
    }

    pub(crate) fn request(&self, index: usize) -> Option<ConversionRequest> {
        let slot = self.slots.get(index)?;
        Some(ConversionRequest {
            selector: slot.selector,
            count: slot.count,
            trigger: TriggerMode::Immediate,
        })
    }

    /// Marks an active slot Done (with samples) or Error (with `None`).
    pub(crate) fn finish(&mut self, index: usize, samples: Option<&[Sample]>) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.state != SlotState::Active {
            return;
        }
        match samples {
            Some(samples) => {
                let count = samples.len().min(slot.count).min(MAX_SAMPLES);
                slot.samples.clear();
                // Cannot fail: `count` is capped at the capacity.
                let _ = slot
                    .samples
                    .extend_from_slice(samples.get(..count).unwrap_or_default());
                slot.state = SlotState::Done;
            }
            None => slot.state = SlotState::Error,
        }
    }

    /// Frees the first Done or Error slot at or after `from` and returns its
    /// index, completion target and reading.
    pub(crate) fn take_finished(
        &mut self,
        from: usize,
    ) -> Option<(usize, Completion<MAX_SAMPLES>, LowSpeedReading<MAX_SAMPLES>)> {
        let (position, slot) = self
            .slots
            .get_mut(from..)?
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot.state, SlotState::Done | SlotState::Error))?;
        let status = if slot.state == SlotState::Done {
            LowSpeedStatus::Ok
        } else {
            LowSpeedStatus::Error
        };
        let reading = LowSpeedReading {
            selector: slot.selector,
            status,
            samples: core::mem::take(&mut slot.samples),
        };
        let completion = slot.completion.take()?;
        slot.state = SlotState::Free;
        Some((from.saturating_add(position), completion, reading))
    }

    #[cfg(all(test, feature = "host"))]
    fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }
}

// ============================================================================
// LowSpeedReader
// ============================================================================

/// Takes low-speed readings and waits for them.
///
/// Each reader owns a private completion signal (its [`LowSpeedReaderStatic`]),
/// so several readers in different tasks can wait at the same time. When every
/// slot is busy, [`read`](Self::read) waits for one to free up.
///
/// # Example
///
/// ```rust,ignore
/// use adc_envoy::adc::{LowSpeedReader, LowSpeedReaderStatic, Selector};
///
/// async fn battery_task(scheduler: &'static MyScheduler) -> adc_envoy::Result<()> {
///     static READER_STATIC: LowSpeedReaderStatic<4> = LowSpeedReaderStatic::new_static();
///     let mut reader = LowSpeedReader::new(scheduler, &READER_STATIC);
///     loop {
///         let samples = reader.read(Selector(3)).await?;
///         defmt::info!("battery: {}", samples[0]);
///         embassy_time::Timer::after_secs(10).await;
///     }
/// }
/// ```
pub struct LowSpeedReader<'a, B, const SLOTS: usize, const MAX_SAMPLES: usize>
where
    B: AdcBackend + 'static,
{
    scheduler: &'a Scheduler<B, SLOTS, MAX_SAMPLES>,
    reader_static: &'static LowSpeedReaderStatic<MAX_SAMPLES>,
    next_ticket: u32,
}

impl<'a, B, const SLOTS: usize, const MAX_SAMPLES: usize> LowSpeedReader<'a, B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    /// Create a reader. Give each reader its own [`LowSpeedReaderStatic`].
    #[must_use]
    pub const fn new(
        scheduler: &'a Scheduler<B, SLOTS, MAX_SAMPLES>,
        reader_static: &'static LowSpeedReaderStatic<MAX_SAMPLES>,
    ) -> Self {
        Self {
            scheduler,
            reader_static,
            next_ticket: 0,
        }
    }

    /// Convert `selector` once and return the samples.
    ///
    /// Waits for a free slot, then for the conversion and the deferred dispatch
    /// that frees the slot. Dropping the future does not cancel the conversion;
    /// its slot is freed normally and the orphaned reading is discarded when
    /// dispatched, without disturbing a later read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conversion`] if the hardware failed, or
    /// [`Error::TooManySamples`] if a conversion of `selector` does not fit in
    /// `MAX_SAMPLES`.
    pub async fn read(&mut self, selector: Selector) -> Result<Vec<Sample, MAX_SAMPLES>> {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        let reader = self.reader_static;
        // From here on, readings for earlier tickets are dropped at dispatch.
        reader.expected.store(ticket, Ordering::Release);
        reader.signal.reset();

        self.scheduler
            .acquire_low_speed(selector, Completion::Waiter { reader, ticket })
            .await?;

        loop {
            let delivery = reader.signal.wait().await;
            if delivery.ticket == ticket {
                return delivery.reading.into_result();
            }
        }
    }
}
