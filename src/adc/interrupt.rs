//! The interrupt-context surface of the [`Scheduler`].
//!
//! Platform interrupt handlers hold an [`AdcInterrupt`] rather than the
//! scheduler itself, so they can only report hardware events.

use super::scheduler::Scheduler;
use super::{AdcBackend, Sample};

/// Reports hardware events to a [`Scheduler`]. Every method is non-blocking and
/// safe to call from an interrupt handler.
pub struct AdcInterrupt<'a, B, const SLOTS: usize, const MAX_SAMPLES: usize>
where
    B: AdcBackend + 'static,
{
    scheduler: &'a Scheduler<B, SLOTS, MAX_SAMPLES>,
}

impl<B, const SLOTS: usize, const MAX_SAMPLES: usize> Clone for AdcInterrupt<'_, B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<B, const SLOTS: usize, const MAX_SAMPLES: usize> Copy for AdcInterrupt<'_, B, SLOTS, MAX_SAMPLES> where
    B: AdcBackend + 'static
{
}

impl<'a, B, const SLOTS: usize, const MAX_SAMPLES: usize> AdcInterrupt<'a, B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    pub(crate) const fn new(scheduler: &'a Scheduler<B, SLOTS, MAX_SAMPLES>) -> Self {
        Self { scheduler }
    }

    /// The outstanding conversion finished with `samples`.
    ///
    /// Stores the result, fans stream chunks out, and starts the next
    /// conversion before returning.
    pub fn on_complete(&self, samples: &[Sample]) {
        self.scheduler.complete(samples);
    }

    /// The outstanding conversion failed. Its unit of work is dropped, not
    /// retried.
    pub fn on_error(&self) {
        self.scheduler.fail();
    }

    /// The stream trigger timer ticked.
    pub fn on_trigger_tick(&self) {
        self.scheduler.trigger_tick();
    }
}
