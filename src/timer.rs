//! A software timer service: scheduled callbacks for many consumers from one dispatcher task.
//!
//! Each consumer creates a [`TimerId`] once and then starts, stops, or jabs it. All
//! entries live in a fixed arena inside the [`TimerService`], so ids never dangle:
//! a destroyed entry bumps its generation and old ids are rejected with
//! [`Error::StaleTimer`].
//!
//! Callbacks run in task context, one at a time, outside the service's lock, so a
//! callback may freely start, stop, or jab timers (including its own).
//!
//! # Example
//!
//! ```rust,ignore
//! use adc_envoy::timer::{TimerMode, TimerPeriod, TimerService};
//! use embassy_time::Duration;
//!
//! static TIMERS: TimerService = TimerService::new();
//!
//! async fn example(spawner: embassy_executor::Spawner) -> adc_envoy::Result<()> {
//!     TIMERS.spawn(spawner)?;
//!
//!     let blink = TIMERS.create()?;
//!     TIMERS.start(
//!         blink,
//!         &|| defmt::info!("blink"),
//!         TimerMode::Periodic,
//!         TimerPeriod::After(Duration::from_millis(500)),
//!     )?;
//!     Ok(())
//! }
//! ```

use core::cell::RefCell;

use embassy_futures::select::select;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::{Error, Result};

/// Number of timer entries a [`TimerService`] can hold.
pub const MAX_TIMERS: usize = 16;

const _: () = assert!(MAX_TIMERS <= u8::MAX as usize, "timer indexes are stored as u8");

// ============================================================================
// Public types
// ============================================================================

/// Work run by the dispatcher when a timer fires.
///
/// Implemented for any `Fn() + Sync` closure, so `&|| { ... }` and references to
/// `'static` state objects both work.
pub trait TimerCallback: Sync {
    /// Called from the dispatcher task when the timer fires.
    fn on_timer(&self);
}

impl<F> TimerCallback for F
where
    F: Fn() + Sync,
{
    fn on_timer(&self) {
        self();
    }
}

/// The interrupt-safe part of a timer service.
///
/// Interrupt handlers hold a `&'static dyn TimerJabber` instead of the full
/// service so they can only jab, never start, stop, or destroy.
pub trait TimerJabber: Sync {
    /// Ask the dispatcher to fire `id` on its next pass. Never blocks.
    ///
    /// Returns `false` if `id` is stale.
    fn jab_from_interrupt(&self, id: TimerId) -> bool;
}

/// Handle to one entry in a [`TimerService`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct TimerId {
    index: u8,
    generation: u16,
}

/// Whether a timer fires once or keeps firing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub enum TimerMode {
    /// Fire once, then return to idle.
    OneShot,
    /// Fire every period until stopped.
    Periodic,
}

/// When a started timer becomes due.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub enum TimerPeriod {
    /// Due this long after starting (and, if periodic, every this long after that).
    After(Duration),
    /// Never due by itself; fires only when jabbed.
    Infinite,
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Clone, Copy)]
enum Due {
    At(Instant),
    Never,
}

#[derive(Clone, Copy)]
struct TimerEntry {
    generation: u16,
    allocated: bool,
    scheduled: bool,
    jabbed: bool,
    mode: TimerMode,
    period: Duration,
    due: Due,
    callback: Option<&'static dyn TimerCallback>,
    prev: Option<u8>,
    next: Option<u8>,
}

impl TimerEntry {
    const EMPTY: Self = Self {
        generation: 0,
        allocated: false,
        scheduled: false,
        jabbed: false,
        mode: TimerMode::OneShot,
        period: Duration::from_ticks(0),
        due: Due::Never,
        callback: None,
        prev: None,
        next: None,
    };
}

/// What the dispatcher should do after one walk of the list.
enum Step {
    Fire(&'static dyn TimerCallback),
    Sleep(Option<Instant>),
}

/// Entries plus a doubly-linked list (by index) of the scheduled ones, in start order.
struct TimerTable {
    entries: [TimerEntry; MAX_TIMERS],
    head: Option<u8>,
    tail: Option<u8>,
}

impl TimerTable {
    const fn new() -> Self {
        Self {
            entries: [TimerEntry::EMPTY; MAX_TIMERS],
            head: None,
            tail: None,
        }
    }

    fn entry_mut(&mut self, id: TimerId) -> Result<&mut TimerEntry> {
        self.entries
            .get_mut(usize::from(id.index))
            .filter(|entry| entry.allocated && entry.generation == id.generation)
            .ok_or(Error::StaleTimer)
    }

    fn allocate(&mut self) -> Result<TimerId> {
        let (index, entry) = self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, entry)| !entry.allocated)
            .ok_or(Error::TimerCapacity)?;
        let generation = entry.generation;
        *entry = TimerEntry {
            generation,
            allocated: true,
            ..TimerEntry::EMPTY
        };
        let index = u8::try_from(index).map_err(|_| Error::TimerCapacity)?;
        Ok(TimerId { index, generation })
    }

    fn release(&mut self, id: TimerId) -> Result<()> {
        self.entry_mut(id)?;
        self.unlink(id.index);
        if let Some(entry) = self.entries.get_mut(usize::from(id.index)) {
            entry.allocated = false;
            entry.callback = None;
            entry.generation = entry.generation.wrapping_add(1);
        }
        Ok(())
    }

    fn link_tail(&mut self, index: u8) {
        let old_tail = self.tail;
        if let Some(entry) = self.entries.get_mut(usize::from(index)) {
            entry.prev = old_tail;
            entry.next = None;
            entry.scheduled = true;
        }
        match old_tail.and_then(|tail| self.entries.get_mut(usize::from(tail))) {
            Some(tail_entry) => tail_entry.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    /// Unlinks `index` if it is scheduled; a no-op otherwise.
    fn unlink(&mut self, index: u8) {
        let Some(entry) = self.entries.get_mut(usize::from(index)) else {
            return;
        };
        if !entry.scheduled {
            return;
        }
        let (prev, next) = (entry.prev, entry.next);
        entry.scheduled = false;
        entry.jabbed = false;
        entry.prev = None;
        entry.next = None;

        match prev.and_then(|prev| self.entries.get_mut(usize::from(prev))) {
            Some(prev_entry) => prev_entry.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| self.entries.get_mut(usize::from(next))) {
            Some(next_entry) => next_entry.prev = prev,
            None => self.tail = prev,
        }
    }

    fn start(
        &mut self,
        id: TimerId,
        callback: &'static dyn TimerCallback,
        mode: TimerMode,
        period: TimerPeriod,
        now: Instant,
    ) -> Result<()> {
        self.entry_mut(id)?;
        // Restarting a scheduled timer moves it to the tail; it is never linked twice.
        self.unlink(id.index);
        let entry = self.entry_mut(id)?;
        entry.callback = Some(callback);
        entry.mode = mode;
        entry.jabbed = false;
        match period {
            TimerPeriod::After(period) => {
                entry.period = period;
                entry.due = Due::At(now.checked_add(period).unwrap_or(Instant::MAX));
            }
            TimerPeriod::Infinite => {
                entry.period = Duration::from_ticks(0);
                entry.due = Due::Never;
            }
        }
        self.link_tail(id.index);
        Ok(())
    }

    /// Walks the list from the head and claims the first entry that must fire.
    ///
    /// `fired` marks entries already run during this dispatcher pass; they are
    /// left for the next pass so a callback that re-arms itself cannot spin the
    /// dispatcher forever.
    fn next_step(&mut self, now: Instant, fired: &mut [bool; MAX_TIMERS]) -> Step {
        let mut earliest: Option<Instant> = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let Some(entry) = self.entries.get_mut(usize::from(index)) else {
                break;
            };
            cursor = entry.next;
            let already_fired = fired.get(usize::from(index)).copied().unwrap_or(true);

            let due_now = match entry.due {
                Due::At(at) => at <= now,
                Due::Never => false,
            };
            if already_fired {
                if entry.jabbed || due_now {
                    earliest = Some(now);
                } else if let Due::At(at) = entry.due {
                    earliest = Some(earliest.map_or(at, |earliest| earliest.min(at)));
                }
                continue;
            }
            if !(entry.jabbed || due_now) {
                if let Due::At(at) = entry.due {
                    earliest = Some(earliest.map_or(at, |earliest| earliest.min(at)));
                }
                continue;
            }

            let Some(callback) = entry.callback else {
                continue;
            };
            let mode = entry.mode;
            if mode == TimerMode::Periodic {
                entry.jabbed = false;
                if let Due::At(at) = entry.due {
                    entry.due = Due::At(next_due_after(at, entry.period, now));
                }
            }
            if let Some(mark) = fired.get_mut(usize::from(index)) {
                *mark = true;
            }
            if mode == TimerMode::OneShot {
                self.unlink(index);
            }
            return Step::Fire(callback);
        }
        Step::Sleep(earliest)
    }
}

/// Advances `due` by whole periods until it is after `now`. Missed periods are
/// skipped rather than replayed.
fn next_due_after(due: Instant, period: Duration, now: Instant) -> Instant {
    let period_ticks = period.as_ticks().max(1);
    if due > now {
        return due;
    }
    let behind = now.as_ticks().saturating_sub(due.as_ticks());
    let periods = behind.checked_div(period_ticks).unwrap_or(0).saturating_add(1);
    let ticks = due
        .as_ticks()
        .saturating_add(periods.saturating_mul(period_ticks));
    Instant::from_ticks(ticks)
}

// ============================================================================
// TimerService
// ============================================================================

/// A fixed-capacity software timer service with a single dispatcher task.
///
/// Construct it as a `static` (it is `const`-constructible) and spawn its
/// dispatcher once with [`spawn`](Self::spawn), or drive [`run`](Self::run)
/// from a task of your own. See the [module documentation](mod@crate::timer).
pub struct TimerService {
    table: Mutex<CriticalSectionRawMutex, RefCell<TimerTable>>,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService {
    /// Create an empty timer service.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(TimerTable::new())),
            wake: Signal::new(),
        }
    }

    /// Reserve an idle timer entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerCapacity`] when all [`MAX_TIMERS`] entries are in use.
    pub fn create(&self) -> Result<TimerId> {
        let id = self.table.lock(|table| table.borrow_mut().allocate())?;
        debug!("TimerService::create: timer {}", id.index);
        Ok(id)
    }

    /// Stop the timer and give its entry back. `id` becomes stale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleTimer`] if `id` was already destroyed.
    pub fn destroy(&self, id: TimerId) -> Result<()> {
        self.table.lock(|table| table.borrow_mut().release(id))
    }

    /// Schedule `callback` to run after `period` (once, or every period).
    ///
    /// Starting an already-scheduled timer re-schedules it; it never fires twice
    /// for one due time. A pending jab is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleTimer`] if `id` was destroyed.
    pub fn start(
        &self,
        id: TimerId,
        callback: &'static dyn TimerCallback,
        mode: TimerMode,
        period: TimerPeriod,
    ) -> Result<()> {
        let now = Instant::now();
        self.table
            .lock(|table| table.borrow_mut().start(id, callback, mode, period, now))?;
        self.wake.signal(());
        Ok(())
    }

    /// Unschedule the timer. Stopping an idle timer does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleTimer`] if `id` was destroyed.
    pub fn stop(&self, id: TimerId) -> Result<()> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            table.entry_mut(id)?;
            table.unlink(id.index);
            Ok(())
        })
    }

    /// Fire the timer on the dispatcher's next pass, regardless of its due time.
    ///
    /// Jabs made before the callback runs collapse into one firing. Jabbing an
    /// idle timer has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleTimer`] if `id` was destroyed.
    pub fn jab(&self, id: TimerId) -> Result<()> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            let entry = table.entry_mut(id)?;
            if entry.scheduled {
                entry.jabbed = true;
            }
            Ok::<(), Error>(())
        })?;
        self.wake.signal(());
        Ok(())
    }

    /// Whether the timer is currently scheduled.
    #[must_use]
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.table.lock(|table| {
            table
                .borrow_mut()
                .entry_mut(id)
                .is_ok_and(|entry| entry.scheduled)
        })
    }

    /// Run one dispatcher pass as of `now`.
    ///
    /// Fires, in list order, every entry that is jabbed or due at `now`. After
    /// each callback the walk restarts from the head, since the callback may have
    /// changed the list. Returns the earliest instant something will next be due,
    /// or `None` if only infinite or idle timers remain.
    pub fn poll(&self, now: Instant) -> Option<Instant> {
        let mut fired = [false; MAX_TIMERS];
        loop {
            let step = self
                .table
                .lock(|table| table.borrow_mut().next_step(now, &mut fired));
            match step {
                Step::Fire(callback) => callback.on_timer(),
                Step::Sleep(next_due) => return next_due,
            }
        }
    }

    /// The dispatcher loop. Sleeps until the next due time or a wake-up, then
    /// runs a [`poll`](Self::poll) pass.
    pub async fn run(&self) -> ! {
        info!("TimerService::run: dispatcher started");
        loop {
            // Wake-ups that arrive during the pass are kept and end the next sleep early.
            self.wake.reset();
            match self.poll(Instant::now()) {
                Some(next_due) => {
                    select(Timer::at(next_due), self.wake.wait()).await;
                }
                None => self.wake.wait().await,
            }
        }
    }

    /// Spawn the dispatcher task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be spawned (it can only be spawned once).
    #[cfg(not(feature = "host"))]
    pub fn spawn(&'static self, spawner: embassy_executor::Spawner) -> Result<()> {
        spawner.spawn(timer_service_task(self))?;
        info!("TimerService::spawn: dispatcher task spawned");
        Ok(())
    }
}

impl TimerJabber for TimerService {
    fn jab_from_interrupt(&self, id: TimerId) -> bool {
        self.jab(id).is_ok()
    }
}

#[cfg(not(feature = "host"))]
#[embassy_executor::task]
async fn timer_service_task(timer_service: &'static TimerService) -> ! {
    timer_service.run().await
}
