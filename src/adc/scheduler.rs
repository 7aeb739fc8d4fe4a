//! The conversion scheduler: one hardware converter, one stream, many slots.
//!
//! See [`Scheduler`] for usage.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};
use embassy_time::Duration;
use portable_atomic::{AtomicU32, Ordering};
use static_cell::StaticCell;

use super::interrupt::AdcInterrupt;
use super::low_speed::{Completion, LowSpeedCallback, SlotTable};
use super::stream::{
    HighSpeedStream, StreamChunk, StreamConfig, StreamConfigError, StreamIsrCallback,
    StreamNotify, StreamStatus,
};
use super::{AdcBackend, ConversionRequest, Sample, Selector};
use crate::timer::{TimerCallback, TimerId, TimerJabber, TimerMode, TimerPeriod, TimerService};
use crate::{Error, Result};

/// Default period of the deferred dispatch timer.
pub const DISPATCH_PERIOD: Duration = Duration::from_millis(1);

/// Runtime settings for a [`Scheduler`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedulerConfig {
    /// How often the deferred dispatch runs when nothing jabs it.
    pub dispatch_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_period: DISPATCH_PERIOD,
        }
    }
}

/// Static resources for [`Scheduler`].
pub struct SchedulerStatic<B, const SLOTS: usize, const MAX_SAMPLES: usize>
where
    B: AdcBackend + 'static,
{
    cell: StaticCell<Scheduler<B, SLOTS, MAX_SAMPLES>>,
}

impl<B, const SLOTS: usize, const MAX_SAMPLES: usize> SchedulerStatic<B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    /// Create static resources for a scheduler.
    #[must_use]
    pub const fn new_static() -> Self {
        Self {
            cell: StaticCell::new(),
        }
    }
}

type Dispatcher = Option<(&'static dyn TimerJabber, TimerId)>;

struct SchedulerState<const SLOTS: usize, const MAX_SAMPLES: usize> {
    stream: HighSpeedStream,
    slots: SlotTable<SLOTS, MAX_SAMPLES>,
    // `Some(i)`: slot `i` is being serviced. `None`: the stream is (when busy).
    cursor: Option<usize>,
    busy: bool,
    restart_pending: bool,
    isr_callback: Option<&'static dyn StreamIsrCallback>,
    semaphore: Option<&'static GreedySemaphore<CriticalSectionRawMutex>>,
    notify: Option<&'static dyn StreamNotify>,
}

/// Shares one analog-to-digital converter between a high-speed stream and
/// `SLOTS` low-speed slots of up to `MAX_SAMPLES` samples each.
///
/// Exactly one conversion is outstanding at a time. The platform's interrupt
/// handlers drive the scheduler through [`interrupt`](Self::interrupt); each
/// completion picks the next conversion (see the [module docs](mod@crate::adc)
/// for the order). Finished low-speed slots are handed to their callers by the
/// deferred dispatch, a periodic [`TimerService`] entry registered by
/// [`attach`](Self::attach).
///
/// # Example
///
/// ```rust,ignore
/// use adc_envoy::adc::{
///     LowSpeedReader, LowSpeedReaderStatic, Scheduler, SchedulerConfig, SchedulerStatic,
///     Selector, StreamConfig,
/// };
/// use adc_envoy::timer::TimerService;
/// use static_cell::StaticCell;
///
/// type Adc = Scheduler<MyAdcBackend, 3, 4>;
///
/// static TIMERS: TimerService = TimerService::new();
/// static ADC_STATIC: SchedulerStatic<MyAdcBackend, 3, 4> = Adc::new_static();
/// static READER_STATIC: LowSpeedReaderStatic<4> = Adc::reader_static();
/// static STREAM_BUFFER: StaticCell<[u16; 1024]> = StaticCell::new();
///
/// async fn example(spawner: embassy_executor::Spawner) -> adc_envoy::Result<()> {
///     TIMERS.spawn(spawner)?;
///     let adc = Adc::new(&ADC_STATIC, MyAdcBackend::take(), SchedulerConfig::default());
///     adc.attach(&TIMERS)?;
///     MyAdcBackend::register_interrupt(adc.interrupt());
///
///     adc.configure_stream(
///         StreamConfig { selector: Selector(0), frequency_hz: 8_000, chunk_len: 64 },
///         STREAM_BUFFER.init([0; 1024]),
///     )?;
///     adc.start_stream()?;
///
///     let mut reader = LowSpeedReader::new(adc, &READER_STATIC);
///     let battery = reader.read(Selector(3)).await?;
///     defmt::info!("battery: {}", battery[0]);
///     Ok(())
/// }
/// ```
pub struct Scheduler<B, const SLOTS: usize, const MAX_SAMPLES: usize>
where
    B: AdcBackend + 'static,
{
    backend: B,
    restart_from_error_isr: bool,
    config: SchedulerConfig,
    state: Mutex<CriticalSectionRawMutex, RefCell<SchedulerState<SLOTS, MAX_SAMPLES>>>,
    admission: GreedySemaphore<CriticalSectionRawMutex>,
    missed_ticks: AtomicU32,
    dispatcher: Mutex<CriticalSectionRawMutex, Cell<Dispatcher>>,
}

impl<B, const SLOTS: usize, const MAX_SAMPLES: usize> Scheduler<B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    /// Create static resources for a scheduler.
    #[must_use]
    pub const fn new_static() -> SchedulerStatic<B, SLOTS, MAX_SAMPLES> {
        SchedulerStatic::new_static()
    }

    /// Create static resources for a [`LowSpeedReader`](super::LowSpeedReader)
    /// of this scheduler.
    #[must_use]
    pub const fn reader_static() -> super::LowSpeedReaderStatic<MAX_SAMPLES> {
        super::LowSpeedReaderStatic::new_static()
    }

    /// Build the scheduler around `backend`. It starts idle with no stream
    /// configured; call [`attach`](Self::attach) before using low-speed reads.
    ///
    /// # Panics
    ///
    /// Panics if `scheduler_static` was already used.
    pub fn new(
        scheduler_static: &'static SchedulerStatic<B, SLOTS, MAX_SAMPLES>,
        backend: B,
        config: SchedulerConfig,
    ) -> &'static Self {
        let restart_from_error_isr = backend.can_restart_from_error_isr();
        info!(
            "Scheduler::new: {} low-speed slots, restart from error isr: {}",
            SLOTS,
            restart_from_error_isr
        );
        scheduler_static.cell.init(Self {
            backend,
            restart_from_error_isr,
            config,
            state: Mutex::new(RefCell::new(SchedulerState {
                stream: HighSpeedStream::new(),
                slots: SlotTable::new(),
                cursor: None,
                busy: false,
                restart_pending: false,
                isr_callback: None,
                semaphore: None,
                notify: None,
            })),
            admission: GreedySemaphore::new(SLOTS),
            missed_ticks: AtomicU32::new(0),
            dispatcher: Mutex::new(Cell::new(None)),
        })
    }

    /// Register the deferred dispatch with `timers` as a periodic entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerCapacity`] if `timers` has no free entry.
    pub fn attach(&'static self, timers: &'static TimerService) -> Result<TimerId> {
        let id = timers.create()?;
        timers.start(
            id,
            self,
            TimerMode::Periodic,
            TimerPeriod::After(self.config.dispatch_period),
        )?;
        let jabber: &'static dyn TimerJabber = timers;
        self.dispatcher
            .lock(|dispatcher| dispatcher.set(Some((jabber, id))));
        debug!("Scheduler::attach: dispatch timer attached");
        Ok(id)
    }

    /// The interrupt-context surface for the platform's handlers.
    #[must_use]
    pub const fn interrupt(&self) -> AdcInterrupt<'_, B, SLOTS, MAX_SAMPLES> {
        AdcInterrupt::new(self)
    }

    /// The backend this scheduler drives.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    // ========================================================================
    // High-speed stream
    // ========================================================================

    /// Set up the high-speed stream. Returns the previously configured buffer.
    ///
    /// `chunk_len` and the buffer length must be non-zero whole multiples of the
    /// backend's samples per conversion, and the buffer must hold at least one
    /// chunk. On error nothing changes and `buffer` comes back in the error.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamConfigError`] holding [`Error::StreamActive`] while
    /// the stream runs (or a stream conversion is still in flight), or
    /// [`Error::FrequencyOutOfRange`] or [`Error::InvalidStreamBuffer`] on a
    /// bad configuration.
    pub fn configure_stream(
        &self,
        config: StreamConfig,
        buffer: &'static mut [Sample],
    ) -> Result<Option<&'static mut [Sample]>, StreamConfigError> {
        if let Err(error) = self.validate_stream(config, buffer.len()) {
            return Err(StreamConfigError { error, buffer });
        }

        let previous = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let stream_in_flight = state.busy && state.cursor.is_none();
            if state.stream.is_active() || stream_in_flight {
                return Err(StreamConfigError {
                    error: Error::StreamActive,
                    buffer,
                });
            }
            Ok(state.stream.configure(config, buffer))
        })?;
        info!(
            "Scheduler::configure_stream: {} Hz, chunk {}",
            config.frequency_hz,
            config.chunk_len
        );
        Ok(previous)
    }

    fn validate_stream(&self, config: StreamConfig, buffer_len: usize) -> Result<()> {
        let max = self.backend.max_stream_frequency();
        if config.frequency_hz == 0 || config.frequency_hz > max {
            return Err(Error::FrequencyOutOfRange {
                requested: config.frequency_hz,
                max,
            });
        }
        let per_conversion = self.backend.samples_per_conversion(config.selector).max(1);
        let whole = |len: usize| len.checked_rem(per_conversion) == Some(0);
        let fits = config.chunk_len != 0
            && whole(config.chunk_len)
            && buffer_len >= config.chunk_len
            && whole(buffer_len);
        if fits {
            Ok(())
        } else {
            Err(Error::InvalidStreamBuffer)
        }
    }

    /// Arm the stream trigger and start converting. Starting a running stream
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotConfigured`] before
    /// [`configure_stream`](Self::configure_stream).
    pub fn start_stream(&self) -> Result<()> {
        let started = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let config = state.stream.config().ok_or(Error::StreamNotConfigured)?;
            if state.stream.is_active() {
                return Ok::<_, Error>(None);
            }
            self.missed_ticks.store(0, Ordering::Release);
            state.stream.set_active(true);
            Ok(Some(config))
        })?;
        let Some(config) = started else {
            return Ok(());
        };
        // Arm the first chunk before the first tick can arrive.
        self.kick();
        self.backend
            .start_trigger(config.selector, config.frequency_hz);
        info!("Scheduler::start_stream: started");
        Ok(())
    }

    /// Disarm the stream trigger. A conversion already in flight finishes
    /// normally. Stopping a stopped stream does nothing.
    pub fn stop_stream(&self) {
        let stopped = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.stream.is_active() {
                return None;
            }
            state.stream.set_active(false);
            state.stream.config()
        });
        if let Some(config) = stopped {
            self.backend.stop_trigger(config.selector);
            info!("Scheduler::stop_stream: stopped");
        }
    }

    /// Call `callback` from the completion interrupt for every chunk.
    pub fn set_isr_callback(&self, callback: Option<&'static dyn StreamIsrCallback>) {
        self.state
            .lock(|state| state.borrow_mut().isr_callback = callback);
    }

    /// Release one permit on `semaphore` for every chunk.
    pub fn set_semaphore(&self, semaphore: Option<&'static GreedySemaphore<CriticalSectionRawMutex>>) {
        self.state
            .lock(|state| state.borrow_mut().semaphore = semaphore);
    }

    /// Hand every chunk to `notify` from the completion interrupt.
    pub fn set_notify(&self, notify: Option<&'static dyn StreamNotify>) {
        self.state.lock(|state| state.borrow_mut().notify = notify);
    }

    /// The most recently delivered chunk.
    #[must_use]
    pub fn last_chunk(&self) -> Option<StreamChunk> {
        self.state.lock(|state| state.borrow().stream.last_chunk())
    }

    /// Run `f` on the most recently delivered chunk and its samples.
    ///
    /// Interrupts are held off while `f` runs, so keep it short.
    pub fn with_stream_samples<R>(&self, f: impl FnOnce(StreamChunk, &[Sample]) -> R) -> Option<R> {
        self.state.lock(|state| {
            let state = state.borrow();
            let chunk = state.stream.last_chunk()?;
            Some(f(chunk, state.stream.chunk_samples(chunk)))
        })
    }

    /// Stream counters since the last [`configure_stream`](Self::configure_stream).
    #[must_use]
    pub fn stream_status(&self) -> StreamStatus {
        self.state.lock(|state| state.borrow().stream.status())
    }

    /// Whether a conversion is outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state.lock(|state| state.borrow().busy)
    }

    // ========================================================================
    // Low-speed slots
    // ========================================================================

    /// Convert `selector` once and hand the reading to `callback` from the
    /// deferred dispatch. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSlotAvailable`] if every slot is in use, or
    /// [`Error::TooManySamples`] if the conversion does not fit in a slot.
    pub fn start_low_speed(
        &self,
        selector: Selector,
        callback: &'static dyn LowSpeedCallback<MAX_SAMPLES>,
    ) -> Result<()> {
        let count = self.conversion_len(selector)?;
        let permit = self
            .admission
            .try_acquire(1)
            .ok_or(Error::NoSlotAvailable)?;
        permit.disarm();
        self.install(selector, count, Completion::Callback(callback))
    }

    /// Wait for a slot, then install `completion` for `selector`.
    pub(crate) async fn acquire_low_speed(
        &self,
        selector: Selector,
        completion: Completion<MAX_SAMPLES>,
    ) -> Result<()> {
        let count = self.conversion_len(selector)?;
        let Ok(permit) = self.admission.acquire(1).await;
        permit.disarm();
        self.install(selector, count, completion)
    }

    fn conversion_len(&self, selector: Selector) -> Result<usize> {
        let needed = self.backend.samples_per_conversion(selector);
        if needed > MAX_SAMPLES {
            return Err(Error::TooManySamples {
                needed,
                capacity: MAX_SAMPLES,
            });
        }
        Ok(needed)
    }

    /// Installs a request; the caller holds one admission permit, which the
    /// slot now owns.
    fn install(
        &self,
        selector: Selector,
        count: usize,
        completion: Completion<MAX_SAMPLES>,
    ) -> Result<()> {
        let installed = self
            .state
            .lock(|state| state.borrow_mut().slots.install(selector, count, completion));
        let Some(index) = installed else {
            self.admission.release(1);
            return Err(Error::NoSlotAvailable);
        };
        trace!("Scheduler::install: slot {}", index);
        self.kick();
        Ok(())
    }

    // ========================================================================
    // Deferred dispatch
    // ========================================================================

    /// Hand every finished slot to its caller, in table order. Returns how
    /// many were delivered.
    ///
    /// Each slot is freed, and its permit released, before its callback runs.
    /// Runs from the dispatch timer; call it directly only when no
    /// [`TimerService`] is attached.
    pub fn dispatch_completions(&self) -> usize {
        let mut delivered = 0_usize;
        let mut from = 0_usize;
        loop {
            let taken = self.state.lock(|state| {
                let taken = state.borrow_mut().slots.take_finished(from)?;
                self.admission.release(1);
                Some(taken)
            });
            let Some((index, completion, reading)) = taken else {
                break;
            };
            completion.deliver(reading);
            delivered = delivered.saturating_add(1);
            from = index.saturating_add(1);
        }

        let restart = self
            .state
            .lock(|state| core::mem::take(&mut state.borrow_mut().restart_pending));
        if restart {
            debug!("Scheduler::dispatch_completions: restarting after error");
            self.kick();
        }
        delivered
    }

    fn jab_dispatcher(&self) {
        if let Some((jabber, id)) = self.dispatcher.lock(Cell::get) {
            jabber.jab_from_interrupt(id);
        }
    }

    // ========================================================================
    // Interrupt path
    // ========================================================================

    pub(crate) fn complete(&self, samples: &[Sample]) {
        let outcome = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            if !state.busy {
                return None;
            }
            match state.cursor {
                Some(index) => {
                    state.slots.finish(index, Some(samples));
                    Some((self.next_after_slot(state, index), None))
                }
                None => {
                    let chunk = state.stream.deliver(samples);
                    if let Some(callback) = state.isr_callback {
                        callback.on_chunk(chunk, state.stream.chunk_samples(chunk));
                    }
                    Some((self.next_after_stream(state), Some(chunk)))
                }
            }
        });
        let Some((next, chunk)) = outcome else {
            warn!("Scheduler::complete: no conversion outstanding");
            return;
        };

        match chunk {
            Some(chunk) => self.fan_out(chunk),
            None => self.jab_dispatcher(),
        }
        if let Some(request) = next {
            self.backend.start_conversion(request);
        }
    }

    pub(crate) fn fail(&self) {
        let outcome = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            if !state.busy {
                return None;
            }
            let failed_slot = match state.cursor {
                Some(index) => {
                    state.slots.finish(index, None);
                    true
                }
                None => {
                    state.stream.fail();
                    false
                }
            };
            if !self.restart_from_error_isr {
                state.busy = false;
                state.cursor = None;
                state.restart_pending = true;
                return Some((None, true));
            }
            let next = match state.cursor {
                Some(index) => self.next_after_slot(state, index),
                None => self.next_after_stream(state),
            };
            Some((next, failed_slot))
        });
        let Some((next, needs_dispatch)) = outcome else {
            warn!("Scheduler::fail: no conversion outstanding");
            return;
        };

        warn!("Scheduler::fail: conversion failed");
        if needs_dispatch {
            self.jab_dispatcher();
        }
        if let Some(request) = next {
            self.backend.start_conversion(request);
        }
    }

    pub(crate) fn trigger_tick(&self) {
        let missed = self.state.lock(|state| {
            let state = state.borrow();
            let stream_armed = state.busy && state.cursor.is_none();
            state.stream.is_active() && !stream_armed
        });
        if missed {
            self.missed_ticks.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn fan_out(&self, chunk: StreamChunk) {
        let (semaphore, notify) = self
            .state
            .lock(|state| {
                let state = state.borrow();
                (state.semaphore, state.notify)
            });
        if let Some(semaphore) = semaphore {
            semaphore.release(1);
        }
        if let Some(notify) = notify {
            notify.notify_from_interrupt(chunk);
        }
    }

    /// Starts the next conversion if the converter is idle.
    fn kick(&self) {
        let next = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            if state.busy {
                return None;
            }
            self.next_after_stream(state)
        });
        if let Some(request) = next {
            self.backend.start_conversion(request);
        }
    }

    // ========================================================================
    // Choosing the next conversion
    //
    // Each of these either claims the converter (busy, cursor set) and returns
    // the request to issue, or leaves the scheduler idle.
    // ========================================================================

    fn next_after_slot(
        &self,
        state: &mut SchedulerState<SLOTS, MAX_SAMPLES>,
        index: usize,
    ) -> Option<ConversionRequest> {
        let next_index = index.saturating_add(1);
        if let Some(next) = state.slots.next_active(next_index, SLOTS) {
            return Self::issue_slot(state, next);
        }
        if state.stream.is_active() {
            return self.issue_stream(state);
        }
        match state.slots.next_active(0, next_index) {
            Some(next) => Self::issue_slot(state, next),
            None => Self::go_idle(state),
        }
    }

    /// Also used when the converter was idle.
    fn next_after_stream(
        &self,
        state: &mut SchedulerState<SLOTS, MAX_SAMPLES>,
    ) -> Option<ConversionRequest> {
        if let Some(next) = state.slots.next_active(0, SLOTS) {
            return Self::issue_slot(state, next);
        }
        if state.stream.is_active() {
            return self.issue_stream(state);
        }
        Self::go_idle(state)
    }


    fn issue_slot(
        state: &mut SchedulerState<SLOTS, MAX_SAMPLES>,
        index: usize,
    ) -> Option<ConversionRequest> {
        let request = state.slots.request(index)?;
        state.cursor = Some(index);
        state.busy = true;
        Some(request)
    }

    fn issue_stream(
        &self,
        state: &mut SchedulerState<SLOTS, MAX_SAMPLES>,
    ) -> Option<ConversionRequest> {
        let missed = self.missed_ticks.swap(0, Ordering::AcqRel);
        if missed != 0 {
            debug!("Scheduler::issue_stream: {} missed ticks", missed);
        }
        let Some(request) = state.stream.issue(missed != 0) else {
            return Self::go_idle(state);
        };
        state.cursor = None;
        state.busy = true;
        Some(request)
    }

    fn go_idle(state: &mut SchedulerState<SLOTS, MAX_SAMPLES>) -> Option<ConversionRequest> {
        state.cursor = None;
        state.busy = false;
        None
    }
}

impl<B, const SLOTS: usize, const MAX_SAMPLES: usize> TimerCallback
    for Scheduler<B, SLOTS, MAX_SAMPLES>
where
    B: AdcBackend + 'static,
{
    fn on_timer(&self) {
        self.dispatch_completions();
    }
}
