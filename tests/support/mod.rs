//! A fake converter backend and small helpers shared by the host tests.
#![allow(dead_code, reason = "each test file uses a different subset")]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use adc_envoy::adc::{
    AdcBackend, ConversionRequest, LowSpeedCallback, LowSpeedReading, Sample, Scheduler,
    SchedulerConfig, Selector, StreamChunk, StreamIsrCallback,
};
use adc_envoy::timer::{TimerCallback, TimerService};

pub const MAX_STREAM_HZ: u32 = 50_000;

#[derive(Default)]
struct FakeState {
    requests: Vec<ConversionRequest>,
    pending: Option<ConversionRequest>,
    trigger: Option<(Selector, u32)>,
    trigger_starts: usize,
}

/// Records every request; completions are driven by the test.
pub struct FakeAdc {
    state: Mutex<FakeState>,
    per_conversion: usize,
    restart_from_error_isr: bool,
}

impl FakeAdc {
    pub fn new(per_conversion: usize) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            per_conversion,
            restart_from_error_isr: true,
        }
    }

    pub fn without_error_restart(per_conversion: usize) -> Self {
        Self {
            restart_from_error_isr: false,
            ..Self::new(per_conversion)
        }
    }

    pub fn requests(&self) -> Vec<ConversionRequest> {
        self.state.lock().expect("fake state").requests.clone()
    }

    pub fn pending(&self) -> Option<ConversionRequest> {
        self.state.lock().expect("fake state").pending
    }

    pub fn take_pending(&self) -> Option<ConversionRequest> {
        self.state.lock().expect("fake state").pending.take()
    }

    pub fn trigger(&self) -> Option<(Selector, u32)> {
        self.state.lock().expect("fake state").trigger
    }

    pub fn trigger_starts(&self) -> usize {
        self.state.lock().expect("fake state").trigger_starts
    }
}

impl AdcBackend for FakeAdc {
    fn start_conversion(&self, request: ConversionRequest) {
        let mut state = self.state.lock().expect("fake state");
        assert!(
            state.pending.is_none(),
            "a second conversion was started while one was outstanding"
        );
        state.requests.push(request);
        state.pending = Some(request);
    }

    fn samples_per_conversion(&self, _selector: Selector) -> usize {
        self.per_conversion
    }

    fn start_trigger(&self, selector: Selector, frequency_hz: u32) {
        let mut state = self.state.lock().expect("fake state");
        state.trigger = Some((selector, frequency_hz));
        state.trigger_starts += 1;
    }

    fn stop_trigger(&self, _selector: Selector) {
        self.state.lock().expect("fake state").trigger = None;
    }

    fn max_stream_frequency(&self) -> u32 {
        MAX_STREAM_HZ
    }

    fn can_restart_from_error_isr(&self) -> bool {
        self.restart_from_error_isr
    }
}

pub type TestScheduler<const SLOTS: usize, const MAX_SAMPLES: usize> =
    Scheduler<FakeAdc, SLOTS, MAX_SAMPLES>;

pub fn scheduler<const SLOTS: usize, const MAX_SAMPLES: usize>(
    adc: FakeAdc,
) -> &'static TestScheduler<SLOTS, MAX_SAMPLES> {
    let scheduler_static = Box::leak(Box::new(TestScheduler::<SLOTS, MAX_SAMPLES>::new_static()));
    Scheduler::new(scheduler_static, adc, SchedulerConfig::default())
}

pub fn timers() -> &'static TimerService {
    Box::leak(Box::new(TimerService::new()))
}

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

pub fn stream_buffer(len: usize) -> &'static mut [Sample] {
    Box::leak(vec![0; len].into_boxed_slice())
}

/// The samples the fake hardware produces for `request`: the selector number
/// times 100, plus the sample's index.
pub fn samples_for(request: ConversionRequest) -> Vec<Sample> {
    (0..request.count)
        .map(|index| Sample::from(request.selector.0) * 100 + index as Sample)
        .collect()
}

/// Completes the outstanding conversion with [`samples_for`] and returns it.
pub fn finish<const SLOTS: usize, const MAX_SAMPLES: usize>(
    scheduler: &TestScheduler<SLOTS, MAX_SAMPLES>,
) -> ConversionRequest {
    let request = scheduler
        .backend()
        .take_pending()
        .expect("a conversion must be outstanding");
    scheduler.interrupt().on_complete(&samples_for(request));
    request
}

/// Fails the outstanding conversion and returns it.
pub fn fail<const SLOTS: usize, const MAX_SAMPLES: usize>(
    scheduler: &TestScheduler<SLOTS, MAX_SAMPLES>,
) -> ConversionRequest {
    let request = scheduler
        .backend()
        .take_pending()
        .expect("a conversion must be outstanding");
    scheduler.interrupt().on_error();
    request
}

/// Counts timer firings.
#[derive(Default)]
pub struct Counter(AtomicU32);

impl Counter {
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

impl TimerCallback for Counter {
    fn on_timer(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects low-speed readings in delivery order.
#[derive(Default)]
pub struct Readings<const MAX_SAMPLES: usize>(Mutex<Vec<LowSpeedReading<MAX_SAMPLES>>>);

impl<const MAX_SAMPLES: usize> Readings<MAX_SAMPLES> {
    pub fn take(&self) -> Vec<LowSpeedReading<MAX_SAMPLES>> {
        std::mem::take(&mut *self.0.lock().expect("readings"))
    }
}

impl<const MAX_SAMPLES: usize> LowSpeedCallback<MAX_SAMPLES> for Readings<MAX_SAMPLES> {
    fn on_reading(&self, reading: LowSpeedReading<MAX_SAMPLES>) {
        self.0.lock().expect("readings").push(reading);
    }
}

/// Collects stream chunks and their samples as seen from the interrupt.
#[derive(Default)]
pub struct Chunks(Mutex<Vec<(StreamChunk, Vec<Sample>)>>);

impl Chunks {
    pub fn take(&self) -> Vec<(StreamChunk, Vec<Sample>)> {
        std::mem::take(&mut *self.0.lock().expect("chunks"))
    }
}

impl StreamIsrCallback for Chunks {
    fn on_chunk(&self, chunk: StreamChunk, samples: &[Sample]) {
        self.0.lock().expect("chunks").push((chunk, samples.to_vec()));
    }
}
