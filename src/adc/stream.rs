//! Cyclic-buffer bookkeeping for the high-speed stream.
//!
//! The owner lends the scheduler a `'static` buffer. Each conversion fills the
//! next chunk of it; when the end is reached, writing wraps back to the start.

use super::{ConversionRequest, Sample, Selector, TriggerMode};
use crate::Error;

/// How to run the high-speed stream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct StreamConfig {
    /// Inputs to sample.
    pub selector: Selector,
    /// Trigger frequency in Hz.
    pub frequency_hz: u32,
    /// Samples per conversion event (the chunk size).
    pub chunk_len: usize,
}

/// The chunk a stream conversion just delivered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct StreamChunk {
    /// Index of the chunk's first sample in the stream buffer.
    pub offset: usize,
    /// Number of samples in the chunk.
    pub count: usize,
    /// Trigger ticks were missed before this chunk, so it does not directly
    /// follow the previous one in time.
    pub lost_event: bool,
}

/// Counters describing the stream since it was last configured.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "host")), derive(defmt::Format))]
pub struct StreamStatus {
    /// Whether the stream is running.
    pub active: bool,
    /// Chunks delivered.
    pub chunks_delivered: u32,
    /// Chunks delivered with [`StreamChunk::lost_event`] set.
    pub lost_events: u32,
    /// Conversions that failed (each skips one chunk).
    pub errors: u32,
}

/// A refused [`configure_stream`](super::Scheduler::configure_stream) call.
///
/// Carries the lent buffer back so the caller can retry with it. Converts into
/// [`Error`] for use with `?`.
#[derive(Debug)]
pub struct StreamConfigError {
    /// Why the configuration was refused.
    pub error: Error,
    /// The buffer that was offered, untouched.
    pub buffer: &'static mut [Sample],
}

impl From<StreamConfigError> for Error {
    fn from(rejected: StreamConfigError) -> Self {
        rejected.error
    }
}

/// Called from the conversion-complete interrupt for every delivered chunk.
///
/// Runs in interrupt context with the scheduler locked: it must be short and
/// must not call back into the scheduler.
pub trait StreamIsrCallback: Sync {
    /// `samples` is the chunk's region of the stream buffer.
    fn on_chunk(&self, chunk: StreamChunk, samples: &[Sample]);
}

impl<F> StreamIsrCallback for F
where
    F: Fn(StreamChunk, &[Sample]) + Sync,
{
    fn on_chunk(&self, chunk: StreamChunk, samples: &[Sample]) {
        self(chunk, samples);
    }
}

/// Receives stream chunks in interrupt context and hands them on to task context.
///
/// [`StreamBroadcast`](super::StreamBroadcast) is the usual implementation: it
/// jabs a timer whose callback publishes the chunk to subscribers.
pub trait StreamNotify: Sync {
    /// Must not block.
    fn notify_from_interrupt(&self, chunk: StreamChunk);
}

/// Stream state owned by the scheduler.
pub(crate) struct HighSpeedStream {
    config: Option<StreamConfig>,
    buffer: Option<&'static mut [Sample]>,
    remaining: usize,
    offset: usize,
    in_flight: usize,
    lost_event_in_flight: bool,
    active: bool,
    last_chunk: Option<StreamChunk>,
    status: StreamStatus,
}

impl HighSpeedStream {
    pub(crate) const fn new() -> Self {
        Self {
            config: None,
            buffer: None,
            remaining: 0,
            offset: 0,
            in_flight: 0,
            lost_event_in_flight: false,
            active: false,
            last_chunk: None,
            status: StreamStatus {
                active: false,
                chunks_delivered: 0,
                lost_events: 0,
                errors: 0,
            },
        }
    }

    /// Installs a new configuration and buffer; returns the previous buffer.
    ///
    /// The caller has already validated `config` against `buffer`.
    pub(crate) fn configure(
        &mut self,
        config: StreamConfig,
        buffer: &'static mut [Sample],
    ) -> Option<&'static mut [Sample]> {
        self.remaining = buffer.len();
        self.offset = 0;
        self.in_flight = 0;
        self.lost_event_in_flight = false;
        self.last_chunk = None;
        self.status = StreamStatus::default();
        self.config = Some(config);
        self.buffer.replace(buffer)
    }

    pub(crate) const fn config(&self) -> Option<StreamConfig> {
        self.config
    }

    pub(crate) const fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
        self.status.active = active;
    }

    pub(crate) const fn last_chunk(&self) -> Option<StreamChunk> {
        self.last_chunk
    }

    pub(crate) const fn status(&self) -> StreamStatus {
        self.status
    }

    /// Size of the next chunk: `min(remaining, chunk_len)`.
    pub(crate) fn next_chunk_len(&self) -> usize {
        let chunk_len = self.config.map_or(0, |config| config.chunk_len);
        self.remaining.min(chunk_len)
    }

    /// Builds the request for the next chunk and remembers what is in flight.
    pub(crate) fn issue(&mut self, lost_event: bool) -> Option<ConversionRequest> {
        let config = self.config?;
        let count = self.next_chunk_len();
        if count == 0 {
            return None;
        }
        self.in_flight = count;
        self.lost_event_in_flight = lost_event;
        Some(ConversionRequest {
            selector: config.selector,
            count,
            // After missed ticks the trigger has already passed; don't wait for another.
            trigger: if lost_event {
                TriggerMode::Immediate
            } else {
                TriggerMode::NextTick
            },
        })
    }

    /// Copies a finished conversion into the buffer and advances the write position.
    pub(crate) fn deliver(&mut self, samples: &[Sample]) -> StreamChunk {
        let count = samples.len().min(self.in_flight);
        let offset = self.offset;
        if let Some(region) = self
            .buffer
            .as_deref_mut()
            .and_then(|buffer| buffer.get_mut(offset..offset.saturating_add(count)))
        {
            region.copy_from_slice(samples.get(..count).unwrap_or_default());
        }

        let chunk = StreamChunk {
            offset,
            count,
            lost_event: self.lost_event_in_flight,
        };
        self.advance(count);
        self.in_flight = 0;
        self.lost_event_in_flight = false;
        self.last_chunk = Some(chunk);
        self.status.chunks_delivered = self.status.chunks_delivered.wrapping_add(1);
        if chunk.lost_event {
            self.status.lost_events = self.status.lost_events.wrapping_add(1);
        }
        chunk
    }

    /// A failed conversion skips its chunk; the write position does not move.
    pub(crate) fn fail(&mut self) {
        self.in_flight = 0;
        self.lost_event_in_flight = false;
        self.status.errors = self.status.errors.wrapping_add(1);
    }

    fn advance(&mut self, count: usize) {
        self.remaining = self.remaining.saturating_sub(count);
        self.offset = self.offset.saturating_add(count);
        if self.remaining == 0 {
            self.remaining = self.buffer.as_deref().map_or(0, <[Sample]>::len);
            self.offset = 0;
        }
    }

    pub(crate) fn chunk_samples(&self, chunk: StreamChunk) -> &[Sample] {
        self.buffer
            .as_deref()
            .and_then(|buffer| buffer.get(chunk.offset..chunk.offset.saturating_add(chunk.count)))
            .unwrap_or_default()
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;

    fn stream_with(len: usize, chunk_len: usize) -> HighSpeedStream {
        let buffer: &'static mut [Sample] = Vec::leak(vec![0; len]);
        let mut stream = HighSpeedStream::new();
        stream.configure(
            StreamConfig {
                selector: Selector(0),
                frequency_hz: 1_000,
                chunk_len,
            },
            buffer,
        );
        stream
    }

    #[test]
    fn short_tail_chunk_then_wrap() {
        let mut stream = stream_with(10, 4);
        let mut counts = Vec::new();
        for _ in 0..4 {
            let request = stream.issue(false).expect("configured");
            let samples = vec![7; request.count];
            counts.push(stream.deliver(&samples));
        }
        let offsets: Vec<_> = counts.iter().map(|chunk| (chunk.offset, chunk.count)).collect();
        assert_eq!(offsets, [(0, 4), (4, 4), (8, 2), (0, 4)]);
    }

    #[test]
    fn failed_chunk_does_not_advance() {
        let mut stream = stream_with(8, 4);
        stream.issue(false).expect("configured");
        stream.fail();
        let request = stream.issue(false).expect("configured");
        let chunk = stream.deliver(&vec![1; request.count]);
        assert_eq!(chunk.offset, 0);
        assert_eq!(stream.status().errors, 1);
    }
}
