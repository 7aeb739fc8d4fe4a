//! Task-context fan-out of stream chunks to several subscribers.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};

use super::stream::{StreamChunk, StreamNotify};
use crate::timer::{TimerCallback, TimerId, TimerJabber, TimerMode, TimerPeriod, TimerService};
use crate::{Error, Result};

/// Chunks a slow subscriber may fall behind by before it starts lagging.
const BROADCAST_DEPTH: usize = 4;

/// Receives chunk announcements from a [`StreamBroadcast`].
pub type StreamSubscriber<'a, const SUBS: usize> =
    Subscriber<'a, CriticalSectionRawMutex, StreamChunk, BROADCAST_DEPTH, SUBS, 1>;

/// Hands stream chunks from the completion interrupt to up to `SUBS` tasks.
///
/// In the interrupt it only remembers the chunk and jabs its timer; the
/// timer's callback publishes from the dispatcher task. Chunks that arrive
/// faster than the dispatcher runs collapse to the latest one.
///
/// ```rust,ignore
/// static TIMERS: TimerService = TimerService::new();
/// static BROADCAST: StreamBroadcast<2> = StreamBroadcast::new();
///
/// BROADCAST.attach(&TIMERS)?;
/// adc.set_notify(Some(&BROADCAST));
///
/// let mut subscriber = BROADCAST.subscriber()?;
/// let chunk = subscriber.next_message_pure().await;
/// adc.with_stream_samples(|chunk, samples| process(chunk, samples));
/// ```
pub struct StreamBroadcast<const SUBS: usize> {
    channel: PubSubChannel<CriticalSectionRawMutex, StreamChunk, BROADCAST_DEPTH, SUBS, 1>,
    pending: Mutex<CriticalSectionRawMutex, Cell<Option<StreamChunk>>>,
    timer: Mutex<CriticalSectionRawMutex, Cell<Option<(&'static dyn TimerJabber, TimerId)>>>,
}

impl<const SUBS: usize> Default for StreamBroadcast<SUBS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SUBS: usize> StreamBroadcast<SUBS> {
    /// Create a broadcast with no timer attached.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channel: PubSubChannel::new(),
            pending: Mutex::new(Cell::new(None)),
            timer: Mutex::new(Cell::new(None)),
        }
    }

    /// Register the publishing callback with `timers` as a jab-only entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerCapacity`] if `timers` has no free entry.
    pub fn attach(&'static self, timers: &'static TimerService) -> Result<TimerId> {
        let id = timers.create()?;
        timers.start(id, self, TimerMode::Periodic, TimerPeriod::Infinite)?;
        let jabber: &'static dyn TimerJabber = timers;
        self.timer.lock(|timer| timer.set(Some((jabber, id))));
        Ok(id)
    }

    /// Subscribe to chunk announcements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManySubscribers`] when all `SUBS` subscriptions are taken.
    pub fn subscriber(&self) -> Result<StreamSubscriber<'_, SUBS>> {
        self.channel
            .subscriber()
            .map_err(|_| Error::TooManySubscribers)
    }
}

impl<const SUBS: usize> StreamNotify for StreamBroadcast<SUBS> {
    fn notify_from_interrupt(&self, chunk: StreamChunk) {
        self.pending.lock(|pending| pending.set(Some(chunk)));
        if let Some((jabber, id)) = self.timer.lock(Cell::get) {
            jabber.jab_from_interrupt(id);
        }
    }
}

impl<const SUBS: usize> TimerCallback for StreamBroadcast<SUBS> {
    fn on_timer(&self) {
        if let Some(chunk) = self.pending.lock(Cell::take) {
            self.channel.immediate_publisher().publish_immediate(chunk);
        }
    }
}
