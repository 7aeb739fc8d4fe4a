#![allow(missing_docs)]
//! Host-level tests for low-speed slots, readers, and the deferred dispatch.

mod support;

use std::cell::Cell;

use adc_envoy::Error;
use adc_envoy::adc::{LowSpeedReader, LowSpeedStatus, Selector, TriggerMode};
use embassy_futures::block_on;
use embassy_futures::join::join3;
use embassy_futures::select::{Either, select};
use embassy_futures::yield_now;
use embassy_time::Instant;
use support::{FakeAdc, Readings, TestScheduler, fail, finish, leak, scheduler, timers};

#[test]
fn callback_runs_from_dispatch_not_from_interrupt() {
    let adc = scheduler::<2, 4>(FakeAdc::new(3));
    let readings = leak(Readings::<4>::default());

    adc.start_low_speed(Selector(7), readings)
        .expect("a slot must be free");
    let request = adc.backend().pending().expect("idle scheduler must start at once");
    assert_eq!(request.selector, Selector(7));
    assert_eq!(request.count, 3);
    assert_eq!(request.trigger, TriggerMode::Immediate);

    finish(adc);
    assert!(readings.take().is_empty());
    assert!(!adc.is_busy());

    assert_eq!(adc.dispatch_completions(), 1);
    let delivered = readings.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].selector, Selector(7));
    assert_eq!(delivered[0].status, LowSpeedStatus::Ok);
    assert_eq!(delivered[0].samples.as_slice(), &[700, 701, 702]);
    assert_eq!(adc.dispatch_completions(), 0);
}

#[test]
fn attached_dispatch_is_jabbed_by_the_completion() {
    let timers = timers();
    let adc = scheduler::<1, 4>(FakeAdc::new(1));
    adc.attach(timers).expect("attach must succeed");
    let readings = leak(Readings::<4>::default());

    adc.start_low_speed(Selector(2), readings)
        .expect("a slot must be free");
    timers.poll(Instant::now());
    assert!(readings.take().is_empty());

    finish(adc);
    // Well before the dispatch period elapses.
    timers.poll(Instant::now());
    assert_eq!(readings.take().len(), 1);
}

#[test]
fn async_start_fails_fast_when_every_slot_is_taken() {
    let adc = scheduler::<2, 4>(FakeAdc::new(1));
    let readings = leak(Readings::<4>::default());

    adc.start_low_speed(Selector(1), readings)
        .expect("first slot must be free");
    adc.start_low_speed(Selector(2), readings)
        .expect("second slot must be free");
    assert!(matches!(
        adc.start_low_speed(Selector(3), readings),
        Err(Error::NoSlotAvailable)
    ));

    finish(adc);
    // Done but not yet dispatched: the slot is still held.
    assert!(matches!(
        adc.start_low_speed(Selector(3), readings),
        Err(Error::NoSlotAvailable)
    ));
    adc.dispatch_completions();
    adc.start_low_speed(Selector(3), readings)
        .expect("dispatch must free the slot");
}

#[test]
fn oversized_conversions_are_rejected() {
    let adc = scheduler::<1, 4>(FakeAdc::new(8));
    let readings = leak(Readings::<4>::default());
    assert!(matches!(
        adc.start_low_speed(Selector(1), readings),
        Err(Error::TooManySamples {
            needed: 8,
            capacity: 4
        })
    ));

    let mut reader = LowSpeedReader::new(adc, leak(TestScheduler::<1, 4>::reader_static()));
    assert!(matches!(
        block_on(reader.read(Selector(1))),
        Err(Error::TooManySamples { .. })
    ));
    assert!(adc.backend().requests().is_empty());
}

#[test]
fn idle_slots_are_serviced_round_robin_with_wrap() {
    let adc = scheduler::<3, 4>(FakeAdc::new(1));
    let readings = leak(Readings::<4>::default());
    for selector in 1..=3 {
        adc.start_low_speed(Selector(selector), readings)
            .expect("a slot must be free");
    }

    finish(adc);
    adc.dispatch_completions();
    // Lands in slot 0 again, behind the scan position.
    adc.start_low_speed(Selector(4), readings)
        .expect("slot 0 must be free again");
    finish(adc);
    finish(adc);
    finish(adc);
    assert!(!adc.is_busy());

    let selectors: Vec<_> = adc
        .backend()
        .requests()
        .iter()
        .map(|request| request.selector.0)
        .collect();
    assert_eq!(selectors, [1, 2, 3, 4]);

    adc.dispatch_completions();
    let delivered: Vec<_> = readings
        .take()
        .iter()
        .map(|reading| reading.selector.0)
        .collect();
    // Dispatch drains in table order: slot 0 holds selector 4.
    assert_eq!(delivered, [1, 4, 2, 3]);
}

#[test]
fn failed_slot_is_drained_with_an_error_status() {
    let adc = scheduler::<2, 4>(FakeAdc::new(2));
    let readings = leak(Readings::<4>::default());
    adc.start_low_speed(Selector(1), readings)
        .expect("a slot must be free");
    adc.start_low_speed(Selector(2), readings)
        .expect("a slot must be free");

    fail(adc);
    // Restarted from the error interrupt: the next slot is already running.
    assert_eq!(
        adc.backend().pending().map(|request| request.selector),
        Some(Selector(2))
    );
    finish(adc);

    adc.dispatch_completions();
    let delivered = readings.take();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].status, LowSpeedStatus::Error);
    assert!(delivered[0].samples.is_empty());
    assert!(matches!(
        delivered[0].clone().into_result(),
        Err(Error::Conversion)
    ));
    assert_eq!(delivered[1].status, LowSpeedStatus::Ok);
}

#[test]
fn restart_waits_for_dispatch_when_the_backend_cannot_restart_from_error() {
    let adc = scheduler::<2, 4>(FakeAdc::without_error_restart(1));
    let readings = leak(Readings::<4>::default());
    adc.start_low_speed(Selector(1), readings)
        .expect("a slot must be free");
    adc.start_low_speed(Selector(2), readings)
        .expect("a slot must be free");

    fail(adc);
    assert_eq!(adc.backend().pending(), None);
    assert!(!adc.is_busy());

    assert_eq!(adc.dispatch_completions(), 1);
    assert_eq!(
        adc.backend().pending().map(|request| request.selector),
        Some(Selector(2))
    );
    finish(adc);
    adc.dispatch_completions();
    let statuses: Vec<_> = readings.take().iter().map(|reading| reading.status).collect();
    assert_eq!(statuses, [LowSpeedStatus::Error, LowSpeedStatus::Ok]);
}

#[test]
fn reader_sees_conversion_error() {
    let adc = scheduler::<1, 4>(FakeAdc::new(1));
    let mut reader = LowSpeedReader::new(adc, leak(TestScheduler::<1, 4>::reader_static()));

    let hardware = async {
        for _ in 0..10 {
            yield_now().await;
            if adc.backend().pending().is_some() {
                fail(adc);
            }
            adc.dispatch_completions();
        }
    };
    match block_on(select(reader.read(Selector(1)), hardware)) {
        Either::First(result) => assert!(matches!(result, Err(Error::Conversion))),
        Either::Second(()) => panic!("reader never finished"),
    }
}

#[test]
fn three_readers_share_two_slots() {
    let adc = scheduler::<2, 4>(FakeAdc::new(2));
    let probe = leak(Readings::<4>::default());
    let delivered = Cell::new(0_usize);
    let delivered_before_third = Cell::new(None);

    let read = |selector: u8| async move {
        let mut reader = LowSpeedReader::new(adc, leak(TestScheduler::<2, 4>::reader_static()));
        reader.read(Selector(selector)).await
    };

    let hardware = async {
        for pass in 0..50 {
            yield_now().await;
            if pass == 0 {
                // The first two readers hold both slots; the third is waiting.
                assert!(matches!(
                    adc.start_low_speed(Selector(9), probe),
                    Err(Error::NoSlotAvailable)
                ));
                assert_eq!(adc.backend().requests().len(), 1);
            }
            if adc.backend().pending().is_some() {
                finish(adc);
            }
            let third_requested = adc
                .backend()
                .requests()
                .iter()
                .any(|request| request.selector == Selector(3));
            if third_requested && delivered_before_third.get().is_none() {
                delivered_before_third.set(Some(delivered.get()));
            }
            delivered.set(delivered.get() + adc.dispatch_completions());
        }
    };

    let (first, second, third) = match block_on(select(join3(read(1), read(2), read(3)), hardware))
    {
        Either::First(results) => results,
        Either::Second(()) => panic!("readers never finished"),
    };
    assert_eq!(first.expect("first read").as_slice(), &[100, 101]);
    assert_eq!(second.expect("second read").as_slice(), &[200, 201]);
    assert_eq!(third.expect("third read").as_slice(), &[300, 301]);

    assert!(delivered_before_third.get().is_some_and(|count| count >= 1));
    let selectors: Vec<_> = adc
        .backend()
        .requests()
        .iter()
        .map(|request| request.selector.0)
        .collect();
    assert_eq!(selectors, [1, 2, 3]);
}

#[test]
fn abandoned_read_does_not_leak_into_the_next() {
    let adc = scheduler::<2, 4>(FakeAdc::new(1));
    let mut reader = LowSpeedReader::new(adc, leak(TestScheduler::<2, 4>::reader_static()));

    // Installed, then dropped before its conversion finishes.
    match block_on(select(reader.read(Selector(1)), async {})) {
        Either::First(_) => panic!("read cannot finish without the hardware"),
        Either::Second(()) => {}
    }

    let hardware = async {
        for _ in 0..10 {
            yield_now().await;
            if adc.backend().pending().is_some() {
                finish(adc);
            }
            adc.dispatch_completions();
        }
    };
    match block_on(select(reader.read(Selector(2)), hardware)) {
        Either::First(result) => assert_eq!(result.expect("read").as_slice(), &[200]),
        Either::Second(()) => panic!("reader never finished"),
    }
}

#[test]
fn abandoned_reading_dispatched_after_the_fresh_one_is_dropped() {
    let adc = scheduler::<2, 4>(FakeAdc::new(1));
    let readings = leak(Readings::<4>::default());
    let mut reader = LowSpeedReader::new(adc, leak(TestScheduler::<2, 4>::reader_static()));

    // Slot 0 holds a callback request; the abandoned read lands in slot 1.
    adc.start_low_speed(Selector(9), readings)
        .expect("a slot must be free");
    match block_on(select(reader.read(Selector(1)), async {})) {
        Either::First(_) => panic!("read cannot finish without the hardware"),
        Either::Second(()) => {}
    }
    finish(adc);
    assert_eq!(adc.dispatch_completions(), 1);

    // The fresh read takes slot 0, so the same dispatch pass delivers it
    // before the abandoned reading in slot 1.
    let hardware = async {
        yield_now().await;
        finish(adc);
        finish(adc);
        assert_eq!(adc.dispatch_completions(), 2);
        for _ in 0..5 {
            yield_now().await;
        }
    };
    match block_on(select(reader.read(Selector(2)), hardware)) {
        Either::First(result) => assert_eq!(result.expect("read").as_slice(), &[200]),
        Either::Second(()) => panic!("reader never finished"),
    }

    let selectors: Vec<_> = adc
        .backend()
        .requests()
        .iter()
        .map(|request| request.selector.0)
        .collect();
    assert_eq!(selectors, [9, 1, 2]);
    assert_eq!(readings.take().len(), 1);
}
