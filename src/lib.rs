//! Analog sampling scheduler and software timers for embassy-based firmware.
//!
//! One analog-to-digital conversion engine is shared between a continuous,
//! timer-triggered **high-speed stream** and a small pool of one-shot
//! **low-speed slots**. Low-speed completions are handed from interrupt context
//! to task context by the [`timer::TimerService`], which the rest of an
//! application can also use for polling and animation loops.
//!
//! # Glossary
//!
//! - **Conversion:** a single hardware sampling operation producing one buffer of samples or an error.
//! - **High-speed stream:** a continuous, externally timer-triggered sampling operation writing
//!   into a cyclic buffer in fixed-size chunks.
//! - **Chunk:** the part of the stream's cyclic buffer filled by one conversion.
//! - **Low-speed slot:** one of a fixed pool of one-shot, on-demand conversion requests.
//! - **Missed tick:** a trigger interrupt that fired while the hardware was busy with low-speed work.
//! - **Jab:** forcing a timer to fire on the dispatcher's next pass without waiting for its due time.
#![cfg_attr(not(feature = "host"), no_std)]

// Must come first so the logging macros are visible to every module below.
#[macro_use]
mod fmt;

pub mod adc;
mod error;
pub mod timer;

// Re-export error types and result (used throughout)
pub use crate::error::{Error, Result};
