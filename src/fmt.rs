//! Crate-internal logging macros.
//!
//! Forward to `defmt` on embedded builds. On `host` builds (and without the
//! `defmt` feature) the arguments are still evaluated by reference so the call
//! sites type-check, but nothing is logged.
#![allow(unused_macros, reason = "not every level is used by every feature set")]

macro_rules! log_with {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(all(feature = "defmt", not(feature = "host")))]
        ::defmt::$level!($s $(, $x)*);
        #[cfg(not(all(feature = "defmt", not(feature = "host"))))]
        let _ = ($(&$x),*);
    }};
}

macro_rules! trace {
    ($($arg:tt)*) => { log_with!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_with!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { log_with!(info, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_with!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_with!(error, $($arg)*) };
}
