//! Logging macros that compile away when a module turns its `ENABLE_LOGS` off.
//!
//! The capture path runs once per keystroke, so chatty modules declare
//! ```rust,ignore
//! const ENABLE_LOGS: bool = false;
//! use crate::{log_debug, log_info};
//! ```
//! and flip the flag when they need a trace.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}
