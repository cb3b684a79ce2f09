//! Conditional logging macros gated on a module-level `ENABLE_LOGS` flag.
//!
//! High-frequency loops (the network monitor, the probe cycles) log through
//! these so a whole module's chatter can be silenced with one constant:
//!
//! ```rust
//! const ENABLE_LOGS: bool = true;
//!
//! use pulsetrack::{log_info, log_warn, log_error};
//!
//! log_info!("probe cycle finished");
//! ```

/// Conditional info logging; checks `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Conditional warn logging; checks `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Conditional error logging; checks `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
