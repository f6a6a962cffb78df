// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::sync::{atomic::AtomicBool, atomic::Ordering};

#[doc(hidden)]
pub use log as _log;

#[macro_export]
macro_rules! debug {
    ($msg:literal, $($arg:tt)+) => {
        $crate::_log::debug!(target: concat!("octotrack::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        $crate::_log::debug!(target: concat!("octotrack::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! info {
    ($msg:literal, $($arg:tt)+) => {
        $crate::_log::info!(target: concat!("octotrack::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        $crate::_log::info!(target: concat!("octotrack::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! warn {
    ($msg:literal, $($arg:tt)+) => {
        $crate::_log::warn!(target: concat!("octotrack::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        $crate::_log::warn!(target: concat!("octotrack::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! error {
    ($msg:literal, $($arg:tt)+) => {
        $crate::_log::error!(target: concat!("octotrack::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        $crate::_log::error!(target: concat!("octotrack::", module_path!()), $msg);
    };
}

/// Log a diagnostic message at info level if diagnostics logging is enabled.
///
/// Diagnostics are per-sample traces (every sweep point, every tracking step)
/// and are far too chatty for a long-running measurement.
#[macro_export]
macro_rules! diagnostic {
    ($msg:literal, $($arg:tt)+) => {
        if $crate::is_diagnostics_enabled() {
            $crate::_log::info!(target: concat!("octotrack::", module_path!()), $msg, $($arg)+);
        }
    };
    ($msg:literal) => {
        if $crate::is_diagnostics_enabled() {
            $crate::_log::info!(target: concat!("octotrack::", module_path!()), $msg);
        }
    };
}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::Acquire)
}

/// Initialize the logging.
///
/// This function is meant to be called once at the start of the program.
/// It does not install a concrete logger; the binary sets up `env_logger`
/// and the library only emits through the `log` facade.
pub fn init_logging(with_diagnostics: bool) {
    DIAGNOSTICS_ENABLED.store(with_diagnostics, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_flag() {
        init_logging(true);
        assert!(is_diagnostics_enabled());
        diagnostic!("visible only with diagnostics: {}", 1);
        init_logging(false);
        assert!(!is_diagnostics_enabled());
    }
}
