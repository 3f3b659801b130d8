//! Runtime behaviour flags
//!
//! These flags control how a run presents itself (console output, log file, engine stderr).
//! Budgets and failure policy live in [`settings`](crate::settings) instead.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `ANALYSIS_VERBOSE`: print progress lines to stdout (default: `true`)
//! - `ANALYSIS_LOG`: write a trace log file in the working directory (default: `false`)
//! - `ANALYSIS_DEBUG_ENGINE_STDERR`: forward the engine subprocess stderr (default: `false`)

/// Behaviour flags of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) debug_engine_stderr: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Engine stderr is discarded.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            debug_engine_stderr: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Recognized variables are `ANALYSIS_VERBOSE`, `ANALYSIS_LOG` and
    /// `ANALYSIS_DEBUG_ENGINE_STDERR` (see module documentation). Any value other than
    /// `"true"` disables the flag; unset variables keep the default.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => flag_enabled(&val),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("ANALYSIS_VERBOSE", true),
            log: get_env_flag("ANALYSIS_LOG", false),
            debug_engine_stderr: get_env_flag("ANALYSIS_DEBUG_ENGINE_STDERR", false),
        }
    }

    /// Enable or disable console progress.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable engine stderr output (debug purposes only).
    pub fn with_debug_engine_stderr(mut self, value: bool) -> Self {
        self.debug_engine_stderr = value;
        self
    }

    /// Console progress enabled.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Log file enabled.
    pub fn log(&self) -> bool {
        self.log
    }

    /// Engine stderr forwarded.
    pub fn debug_engine_stderr(&self) -> bool {
        self.debug_engine_stderr
    }
}

/// Only `"true"`, in any case, enables a flag.
fn flag_enabled(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
