//! Analysis budgets and failure policy.
//!
//! The main entry point is [`AnalysisSettingsBuilder`], which configures:
//!
//! - **Search budgets**: visits and (optional) time per query
//! - **Call timeout**: how long a transport may wait for one answer
//! - **Failure policy**: consecutive-failure threshold of the walker and the ordered list of
//!   [`QueryProfile`]s tried for each position before it counts as failed
//! - **Batch width**: number of jobs in flight
//! - **Perspective**: the color win rates are normalised to for display
//!
//! Once built, an [`AnalysisSettings`] value is immutable and shared by the walker and the
//! scheduler.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use analysis_runner::settings::AnalysisSettingsBuilder;
//!
//! let settings = AnalysisSettingsBuilder::new()
//!     .with_visit_budget(400)
//!     .with_time_budget(Duration::from_secs(5))
//!     .with_failure_threshold(5)
//!     .with_concurrency(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(settings.concurrency(), 4);
//! ```
//!
//! Settings can also be read from environment variables with
//! [`AnalysisSettingsBuilder::from_env()`].

use std::env;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::game::Color;
use crate::protocol::QueryOptions;

/// Visit budget used when none is configured.
pub const DEFAULT_VISIT_BUDGET: u32 = 200;
/// Consecutive failures before a walk is stopped.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 3;
/// Visit budget of the reduced fallback profile.
pub const FALLBACK_VISIT_BUDGET: u32 = 50;
/// Extra time granted to a call on top of the engine time budget.
const CALL_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// A seconds count read from `var`; negative, non-finite and unrepresentable values are ignored.
fn secs_to_duration(var: &str, secs: f64) -> Option<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if secs.is_finite() => Some(duration),
        _ => {
            warn!("ignoring {var}={secs}: not a usable number of seconds");
            None
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
enum AutoConcurrency {
    #[default]
    Auto,
    Count(usize),
}

/// Named budget presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// 50 visits, 5 seconds.
    Fast,
    /// 100 visits, 10 seconds.
    Standard,
    /// 300 visits, 20 seconds.
    Precise,
}

/// One way of asking the engine about a position.
///
/// A position is tried with each profile in order until one yields a non-degenerate result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryProfile {
    /// Name shown in logs and reports.
    pub name: String,
    /// Visit budget.
    pub visit_budget: u32,
    /// Time budget in seconds.
    pub time_budget: Option<f64>,
    /// Requested optional outputs.
    pub options: QueryOptions,
}

impl QueryProfile {
    /// The configured budget, with policy output.
    pub fn primary(visit_budget: u32, time_budget: Option<Duration>) -> Self {
        QueryProfile {
            name: "primary".to_string(),
            visit_budget,
            time_budget: time_budget.map(|d| d.as_secs_f64()),
            options: QueryOptions {
                include_policy: true,
                ..Default::default()
            },
        }
    }

    /// Minimal request: few visits, no time budget, no optional output.
    pub fn reduced(visit_budget: u32) -> Self {
        QueryProfile {
            name: "reduced".to_string(),
            visit_budget: visit_budget.min(FALLBACK_VISIT_BUDGET),
            time_budget: None,
            options: QueryOptions::default(),
        }
    }
}

/// A builder for [`AnalysisSettings`].
///
/// By default: 200 visits, no time budget, a 30 second call timeout, a failure threshold of 3,
/// the primary-then-reduced profile list, one job in flight per physical CPU, and raw
/// (mover's perspective) win rates.
#[derive(Debug, Default)]
pub struct AnalysisSettingsBuilder {
    visit_budget: Option<u32>,
    time_budget: Option<Duration>,
    call_timeout: Option<Duration>,
    failure_threshold: Option<usize>,
    concurrency: AutoConcurrency,
    reference_color: Option<Color>,
    profiles: Option<Vec<QueryProfile>>,
    batch_options: Option<QueryOptions>,
}

impl AnalysisSettingsBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `MAX_VISITS` (u32): visit budget per query
    /// - `MAX_TIME_SECS` (f64): engine time budget per query
    /// - `CALL_TIMEOUT_SECS` (f64): transport timeout per call
    /// - `FAILURE_THRESHOLD` (usize): consecutive failures before a walk stops
    /// - `CONCURRENCY` (usize): jobs in flight during a batch
    /// - `REFERENCE_COLOR` (`black`/`white`): perspective of displayed win rates
    ///
    /// Unset or unparsable variables keep their default.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            let value = env::var(var).ok()?;
            let parsed = value.parse().ok();
            if parsed.is_none() {
                warn!("ignoring {var}={value}: not a valid value");
            }
            parsed
        }

        fn parse_secs(var: &str) -> Option<Duration> {
            parse::<f64>(var).and_then(|secs| secs_to_duration(var, secs))
        }

        AnalysisSettingsBuilder {
            visit_budget: parse("MAX_VISITS"),
            time_budget: parse_secs("MAX_TIME_SECS"),
            call_timeout: parse_secs("CALL_TIMEOUT_SECS"),
            failure_threshold: parse("FAILURE_THRESHOLD"),
            concurrency: parse("CONCURRENCY")
                .map(AutoConcurrency::Count)
                .unwrap_or_default(),
            reference_color: parse("REFERENCE_COLOR"),
            profiles: None,
            batch_options: None,
        }
    }

    /// Apply a named preset (visit budget, time budget, call timeout).
    #[must_use]
    pub fn with_preset(self, preset: Preset) -> Self {
        let (visits, secs) = match preset {
            Preset::Fast => (50, 5),
            Preset::Standard => (100, 10),
            Preset::Precise => (300, 20),
        };
        let time = Duration::from_secs(secs);
        Self {
            visit_budget: Some(visits),
            time_budget: Some(time),
            call_timeout: Some(time + CALL_TIMEOUT_MARGIN),
            ..self
        }
    }

    /// Sets the maximum number of visits per query.
    #[must_use]
    pub fn with_visit_budget(self, visits: u32) -> Self {
        Self {
            visit_budget: Some(visits),
            ..self
        }
    }

    /// Sets the engine-side time budget per query.
    #[must_use]
    pub fn with_time_budget(self, duration: Duration) -> Self {
        Self {
            time_budget: Some(duration),
            ..self
        }
    }

    /// Sets how long one transport call may wait for its answer.
    ///
    /// Defaults to the time budget plus 5 seconds, or 30 seconds without time budget.
    #[must_use]
    pub fn with_call_timeout(self, duration: Duration) -> Self {
        Self {
            call_timeout: Some(duration),
            ..self
        }
    }

    /// Sets the number of consecutive failed positions after which a walk stops.
    #[must_use]
    pub fn with_failure_threshold(self, threshold: usize) -> Self {
        Self {
            failure_threshold: Some(threshold),
            ..self
        }
    }

    /// Sets the number of batch jobs in flight (and so of engine connections).
    #[must_use]
    pub fn with_concurrency(self, count: usize) -> Self {
        Self {
            concurrency: AutoConcurrency::Count(count),
            ..self
        }
    }

    /// Normalise displayed win rates to `color`'s perspective.
    #[must_use]
    pub fn with_reference_color(self, color: Color) -> Self {
        Self {
            reference_color: Some(color),
            ..self
        }
    }

    /// Replace the degrading profile list.
    #[must_use]
    pub fn with_profiles(self, profiles: Vec<QueryProfile>) -> Self {
        Self {
            profiles: Some(profiles),
            ..self
        }
    }

    /// Optional outputs requested for batch jobs (default: ownership and PV visits).
    #[must_use]
    pub fn with_batch_options(self, options: QueryOptions) -> Self {
        Self {
            batch_options: Some(options),
            ..self
        }
    }

    /// Consumes the builder and returns the settings.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is unusable: zero visits, zero threshold, zero
    /// concurrency, an empty profile list, or a zero call timeout.
    pub fn build(self) -> anyhow::Result<AnalysisSettings> {
        let visit_budget = self.visit_budget.unwrap_or(DEFAULT_VISIT_BUDGET);
        if visit_budget == 0 {
            bail!("visit budget must be at least 1");
        }

        let failure_threshold = self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if failure_threshold == 0 {
            bail!("failure threshold must be at least 1");
        }

        let concurrency = match self.concurrency {
            AutoConcurrency::Auto => num_cpus::get_physical().max(1),
            AutoConcurrency::Count(0) => bail!("concurrency must be at least 1"),
            AutoConcurrency::Count(n) => n,
        };

        let call_timeout = match (self.call_timeout, self.time_budget) {
            (Some(timeout), _) => timeout,
            (None, Some(t)) => t
                .checked_add(CALL_TIMEOUT_MARGIN)
                .context("time budget too large to derive a call timeout")?,
            (None, None) => Duration::from_secs(30),
        };
        if call_timeout.is_zero() {
            bail!("call timeout must be positive");
        }

        let profiles = match self.profiles {
            Some(p) => p,
            None => vec![
                QueryProfile::primary(visit_budget, self.time_budget),
                QueryProfile::reduced(visit_budget),
            ],
        };
        if profiles.is_empty() {
            bail!("at least one query profile is required");
        }
        if let Some(p) = profiles.iter().find(|p| p.visit_budget == 0) {
            return Err(anyhow::anyhow!("profile '{}' has a zero visit budget", p.name))
                .context("invalid query profiles");
        }

        Ok(AnalysisSettings {
            visit_budget,
            time_budget: self.time_budget,
            call_timeout,
            failure_threshold,
            concurrency,
            reference_color: self.reference_color,
            profiles,
            batch_options: self.batch_options.unwrap_or(QueryOptions {
                include_ownership: true,
                include_pv_visits: true,
                include_policy: false,
            }),
        })
    }
}

/// Obtained using [`AnalysisSettingsBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub(crate) visit_budget: u32,
    pub(crate) time_budget: Option<Duration>,
    pub(crate) call_timeout: Duration,
    pub(crate) failure_threshold: usize,
    pub(crate) concurrency: usize,
    pub(crate) reference_color: Option<Color>,
    pub(crate) profiles: Vec<QueryProfile>,
    pub(crate) batch_options: QueryOptions,
}

impl AnalysisSettings {
    /// create an AnalysisSettingsBuilder
    pub fn builder() -> AnalysisSettingsBuilder {
        AnalysisSettingsBuilder::new()
    }

    /// Visit budget of the primary profile.
    pub fn visit_budget(&self) -> u32 {
        self.visit_budget
    }

    /// Engine time budget.
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget
    }

    /// Transport timeout per call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Consecutive failures tolerated by the walker.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Jobs in flight during a batch.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Perspective of displayed win rates.
    pub fn reference_color(&self) -> Option<Color> {
        self.reference_color
    }

    /// Degrading profile list.
    pub fn profiles(&self) -> &[QueryProfile] {
        &self.profiles
    }

    /// Optional outputs of batch queries.
    pub fn batch_options(&self) -> QueryOptions {
        self.batch_options
    }
}
