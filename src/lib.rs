//! # Analysis Runner
//!
//! Drives an external position-evaluation engine for the game of Go, treated as a black box
//! answering one JSON query with one JSON response.
//!
//! It provides:
//! - Move-by-move analysis of a game record ([`SequentialWalker`](crate::walker::SequentialWalker)),
//!   with a consecutive-failure circuit breaker and degrading retry profiles
//! - Concurrent analysis of independent jobs ([`BatchScheduler`](crate::scheduler::BatchScheduler))
//!   over a bounded pool of engine connections, with cooperative cancellation
//! - Two engine transports: a long-lived subprocess spoken to over its pipes, and an HTTP
//!   endpoint with retries
//! - Live progress events and JSON/CSV reports with summary statistics
//!
//! Every query carries a unique id that the engine echoes back, so answers to abandoned
//! queries are recognised and dropped instead of being attributed to the wrong position.
//!
//! # Documentation Overview
//!
//! - For coordinate conversions between game records and the engine, see [`coordinate`].
//! - For budgets, failure threshold and retry profiles, see
//!   [`AnalysisSettingsBuilder`](crate::settings::AnalysisSettingsBuilder).
//! - For runtime behaviour (console output, log file), see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For engine access, see the [`Transport`](crate::transport::Transport) trait.
//! - For report contents and formats, see [`report`].
//!
//! # Usage Example
//!
//! ```no_run
//! use analysis_runner::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = AnalysisSettingsBuilder::from_env()
//!         .with_visit_budget(200)
//!         .with_reference_color(Color::Black)
//!         .build()?;
//!
//!     let engine = ProcessConfig::from_command_line("katago analysis -config analysis.cfg")
//!         .ok_or_else(|| anyhow::anyhow!("empty command"))?;
//!     let transport = ProcessTransport::spawn(&engine)?;
//!
//!     let record = GameRecord::from_sgf("(;SZ[19]KM[6.5];B[pd];W[dp];B[pp])")?;
//!     let mut walker = SequentialWalker::new(transport, settings);
//!     let state = walker.walk(&record, 0, record.len());
//!
//!     for ply in &state.results {
//!         println!("{}: {:.1}%", ply.ply, ply.display_winrate * 100.0);
//!     }
//!     write_report(&Report::from(state), "walk.json")?;
//!     Ok(())
//! }
//! ```
//!
//! Batches work the same way, with a [`TransportFactory`](crate::transport::TransportFactory)
//! instead of a transport:
//!
//! ```no_run
//! use analysis_runner::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = AnalysisSettingsBuilder::new().with_concurrency(4).build()?;
//!     let factory = HttpConfig::new("http://localhost:8080").with_api_key("secret");
//!     let report = BatchScheduler::new(factory, settings).run(sample_jobs());
//!     println!("{}/{} succeeded", report.succeeded, report.total_jobs);
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;
pub mod cancel;
pub mod configuration;
pub mod coordinate;
pub mod game;
pub mod jobs;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod settings;
pub mod transport;
pub mod walker;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use analysis_runner::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::configuration::Configuration;
    pub use crate::game::{Color, GameRecord, Move};
    pub use crate::jobs::{load_jobs, sample_jobs, Job};
    pub use crate::progress::{ProgressEvent, ProgressSink};
    pub use crate::report::{write_report, BatchReport, Report};
    pub use crate::scheduler::BatchScheduler;
    pub use crate::settings::{AnalysisSettings, AnalysisSettingsBuilder, Preset, QueryProfile};
    pub use crate::transport::{
        HttpConfig, HttpTransport, ProcessConfig, ProcessTransport, Transport, TransportError,
        TransportFactory,
    };
    pub use crate::walker::{SequentialWalker, WalkState, WalkStatus};
}
