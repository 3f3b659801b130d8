//! Result aggregation and report files.
//!
//! A walk is turned into a [`WalkReport`] once finished ([`WalkReport::finalize`]). A batch is
//! accumulated job by job in a [`BatchAggregator`], owned by the scheduler thread, then turned
//! into a [`BatchReport`]. Both carry a [`Summary`] and serialize to JSON (full structure) or
//! CSV (one flat row per ply or per job).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::progress::{JobStatus, Tally};
use crate::protocol::AnalysisResult;
use crate::transport::TransportError;
use crate::walker::{PlyAnalysis, PlyFailure, SkippedMove, WalkState, WalkStatus};

/// Number of swings kept in a walk summary.
pub const SWING_COUNT: usize = 5;

/// Why a ply or a job produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`TransportError::Unreachable`].
    Unreachable,
    /// See [`TransportError::Timeout`].
    Timeout,
    /// See [`TransportError::MalformedResponse`].
    MalformedResponse,
    /// See [`TransportError::EngineRejected`].
    EngineRejected,
    /// The engine answered with zero visits.
    Degenerate,
    /// Too many consecutive failures, the walk was stopped.
    CircuitOpen,
    /// Cancelled before completion.
    Cancelled,
    /// No transport could be created for a job.
    TransportCreation,
}

impl FailureKind {
    /// Stable name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::EngineRejected => "engine_rejected",
            FailureKind::Degenerate => "degenerate",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Cancelled => "cancelled",
            FailureKind::TransportCreation => "transport_creation",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&TransportError> for FailureKind {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::Unreachable(_) => FailureKind::Unreachable,
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::MalformedResponse(_) => FailureKind::MalformedResponse,
            TransportError::EngineRejected(_) => FailureKind::EngineRejected,
        }
    }
}

/// Error while producing or writing a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// JSON encoding failed.
    #[error("could not encode report as JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// CSV encoding failed.
    #[error("could not encode report as CSV: {0}")]
    Csv(#[from] csv::Error),
    /// Buffer or file IO failed.
    #[error("could not write report to {path}: {source}")]
    Io {
        /// Destination.
        path: PathBuf,
        /// Cause.
        source: std::io::Error,
    },
}

/// Output format of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Full structure.
    Json,
    /// One row per ply or per job.
    Csv,
}

impl ReportFormat {
    /// CSV for a `.csv` extension (any case), JSON otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ReportFormat::Csv,
            _ => ReportFormat::Json,
        }
    }
}

/// Large change of Black's win rate between two analysed consecutive plies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swing {
    /// Position before the move.
    pub from_ply: usize,
    /// Position after the move.
    pub to_ply: usize,
    /// Black win rate after minus before.
    pub delta: f64,
}

/// Statistics shared by walk and batch reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Plies or jobs attempted (cancelled ones excluded).
    pub attempted: usize,
    /// Of which succeeded.
    pub succeeded: usize,
    /// `succeeded / attempted`, 0 when nothing was attempted.
    pub success_rate: f64,
    /// Mean time per attempt, in seconds.
    pub mean_latency: Option<f64>,
    /// Median time per attempt, in seconds.
    pub median_latency: Option<f64>,
    /// Largest win-rate swings, biggest first (walks only).
    pub largest_swings: Vec<Swing>,
}

impl Summary {
    fn compute(latencies: &[Duration], succeeded: usize, largest_swings: Vec<Swing>) -> Self {
        let attempted = latencies.len();
        let mut secs: Vec<f64> = latencies.iter().map(Duration::as_secs_f64).collect();
        secs.sort_by(f64::total_cmp);
        let mean_latency = (!secs.is_empty()).then(|| secs.iter().sum::<f64>() / secs.len() as f64);
        let median_latency = match secs.len() {
            0 => None,
            n if n % 2 == 1 => Some(secs[n / 2]),
            n => Some((secs[n / 2 - 1] + secs[n / 2]) / 2.0),
        };
        Summary {
            attempted,
            succeeded,
            success_rate: if attempted == 0 {
                0.0
            } else {
                succeeded as f64 / attempted as f64
            },
            mean_latency,
            median_latency,
            largest_swings,
        }
    }
}

/// The [`SWING_COUNT`] largest absolute Black win-rate changes between consecutive plies that
/// were both analysed.
pub fn largest_swings(plies: &[PlyAnalysis]) -> Vec<Swing> {
    let mut swings: Vec<Swing> = plies
        .windows(2)
        .filter(|w| w[1].ply == w[0].ply + 1)
        .map(|w| Swing {
            from_ply: w[0].ply,
            to_ply: w[1].ply,
            delta: w[1].black_winrate - w[0].black_winrate,
        })
        .collect();
    swings.sort_by(|a, b| b.delta.abs().total_cmp(&a.delta.abs()));
    swings.truncate(SWING_COUNT);
    swings
}

/// Final state of one batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The engine answered with a usable evaluation.
    Succeeded {
        /// The answer.
        result: AnalysisResult,
    },
    /// Transport error, degenerate answer, or no transport.
    Failed {
        /// Failure class.
        kind: FailureKind,
        /// Raw message.
        message: String,
    },
    /// Never started.
    Cancelled,
}

impl JobOutcome {
    /// Progress status of this outcome.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Outcome of a job with what the report needs to describe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Free text from the job file.
    pub description: String,
    /// Moves replayed.
    pub move_count: usize,
    /// Time spent on the job.
    pub elapsed: Duration,
    /// What happened.
    pub outcome: JobOutcome,
}

/// Accumulates job outcomes as they complete. Single writer.
#[derive(Debug)]
pub struct BatchAggregator {
    total: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    per_job: BTreeMap<String, JobRecord>,
}

impl BatchAggregator {
    /// Aggregator for a batch of `total` jobs.
    pub fn new(total: usize) -> Self {
        BatchAggregator {
            total,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            per_job: BTreeMap::new(),
        }
    }

    /// Store the outcome of `job_id` and return the updated counts.
    ///
    /// A job id recorded twice keeps its first outcome; the second one is stored under a
    /// `#<n>` suffixed key.
    pub fn record(&mut self, job_id: &str, record: JobRecord) -> Tally {
        match record.outcome {
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
        }
        let mut key = job_id.to_string();
        let mut n = 2;
        while self.per_job.contains_key(&key) {
            key = format!("{job_id}#{n}");
            n += 1;
        }
        if key != job_id {
            warn!(job_id, key, "duplicate job id");
        }
        self.per_job.insert(key, record);
        self.tally()
    }

    /// Counts so far.
    pub fn tally(&self) -> Tally {
        Tally {
            completed: self.succeeded + self.failed,
            failed: self.failed,
            total: self.total,
        }
    }

    /// Close the batch.
    pub fn finalize(self, elapsed: Duration) -> BatchReport {
        let latencies: Vec<Duration> = self
            .per_job
            .values()
            .filter(|r| r.outcome != JobOutcome::Cancelled)
            .map(|r| r.elapsed)
            .collect();
        let summary = Summary::compute(&latencies, self.succeeded, vec![]);
        info!(
            succeeded = self.succeeded,
            failed = self.failed,
            cancelled = self.cancelled,
            "batch finished in {elapsed:?}"
        );
        BatchReport {
            total_jobs: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            per_job_results: self.per_job,
            elapsed,
            summary,
        }
    }
}

/// Result of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Jobs submitted.
    pub total_jobs: usize,
    /// Jobs with a usable result.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Jobs never started.
    pub cancelled: usize,
    /// Outcome per job id.
    pub per_job_results: BTreeMap<String, JobRecord>,
    /// Wall-clock duration of the batch.
    pub elapsed: Duration,
    /// Statistics.
    pub summary: Summary,
}

/// Result of a walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkReport {
    /// Final lifecycle state.
    pub status: WalkStatus,
    /// Set when the walk stopped early.
    pub stop_reason: Option<FailureKind>,
    /// Moves replayed (skipped moves excluded).
    pub move_count: usize,
    /// Analysed plies.
    pub plies: Vec<PlyAnalysis>,
    /// Failed plies.
    pub failures: Vec<PlyFailure>,
    /// Moves left out of the replay.
    pub skipped_moves: Vec<SkippedMove>,
    /// Wall-clock duration of the walk.
    pub elapsed: Duration,
    /// Statistics.
    pub summary: Summary,
}

impl WalkReport {
    /// Close a walk.
    pub fn finalize(state: WalkState) -> Self {
        let mut latencies: Vec<Duration> = state.results.iter().map(|p| p.elapsed).collect();
        latencies.extend(state.failures.iter().map(|f| f.elapsed));
        let summary = Summary::compute(
            &latencies,
            state.results.len(),
            largest_swings(&state.results),
        );
        WalkReport {
            status: state.status,
            stop_reason: state.stop_reason,
            move_count: state.move_count,
            plies: state.results,
            failures: state.failures,
            skipped_moves: state.skipped_moves,
            elapsed: state.elapsed,
            summary,
        }
    }
}

/// Any report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    /// Move-by-move analysis of one record.
    Walk(WalkReport),
    /// Independent jobs.
    Batch(BatchReport),
}

impl From<WalkState> for Report {
    fn from(state: WalkState) -> Self {
        Report::Walk(WalkReport::finalize(state))
    }
}

impl From<BatchReport> for Report {
    fn from(report: BatchReport) -> Self {
        Report::Batch(report)
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: String,
    description: String,
    move_count: usize,
    elapsed: f64,
    winrate: Option<f64>,
    score_lead: Option<f64>,
    visits: Option<u32>,
    best_move: Option<&'a str>,
    best_move_winrate: Option<f64>,
}

const CSV_HEADER: [&str; 9] = [
    "id",
    "description",
    "move_count",
    "elapsed",
    "winrate",
    "score_lead",
    "visits",
    "best_move",
    "best_move_winrate",
];

fn csv_rows(report: &Report) -> Vec<CsvRow<'_>> {
    match report {
        Report::Batch(batch) => batch
            .per_job_results
            .iter()
            .map(|(id, job)| {
                let result = match &job.outcome {
                    JobOutcome::Succeeded { result } => Some(result),
                    _ => None,
                };
                let best = result.and_then(AnalysisResult::best_move);
                CsvRow {
                    id: id.clone(),
                    description: job.description.clone(),
                    move_count: job.move_count,
                    elapsed: job.elapsed.as_secs_f64(),
                    winrate: result.map(|r| r.root.winrate),
                    score_lead: result.map(|r| r.root.score_lead),
                    visits: result.map(|r| r.root.visits),
                    best_move: best.map(|m| m.mv.as_str()),
                    best_move_winrate: best.map(|m| m.winrate),
                }
            })
            .collect(),
        Report::Walk(walk) => {
            let mut rows: Vec<(usize, CsvRow<'_>)> = walk
                .plies
                .iter()
                .map(|p| {
                    let best = p.result.best_move();
                    let row = CsvRow {
                        id: p.ply.to_string(),
                        description: describe_ply(p.played_move.map(|m| m.to_string())),
                        move_count: p.ply,
                        elapsed: p.elapsed.as_secs_f64(),
                        winrate: Some(p.display_winrate),
                        score_lead: Some(p.result.root.score_lead),
                        visits: Some(p.result.root.visits),
                        best_move: best.map(|m| m.mv.as_str()),
                        best_move_winrate: best.map(|m| m.winrate),
                    };
                    (p.ply, row)
                })
                .collect();
            rows.extend(walk.failures.iter().map(|f| {
                let row = CsvRow {
                    id: f.ply.to_string(),
                    description: format!("failed: {}", f.kind),
                    move_count: f.ply,
                    elapsed: f.elapsed.as_secs_f64(),
                    winrate: None,
                    score_lead: None,
                    visits: None,
                    best_move: None,
                    best_move_winrate: None,
                };
                (f.ply, row)
            }));
            rows.sort_by_key(|(ply, _)| *ply);
            rows.into_iter().map(|(_, row)| row).collect()
        }
    }
}

fn describe_ply(played: Option<String>) -> String {
    played.unwrap_or_else(|| "start".to_string())
}

/// Encode `report`.
///
/// # Errors
///
/// [`ReportError`] if encoding fails.
pub fn serialize(report: &Report, format: ReportFormat) -> Result<Vec<u8>, ReportError> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_vec_pretty(report)?),
        ReportFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(vec![]);
            writer.write_record(CSV_HEADER)?;
            for row in csv_rows(report) {
                writer.serialize(row)?;
            }
            writer.into_inner().map_err(|e| ReportError::Io {
                path: PathBuf::from("<memory>"),
                source: e.into_error(),
            })
        }
    }
}

/// Write `report` to `path`, as CSV for a `.csv` extension and JSON otherwise.
///
/// # Errors
///
/// [`ReportError`] on encoding or IO failure.
pub fn write_report(report: &Report, path: impl AsRef<Path>) -> Result<(), ReportError> {
    let path = path.as_ref();
    let bytes = serialize(report, ReportFormat::from_path(path))?;
    fs::write(path, bytes).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("report written to {}", path.display());
    Ok(())
}

/// Read back a JSON report.
///
/// # Errors
///
/// [`ReportError`] if the file cannot be read or is not a report.
pub fn read_report(path: impl AsRef<Path>) -> Result<Report, ReportError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_even_count() {
        let latencies = [1, 4, 2, 3].map(Duration::from_secs);
        let summary = Summary::compute(&latencies, 3, vec![]);
        assert_eq!(summary.median_latency, Some(2.5));
        assert_eq!(summary.mean_latency, Some(2.5));
        assert_eq!(summary.success_rate, 0.75);
    }

    #[test]
    fn empty_summary() {
        let summary = Summary::compute(&[], 0, vec![]);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.mean_latency, None);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ReportFormat::from_path(Path::new("a/out.CSV")), ReportFormat::Csv);
        assert_eq!(ReportFormat::from_path(Path::new("out.json")), ReportFormat::Json);
        assert_eq!(ReportFormat::from_path(Path::new("out")), ReportFormat::Json);
    }
}
