//! Move-by-move analysis of one game record.
//!
//! [`SequentialWalker::walk`] replays a record one ply at a time: for each position it asks the
//! engine for an evaluation, trying every [`QueryProfile`](crate::settings::QueryProfile) in
//! order until one yields a non-degenerate answer. A position where every profile failed counts
//! as one failure; `failure_threshold` consecutive failures open the circuit and the walk stops
//! early, keeping what was already analysed.
//!
//! Ply `i` is the position after `i` moves. Its win rate is reported from the perspective of
//! the player of move `i` (Black for the empty board), then normalised to Black and to the
//! configured reference color.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, trace, warn};

use crate::cancel::CancelToken;
use crate::game::{Color, GameRecord, Move};
use crate::progress::{PlyProgress, ProgressEvent, ProgressSink};
use crate::protocol::{unique_query_id, AnalysisResult, EngineMove, Query};
use crate::report::FailureKind;
use crate::settings::{AnalysisSettings, QueryProfile};
use crate::transport::Transport;

/// Lifecycle of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkStatus {
    /// Plies remain.
    Running,
    /// Ended early, see [`WalkState::stop_reason`].
    Stopped,
    /// Every requested ply was attempted.
    Completed,
}

/// A successfully analysed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlyAnalysis {
    /// Number of moves played.
    pub ply: usize,
    /// Id of the query that produced the result.
    pub query_id: String,
    /// Move leading to this position, `None` for the empty board.
    pub played_move: Option<Move>,
    /// Player of that move (Black for ply 0).
    pub mover: Color,
    /// Raw engine answer.
    pub result: AnalysisResult,
    /// Root win rate as reported (mover's perspective).
    pub winrate: f64,
    /// Win rate for Black.
    pub black_winrate: f64,
    /// Win rate for the reference color, or the raw value when none is configured.
    pub display_winrate: f64,
    /// Time spent on the position, failed profiles included.
    pub elapsed: Duration,
    /// Name of the profile that succeeded.
    pub profile: String,
}

/// A position every profile failed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlyFailure {
    /// Number of moves played.
    pub ply: usize,
    /// Failure of the last attempted profile.
    pub kind: FailureKind,
    /// Its message.
    pub message: String,
    /// Number of queries sent.
    pub attempts: usize,
    /// Time spent on the position.
    pub elapsed: Duration,
}

/// A recorded move that could not be expressed in engine coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedMove {
    /// Index in the record.
    pub index: usize,
    /// The move.
    pub mv: Move,
    /// Why it was skipped.
    pub reason: String,
}

/// Everything a walk produced. Owned and mutated by one walker only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkState {
    /// Last ply attempted.
    pub current_ply: usize,
    /// Failed plies since the last success.
    pub consecutive_failures: usize,
    /// Analysed positions, in ply order.
    pub results: Vec<PlyAnalysis>,
    /// Failed positions, in ply order.
    pub failures: Vec<PlyFailure>,
    /// Moves dropped before walking; ply numbers count the remaining moves.
    pub skipped_moves: Vec<SkippedMove>,
    /// Lifecycle state.
    pub status: WalkStatus,
    /// [`FailureKind::CircuitOpen`] or [`FailureKind::Cancelled`] when stopped.
    pub stop_reason: Option<FailureKind>,
    /// Number of moves the engine replayed.
    pub move_count: usize,
    /// Wall-clock duration of the walk.
    pub elapsed: Duration,
}

impl WalkState {
    fn new(from_ply: usize) -> Self {
        WalkState {
            current_ply: from_ply,
            consecutive_failures: 0,
            results: vec![],
            failures: vec![],
            skipped_moves: vec![],
            status: WalkStatus::Running,
            stop_reason: None,
            move_count: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Walks game records against one transport, one query at a time.
pub struct SequentialWalker<T: Transport> {
    transport: T,
    settings: AnalysisSettings,
    progress: ProgressSink,
    cancel: CancelToken,
}

impl<T: Transport> SequentialWalker<T> {
    /// A walker without progress reporting.
    pub fn new(transport: T, settings: AnalysisSettings) -> Self {
        SequentialWalker {
            transport,
            settings,
            progress: ProgressSink::disabled(),
            cancel: CancelToken::new(),
        }
    }

    /// Emit a [`ProgressEvent::Ply`] after every position.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = sink;
        self
    }

    /// Stop between plies (and shorten the wait in flight) once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Analyse plies `from_ply ..= min(to_ply, move count)` of `record`.
    ///
    /// Never fails: transport problems end up in [`WalkState::failures`], and an open circuit
    /// or a cancellation in [`WalkState::stop_reason`].
    #[instrument(skip(self, record), fields(moves = record.len(), board_size = record.board_size))]
    pub fn walk(&mut self, record: &GameRecord, from_ply: usize, to_ply: usize) -> WalkState {
        let start = Instant::now();
        let mut state = WalkState::new(from_ply);

        let (played, engine_moves) = self.convert_moves(record, &mut state.skipped_moves);
        state.move_count = engine_moves.len();
        let last = to_ply.min(engine_moves.len());
        if from_ply > last {
            warn!(from_ply, last, "empty ply range");
        }

        for ply in from_ply..=last {
            if self.cancel.is_cancelled() {
                info!(ply, "walk cancelled");
                state.status = WalkStatus::Stopped;
                state.stop_reason = Some(FailureKind::Cancelled);
                break;
            }
            state.current_ply = ply;

            let played_move = ply.checked_sub(1).map(|i| played[i]);
            match self.analyze_ply(record, &engine_moves[..ply], ply, played_move) {
                Ok(analysis) => {
                    self.progress.emit(ProgressEvent::Ply(PlyProgress {
                        ply,
                        winrate: Some(analysis.display_winrate),
                        score_lead: Some(analysis.result.root.score_lead),
                        visits: analysis.result.root.visits,
                        recommended_move: analysis.result.best_move().map(|m| m.mv.clone()),
                        elapsed: analysis.elapsed,
                        failure: None,
                    }));
                    state.consecutive_failures = 0;
                    state.results.push(analysis);
                }
                Err(failure) => {
                    self.progress.emit(ProgressEvent::Ply(PlyProgress {
                        ply,
                        winrate: None,
                        score_lead: None,
                        visits: 0,
                        recommended_move: None,
                        elapsed: failure.elapsed,
                        failure: Some(failure.kind),
                    }));
                    warn!(ply, kind = %failure.kind, "ply failed: {}", failure.message);
                    state.failures.push(failure);
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.settings.failure_threshold {
                        error!(
                            ply,
                            failures = state.consecutive_failures,
                            "too many consecutive failures, stopping walk"
                        );
                        state.status = WalkStatus::Stopped;
                        state.stop_reason = Some(FailureKind::CircuitOpen);
                        break;
                    }
                }
            }
        }

        if state.status == WalkStatus::Running {
            state.status = WalkStatus::Completed;
        }
        state.elapsed = start.elapsed();
        info!(
            status = ?state.status,
            analysed = state.results.len(),
            failed = state.failures.len(),
            "walk finished in {:?}",
            state.elapsed
        );
        state
    }

    /// Engine coordinates of every usable move; the others are recorded as skipped.
    fn convert_moves(
        &self,
        record: &GameRecord,
        skipped: &mut Vec<SkippedMove>,
    ) -> (Vec<Move>, Vec<EngineMove>) {
        let mut played = Vec::with_capacity(record.len());
        let mut engine_moves = Vec::with_capacity(record.len());
        for (index, mv) in record.moves.iter().enumerate() {
            match mv.location.to_engine(record.board_size) {
                Ok(coord) => {
                    played.push(*mv);
                    engine_moves.push(EngineMove(mv.player, coord));
                }
                Err(e) => {
                    warn!(index, "skipping move {}: {e}", mv.player);
                    skipped.push(SkippedMove {
                        index,
                        mv: *mv,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (played, engine_moves)
    }

    fn analyze_ply(
        &mut self,
        record: &GameRecord,
        prefix: &[EngineMove],
        ply: usize,
        played_move: Option<Move>,
    ) -> Result<PlyAnalysis, PlyFailure> {
        let start = Instant::now();
        let mut last_failure = (FailureKind::Cancelled, "cancelled before any query".to_string());
        let mut attempts = 0;

        for profile in &self.settings.profiles {
            if attempts > 0 && self.cancel.is_cancelled() {
                break;
            }
            attempts += 1;
            let query = build_query(record, prefix, ply, profile);
            trace!(id = %query.id, profile = %profile.name, ply, "sending query");

            match self
                .transport
                .send_cancellable(&query, self.settings.call_timeout, &self.cancel)
            {
                Ok(result) if !result.is_degenerate() => {
                    let mover = played_move.map_or(Color::Black, |m| m.player);
                    let winrate = result.root.winrate;
                    let black_winrate = from_perspective(winrate, mover, Color::Black);
                    let display_winrate = match self.settings.reference_color {
                        Some(reference) => from_perspective(winrate, mover, reference),
                        None => winrate,
                    };
                    return Ok(PlyAnalysis {
                        ply,
                        query_id: query.id,
                        played_move,
                        mover,
                        result,
                        winrate,
                        black_winrate,
                        display_winrate,
                        elapsed: start.elapsed(),
                        profile: profile.name.clone(),
                    });
                }
                Ok(_) => {
                    warn!(ply, profile = %profile.name, "degenerate result (0 visits)");
                    last_failure = (
                        FailureKind::Degenerate,
                        "engine returned a result with zero visits".to_string(),
                    );
                }
                Err(e) => {
                    warn!(ply, profile = %profile.name, "query failed: {e}");
                    last_failure = (FailureKind::from(&e), e.to_string());
                }
            }
        }

        let (kind, message) = last_failure;
        Err(PlyFailure {
            ply,
            kind,
            message,
            attempts,
            elapsed: start.elapsed(),
        })
    }
}

fn build_query(
    record: &GameRecord,
    prefix: &[EngineMove],
    ply: usize,
    profile: &QueryProfile,
) -> Query {
    Query {
        id: unique_query_id(&format!("ply{ply}")),
        moves: prefix.to_vec(),
        board_size: record.board_size,
        komi: record.komi,
        rules: record.rules.clone(),
        analysis_targets: vec![ply],
        visit_budget: profile.visit_budget,
        time_budget: profile.time_budget,
        options: profile.options,
    }
}

/// `winrate` seen by `mover`, expressed for `target`.
fn from_perspective(winrate: f64, mover: Color, target: Color) -> f64 {
    if mover == target {
        winrate
    } else {
        1.0 - winrate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perspective_inverts_for_opponent() {
        assert_eq!(from_perspective(0.7, Color::Black, Color::Black), 0.7);
        assert!((from_perspective(0.7, Color::White, Color::Black) - 0.3).abs() < 1e-12);
    }
}
