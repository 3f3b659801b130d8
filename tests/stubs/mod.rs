#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use analysis_runner::protocol::{AnalysisResult, CandidateMove, Query, RootEvaluation};
use analysis_runner::transport::{Transport, TransportError};
use tracing::Level;

type Script = dyn Fn(&Query, usize) -> Result<AnalysisResult, TransportError> + Send + Sync;

/// In-memory engine. `script` receives each query with the number of calls made before it.
pub struct StubTransport {
    script: Arc<Script>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<Query>>>,
}

impl StubTransport {
    pub fn new(
        script: impl Fn(&Query, usize) -> Result<AnalysisResult, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        StubTransport {
            script: Arc::new(script),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            queries: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Answers every query with [`evaluation`].
    pub fn deterministic() -> Self {
        Self::new(|q, _| Ok(evaluation(q)))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared call counter, usable after the transport was moved.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Every query received, shared.
    pub fn queries(&self) -> Arc<Mutex<Vec<Query>>> {
        Arc::clone(&self.queries)
    }
}

impl Transport for StubTransport {
    fn send(&mut self, query: &Query, _timeout: Duration) -> Result<AnalysisResult, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        (self.script)(query, n)
    }
}

/// A result whose win rate only depends on the position.
pub fn evaluation(query: &Query) -> AnalysisResult {
    let plies = query.moves.len() as f64;
    result(&query.id, query.visit_budget, 0.4 + 0.01 * plies, 1.5 - plies)
}

pub fn result(id: &str, visits: u32, winrate: f64, score_lead: f64) -> AnalysisResult {
    AnalysisResult {
        id: id.to_string(),
        root: RootEvaluation {
            visits,
            winrate,
            score_lead,
            score_mean: Some(score_lead),
        },
        candidate_moves: vec![CandidateMove {
            mv: "Q16".to_string(),
            visits,
            winrate,
            score_lead,
            principal_variation: vec!["Q16".to_string(), "D4".to_string()],
        }],
        ownership: None,
    }
}

pub fn degenerate(id: &str) -> AnalysisResult {
    AnalysisResult {
        id: id.to_string(),
        root: RootEvaluation::default(),
        candidate_moves: vec![],
        ownership: None,
    }
}

#[allow(dead_code)]
pub fn init_debug_logger() {
    let _ = tracing_subscriber::fmt()
        .without_time()
        .with_max_level(Level::DEBUG)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
