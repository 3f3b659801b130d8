//! Live progress of walks and batches.
//!
//! Producers (the walker, the scheduler) push [`ProgressEvent`]s into a [`ProgressSink`]. The
//! sink is bounded and never blocks: when the consumer lags behind, the oldest pending event is
//! dropped to make room. Progress is informative only, results are never carried through it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::report::FailureKind;

/// Default number of events buffered before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 256;

/// Outcome of one ply, as reported while walking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlyProgress {
    /// Position index (number of moves played).
    pub ply: usize,
    /// Displayed win rate, absent on failure.
    pub winrate: Option<f64>,
    /// Score lead, absent on failure.
    pub score_lead: Option<f64>,
    /// Visits spent.
    pub visits: u32,
    /// Engine's preferred move.
    pub recommended_move: Option<String>,
    /// Time spent on this ply, retries included.
    pub elapsed: Duration,
    /// Set when every profile failed.
    pub failure: Option<FailureKind>,
}

/// Terminal state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Non-degenerate result.
    Succeeded,
    /// Transport error or degenerate result.
    Failed,
    /// Never started.
    Cancelled,
}

/// Running counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Jobs finished, failures included.
    pub completed: usize,
    /// Jobs failed.
    pub failed: usize,
    /// Jobs submitted.
    pub total: usize,
}

/// Completion of one batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Job id.
    pub job_id: String,
    /// How it ended.
    pub status: JobStatus,
    /// Time spent on the job.
    pub elapsed: Duration,
    /// Counts after this completion.
    pub tally: Tally,
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// A walk finished a ply.
    Ply(PlyProgress),
    /// A batch finished a job.
    Job(JobProgress),
}

/// Non-blocking, drop-oldest producer side of a progress channel.
///
/// Cloning the sink gives another producer on the same channel.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    channel: Option<(Sender<ProgressEvent>, Receiver<ProgressEvent>)>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSink {
    /// A sink holding at most `capacity` undelivered events (at least one), and its receiver.
    pub fn bounded(capacity: usize) -> (ProgressSink, Receiver<ProgressEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let sink = ProgressSink {
            channel: Some((tx, rx.clone())),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> ProgressSink {
        ProgressSink {
            channel: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `event`, evicting the oldest pending event if the queue is full. Never blocks.
    pub fn emit(&self, mut event: ProgressEvent) {
        let Some((tx, rx)) = &self.channel else {
            return;
        };
        loop {
            match tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Number of events evicted so far, all clones included.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Print every event of `events` to stdout until all its sinks are dropped.
pub fn spawn_console_printer(events: Receiver<ProgressEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("progress-printer".to_string())
        .spawn(move || {
            for event in events {
                trace!(?event);
                match event {
                    ProgressEvent::Ply(p) => print_ply(&p),
                    ProgressEvent::Job(j) => print_job(&j),
                }
            }
        })
}

fn print_ply(p: &PlyProgress) {
    match (p.failure, p.winrate) {
        // clear line, red ply, default
        (Some(kind), _) => println!(
            "\x1b[2K\x1b[31mply {:>3}:\x1b[39m failed ({kind}) after {:.2}s\x1b[0G",
            p.ply,
            p.elapsed.as_secs_f64()
        ),
        (None, winrate) => println!(
            "\x1b[2K\x1b[32mply {:>3}:\x1b[39m winrate {} lead {} visits {} best {} ({:.2}s)\x1b[0G",
            p.ply,
            winrate.map_or("-".to_string(), |w| format!("{:.1}%", w * 100.0)),
            p.score_lead.map_or("-".to_string(), |s| format!("{s:+.1}")),
            p.visits,
            p.recommended_move.as_deref().unwrap_or("-"),
            p.elapsed.as_secs_f64()
        ),
    }
}

fn print_job(j: &JobProgress) {
    let color = match j.status {
        JobStatus::Succeeded => 32,
        JobStatus::Failed => 31,
        JobStatus::Cancelled => 33,
    };
    println!(
        "\x1b[2K\x1b[{color}m{}: \x1b[39m{:?} in {:.2}s [{}/{} done, {} failed]\x1b[0G",
        j.job_id,
        j.status,
        j.elapsed.as_secs_f64(),
        j.tally.completed,
        j.tally.total,
        j.tally.failed
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ply(n: usize) -> ProgressEvent {
        ProgressEvent::Ply(PlyProgress {
            ply: n,
            winrate: Some(0.5),
            score_lead: Some(0.0),
            visits: 1,
            recommended_move: None,
            elapsed: Duration::ZERO,
            failure: None,
        })
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (sink, rx) = ProgressSink::bounded(2);
        for n in 0..5 {
            sink.emit(ply(n));
        }
        let received: Vec<_> = rx
            .try_iter()
            .map(|e| match e {
                ProgressEvent::Ply(p) => p.ply,
                ProgressEvent::Job(_) => unreachable!(),
            })
            .collect();
        assert_eq!(received, vec![3, 4]);
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn disabled_sink_accepts_everything() {
        let sink = ProgressSink::disabled();
        for n in 0..1000 {
            sink.emit(ply(n));
        }
        assert_eq!(sink.dropped(), 0);
    }
}
