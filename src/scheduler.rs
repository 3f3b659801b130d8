//! Concurrent execution of independent jobs.
//!
//! [`BatchScheduler::run`] keeps up to `concurrency` jobs in flight, each on its own thread with
//! its own transport. Completions come back to the calling thread over a channel, in
//! completion order; that thread is the only one touching the [`BatchAggregator`].
//!
//! Transports are created lazily through the [`TransportFactory`] and handed back with each
//! completion so the next job reuses them. No more than `concurrency` transports are ever
//! alive. A transport whose job failed with [`TransportError::Unreachable`] is dropped, and a
//! fresh one is created for a later job.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::cancel::CancelToken;
use crate::jobs::Job;
use crate::progress::{JobProgress, ProgressEvent, ProgressSink};
use crate::protocol::unique_query_id;
use crate::report::{BatchAggregator, BatchReport, FailureKind, JobOutcome, JobRecord};
use crate::settings::AnalysisSettings;
use crate::transport::{Transport, TransportError, TransportFactory};

struct Completion {
    job_id: String,
    record: JobRecord,
    transport: Option<Box<dyn Transport>>,
}

/// Runs batches of [`Job`]s over a bounded pool of transports.
pub struct BatchScheduler {
    factory: Arc<dyn TransportFactory>,
    settings: AnalysisSettings,
    progress: ProgressSink,
    cancel: CancelToken,
}

impl BatchScheduler {
    /// A scheduler without progress reporting.
    pub fn new(factory: impl TransportFactory + 'static, settings: AnalysisSettings) -> Self {
        BatchScheduler {
            factory: Arc::new(factory),
            settings,
            progress: ProgressSink::disabled(),
            cancel: CancelToken::new(),
        }
    }

    /// Emit a [`ProgressEvent::Job`] after every job.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = sink;
        self
    }

    /// Stop launching jobs once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token observed by this scheduler.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every job and return the report.
    ///
    /// Never fails: job failures, including transport creation failures, are recorded in the
    /// report. Jobs not started when cancellation is observed are recorded as
    /// [`JobOutcome::Cancelled`].
    #[instrument(skip_all, fields(jobs = jobs.len(), concurrency = self.settings.concurrency))]
    pub fn run(&self, jobs: Vec<Job>) -> BatchReport {
        let start = Instant::now();
        let mut aggregator = BatchAggregator::new(jobs.len());
        let mut pending: VecDeque<Job> = jobs.into();
        let mut idle: Vec<Box<dyn Transport>> = vec![];
        let (tx_result, rx_result) = mpsc::channel();
        let mut running = 0;

        loop {
            while running < self.settings.concurrency && !self.cancel.is_cancelled() {
                let Some(job) = pending.pop_front() else {
                    break;
                };
                match self.launch_job(job, idle.pop(), tx_result.clone()) {
                    Ok(()) => running += 1,
                    Err(c) => self.on_completion(&mut aggregator, c.job_id, c.record),
                }
            }

            if running == 0 {
                break;
            }

            // not finished <=> job running <=> result to receive
            let Ok(completion) = rx_result.recv() else {
                error!("result channel closed with {running} jobs running");
                break;
            };
            running -= 1;
            let Completion {
                job_id,
                record,
                transport,
            } = completion;
            if let Some(transport) = transport {
                idle.push(transport);
            }
            self.on_completion(&mut aggregator, job_id, record);
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "batch cancelled, skipping pending jobs");
        }
        for job in pending {
            let record = JobRecord {
                description: job.description,
                move_count: job.moves.len(),
                elapsed: Default::default(),
                outcome: JobOutcome::Cancelled,
            };
            self.on_completion(&mut aggregator, job.id, record);
        }

        debug!(idle = idle.len(), "releasing transports");
        drop(idle);
        aggregator.finalize(start.elapsed())
    }

    fn on_completion(&self, aggregator: &mut BatchAggregator, job_id: String, record: JobRecord) {
        let status = record.outcome.status();
        let elapsed = record.elapsed;
        trace!(job = %job_id, ?status, "job completed");
        let tally = aggregator.record(&job_id, record);
        self.progress.emit(ProgressEvent::Job(JobProgress {
            job_id,
            status,
            elapsed,
            tally,
        }));
    }

    /// Start `job` on its own thread. Gives the job back as a failed completion if the thread
    /// cannot be spawned.
    fn launch_job(
        &self,
        job: Job,
        transport: Option<Box<dyn Transport>>,
        tx_result: Sender<Completion>,
    ) -> Result<(), Completion> {
        let job_id = job.id.clone();
        let description = job.description.clone();
        let move_count = job.moves.len();
        let factory = Arc::clone(&self.factory);
        let settings = self.settings.clone();
        let cancel = self.cancel.clone();

        thread::Builder::new()
            .name(format!("job-{job_id}"))
            .spawn(move || {
                let start = Instant::now();
                let run = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_job(&job, transport, factory.as_ref(), &settings, &cancel)
                }));
                let (outcome, transport) = run.unwrap_or_else(|_| {
                    error!(job = %job.id, "job thread panicked");
                    let outcome = JobOutcome::Failed {
                        kind: FailureKind::Unreachable,
                        message: "job thread panicked".to_string(),
                    };
                    (outcome, None)
                });
                let completion = Completion {
                    job_id: job.id.clone(),
                    record: JobRecord {
                        description: job.description.clone(),
                        move_count: job.moves.len(),
                        elapsed: start.elapsed(),
                        outcome,
                    },
                    transport,
                };
                // the receiver outlives every worker
                let _ = tx_result.send(completion);
            })
            .map(|_| ())
            .map_err(|e| {
                warn!(job = %job_id, "could not start job thread: {e}");
                Completion {
                    job_id,
                    record: JobRecord {
                        description,
                        move_count,
                        elapsed: Default::default(),
                        outcome: JobOutcome::Failed {
                            kind: FailureKind::TransportCreation,
                            message: format!("could not start job thread: {e}"),
                        },
                    },
                    transport: None,
                }
            })
    }
}

/// Evaluate one job. Returns the transport unless it must not be reused.
fn run_job(
    job: &Job,
    transport: Option<Box<dyn Transport>>,
    factory: &dyn TransportFactory,
    settings: &AnalysisSettings,
    cancel: &CancelToken,
) -> (JobOutcome, Option<Box<dyn Transport>>) {
    let mut transport = match transport {
        Some(t) => t,
        None => match factory.create() {
            Ok(t) => t,
            Err(e) => {
                warn!(job = %job.id, "could not create transport: {e}");
                let outcome = JobOutcome::Failed {
                    kind: FailureKind::TransportCreation,
                    message: e.to_string(),
                };
                return (outcome, None);
            }
        },
    };

    let query = job.to_query(
        unique_query_id(&job.id),
        settings.time_budget.map(|d| d.as_secs_f64()),
        settings.batch_options,
    );
    trace!(job = %job.id, id = %query.id, "sending query");

    match transport.send_cancellable(&query, settings.call_timeout, cancel) {
        Ok(result) if result.is_degenerate() => {
            warn!(job = %job.id, "degenerate result (0 visits)");
            let outcome = JobOutcome::Failed {
                kind: FailureKind::Degenerate,
                message: "engine returned a result with zero visits".to_string(),
            };
            (outcome, Some(transport))
        }
        Ok(result) => (JobOutcome::Succeeded { result }, Some(transport)),
        Err(e) => {
            warn!(job = %job.id, "job failed: {e}");
            let keep = !matches!(e, TransportError::Unreachable(_));
            let outcome = JobOutcome::Failed {
                kind: FailureKind::from(&e),
                message: e.to_string(),
            };
            (outcome, keep.then_some(transport))
        }
    }
}
