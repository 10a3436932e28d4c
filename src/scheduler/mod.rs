//! Poll scheduling.
//!
//! One coordinator task owns a [`ScheduleBook`] and a `JoinSet` of poll
//! workers. It wakes on every tick, reloads the source list from the store,
//! and dispatches due sources while fewer than `max_concurrent_polls` are in
//! flight. Workers run [`pipeline::run_poll`]; their reports move the source
//! back to idle with its next due time (interval on success, jittered
//! exponential backoff on failure).
//!
//! ```text
//!   tick / command ──► reload sources ──► due? ──► spawn worker ──┐
//!         ▲                                                        │
//!         └──────────── record success / failure ◄── PollReport ◄─┘
//! ```

mod pipeline;
mod schedule;

pub use pipeline::{poll_source, run_poll, PollError, PollOutcome, PollReport};
pub use schedule::{backoff_delay, ScheduleBook, SlotState};

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::feed::Fetcher;
use crate::storage::{Database, DatabaseError, Source};

type WorkerResult = (i64, Result<PollReport, Box<dyn Any + Send>>);

#[derive(Debug)]
enum Command {
    PollNow(i64),
    Reload,
}

/// Drives periodic polling of every enabled source.
#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    fetcher: Fetcher,
    config: SchedulerConfig,
    default_interval: Duration,
}

/// Control surface of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Make a source due immediately. Returns false once the scheduler has
    /// stopped.
    pub async fn poll_now(&self, source_id: i64) -> bool {
        self.commands.send(Command::PollNow(source_id)).await.is_ok()
    }

    /// Reload the source list now instead of at the next tick.
    pub async fn reload(&self) -> bool {
        self.commands.send(Command::Reload).await.is_ok()
    }

    /// Stop dispatching, give in-flight polls the configured grace period,
    /// then abort whatever is left. Aborted polls roll back.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        config: SchedulerConfig,
        default_interval_secs: i64,
    ) -> Self {
        Self {
            db,
            fetcher,
            config,
            default_interval: Duration::from_secs(u64::try_from(default_interval_secs).unwrap_or(0)),
        }
    }

    /// Start the coordinator task.
    pub fn spawn(self) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(command_rx, shutdown_rx));
        SchedulerHandle {
            commands: command_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Poll every enabled source once, with the same concurrency bound.
    ///
    /// Results are returned in completion order.
    pub async fn run_once(&self) -> Result<Vec<PollReport>, DatabaseError> {
        let sources: Vec<Source> = self
            .db
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();

        let reports = stream::iter(sources)
            .map(|source| {
                let db = self.db.clone();
                let fetcher = self.fetcher.clone();
                async move { run_poll(&db, &fetcher, &source).await }
            })
            .buffer_unordered(self.config.max_concurrent_polls.max(1))
            .collect()
            .await;
        Ok(reports)
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut book = ScheduleBook::new(
            self.default_interval,
            self.config.max_backoff(),
            self.config.jitter,
        );
        let mut rng = StdRng::from_os_rng();
        let mut sources: HashMap<i64, Source> = HashMap::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_secs = self.config.tick_secs,
            max_concurrent = self.config.max_concurrent_polls,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.complete(&mut book, joined, &mut rng);
                    self.dispatch(&mut book, &sources, &mut workers);
                }

                maybe_command = commands.recv() => {
                    match maybe_command {
                        Some(Command::PollNow(id)) => {
                            self.reload(&mut book, &mut sources).await;
                            if !book.poll_now(id, Utc::now()) {
                                tracing::debug!(source_id = id, "Poll request ignored (unknown or in flight)");
                            }
                        }
                        Some(Command::Reload) => self.reload(&mut book, &mut sources).await,
                        // Every handle is gone; nobody can ask us to stop any more
                        None => break,
                    }
                    self.dispatch(&mut book, &sources, &mut workers);
                }

                _ = tick.tick() => {
                    self.reload(&mut book, &mut sources).await;
                    self.dispatch(&mut book, &sources, &mut workers);
                }
            }
        }

        self.drain(&mut book, &mut workers, &mut rng).await;
        tracing::info!("Scheduler stopped");
    }

    /// Refresh the source snapshot and schedule book from the store.
    async fn reload(&self, book: &mut ScheduleBook, sources: &mut HashMap<i64, Source>) {
        match self.db.list_sources().await {
            Ok(list) => {
                book.sync(&list, Utc::now());
                *sources = list.into_iter().map(|s| (s.id, s)).collect();
                tracing::trace!(
                    tracked = book.tracked(),
                    in_flight = book.in_flight(),
                    "Schedule reloaded"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reload sources, keeping previous schedule");
            }
        }
    }

    fn dispatch(
        &self,
        book: &mut ScheduleBook,
        sources: &HashMap<i64, Source>,
        workers: &mut JoinSet<WorkerResult>,
    ) {
        let limit = self.config.max_concurrent_polls.max(1);
        for id in book.due(Utc::now()) {
            if workers.len() >= limit {
                break;
            }
            let Some(source) = sources.get(&id).cloned() else {
                continue;
            };
            if !book.mark_polling(id) {
                continue;
            }

            tracing::debug!(source_id = id, url = %source.url, "Dispatching poll");
            let db = self.db.clone();
            let fetcher = self.fetcher.clone();
            workers.spawn(async move {
                let report = AssertUnwindSafe(run_poll(&db, &fetcher, &source))
                    .catch_unwind()
                    .await;
                (source.id, report)
            });
        }
    }

    fn complete(
        &self,
        book: &mut ScheduleBook,
        joined: Result<WorkerResult, JoinError>,
        rng: &mut StdRng,
    ) {
        match joined {
            Ok((_, Ok(report))) => {
                let next_due = if report.is_success() {
                    book.record_success(report.source_id, report.finished_at)
                } else {
                    book.record_failure(report.source_id, report.failures, report.finished_at, rng)
                };
                if let Some(next_due) = next_due {
                    tracing::debug!(
                        source_id = report.source_id,
                        next_due = %next_due,
                        "Rescheduled source"
                    );
                }
            }
            Ok((source_id, Err(_))) => {
                tracing::error!(source_id = source_id, "Poll worker panicked");
                book.record_failure(source_id, 1, Utc::now(), rng);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Poll worker did not complete");
            }
        }
    }

    async fn drain(
        &self,
        book: &mut ScheduleBook,
        workers: &mut JoinSet<WorkerResult>,
        rng: &mut StdRng,
    ) {
        if workers.is_empty() {
            return;
        }

        tracing::info!(in_flight = workers.len(), "Waiting for in-flight polls");
        let grace = self.config.shutdown_grace();
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                self.complete(book, joined, rng);
            }
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                grace_secs = grace.as_secs(),
                "Shutdown grace period elapsed, aborting in-flight polls"
            );
            workers.shutdown().await;
        }
    }
}
