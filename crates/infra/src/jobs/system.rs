//! Process-wide job system lifecycle.
//!
//! Owns the background tasks (processor loop, stale-run reaper, retention
//! cleanup) and exposes an idempotent `start()`/`stop()` pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::JobSystemConfig;

use super::processor::{HandlerRegistry, JobProcessor, ProcessorStats};
use super::queue::JobQueue;
use super::reaper::StaleRunReaper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Another caller is in the middle of `start()`
    StartInProgress,
}

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct JobSystem {
    queue: JobQueue,
    processor: Arc<JobProcessor>,
    reaper: StaleRunReaper,
    config: JobSystemConfig,
    starting: AtomicBool,
    running: Mutex<Option<RunningTasks>>,
}

impl JobSystem {
    pub fn new(queue: JobQueue, handlers: HandlerRegistry, config: JobSystemConfig) -> Self {
        let processor = JobProcessor::new(queue.clone(), handlers, config.processor_config());
        let reaper = StaleRunReaper::new(
            queue.clone(),
            processor.failure_handler().clone(),
            config.stale_threshold,
        );

        Self {
            queue,
            processor: Arc::new(processor),
            reaper,
            config,
            starting: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the background tasks unless they are already running.
    pub async fn start(&self) -> StartOutcome {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StartOutcome::StartInProgress;
        }

        let outcome = {
            let mut running = self.running.lock().await;
            if running.is_some() {
                StartOutcome::AlreadyRunning
            } else {
                *running = Some(self.spawn_tasks());
                StartOutcome::Started
            }
        };

        self.starting.store(false, Ordering::Release);

        match outcome {
            StartOutcome::Started => info!(worker = %self.config.worker_name, "job system started"),
            _ => warn!(outcome = ?outcome, "job system start ignored"),
        }
        outcome
    }

    /// Signal the background tasks and wait for them. Returns whether the
    /// system was running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        let _ = running.shutdown.send(true);
        for (name, task) in running.tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "job system task ended abnormally");
            }
        }

        info!(worker = %self.config.worker_name, "job system stopped");
        true
    }

    fn spawn_tasks(&self) -> RunningTasks {
        let (shutdown, rx) = watch::channel(false);

        let processor = {
            let processor = self.processor.clone();
            let rx = rx.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };

        let reaper = {
            let reaper = self.reaper.clone();
            periodic("reaper", self.config.reaper_interval, rx.clone(), move || {
                let reaper = reaper.clone();
                async move {
                    if let Err(e) = reaper.reap_once().await {
                        error!(error = %e, "stale-run reaper pass failed");
                    }
                }
            })
        };

        let cleanup = {
            let queue = self.queue.clone();
            let completed = self.config.completed_retention;
            let failed = self.config.failed_retention;
            periodic("cleanup", self.config.cleanup_interval, rx, move || {
                let queue = queue.clone();
                async move {
                    if let Err(e) = queue.cleanup_completed_jobs(completed).await {
                        error!(error = %e, "completed-job cleanup failed");
                    }
                    if let Err(e) = queue.cleanup_expired_jobs(failed).await {
                        error!(error = %e, "expired-job cleanup failed");
                    }
                }
            })
        };

        RunningTasks {
            shutdown,
            tasks: vec![("processor", processor), ("reaper", reaper), ("cleanup", cleanup)],
        }
    }
}

/// Run `tick` every `period` until shutdown is signalled.
fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!(task = name, "periodic task stopped");
    })
}
