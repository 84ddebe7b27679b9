//! One round of a fixed-size worker pool over a queue of tasks.
//!
//! Workers pop tasks without waiting and exit as soon as the queue is empty.
//! Every claimed task is reported exactly once on the outcome channel, so the
//! orchestrator sees the end of the round when the channel closes.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, error};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::DownloaderError;
use crate::types::Task;

#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub worker: usize,
    pub attempt: u32,
    pub total: usize,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded {
        task: Task,
        elapsed: Duration,
    },
    Failed {
        task: Task,
        elapsed: Duration,
        error: DownloaderError,
    },
}

pub struct Round {
    queue: Arc<Mutex<VecDeque<Task>>>,
    outcomes: mpsc::Receiver<TaskOutcome>,
    workers: JoinSet<()>,
}

impl Round {
    pub fn start<J, Fut>(
        attempt: u32,
        tasks: Vec<Task>,
        workers: usize,
        shutdown: CancellationToken,
        job: J,
    ) -> Self
    where
        J: Fn(Task, WorkerContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Task, DownloaderError>> + Send + 'static,
    {
        let total = tasks.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let (tx, outcomes) = mpsc::channel(total.max(1));

        let mut set = JoinSet::new();
        for worker in 0..workers.max(1).min(total) {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            let job = job.clone();
            set.spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        debug!("Worker {} stopping on shutdown", worker);
                        break;
                    }
                    let Some(task) = queue.lock().await.pop_front() else {
                        debug!("Worker {} found the queue empty", worker);
                        break;
                    };

                    let ctx = WorkerContext {
                        worker,
                        attempt,
                        total,
                    };
                    let started = Instant::now();
                    let result = tokio::select! {
                        r = AssertUnwindSafe(job(task.clone(), ctx)).catch_unwind() => {
                            r.unwrap_or_else(|_| {
                                Err(DownloaderError::DownloadError("worker panicked".to_string()))
                            })
                        }
                        _ = shutdown.cancelled() => Err(DownloaderError::TransferInterrupted),
                    };
                    let elapsed = started.elapsed();

                    let outcome = match result {
                        Ok(task) => TaskOutcome::Succeeded { task, elapsed },
                        Err(error) => TaskOutcome::Failed {
                            task,
                            elapsed,
                            error,
                        },
                    };
                    if tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            queue,
            outcomes,
            workers: set,
        }
    }

    /// Next reported outcome; `None` once every worker has exited.
    pub async fn next(&mut self) -> Option<TaskOutcome> {
        self.outcomes.recv().await
    }

    /// Joins the workers and returns tasks nobody claimed (only after shutdown).
    pub async fn finish(mut self) -> Vec<Task> {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        let leftover: Vec<Task> = self.queue.lock().await.drain(..).collect();
        leftover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_listing;
    use crate::types::Report;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tasks(n: usize) -> Vec<Task> {
        sample_listing(n)
            .history
            .iter()
            .flat_map(|e| Report::new(&e.timestamp, &e.report).unwrap().tasks.into_values())
            .collect()
    }

    #[tokio::test]
    async fn every_task_is_reported_once() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut round = Round::start(1, tasks(3), 4, CancellationToken::new(), move |task, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.total, 6);
                if task.kind == "radio" {
                    Err(DownloaderError::DownloadError("nope".to_string()))
                } else {
                    Ok(task)
                }
            }
        });

        let (mut ok, mut failed) = (0, 0);
        while let Some(outcome) = round.next().await {
            match outcome {
                TaskOutcome::Succeeded { .. } => ok += 1,
                TaskOutcome::Failed { .. } => failed += 1,
            }
        }
        assert!(round.finish().await.is_empty());
        assert_eq!((ok, failed), (3, 3));
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn panicking_job_counts_as_failure() {
        let job = |task: Task, _| async move {
            if task.kind == "radio" {
                panic!("boom");
            }
            Ok::<Task, DownloaderError>(task)
        };
        let mut round = Round::start(1, tasks(1), 2, CancellationToken::new(), job);
        let mut failed = Vec::new();
        while let Some(outcome) = round.next().await {
            if let TaskOutcome::Failed { task, .. } = outcome {
                failed.push(task.kind);
            }
        }
        round.finish().await;
        assert_eq!(failed, vec!["radio".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_round_returns_unclaimed_tasks() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut round = Round::start(1, tasks(2), 2, shutdown, |task: Task, _| async move {
            Ok::<Task, DownloaderError>(task)
        });
        assert!(round.next().await.is_none());
        assert_eq!(round.finish().await.len(), 4);
    }
}
