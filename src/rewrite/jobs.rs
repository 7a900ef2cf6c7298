//! Bounded worker pool draining a queue of [`RewriteJob`]s.
//!
//! All jobs are enqueued up front on an mpsc channel; `workers` tasks share
//! the receiver and pull until it is drained. Each finished job is sent back
//! as soon as it reaches a terminal state, so a panicking worker loses only
//! the job it was running. When a job fails with an error
//! that makes every further LLM call pointless (provider 429/402, daily
//! ceiling), the pool trips an abort signal: remaining jobs are marked
//! failed without reaching the provider.

use crate::models::{RawCandidate, RewriteJob, RewriteOptions, RewrittenArticle};
use crate::rewrite::RewriteService;
use futures::future::join_all;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, instrument, warn};

type Queued = (usize, RawCandidate, RewriteJob);

/// Outcome of one rewriting stage.
#[derive(Debug, Default)]
pub struct RewriteBatch {
    /// Every job in input order, each in a terminal state.
    pub jobs: Vec<(RawCandidate, RewriteJob)>,
    /// Set when a cycle-fatal provider error stopped the stage.
    pub aborted: Option<String>,
}

impl RewriteBatch {
    pub fn completed(&self) -> impl Iterator<Item = (&RawCandidate, &RewrittenArticle)> {
        self.jobs
            .iter()
            .filter_map(|(candidate, job)| job.result().map(|article| (candidate, article)))
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|(_, job)| job.result().is_none()).count()
    }

    /// Consume the batch, keeping only the rewritten candidates.
    pub fn into_completed(self) -> Vec<(RawCandidate, RewrittenArticle)> {
        self.jobs
            .into_iter()
            .filter_map(|(candidate, job)| match job.state {
                crate::models::JobState::Completed(article) => Some((candidate, article)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct RewriteQueue {
    service: Arc<RewriteService>,
    options: RewriteOptions,
    workers: usize,
}

impl RewriteQueue {
    pub fn new(service: Arc<RewriteService>, options: RewriteOptions, workers: usize) -> Self {
        Self {
            service,
            options,
            workers: workers.max(1),
        }
    }

    #[instrument(level = "info", skip_all, fields(jobs = candidates.len(), workers = self.workers))]
    pub async fn run(&self, candidates: Vec<RawCandidate>) -> RewriteBatch {
        if candidates.is_empty() {
            return RewriteBatch::default();
        }

        let (tx, rx) = mpsc::channel::<Queued>(candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            let job = RewriteJob::new(&candidate.source_url, self.options.clone());
            if tx.send((index, candidate, job)).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let abort = Arc::new(OnceLock::new());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Queued>();
        let handles = (0..self.workers).map(|worker| {
            let rx = Arc::clone(&rx);
            let abort = Arc::clone(&abort);
            let service = Arc::clone(&self.service);
            let done_tx = done_tx.clone();
            tokio::spawn(work(worker, service, rx, abort, done_tx))
        });

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Rewrite worker panicked; its in-flight job is lost");
            }
        }
        drop(done_tx);

        let mut done: Vec<Queued> = Vec::new();
        while let Some(finished) = done_rx.recv().await {
            done.push(finished);
        }
        done.sort_by_key(|(index, _, _)| *index);

        let batch = RewriteBatch {
            jobs: done
                .into_iter()
                .map(|(_, candidate, job)| (candidate, job))
                .collect(),
            aborted: abort.get().cloned(),
        };
        info!(
            completed = batch.completed().count(),
            failed = batch.failed_count(),
            aborted = batch.aborted.is_some(),
            "Rewrite stage finished"
        );
        batch
    }
}

async fn work(
    worker: usize,
    service: Arc<RewriteService>,
    rx: Arc<Mutex<mpsc::Receiver<Queued>>>,
    abort: Arc<OnceLock<String>>,
    done: mpsc::UnboundedSender<Queued>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some((index, candidate, mut job)) = next else {
            break;
        };

        job.start();
        if let Some(reason) = abort.get() {
            job.fail(format!("skipped after provider error: {reason}"));
            let _ = done.send((index, candidate, job));
            continue;
        }

        match service.rewrite_candidate(&candidate, &job.options).await {
            Ok(article) => {
                job.complete(article);
            }
            Err(e) => {
                if e.is_fatal_for_cycle() {
                    if abort.set(e.to_string()).is_ok() {
                        error!(worker, error = %e, "Provider refuses further calls; aborting rewrite stage");
                    }
                } else {
                    warn!(worker, url = %candidate.source_url, error = %e, "Rewrite failed; skipping article");
                }
                job.fail(e.to_string());
            }
        }
        // receiver outlives every worker
        let _ = done.send((index, candidate, job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{ScriptedTransport, completion, server_error};
    use crate::models::{JobStatus, fixtures};
    use crate::rewrite::test_support::{newsroom, service};

    fn candidates(n: usize) -> Vec<RawCandidate> {
        (0..n)
            .map(|i| fixtures::candidate(&format!("https://site/{i}"), &format!("Nota {i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_all_jobs_reach_terminal_state_in_input_order() {
        let service = Arc::new(service(Arc::new(newsroom(false))));
        let queue = RewriteQueue::new(service, RewriteOptions::default(), 3);

        let batch = queue.run(candidates(7)).await;

        assert_eq!(batch.jobs.len(), 7);
        assert!(batch.aborted.is_none());
        for (i, (candidate, job)) in batch.jobs.iter().enumerate() {
            assert_eq!(candidate.source_url, format!("https://site/{i}"));
            assert_eq!(job.target, candidate.source_url);
            assert_eq!(job.status(), JobStatus::Completed);
            assert!(job.completed_at.is_some());
        }
        assert_eq!(batch.into_completed().len(), 7);
    }

    #[tokio::test]
    async fn test_provider_rate_limit_aborts_remaining_jobs() {
        let transport = Arc::new(ScriptedTransport::responder(|_| server_error(429)));
        let service = Arc::new(service(Arc::clone(&transport)));
        let queue = RewriteQueue::new(service, RewriteOptions::default(), 1);

        let batch = queue.run(candidates(4)).await;

        assert!(batch.aborted.is_some());
        assert_eq!(batch.failed_count(), 4);
        assert_eq!(transport.calls(), 1);
        assert!(
            batch
                .jobs
                .iter()
                .all(|(_, job)| job.status() == JobStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_per_item_failures_do_not_abort() {
        let transport = Arc::new(ScriptedTransport::responder(|_| server_error(400)));
        let service = Arc::new(service(Arc::clone(&transport)));
        let queue = RewriteQueue::new(service, RewriteOptions::default(), 2);

        let batch = queue.run(candidates(3)).await;

        assert!(batch.aborted.is_none());
        assert_eq!(batch.failed_count(), 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_worker_panic_loses_only_its_current_job() {
        let transport = Arc::new(ScriptedTransport::responder(|request| {
            if request.messages[1].content.contains("Título: Nota 1\n") {
                panic!("transport blew up");
            }
            Ok(completion("Texto reescrito.", 10, 10))
        }));
        let service = Arc::new(service(transport));
        let queue = RewriteQueue::new(service, RewriteOptions::default(), 2);

        let batch = queue.run(candidates(4)).await;

        let urls: Vec<&str> = batch
            .jobs
            .iter()
            .map(|(candidate, _)| candidate.source_url.as_str())
            .collect();
        assert_eq!(urls, ["https://site/0", "https://site/2", "https://site/3"]);
        assert!(
            batch
                .jobs
                .iter()
                .all(|(_, job)| job.status() == JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let service = Arc::new(service(Arc::new(newsroom(false))));
        let batch = RewriteQueue::new(service, RewriteOptions::default(), 2)
            .run(Vec::new())
            .await;
        assert!(batch.jobs.is_empty());
    }
}
