//! Render worker pool.
//!
//! V8 isolates are `!Send`, so each worker owns a thread with its own
//! current-thread tokio runtime and renders one request at a time. Requests
//! are routed to the least-loaded worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::api::RenderApi;
use crate::engine::SandboxEngine;
use crate::environment::{EnvironmentConfiguration, RenderResult, SandboxEnvironment};
use crate::error::RenderError;

struct RenderJob {
    url: Url,
    api: RenderApi,
    respond: oneshot::Sender<Result<RenderResult, RenderError>>,
}

/// Load stats for a worker (used by the scheduler)
#[derive(Default)]
struct WorkerLoad {
    queued: AtomicUsize,
    active: AtomicUsize,
}

impl WorkerLoad {
    fn total(&self) -> usize {
        self.queued.load(Ordering::Relaxed) + self.active.load(Ordering::Relaxed)
    }
}

struct WorkerHandle {
    jobs: mpsc::UnboundedSender<RenderJob>,
    load: Arc<WorkerLoad>,
    thread: JoinHandle<()>,
}

pub struct RenderPool {
    workers: Vec<WorkerHandle>,
}

impl RenderPool {
    /// Start `workers` render threads (at least one) sharing `environment`.
    pub fn new<C, E>(
        environment: Arc<SandboxEnvironment<C, E>>,
        workers: usize,
    ) -> std::io::Result<Self>
    where
        C: EnvironmentConfiguration + 'static,
        E: SandboxEngine + Send + Sync + 'static,
    {
        let count = workers.max(1);
        tracing::info!("Starting render pool with {} workers", count);

        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let load = Arc::new(WorkerLoad::default());
            let worker_load = Arc::clone(&load);
            let worker_env = Arc::clone(&environment);

            let thread = thread::Builder::new()
                .name(format!("render-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, worker_env, rx, worker_load))?;

            handles.push(WorkerHandle {
                jobs: tx,
                load,
                thread,
            });
        }

        Ok(Self { workers: handles })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Render `url` on the least-loaded worker.
    pub async fn render(&self, url: Url, api: RenderApi) -> Result<RenderResult, RenderError> {
        let index = self.least_loaded();
        let worker = &self.workers[index];
        let (respond, response) = oneshot::channel();

        worker.load.queued.fetch_add(1, Ordering::Relaxed);
        if worker.jobs.send(RenderJob { url, api, respond }).is_err() {
            worker.load.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(RenderError::Engine(anyhow!(
                "Render worker {} is not running",
                index
            )));
        }

        response
            .await
            .map_err(|_| RenderError::Engine(anyhow!("Render worker {} dropped the request", index)))?
    }

    fn least_loaded(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.load.total())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    /// Stop accepting jobs and wait for in-flight renders to finish.
    pub fn shutdown(self) {
        for worker in self.workers {
            drop(worker.jobs);
            if worker.thread.join().is_err() {
                tracing::error!("Render worker panicked during shutdown");
            }
        }
    }
}

fn run_worker<C, E>(
    worker_id: usize,
    environment: Arc<SandboxEnvironment<C, E>>,
    mut jobs: mpsc::UnboundedReceiver<RenderJob>,
    load: Arc<WorkerLoad>,
) where
    C: EnvironmentConfiguration,
    E: SandboxEngine,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("Render worker {} failed to start: {}", worker_id, err);
            return;
        }
    };

    runtime.block_on(async move {
        while let Some(job) = jobs.recv().await {
            load.queued.fetch_sub(1, Ordering::Relaxed);
            load.active.fetch_add(1, Ordering::Relaxed);

            let outcome = environment.render(&job.url, &job.api).await;

            load.active.fetch_sub(1, Ordering::Relaxed);
            if job.respond.send(outcome).is_err() {
                tracing::debug!("Render of {} finished after its caller went away", job.url);
            }
        }
    });
    tracing::debug!("Render worker {} stopped", worker_id);
}
