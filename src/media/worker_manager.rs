#![forbid(unsafe_code)]

// Shared mediasoup worker. One worker serves every room's router.

use crate::media::config::{RouterConfig, WorkerConfig};
use crate::media::engine::{EngineRouter, MediaEngine};
use crate::media::mediasoup_adapter::MediasoupRouter;
use crate::media::types::{MediaError, MediaResult};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Media engine backed by a single lazily-started mediasoup worker
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
    worker: OnceCell<Worker>,
    config: WorkerConfig,
}

impl MediasoupEngine {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
            worker: OnceCell::new(),
            config,
        }
    }

    /// Returns the shared worker, starting it on first use. Concurrent first
    /// callers share the same start-up.
    async fn worker(&self) -> MediaResult<Worker> {
        let worker = self
            .worker
            .get_or_try_init(|| async {
                let worker = self
                    .manager
                    .create_worker(self.config.to_worker_settings())
                    .await
                    .map_err(|e| MediaError::Worker(format!("failed to create worker: {e}")))?;

                info!("Started mediasoup worker {}", worker.id());
                Self::setup_worker_handlers(&worker);
                Ok::<_, MediaError>(worker)
            })
            .await?;

        Ok(worker.clone())
    }

    /// Worker death is fatal: every router lives on this worker, so the
    /// process exits and leaves recovery to its supervisor.
    fn setup_worker_handlers(worker: &Worker) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("mediasoup worker {} died ({:?}), exiting", worker_id, reason);
                std::process::exit(1);
            })
            .detach();

        worker
            .on_close(move || {
                debug!("mediasoup worker {} closed", worker_id);
            })
            .detach();
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn EngineRouter>> {
        let worker = self.worker().await?;

        let router = worker
            .create_router(config.to_router_options())
            .await
            .map_err(|e| MediaError::Router(format!("failed to create router: {e}")))?;

        info!("Created router {} on worker {}", router.id(), worker.id());

        router
            .on_worker_close({
                let router_id = router.id();
                move || {
                    warn!("Worker closed under router {}", router_id);
                }
            })
            .detach();

        Ok(Arc::new(MediasoupRouter::new(router)?))
    }
}
