use crate::config::ExporterOptions;
use crate::orchestrator::{Orchestrator, RenderOutcome};
use crate::renderer::Renderer;
use crate::request::ExportRequest;
use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("an exporter pool needs at least one renderer")]
    Empty,
}

/// A fixed set of orchestrators, one renderer each.
///
/// Batches are spread round-robin with at most one export in flight per
/// renderer. Outcomes come back in request order.
pub struct ExporterPool<R> {
    workers: Vec<Orchestrator<R>>,
}

impl<R: Renderer + 'static> ExporterPool<R> {
    pub fn new(
        renderers: impl IntoIterator<Item = R>,
        options: ExporterOptions,
    ) -> Result<Self, PoolError> {
        let workers: Vec<_> = renderers
            .into_iter()
            .map(|renderer| Orchestrator::new(renderer, options.clone()))
            .collect();
        if workers.is_empty() {
            return Err(PoolError::Empty);
        }
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    #[instrument(skip_all, fields(requests = requests.len(), workers = self.workers.len()))]
    pub async fn export_all(&self, requests: Vec<ExportRequest>) -> Vec<RenderOutcome> {
        let width = self.workers.len();
        stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| {
                let worker = &self.workers[index % width];
                async move {
                    debug!(index, worker = index % width, "dispatching export");
                    worker.export(&request).await
                }
            })
            .buffered(width)
            .collect()
            .await
    }
}
