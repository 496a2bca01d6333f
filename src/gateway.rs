use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::aggregator::{ClosedBatch, MediaGroupAggregator};
use crate::edit::{EditOutcome, EditPropagator};
use crate::error::{CrosspostError, Result};
use crate::event::InboundEvent;
use crate::resolver::{ContentResolver, Resolution};
use crate::router::{Pipeline, Router};
use crate::transfer::{TransferOutcome, TransferWorker};

/// Resolver, transfer worker and edit propagator wired together.
pub struct Crossposter {
    pub resolver: Arc<ContentResolver>,
    pub worker: Arc<TransferWorker>,
    pub propagator: Arc<EditPropagator>,
}

impl Crossposter {
    pub fn new(
        resolver: Arc<ContentResolver>,
        worker: Arc<TransferWorker>,
        propagator: Arc<EditPropagator>,
    ) -> Self {
        Self {
            resolver,
            worker,
            propagator,
        }
    }

    /// Resolve the channel, then publish. `None` when the channel is not tracked.
    pub async fn relay_fragments(&self, fragments: &[InboundEvent]) -> Result<Option<TransferOutcome>> {
        let Some(first) = fragments.first() else {
            return Ok(None);
        };
        match self.resolver.resolve(&first.channel).await? {
            Resolution::Tracked(binding) => self.worker.transfer(binding, fragments).await.map(Some),
            Resolution::Untracked => Ok(None),
        }
    }

    pub async fn apply_edit(&self, event: &InboundEvent) -> Result<Option<EditOutcome>> {
        match self.resolver.resolve(&event.channel).await? {
            Resolution::Tracked(binding) => self.propagator.propagate(binding, event).await.map(Some),
            Resolution::Untracked => Ok(None),
        }
    }
}

/// Auth, publish and missing-mapping failures are logged where they happen.
fn report(context: &str, e: &CrosspostError) {
    match e {
        CrosspostError::Auth(_) | CrosspostError::Publish(_) | CrosspostError::MappingNotFound(_) => {
            debug!(error = %e, "{context} ended")
        }
        other => error!(error = %other, "{context} failed"),
    }
}

#[async_trait]
impl Pipeline for Crossposter {
    async fn relay(&self, fragments: Vec<InboundEvent>) {
        if let Err(e) = self.relay_fragments(&fragments).await {
            report("relay", &e);
        }
    }

    async fn edit(&self, event: InboundEvent) {
        if let Err(e) = self.apply_edit(&event).await {
            report("edit", &e);
        }
    }
}

/// Drain the event source through the router until it closes. Closed media
/// groups come back on `closed_rx` and each is relayed in its own task.
pub async fn run(
    pipeline: Arc<dyn Pipeline>,
    aggregator: Arc<MediaGroupAggregator>,
    mut inbound_rx: mpsc::Receiver<InboundEvent>,
    mut closed_rx: mpsc::UnboundedReceiver<ClosedBatch>,
) {
    let router = Router::new(pipeline.clone(), aggregator.clone());

    loop {
        tokio::select! {
            event = inbound_rx.recv() => {
                let Some(event) = event else { break };
                router.route(event).await;
            }
            Some(batch) = closed_rx.recv() => {
                debug!(group_id = batch.group_id, fragments = batch.fragments.len(), "relaying media group");
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.relay(batch.fragments).await });
            }
        }
    }

    info!("Event source closed");
    aggregator.discard_open().await;
}
