use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Closed,
}

#[derive(Debug)]
pub struct MediaGroupBatch {
    pub group_id: String,
    pub opened_at: Instant,
    pub last_fragment_at: Instant,
    /// Arrival order.
    pub fragments: Vec<InboundEvent>,
    pub state: BatchState,
}

impl MediaGroupBatch {
    fn open(group_id: String, first: InboundEvent) -> Self {
        let now = Instant::now();
        Self {
            group_id,
            opened_at: now,
            last_fragment_at: now,
            fragments: vec![first],
            state: BatchState::Open,
        }
    }

    fn append(&mut self, fragment: InboundEvent) {
        self.fragments.push(fragment);
        self.last_fragment_at = Instant::now();
    }
}

/// A completed media group, ready for transfer.
#[derive(Debug, Clone)]
pub struct ClosedBatch {
    pub group_id: String,
    pub fragments: Vec<InboundEvent>,
}

impl ClosedBatch {
    pub fn first(&self) -> Option<&InboundEvent> {
        self.fragments.first()
    }

    pub fn caption(&self) -> Option<String> {
        select_caption(&self.fragments)
    }
}

/// First non-empty caption in arrival order. Later captions are ignored.
pub fn select_caption(fragments: &[InboundEvent]) -> Option<String> {
    fragments
        .iter()
        .find_map(InboundEvent::body)
        .map(String::from)
}

/// Collects fragments sharing a media group id into one batch until no new
/// fragment has arrived for the quiescence window. Each closed batch goes to
/// the pipeline over an unbounded channel, exactly once.
pub struct MediaGroupAggregator {
    window: Duration,
    open: Mutex<HashMap<String, Arc<Mutex<MediaGroupBatch>>>>,
    closed_tx: mpsc::UnboundedSender<ClosedBatch>,
}

impl MediaGroupAggregator {
    pub fn new(window: Duration, closed_tx: mpsc::UnboundedSender<ClosedBatch>) -> Self {
        Self {
            window,
            open: Mutex::new(HashMap::new()),
            closed_tx,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn open_groups(&self) -> usize {
        self.open.lock().await.len()
    }

    /// Add a fragment to its group, opening the batch and its timer on the
    /// first fragment. Only touches in-memory state.
    pub async fn push(self: &Arc<Self>, fragment: InboundEvent) {
        let Some(group_id) = fragment.media_group_id.clone() else {
            warn!(
                channel_id = fragment.channel.id,
                message_id = fragment.message_id,
                "fragment without media group id"
            );
            return;
        };

        let mut open = self.open.lock().await;
        if let Some(batch) = open.get(&group_id) {
            let mut batch = batch.lock().await;
            batch.append(fragment);
            debug!(group_id, fragments = batch.fragments.len(), "fragment appended");
            return;
        }

        debug!(group_id, channel_id = fragment.channel.id, "media group opened");
        let batch = Arc::new(Mutex::new(MediaGroupBatch::open(group_id.clone(), fragment)));
        open.insert(group_id, batch.clone());
        drop(open);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_timer(batch).await });
    }

    /// Sleep until the batch has been quiet for a full window, then close it.
    async fn run_timer(&self, batch: Arc<Mutex<MediaGroupBatch>>) {
        loop {
            let deadline = batch.lock().await.last_fragment_at + self.window;
            tokio::time::sleep_until(deadline).await;

            let quiet_since = batch.lock().await.last_fragment_at;
            if Instant::now() >= quiet_since + self.window {
                break;
            }
        }
        self.fire(&batch).await;
    }

    /// Close the named group now, if it is still open.
    pub async fn close(&self, group_id: &str) -> bool {
        let batch = self.open.lock().await.get(group_id).cloned();
        match batch {
            Some(batch) => self.fire(&batch).await,
            None => false,
        }
    }

    /// OPEN → CLOSED transition. Returns whether this call dispatched.
    async fn fire(&self, batch: &Arc<Mutex<MediaGroupBatch>>) -> bool {
        // Lock order (map, then batch) matches `push`.
        let mut open = self.open.lock().await;
        let mut guard = batch.lock().await;
        if guard.state == BatchState::Closed {
            debug!(group_id = guard.group_id, "media group already closed");
            return false;
        }
        guard.state = BatchState::Closed;
        if open
            .get(&guard.group_id)
            .is_some_and(|current| Arc::ptr_eq(current, batch))
        {
            open.remove(&guard.group_id);
        }
        drop(open);

        let closed = ClosedBatch {
            group_id: guard.group_id.clone(),
            fragments: std::mem::take(&mut guard.fragments),
        };
        debug!(
            group_id = closed.group_id,
            fragments = closed.fragments.len(),
            open_for_ms = guard.opened_at.elapsed().as_millis() as u64,
            "media group closed"
        );
        if self.closed_tx.send(closed).is_err() {
            warn!(group_id = guard.group_id, "pipeline gone, dropping media group");
        }
        true
    }

    /// Drop every open batch. Used at shutdown; nothing is dispatched.
    pub async fn discard_open(&self) -> usize {
        let mut open = self.open.lock().await;
        let dropped = open.len();
        for batch in open.values() {
            batch.lock().await.state = BatchState::Closed;
        }
        open.clear();
        if dropped > 0 {
            warn!(dropped, "discarding open media groups at shutdown");
        }
        dropped
    }
}
