use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::aggregator::MediaGroupAggregator;
use crate::event::{Content, InboundEvent};

/// Where an inbound event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Text,
    Media,
    Document,
    Audio,
    GroupFragment,
    Edited,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Repost of an individual user's message.
    UserForward,
    Unsupported,
    /// GIF animations and stickers sent as documents.
    FilteredDocument,
    Empty,
}

/// Downstream work the router hands events to. Implementations run the
/// network-bound part; the router only spawns.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Publish one post made of `fragments` (a single event or a closed group).
    async fn relay(&self, fragments: Vec<InboundEvent>);

    async fn edit(&self, event: InboundEvent);
}

pub fn classify(event: &InboundEvent) -> Route {
    if event.is_user_forward() {
        return Route::Skipped(SkipReason::UserForward);
    }
    if event.edited {
        return Route::Edited;
    }

    match &event.content {
        Content::Unsupported { .. } => return Route::Skipped(SkipReason::Unsupported),
        Content::Document {
            file_name,
            mime_type,
            ..
        } if is_filtered_document(file_name.as_deref(), mime_type.as_deref()) => {
            return Route::Skipped(SkipReason::FilteredDocument)
        }
        _ => {}
    }

    if event.media_group_id.is_some() {
        return Route::GroupFragment;
    }

    match &event.content {
        Content::Text { text } if text.trim().is_empty() => Route::Skipped(SkipReason::Empty),
        Content::Text { .. } => Route::Text,
        Content::Photo { .. } | Content::Video { .. } => Route::Media,
        Content::Document { .. } => Route::Document,
        Content::Audio { .. } => Route::Audio,
        Content::Unsupported { .. } => Route::Skipped(SkipReason::Unsupported),
    }
}

fn is_filtered_document(file_name: Option<&str>, mime_type: Option<&str>) -> bool {
    if mime_type.is_some_and(|m| m.eq_ignore_ascii_case("image/gif")) {
        return true;
    }
    file_name
        .map(str::to_ascii_lowercase)
        .is_some_and(|name| name.contains("tgs") || name.contains("webp"))
}

pub struct Router {
    pipeline: Arc<dyn Pipeline>,
    aggregator: Arc<MediaGroupAggregator>,
}

impl Router {
    pub fn new(pipeline: Arc<dyn Pipeline>, aggregator: Arc<MediaGroupAggregator>) -> Self {
        Self {
            pipeline,
            aggregator,
        }
    }

    /// Classify and hand off. Never waits on network work.
    pub async fn route(&self, event: InboundEvent) -> Route {
        let route = classify(&event);
        debug!(
            channel_id = event.channel.id,
            message_id = event.message_id,
            ?route,
            "routing event"
        );

        match route {
            Route::Text | Route::Media | Route::Document | Route::Audio => {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move { pipeline.relay(vec![event]).await });
            }
            Route::GroupFragment => self.aggregator.push(event).await,
            Route::Edited => {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move { pipeline.edit(event).await });
            }
            Route::Skipped(reason) => info!(
                channel_id = event.channel.id,
                message_id = event.message_id,
                ?reason,
                "event skipped"
            ),
        }
        route
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::event::{ForwardOrigin, RemoteFile};
    use crate::testing::{self, RecordingPipeline};

    fn document(file_name: Option<&str>, mime_type: Option<&str>) -> InboundEvent {
        let mut event = testing::text_event(-1001, 1, "");
        event.content = Content::Document {
            file: RemoteFile {
                file_id: "doc".into(),
                size: Some(10),
            },
            file_name: file_name.map(String::from),
            mime_type: mime_type.map(String::from),
        };
        event
    }

    #[test]
    fn test_classify_kinds() {
        assert_eq!(classify(&testing::text_event(-1001, 1, "hi")), Route::Text);
        assert_eq!(classify(&testing::photo_event(-1001, 1, None, None)), Route::Media);
        assert_eq!(classify(&testing::video_event(-1001, 1, None, 10)), Route::Media);
        assert_eq!(classify(&document(Some("a.pdf"), Some("application/pdf"))), Route::Document);
        assert_eq!(
            classify(&testing::photo_event(-1001, 1, Some("g"), None)),
            Route::GroupFragment
        );
        assert_eq!(
            classify(&testing::text_event(-1001, 1, "  ")),
            Route::Skipped(SkipReason::Empty)
        );
    }

    #[test]
    fn test_user_forwards_are_skipped_channel_forwards_kept() {
        let mut event = testing::text_event(-1001, 1, "repost");
        event.forward = Some(ForwardOrigin::User);
        assert_eq!(classify(&event), Route::Skipped(SkipReason::UserForward));

        event.forward = Some(ForwardOrigin::HiddenUser);
        assert_eq!(classify(&event), Route::Skipped(SkipReason::UserForward));

        event.forward = Some(ForwardOrigin::Channel {
            channel_id: -100777,
        });
        assert_eq!(classify(&event), Route::Text);
    }

    #[test]
    fn test_gif_and_sticker_documents_are_filtered() {
        let filtered = Route::Skipped(SkipReason::FilteredDocument);
        assert_eq!(classify(&document(Some("anim.mp4"), Some("image/gif"))), filtered);
        assert_eq!(classify(&document(Some("sticker.TGS"), None)), filtered);
        assert_eq!(classify(&document(Some("pic.webp"), Some("image/webp"))), filtered);
        assert_eq!(classify(&document(None, None)), Route::Document);
    }

    #[test]
    fn test_edits_route_to_propagator() {
        let mut event = testing::photo_event(-1001, 3, Some("g"), Some("c"));
        event.edited = true;
        assert_eq!(classify(&event), Route::Edited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_dispatches_singles_groups_and_edits() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let (tx, mut closed_rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(MediaGroupAggregator::new(Duration::from_secs(2), tx));
        let router = Router::new(pipeline.clone(), aggregator.clone());

        router.route(testing::text_event(-1001, 1, "single")).await;
        router.route(testing::photo_event(-1001, 2, Some("g"), None)).await;
        router.route(testing::photo_event(-1001, 3, Some("g"), None)).await;
        let mut edit = testing::text_event(-1001, 1, "changed");
        edit.edited = true;
        router.route(edit).await;

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.relayed(), vec![vec![1]]);
        assert_eq!(pipeline.edited(), vec![1]);
        assert_eq!(aggregator.open_groups().await, 1);

        let batch = closed_rx.recv().await.unwrap();
        assert_eq!(batch.fragments.len(), 2);
    }
}
