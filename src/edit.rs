use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::activity::{ActivityEntry, ActivityLevel, ActivityLog};
use crate::destination::{ComposedPost, Destination, PostContext};
use crate::error::{CrosspostError, Result};
use crate::event::InboundEvent;
use crate::mapping::{Lookup, MappingStore};
use crate::resolver::ChannelBinding;
use crate::transfer::compose::source_link;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Edited { post_id: i64 },
    /// Nothing to put in the post: no text and no attachments.
    Empty { post_id: i64 },
}

/// Re-submits edited source messages to the post they were published as.
pub struct EditPropagator {
    destination: Arc<dyn Destination>,
    mappings: Arc<MappingStore>,
    activity: ActivityLog,
}

impl EditPropagator {
    pub fn new(
        destination: Arc<dyn Destination>,
        mappings: Arc<MappingStore>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            destination,
            mappings,
            activity,
        }
    }

    pub async fn propagate(&self, binding: ChannelBinding, event: &InboundEvent) -> Result<EditOutcome> {
        let source = event.key();
        let mapping = match self.mappings.get(source).await? {
            Lookup::Found(mapping) => mapping,
            Lookup::NotFound => {
                warn!(%source, "edited message was never published, ignoring edit");
                return Err(CrosspostError::MappingNotFound(source));
            }
        };
        let post_id = mapping.target_id;
        let ctx = PostContext::new(binding);

        self.destination.verify(&ctx).await.inspect_err(|e| {
            error!(op_id = %ctx.op_id, %source, error = %e, "destination rejected credentials");
        })?;

        // Edits carry no files; keep whatever the post already has.
        let attachments = self.destination.attachments(&ctx, post_id).await.inspect_err(|e| {
            error!(op_id = %ctx.op_id, %source, post_id, error = %e, "failed to read existing attachments");
        })?;

        let text = event.body().unwrap_or_default().trim().to_string();
        if text.is_empty() && attachments.is_empty() {
            info!(op_id = %ctx.op_id, %source, post_id, "edit leaves post empty, skipping");
            return Ok(EditOutcome::Empty { post_id });
        }

        let post = ComposedPost {
            text,
            attachments,
            citation: source_link(&event.channel, event.message_id),
            from_group: ctx.binding.post_as_group,
        };

        if let Err(e) = self.destination.edit(&ctx, post_id, &post).await {
            error!(op_id = %ctx.op_id, %source, post_id, error = %e, "edit failed");
            self.activity.record(
                ActivityEntry::new(
                    ActivityLevel::Error,
                    ctx.binding.owner_id.as_deref(),
                    format!("Failed to edit post {post_id}"),
                )
                .with_details(json!({ "message_id": source.message_id, "error": e.to_string() })),
            );
            return Err(e);
        }

        if let Err(e) = self.mappings.increment_edit(source).await {
            warn!(op_id = %ctx.op_id, %source, post_id, error = %e, "failed to record edit");
        }

        info!(op_id = %ctx.op_id, %source, post_id, attachments = post.attachments.len(), "post edited");
        self.activity.record(ActivityEntry::new(
            ActivityLevel::Info,
            ctx.binding.owner_id.as_deref(),
            format!("Edited post {post_id} after message {} changed", source.message_id),
        ));
        Ok(EditOutcome::Edited { post_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::AttachmentRef;
    use crate::mapping::FallbackLog;
    use crate::testing::{self, DestinationCall, FakeDestination, MemoryMappings};

    struct Harness {
        propagator: EditPropagator,
        destination: Arc<FakeDestination>,
        backend: Arc<MemoryMappings>,
        mappings: Arc<MappingStore>,
        _tmp: tempfile::TempDir,
    }

    fn harness(destination: FakeDestination) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let destination = Arc::new(destination);
        let backend = Arc::new(MemoryMappings::default());
        let mappings = Arc::new(MappingStore::with_primary(
            backend.clone(),
            FallbackLog::new(tmp.path().join("data.txt")),
        ));
        let propagator = EditPropagator::new(
            destination.clone(),
            mappings.clone(),
            ActivityLog::file(tmp.path().join("activity.jsonl")),
        );
        Harness {
            propagator,
            destination,
            backend,
            mappings,
            _tmp: tmp,
        }
    }

    fn edited(message_id: i32, text: &str) -> InboundEvent {
        let mut event = testing::text_event(-1001234, message_id, text);
        event.edited = true;
        event
    }

    #[tokio::test]
    async fn test_edit_without_mapping_makes_no_destination_call() {
        let h = harness(FakeDestination::new());
        let result = h.propagator.propagate(testing::binding(-1001234), &edited(5, "new")).await;

        assert!(matches!(result, Err(CrosspostError::MappingNotFound(key)) if key.message_id == 5));
        assert!(h.destination.calls().is_empty());
    }

    #[tokio::test]
    async fn test_edit_preserves_existing_attachments() {
        let destination = FakeDestination::new();
        destination.set_existing(
            900,
            vec![AttachmentRef::new("photo", -98765, 1), AttachmentRef::new("video", -98765, 2)],
        );
        let h = harness(destination);
        let event = edited(5, "updated text");
        h.mappings.upsert(event.key(), 900, None).await.unwrap();

        let outcome = h.propagator.propagate(testing::binding(-1001234), &event).await.unwrap();
        assert_eq!(outcome, EditOutcome::Edited { post_id: 900 });

        let edits: Vec<_> = h
            .destination
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DestinationCall::Edit { post_id, post } => Some((post_id, post)),
                _ => None,
            })
            .collect();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, 900);
        assert_eq!(edits[0].1.text, "updated text");
        assert_eq!(edits[0].1.attachment_list(), "photo-98765_1,video-98765_2");
        assert_eq!(edits[0].1.citation, "https://t.me/c/1234/5");

        let stored = h.backend.get_record(event.key()).await.unwrap();
        assert_eq!(stored.edit_count, 1);
        assert!(stored.is_edited);
    }

    #[tokio::test]
    async fn test_failed_edit_leaves_metadata_untouched() {
        let destination = FakeDestination::new();
        destination.fail_edit();
        let h = harness(destination);
        let event = edited(6, "text");
        h.mappings.upsert(event.key(), 901, None).await.unwrap();

        let result = h.propagator.propagate(testing::binding(-1001234), &event).await;
        assert!(matches!(result, Err(CrosspostError::Publish(_))));

        let stored = h.backend.get_record(event.key()).await.unwrap();
        assert_eq!(stored.edit_count, 0);
        assert!(!stored.is_edited);
    }

    #[tokio::test]
    async fn test_empty_edit_is_skipped() {
        let h = harness(FakeDestination::new());
        let event = edited(7, "   ");
        h.mappings.upsert(event.key(), 902, None).await.unwrap();

        let outcome = h.propagator.propagate(testing::binding(-1001234), &event).await.unwrap();
        assert_eq!(outcome, EditOutcome::Empty { post_id: 902 });
        assert!(h
            .destination
            .calls()
            .iter()
            .all(|c| !matches!(c, DestinationCall::Edit { .. })));
    }
}
