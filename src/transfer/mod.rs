pub mod compose;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEntry, ActivityLevel, ActivityLog};
use crate::aggregator::select_caption;
use crate::channels::AttachmentFetcher;
use crate::config::Config;
use crate::destination::{ComposedPost, Destination, LocalAttachment, PostContext};
use crate::error::{CrosspostError, Result};
use crate::event::{AttachmentKind, Content, InboundEvent, RemoteFile};
use crate::mapping::{Lookup, MappingStore};
use crate::resolver::ChannelBinding;
use crate::retry::{retry, RetryPolicy};

use compose::{attachment_title, compose_text, oversize_note, source_link};

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_attachment_bytes: u64,
    pub download_retry: RetryPolicy,
    pub temp_dir: PathBuf,
    pub skip_duplicates: bool,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attachment_bytes: config.crosspost.max_attachment_bytes,
            download_retry: config.crosspost.download_retry(),
            temp_dir: config.temp_dir(),
            skip_duplicates: config.crosspost.skip_duplicates,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Published {
        post_id: i64,
        attachments: usize,
        /// Files dropped after failed downloads or uploads.
        omitted: usize,
        /// Files replaced by a link note.
        oversize: usize,
    },
    /// The first message already has a post.
    Duplicate { post_id: i64 },
}

enum Fetched {
    Local(usize, LocalAttachment),
    Oversize(AttachmentKind),
    Failed,
}

/// Download, upload, compose and publish one post.
pub struct TransferWorker {
    fetcher: Arc<dyn AttachmentFetcher>,
    destination: Arc<dyn Destination>,
    mappings: Arc<MappingStore>,
    activity: ActivityLog,
    settings: TransferSettings,
}

impl TransferWorker {
    pub fn new(
        fetcher: Arc<dyn AttachmentFetcher>,
        destination: Arc<dyn Destination>,
        mappings: Arc<MappingStore>,
        activity: ActivityLog,
        settings: TransferSettings,
    ) -> Self {
        Self {
            fetcher,
            destination,
            mappings,
            activity,
            settings,
        }
    }

    /// Relay a single event or the fragments of a closed media group as one
    /// post. The mapping is keyed by the first fragment.
    pub async fn transfer(
        &self,
        binding: ChannelBinding,
        fragments: &[InboundEvent],
    ) -> Result<TransferOutcome> {
        let first = fragments
            .first()
            .ok_or_else(|| CrosspostError::Publish("nothing to transfer".into()))?;
        let source = first.key();
        let ctx = PostContext::new(binding);

        // Credentials are checked before any file is touched.
        self.destination.verify(&ctx).await.inspect_err(|e| {
            error!(op_id = %ctx.op_id, %source, error = %e, "destination rejected credentials");
        })?;

        if self.settings.skip_duplicates {
            match self.mappings.get(source).await {
                Ok(Lookup::Found(existing)) => {
                    info!(op_id = %ctx.op_id, %source, post_id = existing.target_id, "already published, skipping");
                    return Ok(TransferOutcome::Duplicate {
                        post_id: existing.target_id,
                    });
                }
                Ok(Lookup::NotFound) => {}
                Err(e) => warn!(op_id = %ctx.op_id, %source, error = %e, "duplicate check failed"),
            }
        }

        let caption = select_caption(fragments);
        let link = source_link(&first.channel, first.message_id);

        tokio::fs::create_dir_all(&self.settings.temp_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("op-{}-", ctx.op_id))
            .tempdir_in(&self.settings.temp_dir)?;

        let mut oversize: BTreeMap<AttachmentKind, usize> = BTreeMap::new();
        let mut wanted = Vec::new();
        for (index, event) in fragments.iter().enumerate() {
            let (Some(kind), Some(file)) = (event.content.attachment_kind(), event.content.remote_file())
            else {
                continue;
            };
            if file.size.is_some_and(|size| size > self.settings.max_attachment_bytes) {
                debug!(op_id = %ctx.op_id, message_id = event.message_id, kind = kind.as_str(), size = file.size, "attachment over size limit");
                *oversize.entry(kind).or_default() += 1;
                continue;
            }
            wanted.push((index, event, file, kind));
        }

        let downloads = futures::future::join_all(wanted.iter().map(|(index, event, file, kind)| {
            self.download(&ctx, &workdir, *index, event, file, *kind)
        }))
        .await;

        let mut local = Vec::new();
        let mut omitted = 0;
        for fetched in downloads {
            match fetched {
                Fetched::Local(index, attachment) => local.push((index, attachment)),
                Fetched::Oversize(kind) => *oversize.entry(kind).or_default() += 1,
                Fetched::Failed => omitted += 1,
            }
        }
        local.sort_by_key(|(index, a)| (a.kind, *index));

        let mut attachments = Vec::new();
        for (_, file) in &local {
            match self.destination.upload(&ctx, file).await {
                Ok(reference) => attachments.push(reference),
                Err(e @ CrosspostError::Auth(_)) => {
                    error!(op_id = %ctx.op_id, %source, error = %e, "upload rejected credentials, aborting");
                    return Err(e);
                }
                Err(e) => {
                    warn!(op_id = %ctx.op_id, %source, kind = file.kind.as_str(), error = %e, "upload failed, omitting attachment");
                    omitted += 1;
                }
            }
        }

        let notes: Vec<String> = AttachmentKind::ALL
            .iter()
            .filter_map(|kind| oversize.get(kind).map(|count| oversize_note(*kind, *count, &link)))
            .collect();
        let text = compose_text(caption.as_deref(), &notes);
        if text.is_empty() && attachments.is_empty() {
            let e = CrosspostError::Publish(format!("{source}: nothing left to publish"));
            error!(op_id = %ctx.op_id, %source, error = %e, "publish skipped");
            return Err(e);
        }

        let post = ComposedPost {
            text,
            attachments,
            citation: link,
            from_group: ctx.binding.post_as_group,
        };

        let post_id = match self.destination.publish(&ctx, &post).await {
            Ok(id) => id,
            Err(e) => {
                error!(op_id = %ctx.op_id, %source, target_id = ctx.binding.target_id, error = %e, "publish failed");
                self.activity.record(
                    ActivityEntry::new(
                        ActivityLevel::Error,
                        ctx.binding.owner_id.as_deref(),
                        format!("Failed to publish message {}", source.message_id),
                    )
                    .with_details(json!({ "channel_id": source.channel_id, "error": e.to_string() })),
                );
                return Err(e);
            }
        };

        if let Err(e) = self
            .mappings
            .upsert(source, post_id, ctx.binding.owner_id.as_deref())
            .await
        {
            error!(op_id = %ctx.op_id, %source, post_id, error = %e, "failed to record mapping");
        }

        let oversize_total = oversize.values().sum();
        info!(
            op_id = %ctx.op_id,
            %source,
            post_id,
            attachments = post.attachments.len(),
            omitted,
            oversize = oversize_total,
            "published"
        );
        self.activity.record(
            ActivityEntry::new(
                ActivityLevel::Info,
                ctx.binding.owner_id.as_deref(),
                format!("Published message {} as post {post_id}", source.message_id),
            )
            .with_details(json!({
                "channel_id": source.channel_id,
                "target_id": ctx.binding.target_id,
                "attachments": post.attachments.len(),
            })),
        );

        drop(workdir);
        Ok(TransferOutcome::Published {
            post_id,
            attachments: post.attachments.len(),
            omitted,
            oversize: oversize_total,
        })
    }

    async fn download(
        &self,
        ctx: &PostContext,
        workdir: &TempDir,
        index: usize,
        event: &InboundEvent,
        file: &RemoteFile,
        kind: AttachmentKind,
    ) -> Fetched {
        let path = workdir.path().join(local_file_name(index, event, kind));
        let result = retry(&self.settings.download_retry, "download", |_| {
            self.fetcher.fetch(file, &path)
        })
        .await;

        match result {
            Ok(size) if size > self.settings.max_attachment_bytes => {
                debug!(op_id = %ctx.op_id, message_id = event.message_id, size, "downloaded file over size limit");
                remove_quietly(&path);
                Fetched::Oversize(kind)
            }
            Ok(size) => Fetched::Local(
                index,
                LocalAttachment {
                    path,
                    kind,
                    size,
                    title: attachment_title(event),
                    source: event.key(),
                },
            ),
            Err(e) => {
                warn!(op_id = %ctx.op_id, message_id = event.message_id, kind = kind.as_str(), error = %e, "download failed, omitting attachment");
                remove_quietly(&path);
                Fetched::Failed
            }
        }
    }
}

/// Local name for a downloaded file. Keeps the original extension so the
/// destination can detect the format.
fn local_file_name(index: usize, event: &InboundEvent, kind: AttachmentKind) -> String {
    let original = match &event.content {
        Content::Video { file_name, .. }
        | Content::Document { file_name, .. }
        | Content::Audio { file_name, .. } => file_name.as_deref(),
        _ => None,
    };
    let ext = original
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(match kind {
            AttachmentKind::Photo => "jpg",
            AttachmentKind::Video => "mp4",
            AttachmentKind::Document => "bin",
            AttachmentKind::Audio => "mp3",
        });
    format!("{index:02}_{}_{}.{ext}", kind.as_str(), event.message_id)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            debug!("Failed to remove {}: {e}", path.display());
        }
    }
}
