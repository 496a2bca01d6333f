pub mod vk;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::{AttachmentKind, SourceKey};
use crate::resolver::ChannelBinding;

/// Per-invocation context threaded through every destination call.
#[derive(Debug, Clone)]
pub struct PostContext {
    pub binding: ChannelBinding,
    /// Short id correlating the log lines of one operation.
    pub op_id: String,
}

impl PostContext {
    pub fn new(binding: ChannelBinding) -> Self {
        let op_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        Self { binding, op_id }
    }

    /// Wall owner id: communities are addressed with a negative id.
    pub fn owner_id(&self) -> i64 {
        -self.binding.target_id.abs()
    }

    pub fn group_id(&self) -> i64 {
        self.binding.target_id.abs()
    }
}

/// A downloaded file waiting to be uploaded. Lives inside the operation's
/// temp directory and goes away with it.
#[derive(Debug, Clone)]
pub struct LocalAttachment {
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub size: u64,
    pub title: String,
    pub source: SourceKey,
}

/// An attachment as the destination knows it, e.g. `photo-123_456`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub kind: String,
    pub owner_id: i64,
    pub id: i64,
    pub access_key: Option<String>,
}

impl AttachmentRef {
    pub fn new(kind: impl Into<String>, owner_id: i64, id: i64) -> Self {
        Self {
            kind: kind.into(),
            owner_id,
            id,
            access_key: None,
        }
    }
}

impl fmt::Display for AttachmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", self.kind, self.owner_id, self.id)?;
        if let Some(key) = &self.access_key {
            write!(f, "_{key}")?;
        }
        Ok(())
    }
}

/// Everything that goes into one publish or edit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPost {
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
    /// Link back to the original message.
    pub citation: String,
    pub from_group: bool,
}

impl ComposedPost {
    pub fn attachment_list(&self) -> String {
        self.attachments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The publishing surface posts are relayed to.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Check that the binding's credentials are still accepted.
    async fn verify(&self, ctx: &PostContext) -> Result<()>;

    async fn upload(&self, ctx: &PostContext, attachment: &LocalAttachment) -> Result<AttachmentRef>;

    /// Publish a new post, returning its id.
    async fn publish(&self, ctx: &PostContext, post: &ComposedPost) -> Result<i64>;

    async fn edit(&self, ctx: &PostContext, post_id: i64, post: &ComposedPost) -> Result<()>;

    /// Attachments currently on an existing post.
    async fn attachments(&self, ctx: &PostContext, post_id: i64) -> Result<Vec<AttachmentRef>>;
}
