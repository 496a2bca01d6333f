pub mod telegram;

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::{InboundEvent, RemoteFile};

/// A platform that pushes new and edited channel posts.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    /// Run until stopped, forwarding every converted post to `inbound_tx`.
    async fn start(&self, inbound_tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Downloads source-platform files to local paths.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Write the file to `dest`, returning the number of bytes written.
    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<u64>;
}
