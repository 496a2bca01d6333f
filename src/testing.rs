use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::aggregator::MediaGroupAggregator;
use crate::api::AppState;
use crate::destination::{AttachmentRef, ComposedPost, Destination, LocalAttachment, PostContext};
use crate::error::{CrosspostError, Result};
use crate::event::{AttachmentKind, ChannelRef, Content, InboundEvent, RemoteFile, SourceKey};
use crate::mapping::{FallbackLog, MappingBackend, MappingStore, PostMapping};
use crate::resolver::{BindingDirectory, ChannelBinding};
use crate::router::Pipeline;

// ---------------------------------------------------------------------------
// Events and bindings
// ---------------------------------------------------------------------------

fn event(channel_id: i64, message_id: i32, content: Content) -> InboundEvent {
    InboundEvent {
        channel: ChannelRef {
            id: channel_id,
            username: None,
            title: None,
        },
        message_id,
        content,
        caption: None,
        media_group_id: None,
        forward: None,
        edited: false,
        date: Utc::now(),
    }
}

pub fn text_event(channel_id: i64, message_id: i32, text: &str) -> InboundEvent {
    event(
        channel_id,
        message_id,
        Content::Text {
            text: text.to_string(),
        },
    )
}

pub fn photo_event(
    channel_id: i64,
    message_id: i32,
    group: Option<&str>,
    caption: Option<&str>,
) -> InboundEvent {
    let mut event = event(
        channel_id,
        message_id,
        Content::Photo {
            file: RemoteFile {
                file_id: format!("photo-{message_id}"),
                size: Some(100),
            },
        },
    );
    event.media_group_id = group.map(String::from);
    event.caption = caption.map(String::from);
    event
}

pub fn video_event(channel_id: i64, message_id: i32, group: Option<&str>, size: u64) -> InboundEvent {
    let mut event = event(
        channel_id,
        message_id,
        Content::Video {
            file: RemoteFile {
                file_id: format!("video-{message_id}"),
                size: Some(size),
            },
            file_name: None,
        },
    );
    event.media_group_id = group.map(String::from);
    event
}

pub fn binding(channel_id: i64) -> ChannelBinding {
    ChannelBinding {
        channel_id,
        channel_username: None,
        target_id: 98765,
        target_name: None,
        access_token: "token".into(),
        post_as_group: true,
        active: true,
        owner_id: None,
    }
}

// ---------------------------------------------------------------------------
// Binding directory
// ---------------------------------------------------------------------------

/// Exact-id directory that remembers every id it was asked for.
pub struct RecordingDirectory {
    bindings: Vec<ChannelBinding>,
    lookups: Mutex<Vec<i64>>,
}

impl RecordingDirectory {
    pub fn new(bindings: Vec<ChannelBinding>) -> Self {
        Self {
            bindings,
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn lookups(&self) -> Vec<i64> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl BindingDirectory for RecordingDirectory {
    async fn lookup(&self, channel_id: i64) -> Result<Option<ChannelBinding>> {
        self.lookups.lock().unwrap().push(channel_id);
        Ok(self
            .bindings
            .iter()
            .find(|b| b.channel_id == channel_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub struct FakeFetcher {
    failing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            failing: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_always(&self, file_id: &str) {
        self.failing.lock().unwrap().push(file_id.to_string());
    }

    /// One entry per attempt, including failed ones.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::channels::AttachmentFetcher for FakeFetcher {
    async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<u64> {
        self.calls.lock().unwrap().push(file.file_id.clone());
        if self.failing.lock().unwrap().contains(&file.file_id) {
            return Err(CrosspostError::TransientIo(format!(
                "download of {} failed",
                file.file_id
            )));
        }
        let bytes = [0u8; 16];
        tokio::fs::write(dest, bytes).await?;
        Ok(bytes.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DestinationCall {
    Verify,
    Upload { attachment: LocalAttachment },
    Publish { post: ComposedPost },
    Edit { post_id: i64, post: ComposedPost },
    Attachments { post_id: i64 },
}

#[derive(Default)]
struct DestinationState {
    reject_credentials: bool,
    fail_publish: bool,
    fail_edit: bool,
    existing: HashMap<i64, Vec<AttachmentRef>>,
    calls: Vec<DestinationCall>,
    next_id: i64,
}

pub struct FakeDestination {
    state: Mutex<DestinationState>,
}

impl FakeDestination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DestinationState {
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    pub fn reject_credentials(&self) {
        self.state.lock().unwrap().reject_credentials = true;
    }

    pub fn fail_publish(&self) {
        self.state.lock().unwrap().fail_publish = true;
    }

    pub fn fail_edit(&self) {
        self.state.lock().unwrap().fail_edit = true;
    }

    pub fn set_existing(&self, post_id: i64, attachments: Vec<AttachmentRef>) {
        self.state.lock().unwrap().existing.insert(post_id, attachments);
    }

    pub fn calls(&self) -> Vec<DestinationCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn published(&self) -> Vec<ComposedPost> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DestinationCall::Publish { post } => Some(post),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<LocalAttachment> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DestinationCall::Upload { attachment } => Some(attachment),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn verify(&self, _ctx: &PostContext) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestinationCall::Verify);
        if state.reject_credentials {
            return Err(CrosspostError::Auth("token revoked".into()));
        }
        Ok(())
    }

    async fn upload(&self, ctx: &PostContext, attachment: &LocalAttachment) -> Result<AttachmentRef> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestinationCall::Upload {
            attachment: attachment.clone(),
        });
        state.next_id += 1;
        let kind = match attachment.kind {
            AttachmentKind::Photo => "photo",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "doc",
            AttachmentKind::Audio => "audio",
        };
        Ok(AttachmentRef::new(kind, ctx.owner_id(), state.next_id))
    }

    async fn publish(&self, _ctx: &PostContext, post: &ComposedPost) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_publish {
            return Err(CrosspostError::Publish("wall.post rejected".into()));
        }
        state.calls.push(DestinationCall::Publish { post: post.clone() });
        state.next_id += 1;
        Ok(state.next_id)
    }

    async fn edit(&self, _ctx: &PostContext, post_id: i64, post: &ComposedPost) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestinationCall::Edit {
            post_id,
            post: post.clone(),
        });
        if state.fail_edit {
            return Err(CrosspostError::Publish("wall.edit rejected".into()));
        }
        Ok(())
    }

    async fn attachments(&self, _ctx: &PostContext, post_id: i64) -> Result<Vec<AttachmentRef>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestinationCall::Attachments { post_id });
        Ok(state.existing.get(&post_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Mapping backends
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMappings {
    records: RwLock<HashMap<SourceKey, PostMapping>>,
}

impl MemoryMappings {
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn get_record(&self, source: SourceKey) -> Option<PostMapping> {
        self.records.read().await.get(&source).cloned()
    }
}

#[async_trait]
impl MappingBackend for MemoryMappings {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        Ok(self.get_record(source).await)
    }

    async fn upsert(
        &self,
        source: SourceKey,
        target_id: i64,
        owner_id: Option<&str>,
    ) -> Result<PostMapping> {
        let mut records = self.records.write().await;
        let mapping = records
            .entry(source)
            .and_modify(|m| {
                m.target_id = target_id;
                m.updated_at = Utc::now();
            })
            .or_insert_with(|| PostMapping::new(source, target_id, owner_id.map(String::from)));
        Ok(mapping.clone())
    }

    async fn increment_edit(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        // Read and write under separate guards so lost updates would show.
        let Some(mut mapping) = self.get_record(source).await else {
            return Ok(None);
        };
        tokio::task::yield_now().await;
        mapping.edit_count += 1;
        mapping.is_edited = true;
        mapping.updated_at = Utc::now();
        self.records.write().await.insert(source, mapping.clone());
        Ok(Some(mapping))
    }
}

/// A primary that is down, or up but refusing writes.
pub struct FailingBackend {
    reachable: bool,
}

impl FailingBackend {
    pub fn unreachable() -> Self {
        Self { reachable: false }
    }

    pub fn writes_fail() -> Self {
        Self { reachable: true }
    }
}

#[async_trait]
impl MappingBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn ping(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(CrosspostError::Mapping("connection refused".into()))
        }
    }

    async fn get(&self, _source: SourceKey) -> Result<Option<PostMapping>> {
        if self.reachable {
            Ok(None)
        } else {
            Err(CrosspostError::Mapping("connection refused".into()))
        }
    }

    async fn upsert(
        &self,
        _source: SourceKey,
        _target_id: i64,
        _owner_id: Option<&str>,
    ) -> Result<PostMapping> {
        Err(CrosspostError::Mapping("insert failed".into()))
    }

    async fn increment_edit(&self, _source: SourceKey) -> Result<Option<PostMapping>> {
        Err(CrosspostError::Mapping("update failed".into()))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingPipeline {
    relayed: Mutex<Vec<Vec<i32>>>,
    edited: Mutex<Vec<i32>>,
}

impl RecordingPipeline {
    pub fn relayed(&self) -> Vec<Vec<i32>> {
        self.relayed.lock().unwrap().clone()
    }

    pub fn edited(&self) -> Vec<i32> {
        self.edited.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pipeline for RecordingPipeline {
    async fn relay(&self, fragments: Vec<InboundEvent>) {
        let ids = fragments.iter().map(|e| e.message_id).collect();
        self.relayed.lock().unwrap().push(ids);
    }

    async fn edit(&self, event: InboundEvent) {
        self.edited.lock().unwrap().push(event.message_id);
    }
}

// ---------------------------------------------------------------------------
// API state
// ---------------------------------------------------------------------------

/// Degraded mapping store (fallback log only) and an idle aggregator.
pub fn app_state(tmp: &tempfile::TempDir, api_token: Option<&str>) -> Arc<AppState> {
    let (tx, _rx) = mpsc::unbounded_channel();
    Arc::new(AppState {
        mappings: Arc::new(MappingStore::degraded(FallbackLog::new(
            tmp.path().join("data.txt"),
        ))),
        aggregator: Arc::new(MediaGroupAggregator::new(Duration::from_secs(2), tx)),
        api_token: api_token.map(String::from),
        started_at: Instant::now(),
        shutdown: Arc::new(Notify::new()),
    })
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// Collects formatted `tracing` output for assertions on levels and messages.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Thread-local subscriber writing into this capture. Install it with
    /// `tracing::subscriber::set_default` in a current-thread test.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
