use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{AttachmentRef, ComposedPost, Destination, LocalAttachment, PostContext};
use crate::config::VkConfig;
use crate::error::{CrosspostError, Result};
use crate::event::AttachmentKind;

/// VK error codes meaning the access token is no longer usable.
const AUTH_ERROR_CODES: [i64; 3] = [5, 27, 28];

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct PhotoUpload {
    server: Value,
    photo: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct SavedPhoto {
    id: i64,
    owner_id: i64,
}

#[derive(Debug, Deserialize)]
struct VideoSlot {
    upload_url: String,
    video_id: i64,
    owner_id: i64,
}

#[derive(Debug, Deserialize)]
struct DocUpload {
    file: String,
}

#[derive(Debug, Deserialize)]
struct SavedDoc {
    doc: SavedPhoto,
}

#[derive(Debug, Deserialize)]
struct AudioUpload {
    server: Value,
    audio: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct PostId {
    post_id: i64,
}

pub struct VkClient {
    http: reqwest::Client,
    api_url: String,
    version: String,
}

impl VkClient {
    pub fn new(config: &VkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            version: config.api_version.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &PostContext,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{method}", self.api_url);
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", ctx.binding.access_token.clone()));
        form.push(("v", self.version.clone()));

        debug!(op_id = %ctx.op_id, "POST {method}");
        let resp = self.http.post(&url).form(&form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrosspostError::Api(format!("{method} returned {status}: {body}")));
        }

        let envelope: Envelope = resp.json().await?;
        if let Some(err) = envelope.error {
            return Err(classify_api_error(method, &err));
        }
        let response = envelope
            .response
            .ok_or_else(|| CrosspostError::Api(format!("{method}: empty response")))?;
        Ok(serde_json::from_value(response)?)
    }

    /// Multipart upload of a local file to an upload server URL.
    async fn upload_file<T: DeserializeOwned>(
        &self,
        upload_url: &str,
        field: &str,
        path: &Path,
        file_name: &str,
    ) -> Result<T> {
        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part(field.to_string(), part);

        let resp = self.http.post(upload_url).multipart(form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(CrosspostError::Api(format!("upload returned {status}")));
        }

        let body: Value = resp.json().await?;
        if let Some(err) = body.get("error") {
            return Err(CrosspostError::Api(format!("upload rejected: {err}")));
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn upload_photo(&self, ctx: &PostContext, file: &LocalAttachment) -> Result<AttachmentRef> {
        let group = ctx.group_id().to_string();
        let server: UploadServer = self
            .call(ctx, "photos.getWallUploadServer", &[("group_id", group.clone())])
            .await?;
        let uploaded: PhotoUpload = self
            .upload_file(&server.upload_url, "photo", &file.path, &file_name(file, "jpg"))
            .await?;
        let saved: Vec<SavedPhoto> = self
            .call(
                ctx,
                "photos.saveWallPhoto",
                &[
                    ("group_id", group),
                    ("server", json_param(&uploaded.server)),
                    ("photo", uploaded.photo),
                    ("hash", uploaded.hash),
                ],
            )
            .await?;
        let photo = saved
            .into_iter()
            .next()
            .ok_or_else(|| CrosspostError::Api("photos.saveWallPhoto: no photo saved".into()))?;
        Ok(AttachmentRef::new("photo", photo.owner_id, photo.id))
    }

    async fn upload_video(&self, ctx: &PostContext, file: &LocalAttachment) -> Result<AttachmentRef> {
        let slot: VideoSlot = self
            .call(
                ctx,
                "video.save",
                &[
                    ("name", file.title.clone()),
                    ("group_id", ctx.group_id().to_string()),
                    ("wallpost", "0".to_string()),
                ],
            )
            .await?;
        let _: Value = self
            .upload_file(&slot.upload_url, "video_file", &file.path, &file_name(file, "mp4"))
            .await?;
        Ok(AttachmentRef::new("video", slot.owner_id, slot.video_id))
    }

    async fn upload_document(&self, ctx: &PostContext, file: &LocalAttachment) -> Result<AttachmentRef> {
        let server: UploadServer = self
            .call(
                ctx,
                "docs.getWallUploadServer",
                &[("group_id", ctx.group_id().to_string())],
            )
            .await?;
        let uploaded: DocUpload = self
            .upload_file(&server.upload_url, "file", &file.path, &file_name(file, "bin"))
            .await?;
        let saved: SavedDoc = self
            .call(
                ctx,
                "docs.save",
                &[("file", uploaded.file), ("title", file.title.clone())],
            )
            .await?;
        Ok(AttachmentRef::new("doc", saved.doc.owner_id, saved.doc.id))
    }

    async fn upload_audio(&self, ctx: &PostContext, file: &LocalAttachment) -> Result<AttachmentRef> {
        let server: UploadServer = self.call(ctx, "audio.getUploadServer", &[]).await?;
        let uploaded: AudioUpload = self
            .upload_file(&server.upload_url, "file", &file.path, &file_name(file, "mp3"))
            .await?;

        let mut params = vec![
            ("server", json_param(&uploaded.server)),
            ("audio", uploaded.audio),
            ("hash", uploaded.hash),
        ];
        match file.title.split_once(" - ") {
            Some((artist, title)) => {
                params.push(("artist", artist.to_string()));
                params.push(("title", title.to_string()));
            }
            None => params.push(("title", file.title.clone())),
        }

        let saved: SavedPhoto = self.call(ctx, "audio.save", &params).await?;
        Ok(AttachmentRef::new("audio", saved.owner_id, saved.id))
    }
}

#[async_trait]
impl Destination for VkClient {
    async fn verify(&self, ctx: &PostContext) -> Result<()> {
        let _: Value = self
            .call(ctx, "users.get", &[("user_ids", "1".to_string())])
            .await?;
        Ok(())
    }

    async fn upload(&self, ctx: &PostContext, attachment: &LocalAttachment) -> Result<AttachmentRef> {
        match attachment.kind {
            AttachmentKind::Photo => self.upload_photo(ctx, attachment).await,
            AttachmentKind::Video => self.upload_video(ctx, attachment).await,
            AttachmentKind::Document => self.upload_document(ctx, attachment).await,
            AttachmentKind::Audio => self.upload_audio(ctx, attachment).await,
        }
    }

    async fn publish(&self, ctx: &PostContext, post: &ComposedPost) -> Result<i64> {
        let params = [
            ("owner_id", ctx.owner_id().to_string()),
            ("from_group", if post.from_group { "1" } else { "0" }.to_string()),
            ("message", post.text.clone()),
            ("attachments", post.attachment_list()),
            ("copyright", post.citation.clone()),
        ];
        let posted: PostId = self
            .call(ctx, "wall.post", &params)
            .await
            .map_err(into_publish_error)?;
        Ok(posted.post_id)
    }

    async fn edit(&self, ctx: &PostContext, post_id: i64, post: &ComposedPost) -> Result<()> {
        let params = [
            ("owner_id", ctx.owner_id().to_string()),
            ("post_id", post_id.to_string()),
            ("message", post.text.clone()),
            ("attachments", post.attachment_list()),
            ("copyright", post.citation.clone()),
        ];
        let _: Value = self
            .call(ctx, "wall.edit", &params)
            .await
            .map_err(into_publish_error)?;
        Ok(())
    }

    async fn attachments(&self, ctx: &PostContext, post_id: i64) -> Result<Vec<AttachmentRef>> {
        let posts = format!("{}_{post_id}", ctx.owner_id());
        let response: Value = self.call(ctx, "wall.getById", &[("posts", posts)]).await?;

        // Older API versions return a bare array, newer ones wrap it in `items`.
        let items = match &response {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };
        let post = items
            .first()
            .ok_or_else(|| CrosspostError::Publish(format!("post {post_id} not found")))?;
        Ok(parse_attachments(post))
    }
}

fn classify_api_error(method: &str, err: &ApiError) -> CrosspostError {
    if AUTH_ERROR_CODES.contains(&err.error_code) {
        CrosspostError::Auth(format!("{method}: [{}] {}", err.error_code, err.error_msg))
    } else {
        CrosspostError::Api(format!("{method}: [{}] {}", err.error_code, err.error_msg))
    }
}

fn into_publish_error(e: CrosspostError) -> CrosspostError {
    match e {
        CrosspostError::Auth(_) => e,
        other => CrosspostError::Publish(other.to_string()),
    }
}

/// Pull re-attachable references out of a `wall.getById` post object.
fn parse_attachments(post: &Value) -> Vec<AttachmentRef> {
    let Some(list) = post.get("attachments").and_then(Value::as_array) else {
        return Vec::new();
    };

    let refs: Vec<AttachmentRef> = list
        .iter()
        .filter_map(|item| {
            let kind = item.get("type")?.as_str()?;
            let body = item.get(kind)?;
            let owner_id = body.get("owner_id")?.as_i64()?;
            let id = body.get("id")?.as_i64()?;
            let mut reference = AttachmentRef::new(kind, owner_id, id);
            reference.access_key = body
                .get("access_key")
                .and_then(Value::as_str)
                .map(String::from);
            Some(reference)
        })
        .collect();

    if refs.len() < list.len() {
        warn!(
            "{} attachment(s) cannot be carried over on edit",
            list.len() - refs.len()
        );
    }
    refs
}

fn json_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn file_name(file: &LocalAttachment, default_ext: &str) -> String {
    file.path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.{default_ext}", file.kind.as_str()))
}
