use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};

use crate::event::{AttachmentKind, ChannelRef, Content, InboundEvent};
use crate::error::Result;

/// Public link to a source message. Private channels use the `/c/` form with
/// the supergroup prefix stripped.
pub fn source_link(channel: &ChannelRef, message_id: i32) -> String {
    if let Some(username) = channel.username.as_deref().filter(|u| !u.is_empty()) {
        return format!("https://t.me/{username}/{message_id}");
    }
    let id = channel.id.to_string();
    let clean = id
        .strip_prefix("-100")
        .or_else(|| id.strip_prefix('-'))
        .unwrap_or(&id);
    format!("https://t.me/c/{clean}/{message_id}")
}

fn counted(kind: AttachmentKind, count: usize) -> String {
    let noun = match (kind, count) {
        (AttachmentKind::Photo, 1) => "photo",
        (AttachmentKind::Photo, _) => "photos",
        (AttachmentKind::Video, 1) => "video",
        (AttachmentKind::Video, _) => "videos",
        (AttachmentKind::Document, 1) => "document",
        (AttachmentKind::Document, _) => "documents",
        (AttachmentKind::Audio, 1) => "audio file",
        (AttachmentKind::Audio, _) => "audio files",
    };
    format!("{count} {noun}")
}

/// "2 videos available via: <link>"
pub fn oversize_note(kind: AttachmentKind, count: usize, link: &str) -> String {
    format!("{} available via: {link}", counted(kind, count))
}

/// Caption first, then one paragraph per note.
pub fn compose_text(caption: Option<&str>, notes: &[String]) -> String {
    caption
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .into_iter()
        .chain(notes.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Title the destination shows for an uploaded file.
pub fn attachment_title(event: &InboundEvent) -> String {
    let non_empty = |s: &Option<String>| s.as_deref().filter(|s| !s.trim().is_empty()).map(String::from);

    match &event.content {
        Content::Audio {
            title,
            performer,
            file_name,
            ..
        } => match (non_empty(performer), non_empty(title)) {
            (Some(performer), Some(title)) => format!("{performer} - {title}"),
            (None, Some(title)) => title,
            _ => non_empty(file_name).unwrap_or_else(|| format!("audio_{}", event.message_id)),
        },
        Content::Document { file_name, .. } => {
            non_empty(file_name).unwrap_or_else(|| format!("document_{}", event.message_id))
        }
        Content::Video { file_name, .. } => non_empty(file_name)
            .unwrap_or_else(|| format!("Video {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))),
        Content::Photo { .. } => format!("photo_{}", event.message_id),
        Content::Text { .. } | Content::Unsupported { .. } => event.message_id.to_string(),
    }
}

/// Remove entries in the temp dir older than `max_age`. Returns how many
/// were removed.
pub fn sweep_temp_dir(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.map_or(true, |age| age < max_age) {
            continue;
        }

        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                debug!("Removed stale temp entry {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {e}", path.display()),
        }
    }
    Ok(removed)
}
