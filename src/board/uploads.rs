//! Attachment checks run before anything is uploaded or relayed.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::models::Principal;
use crate::errors::{DashboardError, DashboardResult};

/// 10 MB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "audio/mpeg",
    "audio/ogg",
    "application/pdf",
];

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));

/// A file the user picked, described but not yet uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    /// Declared MIME type; guessed from the file name when absent.
    #[serde(default)]
    pub content_type: Option<String>,
    pub size: u64,
}

/// Coarse media class, as automation endpoints expect it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    fn from_mime(mime: &str) -> Self {
        match mime.split('/').next() {
            Some("image") => Self::Image,
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            _ => Self::Document,
        }
    }
}

/// An attachment that passed validation, with its owner-prefixed object path.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidatedAttachment {
    pub object_path: String,
    pub mime: String,
    pub kind: MediaKind,
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn validate(
        &self,
        owner: &Principal,
        attachment: &Attachment,
    ) -> DashboardResult<ValidatedAttachment> {
        if attachment.size == 0 {
            return Err(DashboardError::Validation(format!(
                "Attachment '{}' is empty",
                attachment.file_name
            )));
        }
        if attachment.size > self.max_bytes {
            return Err(DashboardError::Validation(format!(
                "Attachment '{}' is {} bytes; the limit is {} bytes",
                attachment.file_name, attachment.size, self.max_bytes
            )));
        }

        let mime = resolve_mime(attachment);
        if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
            return Err(DashboardError::Validation(format!(
                "Attachment type '{}' is not supported",
                mime
            )));
        }

        let file_name = sanitize_file_name(&attachment.file_name);
        Ok(ValidatedAttachment {
            object_path: format!("{}/{}-{}", owner.user_id, uuid::Uuid::new_v4(), file_name),
            kind: MediaKind::from_mime(&mime),
            mime,
            file_name,
            size: attachment.size,
        })
    }
}

fn resolve_mime(attachment: &Attachment) -> String {
    match attachment.content_type.as_deref().map(str::trim) {
        Some(declared) if !declared.is_empty() => declared
            .split(';')
            .next()
            .unwrap_or(declared)
            .trim()
            .to_ascii_lowercase(),
        _ => mime_guess::from_path(&attachment.file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// Strip directories and collapse anything outside `[A-Za-z0-9._-]` to `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = UNSAFE_FILE_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
