//! Configuration loaded from `.rapport/config.yaml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use crate::storage::RAPPORT_DIR;
use crate::types::{PageRequest, ValidationError};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name within the .rapport directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Blob directory name within the .rapport directory.
const BLOBS_DIR: &str = "blobs";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a writer waits for the SQLite write lock
    pub busy_timeout_ms: u64,

    pub retry: RetryPolicy,

    pub paging: PagingConfig,

    pub upload: UploadPolicy,

    /// Where the filesystem blob store keeps files (default: .rapport/blobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_dir: Option<PathBuf>,

    /// Static bearer tokens accepted by the daemon: token -> user id
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            paging: PagingConfig::default(),
            upload: UploadPolicy::default(),
            blob_dir: None,
            tokens: HashMap::new(),
        }
    }
}

impl Config {
    /// Path of the config file under `root`.
    pub fn path(root: &Path) -> PathBuf {
        root.join(RAPPORT_DIR).join(CONFIG_FILE)
    }

    /// Load the config for a store root, falling back to defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path).context("Failed to read config.yaml")?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Write this config to the store root.
    pub fn save(&self, root: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(Self::path(root), yaml).context("Failed to write config.yaml")?;
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Resolved blob directory for a store root.
    pub fn blob_dir(&self, root: &Path) -> PathBuf {
        match &self.blob_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join(RAPPORT_DIR).join(BLOBS_DIR),
        }
    }
}

/// Bounded retry for the two-sided follow/unfollow write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,

    /// Delay before the second attempt; doubles after each retry
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Page-size defaults applied at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_limit: PageRequest::default().limit,
            max_limit: 100,
        }
    }
}

impl PagingConfig {
    /// Build a page request, filling gaps from the configured defaults.
    pub fn request(&self, page: Option<u32>, limit: Option<u32>) -> PageRequest {
        PageRequest::new(
            page.unwrap_or(PageRequest::default().page),
            limit.unwrap_or(self.default_limit),
        )
    }
}

/// Accepted picture uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub max_bytes: usize,
    pub content_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            content_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
        }
    }
}

impl UploadPolicy {
    /// Check an upload before it reaches the blob store.
    pub fn check(&self, bytes: &[u8], content_type: &str) -> Result<(), ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::EmptyUpload);
        }
        if bytes.len() > self.max_bytes {
            return Err(ValidationError::UploadTooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }
        if !self
            .content_types
            .iter()
            .any(|ct| ct.eq_ignore_ascii_case(content_type))
        {
            return Err(ValidationError::UnsupportedContentType(content_type.to_string()));
        }
        Ok(())
    }

    /// Guess a content type from a file extension.
    pub fn content_type_for(path: &Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some("image/jpeg"),
            "png" => Some("image/png"),
            "webp" => Some("image/webp"),
            "gif" => Some("image/gif"),
            _ => None,
        }
    }
}
