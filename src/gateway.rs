//! Validated edit gateway
//!
//! Every edit goes through a validator twice: once as a dry run to render the
//! preview diff, then for real on confirm. The validator is the only place
//! that decides whether an edit is stale.

use crate::diff::{parse_unified_diff, render_unified_diff};
use crate::patch::{apply_edits, AppliedEdit, ApplyError, Edit};
use crate::util::{resolve_rooted_path, truncate};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub path: String,
    pub edits: Vec<Edit>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub applied: Vec<AppliedEdit>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The edit's `before` no longer matches the file; re-derive the edit.
    #[error("edit is stale: {0}")]
    Stale(String),
    #[error("validator rejected the edit: {message}")]
    Rejected {
        message: String,
        details: Option<String>,
    },
    #[error("invalid strategy path: {0}")]
    InvalidPath(String),
    #[error("strategy file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("validator request failed: {0}")]
    Transport(String),
}

impl From<ApplyError> for GatewayError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Stale { .. } => GatewayError::Stale(err.to_string()),
            other => GatewayError::Rejected {
                message: other.to_string(),
                details: None,
            },
        }
    }
}

#[async_trait]
pub trait EditValidator: Send + Sync {
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, GatewayError>;
}

/// Validates and applies edits to files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalValidator {
    root: PathBuf,
}

impl LocalValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl EditValidator for LocalValidator {
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, GatewayError> {
        let resolved = resolve_rooted_path(&self.root, Path::new(&request.path))
            .map_err(GatewayError::InvalidPath)?;
        let edits = request.edits.clone();
        let dry_run = request.dry_run;
        tokio::task::spawn_blocking(move || validate_file(&resolved.absolute, &edits, dry_run))
            .await
            .map_err(|e| GatewayError::Transport(format!("validator task failed: {}", e)))?
    }
}

/// Read, verify, and (unless dry-running) rewrite the file under an
/// exclusive lock so the staleness check and the write see the same content.
fn validate_file(path: &Path, edits: &[Edit], dry_run: bool) -> Result<ValidateResponse, GatewayError> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    FileExt::lock_exclusive(&file)?;

    let mut original = String::new();
    file.read_to_string(&mut original)?;

    let (content, applied) = apply_edits(&original, edits)?;
    let diff = render_unified_diff(&original, &content);

    if !dry_run && content != original {
        let permissions = file.metadata()?.permissions();
        write_atomic(path, &content, permissions)?;
        info!(path = %path.display(), edits = edits.len(), "committed edits");
    }
    FileExt::unlock(&file)?;

    Ok(ValidateResponse {
        content: Some(content),
        diff: Some(diff),
        applied,
    })
}

/// Write through a sibling temp file and rename it over `path`, keeping the
/// original permissions.
fn write_atomic(path: &Path, content: &str, permissions: fs::Permissions) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.workbench.tmp", file_name));

    let mut tmp = fs::File::create(&tmp_path)?;
    tmp.write_all(content.as_bytes())?;
    tmp.sync_all()?;
    drop(tmp);
    fs::set_permissions(&tmp_path, permissions)?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

/// Posts edits to a remote validator endpoint.
#[derive(Debug, Clone)]
pub struct HttpValidator {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpValidator {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("Invalid validator URL {:?}: {}", endpoint, e))?;
        Ok(Self {
            endpoint,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl EditValidator for HttpValidator {
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, GatewayError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                GatewayError::Transport(format!("unreadable validator response: {}", e))
            });
        }

        match serde_json::from_str::<ErrorPayload>(&body) {
            Ok(payload) if payload.message.contains("before mismatch") => {
                Err(GatewayError::Stale(payload.message))
            }
            Ok(payload) => Err(GatewayError::Rejected {
                message: payload.message,
                details: payload.details.map(|d| match d {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }),
            }),
            Err(_) => Err(GatewayError::Transport(format!(
                "validator returned {}: {}",
                status,
                truncate(body.trim(), 200)
            ))),
        }
    }
}

/// Rendered outcome of a dry run or commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub diff: String,
    pub content: Option<String>,
    pub additions: usize,
    pub removals: usize,
    pub applied: Vec<AppliedEdit>,
}

impl Preview {
    fn from_response(response: ValidateResponse) -> Self {
        let diff = response.diff.unwrap_or_default();
        let (additions, removals) = parse_unified_diff(&diff)
            .map(|d| d.stats())
            .unwrap_or((0, 0));
        Self {
            diff,
            content: response.content,
            additions,
            removals,
            applied: response.applied,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.diff.trim().is_empty()
    }
}

/// Preview/commit protocol over any validator. No retries: a failed call is
/// surfaced and the user re-triggers.
pub struct EditGateway<V> {
    validator: V,
}

impl<V: EditValidator> EditGateway<V> {
    pub fn new(validator: V) -> Self {
        Self { validator }
    }

    pub async fn preview(&self, path: &str, edit: &Edit) -> Result<Preview, GatewayError> {
        self.send(path, edit, true).await
    }

    pub async fn commit(&self, path: &str, edit: &Edit) -> Result<Preview, GatewayError> {
        self.send(path, edit, false).await
    }

    async fn send(&self, path: &str, edit: &Edit, dry_run: bool) -> Result<Preview, GatewayError> {
        debug!(path, edit = %edit.label(), dry_run, "validating edit");
        let request = ValidateRequest {
            path: path.to_string(),
            edits: vec![edit.clone()],
            dry_run,
        };
        let response = self.validator.validate(&request).await?;
        Ok(Preview::from_response(response))
    }
}
