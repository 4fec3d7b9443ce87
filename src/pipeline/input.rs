//! Input resolution: normalise a user-supplied path or URL to a local PDF.
//!
//! ## Why download to a temp file?
//!
//! The conversion client uploads from a file path and names the artifact
//! after the file stem. Downloading to a `TempDir` gives it both, and the
//! directory is cleaned up when [`ResolvedInput`] is dropped. The `%PDF`
//! magic bytes are checked up front so a wrong file fails here with a clear
//! message instead of as an opaque rejection from the remote service.

use crate::error::PipelineError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// A local PDF, either given directly or fetched into a temp directory.
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is held so the download outlives the conversion.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File name used as the record's `source.origin`.
    pub fn origin(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a readable PDF on disk.
pub async fn resolve_input(input: &str, timeout: Duration) -> Result<ResolvedInput, PipelineError> {
    if is_url(input) {
        download_url(input, timeout).await
    } else if input.trim().is_empty() {
        Err(PipelineError::InvalidInput {
            input: input.to_string(),
        })
    } else {
        resolve_local(Path::new(input))
    }
}

fn resolve_local(path: &Path) -> Result<ResolvedInput, PipelineError> {
    let path = path.to_path_buf();
    if !path.is_file() {
        return Err(PipelineError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path });
        }
        Err(_) => return Err(PipelineError::FileNotFound { path }),
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout: Duration) -> Result<ResolvedInput, PipelineError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", timeout.as_secs()))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(file_name_from_url(url));

    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::OutputWriteFailed {
            path: file_path.clone(),
            source: e,
        })?;

    info!("Downloaded to: {}", file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last URL path segment when it looks like a file name, else `downloaded.pdf`.
fn file_name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
