//! Figure downloads for parsed questions.
//!
//! Each remote image referenced by a document is saved once under
//! `<output_root>/<images_dir_name>/` and recorded with a path relative to
//! the output root, so the JSON artifact and the images directory can be
//! moved together. A figure that cannot be fetched or written is logged as
//! an [`ImageError`] and left out; it never fails the question.

use crate::config::PipelineConfig;
use crate::error::{ImageError, PipelineError};
use crate::output::ImageEntry;
use crate::pipeline::parse::ImageRef;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct ImageStore {
    http: reqwest::Client,
    dir: PathBuf,
    dir_name: String,
    timeout: Duration,
}

impl ImageStore {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            dir: config.images_dir(),
            dir_name: config.images_dir_name.clone(),
            timeout: Duration::from_secs(config.image_timeout_secs),
        })
    }

    /// Download every reference in order, skipping the ones that fail.
    ///
    /// References sharing a base name (crops of one page that differ only
    /// in the query string) get `-2`, `-3`, ... suffixes so no file is
    /// overwritten.
    pub async fn store_all(&self, refs: &[ImageRef]) -> Vec<ImageEntry> {
        let mut taken = HashSet::new();
        let mut entries = Vec::with_capacity(refs.len());
        for r in refs {
            let name = unique_name(&file_name_for(&r.src), &taken);
            match self.store_as(r, &name).await {
                Ok(entry) => {
                    taken.insert(name);
                    entries.push(entry);
                }
                Err(e) => warn!("Skipping figure: {}", e),
            }
        }
        entries
    }

    /// Download one image under its URL base name and return its entry.
    pub async fn store(&self, image: &ImageRef) -> Result<ImageEntry, ImageError> {
        self.store_as(image, &file_name_for(&image.src)).await
    }

    async fn store_as(&self, image: &ImageRef, name: &str) -> Result<ImageEntry, ImageError> {
        let download_err = |detail: String| ImageError::Download {
            url: image.src.clone(),
            detail,
        };

        let response = self
            .http
            .get(&image.src)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(e.to_string()))?;

        let path = self.dir.join(name);
        let write_err = |detail: String| ImageError::Write {
            url: image.src.clone(),
            path: path.clone(),
            detail,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| write_err(e.to_string()))?;

        debug!("Saved figure {} ({} bytes)", path.display(), bytes.len());
        Ok(ImageEntry {
            alt: image.alt.clone(),
            local_path: format!("{}/{}", self.dir_name, name),
        })
    }
}

/// Base name of the URL path, or a timestamped `img_<millis>.png`.
pub fn file_name_for(src: &str) -> String {
    reqwest::Url::parse(src)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("img_{}.png", chrono::Utc::now().timestamp_millis()))
}

/// `name`, or `stem-N.ext` with the smallest `N >= 2` not in `taken`.
fn unique_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    let p = Path::new(name);
    let stem = p.file_stem().map_or_else(|| name.into(), |s| s.to_string_lossy());
    let ext = p
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (2..)
        .map(|n| format!("{stem}-{n}{ext}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}
