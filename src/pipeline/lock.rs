//! Single-run guard: a lock file at `<root>/.pipeline.lock`.
//!
//! The file is created with `create_new`, so two runs racing for the same
//! root cannot both succeed. Its body is the RFC 3339 acquisition time; the
//! file mtime is used when the body cannot be parsed. A lock older than the
//! stale threshold is treated as left behind by a dead run: it is renamed
//! to a unique tombstone, checked to still be the lock that was judged
//! stale, and creation is retried once. A lock that changed in between
//! belongs to a run that reclaimed it first and is put back.
//!
//! [`RunLock`] releases the file on drop, so every exit path of a run
//! (success, error, panic unwinding) clears it.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = ".pipeline.lock";

/// A held lock; dropping it removes the lock file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock for `root`, creating `root` if needed.
    ///
    /// Fails with [`PipelineError::AlreadyRunning`] when a lock younger than
    /// `stale_after` exists.
    pub fn acquire(root: &Path, stale_after: Duration) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(root).map_err(|e| PipelineError::OutputWriteFailed {
            path: root.to_path_buf(),
            source: e,
        })?;
        let path = root.join(LOCK_FILE);

        match try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(PipelineError::OutputWriteFailed { path, source: e }),
        }

        let observed = Observed::read(&path);
        let age = observed.age();
        if age < stale_after {
            return Err(PipelineError::AlreadyRunning {
                lock_path: path,
                age_secs: age.as_secs(),
            });
        }

        warn!(
            "Removing stale lock {} ({}s old)",
            path.display(),
            age.as_secs()
        );
        let already_running = |path: PathBuf| PipelineError::AlreadyRunning {
            age_secs: lock_age(&path).as_secs(),
            lock_path: path,
        };
        match reclaim(&path, &observed) {
            Ok(true) => {}
            Ok(false) => return Err(already_running(path)),
            Err(e) => return Err(PipelineError::OutputWriteFailed { path, source: e }),
        }

        match try_create(&path) {
            Ok(lock) => Ok(lock),
            // Another run reclaimed it between our remove and create.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(already_running(path)),
            Err(e) => Err(PipelineError::OutputWriteFailed { path, source: e }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove lock {}: {}", self.path.display(), e),
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<RunLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let lock = RunLock {
        path: path.to_path_buf(),
    };
    // From here on, dropping `lock` removes the file even if the write fails.
    file.write_all(Utc::now().to_rfc3339().as_bytes())?;
    info!("Acquired {}", path.display());
    Ok(lock)
}

/// What a lock file looked like when it was judged stale.
#[derive(Debug, PartialEq)]
struct Observed {
    body: Option<String>,
    modified: Option<SystemTime>,
}

impl Observed {
    fn read(path: &Path) -> Self {
        Self {
            body: std::fs::read_to_string(path).ok(),
            modified: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
        }
    }

    /// Time since acquisition: the RFC 3339 body, else the mtime.
    fn age(&self) -> Duration {
        self.body
            .as_deref()
            .and_then(|body| DateTime::parse_from_rfc3339(body.trim()).ok())
            .map(|t| SystemTime::from(t.with_timezone(&Utc)))
            .or(self.modified)
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Move the stale lock out of the way.
///
/// Returns `false` when the file at `path` is no longer the one `observed`
/// (another run got there first); a live lock taken by mistake is linked
/// back into place.
fn reclaim(path: &Path, observed: &Observed) -> std::io::Result<bool> {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let tombstone = path.with_file_name(format!(
        "{LOCK_FILE}.stale-{}-{nanos}",
        std::process::id()
    ));
    match std::fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let same = Observed::read(&tombstone) == *observed;
    if !same {
        match std::fs::hard_link(&tombstone, path) {
            Ok(()) => debug!("Restored live lock {}", path.display()),
            Err(e) => warn!("Could not restore lock {}: {}", path.display(), e),
        }
    }
    if let Err(e) = std::fs::remove_file(&tombstone) {
        warn!("Could not remove {}: {}", tombstone.display(), e);
    }
    Ok(same)
}

/// Age of an existing lock; zero when it cannot be determined.
fn lock_age(path: &Path) -> Duration {
    Observed::read(path).age()
}
