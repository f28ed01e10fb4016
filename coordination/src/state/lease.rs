//! Cross-process leases
//!
//! A lease is a file created with `create_new`, so exactly one holder wins
//! among every process sharing the directory. The file carries a random
//! token; only the holder whose token is still in the file removes it.
//!
//! A holder that dies leaves its file behind. A lease whose file has not
//! been refreshed within `ttl` is taken over by the next contender, so
//! long holders call [`FileLease::refresh`] well inside that window.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Default age after which an unrefreshed lease is considered abandoned
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

const WAIT_STEP: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    token: String,
}

impl FileLease {
    /// Take the lease if nobody live holds it.
    pub fn try_acquire(path: &Path, ttl: Duration) -> std::io::Result<Option<Self>> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        // Second pass only after a stale lease was broken
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                        token,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !break_if_stale(path, ttl)? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Block until the lease is free or `timeout` elapses.
    pub fn acquire(path: &Path, ttl: Duration, timeout: Duration) -> std::io::Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lease) = Self::try_acquire(path, ttl)? {
                return Ok(lease);
            }
            if started.elapsed() >= timeout {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out waiting for lease {}", path.display()),
                ));
            }
            std::thread::sleep(WAIT_STEP);
        }
    }

    /// Push the expiry out. `false` means another holder took the lease over.
    pub fn refresh(&self) -> std::io::Result<bool> {
        if !self.still_held()? {
            return Ok(false);
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_modified(SystemTime::now())?;
        Ok(true)
    }

    fn still_held(&self) -> std::io::Result<bool> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text == self.token),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        match self.still_held() {
            Ok(true) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to release lease");
                }
            }
            Ok(false) => debug!(path = %self.path.display(), "Lease was taken over"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to inspect lease"),
        }
    }
}

/// Remove `path` when its last refresh is older than `ttl`. Returns whether
/// the caller should try again.
fn break_if_stale(path: &Path, ttl: Duration) -> std::io::Result<bool> {
    let inspected = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .and_then(|modified| Ok((modified, std::fs::read_to_string(path)?)));
    let (modified, token) = match inspected {
        Ok(found) => found,
        // Released between our attempt and the inspection
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < ttl {
        return Ok(false);
    }
    // Only break the lease we judged stale, not a fresh one that replaced it
    if std::fs::read_to_string(path).ok().as_deref() != Some(token.as_str()) {
        return Ok(true);
    }
    warn!(path = %path.display(), age_secs = age.as_secs(), "Breaking stale lease");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
