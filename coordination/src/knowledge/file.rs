//! File-backed knowledge base
//!
//! One pretty JSON document per signature. Writers for the same signature
//! are serialized by a per-key mutex within the process and by a
//! `<sig>.lock` lease across processes; different signatures proceed in
//! parallel. Documents are replaced via temp-file + rename, so every read
//! sees either the previous or the new pattern.

use super::{
    sort_for_listing, KnowledgeError, KnowledgeResult, KnowledgeStore, LearnedPattern,
    PatternDelta,
};
use crate::feedback::Signature;
use crate::state::store::write_atomic;
use crate::state::FileLease;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A signature lock older than this belongs to a writer that died mid-upsert
const LOCK_TTL: Duration = Duration::from_secs(10);

/// Longest wait for another process's upsert of the same signature
const LOCK_WAIT: Duration = Duration::from_secs(30);

pub struct FileKnowledgeBase {
    dir: PathBuf,
    locks: DashMap<Signature, Arc<Mutex<()>>>,
}

impl FileKnowledgeBase {
    /// Open or create a knowledge base directory
    pub fn open(dir: impl Into<PathBuf>) -> KnowledgeResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, signature: &Signature) -> PathBuf {
        self.dir.join(format!("{}.json", signature.as_str()))
    }

    fn lock_path(&self, signature: &Signature) -> PathBuf {
        self.dir.join(format!("{}.lock", signature.as_str()))
    }

    fn lock_for(&self, signature: &Signature) -> Arc<Mutex<()>> {
        self.locks.entry(signature.clone()).or_default().clone()
    }

    fn read(&self, signature: &Signature) -> KnowledgeResult<Option<LearnedPattern>> {
        read_pattern(&self.path_for(signature), signature.as_str())
    }
}

fn read_pattern(path: &Path, label: &str) -> KnowledgeResult<Option<LearnedPattern>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| KnowledgeError::Corrupt {
            signature: label.to_string(),
            message: e.to_string(),
        })
}

impl KnowledgeStore for FileKnowledgeBase {
    fn get(&self, signature: &Signature) -> KnowledgeResult<Option<LearnedPattern>> {
        self.read(signature)
    }

    fn upsert(
        &self,
        signature: &Signature,
        delta: &PatternDelta,
    ) -> KnowledgeResult<LearnedPattern> {
        let lock = self.lock_for(signature);
        let _guard = lock.lock().map_err(|_| KnowledgeError::LockPoisoned)?;
        let _lease = FileLease::acquire(&self.lock_path(signature), LOCK_TTL, LOCK_WAIT)?;

        let pattern = match self.read(signature)? {
            Some(mut existing) => {
                existing.observe();
                existing
            }
            None => LearnedPattern::first(signature.clone(), delta),
        };
        let json = serde_json::to_string_pretty(&pattern)?;
        write_atomic(&self.path_for(signature), json.as_bytes())?;

        debug!(
            signature = %signature.short(),
            occurrences = pattern.occurrences,
            confidence = pattern.confidence,
            "Knowledge pattern upserted"
        );
        Ok(pattern)
    }

    fn list(&self) -> KnowledgeResult<Vec<LearnedPattern>> {
        let mut patterns = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|_| path.extension().and_then(|e| e.to_str()) == Some("json"))
            else {
                continue;
            };
            if Signature::parse(stem).is_none() {
                continue;
            }
            if let Some(pattern) = read_pattern(&path, stem)? {
                patterns.push(pattern);
            }
        }
        sort_for_listing(&mut patterns);
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_patterns_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let sig = Signature::derive("environment-readiness", "cluster unreachable");
        let delta = PatternDelta::new("environment-readiness", "cluster unreachable", "probe");

        {
            let kb = FileKnowledgeBase::open(dir.path()).unwrap();
            kb.upsert(&sig, &delta).unwrap();
            kb.upsert(&sig, &delta).unwrap();
        }

        let kb = FileKnowledgeBase::open(dir.path()).unwrap();
        let pattern = kb.get(&sig).unwrap().unwrap();
        assert_eq!(pattern.occurrences, 2);
        assert_eq!(kb.list().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_waits_for_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let kb = FileKnowledgeBase::open(dir.path()).unwrap();
        let sig = Signature::derive("test-logic", "duplicated steps");
        let delta = PatternDelta::new("test-logic", "duplicated steps", "dedupe");

        let held = FileLease::try_acquire(&kb.lock_path(&sig), LOCK_TTL)
            .unwrap()
            .unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(held);
        });
        let pattern = kb.upsert(&sig, &delta).unwrap();
        release.join().unwrap();

        assert_eq!(pattern.occurrences, 1);
        assert!(!kb.lock_path(&sig).exists());
        assert_eq!(kb.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        let kb = FileKnowledgeBase::open(dir.path()).unwrap();
        assert!(kb.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_pattern_reported() {
        let dir = TempDir::new().unwrap();
        let kb = FileKnowledgeBase::open(dir.path()).unwrap();
        let sig = Signature::derive("test-logic", "duplicated steps");
        std::fs::write(dir.path().join(format!("{sig}.json")), "garbage").unwrap();
        assert!(matches!(
            kb.get(&sig),
            Err(KnowledgeError::Corrupt { .. })
        ));
    }
}
