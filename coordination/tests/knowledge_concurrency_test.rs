//! Knowledge base concurrency tests
//!
//! Tests verify, for both backends:
//! - Parallel upserts of one signature lose no observation
//! - Independently opened handles on one directory lose nothing either,
//!   the way separate runner processes share a state dir
//! - Confidence strictly increases per sequential upsert
//! - Different signatures do not interfere

use plan_coordination::feedback::Signature;
use plan_coordination::knowledge::{
    FileKnowledgeBase, KnowledgeStore, MemoryKnowledgeBase, PatternDelta, SharedKnowledgeStore,
};
use std::sync::Arc;
use tempfile::tempdir;

fn delta() -> PatternDelta {
    PatternDelta::new(
        "feature-availability",
        "target feature appears unimplemented",
        "add explicit prerequisite check for routes",
    )
}

async fn hammer(kb: SharedKnowledgeStore, signature: Signature, writers: usize, per_writer: usize) {
    let handles: Vec<_> = (0..writers)
        .map(|_| {
            let kb = kb.clone();
            let signature = signature.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..per_writer {
                    kb.upsert(&signature, &delta()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_upserts_lose_nothing_in_memory() {
    let kb: SharedKnowledgeStore = Arc::new(MemoryKnowledgeBase::new());
    let signature = Signature::derive("feature-availability", "missing: routes");
    hammer(kb.clone(), signature.clone(), 8, 25).await;

    let pattern = kb.get(&signature).unwrap().unwrap();
    assert_eq!(pattern.occurrences, 200);
    assert!(pattern.confidence <= 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_upserts_lose_nothing_on_disk() {
    let dir = tempdir().unwrap();
    let kb: SharedKnowledgeStore = Arc::new(FileKnowledgeBase::open(dir.path()).unwrap());
    let signature = Signature::derive("environment-readiness", "connection refused");
    hammer(kb.clone(), signature.clone(), 6, 10).await;

    let pattern = kb.get(&signature).unwrap().unwrap();
    assert_eq!(pattern.occurrences, 60);
    assert_eq!(kb.list().unwrap().len(), 1);
}

#[test]
fn test_independent_handles_on_one_directory_lose_nothing() {
    let dir = tempdir().unwrap();
    let signature = Signature::derive("environment-readiness", "cluster unreachable");

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let kb = FileKnowledgeBase::open(dir.path()).unwrap();
            let signature = signature.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    kb.upsert(&signature, &delta()).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let kb = FileKnowledgeBase::open(dir.path()).unwrap();
    let pattern = kb.get(&signature).unwrap().unwrap();
    assert_eq!(pattern.occurrences, 400);
    assert_eq!(kb.list().unwrap().len(), 1);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.ends_with(".json"))
        .collect();
    assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_signatures_proceed_independently() {
    let dir = tempdir().unwrap();
    let kb: SharedKnowledgeStore = Arc::new(FileKnowledgeBase::open(dir.path()).unwrap());
    let signatures: Vec<Signature> = (0..5)
        .map(|i| Signature::derive("test-logic", &format!("duplicated step {}", "x".repeat(i + 1))))
        .collect();

    let handles: Vec<_> = signatures
        .iter()
        .cloned()
        .map(|sig| tokio::spawn(hammer(kb.clone(), sig, 2, 5)))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let patterns = kb.list().unwrap();
    assert_eq!(patterns.len(), 5);
    assert!(patterns.iter().all(|p| p.occurrences == 10));
}

#[test]
fn test_confidence_strictly_increases_for_k_observations() {
    let dir = tempdir().unwrap();
    for kb in [
        Arc::new(MemoryKnowledgeBase::new()) as SharedKnowledgeStore,
        Arc::new(FileKnowledgeBase::open(dir.path()).unwrap()),
    ] {
        let signature = Signature::derive("feature-availability", "crd missing");
        let mut last = -1.0;
        for k in 1..=12u32 {
            let pattern = kb.upsert(&signature, &delta()).unwrap();
            assert_eq!(pattern.occurrences, k);
            assert!(
                pattern.confidence > last,
                "confidence must rise: {} then {}",
                last,
                pattern.confidence
            );
            assert!(pattern.confidence <= 1.0);
            last = pattern.confidence;
        }
    }
}
