//! In-memory knowledge base
//!
//! DashMap shards the map; its entry API holds the shard lock for the
//! read-modify-write of one signature, so parallel upserts never lose
//! an observation.

use super::{
    sort_for_listing, KnowledgeResult, KnowledgeStore, LearnedPattern, PatternDelta,
};
use crate::feedback::Signature;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryKnowledgeBase {
    patterns: DashMap<Signature, LearnedPattern>,
}

impl MemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl KnowledgeStore for MemoryKnowledgeBase {
    fn get(&self, signature: &Signature) -> KnowledgeResult<Option<LearnedPattern>> {
        Ok(self.patterns.get(signature).map(|p| p.value().clone()))
    }

    fn upsert(
        &self,
        signature: &Signature,
        delta: &PatternDelta,
    ) -> KnowledgeResult<LearnedPattern> {
        let entry = self
            .patterns
            .entry(signature.clone())
            .and_modify(LearnedPattern::observe)
            .or_insert_with(|| LearnedPattern::first(signature.clone(), delta));
        Ok(entry.value().clone())
    }

    fn list(&self) -> KnowledgeResult<Vec<LearnedPattern>> {
        let mut patterns: Vec<_> = self.patterns.iter().map(|p| p.value().clone()).collect();
        sort_for_listing(&mut patterns);
        Ok(patterns)
    }
}
