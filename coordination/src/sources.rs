//! Input boundaries: ticket text and repository excerpts
//!
//! Concrete fetchers (files, commands, directory walks) live in the runner;
//! the controller only sees these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("ticket not found: {0}")]
    NotFound(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Raw ticket/feature description
    async fn fetch(&self, ticket_id: &str) -> Result<String, SourceError>;
}

/// A slice of repository content offered to the assembler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoExcerpt {
    /// Path relative to the repository root
    pub path: String,
    pub content: String,
}

impl RepoExcerpt {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Excerpts relevant to `keywords`, most relevant first
    async fn excerpts(&self, keywords: &[String]) -> Result<Vec<RepoExcerpt>, SourceError>;
}

pub type SharedTicketSource = Arc<dyn TicketSource>;
pub type SharedRepositorySource = Arc<dyn RepositorySource>;

/// Tickets held in memory, keyed by id
#[derive(Debug, Clone, Default)]
pub struct StaticTicketSource {
    tickets: HashMap<String, String>,
}

impl StaticTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ticket(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.tickets.insert(id.into(), text.into());
        self
    }
}

#[async_trait]
impl TicketSource for StaticTicketSource {
    async fn fetch(&self, ticket_id: &str) -> Result<String, SourceError> {
        self.tickets
            .get(ticket_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(ticket_id.to_string()))
    }
}
