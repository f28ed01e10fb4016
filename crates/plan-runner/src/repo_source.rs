//! Repository excerpts from a local checkout
//!
//! Walks the tree with the `ignore` crate (honouring `.gitignore`, skipping
//! hidden entries), scores every text file by keyword hits, and returns a
//! window of lines around the first hit of the best files.

use async_trait::async_trait;
use ignore::WalkBuilder;
use plan_coordination::{RepoExcerpt, RepositorySource, SourceError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path hits weigh more than content hits
const PATH_WEIGHT: usize = 3;

#[derive(Debug, Clone)]
pub struct DirectoryRepositorySource {
    root: PathBuf,
    max_files: usize,
    max_file_bytes: u64,
    lines_before: usize,
    max_lines: usize,
}

impl DirectoryRepositorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_files: 8,
            max_file_bytes: 256 * 1024,
            lines_before: 3,
            max_lines: 40,
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self, keywords: &[String]) -> Vec<RepoExcerpt> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .build();

        let mut scored: Vec<(usize, RepoExcerpt)> = Vec::new();
        for entry in walker.flatten() {
            let path = entry.path();
            let too_big = entry
                .metadata()
                .map(|m| m.len() > self.max_file_bytes)
                .unwrap_or(true);
            if !path.is_file() || too_big {
                continue;
            }
            // Binary and non-UTF-8 files are skipped
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let relative = relative_path(&self.root, path);
            if let Some((score, excerpt)) = self.score(&relative, &content, keywords) {
                scored.push((score, excerpt));
            }
        }

        scored.sort_by(|(a, ea), (b, eb)| b.cmp(a).then_with(|| ea.path.cmp(&eb.path)));
        scored
            .into_iter()
            .take(self.max_files)
            .map(|(_, excerpt)| excerpt)
            .collect()
    }

    fn score(
        &self,
        relative: &str,
        content: &str,
        keywords: &[String],
    ) -> Option<(usize, RepoExcerpt)> {
        let path_lower = relative.to_lowercase();
        let content_lower = content.to_lowercase();

        let score: usize = keywords
            .iter()
            .map(|k| {
                path_lower.matches(k.as_str()).count() * PATH_WEIGHT
                    + content_lower.matches(k.as_str()).count()
            })
            .sum();
        if score == 0 {
            return None;
        }

        let lines: Vec<&str> = content.lines().collect();
        let first_hit = lines
            .iter()
            .position(|line| {
                let line = line.to_lowercase();
                keywords.iter().any(|k| line.contains(k.as_str()))
            })
            .unwrap_or(0);
        let start = first_hit.saturating_sub(self.lines_before);
        let end = (start + self.max_lines).min(lines.len());
        Some((score, RepoExcerpt::new(relative, lines[start..end].join("\n"))))
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl RepositorySource for DirectoryRepositorySource {
    async fn excerpts(&self, keywords: &[String]) -> Result<Vec<RepoExcerpt>, SourceError> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        if !self.root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "repository directory {} does not exist",
                self.root.display()
            )));
        }

        let source = self.clone();
        let excerpts = tokio::task::spawn_blocking(move || source.scan(&keywords))
            .await
            .map_err(|e| SourceError::Unavailable(format!("repository scan failed: {e}")))?;
        debug!(root = %self.root.display(), excerpts = excerpts.len(), "Repository scanned");
        Ok(excerpts)
    }
}
