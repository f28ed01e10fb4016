//! Artifact Normalizer: canonical structure for deterministic validation
//!
//! Two-column step/result tables are split into chunks of at most
//! `max_rows` data rows, each re-emitting the original header and separator.
//! Rows matching the denylist (blocking watch-style polling and similar
//! non-deterministic constructs) are dropped. Everything else is prose and
//! passes through untouched.
//!
//! `normalize(normalize(x)) == normalize(x)` for every input.

use crate::config::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$")
        .expect("separator regex is valid")
});

/// Default denylist of non-deterministic row constructs
pub const DEFAULT_DENYLIST: &[&str] = &[
    r"(?i)\bwatch\s+(-n\s*\d+\s+)?(kubectl|oc|curl|ls|cat|docker|podman|systemctl)\b",
    r"(?i)\s--watch\b",
    r"(?i)\s-w(\s|\||$)",
    r"(?i)\btail\s+-f\b",
    r"(?i)\bsleep\s+\d+",
    r"(?i)\bwait\s+until\b.*\bappears?\b",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Maximum data rows per emitted table chunk
    pub max_rows: usize,
    /// Regexes; a table row matching any of them is stripped
    pub denylist: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_rows: 8,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// One row of a step/result table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRow {
    pub step: String,
    pub expected: String,
}

/// A parsed two-column step/result table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTable {
    pub header: (String, String),
    pub rows: Vec<StepRow>,
}

enum Segment<'a> {
    Prose(&'a str),
    Table {
        header: &'a str,
        separator: &'a str,
        rows: Vec<&'a str>,
    },
}

#[derive(Debug, Clone)]
pub struct ArtifactNormalizer {
    max_rows: usize,
    denylist: Vec<Regex>,
}

impl ArtifactNormalizer {
    /// Compile the denylist. An invalid pattern is a configuration error.
    pub fn new(config: &NormalizerConfig) -> Result<Self, ConfigError> {
        if config.max_rows == 0 {
            return Err(ConfigError::InvalidValue {
                key: "normalizer.max_rows".to_string(),
                value: "0".to_string(),
            });
        }
        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_rows: config.max_rows,
            denylist,
        })
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    fn is_denied(&self, row: &str) -> bool {
        self.denylist.iter().any(|re| re.is_match(row))
    }

    /// Normalize raw oracle output into canonical form.
    pub fn normalize(&self, raw: &str) -> String {
        let text = raw.replace("\r\n", "\n").replace('\r', "\n");
        let trailing_newline = text.ends_with('\n');

        let mut out: Vec<&str> = Vec::new();
        for segment in scan(&text) {
            match segment {
                Segment::Prose(line) => out.push(line),
                Segment::Table {
                    header,
                    separator,
                    rows,
                } => {
                    let kept: Vec<&str> = rows.into_iter().filter(|r| !self.is_denied(r)).collect();
                    if kept.is_empty() {
                        out.push(header);
                        out.push(separator);
                        continue;
                    }
                    for (idx, chunk) in kept.chunks(self.max_rows).enumerate() {
                        if idx > 0 {
                            out.push("");
                        }
                        out.push(header);
                        out.push(separator);
                        out.extend_from_slice(chunk);
                    }
                }
            }
        }

        let mut normalized = out.join("\n");
        if trailing_newline {
            normalized.push('\n');
        }
        normalized
    }
}

/// Step/result tables found in an artifact, outside code fences
pub fn step_tables(text: &str) -> Vec<StepTable> {
    let text = text.replace("\r\n", "\n");
    scan(&text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Table { header, rows, .. } => {
                let mut header_cells = cells(header).into_iter();
                let header = (
                    header_cells.next().unwrap_or_default(),
                    header_cells.next().unwrap_or_default(),
                );
                let rows = rows
                    .into_iter()
                    .map(|row| {
                        let mut c = cells(row).into_iter();
                        StepRow {
                            step: c.next().unwrap_or_default(),
                            expected: c.next().unwrap_or_default(),
                        }
                    })
                    .collect();
                Some(StepTable { header, rows })
            }
            Segment::Prose(_) => None,
        })
        .collect()
}

/// Lines that are not part of a step/result table
pub fn prose_lines(text: &str) -> Vec<String> {
    let text = text.replace("\r\n", "\n");
    scan(&text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Prose(line) => Some(line.to_string()),
            Segment::Table { .. } => None,
        })
        .collect()
}

fn is_table_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn cells(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn scan(text: &str) -> Vec<Segment<'_>> {
    let lines: Vec<&str> = match text.strip_suffix('\n') {
        Some(body) => body.split('\n').collect(),
        None if text.is_empty() => Vec::new(),
        None => text.split('\n').collect(),
    };

    let mut segments = Vec::new();
    let mut in_fence = false;
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_fence(line) {
            in_fence = !in_fence;
            segments.push(Segment::Prose(line));
            i += 1;
            continue;
        }

        let starts_table = !in_fence
            && is_table_row(line)
            && !SEPARATOR.is_match(line)
            && cells(line).len() == 2
            && lines.get(i + 1).is_some_and(|next| SEPARATOR.is_match(next));

        if !starts_table {
            segments.push(Segment::Prose(line));
            i += 1;
            continue;
        }

        let header = line;
        let separator = lines[i + 1];
        let mut rows = Vec::new();
        i += 2;
        while i < lines.len() && is_table_row(lines[i]) {
            rows.push(lines[i]);
            i += 1;
        }
        segments.push(Segment::Table {
            header,
            separator,
            rows,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(max_rows: usize) -> ArtifactNormalizer {
        ArtifactNormalizer::new(&NormalizerConfig {
            max_rows,
            ..NormalizerConfig::default()
        })
        .unwrap()
    }

    fn table(rows: usize) -> String {
        let mut text = String::from("| Step | Expected Result |\n|---|---|\n");
        for n in 0..rows {
            text.push_str(&format!("| run step {n} | output {n} shown |\n"));
        }
        text
    }

    #[test]
    fn test_splits_long_table_with_headers() {
        let out = normalizer(3).normalize(&table(7));
        let tables = step_tables(&out);
        assert_eq!(tables.len(), 3);
        assert_eq!(
            tables.iter().map(|t| t.rows.len()).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(out.matches("| Step | Expected Result |").count(), 3);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_strips_watch_rows() {
        let raw = "| Step | Expected |\n|---|---|\n\
                   | kubectl get pods -w | pods appear |\n\
                   | kubectl apply -f x.yaml | created |\n\
                   | watch kubectl get svc | svc listed |\n\
                   | sleep 30 | nothing |\n";
        let out = normalizer(8).normalize(raw);
        assert!(!out.contains("-w"));
        assert!(!out.contains("watch"));
        assert!(!out.contains("sleep"));
        assert!(out.contains("kubectl apply"));
    }

    #[test]
    fn test_prose_and_wide_tables_untouched() {
        let raw = "# Plan\n\nSome prose with | a pipe.\n\n| a | b | c |\n|---|---|---|\n| 1 | 2 | 3 |\n";
        assert_eq!(normalizer(1).normalize(raw), raw);
    }

    #[test]
    fn test_fenced_tables_are_prose() {
        let mut raw = String::from("```\n");
        raw.push_str(&table(5));
        raw.push_str("```\n");
        assert_eq!(normalizer(2).normalize(&raw), raw);
        assert!(step_tables(&raw).is_empty());
    }

    #[test]
    fn test_fully_stripped_table_keeps_header() {
        let raw = "| Step | Expected |\n|---|---|\n| tail -f log | line |\n";
        let out = normalizer(8).normalize(raw);
        assert_eq!(out, "| Step | Expected |\n|---|---|\n");
        assert_eq!(normalizer(8).normalize(&out), out);
    }

    #[test]
    fn test_crlf_is_normalized() {
        let raw = "intro\r\n| Step | Expected |\r\n|---|---|\r\n| a | b |\r\n";
        let out = normalizer(8).normalize(raw);
        assert!(!out.contains('\r'));
        assert_eq!(step_tables(&out)[0].rows.len(), 1);
    }

    #[test]
    fn test_invalid_denylist_is_config_error() {
        let config = NormalizerConfig {
            max_rows: 8,
            denylist: vec!["(unclosed".to_string()],
        };
        assert!(matches!(
            ArtifactNormalizer::new(&config),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_prose_lines_exclude_tables() {
        let raw = format!("Environment check: connection refused\n\n{}", table(2));
        let prose = prose_lines(&raw);
        assert_eq!(prose.len(), 2);
        assert!(prose[0].contains("connection refused"));
    }
}
