//! Ticket sources
//!
//! - [`FileTicketSource`] reads `<dir>/<id>.md`, falling back to `<dir>/<id>.txt`
//! - [`CommandTicketSource`] runs a command template and returns its stdout

use async_trait::async_trait;
use plan_coordination::{SourceError, TicketSource};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const TICKET_EXTENSIONS: &[&str] = &["md", "txt"];

/// Placeholder replaced by the ticket id in command templates
pub const ID_PLACEHOLDER: &str = "{id}";

/// Ticket ids become file names and command arguments
fn check_ticket_id(ticket_id: &str) -> Result<(), SourceError> {
    let ok = !ticket_id.is_empty()
        && !ticket_id.starts_with('.')
        && !ticket_id.starts_with('-')
        && !ticket_id.contains(['/', '\\', '\0'])
        && !ticket_id.chars().any(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err(SourceError::Unavailable(format!(
            "invalid ticket id '{ticket_id}'"
        )))
    }
}

pub struct FileTicketSource {
    dir: PathBuf,
}

impl FileTicketSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TicketSource for FileTicketSource {
    async fn fetch(&self, ticket_id: &str) -> Result<String, SourceError> {
        check_ticket_id(ticket_id)?;
        for ext in TICKET_EXTENSIONS {
            let path = self.dir.join(format!("{ticket_id}.{ext}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(text) if text.trim().is_empty() => {
                    return Err(SourceError::Unavailable(format!(
                        "ticket file {} is empty",
                        path.display()
                    )));
                }
                Ok(text) => {
                    debug!(path = %path.display(), bytes = text.len(), "Ticket read");
                    return Ok(text);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(SourceError::Io(e)),
            }
        }
        Err(SourceError::NotFound(ticket_id.to_string()))
    }
}

/// Runs e.g. `jira-cli issue view {id} --plain` without a shell.
///
/// The template is split into words first and `{id}` is substituted inside
/// each word, so an id can never inject extra arguments.
pub struct CommandTicketSource {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandTicketSource {
    pub fn new(template: &str) -> Result<Self, SourceError> {
        let template = shlex::split(template)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| {
                SourceError::Unavailable(format!("unparseable ticket command '{template}'"))
            })?;
        Ok(Self {
            template,
            timeout: Duration::from_secs(60),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Argument vector for `ticket_id`
    pub fn argv(&self, ticket_id: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|word| word.replace(ID_PLACEHOLDER, ticket_id))
            .collect()
    }
}

#[async_trait]
impl TicketSource for CommandTicketSource {
    async fn fetch(&self, ticket_id: &str) -> Result<String, SourceError> {
        check_ticket_id(ticket_id)?;
        let argv = self.argv(ticket_id);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SourceError::Unavailable("empty ticket command".into()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                SourceError::Unavailable(format!(
                    "`{program}` timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| SourceError::Unavailable(format!("cannot run `{program}`: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Unavailable(format!(
                "`{program}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(SourceError::NotFound(ticket_id.to_string()));
        }
        debug!(program = %program, bytes = text.len(), "Ticket fetched by command");
        Ok(text)
    }
}
