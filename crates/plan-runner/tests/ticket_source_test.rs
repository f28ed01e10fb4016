//! Ticket sources against real files and processes.

use plan_coordination::{SourceError, TicketSource};
use plan_runner::{CommandTicketSource, FileTicketSource};
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_markdown_preferred_over_text() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("T-1.md"), "# Markdown ticket").unwrap();
    std::fs::write(dir.path().join("T-1.txt"), "plain ticket").unwrap();
    std::fs::write(dir.path().join("T-2.txt"), "plain only").unwrap();

    let source = FileTicketSource::new(dir.path());
    assert_eq!(source.fetch("T-1").await.unwrap(), "# Markdown ticket");
    assert_eq!(source.fetch("T-2").await.unwrap(), "plain only");
}

#[tokio::test]
async fn test_missing_and_empty_tickets() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("EMPTY.md"), "  \n").unwrap();
    let source = FileTicketSource::new(dir.path());

    assert!(matches!(
        source.fetch("T-9").await,
        Err(SourceError::NotFound(id)) if id == "T-9"
    ));
    assert!(matches!(
        source.fetch("EMPTY").await,
        Err(SourceError::Unavailable(_))
    ));
    assert!(matches!(
        source.fetch("../secrets").await,
        Err(SourceError::Unavailable(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_output_is_the_ticket() {
    let source = CommandTicketSource::new("echo 'ticket {id}: add routes'").unwrap();
    assert_eq!(
        source.fetch("PROJ-5").await.unwrap(),
        "ticket PROJ-5: add routes\n"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_failures() {
    let failing = CommandTicketSource::new("sh -c 'echo boom >&2; exit 3'").unwrap();
    let err = failing.fetch("T-1").await.unwrap_err();
    assert!(matches!(&err, SourceError::Unavailable(m) if m.contains("boom")), "{err}");

    let silent = CommandTicketSource::new("true {id}").unwrap();
    assert!(matches!(
        silent.fetch("T-1").await,
        Err(SourceError::NotFound(_))
    ));

    let missing = CommandTicketSource::new("definitely-not-a-ticket-tool {id}").unwrap();
    assert!(matches!(
        missing.fetch("T-1").await,
        Err(SourceError::Unavailable(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_timeout() {
    let slow = CommandTicketSource::new("sleep 5")
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let err = slow.fetch("T-1").await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}
