/// Append-only data quality log (JSONL sink)
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::types::{QualityEvent, QualityIssue};
use crate::utils::generate_idempotency_key;

/// Write-only sink for quality events. Without a path events only reach
/// the tracing output.
pub struct QualityLog {
    path: Option<PathBuf>,
    // serializes appends so lines never interleave
    writer: Mutex<()>,
}

impl QualityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        QualityLog {
            path: Some(path.into()),
            writer: Mutex::new(()),
        }
    }

    pub fn tracing_only() -> Self {
        QualityLog {
            path: None,
            writer: Mutex::new(()),
        }
    }

    /// Build an event with a deterministic id
    pub fn event(
        source: &str,
        ticker: &str,
        kind: QualityIssue,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> QualityEvent {
        let description = description.into();
        let id = generate_idempotency_key(&[
            source,
            ticker,
            kind.as_str(),
            &description,
            &at.to_rfc3339(),
        ]);

        QualityEvent {
            id,
            source: source.to_string(),
            ticker: ticker.to_string(),
            kind,
            description,
            timestamp: at,
        }
    }

    /// Append one event
    pub async fn record(&self, event: QualityEvent) -> Result<()> {
        self.record_all(vec![event]).await
    }

    /// Append a batch of events in one write
    pub async fn record_all(&self, events: Vec<QualityEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        for event in &events {
            warn!(
                source = %event.source,
                ticker = %event.ticker,
                kind = event.kind.as_str(),
                "Data quality issue: {}",
                event.description
            );
        }

        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut body = String::new();
        for event in &events {
            body.push_str(&serde_json::to_string(event)?);
            body.push('\n');
        }

        let _guard = self.writer.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_ids_are_deterministic() {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let a = QualityLog::event("test", "WTI", QualityIssue::MissingData, "empty fetch", at);
        let b = QualityLog::event("test", "WTI", QualityIssue::MissingData, "empty fetch", at);
        let c = QualityLog::event("test", "WTI", QualityIssue::InvalidValue, "empty fetch", at);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_record_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.jsonl");
        let log = QualityLog::new(&path);
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

        log.record(QualityLog::event("test", "WTI", QualityIssue::MissingData, "empty", at))
            .await
            .unwrap();
        log.record_all(vec![
            QualityLog::event("test", "WTI", QualityIssue::DuplicateConflict, "70 -> 71", at),
            QualityLog::event("test", "WTI", QualityIssue::InvalidValue, "NaN", at),
        ])
        .await
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<QualityEvent> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].kind, QualityIssue::DuplicateConflict);
    }

    #[tokio::test]
    async fn test_tracing_only_sink_accepts_events() {
        let log = QualityLog::tracing_only();
        let event = QualityLog::event("test", "WTI", QualityIssue::MissingData, "empty", Utc::now());
        assert!(log.record(event).await.is_ok());
    }
}
