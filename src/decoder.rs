//! Classifies framed worker lines into [`Event`]s.
//!
//! stdout carries the worker protocol: one JSON object per line with a `type`
//! field and either a `message` or, for screenshots, a `data` field. Anything
//! else is kept as free text. stderr is never parsed.

use serde::Deserialize;

use crate::types::{Event, LogKind};

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkerRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
}

/// Decodes one line. Never fails: malformed input degrades to a log event
/// whose text is the original line.
pub fn decode(line: &str, source: StreamSource) -> Event {
    match source {
        StreamSource::Stdout => decode_stdout(line),
        StreamSource::Stderr => Event::log(LogKind::Error, line),
    }
}

fn decode_stdout(line: &str) -> Event {
    if !line.trim_start().starts_with('{') {
        return Event::log(LogKind::System, line);
    }

    let record: WorkerRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(_) => return Event::log(LogKind::System, line),
    };

    let kind = record.kind.as_deref().unwrap_or("system");
    if kind == "screenshot" {
        return match record.data {
            Some(serde_json::Value::String(data)) => Event::Screenshot { data },
            _ => Event::log(LogKind::System, line),
        };
    }

    let text = match record.message {
        Some(serde_json::Value::String(message)) => message,
        Some(serde_json::Value::Null) | None => line.to_string(),
        Some(other) => other.to_string(),
    };

    Event::log(LogKind::from_worker_type(kind), text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_parts(event: Event) -> (LogKind, String) {
        match event {
            Event::Log(entry) => (entry.kind, entry.text),
            other => panic!("expected log, got {other:?}"),
        }
    }

    #[test]
    fn structured_lines_map_declared_kind() {
        let (kind, text) = log_parts(decode(
            r#"{"type":"result","message":"Final result: 42"}"#,
            StreamSource::Stdout,
        ));
        assert_eq!(kind, LogKind::Result);
        assert_eq!(text, "Final result: 42");

        let (kind, _) = log_parts(decode(
            r#"  {"type":"urls","message":"https://example.com"}"#,
            StreamSource::Stdout,
        ));
        assert_eq!(kind, LogKind::Urls);
    }

    #[test]
    fn screenshot_becomes_screenshot_event_only() {
        let event = decode(r#"{"type":"screenshot","data":"iVBORw0KGgo="}"#, StreamSource::Stdout);
        assert_eq!(
            event,
            Event::Screenshot {
                data: "iVBORw0KGgo=".into()
            }
        );
    }

    #[test]
    fn missing_message_falls_back_to_line() {
        let line = r#"{"type":"error"}"#;
        let (kind, text) = log_parts(decode(line, StreamSource::Stdout));
        assert_eq!(kind, LogKind::Error);
        assert_eq!(text, line);
    }

    #[test]
    fn malformed_structured_line_degrades_to_raw_log() {
        for line in [
            r#"{"type":"system","message":"unterminated"#,
            "{not json at all}",
            r#"{"type":"screenshot"}"#,
            "[1, 2, 3]",
        ] {
            let (kind, text) = log_parts(decode(line, StreamSource::Stdout));
            assert_eq!(kind, LogKind::System);
            assert_eq!(text, line);
        }
    }

    #[test]
    fn plain_text_is_system_log() {
        let (kind, text) = log_parts(decode("INFO     [agent] Step 1", StreamSource::Stdout));
        assert_eq!(kind, LogKind::System);
        assert_eq!(text, "INFO     [agent] Step 1");
    }

    #[test]
    fn stderr_is_never_parsed() {
        let line = r#"{"type":"screenshot","data":"abc"}"#;
        let (kind, text) = log_parts(decode(line, StreamSource::Stderr));
        assert_eq!(kind, LogKind::Error);
        assert_eq!(text, line);
    }
}
