use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSecondsWithFrac};
use tracing::error;

/// Progress events always report the first (and only) refinement pass.
pub const ITERATION_MARKER: u32 = 1;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: usize,
    pub total_steps: usize,
    pub iteration: u32,
    pub image: String,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub timestamp: DateTime<Utc>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub image: String,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub timestamp: DateTime<Utc>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde_as(as = "TimestampSecondsWithFrac<f64>")]
    pub timestamp: DateTime<Utc>,
}

/// One record of a generation stream. A stream is zero or more `Progress`
/// events followed by exactly one `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

impl StreamEvent {
    pub fn complete(image: String) -> Self {
        Self::Complete(CompleteEvent {
            image,
            timestamp: Utc::now(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    /// Renders the event as one NDJSON line, newline included.
    pub fn to_ndjson(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                error!("❌ Failed to serialize stream event: {}", e);
                "{\"type\":\"error\",\"message\":\"Error sending update\"}\n".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    #[test]
    fn progress_line_uses_wire_field_names() {
        let event = StreamEvent::Progress(ProgressEvent {
            step: 4,
            total_steps: 10,
            iteration: ITERATION_MARKER,
            image: "abc".into(),
            timestamp: at(1_700_000_000, 500),
        });
        let line = event.to_ndjson();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "progress",
                "step": 4,
                "total_steps": 10,
                "iteration": 1,
                "image": "abc",
                "timestamp": 1_700_000_000.5,
            })
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_events_are_tagged() {
        let complete = StreamEvent::complete("img".into());
        let error = StreamEvent::error("boom");
        assert!(complete.is_terminal() && error.is_terminal());

        let value: serde_json::Value = serde_json::from_str(&error.to_ndjson()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "boom");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);

        let parsed: StreamEvent = serde_json::from_str(&complete.to_ndjson()).unwrap();
        assert!(matches!(parsed, StreamEvent::Complete(CompleteEvent { ref image, .. }) if image == "img"));
    }
}
