use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::frame::StreamFrame;
use crate::model::Row;

/// Typed pipeline lifecycle events, produced from raw frames by [`interpret`].
#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    /// A pipeline stage began executing.
    StageStarted { stage_id: String },
    /// A pipeline stage finished.
    StageCompleted { stage_id: String },
    /// The pipeline paused and needs more input from the user.
    ClarificationRequested { question: String },
    /// The pipeline produced its final answer.
    ResultProduced(QueryResult),
    /// The pipeline reported a failure.
    Failed {
        error_code: Option<String>,
        error_message: Option<String>,
    },
    /// Terminal marker; nothing follows it.
    StreamEnded,
}

impl DomainEvent {
    /// Returns true for events that settle the outcome of a turn.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::ClarificationRequested { .. } | Self::ResultProduced(_) | Self::Failed { .. }
        )
    }
}

/// Final answer of a turn.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueryResult {
    #[serde(default, rename = "sql", deserialize_with = "field_or_default")]
    pub sql_text: Option<String>,
    #[serde(default, rename = "summary", deserialize_with = "field_or_default")]
    pub summary_text: Option<String>,
    #[serde(default, rename = "execute_result", deserialize_with = "field_or_default")]
    pub rows: Option<Vec<Row>>,
}

#[derive(Default, Deserialize)]
struct StagePayload {
    #[serde(default, deserialize_with = "field_or_default")]
    node: String,
}

#[derive(Default, Deserialize)]
struct ClarificationPayload {
    #[serde(default, deserialize_with = "field_or_default")]
    question: String,
}

#[derive(Default, Deserialize)]
struct FailurePayload {
    #[serde(default, deserialize_with = "field_or_default")]
    error_code: Option<String>,
    #[serde(default, deserialize_with = "field_or_default")]
    error_message: Option<String>,
}

/// Reads one payload field, falling back to its default when the value has
/// the wrong type. The other fields of the payload are kept.
fn field_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value).unwrap_or_else(|err| {
        warn!(error = %err, "payload field has an unexpected type, using default");
        T::default()
    }))
}

const STAGE_LABELS: &[(&str, &str)] = &[
    ("schema_retriever", "Retrieving schema"),
    ("intent_parse", "Parsing intent"),
    ("follow_up", "Confirming details"),
    ("sql_generator", "Generating SQL"),
    ("sql_validator", "Validating SQL"),
    ("executor", "Running query"),
];

/// Human-readable label for a stage id; unknown ids are shown as-is.
pub fn stage_label(stage_id: &str) -> &str {
    STAGE_LABELS
        .iter()
        .find(|(id, _)| *id == stage_id)
        .map_or(stage_id, |(_, label)| *label)
}

/// Maps one frame to a domain event.
///
/// Returns `None` for event names this client does not know. Missing or
/// mistyped fields in a known payload fall back to defaults.
pub fn interpret(frame: &StreamFrame) -> Option<DomainEvent> {
    let payload = &frame.raw_payload;
    let event = match frame.event_name.as_str() {
        "node_start" => DomainEvent::StageStarted {
            stage_id: lenient::<StagePayload>(&frame.event_name, payload).node,
        },
        "node_complete" => DomainEvent::StageCompleted {
            stage_id: lenient::<StagePayload>(&frame.event_name, payload).node,
        },
        "follow_up" => DomainEvent::ClarificationRequested {
            question: lenient::<ClarificationPayload>(&frame.event_name, payload).question,
        },
        "result" => DomainEvent::ResultProduced(lenient::<QueryResult>(&frame.event_name, payload)),
        "error" => {
            let failure = lenient::<FailurePayload>(&frame.event_name, payload);
            DomainEvent::Failed {
                error_code: failure.error_code,
                error_message: failure.error_message,
            }
        }
        "done" => DomainEvent::StreamEnded,
        other => {
            debug!(event = other, "skipping unrecognized event");
            return None;
        }
    };
    Some(event)
}

fn lenient<T: DeserializeOwned + Default>(event: &str, payload: &serde_json::Value) -> T {
    if payload.is_null() {
        return T::default();
    }
    match serde_json::from_value(payload.clone()) {
        Ok(value) => value,
        Err(err) => {
            warn!(event, error = %err, "payload shape mismatch, using defaults");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(name: &str, payload: serde_json::Value) -> StreamFrame {
        StreamFrame {
            event_name: name.into(),
            raw_payload: payload,
        }
    }

    #[test]
    fn maps_every_known_event() {
        assert_eq!(
            interpret(&frame("node_start", json!({"node": "executor"}))),
            Some(DomainEvent::StageStarted {
                stage_id: "executor".into()
            })
        );
        assert_eq!(
            interpret(&frame("node_complete", json!({"node": "executor"}))),
            Some(DomainEvent::StageCompleted {
                stage_id: "executor".into()
            })
        );
        assert_eq!(
            interpret(&frame("follow_up", json!({"question": "Which year?"}))),
            Some(DomainEvent::ClarificationRequested {
                question: "Which year?".into()
            })
        );
        assert_eq!(
            interpret(&frame("done", json!({}))),
            Some(DomainEvent::StreamEnded)
        );
        assert_eq!(
            interpret(&frame(
                "error",
                json!({"error_code": "SQL_INVALID", "error_message": "bad column"})
            )),
            Some(DomainEvent::Failed {
                error_code: Some("SQL_INVALID".into()),
                error_message: Some("bad column".into()),
            })
        );
    }

    #[test]
    fn result_payload_maps_wire_names() {
        let event = interpret(&frame(
            "result",
            json!({"sql": "SELECT 1", "summary": null, "execute_result": [{"x": 1}]}),
        ));
        let Some(DomainEvent::ResultProduced(result)) = event else {
            panic!("expected result, got {event:?}");
        };
        assert_eq!(result.sql_text.as_deref(), Some("SELECT 1"));
        assert_eq!(result.summary_text, None);
        let rows = result.rows.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(&json!(1)));
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert_eq!(interpret(&frame("heartbeat", json!({"t": 1}))), None);
        assert_eq!(interpret(&frame("", json!({}))), None);
    }

    #[test]
    fn missing_or_mistyped_fields_use_defaults() {
        assert_eq!(
            interpret(&frame("node_start", json!({}))),
            Some(DomainEvent::StageStarted {
                stage_id: String::new()
            })
        );
        assert_eq!(
            interpret(&frame("follow_up", json!({"question": 42}))),
            Some(DomainEvent::ClarificationRequested {
                question: String::new()
            })
        );
        assert_eq!(
            interpret(&frame("error", serde_json::Value::Null)),
            Some(DomainEvent::Failed {
                error_code: None,
                error_message: None,
            })
        );
        assert_eq!(
            interpret(&frame("result", json!("not an object"))),
            Some(DomainEvent::ResultProduced(QueryResult::default()))
        );
    }

    #[test]
    fn mistyped_rows_keep_the_sql() {
        let event = interpret(&frame(
            "result",
            json!({"sql": "SELECT 1", "execute_result": [[1]]}),
        ));
        assert_eq!(
            event,
            Some(DomainEvent::ResultProduced(QueryResult {
                sql_text: Some("SELECT 1".into()),
                summary_text: None,
                rows: None,
            }))
        );
    }

    #[test]
    fn numeric_error_code_keeps_the_message() {
        assert_eq!(
            interpret(&frame(
                "error",
                json!({"error_code": 500, "error_message": "boom"})
            )),
            Some(DomainEvent::Failed {
                error_code: None,
                error_message: Some("boom".into()),
            })
        );
    }

    #[test]
    fn labels_fall_back_to_raw_id() {
        assert_eq!(stage_label("sql_generator"), "Generating SQL");
        assert_eq!(stage_label("sql_judge"), "sql_judge");
    }
}
