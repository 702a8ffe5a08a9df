//! Progress events
//!
//! Every run pushes typed [`WorkflowEvent`]s into a bounded channel. The
//! consumer side is an [`EventStream`]; transports render each event with
//! [`WorkflowEvent::to_sse`] or [`WorkflowEvent::to_json_line`].

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::state::SubQuestion;
use crate::search::{Citation, FetchStatus};

/// Default channel capacity
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Start,
    End,
}

/// Metadata attached to the terminal `done` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneMetadata {
    pub sub_question_count: usize,
    pub sources_analyzed: usize,
    pub completion_timestamp: DateTime<Utc>,
    pub quality_score: Option<u8>,
    pub refinement_used: bool,
    pub timings_ms: BTreeMap<String, u64>,
    pub research_skipped: bool,
}

/// Final result of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    pub query: String,
    pub executive_summary: String,
    pub report: String,
    pub key_takeaways: Vec<String>,
    pub limitations: String,
    pub citations: Vec<Citation>,
    pub metadata: DoneMetadata,
}

/// Event body, tagged by event name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    ThreadId {},
    Planning {
        sub_question_count: usize,
        sub_questions: Vec<SubQuestion>,
    },
    ResearchProgress {
        sub_question_id: String,
        status: ProgressStatus,
        evidence_count: usize,
        message: String,
    },
    SourceFetch {
        sub_question_id: String,
        source_name: String,
        title: String,
        url: String,
        status: FetchStatus,
    },
    Quality {
        score: u8,
        passed: bool,
        issues: Vec<String>,
    },
    Writing {
        rewrite_iteration: u8,
    },
    Message {
        chunk: String,
    },
    Error {
        stage: String,
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        sub_question_id: Option<String>,
    },
    Trace {
        node: String,
        status: TraceStatus,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        duration_ms: Option<u64>,
    },
    Done(DonePayload),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ThreadId {} => "thread_id",
            EventKind::Planning { .. } => "planning",
            EventKind::ResearchProgress { .. } => "research_progress",
            EventKind::SourceFetch { .. } => "source_fetch",
            EventKind::Quality { .. } => "quality",
            EventKind::Writing { .. } => "writing",
            EventKind::Message { .. } => "message",
            EventKind::Error { .. } => "error",
            EventKind::Trace { .. } => "trace",
            EventKind::Done(_) => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            EventKind::Done(_) => true,
            EventKind::Error { stage, .. } => stage == "workflow",
            _ => false,
        }
    }
}

/// One event of one run
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvent {
    pub thread_id: String,
    pub kind: EventKind,
}

impl WorkflowEvent {
    pub fn new(thread_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            thread_id: thread_id.into(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Event data object, always carrying `thread_id`.
    pub fn data(&self) -> Value {
        let mut data = match serde_json::to_value(&self.kind) {
            Ok(Value::Object(mut tagged)) => tagged.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if !data.is_object() {
            data = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut data {
            map.insert("thread_id".to_string(), Value::String(self.thread_id.clone()));
        }
        data
    }

    /// Server-sent-events frame: `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    /// One JSON object per line: `{"event": ..., "data": ...}`
    pub fn to_json_line(&self) -> String {
        serde_json::json!({ "event": self.name(), "data": self.data() }).to_string()
    }
}

/// Sending half, cloned into every node of a run.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    thread_id: String,
    tx: mpsc::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// Create an emitter and the stream its events arrive on.
    pub fn channel(thread_id: impl Into<String>, buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                thread_id: thread_id.into(),
                tx,
            },
            EventStream { rx },
        )
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Send an event. A dropped consumer does not stop the run.
    pub async fn emit(&self, kind: EventKind) {
        let event = WorkflowEvent::new(self.thread_id.clone(), kind);
        if let Err(err) = self.tx.send(event).await {
            debug!(thread_id = %self.thread_id, event = err.0.name(), "Event receiver dropped");
        }
    }

    pub async fn error(&self, stage: &str, detail: impl Into<String>, sub_question_id: Option<&str>) {
        self.emit(EventKind::Error {
            stage: stage.to_string(),
            detail: detail.into(),
            sub_question_id: sub_question_id.map(str::to_string),
        })
        .await;
    }

    pub async fn trace(&self, node: &str, status: TraceStatus, duration_ms: Option<u64>) {
        self.emit(EventKind::Trace {
            node: node.to_string(),
            status,
            timestamp: Utc::now(),
            duration_ms,
        })
        .await;
    }
}

/// Receiving half of a run's events
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<WorkflowEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = WorkflowEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_sse_frame() {
        let event = WorkflowEvent::new("t1", EventKind::Writing { rewrite_iteration: 1 });
        assert_eq!(
            event.to_sse(),
            "event: writing\ndata: {\"rewrite_iteration\":1,\"thread_id\":\"t1\"}\n\n"
        );
    }

    #[test]
    fn test_thread_id_event_carries_id() {
        let event = WorkflowEvent::new("abc", EventKind::ThreadId {});
        assert_eq!(event.name(), "thread_id");
        assert_eq!(event.data()["thread_id"], "abc");
    }

    #[test]
    fn test_error_omits_missing_sub_question() {
        let event = WorkflowEvent::new(
            "t1",
            EventKind::Error {
                stage: "plan".to_string(),
                detail: "bad json".to_string(),
                sub_question_id: None,
            },
        );
        let data = event.data();
        assert_eq!(data["stage"], "plan");
        assert!(data.get("sub_question_id").is_none());
        assert!(!event.kind.is_terminal());
    }

    #[test]
    fn test_source_fetch_status_lowercase() {
        let event = WorkflowEvent::new(
            "t1",
            EventKind::SourceFetch {
                sub_question_id: "sq1".to_string(),
                source_name: "example.com".to_string(),
                title: "Example".to_string(),
                url: "https://example.com".to_string(),
                status: FetchStatus::Deduped,
            },
        );
        let line: Value = serde_json::from_str(&event.to_json_line()).unwrap();
        assert_eq!(line["event"], "source_fetch");
        assert_eq!(line["data"]["status"], "deduped");
    }

    #[test]
    fn test_terminal_events() {
        let fatal = EventKind::Error {
            stage: "workflow".to_string(),
            detail: "planning failed".to_string(),
            sub_question_id: None,
        };
        assert!(fatal.is_terminal());
        assert!(!EventKind::Message { chunk: "x".into() }.is_terminal());
    }

    #[tokio::test]
    async fn test_emitter_stream_order() {
        let (emitter, stream) = EventEmitter::channel("t1", 8);
        emitter.emit(EventKind::ThreadId {}).await;
        emitter.emit(EventKind::Message { chunk: "a".into() }).await;
        drop(emitter);

        let names: Vec<_> = stream.map(|e| e.name()).collect().await;
        assert_eq!(names, vec!["thread_id", "message"]);
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (emitter, stream) = EventEmitter::channel("t1", 1);
        drop(stream);
        // must not panic or block
        emitter.emit(EventKind::ThreadId {}).await;
    }
}
