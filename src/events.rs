use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::models::JobReport;

/// Interval between keepalive frames on a live stream. Idle-connection
/// timeouts at proxies commonly sit at 30-60s; staying under that keeps
/// multi-minute imports from appearing dead.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(25);

/// One outbound frame on a job's progress stream.
///
/// `Started` is always the first frame of a stream and one of
/// `Done`/`Completed`/`Error` always the last; heartbeats interleave
/// freely in between.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Started {
        job_id: String,
    },
    Heartbeat {
        at: String,
    },
    Progress {
        phase: String,
        items_done: Option<i64>,
        items_total: Option<i64>,
        detail: Option<String>,
    },
    Token {
        text: String,
    },
    ToolCall {
        name: String,
        args: Value,
    },
    ToolResult {
        name: String,
        output: Value,
    },
    NeedsResume {
        phase: String,
        resume_from_phase: usize,
    },
    Completed {
        job_id: String,
        report: Option<JobReport>,
    },
    Error {
        message: String,
    },
    Done,
}

impl StreamFrame {
    pub fn heartbeat_now() -> Self {
        Self::Heartbeat {
            at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// The SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Progress { .. } => "progress",
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::NeedsResume { .. } => "needs_resume",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// The SSE `data:` payload.
    pub fn data(&self) -> Value {
        match self {
            Self::Started { job_id } => json!({ "job_id": job_id }),
            Self::Heartbeat { at } => json!({ "at": at }),
            Self::Progress {
                phase,
                items_done,
                items_total,
                detail,
            } => {
                let mut payload = json!({ "phase": phase });
                if let Some(done) = items_done {
                    payload["items_done"] = json!(done);
                }
                if let Some(total) = items_total {
                    payload["items_total"] = json!(total);
                }
                if let Some(detail) = detail {
                    payload["detail"] = json!(detail);
                }
                payload
            }
            Self::Token { text } => json!({ "text": text }),
            Self::ToolCall { name, args } => json!({ "name": name, "args": args }),
            Self::ToolResult { name, output } => json!({ "name": name, "output": output }),
            Self::NeedsResume {
                phase,
                resume_from_phase,
            } => json!({ "phase": phase, "resume_from_phase": resume_from_phase }),
            Self::Completed { job_id, report } => json!({ "job_id": job_id, "report": report }),
            Self::Error { message } => json!({ "message": message }),
            Self::Done => json!({}),
        }
    }

    /// Whether this frame closes the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Sender half of a job's progress stream.
///
/// The stream is an observability channel, not a control channel: sends
/// after the receiving side has gone away are silently dropped and the
/// producing job keeps executing. A `detached` sender (background
/// re-dispatch, reconciler sweeps) drops every frame.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<StreamFrame>>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender with no stream attached.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, frame: StreamFrame) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the client disconnected; keep going.
            let _ = tx.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_names_match_wire_vocabulary() {
        let frames = vec![
            (
                StreamFrame::Started {
                    job_id: "j1".into(),
                },
                "started",
            ),
            (StreamFrame::heartbeat_now(), "heartbeat"),
            (
                StreamFrame::Progress {
                    phase: "importing_cards".into(),
                    items_done: Some(3),
                    items_total: Some(10),
                    detail: None,
                },
                "progress",
            ),
            (StreamFrame::Token { text: "…".into() }, "token"),
            (
                StreamFrame::ToolCall {
                    name: "fetch".into(),
                    args: json!({}),
                },
                "tool_call",
            ),
            (
                StreamFrame::ToolResult {
                    name: "fetch".into(),
                    output: json!(null),
                },
                "tool_result",
            ),
            (
                StreamFrame::NeedsResume {
                    phase: "importing_cards".into(),
                    resume_from_phase: 2,
                },
                "needs_resume",
            ),
            (
                StreamFrame::Completed {
                    job_id: "j1".into(),
                    report: None,
                },
                "completed",
            ),
            (
                StreamFrame::Error {
                    message: "boom".into(),
                },
                "error",
            ),
            (StreamFrame::Done, "done"),
        ];
        for (frame, name) in frames {
            assert_eq!(frame.name(), name);
        }
    }

    #[test]
    fn test_heartbeat_carries_only_timestamp() {
        let frame = StreamFrame::heartbeat_now();
        let data = frame.data();
        assert!(data["at"].is_string());
        assert_eq!(data.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_progress_payload_omits_missing_counts() {
        let frame = StreamFrame::Progress {
            phase: "research".into(),
            items_done: None,
            items_total: None,
            detail: Some("querying".into()),
        };
        let data = frame.data();
        assert_eq!(data["phase"], "research");
        assert_eq!(data["detail"], "querying");
        assert!(data.get("items_done").is_none());
    }

    #[test]
    fn test_only_done_is_final() {
        assert!(StreamFrame::Done.is_final());
        assert!(
            !StreamFrame::Completed {
                job_id: "j".into(),
                report: None
            }
            .is_final()
        );
        assert!(
            !StreamFrame::Error {
                message: "x".into()
            }
            .is_final()
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_swallowed() {
        let (tx, rx) = EventSender::channel();
        drop(rx);
        tx.send(StreamFrame::Done);
    }

    #[tokio::test]
    async fn test_detached_sender_drops_frames() {
        let tx = EventSender::detached();
        tx.send(StreamFrame::heartbeat_now());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (tx, mut rx) = EventSender::channel();
        tx.send(StreamFrame::Started {
            job_id: "j1".into(),
        });
        tx.send(StreamFrame::Done);
        assert_eq!(rx.recv().await.unwrap().name(), "started");
        assert!(rx.recv().await.unwrap().is_final());
    }
}
