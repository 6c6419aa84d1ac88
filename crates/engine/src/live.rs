//! Live output for a subscriber watching a job run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event pushed to a live subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LiveEvent {
    /// One line of pipeline output, newline included
    Output { text: String },
    /// Pipeline exited
    #[serde(rename_all = "camelCase")]
    Done {
        job_id: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Pipeline could not be started
    Error { message: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DonePayload<'a> {
    job_id: &'a str,
    code: i32,
    stdout: &'a str,
    stderr: &'a str,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    message: &'a str,
}

impl LiveEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LiveEvent::Output { .. })
    }

    /// Server-sent-event framing of this event
    pub fn to_sse(&self) -> String {
        match self {
            LiveEvent::Output { text } => {
                let body = text.strip_suffix('\n').unwrap_or(text);
                let data: String = body
                    .split('\n')
                    .map(|line| format!("data: {}\n", line))
                    .collect();
                format!("{}\n", data)
            }
            LiveEvent::Done { job_id, code, stdout, stderr } => {
                let payload = DonePayload { job_id, code: *code, stdout, stderr };
                format!("event: done\ndata: {}\n\n", to_json(&payload))
            }
            LiveEvent::Error { message } => {
                format!("event: error\ndata: {}\n\n", to_json(&ErrorPayload { message }))
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    // plain structs of strings and integers always serialize
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Sending half handed to the controller
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::UnboundedSender<LiveEvent>,
}

impl LiveSender {
    /// Deliver an event; a gone subscriber is ignored and the job keeps running
    pub fn send(&self, event: LiveEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Create a subscriber channel
pub fn channel() -> (LiveSender, mpsc::UnboundedReceiver<LiveEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LiveSender { tx }, rx)
}
