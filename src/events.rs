//! Event plane: the outward JSON stream consumed by the UI.
//!
//! Every subsystem emits through an [`EventSink`]; a single dispatcher task
//! owns stdout and writes one JSON object per line. The sink keeps a bounded
//! buffer: when the serialized backlog exceeds [`BUFFER_BUDGET`], the oldest
//! non-alert events are dropped and counted. Alert-class events are never
//! dropped.

use crate::types::{now_rfc3339, Device, DnsQueryRecord, HttpFlow, Severity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Serialized backlog budget in bytes before old events are shed.
pub const BUFFER_BUDGET: usize = 64 * 1024;

/// Nested event kind inside a `flow_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowEventKind {
    Request,
    Response,
    Error,
    Blocked,
    Alert,
}

/// A keyword alert surfaced to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: Severity,
    pub category: String,
    pub keyword_id: String,
    pub matched_text: String,
    /// Surrounding text, at most ±50 characters.
    pub context: String,
    /// Where the match was found: "url" or "body".
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<Uuid>,
}

/// Closed set of event types on the outward stream. A `timestamp` field is
/// added by the dispatcher at serialization time; unknown detail fields ride
/// along in the flattened maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status {
        message: String,
        level: String,
        #[serde(flatten, default)]
        detail: Map<String, Value>,
    },
    Error {
        component: String,
        error: String,
    },
    Started {
        component: String,
        #[serde(flatten)]
        detail: Map<String, Value>,
    },
    Stopped {
        component: String,
        #[serde(flatten)]
        detail: Map<String, Value>,
    },
    Device {
        device: Device,
    },
    Dns {
        record: DnsQueryRecord,
    },
    Traffic {
        flow: HttpFlow,
    },
    Alert {
        alert: AlertPayload,
    },
    Blocked {
        reason: String,
        host: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        device_ip: String,
    },
    FlowEvent {
        event_type: FlowEventKind,
        flow_id: Uuid,
        data: Value,
    },
    ConfigUpdate {
        action: String,
        #[serde(flatten)]
        detail: Map<String, Value>,
    },
    SpoofError {
        ip: String,
        error: String,
    },
    TargetAdded {
        ip: String,
        mac: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    TargetRemoved {
        ip: String,
    },
}

impl Event {
    /// Events that must survive back-pressure.
    pub fn is_alert_class(&self) -> bool {
        matches!(
            self,
            Event::Alert { .. }
                | Event::FlowEvent {
                    event_type: FlowEventKind::Alert,
                    ..
                }
        )
    }

    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
            level: "info".to_string(),
            detail: Map::new(),
        }
    }

    pub fn status_with(message: impl Into<String>, detail: Map<String, Value>) -> Self {
        Event::Status {
            message: message.into(),
            level: "info".to_string(),
            detail,
        }
    }

    pub fn error(component: &str, error: impl ToString) -> Self {
        Event::Error {
            component: component.to_string(),
            error: error.to_string(),
        }
    }
}

struct SinkState {
    queue: VecDeque<(String, bool)>,
    bytes: usize,
}

/// Shared handle for emitting events.
#[derive(Clone)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                queue: VecDeque::new(),
                bytes: 0,
            })),
            notify: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serialize and enqueue one event, injecting the common timestamp field.
    pub fn emit(&self, event: Event) {
        let alert = event.is_alert_class();
        let line = match serde_json::to_value(&event) {
            Ok(Value::Object(mut obj)) => {
                obj.insert("timestamp".to_string(), Value::String(now_rfc3339()));
                Value::Object(obj).to_string()
            }
            Ok(other) => other.to_string(),
            Err(e) => {
                warn!("failed to serialize event: {}", e);
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        state.bytes += line.len();
        state.queue.push_back((line, alert));

        // Shed oldest non-alert lines until back under budget.
        while state.bytes > BUFFER_BUDGET {
            let victim = state.queue.iter().position(|(_, alert)| !*alert);
            match victim {
                Some(idx) => {
                    let (dropped_line, _) = state.queue.remove(idx).unwrap();
                    state.bytes -= dropped_line.len();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                // Only alert events left; they are never dropped.
                None => break,
            }
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Number of events shed under back-pressure so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain everything currently queued. Used by the dispatcher and tests.
    pub fn drain(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.bytes = 0;
        state.queue.drain(..).map(|(line, _)| line).collect()
    }

    pub(crate) fn notified(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the dispatcher: drain the sink to stdout until `shutdown` resolves.
pub async fn run_dispatcher(sink: EventSink, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let notify = sink.notified();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = notify.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        for line in sink.drain() {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                debug!("stdout closed; dispatcher exiting");
                return;
            }
            let _ = stdout.write_all(b"\n").await;
        }
        let _ = stdout.flush().await;
    }
    // Final drain on shutdown.
    for line in sink.drain() {
        let _ = stdout.write_all(line.as_bytes()).await;
        let _ = stdout.write_all(b"\n").await;
    }
    let _ = stdout.flush().await;
}
