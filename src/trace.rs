//! Trace Recorder
//!
//! Span begin/end/counter timeline, exportable as a flat list of Chrome
//! Trace / Perfetto-compatible event objects. Thread ids are assigned to
//! components in first-use order, starting at 1, matching the original
//! system's `trace.py::TraceRecorder`.

use crate::clock::now_us;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io error exporting trace to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One phase of the trace event format: Begin, End, or Counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
    Counter,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Begin => "B",
            Phase::End => "E",
            Phase::Counter => "C",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub ph: String,
    pub ts: i64,
    pub pid: u32,
    pub tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<i64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

struct State {
    events: Vec<TraceEvent>,
    tid_map: HashMap<String, u32>,
    next_tid: u32,
    /// Tracks the last open (component, name) phase to catch B/E misuse.
    open_spans: HashMap<(String, String), ()>,
}

/// Records a flat timeline of spans and counters across components.
pub struct TraceRecorder {
    pid: u32,
    state: Mutex<State>,
}

impl TraceRecorder {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            state: Mutex::new(State {
                events: Vec::new(),
                tid_map: HashMap::new(),
                next_tid: 1,
                open_spans: HashMap::new(),
            }),
        }
    }

    fn tid_for(state: &mut State, component: &str) -> u32 {
        if let Some(&tid) = state.tid_map.get(component) {
            return tid;
        }
        let tid = state.next_tid;
        state.tid_map.insert(component.to_string(), tid);
        state.next_tid += 1;
        tid
    }

    pub fn span_begin(&self, component: &str, name: &str, args: Map<String, Value>) {
        let mut state = self.state.lock();
        let tid = Self::tid_for(&mut state, component);
        let key = (component.to_string(), name.to_string());
        debug_assert!(
            !state.open_spans.contains_key(&key),
            "span_begin for {component}/{name} while already open"
        );
        state.open_spans.insert(key, ());
        state.events.push(TraceEvent {
            name: name.to_string(),
            ph: Phase::Begin.as_str().to_string(),
            ts: now_us(),
            pid: self.pid,
            tid,
            dur: None,
            args,
        });
    }

    pub fn span_end(&self, component: &str, name: &str, args: Map<String, Value>) {
        let mut state = self.state.lock();
        let tid = Self::tid_for(&mut state, component);
        let key = (component.to_string(), name.to_string());
        state.open_spans.remove(&key);
        state.events.push(TraceEvent {
            name: name.to_string(),
            ph: Phase::End.as_str().to_string(),
            ts: now_us(),
            pid: self.pid,
            tid,
            dur: None,
            args,
        });
    }

    pub fn counter(&self, component: &str, name: &str, value: f64, mut args: Map<String, Value>) {
        let mut state = self.state.lock();
        let tid = Self::tid_for(&mut state, component);
        args.insert("value".to_string(), Value::from(value));
        state.events.push(TraceEvent {
            name: name.to_string(),
            ph: Phase::Counter.as_str().to_string(),
            ts: now_us(),
            pid: self.pid,
            tid,
            dur: None,
            args,
        });
    }

    /// Returns a snapshot of the recorded events as a JSON array.
    pub fn to_json_value(&self) -> Value {
        let state = self.state.lock();
        serde_json::to_value(&state.events).expect("trace events always serialize")
    }

    pub async fn export(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| TraceError::Io { path: parent.to_path_buf(), source })?;
        }
        let json = self.to_json_value();
        let bytes = serde_json::to_vec(&json).expect("trace json always serializes");
        fs::write(path, bytes)
            .await
            .map_err(|source| TraceError::Io { path: path.to_path_buf(), source })
    }
}
