//! Run Manifest Writer
//!
//! Dated per-session directory with a `manifest.json` referencing CAS
//! artifact digests. One file per session, written once at session end.
//! Mirrors the original system's `runs.py::write_run_manifest`.

use crate::clock::SortableId;
use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error writing manifest at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// References to CAS-stored artifacts by digest.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Artifacts {
    pub transcripts_json_sha256: Option<String>,
    pub trace_json_sha256: Option<String>,
    pub config_json_sha256: Option<String>,
}

/// Dev-context marker — mode and presence only, content never included.
#[derive(Debug, Clone, Serialize)]
pub struct DevContextMarker {
    pub attached: bool,
    pub mode: String,
}

/// The manifest written per session under `<runs>/YYYY-MM-DD/<session_id>/manifest.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub session_id: SortableId,
    pub started_at_unix_ms: i64,
    pub ended_at_unix_ms: i64,
    pub mode: String,
    pub failed: bool,
    pub llm: Map<String, Value>,
    pub dev_context: DevContextMarker,
    pub artifacts: Artifacts,
}

/// Writer rooted at a `<runs>` directory, stamping sessions under today's date.
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    runs_dir: PathBuf,
}

impl ManifestWriter {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self { runs_dir: runs_dir.into() }
    }

    fn session_dir(&self, session_id: &SortableId) -> PathBuf {
        let date = Local::now().date_naive().format("%Y-%m-%d").to_string();
        self.runs_dir.join(date).join(session_id.to_string())
    }

    pub fn trace_path(&self, session_id: &SortableId) -> PathBuf {
        self.session_dir(session_id).join("trace.json")
    }

    /// Serializes and writes `manifest.json`, returning its path.
    pub async fn write(&self, manifest: &RunManifest) -> Result<PathBuf, ManifestError> {
        let dir = self.session_dir(&manifest.session_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| ManifestError::Io { path: dir.clone(), source })?;

        let path = dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(manifest).expect("manifest always serializes");
        fs::write(&path, bytes)
            .await
            .map_err(|source| ManifestError::Io { path: path.clone(), source })?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::new_id;

    #[tokio::test]
    async fn writes_manifest_under_dated_session_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ManifestWriter::new(dir.path());
        let session_id = new_id();

        let manifest = RunManifest {
            schema_version: "1.0".to_string(),
            session_id,
            started_at_unix_ms: 1000,
            ended_at_unix_ms: 2000,
            mode: "sim".to_string(),
            failed: false,
            llm: Map::new(),
            dev_context: DevContextMarker { attached: false, mode: "once".to_string() },
            artifacts: Artifacts::default(),
        };

        let path = writer.write(&manifest).await.unwrap();
        assert!(path.ends_with("manifest.json"));
        assert!(path.to_string_lossy().contains(&session_id.to_string()));

        let bytes = tokio::fs::read(&path).await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["mode"], "sim");
        assert_eq!(parsed["session_id"], session_id.to_string());
    }
}
