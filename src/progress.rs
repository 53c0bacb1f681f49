#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Snapshot written for external watchers of a long-running command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub progress: u8,
    pub message: String,
}

/// Replaces a small JSON file on every update. Write problems are logged and
/// otherwise ignored so progress reporting never fails a batch.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(&self, progress: u8, message: &str) {
        let report = ProgressReport {
            progress: progress.min(100),
            message: message.to_string(),
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("could not create progress dir {}: {err}", parent.display());
            return;
        }

        let payload = match serde_json::to_vec(&report) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not serialize progress report: {err}");
                return;
            }
        };
        let tmp_path = self.path.with_extension("tmp");
        if let Err(err) = fs::write(&tmp_path, payload) {
            warn!("could not write progress file {}: {err}", tmp_path.display());
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            warn!("could not finalize progress file {}: {err}", self.path.display());
        }
    }
}

pub fn update_progress(progress: Option<&ProgressWriter>, percent: u8, message: &str) {
    if let Some(writer) = progress {
        writer.write(percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_clamped_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs").join("progress.json");
        let writer = ProgressWriter::new(&path);

        writer.write(150, "almost");
        let report: ProgressReport =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            report,
            ProgressReport {
                progress: 100,
                message: "almost".into()
            }
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn update_without_writer_is_a_no_op() {
        update_progress(None, 10, "ignored");
    }
}
