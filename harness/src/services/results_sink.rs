//! JSON results sink
//!
//! Writes the run metadata and the ordered result sequence as one
//! pretty-printed document. Each result carries its case index, so the
//! case/result correspondence survives the round trip.

use crate::error::HarnessResult;
use crate::traits::ResultsSink;
use serde_json::json;
use shared::{process_info, ProcessId, RunMetadata, TestResult, TestStatus};
use std::path::PathBuf;

pub struct JsonResultsSink {
    path: PathBuf,
}

impl JsonResultsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl ResultsSink for JsonResultsSink {
    async fn write(&self, metadata: &RunMetadata, results: &[TestResult]) -> HarnessResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let succeeded = results
            .iter()
            .filter(|r| r.status == TestStatus::Success)
            .count();
        let document = json!({
            "metadata": metadata,
            "summary": {
                "total": results.len(),
                "succeeded": succeeded,
                "failed": results.iter().filter(|r| r.status == TestStatus::Failed).count(),
                "errored": results.iter().filter(|r| r.status == TestStatus::Error).count(),
            },
            "results": results,
        });

        let rendered = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(&self.path, rendered).await?;

        process_info!(
            ProcessId::current(),
            "💾 Wrote {} results to {} ({} succeeded)",
            results.len(),
            self.path.display(),
            succeeded
        );
        Ok(())
    }
}
