//! JSON-backed test case source
//!
//! Cases live in a JSON array; a malformed record is reported against its
//! position and skipped, and loading fails outright only when the file
//! yields no usable cases at all.

use crate::error::{HarnessError, HarnessResult};
use crate::traits::TestCaseSource;
use shared::{process_info, process_warn, ProcessId, TestCase};
use std::path::PathBuf;

pub struct JsonCaseSource {
    path: PathBuf,
}

impl JsonCaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl TestCaseSource for JsonCaseSource {
    async fn load(&self) -> HarnessResult<Vec<TestCase>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let records: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let total = records.len();

        let mut cases = Vec::with_capacity(total);
        let mut malformed = 0usize;
        for (position, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<TestCase>(record) {
                Ok(case) => cases.push(case),
                Err(e) => {
                    malformed += 1;
                    process_warn!(
                        ProcessId::current(),
                        "⚠️ Skipping malformed case at position {}: {}",
                        position,
                        e
                    );
                }
            }
        }

        if cases.is_empty() {
            return Err(HarnessError::Config {
                field: format!(
                    "no usable test cases in {} ({malformed} of {total} records malformed)",
                    self.path.display()
                ),
            });
        }

        process_info!(
            ProcessId::current(),
            "📋 Loaded {} test cases from {} ({} skipped)",
            cases.len(),
            self.path.display(),
            malformed
        );
        Ok(cases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn loads_cases_in_file_order() {
        let file = write_temp(
            r#"[
                {"model_id": "vicuna-7b", "user_prompt": "first"},
                {"model_id": "vicuna-7b", "user_prompt": "second",
                 "system_prompt": "Be terse.", "expected_behavior": "short reply"}
            ]"#,
        );

        let cases = JsonCaseSource::new(file.path()).load().await.unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].user_prompt, "first");
        assert_eq!(cases[1].system_prompt.as_deref(), Some("Be terse."));
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_not_fatal() {
        let file = write_temp(
            r#"[
                {"model_id": "vicuna-7b", "user_prompt": "good"},
                {"model_id": "vicuna-7b"},
                {"model_id": "vicuna-7b", "user_prompt": "also good"}
            ]"#,
        );

        let cases = JsonCaseSource::new(file.path()).load().await.unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].user_prompt, "also good");
    }

    #[tokio::test]
    async fn all_malformed_is_a_load_error() {
        let file = write_temp(r#"[{"model_id": "vicuna-7b"}, {}]"#);
        let err = JsonCaseSource::new(file.path()).load().await.unwrap_err();
        assert_matches!(err, HarnessError::Config { .. });
    }

    #[tokio::test]
    async fn unparseable_file_is_a_load_error() {
        let file = write_temp("not json");
        let err = JsonCaseSource::new(file.path()).load().await.unwrap_err();
        assert_matches!(err, HarnessError::Json(_));
    }
}
