use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use svcdir_core::Job;
use tokio::process::Command;
use tracing::debug;

use crate::{candidates_from_json, mentions_rate_limit, ExtractError, Extraction, Extractor};

/// Runs an external scraper executable and reads candidates as JSON from stdout.
///
/// The child is killed if the extraction future is dropped, so a job timeout
/// abandons the process instead of leaving it running.
#[derive(Debug, Clone, Default)]
pub struct CommandExtractor;

impl CommandExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn default_confidence(&self) -> Option<f64> {
        Some(0.8)
    }

    async fn extract(&self, job: &Job) -> Result<Extraction, ExtractError> {
        let mut argv = job.target.split_whitespace();
        let Some(program) = argv.next() else {
            return Err(ExtractError::Config(format!("job {} has an empty command", job.name)));
        };

        let output = Command::new(program)
            .args(argv)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ExtractError::Command(format!("spawning {program}: {err}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let message = stderr.trim();
            if mentions_rate_limit(message) {
                return Err(ExtractError::RateLimited(message.to_string()));
            }
            return Err(ExtractError::Command(format!(
                "{program} exited with {}: {message}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let payload: JsonValue = if stdout.trim().is_empty() {
            JsonValue::Array(Vec::new())
        } else {
            serde_json::from_str(stdout.trim())
                .map_err(|err| ExtractError::Parse(format!("{program} stdout: {err}")))?
        };

        let mut candidates = candidates_from_json(&payload, &job.target);
        for candidate in &mut candidates {
            candidate
                .metadata
                .insert("extraction_method".into(), json!("command"));
            if candidate.category.is_none() {
                candidate.category = job.category.clone();
            }
        }
        debug!(job = %job.name, candidates = candidates.len(), "command extractor finished");
        Ok(Extraction::of(candidates))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_json_from_stdout() {
        let job = Job::new(
            "echo",
            "command",
            r#"echo [{"name":"Echo Service","address":"1 Echo St Mount Isa"}]"#,
        );
        let out = CommandExtractor::new().extract(&job).await.expect("extract");
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].name.as_deref(), Some("Echo Service"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error() {
        let job = Job::new("fails", "command", "false");
        let err = CommandExtractor::new().extract(&job).await.unwrap_err();
        assert!(matches!(err, ExtractError::Command(_)));
    }

    #[tokio::test]
    async fn empty_target_is_permanent() {
        let job = Job::new("empty", "command", "   ");
        let err = CommandExtractor::new().extract(&job).await.unwrap_err();
        assert!(matches!(err, ExtractError::Config(_)));
    }
}
