use corral_core::{CorralError, ExecutionKind, ExecutionResult, Result, Sandbox};
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP client for the tool server running inside a sandbox.
///
/// Requests go to the sandbox's `base_url` and carry its runtime token as a
/// bearer credential.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl SandboxClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    #[instrument(skip(self, sandbox, source), fields(id = sandbox.id()))]
    pub async fn execute(
        &self,
        sandbox: &Sandbox,
        kind: ExecutionKind,
        source: &str,
        split_output: bool,
    ) -> Result<ExecutionResult> {
        let url = tool_url(sandbox, kind)?;
        let body = serde_json::json!({
            (kind.source_field()): source,
            "split_output": split_output,
        });

        let mut request = self.http.post(&url).timeout(self.timeout).json(&body);
        if let Some(token) = sandbox.runtime_token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        debug!("Running {} in sandbox {} via {}", kind, sandbox.id(), url);
        let res = request
            .send()
            .await
            .map_err(|e| execution_error(sandbox, e))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CorralError::Execution {
                id: sandbox.id().to_string(),
                reason: format!("tool server answered {}: {}", status, text.trim()),
            });
        }

        res.json::<ExecutionResult>()
            .await
            .map_err(|e| execution_error(sandbox, e))
    }
}

fn tool_url(sandbox: &Sandbox, kind: ExecutionKind) -> Result<String> {
    let base = sandbox
        .base_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| CorralError::Execution {
            id: sandbox.id().to_string(),
            reason: "no base url recorded for the tool server".to_string(),
        })?;
    Ok(format!("{}{}", base.trim_end_matches('/'), kind.tool_path()))
}

fn execution_error(sandbox: &Sandbox, err: reqwest::Error) -> CorralError {
    let reason = if err.is_timeout() {
        "timed out waiting for the tool server".to_string()
    } else if err.is_connect() {
        format!("cannot reach the tool server: {}", err)
    } else {
        err.to_string()
    };
    CorralError::Execution {
        id: sandbox.id().to_string(),
        reason,
    }
}
