use crate::error::PipelineError;
use crate::family::FamilyFailure;
use crate::tools::Tool;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How much captured stderr to keep in failure messages.
const STDERR_TAIL: usize = 2000;

/// stderr signatures treated as transient (retried once per family).
const TRANSIENT_PATTERNS: [&str; 4] = [
    "Cannot allocate memory",
    "Resource temporarily unavailable",
    "Too many open files",
    "Disk quota exceeded",
];

/// One external tool invocation, fully described before spawning. Arguments
/// are forwarded as-is; stdout/stderr can be captured to files for tools
/// that write results to stdout.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout_to: Option<PathBuf>,
    pub stderr_to: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, tool: Tool, args: Vec<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            args,
            stdout_to: None,
            stderr_to: None,
        }
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_to = Some(path.into());
        self
    }
}

/// Failed invocation with its retry classification.
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub tool: String,
    pub message: String,
    pub transient: bool,
}

impl InvocationFailure {
    pub fn for_unit(self, unit: &str) -> FamilyFailure {
        FamilyFailure {
            unit: unit.to_string(),
            tool: self.tool,
            message: self.message,
            transient: self.transient,
        }
    }

    pub fn into_error(self) -> PipelineError {
        PipelineError::External {
            tool: self.tool,
            message: self.message,
        }
    }
}

/// Run one external tool to completion. Honors the configured timeout and
/// the shared cancellation token; a timed-out or signal-killed child is
/// classified transient, recognized resource-contention stderr likewise.
pub async fn run_tool(
    inv: &ToolInvocation,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> std::result::Result<(), InvocationFailure> {
    let fail = |message: String, transient: bool| InvocationFailure {
        tool: inv.tool.name().to_string(),
        message,
        transient,
    };

    debug!(
        "invoking {}: {} {}",
        inv.tool,
        inv.program.display(),
        inv.args.join(" ")
    );

    let mut cmd = tokio::process::Command::new(&inv.program);
    cmd.args(&inv.args);
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::piped());
    match &inv.stdout_to {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| fail(format!("cannot create {}: {e}", path.display()), false))?;
            cmd.stdout(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::null());
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| fail(format!("failed to spawn {}: {e}", inv.program.display()), false))?;

    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(fail("cancelled before completion".to_string(), false));
        }
        res = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait())
                    .await
                    .map_err(|_| limit),
                None => Ok(child.wait().await),
            }
        } => match res {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(fail(format!("wait failed: {e}"), false)),
            Err(limit) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(fail(
                    format!("timed out after {}s", limit.as_secs()),
                    true,
                ));
            }
        }
    };

    let stderr_bytes = stderr_task.await.unwrap_or_default();
    if let Some(path) = &inv.stderr_to {
        let _ = std::fs::write(path, &stderr_bytes);
    }

    if status.success() {
        return Ok(());
    }

    let stderr_text = String::from_utf8_lossy(&stderr_bytes);
    let tail: String = stderr_text
        .chars()
        .rev()
        .take(STDERR_TAIL)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    // No exit code means the child was killed by a signal; 137/143 are the
    // conventional SIGKILL/SIGTERM codes.
    let transient = status.code().map_or(true, |c| c == 137 || c == 143)
        || TRANSIENT_PATTERNS.iter().any(|p| stderr_text.contains(p));

    Err(fail(
        format!("{status}: {}", tail.trim()),
        transient,
    ))
}

/// Per-unit invocation with the one-retry-on-transient policy: a transient
/// failure is retried once, then the unit is marked failed.
pub async fn run_for_unit(
    inv: &ToolInvocation,
    unit: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> std::result::Result<(), FamilyFailure> {
    match run_tool(inv, timeout, cancel).await {
        Ok(()) => Ok(()),
        Err(failure) if failure.transient && !cancel.is_cancelled() => {
            warn!(
                "{}: transient {} failure ({}), retrying once",
                unit, failure.tool, failure.message
            );
            run_tool(inv, timeout, cancel)
                .await
                .map_err(|f| f.for_unit(unit))
        }
        Err(failure) => Err(failure.for_unit(unit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new(
            "sh",
            Tool::Mafft,
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let cancel = CancellationToken::new();
        run_tool(&sh("exit 0"), None, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_fatal() {
        let cancel = CancellationToken::new();
        let err = run_tool(&sh("echo bad input >&2; exit 2"), None, &cancel)
            .await
            .unwrap_err();
        assert!(!err.transient);
        assert!(err.message.contains("bad input"));
    }

    #[tokio::test]
    async fn test_resource_contention_stderr_is_transient() {
        let cancel = CancellationToken::new();
        let err = run_tool(
            &sh("echo 'Cannot allocate memory' >&2; exit 1"),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn test_sigkill_exit_code_is_transient() {
        let cancel = CancellationToken::new();
        let err = run_tool(&sh("exit 137"), None, &cancel).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let cancel = CancellationToken::new();
        let err = run_tool(
            &sh("sleep 5"),
            Some(Duration::from_millis(100)),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.transient);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_invocation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_tool(&sh("sleep 5"), None, &cancel).await.unwrap_err();
        assert!(err.message.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_stdout_capture() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let cancel = CancellationToken::new();
        run_tool(
            &sh("echo captured").stdout_to(&out),
            None,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "captured");
    }

    #[tokio::test]
    async fn test_retry_then_permanent_failure() {
        let cancel = CancellationToken::new();
        let err = run_for_unit(
            &sh("echo 'Resource temporarily unavailable' >&2; exit 1"),
            "FAM000001",
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.unit, "FAM000001");
        assert!(err.transient);
    }
}
