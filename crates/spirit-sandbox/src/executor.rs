//! Runs guest code in a subordinate process with strict capability gates
//! and a line-framed JSON IPC bridge for tool calls.
//!
//! The runtime bridge itself — the glue script that defines
//! `__spirit_emit_output__`, `__spirit_call_tool__`, and
//! `__spirit_terminate__` for the guest — is an external asset pointed to
//! by `SandboxConfig::runtime_bridge_path`; this module only assembles the
//! script around it and manages the subprocess.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use spirit_core::config::SandboxConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::{timeout_at, Instant as TokioInstant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::ipc;
use crate::types::{ExecutionContext, ExecutionRequest, ExecutionResult, HostMessage, SubordinateMessage, ToolDispatcher};

const STDERR_TRUNCATE_CHARS: usize = 2000;
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_millis(200);

pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub async fn execute(
        &self,
        request: ExecutionRequest,
        dispatcher: &dyn ToolDispatcher,
    ) -> ExecutionResult {
        let start = Instant::now();

        if request.code.len() > self.config.max_code_size {
            let err = SandboxError::CodeTooLarge {
                len: request.code.len(),
                max: self.config.max_code_size,
            };
            return ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(err.to_string()),
                tool_calls_made: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        match self.run(request, dispatcher).await {
            Ok(mut result) => {
                result.duration_ms = start.elapsed().as_millis() as u64;
                result
            }
            Err(e) => ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                tool_calls_made: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            },
        }
    }

    async fn run(
        &self,
        request: ExecutionRequest,
        dispatcher: &dyn ToolDispatcher,
    ) -> Result<ExecutionResult> {
        let script = self.assemble_script(&request)?;
        let script_path = self.write_script(&script).await?;
        let cleanup = ScriptFileGuard(&script_path);

        let mut child = self
            .spawn(&script_path, request.execution_context.as_ref())
            .map_err(SandboxError::Spawn)?;

        let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let stderr_handle = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let deadline = TokioInstant::now() + Duration::from_millis(self.config.code_timeout_ms);

        let mut output = String::new();
        let mut tool_calls_made: u32 = 0;
        let mut first_parse_error: Option<String> = None;
        let mut timed_out = false;
        let mut overflow_error: Option<SandboxError> = None;

        loop {
            let line = match timeout_at(deadline, stdout.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(_)) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            };

            match ipc::parse_line(&line) {
                Ok(Some(SubordinateMessage::Output { data })) => {
                    output.push_str(&data);
                    output.push('\n');
                    if output.len() > self.config.max_output_size {
                        overflow_error = Some(SandboxError::OutputOverflow(output.len()));
                        break;
                    }
                }
                Ok(Some(SubordinateMessage::ToolCall {
                    call_id,
                    name,
                    params,
                })) => {
                    tool_calls_made += 1;
                    if tool_calls_made > self.config.max_tool_calls_per_exec {
                        overflow_error =
                            Some(SandboxError::ToolCallOverflow(self.config.max_tool_calls_per_exec));
                        break;
                    }
                    let result = dispatcher.dispatch(&name, params).await;
                    let msg = HostMessage::from_dispatch(call_id, result);
                    let encoded = ipc::encode_line(&msg);
                    if stdin.write_all(encoded.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(Some(SubordinateMessage::Debug(value))) => {
                    debug!(?value, "sandbox debug message");
                }
                Ok(None) => {}
                Err(e) => {
                    if first_parse_error.is_none() {
                        first_parse_error = Some(e);
                    }
                }
            }
        }

        // Shutdown: close stdin, give the process a short grace window to
        // exit on its own (the wrapped user code already calls the bridge's
        // terminate hook), then kill unconditionally.
        drop(stdin);
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_WAIT, child.wait()).await;
        let _ = child.kill().await;

        let stderr_text = stderr_handle.await.unwrap_or_default();
        drop(cleanup);

        if timed_out {
            let err = SandboxError::Timeout(self.config.code_timeout_ms);
            return Ok(ExecutionResult {
                success: false,
                output,
                error: Some(err.to_string()),
                tool_calls_made,
                duration_ms: 0,
            });
        }
        if let Some(err) = overflow_error {
            return Ok(ExecutionResult {
                success: false,
                output,
                error: Some(err.to_string()),
                tool_calls_made,
                duration_ms: 0,
            });
        }
        if output.is_empty() && !stderr_text.trim().is_empty() {
            let truncated: String = stderr_text.chars().take(STDERR_TRUNCATE_CHARS).collect();
            return Ok(ExecutionResult {
                success: false,
                output,
                error: Some(truncated),
                tool_calls_made,
                duration_ms: 0,
            });
        }
        if let Some(err) = first_parse_error {
            return Ok(ExecutionResult {
                success: false,
                output,
                error: Some(err),
                tool_calls_made,
                duration_ms: 0,
            });
        }

        Ok(ExecutionResult {
            success: true,
            output,
            error: None,
            tool_calls_made,
            duration_ms: 0,
        })
    }

    fn assemble_script(&self, request: &ExecutionRequest) -> Result<String> {
        let bridge_path = self
            .config
            .runtime_bridge_path
            .as_deref()
            .ok_or_else(|| {
                SandboxError::BridgeUnreadable {
                    path: "<unset>".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "sandbox.runtime_bridge_path is not configured",
                    ),
                }
            })?;
        let bridge = std::fs::read_to_string(bridge_path).map_err(|e| SandboxError::BridgeUnreadable {
            path: bridge_path.to_string(),
            source: e,
        })?;

        let mut constants = String::new();
        if let Some(ctx) = &request.execution_context {
            for (name, value) in &ctx.constants {
                let encoded = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
                constants.push_str(&format!("const {name} = {encoded};\n"));
            }
        }

        let wrapped = format!(
            "(async () => {{\n  try {{\n{code}\n  }} catch (err) {{\n    __spirit_emit_output__(\"Error: \" + err);\n  }} finally {{\n    __spirit_terminate__();\n  }}\n}})();\n",
            code = request.code,
        );

        Ok(format!(
            "{bridge}\n{constants}\n{stubs}\n{wrapped}",
            bridge = bridge,
            constants = constants,
            stubs = request.tool_stubs,
        ))
    }

    async fn write_script(&self, script: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.working_dir).await?;
        let filename = format!("spirit-exec-{}.js", Uuid::new_v4());
        let path = PathBuf::from(&self.config.working_dir).join(filename);
        tokio::fs::write(&path, script).await?;
        Ok(path)
    }

    fn spawn(
        &self,
        script_path: &std::path::Path,
        execution_context: Option<&ExecutionContext>,
    ) -> std::io::Result<tokio::process::Child> {
        let mut cmd = tokio::process::Command::new(&self.config.runtime_command);
        cmd.arg("run");

        let mut hosts = self.config.allowed_hosts.clone();
        if let Some(ctx) = execution_context {
            hosts.extend(ctx.extra_allowed_hosts.iter().cloned());
        }
        if !hosts.is_empty() {
            cmd.arg(format!("--allow-net={}", hosts.join(",")));
        }

        let mut read_paths = vec![self.config.working_dir.clone()];
        read_paths.extend(self.config.allowed_read_paths.iter().cloned());
        cmd.arg(format!("--allow-read={}", read_paths.join(",")));
        cmd.arg(format!("--allow-write={}", self.config.working_dir));

        if !self.config.allowed_run.is_empty() {
            cmd.arg(format!("--allow-run={}", self.config.allowed_run.join(",")));
        }

        cmd.arg(script_path);
        cmd.current_dir(&self.config.working_dir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.spawn()
    }
}

/// Removes the assembled temp script on every exit path, including early
/// returns during the IPC loop.
struct ScriptFileGuard<'a>(&'a PathBuf);

impl<'a> Drop for ScriptFileGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "failed to remove sandbox temp script");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct NullDispatcher;

    #[async_trait::async_trait]
    impl ToolDispatcher for NullDispatcher {
        async fn dispatch(&self, _name: &str, _params: serde_json::Value) -> crate::types::ToolResult {
            crate::types::ToolResult::success("unused")
        }
    }

    fn config_with(bridge_path: Option<String>, working_dir: &str) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.working_dir = working_dir.to_string();
        config.runtime_bridge_path = bridge_path;
        config
    }

    #[tokio::test]
    async fn oversized_code_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(None, dir.path().to_str().unwrap());
        config.max_code_size = 4;
        let executor = SandboxExecutor::new(config);

        let result = executor
            .execute(
                ExecutionRequest {
                    code: "12345".to_string(),
                    tool_stubs: String::new(),
                    execution_context: None,
                },
                &NullDispatcher,
            )
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("max_code_size"));
        assert_eq!(result.tool_calls_made, 0);
    }

    #[test]
    fn assemble_script_concatenates_bridge_constants_stubs_and_wrapped_code() {
        let mut bridge_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(bridge_file, "// bridge").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(
            Some(bridge_file.path().to_str().unwrap().to_string()),
            dir.path().to_str().unwrap(),
        );
        let executor = SandboxExecutor::new(config);

        let mut ctx = ExecutionContext::default();
        ctx.constants.insert("API_KEY".to_string(), serde_json::json!("secret"));

        let request = ExecutionRequest {
            code: "doSomething();".to_string(),
            tool_stubs: "function memory_read() {}".to_string(),
            execution_context: Some(ctx),
        };

        let script = executor.assemble_script(&request).unwrap();
        assert!(script.contains("// bridge"));
        assert!(script.contains("const API_KEY = \"secret\";"));
        assert!(script.contains("function memory_read"));
        assert!(script.contains("doSomething();"));
        assert!(script.contains("__spirit_terminate__"));
    }

    #[test]
    fn assemble_script_without_configured_bridge_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(None, dir.path().to_str().unwrap());
        let executor = SandboxExecutor::new(config);
        let request = ExecutionRequest {
            code: "1".to_string(),
            tool_stubs: String::new(),
            execution_context: None,
        };
        assert!(executor.assemble_script(&request).is_err());
    }
}
