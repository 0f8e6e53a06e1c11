use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_web::{web, HttpResponse};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::errors::ApiError;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
    #[error("Execution id {0} is already running")]
    DuplicateId(String),
    #[error("Execution timed out after {0} seconds")]
    TimedOut(u64),
    #[error("Failed to run code: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Shell,
    C,
    Cpp,
}

impl Language {
    pub fn parse(name: &str) -> Result<Self, ExecutionError> {
        match name.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "python" | "py" | "python3" => Ok(Language::Python),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            other => Err(ExecutionError::UnsupportedLanguage(other.to_string())),
        }
    }

    fn default_filename(self) -> &'static str {
        match self {
            Language::Javascript => "main.js",
            Language::Python => "main.py",
            Language::Shell => "main.sh",
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
        }
    }

    /// Compiler invocation for compiled languages, producing `out`.
    fn compile_command(self, source: &Path, out: &Path) -> Option<Command> {
        let compiler = match self {
            Language::C => "gcc",
            Language::Cpp => "g++",
            _ => return None,
        };
        let mut cmd = Command::new(compiler);
        cmd.arg(source).arg("-o").arg(out);
        Some(cmd)
    }

    fn run_command(self, source: &Path, binary: &Path) -> Command {
        let (program, arg) = match self {
            Language::Javascript => ("node", Some(source)),
            Language::Python => ("python3", Some(source)),
            Language::Shell => ("sh", Some(source)),
            Language::C | Language::Cpp => return Command::new(binary),
        };
        let mut cmd = Command::new(program);
        if let Some(arg) = arg {
            cmd.arg(arg);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    CompileError,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub execution_id: String,
    pub language: Language,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "executionId")]
    pub execution_id: Option<String>,
}

/// Only a bare file name is accepted; the file always lands in the run's
/// scratch directory.
pub fn sanitize_filename(name: Option<&str>, language: Language) -> Result<String, ExecutionError> {
    let name = match name.map(str::trim) {
        None | Some("") => return Ok(language.default_filename().to_string()),
        Some(n) => n,
    };
    let valid = name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(name.to_string())
    } else {
        Err(ExecutionError::InvalidFilename(name.to_string()))
    }
}

fn truncate_output(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated]", &text[..cut])
}

/// Reads at most `max + 1` bytes, so the caller can tell the stream was cut,
/// and discards the rest without buffering it.
async fn read_capped<R>(reader: Option<R>, max: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    (&mut reader).take(max as u64 + 1).read_to_end(&mut kept).await?;
    if kept.len() > max {
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok(kept)
}

/// Source and compiler output paths inside a run's scratch directory. The
/// source sits in its own subdirectory so no file name can land on the
/// binary.
fn scratch_paths(workdir: &Path, filename: &str) -> (PathBuf, PathBuf) {
    (workdir.join("src").join(filename), workdir.join("program"))
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

enum Finished {
    Output(Captured),
    Stopped,
}

/// Runs snippets in throwaway directories. Runs are not queued; each one is
/// bounded only by the timeout and can be stopped by id.
#[derive(Clone)]
pub struct CodeRunner {
    timeout: Duration,
    max_output_bytes: usize,
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl CodeRunner {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register(&self, id: &str) -> Result<oneshot::Receiver<()>, ExecutionError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.contains_key(id) {
            return Err(ExecutionError::DuplicateId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        running.insert(id.to_string(), tx);
        Ok(rx)
    }

    fn unregister(&self, id: &str) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Signals a running execution to stop. Returns false for unknown ids.
    pub fn stop(&self, id: &str) -> bool {
        let sender = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self, id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub async fn run(&self, req: ExecuteRequest) -> Result<ExecutionOutput, ExecutionError> {
        let language = Language::parse(&req.language)?;
        let filename = sanitize_filename(req.filename.as_deref(), language)?;
        let id = req
            .execution_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut stop_rx = self.register(&id)?;
        let result = self
            .run_registered(&id, language, &filename, &req.code, &mut stop_rx)
            .await;
        self.unregister(&id);
        result
    }

    async fn run_registered(
        &self,
        id: &str,
        language: Language,
        filename: &str,
        code: &str,
        stop_rx: &mut oneshot::Receiver<()>,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let started = Instant::now();
        let workdir = tempfile::tempdir()?;
        let (source, binary) = scratch_paths(workdir.path(), filename);
        tokio::fs::create_dir(workdir.path().join("src")).await?;
        tokio::fs::write(&source, code).await?;
        debug!("Execution {} ({:?}) in {}", id, language, workdir.path().display());

        if let Some(cmd) = language.compile_command(&source, &binary) {
            match self.supervise(cmd, workdir.path(), stop_rx).await? {
                Finished::Stopped => return Ok(self.stopped(id, language, started)),
                Finished::Output(out) if !out.status.success() => {
                    return Ok(self.output(id, language, out, ExecutionStatus::CompileError, started));
                }
                Finished::Output(_) => {}
            }
        }

        let cmd = language.run_command(&source, &binary);
        let output = match self.supervise(cmd, workdir.path(), stop_rx).await? {
            Finished::Stopped => self.stopped(id, language, started),
            Finished::Output(out) => self.output(id, language, out, ExecutionStatus::Completed, started),
        };
        info!(
            "Execution {} finished with {:?} in {}ms",
            id, output.exit_code, output.duration_ms
        );
        Ok(output)
    }

    /// Waits for the child under the timeout while listening for a stop
    /// signal. Dropping the wait future kills the child (`kill_on_drop`).
    /// Each stream keeps at most `max_output_bytes` in memory.
    async fn supervise(
        &self,
        mut cmd: Command,
        workdir: &Path,
        stop_rx: &mut oneshot::Receiver<()>,
    ) -> Result<Finished, ExecutionError> {
        let mut child = cmd
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = self.max_output_bytes;
        let captured = async move {
            let (stdout, stderr) =
                tokio::try_join!(read_capped(stdout, max), read_capped(stderr, max))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>(Captured { status, stdout, stderr })
        };

        tokio::select! {
            waited = timeout(self.timeout, captured) => match waited {
                Ok(out) => Ok(Finished::Output(out?)),
                Err(_) => {
                    warn!("Execution timed out after {:?}", self.timeout);
                    Err(ExecutionError::TimedOut(self.timeout.as_secs()))
                }
            },
            _ = stop_rx => Ok(Finished::Stopped),
        }
    }

    fn output(
        &self,
        id: &str,
        language: Language,
        out: Captured,
        status: ExecutionStatus,
        started: Instant,
    ) -> ExecutionOutput {
        ExecutionOutput {
            execution_id: id.to_string(),
            language,
            stdout: truncate_output(&out.stdout, self.max_output_bytes),
            stderr: truncate_output(&out.stderr, self.max_output_bytes),
            exit_code: out.status.code(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn stopped(&self, id: &str, language: Language, started: Instant) -> ExecutionOutput {
        info!("Execution {} stopped on request", id);
        ExecutionOutput {
            execution_id: id.to_string(),
            language,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            status: ExecutionStatus::Stopped,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

// ─── ENDPOINTS ─────────────────────────────────────────────────────────────────

/// POST /execute
pub async fn execute_code(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    req: web::Json<ExecuteRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    if req.language.trim().is_empty() {
        return Err(ApiError::field("language", "Language is required"));
    }
    debug!("User {} executing {} code", user.id, req.language);
    let output = data.runner.run(req).await?;
    Ok(HttpResponse::Ok().json(output))
}

/// POST /execute/{execution_id}/stop
pub async fn stop_execution(
    _user: AuthenticatedUser,
    data: web::Data<AppState>,
    execution_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    if data.runner.stop(&execution_id) {
        Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "stopping" })))
    } else {
        Err(ApiError::NotFound("No running execution with that id".to_string()))
    }
}
