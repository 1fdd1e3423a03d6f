//! Subprocess plumbing shared by the adapters

use crate::error::{ByoeError, ByoeResult};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Max number of output lines to include in error messages.
const ERROR_TAIL_LINES: usize = 50;

/// A program invocation that can run locally or be written into a job script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Render as a single POSIX shell command
    pub fn to_shell(&self) -> String {
        let mut parts = Vec::new();
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cd {} &&", shell_quote(&cwd.display().to_string())));
        }
        if !self.env.is_empty() {
            parts.push("env".to_string());
            for (k, v) in &self.env {
                parts.push(format!("{}={}", k, shell_quote(v)));
            }
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Extract the useful tail of tool output for error diagnostics.
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > ERROR_TAIL_LINES {
        lines[total - ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Output of a captured command
#[derive(Debug)]
pub(crate) struct Captured {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion, capturing its output.
///
/// Only spawn failures are errors; callers decide what a non-zero exit means.
pub(crate) async fn run_capture(cmd: &CommandLine) -> ByoeResult<Captured> {
    debug!("Executing: {}", cmd);

    let output = cmd
        .to_command()
        .output()
        .await
        .map_err(|e| ByoeError::command_failed(cmd.to_string(), e))?;

    Ok(Captured {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command, appending its output to `log`
pub(crate) async fn run_logged(cmd: &CommandLine, log: &Path) -> ByoeResult<()> {
    debug!("Executing: {} (log {})", cmd, log.display());

    if let Some(parent) = log.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ByoeError::io(format!("creating log directory {}", parent.display()), e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|e| ByoeError::io(format!("opening log {}", log.display()), e))?;
    writeln!(file, "$ {}", cmd.to_shell())
        .map_err(|e| ByoeError::io(format!("writing log {}", log.display()), e))?;
    let sink = LogSink::new(file, log);

    let mut child = cmd
        .to_command()
        .spawn()
        .map_err(|e| ByoeError::command_failed(cmd.to_string(), e))?;

    let lines = stream_child_output(&mut child, &|line: String| sink.line(&line)).await;

    let status = child
        .wait()
        .await
        .map_err(|e| ByoeError::command_failed(cmd.to_string(), e))?;

    if status.success() {
        Ok(())
    } else {
        Err(ByoeError::command_exec(
            cmd.to_string(),
            build_error_output("", &lines.join("\n")),
        ))
    }
}

/// Appends output lines to a log file, warning once if the file stops
/// accepting them
struct LogSink<'a> {
    file: Mutex<std::fs::File>,
    path: &'a Path,
    failed: AtomicBool,
}

impl<'a> LogSink<'a> {
    fn new(file: std::fs::File, path: &'a Path) -> Self {
        Self {
            file: Mutex::new(file),
            path,
            failed: AtomicBool::new(false),
        }
    }

    fn line(&self, line: &str) {
        let written = match self.file.lock() {
            Ok(mut f) => writeln!(f, "{}", line).map_err(|e| e.to_string()),
            Err(_) => Err("log handle poisoned".to_string()),
        };
        if let Err(e) = written {
            if !self.failed.swap(true, Ordering::Relaxed) {
                warn!("Output is no longer reaching {}: {}", self.path.display(), e);
            }
        }
    }

    #[cfg(test)]
    fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting.
async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let mut all_output = Vec::new();
    let (Some(stderr), Some(stdout)) = (child.stderr.take(), child.stdout.take()) else {
        return all_output;
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}
