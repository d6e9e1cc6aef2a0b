//! Interpreter-process executor.
//!
//! Runs each snippet by spawning the configured interpreter with the code on
//! stdin and waiting for it to exit. The forwarder calls this on the host
//! thread, so a long-running snippet holds up the tick that dispatched it;
//! the execution timeout bounds how long.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use super::{CodeExecutor, ExecutionResult};

/// Default limit on a single execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a running child is polled for exit.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Executor that pipes code into an interpreter process (`python3 -`, `sh`, ...).
#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl InterpreterExecutor {
    /// Create an executor for `program`, invoked with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Parse a command line such as `"python3 -"` into program and arguments.
    ///
    /// Returns `None` for an empty command line.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Kill the interpreter if it runs longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for InterpreterExecutor {
    fn default() -> Self {
        Self::new("python3", vec!["-".to_string()])
    }
}

impl CodeExecutor for InterpreterExecutor {
    #[instrument(skip(self, code), fields(program = %self.program, timeout = ?self.timeout))]
    fn execute_code(&mut self, code: &str) -> ExecutionResult {
        debug!(code_len = code.len(), "Executing code");

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Failed to spawn interpreter");
                return ExecutionResult::failure(format!(
                    "Failed to spawn interpreter '{}': {e}",
                    self.program
                ));
            }
        };

        // Feed stdin while the pipes drain, or a chatty child and a large
        // snippet block each other. Dropping stdin sends EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let code = code.to_owned();
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(code.as_bytes()) {
                    debug!(error = %e, "Interpreter closed stdin early");
                }
            });
        }
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match wait_until(&mut child, Instant::now() + self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!("Execution timed out; killing interpreter");
                let _ = child.kill();
                let _ = child.wait();
                // Readers are left behind: a grandchild may still hold the pipes
                return ExecutionResult::failure(format!(
                    "Execution timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                ));
            }
            Err(e) => {
                let _ = child.kill();
                return ExecutionResult::failure(format!("Failed to wait for interpreter: {e}"));
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        debug!(status = ?status.code(), "Execution completed");

        if status.success() {
            ExecutionResult::success(stdout).with_logs(stderr)
        } else {
            let error = if stderr.trim().is_empty() {
                format!("Interpreter exited with {status}")
            } else {
                stderr
            };
            ExecutionResult {
                success: false,
                output: stdout,
                error,
                logs: String::new(),
            }
        }
    }
}

/// Read a pipe to EOF on its own thread.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!(error = %e, "Interpreter pipe read failed");
        }
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = reader.and_then(|r| r.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Wait for `child` to exit. `Ok(None)` once `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL.min(deadline - now));
    }
}
