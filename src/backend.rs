//! Execution collaborator used by the forwarder.
//!
//! Executors run on the host's control thread, one request at a time, so the
//! trait is synchronous. Failures of the submitted code are data, not errors:
//! they come back as an [`ExecutionResult`] with `success == false`.

mod interpreter;

pub use interpreter::InterpreterExecutor;

use std::io;
use std::path::Path;

/// Result of executing a unit of work on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Output of a successful run.
    pub output: String,
    /// Error text of a failed run.
    pub error: String,
    /// Log lines captured while the code ran.
    pub logs: String,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }
}

/// Trait for host-side executors.
pub trait CodeExecutor {
    /// Execute a code snippet.
    fn execute_code(&mut self, code: &str) -> ExecutionResult;

    /// Load a script from disk and execute it.
    ///
    /// Missing files and permission problems produce distinguishable error
    /// text so callers can tell them apart from failures of the script.
    fn execute_file(&mut self, path: &Path) -> ExecutionResult {
        match std::fs::read_to_string(path) {
            Ok(code) => self.execute_code(&code),
            Err(e) => ExecutionResult::failure(describe_read_error(path, &e)),
        }
    }
}

impl<T: CodeExecutor + ?Sized> CodeExecutor for Box<T> {
    fn execute_code(&mut self, code: &str) -> ExecutionResult {
        (**self).execute_code(code)
    }

    fn execute_file(&mut self, path: &Path) -> ExecutionResult {
        (**self).execute_file(path)
    }
}

fn describe_read_error(path: &Path, error: &io::Error) -> String {
    match error.kind() {
        io::ErrorKind::NotFound => format!("File not found: {}", path.display()),
        io::ErrorKind::PermissionDenied => format!("Permission denied: {}", path.display()),
        _ => format!("File read error: {error}"),
    }
}
