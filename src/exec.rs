//! External command execution.
//!
//! The repository implementations drive command-line tools (reprepro,
//! createrepo_c, gpg, mount) as black boxes. They go through the
//! [`CommandRunner`] trait so tests can substitute a scripted runner.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RepoError, RepoResult};

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output, trailing newline stripped.
    pub stdout: String,
    /// Standard error, trailing newline stripped.
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout and stderr interleaved for operation logs.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Synchronous-style external command execution with captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally in `cwd`, waiting for it to
    /// finish.
    ///
    /// A non-zero exit raises [`RepoError::ExternalTool`] with the captured
    /// output attached. Commands are not cancellable once started.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> RepoResult<CommandOutput>;
}

/// [`CommandRunner`] backed by real child processes.
pub struct SystemRunner;

impl SystemRunner {
    /// Create a runner that inherits the process working directory.
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a command line for logs and error messages.
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> RepoResult<CommandOutput> {
        let command_line = render_command(program, args);
        debug!("Running command: {}", command_line);

        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await?;
        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout)
                .trim_end()
                .to_string(),
            stderr: String::from_utf8_lossy(&output.stderr)
                .trim_end()
                .to_string(),
        };

        if !output.status.success() {
            return Err(RepoError::ExternalTool {
                command: command_line,
                output: captured.combined(),
            });
        }
        Ok(captured)
    }
}
