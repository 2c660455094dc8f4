//! External command execution.

use async_trait::async_trait;
use tether_common::{TetherError, TetherResult};
use tokio::process::Command;

/// Runs privileged host commands (`ip`, `ebtables`, `iptables`, `sysctl`).
#[async_trait]
pub trait ExecClient: Send + Sync {
    /// Run `program` with `args` and return its standard output.
    ///
    /// A non-zero exit status is reported as [`TetherError::Command`].
    async fn execute(&self, program: &str, args: &[String]) -> TetherResult<String>;
}

/// [`ExecClient`] that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecClient for CommandExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> TetherResult<String> {
        let command = command_line(program, args);
        tracing::trace!(%command, "Executing");

        let output = Command::new(program).args(args).output().await.map_err(|e| {
            TetherError::Command {
                command: command.clone(),
                code: None,
                stderr: e.to_string(),
            }
        })?;

        if !output.status.success() {
            return Err(TetherError::Command {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render a command for logs and error messages.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Convert string slices into an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_command_line() {
        let rendered = command_line("ip", &args(["link", "show", "lo"]));
        assert_eq!(rendered, "ip link show lo");
    }

    #[tokio::test]
    async fn reports_missing_program() {
        let err = CommandExecutor::new()
            .execute("tether-definitely-missing-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Command { code: None, .. }));
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let err = CommandExecutor::new()
            .execute("sh", &args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            TetherError::Command { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn returns_stdout() {
        let out = CommandExecutor::new()
            .execute("sh", &args(["-c", "printf hello"]))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }
}
