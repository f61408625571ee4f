use std::{ffi::OsStr, process::Stdio};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::{MonounitError, MonounitResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `program` with `args` to completion and returns its trimmed stdout.
///
/// A non-zero exit status becomes an [`MonounitError::Operation`] carrying stderr. A program
/// that cannot be spawned at all becomes a [`MonounitError::Connectivity`] error since the
/// runtime it fronts is unreachable.
pub async fn run_command<I, S>(program: &str, args: I) -> MonounitResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_command_with_input(program, args, None).await
}

/// Like [`run_command`] but feeds `input` to the child's stdin.
pub async fn run_command_with_input<I, S>(
    program: &str,
    args: I,
    input: Option<&[u8]>,
) -> MonounitResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!("running {:?}", command.as_std());

    let mut child = command.spawn().map_err(|e| {
        MonounitError::Connectivity(format!("failed to spawn {program}: {e}"))
    })?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(input).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MonounitError::Operation(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() -> anyhow::Result<()> {
        let out = run_command("sh", ["-c", "echo hello"]).await?;
        assert_eq!(out, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_reports_failure() {
        let err = run_command("sh", ["-c", "echo nope >&2; exit 3"])
            .await
            .unwrap_err();
        assert!(matches!(err, MonounitError::Operation(ref m) if m.contains("nope")));
    }

    #[tokio::test]
    async fn test_run_command_with_input() -> anyhow::Result<()> {
        let out = run_command_with_input("cat", Vec::<String>::new(), Some(b"piped")).await?;
        assert_eq!(out, "piped");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program_is_connectivity_error() {
        let err = run_command("definitely-not-a-real-binary", ["x"])
            .await
            .unwrap_err();
        assert!(matches!(err, MonounitError::Connectivity(_)));
    }
}
