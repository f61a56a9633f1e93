use anyhow::Result;
use process_control::{ChildExt, Timeout};
use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Serializable representation of a subprocess's terminal output.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Output {
    pub exit_status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for Output {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl From<process_control::Output> for Output {
    fn from(output: process_control::Output) -> Self {
        Self {
            exit_status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Serializable representation of a subprocess exit status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitStatus {
    pub fn sigkill(&self) -> bool {
        #[cfg(target_family = "unix")]
        {
            self.signal == Some(9)
        }
        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }

    pub fn sigterm(&self) -> bool {
        #[cfg(target_family = "unix")]
        {
            self.signal == Some(15)
        }
        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    #[cfg(target_os = "windows")]
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }

    #[cfg(target_family = "unix")]
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
            success: status.success(),
        }
    }
}

impl From<process_control::ExitStatus> for ExitStatus {
    #[cfg(target_os = "windows")]
    fn from(status: process_control::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
            success: status.success(),
        }
    }

    #[cfg(target_family = "unix")]
    fn from(status: process_control::ExitStatus) -> Self {
        Self {
            code: status.code().map(|c| c as i32),
            signal: status.signal(),
            success: status.success(),
        }
    }
}

/// Runs `program` with `argv`/`env`, killing it if it exceeds `timeout`.
///
/// This is run on a blocking thread because `process_control`'s wait loop is
/// synchronous; the calling worker continues to poll its own parent channel
/// independently via the outer `tokio::select!`, so this never stalls
/// message dispatch for longer than `timeout`.
pub async fn run_cmd_with_timeout<S: std::hash::BuildHasher + Send + 'static>(
    program: impl AsRef<Path>,
    argv: Vec<String>,
    env: HashMap<String, String, S>,
    cwd: Option<std::path::PathBuf>,
    timeout: Duration,
) -> Result<Output> {
    let program = program.as_ref().to_path_buf();

    let runner = tokio::task::spawn_blocking(move || {
        let mut cmd = Command::new(&program);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .args(&argv)
            .envs(&env);

        if let Some(cwd) = &cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        let result = child
            .with_output_timeout(timeout)
            .terminating()
            .wait()?;

        match result {
            Some(output) => Ok(Output::from(output)),
            None => anyhow::bail!("process timed out after {:?}", timeout),
        }
    });

    runner.await?
}
