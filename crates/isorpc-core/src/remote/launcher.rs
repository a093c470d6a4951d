//! Worker process launching.

use crate::error::{Result, RpcError};
use crate::platform;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Starts worker processes.
///
/// Implementations decide how the worker is spawned, for example through an
/// environment activation wrapper. The environment passed in is complete:
/// implementations must not let the child inherit anything else.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, args: &[String], env: &HashMap<String, String>) -> Result<WorkerProcess>;
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub status: String,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            status: status.to_string(),
        }
    }
}

/// A launched worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitInfo> {
        Ok(self.child.wait().await?.into())
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitInfo>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(status?.into())),
            Err(_) => Ok(None),
        }
    }

    /// Ask the process to exit, then kill it if it is still running after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        if let Some(pid) = self.id() {
            match platform::send_terminate(pid) {
                Ok(_) => {
                    if let Some(exit) = self.wait_timeout(grace).await? {
                        debug!("Worker {} exited after terminate request", pid);
                        return Ok(exit);
                    }
                    warn!("Worker {} did not exit within {:?}, killing", pid, grace);
                }
                Err(e) => debug!("Terminate request failed, killing: {}", e),
            }
        }
        self.kill().await
    }

    /// Kill the process immediately and reap it.
    pub async fn kill(&mut self) -> Result<ExitInfo> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }
        self.child.kill().await?;
        self.wait().await
    }
}

/// Launches a worker executable, optionally behind a prefix command.
///
/// The command line is `prefix[0] prefix[1..] program args`. A prefix such
/// as `["bash", "-c", "source env/bin/activate && exec \"$@\"", "worker"]`
/// runs the worker inside an activated environment.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    prefix: Vec<String>,
    current_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
            current_dir: None,
        }
    }

    pub fn with_prefix<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = match self.prefix.split_first() {
            Some((first, rest)) => {
                let mut command = Command::new(first);
                command.args(rest).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command.args(args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, args: &[String], env: &HashMap<String, String>) -> Result<WorkerProcess> {
        let mut command = self.command(args);
        command
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| RpcError::LaunchFailed {
            message: format!("failed to spawn {}: {}", self.program.display(), e),
        })?;
        info!(
            "Launched worker {} (pid {:?})",
            self.program.display(),
            child.id()
        );
        Ok(WorkerProcess::new(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_builds_command_line() {
        let launcher = CommandLauncher::new("worker").with_prefix(["env", "-i"]);
        let command = launcher.command(&["--debug".to_string()]);
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "env");
        let args: Vec<_> = std_command.get_args().collect();
        assert_eq!(args, vec!["-i", "worker", "--debug"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let launcher = CommandLauncher::new("/nonexistent/isorpc-worker");
        let result = launcher.launch(&[], &HashMap::new());
        assert!(matches!(result, Err(RpcError::LaunchFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_exactly_the_supplied_map() {
        let launcher = CommandLauncher::new("/bin/sh");
        let env = HashMap::from([("ONLY_VAR".to_string(), "1".to_string())]);
        let args = vec![
            "-c".to_string(),
            "[ \"$ONLY_VAR\" = 1 ] && [ -z \"$HOME\" ]".to_string(),
        ];

        let mut process = launcher.launch(&args, &env).unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_running_process() {
        let launcher = CommandLauncher::new("/bin/sh");
        let args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        let mut process = launcher.launch(&args, &HashMap::new()).unwrap();
        let pid = process.id().unwrap();

        let exit = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, None);
        assert!(!platform::is_process_alive(pid));
    }
}
