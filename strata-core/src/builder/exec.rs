//! Process execution for run instructions.
//!
//! Commands run on the host with the materialized stage root as their
//! working directory. There is no isolation layer: pipelines are trusted
//! input, and absolute paths inside commands resolve against the host.

use crate::builder::executor::{BuildError, BuildResult};
use crate::builder::parser::RunCommand;
use crate::builder::snapshot::normalize_path;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Baseline PATH for stage commands.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything needed to run one command.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub stage_name: String,
    pub command: RunCommand,
    /// Environment visible to the command, declaration order
    pub env: Vec<(String, String)>,
    /// Working directory inside the stage root, absolute
    pub workdir: String,
}

/// How a command exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDetails {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitDetails {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

impl From<&std::process::ExitStatus> for ExitDetails {
    fn from(status: &std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self { code: status.code(), signal: status.signal() }
    }
}

/// Runs stage commands. The seam that lets tests observe or stub execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one command to completion inside `root`.
    ///
    /// `Err` means the command could not be started at all; a command that
    /// ran and failed comes back as unsuccessful [`ExitDetails`].
    async fn run(&self, root: &Path, spec: &ProcessSpec) -> BuildResult<ExitDetails>;
}

/// Real runner: `/bin/sh -c` for shell form, direct argv for exec form.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, root: &Path, spec: &ProcessSpec) -> BuildResult<ExitDetails> {
        // Normalizing first keeps `..` segments from resolving above root.
        let cwd = root.join(normalize_path(&spec.workdir).trim_start_matches('/'));
        std::fs::create_dir_all(&cwd).map_err(|e| BuildError::io(&cwd, e))?;

        let mut command = match &spec.command {
            RunCommand::Shell(line) => {
                let mut c = Command::new("/bin/sh");
                c.arg("-c").arg(line);
                c
            }
            RunCommand::Exec(argv) => {
                let program = argv.first().ok_or_else(|| BuildError::Internal {
                    message: format!("empty exec-form command in stage '{}'", spec.stage_name),
                })?;
                let mut c = Command::new(program);
                c.args(&argv[1..]);
                c
            }
        };

        command
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        debug!(
            stage = %spec.stage_name,
            command = %spec.command,
            cwd = %cwd.display(),
            "Running command"
        );

        let output = command.output().await.map_err(|e| BuildError::ProcessSpawn {
            stage: spec.stage_name.clone(),
            command: spec.command.to_string(),
            source: e,
        })?;
        let details = ExitDetails::from(&output.status);

        if !details.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                stage = %spec.stage_name,
                status = %details,
                stderr = %stderr.trim_end(),
                "Command failed"
            );
        }

        Ok(details)
    }
}
