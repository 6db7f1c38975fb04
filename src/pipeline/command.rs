// src/pipeline/command.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{Stage, StageError, StageSuccess};
use crate::config::{StageConfig, ENV_CONFIG_PATH, ENV_LAKE_ROOT, SELF_PROGRAM};

/// A stage backed by an external process; its exit status is the stage result.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    depends_on: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            depends_on: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `@self` stages run `self_exe` and inherit the config file and lake root
    /// the parent was started with.
    pub fn from_config(
        cfg: &StageConfig,
        self_exe: &Path,
        config_path: Option<&Path>,
        lake_root: Option<&Path>,
    ) -> Self {
        let is_self = cfg.program == SELF_PROGRAM;
        let program = if is_self {
            self_exe.to_path_buf()
        } else {
            PathBuf::from(&cfg.program)
        };

        let mut stage = CommandStage::new(cfg.name.clone(), program)
            .args(cfg.args.iter().cloned())
            .with_deps(cfg.depends_on.iter().cloned());
        if let Some(dir) = &cfg.cwd {
            stage = stage.current_dir(dir.clone());
        }
        if is_self {
            if let Some(p) = config_path {
                stage = stage.env(ENV_CONFIG_PATH, p.display().to_string());
            }
            if let Some(root) = lake_root {
                stage = stage.env(ENV_LAKE_ROOT, root.display().to_string());
            }
        }
        stage
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    async fn execute(&self) -> Result<StageSuccess, StageError> {
        tracing::debug!(stage = %self.name, cmd = %self.command_line(), "spawning stage process");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let status = cmd.status().await.map_err(|source| StageError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if status.success() {
            return Ok(StageSuccess {
                detail: Some(self.command_line()),
            });
        }
        match status.code() {
            Some(code) => Err(StageError::Exit { code }),
            None => Err(StageError::Killed),
        }
    }
}
