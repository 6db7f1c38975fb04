// src/config/mod.rs
//! Run configuration, loaded once in `main` and handed to each component.
//!
//! Lookup order: `$CHANNEL_LAKE_CONFIG`, then `config/pipeline.toml`, then built-in defaults.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::config::{clean_sources, load_sources_from};
use crate::ingest::IngestSettings;
use crate::lake::LakeLayout;

pub const ENV_CONFIG_PATH: &str = "CHANNEL_LAKE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_API_TOKEN: &str = "CHANNEL_API_TOKEN";
/// Lake root override; takes precedence over `lake_root` in the file.
pub const ENV_LAKE_ROOT: &str = "CHANNEL_LAKE_ROOT";

/// Stage program placeholder for "this binary".
pub const SELF_PROGRAM: &str = "@self";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub lake_root: PathBuf,
    pub ingest: IngestConfig,
    pub upstream: UpstreamConfig,
    pub stages: Vec<StageConfig>,
    /// File this config was read from, if any.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub sources: Vec<String>,
    /// Extra sources from a TOML or JSON list, appended after `sources`.
    pub sources_file: Option<PathBuf>,
    pub limit: usize,
    pub message_delay_secs: f64,
    pub channel_delay_secs: f64,
    pub max_retries: u32,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Http,
    Fixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,
    pub base_url: Option<String>,
    /// "ENV" means: read from CHANNEL_API_TOKEN.
    pub token: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    /// Executable; `@self` runs this binary.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lake_root: PathBuf::from("data"),
            ingest: IngestConfig::default(),
            upstream: UpstreamConfig::default(),
            stages: default_stages(),
            source_path: None,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        let d = IngestSettings::default();
        Self {
            sources: Vec::new(),
            sources_file: None,
            limit: d.limit,
            message_delay_secs: d.message_delay.as_secs_f64(),
            channel_delay_secs: d.channel_delay.as_secs_f64(),
            max_retries: d.max_retries,
            page_size: d.page_size,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::Http,
            base_url: None,
            token: None,
            fixture_path: None,
            timeout_secs: 30,
        }
    }
}

impl StageConfig {
    pub fn new(name: &str, program: &str, args: &[&str], depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }
}

/// ingest -> enrich -> load -> transform.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("ingest", SELF_PROGRAM, &["ingest"], &[]),
        StageConfig::new("enrich", "python3", &["enrichment/detect.py"], &["ingest"]),
        StageConfig::new(
            "load",
            "python3",
            &["enrichment/load_detections.py"],
            &["enrich"],
        ),
        StageConfig::new(
            "transform",
            "dbt",
            &["run", "--project-dir", "warehouse"],
            &["load"],
        ),
    ]
}

impl Config {
    /// Load from an explicit path. Relative paths inside the file stay relative to the CWD.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        cfg.source_path = Some(path.to_path_buf());
        cfg.resolve()?;
        Ok(cfg)
    }

    /// 1) $CHANNEL_LAKE_CONFIG  2) config/pipeline.toml  3) defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::from_path(&pb);
            }
            bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::from_path(&default_p);
        }
        let mut cfg = Config::default();
        cfg.resolve()?;
        Ok(cfg)
    }

    /// Merge source files, resolve secrets, validate numbers.
    fn resolve(&mut self) -> Result<()> {
        let mut sources = std::mem::take(&mut self.ingest.sources);
        if let Some(file) = &self.ingest.sources_file {
            sources.extend(load_sources_from(file)?);
        }
        self.ingest.sources = clean_sources(sources);

        if let Some(token) = &self.upstream.token {
            if token.trim().eq_ignore_ascii_case("env") {
                let v = std::env::var(ENV_API_TOKEN)
                    .map_err(|_| anyhow!("Missing {ENV_API_TOKEN} env var"))?;
                self.upstream.token = Some(v);
            }
        }

        check_delay("message_delay_secs", self.ingest.message_delay_secs)?;
        check_delay("channel_delay_secs", self.ingest.channel_delay_secs)?;
        if self.ingest.page_size == 0 {
            bail!("ingest.page_size must be at least 1");
        }
        Ok(())
    }

    pub fn lake_layout(&self) -> LakeLayout {
        LakeLayout::new(&self.lake_root)
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            sources: self.ingest.sources.clone(),
            limit: self.ingest.limit,
            message_delay: secs(self.ingest.message_delay_secs),
            channel_delay: secs(self.ingest.channel_delay_secs),
            max_retries: self.ingest.max_retries,
            page_size: self.ingest.page_size,
        }
    }
}

pub fn check_delay(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{name} must be a non-negative number of seconds, got {value}");
    }
    Ok(())
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    #[test]
    fn full_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("pipeline.toml");
        fs::write(
            &p,
            r#"
lake_root = "/srv/lake"

[ingest]
sources = ["@CheMed123", "tikvahpharma", "@CheMed123"]
limit = 50
message_delay_secs = 0.5
channel_delay_secs = 2
max_retries = 4

[upstream]
kind = "fixture"
fixture_path = "fixtures/channels.json"

[[stages]]
name = "ingest"
program = "@self"
args = ["ingest"]

[[stages]]
name = "enrich"
program = "python3"
args = ["detect.py"]
depends_on = ["ingest"]
"#,
        )
        .unwrap();

        let cfg = Config::from_path(&p).unwrap();
        assert_eq!(cfg.lake_root, PathBuf::from("/srv/lake"));
        assert_eq!(cfg.ingest.sources, vec!["CheMed123", "tikvahpharma"]);
        assert_eq!(cfg.upstream.kind, UpstreamKind::Fixture);
        assert_eq!(cfg.stages.len(), 2);
        assert_eq!(cfg.stages[1].depends_on, vec!["ingest"]);

        let s = cfg.ingest_settings();
        assert_eq!(s.limit, 50);
        assert_eq!(s.message_delay, Duration::from_millis(500));
        assert_eq!(s.channel_delay, Duration::from_secs(2));
        assert_eq!(s.max_retries, 4);
        assert_eq!(s.page_size, 100);
    }

    #[test]
    fn negative_delay_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bad.toml");
        fs::write(&p, "[ingest]\nmessage_delay_secs = -1.0\n").unwrap();
        let err = Config::from_path(&p).unwrap_err();
        assert!(format!("{err:#}").contains("message_delay_secs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("typo.toml");
        fs::write(&p, "[ingest]\nlimt = 5\n").unwrap();
        assert!(Config::from_path(&p).is_err());
    }

    #[test]
    fn defaults_are_the_four_stage_chain() {
        let cfg = Config::default();
        let names: Vec<_> = cfg.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ingest", "enrich", "load", "transform"]);
        assert_eq!(cfg.stages[0].program, SELF_PROGRAM);
    }

    #[serial_test::serial]
    #[test]
    fn token_env_placeholder_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("tok.toml");
        fs::write(&p, "[upstream]\nbase_url = \"http://gw\"\ntoken = \"ENV\"\n").unwrap();

        env::remove_var(ENV_API_TOKEN);
        assert!(Config::from_path(&p).is_err());

        env::set_var(ENV_API_TOKEN, "s3cret");
        let cfg = Config::from_path(&p).unwrap();
        assert_eq!(cfg.upstream.token.as_deref(), Some("s3cret"));
        env::remove_var(ENV_API_TOKEN);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        // Isolate CWD so a real config/ in the repo does not leak in.
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        let cfg = Config::load_default().unwrap();
        assert!(cfg.source_path.is_none());
        assert!(cfg.ingest.sources.is_empty());

        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(
            tmp.path().join(DEFAULT_CONFIG_PATH),
            "[ingest]\nsources = [\"a\"]\n",
        )
        .unwrap();
        assert_eq!(Config::load_default().unwrap().ingest.sources, vec!["a"]);

        let p_env = tmp.path().join("other.toml");
        fs::write(&p_env, "[ingest]\nsources = [\"x\", \"y\"]\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p_env.display().to_string());
        assert_eq!(
            Config::load_default().unwrap().ingest.sources,
            vec!["x", "y"]
        );

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("nope.toml").display().to_string());
        assert!(Config::load_default().is_err());
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
