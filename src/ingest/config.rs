// src/ingest/config.rs
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::ingest::types::normalize_source_id;

/// Source list file formats, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFormat {
    /// `sources = ["a", "b"]`
    Toml,
    /// `["a", "b"]`
    Json,
}

impl ListFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some(e) if e.eq_ignore_ascii_case("toml") => Ok(Self::Toml),
            Some(e) if e.eq_ignore_ascii_case("json") => Ok(Self::Json),
            _ => bail!(
                "source list {} must end in .toml or .json",
                path.display()
            ),
        }
    }
}

/// Load a source list from `.toml` (`sources = [...]`) or `.json` (array).
pub fn load_sources_from(path: &Path) -> Result<Vec<String>> {
    let format = ListFormat::from_path(path)?;
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading source list from {}", path.display()))?;
    parse_sources(&content, format)
        .with_context(|| format!("parsing {format:?} source list {}", path.display()))
}

fn parse_sources(s: &str, format: ListFormat) -> Result<Vec<String>> {
    match format {
        ListFormat::Toml => parse_toml(s),
        ListFormat::Json => parse_json(s),
    }
}

fn parse_toml(s: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct TomlSources {
        sources: Vec<String>,
    }
    let v: TomlSources = toml::from_str(s)?;
    Ok(clean_sources(v.sources))
}

fn parse_json(s: &str) -> Result<Vec<String>> {
    let v: Vec<String> = serde_json::from_str(s)?;
    Ok(clean_sources(v))
}

/// Trim, drop the `@` marker, skip blanks and repeats. Keeps first-seen order,
/// which is the order sources are scraped in.
pub fn clean_sources<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for it in items {
        let id = normalize_source_id(it.as_ref());
        if !id.is_empty() && seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}
