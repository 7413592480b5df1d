//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Language id reserved for the problem checker toolchain. The language file
/// must always define it; judging cannot proceed without a checker.
pub const CHECKER_LANG_ID: &str = "checker";

/// Configuration for a supported programming language.
///
/// `compile` is tokenized honoring shell-style quoting (it may contain quoted
/// arguments with spaces); `exec` is split on plain whitespace. Exec strings
/// are trusted configuration, so no quoting support there.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguageSpec {
    /// Name of the source file (e.g., "main.cpp")
    pub source: String,
    /// Compile command
    pub compile: String,
    /// Run command
    pub exec: String,
}

#[derive(Debug, Deserialize)]
struct LangEntry {
    id: String,
    #[serde(flatten)]
    spec: LanguageSpec,
}

#[derive(Debug, Deserialize)]
struct LangFile {
    langs: Vec<LangEntry>,
}

/// Global language table, loaded once at startup.
static LANGUAGES: OnceLock<HashMap<String, LanguageSpec>> = OnceLock::new();

/// Initialize the language table from a TOML file.
pub fn init_languages(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read language file {}", path.display()))?;
    init_languages_from_str(&content)
}

/// Initialize the language table from TOML content.
pub fn init_languages_from_str(content: &str) -> Result<()> {
    let table = parse_languages(content)?;
    LANGUAGES
        .set(table)
        .map_err(|_| anyhow::anyhow!("languages already initialized"))?;
    Ok(())
}

fn parse_languages(content: &str) -> Result<HashMap<String, LanguageSpec>> {
    let raw: LangFile = toml::from_str(content).context("malformed language file")?;

    let mut table = HashMap::new();
    for entry in raw.langs {
        table.insert(entry.id, entry.spec);
    }

    if !table.contains_key(CHECKER_LANG_ID) {
        anyhow::bail!("language file has no `{}` entry", CHECKER_LANG_ID);
    }

    Ok(table)
}

/// Look up a language by id. Unknown ids yield an empty spec; callers that
/// want stricter behavior validate the id upstream.
pub fn get_language(id: &str) -> LanguageSpec {
    LANGUAGES
        .get()
        .and_then(|table| table.get(id))
        .cloned()
        .unwrap_or_default()
}

/// The checker toolchain entry.
pub fn checker_language() -> LanguageSpec {
    get_language(CHECKER_LANG_ID)
}

/// All configured language ids.
pub fn supported_languages() -> Vec<String> {
    LANGUAGES
        .get()
        .map(|table| table.keys().cloned().collect())
        .unwrap_or_default()
}
