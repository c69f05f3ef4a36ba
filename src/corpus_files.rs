//! Corpus file discovery and parsing.
//!
//! Corpus files follow the chatterbot layout, in JSON or YAML:
//!
//! ```yaml
//! categories:
//! - deploy
//! conversations:
//! - - why is the deploy slow
//!   - check the build logs
//! ```
//!
//! The first category names the class (the file stem when there is none).
//! Each conversation contributes its consecutive `(question, answer)` pairs.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// `(question, answer)` pairs keyed by class.
pub type CorpusFileSet = BTreeMap<String, Vec<(String, String)>>;

const CORPUS_GLOBS: [&str; 3] = ["*.json", "*.yml", "*.yaml"];

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    conversations: Vec<Vec<String>>,
}

/// Lists the corpus files directly inside `dir`, sorted by path.
pub fn find_corpus_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("corpus directory does not exist: {}", dir.display());
    }

    let include = build_globset(&CORPUS_GLOBS)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if include.is_match(&*name) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Parses every file and merges their pairs by class.
///
/// A file that cannot be read or parsed is logged and skipped.
pub fn load_corpora(files: &[PathBuf]) -> CorpusFileSet {
    let mut set = CorpusFileSet::new();
    for path in files {
        match load_corpus_file(path) {
            Ok((class, pairs)) => set.entry(class).or_default().extend(pairs),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping corpus file");
            }
        }
    }
    set
}

fn load_corpus_file(path: &Path) -> Result<(String, Vec<(String, String)>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file: CorpusFile = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse corpus file: {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse corpus file: {}", path.display()))?
    };

    let class = file
        .categories
        .first()
        .cloned()
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_default();

    let pairs = file
        .conversations
        .iter()
        .flat_map(|conv| {
            conv.windows(2)
                .map(|w| (w[0].trim().to_string(), w[1].trim().to_string()))
        })
        .filter(|(q, a)| !q.is_empty() && !a.is_empty())
        .collect();

    Ok((class, pairs))
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
