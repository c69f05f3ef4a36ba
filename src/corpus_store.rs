//! Per-project in-memory question index.
//!
//! Writers stage changes with [`CorpusStore::update`] / [`CorpusStore::remove`]
//! and publish them with [`CorpusStore::build_index`], which builds a fresh
//! immutable [`CorpusIndex`] and swaps it in. Readers clone the current
//! `Arc<CorpusIndex>` and score against it without holding any lock, so a
//! query during a rebuild sees either the old or the new index, never a mix.
//!
//! [`CorpusStore::sync`] writes the published index to a JSON snapshot
//! (`{project}.json` by default) using a temp file + rename.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::matcher::Features;

const SNAPSHOT_VERSION: u32 = 1;

/// One indexed phrasing with its candidate answer tokens.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub question: String,
    pub answers: Vec<String>,
    pub(crate) features: Features,
}

/// The published, read-only ranking structure.
///
/// Entries keep staging order (first insertion of each question), which
/// the match engine uses to break score ties. `postings` maps every
/// character gram to the entries containing it.
#[derive(Debug, Default)]
pub struct CorpusIndex {
    entries: Vec<IndexedEntry>,
    postings: HashMap<String, Vec<u32>>,
}

impl CorpusIndex {
    fn build(staged: Vec<(String, Vec<String>)>) -> Self {
        let mut postings: HashMap<String, Vec<u32>> = HashMap::new();
        let entries: Vec<IndexedEntry> = staged
            .into_iter()
            .enumerate()
            .map(|(pos, (question, answers))| {
                let features = Features::new(&question);
                for gram in &features.grams {
                    postings.entry(gram.clone()).or_default().push(pos as u32);
                }
                IndexedEntry {
                    question,
                    answers,
                    features,
                }
            })
            .collect();
        Self { entries, postings }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexedEntry] {
        &self.entries
    }

    pub fn get(&self, question: &str) -> Option<&IndexedEntry> {
        self.entries.iter().find(|e| e.question == question)
    }

    /// Positions of entries sharing at least one gram with `features`, ascending.
    pub(crate) fn candidates(&self, features: &Features) -> Vec<u32> {
        let mut hits: Vec<u32> = features
            .grams
            .iter()
            .filter_map(|g| self.postings.get(g))
            .flatten()
            .copied()
            .collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

#[derive(Debug, Default)]
struct StagedQuestion {
    seq: u64,
    answers: Vec<String>,
}

#[derive(Debug, Default)]
struct Staged {
    next_seq: u64,
    questions: HashMap<String, StagedQuestion>,
}

impl Staged {
    fn ordered(&self) -> Vec<(String, Vec<String>)> {
        let mut items: Vec<(&String, &StagedQuestion)> = self
            .questions
            .iter()
            .filter(|(_, q)| !q.answers.is_empty())
            .collect();
        items.sort_by_key(|(_, q)| q.seq);
        items
            .into_iter()
            .map(|(question, q)| (question.clone(), q.answers.clone()))
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    project: String,
    questions: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    question: String,
    answers: Vec<String>,
}

/// Question index owned by exactly one bot instance.
pub struct CorpusStore {
    project: String,
    snapshot_path: Option<PathBuf>,
    staged: Mutex<Staged>,
    live: RwLock<Arc<CorpusIndex>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CorpusStore {
    pub fn new(project: impl Into<String>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            project: project.into(),
            snapshot_path,
            staged: Mutex::new(Staged::default()),
            live: RwLock::new(Arc::new(CorpusIndex::default())),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Merges answer tokens into a question, keeping earlier answers.
    pub fn update<I>(&self, question: &str, answers: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut staged = lock(&self.staged);
        let seq = staged.next_seq;
        let entry = staged
            .questions
            .entry(question.to_string())
            .or_insert_with(|| StagedQuestion {
                seq,
                answers: Vec::new(),
            });
        let is_new = entry.seq == seq;
        for answer in answers {
            let answer = answer.into();
            if !entry.answers.contains(&answer) {
                entry.answers.push(answer);
            }
        }
        if is_new {
            staged.next_seq += 1;
        }
    }

    /// Drops a question and all of its answers. Returns whether it existed.
    pub fn remove(&self, question: &str) -> bool {
        lock(&self.staged).questions.remove(question).is_some()
    }

    /// Drops one answer token from a question, and the question itself once
    /// it has no answers left.
    pub fn remove_answer(&self, question: &str, token: &str) -> bool {
        let mut staged = lock(&self.staged);
        let Some(entry) = staged.questions.get_mut(question) else {
            return false;
        };
        let before = entry.answers.len();
        entry.answers.retain(|a| a != token);
        let removed = entry.answers.len() != before;
        if entry.answers.is_empty() {
            staged.questions.remove(question);
        }
        removed
    }

    /// Clears every staged question. The published index is untouched
    /// until the next [`build_index`](Self::build_index).
    pub fn reset(&self) {
        let mut staged = lock(&self.staged);
        staged.questions.clear();
        staged.next_seq = 0;
    }

    /// Number of staged questions (published or not).
    pub fn staged_len(&self) -> usize {
        lock(&self.staged).questions.len()
    }

    /// Rebuilds the ranking structure from the staged questions and
    /// publishes it. Returns the number of indexed questions.
    pub fn build_index(&self) -> usize {
        let ordered = lock(&self.staged).ordered();
        let index = Arc::new(CorpusIndex::build(ordered));
        let len = index.len();
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = index;
        tracing::debug!(project = %self.project, questions = len, "index rebuilt");
        len
    }

    /// The currently published index.
    pub fn index(&self) -> Arc<CorpusIndex> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Writes the published index to the snapshot file, if one is configured.
    pub fn sync(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let index = self.index();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            project: self.project.clone(),
            questions: index
                .entries()
                .iter()
                .map(|e| SnapshotEntry {
                    question: e.question.clone(),
                    answers: e.answers.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::Indexing(format!("failed to encode snapshot: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;

        tracing::info!(
            project = %self.project,
            path = %path.display(),
            questions = index.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Stages and publishes the snapshot contents, if the file exists.
    ///
    /// Returns the number of questions loaded (0 when there is no snapshot).
    pub fn load_snapshot(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Indexing(format!("invalid snapshot {}: {}", path.display(), e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Indexing(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            )));
        }

        for entry in snapshot.questions {
            self.update(&entry.question, entry.answers);
        }
        Ok(self.build_index())
    }
}
