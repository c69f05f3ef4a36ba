//! Bulk loading of question/answer groups into a [`CorpusStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::corpus_files::CorpusFileSet;
use crate::corpus_store::CorpusStore;
use crate::error::{Error, Result};
use crate::question::{phrase_group, IndexedQuestion};

/// Phrase groups keyed by project (or class, for raw file data). Each group
/// alternates normalized question and encoded answer token.
pub type PhraseCorpus = BTreeMap<String, Vec<Vec<String>>>;

/// Pushes phrase groups into a store and rebuilds its index once per batch.
pub struct Trainer {
    store: Arc<CorpusStore>,
}

impl Trainer {
    pub fn new(store: Arc<CorpusStore>) -> Self {
        Self { store }
    }

    /// Stages every `(question, token)` pair, then builds the index once.
    ///
    /// Fails without building if a group has a question with no token; pairs
    /// staged before the bad group stay staged and are published by the next
    /// successful build.
    pub fn train_with_corpus(&self, corpus: &PhraseCorpus) -> Result<usize> {
        for (key, groups) in corpus {
            for group in groups {
                if group.len() % 2 != 0 {
                    return Err(Error::Indexing(format!(
                        "phrase group in '{}' has a question without an answer: {:?}",
                        key,
                        group.last()
                    )));
                }
                for pair in group.chunks_exact(2) {
                    self.store.update(&pair[0], [pair[1].as_str()]);
                }
            }
        }
        Ok(self.store.build_index())
    }

    /// Loads raw question/answer pairs straight from corpus files, then
    /// writes the snapshot.
    ///
    /// Used before durable storage is populated, so every token carries id 0.
    pub fn train(&self, data: &CorpusFileSet) -> Result<usize> {
        let mut corpus = PhraseCorpus::new();
        for (class, pairs) in data {
            let groups = corpus.entry(class.clone()).or_default();
            for (question, answer) in pairs {
                let derived = IndexedQuestion::derive(question, answer, 0);
                if !derived.is_empty() {
                    groups.push(phrase_group(&derived));
                }
            }
        }

        let indexed = self.train_with_corpus(&corpus)?;
        self.store.sync()?;
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_train_with_corpus_indexes_all_pairs() {
        let store = Arc::new(CorpusStore::new("DMS", None));
        let trainer = Trainer::new(store.clone());

        let mut corpus = PhraseCorpus::new();
        corpus.insert(
            "DMS".into(),
            vec![
                vec!["a?".into(), "a?$$$$x$$$$1".into(), "b?".into(), "b?$$$$x$$$$1".into()],
                vec!["c?".into(), "c?$$$$y$$$$2".into()],
            ],
        );

        assert_eq!(trainer.train_with_corpus(&corpus).unwrap(), 3);
        let index = store.index();
        assert_eq!(index.get("b?").unwrap().answers, vec!["b?$$$$x$$$$1"]);
    }

    #[test]
    fn test_dangling_question_is_rejected() {
        let store = Arc::new(CorpusStore::new("DMS", None));
        let trainer = Trainer::new(store.clone());

        let mut corpus = PhraseCorpus::new();
        corpus.insert("DMS".into(), vec![vec!["a?".into()]]);

        assert!(matches!(
            trainer.train_with_corpus(&corpus),
            Err(Error::Indexing(_))
        ));
        assert!(store.index().is_empty());
    }

    #[test]
    fn test_train_from_files_writes_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("corpus.json");
        let store = Arc::new(CorpusStore::new("offline", Some(path.clone())));
        let trainer = Trainer::new(store.clone());

        let mut data = CorpusFileSet::new();
        data.insert(
            "greetings".into(),
            vec![
                ("hello|hi".into(), "hey there".into()),
                ("how are you".into(), "fine".into()),
            ],
        );

        assert_eq!(trainer.train(&data).unwrap(), 3);
        assert!(path.exists());
        assert_eq!(
            store.index().get("hi?").unwrap().answers,
            vec!["hi?$$$$hey there$$$$0"]
        );
    }
}
