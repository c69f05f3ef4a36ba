//! Question normalization and the composite answer token.
//!
//! A stored question may hold several phrasings separated by `|`, `｜` or
//! line breaks. Each phrasing is indexed on its own, always ending in a
//! question mark, and maps to an [`AnswerToken`] that carries the phrasing,
//! the answer and the originating corpus id.
//!
//! The token's wire form is `question$$$$answer$$$$id`, which is what the
//! match engine hands back and what the persisted snapshot stores.

use std::fmt;

use crate::error::{Error, Result};
use crate::models::CorpusEntry;

/// Delimiter joining the three fields of an encoded [`AnswerToken`].
pub const TOKEN_DELIMITER: &str = "$$$$";

const PHRASE_SEPARATORS: [char; 4] = ['|', '｜', '\r', '\n'];

/// Returns `true` if the text already ends with `?` or `？`.
pub fn has_question_mark(text: &str) -> bool {
    text.ends_with('?') || text.ends_with('？')
}

/// Strips trailing `?`/`？` marks.
pub fn strip_question_mark(text: &str) -> &str {
    text.trim_end_matches(|c: char| c == '?' || c == '？')
}

/// Appends an ASCII `?` unless the text already ends with a question mark.
pub fn ensure_question_mark(text: &str) -> String {
    if has_question_mark(text) {
        text.to_string()
    } else {
        format!("{}?", text)
    }
}

/// Splits a raw question into its normalized phrasings.
///
/// Blank pieces are dropped; surrounding whitespace is trimmed. A piece
/// containing [`TOKEN_DELIMITER`] cannot be encoded and is dropped too.
pub fn split_phrasings(raw: &str) -> Vec<String> {
    raw.split(&PHRASE_SEPARATORS[..])
        .map(str::trim)
        .filter(|p| !strip_question_mark(p).trim().is_empty())
        .filter(|p| !p.contains(TOKEN_DELIMITER))
        .map(ensure_question_mark)
        .collect()
}

/// Rejects a question whose text would not survive a token round trip.
pub fn validate_question(question: &str) -> Result<()> {
    if question.contains(TOKEN_DELIMITER) {
        return Err(Error::invalid(format!(
            "question must not contain {:?}",
            TOKEN_DELIMITER
        )));
    }
    Ok(())
}

/// The `(question, answer, id)` triple the match engine returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerToken {
    pub question: String,
    pub answer: String,
    pub id: i64,
}

impl AnswerToken {
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.question, TOKEN_DELIMITER, self.answer, TOKEN_DELIMITER, self.id
        )
    }

    /// Splits an encoded token back into its fields.
    ///
    /// The question ends at the first delimiter and the id starts after the
    /// last one, so answers may themselves contain the delimiter.
    pub fn decode(token: &str) -> Result<Self> {
        let malformed = || Error::Indexing(format!("malformed answer token: {:?}", token));

        let (question, rest) = token.split_once(TOKEN_DELIMITER).ok_or_else(malformed)?;
        let (answer, id) = rest.rsplit_once(TOKEN_DELIMITER).ok_or_else(malformed)?;
        let id = id.trim().parse::<i64>().map_err(|_| malformed())?;

        Ok(Self {
            question: question.to_string(),
            answer: answer.to_string(),
            id,
        })
    }
}

impl fmt::Display for AnswerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One index-ready phrasing of a corpus entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedQuestion {
    pub question: String,
    pub token: String,
}

impl IndexedQuestion {
    /// Derives every indexable phrasing of `question` for an answer.
    pub fn derive(question: &str, answer: &str, id: i64) -> Vec<Self> {
        split_phrasings(question)
            .into_iter()
            .map(|phrasing| {
                let token = AnswerToken {
                    question: phrasing.clone(),
                    answer: answer.to_string(),
                    id,
                }
                .encode();
                Self {
                    question: phrasing,
                    token,
                }
            })
            .collect()
    }

    pub fn from_entry(entry: &CorpusEntry) -> Vec<Self> {
        Self::derive(&entry.question, &entry.answer, entry.id)
    }
}

/// Flattens indexed questions into the alternating `[question, token, ...]`
/// phrase group the trainer consumes.
pub fn phrase_group(questions: &[IndexedQuestion]) -> Vec<String> {
    questions
        .iter()
        .flat_map(|q| [q.question.clone(), q.token.clone()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_all_separators() {
        let phrasings = split_phrasings("how to deploy|部署失败｜deploy failed\r\nrollback?");
        assert_eq!(
            phrasings,
            vec!["how to deploy?", "部署失败?", "deploy failed?", "rollback?"]
        );
    }

    #[test]
    fn test_every_phrasing_ends_with_question_mark() {
        let inputs = [
            "a|b||c",
            "\n\nonly newline\n",
            "full width？|ascii?|none",
            "｜｜",
            "a|?|？？",
            "",
        ];
        for input in inputs {
            for p in split_phrasings(input) {
                assert!(has_question_mark(&p), "{:?} from {:?}", p, input);
                assert!(!strip_question_mark(&p).trim().is_empty());
            }
        }
    }

    #[test]
    fn test_delimiter_phrasing_is_dropped() {
        assert_eq!(
            split_phrasings("price $$$$ tier|pricing tiers"),
            vec!["pricing tiers?"]
        );
        assert!(validate_question("price $$$$ tier").is_err());
        assert!(validate_question("price $$$ tier").is_ok());
    }

    #[test]
    fn test_full_width_mark_is_kept() {
        assert_eq!(ensure_question_mark("slow deploy？"), "slow deploy？");
        assert_eq!(ensure_question_mark("slow deploy"), "slow deploy?");
    }

    #[test]
    fn test_token_decode() {
        let token = AnswerToken {
            question: "slow deploy？".into(),
            answer: "check logs".into(),
            id: 1,
        };
        assert_eq!(token.encode(), "slow deploy？$$$$check logs$$$$1");
        assert_eq!(AnswerToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn test_token_answer_may_contain_delimiter() {
        let decoded = AnswerToken::decode("q?$$$$price is $$$$5$$$$42").unwrap();
        assert_eq!(decoded.question, "q?");
        assert_eq!(decoded.answer, "price is $$$$5");
        assert_eq!(decoded.id, 42);
    }

    #[test]
    fn test_token_decode_rejects_garbage() {
        assert!(matches!(
            AnswerToken::decode("no delimiters"),
            Err(Error::Indexing(_))
        ));
        assert!(AnswerToken::decode("q$$$$a$$$$not-a-number").is_err());
        assert!(AnswerToken::decode("q$$$$a").is_err());
    }

    #[test]
    fn test_derive_builds_one_token_per_phrasing() {
        let derived = IndexedQuestion::derive("a|b", "ans", 7);
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0].question, "a?");
        assert_eq!(derived[0].token, "a?$$$$ans$$$$7");
        assert_eq!(derived[1].token, "b?$$$$ans$$$$7");
        assert_eq!(
            phrase_group(&derived),
            vec!["a?", "a?$$$$ans$$$$7", "b?", "b?$$$$ans$$$$7"]
        );
    }
}
