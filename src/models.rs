//! Core data models used throughout the corpus bot.
//!
//! These types mirror the rows kept in durable storage (projects, corpus
//! entries, feedback) plus the filter used to list them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tenant. The `config` column holds the serialized
/// [`ProjectConfig`](crate::config::ProjectConfig).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub config: String,
}

/// What a corpus entry is used for. Only [`CorpusKind::Qa`] rows are indexed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CorpusKind {
    #[default]
    Qa,
    Requirement,
    LogRule,
}

impl CorpusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusKind::Qa => "qa",
            CorpusKind::Requirement => "requirement",
            CorpusKind::LogRule => "log_rule",
        }
    }
}

/// Workflow status of an entry. Curated answers live in `Custom`; open
/// requirements move from `Received` to `Handled` or `Rejected`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Custom,
    Received,
    Handled,
    Rejected,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Custom => "custom",
            WorkflowState::Received => "received",
            WorkflowState::Handled => "handled",
            WorkflowState::Rejected => "rejected",
        }
    }
}

macro_rules! impl_str_enum {
    ($ty:ty, $what:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v: &$ty| v.as_str() == s)
                    .ok_or_else(|| format!("unknown {}: '{}'", $what, s))
            }
        }
    };
}

impl_str_enum!(
    CorpusKind,
    "corpus kind",
    [CorpusKind::Qa, CorpusKind::Requirement, CorpusKind::LogRule]
);
impl_str_enum!(
    WorkflowState,
    "workflow state",
    [
        WorkflowState::Custom,
        WorkflowState::Received,
        WorkflowState::Handled,
        WorkflowState::Rejected,
    ]
);

/// A question/answer row. `id == 0` means "not yet assigned by storage".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorpusEntry {
    pub id: i64,
    pub project: String,
    pub class: String,
    pub question: String,
    pub answer: String,
    pub sample: String,
    pub creator: String,
    pub principal: String,
    pub reviser: String,
    pub accept_count: i64,
    pub reject_count: i64,
    pub kind: CorpusKind,
    pub state: WorkflowState,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CorpusEntry {
    /// A curated Q&A entry with everything else defaulted.
    pub fn qa(
        project: impl Into<String>,
        class: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            class: class.into(),
            question: question.into(),
            answer: answer.into(),
            ..Default::default()
        }
    }

    pub fn is_indexable(&self) -> bool {
        self.kind == CorpusKind::Qa && self.state == WorkflowState::Custom
    }
}

/// A record of what a user asked and what they were shown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Feedback {
    pub id: i64,
    /// Corpus entry shown, or 0 when nothing matched.
    pub cid: i64,
    pub project: String,
    pub class: String,
    pub question: String,
    pub answer: String,
    pub created_at: i64,
}

/// Which feedback counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Accept,
    Reject,
}

impl Counter {
    pub fn from_accepted(accepted: bool) -> Self {
        if accepted {
            Counter::Accept
        } else {
            Counter::Reject
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Counter::Accept => "accept_count",
            Counter::Reject => "reject_count",
        }
    }
}

/// Equality filter over corpus rows. Unset fields match everything;
/// `search` is a substring match on the question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusFilter {
    pub id: Option<i64>,
    pub project: Option<String>,
    pub class: Option<String>,
    pub question: Option<String>,
    pub search: Option<String>,
    pub kind: Option<CorpusKind>,
    pub state: Option<WorkflowState>,
}

impl CorpusFilter {
    pub fn project(name: impl Into<String>) -> Self {
        Self {
            project: Some(name.into()),
            ..Default::default()
        }
    }

    /// The rows a resync loads: indexable Q&A entries of one project.
    pub fn indexable(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            kind: Some(CorpusKind::Qa),
            state: Some(WorkflowState::Custom),
            ..Default::default()
        }
    }

    pub fn matches(&self, row: &CorpusEntry) -> bool {
        self.id.map_or(true, |id| row.id == id)
            && self.project.as_ref().map_or(true, |p| &row.project == p)
            && self.class.as_ref().map_or(true, |c| &row.class == c)
            && self.question.as_ref().map_or(true, |q| &row.question == q)
            && self
                .search
                .as_ref()
                .map_or(true, |s| row.question.contains(s.as_str()))
            && self.kind.map_or(true, |k| row.kind == k)
            && self.state.map_or(true, |s| row.state == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [CorpusKind::Qa, CorpusKind::Requirement, CorpusKind::LogRule] {
            assert_eq!(kind.as_str().parse::<CorpusKind>().unwrap(), kind);
        }
        assert!("faq".parse::<CorpusKind>().is_err());
    }

    #[test]
    fn test_indexable_filter() {
        let filter = CorpusFilter::indexable("DMS");
        let mut row = CorpusEntry::qa("DMS", "ops", "slow deploy？", "check logs");
        assert!(filter.matches(&row));

        row.state = WorkflowState::Received;
        assert!(!filter.matches(&row));

        row.state = WorkflowState::Custom;
        row.kind = CorpusKind::Requirement;
        assert!(!filter.matches(&row));
    }

    #[test]
    fn test_search_is_substring() {
        let filter = CorpusFilter {
            search: Some("deploy".into()),
            ..Default::default()
        };
        assert!(filter.matches(&CorpusEntry::qa("p", "c", "slow deploy?", "a")));
        assert!(!filter.matches(&CorpusEntry::qa("p", "c", "slow build?", "a")));
    }
}
