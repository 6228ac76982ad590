//! Persisted capture records.

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::{Enrichment, Metadata};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Task,
    Note,
    /// Legacy, read-only. Never produced by classification.
    Idea,
    /// Legacy, read-only. Never produced by classification.
    Reminder,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Task => "task",
            Category::Note => "note",
            Category::Idea => "idea",
            Category::Reminder => "reminder",
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Category::Task)
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Note
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    Open,
    Done,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Open => "open",
            RecordStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub category: Category,
    pub content: String,
    /// Insertion-ordered, no duplicates.
    pub tags: IndexSet<String>,
    pub source_app: Option<String>,
    pub trigger_used: String,
    pub created_at: DateTime<Utc>,
    /// Only meaningful for tasks.
    pub status: RecordStatus,
    /// Only meaningful for tasks.
    pub priority: Option<Priority>,
    pub metadata: Option<Metadata>,
    pub enrichment: Option<Enrichment>,
}

impl Record {
    /// Builds a freshly captured record with a new id and `created_at = now`.
    pub fn from_capture(content: String, category: Category, trigger_used: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category,
            content,
            tags: IndexSet::new(),
            source_app: None,
            trigger_used: trigger_used.to_string(),
            created_at: Utc::now(),
            status: RecordStatus::Open,
            priority: category.is_task().then_some(Priority::Medium),
            metadata: None,
            enrichment: None,
        }
    }

    pub fn needs_processing(&self) -> bool {
        self.enrichment.is_none()
    }

    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.content.to_lowercase().contains(&needle)
            || self
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&needle))
    }
}

/// Conjunctive filter; `None` fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub category: Option<Category>,
    pub status: Option<RecordStatus>,
    pub priority: Option<Priority>,
}
