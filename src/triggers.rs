use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Category;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    pub id: String,
    /// Non-empty, no whitespace.
    pub pattern: String,
    pub default_category: Category,
    pub enabled: bool,
    /// Timer triggers hand their text to the calendar collaborator instead of the store.
    #[serde(default)]
    pub is_timer_trigger: bool,
}

impl TriggerDefinition {
    pub fn new(pattern: &str, default_category: Category) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            default_category,
            enabled: true,
            is_timer_trigger: false,
        }
    }

    pub fn timer(pattern: &str, default_category: Category) -> Self {
        Self {
            is_timer_trigger: true,
            ..Self::new(pattern, default_category)
        }
    }

    pub fn pattern_len(&self) -> usize {
        self.pattern.chars().count()
    }
}

/// Enabled triggers in configuration order.
#[derive(Debug, Clone, Default)]
pub struct TriggerTable {
    enabled: Vec<TriggerDefinition>,
    longest: usize,
}

impl TriggerTable {
    pub fn new(definitions: impl IntoIterator<Item = TriggerDefinition>) -> Self {
        let enabled: Vec<TriggerDefinition> = definitions
            .into_iter()
            .filter(|definition| definition.enabled && !definition.pattern.is_empty())
            .collect();
        let longest = enabled
            .iter()
            .map(TriggerDefinition::pattern_len)
            .max()
            .unwrap_or(0);
        Self { enabled, longest }
    }

    pub fn enabled_triggers(&self) -> &[TriggerDefinition] {
        &self.enabled
    }

    pub fn longest_pattern_length(&self) -> usize {
        self.longest
    }

    /// First enabled trigger, in configuration order, whose pattern ends `buffer`.
    pub fn find_match(&self, buffer: &str) -> Option<&TriggerDefinition> {
        self.enabled
            .iter()
            .find(|definition| buffer.ends_with(definition.pattern.as_str()))
    }

    pub fn by_pattern(&self, pattern: &str) -> Option<&TriggerDefinition> {
        self.enabled
            .iter()
            .find(|definition| definition.pattern == pattern)
    }
}
