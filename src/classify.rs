//! Inline-prefix classification of finished captures.

use crate::{db::Category, triggers::TriggerTable};

/// Checked in order, case-sensitively; the first hit decides.
const INLINE_PREFIXES: &[(&str, Category)] = &[
    ("todo:", Category::Task),
    ("TODO:", Category::Task),
    ("task:", Category::Task),
    ("t:", Category::Task),
    ("aufgabe:", Category::Task),
    ("tarea:", Category::Task),
    ("note:", Category::Note),
    ("n:", Category::Note),
    ("notiz:", Category::Note),
    ("nota:", Category::Note),
];

const FALLBACK_CATEGORY: Category = Category::Note;

#[derive(Debug, Clone)]
pub struct ClassificationEngine {
    triggers: TriggerTable,
}

impl ClassificationEngine {
    pub fn new(triggers: TriggerTable) -> Self {
        Self { triggers }
    }

    pub fn detect(&self, content: &str, trigger_used: &str) -> Category {
        if let Some((_, category)) = inline_prefix(content) {
            return category;
        }
        self.triggers
            .by_pattern(trigger_used)
            .map(|trigger| trigger.default_category)
            .unwrap_or(FALLBACK_CATEGORY)
    }

    /// Strips one inline prefix and trims. Calling it again changes nothing.
    pub fn clean(&self, content: &str) -> String {
        let trimmed = content.trim();
        match inline_prefix(trimmed) {
            Some((prefix, _)) => trimmed[prefix.len()..].trim().to_string(),
            None => trimmed.to_string(),
        }
    }

    pub fn classify(&self, content: &str, trigger_used: &str) -> (String, Category) {
        (self.clean(content), self.detect(content, trigger_used))
    }
}

fn inline_prefix(content: &str) -> Option<(&'static str, Category)> {
    let trimmed = content.trim();
    INLINE_PREFIXES
        .iter()
        .copied()
        .find(|(prefix, _)| trimmed.starts_with(prefix))
}
