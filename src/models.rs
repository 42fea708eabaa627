//! Core data model for the theme evolution engine

use serde::{Deserialize, Serialize};

/// A single survey response; immutable once ingested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: Option<i64>,
    pub batch_id: i64,
    pub question: String,
    pub text: String,
    /// Unit vector, or the zero vector for empty input
    pub embedding: Vec<f32>,
}

/// Lifecycle state of a theme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeStatus {
    Active,
    Merged,
    Split,
    Retired,
}

impl ThemeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeStatus::Active => "active",
            ThemeStatus::Merged => "merged",
            ThemeStatus::Split => "split",
            ThemeStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ThemeStatus::Active),
            "merged" => Some(ThemeStatus::Merged),
            "split" => Some(ThemeStatus::Split),
            "retired" => Some(ThemeStatus::Retired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ThemeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a theme came into existence; stored in the metadata column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ThemeOrigin {
    /// Proposed by the extractor from batch responses
    Extracted { model: String, batch_id: i64 },
    /// Child promoted from a split of `parent_id`
    SplitChild { parent_id: i64, cluster: usize },
    /// Survivor of a merge that absorbed `absorbed_id`
    MergeSurvivor { absorbed_id: i64 },
    /// Inserted directly (fixtures, imports)
    Seeded,
}

/// An extracted theme in the living catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
    /// Unit vector in the same space as response embeddings
    pub embedding: Vec<f32>,
    pub status: ThemeStatus,
    pub created_at_batch: i64,
    pub last_updated_batch: i64,
    pub parent_theme_id: Option<i64>,
    pub response_count: i64,
    pub metadata: ThemeOrigin,
}

impl Theme {
    /// The text a theme is embedded from
    pub fn embedding_text(name: &str, description: &str) -> String {
        format!("{name}: {description}")
    }
}

/// A phrase that explains part of a response/theme similarity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HighlightedKeyword {
    pub keyword: String,
    pub score: f32,
    /// Character offsets of every occurrence in the response text
    pub positions: Vec<usize>,
}

/// Junction row linking a response to a theme
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeAssignment {
    pub id: Option<i64>,
    pub response_id: i64,
    pub theme_id: i64,
    /// Cosine similarity at assignment time, clamped to [0, 1]
    pub confidence: f32,
    pub highlighted_keywords: Vec<HighlightedKeyword>,
    pub assigned_at_batch: i64,
    pub last_updated_batch: i64,
}

/// Kind of catalog mutation recorded in the evolution log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionAction {
    Created,
    Updated,
    Merged,
    Split,
    Retired,
    Reassigned,
}

impl EvolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionAction::Created => "created",
            EvolutionAction::Updated => "updated",
            EvolutionAction::Merged => "merged",
            EvolutionAction::Split => "split",
            EvolutionAction::Retired => "retired",
            EvolutionAction::Reassigned => "reassigned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EvolutionAction::Created),
            "updated" => Some(EvolutionAction::Updated),
            "merged" => Some(EvolutionAction::Merged),
            "split" => Some(EvolutionAction::Split),
            "retired" => Some(EvolutionAction::Retired),
            "reassigned" => Some(EvolutionAction::Reassigned),
            _ => None,
        }
    }
}

impl std::fmt::Display for EvolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload of an evolution record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EvolutionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_shift: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub child_theme_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Append-only record of a catalog mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEntry {
    pub id: Option<i64>,
    pub batch_id: i64,
    pub action: EvolutionAction,
    pub theme_id: i64,
    pub related_theme_id: Option<i64>,
    pub affected_response_count: i64,
    pub details: EvolutionDetails,
}

/// One row per processed batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: i64,
    pub question: String,
    pub total_responses: i64,
    pub new_themes_count: i64,
    pub updated_themes_count: i64,
    pub deleted_themes_count: i64,
    pub processing_time_seconds: f64,
}

/// Input format for one batch of responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchData {
    pub batch_id: i64,
    pub question: String,
    pub responses: Vec<String>,
}

/// Outcome of processing one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: i64,
    pub question: String,
    pub processing_time_seconds: f64,
    pub total_responses: usize,
    pub themes_created: usize,
    pub themes_updated: usize,
    pub themes_deleted: usize,
    /// Evolution records appended during this batch, in append order
    pub evolution: Vec<EvolutionEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ThemeStatus::Active,
            ThemeStatus::Merged,
            ThemeStatus::Split,
            ThemeStatus::Retired,
        ] {
            assert_eq!(ThemeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ThemeStatus::parse("deleted"), None);
    }

    #[test]
    fn action_round_trips_through_strings() {
        for action in [
            EvolutionAction::Created,
            EvolutionAction::Updated,
            EvolutionAction::Merged,
            EvolutionAction::Split,
            EvolutionAction::Retired,
            EvolutionAction::Reassigned,
        ] {
            assert_eq!(EvolutionAction::parse(action.as_str()), Some(action));
        }
    }

    #[test]
    fn theme_origin_serializes_tagged() {
        let origin = ThemeOrigin::SplitChild {
            parent_id: 7,
            cluster: 1,
        };
        let json = serde_json::to_string(&origin).unwrap();
        assert!(json.contains("\"origin\":\"split_child\""));
        let back: ThemeOrigin = serde_json::from_str(&json).unwrap();
        assert_eq!(back, origin);
    }

    #[test]
    fn theme_embedding_text_convention() {
        assert_eq!(
            Theme::embedding_text("API Challenges", "Problems with APIs"),
            "API Challenges: Problems with APIs"
        );
    }
}
