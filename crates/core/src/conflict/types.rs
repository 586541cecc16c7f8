//! Conflict and resolution types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConflictError;

/// Chosen text of a manual-mode placeholder resolution.
pub const MANUAL_RESOLUTION_REQUIRED: &str = "MANUAL_RESOLUTION_REQUIRED";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Plain text disagreement.
    Content,
    /// The two sides differ in bracket/brace structure.
    Structural,
    /// Declarations (functions, variables) are involved.
    Semantic,
    /// At least one side is not well-formed.
    Syntactic,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::Structural => write!(f, "structural"),
            Self::Semantic => write!(f, "semantic"),
            Self::Syntactic => write!(f, "syntactic"),
        }
    }
}

/// How bad a conflict is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Policy governing how conflicts are resolved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Deterministic heuristics.
    #[default]
    Auto,
    /// Ask the completion provider, fall back to heuristics.
    Ai,
    /// Leave a placeholder for a human.
    Manual,
    /// Refuse; the patch must stop.
    Abort,
}

impl std::fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Ai => write!(f, "ai"),
            Self::Manual => write!(f, "manual"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

impl FromStr for ResolutionMode {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "ai" => Ok(Self::Ai),
            "manual" => Ok(Self::Manual),
            "abort" => Ok(Self::Abort),
            other => Err(ConflictError::UnknownMode(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictResolution {
    pub strategy_used: ResolutionMode,
    pub chosen_text: String,
    pub reasoning: String,
    /// `heuristic`, `ai` or `manual`.
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub confidence: f64,
    /// Why an AI resolution degraded to heuristics, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl ConflictResolution {
    /// Whether this is the manual-mode placeholder rather than real content.
    pub fn is_placeholder(&self) -> bool {
        self.strategy_used == ResolutionMode::Manual
            && self.chosen_text == MANUAL_RESOLUTION_REQUIRED
    }
}

/// A mismatch between a change's expected prior content and the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub file: String,
    pub conflict_type: ConflictType,
    /// 1-indexed; 0 when the change could not be located at all.
    pub line: usize,
    /// What the file holds at the location.
    pub current_text: String,
    /// What the change wants to write.
    pub incoming_text: String,
    /// A few lines around the location.
    pub context_text: String,
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default)]
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Create a new unresolved conflict with a fresh UUID.
    pub fn new(
        file: impl Into<String>,
        conflict_type: ConflictType,
        line: usize,
        current_text: impl Into<String>,
        incoming_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file: file.into(),
            conflict_type,
            line,
            current_text: current_text.into(),
            incoming_text: incoming_text.into(),
            context_text: String::new(),
            severity: Severity::Medium,
            confidence: 0.5,
            resolution: None,
        }
    }

    /// Resolved with real content (manual placeholders do not count).
    pub fn is_resolved(&self) -> bool {
        self.resolution
            .as_ref()
            .map(|r| !r.is_placeholder())
            .unwrap_or(false)
    }
}
