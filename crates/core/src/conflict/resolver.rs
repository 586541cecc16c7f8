//! Conflict resolution policies.
//!
//! The [`ConflictResolver`] turns a detected [`Conflict`] into a
//! [`ConflictResolution`] under one of four modes: deterministic
//! heuristics, a text-completion provider with heuristic fallback, a
//! manual placeholder, or refusal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::text;
use super::types::{
    Conflict, ConflictResolution, ConflictType, ResolutionMode, MANUAL_RESOLUTION_REQUIRED,
};
use crate::ai::TextCompletion;
use crate::errors::ConflictError;

/// Confidence assumed when a completion reply carries none.
const DEFAULT_AI_CONFIDENCE: f64 = 0.7;

/// Which side a heuristic picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Current,
    Incoming,
}

/// Resolves conflicts, optionally backed by a completion provider.
pub struct ConflictResolver {
    completion: Option<Arc<dyn TextCompletion>>,
    ai_fallbacks: AtomicUsize,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// A resolver without a completion provider. `ai` mode degrades to
    /// `auto`.
    pub fn new() -> Self {
        Self {
            completion: None,
            ai_fallbacks: AtomicUsize::new(0),
        }
    }

    pub fn with_completion(completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            completion: Some(completion),
            ai_fallbacks: AtomicUsize::new(0),
        }
    }

    /// How many `ai` resolutions fell back to heuristics so far.
    pub fn ai_fallback_count(&self) -> usize {
        self.ai_fallbacks.load(Ordering::Relaxed)
    }

    /// Resolve one conflict under `mode`.
    ///
    /// Only `abort` fails.
    pub async fn resolve(
        &self,
        conflict: &Conflict,
        mode: ResolutionMode,
    ) -> Result<ConflictResolution, ConflictError> {
        debug!(
            file = %conflict.file,
            line = conflict.line,
            conflict_type = %conflict.conflict_type,
            %mode,
            "resolving conflict"
        );

        match mode {
            ResolutionMode::Abort => Err(ConflictError::ResolutionAborted {
                file: conflict.file.clone(),
            }),
            ResolutionMode::Manual => Ok(ConflictResolution {
                strategy_used: ResolutionMode::Manual,
                chosen_text: MANUAL_RESOLUTION_REQUIRED.to_string(),
                reasoning: "manual resolution requested".into(),
                resolved_by: "manual".into(),
                resolved_at: Utc::now(),
                confidence: 0.0,
                fallback_reason: None,
            }),
            ResolutionMode::Auto => Ok(auto_resolve(conflict)),
            ResolutionMode::Ai => Ok(self.resolve_with_ai(conflict).await),
        }
    }

    /// Resolve every conflict in order, attaching the resolution to each.
    ///
    /// The first refusal stops the batch.
    pub async fn resolve_conflicts(
        &self,
        conflicts: Vec<Conflict>,
        mode: ResolutionMode,
    ) -> Result<Vec<Conflict>, ConflictError> {
        let mut resolved = Vec::with_capacity(conflicts.len());
        for mut conflict in conflicts {
            let resolution = self.resolve(&conflict, mode).await?;
            conflict.resolution = Some(resolution);
            resolved.push(conflict);
        }
        info!(count = resolved.len(), %mode, "conflicts resolved");
        Ok(resolved)
    }

    async fn resolve_with_ai(&self, conflict: &Conflict) -> ConflictResolution {
        let Some(completion) = self.completion.as_ref() else {
            return self.fall_back(conflict, "no completion provider configured".into());
        };

        let prompt = build_prompt(conflict);
        match completion.complete(&prompt).await {
            Ok(reply) => match parse_reply(&reply) {
                Some(parsed) => {
                    info!(
                        file = %conflict.file,
                        confidence = parsed.confidence,
                        "conflict resolved by completion provider"
                    );
                    ConflictResolution {
                        strategy_used: ResolutionMode::Ai,
                        chosen_text: parsed.resolution,
                        reasoning: parsed.reasoning,
                        resolved_by: "ai".into(),
                        resolved_at: Utc::now(),
                        confidence: parsed.confidence,
                        fallback_reason: None,
                    }
                }
                None => {
                    self.fall_back(conflict, "completion reply had no RESOLUTION section".into())
                }
            },
            Err(e) => self.fall_back(conflict, format!("completion failed: {}", e)),
        }
    }

    fn fall_back(&self, conflict: &Conflict, reason: String) -> ConflictResolution {
        self.ai_fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(
            file = %conflict.file,
            line = conflict.line,
            %reason,
            "ai resolution fell back to heuristics"
        );
        let mut resolution = auto_resolve(conflict);
        resolution.fallback_reason = Some(reason);
        resolution
    }
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Resolve with the deterministic heuristic for the conflict's type.
pub fn auto_resolve(conflict: &Conflict) -> ConflictResolution {
    let current = conflict.current_text.as_str();
    let incoming = conflict.incoming_text.as_str();

    let (side, confidence, reasoning) = match conflict.conflict_type {
        ConflictType::Content => resolve_content(current, incoming),
        ConflictType::Structural => resolve_structural(current, incoming),
        ConflictType::Semantic => resolve_semantic(incoming),
        ConflictType::Syntactic => resolve_syntactic(current, incoming),
    };

    let chosen_text = match side {
        Side::Current => current,
        Side::Incoming => incoming,
    };

    ConflictResolution {
        strategy_used: ResolutionMode::Auto,
        chosen_text: chosen_text.to_string(),
        reasoning: reasoning.to_string(),
        resolved_by: "heuristic".into(),
        resolved_at: Utc::now(),
        confidence,
        fallback_reason: None,
    }
}

fn resolve_content(current: &str, incoming: &str) -> (Side, f64, &'static str) {
    if incoming.len() > current.len() && incoming.contains(current.trim()) {
        return (Side::Incoming, 0.8, "incoming extends current content");
    }
    if current.len() > incoming.len() && current.contains(incoming.trim()) {
        return (Side::Current, 0.7, "current already contains incoming content");
    }
    if text::is_import_statement(incoming) {
        return (Side::Incoming, 0.9, "incoming is an import statement");
    }
    (Side::Incoming, 0.5, "defaulting to incoming content")
}

fn resolve_structural(current: &str, incoming: &str) -> (Side, f64, &'static str) {
    let ours = text::structural_token_count(current);
    let theirs = text::structural_token_count(incoming);
    match theirs.cmp(&ours) {
        std::cmp::Ordering::Greater => (Side::Incoming, 0.8, "incoming has more structure"),
        std::cmp::Ordering::Less => (Side::Current, 0.7, "current has more structure"),
        std::cmp::Ordering::Equal => (Side::Incoming, 0.6, "equal structure, taking incoming"),
    }
}

fn resolve_semantic(incoming: &str) -> (Side, f64, &'static str) {
    if text::has_function_declaration(incoming) {
        (Side::Incoming, 0.8, "incoming declares a function")
    } else if text::has_variable_declaration(incoming) {
        (Side::Incoming, 0.7, "incoming declares a variable")
    } else {
        (Side::Incoming, 0.5, "defaulting to incoming declaration")
    }
}

fn resolve_syntactic(current: &str, incoming: &str) -> (Side, f64, &'static str) {
    let checks: [(fn(&str) -> bool, &'static str); 3] = [
        (text::brackets_balanced, "balanced brackets"),
        (text::has_statement_terminators, "statement terminators"),
        (text::has_consistent_indentation, "consistent indentation"),
    ];

    for (check, label) in checks {
        match (check(current), check(incoming)) {
            (false, true) => return (Side::Incoming, 0.9, label),
            (true, false) => return (Side::Current, 0.9, label),
            _ => {}
        }
    }
    (Side::Incoming, 0.6, "no syntactic preference, taking incoming")
}

// ---------------------------------------------------------------------------
// Completion prompt
// ---------------------------------------------------------------------------

fn build_prompt(conflict: &Conflict) -> String {
    format!(
        "You are resolving a conflict while applying a dependency update patch.\n\
         \n\
         File: {file}\n\
         Conflict type: {kind}\n\
         Line: {line}\n\
         Severity: {severity}\n\
         \n\
         Current content:\n```\n{current}\n```\n\
         \n\
         Incoming content:\n```\n{incoming}\n```\n\
         \n\
         Surrounding context:\n```\n{context}\n```\n\
         \n\
         Reply in exactly this format:\n\
         RESOLUTION:\n<the text that should replace the current content>\n\
         REASONING: <one or two sentences>\n\
         CONFIDENCE: <number between 0 and 1>\n",
        file = conflict.file,
        kind = conflict.conflict_type,
        line = conflict.line,
        severity = conflict.severity,
        current = conflict.current_text,
        incoming = conflict.incoming_text,
        context = conflict.context_text,
    )
}

#[derive(Debug, PartialEq)]
struct ParsedReply {
    resolution: String,
    reasoning: String,
    confidence: f64,
}

/// Extract the labelled sections of a completion reply.
///
/// The resolution may span several lines; it runs until the next label.
fn parse_reply(reply: &str) -> Option<ParsedReply> {
    #[derive(Clone, Copy)]
    enum Section {
        None,
        Resolution,
        Reasoning,
    }

    let mut section = Section::None;
    let mut resolution: Option<Vec<&str>> = None;
    let mut reasoning: Vec<&str> = Vec::new();
    let mut confidence = None;

    for line in reply.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("RESOLUTION:") {
            section = Section::Resolution;
            let rest = rest.trim();
            resolution = Some(if rest.is_empty() { Vec::new() } else { vec![rest] });
        } else if let Some(rest) = trimmed.strip_prefix("REASONING:") {
            section = Section::Reasoning;
            reasoning.push(rest.trim());
        } else if let Some(rest) = trimmed.strip_prefix("CONFIDENCE:") {
            section = Section::None;
            confidence = rest.trim().parse::<f64>().ok();
        } else {
            match section {
                Section::Resolution => {
                    if let Some(lines) = resolution.as_mut() {
                        lines.push(line);
                    }
                }
                Section::Reasoning => reasoning.push(line.trim()),
                Section::None => {}
            }
        }
    }

    let resolution = strip_fence(&resolution?.join("\n")).trim_matches('\n').to_string();
    if resolution.trim().is_empty() {
        return None;
    }

    Some(ParsedReply {
        resolution,
        reasoning: reasoning.join(" ").trim().to_string(),
        confidence: confidence
            .filter(|c: &f64| c.is_finite())
            .unwrap_or(DEFAULT_AI_CONFIDENCE)
            .clamp(0.0, 1.0),
    })
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        if let Some(inner) = inner.strip_suffix("```") {
            // Drop the info string on the opening fence line.
            return match inner.find('\n') {
                Some(pos) => &inner[pos + 1..],
                None => inner,
            };
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CompletionError;
    use async_trait::async_trait;

    fn conflict(kind: ConflictType, current: &str, incoming: &str) -> Conflict {
        Conflict::new("src/lib.rs", kind, 3, current, incoming)
    }

    struct Canned(Result<String, ()>);

    #[async_trait]
    impl TextCompletion for Canned {
        async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
            self.0
                .clone()
                .map_err(|_| CompletionError::NotConfigured("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_abort_refuses() {
        let resolver = ConflictResolver::new();
        let c = conflict(ConflictType::Content, "a", "b");
        let err = resolver.resolve(&c, ResolutionMode::Abort).await.unwrap_err();
        assert_eq!(err.to_string(), "resolution aborted for file src/lib.rs");
    }

    #[tokio::test]
    async fn test_manual_placeholder() {
        let resolver = ConflictResolver::new();
        let c = conflict(ConflictType::Content, "a", "b");
        let r = resolver.resolve(&c, ResolutionMode::Manual).await.unwrap();
        assert_eq!(r.chosen_text, MANUAL_RESOLUTION_REQUIRED);
        assert_eq!(r.confidence, 0.0);
        assert!(r.is_placeholder());
    }

    #[test]
    fn test_content_extension() {
        let c = conflict(ConflictType::Content, "serde = \"1\"", "serde = \"1\" # pinned");
        let r = auto_resolve(&c);
        assert_eq!(r.chosen_text, "serde = \"1\" # pinned");
        assert_eq!(r.confidence, 0.8);

        let r = auto_resolve(&conflict(ConflictType::Content, "abc def", "def"));
        assert_eq!(r.chosen_text, "abc def");
        assert_eq!(r.confidence, 0.7);

        let r = auto_resolve(&conflict(ConflictType::Content, "foo", "use x;"));
        assert_eq!(r.confidence, 0.9);

        let r = auto_resolve(&conflict(ConflictType::Content, "alpha", "beta"));
        assert_eq!(r.chosen_text, "beta");
        assert_eq!(r.confidence, 0.5);
    }

    #[test]
    fn test_structural_counts() {
        let r = auto_resolve(&conflict(ConflictType::Structural, "a", "a()"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("a()", 0.8));
        let r = auto_resolve(&conflict(ConflictType::Structural, "f(g())", "f"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("f(g())", 0.7));
        let r = auto_resolve(&conflict(ConflictType::Structural, "(a)", "[b]"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("[b]", 0.6));
    }

    #[test]
    fn test_semantic_prefers_incoming() {
        let r = auto_resolve(&conflict(ConflictType::Semantic, "x", "fn run() {}"));
        assert_eq!(r.confidence, 0.8);
        let r = auto_resolve(&conflict(ConflictType::Semantic, "x", "let y = 1;"));
        assert_eq!(r.confidence, 0.7);
        let r = auto_resolve(&conflict(ConflictType::Semantic, "x", "y"));
        assert_eq!(r.confidence, 0.5);
        assert_eq!(r.chosen_text, "y");
    }

    #[test]
    fn test_syntactic_checks_in_order() {
        let r = auto_resolve(&conflict(ConflictType::Syntactic, "call(a", "call(a)"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("call(a)", 0.9));
        let r = auto_resolve(&conflict(ConflictType::Syntactic, "x = 1;", "x = 1"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("x = 1;", 0.9));
        let r = auto_resolve(&conflict(ConflictType::Syntactic, "a", "b"));
        assert_eq!((r.chosen_text.as_str(), r.confidence), ("b", 0.6));
    }

    #[test]
    fn test_parse_reply_multiline() {
        let reply = "RESOLUTION:\nline one\nline two\nREASONING: keeps both\nCONFIDENCE: 1.7";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.resolution, "line one\nline two");
        assert_eq!(parsed.reasoning, "keeps both");
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn test_parse_reply_defaults_and_fences() {
        let parsed = parse_reply("RESOLUTION: ```toml\nserde = \"2\"\n```").unwrap();
        assert_eq!(parsed.resolution, "serde = \"2\"");
        assert_eq!(parsed.confidence, DEFAULT_AI_CONFIDENCE);
        assert!(parse_reply("I think you should keep it").is_none());
    }

    #[tokio::test]
    async fn test_ai_success() {
        let resolver = ConflictResolver::with_completion(Arc::new(Canned(Ok(
            "RESOLUTION: merged\nREASONING: both\nCONFIDENCE: 0.95".into(),
        ))));
        let c = conflict(ConflictType::Content, "a", "b");
        let r = resolver.resolve(&c, ResolutionMode::Ai).await.unwrap();
        assert_eq!(r.strategy_used, ResolutionMode::Ai);
        assert_eq!(r.chosen_text, "merged");
        assert_eq!(r.confidence, 0.95);
        assert_eq!(resolver.ai_fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_ai_falls_back_on_error() {
        let resolver = ConflictResolver::with_completion(Arc::new(Canned(Err(()))));
        let c = conflict(ConflictType::Content, "a", "a + b");
        let r = resolver.resolve(&c, ResolutionMode::Ai).await.unwrap();
        assert_eq!(r.strategy_used, ResolutionMode::Auto);
        assert_eq!(r.chosen_text, "a + b");
        assert!(r.fallback_reason.unwrap().contains("completion failed"));
        assert_eq!(resolver.ai_fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_ai_without_provider() {
        let resolver = ConflictResolver::new();
        let c = conflict(ConflictType::Content, "a", "b");
        let r = resolver.resolve(&c, ResolutionMode::Ai).await.unwrap();
        assert_eq!(
            r.fallback_reason.as_deref(),
            Some("no completion provider configured")
        );
    }

    #[tokio::test]
    async fn test_batch_stops_at_abort() {
        let resolver = ConflictResolver::new();
        let batch = vec![
            conflict(ConflictType::Content, "a", "b"),
            conflict(ConflictType::Content, "c", "d"),
        ];
        let out = resolver
            .resolve_conflicts(batch.clone(), ResolutionMode::Auto)
            .await
            .unwrap();
        assert!(out.iter().all(|c| c.is_resolved()));
        assert!(resolver
            .resolve_conflicts(batch, ResolutionMode::Abort)
            .await
            .is_err());
    }
}
