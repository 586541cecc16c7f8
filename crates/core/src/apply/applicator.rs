//! Patch set orchestration.
//!
//! [`PatchApplicator`] drives one `apply_patches` invocation through a small
//! state machine:
//!
//! 1. Take a rollback point covering every patch target (optional).
//! 2. Apply the patches under the requested strategy. Each patch is planned
//!    completely before anything is written.
//! 3. Run the build and test commands (optional).
//! 4. Summarise, and restore the rollback point when the batch failed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::changes::{PlanError, Planner};
use super::grouping::plan_waves;
use crate::ai::{OpenAiCompatibleClient, TextCompletion};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::conflict::{Conflict, ConflictResolver};
use crate::errors::{ApplyError, ConflictError};
use crate::models::{
    AppliedPatch, ApplicationOptions, ApplicationRequest, ApplicationResult, ApplicationStrategy,
    ApplicationSummary, ApplyState, FailedPatch, FailureReason, Patch, ValidationResult,
};
use crate::rollback::{RollbackManager, RollbackPoint};
use crate::validation::Validator;

/// Receives the result of every invocation that asked for a notification.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_complete(&self, result: &ApplicationResult);
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

struct StateTracker {
    state: ApplyState,
    history: Vec<ApplyState>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: ApplyState::Pending,
            history: vec![ApplyState::Pending],
        }
    }

    fn advance(&mut self, next: ApplyState) -> Result<(), ApplyError> {
        if !self.state.can_transition_to(next) {
            return Err(ApplyError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "apply state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-patch outcomes
// ---------------------------------------------------------------------------

enum PatchOutcome {
    Applied(AppliedPatch),
    Failed(FailedPatch),
    Aborted {
        patch_id: String,
        source: ConflictError,
    },
}

struct Aborted {
    patch_id: String,
    source: ConflictError,
}

#[derive(Default)]
struct RunOutcome {
    applied: Vec<AppliedPatch>,
    failed: Vec<FailedPatch>,
    validation_results: Vec<ValidationResult>,
}

impl RunOutcome {
    fn record(&mut self, outcome: PatchOutcome) -> Result<(), Aborted> {
        match outcome {
            PatchOutcome::Applied(applied) => {
                info!(
                    patch_id = %applied.patch_id,
                    files = applied.files_changed.len(),
                    "patch applied"
                );
                self.applied.push(applied);
            }
            PatchOutcome::Failed(failed) => {
                warn!(
                    patch_id = %failed.patch_id,
                    reason = %failed.reason,
                    error = %failed.error,
                    "patch failed"
                );
                self.failed.push(failed);
            }
            PatchOutcome::Aborted { patch_id, source } => return Err(Aborted { patch_id, source }),
        }
        Ok(())
    }

    fn cancel<'p>(&mut self, rest: impl IntoIterator<Item = &'p Patch>) {
        for patch in rest {
            let reason = FailureReason::Cancelled;
            self.failed.push(failed(patch, reason, "cancelled before start", Vec::new()));
        }
    }
}

fn failed(
    patch: &Patch,
    reason: FailureReason,
    error: impl Into<String>,
    conflicts: Vec<Conflict>,
) -> FailedPatch {
    FailedPatch {
        patch_id: patch.id.clone(),
        reason,
        error: error.into(),
        conflicts,
    }
}

/// Resolver and validator, shared with parallel workers.
struct Shared {
    resolver: ConflictResolver,
    validator: Validator,
}

/// Plan and write one patch.
async fn apply_one(
    shared: &Shared,
    repo: &Path,
    patch: &Patch,
    options: &ApplicationOptions,
) -> PatchOutcome {
    let started = Instant::now();
    let planner = Planner {
        repo,
        resolver: &shared.resolver,
        mode: options.conflict_resolution,
        auto_resolve: options.auto_resolve_conflicts,
    };

    let plan = match planner.plan(patch).await {
        Ok(plan) => plan,
        Err(PlanError::Change(e)) => {
            let reason = FailureReason::ApplicationError;
            return PatchOutcome::Failed(failed(patch, reason, e.to_string(), Vec::new()));
        }
        Err(PlanError::Unresolved { reason, conflicts }) => {
            let message = format!("{} conflict(s) need resolution", conflicts.len());
            return PatchOutcome::Failed(failed(patch, reason, message, conflicts));
        }
        Err(PlanError::Aborted { source, .. }) => {
            return PatchOutcome::Aborted {
                patch_id: patch.id.clone(),
                source,
            }
        }
    };

    if options.dry_run {
        return PatchOutcome::Applied(AppliedPatch {
            patch_id: patch.id.clone(),
            files_changed: plan.changed_paths(),
            preview: Some(plan.preview()),
            conflicts: plan.conflicts,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: 0,
        });
    }

    match plan
        .write(options.max_retries, Duration::from_millis(options.retry_delay_ms))
        .await
    {
        Ok((files_changed, attempts)) => PatchOutcome::Applied(AppliedPatch {
            patch_id: patch.id.clone(),
            files_changed,
            conflicts: plan.conflicts,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            preview: None,
        }),
        Err(e) => {
            let reason = FailureReason::ApplicationError;
            PatchOutcome::Failed(failed(patch, reason, e.to_string(), plan.conflicts))
        }
    }
}

// ---------------------------------------------------------------------------
// Applicator
// ---------------------------------------------------------------------------

/// Applies patch sets to repositories.
pub struct PatchApplicator {
    config: AppConfig,
    shared: Arc<Shared>,
    rollback: RollbackManager,
    listener: Option<Arc<dyn CompletionListener>>,
}

impl PatchApplicator {
    /// Build from configuration. When `[ai]` is enabled the resolver talks to
    /// the configured endpoint.
    pub fn new(config: AppConfig) -> Self {
        let resolver = match OpenAiCompatibleClient::from_config(&config.ai) {
            Some(client) => ConflictResolver::with_completion(Arc::new(client)),
            None => ConflictResolver::new(),
        };
        info!(
            ai = config.ai.enabled,
            strategy = %config.apply.strategy,
            "initializing patch applicator"
        );
        Self {
            shared: Arc::new(Shared {
                resolver,
                validator: Validator::new(config.validation.clone()),
            }),
            rollback: RollbackManager::new(config.rollback.clone()),
            listener: None,
            config,
        }
    }

    /// Use `completion` for `ai` resolutions.
    pub fn with_completion(mut self, completion: Arc<dyn TextCompletion>) -> Self {
        self.shared = Arc::new(Shared {
            resolver: ConflictResolver::with_completion(completion),
            validator: self.shared.validator.clone(),
        });
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Timestamp rollback points with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.rollback = RollbackManager::with_clock(self.config.rollback.clone(), clock);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.shared.resolver
    }

    /// A request for `patches` carrying the configured strategy and option
    /// defaults.
    pub fn request(
        &self,
        repo_path: impl Into<std::path::PathBuf>,
        branch: &str,
        patches: Vec<Patch>,
    ) -> ApplicationRequest {
        ApplicationRequest {
            repo_path: repo_path.into(),
            branch: branch.to_string(),
            patches,
            strategy: self.config.apply.strategy,
            options: self.config.apply.to_options(),
        }
    }

    pub async fn apply_patches(
        &self,
        request: ApplicationRequest,
    ) -> Result<ApplicationResult, ApplyError> {
        self.apply_patches_with_cancel(request, CancellationToken::new()).await
    }

    /// Apply `request`, stopping between patches once `cancel` fires.
    ///
    /// Per-patch failures land in the result. Errors are reserved for an
    /// unusable request, a failed snapshot, an `abort` resolution and a
    /// failed rollback.
    #[instrument(
        skip(self, request, cancel),
        fields(repo = %request.repo_path.display(), patches = request.patches.len())
    )]
    pub async fn apply_patches_with_cancel(
        &self,
        request: ApplicationRequest,
        cancel: CancellationToken,
    ) -> Result<ApplicationResult, ApplyError> {
        let started = Instant::now();
        let mut tracker = StateTracker::new();
        let repo = request.repo_path.as_path();
        let options = &request.options;

        if !repo.is_dir() {
            return Err(ApplyError::InvalidRequest(format!(
                "repository path '{}' is not a directory",
                repo.display()
            )));
        }

        let strategy = self.select_strategy(request.strategy, &request.patches);
        info!(
            requested = %request.strategy,
            %strategy,
            dry_run = options.dry_run,
            "applying patch set"
        );

        let point = if options.create_backup && !options.dry_run {
            let targets: Vec<String> =
                request.patches.iter().flat_map(Patch::target_paths).collect();
            let point = self
                .rollback
                .create_rollback_point_for(repo, &request.branch, &targets)
                .map_err(ApplyError::SnapshotFailed)?;
            tracker.advance(ApplyState::SnapshotTaken)?;
            Some(point)
        } else {
            None
        };

        tracker.advance(ApplyState::Applying)?;
        let run = match strategy {
            ApplicationStrategy::Sequential | ApplicationStrategy::Adaptive => {
                let order: Vec<usize> = (0..request.patches.len()).collect();
                self.run_in_order(repo, &request.patches, &order, options, &cancel).await
            }
            ApplicationStrategy::Optimized => {
                let mut order: Vec<usize> = (0..request.patches.len()).collect();
                order.sort_by(|a, b| {
                    request.patches[*b]
                        .confidence
                        .partial_cmp(&request.patches[*a].confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                self.run_in_order(repo, &request.patches, &order, options, &cancel).await
            }
            ApplicationStrategy::Parallel => {
                self.run_parallel(repo, &request.patches, options, &cancel).await
            }
            ApplicationStrategy::Conservative => {
                self.run_conservative(repo, &request.patches, options, &cancel).await
            }
        };

        let mut run = match run {
            Ok(run) => run,
            Err(aborted) => {
                error!(
                    patch_id = %aborted.patch_id,
                    error = %aborted.source,
                    "conflict resolution aborted"
                );
                if let (Some(point), true) = (&point, options.rollback_on_failure) {
                    tracker.advance(ApplyState::RolledBack)?;
                    self.restore(point)?;
                }
                return Err(ApplyError::ResolutionAborted {
                    patch_id: aborted.patch_id,
                    source: aborted.source,
                });
            }
        };

        let mut post_validation_failed = false;
        if options.validate_after_apply && !options.dry_run {
            tracker.advance(ApplyState::Validating)?;
            let results = self.shared.validator.post_apply(repo).await;
            post_validation_failed = results.iter().any(|r| !r.passed);
            run.validation_results.extend(results);
        }

        let conflicts: Vec<Conflict> = run
            .applied
            .iter()
            .flat_map(|a| a.conflicts.iter().cloned())
            .chain(run.failed.iter().flat_map(|f| f.conflicts.iter().cloned()))
            .collect();
        let summary = ApplicationSummary::compute(&run.applied, &run.failed, &conflicts);
        let success = summary.is_success() && !post_validation_failed;

        let mut rollback_report = None;
        if !success && options.rollback_on_failure {
            if let Some(point) = &point {
                tracker.advance(ApplyState::RolledBack)?;
                rollback_report = Some(self.restore(point)?);
            }
        }
        tracker.advance(ApplyState::Done)?;

        let recommendations = recommendations(&summary, &run.validation_results);
        let result = ApplicationResult {
            success,
            strategy,
            state: tracker.state,
            state_history: tracker.history,
            applied: run.applied,
            failed: run.failed,
            conflicts,
            validation_results: run.validation_results,
            rollback_point_id: point.map(|p| p.id),
            rolled_back: rollback_report.is_some(),
            rollback_report,
            duration_ms: started.elapsed().as_millis() as u64,
            summary,
            recommendations,
        };

        info!(
            success = result.success,
            applied = result.summary.applied_count,
            failed = result.summary.failed_count,
            conflicts = result.summary.conflicts_detected,
            rolled_back = result.rolled_back,
            duration_ms = result.duration_ms,
            "patch set finished"
        );

        if options.notify_on_completion {
            if let Some(listener) = &self.listener {
                listener.on_complete(&result).await;
            }
        }
        Ok(result)
    }

    /// The concrete strategy `requested` stands for.
    pub fn select_strategy(
        &self,
        requested: ApplicationStrategy,
        patches: &[Patch],
    ) -> ApplicationStrategy {
        if requested != ApplicationStrategy::Adaptive {
            return requested;
        }
        if patches.iter().any(|p| self.shared.validator.is_risky(p)) {
            return ApplicationStrategy::Conservative;
        }
        if patches.len() > 1 && plan_waves(patches).len() < patches.len() {
            return ApplicationStrategy::Parallel;
        }
        ApplicationStrategy::Sequential
    }

    fn restore(
        &self,
        point: &RollbackPoint,
    ) -> Result<crate::rollback::RollbackReport, ApplyError> {
        warn!(point_id = %point.id, "rolling back patch set");
        self.rollback
            .rollback(point)
            .map_err(|source| ApplyError::RollbackFailed { source })
    }

    // -----------------------------------------------------------------------
    // Strategies
    // -----------------------------------------------------------------------

    async fn run_in_order(
        &self,
        repo: &Path,
        patches: &[Patch],
        order: &[usize],
        options: &ApplicationOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Aborted> {
        let mut run = RunOutcome::default();
        for (pos, &idx) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = order.len() - pos, "cancelled");
                run.cancel(order[pos..].iter().map(|&i| &patches[i]));
                break;
            }
            run.record(apply_one(&self.shared, repo, &patches[idx], options).await)?;
        }
        Ok(run)
    }

    async fn run_conservative(
        &self,
        repo: &Path,
        patches: &[Patch],
        options: &ApplicationOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Aborted> {
        let mut run = RunOutcome::default();
        for (pos, patch) in patches.iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancel(&patches[pos..]);
                break;
            }

            let checks = self.shared.validator.pre_apply(repo, patch).await;
            let problems: Vec<String> = checks
                .iter()
                .filter(|r| !r.passed)
                .map(|r| match &r.error {
                    Some(e) => format!("{}: {} ({})", r.kind, r.message, e),
                    None => format!("{}: {}", r.kind, r.message),
                })
                .collect();
            run.validation_results.extend(checks);

            if !problems.is_empty() {
                run.record(PatchOutcome::Failed(failed(
                    patch,
                    FailureReason::ValidationFailed,
                    problems.join("; "),
                    Vec::new(),
                )))?;
                continue;
            }
            run.record(apply_one(&self.shared, repo, patch, options).await)?;
        }
        Ok(run)
    }

    async fn run_parallel(
        &self,
        repo: &Path,
        patches: &[Patch],
        options: &ApplicationOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Aborted> {
        let waves = plan_waves(patches);
        let semaphore = (options.max_parallelism > 0)
            .then(|| Arc::new(Semaphore::new(options.max_parallelism)));
        let mut run = RunOutcome::default();
        debug!(waves = waves.len(), "patch waves planned");

        for (wave_no, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancel(waves[wave_no..].iter().flatten().map(|&i| &patches[i]));
                break;
            }

            let mut set = JoinSet::new();
            for &idx in wave {
                let shared = Arc::clone(&self.shared);
                let repo = repo.to_path_buf();
                let patch = patches[idx].clone();
                let options = options.clone();
                let semaphore = semaphore.clone();
                set.spawn(async move {
                    let _permit = match semaphore {
                        Some(s) => s.acquire_owned().await.ok(),
                        None => None,
                    };
                    (idx, apply_one(&shared, &repo, &patch, &options).await)
                });
            }

            let mut outcomes: BTreeMap<usize, PatchOutcome> = BTreeMap::new();
            let mut worker_errors = Vec::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, outcome)) => {
                        outcomes.insert(idx, outcome);
                    }
                    Err(e) => {
                        warn!(wave = wave_no, error = %e, "apply worker failed");
                        worker_errors.push(e.to_string());
                    }
                }
            }

            for &idx in wave {
                let outcome = outcomes.remove(&idx).unwrap_or_else(|| {
                    let err = ApplyError::Worker(worker_errors.join("; "));
                    let reason = FailureReason::ApplicationError;
                    PatchOutcome::Failed(failed(&patches[idx], reason, err.to_string(), Vec::new()))
                });
                run.record(outcome)?;
            }
        }
        Ok(run)
    }
}

/// Advice derived from one invocation.
fn recommendations(summary: &ApplicationSummary, validations: &[ValidationResult]) -> Vec<String> {
    let mut out = Vec::new();
    if summary.total_patches > 0 && summary.success_rate < 0.5 {
        out.push(format!(
            "Only {:.0}% of patches applied; retry with the conservative strategy",
            summary.success_rate * 100.0
        ));
    }
    if summary.conflicts_resolved < summary.conflicts_detected {
        out.push(format!(
            "{} of {} conflicts were not resolved; enable auto resolution or resolve them by hand",
            summary.conflicts_detected - summary.conflicts_resolved,
            summary.conflicts_detected
        ));
    }
    let failing: Vec<String> = validations
        .iter()
        .filter(|v| !v.passed)
        .map(|v| match &v.patch_id {
            Some(id) => format!("{} ({})", v.kind, id),
            None => v.kind.to_string(),
        })
        .collect();
    if !failing.is_empty() {
        out.push(format!("Review failing validations: {}", failing.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Change, ChangeKind, FileOperation, FilePatch};

    fn modify(id: &str, path: &str, old: &str, new: &str, confidence: f64) -> Patch {
        Patch {
            id: id.into(),
            file_patches: vec![FilePatch {
                path: path.into(),
                operation: FileOperation::Modify,
                changes: vec![Change {
                    old_content: old.into(),
                    new_content: new.into(),
                    line_start: 1,
                    line_end: 1,
                    kind: ChangeKind::Dependency,
                    reason: String::new(),
                    confidence: 0.9,
                }],
                content: None,
                confidence: 1.0,
                description: String::new(),
            }],
            config_patches: Vec::new(),
            confidence,
            breaking_change: false,
            description: None,
        }
    }

    #[test]
    fn test_state_tracker_rejects_illegal_edge() {
        let mut tracker = StateTracker::new();
        tracker.advance(ApplyState::Applying).unwrap();
        let err = tracker.advance(ApplyState::SnapshotTaken).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidStateTransition { .. }));
        assert_eq!(tracker.history, vec![ApplyState::Pending, ApplyState::Applying]);
    }

    #[test]
    fn test_adaptive_selection() {
        let app = PatchApplicator::new(AppConfig::default());
        let disjoint = vec![
            modify("a", "a.txt", "1", "2", 0.9),
            modify("b", "b.txt", "1", "2", 0.9),
        ];
        assert_eq!(
            app.select_strategy(ApplicationStrategy::Adaptive, &disjoint),
            ApplicationStrategy::Parallel
        );

        let chained = vec![
            modify("a", "a.txt", "1", "2", 0.9),
            modify("b", "a.txt", "2", "3", 0.9),
        ];
        assert_eq!(
            app.select_strategy(ApplicationStrategy::Adaptive, &chained),
            ApplicationStrategy::Sequential
        );

        let risky = vec![modify("a", "a.txt", "1", "2", 0.3)];
        assert_eq!(
            app.select_strategy(ApplicationStrategy::Adaptive, &risky),
            ApplicationStrategy::Conservative
        );
        assert_eq!(
            app.select_strategy(ApplicationStrategy::Optimized, &risky),
            ApplicationStrategy::Optimized
        );
    }

    #[test]
    fn test_recommendations() {
        let summary = ApplicationSummary {
            total_patches: 4,
            applied_count: 1,
            failed_count: 3,
            conflicts_detected: 2,
            conflicts_resolved: 1,
            files_changed: 1,
            success_rate: 0.25,
        };
        let build = crate::models::ValidationKind::Build;
        let validations = vec![ValidationResult::fail(build, "build failed", "exit 1")];
        let recs = recommendations(&summary, &validations);
        assert_eq!(recs.len(), 3);
        assert!(recs[0].contains("conservative"));
        assert!(recs[2].contains("build"));
        assert!(recommendations(&ApplicationSummary::compute(&[], &[], &[]), &[]).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_repo_is_rejected() {
        let app = PatchApplicator::new(AppConfig::default());
        let request = app.request("/definitely/not/here", "main", Vec::new());
        assert!(matches!(
            app.apply_patches(request).await,
            Err(ApplyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1\n").unwrap();
        let app = PatchApplicator::new(AppConfig::default());
        let patches = vec![modify("a", "a.txt", "1", "2", 0.9)];
        let mut request = app.request(dir.path(), "main", patches);
        request.options.dry_run = true;

        let result = app.apply_patches(request).await.unwrap();
        assert!(result.success);
        assert!(result.rollback_point_id.is_none());
        let preview = result.applied[0].preview.as_deref().unwrap();
        assert!(preview.contains("-1") && preview.contains("+2"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "1\n");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1\n").unwrap();
        let app = PatchApplicator::new(AppConfig::default());
        let patches = vec![modify("a", "a.txt", "1", "2", 0.9)];
        let mut request = app.request(dir.path(), "main", patches);
        request.options.create_backup = false;

        let token = CancellationToken::new();
        token.cancel();
        let result = app.apply_patches_with_cancel(request, token).await.unwrap();
        assert_eq!(result.failed[0].reason, FailureReason::Cancelled);
        assert!(!result.success);
        assert!(!result.rolled_back);
    }
}
