//! `patchguard apply`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::Deserialize;
use tracing::warn;

use patchguard_core::config::AppConfig;
use patchguard_core::conflict::ResolutionMode;
use patchguard_core::models::{
    ApplicationOptions, ApplicationRequest, ApplicationResult, ApplicationStrategy, Patch,
};
use patchguard_core::{CancellationToken, PatchApplicator};

use crate::{style, truncate};

/// Request file as written by callers. Missing `strategy` and `options`
/// fall back to the `[apply]` section.
#[derive(Debug, Deserialize)]
struct RequestFile {
    repo_path: PathBuf,
    #[serde(default)]
    branch: Option<String>,
    patches: Vec<Patch>,
    #[serde(default)]
    strategy: Option<ApplicationStrategy>,
    #[serde(default)]
    options: Option<ApplicationOptions>,
}

/// Command-line flags that win over the request file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub repo: Option<PathBuf>,
    pub strategy: Option<ApplicationStrategy>,
    pub mode: Option<ResolutionMode>,
    pub dry_run: bool,
}

fn build_request(
    config: &AppConfig,
    file: RequestFile,
    overrides: Overrides,
) -> ApplicationRequest {
    let mut options = file.options.unwrap_or_else(|| config.apply.to_options());
    if overrides.dry_run {
        options.dry_run = true;
    }
    if let Some(mode) = overrides.mode {
        options.conflict_resolution = mode;
    }

    ApplicationRequest {
        repo_path: overrides.repo.unwrap_or(file.repo_path),
        branch: file.branch.unwrap_or_else(|| "main".into()),
        patches: file.patches,
        strategy: overrides.strategy.or(file.strategy).unwrap_or(config.apply.strategy),
        options,
    }
}

pub async fn run(
    config: AppConfig,
    request_path: &Path,
    overrides: Overrides,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("failed to read request file {}", request_path.display()))?;
    let file: RequestFile = serde_json::from_str(&raw).context("failed to parse request file")?;
    let request = build_request(&config, file, overrides);

    let applicator = PatchApplicator::new(config);

    // Ctrl-C stops between patches instead of mid-write.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current patch");
            on_signal.cancel();
        }
    });

    let result = applicator
        .apply_patches_with_cancel(request, cancel)
        .await
        .context("patch application failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if !result.success {
        anyhow::bail!(
            "patch set did not succeed ({:.0}% applied)",
            result.summary.success_rate * 100.0
        );
    }
    Ok(())
}

fn print_result(result: &ApplicationResult) {
    println!();
    println!(
        "{}",
        style::header(&format!(
            "Patch set: {} applied, {} failed ({} strategy, {} ms)",
            result.summary.applied_count,
            result.summary.failed_count,
            result.strategy,
            result.duration_ms
        ))
    );

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Patch", "Status", "Files", "Conflicts", "Detail"]);

    for applied in &result.applied {
        table.add_row(vec![
            Cell::new(&applied.patch_id),
            Cell::new("✓ applied").fg(Color::Green),
            Cell::new(applied.files_changed.len()),
            Cell::new(applied.conflicts.len()),
            Cell::new(truncate(&applied.files_changed.join(", "), 60)),
        ]);
    }
    for failed in &result.failed {
        table.add_row(vec![
            Cell::new(&failed.patch_id),
            Cell::new(format!("✗ {}", failed.reason)).fg(Color::Red),
            Cell::new("-"),
            Cell::new(failed.conflicts.len()),
            Cell::new(truncate(&failed.error, 60)),
        ]);
    }
    println!("{table}");

    for applied in &result.applied {
        if let Some(preview) = applied.preview.as_deref().filter(|p| !p.is_empty()) {
            println!();
            println!("{}", style::dim(&format!("preview of {}", applied.patch_id)));
            println!("{}", style::diff(preview));
        }
    }

    println!();
    println!(
        "  Conflicts : {} detected, {} resolved",
        result.summary.conflicts_detected, result.summary.conflicts_resolved
    );
    println!("  Files     : {}", result.summary.files_changed);
    if let Some(id) = &result.rollback_point_id {
        println!("  Snapshot  : {}", id);
    }
    if let Some(report) = &result.rollback_report {
        println!(
            "{}",
            style::warn(&format!(
                "Rolled back via {}: {} restored, {} removed",
                report.method, report.restored, report.removed
            ))
        );
    }
    for failing in result.validation_results.iter().filter(|v| !v.passed) {
        let detail = failing.error.as_deref().unwrap_or(&failing.message);
        println!("{}", style::error(&format!("{}: {}", failing.kind, detail)));
    }
    for rec in &result.recommendations {
        println!("  → {}", rec);
    }
    if result.success {
        println!("{}", style::success("Patch set applied"));
    }
    println!();
}
