//! `patchguard rollback ...`.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use patchguard_core::config::AppConfig;
use patchguard_core::RollbackManager;

use crate::{style, RollbackAction};

pub fn run(config: &AppConfig, repo: &Path, action: RollbackAction) -> Result<()> {
    let manager = RollbackManager::new(config.rollback.clone());
    manager
        .load_persisted(repo)
        .context("failed to read existing rollback points")?;

    match action {
        RollbackAction::Create { branch } => {
            let point = manager
                .create_rollback_point(repo, &branch)
                .context("failed to create rollback point")?;
            println!(
                "{}",
                style::success(&format!(
                    "Rollback point {} created ({} files, {} bytes)",
                    point.id,
                    point.files.len(),
                    point.total_size()
                ))
            );
        }

        RollbackAction::List => {
            let points = manager.list_rollback_points();
            if points.is_empty() {
                println!("{}", style::dim("No rollback points."));
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["ID", "Created", "Branch", "Revision", "Files", "Tree"]);
            for p in &points {
                let revision = p
                    .revision
                    .as_deref()
                    .map(|r| r.chars().take(10).collect::<String>())
                    .unwrap_or_else(|| "-".into());
                let tree = if p.dirty {
                    Cell::new("dirty").fg(Color::Yellow)
                } else {
                    Cell::new("clean").fg(Color::Green)
                };
                table.add_row(vec![
                    Cell::new(&p.id),
                    Cell::new(p.created_at.format("%Y-%m-%d %H:%M:%S")),
                    Cell::new(&p.branch),
                    Cell::new(revision),
                    Cell::new(p.files.len()),
                    tree,
                ]);
            }
            println!("{table}");
        }

        RollbackAction::Restore { id } => {
            let point = manager
                .get_rollback_point(&id)
                .ok_or_else(|| anyhow::anyhow!("rollback point '{}' not found", id))?;
            manager
                .validate_rollback_point(&point)
                .context("rollback point is no longer usable")?;
            let report = manager.rollback(&point).context("rollback failed")?;
            println!(
                "{}",
                style::success(&format!(
                    "Restored {} via {}: {} restored, {} removed, {} unchanged",
                    id, report.method, report.restored, report.removed, report.skipped
                ))
            );
        }

        RollbackAction::Delete { id } => {
            manager
                .delete_rollback_point(&id)
                .with_context(|| format!("failed to delete rollback point '{}'", id))?;
            println!("{}", style::success(&format!("Deleted {}", id)));
        }

        RollbackAction::Cleanup { max_age_hours } => {
            let hours = max_age_hours.unwrap_or(config.rollback.max_age_hours);
            let capped = i64::try_from(hours)
                .unwrap_or(i64::MAX)
                .min(i64::MAX / 3_600_000);
            let max_age = chrono::Duration::hours(capped);
            let removed = manager.cleanup_old_rollback_points(max_age);
            println!(
                "{}",
                style::success(&format!(
                    "Removed {} rollback point(s) older than {}h",
                    removed, hours
                ))
            );
        }
    }
    Ok(())
}
