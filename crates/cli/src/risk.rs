//! `patchguard risk`.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use patchguard_core::config::AppConfig;
use patchguard_core::conflict::{analyze_risk, Conflict, ResolutionMode, Severity};
use patchguard_core::PatchApplicator;

use crate::{style, truncate};

pub async fn run(
    config: AppConfig,
    conflicts_path: &Path,
    resolve: Option<ResolutionMode>,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(conflicts_path)
        .with_context(|| format!("failed to read conflicts file {}", conflicts_path.display()))?;
    let mut conflicts: Vec<Conflict> =
        serde_json::from_str(&raw).context("failed to parse conflicts file")?;

    if let Some(mode) = resolve {
        // The applicator wires the resolver to the configured completion
        // provider.
        let applicator = PatchApplicator::new(config);
        conflicts = applicator
            .resolver()
            .resolve_conflicts(conflicts, mode)
            .await
            .context("conflict resolution failed")?;
    }

    let analysis = analyze_risk(&conflicts);

    if json {
        let out = serde_json::json!({ "analysis": analysis, "conflicts": conflicts });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "{}",
        style::header(&format!(
            "{} conflict(s), overall risk: {}",
            analysis.total_conflicts, analysis.overall_risk
        ))
    );

    if !conflicts.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["File", "Line", "Type", "Severity", "Resolution"]);
        for c in &conflicts {
            let severity = match c.severity {
                Severity::Low => Cell::new(c.severity).fg(Color::Green),
                Severity::Medium => Cell::new(c.severity).fg(Color::Yellow),
                Severity::High | Severity::Critical => Cell::new(c.severity).fg(Color::Red),
            };
            let resolution = match &c.resolution {
                Some(r) => format!(
                    "{} ({:.2}): {}",
                    r.resolved_by,
                    r.confidence,
                    truncate(&r.chosen_text, 40)
                ),
                None => "-".into(),
            };
            table.add_row(vec![
                Cell::new(truncate(&c.file, 40)),
                Cell::new(c.line),
                Cell::new(c.conflict_type),
                severity,
                Cell::new(resolution),
            ]);
        }
        println!("{table}");
    }

    for (severity, count) in &analysis.severity_distribution {
        println!("  {:<9}: {}", severity.to_string(), count);
    }
    println!();
    println!("  → {}", analysis.recommendation);
    println!();
    Ok(())
}
