//! Operator-facing output for plans, results and halted runs

use chrono::SecondsFormat;
use serde_json::json;
use shale_core::MigrateConfig;
use shale_migrate::{
    MigrateError, MigrationDirection, MigrationRecord, MigrationRunResult, MigrationStatus, Plan,
};

/// The plan as printed before it executes
pub fn plan(plan: &Plan) -> String {
    let mut out = plan.to_string();
    if plan.skipped() > 0 {
        out.push_str(&format!("\n({} already in place)", plan.skipped()));
    }
    out
}

/// Effective settings and where each one came from
pub fn configuration(config: &MigrateConfig) -> String {
    config
        .effective_values()
        .into_iter()
        .map(|(field, value, source)| format!("  {:<24}{}  ({})", field, value, source))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One-line summary of a finished run
pub fn summary(result: &MigrationRunResult) -> String {
    if result.dry_run {
        return format!(
            "Dry run: {} migration(s) would {}; nothing executed",
            result.plan.len(),
            verb(result)
        );
    }

    format!(
        "Done: {} migration(s) {} in {} ms",
        result.completed_count(),
        past_tense(result),
        result.execution_time_ms
    )
}

/// Completed / failed / not attempted breakdown of a halted run
pub fn failure(error: &MigrateError) -> Option<String> {
    let progress = error.progress()?;
    let list = |ids: &[String]| {
        if ids.is_empty() {
            "  (none)".to_string()
        } else {
            ids.iter().map(|id| format!("  {}", id)).collect::<Vec<_>>().join("\n")
        }
    };

    let failed = match error {
        MigrateError::Cancelled { .. } => "Stopped before:",
        _ => "Failed:",
    };

    Some(format!(
        "Completed:\n{}\n{}\n  {}\nNot attempted:\n{}",
        list(&progress.completed),
        failed,
        error.migration_id().unwrap_or("-"),
        list(&progress.not_attempted)
    ))
}

/// Status table, one migration per line in apply order
pub fn status(entries: &[(MigrationRecord, MigrationStatus)]) -> String {
    if entries.is_empty() {
        return "No migrations found".to_string();
    }

    entries
        .iter()
        .map(|(record, status)| match status {
            MigrationStatus::Applied { applied_at } => format!(
                "A {}  (applied {})",
                record.id(),
                applied_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            MigrationStatus::Pending => format!("  {}", record.id()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Status as JSON: `[{"id", "applied", "applied_at", "depends_on"}]`
pub fn status_json(entries: &[(MigrationRecord, MigrationStatus)]) -> serde_json::Value {
    serde_json::Value::Array(
        entries
            .iter()
            .map(|(record, status)| {
                let applied_at = match status {
                    MigrationStatus::Applied { applied_at } => {
                        json!(applied_at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    }
                    MigrationStatus::Pending => serde_json::Value::Null,
                };
                json!({
                    "id": record.id(),
                    "description": record.description(),
                    "applied": status.is_applied(),
                    "applied_at": applied_at,
                    "depends_on": record.dependencies(),
                })
            })
            .collect(),
    )
}

fn verb(result: &MigrationRunResult) -> &'static str {
    match result.direction {
        MigrationDirection::Up => "be applied",
        MigrationDirection::Down => "be rolled back",
    }
}

fn past_tense(result: &MigrationRunResult) -> &'static str {
    match result.direction {
        MigrationDirection::Up => "applied",
        MigrationDirection::Down => "rolled back",
    }
}
