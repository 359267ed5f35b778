use vigilo_core::report::AlertReport;

const RULE_WIDTH: usize = 60;
pub const DESKTOP_MESSAGE_LIMIT: usize = 500;
pub const FIELD_VALUE_LIMIT: usize = 50;

/// Cut `value` to at most `limit` characters, ending in `...` when cut.
pub fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}

pub fn subject(report: &AlertReport) -> String {
    format!("[vigilo] {}: {}", report.event_type, report.path.display())
}

fn owner(report: &AlertReport) -> String {
    match (report.owner_uid, report.owner_gid) {
        (Some(uid), Some(gid)) => format!("uid {uid} gid {gid}"),
        _ => "Unknown".to_string(),
    }
}

fn permissions(report: &AlertReport) -> String {
    report
        .permission_bits
        .map(|bits| format!("{bits:o}"))
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Full plain-text report used by the log and email channels.
pub fn summary(report: &AlertReport) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut lines = vec![
        rule.clone(),
        "FILE MONITORING ALERT".to_string(),
        rule.clone(),
        format!("File:        {}", report.path.display()),
        format!("Event:       {}", report.event_type),
        format!("Time:        {}", report.detected_at.to_rfc3339()),
        format!("Owner:       {}", owner(report)),
        format!("Permissions: {}", permissions(report)),
    ];
    if report.entry_path != report.path {
        lines.push(format!("Monitored:   {}", report.entry_path.display()));
    }
    if let Some(dest) = &report.destination {
        lines.push(format!("Moved to:    {}", dest.display()));
    }
    lines.push(String::new());

    if report.changes.is_empty() {
        lines.push("No detailed changes detected".to_string());
    } else {
        lines.push("Changes Detected:".to_string());
        for change in &report.changes {
            lines.push(format!("  {}:", change.field.as_str()));
            lines.push(format!("    Before: {}", change.before.as_deref().unwrap_or("N/A")));
            lines.push(format!("    After:  {}", change.after.as_deref().unwrap_or("N/A")));
        }
    }

    lines.push(String::new());
    lines.push(format!("Interpretation: {}", report.interpretation));
    lines.push(format!("Recommendation: {}", report.recommendation));
    lines.push(rule);
    lines.join("\n")
}

/// Short body for desktop notifications.
pub fn desktop_message(report: &AlertReport) -> String {
    let mut parts = vec![
        format!("File: {}", report.path.display()),
        format!("Event: {}", report.event_type),
        format!("Time: {}", report.detected_at.to_rfc3339()),
        String::new(),
        "Changes:".to_string(),
    ];
    if report.changes.is_empty() {
        parts.push("- No detailed changes detected".to_string());
    }
    for change in &report.changes {
        let before = truncate(change.before.as_deref().unwrap_or("N/A"), FIELD_VALUE_LIMIT);
        let after = truncate(change.after.as_deref().unwrap_or("N/A"), FIELD_VALUE_LIMIT);
        parts.push(format!("- {}: {} -> {}", change.field.as_str(), before, after));
    }
    truncate(&parts.join("\n"), DESKTOP_MESSAGE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use vigilo_core::baseline::AlertMode;
    use vigilo_core::report::{ChangeKind, ChangeRecord};
    use vigilo_core::snapshot::{FieldChange, SnapshotDiff, SnapshotField};

    fn report_with(before: &str, after: &str) -> AlertReport {
        let record = ChangeRecord {
            path: PathBuf::from("/etc/app.conf"),
            entry_path: PathBuf::from("/etc/app.conf"),
            event_type: ChangeKind::Modify,
            previous_snapshot: None,
            current_snapshot: None,
            diff: SnapshotDiff {
                changes: vec![FieldChange {
                    field: SnapshotField::ContentHash,
                    before: Some(before.into()),
                    after: Some(after.into()),
                }],
            },
            destination: None,
            detected_at: Utc::now(),
        };
        AlertReport::from_record(&record, AlertMode::Desktop)
    }

    #[test]
    fn truncate_marks_cut_values() {
        assert_eq!(truncate("short", 50), "short");
        let long = "a".repeat(64);
        let cut = truncate(&long, 50);
        assert_eq!(cut.chars().count(), 50);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn desktop_message_shortens_hashes() {
        let msg = desktop_message(&report_with(&"a".repeat(64), &"b".repeat(64)));
        assert!(msg.contains(&format!("{}...", "a".repeat(47))));
        assert!(msg.chars().count() <= DESKTOP_MESSAGE_LIMIT);
    }

    #[test]
    fn summary_lists_changes_and_advice() {
        let text = summary(&report_with("h1", "h2"));
        assert!(text.contains("File:        /etc/app.conf"));
        assert!(text.contains("    Before: h1"));
        assert!(text.contains("Recommendation: Review changes and verify legitimacy"));
    }
}
