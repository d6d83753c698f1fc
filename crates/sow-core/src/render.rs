//! Markdown view of a draft

use crate::intake::Intake;
use sow_review::{Draft, DraftStatus};
use std::fmt::Write as _;

/// Render a draft as Markdown
///
/// Read-only: the draft is not modified and nothing is persisted.
#[must_use]
pub fn render_markdown(intake: &Intake, draft: &Draft) -> String {
    let client = match intake.client_name() {
        "" => "Client",
        name => name,
    };
    let mut out = format!("# Statement of Work - {client}\n\n");

    let header = [
        ("Project Scope", intake.lookup("scope")),
        ("Delivery Model", intake.lookup("delivery_model")),
        ("Industry", intake.lookup("industry")),
        ("Region", intake.lookup("region")),
        ("Jurisdiction", intake.lookup("jurisdiction")),
    ];
    for (label, value) in header {
        if let Some(value) = value {
            let _ = writeln!(out, "- **{label}:** {value}");
        }
    }

    for section in &draft.sections {
        let _ = write!(out, "\n## {}\n\n", section.section);
        if section.status == DraftStatus::NeedsInput || section.paragraphs.is_empty() {
            let reason = section.needs_input.as_deref().unwrap_or("no content drafted");
            let _ = writeln!(out, "_Needs input: {reason}_");
            continue;
        }
        let paragraphs: Vec<&str> = section.paragraphs.iter().map(|p| p.text.trim()).collect();
        out.push_str(&paragraphs.join("\n\n"));
        out.push('\n');
    }
    out
}
