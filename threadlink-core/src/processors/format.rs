//! Chat-facing text for relayed events. Plain text only, so no message can
//! be rejected for bad markup.

use crate::entities::TicketStatus;
use threadlink_sdk::objects::AttachmentSummary;

pub fn agent_reply(
    friendly_id: &str,
    agent_name: Option<&str>,
    text: &str,
    attachments: Option<&AttachmentSummary>,
) -> String {
    let author = agent_name.filter(|n| !n.trim().is_empty()).unwrap_or("Support");
    let mut out = format!("Ticket #{friendly_id}\n{author}: {}", text.trim());
    if let Some(line) = attachments.and_then(attachment_line) {
        out.push_str("\n\n");
        out.push_str(&line);
    }
    out
}

pub fn status_notice(friendly_id: &str, status: TicketStatus) -> String {
    match status {
        TicketStatus::Closed => format!(
            "Ticket #{friendly_id} has been closed. Reply to this message if you need more help."
        ),
        TicketStatus::Open => format!("Ticket #{friendly_id} has been reopened. Our team is on it."),
    }
}

pub fn ticket_confirmation(friendly_id: &str, title: &str) -> String {
    format!(
        "Ticket #{friendly_id} created: {}\nReply to this message to add details.",
        title.trim()
    )
}

/// One-line description of the files attached to an event.
pub fn attachment_line(summary: &AttachmentSummary) -> Option<String> {
    if !summary.has_files || summary.count == 0 {
        return None;
    }
    let noun = if summary.count == 1 { "attachment" } else { "attachments" };
    let kind = if summary.has_images() { "including images, " } else { "" };
    let mut line = format!(
        "[{} {noun}, {kind}{}]",
        summary.count,
        human_size(summary.total_size)
    );
    if !summary.names.is_empty() {
        line.push_str(&format!(" {}", summary.names.join(", ")));
    }
    Some(line)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
