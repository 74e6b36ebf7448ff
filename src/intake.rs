// Attachment sweep: collect matching attachments from unread mail

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::IntakeError;
use crate::mailbox::Mailbox;

static UNSAFE_FILE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._\- ]").unwrap());

/// What a sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub messages_seen: usize,
    pub saved: Vec<PathBuf>,
    /// Attachments whose name does not carry the extension
    pub skipped: Vec<String>,
    /// Attachments with no content; their message is left unread
    pub empty: Vec<String>,
}

/// Attachment name reduced to a safe file name inside the destination directory
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned = UNSAFE_FILE_CHARS.replace_all(base, "_");
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

fn has_extension(name: &str, extension: &str) -> bool {
    let extension = extension.trim_start_matches('.').to_lowercase();
    name.to_lowercase().ends_with(&format!(".{}", extension))
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Download attachments ending in `extension` from unread mail in `folder`.
///
/// A message whose attachment does not match is marked read and skipped; an
/// empty attachment leaves its message unread. Any error marks the message
/// being processed unread and stops the sweep.
pub async fn sweep_attachments(
    mailbox: &Mailbox,
    folder: &str,
    dest_dir: &Path,
    extension: &str,
) -> Result<SweepReport, IntakeError> {
    let mut report = SweepReport::default();
    let messages = mailbox.list_unread_messages_in_folder(folder).await?;

    if messages.is_empty() {
        tracing::info!("No unread messages in '{}'", folder);
        return Ok(report);
    }

    std::fs::create_dir_all(dest_dir).map_err(|source| IntakeError::Write {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    for message in &messages {
        report.messages_seen += 1;
        if !message.get("hasAttachments").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }

        let message_id = str_field(message, "id");
        if let Err(e) = sweep_message(mailbox, message_id, dest_dir, extension, &mut report).await {
            tracing::error!("Error processing message {}: {}", message_id, e);
            if let Err(revert) = mailbox.mark_unread(message_id).await {
                tracing::error!("Could not mark message {} unread again: {}", message_id, revert);
            }
            return Err(e);
        }
    }

    tracing::info!(
        "Sweep of '{}' done: {} messages, {} saved, {} skipped, {} empty",
        folder,
        report.messages_seen,
        report.saved.len(),
        report.skipped.len(),
        report.empty.len()
    );
    Ok(report)
}

async fn sweep_message(
    mailbox: &Mailbox,
    message_id: &str,
    dest_dir: &Path,
    extension: &str,
    report: &mut SweepReport,
) -> Result<(), IntakeError> {
    for attachment in mailbox.list_attachments(message_id).await? {
        let name = str_field(&attachment, "name");

        if !has_extension(name, extension) {
            tracing::info!("Attachment {} is not a .{} file, skipping", name, extension);
            report.skipped.push(name.to_string());
            mailbox.mark_read(message_id).await?;
            continue;
        }

        let content = mailbox
            .attachment_content(message_id, str_field(&attachment, "id"))
            .await?;
        if content.is_empty() {
            tracing::warn!("Attachment {} is empty", name);
            report.empty.push(name.to_string());
            mailbox.mark_unread(message_id).await?;
            continue;
        }

        let path = dest_dir.join(sanitize_file_name(name));
        std::fs::write(&path, &content).map_err(|source| IntakeError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::info!("Attachment {} saved to {}", name, path.display());
        report.saved.push(path);

        mailbox.mark_read(message_id).await?;
    }
    Ok(())
}
