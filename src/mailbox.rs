// Mailbox operations over the Graph-style REST API
// Payloads are passed through as JSON

use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::http_client::GraphSession;

/// Result of a batch update; every item is attempted
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: ApiError,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }
}

/// `id` of the first item whose `displayName` matches `name`, ignoring case
pub fn find_id_by_display_name(items: &[Value], name: &str) -> Option<String> {
    let wanted = name.to_lowercase();
    items
        .iter()
        .find(|item| {
            item.get("displayName")
                .and_then(Value::as_str)
                .is_some_and(|display| display.to_lowercase() == wanted)
        })
        .and_then(|item| item.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn values(mut page: Value) -> Vec<Value> {
    match page.get_mut("value").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Mailbox of the signed-in user
#[derive(Debug, Clone)]
pub struct Mailbox {
    session: GraphSession,
}

impl Mailbox {
    pub fn new(session: GraphSession) -> Self {
        Self { session }
    }

    // === Folders & categories ===

    pub async fn list_folders(&self) -> Result<Vec<Value>, ApiError> {
        let folders = self.session.get_collection("/me/mailFolders", &[]).await?;
        tracing::info!("Fetched {} mail folders", folders.len());
        Ok(folders)
    }

    /// Folder id for a display name; `None` (logged) when there is no such folder
    pub async fn folder_id_by_name(&self, name: &str) -> Result<Option<String>, ApiError> {
        let folders = self.list_folders().await?;
        let id = find_id_by_display_name(&folders, name);
        if id.is_none() {
            tracing::error!("Folder '{}' not found", name);
        }
        Ok(id)
    }

    pub async fn list_categories(&self) -> Result<Vec<Value>, ApiError> {
        self.session
            .get_collection("/me/outlook/masterCategories", &[])
            .await
    }

    /// Category id for a display name; `None` (logged) when there is no such category
    pub async fn category_id_by_name(&self, name: &str) -> Result<Option<String>, ApiError> {
        let categories = self.list_categories().await?;
        let id = find_id_by_display_name(&categories, name);
        if id.is_none() {
            tracing::error!("Category '{}' not found", name);
        }
        Ok(id)
    }

    async fn require_folder(&self, name: &str) -> Result<String, ApiError> {
        self.folder_id_by_name(name)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("folder '{}'", name)))
    }

    // === Messages ===

    /// First page of messages in a folder
    pub async fn list_messages(&self, folder_id: &str) -> Result<Vec<Value>, ApiError> {
        let page = self
            .session
            .get_json(&format!("/me/mailFolders/{}/messages", folder_id), &[])
            .await?;
        Ok(values(page))
    }

    pub async fn list_unread_messages(&self, folder_id: &str) -> Result<Vec<Value>, ApiError> {
        let page = self
            .session
            .get_json(
                &format!("/me/mailFolders/{}/messages", folder_id),
                &[("$filter", "isRead eq false")],
            )
            .await?;
        let messages = values(page);
        tracing::info!("Fetched {} unread messages", messages.len());
        Ok(messages)
    }

    pub async fn list_messages_in_folder(&self, folder: &str) -> Result<Vec<Value>, ApiError> {
        let folder_id = self.require_folder(folder).await?;
        self.list_messages(&folder_id).await
    }

    pub async fn list_unread_messages_in_folder(&self, folder: &str) -> Result<Vec<Value>, ApiError> {
        let folder_id = self.require_folder(folder).await?;
        self.list_unread_messages(&folder_id).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Value, ApiError> {
        self.session
            .get_json(&format!("/me/messages/{}", id), &[])
            .await
    }

    async fn set_read(&self, id: &str, is_read: bool) -> Result<(), ApiError> {
        self.session
            .patch_json(&format!("/me/messages/{}", id), &json!({ "isRead": is_read }))
            .await?;
        tracing::info!("Message {} marked as {}", id, if is_read { "read" } else { "unread" });
        Ok(())
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
        self.set_read(id, true).await
    }

    pub async fn mark_unread(&self, id: &str) -> Result<(), ApiError> {
        self.set_read(id, false).await
    }

    /// Mark every id unread, collecting failures instead of stopping at the first
    pub async fn mark_unread_batch<S: AsRef<str>>(&self, ids: &[S]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for id in ids {
            let id = id.as_ref();
            outcome.attempted += 1;
            if let Err(error) = self.mark_unread(id).await {
                tracing::error!("Failed to mark message {} as unread: {}", id, error);
                outcome.failed.push(BatchFailure {
                    id: id.to_string(),
                    error,
                });
            }
        }

        if !outcome.is_success() {
            tracing::error!(
                "Failed to mark the following messages as unread: {:?}",
                outcome.failed_ids()
            );
        }
        outcome
    }

    /// Replace the categories of a message
    pub async fn set_categories<S: AsRef<str>>(
        &self,
        id: &str,
        categories: &[S],
    ) -> Result<Value, ApiError> {
        let names: Vec<&str> = categories.iter().map(AsRef::as_ref).collect();
        self.session
            .patch_json(&format!("/me/messages/{}", id), &json!({ "categories": names }))
            .await
    }

    pub async fn move_message(&self, id: &str, destination_folder_id: &str) -> Result<Value, ApiError> {
        self.session
            .post_json(
                &format!("/me/messages/{}/move", id),
                &json!({ "destinationId": destination_folder_id }),
            )
            .await
    }

    pub async fn delete_message(&self, id: &str) -> Result<(), ApiError> {
        self.session.delete(&format!("/me/messages/{}", id)).await?;
        tracing::info!("Message {} deleted", id);
        Ok(())
    }

    // === Attachments ===

    pub async fn list_attachments(&self, message_id: &str) -> Result<Vec<Value>, ApiError> {
        let page = self
            .session
            .get_json(&format!("/me/messages/{}/attachments", message_id), &[])
            .await?;
        Ok(values(page))
    }

    /// Raw attachment content
    pub async fn attachment_content(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Bytes, ApiError> {
        self.session
            .get_bytes(&format!(
                "/me/messages/{}/attachments/{}/$value",
                message_id, attachment_id
            ))
            .await
    }

    // === Drafts & sending ===

    /// Create a draft; returns the stored message including its id
    pub async fn create_draft(&self, message: &Value) -> Result<Value, ApiError> {
        self.session.post_json("/me/messages", message).await
    }

    pub async fn send_draft(&self, id: &str) -> Result<(), ApiError> {
        self.session
            .post_empty(&format!("/me/messages/{}/send", id))
            .await?;
        tracing::info!("Draft {} sent", id);
        Ok(())
    }

    pub async fn send_mail(&self, message: &Value, save_to_sent_items: bool) -> Result<(), ApiError> {
        self.session
            .post_json(
                "/me/sendMail",
                &json!({ "message": message, "saveToSentItems": save_to_sent_items }),
            )
            .await?;
        Ok(())
    }
}
