//! Per-kind action execution.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::try_join_all;
use tracing::{debug, info};

use super::classify::ActionError;
use crate::config::SyncConfig;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::identity::CredentialSource;
use crate::queue::{Action, ActionKind, ActionTarget};
use crate::replica::{Attachment, Message, ReplicaStore, transact};
use crate::send::SendPipeline;
use crate::transport::wire::{
    AttachmentEnvelope, AttachmentUpload, DraftRequest, KeysResponse, MessageEnvelope,
};
use crate::transport::{ApiRequest, MessageStateChange, Transport};

/// Runs one queued action against the service.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `action` once.
    ///
    /// # Errors
    ///
    /// Returns the failure for the outcome classifier.
    async fn execute(&self, action: &Action) -> Result<(), ActionError>;
}

/// The handlers for every [`ActionKind`].
pub struct ActionHandlers {
    replica: Arc<dyn ReplicaStore>,
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn CryptoProvider>,
    credentials: Arc<dyn CredentialSource>,
    pipeline: Arc<SendPipeline>,
    config: Arc<SyncConfig>,
}

#[async_trait]
impl ActionExecutor for ActionHandlers {
    async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        debug!(id = %action.id, kind = %action.kind, action_target = action.target.id(), "Executing action");

        match action.kind {
            ActionKind::SaveDraft => self.save_draft(local_ref(action)?).await,
            ActionKind::Send => {
                self.pipeline.send(local_ref(action)?).await?;
                Ok(())
            }
            ActionKind::Read => self.change_state(action, MessageStateChange::Read).await,
            ActionKind::Unread => self.change_state(action, MessageStateChange::Unread).await,
            ActionKind::Delete => self.change_state(action, MessageStateChange::Delete).await,
            ActionKind::Label => {
                let label_id = param(action.param1.as_deref(), "label id")?;
                let ids = vec![self.remote_id(&action.target).await?];
                self.call(ApiRequest::ApplyLabel { label_id, ids }).await
            }
            ActionKind::Unlabel => {
                let label_id = param(action.param1.as_deref(), "label id")?;
                let ids = vec![self.remote_id(&action.target).await?];
                self.call(ApiRequest::RemoveLabel { label_id, ids }).await
            }
            ActionKind::Folder => {
                let label_id = param(action.param2.as_deref(), "destination folder")?;
                let ids = vec![self.remote_id(&action.target).await?];
                self.call(ApiRequest::ApplyLabel { label_id, ids }).await
            }
            ActionKind::Empty => {
                let label_id = param(action.param1.as_deref(), "label id")?;
                self.call(ApiRequest::EmptyLabel { label_id }).await
            }
            ActionKind::UploadAttachment => self.upload_attachment(local_ref(action)?).await,
            ActionKind::UploadPublicKey => self.upload_public_key(local_ref(action)?).await,
            ActionKind::DeleteAttachment => {
                let ActionTarget::Remote(id) = &action.target else {
                    return Err(ActionError::Rejected("attachment has no remote id".into()));
                };
                self.call(ApiRequest::DeleteAttachment { id: id.clone() }).await
            }
        }
    }
}

impl ActionHandlers {
    /// Creates the handler set.
    #[must_use]
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        credentials: Arc<dyn CredentialSource>,
        pipeline: Arc<SendPipeline>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            replica,
            transport,
            crypto,
            credentials,
            pipeline,
            config,
        }
    }

    async fn call(&self, request: ApiRequest) -> Result<(), ActionError> {
        self.transport.call(request).await?;
        Ok(())
    }

    async fn change_state(&self, action: &Action, change: MessageStateChange) -> Result<(), ActionError> {
        let ids = vec![self.remote_id(&action.target).await?];
        self.call(ApiRequest::MessageState { change, ids }).await
    }

    async fn message(&self, local_id: &str) -> Result<Message, ActionError> {
        let id = local_id.to_string();
        transact(self.replica.as_ref(), move |tx| Ok(tx.message(&id)))
            .await?
            .ok_or_else(|| ActionError::TargetMissing(local_id.to_string()))
    }

    /// Resolve a message target to its server id.
    async fn remote_id(&self, target: &ActionTarget) -> Result<String, ActionError> {
        match target {
            ActionTarget::Remote(id) => Ok(id.clone()),
            ActionTarget::Local(local_id) => self
                .message(local_id)
                .await?
                .remote_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ActionError::TargetMissing(local_id.clone())),
            ActionTarget::None => Err(ActionError::Rejected("action has no target".into())),
        }
    }

    async fn save_draft(&self, local_id: &str) -> Result<(), ActionError> {
        let id = local_id.to_string();
        let (message, parent_remote_id) = transact(self.replica.as_ref(), move |tx| {
            let message = tx.message(&id);
            let parent = message
                .as_ref()
                .and_then(|m| m.parent_local_id.as_deref())
                .and_then(|parent| tx.message(parent))
                .and_then(|parent| parent.remote_id);
            Ok((message, parent))
        })
        .await?;
        let message = message.ok_or_else(|| ActionError::TargetMissing(local_id.to_string()))?;

        let draft = DraftRequest {
            subject: message.subject.clone(),
            body: message.body.clone(),
            address_id: message.address_id.clone(),
            to_list: message.to.clone(),
            cc_list: message.cc.clone(),
            bcc_list: message.bcc.clone(),
            parent_id: parent_remote_id,
            action: message.reply_action.map(|action| action.code()),
        };
        let request = match message.remote_id.as_deref() {
            Some(remote_id) if message.detail_downloaded && !remote_id.is_empty() && remote_id != "0" => {
                ApiRequest::UpdateDraft {
                    id: remote_id.to_string(),
                    draft,
                }
            }
            _ => ApiRequest::CreateDraft(draft),
        };

        let response = self.transport.call(request).await?;
        let saved = response.parse::<MessageEnvelope>()?.message;

        let id = local_id.to_string();
        transact(self.replica.as_ref(), move |tx| {
            let Some(mut message) = tx.message(&id) else {
                return Ok(());
            };

            let mut had_temp = false;
            for mut attachment in tx.attachments_of(&id) {
                if attachment.is_temp {
                    had_temp = true;
                    tx.delete_attachment(&attachment.local_id);
                } else if attachment.key_changed {
                    attachment.key_changed = false;
                    tx.upsert_attachment(attachment);
                }
            }

            if let Some(remote_id) = &saved.id {
                message.remote_id = Some(remote_id.clone());
            }
            message.detail_downloaded = true;
            if let Some(subject) = &saved.subject {
                message.subject.clone_from(subject);
            }
            if let Some(time) = saved.time.and_then(crate::transport::wire::from_unix) {
                message.time = Some(time);
            }

            if had_temp {
                saved.merge_into(&mut message);
                let known: Vec<String> = tx
                    .attachments_of(&id)
                    .into_iter()
                    .filter_map(|attachment| attachment.remote_id)
                    .collect();
                for payload in saved.attachments.iter().flatten() {
                    if known.contains(&payload.id) {
                        continue;
                    }
                    tx.upsert_attachment(Attachment {
                        remote_id: Some(payload.id.clone()),
                        key_packet: payload.key_packets.clone(),
                        file_data: None,
                        ..Attachment::new_local(id.clone(), payload.name.clone(), payload.mime_type.clone(), Vec::new())
                    });
                }
            }

            tx.upsert_message(message);
            Ok(())
        })
        .await?;

        info!(local_id, "Draft saved");
        Ok(())
    }

    async fn upload_attachment(&self, attachment_id: &str) -> Result<(), ActionError> {
        let id = attachment_id.to_string();
        let (attachment, message) = transact(self.replica.as_ref(), move |tx| {
            let attachment = tx.attachment(&id);
            let message = attachment
                .as_ref()
                .and_then(|attachment| tx.message(&attachment.message_local_id));
            Ok((attachment, message))
        })
        .await?;
        let (Some(attachment), Some(message)) = (attachment, message) else {
            return Err(ActionError::TargetMissing(attachment_id.to_string()));
        };
        let message_remote_id = message
            .remote_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ActionError::Rejected(format!("draft {} is not saved", message.local_id)))?;

        let keys = self.credentials.sender_keys(&message.address_id);
        let key = keys
            .as_ref()
            .and_then(|keys| keys.primary())
            .ok_or_else(|| ActionError::Rejected(CryptoError::MissingKey(message.address_id.clone()).to_string()))?;
        let passphrase = self
            .credentials
            .mailbox_passphrase()
            .ok_or(ActionError::CredentialsLocked)?;

        let data = match (&attachment.file_data, &attachment.local_path) {
            (Some(data), _) => data.clone(),
            (None, Some(path)) => tokio::fs::read(path)
                .await
                .map_err(|e| ActionError::Rejected(format!("cannot read {}: {e}", path.display())))?,
            (None, None) => {
                return Err(ActionError::Rejected(format!(
                    "attachment {attachment_id} has no content"
                )));
            }
        };

        let encrypted = self
            .crypto
            .encrypt_and_sign(&data, key, &passphrase)
            .map_err(|e| ActionError::Rejected(e.to_string()))?;
        let key_packets = STANDARD.encode(&encrypted.key_packet);
        let upload = AttachmentUpload {
            filename: attachment.file_name.clone(),
            mime_type: attachment.mime_type.clone(),
            message_id: message_remote_id,
            content_id: attachment.content_id.clone(),
            key_packets: key_packets.clone(),
            data_packet: STANDARD.encode(&encrypted.data_packet),
            signature: STANDARD.encode(&encrypted.signature),
        };

        let response = self.transport.call(ApiRequest::UploadAttachment(upload)).await?;
        let stored = response.parse::<AttachmentEnvelope>()?.attachment;

        let id = attachment_id.to_string();
        let key_packet = stored.key_packets.clone().unwrap_or(key_packets);
        let remote_id = stored.id.clone();
        transact(self.replica.as_ref(), move |tx| {
            if let Some(mut attachment) = tx.attachment(&id) {
                attachment.remote_id = Some(remote_id);
                attachment.key_packet = Some(key_packet);
                attachment.file_data = None;
                attachment.local_path = None;
                tx.upsert_attachment(attachment);
            }
            Ok(())
        })
        .await?;

        if let Some(path) = &attachment.local_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %e, "Could not remove uploaded attachment file");
            }
        }

        info!(attachment_id, remote_id = %stored.id, "Attachment uploaded");
        Ok(())
    }

    async fn upload_public_key(&self, attachment_id: &str) -> Result<(), ActionError> {
        let id = attachment_id.to_string();
        let message = transact(self.replica.as_ref(), move |tx| {
            Ok(tx
                .attachment(&id)
                .and_then(|attachment| tx.message(&attachment.message_local_id)))
        })
        .await?
        .ok_or_else(|| ActionError::TargetMissing(attachment_id.to_string()))?;

        let lookups = message.all_recipients().map(|recipient| {
            let transport = Arc::clone(&self.transport);
            let request = ApiRequest::PublicKeys {
                email: recipient.address.clone(),
            };
            async move { transport.call(request).await?.parse::<KeysResponse>() }
        });
        let responses = try_join_all(lookups).await?;

        let external = self.config.recipients.external;
        if responses.iter().any(|keys| keys.recipient_type == external) {
            return self.upload_attachment(attachment_id).await;
        }

        let id = attachment_id.to_string();
        transact(self.replica.as_ref(), move |tx| {
            tx.delete_attachment(&id);
            Ok(())
        })
        .await?;
        debug!(attachment_id, "Public key not needed by any recipient");
        Ok(())
    }
}

fn local_ref(action: &Action) -> Result<&str, ActionError> {
    match &action.target {
        ActionTarget::Local(id) => Ok(id),
        other => Err(ActionError::Rejected(format!(
            "{} needs a local target, got {}",
            action.kind,
            other.kind_str()
        ))),
    }
}

fn param(value: Option<&str>, name: &str) -> Result<String, ActionError> {
    value
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ActionError::Rejected(format!("missing {name}")))
}
