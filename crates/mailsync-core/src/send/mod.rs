//! Outbound send pipeline.
//!
//! A send runs through the [`Stage`]s in order and stops at the first error.
//! Nothing reaches the service unless every stage before [`Stage::Submit`]
//! succeeded. On success the draft is committed as sent; on failure it stays
//! a draft and a "send failed" reminder is scheduled.

mod context;
pub mod mime;
mod package;
pub mod policy;

pub use context::{SendContext, Stage};
pub use package::{AddressPackage, SendRequest, SessionKeyPayload};
pub use policy::{BodyFormat, PackageScheme, PolicyError, RecipientPlan};

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ErrorCodes, SyncConfig};
use crate::crypto::{CryptoError, CryptoProvider, Passphrase, SenderKeys, SessionKey};
use crate::identity::{ContactDirectory, CredentialSource};
use crate::replica::{EncryptionKind, ReplicaStore, ReplyAction, transact};
use crate::sinks::NotificationSink;
use crate::transport::wire::KeysResponse;
use crate::transport::{ApiRequest, Transport, TransportError};

/// Errors raised by a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The draft no longer exists locally.
    #[error("Draft {0} not found")]
    MissingDraft(String),

    /// The draft was never saved to the server.
    #[error("Draft {0} has no remote id")]
    NotSynced(String),

    /// Auth, passphrase or sending key unavailable.
    #[error("Credentials are locked")]
    CredentialsLocked,

    /// A remote call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A crypto primitive failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// No plan could be made for a recipient.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// An attachment has not finished uploading.
    #[error("Attachment {0} is not uploaded")]
    AttachmentNotUploaded(String),

    /// A body rendering could not be produced.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Reading the replica or contact directory failed.
    #[error("Store error: {0}")]
    Store(String),
}

/// How a failed send is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The service wants a human verification first.
    HumanVerification,
    /// The message exceeds the size or credit limit.
    SizeLimit,
    /// Anything else.
    Generic,
}

/// A send that stopped at `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Send failed at {stage}: {error}")]
pub struct SendFailure {
    /// Stage that failed.
    pub stage: Stage,
    /// Stages entered, the failing one last.
    pub reached: Vec<Stage>,
    /// Underlying error.
    pub error: SendError,
}

impl SendFailure {
    /// Classify the failure for the user.
    #[must_use]
    pub fn kind(&self, codes: &ErrorCodes) -> FailureKind {
        match &self.error {
            SendError::Transport(TransportError::Api { code, .. })
                if *code == codes.human_verification =>
            {
                FailureKind::HumanVerification
            }
            SendError::Transport(TransportError::Api { code, .. }) if *code == codes.send_size_limit => {
                FailureKind::SizeLimit
            }
            _ => FailureKind::Generic,
        }
    }
}

/// Collaborators the pipeline needs.
pub struct SendPipeline {
    replica: Arc<dyn ReplicaStore>,
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn CryptoProvider>,
    credentials: Arc<dyn CredentialSource>,
    contacts: Arc<dyn ContactDirectory>,
    notifications: Arc<dyn NotificationSink>,
    config: Arc<SyncConfig>,
}

impl SendPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        credentials: Arc<dyn CredentialSource>,
        contacts: Arc<dyn ContactDirectory>,
        notifications: Arc<dyn NotificationSink>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            replica,
            transport,
            crypto,
            credentials,
            contacts,
            notifications,
            config,
        }
    }

    /// Send the draft with local id `local_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`SendFailure`] naming the stage that failed. The draft is
    /// left untouched and a "send failed" reminder is scheduled.
    pub async fn send(&self, local_id: &str) -> Result<SendRequest, SendFailure> {
        let mut context = SendContext::new(local_id);

        for stage in Stage::ALL {
            context.reached.push(stage);
            debug!(local_id, stage = stage.as_str(), "Send stage");
            if let Err(error) = self.run_stage(stage, &mut context).await {
                let failure = SendFailure {
                    stage,
                    reached: context.reached.clone(),
                    error,
                };
                self.report_failure(&context, &failure);
                return Err(failure);
            }
        }

        let request = context.build_request();
        let notification_id = notification_id(&context);
        self.notifications.cancel_send_failed(&notification_id);
        if notification_id != context.local_id {
            // A failure before the draft loaded was reported under the local id.
            self.notifications.cancel_send_failed(&context.local_id);
        }
        info!(local_id, recipients = context.packages.len(), "Message sent");

        if let Err(e) = self.commit_sent(&context).await {
            warn!(local_id, error = %e, "Failed to record sent state");
        }

        Ok(request)
    }

    async fn run_stage(&self, stage: Stage, context: &mut SendContext) -> Result<(), SendError> {
        match stage {
            Stage::LoadDraft => self.load_draft(context).await,
            Stage::ResolveCredentials => self.resolve_credentials(context),
            Stage::ResolveRecipientKeys => self.resolve_recipient_keys(context).await,
            Stage::ResolveBodySession => self.resolve_body_session(context),
            Stage::DecideRecipientPolicy => self.decide_recipient_policy(context),
            Stage::BuildBodyVariants => self.build_body_variants(context),
            Stage::ResolveAttachmentKeys => self.resolve_attachment_keys(context),
            Stage::AssembleAddressPackages => self.assemble_address_packages(context).await,
            Stage::Submit => self.submit(context).await,
        }
    }

    async fn load_draft(&self, context: &mut SendContext) -> Result<(), SendError> {
        let local_id = context.local_id.clone();
        let (message, attachments) = transact(self.replica.as_ref(), move |tx| {
            let message = tx.message(&local_id);
            let attachments = tx.attachments_of(&local_id);
            Ok((message, attachments))
        })
        .await
        .map_err(|e| SendError::Store(e.to_string()))?;

        let message = message.ok_or_else(|| SendError::MissingDraft(context.local_id.clone()))?;
        if message.remote_id.as_deref().is_none_or(str::is_empty) {
            return Err(SendError::NotSynced(context.local_id.clone()));
        }

        let mut recipients: Vec<String> = Vec::new();
        for recipient in message.all_recipients() {
            if !recipients
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&recipient.address))
            {
                recipients.push(recipient.address.clone());
            }
        }

        context.recipients = recipients;
        context.message = message;
        context.attachments = attachments;
        Ok(())
    }

    fn resolve_credentials(&self, context: &mut SendContext) -> Result<(), SendError> {
        if !self.credentials.is_authenticated() {
            return Err(SendError::CredentialsLocked);
        }
        let passphrase = self
            .credentials
            .mailbox_passphrase()
            .ok_or(SendError::CredentialsLocked)?;
        let keys = self
            .credentials
            .sender_keys(&context.message.address_id)
            .filter(|keys| keys.primary().is_some())
            .ok_or(SendError::CredentialsLocked)?;

        context.passphrase = Some(passphrase);
        context.sender_keys = Some(keys);
        Ok(())
    }

    async fn resolve_recipient_keys(&self, context: &mut SendContext) -> Result<(), SendError> {
        context.pinned = self
            .contacts
            .pinned_contacts(&context.recipients)
            .await
            .map_err(|e| SendError::Store(e.to_string()))?;

        let lookups = context.recipients.iter().map(|email| {
            let transport = Arc::clone(&self.transport);
            let request = ApiRequest::PublicKeys {
                email: email.clone(),
            };
            async move { transport.call(request).await?.parse::<KeysResponse>() }
        });
        context.recipient_keys = try_join_all(lookups).await?;
        Ok(())
    }

    fn resolve_body_session(&self, context: &mut SendContext) -> Result<(), SendError> {
        let (keys, passphrase) = secrets(context)?;
        let (key_packet, data_packet) = self.crypto.split_message(&context.message.body)?;
        let session = self.crypto.resolve_session_key(&key_packet, keys, passphrase)?;

        context.body_data = data_packet;
        context.body_session = Some(session);
        Ok(())
    }

    fn decide_recipient_policy(&self, context: &mut SendContext) -> Result<(), SendError> {
        let outside_password = context.message.is_outside_encrypted();
        let plans = context
            .recipients
            .iter()
            .zip(&context.recipient_keys)
            .map(|(email, keys)| {
                policy::decide(
                    email,
                    keys,
                    context.pinned_for(email),
                    outside_password,
                    &self.config.recipients,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        context.plans = plans;
        Ok(())
    }

    fn build_body_variants(&self, context: &mut SendContext) -> Result<(), SendError> {
        let needs_mime = context.needs_format(BodyFormat::Mime);
        let needs_plain = context.needs_format(BodyFormat::Plain);
        if !needs_mime && !needs_plain {
            return Ok(());
        }

        let (mime_body, plain_body) = {
            let (keys, passphrase) = secrets(context)?;
            let session = body_session(context)?;
            let clear = self
                .crypto
                .decrypt(&context.message.body, keys.decryption_keys(), passphrase)?;
            let html = String::from_utf8_lossy(&clear);

            let mime_body = if needs_mime {
                let boundary = uuid::Uuid::new_v4().simple().to_string();
                let rendered = mime::build_mime(&html, &context.attachments, &boundary);
                Some(self.crypto.encrypt_with_session(rendered.as_bytes(), session)?)
            } else {
                None
            };
            let plain_body = if needs_plain {
                let rendered =
                    mime::html_to_plain(&html).map_err(|e| SendError::Encoding(e.to_string()))?;
                Some(self.crypto.encrypt_with_session(rendered.as_bytes(), session)?)
            } else {
                None
            };
            (mime_body, plain_body)
        };

        context.mime_body = mime_body;
        context.plain_body = plain_body;
        Ok(())
    }

    fn resolve_attachment_keys(&self, context: &mut SendContext) -> Result<(), SendError> {
        let (keys, passphrase) = secrets(context)?;
        let mut sessions = Vec::with_capacity(context.attachments.len());

        for attachment in &context.attachments {
            let (Some(remote_id), Some(key_packet)) = (&attachment.remote_id, &attachment.key_packet) else {
                return Err(SendError::AttachmentNotUploaded(attachment.local_id.clone()));
            };
            let key_packet = STANDARD
                .decode(key_packet)
                .map_err(|e| SendError::Encoding(e.to_string()))?;
            let session = self.crypto.resolve_session_key(&key_packet, keys, passphrase)?;
            sessions.push((remote_id.clone(), session));
        }

        context.attachment_sessions = sessions;
        Ok(())
    }

    async fn assemble_address_packages(&self, context: &mut SendContext) -> Result<(), SendError> {
        let context_ref = &*context;
        let session = body_session(context_ref)?;
        let packages = try_join_all(
            context_ref
                .plans
                .iter()
                .map(|plan| async move { self.package_for(plan, session, context_ref) }),
        )
        .await?;

        context.packages = packages;
        Ok(())
    }

    fn package_for(
        &self,
        plan: &RecipientPlan,
        session: &SessionKey,
        context: &SendContext,
    ) -> Result<AddressPackage, SendError> {
        let mut package = AddressPackage {
            email: plan.email.clone(),
            scheme: plan.scheme,
            format: plan.format,
            signature: plan.sign,
            body_key_packet: None,
            attachment_key_packets: BTreeMap::new(),
            password_hint: None,
        };

        let seal = |key: &SessionKey| -> Result<Option<String>, SendError> {
            let packet = match plan.scheme {
                PackageScheme::Internal | PackageScheme::PgpInline | PackageScheme::PgpMime => {
                    let public_key = plan
                        .public_key
                        .as_deref()
                        .ok_or_else(|| PolicyError::NoKey(plan.email.clone()))?;
                    self.crypto.encrypt_session_key(key, public_key)?
                }
                PackageScheme::EncryptedOutside => self
                    .crypto
                    .encrypt_session_key_with_password(key, &context.message.password)?,
                PackageScheme::Clear | PackageScheme::ClearMime => return Ok(None),
            };
            Ok(Some(STANDARD.encode(packet)))
        };

        package.body_key_packet = seal(session)?;
        if plan.format != BodyFormat::Mime {
            for (remote_id, attachment_session) in &context.attachment_sessions {
                if let Some(packet) = seal(attachment_session)? {
                    package.attachment_key_packets.insert(remote_id.clone(), packet);
                }
            }
        }
        if plan.scheme == PackageScheme::EncryptedOutside && !context.message.password_hint.is_empty() {
            package.password_hint = Some(context.message.password_hint.clone());
        }

        Ok(package)
    }

    async fn submit(&self, context: &SendContext) -> Result<(), SendError> {
        let request = context.build_request();
        let id = context.message.remote_id_or_empty().to_string();
        self.transport
            .call(ApiRequest::SendMessage {
                id,
                request: Box::new(request),
            })
            .await?;
        Ok(())
    }

    fn report_failure(&self, context: &SendContext, failure: &SendFailure) {
        let kind = failure.kind(&self.config.codes);
        warn!(
            local_id = %context.local_id,
            stage = failure.stage.as_str(),
            ?kind,
            error = %failure.error,
            "Send failed"
        );
        let detail = format!("{} (stages: {})", failure.error, context.trail());
        self.notifications
            .schedule_send_failed(&notification_id(context), &detail);
    }

    async fn commit_sent(&self, context: &SendContext) -> crate::Result<()> {
        let labels = self.config.labels.clone();
        let local_id = context.local_id.clone();
        let attachment_count = u32::try_from(context.attachments.len()).unwrap_or(u32::MAX);
        let encryption = match (context.message.is_outside_encrypted(), context.has_outside_recipient()) {
            (true, true) => EncryptionKind::OutsideEncrypted,
            (false, true) => EncryptionKind::OutsidePlain,
            (_, false) => EncryptionKind::Internal,
        };

        transact(self.replica.as_ref(), move |tx| {
            let Some(mut message) = tx.message(&local_id) else {
                return Ok(());
            };
            if !message.has_label(&labels.draft) {
                return Ok(());
            }

            message.encryption = encryption;
            if attachment_count > 0 {
                message.num_attachments = attachment_count;
            }
            message.mime_type = "text/html".to_string();
            message.unread = false;
            message.detail_downloaded = false;
            message.label_ids.remove(&labels.draft);
            message.label_ids.insert(labels.sent.clone());
            let parent = message.parent_local_id.clone().zip(message.reply_action);
            tx.upsert_message(message);

            if let Some((parent_id, action)) = parent {
                if let Some(mut parent) = tx.message(&parent_id) {
                    match action {
                        ReplyAction::Reply => parent.replied = true,
                        ReplyAction::ReplyAll => parent.replied_all = true,
                        ReplyAction::Forward => parent.forwarded = true,
                    }
                    tx.upsert_message(parent);
                }
            }
            Ok(())
        })
        .await
    }
}

impl SendContext {
    fn build_request(&self) -> SendRequest {
        let clear = self.plans.iter().any(|plan| plan.scheme.is_clear());
        let body_key = self
            .body_session
            .as_ref()
            .filter(|_| clear)
            .map(SessionKeyPayload::from);
        let attachment_keys = if clear {
            self.attachment_sessions
                .iter()
                .map(|(id, session)| (id.clone(), SessionKeyPayload::from(session)))
                .collect()
        } else {
            BTreeMap::new()
        };

        SendRequest {
            expiration_time: self.message.expiration_offset,
            packages: self.packages.clone(),
            body: STANDARD.encode(&self.body_data),
            mime_body: self.mime_body.as_ref().map(|data| STANDARD.encode(data)),
            plain_text_body: self.plain_body.as_ref().map(|data| STANDARD.encode(data)),
            body_key,
            attachment_keys,
        }
    }
}

fn secrets(context: &SendContext) -> Result<(&SenderKeys, &Passphrase), SendError> {
    context
        .sender_keys
        .as_ref()
        .zip(context.passphrase.as_ref())
        .ok_or(SendError::CredentialsLocked)
}

fn body_session(context: &SendContext) -> Result<&SessionKey, SendError> {
    context
        .body_session
        .as_ref()
        .ok_or_else(|| SendError::Crypto(CryptoError::MissingKey("body session".into())))
}

fn notification_id(context: &SendContext) -> String {
    context
        .message
        .remote_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| context.local_id.clone())
}
