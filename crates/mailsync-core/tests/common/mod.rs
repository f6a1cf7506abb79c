//! Test doubles shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailsync_core::crypto::{EncryptedPayload, PrivateKey};
use mailsync_core::replica::{Message, transact};
use mailsync_core::sinks::{AccountSink, BadgeSink, DiagnosticsSink, NotificationSink};
use mailsync_core::transport::TransportResult;
use mailsync_core::{
    ApiRequest, ApiResponse, Collaborators, ContactDirectory, CredentialSource, CryptoError,
    CryptoProvider, MailSync, MemoryReplica, Passphrase, PinnedContact, SenderKeys, SessionKey,
    SyncConfig, TransportError,
};

/// Transport answering from per-endpoint scripts and recording every call.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<HashMap<&'static str, VecDeque<TransportResult<ApiResponse>>>>,
    fallback: Mutex<HashMap<&'static str, TransportResult<ApiResponse>>>,
    keys: Mutex<HashMap<String, TransportResult<ApiResponse>>>,
    calls: Mutex<Vec<ApiRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a one-shot response for `endpoint`.
    pub fn push(&self, endpoint: &'static str, response: TransportResult<ApiResponse>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(response);
    }

    /// Answer `endpoint` with `body` whenever nothing is scripted.
    pub fn always(&self, endpoint: &'static str, body: Value) {
        self.fallback
            .lock()
            .unwrap()
            .insert(endpoint, Ok(ApiResponse::new(1000, body)));
    }

    /// Fail `endpoint` with `error` whenever nothing is scripted.
    pub fn always_fail(&self, endpoint: &'static str, error: TransportError) {
        self.fallback.lock().unwrap().insert(endpoint, Err(error));
    }

    /// Answer public key lookups for `email`.
    pub fn keys_for(&self, email: &str, response: TransportResult<ApiResponse>) {
        self.keys.lock().unwrap().insert(email.to_string(), response);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<&'static str> {
        self.calls().iter().map(ApiRequest::endpoint).collect()
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.endpoints().iter().filter(|e| **e == endpoint).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        if let ApiRequest::PublicKeys { email } = request {
            if let Some(response) = self.keys.lock().unwrap().get(email) {
                return response.clone();
            }
        }
        let endpoint = request.endpoint();
        if let Some(response) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| Ok(ApiResponse::new(1000, json!({}))))
    }
}

#[async_trait]
impl mailsync_core::Transport for MockTransport {
    async fn call(&self, request: ApiRequest) -> TransportResult<ApiResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.answer(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

/// Reversible fake cryptography.
///
/// An armored message is `armored:<body>`; its key packet is `kp`.
#[derive(Default)]
pub struct MockCrypto;

impl CryptoProvider for MockCrypto {
    fn encrypt_and_sign(
        &self,
        data: &[u8],
        _key: &PrivateKey,
        _passphrase: &Passphrase,
    ) -> Result<EncryptedPayload, CryptoError> {
        Ok(EncryptedPayload {
            key_packet: b"att-kp".to_vec(),
            data_packet: data.to_vec(),
            signature: b"sig".to_vec(),
        })
    }

    fn decrypt(&self, armored: &str, _keys: &[PrivateKey], _passphrase: &Passphrase) -> Result<Vec<u8>, CryptoError> {
        armored
            .strip_prefix("armored:")
            .map(|body| body.as_bytes().to_vec())
            .ok_or_else(|| CryptoError::Decrypt("not armored".into()))
    }

    fn split_message(&self, armored: &str) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        armored
            .strip_prefix("armored:")
            .map(|body| (b"kp".to_vec(), body.as_bytes().to_vec()))
            .ok_or_else(|| CryptoError::Malformed("not armored".into()))
    }

    fn resolve_session_key(
        &self,
        key_packet: &[u8],
        _keys: &SenderKeys,
        _passphrase: &Passphrase,
    ) -> Result<SessionKey, CryptoError> {
        Ok(SessionKey {
            key: key_packet.to_vec(),
            algorithm: "aes256".into(),
        })
    }

    fn encrypt_with_session(&self, data: &[u8], _session: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        Ok([b"enc:".as_slice(), data].concat())
    }

    fn encrypt_session_key(&self, session: &SessionKey, public_key: &str) -> Result<Vec<u8>, CryptoError> {
        Ok([public_key.as_bytes(), b":", &session.key].concat())
    }

    fn encrypt_session_key_with_password(
        &self,
        session: &SessionKey,
        password: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok([b"pw:".as_slice(), password.as_bytes(), b":", &session.key].concat())
    }
}

/// Credentials that can be locked at runtime.
pub struct MockCredentials {
    pub unlocked: Mutex<bool>,
}

impl MockCredentials {
    pub fn unlocked() -> Arc<Self> {
        Arc::new(Self {
            unlocked: Mutex::new(true),
        })
    }

    pub fn set_unlocked(&self, unlocked: bool) {
        *self.unlocked.lock().unwrap() = unlocked;
    }
}

impl CredentialSource for MockCredentials {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn mailbox_passphrase(&self) -> Option<Passphrase> {
        self.unlocked
            .lock()
            .unwrap()
            .then(|| Passphrase::new("secret"))
    }

    fn sender_keys(&self, _address_id: &str) -> Option<SenderKeys> {
        Some(SenderKeys {
            address_keys: vec![PrivateKey::new("sender-key")],
            ..SenderKeys::default()
        })
    }
}

/// Contact directory without pinned keys.
#[derive(Default)]
pub struct NoPinnedContacts;

#[async_trait]
impl ContactDirectory for NoPinnedContacts {
    async fn pinned_contacts(&self, _emails: &[String]) -> mailsync_core::Result<Vec<PinnedContact>> {
        Ok(Vec::new())
    }
}

/// Sink recording everything it is told.
#[derive(Default)]
pub struct RecordingSink {
    pub badges: Mutex<Vec<u32>>,
    pub scheduled: Mutex<Vec<(String, String)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub cancelled_all: AtomicUsize,
    pub reports: Mutex<Vec<(String, String)>>,
    pub used_space: Mutex<Option<i64>>,
}

impl RecordingSink {
    pub fn last_badge(&self) -> Option<u32> {
        self.badges.lock().unwrap().last().copied()
    }
}

impl BadgeSink for RecordingSink {
    fn set_badge(&self, count: u32) {
        self.badges.lock().unwrap().push(count);
    }
}

impl NotificationSink for RecordingSink {
    fn schedule_send_failed(&self, message_id: &str, detail: &str) {
        self.scheduled
            .lock()
            .unwrap()
            .push((message_id.to_string(), detail.to_string()));
    }

    fn cancel_send_failed(&self, message_id: &str) {
        self.cancelled.lock().unwrap().push(message_id.to_string());
    }

    fn cancel_all(&self) {
        self.cancelled_all.fetch_add(1, Ordering::SeqCst);
    }
}

impl DiagnosticsSink for RecordingSink {
    fn report(&self, context: &str, detail: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((context.to_string(), detail.to_string()));
    }
}

impl AccountSink for RecordingSink {
    fn update_user(&self, _user: &Value) {}

    fn update_user_settings(&self, _settings: &Value) {}

    fn update_mail_settings(&self, _settings: &Value) {}

    fn upsert_address(&self, _id: &str, _address: &Value) {}

    fn delete_address(&self, _id: &str) {}

    fn set_used_space(&self, bytes: i64) {
        *self.used_space.lock().unwrap() = Some(bytes);
    }
}

/// A fully wired [`MailSync`] over test doubles.
pub struct Harness {
    pub sync: MailSync,
    pub replica: Arc<MemoryReplica>,
    pub transport: Arc<MockTransport>,
    pub credentials: Arc<MockCredentials>,
    pub sink: Arc<RecordingSink>,
}

/// Route engine logs to the test writer, honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsync_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_transport(MockTransport::new()).await
    }

    pub async fn with_transport(transport: Arc<MockTransport>) -> Self {
        Self::with_config(transport, SyncConfig::default()).await
    }

    pub async fn with_config(transport: Arc<MockTransport>, config: SyncConfig) -> Self {
        init_tracing();
        let replica = Arc::new(MemoryReplica::new());
        let credentials = MockCredentials::unlocked();
        let sink = Arc::new(RecordingSink::default());
        let parts = Collaborators {
            replica: replica.clone(),
            transport: transport.clone(),
            crypto: Arc::new(MockCrypto),
            credentials: credentials.clone(),
            contacts: Arc::new(NoPinnedContacts),
            badge: sink.clone(),
            notifications: sink.clone(),
            diagnostics: sink.clone(),
            account: sink.clone(),
        };
        let sync = MailSync::in_memory(config, parts).await.unwrap();
        Self {
            sync,
            replica,
            transport,
            credentials,
            sink,
        }
    }

    /// Store `message` directly, bypassing the queue.
    pub async fn seed(&self, message: Message) -> Message {
        transact(self.replica.as_ref(), move |tx| Ok(tx.upsert_message(message)))
            .await
            .unwrap()
    }

    pub async fn message(&self, local_id: &str) -> Option<Message> {
        let id = local_id.to_string();
        transact(self.replica.as_ref(), move |tx| Ok(tx.message(&id)))
            .await
            .unwrap()
    }

    pub async fn by_remote(&self, remote_id: &str) -> Option<Message> {
        let id = remote_id.to_string();
        transact(self.replica.as_ref(), move |tx| Ok(tx.message_by_remote_id(&id)))
            .await
            .unwrap()
    }
}

/// A synced inbox message.
pub fn inbox_message(remote_id: &str, unread: bool) -> Message {
    let mut message = Message::placeholder(remote_id);
    message.subject = format!("Subject {remote_id}");
    message.unread = unread;
    message.label_ids.insert("0".into());
    message.label_ids.insert("5".into());
    message
}

/// A saved draft with one recipient.
pub fn draft(remote_id: &str, to: &str) -> Message {
    let mut message = Message::placeholder(remote_id);
    message.subject = "Draft".into();
    message.body = "armored:<p>Hello</p>".into();
    message.address_id = "addr-1".into();
    message.detail_downloaded = true;
    message.to = vec![mailsync_core::replica::Recipient::new("", to)];
    message.label_ids.insert("1".into());
    message
}

/// Key response for an internal recipient.
pub fn internal_keys(public_key: &str) -> TransportResult<ApiResponse> {
    Ok(ApiResponse::new(
        1000,
        json!({"RecipientType": 1, "Keys": [{"Flags": 3, "PublicKey": public_key}]}),
    ))
}

/// Key response for an external recipient without keys.
pub fn external_keys() -> TransportResult<ApiResponse> {
    Ok(ApiResponse::new(1000, json!({"RecipientType": 2, "Keys": []})))
}
