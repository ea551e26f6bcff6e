//! Session reconciliation: canonical transcript ownership and the send
//! state machine
//!
//! The manager is the only writer of the in-memory session. The stream
//! consumer is a read-only producer of deltas; everything it emits is folded
//! into the placeholder message here. Observers get immutable snapshots over
//! a watch channel, published at most once per throttle interval while
//! streaming, with an unconditional final flush.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::client::{OPENROUTER_BASE_URL, OpenRouterClient, StreamEvent};
use crate::error::{Error, Result};
use crate::models::{default_model, display_name, find_model, system_prompt};
use crate::retry::RetryPolicy;
use crate::storage::{ChatStore, StorageBackend};
use crate::types::{ChatMessage, ChatRequest, Conversation, Message, Role, Session, now_millis};

/// Externally observable state updates fire at most once per interval
pub const UPDATE_THROTTLE: Duration = Duration::from_millis(50);

const TITLE_MAX_CHARS: usize = 50;

/// User-facing notification (the UI renders these as toasts)
#[derive(Debug, Clone)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

/// How a send ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stream ran to its terminal sentinel
    Completed,
    /// User stopped generation; partial content was kept
    Cancelled,
    /// Nothing to send (empty input)
    Ignored,
}

/// Cloneable handle for stopping the in-flight generation from outside the
/// manager borrow (e.g. a stop button while `send_message` is awaited)
#[derive(Clone)]
pub struct StopHandle {
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Idempotent: stopping twice, or after completion, is a no-op
    pub fn stop(&self) {
        if let Some(token) = self.in_flight.lock().unwrap().as_ref() {
            token.cancel();
        }
    }
}

pub struct SessionManager<S: StorageBackend> {
    store: ChatStore<S>,
    current: Option<Session>,
    selected_model: String,
    base_url: String,
    request_retry: RetryPolicy,
    read_retry: RetryPolicy,
    throttle: Duration,
    in_flight: Arc<Mutex<Option<CancellationToken>>>,
    snapshot_tx: watch::Sender<Option<Session>>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: Option<mpsc::UnboundedReceiver<Notice>>,
}

impl<S: StorageBackend> SessionManager<S> {
    /// Restore persisted state: selected model, current session
    pub async fn new(backend: S) -> Result<Self> {
        let store = ChatStore::new(backend);

        let selected_model = store
            .selected_model()
            .await?
            .filter(|id| find_model(id).is_some())
            .unwrap_or_else(|| default_model().id.clone());
        let current = store.current_session().await?;

        let (snapshot_tx, _) = watch::channel(current.clone());
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store,
            current,
            selected_model,
            base_url: OPENROUTER_BASE_URL.to_string(),
            request_retry: RetryPolicy::requests(),
            read_retry: RetryPolicy::reads(),
            throttle: UPDATE_THROTTLE,
            in_flight: Arc::new(Mutex::new(None)),
            snapshot_tx,
            notices_tx,
            notices_rx: Some(notices_rx),
        })
    }

    /// Point the client at a different completion endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry_policies(mut self, requests: RetryPolicy, reads: RetryPolicy) -> Self {
        self.request_retry = requests;
        self.read_retry = reads;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Immutable session snapshots, refreshed after every transition
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.snapshot_tx.subscribe()
    }

    /// User-facing notifications; can be taken once
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notices_rx.take()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Idempotent stop of the in-flight generation, if any
    pub fn stop_generation(&self) {
        if let Some(token) = self.in_flight.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    pub fn is_generating(&self) -> bool {
        self.in_flight.lock().unwrap().is_some()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn selected_model(&self) -> &str {
        &self.selected_model
    }

    /// Typed access to persisted preferences, credential and lists
    pub fn store(&self) -> &ChatStore<S> {
        &self.store
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.current.clone());
    }

    fn notify(&self, title: &str, description: String) {
        let _ = self.notices_tx.send(Notice {
            title: title.to_string(),
            description,
        });
    }

    /// Create an empty session and make it current. It is not added to the
    /// history list until it holds at least one message.
    pub async fn start_new_chat(&mut self) -> Result<()> {
        let session = Session::new(&self.selected_model);
        self.store.set_current_session(&session).await?;
        self.current = Some(session);
        self.publish();
        Ok(())
    }

    /// Switch the selected model.
    ///
    /// An empty current session is retargeted in place; a session that
    /// already has messages is left intact and a new one is started, so
    /// models are never mixed mid-transcript. An in-flight stream is
    /// cancelled before the switch takes effect.
    pub async fn select_model(&mut self, model_id: &str) -> Result<()> {
        if find_model(model_id).is_none() {
            return Err(Error::UnknownModel(model_id.to_string()));
        }

        self.stop_generation();
        self.selected_model = model_id.to_string();
        self.store.set_selected_model(model_id).await?;

        let needs_new_session = self
            .current
            .as_ref()
            .is_some_and(|s| !s.messages.is_empty() && s.model_id != model_id);

        if needs_new_session {
            self.start_new_chat().await?;
        } else if let Some(session) = &mut self.current {
            session.model_id = model_id.to_string();
            let snapshot = session.clone();
            self.store.set_current_session(&snapshot).await?;
            self.publish();
        }
        Ok(())
    }

    /// Make a stored session current, falling back to a fresh one when the
    /// id is unknown. An in-flight stream is cancelled first.
    pub async fn load_session(&mut self, session_id: &str) -> Result<()> {
        self.stop_generation();
        match self.store.session_by_id(session_id).await? {
            Some(session) => {
                self.selected_model = session.model_id.clone();
                self.store.set_selected_model(&session.model_id).await?;
                self.store.set_current_session(&session).await?;
                self.current = Some(session);
                self.publish();
            }
            None => self.start_new_chat().await?,
        }
        Ok(())
    }

    /// Explicit user deletion; the only way a session with a successful
    /// exchange leaves storage
    pub async fn delete_session(&mut self, session_id: &str) -> Result<()> {
        if self.current.as_ref().is_some_and(|s| s.id == session_id) {
            self.stop_generation();
            self.current = None;
        }
        self.store.remove_session(session_id).await?;
        self.publish();
        Ok(())
    }

    /// Send a user message and stream the assistant's reply into the
    /// transcript. Rejected while another send is in flight.
    pub async fn send_message(&mut self, content: &str) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        // Configuration errors are detected before any network call or
        // session mutation
        let api_key = match self.store.api_key().await? {
            Some(key) if !key.is_empty() => key,
            _ => {
                self.notify(
                    "API Key Required",
                    "Please set your API key in the settings.".to_string(),
                );
                return Err(Error::MissingApiKey);
            }
        };

        let cancel = self.begin_send()?;
        let result = self.drive_send(content, api_key, cancel).await;
        self.in_flight.lock().unwrap().take();
        result
    }

    /// Reserve the single in-flight slot
    fn begin_send(&self) -> Result<CancellationToken> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.is_some() {
            return Err(Error::RequestInFlight);
        }
        let token = CancellationToken::new();
        *in_flight = Some(token.clone());
        Ok(token)
    }

    async fn drive_send(
        &mut self,
        content: &str,
        api_key: String,
        cancel: CancellationToken,
    ) -> Result<SendOutcome> {
        let mut session = match self.current.take() {
            Some(session) => session,
            None => {
                let session = Session::new(&self.selected_model);
                self.store.set_current_session(&session).await?;
                session
            }
        };
        session.model_id = self.selected_model.clone();

        let user_message = Message::user(content, &self.selected_model);
        let user_content = user_message.content.clone();
        session.messages.push(user_message);
        session.updated_at = now_millis();

        self.store.set_current_session(&session).await?;
        self.store.upsert_session(&session).await?;
        self.store
            .upsert_conversation(Conversation::from(&session))
            .await?;

        // Request history: system prompt plus everything before the
        // placeholder, oldest first
        let mut wire = vec![ChatMessage {
            role: Role::System,
            content: system_prompt(display_name(&self.selected_model)),
        }];
        wire.extend(session.wire_messages());

        let placeholder = Message::assistant_placeholder(&self.selected_model);
        let placeholder_id = placeholder.id.clone();
        session.messages.push(placeholder);
        session.updated_at = now_millis();
        self.current = Some(session);
        self.publish();

        tracing::debug!(model = %self.selected_model, "starting streamed completion");

        let client = OpenRouterClient::with_base_url(api_key, &self.base_url)
            .with_retry_policies(self.request_retry.clone(), self.read_retry.clone());
        let request = ChatRequest::streaming(self.selected_model.clone(), wire);
        let mut events = ReceiverStream::new(client.chat_stream(request, cancel).await);

        let mut accumulated = String::new();
        let mut last_flush: Option<Instant> = None;

        let terminal = loop {
            match events.next().await {
                Some(StreamEvent::Delta(text)) => {
                    // The accumulator advances on every delta; only the
                    // externally visible snapshot is throttled
                    accumulated.push_str(&text);
                    self.set_placeholder_content(&placeholder_id, &accumulated);
                    if last_flush.is_none_or(|t| t.elapsed() >= self.throttle) {
                        last_flush = Some(Instant::now());
                        self.publish();
                    }
                }
                Some(StreamEvent::Done { cancelled }) => break Ok(cancelled),
                Some(StreamEvent::Failed(err)) => break Err(err),
                // Producer went away without a terminal event
                None => break Err(Error::Stream("stream ended unexpectedly".to_string())),
            }
        };

        match terminal {
            Ok(cancelled) => {
                self.finalize(&placeholder_id, &user_content).await?;
                if cancelled {
                    tracing::debug!("generation stopped by user");
                    Ok(SendOutcome::Cancelled)
                } else {
                    Ok(SendOutcome::Completed)
                }
            }
            Err(err) => {
                self.roll_back(&placeholder_id, &err).await?;
                Err(err)
            }
        }
    }

    fn set_placeholder_content(&mut self, placeholder_id: &str, content: &str) {
        if let Some(session) = &mut self.current {
            if let Some(message) = session.messages.iter_mut().find(|m| m.id == placeholder_id) {
                message.content = content.to_string();
                session.updated_at = now_millis();
            }
        }
    }

    /// Success-like terminal transition: seal the placeholder, derive the
    /// title on the first exchange, persist everywhere, and flush the final
    /// snapshot regardless of the throttle
    async fn finalize(&mut self, placeholder_id: &str, user_content: &str) -> Result<()> {
        let Some(session) = &mut self.current else {
            return Ok(());
        };

        if let Some(message) = session.messages.iter_mut().find(|m| m.id == placeholder_id) {
            message.in_progress = false;
        }
        session.updated_at = now_millis();
        if session.messages.len() == 2 {
            session.title = derive_title(user_content);
        }

        let snapshot = session.clone();
        self.store.set_current_session(&snapshot).await?;
        self.store.upsert_session(&snapshot).await?;
        self.store
            .upsert_conversation(Conversation::from(&snapshot))
            .await?;
        self.publish();
        Ok(())
    }

    /// Failure transition. A failed first exchange leaves no trace: the
    /// whole session is dropped from storage and the current pointer is
    /// cleared. Otherwise only the placeholder is trimmed and the session
    /// stays at its last-known-good state.
    async fn roll_back(&mut self, placeholder_id: &str, err: &Error) -> Result<()> {
        self.notify("Error", err.to_string());

        let Some(mut session) = self.current.take() else {
            return Ok(());
        };

        let first_exchange = session.messages.len() == 2
            && session.messages.last().is_some_and(|m| m.id == placeholder_id);

        if first_exchange {
            tracing::debug!(session = %session.id, "discarding session after failed first exchange");
            self.store.remove_session(&session.id).await?;
            self.current = None;
        } else {
            session.messages.retain(|m| m.id != placeholder_id);
            let snapshot = session.clone();
            self.store.set_current_session(&snapshot).await?;
            self.store.upsert_session(&snapshot).await?;
            self.current = Some(session);
        }
        self.publish();
        Ok(())
    }
}

/// Title from the first user message: truncated to 50 characters with an
/// ellipsis marker when longer
fn derive_title(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() > TITLE_MAX_CHARS {
        let mut title: String = chars[..TITLE_MAX_CHARS].iter().collect();
        title.push_str("...");
        title
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn manager() -> SessionManager<MemoryStore> {
        SessionManager::new(MemoryStore::new()).await.unwrap()
    }

    #[test]
    fn test_title_truncated_at_fifty_chars() {
        let message = "Explain quantum computing in simple terms, and give three examples please";
        let title = derive_title(message);

        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
        assert_eq!(
            title,
            format!("{}...", message.chars().take(50).collect::<String>())
        );
    }

    #[test]
    fn test_short_title_kept_verbatim() {
        assert_eq!(derive_title("Hello there"), "Hello there");

        let exactly_fifty: String = "x".repeat(50);
        assert_eq!(derive_title(&exactly_fifty), exactly_fifty);
    }

    #[tokio::test]
    async fn test_new_chat_is_not_added_to_history() {
        let mut manager = manager().await;
        manager.start_new_chat().await.unwrap();

        assert!(manager.current_session().is_some());
        assert!(manager.store().history().await.unwrap().is_empty());
        assert!(manager.store().conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_model_on_empty_session_updates_in_place() {
        let mut manager = manager().await;
        manager.start_new_chat().await.unwrap();
        let session_id = manager.current_session().unwrap().id.clone();

        let other = "deepseek/deepseek-chat-v3-0324:free";
        manager.select_model(other).await.unwrap();

        let session = manager.current_session().unwrap();
        assert_eq!(session.id, session_id);
        assert_eq!(session.model_id, other);
        assert_eq!(manager.selected_model(), other);
        assert_eq!(
            manager.store().selected_model().await.unwrap().as_deref(),
            Some(other)
        );
    }

    #[tokio::test]
    async fn test_select_model_with_messages_starts_new_session() {
        let mut manager = manager().await;
        manager.start_new_chat().await.unwrap();
        let old_id = {
            let session = manager.current.as_mut().unwrap();
            let model = session.model_id.clone();
            session.messages.push(Message::user("hi", model));
            session.id.clone()
        };

        let other = "qwen/qwen3-235b-a22b:free";
        manager.select_model(other).await.unwrap();

        let session = manager.current_session().unwrap();
        assert_ne!(session.id, old_id);
        assert!(session.messages.is_empty());
        assert_eq!(session.model_id, other);
    }

    #[tokio::test]
    async fn test_select_model_rejects_unknown_id() {
        let mut manager = manager().await;
        let result = manager.select_model("vendor/nonexistent").await;
        assert!(matches!(result, Err(Error::UnknownModel(_))));
    }

    #[tokio::test]
    async fn test_load_unknown_session_starts_fresh() {
        let mut manager = manager().await;
        manager.load_session("no-such-id").await.unwrap();

        let session = manager.current_session().unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_stream_is_noop() {
        let manager = manager().await;
        assert!(!manager.is_generating());
        manager.stop_generation();
        manager.stop_generation();
        assert!(!manager.is_generating());

        let handle = manager.stop_handle();
        handle.stop();
        handle.stop();
    }

    #[tokio::test]
    async fn test_manager_restores_persisted_state() {
        let backend = Arc::new(MemoryStore::new());
        {
            let store = ChatStore::new(Arc::clone(&backend));
            let mut session = Session::new("qwen/qwen3-235b-a22b:free");
            let model = session.model_id.clone();
            session.messages.push(Message::user("hi", model));
            store.set_current_session(&session).await.unwrap();
            store
                .set_selected_model("qwen/qwen3-235b-a22b:free")
                .await
                .unwrap();
        }

        let manager = SessionManager::new(backend).await.unwrap();
        assert_eq!(manager.selected_model(), "qwen/qwen3-235b-a22b:free");
        assert_eq!(manager.current_session().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_falls_back_to_default_model() {
        let backend = Arc::new(MemoryStore::new());
        {
            let store = ChatStore::new(Arc::clone(&backend));
            store.set_selected_model("vendor/retired-model").await.unwrap();
        }

        let manager = SessionManager::new(backend).await.unwrap();
        assert_eq!(manager.selected_model(), default_model().id);
    }
}
