//! Stream client entry point and connection controller.
//!
//! [`StreamClient`] is the consumer-facing handle: it hands out subscriptions
//! and shares one physical event-stream connection between all of them. The
//! [`ConnectionController`] owns that connection, runs it on a background
//! worker task, and reconnects on failure under a [`ReconnectPolicy`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, ReconnectPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::stream::proto::{decode, StreamUpdate};
use crate::stream::registry::{SubscriberRegistry, Subscription, UpdateSink};
use crate::stream::sse::{MessageStream, SseTransport, Transport, TransportError};

/// Environment variable overriding the backend base URL.
pub const BASE_URL_ENV: &str = "TRADEDASH_API_URL";
/// Path of the push endpoint, relative to the base URL.
pub const STREAM_PATH: &str = "/stream";

const LOG_PREVIEW_LEN: usize = 120;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const BASE_URL: &'static str = "http://localhost:4000/api";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = DEFAULT_MAX_ATTEMPTS;
    pub const RECONNECT_BASE_DELAY: Duration = DEFAULT_BASE_DELAY;
}

/// Fixed configuration, resolved once when the client is built.
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Backend API base URL; the stream lives at `{base_url}/stream`.
    pub base_url: String,
    /// Upper bound on establishing a connection, response headers included.
    pub connect_timeout: Duration,
    /// Backoff limits for automatic reconnects.
    pub reconnect: ReconnectPolicy,
    /// Sent as `x-api-key` when set.
    pub api_key: Option<SecretString>,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            base_url: StreamDefaults::BASE_URL.to_string(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::new(
                StreamDefaults::MAX_RECONNECT_ATTEMPTS,
                StreamDefaults::RECONNECT_BASE_DELAY,
            ),
            api_key: None,
        }
    }
}

impl StreamClientOptions {
    /// Defaults with the base URL taken from [`BASE_URL_ENV`] when it is set.
    pub fn from_env() -> Self {
        Self::default().with_base_url(resolve_base_url(std::env::var(BASE_URL_ENV).ok()))
    }

    /// Sets the backend base URL. Trailing whitespace and slashes are dropped.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = normalize_base_url(&base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Full URL of the push endpoint.
    pub fn stream_url(&self) -> String {
        format!("{}{}", normalize_base_url(&self.base_url), STREAM_PATH)
    }

    fn headers(&self) -> Result<HeaderMap, StreamClientError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = self.api_key.as_ref() {
            let mut value: HeaderValue = api_key.expose_secret().parse()?;
            value.set_sensitive(true);
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }
}

fn resolve_base_url(configured: Option<String>) -> String {
    match configured {
        Some(url) if !url.trim().is_empty() => url,
        _ => StreamDefaults::BASE_URL.to_string(),
    }
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Lifecycle of the single physical connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened.
    Idle,
    Connecting,
    Open,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Torn down explicitly or after reconnect attempts ran out.
    Closed,
}

impl ConnectionState {
    /// Whether a connection exists or is being pursued.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Open | Self::Reconnecting { .. }
        )
    }
}

/// Errors produced while building a client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The client was built outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] TryCurrentError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),
}

/// Shared handle to the dashboard update stream.
///
/// Clones share one registry and therefore one physical connection. The
/// connection is opened by the first subscription and closed when the last
/// one goes away.
#[derive(Clone)]
pub struct StreamClient {
    registry: Arc<SubscriberRegistry>,
    stream_url: Arc<str>,
}

impl StreamClient {
    /// Builds a client from [`StreamClientOptions::from_env`].
    pub fn new() -> Result<Self, StreamClientError> {
        Self::with_options(StreamClientOptions::from_env())
    }

    /// Builds a client that speaks server-sent events over reqwest.
    pub fn with_options(options: StreamClientOptions) -> Result<Self, StreamClientError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Self::with_transport(options, SseTransport::new(http))
    }

    /// Builds a client over an explicit transport.
    ///
    /// Must be called from within a tokio runtime; the worker task that owns
    /// the connection is spawned onto it.
    pub fn with_transport<T>(
        options: StreamClientOptions,
        transport: T,
    ) -> Result<Self, StreamClientError>
    where
        T: Transport,
    {
        let runtime = Handle::try_current()?;
        let stream_url: Arc<str> = options.stream_url().into();
        let settings = ControllerSettings {
            url: stream_url.to_string(),
            headers: options.headers()?,
            connect_timeout: options.connect_timeout,
            reconnect: options.reconnect,
        };
        let registry = SubscriberRegistry::new(settings, Arc::new(transport), runtime);
        Ok(Self {
            registry,
            stream_url,
        })
    }

    /// Registers `callback` for every update delivered while subscribed.
    ///
    /// The returned handle unsubscribes when [`Subscription::unsubscribe`] is
    /// called or when it is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StreamUpdate) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub fn state(&self) -> ConnectionState {
        self.registry.controller().state()
    }

    /// Receiver that observes every connection state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.registry.controller().watch_state()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
}

pub(crate) struct ControllerSettings {
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) connect_timeout: Duration,
    pub(crate) reconnect: ReconnectPolicy,
}

/// Owner of the single physical connection.
///
/// `open` and `close` only mutate state and spawn or abort the worker; they
/// never wait on I/O. Each spawned worker carries an epoch and stops touching
/// shared state once a newer `open` or a `close` has superseded it.
pub struct ConnectionController {
    shared: Arc<ControllerShared>,
}

struct ControllerShared {
    url: String,
    headers: HeaderMap,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    sink: Weak<dyn UpdateSink>,
    inner: Mutex<ControllerInner>,
    state_tx: watch::Sender<ConnectionState>,
}

struct ControllerInner {
    state: ConnectionState,
    policy: ReconnectPolicy,
    epoch: u64,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionController {
    pub(crate) fn new(
        settings: ControllerSettings,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        sink: Weak<dyn UpdateSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let mut policy = settings.reconnect;
        policy.reset();
        Self {
            shared: Arc::new(ControllerShared {
                url: settings.url,
                headers: settings.headers,
                connect_timeout: settings.connect_timeout,
                transport,
                runtime,
                sink,
                inner: Mutex::new(ControllerInner {
                    state: ConnectionState::Idle,
                    policy,
                    epoch: 0,
                    worker: None,
                }),
                state_tx,
            }),
        }
    }

    /// Starts connecting unless a connection is already open or in progress.
    ///
    /// From `Idle` or `Closed` this starts a fresh session with a zeroed
    /// attempt counter. From `Reconnecting` it cancels the pending delay and
    /// connects immediately, keeping the counter.
    pub fn open(&self) {
        let mut inner = self.shared.lock();
        let current = inner.state.clone();
        match current {
            ConnectionState::Connecting | ConnectionState::Open => {
                debug!(event = "stream_open_skipped", state = ?current);
                return;
            }
            ConnectionState::Idle | ConnectionState::Closed => inner.policy.reset(),
            ConnectionState::Reconnecting { .. } => {}
        }

        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        let epoch = inner.epoch;
        self.shared.set_state(&mut inner, ConnectionState::Connecting);

        let shared = Arc::clone(&self.shared);
        inner.worker = Some(self.shared.runtime.spawn(run_worker(shared, epoch)));
    }

    /// Tears down any live connection and cancels a pending reconnect.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        inner.epoch = inner.epoch.wrapping_add(1);
        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        if inner.state.is_live() {
            info!(event = "stream_closed", url = %self.shared.url);
        }
        self.shared.set_state(&mut inner, ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Consecutive failed attempts counted by the reconnect policy.
    #[cfg(test)]
    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().policy.attempts()
    }
}

impl ControllerShared {
    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut ControllerInner, state: ConnectionState) {
        debug!(event = "stream_state", from = ?inner.state, to = ?state);
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    fn mark_open(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.policy.reset();
        self.set_state(&mut inner, ConnectionState::Open);
        info!(event = "stream_open", url = %self.url);
        true
    }

    fn begin_attempt(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        self.set_state(&mut inner, ConnectionState::Connecting);
        true
    }

    /// Counts the failure and returns the delay before the next attempt, or
    /// `None` once the worker should stop.
    fn schedule_reconnect(&self, epoch: u64) -> Option<Duration> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }

        let step = inner.policy.next_delay();
        if !step.permitted {
            warn!(
                event = "stream_reconnect_exhausted",
                url = %self.url,
                attempts = step.attempt - 1,
                max_attempts = inner.policy.max_attempts
            );
            // Detach our own handle; the worker returns right after this.
            inner.worker = None;
            self.set_state(&mut inner, ConnectionState::Closed);
            return None;
        }

        info!(
            event = "stream_reconnect_scheduled",
            attempt = step.attempt,
            delay_ms = step.delay.as_millis() as u64
        );
        self.set_state(
            &mut inner,
            ConnectionState::Reconnecting {
                attempt: step.attempt,
                delay: step.delay,
            },
        );
        Some(step.delay)
    }

    /// Reads messages until the connection fails or ends.
    async fn pump(&self, epoch: u64, mut messages: MessageStream) -> TransportError {
        while let Some(item) = messages.next().await {
            match item {
                Ok(text) => {
                    if !self.is_current(epoch) {
                        return TransportError::Closed;
                    }
                    self.dispatch(&text);
                }
                Err(err) => return err,
            }
        }
        TransportError::Closed
    }

    fn dispatch(&self, text: &str) {
        match decode(text) {
            Ok(update) => {
                if let Some(sink) = self.sink.upgrade() {
                    sink.fan_out(update);
                }
            }
            Err(err) => {
                let preview: String = text.chars().take(LOG_PREVIEW_LEN).collect();
                warn!(event = "stream_decode_failed", error = %err, preview = %preview);
            }
        }
    }
}

async fn run_worker(shared: Arc<ControllerShared>, epoch: u64) {
    loop {
        debug!(event = "stream_connecting", url = %shared.url);
        let connect = shared.transport.connect(&shared.url, shared.headers.clone());
        let failure = match with_timeout(shared.connect_timeout, connect).await {
            Ok(Ok(messages)) => {
                if !shared.mark_open(epoch) {
                    return;
                }
                shared.pump(epoch, messages).await
            }
            Ok(Err(err)) => err,
            Err(_) => TransportError::Timeout,
        };
        warn!(event = "stream_transport_error", url = %shared.url, error = %failure);

        let Some(delay) = shared.schedule_reconnect(epoch) else {
            return;
        };
        tokio::time::sleep(delay).await;
        if !shared.begin_attempt(epoch) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::{
        normalize_base_url, resolve_base_url, ConnectionState, StreamClient, StreamClientError,
        StreamClientOptions, StreamDefaults,
    };
    use crate::retry::ReconnectPolicy;
    use crate::stream::testutil::{
        options_with, recorder, update_json, wait_for_state, ScriptedTransport,
    };

    #[test]
    fn options_default_to_local_backend() {
        let options = StreamClientOptions::default();
        assert_eq!(options.stream_url(), "http://localhost:4000/api/stream");
        assert_eq!(options.reconnect.max_attempts, 10);
        assert_eq!(options.reconnect.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn base_url_override_is_normalized() {
        let options =
            StreamClientOptions::default().with_base_url("https://desk.example/api/  \n");
        assert_eq!(options.base_url, "https://desk.example/api");
        assert_eq!(options.stream_url(), "https://desk.example/api/stream");
        assert_eq!(normalize_base_url("/api//"), "/api");
    }

    #[test]
    fn blank_environment_value_falls_back_to_default() {
        assert_eq!(resolve_base_url(None), StreamDefaults::BASE_URL);
        assert_eq!(resolve_base_url(Some("   ".to_string())), StreamDefaults::BASE_URL);
        assert_eq!(
            resolve_base_url(Some("http://10.0.0.5:4000/api".to_string())),
            "http://10.0.0.5:4000/api"
        );
    }

    #[test]
    fn api_key_is_sent_as_sensitive_header() {
        let options = StreamClientOptions::default()
            .with_api_key(SecretString::new("test-api-key".to_string()));
        let headers = options.headers().expect("headers");
        let value = headers.get("x-api-key").expect("api key header");
        assert_eq!(value, "test-api-key");
        assert!(value.is_sensitive());
    }

    #[test]
    fn api_key_with_newline_is_rejected() {
        let options = StreamClientOptions::default()
            .with_api_key(SecretString::new("bad\nkey".to_string()));
        assert!(matches!(
            options.headers(),
            Err(StreamClientError::InvalidApiKeyHeader(_))
        ));
    }

    #[test]
    fn building_outside_runtime_fails() {
        let result = StreamClient::with_transport(
            StreamClientOptions::default(),
            ScriptedTransport::new(),
        );
        assert!(matches!(result, Err(StreamClientError::NoRuntime(_))));
    }

    #[test]
    fn only_active_states_count_as_live() {
        assert!(!ConnectionState::Idle.is_live());
        assert!(!ConnectionState::Closed.is_live());
        assert!(ConnectionState::Connecting.is_live());
        assert!(ConnectionState::Open.is_live());
        assert!(ConnectionState::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(1)
        }
        .is_live());
    }

    #[tokio::test]
    async fn connection_is_lazy() {
        let transport = ScriptedTransport::new();
        let client =
            StreamClient::with_transport(options_with(5, 10), transport.clone()).expect("client");

        assert_eq!(client.state(), ConnectionState::Idle);
        tokio::task::yield_now().await;
        assert_eq!(transport.connects(), 0);
        assert_eq!(client.stream_url(), "http://localhost:4000/api/stream");
    }

    #[tokio::test]
    async fn successful_open_resets_attempt_counter() {
        let transport = ScriptedTransport::new();
        transport.push_failure();
        let first = transport.push_open();
        let client =
            StreamClient::with_transport(options_with(5, 100), transport.clone()).expect("client");
        let mut state = client.watch_state();
        let (record, mut received) = recorder();

        let _subscription = client.subscribe(record);

        wait_for_state(&mut state, |s| *s == ConnectionState::Open).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(client.registry.controller().reconnect_attempts(), 0);

        first
            .send(Ok(update_json("AAPL", 1.0)))
            .expect("stream open");
        let update = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("delivery")
            .expect("recorder open");
        assert!(update.data.is_some());

        // A later failure counts from attempt 1 again, with the base delay.
        transport.push_hang();
        drop(first);
        let reconnecting = wait_for_state(&mut state, |s| {
            matches!(s, ConnectionState::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            reconnecting,
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(100),
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_settles_in_closed_without_notifying_subscribers() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.push_failure();
        }
        let client =
            StreamClient::with_transport(options_with(2, 1), transport.clone()).expect("client");
        let mut state = client.watch_state();
        let (record, mut received) = recorder();

        let _subscription = client.subscribe(record);

        wait_for_state(&mut state, |s| *s == ConnectionState::Closed).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(client.subscriber_count(), 1);
        assert!(received.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.connects(), 3, "no attempts after exhaustion");
    }

    #[tokio::test]
    async fn new_subscriber_after_exhaustion_gets_a_fresh_budget() {
        let transport = ScriptedTransport::new();
        transport.push_failure();
        transport.push_failure();
        let client =
            StreamClient::with_transport(options_with(1, 50), transport.clone()).expect("client");
        let mut state = client.watch_state();

        let first = client.subscribe(|_| {});
        wait_for_state(&mut state, |s| *s == ConnectionState::Closed).await;
        assert_eq!(client.registry.controller().reconnect_attempts(), 2);

        transport.push_failure();
        transport.push_hang();
        let _second = client.subscribe(|_| {});

        let reconnecting = wait_for_state(&mut state, |s| {
            matches!(s, ConnectionState::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            reconnecting,
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(50),
            }
        );
        wait_for_state(&mut state, |s| *s == ConnectionState::Connecting).await;
        assert_eq!(transport.connects(), 4);
        drop(first);
    }

    #[tokio::test]
    async fn connect_timeout_counts_as_transport_failure() {
        let transport = ScriptedTransport::new();
        transport.push_hang();
        transport.push_hang();
        let options = options_with(3, 1000).with_connect_timeout(Duration::from_millis(20));
        let client = StreamClient::with_transport(options, transport.clone()).expect("client");
        let mut state = client.watch_state();

        let _subscription = client.subscribe(|_| {});

        let reconnecting = wait_for_state(&mut state, |s| {
            matches!(s, ConnectionState::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            reconnecting,
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(1000),
            }
        );
    }

    #[tokio::test]
    async fn close_cancels_pending_reconnect() {
        let transport = ScriptedTransport::new();
        transport.push_failure();
        let options = StreamClientOptions::default()
            .with_reconnect(ReconnectPolicy::new(5, Duration::from_millis(30)));
        let client = StreamClient::with_transport(options, transport.clone()).expect("client");
        let mut state = client.watch_state();

        let subscription = client.subscribe(|_| {});
        wait_for_state(&mut state, |s| {
            matches!(s, ConnectionState::Reconnecting { .. })
        })
        .await;
        subscription.unsubscribe();

        assert_eq!(client.state(), ConnectionState::Closed);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.connects(), 1, "timer must not reopen after close");
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_without_disturbing_connection() {
        let transport = ScriptedTransport::new();
        let sender = transport.push_open();
        let client =
            StreamClient::with_transport(options_with(5, 10), transport.clone()).expect("client");
        let mut state = client.watch_state();
        let (record, mut received) = recorder();
        let _subscription = client.subscribe(record);
        wait_for_state(&mut state, |s| *s == ConnectionState::Open).await;

        sender.send(Ok("{not json".to_string())).expect("send");
        sender
            .send(Ok(r#"{"type":"heartbeat"}"#.to_string()))
            .expect("send");
        sender.send(Ok(update_json("MSFT", 2.5))).expect("send");

        let update = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("delivery")
            .expect("recorder open");
        let ticker_pl = update.data.and_then(|d| d.ticker_pl).expect("ticker_pl");
        assert_eq!(ticker_pl[0].ticker, "MSFT");
        assert!(received.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(transport.connects(), 1);
    }
}
