//! Scripted transport and helpers shared by the stream unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, StreamExt};
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::retry::ReconnectPolicy;
use crate::stream::client::{ConnectionState, StreamClientOptions};
use crate::stream::proto::StreamUpdate;
use crate::stream::sse::{MessageStream, Transport, TransportError};

pub(crate) type MessageSender = mpsc::UnboundedSender<Result<String, TransportError>>;

enum Script {
    Fail,
    Hang,
    Open(mpsc::UnboundedReceiver<Result<String, TransportError>>),
}

/// Transport whose connection attempts play back queued outcomes in order.
///
/// An attempt with nothing queued never resolves.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_failure(&self) {
        self.push(Script::Fail);
    }

    pub(crate) fn push_hang(&self) {
        self.push(Script::Hang);
    }

    /// Queues a successful connection; dropping the sender ends it.
    pub(crate) fn push_open(&self) -> MessageSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Open(rx));
        tx
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn push(&self, script: Script) {
        self.scripts.lock().expect("scripts").push_back(script);
    }
}

impl Transport for ScriptedTransport {
    fn connect(
        &self,
        _url: &str,
        _headers: HeaderMap,
    ) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().expect("scripts").pop_front();
        match script {
            Some(Script::Fail) => {
                future::ready::<Result<MessageStream, TransportError>>(Err(TransportError::Closed))
                    .boxed()
            }
            Some(Script::Open(rx)) => {
                let messages: MessageStream = UnboundedReceiverStream::new(rx).boxed();
                future::ready(Ok(messages)).boxed()
            }
            Some(Script::Hang) | None => {
                future::pending::<Result<MessageStream, TransportError>>().boxed()
            }
        }
    }
}

/// Default options with a long connect timeout and the given backoff.
pub(crate) fn options_with(max_attempts: u32, base_delay_ms: u64) -> StreamClientOptions {
    StreamClientOptions::default()
        .with_connect_timeout(Duration::from_secs(60))
        .with_reconnect(ReconnectPolicy::new(
            max_attempts,
            Duration::from_millis(base_delay_ms),
        ))
}

/// Callback that forwards every delivered update into a channel.
pub(crate) fn recorder() -> (
    impl Fn(&StreamUpdate) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<StreamUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |update: &StreamUpdate| {
        let _ = tx.send(update.clone());
    };
    (callback, rx)
}

pub(crate) fn update_json(ticker: &str, pl: f64) -> String {
    serde_json::json!({
        "type": "update",
        "data": {"ticker_pl": [{"ticker": ticker, "pl": pl}]}
    })
    .to_string()
}

/// Waits until the observed state satisfies `predicate` and returns it.
pub(crate) async fn wait_for_state<P>(
    state: &mut watch::Receiver<ConnectionState>,
    predicate: P,
) -> ConnectionState
where
    P: Fn(&ConnectionState) -> bool,
{
    let wait = async {
        loop {
            let current = state.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            if state.changed().await.is_err() {
                panic!("state channel closed while waiting");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for connection state")
}
