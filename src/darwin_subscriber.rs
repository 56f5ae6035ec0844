use crate::config::BrokerConfig;
use crate::subscriber::Subscriber;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_stomp::client;
use tokio_stomp::client::ClientTransport;
use tokio_stomp::{FromServer, ToServer};

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Receiving,
    Reconnecting,
    Stopped,
}

impl SubscriberState {
    fn from_u8(value: u8) -> SubscriberState {
        match value {
            1 => SubscriberState::Connecting,
            2 => SubscriberState::Connected,
            3 => SubscriberState::Subscribed,
            4 => SubscriberState::Receiving,
            5 => SubscriberState::Reconnecting,
            6 => SubscriberState::Stopped,
            _ => SubscriberState::Disconnected,
        }
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connecting => "connecting",
            SubscriberState::Connected => "connected",
            SubscriberState::Subscribed => "subscribed",
            SubscriberState::Receiving => "receiving",
            SubscriberState::Reconnecting => "reconnecting",
            SubscriberState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Shared view of where the subscriber state machine currently is; the
/// readiness checks read this without touching the connection.
#[derive(Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn set(&self, state: SubscriberState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> SubscriberState {
        SubscriberState::from_u8(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub enum SubscriberError {
    NotSubscribed,
    EmptyMessage,
    NoBody,
    HeartbeatTimeout,
    AuthenticationFailed(String),
    Broker(String),
    Transport(String),
}

impl fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubscriberError::NotSubscribed => {
                write!(f, "Error reading from push-port STOMP stream: subscribe not yet called")
            }
            SubscriberError::EmptyMessage => {
                write!(f, "Error reading from push-port STOMP stream: received empty message")
            }
            SubscriberError::NoBody => {
                write!(f, "Error reading from push-port STOMP stream: message has no body")
            }
            SubscriberError::HeartbeatTimeout => {
                write!(f, "Error reading from push-port STOMP stream: missed two heartbeats")
            }
            SubscriberError::AuthenticationFailed(x) => {
                write!(f, "Push-port broker rejected credentials: {}", x)
            }
            SubscriberError::Broker(x) => write!(f, "Push-port broker error: {}", x),
            SubscriberError::Transport(x) => {
                write!(f, "Error reading from push-port STOMP stream: {}", x)
            }
        }
    }
}

impl SubscriberError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, SubscriberError::AuthenticationFailed(_))
    }
}

/// Exponential back-off from one second to the configured cap with ±20%
/// jitter. Authentication failures jump by an extra factor of four so a
/// bad password does not hammer the broker into locking the account.
pub struct Backoff {
    current_ms: u64,
    cap_ms: u64,
}

const BACKOFF_BASE_MS: u64 = 1_000;
const AUTH_BACKOFF_MULTIPLIER: u64 = 4;

impl Backoff {
    pub fn new(cap_ms: u64) -> Backoff {
        Backoff {
            current_ms: BACKOFF_BASE_MS,
            cap_ms: cap_ms.max(BACKOFF_BASE_MS),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current_ms);
        self.current_ms = (self.current_ms * 2).min(self.cap_ms);
        delay
    }

    pub fn next_delay_after_auth_failure(&mut self) -> Duration {
        self.current_ms = (self.current_ms * AUTH_BACKOFF_MULTIPLIER).min(self.cap_ms);
        self.jittered(self.current_ms)
    }

    pub fn reset(&mut self) {
        self.current_ms = BACKOFF_BASE_MS;
    }

    fn jittered(&self, base_ms: u64) -> Duration {
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((base_ms as f64 * factor) as u64)
    }
}

pub struct DarwinSubscriber {
    config: BrokerConfig,
    state: StateCell,
    stream: Option<SplitStream<ClientTransport>>,
    sink: Option<Arc<tokio::sync::Mutex<SplitSink<ClientTransport, tokio_stomp::Message<ToServer>>>>>,
    keepalive: Option<JoinHandle<()>>,
}

// horrible hacky workaround for tokio_stomp's lack of heartbeat support:
// an empty transaction begin/abort pair keeps bytes moving in both
// directions at the configured cadence
async fn keep_alive(
    sink: Arc<tokio::sync::Mutex<SplitSink<ClientTransport, tokio_stomp::Message<ToServer>>>>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let mut sink = sink.lock().await;
        if sink
            .send(
                ToServer::Begin {
                    transaction: "hb".to_string(),
                }
                .into(),
            )
            .await
            .is_err()
        {
            return;
        }
        if sink
            .send(
                ToServer::Abort {
                    transaction: "hb".to_string(),
                }
                .into(),
            )
            .await
            .is_err()
        {
            return;
        }
    }
}

impl DarwinSubscriber {
    pub fn new(config: BrokerConfig) -> DarwinSubscriber {
        DarwinSubscriber {
            config,
            state: StateCell::default(),
            stream: None,
            sink: None,
            keepalive: None,
        }
    }

    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    async fn teardown(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        self.stream = None;
        self.sink = None;
    }
}

#[async_trait]
impl Subscriber for DarwinSubscriber {
    async fn subscribe(&mut self) -> Result<(), SubscriberError> {
        self.teardown().await;
        self.state.set(SubscriberState::Connecting);
        tracing::info!(
            target: "subscriber",
            host = %self.config.host,
            topic = %self.config.topic,
            "connecting to push-port broker"
        );

        let address = format!("{}:{}", self.config.host, self.config.port);
        let transport = client::connect(
            &address,
            Some(self.config.user.clone()),
            Some(self.config.password.clone()),
        )
        .await
        .map_err(|e| {
            let what = e.to_string();
            if what.to_lowercase().contains("auth") || what.to_lowercase().contains("login") {
                SubscriberError::AuthenticationFailed(what)
            } else {
                SubscriberError::Transport(what)
            }
        })?;
        self.state.set(SubscriberState::Connected);

        let (mut sink, stream) = transport.split();
        sink.send(client::subscribe(&self.config.topic, "1"))
            .await
            .map_err(|e| SubscriberError::Transport(e.to_string()))?;

        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        self.stream = Some(stream);
        self.sink = Some(sink.clone());
        self.keepalive = Some(tokio::spawn(keep_alive(
            sink,
            Duration::from_millis(self.config.heartbeat_ms),
        )));
        self.state.set(SubscriberState::Subscribed);
        tracing::info!(target: "subscriber", "subscribed to push-port topic");
        Ok(())
    }

    /// One raw frame body. Waits at most two heartbeat intervals; silence
    /// beyond that means the connection is dead even if the socket is not.
    async fn receive(&mut self) -> Result<Vec<u8>, SubscriberError> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Err(SubscriberError::NotSubscribed),
        };
        let deadline = Duration::from_millis(self.config.heartbeat_ms * 2);
        let message = match tokio::time::timeout(deadline, stream.next()).await {
            Err(_) => return Err(SubscriberError::HeartbeatTimeout),
            Ok(next) => next
                .transpose()
                .map_err(|e| SubscriberError::Transport(e.to_string()))?
                .ok_or(SubscriberError::EmptyMessage)?,
        };

        match message.content {
            FromServer::Message { body, .. } => {
                self.state.set(SubscriberState::Receiving);
                body.ok_or(SubscriberError::NoBody)
            }
            FromServer::Receipt { .. } => Err(SubscriberError::Broker("unexpected receipt".to_string())),
            FromServer::Error { message, .. } => {
                let what = message.unwrap_or_else(|| "unspecified broker error".to_string());
                if what.to_lowercase().contains("auth") || what.to_lowercase().contains("login") {
                    Err(SubscriberError::AuthenticationFailed(what))
                } else {
                    Err(SubscriberError::Broker(what))
                }
            }
            _ => Err(SubscriberError::Broker("unknown frame".to_string())),
        }
    }

    fn mark_reconnecting(&self) {
        self.state.set(SubscriberState::Reconnecting);
    }

    /// Clean unsubscribe and disconnect within the grace period, then drop
    /// the connection regardless.
    async fn shutdown(&mut self, grace: Duration) {
        if let Some(sink) = self.sink.clone() {
            let polite = async {
                let mut sink = sink.lock().await;
                let _ = sink
                    .send(ToServer::Unsubscribe {
                        id: "1".to_string(),
                    }
                    .into())
                    .await;
                let _ = sink.send(ToServer::Disconnect { receipt: None }.into()).await;
            };
            if tokio::time::timeout(grace, polite).await.is_err() {
                tracing::warn!(target: "subscriber", "graceful disconnect timed out, forcing close");
            }
        }
        self.teardown().await;
        self.state.set(SubscriberState::Stopped);
        tracing::info!(target: "subscriber", "subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(60_000);
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1_200));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(1_600) && second <= Duration::from_millis(2_400));
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(72_000));
        assert!(capped >= Duration::from_millis(48_000));
        backoff.reset();
        let reset = backoff.next_delay();
        assert!(reset <= Duration::from_millis(1_200));
    }

    #[test]
    fn auth_failures_back_off_four_times_harder() {
        let mut backoff = Backoff::new(600_000);
        backoff.next_delay(); // now at 2s
        let delay = backoff.next_delay_after_auth_failure(); // 8s before jitter
        assert!(delay >= Duration::from_millis(6_400) && delay <= Duration::from_millis(9_600));
    }

    #[test]
    fn state_cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), SubscriberState::Disconnected);
        for state in [
            SubscriberState::Connecting,
            SubscriberState::Connected,
            SubscriberState::Subscribed,
            SubscriberState::Receiving,
            SubscriberState::Reconnecting,
            SubscriberState::Stopped,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn authentication_errors_are_recognizable() {
        let error = SubscriberError::AuthenticationFailed("bad login".to_string());
        assert!(error.is_authentication());
        assert!(!SubscriberError::HeartbeatTimeout.is_authentication());
        assert!(error.to_string().contains("bad login"));
    }
}
