//! MQTT broker session with automatic reconnect.
//!
//! [`MqttSession::connect`] spawns a background task that drives the
//! `rumqttc` event loop. Connection changes and inbound messages are
//! forwarded as [`LinkEvent`]s over an `mpsc` channel; the current
//! [`LinkState`] is observable through a `watch` channel.
//!
//! On a connection error the loop waits a fixed `reconnect_delay` and
//! polls again, which makes `rumqttc` dial the broker anew. Publishes
//! are only attempted while [`LinkState::Connected`]; callers are
//! expected to buffer otherwise.
//!
//! A publish may carry a [`DeliveryTag`]. The loop correlates the packet
//! id `rumqttc` assigns with the broker's PUBACK and reports the tag back
//! as [`LinkEvent::Acked`]. Publishes still unacknowledged when the
//! connection drops are discarded rather than replayed; the caller's
//! durable buffer resends them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

// ── LinkState ────────────────────────────────────────────────────────

/// Broker session state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

// ── LinkEvent ────────────────────────────────────────────────────────

/// Something the session loop observed on the wire.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Broker acknowledged the connection (initial or after reconnect).
    Connected,
    /// The session dropped; the loop is backing off before reconnecting.
    Disconnected { reason: String },
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
    /// The broker acknowledged a tagged publish.
    Acked { tag: DeliveryTag },
}

/// Caller-chosen identifier echoed back in [`LinkEvent::Acked`].
pub type DeliveryTag = i64;

// ── BrokerLink ───────────────────────────────────────────────────────

/// Outbound side of a broker session.
///
/// Every publish is QoS 1 (at-least-once). Implementations must fail
/// fast with [`Error::NotConnected`] rather than block while the link
/// is down.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    fn state(&self) -> LinkState;

    /// Hand a message to the session. `Ok` means it was accepted for
    /// transmission, not that the broker has it; a tagged publish is
    /// confirmed later by [`LinkEvent::Acked`].
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tag: Option<DeliveryTag>,
    ) -> Result<(), Error>;

    async fn subscribe(&self, topic: &str) -> Result<(), Error>;

    /// Close the session cleanly. Idempotent.
    async fn disconnect(&self) -> Result<(), Error>;
}

// ── SessionConfig ────────────────────────────────────────────────────

/// Message the broker publishes on our behalf if we vanish.
#[derive(Debug, Clone)]
pub struct LastWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `mqtt://host[:port]` or `tcp://host[:port]`.
    pub broker_url: Url,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    pub last_will: Option<LastWillMessage>,
    /// Capacity of the client → event loop request channel.
    pub request_capacity: usize,
}

impl SessionConfig {
    pub fn new(broker_url: Url, client_id: impl Into<String>) -> Self {
        Self {
            broker_url,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            last_will: None,
            request_capacity: 64,
        }
    }

    /// Translate into `rumqttc` options, validating the broker URL.
    pub fn mqtt_options(&self) -> Result<MqttOptions, Error> {
        let url = &self.broker_url;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(Error::InvalidBrokerUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidBrokerUrl {
                url: url.to_string(),
                reason: "missing host".into(),
            })?;
        let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);

        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some(ref username) = self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        if let Some(ref will) = self.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        Ok(options)
    }
}

// ── AckTracker ───────────────────────────────────────────────────────

/// Maps outgoing QoS 1 packet ids back to delivery tags.
///
/// Tags are queued in submission order as the client accepts publishes.
/// The event loop sends them in the same order, so each
/// `Outgoing::Publish(pkid)` claims the oldest submitted tag. A publish
/// that collides with an unacknowledged packet id is parked by `rumqttc`
/// and sent after that id is acked; no other request is processed in
/// between, so a single parked slot is enough.
#[derive(Debug, Default)]
struct AckTracker {
    submitted: VecDeque<Option<DeliveryTag>>,
    parked: Option<(u16, Option<DeliveryTag>)>,
    inflight: HashMap<u16, VecDeque<Option<DeliveryTag>>>,
}

impl AckTracker {
    fn submitted(&mut self, tag: Option<DeliveryTag>) {
        self.submitted.push_back(tag);
    }

    fn sent(&mut self, pkid: u16) {
        let tag = match self.parked.take() {
            Some((parked, tag)) if parked == pkid => tag,
            other => {
                self.parked = other;
                self.submitted.pop_front().flatten()
            }
        };
        self.inflight.entry(pkid).or_default().push_back(tag);
    }

    fn awaiting_ack(&mut self, pkid: u16) {
        let tag = self.submitted.pop_front().flatten();
        self.parked = Some((pkid, tag));
    }

    fn acked(&mut self, pkid: u16) -> Option<DeliveryTag> {
        let slot = self.inflight.get_mut(&pkid)?;
        let tag = slot.pop_front().flatten();
        if slot.is_empty() {
            self.inflight.remove(&pkid);
        }
        tag
    }

    fn reset(&mut self) {
        self.submitted.clear();
        self.parked = None;
        self.inflight.clear();
    }
}

type SharedTracker = Arc<std::sync::Mutex<AckTracker>>;

// ── MqttSession ──────────────────────────────────────────────────────

/// Handle to a running broker session.
pub struct MqttSession {
    client: AsyncClient,
    state: watch::Receiver<LinkState>,
    tracker: SharedTracker,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Spawn the session loop and return immediately.
    ///
    /// The first connection attempt happens asynchronously; watch for
    /// [`LinkEvent::Connected`] on the returned receiver.
    pub fn connect(
        config: &SessionConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>), Error> {
        let options = config.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = SharedTracker::default();

        tracing::info!(
            broker = %config.broker_url,
            client_id = %config.client_id,
            "Starting MQTT session"
        );

        let task = tokio::spawn(session_loop(
            eventloop,
            state_tx,
            event_tx,
            Arc::clone(&tracker),
            config.reconnect_delay,
            cancel.clone(),
        ));

        Ok((
            Self {
                client,
                state: state_rx,
                tracker,
                cancel,
                task: Mutex::new(Some(task)),
            },
            event_rx,
        ))
    }

    /// Subscribe to session state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Stop the session loop without a clean MQTT disconnect.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BrokerLink for MqttSession {
    fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tag: Option<DeliveryTag>,
    ) -> Result<(), Error> {
        // Held across the state check so a reset in the session loop
        // cannot interleave with the request being queued.
        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| Error::Connection("delivery tracker poisoned".into()))?;
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        tracker.submitted(tag);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        if self.state().is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                tracing::debug!(error = %e, "MQTT disconnect request rejected");
            }
            let mut state = self.state.clone();
            let drained = tokio::time::timeout(
                DISCONNECT_GRACE,
                state.wait_for(|s| *s == LinkState::Disconnected),
            )
            .await;
            if drained.is_err() {
                tracing::warn!("MQTT disconnect not acknowledged in time, dropping session");
            }
        }

        self.cancel.cancel();
        let _ = task.await;
        Ok(())
    }
}

// ── Background session loop ──────────────────────────────────────────

/// Poll the event loop until cancelled: connect → read → on error,
/// fixed backoff → poll again (which reconnects).
async fn session_loop(
    mut eventloop: EventLoop,
    state_tx: watch::Sender<LinkState>,
    event_tx: mpsc::Sender<LinkEvent>,
    tracker: SharedTracker,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => {
                match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempt = 0;
                        let _ = state_tx.send(LinkState::Connected);
                        tracing::info!("MQTT session connected");
                        if event_tx.send(LinkEvent::Connected).await.is_err() {
                            tracing::debug!("no link event consumer");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = LinkEvent::Message {
                            topic: publish.topic,
                            payload: publish.payload,
                        };
                        if event_tx.send(event).await.is_err() {
                            tracing::debug!("no link event consumer, inbound message dropped");
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        with_tracker(&tracker, |t| t.sent(pkid));
                    }
                    Ok(Event::Outgoing(Outgoing::AwaitAck(pkid))) => {
                        with_tracker(&tracker, |t| t.awaiting_ack(pkid));
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        let tag = with_tracker(&tracker, |t| t.acked(ack.pkid)).flatten();
                        if let Some(tag) = tag {
                            if event_tx.send(LinkEvent::Acked { tag }).await.is_err() {
                                tracing::debug!("no link event consumer, ack dropped");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::warn!("Broker sent DISCONNECT");
                        attempt += 1;
                        let _ = state_tx.send(LinkState::Reconnecting { attempt });
                        discard_unacked(&mut eventloop, &tracker);
                        let _ = event_tx
                            .send(LinkEvent::Disconnected { reason: "broker disconnect".into() })
                            .await;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        tracing::info!("MQTT session closed by client");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected = state_tx.borrow().is_connected();
                        attempt += 1;
                        let _ = state_tx.send(LinkState::Reconnecting { attempt });
                        discard_unacked(&mut eventloop, &tracker);
                        tracing::warn!(error = %e, attempt, "MQTT connection error");

                        if was_connected {
                            let _ = event_tx
                                .send(LinkEvent::Disconnected { reason: e.to_string() })
                                .await;
                        }

                        tracing::debug!(
                            delay_ms = u64::try_from(reconnect_delay.as_millis()).unwrap_or(u64::MAX),
                            attempt,
                            "Waiting before reconnect"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    let _ = state_tx.send(LinkState::Disconnected);
    tracing::debug!("MQTT session loop exiting");
}

fn with_tracker<T>(tracker: &SharedTracker, f: impl FnOnce(&mut AckTracker) -> T) -> Option<T> {
    tracker.lock().ok().map(|mut t| f(&mut *t))
}

/// Drop everything `rumqttc` would replay on reconnect and forget the
/// tags that went with it. The session state is already non-connected,
/// so no publish can slip in between.
fn discard_unacked(eventloop: &mut EventLoop, tracker: &SharedTracker) {
    let Ok(mut tracker) = tracker.lock() else {
        return;
    };
    eventloop.clean();
    let dropped = eventloop.pending.len();
    eventloop.pending.clear();
    tracker.reset();
    if dropped > 0 {
        tracing::debug!(dropped, "discarded unacknowledged requests");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(url: &str) -> SessionConfig {
        SessionConfig::new(Url::parse(url).unwrap(), "ctrl-01")
    }

    #[test]
    fn default_session_config() {
        let cfg = config("mqtt://broker.local");
        assert_eq!(cfg.keep_alive, Duration::from_secs(30));
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
        assert!(cfg.last_will.is_none());
    }

    #[test]
    fn mqtt_options_default_port() {
        let options = config("mqtt://broker.local").mqtt_options().unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_owned(), DEFAULT_MQTT_PORT)
        );
        assert_eq!(options.client_id(), "ctrl-01");
    }

    #[test]
    fn mqtt_options_explicit_port() {
        let options = config("tcp://10.0.0.5:11883").mqtt_options().unwrap();
        assert_eq!(options.broker_address(), ("10.0.0.5".to_owned(), 11883));
    }

    #[test]
    fn mqtt_options_reject_unknown_scheme() {
        let err = config("https://broker.local").mqtt_options().unwrap_err();
        assert!(matches!(err, Error::InvalidBrokerUrl { .. }), "got {err:?}");
    }

    #[test]
    fn mqtt_options_carry_credentials() {
        let mut cfg = config("mqtt://broker.local");
        cfg.username = Some("edge".into());
        cfg.password = Some(SecretString::from("hunter2".to_owned()));
        let options = cfg.mqtt_options().unwrap();
        assert_eq!(
            options.credentials(),
            Some(("edge".to_owned(), "hunter2".to_owned()))
        );
    }

    #[test]
    fn ack_tracker_maps_packet_ids_to_tags_in_order() {
        let mut tracker = AckTracker::default();
        tracker.submitted(Some(10));
        tracker.submitted(None);
        tracker.submitted(Some(12));

        tracker.sent(1);
        tracker.sent(2);
        tracker.sent(3);

        assert_eq!(tracker.acked(2), None);
        assert_eq!(tracker.acked(3), Some(12));
        assert_eq!(tracker.acked(1), Some(10));
        assert_eq!(tracker.acked(1), None);
    }

    #[test]
    fn ack_tracker_follows_a_parked_collision() {
        let mut tracker = AckTracker::default();
        tracker.submitted(Some(1));
        tracker.sent(7);

        // Packet id 7 is reused before its PUBACK arrives.
        tracker.submitted(Some(2));
        tracker.awaiting_ack(7);
        tracker.submitted(Some(3));

        assert_eq!(tracker.acked(7), Some(1));
        tracker.sent(7);
        tracker.sent(8);
        assert_eq!(tracker.acked(7), Some(2));
        assert_eq!(tracker.acked(8), Some(3));
    }

    #[test]
    fn ack_tracker_reset_forgets_unacked_tags() {
        let mut tracker = AckTracker::default();
        tracker.submitted(Some(1));
        tracker.sent(1);
        tracker.submitted(Some(2));

        tracker.reset();
        tracker.submitted(Some(3));
        tracker.sent(1);

        assert_eq!(tracker.acked(1), Some(3));
    }

    #[tokio::test]
    async fn unreachable_broker_moves_to_reconnecting() {
        let mut cfg = config("mqtt://127.0.0.1:1");
        cfg.reconnect_delay = Duration::from_millis(50);

        let cancel = CancellationToken::new();
        let (session, _events) = MqttSession::connect(&cfg, cancel.clone()).unwrap();
        let mut state = session.watch_state();

        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| matches!(s, LinkState::Reconnecting { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        let err = session.publish("t", b"x".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected), "got {err:?}");

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), LinkState::Disconnected);
    }
}
