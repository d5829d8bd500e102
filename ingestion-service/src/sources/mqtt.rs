use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::pipeline::{Ack, Envelope, EnvelopeStream, PipelineError, Source};

/// How long shutdown keeps the broker connection open for acks of messages
/// that are still being written.
const ACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A message as it came off the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl From<&Publish> for RawMessage {
    fn from(p: &Publish) -> Self {
        Self {
            topic: p.topic.clone(),
            payload: p.payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Subscribed,
}

/// What the event loop observed, stripped of client-library detail.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Message(Publish),
    Disconnected(String),
    Other,
}

#[derive(Debug, PartialEq)]
pub enum Action {
    Subscribe,
    Forward(Publish),
    Backoff,
    Ignore,
}

impl SessionState {
    /// Advance on one broker event. Every successful (re)connect subscribes again,
    /// so the subscription survives broker restarts even if the session was lost.
    pub fn step(&mut self, event: BrokerEvent) -> Action {
        match event {
            BrokerEvent::Connected => {
                *self = SessionState::Subscribed;
                Action::Subscribe
            }
            BrokerEvent::Message(publish) => Action::Forward(publish),
            BrokerEvent::Disconnected(_) => {
                *self = SessionState::Disconnected;
                Action::Backoff
            }
            BrokerEvent::Other => Action::Ignore,
        }
    }
}

fn classify(polled: Result<Event, ConnectionError>) -> BrokerEvent {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(_))) => BrokerEvent::Connected,
        Ok(Event::Incoming(Packet::Publish(p))) => BrokerEvent::Message(p),
        Ok(_) => BrokerEvent::Other,
        Err(e) => BrokerEvent::Disconnected(e.to_string()),
    }
}

pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    // Keep the broker-side session so QoS 1 messages queued while we were away
    // are delivered on reconnect.
    options.set_clean_session(false);
    // PUBACK is sent by the pipeline once a message has been handled, not on receipt.
    options.set_manual_acks(true);
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    options
}

/// Ack handle for one publish. Acking queues the PUBACK on the client and
/// releases the message's in-flight slot.
fn publish_ack(client: &AsyncClient, publish: Publish, in_flight: &Arc<AtomicUsize>) -> Ack {
    in_flight.fetch_add(1, Ordering::SeqCst);
    let client = client.clone();
    let in_flight = in_flight.clone();
    Ack::new(move || {
        if let Err(e) = client.try_ack(&publish) {
            tracing::warn!(error = %e, pkid = publish.pkid, "failed to queue MQTT ack");
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    })
}

/// Subscribes to one topic with QoS 1 and streams every publish as a [`RawMessage`].
///
/// The broker connection is driven by a background task which reconnects and
/// re-subscribes indefinitely until `token` is cancelled. Messages are acked
/// through their envelope's [`Ack`], never on receipt.
#[derive(Clone)]
pub struct MqttSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<RawMessage>>>>>,
}

impl MqttSource {
    /// Start the broker task. The returned handle finishes once the task has
    /// flushed outstanding acks and disconnected after cancellation.
    pub fn spawn(cfg: &MqttConfig, token: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let (client, eventloop) = AsyncClient::new(mqtt_options(cfg), 64);

        let topic = cfg.topic.clone();
        let backoff = Duration::from_millis(cfg.reconnect_backoff_ms);
        let task = tokio::spawn(run_event_loop(client, eventloop, topic, backoff, tx, token));

        let source = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        };
        (source, task)
    }
}

async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    backoff: Duration,
    tx: mpsc::Sender<Envelope<RawMessage>>,
    token: CancellationToken,
) {
    let mut state = SessionState::Disconnected;
    let in_flight = Arc::new(AtomicUsize::new(0));

    loop {
        let polled = tokio::select! {
            _ = token.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match state.step(classify(polled)) {
            Action::Subscribe => {
                tracing::info!(topic = %topic, "connected to MQTT broker, subscribing");
                // The request is queued and sent by the next poll.
                if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                    tracing::error!(error = %e, topic = %topic, "failed to queue MQTT subscribe");
                }
            }
            Action::Forward(publish) => {
                metrics::counter!("mqtt_messages_received_total").increment(1);
                let env = Envelope::new(RawMessage::from(&publish), SystemTime::now())
                    .with_ack(publish_ack(&client, publish, &in_flight));
                if tx.send(env).await.is_err() {
                    tracing::warn!("MQTT source receiver dropped, stopping event loop");
                    break;
                }
            }
            Action::Backoff => {
                metrics::counter!("mqtt_disconnects_total").increment(1);
                tracing::warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    "MQTT connection lost, reconnecting"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Action::Ignore => {}
        }
    }

    // Closing the channel lets the pipeline finish what it already holds.
    drop(tx);

    if state == SessionState::Subscribed {
        drain_acks(&mut eventloop, &in_flight).await;
        disconnect(&client, &mut eventloop).await;
    }
    tracing::info!("MQTT source stopped");
}

/// Keep polling so acks of messages still in the pipeline reach the broker.
/// Publishes arriving meanwhile are left unacked for redelivery.
async fn drain_acks(eventloop: &mut EventLoop, in_flight: &AtomicUsize) {
    let drained = tokio::time::timeout(ACK_DRAIN_TIMEOUT, async {
        while in_flight.load(Ordering::SeqCst) > 0 {
            if let Err(e) = eventloop.poll().await {
                tracing::warn!(error = %e, "MQTT connection lost while flushing acks");
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            pending = in_flight.load(Ordering::SeqCst),
            "timed out flushing MQTT acks; unacked messages will be redelivered"
        );
    }
}

/// Best-effort DISCONNECT so the broker does not publish a will or hold the
/// client id as still connected. Acks queued before it are flushed first.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        tracing::warn!("timed out sending MQTT disconnect");
    }
}

#[async_trait::async_trait]
impl Source<RawMessage> for MqttSource {
    async fn stream(&self) -> EnvelopeStream<RawMessage> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(tokio_stream::once(Err(PipelineError::Source(
                "MqttSource stream already taken; only one consumer supported".to_string(),
            )))),
        }
    }
}
