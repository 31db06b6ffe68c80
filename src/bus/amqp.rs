//! AMQP transport: connection lifecycle, per-delivery dispatch decision and
//! the lapin-backed reply publisher.

use super::{BusConnection, BusError, ConnectionState, ConnectionStateCell};
use crate::config::AmqpConfig;
use crate::dispatch::{
    self, DeduplicationRegistry, DispatchOutcome, InFlightGuard, PoolStats, ReplyChannel,
    ReplyDestination, ReplyPublisher, WorkerPool,
};
use crate::envelope::{self, Protocol, ResponseEnvelope, JSON_CONTENT_TYPE};
use crate::handler::RequestHandler;
use crate::util::payload_preview;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message header naming the exchange a reply should be published to.
pub const REPLY_EXCHANGE_HEADER: &str = "replyToExchange";

const PREVIEW_CHARS: usize = 160;

// ── State machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmqpState {
    Disconnected,
    Connecting,
    ChannelOpen,
    ExchangeVerified,
    QueueBound,
    Subscribed,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpEvent {
    Connect,
    ChannelOpened,
    ExchangeVerified,
    QueueBound,
    ConsumerStarted,
    ConnectionLost,
    ChannelClosed,
    ShutdownRequested,
    Closed,
}

impl AmqpState {
    /// Next state after `event`. Events that make no sense in the current
    /// state leave it unchanged.
    pub fn on_event(self, event: AmqpEvent) -> Self {
        use AmqpEvent as E;
        use AmqpState as S;

        match (self, event) {
            (S::Closing | S::Closed, E::ConnectionLost | E::ChannelClosed) => self,
            (S::Closed, E::ShutdownRequested) => S::Closed,
            (_, E::ShutdownRequested) => S::Closing,
            (S::Closing, E::Closed) => S::Closed,
            (_, E::ConnectionLost | E::ChannelClosed) => S::Disconnected,
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Connecting, E::ChannelOpened) => S::ChannelOpen,
            (S::ChannelOpen, E::ExchangeVerified) => S::ExchangeVerified,
            (S::ExchangeVerified, E::QueueBound) => S::QueueBound,
            (S::QueueBound, E::ConsumerStarted) => S::Subscribed,
            _ => self,
        }
    }

    /// Coarse state shared with the other transports.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting | Self::ChannelOpen | Self::ExchangeVerified | Self::QueueBound => {
                ConnectionState::Connecting
            }
            Self::Subscribed => ConnectionState::Subscribed,
            Self::Closing => ConnectionState::Closing,
            Self::Closed => ConnectionState::Closed,
        }
    }
}

// ── Inbound deliveries ───────────────────────────────────────────

/// The parts of an AMQP delivery the dispatch decision needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpInbound {
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_exchange: Option<String>,
}

impl AmqpInbound {
    /// Split a lapin delivery into its dispatch view and its acker.
    pub fn from_delivery(delivery: Delivery) -> (Self, Acker) {
        let properties = &delivery.properties;
        let reply_exchange = properties.headers().as_ref().and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == REPLY_EXCHANGE_HEADER)
                .and_then(|(_, value)| header_text(value))
        });
        let inbound = Self {
            reply_to: properties
                .reply_to()
                .as_ref()
                .map(|r| r.as_str().to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|c| c.as_str().to_string()),
            reply_exchange,
            body: delivery.data,
        };
        (inbound, delivery.acker)
    }
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        _ => None,
    }
}

/// Acknowledgement seam over a single delivery.
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    async fn acknowledge(&self) -> Result<(), BusError>;

    /// Negative-acknowledge without requeue.
    async fn reject_no_requeue(&self) -> Result<(), BusError>;
}

#[async_trait]
impl DeliveryAck for Acker {
    async fn acknowledge(&self) -> Result<(), BusError> {
        self.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject_no_requeue(&self) -> Result<(), BusError> {
        self.nack(BasicNackOptions {
            requeue: false,
            ..BasicNackOptions::default()
        })
        .await?;
        Ok(())
    }
}

// ── Dispatch decision ────────────────────────────────────────────

/// Decides, for each delivery, whether to drop, reject, answer inline or
/// hand it to a worker. Runs on the connection's single consume loop.
pub struct AmqpDispatcher {
    name: String,
    state: Arc<ConnectionStateCell>,
    registry: Arc<DeduplicationRegistry>,
    pool: Arc<WorkerPool>,
    replies: Arc<ReplyChannel>,
    handler: Arc<dyn RequestHandler>,
    default_exchange: String,
}

impl AmqpDispatcher {
    pub fn new(
        name: impl Into<String>,
        state: Arc<ConnectionStateCell>,
        registry: Arc<DeduplicationRegistry>,
        pool: Arc<WorkerPool>,
        replies: Arc<ReplyChannel>,
        handler: Arc<dyn RequestHandler>,
        default_exchange: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            state,
            registry,
            pool,
            replies,
            handler,
            default_exchange: default_exchange.into(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<DeduplicationRegistry> {
        &self.registry
    }

    pub fn replies(&self) -> &Arc<ReplyChannel> {
        &self.replies
    }

    pub async fn dispatch(&self, inbound: AmqpInbound, ack: &dyn DeliveryAck) -> DispatchOutcome {
        if self.state.get().is_shutting_down() {
            tracing::debug!(connection = %self.name, "Closing; leaving delivery unacknowledged");
            return DispatchOutcome::Dropped;
        }

        let Some(reply_to) = inbound.reply_to.filter(|r| !r.trim().is_empty()) else {
            tracing::warn!(connection = %self.name, "Delivery has no reply_to; rejecting");
            self.reject(ack).await;
            return DispatchOutcome::Rejected;
        };
        let destination = ReplyDestination::Amqp {
            exchange: inbound
                .reply_exchange
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| self.default_exchange.clone()),
            routing_key: reply_to,
            correlation_id: inbound.correlation_id,
        };

        let request_id = match envelope::amqp::peek_request_id(&inbound.body) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    connection = %self.name,
                    %destination,
                    payload = %payload_preview(&inbound.body, PREVIEW_CHARS),
                    "Unreadable request id: {e}"
                );
                self.acknowledge(ack).await;
                dispatch::publish_response(&self.replies, &e.to_response(""), Protocol::Amqp, &destination)
                    .await;
                return DispatchOutcome::Malformed;
            }
        };

        if !self.registry.try_accept(&request_id) {
            tracing::info!(connection = %self.name, %request_id, "Duplicate delivery rejected");
            self.reject(ack).await;
            return DispatchOutcome::Rejected;
        }

        self.acknowledge(ack).await;

        if self.pool.is_saturated() {
            tracing::warn!(
                connection = %self.name,
                %request_id,
                capacity = self.pool.total_capacity(),
                "Worker pool saturated; replying 429"
            );
            dispatch::publish_response(
                &self.replies,
                &ResponseEnvelope::overloaded(request_id.clone()),
                Protocol::Amqp,
                &destination,
            )
            .await;
            self.registry.release(&request_id);
            return DispatchOutcome::Overloaded;
        }

        let guard = InFlightGuard::new(Arc::clone(&self.registry), request_id.clone());
        let handler = Arc::clone(&self.handler);
        let replies = Arc::clone(&self.replies);
        let submitted = self.pool.submit(async move {
            let _guard = guard;
            dispatch::process_request(
                inbound.body,
                request_id,
                Protocol::Amqp,
                handler,
                replies,
                destination,
            )
            .await;
        });

        if submitted {
            DispatchOutcome::Submitted
        } else {
            DispatchOutcome::Dropped
        }
    }

    async fn acknowledge(&self, ack: &dyn DeliveryAck) {
        if let Err(e) = ack.acknowledge().await {
            tracing::warn!(connection = %self.name, "Ack failed: {e}");
        }
    }

    async fn reject(&self, ack: &dyn DeliveryAck) {
        if let Err(e) = ack.reject_no_requeue().await {
            tracing::warn!(connection = %self.name, "Nack failed: {e}");
        }
    }
}

// ── Reply publisher ──────────────────────────────────────────────

struct AmqpReplyPublisher {
    channel: Channel,
}

#[async_trait]
impl ReplyPublisher for AmqpReplyPublisher {
    async fn publish(&self, payload: Vec<u8>, destination: &ReplyDestination) -> Result<(), BusError> {
        let ReplyDestination::Amqp {
            exchange,
            routing_key,
            correlation_id,
        } = destination
        else {
            return Err(BusError::Destination(destination.to_string()));
        };

        let mut properties = BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

// ── Connection ───────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Where `open` failed. Only the connect handshake can reject credentials;
/// everything after it is a channel-level problem.
#[derive(Debug, thiserror::Error)]
enum OpenError {
    #[error("connect failed: {0}")]
    Connect(lapin::Error),
    #[error("channel setup failed: {0}")]
    Setup(lapin::Error),
}

impl OpenError {
    fn is_credential_refusal(&self) -> bool {
        matches!(self, Self::Connect(e) if is_credential_refusal(e))
    }
}

/// Broker refused the login (ACCESS_REFUSED) or the vhost (NOT_ALLOWED).
fn is_credential_refusal(error: &lapin::Error) -> bool {
    match error {
        lapin::Error::ProtocolError(e) => matches!(
            e.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
        ),
        _ => false,
    }
}

struct Transport {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
}

/// One AMQP consumer with its own worker pool and reply channel.
pub struct AmqpConnection {
    name: String,
    config: AmqpConfig,
    reconnect_delay: Duration,
    amqp_state: Mutex<AmqpState>,
    state: Arc<ConnectionStateCell>,
    dispatcher: AmqpDispatcher,
}

impl AmqpConnection {
    pub fn new(
        name: impl Into<String>,
        config: AmqpConfig,
        reconnect_delay: Duration,
        pool_size: usize,
        registry: Arc<DeduplicationRegistry>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let name = name.into();
        let state = Arc::new(ConnectionStateCell::new(name.clone()));
        let dispatcher = AmqpDispatcher::new(
            name.clone(),
            Arc::clone(&state),
            registry,
            Arc::new(WorkerPool::new(format!("{name}-workers"), pool_size)),
            Arc::new(ReplyChannel::detached(name.clone())),
            handler,
            config.exchange_name.clone(),
        );
        Self {
            name,
            config,
            reconnect_delay,
            amqp_state: Mutex::new(AmqpState::Disconnected),
            state,
            dispatcher,
        }
    }

    pub fn amqp_state(&self) -> AmqpState {
        *self.amqp_state.lock()
    }

    fn apply(&self, event: AmqpEvent) -> AmqpState {
        let next = {
            let mut current = self.amqp_state.lock();
            let next = current.on_event(event);
            if next == *current {
                tracing::trace!(connection = %self.name, state = ?next, ?event, "Event ignored");
            }
            *current = next;
            next
        };
        self.state.set(next.connection_state());
        next
    }

    /// Forget whatever state a previous (possibly panicked) run left behind.
    fn reset(&self) {
        *self.amqp_state.lock() = AmqpState::Disconnected;
        self.state.set(ConnectionState::Disconnected);
    }

    async fn open(&self) -> Result<Transport, OpenError> {
        self.apply(AmqpEvent::Connect);
        tracing::info!(connection = %self.name, uri = %self.config.redacted_uri(), "Connecting to AMQP broker");
        let connection = Connection::connect(&self.config.uri(), ConnectionProperties::default())
            .await
            .map_err(OpenError::Connect)?;

        match self.setup(&connection).await {
            Ok((channel, consumer_tag)) => Ok(Transport {
                connection,
                channel,
                consumer_tag,
            }),
            Err(e) => {
                let _ = connection.close(0, "setup failed").await;
                Err(OpenError::Setup(e))
            }
        }
    }

    async fn setup(&self, connection: &Connection) -> Result<(Channel, String), lapin::Error> {
        let channel = connection.create_channel().await?;
        self.apply(AmqpEvent::ChannelOpened);

        channel
            .exchange_declare(
                &self.config.exchange_name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.apply(AmqpEvent::ExchangeVerified);

        let queue = self.config.queue();
        channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                &self.config.exchange_name,
                &self.config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.apply(AmqpEvent::QueueBound);

        Ok((channel, format!("{}-{}", self.name, uuid::Uuid::new_v4())))
    }

    /// Consume until the transport drops or shutdown is requested.
    async fn session(
        &self,
        transport: &Transport,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, lapin::Error> {
        let mut consumer = transport
            .channel
            .basic_consume(
                self.config.queue(),
                &transport.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.apply(AmqpEvent::ConsumerStarted);
        crate::health::mark_component_ok(&self.name);
        tracing::info!(
            connection = %self.name,
            queue = self.config.queue(),
            exchange = %self.config.exchange_name,
            "AMQP consumer started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let (inbound, acker) = AmqpInbound::from_delivery(delivery);
                        let outcome = self.dispatcher.dispatch(inbound, &acker).await;
                        tracing::debug!(connection = %self.name, outcome = outcome.as_str(), "Delivery dispatched");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(connection = %self.name, "Consumer error: {e}");
                        self.apply(AmqpEvent::ChannelClosed);
                        return Ok(SessionEnd::Lost);
                    }
                    None => {
                        tracing::warn!(connection = %self.name, "Consumer stream ended");
                        self.apply(AmqpEvent::ChannelClosed);
                        return Ok(SessionEnd::Lost);
                    }
                }
            }
        }
    }

    /// Closing: stop consuming, drain workers, detach replies, close transport.
    async fn close(&self, transport: Option<Transport>) {
        self.apply(AmqpEvent::ShutdownRequested);

        if let Some(transport) = &transport {
            if let Err(e) = transport
                .channel
                .basic_cancel(&transport.consumer_tag, BasicCancelOptions::default())
                .await
            {
                tracing::debug!(connection = %self.name, "basic.cancel failed: {e}");
            }
        }

        self.dispatcher.pool.shutdown(true).await;
        self.dispatcher.replies.detach().await;

        if let Some(transport) = transport {
            let _ = transport.channel.close(200, "shutdown").await;
            let _ = transport.connection.close(200, "shutdown").await;
        }

        self.apply(AmqpEvent::Closed);
        tracing::info!(connection = %self.name, "AMQP connection closed");
    }
}

#[async_trait]
impl BusConnection for AmqpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Amqp
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn pool_stats(&self) -> PoolStats {
        self.dispatcher.pool.stats()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut connected_once = false;
        self.reset();

        loop {
            if shutdown.is_cancelled() {
                self.close(None).await;
                return Ok(());
            }

            match self.open().await {
                Ok(transport) => {
                    connected_once = true;
                    self.dispatcher
                        .replies
                        .attach(Box::new(AmqpReplyPublisher {
                            channel: transport.channel.clone(),
                        }))
                        .await;

                    match self.session(&transport, &shutdown).await {
                        Ok(SessionEnd::Shutdown) => {
                            self.close(Some(transport)).await;
                            return Ok(());
                        }
                        Ok(SessionEnd::Lost) => {}
                        Err(e) => {
                            tracing::warn!(connection = %self.name, "Consume failed: {e}");
                            crate::health::mark_component_error(&self.name, &e);
                        }
                    }
                    self.dispatcher.replies.detach().await;
                    let _ = transport.connection.close(0, "reconnecting").await;
                }
                Err(e) if !connected_once && e.is_credential_refusal() => {
                    tracing::error!(connection = %self.name, "AMQP broker refused credentials: {e}");
                    crate::health::mark_component_error(&self.name, &e);
                    self.close(None).await;
                    return Err(BusError::Authentication(e.to_string()));
                }
                Err(e) => {
                    tracing::warn!(connection = %self.name, "AMQP open failed: {e}");
                    crate::health::mark_component_error(&self.name, &e);
                }
            }

            self.apply(AmqpEvent::ConnectionLost);
            tracing::info!(
                connection = %self.name,
                delay_secs = self.reconnect_delay.as_secs(),
                "Reconnecting after delay"
            );
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResponseEnvelope;
    use crate::handler::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Vec<u8>, ReplyDestination)>>>);

    #[async_trait]
    impl ReplyPublisher for Recorder {
        async fn publish(&self, payload: Vec<u8>, destination: &ReplyDestination) -> Result<(), BusError> {
            self.0.lock().push((payload, destination.clone()));
            Ok(())
        }
    }

    impl Recorder {
        fn replies(&self) -> Vec<(ResponseEnvelope, ReplyDestination)> {
            self.0
                .lock()
                .iter()
                .map(|(raw, dest)| (envelope::amqp::decode_reply(raw).unwrap(), dest.clone()))
                .collect()
        }
    }

    #[derive(Default)]
    struct CountingAck {
        acks: AtomicUsize,
        rejects: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryAck for CountingAck {
        async fn acknowledge(&self) -> Result<(), BusError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject_no_requeue(&self) -> Result<(), BusError> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher(recorder: &Recorder) -> AmqpDispatcher {
        let router = Router::new().route("GET", "/api/ping", |req| {
            ResponseEnvelope::json(req.request_id.clone(), 200, &serde_json::json!({"pong": true}))
        });
        AmqpDispatcher::new(
            "amqp-test",
            Arc::new(ConnectionStateCell::new("amqp-test")),
            Arc::new(DeduplicationRegistry::new(16)),
            Arc::new(WorkerPool::new("amqp-test-workers", 2)),
            Arc::new(ReplyChannel::with_publisher("amqp-test", Box::new(recorder.clone()))),
            Arc::new(router),
            "cse-ext",
        )
    }

    fn inbound(body: &str) -> AmqpInbound {
        AmqpInbound {
            body: body.as_bytes().to_vec(),
            reply_to: Some("client-queue".into()),
            correlation_id: Some("corr-1".into()),
            reply_exchange: None,
        }
    }

    const PING: &str = r#"{"id":"r1","method":"GET","path":"/api/ping","headers":{}}"#;

    #[test]
    fn happy_path_transitions() {
        let mut state = AmqpState::Disconnected;
        for event in [
            AmqpEvent::Connect,
            AmqpEvent::ChannelOpened,
            AmqpEvent::ExchangeVerified,
            AmqpEvent::QueueBound,
            AmqpEvent::ConsumerStarted,
        ] {
            state = state.on_event(event);
        }
        assert_eq!(state, AmqpState::Subscribed);
        assert_eq!(state.connection_state(), ConnectionState::Subscribed);

        state = state.on_event(AmqpEvent::ShutdownRequested);
        assert_eq!(state, AmqpState::Closing);
        assert_eq!(state.on_event(AmqpEvent::Closed), AmqpState::Closed);
    }

    #[test]
    fn loss_returns_to_disconnected_unless_closing() {
        assert_eq!(
            AmqpState::QueueBound.on_event(AmqpEvent::ConnectionLost),
            AmqpState::Disconnected
        );
        assert_eq!(
            AmqpState::Subscribed.on_event(AmqpEvent::ChannelClosed),
            AmqpState::Disconnected
        );
        assert_eq!(
            AmqpState::Closing.on_event(AmqpEvent::ConnectionLost),
            AmqpState::Closing
        );
        assert_eq!(
            AmqpState::Closed.on_event(AmqpEvent::ShutdownRequested),
            AmqpState::Closed
        );
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        assert_eq!(
            AmqpState::Disconnected.on_event(AmqpEvent::ConsumerStarted),
            AmqpState::Disconnected
        );
        assert_eq!(
            AmqpState::Connecting.on_event(AmqpEvent::QueueBound),
            AmqpState::Connecting
        );
        assert_eq!(
            AmqpState::Subscribed.on_event(AmqpEvent::Closed),
            AmqpState::Subscribed
        );
    }

    #[tokio::test]
    async fn submitted_request_is_answered_and_released() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        let ack = CountingAck::default();

        let outcome = dispatcher.dispatch(inbound(PING), &ack).await;
        assert_eq!(outcome, DispatchOutcome::Submitted);
        assert_eq!(ack.acks.load(Ordering::SeqCst), 1);

        dispatcher.pool().shutdown(true).await;
        let replies = recorder.replies();
        assert_eq!(replies.len(), 1);
        let (response, destination) = &replies[0];
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.status_code, 200);
        assert_eq!(
            destination,
            &ReplyDestination::Amqp {
                exchange: "cse-ext".into(),
                routing_key: "client-queue".into(),
                correlation_id: Some("corr-1".into()),
            }
        );
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn reply_exchange_header_overrides_default() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        let mut message = inbound(PING);
        message.reply_exchange = Some("client-ext".into());

        dispatcher.dispatch(message, &CountingAck::default()).await;
        dispatcher.pool().shutdown(true).await;

        let replies = recorder.replies();
        let (_, destination) = &replies[0];
        assert!(matches!(destination, ReplyDestination::Amqp { exchange, .. } if exchange == "client-ext"));
    }

    #[tokio::test]
    async fn missing_reply_to_is_rejected_without_reply() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        let ack = CountingAck::default();
        let mut message = inbound(PING);
        message.reply_to = None;

        assert_eq!(dispatcher.dispatch(message, &ack).await, DispatchOutcome::Rejected);
        assert_eq!(ack.rejects.load(Ordering::SeqCst), 1);
        assert_eq!(ack.acks.load(Ordering::SeqCst), 0);
        assert!(recorder.replies().is_empty());
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn unreadable_id_is_acked_and_answered_with_400() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        let ack = CountingAck::default();

        let outcome = dispatcher.dispatch(inbound("not json"), &ack).await;
        assert_eq!(outcome, DispatchOutcome::Malformed);
        assert_eq!(ack.acks.load(Ordering::SeqCst), 1);

        let replies = recorder.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.status_code, 400);
        assert_eq!(replies[0].0.request_id, "");
    }

    #[tokio::test]
    async fn duplicate_in_flight_is_rejected() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        assert!(dispatcher.registry().try_accept("r1"));

        let ack = CountingAck::default();
        assert_eq!(dispatcher.dispatch(inbound(PING), &ack).await, DispatchOutcome::Rejected);
        assert_eq!(ack.rejects.load(Ordering::SeqCst), 1);
        assert!(recorder.replies().is_empty());
        assert!(dispatcher.registry().contains("r1"));
    }

    #[tokio::test]
    async fn closing_connection_drops_silently() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder);
        dispatcher.state.set(ConnectionState::Closing);
        let ack = CountingAck::default();

        assert_eq!(dispatcher.dispatch(inbound(PING), &ack).await, DispatchOutcome::Dropped);
        assert_eq!(ack.acks.load(Ordering::SeqCst), 0);
        assert_eq!(ack.rejects.load(Ordering::SeqCst), 0);
        assert!(dispatcher.registry().is_empty());
    }

    fn protocol_error(kind: AMQPErrorKind, message: &str) -> lapin::Error {
        lapin::Error::ProtocolError(lapin::protocol::AMQPError::new(kind, message.into()))
    }

    #[test]
    fn refused_login_at_connect_is_a_credential_failure() {
        let refused = protocol_error(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN",
        );
        assert!(OpenError::Connect(refused).is_credential_refusal());

        let vhost = protocol_error(
            AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED),
            "NOT_ALLOWED - access to vhost 'cse' refused for user 'cse'",
        );
        assert!(OpenError::Connect(vhost).is_credential_refusal());
    }

    #[test]
    fn setup_and_transport_errors_are_not_credential_failures() {
        let exchange_denied = protocol_error(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED - access to exchange 'cse-ext' in vhost '/' refused for user 'cse'",
        );
        assert!(!OpenError::Setup(exchange_denied).is_credential_refusal());

        let missing = protocol_error(
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND),
            "NOT_FOUND - no exchange 'cse-403' in vhost '/'",
        );
        assert!(!OpenError::Connect(missing).is_credential_refusal());

        let io = lapin::Error::IOError(Arc::new(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));
        assert!(!OpenError::Connect(io).is_credential_refusal());
    }

    #[test]
    fn reset_clears_state_left_by_a_previous_run() {
        let connection = AmqpConnection::new(
            "amqp-test-reset",
            AmqpConfig::example(),
            Duration::from_secs(5),
            1,
            Arc::new(DeduplicationRegistry::new(4)),
            Arc::new(Router::new()),
        );
        for event in [
            AmqpEvent::Connect,
            AmqpEvent::ChannelOpened,
            AmqpEvent::ExchangeVerified,
            AmqpEvent::QueueBound,
            AmqpEvent::ConsumerStarted,
        ] {
            connection.apply(event);
        }
        assert_eq!(connection.amqp_state(), AmqpState::Subscribed);
        // A stale Subscribed state swallows Connect.
        assert_eq!(connection.apply(AmqpEvent::Connect), AmqpState::Subscribed);

        connection.reset();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.apply(AmqpEvent::Connect), AmqpState::Connecting);
    }
}
