//! MQTT-over-WebSocket transport.
//!
//! The network loop is rumqttc's `EventLoop`, polled from the connection
//! task. Nothing on that task may await a publish: replies are queued from
//! worker tasks, and overload replies from a detached task, so the loop keeps
//! polling and the client's request queue keeps draining.

use super::{BusConnection, BusError, ConnectionState, ConnectionStateCell};
use crate::config::MqttConfig;
use crate::dispatch::{
    self, DispatchOutcome, PoolStats, ReplyChannel, ReplyDestination, ReplyPublisher, WorkerPool,
};
use crate::envelope::{self, Protocol, ResponseEnvelope};
use crate::handler::RequestHandler;
use crate::util::payload_preview;
use async_trait::async_trait;
use rumqttc::tokio_rustls::rustls;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a network error before polling (and so reconnecting) again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_QUEUE_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const PREVIEW_CHARS: usize = 160;

// ── Dispatch decision ────────────────────────────────────────────

/// Per-message dispatch for MQTT. There is no duplicate suppression on this
/// path: a redelivered request is processed again.
pub struct MqttDispatcher {
    name: String,
    state: Arc<ConnectionStateCell>,
    pool: Arc<WorkerPool>,
    replies: Arc<ReplyChannel>,
    handler: Arc<dyn RequestHandler>,
    respond_topic: String,
}

impl MqttDispatcher {
    pub fn new(
        name: impl Into<String>,
        state: Arc<ConnectionStateCell>,
        pool: Arc<WorkerPool>,
        replies: Arc<ReplyChannel>,
        handler: Arc<dyn RequestHandler>,
        respond_topic: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            state,
            pool,
            replies,
            handler,
            respond_topic: respond_topic.into(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn replies(&self) -> &Arc<ReplyChannel> {
        &self.replies
    }

    fn destination(&self) -> ReplyDestination {
        ReplyDestination::Mqtt {
            topic: self.respond_topic.clone(),
        }
    }

    /// Decide what to do with one inbound publish. Never awaits.
    pub fn dispatch(&self, payload: Vec<u8>) -> DispatchOutcome {
        if self.state.get().is_shutting_down() {
            tracing::debug!(connection = %self.name, "Closing; ignoring inbound publish");
            return DispatchOutcome::Dropped;
        }

        let request_id = match envelope::mqtt::peek_request_id(&payload) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    connection = %self.name,
                    payload = %payload_preview(&payload, PREVIEW_CHARS),
                    "Dropping message without request id: {e}"
                );
                return DispatchOutcome::Malformed;
            }
        };

        if self.pool.is_saturated() {
            tracing::warn!(
                connection = %self.name,
                %request_id,
                capacity = self.pool.total_capacity(),
                "Worker pool saturated; replying 429"
            );
            let replies = Arc::clone(&self.replies);
            let destination = self.destination();
            tokio::spawn(async move {
                dispatch::publish_response(
                    &replies,
                    &ResponseEnvelope::overloaded(request_id),
                    Protocol::Mqtt,
                    &destination,
                )
                .await;
            });
            return DispatchOutcome::Overloaded;
        }

        let handler = Arc::clone(&self.handler);
        let replies = Arc::clone(&self.replies);
        let destination = self.destination();
        let submitted = self.pool.submit(dispatch::process_request(
            payload,
            request_id,
            Protocol::Mqtt,
            handler,
            replies,
            destination,
        ));

        if submitted {
            DispatchOutcome::Submitted
        } else {
            DispatchOutcome::Dropped
        }
    }
}

// ── Reply publisher ──────────────────────────────────────────────

struct MqttReplyPublisher {
    client: AsyncClient,
}

#[async_trait]
impl ReplyPublisher for MqttReplyPublisher {
    async fn publish(&self, payload: Vec<u8>, destination: &ReplyDestination) -> Result<(), BusError> {
        let ReplyDestination::Mqtt { topic } = destination else {
            return Err(BusError::Destination(destination.to_string()));
        };
        self.client
            .publish(topic.as_str(), QoS::ExactlyOnce, false, payload)
            .await?;
        Ok(())
    }
}

// ── TLS ──────────────────────────────────────────────────────────

/// Accepts any server certificate. Only installed when `verify_ssl = false`.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn transport(config: &MqttConfig) -> Transport {
    if config.verify_ssl {
        return Transport::wss_with_default_config();
    }

    tracing::warn!(
        broker = %config.broker_host(),
        "TLS certificate verification is disabled for the MQTT broker"
    );
    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
        .with_no_client_auth();
    Transport::Wss(TlsConfiguration::Rustls(Arc::new(tls)))
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("cse-bus-{}", uuid::Uuid::new_v4()));

    // With websockets the "host" is the full URL; rumqttc reads the port from it.
    let mut options = MqttOptions::new(client_id, config.websocket_url(), config.connect_port);
    options.set_transport(transport(config));
    options.set_credentials(config.client_username.clone(), config.auth_token.clone());
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options
}

fn is_fatal_refusal(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    )
}

// ── Connection ───────────────────────────────────────────────────

/// Whether the listen topic is still owed a subscribe after a ConnAck.
///
/// `try_subscribe` fails when the client's request queue is full. The clean
/// session means the broker holds nothing for us, so the subscribe is retried
/// on every poll until it is queued.
#[derive(Debug, Default)]
struct PendingSubscribe {
    pending: bool,
}

impl PendingSubscribe {
    fn connected(&mut self) {
        self.pending = true;
    }

    fn lost(&mut self) {
        self.pending = false;
    }

    /// Run `subscribe` if one is owed. Returns `Ok(true)` when it was just queued.
    fn attempt<E>(&mut self, subscribe: impl FnOnce() -> Result<(), E>) -> Result<bool, E> {
        if !self.pending {
            return Ok(false);
        }
        subscribe()?;
        self.pending = false;
        Ok(true)
    }
}

pub struct MqttConnection {
    name: String,
    config: MqttConfig,
    state: Arc<ConnectionStateCell>,
    dispatcher: MqttDispatcher,
}

impl MqttConnection {
    pub fn new(
        name: impl Into<String>,
        config: MqttConfig,
        pool_size: usize,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let name = name.into();
        let state = Arc::new(ConnectionStateCell::new(name.clone()));
        let dispatcher = MqttDispatcher::new(
            name.clone(),
            Arc::clone(&state),
            Arc::new(WorkerPool::new(format!("{name}-workers"), pool_size)),
            Arc::new(ReplyChannel::detached(name.clone())),
            handler,
            config.respond_topic.clone(),
        );
        Self {
            name,
            config,
            state,
            dispatcher,
        }
    }

    /// Closing: unsubscribe, drain workers while the loop still flushes
    /// their replies, then disconnect.
    async fn close(&self, client: &AsyncClient, eventloop: &mut rumqttc::EventLoop) {
        self.state.set(ConnectionState::Closing);
        if let Err(e) = client.try_unsubscribe(self.config.listen_topic.as_str()) {
            tracing::debug!(connection = %self.name, "Unsubscribe failed: {e}");
        }

        let drain = self.dispatcher.pool.shutdown(true);
        tokio::pin!(drain);
        loop {
            tokio::select! {
                () = &mut drain => break,
                event = eventloop.poll() => {
                    if let Err(e) = event {
                        tracing::debug!(connection = %self.name, "Poll error while draining: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        self.dispatcher.replies.detach().await;
        if client.try_disconnect().is_ok() {
            let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if flushed.is_err() {
                tracing::debug!(connection = %self.name, "Disconnect not flushed before timeout");
            }
        }

        self.state.set(ConnectionState::Closed);
        tracing::info!(connection = %self.name, "MQTT connection closed");
    }
}

#[async_trait]
impl BusConnection for MqttConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn pool_stats(&self) -> PoolStats {
        self.dispatcher.pool.stats()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(&self.config), REQUEST_QUEUE_CAPACITY);
        self.dispatcher
            .replies
            .attach(Box::new(MqttReplyPublisher {
                client: client.clone(),
            }))
            .await;

        self.state.set(ConnectionState::Connecting);
        tracing::info!(
            connection = %self.name,
            url = %self.config.websocket_url(),
            "Connecting to MQTT broker"
        );
        let mut connected_once = false;
        let mut subscribe = PendingSubscribe::default();

        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected_once = true;
                    subscribe.connected();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let outcome = self.dispatcher.dispatch(publish.payload.to_vec());
                    tracing::debug!(
                        connection = %self.name,
                        topic = %publish.topic,
                        outcome = outcome.as_str(),
                        "Publish dispatched"
                    );
                }
                Ok(_) => {}
                Err(e) if !connected_once && is_fatal_refusal(&e) => {
                    tracing::error!(connection = %self.name, "MQTT broker refused credentials: {e}");
                    crate::health::mark_component_error(&self.name, &e);
                    self.dispatcher.pool.shutdown(false).await;
                    self.dispatcher.replies.detach().await;
                    self.state.set(ConnectionState::Closed);
                    return Err(BusError::Authentication(e.to_string()));
                }
                Err(e) => {
                    subscribe.lost();
                    self.state.set(ConnectionState::Disconnected);
                    crate::health::mark_component_error(&self.name, &e);
                    tracing::warn!(connection = %self.name, "MQTT connection error: {e}");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                    self.state.set(ConnectionState::Connecting);
                    continue;
                }
            }

            // try_subscribe: an awaiting subscribe could block on the request
            // queue this very loop is responsible for draining.
            match subscribe.attempt(|| {
                client.try_subscribe(self.config.listen_topic.as_str(), QoS::ExactlyOnce)
            }) {
                Ok(true) => {
                    self.state.set(ConnectionState::Subscribed);
                    crate::health::mark_component_ok(&self.name);
                    tracing::info!(
                        connection = %self.name,
                        topic = %self.config.listen_topic,
                        "MQTT connected and subscribed"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(connection = %self.name, "Subscribe not queued, retrying: {e}");
                }
            }
        }

        self.close(&client, &mut eventloop).await;
        Ok(())
    }
}
