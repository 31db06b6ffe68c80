pub mod amqp;
pub mod mqtt;
pub mod state;
pub mod traits;

pub use amqp::{AmqpConnection, AmqpDispatcher, AmqpInbound, AmqpState, DeliveryAck};
pub use mqtt::{MqttConnection, MqttDispatcher};
pub use state::{ConnectionState, ConnectionStateCell};
pub use traits::BusConnection;

use crate::config::Config;
use crate::dispatch::DeduplicationRegistry;
use crate::envelope::CodecError;
use crate::handler::RequestHandler;
use std::sync::Arc;

/// Errors raised by the bus transports.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection '{0}' has no open transport")]
    NotConnected(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    MqttConnection(String),

    #[error("authentication rejected by broker: {0}")]
    Authentication(String),

    #[error("reply destination {0} cannot be reached over this transport")]
    Destination(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BusError {
    /// Credential failures are not retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Build every configured bus connection.
///
/// All AMQP consumers share `registry`; each connection gets its own worker
/// pool and reply channel.
pub fn build_connections(
    config: &Config,
    registry: &Arc<DeduplicationRegistry>,
    handler: &Arc<dyn RequestHandler>,
) -> Vec<Arc<dyn BusConnection>> {
    let mut connections: Vec<Arc<dyn BusConnection>> = Vec::new();
    let pool_size = config.dispatch.worker_pool_size;

    if let Some(amqp) = &config.amqp {
        let count = amqp.consumer_count.max(1);
        for index in 0..count {
            let name = if count == 1 {
                "amqp".to_string()
            } else {
                format!("amqp-{index}")
            };
            connections.push(Arc::new(AmqpConnection::new(
                name,
                amqp.clone(),
                config.reliability.amqp_reconnect_delay(),
                pool_size,
                Arc::clone(registry),
                Arc::clone(handler),
            )));
        }
    }

    if let Some(mqtt) = &config.mqtt {
        connections.push(Arc::new(MqttConnection::new(
            "mqtt",
            mqtt.clone(),
            pool_size,
            Arc::clone(handler),
        )));
    }

    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AmqpConfig, MqttConfig};
    use crate::handler::Router;

    #[test]
    fn builds_one_connection_per_consumer_plus_mqtt() {
        let mut config = Config::default();
        let mut amqp = AmqpConfig::example();
        amqp.consumer_count = 3;
        config.amqp = Some(amqp);
        config.mqtt = Some(MqttConfig::example());
        config.dispatch.worker_pool_size = 4;

        let registry = Arc::new(DeduplicationRegistry::new(16));
        let handler: Arc<dyn RequestHandler> = Arc::new(Router::new());
        let connections = build_connections(&config, &registry, &handler);

        let names: Vec<_> = connections.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["amqp-0", "amqp-1", "amqp-2", "mqtt"]);
        assert!(connections
            .iter()
            .all(|c| c.pool_stats().total_capacity == 4));
        assert!(connections
            .iter()
            .all(|c| c.state() == ConnectionState::Disconnected));
    }

    #[test]
    fn only_authentication_is_fatal() {
        assert!(BusError::Authentication("bad password".into()).is_fatal());
        assert!(!BusError::NotConnected("amqp".into()).is_fatal());
        assert!(!BusError::MqttConnection("reset".into()).is_fatal());
    }
}
