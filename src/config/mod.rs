pub mod schema;

pub use schema::{
    resolve_config_dir, AmqpConfig, Config, DispatchConfig, MqttConfig, ReliabilityConfig,
    CONFIG_FILE_NAME,
};
