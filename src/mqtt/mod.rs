pub mod client;
pub mod stream;
pub mod topics;

pub use client::{LazyDeviceEndpoint, MqttDeviceEndpoint};
pub use stream::MqttEventSource;

use crate::config::ConnectionDescriptor;
use crate::error::{HubError, HubResult};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport};
use std::io;
use std::time::Duration;

pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const PLAIN_PORT: u16 = 1883;
pub const MQTT_API_VERSION: &str = "2021-04-12";

/// Broker options for a descriptor. TLS is on for every port but 1883 unless
/// the descriptor carries `UseTls=false`.
pub fn build_options(
    client_id: &str,
    descriptor: &ConnectionDescriptor,
    username: Option<String>,
    clean_session: bool,
) -> HubResult<MqttOptions> {
    let host = descriptor.require_host()?;
    let port = descriptor.port()?.unwrap_or(DEFAULT_TLS_PORT);

    let mut mqtt_options = MqttOptions::new(client_id, host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(clean_session);
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    let use_tls = descriptor.use_tls().unwrap_or(port != PLAIN_PORT);
    if use_tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    let password = descriptor
        .shared_access_signature()
        .or_else(|| descriptor.shared_access_key());
    if let (Some(username), Some(password)) = (username, password) {
        mqtt_options.set_credentials(username, password);
    }

    Ok(mqtt_options)
}

pub fn classify_connection_error(err: &ConnectionError) -> HubError {
    match err {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            HubError::timeout(err.to_string())
        }
        ConnectionError::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
            HubError::timeout(err.to_string())
        }
        ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable) => {
            HubError::transient(err.to_string())
        }
        ConnectionError::ConnectionRefused(code) => {
            HubError::fatal(format!("broker refused connection: {:?}", code))
        }
        ConnectionError::RequestsDone => HubError::Cancelled,
        _ => HubError::transient(err.to_string()),
    }
}
