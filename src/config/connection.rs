use crate::error::HubError;
use std::fmt;
use std::str::FromStr;

pub const HOST_NAME: &str = "HostName";
pub const DEVICE_ID: &str = "DeviceId";
pub const PORT: &str = "Port";
pub const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
pub const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
pub const SHARED_ACCESS_SIGNATURE: &str = "SharedAccessSignature";
pub const ENDPOINT: &str = "Endpoint";
pub const EVENTS_HOST_NAME: &str = "EventsHostName";
pub const EVENTS_PATH: &str = "EventsPath";
pub const ENTITY_PATH: &str = "EntityPath";
pub const USE_TLS: &str = "UseTls";

const SECRET_KEYS: [&str; 2] = [SHARED_ACCESS_KEY, SHARED_ACCESS_SIGNATURE];

/// `Key=Value;Key=Value` connection string as issued by the hub.
///
/// Keys are matched case-insensitively and kept in their original order so the
/// descriptor can be written back out unchanged. Credential values are carried
/// verbatim; nothing here interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDescriptor {
    pairs: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    pub fn parse(input: &str) -> Result<Self, HubError> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        for segment in input.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                HubError::fatal(format!("malformed connection string segment '{}'", segment))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(HubError::fatal("connection string contains an empty key"));
            }
            if pairs.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
                return Err(HubError::fatal(format!(
                    "connection string repeats key '{}'",
                    key
                )));
            }
            pairs.push((key.to_string(), value.trim().to_string()));
        }

        if pairs.is_empty() {
            return Err(HubError::fatal("connection string is empty"));
        }

        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn host_name(&self) -> Option<&str> {
        self.get(HOST_NAME)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.get(DEVICE_ID)
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.get(SHARED_ACCESS_KEY_NAME)
    }

    pub fn shared_access_key(&self) -> Option<&str> {
        self.get(SHARED_ACCESS_KEY)
    }

    pub fn shared_access_signature(&self) -> Option<&str> {
        self.get(SHARED_ACCESS_SIGNATURE)
    }

    pub fn port(&self) -> Result<Option<u16>, HubError> {
        self.get(PORT)
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| HubError::fatal(format!("invalid port '{}'", p)))
            })
            .transpose()
    }

    /// Explicit `UseTls` setting, if any.
    pub fn use_tls(&self) -> Option<bool> {
        self.get(USE_TLS).map(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn require_host(&self) -> Result<&str, HubError> {
        self.host_name()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| HubError::fatal("connection string has no HostName"))
    }

    pub fn require_device_id(&self) -> Result<&str, HubError> {
        self.device_id()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| HubError::fatal("connection string has no DeviceId"))
    }

    /// Derives the descriptor of the hub-wide event stream from this control-plane
    /// descriptor.
    ///
    /// An explicit `Endpoint` wins, then `EventsHostName`, then the hub host
    /// itself. Access credentials carry over; `EventsPath` becomes `EntityPath`.
    pub fn stream_descriptor(&self) -> Result<ConnectionDescriptor, HubError> {
        let mut stream = ConnectionDescriptor::default();

        if let Some(endpoint) = self.get(ENDPOINT) {
            let (host, port) = split_endpoint(endpoint)?;
            stream.set(HOST_NAME, host);
            if let Some(port) = port {
                stream.set(PORT, port.to_string());
            }
        } else if let Some(events_host) = self.get(EVENTS_HOST_NAME) {
            stream.set(HOST_NAME, events_host);
        } else {
            stream.set(HOST_NAME, self.require_host()?);
            if let Some(port) = self.get(PORT) {
                stream.set(PORT, port);
            }
        }

        for key in [SHARED_ACCESS_KEY_NAME, SHARED_ACCESS_KEY, SHARED_ACCESS_SIGNATURE] {
            if let Some(value) = self.get(key) {
                stream.set(key, value);
            }
        }

        if let Some(path) = self.get(EVENTS_PATH).or_else(|| self.get(ENTITY_PATH)) {
            stream.set(ENTITY_PATH, path);
        }

        Ok(stream)
    }

    /// Rendering with secrets masked, for logs.
    pub fn redacted(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| {
                if SECRET_KEYS.iter().any(|s| s.eq_ignore_ascii_case(k)) {
                    format!("{}=***", k)
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

fn split_endpoint(endpoint: &str) -> Result<(String, Option<u16>), HubError> {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = without_scheme.split('/').next().unwrap_or_default();

    if authority.is_empty() {
        return Err(HubError::fatal(format!("endpoint '{}' has no host", endpoint)));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| HubError::fatal(format!("invalid port in endpoint '{}'", endpoint)))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        f.write_str(&rendered)
    }
}
