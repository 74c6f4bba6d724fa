use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::Path,
    time::Duration,
};

use async_std::net::ToSocketAddrs;

use serde::{Deserialize, Deserializer};

use crate::{
    codec::DEFAULT_PORT,
    error::{Error, Result, TransportError, TransportErrorKind},
};

fn deserialize_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_scan_interval_secs() -> u64 {
    30
}

/// Tunables of a `DeviceClient`.
///
/// All timing values are read from TOML as milliseconds, using the
/// field name with a `_ms` suffix.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local address the UDP socket binds to.
    pub local_addr: SocketAddr,

    /// Address discovery probes are broadcast to.
    pub broadcast_addr: SocketAddr,

    /// Optional relay address that receives a copy of every discovery probe.
    pub relay_addr: Option<SocketAddr>,

    /// Number of discovery probes sent per discovery.
    pub discovery_rounds: u8,

    /// Time to collect replies after each discovery probe.
    #[serde(rename = "discovery_timeout_ms", deserialize_with = "deserialize_millis")]
    pub discovery_timeout: Duration,

    /// Time to wait for an explicitly requested device id to show up.
    #[serde(rename = "device_wait_timeout_ms", deserialize_with = "deserialize_millis")]
    pub device_wait_timeout: Duration,

    /// Time to wait for the connect handshake to complete.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "deserialize_millis")]
    pub connect_timeout: Duration,

    /// Interval between retransmissions of an unanswered connect request.
    #[serde(rename = "connect_retry_interval_ms", deserialize_with = "deserialize_millis")]
    pub connect_retry_interval: Duration,

    /// Time to wait for the first data frame after connecting.
    #[serde(rename = "data_timeout_ms", deserialize_with = "deserialize_millis")]
    pub data_timeout: Duration,

    /// Delay after a setpoint write before requesting the setpoint state.
    #[serde(rename = "settle_delay_ms", deserialize_with = "deserialize_millis")]
    pub settle_delay: Duration,

    /// Delay after the setpoint state request before reading the value back.
    #[serde(rename = "readback_delay_ms", deserialize_with = "deserialize_millis")]
    pub readback_delay: Duration,

    /// Interval between data requests while connected, doubles as keep-alive.
    #[serde(rename = "refresh_interval_ms", deserialize_with = "deserialize_millis")]
    pub refresh_interval: Duration,

    /// Upper bound for a single receive in the session's receive loop.
    #[serde(rename = "poll_interval_ms", deserialize_with = "deserialize_millis")]
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            local_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_PORT)),
            relay_addr: None,
            discovery_rounds: 3,
            discovery_timeout: Duration::from_millis(1000),
            device_wait_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_secs(1),
            data_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            readback_delay: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Everything needed to reach one configured gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    /// The email authorized in the vendor app, sent as client identity.
    pub email: String,

    /// Optional device id to connect to.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Optional manual host, takes precedence over `device_id`.
    #[serde(default)]
    pub host: Option<String>,

    /// Port used together with `host`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Polling interval for the external scheduler.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl GatewayConfig {
    /// Create a config that discovers and picks the first device.
    pub fn new<S: Into<String>>(email: S) -> GatewayConfig {
        GatewayConfig {
            email: email.into(),
            device_id: None,
            host: None,
            port: DEFAULT_PORT,
            scan_interval_secs: default_scan_interval_secs(),
        }
    }

    /// Resolve the effective config from command-line overrides and a settings file.
    ///
    /// Overrides win over the settings file. The email is mandatory.
    pub fn resolve(overrides: &Overrides, settings: &Settings) -> Result<GatewayConfig> {
        let email = overrides
            .email
            .clone()
            .or_else(|| settings.auth.email.clone())
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "Email missing. Provide --email or set auth.email in the settings file".into(),
                )
            })?;

        let host = overrides
            .host
            .clone()
            .or_else(|| settings.gateway.host.clone())
            .filter(|host| !host.is_empty());

        let device_id = overrides
            .device_id
            .clone()
            .or_else(|| settings.gateway.device_id.clone())
            .filter(|id| !id.is_empty());

        let port = overrides
            .port
            .or(settings.gateway.port)
            .unwrap_or(DEFAULT_PORT);

        let scan_interval_secs = settings
            .gateway
            .scan_interval_secs
            .unwrap_or_else(default_scan_interval_secs);

        Ok(GatewayConfig {
            email,
            device_id,
            host,
            port,
            scan_interval_secs,
        })
    }

    /// The polling interval as a `Duration`.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Resolve the manual host and port, if a host is configured.
    pub async fn manual_addr(&self) -> Result<Option<SocketAddr>> {
        let host = match &self.host {
            Some(host) => host,
            None => return Ok(None),
        };

        let mut addrs = (host.as_str(), self.port)
            .to_socket_addrs()
            .await
            .map_err(|err| TransportError::io(TransportErrorKind::Address, &err))?;

        match addrs.next() {
            Some(addr) => Ok(Some(addr)),
            None => Err(TransportError::new(
                TransportErrorKind::Address,
                format!("{} did not resolve to an address", host),
            )
            .into()),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// `--email`
    pub email: Option<String>,
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--device-id`
    pub device_id: Option<String>,
}

/// The `[auth]` section of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthSettings {
    /// The authorized email.
    pub email: Option<String>,
}

/// The `[gateway]` section of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatewaySettings {
    /// Manual host.
    pub host: Option<String>,
    /// Manual port.
    pub port: Option<u16>,
    /// Device id.
    pub device_id: Option<String>,
    /// Polling interval in seconds.
    pub scan_interval_secs: Option<u64>,
}

/// Contents of a TOML settings file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Settings {
    /// Identity settings.
    #[serde(default)]
    pub auth: AuthSettings,
    /// Gateway settings.
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Client tunables.
    #[serde(default)]
    pub client: ClientConfig,
}

impl Settings {
    /// Parse settings from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Settings> {
        toml::from_str(s).map_err(|err| Error::Config(format!("Unable to parse settings: {}", err)))
    }

    /// Load settings from a TOML file, a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(s) => Settings::from_toml_str(&s),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(err) => Err(Error::Config(format!(
                "Unable to read {}: {}",
                path.as_ref().display(),
                err
            ))),
        }
    }
}
