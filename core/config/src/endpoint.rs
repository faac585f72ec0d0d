// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

use crate::backoff::fixedinterval;
use crate::component::configuration::{Configuration, ConfigurationError};
use crate::tls::TlsConfig;

/// Body codec names accepted by `default_body_codec`.
pub const BODY_CODEC_NAMES: &[&str] = &["binary", "json", "protobuf", "plain"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Kcp,
    Quic,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::Kcp => "kcp",
            Network::Quic => "quic",
        }
    }

    /// Whether this build can open connections on the network.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Network::Kcp | Network::Quic)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// tcp, tcp4, tcp6, unix (kcp and quic are parsed but rejected at runtime)
    #[serde(default)]
    pub network: Network,

    /// address the listener binds to
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// 0 asks the OS for a free port
    #[serde(default)]
    pub listen_port: u16,

    /// socket path for the unix network
    #[serde(default)]
    pub unix_path: Option<String>,

    /// local address used when dialing
    #[serde(default)]
    pub local_ip: Option<String>,

    #[serde(default)]
    pub local_port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// codec used for bodies when the caller does not pick one
    #[serde(default = "default_body_codec")]
    pub default_body_codec: String,

    /// maximum lifetime of a session, zero disables it
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub default_session_age: Duration,

    /// deadline applied to every call and handler, zero disables it
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub default_context_age: Duration,

    #[serde(
        default = "default_dial_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub dial_timeout: Duration,

    /// number of reconnection attempts, negative means unlimited
    #[serde(default)]
    pub redial_times: i32,

    #[serde(
        default = "default_redial_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub redial_interval: Duration,

    /// log message meta and body of each handled message
    #[serde(default)]
    pub print_detail: bool,

    /// calls slower than this are logged as warnings, zero disables it
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub slow_cost_time: Duration,

    /// maximum accepted frame size in bytes, zero means unlimited
    #[serde(default)]
    pub max_message_size: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            network: Network::default(),
            listen_ip: default_listen_ip(),
            listen_port: 0,
            unix_path: None,
            local_ip: None,
            local_port: 0,
            tls: None,
            default_body_codec: default_body_codec(),
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            dial_timeout: default_dial_timeout(),
            redial_times: 0,
            redial_interval: default_redial_interval(),
            print_detail: false,
            slow_cost_time: Duration::ZERO,
            max_message_size: 0,
        }
    }
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_body_codec() -> String {
    "json".to_string()
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_redial_interval() -> Duration {
    Duration::from_millis(100)
}

impl EndpointConfig {
    pub fn new() -> Self {
        EndpointConfig::default()
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_listen(mut self, ip: &str, port: u16) -> Self {
        self.listen_ip = ip.to_string();
        self.listen_port = port;
        self
    }

    pub fn with_unix_path(mut self, path: &str) -> Self {
        self.unix_path = Some(path.to_string());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_default_body_codec(mut self, codec: &str) -> Self {
        self.default_body_codec = codec.to_string();
        self
    }

    pub fn with_session_age(mut self, age: Duration) -> Self {
        self.default_session_age = age;
        self
    }

    pub fn with_context_age(mut self, age: Duration) -> Self {
        self.default_context_age = age;
        self
    }

    pub fn with_redial(mut self, times: i32, interval: Duration) -> Self {
        self.redial_times = times;
        self.redial_interval = interval;
        self
    }

    pub fn with_print_detail(mut self, print_detail: bool) -> Self {
        self.print_detail = print_detail;
        self
    }

    pub fn with_slow_cost_time(mut self, slow: Duration) -> Self {
        self.slow_cost_time = slow;
        self
    }

    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// `ip:port` of the listener, bracketing IPv6 literals.
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_ip, self.listen_port)
    }

    /// `ip:port` to bind before dialing, if configured.
    pub fn local_addr(&self) -> Option<String> {
        self.local_ip
            .as_ref()
            .map(|ip| join_host_port(ip, self.local_port))
    }

    pub fn redial_enabled(&self) -> bool {
        self.redial_times != 0
    }

    pub fn redial_strategy(&self) -> fixedinterval::Config {
        let attempts = if self.redial_times < 0 {
            None
        } else {
            Some(self.redial_times as usize)
        };
        fixedinterval::Config::new(self.redial_interval, attempts)
    }

    fn optional(d: Duration) -> Option<Duration> {
        if d.is_zero() { None } else { Some(d) }
    }

    pub fn session_age(&self) -> Option<Duration> {
        Self::optional(self.default_session_age)
    }

    pub fn context_age(&self) -> Option<Duration> {
        Self::optional(self.default_context_age)
    }

    pub fn slow_cost(&self) -> Option<Duration> {
        Self::optional(self.slow_cost_time)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl Configuration for EndpointConfig {
    type Error = ConfigurationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if !BODY_CODEC_NAMES.contains(&self.default_body_codec.as_str()) {
            return Err(ConfigurationError::UnknownBodyCodec(
                self.default_body_codec.clone(),
            ));
        }

        if self.network == Network::Unix && self.unix_path.is_none() {
            return Err(ConfigurationError::MissingField("unix_path"));
        }

        if self.redial_times < -1 {
            return Err(ConfigurationError::InvalidValue {
                field: "redial_times",
                reason: "must be -1 (unlimited) or greater".to_string(),
            });
        }

        if self.dial_timeout.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "dial_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigurationError::InvalidValue {
                    field: "tls",
                    reason: "cert_file and key_file must be set together".to_string(),
                });
            }
        }

        Ok(())
    }
}
