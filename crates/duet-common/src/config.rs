//! Protocol timings and ICE server configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::helpers::env_duration_ms;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_OFFER_EXPIRY: Duration = Duration::from_secs(45);
pub const DEFAULT_ICE_FAILED_GRACE: Duration = Duration::from_secs(3);

const ICE_CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Public STUN servers used when no configuration can be fetched.
pub const FALLBACK_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Timers shared by the signaling channel and the call engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Interval between client pings while the channel is open.
    pub heartbeat_interval: Duration,
    /// Delay before the single reconnect after an abnormal close.
    pub reconnect_delay: Duration,
    /// How long a caller waits for an answer.
    pub response_timeout: Duration,
    /// How long an incoming offer stays acceptable.
    pub offer_expiry: Duration,
    /// How long ICE may stay `failed` before the call is torn down.
    pub ice_failed_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            offer_expiry: DEFAULT_OFFER_EXPIRY,
            ice_failed_grace: DEFAULT_ICE_FAILED_GRACE,
        }
    }
}

impl Timings {
    /// Defaults overridden by `DUET_*_MS` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: env_duration_ms("DUET_HEARTBEAT_MS", defaults.heartbeat_interval),
            reconnect_delay: env_duration_ms("DUET_RECONNECT_DELAY_MS", defaults.reconnect_delay),
            response_timeout: env_duration_ms(
                "DUET_RESPONSE_TIMEOUT_MS",
                defaults.response_timeout,
            ),
            offer_expiry: env_duration_ms("DUET_OFFER_EXPIRY_MS", defaults.offer_expiry),
            ice_failed_grace: env_duration_ms(
                "DUET_ICE_FAILED_GRACE_MS",
                defaults.ice_failed_grace,
            ),
        }
    }
}

/// One STUN/TURN entry in browser `RTCIceServer` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceConfigDocument {
    List(Vec<IceServer>),
    Wrapped {
        #[serde(rename = "iceServers", alias = "ice_servers")]
        ice_servers: Vec<IceServer>,
    },
}

pub fn fallback_ice_servers() -> Vec<IceServer> {
    FALLBACK_STUN_URLS
        .iter()
        .map(|url| IceServer::stun(*url))
        .collect()
}

/// Parse a list or `{"iceServers": [...]}` document.
pub fn parse_ice_servers(text: &str) -> Result<Vec<IceServer>> {
    let servers = match serde_json::from_str::<IceConfigDocument>(text)? {
        IceConfigDocument::List(servers) => servers,
        IceConfigDocument::Wrapped { ice_servers } => ice_servers,
    };
    let servers: Vec<IceServer> = servers
        .into_iter()
        .filter(|server| !server.urls.is_empty())
        .collect();
    if servers.is_empty() {
        return Err(Error::config("ICE configuration contains no usable servers"));
    }
    Ok(servers)
}

pub async fn fetch_ice_servers(url: &str) -> Result<Vec<IceServer>> {
    let client = reqwest::Client::builder()
        .timeout(ICE_CONFIG_FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::transport(format!("ICE config request failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::transport(format!("ICE config request rejected: {e}")))?;
    let body = response
        .text()
        .await
        .map_err(|e| Error::transport(format!("ICE config body unreadable: {e}")))?;
    parse_ice_servers(&body)
}

/// Fetch the ICE configuration once; any failure yields the STUN fallback.
pub async fn load_ice_servers(url: Option<&str>) -> Vec<IceServer> {
    let Some(url) = url else {
        return fallback_ice_servers();
    };
    match fetch_ice_servers(url).await {
        Ok(servers) => {
            info!("loaded {} ICE server(s) from {}", servers.len(), url);
            servers
        }
        Err(e) => {
            warn!("using fallback STUN servers: {}", e);
            fallback_ice_servers()
        }
    }
}

/// ICE servers from `DUET_ICE_SERVERS` (JSON), else the fallback list.
pub fn ice_servers_from_env() -> Vec<IceServer> {
    match std::env::var("DUET_ICE_SERVERS") {
        Ok(raw) if !raw.trim().is_empty() => match parse_ice_servers(&raw) {
            Ok(servers) => servers,
            Err(e) => {
                warn!("ignoring DUET_ICE_SERVERS: {}", e);
                fallback_ice_servers()
            }
        },
        _ => fallback_ice_servers(),
    }
}
