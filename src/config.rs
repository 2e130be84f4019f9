//! Configuration management for Switchboard

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub registrar: RegistrarConfig,
    pub media: MediaConfig,
    pub pool: PoolConfig,
    pub drain: DrainConfig,
    pub dialplan: DialplanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub description: String,
    pub max_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub domain: String,
    /// Address placed in Contact/Via headers we originate.
    pub advertise_addr: IpAddr,
    pub advertise_port: u16,
    pub user_agent: String,
    pub timers: SipTimers,
}

/// Protocol timers, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipTimers {
    /// RFC 3261 Timer B equivalent: how long a UAS waits for ACK after 200 OK.
    pub ack_timeout: u64,
    /// How long a terminated dialog stays resolvable for retransmissions.
    pub terminated_ttl: u64,
    pub bye_timeout: u64,
    pub cancel_timeout: u64,
    /// UAC-side ACK send timeout after a 2xx.
    pub ack_send_timeout: u64,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            ack_timeout: 32,
            terminated_ttl: 32,
            bye_timeout: 5,
            cancel_timeout: 5,
            ack_send_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub min_expires: u32,
    pub default_expires: u32,
    pub max_expires: u32,
    /// Expired-binding sweep period, seconds.
    pub sweep_interval: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            min_expires: 30,
            default_expires: 60,
            max_expires: 120,
            sweep_interval: 15,
        }
    }
}

/// Media node daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub rpc_listen_addr: IpAddr,
    pub rpc_listen_port: u16,
    /// Address advertised in SDP we generate.
    pub advertise_addr: IpAddr,
    pub port_range: PortRange,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub members: Vec<PoolMemberConfig>,
    /// Seconds between Health pings per member.
    pub health_check_interval: u64,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub rpc_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMemberConfig {
    pub node_id: String,
    /// host:port of the node's RPC listener.
    pub address: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            health_check_interval: 5,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            rpc_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    pub graceful_timeout: u64,
    pub aggressive_timeout: u64,
    pub max_concurrent_migrations: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: 120,
            aggressive_timeout: 30,
            max_concurrent_migrations: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanConfig {
    /// JSON rules file; when absent a reject-all plan is used.
    pub file: Option<String>,
    pub default_dial_timeout: u64,
}

impl Default for DialplanConfig {
    fn default() -> Self {
        Self {
            file: None,
            default_dial_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

impl SwitchboardConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: SwitchboardConfig = toml::from_str(&content)
            .map_err(|e| Error::parse(format!("Invalid configuration file: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("SWITCHBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: SwitchboardConfig = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "switchboard-1".to_string(),
                description: "Switchboard B2BUA".to_string(),
                max_calls: 1000,
            },
            sip: SipConfig {
                listen_addr: "0.0.0.0".parse().unwrap(),
                listen_port: 5060,
                domain: "switchboard.local".to_string(),
                advertise_addr: "127.0.0.1".parse().unwrap(),
                advertise_port: 5060,
                user_agent: format!("Switchboard/{}", env!("CARGO_PKG_VERSION")),
                timers: SipTimers::default(),
            },
            registrar: RegistrarConfig::default(),
            media: MediaConfig {
                rpc_listen_addr: "0.0.0.0".parse().unwrap(),
                rpc_listen_port: 7077,
                advertise_addr: "127.0.0.1".parse().unwrap(),
                port_range: PortRange {
                    min: 10000,
                    max: 20000,
                },
            },
            pool: PoolConfig::default(),
            drain: DrainConfig::default(),
            dialplan: DialplanConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.node_id.is_empty() {
            return Err(Error::parse("general.node_id must not be empty"));
        }
        if self.sip.domain.is_empty() {
            return Err(Error::parse("sip.domain must not be empty"));
        }
        if self.media.port_range.min >= self.media.port_range.max {
            return Err(Error::parse("media.port_range.min must be below max"));
        }
        if self.registrar.min_expires > self.registrar.max_expires {
            return Err(Error::parse(
                "registrar.min_expires must not exceed max_expires",
            ));
        }
        if self.registrar.default_expires < self.registrar.min_expires
            || self.registrar.default_expires > self.registrar.max_expires
        {
            return Err(Error::parse(
                "registrar.default_expires must lie within [min_expires, max_expires]",
            ));
        }
        if self.drain.max_concurrent_migrations == 0 {
            return Err(Error::parse("drain.max_concurrent_migrations must be > 0"));
        }
        for member in &self.pool.members {
            if member.node_id.is_empty() {
                return Err(Error::parse("pool member node_id must not be empty"));
            }
            if member.address.parse::<std::net::SocketAddr>().is_err() {
                return Err(Error::parse(format!(
                    "pool member {} has an invalid address: {}",
                    member.node_id, member.address
                )));
            }
        }
        Ok(())
    }
}
