use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, MAX_BLOCK_SIZE};

/// Server configuration, loaded from TOML with per-field CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    /// Directory every requested filename is resolved under.
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,

    /// Whether WRQ is honored at all. A write request while disabled is
    /// answered with an access-violation ERROR.
    pub allow_writes: bool,

    /// Per-block receive deadline in seconds.
    pub timeout_secs: u64,
    /// Transmission attempts per block, the initial send included.
    pub max_retries: u32,
    /// Ceiling applied to the blksize option during negotiation.
    pub max_block_size: usize,
    /// Capacity of the file lock registry. One entry per distinct
    /// filename ever requested; entries are never evicted.
    pub lock_capacity: usize,

    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/squall/tftp"),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 69),
            allow_writes: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_block_size: MAX_BLOCK_SIZE,
            lock_capacity: 100,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents).map_err(|e| {
        TftpError::InvalidConfig(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::InvalidConfig(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate the configuration before serving. With `validate_bind` the
/// bind address is also probed with a real socket.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::InvalidConfig(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::InvalidConfig(
                    "root_dir must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::InvalidConfig(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::InvalidConfig(format!(
            "root_dir is not readable: {}",
            e
        )));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::InvalidConfig(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if config.max_retries == 0 {
        return Err(TftpError::InvalidConfig(
            "max_retries must be at least 1".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(TftpError::InvalidConfig(
            "timeout_secs must be at least 1".to_string(),
        ));
    }

    if !(8..=MAX_BLOCK_SIZE).contains(&config.max_block_size) {
        return Err(TftpError::InvalidConfig(format!(
            "max_block_size must be in range 8-{}",
            MAX_BLOCK_SIZE
        )));
    }

    if config.lock_capacity == 0 {
        return Err(TftpError::InvalidConfig(
            "lock_capacity must be at least 1".to_string(),
        ));
    }

    if validate_bind {
        if let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
            return Err(TftpError::InvalidConfig(format!(
                "bind_addr is not available: {}",
                e
            )));
        }
    }

    Ok(())
}
