use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use squall_tftp::config::{load_config, validate_config, write_config, TftpConfig};
use squall_tftp::{Result, TftpError, TftpServer};

#[derive(Parser, Debug)]
#[command(name = "squall-tftp-server", about = "TFTP file-transfer server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/squall/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the listening socket
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable or disable write requests
    #[arg(long, value_parser = clap::value_parser!(bool))]
    allow_writes: Option<bool>,

    /// Per-block timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Transmission attempts per block
    #[arg(long)]
    max_retries: Option<u32>,

    /// Ceiling for the negotiated block size
    #[arg(long)]
    max_block_size: Option<usize>,

    /// File lock registry capacity
    #[arg(long)]
    lock_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(allow_writes) = cli.allow_writes {
        config.allow_writes = allow_writes;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(max_block_size) = cli.max_block_size {
        config.max_block_size = max_block_size;
    }
    if let Some(lock_capacity) = cli.lock_capacity {
        config.lock_capacity = lock_capacity;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let _log_guard = if let Some(ref log_file) = config.logging.file {
        let dir = match log_file.parent() {
            Some(path) => path,
            None => std::path::Path::new("."),
        };
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                TftpError::InvalidConfig("logging.file must include a file name".to_string())
            })?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.logging.level.clone()))
            .with_writer(non_blocking)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.logging.level.clone()))
            .init();

        None
    };

    let server = TftpServer::new(config);
    server.run().await
}
