use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tracing::info;

use squall_tftp::transfer::RetryPolicy;
use squall_tftp::{Result, TftpClient, TftpError, TransferMode};

/// Squall TFTP client
#[derive(Parser, Debug)]
#[command(name = "squall-tftp-client")]
#[command(about = "TFTP file-transfer client", long_about = None)]
struct Cli {
    /// TFTP server address (e.g. 192.168.1.100:69)
    #[arg(short, long)]
    server: String,

    /// Download the named remote file
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Upload the local file at this path
    #[arg(short, long, conflicts_with = "get")]
    put: Option<String>,

    /// For get: local destination path; for put: name to store under on
    /// the server. Defaults to the get/put argument itself.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Block size to request (8-65464 bytes)
    #[arg(short, long, default_value_t = 512)]
    block_size: usize,

    /// Request extended 32-bit block counting
    #[arg(long)]
    bigfile: bool,

    /// Timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Transmission attempts per block
    #[arg(short = 'r', long, default_value_t = 5)]
    retries: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let server_addr: SocketAddr = cli
        .server
        .parse()
        .map_err(|e| TftpError::InvalidConfig(format!("invalid server address: {}", e)))?;

    let mode = TransferMode::parse(&cli.mode)?;

    let client = TftpClient::new(server_addr, mode)
        .with_block_size(cli.block_size)
        .with_bigfile(cli.bigfile)
        .with_policy(RetryPolicy {
            timeout: Duration::from_secs(cli.timeout),
            max_retries: cli.retries,
        });

    if let Some(remote_file) = cli.get {
        let local_file = local_destination(&remote_file, cli.file);
        info!(
            "downloading {} from {} to {}",
            remote_file,
            server_addr,
            local_file.display()
        );
        let sink = File::create(&local_file).await?;
        let bytes = client.get(&remote_file, sink).await?;
        info!("download complete ({} bytes)", bytes);
    } else if let Some(local_file) = cli.put {
        let local_path = PathBuf::from(&local_file);
        let remote_file = remote_name(&local_file, cli.file);
        info!(
            "uploading {} to {} as {}",
            local_path.display(),
            server_addr,
            remote_file
        );
        let source = File::open(&local_path).await?;
        let bytes = client.put(source, &remote_file).await?;
        info!("upload complete ({} bytes)", bytes);
    } else {
        return Err(TftpError::InvalidConfig(
            "must specify either --get or --put".to_string(),
        ));
    }

    Ok(())
}

/// Where a downloaded file lands: `--file` if given, otherwise the
/// remote name.
fn local_destination(remote: &str, file: Option<PathBuf>) -> PathBuf {
    file.unwrap_or_else(|| PathBuf::from(remote))
}

/// What an uploaded file is called on the server: `--file` if given,
/// otherwise the local path.
fn remote_name(local: &str, file: Option<PathBuf>) -> String {
    file.and_then(|p| p.to_str().map(String::from))
        .unwrap_or_else(|| local.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_writes_to_the_file_argument() {
        assert_eq!(
            local_destination("remote.bin", Some(PathBuf::from("local.bin"))),
            PathBuf::from("local.bin")
        );
        assert_eq!(
            local_destination("remote.bin", None),
            PathBuf::from("remote.bin")
        );
    }

    #[test]
    fn put_reads_its_own_argument_and_stores_under_file() {
        assert_eq!(
            remote_name("local.bin", Some(PathBuf::from("remote.bin"))),
            "remote.bin"
        );
        assert_eq!(remote_name("local.bin", None), "local.bin");
    }

    #[test]
    fn get_and_put_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "squall-tftp-client",
            "--server",
            "127.0.0.1:69",
            "--get",
            "a",
            "--put",
            "b",
        ]);
        assert!(parsed.is_err());
    }
}
