use std::path::PathBuf;

use clap::Parser;
use file_upload_rpc::{common::UploadOptions, server::RpcServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Receive uploaded files into a storage directory.
#[derive(Parser, Debug)]
struct Args {
    /// Listening port.
    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Directory uploaded files are written to.
    #[arg(long, default_value = file_upload_rpc::common::DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting server on port: {}", args.port);

    let options = UploadOptions::default().with_storage_dir(args.storage_dir);
    let mut server = RpcServer::new(options);
    server.listen(&format!("0.0.0.0:{}", args.port)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;
    Ok(())
}
