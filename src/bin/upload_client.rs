use std::path::PathBuf;

use clap::Parser;
use file_upload_rpc::{client::RpcClient, common::UploadOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Upload one file to an upload server.
#[derive(Parser, Debug)]
struct Args {
    /// File to transfer.
    #[arg(long, default_value = "sourcestore/file.txt")]
    filename: PathBuf,

    /// The server address.
    #[arg(long, default_value = "0.0.0.0:8888")]
    address: String,

    /// Bytes per chunk message.
    #[arg(long, default_value_t = file_upload_rpc::common::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Connecting to server {}", args.address);

    let options = UploadOptions::default().with_chunk_size(args.chunk_size);
    let client = match RpcClient::connect(&args.address, options).await {
        Ok(client) => client,
        Err(err) => {
            error!("Failed to connect to server: {}", err);
            std::process::exit(1);
        }
    };

    match client.upload_file(&args.filename).await {
        Ok(receipt) => info!("Uploaded {} as {}", args.filename.display(), receipt.id),
        Err(err) => {
            error!("Failed to upload {}: {}", args.filename.display(), err);
            std::process::exit(1);
        }
    }
}
