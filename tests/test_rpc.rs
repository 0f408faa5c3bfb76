use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use file_upload_rpc::{
    client::RpcClient, common::UploadOptions, error::RpcError, server::RpcServer,
};
use tempfile::TempDir;
use tokio::{io::AsyncWriteExt, net::TcpStream};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Check if the port is in use
async fn is_port_in_use(addr: &str) -> bool {
    if let Ok(stream) = TcpStream::connect(addr).await {
        // Port is in use
        drop(stream);
        true
    } else {
        // Port is not in use
        false
    }
}

fn stored_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.map(|entry| entry.unwrap().path()).collect())
        .unwrap_or_default()
}

async fn start_server(options: UploadOptions) -> (RpcServer, String) {
    let mut server = RpcServer::new(options);
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    (server, addr.to_string())
}

#[tokio::test]
async fn test_rpc_server_start_stop() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (mut server, addr) =
        start_server(UploadOptions::default().with_storage_dir(dir.path().join("store"))).await;

    assert!(is_port_in_use(&addr).await);
    assert!(dir.path().join("store").is_dir());
    server.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!is_port_in_use(&addr).await);
}

#[tokio::test]
async fn test_rpc_upload_round_trip() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = UploadOptions::default()
        .with_storage_dir(dir.path().join("store"))
        .with_chunk_size(4096);
    let (mut server, addr) = start_server(options.clone()).await;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let source = dir.path().join("image.png");
    std::fs::write(&source, &data).unwrap();

    let client = RpcClient::connect(&addr, options.clone()).await.unwrap();
    let receipt = client.upload_file(&source).await.unwrap();

    assert_eq!(receipt.total_size, data.len() as u64);
    let stored = options.storage_dir.join(format!("{}.png", receipt.id));
    assert_eq!(std::fs::read(stored).unwrap(), data);

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_empty_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = UploadOptions::default().with_storage_dir(dir.path().join("store"));
    let (mut server, addr) = start_server(options.clone()).await;

    let source = dir.path().join("empty");
    std::fs::write(&source, b"").unwrap();

    let client = RpcClient::connect(&addr, options.clone()).await.unwrap();
    let receipt = client.upload_file(&source).await.unwrap();

    assert_eq!(receipt.total_size, 0);
    let stored = options.storage_dir.join(&receipt.id);
    assert_eq!(std::fs::metadata(stored).unwrap().len(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_concurrent_uploads() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let options = UploadOptions::default()
        .with_storage_dir(dir.path().join("store"))
        .with_chunk_size(1024);
    let (mut server, addr) = start_server(options.clone()).await;

    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.bin");
    std::fs::write(&first, vec![b'1'; 50_000]).unwrap();
    std::fs::write(&second, vec![b'2'; 80_000]).unwrap();

    let client_a = RpcClient::connect(&addr, options.clone()).await.unwrap();
    let client_b = RpcClient::connect(&addr, options.clone()).await.unwrap();
    let (a, b) = tokio::join!(client_a.upload_file(&first), client_b.upload_file(&second));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.id, b.id);
    assert_eq!(a.total_size, 50_000);
    assert_eq!(b.total_size, 80_000);
    let a_data = std::fs::read(options.storage_dir.join(format!("{}.txt", a.id))).unwrap();
    let b_data = std::fs::read(options.storage_dir.join(format!("{}.bin", b.id))).unwrap();
    assert_eq!(a_data, vec![b'1'; 50_000]);
    assert_eq!(b_data, vec![b'2'; 80_000]);

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_server_rejects_oversized_upload() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let server_options = UploadOptions::default()
        .with_storage_dir(&store)
        .with_max_file_size(10_000);
    let (mut server, addr) = start_server(server_options).await;

    let source = dir.path().join("big.dat");
    std::fs::write(&source, vec![0u8; 10_001]).unwrap();

    let client_options = UploadOptions::default().with_chunk_size(1000);
    let client = RpcClient::connect(&addr, client_options).await.unwrap();
    let result = client.upload_file(&source).await;

    assert!(matches!(result, Err(RpcError::SizeLimitExceeded(_))));
    let files = stored_files(&store);
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 10_000);

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_client_rejects_oversized_file_before_sending() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let (mut server, addr) =
        start_server(UploadOptions::default().with_storage_dir(&store)).await;

    let source = dir.path().join("big.dat");
    std::fs::write(&source, vec![0u8; 101]).unwrap();

    let client = RpcClient::connect(&addr, UploadOptions::default().with_max_file_size(100))
        .await
        .unwrap();
    let result = client.upload_file(&source).await;

    assert!(matches!(result, Err(RpcError::SizeLimitExceeded(_))));
    assert!(stored_files(&store).is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_client_deadline_leaves_partial_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let (mut server, addr) =
        start_server(UploadOptions::default().with_storage_dir(&store)).await;

    let options = UploadOptions::default().with_upload_deadline(Duration::from_millis(500));
    let client = RpcClient::connect(&addr, options).await.unwrap();

    // 100 bytes are available, then the source stalls.
    let (mut source, reader) = tokio::io::duplex(1024);
    source.write_all(&[5; 100]).await.unwrap();
    let result = client.upload_reader(reader, 1000, ".part").await;
    assert!(matches!(result, Err(RpcError::DeadlineExceeded)));

    // The receiver gives up on its own; what it wrote stays.
    let mut stored_len = 0;
    for _ in 0..40 {
        if let Some(path) = stored_files(&store).pop() {
            stored_len = std::fs::metadata(path).unwrap().len();
            if stored_len == 100 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stored_len, 100);
    assert_eq!(stored_files(&store).len(), 1);

    drop(source);
    server.stop().await;
}

#[tokio::test]
async fn test_rpc_connect_failure() {
    init_tracing();
    let options = UploadOptions::default();
    let result = RpcClient::connect("127.0.0.1:1", options).await;
    assert!(matches!(result, Err(RpcError::Transport(_))));
}
