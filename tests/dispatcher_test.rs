use std::path::Path;
use std::sync::Arc;
use thor::config::{ClientConfig, ServerConfig, normalize_address};
use thor::services::dispatcher::{RunOutcome, UploadDispatcher};
use thor::services::storage::StagingStore;
use thor::services::transfer::{HttpTransfer, Transfer, TransferError, UploadTask};
use thor::services::upload_service::UploadService;
use thor::{AppState, create_app};

/// Starts a server on a loopback port and returns its address.
async fn spawn_server(save_dir: &Path, file_ext: &str, file_size: u64) -> String {
    let config = ServerConfig {
        port: 8080,
        save_dir: save_dir.to_path_buf(),
        file_ext: file_ext.to_string(),
        file_size,
        file_unit: 1,
    };
    let policy = config.policy().unwrap();
    let service = Arc::new(UploadService::new(StagingStore::new(save_dir), policy));
    let app = create_app(AppState::new(service));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn local_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(dir.path().join("b.jpg"), b"jpeg bytes").unwrap();
    std::fs::create_dir(dir.path().join("c")).unwrap();
    std::fs::write(dir.path().join("c").join("d.txt"), b"delta").unwrap();
    dir
}

#[tokio::test]
async fn test_upload_directory_end_to_end() {
    let local = local_tree();
    let remote = tempfile::tempdir().unwrap();
    let address = normalize_address(&spawn_server(remote.path(), "*", 1 << 20).await).unwrap();

    let config = ClientConfig::default();
    let transfer = Arc::new(HttpTransfer::new(&config).unwrap());
    let outcome = UploadDispatcher::new(transfer, &config)
        .run(local.path(), &address)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome {
            attempted: 3,
            succeeded: 3,
            failed: 0
        }
    );
    assert_eq!(std::fs::read(remote.path().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(remote.path().join("d.txt")).unwrap(), b"delta");
}

#[tokio::test]
async fn test_rejections_are_counted_not_fatal() {
    let local = local_tree();
    let remote = tempfile::tempdir().unwrap();
    let address = normalize_address(&spawn_server(remote.path(), ".txt", 1 << 20).await).unwrap();

    let config = ClientConfig {
        concurrency: 1,
        ..Default::default()
    };
    let transfer = Arc::new(HttpTransfer::new(&config).unwrap());
    let outcome = UploadDispatcher::new(transfer, &config)
        .run(local.path(), &address)
        .await
        .unwrap();

    assert_eq!(outcome.attempted, 3);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert!(!remote.path().join("b.jpg").exists());
}

#[tokio::test]
async fn test_preserve_tree() {
    let local = local_tree();
    let remote = tempfile::tempdir().unwrap();
    let address = normalize_address(&spawn_server(remote.path(), "*", 1 << 20).await).unwrap();

    let config = ClientConfig {
        preserve_tree: true,
        ..Default::default()
    };
    let transfer = Arc::new(HttpTransfer::new(&config).unwrap());
    let outcome = UploadDispatcher::new(transfer, &config)
        .run(local.path(), &address)
        .await
        .unwrap();

    assert!(outcome.is_clean());
    assert_eq!(
        std::fs::read(remote.path().join("c").join("d.txt")).unwrap(),
        b"delta"
    );
}

#[tokio::test]
async fn test_split_upload_is_merged() {
    let local = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..100u8).collect();
    std::fs::write(local.path().join("big.bin"), &content).unwrap();
    let remote = tempfile::tempdir().unwrap();
    // Whole file is over the limit, each chunk is not
    let address = normalize_address(&spawn_server(remote.path(), "*", 40).await).unwrap();

    let config = ClientConfig {
        split_size: Some(32),
        ..Default::default()
    };
    let transfer = HttpTransfer::new(&config).unwrap();
    let task = UploadTask {
        local_path: local.path().join("big.bin"),
        address,
        remote_dir: None,
    };
    let receipt = transfer.send(&task).await.unwrap();

    assert_eq!(receipt.requests, 4);
    assert_eq!(receipt.bytes, 100);
    assert_eq!(std::fs::read(remote.path().join("big.bin")).unwrap(), content);
}

#[tokio::test]
async fn test_oversized_file_reports_server_code() {
    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("big.bin"), [0u8; 64]).unwrap();
    let remote = tempfile::tempdir().unwrap();
    let address = normalize_address(&spawn_server(remote.path(), "*", 16).await).unwrap();

    let transfer = HttpTransfer::new(&ClientConfig::default()).unwrap();
    let task = UploadTask {
        local_path: local.path().join("big.bin"),
        address,
        remote_dir: None,
    };
    let err = transfer.send(&task).await.unwrap_err();
    assert!(matches!(err, TransferError::Rejected { code: 10003, .. }));
}

#[tokio::test]
async fn test_unreachable_server_fails_each_file() {
    let local = local_tree();
    // Bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    let address = normalize_address(&addr).unwrap();

    let config = ClientConfig::default();
    let transfer = Arc::new(HttpTransfer::new(&config).unwrap());
    let outcome = UploadDispatcher::new(transfer, &config)
        .run(local.path(), &address)
        .await
        .unwrap();

    assert_eq!(outcome.attempted, 3);
    assert_eq!(outcome.failed, 3);
}
