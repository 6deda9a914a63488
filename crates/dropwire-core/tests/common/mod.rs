//! Common test utilities for `Dropwire` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dropwire_core::channel::{Channel, EventReceiver};
use dropwire_core::session::{ConnectionStatus, SessionOptions, TransferSession};
use dropwire_core::transfer::{TransferStatus, TransferView};
use dropwire_core::TransferId;

/// How long a test waits for a transfer before giving up.
pub const WAIT: Duration = Duration::from_secs(10);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Hand a channel to a fresh session, run its event loop and wait until it
/// is connected.
pub async fn start_session(
    channel: Arc<dyn Channel>,
    events: EventReceiver,
    options: SessionOptions,
) -> TransferSession {
    let session = TransferSession::new(options);
    session.open(channel).await;

    tokio::spawn({
        let session = session.clone();
        async move { session.run(events).await }
    });

    let mut status = session.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Connected))
        .await
        .expect("timed out waiting for connection")
        .expect("status channel closed");

    session
}

/// Wait until a transfer reaches a status.
pub async fn wait_for_status(
    session: &TransferSession,
    id: &TransferId,
    status: TransferStatus,
) -> TransferView {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(view) = session.get(id).await {
                if view.status == status {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {id} to become {status}"))
}

/// Wait until the session has seen `count` transfers.
pub async fn wait_for_transfers(session: &TransferSession, count: usize) -> Vec<TransferView> {
    tokio::time::timeout(WAIT, async {
        loop {
            let files = session.files().await;
            if files.len() >= count {
                return files;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for transfers")
}
