//! Transfer loop shared by `host` and `join`.
//!
//! Once a channel is up both commands behave the same: send the files given
//! on the command line, save whatever the peer sends, and keep going until
//! the peer leaves (or Ctrl-C).

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, oneshot};

use dropwire_core::channel::{Channel, EventReceiver};
use dropwire_core::config::Config;
use dropwire_core::file::{format_size, OutgoingFile};
use dropwire_core::session::{ConnectionStatus, SessionOptions, TransferSession};
use dropwire_core::transfer::{TransferDirection, TransferStatus, TransferUpdate};
use dropwire_core::TransferId;

use super::TransferArgs;
use crate::ui;

/// How progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human readable lines
    Pretty,
    /// Errors only
    Quiet,
    /// One JSON object per line
    Json,
}

impl OutputMode {
    fn from_args(args: &TransferArgs) -> Self {
        if args.json {
            Self::Json
        } else if args.quiet {
            Self::Quiet
        } else {
            Self::Pretty
        }
    }
}

/// Everything a transfer run needs besides the channel.
#[derive(Debug)]
pub struct TransferPlan {
    files: Vec<OutgoingFile>,
    output_dir: PathBuf,
    overwrite: bool,
    exit_when_done: bool,
    mode: OutputMode,
}

impl TransferPlan {
    /// Resolve command line arguments against the configuration.
    ///
    /// Fails before any connection is made if a file is missing.
    pub fn new(args: &TransferArgs, config: &Config) -> Result<Self> {
        let files = args
            .files
            .iter()
            .map(|path| {
                OutgoingFile::from_path(path)
                    .with_context(|| format!("Cannot send '{}'", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let output_dir = args
            .output
            .clone()
            .or_else(|| config.output.directory.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            files,
            output_dir,
            overwrite: args.overwrite || config.output.overwrite,
            exit_when_done: args.exit_when_done,
            mode: OutputMode::from_args(args),
        })
    }

    /// Files queued for sending.
    pub fn files(&self) -> &[OutgoingFile] {
        &self.files
    }

    /// Output mode.
    pub const fn mode(&self) -> OutputMode {
        self.mode
    }
}

/// Drive a session over an established channel until it ends.
pub async fn run(
    channel: Arc<dyn Channel>,
    events: EventReceiver,
    plan: TransferPlan,
    config: &Config,
) -> Result<()> {
    let session = TransferSession::new(SessionOptions::from(config));
    session.open(channel).await;

    let mut event_loop = tokio::spawn({
        let session = session.clone();
        async move { session.run(events).await }
    });

    let mut status = session.watch_status();
    let connected = status
        .wait_for(|s| *s != ConnectionStatus::Connecting)
        .await
        .map(|s| *s == ConnectionStatus::Connected)
        .unwrap_or(false);
    if !connected {
        let reason = session
            .last_error()
            .await
            .unwrap_or_else(|| "channel closed".to_string());
        bail!("Connection failed: {reason}");
    }

    let peers = session.peers().await;
    emit(plan.mode, || format!("  Connected to {}", peers.join(", ")), || {
        serde_json::json!({ "event": "connected", "peers": peers })
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    let reporter = tokio::spawn(report(
        session.clone(),
        session.subscribe(),
        stop_rx,
        plan.output_dir.clone(),
        plan.overwrite,
        plan.mode,
    ));

    let mut handles = Vec::with_capacity(plan.files.len());
    for file in &plan.files {
        match session.send(file).await {
            Ok(handle) => handles.push((file.name.clone(), handle)),
            Err(e) => {
                eprintln!("  Could not send {}: {}", file.name, e);
                break;
            }
        }
    }

    let mut failures = plan.files.len() - handles.len();
    for (name, handle) in handles {
        if let Err(e) = handle.finished().await {
            tracing::debug!("Sending {} failed: {}", name, e);
            failures += 1;
        }
    }

    if plan.exit_when_done {
        wait_until_idle(&session).await;
        session.close().await;
    }

    tokio::select! {
        _ = &mut event_loop => {}
        _ = tokio::signal::ctrl_c() => {
            emit(plan.mode, || "\n  Closing...".to_string(), || serde_json::json!({ "event": "interrupted" }));
            session.close().await;
            let _ = event_loop.await;
        }
    }

    let _ = stop_tx.send(());
    let saved = reporter.await.unwrap_or_default();

    if session.connection_status() == ConnectionStatus::Failed {
        if let Some(reason) = session.last_error().await {
            eprintln!("  Connection failed: {reason}");
        }
    }

    emit(
        plan.mode,
        || format!("  Disconnected. {} file(s) received.", saved),
        || serde_json::json!({ "event": "disconnected", "received": saved }),
    );

    session.close().await;

    if failures > 0 {
        bail!("{failures} transfer(s) failed");
    }
    Ok(())
}

/// Wait until no inbound transfer is in progress.
async fn wait_until_idle(session: &TransferSession) {
    loop {
        if session.connection_status() != ConnectionStatus::Connected {
            return;
        }

        let busy = session.files().await.iter().any(|f| {
            f.direction == TransferDirection::Inbound && !f.status.is_terminal()
        });
        if !busy {
            return;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Print updates and save completed inbound files until told to stop.
///
/// Returns the number of files saved.
async fn report(
    session: TransferSession,
    mut updates: broadcast::Receiver<TransferUpdate>,
    mut stop: oneshot::Receiver<()>,
    output_dir: PathBuf,
    overwrite: bool,
    mode: OutputMode,
) -> usize {
    let mut saved = 0;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    show(&session, &update, mode).await;
                    if update.direction == TransferDirection::Inbound
                        && update.status == TransferStatus::Complete
                        && save(&session, &update.id, &output_dir, overwrite, mode).await
                    {
                        saved += 1;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} progress updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }

    while let Ok(update) = updates.try_recv() {
        show(&session, &update, mode).await;
    }

    for view in session.files().await {
        if view.direction == TransferDirection::Inbound
            && view.status == TransferStatus::Complete
            && save(&session, &view.id, &output_dir, overwrite, mode).await
        {
            saved += 1;
        }
    }

    saved
}

async fn show(session: &TransferSession, update: &TransferUpdate, mode: OutputMode) {
    match mode {
        OutputMode::Quiet => {}
        OutputMode::Json => {
            if let Ok(line) = serde_json::to_string(update) {
                println!("{line}");
            }
        }
        OutputMode::Pretty => {
            let Some(view) = session.get(&update.id).await else {
                return;
            };
            let line = ui::transfer_line(&view);
            if view.status.is_terminal() {
                println!("\r  {line}    ");
            } else {
                print!("\r  {line}");
                let _ = io::stdout().flush();
            }
        }
    }
}

/// Write a completed inbound file to disk and release it from the session.
async fn save(
    session: &TransferSession,
    id: &TransferId,
    output_dir: &std::path::Path,
    overwrite: bool,
    mode: OutputMode,
) -> bool {
    let Some(file) = session.received_file(id).await else {
        return false;
    };

    match file.save_to(output_dir, overwrite).await {
        Ok(path) => {
            emit(
                mode,
                || {
                    format!(
                        "  Saved {} ({}, sha256 {})",
                        path.display(),
                        format_size(file.len() as u64),
                        file.sha256_hex()
                    )
                },
                || {
                    serde_json::json!({
                        "event": "saved",
                        "id": id,
                        "path": path,
                        "size": file.len(),
                        "sha256": file.sha256_hex(),
                    })
                },
            );
            let _ = session.dismiss(id).await;
            true
        }
        Err(e) => {
            eprintln!("  Could not save {}: {}", file.metadata().name, e);
            false
        }
    }
}

fn emit<P, J>(mode: OutputMode, pretty: P, json: J)
where
    P: FnOnce() -> String,
    J: FnOnce() -> serde_json::Value,
{
    match mode {
        OutputMode::Pretty => println!("{}", pretty()),
        OutputMode::Json => println!("{}", json()),
        OutputMode::Quiet => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropwire_core::channel::memory_pair;

    fn args(files: Vec<PathBuf>) -> TransferArgs {
        TransferArgs {
            files,
            output: None,
            overwrite: false,
            exit_when_done: true,
            quiet: true,
            json: false,
        }
    }

    #[test]
    fn test_plan_rejects_missing_files() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let missing = temp_dir.path().join("nope.txt");

        let result = TransferPlan::new(&args(vec![missing]), &Config::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_output_dir_precedence() {
        let mut config = Config::default();
        config.output.directory = Some(PathBuf::from("/from/config"));

        let plan = TransferPlan::new(&args(Vec::new()), &config).expect("plan");
        assert_eq!(plan.output_dir, PathBuf::from("/from/config"));
        assert_eq!(plan.mode(), OutputMode::Quiet);

        let mut explicit = args(Vec::new());
        explicit.output = Some(PathBuf::from("/explicit"));
        explicit.json = true;
        let plan = TransferPlan::new(&explicit, &config).expect("plan");
        assert_eq!(plan.output_dir, PathBuf::from("/explicit"));
        assert_eq!(plan.mode(), OutputMode::Json);
    }

    #[tokio::test]
    async fn test_run_moves_files_between_peers() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let source = temp_dir.path().join("hello.txt");
        std::fs::write(&source, b"hello over the wire").expect("write");

        let host_out = temp_dir.path().join("host");
        let config = Config::default();

        let mut host_args = args(Vec::new());
        host_args.output = Some(host_out.clone());
        host_args.exit_when_done = false;
        let host_plan = TransferPlan::new(&host_args, &config).expect("host plan");
        let join_plan = TransferPlan::new(&args(vec![source]), &config).expect("join plan");

        let ((left, left_rx), (right, right_rx)) = memory_pair();
        let host = tokio::spawn({
            let config = config.clone();
            async move { run(left, left_rx, host_plan, &config).await }
        });

        run(right, right_rx, join_plan, &config).await.expect("join run");
        host.await.expect("join host").expect("host run");

        let saved = std::fs::read(host_out.join("hello.txt")).expect("saved file");
        assert_eq!(saved, b"hello over the wire");
    }
}
