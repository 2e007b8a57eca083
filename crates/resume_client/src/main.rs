use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use resume_client::transports::connect_for_id;
use resume_client::{
    ClientRuntime, ClientState, CommandOutcome, RecordingSink, RuntimeOptions, UiCommand, UiEvent,
};
use sync_protocol::ClientConfig;
use termsync::{logging, SyncConfig};
use time::OffsetDateTime;
use workspace_model::{EntryKind, SplitDirection};
use workspace_store::{FileStore, PersistenceManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SyncConfig::from_env();
    logging::init(&config).context("failed to initialize logging")?;

    let store = FileStore::open(config.storage_dir.clone())
        .with_context(|| format!("failed to open storage at {}", config.storage_dir.display()))?
        .with_quota(config.storage_quota_bytes);
    let persistence = Arc::new(PersistenceManager::new(Arc::new(store)));
    let connection = connect_for_id(
        &config.transport,
        ClientConfig {
            request_timeout: config.reconnect_timeout,
        },
    )
    .map_err(anyhow::Error::msg)?;

    let sink = RecordingSink::new();
    let state = ClientState::default();
    let (mut runtime, handle) = ClientRuntime::new(
        state.clone(),
        persistence,
        connection.client,
        connection.pushes,
        Arc::new(sink.clone()),
        RuntimeOptions::from(&config),
    );

    let report = runtime.restore().await;
    println!("{}", report.summary());
    print_events(&sink.drain());
    let running = tokio::spawn(runtime.run());

    let has_tabs = state
        .model()
        .active_workspace()
        .is_some_and(|workspace| !workspace.tabs.is_empty());
    if !has_tabs {
        let outcome = handle
            .execute(UiCommand::CreateTab {
                title: "shell".to_string(),
            })
            .await?;
        if let CommandOutcome::Tab { pane_id, .. } = outcome {
            handle
                .execute(UiCommand::SplitPane {
                    pane_id,
                    direction: SplitDirection::Horizontal,
                })
                .await?;
        }
    }

    let sessions = state
        .model()
        .active_workspace()
        .map(|workspace| workspace.bound_sessions())
        .unwrap_or_default();
    if let Some(server) = &connection.server {
        let started = OffsetDateTime::now_utc();
        for session_id in &sessions {
            server.push_output(
                session_id,
                format!("$ echo resumed\r\nresumed at {started}\r\n"),
                EntryKind::Output,
            )?;
        }
    }

    // Let the runtime pick up the pushes before persisting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.execute(UiCommand::Flush).await?;
    handle.shutdown().await?;
    running.await.context("client runtime panicked")?;

    print_events(&sink.drain());
    println!(
        "state saved to {}; run again to resume {} session(s)",
        config.storage_dir.display(),
        sessions.len()
    );
    Ok(())
}

fn print_events(events: &[UiEvent]) {
    for event in events {
        match event {
            UiEvent::Replay {
                pane_id,
                session_id,
                entries,
            } => {
                println!("-- replay {session_id} in {pane_id} ({} entries)", entries.len());
                for entry in entries {
                    print!("{}", entry.content);
                }
            }
            UiEvent::Output { session_id, entry } => {
                print!("[{session_id}] {}", entry.content);
            }
            UiEvent::Banner(banner) => println!("!! {}", banner.message()),
        }
    }
}
