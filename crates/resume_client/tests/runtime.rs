mod support;

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use resume_client::{
    CommandOutcome, RestoreSource, RuntimeError, RuntimeOptions, UiCommand, UiEvent,
};
use support::{add_tab, default_layout, Fixture};
use sync_protocol_mock::SessionBehavior;
use workspace_model::{EntryKind, SessionId, SplitDirection, WorkspaceModel};
use workspace_store::{LoadOutcome, PersistenceManager};

fn options() -> RuntimeOptions {
    RuntimeOptions {
        persist_debounce: Duration::from_millis(300),
        resync_interval: Duration::from_secs(3600),
        buffer_ttl: Duration::from_secs(24 * 60 * 60),
    }
}

/// Reads buffers the way a freshly started process would.
fn stored_buffer(fixture: &Fixture, session: &str) -> Option<Vec<String>> {
    PersistenceManager::new(fixture.store.clone())
        .load_buffer(&SessionId::new(session))
        .map(|entries| entries.into_iter().map(|entry| entry.content).collect())
}

#[tokio::test(start_paused = true)]
async fn visible_output_is_rendered_and_persisted_after_the_debounce() {
    let mut fixture = Fixture::new();
    fixture.seed_workspace(&["S1"]);
    fixture.server.set_session("S1", SessionBehavior::Live);
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    fixture.sink.drain();
    let running = tokio::spawn(runtime.run());

    fixture
        .server
        .push_output(&SessionId::new("S1"), "hello\r\n", EntryKind::Output)
        .expect("push");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_matches!(
        fixture.sink.events().as_slice(),
        [UiEvent::Output { session_id, entry }]
            if session_id == &SessionId::new("S1") && entry.content == "hello\r\n"
    );
    assert_eq!(fixture.state.buffers().len(&SessionId::new("S1")), 1);
    assert_eq!(stored_buffer(&fixture, "S1"), None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        stored_buffer(&fixture, "S1"),
        Some(vec!["hello\r\n".to_string()])
    );

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test(start_paused = true)]
async fn output_for_hidden_sessions_is_buffered_without_rendering() {
    let mut fixture = Fixture::new();
    fixture.seed_workspace(&["S1"]);
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    fixture.sink.drain();
    let running = tokio::spawn(runtime.run());

    fixture
        .server
        .push_output(&SessionId::new("S9"), "background\r\n", EntryKind::Error)
        .expect("push");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(fixture.sink.events().is_empty());
    assert_eq!(fixture.state.buffers().len(&SessionId::new("S9")), 1);

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_changes() {
    let mut fixture = Fixture::new();
    fixture.seed_workspace(&["S1"]);
    fixture.server.set_session("S1", SessionBehavior::Live);
    let (mut runtime, handle) = fixture.runtime(RuntimeOptions {
        persist_debounce: Duration::from_secs(60),
        ..options()
    });
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    fixture
        .server
        .push_output(&SessionId::new("S1"), "last words\r\n", EntryKind::Output)
        .expect("push");
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");

    assert_eq!(
        stored_buffer(&fixture, "S1"),
        Some(vec!["last words\r\n".to_string()])
    );
    assert_matches!(
        handle.execute(UiCommand::Flush).await,
        Err(RuntimeError::Stopped)
    );
}

#[tokio::test]
async fn new_tabs_and_splits_get_sessions_and_closing_releases_them() {
    let mut fixture = Fixture::new();
    let (mut runtime, handle) = fixture.runtime(options());
    let report = runtime.restore().await;
    assert_matches!(report.source, RestoreSource::FreshDefault(_));
    let running = tokio::spawn(runtime.run());

    let (tab_id, first) = match handle
        .execute(UiCommand::CreateTab {
            title: "build".to_string(),
        })
        .await
    {
        Ok(CommandOutcome::Tab { tab_id, pane_id }) => (tab_id, pane_id),
        other => panic!("expected a new tab, got {other:?}"),
    };
    let second = match handle
        .execute(UiCommand::SplitPane {
            pane_id: first.clone(),
            direction: SplitDirection::Vertical,
        })
        .await
    {
        Ok(CommandOutcome::Pane(pane_id)) => pane_id,
        other => panic!("expected a new pane, got {other:?}"),
    };

    let first_session = fixture.binding(&first).expect("first pane bound");
    let second_session = fixture.binding(&second).expect("second pane bound");
    assert_ne!(first_session, second_session);
    assert_eq!(fixture.server.live_sessions().len(), 2);

    handle
        .execute(UiCommand::CloseTab { tab_id })
        .await
        .expect("close tab");
    assert!(fixture.server.live_sessions().is_empty());
    assert_eq!(fixture.server.call_count("session_close"), 2);

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn failed_session_create_leaves_the_new_pane_unbound() {
    let mut fixture = Fixture::new();
    fixture.server.fail_session_create(true);
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    let outcome = handle
        .execute(UiCommand::CreateTab {
            title: "shell".to_string(),
        })
        .await;
    let pane_id = match outcome {
        Ok(CommandOutcome::Tab { pane_id, .. }) => pane_id,
        other => panic!("expected a new tab, got {other:?}"),
    };
    assert_eq!(fixture.binding(&pane_id), None);

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn switching_workspaces_reconciles_once_then_replays() {
    let mut fixture = Fixture::new();
    let mut model = WorkspaceModel::with_default_workspace();
    let first = model.current_id().cloned().expect("default workspace");
    add_tab(&mut model, &first, &["S1"]);
    let second = model.create_workspace("ops", default_layout());
    add_tab(&mut model, &second, &["S2"]);
    fixture.persistence.save(&model).expect("seed");
    fixture.server.set_session("S1", SessionBehavior::Live);
    fixture.server.set_session("S2", SessionBehavior::Live);

    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    let switched = handle
        .execute(UiCommand::SwitchWorkspace {
            workspace_id: second.clone(),
        })
        .await
        .expect("switch");
    assert_matches!(
        switched,
        CommandOutcome::Switched(Some(report))
            if report.source == RestoreSource::Switch && report.reconnected() == 1
    );
    assert_eq!(fixture.state.model().current_id(), Some(&second));

    fixture.sink.drain();
    let back = handle
        .execute(UiCommand::SwitchWorkspace {
            workspace_id: first.clone(),
        })
        .await
        .expect("switch back");
    assert_eq!(back, CommandOutcome::Switched(None));
    assert_matches!(
        fixture.sink.events().as_slice(),
        [UiEvent::Replay { session_id, .. }] if session_id == &SessionId::new("S1")
    );
    assert_eq!(fixture.server.call_count("session_reconnect"), 2);

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn deleting_the_active_workspace_activates_another() {
    let mut fixture = Fixture::new();
    let (workspace_id, _) = fixture.seed_workspace(&["S1"]);
    fixture.server.set_session("S1", SessionBehavior::Live);
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    handle
        .execute(UiCommand::DeleteWorkspace {
            workspace_id: workspace_id.clone(),
        })
        .await
        .expect("delete");

    {
        let model = fixture.state.model();
        let active = model.active_workspace().expect("replacement workspace");
        assert_ne!(active.id, workspace_id);
        assert_eq!(active.name, workspace_model::Workspace::DEFAULT_NAME);
        assert_eq!(model.workspaces().len(), 1);
    }
    assert!(fixture.server.live_sessions().is_empty());

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test(start_paused = true)]
async fn resync_applies_writes_from_another_instance() {
    let mut fixture = Fixture::new();
    let (workspace_id, _) = fixture.seed_workspace(&["S1"]);
    fixture.server.set_session("S1", SessionBehavior::Live);
    let (mut runtime, handle) = fixture.runtime(RuntimeOptions {
        resync_interval: Duration::from_millis(100),
        ..options()
    });
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    let other = PersistenceManager::new(fixture.store.clone());
    let mut elsewhere = match other.load() {
        LoadOutcome::Loaded(snapshot) => snapshot.into_model(),
        LoadOutcome::NotFound(reason) => panic!("seeded state missing: {reason:?}"),
    };
    elsewhere
        .rename_workspace(&workspace_id, "renamed elsewhere")
        .expect("rename");
    other.save(&elsewhere).expect("foreign save");

    tokio::time::sleep(Duration::from_millis(150)).await;

    {
        let model = fixture.state.model();
        let workspace = model.workspace(&workspace_id).expect("workspace");
        assert_eq!(workspace.name, "renamed elsewhere");
        assert!(workspace.is_active);
        assert!(!model.has_pending_changes());
    }

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn workspace_commands_are_mirrored_to_the_server() {
    let mut fixture = Fixture::new();
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    let workspace_id = match handle
        .execute(UiCommand::CreateWorkspace {
            name: "remote".to_string(),
        })
        .await
    {
        Ok(CommandOutcome::Workspace(id)) => id,
        other => panic!("expected a workspace, got {other:?}"),
    };
    assert_eq!(fixture.server.call_count("workspace_create"), 1);
    assert_eq!(
        fixture.server.workspace(&workspace_id).map(|ws| ws.name),
        Some("remote".to_string())
    );
    {
        let model = fixture.state.model();
        let local = model.workspace(&workspace_id).expect("adopted locally");
        assert!(!local.is_active);
    }

    handle
        .execute(UiCommand::SwitchWorkspace {
            workspace_id: workspace_id.clone(),
        })
        .await
        .expect("switch");
    let pane_id = match handle
        .execute(UiCommand::CreateTab {
            title: "build".to_string(),
        })
        .await
    {
        Ok(CommandOutcome::Tab { pane_id, .. }) => pane_id,
        other => panic!("expected a new tab, got {other:?}"),
    };
    let remote = fixture.server.workspace(&workspace_id).expect("server copy");
    assert_eq!(remote.tabs.len(), 1);
    assert_eq!(remote.tabs[0].panes[0].session_id, fixture.binding(&pane_id));

    handle
        .execute(UiCommand::RenameWorkspace {
            workspace_id: workspace_id.clone(),
            name: "renamed".to_string(),
        })
        .await
        .expect("rename");
    assert_eq!(
        fixture.server.workspace(&workspace_id).map(|ws| ws.name),
        Some("renamed".to_string())
    );
    assert_eq!(fixture.server.call_count("workspace_update"), 2);

    handle
        .execute(UiCommand::DeleteWorkspace {
            workspace_id: workspace_id.clone(),
        })
        .await
        .expect("delete");
    assert_eq!(fixture.server.call_count("workspace_delete"), 1);
    assert_eq!(fixture.server.workspace(&workspace_id), None);
    assert!(fixture.state.model().workspace(&workspace_id).is_none());

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn pulling_adopts_workspaces_created_elsewhere() {
    let mut fixture = Fixture::new();
    let remote = workspace_model::Workspace::new("elsewhere", default_layout());
    let remote_id = remote.id.clone();
    fixture.server.insert_workspace(remote);
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let running = tokio::spawn(runtime.run());

    let pulled = handle
        .execute(UiCommand::PullWorkspaces)
        .await
        .expect("pull");
    assert_eq!(pulled, CommandOutcome::Pulled(vec![remote_id.clone()]));
    {
        let model = fixture.state.model();
        let adopted = model.workspace(&remote_id).expect("adopted");
        assert_eq!(adopted.name, "elsewhere");
        assert!(!adopted.is_active);
        assert_ne!(model.current_id(), Some(&remote_id));
    }

    let again = handle
        .execute(UiCommand::PullWorkspaces)
        .await
        .expect("second pull");
    assert_eq!(again, CommandOutcome::Pulled(Vec::new()));
    assert_eq!(fixture.server.call_count("workspace_get"), 1);

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}

#[tokio::test]
async fn server_rejections_do_not_undo_local_workspace_changes() {
    let mut fixture = Fixture::new();
    let (mut runtime, handle) = fixture.runtime(options());
    runtime.restore().await;
    let workspace_id = fixture.state.model().current_id().cloned().expect("default");
    let running = tokio::spawn(runtime.run());

    handle
        .execute(UiCommand::RenameWorkspace {
            workspace_id: workspace_id.clone(),
            name: "local only".to_string(),
        })
        .await
        .expect("rename succeeds locally");

    assert_eq!(fixture.server.call_count("workspace_update"), 1);
    assert_eq!(fixture.server.workspace(&workspace_id), None);
    assert_eq!(
        fixture.state.model().workspace(&workspace_id).map(|ws| ws.name.clone()),
        Some("local only".to_string())
    );

    handle.shutdown().await.expect("shutdown");
    running.await.expect("runtime task");
}
