//! Session lifecycle tests: registry, reaper and re-creation against a stub
//! interpreter

mod common;

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replbot::metrics::BotMetrics;
use replbot::session::{ChatId, Reaper, SessionError, SessionState};
use replbot::transport::MockTransport;
use tokio::sync::watch;

use common::{eventually, registry_for, test_config};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_idle_session_is_reaped_and_recreated() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let metrics = Arc::new(BotMetrics::new());
    let registry = registry_for(&test_config(), transport.clone(), metrics.clone());
    let chat = ChatId(1);

    let (first, created) = registry.get_or_create(chat).await?;
    assert!(created);
    first.send("let x = 2 + 2;;").await?;
    let output = transport
        .wait_for(chat, WAIT, |text| text.contains("val x : int = 4"))
        .await;
    assert_eq!(output.trim_end(), "val x : int = 4");

    let reaper = Reaper::new(
        registry.clone(),
        metrics.clone(),
        Duration::from_secs(60),
        Duration::from_secs(30),
    );

    // Fresh activity keeps the session alive
    assert!(reaper.sweep().await.is_empty());
    assert_eq!(registry.len(), 1);

    let reaped = reaper
        .sweep_at(Instant::now() + Duration::from_secs(61))
        .await;
    assert_eq!(reaped, vec![chat]);
    assert_eq!(first.state(), SessionState::Closed);
    assert!(!first.is_process_alive());
    assert!(registry.is_empty());

    let (second, created) = registry.get_or_create(chat).await?;
    assert!(created);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.pid(), second.pid());
    assert!(second.buffer().is_empty());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.sessions_started, 2);
    assert_eq!(snapshot.sessions_reaped, 1);

    registry.close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_reaper_task_reaps_on_tick_and_stops() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let metrics = Arc::new(BotMetrics::new());
    let registry = registry_for(&test_config(), transport, metrics.clone());

    let (session, _) = registry.get_or_create(ChatId(8)).await?;
    let reaper = Reaper::new(
        registry.clone(),
        metrics.clone(),
        Duration::from_millis(300),
        Duration::from_millis(50),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(reaper.run(shutdown_rx));

    assert!(eventually(WAIT, || registry.is_empty()).await);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.is_process_alive());
    assert_eq!(metrics.snapshot().sessions_reaped, 1);

    shutdown_tx.send(true)?;
    tokio::time::timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test]
async fn test_output_order_is_preserved() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let registry = registry_for(&test_config(), transport.clone(), Arc::new(BotMetrics::new()));
    let chat = ChatId(2);

    let (session, _) = registry.get_or_create(chat).await?;
    let mut expected = String::new();
    for i in 0..50 {
        let line = format!("print {i};;");
        session.send(&line).await?;
        expected.push_str(&line);
        expected.push('\n');
    }

    let output = transport
        .wait_for(chat, WAIT, |text| text.contains("print 49;;"))
        .await;
    assert_eq!(output, expected);

    registry.close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_reaper_reclaims_exited_interpreter() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let metrics = Arc::new(BotMetrics::new());
    let registry = registry_for(&test_config(), transport, metrics.clone());
    let chat = ChatId(3);

    let (session, _) = registry.get_or_create(chat).await?;
    session.send("#quit;;").await?;
    assert!(eventually(WAIT, || !session.is_process_alive()).await);

    let reaper = Reaper::new(
        registry.clone(),
        metrics.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(60),
    );
    assert_eq!(reaper.sweep().await, vec![chat]);
    assert!(registry.is_empty());
    assert_eq!(metrics.snapshot().sessions_reaped, 1);
    Ok(())
}

#[tokio::test]
async fn test_close_delivers_pending_output() -> Result<()> {
    let mut config = test_config();
    // Only the final flush at close may deliver anything
    config.session.flush_interval_ms = 3_600_000;
    let transport = Arc::new(MockTransport::new());
    let registry = registry_for(&config, transport.clone(), Arc::new(BotMetrics::new()));
    let chat = ChatId(4);

    let (session, _) = registry.get_or_create(chat).await?;
    session.send("let x = 2 + 2;;").await?;
    assert!(eventually(WAIT, || !session.buffer().is_empty()).await);
    assert!(transport.sent_to(chat).is_empty());

    assert!(registry.close(chat).await);
    assert_eq!(transport.sent_to(chat), vec!["val x : int = 4\n"]);
    assert!(registry.get(chat).is_none());

    // A second close finds nothing to do
    assert!(!registry.close(chat).await);
    Ok(())
}

#[tokio::test]
async fn test_send_after_close_is_rejected() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let registry = registry_for(&test_config(), transport, Arc::new(BotMetrics::new()));

    let (session, _) = registry.get_or_create(ChatId(5)).await?;
    assert!(session.close().await);
    assert!(!session.close().await);

    let err = session.send("1 + 1;;").await.unwrap_err();
    assert!(matches!(err, SessionError::Closing(ChatId(5))));
    assert!(err.is_session_unusable());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_yields_one_session() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let metrics = Arc::new(BotMetrics::new());
    let registry = registry_for(&test_config(), transport, metrics.clone());
    let chat = ChatId(6);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(chat).await })
        })
        .collect();

    let mut sessions = Vec::new();
    let mut created = 0;
    for handle in handles {
        let (session, was_created) = handle.await??;
        if was_created {
            created += 1;
        }
        sessions.push(session);
    }

    assert_eq!(created, 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(registry.len(), 1);
    assert_eq!(metrics.snapshot().sessions_started, 1);

    registry.close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_isolated_per_chat() -> Result<()> {
    let transport = Arc::new(MockTransport::new());
    let registry = registry_for(&test_config(), transport.clone(), Arc::new(BotMetrics::new()));

    let (a, _) = registry.get_or_create(ChatId(10)).await?;
    let (b, _) = registry.get_or_create(ChatId(11)).await?;
    assert_ne!(a.pid(), b.pid());

    a.send("alpha;;").await?;
    b.send("beta;;").await?;

    let out_a = transport.wait_for(ChatId(10), WAIT, |t| !t.is_empty()).await;
    let out_b = transport.wait_for(ChatId(11), WAIT, |t| !t.is_empty()).await;
    assert_eq!(out_a, "alpha;;\n");
    assert_eq!(out_b, "beta;;\n");

    assert_eq!(registry.close_all().await, 2);
    assert!(registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_registers_nothing() {
    let mut config = test_config();
    config.interpreter.program = "/nonexistent/replbot-interpreter".to_string();
    let registry = registry_for(&config, Arc::new(MockTransport::new()), Arc::new(BotMetrics::new()));

    let result = registry.get_or_create(ChatId(12)).await;
    assert!(matches!(result, Err(SessionError::Spawn { .. })));
    assert!(registry.is_empty());
}
