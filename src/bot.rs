//! Bot assembly and lifecycle

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::metrics::BotMetrics;
use crate::sanitizer::Sanitizer;
use crate::session::{Reaper, SessionContext, SessionRegistry};
use crate::telegram::TelegramClient;
use crate::transport::{ChatTransport, RetryPolicy};

/// The running bot: dispatcher, reaper and the session registry they share
pub struct Bot {
    config: Config,
    transport: Arc<dyn ChatTransport>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<BotMetrics>,
    sanitizer: Sanitizer,
}

impl Bot {
    /// Build a bot that talks to the Telegram Bot API
    pub fn new(config: Config) -> Result<Self> {
        config.validate_for_run()?;
        let client =
            TelegramClient::new(&config.telegram).context("Failed to create Telegram client")?;
        Self::with_transport(config, Arc::new(client))
    }

    /// Build a bot on top of any transport
    pub fn with_transport(config: Config, transport: Arc<dyn ChatTransport>) -> Result<Self> {
        config.validate()?;
        let sanitizer = Sanitizer::from_config(&config)?;
        let metrics = Arc::new(BotMetrics::new());
        let ctx = SessionContext::from_config(&config, transport.clone(), metrics.clone());
        let registry = Arc::new(SessionRegistry::new(ctx));

        Ok(Self {
            config,
            transport,
            registry,
            metrics,
            sanitizer,
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<BotMetrics> {
        self.metrics.clone()
    }

    /// Run until Ctrl-C (or SIGTERM on unix), then shut down gracefully
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` completes, then stop polling and reaping and close
    /// every session.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Bot starting: interpreter `{}`, inactivity timeout {}s",
            self.config.interpreter.program, self.config.session.inactivity_timeout_secs
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reaper = Reaper::from_config(
            self.registry.clone(),
            self.metrics.clone(),
            &self.config.session,
        );
        let reaper_task = tokio::spawn(reaper.run(shutdown_rx.clone()));

        let dispatcher = Dispatcher::new(
            self.transport.clone(),
            self.registry.clone(),
            self.sanitizer,
            self.metrics.clone(),
            RetryPolicy::from_config(&self.config.telegram),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

        signal.await;
        info!("Initiating graceful shutdown");

        let _ = shutdown_tx.send(true);
        if let Err(e) = dispatcher_task.await {
            error!("Dispatcher task terminated with error: {}", e);
        }
        if let Err(e) = reaper_task.await {
            error!("Reaper task terminated with error: {}", e);
        }

        let closed = self.registry.close_all().await;
        info!("Closed {} sessions", closed);
        info!("{}", self.metrics.snapshot());
        info!("Shutdown completed");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
