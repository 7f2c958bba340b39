//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replbot::config::{Config, InterpreterConfig};
use replbot::metrics::BotMetrics;
use replbot::session::{SessionContext, SessionRegistry};
use replbot::transport::MockTransport;

/// Stand-in toplevel: answers one known phrase, exits on `#quit;;`, echoes
/// everything else.
const STUB_TOPLEVEL: &str = r##"while IFS= read -r line; do
  case "$line" in
    "let x = 2 + 2;;") printf '%s\n' "val x : int = 4" ;;
    "#quit;;") exit 0 ;;
    *) printf '%s\n' "$line" ;;
  esac
done"##;

pub fn stub_interpreter() -> InterpreterConfig {
    InterpreterConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), STUB_TOPLEVEL.to_string()],
        env: BTreeMap::new(),
        statement_terminator: ";;".to_string(),
    }
}

/// Configuration with short timings and the stub interpreter
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.interpreter = stub_interpreter();
    config.session.flush_interval_ms = 50;
    config.session.terminate_grace_ms = 500;
    config.session.close_wait_ms = 2000;
    config.session.inactivity_timeout_secs = 60;
    config.session.reap_interval_secs = 30;
    config.telegram.retry_initial_interval_ms = 5;
    config.telegram.retry_max_interval_ms = 20;
    config.telegram.send_max_elapsed_secs = 2;
    config
}

pub fn registry_for(
    config: &Config,
    transport: Arc<MockTransport>,
    metrics: Arc<BotMetrics>,
) -> Arc<SessionRegistry> {
    let ctx = SessionContext::from_config(config, transport, metrics);
    Arc::new(SessionRegistry::new(ctx))
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
