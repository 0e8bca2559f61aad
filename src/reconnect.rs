use std::cmp::min;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info, warn};
use crate::byte_sink::Connection;
use crate::config::ReconnectConfig;

/// Re-establishes a link's connection after it was lost
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconnector: Send + Sync + 'static {
    async fn attempt_reconnect(&self) -> anyhow::Result<Connection>;
}

/// Is told about the outcome of reconnecting after the send path lost its connection. Both
///  callbacks are invoked without holding any send path lock.
#[cfg_attr(test, automock)]
pub trait ReconnectListener: Send + Sync {
    /// The connection was found to be lost, and reconnecting starts
    fn on_reconnecting(&self);
    fn on_reconnected(&self, connection: Connection);
    fn on_reconnect_failed(&self);
}

/// The delay between reconnect attempts, growing by a configured factor up to a limit
pub struct ReconnectBackoff {
    attempt: u32,
    delay: Duration,

    config_max_attempts: u32,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &ReconnectConfig) -> ReconnectBackoff {
        assert!(config.backoff_factor_eighths >= 8);

        ReconnectBackoff {
            attempt: 0,
            delay: config.initial_delay,
            config_max_attempts: config.max_attempts,
            config_max_delay: config.max_delay,
            config_factor_eighths: config.backoff_factor_eighths,
        }
    }

    /// Returns the delay to wait before the next attempt, or `None` if attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config_max_attempts {
            return None;
        }

        let result = if self.attempt == 0 { Duration::ZERO } else { self.delay };
        if self.attempt > 0 {
            self.delay = min(self.delay * self.config_factor_eighths / 8, self.config_max_delay);
        }
        self.attempt += 1;
        Some(result)
    }
}

/// Tries to reconnect until an attempt succeeds or the configured number of attempts is
///  exhausted. The first attempt is made immediately.
pub async fn reconnect_with_backoff(reconnector: &dyn Reconnector, config: &ReconnectConfig) -> Option<Connection> {
    let mut backoff = ReconnectBackoff::new(config);
    let mut attempt = 0;
    while let Some(delay) = backoff.next_delay() {
        attempt += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        debug!("reconnect attempt #{}", attempt);
        match reconnector.attempt_reconnect().await {
            Ok(connection) => {
                info!("reconnected after {} attempt(s)", attempt);
                return Some(connection);
            }
            Err(e) => {
                debug!("reconnect attempt #{} failed: {}", attempt, e);
            }
        }
    }

    warn!("giving up reconnecting after {} attempts", attempt);
    None
}
