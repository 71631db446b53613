use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::RestartConfig;
use crate::error::TransportError;
use crate::transport::registry::TransportRegistry;
use crate::transport::tcp::TcpStreamTransport;
use crate::transport::{ReceiveHandler, Transport, TransportCore, TransportImpl};
use crate::util::promise::{Promise, PromiseError};

const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// A transport that wraps another transport and keeps restarting it, e.g. to reconnect a TCP
///  client whenever the connection was lost or could not be established.
///
/// Restarting is attempted as long as the wrapper is running. A failed attempt is not retried
///  immediately: a new attempt is made `check_interval` after the previous one was started.
///
/// Received data is delivered by the child directly to the handler registered on the wrapper.
pub struct RestartingTransport {
    core: TransportCore,
    child: Arc<dyn Transport>,
    config: RestartConfig,
    initial_attempt: tokio::sync::Mutex<Option<Promise<()>>>,
}

impl RestartingTransport {
    pub fn new(child: Arc<dyn Transport>, config: RestartConfig, name: &str) -> anyhow::Result<RestartingTransport> {
        config.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        Ok(RestartingTransport {
            core: TransportCore::new(name),
            child,
            config,
            initial_attempt: Default::default(),
        })
    }

    /// The most common use: a TCP client that reconnects, named like the client
    pub fn tcp_client(host: &str, port: u16, check_interval: Duration) -> anyhow::Result<RestartingTransport> {
        let client = TcpStreamTransport::connect(host, port);
        let name = client.core().name().to_string();
        RestartingTransport::new(Arc::new(client), RestartConfig::with_check_interval(check_interval), &name)
    }

    /// `restart:<interval>:<expr>`, interval in seconds (10 if empty), `<expr>` is any transport
    ///  expression
    pub fn from_expression(registry: &TransportRegistry, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let (_, params) = expression.split_once(':')
            .ok_or_else(|| TransportError::invalid_expression(expression, "missing ':'"))?;
        let (interval, child_expression) = params.split_once(':')
            .ok_or_else(|| TransportError::invalid_expression(expression, "expected restart:<interval>:<transport>"))?;

        let interval = if interval.is_empty() {
            DEFAULT_CHECK_INTERVAL_SECS
        }
        else {
            interval.parse::<u64>()
                .map_err(|e| TransportError::invalid_expression(expression, format!("invalid interval '{}': {}", interval, e)))?
        };

        let child = registry.create(child_expression)?;
        let transport = RestartingTransport::new(child, RestartConfig::with_check_interval(Duration::from_secs(interval)), expression)?;
        Ok(Arc::new(transport))
    }

    pub fn child(&self) -> &Arc<dyn Transport> {
        &self.child
    }

    /// True if the child transport is currently running
    pub fn child_running(&self) -> bool {
        self.child.is_running()
    }

    pub fn config(&self) -> &RestartConfig {
        &self.config
    }
}

#[async_trait]
impl TransportImpl for RestartingTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    /// Kicks off the first start of the child without waiting for it: a child that cannot be
    ///  opened yet is no reason for the wrapper to fail.
    async fn open(&self) -> anyhow::Result<()> {
        *self.initial_attempt.lock().await = Some(self.child.clone().start());
        Ok(())
    }

    async fn run(&self) {
        let poll_interval = self.config.poll_interval;
        let mut pending = self.initial_attempt.lock().await.take();
        let mut countdown = self.config.check_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.core.stop_requested() => break,
            }

            if let Some(attempt) = &pending {
                match attempt.result(poll_interval).await {
                    Ok(()) => {
                        debug!("{} is up", self.child.name());
                        pending = None;
                    }
                    Err(PromiseError::Timeout) => {}
                    Err(e) => {
                        info!("start of {} failed, retrying in {:?}: {}", self.child.name(), self.config.check_interval, e);
                        pending = None;
                    }
                }
            }

            if pending.is_none() && !self.child.is_running() {
                countdown = countdown.saturating_sub(poll_interval);
                if countdown.is_zero() {
                    info!("trying to restart {}", self.child.name());
                    pending = Some(self.child.clone().start());
                    countdown = self.config.check_interval;
                }
            }
        }

        self.child.stop(true).await;
    }

    /// Forwarded unconditionally: the child rejects sends while it is not running
    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        self.child.send(data, receivers).await
    }

    fn install_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.child.set_on_received(handler);
    }
}
