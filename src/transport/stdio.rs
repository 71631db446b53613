use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::transport::registry::TransportRegistry;
use crate::transport::{Transport, TransportCore, TransportImpl};
use crate::util::leftover::LeftoverBuffer;

/// Name of the transport, and the sender / receiver name of the process's other side
pub const STDIO_NAME: &str = "stdio";

/// A transport reading from the process's stdin and writing to its stdout, e.g. for a process
///  that is driven through a pipe.
///
/// End of input ends the run loop like a connection closed by the peer.
pub struct StdioTransport {
    core: TransportCore,
    stdout: tokio::sync::Mutex<tokio::io::Stdout>,
}

impl StdioTransport {
    pub fn new() -> StdioTransport {
        StdioTransport {
            core: TransportCore::new(STDIO_NAME),
            stdout: tokio::sync::Mutex::new(tokio::io::stdout()),
        }
    }

    /// `stdio:`, any parameters are ignored
    pub fn from_expression(_registry: &TransportRegistry, _expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        Ok(Arc::new(StdioTransport::new()))
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportImpl for StdioTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn run(&self) {
        let mut stdin = tokio::io::stdin();
        let mut leftovers: LeftoverBuffer = LeftoverBuffer::new();
        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                r = stdin.read(&mut buf) => {
                    match r {
                        Ok(0) => {
                            info!("end of input");
                            break;
                        }
                        Ok(n) => leftovers.feed(STDIO_NAME, &buf[..n], |data| self.core.deliver(STDIO_NAME, data)),
                        Err(e) => {
                            warn!("error reading stdin: {}", e);
                            break;
                        }
                    }
                }
                _ = self.core.stop_requested() => break,
            }
        }

        if let Some(pending) = leftovers.discard(STDIO_NAME) {
            debug!("discarding {} bytes of incomplete input", pending.len());
        }
        self.core.closed(STDIO_NAME);
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        if let Some(receivers) = receivers {
            if !receivers.iter().any(|r| r == STDIO_NAME) {
                return Ok(());
            }
        }
        self.core.ensure_running()?;

        let mut stdout = self.stdout.lock().await;
        stdout.write_all(data).await
            .context("error writing to stdout")?;
        stdout.flush().await
            .context("error flushing stdout")?;
        Ok(())
    }
}
