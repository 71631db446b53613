use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::KeepaliveConfig;
use crate::error::TransportError;
use crate::transport::registry::TransportRegistry;
use crate::transport::{Transport, TransportCore, TransportImpl};
use crate::util::leftover::LeftoverBuffer;

const READ_BUF_SIZE: usize = 64 * 1024;

enum Endpoint {
    /// client side: connects on every open()
    Connect { host: String, port: u16 },
    /// server side: an accepted connection, consumed by the first open()
    Accepted(Mutex<Option<TcpStream>>),
}

/// A transport over a single TCP connection: either a client connecting to `host:port`, or a
///  connection accepted by a [crate::transport::tcp_server::TcpServerTransport].
///
/// The transport's name is the peer's address; sends with an explicit receiver list are only
///  executed if that name is in the list. A connection closed by the peer ends the run loop
///  without an error.
///
/// With a [KeepaliveConfig], the keepalive payload is sent whenever the connection was idle (no
///  send and no receive) for the configured interval.
pub struct TcpStreamTransport {
    core: TransportCore,
    endpoint: Endpoint,
    keepalive: Option<KeepaliveConfig>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    local_addr: Mutex<Option<SocketAddr>>,
    last_activity: Mutex<Instant>,
}

impl TcpStreamTransport {
    pub fn connect(host: &str, port: u16) -> TcpStreamTransport {
        Self::new(
            format!("{}:{}", host, port),
            Endpoint::Connect { host: host.to_string(), port },
        )
    }

    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> TcpStreamTransport {
        Self::new(
            peer_addr.to_string(),
            Endpoint::Accepted(Mutex::new(Some(stream))),
        )
    }

    fn new(name: String, endpoint: Endpoint) -> TcpStreamTransport {
        TcpStreamTransport {
            core: TransportCore::new(name),
            endpoint,
            keepalive: None,
            reader: Default::default(),
            writer: Default::default(),
            local_addr: Default::default(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> anyhow::Result<TcpStreamTransport> {
        keepalive.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        self.keepalive = Some(keepalive);
        Ok(self)
    }

    /// `tcp:<host>:<port>`
    pub fn from_expression(_registry: &TransportRegistry, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let (host, port) = parse_host_port(expression)?;
        Ok(Arc::new(TcpStreamTransport::connect(host, port)))
    }

    /// The local address of the current connection, if connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes when the keepalive is due, never if there is no keepalive
    async fn keepalive_due(&self) {
        match &self.keepalive {
            Some(keepalive) => tokio::time::sleep_until(self.last_activity() + keepalive.interval).await,
            None => std::future::pending().await,
        }
    }

    async fn send_keepalive(&self) -> anyhow::Result<()> {
        let Some(keepalive) = &self.keepalive else {
            return Ok(());
        };
        if self.last_activity().elapsed() < keepalive.interval {
            // there was activity while we were waiting
            return Ok(());
        }
        trace!("sending keepalive");
        self.write(&keepalive.payload).await
    }

    async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut()
            .ok_or_else(|| TransportError::NotRunning(self.core.name().to_string()))?;
        writer.write_all(data).await
            .with_context(|| format!("error sending to {}", self.core.name()))?;
        self.touch();
        Ok(())
    }

    async fn close(&self) {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down connection to {}: {}", self.core.name(), e);
            }
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Splits `<prefix>:<host>:<port>` at the last colon. The host may be empty.
pub(crate) fn parse_host_port(expression: &str) -> anyhow::Result<(&str, u16)> {
    let (_, params) = expression.split_once(':')
        .ok_or_else(|| TransportError::invalid_expression(expression, "missing ':'"))?;
    let (host, port) = params.rsplit_once(':')
        .ok_or_else(|| TransportError::invalid_expression(expression, "expected <host>:<port>"))?;
    let port = port.parse::<u16>()
        .map_err(|e| TransportError::invalid_expression(expression, format!("invalid port '{}': {}", port, e)))?;
    Ok((host, port))
}

#[async_trait]
impl TransportImpl for TcpStreamTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn open(&self) -> anyhow::Result<()> {
        let stream = match &self.endpoint {
            Endpoint::Connect { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await
                    .with_context(|| format!("error connecting to {}:{}", host, port))?;
                info!("connected to {}:{}", host, port);
                stream
            }
            Endpoint::Accepted(stream) => {
                let stream = stream.lock().unwrap_or_else(PoisonError::into_inner).take();
                stream.ok_or_else(|| anyhow!("accepted connection {} cannot be reopened", self.core.name()))?
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY on {}: {}", self.core.name(), e);
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = stream.local_addr().ok();

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.touch();
        Ok(())
    }

    async fn run(&self) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            warn!("run loop of {} started without a connection", self.core.name());
            return;
        };
        let sender = self.core.name().to_string();
        let mut leftovers: LeftoverBuffer = LeftoverBuffer::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                r = reader.read(&mut buf) => {
                    match r {
                        Ok(0) => {
                            info!("connection closed by {}", sender);
                            break;
                        }
                        Ok(n) => {
                            self.touch();
                            leftovers.feed(&sender, &buf[..n], |data| self.core.deliver(&sender, data));
                        }
                        Err(e) => {
                            warn!("error receiving from {}: {}", sender, e);
                            break;
                        }
                    }
                }
                _ = self.keepalive_due() => {
                    if let Err(e) = self.send_keepalive().await {
                        warn!("error sending keepalive: {:#}", e);
                        break;
                    }
                }
                _ = self.core.stop_requested() => break,
            }
        }

        if let Some(pending) = leftovers.discard(&sender) {
            debug!("discarding {} bytes of incomplete data from {}", pending.len(), sender);
        }
        self.core.closed(&sender);
        self.core.set_running(false);
        self.close().await;
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        if let Some(receivers) = receivers {
            if !receivers.iter().any(|r| r == self.core.name()) {
                return Ok(());
            }
        }
        self.core.ensure_running()?;
        trace!("sending to {}: {:?}", self.core.name(), data);
        self.write(data).await
    }
}
