use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{KeepaliveConfig, DEFAULT_START_TIMEOUT};
use crate::error::TransportError;
use crate::transport::mux::MuxTransport;
use crate::transport::registry::TransportRegistry;
use crate::transport::tcp::{parse_host_port, TcpStreamTransport};
use crate::transport::{start_blocking, ReceiveHandler, Transport, TransportCore, TransportImpl};

/// Listens on a TCP port and handles every accepted connection as a [TcpStreamTransport],
///  muxed into a single transport.
///
/// The sender of received data is the connection's peer address, and sending to that address
///  as receiver answers on that connection. Sending without receivers goes to all connections.
pub struct TcpServerTransport {
    core: TransportCore,
    interface: String,
    port: u16,
    keepalive: Option<KeepaliveConfig>,
    connections: Arc<MuxTransport>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServerTransport {
    /// `interface` is the address to bind to, an empty string binds all interfaces
    pub fn new(interface: &str, port: u16) -> TcpServerTransport {
        let interface = if interface.is_empty() { "0.0.0.0" } else { interface };
        let name = format!("tcpserv:{}:{}", interface, port);
        TcpServerTransport {
            connections: Arc::new(MuxTransport::with_name(&format!("{} connections", name))),
            core: TransportCore::new(name),
            interface: interface.to_string(),
            port,
            keepalive: None,
            listener: Default::default(),
            local_addr: Default::default(),
        }
    }

    /// Keepalive for every accepted connection
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> anyhow::Result<TcpServerTransport> {
        keepalive.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        self.keepalive = Some(keepalive);
        Ok(self)
    }

    /// `tcpserv:<interface>:<port>`
    pub fn from_expression(_registry: &TransportRegistry, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let (interface, port) = parse_host_port(expression)?;
        Ok(Arc::new(TcpServerTransport::new(interface, port)))
    }

    /// The address the listener is bound to while running. Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Peer addresses of the currently open connections
    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.transports().iter()
            .filter(|t| t.is_running())
            .map(|t| t.name().to_string())
            .collect()
    }

    async fn on_accepted(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        let pruned = self.connections.remove_stopped().await;
        if pruned > 0 {
            debug!("pruned {} closed connection(s)", pruned);
        }

        let connection = TcpStreamTransport::accepted(stream, peer_addr);
        let connection = match &self.keepalive {
            Some(keepalive) => connection.with_keepalive(keepalive.clone())?,
            None => connection,
        };
        self.connections.add_transport(Arc::new(connection), true).await
    }
}

#[async_trait]
impl TransportImpl for TcpServerTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn open(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.interface.as_str(), self.port)).await
            .with_context(|| format!("error binding {}:{}", self.interface, self.port))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        start_blocking(&self.connections, DEFAULT_START_TIMEOUT).await?;

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn run(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            warn!("run loop of {} started without a listener", self.core.name());
            return;
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            info!("accepted connection from {}", peer_addr);
                            if let Err(e) = self.on_accepted(stream, peer_addr).await {
                                warn!("error setting up connection from {}: {:#}", peer_addr, e);
                            }
                        }
                        Err(e) => warn!("error accepting connection: {}", e),
                    }
                }
                _ = self.core.stop_requested() => break,
            }
        }

        drop(listener);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.connections.stop(true).await;
        info!("stopped listening on {}:{}", self.interface, self.port);
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        self.core.ensure_running()?;
        self.connections.remove_stopped().await;
        self.connections.send(data, receivers).await
    }

    fn install_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.connections.set_on_received(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::line_collecting_handler;

    async fn running_server() -> (Arc<TcpServerTransport>, u16) {
        let server = Arc::new(TcpServerTransport::new("127.0.0.1", 0));
        start_blocking(&server, Duration::from_secs(5)).await.unwrap();
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    #[test]
    fn test_empty_interface_binds_all() {
        let server = TcpServerTransport::new("", 8888);
        assert_eq!(server.name(), "tcpserv:0.0.0.0:8888");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (server, port) = running_server().await;
        let (server_handler, mut server_rx) = line_collecting_handler();
        server.set_on_received(Some(server_handler));

        let client = Arc::new(TcpStreamTransport::connect("127.0.0.1", port));
        let (client_handler, mut client_rx) = line_collecting_handler();
        client.set_on_received(Some(client_handler));
        start_blocking(&client, Duration::from_secs(5)).await.unwrap();

        client.send(b"ping/1 x:1\n", None).await.unwrap();
        let (sender, data) = tokio::time::timeout(Duration::from_secs(5), server_rx.recv()).await.unwrap().unwrap();
        assert_eq!(sender, client.local_addr().unwrap().to_string());
        assert_eq!(data, b"ping/1 x:1\n".to_vec());

        server.send(b"[1]:2\n", Some(&[sender])).await.unwrap();
        let (sender, data) = tokio::time::timeout(Duration::from_secs(5), client_rx.recv()).await.unwrap().unwrap();
        assert_eq!(sender, format!("127.0.0.1:{}", port));
        assert_eq!(data, b"[1]:2\n".to_vec());

        client.stop(true).await;
        server.stop(true).await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_all_connections() {
        let (server, port) = running_server().await;
        server.set_on_received(Some(line_collecting_handler().0));

        let mut clients = Vec::new();
        for _ in 0..2 {
            let client = Arc::new(TcpStreamTransport::connect("127.0.0.1", port));
            let (handler, rx) = line_collecting_handler();
            client.set_on_received(Some(handler));
            start_blocking(&client, Duration::from_secs(5)).await.unwrap();
            clients.push((client, rx));
        }

        // wait for the server to have registered both connections
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connected_peers().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        server.send(b"hello\n", None).await.unwrap();
        for (client, rx) in &mut clients {
            let (_, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(data, b"hello\n".to_vec());
            client.stop(true).await;
        }

        server.stop(true).await;
    }

    #[tokio::test]
    async fn test_closed_connections_are_pruned() {
        let (server, port) = running_server().await;
        server.set_on_received(Some(line_collecting_handler().0));

        let client = Arc::new(TcpStreamTransport::connect("127.0.0.1", port));
        start_blocking(&client, Duration::from_secs(5)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connected_peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        client.stop(true).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.connected_peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        // sending with no open connections is not an error
        server.send(b"anyone?\n", None).await.unwrap();
        assert!(server.connections.transports().is_empty());

        server.stop(true).await;
    }

    #[tokio::test]
    async fn test_bind_error() {
        let (server, port) = running_server().await;

        let second = Arc::new(TcpServerTransport::new("127.0.0.1", port));
        let err = start_blocking(&second, Duration::from_secs(5)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("error binding"));

        server.stop(true).await;
    }
}
