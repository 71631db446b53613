use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::registry::TransportRegistry;
use crate::transport::{Transport, TransportCore, TransportImpl};

/// Maximum payload of a UDP datagram
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A transport that sends and receives UDP datagrams on a fixed port of all interfaces.
///
/// Every datagram must contain complete messages: there is no reassembly across datagrams, and
///  an undecodable tail is discarded. Sending without receivers broadcasts on the local network;
///  receivers are `ip:port` strings, exactly like the sender strings passed to the handler.
///
/// Unicast only goes to known peers: addresses a datagram was received from, and addresses added
///  with [UdpTransport::add_peer]. Other receivers are skipped, so that in a mux, a reply addressed
///  to a peer of another transport is not also sent as a datagram.
pub struct UdpTransport {
    core: TransportCore,
    port: u16,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peers: RwLock<FxHashSet<SocketAddr>>,
}

impl UdpTransport {
    pub fn new(port: u16) -> UdpTransport {
        UdpTransport {
            core: TransportCore::new(format!("udp:{}", port)),
            port,
            socket: Default::default(),
            peers: Default::default(),
        }
    }

    /// `udp:<port>`
    pub fn from_expression(_registry: &TransportRegistry, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let (_, port) = expression.split_once(':')
            .ok_or_else(|| TransportError::invalid_expression(expression, "missing ':'"))?;
        let port = port.parse::<u16>()
            .map_err(|e| TransportError::invalid_expression(expression, format!("invalid port '{}': {}", port, e)))?;
        Ok(Arc::new(UdpTransport::new(port)))
    }

    /// The bound address, if the socket is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket()
            .and_then(|s| s.local_addr().ok())
    }

    /// Makes `addr` a valid unicast receiver before anything was received from it
    pub fn add_peer(&self, addr: SocketAddr) {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
            .insert(addr);
    }

    pub fn is_peer(&self, addr: &SocketAddr) -> bool {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
            .contains(addr)
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TransportImpl for UdpTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    /// Binds the socket unless it is still bound from a previous start
    async fn open(&self) -> anyhow::Result<()> {
        if self.socket().is_some() {
            debug!("socket is already bound");
            return Ok(());
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await
            .with_context(|| format!("error binding UDP port {}", self.port))?;
        socket.set_broadcast(true)
            .context("error enabling broadcast")?;
        debug!("bound to {:?}", socket.local_addr());

        *self.socket.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        Ok(())
    }

    async fn run(&self) {
        let Some(socket) = self.socket() else {
            warn!("run loop of {} started without a socket", self.core.name());
            return;
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if !self.is_peer(&from) {
                                debug!("new peer {}", from);
                                self.add_peer(from);
                            }
                            let sender = from.to_string();
                            let leftover = self.core.deliver(&sender, &buf[..len]);
                            if !leftover.is_empty() {
                                debug!("discarding {} undecodable bytes of datagram from {}", leftover.len(), sender);
                            }
                        }
                        // e.g. ICMP port unreachable reported on the next receive
                        Err(e) => warn!("error receiving datagram: {}", e),
                    }
                }
                _ = self.core.stop_requested() => break,
            }
        }
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        self.core.ensure_running()?;
        let socket = self.socket()
            .ok_or_else(|| TransportError::NotRunning(self.core.name().to_string()))?;

        match receivers {
            None => {
                let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
                trace!("broadcasting {} bytes to {}", data.len(), broadcast);
                socket.send_to(data, broadcast).await
                    .with_context(|| format!("error broadcasting to {}", broadcast))?;
            }
            Some(receivers) => {
                for receiver in receivers {
                    let Ok(addr) = receiver.parse::<SocketAddr>() else {
                        trace!("skipping receiver {} - not an address", receiver);
                        continue;
                    };
                    if !self.is_peer(&addr) {
                        trace!("skipping receiver {} - not a known peer", receiver);
                        continue;
                    }
                    trace!("sending {} bytes to {}", data.len(), addr);
                    socket.send_to(data, addr).await
                        .with_context(|| format!("error sending to {}", addr))?;
                }
            }
        }
        Ok(())
    }
}
