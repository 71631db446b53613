use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::config::DEFAULT_START_TIMEOUT;
use crate::error::TransportError;
use crate::transport::registry::TransportRegistry;
use crate::transport::{start_blocking, ReceiveHandler, Transport, TransportCore, TransportImpl};
use crate::util::leftover::LeftoverBuffer;
use crate::util::paren::paren_partition;

/// A chunk of data received by one of the muxed transports, queued for the mux's worker task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InData {
    pub sender: String,
    pub data: Bytes,
}

/// Identifies a child for the lifetime of its membership in a mux. A transport that is removed and
///  added again gets a new id.
type ChildId = u64;

enum QueueItem {
    Data { child: ChildId, in_data: InData },
    /// the stream from `sender` via `child` ended
    Closed { child: ChildId, sender: String },
    /// `child` was removed from the mux
    Detached(ChildId),
}

struct Child {
    id: ChildId,
    transport: Arc<dyn Transport>,
}

/// A transport that muxes several transports.
///
/// Adding a transport redirects its received data into the mux's queue, so the mux's receive
///  handler is called from a single task regardless of the number of children. If the mux is
///  already running, an added transport is started right away.
///
/// Starting the mux starts all children (all or nothing), stopping it stops all children.
///  Sending is forwarded to every child, and each child decides by its own name whether it is
///  addressed.
pub struct MuxTransport {
    core: TransportCore,
    children: RwLock<Vec<Child>>,
    next_child_id: AtomicU64,
    in_queue_tx: mpsc::UnboundedSender<QueueItem>,
    in_queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>,
    start_timeout: Duration,
}

impl MuxTransport {
    pub fn new() -> MuxTransport {
        Self::with_name("mux")
    }

    pub fn with_name(name: &str) -> MuxTransport {
        let (in_queue_tx, in_queue_rx) = mpsc::unbounded_channel();
        MuxTransport {
            core: TransportCore::new(name),
            children: Default::default(),
            next_child_id: AtomicU64::new(0),
            in_queue_tx,
            in_queue_rx: tokio::sync::Mutex::new(in_queue_rx),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Time to wait for each child's `open()` when starting
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> MuxTransport {
        self.start_timeout = start_timeout;
        self
    }

    /// `mux:(<expr1>)(<expr2>)...` where each `<expr>` is again a transport expression
    pub fn from_expression(registry: &TransportRegistry, expression: &str) -> anyhow::Result<Arc<dyn Transport>> {
        let (_, mut params) = expression.split_once(':')
            .ok_or_else(|| TransportError::invalid_expression(expression, "missing ':'"))?;

        let mux = MuxTransport::new();
        {
            let mut children = mux.children.write().unwrap_or_else(PoisonError::into_inner);
            while !params.is_empty() {
                let (inner, rest) = paren_partition(params)
                    .map_err(|e| TransportError::invalid_expression(expression, e.to_string()))?;
                let child = registry.create(inner)?;
                children.push(mux.attach(child));
                params = rest;
            }
        }
        Ok(Arc::new(mux))
    }

    /// Redirects the transport's received data into this mux's queue
    fn attach(&self, transport: Arc<dyn Transport>) -> Child {
        let id = self.next_child_id.fetch_add(1, Ordering::Relaxed);
        transport.set_on_received(Some(Arc::new(MuxQueueHandler {
            in_queue_tx: self.in_queue_tx.clone(),
            child: id,
        })));
        Child { id, transport }
    }

    /// Adds a child, redirecting its received data to this mux. If the mux is running and
    ///  `start` is set, the child is started (and this waits for it to be opened).
    pub async fn add_transport(&self, transport: Arc<dyn Transport>, start: bool) -> anyhow::Result<()> {
        let child = self.attach(transport.clone());
        self.children.write().unwrap_or_else(PoisonError::into_inner)
            .push(child);

        if start && self.core.is_running() {
            start_blocking(&transport, self.start_timeout).await?;
        }
        Ok(())
    }

    /// Removes a child and detaches it from this mux, stopping it if `stop` is set. Returns
    ///  `false` if the transport was not a child of this mux.
    pub async fn remove_transport(&self, transport: &Arc<dyn Transport>, stop: bool) -> bool {
        let removed = {
            let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
            children.iter()
                .position(|c| Arc::ptr_eq(&c.transport, transport))
                .map(|idx| children.remove(idx))
        };
        let Some(removed) = removed else {
            return false;
        };

        transport.set_on_received(None);
        // queued behind the child's remaining data, so its partial frames are dropped after that
        let _ = self.in_queue_tx.send(QueueItem::Detached(removed.id));
        if stop {
            transport.stop(true).await;
        }
        true
    }

    /// Removes all children whose run loop has ended, e.g. connections closed by the peer
    pub async fn remove_stopped(&self) -> usize {
        let stopped: Vec<_> = self.transports().into_iter()
            .filter(|t| !t.is_running())
            .collect();

        for t in &stopped {
            debug!("removing stopped transport {}", t.name());
            self.remove_transport(t, true).await;
        }
        stopped.len()
    }

    /// A snapshot of the current children
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.transport.clone())
            .collect()
    }

    async fn stop_all(transports: &[Arc<dyn Transport>]) {
        for t in transports {
            t.stop(true).await;
        }
    }
}

impl Default for MuxTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive handler installed on children: queues the data for the mux's worker task. The mux
///  keeps per-sender leftovers itself because the leftover is only known after the mux's own
///  handler processed the data, so this always reports everything as consumed.
struct MuxQueueHandler {
    in_queue_tx: mpsc::UnboundedSender<QueueItem>,
    child: ChildId,
}

impl ReceiveHandler for MuxQueueHandler {
    fn on_received(&self, sender: &str, data: &[u8]) -> Vec<u8> {
        let item = QueueItem::Data {
            child: self.child,
            in_data: InData {
                sender: sender.to_string(),
                data: Bytes::copy_from_slice(data),
            },
        };
        if self.in_queue_tx.send(item).is_err() {
            warn!("mux was dropped - discarding {} bytes from {}", data.len(), sender);
        }
        Vec::new()
    }

    fn on_closed(&self, sender: &str) {
        let _ = self.in_queue_tx.send(QueueItem::Closed {
            child: self.child,
            sender: sender.to_string(),
        });
    }
}

#[async_trait]
impl TransportImpl for MuxTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    /// Starts all children in parallel and waits for all of them. If any of them fails, all
    ///  children are stopped again, and the failures are reported together as
    ///  [TransportError::StartFailed].
    async fn open(&self) -> anyhow::Result<()> {
        let children = self.transports();
        let promises: Vec<_> = children.iter()
            .map(|t| t.clone().start())
            .collect();

        let mut failures = Vec::new();
        for (child, promise) in children.iter().zip(promises) {
            if let Err(e) = promise.result(self.start_timeout).await {
                warn!("transport {} failed to start: {}", child.name(), e);
                failures.push(e.into_cause());
            }
        }

        if !failures.is_empty() {
            error!("{} of {} transports failed to start - stopping all of them", failures.len(), children.len());
            Self::stop_all(&children).await;
            return Err(TransportError::StartFailed(failures).into());
        }

        debug!("started {} transports", children.len());
        Ok(())
    }

    async fn run(&self) {
        let mut in_queue = self.in_queue_rx.lock().await;
        let mut leftovers = LeftoverBuffer::<(ChildId, String)>::new();

        loop {
            tokio::select! {
                item = in_queue.recv() => {
                    match item {
                        Some(QueueItem::Data { child, in_data }) => {
                            trace!("mux received {:?}", in_data);
                            let key = (child, in_data.sender.clone());
                            leftovers.feed(&key, &in_data.data, |data| self.core.deliver(&in_data.sender, data));
                        }
                        Some(QueueItem::Closed { child, sender }) => {
                            let key = (child, sender);
                            if let Some(pending) = leftovers.discard(&key) {
                                debug!("discarding {} bytes of incomplete data from {}", pending.len(), key.1);
                            }
                            self.core.closed(&key.1);
                        }
                        Some(QueueItem::Detached(child)) => {
                            let dropped = leftovers.discard_matching(|key| key.0 == child);
                            if dropped > 0 {
                                debug!("discarding {} bytes of incomplete data from a removed transport", dropped);
                            }
                        }
                        None => break,
                    }
                }
                _ = self.core.stop_requested() => break,
            }
        }

        Self::stop_all(&self.transports()).await;
        debug!("mux has finished");
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        self.core.ensure_running()?;

        let mut first_error = None;
        for child in self.transports() {
            if let Err(e) = child.send(data, receivers).await {
                warn!("sending via {} failed: {:#}", child.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
