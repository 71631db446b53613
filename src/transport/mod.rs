//! A transport abstracts a two-way byte stream: it can be started and stopped, and it sends and
//!  receives byte sequences to and from one or more named peers.
//!
//! ## Lifecycle
//!
//! [Transport::start] spawns a worker task which first calls [TransportImpl::open] (bind, connect,
//!  ...) and then [TransportImpl::run], the receive loop. The promise returned by `start` reports
//!  the outcome of `open`, so connection errors surface to whoever started the transport.
//!  [start_blocking] is the convenience for waiting on that promise.
//!
//! [Transport::stop] clears the running flag. Run loops `select!` on
//!  [TransportCore::stop_requested] alongside their socket reads, so they return promptly. A
//!  blocking stop waits for the worker task to finish, except when it is called from within that
//!  worker task (e.g. from a receive handler) where waiting would deadlock.
//!
//! A worker opens only after the previous worker of the same transport has finished, so a
//!  restart right after a non-blocking stop never overlaps with the old connection being closed.
//!  Concurrent calls to `start` share one worker and one promise. The running flag is cleared
//!  whenever a worker ends, including by a panic.
//!
//! ## Receiving
//!
//! Run loops pass received bytes to [TransportCore::received], which dispatches to the registered
//!  [ReceiveHandler]. The handler returns the undecodable tail of the data, which the run loop
//!  prepends to the next chunk from the same sender (see [crate::util::leftover::LeftoverBuffer]).
//!  When a stream ends, the run loop calls [TransportCore::closed] so the handler can drop
//!  partial frames of that sender. A panicking handler is caught, and the data is dropped.
//!
//! ## Composition
//!
//! * [mux::MuxTransport] presents several children as one transport, serializing their incoming
//!   data onto its own worker task
//! * [restarting::RestartingTransport] keeps a single child alive, restarting it periodically
//! * [registry::TransportRegistry] creates transports from string expressions like
//!   `mux:(tcp:localhost:8888)(udp:8889)`

pub mod mux;
pub mod registry;
pub mod restarting;
pub mod stdio;
pub mod tcp;
pub mod tcp_server;
pub mod udp;

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::error::TransportError;
use crate::util::promise::{promise, Promise};

/// Callback for received data.
///
/// `sender` identifies the origin (e.g. `"127.0.0.1:51234"`), `data` is the received bytes with
///  any leftover from the previous call already prepended. The returned bytes are the tail that
///  could not be decoded yet; they are prepended to the next data from the same sender.
///
/// A transport never calls its handler concurrently with itself.
#[cfg_attr(test, automock)]
pub trait ReceiveHandler: Send + Sync + 'static {
    fn on_received(&self, sender: &str, data: &[u8]) -> Vec<u8>;

    /// Called when the stream from `sender` ended. Partial frames buffered for it will never be
    ///  completed.
    fn on_closed(&self, _sender: &str) {}
}

impl<F> ReceiveHandler for F
where F: Fn(&str, &[u8]) -> Vec<u8> + Send + Sync + 'static
{
    fn on_received(&self, sender: &str, data: &[u8]) -> Vec<u8> {
        self(sender, data)
    }
}

/// The interface callers (and composing transports) use. It is implemented for every
///  [TransportImpl].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifies this transport as a receiver, e.g. `"localhost:8888"` for a TCP client. Sends
    ///  with an explicit receiver list are only executed by transports whose name is in the list.
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    fn set_on_received(&self, handler: Option<Arc<dyn ReceiveHandler>>);

    /// Opens and runs the transport on a new task. The returned promise completes once `open()`
    ///  finished, with its error if it failed.
    fn start(self: Arc<Self>) -> Promise<()>;

    async fn stop(&self, block: bool);

    /// Sends `data` to the given receivers, or to all connected peers if `receivers` is `None`.
    ///  Sending on a transport that is not running fails with [TransportError::NotRunning].
    async fn send(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()>;
}

/// Starts a transport and waits up to `timeout` for it to be opened.
///
/// On timeout, the worker task may still be opening: the caller should stop the transport
///  eventually to reclaim it.
pub async fn start_blocking<T: Transport + ?Sized>(transport: &Arc<T>, timeout: Duration) -> anyhow::Result<()> {
    transport.clone()
        .start()
        .result(timeout)
        .await?;
    Ok(())
}

/// What a concrete transport implements. The start / stop machinery on top of it is shared.
#[async_trait]
pub trait TransportImpl: Send + Sync + 'static {
    fn core(&self) -> &TransportCore;

    /// Sets up the channel. Called on the worker task; when this returns `Ok`, the transport
    ///  must be ready for sending and receiving.
    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The receive loop. It must return when [TransportCore::stop_requested] fires, or when the
    ///  channel was closed by the peer. Errors processing a single chunk must not end the loop.
    async fn run(&self);

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()>;

    /// Registers the receive handler. Transports that delegate receiving to an inner transport
    ///  override this.
    fn install_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.core().set_handler(handler);
    }
}

#[async_trait]
impl<T: TransportImpl> Transport for T {
    fn name(&self) -> &str {
        self.core().name()
    }

    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    fn set_on_received(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.install_handler(handler);
    }

    fn start(self: Arc<Self>) -> Promise<()> {
        let core = self.core();
        let mut slot = core.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = core.stop_generation.load(Ordering::Acquire);

        if let Some(worker) = slot.as_ref() {
            let live = worker.generation == generation
                && !worker.handle.is_finished()
                && (core.is_running() || !worker.opened.is_done());
            if live {
                debug!("transport {} is already started - not starting it again", core.name());
                return worker.opened.clone();
            }
        }

        let (setter, opened) = promise();
        let span = info_span!("transport", name = core.name());
        let transport = self.clone();

        let handle = tokio::spawn(async move {
            let core = transport.core();
            // the worker of a previous start may still be winding down
            let _worker = core.worker_lock.lock().await;
            let _running = ClearRunningOnExit(core);

            {
                let _transition = core.transition_lock.lock().await;
                if core.stop_generation.load(Ordering::Acquire) != generation {
                    debug!("stopped before it was opened");
                    let _ = setter.set_error(anyhow!("transport {} was stopped while starting", core.name()));
                    return;
                }
                debug!("opening");
                if let Err(e) = transport.open().await {
                    debug!("open failed: {:#}", e);
                    let _ = setter.set_error(e);
                    return;
                }
                core.set_running(true);
                let _ = setter.set_result(());
            }

            debug!("running");
            transport.run().await;
            debug!("finished");
        }.instrument(span));

        *slot = Some(Worker {
            handle,
            generation,
            opened: opened.clone(),
        });
        opened
    }

    async fn stop(&self, block: bool) {
        let core = self.core();
        let worker = {
            let _transition = core.transition_lock.lock().await;
            core.stop_generation.fetch_add(1, Ordering::AcqRel);
            core.set_running(false);
            core.take_worker()
        };

        if let Some(worker) = worker {
            // a transport stopping itself from its own worker task must not wait for itself
            if block && tokio::task::try_id() != Some(worker.handle.id()) {
                if let Err(e) = worker.handle.await {
                    warn!("worker task of transport {} ended abnormally: {}", core.name(), e);
                }
            }
        }
    }

    async fn send(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        self.send_data(data, receivers).await
    }
}

/// Clears the running flag when a worker task ends, including by a panic in its run loop
struct ClearRunningOnExit<'a>(&'a TransportCore);

impl Drop for ClearRunningOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    /// the stop generation this worker was started in
    generation: u64,
    opened: Promise<()>,
}

/// Lifecycle state shared by all transports: name, running flag, receive handler and worker task.
pub struct TransportCore {
    name: String,
    running: watch::Sender<bool>,
    handler: RwLock<Option<Arc<dyn ReceiveHandler>>>,
    worker: Mutex<Option<Worker>>,
    /// held by a worker task for its whole lifetime: a new worker opens only after the previous
    ///  one has left its run loop and released its resources
    worker_lock: tokio::sync::Mutex<()>,
    /// guards open() against a concurrent stop()
    transition_lock: tokio::sync::Mutex<()>,
    /// incremented by every stop(), so a worker that was spawned before a stop does not open
    stop_generation: AtomicU64,
}

impl Debug for TransportCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportCore{{name:{:?}, running:{}}}", self.name, self.is_running())
    }
}

impl TransportCore {
    pub fn new(name: impl Into<String>) -> TransportCore {
        let (running, _) = watch::channel(false);
        TransportCore {
            name: name.into(),
            running,
            handler: RwLock::new(None),
            worker: Mutex::new(None),
            worker_lock: tokio::sync::Mutex::new(()),
            transition_lock: tokio::sync::Mutex::new(()),
            stop_generation: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn set_running(&self, running: bool) {
        self.running.send_replace(running);
    }

    pub fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        }
        else {
            Err(TransportError::NotRunning(self.name.clone()))
        }
    }

    /// Completes when the running flag is cleared. Safe to use as a `select!` branch: there is
    ///  no window in which a stop can be missed.
    pub async fn stop_requested(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn handler(&self) -> Option<Arc<dyn ReceiveHandler>> {
        self.handler.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Dispatches received data to the handler, returning the undecodable tail. A panicking
    ///  handler is reported as [TransportError::HandlerPanicked].
    pub fn received(&self, sender: &str, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let Some(handler) = self.handler() else {
            return Err(TransportError::NoHandler(self.name.clone()));
        };
        trace!("received from {}: {:?}", sender, data);
        panic::catch_unwind(AssertUnwindSafe(|| handler.on_received(sender, data)))
            .map_err(|payload| TransportError::HandlerPanicked {
                transport: self.name.clone(),
                sender: sender.to_string(),
                message: panic_message(payload.as_ref()),
            })
    }

    /// Like [TransportCore::received], but for use inside run loops: failures are logged and the
    ///  data is dropped, so the loop keeps going.
    pub fn deliver(&self, sender: &str, data: &[u8]) -> Vec<u8> {
        match self.received(sender, data) {
            Ok(leftover) => leftover,
            Err(e) => {
                warn!("dropping {} bytes from {}: {}", data.len(), sender, e);
                Vec::new()
            }
        }
    }

    /// Tells the handler that the stream from `sender` ended
    pub fn closed(&self, sender: &str) {
        if let Some(handler) = self.handler() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler.on_closed(sender))).is_err() {
                warn!("receive handler of {} panicked handling the end of stream from {}", self.name, sender);
            }
        }
    }

    fn take_worker(&self) -> Option<Worker> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    }
    else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    }
    else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::ScriptedTransport;

    #[test]
    fn test_received_dispatches_to_handler() {
        let core = TransportCore::new("t");

        let mut handler = MockReceiveHandler::new();
        handler.expect_on_received()
            .withf(|sender, data| sender == "peer" && data == b"abc\nde")
            .times(1)
            .returning(|_, _| b"de".to_vec());
        core.set_handler(Some(Arc::new(handler)));

        assert_eq!(core.received("peer", b"abc\nde").unwrap(), b"de".to_vec());
    }

    #[test]
    fn test_received_without_handler() {
        let core = TransportCore::new("t");
        assert!(matches!(core.received("peer", b"x"), Err(TransportError::NoHandler(_))));
        assert_eq!(core.deliver("peer", b"x"), Vec::<u8>::new());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let core = TransportCore::new("t");
        let handler = |_: &str, data: &[u8]| {
            if data.starts_with(b"boom") {
                panic!("cannot handle {:?}", data);
            }
            Vec::new()
        };
        core.set_handler(Some(Arc::new(handler)));

        match core.received("peer", b"boom\n") {
            Err(TransportError::HandlerPanicked { transport, sender, message }) => {
                assert_eq!(transport, "t");
                assert_eq!(sender, "peer");
                assert!(message.starts_with("cannot handle"), "{}", message);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(core.deliver("peer", b"boom\n"), Vec::<u8>::new());

        // the handler is still installed and used for later data
        assert_eq!(core.received("peer", b"ok\n").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        assert!(!transport.is_running());

        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_running());

        transport.stop(true).await;
        assert!(!transport.is_running());

        // restartable after a stop
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_running());
        transport.stop(true).await;
    }

    #[tokio::test]
    async fn test_start_error_propagates() {
        let transport = Arc::new(ScriptedTransport::failing_first("scripted", 1));
        let err = start_blocking(&transport, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("scripted open failure"));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_start_when_running_is_noop() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.open_attempts(), 1);
        transport.stop(true).await;
    }

    #[tokio::test]
    async fn test_send_requires_running() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        let err = transport.send(b"x\n", None).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TransportError>(), Some(TransportError::NotRunning(_))));

        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        transport.send(b"x\n", None).await.unwrap();

        transport.stop(true).await;
        assert!(transport.send(b"y\n", None).await.is_err());
        assert_eq!(transport.sent(), vec![b"x\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_remote_close_clears_running() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();

        transport.disconnect();
        tokio::time::timeout(Duration::from_secs(1), transport.core().stop_requested()).await.unwrap();
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_stop_from_own_worker_does_not_deadlock() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();

        transport.request_self_stop();
        tokio::time::timeout(Duration::from_secs(1), transport.core().stop_requested()).await.unwrap();
        assert!(!transport.is_running());

        // a later stop from outside still works
        transport.stop(true).await;
    }

    #[tokio::test]
    async fn test_panic_in_run_loop_clears_running() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();

        transport.crash();
        tokio::time::timeout(Duration::from_secs(1), transport.core().stop_requested()).await.unwrap();
        assert!(!transport.is_running());
        assert!(transport.send(b"x\n", None).await.is_err());

        transport.stop(true).await;
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_running());
        transport.stop(true).await;
    }

    #[tokio::test]
    async fn test_restart_waits_for_previous_worker_to_close() {
        let transport = Arc::new(ScriptedTransport::new("scripted").with_close_delay(Duration::from_millis(50)));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();

        transport.stop(false).await;
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_running());
        assert_eq!(transport.open_attempts(), 2);
        assert_eq!(transport.max_active_runs(), 1);

        transport.stop(true).await;
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_once() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        let first = transport.clone().start();
        let second = transport.clone().start();

        first.result(Duration::from_secs(1)).await.unwrap();
        second.result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(transport.max_active_runs(), 1);
        transport.stop(true).await;
    }

    #[tokio::test]
    async fn test_start_after_remote_close_reopens() {
        let transport = Arc::new(ScriptedTransport::new("scripted"));
        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();

        transport.disconnect();
        tokio::time::timeout(Duration::from_secs(1), transport.core().stop_requested()).await.unwrap();

        start_blocking(&transport, Duration::from_secs(1)).await.unwrap();
        assert!(transport.is_running());
        assert_eq!(transport.open_attempts(), 2);
        transport.stop(true).await;
    }
}
