//! Utilities for testing code built on transports: an in-memory transport with scripted
//!  behavior, and receive handlers that collect what they are given.
//!
//! These are part of the regular (non-#[cfg(test)]) code so that applications can use them in
//!  their own tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::transport::{ReceiveHandler, TransportCore, TransportImpl};

/// An in-memory transport. `open()` outcomes can be scripted, received data is injected by the
///  test, and sent data is recorded.
pub struct ScriptedTransport {
    core: TransportCore,
    open_script: Mutex<VecDeque<bool>>,
    open_attempts: AtomicUsize,
    /// opened channels whose run loop has not finished closing them yet
    active_runs: AtomicUsize,
    max_active_runs: AtomicUsize,
    close_delay: Duration,
    disconnect: Notify,
    self_stop: Notify,
    crash: Notify,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    /// A transport that opens successfully every time
    pub fn new(name: &str) -> ScriptedTransport {
        ScriptedTransport {
            core: TransportCore::new(name),
            open_script: Default::default(),
            open_attempts: AtomicUsize::new(0),
            active_runs: AtomicUsize::new(0),
            max_active_runs: AtomicUsize::new(0),
            close_delay: Duration::ZERO,
            disconnect: Notify::new(),
            self_stop: Notify::new(),
            crash: Notify::new(),
            sent: Default::default(),
        }
    }

    /// A transport whose first `num_failures` calls to `open()` fail
    pub fn failing_first(name: &str, num_failures: usize) -> ScriptedTransport {
        let result = ScriptedTransport::new(name);
        result.script_open(std::iter::repeat(false).take(num_failures));
        result
    }

    /// Appends outcomes for the next calls to `open()` (`true` for success). When the script is
    ///  exhausted, `open()` succeeds.
    pub fn script_open(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.open_script.lock().unwrap_or_else(PoisonError::into_inner)
            .extend(outcomes);
    }

    /// Makes the run loop take `close_delay` to release the channel after it was told to stop
    pub fn with_close_delay(mut self, close_delay: Duration) -> ScriptedTransport {
        self.close_delay = close_delay;
        self
    }

    pub fn core(&self) -> &TransportCore {
        &self.core
    }

    /// The highest number of channels that were open at the same time
    pub fn max_active_runs(&self) -> usize {
        self.max_active_runs.load(Ordering::Acquire)
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::Acquire)
    }

    /// Simulates data arriving from `sender`, returning the handler's leftover
    pub fn inject(&self, sender: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.core.received(sender, data)?)
    }

    /// Simulates the remote side closing the channel: the run loop ends
    pub fn disconnect(&self) {
        self.disconnect.notify_one();
    }

    /// Makes the run loop call `stop()` on its own transport
    pub fn request_self_stop(&self) {
        self.self_stop.notify_one();
    }

    /// Makes the run loop panic
    pub fn crash(&self) {
        self.crash.notify_one();
    }

    /// Simulates the stream from `sender` ending
    pub fn signal_closed(&self, sender: &str) {
        self.core.closed(sender);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TransportImpl for ScriptedTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn open(&self) -> anyhow::Result<()> {
        let attempt = self.open_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let succeed = self.open_script.lock().unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(true);

        if succeed {
            let active = self.active_runs.fetch_add(1, Ordering::AcqRel) + 1;
            self.max_active_runs.fetch_max(active, Ordering::AcqRel);
            Ok(())
        }
        else {
            Err(anyhow!("scripted open failure of {} (attempt {})", self.core.name(), attempt))
        }
    }

    async fn run(&self) {
        tokio::select! {
            _ = self.core.stop_requested() => {}
            _ = self.disconnect.notified() => {}
            _ = self.self_stop.notified() => {
                crate::transport::Transport::stop(self, true).await;
            }
            _ = self.crash.notified() => {
                panic!("scripted crash of {}", self.core.name());
            }
        }

        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.active_runs.fetch_sub(1, Ordering::AcqRel);
    }

    async fn send_data(&self, data: &[u8], receivers: Option<&[String]>) -> anyhow::Result<()> {
        if let Some(receivers) = receivers {
            if !receivers.iter().any(|r| r == self.core.name()) {
                return Ok(());
            }
        }
        self.core.ensure_running()?;
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        Ok(())
    }
}

/// A receive handler that forwards every call as `(sender, data)` to a channel and consumes
///  everything up to the last newline, returning the rest as leftover.
pub fn line_collecting_handler() -> (Arc<dyn ReceiveHandler>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |sender: &str, data: &[u8]| {
        match data.iter().rposition(|&b| b == b'\n') {
            Some(pos) => {
                let _ = tx.send((sender.to_string(), data[..=pos].to_vec()));
                data[pos + 1..].to_vec()
            }
            None => data.to_vec(),
        }
    };
    let handler: Arc<dyn ReceiveHandler> = Arc::new(handler);
    (handler, rx)
}
