//! A single-assignment value that is completed on one task and awaited (with a timeout) on any
//!  number of others.
//!
//! The completing side is a separate [PromiseSetter] value: whoever owns the setter is the only
//!  party that can complete the promise, and completing it a second time is reported as
//!  [PromiseError::AlreadyCompleted].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

type Slot<T> = Option<Result<T, Arc<anyhow::Error>>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PromiseError {
    #[error("timed out waiting for the promise to complete")]
    Timeout,
    #[error("promise was already completed")]
    AlreadyCompleted,
    #[error("promise setter was dropped without completing the promise")]
    Abandoned,
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl PromiseError {
    /// Converts this into the underlying failure, wrapping non-`Failed` variants
    pub fn into_cause(self) -> Arc<anyhow::Error> {
        match self {
            PromiseError::Failed(e) => e,
            other => Arc::new(other.into()),
        }
    }
}

pub fn promise<T: Clone + Send + Sync>() -> (PromiseSetter<T>, Promise<T>) {
    let (tx, rx) = watch::channel(None);
    (PromiseSetter { tx }, Promise { rx })
}

pub struct PromiseSetter<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone + Send + Sync> PromiseSetter<T> {
    pub fn set_result(&self, value: T) -> Result<(), PromiseError> {
        self.complete(Ok(value))
    }

    pub fn set_error(&self, error: anyhow::Error) -> Result<(), PromiseError> {
        self.complete(Err(Arc::new(error)))
    }

    fn complete(&self, outcome: Result<T, Arc<anyhow::Error>>) -> Result<(), PromiseError> {
        let mut already_completed = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                already_completed = true;
                return false;
            }
            *slot = Some(outcome);
            true
        });

        if already_completed {
            Err(PromiseError::AlreadyCompleted)
        }
        else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct Promise<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone + Send + Sync> Promise<T> {
    /// A promise that is completed with `value` from the start
    pub fn resolved(value: T) -> Promise<T> {
        let (setter, promise) = promise();
        let _ = setter.set_result(value);
        promise
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Returns the outcome if the promise is completed, without waiting
    pub fn try_result(&self) -> Option<Result<T, PromiseError>> {
        Self::outcome(&self.rx.borrow())
    }

    /// Waits up to `timeout` for the promise to be completed. This can be called repeatedly, and
    ///  from several tasks: the outcome is not consumed.
    pub async fn result(&self, timeout: Duration) -> Result<T, PromiseError> {
        let mut rx = self.rx.clone();
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await {
            Err(_) => Err(PromiseError::Timeout),
            Ok(Err(_)) => Err(PromiseError::Abandoned),
            Ok(Ok(slot)) => Self::outcome(&slot)
                .unwrap_or(Err(PromiseError::Abandoned)),
        };
        outcome
    }

    fn outcome(slot: &Slot<T>) -> Option<Result<T, PromiseError>> {
        match slot {
            None => None,
            Some(Ok(value)) => Some(Ok(value.clone())),
            Some(Err(e)) => Some(Err(PromiseError::Failed(e.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_after_set() {
        let (setter, promise) = promise::<u32>();
        assert!(!promise.is_done());
        assert!(promise.try_result().is_none());

        setter.set_result(5).unwrap();
        assert!(promise.is_done());
        assert_eq!(promise.result(Duration::from_millis(10)).await.unwrap(), 5);
        // not consumed
        assert_eq!(promise.result(Duration::from_millis(10)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_set_from_other_task() {
        let (setter, promise) = promise::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set_result(()).unwrap();
        });
        promise.result(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_result_awaited_by_several_tasks() {
        let (setter, promise) = promise::<u32>();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let promise = promise.clone();
                tokio::spawn(async move { promise.result(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        setter.set_result(7).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn test_double_set() {
        let (setter, promise) = promise::<u32>();
        setter.set_result(1).unwrap();
        assert!(matches!(setter.set_result(2), Err(PromiseError::AlreadyCompleted)));
        assert!(matches!(setter.set_error(anyhow::anyhow!("late")), Err(PromiseError::AlreadyCompleted)));
        assert_eq!(promise.try_result().unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_error() {
        let (setter, promise) = promise::<()>();
        setter.set_error(anyhow::anyhow!("connection refused")).unwrap();
        match promise.result(Duration::from_millis(10)).await {
            Err(PromiseError::Failed(e)) => assert_eq!(e.to_string(), "connection refused"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (_setter, promise) = promise::<()>();
        assert!(matches!(promise.result(Duration::from_secs(1)).await, Err(PromiseError::Timeout)));
    }

    #[tokio::test]
    async fn test_abandoned() {
        let (setter, promise) = promise::<()>();
        drop(setter);
        assert!(matches!(promise.result(Duration::from_secs(1)).await, Err(PromiseError::Abandoned)));
    }

    #[tokio::test]
    async fn test_resolved() {
        let promise = Promise::resolved("x".to_string());
        assert_eq!(promise.result(Duration::ZERO).await.unwrap(), "x");
    }
}
