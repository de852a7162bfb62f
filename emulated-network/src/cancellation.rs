use futures::FutureExt;
use futures::future::Shared;
use futures::select_biased;
use std::future::Future;

/// Cooperative stop flag, observed by long-running loops at their own boundaries
#[derive(Clone)]
pub struct CancellationToken {
    rx: Shared<futures::channel::oneshot::Receiver<()>>,
}

impl CancellationToken {
    pub fn new() -> (Self, CancellationSignal) {
        let (tx, rx) = futures::channel::oneshot::channel();
        (Self { rx: rx.shared() }, CancellationSignal { tx })
    }

    pub fn is_cancelled(&self) -> bool {
        // A dropped signal means cancellation will never come
        matches!(self.rx.clone().now_or_never(), Some(Ok(())))
    }

    /// Resolves once a stop is requested (never, if the signal is dropped without cancelling)
    pub async fn cancelled(&self) {
        if self.rx.clone().await.is_err() {
            futures::future::pending::<()>().await
        }
    }

    /// Drives `future` to completion unless a stop is requested first
    ///
    /// Returns `None` when interrupted. A stop requested before the call wins even if `future` is
    /// immediately ready.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        select_biased! {
            _ = self.cancelled().fuse() => None,
            output = future.fuse() => Some(output),
        }
    }
}

pub struct CancellationSignal {
    tx: futures::channel::oneshot::Sender<()>,
}

impl CancellationSignal {
    pub fn cancel(self) {
        self.tx.send(()).ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tokio::time::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let start = Instant::now();
        let (token, signal) = CancellationToken::new();

        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            signal.cancel();
        });

        let result = token
            .run_until_cancelled(sleep(Duration::from_secs(5)))
            .await;

        assert!(result.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_every_clone() {
        let start = Instant::now();
        let (token, signal) = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                token.run_until_cancelled(sleep(Duration::from_secs(10))).await
            }));
        }

        sleep(Duration::from_secs(2)).await;
        signal.cancel();

        for handle in handles {
            assert!(handle.await.unwrap().is_none());
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_signal_never_cancels() {
        let start = Instant::now();
        let (token, signal) = CancellationToken::new();
        drop(signal);

        let result = token
            .run_until_cancelled(async {
                sleep(Duration::from_secs(5)).await;
                42
            })
            .await;

        assert_eq!(result, Some(42));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_before_ready_future() {
        let (token, signal) = CancellationToken::new();
        signal.cancel();

        assert_eq!(token.run_until_cancelled(async { 1 }).await, None);
    }
}
