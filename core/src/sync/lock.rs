/// FIFO async mutex used to serialize an instance's sync cycles.
///
/// `acquire` suspends the caller until it reaches the head of the queue
/// and yields an RAII guard; dropping the guard wakes the next waiter.
/// Release is tied to `Drop`, so every exit path of the guarded body,
/// including `?` returns and panics, advances the queue. A waiter whose
/// future is cancelled before being woken is skipped; one cancelled after
/// being woken hands the lock on to the next waiter.
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub struct AsyncLock {
    state: Mutex<LockState>,
}

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

pub struct LockGuard<'a> {
    lock: &'a AsyncLock,
}

/// A queued waiter between enqueue and guard construction. If it is
/// dropped after `release` already sent it the permit, the permit would
/// be lost and the queue would stall, so `Drop` passes it on.
struct Handoff<'a> {
    lock: &'a AsyncLock,
    rx: oneshot::Receiver<()>,
    received: bool,
}

impl Drop for Handoff<'_> {
    fn drop(&mut self) {
        if !self.received && self.rx.try_recv().is_ok() {
            self.lock.release();
        }
    }
}

impl AsyncLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// True while some caller holds the lock
    pub fn is_held(&self) -> bool {
        self.lock_state().locked
    }

    /// Wait in line for the lock
    pub async fn acquire(&self) -> LockGuard<'_> {
        let rx = {
            let mut state = self.lock_state();
            if !state.locked {
                state.locked = true;
                return LockGuard { lock: self };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut handoff = Handoff {
            lock: self,
            rx,
            received: false,
        };
        // Sender is kept in the queue until it fires, so this only fails
        // if the lock itself is dropped; treat that as acquired-and-gone.
        let _ = (&mut handoff.rx).await;
        handoff.received = true;
        LockGuard { lock: self }
    }

    fn release(&self) {
        let mut state = self.lock_state();
        loop {
            match state.waiters.pop_front() {
                // Hand over to the first waiter still listening
                Some(next) => {
                    if next.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    #[tokio::test]
    async fn test_waiters_run_in_fifo_order() {
        let lock = Arc::new(AsyncLock::new());
        let order = Arc::new(TokioMutex::new(Vec::new()));

        let first = lock.acquire().await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                order.lock().await.push(i);
            }));
            // Let each waiter enqueue before the next
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_released_on_error_path() {
        let lock = AsyncLock::new();

        let failing = async {
            let _guard = lock.acquire().await;
            Err::<(), &str>("guarded body failed")
        };
        assert!(failing.await.is_err());

        // The error above must not stall the queue
        let guard = lock.acquire().await;
        assert!(lock.is_held());
        drop(guard);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_waiter_dropped_after_wakeup_hands_lock_on() {
        let lock = Arc::new(AsyncLock::new());
        let guard = lock.acquire().await;

        // Enqueue a waiter without letting it complete
        let mut waiting = Box::pin(lock.acquire());
        futures_util::future::poll_fn(|cx| {
            use std::future::Future;
            assert!(waiting.as_mut().poll(cx).is_pending());
            std::task::Poll::Ready(())
        })
        .await;

        // Release wakes the waiter; dropping it before it runs must not
        // strand the permit
        drop(guard);
        drop(waiting);

        let reacquired =
            tokio::time::timeout(Duration::from_millis(300), lock.acquire()).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let lock = Arc::new(AsyncLock::new());
        let guard = lock.acquire().await;

        let cancelled = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancelled.abort();
        let _ = cancelled.await;

        let lock2 = lock.clone();
        let live = tokio::spawn(async move {
            let _guard = lock2.acquire().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(guard);
        assert!(live.await.unwrap());
    }
}
