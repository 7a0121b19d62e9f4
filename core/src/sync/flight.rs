/// Single-flight guard: collapses concurrent identical calls into one.
///
/// While an invocation is outstanding, any additional `run` on the same
/// guard joins the in-flight execution and receives the same outcome,
/// success or failure. Once the flight settles, the next `run` starts a
/// fresh execution. Guard state belongs to the owning instance; two
/// instances never share a flight.
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Mutex;

pub struct SingleFlight<T: Clone> {
    slot: Mutex<Slot<T>>,
}

struct Slot<T: Clone> {
    seq: u64,
    flight: Option<(u64, Shared<BoxFuture<'static, T>>)>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                seq: 0,
                flight: None,
            }),
        }
    }

    /// True while an execution is outstanding
    pub fn in_flight(&self) -> bool {
        self.lock_slot().flight.is_some()
    }

    /// Run `fut`, or join the execution already in flight.
    pub async fn run<F>(&self, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (id, shared) = {
            let mut slot = self.lock_slot();
            match &slot.flight {
                Some((id, shared)) => (*id, shared.clone()),
                None => {
                    slot.seq += 1;
                    let id = slot.seq;
                    let shared = fut.boxed().shared();
                    slot.flight = Some((id, shared.clone()));
                    (id, shared)
                }
            }
        };

        let outcome = shared.await;

        // First caller past the await retires the flight; the id check
        // keeps a slow joiner from clearing a newer flight.
        let mut slot = self.lock_slot();
        if matches!(&slot.flight, Some((current, _)) if *current == id) {
            slot.flight = None;
        }
        outcome
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
