//! Single-flight coordination: at most one in-progress call per key.
//!
//! Used by storage sync (one fetch per dataset id) and by the result cache
//! (one computation per fingerprint). Callers that arrive while a call is in
//! flight block on a condvar and receive a clone of the leader's outcome.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::errors::{EchoError, EchoResult};

/// Whether the caller executed the work or waited for someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

struct Call<V> {
    result: Mutex<Option<EchoResult<V>>>,
    done: Condvar,
}

impl<V: Clone> Call<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: EchoResult<V>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self, deadline: Option<Instant>, activity: &str) -> EchoResult<V> {
        let mut slot = self.result.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out() {
                        if let Some(outcome) = slot.as_ref() {
                            return outcome.clone();
                        }
                        return Err(EchoError::Timeout(format!("waiting for {activity}")));
                    }
                }
                None => self.done.wait(&mut slot),
            }
        }
    }
}

type CallMap<K, V> = Arc<Mutex<HashMap<K, Arc<Call<V>>>>>;

/// Unregisters the key and completes the call, even if the work panics.
///
/// The key leaves the map before the outcome is published, so a caller that
/// arrives after completion starts a fresh call instead of replaying this one.
struct LeaderGuard<K: Eq + Hash, V: Clone> {
    calls: CallMap<K, V>,
    key: K,
    call: Arc<Call<V>>,
    released: bool,
}

impl<K: Eq + Hash, V: Clone> LeaderGuard<K, V> {
    fn release(&mut self, outcome: EchoResult<V>) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut calls = self.calls.lock();
            if calls.get(&self.key).is_some_and(|c| Arc::ptr_eq(c, &self.call)) {
                calls.remove(&self.key);
            }
        }
        self.call.complete(outcome);
    }

    fn finish(mut self, outcome: EchoResult<V>) {
        self.release(outcome);
    }
}

impl<K: Eq + Hash, V: Clone> Drop for LeaderGuard<K, V> {
    fn drop(&mut self) {
        self.release(Err(EchoError::Transient("in-flight call aborted".to_string())));
    }
}

pub struct SingleFlight<K, V> {
    calls: CallMap<K, V>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with a call currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Register as leader for `key`, or return the existing call to wait on.
    fn claim(&self, key: &K) -> Result<LeaderGuard<K, V>, Arc<Call<V>>> {
        let mut calls = self.calls.lock();
        if let Some(existing) = calls.get(key) {
            return Err(Arc::clone(existing));
        }
        let call = Arc::new(Call::new());
        calls.insert(key.clone(), Arc::clone(&call));
        Ok(LeaderGuard {
            calls: Arc::clone(&self.calls),
            key: key.clone(),
            call,
            released: false,
        })
    }

    /// Run `work` on the calling thread unless a call for `key` is already in
    /// flight, in which case wait (up to `deadline`) for its outcome.
    pub fn run<F>(
        &self,
        key: &K,
        deadline: Option<Instant>,
        activity: &str,
        work: F,
    ) -> EchoResult<(V, Role)>
    where
        F: FnOnce() -> EchoResult<V>,
    {
        match self.claim(key) {
            Ok(guard) => {
                let outcome = work();
                guard.finish(outcome.clone());
                outcome.map(|v| (v, Role::Leader))
            }
            Err(call) => call
                .wait(deadline, activity)
                .map(|v| (v, Role::Follower)),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Like [`run`](Self::run), but the work executes on a detached thread
    /// owned by the key rather than by any caller. Every caller, the one that
    /// started the work included, only waits; a caller whose deadline passes
    /// stops waiting while the work carries on for the others.
    pub fn run_detached<F>(
        &self,
        key: &K,
        deadline: Option<Instant>,
        activity: &str,
        work: F,
    ) -> EchoResult<(V, Role)>
    where
        F: FnOnce() -> EchoResult<V> + Send + 'static,
    {
        match self.claim(key) {
            Ok(guard) => {
                let call = Arc::clone(&guard.call);
                let spawned = std::thread::Builder::new()
                    .name("echo-singleflight".to_string())
                    .spawn(move || {
                        let outcome = work();
                        guard.finish(outcome);
                    });
                if let Err(e) = spawned {
                    // The guard was dropped with the closure and already
                    // released the key with an aborted outcome.
                    return Err(EchoError::from(e));
                }
                call.wait(deadline, activity).map(|v| (v, Role::Leader))
            }
            Err(call) => call
                .wait(deadline, activity)
                .map(|v| (v, Role::Follower)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<String, u64>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let executions = Arc::clone(&executions);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    flight
                        .run(&"key".to_string(), None, "unit", || {
                            executions.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<(u64, Role)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|(v, _)| *v == 42));
        assert_eq!(
            outcomes.iter().filter(|(_, r)| *r == Role::Leader).count(),
            1
        );
        assert_eq!(flight.in_flight(), 0);
    }

    #[test]
    fn test_errors_reach_followers_and_key_is_released() {
        let flight: SingleFlight<&'static str, u8> = SingleFlight::new();
        let err = flight
            .run(&"k", None, "unit", || Err(EchoError::Transient("down".into())))
            .unwrap_err();
        assert!(matches!(err, EchoError::Transient(_)));
        let (v, role) = flight.run(&"k", None, "unit", || Ok(7)).unwrap();
        assert_eq!((v, role), (7, Role::Leader));
    }

    #[test]
    fn test_detached_work_survives_an_impatient_caller() {
        let flight: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_in_work = Arc::clone(&finished);

        let short = Some(Instant::now() + Duration::from_millis(20));
        let err = flight
            .run_detached(&"ds".to_string(), short, "fetch", move || {
                std::thread::sleep(Duration::from_millis(150));
                finished_in_work.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .unwrap_err();
        assert!(matches!(err, EchoError::Timeout(_)));

        // A patient caller joins the same in-flight work instead of starting
        // a second one.
        let (v, role) = flight
            .run_detached(&"ds".to_string(), None, "fetch", || Ok(99))
            .unwrap();
        assert_eq!(v, 5);
        assert_eq!(role, Role::Follower);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sequential_detached_calls_each_run_their_own_work() {
        let flight: SingleFlight<&'static str, u32> = SingleFlight::new();
        for i in 0..50u32 {
            let (v, role) = flight
                .run_detached(&"ds", None, "fetch", move || Ok(i))
                .unwrap();
            assert_eq!((v, role), (i, Role::Leader), "call {i}");
        }
        assert_eq!(flight.in_flight(), 0);
    }

    #[test]
    fn test_failed_detached_call_is_not_replayed() {
        let flight: SingleFlight<&'static str, u32> = SingleFlight::new();
        let err = flight
            .run_detached(&"ds", None, "fetch", || Err(EchoError::Transient("down".into())))
            .unwrap_err();
        assert!(matches!(err, EchoError::Transient(_)));
        let (v, _) = flight.run_detached(&"ds", None, "fetch", || Ok(3)).unwrap();
        assert_eq!(v, 3);
    }
}
