//! Single-resolution result cells
//!
//! A [`Promise`] settles exactly once, with a value or with a shared error.
//! Continuations attached before settlement run on the thread that settles
//! it; continuations attached afterwards run immediately on the caller's
//! thread. No lock is held while a continuation runs, so continuations may
//! freely touch the promise again.

use crate::error::Error;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Settled state of a promise
pub type Outcome<T> = std::result::Result<T, Arc<Error>>;

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Outcome<T>),
}

/// Shared, clonable handle to a single-resolution cell
pub struct Promise<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Unresolved promise
    pub fn new() -> Self {
        Promise {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Promise already resolved with `value`
    pub fn succeeded(value: T) -> Self {
        Promise {
            state: Arc::new(Mutex::new(State::Done(Ok(value)))),
        }
    }

    /// Promise already failed with `cause`
    pub fn failed(cause: Error) -> Self {
        Promise {
            state: Arc::new(Mutex::new(State::Done(Err(Arc::new(cause))))),
        }
    }

    /// Resolve with `value`; returns false if already settled
    pub fn try_success(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    /// Fail with `cause`; returns false if already settled
    pub fn try_failure(&self, cause: impl Into<Arc<Error>>) -> bool {
        self.try_complete(Err(cause.into()))
    }

    /// Settle with `outcome`; returns false if already settled
    pub fn try_complete(&self, outcome: Outcome<T>) -> bool {
        self.try_complete_with(outcome, || {})
    }

    /// Settle with `outcome`, running `on_settled` under the promise lock
    /// before any continuation sees the result.
    ///
    /// `on_settled` only runs if this call wins the resolution and must not
    /// touch the promise itself.
    pub fn try_complete_with(&self, outcome: Outcome<T>, on_settled: impl FnOnce()) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Done(outcome.clone());
                    on_settled();
                    listeners
                }
            }
        };

        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    /// Run `f` once the promise settles
    pub fn add_listener<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(f));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        f(&outcome);
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(Ok(_)))
    }

    pub fn is_failure(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(Err(_)))
    }

    /// The settled outcome, if any
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// The success value, if resolved successfully
    pub fn get(&self) -> Option<T> {
        self.outcome().and_then(|o| o.ok())
    }

    /// The failure cause, if failed
    pub fn cause(&self) -> Option<Arc<Error>> {
        self.outcome().and_then(|o| o.err())
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            State::Pending(listeners) => format!("pending ({} listeners)", listeners.len()),
            State::Done(Ok(_)) => "success".to_string(),
            State::Done(Err(cause)) => format!("failure ({})", cause),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_resolves_once() {
        let promise = Promise::new();
        assert!(promise.try_success(1));
        assert!(!promise.try_success(2));
        assert!(!promise.try_failure(Error::ChannelClosed));
        assert_eq!(promise.get(), Some(1));
        assert!(promise.is_success());
    }

    #[test]
    fn test_listener_before_and_after_resolution() {
        let promise: Promise<&'static str> = Promise::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let early = Arc::clone(&seen);
        promise.add_listener(move |o| early.lock().push(("early", o.clone().ok())));
        assert!(seen.lock().is_empty());

        promise.try_success("h2");
        let late = Arc::clone(&seen);
        promise.add_listener(move |o| late.lock().push(("late", o.clone().ok())));

        assert_eq!(
            *seen.lock(),
            vec![("early", Some("h2")), ("late", Some("h2"))]
        );
    }

    #[test]
    fn test_failure_carries_cause() {
        let promise: Promise<()> = Promise::failed(Error::Negotiation("boom".into()));
        assert!(promise.is_failure());
        assert_eq!(
            promise.cause().map(|c| c.to_string()),
            Some("Negotiation failed: boom".to_string())
        );
        assert_eq!(promise.get(), None);
    }

    #[test]
    fn test_listener_may_reenter() {
        let promise: Promise<u32> = Promise::new();
        let inner = promise.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        promise.add_listener(move |_| {
            assert!(inner.is_done());
            let counter = Arc::clone(&counter);
            inner.add_listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        promise.try_success(5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_settle_hook_runs_only_for_winner() {
        let promise: Promise<u32> = Promise::new();
        let hooks = AtomicUsize::new(0);
        assert!(promise.try_complete_with(Ok(1), || {
            hooks.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!promise.try_complete_with(Ok(2), || {
            hooks.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_resolution_has_one_winner() {
        let promise: Promise<usize> = Promise::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        promise.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let winners: usize = (0..8)
            .map(|i| {
                let promise = promise.clone();
                thread::spawn(move || promise.try_success(i) as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
