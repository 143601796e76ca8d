//! Ordered chain of single-shot termination steps

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::Terminatable;

const PENDING: u8 = 0;
/// Continuation ran before `terminate` returned
const SYNC_DONE: u8 = 1;
/// `terminate` returned first; the continuation resumes the chain itself
const RETURNED: u8 = 2;

enum Step {
    Handler(Arc<dyn Terminatable>),
    Action(Box<dyn FnOnce() + Send>),
}

/// Runs steps strictly in order.
///
/// A handler step only advances once the handler invokes its continuation, which may happen
/// synchronously or later on another task. Synchronous continuations are folded into the
/// loop, so long chains never nest.
#[derive(Default)]
pub struct Terminator {
    steps: VecDeque<Step>,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `handler`; absent handlers are skipped
    pub fn then(mut self, handler: Option<Arc<dyn Terminatable>>) -> Self {
        if let Some(handler) = handler {
            self.steps.push_back(Step::Handler(handler));
        }
        self
    }

    pub fn then_run(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.steps.push_back(Step::Action(Box::new(action)));
        self
    }

    pub fn invoke(self) {
        run(Arc::new(Mutex::new(self.steps)));
    }
}

fn run(steps: Arc<Mutex<VecDeque<Step>>>) {
    loop {
        let step = steps.lock().pop_front();
        match step {
            None => return,
            Some(Step::Action(action)) => action(),
            Some(Step::Handler(handler)) => {
                let handoff = Arc::new(AtomicU8::new(PENDING));
                let signal = Arc::clone(&handoff);
                let rest = Arc::clone(&steps);
                handler.terminate(Box::new(move || {
                    if signal
                        .compare_exchange(PENDING, SYNC_DONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        run(rest);
                    }
                }));
                if handoff
                    .compare_exchange(PENDING, RETURNED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Callback;

    struct Immediate;

    impl Terminatable for Immediate {
        fn terminate(&self, callback: Callback) {
            callback();
        }
    }

    #[derive(Default)]
    struct Parked(Mutex<Option<Callback>>);

    impl Parked {
        fn release(&self) {
            let callback = self.0.lock().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    impl Terminatable for Parked {
        fn terminate(&self, callback: Callback) {
            *self.0.lock() = Some(callback);
        }
    }

    fn push(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> impl FnOnce() + Send {
        let log = Arc::clone(log);
        move || log.lock().push(entry)
    }

    #[test]
    fn test_runs_in_order_skipping_absent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        Terminator::new()
            .then_run(push(&log, "first"))
            .then(Some(Arc::new(Immediate)))
            .then(None)
            .then_run(push(&log, "second"))
            .invoke();
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_waits_for_parked_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let parked = Arc::new(Parked::default());
        Terminator::new()
            .then_run(push(&log, "kill"))
            .then(Some(Arc::clone(&parked) as Arc<dyn Terminatable>))
            .then_run(push(&log, "clear"))
            .invoke();
        assert_eq!(*log.lock(), vec!["kill"]);

        parked.release();
        assert_eq!(*log.lock(), vec!["kill", "clear"]);
    }

    #[test]
    fn test_long_synchronous_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Terminator::new();
        for _ in 0..100_000 {
            chain = chain.then(Some(Arc::new(Immediate)));
        }
        chain.then_run(push(&log, "done")).invoke();
        assert_eq!(*log.lock(), vec!["done"]);
    }
}
