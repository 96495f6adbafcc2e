use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::intr::Intr;
use crate::{lock, Result};

/// How often a blocked waiter re-checks the syncpoint and reports lack of progress.
pub const WAIT_CHECK_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { value: u32 },
    Timeout,
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }
}

#[derive(Default)]
struct Waiter {
    value: Mutex<Option<u32>>,
    cv: Condvar,
}

impl Waiter {
    fn signal(&self, value: u32) {
        *lock(&self.value) = Some(value);
        self.cv.notify_all();
    }
}

impl Intr {
    /// Blocks until syncpoint `id` reaches `thresh` or `timeout` elapses.
    ///
    /// A zero timeout only checks the current state. The waiter's completion action is
    /// removed again on timeout so abandoned waits do not accumulate.
    pub fn wait(&self, id: u32, thresh: u32, timeout: Duration) -> Result<WaitOutcome> {
        let sp = self.registry().get(id)?;
        if sp.is_expired(thresh) {
            return Ok(WaitOutcome::Ready {
                value: sp.read_current(),
            });
        }
        if timeout.is_zero() {
            return Ok(WaitOutcome::Timeout);
        }

        let waiter = Arc::new(Waiter::default());
        let token = {
            let waiter = waiter.clone();
            self.arm(id, thresh, Box::new(move |fired| waiter.signal(fired.value)))?
        };

        let deadline = Instant::now() + timeout;
        let mut last_seen = sp.read_current();
        let mut guard = lock(&waiter.value);
        loop {
            if let Some(value) = *guard {
                return Ok(WaitOutcome::Ready { value });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let slice = (deadline - now).min(WAIT_CHECK_PERIOD);
            guard = match waiter.cv.wait_timeout(guard, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };

            if guard.is_none() && Instant::now() < deadline {
                let value = sp.read_current();
                if value == last_seen {
                    tracing::warn!(syncpt_id = id, thresh, value, "syncpoint stuck waiting");
                } else {
                    tracing::debug!(syncpt_id = id, thresh, value, "syncpoint progressing slowly");
                    last_seen = value;
                }
            }
        }
        drop(guard);

        if self.remove(token) {
            Ok(WaitOutcome::Timeout)
        } else {
            // Fired between the last check and the removal attempt.
            Ok(WaitOutcome::Ready {
                value: lock(&waiter.value).unwrap_or_else(|| sp.read_current()),
            })
        }
    }
}
