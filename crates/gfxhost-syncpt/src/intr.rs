//! Completion-action queue.
//!
//! Each syncpoint owns a list of pending actions sorted by threshold. Arming happens on
//! submitting threads, firing happens on whatever thread observes hardware progress (the
//! "interrupt" path). The two only share the per-syncpoint list lock, which is never held
//! while a callback runs, so firing cannot block behind a thread that holds a channel's
//! submission lock.
//!
//! At most one thread fires a given syncpoint's actions at a time. A thread that advances the
//! syncpoint while another is firing leaves the newly due actions to that thread, which
//! rescans the list before it stops. Callbacks on one syncpoint therefore run in threshold
//! order, and a callback may itself advance the syncpoint it was armed on.

use core::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::registry::SyncptRegistry;
use crate::{lock, Result, SyncptError};

/// Details passed to a completion callback when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionFired {
    pub syncpt_id: u32,
    pub threshold: u32,
    /// Syncpoint value observed when the action was found to be due.
    pub value: u32,
}

pub type ActionFn = Box<dyn FnOnce(ActionFired) + Send + 'static>;

/// Identifies an armed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionToken {
    syncpt_id: u32,
    threshold: u32,
    seq: u64,
}

impl ActionToken {
    pub fn syncpt_id(&self) -> u32 {
        self.syncpt_id
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

struct PendingAction {
    threshold: u32,
    seq: u64,
    callback: ActionFn,
}

#[derive(Default)]
struct ActionList {
    pending: Vec<PendingAction>,
    /// Set while some thread is running this syncpoint's due actions.
    firing: bool,
}

pub struct Intr {
    registry: Arc<SyncptRegistry>,
    lists: Box<[Mutex<ActionList>]>,
    /// Cap on pending actions per syncpoint.
    max_pending: usize,
    next_seq: AtomicU64,
    fired: AtomicU64,
}

impl fmt::Debug for Intr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intr")
            .field("syncpts", &self.lists.len())
            .field("max_pending", &self.max_pending)
            .field("fired", &self.fired())
            .finish()
    }
}

impl Intr {
    pub fn new(registry: Arc<SyncptRegistry>) -> Self {
        Self::with_action_limit(registry, usize::MAX)
    }

    /// Like [`new`](Self::new), but refuses to hold more than `max_pending` actions on any
    /// one syncpoint; going over is reported as [`SyncptError::OutOfMemory`].
    pub fn with_action_limit(registry: Arc<SyncptRegistry>, max_pending: usize) -> Self {
        let lists = (0..registry.len())
            .map(|_| Mutex::new(ActionList::default()))
            .collect::<Vec<_>>();
        Self {
            registry,
            lists: lists.into_boxed_slice(),
            max_pending,
            next_seq: AtomicU64::new(1),
            fired: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SyncptRegistry> {
        &self.registry
    }

    fn list(&self, id: u32) -> Result<&Mutex<ActionList>> {
        self.lists
            .get(id as usize)
            .ok_or(SyncptError::NotFound(id))
    }

    /// Pre-allocates room for `additional` actions on syncpoint `id`.
    pub fn reserve(&self, id: u32, additional: usize) -> Result<()> {
        let mut list = lock(self.list(id)?);
        if list.pending.len().saturating_add(additional) > self.max_pending {
            return Err(SyncptError::OutOfMemory { id });
        }
        list.pending
            .try_reserve(additional)
            .map_err(|_| SyncptError::OutOfMemory { id })
    }

    /// Arms `callback` to run once syncpoint `id` reaches `threshold`.
    ///
    /// If the threshold has already been reached the callback runs before `arm` returns,
    /// unless another thread is firing this syncpoint's actions, in which case that thread
    /// runs it. Once armed, it runs exactly once.
    pub fn arm(&self, id: u32, threshold: u32, callback: ActionFn) -> Result<ActionToken> {
        let sp = self.registry.get(id)?;
        let list = self.list(id)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = ActionToken {
            syncpt_id: id,
            threshold,
            seq,
        };

        let expired = {
            let mut list = lock(list);
            if list.pending.len() >= self.max_pending {
                return Err(SyncptError::OutOfMemory { id });
            }
            list.pending
                .try_reserve(1)
                .map_err(|_| SyncptError::OutOfMemory { id })?;
            let pos = list
                .pending
                .partition_point(|a| sp.compare(a.threshold, threshold).is_le());
            list.pending.insert(
                pos,
                PendingAction {
                    threshold,
                    seq,
                    callback,
                },
            );
            // Checked under the list lock: a concurrent advance either published its new
            // value before this read, or will drain the list after we insert.
            sp.is_expired(threshold)
        };
        if expired {
            self.on_syncpoint_advanced(id, sp.read_current());
        }
        Ok(token)
    }

    /// Runs every action on syncpoint `id` that is due at `new_current` (or at whatever later
    /// value the registry already holds). Returns the number of callbacks this call invoked;
    /// it is zero when another thread was already firing and took the work over.
    pub fn on_syncpoint_advanced(&self, id: u32, new_current: u32) -> usize {
        let (Ok(sp), Ok(list)) = (self.registry.get(id), self.list(id)) else {
            tracing::warn!(syncpt_id = id, "completion for unknown syncpoint");
            return 0;
        };

        let mut state = lock(list);
        if state.firing {
            return 0;
        }
        state.firing = true;

        let mut count = 0;
        loop {
            let n = state.pending.partition_point(|a| sp.is_expired(a.threshold));
            if n == 0 {
                state.firing = false;
                return count;
            }
            let due: Vec<PendingAction> = state.pending.drain(..n).collect();
            drop(state);

            let value = sp.read_current();
            tracing::trace!(
                syncpt_id = id,
                new_current,
                value,
                count = due.len(),
                "firing completion actions"
            );
            count += due.len();
            for action in due {
                self.run(
                    ActionFired {
                        syncpt_id: id,
                        threshold: action.threshold,
                        value,
                    },
                    action.callback,
                );
            }
            state = lock(list);
        }
    }

    /// Hardware-completion entry point: records `value` and fires whatever became due.
    pub fn advance(&self, id: u32, value: u32) -> Result<usize> {
        let current = self.registry.get(id)?.advance_current(value);
        Ok(self.on_syncpoint_advanced(id, current))
    }

    /// Increments syncpoint `id` by `n` and fires whatever became due.
    pub fn increment(&self, id: u32, n: u32) -> Result<usize> {
        let current = self.registry.get(id)?.increment_current(n);
        Ok(self.on_syncpoint_advanced(id, current))
    }

    /// Drops a still-pending action without running it. Returns `false` if it already fired.
    ///
    /// Only waiters that own their action use this; submission actions are never cancelled.
    pub(crate) fn remove(&self, token: ActionToken) -> bool {
        let Ok(list) = self.list(token.syncpt_id) else {
            return false;
        };
        let mut list = lock(list);
        match list.pending.iter().position(|a| a.seq == token.seq) {
            Some(pos) => {
                list.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of actions still waiting on syncpoint `id`.
    pub fn pending(&self, id: u32) -> usize {
        self.list(id).map(|list| lock(list).pending.len()).unwrap_or(0)
    }

    /// Total number of callbacks run so far.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    fn run(&self, fired: ActionFired, callback: ActionFn) {
        self.fired.fetch_add(1, Ordering::Relaxed);
        callback(fired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<SyncptRegistry>, Intr) {
        let registry = Arc::new(SyncptRegistry::new(4));
        let intr = Intr::new(registry.clone());
        (registry, intr)
    }

    fn recorder() -> (Arc<Mutex<Vec<ActionFired>>>, impl Fn() -> ActionFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move || -> ActionFn {
                let log = log.clone();
                Box::new(move |fired| log.lock().unwrap().push(fired))
            }
        };
        (log, make)
    }

    #[test]
    fn fires_only_once_threshold_reached() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        let sp = registry.get(1).unwrap();
        let end = sp.increment_max(2);

        intr.arm(1, end, make()).unwrap();
        assert_eq!(intr.pending(1), 1);

        assert_eq!(intr.advance(1, 1).unwrap(), 0);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(intr.advance(1, 2).unwrap(), 1);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[ActionFired {
                syncpt_id: 1,
                threshold: 2,
                value: 2
            }]
        );
        assert_eq!(intr.pending(1), 0);
    }

    #[test]
    fn repeated_advance_does_not_refire() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        let end = registry.get(1).unwrap().increment_max(1);
        intr.arm(1, end, make()).unwrap();

        assert_eq!(intr.advance(1, end).unwrap(), 1);
        assert_eq!(intr.advance(1, end).unwrap(), 0);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(intr.fired(), 1);
    }

    #[test]
    fn fires_in_threshold_order_regardless_of_arm_order() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        registry.get(2).unwrap().increment_max(5);

        intr.arm(2, 4, make()).unwrap();
        intr.arm(2, 1, make()).unwrap();
        intr.arm(2, 3, make()).unwrap();

        intr.advance(2, 5).unwrap();
        let thresholds: Vec<u32> = log.lock().unwrap().iter().map(|f| f.threshold).collect();
        assert_eq!(thresholds, vec![1, 3, 4]);
    }

    #[test]
    fn arming_an_expired_threshold_fires_immediately() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        let sp = registry.get(1).unwrap();
        sp.increment_max(3);
        sp.advance_current(3);

        intr.arm(1, 2, make()).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(intr.pending(1), 0);
    }

    #[test]
    fn other_syncpoints_are_untouched() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        registry.get(1).unwrap().increment_max(1);
        registry.get(2).unwrap().increment_max(1);
        intr.arm(1, 1, make()).unwrap();
        intr.arm(2, 1, make()).unwrap();

        intr.advance(2, 1).unwrap();
        assert_eq!(log.lock().unwrap()[0].syncpt_id, 2);
        assert_eq!(intr.pending(1), 1);
    }

    #[test]
    fn increments_fire_each_threshold_as_it_is_reached() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        registry.get(3).unwrap().increment_max(2);
        intr.arm(3, 1, make()).unwrap();
        intr.arm(3, 2, make()).unwrap();

        assert_eq!(intr.increment(3, 1).unwrap(), 1);
        assert_eq!(intr.increment(3, 1).unwrap(), 1);
        let values: Vec<u32> = log.lock().unwrap().iter().map(|f| f.value).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn callback_may_advance_its_own_syncpoint() {
        let registry = Arc::new(SyncptRegistry::new(4));
        let intr = Arc::new(Intr::new(registry.clone()));
        let (log, make) = recorder();
        registry.get(1).unwrap().increment_max(2);

        let chained: ActionFn = {
            let intr = intr.clone();
            let log = log.clone();
            Box::new(move |fired| {
                log.lock().unwrap().push(fired);
                intr.increment(1, 1).unwrap();
            })
        };
        intr.arm(1, 1, chained).unwrap();
        intr.arm(1, 2, make()).unwrap();

        // The nested increment defers to the outer call, which fires both in order.
        assert_eq!(intr.increment(1, 1).unwrap(), 2);
        let thresholds: Vec<u32> = log.lock().unwrap().iter().map(|f| f.threshold).collect();
        assert_eq!(thresholds, vec![1, 2]);
        assert_eq!(registry.get(1).unwrap().read_current(), 2);
    }

    #[test]
    fn remove_drops_pending_action() {
        let (registry, intr) = setup();
        let (log, make) = recorder();
        registry.get(1).unwrap().increment_max(1);
        let token = intr.arm(1, 1, make()).unwrap();

        assert!(intr.remove(token));
        assert!(!intr.remove(token));
        intr.advance(1, 1).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn action_limit_applies_to_reserve_and_arm() {
        let registry = Arc::new(SyncptRegistry::new(4));
        let intr = Intr::with_action_limit(registry.clone(), 2);
        let (_log, make) = recorder();
        registry.get(1).unwrap().increment_max(3);

        intr.reserve(1, 2).unwrap();
        intr.arm(1, 1, make()).unwrap();
        assert_eq!(
            intr.reserve(1, 2).unwrap_err(),
            SyncptError::OutOfMemory { id: 1 }
        );
        intr.arm(1, 2, make()).unwrap();
        assert_eq!(
            intr.arm(1, 3, make()).unwrap_err(),
            SyncptError::OutOfMemory { id: 1 }
        );
        // Other syncpoints have their own budget.
        registry.get(2).unwrap().increment_max(1);
        intr.arm(2, 1, make()).unwrap();

        intr.advance(1, 1).unwrap();
        intr.arm(1, 3, make()).unwrap();
        assert_eq!(intr.pending(1), 2);
    }

    #[test]
    fn unknown_syncpoint_is_rejected() {
        let (_registry, intr) = setup();
        let (_log, make) = recorder();
        assert_eq!(
            intr.arm(9, 1, make()).unwrap_err(),
            SyncptError::NotFound(9)
        );
        assert_eq!(intr.reserve(9, 1).unwrap_err(), SyncptError::NotFound(9));
    }
}
