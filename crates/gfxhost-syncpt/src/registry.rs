//! The syncpoint registry.
//!
//! The registry is created once with a fixed number of counters and lives for as long as any
//! channel refers to it. Counters are never destroyed; [`SyncptRegistry::assign`] /
//! [`SyncptRegistry::release`] only track which ones are handed out to clients.

use core::cmp::Ordering;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::threshold;
use crate::{lock, Result, SyncptError};

/// Syncpoint id reserved by the host. It is never handed out and always reads as expired,
/// which makes it a convenient target for patched-out waits.
pub const SYNCPT_RESERVED: u32 = 0;

#[derive(Debug)]
pub struct Syncpt {
    id: u32,
    min: AtomicU32,
    max: AtomicU32,
    client_managed: AtomicBool,
    assigned: AtomicBool,
    name: Mutex<Option<String>>,
}

impl Syncpt {
    fn new(id: u32) -> Self {
        Self {
            id,
            min: AtomicU32::new(0),
            max: AtomicU32::new(0),
            client_managed: AtomicBool::new(false),
            assigned: AtomicBool::new(id == SYNCPT_RESERVED),
            name: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Last value confirmed reached by hardware or a CPU increment.
    pub fn read_current(&self) -> u32 {
        self.min.load(AtomicOrdering::Acquire)
    }

    /// Highest value any submitted job has promised to reach.
    pub fn read_max(&self) -> u32 {
        self.max.load(AtomicOrdering::Acquire)
    }

    /// Reserves `n` future increments and returns the new `max`.
    ///
    /// This is a single atomic read-modify-write, so callers racing on the same syncpoint
    /// (including from different channels) always receive disjoint `(old, new]` ranges.
    pub fn increment_max(&self, n: u32) -> u32 {
        self.max
            .fetch_add(n, AtomicOrdering::AcqRel)
            .wrapping_add(n)
    }

    /// Reserves one increment for the CPU, unless the syncpoint is host managed and still
    /// has outstanding work. Returns `true` if `max` was bumped.
    ///
    /// The idle check and the bump are one compare-and-swap on `max`: a job reserving
    /// increments at the same time either lands after the CPU's slot or makes the check see
    /// outstanding work, in which case the CPU increment counts toward that work.
    pub fn reserve_cpu_increment(&self) -> bool {
        let client_managed = self.is_client_managed();
        let mut max = self.read_max();
        loop {
            // `current` never passes `max`, so equality here means nothing is outstanding.
            if !client_managed && self.read_current() != max {
                return false;
            }
            match self.max.compare_exchange_weak(
                max,
                max.wrapping_add(1),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => max = actual,
            }
        }
    }

    /// Records that the counter has reached `value` and returns the resulting current value.
    ///
    /// `current` never moves backwards. For host-managed syncpoints it also never moves past
    /// `max`; a value beyond `max` means hardware reported increments nobody promised, which
    /// is clamped and logged.
    pub fn advance_current(&self, value: u32) -> u32 {
        self.update_current(|_| value)
    }

    /// Adds `n` to `current`, the way a hardware or CPU increment does, and returns the
    /// resulting value. Host-managed syncpoints are still clamped to `max`.
    pub fn increment_current(&self, n: u32) -> u32 {
        self.update_current(|cur| cur.wrapping_add(n))
    }

    fn update_current(&self, next: impl Fn(u32) -> u32) -> u32 {
        let client_managed = self.is_client_managed();
        let mut cur = self.min.load(AtomicOrdering::Acquire);
        loop {
            let mut target = next(cur);
            if !threshold::is_after(target, cur) {
                return cur;
            }

            if !client_managed {
                let max = self.read_max();
                if threshold::is_after(target, max) {
                    tracing::warn!(
                        syncpt_id = self.id,
                        value = target,
                        max,
                        "syncpoint advanced past its promised max; clamping"
                    );
                    target = max;
                    if !threshold::is_after(target, cur) {
                        return cur;
                    }
                }
            }

            match self.min.compare_exchange_weak(
                cur,
                target,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return target,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Forces `current` up to `max`, e.g. after the CPU completed work on behalf of hardware.
    pub fn set_min_eq_max(&self) -> u32 {
        let max = self.read_max();
        self.advance_current(max)
    }

    fn future(&self) -> Option<u32> {
        if self.is_client_managed() {
            None
        } else {
            Some(self.read_max())
        }
    }

    /// Returns `true` once `thresh` has been reached.
    pub fn is_expired(&self, thresh: u32) -> bool {
        // Read `current` before `max`: `current` only chases `max`, so this order never
        // observes a current value ahead of the max it is compared against.
        let current = self.read_current();
        let future = self.future();
        threshold::is_expired(current, future, thresh)
    }

    /// Orders two thresholds on this syncpoint by which one triggers first.
    pub fn compare(&self, a: u32, b: u32) -> Ordering {
        let current = self.read_current();
        let future = self.future();
        threshold::compare(current, future, a, b)
    }

    pub fn is_client_managed(&self) -> bool {
        self.client_managed.load(AtomicOrdering::Acquire)
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned.load(AtomicOrdering::Acquire)
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }
}

/// Fixed-size set of syncpoints indexed by id.
#[derive(Debug)]
pub struct SyncptRegistry {
    syncpts: Box<[Syncpt]>,
}

impl SyncptRegistry {
    /// Creates `count` syncpoints with ids `0..count`. Id 0 is [`SYNCPT_RESERVED`].
    pub fn new(count: u32) -> Self {
        assert!(count > 1, "registry needs at least one non-reserved syncpoint");
        let syncpts = (0..count).map(Syncpt::new).collect::<Vec<_>>();
        Self {
            syncpts: syncpts.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.syncpts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syncpts.is_empty()
    }

    pub fn get(&self, id: u32) -> Result<&Syncpt> {
        self.syncpts
            .get(id as usize)
            .ok_or(SyncptError::NotFound(id))
    }

    /// Like [`get`](Self::get), but rejects the reserved syncpoint.
    pub fn get_client(&self, id: u32) -> Result<&Syncpt> {
        if id == SYNCPT_RESERVED {
            return Err(SyncptError::Reserved(id));
        }
        self.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Syncpt> {
        self.syncpts.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.syncpts.iter().map(Syncpt::id)
    }

    /// Hands out the lowest free syncpoint, tagging it with `name`.
    ///
    /// Client-managed syncpoints are incremented by their owner without promising a `max`
    /// first, so expiry checks fall back to a plain signed comparison.
    pub fn assign(&self, name: &str, client_managed: bool) -> Result<&Syncpt> {
        for sp in self.syncpts.iter().skip(1) {
            if sp
                .assigned
                .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_ok()
            {
                sp.client_managed
                    .store(client_managed, AtomicOrdering::Release);
                *lock(&sp.name) = Some(name.to_owned());
                tracing::debug!(syncpt_id = sp.id, name, client_managed, "assigned syncpoint");
                return Ok(sp);
            }
        }
        Err(SyncptError::Exhausted)
    }

    /// Returns a syncpoint to the free pool. Its counter values are kept.
    pub fn release(&self, id: u32) -> Result<()> {
        let sp = self.get_client(id)?;
        *lock(&sp.name) = None;
        sp.client_managed.store(false, AtomicOrdering::Release);
        sp.assigned.store(false, AtomicOrdering::Release);
        Ok(())
    }
}
