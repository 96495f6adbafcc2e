use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gfxhost_syncpt::{Fence, SyncptRegistry};

use crate::hw::CdmaHw;
use crate::ring::RingMemory;
use crate::{lock, CdmaError, Result};

/// How long a thread blocked on ring space sleeps before polling the sync queue itself.
const SPACE_POLL_PERIOD: Duration = Duration::from_millis(10);

/// A committed transaction awaiting completion.
#[derive(Debug, Clone)]
struct SyncRecord {
    fences: Vec<Fence>,
    first: u32,
    words: u32,
}

#[derive(Debug)]
struct CdmaState {
    open: bool,
    /// Write position published to hardware.
    put: u32,
    /// Everything before this position has completed and may be overwritten.
    reclaimed: u32,
    sync_queue: VecDeque<SyncRecord>,
}

impl CdmaState {
    fn free(&self, capacity: u32) -> u32 {
        capacity - self.put.wrapping_sub(self.reclaimed)
    }
}

/// Point-in-time view of a ring, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdmaSnapshot {
    pub put: u32,
    pub reclaimed: u32,
    pub space: u32,
    pub in_flight: usize,
    pub open: bool,
}

/// One channel's command ring.
///
/// A ring accepts at most one open transaction at a time. Words pushed through a
/// [`CdmaTxn`] become visible to hardware when the transaction is ended; the words are
/// reclaimed once [`update`](Cdma::update) observes that every fence recorded for the
/// transaction has expired.
pub struct Cdma {
    name: String,
    ring: Arc<RingMemory>,
    hw: Arc<dyn CdmaHw>,
    registry: Arc<SyncptRegistry>,
    state: Mutex<CdmaState>,
    changed: Condvar,
}

impl fmt::Debug for Cdma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cdma")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("state", &self.snapshot())
            .finish()
    }
}

impl Cdma {
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        hw: Arc<dyn CdmaHw>,
        registry: Arc<SyncptRegistry>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            ring: Arc::new(RingMemory::new(capacity)?),
            hw,
            registry,
            state: Mutex::new(CdmaState {
                open: false,
                put: 0,
                reclaimed: 0,
                sync_queue: VecDeque::new(),
            }),
            changed: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    pub fn ring(&self) -> &Arc<RingMemory> {
        &self.ring
    }

    /// Opens a transaction of at most `words` words.
    ///
    /// Blocks while the ring is too full, polling the sync queue for completed work.
    pub fn begin(&self, words: u32) -> Result<CdmaTxn<'_>> {
        let capacity = self.capacity();
        if words > capacity {
            return Err(CdmaError::RingOverflow { words, capacity });
        }

        let mut state = lock(&self.state);
        let mut stalled = false;
        loop {
            if state.open {
                return Err(CdmaError::Busy);
            }
            self.update_locked(&mut state);
            if state.free(capacity) >= words {
                break;
            }
            if !stalled {
                tracing::debug!(
                    ring = %self.name,
                    words,
                    space = state.free(capacity),
                    "waiting for command ring space"
                );
                stalled = true;
            }
            state = self.wait_changed(state, SPACE_POLL_PERIOD);
        }

        state.open = true;
        Ok(CdmaTxn {
            cdma: self,
            start: state.put,
            reserved: words,
            written: 0,
            committed: false,
        })
    }

    /// Retires every leading sync-queue record whose fences have all expired.
    ///
    /// Returns the number of records retired.
    pub fn update(&self) -> usize {
        let mut state = lock(&self.state);
        self.update_locked(&mut state)
    }

    fn update_locked(&self, state: &mut CdmaState) -> usize {
        let mut retired = 0;
        while let Some(record) = state.sync_queue.front() {
            let done = record.fences.iter().all(|fence| {
                // A fence on a syncpoint that vanished can never complete; don't wedge the ring.
                fence.is_expired(&self.registry).unwrap_or(true)
            });
            if !done {
                break;
            }
            state.reclaimed = record.first.wrapping_add(record.words);
            state.sync_queue.pop_front();
            retired += 1;
        }
        if retired > 0 {
            tracing::trace!(ring = %self.name, retired, reclaimed = state.reclaimed, "retired ring records");
            self.changed.notify_all();
        }
        retired
    }

    /// Waits until every committed transaction has completed and no transaction is open.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            self.update_locked(&mut state);
            if state.sync_queue.is_empty() && !state.open {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    ring = %self.name,
                    in_flight = state.sync_queue.len(),
                    "command ring flush timed out"
                );
                return Err(CdmaError::Timeout);
            }
            state = self.wait_changed(state, (deadline - now).min(SPACE_POLL_PERIOD));
        }
    }

    fn wait_changed<'a>(
        &self,
        guard: MutexGuard<'a, CdmaState>,
        timeout: Duration,
    ) -> MutexGuard<'a, CdmaState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Free words, not counting an open transaction's unused reservation.
    pub fn space(&self) -> u32 {
        lock(&self.state).free(self.capacity())
    }

    /// Committed transactions that have not completed yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).sync_queue.len()
    }

    pub fn put(&self) -> u32 {
        lock(&self.state).put
    }

    pub fn snapshot(&self) -> CdmaSnapshot {
        let state = lock(&self.state);
        CdmaSnapshot {
            put: state.put,
            reclaimed: state.reclaimed,
            space: state.free(self.capacity()),
            in_flight: state.sync_queue.len(),
            open: state.open,
        }
    }

    /// Reads back `len` ring words starting at position `start`.
    pub fn dump(&self, start: u32, len: u32) -> Vec<u32> {
        self.ring.snapshot(start, len)
    }
}

/// An open transaction on a [`Cdma`].
///
/// Only one exists per ring at a time, so pushes need no locking. Dropping the transaction
/// without calling [`end`](CdmaTxn::end) discards everything pushed and returns the ring to
/// idle.
#[must_use = "dropping a transaction discards the pushed words"]
pub struct CdmaTxn<'a> {
    cdma: &'a Cdma,
    start: u32,
    reserved: u32,
    written: u32,
    committed: bool,
}

impl fmt::Debug for CdmaTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdmaTxn")
            .field("ring", &self.cdma.name)
            .field("start", &self.start)
            .field("reserved", &self.reserved)
            .field("written", &self.written)
            .finish()
    }
}

impl CdmaTxn<'_> {
    /// Ring position of the first word of this transaction.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn written(&self) -> u32 {
        self.written
    }

    pub fn remaining(&self) -> u32 {
        self.reserved - self.written
    }

    pub fn push(&mut self, word: u32) -> Result<()> {
        if self.written == self.reserved {
            return Err(CdmaError::Overrun {
                reserved: self.reserved,
            });
        }
        self.cdma
            .ring
            .write(self.start.wrapping_add(self.written), word);
        self.written += 1;
        Ok(())
    }

    pub fn push_all(&mut self, words: &[u32]) -> Result<()> {
        if words.len() as u64 > u64::from(self.remaining()) {
            return Err(CdmaError::Overrun {
                reserved: self.reserved,
            });
        }
        for &word in words {
            self.push(word)?;
        }
        Ok(())
    }

    /// Publishes the pushed words to hardware and queues them for reclamation once every
    /// fence in `fences` has expired. Returns the new write position.
    pub fn end(mut self, fences: Vec<Fence>) -> u32 {
        let cdma = self.cdma;
        let mut state = lock(&cdma.state);
        let put = self.start.wrapping_add(self.written);
        state.put = put;
        state.open = false;
        state.sync_queue.push_back(SyncRecord {
            fences,
            first: self.start,
            words: self.written,
        });
        // Kick under the state lock so hardware sees write pointers in commit order.
        cdma.hw.kick(&cdma.ring, put);
        self.committed = true;
        drop(state);

        tracing::trace!(ring = %cdma.name, start = self.start, words = self.written, put, "kicked command ring");
        cdma.changed.notify_all();
        put
    }
}

impl Drop for CdmaTxn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = lock(&self.cdma.state);
        state.open = false;
        drop(state);
        if self.written > 0 {
            tracing::debug!(
                ring = %self.cdma.name,
                discarded = self.written,
                "rolled back command ring transaction"
            );
        }
        self.cdma.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{NullCdmaHw, RecordingCdmaHw};
    use pretty_assertions::assert_eq;

    fn cdma_with(capacity: u32, hw: Arc<dyn CdmaHw>) -> (Arc<SyncptRegistry>, Cdma) {
        let registry = Arc::new(SyncptRegistry::new(4));
        let cdma = Cdma::new("test", capacity, hw, registry.clone()).unwrap();
        (registry, cdma)
    }

    #[test]
    fn begin_push_end_kicks_hardware() {
        let hw = Arc::new(RecordingCdmaHw::new());
        let (_registry, cdma) = cdma_with(16, hw.clone());

        let mut txn = cdma.begin(3).unwrap();
        txn.push(0x11).unwrap();
        txn.push_all(&[0x22, 0x33]).unwrap();
        assert_eq!(txn.end(Vec::new()), 3);

        assert_eq!(hw.kicks(), vec![3]);
        assert_eq!(cdma.dump(0, 3), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn second_begin_while_open_is_busy() {
        let (_registry, cdma) = cdma_with(16, Arc::new(NullCdmaHw::new()));
        let _txn = cdma.begin(1).unwrap();
        assert_eq!(cdma.begin(1).unwrap_err(), CdmaError::Busy);
    }

    #[test]
    fn oversized_transaction_is_rejected_up_front() {
        let (_registry, cdma) = cdma_with(8, Arc::new(NullCdmaHw::new()));
        assert_eq!(
            cdma.begin(9).unwrap_err(),
            CdmaError::RingOverflow {
                words: 9,
                capacity: 8
            }
        );
        assert!(!cdma.snapshot().open);
    }

    #[test]
    fn push_past_reservation_is_an_overrun() {
        let (_registry, cdma) = cdma_with(8, Arc::new(NullCdmaHw::new()));
        let mut txn = cdma.begin(1).unwrap();
        txn.push(1).unwrap();
        assert_eq!(txn.push(2).unwrap_err(), CdmaError::Overrun { reserved: 1 });
        assert_eq!(
            txn.push_all(&[3]).unwrap_err(),
            CdmaError::Overrun { reserved: 1 }
        );
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let hw = Arc::new(RecordingCdmaHw::new());
        let (_registry, cdma) = cdma_with(8, hw.clone());
        {
            let mut txn = cdma.begin(4).unwrap();
            txn.push(7).unwrap();
        }
        let snap = cdma.snapshot();
        assert!(!snap.open);
        assert_eq!(snap.put, 0);
        assert_eq!(snap.space, 8);
        assert!(hw.kicks().is_empty());
        assert!(cdma.begin(8).is_ok());
    }

    #[test]
    fn update_reclaims_once_fences_expire() {
        let (registry, cdma) = cdma_with(8, Arc::new(NullCdmaHw::new()));
        let sp = registry.get(1).unwrap();
        let end = sp.increment_max(1);

        let mut txn = cdma.begin(6).unwrap();
        txn.push_all(&[0; 6]).unwrap();
        txn.end(vec![Fence::new(1, end)]);
        assert_eq!(cdma.space(), 2);
        assert_eq!(cdma.update(), 0);

        sp.advance_current(end);
        assert_eq!(cdma.update(), 1);
        assert_eq!(cdma.space(), 8);
        assert_eq!(cdma.in_flight(), 0);
    }

    #[test]
    fn records_retire_in_order() {
        let (registry, cdma) = cdma_with(16, Arc::new(NullCdmaHw::new()));
        let a = registry.get(1).unwrap();
        let b = registry.get(2).unwrap();
        let a_end = a.increment_max(1);
        let b_end = b.increment_max(1);

        for fence in [Fence::new(1, a_end), Fence::new(2, b_end)] {
            let mut txn = cdma.begin(2).unwrap();
            txn.push_all(&[0, 0]).unwrap();
            txn.end(vec![fence]);
        }

        // The second record's fence expiring first does not let it jump the queue.
        b.advance_current(b_end);
        assert_eq!(cdma.update(), 0);
        a.advance_current(a_end);
        assert_eq!(cdma.update(), 2);
    }

    #[test]
    fn flush_times_out_while_work_is_pending() {
        let (registry, cdma) = cdma_with(8, Arc::new(NullCdmaHw::new()));
        let end = registry.get(1).unwrap().increment_max(1);
        let mut txn = cdma.begin(1).unwrap();
        txn.push(0).unwrap();
        txn.end(vec![Fence::new(1, end)]);

        assert_eq!(
            cdma.flush(Duration::from_millis(5)).unwrap_err(),
            CdmaError::Timeout
        );
        registry.get(1).unwrap().advance_current(end);
        cdma.flush(Duration::from_millis(5)).unwrap();
    }

    #[test]
    fn full_ring_blocks_until_space_is_reclaimed() {
        let registry = Arc::new(SyncptRegistry::new(4));
        let cdma = Arc::new(
            Cdma::new("blocking", 4, Arc::new(NullCdmaHw::new()), registry.clone()).unwrap(),
        );
        let end = registry.get(1).unwrap().increment_max(1);
        let mut txn = cdma.begin(4).unwrap();
        txn.push_all(&[0; 4]).unwrap();
        txn.end(vec![Fence::new(1, end)]);

        let waiter = {
            let cdma = cdma.clone();
            std::thread::spawn(move || {
                let mut txn = cdma.begin(2).unwrap();
                txn.push_all(&[0xa, 0xb]).unwrap();
                txn.end(Vec::new())
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cdma.put(), 4);
        registry.get(1).unwrap().advance_current(end);
        assert_eq!(waiter.join().unwrap(), 6);
        assert_eq!(cdma.dump(4, 2), vec![0xa, 0xb]);
    }
}
