//! The per-channel submission engine.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use gfxhost_cdma::{Cdma, CdmaError, CdmaTxn, HostGeneration, HostOps};
use gfxhost_syncpt::{Fence, SyncptError};

use crate::error::{Result, SubmitError};
use crate::host::HostResources;
use crate::job::{self, CompletionFn, Job, JobDone, JobFlags, JobLimits, PinnedJob, ValidationContext};
use crate::lock;
use crate::stats::ChannelStats;

/// How often a thread waiting for the submission lock checks its [`Interrupt`].
const LOCK_POLL_PERIOD: Duration = Duration::from_millis(5);

/// Cancellation flag for a submitter waiting on a busy channel.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct SubmitLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl SubmitLock {
    /// Takes the lock, giving up with [`SubmitError::Interrupted`] if `interrupt` is raised
    /// while waiting.
    fn lock(&self, interrupt: &Interrupt) -> Result<SubmitGuard<'_>> {
        let mut held = lock(&self.held);
        while *held {
            if interrupt.is_raised() {
                return Err(SubmitError::Interrupted);
            }
            held = match self.released.wait_timeout(held, LOCK_POLL_PERIOD) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *held = true;
        Ok(SubmitGuard { lock: self })
    }
}

struct SubmitGuard<'a> {
    lock: &'a SubmitLock,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.lock.held) = false;
        self.lock.released.notify_one();
    }
}

/// Something that went wrong after the job was already committed to hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitWarning {
    /// No completion action could be armed for `fence`. The job still runs, but its buffers
    /// stay pinned and its completion callback never runs.
    ActionArmFailure { fence: Fence, error: SyncptError },
    /// A CPU increment for a null-kickoff job failed.
    CpuIncrFailure { syncpt_id: u32, error: SyncptError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub channel_id: u32,
    /// One fence per syncpoint the job increments: the value it reaches once the job is done.
    pub fences: Vec<Fence>,
    /// Ring position of the job's first word.
    pub ring_start: u32,
    pub words: u32,
    pub warnings: Vec<SubmitWarning>,
}

impl SubmitReceipt {
    pub fn fence(&self, syncpt_id: u32) -> Option<Fence> {
        self.fences.iter().copied().find(|f| f.id == syncpt_id)
    }

    pub fn end_value(&self, syncpt_id: u32) -> Option<u32> {
        self.fence(syncpt_id).map(|f| f.thresh)
    }
}

/// Shared by all completion actions of one job; the last one to fire finishes the job.
struct JobCompletion {
    channel_id: u32,
    fences: Vec<Fence>,
    remaining: AtomicUsize,
    pins: Mutex<Option<PinnedJob>>,
    on_complete: Mutex<Option<CompletionFn>>,
    cdma: Arc<Cdma>,
    stats: Arc<ChannelStats>,
}

impl JobCompletion {
    fn fence_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        drop(lock(&self.pins).take());
        self.cdma.update();
        self.stats.record_completion();
        tracing::trace!(channel_id = self.channel_id, fences = ?self.fences, "job complete");

        let on_complete = lock(&self.on_complete).take();
        if let Some(on_complete) = on_complete {
            on_complete(JobDone {
                channel_id: self.channel_id,
                fences: self.fences.clone(),
            });
        }
    }
}

pub(crate) struct ChannelInit {
    pub id: u32,
    pub name: String,
    pub class_id: u32,
    pub cdma: Arc<Cdma>,
    pub generation: HostGeneration,
    pub resources: HostResources,
    pub limits: JobLimits,
    pub wait_bases: u32,
}

/// One hardware execution channel: a command ring plus the lock that serializes submitters.
pub struct Channel {
    id: u32,
    name: String,
    class_id: u32,
    cdma: Arc<Cdma>,
    ops: &'static dyn HostOps,
    resources: HostResources,
    limits: JobLimits,
    wait_bases: u32,
    submit_lock: SubmitLock,
    stats: Arc<ChannelStats>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class_id", &format_args!("{:#x}", self.class_id))
            .field("generation", &self.ops.generation())
            .field("cdma", &self.cdma)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(init: ChannelInit) -> Self {
        Self {
            id: init.id,
            name: init.name,
            class_id: init.class_id,
            cdma: init.cdma,
            ops: init.generation.ops(),
            resources: init.resources,
            limits: init.limits,
            wait_bases: init.wait_bases,
            submit_lock: SubmitLock::default(),
            stats: Arc::new(ChannelStats::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn generation(&self) -> HostGeneration {
        self.ops.generation()
    }

    pub fn cdma(&self) -> &Arc<Cdma> {
        &self.cdma
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    /// Submits `job`, waiting as long as necessary for the channel.
    pub fn submit(&self, job: Job) -> Result<SubmitReceipt> {
        self.submit_with(job, &Interrupt::new())
    }

    /// Submits `job`, giving up if `interrupt` is raised while waiting for the channel lock.
    ///
    /// The job's completion callback runs on whichever thread observes the job finishing and
    /// must not block on submissions to this channel.
    pub fn submit_with(&self, job: Job, interrupt: &Interrupt) -> Result<SubmitReceipt> {
        let gathers = job.gathers.len();
        let result = self.submit_inner(job, interrupt);
        match &result {
            Ok(receipt) => self.stats.record_submit(receipt.words, gathers),
            Err(err) => {
                self.stats.record_failure(err);
                tracing::debug!(channel = %self.name, error = %err, "submit failed");
            }
        }
        result
    }

    fn submit_inner(&self, mut job: Job, interrupt: &Interrupt) -> Result<SubmitReceipt> {
        let registry = &self.resources.registry;
        let intr = &self.resources.intr;

        job.validate(&ValidationContext {
            registry,
            class_id: self.class_id,
            limits: self.limits,
            ops: self.ops,
            wait_bases: self.wait_bases,
        })?;

        let words = job.ring_words(self.ops);
        let capacity = self.cdma.capacity();
        if words > capacity {
            return Err(SubmitError::RingOverflow { words, capacity });
        }

        let primary = job.incrs[0].id;
        tracing::debug!(
            channel = %self.name,
            syncpt_id = primary,
            max = registry.get(primary)?.read_max(),
            words,
            gathers = job.gathers.len(),
            serialize = job.flags.contains(JobFlags::SERIALIZE),
            "submit"
        );

        let pinned = job.pin(registry)?;

        let guard = self.submit_lock.lock(interrupt)?;

        for incr in &job.incrs {
            intr.reserve(incr.id, 1)?;
        }

        let null_kickoff = job.flags.contains(JobFlags::NULL_KICKOFF);
        let (fences, ring_start) = if null_kickoff {
            // Nothing may reach the ring: the CPU increments below retire the job at once,
            // and its words would be reclaimed before hardware fetched them.
            (self.reserve_increments(&job)?, self.cdma.put())
        } else {
            self.emit(&job, words)?
        };

        let completion = Arc::new(JobCompletion {
            channel_id: self.id,
            fences: fences.clone(),
            remaining: AtomicUsize::new(fences.len()),
            pins: Mutex::new(Some(pinned)),
            on_complete: Mutex::new(job.on_complete.take()),
            cdma: self.cdma.clone(),
            stats: self.stats.clone(),
        });

        let mut warnings = Vec::new();
        for &fence in &fences {
            let completion = completion.clone();
            if let Err(error) = intr.arm(
                fence.id,
                fence.thresh,
                Box::new(move |_| completion.fence_done()),
            ) {
                tracing::error!(
                    channel = %self.name,
                    syncpt_id = fence.id,
                    thresh = fence.thresh,
                    %error,
                    "failed to arm completion action; job resources stay pinned"
                );
                self.stats.record_arm_failure();
                warnings.push(SubmitWarning::ActionArmFailure { fence, error });
            }
        }
        drop(guard);

        if null_kickoff {
            for incr in &job.incrs {
                if let Err(error) = intr.increment(incr.id, incr.count) {
                    tracing::error!(channel = %self.name, syncpt_id = incr.id, %error, "null kickoff increment failed");
                    warnings.push(SubmitWarning::CpuIncrFailure {
                        syncpt_id: incr.id,
                        error,
                    });
                }
            }
        }

        Ok(SubmitReceipt {
            channel_id: self.id,
            fences,
            ring_start,
            words,
            warnings,
        })
    }

    /// Writes the job into the ring and reserves its syncpoint increments. Returns the job's
    /// fences and the ring position of its first word.
    fn emit(&self, job: &Job, words: u32) -> Result<(Vec<Fence>, u32)> {
        let registry = &self.resources.registry;
        let mut txn = self.cdma.begin(words)?;

        if job.flags.contains(JobFlags::SERIALIZE) {
            for incr in &job.incrs {
                let thresh = registry.get(incr.id)?.read_max();
                txn.push_all(self.ops.wait_syncpt(incr.id, thresh).as_slice())?;
                tracing::trace!(channel = %self.name, syncpt_id = incr.id, thresh, "serialize wait");
            }
        }

        let with_base = job.incrs.iter().filter_map(|i| i.wait_base.map(|b| (i.id, b)));
        if self.ops.has_wait_bases() {
            for (id, base) in with_base {
                let value = registry.get(id)?.read_current();
                txn.push_all(self.ops.load_syncpt_base(base, value).as_slice())?;
                tracing::trace!(channel = %self.name, syncpt_id = id, base, value, "load wait base");
            }
        } else if with_base.count() > 0 {
            tracing::debug!(channel = %self.name, "hardware has no wait bases; ignoring");
        }

        let fences = self.reserve_increments(job)?;

        if let Err(err) = self.emit_gathers(&mut txn, job) {
            tracing::error!(
                channel = %self.name,
                fences = ?fences,
                error = %err,
                "syncpoint max already advanced but the command stream is incomplete; \
                 these syncpoints will not reach their promised values"
            );
            return Err(err.into());
        }

        let ring_start = txn.start();
        txn.end(fences.clone());
        Ok((fences, ring_start))
    }

    fn reserve_increments(&self, job: &Job) -> Result<Vec<Fence>> {
        let mut fences = Vec::with_capacity(job.incrs.len());
        for incr in &job.incrs {
            let sp = self.resources.registry.get(incr.id)?;
            let end = sp.increment_max(incr.count);
            tracing::debug!(
                channel = %self.name,
                syncpt_id = incr.id,
                base = end.wrapping_sub(incr.count),
                end,
                "reserved syncpoint increments"
            );
            fences.push(Fence::new(incr.id, end));
        }
        Ok(fences)
    }

    fn emit_gathers(&self, txn: &mut CdmaTxn<'_>, job: &Job) -> std::result::Result<(), CdmaError> {
        let mut words = Vec::with_capacity(3);
        for gather in &job.gathers {
            if let Some(fence) = gather.pre_fence {
                txn.push_all(self.ops.wait_syncpt(fence.id, fence.thresh).as_slice())?;
            }
            words.clear();
            job::emit_gather_words(gather, &mut words);
            txn.push_all(&words)?;
            tracing::trace!(
                channel = %self.name,
                buffer = gather.buffer.id(),
                iova = gather.buffer.iova().wrapping_add(gather.offset),
                words = gather.words,
                class = ?gather.class_id,
                "gather"
            );
        }
        Ok(())
    }

    /// Waits until everything submitted to this channel has completed.
    pub fn flush(&self, timeout: Duration) -> std::result::Result<(), CdmaError> {
        self.cdma.flush(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn interrupt_aborts_a_blocked_lock() {
        let lock = Arc::new(SubmitLock::default());
        let held = lock.lock(&Interrupt::new()).unwrap();

        let interrupt = Interrupt::new();
        let waiter = {
            let lock = lock.clone();
            let interrupt = interrupt.clone();
            thread::spawn(move || lock.lock(&interrupt).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        interrupt.raise();
        assert_eq!(waiter.join().unwrap(), Err(SubmitError::Interrupted));

        drop(held);
        assert!(lock.lock(&interrupt).is_ok());
    }

    #[test]
    fn released_lock_wakes_waiter() {
        let lock = Arc::new(SubmitLock::default());
        let held = lock.lock(&Interrupt::new()).unwrap();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.lock(&Interrupt::new()).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(10));
        drop(held);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn receipt_lookup_by_syncpoint() {
        let receipt = SubmitReceipt {
            channel_id: 0,
            fences: vec![Fence::new(1, 4), Fence::new(3, 9)],
            ring_start: 0,
            words: 0,
            warnings: Vec::new(),
        };
        assert_eq!(receipt.end_value(3), Some(9));
        assert_eq!(receipt.fence(2), None);
    }
}
