//! Job description, validation and pinning.
//!
//! A [`Job`] is built once with [`JobBuilder`] and never changes afterwards. Before a job is
//! submitted it is validated against the channel and registry, then pinned: every buffer it
//! references gets a pin, relocations are written into command buffers, and wait checks whose
//! threshold already passed are neutralised.

use core::fmt;

use bitflags::bitflags;
use gfxhost_cdma::opcodes::{self, HOST_CLASS_ID};
use gfxhost_cdma::HostOps;
use gfxhost_syncpt::{Fence, SyncptRegistry, SYNCPT_RESERVED};

use crate::error::JobError;
use crate::mem::{BufferHandle, PinGuard};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobFlags: u32 {
        /// Wait for all prior work on the job's syncpoints before running any gather.
        const SERIALIZE = 1 << 0;
        /// Skip the ring entirely; the CPU performs the job's increments after submission.
        const NULL_KICKOFF = 1 << 1;
    }
}

/// A fragment of a command buffer executed by the channel.
#[derive(Debug, Clone)]
pub struct Gather {
    pub buffer: BufferHandle,
    /// Byte offset into `buffer`; must be word aligned.
    pub offset: u32,
    pub words: u32,
    /// Hardware waits for this fence before fetching the gather.
    pub pre_fence: Option<Fence>,
    /// Class selected before the gather runs.
    pub class_id: Option<u32>,
}

impl Gather {
    pub fn new(buffer: &BufferHandle, offset: u32, words: u32) -> Self {
        Self {
            buffer: buffer.clone(),
            offset,
            words,
            pre_fence: None,
            class_id: None,
        }
    }

    pub fn after(mut self, fence: Fence) -> Self {
        self.pre_fence = Some(fence);
        self
    }

    pub fn class(mut self, class_id: u32) -> Self {
        self.class_id = Some(class_id);
        self
    }

    fn address(&self) -> u32 {
        self.buffer.iova().wrapping_add(self.offset)
    }
}

/// Increments the job promises to perform on one syncpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncptIncr {
    pub id: u32,
    pub count: u32,
    pub wait_base: Option<u32>,
}

/// Patches a command-buffer word with the device address of another buffer.
#[derive(Debug, Clone)]
pub struct Reloc {
    pub cmdbuf: BufferHandle,
    /// Byte offset of the word to patch.
    pub cmdbuf_offset: u32,
    pub target: BufferHandle,
    pub target_offset: u32,
    pub shift: u32,
}

/// Names a host wait inside a command buffer that may be stale by the time the job runs.
#[derive(Debug, Clone)]
pub struct WaitCheck {
    pub buffer: BufferHandle,
    /// Byte offset of the wait payload word.
    pub offset: u32,
    pub syncpt_id: u32,
    pub thresh: u32,
}

/// Passed to a job's completion callback once every syncpoint reached its end value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDone {
    pub channel_id: u32,
    pub fences: Vec<Fence>,
}

pub type CompletionFn = Box<dyn FnOnce(JobDone) + Send + 'static>;

pub struct Job {
    pub(crate) gathers: Vec<Gather>,
    pub(crate) incrs: Vec<SyncptIncr>,
    pub(crate) relocs: Vec<Reloc>,
    pub(crate) wait_checks: Vec<WaitCheck>,
    pub(crate) flags: JobFlags,
    pub(crate) on_complete: Option<CompletionFn>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("gathers", &self.gathers)
            .field("incrs", &self.incrs)
            .field("relocs", &self.relocs.len())
            .field("wait_checks", &self.wait_checks.len())
            .field("flags", &self.flags)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Limits a channel applies to incoming jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    /// Combined limit on gathers and relocations.
    pub max_gathers: usize,
    pub max_wait_checks: usize,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_gathers: 512,
            max_wait_checks: 64,
        }
    }
}

pub(crate) struct ValidationContext<'a> {
    pub registry: &'a SyncptRegistry,
    pub class_id: u32,
    pub limits: JobLimits,
    pub ops: &'a dyn HostOps,
    pub wait_bases: u32,
}

fn word_range_ok(buffer: &BufferHandle, offset: u32, words: u32) -> bool {
    if offset % 4 != 0 {
        return false;
    }
    u64::from(offset / 4) + u64::from(words) <= u64::from(buffer.len_words())
}

impl Job {
    pub fn gathers(&self) -> &[Gather] {
        &self.gathers
    }

    pub fn incrs(&self) -> &[SyncptIncr] {
        &self.incrs
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    /// The syncpoint used for tracing the submission.
    pub fn primary_syncpt(&self) -> Option<u32> {
        self.incrs.first().map(|incr| incr.id)
    }

    pub(crate) fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), JobError> {
        if self.incrs.is_empty() {
            return Err(JobError::NoIncrements);
        }

        for (i, incr) in self.incrs.iter().enumerate() {
            if incr.id == SYNCPT_RESERVED {
                return Err(JobError::ReservedSyncpt(incr.id));
            }
            ctx.registry
                .get(incr.id)
                .map_err(|_| JobError::UnknownSyncpt(incr.id))?;
            if incr.count == 0 {
                return Err(JobError::ZeroIncrement { id: incr.id });
            }
            if self.incrs[..i].iter().any(|prev| prev.id == incr.id) {
                return Err(JobError::DuplicateSyncpt(incr.id));
            }
            if let Some(base) = incr.wait_base {
                if ctx.ops.has_wait_bases() && base >= ctx.wait_bases {
                    return Err(JobError::UnknownWaitBase {
                        base,
                        count: ctx.wait_bases,
                    });
                }
            }
        }

        let count = self.gathers.len() + self.relocs.len();
        if count > ctx.limits.max_gathers {
            return Err(JobError::TooManyGathers {
                count,
                max: ctx.limits.max_gathers,
            });
        }
        if self.wait_checks.len() > ctx.limits.max_wait_checks {
            return Err(JobError::TooManyWaitChecks {
                count: self.wait_checks.len(),
                max: ctx.limits.max_wait_checks,
            });
        }

        for (index, gather) in self.gathers.iter().enumerate() {
            if gather.words == 0 {
                return Err(JobError::EmptyGather { index });
            }
            if gather.words > opcodes::GATHER_MAX_WORDS {
                return Err(JobError::GatherTooLarge {
                    index,
                    words: gather.words,
                    max: opcodes::GATHER_MAX_WORDS,
                });
            }
            if !word_range_ok(&gather.buffer, gather.offset, gather.words) {
                return Err(JobError::GatherOutOfRange { index });
            }
            if let Some(class) = gather.class_id {
                if class != 0 && class != ctx.class_id && class != HOST_CLASS_ID {
                    return Err(JobError::InvalidClass { index, class });
                }
            }
            if let Some(fence) = gather.pre_fence {
                ctx.registry
                    .get(fence.id)
                    .map_err(|_| JobError::UnknownSyncpt(fence.id))?;
            }
        }

        for (index, reloc) in self.relocs.iter().enumerate() {
            if !word_range_ok(&reloc.cmdbuf, reloc.cmdbuf_offset, 1)
                || reloc.target_offset >= reloc.target.len_bytes()
                || reloc.shift >= 32
            {
                return Err(JobError::RelocOutOfRange { index });
            }
        }

        for (index, check) in self.wait_checks.iter().enumerate() {
            if !word_range_ok(&check.buffer, check.offset, 1) {
                return Err(JobError::WaitCheckOutOfRange { index });
            }
            ctx.registry
                .get(check.syncpt_id)
                .map_err(|_| JobError::UnknownSyncpt(check.syncpt_id))?;
        }

        Ok(())
    }

    /// Exact number of ring words [`Channel::submit`](crate::Channel::submit) emits for this
    /// job. Null-kickoff jobs never touch the ring.
    pub fn ring_words(&self, ops: &dyn HostOps) -> u32 {
        if self.flags.contains(JobFlags::NULL_KICKOFF) {
            return 0;
        }
        let mut words = 0;
        if self.flags.contains(JobFlags::SERIALIZE) {
            words += self.incrs.len() as u32 * ops.wait_words();
        }
        if ops.has_wait_bases() {
            let bases = self.incrs.iter().filter(|i| i.wait_base.is_some()).count();
            words += bases as u32 * ops.load_base_words();
        }
        for gather in &self.gathers {
            if gather.pre_fence.is_some() {
                words += ops.wait_words();
            }
            if gather.class_id.is_some() {
                words += 1;
            }
            words += 2;
        }
        words
    }

    /// Pins every referenced buffer and applies relocations and wait checks.
    pub(crate) fn pin(&self, registry: &SyncptRegistry) -> Result<PinnedJob, JobError> {
        let mut pins = Vec::with_capacity(self.gathers.len() + 2 * self.relocs.len());
        for gather in &self.gathers {
            pins.push(gather.buffer.pin());
        }

        for (index, reloc) in self.relocs.iter().enumerate() {
            pins.push(reloc.cmdbuf.pin());
            pins.push(reloc.target.pin());
            let value = reloc.target.iova().wrapping_add(reloc.target_offset) >> reloc.shift;
            reloc
                .cmdbuf
                .write(reloc.cmdbuf_offset / 4, value)
                .map_err(|_| JobError::RelocOutOfRange { index })?;
        }

        let mut patched = 0;
        for (index, check) in self.wait_checks.iter().enumerate() {
            let word_index = check.offset / 4;
            let word = check
                .buffer
                .read(word_index)
                .map_err(|_| JobError::WaitCheckOutOfRange { index })?;

            let expected = opcodes::host_wait_syncpt(check.syncpt_id, check.thresh);
            if word != expected {
                let (id, thresh) = opcodes::decode_host_wait(word);
                tracing::warn!(
                    buffer = check.buffer.id(),
                    offset = check.offset,
                    syncpt_id = check.syncpt_id,
                    thresh = check.thresh,
                    found_id = id,
                    found_thresh = thresh,
                    "wait check does not match command buffer; leaving it alone"
                );
                continue;
            }

            let sp = registry
                .get(check.syncpt_id)
                .map_err(|_| JobError::UnknownSyncpt(check.syncpt_id))?;
            if sp.is_expired(check.thresh) {
                check
                    .buffer
                    .write(word_index, opcodes::host_wait_syncpt(SYNCPT_RESERVED, 0))
                    .map_err(|_| JobError::WaitCheckOutOfRange { index })?;
                patched += 1;
            }
        }
        if patched > 0 {
            tracing::debug!(patched, "patched expired waits");
        }

        Ok(PinnedJob { pins })
    }
}

/// Pins held by a submitted job; dropping it unpins everything.
#[derive(Debug)]
pub struct PinnedJob {
    pins: Vec<PinGuard>,
}

impl PinnedJob {
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

pub(crate) fn emit_gather_words(gather: &Gather, out: &mut Vec<u32>) {
    if let Some(class) = gather.class_id {
        out.push(opcodes::setclass(class, 0, 0));
    }
    out.push(opcodes::gather(gather.words));
    out.push(gather.address());
}

#[derive(Default)]
pub struct JobBuilder {
    gathers: Vec<Gather>,
    incrs: Vec<SyncptIncr>,
    relocs: Vec<Reloc>,
    wait_checks: Vec<WaitCheck>,
    flags: JobFlags,
    on_complete: Option<CompletionFn>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `words` words of `buffer`, starting at byte `offset`.
    pub fn gather(self, buffer: &BufferHandle, offset: u32, words: u32) -> Self {
        self.gather_with(Gather::new(buffer, offset, words))
    }

    pub fn gather_with(mut self, gather: Gather) -> Self {
        self.gathers.push(gather);
        self
    }

    /// Promises `count` increments of syncpoint `id`.
    pub fn incr(mut self, id: u32, count: u32) -> Self {
        self.incrs.push(SyncptIncr {
            id,
            count,
            wait_base: None,
        });
        self
    }

    /// Like [`incr`](Self::incr), also loading the syncpoint's current value into wait base
    /// `base` before the gathers run.
    pub fn incr_with_base(mut self, id: u32, count: u32, base: u32) -> Self {
        self.incrs.push(SyncptIncr {
            id,
            count,
            wait_base: Some(base),
        });
        self
    }

    pub fn reloc(mut self, reloc: Reloc) -> Self {
        self.relocs.push(reloc);
        self
    }

    pub fn wait_check(mut self, check: WaitCheck) -> Self {
        self.wait_checks.push(check);
        self
    }

    pub fn serialize(mut self, serialize: bool) -> Self {
        self.flags.set(JobFlags::SERIALIZE, serialize);
        self
    }

    pub fn null_kickoff(mut self, null_kickoff: bool) -> Self {
        self.flags.set(JobFlags::NULL_KICKOFF, null_kickoff);
        self
    }

    pub fn flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Runs `f` once every syncpoint of the job has reached its end value.
    pub fn on_complete(mut self, f: impl FnOnce(JobDone) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Job {
        Job {
            gathers: self.gathers,
            incrs: self.incrs,
            relocs: self.relocs,
            wait_checks: self.wait_checks,
            flags: self.flags,
            on_complete: self.on_complete,
        }
    }
}
