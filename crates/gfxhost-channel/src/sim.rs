//! A software model of a channel's command processor.
//!
//! [`SimEngine`] plugs into a channel as its [`CdmaHw`]. It fetches words the ring has
//! published, follows gathers into buffer memory, blocks on host waits until the syncpoint
//! has expired, and turns `INCR_SYNCPT` writes into syncpoint increments that fire
//! completion actions. It can be stepped by hand for deterministic tests or driven by a
//! [`SimWorker`] thread.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gfxhost_cdma::opcodes::{self, Opcode, HOST_CLASS_ID};
use gfxhost_cdma::{CdmaHw, RingMemory};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::host::{Host, HostResources};
use crate::lock;
use crate::mem::BufferHandle;

/// How long an idle or blocked worker sleeps before looking again.
const WORKER_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Something the engine did, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEvent {
    SetClass { class: u32 },
    Wait { syncpt_id: u32, thresh: u32 },
    LoadBase { base: u32, value: u32 },
    Incr { syncpt_id: u32, value: u32 },
    Gather { iova: u32, words: u32 },
    RegWrite { class: u32, offset: u32, value: u32 },
    Fault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One op-code was executed.
    Executed,
    /// The next op-code waits for a syncpoint that has not been reached.
    Blocked { syncpt_id: u32, thresh: u32 },
    /// Nothing left to fetch.
    Idle,
    /// The engine hit a malformed stream and stopped.
    Faulted,
}

#[derive(Debug)]
struct GatherCursor {
    buffer: BufferHandle,
    index: u32,
    end: u32,
}

#[derive(Default)]
struct SimState {
    ring: Option<Arc<RingMemory>>,
    get: u32,
    put: u32,
    gather: Option<GatherCursor>,
    class: u32,
    /// Register writes of the current op-code already performed before it blocked.
    done_writes: usize,
    payload_32: u32,
    wait_bases: BTreeMap<u32, u32>,
    fault: Option<String>,
}

enum Fetched {
    Op(Opcode, Vec<u32>),
    Incomplete,
    Empty,
}

impl SimState {
    fn fetch(&self) -> Result<Fetched, String> {
        if let Some(cursor) = &self.gather {
            let avail = cursor.end - cursor.index;
            if avail == 0 {
                return Ok(Fetched::Empty);
            }
            let words = cursor
                .buffer
                .read_words(cursor.index, 1)
                .map_err(|e| e.to_string())?;
            let op = Opcode::decode(words[0]);
            let payload = op.payload_words();
            if payload >= avail {
                return Err(format!("op-code {:#010x} runs past the end of its gather", words[0]));
            }
            let payload = cursor
                .buffer
                .read_words(cursor.index + 1, payload)
                .map_err(|e| e.to_string())?;
            return Ok(Fetched::Op(op, payload));
        }

        let Some(ring) = &self.ring else {
            return Ok(Fetched::Empty);
        };
        let avail = self.put.wrapping_sub(self.get);
        if avail == 0 {
            return Ok(Fetched::Empty);
        }
        let op = Opcode::decode(ring.read(self.get));
        let payload = op.payload_words();
        if payload >= avail {
            return Ok(Fetched::Incomplete);
        }
        let payload = ring.snapshot(self.get.wrapping_add(1), payload);
        Ok(Fetched::Op(op, payload))
    }

    fn consume(&mut self, words: u32) {
        match &mut self.gather {
            Some(cursor) => {
                cursor.index += words;
                if cursor.index == cursor.end {
                    self.gather = None;
                }
            }
            None => self.get = self.get.wrapping_add(words),
        }
    }
}

enum Action {
    Writes(Vec<(u32, u32)>),
    Gather { iova: u32, words: u32 },
}

pub struct SimEngine {
    name: String,
    resources: HostResources,
    state: Mutex<SimState>,
    kicked: Condvar,
    log: Mutex<Vec<HwEvent>>,
}

impl fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SimEngine")
            .field("name", &self.name)
            .field("get", &state.get)
            .field("put", &state.put)
            .field("class", &state.class)
            .field("fault", &state.fault)
            .finish()
    }
}

impl CdmaHw for SimEngine {
    fn kick(&self, ring: &Arc<RingMemory>, put: u32) {
        let mut state = lock(&self.state);
        if state.ring.is_none() {
            state.ring = Some(ring.clone());
        }
        state.put = put;
        drop(state);
        self.kicked.notify_all();
    }
}

impl SimEngine {
    pub fn new(name: impl Into<String>, resources: &HostResources) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            resources: resources.clone(),
            state: Mutex::new(SimState::default()),
            kicked: Condvar::new(),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution log so far.
    pub fn events(&self) -> Vec<HwEvent> {
        lock(&self.log).clone()
    }

    pub fn take_events(&self) -> Vec<HwEvent> {
        std::mem::take(&mut *lock(&self.log))
    }

    /// Value last loaded into wait base `base`.
    pub fn wait_base(&self, base: u32) -> Option<u32> {
        lock(&self.state).wait_bases.get(&base).copied()
    }

    pub fn fault(&self) -> Option<String> {
        lock(&self.state).fault.clone()
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.gather.is_none() && state.get == state.put
    }

    /// Executes at most one op-code.
    pub fn step(&self) -> StepOutcome {
        let mut fired = Vec::new();
        let outcome = {
            let mut state = lock(&self.state);
            self.step_locked(&mut state, &mut fired)
        };

        // Completion actions run without the engine lock: they reach back into the ring.
        for (id, value) in fired {
            self.resources.intr.on_syncpoint_advanced(id, value);
        }
        outcome
    }

    fn step_locked(&self, state: &mut SimState, fired: &mut Vec<(u32, u32)>) -> StepOutcome {
        if state.fault.is_some() {
            return StepOutcome::Faulted;
        }

        let (op, payload) = match state.fetch() {
            Ok(Fetched::Op(op, payload)) => (op, payload),
            Ok(Fetched::Empty) | Ok(Fetched::Incomplete) => return StepOutcome::Idle,
            Err(msg) => return self.raise_fault(state, msg),
        };

        let action = match op {
            Opcode::SetClass { class, offset, mask } => {
                state.class = class;
                // A resumed op-code has already been logged.
                if state.done_writes == 0 {
                    self.log(HwEvent::SetClass { class });
                }
                Action::Writes(masked_writes(offset, mask, &payload))
            }
            Opcode::Incr { offset, .. } => Action::Writes(
                payload
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| (offset + i as u32, v))
                    .collect(),
            ),
            Opcode::NonIncr { offset, .. } => {
                Action::Writes(payload.iter().map(|&v| (offset, v)).collect())
            }
            Opcode::Mask { offset, mask } => Action::Writes(masked_writes(offset, mask, &payload)),
            Opcode::Imm { offset, value } => Action::Writes(vec![(offset, value)]),
            Opcode::Gather {
                insert: false,
                count,
                ..
            } => Action::Gather {
                iova: payload[0],
                words: count,
            },
            Opcode::Gather {
                offset,
                insert: true,
                incr,
                count,
            } => match self.read_memory(payload[0], count) {
                Ok(data) => Action::Writes(
                    data.into_iter()
                        .enumerate()
                        .map(|(i, v)| (if incr { offset + i as u32 } else { offset }, v))
                        .collect(),
                ),
                Err(msg) => return self.raise_fault(state, msg),
            },
            Opcode::Unknown(word) => {
                return self.raise_fault(state, format!("unknown op-code {word:#010x}"))
            }
        };

        match action {
            Action::Writes(writes) => {
                while state.done_writes < writes.len() {
                    let (offset, value) = writes[state.done_writes];
                    if let Some(blocked) = self.reg_write(state, offset, value, fired) {
                        return blocked;
                    }
                    state.done_writes += 1;
                }
            }
            Action::Gather { iova, words } => {
                if state.gather.is_some() {
                    return self.raise_fault(state, "gather inside a gather".into());
                }
                let Some((buffer, index)) = self.resources.memory.resolve(iova) else {
                    return self.raise_fault(state, format!("gather from unmapped address {iova:#x}"));
                };
                if u64::from(index) + u64::from(words) > u64::from(buffer.len_words()) {
                    return self.raise_fault(state, format!("gather at {iova:#x} runs past its buffer"));
                }
                self.log(HwEvent::Gather { iova, words });
                state.consume(1 + payload.len() as u32);
                state.done_writes = 0;
                if words > 0 {
                    state.gather = Some(GatherCursor {
                        buffer,
                        index,
                        end: index + words,
                    });
                }
                return StepOutcome::Executed;
            }
        }

        state.done_writes = 0;
        state.consume(1 + payload.len() as u32);
        StepOutcome::Executed
    }

    /// Performs one register write. Returns `Some` if it is a wait that cannot complete yet.
    fn reg_write(
        &self,
        state: &mut SimState,
        offset: u32,
        value: u32,
        fired: &mut Vec<(u32, u32)>,
    ) -> Option<StepOutcome> {
        let registry = &self.resources.registry;

        if offset == opcodes::REG_INCR_SYNCPT {
            let (_cond, id) = opcodes::decode_host_incr(value);
            match registry.get(id) {
                Ok(sp) => {
                    let value = sp.increment_current(1);
                    self.log(HwEvent::Incr {
                        syncpt_id: id,
                        value,
                    });
                    fired.push((id, value));
                }
                Err(_) => {
                    tracing::warn!(engine = %self.name, syncpt_id = id, "increment of unknown syncpoint");
                }
            }
            return None;
        }

        if state.class != HOST_CLASS_ID {
            self.log(HwEvent::RegWrite {
                class: state.class,
                offset,
                value,
            });
            return None;
        }

        let wait = match offset {
            opcodes::REG_WAIT_SYNCPT => {
                let (id, thresh) = opcodes::decode_host_wait(value);
                let current = registry.get(id).map(|sp| sp.read_current()).unwrap_or(0);
                Some((id, opcodes::extend_wait_thresh(current, thresh)))
            }
            opcodes::REG_WAIT_SYNCPT_32 => Some((value, state.payload_32)),
            opcodes::REG_LOAD_SYNCPT_PAYLOAD_32 => {
                state.payload_32 = value;
                None
            }
            opcodes::REG_LOAD_SYNCPT_BASE => {
                let (base, value) = opcodes::decode_host_wait(value);
                state.wait_bases.insert(base, value);
                self.log(HwEvent::LoadBase { base, value });
                None
            }
            _ => {
                self.log(HwEvent::RegWrite {
                    class: state.class,
                    offset,
                    value,
                });
                None
            }
        };

        let (id, thresh) = wait?;
        let expired = match registry.get(id) {
            Ok(sp) => sp.is_expired(thresh),
            Err(_) => {
                tracing::warn!(engine = %self.name, syncpt_id = id, "wait on unknown syncpoint");
                true
            }
        };
        if !expired {
            return Some(StepOutcome::Blocked {
                syncpt_id: id,
                thresh,
            });
        }
        self.log(HwEvent::Wait {
            syncpt_id: id,
            thresh,
        });
        None
    }

    fn read_memory(&self, iova: u32, words: u32) -> Result<Vec<u32>, String> {
        let (buffer, index) = self
            .resources
            .memory
            .resolve(iova)
            .ok_or_else(|| format!("read from unmapped address {iova:#x}"))?;
        buffer.read_words(index, words).map_err(|e| e.to_string())
    }

    fn raise_fault(&self, state: &mut SimState, msg: String) -> StepOutcome {
        tracing::error!(engine = %self.name, get = state.get, "{msg}");
        self.log(HwEvent::Fault(msg.clone()));
        state.fault = Some(msg);
        StepOutcome::Faulted
    }

    fn log(&self, event: HwEvent) {
        lock(&self.log).push(event);
    }

    /// Steps until the engine is idle, blocked or faulted, or `max_steps` op-codes ran.
    pub fn run_until_blocked(&self, max_steps: usize) -> StepOutcome {
        for _ in 0..max_steps {
            match self.step() {
                StepOutcome::Executed => {}
                other => return other,
            }
        }
        StepOutcome::Executed
    }

    fn wait_for_kick<'a>(&self, state: MutexGuard<'a, SimState>) -> MutexGuard<'a, SimState> {
        match self.kicked.wait_timeout(state, WORKER_POLL_PERIOD) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Starts a background thread that keeps stepping the engine until the returned worker
    /// is dropped.
    pub fn spawn_worker(self: &Arc<Self>) -> std::io::Result<SimWorker> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = self.clone();
        let handle = thread::Builder::new()
            .name(format!("sim-{}", self.name))
            .spawn({
                let stop = stop.clone();
                move || engine.worker_loop(&stop)
            })?;
        Ok(SimWorker {
            engine: self.clone(),
            stop,
            handle: Some(handle),
        })
    }

    fn worker_loop(&self, stop: &AtomicBool) {
        tracing::debug!(engine = %self.name, "simulator worker started");
        while !stop.load(Ordering::Acquire) {
            match self.step() {
                StepOutcome::Executed => continue,
                StepOutcome::Blocked { .. } | StepOutcome::Idle | StepOutcome::Faulted => {
                    let state = lock(&self.state);
                    drop(self.wait_for_kick(state));
                }
            }
        }
        tracing::debug!(engine = %self.name, "simulator worker stopped");
    }
}

fn masked_writes(offset: u32, mask: u32, payload: &[u32]) -> Vec<(u32, u32)> {
    (0..6)
        .filter(|bit| mask & (1 << bit) != 0)
        .zip(payload)
        .map(|(bit, &v)| (offset + bit, v))
        .collect()
}

/// Background thread driving a [`SimEngine`]; stops and joins on drop.
pub struct SimWorker {
    engine: Arc<SimEngine>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for SimWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimWorker")
            .field("engine", &self.engine.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl SimWorker {
    pub fn engine(&self) -> &Arc<SimEngine> {
        &self.engine
    }
}

impl Drop for SimWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.engine.kicked.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(engine = %self.engine.name, "simulator worker panicked");
            }
        }
    }
}

/// Builds a host whose every channel is backed by its own [`SimEngine`], returned in
/// channel order.
pub fn simulated_host(config: HostConfig) -> Result<(Host, Vec<Arc<SimEngine>>), HostError> {
    let mut engines = Vec::with_capacity(config.channels.len());
    let host = Host::with_hw(config, |_, channel, resources| {
        let engine = SimEngine::new(channel.name.clone(), resources);
        engines.push(engine.clone());
        engine as Arc<dyn CdmaHw>
    })?;
    Ok((host, engines))
}
