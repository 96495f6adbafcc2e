//! Command-stream op-code encoding.
//!
//! Every op-code is a single 32-bit word whose top nibble selects the operation. Register
//! offsets are 12 bits wide and counts/masks 16 bits wide. Payload words (register data or a
//! gather address) follow the op-code word in the stream.

/// Class id of the host unit itself; its registers implement waits and base loads.
pub const HOST_CLASS_ID: u32 = 0x1;

/// `INCR_SYNCPT` sits at offset 0 in every class, including the host class.
pub const REG_INCR_SYNCPT: u32 = 0x0;
pub const REG_WAIT_SYNCPT: u32 = 0x8;
pub const REG_WAIT_SYNCPT_BASE: u32 = 0x9;
pub const REG_LOAD_SYNCPT_BASE: u32 = 0xb;
pub const REG_LOAD_SYNCPT_PAYLOAD_32: u32 = 0x4e;
pub const REG_WAIT_SYNCPT_32: u32 = 0x50;

/// `INCR_SYNCPT` conditions.
pub const COND_IMMEDIATE: u32 = 0;
pub const COND_OP_DONE: u32 = 1;

/// Width of the threshold field of a 24-bit host wait payload.
pub const WAIT_THRESH_MASK: u32 = 0x00ff_ffff;

const OP_SETCLASS: u32 = 0;
const OP_INCR: u32 = 1;
const OP_NONINCR: u32 = 2;
const OP_MASK: u32 = 3;
const OP_IMM: u32 = 4;
const OP_GATHER: u32 = 6;

/// Largest word count a single [`gather`] op-code can carry.
pub const GATHER_MAX_WORDS: u32 = 0xffff;

const GATHER_INSERT: u32 = 1 << 15;
const GATHER_INCR: u32 = 1 << 14;

#[inline]
fn op(opcode: u32, offset: u32, low: u32) -> u32 {
    (opcode << 28) | ((offset & 0xfff) << 16) | (low & 0xffff)
}

/// Selects `class` and writes the following payload words to the registers set in `mask`,
/// starting at `offset`.
pub fn setclass(class: u32, offset: u32, mask: u32) -> u32 {
    (OP_SETCLASS << 28) | ((offset & 0xfff) << 16) | ((class & 0x3ff) << 6) | (mask & 0x3f)
}

pub fn incr(offset: u32, count: u32) -> u32 {
    op(OP_INCR, offset, count)
}

pub fn nonincr(offset: u32, count: u32) -> u32 {
    op(OP_NONINCR, offset, count)
}

pub fn mask(offset: u32, mask: u32) -> u32 {
    op(OP_MASK, offset, mask)
}

/// Writes `value` (16 bits) to `offset` without a payload word.
pub fn imm(offset: u32, value: u32) -> u32 {
    op(OP_IMM, offset, value)
}

/// Increments syncpoint `id` from within the currently selected class.
pub fn imm_incr_syncpt(cond: u32, id: u32) -> u32 {
    imm(REG_INCR_SYNCPT, host_incr_syncpt(cond, id))
}

/// Fetches `count` words from the address in the following payload word. `count` must not
/// exceed [`GATHER_MAX_WORDS`].
pub fn gather(count: u32) -> u32 {
    debug_assert!(count <= GATHER_MAX_WORDS);
    op(OP_GATHER, 0, count)
}

/// Like [`gather`], but writes the fetched words to `offset` instead of executing them.
pub fn gather_insert(offset: u32, incr: bool, count: u32) -> u32 {
    let incr = if incr { GATHER_INCR } else { 0 };
    op(OP_GATHER, offset, GATHER_INSERT | incr | (count & 0x3fff))
}

/// A no-op: a non-incrementing write of zero words.
pub fn nop() -> u32 {
    nonincr(0, 0)
}

pub fn host_wait_syncpt(id: u32, thresh: u32) -> u32 {
    ((id & 0xff) << 24) | (thresh & WAIT_THRESH_MASK)
}

pub fn host_load_syncpt_base(base: u32, value: u32) -> u32 {
    ((base & 0xff) << 24) | (value & WAIT_THRESH_MASK)
}

pub fn host_incr_syncpt(cond: u32, id: u32) -> u32 {
    ((cond & 0xff) << 8) | (id & 0xff)
}

/// Splits a 24-bit wait payload into `(id, thresh)`.
pub fn decode_host_wait(payload: u32) -> (u32, u32) {
    (payload >> 24, payload & WAIT_THRESH_MASK)
}

/// Splits an `INCR_SYNCPT` payload into `(cond, id)`.
pub fn decode_host_incr(payload: u32) -> (u32, u32) {
    ((payload >> 8) & 0xff, payload & 0xff)
}

/// Expands a 24-bit wait threshold to the 32-bit value closest to `current`.
pub fn extend_wait_thresh(current: u32, thresh: u32) -> u32 {
    let delta = thresh.wrapping_sub(current) & WAIT_THRESH_MASK;
    // Sign-extend the 24-bit distance.
    let delta = ((delta << 8) as i32 >> 8) as u32;
    current.wrapping_add(delta)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    SetClass { class: u32, offset: u32, mask: u32 },
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    Imm { offset: u32, value: u32 },
    Gather { offset: u32, insert: bool, incr: bool, count: u32 },
    Unknown(u32),
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let offset = (word >> 16) & 0xfff;
        let low = word & 0xffff;
        match word >> 28 {
            OP_SETCLASS => Opcode::SetClass {
                class: (word >> 6) & 0x3ff,
                offset,
                mask: word & 0x3f,
            },
            OP_INCR => Opcode::Incr { offset, count: low },
            OP_NONINCR => Opcode::NonIncr { offset, count: low },
            OP_MASK => Opcode::Mask { offset, mask: low },
            OP_IMM => Opcode::Imm { offset, value: low },
            OP_GATHER => {
                let insert = word & GATHER_INSERT != 0;
                Opcode::Gather {
                    offset,
                    insert,
                    incr: insert && word & GATHER_INCR != 0,
                    count: if insert { word & 0x3fff } else { low },
                }
            }
            _ => Opcode::Unknown(word),
        }
    }

    /// Number of payload words that follow this op-code in the stream.
    pub fn payload_words(&self) -> u32 {
        match *self {
            Opcode::SetClass { mask, .. } | Opcode::Mask { mask, .. } => mask.count_ones(),
            Opcode::Incr { count, .. } | Opcode::NonIncr { count, .. } => count,
            Opcode::Gather { .. } => 1,
            Opcode::Imm { .. } | Opcode::Unknown(_) => 0,
        }
    }
}
