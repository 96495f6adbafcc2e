//! Per-generation encodings of host-class operations.
//!
//! Hardware generations differ in how waits are expressed and whether wait bases exist. A
//! channel picks its [`HostOps`] once at construction; everything that emits host waits goes
//! through it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::opcodes::{self, HOST_CLASS_ID};

/// A short, fixed-capacity run of words produced by one host operation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OpWords {
    words: [u32; 4],
    len: u8,
}

impl OpWords {
    fn from_slice(src: &[u32]) -> Self {
        let mut words = [0; 4];
        words[..src.len()].copy_from_slice(src);
        Self {
            words,
            len: src.len() as u8,
        }
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.words[..self.len as usize]
    }

    pub fn len(&self) -> u32 {
        u32::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for OpWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|w| format!("{w:#010x}")))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostGeneration {
    #[serde(alias = "host1x-v1")]
    V1,
    #[serde(alias = "host1x-v2")]
    V2,
}

impl HostGeneration {
    pub fn ops(self) -> &'static dyn HostOps {
        match self {
            HostGeneration::V1 => &Host1xV1,
            HostGeneration::V2 => &Host1xV2,
        }
    }
}

impl FromStr for HostGeneration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "host1x-v1" => Ok(HostGeneration::V1),
            "v2" | "host1x-v2" => Ok(HostGeneration::V2),
            other => Err(format!("unknown host generation {other:?}")),
        }
    }
}

pub trait HostOps: Send + Sync + fmt::Debug {
    fn generation(&self) -> HostGeneration;

    /// Whether `load_syncpt_base` is available.
    fn has_wait_bases(&self) -> bool;

    /// Words that block the channel until syncpoint `id` reaches `thresh`.
    fn wait_syncpt(&self, id: u32, thresh: u32) -> OpWords;

    /// Words that load `value` into wait base `base`. Empty when wait bases are unsupported.
    fn load_syncpt_base(&self, base: u32, value: u32) -> OpWords;

    /// Word count of [`wait_syncpt`](Self::wait_syncpt), for sizing a transaction up front.
    fn wait_words(&self) -> u32 {
        self.wait_syncpt(0, 0).len()
    }

    fn load_base_words(&self) -> u32 {
        self.load_syncpt_base(0, 0).len()
    }
}

/// First generation: 24-bit wait thresholds packed with the id, and wait bases.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host1xV1;

impl HostOps for Host1xV1 {
    fn generation(&self) -> HostGeneration {
        HostGeneration::V1
    }

    fn has_wait_bases(&self) -> bool {
        true
    }

    fn wait_syncpt(&self, id: u32, thresh: u32) -> OpWords {
        OpWords::from_slice(&[
            opcodes::setclass(HOST_CLASS_ID, opcodes::REG_WAIT_SYNCPT, 1),
            opcodes::host_wait_syncpt(id, thresh),
        ])
    }

    fn load_syncpt_base(&self, base: u32, value: u32) -> OpWords {
        OpWords::from_slice(&[
            opcodes::setclass(HOST_CLASS_ID, opcodes::REG_LOAD_SYNCPT_BASE, 1),
            opcodes::host_load_syncpt_base(base, value),
        ])
    }
}

/// Second generation: full 32-bit thresholds through a payload register, no wait bases.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host1xV2;

impl HostOps for Host1xV2 {
    fn generation(&self) -> HostGeneration {
        HostGeneration::V2
    }

    fn has_wait_bases(&self) -> bool {
        false
    }

    fn wait_syncpt(&self, id: u32, thresh: u32) -> OpWords {
        OpWords::from_slice(&[
            opcodes::setclass(HOST_CLASS_ID, opcodes::REG_LOAD_SYNCPT_PAYLOAD_32, 1),
            thresh,
            opcodes::setclass(HOST_CLASS_ID, opcodes::REG_WAIT_SYNCPT_32, 1),
            id,
        ])
    }

    fn load_syncpt_base(&self, _base: u32, _value: u32) -> OpWords {
        OpWords::from_slice(&[])
    }
}
