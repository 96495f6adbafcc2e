//! Minimal buffer model: word-addressable buffers with device addresses and pin counts.
//!
//! Command buffers referenced by gathers must stay alive until hardware has fetched them, so
//! a submitted job holds a [`PinGuard`] per buffer until its last completion action fires.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::lock;

/// First device address handed out.
pub const IOVA_BASE: u32 = 0x1000_0000;

/// Buffers are placed on this alignment, leaving unmapped gaps between them.
pub const IOVA_ALIGN: u32 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("buffers must hold at least one word")]
    ZeroSized,

    #[error("device address space exhausted")]
    Exhausted,

    #[error("word {index} is out of bounds for buffer {buffer} ({len} words)")]
    OutOfBounds { buffer: u32, index: u32, len: u32 },
}

pub type BufferHandle = Arc<BufferObject>;

pub struct BufferObject {
    id: u32,
    iova: u32,
    words: Mutex<Vec<u32>>,
    pins: AtomicU32,
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &self.len_words())
            .field("pins", &self.pin_count())
            .finish()
    }
}

impl BufferObject {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn iova(&self) -> u32 {
        self.iova
    }

    pub fn len_words(&self) -> u32 {
        lock(&self.words).len() as u32
    }

    pub fn len_bytes(&self) -> u32 {
        self.len_words() * 4
    }

    pub fn read(&self, index: u32) -> Result<u32, MemError> {
        let words = lock(&self.words);
        words
            .get(index as usize)
            .copied()
            .ok_or(MemError::OutOfBounds {
                buffer: self.id,
                index,
                len: words.len() as u32,
            })
    }

    pub fn write(&self, index: u32, word: u32) -> Result<(), MemError> {
        let mut words = lock(&self.words);
        let len = words.len() as u32;
        let slot = words.get_mut(index as usize).ok_or(MemError::OutOfBounds {
            buffer: self.id,
            index,
            len,
        })?;
        *slot = word;
        Ok(())
    }

    /// Copies `src` into the buffer starting at word `index`.
    pub fn write_words(&self, index: u32, src: &[u32]) -> Result<(), MemError> {
        let mut words = lock(&self.words);
        let len = words.len() as u32;
        let start = index as usize;
        let dst = start
            .checked_add(src.len())
            .and_then(|end| words.get_mut(start..end))
            .ok_or(MemError::OutOfBounds {
                buffer: self.id,
                index: index.saturating_add(src.len() as u32),
                len,
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn read_words(&self, index: u32, count: u32) -> Result<Vec<u32>, MemError> {
        let words = lock(&self.words);
        let start = index as usize;
        start
            .checked_add(count as usize)
            .and_then(|end| words.get(start..end))
            .map(<[u32]>::to_vec)
            .ok_or(MemError::OutOfBounds {
                buffer: self.id,
                index: index.saturating_add(count),
                len: words.len() as u32,
            })
    }

    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub fn pin(self: &Arc<Self>) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            buffer: self.clone(),
        }
    }
}

/// Keeps a buffer alive and counted as in use by hardware.
#[derive(Debug)]
pub struct PinGuard {
    buffer: BufferHandle,
}

impl PinGuard {
    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.buffer.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct Allocator {
    next_iova: u32,
    next_id: u32,
    live: BTreeMap<u32, Weak<BufferObject>>,
}

/// Hands out buffers and maps device addresses back to them.
#[derive(Debug)]
pub struct MemoryManager {
    inner: Mutex<Allocator>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Allocator {
                next_iova: IOVA_BASE,
                next_id: 1,
                live: BTreeMap::new(),
            }),
        }
    }

    /// Allocates a zero-filled buffer of `words` words.
    pub fn alloc(&self, words: u32) -> Result<BufferHandle, MemError> {
        if words == 0 {
            return Err(MemError::ZeroSized);
        }
        let bytes = words.checked_mul(4).ok_or(MemError::Exhausted)?;

        let mut inner = lock(&self.inner);
        inner.live.retain(|_, buf| buf.strong_count() > 0);

        let iova = inner.next_iova;
        let span = bytes
            .checked_add(IOVA_ALIGN - 1)
            .map(|b| b & !(IOVA_ALIGN - 1))
            .ok_or(MemError::Exhausted)?;
        inner.next_iova = iova.checked_add(span).ok_or(MemError::Exhausted)?;

        let id = inner.next_id;
        inner.next_id += 1;
        let buf = Arc::new(BufferObject {
            id,
            iova,
            words: Mutex::new(vec![0; words as usize]),
            pins: AtomicU32::new(0),
        });
        inner.live.insert(iova, Arc::downgrade(&buf));
        tracing::trace!(buffer = id, iova, words, "allocated buffer");
        Ok(buf)
    }

    /// Allocates a buffer holding a copy of `contents`.
    pub fn alloc_with(&self, contents: &[u32]) -> Result<BufferHandle, MemError> {
        let buf = self.alloc(contents.len() as u32)?;
        buf.write_words(0, contents)?;
        Ok(buf)
    }

    /// Maps a device address to the live buffer containing it and the word index within it.
    pub fn resolve(&self, iova: u32) -> Option<(BufferHandle, u32)> {
        if iova % 4 != 0 {
            return None;
        }
        let inner = lock(&self.inner);
        let (&base, weak) = inner.live.range(..=iova).next_back()?;
        let buf = weak.upgrade()?;
        let index = (iova - base) / 4;
        (index < buf.len_words()).then_some((buf, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_get_distinct_aligned_addresses() {
        let mm = MemoryManager::new();
        let a = mm.alloc(4).unwrap();
        let b = mm.alloc(2000).unwrap();
        let c = mm.alloc(1).unwrap();
        assert_eq!(a.iova(), IOVA_BASE);
        assert_eq!(b.iova(), IOVA_BASE + IOVA_ALIGN);
        assert_eq!(c.iova(), IOVA_BASE + 3 * IOVA_ALIGN);
        assert_ne!(a.id(), b.id());
        assert_eq!(mm.alloc(0).unwrap_err(), MemError::ZeroSized);
    }

    #[test]
    fn resolve_maps_addresses_back() {
        let mm = MemoryManager::new();
        let a = mm.alloc_with(&[1, 2, 3]).unwrap();
        let (buf, index) = mm.resolve(a.iova() + 8).unwrap();
        assert_eq!(buf.id(), a.id());
        assert_eq!(index, 2);
        assert!(mm.resolve(a.iova() + 12).is_none());
        assert!(mm.resolve(a.iova() + 2).is_none());
        assert!(mm.resolve(IOVA_BASE - 4).is_none());
    }

    #[test]
    fn freed_buffers_no_longer_resolve() {
        let mm = MemoryManager::new();
        let a = mm.alloc(4).unwrap();
        let iova = a.iova();
        drop(a);
        assert!(mm.resolve(iova).is_none());
    }

    #[test]
    fn pins_are_counted() {
        let mm = MemoryManager::new();
        let a = mm.alloc(1).unwrap();
        let p1 = a.pin();
        let p2 = a.pin();
        assert_eq!(a.pin_count(), 2);
        drop(p1);
        assert_eq!(a.pin_count(), 1);
        drop(p2);
        assert_eq!(a.pin_count(), 0);
    }

    #[test]
    fn out_of_bounds_access_is_reported() {
        let mm = MemoryManager::new();
        let a = mm.alloc(2).unwrap();
        assert!(a.write(1, 5).is_ok());
        assert_eq!(a.read(1).unwrap(), 5);
        assert!(matches!(a.read(2), Err(MemError::OutOfBounds { index: 2, .. })));
        assert!(a.write_words(1, &[1, 2]).is_err());
        assert_eq!(a.read_words(0, 2).unwrap(), vec![0, 5]);
    }
}
