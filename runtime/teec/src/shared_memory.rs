//! Shared memory blocks
//!
//! A block is either *registered* (it borrows a caller buffer for `'buf`) or
//! *allocated* (the library owns a zeroed heap buffer). Releasing a block
//! removes it from its context's registry and frees the buffer only if the
//! library allocated it.

use core::marker::PhantomData;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use kaal_tci::MapDirection;

use crate::error::{ErrorKind, Result, TeecError};
use crate::lock;

bitflags! {
    /// Declared direction of a shared memory block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SharedMemoryFlags: u32 {
        /// The secure world reads the block
        const INPUT = 0x1;
        /// The secure world writes the block
        const OUTPUT = 0x2;
    }
}

impl SharedMemoryFlags {
    pub(crate) fn map_direction(self) -> MapDirection {
        MapDirection::from_bits_truncate(self.bits())
    }
}

/// How a registry entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Registered,
    Allocated,
}

/// Per-context bookkeeping of live shared memory blocks
#[derive(Debug, Default)]
pub(crate) struct SharedMemoryRegistry {
    blocks: Mutex<HashMap<u64, (BlockKind, usize)>>,
    next_id: AtomicU64,
}

impl SharedMemoryRegistry {
    fn insert(&self, kind: BlockKind, size: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.blocks).insert(id, (kind, size));
        id
    }

    fn remove(&self, id: u64) {
        if lock(&self.blocks).remove(&id).is_none() {
            log::warn!("shared memory block {} released twice", id);
        }
    }

    fn count(&self, kind: BlockKind) -> usize {
        lock(&self.blocks).values().filter(|(k, _)| *k == kind).count()
    }

    pub(crate) fn registered_blocks(&self) -> usize {
        self.count(BlockKind::Registered)
    }

    pub(crate) fn allocated_blocks(&self) -> usize {
        self.count(BlockKind::Allocated)
    }

    /// Register a caller buffer
    ///
    /// # Errors
    /// - `BadParameters` if `flags` is empty or has unknown bits
    /// - `BadParameters` if the buffer exceeds `max_size`
    pub(crate) fn register<'buf>(
        self: &Arc<Self>,
        buffer: &'buf mut [u8],
        flags: SharedMemoryFlags,
        max_size: usize,
    ) -> Result<SharedMemory<'buf>> {
        check_flags(flags)?;
        if buffer.len() > max_size {
            log::warn!(
                "refusing to register {} bytes (limit {})",
                buffer.len(),
                max_size
            );
            return Err(TeecError::api(ErrorKind::BadParameters));
        }

        let size = buffer.len();
        let id = self.insert(BlockKind::Registered, size);
        log::debug!("registered shared memory block {} ({} bytes)", id, size);
        Ok(SharedMemory {
            id,
            buffer: NonNull::new(buffer.as_mut_ptr()),
            size,
            flags,
            allocated: false,
            registry: Arc::clone(self),
            _buffer: PhantomData,
        })
    }

    /// Allocate a zeroed block owned by the library
    ///
    /// # Errors
    /// - `BadParameters` if `flags` is empty or has unknown bits
    /// - `OutOfMemory` if `size` exceeds `max_size`
    pub(crate) fn allocate(
        self: &Arc<Self>,
        size: usize,
        flags: SharedMemoryFlags,
        max_size: usize,
    ) -> Result<SharedMemory<'static>> {
        check_flags(flags)?;
        if size > max_size {
            log::warn!("refusing to allocate {} bytes (limit {})", size, max_size);
            return Err(TeecError::api(ErrorKind::OutOfMemory));
        }

        let buffer = if size == 0 {
            None
        } else {
            let raw = Box::into_raw(vec![0u8; size].into_boxed_slice());
            NonNull::new(raw as *mut u8)
        };
        let id = self.insert(BlockKind::Allocated, size);
        log::debug!("allocated shared memory block {} ({} bytes)", id, size);
        Ok(SharedMemory {
            id,
            buffer,
            size,
            flags,
            allocated: true,
            registry: Arc::clone(self),
            _buffer: PhantomData,
        })
    }
}

fn check_flags(flags: SharedMemoryFlags) -> Result<()> {
    if flags.is_empty() || !SharedMemoryFlags::all().contains(flags) {
        return Err(TeecError::api(ErrorKind::BadParameters));
    }
    Ok(())
}

/// A block of memory shared with trusted applications
///
/// Referenced by whole and partial memory reference parameters. A block
/// cannot be mutated or released while an operation borrows it.
pub struct SharedMemory<'buf> {
    id: u64,
    buffer: Option<NonNull<u8>>,
    size: usize,
    flags: SharedMemoryFlags,
    allocated: bool,
    registry: Arc<SharedMemoryRegistry>,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl<'buf> SharedMemory<'buf> {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> SharedMemoryFlags {
        self.flags
    }

    /// Whether the library allocated (and will free) the buffer
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub(crate) fn buffer(&self) -> Option<NonNull<u8>> {
        self.buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.buffer {
            // SAFETY: the buffer is valid for `size` bytes for 'buf (registered)
            // or until drop (allocated)
            Some(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.buffer {
            // SAFETY: see `as_slice`; `&mut self` guarantees no operation holds
            // the block
            Some(ptr) => unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) },
            None => &mut [],
        }
    }

    /// Release the block
    ///
    /// Equivalent to dropping it.
    pub fn release(self) {}
}

impl core::fmt::Debug for SharedMemory<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("allocated", &self.allocated)
            .finish()
    }
}

impl Drop for SharedMemory<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        if self.allocated {
            if let Some(ptr) = self.buffer.take() {
                // SAFETY: produced by Box::into_raw of a boxed slice of `size` bytes
                unsafe {
                    drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                        ptr.as_ptr(),
                        self.size,
                    )));
                }
            }
        }
        log::debug!("released shared memory block {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SharedMemoryRegistry> {
        Arc::new(SharedMemoryRegistry::default())
    }

    #[test]
    fn test_register_borrows_buffer() {
        let registry = registry();
        let mut buffer = [7u8; 32];
        let block = registry
            .register(&mut buffer, SharedMemoryFlags::INPUT, 1024)
            .unwrap();

        assert_eq!(block.size(), 32);
        assert!(!block.is_allocated());
        assert_eq!(block.as_slice(), &[7u8; 32]);
        assert_eq!(registry.registered_blocks(), 1);

        block.release();
        assert_eq!(registry.registered_blocks(), 0);
        // Registered buffers are never freed by the library
        assert_eq!(buffer, [7u8; 32]);
    }

    #[test]
    fn test_allocate_is_zeroed_and_owned() {
        let registry = registry();
        let mut block = registry
            .allocate(64, SharedMemoryFlags::INPUT | SharedMemoryFlags::OUTPUT, 1024)
            .unwrap();

        assert!(block.is_allocated());
        assert!(block.as_slice().iter().all(|&b| b == 0));
        block.as_mut_slice()[0] = 0xAA;
        assert_eq!(block.as_slice()[0], 0xAA);
        assert_eq!(registry.allocated_blocks(), 1);

        drop(block);
        assert_eq!(registry.allocated_blocks(), 0);
    }

    #[test]
    fn test_zero_size_allocation() {
        let registry = registry();
        let block = registry
            .allocate(0, SharedMemoryFlags::OUTPUT, 1024)
            .unwrap();
        assert_eq!(block.size(), 0);
        assert!(block.buffer().is_none());
        assert!(block.as_slice().is_empty());
    }

    #[test]
    fn test_invalid_flags() {
        let registry = registry();
        let result = registry.allocate(16, SharedMemoryFlags::empty(), 1024);
        assert_eq!(
            result.unwrap_err(),
            TeecError::api(ErrorKind::BadParameters)
        );

        let result = registry.allocate(16, SharedMemoryFlags::from_bits_retain(0x4), 1024);
        assert_eq!(
            result.unwrap_err(),
            TeecError::api(ErrorKind::BadParameters)
        );
    }

    #[test]
    fn test_size_limits() {
        let registry = registry();
        let result = registry.allocate(2048, SharedMemoryFlags::INPUT, 1024);
        assert_eq!(result.unwrap_err(), TeecError::api(ErrorKind::OutOfMemory));

        let mut buffer = vec![0u8; 2048];
        let result = registry.register(&mut buffer, SharedMemoryFlags::INPUT, 1024);
        assert_eq!(
            result.unwrap_err(),
            TeecError::api(ErrorKind::BadParameters)
        );
        assert_eq!(registry.registered_blocks(), 0);
    }

    #[test]
    fn test_map_direction() {
        assert_eq!(
            (SharedMemoryFlags::INPUT | SharedMemoryFlags::OUTPUT).map_direction(),
            MapDirection::INPUT | MapDirection::OUTPUT
        );
        assert_eq!(
            SharedMemoryFlags::OUTPUT.map_direction(),
            MapDirection::OUTPUT
        );
    }
}
