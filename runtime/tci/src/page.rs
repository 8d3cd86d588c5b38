//! Shared TCI page
//!
//! # Safety
//! The page is written concurrently by the client, by a cancelling thread and
//! by the secure world. Only `ready` and `is_cancelled` are ever written by more
//! than one party at a time, and those are accessed atomically. Every other
//! field has a single writer per protocol phase and is accessed volatilely so
//! the compiler never caches it across a notify/wait boundary.

use core::marker::PhantomData;
use core::ptr::{self, addr_of, addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::uuid::Uuid;
use crate::wire::{Tci, WireParam};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// One zeroed, page-aligned page holding a [`Tci`] at offset 0
pub struct SharedPage {
    base: NonNull<Tci>,
}

// The page is plain memory; all cross-thread access goes through `TciView`.
unsafe impl Send for SharedPage {}
unsafe impl Sync for SharedPage {}

impl SharedPage {
    fn layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap_or_else(|_| unreachable!())
    }

    /// Allocate a zeroed page
    ///
    /// # Returns
    /// `None` if the allocator is out of memory
    pub fn new() -> Option<Self> {
        let base = unsafe { alloc_zeroed(Self::layout()) };
        NonNull::new(base as *mut Tci).map(|base| Self { base })
    }

    /// Address of the page (what the driver maps for the secure world)
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr() as *mut u8
    }

    /// Length of the shared region
    pub const fn len(&self) -> usize {
        PAGE_SIZE
    }

    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Field accessor bound to the lifetime of this page
    pub fn view(&self) -> TciView<'_> {
        TciView {
            tci: self.base,
            _page: PhantomData,
        }
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr() as *mut u8, Self::layout()) }
    }
}

/// Typed access to a TCI living in shared memory
#[derive(Clone, Copy)]
pub struct TciView<'a> {
    tci: NonNull<Tci>,
    _page: PhantomData<&'a SharedPage>,
}

unsafe impl Send for TciView<'_> {}
unsafe impl Sync for TciView<'_> {}

impl<'a> TciView<'a> {
    /// Detach the view from the page lifetime
    ///
    /// # Safety
    /// The caller must stop using the returned view before the page is
    /// dropped. Drivers rely on `TeeDriver::close_session` being called before
    /// the client releases the page.
    pub unsafe fn into_static(self) -> TciView<'static> {
        TciView {
            tci: self.tci,
            _page: PhantomData,
        }
    }

    fn raw(&self) -> *mut Tci {
        self.tci.as_ptr()
    }

    fn atomic(&self, field: *mut u32) -> &AtomicU32 {
        // SAFETY: `field` points into the live page and is 4-byte aligned
        unsafe { AtomicU32::from_ptr(field) }
    }

    pub fn format_tag(&self) -> [u8; 8] {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).format_tag)) }
    }

    pub fn set_format_tag(&self, tag: [u8; 8]) {
        unsafe { ptr::write_volatile(addr_of_mut!((*self.raw()).format_tag), tag) }
    }

    pub fn destination(&self) -> Uuid {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).destination)) }
    }

    pub fn set_destination(&self, destination: Uuid) {
        unsafe { ptr::write_volatile(addr_of_mut!((*self.raw()).destination), destination) }
    }

    pub fn instruction(&self) -> u32 {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).operation.instruction)) }
    }

    pub fn set_instruction(&self, instruction: u32) {
        unsafe {
            ptr::write_volatile(
                addr_of_mut!((*self.raw()).operation.instruction),
                instruction,
            )
        }
    }

    pub fn command_id(&self) -> u32 {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).operation.command_id)) }
    }

    pub fn set_command_id(&self, command_id: u32) {
        unsafe {
            ptr::write_volatile(addr_of_mut!((*self.raw()).operation.command_id), command_id)
        }
    }

    pub fn param_types(&self) -> u32 {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).operation.param_types)) }
    }

    pub fn set_param_types(&self, types: u32) {
        unsafe { ptr::write_volatile(addr_of_mut!((*self.raw()).operation.param_types), types) }
    }

    /// # Panics
    /// Panics if `index >= 4`
    pub fn param(&self, index: usize) -> WireParam {
        assert!(index < 4, "BUG: parameter slot {} out of range", index);
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).operation.params[index])) }
    }

    /// # Panics
    /// Panics if `index >= 4`
    pub fn set_param(&self, index: usize, param: WireParam) {
        assert!(index < 4, "BUG: parameter slot {} out of range", index);
        unsafe {
            ptr::write_volatile(
                addr_of_mut!((*self.raw()).operation.params[index]),
                param,
            )
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let field = unsafe { addr_of_mut!((*self.raw()).operation.is_cancelled) };
        self.atomic(field).load(Ordering::Acquire) != 0
    }

    pub fn set_cancelled(&self, cancelled: bool) {
        let field = unsafe { addr_of_mut!((*self.raw()).operation.is_cancelled) };
        self.atomic(field).store(cancelled as u32, Ordering::Release);
    }

    /// Zero every field of the operation record
    pub fn clear_operation(&self) {
        self.set_instruction(0);
        self.set_command_id(0);
        self.set_param_types(0);
        for index in 0..4 {
            self.set_param(index, WireParam::default());
        }
        self.set_cancelled(false);
    }

    pub fn is_ready(&self) -> bool {
        let field = unsafe { addr_of_mut!((*self.raw()).ready) };
        self.atomic(field).load(Ordering::Acquire) != 0
    }

    /// Publish (or withdraw) the operation record
    ///
    /// Release ordering: every field written before this call is visible to
    /// a reader that observes `ready != 0`.
    pub fn set_ready(&self, ready: bool) {
        let field = unsafe { addr_of_mut!((*self.raw()).ready) };
        self.atomic(field).store(ready as u32, Ordering::Release);
    }

    /// Consume the ready flag (secure-world side)
    ///
    /// # Returns
    /// `true` if an operation was published since the last call
    pub fn take_ready(&self) -> bool {
        let field = unsafe { addr_of_mut!((*self.raw()).ready) };
        self.atomic(field).swap(0, Ordering::AcqRel) != 0
    }

    pub fn return_origin(&self) -> u32 {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).return_origin)) }
    }

    pub fn return_status(&self) -> u32 {
        unsafe { ptr::read_volatile(addr_of!((*self.raw()).return_status)) }
    }

    pub fn set_result(&self, origin: u32, status: u32) {
        unsafe {
            ptr::write_volatile(addr_of_mut!((*self.raw()).return_origin), origin);
            ptr::write_volatile(addr_of_mut!((*self.raw()).return_status), status);
        }
    }

    /// Volatile snapshot of the whole structure (diagnostics and tests)
    pub fn snapshot(&self) -> Tci {
        Tci {
            format_tag: self.format_tag(),
            destination: self.destination(),
            operation: crate::wire::WireOperation {
                instruction: self.instruction(),
                command_id: self.command_id(),
                param_types: self.param_types(),
                params: [self.param(0), self.param(1), self.param(2), self.param(3)],
                is_cancelled: self.is_cancelled() as u32,
            },
            ready: self.is_ready() as u32,
            return_origin: self.return_origin(),
            return_status: self.return_status(),
        }
    }
}
