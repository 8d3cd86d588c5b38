//! TCI layout
//!
//! # Memory Layout
//! ```text
//! offset  size  field
//!      0     8  format_tag        "TCIGP000"
//!      8    16  destination       Uuid
//!     24    64  operation         WireOperation
//!     88     4  ready             set last by the client (release)
//!     92     4  return_origin     written by the secure world
//!     96     4  return_status     written by the secure world
//! ```

use core::mem::{offset_of, size_of};

use static_assertions::{assert_eq_size, const_assert, const_assert_eq};

use crate::page::PAGE_SIZE;
use crate::uuid::Uuid;

/// Format marker stamped at the start of every marshaled TCI
pub const TCI_FORMAT_TAG: [u8; 8] = *b"TCIGP000";

/// Instruction carried by the operation record
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    OpenSession = 1,
    InvokeCommand = 2,
    CloseSession = 3,
}

impl Instruction {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::OpenSession),
            2 => Some(Self::InvokeCommand),
            3 => Some(Self::CloseSession),
            _ => None,
        }
    }
}

/// One internal parameter slot
///
/// Either a value pair `(a, b)` or a mapped buffer descriptor
/// `(secure_va, mapped_len, output_size)`; which one is valid is decided by the
/// slot's nibble in [`WireOperation::param_types`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireParam {
    words: [u32; 3],
}

impl WireParam {
    pub const fn value(a: u32, b: u32) -> Self {
        Self { words: [a, b, 0] }
    }

    pub const fn memref(secure_va: u32, mapped_len: u32, output_size: u32) -> Self {
        Self {
            words: [secure_va, mapped_len, output_size],
        }
    }

    pub const fn a(&self) -> u32 {
        self.words[0]
    }

    pub const fn b(&self) -> u32 {
        self.words[1]
    }

    pub const fn secure_va(&self) -> u32 {
        self.words[0]
    }

    /// Non-zero if and only if the client mapped a buffer for this slot
    pub const fn mapped_len(&self) -> u32 {
        self.words[1]
    }

    /// Seeded with the caller's buffer size, replaced by the produced size
    pub const fn output_size(&self) -> u32 {
        self.words[2]
    }

    pub fn set_output_size(&mut self, size: u32) {
        self.words[2] = size;
    }
}

/// Operation record embedded in the TCI
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireOperation {
    pub instruction: u32,
    pub command_id: u32,
    pub param_types: u32,
    pub params: [WireParam; 4],
    /// Non-zero once the client requested cancellation
    pub is_cancelled: u32,
}

/// The shared Task Communication Interface
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tci {
    pub format_tag: [u8; 8],
    pub destination: Uuid,
    pub operation: WireOperation,
    /// Written last by the client; the secure world must not read the
    /// operation before observing a non-zero value.
    pub ready: u32,
    pub return_origin: u32,
    pub return_status: u32,
}

assert_eq_size!(WireParam, [u32; 3]);
assert_eq_size!(Uuid, [u8; 16]);
const_assert!(size_of::<Tci>() <= PAGE_SIZE);
const_assert_eq!(offset_of!(Tci, destination), 8);
const_assert_eq!(offset_of!(Tci, operation), 24);
const_assert_eq!(size_of::<WireOperation>(), 64);
const_assert_eq!(offset_of!(Tci, ready), 88);
const_assert_eq!(offset_of!(Tci, return_status), 96);
