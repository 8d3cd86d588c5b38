//! Task Communication Interface (TCI) - Client/secure-world wire format
//!
//! # Purpose
//! Defines the fixed-layout structure shared between an untrusted client and a
//! trusted application (TA) running in the secure world, together with the
//! driver interface used to move it across the trust boundary.
//!
//! # Integration Points
//! - Depends on: nothing (leaf crate)
//! - Provides to: `kaal-teec` (client library), `kaal-tee-mock` (simulated secure world)
//! - Shared memory: one page per session, holding a [`Tci`]
//! - Signalling: [`TeeDriver::notify`] / [`TeeDriver::wait_notification`]
//!
//! # Architecture
//! Both sides see the same `#[repr(C)]` layout. Neither side has type safety
//! across the boundary, so every field is accessed through [`TciView`], which
//! performs volatile accesses for plain fields and atomic accesses for the two
//! flags (`ready`, `is_cancelled`) that are written concurrently.
//!
//! # Testing Strategy
//! - Unit tests: parameter-type packing, UUID parsing, page layout
//! - Integration tests: exercised through `kaal-teec` against `kaal-tee-mock`

pub mod codes;
pub mod driver;
pub mod page;
pub mod params;
pub mod uuid;
pub mod wire;

pub use codes::*;
pub use driver::{
    DriverError, Login, MapDirection, MapInfo, SessionHandle, TeeDriver, Timeout,
    ERR_INVALID_SID, ERR_SESSION_KILLED, ERR_SID_NOT_ACTIVE, SESSION_ERR_NONE,
    TA_EXIT_CODE_FINISHED,
};
pub use page::{SharedPage, TciView, PAGE_SIZE};
pub use params::{
    pack_param_types, param_type_at, ParamType, UnknownParamType, DIRECTION_INPUT,
    DIRECTION_OUTPUT,
};
pub use uuid::{Uuid, UuidParseError};
pub use wire::{Instruction, Tci, WireOperation, WireParam, TCI_FORMAT_TAG};
