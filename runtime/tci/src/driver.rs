//! Driver interface to the secure-world subsystem
//!
//! The driver owns the primitives the client library cannot perform itself:
//! opening a channel to the secure world, mapping client buffers into a
//! trusted application's address space, and notification-based signalling.
//! The client library is written once against [`TeeDriver`]; a kernel-backed
//! driver and the simulated secure world in `kaal-tee-mock` both implement it.

use core::ptr::NonNull;
use core::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::page::SharedPage;
use crate::uuid::Uuid;

/// No session error recorded
pub const SESSION_ERR_NONE: i32 = 0;
/// The trusted application exited normally (possibly right after a failed open)
pub const TA_EXIT_CODE_FINISHED: i32 = 1;
/// The session was killed by the secure world
pub const ERR_SESSION_KILLED: i32 = -2;
/// The session identifier is unknown to the secure world
pub const ERR_INVALID_SID: i32 = -3;
/// The session identifier exists but is no longer active
pub const ERR_SID_NOT_ACTIVE: i32 = -4;

/// Driver error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Session reported an error notification")]
    InfoNotification,

    #[error("Trusted application not found")]
    TrustedAppNotFound,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Operation not implemented by the driver")]
    NotImplemented,

    #[error("Service blocked")]
    ServiceBlocked,

    #[error("Service locked")]
    ServiceLocked,

    #[error("Service killed")]
    ServiceKilled,

    #[error("No free trusted application instances")]
    NoFreeInstances,

    #[error("Invalid session handle {0}")]
    InvalidSession(u32),

    #[error("Mapping of {len} bytes failed")]
    MappingFailed { len: usize },

    #[error("Timed out waiting for notification")]
    Timeout,

    #[error("Device error: {0}")]
    Device(String),
}

pub type Result<T> = core::result::Result<T, DriverError>;

/// Session identifier assigned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

bitflags! {
    /// Direction of a buffer mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapDirection: u32 {
        /// Secure world reads the buffer
        const INPUT = 0x1;
        /// Secure world writes the buffer
        const OUTPUT = 0x2;
    }
}

/// Descriptor of a buffer mapped into the secure world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    /// Address of the buffer in the trusted application's address space
    pub secure_va: u32,
    /// Length of the mapping in bytes
    pub len: u32,
}

/// How long to block in [`TeeDriver::wait_notification`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(Duration),
}

/// Identity the client binds to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Login {
    /// Login method code (public 0, user 1, group 2, application 4, ...)
    pub method: u32,
    /// Group identifier for group-based methods, zero otherwise
    pub data: u32,
}

/// Driver primitives consumed by the client library
///
/// # Implementation Notes
/// - All methods may be called from any thread
/// - `notify` may race with `wait_notification` on the same session (a
///   cancelling thread signals while the owner is blocked)
/// - A driver may keep a pointer to the page passed to `open_session` until
///   `close_session` returns for that handle; the client keeps the page alive
///   at least that long
pub trait TeeDriver: Send + Sync + 'static {
    /// Acquire the context-level device handle
    fn open_device(&self) -> Result<()>;

    /// Release the context-level device handle
    fn close_device(&self) -> Result<()>;

    /// Open a session with the trusted application `destination`, sharing
    /// `tci` with it
    ///
    /// # Errors
    /// Returns the driver's classification of why the session could not be
    /// opened (`TrustedAppNotFound`, `ServiceBlocked`, ...)
    fn open_session(
        &self,
        destination: &Uuid,
        login: &Login,
        tci: &SharedPage,
    ) -> Result<SessionHandle>;

    /// Close a session; the driver releases its reference to the TCI page
    fn close_session(&self, handle: SessionHandle) -> Result<()>;

    /// Map `len` bytes at `buffer` into the session's secure address space
    ///
    /// # Safety contract
    /// The client keeps `buffer .. buffer + len` alive and unaliased by Rust
    /// references until the matching `unmap` returns.
    fn map(
        &self,
        handle: SessionHandle,
        buffer: NonNull<u8>,
        len: usize,
        direction: MapDirection,
    ) -> Result<MapInfo>;

    /// Remove a mapping created by [`TeeDriver::map`]
    fn unmap(&self, handle: SessionHandle, buffer: NonNull<u8>, info: &MapInfo) -> Result<()>;

    /// Wake the secure side of the session
    fn notify(&self, handle: SessionHandle) -> Result<()>;

    /// Block until the secure side signals back
    ///
    /// # Errors
    /// `InfoNotification` means the session itself reported a condition; query
    /// [`TeeDriver::session_error_code`] to learn which.
    fn wait_notification(&self, handle: SessionHandle, timeout: Timeout) -> Result<()>;

    /// Last error recorded for the session (`TA_EXIT_CODE_FINISHED`,
    /// `ERR_SESSION_KILLED`, ...)
    fn session_error_code(&self, handle: SessionHandle) -> Result<i32>;
}
