//! TEE Client - Sessions, operations and shared memory for trusted applications
//!
//! # Purpose
//! Lets an untrusted program call into trusted applications: open a context
//! on a TEE, open sessions with trusted applications, invoke commands with up
//! to four parameters, share memory, and cancel calls in flight.
//!
//! # Integration Points
//! - Depends on: `kaal-tci` (wire format and [`TeeDriver`] interface)
//! - Provides to: applications that need a trusted application
//! - Shared memory: one TCI page per session, plus caller buffers mapped per call
//! - Signalling: driver notifications, one outstanding call per session
//!
//! # Architecture
//! ```text
//! Context ──► Session ──► dispatch ──► marshal ──► driver ──► secure world
//!    │                                    ▲            │
//!    └─ shared memory registry            └── unwind ◄─┘
//! ```
//! Every call marshals its [`Operation`] into the session's TCI, signals the
//! secure world, blocks for the answer, and unwinds the result back into the
//! operation. Communication and secure-world failures take the session down;
//! trusted-application errors are returned as-is.
//!
//! # Testing Strategy
//! - Unit tests: parameter marshaling, cancellation markers, error mapping
//! - Integration tests: full calls against `kaal-tee-mock`
//!
//! # Example
//! ```no_run
//! use kaal_tci::{TeeDriver, Uuid};
//! use kaal_teec::{ConnectionMethod, Context, Operation, Parameter};
//!
//! fn add<D: TeeDriver>(driver: D, ta: Uuid) -> kaal_teec::Result<u32> {
//!     let context = Context::initialize(driver, None)?;
//!     let session = context.open_session(&ta, ConnectionMethod::Public, None)?;
//!     let mut operation = Operation::new(
//!         Parameter::value_inout(40, 2),
//!         Parameter::None,
//!         Parameter::None,
//!         Parameter::None,
//!     );
//!     session.invoke_command(1, Some(&mut operation))?;
//!     Ok(operation.param(0).value().map_or(0, |(a, _)| a))
//! }
//! ```

use std::sync::{Mutex, MutexGuard};

mod config;
mod context;
mod dispatch;
mod error;
mod mapping;
mod marshal;
mod operation;
mod param;
mod session;
mod shared_memory;

pub use config::{ClientConfig, ConfigError, DEFAULT_MAX_SHARED_MEMORY_SIZE};
pub use context::Context;
pub use error::{ErrorKind, Result, ReturnOrigin, TeecError};
pub use kaal_tci::{TeeDriver, Uuid};
pub use operation::{CancellationToken, Operation, Progress};
pub use param::{Direction, Parameter, TempMemRef};
pub use session::{ConnectionMethod, Session};
pub use shared_memory::{SharedMemory, SharedMemoryFlags};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initialize a context on the TEE named `name` (or the default TEE)
pub fn initialize_context<D: TeeDriver>(driver: D, name: Option<&str>) -> Result<Context<D>> {
    Context::initialize(driver, name)
}

/// Finalize a context; its sessions and shared memory must be gone already
pub fn finalize_context<D: TeeDriver>(context: Context<D>) {
    context.finalize();
}

/// Open a session with `destination`
pub fn open_session<'ctx, D: TeeDriver>(
    context: &'ctx Context<D>,
    destination: &Uuid,
    method: ConnectionMethod,
    operation: Option<&mut Operation<'_>>,
) -> Result<Session<'ctx, D>> {
    context.open_session(destination, method, operation)
}

/// Invoke `command_id` on `session`
pub fn invoke_command<D: TeeDriver>(
    session: &Session<'_, D>,
    command_id: u32,
    operation: Option<&mut Operation<'_>>,
) -> Result<ReturnOrigin> {
    session.invoke_command(command_id, operation)
}

/// Close a session; `None` is accepted and ignored
pub fn close_session<D: TeeDriver>(session: Option<Session<'_, D>>) {
    if let Some(session) = session {
        session.close();
    }
}

/// Register a caller buffer as shared memory
pub fn register_shared_memory<'buf, D: TeeDriver>(
    context: &Context<D>,
    buffer: &'buf mut [u8],
    flags: SharedMemoryFlags,
) -> Result<SharedMemory<'buf>> {
    context.register_shared_memory(buffer, flags)
}

/// Allocate a zeroed shared memory block
pub fn allocate_shared_memory<D: TeeDriver>(
    context: &Context<D>,
    size: usize,
    flags: SharedMemoryFlags,
) -> Result<SharedMemory<'static>> {
    context.allocate_shared_memory(size, flags)
}

/// Release a shared memory block; `None` is accepted and ignored
pub fn release_shared_memory(block: Option<SharedMemory<'_>>) {
    if let Some(block) = block {
        block.release();
    }
}

/// Cancel the call carrying the token's operation
///
/// Blocks until the operation has started. Use
/// [`Context::request_cancellation`] to apply a context's poll interval and
/// wait limit.
pub fn request_cancellation(token: &CancellationToken) {
    token.cancel();
}
