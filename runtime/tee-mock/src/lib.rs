//! ⚠️  MOCK secure world for client-side development
//!
//! # WARNING: This is NOT a real TEE driver!
//!
//! This crate simulates the driver and the secure world well enough to drive
//! the complete client protocol (open, invoke, close, cancel) without trusted
//! hardware. Trusted applications are plain Rust objects implementing
//! [`TrustedApp`], run on one worker thread per session.
//!
//! ## What is simulated
//!
//! - Session open/close with per-destination trusted application factories
//! - Buffer mapping into a fake secure address space, with direction checks
//! - `notify` / `wait_notification` over crossbeam channels
//! - Session error codes after abnormal trusted application exits
//!
//! ## Fault injection
//!
//! [`MockDriver`] can be told to fail mappings, notifications, session opens
//! or device opens, to report a session error after the next run, or to
//! overwrite the result fields the trusted application produced. Every driver
//! primitive is counted in [`MockStats`].

mod driver;
mod ta;

pub use driver::{MockDriver, MockStats};
pub use ta::{FnTrustedApp, TaContext, TaResult, TrustedApp};
