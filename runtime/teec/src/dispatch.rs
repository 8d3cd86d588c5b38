//! One request/response cycle with the secure world
//!
//! ```text
//! marshal ──► notify ──► wait ──► unwind
//!    │           │         │         │
//!    └─ error:   └─────────┴─ error: └─ result
//!       return      unwind without copy-back
//! ```
//!
//! Communication and secure-world failures after marshaling take the session
//! down: it is deactivated and closed at the driver. Trusted-application
//! errors leave it usable.

use std::sync::{Arc, Weak};

use kaal_tci::{
    DriverError, Instruction, SessionHandle, TeeDriver, Timeout, ERR_INVALID_SID,
    ERR_SESSION_KILLED, ERR_SID_NOT_ACTIVE, SESSION_ERR_NONE, TA_EXIT_CODE_FINISHED,
};

use crate::error::{ErrorKind, Result, ReturnOrigin, TeecError};
use crate::marshal::{marshal, unwind};
use crate::operation::{CancelTarget, Operation};
use crate::session::SessionShared;

/// Run `instruction` on `session`, carrying `operation`
///
/// The caller holds the session's serialization lock. The operation is
/// marked started before marshaling and finished on every return path.
pub(crate) fn dispatch<D: TeeDriver>(
    session: &Arc<SessionShared<D>>,
    instruction: Instruction,
    command_id: u32,
    operation: Option<&mut Operation<'_>>,
) -> Result<ReturnOrigin> {
    let state = operation.as_deref().map(|operation| Arc::clone(operation.state()));
    if let Some(state) = &state {
        let weak: Weak<SessionShared<D>> = Arc::downgrade(session);
        let target: Weak<dyn CancelTarget> = weak;
        state.begin(target);
    }

    let result = run(session, instruction, command_id, operation);

    if let Some(state) = state {
        state.finish(match &result {
            Ok(origin) => *origin,
            Err(error) => error.origin(),
        });
    }
    result
}

fn run<D: TeeDriver>(
    session: &SessionShared<D>,
    instruction: Instruction,
    command_id: u32,
    operation: Option<&mut Operation<'_>>,
) -> Result<ReturnOrigin> {
    let tci = session.page().view();
    let mappings = marshal(
        session.driver(),
        session.handle(),
        tci,
        instruction,
        command_id,
        operation.as_deref(),
    )?;

    let exchanged = exchange(session.driver(), session.handle());
    let unwound = unwind(tci, operation, mappings, exchanged.is_ok());
    let result = exchanged.and(unwound);

    if let Err(error) = &result {
        if error.breaks_session() {
            log::warn!(
                "session {}: {:?} failed ({}), closing session",
                session.handle().0,
                instruction,
                error
            );
            session.teardown();
        }
    }
    result
}

/// Signal the secure world and block until it answers
fn exchange<D: TeeDriver>(driver: &D, handle: SessionHandle) -> Result<()> {
    driver.notify(handle).map_err(|e| {
        log::error!("session {}: notify failed: {}", handle.0, e);
        TeecError::comms(ErrorKind::Communication)
    })?;

    match driver.wait_notification(handle, Timeout::Infinite) {
        Ok(()) => Ok(()),
        Err(DriverError::InfoNotification) => classify_exit(driver, handle),
        Err(e) => {
            log::error!("session {}: wait failed: {}", handle.0, e);
            Err(TeecError::comms(ErrorKind::Communication))
        }
    }
}

/// Interpret the session error reported alongside a notification
fn classify_exit<D: TeeDriver>(driver: &D, handle: SessionHandle) -> Result<()> {
    let code = driver.session_error_code(handle).unwrap_or_else(|e| {
        log::error!("session {}: error code unavailable: {}", handle.0, e);
        SESSION_ERR_NONE
    });

    match code {
        TA_EXIT_CODE_FINISHED => {
            log::debug!("session {}: trusted application finished", handle.0);
            Ok(())
        }
        ERR_SESSION_KILLED => {
            log::warn!("session {}: trusted application killed", handle.0);
            Err(TeecError::new(ErrorKind::TargetKilled, ReturnOrigin::Tee))
        }
        ERR_INVALID_SID | ERR_SID_NOT_ACTIVE => {
            log::error!("session {}: driver no longer knows the session ({})", handle.0, code);
            Err(TeecError::comms(ErrorKind::Communication))
        }
        other => {
            log::warn!("session {}: trusted application died ({})", handle.0, other);
            Err(TeecError::new(ErrorKind::TargetDead, ReturnOrigin::Tee))
        }
    }
}
