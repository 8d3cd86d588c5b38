//! Sessions with trusted applications
//!
//! A [`Session`] owns one TCI page shared with the secure world and
//! serializes the calls made on it. Calls may come from several threads
//! through `&Session`; they run one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kaal_tci::codes::*;
use kaal_tci::{DriverError, Instruction, Login, SessionHandle, SharedPage, TeeDriver, Uuid};

use crate::context::Context;
use crate::dispatch::dispatch;
use crate::error::{ErrorKind, Result, ReturnOrigin, TeecError};
use crate::lock;
use crate::operation::{CancelTarget, Operation};

/// Identity presented when opening a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMethod {
    Public,
    User,
    /// Membership of the given group
    Group(u32),
    Application,
    UserApplication,
    /// Application identity plus membership of the given group
    GroupApplication(u32),
}

impl ConnectionMethod {
    /// Build from a raw login method and its optional connection data
    ///
    /// # Errors
    /// - `NotImplemented` for an unknown method
    /// - `BadParameters` if a group method lacks its group
    pub fn from_raw(method: u32, data: Option<u32>) -> Result<Self> {
        let group = || data.ok_or(TeecError::api(ErrorKind::BadParameters));
        Ok(match method {
            TEEC_LOGIN_PUBLIC => Self::Public,
            TEEC_LOGIN_USER => Self::User,
            TEEC_LOGIN_GROUP => Self::Group(group()?),
            TEEC_LOGIN_APPLICATION => Self::Application,
            TEEC_LOGIN_USER_APPLICATION => Self::UserApplication,
            TEEC_LOGIN_GROUP_APPLICATION => Self::GroupApplication(group()?),
            other => {
                log::warn!("unsupported login method {:#x}", other);
                return Err(TeecError::api(ErrorKind::NotImplemented));
            }
        })
    }

    pub fn login(self) -> Login {
        let (method, data) = match self {
            Self::Public => (TEEC_LOGIN_PUBLIC, 0),
            Self::User => (TEEC_LOGIN_USER, 0),
            Self::Group(group) => (TEEC_LOGIN_GROUP, group),
            Self::Application => (TEEC_LOGIN_APPLICATION, 0),
            Self::UserApplication => (TEEC_LOGIN_USER_APPLICATION, 0),
            Self::GroupApplication(group) => (TEEC_LOGIN_GROUP_APPLICATION, group),
        };
        Login { method, data }
    }
}

/// Map a driver refusal to open a session
fn open_error(error: DriverError) -> TeecError {
    let (kind, origin) = match error {
        DriverError::TrustedAppNotFound => (ErrorKind::ItemNotFound, ReturnOrigin::Comms),
        DriverError::PermissionDenied => (ErrorKind::AccessDenied, ReturnOrigin::Comms),
        DriverError::NotImplemented => (ErrorKind::NotImplemented, ReturnOrigin::Comms),
        DriverError::NoFreeInstances => (ErrorKind::Busy, ReturnOrigin::Comms),
        DriverError::ServiceBlocked => (ErrorKind::SdBlocked, ReturnOrigin::Tee),
        DriverError::ServiceLocked => (ErrorKind::TaLocked, ReturnOrigin::Tee),
        DriverError::ServiceKilled => (ErrorKind::TargetKilled, ReturnOrigin::Tee),
        ref other => {
            log::error!("driver failed to open session: {}", other);
            (ErrorKind::Generic, ReturnOrigin::Comms)
        }
    };
    TeecError::new(kind, origin)
}

/// Session state reachable from cancellation tokens
///
/// The driver session is closed before the TCI page is freed.
pub(crate) struct SessionShared<D: TeeDriver> {
    driver: Arc<D>,
    handle: SessionHandle,
    page: SharedPage,
    active: AtomicBool,
}

impl<D: TeeDriver> SessionShared<D> {
    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub(crate) fn page(&self) -> &SharedPage {
        &self.page
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deactivate and close at the driver, once
    pub(crate) fn teardown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.driver.close_session(self.handle) {
                log::warn!("session {}: driver close failed: {}", self.handle.0, e);
            }
        }
    }
}

impl<D: TeeDriver> CancelTarget for SessionShared<D> {
    fn signal_cancel(&self) {
        if !self.is_active() {
            log::debug!("session {}: inactive, cancellation dropped", self.handle.0);
            return;
        }
        self.page.view().set_cancelled(true);
        if let Err(e) = self.driver.notify(self.handle) {
            log::warn!("session {}: cancellation notify failed: {}", self.handle.0, e);
        }
        log::debug!("session {}: cancellation signalled", self.handle.0);
    }
}

impl<D: TeeDriver> Drop for SessionShared<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// An open session with a trusted application
///
/// Dropping the session closes it.
pub struct Session<'ctx, D: TeeDriver> {
    context: &'ctx Context<D>,
    shared: Arc<SessionShared<D>>,
    lock: Mutex<()>,
}

impl<'ctx, D: TeeDriver> Session<'ctx, D> {
    pub(crate) fn open(
        context: &'ctx Context<D>,
        destination: &Uuid,
        method: ConnectionMethod,
        operation: Option<&mut Operation<'_>>,
    ) -> Result<Self> {
        let page = SharedPage::new().ok_or_else(|| {
            log::error!("cannot allocate TCI page");
            TeecError::api(ErrorKind::OutOfMemory)
        })?;
        page.view().set_destination(*destination);

        let driver = context.driver_handle();
        let handle = driver
            .open_session(destination, &method.login(), &page)
            .map_err(open_error)?;

        let session = Self {
            context,
            shared: Arc::new(SessionShared {
                driver: Arc::clone(driver),
                handle,
                page,
                active: AtomicBool::new(true),
            }),
            lock: Mutex::new(()),
        };

        let result = {
            let _guard = lock(&session.lock);
            dispatch(&session.shared, Instruction::OpenSession, 0, operation)
        };
        match result {
            Ok(_) => {
                log::info!("session {}: opened to {}", handle.0, destination);
                Ok(session)
            }
            Err(error) => {
                log::warn!("session {}: open rejected: {}", handle.0, error);
                session.shared.teardown();
                Err(error)
            }
        }
    }

    /// Invoke `command_id` in the trusted application
    ///
    /// Returns the layer that produced the successful result.
    ///
    /// # Errors
    /// - `BadState` (origin api) if the session was taken down by an earlier
    ///   failure
    /// - any error of the call; communication and secure-world failures
    ///   leave the session inactive
    pub fn invoke_command(
        &self,
        command_id: u32,
        operation: Option<&mut Operation<'_>>,
    ) -> Result<ReturnOrigin> {
        if !self.shared.is_active() {
            return Err(TeecError::api(ErrorKind::BadState));
        }
        let _guard = lock(&self.lock);
        // Another caller's failure may have ended the session meanwhile
        if !self.shared.is_active() {
            return Err(TeecError::api(ErrorKind::BadState));
        }
        dispatch(&self.shared, Instruction::InvokeCommand, command_id, operation)
    }

    /// Close the session
    ///
    /// Equivalent to dropping it. Never fails: errors on the way are logged.
    pub fn close(self) {}

    /// Whether the session can still carry calls
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn id(&self) -> u32 {
        self.shared.handle().0
    }

    pub fn context(&self) -> &'ctx Context<D> {
        self.context
    }
}

impl<D: TeeDriver> Drop for Session<'_, D> {
    fn drop(&mut self) {
        let id = self.id();
        if self.shared.is_active() {
            let _guard = lock(&self.lock);
            if let Err(e) = dispatch(&self.shared, Instruction::CloseSession, 0, None) {
                log::warn!("session {}: close command failed: {}", id, e);
            }
            self.shared.teardown();
        }
        log::info!("session {}: closed", id);
    }
}

impl<D: TeeDriver> core::fmt::Debug for Session<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaal_tee_mock::{FnTrustedApp, MockDriver, TaContext};

    use crate::param::Parameter;

    const ADDER: Uuid = Uuid::new(0xadde_0001, 0, 0, [0; 8]);

    fn context() -> Context<MockDriver> {
        let driver = MockDriver::new().with_trusted_app(ADDER, || {
            Box::new(FnTrustedApp::new(|command_id, ctx: &mut TaContext<'_>| {
                let (a, b) = ctx.value(0);
                ctx.set_value(0, a + b, command_id);
                Ok(())
            }))
        });
        Context::initialize(driver, None).unwrap()
    }

    #[test]
    fn test_connection_method_from_raw() {
        assert_eq!(
            ConnectionMethod::from_raw(TEEC_LOGIN_PUBLIC, None),
            Ok(ConnectionMethod::Public)
        );
        assert_eq!(
            ConnectionMethod::from_raw(TEEC_LOGIN_GROUP, Some(42)),
            Ok(ConnectionMethod::Group(42))
        );
        assert_eq!(
            ConnectionMethod::from_raw(TEEC_LOGIN_GROUP_APPLICATION, None),
            Err(TeecError::api(ErrorKind::BadParameters))
        );
        assert_eq!(
            ConnectionMethod::from_raw(0x3, None),
            Err(TeecError::api(ErrorKind::NotImplemented))
        );
        assert_eq!(
            ConnectionMethod::GroupApplication(9).login(),
            Login {
                method: TEEC_LOGIN_GROUP_APPLICATION,
                data: 9
            }
        );
    }

    #[test]
    fn test_open_error_classification() {
        assert_eq!(
            open_error(DriverError::TrustedAppNotFound),
            TeecError::comms(ErrorKind::ItemNotFound)
        );
        assert_eq!(
            open_error(DriverError::ServiceBlocked),
            TeecError::new(ErrorKind::SdBlocked, ReturnOrigin::Tee)
        );
        assert_eq!(
            open_error(DriverError::NoFreeInstances),
            TeecError::comms(ErrorKind::Busy)
        );
        assert_eq!(
            open_error(DriverError::Timeout),
            TeecError::comms(ErrorKind::Generic)
        );
    }

    #[test]
    fn test_invoke_and_close() {
        let context = context();
        let session = context
            .open_session(&ADDER, ConnectionMethod::Public, None)
            .unwrap();
        assert!(session.is_active());

        let mut operation = Operation::new(
            Parameter::value_inout(2, 3),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );
        session.invoke_command(7, Some(&mut operation)).unwrap();
        assert_eq!(operation.param(0).value(), Some((5, 7)));
        assert_eq!(operation.return_origin(), Some(ReturnOrigin::TrustedApp));

        session.close();
        let stats = context.driver().stats();
        assert_eq!(stats.opens, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(context.driver().open_sessions(), 0);
    }

    #[test]
    fn test_unknown_destination() {
        let context = context();
        let unknown = Uuid::new(1, 2, 3, [4; 8]);
        let result = context.open_session(&unknown, ConnectionMethod::Public, None);
        assert_eq!(result.unwrap_err(), TeecError::comms(ErrorKind::ItemNotFound));
    }

    #[test]
    fn test_comms_failure_deactivates() {
        let context = context();
        let session = context
            .open_session(&ADDER, ConnectionMethod::Public, None)
            .unwrap();

        context.driver().fail_notify(true);
        let result = session.invoke_command(1, None);
        assert_eq!(result, Err(TeecError::comms(ErrorKind::Communication)));
        assert!(!session.is_active());
        assert_eq!(context.driver().open_sessions(), 0);

        context.driver().fail_notify(false);
        let result = session.invoke_command(1, None);
        assert_eq!(result, Err(TeecError::api(ErrorKind::BadState)));
    }
}
