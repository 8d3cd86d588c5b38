//! Simulated driver

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use kaal_tci::driver::Result;
use kaal_tci::{
    DriverError, Instruction, Login, MapDirection, MapInfo, SessionHandle, SharedPage,
    TciView, TeeDriver, Timeout, Uuid, PAGE_SIZE, SESSION_ERR_NONE, TEEC_ERROR_BAD_PARAMETERS,
    TEEC_ORIGIN_TEE, TEEC_ORIGIN_TRUSTED_APP, TEEC_SUCCESS,
};

use crate::ta::{TaContext, TrustedApp};

/// First address handed out in the fake secure address space
const SECURE_VA_BASE: u32 = 0x0010_0000;

type TaFactory = Arc<dyn Fn() -> Box<dyn TrustedApp> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters of driver primitives issued so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub device_opens: usize,
    pub device_closes: usize,
    pub opens: usize,
    pub closes: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub notifies: usize,
    pub waits: usize,
}

#[derive(Default)]
struct Counters {
    device_opens: AtomicUsize,
    device_closes: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    notifies: AtomicUsize,
    waits: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Pending fault injections
#[derive(Default)]
struct Faults {
    open_device: Option<DriverError>,
    open_session: Option<DriverError>,
    /// Number of further mappings that succeed before every mapping fails
    map_budget: Option<usize>,
    notify: bool,
    /// Session error reported (once) after the next trusted application run
    exit_code: Option<i32>,
    /// Result fields written (once) instead of the trusted application's
    forced_result: Option<(u32, u32)>,
}

struct SecureMapping {
    host: usize,
    len: usize,
    direction: MapDirection,
}

/// Buffers currently mapped into the fake secure address space
#[derive(Default)]
pub(crate) struct SecureMappings {
    entries: Mutex<HashMap<u32, SecureMapping>>,
}

impl SecureMappings {
    pub(crate) fn read(&self, secure_va: u32, len: usize) -> Option<Vec<u8>> {
        let entries = lock(&self.entries);
        let mapping = entries.get(&secure_va)?;
        let len = len.min(mapping.len);
        let mut data = vec![0u8; len];
        // SAFETY: the client keeps mapped buffers alive until unmap, and unmap
        // takes the same lock
        unsafe {
            std::ptr::copy_nonoverlapping(mapping.host as *const u8, data.as_mut_ptr(), len);
        }
        Some(data)
    }

    pub(crate) fn write(&self, secure_va: u32, data: &[u8]) -> bool {
        let entries = lock(&self.entries);
        match entries.get(&secure_va) {
            Some(mapping)
                if mapping.direction.contains(MapDirection::OUTPUT) && data.len() <= mapping.len =>
            {
                // SAFETY: see `read`
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        mapping.host as *mut u8,
                        data.len(),
                    );
                }
                true
            }
            _ => false,
        }
    }

    fn insert(&self, secure_va: u32, mapping: SecureMapping) {
        lock(&self.entries).insert(secure_va, mapping);
    }

    fn remove(&self, secure_va: u32) -> Option<SecureMapping> {
        lock(&self.entries).remove(&secure_va)
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// What the worker reports back to `wait_notification`
enum Completion {
    Done,
    /// The trusted application ended abnormally; query the session error code
    Exited,
}

struct MockSession {
    notify_tx: Sender<()>,
    done_rx: Receiver<Completion>,
    error_code: Arc<AtomicI32>,
    worker: JoinHandle<()>,
}

struct Shared {
    counters: Counters,
    faults: Mutex<Faults>,
    mappings: SecureMappings,
}

/// Simulated driver plus secure world
pub struct MockDriver {
    shared: Arc<Shared>,
    apps: Mutex<HashMap<Uuid, TaFactory>>,
    sessions: Mutex<HashMap<SessionHandle, MockSession>>,
    next_handle: AtomicU32,
    next_va: AtomicU32,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                counters: Counters::default(),
                faults: Mutex::new(Faults::default()),
                mappings: SecureMappings::default(),
            }),
            apps: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            next_va: AtomicU32::new(SECURE_VA_BASE),
        }
    }

    /// Install a trusted application for `destination`
    ///
    /// Every session opened to `destination` gets a fresh instance from
    /// `factory`.
    pub fn with_trusted_app<F>(self, destination: Uuid, factory: F) -> Self
    where
        F: Fn() -> Box<dyn TrustedApp> + Send + Sync + 'static,
    {
        lock(&self.apps).insert(destination, Arc::new(factory));
        self
    }

    /// Snapshot of the primitive counters
    pub fn stats(&self) -> MockStats {
        let c = &self.shared.counters;
        MockStats {
            device_opens: c.device_opens.load(Ordering::Relaxed),
            device_closes: c.device_closes.load(Ordering::Relaxed),
            opens: c.opens.load(Ordering::Relaxed),
            closes: c.closes.load(Ordering::Relaxed),
            maps: c.maps.load(Ordering::Relaxed),
            unmaps: c.unmaps.load(Ordering::Relaxed),
            notifies: c.notifies.load(Ordering::Relaxed),
            waits: c.waits.load(Ordering::Relaxed),
        }
    }

    /// Number of buffers currently mapped
    pub fn live_mappings(&self) -> usize {
        self.shared.mappings.len()
    }

    /// Number of sessions currently open at the driver level
    pub fn open_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Make the next `open_device` fail with `error`
    pub fn fail_open_device(&self, error: DriverError) {
        lock(&self.shared.faults).open_device = Some(error);
    }

    /// Make the next `open_session` fail with `error`
    pub fn fail_open(&self, error: DriverError) {
        lock(&self.shared.faults).open_session = Some(error);
    }

    /// Let `successes` more mappings succeed, then fail every mapping
    pub fn fail_map_after(&self, successes: usize) {
        lock(&self.shared.faults).map_budget = Some(successes);
    }

    /// Make every `notify` fail until reset
    pub fn fail_notify(&self, fail: bool) {
        lock(&self.shared.faults).notify = fail;
    }

    /// After the next trusted application run, report `code` as the session
    /// error and make `wait_notification` return `InfoNotification`
    pub fn exit_with_session_error(&self, code: i32) {
        lock(&self.shared.faults).exit_code = Some(code);
    }

    /// Overwrite the result fields of the next run with `(origin, status)`
    pub fn force_result(&self, origin: u32, status: u32) {
        lock(&self.shared.faults).forced_result = Some((origin, status));
    }

    fn session_channels(
        &self,
        handle: SessionHandle,
    ) -> Result<(Sender<()>, Receiver<Completion>)> {
        lock(&self.sessions)
            .get(&handle)
            .map(|s| (s.notify_tx.clone(), s.done_rx.clone()))
            .ok_or(DriverError::InvalidSession(handle.0))
    }
}

impl TeeDriver for MockDriver {
    fn open_device(&self) -> Result<()> {
        bump(&self.shared.counters.device_opens);
        match lock(&self.shared.faults).open_device.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn close_device(&self) -> Result<()> {
        bump(&self.shared.counters.device_closes);
        Ok(())
    }

    fn open_session(
        &self,
        destination: &Uuid,
        login: &Login,
        tci: &SharedPage,
    ) -> Result<SessionHandle> {
        bump(&self.shared.counters.opens);
        if let Some(error) = lock(&self.shared.faults).open_session.take() {
            return Err(error);
        }

        let factory = lock(&self.apps)
            .get(destination)
            .cloned()
            .ok_or(DriverError::TrustedAppNotFound)?;

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (notify_tx, notify_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::unbounded();
        let error_code = Arc::new(AtomicI32::new(SESSION_ERR_NONE));

        // SAFETY: the client keeps the page alive until close_session returns,
        // and close_session joins the worker
        let view = unsafe { tci.view().into_static() };
        let worker = SecureWorker {
            tci: view,
            app: factory(),
            login: *login,
            shared: Arc::clone(&self.shared),
            error_code: Arc::clone(&error_code),
        };
        let join = thread::Builder::new()
            .name(format!("mock-tee-session-{}", handle.0))
            .spawn(move || worker.run(notify_rx, done_tx))
            .map_err(|e| DriverError::Device(e.to_string()))?;

        log::debug!("mock: opened session {} to {}", handle.0, destination);
        lock(&self.sessions).insert(
            handle,
            MockSession {
                notify_tx,
                done_rx,
                error_code,
                worker: join,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, handle: SessionHandle) -> Result<()> {
        bump(&self.shared.counters.closes);
        let MockSession {
            notify_tx, worker, ..
        } = lock(&self.sessions)
            .remove(&handle)
            .ok_or(DriverError::InvalidSession(handle.0))?;

        // Disconnecting the notification channel stops the worker
        drop(notify_tx);
        if worker.join().is_err() {
            log::warn!("mock: worker of session {} panicked", handle.0);
        }
        log::debug!("mock: closed session {}", handle.0);
        Ok(())
    }

    fn map(
        &self,
        handle: SessionHandle,
        buffer: NonNull<u8>,
        len: usize,
        direction: MapDirection,
    ) -> Result<MapInfo> {
        bump(&self.shared.counters.maps);
        if !lock(&self.sessions).contains_key(&handle) {
            return Err(DriverError::InvalidSession(handle.0));
        }
        {
            let mut faults = lock(&self.shared.faults);
            if let Some(budget) = faults.map_budget.as_mut() {
                if *budget == 0 {
                    return Err(DriverError::MappingFailed { len });
                }
                *budget -= 1;
            }
        }

        let mapped_len = u32::try_from(len).map_err(|_| DriverError::MappingFailed { len })?;
        let span = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let span = u32::try_from(span).map_err(|_| DriverError::MappingFailed { len })?;
        let secure_va = self.next_va.fetch_add(span, Ordering::Relaxed);

        self.shared.mappings.insert(
            secure_va,
            SecureMapping {
                host: buffer.as_ptr() as usize,
                len,
                direction,
            },
        );
        Ok(MapInfo {
            secure_va,
            len: mapped_len,
        })
    }

    fn unmap(&self, handle: SessionHandle, buffer: NonNull<u8>, info: &MapInfo) -> Result<()> {
        bump(&self.shared.counters.unmaps);
        match self.shared.mappings.remove(info.secure_va) {
            Some(mapping) if mapping.host == buffer.as_ptr() as usize => Ok(()),
            Some(mapping) => {
                // Put it back, the caller named the wrong buffer
                self.shared.mappings.insert(info.secure_va, mapping);
                Err(DriverError::Device(format!(
                    "session {}: buffer does not match mapping {:#x}",
                    handle.0, info.secure_va
                )))
            }
            None => Err(DriverError::Device(format!(
                "session {}: no mapping at {:#x}",
                handle.0, info.secure_va
            ))),
        }
    }

    fn notify(&self, handle: SessionHandle) -> Result<()> {
        bump(&self.shared.counters.notifies);
        if lock(&self.shared.faults).notify {
            return Err(DriverError::Device("notify failed".into()));
        }
        let (notify_tx, _) = self.session_channels(handle)?;
        notify_tx
            .send(())
            .map_err(|_| DriverError::InvalidSession(handle.0))
    }

    fn wait_notification(&self, handle: SessionHandle, timeout: Timeout) -> Result<()> {
        bump(&self.shared.counters.waits);
        let (_, done_rx) = self.session_channels(handle)?;
        let completion = match timeout {
            Timeout::Infinite => done_rx
                .recv()
                .map_err(|_| DriverError::InvalidSession(handle.0))?,
            Timeout::After(duration) => done_rx.recv_timeout(duration).map_err(|e| match e {
                RecvTimeoutError::Timeout => DriverError::Timeout,
                RecvTimeoutError::Disconnected => DriverError::InvalidSession(handle.0),
            })?,
        };
        match completion {
            Completion::Done => Ok(()),
            Completion::Exited => Err(DriverError::InfoNotification),
        }
    }

    fn session_error_code(&self, handle: SessionHandle) -> Result<i32> {
        lock(&self.sessions)
            .get(&handle)
            .map(|s| s.error_code.load(Ordering::Acquire))
            .ok_or(DriverError::InvalidSession(handle.0))
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        let handles: Vec<SessionHandle> = lock(&self.sessions).keys().copied().collect();
        for handle in handles {
            let _ = self.close_session(handle);
        }
    }
}

/// Secure side of one session
struct SecureWorker {
    tci: TciView<'static>,
    app: Box<dyn TrustedApp>,
    login: Login,
    shared: Arc<Shared>,
    error_code: Arc<AtomicI32>,
}

impl SecureWorker {
    fn run(mut self, notify_rx: Receiver<()>, done_tx: Sender<Completion>) {
        while notify_rx.recv().is_ok() {
            // Wake-ups without a published operation (cancellation) are ignored
            if !self.tci.take_ready() {
                continue;
            }

            self.execute();

            let exit_code = lock(&self.shared.faults).exit_code.take();
            let completion = match exit_code {
                Some(code) => {
                    self.error_code.store(code, Ordering::Release);
                    Completion::Exited
                }
                None => Completion::Done,
            };
            if done_tx.send(completion).is_err() {
                break;
            }
        }
    }

    fn execute(&mut self) {
        let mut ctx = TaContext::new(self.tci, &self.shared.mappings, self.login);

        let outcome = match Instruction::from_raw(self.tci.instruction()) {
            Some(Instruction::OpenSession) => Some(self.app.open_session(&mut ctx)),
            Some(Instruction::InvokeCommand) => {
                let command_id = self.tci.command_id();
                Some(self.app.invoke_command(command_id, &mut ctx))
            }
            Some(Instruction::CloseSession) => {
                self.app.close_session(&mut ctx);
                Some(Ok(()))
            }
            None => None,
        };

        let (origin, status) = match outcome {
            Some(Ok(())) => (TEEC_ORIGIN_TRUSTED_APP, TEEC_SUCCESS),
            Some(Err(code)) => (TEEC_ORIGIN_TRUSTED_APP, code),
            None => {
                log::warn!("mock: unknown instruction {}", self.tci.instruction());
                (TEEC_ORIGIN_TEE, TEEC_ERROR_BAD_PARAMETERS)
            }
        };

        let (origin, status) = lock(&self.shared.faults)
            .forced_result
            .take()
            .unwrap_or((origin, status));
        self.tci.set_result(origin, status);
    }
}
