//! Operations and cancellation
//!
//! An [`Operation`] carries up to four parameters into one call. Its
//! lifecycle marker (not started, started, finished) lives in state shared
//! with every [`CancellationToken`] handed out for it, so another thread can
//! cancel a call that is blocked waiting for the secure world.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use kaal_tci::{pack_param_types, ParamType};

use crate::error::ReturnOrigin;
use crate::lock;
use crate::param::Parameter;

/// Where an operation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progress {
    #[default]
    NotStarted,
    Started,
    /// The call returned or was cancelled
    Finished,
}

/// A session that can be told to abandon its in-flight call
pub(crate) trait CancelTarget: Send + Sync {
    fn signal_cancel(&self);
}

#[derive(Default)]
struct Link {
    progress: Progress,
    target: Option<Weak<dyn CancelTarget>>,
}

/// State shared between an operation and its cancellation tokens
#[derive(Default)]
pub(crate) struct OperationState {
    link: Mutex<Link>,
    changed: Condvar,
    /// `ReturnOrigin::code` of the last call, 0 before the first one
    origin: AtomicU32,
}

impl OperationState {
    /// Mark the operation started and attach it to the session carrying it
    pub(crate) fn begin(&self, target: Weak<dyn CancelTarget>) {
        let mut link = lock(&self.link);
        link.progress = Progress::Started;
        link.target = Some(target);
        self.changed.notify_all();
    }

    /// Mark the operation finished and detach it from its session
    pub(crate) fn finish(&self, origin: ReturnOrigin) {
        self.origin.store(origin.code(), Ordering::Release);
        let mut link = lock(&self.link);
        link.progress = Progress::Finished;
        link.target = None;
        self.changed.notify_all();
    }

    pub(crate) fn progress(&self) -> Progress {
        lock(&self.link).progress
    }

    /// Whether a cancellation already ended the current call
    pub(crate) fn is_cancelled(&self) -> bool {
        self.progress() == Progress::Finished
    }

    fn return_origin(&self) -> Option<ReturnOrigin> {
        ReturnOrigin::from_code(self.origin.load(Ordering::Acquire))
    }

    fn cancel(&self, poll: Duration, limit: Option<Duration>) {
        let deadline = limit.map(|limit| Instant::now() + limit);
        let mut link = lock(&self.link);

        while link.progress == Progress::NotStarted {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::debug!("operation never started, giving up cancellation");
                        return;
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            link = match self.changed.wait_timeout(link, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        if link.progress == Progress::Finished {
            log::debug!("operation already finished, nothing to cancel");
            return;
        }

        link.progress = Progress::Finished;
        let target = link.target.take().and_then(|weak| weak.upgrade());
        drop(link);

        match target {
            Some(target) => target.signal_cancel(),
            None => log::debug!("session gone before cancellation could be signalled"),
        }
    }
}

/// Cancels the call currently carrying an [`Operation`]
///
/// Tokens are cheap to clone and may be sent to other threads. Cancelling is
/// best effort: a trusted application that never polls for cancellation
/// finishes normally.
///
/// A request that races with completion may raise the session's cancel flag
/// after the call has returned. If the next call on that session has already
/// been marshaled by then, it sees the flag and may end as cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<OperationState>,
}

impl CancellationToken {
    /// Poll interval used when no context configuration is at hand
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Request cancellation, waiting as long as needed for the call to start
    pub fn cancel(&self) {
        self.cancel_with(Self::DEFAULT_POLL_INTERVAL, None);
    }

    /// Request cancellation
    ///
    /// Blocks until the operation has started, re-checking every `poll`, and
    /// gives up silently after `limit`. Repeated requests after the first are
    /// no-ops.
    pub fn cancel_with(&self, poll: Duration, limit: Option<Duration>) {
        self.state.cancel(poll, limit);
    }

    pub fn progress(&self) -> Progress {
        self.state.progress()
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("progress", &self.progress())
            .finish()
    }
}

/// Parameters of one open-session or invoke-command call
pub struct Operation<'a> {
    params: [Parameter<'a>; 4],
    state: Arc<OperationState>,
}

impl<'a> Operation<'a> {
    pub fn new(
        p0: Parameter<'a>,
        p1: Parameter<'a>,
        p2: Parameter<'a>,
        p3: Parameter<'a>,
    ) -> Self {
        Self {
            params: [p0, p1, p2, p3],
            state: Arc::default(),
        }
    }

    /// Operation with every slot unused
    pub fn empty() -> Self {
        Self::new(
            Parameter::None,
            Parameter::None,
            Parameter::None,
            Parameter::None,
        )
    }

    /// # Panics
    /// If `index` is not below 4
    pub fn param(&self, index: usize) -> &Parameter<'a> {
        &self.params[index]
    }

    pub fn params(&self) -> &[Parameter<'a>; 4] {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut [Parameter<'a>; 4] {
        &mut self.params
    }

    /// Packed nibble vector of the four slots
    pub fn param_types(&self) -> u32 {
        pack_param_types(self.params.each_ref().map(Parameter::param_type))
    }

    pub fn param_type(&self, index: usize) -> ParamType {
        self.params[index].param_type()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken {
            state: Arc::clone(&self.state),
        }
    }

    pub fn progress(&self) -> Progress {
        self.state.progress()
    }

    /// Layer that produced the result of the last call
    pub fn return_origin(&self) -> Option<ReturnOrigin> {
        self.state.return_origin()
    }

    pub(crate) fn state(&self) -> &Arc<OperationState> {
        &self.state
    }
}

impl Default for Operation<'_> {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for Operation<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Operation")
            .field("params", &self.params)
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct CountingTarget {
        signals: AtomicUsize,
    }

    impl CancelTarget for CountingTarget {
        fn signal_cancel(&self) {
            self.signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attach(operation: &Operation<'_>, target: &Arc<CountingTarget>) {
        let target: Arc<dyn CancelTarget> = target.clone();
        operation.state().begin(Arc::downgrade(&target));
    }

    #[test]
    fn test_new_operation_not_started() {
        let operation = Operation::new(
            Parameter::value_input(1, 2),
            Parameter::None,
            Parameter::None,
            Parameter::value_output(),
        );
        assert_eq!(operation.progress(), Progress::NotStarted);
        assert_eq!(operation.param_types(), 0x2001);
        assert_eq!(operation.return_origin(), None);
    }

    #[test]
    fn test_cancel_signals_once() {
        let operation = Operation::empty();
        let target = Arc::new(CountingTarget::default());
        attach(&operation, &target);

        let token = operation.cancellation_token();
        token.cancel();
        token.cancel();

        assert_eq!(target.signals.load(Ordering::SeqCst), 1);
        assert_eq!(operation.progress(), Progress::Finished);
    }

    #[test]
    fn test_cancel_after_finish_is_noop() {
        let operation = Operation::empty();
        let target = Arc::new(CountingTarget::default());
        attach(&operation, &target);
        operation.state().finish(ReturnOrigin::TrustedApp);

        operation.cancellation_token().cancel();
        assert_eq!(target.signals.load(Ordering::SeqCst), 0);
        assert_eq!(operation.return_origin(), Some(ReturnOrigin::TrustedApp));
    }

    #[test]
    fn test_cancel_waits_for_start() {
        let operation = Operation::empty();
        let token = operation.cancellation_token();
        let target = Arc::new(CountingTarget::default());

        let canceller = thread::spawn(move || token.cancel_with(Duration::from_millis(1), None));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.signals.load(Ordering::SeqCst), 0);

        attach(&operation, &target);
        canceller.join().unwrap();
        assert_eq!(target.signals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_wait_limit() {
        let operation = Operation::empty();
        let started = Instant::now();
        operation
            .cancellation_token()
            .cancel_with(Duration::from_millis(1), Some(Duration::from_millis(15)));

        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(operation.progress(), Progress::NotStarted);
    }

    #[test]
    fn test_cancel_with_dropped_session() {
        let operation = Operation::empty();
        let target = Arc::new(CountingTarget::default());
        attach(&operation, &target);
        drop(target);

        operation.cancellation_token().cancel();
        assert_eq!(operation.progress(), Progress::Finished);
    }
}
