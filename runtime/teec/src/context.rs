//! Client contexts
//!
//! A [`Context`] is the connection to one TEE: it holds the device open for
//! its lifetime, owns the shared memory registry, and hands out sessions
//! that borrow it.

use std::sync::Arc;

use kaal_tci::{TeeDriver, Uuid};

use crate::config::ClientConfig;
use crate::error::{ErrorKind, Result, TeecError};
use crate::operation::{CancellationToken, Operation};
use crate::session::{ConnectionMethod, Session};
use crate::shared_memory::{SharedMemory, SharedMemoryFlags, SharedMemoryRegistry};

/// Connection to a TEE through driver `D`
pub struct Context<D: TeeDriver> {
    driver: Arc<D>,
    config: ClientConfig,
    shared_memory: Arc<SharedMemoryRegistry>,
}

impl<D: TeeDriver> Context<D> {
    /// Initialize a context with the default configuration
    ///
    /// # Errors
    /// See [`Context::with_config`]
    pub fn initialize(driver: D, name: Option<&str>) -> Result<Self> {
        Self::with_config(driver, name, ClientConfig::default())
    }

    /// Initialize a context
    ///
    /// `name` selects the TEE; `None` means the configured default.
    ///
    /// # Errors
    /// - `BadParameters` (origin api) if `config` is out of range
    /// - `ItemNotFound` (origin api) if `name` is not the configured device
    /// - `Communication` (origin comms) if the device cannot be opened
    pub fn with_config(driver: D, name: Option<&str>, config: ClientConfig) -> Result<Self> {
        if let Err(e) = config.validate() {
            log::error!("rejecting client configuration: {}", e);
            return Err(TeecError::api(ErrorKind::BadParameters));
        }
        if let Some(name) = name {
            if name != config.device_name {
                log::warn!("unknown TEE '{}' (have '{}')", name, config.device_name);
                return Err(TeecError::api(ErrorKind::ItemNotFound));
            }
        }

        driver.open_device().map_err(|e| {
            log::error!("cannot open {}: {}", config.device_name, e);
            TeecError::comms(ErrorKind::Communication)
        })?;

        log::info!("context initialized on {}", config.device_name);
        Ok(Self {
            driver: Arc::new(driver),
            config,
            shared_memory: Arc::default(),
        })
    }

    /// Finalize the context
    ///
    /// Equivalent to dropping it.
    pub fn finalize(self) {}

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn driver_handle(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a session with the trusted application `destination`
    ///
    /// `operation`, if given, is delivered to the trusted application's
    /// open-session entry point.
    pub fn open_session(
        &self,
        destination: &Uuid,
        method: ConnectionMethod,
        operation: Option<&mut Operation<'_>>,
    ) -> Result<Session<'_, D>> {
        Session::open(self, destination, method, operation)
    }

    /// Register a caller buffer as shared memory
    ///
    /// # Errors
    /// `BadParameters` for invalid flags or a buffer over the size limit
    pub fn register_shared_memory<'buf>(
        &self,
        buffer: &'buf mut [u8],
        flags: SharedMemoryFlags,
    ) -> Result<SharedMemory<'buf>> {
        self.shared_memory
            .register(buffer, flags, self.config.max_shared_memory_size)
    }

    /// Allocate a zeroed shared memory block
    ///
    /// # Errors
    /// - `BadParameters` for invalid flags
    /// - `OutOfMemory` above the size limit
    pub fn allocate_shared_memory(
        &self,
        size: usize,
        flags: SharedMemoryFlags,
    ) -> Result<SharedMemory<'static>> {
        self.shared_memory
            .allocate(size, flags, self.config.max_shared_memory_size)
    }

    /// Release a shared memory block; equivalent to dropping it
    pub fn release_shared_memory(&self, block: SharedMemory<'_>) {
        block.release();
    }

    /// Cancel the call carrying the token's operation, using this context's
    /// poll interval and wait limit
    pub fn request_cancellation(&self, token: &CancellationToken) {
        token.cancel_with(
            self.config.cancel_poll_interval(),
            self.config.cancel_wait_limit(),
        );
    }

    /// Live registered blocks
    pub fn registered_blocks(&self) -> usize {
        self.shared_memory.registered_blocks()
    }

    /// Live allocated blocks
    pub fn allocated_blocks(&self) -> usize {
        self.shared_memory.allocated_blocks()
    }
}

impl<D: TeeDriver> Drop for Context<D> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.close_device() {
            log::warn!("closing {} failed: {}", self.config.device_name, e);
        }
        log::info!("context on {} finalized", self.config.device_name);
    }
}

impl<D: TeeDriver> core::fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.config.device_name)
            .field("registered_blocks", &self.registered_blocks())
            .field("allocated_blocks", &self.allocated_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaal_tci::DriverError;
    use kaal_tee_mock::MockDriver;

    #[test]
    fn test_initialize_and_finalize() {
        let context = Context::initialize(MockDriver::new(), None).unwrap();
        assert_eq!(context.driver().stats().device_opens, 1);
        context.finalize();
    }

    #[test]
    fn test_named_device() {
        assert!(Context::initialize(MockDriver::new(), Some("kaal-tee")).is_ok());
        let result = Context::initialize(MockDriver::new(), Some("other-tee"));
        assert_eq!(result.unwrap_err(), TeecError::api(ErrorKind::ItemNotFound));
    }

    #[test]
    fn test_device_open_failure() {
        let driver = MockDriver::new();
        driver.fail_open_device(DriverError::Device("no such device".into()));
        let result = Context::initialize(driver, None);
        assert_eq!(
            result.unwrap_err(),
            TeecError::comms(ErrorKind::Communication)
        );
    }

    #[test]
    fn test_invalid_config() {
        let config = ClientConfig {
            cancel_poll_interval_ms: 0,
            ..ClientConfig::default()
        };
        let result = Context::with_config(MockDriver::new(), None, config);
        assert_eq!(result.unwrap_err(), TeecError::api(ErrorKind::BadParameters));
    }

    #[test]
    fn test_shared_memory_accounting() {
        let config = ClientConfig {
            max_shared_memory_size: 128,
            ..ClientConfig::default()
        };
        let context = Context::with_config(MockDriver::new(), None, config).unwrap();
        let mut buffer = [0u8; 16];

        let registered = context
            .register_shared_memory(&mut buffer, SharedMemoryFlags::INPUT)
            .unwrap();
        let allocated = context
            .allocate_shared_memory(64, SharedMemoryFlags::OUTPUT)
            .unwrap();
        assert_eq!(context.registered_blocks(), 1);
        assert_eq!(context.allocated_blocks(), 1);

        assert!(context
            .allocate_shared_memory(256, SharedMemoryFlags::OUTPUT)
            .is_err());

        context.release_shared_memory(registered);
        context.release_shared_memory(allocated);
        assert_eq!(context.registered_blocks(), 0);
        assert_eq!(context.allocated_blocks(), 0);
    }
}
