//! Simulated trusted applications

use kaal_tci::{
    param_type_at, Login, ParamType, TciView, Uuid, WireParam, TEEC_ERROR_ACCESS_DENIED,
    TEEC_ERROR_BAD_PARAMETERS, TEEC_ERROR_SHORT_BUFFER,
};

use crate::driver::SecureMappings;

/// Result of a trusted application entry point: `Err` carries the TA's own
/// return code.
pub type TaResult = Result<(), u32>;

/// Entry points of a simulated trusted application
///
/// One instance is created per session and lives on that session's worker
/// thread.
pub trait TrustedApp: Send + 'static {
    /// Called for the open-session instruction
    fn open_session(&mut self, _ctx: &mut TaContext<'_>) -> TaResult {
        Ok(())
    }

    /// Called for the invoke-command instruction
    fn invoke_command(&mut self, command_id: u32, ctx: &mut TaContext<'_>) -> TaResult;

    /// Called for the close-session instruction
    fn close_session(&mut self, _ctx: &mut TaContext<'_>) {}
}

/// Trusted application built from a closure handling every invoke-command
pub struct FnTrustedApp<F> {
    handler: F,
}

impl<F> FnTrustedApp<F>
where
    F: FnMut(u32, &mut TaContext<'_>) -> TaResult + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> TrustedApp for FnTrustedApp<F>
where
    F: FnMut(u32, &mut TaContext<'_>) -> TaResult + Send + 'static,
{
    fn invoke_command(&mut self, command_id: u32, ctx: &mut TaContext<'_>) -> TaResult {
        (self.handler)(command_id, ctx)
    }
}

/// Secure-world view of the operation currently being executed
pub struct TaContext<'a> {
    tci: TciView<'static>,
    mappings: &'a SecureMappings,
    login: Login,
}

impl<'a> TaContext<'a> {
    pub(crate) fn new(tci: TciView<'static>, mappings: &'a SecureMappings, login: Login) -> Self {
        Self {
            tci,
            mappings,
            login,
        }
    }

    /// Identity the session was opened for
    pub fn destination(&self) -> Uuid {
        self.tci.destination()
    }

    /// Login the client bound to the session
    pub fn login(&self) -> Login {
        self.login
    }

    /// Type of slot `index` as transmitted on the wire
    ///
    /// # Errors
    /// Returns `TEEC_ERROR_BAD_PARAMETERS` for an undefined nibble
    pub fn param_type(&self, index: usize) -> Result<ParamType, u32> {
        param_type_at(self.tci.param_types(), index).map_err(|_| TEEC_ERROR_BAD_PARAMETERS)
    }

    /// Value pair of slot `index`
    pub fn value(&self, index: usize) -> (u32, u32) {
        let param = self.tci.param(index);
        (param.a(), param.b())
    }

    /// Overwrite the value pair of slot `index`
    pub fn set_value(&mut self, index: usize, a: u32, b: u32) {
        self.tci.set_param(index, WireParam::value(a, b));
    }

    /// Buffer size the client declared for slot `index`
    pub fn memref_capacity(&self, index: usize) -> u32 {
        self.tci.param(index).output_size()
    }

    /// Whether slot `index` carries a mapped buffer
    pub fn is_mapped(&self, index: usize) -> bool {
        self.tci.param(index).mapped_len() != 0
    }

    /// Copy the mapped buffer of slot `index`
    ///
    /// # Returns
    /// `None` if the slot was not mapped (zero size or size query)
    pub fn read_memref(&self, index: usize) -> Option<Vec<u8>> {
        let param = self.tci.param(index);
        if param.mapped_len() == 0 {
            return None;
        }
        self.mappings.read(param.secure_va(), param.mapped_len() as usize)
    }

    /// Write `data` to the start of the mapped buffer of slot `index` and
    /// report its length as the output size
    ///
    /// # Errors
    /// - `TEEC_ERROR_SHORT_BUFFER` if `data` does not fit (the required size is
    ///   still reported)
    /// - `TEEC_ERROR_ACCESS_DENIED` if the mapping is input-only
    pub fn write_memref(&mut self, index: usize, data: &[u8]) -> TaResult {
        let mut param = self.tci.param(index);
        param.set_output_size(data.len() as u32);
        self.tci.set_param(index, param);

        if data.len() > param.mapped_len() as usize {
            return Err(TEEC_ERROR_SHORT_BUFFER);
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.mappings.write(param.secure_va(), data) {
            Ok(())
        } else {
            Err(TEEC_ERROR_ACCESS_DENIED)
        }
    }

    /// Report `size` bytes produced for slot `index` without writing data
    pub fn set_output_size(&mut self, index: usize, size: u32) {
        let mut param = self.tci.param(index);
        param.set_output_size(size);
        self.tci.set_param(index, param);
    }

    /// Whether the client requested cancellation of this operation
    pub fn is_cancelled(&self) -> bool {
        self.tci.is_cancelled()
    }
}
