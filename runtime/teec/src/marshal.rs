//! Translating operations into the TCI and back
//!
//! [`marshal`] fills the operation record and maps every memory reference;
//! [`unwind`] copies results back into the caller's operation and removes the
//! mappings. The ready flag is always the last field written.

use core::ptr::NonNull;

use kaal_tci::{
    pack_param_types, Instruction, MapDirection, ParamType, SessionHandle, TciView, TeeDriver,
    WireParam, DIRECTION_INPUT, TCI_FORMAT_TAG, TEEC_ERROR_BAD_STATE, TEEC_SUCCESS,
};

use crate::error::{ErrorKind, ReturnOrigin, Result, TeecError};
use crate::mapping::MappingTable;
use crate::operation::Operation;
use crate::param::Parameter;
use crate::shared_memory::SharedMemory;

/// Publish one call in the TCI
///
/// On success the returned table holds the mappings of this call. On failure
/// the operation record is cleared, nothing stays mapped, and the ready flag
/// is left unset.
///
/// # Errors
/// - `BadParameters` (origin api) for a malformed parameter
/// - `Communication` (origin comms) if a buffer could not be mapped
/// - `Cancel` (origin comms) if the operation was cancelled meanwhile
pub(crate) fn marshal<'d, D: TeeDriver>(
    driver: &'d D,
    handle: SessionHandle,
    tci: TciView<'_>,
    instruction: Instruction,
    command_id: u32,
    operation: Option<&Operation<'_>>,
) -> Result<MappingTable<'d, D>> {
    tci.set_ready(false);
    tci.clear_operation();

    let mut mappings = MappingTable::new(driver, handle);
    let types = match operation {
        Some(operation) => match marshal_params(&mut mappings, tci, operation) {
            Ok(types) => types,
            Err(e) => {
                tci.clear_operation();
                return Err(e);
            }
        },
        None => [ParamType::None; 4],
    };

    tci.set_format_tag(TCI_FORMAT_TAG);
    tci.set_instruction(instruction as u32);
    tci.set_command_id(command_id);
    tci.set_param_types(pack_param_types(types));
    // Overwritten by the secure world; left as is it fails the result check
    tci.set_result(0, TEEC_ERROR_BAD_STATE);
    tci.set_ready(true);

    log::trace!(
        "{:?} {:#x}: published, {} buffer(s) mapped",
        instruction,
        command_id,
        mappings.mapped_slots()
    );
    Ok(mappings)
}

fn marshal_params<D: TeeDriver>(
    mappings: &mut MappingTable<'_, D>,
    tci: TciView<'_>,
    operation: &Operation<'_>,
) -> Result<[ParamType; 4]> {
    let mut types = [ParamType::None; 4];
    for (slot, param) in operation.params().iter().enumerate() {
        let (param_type, wire) = marshal_param(mappings, slot, param)?;
        types[slot] = param_type;
        tci.set_param(slot, wire);
    }

    if operation.state().is_cancelled() {
        log::debug!("operation cancelled while marshaling");
        return Err(TeecError::comms(ErrorKind::Cancel));
    }
    Ok(types)
}

fn marshal_param<D: TeeDriver>(
    mappings: &mut MappingTable<'_, D>,
    slot: usize,
    param: &Parameter<'_>,
) -> Result<(ParamType, WireParam)> {
    let wire = match param {
        Parameter::None => WireParam::default(),
        Parameter::Value { direction, a, b } => {
            if direction.bits() & DIRECTION_INPUT != 0 {
                WireParam::value(*a, *b)
            } else {
                WireParam::default()
            }
        }
        Parameter::Temp(temp) => {
            let size = wire_size(slot, temp.size())?;
            match temp.buffer() {
                Some(buffer) if temp.size() > 0 => {
                    let info = map_slot(
                        mappings,
                        slot,
                        buffer,
                        temp.size(),
                        temp.direction().map_direction(),
                    )?;
                    WireParam::memref(info.secure_va, info.len, size)
                }
                _ => WireParam::memref(0, 0, size),
            }
        }
        Parameter::Whole { parent, .. } => {
            let flags = parent.flags();
            let wire = map_block(mappings, slot, parent, 0, parent.size(), flags.map_direction())?;
            // Sent as a partial reference covering the block
            return Ok((ParamType::memref_with_direction(flags.bits() as u8), wire));
        }
        Parameter::Partial {
            direction,
            parent,
            offset,
            size,
        } => {
            if !parent.flags().contains(direction.shared_memory_flags()) {
                log::warn!(
                    "slot {}: {:?} reference into a {:?} block",
                    slot,
                    direction,
                    parent.flags()
                );
                return Err(TeecError::api(ErrorKind::BadParameters));
            }
            let in_bounds = offset
                .checked_add(*size)
                .is_some_and(|end| end <= parent.size());
            if !in_bounds {
                log::warn!(
                    "slot {}: window {}+{} exceeds block of {} bytes",
                    slot,
                    offset,
                    size,
                    parent.size()
                );
                return Err(TeecError::api(ErrorKind::BadParameters));
            }
            map_block(mappings, slot, parent, *offset, *size, direction.map_direction())?
        }
    };
    Ok((param.param_type(), wire))
}

/// Map `[offset, offset + len)` of a shared memory block
fn map_block<D: TeeDriver>(
    mappings: &mut MappingTable<'_, D>,
    slot: usize,
    parent: &SharedMemory<'_>,
    offset: usize,
    len: usize,
    direction: MapDirection,
) -> Result<WireParam> {
    let size = wire_size(slot, len)?;
    match parent.buffer() {
        Some(buffer) if len > 0 => {
            // SAFETY: offset + len <= parent.size(), checked by the caller
            let start = unsafe { NonNull::new_unchecked(buffer.as_ptr().add(offset)) };
            let info = map_slot(mappings, slot, start, len, direction)?;
            Ok(WireParam::memref(info.secure_va, info.len, size))
        }
        _ => Ok(WireParam::memref(0, 0, size)),
    }
}

fn map_slot<D: TeeDriver>(
    mappings: &mut MappingTable<'_, D>,
    slot: usize,
    buffer: NonNull<u8>,
    len: usize,
    direction: MapDirection,
) -> Result<kaal_tci::MapInfo> {
    mappings.map(slot, buffer, len, direction).map_err(|e| {
        log::error!("slot {}: mapping {} bytes failed: {}", slot, len, e);
        TeecError::comms(ErrorKind::Communication)
    })
}

fn wire_size(slot: usize, size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| {
        log::warn!("slot {}: {} bytes do not fit the wire format", slot, size);
        TeecError::api(ErrorKind::BadParameters)
    })
}

/// Collect the result of a finished call and remove its mappings
///
/// Output values and produced sizes are copied into `operation` only when
/// `copy_back` is set and the result fields pass the consistency check. The
/// mappings are removed on every path.
///
/// # Errors
/// - `Communication` (origin comms) if the result fields are inconsistent
/// - the reported status, with the reported origin, if it is not success
pub(crate) fn unwind<D: TeeDriver>(
    tci: TciView<'_>,
    operation: Option<&mut Operation<'_>>,
    mut mappings: MappingTable<'_, D>,
    copy_back: bool,
) -> Result<ReturnOrigin> {
    let origin_code = tci.return_origin();
    let status = tci.return_status();
    let origin = ReturnOrigin::from_code(origin_code)
        .filter(|origin| *origin == ReturnOrigin::TrustedApp || status == TEEC_SUCCESS);

    if let Some(operation) = operation {
        let copy_back = copy_back && origin.is_some();
        for (slot, param) in operation.params_mut().iter_mut().enumerate() {
            let wire = tci.param(slot);
            if copy_back && param.writes_back() {
                match param {
                    Parameter::None => {}
                    Parameter::Value { .. } => param.set_value(wire.a(), wire.b()),
                    _ => param.set_size(wire.output_size() as usize),
                }
            }
            if mappings.is_mapped(slot) != (wire.mapped_len() != 0) {
                log::warn!("slot {}: mapping marker does not match the mapping table", slot);
            }
            mappings.release(slot);
        }
    }
    drop(mappings);

    let Some(origin) = origin else {
        log::error!(
            "inconsistent result: origin {:#x}, status {:#010x}",
            origin_code,
            status
        );
        return Err(TeecError::comms(ErrorKind::Communication));
    };

    if status == TEEC_SUCCESS {
        Ok(origin)
    } else {
        Err(TeecError::new(ErrorKind::from_code(status), origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kaal_tci::{
        Login, SharedPage, Uuid, TEEC_ERROR_SHORT_BUFFER, TEEC_ORIGIN_TEE, TEEC_ORIGIN_TRUSTED_APP,
    };
    use kaal_tee_mock::{FnTrustedApp, MockDriver};

    use crate::operation::CancelTarget;
    use crate::param::Direction;
    use crate::shared_memory::{SharedMemoryFlags, SharedMemoryRegistry};

    const TA: Uuid = Uuid::new(0xfeed_f00d, 1, 2, [0; 8]);

    struct Fixture {
        driver: MockDriver,
        page: SharedPage,
        handle: SessionHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = MockDriver::new().with_trusted_app(TA, || {
                Box::new(FnTrustedApp::new(|_, _| Ok(())))
            });
            let page = SharedPage::new().unwrap();
            let handle = driver
                .open_session(&TA, &Login { method: 0, data: 0 }, &page)
                .unwrap();
            Self {
                driver,
                page,
                handle,
            }
        }

        fn marshal(&self, operation: &Operation<'_>) -> Result<MappingTable<'_, MockDriver>> {
            marshal(
                &self.driver,
                self.handle,
                self.page.view(),
                Instruction::InvokeCommand,
                7,
                Some(operation),
            )
        }
    }

    struct IdleTarget;

    impl CancelTarget for IdleTarget {
        fn signal_cancel(&self) {}
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.driver.close_session(self.handle);
        }
    }

    #[test]
    fn test_marshal_fills_record() {
        let fixture = Fixture::new();
        let mut buffer = [0u8; 32];
        let operation = Operation::new(
            Parameter::value_input(1, 2),
            Parameter::tmp_output(&mut buffer),
            Parameter::None,
            Parameter::value_output(),
        );

        let mappings = fixture.marshal(&operation).unwrap();
        let tci = fixture.page.view().snapshot();
        assert_eq!(tci.format_tag, TCI_FORMAT_TAG);
        assert_eq!(tci.operation.instruction, Instruction::InvokeCommand as u32);
        assert_eq!(tci.operation.command_id, 7);
        assert_eq!(tci.operation.param_types, 0x2061);
        assert_eq!(tci.operation.params[0], WireParam::value(1, 2));
        assert_ne!(tci.operation.params[1].mapped_len(), 0);
        assert_eq!(tci.operation.params[1].output_size(), 32);
        assert_eq!(tci.ready, 1);
        assert_eq!(mappings.mapped_slots(), 1);
    }

    #[test]
    fn test_whole_reference_sent_as_partial() {
        let fixture = Fixture::new();
        let registry = Arc::new(SharedMemoryRegistry::default());
        let block = registry
            .allocate(64, SharedMemoryFlags::INPUT, usize::MAX)
            .unwrap();
        let operation = Operation::new(
            Parameter::whole(&block),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );

        let _mappings = fixture.marshal(&operation).unwrap();
        let tci = fixture.page.view().snapshot();
        assert_eq!(tci.operation.param_types & 0xF, ParamType::PartialInput.raw() as u32);
        assert_eq!(tci.operation.params[0].output_size(), 64);
    }

    #[test]
    fn test_partial_out_of_bounds() {
        let fixture = Fixture::new();
        let registry = Arc::new(SharedMemoryRegistry::default());
        let block = registry
            .allocate(16, SharedMemoryFlags::all(), usize::MAX)
            .unwrap();
        let mut scratch = [0u8; 4];
        let operation = Operation::new(
            Parameter::tmp_inout(&mut scratch),
            Parameter::partial(Direction::Input, &block, 8, 9),
            Parameter::None,
            Parameter::None,
        );

        let result = fixture.marshal(&operation);
        assert_eq!(result.err(), Some(TeecError::api(ErrorKind::BadParameters)));
        // The mapping made for slot 0 was undone
        assert_eq!(fixture.driver.live_mappings(), 0);
        let tci = fixture.page.view().snapshot();
        assert_eq!(tci.ready, 0);
        assert_eq!(tci.operation.param_types, 0);
    }

    #[test]
    fn test_partial_direction_must_match_block() {
        let fixture = Fixture::new();
        let registry = Arc::new(SharedMemoryRegistry::default());
        let block = registry
            .allocate(16, SharedMemoryFlags::INPUT, usize::MAX)
            .unwrap();
        let operation = Operation::new(
            Parameter::partial(Direction::Output, &block, 0, 4),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );

        let result = fixture.marshal(&operation);
        assert_eq!(result.err(), Some(TeecError::api(ErrorKind::BadParameters)));
    }

    #[test]
    fn test_mapping_failure() {
        let fixture = Fixture::new();
        fixture.driver.fail_map_after(1);
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let operation = Operation::new(
            Parameter::tmp_inout(&mut a),
            Parameter::tmp_inout(&mut b),
            Parameter::None,
            Parameter::None,
        );

        let result = fixture.marshal(&operation);
        assert_eq!(result.err(), Some(TeecError::comms(ErrorKind::Communication)));
        assert_eq!(fixture.driver.live_mappings(), 0);
    }

    #[test]
    fn test_cancelled_while_marshaling() {
        let fixture = Fixture::new();
        let mut buffer = [0u8; 8];
        let operation = Operation::new(
            Parameter::tmp_inout(&mut buffer),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );
        let target: Arc<dyn CancelTarget> = Arc::new(IdleTarget);
        operation.state().begin(Arc::downgrade(&target));
        operation.cancellation_token().cancel();

        let result = fixture.marshal(&operation);
        assert_eq!(result.err(), Some(TeecError::comms(ErrorKind::Cancel)));
        // The buffer was mapped, then released on abort
        assert_eq!(fixture.driver.stats().maps, 1);
        assert_eq!(fixture.driver.live_mappings(), 0);
        let tci = fixture.page.view().snapshot();
        assert_eq!(tci.ready, 0);
        assert_eq!(tci.operation.param_types, 0);
    }

    #[test]
    fn test_size_query_is_not_mapped() {
        let fixture = Fixture::new();
        let operation = Operation::new(
            Parameter::tmp_size_query(Direction::Output, 0),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );

        let mappings = fixture.marshal(&operation).unwrap();
        assert_eq!(mappings.mapped_slots(), 0);
        assert_eq!(fixture.page.view().param(0), WireParam::memref(0, 0, 0));
    }

    #[test]
    fn test_unwind_copies_outputs() {
        let fixture = Fixture::new();
        let mut buffer = [0u8; 32];
        let mut operation = Operation::new(
            Parameter::value_inout(1, 2),
            Parameter::tmp_output(&mut buffer),
            Parameter::None,
            Parameter::None,
        );
        let mappings = fixture.marshal(&operation).unwrap();

        let tci = fixture.page.view();
        tci.set_param(0, WireParam::value(10, 20));
        let mut produced = tci.param(1);
        produced.set_output_size(48);
        tci.set_param(1, produced);
        tci.set_result(TEEC_ORIGIN_TRUSTED_APP, TEEC_ERROR_SHORT_BUFFER);

        let result = unwind(tci, Some(&mut operation), mappings, true);
        assert_eq!(
            result,
            Err(TeecError::new(ErrorKind::ShortBuffer, ReturnOrigin::TrustedApp))
        );
        assert_eq!(operation.param(0).value(), Some((10, 20)));
        assert_eq!(operation.param(1).size(), Some(48));
        assert_eq!(fixture.driver.live_mappings(), 0);
    }

    #[test]
    fn test_unwind_without_copy_back() {
        let fixture = Fixture::new();
        let mut operation = Operation::new(
            Parameter::value_output(),
            Parameter::None,
            Parameter::None,
            Parameter::None,
        );
        let mappings = fixture.marshal(&operation).unwrap();
        let tci = fixture.page.view();
        tci.set_param(0, WireParam::value(3, 4));
        tci.set_result(TEEC_ORIGIN_TRUSTED_APP, TEEC_SUCCESS);

        let result = unwind(tci, Some(&mut operation), mappings, false);
        assert_eq!(result, Ok(ReturnOrigin::TrustedApp));
        assert_eq!(operation.param(0).value(), Some((0, 0)));
    }

    #[test]
    fn test_unwind_rejects_untouched_result() {
        let fixture = Fixture::new();
        let mut operation = Operation::empty();
        let mappings = fixture.marshal(&operation).unwrap();

        let result = unwind(fixture.page.view(), Some(&mut operation), mappings, true);
        assert_eq!(result, Err(TeecError::comms(ErrorKind::Communication)));
    }

    #[test]
    fn test_unwind_rejects_failed_status_from_tee() {
        let fixture = Fixture::new();
        let mappings = fixture.marshal(&Operation::empty()).unwrap();
        let tci = fixture.page.view();
        tci.set_result(TEEC_ORIGIN_TEE, TEEC_ERROR_SHORT_BUFFER);

        let result = unwind(tci, None, mappings, true);
        assert_eq!(result, Err(TeecError::comms(ErrorKind::Communication)));
    }
}
