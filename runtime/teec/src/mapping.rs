//! Per-call buffer mappings
//!
//! [`MappingTable`] owns the mappings made while marshaling one call. Every
//! mapping still held when the table goes out of scope is removed in reverse
//! slot order, so no exit path of a call can leak one.

use core::ptr::NonNull;

use kaal_tci::{DriverError, MapDirection, MapInfo, SessionHandle, TeeDriver};

struct Mapping {
    buffer: NonNull<u8>,
    info: MapInfo,
}

pub(crate) struct MappingTable<'d, D: TeeDriver> {
    driver: &'d D,
    handle: SessionHandle,
    slots: [Option<Mapping>; 4],
}

impl<'d, D: TeeDriver> MappingTable<'d, D> {
    pub(crate) fn new(driver: &'d D, handle: SessionHandle) -> Self {
        Self {
            driver,
            handle,
            slots: [None, None, None, None],
        }
    }

    /// Map a buffer for `slot`
    pub(crate) fn map(
        &mut self,
        slot: usize,
        buffer: NonNull<u8>,
        len: usize,
        direction: MapDirection,
    ) -> Result<MapInfo, DriverError> {
        debug_assert!(self.slots[slot].is_none());
        let info = self.driver.map(self.handle, buffer, len, direction)?;
        log::trace!(
            "slot {}: mapped {} bytes at secure va {:#x}",
            slot,
            len,
            info.secure_va
        );
        self.slots[slot] = Some(Mapping { buffer, info });
        Ok(info)
    }

    pub(crate) fn is_mapped(&self, slot: usize) -> bool {
        self.slots[slot].is_some()
    }

    /// Unmap the buffer of `slot`, if any; failures are logged
    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(mapping) = self.slots[slot].take() {
            if let Err(e) = self.driver.unmap(self.handle, mapping.buffer, &mapping.info) {
                log::error!("slot {}: unmap failed: {}", slot, e);
            }
        }
    }

    pub(crate) fn mapped_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<D: TeeDriver> Drop for MappingTable<'_, D> {
    fn drop(&mut self) {
        for slot in (0..self.slots.len()).rev() {
            self.release(slot);
        }
    }
}
