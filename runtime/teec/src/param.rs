//! Operation parameters
//!
//! Each of the four slots of an [`Operation`](crate::Operation) holds one
//! [`Parameter`]. Memory references borrow their buffer (or shared memory
//! block) for the lifetime of the operation, so a buffer cannot be touched
//! by the caller while the secure world may be writing it.

use core::marker::PhantomData;
use core::ptr::NonNull;

use kaal_tci::{MapDirection, ParamType, DIRECTION_INPUT, DIRECTION_OUTPUT};

use crate::shared_memory::{SharedMemory, SharedMemoryFlags};

/// Data flow of a value or memory reference parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
    Inout,
}

impl Direction {
    pub(crate) const fn bits(self) -> u8 {
        match self {
            Self::Input => DIRECTION_INPUT,
            Self::Output => DIRECTION_OUTPUT,
            Self::Inout => DIRECTION_INPUT | DIRECTION_OUTPUT,
        }
    }

    pub(crate) const fn writes_back(self) -> bool {
        self.bits() & DIRECTION_OUTPUT != 0
    }

    pub(crate) fn map_direction(self) -> MapDirection {
        MapDirection::from_bits_truncate(self.bits() as u32)
    }

    pub(crate) fn shared_memory_flags(self) -> SharedMemoryFlags {
        SharedMemoryFlags::from_bits_truncate(self.bits() as u32)
    }
}

/// Temporary memory reference: a caller buffer shared for one call
///
/// A reference without a buffer is a size query; the trusted application
/// reports the size it needs through [`TempMemRef::size`].
#[derive(Debug)]
pub struct TempMemRef<'a> {
    direction: Direction,
    buffer: Option<NonNull<u8>>,
    size: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> TempMemRef<'a> {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Buffer size before the call, produced size after it
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn buffer(&self) -> Option<NonNull<u8>> {
        self.buffer
    }
}

/// One operation parameter slot
#[derive(Debug, Default)]
pub enum Parameter<'a> {
    #[default]
    None,
    Value {
        direction: Direction,
        a: u32,
        b: u32,
    },
    Temp(TempMemRef<'a>),
    /// The whole of a shared memory block, with the block's own direction
    Whole {
        parent: &'a SharedMemory<'a>,
        size: usize,
    },
    /// A window `[offset, offset + size)` of a shared memory block
    Partial {
        direction: Direction,
        parent: &'a SharedMemory<'a>,
        offset: usize,
        size: usize,
    },
}

impl<'a> Parameter<'a> {
    pub fn value_input(a: u32, b: u32) -> Self {
        Self::Value {
            direction: Direction::Input,
            a,
            b,
        }
    }

    pub fn value_output() -> Self {
        Self::Value {
            direction: Direction::Output,
            a: 0,
            b: 0,
        }
    }

    pub fn value_inout(a: u32, b: u32) -> Self {
        Self::Value {
            direction: Direction::Inout,
            a,
            b,
        }
    }

    pub fn tmp_input(buffer: &'a [u8]) -> Self {
        Self::Temp(TempMemRef {
            direction: Direction::Input,
            buffer: NonNull::new(buffer.as_ptr() as *mut u8),
            size: buffer.len(),
            _buffer: PhantomData,
        })
    }

    pub fn tmp_output(buffer: &'a mut [u8]) -> Self {
        Self::tmp_writable(Direction::Output, buffer)
    }

    pub fn tmp_inout(buffer: &'a mut [u8]) -> Self {
        Self::tmp_writable(Direction::Inout, buffer)
    }

    fn tmp_writable(direction: Direction, buffer: &'a mut [u8]) -> Self {
        Self::Temp(TempMemRef {
            direction,
            buffer: NonNull::new(buffer.as_mut_ptr()),
            size: buffer.len(),
            _buffer: PhantomData,
        })
    }

    /// Temporary reference without a buffer: asks the trusted application
    /// how large the buffer must be
    pub fn tmp_size_query(direction: Direction, size: usize) -> Self {
        Self::Temp(TempMemRef {
            direction,
            buffer: None,
            size,
            _buffer: PhantomData,
        })
    }

    pub fn whole(parent: &'a SharedMemory<'a>) -> Self {
        Self::Whole {
            parent,
            size: parent.size(),
        }
    }

    pub fn partial(
        direction: Direction,
        parent: &'a SharedMemory<'a>,
        offset: usize,
        size: usize,
    ) -> Self {
        Self::Partial {
            direction,
            parent,
            offset,
            size,
        }
    }

    /// Nibble this slot is sent with
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::None => ParamType::None,
            Self::Value { direction, .. } => match direction {
                Direction::Input => ParamType::ValueInput,
                Direction::Output => ParamType::ValueOutput,
                Direction::Inout => ParamType::ValueInout,
            },
            Self::Temp(temp) => match temp.direction {
                Direction::Input => ParamType::TempInput,
                Direction::Output => ParamType::TempOutput,
                Direction::Inout => ParamType::TempInout,
            },
            Self::Whole { .. } => ParamType::Whole,
            Self::Partial { direction, .. } => match direction {
                Direction::Input => ParamType::PartialInput,
                Direction::Output => ParamType::PartialOutput,
                Direction::Inout => ParamType::PartialInout,
            },
        }
    }

    /// `(a, b)` of a value parameter
    pub fn value(&self) -> Option<(u32, u32)> {
        match self {
            Self::Value { a, b, .. } => Some((*a, *b)),
            _ => None,
        }
    }

    /// Size of a memory reference (produced size after the call)
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Temp(temp) => Some(temp.size),
            Self::Whole { size, .. } | Self::Partial { size, .. } => Some(*size),
            _ => None,
        }
    }

    /// Record the size reported by the secure world
    pub(crate) fn set_size(&mut self, produced: usize) {
        match self {
            Self::Temp(temp) => temp.size = produced,
            Self::Whole { size, .. } | Self::Partial { size, .. } => *size = produced,
            _ => {}
        }
    }

    pub(crate) fn set_value(&mut self, new_a: u32, new_b: u32) {
        if let Self::Value { a, b, .. } = self {
            *a = new_a;
            *b = new_b;
        }
    }

    /// Whether the secure world reports data back through this slot
    pub(crate) fn writes_back(&self) -> bool {
        match self {
            Self::None => false,
            Self::Value { direction, .. } | Self::Partial { direction, .. } => {
                direction.writes_back()
            }
            Self::Temp(temp) => temp.direction.writes_back(),
            Self::Whole { parent, .. } => parent.flags().contains(SharedMemoryFlags::OUTPUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaal_tci::pack_param_types;

    #[test]
    fn test_param_types() {
        let mut buffer = [0u8; 4];
        let params = [
            Parameter::value_input(1, 2),
            Parameter::value_output(),
            Parameter::tmp_inout(&mut buffer),
            Parameter::None,
        ];
        let types = params.each_ref().map(Parameter::param_type);
        assert_eq!(pack_param_types(types), 0x0721);
    }

    #[test]
    fn test_size_query_has_no_buffer() {
        let param = Parameter::tmp_size_query(Direction::Output, 0);
        match &param {
            Parameter::Temp(temp) => {
                assert!(temp.buffer().is_none());
                assert_eq!(temp.size(), 0);
            }
            other => panic!("unexpected parameter {:?}", other),
        }
        assert_eq!(param.param_type(), ParamType::TempOutput);
    }

    #[test]
    fn test_accessors() {
        let mut param = Parameter::value_inout(5, 6);
        assert_eq!(param.value(), Some((5, 6)));
        assert_eq!(param.size(), None);
        param.set_value(7, 8);
        assert_eq!(param.value(), Some((7, 8)));
        assert!(param.writes_back());

        let data = [1u8, 2, 3];
        let mut param = Parameter::tmp_input(&data);
        assert_eq!(param.size(), Some(3));
        assert!(!param.writes_back());
        param.set_size(1);
        assert_eq!(param.size(), Some(1));
    }

    #[test]
    fn test_direction_bits() {
        assert_eq!(Direction::Input.bits(), DIRECTION_INPUT);
        assert_eq!(Direction::Inout.map_direction(), MapDirection::all());
        assert_eq!(
            Direction::Output.shared_memory_flags(),
            SharedMemoryFlags::OUTPUT
        );
    }
}
