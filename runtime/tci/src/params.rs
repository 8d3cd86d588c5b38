//! Parameter-type nibbles
//!
//! An operation carries four parameter slots. The type of slot `i` is stored
//! in bits `4*i .. 4*i+4` of a 32-bit vector, using the GlobalPlatform
//! encodings below.

use thiserror::Error;

/// A nibble that does not name any parameter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unknown parameter type {0:#x}")]
pub struct UnknownParamType(pub u8);

/// Type of one parameter slot
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    #[default]
    None = 0x0,
    ValueInput = 0x1,
    ValueOutput = 0x2,
    ValueInout = 0x3,
    TempInput = 0x5,
    TempOutput = 0x6,
    TempInout = 0x7,
    Whole = 0xC,
    PartialInput = 0xD,
    PartialOutput = 0xE,
    PartialInout = 0xF,
}

/// Direction bit: data flows from the client into the secure world
pub const DIRECTION_INPUT: u8 = 0x1;
/// Direction bit: data flows from the secure world back to the client
pub const DIRECTION_OUTPUT: u8 = 0x2;

impl ParamType {
    /// Raw 4-bit encoding
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Value parameters carry an `(a, b)` pair
    pub const fn is_value(self) -> bool {
        matches!(self, Self::ValueInput | Self::ValueOutput | Self::ValueInout)
    }

    /// Memory references carry a mapped buffer descriptor
    pub const fn is_memref(self) -> bool {
        matches!(
            self,
            Self::TempInput
                | Self::TempOutput
                | Self::TempInout
                | Self::Whole
                | Self::PartialInput
                | Self::PartialOutput
                | Self::PartialInout
        )
    }

    /// Direction bits (`DIRECTION_INPUT` / `DIRECTION_OUTPUT`)
    ///
    /// `Whole` carries no direction of its own; it inherits the parent block's.
    pub const fn direction(self) -> u8 {
        match self {
            Self::None | Self::Whole => 0,
            other => other.raw() & (DIRECTION_INPUT | DIRECTION_OUTPUT),
        }
    }

    /// Memory reference type the secure world sees for a block with the given
    /// direction bits. Whole and partial references are transmitted alike.
    pub const fn memref_with_direction(direction: u8) -> Self {
        match direction & (DIRECTION_INPUT | DIRECTION_OUTPUT) {
            DIRECTION_INPUT => Self::PartialInput,
            DIRECTION_OUTPUT => Self::PartialOutput,
            _ => Self::PartialInout,
        }
    }
}

impl TryFrom<u8> for ParamType {
    type Error = UnknownParamType;

    fn try_from(nibble: u8) -> Result<Self, Self::Error> {
        Ok(match nibble {
            0x0 => Self::None,
            0x1 => Self::ValueInput,
            0x2 => Self::ValueOutput,
            0x3 => Self::ValueInout,
            0x5 => Self::TempInput,
            0x6 => Self::TempOutput,
            0x7 => Self::TempInout,
            0xC => Self::Whole,
            0xD => Self::PartialInput,
            0xE => Self::PartialOutput,
            0xF => Self::PartialInout,
            other => return Err(UnknownParamType(other)),
        })
    }
}

/// Pack four slot types into the 32-bit type vector
pub fn pack_param_types(types: [ParamType; 4]) -> u32 {
    types
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, t)| acc | (u32::from(t.raw()) << (4 * i)))
}

/// Decode the type of slot `index` from a packed vector
///
/// # Errors
/// Returns `UnknownParamType` if the nibble is not a defined type
///
/// # Panics
/// Panics if `index >= 4`
pub fn param_type_at(types: u32, index: usize) -> Result<ParamType, UnknownParamType> {
    assert!(index < 4, "BUG: parameter slot {} out of range", index);
    ParamType::try_from(((types >> (4 * index)) & 0xF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_decode() {
        let types = pack_param_types([
            ParamType::ValueInout,
            ParamType::None,
            ParamType::TempOutput,
            ParamType::PartialInput,
        ]);
        assert_eq!(types, 0xD603);

        assert_eq!(param_type_at(types, 0), Ok(ParamType::ValueInout));
        assert_eq!(param_type_at(types, 1), Ok(ParamType::None));
        assert_eq!(param_type_at(types, 2), Ok(ParamType::TempOutput));
        assert_eq!(param_type_at(types, 3), Ok(ParamType::PartialInput));
    }

    #[test]
    fn test_all_none_is_zero() {
        assert_eq!(pack_param_types([ParamType::None; 4]), 0);
    }

    #[test]
    fn test_unknown_nibbles() {
        for nibble in [0x4u8, 0x8, 0x9, 0xA, 0xB] {
            assert_eq!(ParamType::try_from(nibble), Err(UnknownParamType(nibble)));
        }
        assert_eq!(param_type_at(0x40, 1), Err(UnknownParamType(0x4)));
    }

    #[test]
    fn test_directions() {
        assert_eq!(ParamType::TempInput.direction(), DIRECTION_INPUT);
        assert_eq!(ParamType::PartialOutput.direction(), DIRECTION_OUTPUT);
        assert_eq!(
            ParamType::ValueInout.direction(),
            DIRECTION_INPUT | DIRECTION_OUTPUT
        );
        assert_eq!(ParamType::Whole.direction(), 0);

        assert_eq!(
            ParamType::memref_with_direction(DIRECTION_OUTPUT),
            ParamType::PartialOutput
        );
        assert_eq!(
            ParamType::memref_with_direction(DIRECTION_INPUT | DIRECTION_OUTPUT),
            ParamType::PartialInout
        );
    }
}
