//! Element types and byte order.

use std::str::FromStr;

use derive_more::Display;
use thiserror::Error;

/// The byte order of stored multi-byte elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum ByteOrder {
    /// Big endian.
    #[display("BE")]
    Big,
    /// Little endian.
    #[display("LE")]
    Little,
}

impl ByteOrder {
    /// The byte order of the host.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Returns true if this is the host byte order.
    #[must_use]
    pub fn is_native(self) -> bool {
        self == Self::native()
    }
}

/// An invalid byte order error.
#[derive(Clone, Debug, Error)]
#[error("invalid byte order {0}")]
pub struct InvalidByteOrderError(String);

impl FromStr for ByteOrder {
    type Err = InvalidByteOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BE" | "big" => Ok(Self::Big),
            "LE" | "little" => Ok(Self::Little),
            _ => Err(InvalidByteOrderError(s.to_string())),
        }
    }
}

/// The type of one array element.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum ElementType {
    /// `i8`.
    Int8,
    /// `i16`.
    Int16,
    /// `i32`.
    Int32,
    /// `i64`.
    Int64,
    /// `u8`.
    UInt8,
    /// `u16`.
    UInt16,
    /// `u32`.
    UInt32,
    /// `u64`.
    UInt64,
    /// `f32`.
    Float32,
    /// `f64`.
    Float64,
    /// A fixed length string of the given number of bytes.
    #[display("FixedString({_0})")]
    FixedString(usize),
    /// A variable length string.
    VariableString,
    /// A structure of the given number of bytes.
    #[display("Structure({_0})")]
    Structure(usize),
}

/// An unsupported element type error.
#[derive(Copy, Clone, Debug, Error)]
#[error("unsupported element type {0}")]
pub struct UnsupportedElementTypeError(ElementType);

impl UnsupportedElementTypeError {
    /// The unsupported element type.
    #[must_use]
    pub const fn element_type(&self) -> ElementType {
        self.0
    }
}

/// An unknown element type name error.
#[derive(Clone, Debug, Error)]
#[error("unknown element type {0}")]
pub struct UnknownElementTypeError(String);

impl ElementType {
    /// The size of one element in bytes, or [`None`] for a variable length string.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::FixedString(size) | Self::Structure(size) => Some(*size),
            Self::VariableString => None,
        }
    }

    /// Returns the element size if chunks of this type can be reconstructed.
    ///
    /// # Errors
    /// Returns [`UnsupportedElementTypeError`] for variable length strings and structures.
    pub fn supported_size(&self) -> Result<usize, UnsupportedElementTypeError> {
        match self {
            Self::VariableString | Self::Structure(_) => Err(UnsupportedElementTypeError(*self)),
            _ => self.size().ok_or(UnsupportedElementTypeError(*self)),
        }
    }

    /// Returns the element size if chunks of this type can be kept undecoded.
    ///
    /// A structure is kept as opaque bytes of its full width.
    ///
    /// # Errors
    /// Returns [`UnsupportedElementTypeError`] for variable length strings.
    pub fn direct_io_size(&self) -> Result<usize, UnsupportedElementTypeError> {
        self.size().ok_or(UnsupportedElementTypeError(*self))
    }

    /// Convert elements in `bytes` stored in `order` to the host byte order.
    ///
    /// # Errors
    /// Returns [`UnsupportedElementTypeError`] for variable length strings and structures.
    pub fn swap_to_native(
        &self,
        bytes: &mut [u8],
        order: ByteOrder,
    ) -> Result<(), UnsupportedElementTypeError> {
        if order.is_native() {
            self.supported_size()?;
            return Ok(());
        }
        self.swap_byte_order(bytes)
    }

    /// Reverse the byte order of every element in `bytes`.
    ///
    /// # Errors
    /// Returns [`UnsupportedElementTypeError`] for variable length strings and structures.
    pub fn swap_byte_order(&self, bytes: &mut [u8]) -> Result<(), UnsupportedElementTypeError> {
        let size = self.supported_size()?;
        match self {
            Self::Float32 => swap_f32_in_place(bytes),
            Self::Float64 => swap_f64_in_place(bytes),
            Self::FixedString(_) => {}
            _ => swap_bytes_in_place(bytes, size),
        }
        Ok(())
    }
}

impl FromStr for ElementType {
    type Err = UnknownElementTypeError;

    /// Parse a DAP4 atomic type name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Int8" => Ok(Self::Int8),
            "Byte" | "UInt8" | "Char" => Ok(Self::UInt8),
            "Int16" => Ok(Self::Int16),
            "UInt16" => Ok(Self::UInt16),
            "Int32" => Ok(Self::Int32),
            "UInt32" => Ok(Self::UInt32),
            "Int64" => Ok(Self::Int64),
            "UInt64" => Ok(Self::UInt64),
            "Float32" => Ok(Self::Float32),
            "Float64" => Ok(Self::Float64),
            "String" | "Url" => Ok(Self::VariableString),
            _ => Err(UnknownElementTypeError(s.to_string())),
        }
    }
}

/// Reverse the bytes of each `width` byte element in `bytes`.
///
/// Trailing bytes that do not form a whole element are left untouched.
pub fn swap_bytes_in_place(bytes: &mut [u8], width: usize) {
    debug_assert!(width == 0 || bytes.len() % width == 0);
    match width {
        0 | 1 => {}
        2 => {
            for chunk in bytes.as_chunks_mut::<2>().0 {
                *chunk = u16::from_ne_bytes(*chunk).swap_bytes().to_ne_bytes();
            }
        }
        4 => {
            for chunk in bytes.as_chunks_mut::<4>().0 {
                *chunk = u32::from_ne_bytes(*chunk).swap_bytes().to_ne_bytes();
            }
        }
        8 => {
            for chunk in bytes.as_chunks_mut::<8>().0 {
                *chunk = u64::from_ne_bytes(*chunk).swap_bytes().to_ne_bytes();
            }
        }
        _ => {
            for chunk in bytes.chunks_exact_mut(width) {
                chunk.reverse();
            }
        }
    }
}

/// Swap the byte order of each `f32` in `bytes` through its bit pattern.
///
/// NaN payloads are preserved.
pub fn swap_f32_in_place(bytes: &mut [u8]) {
    for chunk in bytes.as_chunks_mut::<4>().0 {
        let value = f32::from_bits(u32::from_ne_bytes(*chunk).swap_bytes());
        *chunk = value.to_bits().to_ne_bytes();
    }
}

/// Swap the byte order of each `f64` in `bytes` through its bit pattern.
///
/// NaN payloads are preserved.
pub fn swap_f64_in_place(bytes: &mut [u8]) {
    for chunk in bytes.as_chunks_mut::<8>().0 {
        let value = f64::from_bits(u64::from_ne_bytes(*chunk).swap_bytes());
        *chunk = value.to_bits().to_ne_bytes();
    }
}
