//! Element types shared with the native library.
//!
//! The native side identifies element types by small integer ids; the ids
//! here must stay in step with it because they cross the boundary raw in
//! both directions.

use std::fmt;

use crate::error::{Error, Result};

/// Element type of an array, carrying the native type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DType {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    Uint8 = 3,
    Int32 = 4,
    Int8 = 5,
    Int64 = 6,
}

impl DType {
    /// Every element type, indexable by native id.
    pub const ALL: [DType; 7] = [
        DType::Float32,
        DType::Float64,
        DType::Float16,
        DType::Uint8,
        DType::Int32,
        DType::Int8,
        DType::Int64,
    ];

    /// Looks up an element type by its native id.
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(DType::Float32),
            1 => Ok(DType::Float64),
            2 => Ok(DType::Float16),
            3 => Ok(DType::Uint8),
            4 => Ok(DType::Int32),
            5 => Ok(DType::Int8),
            6 => Ok(DType::Int64),
            _ => Err(Error::InvalidArgument(format!("invalid id of dtype: {id}"))),
        }
    }

    /// Looks up an element type by its conventional name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            "float16" => Ok(DType::Float16),
            "uint8" => Ok(DType::Uint8),
            "int32" => Ok(DType::Int32),
            "int8" => Ok(DType::Int8),
            "int64" => Ok(DType::Int64),
            _ => Err(Error::InvalidArgument(format!(
                "invalid name of dtype: {name}"
            ))),
        }
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Float16 => "float16",
            DType::Uint8 => "uint8",
            DType::Int32 => "int32",
            DType::Int8 => "int8",
            DType::Int64 => "int64",
        }
    }

    /// Element width in bytes on the native side.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float64 => 8,
            DType::Float16 => 2,
            DType::Uint8 => 1,
            DType::Int32 => 4,
            DType::Int8 => 1,
            DType::Int64 => 8,
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::Float32
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Widens an IEEE 754 binary16 value read from native memory.
///
/// Based on npy_half_to_double and npy_halfbits_to_doublebits in numpy.
pub fn float16_to_double(bits: u16) -> f64 {
    let h_exp = bits & 0x7c00;
    let d_sgn = u64::from(bits & 0x8000) << 48;
    match h_exp {
        // 0 or subnormal
        0x0000 => {
            let mut h_sig = bits & 0x03ff;
            if h_sig == 0 {
                return f64::from_bits(d_sgn);
            }
            let mut shifts: u64 = 0;
            h_sig <<= 1;
            while h_sig & 0x0400 == 0 {
                h_sig <<= 1;
                shifts += 1;
            }
            let d_exp = (1023 - 15 - shifts) << 52;
            let d_sig = u64::from(h_sig & 0x03ff) << 42;
            f64::from_bits(d_sgn + d_exp + d_sig)
        }
        // inf or NaN, keeping the significand bits
        0x7c00 => f64::from_bits(d_sgn + 0x7ff0_0000_0000_0000 + (u64::from(bits & 0x03ff) << 42)),
        // normalized, rebias the exponent and shift
        _ => f64::from_bits(d_sgn + ((u64::from(bits & 0x7fff) + 0xfc000) << 42)),
    }
}
