//! MPI datatype trait and fixed wire layout.
//!
//! This module provides the [`MpiDatatype`] trait, a sealed trait for Rust
//! primitive types that have a fixed-size wire representation. Values of these
//! types travel without serialization: each element is written as its
//! little-endian bytes, so every participating process agrees on the layout.
//!
//! # Supported Types
//!
//! | Rust Type | MPI Equivalent     | Wire Size |
//! |-----------|-------------------|-----------|
//! | `f32`     | `MPI_FLOAT`       | 4         |
//! | `f64`     | `MPI_DOUBLE`      | 8         |
//! | `i32`     | `MPI_INT32_T`     | 4         |
//! | `i64`     | `MPI_INT64_T`     | 8         |
//! | `u8`      | `MPI_UINT8_T`     | 1         |
//! | `u32`     | `MPI_UINT32_T`    | 4         |
//! | `u64`     | `MPI_UINT64_T`    | 8         |

use bytes::Bytes;

use crate::error::{Error, Result};

/// Internal module to seal the trait — prevents external implementations.
mod sealed {
    pub trait Sealed {}
}

/// Trait for types with a fixed wire layout.
///
/// This is a **sealed trait** — it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`].
///
/// Anything else goes through the serialized path
/// ([`Communicator::isend_serialized`](crate::Communicator::isend_serialized)).
pub trait MpiDatatype: sealed::Sealed + Copy + Send + 'static {
    /// Size of one element on the wire, in bytes.
    const WIRE_SIZE: usize;

    /// Append the wire bytes of `self` to `out`.
    fn write_wire(self, out: &mut Vec<u8>);

    /// Read one element from exactly `WIRE_SIZE` bytes.
    fn read_wire(bytes: &[u8]) -> Self;
}

macro_rules! impl_mpi_datatype {
    ($ty:ty) => {
        impl sealed::Sealed for $ty {}
        impl MpiDatatype for $ty {
            const WIRE_SIZE: usize = std::mem::size_of::<$ty>();

            fn write_wire(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_wire(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_mpi_datatype!(f32);
impl_mpi_datatype!(f64);
impl_mpi_datatype!(i32);
impl_mpi_datatype!(i64);
impl_mpi_datatype!(u8);
impl_mpi_datatype!(u32);
impl_mpi_datatype!(u64);

/// Encode a slice into its wire bytes.
pub(crate) fn encode_slice<T: MpiDatatype>(data: &[T]) -> Bytes {
    let mut out = Vec::with_capacity(data.len() * T::WIRE_SIZE);
    for &value in data {
        value.write_wire(&mut out);
    }
    Bytes::from(out)
}

/// Decode wire bytes into elements.
///
/// Fails if the byte length is not a whole number of elements.
pub(crate) fn decode_slice<T: MpiDatatype>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % T::WIRE_SIZE != 0 {
        return Err(Error::Protocol(format!(
            "{} bytes is not a multiple of the {}-byte element size",
            bytes.len(),
            T::WIRE_SIZE
        )));
    }
    Ok(bytes.chunks_exact(T::WIRE_SIZE).map(T::read_wire).collect())
}

/// Number of whole elements in `bytes` wire bytes.
pub(crate) fn element_count<T: MpiDatatype>(bytes: usize) -> i64 {
    (bytes / T::WIRE_SIZE) as i64
}
