//! Byte encoding for values without a fixed wire layout.
//!
//! Values are encoded with `bincode`'s standard configuration through `serde`.
//! The encoding is self-delimiting, which the chunked tier relies on: the
//! reader stops pulling chunks once the value is complete.

use std::io::{Read, Write};

use bincode::error::{DecodeError, EncodeError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode a value into a fresh buffer.
pub(crate) fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

/// Decode a value that must occupy all of `bytes`.
pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(Error::Protocol(format!(
            "decoded value used {read} of {} received bytes",
            bytes.len()
        )));
    }
    Ok(value)
}

/// Encode a value into a byte stream.
pub(crate) fn to_writer<T: Serialize + ?Sized, W: Write>(value: &T, writer: &mut W) -> Result<usize> {
    Ok(bincode::serde::encode_into_std_write(
        value,
        writer,
        bincode::config::standard(),
    )?)
}

/// Decode a value from a byte stream, reading no further than its encoding.
pub(crate) fn from_reader<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T> {
    Ok(bincode::serde::decode_from_std_read(
        reader,
        bincode::config::standard(),
    )?)
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::Io { inner, .. } => Error::from_io(inner),
            other => Error::Serialization(other.to_string()),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io { inner, .. } => Error::from_io(inner),
            other => Error::Serialization(other.to_string()),
        }
    }
}
