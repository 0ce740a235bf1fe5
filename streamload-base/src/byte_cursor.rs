use crate::{FormatError, PackageGuid};
use std::convert::TryInto;

/// Reads native-endian values out of a byte slice. When `byte_swapped` is set the data was written
/// by a machine of the other byte order and every multi-byte value is swapped on read.
pub struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
    byte_swapped: bool,
}

impl<'a> ByteCursor<'a> {
    pub fn new(
        data: &'a [u8],
        byte_swapped: bool,
    ) -> Self {
        ByteCursor {
            data,
            position: 0,
            byte_swapped,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn seek(
        &mut self,
        position: usize,
    ) -> Result<(), FormatError> {
        if position > self.data.len() {
            return Err(FormatError::UnexpectedEnd {
                offset: position,
                needed: 0,
                available: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn read_bytes(
        &mut self,
        count: usize,
    ) -> Result<&'a [u8], FormatError> {
        if self.remaining() < count {
            return Err(FormatError::UnexpectedEnd {
                offset: self.position,
                needed: count,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        let bytes = self.read_bytes(4)?;
        let value = u32::from_ne_bytes(bytes.try_into().unwrap());
        if self.byte_swapped {
            Ok(value.swap_bytes())
        } else {
            Ok(value)
        }
    }

    // Guids are stored as raw bytes and never swapped
    pub fn read_guid(&mut self) -> Result<PackageGuid, FormatError> {
        let bytes = self.read_bytes(16)?;
        Ok(PackageGuid::from_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_string(&mut self) -> Result<String, FormatError> {
        let length = self.read_u32()? as usize;
        let offset = self.position;
        let bytes = self.read_bytes(length)?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| FormatError::InvalidUtf8 { offset })
    }
}

/// Appends native-endian values to a byte vector, optionally swapping them to emulate a writer of
/// the other byte order.
#[derive(Default)]
pub struct ByteWriter {
    data: Vec<u8>,
    byte_swapped: bool,
}

impl ByteWriter {
    pub fn new(byte_swapped: bool) -> Self {
        ByteWriter {
            data: Vec::default(),
            byte_swapped,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_u32(
        &mut self,
        value: u32,
    ) {
        let value = if self.byte_swapped {
            value.swap_bytes()
        } else {
            value
        };
        self.data.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn write_guid(
        &mut self,
        guid: PackageGuid,
    ) {
        self.data.extend_from_slice(&guid.to_bytes());
    }

    pub fn write_string(
        &mut self,
        value: &str,
    ) {
        self.write_u32(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(
        &mut self,
        bytes: &[u8],
    ) {
        self.data.extend_from_slice(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Serialized size of a length-prefixed string
pub fn string_size(value: &str) -> usize {
    4 + value.len()
}
