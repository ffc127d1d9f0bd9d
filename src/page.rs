//! The page layout and row codec.
//!
//! A data page is a 4096-byte block: a 16-byte header followed by rows
//! packed contiguously, each behind its own 16-byte header. Every field is
//! encoded little-endian. Invariant for a page at rest:
//! `free_space + PAGE_HEADER_SIZE + sum(tuple_size) == PAGE_SIZE`.

use crate::error::{Error, Result};
use crate::value::{DataType, Schema, Tuple, Value};
use crate::{PageId, TupleId, INVALID_PAGE_ID, PAGE_SIZE};

/// Byte size of the header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Byte size of the header preceding every row.
pub const TUPLE_HEADER_SIZE: usize = 16;

/// Metadata at the start of every data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_id: PageId,
    pub free_space: u32,
    pub tuple_count: u32,
    pub next_page: PageId,
}

impl PageHeader {
    /// Header for a freshly formatted, empty page.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            free_space: (PAGE_SIZE - PAGE_HEADER_SIZE) as u32,
            tuple_count: 0,
            next_page: INVALID_PAGE_ID,
        }
    }
}

/// Metadata preceding every row on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeader {
    /// Total bytes this row occupies, header included.
    pub tuple_size: u32,
    /// Reserved for row chaining; currently always 0.
    pub next_tuple_offset: u32,
    pub tuple_id: TupleId,
}

/// Total encoded size of a row, header included.
pub fn tuple_size(tuple: &Tuple) -> usize {
    TUPLE_HEADER_SIZE + tuple.values.iter().map(Value::encoded_size).sum::<usize>()
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or_else(|| Error::Corruption(format!("read of u32 at {offset} past buffer end")))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or_else(|| Error::Corruption(format!("read of u64 at {offset} past buffer end")))?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Encode a row (header plus values in order) into a byte vector.
pub fn encode_tuple(tuple: &Tuple) -> Vec<u8> {
    let size = tuple_size(tuple);
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&tuple.id.to_le_bytes());
    for value in &tuple.values {
        match value {
            Value::Integer(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Boolean(v) => buf.push(*v as u8),
            Value::Varchar(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    buf
}

/// Decode the row header at `offset`.
pub fn decode_tuple_header(buf: &[u8], offset: usize) -> Result<TupleHeader> {
    Ok(TupleHeader {
        tuple_size: read_u32(buf, offset)?,
        next_tuple_offset: read_u32(buf, offset + 4)?,
        tuple_id: read_u64(buf, offset + 8)?,
    })
}

/// Decode one row at `offset` against `schema`. Returns the row and the
/// number of bytes consumed. Any read past the buffer is corruption.
pub fn decode_tuple(buf: &[u8], offset: usize, schema: &Schema) -> Result<(Tuple, usize)> {
    let header = decode_tuple_header(buf, offset)?;
    let mut pos = offset + TUPLE_HEADER_SIZE;
    let mut values = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let value = match column.data_type {
            DataType::Integer => {
                let v = read_u32(buf, pos)? as i32;
                pos += 4;
                Value::Integer(v)
            }
            DataType::Double => {
                let v = f64::from_bits(read_u64(buf, pos)?);
                pos += 8;
                Value::Double(v)
            }
            DataType::Boolean => {
                let byte = *buf
                    .get(pos)
                    .ok_or_else(|| Error::Corruption(format!("boolean at {pos} past buffer end")))?;
                pos += 1;
                Value::Boolean(byte != 0)
            }
            DataType::Varchar => {
                let len = read_u32(buf, pos)? as usize;
                pos += 4;
                let bytes = buf.get(pos..pos + len).ok_or_else(|| {
                    Error::Corruption(format!("varchar of {len} bytes at {pos} overruns page"))
                })?;
                pos += len;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| Error::Corruption(format!("varchar at {pos}: {e}")))?
                    .to_string();
                Value::Varchar(s)
            }
        };
        values.push(value);
    }
    let consumed = pos - offset;
    if header.tuple_size as usize != consumed {
        return Err(Error::Corruption(format!(
            "row header claims {} bytes but {} were decoded",
            header.tuple_size, consumed
        )));
    }
    Ok((Tuple::with_id(header.tuple_id, values), consumed))
}

/// One 4096-byte page image.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// A zeroed page. The header is written separately when the page is
    /// formatted; a zeroed header is how a never-written page is recognized.
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0; PAGE_SIZE],
        }
    }

    pub fn header(&self) -> PageHeader {
        // the four fields are within the fixed array, reads cannot fail
        PageHeader {
            page_id: u32::from_le_bytes(self.data[0..4].try_into().unwrap()),
            free_space: u32::from_le_bytes(self.data[4..8].try_into().unwrap()),
            tuple_count: u32::from_le_bytes(self.data[8..12].try_into().unwrap()),
            next_page: u32::from_le_bytes(self.data[12..16].try_into().unwrap()),
        }
    }

    pub fn set_header(&mut self, header: &PageHeader) {
        self.data[0..4].copy_from_slice(&header.page_id.to_le_bytes());
        self.data[4..8].copy_from_slice(&header.free_space.to_le_bytes());
        self.data[8..12].copy_from_slice(&header.tuple_count.to_le_bytes());
        self.data[12..16].copy_from_slice(&header.next_page.to_le_bytes());
    }

    /// Format this page as a fresh, empty data page.
    pub fn format(&mut self) {
        self.data.fill(0);
        self.set_header(&PageHeader::new(self.id));
    }

    /// Byte offset one past the last row, walking row headers from the
    /// front of the page.
    fn end_offset(&self) -> Result<usize> {
        let header = self.header();
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..header.tuple_count {
            let tuple_header = decode_tuple_header(&self.data, offset)?;
            if tuple_header.tuple_size as usize <= TUPLE_HEADER_SIZE {
                return Err(Error::Corruption(format!(
                    "row at {offset} claims impossible size {}",
                    tuple_header.tuple_size
                )));
            }
            offset += tuple_header.tuple_size as usize;
            if offset > PAGE_SIZE {
                return Err(Error::Corruption(format!(
                    "row chain on page {} runs past the page end",
                    header.page_id
                )));
            }
        }
        Ok(offset)
    }

    /// Append a row. Returns false when the page lacks room; the header's
    /// tuple count and free space are updated on success.
    pub fn append_tuple(&mut self, tuple: &Tuple) -> Result<bool> {
        let mut header = self.header();
        let size = tuple_size(tuple);
        if size > header.free_space as usize {
            return Ok(false);
        }
        let offset = self.end_offset()?;
        let encoded = encode_tuple(tuple);
        self.data[offset..offset + encoded.len()].copy_from_slice(&encoded);
        header.tuple_count += 1;
        header.free_space -= size as u32;
        self.set_header(&header);
        Ok(true)
    }

    /// Decode every row on the page in storage order.
    pub fn read_tuples(&self, schema: &Schema) -> Result<Vec<Tuple>> {
        let header = self.header();
        let mut tuples = Vec::with_capacity(header.tuple_count as usize);
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..header.tuple_count {
            let (tuple, consumed) = decode_tuple(&self.data, offset, schema)?;
            tuples.push(tuple);
            offset += consumed;
        }
        Ok(tuples)
    }

    /// Remove the row with `tuple_id`, compacting the remaining rows so they
    /// stay contiguous. Returns false when the row is not on this page.
    pub fn remove_tuple(&mut self, tuple_id: TupleId) -> Result<bool> {
        let mut header = self.header();
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..header.tuple_count {
            let tuple_header = decode_tuple_header(&self.data, offset)?;
            let size = tuple_header.tuple_size as usize;
            if offset + size > PAGE_SIZE {
                return Err(Error::Corruption(format!(
                    "row chain on page {} runs past the page end",
                    header.page_id
                )));
            }
            if tuple_header.tuple_id == tuple_id {
                let end = self.end_offset()?;
                self.data.copy_within(offset + size..end, offset);
                self.data[end - size..end].fill(0);
                header.tuple_count -= 1;
                header.free_space += size as u32;
                self.set_header(&header);
                return Ok(true);
            }
            offset += size;
        }
        Ok(false)
    }
}
