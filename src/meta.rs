//! The metadata sidecar: a binary catalog of table schemas.
//!
//! Layout, all little-endian: `u32 table_count`, then per table
//! `u32 name_len · name_bytes · u32 column_count`, and per column
//! `u32 name_len · name_bytes · u32 type_tag · u32 declared_size`.
//! Type tags follow `DataType::tag`. The engine reads the file on open and
//! rewrites it whenever the set of tables changes.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Error, Result};
use crate::value::{Column, DataType, Schema};

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4).ok_or_else(|| {
            Error::Corruption(format!("metadata truncated at byte {}", self.pos))
        })?;
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.buf.get(self.pos..self.pos + len).ok_or_else(|| {
            Error::Corruption(format!("metadata truncated at byte {}", self.pos))
        })?;
        self.pos += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Corruption(format!("metadata name is not utf-8: {e}")))
    }
}

/// Read the catalog. A missing file is an empty catalog (first run), but a
/// present file that cannot be decoded is corruption.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Schema)>> {
    let buf = match fs::read(path.as_ref()) {
        Ok(buf) => buf,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = Reader { buf: &buf, pos: 0 };

    let table_count = reader.u32()?;
    let mut tables = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        let table_name = reader.string()?;
        let column_count = reader.u32()?;
        let mut schema = Schema::default();
        for _ in 0..column_count {
            let column_name = reader.string()?;
            let tag = reader.u32()?;
            let data_type = DataType::from_tag(tag).ok_or_else(|| {
                Error::Corruption(format!(
                    "metadata column '{column_name}' has unknown type tag {tag}"
                ))
            })?;
            let size = reader.u32()?;
            schema.columns.push(Column::new(column_name, data_type, size));
        }
        tables.push((table_name, schema));
    }
    Ok(tables)
}

/// Write the catalog, replacing any previous contents.
pub fn save<P: AsRef<Path>>(path: P, tables: &[(String, Schema)]) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(tables.len() as u32).to_le_bytes());
    for (name, schema) in tables {
        buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(schema.columns.len() as u32).to_le_bytes());
        for column in &schema.columns {
            buf.extend_from_slice(&(column.name.len() as u32).to_le_bytes());
            buf.extend_from_slice(column.name.as_bytes());
            buf.extend_from_slice(&column.data_type.tag().to_le_bytes());
            buf.extend_from_slice(&column.size.to_le_bytes());
        }
    }
    fs::write(path.as_ref(), &buf)?;
    Ok(())
}
