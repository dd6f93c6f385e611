use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::DsoError;

/// Version written by the Torque Game Engine 1.x script compiler.
pub const DSO_VERSION: u32 = 33;

const WIDE_WORD_ESCAPE: u8 = 0xFF;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn get_u8(&mut self) -> Result<u8, DsoError> {
        if self.remaining() < 1 {
            return Err(DsoError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32, DsoError> {
        if self.remaining() < 4 {
            return Err(DsoError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn get_f64(&mut self) -> Result<f64, DsoError> {
        if self.remaining() < 8 {
            return Err(DsoError::Eof);
        }
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DsoError> {
        if self.remaining() < n {
            return Err(DsoError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

/// NUL separated string pool addressed by byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Returns the string starting at `offset`, up to the next NUL (or the end of the pool).
    pub fn get(&self, offset: u32) -> Option<String> {
        let start = offset as usize;
        if start >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[start..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        // Script strings are Latin-1 in practice; map bytes straight to chars.
        Some(rest[..end].iter().map(|&b| b as char).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsoFile {
    pub version: u32,
    pub global_strings: StringTable,
    pub global_floats: Vec<f64>,
    pub function_strings: StringTable,
    pub function_floats: Vec<f64>,
    pub code: Vec<u32>,
    pub line_breaks: Vec<(u32, u32)>,
    /// Code word index -> identifier patched into that word.
    pub identifiers: HashMap<u32, String>,
}

fn read_string_table(r: &mut Reader<'_>) -> Result<StringTable, DsoError> {
    let size = r.get_u32()? as usize;
    Ok(StringTable::new(r.get_bytes(size)?.to_vec()))
}

fn read_float_table(r: &mut Reader<'_>) -> Result<Vec<f64>, DsoError> {
    let count = r.get_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(r.remaining() / 8));
    for _ in 0..count {
        out.push(r.get_f64()?);
    }
    Ok(out)
}

fn read_code(r: &mut Reader<'_>, count: usize) -> Result<Vec<u32>, DsoError> {
    let mut code = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let b = r.get_u8()?;
        if b == WIDE_WORD_ESCAPE {
            code.push(r.get_u32()?);
        } else {
            code.push(b as u32);
        }
    }
    Ok(code)
}

fn read_identifiers(
    r: &mut Reader<'_>,
    strings: &StringTable,
    code_len: usize,
) -> Result<HashMap<u32, String>, DsoError> {
    let count = r.get_u32()?;
    let mut out = HashMap::new();
    for _ in 0..count {
        let offset = r.get_u32()?;
        let name = strings.get(offset).ok_or(DsoError::InvalidStringOffset(offset))?;
        let refs = r.get_u32()?;
        for _ in 0..refs {
            let ip = r.get_u32()?;
            if ip as usize >= code_len {
                return Err(DsoError::InvalidIdentifierPatch { ip, code_len });
            }
            out.insert(ip, name.clone());
        }
    }
    Ok(out)
}

pub fn load(bytes: &[u8]) -> Result<DsoFile, DsoError> {
    let mut r = Reader::new(bytes);
    let version = r.get_u32()?;
    let global_strings = read_string_table(&mut r)?;
    let global_floats = read_float_table(&mut r)?;
    let function_strings = read_string_table(&mut r)?;
    let function_floats = read_float_table(&mut r)?;

    let code_len = r.get_u32()? as usize;
    let line_break_count = r.get_u32()? as usize;
    let code = read_code(&mut r, code_len)?;

    let mut line_breaks = Vec::with_capacity(line_break_count.min(r.remaining() / 8));
    for _ in 0..line_break_count {
        let line = r.get_u32()?;
        let ip = r.get_u32()?;
        line_breaks.push((line, ip));
    }

    let identifiers = read_identifiers(&mut r, &global_strings, code.len())?;

    if r.remaining() > 0 {
        log::debug!("ignoring {} trailing bytes after identifier table", r.remaining());
    }

    Ok(DsoFile {
        version,
        global_strings,
        global_floats,
        function_strings,
        function_floats,
        code,
        line_breaks,
        identifiers,
    })
}
