//! Persisted compiled-unit container.
//!
//! Layout: a 16-byte header followed by the serialized unit graph and an
//! optional `META` section.
//!
//! ```text
//! 0   u16  format magic
//! 2   "\r\n"
//! 4   u32  flags (bit 0: hash-validated)
//! 8   u32  mtime      | 8-byte source hash when bit 0 is set
//! 12  u32  source size |
//! 16  unit payload
//! ..  ["META" u32 len, JSON]
//! ```
//!
//! All integers are little-endian. Nested code constants are serialized inline.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result, bail, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CodeUnit, Const, SideTables};

/// Magic number of the instruction set this crate encodes (3.7 wordcode).
pub const FORMAT_MAGIC: u16 = 3394;
const HEADER_LEN: usize = 16;
const FLAG_HASH_BASED: u32 = 1 << 0;
const META_TAG: [u8; 4] = *b"META";

/// How a persisted unit is validated against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Timestamp { mtime: DateTime<Utc>, source_size: u32 },
    Hash([u8; 8]),
}

/// Free-form annotations stored next to the unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub source: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitFile {
    pub magic: u16,
    pub flags: u32,
    pub validation: Validation,
    pub unit: CodeUnit,
    pub meta: Option<UnitMeta>,
}

impl UnitFile {
    pub fn new(unit: CodeUnit, mtime: DateTime<Utc>, source_size: u32) -> Self {
        Self {
            magic: FORMAT_MAGIC,
            flags: 0,
            validation: Validation::Timestamp { mtime, source_size },
            unit,
            meta: None,
        }
    }
}

pub fn load_unit_file(path: impl AsRef<Path>) -> Result<UnitFile> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    read_unit_file(&bytes).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_unit_file(bytes: &[u8]) -> Result<UnitFile> {
    ensure!(bytes.len() >= HEADER_LEN, "unit file too small ({} bytes)", bytes.len());
    let mut cursor = 0usize;
    let magic = read_u16(bytes, &mut cursor)?;
    ensure!(&bytes[2..4] == b"\r\n", "missing CRLF after format magic");
    cursor += 2;
    ensure!(
        magic == FORMAT_MAGIC,
        "unsupported format magic {} (reader supports {})",
        magic,
        FORMAT_MAGIC
    );
    let flags = read_u32(bytes, &mut cursor)?;
    let validation = if flags & FLAG_HASH_BASED != 0 {
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[cursor..cursor + 8]);
        cursor += 8;
        Validation::Hash(hash)
    } else {
        let secs = read_u32(bytes, &mut cursor)?;
        let source_size = read_u32(bytes, &mut cursor)?;
        let mtime = DateTime::from_timestamp(secs as i64, 0).context("invalid modification timestamp")?;
        Validation::Timestamp { mtime, source_size }
    };

    let unit = decode_unit(bytes, &mut cursor)?;

    let mut meta = None;
    if cursor < bytes.len() {
        let tag = read_tag(bytes, &mut cursor)?;
        ensure!(tag == META_TAG, "unknown trailing section {:?}", String::from_utf8_lossy(&tag));
        let len = read_u32(bytes, &mut cursor)? as usize;
        ensure!(cursor + len <= bytes.len(), "META section overruns payload");
        meta = Some(serde_json::from_slice(&bytes[cursor..cursor + len])?);
        cursor += len;
    }
    ensure!(cursor == bytes.len(), "extra data at end of unit file");

    Ok(UnitFile {
        magic,
        flags,
        validation,
        unit,
        meta,
    })
}

/// Serializes a unit file. Used to produce fixtures; patched bodies are never
/// written back by the pipeline itself.
pub fn write_unit_file(file: &UnitFile) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_u16(&mut out, file.magic);
    out.extend_from_slice(b"\r\n");
    match file.validation {
        Validation::Timestamp { mtime, source_size } => {
            write_u32(&mut out, file.flags & !FLAG_HASH_BASED);
            let secs = u32::try_from(mtime.timestamp()).context("timestamp does not fit 32 bits")?;
            write_u32(&mut out, secs);
            write_u32(&mut out, source_size);
        }
        Validation::Hash(hash) => {
            write_u32(&mut out, file.flags | FLAG_HASH_BASED);
            out.extend_from_slice(&hash);
        }
    }
    encode_unit(&mut out, &file.unit)?;
    if let Some(meta) = &file.meta {
        let payload = serde_json::to_vec(meta)?;
        out.extend_from_slice(&META_TAG);
        write_u32(&mut out, payload.len() as u32);
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

fn encode_unit(out: &mut Vec<u8>, unit: &CodeUnit) -> Result<()> {
    write_u32(out, unit.argcount);
    write_u32(out, unit.kwonlyargcount);
    write_u32(out, unit.nlocals);
    write_u32(out, unit.stacksize);
    write_u32(out, unit.flags);
    write_bytes(out, &unit.code)?;

    ensure!(unit.tables.consts.len() <= u32::MAX as usize, "constant table too large");
    write_u32(out, unit.tables.consts.len() as u32);
    for value in &unit.tables.consts {
        encode_const(out, value)?;
    }
    write_str_list(out, &unit.tables.names)?;
    write_str_list(out, &unit.tables.locals)?;
    write_str_list(out, &unit.freevars)?;
    write_str_list(out, &unit.cellvars)?;
    write_str(out, &unit.filename)?;
    write_str(out, &unit.name)?;
    write_u32(out, unit.firstlineno);
    write_bytes(out, &unit.lnotab)?;
    Ok(())
}

fn decode_unit(bytes: &[u8], cursor: &mut usize) -> Result<CodeUnit> {
    let argcount = read_u32(bytes, cursor)?;
    let kwonlyargcount = read_u32(bytes, cursor)?;
    let nlocals = read_u32(bytes, cursor)?;
    let stacksize = read_u32(bytes, cursor)?;
    let flags = read_u32(bytes, cursor)?;
    let code = read_bytes(bytes, cursor)?;
    ensure!(code.len() % 2 == 0, "instruction payload has odd length {}", code.len());

    let const_len = read_u32(bytes, cursor)? as usize;
    let mut consts = Vec::with_capacity(const_len.min(256));
    for _ in 0..const_len {
        consts.push(decode_const(bytes, cursor)?);
    }
    let names = read_str_list(bytes, cursor)?;
    let locals = read_str_list(bytes, cursor)?;
    let freevars = read_str_list(bytes, cursor)?;
    let cellvars = read_str_list(bytes, cursor)?;
    let filename = read_str(bytes, cursor)?;
    let name = read_str(bytes, cursor)?;
    let firstlineno = read_u32(bytes, cursor)?;
    let lnotab = read_bytes(bytes, cursor)?;

    Ok(CodeUnit {
        argcount,
        kwonlyargcount,
        nlocals,
        stacksize,
        flags,
        code,
        tables: SideTables { consts, names, locals },
        freevars,
        cellvars,
        filename,
        name,
        firstlineno,
        lnotab,
    })
}

fn encode_const(out: &mut Vec<u8>, value: &Const) -> Result<()> {
    match value {
        Const::None => write_u8(out, 0),
        Const::Bool(b) => {
            write_u8(out, 1);
            write_u8(out, *b as u8);
        }
        Const::Int(i) => {
            write_u8(out, 2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Const::Float(x) => {
            write_u8(out, 3);
            out.extend_from_slice(&x.to_le_bytes());
        }
        Const::Str(s) => {
            write_u8(out, 4);
            write_str(out, s)?;
        }
        Const::Tuple(items) => {
            write_u8(out, 5);
            ensure!(items.len() <= u32::MAX as usize, "tuple too large");
            write_u32(out, items.len() as u32);
            for item in items.iter() {
                encode_const(out, item)?;
            }
        }
        Const::Code(unit) => {
            write_u8(out, 6);
            encode_unit(out, unit)?;
        }
    }
    Ok(())
}

fn decode_const(bytes: &[u8], cursor: &mut usize) -> Result<Const> {
    let tag = read_u8(bytes, cursor)?;
    Ok(match tag {
        0 => Const::None,
        1 => Const::Bool(read_u8(bytes, cursor)? != 0),
        2 => Const::Int(i64::from_le_bytes(read_array(bytes, cursor)?)),
        3 => Const::Float(f64::from_le_bytes(read_array(bytes, cursor)?)),
        4 => Const::Str(read_str(bytes, cursor)?),
        5 => {
            let len = read_u32(bytes, cursor)? as usize;
            let mut items = Vec::with_capacity(len.min(256));
            for _ in 0..len {
                items.push(decode_const(bytes, cursor)?);
            }
            Const::tuple(items)
        }
        6 => Const::Code(Arc::new(decode_unit(bytes, cursor)?)),
        other => bail!("unknown constant tag {}", other),
    })
}

fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    ensure!(value.len() <= u32::MAX as usize, "byte string too large");
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value);
    Ok(())
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    write_bytes(out, value.as_bytes())
}

fn write_str_list(out: &mut Vec<u8>, values: &[Arc<str>]) -> Result<()> {
    ensure!(values.len() <= u32::MAX as usize, "string table too large");
    write_u32(out, values.len() as u32);
    for value in values {
        write_str(out, value)?;
    }
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8], cursor: &mut usize) -> Result<[u8; N]> {
    if *cursor + N > bytes.len() {
        bail!("unexpected end of input while reading {} bytes at offset {}", N, *cursor);
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*cursor..*cursor + N]);
    *cursor += N;
    Ok(buf)
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    Ok(read_array::<1>(bytes, cursor)?[0])
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(bytes, cursor)?))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(bytes, cursor)?))
}

fn read_tag(bytes: &[u8], cursor: &mut usize) -> Result<[u8; 4]> {
    read_array(bytes, cursor)
}

fn read_bytes(bytes: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(bytes, cursor)? as usize;
    if *cursor + len > bytes.len() {
        bail!("unexpected end of input while reading {} byte string", len);
    }
    let slice = bytes[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(slice)
}

fn read_str(bytes: &[u8], cursor: &mut usize) -> Result<Arc<str>> {
    let raw = read_bytes(bytes, cursor)?;
    let s = String::from_utf8(raw).context("invalid UTF-8 in string")?;
    Ok(Arc::from(s))
}

fn read_str_list(bytes: &[u8], cursor: &mut usize) -> Result<Vec<Arc<str>>> {
    let len = read_u32(bytes, cursor)? as usize;
    let mut out = Vec::with_capacity(len.min(256));
    for _ in 0..len {
        out.push(read_str(bytes, cursor)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::UnitBuilder;
    use crate::ir::Opcode;

    fn sample_unit() -> CodeUnit {
        let lambda = {
            let mut b = UnitBuilder::function("<lambda>", &["x"]);
            b.load_const(Const::None).op(Opcode::ReturnValue);
            b.build().expect("lambda")
        };
        let mut b = UnitBuilder::function("f", &[]);
        b.load_const(Const::Int(1))
            .store_fast("p")
            .load_const(Const::code(lambda))
            .load_const(Const::str("f.<locals>.<lambda>"))
            .op_arg(Opcode::MakeFunction, 0)
            .store_fast("print")
            .load_fast("p")
            .load_const(Const::Float(0.5))
            .op(Opcode::BinarySubtract)
            .op(Opcode::ReturnValue);
        b.build().expect("f")
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).expect("epoch")
    }

    #[test]
    fn round_trip_preserves_unit_graph() {
        let mtime = DateTime::from_timestamp(1_555_000_000, 0).expect("timestamp");
        let mut file = UnitFile::new(sample_unit(), mtime, 42);
        file.meta = Some(UnitMeta {
            source: Some("f.py".to_string()),
            ..UnitMeta::default()
        });
        let bytes = write_unit_file(&file).expect("write");
        assert_eq!(&bytes[..4], &[0x42, 0x0d, b'\r', b'\n']);
        let decoded = read_unit_file(&bytes).expect("read");
        assert_eq!(decoded, file);
        assert!(decoded.unit.tables.consts[2].as_code().is_some());
    }

    #[test]
    fn hash_validated_header() {
        let mut file = UnitFile::new(sample_unit(), epoch(), 0);
        file.validation = Validation::Hash(*b"abcdefgh");
        let bytes = write_unit_file(&file).expect("write");
        let decoded = read_unit_file(&bytes).expect("read");
        assert_eq!(decoded.validation, Validation::Hash(*b"abcdefgh"));
        assert_eq!(decoded.flags & FLAG_HASH_BASED, FLAG_HASH_BASED);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let file = UnitFile::new(sample_unit(), epoch(), 0);
        let mut bytes = write_unit_file(&file).expect("write");
        let truncated = &bytes[..bytes.len() - 3];
        assert!(read_unit_file(truncated).is_err());
        bytes[0] = 0;
        let err = read_unit_file(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported format magic"));
    }

    #[test]
    fn loads_from_disk() {
        let file = UnitFile::new(sample_unit(), epoch(), 7);
        let bytes = write_unit_file(&file).expect("write");
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(tmp.path(), &bytes).expect("write tmp");
        let loaded = load_unit_file(tmp.path()).expect("load");
        assert_eq!(loaded.unit.name.as_ref(), "f");
    }
}
