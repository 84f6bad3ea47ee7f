use std::sync::Arc;

use super::tables::SideTables;

/// Flag bits carried in [`CodeUnit::flags`].
pub const CO_OPTIMIZED: u32 = 0x0001;
pub const CO_NEWLOCALS: u32 = 0x0002;
pub const CO_VARARGS: u32 = 0x0004;
pub const CO_VARKEYWORDS: u32 = 0x0008;
pub const CO_NOFREE: u32 = 0x0040;

/// A compiled unit: instruction payload, side-tables and the metadata the host
/// runtime needs to execute it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeUnit {
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub tables: SideTables,
    pub freevars: Vec<Arc<str>>,
    pub cellvars: Vec<Arc<str>>,
    pub filename: Arc<str>,
    pub name: Arc<str>,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
}

impl CodeUnit {
    pub fn new(name: &str, code: Vec<u8>, tables: SideTables) -> Self {
        let nlocals = tables.locals.len() as u32;
        Self {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals,
            stacksize: 0,
            flags: CO_OPTIMIZED | CO_NEWLOCALS | CO_NOFREE,
            code,
            tables,
            freevars: Vec::new(),
            cellvars: Vec::new(),
            filename: Arc::from("<input>"),
            name: Arc::from(name),
            firstlineno: 1,
            lnotab: Vec::new(),
        }
    }

    /// Number of instructions in the payload.
    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.code.len() / 2
    }

    /// Parameter names, in declaration order.
    pub fn params(&self) -> &[Arc<str>] {
        let n = (self.argcount + self.kwonlyargcount) as usize;
        &self.tables.locals[..n.min(self.tables.locals.len())]
    }

    /// Builds a unit binary-compatible with `self` that carries a new payload
    /// and new tables. Argument counts, flags and debug metadata are kept;
    /// `nlocals` follows the local table.
    pub fn with_body(&self, code: Vec<u8>, tables: SideTables) -> CodeUnit {
        CodeUnit {
            nlocals: tables.locals.len() as u32,
            code,
            tables,
            ..self.clone()
        }
    }
}
