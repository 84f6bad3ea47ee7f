use std::sync::Arc;

use crate::error::{PatchError, PatchResult, TableKind};

use super::consts::Const;

/// Largest number of entries a table may hold: operands are a single byte.
pub const MAX_TABLE_LEN: usize = u8::MAX as usize + 1;

/// Constants, names and local-slot names referenced by operand index.
///
/// All three tables are insertion ordered and duplicate free. Interning never
/// moves an existing entry, so indices handed out earlier stay valid for the
/// lifetime of the tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideTables {
    pub consts: Vec<Const>,
    pub names: Vec<Arc<str>>,
    pub locals: Vec<Arc<str>>,
}

impl SideTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len_of(&self, table: TableKind) -> usize {
        match table {
            TableKind::Consts => self.consts.len(),
            TableKind::Names => self.names.len(),
            TableKind::Locals => self.locals.len(),
        }
    }

    pub fn const_index(&self, value: &Const) -> Option<u8> {
        self.consts.iter().position(|c| c == value).map(|i| i as u8)
    }

    pub fn name_index(&self, name: &str) -> Option<u8> {
        self.names.iter().position(|n| n.as_ref() == name).map(|i| i as u8)
    }

    pub fn local_index(&self, name: &str) -> Option<u8> {
        self.locals.iter().position(|n| n.as_ref() == name).map(|i| i as u8)
    }

    /// Index of `value` in the constant table, appending it when new.
    pub fn intern_const(&mut self, value: &Const) -> PatchResult<u8> {
        if let Some(idx) = self.const_index(value) {
            return Ok(idx);
        }
        ensure_room(TableKind::Consts, self.consts.len())?;
        self.consts.push(value.clone());
        Ok((self.consts.len() - 1) as u8)
    }

    pub fn intern_name(&mut self, name: &str) -> PatchResult<u8> {
        if let Some(idx) = self.name_index(name) {
            return Ok(idx);
        }
        ensure_room(TableKind::Names, self.names.len())?;
        self.names.push(Arc::from(name));
        Ok((self.names.len() - 1) as u8)
    }

    pub fn intern_local(&mut self, name: &str) -> PatchResult<u8> {
        if let Some(idx) = self.local_index(name) {
            return Ok(idx);
        }
        ensure_room(TableKind::Locals, self.locals.len())?;
        self.locals.push(Arc::from(name));
        Ok((self.locals.len() - 1) as u8)
    }

    /// Checks every table still fits the one-byte operand encoding.
    pub fn check_bounds(&self) -> PatchResult<()> {
        for table in [TableKind::Consts, TableKind::Names, TableKind::Locals] {
            let size = self.len_of(table);
            if size > MAX_TABLE_LEN {
                return Err(PatchError::SideTableOverflow { table, size });
            }
        }
        Ok(())
    }
}

fn ensure_room(table: TableKind, len: usize) -> PatchResult<()> {
    if len >= MAX_TABLE_LEN {
        return Err(PatchError::SideTableOverflow { table, size: len + 1 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_reuses_existing_indices() {
        let mut tables = SideTables::new();
        assert_eq!(tables.intern_const(&Const::None), Ok(0));
        assert_eq!(tables.intern_const(&Const::Int(3)), Ok(1));
        assert_eq!(tables.intern_const(&Const::None), Ok(0));
        assert_eq!(tables.intern_local("p"), Ok(0));
        assert_eq!(tables.intern_local("p"), Ok(0));
        assert_eq!(tables.consts.len(), 2);
    }

    #[test]
    fn overflow_reports_table_and_size() {
        let mut tables = SideTables::new();
        for i in 0..MAX_TABLE_LEN {
            tables.intern_const(&Const::Int(i as i64)).expect("fits");
        }
        let err = tables.intern_const(&Const::Int(-1)).unwrap_err();
        assert_eq!(
            err,
            PatchError::SideTableOverflow {
                table: TableKind::Consts,
                size: MAX_TABLE_LEN + 1
            }
        );
        // existing values are still found
        assert_eq!(tables.intern_const(&Const::Int(255)), Ok(255));
    }
}
