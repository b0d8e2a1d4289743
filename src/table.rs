//! Indirect call table management.
//!
//! The table is shared between the main module and every dynamically loaded
//! module. It only ever grows, and an index handed out once stays valid for
//! the life of the bound module. Index 0 is the null function pointer by
//! convention and is never assigned.

use tracing::debug;
use wasmer::{AsStoreMut, AsStoreRef, Function, RuntimeError, Table, Value};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to grow table by {delta}: {source}")]
    Grow { delta: u32, source: RuntimeError },

    #[error("table index {0} is out of bounds")]
    OutOfBounds(u32),

    #[error("failed to set table element {index}: {source}")]
    Set { index: u32, source: RuntimeError },
}

pub struct TableManager {
    table: Table,
}

impl TableManager {
    pub fn new(table: Table) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn size(&self, store: &impl AsStoreRef) -> u32 {
        self.table.size(store)
    }

    /// Appends a function to the table, returning its index.
    pub fn append(
        &self,
        store: &mut impl AsStoreMut,
        func: Function,
    ) -> Result<u32, TableError> {
        let index = self
            .table
            .grow(store, 1, Value::FuncRef(Some(func)))
            .map_err(|source| TableError::Grow { delta: 1, source })?;

        debug!(index, size = self.table.size(store), "appended function to table");
        Ok(index)
    }

    /// Grows the table by `n` empty slots, returning the first new index.
    pub fn reserve(&self, store: &mut impl AsStoreMut, n: u32) -> Result<u32, TableError> {
        self.table
            .grow(store, n, Value::FuncRef(None))
            .map_err(|source| TableError::Grow { delta: n, source })
    }

    pub fn set(
        &self,
        store: &mut impl AsStoreMut,
        index: u32,
        func: Function,
    ) -> Result<(), TableError> {
        self.table
            .set(store, index, Value::FuncRef(Some(func)))
            .map_err(|source| TableError::Set { index, source })
    }

    pub fn get(&self, store: &mut impl AsStoreMut, index: u32) -> Option<Value> {
        self.table.get(store, index)
    }

    /// Resolves an index to the function stored there, if any.
    pub fn get_function(&self, store: &mut impl AsStoreMut, index: u32) -> Option<Function> {
        match self.table.get(store, index) {
            Some(Value::FuncRef(Some(func))) => Some(func),
            _ => None,
        }
    }
}
