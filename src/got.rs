//! The global offset table shared by the main module and every dynamically
//! loaded module.
//!
//! Dynamic linking of Wasm modules needs a GOT much like native `dlopen`:
//! the function half maps symbol names to indices in the shared indirect
//! call table, the data half maps exported globals to their resolved memory
//! offsets. Entries that get referenced before their target exists are
//! parked in the missing set with a reserved table slot, and back-patched at
//! the end of the dynamic load that produces them.
//!
//! The wasm dynamic linking conventions are documented at
//! <https://github.com/WebAssembly/tool-conventions/blob/master/DynamicLinking.md>.

use std::collections::HashMap;

use tracing::{debug, error};
use wasmer::{AsStoreMut, Extern, Instance};

use crate::ir::ModuleIr;
use crate::table::{TableError, TableManager};

#[derive(Debug, thiserror::Error)]
pub enum GotError {
    #[error("conflicting table index for {name}: have {existing}, got {new}")]
    DuplicateFunction {
        name: String,
        existing: u32,
        new: u32,
    },

    #[error("conflicting data entry for {name}: have {existing}, got {new}")]
    DuplicateData {
        name: String,
        existing: i32,
        new: i32,
    },

    #[error("could not fill gaps in GOT for: {0:?}")]
    UnresolvedEntries(Vec<String>),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// A resolved data symbol: where it lives in linear memory, and whether the
/// exporting module declared it mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotDataEntry {
    pub offset: i32,
    pub mutable: bool,
}

/// Where a module's GOT entries land: main modules use their declared
/// element-segment offsets and raw global initialisers, dynamic modules are
/// rebased onto the table slice and data region reserved for them.
#[derive(Debug, Clone, Copy)]
pub enum GotPlacement {
    MainModule,
    DynamicModule { table_bottom: u32, data_bottom: i32 },
}

#[derive(Debug, Default, Clone)]
pub struct GlobalOffsetTable {
    functions: HashMap<String, u32>,
    data: HashMap<String, GotDataEntry>,
    missing: HashMap<String, u32>,
}

impl GlobalOffsetTable {
    /// Registers a function symbol at a table index. Idempotent for the same
    /// index; a different index for a known name is an error.
    pub fn register_function(&mut self, name: &str, index: u32) -> Result<(), GotError> {
        if let Some(existing) = self.functions.get(name) {
            if *existing != index {
                return Err(GotError::DuplicateFunction {
                    name: name.to_string(),
                    existing: *existing,
                    new: index,
                });
            }
            return Ok(());
        }
        self.functions.insert(name.to_string(), index);
        Ok(())
    }

    pub fn register_data(&mut self, name: &str, offset: i32, mutable: bool) -> Result<(), GotError> {
        if let Some(existing) = self.data.get(name) {
            if existing.offset != offset {
                return Err(GotError::DuplicateData {
                    name: name.to_string(),
                    existing: existing.offset,
                    new: offset,
                });
            }
            return Ok(());
        }
        self.data
            .insert(name.to_string(), GotDataEntry { offset, mutable });
        Ok(())
    }

    pub fn lookup_function(&self, name: &str) -> Option<u32> {
        self.functions.get(name).copied()
    }

    pub fn lookup_data(&self, name: &str) -> Option<GotDataEntry> {
        self.data.get(name).copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, u32)> {
        self.functions.iter().map(|(name, idx)| (name.as_str(), *idx))
    }

    /// Parks a symbol whose target does not exist yet. `placeholder` is the
    /// table slot reserved for it.
    pub fn record_missing(&mut self, name: &str, placeholder: u32) {
        self.missing.insert(name.to_string(), placeholder);
    }

    pub fn missing_is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Adds a module's element segments and exported i32 globals, called
    /// before the module is linked.
    pub fn populate_from_ir(
        &mut self,
        ir: &ModuleIr,
        placement: GotPlacement,
    ) -> Result<(), GotError> {
        // Table elements. Only functions the module explicitly exports are
        // interned; including every element would blow the map up for no
        // benefit.
        for segment in &ir.elem_segments {
            let base = match placement {
                GotPlacement::MainModule => segment.declared_base.unwrap_or(0),
                GotPlacement::DynamicModule { table_bottom, .. } => table_bottom as i32,
            };

            for (i, func_index) in segment.func_indices.iter().enumerate() {
                if let Some(name) = ir.exported_funcs.get(func_index) {
                    self.register_function(name, (base + i as i32) as u32)?;
                }
            }
        }

        // Data entries: exported globals resolved to their initialised
        // values, rebased onto the dynamic module's data region.
        for global in &ir.exported_i32_globals {
            let offset = match placement {
                GotPlacement::MainModule => global.initialiser,
                GotPlacement::DynamicModule { data_bottom, .. } => {
                    data_bottom + global.initialiser
                }
            };
            self.register_data(&global.name, offset, global.mutable)?;
        }

        Ok(())
    }

    /// Fills missing entries from the exports of a freshly created instance:
    /// the target function is written into the reserved table slot and the
    /// entry is promoted into the function half. Entries that remain missing
    /// afterwards are fatal for the load that triggered this.
    pub fn drain_missing_against(
        &mut self,
        store: &mut impl AsStoreMut,
        instance: &Instance,
        table: &TableManager,
    ) -> Result<(), GotError> {
        if self.missing.is_empty() {
            return Ok(());
        }

        let mut filled = Vec::new();
        for (name, index) in &self.missing {
            match instance.exports.get_extern(name) {
                Some(Extern::Function(func)) => {
                    debug!(name = name.as_str(), index, "filling gap in GOT");
                    table.set(store, *index, func.clone())?;
                    filled.push((name.clone(), *index));
                }
                _ => {
                    error!(name = name.as_str(), "could not fill gap in GOT");
                }
            }
        }

        for (name, index) in filled {
            self.missing.remove(&name);
            self.functions.insert(name, index);
        }

        if !self.missing.is_empty() {
            let mut unresolved: Vec<String> = self.missing.keys().cloned().collect();
            unresolved.sort();
            return Err(GotError::UnresolvedEntries(unresolved));
        }

        Ok(())
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.data.clear();
        self.missing.clear();
    }
}
