//! Structural module metadata the embedder API does not expose.
//!
//! The GOT build (element segments, exported i32 globals), the dynamic
//! module sizing (data extent, table element count) and the bind-time stack
//! checks all need information that only exists in the module binary, so we
//! walk it once with `wasmparser` and keep the result next to the compiled
//! module.

use std::collections::HashMap;

use wasmparser::{
    DataKind, ElementItems, ElementKind, ExternalKind, Operator, Parser, Payload, TypeRef, ValType,
};

#[derive(Debug, thiserror::Error)]
pub enum IrError {
    #[error("failed to load wasm for {key}: {source}")]
    Load {
        key: String,
        source: std::io::Error,
    },

    #[error("failed to parse module: {0}")]
    Parse(#[from] wasmparser::BinaryReaderError),

    #[error("failed to compile module {key}: {source}")]
    Compile {
        key: String,
        source: Box<wasmer::CompileError>,
    },
}

/// One element segment, with its declared base offset when it is an
/// `i32.const` expression. PIC modules place their segments through an
/// imported global instead, in which case the host supplies the base.
#[derive(Debug, Clone)]
pub struct ElemSegment {
    pub declared_base: Option<i32>,
    pub func_indices: Vec<u32>,
}

/// An exported global with a 32-bit integer initialiser.
#[derive(Debug, Clone)]
pub struct ExportedI32Global {
    pub name: String,
    pub initialiser: i32,
    pub mutable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleIr {
    /// Function index (import-inclusive) to export name.
    pub exported_funcs: HashMap<u32, String>,
    pub elem_segments: Vec<ElemSegment>,
    pub exported_i32_globals: Vec<ExportedI32Global>,
    /// Highest byte touched by any data segment, with `global.get` based
    /// offsets treated as zero (they are relative to the module's own
    /// memory base).
    pub data_size: u32,
    /// Total number of table elements across all element segments.
    pub table_elem_count: u32,
    /// Mutability of the module's first defined global, when it has one.
    pub first_global_mutable: Option<bool>,
}

impl ModuleIr {
    pub fn parse(bytes: &[u8]) -> Result<Self, IrError> {
        let mut num_imported_globals = 0u32;

        let mut exported_funcs = HashMap::new();
        let mut exported_globals: Vec<(String, u32)> = Vec::new();
        let mut defined_globals: Vec<(ValType, bool, Option<i32>)> = Vec::new();
        let mut elem_segments = Vec::new();
        let mut data_size = 0u32;

        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        if let TypeRef::Global(_) = import?.ty {
                            num_imported_globals += 1;
                        }
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let global = global?;
                        let init = eval_i32_const(&global.init_expr);
                        defined_globals.push((
                            global.ty.content_type,
                            global.ty.mutable,
                            init,
                        ));
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        match export.kind {
                            ExternalKind::Func => {
                                exported_funcs
                                    .entry(export.index)
                                    .or_insert_with(|| export.name.to_string());
                            }
                            ExternalKind::Global => {
                                exported_globals.push((export.name.to_string(), export.index));
                            }
                            _ => {}
                        }
                    }
                }
                Payload::ElementSection(reader) => {
                    for element in reader {
                        let element = element?;
                        let declared_base = match &element.kind {
                            ElementKind::Active { offset_expr, .. } => eval_i32_const(offset_expr),
                            _ => None,
                        };

                        let mut func_indices = Vec::new();
                        if let ElementItems::Functions(items) = element.items {
                            for index in items {
                                func_indices.push(index?);
                            }
                        }

                        elem_segments.push(ElemSegment {
                            declared_base,
                            func_indices,
                        });
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        let data = data?;
                        let offset = match &data.kind {
                            DataKind::Active { offset_expr, .. } => {
                                eval_i32_const(offset_expr).unwrap_or(0).max(0) as u32
                            }
                            DataKind::Passive => 0,
                        };
                        data_size = data_size.max(offset.saturating_add(data.data.len() as u32));
                    }
                }
                _ => {}
            }
        }

        // Resolve exported globals to their initialisers, skipping imported
        // globals and non-i32 initialisers.
        let mut exported_i32_globals = Vec::new();
        for (name, index) in exported_globals {
            if index < num_imported_globals {
                continue;
            }
            let Some((ty, mutable, init)) =
                defined_globals.get((index - num_imported_globals) as usize)
            else {
                continue;
            };
            if *ty != ValType::I32 {
                continue;
            }
            if let Some(initialiser) = init {
                exported_i32_globals.push(ExportedI32Global {
                    name,
                    initialiser: *initialiser,
                    mutable: *mutable,
                });
            }
        }

        let table_elem_count = elem_segments
            .iter()
            .map(|segment| segment.func_indices.len() as u32)
            .sum();

        Ok(Self {
            exported_funcs,
            elem_segments,
            exported_i32_globals,
            data_size,
            table_elem_count,
            first_global_mutable: defined_globals.first().map(|(_, mutable, _)| *mutable),
        })
    }
}

fn eval_i32_const(expr: &wasmparser::ConstExpr) -> Option<i32> {
    let mut reader = expr.get_operators_reader();
    match reader.read().ok()? {
        Operator::I32Const { value } => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_wat(wat: &str) -> ModuleIr {
        let bytes = wasmer::wat2wasm(wat.as_bytes()).unwrap();
        ModuleIr::parse(&bytes).unwrap()
    }

    #[test]
    fn collects_exported_elem_functions() {
        let ir = parse_wat(
            r#"
            (module
              (table 10 funcref)
              (func $hidden)
              (func $visible (export "visible"))
              (elem (i32.const 3) $hidden $visible))
            "#,
        );

        assert_eq!(ir.table_elem_count, 2);
        assert_eq!(ir.elem_segments.len(), 1);
        assert_eq!(ir.elem_segments[0].declared_base, Some(3));
        assert_eq!(ir.exported_funcs.get(&1), Some(&"visible".to_string()));
        assert!(!ir.exported_funcs.contains_key(&0));
    }

    #[test]
    fn collects_exported_i32_globals() {
        let ir = parse_wat(
            r#"
            (module
              (global (export "flag") i32 (i32.const 2048))
              (global (export "counter") (mut i32) (i32.const 8))
              (global (export "wide") i64 (i64.const 1)))
            "#,
        );

        assert_eq!(ir.exported_i32_globals.len(), 2);
        assert_eq!(ir.exported_i32_globals[0].name, "flag");
        assert_eq!(ir.exported_i32_globals[0].initialiser, 2048);
        assert!(!ir.exported_i32_globals[0].mutable);
        assert!(ir.exported_i32_globals[1].mutable);
        assert_eq!(ir.first_global_mutable, Some(false));
    }

    #[test]
    fn data_size_spans_furthest_segment() {
        let ir = parse_wat(
            r#"
            (module
              (memory 1)
              (data (i32.const 16) "abcd")
              (data (i32.const 100) "xy"))
            "#,
        );

        assert_eq!(ir.data_size, 102);
    }
}
