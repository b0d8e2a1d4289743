mod common;

use common::{bind, write_shared_module};
use wasmcell::WASM_PAGE_SIZE;

const DYN_MAIN_WAT: &str = r#"
(module
  (import "env" "dynamic_load" (func $dynamic_load (param i32 i32) (result i32)))
  (import "env" "get_dynamic_func" (func $get_dynamic_func (param i32 i32 i32) (result i32)))
  (type $binop (func (param i32 i32) (result i32)))
  (memory (export "memory") 4 4096)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (func (export "__wasm_call_ctors"))
  (data (i32.const 2048) "add")
  (func (export "_start") (result i32)
    (local $handle i32)
    (local $index i32)
    (local.set $handle
      (call $dynamic_load (i32.const 1024) (i32.load (i32.const 1020))))
    (local.set $index
      (call $get_dynamic_func (local.get $handle) (i32.const 2048) (i32.const 3)))
    (call_indirect (type $binop)
      (i32.const 2) (i32.const 3) (local.get $index))))
"#;

const LIBADD_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "__indirect_function_table" (table 2 funcref))
  (import "env" "__memory_base" (global $mb i32))
  (import "env" "__table_base" (global $tb i32))
  (import "env" "__stack_pointer" (global $sp (mut i32)))
  (func $add (export "add") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (func (export "__wasm_call_ctors"))
  (elem (global.get $tb) $add))
"#;

const BASIC_MAIN_WAT: &str = r#"
(module
  (memory (export "memory") 4 4096)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

/// Writes the shared module path into guest memory where the test mains
/// expect it: length at 1020, bytes at 1024.
fn write_path(module: &mut wasmcell::WasmModule, path: &std::path::Path) {
    let bytes = path.to_str().unwrap().as_bytes();
    module
        .write_memory(1020, &(bytes.len() as u32).to_le_bytes())
        .unwrap();
    module.write_memory(1024, bytes).unwrap();
}

#[test]
fn guest_driven_dynamic_load_and_indirect_call() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libadd.wasm", LIBADD_WAT);

    let (mut module, mut msg) = bind("dyn", "load-call", DYN_MAIN_WAT);
    write_path(&mut module, &lib);

    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    assert_eq!(msg.return_value, 5);

    let handle = module.last_loaded_dynamic_handle();
    assert!(handle >= 2);
    assert_eq!(module.dynamic_module_count(), 1);

    // The GOT entry lands inside the module's own table slice.
    let record = module.dynamic_module_record(handle).unwrap();
    let add_index = module.function_offset_from_got("add").unwrap();
    assert!(record.table_bottom <= add_index && add_index < record.table_top);
    assert!(record.validate());
}

#[test]
fn empty_path_is_the_main_module_handle() {
    let (mut module, _) = bind("dyn", "empty-path", BASIC_MAIN_WAT);

    assert_eq!(module.dynamic_load("").unwrap(), 1);
    assert_eq!(module.dynamic_module_count(), 0);
}

#[test]
fn missing_and_directory_paths_are_dlopen_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (mut module, _) = bind("dyn", "bad-paths", BASIC_MAIN_WAT);

    assert_eq!(
        module.dynamic_load("/definitely/not/here.wasm").unwrap(),
        0
    );
    assert_eq!(module.dynamic_load(dir.path().to_str().unwrap()).unwrap(), 0);
    assert_eq!(module.dynamic_module_count(), 0);
}

#[test]
fn repeat_loads_reuse_the_handle_without_new_memory() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libadd.wasm", LIBADD_WAT);

    let (mut module, _) = bind("dyn", "repeat-load", BASIC_MAIN_WAT);

    let first = module.dynamic_load(lib.to_str().unwrap()).unwrap();
    assert!(first >= 2);

    let pages_after_first = module.memory_size_pages();
    let table_after_first = module.table_size();

    let second = module.dynamic_load(lib.to_str().unwrap()).unwrap();
    assert_eq!(second, first);
    assert_eq!(module.memory_size_pages(), pages_after_first);
    assert_eq!(module.table_size(), table_after_first);
    assert_eq!(module.dynamic_module_count(), 1);
}

#[test]
fn dynamic_module_regions_are_bracketed_by_guards() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libadd.wasm", LIBADD_WAT);

    let (mut module, _) = bind("dyn", "guards", BASIC_MAIN_WAT);
    let handle = module.dynamic_load(lib.to_str().unwrap()).unwrap();
    let record = module.dynamic_module_record(handle).unwrap();

    let page = WASM_PAGE_SIZE as u32;

    let before = module
        .native_pointer(record.memory_bottom - page, 1)
        .unwrap();
    let info = unsafe { region::query(before) }.unwrap();
    assert_eq!(info.protection(), region::Protection::NONE);

    let after = module.native_pointer(record.memory_top, 1).unwrap();
    let info = unsafe { region::query(after) }.unwrap();
    assert_eq!(info.protection(), region::Protection::NONE);

    // The partition invariant holds: stack below data below heap.
    assert!(record.memory_bottom < record.stack_top);
    assert!(record.stack_top <= record.data_bottom);
    assert!(record.data_bottom <= record.data_top);
    assert!(record.data_top <= record.heap_bottom);
    assert!(record.heap_bottom <= record.memory_top);
}

const LIBMYSTERY_WAT: &str = r#"
(module
  (import "env" "__indirect_function_table" (table 1 funcref))
  (import "GOT.func" "mystery" (global $mystery (mut i32)))
  (type $ret_i32 (func (result i32)))
  (func (export "mystery") (result i32) (i32.const 77))
  (func (export "call_mystery") (result i32)
    (call_indirect (type $ret_i32) (global.get $mystery))))
"#;

#[test]
fn missing_got_entries_are_backpatched_by_the_producing_load() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libmystery.wasm", LIBMYSTERY_WAT);

    let (mut module, mut msg) = bind("dyn", "missing-set", BASIC_MAIN_WAT);

    let handle = module.dynamic_load(lib.to_str().unwrap()).unwrap();
    assert!(handle >= 2);

    // The placeholder was filled from the module's own exports and
    // promoted into the GOT.
    let mystery_index = module.function_offset_from_got("mystery").unwrap();
    assert!(module.function_from_table(mystery_index as i32).is_ok());

    // Calling through the patched pointer works.
    let call_index = module.get_dynamic_func(handle, "call_mystery").unwrap();
    msg.func_ptr = call_index as i32;
    assert!(module.execute(&mut msg).unwrap());
    assert_eq!(msg.return_value, 77);
}

const FLAG_MAIN_WAT: &str = r#"
(module
  (memory (export "memory") 4 4096)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (global (export "flag") i32 (i32.const 2048))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

const LIBFLAG_WAT: &str = r#"
(module
  (import "GOT.mem" "flag" (global $flag (mut i32)))
  (func (export "flag_addr") (result i32) (global.get $flag)))
"#;

#[test]
fn got_mem_imports_are_always_mutable() {
    // The main module's "flag" global is immutable, but the GOT.mem import
    // for it is declared mutable; the resolver creates the import global
    // mutable regardless, so this link succeeds.
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libflag.wasm", LIBFLAG_WAT);

    let (mut module, mut msg) = bind("dyn", "got-mem", FLAG_MAIN_WAT);

    let handle = module.dynamic_load(lib.to_str().unwrap()).unwrap();
    assert!(handle >= 2);
    assert_eq!(module.data_offset_from_got("flag"), Some(2048));

    let index = module.get_dynamic_func(handle, "flag_addr").unwrap();
    msg.func_ptr = index as i32;
    assert!(module.execute(&mut msg).unwrap());
    assert_eq!(msg.return_value, 2048);
}

#[test]
fn get_dynamic_func_resolves_against_the_main_bundle() {
    let (mut module, _) = bind("dyn", "dlsym-main", DYN_MAIN_WAT);

    // Handle 1 searches env intrinsics, then the main module, then WASI.
    let index = module.get_dynamic_func(1, "_start").unwrap();
    assert!(index >= 8, "appended past the declared table");
    assert_eq!(module.function_offset_from_got("_start"), Some(index));
}

#[test]
fn cloned_modules_replay_their_dynamic_loads() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(dir.path(), "libadd.wasm", LIBADD_WAT);

    let (mut module, mut msg) = bind("dyn", "clone-dyn", DYN_MAIN_WAT);
    write_path(&mut module, &lib);

    assert!(module.execute(&mut msg).unwrap());
    assert_eq!(msg.return_value, 5);

    let mut clone = module.try_clone().unwrap();
    assert_eq!(clone.dynamic_module_count(), 1);
    assert_eq!(
        clone.function_offset_from_got("add"),
        module.function_offset_from_got("add")
    );
    assert_eq!(clone.table_size(), module.table_size());

    // The clone re-runs the same flow: cached handle, GOT hit, indirect
    // call through its own fixed-up table.
    let mut clone_msg = wasmcell::Message::new("dyn", "clone-dyn");
    assert!(clone.execute(&mut clone_msg).unwrap());
    assert_eq!(clone_msg.return_value, 5);
}
