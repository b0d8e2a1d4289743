mod common;

use std::io::Write as _;
use std::os::fd::AsRawFd;

use common::{bind, register_function, write_shared_module};
use wasmcell::{BindError, LinkError, Message, WasmModule};

const BASIC_WAT: &str = r#"
(module
  (memory (export "memory") 4 4096)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

#[test]
fn binding_twice_is_rejected() {
    register_function("life", "double-bind", BASIC_WAT);

    let msg = Message::new("life", "double-bind");
    let mut module = WasmModule::new();
    module.bind_to_function(&msg).unwrap();

    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::AlreadyBound)
    ));
}

const NO_CTORS_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 2 funcref)
  (func (export "_start")))
"#;

#[test]
fn main_module_without_ctors_fails_to_bind() {
    register_function("life", "no-ctors", NO_CTORS_WAT);

    let msg = Message::new("life", "no-ctors");
    let mut module = WasmModule::new();
    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::Link(LinkError::MissingMainExport(
            "__wasm_call_ctors"
        )))
    ));
}

const IMMUTABLE_STACK_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 2 funcref)
  (global (export "flag") i32 (i32.const 64))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

#[test]
fn immutable_stack_top_fails_to_bind() {
    register_function("life", "immutable-stack", IMMUTABLE_STACK_WAT);

    let msg = Message::new("life", "immutable-stack");
    let mut module = WasmModule::new();
    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::Link(LinkError::ImmutableStackPointer))
    ));
}

const NO_MEMORY_WAT: &str = r#"
(module
  (table (export "__indirect_function_table") 2 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

#[test]
fn main_module_must_export_its_memory() {
    register_function("life", "no-memory", NO_MEMORY_WAT);

    let msg = Message::new("life", "no-memory");
    let mut module = WasmModule::new();
    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::Link(LinkError::MissingMainExport("memory")))
    ));
}

const ZYGOTE_WAT: &str = r#"
(module
  (memory (export "memory") 4 256)
  (table (export "__indirect_function_table") 2 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_faasm_zygote") (result i32)
    (i32.store8 (i32.const 8192) (i32.const 119))
    (i32.const 0))
  (func (export "_start")))
"#;

#[test]
fn zygote_runs_at_bind_time() {
    let (mut module, _) = bind("life", "zygote", ZYGOTE_WAT);
    assert_eq!(module.read_memory(8192, 1).unwrap(), vec![119]);
}

#[test]
fn no_zygote_bind_skips_the_hook() {
    register_function("life", "zygote-skip", ZYGOTE_WAT);

    let msg = Message::new("life", "zygote-skip");
    let mut module = WasmModule::new();
    module.bind_to_function_no_zygote(&msg).unwrap();
    assert_eq!(module.read_memory(8192, 1).unwrap(), vec![0]);
}

const FAILING_ZYGOTE_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 2 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_faasm_zygote") (result i32) (i32.const 9))
  (func (export "_start")))
"#;

#[test]
fn failing_zygote_is_fatal() {
    register_function("life", "zygote-fail", FAILING_ZYGOTE_WAT);

    let msg = Message::new("life", "zygote-fail");
    let mut module = WasmModule::new();
    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::ZygoteFailed { code: 9 })
    ));
}

const BAD_LAYOUT_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 2 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (global (export "__heap_base") i32 (i32.const 100))
  (global (export "__data_end") i32 (i32.const 200))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

#[test]
fn diverging_heap_base_and_data_end_are_fatal() {
    register_function("life", "bad-layout", BAD_LAYOUT_WAT);

    let msg = Message::new("life", "bad-layout");
    let mut module = WasmModule::new();
    assert!(matches!(
        module.bind_to_function(&msg),
        Err(BindError::BadMemoryLayout {
            heap_base: 100,
            data_end: 200
        })
    ));
}

const GOOD_LAYOUT_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 2 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (global (export "__heap_base") i32 (i32.const 4096))
  (global (export "__data_end") i32 (i32.const 4096))
  (func (export "__wasm_call_ctors"))
  (func (export "_start")))
"#;

#[test]
fn matching_heap_base_and_data_end_bind_fine() {
    let (module, _) = bind("life", "good-layout", GOOD_LAYOUT_WAT);
    assert!(module.is_bound());
}

#[test]
fn teardown_is_idempotent() {
    let (mut module, _) = bind("life", "teardown", BASIC_WAT);
    assert!(module.tear_down());
    assert!(module.tear_down());
    assert_eq!(module.dynamic_module_count(), 0);
}

#[test]
fn mapped_files_are_readable_and_indexed_by_path() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let pattern: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    tmp.write_all(&pattern).unwrap();
    tmp.flush().unwrap();

    let (mut module, _) = bind("life", "map-file", BASIC_WAT);

    let fd = tmp.as_file().as_raw_fd();
    let ptr = module.map_file("shared/data.bin", fd, 65536).unwrap();

    assert_eq!(module.read_memory(ptr, 16).unwrap(), &pattern[..16]);
    assert_eq!(
        module.read_memory(ptr + 60000, 8).unwrap(),
        &pattern[60000..60008]
    );
    assert_eq!(module.shared_pointer("shared/data.bin"), Some(ptr));
}

#[test]
fn flush_clears_the_module_cache() {
    // A flushed cache recompiles on the next bind instead of failing.
    register_function("life", "flush", BASIC_WAT);
    let msg = Message::new("life", "flush");

    let mut first = WasmModule::new();
    first.bind_to_function(&msg).unwrap();

    wasmcell::flush_module_cache();

    let mut second = WasmModule::new();
    second.bind_to_function(&msg).unwrap();
    assert!(second.is_bound());
}

#[test]
fn shared_modules_do_not_collide_with_function_keys() {
    // Loading a shared module under one bound module must not disturb a
    // neighbour bound to the same function.
    let dir = tempfile::tempdir().unwrap();
    let lib = write_shared_module(
        dir.path(),
        "libnoop.wasm",
        r#"(module (func (export "noop")))"#,
    );

    register_function("life", "neighbours", BASIC_WAT);
    let msg = Message::new("life", "neighbours");

    let mut a = WasmModule::new();
    a.bind_to_function(&msg).unwrap();
    let mut b = WasmModule::new();
    b.bind_to_function(&msg).unwrap();

    let handle = a.dynamic_load(lib.to_str().unwrap()).unwrap();
    assert!(handle >= 2);
    assert_eq!(a.dynamic_module_count(), 1);
    assert_eq!(b.dynamic_module_count(), 0);
}
