mod common;

use common::{bind, register_function};
use wasmcell::{
    ExecuteError, HostConfig, Message, WasmModule, WasmThreadSpec, STACK_SIZE,
};
use wasmer::Value;

const HELLO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 4 funcref)
  (data (i32.const 64) "hello\n")
  (func (export "__wasm_call_ctors"))
  (func (export "_start")
    (i32.store (i32.const 1024) (i32.const 64))
    (i32.store (i32.const 1028) (i32.const 6))
    (drop (call $fd_write
      (i32.const 1) (i32.const 1024) (i32.const 1) (i32.const 1040)))))
"#;

#[test]
fn hello_world_captures_stdout() {
    wasmcell::config::set_global(HostConfig {
        capture_stdout: true,
        ..HostConfig::default()
    });

    let (mut module, mut msg) = bind("demo", "hello", HELLO_WAT);

    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    assert_eq!(msg.return_value, 0);
    assert_eq!(module.read_captured_stdout().unwrap(), b"hello\n");
}

const INDIRECT_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 10 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start"))
  (func $inc (export "inc") (param i32) (result i32)
    (i32.add (local.get 0) (i32.const 1)))
  (elem (i32.const 7) $inc))
"#;

#[test]
fn indirect_call_through_table_slot() {
    let (mut module, mut msg) = bind("demo", "indirect", INDIRECT_WAT);

    msg.func_ptr = 7;
    msg.input_data = b"41".to_vec();
    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    assert_eq!(msg.return_value, 42);

    // The GOT agrees with the table about where the export lives.
    assert_eq!(module.function_offset_from_got("inc"), Some(7));
    assert!(module.function_from_table(7).is_ok());
}

#[test]
fn single_param_defaults_to_zero_on_empty_input() {
    let (mut module, mut msg) = bind("demo", "indirect-empty", INDIRECT_WAT);

    msg.func_ptr = 7;
    msg.input_data = Vec::new();
    assert!(module.execute(&mut msg).unwrap());
    assert_eq!(msg.return_value, 1);
}

#[test]
fn single_param_rejects_non_decimal_input() {
    let (mut module, mut msg) = bind("demo", "indirect-bad-input", INDIRECT_WAT);

    msg.func_ptr = 7;
    msg.input_data = b"forty-one".to_vec();
    assert!(matches!(
        module.execute(&mut msg),
        Err(ExecuteError::InvalidFunctionArg(_))
    ));
}

const TRAP_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 8 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start") (result i32)
    (i32.div_u (i32.const 1) (i32.const 0)))
  (func $ok (export "ok") (result i32) (i32.const 7))
  (elem (i32.const 5) $ok))
"#;

#[test]
fn trap_is_captured_and_module_stays_usable() {
    let (mut module, mut msg) = bind("demo", "trap", TRAP_WAT);

    let success = module.execute(&mut msg).unwrap();
    assert!(!success);
    assert_eq!(msg.return_value, 1);

    // The module stays bound; a later execute against a healthy function
    // still works.
    let mut msg = Message::new("demo", "trap");
    msg.func_ptr = 5;
    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    assert_eq!(msg.return_value, 7);
}

const EXIT_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 4 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start")
    (call $proc_exit (i32.const 42))))
"#;

#[test]
fn exit_signal_carries_its_code() {
    let (mut module, mut msg) = bind("demo", "exit", EXIT_WAT);

    let success = module.execute(&mut msg).unwrap();
    assert!(!success);
    assert_eq!(msg.return_value, 42);
}

const EXIT_ZERO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 4 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start")
    (call $proc_exit (i32.const 0))))
"#;

#[test]
fn exit_zero_counts_as_success() {
    let (mut module, mut msg) = bind("demo", "exit-zero", EXIT_ZERO_WAT);

    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    assert_eq!(msg.return_value, 0);
}

#[test]
fn execute_on_unbound_module_is_a_precondition_error() {
    let mut module = WasmModule::new();
    let mut msg = Message::new("demo", "unbound");
    assert!(matches!(
        module.execute(&mut msg),
        Err(ExecuteError::NotBound)
    ));
}

#[test]
fn execute_with_mismatched_identity_fails() {
    let (mut module, _) = bind("demo", "identity", INDIRECT_WAT);

    let mut msg = Message::new("demo", "somebody-else");
    assert!(matches!(
        module.execute(&mut msg),
        Err(ExecuteError::WrongFunction { .. })
    ));
}

const TWO_PARAM_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 8 funcref)
  (func (export "__wasm_call_ctors"))
  (func (export "_start"))
  (func $sum (export "sum") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (elem (i32.const 3) $sum))
"#;

#[test]
fn unexpected_function_pointer_arity_is_fatal() {
    let (mut module, mut msg) = bind("demo", "arity", TWO_PARAM_WAT);

    msg.func_ptr = 3;
    assert!(matches!(
        module.execute(&mut msg),
        Err(ExecuteError::UnexpectedFunctionArity(2))
    ));
}

const THREAD_WAT: &str = r#"
(module
  (memory (export "memory") 2 512)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 4194304))
  (func (export "__wasm_call_ctors"))
  (func (export "_start"))
  (func $sum (export "sum") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (func $omp (export "omp") (param i32 i32 i32) (result i32)
    (i32.add
      (i32.add
        (i32.mul (local.get 0) (i32.const 100))
        (i32.mul (local.get 1) (i32.const 10)))
      (local.get 2)))
  (elem (i32.const 3) $sum $omp))
"#;

#[test]
fn thread_execution_uses_a_fresh_stack_and_restores_the_pointer() {
    let (mut module, _) = bind("demo", "threads", THREAD_WAT);

    let func = module.function_from_table(3).unwrap();
    let stack_base = module.allocate_thread_stack().unwrap();
    let spec = WasmThreadSpec {
        func,
        args: vec![Value::I32(20), Value::I32(22)],
        stack_base,
    };

    assert_eq!(module.execute_thread(&spec).unwrap(), 42);

    // The context's stack pointer is back at its resting value.
    assert_eq!(module.get_global_i32("__stack_pointer"), STACK_SIZE as i32);

    // Stacks are carved monotonically out of linear memory.
    let second = module.allocate_thread_stack().unwrap();
    assert!(second > stack_base);
}

#[test]
fn remote_omp_execution_reverses_its_args() {
    let (mut module, mut msg) = bind("demo", "omp", THREAD_WAT);

    msg.func_ptr = 4;
    msg.omp_depth = 1;
    msg.omp_thread_num = 3;
    msg.omp_function_args = vec![7];

    let success = module.execute(&mut msg).unwrap();
    assert!(success);
    // [thread_num, argc, args...] = [3, 1, 7]
    assert_eq!(msg.return_value, 317);
}

const BAD_SP_WAT: &str = r#"
(module
  (memory (export "memory") 2 256)
  (table (export "__indirect_function_table") 8 funcref)
  (global (export "__stack_pointer") (mut i32) (i32.const 1234))
  (func (export "__wasm_call_ctors"))
  (func (export "_start"))
  (func $sum (export "sum") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (elem (i32.const 3) $sum))
"#;

#[test]
fn thread_execution_rejects_an_unexpected_stack_pointer() {
    let (mut module, _) = bind("demo", "bad-sp", BAD_SP_WAT);

    let func = module.function_from_table(3).unwrap();
    let stack_base = module.allocate_thread_stack().unwrap();
    let spec = WasmThreadSpec {
        func,
        args: vec![Value::I32(1), Value::I32(2)],
        stack_base,
    };

    assert!(matches!(
        module.execute_thread(&spec),
        Err(ExecuteError::UnexpectedStackPointer(1234))
    ));
}

#[test]
fn registered_functions_can_be_rebound_after_teardown() {
    register_function("demo", "rebind", INDIRECT_WAT);

    let msg = Message::new("demo", "rebind");
    let mut module = WasmModule::new();
    module.bind_to_function(&msg).unwrap();
    assert!(module.tear_down());

    // The record is inert now; executing is a precondition error, and a
    // fresh module can bind to the same function.
    let mut run = Message::new("demo", "rebind");
    assert!(matches!(
        module.execute(&mut run),
        Err(ExecuteError::NotBound)
    ));

    let mut fresh = WasmModule::new();
    fresh.bind_to_function(&msg).unwrap();
    let mut run = Message::new("demo", "rebind");
    run.func_ptr = 7;
    run.input_data = b"1".to_vec();
    assert!(fresh.execute(&mut run).unwrap());
    assert_eq!(run.return_value, 2);
}
