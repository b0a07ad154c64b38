//! End-to-end scenarios through the public runtime API.

use std::sync::Arc;
use std::time::Duration;

use gpucompat::prelude::*;
use gpucompat::{Header, PollPolicy, IPC_SIGNALS_PER_EVENT};
use gpucompat_testkit::{FakeToolchain, ManualStream};

fn runtime_with(toolchain: FakeToolchain) -> Runtime {
    let mut config = RuntimeConfig::default();
    config.ipc.poll = PollPolicy::Spin;
    Runtime::with_toolchain(config, Arc::new(toolchain))
}

fn runtime() -> Runtime {
    runtime_with(FakeToolchain::new())
}

#[test]
fn fresh_event_is_ready() {
    let runtime = runtime();
    let event = runtime.create_ipc_event();
    assert_eq!(runtime.event_query(&event), Ok(()));
    runtime.event_synchronize(&event);
}

#[test]
fn self_import_is_invalid_context() {
    let runtime = runtime();
    let event = runtime.create_ipc_event();
    let handle = runtime.ipc_get_event_handle(&event).unwrap();
    assert_eq!(handle.as_bytes().len(), 64);
    assert!(matches!(
        runtime.ipc_open_event_handle(&handle),
        Err(RuntimeError::InvalidContext(_))
    ));
}

#[test]
fn garbage_handle_is_invalid_value() {
    let runtime = runtime();
    let handle = IpcEventHandle::from_bytes([0xff; 64]);
    assert!(matches!(
        runtime.ipc_open_event_handle(&handle),
        Err(RuntimeError::InvalidValue(_))
    ));
}

#[test]
fn read_index_is_monotonic_across_wraps() {
    let runtime = runtime();
    let stream = ManualStream::new(runtime.device());
    let event = runtime.create_ipc_event();

    let mut last = -1;
    for _ in 0..(IPC_SIGNALS_PER_EVENT * 3) {
        runtime.event_record(&event, &stream).unwrap();
        let ring = event.segment().unwrap().ring();
        let read = ring.read_index();
        assert!(read > last);
        last = read;
        stream.complete_next();
    }
    assert_eq!(runtime.event_query(&event), Ok(()));
}

#[test]
fn stream_wait_orders_after_record() {
    let runtime = runtime();
    let producer = ManualStream::new(runtime.device());
    let consumer = HostStream::new(runtime.device()).unwrap();
    let event = runtime.create_ipc_event();

    runtime.event_record(&event, &producer).unwrap();
    runtime.event_wait(&event, &consumer).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    consumer
        .enqueue_callback(Box::new(move |_| tx.send(()).unwrap()))
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    producer.complete_all();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    consumer.synchronize();
}

#[test]
fn kernel_program_scenario() {
    let runtime = runtime();
    let programs = runtime.programs();
    let program = runtime
        .create_program("__global__ void k(){}", Some("k.cu"), &[])
        .unwrap();
    programs.add_name_expression(program, "k").unwrap();
    programs.compile_program::<&str>(program, &[]).unwrap();
    assert_eq!(programs.lowered_name(program, "k").unwrap(), "_Z1kv");
    assert!(programs.code_size(program).unwrap() > 0);
    programs.destroy_program(program).unwrap();
}

#[test]
fn template_expression_round_trip() {
    let runtime = runtime_with(
        FakeToolchain::new()
            .with_symbol("_Z3fooIiEvPi.kd", "void foo<int>(int*) (.kd)")
            .with_symbol("_Z3fooIiEvPi", "void foo<int>(int*)"),
    );
    let programs = runtime.programs();
    let program = runtime
        .create_program(
            "template <typename T> __global__ void foo(T* out) { *out = T(); }",
            None,
            &[Header::new("types.h", "")],
        )
        .unwrap();
    programs.add_name_expression(program, "&foo<int>").unwrap();
    programs.compile_program(program, &["-O2"]).unwrap();

    let lowered = programs.lowered_name(program, "foo<int>").unwrap();
    assert_eq!(lowered, "_Z3fooIiEvPi");
    assert!(!lowered.is_empty());
    assert!(!lowered.chars().any(char::is_whitespace));
    assert!(!lowered.contains(".kd"));
}

#[test]
fn lowered_name_before_compile_is_not_valid() {
    let runtime = runtime();
    let programs = runtime.programs();
    let program = runtime.create_program("__global__ void k(){}", None, &[]).unwrap();
    programs.add_name_expression(program, "k").unwrap();
    for expr in ["k", "never_registered"] {
        assert!(matches!(
            programs.lowered_name(program, expr),
            Err(RtcError::NameExpressionNotValid(_))
        ));
    }
}

#[test]
fn missing_header_names_is_invalid_input() {
    let runtime = runtime();
    let result = runtime.programs().create_program(
        "__global__ void k(){}",
        None,
        2,
        Some(&["", ""][..]),
        None,
        runtime.device(),
    );
    assert!(matches!(result, Err(RtcError::InvalidInput(_))));
}

#[test]
fn compile_failure_keeps_log() {
    let runtime = runtime_with(FakeToolchain::new().failing("k.cu:1:1: error: unknown type name"));
    let programs = runtime.programs();
    let program = runtime.create_program("bogus k(){}", Some("k.cu"), &[]).unwrap();
    assert_eq!(
        programs.compile_program::<&str>(program, &[]),
        Err(RtcError::Compilation)
    );
    let log = programs.program_log(program).unwrap();
    assert!(log.contains("unknown type name"));
    assert_eq!(programs.program_log_size(program).unwrap(), log.len() + 1);
    assert_eq!(runtime.rtc_version(), (1, 0));
}
