//! Import an event handle from a second process.
//!
//! The test binary re-executes itself. The child opens the handle named in
//! `GPUCOMPAT_CHILD_EVENT`, reports that the record is still pending, then
//! blocks in `synchronize` until the parent completes it.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use gpucompat::prelude::*;
use gpucompat::PollPolicy;
use gpucompat_testkit::{FakeToolchain, ManualStream};

const CHILD_ENV: &str = "GPUCOMPAT_CHILD_EVENT";

fn runtime() -> Runtime {
    let mut config = RuntimeConfig::default();
    config.ipc.poll = PollPolicy::Constant(std::time::Duration::from_micros(100));
    Runtime::with_toolchain(config, Arc::new(FakeToolchain::new()))
}

fn child(name: &str) {
    let runtime = runtime();
    let handle = IpcEventHandle::from_name(name).expect("handle");
    let event = runtime.ipc_open_event_handle(&handle).expect("open handle");
    assert_eq!(event.device_id(), DeviceId(3));

    let status = runtime.event_query(&event);
    println!("opened {status:?}");

    runtime.event_synchronize(&event);
    assert_eq!(runtime.event_query(&event), Ok(()));
    println!("synchronized");
}

fn parent() {
    let runtime = runtime();
    runtime.set_device(DeviceId(3)).unwrap();
    let stream = ManualStream::new(runtime.device());
    let event = runtime.create_ipc_event();

    runtime.event_record(&event, &stream).unwrap();
    let handle = runtime.ipc_get_event_handle(&event).unwrap();

    // Importing in the exporting process is refused.
    assert!(matches!(
        runtime.ipc_open_event_handle(&handle),
        Err(RuntimeError::InvalidContext(_))
    ));

    let mut child = Command::new(std::env::current_exe().unwrap())
        .env(CHILD_ENV, handle.name().unwrap())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();

    assert_eq!(lines.next().unwrap().unwrap(), "opened Err(NotReady)");
    let owners = &event.segment().unwrap().header().owners;
    assert_eq!(owners.load(Ordering::Acquire), 2);

    stream.complete_all();
    assert_eq!(lines.next().unwrap().unwrap(), "synchronized");
    assert!(child.wait().unwrap().success());

    // The child released its reference on exit.
    assert_eq!(owners.load(Ordering::Acquire), 1);
    println!("cross_process: ok");
}

fn main() {
    if !cfg!(unix) {
        println!("cross_process: skipped, shared memory events need unix");
        return;
    }
    match std::env::var(CHILD_ENV) {
        Ok(name) => child(&name),
        Err(_) => parent(),
    }
}
