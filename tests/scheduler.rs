//! Sliced executions and the cooperative scheduler

mod common;

use common::{k, num, s, vm, vm_with, Proto};
use lunar::{LuaError, LuaVM, Scheduler, Slice, VMConfig, Value};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// `for i = 1, 1000 do end; return "done"`
fn counting() -> Proto {
    Proto::new()
        .constants(&[json!(1), json!(1000), json!("done")])
        .op("LOADK", 0, 0, 0)
        .op("LOADK", 1, 1, 0)
        .op("LOADK", 2, 0, 0)
        .op("FORPREP", 0, 0, 0)
        .op("FORLOOP", 0, -1, 0)
        .op("LOADK", 0, 2, 0)
        .op("RETURN", 0, 2, 0)
}

fn spinning() -> Proto {
    Proto::new().op("JMP", 0, -1, 0).op("RETURN", 0, 1, 0)
}

fn failing() -> Proto {
    Proto::new()
        .constants(&[json!(1)])
        .op("LOADNIL", 0, 0, 0)
        .op("ADD", 0, 0, k(0))
        .op("RETURN", 0, 1, 0)
}

fn load(vm: &mut LuaVM, proto: &Proto) -> Value {
    vm.instantiate(&proto.chunk()).unwrap()
}

#[test]
fn test_resume_in_slices() {
    let (mut vm, _) = vm();
    let f = load(&mut vm, &counting());
    let id = vm.spawn(&f, vec![]).unwrap();
    assert!(vm.is_parked(id));

    let mut slices = 0;
    let results = loop {
        match vm.resume(id, 100).unwrap() {
            Slice::Suspended => {
                slices += 1;
                assert!(vm.is_parked(id));
            }
            Slice::Complete(results) => break results,
        }
    };
    assert!(slices >= 10, "only {} slices", slices);
    assert_eq!(results, vec![s("done")]);
    assert!(!vm.is_parked(id));

    let err = vm.resume(id, 100).unwrap_err();
    assert!(err.to_string().contains("unknown execution"));
}

#[test]
fn test_host_work_between_slices() {
    let (mut vm, _) = vm();
    let f = load(&mut vm, &counting());
    let id = vm.spawn(&f, vec![]).unwrap();
    assert!(matches!(vm.resume(id, 10).unwrap(), Slice::Suspended));

    // the host state is independent of the parked execution
    let tostring = vm.get_global("tostring").unwrap();
    assert_eq!(vm.call(&tostring, vec![num(3.0)]).unwrap(), vec![s("3")]);

    let results = runtime().block_on(Scheduler::new(100, None).run(&mut vm, id));
    assert_eq!(results.unwrap(), vec![s("done")]);
}

#[test]
fn test_spawn_native_function() {
    let (mut vm, _) = vm();
    let tostring = vm.get_global("tostring").unwrap();
    let id = vm.spawn(&tostring, vec![num(5.0)]).unwrap();
    match vm.resume(id, 1).unwrap() {
        Slice::Complete(results) => assert_eq!(results, vec![s("5")]),
        Slice::Suspended => panic!("native call suspended"),
    }
}

#[test]
fn test_scheduler_timeout() {
    let mut config = VMConfig::default();
    config.limits.instruction_limit = 0;
    let (mut vm, _) = vm_with(config);
    let f = load(&mut vm, &spinning());
    let id = vm.spawn(&f, vec![]).unwrap();

    let scheduler = Scheduler::new(1000, Some(Duration::from_millis(20)));
    let err = runtime().block_on(scheduler.run(&mut vm, id)).unwrap_err();
    assert!(matches!(err, LuaError::Timeout));
    assert!(!err.is_catchable());
    assert!(!vm.is_parked(id));

    // later executions are unaffected
    let f = load(&mut vm, &counting());
    let id = vm.spawn(&f, vec![]).unwrap();
    let results = runtime().block_on(scheduler.run(&mut vm, id)).unwrap();
    assert_eq!(results, vec![s("done")]);
}

#[test]
fn test_kill_flag_stops_scheduler() {
    let (mut vm, _) = vm();
    let f = load(&mut vm, &spinning());
    let id = vm.spawn(&f, vec![]).unwrap();

    vm.kill_flag().store(true, Ordering::Relaxed);
    let err = runtime()
        .block_on(Scheduler::new(100, None).run(&mut vm, id))
        .unwrap_err();
    assert!(matches!(err, LuaError::Killed));
    assert!(!vm.is_parked(id));

    assert!(!vm.kill_flag().load(Ordering::Relaxed));
    let f = load(&mut vm, &counting());
    let id = vm.spawn(&f, vec![]).unwrap();
    let results = runtime().block_on(Scheduler::new(100, None).run(&mut vm, id));
    assert_eq!(results.unwrap(), vec![s("done")]);
}

#[test]
fn test_run_all_isolates_failures() {
    let mut config = VMConfig::default();
    config.limits.instruction_limit = 0;
    let (mut vm, _) = vm_with(config);

    let ok = load(&mut vm, &counting());
    let bad = load(&mut vm, &failing());
    let spin = load(&mut vm, &spinning());
    let ids = [
        vm.spawn(&ok, vec![]).unwrap(),
        vm.spawn(&bad, vec![]).unwrap(),
        vm.spawn(&spin, vec![]).unwrap(),
    ];

    let scheduler = Scheduler::new(50, Some(Duration::from_millis(30)));
    let mut results = runtime().block_on(scheduler.run_all(&mut vm, &ids));
    assert_eq!(results.len(), 3);

    assert_eq!(results.remove(&ids[0]).unwrap().unwrap(), vec![s("done")]);
    let err = results.remove(&ids[1]).unwrap().unwrap_err();
    assert_eq!(
        err.to_string(),
        "test.lua:2: attempt to perform arithmetic on a nil value"
    );
    let err = results.remove(&ids[2]).unwrap().unwrap_err();
    assert!(matches!(err, LuaError::Timeout));

    for id in ids {
        assert!(!vm.is_parked(id));
    }
}

#[test]
fn test_cancel() {
    let (mut vm, _) = vm();

    let f = load(&mut vm, &counting());
    let id = vm.spawn(&f, vec![]).unwrap();
    assert!(matches!(vm.resume(id, 10).unwrap(), Slice::Suspended));

    assert!(vm.cancel(id));
    assert!(!vm.cancel(id));
    assert!(!vm.is_parked(id));
    assert!(vm.resume(id, 10).is_err());

    let untouched = vm.spawn(&f, vec![]).unwrap();
    assert!(vm.cancel(untouched));
}
