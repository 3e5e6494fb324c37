//! Metatable dispatch from bytecode and from the host API

mod common;

use common::{k, num, run, run_in, s, vm, Proto};
use lunar::Value;
use serde_json::json;

/// `setmetatable(R(obj), R(mt))` into scratch registers starting at `scratch`
fn set_metatable(proto: Proto, obj: i64, mt: i64, scratch: i64) -> Proto {
    proto
        .op("GETGLOBAL", scratch, 0, 0)
        .op("MOVE", scratch + 1, obj, 0)
        .op("MOVE", scratch + 2, mt, 0)
        .op("CALL", scratch, 3, 1)
}

#[test]
fn test_arith_call_and_index_handlers() {
    let add = Proto::new()
        .params(2)
        .constants(&[json!(42)])
        .op("LOADK", 2, 0, 0)
        .op("RETURN", 2, 2, 0);
    let call = Proto::new()
        .params(2)
        .constants(&[json!(1)])
        .op("ADD", 2, 1, k(0))
        .op("RETURN", 2, 2, 0);

    let main = Proto::new()
        .constants(&[
            json!("setmetatable"),
            json!("__add"),
            json!("__call"),
            json!(5),
            json!("__index"),
            json!("missing"),
            json!(7),
        ])
        .op("NEWTABLE", 0, 0, 0)
        .op("NEWTABLE", 1, 0, 0)
        .op("CLOSURE", 2, 0, 0)
        .op("SETTABLE", 1, k(1), 2)
        .op("CLOSURE", 2, 1, 0)
        .op("SETTABLE", 1, k(2), 2)
        .op("NEWTABLE", 2, 0, 0)
        .op("SETTABLE", 2, k(5), k(6))
        .op("SETTABLE", 1, k(4), 2);
    let main = set_metatable(main, 0, 1, 2)
        .op("ADD", 2, 0, k(3))
        .op("MOVE", 3, 0, 0)
        .op("LOADK", 4, 3, 0)
        .op("CALL", 3, 2, 2)
        .op("GETTABLE", 4, 0, k(5))
        .op("RETURN", 2, 4, 0)
        .child(add)
        .child(call);

    // obj + 5, obj(5), obj.missing
    assert_eq!(run(&main).unwrap(), vec![num(42.0), num(6.0), num(7.0)]);
}

#[test]
fn test_order_handlers() {
    let lt = Proto::new()
        .params(2)
        .op("LOADBOOL", 2, 1, 0)
        .op("RETURN", 2, 2, 0);

    let main = Proto::new()
        .constants(&[json!("setmetatable"), json!("__lt")])
        .op("NEWTABLE", 0, 0, 0)
        .op("NEWTABLE", 1, 0, 0)
        .op("NEWTABLE", 2, 0, 0)
        .op("CLOSURE", 3, 0, 0)
        .op("SETTABLE", 2, k(1), 3);
    let main = set_metatable(main, 0, 2, 3);
    let main = set_metatable(main, 1, 2, 3)
        // r3 = a < b
        .op("LT", 1, 0, 1)
        .op("JMP", 0, 1, 0)
        .op("LOADBOOL", 3, 0, 1)
        .op("LOADBOOL", 3, 1, 0)
        // r4 = a <= b, answered as not (b < a)
        .op("LE", 1, 0, 1)
        .op("JMP", 0, 1, 0)
        .op("LOADBOOL", 4, 0, 1)
        .op("LOADBOOL", 4, 1, 0)
        .op("RETURN", 3, 3, 0)
        .child(lt);

    assert_eq!(
        run(&main).unwrap(),
        vec![Value::Boolean(true), Value::Boolean(false)]
    );
}

#[test]
fn test_eq_handler_needs_shared_handler() {
    let eq = Proto::new()
        .params(2)
        .op("LOADBOOL", 2, 1, 0)
        .op("RETURN", 2, 2, 0);

    let main = Proto::new()
        .constants(&[json!("setmetatable"), json!("__eq")])
        .op("NEWTABLE", 0, 0, 0)
        .op("NEWTABLE", 1, 0, 0)
        .op("NEWTABLE", 2, 0, 0)
        .op("CLOSURE", 3, 0, 0)
        .op("SETTABLE", 2, k(1), 3)
        // r5 = a == b before b has a metatable
        .op("EQ", 1, 0, 1)
        .op("JMP", 0, 1, 0)
        .op("LOADBOOL", 5, 0, 1)
        .op("LOADBOOL", 5, 1, 0);
    let main = set_metatable(main, 0, 2, 6);
    let main = set_metatable(main, 1, 2, 6)
        // r6 = a == b with the shared handler
        .op("EQ", 1, 0, 1)
        .op("JMP", 0, 1, 0)
        .op("LOADBOOL", 6, 0, 1)
        .op("LOADBOOL", 6, 1, 0)
        .op("RETURN", 5, 3, 0)
        .child(eq);

    assert_eq!(
        run(&main).unwrap(),
        vec![Value::Boolean(false), Value::Boolean(true)]
    );
}

#[test]
fn test_tostring_handler_in_print() {
    let describe = Proto::new()
        .params(1)
        .constants(&[json!("point")])
        .op("LOADK", 1, 0, 0)
        .op("RETURN", 1, 2, 0);

    let main = Proto::new()
        .constants(&[json!("setmetatable"), json!("__tostring"), json!("print"), json!(1.5)])
        .op("NEWTABLE", 0, 0, 0)
        .op("NEWTABLE", 1, 0, 0)
        .op("CLOSURE", 2, 0, 0)
        .op("SETTABLE", 1, k(1), 2);
    let main = set_metatable(main, 0, 1, 2)
        .op("GETGLOBAL", 2, 2, 0)
        .op("MOVE", 3, 0, 0)
        .op("LOADK", 4, 3, 0)
        .op("LOADNIL", 5, 5, 0)
        .op("CALL", 2, 4, 1)
        .op("RETURN", 0, 1, 0)
        .child(describe);

    let (mut vm, output) = vm();
    run_in(&mut vm, &main).unwrap();
    assert_eq!(output.text(), "point\t1.5\tnil\n");
}

#[test]
fn test_newindex_table_redirect() {
    let main = Proto::new()
        .constants(&[
            json!("setmetatable"),
            json!("__newindex"),
            json!("key"),
            json!(1),
            json!("rawget"),
        ])
        .op("NEWTABLE", 0, 0, 0)
        .op("NEWTABLE", 1, 0, 0)
        .op("NEWTABLE", 2, 0, 0)
        .op("SETTABLE", 2, k(1), 1);
    let main = set_metatable(main, 0, 2, 3)
        .op("SETTABLE", 0, k(2), k(3))
        .op("GETGLOBAL", 3, 4, 0)
        .op("MOVE", 4, 0, 0)
        .op("LOADK", 5, 2, 0)
        .op("CALL", 3, 3, 2)
        .op("GETTABLE", 4, 1, k(2))
        .op("RETURN", 3, 3, 0);

    // rawget(proxy, "key"), store.key
    assert_eq!(run(&main).unwrap(), vec![Value::Nil, num(1.0)]);
}

#[test]
fn test_string_methods_through_shared_metatable() {
    // return ("abc"):upper()
    let main = Proto::new()
        .constants(&[json!("abc"), json!("upper")])
        .op("LOADK", 0, 0, 0)
        .op("SELF", 0, 0, k(1))
        .op("CALL", 0, 2, 2)
        .op("RETURN", 0, 2, 0);

    assert_eq!(run(&main).unwrap(), vec![s("ABC")]);
}

#[test]
fn test_userdata_len_from_host() {
    let (mut vm, _) = vm();
    let ud = vm.create_userdata(vec![1u8, 2, 3]);
    let len = vm.create_function("len", |ctx| {
        let size = ctx
            .vm
            .userdata_ref::<Vec<u8>>(&ctx.arg(1))
            .map(|v| v.len())
            .unwrap_or(0);
        Ok(vec![Value::Number(size as f64)])
    });
    let mt = vm.create_table();
    vm.table_set(&mt, s("__len"), len).unwrap();
    vm.set_metatable(&ud, mt.as_table()).unwrap();

    let main = Proto::new()
        .params(1)
        .op("LEN", 1, 0, 0)
        .op("RETURN", 1, 2, 0);
    let f = vm.instantiate(&main.chunk()).unwrap();
    assert_eq!(vm.call(&f, vec![ud]).unwrap(), vec![num(3.0)]);
}

#[test]
fn test_protected_metatable() {
    let (mut vm, _) = vm();
    let t = vm.create_table();
    let mt = vm.create_table();
    vm.table_set(&mt, s("__metatable"), s("locked")).unwrap();

    let setmetatable = vm.get_global("setmetatable").unwrap();
    let getmetatable = vm.get_global("getmetatable").unwrap();
    vm.call(&setmetatable, vec![t.clone(), mt.clone()]).unwrap();

    assert_eq!(vm.call(&getmetatable, vec![t.clone()]).unwrap(), vec![s("locked")]);
    let err = vm.call(&setmetatable, vec![t, Value::Nil]).unwrap_err();
    assert_eq!(err.to_string(), "cannot change a protected metatable");
}
