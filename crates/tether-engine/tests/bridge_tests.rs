//! Bridge behavior seen from script: handles, marshaling, overloads, and
//! multi-value returns.

use std::rc::Rc;

use tether_engine::host::{HostException, MethodBuilder, TypeBuilder};
use tether_engine::{
    BridgeError, HostType, HostValue, ObjectHandle, Ownership, ScriptRuntime, ScriptValue, TypeDomain,
};

fn domain() -> TypeDomain {
    let domain = TypeDomain::new();
    domain
        .define(
            TypeBuilder::class("Game.Echo")
                .method(
                    MethodBuilder::method("Int")
                        .static_()
                        .param("v", HostType::i32())
                        .returns(HostType::i32())
                        .native(|inv| Ok(inv.arg(0))),
                )
                .method(
                    MethodBuilder::method("Long")
                        .static_()
                        .param("v", HostType::i64())
                        .returns(HostType::i64())
                        .native(|inv| Ok(inv.arg(0))),
                )
                .method(
                    MethodBuilder::method("Real")
                        .static_()
                        .param("v", HostType::f64())
                        .returns(HostType::f64())
                        .native(|inv| Ok(inv.arg(0))),
                )
                .method(
                    MethodBuilder::method("Flag")
                        .static_()
                        .param("v", HostType::Bool)
                        .returns(HostType::Bool)
                        .native(|inv| Ok(inv.arg(0))),
                )
                .method(
                    MethodBuilder::method("Text")
                        .static_()
                        .param("v", HostType::String)
                        .returns(HostType::String)
                        .native(|inv| Ok(inv.arg(0))),
                ),
        )
        .unwrap();
    domain
        .define(
            TypeBuilder::class("Game.Printer")
                .method(
                    MethodBuilder::method("Show")
                        .static_()
                        .param("n", HostType::i32())
                        .returns(HostType::String)
                        .native(|_| Ok(HostValue::str("int"))),
                )
                .method(
                    MethodBuilder::method("Show")
                        .static_()
                        .param("n", HostType::f64())
                        .returns(HostType::String)
                        .native(|_| Ok(HostValue::str("double"))),
                )
                .method(
                    MethodBuilder::method("Show")
                        .static_()
                        .param("s", HostType::String)
                        .returns(HostType::String)
                        .native(|_| Ok(HostValue::str("string"))),
                ),
        )
        .unwrap();
    domain
        .define(
            TypeBuilder::class("Game.Stats")
                .method(
                    MethodBuilder::method("Split")
                        .static_()
                        .param("n", HostType::i32())
                        .param_out("lo", HostType::i32())
                        .param_out("hi", HostType::i32())
                        .returns(HostType::Bool)
                        .native(|inv| {
                            let n = inv.arg_i64(0)?;
                            inv.set_arg(1, HostValue::Int(n / 2))?;
                            inv.set_arg(2, HostValue::Int(n - n / 2))?;
                            Ok(HostValue::Bool(n % 2 == 0))
                        }),
                )
                .method(
                    MethodBuilder::method("Bump")
                        .static_()
                        .param_ref("n", HostType::i32())
                        .native(|inv| {
                            let n = inv.arg_i64(0)?;
                            inv.set_arg(0, HostValue::Int(n + 1))?;
                            Ok(HostValue::Null)
                        }),
                )
                .method(
                    MethodBuilder::method("Fail")
                        .static_()
                        .native(|_| Err(HostException::new("InvalidOperationException", "stats are frozen"))),
                ),
        )
        .unwrap();
    domain
        .define(
            TypeBuilder::value_type("Game.Point")
                .field("x", HostType::i32())
                .method(MethodBuilder::constructor())
                .method(
                    MethodBuilder::method("Nudge")
                        .static_()
                        .param("p", HostType::class("Game.Point"))
                        .native(|inv| {
                            if let Some(p) = inv.arg(0).as_object() {
                                let x = p.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
                                p.set(0, HostValue::Int(x + 1));
                            }
                            Ok(HostValue::Null)
                        }),
                ),
        )
        .unwrap();
    domain
        .define(TypeBuilder::class("Game.Item").method(MethodBuilder::constructor()))
        .unwrap();
    domain
        .define(
            TypeBuilder::class("Game.Sword")
                .base("Game.Item")
                .method(MethodBuilder::constructor()),
        )
        .unwrap();
    domain
        .define(
            TypeBuilder::class("Game.Armory")
                .method(
                    MethodBuilder::method("Store")
                        .static_()
                        .param("item", HostType::class("Game.Item"))
                        .returns(HostType::String)
                        .native(|_| Ok(HostValue::str("item"))),
                )
                .method(
                    MethodBuilder::method("Store")
                        .static_()
                        .param("sword", HostType::class("Game.Sword"))
                        .returns(HostType::String)
                        .native(|_| Ok(HostValue::str("sword"))),
                ),
        )
        .unwrap();
    domain
}

fn runtime() -> ScriptRuntime {
    ScriptRuntime::new(Rc::new(domain()))
}

fn call_static(rt: &mut ScriptRuntime, ty: &str, member: &str, args: &[ScriptValue]) -> Vec<ScriptValue> {
    try_static(rt, ty, member, args).unwrap()
}

fn try_static(
    rt: &mut ScriptRuntime,
    ty: &str,
    member: &str,
    args: &[ScriptValue],
) -> Result<Vec<ScriptValue>, tether_engine::ScriptError> {
    let bridge = Rc::clone(rt.bridge());
    let class = bridge.import(rt.vm_mut(), ty).unwrap();
    let func = rt.vm_mut().index(&class, member)?;
    rt.vm_mut().call_value(&func, args)
}

// ============================================================================
// Handles
// ============================================================================

#[test]
fn test_wrap_unwrap_release() {
    let rt = runtime();
    let bridge = rt.bridge();
    let ty = bridge.domain().lookup("Game.Echo").unwrap();
    let obj = bridge.domain().instantiate(ty).unwrap();

    let handle = bridge.wrap(&obj, Ownership::Strong);
    assert!(Rc::ptr_eq(&bridge.unwrap(handle).unwrap(), &obj));
    // Each wrap issues a distinct handle
    let second = bridge.wrap(&obj, Ownership::Strong);
    assert_ne!(handle, second);

    bridge.release(handle).unwrap();
    assert!(matches!(bridge.unwrap(handle), Err(BridgeError::StaleHandle(h)) if h == handle));
    assert!(bridge.unwrap(second).is_ok());

    // A reused slot never answers to the old handle
    let third = bridge.wrap(&obj, Ownership::Strong);
    assert_eq!(third.index, handle.index);
    assert!(bridge.unwrap(handle).is_err());
    assert_eq!(ObjectHandle::from_raw(third.to_raw()), third);
}

#[test]
fn test_weak_handle_goes_stale_with_host_object() {
    let mut rt = runtime();
    let bridge = Rc::clone(rt.bridge());
    let ty = bridge.domain().lookup("Game.Point").unwrap();
    let obj = bridge.domain().instantiate(ty).unwrap();
    let value = bridge.to_script_weak(rt.vm_mut(), &obj).unwrap();
    assert_eq!(rt.vm_mut().index(&value, "x").unwrap(), ScriptValue::Number(0.0));

    drop(obj);
    let err = rt.vm_mut().index(&value, "x").unwrap_err();
    assert!(err.message.starts_with("Stale handle 0x"), "{}", err.message);
}

// ============================================================================
// Marshaling
// ============================================================================

#[test]
fn test_primitive_round_trip() {
    let mut rt = runtime();
    let cases: Vec<(&str, ScriptValue)> = vec![
        ("Int", ScriptValue::Number(-7.0)),
        ("Long", ScriptValue::Number(9_007_199_254_740_991.0)),
        ("Real", ScriptValue::Number(0.25)),
        ("Flag", ScriptValue::Bool(true)),
        ("Text", ScriptValue::from("héllo")),
        ("Text", ScriptValue::Nil),
    ];
    for (member, value) in cases {
        let out = call_static(&mut rt, "Game.Echo", member, &[value.clone()]);
        assert_eq!(out, vec![value], "{}", member);
    }
}

#[test]
fn test_conversion_errors_reach_script() {
    let mut rt = runtime();
    let err = try_static(&mut rt, "Game.Echo", "Int", &[ScriptValue::Number(1.5)]).unwrap_err();
    assert!(err.message.starts_with("Conversion error"), "{}", err.message);
    let err = try_static(&mut rt, "Game.Echo", "Int", &[ScriptValue::from("1")]).unwrap_err();
    assert!(err.message.contains("No matching member `Int`"), "{}", err.message);
}

#[test]
fn test_value_types_are_copied() {
    let mut rt = runtime();
    let bridge = Rc::clone(rt.bridge());
    let class = bridge.import(rt.vm_mut(), "Game.Point").unwrap();
    let point = rt.vm_mut().call_value(&class, &[]).unwrap().remove(0);
    call_static(&mut rt, "Game.Point", "Nudge", &[point.clone()]);
    assert_eq!(rt.vm_mut().index(&point, "x").unwrap(), ScriptValue::Number(0.0));
}

#[test]
fn test_multiple_returns_in_declaration_order() {
    let mut rt = runtime();
    assert_eq!(
        call_static(&mut rt, "Game.Stats", "Split", &[ScriptValue::Number(7.0)]),
        vec![ScriptValue::Bool(false), ScriptValue::Number(3.0), ScriptValue::Number(4.0)]
    );
    assert_eq!(
        call_static(&mut rt, "Game.Stats", "Bump", &[ScriptValue::Number(41.0)]),
        vec![ScriptValue::Number(42.0)]
    );
}

#[test]
fn test_host_exception_message_is_preserved() {
    let mut rt = runtime();
    let err = try_static(&mut rt, "Game.Stats", "Fail", &[]).unwrap_err();
    assert!(err.message.contains("stats are frozen"), "{}", err.message);
    assert!(!err.traceback.is_empty());
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn test_method_cache_populates_once_per_shape() {
    let mut rt = runtime();
    let cache_len = |rt: &ScriptRuntime| rt.bridge().cache().population();

    call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::Number(1.0)]);
    assert_eq!(cache_len(&rt), 1);
    let hits = rt.bridge().cache().hits();
    call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::Number(2.0)]);
    assert_eq!(cache_len(&rt), 1);
    assert_eq!(rt.bridge().cache().hits(), hits + 1);

    call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::from("s")]);
    assert_eq!(cache_len(&rt), 2);
}

#[test]
fn test_ambiguous_overload_resolves_to_first_declared() {
    for _ in 0..3 {
        let mut rt = runtime();
        for n in [1.0, -4.0] {
            assert_eq!(
                call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::Number(n)]),
                vec![ScriptValue::from("int")]
            );
        }
    }
}

#[test]
fn test_ambiguous_handle_overload_resolves_to_first_declared() {
    for _ in 0..3 {
        let mut rt = runtime();
        let bridge = Rc::clone(rt.bridge());
        let class = bridge.import(rt.vm_mut(), "Game.Sword").unwrap();
        let sword = rt.vm_mut().call_value(&class, &[]).unwrap().remove(0);
        for _ in 0..2 {
            assert_eq!(
                call_static(&mut rt, "Game.Armory", "Store", &[sword.clone()]),
                vec![ScriptValue::from("item")]
            );
        }
    }
}

#[test]
fn test_reload_clears_cache_but_keeps_behavior() {
    let mut rt = runtime();
    call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::from("a")]);
    rt.reload();
    assert_eq!(rt.bridge().cache().population(), 0);
    assert_eq!(
        call_static(&mut rt, "Game.Printer", "Show", &[ScriptValue::from("a")]),
        vec![ScriptValue::from("string")]
    );
}
