//! Classes, instance variables, constants, globals and core collections
//! as seen from register code

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use garnet_runtime::{Iseq, IseqKind, Literal, StackInsn};
use rstest::rstest;

/// class Point
///   attr_accessor :x
///   def initialize(x) = @x = x
///   def double = @x * 2
/// end
fn point_class() -> Iseq {
    let initialize = method(
        "initialize",
        &["x"],
        vec![
            local(0),
            StackInsn::SetIvar { name: "@x".into() },
            StackInsn::PutNil,
            StackInsn::Leave,
        ],
    );
    let double = method(
        "double",
        &[],
        vec![
            StackInsn::GetIvar { name: "@x".into() },
            int(2),
            StackInsn::OptMult,
            StackInsn::Leave,
        ],
    );
    let mut body = Iseq::new(
        "<class:Point>",
        IseqKind::Class,
        vec![
            StackInsn::PutSelf,
            sym("x"),
            fcall("attr_accessor", 1),
            StackInsn::Pop,
            StackInsn::DefineMethod {
                name: "initialize".into(),
                iseq: 0,
            },
            StackInsn::Pop,
            StackInsn::DefineMethod {
                name: "double".into(),
                iseq: 1,
            },
            StackInsn::Leave,
        ],
    );
    body.children = vec![initialize, double];
    body
}

/// Top level defining `Point`, then running `insns`.
fn with_point(insns: Vec<StackInsn>) -> Iseq {
    let mut code = vec![
        StackInsn::PutNil,
        StackInsn::PutNil,
        StackInsn::DefineClass {
            name: "Point".into(),
            iseq: 0,
            module: false,
        },
        StackInsn::Pop,
    ];
    code.extend(insns);
    let mut iseq = top(code);
    iseq.children.push(point_class());
    iseq
}

fn new_point(x: i64) -> Vec<StackInsn> {
    vec![
        StackInsn::PutNil,
        StackInsn::GetConstant { name: "Point".into() },
        int(x),
        send("new", 1),
    ]
}

#[test]
fn test_instance_method_reads_ivar() {
    let mut insns = new_point(21);
    insns.extend([send("double", 0), StackInsn::Leave]);
    assert_eq!(eval(&with_point(insns)), "42");
}

#[test]
fn test_attr_accessor() {
    // p = Point.new(1); p.x = 9; p.x
    let mut insns = new_point(1);
    insns.extend([
        set_local(0),
        local(0),
        int(9),
        send("x=", 1),
        StackInsn::Pop,
        local(0),
        send("x", 0),
        StackInsn::Leave,
    ]);
    let iseq = with_point(insns).with_locals(&["p"]);
    assert_eq!(eval(&iseq), "9");
}

#[test]
fn test_ivar_cache_across_instances() {
    // [Point.new(1).double, Point.new(2).double, Point.new(3).double]
    let mut insns = Vec::new();
    for x in 1..=3 {
        insns.extend(new_point(x));
        insns.push(send("double", 0));
    }
    insns.extend([StackInsn::NewArray { count: 3 }, StackInsn::Leave]);
    assert_eq!(eval(&with_point(insns)), "[2, 4, 6]");
}

#[test]
fn test_reopened_class_keeps_methods() {
    let mut insns = vec![
        StackInsn::PutNil,
        StackInsn::PutNil,
        StackInsn::DefineClass {
            name: "Point".into(),
            iseq: 0,
            module: false,
        },
        StackInsn::Pop,
    ];
    insns.extend(new_point(5));
    insns.extend([send("double", 0), StackInsn::Leave]);
    assert_eq!(eval(&with_point(insns)), "10");
}

#[test]
fn test_undefined_method_on_instance() {
    let mut insns = new_point(1);
    insns.extend([send("triple", 0), StackInsn::Leave]);
    assert_eq!(
        eval(&with_point(insns)),
        "error: undefined method `triple' for an instance of Point (NoMethodError)"
    );
}

#[test]
fn test_constant_through_inline_cache() {
    // LIMIT = 10; LIMIT
    let iseq = top(vec![
        int(10),
        StackInsn::PutNil,
        StackInsn::SetConstant { name: "LIMIT".into() },
        StackInsn::GetInlineCache { offset: 2, ic: 0 },
        StackInsn::GetConstant { name: "LIMIT".into() },
        StackInsn::SetInlineCache { ic: 0 },
        StackInsn::Leave,
    ]);
    let mut garnet = garnet_with(&settings(true, false));
    let routine = garnet.compile(&iseq).unwrap();
    for _ in 0..2 {
        let value = garnet.run_routine(routine.clone()).unwrap();
        assert_eq!(garnet.inspect(&value), "10");
    }
}

#[test]
fn test_missing_constant() {
    let iseq = top(vec![
        StackInsn::PutNil,
        StackInsn::GetConstant { name: "Nope".into() },
        StackInsn::Leave,
    ]);
    assert_eq!(
        eval(&iseq),
        "error: uninitialized constant Nope (NameError)"
    );
}

#[test]
fn test_global_variable() {
    let iseq = top(vec![
        int(5),
        StackInsn::SetGlobal { name: "$g".into() },
        StackInsn::GetGlobal { name: "$g".into() },
        StackInsn::GetGlobal { name: "$unset".into() },
        StackInsn::NewArray { count: 2 },
        StackInsn::Leave,
    ]);
    assert_eq!(eval(&iseq), "[5, nil]");
}

#[test]
fn test_string_interpolation() {
    // "n=#{1 + 2}!"
    let iseq = top(vec![
        string("n="),
        int(1),
        int(2),
        StackInsn::OptPlus,
        StackInsn::ToString,
        string("!"),
        StackInsn::ConcatStrings { count: 3 },
        StackInsn::Leave,
    ]);
    assert_eq!(eval(&iseq), "\"n=3!\"");
}

#[test]
fn test_hash_literal_and_lookup() {
    // h = {a: 1, "b" => 2}; [h, h[:a], h[:zz]]
    let iseq = top(vec![
        sym("a"),
        int(1),
        string("b"),
        int(2),
        StackInsn::NewHash { count: 4 },
        set_local(0),
        local(0),
        local(0),
        sym("a"),
        StackInsn::OptAref,
        local(0),
        sym("zz"),
        StackInsn::OptAref,
        StackInsn::NewArray { count: 3 },
        StackInsn::Leave,
    ])
    .with_locals(&["h"]);
    assert_eq!(eval(&iseq), "[{a: 1, \"b\" => 2}, 1, nil]");
}

#[test]
fn test_array_index_and_store() {
    // a = [1, 2, 3]; a[1] = 20; [a[-1], a[1], a.length]
    let iseq = top(vec![
        StackInsn::DupArray {
            values: vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)],
        },
        set_local(0),
        local(0),
        int(1),
        int(20),
        StackInsn::OptAset,
        StackInsn::Pop,
        local(0),
        int(-1),
        StackInsn::OptAref,
        local(0),
        int(1),
        StackInsn::OptAref,
        local(0),
        StackInsn::OptLength,
        StackInsn::NewArray { count: 3 },
        StackInsn::Leave,
    ])
    .with_locals(&["a"]);
    assert_eq!(eval(&iseq), "[3, 20, 3]");
}

#[test]
fn test_range_to_a() {
    let iseq = top(vec![
        int(1),
        int(4),
        StackInsn::NewRange { exclude_end: true },
        send("to_a", 0),
        StackInsn::Leave,
    ]);
    assert_eq!(eval(&iseq), "[1, 2, 3]");
}

#[test]
fn test_puts_output() {
    let iseq = top(vec![
        StackInsn::PutSelf,
        string("hello"),
        int(7),
        fcall("puts", 2),
        StackInsn::Leave,
    ]);
    let (result, output) = eval_with_output(&iseq);
    assert_eq!(result, "nil");
    assert_eq!(output, "hello\n7\n");
}

#[rstest]
#[case("upcase", "\"GARNET\"")]
#[case("length", "6")]
#[case("reverse", "\"tenrag\"")]
#[case("to_sym", ":garnet")]
fn test_string_methods(#[case] name: &str, #[case] expected: &str) {
    let iseq = top(vec![string("garnet"), send(name, 0), StackInsn::Leave]);
    assert_eq!(eval(&iseq), expected);
}
