//! Translation as seen from outside the crate: disassembly, JSON
//! interchange, validation and option equivalence

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use garnet_runtime::{
    disassemble, translate, validate, Garnet, Iseq, IseqKind, Literal, RunError, StackInsn,
    TranslateError, TranslateOptions,
};
use proptest::prelude::*;

fn add_method() -> Iseq {
    method(
        "add",
        &["a"],
        vec![local(0), int(1), StackInsn::OptPlus, StackInsn::Leave],
    )
}

#[test]
fn test_disassembly_of_local_plus_literal() {
    let routine = translate(&add_method(), &TranslateOptions::default()).unwrap();
    insta::assert_snapshot!(disassemble(&routine).trim_end(), @r###"
    === add (method) ===
    locals: a
    temps: 2
    0000  plusi t0, l0, 1, cd0
    0001  temp_ret t0
    "###);
}

#[test]
fn test_disassembly_shows_current_variant() {
    let iseq = with_method(
        add_method(),
        vec![StackInsn::PutSelf, int(5), fcall("add", 1), StackInsn::Leave],
    );
    let mut garnet = Garnet::capturing();
    let routine = garnet.compile(&iseq).unwrap();
    assert!(disassemble(&routine).contains("0000  plusi t0, l0, 1, cd0"));

    garnet.run_routine(routine.clone()).unwrap();
    assert!(disassemble(&routine).contains("0000  iplusi t0, l0, 1, cd0"));
}

#[test]
fn test_without_immediates_the_literal_gets_a_temp() {
    let options = TranslateOptions {
        immediate_operands: false,
        ..TranslateOptions::default()
    };
    let text = disassemble(&translate(&add_method(), &options).unwrap());
    assert!(text.contains("  plus t0, l0, t1"), "{}", text);
    assert!(!text.contains("plusi"), "{}", text);
}

#[test]
fn test_fused_compare_branch() {
    let text = disassemble(&translate(&counting_loop(10), &TranslateOptions::default()).unwrap());
    assert!(text.contains("btlti"), "{}", text);

    let options = TranslateOptions {
        fuse_compare_branch: false,
        ..TranslateOptions::default()
    };
    let text = disassemble(&translate(&counting_loop(10), &options).unwrap());
    assert!(!text.contains("btlti"), "{}", text);
    assert!(text.contains("lti"), "{}", text);
}

#[test]
fn test_routine_from_json() {
    let text = r#"{
        "name": "<main>",
        "local_table": ["a"],
        "insns": [
            {"op": "put_object", "value": {"int": 41}},
            {"op": "set_local", "idx": 0},
            {"op": "get_local", "idx": 0},
            {"op": "put_object", "value": {"int": 1}},
            {"op": "opt_plus"},
            {"op": "leave"}
        ]
    }"#;
    let iseq = Iseq::from_json(text).unwrap();
    assert_eq!(iseq.kind, IseqKind::Top);
    assert_eq!(Iseq::from_json(&iseq.to_json().unwrap()).unwrap(), iseq);
    assert_eq!(eval(&iseq), "42");

    let routine = translate(&iseq, &TranslateOptions::default()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&routine.to_json().unwrap()).unwrap();
    assert_eq!(json["name"], "<main>");
    assert_eq!(json["temp_count"], routine.temp_count);
}

#[test]
fn test_validation_reports_every_routine() {
    let mut iseq = top(vec![StackInsn::Jump { offset: 10 }, StackInsn::PutNil, StackInsn::Leave]);
    iseq.children.push(method("bad", &[], vec![StackInsn::Pop, StackInsn::PutNil, StackInsn::Leave]));
    let errors = validate(&iseq).unwrap_err();
    let routines: Vec<&str> = errors.iter().map(|e| e.routine.as_str()).collect();
    assert!(routines.contains(&"<main>"), "{:?}", errors);
    assert!(routines.contains(&"bad"), "{:?}", errors);
}

#[test]
fn test_compile_refuses_invalid_input() {
    let iseq = top(vec![StackInsn::PutNil]);
    let garnet = Garnet::capturing();
    assert!(matches!(garnet.compile(&iseq), Err(RunError::Invalid(_))));
}

#[test]
fn test_instruction_limit() {
    let options = TranslateOptions {
        max_insns: 2,
        ..TranslateOptions::default()
    };
    let err = translate(&add_method(), &options).unwrap_err();
    assert!(matches!(err, TranslateError::LimitExceeded { .. }));
}

#[derive(Debug, Clone)]
enum Term {
    Int(i64),
    Local,
}

fn term() -> impl Strategy<Value = Term> {
    prop_oneof![(-50i64..50).prop_map(Term::Int), Just(Term::Local)]
}

fn arith() -> impl Strategy<Value = StackInsn> {
    prop_oneof![
        Just(StackInsn::OptPlus),
        Just(StackInsn::OptMinus),
        Just(StackInsn::OptMult),
        Just(StackInsn::OptLt),
        Just(StackInsn::OptEq),
    ]
}

/// `a = seed; a <op> t1 <op> t2 ...` folded left
fn expression(seed: i64, steps: &[(Term, StackInsn)]) -> Iseq {
    let mut insns = vec![int(seed), set_local(0), local(0)];
    for (term, op) in steps {
        insns.push(match term {
            Term::Int(n) => int(*n),
            Term::Local => local(0),
        });
        insns.push(op.clone());
    }
    insns.push(StackInsn::Leave);
    top(insns).with_locals(&["a"])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_translation_is_deterministic(
        seed in -100i64..100,
        steps in prop::collection::vec((term(), arith()), 0..12),
    ) {
        let iseq = expression(seed, &steps);
        let options = TranslateOptions::default();
        let first = disassemble(&translate(&iseq, &options).unwrap());
        let second = disassemble(&translate(&iseq, &options).unwrap());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_options_do_not_change_results(
        seed in -100i64..100,
        steps in prop::collection::vec((term(), arith()), 0..12),
    ) {
        let iseq = expression(seed, &steps);
        let expected = eval(&iseq);

        let mut plain = settings(true, false);
        plain.translator.immediate_operands = false;
        plain.translator.fuse_compare_branch = false;
        let mut garnet = garnet_with(&plain);
        let result = garnet.run(&iseq);
        prop_assert_eq!(outcome(&garnet, result), expected);
    }
}

/// What one arm of a branchy routine pushes
#[derive(Debug, Clone)]
enum Operand {
    Local(u32),
    Int(i64),
    SelfRef,
}

fn operand() -> impl Strategy<Value = Operand> {
    prop_oneof![
        (1u32..3).prop_map(Operand::Local),
        (-9i64..9).prop_map(Operand::Int),
        Just(Operand::SelfRef),
    ]
}

fn push(operand: &Operand) -> StackInsn {
    match operand {
        Operand::Local(idx) => local(*idx),
        Operand::Int(n) => int(*n),
        Operand::SelfRef => StackInsn::PutSelf,
    }
}

/// Counting loop run after the join: `begin a += step end while a < limit`
#[derive(Debug, Clone)]
struct Rebind {
    step: i64,
    limit: i64,
}

fn rebind() -> impl Strategy<Value = Option<Rebind>> {
    prop::option::of((1i64..4, -6i64..12).prop_map(|(step, limit)| Rebind { step, limit }))
}

/// Locals `c, x, a`:
///
/// ```text
/// x = x0; a = a0
/// v = cond ? <then> : <else>
/// begin a += step end while a < limit   # optional
/// [v, <tail>]
/// ```
fn branchy(
    x0: i64,
    a0: i64,
    cond: bool,
    arms: &[Operand; 3],
    rebind: &Option<Rebind>,
) -> Iseq {
    let mut insns = vec![
        int(x0),
        set_local(1),
        int(a0),
        set_local(2),
        StackInsn::PutObject {
            value: if cond { Literal::True } else { Literal::False },
        },
        StackInsn::BranchUnless { offset: 2 },
        push(&arms[0]),
        StackInsn::Jump { offset: 1 },
        push(&arms[1]),
    ];
    if let Some(Rebind { step, limit }) = rebind {
        let head = insns.len() as i32;
        insns.extend([
            local(2),
            int(*step),
            StackInsn::OptPlus,
            set_local(2),
            local(2),
            int(*limit),
            StackInsn::OptLt,
        ]);
        let back = head - insns.len() as i32 - 1;
        insns.push(StackInsn::BranchIf { offset: back });
    }
    insns.extend([push(&arms[2]), StackInsn::NewArray { count: 2 }, StackInsn::Leave]);
    top(insns).with_locals(&["c", "x", "a"])
}

/// Inspected result of `branchy`, worked out without the translator.
fn branchy_expected(
    x0: i64,
    a0: i64,
    cond: bool,
    arms: &[Operand; 3],
    rebind: &Option<Rebind>,
    main: &str,
) -> String {
    let show = |operand: &Operand, a: i64| match operand {
        Operand::Local(1) => x0.to_string(),
        Operand::Local(_) => a.to_string(),
        Operand::Int(n) => n.to_string(),
        Operand::SelfRef => main.to_string(),
    };
    let joined = show(if cond { &arms[0] } else { &arms[1] }, a0);
    let mut a = a0;
    if let Some(Rebind { step, limit }) = rebind {
        a += step;
        while a < *limit {
            a += step;
        }
    }
    format!("[{}, {}]", joined, show(&arms[2], a))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn prop_branchy_routines_keep_join_values(
        x0 in -20i64..20,
        a0 in -6i64..6,
        cond in any::<bool>(),
        arms in (operand(), operand(), operand()),
        rebind in rebind(),
    ) {
        let arms = [arms.0, arms.1, arms.2];
        let iseq = branchy(x0, a0, cond, &arms, &rebind);
        let main = eval(&top(vec![StackInsn::PutSelf, StackInsn::Leave]));
        let expected = branchy_expected(x0, a0, cond, &arms, &rebind, &main);

        for (imm, fuse) in [(true, true), (true, false), (false, true), (false, false)] {
            let mut tuned = settings(true, false);
            tuned.translator.immediate_operands = imm;
            tuned.translator.fuse_compare_branch = fuse;
            let mut garnet = garnet_with(&tuned);
            let result = garnet.run(&iseq);
            prop_assert_eq!(outcome(&garnet, result), expected.clone(), "imm={} fuse={}", imm, fuse);
        }
    }
}
