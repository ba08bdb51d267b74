//! Branches, blocks, non-local exits and exception regions

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use garnet_runtime::iseq::{CallFlags, CaseArm, CatchKind, ThrowKind};
use garnet_runtime::{IseqKind, Literal, StackInsn};

/// `[1, 2, 3]`
fn one_two_three() -> StackInsn {
    StackInsn::DupArray {
        values: vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)],
    }
}

#[test]
fn test_conditional_join() {
    // x = 5; y = x < 3 ? :small : :big; y
    let iseq = top(vec![
        int(5),
        set_local(0),
        local(0),
        int(3),
        StackInsn::OptLt,
        StackInsn::BranchUnless { offset: 2 },
        sym("small"),
        StackInsn::Jump { offset: 1 },
        sym("big"),
        StackInsn::Leave,
    ])
    .with_locals(&["x"]);
    assert_eq!(eval(&iseq), ":big");
}

#[test]
fn test_branch_nil() {
    // branchnil skips the non-nil arm
    let iseq = top(vec![
        StackInsn::PutNil,
        StackInsn::BranchNil { offset: 2 },
        string("not nil"),
        StackInsn::Leave,
        string("nil"),
        StackInsn::Leave,
    ]);
    assert_eq!(eval(&iseq), "\"nil\"");
}

#[test]
fn test_case_dispatch() {
    // case 2 when 1 then :one when 2 then :two else :other end
    let iseq = top(vec![
        int(2),
        StackInsn::OptCaseDispatch {
            table: vec![
                CaseArm {
                    key: Literal::Int(1),
                    offset: 2,
                },
                CaseArm {
                    key: Literal::Int(2),
                    offset: 4,
                },
            ],
            else_offset: 0,
        },
        sym("other"),
        StackInsn::Leave,
        sym("one"),
        StackInsn::Leave,
        sym("two"),
        StackInsn::Leave,
    ]);
    assert_eq!(eval(&iseq), ":two");
}

#[test]
fn test_block_sees_outer_local() {
    // sum = 0; [1, 2, 3].each { |x| sum += x }; sum
    let body = block(
        &["x"],
        vec![
            StackInsn::GetLocal { idx: 0, level: 1 },
            local(0),
            StackInsn::OptPlus,
            StackInsn::Dup,
            StackInsn::SetLocal { idx: 0, level: 1 },
            StackInsn::Leave,
        ],
    );
    let mut iseq = top(vec![
        int(0),
        set_local(0),
        one_two_three(),
        send_with_block("each", 0, 0),
        StackInsn::Pop,
        local(0),
        StackInsn::Leave,
    ])
    .with_locals(&["sum"]);
    iseq.children.push(body);
    assert_eq!(eval(&iseq), "6");
}

#[test]
fn test_break_out_of_each() {
    // [1, 2, 3].each { |x| break x * 10 if x == 2 }
    let body = block(
        &["x"],
        vec![
            local(0),
            int(2),
            StackInsn::OptEq,
            StackInsn::BranchUnless { offset: 5 },
            local(0),
            int(10),
            StackInsn::OptMult,
            throw(ThrowKind::Break),
            StackInsn::Pop,
            StackInsn::PutNil,
            StackInsn::Leave,
        ],
    );
    let mut iseq = top(vec![
        one_two_three(),
        send_with_block("each", 0, 0),
        StackInsn::Leave,
    ]);
    iseq.children.push(body);
    assert_eq!(eval(&iseq), "20");
}

#[test]
fn test_next_in_map() {
    // [1, 2, 3].map { |x| next 0 if x == 2; x }
    let body = block(
        &["x"],
        vec![
            local(0),
            int(2),
            StackInsn::OptEq,
            StackInsn::BranchUnless { offset: 3 },
            int(0),
            throw(ThrowKind::Next),
            StackInsn::Pop,
            local(0),
            StackInsn::Leave,
        ],
    );
    let mut iseq = top(vec![
        one_two_three(),
        send_with_block("map", 0, 0),
        StackInsn::Leave,
    ]);
    iseq.children.push(body);
    assert_eq!(eval(&iseq), "[1, 0, 3]");
}

#[test]
fn test_yield_to_method_block() {
    // def twice; [yield(1), yield(2)]; end; twice { |x| x * 3 }
    let twice = method(
        "twice",
        &[],
        vec![
            int(1),
            StackInsn::InvokeBlock { argc: 1 },
            int(2),
            StackInsn::InvokeBlock { argc: 1 },
            StackInsn::NewArray { count: 2 },
            StackInsn::Leave,
        ],
    );
    let body = block(&["x"], vec![local(0), int(3), StackInsn::OptMult, StackInsn::Leave]);
    let mut iseq = with_method(
        twice,
        vec![
            StackInsn::PutSelf,
            StackInsn::Send {
                name: "twice".into(),
                argc: 0,
                flags: CallFlags(CallFlags::FCALL),
                block: Some(1),
            },
            StackInsn::Leave,
        ],
    );
    iseq.children.push(body);
    assert_eq!(eval(&iseq), "[3, 6]");
}

#[test]
fn test_wrong_arity() {
    let add1 = method("add1", &["a"], vec![local(0), int(1), StackInsn::OptPlus, StackInsn::Leave]);
    let iseq = with_method(add1, vec![StackInsn::PutSelf, fcall("add1", 0), StackInsn::Leave]);
    assert_eq!(
        eval(&iseq),
        "error: wrong number of arguments (given 0, expected 1) (ArgumentError)"
    );
}

#[test]
fn test_rescue_returns_handler_value() {
    // begin; raise "boom"; rescue; 42; end
    let mut iseq = top(vec![
        StackInsn::PutSelf,
        string("boom"),
        fcall("raise", 1),
        StackInsn::Leave,
    ]);
    iseq.catch_table.push(catch(CatchKind::Rescue, 0, 3, 3, 0, Some(0)));
    iseq.children.push(handler(IseqKind::Rescue, vec![int(42), StackInsn::Leave]));
    assert_eq!(eval(&iseq), "42");
}

#[test]
fn test_rescue_sees_the_exception() {
    // begin; raise "boom"; rescue => e; e.message; end
    let mut iseq = top(vec![
        StackInsn::PutSelf,
        string("boom"),
        fcall("raise", 1),
        StackInsn::Leave,
    ]);
    iseq.catch_table.push(catch(CatchKind::Rescue, 0, 3, 3, 0, Some(0)));
    iseq.children.push(handler(
        IseqKind::Rescue,
        vec![local(0), send("message", 0), StackInsn::Leave],
    ));
    assert_eq!(eval(&iseq), "\"boom\"");
}

#[test]
fn test_rescue_with_live_stack_value() {
    // [1, begin; raise "x"; rescue; 2; end]
    let mut iseq = top(vec![
        int(1),
        StackInsn::PutSelf,
        string("x"),
        fcall("raise", 1),
        StackInsn::NewArray { count: 2 },
        StackInsn::Leave,
    ]);
    iseq.catch_table.push(catch(CatchKind::Rescue, 1, 4, 4, 1, Some(0)));
    iseq.children.push(handler(IseqKind::Rescue, vec![int(2), StackInsn::Leave]));
    assert_eq!(eval(&iseq), "[1, 2]");
}

#[test]
fn test_exception_from_callee_is_rescued_in_caller() {
    // def boom = 1 / 0; begin; boom; rescue => e; e.message; end
    let boom = method("boom", &[], vec![int(1), int(0), StackInsn::OptDiv, StackInsn::Leave]);
    let mut iseq = with_method(boom, vec![StackInsn::PutSelf, fcall("boom", 0), StackInsn::Leave]);
    iseq.catch_table.push(catch(CatchKind::Rescue, 2, 4, 4, 0, Some(1)));
    iseq.children.push(handler(
        IseqKind::Rescue,
        vec![local(0), send("message", 0), StackInsn::Leave],
    ));
    assert_eq!(eval(&iseq), "\"divided by 0\"");
}

#[test]
fn test_ensure_runs_then_reraises() {
    // begin; raise "oops"; ensure; puts "cleanup"; end
    let mut iseq = top(vec![
        StackInsn::PutSelf,
        string("oops"),
        fcall("raise", 1),
        StackInsn::Leave,
    ]);
    iseq.catch_table.push(catch(CatchKind::Ensure, 0, 3, 3, 0, Some(0)));
    iseq.children.push(handler(
        IseqKind::Ensure,
        vec![
            StackInsn::PutSelf,
            string("cleanup"),
            fcall("puts", 1),
            StackInsn::Leave,
        ],
    ));
    let (result, output) = eval_with_output(&iseq);
    assert_eq!(output, "cleanup\n");
    assert_eq!(result, "error: oops (RuntimeError)");
}

#[test]
fn test_uncaught_throw() {
    let iseq = top(vec![int(1), throw(ThrowKind::Throw), StackInsn::Leave]);
    assert!(eval(&iseq).starts_with("error: uncaught Throw"));
}

#[test]
fn test_deep_recursion_is_stack_error() {
    // def down = down
    let down = method("down", &[], vec![StackInsn::PutSelf, fcall("down", 0), StackInsn::Leave]);
    let iseq = with_method(down, vec![StackInsn::PutSelf, fcall("down", 0), StackInsn::Leave]);
    let mut settings = settings(true, false);
    settings.vm.max_frames = 64;
    let mut garnet = garnet_with(&settings);
    let result = garnet.run(&iseq);
    assert_eq!(
        outcome(&garnet, result),
        "error: stack level too deep (SystemStackError)"
    );
    assert_eq!(garnet.vm().depth(), 0);
}
