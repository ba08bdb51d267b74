//! Shared builders for routine-level tests
//!
//! Stack routines are written by hand here, so the helpers keep the
//! instruction lists short and readable.

#![allow(dead_code)]

use garnet_config::Settings;
use garnet_runtime::iseq::{CallFlags, CatchEntry, CatchKind, Params, ThrowKind};
use garnet_runtime::{Garnet, Iseq, IseqKind, Literal, ReferenceHost, RunResult, StackInsn, Value};

pub use pretty_assertions::{assert_eq, assert_ne};

pub fn int(n: i64) -> StackInsn {
    StackInsn::PutObject {
        value: Literal::Int(n),
    }
}

pub fn float(f: f64) -> StackInsn {
    StackInsn::PutObject {
        value: Literal::Float(f),
    }
}

pub fn sym(name: &str) -> StackInsn {
    StackInsn::PutObject {
        value: Literal::Symbol(name.to_string()),
    }
}

pub fn string(text: &str) -> StackInsn {
    StackInsn::PutString {
        value: text.to_string(),
    }
}

pub fn local(idx: u32) -> StackInsn {
    StackInsn::GetLocal { idx, level: 0 }
}

pub fn set_local(idx: u32) -> StackInsn {
    StackInsn::SetLocal { idx, level: 0 }
}

pub fn send(name: &str, argc: u32) -> StackInsn {
    StackInsn::Send {
        name: name.to_string(),
        argc,
        flags: CallFlags::default(),
        block: None,
    }
}

/// Call on implicit self, e.g. `puts x`
pub fn fcall(name: &str, argc: u32) -> StackInsn {
    StackInsn::Send {
        name: name.to_string(),
        argc,
        flags: CallFlags(CallFlags::FCALL),
        block: None,
    }
}

pub fn send_with_block(name: &str, argc: u32, block: usize) -> StackInsn {
    StackInsn::Send {
        name: name.to_string(),
        argc,
        flags: CallFlags::default(),
        block: Some(block),
    }
}

pub fn throw(kind: ThrowKind) -> StackInsn {
    StackInsn::Throw { kind }
}

pub fn method(name: &str, params: &[&str], insns: Vec<StackInsn>) -> Iseq {
    let mut iseq = Iseq::new(name, IseqKind::Method, insns).with_locals(params);
    iseq.params = Params {
        lead: params.len() as u32,
        ..Params::default()
    };
    iseq
}

pub fn block(params: &[&str], insns: Vec<StackInsn>) -> Iseq {
    let mut iseq = Iseq::new("block", IseqKind::Block, insns).with_locals(params);
    iseq.params = Params {
        lead: params.len() as u32,
        ..Params::default()
    };
    iseq
}

/// Rescue or ensure body; local 0 holds the exception.
pub fn handler(kind: IseqKind, insns: Vec<StackInsn>) -> Iseq {
    Iseq::new("handler", kind, insns).with_locals(&["$!"])
}

pub fn catch(kind: CatchKind, start: usize, end: usize, cont: usize, depth: i32, iseq: Option<usize>) -> CatchEntry {
    CatchEntry {
        kind,
        start,
        end,
        cont,
        depth,
        iseq,
    }
}

/// `def <name>; ...; end` followed by `insns` at the top level.
pub fn with_method(def: Iseq, insns: Vec<StackInsn>) -> Iseq {
    let mut code = vec![
        StackInsn::DefineMethod {
            name: def.name.clone(),
            iseq: 0,
        },
        StackInsn::Pop,
    ];
    code.extend(insns);
    let mut top = Iseq::new("<main>", IseqKind::Top, code);
    top.children.push(def);
    top
}

/// `i = 0; while i < n; i += 1; end; i`
pub fn counting_loop(n: i64) -> Iseq {
    Iseq::new(
        "<main>",
        IseqKind::Top,
        vec![
            int(0),
            set_local(0),
            StackInsn::Jump { offset: 4 },
            local(0),
            int(1),
            StackInsn::OptPlus,
            set_local(0),
            local(0),
            int(n),
            StackInsn::OptLt,
            StackInsn::BranchIf { offset: -8 },
            local(0),
            StackInsn::Leave,
        ],
    )
    .with_locals(&["i"])
}

pub fn settings(specialize: bool, profile: bool) -> Settings {
    let mut settings = Settings::default();
    settings.vm.specialize = specialize;
    settings.vm.profile = profile;
    settings
}

pub fn garnet_with(settings: &Settings) -> Garnet {
    Garnet::with_host(ReferenceHost::capturing(), settings)
}

/// Inspected result, or the description of the failure.
pub fn outcome(garnet: &Garnet, result: RunResult<Value>) -> String {
    match result {
        Ok(value) => garnet.inspect(&value),
        Err(err) => format!("error: {}", garnet.describe(&err)),
    }
}

/// Run `iseq` on a fresh capturing runtime.
pub fn eval(iseq: &Iseq) -> String {
    let mut garnet = Garnet::capturing();
    let result = garnet.run(iseq);
    outcome(&garnet, result)
}

/// Run `iseq` and also return what it printed.
pub fn eval_with_output(iseq: &Iseq) -> (String, String) {
    let mut garnet = Garnet::capturing();
    let result = garnet.run(iseq);
    (outcome(&garnet, result), garnet.take_output())
}

pub fn top(insns: Vec<StackInsn>) -> Iseq {
    Iseq::new("<main>", IseqKind::Top, insns)
}
