//! Register bytecode disassembler
//!
//! Renders a [`Routine`] and its children as text. Used by
//! `garnet translate`, by tests comparing translations and in trace logs.

use super::{CallKind, Insn, Operand, Routine, Slot};
use crate::iseq::Literal;
use std::fmt::Write;

/// Disassemble a routine and, recursively, its children.
///
/// # Format
/// ```text
/// === <main> (top) ===
/// locals: a
/// temps: 1
/// 0000  iplusi t0, l0, 1
/// 0001  temp_ret t0
/// ```
pub fn disassemble(routine: &Routine) -> String {
    let mut output = String::new();
    disassemble_into(routine, &mut output);
    output
}

fn disassemble_into(routine: &Routine, output: &mut String) {
    let _ = writeln!(
        output,
        "=== {} ({}) ===",
        routine.name,
        format!("{:?}", routine.kind).to_lowercase()
    );
    if !routine.local_table.is_empty() {
        let names: Vec<&str> = routine.local_table.iter().map(|s| s.as_str()).collect();
        let _ = writeln!(output, "locals: {}", names.join(", "));
    }
    let _ = writeln!(output, "temps: {}", routine.temp_count);
    if !routine.params.opt_table.is_empty() {
        let entries: Vec<String> = routine
            .params
            .opt_table
            .iter()
            .map(|pc| format!("{:04}", pc))
            .collect();
        let _ = writeln!(output, "opt entries: {}", entries.join(" "));
    }

    for (pc, insn) in routine.code.iter().enumerate() {
        let _ = writeln!(output, "{:04}  {}", pc, format_insn(pc, insn));
    }

    if !routine.catch_table.is_empty() {
        let _ = writeln!(output, "--- catch table ---");
        for entry in &routine.catch_table {
            let _ = write!(
                output,
                "{:?} {:04}..{:04} cont={:04} depth={}",
                entry.kind, entry.start, entry.end, entry.cont, entry.depth
            );
            if let Some(child) = entry.iseq {
                let _ = write!(output, " handler={}", child);
            }
            output.push('\n');
        }
    }

    if !routine.events.is_empty() {
        let _ = writeln!(output, "--- events ---");
        for event in &routine.events {
            let _ = writeln!(
                output,
                "{:04} line {} {}",
                event.pos, event.line, event.events
            );
        }
    }

    for child in &routine.children {
        output.push('\n');
        disassemble_into(child, output);
    }
}

/// Name of the instruction in its current variant.
pub fn insn_name(insn: &Insn) -> String {
    match insn {
        Insn::Nop => "nop".into(),
        Insn::Temp2Temp { .. } => "temp2temp".into(),
        Insn::Loc2Loc { .. } => "loc2loc".into(),
        Insn::Loc2Temp { .. } => "loc2temp".into(),
        Insn::Temp2Loc { .. } => "temp2loc".into(),
        Insn::UpLoc2Temp { .. } => "uploc2temp".into(),
        Insn::Var2UpLoc { src, .. } => match src {
            Slot::Temp(_) => "temp2uploc".into(),
            Slot::Local(_) => "loc2uploc".into(),
        },
        Insn::Val2UpLoc { .. } => "val2uploc".into(),
        Insn::Val2Loc { .. } => "val2loc".into(),
        Insn::Val2Temp { .. } => "val2temp".into(),
        Insn::Str2Var { .. } => "str2var".into(),
        Insn::Self2Var { .. } => "self2var".into(),
        Insn::VarSwap { .. } => "var_swap".into(),
        Insn::TempReverse { .. } => "temp_reverse".into(),
        Insn::Ivar2Var { .. } => "ivar2var".into(),
        Insn::Var2Ivar { src, .. } => match src {
            Operand::Imm(_) => "val2ivar".into(),
            Operand::Slot(Slot::Temp(_)) => "temp2ivar".into(),
            Operand::Slot(Slot::Local(_)) => "loc2ivar".into(),
        },
        Insn::Cvar2Var { .. } => "cvar2var".into(),
        Insn::Var2Cvar { .. } => "var2cvar".into(),
        Insn::Global2Var { .. } => "global2var".into(),
        Insn::Var2Global { .. } => "var2global".into(),
        Insn::ConstLoad { base: None, .. } => "const_ld_val".into(),
        Insn::ConstLoad { .. } => "const2var".into(),
        Insn::ConstCachedLoad { .. } => "const_cached_val_ld".into(),
        Insn::Var2Const { .. } => "var2const".into(),
        Insn::GetInlineCache { .. } => "get_inline_cache".into(),
        Insn::SetInlineCache { .. } => "set_inline_cache".into(),
        Insn::RunOnce { .. } => "run_once".into(),
        Insn::Call { kind, .. } => match kind {
            CallKind::Plain => "call".into(),
            CallKind::SelfRecv => "call_self".into(),
            CallKind::LocRecv(_) => "call_recv".into(),
        },
        Insn::CallSuper { .. } => "call_super".into(),
        Insn::CallBlock { .. } => "call_block".into(),
        Insn::TempRet { .. } => "temp_ret".into(),
        Insn::LocRet { .. } => "loc_ret".into(),
        Insn::ValRet { .. } => "val_ret".into(),
        Insn::RaiseExcept { .. } => "raise_except".into(),
        Insn::Goto { .. } => "goto".into(),
        Insn::Bt { .. } => "bt".into(),
        Insn::Bf { .. } => "bf".into(),
        Insn::Bnil { .. } => "bnil".into(),
        Insn::CaseDispatch { .. } => "case_dispatch".into(),
        Insn::Binary {
            op, rhs, variant, ..
        } => format!("{}{}{}", variant.get().prefix(), op.name(), rhs.imm_suffix()),
        Insn::CmpBranch {
            op,
            branch_if,
            rhs,
            variant,
            ..
        } => format!(
            "{}{}{}{}",
            variant.get().prefix(),
            if *branch_if { "bt" } else { "bf" },
            op.name(),
            rhs.imm_suffix()
        ),
        Insn::Index { key, variant, .. } => {
            format!("{}ind{}", variant.get().prefix(), key.imm_suffix())
        }
        Insn::IndexSet { key, variant, .. } => {
            format!("{}indset{}", variant.get().prefix(), key.imm_suffix())
        }
        Insn::Unary { op, variant, .. } => format!("{}{}", variant.get().prefix(), op.name()),
        Insn::MakeArray { .. } => "make_array".into(),
        Insn::MakeHash { .. } => "make_hash".into(),
        Insn::MakeRange { .. } => "make_range".into(),
        Insn::CloneArray { .. } => "clone_array".into(),
        Insn::SpreadArray { .. } => "spread_array".into(),
        Insn::SplatArray { .. } => "splat_array".into(),
        Insn::ConcatArray { .. } => "concat_array".into(),
        Insn::ConcatStrings { .. } => "concat_strings".into(),
        Insn::ToString { .. } => "to_string".into(),
        Insn::DefineClass { .. } => "define_class".into(),
        Insn::DefineMethod {
            singleton: None, ..
        } => "define_method".into(),
        Insn::DefineMethod { .. } => "define_smethod".into(),
        Insn::Defined { .. } => "defined_p".into(),
        Insn::CheckMatch { .. } => "check_match".into(),
        Insn::TraceCoverage { .. } => "trace_coverage".into(),
    }
}

/// Render one instruction located at `pc`; branch targets are absolute.
pub fn format_insn(pc: usize, insn: &Insn) -> String {
    let target = |offset: i32| format!("@{:04}", pc as i64 + 1 + offset as i64);
    let operands = match insn {
        Insn::Nop => String::new(),
        Insn::Temp2Temp { dst, src } => format!("t{}, t{}", dst, src),
        Insn::Loc2Loc { dst, src } => format!("l{}, l{}", dst, src),
        Insn::Loc2Temp { dst, src } => format!("t{}, l{}", dst, src),
        Insn::Temp2Loc { dst, src } => format!("l{}, t{}", dst, src),
        Insn::UpLoc2Temp { dst, idx, level } => format!("t{}, l{}^{}", dst, idx, level),
        Insn::Var2UpLoc { idx, level, src } => format!("l{}^{}, {}", idx, level, src),
        Insn::Val2UpLoc { idx, level, value } => {
            format!("l{}^{}, {}", idx, level, format_literal(value))
        }
        Insn::Val2Loc { dst, value } => format!("l{}, {}", dst, format_literal(value)),
        Insn::Val2Temp { dst, value } => format!("t{}, {}", dst, format_literal(value)),
        Insn::Str2Var { dst, text } => format!("{}, {:?}", dst, text),
        Insn::Self2Var { dst } => format!("{}", dst),
        Insn::VarSwap { a, b } => format!("t{}, t{}", a, b),
        Insn::TempReverse { start, count } => format!("t{}, {}", start, count),
        Insn::Ivar2Var { dst, name, ic } => format!("t{}, @{}, ic{}", dst, name, ic),
        Insn::Var2Ivar { name, ic, src } => format!("@{}, ic{}, {}", name, ic, src),
        Insn::Cvar2Var { dst, name } => format!("t{}, @@{}", dst, name),
        Insn::Var2Cvar { name, src } => format!("@@{}, {}", name, src),
        Insn::Global2Var { dst, name } => format!("t{}, {}", dst, name),
        Insn::Var2Global { name, src } => format!("{}, {}", name, src),
        Insn::ConstLoad {
            dst,
            base,
            name,
            ic,
        } => match base {
            Some(base) => format!("t{}, {}::{}, ic{}", dst, base, name, ic),
            None => format!("t{}, {}, ic{}", dst, name, ic),
        },
        Insn::ConstCachedLoad { dst, name, ic } => format!("t{}, {}, ic{}", dst, name, ic),
        Insn::Var2Const { name, base, src } => format!("{}::{}, {}", base, name, src),
        Insn::GetInlineCache { dst, offset, ic } => {
            format!("t{}, ic{} -> {}", dst, ic, target(*offset))
        }
        Insn::SetInlineCache { src, ic } => format!("t{}, ic{}", src, ic),
        Insn::RunOnce { dst, iseq, ic } => format!("t{}, child{}, ic{}", dst, iseq, ic),
        Insn::Call { kind, cd, start } => match kind {
            CallKind::LocRecv(recv) => format!("cd{}, t{}, l{}", cd, start, recv),
            _ => format!("cd{}, t{}", cd, start),
        },
        Insn::CallSuper { cd, start } | Insn::CallBlock { cd, start } => {
            format!("cd{}, t{}", cd, start)
        }
        Insn::TempRet { src } => format!("t{}", src),
        Insn::LocRet { src } => format!("l{}", src),
        Insn::ValRet { value } => format_literal(value),
        Insn::RaiseExcept { src, kind } => {
            format!("{}, {}", src, format!("{:?}", kind).to_lowercase())
        }
        Insn::Goto { offset } => target(*offset),
        Insn::Bt { cond, offset } | Insn::Bf { cond, offset } | Insn::Bnil { cond, offset } => {
            format!("{} -> {}", cond, target(*offset))
        }
        Insn::CaseDispatch {
            src,
            table,
            else_offset,
        } => {
            let arms: Vec<String> = table
                .arms
                .iter()
                .map(|arm| format!("{}: {}", format_literal(&arm.key), target(arm.offset)))
                .collect();
            format!(
                "{}, {{{}}}, else {}",
                src,
                arms.join(", "),
                target(*else_offset)
            )
        }
        Insn::Binary {
            dst, lhs, rhs, cd, ..
        } => format!("t{}, {}, {}, cd{}", dst, lhs, rhs, cd),
        Insn::CmpBranch {
            dst,
            lhs,
            rhs,
            offset,
            cd,
            ..
        } => format!("t{}, {}, {}, cd{} -> {}", dst, lhs, rhs, cd, target(*offset)),
        Insn::Index {
            dst, recv, key, cd, ..
        } => format!("t{}, {}, {}, cd{}", dst, recv, key, cd),
        Insn::IndexSet {
            dst,
            recv,
            key,
            value,
            cd,
            ..
        } => format!("t{}, {}, {}, {}, cd{}", dst, recv, key, value, cd),
        Insn::Unary { dst, src, cd, .. } => format!("t{}, {}, cd{}", dst, src, cd),
        Insn::MakeArray { dst, count }
        | Insn::MakeHash { dst, count }
        | Insn::ConcatStrings { dst, count } => format!("t{}, {}", dst, count),
        Insn::MakeRange {
            dst,
            low,
            high,
            exclude_end,
        } => format!(
            "t{}, {}{}{}",
            dst,
            low,
            if *exclude_end { "..." } else { ".." },
            high
        ),
        Insn::CloneArray { dst, values } => format!(
            "t{}, {}",
            dst,
            format_literal(&Literal::Array(values.clone()))
        ),
        Insn::SpreadArray { start, num, splat } => {
            format!("t{}, {}{}", start, num, if *splat { ", splat" } else { "" })
        }
        Insn::SplatArray { dst, src, dup } => {
            format!("t{}, {}{}", dst, src, if *dup { ", dup" } else { "" })
        }
        Insn::ConcatArray { dst, lhs, rhs } => format!("t{}, {}, {}", dst, lhs, rhs),
        Insn::ToString { dst, src, cd } => format!("t{}, {}, cd{}", dst, src, cd),
        Insn::DefineClass {
            dst,
            name,
            iseq,
            cbase,
            superclass,
            ..
        } => format!("t{}, {}, child{}, {}, {}", dst, name, iseq, cbase, superclass),
        Insn::DefineMethod {
            dst,
            name,
            iseq,
            singleton,
        } => match singleton {
            Some(recv) => format!("t{}, {}.{}, child{}", dst, recv, name, iseq),
            None => format!("t{}, {}, child{}", dst, name, iseq),
        },
        Insn::Defined {
            dst, kind, obj, ..
        } => format!("t{}, {}, {}", dst, format!("{:?}", kind).to_lowercase(), obj),
        Insn::CheckMatch {
            dst,
            target: t,
            pattern,
            cd,
            ..
        } => format!("t{}, {}, {}, cd{}", dst, t, pattern, cd),
        Insn::TraceCoverage { line } => format!("line {}", line),
    };
    if operands.is_empty() {
        insn_name(insn)
    } else {
        format!("{} {}", insn_name(insn), operands)
    }
}

/// Render a literal the way the source language would write it.
pub fn format_literal(lit: &Literal) -> String {
    match lit {
        Literal::Nil => "nil".into(),
        Literal::True => "true".into(),
        Literal::False => "false".into(),
        Literal::Int(n) => n.to_string(),
        Literal::BigInt(digits) => digits.clone(),
        Literal::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                f.to_string()
            }
        }
        Literal::Symbol(s) => format!(":{}", s),
        Literal::Str(s) => format!("{:?}", s),
        Literal::Array(items) => {
            let items: Vec<String> = items.iter().map(format_literal).collect();
            format!("[{}]", items.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtl::{BinOp, Variant, VariantCell};
    use pretty_assertions::assert_eq;

    fn plus(rhs: Operand, variant: Variant) -> Insn {
        Insn::Binary {
            op: BinOp::Plus,
            dst: 0,
            lhs: Slot::Local(0),
            rhs,
            cd: 0,
            variant: VariantCell::new(variant),
        }
    }

    #[test]
    fn test_binary_names_follow_variant_and_immediate() {
        assert_eq!(insn_name(&plus(Operand::temp(1), Variant::Generic)), "plus");
        assert_eq!(
            insn_name(&plus(Operand::Imm(Literal::Int(1)), Variant::Fixnum)),
            "iplusi"
        );
        assert_eq!(
            insn_name(&plus(Operand::Imm(Literal::Float(1.5)), Variant::Flonum)),
            "fplusf"
        );
        assert_eq!(
            insn_name(&plus(Operand::temp(1), Variant::Unchanging)),
            "uplus"
        );
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        let insn = Insn::CmpBranch {
            op: BinOp::Lt,
            branch_if: false,
            dst: 1,
            lhs: Slot::Local(0),
            rhs: Operand::Imm(Literal::Int(10)),
            offset: -4,
            cd: 2,
            variant: VariantCell::new(Variant::Fixnum),
        };
        assert_eq!(format_insn(6, &insn), "ibflti t1, l0, 10, cd2 -> @0003");
        assert_eq!(format_insn(2, &Insn::Goto { offset: 3 }), "goto @0006");
    }

    #[test]
    fn test_move_formatting() {
        assert_eq!(
            format_insn(
                0,
                &Insn::Val2Temp {
                    dst: 2,
                    value: Literal::Float(2.0)
                }
            ),
            "val2temp t2, 2.0"
        );
        assert_eq!(
            format_insn(
                0,
                &Insn::UpLoc2Temp {
                    dst: 0,
                    idx: 1,
                    level: 2
                }
            ),
            "uploc2temp t0, l1^2"
        );
        assert_eq!(format_insn(0, &Insn::Nop), "nop");
    }

    #[test]
    fn test_literal_formatting() {
        assert_eq!(
            format_literal(&Literal::Array(vec![
                Literal::Int(1),
                Literal::Symbol("a".into()),
                Literal::Str("s".into())
            ])),
            "[1, :a, \"s\"]"
        );
    }
}
