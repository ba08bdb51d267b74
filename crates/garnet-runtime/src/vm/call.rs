//! Calls: method resolution, argument binding and frame entry
//!
//! Interpreted callees get a frame on the current stack and the loop
//! continues in it. Natives and attribute accessors complete on the spot
//! and their result is delivered like a frame return.

use super::accel::{AccelOutcome, AccelRequest};
use super::frame::{Block, FrameFlags, FrameKind, FrameSpec, MethodInfo, ReturnTo};
use super::profiler::CacheKind;
use super::{Step, Vm, VmError};
use crate::cache::{Lookup, Stamp};
use crate::iseq::CallFlags;
use crate::object::{MethodBody, MethodEntry, NativeCall};
use crate::rtl::{CallData, CallKind, Routine};
use crate::value::{RProc, Symbol, Value};
use std::sync::Arc;
use tracing::info;

/// Result of starting a call
pub(crate) enum Entered {
    /// A frame was pushed; its result arrives through `ReturnTo`
    Pushed,
    /// The call completed synchronously
    Done(Value),
}

impl Vm {
    // ------------------------------------------------------------------
    // Public entry points for natives and embedders
    // ------------------------------------------------------------------

    /// Call `name` on `recv` and run it to completion.
    pub fn call_method(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Arc<Block>>,
    ) -> Result<Value, VmError> {
        let name = Symbol::new(name);
        let class = self.host.class_of(&recv);
        let Some(entry) = self.host.find_method(class, &name) else {
            return Err(self.no_method_error(&name, &recv));
        };
        match self.dispatch_method(recv, entry, args, block, ReturnTo::default(), true)? {
            Entered::Done(value) => Ok(value),
            Entered::Pushed => self.execute(),
        }
    }

    /// Yield to a block and run it to completion.
    pub fn call_block(&mut self, block: &Block, args: Vec<Value>) -> Result<Value, VmError> {
        self.push_block_frame(block, args, false, ReturnTo::default(), true)?;
        self.execute()
    }

    /// Call a proc object with lambda or proc argument rules.
    pub fn call_proc(&mut self, proc: &RProc, args: Vec<Value>) -> Result<Value, VmError> {
        self.push_block_frame(&proc.block, args, proc.lambda, ReturnTo::default(), true)?;
        self.execute()
    }

    // ------------------------------------------------------------------
    // Call instructions
    // ------------------------------------------------------------------

    pub(crate) fn exec_call(
        &mut self,
        routine: &Routine,
        pc: usize,
        kind: CallKind,
        cd: u32,
        start: u32,
    ) -> Result<Step, VmError> {
        let data = call_data(routine, cd)?;
        let recv = match kind {
            CallKind::Plain => self.stack.temp(start),
            CallKind::SelfRecv => self.frame()?.self_value.clone(),
            CallKind::LocRecv(local) => self.stack.local(local),
        };
        let (args, block) = self.collect_args(routine, data, start + 1)?;
        let entry = self.find_cached(data, &recv)?;
        let ret = ReturnTo {
            pc: pc + 1,
            slot: Some(start),
            ..Default::default()
        };
        self.call_to_step(recv, entry, args, block, ret)
    }

    pub(crate) fn exec_call_super(
        &mut self,
        routine: &Routine,
        pc: usize,
        cd: u32,
        start: u32,
    ) -> Result<Step, VmError> {
        let data = call_data(routine, cd)?;
        let frame = self.frame()?;
        let Some(method) = frame.method.clone() else {
            return Err(self.raise("RuntimeError", "super called outside of method"));
        };
        let recv = frame.self_value.clone();
        let inherited = frame.block.clone();

        let (args, mut block) = self.collect_args(routine, data, start + 1)?;
        if block.is_none() && data.block.is_none() && !data.flags.has(CallFlags::ARGS_BLOCKARG) {
            block = inherited;
        }
        let class = self.host.class_of(&recv);
        let Some(entry) = self.host.find_super_method(class, method.owner, &method.name) else {
            return Err(self.raise(
                "NoMethodError",
                format!("super: no superclass method `{}'", method.name),
            ));
        };
        let ret = ReturnTo {
            pc: pc + 1,
            slot: Some(start),
            ..Default::default()
        };
        self.call_to_step(recv, entry, args, block, ret)
    }

    pub(crate) fn exec_call_block(
        &mut self,
        routine: &Routine,
        pc: usize,
        cd: u32,
        start: u32,
    ) -> Result<Step, VmError> {
        let data = call_data(routine, cd)?;
        let Some(block) = self.frame()?.block.clone() else {
            return Err(self.raise("LocalJumpError", "no block given (yield)"));
        };
        let (args, _) = self.collect_args(routine, data, start)?;
        let ret = ReturnTo {
            pc: pc + 1,
            slot: Some(start),
            ..Default::default()
        };
        self.push_block_frame(&block, args, false, ret, false)?;
        Ok(Step::Reload)
    }

    /// Dispatch an operator that missed its fast path.
    pub(crate) fn call_operator(
        &mut self,
        routine: &Routine,
        cd: u32,
        recv: Value,
        args: Vec<Value>,
        ret: ReturnTo,
    ) -> Result<Step, VmError> {
        let data = call_data(routine, cd)?;
        let entry = self.find_cached(data, &recv)?;
        self.call_to_step(recv, entry, args, None, ret)
    }

    fn call_to_step(
        &mut self,
        recv: Value,
        entry: MethodEntry,
        args: Vec<Value>,
        block: Option<Arc<Block>>,
        ret: ReturnTo,
    ) -> Result<Step, VmError> {
        match self.dispatch_method(recv, entry, args, block, ret, false)? {
            Entered::Pushed => Ok(Step::Reload),
            Entered::Done(value) => Ok(Step::Goto(self.deliver(ret, value)?)),
        }
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Method lookup through the call site's cache.
    fn find_cached(&mut self, data: &CallData, recv: &Value) -> Result<MethodEntry, VmError> {
        let class = self.host.class_of(recv);
        let stamp = Stamp::new(self.globals.method_generation(), class.0 as u64);
        let lookup = data.cache.lookup(stamp);
        if let Some(profiler) = &mut self.profiler {
            profiler.record_cache(CacheKind::Call, &lookup);
        }
        if let Lookup::Hit(entry) = lookup {
            return Ok(entry);
        }
        match self.host.find_method(class, &data.name) {
            Some(entry) => {
                data.cache.fill(stamp, entry.clone());
                Ok(entry)
            }
            None => Err(self.no_method_error(&data.name, recv)),
        }
    }

    pub(crate) fn no_method_error(&self, name: &Symbol, recv: &Value) -> VmError {
        let target = match recv {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Class(class) => format!("class {}", self.host.class_name(*class)),
            _ => format!(
                "an instance of {}",
                self.host.class_name(self.host.class_of(recv))
            ),
        };
        self.raise(
            "NoMethodError",
            format!("undefined method `{}' for {}", name, target),
        )
    }

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------

    /// Arguments of a call site from temporaries `first ..`, with splat
    /// and block-argument handling.
    fn collect_args(
        &mut self,
        routine: &Routine,
        data: &CallData,
        first: u32,
    ) -> Result<(Vec<Value>, Option<Arc<Block>>), VmError> {
        let mut args = self.stack.temps(first, data.argc).to_vec();
        let mut block = None;

        if data.flags.has(CallFlags::ARGS_BLOCKARG) {
            match args.pop() {
                Some(Value::Proc(proc)) => block = Some(Arc::new(proc.block.clone())),
                Some(Value::Nil) | None => {}
                Some(other) => {
                    return Err(self.type_error(format!(
                        "wrong argument type {} (expected Proc)",
                        other.type_name()
                    )))
                }
            }
        }
        if data.flags.has(CallFlags::ARGS_SPLAT) {
            match args.pop() {
                Some(Value::Array(items)) => args.extend(items.lock().iter().cloned()),
                Some(Value::Nil) | None => {}
                Some(other) => args.push(other),
            }
        }
        if let Some(idx) = data.block {
            block = Some(Arc::new(self.make_block(routine, idx)?));
        }
        Ok((args, block))
    }

    /// Bind the block literal `children[idx]` to the current frame.
    pub(crate) fn make_block(&mut self, routine: &Routine, idx: usize) -> Result<Block, VmError> {
        let Some(child) = routine.children.get(idx).cloned() else {
            return Err(VmError::InvariantViolation(format!(
                "{} has no child routine {}",
                routine.name, idx
            )));
        };
        let Some(outer) = self.stack.capture_env() else {
            return Err(VmError::InvariantViolation("block outside of a frame".into()));
        };
        let frame = self.frame()?;
        Ok(Block {
            routine: child,
            self_value: frame.self_value.clone(),
            outer,
            cref: frame.cref,
            home: frame.id,
            method_home: frame.method_home,
            method: frame.method.clone(),
            yield_block: frame.block.clone(),
        })
    }

    /// Lay out `args` as the callee's locals; returns them with the pc to
    /// start at.
    fn bind_args(
        &self,
        routine: &Routine,
        mut args: Vec<Value>,
        block: Option<&Arc<Block>>,
        strict: bool,
    ) -> Result<(Vec<Value>, usize), VmError> {
        let params = &routine.params;
        let lead = params.lead as usize;
        let opt = params.opt_count() as usize;

        if strict {
            let too_many = params.rest.is_none() && args.len() > lead + opt;
            if args.len() < lead || too_many {
                return Err(self.raise(
                    "ArgumentError",
                    arity_message(args.len(), lead, opt, params.rest.is_some()),
                ));
            }
        } else {
            // Blocks auto-splat a lone array and tolerate any count
            if args.len() == 1 && lead + opt + params.rest.map_or(0, |_| 1) > 1 {
                if let Value::Array(items) = &args[0] {
                    let items = items.lock().clone();
                    args = items;
                }
            }
            if args.len() < lead {
                args.resize(lead, Value::Nil);
            }
            if params.rest.is_none() && args.len() > lead + opt {
                args.truncate(lead + opt);
            }
        }

        let mut locals = vec![Value::Nil; routine.local_size() as usize];
        let fixed = args.len().min(lead + opt);
        if locals.len() < fixed {
            return Err(VmError::InvariantViolation(format!(
                "{} has {} locals for {} parameters",
                routine.name,
                locals.len(),
                fixed
            )));
        }
        let mut rest = args.split_off(fixed);
        for (local, arg) in locals.iter_mut().zip(args) {
            *local = arg;
        }
        if let Some(r) = params.rest {
            if let Some(local) = locals.get_mut(r as usize) {
                *local = Value::array(std::mem::take(&mut rest));
            }
        }
        if let Some(b) = params.block {
            if let Some(local) = locals.get_mut(b as usize) {
                *local = match block {
                    Some(block) => Value::Proc(Arc::new(RProc {
                        block: (**block).clone(),
                        lambda: false,
                    })),
                    None => Value::Nil,
                };
            }
        }

        let start_pc = if opt > 0 {
            let given = fixed - lead;
            params.opt_table.get(given).copied().unwrap_or(0)
        } else {
            0
        };
        Ok((locals, start_pc))
    }

    // ------------------------------------------------------------------
    // Entering callees
    // ------------------------------------------------------------------

    pub(crate) fn dispatch_method(
        &mut self,
        recv: Value,
        entry: MethodEntry,
        args: Vec<Value>,
        block: Option<Arc<Block>>,
        ret: ReturnTo,
        finish: bool,
    ) -> Result<Entered, VmError> {
        match entry.body {
            MethodBody::Routine(routine) => {
                let info = MethodInfo {
                    owner: entry.owner,
                    name: entry.name,
                };
                self.enter_method(routine, recv, info, args, block, ret, finish)
            }
            MethodBody::Native(native) => {
                let call = NativeCall {
                    name: &entry.name,
                    recv: &recv,
                    args: &args,
                    block: block.as_deref(),
                };
                native(self, call).map(Entered::Done)
            }
            MethodBody::AttrReader(name) => Ok(Entered::Done(self.ivar_get(&recv, &name, None))),
            MethodBody::AttrWriter(name) => {
                let Some(value) = args.into_iter().next() else {
                    return Err(self.raise(
                        "ArgumentError",
                        arity_message(0, 1, 0, false),
                    ));
                };
                self.ivar_set(&recv, name, value.clone(), None)?;
                Ok(Entered::Done(value))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_method(
        &mut self,
        routine: Arc<Routine>,
        recv: Value,
        method: MethodInfo,
        args: Vec<Value>,
        block: Option<Arc<Block>>,
        ret: ReturnTo,
        finish: bool,
    ) -> Result<Entered, VmError> {
        let (locals, start_pc) = self.bind_args(&routine, args, block.as_ref(), true)?;

        // Calls out of a frame interpreted after cancellation stay interpreted
        let caller_cancelled = self
            .stack
            .current()
            .map_or(false, |frame| frame.flags.has(FrameFlags::CANCEL));
        let mut cancelled = caller_cancelled || routine.accel.is_cancelled();
        if let Some(accel) = self.accel.clone() {
            if !cancelled {
                let entries = routine.accel.record_entry();
                let request = AccelRequest {
                    routine: &routine,
                    self_value: &recv,
                    args: &locals[..routine.params.lead as usize],
                    entries,
                };
                match accel.enter(&request) {
                    AccelOutcome::Handled(value) => return Ok(Entered::Done(value)),
                    AccelOutcome::Failed(err) => return Err(err),
                    AccelOutcome::NotHandled => {}
                    AccelOutcome::Cancel => {
                        routine.accel.cancel();
                        info!(routine = %routine.name, "accelerator cancelled; interpreting");
                        cancelled = true;
                    }
                }
            }
        }

        let mut spec = FrameSpec::new(routine, FrameKind::Method, recv, method.owner);
        spec.block = block;
        spec.method = Some(method);
        spec.ret = ret;
        spec.pc = start_pc;
        self.push_frame(spec, &locals, finish)?;
        if cancelled {
            self.frame_mut()?.flags.set(FrameFlags::CANCEL);
        }
        Ok(Entered::Pushed)
    }

    pub(crate) fn push_block_frame(
        &mut self,
        block: &Block,
        args: Vec<Value>,
        lambda: bool,
        ret: ReturnTo,
        finish: bool,
    ) -> Result<u64, VmError> {
        let (locals, start_pc) = self.bind_args(&block.routine, args, None, lambda)?;
        let mut spec = FrameSpec::new(
            block.routine.clone(),
            FrameKind::Block,
            block.self_value.clone(),
            block.cref,
        );
        spec.outer = Some(block.outer.clone());
        spec.block = block.yield_block.clone();
        spec.method = block.method.clone();
        spec.method_home = block.method_home;
        spec.break_home = Some(block.home);
        spec.lambda = lambda;
        spec.ret = ret;
        spec.pc = start_pc;
        self.push_frame(spec, &locals, finish)
    }
}

fn call_data(routine: &Routine, cd: u32) -> Result<&CallData, VmError> {
    routine.call_data.get(cd as usize).ok_or_else(|| {
        VmError::InvariantViolation(format!("{} has no call data {}", routine.name, cd))
    })
}

/// "wrong number of arguments" text for a parameter shape.
pub(crate) fn arity_message(given: usize, lead: usize, opt: usize, rest: bool) -> String {
    let expected = if rest {
        format!("{}+", lead)
    } else if opt > 0 {
        format!("{}..{}", lead, lead + opt)
    } else {
        lead.to_string()
    };
    format!("wrong number of arguments (given {}, expected {})", given, expected)
}
