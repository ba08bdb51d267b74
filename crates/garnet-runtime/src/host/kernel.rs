//! Object, Kernel, Module/Class, Proc and Exception methods

use super::{arg, check_arity, inspect_value, need_block, to_s, values_eq, ReferenceHost};
use crate::object::{MethodBody, ObjectModel};
use crate::value::{ClassId, RHash, RObject, RProc, Symbol, Value};
use crate::vm::{Vm, VmError};
use std::sync::{Arc, Weak};

pub(super) fn install(host: &Arc<ReferenceHost>) {
    install_object(host);
    install_module(host);
    install_singletons(host);
    install_proc(host);
    install_exception(host);
}

fn upgrade(host: &Weak<ReferenceHost>) -> Result<Arc<ReferenceHost>, VmError> {
    host.upgrade()
        .ok_or_else(|| VmError::InvariantViolation("reference host dropped".into()))
}

fn class_arg(vm: &Vm, value: &Value) -> Result<ClassId, VmError> {
    match value {
        Value::Class(class) => Ok(*class),
        _ => Err(vm.type_error("class or module required")),
    }
}

fn symbol_arg(vm: &Vm, value: &Value) -> Result<Symbol, VmError> {
    match value {
        Value::Symbol(sym) => Ok(sym.clone()),
        Value::Str(s) => Ok(Symbol::new(&s.lock())),
        other => Err(vm.type_error(format!("{} is not a symbol nor a string", vm.host().inspect(other)))),
    }
}

/// Whether the frame that called the native received a block.
fn caller_has_block(vm: &Vm) -> bool {
    vm.frame().map_or(false, |frame| frame.block.is_some())
}

fn install_object(host: &Arc<ReferenceHost>) {
    let object = host.core().object;
    let output = host.output();

    let out = output.clone();
    host.define_native(object, "puts", move |vm, call| {
        let mut text = String::new();
        if call.args.is_empty() {
            text.push('\n');
        }
        for value in call.args {
            puts_lines(vm, value, &mut text)?;
        }
        out.write(&text);
        Ok(Value::Nil)
    });
    let out = output.clone();
    host.define_native(object, "print", move |vm, call| {
        let mut text = String::new();
        for value in call.args {
            text.push_str(&to_s(vm, value)?);
        }
        out.write(&text);
        Ok(Value::Nil)
    });
    let out = output;
    host.define_native(object, "p", move |vm, call| {
        let mut text = String::new();
        for value in call.args {
            text.push_str(&inspect_value(vm, value)?);
            text.push('\n');
        }
        out.write(&text);
        Ok(match call.args {
            [] => Value::Nil,
            [one] => one.clone(),
            many => Value::array(many.to_vec()),
        })
    });

    host.define_native(object, "raise", |vm, call| {
        check_arity(vm, &call, 0, 2)?;
        Err(make_raise(vm, call.args)?)
    });
    host.define_native(object, "proc", |vm, call| {
        let Some(block) = call.block else {
            return Err(vm.raise("ArgumentError", "tried to create Proc object without a block"));
        };
        Ok(Value::Proc(Arc::new(RProc {
            block: block.clone(),
            lambda: false,
        })))
    });
    host.define_native(object, "lambda", |vm, call| {
        let Some(block) = call.block else {
            return Err(vm.raise("ArgumentError", "tried to create Proc object without a block"));
        };
        Ok(Value::Proc(Arc::new(RProc {
            block: block.clone(),
            lambda: true,
        })))
    });
    host.define_native(object, "block_given?", |vm, _| Ok(Value::bool(caller_has_block(vm))));
    host.define_native(object, "loop", |vm, call| {
        let block = need_block(vm, &call)?;
        loop {
            match vm.call_block(block, Vec::new()) {
                Ok(_) => {}
                Err(VmError::Raised(exc)) if is_stop_iteration(vm, &exc) => return Ok(Value::Nil),
                Err(err) => return Err(err),
            }
        }
    });

    host.define_native(object, "class", |vm, call| {
        Ok(Value::Class(match call.recv {
            Value::Object(obj) => obj.class,
            Value::Class(_) => class_of_class(vm, call.recv),
            other => vm.host().class_of(other),
        }))
    });
    for name in ["is_a?", "kind_of?"] {
        host.define_native(object, name, |vm, call| {
            check_arity(vm, &call, 1, 1)?;
            let class = class_arg(vm, &call.args[0])?;
            Ok(Value::bool(vm.host().is_kind_of(call.recv, class)))
        });
    }
    host.define_native(object, "instance_of?", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let class = class_arg(vm, &call.args[0])?;
        let own = match call.recv {
            Value::Object(obj) => obj.class,
            other => vm.host().class_of(other),
        };
        Ok(Value::bool(own == class))
    });
    host.define_native(object, "nil?", |_, call| Ok(Value::bool(call.recv.is_nil())));
    host.define_native(object, "==", |_, call| Ok(Value::bool(call.recv.same(&arg(&call, 0)))));
    host.define_native(object, "equal?", |_, call| Ok(Value::bool(call.recv.same(&arg(&call, 0)))));
    host.define_native(object, "eql?", |_, call| Ok(Value::bool(call.recv.same(&arg(&call, 0)))));
    host.define_native(object, "!=", |vm, call| {
        let eq = vm.call_method(call.recv.clone(), "==", vec![arg(&call, 0)], None)?;
        Ok(Value::bool(!eq.truthy()))
    });
    host.define_native(object, "!", |_, call| Ok(Value::bool(!call.recv.truthy())));
    host.define_native(object, "===", |vm, call| {
        Ok(Value::bool(values_eq(vm, call.recv, &arg(&call, 0))?))
    });
    host.define_native(object, "to_s", |vm, call| {
        let class = vm.host().class_of(call.recv);
        Ok(Value::str(format!("#<{}>", vm.host().class_name(class))))
    });
    host.define_native(object, "inspect", |vm, call| Ok(Value::str(vm.host().inspect(call.recv))));
    host.define_native(object, "initialize", |_, _| Ok(Value::Nil));
    host.define_native(object, "freeze", |_, call| Ok(call.recv.clone()));
    host.define_native(object, "dup", |_, call| Ok(shallow_copy(call.recv)));
    host.define_native(object, "itself", |_, call| Ok(call.recv.clone()));
    host.define_native(object, "hash", |_, call| {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        call.recv.hash_key(false).hash(&mut hasher);
        Ok(Value::int((hasher.finish() >> 2) as i64))
    });
    host.define_native(object, "respond_to?", |vm, call| {
        check_arity(vm, &call, 1, 2)?;
        let name = symbol_arg(vm, &call.args[0])?;
        let class = vm.host().class_of(call.recv);
        Ok(Value::bool(vm.host().find_method(class, &name).is_some()))
    });
    for name in ["send", "__send__", "public_send"] {
        host.define_native(object, name, |vm, call| {
            check_arity(vm, &call, 1, usize::MAX)?;
            let name = symbol_arg(vm, &call.args[0])?;
            let block = call.block.map(|b| Arc::new(b.clone()));
            vm.call_method(call.recv.clone(), name.as_str(), call.args[1..].to_vec(), block)
        });
    }
    host.define_native(object, "instance_variable_get", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let name = symbol_arg(vm, &call.args[0])?;
        Ok(vm.ivar_get(call.recv, &name, None))
    });
    host.define_native(object, "instance_variable_set", |vm, call| {
        check_arity(vm, &call, 2, 2)?;
        let name = symbol_arg(vm, &call.args[0])?;
        let value = call.args[1].clone();
        vm.ivar_set(call.recv, name, value.clone(), None)?;
        Ok(value)
    });
    host.define_native(object, "singleton_class", |vm, call| {
        vm.host()
            .singleton_class(call.recv)
            .map(Value::Class)
            .map_err(|message| vm.type_error(message))
    });
}

/// Class of a class value: `Class`, or `Module` for modules.
fn class_of_class(vm: &Vm, value: &Value) -> ClassId {
    let host = vm.host();
    let class = host.object_class();
    match host.get_const_under(class, &Symbol::new("Class")) {
        Some(Value::Class(c)) if host.is_kind_of(value, c) => c,
        _ => match host.get_const_under(class, &Symbol::new("Module")) {
            Some(Value::Class(m)) => m,
            _ => class,
        },
    }
}

fn shallow_copy(value: &Value) -> Value {
    match value {
        Value::Str(s) => Value::str(s.lock().clone()),
        Value::Array(items) => Value::array(items.lock().clone()),
        Value::Hash(hash) => Value::hash(hash.lock().clone()),
        other => other.clone(),
    }
}

fn puts_lines(vm: &mut Vm, value: &Value, text: &mut String) -> Result<(), VmError> {
    match value {
        Value::Array(items) => {
            let items = items.lock().clone();
            if items.is_empty() {
                text.push('\n');
            }
            for item in &items {
                puts_lines(vm, item, text)?;
            }
        }
        other => {
            let line = to_s(vm, other)?;
            text.push_str(&line);
            if !line.ends_with('\n') {
                text.push('\n');
            }
        }
    }
    Ok(())
}

/// The exception `raise` with these arguments throws.
fn make_raise(vm: &mut Vm, args: &[Value]) -> Result<VmError, VmError> {
    let host = vm.host().clone();
    match args {
        [] => Ok(vm.raise("RuntimeError", "unhandled exception")),
        [Value::Str(message)] => {
            let message = message.lock().clone();
            Ok(vm.raise("RuntimeError", message))
        }
        [exc] if host.is_exception(exc) => Ok(VmError::Raised(exc.clone())),
        [class @ Value::Class(_), rest @ ..] => {
            let args = rest.to_vec();
            let exc = vm.call_method(class.clone(), "new", args, None)?;
            if host.is_exception(&exc) {
                Ok(VmError::Raised(exc))
            } else {
                Ok(vm.type_error("exception class/object expected"))
            }
        }
        _ => Ok(vm.type_error("exception class/object expected")),
    }
}

fn is_stop_iteration(vm: &Vm, exc: &Value) -> bool {
    let host = vm.host();
    match host.get_const_under(host.object_class(), &Symbol::new("StopIteration")) {
        Some(Value::Class(class)) => host.is_kind_of(exc, class),
        _ => false,
    }
}

fn install_module(host: &Arc<ReferenceHost>) {
    let core = *host.core();
    let (module, class) = (core.module, core.class);

    host.define_native(module, "name", |vm, call| {
        let class = class_arg(vm, call.recv)?;
        Ok(Value::str(vm.host().class_name(class)))
    });
    for name in ["to_s", "inspect"] {
        host.define_native(module, name, |vm, call| {
            let class = class_arg(vm, call.recv)?;
            Ok(Value::str(vm.host().class_name(class)))
        });
    }
    host.define_native(module, "===", |vm, call| {
        let class = class_arg(vm, call.recv)?;
        Ok(Value::bool(vm.host().is_kind_of(&arg(&call, 0), class)))
    });
    host.define_native(module, "==", |_, call| Ok(Value::bool(call.recv.same(&arg(&call, 0)))));

    let accessors: [(&str, bool, bool); 3] = [
        ("attr_reader", true, false),
        ("attr_writer", false, true),
        ("attr_accessor", true, true),
    ];
    for (name, reader, writer) in accessors {
        host.define_native(module, name, move |vm, call| {
            let class = class_arg(vm, call.recv)?;
            for attr in call.args {
                let attr = symbol_arg(vm, attr)?;
                let ivar = Symbol::new(&format!("@{}", attr));
                if reader {
                    vm.host()
                        .define_method(class, attr.clone(), MethodBody::AttrReader(ivar.clone()));
                }
                if writer {
                    let setter = Symbol::new(&format!("{}=", attr));
                    vm.host().define_method(class, setter, MethodBody::AttrWriter(ivar));
                }
            }
            Ok(Value::Nil)
        });
    }
    host.define_native(module, "const_get", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let class = class_arg(vm, call.recv)?;
        let name = symbol_arg(vm, &call.args[0])?;
        vm.host()
            .get_const_under(class, &name)
            .ok_or_else(|| vm.raise("NameError", format!("uninitialized constant {}", name)))
    });
    host.define_native(module, "const_set", |vm, call| {
        check_arity(vm, &call, 2, 2)?;
        let class = class_arg(vm, call.recv)?;
        let name = symbol_arg(vm, &call.args[0])?;
        vm.host().set_const(class, name, call.args[1].clone());
        Ok(call.args[1].clone())
    });
    host.define_native(module, "method_defined?", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let class = class_arg(vm, call.recv)?;
        let name = symbol_arg(vm, &call.args[0])?;
        Ok(Value::bool(vm.host().find_method(class, &name).is_some()))
    });
    host.define_native(module, "class_variable_get", |vm, call| {
        check_arity(vm, &call, 1, 1)?;
        let class = class_arg(vm, call.recv)?;
        let name = symbol_arg(vm, &call.args[0])?;
        vm.host().get_cvar(class, &name).ok_or_else(|| {
            vm.raise(
                "NameError",
                format!(
                    "uninitialized class variable {} in {}",
                    name,
                    vm.host().class_name(class)
                ),
            )
        })
    });

    let weak = Arc::downgrade(host);
    host.define_native(class, "new", move |vm, call| {
        let host = upgrade(&weak)?;
        let class = class_arg(vm, call.recv)?;
        let obj = allocate(vm, &host, class)?;
        let block = call.block.map(|b| Arc::new(b.clone()));
        vm.call_method(obj.clone(), "initialize", call.args.to_vec(), block)?;
        Ok(obj)
    });
    let weak = Arc::downgrade(host);
    host.define_native(class, "allocate", move |vm, call| {
        let host = upgrade(&weak)?;
        let class = class_arg(vm, call.recv)?;
        allocate(vm, &host, class)
    });
    let weak = Arc::downgrade(host);
    host.define_native(class, "superclass", move |vm, call| {
        let host = upgrade(&weak)?;
        let class = class_arg(vm, call.recv)?;
        Ok(host.superclass(class).map_or(Value::Nil, Value::Class))
    });
}

/// A fresh, uninitialized instance of `class`.
fn allocate(vm: &Vm, host: &ReferenceHost, class: ClassId) -> Result<Value, VmError> {
    let core = host.core();
    if host.is_module(class) {
        return Err(vm.raise(
            "NoMethodError",
            format!("undefined method `new' for module {}", host.class_name(class)),
        ));
    }
    let lookup = Value::Object(Arc::new(RObject::new(class)));
    let kind_of = |core_class: ClassId| class == core_class || host.is_kind_of(&lookup, core_class);
    if kind_of(core.string) {
        return Ok(Value::str(""));
    }
    if kind_of(core.array) {
        return Ok(Value::array(Vec::new()));
    }
    if kind_of(core.hash) {
        return Ok(Value::hash(RHash::new()));
    }
    let immediate = [
        core.integer,
        core.float,
        core.symbol,
        core.nil,
        core.true_class,
        core.false_class,
        core.range,
        core.proc_class,
        core.class,
    ];
    if immediate.iter().any(|c| kind_of(*c)) {
        return Err(vm.raise(
            "NoMethodError",
            format!("undefined method `new' for class {}", host.class_name(class)),
        ));
    }
    Ok(lookup)
}

fn install_singletons(host: &Arc<ReferenceHost>) {
    let core = *host.core();
    host.define_native(core.nil, "to_s", |_, _| Ok(Value::str("")));
    host.define_native(core.nil, "to_a", |_, _| Ok(Value::array(Vec::new())));
    host.define_native(core.nil, "inspect", |_, _| Ok(Value::str("nil")));
    host.define_native(core.nil, "nil?", |_, _| Ok(Value::True));
    host.define_native(core.true_class, "to_s", |_, _| Ok(Value::str("true")));
    host.define_native(core.false_class, "to_s", |_, _| Ok(Value::str("false")));
    for class in [core.nil, core.true_class, core.false_class] {
        host.define_native(class, "&", |_, call| {
            Ok(Value::bool(call.recv.truthy() && arg(&call, 0).truthy()))
        });
        host.define_native(class, "|", |_, call| {
            Ok(Value::bool(call.recv.truthy() || arg(&call, 0).truthy()))
        });
    }
}

fn install_proc(host: &Arc<ReferenceHost>) {
    let proc_class = host.core().proc_class;
    for name in ["call", "yield", "[]", "==="] {
        host.define_native(proc_class, name, |vm, call| {
            let Value::Proc(proc) = call.recv else {
                return Err(vm.type_error("proc receiver expected"));
            };
            vm.call_proc(proc, call.args.to_vec())
        });
    }
    host.define_native(proc_class, "to_proc", |_, call| Ok(call.recv.clone()));
    host.define_native(proc_class, "lambda?", |vm, call| match call.recv {
        Value::Proc(proc) => Ok(Value::bool(proc.lambda)),
        _ => Err(vm.type_error("proc receiver expected")),
    });
    host.define_native(proc_class, "arity", |vm, call| {
        let Value::Proc(proc) = call.recv else {
            return Err(vm.type_error("proc receiver expected"));
        };
        let params = &proc.block.routine.params;
        let lead = params.lead as i64;
        let arity = if params.rest.is_some() || (proc.lambda && params.opt_count() > 0) {
            -(lead + 1)
        } else {
            lead
        };
        Ok(Value::int(arity))
    });
}

fn install_exception(host: &Arc<ReferenceHost>) {
    let exception = host.core().exception;
    host.define_native(exception, "initialize", |vm, call| {
        check_arity(vm, &call, 0, 1)?;
        if let Some(message) = call.args.first() {
            vm.ivar_set(call.recv, Symbol::new("@message"), message.clone(), None)?;
        }
        Ok(Value::Nil)
    });
    for name in ["message", "to_s"] {
        host.define_native(exception, name, |vm, call| {
            Ok(Value::str(vm.host().exception_message(call.recv)))
        });
    }
    host.define_native(exception, "inspect", |vm, call| Ok(Value::str(vm.host().inspect(call.recv))));
    host.define_native(exception, "full_message", |vm, call| {
        let host = vm.host();
        let class = host.class_name(host.class_of(call.recv));
        Ok(Value::str(format!("{} ({})", host.exception_message(call.recv), class)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shallow_copy_detaches_containers() {
        let original = Value::array(vec![Value::int(1)]);
        let copy = shallow_copy(&original);
        if let Value::Array(items) = &copy {
            items.lock().push(Value::int(2));
        }
        let Value::Array(items) = &original else {
            unreachable!()
        };
        assert_eq!(items.lock().len(), 1);
    }

    #[test]
    fn test_allocate_rejects_immediates() {
        let host = ReferenceHost::new();
        let vm = Vm::new(host.clone(), Default::default());
        assert!(allocate(&vm, &host, host.core().integer).is_err());
        assert!(matches!(allocate(&vm, &host, host.core().string), Ok(Value::Str(_))));
        assert!(matches!(allocate(&vm, &host, host.core().object), Ok(Value::Object(_))));
    }

    #[test]
    fn test_make_raise_wraps_strings() {
        let host = ReferenceHost::new();
        let mut vm = Vm::new(host.clone(), Default::default());
        let err = make_raise(&mut vm, &[Value::str("boom")]).unwrap();
        let VmError::Raised(exc) = err else {
            panic!("expected a raised exception")
        };
        assert_eq!(host.inspect(&exc), "#<RuntimeError: boom>");
    }
}
