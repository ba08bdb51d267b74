//! Reference host
//!
//! A small core class library implementing [`ObjectModel`], enough to run
//! translated routines end to end from tests and the CLI. Classes live in
//! one table behind a lock; every class gets its metaclass at creation so
//! class methods inherit along the superclass chain.

mod collections;
mod inspect;
mod kernel;
mod numeric;

use crate::object::{BasicOp, GlobalState, MethodBody, MethodEntry, NativeCall, ObjectModel};
use crate::value::{ClassId, CoreKind, HashKey, RObject, Symbol, Value};
use crate::vm::{arity_message, Vm, VmError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Ids of the classes the host creates at startup
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub object: ClassId,
    pub module: ClassId,
    pub class: ClassId,
    pub numeric: ClassId,
    pub integer: ClassId,
    pub float: ClassId,
    pub string: ClassId,
    pub symbol: ClassId,
    pub array: ClassId,
    pub hash: ClassId,
    pub range: ClassId,
    pub nil: ClassId,
    pub true_class: ClassId,
    pub false_class: ClassId,
    pub proc_class: ClassId,
    pub exception: ClassId,
}

#[derive(Default)]
struct ClassEntry {
    name: String,
    superclass: Option<ClassId>,
    lexical_parent: Option<ClassId>,
    meta: Option<ClassId>,
    /// Set on metaclasses and singleton classes
    attached: Option<Value>,
    module: bool,
    core_kind: Option<CoreKind>,
    methods: HashMap<Symbol, MethodBody>,
    consts: HashMap<Symbol, Value>,
    cvars: HashMap<Symbol, Value>,
    /// Slot layout of instances
    ivar_slots: Vec<Symbol>,
    /// Instance variables of the class object itself
    ivars: HashMap<Symbol, Value>,
}

#[derive(Default)]
struct Tables {
    classes: Vec<ClassEntry>,
    /// Singleton classes of plain objects, keyed by address
    singletons: HashMap<usize, (Arc<RObject>, ClassId)>,
    globals: HashMap<Symbol, Value>,
    generic_ivars: HashMap<HashKey, (Value, HashMap<Symbol, Value>)>,
}

impl Tables {
    fn entry(&self, class: ClassId) -> Option<&ClassEntry> {
        self.classes.get(class.0 as usize)
    }

    fn entry_mut(&mut self, class: ClassId) -> Option<&mut ClassEntry> {
        self.classes.get_mut(class.0 as usize)
    }

    fn add(&mut self, entry: ClassEntry) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(entry);
        id
    }

    /// Core kinds whose lookup of `name` now ends at `class`, e.g. every
    /// kind without its own `!` once `Object#!` is redefined.
    fn kinds_resolving_to(&self, class: ClassId, name: &Symbol) -> Vec<CoreKind> {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let kind = entry.core_kind?;
                let owner = self
                    .ancestors(ClassId(idx as u32))
                    .into_iter()
                    .find(|c| self.entry(*c).map_or(false, |e| e.methods.contains_key(name)))?;
                (owner == class).then_some(kind)
            })
            .collect()
    }

    /// `class` followed by its superclasses.
    fn ancestors(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut cursor = Some(class);
        while let Some(c) = cursor {
            if chain.contains(&c) {
                break;
            }
            chain.push(c);
            cursor = self.entry(c).and_then(|e| e.superclass);
        }
        chain
    }

    fn name(&self, class: ClassId) -> String {
        match self.entry(class) {
            Some(entry) => match &entry.attached {
                Some(Value::Class(of)) => format!("#<Class:{}>", self.name(*of)),
                Some(_) => format!("#<Class:{}>", entry.name),
                None => entry.name.clone(),
            },
            None => format!("#<Class:{}>", class.0),
        }
    }

    fn lookup_const(&self, class: ClassId, name: &Symbol) -> Option<Value> {
        self.ancestors(class)
            .into_iter()
            .find_map(|c| self.entry(c).and_then(|e| e.consts.get(name).cloned()))
    }

    /// Create the metaclass of `class`, inheriting from the superclass's
    /// metaclass, or `root` when there is none.
    fn make_meta(&mut self, class: ClassId, root: ClassId) -> ClassId {
        let superclass = self
            .entry(class)
            .and_then(|e| e.superclass)
            .and_then(|s| self.entry(s))
            .and_then(|e| e.meta)
            .unwrap_or(root);
        let meta = self.add(ClassEntry {
            superclass: Some(superclass),
            attached: Some(Value::Class(class)),
            ..Default::default()
        });
        if let Some(entry) = self.entry_mut(class) {
            entry.meta = Some(meta);
        }
        meta
    }
}

/// Where `puts`, `print` and `p` write
#[derive(Debug, Default)]
pub struct Output {
    capture: Option<Mutex<String>>,
}

impl Output {
    pub fn write(&self, text: &str) {
        match &self.capture {
            Some(buffer) => buffer.lock().push_str(text),
            None => print!("{}", text),
        }
    }

    fn take(&self) -> String {
        self.capture
            .as_ref()
            .map(|buffer| std::mem::take(&mut *buffer.lock()))
            .unwrap_or_default()
    }
}

/// The reference object model
pub struct ReferenceHost {
    globals: Arc<GlobalState>,
    core: CoreClasses,
    tables: RwLock<Tables>,
    output: Arc<Output>,
}

impl std::fmt::Debug for ReferenceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceHost")
            .field("classes", &self.tables.read().classes.len())
            .finish()
    }
}

impl ReferenceHost {
    /// Host writing program output to stdout.
    pub fn new() -> Arc<Self> {
        Self::with_output(Output::default())
    }

    /// Host collecting program output for [`ReferenceHost::take_output`].
    pub fn capturing() -> Arc<Self> {
        Self::with_output(Output {
            capture: Some(Mutex::new(String::new())),
        })
    }

    fn with_output(output: Output) -> Arc<Self> {
        let (tables, core) = bootstrap();
        let host = Arc::new(Self {
            globals: Arc::new(GlobalState::new()),
            core,
            tables: RwLock::new(tables),
            output: Arc::new(output),
        });
        kernel::install(&host);
        numeric::install(&host);
        collections::install(&host);
        host
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    /// Output captured so far; empty when writing to stdout.
    pub fn take_output(&self) -> String {
        self.output.take()
    }

    pub(crate) fn output(&self) -> Arc<Output> {
        self.output.clone()
    }

    /// Top-level class or module by name.
    pub fn class_named(&self, name: &str) -> Option<ClassId> {
        match self.get_const_under(self.core.object, &Symbol::new(name))? {
            Value::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn superclass(&self, class: ClassId) -> Option<ClassId> {
        let tables = self.tables.read();
        let mut cursor = tables.entry(class)?.superclass;
        // metaclasses and singleton classes are skipped
        while let Some(c) = cursor {
            let entry = tables.entry(c)?;
            if entry.attached.is_none() {
                return Some(c);
            }
            cursor = entry.superclass;
        }
        None
    }

    pub fn is_module(&self, class: ClassId) -> bool {
        self.tables.read().entry(class).map_or(false, |e| e.module)
    }

    /// Install a builtin without marking anything redefined.
    pub(crate) fn define_native<F>(&self, class: ClassId, name: &str, f: F)
    where
        F: Fn(&mut Vm, NativeCall<'_>) -> Result<Value, VmError> + Send + Sync + 'static,
    {
        if let Some(entry) = self.tables.write().entry_mut(class) {
            entry
                .methods
                .insert(Symbol::new(name), MethodBody::Native(Arc::new(f)));
        }
    }

    /// Instance variable names and values of an object, in slot order.
    pub(crate) fn ivars_of(&self, obj: &RObject) -> Vec<(Symbol, Value)> {
        let tables = self.tables.read();
        let Some(entry) = tables.entry(obj.class) else {
            return Vec::new();
        };
        entry
            .ivar_slots
            .iter()
            .enumerate()
            .map(|(slot, name)| (name.clone(), obj.ivar(slot)))
            .filter(|(_, value)| !value.is_nil())
            .collect()
    }
}

impl ObjectModel for ReferenceHost {
    fn global_state(&self) -> &Arc<GlobalState> {
        &self.globals
    }

    fn class_of(&self, value: &Value) -> ClassId {
        let core = &self.core;
        match value {
            Value::Nil => core.nil,
            Value::True => core.true_class,
            Value::False => core.false_class,
            Value::Fixnum(_) | Value::Bignum(_) => core.integer,
            Value::Float(_) => core.float,
            Value::Symbol(_) => core.symbol,
            Value::Str(_) => core.string,
            Value::Array(_) => core.array,
            Value::Hash(_) => core.hash,
            Value::Range(_) => core.range,
            Value::Proc(_) => core.proc_class,
            Value::Object(obj) => {
                let tables = self.tables.read();
                if tables.singletons.is_empty() {
                    return obj.class;
                }
                let key = Arc::as_ptr(obj) as usize;
                tables.singletons.get(&key).map_or(obj.class, |(_, c)| *c)
            }
            Value::Class(class) => self
                .tables
                .read()
                .entry(*class)
                .and_then(|e| e.meta)
                .unwrap_or(core.class),
        }
    }

    fn class_name(&self, class: ClassId) -> String {
        self.tables.read().name(class)
    }

    fn object_class(&self) -> ClassId {
        self.core.object
    }

    fn is_kind_of(&self, value: &Value, class: ClassId) -> bool {
        let own = self.class_of(value);
        self.tables.read().ancestors(own).contains(&class)
    }

    fn find_method(&self, class: ClassId, name: &Symbol) -> Option<MethodEntry> {
        let tables = self.tables.read();
        tables.ancestors(class).into_iter().find_map(|c| {
            let body = tables.entry(c)?.methods.get(name)?;
            Some(MethodEntry {
                owner: c,
                name: name.clone(),
                body: body.clone(),
            })
        })
    }

    fn find_super_method(&self, class: ClassId, owner: ClassId, name: &Symbol) -> Option<MethodEntry> {
        let tables = self.tables.read();
        tables
            .ancestors(class)
            .into_iter()
            .skip_while(|c| *c != owner)
            .skip(1)
            .find_map(|c| {
                let body = tables.entry(c)?.methods.get(name)?;
                Some(MethodEntry {
                    owner: c,
                    name: name.clone(),
                    body: body.clone(),
                })
            })
    }

    fn define_method(&self, class: ClassId, name: Symbol, body: MethodBody) {
        let kinds = {
            let mut tables = self.tables.write();
            let Some(entry) = tables.entry_mut(class) else {
                return;
            };
            entry.methods.insert(name.clone(), body);
            tables.kinds_resolving_to(class, &name)
        };
        match BasicOp::from_method_name(name.as_str()) {
            Some(op) if !kinds.is_empty() => {
                for kind in kinds {
                    self.globals.redefine(op, kind);
                }
            }
            _ => self.globals.bump_method_generation(),
        }
    }

    fn ivar_index(&self, class: ClassId, name: &Symbol, create: bool) -> Option<usize> {
        if !create {
            let tables = self.tables.read();
            return tables.entry(class)?.ivar_slots.iter().position(|n| n == name);
        }
        let mut tables = self.tables.write();
        let entry = tables.entry_mut(class)?;
        match entry.ivar_slots.iter().position(|n| n == name) {
            Some(slot) => Some(slot),
            None => {
                entry.ivar_slots.push(name.clone());
                Some(entry.ivar_slots.len() - 1)
            }
        }
    }

    fn generic_ivar_get(&self, recv: &Value, name: &Symbol) -> Option<Value> {
        let tables = self.tables.read();
        match recv {
            Value::Class(class) => tables.entry(*class)?.ivars.get(name).cloned(),
            _ => tables
                .generic_ivars
                .get(&recv.hash_key(true))
                .and_then(|(_, ivars)| ivars.get(name).cloned()),
        }
    }

    fn generic_ivar_set(&self, recv: &Value, name: Symbol, value: Value) -> Result<(), String> {
        let mut tables = self.tables.write();
        match recv {
            Value::Class(class) => {
                if let Some(entry) = tables.entry_mut(*class) {
                    entry.ivars.insert(name, value);
                }
                Ok(())
            }
            Value::Str(_) | Value::Array(_) | Value::Hash(_) | Value::Range(_) | Value::Proc(_) => {
                tables
                    .generic_ivars
                    .entry(recv.hash_key(true))
                    .or_insert_with(|| (recv.clone(), HashMap::new()))
                    .1
                    .insert(name, value);
                Ok(())
            }
            other => Err(format!("can't modify frozen {}", other.type_name())),
        }
    }

    fn get_const(&self, scope: ClassId, name: &Symbol) -> Option<Value> {
        let tables = self.tables.read();
        // lexical scopes first, then ancestors, then Object
        let mut cursor = Some(scope);
        while let Some(c) = cursor {
            let entry = tables.entry(c)?;
            if let Some(value) = entry.consts.get(name) {
                return Some(value.clone());
            }
            cursor = entry.lexical_parent;
        }
        tables
            .lookup_const(scope, name)
            .or_else(|| tables.lookup_const(self.core.object, name))
    }

    fn get_const_under(&self, base: ClassId, name: &Symbol) -> Option<Value> {
        self.tables.read().lookup_const(base, name)
    }

    fn set_const(&self, scope: ClassId, name: Symbol, value: Value) {
        if let Some(entry) = self.tables.write().entry_mut(scope) {
            entry.consts.insert(name, value);
        }
        self.globals.bump_constant_generation();
    }

    fn get_global(&self, name: &Symbol) -> Value {
        self.tables
            .read()
            .globals
            .get(name)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    fn set_global(&self, name: Symbol, value: Value) {
        self.tables.write().globals.insert(name, value);
    }

    fn get_cvar(&self, scope: ClassId, name: &Symbol) -> Option<Value> {
        let tables = self.tables.read();
        let scope = cvar_base(&tables, scope);
        tables
            .ancestors(scope)
            .into_iter()
            .find_map(|c| tables.entry(c).and_then(|e| e.cvars.get(name).cloned()))
    }

    fn set_cvar(&self, scope: ClassId, name: Symbol, value: Value) {
        let mut tables = self.tables.write();
        let scope = cvar_base(&tables, scope);
        let owner = tables
            .ancestors(scope)
            .into_iter()
            .find(|c| tables.entry(*c).map_or(false, |e| e.cvars.contains_key(&name)))
            .unwrap_or(scope);
        if let Some(entry) = tables.entry_mut(owner) {
            entry.cvars.insert(name, value);
        }
    }

    fn open_class(
        &self,
        scope: ClassId,
        name: &Symbol,
        superclass: Option<ClassId>,
        module: bool,
    ) -> Result<ClassId, String> {
        let kind = if module { "module" } else { "class" };
        let mut tables = self.tables.write();

        let existing = tables.entry(scope).and_then(|e| e.consts.get(name).cloned());
        match existing {
            Some(Value::Class(class)) => {
                let entry = tables.entry(class).ok_or_else(|| format!("{} is not a {}", name, kind))?;
                if entry.module != module {
                    return Err(format!("{} is not a {}", name, kind));
                }
                if let Some(requested) = superclass {
                    if entry.superclass != Some(requested) {
                        return Err(format!("superclass mismatch for class {}", name));
                    }
                }
                return Ok(class);
            }
            Some(_) => return Err(format!("{} is not a {}", name, kind)),
            None => {}
        }

        if let Some(requested) = superclass {
            if tables.entry(requested).map_or(true, |e| e.module) {
                return Err("superclass must be a Class".to_string());
            }
        }
        let full_name = if scope == self.core.object {
            name.to_string()
        } else {
            format!("{}::{}", tables.name(scope), name)
        };
        let class = tables.add(ClassEntry {
            name: full_name,
            superclass: if module {
                None
            } else {
                Some(superclass.unwrap_or(self.core.object))
            },
            lexical_parent: (scope != self.core.object).then_some(scope),
            module,
            ..Default::default()
        });
        let root = if module { self.core.module } else { self.core.class };
        tables.make_meta(class, root);
        if let Some(entry) = tables.entry_mut(scope) {
            entry.consts.insert(name.clone(), Value::Class(class));
        }
        drop(tables);
        self.globals.bump_constant_generation();
        Ok(class)
    }

    fn singleton_class(&self, value: &Value) -> Result<ClassId, String> {
        match value {
            Value::Class(class) => {
                let mut tables = self.tables.write();
                if let Some(meta) = tables.entry(*class).and_then(|e| e.meta) {
                    return Ok(meta);
                }
                Ok(tables.make_meta(*class, self.core.class))
            }
            Value::Object(obj) => {
                let key = Arc::as_ptr(obj) as usize;
                let mut tables = self.tables.write();
                if let Some((_, class)) = tables.singletons.get(&key) {
                    return Ok(*class);
                }
                let singleton = tables.add(ClassEntry {
                    superclass: Some(obj.class),
                    attached: Some(value.clone()),
                    ..Default::default()
                });
                tables.singletons.insert(key, (obj.clone(), singleton));
                drop(tables);
                self.globals.bump_method_generation();
                Ok(singleton)
            }
            other => Err(format!("can't define singleton for {}", other.type_name())),
        }
    }

    fn make_exception(&self, class_name: &str, message: &str) -> Value {
        let class = self
            .class_named(class_name)
            .filter(|c| self.tables.read().ancestors(*c).contains(&self.core.exception))
            .unwrap_or(self.core.exception);
        let exception = RObject::new(class);
        if let Some(slot) = self.ivar_index(class, &Symbol::new("@message"), true) {
            exception.set_ivar(slot, Value::str(message));
        }
        Value::Object(Arc::new(exception))
    }

    fn exception_message(&self, exception: &Value) -> String {
        let Value::Object(obj) = exception else {
            return self.inspect(exception);
        };
        let message = self
            .ivar_index(obj.class, &Symbol::new("@message"), false)
            .map(|slot| obj.ivar(slot));
        match message {
            Some(Value::Str(text)) => text.lock().clone(),
            Some(Value::Nil) | None => self.class_name(obj.class),
            Some(other) => self.inspect(&other),
        }
    }

    fn is_exception(&self, value: &Value) -> bool {
        matches!(value, Value::Object(_)) && self.is_kind_of(value, self.core.exception)
    }

    fn inspect(&self, value: &Value) -> String {
        inspect::inspect(self, value)
    }
}

/// Class variables of a metaclass live on the class it is attached to.
fn cvar_base(tables: &Tables, scope: ClassId) -> ClassId {
    match tables.entry(scope).and_then(|e| e.attached.as_ref()) {
        Some(Value::Class(class)) => *class,
        _ => scope,
    }
}

/// Core class hierarchy, parents before children.
const CORE_HIERARCHY: &[(&str, Option<&str>)] = &[
    ("Object", None),
    ("Module", Some("Object")),
    ("Class", Some("Module")),
    ("Numeric", Some("Object")),
    ("Integer", Some("Numeric")),
    ("Float", Some("Numeric")),
    ("String", Some("Object")),
    ("Symbol", Some("Object")),
    ("Array", Some("Object")),
    ("Hash", Some("Object")),
    ("Range", Some("Object")),
    ("NilClass", Some("Object")),
    ("TrueClass", Some("Object")),
    ("FalseClass", Some("Object")),
    ("Proc", Some("Object")),
    ("Exception", Some("Object")),
    ("ScriptError", Some("Exception")),
    ("NotImplementedError", Some("ScriptError")),
    ("StandardError", Some("Exception")),
    ("RuntimeError", Some("StandardError")),
    ("FrozenError", Some("RuntimeError")),
    ("TypeError", Some("StandardError")),
    ("ArgumentError", Some("StandardError")),
    ("NameError", Some("StandardError")),
    ("NoMethodError", Some("NameError")),
    ("ZeroDivisionError", Some("StandardError")),
    ("LocalJumpError", Some("StandardError")),
    ("IndexError", Some("StandardError")),
    ("KeyError", Some("IndexError")),
    ("StopIteration", Some("IndexError")),
    ("RangeError", Some("StandardError")),
    ("FloatDomainError", Some("RangeError")),
    ("SystemStackError", Some("Exception")),
    ("SignalException", Some("Exception")),
    ("Interrupt", Some("SignalException")),
];

fn bootstrap() -> (Tables, CoreClasses) {
    let mut tables = Tables::default();
    let mut ids: HashMap<&str, ClassId> = HashMap::new();

    for (name, superclass) in CORE_HIERARCHY {
        let id = tables.add(ClassEntry {
            name: name.to_string(),
            superclass: superclass.and_then(|s| ids.get(s).copied()),
            ..Default::default()
        });
        ids.insert(name, id);
    }

    let id = |name: &str| ids.get(name).copied().unwrap_or(ClassId(0));
    let core = CoreClasses {
        object: id("Object"),
        module: id("Module"),
        class: id("Class"),
        numeric: id("Numeric"),
        integer: id("Integer"),
        float: id("Float"),
        string: id("String"),
        symbol: id("Symbol"),
        array: id("Array"),
        hash: id("Hash"),
        range: id("Range"),
        nil: id("NilClass"),
        true_class: id("TrueClass"),
        false_class: id("FalseClass"),
        proc_class: id("Proc"),
        exception: id("Exception"),
    };

    for (name, _) in CORE_HIERARCHY {
        let class = id(name);
        tables.make_meta(class, core.class);
        if let Some(object) = tables.entry_mut(core.object) {
            object.consts.insert(Symbol::new(name), Value::Class(class));
        }
    }

    let kinds = [
        (core.integer, CoreKind::Integer),
        (core.float, CoreKind::Float),
        (core.string, CoreKind::String),
        (core.symbol, CoreKind::Symbol),
        (core.array, CoreKind::Array),
        (core.hash, CoreKind::Hash),
        (core.nil, CoreKind::Nil),
        (core.true_class, CoreKind::True),
        (core.false_class, CoreKind::False),
    ];
    for (class, kind) in kinds {
        if let Some(entry) = tables.entry_mut(class) {
            entry.core_kind = Some(kind);
        }
    }
    (tables, core)
}

// ----------------------------------------------------------------------
// Helpers shared by the native method sets
// ----------------------------------------------------------------------

/// Check a native's argument count.
pub(crate) fn check_arity(vm: &Vm, call: &NativeCall<'_>, min: usize, max: usize) -> Result<(), VmError> {
    let given = call.args.len();
    if given < min || given > max {
        let rest = max == usize::MAX;
        let opt = if rest { 0 } else { max - min };
        return Err(vm.raise("ArgumentError", arity_message(given, min, opt, rest)));
    }
    Ok(())
}

/// Argument `idx`, or nil when absent.
pub(crate) fn arg(call: &NativeCall<'_>, idx: usize) -> Value {
    call.args.get(idx).cloned().unwrap_or(Value::Nil)
}

/// The block passed to a native, or LocalJumpError.
pub(crate) fn need_block<'a>(vm: &Vm, call: &NativeCall<'a>) -> Result<&'a crate::vm::Block, VmError> {
    call.block
        .ok_or_else(|| vm.raise("LocalJumpError", "no block given (yield)"))
}

/// `to_s` of any value, dispatching to user definitions.
pub(crate) fn to_s(vm: &mut Vm, value: &Value) -> Result<String, VmError> {
    match value {
        Value::Str(s) => Ok(s.lock().clone()),
        Value::Object(_) => match vm.call_method(value.clone(), "to_s", Vec::new(), None)? {
            Value::Str(s) => Ok(s.lock().clone()),
            other => Ok(vm.host().inspect(&other)),
        },
        other => Ok(inspect::to_s(vm.host().as_ref(), other)),
    }
}

/// `inspect` of any value, dispatching to user definitions.
pub(crate) fn inspect_value(vm: &mut Vm, value: &Value) -> Result<String, VmError> {
    match value {
        Value::Object(_) => match vm.call_method(value.clone(), "inspect", Vec::new(), None)? {
            Value::Str(s) => Ok(s.lock().clone()),
            other => Ok(vm.host().inspect(&other)),
        },
        other => Ok(vm.host().inspect(other)),
    }
}

/// `==` with structural comparison of core values.
pub(crate) fn values_eq(vm: &mut Vm, a: &Value, b: &Value) -> Result<bool, VmError> {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if Arc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (l, r) in x.iter().zip(&y) {
                if !values_eq(vm, l, r)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Hash(x), Value::Hash(y)) => {
            if Arc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (key, l) in x.iter() {
                match y.get(key) {
                    Some(r) if values_eq(vm, l, &r)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (Value::Object(_), _) => Ok(vm.call_method(a.clone(), "==", vec![b.clone()], None)?.truthy()),
        _ => Ok(numeric::core_eq(a, b)),
    }
}
