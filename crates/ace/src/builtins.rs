//! Host ("native") functions.
//!
//! Natives are first-class at both ends of the pipeline: at compile time each
//! entry is declared as an identifier (optionally inside a synthetic module
//! such as `events`) whose type is a real function type, and references to it
//! emit a `LOAD_STATIC` of a native-flagged function static. At runtime the
//! static resolves to a [`Value::NativeFunction`] carrying the entry's index
//! into the same registry, so compile-time and runtime registration order
//! must agree: use one [`NativeRegistry`] for both.

use crate::{
    error::SourceLocation,
    scope::{CompilationUnit, IdentFlags},
    types::{self, TypeId, TypeRegistry},
    vm::{
        NativeCtx,
        exceptions::{ExceptionKind, NativeError, NativeResult},
        heap::{EventEntry, HeapData, MatchMode},
        value::Value,
    },
};

/// A native function body.
pub type NativeFn = for<'a, 'io> fn(&mut NativeCtx<'a, 'io>) -> NativeResult;

/// Parameter/return type spec, kept symbolic so entries can be declared
/// before any type registry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Any,
    Int,
    Boolean,
    String,
    Null,
    Function,
    EventArray,
}

impl NativeType {
    fn type_id(self) -> TypeId {
        match self {
            Self::Any => types::ANY,
            Self::Int => types::INT,
            Self::Boolean => types::BOOLEAN,
            Self::String => types::STRING,
            Self::Null => types::NULL,
            Self::Function => types::FUNCTION,
            Self::EventArray => types::EVENT_ARRAY,
        }
    }
}

/// One registered native.
#[derive(Debug, Clone)]
pub struct NativeEntry {
    /// Synthetic module holding the identifier, or `None` for the global
    /// scope.
    pub module: Option<&'static str>,
    pub name: &'static str,
    pub params: &'static [NativeType],
    pub ret: NativeType,
    /// The trailing parameter collects any number of extra arguments.
    pub variadic: bool,
    pub run: NativeFn,
}

/// The ordered native table shared by compiler and VM.
#[derive(Debug, Default)]
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
}

impl NativeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with the standard library of natives installed.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(NativeEntry {
            module: Some("events"),
            name: "call_action",
            params: &[NativeType::Any, NativeType::Function],
            ret: NativeType::Null,
            variadic: false,
            run: native_call_action,
        });
        registry.register(NativeEntry {
            module: Some("events"),
            name: "new_event_array",
            params: &[],
            ret: NativeType::EventArray,
            variadic: false,
            run: native_new_event_array,
        });
        registry.register(NativeEntry {
            module: Some("events"),
            name: "push_event",
            params: &[NativeType::EventArray, NativeType::Any, NativeType::Function],
            ret: NativeType::Null,
            variadic: false,
            run: native_push_event,
        });
        registry.register(NativeEntry {
            module: Some("runtime"),
            name: "has",
            params: &[NativeType::Any, NativeType::String],
            ret: NativeType::Boolean,
            variadic: false,
            run: native_has,
        });
        registry.register(NativeEntry {
            module: Some("runtime"),
            name: "type_name",
            params: &[NativeType::Any],
            ret: NativeType::String,
            variadic: false,
            run: native_type_name,
        });
        registry.register(NativeEntry {
            module: Some("runtime"),
            name: "gc",
            params: &[],
            ret: NativeType::Int,
            variadic: false,
            run: native_gc,
        });
        registry.register(NativeEntry {
            module: None,
            name: "length",
            params: &[NativeType::Any],
            ret: NativeType::Int,
            variadic: false,
            run: native_length,
        });
        registry.register(NativeEntry {
            module: None,
            name: "array_push",
            params: &[NativeType::Any, NativeType::Any],
            ret: NativeType::Null,
            variadic: false,
            run: native_array_push,
        });
        registry.register(NativeEntry {
            module: None,
            name: "array_slice",
            params: &[NativeType::Any, NativeType::Int, NativeType::Int],
            ret: NativeType::Any,
            variadic: false,
            run: native_array_slice,
        });
        registry.register(NativeEntry {
            module: None,
            name: "to_string",
            params: &[NativeType::Any],
            ret: NativeType::String,
            variadic: false,
            run: native_to_string,
        });
        registry.register(NativeEntry {
            module: None,
            name: "fmt",
            params: &[NativeType::String, NativeType::Any],
            ret: NativeType::String,
            variadic: true,
            run: native_fmt,
        });
        registry
    }

    pub fn register(&mut self, entry: NativeEntry) -> u32 {
        let index = u32::try_from(self.entries.len()).expect("native table fits u32");
        self.entries.push(entry);
        index
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&NativeEntry> {
        self.entries.get(index as usize)
    }

    #[must_use]
    pub fn entries(&self) -> &[NativeEntry] {
        &self.entries
    }

    /// Looks up an entry index by its qualified name.
    #[must_use]
    pub fn find(&self, module: Option<&str>, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.module == module && e.name == name)
            .map(|i| u32::try_from(i).expect("native table fits u32"))
    }

    /// The function type of an entry, built in the given registry.
    pub fn signature(&self, index: u32, registry: &mut TypeRegistry) -> TypeId {
        let entry = &self.entries[index as usize];
        let mut params: Vec<TypeId> = entry.params.iter().map(|p| p.type_id()).collect();
        if entry.variadic {
            let last = params.pop().unwrap_or(types::ANY);
            let wrapped = registry.varargs(last);
            params.push(wrapped);
        }
        registry.function(entry.ret.type_id(), params)
    }
}

/// Declares the builtin type names (`Int`, `Float`, `Array`, ...) as
/// identifiers in the global module's root scope, each carrying its type
/// reference so annotations resolve through ordinary name lookup.
pub fn declare_builtin_types(unit: &mut CompilationUnit) {
    use strum::IntoEnumIterator;
    let global = unit.global_module();
    for builtin in crate::types::Builtin::iter() {
        let name: &'static str = builtin.into();
        let ty = types::builtin_id(builtin);
        let ident = unit
            .module_mut(global)
            .declare(name, IdentFlags::CONST, Some(types::TYPE), SourceLocation::unknown())
            .expect("builtin type names are unique");
        unit.module_mut(global).ident_mut(ident).type_ref = Some(ty);
    }
}

/// Declares every registry entry into the compilation unit: global-scope
/// identifiers for unqualified natives, and identifiers inside synthetic
/// child modules of the global module for qualified ones.
pub fn declare_natives(unit: &mut CompilationUnit, natives: &NativeRegistry) {
    let global = unit.global_module();
    for (index, entry) in natives.entries().iter().enumerate() {
        let index = u32::try_from(index).expect("native table fits u32");
        let ty = natives.signature(index, &mut unit.registry);
        let module_id = match entry.module {
            None => global,
            Some(name) => unit
                .find_child_module(global, name)
                .unwrap_or_else(|| unit.add_module(name, SourceLocation::unknown(), global)),
        };
        let ident = unit
            .module_mut(module_id)
            .declare(entry.name, IdentFlags::NATIVE | IdentFlags::CONST, Some(ty), SourceLocation::unknown())
            .expect("native names are unique per module");
        unit.module_mut(module_id).ident_mut(ident).native = Some(index);
    }
}

// ================================================================
// Native implementations
// ================================================================

fn arg(ctx: &NativeCtx<'_, '_>, index: usize) -> Value {
    ctx.args.get(index).copied().unwrap_or(Value::Null)
}

/// Collects the element values of an array, slice, or event-array iteree.
fn iteree_elements(ctx: &NativeCtx<'_, '_>, value: Value) -> Option<Vec<Value>> {
    let id = value.as_heap()?;
    match ctx.vm.heap.get(id) {
        HeapData::Array(items) => Some(items.clone()),
        HeapData::Slice { array, start, end } => {
            let (array, start, end) = (*array, *start, *end);
            match ctx.vm.heap.get(array) {
                HeapData::Array(items) => Some(items.get(start..end.min(items.len()))?.to_vec()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The for-each / generator driver. An array iteree invokes the action once
/// per element; a function iteree is a generator invoked with the action as
/// its callback; an event-array iteree fires each entry's handler.
fn native_call_action(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let iteree = arg(ctx, 0);
    let action = arg(ctx, 1);

    if let Some(elements) = iteree_elements(ctx, iteree) {
        for element in elements {
            ctx.vm.invoke(ctx.thread, action, &[element])?;
        }
        return Ok(Value::Null);
    }
    if let Some(id) = iteree.as_heap() {
        if let HeapData::EventArray(entries) = ctx.vm.heap.get(id) {
            let entries: Vec<EventEntry> = entries.clone();
            for entry in entries {
                ctx.vm.invoke(ctx.thread, entry.handler, &[entry.key])?;
            }
            return Ok(Value::Null);
        }
        // A closure object is also callable.
        ctx.vm.invoke(ctx.thread, iteree, &[action])?;
        return Ok(Value::Null);
    }
    match iteree {
        Value::Function { .. } | Value::NativeFunction(_) => {
            ctx.vm.invoke(ctx.thread, iteree, &[action])?;
            Ok(Value::Null)
        }
        other => Err(NativeError::throw(
            ExceptionKind::InvalidOperation,
            &format!("cannot iterate a value of type '{}'", other.type_name()),
        )),
    }
}

fn native_new_event_array(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let id = ctx.vm.alloc(ctx.thread, HeapData::EventArray(Vec::new()))?;
    Ok(Value::HeapPtr(id))
}

fn native_push_event(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let events = arg(ctx, 0);
    let key = arg(ctx, 1);
    let handler = arg(ctx, 2);
    let Some(id) = events.as_heap() else {
        return Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an event array"));
    };
    let mode = if matches!(key, Value::Null) {
        MatchMode::Any
    } else {
        MatchMode::Exact
    };
    match ctx.vm.heap.get_mut(id) {
        HeapData::EventArray(entries) => {
            entries.push(EventEntry { mode, key, handler });
            Ok(Value::Null)
        }
        _ => Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an event array")),
    }
}

fn native_has(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let object = arg(ctx, 0);
    let name = arg(ctx, 1);
    let Some(name_id) = name.as_heap() else {
        return Ok(Value::Bool(false));
    };
    let HeapData::Str(name) = ctx.vm.heap.get(name_id) else {
        return Ok(Value::Bool(false));
    };
    let hash = crate::bytecode::name_hash(name);
    let found = object.as_heap().is_some_and(|id| match ctx.vm.heap.get(id) {
        HeapData::Object(data) => data.member_by_hash(hash).is_some(),
        _ => false,
    });
    Ok(Value::Bool(found))
}

fn native_type_name(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let value = arg(ctx, 0);
    let name = match value {
        Value::HeapPtr(id) => ctx.vm.heap.get(id).kind_name().to_owned(),
        other => other.type_name().to_owned(),
    };
    let id = ctx.vm.alloc(ctx.thread, HeapData::Str(name.into_boxed_str()))?;
    Ok(Value::HeapPtr(id))
}

fn native_gc(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let (_, live) = ctx.vm.run_gc();
    Ok(Value::I64(i64::try_from(live).unwrap_or(i64::MAX)))
}

fn native_length(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let value = arg(ctx, 0);
    let Some(id) = value.as_heap() else {
        return Err(NativeError::throw(
            ExceptionKind::InvalidOperation,
            &format!("cannot take the length of '{}'", value.type_name()),
        ));
    };
    let len = match ctx.vm.heap.get(id) {
        HeapData::Str(s) => s.chars().count(),
        HeapData::Array(items) => items.len(),
        HeapData::Slice { start, end, .. } => end.saturating_sub(*start),
        HeapData::EventArray(entries) => entries.len(),
        other => {
            return Err(NativeError::throw(
                ExceptionKind::InvalidOperation,
                &format!("cannot take the length of '{}'", other.kind_name()),
            ));
        }
    };
    Ok(Value::I64(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn native_array_push(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let array = arg(ctx, 0);
    let value = arg(ctx, 1);
    let Some(id) = array.as_heap() else {
        return Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an array"));
    };
    match ctx.vm.heap.get_mut(id) {
        HeapData::Array(items) => {
            items.push(value);
            Ok(Value::Null)
        }
        _ => Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an array")),
    }
}

fn native_array_slice(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let array = arg(ctx, 0);
    let start = arg(ctx, 1)
        .as_integer()
        .ok_or_else(|| NativeError::throw(ExceptionKind::InvalidOperation, "slice bounds must be integers"))?;
    let end = arg(ctx, 2)
        .as_integer()
        .ok_or_else(|| NativeError::throw(ExceptionKind::InvalidOperation, "slice bounds must be integers"))?;
    let Some(id) = array.as_heap() else {
        return Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an array"));
    };
    let len = match ctx.vm.heap.get(id) {
        HeapData::Array(items) => items.len(),
        _ => return Err(NativeError::throw(ExceptionKind::InvalidOperation, "expected an array")),
    };
    let start = usize::try_from(start).map_err(|_| NativeError::throw(ExceptionKind::OutOfBounds, ""))?;
    let end = usize::try_from(end).map_err(|_| NativeError::throw(ExceptionKind::OutOfBounds, ""))?;
    if start > end || end > len {
        return Err(NativeError::throw(ExceptionKind::OutOfBounds, ""));
    }
    let slice = ctx.vm.alloc(ctx.thread, HeapData::Slice { array: id, start, end })?;
    Ok(Value::HeapPtr(slice))
}

fn native_to_string(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let value = arg(ctx, 0);
    let text = ctx.vm.display_value(value);
    let id = ctx.vm.alloc(ctx.thread, HeapData::Str(text.into_boxed_str()))?;
    Ok(Value::HeapPtr(id))
}

/// Replaces each `{}` in the template with the next argument's display form.
fn native_fmt(ctx: &mut NativeCtx<'_, '_>) -> NativeResult {
    let template = arg(ctx, 0);
    let Some(id) = template.as_heap() else {
        return Err(NativeError::throw(ExceptionKind::InvalidOperation, "fmt template must be a string"));
    };
    let HeapData::Str(template) = ctx.vm.heap.get(id) else {
        return Err(NativeError::throw(ExceptionKind::InvalidOperation, "fmt template must be a string"));
    };
    let template = template.to_string();
    let mut out = String::with_capacity(template.len());
    let mut next = 1usize;
    let mut rest = template.as_str();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        out.push_str(&ctx.vm.display_value(arg(ctx, next)));
        next += 1;
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    let id = ctx.vm.alloc(ctx.thread, HeapData::Str(out.into_boxed_str()))?;
    Ok(Value::HeapPtr(id))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CompilerConfig;

    #[test]
    fn standard_registry_is_ordered_and_searchable() {
        let registry = NativeRegistry::standard();
        assert_eq!(registry.find(Some("events"), "call_action"), Some(0));
        assert!(registry.find(None, "length").is_some());
        assert!(registry.find(Some("events"), "length").is_none());
    }

    #[test]
    fn natives_declare_into_modules_and_global_scope() {
        let registry = NativeRegistry::standard();
        let mut unit = CompilationUnit::new(CompilerConfig::default());
        declare_natives(&mut unit, &registry);

        let global = unit.global_module();
        let length = unit.module(global).lookup_root("length").expect("global native");
        assert!(unit.module(global).ident(length).is_native());

        let events = unit.find_child_module(global, "events").expect("events module");
        let call_action = unit.module(events).lookup_root("call_action").expect("module native");
        let ident = unit.module(events).ident(call_action);
        assert_eq!(ident.native, Some(0));
        let ty = ident.ty.expect("native has a function type");
        assert!(unit.registry.as_function(ty).is_some());
    }
}
