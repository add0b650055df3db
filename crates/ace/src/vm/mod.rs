//! The virtual machine: threads, static memory, the dispatcher, and the
//! native-call boundary.
//!
//! Execution is cooperative. Each thread owns a value stack, a fixed
//! register file, a comparison-flags register, and an exception state; the
//! heap and static memory are shared. The dispatcher reads one opcode at a
//! time and never switches threads mid-instruction. Exceptions unwind the
//! value stack through try frames pushed by `BEGIN_TRY`; host-language
//! unwinding is never involved.

pub mod exceptions;
pub mod heap;
pub mod value;

use crate::{
    bytecode::{Opcode, Program, name_hash},
    config::VmConfig,
    emit::static_object::{FunctionFlags, StaticObject, StaticTypeInfo},
    io::PrintWriter,
    tracer::VmTracer,
    builtins::NativeRegistry,
    vm::{
        exceptions::{ExceptionKind, NativeError, NativeResult, Unwind},
        heap::{Heap, HeapData, HeapId, HeapOverflow, ObjectData},
        value::{Value, format_float},
    },
};

use ahash::AHashMap;

/// Comparison flags. There is no LESS flag; the emitter orders operands so
/// GREATER and EQUAL suffice.
pub const FLAG_NONE: u8 = 0x00;
pub const FLAG_EQUAL: u8 = 0x01;
pub const FLAG_GREATER: u8 = 0x02;

/// Return address marking a host-initiated invocation; `RET` to it hands
/// control back to the native that called [`VmState::invoke`].
const HOST_SENTINEL: u32 = u32::MAX;

/// One cooperative execution thread.
#[derive(Debug)]
pub struct ExecutionThread {
    pub stack: Vec<Value>,
    pub registers: Vec<Value>,
    pub flags: u8,
    /// Incremented by `BEGIN_TRY`, decremented by `END_TRY` and by catching.
    pub try_counter: u32,
    /// Set when an exception occurs, cleared when one is handled.
    pub exception_occurred: bool,
    pub pc: usize,
}

impl ExecutionThread {
    fn new(config: &VmConfig) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            registers: vec![Value::Null; config.register_count],
            flags: FLAG_NONE,
            try_counter: 0,
            exception_occurred: false,
            pc: 0,
        }
    }
}

/// Context handed to native functions: the VM, the calling thread, and the
/// argument values (the originals stay on the stack as GC roots for the
/// duration of the call).
pub struct NativeCtx<'a, 'io> {
    pub vm: &'a mut VmState<'io>,
    pub thread: usize,
    pub args: Vec<Value>,
}

/// Program-load failures.
#[derive(Debug)]
pub struct LoadError(pub String);

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot load program: {}", self.0)
    }
}

impl std::error::Error for LoadError {}

/// How a dispatch loop ended.
enum RunOutcome {
    /// `EXIT` executed, or the VM was cancelled.
    Halt,
    /// A `RET` reached the host sentinel of a nested invocation.
    HostReturn,
    /// An exception escaped this loop's boundary.
    Unhandled(Value),
}

/// The whole VM: shared heap and static memory plus the thread table.
pub struct VmState<'io> {
    pub config: VmConfig,
    pub heap: Heap,
    code: Vec<u8>,
    static_memory: Vec<Value>,
    /// Type layouts by static id, for `NEW`.
    type_infos: Vec<Option<StaticTypeInfo>>,
    threads: Vec<ExecutionThread>,
    /// Cleared to cancel execution; the dispatcher checks it between
    /// instructions.
    pub good: bool,
    natives: &'io NativeRegistry,
    writer: &'io mut dyn PrintWriter,
    tracer: &'io mut dyn VmTracer,
}

impl<'io> VmState<'io> {
    /// Builds a VM from a decoded program: copies the code, materializes
    /// static memory (strings become heap cells rooted by the static table,
    /// type-infos become TypeObjects), and creates the main thread.
    pub fn new(
        program: &Program,
        natives: &'io NativeRegistry,
        config: VmConfig,
        writer: &'io mut dyn PrintWriter,
        tracer: &'io mut dyn VmTracer,
    ) -> Result<Self, LoadError> {
        let mut vm = Self {
            heap: Heap::new(&config),
            code: program.code.clone(),
            static_memory: Vec::with_capacity(program.statics.len()),
            type_infos: Vec::with_capacity(program.statics.len()),
            threads: vec![ExecutionThread::new(&config)],
            good: true,
            natives,
            writer,
            tracer,
            config,
        };
        for (index, entry) in program.statics.iter().enumerate() {
            let (value, info) = match entry {
                StaticObject::Label { position } => (Value::Address(*position), None),
                StaticObject::String(s) => {
                    let id = vm
                        .heap
                        .alloc(HeapData::Str(s.clone()))
                        .map_err(|_| LoadError("static table exceeds the heap limit".to_owned()))?;
                    (Value::HeapPtr(id), None)
                }
                StaticObject::Function(f) => {
                    if f.flags.contains(FunctionFlags::NATIVE) {
                        (Value::NativeFunction(f.addr), None)
                    } else {
                        (
                            Value::Function {
                                addr: f.addr,
                                nargs: f.nargs,
                                flags: f.flags,
                            },
                            None,
                        )
                    }
                }
                StaticObject::TypeInfo(info) => {
                    let type_id = u16::try_from(index).map_err(|_| LoadError("static table too large".to_owned()))?;
                    let object = ObjectData {
                        type_id,
                        members: Vec::new(),
                        name_index: AHashMap::new(),
                    };
                    let id = vm
                        .heap
                        .alloc(HeapData::Object(object))
                        .map_err(|_| LoadError("static table exceeds the heap limit".to_owned()))?;
                    (Value::HeapPtr(id), Some(info.clone()))
                }
            };
            vm.static_memory.push(value);
            vm.type_infos.push(info);
        }
        Ok(vm)
    }

    /// Runs the main thread from the program start. Returns the process
    /// exit code: zero on clean completion, one after an unhandled
    /// exception or cancellation.
    pub fn execute(&mut self) -> i32 {
        self.threads[0].pc = 0;
        match self.run(0, false) {
            RunOutcome::Halt | RunOutcome::HostReturn => {
                if self.good {
                    0
                } else {
                    1
                }
            }
            RunOutcome::Unhandled(_) => 1,
        }
    }

    /// Creates another cooperative thread, up to the configured maximum.
    pub fn spawn_thread(&mut self) -> Option<usize> {
        if self.threads.len() >= self.config.max_threads {
            return None;
        }
        self.threads.push(ExecutionThread::new(&self.config));
        Some(self.threads.len() - 1)
    }

    #[must_use]
    pub fn thread(&self, index: usize) -> &ExecutionThread {
        &self.threads[index]
    }

    pub fn thread_mut(&mut self, index: usize) -> &mut ExecutionThread {
        &mut self.threads[index]
    }

    // ================================================================
    // Allocation and GC
    // ================================================================

    /// Allocates, collecting first when the threshold is reached.
    fn alloc_data(&mut self, data: HeapData) -> Result<HeapId, HeapOverflow> {
        if self.heap.should_gc() {
            self.run_gc();
        }
        self.heap.alloc(data)
    }

    /// Native-facing allocation: a full heap turns into a throwable error.
    pub fn alloc(&mut self, _thread: usize, data: HeapData) -> Result<HeapId, NativeError> {
        self.alloc_data(data)
            .map_err(|HeapOverflow| NativeError::throw(ExceptionKind::HeapOverflow, ""))
    }

    /// One stop-the-world mark-and-sweep cycle. Roots are every thread's
    /// stack and registers plus the static table.
    pub fn run_gc(&mut self) -> (usize, usize) {
        let mut roots: Vec<Value> = Vec::new();
        for thread in &self.threads {
            roots.extend_from_slice(&thread.stack);
            roots.extend_from_slice(&thread.registers);
        }
        roots.extend_from_slice(&self.static_memory);
        let (before, after) = self.heap.collect(roots);
        self.tracer.on_gc(before, after);
        (before, after)
    }

    // ================================================================
    // Value display
    // ================================================================

    /// Renders a value the way `ECHO` prints it.
    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        self.display_depth(value, 0)
    }

    fn display_depth(&self, value: Value, depth: usize) -> String {
        if depth > 8 {
            return "...".to_owned();
        }
        match value {
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F32(v) => format_float(f64::from(v)),
            Value::F64(v) => format_float(v),
            Value::Bool(v) => v.to_string(),
            Value::Null => "null".to_owned(),
            Value::Function { .. } => "<function>".to_owned(),
            Value::NativeFunction(_) => "<native function>".to_owned(),
            Value::Address(addr) => format!("<address {addr:#x}>"),
            Value::CallFrame { .. } => "<call frame>".to_owned(),
            Value::TryFrame { .. } => "<try frame>".to_owned(),
            Value::HeapPtr(id) => match self.heap.get(id) {
                HeapData::Str(s) => s.to_string(),
                HeapData::Array(items) => {
                    let parts: Vec<String> = items.iter().map(|v| self.display_depth(*v, depth + 1)).collect();
                    format!("[{}]", parts.join(", "))
                }
                HeapData::Slice { array, start, end } => match self.heap.get(*array) {
                    HeapData::Array(items) => {
                        let parts: Vec<String> = items[*start..(*end).min(items.len())]
                            .iter()
                            .map(|v| self.display_depth(*v, depth + 1))
                            .collect();
                        format!("[{}]", parts.join(", "))
                    }
                    _ => "[]".to_owned(),
                },
                HeapData::Object(object) => {
                    let name = self
                        .type_infos
                        .get(object.type_id as usize)
                        .and_then(Option::as_ref)
                        .map_or("Object", |info| info.name.as_ref());
                    format!("<{name}>")
                }
                HeapData::EventArray(entries) => format!("<events x{}>", entries.len()),
                HeapData::UserData { tag, .. } => format!("<userdata {tag}>"),
            },
        }
    }

    /// The refined type name of a value, for diagnostics.
    fn value_type_name(&self, value: Value) -> String {
        match value {
            Value::HeapPtr(id) => self.heap.get(id).kind_name().to_owned(),
            other => other.type_name().to_owned(),
        }
    }

    // ================================================================
    // Exceptions
    // ================================================================

    fn make_exception(&mut self, message: &str) -> Value {
        match self.alloc_data(HeapData::Str(message.into())) {
            Ok(id) => Value::HeapPtr(id),
            // The heap is exhausted; a payload-less exception still unwinds.
            Err(HeapOverflow) => Value::Null,
        }
    }

    /// Unwinds the thread's stack to the most recent try frame. The try
    /// frame is popped, the exception value lands in register 0, and
    /// control transfers to the recorded catch target.
    fn unwind(&mut self, thread: usize, value: Value) -> Unwind {
        let message = self.display_value(value);
        self.tracer.on_throw(thread, &message);
        let t = &mut self.threads[thread];
        t.exception_occurred = true;
        loop {
            match t.stack.pop() {
                Some(Value::TryFrame { catch_addr }) => {
                    t.try_counter -= 1;
                    t.exception_occurred = false;
                    t.registers[0] = value;
                    t.pc = catch_addr as usize;
                    return Unwind::Caught { catch_addr };
                }
                Some(Value::CallFrame {
                    return_addr: HOST_SENTINEL,
                    args_to_pop,
                }) => {
                    // Clean up the host invocation's arguments, then let the
                    // exception propagate through the native boundary.
                    let keep = t.stack.len().saturating_sub(args_to_pop as usize);
                    t.stack.truncate(keep);
                    return Unwind::HostBoundary { value };
                }
                Some(_) => {}
                None => return Unwind::Unhandled { value },
            }
        }
    }

    /// Raises an exception inside the dispatcher. `Ok` means a catch target
    /// was found and execution continues; `Err` carries the loop outcome.
    fn raise(&mut self, thread: usize, value: Value) -> Result<(), RunOutcome> {
        match self.unwind(thread, value) {
            Unwind::Caught { .. } => Ok(()),
            Unwind::HostBoundary { value } => Err(RunOutcome::Unhandled(value)),
            Unwind::Unhandled { value } => {
                let message = self.display_value(value);
                eprintln!("unhandled exception in thread {thread}: {message}");
                self.good = false;
                Err(RunOutcome::Unhandled(value))
            }
        }
    }

    fn raise_message(&mut self, thread: usize, kind: ExceptionKind, detail: &str) -> Result<(), RunOutcome> {
        let message = if detail.is_empty() {
            kind.message().to_owned()
        } else {
            format!("{}: {detail}", kind.message())
        };
        let value = self.make_exception(&message);
        self.raise(thread, value)
    }

    // ================================================================
    // Calls
    // ================================================================

    /// Invokes a callable value with arguments, running bytecode to
    /// completion if needed. This is the entry natives use to call back
    /// into the program (the for-each driver, event handlers).
    pub fn invoke(&mut self, thread: usize, callee: Value, args: &[Value]) -> NativeResult {
        if let Value::NativeFunction(index) = callee {
            return self.call_native_direct(thread, index, args.to_vec());
        }
        for arg in args {
            self.stack_push(thread, *arg)
                .map_err(|()| NativeError::throw(ExceptionKind::StackOverflow, ""))?;
        }
        let nargs = u8::try_from(args.len()).map_err(|_| NativeError::throw(ExceptionKind::WrongArgumentCount, ""))?;
        match self.begin_call(thread, callee, nargs, HOST_SENTINEL) {
            Ok(true) => {}
            Ok(false) => return Ok(self.threads[thread].registers[0]),
            Err(exc) => {
                // The arguments were pushed; drop them before rethrowing.
                let t = &mut self.threads[thread];
                let keep = t.stack.len().saturating_sub(args.len());
                t.stack.truncate(keep);
                return Err(NativeError::Rethrow(exc));
            }
        }
        match self.run(thread, true) {
            RunOutcome::HostReturn => Ok(self.threads[thread].registers[0]),
            RunOutcome::Halt => Ok(Value::Null),
            RunOutcome::Unhandled(value) => Err(NativeError::Rethrow(value)),
        }
    }

    fn call_native_direct(&mut self, thread: usize, index: u32, args: Vec<Value>) -> NativeResult {
        let run = self
            .natives
            .get(index)
            .map(|entry| entry.run)
            .ok_or_else(|| NativeError::throw(ExceptionKind::NotAFunction, "unknown native"))?;
        // Keep the arguments rooted while the native may allocate.
        for arg in &args {
            self.stack_push(thread, *arg)
                .map_err(|()| NativeError::throw(ExceptionKind::StackOverflow, ""))?;
        }
        let count = args.len();
        let result = run(&mut NativeCtx {
            vm: self,
            thread,
            args,
        });
        let t = &mut self.threads[thread];
        let keep = t.stack.len().saturating_sub(count);
        t.stack.truncate(keep);
        result
    }

    fn stack_push(&mut self, thread: usize, value: Value) -> Result<(), ()> {
        let t = &mut self.threads[thread];
        if t.stack.len() >= self.config.stack_size {
            return Err(());
        }
        t.stack.push(value);
        Ok(())
    }

    /// Sets up a call to `callee` whose `nargs` arguments are already on the
    /// stack. Closure objects insert themselves as the implicit zeroth
    /// argument; variadic functions pack their extra arguments into an
    /// array. Returns `Ok(true)` if control jumped into bytecode,
    /// `Ok(false)` if a native ran to completion, `Err` with an exception
    /// value otherwise.
    fn begin_call(&mut self, thread: usize, callee: Value, nargs: u8, return_addr: u32) -> Result<bool, Value> {
        let mut callee = callee;
        let mut nargs = usize::from(nargs);

        if let Value::HeapPtr(id) = callee {
            let invoke = match self.heap.get(id) {
                HeapData::Object(object) => object
                    .member_by_hash(name_hash("$invoke"))
                    .map(|index| object.members[index as usize]),
                _ => None,
            };
            let Some(function) = invoke else {
                let name = self.value_type_name(callee);
                return Err(self.make_exception(&format!("value is not callable: '{name}'")));
            };
            let t = &mut self.threads[thread];
            if t.stack.len() >= self.config.stack_size {
                return Err(self.make_exception(ExceptionKind::StackOverflow.message()));
            }
            let at = t.stack.len() - nargs;
            t.stack.insert(at, callee);
            nargs += 1;
            callee = function;
        }

        match callee {
            Value::Function {
                addr,
                nargs: declared,
                flags,
            } => {
                let declared = usize::from(declared);
                if flags.contains(FunctionFlags::VARIADIC) {
                    let fixed = declared.saturating_sub(1);
                    if nargs < fixed {
                        return Err(self.make_exception(ExceptionKind::WrongArgumentCount.message()));
                    }
                    // Collect the extras while they are still rooted, then
                    // box them into a fresh array.
                    if self.heap.should_gc() {
                        self.run_gc();
                    }
                    let t = &mut self.threads[thread];
                    let extras = t.stack.split_off(t.stack.len() - (nargs - fixed));
                    let array = match self.heap.alloc(HeapData::Array(extras)) {
                        Ok(id) => Value::HeapPtr(id),
                        Err(HeapOverflow) => {
                            return Err(self.make_exception(ExceptionKind::HeapOverflow.message()));
                        }
                    };
                    self.threads[thread].stack.push(array);
                    nargs = fixed + 1;
                }
                let frame = Value::CallFrame {
                    return_addr,
                    args_to_pop: u8::try_from(nargs).expect("arity fits u8"),
                };
                if self.stack_push(thread, frame).is_err() {
                    return Err(self.make_exception(ExceptionKind::StackOverflow.message()));
                }
                self.threads[thread].pc = addr as usize;
                Ok(true)
            }
            Value::NativeFunction(index) => {
                let t = &self.threads[thread];
                let args = t.stack[t.stack.len() - nargs..].to_vec();
                let result = self.call_native_direct_in_place(thread, index, args);
                match result {
                    Ok(value) => {
                        let t = &mut self.threads[thread];
                        let keep = t.stack.len() - nargs;
                        t.stack.truncate(keep);
                        t.registers[0] = value;
                        Ok(false)
                    }
                    Err(NativeError::Throw(message)) => Err(self.make_exception(&message)),
                    Err(NativeError::Rethrow(value)) => Err(value),
                }
            }
            other => {
                let name = self.value_type_name(other);
                Err(self.make_exception(&format!("value is not callable: '{name}'")))
            }
        }
    }

    /// Runs a native whose arguments are already rooted on the stack.
    fn call_native_direct_in_place(&mut self, thread: usize, index: u32, args: Vec<Value>) -> NativeResult {
        let run = self
            .natives
            .get(index)
            .map(|entry| entry.run)
            .ok_or_else(|| NativeError::throw(ExceptionKind::NotAFunction, "unknown native"))?;
        run(&mut NativeCtx {
            vm: self,
            thread,
            args,
        })
    }

    // ================================================================
    // Operand fetching
    // ================================================================

    fn fetch_u8(&mut self, thread: usize) -> u8 {
        let pc = self.threads[thread].pc;
        let byte = self.code[pc];
        self.threads[thread].pc = pc + 1;
        byte
    }

    fn fetch_u16(&mut self, thread: usize) -> u16 {
        let pc = self.threads[thread].pc;
        let value = u16::from_le_bytes([self.code[pc], self.code[pc + 1]]);
        self.threads[thread].pc = pc + 2;
        value
    }

    fn fetch_u32(&mut self, thread: usize) -> u32 {
        let pc = self.threads[thread].pc;
        let value = u32::from_le_bytes([self.code[pc], self.code[pc + 1], self.code[pc + 2], self.code[pc + 3]]);
        self.threads[thread].pc = pc + 4;
        value
    }

    fn fetch_u64(&mut self, thread: usize) -> u64 {
        let pc = self.threads[thread].pc;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.code[pc..pc + 8]);
        self.threads[thread].pc = pc + 8;
        u64::from_le_bytes(raw)
    }

    // ================================================================
    // The dispatcher
    // ================================================================

    /// The main execution loop. With `nested` set, a `RET` to the host
    /// sentinel returns control to the native that invoked us.
    #[expect(clippy::too_many_lines, reason = "the opcode dispatch is one match by design")]
    fn run(&mut self, thread: usize, nested: bool) -> RunOutcome {
        loop {
            if !self.good {
                return RunOutcome::Halt;
            }
            if self.heap.should_gc() {
                self.run_gc();
            }
            let pc = self.threads[thread].pc;
            if pc >= self.code.len() {
                return RunOutcome::Halt;
            }
            let opcode = Opcode::try_from(self.fetch_u8(thread)).expect("invalid opcode in bytecode");
            self.tracer
                .on_instruction(thread, pc, opcode, self.threads[thread].stack.len());

            macro_rules! throw {
                ($kind:expr, $detail:expr) => {
                    match self.raise_message(thread, $kind, $detail) {
                        Ok(()) => continue,
                        Err(outcome) => return outcome,
                    }
                };
            }

            match opcode {
                Opcode::Nop => {}
                Opcode::LoadI32 => {
                    let rd = self.fetch_u8(thread) as usize;
                    let value = self.fetch_u32(thread) as i32;
                    self.threads[thread].registers[rd] = Value::I32(value);
                }
                Opcode::LoadI64 => {
                    let rd = self.fetch_u8(thread) as usize;
                    let value = self.fetch_u64(thread) as i64;
                    self.threads[thread].registers[rd] = Value::I64(value);
                }
                Opcode::LoadF32 => {
                    let rd = self.fetch_u8(thread) as usize;
                    let value = f32::from_bits(self.fetch_u32(thread));
                    self.threads[thread].registers[rd] = Value::F32(value);
                }
                Opcode::LoadF64 => {
                    let rd = self.fetch_u8(thread) as usize;
                    let value = f64::from_bits(self.fetch_u64(thread));
                    self.threads[thread].registers[rd] = Value::F64(value);
                }
                Opcode::LoadTrue => {
                    let rd = self.fetch_u8(thread) as usize;
                    self.threads[thread].registers[rd] = Value::Bool(true);
                }
                Opcode::LoadFalse => {
                    let rd = self.fetch_u8(thread) as usize;
                    self.threads[thread].registers[rd] = Value::Bool(false);
                }
                Opcode::LoadNull => {
                    let rd = self.fetch_u8(thread) as usize;
                    self.threads[thread].registers[rd] = Value::Null;
                }
                Opcode::LoadStatic => {
                    let rd = self.fetch_u8(thread) as usize;
                    let id = self.fetch_u16(thread) as usize;
                    self.threads[thread].registers[rd] = self.static_memory[id];
                }
                Opcode::LoadLocal => {
                    let rd = self.fetch_u8(thread) as usize;
                    let offset = self.fetch_u16(thread) as usize;
                    let t = &mut self.threads[thread];
                    let index = t.stack.len() - 1 - offset;
                    t.registers[rd] = t.stack[index];
                }
                Opcode::MovLocal => {
                    let offset = self.fetch_u16(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let t = &mut self.threads[thread];
                    let index = t.stack.len() - 1 - offset;
                    t.stack[index] = t.registers[rs];
                }
                Opcode::LoadMem => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let index = self.fetch_u8(thread) as usize;
                    let object = self.threads[thread].registers[rs];
                    match self.member_load(object, MemberKey::Index(index)) {
                        Ok(value) => self.threads[thread].registers[rd] = value,
                        Err(detail) => throw!(ExceptionKind::MemberNotFound, &detail),
                    }
                }
                Opcode::LoadMemHash => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let hash = self.fetch_u32(thread);
                    let object = self.threads[thread].registers[rs];
                    match self.member_load(object, MemberKey::Hash(hash)) {
                        Ok(value) => self.threads[thread].registers[rd] = value,
                        Err(detail) => throw!(ExceptionKind::MemberNotFound, &detail),
                    }
                }
                Opcode::LoadArrayIdx => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let ri = self.fetch_u8(thread) as usize;
                    let container = self.threads[thread].registers[rs];
                    let index = self.threads[thread].registers[ri];
                    match self.index_load(container, index) {
                        Ok(value) => self.threads[thread].registers[rd] = value,
                        Err((kind, detail)) => throw!(kind, &detail),
                    }
                }
                Opcode::LoadRef => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let t = &mut self.threads[thread];
                    let Some(offset) = t.registers[rs].as_integer() else {
                        throw!(ExceptionKind::InvalidOperation, "reference offset must be an integer");
                    };
                    let index = t.stack.len() as i64 - 1 - offset;
                    t.registers[rd] = Value::Address(u32::try_from(index).unwrap_or(0));
                }
                Opcode::LoadDeref => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let t = &mut self.threads[thread];
                    let Value::Address(index) = t.registers[rs] else {
                        throw!(ExceptionKind::InvalidOperation, "dereference of a non-reference");
                    };
                    t.registers[rd] = t.stack[index as usize];
                }
                Opcode::MovReg => {
                    let rd = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let t = &mut self.threads[thread];
                    t.registers[rd] = t.registers[rs];
                }
                Opcode::MovMem => {
                    let rd = self.fetch_u8(thread) as usize;
                    let index = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let object = self.threads[thread].registers[rd];
                    let value = self.threads[thread].registers[rs];
                    if let Err(detail) = self.member_store(object, MemberKey::Index(index), value) {
                        throw!(ExceptionKind::MemberNotFound, &detail);
                    }
                }
                Opcode::MovMemHash => {
                    let rd = self.fetch_u8(thread) as usize;
                    let hash = self.fetch_u32(thread);
                    let rs = self.fetch_u8(thread) as usize;
                    let object = self.threads[thread].registers[rd];
                    let value = self.threads[thread].registers[rs];
                    if let Err(detail) = self.member_store(object, MemberKey::Hash(hash), value) {
                        throw!(ExceptionKind::MemberNotFound, &detail);
                    }
                }
                Opcode::MovArrayIdx => {
                    let rd = self.fetch_u8(thread) as usize;
                    let ri = self.fetch_u8(thread) as usize;
                    let rs = self.fetch_u8(thread) as usize;
                    let container = self.threads[thread].registers[rd];
                    let index = self.threads[thread].registers[ri];
                    let value = self.threads[thread].registers[rs];
                    if let Err((kind, detail)) = self.index_store(container, index, value) {
                        throw!(kind, &detail);
                    }
                }
                Opcode::Push => {
                    let rs = self.fetch_u8(thread) as usize;
                    let value = self.threads[thread].registers[rs];
                    if self.stack_push(thread, value).is_err() {
                        throw!(ExceptionKind::StackOverflow, "");
                    }
                }
                Opcode::Pop => {
                    self.threads[thread].stack.pop();
                }
                Opcode::PopN => {
                    let count = self.fetch_u8(thread) as usize;
                    let t = &mut self.threads[thread];
                    let keep = t.stack.len().saturating_sub(count);
                    t.stack.truncate(keep);
                }
                Opcode::Cmp => {
                    let ra = self.fetch_u8(thread) as usize;
                    let rb = self.fetch_u8(thread) as usize;
                    let a = self.threads[thread].registers[ra];
                    let b = self.threads[thread].registers[rb];
                    match self.compare(a, b) {
                        Ok(flags) => self.threads[thread].flags = flags,
                        Err(detail) => throw!(ExceptionKind::InvalidComparison, &detail),
                    }
                }
                Opcode::Neg => {
                    let r = self.fetch_u8(thread) as usize;
                    let value = self.threads[thread].registers[r];
                    let negated = match value {
                        Value::I32(v) => Value::I32(v.wrapping_neg()),
                        Value::I64(v) => Value::I64(v.wrapping_neg()),
                        Value::F32(v) => Value::F32(-v),
                        Value::F64(v) => Value::F64(-v),
                        other => {
                            let name = self.value_type_name(other);
                            throw!(ExceptionKind::InvalidOperation, &format!("cannot negate '{name}'"));
                        }
                    };
                    self.threads[thread].registers[r] = negated;
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr => {
                    let rd = self.fetch_u8(thread) as usize;
                    let ra = self.fetch_u8(thread) as usize;
                    let rb = self.fetch_u8(thread) as usize;
                    let a = self.threads[thread].registers[ra];
                    let b = self.threads[thread].registers[rb];
                    match self.binary_op(opcode, a, b) {
                        Ok(value) => self.threads[thread].registers[rd] = value,
                        Err((kind, detail)) => throw!(kind, &detail),
                    }
                }
                Opcode::Jmp => {
                    let target = self.fetch_u32(thread);
                    self.threads[thread].pc = target as usize;
                }
                Opcode::Je => {
                    let target = self.fetch_u32(thread);
                    if self.threads[thread].flags & FLAG_EQUAL != 0 {
                        self.threads[thread].pc = target as usize;
                    }
                }
                Opcode::Jne => {
                    let target = self.fetch_u32(thread);
                    if self.threads[thread].flags & FLAG_EQUAL == 0 {
                        self.threads[thread].pc = target as usize;
                    }
                }
                Opcode::Jg => {
                    let target = self.fetch_u32(thread);
                    if self.threads[thread].flags & FLAG_GREATER != 0 {
                        self.threads[thread].pc = target as usize;
                    }
                }
                Opcode::Jge => {
                    let target = self.fetch_u32(thread);
                    if self.threads[thread].flags & (FLAG_GREATER | FLAG_EQUAL) != 0 {
                        self.threads[thread].pc = target as usize;
                    }
                }
                Opcode::Call | Opcode::Yield => {
                    let rfn = self.fetch_u8(thread) as usize;
                    let nargs = if opcode == Opcode::Call {
                        self.fetch_u8(thread)
                    } else {
                        // YIELD calls the generator callback with the one
                        // value pushed before it.
                        1
                    };
                    let callee = self.threads[thread].registers[rfn];
                    let return_addr =
                        u32::try_from(self.threads[thread].pc).expect("code section fits u32 addresses");
                    match self.begin_call(thread, callee, nargs, return_addr) {
                        Ok(_) => {}
                        Err(exc) => match self.raise(thread, exc) {
                            Ok(()) => {}
                            Err(outcome) => return outcome,
                        },
                    }
                }
                Opcode::Ret => {
                    let t = &mut self.threads[thread];
                    loop {
                        match t.stack.pop() {
                            Some(Value::CallFrame {
                                return_addr,
                                args_to_pop,
                            }) => {
                                let keep = t.stack.len().saturating_sub(args_to_pop as usize);
                                t.stack.truncate(keep);
                                if return_addr == HOST_SENTINEL {
                                    return if nested { RunOutcome::HostReturn } else { RunOutcome::Halt };
                                }
                                t.pc = return_addr as usize;
                                break;
                            }
                            Some(_) => {}
                            None => return RunOutcome::Halt,
                        }
                    }
                }
                Opcode::BeginTry => {
                    let rcatch = self.fetch_u8(thread) as usize;
                    let Value::Address(catch_addr) = self.threads[thread].registers[rcatch] else {
                        throw!(ExceptionKind::InvalidOperation, "begin_try without a catch address");
                    };
                    if self.stack_push(thread, Value::TryFrame { catch_addr }).is_err() {
                        throw!(ExceptionKind::StackOverflow, "");
                    }
                    self.threads[thread].try_counter += 1;
                }
                Opcode::EndTry => {
                    let t = &mut self.threads[thread];
                    let top = t.stack.pop();
                    assert!(
                        matches!(top, Some(Value::TryFrame { .. })),
                        "END_TRY expects the try frame on top of the stack"
                    );
                    t.try_counter -= 1;
                }
                Opcode::Throw => {
                    let rs = self.fetch_u8(thread) as usize;
                    let value = self.threads[thread].registers[rs];
                    match self.raise(thread, value) {
                        Ok(()) => {}
                        Err(outcome) => return outcome,
                    }
                }
                Opcode::New => {
                    let rd = self.fetch_u8(thread) as usize;
                    let id = self.fetch_u16(thread);
                    match self.new_object(id) {
                        Ok(value) => self.threads[thread].registers[rd] = value,
                        Err((kind, detail)) => throw!(kind, &detail),
                    }
                }
                Opcode::NewArray => {
                    let rd = self.fetch_u8(thread) as usize;
                    let count = self.fetch_u16(thread) as usize;
                    match self.alloc_data(HeapData::Array(vec![Value::Null; count])) {
                        Ok(id) => self.threads[thread].registers[rd] = Value::HeapPtr(id),
                        Err(HeapOverflow) => throw!(ExceptionKind::HeapOverflow, ""),
                    }
                }
                Opcode::NewString => {
                    let rd = self.fetch_u8(thread) as usize;
                    let id = self.fetch_u16(thread) as usize;
                    let source = match self.static_memory[id] {
                        Value::HeapPtr(heap_id) => match self.heap.get(heap_id) {
                            HeapData::Str(s) => s.clone(),
                            _ => Box::from(""),
                        },
                        _ => Box::from(""),
                    };
                    match self.alloc_data(HeapData::Str(source)) {
                        Ok(heap_id) => self.threads[thread].registers[rd] = Value::HeapPtr(heap_id),
                        Err(HeapOverflow) => throw!(ExceptionKind::HeapOverflow, ""),
                    }
                }
                Opcode::Echo => {
                    let rs = self.fetch_u8(thread) as usize;
                    let text = self.display_value(self.threads[thread].registers[rs]);
                    self.writer.write(&text);
                }
                Opcode::EchoNewline => {
                    self.writer.newline();
                }
                Opcode::Exit => return RunOutcome::Halt,
            }
        }
    }

    // ================================================================
    // Instruction semantics
    // ================================================================

    fn object_of(&self, value: Value) -> Result<(HeapId, &ObjectData), String> {
        let Value::HeapPtr(id) = value else {
            return Err(format!("'{}' has no members", self.value_type_name(value)));
        };
        match self.heap.get(id) {
            HeapData::Object(object) => Ok((id, object)),
            other => Err(format!("'{}' has no members", other.kind_name())),
        }
    }

    fn member_load(&self, object: Value, key: MemberKey) -> Result<Value, String> {
        let (_, data) = self.object_of(object)?;
        let index = match key {
            MemberKey::Index(index) => index,
            MemberKey::Hash(hash) => data
                .member_by_hash(hash)
                .ok_or_else(|| "no member with that name".to_owned())? as usize,
        };
        data.members
            .get(index)
            .copied()
            .ok_or_else(|| "member index out of range".to_owned())
    }

    fn member_store(&mut self, object: Value, key: MemberKey, value: Value) -> Result<(), String> {
        let (id, data) = self.object_of(object)?;
        let index = match key {
            MemberKey::Index(index) => index,
            MemberKey::Hash(hash) => data
                .member_by_hash(hash)
                .ok_or_else(|| "no member with that name".to_owned())? as usize,
        };
        if index >= data.members.len() {
            return Err("member index out of range".to_owned());
        }
        let HeapData::Object(data) = self.heap.get_mut(id) else {
            unreachable!("object_of verified the cell kind");
        };
        data.members[index] = value;
        Ok(())
    }

    fn index_load(&mut self, container: Value, index: Value) -> Result<Value, (ExceptionKind, String)> {
        let Some(i) = index.as_integer() else {
            return Err((
                ExceptionKind::InvalidOperation,
                format!("index must be an integer, found '{}'", self.value_type_name(index)),
            ));
        };
        let Value::HeapPtr(id) = container else {
            return Err((
                ExceptionKind::InvalidOperation,
                format!("'{}' is not indexable", self.value_type_name(container)),
            ));
        };
        let i = usize::try_from(i).map_err(|_| (ExceptionKind::OutOfBounds, String::new()))?;
        match self.heap.get(id) {
            HeapData::Array(items) => items
                .get(i)
                .copied()
                .ok_or((ExceptionKind::OutOfBounds, String::new())),
            HeapData::Slice { array, start, end } => {
                let (array, start, end) = (*array, *start, *end);
                if start + i >= end {
                    return Err((ExceptionKind::OutOfBounds, String::new()));
                }
                match self.heap.get(array) {
                    HeapData::Array(items) => items
                        .get(start + i)
                        .copied()
                        .ok_or((ExceptionKind::OutOfBounds, String::new())),
                    _ => Err((ExceptionKind::InvalidOperation, "slice backing is not an array".to_owned())),
                }
            }
            HeapData::Str(s) => {
                let ch = s
                    .chars()
                    .nth(i)
                    .ok_or((ExceptionKind::OutOfBounds, String::new()))?;
                let id = self
                    .alloc_data(HeapData::Str(ch.to_string().into_boxed_str()))
                    .map_err(|HeapOverflow| (ExceptionKind::HeapOverflow, String::new()))?;
                Ok(Value::HeapPtr(id))
            }
            other => Err((
                ExceptionKind::InvalidOperation,
                format!("'{}' is not indexable", other.kind_name()),
            )),
        }
    }

    fn index_store(&mut self, container: Value, index: Value, value: Value) -> Result<(), (ExceptionKind, String)> {
        let Some(i) = index.as_integer() else {
            return Err((ExceptionKind::InvalidOperation, "index must be an integer".to_owned()));
        };
        let i = usize::try_from(i).map_err(|_| (ExceptionKind::OutOfBounds, String::new()))?;
        let Value::HeapPtr(id) = container else {
            return Err((
                ExceptionKind::InvalidOperation,
                format!("'{}' is not indexable", self.value_type_name(container)),
            ));
        };
        match self.heap.get_mut(id) {
            HeapData::Array(items) => {
                let slot = items.get_mut(i).ok_or((ExceptionKind::OutOfBounds, String::new()))?;
                *slot = value;
                Ok(())
            }
            HeapData::Slice { array, start, end } => {
                let (array, start, end) = (*array, *start, *end);
                if start + i >= end {
                    return Err((ExceptionKind::OutOfBounds, String::new()));
                }
                match self.heap.get_mut(array) {
                    HeapData::Array(items) => {
                        let slot = items
                            .get_mut(start + i)
                            .ok_or((ExceptionKind::OutOfBounds, String::new()))?;
                        *slot = value;
                        Ok(())
                    }
                    _ => Err((ExceptionKind::InvalidOperation, "slice backing is not an array".to_owned())),
                }
            }
            other => Err((
                ExceptionKind::InvalidOperation,
                format!("'{}' is not indexable", other.kind_name()),
            )),
        }
    }

    fn new_object(&mut self, type_id: u16) -> Result<Value, (ExceptionKind, String)> {
        let info = self
            .type_infos
            .get(type_id as usize)
            .and_then(Option::as_ref)
            .ok_or((ExceptionKind::InvalidOperation, "NEW with a non-type static".to_owned()))?;
        let mut members = vec![Value::Null; info.members.len()];
        let mut name_index = AHashMap::with_capacity(info.members.len());
        for (i, name) in info.members.iter().enumerate() {
            let slot = u8::try_from(i).expect("member count fits u8");
            name_index.insert(name_hash(name), slot);
            if name.as_ref() == crate::types::PROTO_MEMBER {
                members[i] = self.static_memory[type_id as usize];
            }
        }
        let object = ObjectData {
            type_id,
            members,
            name_index,
        };
        let id = self
            .alloc_data(HeapData::Object(object))
            .map_err(|HeapOverflow| (ExceptionKind::HeapOverflow, String::new()))?;
        Ok(Value::HeapPtr(id))
    }

    /// Comparison semantics: pointer identity short-circuits to equal, null
    /// on one side is not-equal, same-kind heap cells dispatch to their own
    /// equality, functions compare by ⟨address, arity⟩, natives by index;
    /// anything else is a comparison exception.
    fn compare(&self, a: Value, b: Value) -> Result<u8, String> {
        use std::cmp::Ordering;
        // Integers compare exactly before any float widening.
        if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
            return Ok(match x.cmp(&y) {
                Ordering::Equal => FLAG_EQUAL,
                Ordering::Greater => FLAG_GREATER,
                Ordering::Less => FLAG_NONE,
            });
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(match x.partial_cmp(&y) {
                Some(Ordering::Equal) => FLAG_EQUAL,
                Some(Ordering::Greater) => FLAG_GREATER,
                _ => FLAG_NONE,
            });
        }
        match (a, b) {
            (Value::Null, Value::Null) => Ok(FLAG_EQUAL),
            (Value::Null, _) | (_, Value::Null) => Ok(FLAG_NONE),
            (Value::Bool(x), Value::Bool(y)) => Ok(if x == y { FLAG_EQUAL } else { FLAG_NONE }),
            (Value::HeapPtr(x), Value::HeapPtr(y)) => {
                if x == y {
                    return Ok(FLAG_EQUAL);
                }
                match (self.heap.get(x), self.heap.get(y)) {
                    (HeapData::Str(s1), HeapData::Str(s2)) => Ok(match s1.cmp(s2) {
                        Ordering::Equal => FLAG_EQUAL,
                        Ordering::Greater => FLAG_GREATER,
                        Ordering::Less => FLAG_NONE,
                    }),
                    (d1, d2) if std::mem::discriminant(d1) == std::mem::discriminant(d2) => {
                        // Same kind, different identity: containers compare
                        // by identity.
                        Ok(FLAG_NONE)
                    }
                    (d1, d2) => Err(format!("cannot compare '{}' with '{}'", d1.kind_name(), d2.kind_name())),
                }
            }
            (
                Value::Function { addr: a1, nargs: n1, .. },
                Value::Function { addr: a2, nargs: n2, .. },
            ) => Ok(if a1 == a2 && n1 == n2 { FLAG_EQUAL } else { FLAG_NONE }),
            (Value::NativeFunction(x), Value::NativeFunction(y)) => {
                Ok(if x == y { FLAG_EQUAL } else { FLAG_NONE })
            }
            (Value::Address(x), Value::Address(y)) => Ok(if x == y { FLAG_EQUAL } else { FLAG_NONE }),
            (a, b) => Err(format!(
                "cannot compare '{}' with '{}'",
                self.value_type_name(a),
                self.value_type_name(b)
            )),
        }
    }

    /// Binary arithmetic with lattice promotion, string concatenation and
    /// array append.
    fn binary_op(&mut self, opcode: Opcode, a: Value, b: Value) -> Result<Value, (ExceptionKind, String)> {
        use Opcode::{Add, And, Div, Mod, Mul, Or, Shl, Shr, Sub, Xor};

        // Integer-only bitwise and shift operators, with a boolean form for
        // AND/OR/XOR.
        if matches!(opcode, And | Or | Xor | Shl | Shr) {
            if let (Value::Bool(x), Value::Bool(y)) = (a, b) {
                let result = match opcode {
                    And => x && y,
                    Or => x || y,
                    Xor => x != y,
                    _ => return Err(self.invalid_op(a, b)),
                };
                return Ok(Value::Bool(result));
            }
            let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) else {
                return Err(self.invalid_op(a, b));
            };
            let result = match opcode {
                And => x & y,
                Or => x | y,
                Xor => x ^ y,
                Shl => x.wrapping_shl(y as u32 & 63),
                Shr => x.wrapping_shr(y as u32 & 63),
                _ => unreachable!("filtered above"),
            };
            return Ok(narrow_int(a, b, result));
        }

        // Numeric lattice.
        if a.numeric_rank().is_some() && b.numeric_rank().is_some() {
            let float = matches!(a, Value::F32(_) | Value::F64(_)) || matches!(b, Value::F32(_) | Value::F64(_));
            if float {
                let (x, y) = (a.as_number().expect("numeric"), b.as_number().expect("numeric"));
                if matches!(opcode, Div | Mod) && y == 0.0 {
                    return Err((ExceptionKind::DivisionByZero, String::new()));
                }
                let result = match opcode {
                    Add => x + y,
                    Sub => x - y,
                    Mul => x * y,
                    Div => x / y,
                    Mod => x % y,
                    _ => unreachable!("arithmetic opcodes only"),
                };
                return Ok(Value::F64(result));
            }
            let (x, y) = (a.as_integer().expect("integer"), b.as_integer().expect("integer"));
            if matches!(opcode, Div | Mod) && y == 0 {
                return Err((ExceptionKind::DivisionByZero, String::new()));
            }
            let result = match opcode {
                Add => x.wrapping_add(y),
                Sub => x.wrapping_sub(y),
                Mul => x.wrapping_mul(y),
                Div => x.wrapping_div(y),
                Mod => x.wrapping_rem(y),
                _ => unreachable!("arithmetic opcodes only"),
            };
            return Ok(narrow_int(a, b, result));
        }

        if opcode == Add {
            // String + String concatenates into a fresh immutable string.
            if let (Value::HeapPtr(x), Value::HeapPtr(y)) = (a, b) {
                match (self.heap.get(x), self.heap.get(y)) {
                    (HeapData::Str(s1), HeapData::Str(s2)) => {
                        let mut out = s1.to_string();
                        out.push_str(s2);
                        let id = self
                            .alloc_data(HeapData::Str(out.into_boxed_str()))
                            .map_err(|HeapOverflow| (ExceptionKind::HeapOverflow, String::new()))?;
                        return Ok(Value::HeapPtr(id));
                    }
                    (HeapData::Array(a1), HeapData::Array(a2)) => {
                        let mut out = a1.clone();
                        out.extend_from_slice(a2);
                        let id = self
                            .alloc_data(HeapData::Array(out))
                            .map_err(|HeapOverflow| (ExceptionKind::HeapOverflow, String::new()))?;
                        return Ok(Value::HeapPtr(id));
                    }
                    _ => {}
                }
            }
            // Array + value appends.
            if let Value::HeapPtr(x) = a {
                if let HeapData::Array(items) = self.heap.get(x) {
                    let mut out = items.clone();
                    out.push(b);
                    let id = self
                        .alloc_data(HeapData::Array(out))
                        .map_err(|HeapOverflow| (ExceptionKind::HeapOverflow, String::new()))?;
                    return Ok(Value::HeapPtr(id));
                }
            }
        }
        Err(self.invalid_op(a, b))
    }

    fn invalid_op(&self, a: Value, b: Value) -> (ExceptionKind, String) {
        (
            ExceptionKind::InvalidOperation,
            format!(
                "between '{}' and '{}'",
                self.value_type_name(a),
                self.value_type_name(b)
            ),
        )
    }
}

/// Member addressing modes shared by the load/store paths.
#[derive(Debug, Clone, Copy)]
enum MemberKey {
    Index(usize),
    Hash(u32),
}

/// Integer results stay I32 when both operands were I32, otherwise widen.
fn narrow_int(a: Value, b: Value, result: i64) -> Value {
    if matches!(a, Value::I32(_)) && matches!(b, Value::I32(_)) {
        if let Ok(v) = i32::try_from(result) {
            return Value::I32(v);
        }
    }
    Value::I64(result)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{io::NoPrint, tracer::NoopTracer};

    fn empty_program() -> Program {
        Program {
            statics: vec![StaticObject::String("boot".into())],
            code: vec![u8::from(Opcode::Exit)],
        }
    }

    fn with_vm<T>(f: impl FnOnce(&mut VmState<'_>) -> T) -> T {
        let natives = NativeRegistry::standard();
        let program = empty_program();
        let mut writer = NoPrint;
        let mut tracer = NoopTracer;
        let mut vm = VmState::new(&program, &natives, VmConfig::default(), &mut writer, &mut tracer)
            .expect("program loads");
        f(&mut vm)
    }

    #[test]
    fn execute_empty_program_exits_cleanly() {
        let exit = with_vm(|vm| vm.execute());
        assert_eq!(exit, 0);
    }

    #[test]
    fn gc_roots_cover_every_thread_and_static_memory() {
        with_vm(|vm| {
            let on_main = vm.alloc_data(HeapData::Str("main".into())).expect("alloc");
            vm.thread_mut(0).stack.push(Value::HeapPtr(on_main));

            let spawned = vm.spawn_thread().expect("room for a second thread");
            let on_spawned = vm.alloc_data(HeapData::Str("spawned".into())).expect("alloc");
            vm.thread_mut(spawned).registers[3] = Value::HeapPtr(on_spawned);

            let garbage = vm.alloc_data(HeapData::Str("garbage".into())).expect("alloc");

            vm.run_gc();
            assert!(vm.heap.is_live(on_main));
            assert!(vm.heap.is_live(on_spawned));
            assert!(!vm.heap.is_live(garbage));
            // Static strings stay rooted by the static table.
            let Value::HeapPtr(static_str) = vm.static_memory[0] else {
                panic!("static string is heap-backed");
            };
            assert!(vm.heap.is_live(static_str));
        });
    }

    #[test]
    fn thread_count_is_bounded() {
        with_vm(|vm| {
            let mut spawned = 0;
            while vm.spawn_thread().is_some() {
                spawned += 1;
            }
            assert_eq!(spawned + 1, vm.config.max_threads);
        });
    }

    #[test]
    fn comparison_semantics() {
        with_vm(|vm| {
            // Numeric lattice comparison.
            assert_eq!(vm.compare(Value::I32(3), Value::I64(3)).unwrap(), FLAG_EQUAL);
            assert_eq!(vm.compare(Value::I64(5), Value::F64(4.5)).unwrap(), FLAG_GREATER);
            // Null never equals a non-null.
            assert_eq!(vm.compare(Value::Null, Value::I32(0)).unwrap(), FLAG_NONE);
            assert_eq!(vm.compare(Value::Null, Value::Null).unwrap(), FLAG_EQUAL);
            // Pointer identity short-circuits.
            let a = vm.alloc_data(HeapData::Array(vec![])).expect("alloc");
            assert_eq!(vm.compare(Value::HeapPtr(a), Value::HeapPtr(a)).unwrap(), FLAG_EQUAL);
            // Same-kind cells dispatch to the cell's equality.
            let s1 = vm.alloc_data(HeapData::Str("abc".into())).expect("alloc");
            let s2 = vm.alloc_data(HeapData::Str("abc".into())).expect("alloc");
            assert_eq!(vm.compare(Value::HeapPtr(s1), Value::HeapPtr(s2)).unwrap(), FLAG_EQUAL);
            // Functions compare by address and arity.
            let f = |addr, nargs| Value::Function {
                addr,
                nargs,
                flags: FunctionFlags::empty(),
            };
            assert_eq!(vm.compare(f(10, 2), f(10, 2)).unwrap(), FLAG_EQUAL);
            assert_eq!(vm.compare(f(10, 2), f(10, 3)).unwrap(), FLAG_NONE);
            // Mismatched kinds throw.
            assert!(vm.compare(Value::Bool(true), Value::I32(1)).is_err());
        });
    }

    #[test]
    fn arithmetic_promotes_along_the_lattice() {
        with_vm(|vm| {
            assert_eq!(vm.binary_op(Opcode::Add, Value::I32(1), Value::I32(2)).unwrap(), Value::I32(3));
            assert_eq!(
                vm.binary_op(Opcode::Add, Value::I32(1), Value::I64(2)).unwrap(),
                Value::I64(3)
            );
            assert_eq!(
                vm.binary_op(Opcode::Mul, Value::I32(2), Value::F64(1.5)).unwrap(),
                Value::F64(3.0)
            );
            let err = vm.binary_op(Opcode::Div, Value::I32(1), Value::I32(0)).unwrap_err();
            assert_eq!(err.0, ExceptionKind::DivisionByZero);
        });
    }

    #[test]
    fn string_concat_allocates_a_fresh_cell() {
        with_vm(|vm| {
            let a = vm.alloc_data(HeapData::Str("con".into())).expect("alloc");
            let b = vm.alloc_data(HeapData::Str("cat".into())).expect("alloc");
            let result = vm
                .binary_op(Opcode::Add, Value::HeapPtr(a), Value::HeapPtr(b))
                .unwrap();
            assert_eq!(vm.display_value(result), "concat");
            let Value::HeapPtr(id) = result else {
                panic!("concat result is heap-backed");
            };
            assert_ne!(id, a);
            assert_ne!(id, b);
        });
    }

    #[test]
    fn display_values() {
        with_vm(|vm| {
            assert_eq!(vm.display_value(Value::I32(7)), "7");
            assert_eq!(vm.display_value(Value::F64(2.5)), "2.5");
            assert_eq!(vm.display_value(Value::Bool(false)), "false");
            assert_eq!(vm.display_value(Value::Null), "null");
            let arr = vm
                .alloc_data(HeapData::Array(vec![Value::I32(1), Value::I32(2)]))
                .expect("alloc");
            assert_eq!(vm.display_value(Value::HeapPtr(arr)), "[1, 2]");
        });
    }

    #[test]
    fn cancellation_halts_the_dispatcher() {
        let natives = NativeRegistry::standard();
        // An infinite loop: JMP 0.
        let program = Program {
            statics: vec![],
            code: vec![u8::from(Opcode::Jmp), 0, 0, 0, 0],
        };
        let mut writer = NoPrint;
        let mut tracer = NoopTracer;
        let mut vm = VmState::new(&program, &natives, VmConfig::default(), &mut writer, &mut tracer)
            .expect("program loads");
        vm.good = false;
        assert_eq!(vm.execute(), 1);
    }
}
