//! Execution tracing hooks for the VM.
//!
//! The dispatcher is generic over a [`VmTracer`]; with [`NoopTracer`] the
//! hooks monomorphize away entirely. [`StderrTracer`] prints one line per
//! instruction and is useful when debugging emitted bytecode.

use crate::bytecode::Opcode;

/// Observer interface for VM execution.
pub trait VmTracer {
    /// Called before each instruction is executed.
    fn on_instruction(&mut self, thread: usize, pc: usize, opcode: Opcode, stack_depth: usize) {
        let _ = (thread, pc, opcode, stack_depth);
    }

    /// Called when a garbage collection cycle completes.
    fn on_gc(&mut self, live_before: usize, live_after: usize) {
        let _ = (live_before, live_after);
    }

    /// Called when an exception begins unwinding.
    fn on_throw(&mut self, thread: usize, message: &str) {
        let _ = (thread, message);
    }
}

/// Tracer that does nothing; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that logs every instruction to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, thread: usize, pc: usize, opcode: Opcode, stack_depth: usize) {
        eprintln!("[t{thread}] {pc:06x} {opcode} (depth {stack_depth})");
    }

    fn on_gc(&mut self, live_before: usize, live_after: usize) {
        eprintln!("[gc] {live_before} -> {live_after} live objects");
    }

    fn on_throw(&mut self, thread: usize, message: &str) {
        eprintln!("[t{thread}] throw: {message}");
    }
}
