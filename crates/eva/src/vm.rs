//! The dispatch loop: owns the operand stack, the call stack of activation
//! frames, the heap, and the global table, and interprets one `Code` byte
//! at a time.

use crate::bytecode::code::Code;
use crate::bytecode::op::{CompareOp, Op};
use crate::error::{EvaError, EvaResult, RuntimeError};
use crate::global::Global;
use crate::heap::{Cell, Function, Heap, HeapObject, Native, ObjectId};
use crate::parse;
use crate::resource::{NoLimitTracker, ResourceTracker};
use crate::scope;
use crate::value::Value;
use crate::EvaObject;

/// Fixed operand-stack capacity.
pub const STACK_LIMIT: usize = 512;

/// A saved caller activation, pushed at `CALL` and popped at `RETURN`.
struct Frame {
    return_ip: usize,
    saved_bp: usize,
    saved_fn: ObjectId,
}

/// The native-function registration signature matches
/// [`crate::heap::NativeFn`]: it reads its arguments with [`Vm::peek`] and
/// pushes exactly one result value.
pub struct Vm {
    heap: Heap,
    global: Global,
    stack: Vec<Value>,
    bp: usize,
    ip: usize,
    current_fn: ObjectId,
    frames: Vec<Frame>,
    tracker: Box<dyn ResourceTracker>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A VM with the default, effectively unbounded [`NoLimitTracker`]
    /// policy and the pre-registered globals (`VERSION`, `native-square`).
    pub fn new() -> Self {
        Self::with_tracker(NoLimitTracker)
    }

    pub fn with_tracker(tracker: impl ResourceTracker + 'static) -> Self {
        let mut heap = Heap::new();
        let mut global = Global::new();
        global.add_const("VERSION", 1.0);
        global.add_native_function(&mut heap, "native-square", 1, native_square);

        // `current_fn`/`bp`/`ip` are meaningless until `exec` installs a
        // program; a dummy placeholder function keeps the type total
        // without an `Option` threaded through every opcode handler.
        let placeholder_code = heap.allocate(HeapObject::Code(Code::new("<uninitialized>", 0)));
        let placeholder_fn = heap.allocate(HeapObject::Function(Function { code: placeholder_code, cells: Vec::new() }));

        Self {
            heap,
            global,
            stack: Vec::with_capacity(STACK_LIMIT),
            bp: 0,
            ip: 0,
            current_fn: placeholder_fn,
            frames: Vec::new(),
            tracker: Box::new(tracker),
        }
    }

    /// Registers an additional native function before [`Vm::exec`] runs, so
    /// embedders can extend the global environment before a program sees
    /// it.
    pub fn define_native(&mut self, name: &str, arity: usize, callback: crate::heap::NativeFn) {
        self.global.add_native_function(&mut self.heap, name, arity, callback);
    }

    /// Parses, analyzes, compiles, and runs `source` to completion. Consumes
    /// no state across calls beyond what [`Vm::define_native`]
    /// pre-registered.
    pub fn exec(&mut self, source: &str) -> EvaResult<EvaObject> {
        let program = parse::parse_program(source).map_err(EvaError::from)?;
        let scopes = scope::analyze(&program).map_err(EvaError::from)?;
        let main_code = crate::bytecode::compiler::compile(&mut self.heap, &mut self.global, &program, &scopes)
            .map_err(EvaError::from)?;
        let main_fn = self.heap.allocate(HeapObject::Function(Function { code: main_code, cells: Vec::new() }));

        self.stack.clear();
        self.frames.clear();
        self.stack.push(Value::Object(main_fn));
        self.bp = 0;
        self.ip = 0;
        self.current_fn = main_fn;

        let result = self.run().map_err(EvaError::from)?;
        Ok(self.to_eva_object(result))
    }

    fn to_eva_object(&self, value: Value) -> EvaObject {
        match value {
            Value::Number(n) => EvaObject::Number(n),
            Value::Bool(b) => EvaObject::Bool(b),
            Value::Object(id) => match self.heap.get(id) {
                HeapObject::Str(s) => EvaObject::Str(s.clone()),
                _ => EvaObject::Callable,
            },
        }
    }

    /// Read-only access for the disassembler and tests that want to print a
    /// value with string contents resolved.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn global(&self) -> &Global {
        &self.global
    }

    // --- operand stack --------------------------------------------------

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    /// Reads the value `distance` slots below the top without removing it.
    /// This is how native callbacks read their arguments.
    pub fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - distance])
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        self.heap.type_name(value)
    }

    // --- code access -----------------------------------------------------

    fn current_code(&self) -> &Code {
        let func = self.heap.get_function(self.current_fn);
        self.heap.get_code(func.code)
    }

    fn read_u8(&mut self) -> Result<u8, RuntimeError> {
        let code = self.current_code();
        let byte = *code.bytecode.get(self.ip).ok_or(RuntimeError::StackUnderflow)?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, RuntimeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    // --- dispatch loop -----------------------------------------------------

    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let opcode_byte = self.read_u8()?;
            let opcode = Op::from_repr(opcode_byte).ok_or(RuntimeError::InvalidOpcode(opcode_byte))?;
            log::trace!("dispatch {opcode:?} ip={} bp={} sp={}", self.ip - 1, self.bp, self.stack.len());

            match opcode {
                Op::Halt => return self.pop(),
                Op::Const => {
                    let idx = self.read_u8()? as usize;
                    let value = *self.current_code().constants.get(idx).ok_or(RuntimeError::InvalidIndex { what: "constant", index: idx })?;
                    self.push(value)?;
                }
                Op::Add => self.binary_add()?,
                Op::Sub => self.binary_numeric("-", |a, b| a - b)?,
                Op::Mul => self.binary_numeric("*", |a, b| a * b)?,
                Op::Div => self.binary_numeric("/", |a, b| a / b)?,
                Op::Compare => self.compare()?,
                Op::JmpIfFalse => {
                    let target = self.read_u16()? as usize;
                    let cond = self.pop()?;
                    if !cond.truthy() {
                        self.ip = target;
                    }
                }
                Op::Jmp => {
                    let target = self.read_u16()? as usize;
                    self.ip = target;
                }
                Op::GetGlobal => {
                    let idx = self.read_u8()? as usize;
                    self.push(self.global.get(idx))?;
                }
                Op::SetGlobal => {
                    let idx = self.read_u8()? as usize;
                    let value = self.pop()?;
                    self.global.set(idx, value)?;
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::GetLocal => {
                    let slot = self.read_u8()? as usize;
                    let abs = self.bp + slot;
                    let value = *self.stack.get(abs).ok_or(RuntimeError::InvalidIndex { what: "local", index: slot })?;
                    self.push(value)?;
                }
                Op::SetLocal => {
                    let slot = self.read_u8()? as usize;
                    let abs = self.bp + slot;
                    let value = self.peek(0)?;
                    if abs >= self.stack.len() {
                        return Err(RuntimeError::InvalidIndex { what: "local", index: slot });
                    }
                    self.stack[abs] = value;
                }
                Op::ScopeExit => {
                    let n = self.read_u8()? as usize;
                    self.scope_exit(n)?;
                }
                Op::Call => {
                    let argc = self.read_u8()? as usize;
                    self.call(argc)?;
                }
                Op::Return => self.do_return()?,
                Op::GetCell => {
                    let idx = self.read_u8()? as usize;
                    let func = self.heap.get_function(self.current_fn);
                    let cell_id = *func.cells.get(idx).ok_or(RuntimeError::InvalidIndex { what: "cell", index: idx })?;
                    self.push(self.heap.get_cell(cell_id).value)?;
                }
                Op::SetCell => {
                    let idx = self.read_u8()? as usize;
                    let value = self.peek(0)?;
                    self.set_cell(idx, value)?;
                }
                Op::LoadCell => {
                    let idx = self.read_u8()? as usize;
                    let func = self.heap.get_function(self.current_fn);
                    let cell_id = *func.cells.get(idx).ok_or(RuntimeError::InvalidIndex { what: "cell", index: idx })?;
                    self.push(Value::Object(cell_id))?;
                }
                Op::MakeFunction => {
                    let capture_count = self.read_u8()? as usize;
                    self.make_function(capture_count)?;
                }
            }
        }
    }

    fn binary_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Object(x), Value::Object(y))
                if matches!(self.heap.get(x), HeapObject::Str(_)) && matches!(self.heap.get(y), HeapObject::Str(_)) =>
            {
                let mut s = self.heap.get_str(x).to_string();
                s.push_str(self.heap.get_str(y));
                self.maybe_gc();
                let id = self.heap.allocate(HeapObject::Str(s));
                self.push(Value::Object(id))
            }
            (a, b) => Err(RuntimeError::TypeError { op: "+", lhs: self.type_name(a), rhs: self.type_name(b) }),
        }
    }

    fn binary_numeric(&mut self, op: &'static str, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(f(x, y))),
            (a, b) => Err(RuntimeError::TypeError { op, lhs: self.type_name(a), rhs: self.type_name(b) }),
        }
    }

    fn compare(&mut self) -> Result<(), RuntimeError> {
        let op_byte = self.read_u8()?;
        let op = CompareOp::from_repr(op_byte).ok_or(RuntimeError::InvalidIndex { what: "compare op", index: op_byte as usize })?;
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Number(x), Value::Number(y)) => Self::apply_compare(op, x.partial_cmp(&y)),
            (Value::Object(x), Value::Object(y))
                if matches!(self.heap.get(x), HeapObject::Str(_)) && matches!(self.heap.get(y), HeapObject::Str(_)) =>
            {
                Self::apply_compare(op, Some(self.heap.get_str(x).cmp(self.heap.get_str(y))))
            }
            (a, b) => return Err(RuntimeError::TypeError { op: "compare", lhs: self.type_name(a), rhs: self.type_name(b) }),
        };
        self.push(Value::Bool(result))
    }

    fn apply_compare(op: CompareOp, ordering: Option<std::cmp::Ordering>) -> bool {
        use std::cmp::Ordering::*;
        match (op, ordering) {
            (CompareOp::Lt, Some(Less)) => true,
            (CompareOp::Gt, Some(Greater)) => true,
            (CompareOp::Eq, Some(Equal)) => true,
            (CompareOp::Ge, Some(Greater | Equal)) => true,
            (CompareOp::Le, Some(Less | Equal)) => true,
            (CompareOp::Ne, Some(Less | Greater)) => true,
            (CompareOp::Ne, None) => true, // NaN != anything, including NaN
            _ => false,
        }
    }

    /// `stack[sp-1-n] = stack[sp-1]; sp -= n`.
    fn scope_exit(&mut self, n: usize) -> Result<(), RuntimeError> {
        if n == 0 {
            return Ok(());
        }
        let len = self.stack.len();
        if n >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        self.stack[len - 1 - n] = self.stack[len - 1];
        self.stack.truncate(len - n);
        Ok(())
    }

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc)?;
        let callee_id = callee.as_object().ok_or(RuntimeError::NotCallable(self.type_name(callee)))?;

        // Extract an owned classification before dispatching, so the
        // `call_native`/`call_function` branches don't hold `self.heap`
        // borrowed while they go on to mutate the VM.
        enum Callee {
            Native(Native),
            Function,
            Other(&'static str),
        }
        let kind = match self.heap.get(callee_id) {
            HeapObject::Native(native) => Callee::Native(native.clone()),
            HeapObject::Function(_) => Callee::Function,
            other => Callee::Other(other.type_name()),
        };

        match kind {
            Callee::Native(native) => self.call_native(native, argc),
            Callee::Function => self.call_function(callee_id, argc),
            Callee::Other(name) => Err(RuntimeError::NotCallable(name)),
        }
    }

    fn call_native(&mut self, native: Native, argc: usize) -> Result<(), RuntimeError> {
        if native.arity != argc {
            return Err(RuntimeError::ArityMismatch { expected: native.arity, got: argc });
        }
        (native.callback)(self)?;
        let result = self.pop()?;
        let len = self.stack.len();
        self.stack.truncate(len - argc - 1);
        self.push(result)
    }

    fn call_function(&mut self, callee_id: ObjectId, argc: usize) -> Result<(), RuntimeError> {
        let code_id = self.heap.get_function(callee_id).code;
        let (arity, free_count) = {
            let code = self.heap.get_code(code_id);
            (code.arity, code.free_count)
        };
        if arity != argc {
            return Err(RuntimeError::ArityMismatch { expected: arity, got: argc });
        }

        self.tracker.check_call_depth(self.frames.len() + 1)?;

        self.frames.push(Frame { return_ip: self.ip, saved_bp: self.bp, saved_fn: self.current_fn });
        self.heap.get_function_mut(callee_id).cells.truncate(free_count);

        self.current_fn = callee_id;
        self.bp = self.stack.len() - argc - 1;
        self.ip = 0;
        Ok(())
    }

    fn do_return(&mut self) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
        self.ip = frame.return_ip;
        self.bp = frame.saved_bp;
        self.current_fn = frame.saved_fn;
        Ok(())
    }

    fn set_cell(&mut self, idx: usize, value: Value) -> Result<(), RuntimeError> {
        let len = self.heap.get_function(self.current_fn).cells.len();
        if idx < len {
            let cell_id = self.heap.get_function(self.current_fn).cells[idx];
            self.heap.get_cell_mut(cell_id).value = value;
        } else if idx == len {
            self.maybe_gc();
            let cell_id = self.heap.allocate(HeapObject::Cell(Cell { value }));
            self.heap.get_function_mut(self.current_fn).cells.push(cell_id);
        } else {
            return Err(RuntimeError::InvalidIndex { what: "cell", index: idx });
        }
        Ok(())
    }

    fn make_function(&mut self, capture_count: usize) -> Result<(), RuntimeError> {
        let code_value = self.pop()?;
        let code_id = code_value.as_object().ok_or(RuntimeError::NotCallable(self.type_name(code_value)))?;

        let mut cells = Vec::with_capacity(capture_count);
        for _ in 0..capture_count {
            let v = self.pop()?;
            cells.push(v.as_object().ok_or(RuntimeError::InvalidIndex { what: "cell capture", index: cells.len() })?);
        }
        cells.reverse();

        self.maybe_gc();
        let func_id = self.heap.allocate(HeapObject::Function(Function { code: code_id, cells }));
        self.push(Value::Object(func_id))
    }

    // --- garbage collection ----------------------------------------------

    fn maybe_gc(&mut self) {
        if self.heap.bytes_allocated() <= self.tracker.gc_threshold() {
            return;
        }
        let before = self.heap.live_count();
        let roots = self.collect_roots();
        crate::gc::collect(&mut self.heap, &roots);
        log::debug!("gc: {before} -> {} live objects ({} bytes)", self.heap.live_count(), self.heap.bytes_allocated());
    }

    /// Stack + globals + the currently executing function. Every other
    /// live object is reachable transitively: a
    /// `Function`'s `Code` and cells are graph edges (see
    /// [`crate::heap::Heap::outgoing_edges`]), and a `Code`'s nested
    /// function/string constants are reached through it in turn, so the
    /// compiler doesn't need a separate permanent constant-object root list.
    fn collect_roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<ObjectId> = self.stack.iter().filter_map(|v| v.as_object()).collect();
        roots.extend(self.global.values().filter_map(|v| v.as_object()));
        roots.push(self.current_fn);
        roots
    }
}

/// The one pre-registered native function: `native-square(x) = x*x`.
fn native_square(vm: &mut Vm) -> Result<(), RuntimeError> {
    let arg = vm.peek(0)?;
    let x = arg.as_number().ok_or(RuntimeError::TypeError { op: "native-square", lhs: vm.type_name(arg), rhs: "number" })?;
    vm.push(Value::Number(x * x))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> EvaObject {
        Vm::new().exec(src).unwrap()
    }

    #[test]
    fn scenario_shadowing_and_mutation() {
        let v = run("(var x 5) (set x (+ x 10)) (begin (set x 1000) (var x 100) x) x");
        assert_eq!(v, EvaObject::Number(1000.0));
    }

    #[test]
    fn scenario_while_loop_accumulates() {
        let v = run("(var i 10) (var count 0) (while (> i 0) (begin (set i (- i 1)) (set count (+ count 1)))) count");
        assert_eq!(v, EvaObject::Number(10.0));
    }

    #[test]
    fn scenario_function_call() {
        let v = run("(def square (x) (* x x)) (square 10)");
        assert_eq!(v, EvaObject::Number(100.0));
    }

    #[test]
    fn scenario_nested_closures() {
        let v = run("(def t (a q) (begin (lambda (b) (lambda (c) (+ a (+ b c)))))) (((t 1 10) 2) 3)");
        assert_eq!(v, EvaObject::Number(6.0));
    }

    #[test]
    fn scenario_string_concat() {
        let v = run(r#"(+ "Hello, " "World!")"#);
        assert_eq!(v, EvaObject::Str("Hello, World!".to_string()));
    }

    #[test]
    fn native_square_is_preregistered() {
        let v = run("(native-square 9)");
        assert_eq!(v, EvaObject::Number(81.0));
    }

    #[test]
    fn version_global_is_preregistered() {
        let v = run("VERSION");
        assert_eq!(v, EvaObject::Number(1.0));
    }

    #[test]
    fn if_without_else_falls_through() {
        let v = run("(var x 1) (if (== x 2) (set x 99)) x");
        assert_eq!(v, EvaObject::Number(1.0));
    }

    #[test]
    fn type_mismatch_is_a_surfaced_runtime_error() {
        let err = Vm::new().exec(r#"(+ 1 "x")"#).unwrap_err();
        assert!(matches!(err, EvaError::Runtime(RuntimeError::TypeError { .. })));
    }

    #[test]
    fn calling_a_number_is_not_callable() {
        let err = Vm::new().exec("(5 1)").unwrap_err();
        assert!(matches!(err, EvaError::Runtime(RuntimeError::NotCallable(_))));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let err = Vm::new().exec("(def f (a b) (+ a b)) (f 1)").unwrap_err();
        assert!(matches!(err, EvaError::Runtime(RuntimeError::ArityMismatch { .. })));
    }

    #[test]
    fn recursive_calls_get_fresh_own_cells() {
        // Each call of `f` creates its own `inner` lambda closing over a
        // fresh `acc` cell; recursion must not let later calls clobber
        // earlier activations' cells.
        let v = run(
            "(def f (n acc) \
               (if (== n 0) acc (begin (var next (lambda () (+ acc n))) (f (- n 1) (next))))) \
             (f 3 0)",
        );
        assert_eq!(v, EvaObject::Number(6.0));
    }

    #[test]
    fn gc_reclaims_unreachable_strings() {
        let mut vm = Vm::with_tracker(crate::resource::LimitedTracker { max_call_depth: 1024, gc_threshold: 64 });
        vm.exec(
            r#"(var acc "") (var i 0)
               (while (< i 20)
                 (begin (set acc (+ acc "xx")) (set i (+ i 1))))
               acc"#,
        )
        .unwrap();
        // 20 iterations concatenating 2 bytes each retains exactly one
        // 40-byte live string plus the loop scaffolding; a threshold of 64
        // bytes guarantees at least one GC ran along the way.
        assert!(vm.heap().bytes_allocated() < 20 * 64);
    }
}
