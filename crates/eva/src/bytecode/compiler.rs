//! Lowers the AST to bytecode using the scope analysis in [`crate::scope`].
//! Emits one `Code` object per function plus a "main" unit for the
//! top-level program, via the `gen_*`/`compile_function` emission rules
//! below.

use std::rc::Rc;

use super::builder::CodeBuilder;
use super::code::Code;
use super::op::Op;
use crate::error::CompileError;
use crate::global::Global;
use crate::heap::{Function, Heap, HeapObject, ObjectId};
use crate::parse::ast::{Expr, NodeId};
use crate::scope::{AllocKind, ScopeInfo, ScopeRef};
use crate::value::Value;

/// Compiles `root` (a `(begin ...)` list, as produced by
/// [`crate::parse::parse_program`]) into a `main` `Code` object and
/// returns its heap handle. `global` receives every top-level `var`/`def`
/// binding the program declares.
pub fn compile(heap: &mut Heap, global: &mut Global, root: &Expr, scopes: &ScopeInfo) -> Result<ObjectId, CompileError> {
    let mut compiler = Compiler { heap, global, scopes, scope_stack: Vec::new(), units: vec![CodeBuilder::new("main", 0)] };
    compiler.gen(root)?;
    compiler.unit().emit_op(Op::Halt);
    let code = compiler.units.pop().expect("compiler always keeps the main unit until the end").finish();
    Ok(compiler.heap.allocate(HeapObject::Code(code)))
}

struct Compiler<'c> {
    heap: &'c mut Heap,
    global: &'c mut Global,
    scopes: &'c ScopeInfo,
    scope_stack: Vec<ScopeRef>,
    units: Vec<CodeBuilder>,
}

impl<'c> Compiler<'c> {
    fn unit(&mut self) -> &mut CodeBuilder {
        self.units.last_mut().expect("at least the main unit is always present")
    }

    fn current_scope(&self) -> Result<ScopeRef, CompileError> {
        self.scope_stack.last().cloned().ok_or_else(|| CompileError::InvalidForm {
            form: "<expr>",
            detail: "used outside of any `begin` scope".to_string(),
        })
    }

    fn global_index(&mut self, name: &str) -> Result<u8, CompileError> {
        let idx = self.global.get_index(name).ok_or_else(|| CompileError::UnresolvedName(name.to_string()))?;
        u8::try_from(idx).map_err(|_| CompileError::TooManyOperands { what: "globals" })
    }

    fn is_global_scope(&mut self) -> bool {
        let code = self.unit().code();
        code.name == "main" && code.scope_level == 1
    }

    fn is_function_body(&mut self) -> bool {
        let code = self.unit().code();
        code.name != "main" && code.scope_level == 1
    }

    // --- dispatch -------------------------------------------------------

    fn gen(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => self.gen_number(*n),
            Expr::Str(s) => self.gen_string(s),
            Expr::Symbol(s) => self.gen_symbol(s),
            Expr::List(id, items) => self.gen_list(*id, items),
        }
    }

    fn gen_number(&mut self, n: f64) -> Result<(), CompileError> {
        let idx = self.unit().add_const(Value::Number(n))?;
        self.unit().emit_op_u8(Op::Const, idx);
        Ok(())
    }

    fn gen_string(&mut self, s: &str) -> Result<(), CompileError> {
        let value = self.intern_string(s);
        let idx = self.unit().add_const(value)?;
        self.unit().emit_op_u8(Op::Const, idx);
        Ok(())
    }

    /// String literals are heap objects even at compile time; dedupe by
    /// content against the current Code's constant pool before allocating
    /// a fresh one.
    fn intern_string(&mut self, s: &str) -> Value {
        let existing = self.units.last().and_then(|unit| {
            unit.code().constants.iter().find_map(|c| match c {
                Value::Object(id) => match self.heap.get(*id) {
                    HeapObject::Str(existing) if existing == s => Some(*id),
                    _ => None,
                },
                _ => None,
            })
        });
        let id = existing.unwrap_or_else(|| self.heap.allocate(HeapObject::Str(s.to_string())));
        Value::Object(id)
    }

    fn gen_symbol(&mut self, name: &str) -> Result<(), CompileError> {
        if name == "true" || name == "false" {
            let idx = self.unit().add_const(Value::Bool(name == "true"))?;
            self.unit().emit_op_u8(Op::Const, idx);
            return Ok(());
        }

        let scope = self.current_scope()?;
        let kind = scope.borrow().alloc_kind(name).ok_or_else(|| CompileError::UnresolvedName(name.to_string()))?;

        match kind {
            AllocKind::Global => {
                let idx = self.global_index(name)?;
                self.unit().emit_op_u8(Op::GetGlobal, idx);
            }
            AllocKind::Local => {
                let idx = self.local_index(name)?;
                self.unit().emit_op_u8(Op::GetLocal, idx);
            }
            AllocKind::Cell => {
                let idx = self.cell_index(name)?;
                self.unit().emit_op_u8(Op::GetCell, idx);
            }
        }
        Ok(())
    }

    fn local_index(&mut self, name: &str) -> Result<u8, CompileError> {
        self.unit()
            .code()
            .local_index(name)
            .map(|i| i as u8)
            .ok_or_else(|| CompileError::UnresolvedName(name.to_string()))
    }

    fn cell_index(&mut self, name: &str) -> Result<u8, CompileError> {
        self.unit()
            .code()
            .cell_index(name)
            .map(|i| i as u8)
            .ok_or_else(|| CompileError::UnresolvedName(name.to_string()))
    }

    fn gen_list(&mut self, id: NodeId, items: &[Expr]) -> Result<(), CompileError> {
        if items.is_empty() {
            return Err(CompileError::InvalidForm { form: "()", detail: "empty list".to_string() });
        }

        if let Expr::Symbol(head) = &items[0] {
            match head.as_str() {
                "begin" => return self.gen_begin(id, &items[1..]),
                "var" => return self.gen_var(&items[1..]),
                "set" => return self.gen_set(&items[1..]),
                "if" => return self.gen_if(&items[1..]),
                "while" => return self.gen_while(&items[1..]),
                "def" => return self.gen_def(id, &items[1..]),
                "lambda" => return self.gen_lambda(id, &items[1..]),
                "+" => return self.gen_binary(Op::Add, &items[1..]),
                "-" => return self.gen_binary(Op::Sub, &items[1..]),
                "*" => return self.gen_binary(Op::Mul, &items[1..]),
                "/" => return self.gen_binary(Op::Div, &items[1..]),
                "<" => return self.gen_compare(0, &items[1..]),
                ">" => return self.gen_compare(1, &items[1..]),
                "==" => return self.gen_compare(2, &items[1..]),
                ">=" => return self.gen_compare(3, &items[1..]),
                "<=" => return self.gen_compare(4, &items[1..]),
                "!=" => return self.gen_compare(5, &items[1..]),
                _ => {}
            }
        }
        self.gen_application(items)
    }

    fn gen_binary(&mut self, op: Op, args: &[Expr]) -> Result<(), CompileError> {
        let (lhs, rhs) = binary_args(args, "arithmetic")?;
        self.gen(lhs)?;
        self.gen(rhs)?;
        self.unit().emit_op(op);
        Ok(())
    }

    fn gen_compare(&mut self, op: u8, args: &[Expr]) -> Result<(), CompileError> {
        let (lhs, rhs) = binary_args(args, "compare")?;
        self.gen(lhs)?;
        self.gen(rhs)?;
        self.unit().emit_op_u8(Op::Compare, op);
        Ok(())
    }

    fn gen_application(&mut self, items: &[Expr]) -> Result<(), CompileError> {
        self.gen(&items[0])?;
        for arg in &items[1..] {
            self.gen(arg)?;
        }
        self.unit().emit_op_u8(Op::Call, items.len() as u8 - 1);
        Ok(())
    }

    fn gen_begin(&mut self, id: NodeId, body: &[Expr]) -> Result<(), CompileError> {
        let scope = self.scope_for(id, "begin")?;
        self.scope_stack.push(scope);
        self.block_enter();

        for (i, item) in body.iter().enumerate() {
            let is_last = i == body.len() - 1;
            self.gen(item)?;

            let is_decl = is_tagged(item, "var") || is_tagged(item, "def");
            if !is_last && !is_tagged(item, "while") && !is_decl {
                self.unit().emit_op(Op::Pop);
            }

            if is_last && is_tagged(item, "var") {
                if let Expr::List(_, var_items) = item {
                    self.gen(&var_items[1])?;
                }
            }
        }

        self.block_exit();
        self.scope_stack.pop();
        Ok(())
    }

    fn block_enter(&mut self) {
        self.unit().code_mut().scope_level += 1;
    }

    fn block_exit(&mut self) {
        let mut vars_count = self.unit().pop_locals_at_current_level();
        let arity = self.unit().code().arity;
        if vars_count > 0 || arity > 0 {
            if self.is_function_body() {
                // The callee slot plus every parameter slot, cell-boxed or
                // not. A cell param's own stack slot is never popped
                // during the prologue (see `compile_function`); it just
                // goes stale, so it still needs collapsing here.
                vars_count += 1 + arity;
            }
            self.unit().emit_op_u8(Op::ScopeExit, vars_count as u8);
        }
        self.unit().code_mut().scope_level -= 1;
    }

    fn gen_var(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        let name = expect_symbol(args.first(), "var")?.to_string();
        let value = args.get(1).ok_or_else(|| CompileError::InvalidForm { form: "var", detail: "missing value".to_string() })?;
        let scope = self.current_scope()?;
        let kind = scope.borrow().alloc_kind(&name).ok_or_else(|| CompileError::UnresolvedName(name.clone()))?;

        // Reserve the global slot before compiling the value, so a
        // directly self-recursive `(var f (lambda (...) ... (f ...) ...))`
        // can resolve its own name while its body is still being compiled.
        if kind == AllocKind::Global {
            self.global.define(&name);
        }

        if let Some((lid, params, lbody)) = as_lambda(value) {
            self.compile_function(lid, &name, params, lbody)?;
        } else {
            self.gen(value)?;
        }

        match kind {
            AllocKind::Global => {
                let idx = self.global_index(&name)?;
                self.unit().emit_op_u8(Op::SetGlobal, idx);
            }
            AllocKind::Cell => {
                let idx = self.unit().add_cell_name(&name)?;
                self.unit().emit_op_u8(Op::SetCell, idx);
                self.unit().emit_op(Op::Pop);
            }
            AllocKind::Local => {
                self.unit().add_local(&name)?;
            }
        }
        Ok(())
    }

    fn gen_set(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        let name = expect_symbol(args.first(), "set")?.to_string();
        let value = args.get(1).ok_or_else(|| CompileError::InvalidForm { form: "set", detail: "missing value".to_string() })?;
        let scope = self.current_scope()?;
        let kind = scope.borrow().alloc_kind(&name).ok_or_else(|| CompileError::UnresolvedName(name.clone()))?;

        self.gen(value)?;

        match kind {
            AllocKind::Local => {
                let idx = self.local_index(&name)?;
                self.unit().emit_op_u8(Op::SetLocal, idx);
            }
            AllocKind::Cell => {
                let idx = self.cell_index(&name)?;
                self.unit().emit_op_u8(Op::SetCell, idx);
            }
            AllocKind::Global => {
                let idx = self.global_index(&name)?;
                self.unit().emit_op_u8(Op::SetGlobal, idx);
            }
        }
        Ok(())
    }

    fn gen_if(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        let cond = args.first().ok_or_else(|| CompileError::InvalidForm { form: "if", detail: "missing condition".to_string() })?;
        let then_branch = args.get(1).ok_or_else(|| CompileError::InvalidForm { form: "if", detail: "missing consequent".to_string() })?;

        self.gen(cond)?;
        let else_label = self.unit().emit_jump(Op::JmpIfFalse);
        self.gen(then_branch)?;
        let end_label = self.unit().emit_jump(Op::Jmp);
        self.unit().patch_jump(else_label)?;

        if let Some(else_branch) = args.get(2) {
            self.gen(else_branch)?;
        }
        self.unit().patch_jump(end_label)?;
        Ok(())
    }

    fn gen_while(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        let cond = args.first().ok_or_else(|| CompileError::InvalidForm { form: "while", detail: "missing condition".to_string() })?;
        let body = args.get(1).ok_or_else(|| CompileError::InvalidForm { form: "while", detail: "missing body".to_string() })?;

        let loop_start = self.unit().current_offset();
        self.gen(cond)?;
        let end_label = self.unit().emit_jump(Op::JmpIfFalse);
        // Exactly one emission of the body and one back-jump.
        self.gen(body)?;
        self.unit().emit_jump_to(Op::Jmp, loop_start)?;
        self.unit().patch_jump(end_label)?;
        Ok(())
    }

    fn gen_def(&mut self, id: NodeId, args: &[Expr]) -> Result<(), CompileError> {
        let name = expect_symbol(args.first(), "def")?.to_string();
        let params = expect_list(args.get(1), "def")?;
        let body = args.get(2).ok_or_else(|| CompileError::InvalidForm { form: "def", detail: "missing body".to_string() })?;

        // Same ordering concern as `gen_var`: a top-level `def` that
        // recurses (directly or through a nested lambda) needs its own
        // global slot to already exist while its body compiles.
        let is_global = self.is_global_scope();
        if is_global {
            self.global.define(&name);
        }

        self.compile_function(id, &name, params, body)?;

        if is_global {
            let idx = self.global_index(&name)?;
            self.unit().emit_op_u8(Op::SetGlobal, idx);
        } else {
            self.unit().add_local(&name)?;
        }
        Ok(())
    }

    fn gen_lambda(&mut self, id: NodeId, args: &[Expr]) -> Result<(), CompileError> {
        let params = expect_list(args.first(), "lambda")?;
        let body = args.get(1).ok_or_else(|| CompileError::InvalidForm { form: "lambda", detail: "missing body".to_string() })?;
        self.compile_function(id, "lambda", params, body)
    }

    fn scope_for(&self, id: NodeId, form: &'static str) -> Result<ScopeRef, CompileError> {
        self.scopes
            .scope_of(id)
            .cloned()
            .ok_or_else(|| CompileError::InvalidForm { form, detail: "no scope record for this node".to_string() })
    }

    /// The shared implementation behind `def` and `lambda`: compiles
    /// `body` into a fresh `Code`, then either embeds a ready-made
    /// `Function` constant (no free variables) or emits the
    /// `LOAD_CELL...CONST MAKE_FUNCTION` sequence that builds the closure
    /// at runtime.
    fn compile_function(&mut self, id: NodeId, fn_name: &str, params: &[Expr], body: &Expr) -> Result<(), CompileError> {
        let scope = self.scope_for(id, "function")?;
        self.scope_stack.push(Rc::clone(&scope));

        let arity = params.len();

        // Allocate the Code object up front and register it as a constant
        // of the *enclosing* unit right away: the constant's index is
        // stable even though the body hasn't been emitted yet.
        let placeholder_id = self.heap.allocate(HeapObject::Code(Code::new(fn_name, arity)));
        let code_const_idx = self.unit().add_const(Value::Object(placeholder_id))?;

        self.units.push(CodeBuilder::new(fn_name, arity));

        let free_and_cells: Vec<String> = {
            let s = scope.borrow();
            s.free.iter().chain(s.cells.iter()).cloned().collect()
        };
        self.unit().code_mut().free_count = scope.borrow().free.len();
        for name in &free_and_cells {
            self.unit().add_cell_name(name)?;
        }

        self.unit().add_local(fn_name)?; // slot 0: the callee itself

        for param in params {
            let pname = expect_symbol(Some(param), "lambda parameter")?.to_string();
            let slot = self.unit().add_local(&pname)?;
            if let Some(idx) = self.unit().code().cell_index(&pname) {
                // The caller already pushed this argument's value at a
                // fixed slot; read it back by position rather than
                // assuming it's still on top of the stack (it won't be,
                // once an earlier param has been boxed ahead of it). The
                // stale stack slot is collapsed away by `block_exit`
                // along with the rest of the params.
                self.unit().emit_op_u8(Op::GetLocal, slot);
                self.unit().emit_op_u8(Op::SetCell, idx as u8);
                self.unit().emit_op(Op::Pop);
            }
        }

        self.gen(body)?;

        if !is_tagged(body, "begin") {
            let slots = 1 + arity;
            self.unit().emit_op_u8(Op::ScopeExit, slots as u8);
        }
        self.unit().emit_op(Op::Return);

        let finished = self.units.pop().expect("compile_function always pushed a unit").finish();
        *self.heap.get_mut(placeholder_id) = HeapObject::Code(finished);

        let free_names = scope.borrow().free.clone();
        if free_names.is_empty() {
            let func_id = self.heap.allocate(HeapObject::Function(Function { code: placeholder_id, cells: Vec::new() }));
            let idx = self.unit().add_const(Value::Object(func_id))?;
            self.unit().emit_op_u8(Op::Const, idx);
        } else {
            for name in &free_names {
                let idx = self.cell_index(name)?;
                self.unit().emit_op_u8(Op::LoadCell, idx);
            }
            self.unit().emit_op_u8(Op::Const, code_const_idx);
            self.unit().emit_op_u8(Op::MakeFunction, free_names.len() as u8);
        }

        self.scope_stack.pop();
        Ok(())
    }
}

fn binary_args<'e>(args: &'e [Expr], form: &'static str) -> Result<(&'e Expr, &'e Expr), CompileError> {
    match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(CompileError::InvalidForm { form, detail: "expected two operands".to_string() }),
    }
}

fn expect_symbol<'a>(expr: Option<&'a Expr>, form: &'static str) -> Result<&'a str, CompileError> {
    match expr {
        Some(Expr::Symbol(name)) => Ok(name.as_str()),
        _ => Err(CompileError::InvalidForm { form, detail: "expected a symbol".to_string() }),
    }
}

fn expect_list<'a>(expr: Option<&'a Expr>, form: &'static str) -> Result<&'a [Expr], CompileError> {
    match expr {
        Some(Expr::List(_, items)) => Ok(items.as_slice()),
        _ => Err(CompileError::InvalidForm { form, detail: "expected a parameter list".to_string() }),
    }
}

fn is_tagged(expr: &Expr, tag: &str) -> bool {
    matches!(expr, Expr::List(_, items) if matches!(items.first(), Some(Expr::Symbol(s)) if s == tag))
}

fn as_lambda(expr: &Expr) -> Option<(NodeId, &[Expr], &Expr)> {
    let Expr::List(id, items) = expr else { return None };
    if !matches!(items.first(), Some(Expr::Symbol(s)) if s == "lambda") {
        return None;
    }
    let Expr::List(_, params) = items.get(1)? else { return None };
    let body = items.get(2)?;
    Some((*id, params.as_slice(), body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use crate::parse::parse_program;
    use crate::scope::analyze;

    fn compile_src(src: &str) -> (Heap, Global, ObjectId) {
        let mut heap = Heap::new();
        let mut global = Global::new();
        let program = parse_program(src).unwrap();
        let scopes = analyze(&program).unwrap();
        let main = compile(&mut heap, &mut global, &program, &scopes).unwrap();
        (heap, global, main)
    }

    #[test]
    fn main_ends_in_halt() {
        let (heap, _global, main) = compile_src("5");
        let code = heap.get_code(main);
        assert_eq!(code.bytecode.last().copied(), Some(Op::Halt as u8));
    }

    #[test]
    fn top_level_var_is_global() {
        let (heap, global, main) = compile_src("(var x 5) x");
        assert!(global.exists("x"));
        let code = heap.get_code(main);
        assert!(code.bytecode.contains(&(Op::SetGlobal as u8)));
        assert!(code.bytecode.contains(&(Op::GetGlobal as u8)));
    }

    #[test]
    fn nested_block_var_is_local() {
        let (heap, _global, main) = compile_src("(begin (var y 1) y)");
        let code = heap.get_code(main);
        assert!(code.bytecode.contains(&(Op::GetLocal as u8)));
    }

    #[test]
    fn def_creates_a_nested_code_constant() {
        let (heap, _global, main) = compile_src("(def square (x) (* x x)) (square 2)");
        let code = heap.get_code(main);
        let has_code_const = code.constants.iter().any(|c| matches!(c, Value::Object(id) if matches!(heap.get(*id), HeapObject::Code(_) | HeapObject::Function(_))));
        assert!(has_code_const);
        assert!(code.bytecode.contains(&(Op::Call as u8)));
    }

    #[test]
    fn closure_over_free_variable_emits_make_function() {
        let (heap, _global, main) = compile_src("(def t (a) (lambda (b) (+ a b)))");
        let code = heap.get_code(main);
        assert!(code.bytecode.contains(&(Op::MakeFunction as u8)));
        assert!(code.bytecode.contains(&(Op::LoadCell as u8)));
    }
}
