//! Single-pass scope analysis: decides, for every name, whether it lives in
//! the global table, on the operand stack (`Local`), or in a heap `Cell`
//! because a nested function closes over it.
//!
//! Each scope carries a parent link plus `alloc_info`/`free`/`cells`
//! tables; `maybe_promote`/`resolve`/`promote` below walk that chain to
//! decide, and retroactively box, exactly the locals a nested function
//! actually captures.

use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::CompileError;
use crate::parse::ast::{Expr, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Global,
    Local,
    Cell,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeRef>,
    pub alloc_info: AHashMap<String, AllocKind>,
    pub free: Vec<String>,
    pub cells: Vec<String>,
}

pub type ScopeRef = Rc<RefCell<Scope>>;

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeRef>) -> Self {
        Self {
            kind,
            parent,
            alloc_info: AHashMap::new(),
            free: Vec::new(),
            cells: Vec::new(),
        }
    }

    fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }

    fn add_local(&mut self, name: &str) {
        let kind = if self.is_global() { AllocKind::Global } else { AllocKind::Local };
        self.alloc_info.insert(name.to_string(), kind);
    }

    fn push_back_if_absent(v: &mut Vec<String>, name: &str) {
        if !v.iter().any(|n| n == name) {
            v.push(name.to_string());
        }
    }

    fn add_cell(&mut self, name: &str) {
        Self::push_back_if_absent(&mut self.cells, name);
        self.alloc_info.insert(name.to_string(), AllocKind::Cell);
    }

    fn add_free(&mut self, name: &str) {
        Self::push_back_if_absent(&mut self.free, name);
        self.alloc_info.insert(name.to_string(), AllocKind::Cell);
    }

    /// Resolved allocation kind for `name`, if scope analysis has run.
    pub fn alloc_kind(&self, name: &str) -> Option<AllocKind> {
        self.alloc_info.get(name).copied()
    }

    /// Position of `name` in this scope's cell-name ordering (`free` first,
    /// own `cells` after), matching `Code::cellNames`.
    pub fn cell_index(&self, name: &str) -> Option<usize> {
        self.free
            .iter()
            .chain(self.cells.iter())
            .position(|n| n == name)
    }
}

/// Per-node scope records produced by [`analyze`]. Every AST list node that
/// introduces a scope (`begin`, `def`, `lambda`) has an entry.
#[derive(Debug, Default)]
pub struct ScopeInfo {
    by_node: AHashMap<NodeId, ScopeRef>,
}

impl ScopeInfo {
    pub fn scope_of(&self, node: NodeId) -> Option<&ScopeRef> {
        self.by_node.get(&node)
    }
}

const OTHER_KEYWORDS: &[&str] =
    &["set", "if", "while", "+", "-", "*", "/", "<", ">", "==", ">=", "<=", "!="];

fn is_recognized_keyword(head: &str) -> bool {
    matches!(head, "begin" | "var" | "def" | "lambda") || OTHER_KEYWORDS.contains(&head)
}

/// Walks `root` (which must be a `(begin ...)` list; `exec` wraps programs
/// this way before analysis) and returns the scope map code generation
/// consults.
pub fn analyze(root: &Expr) -> Result<ScopeInfo, CompileError> {
    let mut analyzer = Analyzer::default();
    analyzer.walk(root, None)?;
    Ok(analyzer.info)
}

#[derive(Default)]
struct Analyzer {
    info: ScopeInfo,
}

impl Analyzer {
    fn record(&mut self, node: NodeId, scope: &ScopeRef) {
        self.info.by_node.insert(node, Rc::clone(scope));
    }

    fn walk(&mut self, expr: &Expr, scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        match expr {
            Expr::Number(_) | Expr::Str(_) => Ok(()),
            Expr::Symbol(name) => {
                if name == "true" || name == "false" {
                    return Ok(());
                }
                let scope = require_scope(scope, "symbol")?;
                maybe_promote(scope, name)
            }
            Expr::List(id, items) => self.walk_list(*id, items, scope),
        }
    }

    fn walk_list(&mut self, id: NodeId, items: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        let Some(Expr::Symbol(head)) = items.first() else {
            return self.walk_args(items, scope);
        };
        match head.as_str() {
            "begin" => self.walk_begin(id, &items[1..], scope),
            "var" => self.walk_var(&items[1..], scope),
            "def" => self.walk_def(id, &items[1..], scope),
            "lambda" => self.walk_lambda(id, &items[1..], scope),
            "set" => self.walk_set(&items[1..], scope),
            h if is_recognized_keyword(h) => self.walk_args(&items[1..], scope),
            _ => self.walk_args(items, scope),
        }
    }

    fn walk_args(&mut self, items: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        for item in items {
            self.walk(item, scope)?;
        }
        Ok(())
    }

    fn walk_begin(&mut self, id: NodeId, body: &[Expr], parent: Option<&ScopeRef>) -> Result<(), CompileError> {
        let kind = if parent.is_none() { ScopeKind::Global } else { ScopeKind::Block };
        let scope = Rc::new(RefCell::new(Scope::new(kind, parent.cloned())));
        self.record(id, &scope);
        for item in body {
            self.walk(item, Some(&scope))?;
        }
        Ok(())
    }

    fn walk_var(&mut self, args: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        let scope = require_scope(scope, "var")?;
        let name = expect_symbol(args.first(), "var")?;
        scope.borrow_mut().add_local(name);
        if let Some(value) = args.get(1) {
            self.walk(value, Some(scope))?;
        }
        Ok(())
    }

    fn walk_def(&mut self, id: NodeId, args: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        let scope = require_scope(scope, "def")?;
        let name = expect_symbol(args.first(), "def")?;
        scope.borrow_mut().add_local(name);
        let params = expect_list(args.get(1), "def")?;
        let body = args.get(2).ok_or_else(|| CompileError::InvalidForm {
            form: "def",
            detail: "missing body".to_string(),
        })?;
        self.walk_function_scope(id, params, body, scope)
    }

    fn walk_lambda(&mut self, id: NodeId, args: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        let scope = require_scope(scope, "lambda")?;
        let params = expect_list(args.first(), "lambda")?;
        let body = args.get(1).ok_or_else(|| CompileError::InvalidForm {
            form: "lambda",
            detail: "missing body".to_string(),
        })?;
        self.walk_function_scope(id, params, body, scope)
    }

    fn walk_function_scope(
        &mut self,
        id: NodeId,
        params: &[Expr],
        body: &Expr,
        parent: &ScopeRef,
    ) -> Result<(), CompileError> {
        let fn_scope = Rc::new(RefCell::new(Scope::new(ScopeKind::Function, Some(Rc::clone(parent)))));
        for param in params {
            let name = expect_symbol(Some(param), "lambda parameter")?;
            fn_scope.borrow_mut().add_local(name);
        }
        self.record(id, &fn_scope);
        self.walk(body, Some(&fn_scope))
    }

    fn walk_set(&mut self, args: &[Expr], scope: Option<&ScopeRef>) -> Result<(), CompileError> {
        let scope = require_scope(scope, "set")?;
        let name = expect_symbol(args.first(), "set")?;
        // The assigned name is promoted too, not just read uses, so writing
        // through a captured variable also boxes it.
        maybe_promote(scope, name)?;
        if let Some(value) = args.get(1) {
            self.walk(value, Some(scope))?;
        }
        Ok(())
    }
}

fn require_scope<'a>(scope: Option<&'a ScopeRef>, form: &'static str) -> Result<&'a ScopeRef, CompileError> {
    scope.ok_or_else(|| CompileError::InvalidForm {
        form,
        detail: "used outside of any `begin` scope".to_string(),
    })
}

fn expect_symbol<'a>(expr: Option<&'a Expr>, form: &'static str) -> Result<&'a str, CompileError> {
    match expr {
        Some(Expr::Symbol(name)) => Ok(name.as_str()),
        _ => Err(CompileError::InvalidForm {
            form,
            detail: "expected a symbol".to_string(),
        }),
    }
}

fn expect_list<'a>(expr: Option<&'a Expr>, form: &'static str) -> Result<&'a [Expr], CompileError> {
    match expr {
        Some(Expr::List(_, items)) => Ok(items.as_slice()),
        _ => Err(CompileError::InvalidForm {
            form,
            detail: "expected a parameter list".to_string(),
        }),
    }
}

fn maybe_promote(scope: &ScopeRef, name: &str) -> Result<(), CompileError> {
    let init_alloc = {
        let s = scope.borrow();
        match s.alloc_kind(name) {
            Some(kind) => kind,
            None if s.is_global() => AllocKind::Global,
            None => AllocKind::Local,
        }
    };

    if init_alloc == AllocKind::Cell {
        return Ok(());
    }

    let (owner, resolved) = resolve(scope, name, init_alloc)?;
    scope.borrow_mut().alloc_info.insert(name.to_string(), resolved);

    if resolved == AllocKind::Cell {
        promote(scope, &owner, name);
    }

    Ok(())
}

fn resolve(scope: &ScopeRef, name: &str, mut alloc_type: AllocKind) -> Result<(ScopeRef, AllocKind), CompileError> {
    if scope.borrow().alloc_info.contains_key(name) {
        return Ok((Rc::clone(scope), alloc_type));
    }

    if scope.borrow().kind == ScopeKind::Function {
        alloc_type = AllocKind::Cell;
    }

    let parent = scope.borrow().parent.clone();
    let parent = parent.ok_or_else(|| CompileError::UnresolvedName(name.to_string()))?;

    if parent.borrow().kind == ScopeKind::Global {
        alloc_type = AllocKind::Global;
    }

    resolve(&parent, name, alloc_type)
}

fn promote(using_scope: &ScopeRef, owner: &ScopeRef, name: &str) {
    owner.borrow_mut().add_cell(name);

    let mut current = Rc::clone(using_scope);
    while !Rc::ptr_eq(&current, owner) {
        current.borrow_mut().add_free(name);
        let parent = current
            .borrow()
            .parent
            .clone()
            .expect("promote walked past the owning scope without reaching it");
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_program;

    fn analyze_src(src: &str) -> ScopeInfo {
        let program = parse_program(src).expect("parse");
        analyze(&program).expect("analyze")
    }

    #[test]
    fn plain_local_is_not_promoted() {
        let info = analyze_src("(var x 1) (set x 2) x");
        let scope = info.scope_of(root_id(&info)).unwrap();
        assert_eq!(scope.borrow().alloc_kind("x"), Some(AllocKind::Local));
        assert!(scope.borrow().cells.is_empty());
    }

    fn root_id(info: &ScopeInfo) -> NodeId {
        // The program root is always node 0: the outermost `begin` the
        // parser assigns first.
        info.by_node.keys().copied().min().unwrap()
    }

    #[test]
    fn captured_local_is_promoted_to_cell_on_read() {
        let info = analyze_src("(def f () (begin (var x 1) (lambda () x)))");
        // `f`'s function scope should show `x` as a cell, and the inner
        // lambda should list it as free.
        let mut found_cell = false;
        let mut found_free = false;
        for scope in info.by_node.values() {
            let s = scope.borrow();
            if s.cells.iter().any(|n| n == "x") {
                found_cell = true;
            }
            if s.free.iter().any(|n| n == "x") {
                found_free = true;
            }
        }
        assert!(found_cell, "owner scope should record x as a cell");
        assert!(found_free, "intervening/using scope should record x as free");
    }

    #[test]
    fn captured_local_is_promoted_on_write_too() {
        let info = analyze_src("(def f () (begin (var x 1) (lambda () (set x 2))))");
        let mut found_cell = false;
        for scope in info.by_node.values() {
            if scope.borrow().cells.iter().any(|n| n == "x") {
                found_cell = true;
            }
        }
        assert!(found_cell, "assigning a captured variable must promote it too");
    }

    #[test]
    fn unresolved_name_is_an_error() {
        let program = parse_program("never-defined").expect("parse");
        let err = analyze(&program).unwrap_err();
        assert_eq!(err, CompileError::UnresolvedName("never-defined".to_string()));
    }
}
