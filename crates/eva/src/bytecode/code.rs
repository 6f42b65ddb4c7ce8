//! The compiled form of one callable body: bytecode + its constant pool +
//! the metadata the VM and disassembler need. Immutable once compilation
//! of the enclosing program finishes; only `Function.cells` and
//! `Cell.value` mutate at runtime.

use crate::value::Value;

/// A local slot recorded at the scope level it was declared in, so block
/// exit knows which contiguous tail of `locals` to pop.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: String,
    pub scope_level: usize,
}

#[derive(Debug, Clone)]
pub struct Code {
    pub name: String,
    pub arity: usize,
    pub bytecode: Vec<u8>,
    pub constants: Vec<Value>,
    pub locals: Vec<LocalVar>,
    /// Free-captured names first, own cells after: the order callers push
    /// `LOAD_CELL`s in and the order `MAKE_FUNCTION` expects.
    pub cell_names: Vec<String>,
    pub free_count: usize,
    pub scope_level: usize,
}

impl Code {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
            bytecode: Vec::new(),
            constants: Vec::new(),
            locals: Vec::new(),
            cell_names: Vec::new(),
            free_count: 0,
            scope_level: 0,
        }
    }

    /// Most recently declared slot named `name` still present in the table.
    /// Shadowing within one function (e.g. a `var x` inside a nested block
    /// re-declaring an outer block's `x`) must resolve to the innermost one,
    /// and locals grow monotonically, so "most recent" is "last currently
    /// present" - a contiguous tail is popped on scope exit.
    pub fn local_index(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|l| l.name == name)
    }

    pub fn cell_index(&self, name: &str) -> Option<usize> {
        self.cell_names.iter().position(|n| n == name)
    }
}
