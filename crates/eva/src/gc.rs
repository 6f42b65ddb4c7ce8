//! Precise mark-and-sweep over the heap. Cyclic structures (a cell shared
//! between an outer function and a nested lambda can point back through
//! `Value::Object` into the outer function itself) are reclaimed naturally
//! because reachability is decided globally by the mark phase, not by a
//! per-object refcount.

use crate::heap::{Heap, ObjectId};

/// Marks every object reachable from `roots`, then sweeps anything left
/// unmarked. Roots are assembled by the VM (stack + globals + the
/// compiler's constant-object set + the currently executing function);
/// see [`crate::vm::Vm::collect_roots`].
pub fn collect(heap: &mut Heap, roots: &[ObjectId]) {
    let mut worklist: Vec<ObjectId> = Vec::new();

    for &root in roots {
        if heap.mark(root) {
            worklist.push(root);
        }
    }

    while let Some(id) = worklist.pop() {
        for edge in heap.outgoing_edges(id) {
            if heap.mark(edge) {
                worklist.push(edge);
            }
        }
    }

    heap.sweep();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::Code;
    use crate::heap::{Cell, Function, HeapObject};
    use crate::value::Value;

    #[test]
    fn unreachable_objects_are_collected() {
        let mut heap = Heap::new();
        let _dead = heap.allocate(HeapObject::Str("garbage".to_string()));
        let alive = heap.allocate(HeapObject::Str("kept".to_string()));
        collect(&mut heap, &[alive]);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.get_str(alive), "kept");
    }

    #[test]
    fn function_keeps_its_cells_alive() {
        let mut heap = Heap::new();
        let cell = heap.allocate(HeapObject::Cell(Cell { value: Value::Number(1.0) }));
        let code = heap.allocate(HeapObject::Code(Code::new("f", 0)));
        let func = heap.allocate(HeapObject::Function(Function { code, cells: vec![cell] }));
        collect(&mut heap, &[func]);
        assert_eq!(heap.live_count(), 3);
    }

    #[test]
    fn cell_keeps_its_stored_object_alive() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapObject::Str("captured".to_string()));
        let cell = heap.allocate(HeapObject::Cell(Cell { value: Value::Object(inner) }));
        collect(&mut heap, &[cell]);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn code_keeps_object_constants_alive() {
        let mut heap = Heap::new();
        let s = heap.allocate(HeapObject::Str("literal".to_string()));
        let mut code = Code::new("main", 0);
        code.constants.push(Value::Object(s));
        let code_id = heap.allocate(HeapObject::Code(code));
        collect(&mut heap, &[code_id]);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn cyclic_references_through_cells_still_collect() {
        let mut heap = Heap::new();
        let code = heap.allocate(HeapObject::Code(Code::new("f", 0)));
        let cell = heap.allocate(HeapObject::Cell(Cell { value: Value::Number(0.0) }));
        let func = heap.allocate(HeapObject::Function(Function { code, cells: vec![cell] }));
        // The cell closes back over the function that owns it: a cycle a
        // refcounting scheme would leak.
        heap.get_cell_mut(cell).value = Value::Object(func);
        collect(&mut heap, &[]);
        assert_eq!(heap.live_count(), 0);
    }
}
