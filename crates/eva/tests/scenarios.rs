//! End-to-end scenarios run through the public `exec` entry point, matching
//! the inputs/outputs spelled out for the VM's hard core: shadowing and
//! mutation across block scopes, loop accumulation, plain function calls,
//! two-level closures sharing a captured variable, string concatenation,
//! and a GC cycle triggered by repeated concatenation.

use eva::resource::LimitedTracker;
use eva::{EvaObject, Vm};

#[test]
fn shadowing_inner_block_var_does_not_escape_but_outer_mutation_does() {
    let result = eva::exec("(var x 5) (set x (+ x 10)) (begin (set x 1000) (var x 100) x) x").unwrap();
    assert_eq!(result, EvaObject::Number(1000.0));
}

#[test]
fn while_loop_counts_down_and_accumulates() {
    let result =
        eva::exec("(var i 10) (var count 0) (while (> i 0) (begin (set i (- i 1)) (set count (+ count 1)))) count")
            .unwrap();
    assert_eq!(result, EvaObject::Number(10.0));
}

#[test]
fn def_and_call_a_plain_function() {
    let result = eva::exec("(def square (x) (* x x)) (square 10)").unwrap();
    assert_eq!(result, EvaObject::Number(100.0));
}

#[test]
fn two_level_closure_shares_a_captured_variable_across_an_unused_sibling_param() {
    let result = eva::exec("(def t (a q) (begin (lambda (b) (lambda (c) (+ a (+ b c)))))) (((t 1 10) 2) 3)").unwrap();
    assert_eq!(result, EvaObject::Number(6.0));
}

#[test]
fn plus_concatenates_two_strings() {
    let result = eva::exec(r#"(+ "Hello, " "World!")"#).unwrap();
    assert_eq!(result, EvaObject::Str("Hello, World!".to_string()));
}

#[test]
fn threshold_gc_reclaims_discarded_concatenation_results() {
    // Each loop iteration discards the previous `acc` string and allocates a
    // 2-byte-longer one; a 64-byte threshold guarantees several collections
    // fire before the 20 iterations finish, and only the final ~40-byte
    // string plus loop scaffolding should remain live afterward.
    let mut vm = Vm::with_tracker(LimitedTracker { max_call_depth: 1024, gc_threshold: 64 });
    vm.exec(
        r#"(var acc "") (var i 0)
           (while (< i 20)
             (begin (set acc (+ acc "xx")) (set i (+ i 1))))
           acc"#,
    )
    .unwrap();
    assert!(vm.heap().bytes_allocated() < 20 * 64, "GC should have reclaimed intermediate concatenation results");
}

#[test]
fn call_stack_returns_to_its_pre_call_depth_after_deep_recursion() {
    // A VM has no public call-depth probe, so this exercises the invariant
    // indirectly: if `RETURN` ever failed to restore `bp`/`ip`/`fn`
    // correctly, a second, independent top-level expression run in the same
    // `exec` call after a deeply recursive one would read back corrupted
    // state instead of its own unrelated value.
    let result = eva::exec(
        "(def count-down (n) (if (== n 0) 0 (count-down (- n 1)))) \
         (count-down 200) \
         (var after 42) \
         after",
    )
    .unwrap();
    assert_eq!(result, EvaObject::Number(42.0));
}
