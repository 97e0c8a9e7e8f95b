//! End-to-end tests: source in, captured stdout (or a runtime error) out.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use super::vm::{InterpretError, Vm};

/// A `Write` sink the test keeps a handle to after handing it to the VM.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_vm() -> (Vm, SharedBuf) {
    let buf = SharedBuf::default();
    let vm = Vm::with_output(Box::new(buf.clone()));
    (vm, buf)
}

fn run(source: &str) -> String {
    let (mut vm, buf) = capture_vm();
    vm.interpret(source).expect("program failed");
    let bytes = buf.0.borrow().clone();
    String::from_utf8(bytes).expect("program output was not UTF-8")
}

/// Same as `run` but with the collector firing on every allocation.
fn run_stressed(source: &str) -> String {
    let (mut vm, buf) = capture_vm();
    vm.stress_gc();
    vm.interpret(source).expect("program failed");
    let bytes = buf.0.borrow().clone();
    String::from_utf8(bytes).expect("program output was not UTF-8")
}

fn run_err(source: &str) -> InterpretError {
    let (mut vm, _buf) = capture_vm();
    vm.interpret(source).expect_err("expected the program to fail")
}

// -- Printing & arithmetic --

#[test]
fn string_concatenation() {
    assert_eq!(run("print \"Hello, \" + \"world!\";"), "Hello, world!\n");
}

#[test]
fn arithmetic_follows_ieee_doubles() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run("print 10 / 4;"), "2.5\n");
    assert_eq!(run("print 1 / 0;"), "inf\n");
    assert_eq!(run("print -(3 - 5);"), "2\n");
}

#[test]
fn number_printing_uses_g_format() {
    assert_eq!(run("print 3628800;"), "3.6288e+06\n");
    assert_eq!(run("print 0.5;"), "0.5\n");
    assert_eq!(run("print 100000;"), "100000\n");
}

#[test]
fn print_literals() {
    assert_eq!(run("print true;"), "true\n");
    assert_eq!(run("print false;"), "false\n");
    assert_eq!(run("print nil;"), "nil\n");
    assert_eq!(run("print [1, [2, 3]];"), "[1, [2, 3]]\n");
}

#[test]
fn comparison_chain_desugaring() {
    assert_eq!(run("print 1 <= 1;"), "true\n");
    assert_eq!(run("print 2 >= 3;"), "false\n");
    assert_eq!(run("print 1 != 2;"), "true\n");
}

#[test]
fn equality_semantics() {
    assert_eq!(run("print 1 == 1;"), "true\n");
    assert_eq!(run("print 1 == \"1\";"), "false\n");
    assert_eq!(run("print nil == nil;"), "true\n");
    assert_eq!(run("print nil == false;"), "false\n");
}

#[test]
fn interned_strings_compare_by_reference() {
    // Reference equality is value equality because of interning, even for
    // strings built at runtime.
    assert_eq!(run("print \"ab\" == \"ab\";"), "true\n");
    assert_eq!(run("print \"ab\" == \"a\" + \"b\";"), "true\n");
}

// -- Truthiness --

#[test]
fn zero_false_nil_and_none_are_falsy() {
    assert_eq!(run("print not 0;"), "true\n");
    assert_eq!(run("print not false;"), "true\n");
    assert_eq!(run("print not nil;"), "true\n");
    assert_eq!(run("print not none;"), "true\n");
    assert_eq!(run("print not \"\";"), "false\n");
    assert_eq!(run("print not 0.5;"), "false\n");
}

#[test]
fn and_or_short_circuit() {
    assert_eq!(run("print 1 and 2;"), "2\n");
    assert_eq!(run("print 0 and 2;"), "0\n");
    assert_eq!(run("print 0 or 3;"), "3\n");
    assert_eq!(run("print 1 or 3;"), "1\n");
}

// -- Variables & scoping --

#[test]
fn globals_round_trip() {
    assert_eq!(run("var a = 1; a = a + 2; print a;"), "3\n");
}

#[test]
fn locals_shadow_outer_scopes() {
    assert_eq!(run("var a = \"outer\"; { var a = \"inner\"; print a; } print a;"), "inner\nouter\n");
}

#[test]
fn undefined_variable_is_runtime_error() {
    assert_eq!(run_err("print missing;"), InterpretError::Runtime);
    assert_eq!(run_err("missing = 1;"), InterpretError::Runtime);
}

// -- Expression orientation --

#[test]
fn block_yields_last_dangling_expression() {
    assert_eq!(run("print { 1; 2 };"), "2\n");
    assert_eq!(run("var x = { var y = 3; y + 4 }; print x;"), "7\n");
}

#[test]
fn if_is_an_expression() {
    assert_eq!(run("var x = if 1 { \"y\" } else { \"n\" }; print x;"), "y\n");
    assert_eq!(run("var x = if 0 { \"y\" } else { \"n\" }; print x;"), "n\n");
    // Without an else, the false edge yields nil.
    assert_eq!(run("print if 0 { 1 };"), "nil\n");
}

#[test]
fn while_is_an_expression() {
    assert_eq!(run("var i = 0; print while i < 3 { i = i + 1; i };"), "3\n");
    // Zero iterations leave the placeholder value.
    assert_eq!(run("print while false { 1 };"), "nil\n");
}

#[test]
fn statements_keep_the_stack_neutral() {
    let (mut vm, _buf) = capture_vm();
    vm.interpret("var a = 1; if a { a; } while false { 1 } for x in [1, 2] { x; } { 5; }")
        .expect("program failed");
    assert_eq!(vm.stack_height(), 0);
    assert_eq!(vm.open_upvalue_count(), 0);
}

// -- Functions & closures --

#[test]
fn recursion() {
    let source = "func fac(x) { if x==1 { 1 } else { x*fac(x-1) } } print fac(10);";
    assert_eq!(run(source), "3.6288e+06\n");
}

#[test]
fn function_returns_body_value() {
    assert_eq!(run("func three() { 3 } print three();"), "3\n");
    assert_eq!(run("func nothing() {} print nothing();"), "nil\n");
}

#[test]
fn explicit_return() {
    assert_eq!(run("func f(x) { if x { return \"early\"; } \"late\" } print f(1); print f(0);"), "early\nlate\n");
}

#[test]
fn closure_counter_observes_and_retains_state() {
    let source = "func outer() { var a = 1; func inner() { a = a + 1; a } inner } \
                  var f = outer(); print f(); print f(); print f();";
    assert_eq!(run(source), "2\n3\n4\n");
}

#[test]
fn closures_capture_by_reference_until_close() {
    let source = "func outer() {
        var x = 1;
        func set() { x = 2; }
        func get() { x }
        [set, get]
    }
    var fs = outer(); fs[0](); print fs[1]();";
    assert_eq!(run(source), "2\n");
}

#[test]
fn anonymous_functions_are_values() {
    assert_eq!(run("var twice = func (x) { x + x }; print twice(21);"), "42\n");
}

#[test]
fn wrong_arity_is_runtime_error() {
    assert_eq!(run_err("func f(a, b) { a } f(1);"), InterpretError::Runtime);
}

#[test]
fn calling_non_callable_is_runtime_error() {
    assert_eq!(run_err("var x = 1; x();"), InterpretError::Runtime);
}

#[test]
fn runaway_recursion_overflows_frames() {
    assert_eq!(run_err("func f() { f(); } f();"), InterpretError::Runtime);
}

// -- Classes --

#[test]
fn inherited_method_dispatch() {
    let source = "class A { hello() { print \"hi\"; } } class B < A {} B().hello();";
    assert_eq!(run(source), "hi\n");
}

#[test]
fn initializer_sets_fields() {
    let source = "class Point { init(x, y) { this.x = x; this.y = y; } }
                  var p = Point(1, 2); print p.x + p.y;";
    assert_eq!(run(source), "3\n");
}

#[test]
fn constructor_returns_the_instance() {
    let source = "class Point { init(x, y) { this.x = x; this.y = y; } }
                  print Point(1, 2).x;";
    assert_eq!(run(source), "1\n");
}

#[test]
fn methods_bind_their_receiver() {
    let source = "class Greeter { init(name) { this.name = name; }
                                  greet() { \"hello \" + this.name } }
                  var m = Greeter(\"ada\").greet; print m();";
    assert_eq!(run(source), "hello ada\n");
}

#[test]
fn super_calls_the_parent_method() {
    let source = "class A { greet() { \"A\" } }
                  class B < A { greet() { super.greet() + \"B\" } }
                  print B().greet();";
    assert_eq!(run(source), "AB\n");
}

#[test]
fn fields_shadow_methods_and_invoke_unbound() {
    let source = "class A { m() { \"method\" } }
                  var a = A(); print a.m();
                  a.m = func () { \"field\" }; print a.m();";
    assert_eq!(run(source), "method\nfield\n");
}

#[test]
fn class_arity_checked_without_initializer() {
    assert_eq!(run_err("class A {} A(1);"), InterpretError::Runtime);
}

#[test]
fn inheriting_from_non_class_is_runtime_error() {
    assert_eq!(run_err("var NotAClass = 1; class B < NotAClass {}"), InterpretError::Runtime);
}

#[test]
fn property_on_primitive_is_runtime_error() {
    assert_eq!(run_err("print 1.field;"), InterpretError::Runtime);
    assert_eq!(run_err("var x = 1; x.field = 2;"), InterpretError::Runtime);
}

// -- Lists --

#[test]
fn list_append_length_index() {
    let source = "var xs = [1,2,3]; xs.append(4); print xs.length; print xs[3];";
    assert_eq!(run(source), "4\n4\n");
}

#[test]
fn list_element_assignment() {
    assert_eq!(run("var xs = [1, 2]; xs[0] = 9; print xs;"), "[9, 2]\n");
}

#[test]
fn list_index_out_of_bounds() {
    assert_eq!(run_err("var xs=[1]; print xs[5];"), InterpretError::Runtime);
    assert_eq!(run_err("var xs=[1]; print xs[-1];"), InterpretError::Runtime);
}

#[test]
fn list_index_must_be_whole_number() {
    assert_eq!(run_err("var xs=[1]; print xs[0.5];"), InterpretError::Runtime);
    assert_eq!(run_err("var xs=[1]; print xs[\"0\"];"), InterpretError::Runtime);
}

#[test]
fn append_returns_its_argument() {
    assert_eq!(run("var xs = []; print xs.append(7);"), "7\n");
}

// -- Strings --

#[test]
fn string_length_and_index() {
    assert_eq!(run("print \"hello\".length;"), "5\n");
    assert_eq!(run("print \"abc\"[1];"), "b\n");
}

#[test]
fn string_index_errors() {
    assert_eq!(run_err("print \"abc\"[3];"), InterpretError::Runtime);
    assert_eq!(run_err("\"abc\"[0] = \"x\";"), InterpretError::Runtime);
}

#[test]
fn string_indexing_yields_raw_bytes() {
    // Strings are byte sequences: "é" is the two UTF-8 bytes 0xC3 0xA9, and
    // indexing slices single bytes, not characters.
    assert_eq!(run("print \"é\".length;"), "2\n");
    assert_eq!(run("print \"é\"[0].length;"), "1\n");
    assert_eq!(run("print \"é\"[1].length;"), "1\n");
    // Reassembling the bytes re-interns the original string.
    assert_eq!(run("print \"é\"[0] + \"é\"[1] == \"é\";"), "true\n");
    assert_eq!(run_err("print \"é\"[2];"), InterpretError::Runtime);
}

// -- Iteration --

#[test]
fn for_over_string_yields_characters() {
    assert_eq!(run("for c in \"wow\" { print c; }"), "w\no\nw\n");
}

#[test]
fn for_over_string_iterates_bytes() {
    // "né" is three bytes; each iteration yields one raw byte, and putting
    // them back together recovers the identical interned string.
    let source = "var n = 0; var s = \"\"; for b in \"né\" { n = n + 1; s = s + b; } \
                  print n; print s == \"né\";";
    assert_eq!(run(source), "3\ntrue\n");
}

#[test]
fn for_over_list() {
    assert_eq!(run("var sum = 0; for x in [1, 2, 3] { sum = sum + x; } print sum;"), "6\n");
}

#[test]
fn for_over_empty_list_runs_zero_times() {
    assert_eq!(run("for x in [] { print x; } print \"done\";"), "done\n");
}

#[test]
fn iterating_non_iterable_is_runtime_error() {
    assert_eq!(run_err("for x in 5 { print x; }"), InterpretError::Runtime);
}

// -- Dicts --

#[test]
fn dict_literal_and_indexing() {
    let source = "var d = dict { \"a\" => 1, 2 => \"b\" };
                  print d[\"a\"]; print d[2];";
    assert_eq!(run(source), "1\nb\n");
}

#[test]
fn dict_assignment_and_length() {
    let source = "var d = dict { \"a\" => 1 }; d[\"b\"] = 2; print d.length; print d[\"b\"];";
    assert_eq!(run(source), "2\n2\n");
}

#[test]
fn dict_missing_key_is_runtime_error() {
    assert_eq!(run_err("var d = dict {}; print d[\"nope\"];"), InterpretError::Runtime);
}

#[test]
fn unhashable_dict_key_is_fatal() {
    assert_eq!(run_err("var d = dict { [1] => 2 };"), InterpretError::Runtime);
    assert_eq!(run_err("var d = dict {}; d[[1]] = 2;"), InterpretError::Runtime);
}

// -- Options --

#[test]
fn options_print_and_unwrap() {
    assert_eq!(run("print some 5;"), "some(5)\n");
    assert_eq!(run("print none;"), "none\n");
    assert_eq!(run("var o = some 3; print o.unwrap();"), "3\n");
}

#[test]
fn none_literals_are_the_same_object() {
    assert_eq!(run("print none == none;"), "true\n");
}

#[test]
fn none_is_falsy_in_conditions() {
    assert_eq!(run("print if none { 1 } else { 2 };"), "2\n");
    assert_eq!(run("print if some 0 { 1 } else { 2 };"), "1\n");
}

#[test]
fn unwrapping_none_is_runtime_error() {
    assert_eq!(run_err("none.unwrap();"), InterpretError::Runtime);
}

// -- Type error scenarios --

#[test]
fn mixed_addition_is_runtime_error() {
    assert_eq!(run_err("print 1 + \"a\";"), InterpretError::Runtime);
}

#[test]
fn arithmetic_on_non_numbers_is_runtime_error() {
    assert_eq!(run_err("print \"a\" * 2;"), InterpretError::Runtime);
    assert_eq!(run_err("print -\"a\";"), InterpretError::Runtime);
    assert_eq!(run_err("print 1 < \"a\";"), InterpretError::Runtime);
}

// -- Natives --

#[test]
fn clock_is_a_nonnegative_number() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn clock_rejects_arguments() {
    assert_eq!(run_err("clock(1);"), InterpretError::Runtime);
}

// -- Garbage collection under stress --

#[test]
fn stressed_gc_preserves_program_behavior() {
    let source = "func outer() { var a = 1; func inner() { a = a + 1; a } inner } \
                  var f = outer(); print f(); print f(); print f();";
    assert_eq!(run_stressed(source), "2\n3\n4\n");
}

#[test]
fn stressed_gc_with_temporaries() {
    let source = "var parts = \"\";
                  for c in \"raven\" { parts = parts + c + \"-\"; }
                  print parts;";
    assert_eq!(run_stressed(source), "r-a-v-e-n-\n");
}

#[test]
fn stressed_gc_with_classes_and_dicts() {
    let source = "class Box { init(v) { this.v = v; } }
                  var d = dict { \"k\" => Box(7) };
                  print d[\"k\"].v;";
    assert_eq!(run_stressed(source), "7\n");
}

#[test]
fn repl_style_reuse_keeps_globals() {
    let (mut vm, buf) = capture_vm();
    vm.interpret("var a = 40;").expect("first line failed");
    vm.interpret("print a + 2;").expect("second line failed");
    let bytes = buf.0.borrow().clone();
    assert_eq!(String::from_utf8(bytes).unwrap(), "42\n");
}

#[test]
fn vm_recovers_after_runtime_error() {
    let (mut vm, buf) = capture_vm();
    assert_eq!(vm.interpret("print missing;"), Err(InterpretError::Runtime));
    vm.interpret("print \"still alive\";").expect("vm did not recover");
    let bytes = buf.0.borrow().clone();
    assert_eq!(String::from_utf8(bytes).unwrap(), "still alive\n");
}
