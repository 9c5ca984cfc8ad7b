//! End-to-end tests: compile a source string, run it against a collecting
//! writer, and assert on the program's output and outcome.

use grace::{CollectPrint, CompileOptions, InterpretResult, Vm, compile_source};
use pretty_assertions::assert_eq;

struct RunOutput {
    result: InterpretResult,
    stdout: String,
    stderr: String,
    live_objects: usize,
}

fn run(source: &str) -> RunOutput {
    run_with_args(source, &[])
}

fn run_with_args(source: &str, args: &[&str]) -> RunOutput {
    let program = compile_source("test.gr", source.to_owned(), CompileOptions::default())
        .unwrap_or_else(|failure| panic!("program failed to compile:\n{}", failure.rendered));
    let mut writer = CollectPrint::new();
    let args: Vec<String> = args.iter().map(|&a| a.to_owned()).collect();
    let mut vm = Vm::new(program);
    let result = vm.run(&args, &mut writer);
    RunOutput {
        result,
        stdout: writer.stdout().to_owned(),
        stderr: writer.stderr().to_owned(),
        live_objects: vm.live_objects(),
    }
}

fn expect_stdout(source: &str, expected: &str) {
    let output = run(source);
    assert_eq!(
        output.result,
        InterpretResult::RuntimeOk,
        "program should succeed, stderr:\n{}",
        output.stderr
    );
    assert_eq!(output.stdout, expected);
    assert_eq!(output.live_objects, 0, "all objects should be reclaimed");
}

// =============================================================================
// 1. Core scenarios
// =============================================================================

#[test]
fn arithmetic_precedence() {
    expect_stdout(
        "func main():\n  println(1 + 2 * 3);\nend\n",
        "7\n",
    );
}

#[test]
fn list_iteration_sums_elements() {
    expect_stdout(
        "func main():\n  var xs = [1, 2, 3];\n  var s = 0;\n  for x in xs: s = s + x; end\n  println(s);\nend\n",
        "6\n",
    );
}

#[test]
fn recursive_fibonacci() {
    expect_stdout(
        "func fib(n):\n  if n < 2: return n; end\n  return fib(n - 1) + fib(n - 2);\nend\nfunc main():\n  println(fib(10));\nend\n",
        "55\n",
    );
}

#[test]
fn dictionary_two_variable_iteration() {
    let output = run(
        "func main():\n  var d = { \"a\": 1, \"b\": 2 };\n  for k, v in d: println(k); println(v); end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    let lines: Vec<&str> = output.stdout.lines().collect();
    assert_eq!(lines.len(), 4, "two lines per entry: {lines:?}");
    let mut pairs: Vec<(&str, &str)> = lines.chunks(2).map(|pair| (pair[0], pair[1])).collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![("a", "1"), ("b", "2")]);
    assert_eq!(output.live_objects, 0);
}

#[test]
fn thrown_string_is_caught_and_printed() {
    let output = run(
        "func main():\n  try:\n    throw(\"boom\");\n  catch e:\n    println(e);\n  end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert!(
        output.stdout.contains("boom"),
        "caught exception should mention the message: {}",
        output.stdout
    );
    assert_eq!(output.live_objects, 0);
}

#[test]
fn class_constructor_and_member_access() {
    expect_stdout(
        "class Point:\n  var x;\n  var y;\n  constructor(a, b):\n    x = a; y = b;\n  end\nend\nfunc main():\n  final p = Point(3, 4);\n  println(p.x + p.y);\nend\n",
        "7\n",
    );
}

// =============================================================================
// 2. Operator semantics
// =============================================================================

#[test]
fn numeric_widening_and_float_display() {
    expect_stdout(
        "func main():\n  println(1 + 0.5);\n  println(2.0);\n  println(7 / 2);\n  println(7.0 / 2);\nend\n",
        "1.5\n2\n3\n3.5\n",
    );
}

#[test]
fn string_and_char_operators() {
    expect_stdout(
        "func main():\n  println(\"ab\" + \"cd\");\n  println(\"ab\" + 'c');\n  println('a' + 'b');\n  println(\"ab\" * 2);\n  println('x' * 3);\n  println(\"ab\" * -1);\nend\n",
        "abcd\nabc\nab\nabab\nxxx\n\n",
    );
}

#[test]
fn list_repetition() {
    expect_stdout(
        "func main():\n  var xs = [1, 2] * 3;\n  println(__NATIVE_LIST_LENGTH(xs));\n  println(xs);\nend\n",
        "6\n[1, 2, 1, 2, 1, 2]\n",
    );
}

#[test]
fn equality_never_throws() {
    expect_stdout(
        "func main():\n  println(1 == 1.0);\n  println('a' == \"a\");\n  println(1 == \"1\");\n  println(null == null);\n  println(1 != 2);\nend\n",
        "true\ntrue\nfalse\ntrue\ntrue\n",
    );
}

#[test]
fn bitwise_and_shift_operators() {
    expect_stdout(
        "func main():\n  println(6 & 3);\n  println(6 | 3);\n  println(6 ^ 3);\n  println(~0);\n  println(1 << 4);\n  println(32 >> 2);\n  println(2 ** 10);\n  println(7 % 3);\nend\n",
        "2\n7\n5\n-1\n16\n8\n1024\n1\n",
    );
}

#[test]
fn truthiness_rules() {
    expect_stdout(
        "func main():\n  if \"false\": println(\"truthy\"); else: println(\"falsy\"); end\n  if -1: println(\"negative is truthy\"); end\n  if null: println(\"unreachable\"); else: println(\"null is falsy\"); end\n  if []: println(\"unreachable\"); else: println(\"empty list is falsy\"); end\nend\n",
        "falsy\nnegative is truthy\nnull is falsy\nempty list is falsy\n",
    );
}

#[test]
fn compound_assignment() {
    expect_stdout(
        "func main():\n  var x = 10;\n  x += 5;\n  x -= 3;\n  x *= 2;\n  x /= 4;\n  println(x);\nend\n",
        "6\n",
    );
}

#[test]
fn unary_operators() {
    expect_stdout(
        "func main():\n  println(-5);\n  println(!true);\n  println(!0);\nend\n",
        "-5\nfalse\ntrue\n",
    );
}

// =============================================================================
// 3. Control flow
// =============================================================================

#[test]
fn while_loop_with_break_and_continue() {
    expect_stdout(
        "func main():\n  var i = 0;\n  var s = 0;\n  while true:\n    i += 1;\n    if i > 10: break; end\n    if i % 2 == 0: continue; end\n    s += i;\n  end\n  println(s);\nend\n",
        "25\n",
    );
}

#[test]
fn else_if_chain() {
    expect_stdout(
        "func grade(score):\n  if score >= 90: return \"A\";\n  else if score >= 80: return \"B\";\n  else: return \"C\";\n  end\nend\nfunc main():\n  println(grade(95));\n  println(grade(85));\n  println(grade(40));\nend\n",
        "A\nB\nC\n",
    );
}

#[test]
fn empty_iterable_runs_body_zero_times() {
    expect_stdout(
        "func main():\n  var count = 0;\n  for x in []: count += 1; end\n  println(count);\nend\n",
        "0\n",
    );
}

#[test]
fn range_iteration() {
    expect_stdout(
        "func main():\n  var s = 0;\n  for i in [0..5]: s += i; end\n  println(s);\n  var t = 0;\n  for i in [0..10 by 2]: t += i; end\n  println(t);\n  var d = 0;\n  for i in [5..0 by -1]: d += i; end\n  println(d);\nend\n",
        "10\n20\n15\n",
    );
}

#[test]
fn nested_loops_patch_break_correctly() {
    expect_stdout(
        "func main():\n  var total = 0;\n  for i in [0..3]:\n    for j in [0..10]:\n      if j == 2: break; end\n      total += 1;\n    end\n  end\n  println(total);\nend\n",
        "6\n",
    );
}

// =============================================================================
// 4. Collections
// =============================================================================

#[test]
fn list_subscripts() {
    expect_stdout(
        "func main():\n  var xs = [10, 20, 30];\n  println(xs[0]);\n  xs[1] = 99;\n  println(xs[1]);\nend\n",
        "10\n99\n",
    );
}

#[test]
fn string_subscript_yields_char() {
    expect_stdout(
        "func main():\n  var s = \"hello\";\n  println(s[1]);\nend\n",
        "e\n",
    );
}

#[test]
fn dict_key_equality_widens() {
    expect_stdout(
        "func main():\n  var d = { 1: \"one\" };\n  println(d[1.0]);\nend\n",
        "one\n",
    );
}

#[test]
fn dict_subscript_assignment_inserts() {
    expect_stdout(
        "func main():\n  var d = { \"a\": 1 };\n  d[\"b\"] = 2;\n  println(d[\"b\"]);\n  println(__NATIVE_DICTIONARY_CONTAINS_KEY(d, \"a\"));\nend\n",
        "2\ntrue\n",
    );
}

#[test]
fn list_removal_returns_the_element() {
    expect_stdout(
        "func main():\n  var xs = [1, 2, 3];\n  println(__NATIVE_REMOVE_LIST_AT_INDEX(xs, 1));\n  println(xs);\nend\n",
        "2\n[1, 3]\n",
    );
}

#[test]
fn removing_from_an_empty_list_is_a_collection_error() {
    let output = run(
        "func main():\n  var xs = [];\n  try:\n    __NATIVE_REMOVE_LIST_AT_INDEX(xs, 0);\n  catch e:\n    println(e);\n  end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert!(
        output.stdout.contains("Invalid collection operation"),
        "got: {}",
        output.stdout
    );
}

#[test]
fn dict_removal_reports_presence() {
    expect_stdout(
        "func main():\n  var d = { \"a\": 1 };\n  println(__NATIVE_DICTIONARY_REMOVE(d, \"a\"));\n  println(__NATIVE_DICTIONARY_REMOVE(d, \"a\"));\n  println(__NATIVE_DICTIONARY_CONTAINS_KEY(d, \"a\"));\nend\n",
        "true\nfalse\nfalse\n",
    );
}

#[test]
fn set_deduplicates() {
    expect_stdout(
        "func main():\n  var s = Set(1, 2, 2, 3, 3.0);\n  var count = 0;\n  for x in s: count += 1; end\n  println(count);\nend\n",
        "3\n",
    );
}

#[test]
fn list_cast_explodes_strings() {
    expect_stdout(
        "func main():\n  var chars = List(\"abc\");\n  println(__NATIVE_LIST_LENGTH(chars));\n  println(chars);\nend\n",
        "3\n['a', 'b', 'c']\n",
    );
}

#[test]
fn container_display_forms() {
    expect_stdout(
        "func main():\n  println([1, \"a\", 'b']);\n  println(KeyValuePair(\"k\", 1));\n  println([1..7 by 2]);\nend\n",
        "[1, \"a\", 'b']\n{\"k\": 1}\n[1..7 by 2]\n",
    );
}

#[test]
fn instance_display_lists_members_in_order() {
    expect_stdout(
        "class Point:\n  var x;\n  var y;\n  constructor(a, b):\n    x = a; y = b;\n  end\nend\nfunc main():\n  println(Point(3, 4));\nend\n",
        "Point [ x: 3, y: 4 ]\n",
    );
}

#[test]
fn cyclic_list_prints_elided_and_is_reclaimed() {
    let output = run(
        "func main():\n  var xs = [1];\n  __NATIVE_APPEND_LIST(xs, xs);\n  println(xs);\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert_eq!(output.stdout, "[1, [...]]\n");
    assert_eq!(output.live_objects, 0, "cycle should be reclaimed");
}

// =============================================================================
// 5. Types, casts, and introspection
// =============================================================================

#[test]
fn typename_reports_canonical_names() {
    expect_stdout(
        "func main():\n  println(typename(1));\n  println(typename(1.5));\n  println(typename(\"s\"));\n  println(typename('c'));\n  println(typename(true));\n  println(typename(null));\n  println(typename([1]));\n  println(typename({ 1: 2 }));\nend\n",
        "Int\nFloat\nString\nChar\nBool\nNull\nList\nDict\n",
    );
}

#[test]
fn instanceof_checks() {
    expect_stdout(
        "class Point:\n  var x;\nend\nfunc main():\n  println(instanceof(5, Int));\n  println(instanceof(5, Float));\n  println(instanceof([1], List));\n  println(instanceof(Point(), Point));\nend\n",
        "true\nfalse\ntrue\ntrue\n",
    );
}

#[test]
fn casts_between_primitives() {
    expect_stdout(
        "func main():\n  println(Int(\"42\") + 1);\n  println(Float(2) / 4);\n  println(String(1.5) + \"!\");\n  println(Char(65));\n  println(Bool(0));\n  println(Int(3.9));\nend\n",
        "43\n0.5\n1.5!\nA\nfalse\n3\n",
    );
}

#[test]
fn isobject_distinguishes_heap_values() {
    expect_stdout(
        "func main():\n  println(isobject([1]));\n  println(isobject(1));\n  println(isobject(\"s\"));\nend\n",
        "true\nfalse\nfalse\n",
    );
}

// =============================================================================
// 6. Functions and dispatch
// =============================================================================

#[test]
fn implicit_return_yields_null() {
    expect_stdout(
        "func noop():\nend\nfunc main():\n  var result = noop();\n  println(result);\nend\n",
        "null\n",
    );
}

#[test]
fn extension_method_dispatches_on_type_name() {
    expect_stdout(
        "func doubled(this Int x):\n  return x * 2;\nend\nfunc main():\n  println(doubled(5) + 5.doubled());\nend\n",
        "20\n",
    );
}

#[test]
fn extension_method_on_class_instances() {
    expect_stdout(
        "class Counter:\n  var n;\n  constructor(start):\n    n = start;\n  end\nend\nfunc bump(this Counter c):\n  return c.n + 1;\nend\nfunc main():\n  println(Counter(41).bump());\nend\n",
        "42\n",
    );
}

#[test]
fn main_receives_command_line_args() {
    let output = run_with_args(
        "func main(argv):\n  for a in argv: println(a); end\nend\n",
        &["first", "second"],
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert_eq!(output.stdout, "first\nsecond\n");
}

// =============================================================================
// 7. Exceptions and errors
// =============================================================================

#[test]
fn runtime_errors_are_catchable() {
    expect_stdout(
        "func main():\n  try:\n    var xs = [1];\n    println(xs[5]);\n  catch e:\n    println(\"caught\");\n  end\nend\n",
        "caught\n",
    );
}

#[test]
fn caught_exception_prints_kind_and_message() {
    let output = run(
        "func main():\n  try:\n    var d = { \"a\": 1 };\n    println(d[\"missing\"]);\n  catch e:\n    println(e);\n  end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert!(
        output.stdout.contains("Key not found"),
        "got: {}",
        output.stdout
    );
}

#[test]
fn exception_unwinds_nested_calls() {
    expect_stdout(
        "func explode():\n  throw(\"deep\");\nend\nfunc middle():\n  explode();\n  return 0;\nend\nfunc main():\n  try:\n    middle();\n  catch e:\n    println(\"handled\");\n  end\n  println(\"after\");\nend\n",
        "handled\nafter\n",
    );
}

#[test]
fn rethrown_exception_object_keeps_its_kind() {
    let output = run(
        "func main():\n  try:\n    throw(Exception(\"custom failure\"));\n  catch e:\n    println(e);\n  end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert!(output.stdout.contains("custom failure"), "got: {}", output.stdout);
}

#[test]
fn uncaught_error_reports_trace_and_fails() {
    let output = run(
        "func main():\n  var xs = [1];\n  println(xs[5]);\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeError);
    assert!(output.stderr.contains("Call stack"), "got: {}", output.stderr);
    assert!(output.stderr.contains("Index out of range"), "got: {}", output.stderr);
    assert_eq!(output.live_objects, 0);
}

#[test]
fn int_division_by_zero_throws_float_does_not() {
    let failing = run("func main():\n  println(1 / 0);\nend\n");
    assert_eq!(failing.result, InterpretResult::RuntimeError);

    expect_stdout("func main():\n  println(1.0 / 0);\nend\n", "inf\n");
}

#[test]
fn assertion_failure_stops_execution() {
    let output = run("func main():\n  assert(1 == 2, \"math broke\");\nend\n");
    assert_eq!(output.result, InterpretResult::RuntimeError);
    assert!(
        output.stderr.contains("assertion failed: math broke"),
        "got: {}",
        output.stderr
    );
}

#[test]
fn comparing_incomparable_types_throws() {
    let output = run("func main():\n  println(1 < \"two\");\nend\n");
    assert_eq!(output.result, InterpretResult::RuntimeError);
    assert!(output.stderr.contains("Invalid operand"), "got: {}", output.stderr);
}

#[test]
fn mutation_during_iteration_invalidates_the_iterator() {
    let output = run(
        "func main():\n  var xs = [1, 2, 3];\n  try:\n    for x in xs:\n      __NATIVE_APPEND_LIST(xs, x);\n    end\n  catch e:\n    println(e);\n  end\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert!(output.stdout.contains("Invalid iterator"), "got: {}", output.stdout);
    assert_eq!(output.live_objects, 0);
}

#[test]
fn eprint_goes_to_stderr() {
    let output = run("func main():\n  eprintln(\"warned\");\n  println(\"ok\");\nend\n");
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert_eq!(output.stdout, "ok\n");
    assert_eq!(output.stderr, "warned\n");
}

#[test]
fn system_exit_sets_exit_code() {
    let output = run("func main():\n  __NATIVE_SYSTEM_EXIT(3);\n  println(\"unreachable\");\nend\n");
    assert_eq!(output.result, InterpretResult::Exited(3));
    assert_eq!(output.stdout, "");
    assert_eq!(output.live_objects, 0);
}

// =============================================================================
// 8. Constants and imports
// =============================================================================

#[test]
fn constants_are_inlined_at_compile_time() {
    expect_stdout(
        "const LIMIT = 10;\nconst GREETING = \"hi\";\nfunc main():\n  println(LIMIT * 2);\n  println(GREETING);\nend\n",
        "20\nhi\n",
    );
}

#[test]
fn negative_numeric_constants() {
    expect_stdout(
        "const OFFSET = -5;\nfunc main():\n  println(OFFSET + 10);\nend\n",
        "5\n",
    );
}

#[test]
fn imports_resolve_functions_and_constants() {
    let dir = tempfile::tempdir().expect("temp dir");
    let lib_path = dir.path().join("mathlib.gr");
    std::fs::write(
        &lib_path,
        "const export SCALE = 10;\nfunc export scaled(x):\n  return x * SCALE;\nend\nfunc hidden():\n  return 0;\nend\n",
    )
    .expect("write lib");
    let main_path = dir.path().join("main.gr");
    std::fs::write(
        &main_path,
        "import mathlib;\nfunc main():\n  println(mathlib::scaled(4));\n  println(mathlib::SCALE);\nend\n",
    )
    .expect("write main");

    let program = grace::compile_file(&main_path, CompileOptions::default())
        .unwrap_or_else(|failure| panic!("compile failed:\n{}", failure.rendered));
    let mut writer = CollectPrint::new();
    let result = Vm::new(program).run(&[], &mut writer);
    assert_eq!(result, InterpretResult::RuntimeOk, "stderr: {}", writer.stderr());
    assert_eq!(writer.stdout(), "40\n10\n");
}

#[test]
fn calling_unexported_function_across_files_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("privatelib.gr"),
        "func hidden():\n  return 0;\nend\n",
    )
    .expect("write lib");
    let main_path = dir.path().join("main.gr");
    std::fs::write(
        &main_path,
        "import privatelib;\nfunc main():\n  privatelib::hidden();\nend\n",
    )
    .expect("write main");

    let program = grace::compile_file(&main_path, CompileOptions::default())
        .unwrap_or_else(|failure| panic!("compile failed:\n{}", failure.rendered));
    let mut writer = CollectPrint::new();
    let result = Vm::new(program).run(&[], &mut writer);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(
        writer.stderr().contains("not been exported"),
        "got: {}",
        writer.stderr()
    );
}

// =============================================================================
// 9. Invariants
// =============================================================================

#[test]
fn heavy_allocation_is_fully_reclaimed() {
    let output = run(
        "func build(n):\n  var out = [];\n  for i in [0..n]:\n    __NATIVE_APPEND_LIST(out, [i, i * 2]);\n  end\n  return out;\nend\nfunc main():\n  var acc = 0;\n  for round in [0..10]:\n    var rows = build(20);\n    for row in rows: acc += row[0]; end\n  end\n  println(acc);\nend\n",
    );
    assert_eq!(output.result, InterpretResult::RuntimeOk);
    assert_eq!(output.stdout, "1900\n");
    assert_eq!(output.live_objects, 0);
}

#[test]
fn value_stack_balances_through_unused_results() {
    expect_stdout(
        "func side():\n  return 1;\nend\nfunc main():\n  side();\n  side();\n  println(2);\nend\n",
        "2\n",
    );
}
