//! Tests for compile-time rejection: each invalid program must fail with a
//! diagnostic mentioning the offending construct.

use grace::{CompileOptions, compile_source};

fn compile_err(source: &str) -> String {
    match compile_source("test.gr", source.to_owned(), CompileOptions::default()) {
        Ok(_) => panic!("program should not compile:\n{source}"),
        Err(failure) => failure
            .diagnostics
            .iter()
            .map(|diagnostic| diagnostic.message.clone())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn assert_rejected(source: &str, expected_fragment: &str) {
    let messages = compile_err(source);
    assert!(
        messages.contains(expected_fragment),
        "expected diagnostic containing {expected_fragment:?}, got:\n{messages}"
    );
}

#[test]
fn reassigning_a_final_local() {
    assert_rejected(
        "func main():\n  final x = 1;\n  x = 2;\nend\n",
        "Cannot reassign to final 'x'",
    );
}

#[test]
fn shadowing_an_existing_local() {
    assert_rejected(
        "func main():\n  var x = 1;\n  var x = 2;\nend\n",
        "A local variable with the same name already exists",
    );
}

#[test]
fn final_requires_an_initialiser() {
    assert_rejected(
        "func main():\n  final x;\nend\n",
        "Must assign to `final` upon declaration",
    );
}

#[test]
fn double_underscore_names_are_reserved() {
    assert_rejected(
        "func main():\n  var __secret = 1;\nend\n",
        "reserved for internal use",
    );
}

#[test]
fn statements_are_rejected_at_top_level() {
    assert_rejected(
        "println(1);\nfunc main():\nend\n",
        "Only functions and classes are allowed at top level",
    );
}

#[test]
fn break_outside_a_loop() {
    assert_rejected(
        "func main():\n  break;\nend\n",
        "`break` only allowed inside loops",
    );
}

#[test]
fn continue_outside_a_loop() {
    assert_rejected(
        "func main():\n  continue;\nend\n",
        "`continue` only allowed inside loops",
    );
}

#[test]
fn chained_assignment_is_rejected() {
    assert_rejected(
        "func main():\n  var a = 1;\n  var b = 2;\n  var c = 3;\n  a = b = c;\nend\n",
        "Assignment is not valid in the current context",
    );
}

#[test]
fn unknown_variable_suggests_a_near_miss() {
    assert_rejected(
        "func main():\n  var count = 0;\n  println(cout);\nend\n",
        "did you mean 'count'?",
    );
}

#[test]
fn import_must_precede_declarations() {
    assert_rejected(
        "func main():\nend\nimport helpers;\n",
        "`import` only allowed before any other declarations",
    );
}

#[test]
fn const_only_at_top_level() {
    assert_rejected(
        "func main():\n  const X = 1;\nend\n",
        "`const` declarations are only allowed at top level",
    );
}

#[test]
fn const_requires_a_literal() {
    assert_rejected(
        "const X = [1, 2];\nfunc main():\nend\n",
        "Expected literal value after `const` declaration",
    );
}

#[test]
fn duplicate_constant_names() {
    assert_rejected(
        "const X = 1;\nconst X = 2;\nfunc main():\nend\n",
        "A constant with the same name already exists",
    );
}

#[test]
fn local_may_not_shadow_a_constant() {
    assert_rejected(
        "const X = 1;\nfunc main():\n  var X = 2;\nend\n",
        "A constant with the same name already exists",
    );
}

#[test]
fn main_takes_at_most_one_parameter() {
    assert_rejected(
        "func main(a, b, c):\nend\n",
        "`main` function can only take 0 or 1 parameter(s)",
    );
}

#[test]
fn calling_main_is_rejected() {
    assert_rejected(
        "func main():\n  main();\nend\n",
        "Cannot call the `main` function",
    );
}

#[test]
fn return_from_main_is_rejected() {
    assert_rejected(
        "func main():\n  return 1;\nend\n",
        "Cannot return from main function",
    );
}

#[test]
fn return_from_constructor_is_rejected() {
    assert_rejected(
        "class Thing:\n  constructor():\n    return;\n  end\nend\nfunc main():\nend\n",
        "Cannot return from a constructor",
    );
}

#[test]
fn missing_main_fails_after_parsing() {
    assert_rejected(
        "func helper():\n  return 1;\nend\n",
        "Could not find `main` function",
    );
}

#[test]
fn unknown_native_function() {
    assert_rejected(
        "func main():\n  __NATIVE_DOES_NOT_EXIST();\nend\n",
        "No native function matching the given signature",
    );
}

#[test]
fn native_call_arity_is_checked_at_compile_time() {
    assert_rejected(
        "func main():\n  __NATIVE_LIST_LENGTH([1], 2);\nend\n",
        "Incorrect number of arguments given to native call",
    );
}

#[test]
fn duplicate_function_names_in_one_file() {
    assert_rejected(
        "func twice():\nend\nfunc twice():\nend\nfunc main():\nend\n",
        "already exists with the same name",
    );
}

#[test]
fn class_member_after_constructor() {
    assert_rejected(
        "class Thing:\n  constructor():\n  end\n  var late;\nend\nfunc main():\nend\n",
        "Member variable declarations can only come before the constructor",
    );
}

#[test]
fn functions_only_at_top_level() {
    assert_rejected(
        "func main():\n  func nested():\n  end\nend\n",
        "Functions are only allowed at top level",
    );
}

#[test]
fn catch_requires_a_preceding_try() {
    assert_rejected(
        "func main():\n  catch e:\nend\n",
        "`catch` block only allowed after `try` block",
    );
}

#[test]
fn unterminated_string_is_reported() {
    let messages = compile_err("func main():\n  var s = \"oops;\nend\n");
    assert!(!messages.is_empty(), "unterminated string should error");
}

#[test]
fn char_literal_length_is_validated() {
    assert_rejected(
        "func main():\n  var c = 'ab';\nend\n",
        "`char` must contain a single character or escape character",
    );
}

#[test]
fn multiple_errors_are_reported_after_resynchronisation() {
    let messages = compile_err(
        "func main():\n  var x = 1;\n  x = unknown_one;\n  var y = 2;\n  y = unknown_two;\nend\n",
    );
    assert!(
        messages.contains("unknown_one") && messages.contains("unknown_two"),
        "panic mode should recover and report both errors, got:\n{messages}"
    );
}

#[test]
fn warnings_become_errors_when_promoted() {
    let options = CompileOptions {
        verbose: false,
        warnings_error: true,
    };
    let result = compile_source(
        "test.gr",
        "func main():\n  var x = 1;\n  println(instanceof(x, null));\nend\n".to_owned(),
        options,
    );
    assert!(result.is_err(), "instanceof-null warning should be promoted");
    let failure = result.err().expect("checked above");
    assert!(
        failure.rendered.contains("Prefer comparison `== null`"),
        "got:\n{}",
        failure.rendered
    );
}

#[test]
fn mixing_range_and_items_in_list_literal() {
    assert_rejected(
        "func main():\n  var xs = [1, 2..5];\nend\n",
        "Cannot mix single items and range expressions",
    );
}

#[test]
fn dict_constructor_form_is_rejected() {
    assert_rejected(
        "func main():\n  var d = Dict(1, 2);\nend\n",
        "Cannot use `Dict` like a constructor",
    );
}

#[test]
fn assigning_to_a_call_result_is_rejected() {
    assert_rejected(
        "func foo():\n  return 1;\nend\nfunc main():\n  foo() = 2;\nend\n",
        "Only identifiers can be assigned to",
    );
}
