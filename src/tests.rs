//! # Tests Module
//!
//! End-to-end tests for the Totem pipeline: lexer, parser, compiler lowering,
//! linking, and the interpreter's arithmetic, control flow, containers,
//! conversions, coroutines and refcounting.

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;

    use crate::builtin::register_all;
    use crate::compiler::{Compiler, INIT_GLOBALS};
    use crate::error::{ErrorKind, EvalError, ExecError, ExecResult, LinkError};
    use crate::instruction::Opcode;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::register::RegisterValue;
    use crate::runtime::Runtime;
    use crate::script::{Actor, Script};
    use crate::token::TokenKind;
    use crate::value::{PublicType, Value};
    use crate::vm::{ExecConfig, ExecState};

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn runtime() -> Arc<Runtime> {
        let runtime = Arc::new(Runtime::new());
        register_all(&runtime).expect("builtins register");
        runtime
    }

    /// Compiles, links and runs `__initGlobals`, returning the actor, the
    /// state and the result of the run.
    fn run_with(
        runtime: Arc<Runtime>,
        config: ExecConfig,
        source: &str,
    ) -> (Actor, ExecState, ExecResult<Value>) {
        let script = crate::load(source, &runtime).unwrap_or_else(|e| panic!("{}", e));
        let actor = Actor::new(Arc::new(script));
        let mut state = ExecState::with_config(runtime, config);
        let result = state.exec(&actor, 0, &[]);
        (actor, state, result)
    }

    fn run(source: &str) -> (Actor, ExecState) {
        let (actor, state, result) = run_with(runtime(), ExecConfig::default(), source);
        if let Err(e) = result {
            panic!("unexpected {}: {}", e.describe(), source);
        }
        (actor, state)
    }

    fn exec_error(source: &str) -> ExecError {
        let (_, _, result) = run_with(runtime(), ExecConfig::default(), source);
        match result {
            Ok(v) => panic!("expected an error, got {:?}", v),
            Err(e) => e,
        }
    }

    fn global(actor: &Actor, name: &str) -> Value {
        actor
            .global_by_name(name)
            .unwrap_or_else(|| panic!("no global '{}'", name))
    }

    fn compile_error_with(runtime: &Runtime, source: &str) -> EvalError {
        let tokens = Lexer::new(source).tokenize().expect("lexes");
        let stmts = Parser::new(tokens).parse().expect("parses");
        match Compiler::compile(&stmts, runtime) {
            Ok(_) => panic!("expected a compile error: {}", source),
            Err(e) => e.error,
        }
    }

    fn compile_error(source: &str) -> EvalError {
        compile_error_with(&runtime(), source)
    }

    fn tokenize(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .expect("lexes")
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| !matches!(k, TokenKind::Eof))
            .collect()
    }

    fn int(v: &Value) -> i64 {
        v.as_int().unwrap_or_else(|| panic!("expected int, got {:?}", v))
    }

    thread_local! {
        static TICKS: Cell<usize> = const { Cell::new(0) };
    }

    fn tick(_: &mut ExecState) -> ExecResult<()> {
        TICKS.with(|t| t.set(t.get() + 1));
        Ok(())
    }

    /// `apply(f, x)` calls the script function `f` with `x` from native code.
    fn apply(state: &mut ExecState) -> ExecResult<()> {
        let f = state.argument(0)?;
        let x = state.argument(1)?;
        let actor = state.actor().ok_or(ExecError::InternalBufferOverrun)?;
        let Value::ScriptFunction(address) = f else {
            return Err(ExecError::UnexpectedDataType);
        };
        let value = state.exec(&actor, address, &[x])?;
        state.set_return(value)
    }

    // =========================================================================
    // LEXER
    // =========================================================================

    #[test]
    fn lexer_numbers_keep_literal_text() {
        assert_eq!(
            tokenize("12 1.5 0x1F 1_000"),
            vec![
                TokenKind::Number("12".into()),
                TokenKind::Number("1.5".into()),
                TokenKind::Number("31".into()),
                TokenKind::Number("1000".into()),
            ]
        );
    }

    #[test]
    fn lexer_type_keywords_and_operators() {
        assert_eq!(
            tokenize("x is int << as"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Is,
                TokenKind::Type(PublicType::Int),
                TokenKind::Shl,
                TokenKind::As,
            ]
        );
    }

    #[test]
    fn lexer_skips_comments() {
        let kinds = tokenize("a // line\n /* block\n comment */ b");
        assert_eq!(
            kinds,
            vec![TokenKind::Ident("a".into()), TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn lexer_string_escapes() {
        assert_eq!(
            tokenize(r#"'it\'s' "a\tb""#),
            vec![TokenKind::Str("it's".into()), TokenKind::Str("a\tb".into())]
        );
    }

    #[test]
    fn lexer_unterminated_string_is_lexer_error() {
        let err = Lexer::new("\"open").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexer);
    }

    // =========================================================================
    // PARSER
    // =========================================================================

    #[test]
    fn parser_rejects_nested_function_declarations() {
        let tokens = Lexer::new("function f() { function g() {} }")
            .tokenize()
            .expect("lexes");
        let err = Parser::new(tokens).parse().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parser);
    }

    #[test]
    fn parser_reports_missing_semicolon() {
        let tokens = Lexer::new("var a = 1").tokenize().expect("lexes");
        let err = Parser::new(tokens).parse().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parser);
        assert!(err.span.is_some());
    }

    // =========================================================================
    // COMPILER
    // =========================================================================

    #[test]
    fn constants_dedup_by_literal() {
        let rt = runtime();
        let build = crate::build("var x = 1 + 1 + 1;", &rt).expect("builds");
        let ones = build
            .globals
            .iter()
            .filter(|r| matches!(&r.value, RegisterValue::Number(n) if n == "1"))
            .count();
        assert_eq!(ones, 1);
    }

    #[test]
    fn init_globals_is_function_zero() {
        let rt = runtime();
        let build = crate::build("function f() {} var a = 1;", &rt).expect("builds");
        assert_eq!(build.functions[0].name, INIT_GLOBALS);
        assert_eq!(build.functions[1].name, "f");
        assert_eq!(build.function_lookup.get("f"), Some(&1));
    }

    #[test]
    fn every_function_ends_in_return() {
        let rt = runtime();
        let build = crate::build(
            "function f(x) { if (x) { return 1; } } function g() { while (1) { break; } }",
            &rt,
        )
        .expect("builds");
        for i in 0..build.functions.len() {
            let end = build
                .functions
                .get(i + 1)
                .map_or(build.instructions.len(), |next| next.start);
            assert_eq!(build.instructions[end - 1].op(), Some(Opcode::Return));
        }
    }

    #[test]
    fn call_args_follow_the_call() {
        let rt = runtime();
        let build = crate::build("function f(a, b) {} f(1, 2);", &rt).expect("builds");
        let ops: Vec<_> = build.instructions.iter().map(|i| i.op()).collect();
        let call = ops
            .iter()
            .position(|op| *op == Some(Opcode::ScriptFunction))
            .expect("call emitted");
        assert_eq!(ops[call + 1], Some(Opcode::FunctionArg));
        assert_eq!(ops[call + 2], Some(Opcode::FunctionArg));
        assert_eq!(build.instructions[call + 1].bx_unsigned(), 2);
    }

    #[test]
    fn const_reassignment_fails() {
        assert_eq!(
            compile_error("const c = 1; c = 2;"),
            EvalError::VariableAlreadyDefined
        );
        assert_eq!(compile_error("const c = 1; c++;"), EvalError::VariableAlreadyDefined);
        assert_eq!(compile_error("const c = 1; c += 1;"), EvalError::VariableAlreadyDefined);
        assert_eq!(
            compile_error("var c = 1; const c = 2;"),
            EvalError::VariableAlreadyDefined
        );
    }

    #[test]
    fn break_and_continue_outside_loops_fail() {
        assert_eq!(compile_error("break;"), EvalError::UnexpectedBreak);
        assert_eq!(compile_error("if (1) { break; }"), EvalError::UnexpectedBreak);
        assert_eq!(compile_error("continue;"), EvalError::UnexpectedContinue);
        assert_eq!(
            compile_error("switch (1) { case 1: continue; }"),
            EvalError::UnexpectedContinue
        );
    }

    #[test]
    fn undefined_callee_and_argument_fail() {
        assert_eq!(compile_error("nope();"), EvalError::FunctionNotDefined);
        assert_eq!(compile_error("print(missing);"), EvalError::VariableNotDefined);
        assert_eq!(compile_error("print(missing + 1);"), EvalError::VariableNotDefined);
        assert_eq!(compile_error("print([1, missing]);"), EvalError::VariableNotDefined);
        assert_eq!(compile_error("print(missing = 1);"), EvalError::VariableNotDefined);
    }

    #[test]
    fn compound_arguments_may_use_defined_names() {
        let (actor, _) = run(
            "function g(v) { return v * 2; }
             var y = 4;
             var r = g(y + 1);
             var s = g(g(y));",
        );
        assert_eq!(int(&global(&actor, "r")), 10);
        assert_eq!(int(&global(&actor, "s")), 16);
    }

    #[test]
    fn function_name_collisions_fail() {
        assert_eq!(
            compile_error("function print() {}"),
            EvalError::NativeFunctionAlreadyDefined
        );
        assert_eq!(
            compile_error("function f() {} function f() {}"),
            EvalError::ScriptFunctionAlreadyDefined
        );
    }

    #[test]
    fn locals_may_not_shadow_globals() {
        assert_eq!(
            compile_error("var g = 1; function f() { var g = 2; }"),
            EvalError::VariableAlreadyDefined
        );
        assert_eq!(
            compile_error("var g = 1; function f(g) {}"),
            EvalError::VariableAlreadyDefined
        );
        assert_eq!(
            compile_error("function f(a, a) {}"),
            EvalError::VariableAlreadyDefined
        );
    }

    #[test]
    fn functions_see_globals_first() {
        let (actor, _) = run("var total = 1; function bump() { total = total + 10; } bump(); bump();");
        assert_eq!(int(&global(&actor, "total")), 21);
    }

    #[test]
    fn compile_error_carries_span() {
        let rt = runtime();
        let err = crate::build("var a = 1;\nnope();", &rt).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Compiler);
        assert_eq!(err.span.map(|s| s.line), Some(2));
    }

    // =========================================================================
    // LINKER
    // =========================================================================

    #[test]
    fn link_rejects_script_function_named_like_native() {
        let build = crate::build("function f() {}", &Runtime::new()).expect("builds");
        let other = Runtime::new();
        other.link_native_function("f", tick).expect("registers");
        assert_eq!(
            Script::link(build, &other).unwrap_err(),
            LinkError::FunctionAlreadyDeclared("f".into())
        );
    }

    #[test]
    fn link_rejects_dangling_native_reference() {
        let rt = Runtime::new();
        rt.link_native_function("tick", tick).expect("registers");
        let build = crate::build("var t = tick;", &rt).expect("builds");
        assert_eq!(
            Script::link(build, &Runtime::new()).unwrap_err(),
            LinkError::FunctionNotDeclared("tick".into())
        );
    }

    #[test]
    fn link_rejects_oversized_integer() {
        let rt = runtime();
        let build = crate::build("var x = 99999999999999999999;", &rt).expect("builds");
        assert!(matches!(
            Script::link(build, &rt),
            Err(LinkError::UnexpectedValueType(_))
        ));
    }

    #[test]
    fn linked_strings_are_interned() {
        let (actor, _) = run("var a = \"a fairly long string\"; var b = \"short\";");
        let Value::Str(a) = global(&actor, "a") else {
            panic!("expected string");
        };
        let Value::Str(b) = global(&actor, "b") else {
            panic!("expected string");
        };
        assert!(!a.is_mini());
        assert!(b.is_mini());
    }

    // =========================================================================
    // SCENARIOS
    // =========================================================================

    #[test]
    fn scenario_script_function_call() {
        let (actor, mut state) =
            run("function add(x, y) { return x + y; } var r = add(2, 3);");
        assert_eq!(int(&global(&actor, "r")), 5);
        let value = state
            .exec_by_name(&actor, "add", &[Value::Int(2), Value::Int(3)])
            .expect("runs");
        assert_eq!(value, Value::Int(5));
    }

    #[test]
    fn scenario_while_loop() {
        let (actor, _) = run("var a = 0; while (a < 3) { a = a + 1; }");
        assert_eq!(int(&global(&actor, "a")), 3);
    }

    #[test]
    fn scenario_divide_by_zero_leaves_destination() {
        let (actor, _, result) = run_with(runtime(), ExecConfig::default(), "var r = 4; r /= 0;");
        assert_eq!(result, Err(ExecError::DivideByZero));
        assert_eq!(int(&global(&actor, "r")), 4);
    }

    #[test]
    fn scenario_index_out_of_bounds() {
        assert_eq!(
            exec_error("var arr = [1, 2, 3]; var x = arr[5];"),
            ExecError::IndexOutOfBounds
        );
    }

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    #[test]
    fn while_loop_runs_body_each_iteration() {
        let rt = Arc::new(Runtime::new());
        rt.link_native_function("tick", tick).expect("registers");
        TICKS.with(|t| t.set(0));
        let (_, _, result) = run_with(
            rt,
            ExecConfig::default(),
            "var a = 0; while (a < 5) { tick(); a++; }",
        );
        assert!(result.is_ok());
        assert_eq!(TICKS.with(|t| t.get()), 5);
    }

    #[test]
    fn break_inside_if_leaves_the_for() {
        let (actor, _) = run(
            "var hits = 0; var i = 0;
             for (i = 0; i < 10; i++) { if (i == 4) { break; } hits++; }
             var after = 1;",
        );
        assert_eq!(int(&global(&actor, "hits")), 4);
        assert_eq!(int(&global(&actor, "i")), 4);
        assert_eq!(int(&global(&actor, "after")), 1);
    }

    #[test]
    fn continue_runs_the_for_update() {
        let (actor, _) = run(
            "var sum = 0;
             for (var i = 0; i < 6; i++) { if (i == 2) { continue; } sum += i; }",
        );
        assert_eq!(int(&global(&actor, "sum")), 13);
    }

    #[test]
    fn do_while_runs_at_least_once() {
        let (actor, _) = run("var n = 10; do { n++; } while (n < 5);");
        assert_eq!(int(&global(&actor, "n")), 11);
    }

    #[test]
    fn if_else_chain_picks_one_branch() {
        let (actor, _) = run(
            "function grade(x) {
                 var g = 0;
                 if (x > 90) { g = 1; } else if (x > 50) { g = 2; } else { g = 3; }
                 return g;
             }
             var a = grade(95); var b = grade(60); var c = grade(10);",
        );
        assert_eq!(int(&global(&actor, "a")), 1);
        assert_eq!(int(&global(&actor, "b")), 2);
        assert_eq!(int(&global(&actor, "c")), 3);
    }

    #[test]
    fn switch_falls_through_until_break() {
        let source = |v: i64| {
            format!(
                "var r = 0;
                 switch ({}) {{
                     case 1: r = 10; break;
                     case 2: r = r + 1;
                     case 3: r = r + 100; break;
                     default: r = -1;
                 }}",
                v
            )
        };
        let (actor, _) = run(&source(1));
        assert_eq!(int(&global(&actor, "r")), 10);
        let (actor, _) = run(&source(2));
        assert_eq!(int(&global(&actor, "r")), 101);
        let (actor, _) = run(&source(3));
        assert_eq!(int(&global(&actor, "r")), 100);
        let (actor, _) = run(&source(9));
        assert_eq!(int(&global(&actor, "r")), -1);
    }

    #[test]
    fn switch_matches_strings() {
        let (actor, _) = run(
            "var r = 0; switch (\"b\") { case \"a\": r = 1; break; case \"b\": r = 2; break; }",
        );
        assert_eq!(int(&global(&actor, "r")), 2);
    }

    #[test]
    fn recursion() {
        let (actor, _) = run(
            "function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
             var r = fib(15);",
        );
        assert_eq!(int(&global(&actor, "r")), 610);
    }

    #[test]
    fn unbounded_recursion_is_register_overflow() {
        let config = ExecConfig {
            max_call_depth: 64,
            ..ExecConfig::default()
        };
        let (_, state, result) = run_with(
            runtime(),
            config,
            "function down(n) { return down(n + 1); } down(0);",
        );
        assert_eq!(result, Err(ExecError::RegisterOverflow));
        assert_eq!(state.call_depth(), 0);
        assert_eq!(state.used_locals(), 0);
    }

    // =========================================================================
    // ARITHMETIC & COMPARISON
    // =========================================================================

    #[test]
    fn int_float_promotion() {
        let (actor, _) = run("var a = 1 + 2.5; var b = 7 / 2; var c = 2 ** 10; var d = 9 - 10;");
        assert_eq!(global(&actor, "a"), Value::Float(3.5));
        assert_eq!(global(&actor, "b"), Value::Int(3));
        assert_eq!(global(&actor, "c"), Value::Int(1024));
        assert_eq!(global(&actor, "d"), Value::Int(-1));
    }

    #[test]
    fn division_by_float_zero() {
        assert_eq!(exec_error("var r = 1.0 / 0.0;"), ExecError::DivideByZero);
        assert_eq!(exec_error("var r = 1 / null;"), ExecError::DivideByZero);
    }

    #[test]
    fn division_by_negative_zero_is_allowed() {
        let (actor, _) = run("var z = -0.0; var r = 1.0 / z;");
        let Value::Float(r) = global(&actor, "r") else {
            panic!("expected float");
        };
        assert!(r.is_infinite() && r.is_sign_negative());
    }

    #[test]
    fn concatenation() {
        let (actor, _) = run("var s = \"ab\" + \"cd\"; var a = [1] + [2, 3]; var n = len(a);");
        assert_eq!(global(&actor, "s").as_str(), Some("abcd"));
        assert_eq!(int(&global(&actor, "n")), 3);
    }

    #[test]
    fn mismatched_operands_fail() {
        assert_eq!(exec_error("var x = 1 + \"a\";"), ExecError::UnexpectedDataType);
        assert_eq!(exec_error("var x = [1] < 2;"), ExecError::UnexpectedDataType);
    }

    #[test]
    fn comparisons_and_logic_yield_ints() {
        let (actor, _) = run(
            "var a = 1 < 2; var b = 2.5 >= 3; var c = 1 == 1.0; var d = !0; var e = 1 && 0; var f = null || \"x\";",
        );
        assert_eq!(global(&actor, "a"), Value::Int(1));
        assert_eq!(global(&actor, "b"), Value::Int(0));
        assert_eq!(global(&actor, "c"), Value::Int(0));
        assert_eq!(global(&actor, "d"), Value::Int(1));
        assert_eq!(global(&actor, "e"), Value::Int(0));
        assert_eq!(global(&actor, "f"), Value::Int(1));
    }

    #[test]
    fn increments_and_negation() {
        let (actor, _) = run("var i = 5; var old = i++; var new = ++i; var neg = -i;");
        assert_eq!(int(&global(&actor, "old")), 5);
        assert_eq!(int(&global(&actor, "new")), 7);
        assert_eq!(int(&global(&actor, "neg")), -7);
    }

    // =========================================================================
    // CONTAINERS
    // =========================================================================

    #[test]
    fn arrays_index_and_assign() {
        let (actor, _) = run("var a = [1, 2, 3]; a[1] = 20; a[2] += 5; var x = a[1] + a[2];");
        assert_eq!(int(&global(&actor, "x")), 28);
    }

    #[test]
    fn string_indexing_yields_characters() {
        let (actor, _) = run("var c = \"hello\"[1];");
        assert_eq!(global(&actor, "c").as_str(), Some("e"));
        assert_eq!(exec_error("var c = \"hi\"[2];"), ExecError::IndexOutOfBounds);
        assert_eq!(exec_error("var c = \"hi\"[\"0\"];"), ExecError::UnexpectedDataType);
    }

    #[test]
    fn array_index_must_be_int() {
        assert_eq!(exec_error("var a = [1]; var x = a[\"0\"];"), ExecError::UnexpectedDataType);
        assert_eq!(exec_error("var a = [1]; a[-1] = 2;"), ExecError::IndexOutOfBounds);
    }

    #[test]
    fn objects_members_and_shift() {
        let (actor, _) = run(
            "var o = {\"a\": 1, b: 2};
             o.c = 3;
             var sum = o.a + o[\"b\"] + o.c;
             var taken = o << \"a\";
             var gone = o.a;
             var missing = o << \"zzz\";
             var n = len(o);",
        );
        assert_eq!(int(&global(&actor, "sum")), 6);
        assert_eq!(int(&global(&actor, "taken")), 1);
        assert_eq!(global(&actor, "gone"), Value::Null);
        assert_eq!(global(&actor, "missing"), Value::Null);
        assert_eq!(int(&global(&actor, "n")), 2);
    }

    #[test]
    fn object_slots_are_reused() {
        let (actor, _) = run("var o = {a: 1, b: 2}; var x = o << \"a\"; o.c = 3;");
        let Value::Object(o) = global(&actor, "o") else {
            panic!("expected object");
        };
        assert_eq!(o.borrow().len(), 2);
        assert_eq!(o.borrow().capacity_used(), 2);
    }

    #[test]
    fn array_shift_zeroes_the_slot() {
        let (actor, _) = run("var a = [7, 8]; var x = a << 0; var y = a[0];");
        assert_eq!(int(&global(&actor, "x")), 7);
        assert_eq!(int(&global(&actor, "y")), 0);
    }

    #[test]
    fn object_keys_must_be_strings() {
        assert_eq!(exec_error("var o = {}; var x = o[1];"), ExecError::InvalidKey);
        assert_eq!(exec_error("var o = {}; o[1] = 2;"), ExecError::InvalidKey);
        assert_eq!(exec_error("var o = {}; var x = o << 1;"), ExecError::InvalidKey);
    }

    #[test]
    fn indexing_scalars_fails() {
        assert_eq!(exec_error("var n = 3; var x = n[0];"), ExecError::UnexpectedDataType);
        assert_eq!(exec_error("var n = 3; n[0] = 1;"), ExecError::UnexpectedDataType);
    }

    #[test]
    fn printing_cyclic_containers_terminates() {
        let (actor, _) = run("var a = [0]; var b = [a]; a[0] = b;");
        assert_eq!(global(&actor, "a").to_string(), "[[[...]]]");

        let (actor, _) = run("var o = {k: 0}; var p = {o: o}; o.k = p;");
        assert_eq!(global(&actor, "o").to_string(), "{\"k\": {\"o\": {...}}}");

        let (actor, _) = run("var a = [1, 2]; var pair = [a, a];");
        assert_eq!(global(&actor, "pair").to_string(), "[[1, 2], [1, 2]]");
    }

    // =========================================================================
    // TYPES
    // =========================================================================

    #[test]
    fn is_compares_types() {
        let (actor, _) = run(
            "var a = 5 is int; var b = \"x\" is int; var c = 3 is 4; var d = [] is array; var e = (int is type);",
        );
        for name in ["a", "c", "d", "e"] {
            assert_eq!(global(&actor, name), Value::Int(1), "{}", name);
        }
        assert_eq!(global(&actor, "b"), Value::Int(0));
    }

    #[test]
    fn as_conversions() {
        let (actor, _) = run(
            "var a = 3 as string; var b = \"42\" as int; var c = \"x\" as int;
             var d = 2.9 as int; var e = [1, \"b\", 2.5] as string; var f = \"ab\" as array;
             var g = int as string; var h = 1 as type;",
        );
        assert_eq!(global(&actor, "a").as_str(), Some("3"));
        assert_eq!(global(&actor, "b"), Value::Int(42));
        assert_eq!(global(&actor, "c"), Value::Int(0));
        assert_eq!(global(&actor, "d"), Value::Int(2));
        assert_eq!(global(&actor, "e").as_str(), Some("1b2.5"));
        assert_eq!(global(&actor, "g").as_str(), Some("int"));
        assert_eq!(global(&actor, "h"), Value::Type(PublicType::Int));
        let Value::Array(f) = global(&actor, "f") else {
            panic!("expected array");
        };
        assert_eq!(f.borrow().get(1).and_then(Value::as_str), Some("b"));
    }

    #[test]
    fn function_names_round_trip() {
        let (actor, _) = run(
            "function f() { return 9; }
             var name = f as string;
             var g = \"f\" as function;
             var r = g();
             var native = \"len\" as function;",
        );
        assert_eq!(global(&actor, "name").as_str(), Some("f"));
        assert_eq!(int(&global(&actor, "r")), 9);
        assert!(matches!(global(&actor, "native"), Value::NativeFunction(_)));
        assert_eq!(
            exec_error("var g = \"nothing\" as function;"),
            ExecError::ScriptFunctionNotFound
        );
    }

    /// Every source/destination pair either converts to the destination
    /// type or fails with `UnexpectedDataType`.
    #[test]
    fn as_is_total() {
        let sources = [
            "null", "1", "2.5", "\"f\"", "[1, 2]", "{k: 1}", "f", "len", "f as coroutine", "int",
        ];
        let targets = [
            ("int", PublicType::Int),
            ("float", PublicType::Float),
            ("string", PublicType::String),
            ("array", PublicType::Array),
            ("object", PublicType::Object),
            ("function", PublicType::Function),
            ("coroutine", PublicType::Coroutine),
            ("type", PublicType::Type),
        ];
        // Rows follow `sources`, columns follow `targets`.
        let supported = [
            [false, false, false, true, false, false, false, true],
            [true, true, true, true, false, false, false, true],
            [true, true, true, true, false, false, false, true],
            [true, true, true, true, false, true, false, true],
            [true, true, true, true, false, false, false, true],
            [true, true, false, true, false, false, false, true],
            [false, false, true, true, false, true, true, true],
            [false, false, true, true, false, true, false, true],
            [false, false, true, true, false, true, true, true],
            [false, false, true, true, false, false, false, true],
        ];

        for (i, source) in sources.iter().enumerate() {
            for (j, (keyword, ty)) in targets.iter().enumerate() {
                let program = format!(
                    "function f() {{ return 1; }} var s = {}; var r = s as {};",
                    source, keyword
                );
                let (actor, _, result) = run_with(runtime(), ExecConfig::default(), &program);
                match result {
                    Ok(_) => {
                        assert!(supported[i][j], "{} as {} converted", source, keyword);
                        assert_eq!(global(&actor, "r").public_type(), *ty, "{} as {}", source, keyword);
                    }
                    Err(e) => {
                        assert!(!supported[i][j], "{} as {} failed: {}", source, keyword, e);
                        assert_eq!(e, ExecError::UnexpectedDataType, "{} as {}", source, keyword);
                    }
                }
            }
        }

        let mut state = ExecState::new(runtime());
        for value in [Value::Null, Value::Int(1), Value::Type(PublicType::Null)] {
            assert_eq!(
                state.convert(value, PublicType::Null).unwrap_err(),
                ExecError::UnexpectedDataType
            );
        }
    }

    // =========================================================================
    // CALLS & COROUTINES
    // =========================================================================

    #[test]
    fn invoke_through_variables() {
        let (actor, _) = run(
            "function twice(x) { return x * 2; }
             var f = twice; var r = f(21);
             var p = print; var q = len; var n = q([1, 2]);",
        );
        assert_eq!(int(&global(&actor, "r")), 42);
        assert_eq!(int(&global(&actor, "n")), 2);
    }

    #[test]
    fn invoking_a_non_function_fails() {
        assert_eq!(exec_error("var x = 5; x();"), ExecError::UnexpectedDataType);
    }

    #[test]
    fn too_many_arguments_overflow() {
        assert_eq!(
            exec_error("function f(a) { return a; } f(1, 2, 3);"),
            ExecError::RegisterOverflow
        );
    }

    #[test]
    fn coroutine_resumes_after_each_return() {
        let (actor, _) = run(
            "function gen() { return 1; return 2; return 3; }
             var co = gen as coroutine;
             var a = co(); var b = co(); var c = co(); var d = co(); var e = co();",
        );
        assert_eq!(int(&global(&actor, "a")), 1);
        assert_eq!(int(&global(&actor, "b")), 2);
        assert_eq!(int(&global(&actor, "c")), 3);
        assert_eq!(global(&actor, "d"), Value::Null);
        assert_eq!(int(&global(&actor, "e")), 1);
    }

    #[test]
    fn started_coroutine_keeps_locals_and_ignores_arguments() {
        let (actor, _) = run(
            "function counter(step) { var acc = 0; while (1) { acc = acc + step; return acc; } }
             var co = counter as coroutine;
             var a = co(5); var b = co(100); var c = co(100);",
        );
        assert_eq!(int(&global(&actor, "a")), 5);
        assert_eq!(int(&global(&actor, "b")), 10);
        assert_eq!(int(&global(&actor, "c")), 15);

        let Value::Coroutine(co) = global(&actor, "co") else {
            panic!("expected coroutine");
        };
        assert!(co.borrow().is_started());
        assert_eq!(co.borrow().num_args(), 1);
    }

    #[test]
    fn coroutine_resets_after_error() {
        let rt = runtime();
        let script = crate::load(
            "var co = risky as coroutine;
             function risky(d) { return 1; return 1 / d; }
             function step(d) { return co(d); }",
            &rt,
        )
        .expect("loads");
        let actor = Actor::new(Arc::new(script));
        let mut state = ExecState::new(rt);
        state.exec(&actor, 0, &[]).expect("init");

        let step = |state: &mut ExecState, d: i64| state.exec_by_name(&actor, "step", &[Value::Int(d)]);
        assert_eq!(step(&mut state, 0), Ok(Value::Int(1)));
        // The resume keeps the first run's `d`.
        assert_eq!(step(&mut state, 5), Err(ExecError::DivideByZero));

        let Value::Coroutine(co) = global(&actor, "co") else {
            panic!("expected coroutine");
        };
        assert!(!co.borrow().is_started());
        assert_eq!(step(&mut state, 5), Ok(Value::Int(1)));
        assert_eq!(step(&mut state, 5), Ok(Value::Int(0)));
        assert_eq!(state.call_depth(), 0);
    }

    #[test]
    fn coroutine_cloned_by_as_starts_fresh() {
        let (actor, _) = run(
            "function gen() { return 1; return 2; }
             var co = gen as coroutine; var a = co();
             var copy = co as coroutine; var b = copy(); var c = co();",
        );
        assert_eq!(int(&global(&actor, "a")), 1);
        assert_eq!(int(&global(&actor, "b")), 1);
        assert_eq!(int(&global(&actor, "c")), 2);
    }

    #[test]
    fn natives_can_reenter_exec() {
        let rt = runtime();
        rt.link_native_function("apply", apply).expect("registers");
        let (actor, state, result) = run_with(
            rt,
            ExecConfig::default(),
            "function sq(x) { return x * x; } var r = apply(sq, 7);",
        );
        assert!(result.is_ok());
        assert_eq!(int(&global(&actor, "r")), 49);
        assert_eq!(state.call_depth(), 0);
    }

    #[test]
    fn frames_fall_back_to_heap_when_arena_is_full() {
        let config = ExecConfig {
            max_local_registers: 2,
            ..ExecConfig::default()
        };
        let (actor, state, result) = run_with(
            runtime(),
            config,
            "function f(a, b, c) { var d = a + b + c; return d; } var r = f(1, 2, 3);",
        );
        assert!(result.is_ok());
        assert_eq!(int(&global(&actor, "r")), 6);
        assert_eq!(state.used_locals(), 0);
    }

    #[test]
    fn failed_assertion() {
        assert_eq!(exec_error("assert(1 == 2);"), ExecError::FailedAssertion);
        run("assert(1, \"yes\", [0]);");
    }

    #[test]
    fn math_builtins() {
        let (actor, _) = run(
            "var a = abs(-3); var b = floor(2.7); var c = ceil(2.1); var d = sqrt(16);
             var e = min(3, 9); var f = max(2, 4.5); var g = max(2, 1.5);",
        );
        assert_eq!(global(&actor, "a"), Value::Int(3));
        assert_eq!(global(&actor, "b"), Value::Float(2.0));
        assert_eq!(global(&actor, "c"), Value::Float(3.0));
        assert_eq!(global(&actor, "d"), Value::Float(4.0));
        assert_eq!(global(&actor, "e"), Value::Int(3));
        assert_eq!(global(&actor, "f"), Value::Float(4.5));
        assert_eq!(global(&actor, "g"), Value::Float(2.0));
    }

    #[test]
    fn exec_errors_unknown_function() {
        let (actor, mut state) = run("var a = 1;");
        assert_eq!(
            state.exec(&actor, 99, &[]).unwrap_err(),
            ExecError::ScriptFunctionNotFound
        );
        assert_eq!(
            state.exec_by_name(&actor, "nope", &[]).unwrap_err(),
            ExecError::ScriptFunctionNotFound
        );
    }

    #[test]
    fn actors_have_independent_globals() {
        let rt = runtime();
        let script = Arc::new(crate::load("var n = 0; function inc() { n++; }", &rt).expect("loads"));
        let one = Actor::new(Arc::clone(&script));
        let two = Actor::new(script);
        let mut state = ExecState::new(rt);
        state.exec(&one, 0, &[]).expect("init");
        state.exec(&two, 0, &[]).expect("init");
        state.exec_by_name(&one, "inc", &[]).expect("inc");
        state.exec_by_name(&one, "inc", &[]).expect("inc");
        assert_eq!(global(&one, "n"), Value::Int(2));
        assert_eq!(global(&two, "n"), Value::Int(0));
    }

    // =========================================================================
    // REFCOUNTING
    // =========================================================================

    #[test]
    fn overwritten_containers_are_freed() {
        let (_, state) = run(
            "function f() { var a = [1, 2]; var o = {k: a}; a = null; o = null; return 0; }
             var r = f();",
        );
        assert_eq!(state.audit_heap().live(), 0);
    }

    #[test]
    fn temporaries_are_released_with_their_frame() {
        let (_, state) = run("function f() { var t = [1, 2, 3]; return len(t); } var n = f();");
        assert_eq!(state.audit_heap().live(), 0);
    }

    #[test]
    fn top_level_containers_stay_alive_in_globals() {
        let (actor, state) = run("var a = [1, 2];");
        assert_eq!(state.audit_heap().arrays, 1);
        let Value::Array(a) = global(&actor, "a") else {
            panic!("expected array");
        };
        // The global, the literal's temporary register and this handle.
        assert_eq!(a.ref_count(), 3);
    }

    #[test]
    fn cycles_are_reported_unreachable() {
        let (_, mut state) = run("function f() { var a = [0]; a[0] = a; } f();");
        let audit = state.audit_heap();
        assert_eq!(audit.arrays, 1);
        assert_eq!(audit.unreachable, 1);
        assert_eq!(state.collect_garbage(), 0);
    }

    #[test]
    fn short_lived_objects_do_not_pile_up_in_the_registry() {
        let (_, state) = run(
            "function f() { var i = 0; while (i < 20000) { var x = [1]; i = i + 1; } } f();",
        );
        assert_eq!(state.heap().live(), 0);
        assert!(state.heap().tracked() <= 128);
    }

    #[test]
    fn gc_object_cap_is_out_of_memory() {
        let config = ExecConfig {
            max_gc_objects: Some(2),
            ..ExecConfig::default()
        };
        let (_, _, result) = run_with(runtime(), config, "var a = [1]; var b = [2]; var c = [3];");
        assert_eq!(result, Err(ExecError::OutOfMemory));

        let config = ExecConfig {
            max_gc_objects: Some(2),
            ..ExecConfig::default()
        };
        let (_, _, result) = run_with(
            runtime(),
            config,
            "var i = 0; while (i < 10) { var a = [i]; i++; }",
        );
        assert!(result.is_ok());
    }
}
