use super::*;

fn parse(source: &str) -> Module {
    parse_module(source).unwrap_or_else(|e| panic!("parse failed: {}", e))
}

fn first_expr(source: &str) -> Expr {
    match parse(source).body.into_iter().next().map(|s| s.kind) {
        Some(StmtKind::Expr(expr)) => expr,
        other => panic!("expected expression statement, got {:?}", other),
    }
}

#[test]
fn test_empty_and_comment_only_sources() {
    assert!(parse("").body.is_empty());
    assert!(parse("# just a comment\n\n").body.is_empty());
}

#[test]
fn test_imports() {
    let module = parse("import math, collections.abc as cabc\nfrom . import sibling\nfrom os.path import (join, split,)\n");
    assert_eq!(module.body.len(), 3);

    match &module.body[0].kind {
        StmtKind::Import(names) => {
            assert_eq!(names[0].name, "math");
            assert_eq!(names[1].name, "collections.abc");
            assert_eq!(names[1].asname.as_deref(), Some("cabc"));
        }
        other => panic!("unexpected {:?}", other),
    }
    match &module.body[1].kind {
        StmtKind::ImportFrom { module, level, .. } => {
            assert_eq!(*level, 1);
            assert!(module.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    match &module.body[2].kind {
        StmtKind::ImportFrom { module, names, .. } => {
            assert_eq!(module.as_deref(), Some("os.path"));
            assert_eq!(names.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_function_and_class_definitions() {
    let source = r#"
@decorator
def compute(a, b: int = 2, *args, key=None, **kwargs) -> float:
    """Docstring."""
    return a * b

class Strategy(Base, metaclass=Meta):
    def run(self):
        pass
"#;
    let module = parse(source);
    assert_eq!(module.body.len(), 2);

    match &module.body[0].kind {
        StmtKind::FunctionDef {
            name,
            params,
            decorators,
            returns,
            ..
        } => {
            assert_eq!(name, "compute");
            assert_eq!(decorators.len(), 1);
            assert!(returns.is_some());
            let kinds: Vec<ParamKind> = params.iter().map(|p| p.kind).collect();
            assert_eq!(
                kinds,
                vec![
                    ParamKind::Positional,
                    ParamKind::Positional,
                    ParamKind::VarArgs,
                    ParamKind::KeywordOnly,
                    ParamKind::VarKeywords,
                ]
            );
        }
        other => panic!("unexpected {:?}", other),
    }
    match &module.body[1].kind {
        StmtKind::ClassDef {
            name,
            bases,
            keywords,
            body,
            ..
        } => {
            assert_eq!(name, "Strategy");
            assert_eq!(bases.len(), 1);
            assert_eq!(keywords[0].arg.as_deref(), Some("metaclass"));
            assert_eq!(body.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_control_flow() {
    let source = r#"
for i, (a, b) in enumerate(pairs):
    if a > b:
        continue
    elif a == b:
        break
    else:
        total += a
else:
    done = True

while x < 10:
    x += 1

try:
    risky()
except (ValueError, KeyError) as err:
    handle(err)
except:
    pass
finally:
    cleanup()

with open_a() as a, open_b() as b:
    pass
"#;
    let module = parse(source);
    assert_eq!(module.body.len(), 4);
    assert!(matches!(module.body[0].kind, StmtKind::For { .. }));
    assert!(matches!(module.body[1].kind, StmtKind::While { .. }));
    match &module.body[2].kind {
        StmtKind::Try {
            handlers,
            finalbody,
            ..
        } => {
            assert_eq!(handlers.len(), 2);
            assert!(handlers[1].type_.is_none());
            assert_eq!(finalbody.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    match &module.body[3].kind {
        StmtKind::With { items, .. } => assert_eq!(items.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_elif_chain_nests_in_orelse() {
    let module = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelif c:\n    x = 3\n");
    let StmtKind::If { orelse, .. } = &module.body[0].kind else {
        panic!("expected if");
    };
    let StmtKind::If { orelse: inner, .. } = &orelse[0].kind else {
        panic!("expected elif");
    };
    assert_eq!(orelse[0].line, 3);
    assert!(matches!(inner[0].kind, StmtKind::If { .. }));
}

#[test]
fn test_call_with_dotted_callee() {
    let expr = first_expr("os.path.join('a', b, *rest, sep='/', **extra)\n");
    let ExprKind::Call {
        func,
        args,
        keywords,
    } = expr.kind
    else {
        panic!("expected call");
    };
    assert_eq!(func.dotted_name().as_deref(), Some("os.path.join"));
    assert_eq!(args.len(), 3);
    assert_eq!(keywords.len(), 2);
    assert!(keywords[1].arg.is_none());
}

#[test]
fn test_operator_precedence() {
    let expr = first_expr("1 + 2 * 3 ** -4\n");
    let ExprKind::BinOp { op, right, .. } = expr.kind else {
        panic!("expected binop");
    };
    assert_eq!(op, BinOp::Add);
    let ExprKind::BinOp { op, right, .. } = right.kind else {
        panic!("expected binop");
    };
    assert_eq!(op, BinOp::Mult);
    assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
}

#[test]
fn test_comparisons_and_boolean_operators() {
    let expr = first_expr("a < b <= c and x is not None or y not in z\n");
    let ExprKind::BoolOp { op, values } = expr.kind else {
        panic!("expected boolop");
    };
    assert_eq!(op, BoolOp::Or);
    assert_eq!(values.len(), 2);
    let ExprKind::Compare { ops, .. } = &values[1].kind else {
        panic!("expected compare");
    };
    assert_eq!(ops, &vec![CmpOp::NotIn]);
}

#[test]
fn test_comprehensions_and_lambda() {
    let module = parse(
        "squares = [x * x for x in data if x > 0]\nlookup = {k: v for k, v in items}\nuniq = {x for x in data}\ntotal = sum(x for x in data)\nkey = lambda item, *, reverse=False: item[1]\n",
    );
    let values: Vec<&ExprKind> = module
        .body
        .iter()
        .map(|s| match &s.kind {
            StmtKind::Assign { value, .. } => &value.kind,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert!(matches!(values[0], ExprKind::ListComp { .. }));
    assert!(matches!(values[1], ExprKind::DictComp { .. }));
    assert!(matches!(values[2], ExprKind::SetComp { .. }));
    let ExprKind::Call { args, .. } = values[3] else {
        panic!("expected call");
    };
    assert!(matches!(args[0].kind, ExprKind::GeneratorExp { .. }));
    assert!(matches!(values[4], ExprKind::Lambda { .. }));
}

#[test]
fn test_subscripts_and_slices() {
    let expr = first_expr("frame[1:, ::2]\n");
    let ExprKind::Subscript { slice, .. } = expr.kind else {
        panic!("expected subscript");
    };
    let ExprKind::Tuple { elts, .. } = slice.kind else {
        panic!("expected tuple of slices");
    };
    assert_eq!(elts.len(), 2);
    assert!(elts.iter().all(|e| matches!(e.kind, ExprKind::Slice { .. })));
}

#[test]
fn test_assignment_targets_get_store_context() {
    let module = parse("a, *b = c = values\nobj.attr[0] = 1\n");
    let StmtKind::Assign { targets, .. } = &module.body[0].kind else {
        panic!("expected assign");
    };
    assert_eq!(targets.len(), 2);
    let ExprKind::Tuple { elts, ctx } = &targets[0].kind else {
        panic!("expected tuple target");
    };
    assert_eq!(*ctx, ExprContext::Store);
    assert!(matches!(
        elts[1].kind,
        ExprKind::Starred {
            ctx: ExprContext::Store,
            ..
        }
    ));
}

#[test]
fn test_invalid_assignment_targets() {
    assert!(parse_module("f() = 1\n").unwrap_err().message.contains("function call"));
    assert!(parse_module("1 = x\n").unwrap_err().message.contains("literal"));
    assert!(parse_module("a + b += 1\n").is_err());
    assert!(parse_module("del f()\n").unwrap_err().message.contains("delete"));
}

#[test]
fn test_walrus_and_conditional_expression() {
    let module = parse("if (n := len(data)) > 10:\n    label = 'big' if n > 100 else 'small'\n");
    let StmtKind::If { test, body, .. } = &module.body[0].kind else {
        panic!("expected if");
    };
    let ExprKind::Compare { left, .. } = &test.kind else {
        panic!("expected compare");
    };
    assert!(matches!(left.kind, ExprKind::NamedExpr { .. }));
    let StmtKind::Assign { value, .. } = &body[0].kind else {
        panic!("expected assign");
    };
    assert!(matches!(value.kind, ExprKind::IfExp { .. }));
}

#[test]
fn test_fstring_expressions_are_parsed() {
    let expr = first_expr("f\"{name!r:>{width}} = {obj.__class__} {{literal}}\"\n");
    let ExprKind::FormattedString(parts) = expr.kind else {
        panic!("expected f-string");
    };
    assert_eq!(parts.len(), 3);
    assert!(matches!(parts[0].kind, ExprKind::Name { .. }));
    assert!(matches!(parts[1].kind, ExprKind::Name { .. }));
    assert!(matches!(
        &parts[2].kind,
        ExprKind::Attribute { attr, .. } if attr == "__class__"
    ));
}

#[test]
fn test_fstring_debug_specifier() {
    let expr = first_expr("f'{value=}'\n");
    let ExprKind::FormattedString(parts) = expr.kind else {
        panic!("expected f-string");
    };
    assert_eq!(parts.len(), 1);
}

#[test]
fn test_fstring_errors() {
    assert!(parse_module("f'{}'\n").is_err());
    assert!(parse_module("f'{x'\n").is_err());
    assert!(parse_module("f'x}'\n").is_err());
}

#[test]
fn test_string_concatenation() {
    let expr = first_expr("'abc' 'def'\n");
    assert_eq!(expr.as_str_constant(), Some("abcdef"));
}

#[test]
fn test_async_constructs() {
    let source = "async def fetch():\n    async with lock:\n        async for item in stream:\n            await handle(item)\n";
    let module = parse(source);
    let StmtKind::FunctionDef { is_async, body, .. } = &module.body[0].kind else {
        panic!("expected function");
    };
    assert!(*is_async);
    assert!(matches!(body[0].kind, StmtKind::With { is_async: true, .. }));
}

#[test]
fn test_syntax_errors_report_line() {
    let err = parse_module("x = 1\ndef broken(:\n    pass\n").unwrap_err();
    assert_eq!(err.line, 2);

    let err = parse_module("if x\n    y = 1\n").unwrap_err();
    assert_eq!(err.line, 1);
    assert!(err.message.contains("expected ':'"));
}

#[test]
fn test_structural_errors() {
    assert!(parse_module("  x = 1\n").unwrap_err().message.contains("unexpected indent"));
    assert!(
        parse_module("def f():\nreturn 1\n")
            .unwrap_err()
            .message
            .contains("expected an indented block")
    );
    assert!(parse_module("try:\n    pass\nx = 1\n").is_err());
    assert!(parse_module("print 'hello'\n").is_err());
    assert!(parse_module("return\n").is_ok());
}

#[test]
fn test_deep_nesting_is_rejected_without_overflow() {
    let depth = MAX_NESTING_DEPTH * 50;
    let source = format!("x = {}1{}\n", "(".repeat(depth), ")".repeat(depth));
    let err = parse_module(&source).unwrap_err();
    assert!(err.message.contains("nested"));

    let source = format!("x = {}1\n", "-".repeat(depth));
    assert!(parse_module(&source).is_err());

    let source = format!("x = {}\n", vec!["a"; MAX_CHAIN_LENGTH + 1].join(" + "));
    let err = parse_module(&source).unwrap_err();
    assert!(err.message.contains("chain"));

    let source = format!("x = a{}\n", ".b".repeat(depth));
    assert!(parse_module(&source).is_err());
}

#[test]
fn test_flat_chains_do_not_count_as_nesting() {
    let terms = MAX_NESTING_DEPTH * 3;

    let source = format!("x = {}\n", vec!["a"; terms].join(" + "));
    assert!(parse_module(&source).is_ok());

    let source = format!("x = {}\n", vec!["a"; terms].join(" * b - "));
    assert!(parse_module(&source).is_ok());

    let mut source = String::from("if x == 0:\n    y = 0\n");
    for i in 1..terms {
        source.push_str(&format!("elif x == {}:\n    y = {}\n", i, i));
    }
    source.push_str("else:\n    y = -1\n");
    let module = parse(&source);
    assert_eq!(module.body.len(), 1);

    // Chains still nest inside the ordinary bound
    let source = format!("x = ({})\n", vec!["a"; terms].join(" | "));
    assert!(parse_module(&source).is_ok());
}

#[test]
fn test_elif_chain_limit() {
    let mut source = String::from("if x == 0:\n    pass\n");
    for i in 0..=MAX_CHAIN_LENGTH {
        source.push_str(&format!("elif x == {}:\n    pass\n", i));
    }
    let err = parse_module(&source).unwrap_err();
    assert!(err.message.contains("chain"));
}

#[test]
fn test_binary_operators_keep_their_kind() {
    let cases = [
        ("a | b", BinOp::BitOr),
        ("a ^ b", BinOp::BitXor),
        ("a & b", BinOp::BitAnd),
        ("a << b", BinOp::LShift),
        ("a >> b", BinOp::RShift),
        ("a + b", BinOp::Add),
        ("a - b", BinOp::Sub),
        ("a * b", BinOp::Mult),
        ("a / b", BinOp::Div),
        ("a // b", BinOp::FloorDiv),
        ("a % b", BinOp::Mod),
        ("a @ b", BinOp::MatMult),
        ("a ** b", BinOp::Pow),
    ];
    for (source, expected) in cases {
        match first_expr(&format!("{}\n", source)).kind {
            ExprKind::BinOp { op, .. } => assert_eq!(op, expected, "{}", source),
            other => panic!("{}: unexpected {:?}", source, other),
        }
    }
    assert_eq!(BinOp::from_op("and"), None);
}

#[test]
fn test_moderate_nesting_is_accepted() {
    let source = format!("x = {}1{}\n", "[".repeat(20), "]".repeat(20));
    assert!(parse_module(&source).is_ok());

    let source = format!("x = {}\n", vec!["a"; 50].join(" + "));
    assert!(parse_module(&source).is_ok());
}
