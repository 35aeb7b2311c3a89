//! Tree traversal.
//!
//! Implementors override the `visit_*` hooks they care about and call the
//! matching `walk_*` function to continue into children.

use super::ast::*;

pub trait Visitor {
    fn visit_module(&mut self, module: &Module) {
        walk_module(self, module);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_except_handler(&mut self, handler: &ExceptHandler) {
        walk_except_handler(self, handler);
    }

    fn visit_param(&mut self, param: &Param) {
        walk_param(self, param);
    }

    fn visit_comprehension(&mut self, comprehension: &Comprehension) {
        walk_comprehension(self, comprehension);
    }
}

pub fn walk_module<V: Visitor + ?Sized>(visitor: &mut V, module: &Module) {
    walk_body(visitor, &module.body);
}

fn walk_body<V: Visitor + ?Sized>(visitor: &mut V, body: &[Stmt]) {
    for stmt in body {
        visitor.visit_stmt(stmt);
    }
}

fn walk_exprs<V: Visitor + ?Sized>(visitor: &mut V, exprs: &[Expr]) {
    for expr in exprs {
        visitor.visit_expr(expr);
    }
}

fn walk_opt<V: Visitor + ?Sized>(visitor: &mut V, expr: Option<&Expr>) {
    if let Some(expr) = expr {
        visitor.visit_expr(expr);
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(visitor: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_)
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue => {}
        StmtKind::FunctionDef {
            params,
            returns,
            body,
            decorators,
            ..
        } => {
            walk_exprs(visitor, decorators);
            for param in params {
                visitor.visit_param(param);
            }
            walk_opt(visitor, returns.as_ref());
            walk_body(visitor, body);
        }
        StmtKind::ClassDef {
            bases,
            keywords,
            body,
            decorators,
            ..
        } => {
            walk_exprs(visitor, decorators);
            walk_exprs(visitor, bases);
            for keyword in keywords {
                visitor.visit_expr(&keyword.value);
            }
            walk_body(visitor, body);
        }
        StmtKind::Return(value) => walk_opt(visitor, value.as_ref()),
        StmtKind::Delete(targets) => walk_exprs(visitor, targets),
        StmtKind::Assign { targets, value } => {
            walk_exprs(visitor, targets);
            visitor.visit_expr(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
        StmtKind::AnnAssign {
            target,
            annotation,
            value,
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(annotation);
            walk_opt(visitor, value.as_ref());
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            visitor.visit_expr(target);
            visitor.visit_expr(iter);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
            visitor.visit_expr(test);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        StmtKind::With { items, body, .. } => {
            for item in items {
                visitor.visit_expr(&item.context);
                walk_opt(visitor, item.target.as_ref());
            }
            walk_body(visitor, body);
        }
        StmtKind::Raise { exc, cause } => {
            walk_opt(visitor, exc.as_ref());
            walk_opt(visitor, cause.as_ref());
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            walk_body(visitor, body);
            for handler in handlers {
                visitor.visit_except_handler(handler);
            }
            walk_body(visitor, orelse);
            walk_body(visitor, finalbody);
        }
        StmtKind::Assert { test, msg } => {
            visitor.visit_expr(test);
            walk_opt(visitor, msg.as_ref());
        }
        StmtKind::Expr(expr) => visitor.visit_expr(expr),
    }
}

pub fn walk_except_handler<V: Visitor + ?Sized>(visitor: &mut V, handler: &ExceptHandler) {
    walk_opt(visitor, handler.type_.as_ref());
    walk_body(visitor, &handler.body);
}

pub fn walk_param<V: Visitor + ?Sized>(visitor: &mut V, param: &Param) {
    walk_opt(visitor, param.annotation.as_ref());
    walk_opt(visitor, param.default.as_ref());
}

pub fn walk_comprehension<V: Visitor + ?Sized>(visitor: &mut V, comprehension: &Comprehension) {
    visitor.visit_expr(&comprehension.target);
    visitor.visit_expr(&comprehension.iter);
    walk_exprs(visitor, &comprehension.ifs);
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Constant(_) | ExprKind::Name { .. } => {}
        ExprKind::BoolOp { values, .. } => walk_exprs(visitor, values),
        ExprKind::NamedExpr { target, value } => {
            visitor.visit_expr(target);
            visitor.visit_expr(value);
        }
        ExprKind::BinOp { left, right, .. } => {
            visitor.visit_expr(left);
            visitor.visit_expr(right);
        }
        ExprKind::UnaryOp { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Lambda { params, body } => {
            for param in params {
                visitor.visit_param(param);
            }
            visitor.visit_expr(body);
        }
        ExprKind::IfExp { test, body, orelse } => {
            visitor.visit_expr(test);
            visitor.visit_expr(body);
            visitor.visit_expr(orelse);
        }
        ExprKind::Dict { keys, values } => {
            for key in keys.iter().flatten() {
                visitor.visit_expr(key);
            }
            walk_exprs(visitor, values);
        }
        ExprKind::Set(elts) | ExprKind::FormattedString(elts) => walk_exprs(visitor, elts),
        ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => walk_exprs(visitor, elts),
        ExprKind::ListComp { elt, generators }
        | ExprKind::SetComp { elt, generators }
        | ExprKind::GeneratorExp { elt, generators } => {
            for comprehension in generators {
                visitor.visit_comprehension(comprehension);
            }
            visitor.visit_expr(elt);
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            for comprehension in generators {
                visitor.visit_comprehension(comprehension);
            }
            visitor.visit_expr(key);
            visitor.visit_expr(value);
        }
        ExprKind::Await(value) | ExprKind::YieldFrom(value) => visitor.visit_expr(value),
        ExprKind::Yield(value) => walk_opt(visitor, value.as_deref()),
        ExprKind::Compare {
            left, comparators, ..
        } => {
            visitor.visit_expr(left);
            walk_exprs(visitor, comparators);
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            visitor.visit_expr(func);
            walk_exprs(visitor, args);
            for keyword in keywords {
                visitor.visit_expr(&keyword.value);
            }
        }
        ExprKind::Attribute { value, .. } | ExprKind::Starred { value, .. } => {
            visitor.visit_expr(value)
        }
        ExprKind::Subscript { value, slice, .. } => {
            visitor.visit_expr(value);
            visitor.visit_expr(slice);
        }
        ExprKind::Slice { lower, upper, step } => {
            walk_opt(visitor, lower.as_deref());
            walk_opt(visitor, upper.as_deref());
            walk_opt(visitor, step.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::parser::parse_module;

    #[derive(Default)]
    struct NameCollector {
        names: Vec<String>,
        handlers: usize,
    }

    impl Visitor for NameCollector {
        fn visit_expr(&mut self, expr: &Expr) {
            if let ExprKind::Name { id, .. } = &expr.kind {
                self.names.push(id.clone());
            }
            walk_expr(self, expr);
        }

        fn visit_except_handler(&mut self, handler: &ExceptHandler) {
            self.handlers += 1;
            walk_except_handler(self, handler);
        }
    }

    #[test]
    fn test_walks_nested_scopes() {
        let module = parse_module(
            "def f(a=default):\n    try:\n        return [g(x) for x in xs]\n    except Err:\n        pass\n",
        )
        .unwrap();
        let mut collector = NameCollector::default();
        collector.visit_module(&module);

        for expected in ["default", "g", "x", "xs", "Err"] {
            assert!(
                collector.names.iter().any(|n| n == expected),
                "missing {}",
                expected
            );
        }
        assert_eq!(collector.handlers, 1);
    }

    #[test]
    fn test_walks_fstring_and_lambda_bodies() {
        let module = parse_module("h = lambda: f'{secret}'\n").unwrap();
        let mut collector = NameCollector::default();
        collector.visit_module(&module);
        assert!(collector.names.contains(&"secret".to_string()));
        assert!(collector.names.contains(&"h".to_string()));
    }
}
