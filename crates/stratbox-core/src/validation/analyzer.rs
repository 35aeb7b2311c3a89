//! Policy checks over a parsed module.

use super::ast::*;
use super::policy::ValidationPolicy;
use super::types::{Inventory, Issue, RuleId, Severity};
use super::visitor::{Visitor, walk_except_handler, walk_expr, walk_stmt};
use std::collections::HashSet;

/// Builtins that are dangerous as first-class values, not just when called
const REFLECTIVE_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "input",
    "open",
    "help",
    "exit",
    "quit",
];

/// Functions whose string arguments name attributes, possibly dotted
const ATTRIBUTE_BY_NAME: &[&str] = &[
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "attrgetter",
    "methodcaller",
];

/// Functions whose first argument names a module
const IMPORT_BY_NAME: &[&str] = &["__import__", "import_module"];

/// Walks a module once, recording the inventory and every policy issue
pub(crate) struct Analyzer<'p> {
    policy: &'p ValidationPolicy,
    bound_names: HashSet<String>,
    issues: Vec<Issue>,
    inventory: Inventory,
}

impl<'p> Analyzer<'p> {
    pub fn new(policy: &'p ValidationPolicy) -> Self {
        Self {
            policy,
            bound_names: HashSet::new(),
            issues: Vec::new(),
            inventory: Inventory::default(),
        }
    }

    /// Analyze a module, returning issues in discovery order and the inventory
    ///
    /// A reflective builtin only stops being one once a top-level statement
    /// has unconditionally rebound it, and only for loads that come after
    /// that statement. Names the guest ever deletes or declares `global` or
    /// `nonlocal` never count as rebound.
    pub fn analyze(mut self, module: &Module) -> (Vec<Issue>, Inventory) {
        let mut unstable = UnstableNames::default();
        unstable.visit_module(module);

        for stmt in &module.body {
            self.visit_stmt(stmt);
            for name in module_level_bindings(stmt) {
                if !unstable.names.contains(name) {
                    self.bound_names.insert(name.to_string());
                }
            }
        }
        (self.issues, self.inventory)
    }

    fn report(&mut self, severity: Severity, rule: RuleId, line: usize, message: String) {
        self.issues.push(Issue::new(severity, rule, Some(line), message));
    }

    /// Severity of constructs that only block in strict mode
    fn escalated(&self) -> Severity {
        if self.policy.strict_mode {
            Severity::Blocking
        } else {
            Severity::Warning
        }
    }

    fn record_import(&mut self, module: &str, line: usize) {
        self.inventory.imports.insert(module.to_string());
        if !self.policy.is_import_allowed(module) {
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenImport,
                line,
                format!("import of '{}' is not allowed", module),
            );
        }
    }

    fn record_attribute(&mut self, attr: &str, line: usize) {
        self.inventory.attributes.insert(attr.to_string());
        if self.policy.is_attribute_forbidden(attr) {
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenAttribute,
                line,
                format!("access to forbidden attribute '{}'", attr),
            );
        }
    }

    fn check_call(&mut self, func: &Expr, args: &[Expr], line: usize) {
        let Some(name) = callee_name(func) else {
            return;
        };
        self.inventory.functions.insert(name.clone());
        if self.policy.is_function_forbidden(&name) {
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenCall,
                line,
                format!("call to forbidden function '{}'", name),
            );
        }

        let last = name.rsplit('.').next().unwrap_or(&name);
        if ATTRIBUTE_BY_NAME.contains(&last) {
            for path in args.iter().filter_map(Expr::as_str_constant) {
                for attr in path.split('.') {
                    self.record_attribute(attr, line);
                }
            }
        } else if IMPORT_BY_NAME.contains(&last) {
            if let Some(module) = args.first().and_then(Expr::as_str_constant) {
                self.record_import(module, line);
            }
        }
    }

    fn check_name_load(&mut self, id: &str, line: usize) {
        if REFLECTIVE_BUILTINS.contains(&id)
            && !self.bound_names.contains(id)
            && self.policy.is_function_forbidden(id)
        {
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenCall,
                line,
                format!("reference to forbidden function '{}'", id),
            );
        }
        if id.starts_with("__") && self.policy.is_attribute_forbidden(id) {
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenAttribute,
                line,
                format!("reference to forbidden name '{}'", id),
            );
        }
    }

    /// Visit the callee of a call without treating a plain name as a bare load
    fn visit_callee(&mut self, func: &Expr) {
        match &func.kind {
            ExprKind::Name { .. } => {}
            ExprKind::Attribute { value, attr, .. } => {
                self.record_attribute(attr, func.line);
                self.visit_expr(value);
            }
            _ => self.visit_expr(func),
        }
    }

    fn check_import_from(&mut self, module: Option<&str>, names: &[Alias], level: usize, line: usize) {
        if level > 0 {
            let target = format!("{}{}", ".".repeat(level), module.unwrap_or(""));
            self.inventory.imports.insert(target.clone());
            self.report(
                Severity::Blocking,
                RuleId::ForbiddenImport,
                line,
                format!("relative import '{}' is not allowed", target),
            );
        } else if let Some(module) = module {
            self.record_import(module, line);
        }

        let origin = module.unwrap_or("");
        for alias in names {
            if alias.name == "*" {
                let severity = self.escalated();
                self.report(
                    severity,
                    RuleId::StarImport,
                    line,
                    format!("star import from '{}'", origin),
                );
            } else if self.policy.is_function_forbidden(&alias.name) {
                self.report(
                    Severity::Blocking,
                    RuleId::ForbiddenCall,
                    line,
                    format!("import of forbidden function '{}.{}'", origin, alias.name),
                );
            }
        }
    }
}

impl Visitor for Analyzer<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for alias in names {
                    self.record_import(&alias.name, stmt.line);
                }
            }
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.check_import_from(module.as_deref(), names, *level, stmt.line),
            StmtKind::Global(names) | StmtKind::Nonlocal(names) => {
                let keyword = if matches!(stmt.kind, StmtKind::Global(_)) {
                    "global"
                } else {
                    "nonlocal"
                };
                let severity = self.escalated();
                self.report(
                    severity,
                    RuleId::ScopeRebinding,
                    stmt.line,
                    format!("'{}' rebinds outer-scope name(s): {}", keyword, names.join(", ")),
                );
            }
            _ => walk_stmt(self, stmt),
        }
    }

    fn visit_except_handler(&mut self, handler: &ExceptHandler) {
        if handler.type_.is_none() {
            self.report(
                Severity::Warning,
                RuleId::BareExcept,
                handler.line,
                "bare 'except:' without an exception type".to_string(),
            );
        }
        walk_except_handler(self, handler);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.check_call(func, args, expr.line);
                self.visit_callee(func);
                for arg in args {
                    self.visit_expr(arg);
                }
                for keyword in keywords {
                    self.visit_expr(&keyword.value);
                }
            }
            ExprKind::Attribute { attr, ctx, .. } => {
                self.record_attribute(attr, expr.line);
                let policy = self.policy;
                if let Some(name) = expr
                    .dotted_name()
                    .filter(|_| *ctx == ExprContext::Load)
                    .filter(|name| policy.is_function_forbidden(name))
                {
                    self.report(
                        Severity::Blocking,
                        RuleId::ForbiddenCall,
                        expr.line,
                        format!("reference to forbidden function '{}'", name),
                    );
                }
                walk_expr(self, expr);
            }
            ExprKind::Name {
                id,
                ctx: ExprContext::Load,
            } => self.check_name_load(id, expr.line),
            _ => walk_expr(self, expr),
        }
    }
}

/// Dotted callee name, or the trailing attribute of an unresolvable chain
fn callee_name(func: &Expr) -> Option<String> {
    func.dotted_name().or_else(|| match &func.kind {
        ExprKind::Attribute { attr, .. } => Some(attr.clone()),
        _ => None,
    })
}

/// Names a top-level statement binds on every path through it
fn module_level_bindings(stmt: &Stmt) -> Vec<&str> {
    let mut names = Vec::new();
    match &stmt.kind {
        StmtKind::FunctionDef { name, .. } | StmtKind::ClassDef { name, .. } => {
            names.push(name.as_str());
        }
        StmtKind::Import(aliases) | StmtKind::ImportFrom { names: aliases, .. } => {
            for alias in aliases {
                let bound = alias
                    .asname
                    .as_deref()
                    .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name));
                if bound != "*" {
                    names.push(bound);
                }
            }
        }
        StmtKind::Assign { targets, .. } => {
            for target in targets {
                collect_target_names(target, &mut names);
            }
        }
        StmtKind::AnnAssign {
            target,
            value: Some(_),
            ..
        } => collect_target_names(target, &mut names),
        _ => {}
    }
    names
}

fn collect_target_names<'a>(target: &'a Expr, names: &mut Vec<&'a str>) {
    match &target.kind {
        ExprKind::Name { id, .. } => names.push(id),
        ExprKind::Tuple { elts, .. } | ExprKind::List { elts, .. } => {
            for elt in elts {
                collect_target_names(elt, names);
            }
        }
        _ => {}
    }
}

/// Names deleted anywhere or declared `global`/`nonlocal` anywhere
#[derive(Default)]
struct UnstableNames {
    names: HashSet<String>,
}

impl Visitor for UnstableNames {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let StmtKind::Global(names) | StmtKind::Nonlocal(names) = &stmt.kind {
            self.names.extend(names.iter().cloned());
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        if let ExprKind::Name {
            id,
            ctx: ExprContext::Del,
        } = &expr.kind
        {
            self.names.insert(id.clone());
        }
        walk_expr(self, expr);
    }
}
