//! Recursive-descent parser producing the [`ast`](super::ast) tree.
//!
//! Nesting is bounded: every nested block, bracketed expression, unary chain
//! and every node wrapped by a trailer loop counts against
//! [`MAX_NESTING_DEPTH`]. Flat `elif` ladders and left-associative operator
//! chains still produce a deep tree, so each link counts against the separate
//! and much larger [`MAX_CHAIN_LENGTH`]. Hostile input therefore yields a
//! syntax error rather than exhausting the stack while parsing, walking or
//! dropping the tree.

use super::ast::*;
use super::lexer::{SyntaxError, Token, TokenKind, tokenize, tokenize_fragment};

/// Maximum nesting of blocks and expressions
pub const MAX_NESTING_DEPTH: usize = 100;

/// Maximum `elif` links and binary-operator links open at once
pub const MAX_CHAIN_LENGTH: usize = 1_000;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const AUGMENTED_OPS: &[&str] = &[
    "+=", "-=", "*=", "@=", "/=", "//=", "%=", "**=", "<<=", ">>=", "&=", "|=", "^=",
];

type PResult<T> = Result<T, SyntaxError>;

/// Parse a complete source file
pub fn parse_module(source: &str) -> Result<Module, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, 0).parse_module()
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Name(n) => format!("'{}'", n),
        TokenKind::Number(_) => "number".to_string(),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Op(op) => format!("'{}'", op),
        TokenKind::Newline => "end of line".to_string(),
        TokenKind::Indent => "indent".to_string(),
        TokenKind::Dedent => "dedent".to_string(),
        TokenKind::EndMarker => "end of input".to_string(),
    }
}

fn starts_expression(kind: &TokenKind) -> bool {
    match kind {
        TokenKind::Name(n) => {
            !is_keyword(n)
                || matches!(n.as_str(), "not" | "lambda" | "await" | "None" | "True" | "False")
        }
        TokenKind::Number(_) | TokenKind::Str(_) => true,
        TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."),
        _ => false,
    }
}

/// Re-tag an expression as an assignment or deletion target
fn with_context(expr: Expr, ctx: ExprContext) -> PResult<Expr> {
    let line = expr.line;
    let kind = match expr.kind {
        ExprKind::Name { id, .. } => ExprKind::Name { id, ctx },
        ExprKind::Attribute { value, attr, .. } => ExprKind::Attribute { value, attr, ctx },
        ExprKind::Subscript { value, slice, .. } => ExprKind::Subscript { value, slice, ctx },
        ExprKind::Starred { value, .. } => ExprKind::Starred {
            value: Box::new(with_context(*value, ctx)?),
            ctx,
        },
        ExprKind::Tuple { elts, .. } => ExprKind::Tuple {
            elts: elts
                .into_iter()
                .map(|e| with_context(e, ctx))
                .collect::<PResult<_>>()?,
            ctx,
        },
        ExprKind::List { elts, .. } => ExprKind::List {
            elts: elts
                .into_iter()
                .map(|e| with_context(e, ctx))
                .collect::<PResult<_>>()?,
            ctx,
        },
        other => {
            let verb = if ctx == ExprContext::Del { "delete" } else { "assign to" };
            return Err(SyntaxError::new(
                line,
                format!("cannot {} {}", verb, expression_label(&other)),
            ));
        }
    };
    Ok(Expr::new(kind, line))
}

fn expression_label(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::Call { .. } => "function call",
        ExprKind::Constant(_) => "literal",
        ExprKind::FormattedString(_) => "f-string expression",
        ExprKind::Lambda { .. } => "lambda",
        ExprKind::Compare { .. } => "comparison",
        ExprKind::BinOp { .. } | ExprKind::UnaryOp { .. } | ExprKind::BoolOp { .. } => "expression",
        ExprKind::IfExp { .. } => "conditional expression",
        ExprKind::NamedExpr { .. } => "named expression",
        ExprKind::Await(_) => "await expression",
        ExprKind::Yield(_) | ExprKind::YieldFrom(_) => "yield expression",
        ExprKind::Dict { .. } | ExprKind::DictComp { .. } => "dict literal",
        ExprKind::Set(_) | ExprKind::SetComp { .. } => "set display",
        ExprKind::ListComp { .. } => "list comprehension",
        ExprKind::GeneratorExp { .. } => "generator expression",
        _ => "expression",
    }
}

fn is_simple_target(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Name { .. } | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
    )
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    chain: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            chain: 0,
        }
    }

    // === Token cursor ===

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth_kind(&self, n: usize) -> &TokenKind {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + n).min(last)].kind
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Name(n) if n == kw)
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Newline | TokenKind::EndMarker) || self.at_op(";")
    }

    fn at_comprehension(&self) -> bool {
        self.at_keyword("for")
            || (self.at_keyword("async")
                && matches!(self.peek_nth_kind(1), TokenKind::Name(n) if n == "for"))
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", op)))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek_kind() {
            TokenKind::Name(n) if !is_keyword(n) => {
                let name = n.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn expect_newline(&mut self) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::EndMarker => Ok(()),
            _ => Err(self.unexpected("expected end of statement")),
        }
    }

    fn unexpected(&self, context: &str) -> SyntaxError {
        SyntaxError::new(
            self.line(),
            format!(
                "invalid syntax: {} but found {}",
                context,
                describe(self.peek_kind())
            ),
        )
    }

    // === Nesting bound ===

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(SyntaxError::new(
                self.line(),
                "too many nested blocks or expressions",
            ));
        }
        Ok(())
    }

    fn link(&mut self) -> PResult<()> {
        self.chain += 1;
        if self.chain > MAX_CHAIN_LENGTH {
            return Err(SyntaxError::new(self.line(), "operator or elif chain too long"));
        }
        Ok(())
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.enter()?;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // === Statements ===

    fn parse_module(mut self) -> PResult<Module> {
        let mut body = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::EndMarker => break,
                TokenKind::Newline => self.advance(),
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        let keyword = match self.peek_kind() {
            TokenKind::Indent => return Err(SyntaxError::new(self.line(), "unexpected indent")),
            TokenKind::Dedent => {
                return Err(SyntaxError::new(self.line(), "unexpected dedent"));
            }
            TokenKind::Op("@") => return Ok(vec![self.parse_decorated()?]),
            TokenKind::Name(n) => n.clone(),
            _ => return self.parse_simple_statements(),
        };

        let stmt = match keyword.as_str() {
            "if" => self.parse_if()?,
            "while" => self.parse_while()?,
            "for" => self.parse_for(false)?,
            "try" => self.parse_try()?,
            "with" => self.parse_with(false)?,
            "def" => self.parse_funcdef(Vec::new(), false)?,
            "class" => self.parse_classdef(Vec::new())?,
            "async" => self.parse_async(Vec::new())?,
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![stmt])
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.nested(|p| {
            if !matches!(p.peek_kind(), TokenKind::Newline) {
                return p.parse_simple_statements();
            }
            p.advance();
            if !matches!(p.peek_kind(), TokenKind::Indent) {
                return Err(SyntaxError::new(p.line(), "expected an indented block"));
            }
            p.advance();

            let mut body = Vec::new();
            loop {
                match p.peek_kind() {
                    TokenKind::Dedent => {
                        p.advance();
                        break;
                    }
                    TokenKind::EndMarker => break,
                    TokenKind::Newline => p.advance(),
                    _ => body.extend(p.parse_statement()?),
                }
            }
            Ok(body)
        })
    }

    fn parse_simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek_kind(), TokenKind::Newline | TokenKind::EndMarker) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn parse_small_statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let keyword = match self.peek_kind() {
            TokenKind::Name(n) => n.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" => {
                self.advance();
                StmtKind::Break
            }
            "continue" => {
                self.advance();
                StmtKind::Continue
            }
            "return" => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_star_expressions()?)
                };
                StmtKind::Return(value)
            }
            "raise" => {
                self.advance();
                let exc = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                let cause = if exc.is_some() && self.eat_keyword("from") {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Raise { exc, cause }
            }
            "global" | "nonlocal" => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if keyword == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            "del" => {
                self.advance();
                let targets = match self.parse_star_expressions()? {
                    Expr {
                        kind: ExprKind::Tuple { elts, .. },
                        ..
                    } => elts,
                    single => vec![single],
                };
                let targets = targets
                    .into_iter()
                    .map(|t| with_context(t, ExprContext::Del))
                    .collect::<PResult<_>>()?;
                StmtKind::Delete(targets)
            }
            "assert" => {
                self.advance();
                let test = self.parse_expression()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            "import" => self.parse_import()?,
            "from" => self.parse_from_import()?,
            _ => return self.parse_expr_statement(),
        };
        Ok(Stmt { kind, line })
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_alias(&mut self, dotted: bool) -> PResult<Alias> {
        let name = if dotted {
            self.parse_dotted_name()?
        } else {
            self.expect_name()?
        };
        let asname = if self.eat_keyword("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn parse_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = vec![self.parse_alias(true)?];
        while self.eat_op(",") {
            names.push(self.parse_alias(true)?);
        }
        Ok(StmtKind::Import(names))
    }

    fn parse_from_import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }

        let module = if self.at_keyword("import") {
            None
        } else {
            Some(self.parse_dotted_name()?)
        };
        if level == 0 && module.is_none() {
            return Err(self.unexpected("expected a module name"));
        }
        self.expect_keyword("import")?;

        let names = if self.eat_op("*") {
            vec![Alias {
                name: "*".to_string(),
                asname: None,
            }]
        } else if self.eat_op("(") {
            let mut names = vec![self.parse_alias(false)?];
            while self.eat_op(",") {
                if self.at_op(")") {
                    break;
                }
                names.push(self.parse_alias(false)?);
            }
            self.expect_op(")")?;
            names
        } else {
            let mut names = vec![self.parse_alias(false)?];
            while self.eat_op(",") {
                names.push(self.parse_alias(false)?);
            }
            names
        };

        Ok(StmtKind::ImportFrom {
            module,
            names,
            level,
        })
    }

    fn parse_expr_statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let first = self.parse_yield_or_star_expressions()?;

        if self.eat_op(":") {
            if !is_simple_target(&first) {
                return Err(SyntaxError::new(
                    line,
                    "only single target (not tuple) can be annotated",
                ));
            }
            let target = with_context(first, ExprContext::Store)?;
            let annotation = self.parse_expression()?;
            let value = if self.eat_op("=") {
                Some(self.parse_yield_or_star_expressions()?)
            } else {
                None
            };
            return Ok(Stmt {
                kind: StmtKind::AnnAssign {
                    target,
                    annotation,
                    value,
                },
                line,
            });
        }

        let augmented = match self.peek_kind() {
            TokenKind::Op(op) if AUGMENTED_OPS.contains(op) => BinOp::from_augmented(op),
            _ => None,
        };
        if let Some(op) = augmented {
            self.advance();
            if !is_simple_target(&first) {
                return Err(SyntaxError::new(
                    line,
                    format!(
                        "'{}' is an illegal expression for augmented assignment",
                        expression_label(&first.kind)
                    ),
                ));
            }
            let target = with_context(first, ExprContext::Store)?;
            let value = self.parse_yield_or_star_expressions()?;
            return Ok(Stmt {
                kind: StmtKind::AugAssign { target, op, value },
                line,
            });
        }

        if self.at_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.parse_yield_or_star_expressions()?);
            }
            let value = exprs.pop().ok_or_else(|| self.unexpected("expected a value"))?;
            let targets = exprs
                .into_iter()
                .map(|t| with_context(t, ExprContext::Store))
                .collect::<PResult<_>>()?;
            return Ok(Stmt {
                kind: StmtKind::Assign { targets, value },
                line,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(first),
            line,
        })
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_named_expression()?;
        let body = self.parse_block()?;

        let mut elifs = Vec::new();
        while self.at_keyword("elif") {
            if let Err(e) = self.link() {
                self.chain -= elifs.len() + 1;
                return Err(e);
            }
            let elif_line = self.line();
            self.advance();
            let test = self.parse_named_expression()?;
            let body = self.parse_block()?;
            elifs.push((test, body, elif_line));
        }
        let mut orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        self.chain -= elifs.len();

        for (test, body, elif_line) in elifs.into_iter().rev() {
            orelse = vec![Stmt {
                kind: StmtKind::If { test, body, orelse },
                line: elif_line,
            }];
        }

        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let test = self.parse_named_expression()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            line,
        })
    }

    fn parse_for(&mut self, is_async: bool) -> PResult<Stmt> {
        let line = self.line();
        self.expect_keyword("for")?;
        let target = self.parse_target_list()?;
        self.expect_keyword("in")?;
        let iter = self.parse_star_expressions()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            },
            line,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        while self.at_keyword("except") {
            let handler_line = self.line();
            self.advance();
            self.eat_op("*");
            let (type_, name) = if self.at_op(":") {
                (None, None)
            } else {
                let type_ = self.parse_expression()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(type_), name)
            };
            let body = self.parse_block()?;
            handlers.push(ExceptHandler {
                type_,
                name,
                body,
                line: handler_line,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let has_finally = self.eat_keyword("finally");
        let finalbody = if has_finally {
            self.parse_block()?
        } else {
            Vec::new()
        };

        if handlers.is_empty() && !has_finally {
            return Err(self.unexpected("expected 'except' or 'finally' block"));
        }

        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        })
    }

    fn parse_with(&mut self, is_async: bool) -> PResult<Stmt> {
        let line = self.line();
        self.expect_keyword("with")?;

        let items = if self.at_op("(") {
            let saved_pos = self.pos;
            let (saved_depth, saved_chain) = (self.depth, self.chain);
            match self.parse_parenthesized_with_items() {
                Ok(items) if self.at_op(":") => items,
                _ => {
                    self.pos = saved_pos;
                    self.depth = saved_depth;
                    self.chain = saved_chain;
                    self.parse_with_items()?
                }
            }
        } else {
            self.parse_with_items()?
        };

        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::With {
                items,
                body,
                is_async,
            },
            line,
        })
    }

    fn parse_parenthesized_with_items(&mut self) -> PResult<Vec<WithItem>> {
        self.expect_op("(")?;
        let mut items = vec![self.parse_with_item()?];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.parse_with_item()?);
        }
        self.expect_op(")")?;
        Ok(items)
    }

    fn parse_with_items(&mut self) -> PResult<Vec<WithItem>> {
        let mut items = vec![self.parse_with_item()?];
        while self.eat_op(",") {
            items.push(self.parse_with_item()?);
        }
        Ok(items)
    }

    fn parse_with_item(&mut self) -> PResult<WithItem> {
        let context = self.parse_expression()?;
        let target = if self.eat_keyword("as") {
            let target = self.parse_target_element()?;
            Some(with_context(target, ExprContext::Store)?)
        } else {
            None
        };
        Ok(WithItem { context, target })
    }

    fn parse_decorated(&mut self) -> PResult<Stmt> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.parse_named_expression()?);
            self.expect_newline()?;
        }
        if self.at_keyword("def") {
            self.parse_funcdef(decorators, false)
        } else if self.at_keyword("class") {
            self.parse_classdef(decorators)
        } else if self.at_keyword("async") {
            self.parse_async(decorators)
        } else {
            Err(self.unexpected("expected 'def' or 'class' after decorator"))
        }
    }

    fn parse_async(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        self.advance();
        if self.at_keyword("def") {
            self.parse_funcdef(decorators, true)
        } else if decorators.is_empty() && self.at_keyword("for") {
            self.parse_for(true)
        } else if decorators.is_empty() && self.at_keyword("with") {
            self.parse_with(true)
        } else {
            Err(self.unexpected("expected 'def', 'for' or 'with' after 'async'"))
        }
    }

    fn parse_funcdef(&mut self, decorators: Vec<Expr>, is_async: bool) -> PResult<Stmt> {
        let line = self.line();
        self.expect_keyword("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef {
                name,
                params,
                returns,
                body,
                decorators,
                is_async,
            },
            line,
        })
    }

    fn parse_classdef(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        let line = self.line();
        self.expect_keyword("class")?;
        let name = self.expect_name()?;
        let (bases, keywords) = if self.eat_op("(") {
            self.parse_call_arguments()?
        } else {
            (Vec::new(), Vec::new())
        };
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::ClassDef {
                name,
                bases,
                keywords,
                body,
                decorators,
            },
            line,
        })
    }

    fn parse_params(&mut self, closing: &str, annotations: bool) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        let mut seen_star = false;

        while !self.at_op(closing) {
            if self.eat_op("/") {
                if !self.eat_op(",") {
                    break;
                }
                continue;
            }

            let kind = if self.eat_op("**") {
                ParamKind::VarKeywords
            } else if self.eat_op("*") {
                seen_star = true;
                if self.at_op(",") || self.at_op(closing) {
                    if !self.eat_op(",") {
                        break;
                    }
                    continue;
                }
                ParamKind::VarArgs
            } else if seen_star {
                ParamKind::KeywordOnly
            } else {
                ParamKind::Positional
            };

            let name = self.expect_name()?;
            let annotation = if annotations && self.eat_op(":") {
                Some(self.parse_expression()?)
            } else {
                None
            };
            let default = if matches!(kind, ParamKind::Positional | ParamKind::KeywordOnly)
                && self.eat_op("=")
            {
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Param {
                name,
                kind,
                annotation,
                default,
            });

            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    /// Targets of `for` loops and comprehensions; stops before `in`
    fn parse_target_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_target_element()?;
        if !self.at_op(",") {
            return with_context(first, ExprContext::Store);
        }
        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_keyword("in") || self.at_op("=") || self.at_op(")") {
                break;
            }
            elts.push(self.parse_target_element()?);
        }
        with_context(
            Expr::new(
                ExprKind::Tuple {
                    elts,
                    ctx: ExprContext::Load,
                },
                line,
            ),
            ExprContext::Store,
        )
    }

    fn parse_target_element(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.eat_op("*") {
            let value = self.parse_bitwise_or()?;
            return Ok(Expr::new(
                ExprKind::Starred {
                    value: Box::new(value),
                    ctx: ExprContext::Load,
                },
                line,
            ));
        }
        self.parse_bitwise_or()
    }

    // === Expressions ===

    fn parse_yield_or_star_expressions(&mut self) -> PResult<Expr> {
        if self.at_keyword("yield") {
            self.parse_yield()
        } else {
            self.parse_star_expressions()
        }
    }

    fn parse_yield(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.expect_keyword("yield")?;
        let kind = if self.eat_keyword("from") {
            ExprKind::YieldFrom(Box::new(self.parse_expression()?))
        } else if starts_expression(self.peek_kind()) {
            ExprKind::Yield(Some(Box::new(self.parse_star_expressions()?)))
        } else {
            ExprKind::Yield(None)
        };
        Ok(Expr::new(kind, line))
    }

    fn parse_star_expressions(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_star_expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut elts = vec![first];
        while self.eat_op(",") {
            if !starts_expression(self.peek_kind()) {
                break;
            }
            elts.push(self.parse_star_expression()?);
        }
        Ok(Expr::new(
            ExprKind::Tuple {
                elts,
                ctx: ExprContext::Load,
            },
            line,
        ))
    }

    fn parse_star_expression(&mut self) -> PResult<Expr> {
        let line = self.line();
        if self.eat_op("*") {
            let value = self.parse_bitwise_or()?;
            return Ok(Expr::new(
                ExprKind::Starred {
                    value: Box::new(value),
                    ctx: ExprContext::Load,
                },
                line,
            ));
        }
        self.parse_expression()
    }

    fn parse_star_or_named(&mut self) -> PResult<Expr> {
        if self.at_op("*") {
            self.parse_star_expression()
        } else {
            self.parse_named_expression()
        }
    }

    fn parse_named_expression(&mut self) -> PResult<Expr> {
        let is_walrus = matches!(self.peek_kind(), TokenKind::Name(n) if !is_keyword(n))
            && matches!(self.peek_nth_kind(1), TokenKind::Op(":="));
        if !is_walrus {
            return self.parse_expression();
        }

        let line = self.line();
        let name = self.expect_name()?;
        self.advance();
        let value = self.parse_expression()?;
        Ok(Expr::new(
            ExprKind::NamedExpr {
                target: Box::new(Expr::new(
                    ExprKind::Name {
                        id: name,
                        ctx: ExprContext::Store,
                    },
                    line,
                )),
                value: Box::new(value),
            },
            line,
        ))
    }

    fn parse_expression(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            if p.at_keyword("lambda") {
                return p.parse_lambda();
            }
            let line = p.line();
            let body = p.parse_disjunction()?;
            if !p.eat_keyword("if") {
                return Ok(body);
            }
            let test = p.parse_disjunction()?;
            p.expect_keyword("else")?;
            let orelse = p.parse_expression()?;
            Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ))
        })
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.parse_params(":", false)?;
        self.expect_op(":")?;
        let body = self.parse_expression()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            line,
        ))
    }

    fn parse_bool_chain(
        &mut self,
        keyword: &str,
        op: BoolOp,
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let line = self.line();
        let first = next(self)?;
        if !self.at_keyword(keyword) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword(keyword) {
            values.push(next(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op, values }, line))
    }

    fn parse_disjunction(&mut self) -> PResult<Expr> {
        self.parse_bool_chain("or", BoolOp::Or, Self::parse_conjunction)
    }

    fn parse_conjunction(&mut self) -> PResult<Expr> {
        self.parse_bool_chain("and", BoolOp::And, Self::parse_inversion)
    }

    fn parse_inversion(&mut self) -> PResult<Expr> {
        if !self.at_keyword("not") {
            return self.parse_comparison();
        }
        let line = self.line();
        self.advance();
        let operand = self.nested(Self::parse_inversion)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn comparison_operator(&self) -> Option<(CmpOp, usize)> {
        match self.peek_kind() {
            TokenKind::Op("==") => Some((CmpOp::Eq, 1)),
            TokenKind::Op("!=") => Some((CmpOp::NotEq, 1)),
            TokenKind::Op("<") => Some((CmpOp::Lt, 1)),
            TokenKind::Op("<=") => Some((CmpOp::LtE, 1)),
            TokenKind::Op(">") => Some((CmpOp::Gt, 1)),
            TokenKind::Op(">=") => Some((CmpOp::GtE, 1)),
            TokenKind::Name(n) if n == "in" => Some((CmpOp::In, 1)),
            TokenKind::Name(n) if n == "not" => match self.peek_nth_kind(1) {
                TokenKind::Name(next) if next == "in" => Some((CmpOp::NotIn, 2)),
                _ => None,
            },
            TokenKind::Name(n) if n == "is" => match self.peek_nth_kind(1) {
                TokenKind::Name(next) if next == "not" => Some((CmpOp::IsNot, 2)),
                _ => Some((CmpOp::Is, 1)),
            },
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let line = self.line();
        let left = self.parse_bitwise_or()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some((op, width)) = self.comparison_operator() {
            for _ in 0..width {
                self.advance();
            }
            ops.push(op);
            comparators.push(self.parse_bitwise_or()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
            line,
        ))
    }

    fn parse_binary_level(
        &mut self,
        ops: &[&str],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        let mut wraps = 0;
        let result = loop {
            let op = match self.peek_kind() {
                TokenKind::Op(op) if ops.contains(op) => *op,
                _ => break Ok(left),
            };
            let line = left.line;
            let op = match BinOp::from_op(op) {
                Some(op) => op,
                None => break Err(self.unexpected("binary operator")),
            };
            self.advance();
            wraps += 1;
            if let Err(e) = self.link() {
                break Err(e);
            }
            let right = match next(self) {
                Ok(right) => right,
                Err(e) => break Err(e),
            };
            left = Expr::new(
                ExprKind::BinOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                line,
            );
        };
        self.chain -= wraps;
        result
    }

    fn parse_bitwise_or(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["|"], Self::parse_bitwise_xor)
    }

    fn parse_bitwise_xor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["^"], Self::parse_bitwise_and)
    }

    fn parse_bitwise_and(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["&"], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["<<", ">>"], Self::parse_sum)
    }

    fn parse_sum(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["+", "-"], Self::parse_term)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&["*", "/", "//", "%", "@"], Self::parse_factor)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Op("+") => UnaryOp::UAdd,
            TokenKind::Op("-") => UnaryOp::USub,
            TokenKind::Op("~") => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        let line = self.line();
        self.advance();
        let operand = self.nested(Self::parse_factor)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_await_primary()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        let line = base.line;
        let exponent = self.nested(Self::parse_factor)?;
        Ok(Expr::new(
            ExprKind::BinOp {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exponent),
            },
            line,
        ))
    }

    fn parse_await_primary(&mut self) -> PResult<Expr> {
        if !self.at_keyword("await") {
            return self.parse_primary();
        }
        let line = self.line();
        self.advance();
        let value = self.nested(Self::parse_primary)?;
        Ok(Expr::new(ExprKind::Await(Box::new(value)), line))
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        let mut wraps = 0;
        let result = loop {
            let line = expr.line;
            let kind = if self.eat_op(".") {
                match self.expect_name() {
                    Ok(attr) => ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                        ctx: ExprContext::Load,
                    },
                    Err(e) => break Err(e),
                }
            } else if self.eat_op("(") {
                match self.parse_call_arguments() {
                    Ok((args, keywords)) => ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    },
                    Err(e) => break Err(e),
                }
            } else if self.eat_op("[") {
                let slice = match self.parse_slices() {
                    Ok(slice) => slice,
                    Err(e) => break Err(e),
                };
                if let Err(e) = self.expect_op("]") {
                    break Err(e);
                }
                ExprKind::Subscript {
                    value: Box::new(expr),
                    slice: Box::new(slice),
                    ctx: ExprContext::Load,
                }
            } else {
                break Ok(expr);
            };

            if let Err(e) = self.enter() {
                break Err(e);
            }
            wraps += 1;
            expr = Expr::new(kind, line);
        };
        self.depth -= wraps;
        result
    }

    /// Arguments after an opening `(`; consumes the closing `)`
    fn parse_call_arguments(&mut self) -> PResult<(Vec<Expr>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();

        while !self.at_op(")") {
            let line = self.line();
            if self.eat_op("*") {
                let value = self.parse_expression()?;
                args.push(Expr::new(
                    ExprKind::Starred {
                        value: Box::new(value),
                        ctx: ExprContext::Load,
                    },
                    line,
                ));
            } else if self.eat_op("**") {
                keywords.push(Keyword {
                    arg: None,
                    value: self.parse_expression()?,
                });
            } else if matches!(self.peek_kind(), TokenKind::Name(n) if !is_keyword(n))
                && matches!(self.peek_nth_kind(1), TokenKind::Op("="))
            {
                let arg = self.expect_name()?;
                self.advance();
                keywords.push(Keyword {
                    arg: Some(arg),
                    value: self.parse_expression()?,
                });
            } else {
                let value = self.parse_named_expression()?;
                if self.at_comprehension() {
                    let generators = self.parse_comprehension_clauses()?;
                    args.push(Expr::new(
                        ExprKind::GeneratorExp {
                            elt: Box::new(value),
                            generators,
                        },
                        line,
                    ));
                } else {
                    args.push(value);
                }
            }

            if !self.eat_op(",") {
                break;
            }
        }

        self.expect_op(")")?;
        Ok((args, keywords))
    }

    fn parse_slices(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_slice()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            elts.push(self.parse_slice()?);
        }
        Ok(Expr::new(
            ExprKind::Tuple {
                elts,
                ctx: ExprContext::Load,
            },
            line,
        ))
    }

    fn parse_slice(&mut self) -> PResult<Expr> {
        let line = self.line();
        let lower = if self.at_op(":") {
            None
        } else {
            let expr = self.parse_star_or_named()?;
            if !self.at_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;

        let upper = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.eat_op(":") && !(self.at_op("]") || self.at_op(",")) {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, line))
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::Name(name) => {
                let kind = match name.as_str() {
                    "None" => ExprKind::Constant(Constant::None),
                    "True" => ExprKind::Constant(Constant::Bool(true)),
                    "False" => ExprKind::Constant(Constant::Bool(false)),
                    n if is_keyword(n) => return Err(self.unexpected("expected an expression")),
                    _ => ExprKind::Name {
                        id: name,
                        ctx: ExprContext::Load,
                    },
                };
                self.advance();
                Ok(Expr::new(kind, line))
            }
            TokenKind::Number(text) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Number(text)), line))
            }
            TokenKind::Str(_) => self.parse_strings(),
            TokenKind::Op("...") => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Ellipsis), line))
            }
            TokenKind::Op("(") => self.nested(Self::parse_parenthesized),
            TokenKind::Op("[") => self.nested(Self::parse_list_display),
            TokenKind::Op("{") => self.nested(Self::parse_brace_display),
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    fn parse_parenthesized(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.expect_op("(")?;
        if self.eat_op(")") {
            return Ok(Expr::new(
                ExprKind::Tuple {
                    elts: Vec::new(),
                    ctx: ExprContext::Load,
                },
                line,
            ));
        }
        if self.at_keyword("yield") {
            let expr = self.parse_yield()?;
            self.expect_op(")")?;
            return Ok(expr);
        }

        let first = self.parse_star_or_named()?;
        if self.at_comprehension() {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::new(
                ExprKind::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        if !self.at_op(",") {
            self.expect_op(")")?;
            return Ok(first);
        }

        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            elts.push(self.parse_star_or_named()?);
        }
        self.expect_op(")")?;
        Ok(Expr::new(
            ExprKind::Tuple {
                elts,
                ctx: ExprContext::Load,
            },
            line,
        ))
    }

    fn parse_list_display(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.expect_op("[")?;
        if self.eat_op("]") {
            return Ok(Expr::new(
                ExprKind::List {
                    elts: Vec::new(),
                    ctx: ExprContext::Load,
                },
                line,
            ));
        }

        let first = self.parse_star_or_named()?;
        if self.at_comprehension() {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            ));
        }

        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            elts.push(self.parse_star_or_named()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(
            ExprKind::List {
                elts,
                ctx: ExprContext::Load,
            },
            line,
        ))
    }

    fn parse_brace_display(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.expect_op("{")?;
        if self.eat_op("}") {
            return Ok(Expr::new(
                ExprKind::Dict {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
                line,
            ));
        }

        if self.eat_op("**") {
            let value = self.parse_bitwise_or()?;
            return self.parse_dict_rest(line, vec![None], vec![value]);
        }

        let first = self.parse_star_or_named()?;
        if self.eat_op(":") {
            let value = self.parse_expression()?;
            if self.at_comprehension() {
                let generators = self.parse_comprehension_clauses()?;
                self.expect_op("}")?;
                return Ok(Expr::new(
                    ExprKind::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                    line,
                ));
            }
            return self.parse_dict_rest(line, vec![Some(first)], vec![value]);
        }

        if self.at_comprehension() {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::new(
                ExprKind::SetComp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            ));
        }

        let mut elts = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            elts.push(self.parse_star_or_named()?);
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Set(elts), line))
    }

    fn parse_dict_rest(
        &mut self,
        line: usize,
        mut keys: Vec<Option<Expr>>,
        mut values: Vec<Expr>,
    ) -> PResult<Expr> {
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.eat_op("**") {
                keys.push(None);
                values.push(self.parse_bitwise_or()?);
            } else {
                keys.push(Some(self.parse_expression()?));
                self.expect_op(":")?;
                values.push(self.parse_expression()?);
            }
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Dict { keys, values }, line))
    }

    fn parse_comprehension_clauses(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.at_comprehension() {
            let is_async = self.eat_keyword("async");
            self.expect_keyword("for")?;
            let target = self.parse_target_list()?;
            self.expect_keyword("in")?;
            let iter = self.parse_disjunction()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_disjunction()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                ifs,
                is_async,
            });
        }
        Ok(generators)
    }

    // === String literals ===

    fn parse_strings(&mut self) -> PResult<Expr> {
        let line = self.line();
        let mut text = String::new();
        let mut embedded = Vec::new();
        let mut is_format = false;
        let mut is_bytes = false;

        while let TokenKind::Str(token) = self.peek_kind().clone() {
            let token_line = self.line();
            self.advance();
            is_bytes |= token.is_bytes;
            if token.is_format {
                is_format = true;
                embedded.extend(self.parse_format_fields(&token.value, token_line)?);
            } else {
                text.push_str(&token.value);
            }
        }

        let kind = if is_format {
            ExprKind::FormattedString(embedded)
        } else if is_bytes {
            ExprKind::Constant(Constant::Bytes(text))
        } else {
            ExprKind::Constant(Constant::Str(text))
        };
        Ok(Expr::new(kind, line))
    }

    /// Parse the `{...}` replacement fields of an f-string body
    fn parse_format_fields(&mut self, body: &str, line: usize) -> PResult<Vec<Expr>> {
        let chars: Vec<char> = body.chars().collect();
        let mut exprs = Vec::new();
        let mut line_offset = 0;
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '\n' => {
                    line_offset += 1;
                    i += 1;
                }
                '{' if chars.get(i + 1) == Some(&'{') => i += 2,
                '}' if chars.get(i + 1) == Some(&'}') => i += 2,
                '}' => {
                    return Err(SyntaxError::new(
                        line + line_offset,
                        "f-string: single '}' is not allowed",
                    ));
                }
                '{' => {
                    let field_line = line + line_offset;
                    let field = split_replacement_field(&chars, i + 1, field_line)?;
                    line_offset += chars[i..=field.close].iter().filter(|c| **c == '\n').count();
                    exprs.push(self.parse_fragment(&field.expression, field_line)?);
                    if let Some(spec) = field.format_spec {
                        exprs.extend(self.parse_format_fields(&spec, field_line)?);
                    }
                    i = field.close + 1;
                }
                _ => i += 1,
            }
        }
        Ok(exprs)
    }

    fn parse_fragment(&mut self, text: &str, line: usize) -> PResult<Expr> {
        if text.trim().is_empty() {
            return Err(SyntaxError::new(
                line,
                "f-string: empty expression not allowed",
            ));
        }
        self.enter()?;
        let tokens = tokenize_fragment(&format!("({})", text), line);
        let result = tokens.and_then(|tokens| {
            let mut inner = Parser::new(tokens, self.depth);
            inner.chain = self.chain;
            let expr = inner.parse_star_expressions()?;
            if !matches!(
                inner.peek_kind(),
                TokenKind::Newline | TokenKind::EndMarker
            ) {
                return Err(SyntaxError::new(line, "f-string: invalid expression"));
            }
            Ok(expr)
        });
        self.depth -= 1;
        result
    }
}

/// A `{expression!conversion:spec}` field located inside an f-string body
struct ReplacementField {
    expression: String,
    format_spec: Option<String>,
    /// Index of the closing `}`
    close: usize,
}

fn split_replacement_field(
    chars: &[char],
    start: usize,
    line: usize,
) -> PResult<ReplacementField> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end: Option<usize> = None;
    let collect = |from: usize, to: usize| chars[from..to].iter().collect::<String>();

    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if expr_end.is_none() {
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' if depth > 0 => depth -= 1,
                '}' => {
                    return Ok(ReplacementField {
                        expression: collect(start, i),
                        format_spec: None,
                        close: i,
                    });
                }
                '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => expr_end = Some(i),
                '=' if depth == 0 && is_debug_specifier(chars, i) => expr_end = Some(i),
                ':' if depth == 0 => {
                    let (spec, close) = split_format_spec(chars, i + 1, line)?;
                    return Ok(ReplacementField {
                        expression: collect(start, i),
                        format_spec: Some(spec),
                        close,
                    });
                }
                _ => {}
            }
        } else {
            let end = expr_end.unwrap_or(i);
            match c {
                '}' => {
                    return Ok(ReplacementField {
                        expression: collect(start, end),
                        format_spec: None,
                        close: i,
                    });
                }
                ':' => {
                    let (spec, close) = split_format_spec(chars, i + 1, line)?;
                    return Ok(ReplacementField {
                        expression: collect(start, end),
                        format_spec: Some(spec),
                        close,
                    });
                }
                _ => {}
            }
        }
        i += 1;
    }

    Err(SyntaxError::new(line, "f-string: expecting '}'"))
}

fn split_format_spec(chars: &[char], start: usize, line: usize) -> PResult<(String, usize)> {
    let mut nesting = 0usize;
    for (i, c) in chars.iter().enumerate().skip(start) {
        match c {
            '{' => nesting += 1,
            '}' if nesting == 0 => return Ok((chars[start..i].iter().collect(), i)),
            '}' => nesting -= 1,
            _ => {}
        }
    }
    Err(SyntaxError::new(line, "f-string: expecting '}'"))
}

/// `{x=}` self-documenting expressions: a lone `=` followed only by an
/// optional conversion, format spec or the closing brace
fn is_debug_specifier(chars: &[char], i: usize) -> bool {
    let prev = i.checked_sub(1).and_then(|p| chars.get(p));
    if matches!(prev, Some('=' | '!' | '<' | '>')) || chars.get(i + 1) == Some(&'=') {
        return false;
    }
    chars[i + 1..]
        .iter()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| matches!(c, '}' | '!' | ':'))
}

#[cfg(test)]
mod tests;
