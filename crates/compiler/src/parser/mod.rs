//! Recursive-descent parser for the C++20 subset
//!
//! The grammar work is split across focused submodules:
//! - `ty`: decl-specifier-seq, declarators, type-specs
//! - `decl`: namespaces, classes, enums, templates, functions, variables
//! - `stmt`: statements
//! - `expr`: expressions, lambdas, requires-expressions
//!
//! Disambiguation rules that shape the code:
//! - a `<` after a name known to be a template opens an argument list;
//!   after `::` it always does
//! - `>>` is split into `>` `>` when it closes nested argument lists
//!   (maximal-munch reversal)
//! - statement-level `T (a);` ambiguity resolves by tentative declaration
//!   parse with backtracking
//!
//! Every parse failure produces one primary diagnostic at the offending
//! token; recovery resynchronizes at the next `;` / `}` boundary so a
//! single root failure never cascades.

mod decl;
mod expr;
mod stmt;
mod ty;

use crate::ast::{Arena, Decl, NodeId};
use crate::diag::{Diagnostic, SourceLoc, update_current_location};
use crate::lexer::{Keyword, Punct, Token, TokenKind};
use crate::strings::{StrId, StringTable};
use crate::templates::TemplateRegistry;
use std::collections::HashSet;

/// Everything the parser produces for one translation unit.
pub struct ParseOutput {
    pub arena: Arena,
    pub root: NodeId,
    pub registry: TemplateRegistry,
    /// Diagnostics recovered from; compilation fails if any are errors.
    pub diags: Vec<Diagnostic>,
}

pub struct Parser<'a> {
    toks: Vec<Token>,
    pos: usize,
    pub(crate) arena: Arena,
    pub(crate) strings: &'a mut StringTable,
    pub(crate) registry: TemplateRegistry,
    /// Names known to be types (classes, enums, typedefs, aliases).
    pub(crate) known_types: HashSet<StrId>,
    /// Names known to be templates (class/function/alias/variable).
    pub(crate) known_templates: HashSet<StrId>,
    /// Template parameter names in scope, innermost last. Parameters act
    /// as type names during the template body parse.
    pub(crate) template_param_scopes: Vec<HashSet<StrId>>,
    /// Non-type template parameter and parameter-pack names in scope.
    pub(crate) value_param_scopes: Vec<HashSet<StrId>>,
    pub(crate) diags: Vec<Diagnostic>,
    /// Class whose members are being parsed, for constructor detection.
    pub(crate) current_class: Option<StrId>,
    /// Whether `>` currently reads as an operator. Template argument lists
    /// push `false`; parenthesized subexpressions push `true` again.
    pub(crate) gt_stack: Vec<bool>,
}

impl<'a> Parser<'a> {
    pub fn new(toks: Vec<Token>, strings: &'a mut StringTable) -> Self {
        Parser {
            toks,
            pos: 0,
            arena: Arena::new(),
            strings,
            registry: TemplateRegistry::new(),
            known_types: HashSet::new(),
            known_templates: HashSet::new(),
            template_param_scopes: Vec::new(),
            value_param_scopes: Vec::new(),
            diags: Vec::new(),
            current_class: None,
            gt_stack: Vec::new(),
        }
    }

    /// `>` is a comparison operator here (not a template list closer).
    pub(crate) fn gt_is_operator(&self) -> bool {
        *self.gt_stack.last().unwrap_or(&true)
    }

    /// Parse a whole translation unit with per-declaration recovery.
    pub fn parse(mut self) -> ParseOutput {
        let mut decls = Vec::new();
        let start_loc = self.loc();
        while !self.at_eof() {
            match self.parse_declaration() {
                Ok(Some(d)) => decls.push(d),
                Ok(None) => {}
                Err(diag) => {
                    self.diags.push(diag);
                    self.sync_to_declaration_boundary();
                }
            }
        }
        let root = self.arena.decl(Decl::TranslationUnit { decls }, start_loc);
        ParseOutput {
            arena: self.arena,
            root,
            registry: self.registry,
            diags: self.diags,
        }
    }

    // ------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------

    pub(crate) fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    pub(crate) fn peek_n(&self, n: usize) -> &Token {
        let i = (self.pos + n).min(self.toks.len() - 1);
        &self.toks[i]
    }

    pub(crate) fn loc(&self) -> SourceLoc {
        self.peek().loc
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn advance(&mut self) -> Token {
        let tok = self.toks[self.pos.min(self.toks.len() - 1)].clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        update_current_location(self.peek().loc);
        tok
    }

    pub(crate) fn save(&self) -> usize {
        self.pos
    }

    pub(crate) fn restore(&mut self, saved: usize) {
        self.pos = saved;
    }

    pub(crate) fn check_punct(&self, p: Punct) -> bool {
        self.peek().is_punct(p)
    }

    pub(crate) fn check_kw(&self, k: Keyword) -> bool {
        self.peek().is_keyword(k)
    }

    pub(crate) fn eat_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn eat_kw(&mut self, k: Keyword) -> bool {
        if self.check_kw(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_punct(&mut self, p: Punct, what: &str) -> Result<Token, Diagnostic> {
        if self.check_punct(p) {
            Ok(self.advance())
        } else {
            Err(self.err_here(format!("expected {} before '{}'", what, self.peek().text)))
        }
    }

    pub(crate) fn expect_ident(&mut self, what: &str) -> Result<StrId, Diagnostic> {
        if self.peek().kind == TokenKind::Ident {
            let tok = self.advance();
            Ok(self.strings.intern(&tok.text))
        } else {
            Err(self.err_here(format!("expected {} before '{}'", what, self.peek().text)))
        }
    }

    pub(crate) fn err_here(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::error(self.loc(), message)
    }

    pub(crate) fn intern(&mut self, s: &str) -> StrId {
        self.strings.intern(s)
    }

    /// Close one template argument list. Accepts `>` directly; splits `>>`
    /// and `>>=` so the remaining token closes the enclosing list
    /// (maximal-munch reversal).
    pub(crate) fn expect_template_close(&mut self) -> Result<(), Diagnostic> {
        match self.peek().kind {
            TokenKind::Punct(Punct::Gt) => {
                self.advance();
                Ok(())
            }
            TokenKind::Punct(Punct::Shr) => {
                self.split_current(Punct::Gt);
                Ok(())
            }
            TokenKind::Punct(Punct::ShrAssign) => {
                self.split_current(Punct::GtEq);
                Ok(())
            }
            TokenKind::Punct(Punct::GtEq) => {
                self.split_current(Punct::Assign);
                Ok(())
            }
            _ => Err(self.err_here(format!(
                "expected '>' to close template argument list before '{}'",
                self.peek().text
            ))),
        }
    }

    /// Replace the current token with `rest`, consuming one leading `>`.
    fn split_current(&mut self, rest: Punct) {
        let tok = &mut self.toks[self.pos];
        let mut loc = tok.loc;
        loc.column += 1;
        let text = match rest {
            Punct::Gt => ">",
            Punct::GtEq => ">=",
            Punct::Assign => "=",
            _ => unreachable!("split only produces >-family tokens"),
        };
        *tok = Token {
            kind: TokenKind::Punct(rest),
            text: text.to_string(),
            loc,
            start_of_line: false,
            space_before: false,
        };
    }

    // ------------------------------------------------------------
    // Name classification
    // ------------------------------------------------------------

    /// The name is a template parameter in an enclosing template header.
    pub(crate) fn is_template_param(&self, name: StrId) -> bool {
        self.template_param_scopes.iter().any(|s| s.contains(&name))
    }

    pub(crate) fn is_value_param(&self, name: StrId) -> bool {
        self.value_param_scopes.iter().any(|s| s.contains(&name))
    }

    /// The name denotes a type in the current scope.
    pub(crate) fn is_type_name(&self, name: StrId) -> bool {
        self.known_types.contains(&name)
            || self.is_template_param(name)
            || self.registry.is_class_template(name)
    }

    /// The name is known to be a template, so a following `<` opens an
    /// argument list instead of being the less-than operator.
    pub(crate) fn is_template_name(&self, name: StrId) -> bool {
        self.known_templates.contains(&name) || self.registry.is_template(name)
    }

    // ------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------

    /// Skip to just past the next `;`, or to a `}` at brace depth zero, so
    /// the next declaration parse starts clean.
    pub(crate) fn sync_to_declaration_boundary(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match self.peek().kind {
                TokenKind::Punct(Punct::Semi) if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::Punct(Punct::LBrace) => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::Punct(Punct::RBrace) => {
                    self.advance();
                    if depth <= 1 {
                        // Eat a trailing ';' from a class definition.
                        self.eat_punct(Punct::Semi);
                        return;
                    }
                    depth -= 1;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Skip to the next statement boundary inside a function body.
    pub(crate) fn sync_to_statement_boundary(&mut self) {
        while !self.at_eof() {
            match self.peek().kind {
                TokenKind::Punct(Punct::Semi) => {
                    self.advance();
                    return;
                }
                TokenKind::Punct(Punct::RBrace) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, NodeKind, Stmt};
    use crate::lexer::Lexer;

    pub(super) fn parse_tu(src: &str) -> (ParseOutput, StringTable) {
        let mut strings = StringTable::new();
        let file = strings.intern("test.cpp");
        let toks = Lexer::new(src, file).lex().expect("lex ok");
        let parser = Parser::new(toks, &mut strings);
        let out = parser.parse();
        (out, strings)
    }

    fn parse_ok(src: &str) -> ParseOutput {
        let (out, _) = parse_tu(src);
        assert!(
            out.diags.is_empty(),
            "unexpected diagnostics: {:?}",
            out.diags
        );
        out
    }

    #[test]
    fn test_empty_translation_unit() {
        let out = parse_ok("");
        match out.arena.as_decl(out.root) {
            Some(Decl::TranslationUnit { decls }) => assert!(decls.is_empty()),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_shr_split_in_nested_template_args() {
        // vector<vector<int>> requires splitting '>>'.
        let out = parse_ok(
            "template<typename T> struct vector { T* data; };\n\
             vector<vector<int>> m;",
        );
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn test_less_than_is_not_template_args_for_unknown_names() {
        // `a < b > c` with plain variables parses as comparisons.
        let out = parse_ok("int f(int a, int b, int c) { return a < b > c; }");
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        assert_eq!(decls.len(), 1);
    }

    #[test]
    fn test_recovery_produces_single_primary_error() {
        let (out, _) = parse_tu("int f() { return 1 }\nint g() { return 2; }");
        // One missing ';' produces one diagnostic; g still parses.
        assert_eq!(out.diags.len(), 1);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        assert!(!decls.is_empty());
    }

    #[test]
    fn test_declaration_vs_expression_statement() {
        let out = parse_ok(
            "struct T { int v; };\n\
             int f() { T (a); a.v = 1; return a.v; }",
        );
        // `T (a);` is a declaration of `a`, not a call.
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Function { body: Some(body), .. }) = out.arena.as_decl(decls[1]) else {
            panic!()
        };
        let Some(Stmt::Compound { stmts }) = out.arena.as_stmt(*body) else {
            panic!()
        };
        match out.arena.as_stmt(stmts[0]) {
            Some(Stmt::Decl { .. }) => {}
            other => panic!("expected declaration statement, got {:?}", other),
        }
    }

    #[test]
    fn test_spaceship_recognized_in_template_context() {
        let out = parse_ok("int f(int a, int b) { return (a <=> b) > 0; }");
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Function { body: Some(body), .. }) = out.arena.as_decl(decls[0]) else {
            panic!()
        };
        let Some(Stmt::Compound { stmts }) = out.arena.as_stmt(*body) else {
            panic!()
        };
        let Some(Stmt::Return { value: Some(v) }) = out.arena.as_stmt(stmts[0]) else {
            panic!()
        };
        match out.arena.as_expr(*v) {
            Some(Expr::Binary { .. }) => {}
            other => panic!("{:?}", other),
        }
        // No deeper shape assertions; the node kinds suffice here.
        let _ = NodeKind::Expr(Expr::This);
    }
}
