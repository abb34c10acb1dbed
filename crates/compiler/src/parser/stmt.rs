//! Statement parsing
//!
//! The interesting case is the declaration-vs-expression ambiguity at the
//! start of a statement: `T (a);` declares `a` when `T` names a type, and a
//! tentative declarator parse with a balanced trailer decides it. Failure
//! backtracks and reparses as an expression statement.

use super::Parser;
use crate::ast::{Decl, NodeId, Stmt, Storage};
use crate::diag::Diagnostic;
use crate::lexer::{Keyword, Punct, TokenKind};

impl<'a> Parser<'a> {
    pub(crate) fn parse_statement(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();

        // Labels: `name: stmt`.
        if self.peek().kind == TokenKind::Ident
            && self.peek_n(1).is_punct(Punct::Colon)
            && !self.peek_n(1).is_punct(Punct::ColonColon)
        {
            let text = self.peek().text.clone();
            // Only treat as a label when the name is not a type (avoids
            // eating the start of a declaration with a bitfield-like shape).
            let id = self.intern(&text);
            if !self.is_type_name(id) {
                self.advance();
                self.advance();
                return Ok(self.arena.stmt(Stmt::Label { name: id }, loc));
            }
        }

        match self.peek().kind.clone() {
            TokenKind::Punct(Punct::LBrace) => self.parse_compound_statement(),
            TokenKind::Punct(Punct::Semi) => {
                self.advance();
                Ok(self.arena.stmt(Stmt::Empty, loc))
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                self.expect_punct(Punct::LParen, "'(' after 'while'")?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen, "')' after while condition")?;
                let body = self.parse_statement()?;
                Ok(self.arena.stmt(Stmt::While { cond, body }, loc))
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.advance();
                let body = self.parse_statement()?;
                if !self.eat_kw(Keyword::While) {
                    return Err(self.err_here("expected 'while' after do-statement body"));
                }
                self.expect_punct(Punct::LParen, "'(' after 'while'")?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen, "')'")?;
                self.expect_punct(Punct::Semi, "';' after do-while")?;
                Ok(self.arena.stmt(Stmt::DoWhile { body, cond }, loc))
            }
            TokenKind::Keyword(Keyword::Switch) => {
                self.advance();
                self.expect_punct(Punct::LParen, "'(' after 'switch'")?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen, "')'")?;
                let body = self.parse_statement()?;
                Ok(self.arena.stmt(Stmt::Switch { cond, body }, loc))
            }
            TokenKind::Keyword(Keyword::Case) => {
                self.advance();
                let value = self.parse_assignment_expression()?;
                self.expect_punct(Punct::Colon, "':' after case value")?;
                Ok(self.arena.stmt(Stmt::Case { value: Some(value) }, loc))
            }
            TokenKind::Keyword(Keyword::Default) => {
                self.advance();
                self.expect_punct(Punct::Colon, "':' after 'default'")?;
                Ok(self.arena.stmt(Stmt::Case { value: None }, loc))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect_punct(Punct::Semi, "';' after 'break'")?;
                Ok(self.arena.stmt(Stmt::Break, loc))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect_punct(Punct::Semi, "';' after 'continue'")?;
                Ok(self.arena.stmt(Stmt::Continue, loc))
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.check_punct(Punct::Semi) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_punct(Punct::Semi, "';' after return value")?;
                Ok(self.arena.stmt(Stmt::Return { value }, loc))
            }
            TokenKind::Keyword(Keyword::Goto) => {
                self.advance();
                let label = self.expect_ident("label after 'goto'")?;
                self.expect_punct(Punct::Semi, "';' after goto")?;
                Ok(self.arena.stmt(Stmt::Goto { label }, loc))
            }
            TokenKind::Keyword(Keyword::Throw) => {
                self.advance();
                let value = if self.check_punct(Punct::Semi) {
                    None
                } else {
                    Some(self.parse_assignment_expression()?)
                };
                self.expect_punct(Punct::Semi, "';' after throw")?;
                Ok(self.arena.stmt(Stmt::Throw { value }, loc))
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try(),
            TokenKind::Ident if self.peek().text == "__try" => self.parse_seh_try(),
            TokenKind::Keyword(Keyword::StaticAssert) => {
                let d = self.parse_static_assert()?;
                Ok(self.arena.stmt(Stmt::Decl { decl: d }, loc))
            }
            TokenKind::Keyword(Keyword::Using) | TokenKind::Keyword(Keyword::Typedef) => {
                let d = self
                    .parse_declaration()?
                    .ok_or_else(|| self.err_here("expected declaration"))?;
                Ok(self.arena.stmt(Stmt::Decl { decl: d }, loc))
            }
            _ => self.parse_declaration_or_expression_statement(),
        }
    }

    /// `if` / `if constexpr`, optional init-statement, optional else.
    fn parse_if(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'if'
        let is_constexpr = self.eat_kw(Keyword::Constexpr);
        self.expect_punct(Punct::LParen, "'(' after 'if'")?;

        // Optional init-statement: `if (decl; cond)`.
        let mut init = None;
        let saved = self.save();
        if self.looks_like_type_start()
            && let Some(d) = self.try_parse_local_declaration_no_semi()
        {
            if self.check_punct(Punct::Semi) {
                self.advance();
                init = Some(self.arena.stmt(Stmt::Decl { decl: d }, loc));
            } else {
                self.restore(saved);
            }
        }

        let cond = if init.is_none() && self.looks_like_type_start() {
            // Condition-declaration `if (T x = e)`.
            let saved = self.save();
            match self.try_parse_local_declaration_no_semi() {
                Some(d) if self.check_punct(Punct::RParen) => {
                    self.arena.stmt(Stmt::Decl { decl: d }, loc)
                }
                _ => {
                    self.restore(saved);
                    self.parse_expression()?
                }
            }
        } else {
            self.parse_expression()?
        };
        self.expect_punct(Punct::RParen, "')' after if condition")?;
        let then_branch = self.parse_statement()?;
        let else_branch = if self.eat_kw(Keyword::Else) {
            Some(self.parse_statement()?)
        } else {
            None
        };
        Ok(self.arena.stmt(
            Stmt::If {
                init,
                cond,
                then_branch,
                else_branch,
                is_constexpr,
            },
            loc,
        ))
    }

    /// Classic and range-based `for`.
    fn parse_for(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'for'
        self.expect_punct(Punct::LParen, "'(' after 'for'")?;

        // Range-for: `for (decl : range)`. Detect by scanning for a ':'
        // before the first ';' at depth zero.
        if self.range_for_ahead() {
            let decl = self.parse_range_for_declaration()?;
            self.expect_punct(Punct::Colon, "':' in range-for")?;
            let range = self.parse_expression()?;
            self.expect_punct(Punct::RParen, "')' after range expression")?;
            let body = self.parse_statement()?;
            return Ok(self.arena.stmt(Stmt::RangeFor { decl, range, body }, loc));
        }

        let init = if self.eat_punct(Punct::Semi) {
            None
        } else {
            let s = self.parse_declaration_or_expression_statement()?;
            Some(s)
        };
        let cond = if self.check_punct(Punct::Semi) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::Semi, "';' after for condition")?;
        let step = if self.check_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::RParen, "')' after for clauses")?;
        let body = self.parse_statement()?;
        Ok(self.arena.stmt(
            Stmt::For {
                init,
                cond,
                step,
                body,
            },
            loc,
        ))
    }

    fn range_for_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = 0usize;
        loop {
            let t = self.peek_n(i);
            match t.kind {
                TokenKind::Eof => return false,
                TokenKind::Punct(Punct::LParen)
                | TokenKind::Punct(Punct::LBracket)
                | TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RParen) => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                TokenKind::Punct(Punct::RBracket) | TokenKind::Punct(Punct::RBrace) => {
                    depth = depth.saturating_sub(1);
                }
                TokenKind::Punct(Punct::Semi) if depth == 0 => return false,
                TokenKind::Punct(Punct::Colon) if depth == 0 => return true,
                TokenKind::Punct(Punct::ColonColon) => {}
                _ => {}
            }
            i += 1;
        }
    }

    /// The declaration before `:` in a range-for, including structured
    /// bindings `auto [a, b]`.
    fn parse_range_for_declaration(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        if self.check_kw(Keyword::Auto)
            && (self.peek_n(1).is_punct(Punct::LBracket)
                || (self.peek_n(1).is_punct(Punct::Amp) && self.peek_n(2).is_punct(Punct::LBracket)))
        {
            return self.parse_structured_binding_intro();
        }
        let spec = self.parse_core_and_quals()?;
        let d = self.parse_declarator(spec)?;
        let name = d
            .name
            .ok_or_else(|| self.err_here("expected name in range-for declaration"))?;
        let ty = self.arena.type_spec(d.spec, loc);
        Ok(self.arena.decl(
            Decl::Variable {
                name,
                ty,
                init: None,
                storage: Storage::None,
                is_constexpr: false,
                is_constinit: false,
                is_inline: false,
            },
            loc,
        ))
    }

    /// `auto [a, b, c]` (without initializer); caller supplies it.
    fn parse_structured_binding_intro(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'auto'
        let is_ref = self.eat_punct(Punct::Amp) || self.eat_punct(Punct::AmpAmp);
        self.expect_punct(Punct::LBracket, "'[' in structured binding")?;
        let mut names = Vec::new();
        loop {
            names.push(self.expect_ident("binding name")?);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RBracket, "']' after binding names")?;
        // Initializer attached by the caller context; a placeholder init of
        // the same node keeps the variant total.
        let init = self.arena.expr(crate::ast::Expr::NullptrLit, loc);
        Ok(self
            .arena
            .decl(Decl::StructuredBinding { names, init, is_ref }, loc))
    }

    fn parse_try(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'try'
        let body = self.parse_compound_statement()?;
        let mut handlers = Vec::new();
        while self.check_kw(Keyword::Catch) {
            let hloc = self.loc();
            self.advance();
            self.expect_punct(Punct::LParen, "'(' after 'catch'")?;
            let param = if self.check_punct(Punct::Ellipsis) {
                self.advance();
                None
            } else {
                let ploc = self.loc();
                let spec = self.parse_core_and_quals()?;
                let d = self.parse_declarator(spec)?;
                let ty = self.arena.type_spec(d.spec, ploc);
                Some(self.arena.decl(
                    Decl::Param {
                        name: d.name,
                        ty,
                        default: None,
                        is_pack: false,
                    },
                    ploc,
                ))
            };
            self.expect_punct(Punct::RParen, "')' after catch parameter")?;
            let hbody = self.parse_compound_statement()?;
            handlers.push(self.arena.stmt(
                Stmt::Catch {
                    param,
                    body: hbody,
                },
                hloc,
            ));
        }
        if handlers.is_empty() {
            return Err(self.err_here("expected 'catch' after try block"));
        }
        Ok(self.arena.stmt(Stmt::Try { body, handlers }, loc))
    }

    /// Windows SEH: `__try { } __except(filter) { }` or `__try { } __finally { }`.
    fn parse_seh_try(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // '__try'
        let body = self.parse_compound_statement()?;
        if self.peek().is_ident("__except") {
            self.advance();
            self.expect_punct(Punct::LParen, "'(' after '__except'")?;
            let filter = self.parse_expression()?;
            self.expect_punct(Punct::RParen, "')' after SEH filter")?;
            let except_body = self.parse_compound_statement()?;
            return Ok(self.arena.stmt(
                Stmt::SehTry {
                    body,
                    except_filter: Some(filter),
                    except_body: Some(except_body),
                    finally_body: None,
                },
                loc,
            ));
        }
        if self.peek().is_ident("__finally") {
            self.advance();
            let finally_body = self.parse_compound_statement()?;
            return Ok(self.arena.stmt(
                Stmt::SehTry {
                    body,
                    except_filter: None,
                    except_body: None,
                    finally_body: Some(finally_body),
                },
                loc,
            ));
        }
        Err(self.err_here("expected '__except' or '__finally' after '__try' block"))
    }

    /// Statement starting with a name or type: tentative declaration first,
    /// expression on failure.
    fn parse_declaration_or_expression_statement(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();

        // Structured binding: `auto [a, b] = expr;`
        if self.check_kw(Keyword::Auto)
            && (self.peek_n(1).is_punct(Punct::LBracket)
                || (self.peek_n(1).is_punct(Punct::Amp) && self.peek_n(2).is_punct(Punct::LBracket)))
        {
            let d = self.parse_structured_binding_intro()?;
            self.expect_punct(Punct::Assign, "'=' after structured binding")?;
            let init = self.parse_assignment_expression()?;
            if let crate::ast::NodeKind::Decl(Decl::StructuredBinding { init: slot, .. }) =
                &mut self.arena.get_mut(d).kind
            {
                *slot = init;
            }
            self.expect_punct(Punct::Semi, "';' after structured binding")?;
            return Ok(self.arena.stmt(Stmt::Decl { decl: d }, loc));
        }

        if self.looks_like_type_start() {
            let saved = self.save();
            if let Some(d) = self.try_parse_local_declaration_no_semi() {
                if self.eat_punct(Punct::Semi) {
                    return Ok(self.arena.stmt(Stmt::Decl { decl: d }, loc));
                }
                // Trailer not balanced as a declaration; fall back.
                self.restore(saved);
            } else {
                self.restore(saved);
            }
        }
        let expr = self.parse_expression()?;
        self.expect_punct(Punct::Semi, "';' after expression")?;
        Ok(self.arena.stmt(Stmt::Expr { expr }, loc))
    }

    /// Tentative local declaration, stopping before the `;`. Returns `None`
    /// (cursor untouched by the caller's restore) when the tokens do not
    /// form a declaration.
    pub(crate) fn try_parse_local_declaration_no_semi(&mut self) -> Option<NodeId> {
        let loc = self.loc();
        let mut storage = Storage::None;
        let mut is_constexpr = false;
        loop {
            if self.eat_kw(Keyword::Static) {
                storage = Storage::Static;
            } else if self.eat_kw(Keyword::ThreadLocal) {
                storage = Storage::ThreadLocal;
            } else if self.eat_kw(Keyword::Constexpr) {
                is_constexpr = true;
            } else {
                break;
            }
        }
        let spec = self.parse_core_and_quals().ok()?;
        let d = self.parse_declarator(spec).ok()?;
        let name = d.name?;
        // A function declarator at block scope is not a variable; reject
        // the tentative parse so the expression path can try.
        if d.params.is_some() {
            return None;
        }
        let ty = self.arena.type_spec(d.spec, loc);
        let init = if self.eat_punct(Punct::Assign) {
            Some(self.parse_assignment_expression().ok()?)
        } else if self.check_punct(Punct::LBrace) {
            Some(self.parse_assignment_expression().ok()?)
        } else if self.check_punct(Punct::LParen) {
            // Direct-initialization `T x(args...)`.
            self.advance();
            let mut args = Vec::new();
            if !self.check_punct(Punct::RParen) {
                loop {
                    args.push(self.parse_assignment_expression().ok()?);
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            if !self.eat_punct(Punct::RParen) {
                return None;
            }
            if args.len() == 1 {
                Some(args[0])
            } else {
                Some(self.arena.expr(crate::ast::Expr::InitList { elems: args }, loc))
            }
        } else {
            None
        };
        Some(self.arena.decl(
            Decl::Variable {
                name,
                ty,
                init,
                storage,
                is_constexpr,
                is_constinit: false,
                is_inline: false,
            },
            loc,
        ))
    }

}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_tu;
    use crate::ast::{Decl, Stmt};

    fn body_stmts(src: &str) -> (crate::ast::Arena, Vec<crate::ast::NodeId>) {
        let (out, _) = parse_tu(src);
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let f = decls
            .iter()
            .find_map(|&d| match out.arena.as_decl(d) {
                Some(Decl::Function { body: Some(b), .. }) => Some(*b),
                _ => None,
            })
            .expect("function body");
        let Some(Stmt::Compound { stmts }) = out.arena.as_stmt(f) else {
            panic!()
        };
        let stmts = stmts.clone();
        (out.arena, stmts)
    }

    #[test]
    fn test_all_loop_forms() {
        let (_, stmts) = body_stmts(
            "int f() {\n\
               int s = 0;\n\
               for (int i = 0; i < 10; ++i) s += i;\n\
               while (s > 5) { s -= 1; }\n\
               do { s += 2; } while (s < 8);\n\
               return s;\n\
             }",
        );
        assert_eq!(stmts.len(), 5);
    }

    #[test]
    fn test_if_constexpr_flag() {
        let (arena, stmts) = body_stmts(
            "template<typename T> int f() { if constexpr (__is_integral(T)) { return 1; } else { return 0; } }",
        );
        match arena.as_stmt(stmts[0]) {
            Some(Stmt::If { is_constexpr, .. }) => assert!(is_constexpr),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_switch_with_cases() {
        let (arena, stmts) = body_stmts(
            "int f(int x) { switch (x) { case 1: return 10; case 2: return 20; default: return 0; } }",
        );
        assert!(matches!(arena.as_stmt(stmts[0]), Some(Stmt::Switch { .. })));
    }

    #[test]
    fn test_goto_and_label() {
        let (arena, stmts) = body_stmts("int f() { int x = 0; again: x += 1; if (x < 3) goto again; return x; }");
        assert!(matches!(arena.as_stmt(stmts[1]), Some(Stmt::Label { .. })));
    }

    #[test]
    fn test_try_catch() {
        let (arena, stmts) = body_stmts(
            "int f() { try { return 1; } catch (int e) { return e; } catch (...) { return 0; } }",
        );
        match arena.as_stmt(stmts[0]) {
            Some(Stmt::Try { handlers, .. }) => assert_eq!(handlers.len(), 2),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_seh_try_except() {
        let (arena, stmts) =
            body_stmts("int f() { __try { return 1; } __except(1) { return 2; } }");
        assert!(matches!(arena.as_stmt(stmts[0]), Some(Stmt::SehTry { .. })));
    }

    #[test]
    fn test_structured_binding() {
        let (arena, stmts) = body_stmts(
            "struct P { int a; int b; };\n\
             int f() { P p; auto [x, y] = p; return x + y; }",
        );
        match arena.as_stmt(stmts[1]) {
            Some(Stmt::Decl { decl }) => match arena.as_decl(*decl) {
                Some(Decl::StructuredBinding { names, .. }) => assert_eq!(names.len(), 2),
                other => panic!("{:?}", other),
            },
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_range_for() {
        let (arena, stmts) = body_stmts(
            "int f(int* begin, int* end) { int s = 0; for (int v : s) { s += v; } return s; }",
        );
        assert!(matches!(arena.as_stmt(stmts[1]), Some(Stmt::RangeFor { .. })));
    }

    #[test]
    fn test_direct_init_declaration() {
        let (arena, stmts) = body_stmts("struct C { int v; }; int f() { C c(3); return c.v; }");
        assert!(matches!(arena.as_stmt(stmts[0]), Some(Stmt::Decl { .. })));
        let _ = arena;
    }
}
