//! Expression parsing
//!
//! Precedence-climbing over the C++20 operator grammar, plus the expression
//! forms that need their own machinery: lambdas, `new`/`delete`, the five
//! cast flavors, fold expressions, pack expansion, `requires` expressions
//! and the compiler's type-trait intrinsics.

use super::Parser;
use crate::ast::{
    AssignOp, BinaryOp, Capture, CaptureKind, CastKind, CoreType, Decl, DerivedType, Expr,
    FoldKind, NodeId, Requirement, Stmt, TypeSpec, TypeTrait, UnaryOp,
};
use crate::diag::Diagnostic;
use crate::lexer::{Keyword, Punct, TokenKind};
use crate::strings::StrId;

impl<'a> Parser<'a> {
    /// Full expression, including the comma operator.
    pub(crate) fn parse_expression(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let mut lhs = self.parse_assignment_expression()?;
        while self.check_punct(Punct::Comma) {
            self.advance();
            let rhs = self.parse_assignment_expression()?;
            lhs = self.arena.expr(
                Expr::Binary {
                    op: BinaryOp::Comma,
                    lhs,
                    rhs,
                },
                loc,
            );
        }
        Ok(lhs)
    }

    pub(crate) fn parse_assignment_expression(&mut self) -> Result<NodeId, Diagnostic> {
        // Braced-init as an expression operand (`x = {1, 2}`).
        if self.check_punct(Punct::LBrace) {
            return self.parse_braced_init();
        }
        let loc = self.loc();
        let lhs = self.parse_ternary()?;
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Assign) => Some(AssignOp::Assign),
            TokenKind::Punct(Punct::PlusAssign) => Some(AssignOp::Add),
            TokenKind::Punct(Punct::MinusAssign) => Some(AssignOp::Sub),
            TokenKind::Punct(Punct::StarAssign) => Some(AssignOp::Mul),
            TokenKind::Punct(Punct::SlashAssign) => Some(AssignOp::Div),
            TokenKind::Punct(Punct::PercentAssign) => Some(AssignOp::Rem),
            TokenKind::Punct(Punct::ShlAssign) => Some(AssignOp::Shl),
            TokenKind::Punct(Punct::ShrAssign) if self.gt_is_operator() => Some(AssignOp::Shr),
            TokenKind::Punct(Punct::AmpAssign) => Some(AssignOp::And),
            TokenKind::Punct(Punct::PipeAssign) => Some(AssignOp::Or),
            TokenKind::Punct(Punct::CaretAssign) => Some(AssignOp::Xor),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_assignment_expression()?;
            return Ok(self.arena.expr(Expr::Assign { op, lhs, rhs }, loc));
        }
        Ok(lhs)
    }

    fn parse_braced_init(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.expect_punct(Punct::LBrace, "'{'")?;
        // Designated initializers: `{ .a = 1, .b = 2 }`.
        if self.check_punct(Punct::Dot) {
            let mut inits = Vec::new();
            loop {
                self.expect_punct(Punct::Dot, "'.'")?;
                let name = self.expect_ident("designator name")?;
                self.expect_punct(Punct::Assign, "'=' in designated initializer")?;
                let value = self.parse_assignment_expression()?;
                inits.push((name, value));
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            self.expect_punct(Punct::RBrace, "'}'")?;
            return Ok(self.arena.expr(Expr::Designated { inits }, loc));
        }
        let mut elems = Vec::new();
        if !self.check_punct(Punct::RBrace) {
            loop {
                elems.push(self.parse_assignment_expression()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
                if self.check_punct(Punct::RBrace) {
                    break; // trailing comma
                }
            }
        }
        self.expect_punct(Punct::RBrace, "'}'")?;
        Ok(self.arena.expr(Expr::InitList { elems }, loc))
    }

    fn parse_ternary(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let cond = self.parse_binary(0)?;
        if self.eat_punct(Punct::Question) {
            let then_expr = self.parse_assignment_expression()?;
            self.expect_punct(Punct::Colon, "':' in conditional expression")?;
            let else_expr = self.parse_assignment_expression()?;
            return Ok(self.arena.expr(
                Expr::Ternary {
                    cond,
                    then_expr,
                    else_expr,
                },
                loc,
            ));
        }
        Ok(cond)
    }

    /// Binary operator at `min_prec` or tighter. Precedence table mirrors
    /// C++ ([expr.compound]); `>` and `>>` only act as operators when the
    /// disambiguation stack says so.
    fn binary_op_here(&self) -> Option<(BinaryOp, u8)> {
        use BinaryOp::*;
        let p = match self.peek().kind {
            TokenKind::Punct(p) => p,
            _ => return None,
        };
        let entry = match p {
            Punct::PipePipe => (LogicalOr, 1),
            Punct::AmpAmp => (LogicalAnd, 2),
            Punct::Pipe => (BitOr, 3),
            Punct::Caret => (BitXor, 4),
            Punct::Amp => (BitAnd, 5),
            Punct::EqEq => (Eq, 6),
            Punct::NotEq => (Ne, 6),
            Punct::Lt => (Lt, 7),
            Punct::LtEq => (Le, 7),
            Punct::Gt if self.gt_is_operator() => (Gt, 7),
            Punct::GtEq if self.gt_is_operator() => (Ge, 7),
            Punct::Spaceship => (Spaceship, 8),
            Punct::Shl => (Shl, 9),
            Punct::Shr if self.gt_is_operator() => (Shr, 9),
            Punct::Plus => (Add, 10),
            Punct::Minus => (Sub, 10),
            Punct::Star => (Mul, 11),
            Punct::Slash => (Div, 11),
            Punct::Percent => (Rem, 11),
            Punct::DotStar | Punct::ArrowStar => (MemberPtr, 12),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_op_here() {
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(prec + 1)?;
            lhs = self.arena.expr(Expr::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Minus),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            TokenKind::Punct(Punct::PlusPlus) => Some(UnaryOp::PreInc),
            TokenKind::Punct(Punct::MinusMinus) => Some(UnaryOp::PreDec),
            TokenKind::Punct(Punct::Star) => Some(UnaryOp::Deref),
            TokenKind::Punct(Punct::Amp) => Some(UnaryOp::AddrOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(self.arena.expr(Expr::Unary { op, operand }, loc));
        }

        if self.check_kw(Keyword::Sizeof) {
            self.advance();
            // sizeof...(pack)
            if self.eat_punct(Punct::Ellipsis) {
                self.expect_punct(Punct::LParen, "'(' after 'sizeof...'")?;
                let name = self.expect_ident("pack name")?;
                self.expect_punct(Punct::RParen, "')'")?;
                return Ok(self.arena.expr(Expr::SizeofPack { name }, loc));
            }
            // sizeof(type) vs sizeof expr
            if self.check_punct(Punct::LParen) {
                let saved = self.save();
                self.advance();
                if self.looks_like_type_start()
                    && let Ok(ty) = self.parse_type_spec()
                    && self.check_punct(Punct::RParen)
                {
                    self.advance();
                    return Ok(self.arena.expr(Expr::Sizeof { arg: ty, is_type: true }, loc));
                }
                self.restore(saved);
            }
            let operand = self.parse_unary()?;
            return Ok(self.arena.expr(
                Expr::Sizeof {
                    arg: operand,
                    is_type: false,
                },
                loc,
            ));
        }

        if self.check_kw(Keyword::Alignof) {
            self.advance();
            self.expect_punct(Punct::LParen, "'(' after 'alignof'")?;
            let ty = self.parse_type_spec()?;
            self.expect_punct(Punct::RParen, "')'")?;
            return Ok(self.arena.expr(Expr::Alignof { arg: ty }, loc));
        }

        if self.check_kw(Keyword::New) {
            return self.parse_new();
        }
        if self.check_kw(Keyword::Delete) {
            self.advance();
            let is_array = if self.check_punct(Punct::LBracket) {
                self.advance();
                self.expect_punct(Punct::RBracket, "']' after 'delete['")?;
                true
            } else {
                false
            };
            let expr = self.parse_unary()?;
            return Ok(self.arena.expr(Expr::Delete { expr, is_array }, loc));
        }

        // C-style cast: `(type) expr` — tentative.
        if self.check_punct(Punct::LParen) {
            let saved = self.save();
            self.advance();
            if self.looks_like_type_start()
                && let Ok(ty) = self.parse_type_spec()
                && self.check_punct(Punct::RParen)
            {
                self.advance();
                // Reject `(x)` followed by an operator that makes this a
                // parenthesized expression instead: a cast must be followed
                // by a unary-expression start.
                if self.starts_unary_expression() {
                    let expr = self.parse_unary()?;
                    return Ok(self.arena.expr(
                        Expr::Cast {
                            kind: CastKind::CStyle,
                            ty,
                            expr,
                        },
                        loc,
                    ));
                }
            }
            self.restore(saved);
        }

        self.parse_postfix()
    }

    fn starts_unary_expression(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Ident
            | TokenKind::Int { .. }
            | TokenKind::Float { .. }
            | TokenKind::Char { .. }
            | TokenKind::Str { .. } => true,
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::True
                    | Keyword::False
                    | Keyword::Nullptr
                    | Keyword::This
                    | Keyword::Sizeof
                    | Keyword::New
                    | Keyword::Delete
            ),
            TokenKind::Punct(p) => matches!(
                p,
                Punct::LParen
                    | Punct::Plus
                    | Punct::Minus
                    | Punct::Bang
                    | Punct::Tilde
                    | Punct::Star
                    | Punct::Amp
                    | Punct::PlusPlus
                    | Punct::MinusMinus
            ),
            _ => false,
        }
    }

    fn parse_new(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'new'
        let spec = self.parse_core_and_quals()?;
        let mut spec = spec;
        // Pointer suffixes belong to the allocated type.
        self.parse_pointer_suffixes(&mut spec)?;
        let mut array_len = None;
        if self.check_punct(Punct::LBracket) {
            self.advance();
            array_len = Some(self.parse_expression()?);
            self.expect_punct(Punct::RBracket, "']' in array new")?;
        }
        let ty = self.arena.type_spec(spec, loc);
        let mut args = Vec::new();
        if self.check_punct(Punct::LParen) {
            self.advance();
            if !self.check_punct(Punct::RParen) {
                loop {
                    args.push(self.parse_assignment_expression()?);
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RParen, "')' after new-initializer")?;
        } else if self.check_punct(Punct::LBrace) {
            let init = self.parse_braced_init()?;
            args.push(init);
        }
        Ok(self.arena.expr(
            Expr::New {
                ty,
                array_len,
                args,
            },
            loc,
        ))
    }

    fn parse_postfix(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let mut e = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Punct(Punct::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check_punct(Punct::RParen) {
                        loop {
                            args.push(self.parse_assignment_expression()?);
                            if !self.eat_punct(Punct::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect_punct(Punct::RParen, "')' after call arguments")?;
                    e = self.arena.expr(Expr::Call { callee: e, args }, loc);
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect_punct(Punct::RBracket, "']' after subscript")?;
                    e = self.arena.expr(Expr::Subscript { base: e, index }, loc);
                }
                TokenKind::Punct(Punct::Dot) | TokenKind::Punct(Punct::Arrow) => {
                    let is_arrow = self.check_punct(Punct::Arrow);
                    self.advance();
                    // `obj.template get<T>()` — the keyword only disambiguates.
                    let _ = self.eat_kw(Keyword::Template);
                    let member = self.expect_ident("member name")?;
                    let template_args = self.maybe_member_template_args(member)?;
                    e = self.arena.expr(
                        Expr::Member {
                            base: e,
                            member,
                            is_arrow,
                            template_args,
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::PlusPlus) => {
                    self.advance();
                    e = self.arena.expr(
                        Expr::Unary {
                            op: UnaryOp::PostInc,
                            operand: e,
                        },
                        loc,
                    );
                }
                TokenKind::Punct(Punct::MinusMinus) => {
                    self.advance();
                    e = self.arena.expr(
                        Expr::Unary {
                            op: UnaryOp::PostDec,
                            operand: e,
                        },
                        loc,
                    );
                }
                _ => break,
            }
        }
        Ok(e)
    }

    /// Template arguments after a member name: taken when the member is a
    /// known template, or when a tentative parse of `<args>` closes and is
    /// followed by `(`.
    fn maybe_member_template_args(&mut self, member: StrId) -> Result<Vec<NodeId>, Diagnostic> {
        if !self.check_punct(Punct::Lt) {
            return Ok(Vec::new());
        }
        if self.is_template_name(member) {
            self.advance();
            return self.parse_template_argument_list();
        }
        let saved = self.save();
        self.advance();
        match self.parse_template_argument_list() {
            Ok(args) if self.check_punct(Punct::LParen) => Ok(args),
            _ => {
                self.restore(saved);
                Ok(Vec::new())
            }
        }
    }

    fn parse_primary(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        match self.peek().kind.clone() {
            TokenKind::Int { value, suffix, .. } => {
                self.advance();
                Ok(self.arena.expr(Expr::IntLit { value, suffix }, loc))
            }
            TokenKind::Float { value, suffix } => {
                self.advance();
                Ok(self.arena.expr(Expr::FloatLit { value, suffix }, loc))
            }
            TokenKind::Str { value, prefix } => {
                self.advance();
                // Adjacent string literals concatenate.
                let mut value = value;
                while let TokenKind::Str { value: more, .. } = &self.peek().kind {
                    value.push_str(more);
                    self.advance();
                }
                Ok(self.arena.expr(Expr::StringLit { value, prefix }, loc))
            }
            TokenKind::Char { value, prefix } => {
                self.advance();
                Ok(self.arena.expr(Expr::CharLit { value, prefix }, loc))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(self.arena.expr(Expr::BoolLit { value: true }, loc))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(self.arena.expr(Expr::BoolLit { value: false }, loc))
            }
            TokenKind::Keyword(Keyword::Nullptr) => {
                self.advance();
                Ok(self.arena.expr(Expr::NullptrLit, loc))
            }
            TokenKind::Keyword(Keyword::This) => {
                self.advance();
                Ok(self.arena.expr(Expr::This, loc))
            }
            TokenKind::Keyword(
                k @ (Keyword::StaticCast
                | Keyword::ConstCast
                | Keyword::ReinterpretCast
                | Keyword::DynamicCast),
            ) => {
                self.advance();
                let kind = match k {
                    Keyword::StaticCast => CastKind::Static,
                    Keyword::ConstCast => CastKind::Const,
                    Keyword::ReinterpretCast => CastKind::Reinterpret,
                    _ => CastKind::Dynamic,
                };
                self.expect_punct(Punct::Lt, "'<' after cast keyword")?;
                self.gt_stack.push(false);
                let ty = self.parse_type_spec();
                let close = ty.is_ok().then(|| self.expect_template_close());
                self.gt_stack.pop();
                let ty = ty?;
                if let Some(c) = close {
                    c?;
                }
                self.expect_punct(Punct::LParen, "'(' in cast")?;
                let expr = self.parse_expression()?;
                self.expect_punct(Punct::RParen, "')' in cast")?;
                Ok(self.arena.expr(Expr::Cast { kind, ty, expr }, loc))
            }
            TokenKind::Keyword(Keyword::Typeid) => {
                self.advance();
                self.expect_punct(Punct::LParen, "'(' after 'typeid'")?;
                let saved = self.save();
                let (arg, is_type) = if self.looks_like_type_start() {
                    match self.parse_type_spec() {
                        Ok(t) if self.check_punct(Punct::RParen) => (t, true),
                        _ => {
                            self.restore(saved);
                            (self.parse_expression()?, false)
                        }
                    }
                } else {
                    (self.parse_expression()?, false)
                };
                self.expect_punct(Punct::RParen, "')' after 'typeid'")?;
                Ok(self.arena.expr(Expr::Typeid { arg, is_type }, loc))
            }
            TokenKind::Keyword(Keyword::Requires) => self.parse_requires_expression(),
            TokenKind::Punct(Punct::LBracket) => self.parse_lambda(),
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                // Fold expression `(... op pack)`.
                if self.check_punct(Punct::Ellipsis) {
                    self.advance();
                    let op = self
                        .fold_operator()
                        .ok_or_else(|| self.err_here("expected operator in fold expression"))?;
                    let right = self.parse_assignment_expression()?;
                    self.expect_punct(Punct::RParen, "')' after fold expression")?;
                    return Ok(self.arena.expr(
                        Expr::Fold {
                            kind: FoldKind::UnaryLeft,
                            op,
                            left: None,
                            right: Some(right),
                        },
                        loc,
                    ));
                }
                self.gt_stack.push(true);
                let inner = self.parse_expression();
                self.gt_stack.pop();
                let inner = inner?;
                // `(pack op ...)` / `(pack op ... op init)`.
                if let Some(op) = self.fold_operator_if_ellipsis_follows() {
                    self.advance(); // op
                    self.advance(); // ...
                    if self.eat_punct(Punct::RParen) {
                        return Ok(self.arena.expr(
                            Expr::Fold {
                                kind: FoldKind::UnaryRight,
                                op,
                                left: Some(inner),
                                right: None,
                            },
                            loc,
                        ));
                    }
                    let op2 = self
                        .fold_operator()
                        .ok_or_else(|| self.err_here("expected operator after '...' in fold"))?;
                    if op2 != op {
                        return Err(self.err_here("fold expression operators must match"));
                    }
                    let right = self.parse_assignment_expression()?;
                    self.expect_punct(Punct::RParen, "')' after fold expression")?;
                    return Ok(self.arena.expr(
                        Expr::Fold {
                            kind: FoldKind::Binary,
                            op,
                            left: Some(inner),
                            right: Some(right),
                        },
                        loc,
                    ));
                }
                self.expect_punct(Punct::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident => {
                let text = self.peek().text.clone();
                if let Some(trait_) = type_trait_from_name(&text) {
                    return self.parse_type_trait_call(trait_);
                }
                match text.as_str() {
                    "__builtin_addressof" => {
                        self.advance();
                        self.expect_punct(Punct::LParen, "'('")?;
                        let operand = self.parse_assignment_expression()?;
                        self.expect_punct(Punct::RParen, "')'")?;
                        return Ok(self.arena.expr(Expr::BuiltinAddressof { operand }, loc));
                    }
                    "__builtin_constant_p" => {
                        self.advance();
                        self.expect_punct(Punct::LParen, "'('")?;
                        let operand = self.parse_assignment_expression()?;
                        self.expect_punct(Punct::RParen, "')'")?;
                        return Ok(self.arena.expr(Expr::BuiltinConstantP { operand }, loc));
                    }
                    "__builtin_va_start" => {
                        self.advance();
                        self.expect_punct(Punct::LParen, "'('")?;
                        let list = self.parse_assignment_expression()?;
                        self.expect_punct(Punct::Comma, "','")?;
                        let last_param = self.parse_assignment_expression()?;
                        self.expect_punct(Punct::RParen, "')'")?;
                        return Ok(self.arena.expr(Expr::VaStart { list, last_param }, loc));
                    }
                    "__builtin_va_arg" => {
                        self.advance();
                        self.expect_punct(Punct::LParen, "'('")?;
                        let list = self.parse_assignment_expression()?;
                        self.expect_punct(Punct::Comma, "','")?;
                        let ty = self.parse_type_spec()?;
                        self.expect_punct(Punct::RParen, "')'")?;
                        return Ok(self.arena.expr(Expr::VaArg { list, ty }, loc));
                    }
                    _ => {}
                }
                self.parse_id_expression()
            }
            TokenKind::Punct(Punct::ColonColon) => self.parse_id_expression(),
            TokenKind::Keyword(k) if self.looks_like_type_start() => {
                // Functional cast on a primitive: `int(x)`, `double(y)`.
                let _ = k;
                let ty = self.parse_type_spec()?;
                self.expect_punct(Punct::LParen, "'(' in functional cast")?;
                let expr = if self.check_punct(Punct::RParen) {
                    // Value-initialization `T()`: zero literal stands in.
                    self.arena.expr(
                        Expr::IntLit {
                            value: 0,
                            suffix: crate::lexer::IntSuffix::None,
                        },
                        loc,
                    )
                } else {
                    self.parse_expression()?
                };
                self.expect_punct(Punct::RParen, "')' in functional cast")?;
                Ok(self.arena.expr(
                    Expr::Cast {
                        kind: CastKind::Functional,
                        ty,
                        expr,
                    },
                    loc,
                ))
            }
            _ => Err(self.err_here(format!(
                "expected expression before '{}'",
                self.peek().text
            ))),
        }
    }

    fn fold_operator(&mut self) -> Option<BinaryOp> {
        let (op, _) = self.binary_op_here()?;
        self.advance();
        Some(op)
    }

    fn fold_operator_if_ellipsis_follows(&self) -> Option<BinaryOp> {
        let (op, _) = self.binary_op_here()?;
        if self.peek_n(1).is_punct(Punct::Ellipsis) {
            Some(op)
        } else {
            None
        }
    }

    fn parse_type_trait_call(&mut self, trait_: TypeTrait) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance();
        self.expect_punct(Punct::LParen, "'(' after type trait")?;
        let mut args = Vec::new();
        loop {
            let arg = if self.looks_like_type_start() {
                self.parse_type_spec()?
            } else {
                self.parse_assignment_expression()?
            };
            args.push(arg);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RParen, "')' after type trait arguments")?;
        Ok(self.arena.expr(Expr::TypeTraitCall { trait_, args }, loc))
    }

    /// Identifier, qualified-id, or functional cast on a named type.
    fn parse_id_expression(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let from_root = self.eat_punct(Punct::ColonColon);
        let first = self.expect_ident("identifier")?;

        // Unqualified name, maybe with template arguments.
        let mut path = Vec::new();
        let mut name = first;
        let mut template_args = Vec::new();

        loop {
            // `<` opens arguments when the name is a known template, or
            // unconditionally right after `::`.
            let take_args =
                self.check_punct(Punct::Lt) && (self.is_template_name(name) || !path.is_empty());
            if take_args {
                let saved = self.save();
                self.advance();
                match self.parse_template_argument_list() {
                    Ok(args) => template_args = args,
                    Err(_) if path.is_empty() => {
                        // Not an argument list after all: `tmpl < expr`.
                        self.restore(saved);
                    }
                    Err(e) => return Err(e),
                }
            }
            if self.check_punct(Punct::ColonColon) && self.peek_n(1).kind == TokenKind::Ident {
                self.advance();
                path.push(name);
                name = self.expect_ident("qualified name")?;
                template_args = Vec::new();
            } else {
                break;
            }
        }

        if path.is_empty() && !from_root {
            // Functional cast on a class/alias name: `T(x)` where T names a
            // type and a '(' follows.
            if template_args.is_empty() && self.is_type_name(name) && self.check_punct(Punct::LParen)
            {
                let spec = TypeSpec {
                    core: CoreType::Named {
                        path: Vec::new(),
                        name,
                        template_args: Vec::new(),
                        is_typename: false,
                    },
                    is_const: false,
                    is_volatile: false,
                    derived: Vec::new(),
                    is_pack: false,
                };
                let ty = self.arena.type_spec(spec, loc);
                self.advance(); // '('
                let mut args = Vec::new();
                if !self.check_punct(Punct::RParen) {
                    loop {
                        args.push(self.parse_assignment_expression()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RParen, "')'")?;
                if args.len() == 1 {
                    return Ok(self.arena.expr(
                        Expr::Cast {
                            kind: CastKind::Functional,
                            ty,
                            expr: args[0],
                        },
                        loc,
                    ));
                }
                // Multi-argument construction: a constructor call.
                let callee = self.arena.expr(Expr::Ident { name }, loc);
                return Ok(self.arena.expr(Expr::Call { callee, args }, loc));
            }
            if template_args.is_empty() {
                let e = self.arena.expr(Expr::Ident { name }, loc);
                return self.maybe_pack_expansion(e, loc);
            }
        }
        let e = self.arena.expr(
            Expr::QualifiedId {
                path,
                name,
                template_args,
                from_root,
            },
            loc,
        );
        self.maybe_pack_expansion(e, loc)
    }

    /// `expr...` becomes a pack expansion node.
    fn maybe_pack_expansion(
        &mut self,
        e: NodeId,
        loc: crate::diag::SourceLoc,
    ) -> Result<NodeId, Diagnostic> {
        if self.check_punct(Punct::Ellipsis) {
            // Only in contexts where an expansion can appear; the lowering
            // checks pack validity.
            self.advance();
            return Ok(self.arena.expr(Expr::PackExpansion { pattern: e }, loc));
        }
        Ok(e)
    }

    // ------------------------------------------------------------
    // Lambdas
    // ------------------------------------------------------------

    /// `[captures] <tparams> (params) specifiers -> ret { body }`
    fn parse_lambda(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.expect_punct(Punct::LBracket, "'['")?;
        let mut captures = Vec::new();
        if !self.check_punct(Punct::RBracket) {
            loop {
                captures.push(self.parse_capture()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RBracket, "']' after lambda captures")?;

        let mut template_params = Vec::new();
        if self.check_punct(Punct::Lt) {
            self.advance();
            template_params = self.parse_template_parameter_list()?;
        }

        let mut params = Vec::new();
        if self.check_punct(Punct::LParen) {
            self.advance();
            let (p, _variadic) = self.parse_parameter_list()?;
            params = p;
        }

        let is_mutable = self.eat_kw(Keyword::Mutable);
        if self.eat_kw(Keyword::Noexcept) {
            // `noexcept(expr)` on a lambda: parsed and folded later.
            if self.eat_punct(Punct::LParen) {
                let _ = self.parse_expression()?;
                self.expect_punct(Punct::RParen, "')'")?;
            }
        }

        let ret = if self.eat_punct(Punct::Arrow) {
            Some(self.parse_type_spec()?)
        } else {
            None
        };

        let body = self.parse_compound_statement()?;
        Ok(self.arena.expr(
            Expr::Lambda {
                captures,
                template_params,
                params,
                ret,
                body,
                is_mutable,
            },
            loc,
        ))
    }

    fn parse_capture(&mut self) -> Result<Capture, Diagnostic> {
        if self.check_punct(Punct::Assign) {
            self.advance();
            return Ok(Capture {
                name: None,
                kind: CaptureKind::DefaultValue,
            });
        }
        if self.check_punct(Punct::Amp) && !self.peek_n(1).is_ident_like() {
            self.advance();
            return Ok(Capture {
                name: None,
                kind: CaptureKind::DefaultRef,
            });
        }
        if self.check_kw(Keyword::This) {
            self.advance();
            return Ok(Capture {
                name: None,
                kind: CaptureKind::This,
            });
        }
        if self.check_punct(Punct::Star) && self.peek_n(1).is_keyword(Keyword::This) {
            self.advance();
            self.advance();
            return Ok(Capture {
                name: None,
                kind: CaptureKind::StarThis,
            });
        }
        let by_ref = self.eat_punct(Punct::Amp);
        let name = self.expect_ident("capture name")?;
        if self.eat_punct(Punct::Assign) {
            let init = self.parse_assignment_expression()?;
            return Ok(Capture {
                name: Some(name),
                kind: CaptureKind::Init { init, by_ref },
            });
        }
        Ok(Capture {
            name: Some(name),
            kind: if by_ref {
                CaptureKind::ByRef
            } else {
                CaptureKind::ByValue
            },
        })
    }

    // ------------------------------------------------------------
    // requires-expressions
    // ------------------------------------------------------------

    /// `requires (params) { requirements }` and the nested
    /// `requires requires { ... }` form.
    pub(crate) fn parse_requires_expression(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'requires'
        let mut params = Vec::new();
        if self.check_punct(Punct::LParen) {
            self.advance();
            let (p, _) = self.parse_parameter_list()?;
            params = p;
        }
        self.expect_punct(Punct::LBrace, "'{' in requires expression")?;
        let mut requirements = Vec::new();
        while !self.check_punct(Punct::RBrace) && !self.at_eof() {
            requirements.push(self.parse_requirement()?);
        }
        self.expect_punct(Punct::RBrace, "'}' after requirements")?;
        Ok(self.arena.expr(
            Expr::Requires {
                params,
                requirements,
            },
            loc,
        ))
    }

    fn parse_requirement(&mut self) -> Result<Requirement, Diagnostic> {
        // Nested: `requires constraint-expr;`
        if self.check_kw(Keyword::Requires) {
            // `requires requires { ... }` is itself an expression.
            let e = if self.peek_n(1).is_punct(Punct::LBrace) || self.peek_n(1).is_punct(Punct::LParen)
            {
                self.parse_requires_expression()?
            } else {
                self.advance();
                self.parse_assignment_expression()?
            };
            self.expect_punct(Punct::Semi, "';' after nested requirement")?;
            return Ok(Requirement::Nested(e));
        }
        // Type requirement: `typename T::type;`
        if self.check_kw(Keyword::Typename) {
            let t = self.parse_type_spec()?;
            self.expect_punct(Punct::Semi, "';' after type requirement")?;
            return Ok(Requirement::Type(t));
        }
        // Compound: `{ expr } noexcept -> constraint;`
        if self.check_punct(Punct::LBrace) {
            self.advance();
            let expr = self.parse_expression()?;
            self.expect_punct(Punct::RBrace, "'}' in compound requirement")?;
            let noexcept = self.eat_kw(Keyword::Noexcept);
            let return_constraint = if self.eat_punct(Punct::Arrow) {
                Some(self.parse_type_spec()?)
            } else {
                None
            };
            self.expect_punct(Punct::Semi, "';' after compound requirement")?;
            return Ok(Requirement::Compound {
                expr,
                return_constraint,
                noexcept,
            });
        }
        // Simple requirement.
        let e = self.parse_expression()?;
        self.expect_punct(Punct::Semi, "';' after requirement")?;
        Ok(Requirement::Simple(e))
    }

    /// Expose statement parsing for lambda bodies (defined in stmt.rs).
    pub(crate) fn parse_compound_statement(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.expect_punct(Punct::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check_punct(Punct::RBrace) && !self.at_eof() {
            match self.parse_statement() {
                Ok(s) => stmts.push(s),
                Err(d) => {
                    self.diags.push(d);
                    self.sync_to_statement_boundary();
                }
            }
        }
        self.expect_punct(Punct::RBrace, "'}'")?;
        Ok(self.arena.stmt(Stmt::Compound { stmts }, loc))
    }
}

fn type_trait_from_name(name: &str) -> Option<TypeTrait> {
    use TypeTrait::*;
    let t = match name {
        "__is_void" => IsVoid,
        "__is_integral" => IsIntegral,
        "__is_floating_point" => IsFloatingPoint,
        "__is_pointer" => IsPointer,
        "__is_lvalue_reference" => IsLvalueReference,
        "__is_rvalue_reference" => IsRvalueReference,
        "__is_class" => IsClass,
        "__is_enum" => IsEnum,
        "__is_same" => IsSame,
        "__is_base_of" => IsBaseOf,
        "__is_const" => IsConst,
        "__is_volatile" => IsVolatile,
        "__is_trivial" => IsTrivial,
        "__is_aggregate" => IsAggregate,
        "__has_trivial_destructor" => HasTrivialDestructor,
        "__is_constructible" => IsConstructible,
        "__is_complete_or_unbounded" => IsCompleteOrUnbounded,
        "__is_swappable" => IsSwappable,
        "__is_nothrow_swappable" => IsNothrowSwappable,
        "__has_unique_object_repr" => HasUniqueObjectRepr,
        _ => return None,
    };
    Some(t)
}

impl crate::lexer::Token {
    /// Identifier-ish for capture-default disambiguation (`[&]` vs `[&x]`).
    fn is_ident_like(&self) -> bool {
        self.kind == TokenKind::Ident
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_tu;
    use crate::ast::{CastKind, Decl, Expr, Stmt};

    fn first_fn_body_exprs(src: &str) -> (crate::ast::Arena, Vec<crate::ast::NodeId>) {
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
            .expect("a function with a body");
        let Some(Stmt::Compound { stmts }) = out.arena.as_stmt(f) else {
            panic!()
        };
        let stmts = stmts.clone();
        (out.arena, stmts)
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let (arena, stmts) = first_fn_body_exprs("int f() { return 1 + 2 * 3; }");
        let Some(Stmt::Return { value: Some(v) }) = arena.as_stmt(stmts[0]) else {
            panic!()
        };
        let Some(Expr::Binary { op, rhs, .. }) = arena.as_expr(*v) else {
            panic!()
        };
        assert_eq!(*op, crate::ast::BinaryOp::Add);
        assert!(matches!(
            arena.as_expr(*rhs),
            Some(Expr::Binary {
                op: crate::ast::BinaryOp::Mul,
                ..
            })
        ));
    }

    #[test]
    fn test_static_cast() {
        let (arena, stmts) = first_fn_body_exprs("int f(double d) { return static_cast<int>(d); }");
        let Some(Stmt::Return { value: Some(v) }) = arena.as_stmt(stmts[0]) else {
            panic!()
        };
        assert!(matches!(
            arena.as_expr(*v),
            Some(Expr::Cast {
                kind: CastKind::Static,
                ..
            })
        ));
    }

    #[test]
    fn test_c_style_cast() {
        let (arena, stmts) = first_fn_body_exprs("int f(char a, char b) { return (int)(a + b); }");
        let Some(Stmt::Return { value: Some(v) }) = arena.as_stmt(stmts[0]) else {
            panic!()
        };
        assert!(matches!(
            arena.as_expr(*v),
            Some(Expr::Cast {
                kind: CastKind::CStyle,
                ..
            })
        ));
    }

    #[test]
    fn test_lambda_with_captures() {
        let (arena, stmts) = first_fn_body_exprs(
            "int f() { int x = 3; auto lam = [x](int y) -> int { return x + y; }; return lam(2); }",
        );
        let Some(Stmt::Decl { decl }) = arena.as_stmt(stmts[1]) else {
            panic!()
        };
        let Some(Decl::Variable { init: Some(init), .. }) = arena.as_decl(*decl) else {
            panic!()
        };
        assert!(matches!(arena.as_expr(*init), Some(Expr::Lambda { .. })));
    }

    #[test]
    fn test_init_capture_and_star_this_parse() {
        let (out, _) = parse_tu(
            "struct S { int v; int m() { auto a = [*this]() { return v; }; auto b = [y = v + 1]() { return y; }; return a() + b(); } };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_new_delete() {
        let (arena, stmts) =
            first_fn_body_exprs("int f() { int* p = new int(42); int r = *p; delete p; return r; }");
        let Some(Stmt::Decl { decl }) = arena.as_stmt(stmts[0]) else {
            panic!()
        };
        let Some(Decl::Variable { init: Some(init), .. }) = arena.as_decl(*decl) else {
            panic!()
        };
        assert!(matches!(arena.as_expr(*init), Some(Expr::New { .. })));
    }

    #[test]
    fn test_type_trait_intrinsic() {
        let (arena, stmts) = first_fn_body_exprs("int f() { return __is_integral(int) ? 1 : 0; }");
        let Some(Stmt::Return { value: Some(v) }) = arena.as_stmt(stmts[0]) else {
            panic!()
        };
        let Some(Expr::Ternary { cond, .. }) = arena.as_expr(*v) else {
            panic!()
        };
        assert!(matches!(
            arena.as_expr(*cond),
            Some(Expr::TypeTraitCall { .. })
        ));
    }

    #[test]
    fn test_fold_expressions_parse() {
        let (out, _) = parse_tu(
            "template<typename... Ts> int sum(Ts... args) { return (args + ...); }\n\
             template<typename... Ts> int sum0(Ts... args) { return (0 + ... + args); }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_sizeof_pack() {
        let (out, _) = parse_tu("template<typename... Ts> int count() { return sizeof...(Ts); }");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_requires_requires() {
        let (out, _) = parse_tu(
            "template<typename T> int probe(T t) requires requires { t + t; } { return 1; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_spaceship_in_expression() {
        let (out, _) = parse_tu("int f(int a, int b) { return (a <=> b) < 0; }");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }
}
