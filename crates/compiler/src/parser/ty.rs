//! Type-specifier and declarator parsing
//!
//! A parsed type is a [`TypeSpec`]: a core (primitive combination, named
//! type, `auto`, `decltype`) plus a derived chain applied innermost-first
//! (`int* a[3]` is Array(Pointer(int))). cv-qualifiers may appear on
//! either side of the core and land on the spec itself.

use super::Parser;
use crate::ast::{CoreType, Decl, DerivedType, NodeId, TypeSpec};
use crate::diag::Diagnostic;
use crate::lexer::{Keyword, Punct, TokenKind};
use crate::strings::StrId;
use crate::types::Primitive;

/// A declarator: the declared name (if any) and the completed type.
pub(crate) struct Declarator {
    pub name: Option<StrId>,
    /// Qualified path before the name for out-of-line definitions
    /// (`Class<Args>::method`), empty otherwise.
    pub class_path: Vec<StrId>,
    pub spec: TypeSpec,
    /// Parameter nodes when the declarator is a function.
    pub params: Option<Vec<NodeId>>,
    pub is_variadic: bool,
}

impl<'a> Parser<'a> {
    /// Could the current token begin a type? Used by the tentative-parse
    /// disambiguation and by template argument classification.
    pub(crate) fn looks_like_type_start(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::Void
                    | Keyword::Bool
                    | Keyword::Char
                    | Keyword::Char8T
                    | Keyword::Char16T
                    | Keyword::Char32T
                    | Keyword::WcharT
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Auto
                    | Keyword::Const
                    | Keyword::Volatile
                    | Keyword::Decltype
                    | Keyword::Typename
                    | Keyword::Struct
                    | Keyword::Class
                    | Keyword::Enum
            ),
            TokenKind::Punct(Punct::ColonColon) => true,
            TokenKind::Ident => {
                let Some(id) = self.strings.lookup(&self.peek().text) else {
                    return false;
                };
                self.is_type_name(id)
            }
            _ => false,
        }
    }

    /// Parse a complete type usable where no declarator name follows
    /// (template arguments, casts, `sizeof(T)`, trailing return types):
    /// core + cv + pointer/reference suffixes + optional `...`.
    pub(crate) fn parse_type_spec(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let mut spec = self.parse_core_and_quals()?;
        self.parse_pointer_suffixes(&mut spec)?;
        if self.check_punct(Punct::Ellipsis) {
            self.advance();
            spec.is_pack = true;
        }
        Ok(self.arena.type_spec(spec, loc))
    }

    /// Tentatively parse a type; restores the cursor on failure.
    pub(crate) fn try_parse_type_spec(&mut self) -> Option<NodeId> {
        if !self.looks_like_type_start() {
            return None;
        }
        let saved = self.save();
        match self.parse_type_spec() {
            Ok(n) => Some(n),
            Err(_) => {
                self.restore(saved);
                None
            }
        }
    }

    /// Core type with leading/trailing cv-qualifiers.
    pub(crate) fn parse_core_and_quals(&mut self) -> Result<TypeSpec, Diagnostic> {
        let mut is_const = false;
        let mut is_volatile = false;
        loop {
            if self.eat_kw(Keyword::Const) {
                is_const = true;
            } else if self.eat_kw(Keyword::Volatile) {
                is_volatile = true;
            } else {
                break;
            }
        }
        let core = self.parse_core_type()?;
        loop {
            if self.eat_kw(Keyword::Const) {
                is_const = true;
            } else if self.eat_kw(Keyword::Volatile) {
                is_volatile = true;
            } else {
                break;
            }
        }
        Ok(TypeSpec {
            core,
            is_const,
            is_volatile,
            derived: Vec::new(),
            is_pack: false,
        })
    }

    fn parse_core_type(&mut self) -> Result<CoreType, Diagnostic> {
        // Elaborated specifier: `struct X` / `class X` / `enum X` as a type.
        if self.check_kw(Keyword::Struct) || self.check_kw(Keyword::Class) || self.check_kw(Keyword::Enum)
        {
            // Only when followed by a name that is NOT starting a definition.
            if self.peek_n(1).kind == TokenKind::Ident
                && !self.peek_n(2).is_punct(Punct::LBrace)
                && !self.peek_n(2).is_punct(Punct::Colon)
            {
                self.advance();
                return self.parse_named_core(false);
            }
        }
        if self.eat_kw(Keyword::Auto) {
            return Ok(CoreType::Auto);
        }
        if self.eat_kw(Keyword::Decltype) {
            self.expect_punct(Punct::LParen, "'(' after 'decltype'")?;
            let e = self.parse_expression()?;
            self.expect_punct(Punct::RParen, "')' after decltype expression")?;
            return Ok(CoreType::Decltype(e));
        }
        if self.eat_kw(Keyword::Typename) {
            return self.parse_named_core(true);
        }
        if let Some(p) = self.try_parse_primitive_combination()? {
            return Ok(CoreType::Primitive(p));
        }
        self.parse_named_core(false)
    }

    /// Multi-word primitive combinations: `unsigned long long int`,
    /// `signed char`, `long double`, ...
    fn try_parse_primitive_combination(&mut self) -> Result<Option<Primitive>, Diagnostic> {
        let mut signed = None::<bool>;
        let mut longs = 0u8;
        let mut short = false;
        let mut base: Option<Primitive> = None;
        let mut any = false;
        loop {
            let k = match &self.peek().kind {
                TokenKind::Keyword(k) => *k,
                _ => break,
            };
            match k {
                Keyword::Signed => {
                    signed = Some(true);
                }
                Keyword::Unsigned => {
                    signed = Some(false);
                }
                Keyword::Long => {
                    longs += 1;
                }
                Keyword::Short => {
                    short = true;
                }
                Keyword::Void => base = Some(Primitive::Void),
                Keyword::Bool => base = Some(Primitive::Bool),
                Keyword::Char => base = Some(Primitive::Char),
                Keyword::Char8T => base = Some(Primitive::Char8),
                Keyword::Char16T => base = Some(Primitive::Char16),
                Keyword::Char32T => base = Some(Primitive::Char32),
                Keyword::WcharT => base = Some(Primitive::WChar),
                Keyword::Int => base = Some(Primitive::Int),
                Keyword::Float => base = Some(Primitive::Float),
                Keyword::Double => base = Some(Primitive::Double),
                _ => break,
            }
            any = true;
            self.advance();
        }
        if !any {
            return Ok(None);
        }
        let p = match (base, signed, longs, short) {
            (Some(Primitive::Void), _, 0, false) => Primitive::Void,
            (Some(Primitive::Bool), _, 0, false) => Primitive::Bool,
            (Some(Primitive::Char), None, 0, false) => Primitive::Char,
            (Some(Primitive::Char), Some(true), 0, false) => Primitive::SChar,
            (Some(Primitive::Char), Some(false), 0, false) => Primitive::UChar,
            (Some(Primitive::Char8), _, 0, false) => Primitive::Char8,
            (Some(Primitive::Char16), _, 0, false) => Primitive::Char16,
            (Some(Primitive::Char32), _, 0, false) => Primitive::Char32,
            (Some(Primitive::WChar), _, 0, false) => Primitive::WChar,
            (Some(Primitive::Float), None, 0, false) => Primitive::Float,
            (Some(Primitive::Double), None, 0, false) => Primitive::Double,
            (Some(Primitive::Double), None, 1, false) => Primitive::LongDouble,
            (Some(Primitive::Int) | None, s, 0, true) => {
                if s == Some(false) {
                    Primitive::UShort
                } else {
                    Primitive::Short
                }
            }
            (Some(Primitive::Int) | None, s, 0, false) => {
                if s == Some(false) {
                    Primitive::UInt
                } else {
                    Primitive::Int
                }
            }
            (Some(Primitive::Int) | None, s, 1, false) => {
                if s == Some(false) {
                    Primitive::ULong
                } else {
                    Primitive::Long
                }
            }
            (Some(Primitive::Int) | None, s, 2, false) => {
                if s == Some(false) {
                    Primitive::ULongLong
                } else {
                    Primitive::LongLong
                }
            }
            _ => {
                return Err(self.err_here("invalid combination of type specifiers"));
            }
        };
        Ok(Some(p))
    }

    /// A (possibly qualified) named type, with template arguments on the
    /// final component.
    fn parse_named_core(&mut self, is_typename: bool) -> Result<CoreType, Diagnostic> {
        let mut path = Vec::new();
        if self.check_punct(Punct::ColonColon) {
            self.advance();
        }
        let mut name = self.expect_ident("type name")?;
        let mut template_args = Vec::new();
        loop {
            // Template arguments on this component?
            // After '::' a '<' always opens an argument list; otherwise only
            // for names known to be templates.
            let qualified_next = self.check_punct(Punct::Lt)
                && (self.is_template_name(name) || is_typename || !path.is_empty());
            if qualified_next {
                self.advance(); // '<'
                template_args = self.parse_template_argument_list()?;
            }
            if self.check_punct(Punct::ColonColon)
                && self.peek_n(1).kind == TokenKind::Ident
                // Do not swallow `Class::method` in out-of-line definitions;
                // the declarator parser handles that. Only descend when the
                // next-next token keeps us inside a type name.
                && !self.peek_n(2).is_punct(Punct::LParen)
            {
                self.advance(); // '::'
                // A nested-name component with args becomes part of the path;
                // only the final component keeps its argument list.
                if !template_args.is_empty() {
                    // Encode the instantiated component into the path; the
                    // semantic pass resolves it through the registry.
                    path.push(name);
                    template_args = Vec::new();
                } else {
                    path.push(name);
                }
                name = self.expect_ident("nested type name")?;
            } else {
                break;
            }
        }
        Ok(CoreType::Named {
            path,
            name,
            template_args,
            is_typename,
        })
    }

    /// `*` (with cv), `&`, `&&` suffixes.
    pub(crate) fn parse_pointer_suffixes(&mut self, spec: &mut TypeSpec) -> Result<(), Diagnostic> {
        loop {
            if self.check_punct(Punct::Star) {
                self.advance();
                let mut is_const = false;
                let mut is_volatile = false;
                loop {
                    if self.eat_kw(Keyword::Const) {
                        is_const = true;
                    } else if self.eat_kw(Keyword::Volatile) {
                        is_volatile = true;
                    } else {
                        break;
                    }
                }
                spec.derived.push(DerivedType::Pointer {
                    is_const,
                    is_volatile,
                });
            } else if self.check_punct(Punct::Amp) {
                self.advance();
                spec.derived.push(DerivedType::LValueRef);
            } else if self.check_punct(Punct::AmpAmp) {
                self.advance();
                spec.derived.push(DerivedType::RValueRef);
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Parse a declarator after the decl-specifier-seq: pointers, the
    /// declared name (possibly `Class<Args>::name` for out-of-line member
    /// definitions), then array and function suffixes.
    pub(crate) fn parse_declarator(&mut self, mut spec: TypeSpec) -> Result<Declarator, Diagnostic> {
        self.parse_pointer_suffixes(&mut spec)?;

        // `T...name` for pack parameters.
        if self.check_punct(Punct::Ellipsis) {
            self.advance();
            spec.is_pack = true;
        }

        // Pointer-to-function declarator: `T (*name)(params)`.
        if self.check_punct(Punct::LParen)
            && self.peek_n(1).is_punct(Punct::Star)
            && self.peek_n(2).kind == TokenKind::Ident
            && self.peek_n(3).is_punct(Punct::RParen)
        {
            self.advance(); // (
            self.advance(); // *
            let name = self.expect_ident("declarator name")?;
            self.advance(); // )
            self.expect_punct(Punct::LParen, "'(' in function-pointer declarator")?;
            let (params, variadic) = self.parse_parameter_list()?;
            spec.derived.push(DerivedType::Function {
                params: params.clone(),
                variadic,
            });
            spec.derived.push(DerivedType::Pointer {
                is_const: false,
                is_volatile: false,
            });
            return Ok(Declarator {
                name: Some(name),
                class_path: Vec::new(),
                spec,
                params: None,
                is_variadic: false,
            });
        }

        // Qualified declarator name for out-of-line member definitions.
        let mut class_path = Vec::new();
        let mut name = None;
        while self.peek().kind == TokenKind::Ident {
            let text = self.peek().text.clone();
            let id = self.intern(&text);
            // `Class<Args>::` qualification.
            if self.peek_n(1).is_punct(Punct::Lt) && self.is_template_name(id) {
                let saved = self.save();
                self.advance(); // name
                self.advance(); // '<'
                if self.parse_template_argument_list().is_ok() && self.check_punct(Punct::ColonColon)
                {
                    self.advance();
                    class_path.push(id);
                    continue;
                }
                self.restore(saved);
            }
            if self.peek_n(1).is_punct(Punct::ColonColon) {
                self.advance();
                self.advance();
                class_path.push(id);
                continue;
            }
            self.advance();
            name = Some(id);
            break;
        }

        // Parenthesized declarator: `T (a);` declares `a` when `a` does not
        // name a type (the classic statement ambiguity, resolved toward a
        // declaration when the declarator parses with a balanced trailer).
        if name.is_none()
            && self.check_punct(Punct::LParen)
            && self.peek_n(1).kind == TokenKind::Ident
            && self.peek_n(2).is_punct(Punct::RParen)
        {
            let inner = self.peek_n(1).text.clone();
            let id = self.intern(&inner);
            if !self.is_type_name(id) {
                self.advance();
                self.advance();
                self.advance();
                name = Some(id);
            }
        }

        // Array suffixes.
        while self.check_punct(Punct::LBracket) {
            self.advance();
            let len = if self.check_punct(Punct::RBracket) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.expect_punct(Punct::RBracket, "']' after array bound")?;
            spec.derived.push(DerivedType::Array { len });
        }

        // Function suffix, only when the parenthesis really opens a
        // parameter list; `C c(3)` keeps its direct-initializer.
        let mut fn_params = None;
        let mut is_variadic = false;
        if self.check_punct(Punct::LParen) && !spec.derived.iter().any(|d| matches!(d, DerivedType::Array { .. })) {
            let saved = self.save();
            self.advance();
            let opens_params = self.check_punct(Punct::RParen)
                || self.check_punct(Punct::Ellipsis)
                || self.looks_like_type_start();
            if opens_params {
                let (params, variadic) = self.parse_parameter_list()?;
                fn_params = Some(params);
                is_variadic = variadic;
            } else {
                self.restore(saved);
            }
        }

        Ok(Declarator {
            name,
            class_path,
            spec,
            params: fn_params,
            is_variadic,
        })
    }

    /// Parse `(params)` after the opening paren has been consumed.
    pub(crate) fn parse_parameter_list(&mut self) -> Result<(Vec<NodeId>, bool), Diagnostic> {
        let mut params = Vec::new();
        let mut variadic = false;
        if self.eat_punct(Punct::RParen) {
            return Ok((params, variadic));
        }
        loop {
            if self.check_punct(Punct::Ellipsis) {
                self.advance();
                variadic = true;
                break;
            }
            let loc = self.loc();
            let spec = self.parse_core_and_quals()?;
            let d = self.parse_declarator(spec)?;
            let default = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assignment_expression()?)
            } else {
                None
            };
            let is_pack = d.spec.is_pack;
            let ty = self.arena.type_spec(d.spec, loc);
            let param = self.arena.decl(
                Decl::Param {
                    name: d.name,
                    ty,
                    default,
                    is_pack,
                },
                loc,
            );
            params.push(param);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RParen, "')' after parameter list")?;
        Ok((params, variadic))
    }

    /// Parse template arguments after `<` has been consumed; closes with
    /// [`Parser::expect_template_close`], splitting `>>` as needed.
    pub(crate) fn parse_template_argument_list(&mut self) -> Result<Vec<NodeId>, Diagnostic> {
        self.gt_stack.push(false);
        let result = self.parse_template_argument_list_inner();
        self.gt_stack.pop();
        result
    }

    fn parse_template_argument_list_inner(&mut self) -> Result<Vec<NodeId>, Diagnostic> {
        let mut args = Vec::new();
        if self.check_punct(Punct::Gt) || self.check_punct(Punct::Shr) {
            self.expect_template_close()?;
            return Ok(args);
        }
        loop {
            // A type argument when it looks like one; otherwise a constant
            // expression (non-type argument).
            let arg = if self.looks_like_type_start() {
                match self.try_parse_type_arg() {
                    Some(n) => n,
                    None => self.parse_assignment_expression()?,
                }
            } else {
                self.parse_assignment_expression()?
            };
            args.push(arg);
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_template_close()?;
            break;
        }
        Ok(args)
    }

    /// Type template argument: a full type-spec that must be followed by a
    /// list delimiter to count as a type (otherwise it was an expression
    /// prefix and we backtrack).
    fn try_parse_type_arg(&mut self) -> Option<NodeId> {
        let saved = self.save();
        match self.parse_type_spec() {
            Ok(n) => {
                if self.check_punct(Punct::Comma)
                    || self.check_punct(Punct::Gt)
                    || self.check_punct(Punct::Shr)
                    || self.check_punct(Punct::GtEq)
                    || self.check_punct(Punct::ShrAssign)
                    || self.check_punct(Punct::Ellipsis)
                {
                    Some(n)
                } else {
                    self.restore(saved);
                    None
                }
            }
            Err(_) => {
                self.restore(saved);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_tu;
    use crate::ast::{CoreType, Decl, DerivedType};
    use crate::types::Primitive;

    #[test]
    fn test_primitive_combinations() {
        let (out, _) = parse_tu(
            "unsigned long long a;\nsigned char b;\nlong double c;\nshort d;\nunsigned e;",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let prims: Vec<Primitive> = decls
            .iter()
            .map(|&d| {
                let Some(Decl::Variable { ty, .. }) = out.arena.as_decl(d) else {
                    panic!()
                };
                let spec = out.arena.as_type_spec(*ty).unwrap();
                match spec.core {
                    CoreType::Primitive(p) => p,
                    _ => panic!("not primitive"),
                }
            })
            .collect();
        assert_eq!(
            prims,
            vec![
                Primitive::ULongLong,
                Primitive::SChar,
                Primitive::LongDouble,
                Primitive::Short,
                Primitive::UInt
            ]
        );
    }

    #[test]
    fn test_pointer_and_array_declarators() {
        let (out, _) = parse_tu("int* p; int arr[10]; const char* const q;");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Variable { ty, .. }) = out.arena.as_decl(decls[1]) else {
            panic!()
        };
        let spec = out.arena.as_type_spec(*ty).unwrap();
        assert!(matches!(spec.derived[0], DerivedType::Array { .. }));
    }

    #[test]
    fn test_reference_declarators() {
        let (out, _) = parse_tu("int f(int& a, int&& b);");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_function_pointer_declarator() {
        let (out, _) = parse_tu("int (*handler)(int);");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }
}
