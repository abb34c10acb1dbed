//! Declaration parsing
//!
//! Namespaces, using-declarations and aliases, enums, classes with their
//! member grammar, functions with the full trailing-specifier zoo, template
//! declarations of every flavor (primary, partial, full specialization,
//! alias, variable, concept) and out-of-line template member definitions.
//!
//! Template declarations are registered with the template registry as they
//! parse; the stored bodies are arena subtrees re-instantiated later
//! against substitution maps.

use super::Parser;
use crate::ast::{
    Access, BaseSpec, ClassKey, CoreType, Decl, DerivedType, FuncSpecs, NodeId, Storage,
    TemplateParam, TemplateParamKind,
};
use crate::diag::Diagnostic;
use crate::lexer::{Keyword, Punct, TokenKind};
use crate::strings::StrId;
use crate::types::RefKind;

impl<'a> Parser<'a> {
    /// One top-level (or namespace-scope) declaration. `Ok(None)` means a
    /// harmless non-declaration (stray `;`, access specifier consumed).
    pub(crate) fn parse_declaration(&mut self) -> Result<Option<NodeId>, Diagnostic> {
        let loc = self.loc();
        match self.peek().kind.clone() {
            TokenKind::Punct(Punct::Semi) => {
                self.advance();
                Ok(None)
            }
            TokenKind::Keyword(Keyword::Namespace) => self.parse_namespace().map(Some),
            TokenKind::Keyword(Keyword::Using) => self.parse_using().map(Some),
            TokenKind::Keyword(Keyword::Typedef) => self.parse_typedef().map(Some),
            TokenKind::Keyword(Keyword::StaticAssert) => self.parse_static_assert().map(Some),
            TokenKind::Keyword(Keyword::Template) => self.parse_template_declaration().map(Some),
            TokenKind::Keyword(Keyword::Concept) => {
                Err(self.err_here("'concept' requires a template parameter list"))
            }
            TokenKind::Keyword(Keyword::Enum) => self.parse_enum().map(Some),
            TokenKind::Keyword(Keyword::Class)
            | TokenKind::Keyword(Keyword::Struct)
            | TokenKind::Keyword(Keyword::Union) => {
                // Could be a definition or an elaborated declaration of a
                // variable (`struct S s;`); the class parser handles both.
                self.parse_class_or_elaborated().map(Some)
            }
            TokenKind::Keyword(Keyword::Extern) => {
                // `extern "C"` blocks and extern declarations.
                if matches!(self.peek_n(1).kind, TokenKind::Str { .. }) {
                    self.advance();
                    self.advance();
                    if self.check_punct(Punct::LBrace) {
                        self.advance();
                        let mut decls = Vec::new();
                        while !self.check_punct(Punct::RBrace) && !self.at_eof() {
                            if let Some(d) = self.parse_declaration()? {
                                decls.push(d);
                            }
                        }
                        self.expect_punct(Punct::RBrace, "'}' after extern block")?;
                        let ns = self.arena.decl(Decl::Namespace { name: None, decls }, loc);
                        return Ok(Some(ns));
                    }
                    return self.parse_function_or_variable(Storage::Extern).map(Some);
                }
                self.advance();
                self.parse_function_or_variable(Storage::Extern).map(Some)
            }
            _ => self.parse_function_or_variable(Storage::None).map(Some),
        }
    }

    fn parse_namespace(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'namespace'
        let name = if self.peek().kind == TokenKind::Ident {
            Some(self.expect_ident("namespace name")?)
        } else {
            None
        };
        self.expect_punct(Punct::LBrace, "'{' after namespace name")?;
        let mut decls = Vec::new();
        while !self.check_punct(Punct::RBrace) && !self.at_eof() {
            match self.parse_declaration() {
                Ok(Some(d)) => decls.push(d),
                Ok(None) => {}
                Err(diag) => {
                    self.diags.push(diag);
                    self.sync_to_declaration_boundary();
                }
            }
        }
        self.expect_punct(Punct::RBrace, "'}' closing namespace")?;
        Ok(self.arena.decl(Decl::Namespace { name, decls }, loc))
    }

    fn parse_using(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'using'
        if self.eat_kw(Keyword::Namespace) {
            let mut path = vec![self.expect_ident("namespace name")?];
            while self.eat_punct(Punct::ColonColon) {
                path.push(self.expect_ident("namespace name")?);
            }
            self.expect_punct(Punct::Semi, "';' after using-directive")?;
            return Ok(self.arena.decl(Decl::UsingDirective { path }, loc));
        }
        let first = self.expect_ident("name after 'using'")?;
        if self.eat_punct(Punct::Assign) {
            // Alias: `using Name = Type;`
            let target = self.parse_type_spec()?;
            self.expect_punct(Punct::Semi, "';' after type alias")?;
            self.known_types.insert(first);
            return Ok(self.arena.decl(
                Decl::Alias {
                    name: first,
                    target,
                },
                loc,
            ));
        }
        let mut path = vec![first];
        while self.eat_punct(Punct::ColonColon) {
            path.push(self.expect_ident("qualified name")?);
        }
        let name = path.pop().expect("at least one component");
        self.expect_punct(Punct::Semi, "';' after using-declaration")?;
        Ok(self.arena.decl(Decl::Using { path, name }, loc))
    }

    fn parse_typedef(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'typedef'
        let spec = self.parse_core_and_quals()?;
        let d = self.parse_declarator(spec)?;
        let name = d
            .name
            .ok_or_else(|| self.err_here("expected name in typedef"))?;
        self.expect_punct(Punct::Semi, "';' after typedef")?;
        let target = self.arena.type_spec(d.spec, loc);
        self.known_types.insert(name);
        Ok(self.arena.decl(Decl::Typedef { name, target }, loc))
    }

    pub(crate) fn parse_static_assert(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'static_assert'
        self.expect_punct(Punct::LParen, "'(' after 'static_assert'")?;
        let cond = self.parse_assignment_expression()?;
        let message = if self.eat_punct(Punct::Comma) {
            match &self.peek().kind {
                TokenKind::Str { value, .. } => {
                    let m = value.clone();
                    self.advance();
                    Some(m)
                }
                _ => return Err(self.err_here("expected string literal in static_assert")),
            }
        } else {
            None
        };
        self.expect_punct(Punct::RParen, "')' after static_assert")?;
        self.expect_punct(Punct::Semi, "';' after static_assert")?;
        Ok(self.arena.decl(Decl::StaticAssert { cond, message }, loc))
    }

    fn parse_enum(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'enum'
        let scoped = self.eat_kw(Keyword::Class) || self.eat_kw(Keyword::Struct);
        let name = self.expect_ident("enum name")?;
        let underlying = if self.eat_punct(Punct::Colon) {
            Some(self.parse_type_spec()?)
        } else {
            None
        };
        let mut enumerators = Vec::new();
        if self.check_punct(Punct::LBrace) {
            self.advance();
            while !self.check_punct(Punct::RBrace) {
                let ename = self.expect_ident("enumerator name")?;
                let value = if self.eat_punct(Punct::Assign) {
                    Some(self.parse_assignment_expression()?)
                } else {
                    None
                };
                enumerators.push((ename, value));
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            self.expect_punct(Punct::RBrace, "'}' closing enum")?;
        }
        self.expect_punct(Punct::Semi, "';' after enum")?;
        self.known_types.insert(name);
        Ok(self.arena.decl(
            Decl::Enum {
                name,
                scoped,
                underlying,
                enumerators,
            },
            loc,
        ))
    }

    // ------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------

    /// `class`/`struct`/`union` at declaration position: a definition, a
    /// forward declaration, or an elaborated variable declaration.
    fn parse_class_or_elaborated(&mut self) -> Result<NodeId, Diagnostic> {
        // Definition or forward declaration when `{`, `:` or `;` follows the
        // name (with optional specialization args). Otherwise elaborated.
        let name_tok = self.peek_n(1).clone();
        if name_tok.kind == TokenKind::Ident {
            let after = &self.peek_n(2).kind;
            if matches!(
                after,
                TokenKind::Punct(Punct::LBrace)
                    | TokenKind::Punct(Punct::Colon)
                    | TokenKind::Punct(Punct::Semi)
                    | TokenKind::Punct(Punct::Lt)
            ) {
                let (node, _, _) = self.parse_class_definition()?;
                return Ok(node);
            }
        }
        self.parse_function_or_variable(Storage::None)
    }

    /// Full class parse. Returns the node, the class name, and any
    /// specialization arguments found on the class head (`S<T*>`).
    pub(crate) fn parse_class_definition(
        &mut self,
    ) -> Result<(NodeId, StrId, Vec<NodeId>), Diagnostic> {
        let loc = self.loc();
        let key = match self.peek().kind {
            TokenKind::Keyword(Keyword::Class) => ClassKey::Class,
            TokenKind::Keyword(Keyword::Struct) => ClassKey::Struct,
            TokenKind::Keyword(Keyword::Union) => ClassKey::Union,
            _ => return Err(self.err_here("expected 'class', 'struct' or 'union'")),
        };
        self.advance();
        let name = self.expect_ident("class name")?;
        self.known_types.insert(name);

        // Specialization arguments on the head: `struct S<T*>`.
        let mut spec_args = Vec::new();
        if self.check_punct(Punct::Lt) {
            self.advance();
            spec_args = self.parse_template_argument_list()?;
        }

        // Forward declaration.
        if self.check_punct(Punct::Semi) {
            self.advance();
            let node = self.arena.decl(
                Decl::Class {
                    key,
                    name,
                    bases: Vec::new(),
                    members: Vec::new(),
                    is_definition: false,
                },
                loc,
            );
            return Ok((node, name, spec_args));
        }

        // Base clause.
        let mut bases = Vec::new();
        if self.eat_punct(Punct::Colon) {
            loop {
                let mut access = match key {
                    ClassKey::Class => Access::Private,
                    _ => Access::Public,
                };
                let mut is_virtual = false;
                loop {
                    if self.eat_kw(Keyword::Virtual) {
                        is_virtual = true;
                    } else if self.eat_kw(Keyword::Public) {
                        access = Access::Public;
                    } else if self.eat_kw(Keyword::Protected) {
                        access = Access::Protected;
                    } else if self.eat_kw(Keyword::Private) {
                        access = Access::Private;
                    } else {
                        break;
                    }
                }
                let base = self.expect_ident("base class name")?;
                // Base may itself be a template instantiation.
                if self.check_punct(Punct::Lt) {
                    self.advance();
                    let _args = self.parse_template_argument_list()?;
                }
                bases.push(BaseSpec {
                    name: base,
                    access,
                    is_virtual,
                });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }

        self.expect_punct(Punct::LBrace, "'{' starting class body")?;
        let previous_class = self.current_class.replace(name);
        let mut access = match key {
            ClassKey::Class => Access::Private,
            _ => Access::Public,
        };
        let mut members = Vec::new();
        while !self.check_punct(Punct::RBrace) && !self.at_eof() {
            // Access specifiers.
            if self.check_kw(Keyword::Public) || self.check_kw(Keyword::Protected) || self.check_kw(Keyword::Private)
            {
                access = match self.peek().kind {
                    TokenKind::Keyword(Keyword::Public) => Access::Public,
                    TokenKind::Keyword(Keyword::Protected) => Access::Protected,
                    _ => Access::Private,
                };
                self.advance();
                self.expect_punct(Punct::Colon, "':' after access specifier")?;
                continue;
            }
            match self.parse_member_declaration(name, access) {
                Ok(Some(m)) => members.push(m),
                Ok(None) => {}
                Err(diag) => {
                    self.diags.push(diag);
                    self.sync_to_statement_boundary();
                }
            }
        }
        self.expect_punct(Punct::RBrace, "'}' closing class body")?;
        self.expect_punct(Punct::Semi, "';' after class definition")?;
        self.current_class = previous_class;

        // Record member names for out-of-line definition validation.
        let member_names: Vec<StrId> = members
            .iter()
            .filter_map(|&m| match self.arena.as_decl(m) {
                Some(Decl::Function { name, .. }) => Some(*name),
                Some(Decl::Field { name, .. }) => Some(*name),
                _ => None,
            })
            .collect();
        self.registry.record_class_members(name, member_names);

        let node = self.arena.decl(
            Decl::Class {
                key,
                name,
                bases,
                members,
                is_definition: true,
            },
            loc,
        );
        Ok((node, name, spec_args))
    }

    /// One member of a class body.
    fn parse_member_declaration(
        &mut self,
        class_name: StrId,
        access: Access,
    ) -> Result<Option<NodeId>, Diagnostic> {
        let loc = self.loc();

        if self.eat_punct(Punct::Semi) {
            return Ok(None);
        }
        if self.check_kw(Keyword::StaticAssert) {
            return self.parse_static_assert().map(Some);
        }
        if self.check_kw(Keyword::Using) {
            return self.parse_using().map(Some);
        }
        if self.check_kw(Keyword::Typedef) {
            return self.parse_typedef().map(Some);
        }
        if self.check_kw(Keyword::Friend) {
            self.advance();
            // `friend class X;` or a friend function declaration.
            if (self.check_kw(Keyword::Class) || self.check_kw(Keyword::Struct))
                && self.peek_n(1).kind == TokenKind::Ident
                && self.peek_n(2).is_punct(Punct::Semi)
            {
                self.advance();
                let fname = self.expect_ident("friend class name")?;
                self.expect_punct(Punct::Semi, "';' after friend declaration")?;
                let inner = self.arena.decl(
                    Decl::Class {
                        key: ClassKey::Class,
                        name: fname,
                        bases: Vec::new(),
                        members: Vec::new(),
                        is_definition: false,
                    },
                    loc,
                );
                return Ok(Some(self.arena.decl(Decl::Friend { decl: inner }, loc)));
            }
            let inner = self.parse_function_or_variable(Storage::None)?;
            return Ok(Some(self.arena.decl(Decl::Friend { decl: inner }, loc)));
        }
        if self.check_kw(Keyword::Template) {
            // Member template.
            return self.parse_template_declaration().map(Some);
        }
        if self.check_kw(Keyword::Enum) {
            return self.parse_enum().map(Some);
        }
        if self.check_kw(Keyword::Class) || self.check_kw(Keyword::Struct) || self.check_kw(Keyword::Union)
        {
            // Nested class definition.
            if self.peek_n(1).kind == TokenKind::Ident
                && matches!(
                    self.peek_n(2).kind,
                    TokenKind::Punct(Punct::LBrace) | TokenKind::Punct(Punct::Colon)
                )
            {
                let (node, _, _) = self.parse_class_definition()?;
                return Ok(Some(node));
            }
        }

        // Leading specifiers.
        let mut specs = FuncSpecs::default();
        let mut is_static = false;
        let mut is_mutable = false;
        loop {
            if self.eat_kw(Keyword::Virtual) {
                specs.is_virtual = true;
            } else if self.eat_kw(Keyword::Static) {
                is_static = true;
                specs.is_static = true;
            } else if self.eat_kw(Keyword::Inline) {
                specs.is_inline = true;
            } else if self.eat_kw(Keyword::Constexpr) {
                specs.is_constexpr = true;
            } else if self.eat_kw(Keyword::Consteval) {
                specs.is_consteval = true;
            } else if self.eat_kw(Keyword::Explicit) {
                specs.is_explicit = true;
            } else if self.eat_kw(Keyword::Mutable) {
                is_mutable = true;
            } else {
                break;
            }
        }

        // Destructor: `~Class() ...`
        if self.check_punct(Punct::Tilde) {
            self.advance();
            let dname = self.expect_ident("class name after '~'")?;
            if dname != class_name {
                return Err(self.err_here("destructor name does not match class"));
            }
            self.expect_punct(Punct::LParen, "'(' after destructor name")?;
            self.expect_punct(Punct::RParen, "')' after destructor name")?;
            self.parse_trailing_function_specifiers(&mut specs)?;
            let body = self.parse_function_body_or_semi(&mut specs)?;
            return Ok(Some(self.arena.decl(
                Decl::Destructor {
                    class: class_name,
                    body,
                    specs,
                    access,
                },
                loc,
            )));
        }

        // Constructor: `Class(params) ...`
        let head_is_class_name = self.peek().kind == TokenKind::Ident && {
            let text = self.peek().text.clone();
            self.intern(&text) == class_name
        };
        if head_is_class_name && self.peek_n(1).is_punct(Punct::LParen) {
            self.advance();
            self.advance();
            let (params, variadic) = self.parse_parameter_list()?;
            specs.is_variadic = variadic;
            // `requires` clause may precede the member-initializer list.
            if self.check_kw(Keyword::Requires) {
                self.advance();
                specs.requires_clause = Some(self.parse_assignment_expression()?);
            }
            self.parse_trailing_function_specifiers(&mut specs)?;
            let mut init_list = Vec::new();
            if self.eat_punct(Punct::Colon) {
                loop {
                    let target = self.expect_ident("member or base name")?;
                    let mut args = Vec::new();
                    if self.eat_punct(Punct::LParen) {
                        if !self.check_punct(Punct::RParen) {
                            loop {
                                args.push(self.parse_assignment_expression()?);
                                if !self.eat_punct(Punct::Comma) {
                                    break;
                                }
                            }
                        }
                        self.expect_punct(Punct::RParen, "')' after initializer arguments")?;
                    } else if self.check_punct(Punct::LBrace) {
                        let init = self.parse_assignment_expression()?;
                        args.push(init);
                    }
                    init_list.push((target, args));
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            let body = self.parse_function_body_or_semi(&mut specs)?;
            return Ok(Some(self.arena.decl(
                Decl::Constructor {
                    class: class_name,
                    params,
                    init_list,
                    body,
                    specs,
                    access,
                },
                loc,
            )));
        }

        // Ordinary member: type then declarator. `operator` overloads carry
        // their spelled name and parse their parameter list here.
        let spec = self.parse_core_and_quals()?;
        let d = self.parse_declarator(spec)?;
        let (name, member_params, member_variadic) = match d.name {
            Some(n) => (n, d.params.clone(), d.is_variadic),
            None if self.check_kw(Keyword::Operator) => {
                let n = self.parse_operator_name()?;
                self.expect_punct(Punct::LParen, "'(' after operator name")?;
                let (p, v) = self.parse_parameter_list()?;
                (n, Some(p), v)
            }
            None => return Err(self.err_here("expected member name")),
        };

        if let Some(params) = member_params {
            specs.is_variadic = member_variadic;
            self.parse_trailing_function_specifiers(&mut specs)?;
            let ret = self.arena.type_spec(d.spec, loc);
            let ret = self.apply_trailing_return(ret, &mut specs)?;
            let body = self.parse_function_body_or_semi(&mut specs)?;
            return Ok(Some(self.arena.decl(
                Decl::Function {
                    name,
                    class: Some(class_name),
                    params,
                    ret,
                    body,
                    specs,
                    access,
                    storage: if is_static {
                        Storage::Static
                    } else {
                        Storage::None
                    },
                },
                loc,
            )));
        }

        // Data member.
        let init = if self.eat_punct(Punct::Assign) {
            Some(self.parse_assignment_expression()?)
        } else if self.check_punct(Punct::LBrace) {
            Some(self.parse_assignment_expression()?)
        } else {
            None
        };
        self.expect_punct(Punct::Semi, "';' after member declaration")?;
        let ty = self.arena.type_spec(d.spec, loc);
        Ok(Some(self.arena.decl(
            Decl::Field {
                name,
                ty,
                init,
                access,
                is_static,
                is_mutable,
            },
            loc,
        )))
    }

    /// `operator+`, `operator()`, `operator[]`, `operator<=>`, ...
    fn parse_operator_name(&mut self) -> Result<StrId, Diagnostic> {
        self.advance(); // 'operator'
        let spelled = if self.check_punct(Punct::LParen) && self.peek_n(1).is_punct(Punct::RParen) {
            self.advance();
            self.advance();
            "operator()".to_string()
        } else if self.check_punct(Punct::LBracket) && self.peek_n(1).is_punct(Punct::RBracket) {
            self.advance();
            self.advance();
            "operator[]".to_string()
        } else {
            let t = self.advance();
            format!("operator{}", t.text)
        };
        Ok(self.intern(&spelled))
    }

    /// Trailing specifiers after a function declarator, in any legal
    /// order: `const`, `volatile`, `&`, `&&`, `noexcept(..)`, `override`,
    /// `final`, `requires ...`.
    fn parse_trailing_function_specifiers(
        &mut self,
        specs: &mut FuncSpecs,
    ) -> Result<(), Diagnostic> {
        loop {
            if self.eat_kw(Keyword::Const) {
                specs.is_const = true;
            } else if self.eat_kw(Keyword::Volatile) {
                specs.is_volatile = true;
            } else if self.check_punct(Punct::Amp) {
                self.advance();
                specs.ref_qualifier = Some(RefKind::LValue);
            } else if self.check_punct(Punct::AmpAmp) {
                self.advance();
                specs.ref_qualifier = Some(RefKind::RValue);
            } else if self.check_kw(Keyword::Noexcept) {
                self.advance();
                if self.eat_punct(Punct::LParen) {
                    let e = self.parse_expression()?;
                    self.expect_punct(Punct::RParen, "')' after noexcept expression")?;
                    specs.noexcept = Some(Some(e));
                } else {
                    specs.noexcept = Some(None);
                }
            } else if self.peek().is_ident("override") {
                self.advance();
                specs.is_override = true;
            } else if self.peek().is_ident("final") {
                self.advance();
                specs.is_final = true;
            } else if self.check_kw(Keyword::Requires) {
                self.advance();
                specs.requires_clause = Some(self.parse_requires_or_constraint()?);
            } else {
                return Ok(());
            }
        }
    }

    /// A constraint after `requires`: either a requires-expression or a
    /// constraint-logical-expression.
    pub(crate) fn parse_requires_or_constraint(&mut self) -> Result<NodeId, Diagnostic> {
        if self.check_kw(Keyword::Requires) {
            // `requires requires { ... }`
            return self.parse_requires_expression();
        }
        if self.check_punct(Punct::LBrace) {
            return Err(self.err_here("expected constraint expression after 'requires'"));
        }
        self.parse_assignment_expression()
    }

    /// Trailing return type: rewrites an `auto` return spec.
    fn apply_trailing_return(
        &mut self,
        ret: NodeId,
        _specs: &mut FuncSpecs,
    ) -> Result<NodeId, Diagnostic> {
        if self.eat_punct(Punct::Arrow) {
            return self.parse_type_spec();
        }
        Ok(ret)
    }

    /// `{ body }`, `;`, `= 0;`, `= default;`, `= delete;`
    fn parse_function_body_or_semi(
        &mut self,
        specs: &mut FuncSpecs,
    ) -> Result<Option<NodeId>, Diagnostic> {
        if self.check_punct(Punct::LBrace) {
            return Ok(Some(self.parse_compound_statement()?));
        }
        if self.eat_punct(Punct::Assign) {
            if let TokenKind::Int { value: 0, .. } = self.peek().kind {
                self.advance();
                specs.is_pure = true;
                specs.is_virtual = true;
                self.expect_punct(Punct::Semi, "';' after '= 0'")?;
                return Ok(None);
            }
            if self.eat_kw(Keyword::Default) || self.eat_kw(Keyword::Delete) {
                self.expect_punct(Punct::Semi, "';' after defaulted/deleted function")?;
                return Ok(None);
            }
            return Err(self.err_here("expected '0', 'default' or 'delete'"));
        }
        self.expect_punct(Punct::Semi, "';' after declaration")?;
        Ok(None)
    }

    // ------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------

    /// `template<...> declaration`, covering class templates (primary,
    /// partial, full), function templates, alias templates, variable
    /// templates and concepts.
    fn parse_template_declaration(&mut self) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        self.advance(); // 'template'
        self.expect_punct(Punct::Lt, "'<' after 'template'")?;
        let params = self.parse_template_parameter_list()?;

        // Requires-clause on the template head.
        let mut head_requires = None;
        if self.check_kw(Keyword::Requires) {
            self.advance();
            head_requires = Some(self.parse_requires_or_constraint()?);
        }

        // Scope the parameter names for the body parse.
        let mut type_names = std::collections::HashSet::new();
        let mut value_names = std::collections::HashSet::new();
        for p in &params {
            match p.kind {
                TemplateParamKind::Type { .. } | TemplateParamKind::Template => {
                    type_names.insert(p.name);
                }
                TemplateParamKind::NonType { .. } => {
                    value_names.insert(p.name);
                }
            }
        }
        self.template_param_scopes.push(type_names);
        self.value_param_scopes.push(value_names);

        let result = self.parse_templated_entity(loc, params, head_requires);

        self.template_param_scopes.pop();
        self.value_param_scopes.pop();
        result
    }

    fn parse_templated_entity(
        &mut self,
        loc: crate::diag::SourceLoc,
        params: Vec<TemplateParam>,
        head_requires: Option<NodeId>,
    ) -> Result<NodeId, Diagnostic> {
        // Concept definition.
        if self.check_kw(Keyword::Concept) {
            self.advance();
            let name = self.expect_ident("concept name")?;
            self.expect_punct(Punct::Assign, "'=' after concept name")?;
            let expr = if self.check_kw(Keyword::Requires) {
                self.parse_requires_expression()?
            } else {
                self.parse_assignment_expression()?
            };
            self.expect_punct(Punct::Semi, "';' after concept definition")?;
            let node = self.arena.decl(
                Decl::Concept {
                    name,
                    params: params.clone(),
                    expr,
                },
                loc,
            );
            self.registry.register_concept(name, params, expr);
            self.known_templates.insert(name);
            return Ok(node);
        }

        // Class template.
        if self.check_kw(Keyword::Class) || self.check_kw(Keyword::Struct) || self.check_kw(Keyword::Union)
        {
            let (node, name, spec_args) = self.parse_class_definition()?;
            self.known_templates.insert(name);
            let tmpl = self.arena.decl(
                Decl::Template {
                    params: params.clone(),
                    requires_clause: head_requires,
                    decl: node,
                },
                loc,
            );
            if spec_args.is_empty() {
                self.registry
                    .register_class_template(name, params, node, head_requires);
            } else if params.is_empty() {
                self.registry.register_class_full(name, spec_args, node);
            } else {
                self.registry
                    .register_class_partial(name, params, spec_args, node);
            }
            return Ok(tmpl);
        }

        // Alias template: `template<..> using X = T<..>;`
        if self.check_kw(Keyword::Using) {
            self.advance();
            let name = self.expect_ident("alias name")?;
            self.expect_punct(Punct::Assign, "'=' in alias template")?;
            let target = self.parse_type_spec()?;
            self.expect_punct(Punct::Semi, "';' after alias template")?;
            let node = self.arena.decl(Decl::Alias { name, target }, loc);
            let tmpl = self.arena.decl(
                Decl::Template {
                    params: params.clone(),
                    requires_clause: head_requires,
                    decl: node,
                },
                loc,
            );
            self.registry.register_alias_template(name, params, target);
            self.known_templates.insert(name);
            self.known_types.insert(name);
            return Ok(tmpl);
        }

        // Function or variable template.
        let inner = self.parse_function_or_variable(Storage::None)?;
        let tmpl = self.arena.decl(
            Decl::Template {
                params: params.clone(),
                requires_clause: head_requires,
                decl: inner,
            },
            loc,
        );
        match self.arena.as_decl(inner) {
            Some(Decl::Function { name, .. }) => {
                let name = *name;
                self.known_templates.insert(name);
                self.registry
                    .register_function_template(name, params, inner, head_requires);
            }
            Some(Decl::Variable { name, .. }) => {
                let name = *name;
                self.known_templates.insert(name);
                self.registry.register_variable_template(name, params, inner);
            }
            _ => {}
        }
        Ok(tmpl)
    }

    /// Template parameter list after `<`; closes the list.
    pub(crate) fn parse_template_parameter_list(
        &mut self,
    ) -> Result<Vec<TemplateParam>, Diagnostic> {
        self.gt_stack.push(false);
        let result = self.parse_template_parameter_list_inner();
        self.gt_stack.pop();
        result
    }

    fn parse_template_parameter_list_inner(
        &mut self,
    ) -> Result<Vec<TemplateParam>, Diagnostic> {
        let mut params = Vec::new();
        if self.check_punct(Punct::Gt) {
            self.advance();
            return Ok(params);
        }
        loop {
            // `template<typename T>` / `template<class T>`
            if self.check_kw(Keyword::Typename) || self.check_kw(Keyword::Class) {
                self.advance();
                let is_pack = self.eat_punct(Punct::Ellipsis);
                let name = if self.peek().kind == TokenKind::Ident {
                    self.expect_ident("template parameter name")?
                } else {
                    self.intern("")
                };
                let default = if self.eat_punct(Punct::Assign) {
                    Some(self.parse_type_spec()?)
                } else {
                    None
                };
                params.push(TemplateParam {
                    name,
                    kind: TemplateParamKind::Type {
                        default,
                        constraint: None,
                    },
                    is_pack,
                });
            } else if self.check_kw(Keyword::Template) {
                // template-template parameter.
                self.advance();
                self.expect_punct(Punct::Lt, "'<' in template-template parameter")?;
                let _inner = self.parse_template_parameter_list()?;
                if !self.eat_kw(Keyword::Class) {
                    let _ = self.eat_kw(Keyword::Typename);
                }
                let name = self.expect_ident("template-template parameter name")?;
                params.push(TemplateParam {
                    name,
                    kind: TemplateParamKind::Template,
                    is_pack: false,
                });
            } else if self.peek().kind == TokenKind::Ident
                && self.is_template_name(self.strings.lookup(&self.peek().text).unwrap_or(crate::strings::StrId::EMPTY))
                && self.peek_n(1).kind == TokenKind::Ident
            {
                // Constrained parameter: `Concept T`.
                let constraint = self.expect_ident("concept name")?;
                let name = self.expect_ident("template parameter name")?;
                let default = if self.eat_punct(Punct::Assign) {
                    Some(self.parse_type_spec()?)
                } else {
                    None
                };
                params.push(TemplateParam {
                    name,
                    kind: TemplateParamKind::Type {
                        default,
                        constraint: Some(constraint),
                    },
                    is_pack: false,
                });
            } else {
                // Non-type parameter: `int N`, `auto V`.
                let ploc = self.loc();
                let spec = self.parse_core_and_quals()?;
                let mut spec = spec;
                self.parse_pointer_suffixes(&mut spec)?;
                let is_pack = self.eat_punct(Punct::Ellipsis);
                let name = if self.peek().kind == TokenKind::Ident {
                    self.expect_ident("non-type parameter name")?
                } else {
                    self.intern("")
                };
                let ty = self.arena.type_spec(spec, ploc);
                let default = if self.eat_punct(Punct::Assign) {
                    Some(self.parse_assignment_expression()?)
                } else {
                    None
                };
                params.push(TemplateParam {
                    name,
                    kind: TemplateParamKind::NonType { ty, default },
                    is_pack,
                });
            }
            if self.eat_punct(Punct::Comma) {
                continue;
            }
            self.expect_template_close()?;
            break;
        }
        Ok(params)
    }

    // ------------------------------------------------------------
    // Functions and variables
    // ------------------------------------------------------------

    /// Namespace-scope function or variable declaration/definition,
    /// including out-of-line template member definitions
    /// (`template<..> Ret Class<Args>::method(..) { .. }`).
    pub(crate) fn parse_function_or_variable(
        &mut self,
        storage_in: Storage,
    ) -> Result<NodeId, Diagnostic> {
        let loc = self.loc();
        let mut storage = storage_in;
        let mut specs = FuncSpecs::default();
        let mut is_constexpr_var = false;
        let mut is_inline = false;
        loop {
            if self.eat_kw(Keyword::Static) {
                storage = Storage::Static;
                specs.is_static = true;
            } else if self.eat_kw(Keyword::Extern) {
                storage = Storage::Extern;
            } else if self.eat_kw(Keyword::ThreadLocal) {
                storage = Storage::ThreadLocal;
            } else if self.eat_kw(Keyword::Inline) {
                is_inline = true;
                specs.is_inline = true;
            } else if self.eat_kw(Keyword::Constexpr) {
                is_constexpr_var = true;
                specs.is_constexpr = true;
            } else if self.eat_kw(Keyword::Consteval) {
                specs.is_consteval = true;
            } else if self.eat_kw(Keyword::Virtual) {
                specs.is_virtual = true;
            } else if self.eat_kw(Keyword::Explicit) {
                specs.is_explicit = true;
            } else {
                break;
            }
        }

        let spec = self.parse_core_and_quals()?;
        let d = self.parse_declarator(spec)?;
        let (name, decl_params, decl_variadic) = match d.name {
            Some(n) => (n, d.params.clone(), d.is_variadic),
            None if self.check_kw(Keyword::Operator) => {
                let n = self.parse_operator_name()?;
                self.expect_punct(Punct::LParen, "'(' after operator name")?;
                let (p, v) = self.parse_parameter_list()?;
                (n, Some(p), v)
            }
            None => return Err(self.err_here("expected declarator name")),
        };

        // Out-of-line member definition: validate the member exists on the
        // class, skipping constructors/destructors in the search.
        let class = d.class_path.last().copied();
        if let Some(cls) = class
            && decl_params.is_some()
            && !self.registry.class_has_member(cls, name)
            && !self.registry.is_class_template(cls)
        {
            return Err(Diagnostic::error(
                loc,
                format!(
                    "out-of-line definition of '{}' does not match any member of '{}'",
                    self.strings.resolve(name),
                    self.strings.resolve(cls)
                ),
            ));
        }

        if let Some(params) = decl_params {
            specs.is_variadic = decl_variadic;
            self.parse_trailing_function_specifiers(&mut specs)?;
            let ret = self.arena.type_spec(d.spec, loc);
            let ret = self.apply_trailing_return(ret, &mut specs)?;
            let body = self.parse_function_body_or_semi(&mut specs)?;
            return Ok(self.arena.decl(
                Decl::Function {
                    name,
                    class,
                    params,
                    ret,
                    body,
                    specs,
                    access: Access::Public,
                    storage,
                },
                loc,
            ));
        }

        // Variable.
        let ty = self.arena.type_spec(d.spec, loc);
        let init = if self.eat_punct(Punct::Assign) {
            Some(self.parse_assignment_expression()?)
        } else if self.check_punct(Punct::LBrace) {
            Some(self.parse_assignment_expression()?)
        } else if self.check_punct(Punct::LParen) {
            self.advance();
            let e = self.parse_expression()?;
            self.expect_punct(Punct::RParen, "')' after initializer")?;
            Some(e)
        } else {
            None
        };
        self.expect_punct(Punct::Semi, "';' after declaration")?;
        Ok(self.arena.decl(
            Decl::Variable {
                name,
                ty,
                init,
                storage,
                is_constexpr: is_constexpr_var,
                is_constinit: false,
                is_inline,
            },
            loc,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::parse_tu;
    use crate::ast::{Access, Decl, TemplateParamKind};

    #[test]
    fn test_namespace_and_using() {
        let (out, _) = parse_tu(
            "namespace math { int abs(int x) { return x < 0 ? -x : x; } }\n\
             using namespace math;\n\
             using math::abs;",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_enum_scoped_and_unscoped() {
        let (out, _) = parse_tu(
            "enum Color { Red, Green = 5, Blue };\n\
             enum class Mode : unsigned char { A, B };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        match out.arena.as_decl(decls[1]) {
            Some(Decl::Enum { scoped, underlying, .. }) => {
                assert!(*scoped);
                assert!(underlying.is_some());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_class_with_access_and_members() {
        let (out, _) = parse_tu(
            "class Widget {\n\
             public:\n\
               Widget(int v) : value(v) {}\n\
               ~Widget() {}\n\
               int get() const { return value; }\n\
             private:\n\
               int value;\n\
             };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Class { members, .. }) = out.arena.as_decl(decls[0]) else {
            panic!()
        };
        assert_eq!(members.len(), 4);
        match out.arena.as_decl(members[3]) {
            Some(Decl::Field { access, .. }) => assert_eq!(*access, Access::Private),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_virtual_and_pure_virtual() {
        let (out, _) = parse_tu(
            "class Base {\n\
             public:\n\
               virtual int getValue() = 0;\n\
               virtual ~Base() {}\n\
             };\n\
             class Derived : public Base {\n\
             public:\n\
               int getValue() override { return 30; }\n\
             };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Class { members, .. }) = out.arena.as_decl(decls[0]) else {
            panic!()
        };
        match out.arena.as_decl(members[0]) {
            Some(Decl::Function { specs, .. }) => {
                assert!(specs.is_virtual);
                assert!(specs.is_pure);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_class_template_registration() {
        let (out, mut strings) = parse_tu(
            "template<typename T> struct Box { T value; };\n\
             template<typename T> struct Box<T*> { T* ptr; int tag; };\n\
             template<> struct Box<void> { };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let box_id = strings.intern("Box");
        assert!(out.registry.is_class_template(box_id));
        assert_eq!(out.registry.partial_count(box_id), 1);
        assert_eq!(out.registry.full_count(box_id), 1);
    }

    #[test]
    fn test_function_template_with_requires() {
        let (out, _) = parse_tu(
            "template<typename T> requires __is_integral(T) T twice(T v) { return v + v; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_concept_definition() {
        let (out, mut strings) = parse_tu(
            "template<typename T> concept Addable = requires (T a) { a + a; };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let id = strings.intern("Addable");
        assert!(out.registry.is_template(id));
    }

    #[test]
    fn test_nontype_template_parameter() {
        let (out, _) = parse_tu("template<int N> struct Fixed { int data[N]; };");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let Some(Decl::TranslationUnit { decls }) = out.arena.as_decl(out.root) else {
            panic!()
        };
        let Some(Decl::Template { params, .. }) = out.arena.as_decl(decls[0]) else {
            panic!()
        };
        assert!(matches!(params[0].kind, TemplateParamKind::NonType { .. }));
    }

    #[test]
    fn test_out_of_line_member_definition() {
        let (out, _) = parse_tu(
            "template<typename T> struct Holder { T value; T get(); };\n\
             template<typename T> T Holder<T>::get() { return value; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_out_of_line_mismatch_is_error() {
        let (out, _) = parse_tu(
            "struct Holder { int value; int get(); };\n\
             int Holder::missing() { return 0; }",
        );
        assert_eq!(out.diags.len(), 1);
        assert!(out.diags[0].message.contains("does not match any member"));
    }

    #[test]
    fn test_friend_declarations() {
        let (out, _) = parse_tu(
            "class Secret {\n\
               friend class Inspector;\n\
               friend int peek(Secret& s);\n\
               int hidden;\n\
             };",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_variadic_template_pack() {
        let (out, _) = parse_tu(
            "template<typename... Args> int count_args(Args... args) { return sizeof...(args); }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_extern_c_block() {
        let (out, _) = parse_tu("extern \"C\" { int c_func(int); }");
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }
}
