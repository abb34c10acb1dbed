//! Template registry and instantiation engine
//!
//! Stores every template flavor (class primary/partial/full, function,
//! alias, variable, concept) as arena subtrees plus parameter lists, and
//! instantiates lazily:
//!
//! - class instantiation picks full specialization > best partial (by the
//!   partial-ordering rule, ties diagnosed) > primary, substitutes the body
//!   through a flat parameter→argument map, and caches the result keyed by
//!   the canonical argument spelling
//! - member function bodies are NOT instantiated with their class; a lazy
//!   registry maps `(instantiated class, member)` to the stored AST and the
//!   substitution map, and bodies materialize on first use
//! - substitution runs in either hard-error or SFINAE mode; in SFINAE mode
//!   a substitution failure silently discards the candidate
//! - instantiated names get a hash suffix derived from the canonical
//!   argument list (`Box$9f8a...`); `$` cannot appear in user identifiers,
//!   so no user name or marker substring can collide
//!
//! An explicit instantiation path stack bounds recursion depth and turns
//! repeated `(template, args)` pairs into cycle diagnostics.

use crate::ast::{
    Arena, CoreType, Decl, DerivedType, Expr, FoldKind, NodeId, NodeKind, Stmt, TemplateParam,
    TemplateParamKind, TypeSpec,
};
use crate::diag::{Diagnostic, SourceLoc};
use crate::lexer::IntSuffix;
use crate::strings::{StrId, StringBuilder, StringTable};
use std::collections::HashMap;

/// Default instantiation recursion limit; configurable via CompilerConfig.
pub const DEFAULT_DEPTH_LIMIT: usize = 1024;

/// Substitution failure classification. In SFINAE contexts `Sfinae`
/// removes the candidate silently; `Hard` always surfaces.
#[derive(Debug, Clone)]
pub enum SubstError {
    Sfinae(String),
    Hard(Diagnostic),
}

impl SubstError {
    pub fn into_diagnostic(self, loc: SourceLoc) -> Diagnostic {
        match self {
            SubstError::Sfinae(msg) => Diagnostic::error(loc, msg),
            SubstError::Hard(d) => d,
        }
    }
}

/// One bound template argument in a substitution map.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Type argument: a TypeSpec node.
    Type(NodeId),
    /// Non-type argument: an expression node.
    Expr(NodeId),
    /// Parameter pack of types.
    TypePack(Vec<NodeId>),
    /// Parameter pack of values.
    ExprPack(Vec<NodeId>),
}

/// Flat parameter-name → argument table driving one substitution.
#[derive(Debug, Clone, Default)]
pub struct SubstMap {
    map: HashMap<StrId, Binding>,
}

impl SubstMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: StrId, binding: Binding) {
        self.map.insert(name, binding);
    }

    pub fn get(&self, name: StrId) -> Option<&Binding> {
        self.map.get(&name)
    }

    pub fn pack_len(&self, name: StrId) -> Option<usize> {
        match self.map.get(&name)? {
            Binding::TypePack(v) => Some(v.len()),
            Binding::ExprPack(v) => Some(v.len()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ClassTemplate {
    params: Vec<TemplateParam>,
    /// Class node of the primary pattern; `None` when only declared.
    primary: Option<NodeId>,
    requires_clause: Option<NodeId>,
    /// Ordered partial specializations.
    partials: Vec<PartialSpec>,
    /// Full specializations: pattern args plus body.
    fulls: Vec<(Vec<NodeId>, NodeId)>,
}

#[derive(Debug, Clone)]
struct PartialSpec {
    params: Vec<TemplateParam>,
    args: Vec<NodeId>,
    body: NodeId,
}

#[derive(Debug, Clone)]
pub struct FunctionTemplate {
    pub params: Vec<TemplateParam>,
    pub decl: NodeId,
    pub requires_clause: Option<NodeId>,
}

#[derive(Debug, Clone)]
struct AliasTemplate {
    params: Vec<TemplateParam>,
    target: NodeId,
}

#[derive(Debug, Clone)]
struct VariableTemplate {
    params: Vec<TemplateParam>,
    decl: NodeId,
}

#[derive(Debug, Clone)]
struct ConceptDef {
    params: Vec<TemplateParam>,
    expr: NodeId,
}

/// Lazily instantiable member function of an instantiated class.
#[derive(Debug, Clone)]
pub struct LazyMember {
    pub class_template: StrId,
    pub instantiated_class: StrId,
    pub member: StrId,
    pub original: NodeId,
    pub subst: SubstMap,
}

/// A deferred non-type argument or base-class expression, evaluated after
/// the instantiation's own scope is populated.
#[derive(Debug, Clone)]
pub struct DeferredEval {
    pub instantiated_class: StrId,
    pub expr: NodeId,
    pub loc: SourceLoc,
}

pub struct TemplateRegistry {
    class_templates: HashMap<StrId, ClassTemplate>,
    function_templates: HashMap<StrId, Vec<FunctionTemplate>>,
    alias_templates: HashMap<StrId, AliasTemplate>,
    variable_templates: HashMap<StrId, VariableTemplate>,
    concepts: HashMap<StrId, ConceptDef>,
    /// Member names per parsed class, for out-of-line validation.
    class_members: HashMap<StrId, Vec<StrId>>,
    /// `(template, canonical args)` → instantiated class name.
    cache: HashMap<(StrId, String), StrId>,
    /// Instantiated class name → its declaration node.
    instantiated: HashMap<StrId, NodeId>,
    /// `"Inst::member"` key → lazy info, as the original registry did.
    lazy_members: HashMap<StrId, LazyMember>,
    /// Deferred evaluations pending fixed-point resolution.
    deferred: Vec<DeferredEval>,
    /// Instantiation path for cycle detection.
    path: Vec<(StrId, String)>,
    depth_limit: usize,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        TemplateRegistry {
            class_templates: HashMap::new(),
            function_templates: HashMap::new(),
            alias_templates: HashMap::new(),
            variable_templates: HashMap::new(),
            concepts: HashMap::new(),
            class_members: HashMap::new(),
            cache: HashMap::new(),
            instantiated: HashMap::new(),
            lazy_members: HashMap::new(),
            deferred: Vec::new(),
            path: Vec::new(),
            depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }

    pub fn set_depth_limit(&mut self, limit: usize) {
        self.depth_limit = limit;
    }

    // ------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------

    pub fn register_class_template(
        &mut self,
        name: StrId,
        params: Vec<TemplateParam>,
        body: NodeId,
        requires_clause: Option<NodeId>,
    ) {
        let entry = self.class_templates.entry(name).or_insert_with(|| ClassTemplate {
            params: params.clone(),
            primary: None,
            requires_clause,
            partials: Vec::new(),
            fulls: Vec::new(),
        });
        entry.params = params;
        entry.primary = Some(body);
        entry.requires_clause = requires_clause;
        tracing::debug!(target: "templates", "registered class template {:?}", name);
    }

    pub fn register_class_partial(
        &mut self,
        name: StrId,
        params: Vec<TemplateParam>,
        args: Vec<NodeId>,
        body: NodeId,
    ) {
        let entry = self.class_templates.entry(name).or_insert_with(|| ClassTemplate {
            params: Vec::new(),
            primary: None,
            requires_clause: None,
            partials: Vec::new(),
            fulls: Vec::new(),
        });
        entry.partials.push(PartialSpec { params, args, body });
    }

    pub fn register_class_full(&mut self, name: StrId, args: Vec<NodeId>, body: NodeId) {
        let entry = self.class_templates.entry(name).or_insert_with(|| ClassTemplate {
            params: Vec::new(),
            primary: None,
            requires_clause: None,
            partials: Vec::new(),
            fulls: Vec::new(),
        });
        entry.fulls.push((args, body));
    }

    pub fn register_function_template(
        &mut self,
        name: StrId,
        params: Vec<TemplateParam>,
        decl: NodeId,
        requires_clause: Option<NodeId>,
    ) {
        self.function_templates.entry(name).or_default().push(FunctionTemplate {
            params,
            decl,
            requires_clause,
        });
    }

    pub fn register_alias_template(&mut self, name: StrId, params: Vec<TemplateParam>, target: NodeId) {
        self.alias_templates.insert(name, AliasTemplate { params, target });
    }

    pub fn register_variable_template(&mut self, name: StrId, params: Vec<TemplateParam>, decl: NodeId) {
        self.variable_templates.insert(name, VariableTemplate { params, decl });
    }

    pub fn register_concept(&mut self, name: StrId, params: Vec<TemplateParam>, expr: NodeId) {
        self.concepts.insert(name, ConceptDef { params, expr });
    }

    pub fn record_class_members(&mut self, class: StrId, members: Vec<StrId>) {
        self.class_members.insert(class, members);
    }

    pub fn class_has_member(&self, class: StrId, member: StrId) -> bool {
        self.class_members
            .get(&class)
            .is_some_and(|m| m.contains(&member))
    }

    pub fn is_class_template(&self, name: StrId) -> bool {
        self.class_templates.contains_key(&name)
    }

    pub fn is_template(&self, name: StrId) -> bool {
        self.class_templates.contains_key(&name)
            || self.function_templates.contains_key(&name)
            || self.alias_templates.contains_key(&name)
            || self.variable_templates.contains_key(&name)
            || self.concepts.contains_key(&name)
    }

    pub fn function_templates_named(&self, name: StrId) -> &[FunctionTemplate] {
        self.function_templates
            .get(&name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn concept_expr(&self, name: StrId) -> Option<(&[TemplateParam], NodeId)> {
        self.concepts
            .get(&name)
            .map(|c| (c.params.as_slice(), c.expr))
    }

    pub fn partial_count(&self, name: StrId) -> usize {
        self.class_templates
            .get(&name)
            .map(|t| t.partials.len())
            .unwrap_or(0)
    }

    pub fn full_count(&self, name: StrId) -> usize {
        self.class_templates
            .get(&name)
            .map(|t| t.fulls.len())
            .unwrap_or(0)
    }

    pub fn instantiated_decl(&self, name: StrId) -> Option<NodeId> {
        self.instantiated.get(&name).copied()
    }

    pub fn take_deferred(&mut self) -> Vec<DeferredEval> {
        std::mem::take(&mut self.deferred)
    }

    // ------------------------------------------------------------
    // Class instantiation
    // ------------------------------------------------------------

    /// Instantiate `name<args>` and return the instantiated class's unique
    /// name. Cached per canonical argument list.
    pub fn instantiate_class(
        &mut self,
        arena: &mut Arena,
        strings: &mut StringTable,
        name: StrId,
        args: &[NodeId],
        loc: SourceLoc,
    ) -> Result<StrId, Diagnostic> {
        let key = canonical_args_key(arena, strings, args);
        if let Some(&cached) = self.cache.get(&(name, key.clone())) {
            return Ok(cached);
        }
        if self.path.len() >= self.depth_limit {
            return Err(Diagnostic::error(
                loc,
                format!(
                    "template instantiation depth limit ({}) exceeded",
                    self.depth_limit
                ),
            ));
        }
        if self.path.iter().any(|(n, k)| *n == name && *k == key) {
            return Err(Diagnostic::error(
                loc,
                format!(
                    "cyclic instantiation of template '{}'",
                    strings.resolve(name)
                ),
            ));
        }
        self.path.push((name, key.clone()));
        let result = self.instantiate_class_inner(arena, strings, name, args, &key, loc);
        self.path.pop();
        result
    }

    fn instantiate_class_inner(
        &mut self,
        arena: &mut Arena,
        strings: &mut StringTable,
        name: StrId,
        args: &[NodeId],
        key: &str,
        loc: SourceLoc,
    ) -> Result<StrId, Diagnostic> {
        let tmpl = self
            .class_templates
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                Diagnostic::error(loc, format!("'{}' is not a class template", strings.resolve(name)))
            })?;

        // Full specializations always win.
        for (pattern_args, body) in &tmpl.fulls {
            if pattern_args.len() == args.len()
                && pattern_args
                    .iter()
                    .zip(args)
                    .all(|(&p, &a)| nodes_structurally_equal(arena, p, a))
            {
                tracing::debug!(target: "templates", "full specialization hit for {:?}", name);
                return self.finish_instantiation(
                    arena, strings, name, args, key, *body, SubstMap::new(), loc,
                );
            }
        }

        // Partial specializations: unify each, keep matches, order them.
        let mut matches: Vec<(usize, SubstMap)> = Vec::new();
        for (i, partial) in tmpl.partials.iter().enumerate() {
            if partial.args.len() != args.len() {
                continue;
            }
            let mut map = SubstMap::new();
            let param_names: Vec<StrId> = partial.params.iter().map(|p| p.name).collect();
            let mut ok = true;
            for (&p, &a) in partial.args.iter().zip(args) {
                if !unify(arena, p, a, &param_names, &mut map) {
                    ok = false;
                    break;
                }
            }
            if ok {
                matches.push((i, map));
            }
        }

        if !matches.is_empty() {
            let chosen = if matches.len() == 1 {
                matches.pop().unwrap()
            } else {
                // Partial ordering: S1 more specialized than S2 iff S1's
                // args are deducible from S2's but not vice versa.
                let mut best: Option<(usize, SubstMap)> = None;
                let mut ambiguous = false;
                for (i, map) in matches {
                    match &best {
                        None => best = Some((i, map)),
                        Some((b, _)) => {
                            let a_spec = &tmpl.partials[i];
                            let b_spec = &tmpl.partials[*b];
                            let a_more = more_specialized(arena, a_spec, b_spec);
                            let b_more = more_specialized(arena, b_spec, a_spec);
                            if a_more && !b_more {
                                best = Some((i, map));
                                ambiguous = false;
                            } else if a_more == b_more {
                                ambiguous = true;
                            }
                        }
                    }
                }
                if ambiguous {
                    return Err(Diagnostic::error(
                        loc,
                        format!(
                            "ambiguous partial specializations for '{}': candidates tie in partial ordering",
                            strings.resolve(name)
                        ),
                    ));
                }
                best.expect("non-empty matches yield a best")
            };
            let body = tmpl.partials[chosen.0].body;
            return self.finish_instantiation(arena, strings, name, args, key, body, chosen.1, loc);
        }

        // Primary.
        let Some(primary) = tmpl.primary else {
            return Err(Diagnostic::error(
                loc,
                format!(
                    "class template '{}' is declared but never defined for these arguments",
                    strings.resolve(name)
                ),
            ));
        };
        let map = bind_params(arena, strings, &tmpl.params, args, loc)?;
        self.finish_instantiation(arena, strings, name, args, key, primary, map, loc)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_instantiation(
        &mut self,
        arena: &mut Arena,
        strings: &mut StringTable,
        name: StrId,
        args: &[NodeId],
        key: &str,
        body: NodeId,
        map: SubstMap,
        loc: SourceLoc,
    ) -> Result<StrId, Diagnostic> {
        // Hash-suffixed unique name; '$' cannot appear in user identifiers.
        let hash = fnv1a(key.as_bytes());
        let inst_name = StringBuilder::new()
            .append(strings.resolve(name))
            .append_char('$')
            .append(&format!("{:012x}", hash & 0xffff_ffff_ffff))
            .commit(strings);

        if self.instantiated.contains_key(&inst_name) {
            self.cache.insert((name, key.to_string()), inst_name);
            return Ok(inst_name);
        }

        // Substitute the class body; member function bodies stay behind in
        // the stored template and materialize lazily on first use.
        let mut subst = Substituter {
            arena,
            strings,
            map: &map,
            sfinae: false,
            pack_index: None,
            skip_member_bodies: true,
        };
        let inst_body = subst
            .subst(body)
            .map_err(|e| e.into_diagnostic(loc))?;

        // Rename the instantiated class; register the ORIGINAL member
        // nodes (with bodies) for lazy instantiation.
        let original_members: Vec<NodeId> = match arena.as_decl(body) {
            Some(Decl::Class { members, .. }) => members.clone(),
            _ => Vec::new(),
        };
        let mut member_names = Vec::new();
        if let NodeKind::Decl(Decl::Class { name: n, members, .. }) =
            &mut arena.get_mut(inst_body).kind
        {
            *n = inst_name;
            let members = members.clone();
            for m in members {
                match arena.as_decl(m) {
                    Some(Decl::Function { name: fname, .. }) => member_names.push(*fname),
                    Some(Decl::Field { name: fname, .. }) => member_names.push(*fname),
                    _ => {}
                }
            }
        } else {
            return Err(Diagnostic::internal(
                "class template body did not substitute to a class declaration",
            ));
        }
        for &m in &original_members {
            if let Some(Decl::Function {
                name: fname,
                body: Some(_),
                ..
            }) = arena.as_decl(m)
            {
                let fname = *fname;
                let lazy_key = lazy_member_key(strings, inst_name, fname);
                self.lazy_members.insert(
                    lazy_key,
                    LazyMember {
                        class_template: name,
                        instantiated_class: inst_name,
                        member: fname,
                        original: m,
                        subst: map.clone(),
                    },
                );
            }
        }

        // Record deferred non-type argument expressions that referenced the
        // instantiation being formed; the driver resolves them to a fixed
        // point once the scope is populated.
        for &a in args {
            if let Some(Expr::QualifiedId { path, .. }) = arena.as_expr(a)
                && path.first() == Some(&name)
            {
                self.deferred.push(DeferredEval {
                    instantiated_class: inst_name,
                    expr: a,
                    loc,
                });
            }
        }

        self.class_members.insert(inst_name, member_names);
        self.instantiated.insert(inst_name, inst_body);
        self.cache.insert((name, key.to_string()), inst_name);
        tracing::debug!(
            target: "templates",
            "instantiated {} as {}",
            strings.resolve(name),
            strings.resolve(inst_name)
        );
        Ok(inst_name)
    }

    // ------------------------------------------------------------
    // Lazy member instantiation
    // ------------------------------------------------------------

    pub fn needs_member_instantiation(
        &self,
        strings: &mut StringTable,
        inst_class: StrId,
        member: StrId,
    ) -> bool {
        let normalized = normalize_class_name(strings, inst_class);
        let key = lazy_member_key(strings, normalized, member);
        self.lazy_members.contains_key(&key)
    }

    /// Instantiate one member function body on first use, removing it from
    /// the lazy registry.
    pub fn instantiate_member(
        &mut self,
        arena: &mut Arena,
        strings: &mut StringTable,
        inst_class: StrId,
        member: StrId,
        loc: SourceLoc,
    ) -> Result<Option<NodeId>, Diagnostic> {
        let normalized = normalize_class_name(strings, inst_class);
        let key = lazy_member_key(strings, normalized, member);
        let Some(info) = self.lazy_members.remove(&key) else {
            return Ok(None);
        };
        let mut subst = Substituter {
            arena,
            strings,
            map: &info.subst,
            sfinae: false,
            pack_index: None,
            skip_member_bodies: false,
        };
        let node = subst.subst(info.original).map_err(|e| e.into_diagnostic(loc))?;
        tracing::debug!(
            target: "templates",
            "lazily instantiated member {}::{}",
            strings.resolve(info.instantiated_class),
            strings.resolve(member)
        );
        Ok(Some(node))
    }

    pub fn uninstantiated_member_count(&self) -> usize {
        self.lazy_members.len()
    }

    // ------------------------------------------------------------
    // Function template substitution (SFINAE surface)
    // ------------------------------------------------------------

    /// Substitute explicit/deduced arguments into one function template
    /// candidate. In SFINAE mode a substitution failure silently discards
    /// the candidate (`Ok(None)`); hard errors always propagate.
    pub fn substitute_function(
        &mut self,
        arena: &mut Arena,
        strings: &mut StringTable,
        candidate: &FunctionTemplate,
        args: &[NodeId],
        loc: SourceLoc,
    ) -> Result<Option<NodeId>, Diagnostic> {
        let map = match bind_params(arena, strings, &candidate.params, args, loc) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        let mut subst = Substituter {
            arena,
            strings,
            map: &map,
            sfinae: true,
            pack_index: None,
            skip_member_bodies: false,
        };
        match subst.subst(candidate.decl) {
            Ok(node) => Ok(Some(node)),
            Err(SubstError::Sfinae(msg)) => {
                tracing::debug!(target: "templates", "SFINAE discarded candidate: {}", msg);
                Ok(None)
            }
            Err(SubstError::Hard(d)) => Err(d),
        }
    }
}

/// `"ns::Foo$hash"` → `"Foo$hash"`, so lazy lookups match regardless of
/// qualification.
fn normalize_class_name(strings: &mut StringTable, handle: StrId) -> StrId {
    let name = strings.resolve(handle);
    if let Some(pos) = name.rfind("::") {
        let tail = name[pos + 2..].to_string();
        return strings.intern(&tail);
    }
    handle
}

fn lazy_member_key(strings: &mut StringTable, class: StrId, member: StrId) -> StrId {
    StringBuilder::new()
        .append_id(strings, class)
        .append("::")
        .append_id(strings, member)
        .commit(strings)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x1_0000_0000_01b3);
    }
    hash
}

// ------------------------------------------------------------
// Canonical argument keys
// ------------------------------------------------------------

/// Render an argument list to a canonical spelling for cache keys and hash
/// suffixes. Structural, so `Box<int>` spelled anywhere keys identically.
pub fn canonical_args_key(arena: &Arena, strings: &StringTable, args: &[NodeId]) -> String {
    let mut out = String::new();
    for (i, &a) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        render_node(arena, strings, a, &mut out);
    }
    out
}

fn render_node(arena: &Arena, strings: &StringTable, id: NodeId, out: &mut String) {
    match &arena.get(id).kind {
        NodeKind::TypeSpec(t) => render_type_spec(arena, strings, t, out),
        NodeKind::Expr(e) => render_expr(arena, strings, e, out),
        _ => out.push('?'),
    }
}

fn render_type_spec(arena: &Arena, strings: &StringTable, t: &TypeSpec, out: &mut String) {
    if t.is_const {
        out.push_str("const ");
    }
    if t.is_volatile {
        out.push_str("volatile ");
    }
    match &t.core {
        CoreType::Primitive(p) => out.push_str(&format!("{:?}", p).to_lowercase()),
        CoreType::Named {
            path,
            name,
            template_args,
            ..
        } => {
            for p in path {
                out.push_str(strings.resolve(*p));
                out.push_str("::");
            }
            out.push_str(strings.resolve(*name));
            if !template_args.is_empty() {
                out.push('<');
                for (i, &a) in template_args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    render_node(arena, strings, a, out);
                }
                out.push('>');
            }
        }
        CoreType::Auto => out.push_str("auto"),
        CoreType::Decltype(_) => out.push_str("decltype"),
    }
    for d in &t.derived {
        match d {
            DerivedType::Pointer { is_const, .. } => {
                out.push('*');
                if *is_const {
                    out.push_str("const");
                }
            }
            DerivedType::LValueRef => out.push('&'),
            DerivedType::RValueRef => out.push_str("&&"),
            DerivedType::Array { len } => {
                out.push('[');
                if let Some(l) = len {
                    render_node(arena, strings, *l, out);
                }
                out.push(']');
            }
            DerivedType::Function { params, .. } => {
                out.push('(');
                for (i, &p) in params.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    render_node(arena, strings, p, out);
                }
                out.push(')');
            }
            DerivedType::MemberPointer { class } => {
                out.push_str(strings.resolve(*class));
                out.push_str("::*");
            }
        }
    }
}

fn render_expr(arena: &Arena, strings: &StringTable, e: &Expr, out: &mut String) {
    match e {
        Expr::IntLit { value, .. } => out.push_str(&value.to_string()),
        Expr::BoolLit { value } => out.push_str(if *value { "true" } else { "false" }),
        Expr::CharLit { value, .. } => out.push_str(&format!("'{}'", value)),
        Expr::Ident { name } => out.push_str(strings.resolve(*name)),
        Expr::Unary { op, operand } => {
            out.push_str(&format!("{:?}", op));
            render_node(arena, strings, *operand, out);
        }
        Expr::QualifiedId { path, name, .. } => {
            for p in path {
                out.push_str(strings.resolve(*p));
                out.push_str("::");
            }
            out.push_str(strings.resolve(*name));
        }
        _ => out.push_str("<expr>"),
    }
}

/// Structural equality of argument nodes, for full-specialization matching.
pub fn nodes_structurally_equal(arena: &Arena, a: NodeId, b: NodeId) -> bool {
    // The canonical rendering is structural, so spelling equality is
    // structural equality. Strings are not needed for primitives, but a
    // shared empty table would lose names, so compare kinds directly for
    // the common cases and fall back to deep comparison.
    deep_equal(arena, a, b)
}

fn deep_equal(arena: &Arena, a: NodeId, b: NodeId) -> bool {
    match (&arena.get(a).kind, &arena.get(b).kind) {
        (NodeKind::TypeSpec(x), NodeKind::TypeSpec(y)) => {
            if x.is_const != y.is_const || x.is_volatile != y.is_volatile {
                return false;
            }
            if x.derived.len() != y.derived.len() {
                return false;
            }
            for (dx, dy) in x.derived.iter().zip(&y.derived) {
                let same = match (dx, dy) {
                    (
                        DerivedType::Pointer { is_const: c1, .. },
                        DerivedType::Pointer { is_const: c2, .. },
                    ) => c1 == c2,
                    (DerivedType::LValueRef, DerivedType::LValueRef) => true,
                    (DerivedType::RValueRef, DerivedType::RValueRef) => true,
                    (DerivedType::Array { len: l1 }, DerivedType::Array { len: l2 }) => {
                        match (l1, l2) {
                            (None, None) => true,
                            (Some(a2), Some(b2)) => deep_equal(arena, *a2, *b2),
                            _ => false,
                        }
                    }
                    (
                        DerivedType::Function { params: p1, variadic: v1 },
                        DerivedType::Function { params: p2, variadic: v2 },
                    ) => {
                        v1 == v2
                            && p1.len() == p2.len()
                            && p1.iter().zip(p2).all(|(&x2, &y2)| deep_equal(arena, x2, y2))
                    }
                    (
                        DerivedType::MemberPointer { class: c1 },
                        DerivedType::MemberPointer { class: c2 },
                    ) => c1 == c2,
                    _ => false,
                };
                if !same {
                    return false;
                }
            }
            match (&x.core, &y.core) {
                (CoreType::Primitive(p1), CoreType::Primitive(p2)) => p1 == p2,
                (
                    CoreType::Named {
                        path: pa,
                        name: na,
                        template_args: ta,
                        ..
                    },
                    CoreType::Named {
                        path: pb,
                        name: nb,
                        template_args: tb,
                        ..
                    },
                ) => {
                    pa == pb
                        && na == nb
                        && ta.len() == tb.len()
                        && ta.iter().zip(tb).all(|(&x2, &y2)| deep_equal(arena, x2, y2))
                }
                (CoreType::Auto, CoreType::Auto) => true,
                _ => false,
            }
        }
        (NodeKind::Expr(x), NodeKind::Expr(y)) => match (x, y) {
            (Expr::IntLit { value: v1, .. }, Expr::IntLit { value: v2, .. }) => v1 == v2,
            (Expr::BoolLit { value: v1 }, Expr::BoolLit { value: v2 }) => v1 == v2,
            (Expr::Ident { name: n1 }, Expr::Ident { name: n2 }) => n1 == n2,
            _ => false,
        },
        _ => false,
    }
}

// ------------------------------------------------------------
// Unification (partial-specialization matching)
// ------------------------------------------------------------

/// Unify a partial-specialization pattern against a concrete argument,
/// binding pattern parameters. Qualifier stripping per the deduction
/// rules: `T&` deduces `T = int` from `int&`; `T*` deduces `T = int` from
/// `int*`; `const T` deduces `T = int` from `const int`.
pub fn unify(
    arena: &mut Arena,
    pattern: NodeId,
    arg: NodeId,
    param_names: &[StrId],
    map: &mut SubstMap,
) -> bool {
    match (&arena.get(pattern).kind, &arena.get(arg).kind) {
        (NodeKind::TypeSpec(p), NodeKind::TypeSpec(a)) => {
            let p = p.clone();
            let a = a.clone();
            unify_type_specs(arena, &p, &a, param_names, map)
        }
        (NodeKind::Expr(p), NodeKind::Expr(a)) => {
            let p = p.clone();
            match p {
                Expr::Ident { name } if param_names.contains(&name) => {
                    map.bind(name, Binding::Expr(arg));
                    true
                }
                _ => {
                    let _ = a;
                    deep_equal(arena, pattern, arg)
                }
            }
        }
        // A pattern type-parameter can absorb an expression argument only
        // through a non-type parameter pattern, handled above.
        _ => false,
    }
}

fn unify_type_specs(
    arena: &mut Arena,
    pattern: &TypeSpec,
    arg: &TypeSpec,
    param_names: &[StrId],
    map: &mut SubstMap,
) -> bool {
    // The pattern's derived chain must be a suffix of the argument's.
    if pattern.derived.len() > arg.derived.len() {
        return false;
    }
    let split = arg.derived.len() - pattern.derived.len();
    let (arg_prefix, arg_suffix) = arg.derived.split_at(split);
    for (pd, ad) in pattern.derived.iter().zip(arg_suffix) {
        let compatible = matches!(
            (pd, ad),
            (DerivedType::Pointer { .. }, DerivedType::Pointer { .. })
                | (DerivedType::LValueRef, DerivedType::LValueRef)
                | (DerivedType::RValueRef, DerivedType::RValueRef)
                | (DerivedType::Array { .. }, DerivedType::Array { .. })
        );
        if !compatible {
            return false;
        }
    }

    match &pattern.core {
        CoreType::Named {
            path,
            name,
            template_args,
            ..
        } if path.is_empty() && template_args.is_empty() && param_names.contains(name) => {
            // Bind the parameter to the argument minus the matched suffix,
            // stripping the qualifiers the pattern spelled out itself.
            let bound = TypeSpec {
                core: arg.core.clone(),
                is_const: arg.is_const && !pattern.is_const,
                is_volatile: arg.is_volatile && !pattern.is_volatile,
                derived: arg_prefix.to_vec(),
                is_pack: false,
            };
            let loc = SourceLoc::unknown();
            let node = arena.type_spec(bound, loc);
            if let Some(Binding::Type(existing)) = map.get(*name) {
                // Repeated parameter must deduce consistently.
                return deep_equal(arena, *existing, node);
            }
            map.bind(*name, Binding::Type(node));
            true
        }
        CoreType::Named {
            path,
            name,
            template_args,
            ..
        } => {
            // Pattern names a template instantiation: argument must name the
            // same template, and argument lists unify pointwise.
            let CoreType::Named {
                path: apath,
                name: aname,
                template_args: aargs,
                ..
            } = &arg.core
            else {
                return false;
            };
            if path != apath || name != aname || template_args.len() != aargs.len() {
                return false;
            }
            let pairs: Vec<(NodeId, NodeId)> = template_args
                .iter()
                .copied()
                .zip(aargs.iter().copied())
                .collect();
            pairs
                .into_iter()
                .all(|(p, a)| unify(arena, p, a, param_names, map))
        }
        CoreType::Primitive(p) => {
            // Qualifiers the pattern spells must be present on the argument.
            if pattern.is_const && !arg.is_const {
                return false;
            }
            matches!(&arg.core, CoreType::Primitive(q) if q == p)
        }
        CoreType::Auto | CoreType::Decltype(_) => false,
    }
}

/// `a` is at least as specialized as `b` when `b`'s patterns can deduce
/// from `a`'s patterns treated as concrete arguments.
fn at_least_as_specialized(arena: &mut Arena, a: &PartialSpec, b: &PartialSpec) -> bool {
    if a.args.len() != b.args.len() {
        return false;
    }
    let b_names: Vec<StrId> = b.params.iter().map(|p| p.name).collect();
    let mut map = SubstMap::new();
    a.args
        .iter()
        .zip(&b.args)
        .all(|(&arg_a, &pat_b)| unify(arena, pat_b, arg_a, &b_names, &mut map))
}

fn more_specialized(arena: &mut Arena, a: &PartialSpec, b: &PartialSpec) -> bool {
    at_least_as_specialized(arena, a, b) && !at_least_as_specialized(arena, b, a)
}

// ------------------------------------------------------------
// Parameter binding
// ------------------------------------------------------------

/// Bind a primary template's parameters to explicit arguments, applying
/// defaults and collecting trailing pack arguments.
pub fn bind_params(
    arena: &mut Arena,
    strings: &mut StringTable,
    params: &[TemplateParam],
    args: &[NodeId],
    loc: SourceLoc,
) -> Result<SubstMap, Diagnostic> {
    let mut map = SubstMap::new();
    let mut ai = 0usize;
    for (pi, p) in params.iter().enumerate() {
        if p.is_pack {
            // Trailing pack swallows the rest.
            let rest: Vec<NodeId> = args[ai.min(args.len())..].to_vec();
            let is_type_pack = matches!(p.kind, TemplateParamKind::Type { .. });
            if is_type_pack {
                map.bind(p.name, Binding::TypePack(rest));
            } else {
                map.bind(p.name, Binding::ExprPack(rest));
            }
            ai = args.len();
            continue;
        }
        let arg = if ai < args.len() {
            let a = args[ai];
            ai += 1;
            a
        } else {
            // Defaults may reference earlier parameters.
            let default = match &p.kind {
                TemplateParamKind::Type { default, .. } => *default,
                TemplateParamKind::NonType { default, .. } => *default,
                TemplateParamKind::Template => None,
            };
            let Some(d) = default else {
                return Err(Diagnostic::error(
                    loc,
                    format!(
                        "too few template arguments: parameter {} has no default",
                        pi + 1
                    ),
                ));
            };
            let mut subst = Substituter {
                arena,
                strings,
                map: &map,
                sfinae: false,
                pack_index: None,
                skip_member_bodies: false,
            };
            subst.subst(d).map_err(|e| e.into_diagnostic(loc))?
        };
        match p.kind {
            TemplateParamKind::Type { .. } | TemplateParamKind::Template => {
                map.bind(p.name, Binding::Type(arg));
            }
            TemplateParamKind::NonType { .. } => {
                map.bind(p.name, Binding::Expr(arg));
            }
        }
    }
    if ai < args.len() {
        return Err(Diagnostic::error(
            loc,
            format!("too many template arguments: expected {}, got {}", params.len(), args.len()),
        ));
    }
    Ok(map)
}

// ------------------------------------------------------------
// Substitution
// ------------------------------------------------------------

/// Pure-function substitution over AST indices: clones the stored subtree,
/// replacing template-parameter references with their bindings and
/// expanding packs, folds and `sizeof...`.
pub struct Substituter<'a> {
    pub arena: &'a mut Arena,
    pub strings: &'a mut StringTable,
    pub map: &'a SubstMap,
    pub sfinae: bool,
    /// Set while expanding one element of a pack: overrides pack bindings
    /// with the element at this index.
    pub pack_index: Option<usize>,
    /// Class instantiation keeps member function declarations but drops
    /// their bodies; the lazy registry materializes them on first use.
    pub skip_member_bodies: bool,
}

impl<'a> Substituter<'a> {
    pub fn subst(&mut self, root: NodeId) -> Result<NodeId, SubstError> {
        let node = self.arena.get(root).clone();
        let loc = node.loc;
        match node.kind {
            NodeKind::TypeSpec(t) => self.subst_type_spec(t, loc),
            NodeKind::Expr(e) => self.subst_expr(e, loc),
            NodeKind::Stmt(s) => self.subst_stmt(s, loc),
            NodeKind::Decl(d) => self.subst_decl(d, loc),
        }
    }

    fn subst_list(&mut self, ids: &[NodeId]) -> Result<Vec<NodeId>, SubstError> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            // Pack expansions multiply into N elements.
            let node = self.arena.get(id).clone();
            match node.kind {
                NodeKind::Expr(Expr::PackExpansion { pattern }) => {
                    let Some(pack_name) = self.find_pack_name(pattern) else {
                        return Err(self.fail("pack expansion without a pack parameter"));
                    };
                    let len = self.map.pack_len(pack_name).unwrap_or(0);
                    for i in 0..len {
                        let prev = self.pack_index.replace(i);
                        let e = self.subst(pattern)?;
                        self.pack_index = prev;
                        out.push(e);
                    }
                }
                NodeKind::TypeSpec(ref t) if t.is_pack => {
                    if let Some(pack_name) = self.type_pack_name(t) {
                        let len = self.map.pack_len(pack_name).unwrap_or(0);
                        for i in 0..len {
                            let prev = self.pack_index.replace(i);
                            let e = self.subst(id)?;
                            self.pack_index = prev;
                            out.push(e);
                        }
                    } else {
                        out.push(self.subst(id)?);
                    }
                }
                NodeKind::Decl(Decl::Param { is_pack: true, .. }) => {
                    // Function parameter pack: expand to one param per
                    // element of the referenced type pack.
                    let Some(pack_name) = self.param_pack_name(id) else {
                        out.push(self.subst(id)?);
                        continue;
                    };
                    let len = self.map.pack_len(pack_name).unwrap_or(0);
                    for i in 0..len {
                        let prev = self.pack_index.replace(i);
                        let e = self.subst(id)?;
                        self.pack_index = prev;
                        out.push(e);
                    }
                }
                _ => out.push(self.subst(id)?),
            }
        }
        Ok(out)
    }

    fn fail(&self, msg: impl Into<String>) -> SubstError {
        let msg = msg.into();
        if self.sfinae {
            SubstError::Sfinae(msg)
        } else {
            SubstError::Hard(Diagnostic::error_here(msg))
        }
    }

    /// First pack-bound name referenced in a subtree.
    fn find_pack_name(&self, root: NodeId) -> Option<StrId> {
        let node = self.arena.get(root);
        match &node.kind {
            NodeKind::Expr(Expr::Ident { name }) if self.map.pack_len(*name).is_some() => {
                Some(*name)
            }
            NodeKind::Expr(Expr::Call { callee, args }) => self
                .find_pack_name(*callee)
                .or_else(|| args.iter().find_map(|&a| self.find_pack_name(a))),
            NodeKind::Expr(Expr::Binary { lhs, rhs, .. }) => self
                .find_pack_name(*lhs)
                .or_else(|| self.find_pack_name(*rhs)),
            NodeKind::Expr(Expr::Unary { operand, .. }) => self.find_pack_name(*operand),
            NodeKind::Expr(Expr::Member { base, .. }) => self.find_pack_name(*base),
            NodeKind::Expr(Expr::Cast { expr, .. }) => self.find_pack_name(*expr),
            NodeKind::TypeSpec(t) => self.type_pack_name(t),
            _ => None,
        }
    }

    fn type_pack_name(&self, t: &TypeSpec) -> Option<StrId> {
        match &t.core {
            CoreType::Named { path, name, .. }
                if path.is_empty() && self.map.pack_len(*name).is_some() =>
            {
                Some(*name)
            }
            _ => None,
        }
    }

    fn param_pack_name(&self, param: NodeId) -> Option<StrId> {
        let Some(Decl::Param { ty, .. }) = self.arena.as_decl(param) else {
            return None;
        };
        let t = self.arena.as_type_spec(*ty)?;
        self.type_pack_name(t)
    }

    fn pack_element(&self, binding: &Binding) -> Option<NodeId> {
        let i = self.pack_index?;
        match binding {
            Binding::TypePack(v) | Binding::ExprPack(v) => v.get(i).copied(),
            _ => None,
        }
    }

    fn subst_type_spec(&mut self, t: TypeSpec, loc: SourceLoc) -> Result<NodeId, SubstError> {
        if let CoreType::Named {
            ref path,
            name,
            ref template_args,
            ..
        } = t.core
            && path.is_empty()
            && template_args.is_empty()
            && let Some(binding) = self.map.get(name).cloned()
        {
            let replacement = match &binding {
                Binding::Type(n) => Some(*n),
                Binding::TypePack(_) => self.pack_element(&binding),
                _ => None,
            };
            if let Some(rep) = replacement {
                // Merge: replacement core + its derived chain, then the
                // pattern's own derived chain and qualifiers on top.
                let rep_spec = self
                    .arena
                    .as_type_spec(rep)
                    .cloned()
                    .ok_or_else(|| self.fail("type argument expected for type parameter"))?;
                let mut merged = rep_spec;
                merged.is_const |= t.is_const;
                merged.is_volatile |= t.is_volatile;
                // Reference-collapsing at the AST level: && applied to an
                // lvalue reference stays an lvalue reference.
                for d in &t.derived {
                    match d {
                        DerivedType::RValueRef
                            if merged.derived.last() == Some(&DerivedType::LValueRef) => {}
                        DerivedType::LValueRef
                            if merged.derived.last() == Some(&DerivedType::RValueRef) =>
                        {
                            merged.derived.pop();
                            merged.derived.push(DerivedType::LValueRef);
                        }
                        other => {
                            let other = other.clone();
                            let substituted = match other {
                                DerivedType::Array { len } => DerivedType::Array {
                                    len: match len {
                                        Some(l) => Some(self.subst(l)?),
                                        None => None,
                                    },
                                },
                                DerivedType::Function { params, variadic } => {
                                    DerivedType::Function {
                                        params: self.subst_list(&params)?,
                                        variadic,
                                    }
                                }
                                o => o,
                            };
                            merged.derived.push(substituted);
                        }
                    }
                }
                merged.is_pack = false;
                return Ok(self.arena.type_spec(merged, loc));
            }
            if matches!(binding, Binding::Expr(_) | Binding::ExprPack(_)) {
                return Err(self.fail(format!(
                    "non-type argument used where a type was required for '{}'",
                    self.strings.resolve(name)
                )));
            }
        }

        // General case: substitute children.
        let core = match t.core {
            CoreType::Named {
                path,
                name,
                template_args,
                is_typename,
            } => CoreType::Named {
                path,
                name,
                template_args: self.subst_list(&template_args)?,
                is_typename,
            },
            CoreType::Decltype(e) => CoreType::Decltype(self.subst(e)?),
            other => other,
        };
        let mut derived = Vec::with_capacity(t.derived.len());
        for d in t.derived {
            derived.push(match d {
                DerivedType::Array { len } => DerivedType::Array {
                    len: match len {
                        Some(l) => Some(self.subst(l)?),
                        None => None,
                    },
                },
                DerivedType::Function { params, variadic } => DerivedType::Function {
                    params: self.subst_list(&params)?,
                    variadic,
                },
                other => other,
            });
        }
        Ok(self.arena.type_spec(
            TypeSpec {
                core,
                is_const: t.is_const,
                is_volatile: t.is_volatile,
                derived,
                is_pack: false,
            },
            loc,
        ))
    }

    fn subst_expr(&mut self, e: Expr, loc: SourceLoc) -> Result<NodeId, SubstError> {
        let out = match e {
            Expr::Ident { name } => {
                if let Some(binding) = self.map.get(name).cloned() {
                    match &binding {
                        Binding::Expr(n) => return self.subst_cloned(*n),
                        Binding::ExprPack(_) => {
                            if let Some(el) = self.pack_element(&binding) {
                                return self.subst_cloned(el);
                            }
                            return Err(self.fail("parameter pack used without expansion"));
                        }
                        Binding::Type(_) | Binding::TypePack(_) => {
                            // A type used as an expression: functional-cast
                            // contexts handle this at the call site; bare use
                            // is a substitution failure.
                            return Err(self.fail(format!(
                                "type parameter '{}' used as a value",
                                self.strings.resolve(name)
                            )));
                        }
                    }
                }
                Expr::Ident { name }
            }
            Expr::SizeofPack { name } => {
                let Some(len) = self.map.pack_len(name) else {
                    return Err(self.fail(format!(
                        "'sizeof...' on '{}' which is not a parameter pack",
                        self.strings.resolve(name)
                    )));
                };
                Expr::IntLit {
                    value: len as u64,
                    suffix: IntSuffix::None,
                }
            }
            Expr::Fold {
                kind,
                op,
                left,
                right,
            } => {
                return self.expand_fold(kind, op, left, right, loc);
            }
            Expr::PackExpansion { pattern } => {
                // Bare expansion outside a list context folds into a comma
                // chain; list contexts never reach here.
                let Some(pack_name) = self.find_pack_name(pattern) else {
                    return Err(self.fail("pack expansion without a pack parameter"));
                };
                let len = self.map.pack_len(pack_name).unwrap_or(0);
                let mut result: Option<NodeId> = None;
                for i in 0..len {
                    let prev = self.pack_index.replace(i);
                    let e2 = self.subst(pattern)?;
                    self.pack_index = prev;
                    result = Some(match result {
                        None => e2,
                        Some(acc) => self.arena.expr(
                            Expr::Binary {
                                op: crate::ast::BinaryOp::Comma,
                                lhs: acc,
                                rhs: e2,
                            },
                            loc,
                        ),
                    });
                }
                return result.ok_or_else(|| self.fail("empty pack expansion"));
            }
            Expr::Member {
                base,
                member,
                is_arrow,
                template_args,
            } => Expr::Member {
                base: self.subst(base)?,
                member,
                is_arrow,
                template_args: self.subst_list(&template_args)?,
            },
            Expr::Call { callee, args } => Expr::Call {
                callee: self.subst(callee)?,
                args: self.subst_list(&args)?,
            },
            Expr::Subscript { base, index } => Expr::Subscript {
                base: self.subst(base)?,
                index: self.subst(index)?,
            },
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: self.subst(operand)?,
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op,
                lhs: self.subst(lhs)?,
                rhs: self.subst(rhs)?,
            },
            Expr::Assign { op, lhs, rhs } => Expr::Assign {
                op,
                lhs: self.subst(lhs)?,
                rhs: self.subst(rhs)?,
            },
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => Expr::Ternary {
                cond: self.subst(cond)?,
                then_expr: self.subst(then_expr)?,
                else_expr: self.subst(else_expr)?,
            },
            Expr::Cast { kind, ty, expr } => Expr::Cast {
                kind,
                ty: self.subst(ty)?,
                expr: self.subst(expr)?,
            },
            Expr::Sizeof { arg, is_type } => Expr::Sizeof {
                arg: self.subst(arg)?,
                is_type,
            },
            Expr::Alignof { arg } => Expr::Alignof {
                arg: self.subst(arg)?,
            },
            Expr::Typeid { arg, is_type } => Expr::Typeid {
                arg: self.subst(arg)?,
                is_type,
            },
            Expr::QualifiedId {
                path,
                name,
                template_args,
                from_root,
            } => Expr::QualifiedId {
                path,
                name,
                template_args: self.subst_list(&template_args)?,
                from_root,
            },
            Expr::New {
                ty,
                array_len,
                args,
            } => Expr::New {
                ty: self.subst(ty)?,
                array_len: match array_len {
                    Some(l) => Some(self.subst(l)?),
                    None => None,
                },
                args: self.subst_list(&args)?,
            },
            Expr::Delete { expr, is_array } => Expr::Delete {
                expr: self.subst(expr)?,
                is_array,
            },
            Expr::InitList { elems } => Expr::InitList {
                elems: self.subst_list(&elems)?,
            },
            Expr::TypeTraitCall { trait_, args } => Expr::TypeTraitCall {
                trait_,
                args: self.subst_list(&args)?,
            },
            Expr::Lambda {
                captures,
                template_params,
                params,
                ret,
                body,
                is_mutable,
            } => Expr::Lambda {
                captures,
                template_params,
                params: self.subst_list(&params)?,
                ret: match ret {
                    Some(r) => Some(self.subst(r)?),
                    None => None,
                },
                body: self.subst(body)?,
                is_mutable,
            },
            leaf => leaf,
        };
        Ok(self.arena.expr(out, loc))
    }

    /// Bindings may point at nodes that themselves need a fresh clone so no
    /// subtree is shared between instantiations.
    fn subst_cloned(&mut self, id: NodeId) -> Result<NodeId, SubstError> {
        Ok(self.arena.clone_subtree(id))
    }

    /// Expand a fold expression per C++20 semantics.
    fn expand_fold(
        &mut self,
        kind: FoldKind,
        op: crate::ast::BinaryOp,
        left: Option<NodeId>,
        right: Option<NodeId>,
        loc: SourceLoc,
    ) -> Result<NodeId, SubstError> {
        // The pack operand is whichever side references a pack: both
        // `(init op ... op pack)` and `(pack op ... op init)` are legal.
        let pack_side = match kind {
            FoldKind::UnaryRight => left,
            FoldKind::UnaryLeft => right,
            FoldKind::Binary => {
                let left_has = left.is_some_and(|l| self.find_pack_name(l).is_some());
                if left_has { left } else { right }
            }
        }
        .ok_or_else(|| self.fail("fold expression missing its pack operand"))?;
        let Some(pack_name) = self.find_pack_name(pack_side) else {
            return Err(self.fail("fold expression does not reference a parameter pack"));
        };
        let len = self.map.pack_len(pack_name).unwrap_or(0);
        let mut elems = Vec::with_capacity(len);
        for i in 0..len {
            let prev = self.pack_index.replace(i);
            let e = self.subst(pack_side)?;
            self.pack_index = prev;
            elems.push(e);
        }

        match kind {
            // (pack op ...): right fold E1 op (E2 op (... op En))
            FoldKind::UnaryRight => {
                let mut iter = elems.into_iter().rev();
                let mut acc = iter
                    .next()
                    .ok_or_else(|| self.fail("empty fold over pack with no init"))?;
                for e in iter {
                    acc = self.arena.expr(Expr::Binary { op, lhs: e, rhs: acc }, loc);
                }
                Ok(acc)
            }
            // (... op pack): left fold ((E1 op E2) op ...) op En
            FoldKind::UnaryLeft => {
                let mut iter = elems.into_iter();
                let mut acc = iter
                    .next()
                    .ok_or_else(|| self.fail("empty fold over pack with no init"))?;
                for e in iter {
                    acc = self.arena.expr(Expr::Binary { op, lhs: acc, rhs: e }, loc);
                }
                Ok(acc)
            }
            // (init op ... op pack) / (pack op ... op init): fold starting
            // at the non-pack operand.
            FoldKind::Binary => {
                let init = if Some(pack_side) == left { right } else { left }
                    .ok_or_else(|| self.fail("binary fold missing init operand"))?;
                let mut acc = self.subst(init)?;
                for e in elems {
                    acc = self.arena.expr(Expr::Binary { op, lhs: acc, rhs: e }, loc);
                }
                Ok(acc)
            }
        }
    }

    fn subst_stmt(&mut self, s: Stmt, loc: SourceLoc) -> Result<NodeId, SubstError> {
        let out = match s {
            Stmt::Compound { stmts } => Stmt::Compound {
                stmts: self.subst_list(&stmts)?,
            },
            Stmt::If {
                init,
                cond,
                then_branch,
                else_branch,
                is_constexpr,
            } => Stmt::If {
                init: match init {
                    Some(i) => Some(self.subst(i)?),
                    None => None,
                },
                cond: self.subst(cond)?,
                then_branch: self.subst(then_branch)?,
                else_branch: match else_branch {
                    Some(e) => Some(self.subst(e)?),
                    None => None,
                },
                is_constexpr,
            },
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => Stmt::For {
                init: match init {
                    Some(i) => Some(self.subst(i)?),
                    None => None,
                },
                cond: match cond {
                    Some(c) => Some(self.subst(c)?),
                    None => None,
                },
                step: match step {
                    Some(s2) => Some(self.subst(s2)?),
                    None => None,
                },
                body: self.subst(body)?,
            },
            Stmt::RangeFor { decl, range, body } => Stmt::RangeFor {
                decl: self.subst(decl)?,
                range: self.subst(range)?,
                body: self.subst(body)?,
            },
            Stmt::While { cond, body } => Stmt::While {
                cond: self.subst(cond)?,
                body: self.subst(body)?,
            },
            Stmt::DoWhile { body, cond } => Stmt::DoWhile {
                body: self.subst(body)?,
                cond: self.subst(cond)?,
            },
            Stmt::Switch { cond, body } => Stmt::Switch {
                cond: self.subst(cond)?,
                body: self.subst(body)?,
            },
            Stmt::Case { value } => Stmt::Case {
                value: match value {
                    Some(v) => Some(self.subst(v)?),
                    None => None,
                },
            },
            Stmt::Return { value } => Stmt::Return {
                value: match value {
                    Some(v) => Some(self.subst(v)?),
                    None => None,
                },
            },
            Stmt::Try { body, handlers } => Stmt::Try {
                body: self.subst(body)?,
                handlers: self.subst_list(&handlers)?,
            },
            Stmt::Catch { param, body } => Stmt::Catch {
                param: match param {
                    Some(p) => Some(self.subst(p)?),
                    None => None,
                },
                body: self.subst(body)?,
            },
            Stmt::Throw { value } => Stmt::Throw {
                value: match value {
                    Some(v) => Some(self.subst(v)?),
                    None => None,
                },
            },
            Stmt::Expr { expr } => Stmt::Expr {
                expr: self.subst(expr)?,
            },
            Stmt::Decl { decl } => Stmt::Decl {
                decl: self.subst(decl)?,
            },
            leaf => leaf,
        };
        Ok(self.arena.stmt(out, loc))
    }

    fn subst_decl(&mut self, d: Decl, loc: SourceLoc) -> Result<NodeId, SubstError> {
        let out = match d {
            Decl::Class {
                key,
                name,
                bases,
                members,
                is_definition,
            } => Decl::Class {
                key,
                name,
                bases,
                members: self.subst_list(&members)?,
                is_definition,
            },
            Decl::Field {
                name,
                ty,
                init,
                access,
                is_static,
                is_mutable,
            } => Decl::Field {
                name,
                ty: self.subst(ty)?,
                init: match init {
                    Some(i) => Some(self.subst(i)?),
                    None => None,
                },
                access,
                is_static,
                is_mutable,
            },
            Decl::Function {
                name,
                class,
                params,
                ret,
                body,
                specs,
                access,
                storage,
            } => Decl::Function {
                name,
                class,
                params: self.subst_list(&params)?,
                ret: self.subst(ret)?,
                body: match body {
                    Some(_) if self.skip_member_bodies => None,
                    Some(b) => Some(self.subst(b)?),
                    None => None,
                },
                specs: self.subst_specs(specs)?,
                access,
                storage,
            },
            Decl::Constructor {
                class,
                params,
                init_list,
                body,
                specs,
                access,
            } => {
                let mut new_inits = Vec::with_capacity(init_list.len());
                for (target, args) in init_list {
                    new_inits.push((target, self.subst_list(&args)?));
                }
                Decl::Constructor {
                    class,
                    params: self.subst_list(&params)?,
                    init_list: new_inits,
                    body: match body {
                        Some(b) => Some(self.subst(b)?),
                        None => None,
                    },
                    specs: self.subst_specs(specs)?,
                    access,
                }
            }
            Decl::Destructor {
                class,
                body,
                specs,
                access,
            } => Decl::Destructor {
                class,
                body: match body {
                    Some(b) => Some(self.subst(b)?),
                    None => None,
                },
                specs: self.subst_specs(specs)?,
                access,
            },
            Decl::Variable {
                name,
                ty,
                init,
                storage,
                is_constexpr,
                is_constinit,
                is_inline,
            } => Decl::Variable {
                name,
                ty: self.subst(ty)?,
                init: match init {
                    Some(i) => Some(self.subst(i)?),
                    None => None,
                },
                storage,
                is_constexpr,
                is_constinit,
                is_inline,
            },
            Decl::Param {
                name,
                ty,
                default,
                is_pack,
            } => {
                let ty2 = self.subst(ty)?;
                Decl::Param {
                    name,
                    ty: ty2,
                    default: match default {
                        Some(d2) => Some(self.subst(d2)?),
                        None => None,
                    },
                    // Once substituted against a concrete pack element the
                    // parameter is ordinary.
                    is_pack: is_pack && self.pack_index.is_none(),
                }
            }
            Decl::StaticAssert { cond, message } => Decl::StaticAssert {
                cond: self.subst(cond)?,
                message,
            },
            Decl::Alias { name, target } => Decl::Alias {
                name,
                target: self.subst(target)?,
            },
            Decl::Typedef { name, target } => Decl::Typedef {
                name,
                target: self.subst(target)?,
            },
            Decl::StructuredBinding {
                names,
                init,
                is_ref,
            } => Decl::StructuredBinding {
                names,
                init: self.subst(init)?,
                is_ref,
            },
            leaf => leaf,
        };
        Ok(self.arena.decl(out, loc))
    }

    fn subst_specs(&mut self, mut specs: crate::ast::FuncSpecs) -> Result<crate::ast::FuncSpecs, SubstError> {
        if let Some(Some(e)) = specs.noexcept {
            specs.noexcept = Some(Some(self.subst(e)?));
        }
        if let Some(r) = specs.requires_clause {
            specs.requires_clause = Some(self.subst(r)?);
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn parse(src: &str) -> (crate::parser::ParseOutput, StringTable) {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let out = Parser::new(toks, &mut strings).parse();
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        (out, strings)
    }

    fn int_type(arena: &mut Arena) -> NodeId {
        arena.type_spec(
            TypeSpec {
                core: CoreType::Primitive(crate::types::Primitive::Int),
                is_const: false,
                is_volatile: false,
                derived: Vec::new(),
                is_pack: false,
            },
            SourceLoc::unknown(),
        )
    }

    fn int_ptr_type(arena: &mut Arena) -> NodeId {
        arena.type_spec(
            TypeSpec {
                core: CoreType::Primitive(crate::types::Primitive::Int),
                is_const: false,
                is_volatile: false,
                derived: vec![DerivedType::Pointer {
                    is_const: false,
                    is_volatile: false,
                }],
                is_pack: false,
            },
            SourceLoc::unknown(),
        )
    }

    #[test]
    fn test_instantiation_cached_by_canonical_args() {
        let (mut out, mut strings) = parse("template<typename T> struct Box { T value; };");
        let name = strings.intern("Box");
        let a1 = int_type(&mut out.arena);
        let a2 = int_type(&mut out.arena);
        let loc = SourceLoc::unknown();
        let i1 = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[a1], loc)
            .unwrap();
        let i2 = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[a2], loc)
            .unwrap();
        assert_eq!(i1, i2);
        assert!(strings.resolve(i1).starts_with("Box$"));
    }

    #[test]
    fn test_partial_specialization_wins_for_pointer() {
        let (mut out, mut strings) = parse(
            "template<typename T> struct S { int v; };\n\
             template<typename T> struct S<T*> { int w; };",
        );
        let name = strings.intern("S");
        let loc = SourceLoc::unknown();
        let arg = int_ptr_type(&mut out.arena);
        let inst = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[arg], loc)
            .unwrap();
        let decl = out.registry.instantiated_decl(inst).unwrap();
        let Some(Decl::Class { members, .. }) = out.arena.as_decl(decl) else {
            panic!()
        };
        // The pointer specialization's member is `w`.
        let Some(Decl::Field { name: fname, .. }) = out.arena.as_decl(members[0]) else {
            panic!()
        };
        assert_eq!(strings.resolve(*fname), "w");
    }

    #[test]
    fn test_full_specialization_beats_partial() {
        let (mut out, mut strings) = parse(
            "template<typename T> struct S { int v; };\n\
             template<typename T> struct S<T*> { int w; };\n\
             template<> struct S<int*> { int exact; };",
        );
        let name = strings.intern("S");
        let loc = SourceLoc::unknown();
        let arg = int_ptr_type(&mut out.arena);
        let inst = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[arg], loc)
            .unwrap();
        let decl = out.registry.instantiated_decl(inst).unwrap();
        let Some(Decl::Class { members, .. }) = out.arena.as_decl(decl) else {
            panic!()
        };
        let Some(Decl::Field { name: fname, .. }) = out.arena.as_decl(members[0]) else {
            panic!()
        };
        assert_eq!(strings.resolve(*fname), "exact");
    }

    #[test]
    fn test_unify_strips_reference_and_pointer() {
        let (mut out, mut strings) = parse("template<typename T> struct S { };");
        let _ = out.registry;
        let t = strings.intern("T");
        let param_names = vec![t];

        // Pattern T& vs int& deduces T = int.
        let pattern = out.arena.type_spec(
            TypeSpec {
                core: CoreType::Named {
                    path: vec![],
                    name: t,
                    template_args: vec![],
                    is_typename: false,
                },
                is_const: false,
                is_volatile: false,
                derived: vec![DerivedType::LValueRef],
                is_pack: false,
            },
            SourceLoc::unknown(),
        );
        let arg = out.arena.type_spec(
            TypeSpec {
                core: CoreType::Primitive(crate::types::Primitive::Int),
                is_const: false,
                is_volatile: false,
                derived: vec![DerivedType::LValueRef],
                is_pack: false,
            },
            SourceLoc::unknown(),
        );
        let mut map = SubstMap::new();
        assert!(unify(&mut out.arena, pattern, arg, &param_names, &mut map));
        let Some(Binding::Type(bound)) = map.get(t) else {
            panic!()
        };
        let spec = out.arena.as_type_spec(*bound).unwrap();
        assert!(spec.derived.is_empty());
        assert!(matches!(
            spec.core,
            CoreType::Primitive(crate::types::Primitive::Int)
        ));
    }

    #[test]
    fn test_partial_ordering_tie_is_diagnosed() {
        // S<T, int> and S<int, T> both match S<int, int>; neither is more
        // specialized.
        let (mut out, mut strings) = parse(
            "template<typename A, typename B> struct S { };\n\
             template<typename T> struct S<T, int> { };\n\
             template<typename T> struct S<int, T> { };",
        );
        let name = strings.intern("S");
        let loc = SourceLoc::unknown();
        let a1 = int_type(&mut out.arena);
        let a2 = int_type(&mut out.arena);
        let err = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[a1, a2], loc)
            .unwrap_err();
        assert!(err.message.contains("ambiguous"), "{}", err.message);
    }

    #[test]
    fn test_lazy_member_not_instantiated_with_class() {
        let (mut out, mut strings) = parse(
            "template<typename T> struct Holder { T value; T get() { return value; } };",
        );
        let name = strings.intern("Holder");
        let loc = SourceLoc::unknown();
        let arg = int_type(&mut out.arena);
        let inst = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[arg], loc)
            .unwrap();
        let get = strings.intern("get");
        assert!(out
            .registry
            .needs_member_instantiation(&mut strings, inst, get));
        let node = out
            .registry
            .instantiate_member(&mut out.arena, &mut strings, inst, get, loc)
            .unwrap();
        assert!(node.is_some());
        // Second request: already instantiated.
        assert!(!out
            .registry
            .needs_member_instantiation(&mut strings, inst, get));
    }

    #[test]
    fn test_sizeof_pack_substitution() {
        let (mut out, mut strings) = parse(
            "template<typename... Ts> struct Count { static const int n = sizeof...(Ts); };",
        );
        let name = strings.intern("Count");
        let loc = SourceLoc::unknown();
        let a1 = int_type(&mut out.arena);
        let a2 = int_ptr_type(&mut out.arena);
        let inst = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[a1, a2], loc)
            .unwrap();
        let decl = out.registry.instantiated_decl(inst).unwrap();
        let Some(Decl::Class { members, .. }) = out.arena.as_decl(decl) else {
            panic!()
        };
        let Some(Decl::Field { init: Some(init), .. }) = out.arena.as_decl(members[0]) else {
            panic!()
        };
        match out.arena.as_expr(*init) {
            Some(Expr::IntLit { value, .. }) => assert_eq!(*value, 2),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_sfinae_discards_candidate_silently() {
        let (mut out, mut strings) = parse(
            "template<typename A, typename B> int pair_first(A a, B b) { return 0; }",
        );
        let name = strings.intern("pair_first");
        let cands = out.registry.function_templates_named(name).to_vec();
        assert_eq!(cands.len(), 1);
        // One argument against a two-parameter template: substitution
        // failure, candidate discarded with no diagnostic.
        let arg = int_type(&mut out.arena);
        let got = out
            .registry
            .substitute_function(
                &mut out.arena,
                &mut strings,
                &cands[0],
                &[arg],
                SourceLoc::unknown(),
            )
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_depth_limit_diagnosed() {
        let (mut out, mut strings) = parse("template<typename T> struct W { };");
        out.registry.set_depth_limit(0);
        let name = strings.intern("W");
        let arg = int_type(&mut out.arena);
        let err = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[arg], SourceLoc::unknown())
            .unwrap_err();
        assert!(err.message.contains("depth limit"));
    }

    #[test]
    fn test_instantiated_name_reserves_no_substring() {
        // "_unknown" stays a legal user identifier: instantiation suffixes
        // use '$', which cannot occur in identifiers.
        let (mut out, mut strings) = parse("template<typename T> struct _unknown { T v; };");
        let name = strings.intern("_unknown");
        let loc = SourceLoc::unknown();
        let arg = int_type(&mut out.arena);
        let inst = out
            .registry
            .instantiate_class(&mut out.arena, &mut strings, name, &[arg], loc)
            .unwrap();
        let rendered = strings.resolve(inst);
        assert!(rendered.starts_with("_unknown$"));
    }
}
