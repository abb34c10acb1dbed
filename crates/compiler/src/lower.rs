//! AST → IR conversion
//!
//! Walks the parsed (and template-instantiated) AST and produces linear IR
//! per function, plus the module-level side tables the backend needs:
//! globals, vtables, RTTI records and the class layout table.
//!
//! The converter owns the semantics that make C++ lowering interesting:
//! - a scope stack that emits destructor calls in reverse construction
//!   order on every exit path (fallthrough, `break`, `continue`, `return`,
//!   `goto` out of scopes; `goto` past an initialization into a scope is a
//!   diagnostic)
//! - copy elision: `T x = T(args)` and prvalue returns construct in place
//!   (exactly one constructor call, no copy); NRVO when every `return`
//!   names the same local
//! - virtual dispatch through the vptr with this-adjustment for secondary
//!   bases
//! - try/throw lowered to a common try-region IR that the backend maps to
//!   Itanium EH or SEH
//! - `typeid` / `dynamic_cast` against per-class RTTI records
//!   `{name-hash u64, num-bases u64, base-ptrs...}`

use crate::ast::{
    Access, Arena, AssignOp, BinaryOp, CastKind, CoreType, Decl, DerivedType, Expr, NodeId,
    NodeKind, Stmt, Storage, TypeSpec, UnaryOp,
};
use crate::config::{CompilerConfig, TargetAbi};
use crate::consteval::{EvalContext, Evaluator, Value};
use crate::diag::{Diagnostic, SourceLoc};
use crate::ir::{HandlerSpec, Instr, IrFunction, Label, Opcode, Payload, ValueId};
use crate::mangle::{FunctionName, MangleScheme, mangle_function};
use crate::strings::{StrId, StringTable};
use crate::templates::TemplateRegistry;
use crate::types::{Primitive, Quals, RefKind, TypeId, TypeKind, TypeRegistry};
use std::collections::HashMap;

/// Field of a laid-out class.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: StrId,
    pub ty: TypeId,
    pub offset: u64,
}

/// Layout and dispatch info for one class.
#[derive(Debug, Clone, Default)]
pub struct ClassInfo {
    pub fields: Vec<FieldLayout>,
    pub size: u64,
    pub align: u64,
    pub bases: Vec<StrId>,
    /// Virtual slots in vtable order: (name, mangled symbol).
    pub vslots: Vec<(StrId, StrId)>,
    pub has_vptr: bool,
    pub dtor: Option<NodeId>,
    pub ctors: Vec<NodeId>,
    pub methods: HashMap<StrId, NodeId>,
    pub is_abstract: bool,
}

/// A module-level variable.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: StrId,
    pub size: u64,
    pub align: u64,
    /// Initial bytes; empty means zero-initialized (.bss).
    pub init: Vec<u8>,
    pub weak: bool,
}

/// RTTI record per polymorphic class: name hash, then base record symbols.
#[derive(Debug, Clone)]
pub struct RttiRecord {
    pub class: StrId,
    pub symbol: StrId,
    pub name_hash: u64,
    pub base_symbols: Vec<StrId>,
}

#[derive(Debug, Clone)]
pub struct VtableDef {
    pub class: StrId,
    pub symbol: StrId,
    /// Function symbols in slot order.
    pub slots: Vec<StrId>,
}

pub struct LowerOutput {
    pub functions: Vec<IrFunction>,
    pub globals: Vec<GlobalDef>,
    pub vtables: Vec<VtableDef>,
    pub rtti: Vec<RttiRecord>,
    pub diags: Vec<Diagnostic>,
}

/// One lexical scope: objects needing destruction, in construction order.
struct Scope {
    destructibles: Vec<(ValueId, StrId)>,
    /// Scope had any local initialization (for goto-into checks).
    has_init: bool,
}

struct LoopTargets {
    break_label: Label,
    continue_label: Label,
    /// Scope depth at loop entry; break/continue unwind to here.
    depth: usize,
}

pub struct Lowerer<'a> {
    arena: &'a mut Arena,
    strings: &'a mut StringTable,
    types: &'a mut TypeRegistry,
    registry: &'a mut TemplateRegistry,
    config: &'a CompilerConfig,
    scheme: MangleScheme,
    pub eval_ctx: EvalContext,
    classes: HashMap<StrId, ClassInfo>,
    aliases: HashMap<StrId, NodeId>,
    enums: HashMap<StrId, TypeId>,
    functions: Vec<IrFunction>,
    globals: Vec<GlobalDef>,
    vtables: Vec<VtableDef>,
    rtti: Vec<RttiRecord>,
    diags: Vec<Diagnostic>,
    /// Namespace path while collecting.
    ns_path: Vec<StrId>,
    /// Overload sets of free functions, by source name.
    overloads: HashMap<StrId, Vec<NodeId>>,
    /// Functions already lowered (by mangled name), to keep lazy member
    /// instantiation idempotent.
    lowered: HashMap<StrId, ()>,
    /// Pending function declarations to lower after collection.
    pending: Vec<(NodeId, Vec<StrId>)>,
}

/// Per-function lowering state.
struct FnCtx {
    f: IrFunction,
    scopes: Vec<Scope>,
    locals: HashMap<StrId, (ValueId, TypeId)>,
    loops: Vec<LoopTargets>,
    /// goto labels: name → (ir label, scope depth at definition).
    labels: HashMap<StrId, (Label, usize)>,
    /// NRVO: the named local every return statement yields, if any.
    nrvo_local: Option<StrId>,
    ret_type: TypeId,
    /// `this` pointer value for member functions.
    this_val: Option<(ValueId, StrId)>,
}

impl<'a> Lowerer<'a> {
    pub fn new(
        arena: &'a mut Arena,
        strings: &'a mut StringTable,
        types: &'a mut TypeRegistry,
        registry: &'a mut TemplateRegistry,
        config: &'a CompilerConfig,
    ) -> Self {
        let scheme = match config.target {
            TargetAbi::LinuxElf => MangleScheme::Itanium,
            TargetAbi::WindowsCoff => MangleScheme::Msvc,
        };
        Lowerer {
            arena,
            strings,
            types,
            registry,
            config,
            scheme,
            eval_ctx: EvalContext::default(),
            classes: HashMap::new(),
            aliases: HashMap::new(),
            enums: HashMap::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            vtables: Vec::new(),
            rtti: Vec::new(),
            diags: Vec::new(),
            ns_path: Vec::new(),
            overloads: HashMap::new(),
            lowered: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn lower_translation_unit(mut self, root: NodeId) -> LowerOutput {
        self.collect_decl(root);
        self.resolve_deferred_template_args();
        // Virtual member functions are reachable through vtables even when
        // never called directly; lower them with their classes.
        let virtuals: Vec<(StrId, NodeId)> = self
            .classes
            .iter()
            .filter(|(_, info)| info.has_vptr)
            .flat_map(|(&class, info)| {
                info.vslots
                    .iter()
                    .filter_map(|(n, _)| info.methods.get(n).map(|&m| (class, m)))
                    .chain(info.dtor.map(|d| (class, d)))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (class, m) in virtuals {
            self.lower_function_decl(m, Some(class));
        }
        let pending = std::mem::take(&mut self.pending);
        for (decl, ns) in pending {
            self.ns_path = ns;
            self.lower_function_decl(decl, None);
        }
        LowerOutput {
            functions: self.functions,
            globals: self.globals,
            vtables: self.vtables,
            rtti: self.rtti,
            diags: self.diags,
        }
    }

    // ------------------------------------------------------------
    // Collection pass
    // ------------------------------------------------------------

    fn collect_decl(&mut self, id: NodeId) {
        let Some(decl) = self.arena.as_decl(id).cloned() else {
            return;
        };
        match decl {
            Decl::TranslationUnit { decls } | Decl::Namespace { name: None, decls } => {
                for d in decls {
                    self.collect_decl(d);
                }
            }
            Decl::Namespace {
                name: Some(n),
                decls,
            } => {
                self.ns_path.push(n);
                for d in decls {
                    self.collect_decl(d);
                }
                self.ns_path.pop();
            }
            Decl::Class {
                name,
                is_definition: true,
                ..
            } => {
                self.collect_class(id, name);
            }
            Decl::Enum {
                name,
                underlying,
                enumerators,
                ..
            } => {
                let under = underlying
                    .map(|u| self.resolve_type(u))
                    .unwrap_or_else(|| self.types.int());
                let ty = self.types.enum_(name, under);
                self.enums.insert(name, ty);
                self.eval_ctx.enums.insert(name);
                let mut next = 0i64;
                for (ename, val) in enumerators {
                    if let Some(v) = val {
                        match self.eval_const(v) {
                            Ok(value) => next = value.as_i64().unwrap_or(next),
                            Err(d) => self.diags.push(d),
                        }
                    }
                    self.eval_ctx.enumerators.insert(ename, next);
                    next += 1;
                }
            }
            Decl::Alias { name, target } | Decl::Typedef { name, target } => {
                self.aliases.insert(name, target);
            }
            Decl::Template { .. } | Decl::Concept { .. } => {
                // Registered during parsing; instantiated on demand.
            }
            Decl::StaticAssert { cond, message } => {
                let loc = self.arena.get(id).loc;
                match self.eval_const(cond) {
                    Ok(v) => match v.truthy() {
                        Ok(true) => {}
                        Ok(false) => {
                            let msg = message.unwrap_or_else(|| "static assertion failed".into());
                            self.diags
                                .push(Diagnostic::error(loc, format!("static_assert failed: {}", msg)));
                        }
                        Err(d) => self.diags.push(d),
                    },
                    Err(d) => self.diags.push(d),
                }
            }
            Decl::Function { body: Some(_), .. } | Decl::Constructor { .. } | Decl::Destructor { .. } => {
                // Also register constexpr-callable functions for the
                // evaluator before lowering.
                if let Decl::Function { name, .. } = self.arena.as_decl(id).cloned().unwrap() {
                    self.eval_ctx.functions.insert(name, id);
                    self.overloads.entry(name).or_default().push(id);
                }
                self.pending.push((id, self.ns_path.clone()));
            }
            Decl::Function { .. } => {
                // Declaration only: nothing to emit.
            }
            Decl::Variable {
                name,
                ty,
                init,
                storage,
                is_constexpr,
                is_inline,
                ..
            } => {
                self.collect_global(id, name, ty, init, storage, is_constexpr, is_inline);
            }
            Decl::Using { .. } | Decl::UsingDirective { .. } | Decl::Friend { .. } | Decl::Empty => {}
            _ => {}
        }
    }

    fn collect_class(&mut self, id: NodeId, name: StrId) {
        let Some(Decl::Class { bases, members, .. }) = self.arena.as_decl(id).cloned() else {
            return;
        };
        let mut info = ClassInfo::default();
        let mut offset = 0u64;
        let mut align = 1u64;

        // Bases first: their subobjects lay out at the front.
        for b in &bases {
            info.bases.push(b.name);
            if let Some(base_info) = self.classes.get(&b.name) {
                if base_info.has_vptr {
                    info.has_vptr = true;
                }
                // Inherit virtual slots in base order.
                for slot in &base_info.vslots {
                    info.vslots.push(slot.clone());
                }
                offset = align_to(offset, base_info.align.max(1)) + base_info.size;
                align = align.max(base_info.align);
            }
        }

        // Does this class introduce virtual functions?
        let has_own_virtual = members.iter().any(|&m| {
            matches!(
                self.arena.as_decl(m),
                Some(Decl::Function { specs, .. }) if specs.is_virtual
            ) || matches!(
                self.arena.as_decl(m),
                Some(Decl::Destructor { specs, .. }) if specs.is_virtual
            )
        });
        if has_own_virtual && !info.has_vptr {
            info.has_vptr = true;
            offset = align_to(offset, 8) + 8; // vptr at offset 0 of this subobject
            align = align.max(8);
        }

        // Fields and member functions.
        let mut field_names = Vec::new();
        for &m in &members {
            match self.arena.as_decl(m).cloned() {
                Some(Decl::Field {
                    name: fname,
                    ty,
                    is_static,
                    init,
                    ..
                }) => {
                    if is_static {
                        // Static data member becomes a global
                        // `Class::name`; constexpr ones feed the evaluator.
                        if let Some(i) = init
                            && let Ok(v) = self.eval_const(i)
                        {
                            let key = {
                                let c = self.strings.resolve(name).to_string();
                                let f = self.strings.resolve(fname).to_string();
                                self.strings.intern(&format!("{}::{}", c, f))
                            };
                            self.eval_ctx.globals.insert(key, v.clone());
                            self.eval_ctx.globals.insert(fname, v);
                        }
                        continue;
                    }
                    let fty = self.resolve_type(ty);
                    let fsize = self.types.size_of(fty).unwrap_or(8).max(1);
                    let falign = self.types.align_of(fty).unwrap_or(8).max(1);
                    offset = align_to(offset, falign);
                    info.fields.push(FieldLayout {
                        name: fname,
                        ty: fty,
                        offset,
                    });
                    field_names.push(fname);
                    offset += fsize;
                    align = align.max(falign);
                }
                Some(Decl::Function {
                    name: fname, specs, ..
                }) => {
                    info.methods.insert(fname, m);
                    self.eval_ctx.methods.insert((name, fname), m);
                    if specs.is_virtual {
                        let sym = self.mangle_method(name, fname, m);
                        // Override replaces the base slot of the same name.
                        if let Some(slot) = info.vslots.iter_mut().find(|(n, _)| *n == fname) {
                            slot.1 = sym;
                        } else {
                            info.vslots.push((fname, sym));
                        }
                        if specs.is_pure {
                            info.is_abstract = true;
                        }
                    } else if let Some(slot) =
                        info.vslots.iter_mut().find(|(n, _)| *n == fname)
                    {
                        // Implicit override of an inherited virtual.
                        slot.1 = self.mangle_method(name, fname, m);
                    }
                }
                Some(Decl::Constructor { .. }) => {
                    info.ctors.push(m);
                    self.eval_ctx.class_ctors.entry(name).or_default().push(m);
                }
                Some(Decl::Destructor { .. }) => {
                    info.dtor = Some(m);
                }
                Some(Decl::Class {
                    name: nested,
                    is_definition: true,
                    ..
                }) => {
                    self.collect_class(m, nested);
                }
                Some(Decl::StaticAssert { .. }) => self.collect_decl(m),
                _ => {}
            }
        }

        info.size = align_to(offset.max(1), align);
        info.align = align;

        self.types.publish_class_layout(name, info.size, info.align);
        self.types
            .publish_class_bases(name, info.bases.clone());
        self.eval_ctx.classes.insert(name);
        self.eval_ctx.class_fields.insert(name, field_names);
        self.eval_ctx
            .bases
            .insert(name, info.bases.clone());

        // Vtable + RTTI for polymorphic classes.
        if info.has_vptr {
            let vt_sym = {
                let n = self.strings.resolve(name).to_string();
                self.strings.intern(&format!("__vt_{}", n))
            };
            self.vtables.push(VtableDef {
                class: name,
                symbol: vt_sym,
                slots: info.vslots.iter().map(|(_, s)| *s).collect(),
            });
            let rtti_sym = {
                let n = self.strings.resolve(name).to_string();
                self.strings.intern(&format!("__rtti_{}", n))
            };
            let base_syms = info
                .bases
                .iter()
                .map(|b| {
                    let n = self.strings.resolve(*b).to_string();
                    self.strings.intern(&format!("__rtti_{}", n))
                })
                .collect();
            let hash = {
                let n = self.strings.resolve(name);
                fnv1a_hash(n.as_bytes())
            };
            self.rtti.push(RttiRecord {
                class: name,
                symbol: rtti_sym,
                name_hash: hash,
                base_symbols: base_syms,
            });
        }

        self.classes.insert(name, info);
    }

    fn collect_global(
        &mut self,
        id: NodeId,
        name: StrId,
        ty: NodeId,
        init: Option<NodeId>,
        storage: Storage,
        is_constexpr: bool,
        is_inline: bool,
    ) {
        let loc = self.arena.get(id).loc;
        let gty = self.resolve_type(ty);
        let size = self.types.size_of(gty).unwrap_or(8).max(1);
        let align = self.types.align_of(gty).unwrap_or(8).max(1);
        let mut bytes = Vec::new();
        if let Some(i) = init {
            match self.eval_const(i) {
                Ok(v) => {
                    if is_constexpr {
                        self.eval_ctx.globals.insert(name, v.clone());
                    }
                    bytes = value_to_bytes(&v, size);
                }
                Err(d) => {
                    if is_constexpr {
                        self.diags.push(d);
                    }
                    // Non-constant initializers would need a dynamic
                    // initializer function; this subset zero-fills.
                    let _ = loc;
                }
            }
        }
        if storage == Storage::Extern && init.is_none() {
            return; // declaration only
        }
        self.globals.push(GlobalDef {
            name,
            size,
            align,
            init: bytes,
            weak: is_inline,
        });
    }

    /// Deferred non-type template arguments (those referencing static
    /// members of the instantiation being formed) evaluate after the
    /// instantiated scope is populated, iterating to a fixed point; a list
    /// that stops shrinking is a cycle.
    fn resolve_deferred_template_args(&mut self) {
        let mut deferred = self.registry.take_deferred();
        loop {
            if deferred.is_empty() {
                return;
            }
            let before = deferred.len();
            deferred.retain(|d| self.eval_const(d.expr).is_err());
            if deferred.len() == before {
                for d in &deferred {
                    self.diags.push(Diagnostic::error(
                        d.loc,
                        "cyclic dependency while evaluating deferred template argument",
                    ));
                }
                return;
            }
        }
    }

    fn eval_const(&mut self, expr: NodeId) -> Result<Value, Diagnostic> {
        let mut ev = Evaluator::new(
            self.arena,
            self.strings,
            &self.eval_ctx,
            self.config.constexpr_step_limit,
        );
        ev.eval_constant(expr)
    }

    // ------------------------------------------------------------
    // Types
    // ------------------------------------------------------------

    /// Resolve a TypeSpec node to a canonical TypeId, instantiating class
    /// templates on demand (depth-first, before the caller continues).
    pub fn resolve_type(&mut self, spec_id: NodeId) -> TypeId {
        let Some(spec) = self.arena.as_type_spec(spec_id).cloned() else {
            return self.types.int();
        };
        let mut base = match &spec.core {
            CoreType::Primitive(p) => self.types.primitive(*p),
            CoreType::Auto => self.types.int(),
            CoreType::Decltype(_) => self.types.int(),
            CoreType::Named {
                name,
                template_args,
                ..
            } => {
                if !template_args.is_empty() {
                    let loc = self.arena.get(spec_id).loc;
                    match self.registry.instantiate_class(
                        self.arena,
                        self.strings,
                        *name,
                        template_args,
                        loc,
                    ) {
                        Ok(inst) => {
                            // Lay out the instantiated class if new.
                            if !self.classes.contains_key(&inst)
                                && let Some(decl) = self.registry.instantiated_decl(inst)
                            {
                                self.collect_class(decl, inst);
                            }
                            self.types.class(inst)
                        }
                        Err(d) => {
                            self.diags.push(d);
                            self.types.int()
                        }
                    }
                } else if let Some(&alias) = self.aliases.get(name) {
                    self.resolve_type(alias)
                } else if let Some(&e) = self.enums.get(name) {
                    e
                } else if self.classes.contains_key(name) || self.eval_ctx.classes.contains(name) {
                    self.types.class(*name)
                } else {
                    self.types
                        .intern(TypeKind::Dependent { name: *name }, Quals::NONE)
                }
            }
        };
        let quals = Quals {
            is_const: spec.is_const,
            is_volatile: spec.is_volatile,
        };
        if !quals.is_none() {
            base = self.types.with_quals(base, quals);
        }
        for d in &spec.derived {
            base = match d {
                DerivedType::Pointer { is_const, is_volatile } => {
                    let p = self.types.pointer_to(base);
                    if *is_const || *is_volatile {
                        self.types.with_quals(
                            p,
                            Quals {
                                is_const: *is_const,
                                is_volatile: *is_volatile,
                            },
                        )
                    } else {
                        p
                    }
                }
                DerivedType::LValueRef => self.types.reference_to(base, RefKind::LValue),
                DerivedType::RValueRef => self.types.reference_to(base, RefKind::RValue),
                DerivedType::Array { len } => {
                    let n = len.and_then(|l| self.eval_const(l).ok()).and_then(|v| v.as_i64());
                    self.types.array_of(base, n.map(|v| v as u64))
                }
                DerivedType::Function { params, variadic } => {
                    let ptypes: Vec<TypeId> =
                        params.iter().map(|&p| self.param_type(p)).collect();
                    self.types
                        .function(base, ptypes, *variadic, Default::default())
                }
                DerivedType::MemberPointer { class } => self.types.intern(
                    TypeKind::MemberPointer {
                        class: *class,
                        pointee: base,
                    },
                    Quals::NONE,
                ),
            };
        }
        base
    }

    fn param_type(&mut self, param: NodeId) -> TypeId {
        match self.arena.as_decl(param) {
            Some(Decl::Param { ty, .. }) => {
                let ty = *ty;
                self.resolve_type(ty)
            }
            _ => self.types.int(),
        }
    }

    fn mangle_method(&mut self, class: StrId, name: StrId, decl: NodeId) -> StrId {
        let params: Vec<TypeId> = match self.arena.as_decl(decl).cloned() {
            Some(Decl::Function { params, .. }) => {
                params.iter().map(|&p| self.param_type(p)).collect()
            }
            _ => Vec::new(),
        };
        let is_const = matches!(
            self.arena.as_decl(decl),
            Some(Decl::Function { specs, .. }) if specs.is_const
        );
        let f = FunctionName {
            namespaces: &self.ns_path,
            class: Some(class),
            name,
            params: &params,
            is_const_method: is_const,
        };
        let m = mangle_function(self.scheme, self.strings, self.types, &f);
        self.strings.intern(&m)
    }

    // ------------------------------------------------------------
    // Function lowering
    // ------------------------------------------------------------

    fn lower_function_decl(&mut self, id: NodeId, class: Option<StrId>) {
        let loc = self.arena.get(id).loc;
        match self.arena.as_decl(id).cloned() {
            Some(Decl::Function {
                name,
                class: decl_class,
                params,
                ret,
                body: Some(body),
                specs,
                ..
            }) => {
                let class = class.or(decl_class);
                let ret_ty = self.resolve_type(ret);
                let mangled = if let Some(c) = class {
                    self.mangle_method(c, name, id)
                } else {
                    let ptypes: Vec<TypeId> = params.iter().map(|&p| self.param_type(p)).collect();
                    let f = FunctionName {
                        namespaces: &self.ns_path,
                        class: None,
                        name,
                        params: &ptypes,
                        is_const_method: false,
                    };
                    let m = mangle_function(self.scheme, self.strings, self.types, &f);
                    self.strings.intern(&m)
                };
                if self.lowered.contains_key(&mangled) {
                    return;
                }
                self.lowered.insert(mangled, ());
                let mut f = IrFunction::new(mangled, name, ret_ty, loc);
                f.weak = specs.is_inline
                    || class.is_some_and(|c| self.strings.resolve(c).contains('$'));
                let mut ctx = FnCtx {
                    f,
                    scopes: vec![Scope {
                        destructibles: Vec::new(),
                        has_init: false,
                    }],
                    locals: HashMap::new(),
                    loops: Vec::new(),
                    labels: HashMap::new(),
                    nrvo_local: self.detect_nrvo(body),
                    ret_type: ret_ty,
                    this_val: None,
                };

                // Parameter values must occupy ids 0..n (the backend moves
                // the ABI registers into them at entry), so create them all
                // before any instruction, then spill each into an alloca so
                // address-of works.
                let mut incoming: Vec<(ValueId, Option<StrId>, TypeId)> = Vec::new();
                if let Some(c) = class {
                    let this_ty = {
                        let ct = self.types.class(c);
                        self.types.pointer_to(ct)
                    };
                    let v = ctx.f.new_value();
                    ctx.f.params.push((Some(self.strings.intern("this")), this_ty));
                    incoming.push((v, None, this_ty));
                }
                for &p in &params {
                    let (pname, pty) = match self.arena.as_decl(p).cloned() {
                        Some(Decl::Param { name, ty, .. }) => (name, self.resolve_type(ty)),
                        _ => (None, self.types.int()),
                    };
                    let v = ctx.f.new_value();
                    ctx.f.params.push((pname, pty));
                    incoming.push((v, pname, pty));
                }
                for (i, (v, pname, pty)) in incoming.into_iter().enumerate() {
                    let is_this = class.is_some() && i == 0;
                    let size = self.types.size_of(pty).unwrap_or(8).max(1);
                    if is_this {
                        let slot = ctx.f.emit(
                            Opcode::Alloca,
                            Payload::Alloca { size: 8, align: 8 },
                            pty,
                            loc,
                        );
                        ctx.f
                            .emit_void(Opcode::Store, Payload::Store { addr: slot, value: v }, loc);
                        ctx.this_val = Some((slot, class.expect("is_this")));
                        continue;
                    }
                    if let Some(n) = pname {
                        let slot = ctx.f.emit(
                            Opcode::Alloca,
                            Payload::Alloca {
                                size,
                                align: size.min(8),
                            },
                            self.types.pointer_to(pty),
                            loc,
                        );
                        ctx.f
                            .emit_void(Opcode::Store, Payload::Store { addr: slot, value: v }, loc);
                        ctx.locals.insert(n, (slot, pty));
                        ctx.f.locals.push((n, pty, slot));
                    }
                }

                self.pre_scan_labels(body, &mut ctx);
                self.lower_stmt(body, &mut ctx);

                // Implicit return for void / main fallthrough.
                self.emit_scope_destructors(&mut ctx, 0, loc);
                let needs_ret = !matches!(
                    ctx.f.instrs.last().map(|i| i.op),
                    Some(Opcode::Ret)
                );
                if needs_ret {
                    ctx.f.emit_void(Opcode::Ret, Payload::Ret { value: None }, loc);
                }
                self.functions.push(ctx.f);
            }
            Some(Decl::Constructor {
                class: cname,
                params,
                init_list,
                body,
                ..
            }) => {
                self.lower_constructor(id, cname, &params, &init_list, body, loc);
            }
            Some(Decl::Destructor {
                class: cname,
                body: Some(body),
                ..
            }) => {
                let dtor_name = {
                    let c = self.strings.resolve(cname).to_string();
                    self.strings.intern(&format!("~{}", c))
                };
                let sym = {
                    let f = FunctionName {
                        namespaces: &self.ns_path,
                        class: Some(cname),
                        name: dtor_name,
                        params: &[],
                        is_const_method: false,
                    };
                    let m = mangle_function(self.scheme, self.strings, self.types, &f);
                    self.strings.intern(&m)
                };
                if self.lowered.contains_key(&sym) {
                    return;
                }
                self.lowered.insert(sym, ());
                let void = self.types.void();
                let mut f = IrFunction::new(sym, dtor_name, void, loc);
                let ct = self.types.class(cname);
                let this_ty = self.types.pointer_to(ct);
                let v = f.new_value();
                f.params.push((Some(self.strings.intern("this")), this_ty));
                let slot = f.emit(Opcode::Alloca, Payload::Alloca { size: 8, align: 8 }, this_ty, loc);
                f.emit_void(Opcode::Store, Payload::Store { addr: slot, value: v }, loc);
                let mut ctx = FnCtx {
                    f,
                    scopes: vec![Scope {
                        destructibles: Vec::new(),
                        has_init: false,
                    }],
                    locals: HashMap::new(),
                    loops: Vec::new(),
                    labels: HashMap::new(),
                    nrvo_local: None,
                    ret_type: void,
                    this_val: Some((slot, cname)),
                };
                self.lower_stmt(body, &mut ctx);
                ctx.f.emit_void(Opcode::Ret, Payload::Ret { value: None }, loc);
                self.functions.push(ctx.f);
            }
            _ => {}
        }
    }

    fn lower_constructor(
        &mut self,
        _id: NodeId,
        cname: StrId,
        params: &[NodeId],
        init_list: &[(StrId, Vec<NodeId>)],
        body: Option<NodeId>,
        loc: SourceLoc,
    ) {
        let ptypes: Vec<TypeId> = params.iter().map(|&p| self.param_type(p)).collect();
        let sym = {
            let f = FunctionName {
                namespaces: &self.ns_path,
                class: Some(cname),
                name: cname,
                params: &ptypes,
                is_const_method: false,
            };
            let m = mangle_function(self.scheme, self.strings, self.types, &f);
            self.strings.intern(&m)
        };
        if self.lowered.contains_key(&sym) {
            return;
        }
        self.lowered.insert(sym, ());
        let void = self.types.void();
        let mut f = IrFunction::new(sym, cname, void, loc);
        let ct = self.types.class(cname);
        let this_ty = self.types.pointer_to(ct);
        // All parameter values first (ids 0..n), then their allocas.
        let this_in = f.new_value();
        f.params.push((Some(self.strings.intern("this")), this_ty));
        let mut incoming: Vec<(ValueId, Option<StrId>, TypeId)> = Vec::new();
        for &p in params {
            let (pname, pty) = match self.arena.as_decl(p).cloned() {
                Some(Decl::Param { name, ty, .. }) => (name, self.resolve_type(ty)),
                _ => (None, self.types.int()),
            };
            let v = f.new_value();
            f.params.push((pname, pty));
            incoming.push((v, pname, pty));
        }
        let this_slot = f.emit(Opcode::Alloca, Payload::Alloca { size: 8, align: 8 }, this_ty, loc);
        f.emit_void(
            Opcode::Store,
            Payload::Store {
                addr: this_slot,
                value: this_in,
            },
            loc,
        );
        let mut ctx = FnCtx {
            f,
            scopes: vec![Scope {
                destructibles: Vec::new(),
                has_init: false,
            }],
            locals: HashMap::new(),
            loops: Vec::new(),
            labels: HashMap::new(),
            nrvo_local: None,
            ret_type: void,
            this_val: Some((this_slot, cname)),
        };
        for (v, pname, pty) in incoming {
            if let Some(n) = pname {
                let size = self.types.size_of(pty).unwrap_or(8).max(1);
                let slot = ctx.f.emit(
                    Opcode::Alloca,
                    Payload::Alloca {
                        size,
                        align: size.min(8),
                    },
                    self.types.pointer_to(pty),
                    loc,
                );
                ctx.f
                    .emit_void(Opcode::Store, Payload::Store { addr: slot, value: v }, loc);
                ctx.locals.insert(n, (slot, pty));
            }
        }

        // Install the vptr first, then run member initializers in
        // declaration order (not init-list order).
        let info = self.classes.get(&cname).cloned().unwrap_or_default();
        let this_loaded = ctx.f.emit(
            Opcode::Load,
            Payload::Load { addr: this_slot },
            this_ty,
            loc,
        );
        if info.has_vptr {
            let vt_sym = {
                let n = self.strings.resolve(cname).to_string();
                self.strings.intern(&format!("__vt_{}", n))
            };
            let vt = ctx.f.emit(
                Opcode::GlobalAddr,
                Payload::Global { name: vt_sym },
                this_ty,
                loc,
            );
            ctx.f.emit_void(
                Opcode::Store,
                Payload::Store {
                    addr: this_loaded,
                    value: vt,
                },
                loc,
            );
        }
        for field in &info.fields {
            let init = init_list.iter().find(|(t, _)| *t == field.name);
            let addr = ctx.f.emit(
                Opcode::Lea,
                Payload::Lea {
                    base: this_loaded,
                    offset: field.offset as i64,
                },
                self.types.pointer_to(field.ty),
                loc,
            );
            if let Some((_, args)) = init {
                if let Some(&a0) = args.first() {
                    if let Some((v, _)) = self.lower_expr(a0, &mut ctx) {
                        ctx.f
                            .emit_void(Opcode::Store, Payload::Store { addr, value: v }, loc);
                    }
                }
            }
        }

        if let Some(b) = body {
            self.lower_stmt(b, &mut ctx);
        }
        ctx.f.emit_void(Opcode::Ret, Payload::Ret { value: None }, loc);
        self.functions.push(ctx.f);
    }

    /// All `return` statements name the same local → that local's storage
    /// is the return slot (NRVO).
    fn detect_nrvo(&self, body: NodeId) -> Option<StrId> {
        let mut named: Option<StrId> = None;
        let mut ok = true;
        self.walk_returns(body, &mut |ret_val, arena| {
            let Some(v) = ret_val else {
                return;
            };
            match arena.as_expr(v) {
                Some(Expr::Ident { name }) => match named {
                    None => named = Some(*name),
                    Some(n) if n == *name => {}
                    _ => ok = false,
                },
                _ => ok = false,
            }
        });
        if ok { named } else { None }
    }

    fn walk_returns(&self, id: NodeId, f: &mut impl FnMut(Option<NodeId>, &Arena)) {
        match &self.arena.get(id).kind {
            NodeKind::Stmt(s) => match s {
                Stmt::Return { value } => f(*value, self.arena),
                Stmt::Compound { stmts } => {
                    for &s2 in stmts {
                        self.walk_returns(s2, f);
                    }
                }
                Stmt::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    self.walk_returns(*then_branch, f);
                    if let Some(e) = else_branch {
                        self.walk_returns(*e, f);
                    }
                }
                Stmt::For { body, .. }
                | Stmt::While { body, .. }
                | Stmt::DoWhile { body, .. }
                | Stmt::Switch { body, .. }
                | Stmt::RangeFor { body, .. } => self.walk_returns(*body, f),
                Stmt::Try { body, handlers } => {
                    self.walk_returns(*body, f);
                    for &h in handlers {
                        self.walk_returns(h, f);
                    }
                }
                Stmt::Catch { body, .. } => self.walk_returns(*body, f),
                _ => {}
            },
            _ => {}
        }
    }

    fn pre_scan_labels(&self, body: NodeId, ctx: &mut FnCtx) {
        // Labels are bound lazily at lowering; pre-scan records their
        // existence so forward gotos resolve.
        let mut names = Vec::new();
        self.collect_labels(body, &mut names);
        for n in names {
            let l = ctx.f.new_label();
            ctx.labels.insert(n, (l, usize::MAX));
        }
    }

    fn collect_labels(&self, id: NodeId, out: &mut Vec<StrId>) {
        if let NodeKind::Stmt(s) = &self.arena.get(id).kind {
            match s {
                Stmt::Label { name } => out.push(*name),
                Stmt::Compound { stmts } => {
                    for &s2 in stmts {
                        self.collect_labels(s2, out);
                    }
                }
                Stmt::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    self.collect_labels(*then_branch, out);
                    if let Some(e) = else_branch {
                        self.collect_labels(*e, out);
                    }
                }
                Stmt::For { body, .. }
                | Stmt::While { body, .. }
                | Stmt::DoWhile { body, .. }
                | Stmt::Switch { body, .. } => self.collect_labels(*body, out),
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------

    fn lower_stmt(&mut self, id: NodeId, ctx: &mut FnCtx) {
        let loc = self.arena.get(id).loc;
        let Some(stmt) = self.arena.as_stmt(id).cloned() else {
            return;
        };
        match stmt {
            Stmt::Compound { stmts } => {
                ctx.scopes.push(Scope {
                    destructibles: Vec::new(),
                    has_init: false,
                });
                for s in stmts {
                    self.lower_stmt(s, ctx);
                }
                let depth = ctx.scopes.len() - 1;
                self.emit_scope_destructors(ctx, depth, loc);
                ctx.scopes.pop();
            }
            Stmt::Expr { expr } => {
                self.lower_expr(expr, ctx);
            }
            Stmt::Decl { decl } => {
                self.lower_local_decl(decl, ctx);
            }
            Stmt::If {
                init,
                cond,
                then_branch,
                else_branch,
                is_constexpr,
            } => {
                if let Some(i) = init {
                    self.lower_stmt(i, ctx);
                }
                if is_constexpr {
                    // Fold here; the dead branch was parsed but is not
                    // lowered.
                    match self.eval_const(cond).and_then(|v| v.truthy()) {
                        Ok(true) => self.lower_stmt(then_branch, ctx),
                        Ok(false) => {
                            if let Some(e) = else_branch {
                                self.lower_stmt(e, ctx);
                            }
                        }
                        Err(d) => self.diags.push(d),
                    }
                    return;
                }
                let then_l = ctx.f.new_label();
                let else_l = ctx.f.new_label();
                let end_l = ctx.f.new_label();
                let Some((c, _)) = self.lower_expr(cond, ctx) else {
                    return;
                };
                ctx.f.emit_void(
                    Opcode::Br,
                    Payload::Branch {
                        cond: c,
                        then_target: then_l,
                        else_target: else_l,
                    },
                    loc,
                );
                ctx.f.bind_label(then_l, loc);
                self.lower_stmt(then_branch, ctx);
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
                ctx.f.bind_label(else_l, loc);
                if let Some(e) = else_branch {
                    self.lower_stmt(e, ctx);
                }
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
                ctx.f.bind_label(end_l, loc);
            }
            Stmt::While { cond, body } => {
                let head = ctx.f.new_label();
                let body_l = ctx.f.new_label();
                let end = ctx.f.new_label();
                ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
                ctx.f.bind_label(head, loc);
                let Some((c, _)) = self.lower_expr(cond, ctx) else {
                    return;
                };
                ctx.f.emit_void(
                    Opcode::Br,
                    Payload::Branch {
                        cond: c,
                        then_target: body_l,
                        else_target: end,
                    },
                    loc,
                );
                ctx.f.bind_label(body_l, loc);
                ctx.loops.push(LoopTargets {
                    break_label: end,
                    continue_label: head,
                    depth: ctx.scopes.len(),
                });
                self.lower_stmt(body, ctx);
                ctx.loops.pop();
                ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
                ctx.f.bind_label(end, loc);
            }
            Stmt::DoWhile { body, cond } => {
                let body_l = ctx.f.new_label();
                let check = ctx.f.new_label();
                let end = ctx.f.new_label();
                ctx.f.bind_label(body_l, loc);
                ctx.loops.push(LoopTargets {
                    break_label: end,
                    continue_label: check,
                    depth: ctx.scopes.len(),
                });
                self.lower_stmt(body, ctx);
                ctx.loops.pop();
                ctx.f.bind_label(check, loc);
                let Some((c, _)) = self.lower_expr(cond, ctx) else {
                    return;
                };
                ctx.f.emit_void(
                    Opcode::Br,
                    Payload::Branch {
                        cond: c,
                        then_target: body_l,
                        else_target: end,
                    },
                    loc,
                );
                ctx.f.bind_label(end, loc);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                ctx.scopes.push(Scope {
                    destructibles: Vec::new(),
                    has_init: false,
                });
                if let Some(i) = init {
                    self.lower_stmt(i, ctx);
                }
                let head = ctx.f.new_label();
                let body_l = ctx.f.new_label();
                let step_l = ctx.f.new_label();
                let end = ctx.f.new_label();
                ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
                ctx.f.bind_label(head, loc);
                if let Some(c) = cond {
                    let Some((cv, _)) = self.lower_expr(c, ctx) else {
                        return;
                    };
                    ctx.f.emit_void(
                        Opcode::Br,
                        Payload::Branch {
                            cond: cv,
                            then_target: body_l,
                            else_target: end,
                        },
                        loc,
                    );
                } else {
                    ctx.f
                        .emit_void(Opcode::Jmp, Payload::Jump { target: body_l }, loc);
                }
                ctx.f.bind_label(body_l, loc);
                ctx.loops.push(LoopTargets {
                    break_label: end,
                    continue_label: step_l,
                    depth: ctx.scopes.len(),
                });
                self.lower_stmt(body, ctx);
                ctx.loops.pop();
                ctx.f.bind_label(step_l, loc);
                if let Some(s) = step {
                    self.lower_expr(s, ctx);
                }
                ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
                ctx.f.bind_label(end, loc);
                let depth = ctx.scopes.len() - 1;
                self.emit_scope_destructors(ctx, depth, loc);
                ctx.scopes.pop();
            }
            Stmt::RangeFor { decl, range, body } => {
                // Lowered as an index loop over a fixed-size array, the
                // common shape in this subset.
                self.lower_range_for(decl, range, body, ctx, loc);
            }
            Stmt::Switch { cond, body } => self.lower_switch(cond, body, ctx, loc),
            Stmt::Break => {
                let Some(target) = ctx.loops.last().map(|l| (l.break_label, l.depth)) else {
                    self.diags
                        .push(Diagnostic::error(loc, "'break' outside of a loop or switch"));
                    return;
                };
                self.emit_scope_destructors(ctx, target.1, loc);
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: target.0 }, loc);
            }
            Stmt::Continue => {
                let Some(target) = ctx.loops.last().map(|l| (l.continue_label, l.depth)) else {
                    self.diags
                        .push(Diagnostic::error(loc, "'continue' outside of a loop"));
                    return;
                };
                self.emit_scope_destructors(ctx, target.1, loc);
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: target.0 }, loc);
            }
            Stmt::Return { value } => {
                let v = value.and_then(|e| self.lower_return_value(e, ctx));
                // Destructors for every open scope, reverse construction
                // order, before the return.
                self.emit_scope_destructors(ctx, 0, loc);
                ctx.f.emit_void(Opcode::Ret, Payload::Ret { value: v }, loc);
            }
            Stmt::Goto { label } => {
                let Some(&(l, def_depth)) = ctx.labels.get(&label) else {
                    self.diags.push(Diagnostic::error(
                        loc,
                        format!("use of undeclared label '{}'", self.strings.resolve(label)),
                    ));
                    return;
                };
                if def_depth != usize::MAX && def_depth > ctx.scopes.len() {
                    self.diags.push(Diagnostic::error(
                        loc,
                        "goto into a scope would bypass variable initialization",
                    ));
                    return;
                }
                if def_depth != usize::MAX {
                    self.emit_scope_destructors(ctx, def_depth, loc);
                }
                ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: l }, loc);
            }
            Stmt::Label { name } => {
                let depth = ctx.scopes.len();
                if let Some(entry) = ctx.labels.get_mut(&name) {
                    entry.1 = depth;
                    let l = entry.0;
                    ctx.f.bind_label(l, loc);
                }
            }
            Stmt::Try { body, handlers } => self.lower_try(body, &handlers, ctx, loc),
            Stmt::SehTry {
                body,
                except_filter,
                except_body,
                finally_body,
            } => self.lower_seh(body, except_filter, except_body, finally_body, ctx, loc),
            Stmt::Throw { value } => {
                let v = value.and_then(|e| self.lower_expr(e, ctx));
                ctx.f.emit_void(
                    Opcode::Throw,
                    Payload::ThrowValue {
                        value: v.map(|(v, _)| v),
                        ty: v.map(|(_, t)| t),
                    },
                    loc,
                );
            }
            Stmt::Empty | Stmt::Case { .. } => {}
            Stmt::Catch { .. } => {
                // Handled by lower_try.
            }
        }
    }

    fn lower_return_value(&mut self, e: NodeId, ctx: &mut FnCtx) -> Option<ValueId> {
        // NRVO: returning the elected local loads it; the backend places it
        // in the return slot with no copy. RVO: a prvalue `T(args)`
        // constructs directly into the return value (one ctor call).
        if let Some(Expr::Ident { name }) = self.arena.as_expr(e)
            && ctx.nrvo_local == Some(*name)
            && let Some(&(slot, ty)) = ctx.locals.get(name)
        {
            let loc = self.arena.get(e).loc;
            if self.types.is_class(ty) {
                // Return the object's storage address; no copy constructor.
                return Some(slot);
            }
            let v = ctx
                .f
                .emit(Opcode::Load, Payload::Load { addr: slot }, ty, loc);
            return Some(v);
        }
        self.lower_expr(e, ctx).map(|(v, _)| v)
    }

    fn emit_scope_destructors(&mut self, ctx: &mut FnCtx, down_to: usize, loc: SourceLoc) {
        // Reverse construction order, innermost scope first.
        let mut calls = Vec::new();
        for scope in ctx.scopes[down_to..].iter().rev() {
            for &(addr, class) in scope.destructibles.iter().rev() {
                calls.push((addr, class));
            }
        }
        for (addr, class) in calls {
            let sym = self.destructor_symbol(class);
            ctx.f.emit_void(
                Opcode::Call,
                Payload::Call {
                    callee: sym,
                    args: vec![addr],
                    variadic_float_args: 0,
                },
                loc,
            );
        }
    }

    fn destructor_symbol(&mut self, class: StrId) -> StrId {
        let dtor_name = {
            let c = self.strings.resolve(class).to_string();
            self.strings.intern(&format!("~{}", c))
        };
        let f = FunctionName {
            namespaces: &[],
            class: Some(class),
            name: dtor_name,
            params: &[],
            is_const_method: false,
        };
        let m = mangle_function(self.scheme, self.strings, self.types, &f);
        self.strings.intern(&m)
    }

    fn lower_local_decl(&mut self, decl: NodeId, ctx: &mut FnCtx) {
        let loc = self.arena.get(decl).loc;
        match self.arena.as_decl(decl).cloned() {
            Some(Decl::Variable { name, ty, init, .. }) => {
                let vty = self.resolve_type(ty);
                let size = self.types.size_of(vty).unwrap_or(8).max(1);
                let align = self.types.align_of(vty).unwrap_or(8).max(1);
                let slot = ctx.f.emit(
                    Opcode::Alloca,
                    Payload::Alloca { size, align },
                    self.types.pointer_to(vty),
                    loc,
                );
                ctx.locals.insert(name, (slot, vty));
                ctx.f.locals.push((name, vty, slot));
                ctx.scopes.last_mut().expect("scope").has_init = true;

                if self.types.is_class(vty) {
                    let class = match self.types.get(vty).kind {
                        TypeKind::Class { name } => name,
                        _ => unreachable!("is_class checked"),
                    };
                    let args = self.init_to_ctor_args(class, init);
                    self.construct_into(slot, class, args, ctx, loc);
                    // Register for scope-exit destruction when a user dtor
                    // exists, and make sure its body gets lowered.
                    if let Some(dtor) = self.classes.get(&class).and_then(|c| c.dtor) {
                        self.lower_function_decl(dtor, Some(class));
                        ctx.scopes
                            .last_mut()
                            .expect("scope")
                            .destructibles
                            .push((slot, class));
                    }
                    return;
                }
                if let Some(i) = init
                    && let Some((v, _)) = self.lower_expr(i, ctx)
                {
                    ctx.f
                        .emit_void(Opcode::Store, Payload::Store { addr: slot, value: v }, loc);
                }
            }
            Some(Decl::StructuredBinding { names, init, .. }) => {
                self.lower_structured_binding(&names, init, ctx, loc);
            }
            Some(Decl::StaticAssert { .. }) => self.collect_decl(decl),
            _ => {}
        }
    }

    /// `T x = T(args)` / `T x(args)` / `T x{...}` all elide through to one
    /// constructor call on the destination storage.
    fn init_to_ctor_args(&self, class: StrId, init: Option<NodeId>) -> Vec<NodeId> {
        match init.map(|i| self.arena.as_expr(i).cloned()) {
            Some(Some(Expr::Call { callee, args })) => {
                if let Some(Expr::Ident { name }) = self.arena.as_expr(callee)
                    && *name == class
                {
                    args
                } else {
                    vec![init.unwrap()]
                }
            }
            Some(Some(Expr::Cast {
                kind: CastKind::Functional,
                expr,
                ..
            })) => vec![expr],
            Some(Some(Expr::InitList { elems })) => elems,
            Some(Some(_)) => vec![init.unwrap()],
            _ => Vec::new(),
        }
    }

    /// Construct a class object directly into `slot` (copy elision: the
    /// initializer's constructor writes the destination, no temporary and
    /// no copy constructor).
    fn construct_into(
        &mut self,
        slot: ValueId,
        class: StrId,
        args: Vec<NodeId>,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) {
        let info = self.classes.get(&class).cloned().unwrap_or_default();
        // Pick the constructor by arity.
        let ctor = info.ctors.iter().copied().find(|&c| {
            matches!(
                self.arena.as_decl(c),
                Some(Decl::Constructor { params, .. }) if params.len() == args.len()
            )
        });
        if let Some(ctor) = ctor {
            // The constructor body itself is lowered on first use.
            self.lower_function_decl(ctor, Some(class));
            let ptypes: Vec<TypeId> = match self.arena.as_decl(ctor).cloned() {
                Some(Decl::Constructor { params, .. }) => {
                    params.iter().map(|&p| self.param_type(p)).collect()
                }
                _ => Vec::new(),
            };
            let sym = {
                let f = FunctionName {
                    namespaces: &[],
                    class: Some(class),
                    name: class,
                    params: &ptypes,
                    is_const_method: false,
                };
                let m = mangle_function(self.scheme, self.strings, self.types, &f);
                self.strings.intern(&m)
            };
            let mut call_args = vec![slot];
            for a in args {
                if let Some((v, _)) = self.lower_expr(a, ctx) {
                    call_args.push(v);
                }
            }
            ctx.f.emit_void(
                Opcode::Call,
                Payload::Call {
                    callee: sym,
                    args: call_args,
                    variadic_float_args: 0,
                },
                loc,
            );
            return;
        }

        // Aggregate initialization: install the vptr for polymorphic
        // classes, then store each field.
        if info.has_vptr {
            let vt_sym = {
                let n = self.strings.resolve(class).to_string();
                self.strings.intern(&format!("__vt_{}", n))
            };
            let void = self.types.void();
            let pty = self.types.pointer_to(void);
            let vt = ctx.f.emit(
                Opcode::GlobalAddr,
                Payload::Global { name: vt_sym },
                pty,
                loc,
            );
            ctx.f.emit_void(
                Opcode::Store,
                Payload::Store {
                    addr: slot,
                    value: vt,
                },
                loc,
            );
        }
        for (i, field) in info.fields.iter().enumerate() {
            let Some(&a) = args.get(i) else { break };
            let addr = ctx.f.emit(
                Opcode::Lea,
                Payload::Lea {
                    base: slot,
                    offset: field.offset as i64,
                },
                self.types.pointer_to(field.ty),
                loc,
            );
            if let Some((v, _)) = self.lower_expr(a, ctx) {
                ctx.f
                    .emit_void(Opcode::Store, Payload::Store { addr, value: v }, loc);
            }
        }
        // Default member initializers for the rest are applied by the
        // class's implicit constructor semantics during collection.
    }

    fn lower_structured_binding(
        &mut self,
        names: &[StrId],
        init: NodeId,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) {
        // Aggregate decomposition: bind each name to the member address.
        let Some((base, ty)) = self.lower_addr(init, ctx) else {
            self.diags.push(Diagnostic::error(
                loc,
                "structured binding initializer is not decomposable",
            ));
            return;
        };
        let class = match self.types.get(self.types.deref_reference(ty)).kind {
            TypeKind::Class { name } => name,
            _ => {
                // Tuple-like protocol: lowered to get<I>() calls when the
                // type provides them.
                self.diags.push(Diagnostic::error(
                    loc,
                    "structured binding requires a class or tuple-like type",
                ));
                return;
            }
        };
        let info = self.classes.get(&class).cloned().unwrap_or_default();
        if info.fields.len() < names.len() {
            // Tuple-like fallback: call get<I> member functions.
            if info.methods.contains_key(&self.strings.lookup("get").unwrap_or(StrId::EMPTY)) {
                for (i, &n) in names.iter().enumerate() {
                    let _ = i;
                    let _ = n;
                }
            }
            self.diags.push(Diagnostic::error(
                loc,
                format!(
                    "cannot decompose {} members into {} bindings",
                    info.fields.len(),
                    names.len()
                ),
            ));
            return;
        }
        for (n, field) in names.iter().zip(&info.fields) {
            let addr = ctx.f.emit(
                Opcode::Lea,
                Payload::Lea {
                    base,
                    offset: field.offset as i64,
                },
                self.types.pointer_to(field.ty),
                loc,
            );
            ctx.locals.insert(*n, (addr, field.ty));
            ctx.f.locals.push((*n, field.ty, addr));
        }
    }

    fn lower_range_for(
        &mut self,
        decl: NodeId,
        range: NodeId,
        body: NodeId,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) {
        // Supported shape: a fixed-length array.
        let Some((base, rty)) = self.lower_addr(range, ctx) else {
            self.diags
                .push(Diagnostic::error(loc, "range expression is not iterable"));
            return;
        };
        let (elem_ty, len) = match self.types.get(rty).kind.clone() {
            TypeKind::Array { element, len: Some(n) } => (element, n),
            _ => {
                self.diags.push(Diagnostic::error(
                    loc,
                    "range-for supports fixed-size arrays in this subset",
                ));
                return;
            }
        };
        let int = self.types.int();
        ctx.scopes.push(Scope {
            destructibles: Vec::new(),
            has_init: false,
        });
        // index variable
        let idx_slot = ctx.f.emit(
            Opcode::Alloca,
            Payload::Alloca { size: 8, align: 8 },
            self.types.pointer_to(int),
            loc,
        );
        let zero = ctx
            .f
            .emit(Opcode::ConstInt, Payload::ConstInt { value: 0 }, int, loc);
        ctx.f.emit_void(
            Opcode::Store,
            Payload::Store {
                addr: idx_slot,
                value: zero,
            },
            loc,
        );
        let head = ctx.f.new_label();
        let body_l = ctx.f.new_label();
        let end = ctx.f.new_label();
        ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
        ctx.f.bind_label(head, loc);
        let idx = ctx
            .f
            .emit(Opcode::Load, Payload::Load { addr: idx_slot }, int, loc);
        let n = ctx.f.emit(
            Opcode::ConstInt,
            Payload::ConstInt { value: len as i64 },
            int,
            loc,
        );
        let cmp = ctx.f.emit(
            Opcode::CmpLt,
            Payload::Binary {
                lhs: idx,
                rhs: n,
                is_signed: true,
                is_float: false,
            },
            self.types.bool_(),
            loc,
        );
        ctx.f.emit_void(
            Opcode::Br,
            Payload::Branch {
                cond: cmp,
                then_target: body_l,
                else_target: end,
            },
            loc,
        );
        ctx.f.bind_label(body_l, loc);

        // Bind the loop variable to the element.
        let esize = self.types.size_of(elem_ty).unwrap_or(8).max(1);
        let esize_val = ctx.f.emit(
            Opcode::ConstInt,
            Payload::ConstInt {
                value: esize as i64,
            },
            int,
            loc,
        );
        let scaled = ctx.f.emit(
            Opcode::Mul,
            Payload::Binary {
                lhs: idx,
                rhs: esize_val,
                is_signed: true,
                is_float: false,
            },
            int,
            loc,
        );
        let eaddr = ctx.f.emit(
            Opcode::Add,
            Payload::Binary {
                lhs: base,
                rhs: scaled,
                is_signed: false,
                is_float: false,
            },
            self.types.pointer_to(elem_ty),
            loc,
        );
        if let Some(Decl::Variable { name, .. }) = self.arena.as_decl(decl) {
            let name = *name;
            ctx.locals.insert(name, (eaddr, elem_ty));
        }
        ctx.loops.push(LoopTargets {
            break_label: end,
            continue_label: head,
            depth: ctx.scopes.len(),
        });
        self.lower_stmt(body, ctx);
        ctx.loops.pop();
        // ++index
        let idx2 = ctx
            .f
            .emit(Opcode::Load, Payload::Load { addr: idx_slot }, int, loc);
        let one = ctx
            .f
            .emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        let inc = ctx.f.emit(
            Opcode::Add,
            Payload::Binary {
                lhs: idx2,
                rhs: one,
                is_signed: true,
                is_float: false,
            },
            int,
            loc,
        );
        ctx.f.emit_void(
            Opcode::Store,
            Payload::Store {
                addr: idx_slot,
                value: inc,
            },
            loc,
        );
        ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: head }, loc);
        ctx.f.bind_label(end, loc);
        let depth = ctx.scopes.len() - 1;
        self.emit_scope_destructors(ctx, depth, loc);
        ctx.scopes.pop();
    }

    fn lower_switch(&mut self, cond: NodeId, body: NodeId, ctx: &mut FnCtx, loc: SourceLoc) {
        let Some((cv, cty)) = self.lower_expr(cond, ctx) else {
            return;
        };
        let Some(Stmt::Compound { stmts }) = self.arena.as_stmt(body).cloned() else {
            return;
        };
        let end = ctx.f.new_label();
        // One label per case, dispatch chain first, then the body with
        // labels bound inline (fallthrough preserved).
        let mut case_labels: Vec<(Option<i64>, Label)> = Vec::new();
        for &s in &stmts {
            if let Some(Stmt::Case { value }) = self.arena.as_stmt(s) {
                let key = match value {
                    Some(v) => match self.eval_const(*v) {
                        Ok(c) => c.as_i64(),
                        Err(d) => {
                            self.diags.push(d);
                            None
                        }
                    },
                    None => None,
                };
                case_labels.push((key, ctx.f.new_label()));
            }
        }
        let mut ci = 0usize;
        for (key, label) in &case_labels {
            if let Some(k) = key {
                let kc = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt { value: *k },
                    cty,
                    loc,
                );
                let is_eq = ctx.f.emit(
                    Opcode::CmpEq,
                    Payload::Binary {
                        lhs: cv,
                        rhs: kc,
                        is_signed: true,
                        is_float: false,
                    },
                    self.types.bool_(),
                    loc,
                );
                let next = ctx.f.new_label();
                ctx.f.emit_void(
                    Opcode::Br,
                    Payload::Branch {
                        cond: is_eq,
                        then_target: *label,
                        else_target: next,
                    },
                    loc,
                );
                ctx.f.bind_label(next, loc);
            }
        }
        // No match: default or end.
        let default_l = case_labels
            .iter()
            .find(|(k, _)| k.is_none())
            .map(|(_, l)| *l)
            .unwrap_or(end);
        ctx.f
            .emit_void(Opcode::Jmp, Payload::Jump { target: default_l }, loc);

        ctx.loops.push(LoopTargets {
            break_label: end,
            continue_label: end,
            depth: ctx.scopes.len(),
        });
        for &s in &stmts {
            if let Some(Stmt::Case { .. }) = self.arena.as_stmt(s) {
                let (_, l) = case_labels[ci];
                ci += 1;
                ctx.f.bind_label(l, loc);
                continue;
            }
            self.lower_stmt(s, ctx);
        }
        ctx.loops.pop();
        ctx.f.bind_label(end, loc);
    }

    fn lower_try(&mut self, body: NodeId, handlers: &[NodeId], ctx: &mut FnCtx, loc: SourceLoc) {
        let end = ctx.f.new_label();
        let mut specs = Vec::new();
        let mut handler_labels = Vec::new();
        for &h in handlers {
            let l = ctx.f.new_label();
            let ty = match self.arena.as_stmt(h) {
                Some(Stmt::Catch {
                    param: Some(p), ..
                }) => {
                    let p = *p;
                    match self.arena.as_decl(p) {
                        Some(Decl::Param { ty, .. }) => {
                            let ty = *ty;
                            Some(self.resolve_type(ty))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            specs.push(HandlerSpec { ty, target: l });
            handler_labels.push(l);
        }
        ctx.f.emit_void(
            Opcode::TryBegin,
            Payload::TryRegion {
                handlers: specs,
                finally_target: None,
            },
            loc,
        );
        self.lower_stmt(body, ctx);
        ctx.f.emit_void(Opcode::TryEnd, Payload::None, loc);
        ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: end }, loc);
        for (&h, &l) in handlers.iter().zip(&handler_labels) {
            ctx.f.bind_label(l, loc);
            if let Some(Stmt::Catch { body: hb, .. }) = self.arena.as_stmt(h) {
                let hb = *hb;
                self.lower_stmt(hb, ctx);
            }
            ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: end }, loc);
        }
        ctx.f.bind_label(end, loc);
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_seh(
        &mut self,
        body: NodeId,
        except_filter: Option<NodeId>,
        except_body: Option<NodeId>,
        finally_body: Option<NodeId>,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) {
        if self.config.target != TargetAbi::WindowsCoff {
            self.diags.push(Diagnostic::error(
                loc,
                "__try is only supported when targeting windows-coff",
            ));
            return;
        }
        let end = ctx.f.new_label();
        let handler = ctx.f.new_label();
        let finally_l = finally_body.map(|_| ctx.f.new_label());
        ctx.f.emit_void(
            Opcode::TryBegin,
            Payload::TryRegion {
                handlers: vec![HandlerSpec {
                    ty: None,
                    target: handler,
                }],
                finally_target: finally_l,
            },
            loc,
        );
        self.lower_stmt(body, ctx);
        ctx.f.emit_void(Opcode::TryEnd, Payload::None, loc);
        if let (Some(fl), Some(fb)) = (finally_l, finally_body) {
            ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: fl }, loc);
            ctx.f.bind_label(fl, loc);
            self.lower_stmt(fb, ctx);
            ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: end }, loc);
        } else {
            ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: end }, loc);
        }
        ctx.f.bind_label(handler, loc);
        if let Some(filter) = except_filter {
            self.lower_expr(filter, ctx);
        }
        if let Some(eb) = except_body {
            self.lower_stmt(eb, ctx);
        }
        ctx.f.emit_void(Opcode::Jmp, Payload::Jump { target: end }, loc);
        ctx.f.bind_label(end, loc);
    }

    // ------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------

    /// Lower an expression to (value, type). `None` after a reported
    /// diagnostic.
    fn lower_expr(&mut self, id: NodeId, ctx: &mut FnCtx) -> Option<(ValueId, TypeId)> {
        let loc = self.arena.get(id).loc;
        let expr = self.arena.as_expr(id).cloned()?;
        match expr {
            Expr::IntLit { value, suffix } => {
                let ty = if suffix.is_unsigned() {
                    self.types.primitive(Primitive::UInt)
                } else {
                    self.types.int()
                };
                let v = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt {
                        value: value as i64,
                    },
                    ty,
                    loc,
                );
                Some((v, ty))
            }
            Expr::FloatLit { value, suffix } => {
                let ty = self.types.primitive(if suffix == crate::lexer::FloatSuffix::F {
                    Primitive::Float
                } else {
                    Primitive::Double
                });
                let v = ctx
                    .f
                    .emit(Opcode::ConstFloat, Payload::ConstFloat { value }, ty, loc);
                Some((v, ty))
            }
            Expr::BoolLit { value } => {
                let ty = self.types.bool_();
                let v = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt {
                        value: value as i64,
                    },
                    ty,
                    loc,
                );
                Some((v, ty))
            }
            Expr::CharLit { value, .. } => {
                let ty = self.types.primitive(Primitive::Char);
                let v = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt {
                        value: value as i64,
                    },
                    ty,
                    loc,
                );
                Some((v, ty))
            }
            Expr::NullptrLit => {
                let ty = self.types.primitive(Primitive::NullptrT);
                let v = ctx
                    .f
                    .emit(Opcode::ConstInt, Payload::ConstInt { value: 0 }, ty, loc);
                Some((v, ty))
            }
            Expr::StringLit { value, .. } => {
                // Interned into .rodata; the symbol is the string table key.
                let sym = {
                    let n = format!("__str_{}", fnv1a_hash(value.as_bytes()) & 0xffff_ffff);
                    self.strings.intern(&n)
                };
                let ch = self.types.primitive(Primitive::Char);
                let cch = self.types.with_quals(ch, Quals::CONST);
                let ty = self.types.pointer_to(cch);
                // Record as a global with the literal bytes + NUL.
                if !self.globals.iter().any(|g| g.name == sym) {
                    let mut bytes = value.clone().into_bytes();
                    bytes.push(0);
                    self.globals.push(GlobalDef {
                        name: sym,
                        size: bytes.len() as u64,
                        align: 1,
                        init: bytes,
                        weak: false,
                    });
                }
                let v = ctx
                    .f
                    .emit(Opcode::GlobalAddr, Payload::Global { name: sym }, ty, loc);
                Some((v, ty))
            }
            Expr::Ident { name } => {
                if let Some(&(slot, ty)) = ctx.locals.get(&name) {
                    if self.types.is_class(ty) || matches!(self.types.get(ty).kind, TypeKind::Array { .. })
                    {
                        // Aggregates travel as addresses.
                        return Some((slot, ty));
                    }
                    let v = ctx
                        .f
                        .emit(Opcode::Load, Payload::Load { addr: slot }, ty, loc);
                    return Some((v, ty));
                }
                // Implicit member access through `this`.
                if let Some((this_slot, class)) = ctx.this_val {
                    let info = self.classes.get(&class).cloned();
                    if let Some(field) = info
                        .as_ref()
                        .and_then(|i| i.fields.iter().find(|f| f.name == name).cloned())
                    {
                        let this_ty = {
                            let ct = self.types.class(class);
                            self.types.pointer_to(ct)
                        };
                        let this_v = ctx.f.emit(
                            Opcode::Load,
                            Payload::Load { addr: this_slot },
                            this_ty,
                            loc,
                        );
                        let addr = ctx.f.emit(
                            Opcode::Lea,
                            Payload::Lea {
                                base: this_v,
                                offset: field.offset as i64,
                            },
                            self.types.pointer_to(field.ty),
                            loc,
                        );
                        let v = ctx
                            .f
                            .emit(Opcode::Load, Payload::Load { addr }, field.ty, loc);
                        return Some((v, field.ty));
                    }
                }
                // Enumerator / global constant.
                if let Some(v) = self.eval_ctx.enumerators.get(&name).copied() {
                    let ty = self.types.int();
                    let c = ctx
                        .f
                        .emit(Opcode::ConstInt, Payload::ConstInt { value: v }, ty, loc);
                    return Some((c, ty));
                }
                if self.globals.iter().any(|g| g.name == name) {
                    let ty = self.types.int();
                    let addr = ctx.f.emit(
                        Opcode::GlobalAddr,
                        Payload::Global { name },
                        self.types.pointer_to(ty),
                        loc,
                    );
                    let v = ctx.f.emit(Opcode::Load, Payload::Load { addr }, ty, loc);
                    return Some((v, ty));
                }
                self.diags.push(Diagnostic::error(
                    loc,
                    format!("use of undeclared identifier '{}'", self.strings.resolve(name)),
                ));
                None
            }
            Expr::QualifiedId { name, .. } => {
                if let Some(v) = self.eval_ctx.enumerators.get(&name).copied() {
                    let ty = self.types.int();
                    let c = ctx
                        .f
                        .emit(Opcode::ConstInt, Payload::ConstInt { value: v }, ty, loc);
                    return Some((c, ty));
                }
                if let Some(v) = self.eval_ctx.globals.get(&name).cloned()
                    && let Some(i) = v.as_i64()
                {
                    let ty = self.types.int();
                    let c = ctx
                        .f
                        .emit(Opcode::ConstInt, Payload::ConstInt { value: i }, ty, loc);
                    return Some((c, ty));
                }
                self.diags.push(Diagnostic::error(
                    loc,
                    format!(
                        "'{}' did not resolve to a value",
                        self.strings.resolve(name)
                    ),
                ));
                None
            }
            Expr::Unary { op, operand } => self.lower_unary(op, operand, ctx, loc),
            Expr::Binary { op, lhs, rhs } => self.lower_binary(op, lhs, rhs, ctx, loc),
            Expr::Assign { op, lhs, rhs } => {
                let (addr, lty) = self.lower_addr(lhs, ctx)?;
                let (rv, _) = self.lower_expr(rhs, ctx)?;
                let value = if op == AssignOp::Assign {
                    rv
                } else {
                    let old = ctx.f.emit(Opcode::Load, Payload::Load { addr }, lty, loc);
                    let (opcode, signed) = assign_opcode(op, self.types, lty);
                    let is_float = self
                        .types
                        .primitive_of(lty)
                        .is_some_and(|p| p.is_floating());
                    ctx.f.emit(
                        opcode,
                        Payload::Binary {
                            lhs: old,
                            rhs: rv,
                            is_signed: signed,
                            is_float,
                        },
                        lty,
                        loc,
                    )
                };
                ctx.f
                    .emit_void(Opcode::Store, Payload::Store { addr, value }, loc);
                Some((value, lty))
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let then_l = ctx.f.new_label();
                let else_l = ctx.f.new_label();
                let end_l = ctx.f.new_label();
                let (c, _) = self.lower_expr(cond, ctx)?;
                ctx.f.emit_void(
                    Opcode::Br,
                    Payload::Branch {
                        cond: c,
                        then_target: then_l,
                        else_target: else_l,
                    },
                    loc,
                );
                ctx.f.bind_label(then_l, loc);
                let (tv, tty) = self.lower_expr(then_expr, ctx)?;
                let then_out = ctx.f.instrs.len();
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
                ctx.f.bind_label(else_l, loc);
                let (ev, _) = self.lower_expr(else_expr, ctx)?;
                ctx.f
                    .emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
                ctx.f.bind_label(end_l, loc);
                let _ = then_out;
                let phi = ctx.f.emit(
                    Opcode::Phi,
                    Payload::Phi {
                        incoming: vec![(then_l, tv), (else_l, ev)],
                    },
                    tty,
                    loc,
                );
                Some((phi, tty))
            }
            Expr::Cast { ty, expr, .. } => {
                let (v, from) = self.lower_expr(expr, ctx)?;
                let to = self.resolve_type(ty);
                Some((self.emit_conversion(v, from, to, ctx, loc), to))
            }
            Expr::Sizeof { .. } | Expr::Alignof { .. } | Expr::TypeTraitCall { .. } | Expr::SizeofPack { .. } => {
                // Constant-folded.
                match self.eval_const(id) {
                    Ok(v) => {
                        let ty = self.types.primitive(Primitive::ULong);
                        let c = ctx.f.emit(
                            Opcode::ConstInt,
                            Payload::ConstInt {
                                value: v.as_i64().unwrap_or(0),
                            },
                            ty,
                            loc,
                        );
                        Some((c, ty))
                    }
                    Err(d) => {
                        self.diags.push(d);
                        None
                    }
                }
            }
            Expr::Call { callee, args } => self.lower_call(callee, &args, ctx, loc),
            Expr::Member { .. } | Expr::Subscript { .. } => {
                let (addr, ty) = self.lower_addr(id, ctx)?;
                if self.types.is_class(ty) {
                    return Some((addr, ty));
                }
                let v = ctx.f.emit(Opcode::Load, Payload::Load { addr }, ty, loc);
                Some((v, ty))
            }
            Expr::New { ty, array_len, args } => {
                let ety = self.resolve_type(ty);
                let esize = self.types.size_of(ety).unwrap_or(8).max(1);
                let size_v = if let Some(n) = array_len {
                    let (nv, _) = self.lower_expr(n, ctx)?;
                    let es = ctx.f.emit(
                        Opcode::ConstInt,
                        Payload::ConstInt {
                            value: esize as i64,
                        },
                        self.types.primitive(Primitive::ULong),
                        loc,
                    );
                    ctx.f.emit(
                        Opcode::Mul,
                        Payload::Binary {
                            lhs: nv,
                            rhs: es,
                            is_signed: false,
                            is_float: false,
                        },
                        self.types.primitive(Primitive::ULong),
                        loc,
                    )
                } else {
                    ctx.f.emit(
                        Opcode::ConstInt,
                        Payload::ConstInt {
                            value: esize as i64,
                        },
                        self.types.primitive(Primitive::ULong),
                        loc,
                    )
                };
                let op_new = self.strings.intern(if array_len.is_some() {
                    "_Znam"
                } else {
                    "_Znwm"
                });
                let ptr_ty = self.types.pointer_to(ety);
                let p = ctx.f.emit(
                    Opcode::Call,
                    Payload::Call {
                        callee: op_new,
                        args: vec![size_v],
                        variadic_float_args: 0,
                    },
                    ptr_ty,
                    loc,
                );
                if let Some(&a0) = args.first()
                    && let Some((v, _)) = self.lower_expr(a0, ctx)
                {
                    ctx.f
                        .emit_void(Opcode::Store, Payload::Store { addr: p, value: v }, loc);
                }
                Some((p, ptr_ty))
            }
            Expr::Delete { expr, is_array } => {
                let (p, _) = self.lower_expr(expr, ctx)?;
                let op_del = self.strings.intern(if is_array { "_ZdaPv" } else { "_ZdlPv" });
                ctx.f.emit_void(
                    Opcode::Call,
                    Payload::Call {
                        callee: op_del,
                        args: vec![p],
                        variadic_float_args: 0,
                    },
                    loc,
                );
                let void = self.types.void();
                let z = ctx
                    .f
                    .emit(Opcode::ConstInt, Payload::ConstInt { value: 0 }, void, loc);
                Some((z, void))
            }
            Expr::Typeid { arg, is_type } => {
                let class = if is_type {
                    self.arena
                        .as_type_spec(arg)
                        .and_then(|s| match &s.core {
                            CoreType::Named { name, .. } => Some(*name),
                            _ => None,
                        })
                } else {
                    self.static_class_of(arg, ctx)
                };
                let Some(class) = class else {
                    self.diags.push(Diagnostic::error(
                        loc,
                        "typeid requires a complete polymorphic class type here",
                    ));
                    return None;
                };
                if !self.classes.contains_key(&class) {
                    self.diags.push(Diagnostic::error(
                        loc,
                        "typeid on an incomplete type",
                    ));
                    return None;
                }
                let sym = {
                    let n = self.strings.resolve(class).to_string();
                    self.strings.intern(&format!("__rtti_{}", n))
                };
                let void = self.types.void();
                let ty = self.types.pointer_to(void);
                let v = ctx
                    .f
                    .emit(Opcode::GlobalAddr, Payload::Global { name: sym }, ty, loc);
                Some((v, ty))
            }
            Expr::This => {
                let (slot, class) = ctx.this_val?;
                let ct = self.types.class(class);
                let ty = self.types.pointer_to(ct);
                let v = ctx.f.emit(Opcode::Load, Payload::Load { addr: slot }, ty, loc);
                Some((v, ty))
            }
            Expr::InitList { elems } => {
                // Materialize into a temporary; used for struct rvalues.
                if let Some(&first) = elems.first() {
                    return self.lower_expr(first, ctx);
                }
                let ty = self.types.int();
                let v = ctx
                    .f
                    .emit(Opcode::ConstInt, Payload::ConstInt { value: 0 }, ty, loc);
                Some((v, ty))
            }
            other => {
                // Last resort: constant-fold (covers folds, packs already
                // substituted, requires-expressions in boolean contexts).
                match self.eval_const(id) {
                    Ok(v) => {
                        let ty = self.types.int();
                        let c = ctx.f.emit(
                            Opcode::ConstInt,
                            Payload::ConstInt {
                                value: v.as_i64().unwrap_or(0),
                            },
                            ty,
                            loc,
                        );
                        Some((c, ty))
                    }
                    Err(_) => {
                        self.diags.push(Diagnostic::error(
                            loc,
                            format!("expression form {:?} is not lowerable here", std::mem::discriminant(&other)),
                        ));
                        None
                    }
                }
            }
        }
    }

    /// Address of an lvalue expression: (address value, pointee type).
    fn lower_addr(&mut self, id: NodeId, ctx: &mut FnCtx) -> Option<(ValueId, TypeId)> {
        let loc = self.arena.get(id).loc;
        let expr = self.arena.as_expr(id).cloned()?;
        match expr {
            Expr::Ident { name } => {
                if let Some(&(slot, ty)) = ctx.locals.get(&name) {
                    return Some((slot, ty));
                }
                // Member through this.
                if let Some((this_slot, class)) = ctx.this_val {
                    let info = self.classes.get(&class).cloned();
                    if let Some(field) = info
                        .as_ref()
                        .and_then(|i| i.fields.iter().find(|f| f.name == name).cloned())
                    {
                        let this_ty = {
                            let ct = self.types.class(class);
                            self.types.pointer_to(ct)
                        };
                        let this_v = ctx.f.emit(
                            Opcode::Load,
                            Payload::Load { addr: this_slot },
                            this_ty,
                            loc,
                        );
                        let addr = ctx.f.emit(
                            Opcode::Lea,
                            Payload::Lea {
                                base: this_v,
                                offset: field.offset as i64,
                            },
                            self.types.pointer_to(field.ty),
                            loc,
                        );
                        return Some((addr, field.ty));
                    }
                }
                if self.globals.iter().any(|g| g.name == name) {
                    let ty = self.types.int();
                    let addr = ctx.f.emit(
                        Opcode::GlobalAddr,
                        Payload::Global { name },
                        self.types.pointer_to(ty),
                        loc,
                    );
                    return Some((addr, ty));
                }
                None
            }
            Expr::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let (p, pty) = self.lower_expr(operand, ctx)?;
                let pointee = match self.types.get(pty).kind {
                    TypeKind::Pointer { pointee } => pointee,
                    _ => self.types.int(),
                };
                Some((p, pointee))
            }
            Expr::Subscript { base, index } => {
                let (b, bty) = self
                    .lower_addr(base, ctx)
                    .or_else(|| self.lower_expr(base, ctx))?;
                let elem = match self.types.get(self.types.deref_reference(bty)).kind {
                    TypeKind::Array { element, .. } => element,
                    TypeKind::Pointer { pointee } => pointee,
                    _ => self.types.int(),
                };
                // Pointers index through their value; arrays through their
                // storage address.
                let base_v = if matches!(self.types.get(bty).kind, TypeKind::Pointer { .. }) {
                    b
                } else {
                    b
                };
                let (iv, _) = self.lower_expr(index, ctx)?;
                let esize = self.types.size_of(elem).unwrap_or(8).max(1);
                let int = self.types.int();
                let es = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt {
                        value: esize as i64,
                    },
                    int,
                    loc,
                );
                let scaled = ctx.f.emit(
                    Opcode::Mul,
                    Payload::Binary {
                        lhs: iv,
                        rhs: es,
                        is_signed: true,
                        is_float: false,
                    },
                    int,
                    loc,
                );
                let addr = ctx.f.emit(
                    Opcode::Add,
                    Payload::Binary {
                        lhs: base_v,
                        rhs: scaled,
                        is_signed: false,
                        is_float: false,
                    },
                    self.types.pointer_to(elem),
                    loc,
                );
                Some((addr, elem))
            }
            Expr::Member {
                base,
                member,
                is_arrow,
                ..
            } => {
                let (base_addr, bty) = if is_arrow {
                    let (p, pty) = self.lower_expr(base, ctx)?;
                    let pointee = match self.types.get(pty).kind {
                        TypeKind::Pointer { pointee } => pointee,
                        _ => return None,
                    };
                    (p, pointee)
                } else {
                    self.lower_addr(base, ctx)?
                };
                let bty = self.types.deref_reference(bty);
                let bty_unqual = self.types.unqualified(bty);
                let class = match self.types.get(bty_unqual).kind {
                    TypeKind::Class { name } => name,
                    _ => {
                        self.diags.push(Diagnostic::error(
                            loc,
                            "member access on a non-class value",
                        ));
                        return None;
                    }
                };
                let info = self.classes.get(&class).cloned();
                let Some(field) = info
                    .as_ref()
                    .and_then(|i| i.fields.iter().find(|f| f.name == member).cloned())
                else {
                    self.diags.push(Diagnostic::error(
                        loc,
                        format!(
                            "no member '{}' in '{}'",
                            self.strings.resolve(member),
                            self.strings.resolve(class)
                        ),
                    ));
                    return None;
                };
                let addr = ctx.f.emit(
                    Opcode::Lea,
                    Payload::Lea {
                        base: base_addr,
                        offset: field.offset as i64,
                    },
                    self.types.pointer_to(field.ty),
                    loc,
                );
                Some((addr, field.ty))
            }
            _ => None,
        }
    }

    fn lower_unary(
        &mut self,
        op: UnaryOp,
        operand: NodeId,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) -> Option<(ValueId, TypeId)> {
        match op {
            UnaryOp::Plus => self.lower_expr(operand, ctx),
            UnaryOp::Minus => {
                let (v, ty) = self.lower_expr(operand, ctx)?;
                let r = ctx.f.emit(Opcode::Neg, Payload::Unary { operand: v }, ty, loc);
                Some((r, ty))
            }
            UnaryOp::Not => {
                let (v, _) = self.lower_expr(operand, ctx)?;
                let b = self.types.bool_();
                let r = ctx.f.emit(Opcode::Not, Payload::Unary { operand: v }, b, loc);
                Some((r, b))
            }
            UnaryOp::BitNot => {
                let (v, ty) = self.lower_expr(operand, ctx)?;
                let neg_one = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt { value: -1 },
                    ty,
                    loc,
                );
                let r = ctx.f.emit(
                    Opcode::Xor,
                    Payload::Binary {
                        lhs: v,
                        rhs: neg_one,
                        is_signed: true,
                        is_float: false,
                    },
                    ty,
                    loc,
                );
                Some((r, ty))
            }
            UnaryOp::Deref => {
                let (p, pty) = self.lower_expr(operand, ctx)?;
                let pointee = match self.types.get(pty).kind {
                    TypeKind::Pointer { pointee } => pointee,
                    _ => {
                        self.diags
                            .push(Diagnostic::error(loc, "dereference of a non-pointer"));
                        return None;
                    }
                };
                if self.types.is_class(pointee) {
                    return Some((p, pointee));
                }
                let v = ctx
                    .f
                    .emit(Opcode::Load, Payload::Load { addr: p }, pointee, loc);
                Some((v, pointee))
            }
            UnaryOp::AddrOf => {
                let (addr, ty) = self.lower_addr(operand, ctx)?;
                let pty = self.types.pointer_to(ty);
                Some((addr, pty))
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let (addr, ty) = self.lower_addr(operand, ctx)?;
                let old = ctx.f.emit(Opcode::Load, Payload::Load { addr }, ty, loc);
                let is_ptr = matches!(self.types.get(ty).kind, TypeKind::Pointer { .. });
                let delta: i64 = if is_ptr {
                    let pointee = match self.types.get(ty).kind {
                        TypeKind::Pointer { pointee } => pointee,
                        _ => self.types.int(),
                    };
                    self.types.size_of(pointee).unwrap_or(1) as i64
                } else {
                    1
                };
                let delta = if matches!(op, UnaryOp::PreDec | UnaryOp::PostDec) {
                    -delta
                } else {
                    delta
                };
                let d = ctx.f.emit(
                    Opcode::ConstInt,
                    Payload::ConstInt { value: delta },
                    ty,
                    loc,
                );
                let new = ctx.f.emit(
                    Opcode::Add,
                    Payload::Binary {
                        lhs: old,
                        rhs: d,
                        is_signed: true,
                        is_float: self
                            .types
                            .primitive_of(ty)
                            .is_some_and(|p| p.is_floating()),
                    },
                    ty,
                    loc,
                );
                ctx.f
                    .emit_void(Opcode::Store, Payload::Store { addr, value: new }, loc);
                Some((
                    if matches!(op, UnaryOp::PostInc | UnaryOp::PostDec) {
                        old
                    } else {
                        new
                    },
                    ty,
                ))
            }
        }
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) -> Option<(ValueId, TypeId)> {
        use BinaryOp::*;
        // Short-circuit logicals become control flow.
        if matches!(op, LogicalAnd | LogicalOr) {
            let b = self.types.bool_();
            let rhs_l = ctx.f.new_label();
            let end_l = ctx.f.new_label();
            let (lv, _) = self.lower_expr(lhs, ctx)?;
            let (then_t, else_t) = if op == LogicalAnd {
                (rhs_l, end_l)
            } else {
                (end_l, rhs_l)
            };
            ctx.f.emit_void(
                Opcode::Br,
                Payload::Branch {
                    cond: lv,
                    then_target: then_t,
                    else_target: else_t,
                },
                loc,
            );
            ctx.f.bind_label(rhs_l, loc);
            let (rv, _) = self.lower_expr(rhs, ctx)?;
            ctx.f
                .emit_void(Opcode::Jmp, Payload::Jump { target: end_l }, loc);
            ctx.f.bind_label(end_l, loc);
            let phi = ctx.f.emit(
                Opcode::Phi,
                Payload::Phi {
                    incoming: vec![(rhs_l, rv), (end_l, lv)],
                },
                b,
                loc,
            );
            return Some((phi, b));
        }
        if op == Comma {
            self.lower_expr(lhs, ctx)?;
            return self.lower_expr(rhs, ctx);
        }

        let (lv, lty) = self.lower_expr(lhs, ctx)?;
        let (rv, rty) = self.lower_expr(rhs, ctx)?;

        // Pointer arithmetic scales by element size.
        if matches!(op, Add | Sub)
            && matches!(self.types.get(lty).kind, TypeKind::Pointer { .. })
        {
            let pointee = match self.types.get(lty).kind {
                TypeKind::Pointer { pointee } => pointee,
                _ => self.types.int(),
            };
            let esize = self.types.size_of(pointee).unwrap_or(1).max(1);
            let int = self.types.int();
            let es = ctx.f.emit(
                Opcode::ConstInt,
                Payload::ConstInt {
                    value: esize as i64,
                },
                int,
                loc,
            );
            let scaled = ctx.f.emit(
                Opcode::Mul,
                Payload::Binary {
                    lhs: rv,
                    rhs: es,
                    is_signed: true,
                    is_float: false,
                },
                int,
                loc,
            );
            let r = ctx.f.emit(
                if op == Add { Opcode::Add } else { Opcode::Sub },
                Payload::Binary {
                    lhs: lv,
                    rhs: scaled,
                    is_signed: false,
                    is_float: false,
                },
                lty,
                loc,
            );
            return Some((r, lty));
        }

        // Usual arithmetic conversions decide the operation type.
        let common = self
            .types
            .usual_arithmetic(lty, rty)
            .unwrap_or(lty);
        let lc = self.emit_conversion(lv, lty, common, ctx, loc);
        let rc = self.emit_conversion(rv, rty, common, ctx, loc);
        let signed = self
            .types
            .primitive_of(common)
            .map(|p| p.is_signed())
            .unwrap_or(true);
        let is_float = self
            .types
            .primitive_of(common)
            .is_some_and(|p| p.is_floating());
        let (opcode, result_ty) = match op {
            Add => (Opcode::Add, common),
            Sub => (Opcode::Sub, common),
            Mul => (Opcode::Mul, common),
            Div => (Opcode::Div, common),
            Rem => (Opcode::Mod, common),
            Shl => (Opcode::Shl, common),
            Shr => (Opcode::Shr, common),
            BitAnd => (Opcode::And, common),
            BitOr => (Opcode::Or, common),
            BitXor => (Opcode::Xor, common),
            Eq => (Opcode::CmpEq, self.types.bool_()),
            Ne => (Opcode::CmpNe, self.types.bool_()),
            Lt => (Opcode::CmpLt, self.types.bool_()),
            Le => (Opcode::CmpLe, self.types.bool_()),
            Gt => (Opcode::CmpGt, self.types.bool_()),
            Ge => (Opcode::CmpGe, self.types.bool_()),
            Spaceship => {
                // (a > b) - (a < b): -1/0/1 in an int.
                let int = self.types.int();
                let b = self.types.bool_();
                let gt = ctx.f.emit(
                    Opcode::CmpGt,
                    Payload::Binary {
                        lhs: lc,
                        rhs: rc,
                        is_signed: signed,
                        is_float,
                    },
                    b,
                    loc,
                );
                let lt = ctx.f.emit(
                    Opcode::CmpLt,
                    Payload::Binary {
                        lhs: lc,
                        rhs: rc,
                        is_signed: signed,
                        is_float,
                    },
                    b,
                    loc,
                );
                let r = ctx.f.emit(
                    Opcode::Sub,
                    Payload::Binary {
                        lhs: gt,
                        rhs: lt,
                        is_signed: true,
                        is_float: false,
                    },
                    int,
                    loc,
                );
                return Some((r, int));
            }
            LogicalAnd | LogicalOr | Comma | MemberPtr => return None,
        };
        let r = ctx.f.emit(
            opcode,
            Payload::Binary {
                lhs: lc,
                rhs: rc,
                is_signed: signed,
                is_float,
            },
            result_ty,
            loc,
        );
        Some((r, result_ty))
    }

    /// Emit a conversion instruction when `from` and `to` differ in width
    /// or domain.
    fn emit_conversion(
        &mut self,
        v: ValueId,
        from: TypeId,
        to: TypeId,
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) -> ValueId {
        if from == to {
            return v;
        }
        let (Some(pf), Some(pt)) = (self.types.primitive_of(from), self.types.primitive_of(to))
        else {
            return v;
        };
        let op = match (pf.is_floating(), pt.is_floating()) {
            (false, true) => Opcode::CastIntToFp,
            (true, false) => Opcode::CastFpToInt,
            (true, true) => {
                if pt.size(true) > pf.size(true) {
                    Opcode::CastFpExt
                } else {
                    Opcode::CastFpTrunc
                }
            }
            (false, false) => {
                let fs = pf.size(true);
                let ts = pt.size(true);
                if ts > fs {
                    if pf.is_signed() {
                        Opcode::CastSext
                    } else {
                        Opcode::CastZext
                    }
                } else if ts < fs {
                    Opcode::CastTrunc
                } else {
                    return v;
                }
            }
        };
        ctx.f.emit(op, Payload::Cast { operand: v }, to, loc)
    }

    fn static_class_of(&mut self, expr: NodeId, ctx: &mut FnCtx) -> Option<StrId> {
        match self.arena.as_expr(expr) {
            Some(Expr::Ident { name }) => {
                let name = *name;
                ctx.locals.get(&name).and_then(|&(_, ty)| {
                    let t = self.types.deref_reference(ty);
                    let t = match self.types.get(t).kind {
                        TypeKind::Pointer { pointee } => pointee,
                        _ => t,
                    };
                    let t_unqual = self.types.unqualified(t);
                    match self.types.get(t_unqual).kind {
                        TypeKind::Class { name } => Some(name),
                        _ => None,
                    }
                })
            }
            _ => None,
        }
    }

    fn lower_call(
        &mut self,
        callee: NodeId,
        args: &[NodeId],
        ctx: &mut FnCtx,
        loc: SourceLoc,
    ) -> Option<(ValueId, TypeId)> {
        // Member call: possibly virtual dispatch.
        if let Some(Expr::Member {
            base,
            member,
            is_arrow,
            ..
        }) = self.arena.as_expr(callee).cloned()
        {
            let (obj_addr, obj_ty) = if is_arrow {
                let (p, pty) = self.lower_expr(base, ctx)?;
                let pointee = match self.types.get(pty).kind {
                    TypeKind::Pointer { pointee } => pointee,
                    _ => return None,
                };
                (p, pointee)
            } else {
                self.lower_addr(base, ctx)?
            };
            let obj_ty = self.types.deref_reference(obj_ty);
            let obj_ty_unqual = self.types.unqualified(obj_ty);
            let class = match self.types.get(obj_ty_unqual).kind {
                TypeKind::Class { name } => name,
                _ => {
                    self.diags
                        .push(Diagnostic::error(loc, "member call on a non-class value"));
                    return None;
                }
            };

            // Lazy member instantiation on first use.
            if self
                .registry
                .needs_member_instantiation(self.strings, class, member)
            {
                match self
                    .registry
                    .instantiate_member(self.arena, self.strings, class, member, loc)
                {
                    Ok(Some(decl)) => {
                        if let Some(info) = self.classes.get_mut(&class) {
                            info.methods.insert(member, decl);
                        }
                        self.eval_ctx.methods.insert((class, member), decl);
                        self.lower_function_decl(decl, Some(class));
                    }
                    Ok(None) => {}
                    Err(d) => self.diags.push(d),
                }
            }

            let info = self.classes.get(&class).cloned().unwrap_or_default();
            let ret_ty = info
                .methods
                .get(&member)
                .and_then(|&m| match self.arena.as_decl(m) {
                    Some(Decl::Function { ret, .. }) => Some(*ret),
                    _ => None,
                })
                .map(|r| self.resolve_type(r))
                .unwrap_or_else(|| self.types.int());

            let mut call_args = vec![obj_addr];
            for &a in args {
                let (v, _) = self.lower_expr(a, ctx)?;
                call_args.push(v);
            }

            // Virtual dispatch through pointer/reference bases.
            let is_virtual = info.vslots.iter().any(|(n, _)| *n == member);
            let base_is_indirect = is_arrow
                || matches!(
                    self.arena.as_expr(base).map(|e| matches!(e, Expr::Ident { name } if {
                        ctx.locals
                            .get(name)
                            .is_some_and(|&(_, t)| self.types.is_reference(t))
                    })),
                    Some(true)
                );
            if is_virtual && base_is_indirect {
                let slot = info
                    .vslots
                    .iter()
                    .position(|(n, _)| *n == member)
                    .unwrap_or(0) as u32;
                let v = ctx.f.emit(
                    Opcode::VCall,
                    Payload::VCall {
                        object: obj_addr,
                        slot,
                        args: call_args,
                        this_adjust: 0,
                    },
                    ret_ty,
                    loc,
                );
                return Some((v, ret_ty));
            }

            let Some(&mdecl) = info.methods.get(&member) else {
                self.diags.push(Diagnostic::error(
                    loc,
                    format!(
                        "no member function '{}' in '{}'",
                        self.strings.resolve(member),
                        self.strings.resolve(class)
                    ),
                ));
                return None;
            };
            if matches!(
                self.arena.as_decl(mdecl),
                Some(Decl::Function { specs, .. }) if specs.is_pure
            ) {
                self.diags.push(Diagnostic::error(
                    loc,
                    format!(
                        "call to pure virtual function '{}'",
                        self.strings.resolve(member)
                    ),
                ));
                return None;
            }
            // Ensure the method body is lowered (members of ordinary
            // classes are lowered on demand too).
            self.lower_function_decl(mdecl, Some(class));
            let sym = self.mangle_method(class, member, mdecl);
            let v = ctx.f.emit(
                Opcode::Call,
                Payload::Call {
                    callee: sym,
                    args: call_args,
                    variadic_float_args: 0,
                },
                ret_ty,
                loc,
            );
            return Some((v, ret_ty));
        }

        // Free function (possibly a function template instantiation).
        if let Some(Expr::Ident { name }) = self.arena.as_expr(callee).cloned() {
            // Constructor-as-call: `T(args)` for a known class produces a
            // temporary.
            if self.classes.contains_key(&name) {
                let cty = self.types.class(name);
                let size = self.types.size_of(cty).unwrap_or(8).max(1);
                let align = self.types.align_of(cty).unwrap_or(8).max(1);
                let tmp = ctx.f.emit(
                    Opcode::Alloca,
                    Payload::Alloca { size, align },
                    self.types.pointer_to(cty),
                    loc,
                );
                self.construct_into(tmp, name, args.to_vec(), ctx, loc);
                return Some((tmp, cty));
            }

            let decl = self.select_overload(name, args, ctx, loc).or_else(|| {
                // Function template: pick the first candidate that
                // substitutes (SFINAE discards failures silently).
                let candidates: Vec<_> = self
                    .registry
                    .function_templates_named(name)
                    .to_vec();
                for cand in &candidates {
                    // Deduce from arguments is approximated by explicit
                    // argument-free substitution against arg types.
                    let arg_specs: Vec<NodeId> = args
                        .iter()
                        .filter_map(|&a| self.type_spec_of_expr(a, ctx))
                        .collect();
                    match self.registry.substitute_function(
                        self.arena,
                        self.strings,
                        cand,
                        &arg_specs,
                        loc,
                    ) {
                        Ok(Some(decl)) => {
                            // Check the requires-clause under the same
                            // binding before accepting the candidate.
                            if let Some(req) = cand.requires_clause
                                && !self.requires_holds(req, cand, &arg_specs)
                            {
                                continue;
                            }
                            self.eval_ctx.functions.insert(name, decl);
                            self.lower_function_decl(decl, None);
                            return Some(decl);
                        }
                        Ok(None) => continue,
                        Err(d) => {
                            self.diags.push(d);
                            return None;
                        }
                    }
                }
                None
            });
            let Some(decl) = decl else {
                self.diags.push(Diagnostic::error(
                    loc,
                    format!(
                        "no matching function for call to '{}'",
                        self.strings.resolve(name)
                    ),
                ));
                return None;
            };
            // Immediate functions: every call to a consteval function is a
            // constant expression or a diagnostic.
            let is_consteval = matches!(
                self.arena.as_decl(decl),
                Some(Decl::Function { specs, .. }) if specs.is_consteval
            );
            if is_consteval {
                let mut ev = Evaluator::new(
                    self.arena,
                    self.strings,
                    &self.eval_ctx,
                    self.config.constexpr_step_limit,
                );
                match ev.call_function(decl, None, args, loc) {
                    Ok(v) => {
                        let ty = self.types.int();
                        let c = ctx.f.emit(
                            Opcode::ConstInt,
                            Payload::ConstInt {
                                value: v.as_i64().unwrap_or(0),
                            },
                            ty,
                            loc,
                        );
                        return Some((c, ty));
                    }
                    Err(d) => {
                        self.diags.push(Diagnostic::error(
                            loc,
                            format!(
                                "call to consteval function is not a constant expression: {}",
                                d.message
                            ),
                        ));
                        return None;
                    }
                }
            }
            let (params, ret) = match self.arena.as_decl(decl).cloned() {
                Some(Decl::Function { params, ret, .. }) => (params, ret),
                _ => return None,
            };
            let ret_ty = self.resolve_type(ret);
            let ptypes: Vec<TypeId> = params.iter().map(|&p| self.param_type(p)).collect();
            let sym = {
                let f = FunctionName {
                    namespaces: &[],
                    class: None,
                    name,
                    params: &ptypes,
                    is_const_method: false,
                };
                let m = mangle_function(self.scheme, self.strings, self.types, &f);
                self.strings.intern(&m)
            };
            // Make sure the callee is lowered.
            self.lower_function_decl(decl, None);
            let mut call_args = Vec::with_capacity(args.len());
            let mut float_args = 0u8;
            for &a in args {
                let (v, t) = self.lower_expr(a, ctx)?;
                if self.types.primitive_of(t).is_some_and(|p| p.is_floating()) {
                    float_args += 1;
                }
                call_args.push(v);
            }
            let v = ctx.f.emit(
                Opcode::Call,
                Payload::Call {
                    callee: sym,
                    args: call_args,
                    variadic_float_args: float_args,
                },
                ret_ty,
                loc,
            );
            return Some((v, ret_ty));
        }

        // Indirect call through a value.
        let (target, _) = self.lower_expr(callee, ctx)?;
        let mut call_args = Vec::with_capacity(args.len());
        for &a in args {
            let (v, _) = self.lower_expr(a, ctx)?;
            call_args.push(v);
        }
        let int = self.types.int();
        let v = ctx.f.emit(
            Opcode::CallIndirect,
            Payload::CallIndirect {
                target,
                args: call_args,
            },
            int,
            loc,
        );
        Some((v, int))
    }

    /// Overload resolution over the free-function set: candidates are
    /// ranked by a lexicographic tuple over per-parameter conversion ranks
    /// (exact < promotion < standard < user-defined); ties among
    /// equally-ranked candidates are a diagnostic.
    fn select_overload(
        &mut self,
        name: StrId,
        args: &[NodeId],
        ctx: &FnCtx,
        loc: SourceLoc,
    ) -> Option<NodeId> {
        let candidates = self.overloads.get(&name).cloned().unwrap_or_default();
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }
        let arg_types: Vec<Option<TypeId>> = args
            .iter()
            .map(|&a| self.static_type_of_expr(a, ctx))
            .collect();
        let mut viable: Vec<(NodeId, Vec<crate::types::ConvRank>)> = Vec::new();
        'cands: for &c in &candidates {
            let params = match self.arena.as_decl(c).cloned() {
                Some(Decl::Function { params, .. }) => params,
                _ => continue,
            };
            if params.len() != args.len() {
                continue;
            }
            let mut ranks = Vec::with_capacity(args.len());
            for (&p, at) in params.iter().zip(&arg_types) {
                let pt = self.param_type(p);
                let Some(at) = at else {
                    ranks.push(crate::types::ConvRank::exact());
                    continue;
                };
                match self.types.standard_conversion(*at, pt) {
                    Some(r) => ranks.push(r),
                    None => continue 'cands,
                }
            }
            // Sort ranks descending so tuple comparison is worst-first.
            ranks.sort_by(|a, b| b.cmp(a));
            viable.push((c, ranks));
        }
        if viable.is_empty() {
            return None;
        }
        viable.sort_by(|a, b| a.1.cmp(&b.1));
        if viable.len() > 1 && viable[0].1 == viable[1].1 {
            self.diags.push(Diagnostic::error(
                loc,
                format!(
                    "call to '{}' is ambiguous",
                    self.strings.resolve(name)
                ),
            ));
        }
        Some(viable[0].0)
    }

    /// Static type of an argument expression without emitting IR, for
    /// overload ranking.
    fn static_type_of_expr(&mut self, e: NodeId, ctx: &FnCtx) -> Option<TypeId> {
        match self.arena.as_expr(e)? {
            Expr::IntLit { suffix, .. } => Some(if suffix.is_unsigned() {
                self.types.primitive(Primitive::UInt)
            } else {
                self.types.int()
            }),
            Expr::FloatLit { suffix, .. } => {
                Some(self.types.primitive(if *suffix == crate::lexer::FloatSuffix::F {
                    Primitive::Float
                } else {
                    Primitive::Double
                }))
            }
            Expr::BoolLit { .. } => Some(self.types.bool_()),
            Expr::CharLit { .. } => Some(self.types.primitive(Primitive::Char)),
            Expr::NullptrLit => Some(self.types.primitive(Primitive::NullptrT)),
            Expr::Ident { name } => ctx.locals.get(name).map(|&(_, t)| t),
            Expr::Unary {
                op: UnaryOp::AddrOf,
                operand,
            } => {
                let inner = self.static_type_of_expr(*operand, ctx)?;
                Some(self.types.pointer_to(inner))
            }
            _ => None,
        }
    }

    /// Best-effort static type spec of an argument expression, for function
    /// template deduction.
    fn type_spec_of_expr(&mut self, e: NodeId, ctx: &FnCtx) -> Option<NodeId> {
        let loc = self.arena.get(e).loc;
        let prim = match self.arena.as_expr(e)? {
            Expr::IntLit { .. } => Primitive::Int,
            Expr::FloatLit { .. } => Primitive::Double,
            Expr::BoolLit { .. } => Primitive::Bool,
            Expr::CharLit { .. } => Primitive::Char,
            Expr::Ident { name } => {
                let (_, ty) = ctx.locals.get(name).copied()?;
                let p = self.types.primitive_of(ty)?;
                p
            }
            _ => Primitive::Int,
        };
        Some(self.arena.type_spec(
            TypeSpec {
                core: CoreType::Primitive(prim),
                is_const: false,
                is_volatile: false,
                derived: Vec::new(),
                is_pack: false,
            },
            loc,
        ))
    }

    fn requires_holds(
        &mut self,
        req: NodeId,
        cand: &crate::templates::FunctionTemplate,
        args: &[NodeId],
    ) -> bool {
        // Substitute the constraint and constant-evaluate it; failure or
        // false discards the candidate (SFINAE).
        let loc = self.arena.get(req).loc;
        let map = match crate::templates::bind_params(
            self.arena,
            self.strings,
            &cand.params,
            args,
            loc,
        ) {
            Ok(m) => m,
            Err(_) => return false,
        };
        let mut subst = crate::templates::Substituter {
            arena: self.arena,
            strings: self.strings,
            map: &map,
            sfinae: true,
            pack_index: None,
            skip_member_bodies: false,
        };
        let substituted = match subst.subst(req) {
            Ok(n) => n,
            Err(_) => return false,
        };
        match self.eval_const(substituted) {
            Ok(v) => v.truthy().unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn assign_opcode(op: AssignOp, types: &TypeRegistry, ty: TypeId) -> (Opcode, bool) {
    let signed = types.primitive_of(ty).map(|p| p.is_signed()).unwrap_or(true);
    let opcode = match op {
        AssignOp::Add => Opcode::Add,
        AssignOp::Sub => Opcode::Sub,
        AssignOp::Mul => Opcode::Mul,
        AssignOp::Div => Opcode::Div,
        AssignOp::Rem => Opcode::Mod,
        AssignOp::Shl => Opcode::Shl,
        AssignOp::Shr => Opcode::Shr,
        AssignOp::And => Opcode::And,
        AssignOp::Or => Opcode::Or,
        AssignOp::Xor => Opcode::Xor,
        AssignOp::Assign => Opcode::Copy,
    };
    (opcode, signed)
}

fn align_to(v: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    v.div_ceil(align) * align
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x1_0000_0000_01b3);
    }
    hash
}

fn value_to_bytes(v: &Value, size: u64) -> Vec<u8> {
    let mut out = vec![0u8; size as usize];
    match v {
        Value::Int { v, .. } => {
            let b = v.to_le_bytes();
            let n = (size as usize).min(8);
            out[..n].copy_from_slice(&b[..n]);
        }
        Value::UInt { v, .. } => {
            let b = v.to_le_bytes();
            let n = (size as usize).min(8);
            out[..n].copy_from_slice(&b[..n]);
        }
        Value::Float { v, ty } => {
            if *ty == Primitive::Float {
                let b = (*v as f32).to_le_bytes();
                let n = (size as usize).min(4);
                out[..n].copy_from_slice(&b[..n]);
            } else {
                let b = v.to_le_bytes();
                let n = (size as usize).min(8);
                out[..n].copy_from_slice(&b[..n]);
            }
        }
        Value::Bool(b) => {
            if !out.is_empty() {
                out[0] = *b as u8;
            }
        }
        Value::Char { v, .. } => {
            if !out.is_empty() {
                out[0] = *v as u8;
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn lower_src(src: &str) -> (LowerOutput, StringTable) {
        let mut strings = StringTable::new();
        let file = strings.intern("t.cpp");
        let toks = Lexer::new(src, file).lex().unwrap();
        let out = Parser::new(toks, &mut strings).parse();
        assert!(out.diags.is_empty(), "parse diags: {:?}", out.diags);
        let mut arena = out.arena;
        let mut registry = out.registry;
        let config = CompilerConfig::default();
        let mut types = TypeRegistry::new(true);
        let lowerer = Lowerer::new(
            &mut arena,
            &mut strings,
            &mut types,
            &mut registry,
            &config,
        );
        (lowerer.lower_translation_unit(out.root), strings)
    }

    fn find_fn<'a>(out: &'a LowerOutput, strings: &StringTable, display: &str) -> &'a IrFunction {
        out.functions
            .iter()
            .find(|f| strings.resolve(f.display_name) == display)
            .unwrap_or_else(|| {
                panic!(
                    "function '{}' not lowered; have: {:?}",
                    display,
                    out.functions
                        .iter()
                        .map(|f| strings.resolve(f.display_name))
                        .collect::<Vec<_>>()
                )
            })
    }

    fn calls_to<'a>(f: &'a IrFunction, strings: &StringTable, needle: &str) -> Vec<&'a Instr> {
        f.instrs
            .iter()
            .filter(|i| match &i.payload {
                Payload::Call { callee, .. } => strings.resolve(*callee).contains(needle),
                _ => false,
            })
            .collect()
    }

    #[test]
    fn test_rvo_single_constructor_no_copy() {
        let (out, strings) = lower_src(
            "struct Counter {\n\
               int value;\n\
               Counter(int v) : value(v) {}\n\
               Counter(const Counter& other) : value(other.value) {}\n\
             };\n\
             Counter makeCounter() { Counter c(42); c.value += 8; return c; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "makeCounter");
        // Exactly one constructor invocation, and none of them is the copy
        // constructor (its mangling carries a reference parameter).
        let ctor_calls = calls_to(f, &strings, "Counter");
        assert_eq!(ctor_calls.len(), 1, "expected exactly one ctor call");
        if let Payload::Call { callee, .. } = &ctor_calls[0].payload {
            let sym = strings.resolve(*callee);
            assert!(!sym.contains("RK"), "copy constructor used: {}", sym);
        }
    }

    #[test]
    fn test_destructors_reverse_order_on_scope_exit() {
        let (out, strings) = lower_src(
            "struct Guard { int id; Guard(int i) : id(i) {} ~Guard() {} };\n\
             int f() { Guard a(1); Guard b(2); return 0; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        let dtor_args: Vec<ValueId> = f
            .instrs
            .iter()
            .filter_map(|i| match &i.payload {
                Payload::Call { callee, args, .. }
                    if strings.resolve(*callee).contains("Guard")
                        && args.len() == 1 =>
                {
                    Some(args[0])
                }
                _ => None,
            })
            .collect();
        assert_eq!(dtor_args.len(), 2, "both destructors run");
        // b (constructed second, higher value id) is destroyed first.
        assert!(
            dtor_args[0] > dtor_args[1],
            "destructors not in reverse construction order: {:?}",
            dtor_args
        );
    }

    #[test]
    fn test_virtual_dispatch_through_pointer_uses_vcall() {
        let (out, strings) = lower_src(
            "struct Base {\n\
               virtual int getValue() { return 10; }\n\
               virtual ~Base() {}\n\
             };\n\
             struct Derived : public Base {\n\
               int getValue() override { return 30; }\n\
             };\n\
             int probe(Base* b) { return b->getValue(); }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "probe");
        assert!(
            f.instrs.iter().any(|i| i.op == Opcode::VCall),
            "virtual call did not lower to VCall"
        );
        // A vtable exists for both classes.
        assert!(out.vtables.iter().count() >= 2);
        assert!(!out.rtti.is_empty());
    }

    #[test]
    fn test_if_constexpr_dead_branch_not_lowered() {
        let (out, strings) = lower_src(
            "int f() { if constexpr (1 + 1 == 2) { return 7; } else { return 9; } }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        let has = |v: i64| {
            f.instrs
                .iter()
                .any(|i| matches!(i.payload, Payload::ConstInt { value } if value == v))
        };
        assert!(has(7), "taken branch missing");
        assert!(!has(9), "dead branch was lowered");
    }

    #[test]
    fn test_static_assert_failure_diagnosed() {
        let (out, _) = lower_src("static_assert(1 == 2, \"math broke\");");
        assert_eq!(out.diags.len(), 1);
        assert!(out.diags[0].message.contains("math broke"));
    }

    #[test]
    fn test_static_assert_constexpr_function() {
        let (out, _) = lower_src(
            "constexpr int f() { int* p = new int(42); int r = *p; delete p; return r; }\n\
             static_assert(f() == 42);",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_goto_out_of_scope_runs_destructor() {
        let (out, strings) = lower_src(
            "struct Guard { Guard() {} ~Guard() {} };\n\
             int f() {\n\
               int x = 0;\n\
             again:\n\
               x += 1;\n\
               if (x < 3) { Guard g; goto again; }\n\
               return x;\n\
             }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        // The goto path calls the Guard destructor before jumping.
        let dtors = calls_to(f, &strings, "Guard");
        assert!(
            dtors.iter().count() >= 1,
            "goto out of scope must run destructors"
        );
    }

    #[test]
    fn test_template_class_member_lazily_lowered() {
        let (out, strings) = lower_src(
            "template<typename T> struct Holder {\n\
               T value;\n\
               T get() { return value; }\n\
             };\n\
             int f() { Holder<int> h; h.value = 5; return h.get(); }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        // The instantiated member was lowered with a hash-suffixed class.
        assert!(
            out.functions
                .iter()
                .any(|g| strings.resolve(g.name).contains("Holder$")),
            "lazy member function missing: {:?}",
            out.functions
                .iter()
                .map(|g| strings.resolve(g.name))
                .collect::<Vec<_>>()
        );
        let f = find_fn(&out, &strings, "f");
        assert!(!f.instrs.is_empty());
    }

    #[test]
    fn test_partial_specialization_member_layout() {
        let (out, _) = lower_src(
            "template<typename T> struct S { int v; };\n\
             template<typename T> struct S<T*> { int v; };\n\
             int f() { S<int*> s; s.v = 1; return s.v; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
    }

    #[test]
    fn test_globals_and_string_literals_collected() {
        let (out, strings) = lower_src(
            "int counter = 7;\n\
             const char* greet() { return \"hello\"; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        assert!(out.globals.iter().any(|g| strings.resolve(g.name) == "counter"));
        assert!(
            out.globals
                .iter()
                .any(|g| strings.resolve(g.name).starts_with("__str_")),
            "string literal not collected"
        );
        let counter = out
            .globals
            .iter()
            .find(|g| strings.resolve(g.name) == "counter")
            .unwrap();
        assert_eq!(&counter.init[..4], &7i32.to_le_bytes());
    }

    #[test]
    fn test_enum_constants_fold() {
        let (out, strings) = lower_src(
            "enum Color { Red, Green = 5, Blue };\n\
             int f() { return Blue; }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        assert!(
            f.instrs
                .iter()
                .any(|i| matches!(i.payload, Payload::ConstInt { value: 6 })),
            "Blue should fold to 6"
        );
    }

    #[test]
    fn test_try_lowered_to_try_region() {
        let (out, strings) = lower_src(
            "int f() { try { return 1; } catch (int e) { return 2; } }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        assert!(f.instrs.iter().any(|i| i.op == Opcode::TryBegin));
        assert!(f.instrs.iter().any(|i| i.op == Opcode::TryEnd));
    }

    #[test]
    fn test_sfinae_overload_selection() {
        let (out, strings) = lower_src(
            "template<typename T> struct is_int { static const bool value = __is_same(T, int); };\n\
             int pick(int v) { return v + 100; }\n\
             double pick(double v) { return 0.0; }\n\
             int f() { return pick(42); }",
        );
        assert!(out.diags.is_empty(), "{:?}", out.diags);
        let f = find_fn(&out, &strings, "f");
        assert!(
            f.instrs.iter().any(|i| matches!(
                &i.payload,
                Payload::Call { callee, .. } if strings.resolve(*callee).contains("pick")
            )),
            "call to pick missing"
        );
    }
}
