//! Abstract syntax tree
//!
//! Nodes live in a per-translation-unit arena and own their children by
//! [`NodeId`] index, never by pointer; shared subtrees are forbidden, so a
//! subtree can be cloned or substituted by walking indices. Each node has
//! an optional semantic payload slot filled after analysis (resolved
//! symbol, type index, evaluated constant).

use crate::diag::SourceLoc;
use crate::lexer::{EncodingPrefix, FloatSuffix, IntSuffix};
use crate::strings::StrId;
use crate::types::{Primitive, TypeId};

/// Index of a node in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Constant attached to a node after evaluation. The constant evaluator's
/// richer value universe (pointers, aggregates) stays internal to it; only
/// scalars are pinned on nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvalConst {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// Post-analysis payload slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemaInfo {
    /// Mangled name of the resolved symbol, when the node names one.
    pub symbol: Option<StrId>,
    /// Resolved type.
    pub ty: Option<TypeId>,
    /// Evaluated constant, when the node folded.
    pub value: Option<EvalConst>,
}

/// One AST node: kind, location, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub loc: SourceLoc,
    pub sema: SemaInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Decl(Decl),
    Stmt(Stmt),
    Expr(Expr),
    TypeSpec(TypeSpec),
}

// ============================================================
//                       DECLARATIONS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKey {
    Class,
    Struct,
    Union,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    None,
    Static,
    Extern,
    ThreadLocal,
}

/// Function specifiers collected from both sides of the declarator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuncSpecs {
    pub is_virtual: bool,
    pub is_pure: bool,
    pub is_override: bool,
    pub is_final: bool,
    pub is_static: bool,
    pub is_const: bool,
    pub is_volatile: bool,
    pub is_constexpr: bool,
    pub is_consteval: bool,
    pub is_inline: bool,
    pub is_explicit: bool,
    pub is_variadic: bool,
    pub ref_qualifier: Option<crate::types::RefKind>,
    /// `noexcept` / `noexcept(expr)`; the expression folds during analysis.
    pub noexcept: Option<Option<NodeId>>,
    /// Trailing `requires` clause.
    pub requires_clause: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseSpec {
    pub name: StrId,
    pub access: Access,
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateParamKind {
    /// `typename T` / `class T` / `Concept T`.
    Type {
        default: Option<NodeId>,
        constraint: Option<StrId>,
    },
    /// `int N`, `auto V`.
    NonType { ty: NodeId, default: Option<NodeId> },
    /// `template<typename> class TT`.
    Template,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateParam {
    pub name: StrId,
    pub kind: TemplateParamKind,
    pub is_pack: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    TranslationUnit {
        decls: Vec<NodeId>,
    },
    Namespace {
        name: Option<StrId>,
        decls: Vec<NodeId>,
    },
    /// `using ns::name;`
    Using {
        path: Vec<StrId>,
        name: StrId,
    },
    /// `using namespace ns;`
    UsingDirective {
        path: Vec<StrId>,
    },
    /// `using Name = Type;`
    Alias {
        name: StrId,
        target: NodeId,
    },
    Typedef {
        name: StrId,
        target: NodeId,
    },
    Enum {
        name: StrId,
        scoped: bool,
        underlying: Option<NodeId>,
        enumerators: Vec<(StrId, Option<NodeId>)>,
    },
    Class {
        key: ClassKey,
        name: StrId,
        bases: Vec<BaseSpec>,
        members: Vec<NodeId>,
        is_definition: bool,
    },
    Field {
        name: StrId,
        ty: NodeId,
        init: Option<NodeId>,
        access: Access,
        is_static: bool,
        is_mutable: bool,
    },
    Function {
        name: StrId,
        /// Class name for out-of-line member definitions.
        class: Option<StrId>,
        params: Vec<NodeId>,
        ret: NodeId,
        body: Option<NodeId>,
        specs: FuncSpecs,
        access: Access,
        storage: Storage,
    },
    Constructor {
        class: StrId,
        params: Vec<NodeId>,
        /// `(member-or-base, arguments)` pairs in source order.
        init_list: Vec<(StrId, Vec<NodeId>)>,
        body: Option<NodeId>,
        specs: FuncSpecs,
        access: Access,
    },
    Destructor {
        class: StrId,
        body: Option<NodeId>,
        specs: FuncSpecs,
        access: Access,
    },
    Variable {
        name: StrId,
        ty: NodeId,
        init: Option<NodeId>,
        storage: Storage,
        is_constexpr: bool,
        is_constinit: bool,
        is_inline: bool,
    },
    Param {
        name: Option<StrId>,
        ty: NodeId,
        default: Option<NodeId>,
        is_pack: bool,
    },
    Template {
        params: Vec<TemplateParam>,
        requires_clause: Option<NodeId>,
        decl: NodeId,
    },
    Concept {
        name: StrId,
        params: Vec<TemplateParam>,
        expr: NodeId,
    },
    StaticAssert {
        cond: NodeId,
        message: Option<String>,
    },
    Friend {
        decl: NodeId,
    },
    /// `auto [a, b, c] = expr;`
    StructuredBinding {
        names: Vec<StrId>,
        init: NodeId,
        is_ref: bool,
    },
    Empty,
}

// ============================================================
//                        STATEMENTS
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Compound {
        stmts: Vec<NodeId>,
    },
    If {
        init: Option<NodeId>,
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
        /// `if constexpr`: the condition folds at compile time and the
        /// dead branch is parsed but never lowered.
        is_constexpr: bool,
    },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        body: NodeId,
    },
    RangeFor {
        decl: NodeId,
        range: NodeId,
        body: NodeId,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    DoWhile {
        body: NodeId,
        cond: NodeId,
    },
    Switch {
        cond: NodeId,
        body: NodeId,
    },
    Case {
        /// `None` is `default:`.
        value: Option<NodeId>,
    },
    Break,
    Continue,
    Return {
        value: Option<NodeId>,
    },
    Goto {
        label: StrId,
    },
    Label {
        name: StrId,
    },
    Try {
        body: NodeId,
        handlers: Vec<NodeId>,
    },
    /// One `catch (param) { body }`; `param == None` is `catch (...)`.
    Catch {
        param: Option<NodeId>,
        body: NodeId,
    },
    /// Windows `__try` with either `__except(filter)` or `__finally`.
    SehTry {
        body: NodeId,
        except_filter: Option<NodeId>,
        except_body: Option<NodeId>,
        finally_body: Option<NodeId>,
    },
    Throw {
        value: Option<NodeId>,
    },
    Expr {
        expr: NodeId,
    },
    Decl {
        decl: NodeId,
    },
    Empty,
}

// ============================================================
//                       EXPRESSIONS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Spaceship,
    Comma,
    /// `.*` / `->*`
    MemberPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Static,
    Const,
    Reinterpret,
    Dynamic,
    CStyle,
    /// `T(expr)`
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldKind {
    /// `(pack op ...)`
    UnaryRight,
    /// `(... op pack)`
    UnaryLeft,
    /// `(init op ... op pack)` / `(pack op ... op init)`
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureKind {
    /// `[x]`
    ByValue,
    /// `[&x]`
    ByRef,
    /// `[this]`
    This,
    /// `[*this]`
    StarThis,
    /// `[x = expr]` / `[&r = expr]`
    Init { init: NodeId, by_ref: bool },
    /// `[=]`
    DefaultValue,
    /// `[&]`
    DefaultRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub name: Option<StrId>,
    pub kind: CaptureKind,
}

/// Compiler intrinsics recognized as unary/binary type traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTrait {
    IsVoid,
    IsIntegral,
    IsFloatingPoint,
    IsPointer,
    IsLvalueReference,
    IsRvalueReference,
    IsClass,
    IsEnum,
    IsSame,
    IsBaseOf,
    IsConst,
    IsVolatile,
    IsTrivial,
    IsAggregate,
    HasTrivialDestructor,
    IsConstructible,
    IsCompleteOrUnbounded,
    IsSwappable,
    IsNothrowSwappable,
    HasUniqueObjectRepr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    /// `expr;`
    Simple(NodeId),
    /// `{ expr } -> Constraint;`
    Compound {
        expr: NodeId,
        return_constraint: Option<NodeId>,
        noexcept: bool,
    },
    /// `typename T::type;`
    Type(NodeId),
    /// `requires expr;`
    Nested(NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit {
        value: u64,
        suffix: IntSuffix,
    },
    FloatLit {
        value: f64,
        suffix: FloatSuffix,
    },
    StringLit {
        value: String,
        prefix: EncodingPrefix,
    },
    CharLit {
        value: u32,
        prefix: EncodingPrefix,
    },
    BoolLit {
        value: bool,
    },
    NullptrLit,
    This,
    Ident {
        name: StrId,
    },
    /// `ns::Class::name` or `::name`, with optional explicit template
    /// arguments on the final component.
    QualifiedId {
        path: Vec<StrId>,
        name: StrId,
        template_args: Vec<NodeId>,
        from_root: bool,
    },
    Member {
        base: NodeId,
        member: StrId,
        is_arrow: bool,
        template_args: Vec<NodeId>,
    },
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    Subscript {
        base: NodeId,
        index: NodeId,
    },
    Unary {
        op: UnaryOp,
        operand: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Assign {
        op: AssignOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Ternary {
        cond: NodeId,
        then_expr: NodeId,
        else_expr: NodeId,
    },
    Cast {
        kind: CastKind,
        ty: NodeId,
        expr: NodeId,
    },
    Sizeof {
        /// A TypeSpec node or an expression node.
        arg: NodeId,
        is_type: bool,
    },
    Alignof {
        arg: NodeId,
    },
    Typeid {
        arg: NodeId,
        is_type: bool,
    },
    Lambda {
        captures: Vec<Capture>,
        template_params: Vec<TemplateParam>,
        params: Vec<NodeId>,
        ret: Option<NodeId>,
        body: NodeId,
        is_mutable: bool,
    },
    New {
        ty: NodeId,
        array_len: Option<NodeId>,
        args: Vec<NodeId>,
    },
    Delete {
        expr: NodeId,
        is_array: bool,
    },
    InitList {
        elems: Vec<NodeId>,
    },
    /// `{ .a = 1, .b = 2 }`
    Designated {
        inits: Vec<(StrId, NodeId)>,
    },
    Fold {
        kind: FoldKind,
        op: BinaryOp,
        left: Option<NodeId>,
        right: Option<NodeId>,
    },
    PackExpansion {
        pattern: NodeId,
    },
    SizeofPack {
        name: StrId,
    },
    Requires {
        params: Vec<NodeId>,
        requirements: Vec<Requirement>,
    },
    TypeTraitCall {
        trait_: TypeTrait,
        args: Vec<NodeId>,
    },
    BuiltinAddressof {
        operand: NodeId,
    },
    BuiltinConstantP {
        operand: NodeId,
    },
    VaStart {
        list: NodeId,
        last_param: NodeId,
    },
    VaArg {
        list: NodeId,
        ty: NodeId,
    },
}

// ============================================================
//                       TYPE SPECIFIERS
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CoreType {
    Primitive(Primitive),
    /// Possibly-qualified name, with template arguments on the final
    /// component. `typename` flags dependent names spelled with the
    /// disambiguator.
    Named {
        path: Vec<StrId>,
        name: StrId,
        template_args: Vec<NodeId>,
        is_typename: bool,
    },
    Auto,
    Decltype(NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedType {
    Pointer {
        is_const: bool,
        is_volatile: bool,
    },
    LValueRef,
    RValueRef,
    Array {
        len: Option<NodeId>,
    },
    Function {
        params: Vec<NodeId>,
        variadic: bool,
    },
    /// `Class::*`
    MemberPointer {
        class: StrId,
    },
}

/// A parsed type: primary class + suffix chain, outermost last.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub core: CoreType,
    pub is_const: bool,
    pub is_volatile: bool,
    pub derived: Vec<DerivedType>,
    /// `T...` in a parameter pack expansion position.
    pub is_pack: bool,
}

// ============================================================
//                          ARENA
// ============================================================

/// Per-translation-unit node arena. Nodes are only appended; ids are
/// stable for the arena's lifetime and freed en masse with it.
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn new() -> Self {
        Arena {
            nodes: Vec::with_capacity(1024),
        }
    }

    pub fn alloc(&mut self, kind: NodeKind, loc: SourceLoc) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("AST arena overflow"));
        self.nodes.push(Node {
            kind,
            loc,
            sema: SemaInfo::default(),
        });
        id
    }

    pub fn expr(&mut self, e: Expr, loc: SourceLoc) -> NodeId {
        self.alloc(NodeKind::Expr(e), loc)
    }

    pub fn stmt(&mut self, s: Stmt, loc: SourceLoc) -> NodeId {
        self.alloc(NodeKind::Stmt(s), loc)
    }

    pub fn decl(&mut self, d: Decl, loc: SourceLoc) -> NodeId {
        self.alloc(NodeKind::Decl(d), loc)
    }

    pub fn type_spec(&mut self, t: TypeSpec, loc: SourceLoc) -> NodeId {
        self.alloc(NodeKind::TypeSpec(t), loc)
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Expression kind accessor; panics only on internal misuse.
    pub fn as_expr(&self, id: NodeId) -> Option<&Expr> {
        match &self.get(id).kind {
            NodeKind::Expr(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_stmt(&self, id: NodeId) -> Option<&Stmt> {
        match &self.get(id).kind {
            NodeKind::Stmt(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decl(&self, id: NodeId) -> Option<&Decl> {
        match &self.get(id).kind {
            NodeKind::Decl(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_type_spec(&self, id: NodeId) -> Option<&TypeSpec> {
        match &self.get(id).kind {
            NodeKind::TypeSpec(t) => Some(t),
            _ => None,
        }
    }

    /// Deep-copy a subtree into this arena, returning the new root. Used by
    /// template instantiation, which re-parses stored bodies by cloning
    /// them through a substitution map.
    pub fn clone_subtree(&mut self, root: NodeId) -> NodeId {
        let node = self.get(root).clone();
        let kind = self.clone_kind_children(node.kind);
        let id = self.alloc(kind, node.loc);
        self.get_mut(id).sema = node.sema;
        id
    }

    fn clone_kind_children(&mut self, kind: NodeKind) -> NodeKind {
        // Clone children first, then rebuild the variant with new ids.
        macro_rules! c {
            ($id:expr) => {
                self.clone_subtree($id)
            };
        }
        macro_rules! c_opt {
            ($id:expr) => {
                $id.map(|n| self.clone_subtree(n))
            };
        }
        macro_rules! c_vec {
            ($ids:expr) => {
                $ids.iter().map(|&n| self.clone_subtree(n)).collect()
            };
        }
        match kind {
            NodeKind::Expr(e) => NodeKind::Expr(match e {
                Expr::Member {
                    base,
                    member,
                    is_arrow,
                    template_args,
                } => Expr::Member {
                    base: c!(base),
                    member,
                    is_arrow,
                    template_args: c_vec!(template_args),
                },
                Expr::Call { callee, args } => Expr::Call {
                    callee: c!(callee),
                    args: c_vec!(args),
                },
                Expr::Subscript { base, index } => Expr::Subscript {
                    base: c!(base),
                    index: c!(index),
                },
                Expr::Unary { op, operand } => Expr::Unary {
                    op,
                    operand: c!(operand),
                },
                Expr::Binary { op, lhs, rhs } => Expr::Binary {
                    op,
                    lhs: c!(lhs),
                    rhs: c!(rhs),
                },
                Expr::Assign { op, lhs, rhs } => Expr::Assign {
                    op,
                    lhs: c!(lhs),
                    rhs: c!(rhs),
                },
                Expr::Ternary {
                    cond,
                    then_expr,
                    else_expr,
                } => Expr::Ternary {
                    cond: c!(cond),
                    then_expr: c!(then_expr),
                    else_expr: c!(else_expr),
                },
                Expr::Cast { kind, ty, expr } => Expr::Cast {
                    kind,
                    ty: c!(ty),
                    expr: c!(expr),
                },
                Expr::Sizeof { arg, is_type } => Expr::Sizeof {
                    arg: c!(arg),
                    is_type,
                },
                Expr::Alignof { arg } => Expr::Alignof { arg: c!(arg) },
                Expr::Typeid { arg, is_type } => Expr::Typeid {
                    arg: c!(arg),
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
                    template_args: c_vec!(template_args),
                    from_root,
                },
                Expr::Lambda {
                    captures,
                    template_params,
                    params,
                    ret,
                    body,
                    is_mutable,
                } => Expr::Lambda {
                    captures: captures
                        .into_iter()
                        .map(|cap| Capture {
                            name: cap.name,
                            kind: match cap.kind {
                                CaptureKind::Init { init, by_ref } => CaptureKind::Init {
                                    init: c!(init),
                                    by_ref,
                                },
                                other => other,
                            },
                        })
                        .collect(),
                    template_params,
                    params: c_vec!(params),
                    ret: c_opt!(ret),
                    body: c!(body),
                    is_mutable,
                },
                Expr::New {
                    ty,
                    array_len,
                    args,
                } => Expr::New {
                    ty: c!(ty),
                    array_len: c_opt!(array_len),
                    args: c_vec!(args),
                },
                Expr::Delete { expr, is_array } => Expr::Delete {
                    expr: c!(expr),
                    is_array,
                },
                Expr::InitList { elems } => Expr::InitList {
                    elems: c_vec!(elems),
                },
                Expr::Designated { inits } => Expr::Designated {
                    inits: inits
                        .into_iter()
                        .map(|(n, e)| (n, self.clone_subtree(e)))
                        .collect(),
                },
                Expr::Fold {
                    kind,
                    op,
                    left,
                    right,
                } => Expr::Fold {
                    kind,
                    op,
                    left: c_opt!(left),
                    right: c_opt!(right),
                },
                Expr::PackExpansion { pattern } => Expr::PackExpansion {
                    pattern: c!(pattern),
                },
                Expr::Requires {
                    params,
                    requirements,
                } => Expr::Requires {
                    params: c_vec!(params),
                    requirements: requirements
                        .into_iter()
                        .map(|r| match r {
                            Requirement::Simple(e) => Requirement::Simple(self.clone_subtree(e)),
                            Requirement::Compound {
                                expr,
                                return_constraint,
                                noexcept,
                            } => Requirement::Compound {
                                expr: self.clone_subtree(expr),
                                return_constraint: return_constraint.map(|n| self.clone_subtree(n)),
                                noexcept,
                            },
                            Requirement::Type(t) => Requirement::Type(self.clone_subtree(t)),
                            Requirement::Nested(e) => Requirement::Nested(self.clone_subtree(e)),
                        })
                        .collect(),
                },
                Expr::TypeTraitCall { trait_, args } => Expr::TypeTraitCall {
                    trait_,
                    args: c_vec!(args),
                },
                Expr::BuiltinAddressof { operand } => Expr::BuiltinAddressof {
                    operand: c!(operand),
                },
                Expr::BuiltinConstantP { operand } => Expr::BuiltinConstantP {
                    operand: c!(operand),
                },
                Expr::VaStart { list, last_param } => Expr::VaStart {
                    list: c!(list),
                    last_param: c!(last_param),
                },
                Expr::VaArg { list, ty } => Expr::VaArg {
                    list: c!(list),
                    ty: c!(ty),
                },
                // Leaf expressions carry no children.
                leaf => leaf,
            }),
            NodeKind::Stmt(s) => NodeKind::Stmt(match s {
                Stmt::Compound { stmts } => Stmt::Compound {
                    stmts: c_vec!(stmts),
                },
                Stmt::If {
                    init,
                    cond,
                    then_branch,
                    else_branch,
                    is_constexpr,
                } => Stmt::If {
                    init: c_opt!(init),
                    cond: c!(cond),
                    then_branch: c!(then_branch),
                    else_branch: c_opt!(else_branch),
                    is_constexpr,
                },
                Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                } => Stmt::For {
                    init: c_opt!(init),
                    cond: c_opt!(cond),
                    step: c_opt!(step),
                    body: c!(body),
                },
                Stmt::RangeFor { decl, range, body } => Stmt::RangeFor {
                    decl: c!(decl),
                    range: c!(range),
                    body: c!(body),
                },
                Stmt::While { cond, body } => Stmt::While {
                    cond: c!(cond),
                    body: c!(body),
                },
                Stmt::DoWhile { body, cond } => Stmt::DoWhile {
                    body: c!(body),
                    cond: c!(cond),
                },
                Stmt::Switch { cond, body } => Stmt::Switch {
                    cond: c!(cond),
                    body: c!(body),
                },
                Stmt::Case { value } => Stmt::Case {
                    value: c_opt!(value),
                },
                Stmt::Return { value } => Stmt::Return {
                    value: c_opt!(value),
                },
                Stmt::Try { body, handlers } => Stmt::Try {
                    body: c!(body),
                    handlers: c_vec!(handlers),
                },
                Stmt::Catch { param, body } => Stmt::Catch {
                    param: c_opt!(param),
                    body: c!(body),
                },
                Stmt::SehTry {
                    body,
                    except_filter,
                    except_body,
                    finally_body,
                } => Stmt::SehTry {
                    body: c!(body),
                    except_filter: c_opt!(except_filter),
                    except_body: c_opt!(except_body),
                    finally_body: c_opt!(finally_body),
                },
                Stmt::Throw { value } => Stmt::Throw {
                    value: c_opt!(value),
                },
                Stmt::Expr { expr } => Stmt::Expr { expr: c!(expr) },
                Stmt::Decl { decl } => Stmt::Decl { decl: c!(decl) },
                leaf => leaf,
            }),
            NodeKind::Decl(d) => NodeKind::Decl(match d {
                Decl::TranslationUnit { decls } => Decl::TranslationUnit {
                    decls: c_vec!(decls),
                },
                Decl::Namespace { name, decls } => Decl::Namespace {
                    name,
                    decls: c_vec!(decls),
                },
                Decl::Alias { name, target } => Decl::Alias {
                    name,
                    target: c!(target),
                },
                Decl::Typedef { name, target } => Decl::Typedef {
                    name,
                    target: c!(target),
                },
                Decl::Enum {
                    name,
                    scoped,
                    underlying,
                    enumerators,
                } => Decl::Enum {
                    name,
                    scoped,
                    underlying: c_opt!(underlying),
                    enumerators: enumerators
                        .into_iter()
                        .map(|(n, e)| (n, e.map(|x| self.clone_subtree(x))))
                        .collect(),
                },
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
                    members: c_vec!(members),
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
                    ty: c!(ty),
                    init: c_opt!(init),
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
                    params: c_vec!(params),
                    ret: c!(ret),
                    body: c_opt!(body),
                    specs: self.clone_specs(specs),
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
                } => Decl::Constructor {
                    class,
                    params: c_vec!(params),
                    init_list: init_list
                        .into_iter()
                        .map(|(n, args)| {
                            (n, args.iter().map(|&a| self.clone_subtree(a)).collect())
                        })
                        .collect(),
                    body: c_opt!(body),
                    specs: self.clone_specs(specs),
                    access,
                },
                Decl::Destructor {
                    class,
                    body,
                    specs,
                    access,
                } => Decl::Destructor {
                    class,
                    body: c_opt!(body),
                    specs: self.clone_specs(specs),
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
                    ty: c!(ty),
                    init: c_opt!(init),
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
                } => Decl::Param {
                    name,
                    ty: c!(ty),
                    default: c_opt!(default),
                    is_pack,
                },
                Decl::Template {
                    params,
                    requires_clause,
                    decl,
                } => Decl::Template {
                    params,
                    requires_clause: c_opt!(requires_clause),
                    decl: c!(decl),
                },
                Decl::Concept { name, params, expr } => Decl::Concept {
                    name,
                    params,
                    expr: c!(expr),
                },
                Decl::StaticAssert { cond, message } => Decl::StaticAssert {
                    cond: c!(cond),
                    message,
                },
                Decl::Friend { decl } => Decl::Friend { decl: c!(decl) },
                Decl::StructuredBinding {
                    names,
                    init,
                    is_ref,
                } => Decl::StructuredBinding {
                    names,
                    init: c!(init),
                    is_ref,
                },
                leaf => leaf,
            }),
            NodeKind::TypeSpec(t) => {
                let core = match t.core {
                    CoreType::Named {
                        path,
                        name,
                        template_args,
                        is_typename,
                    } => CoreType::Named {
                        path,
                        name,
                        template_args: template_args
                            .iter()
                            .map(|&n| self.clone_subtree(n))
                            .collect(),
                        is_typename,
                    },
                    CoreType::Decltype(e) => CoreType::Decltype(self.clone_subtree(e)),
                    other => other,
                };
                let derived = t
                    .derived
                    .into_iter()
                    .map(|d| match d {
                        DerivedType::Array { len } => DerivedType::Array {
                            len: len.map(|n| self.clone_subtree(n)),
                        },
                        DerivedType::Function { params, variadic } => DerivedType::Function {
                            params: params.iter().map(|&n| self.clone_subtree(n)).collect(),
                            variadic,
                        },
                        other => other,
                    })
                    .collect();
                NodeKind::TypeSpec(TypeSpec {
                    core,
                    is_const: t.is_const,
                    is_volatile: t.is_volatile,
                    derived,
                    is_pack: t.is_pack,
                })
            }
        }
    }

    fn clone_specs(&mut self, mut specs: FuncSpecs) -> FuncSpecs {
        specs.noexcept = specs
            .noexcept
            .map(|inner| inner.map(|n| self.clone_subtree(n)));
        specs.requires_clause = specs.requires_clause.map(|n| self.clone_subtree(n));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::unknown()
    }

    #[test]
    fn test_alloc_and_get() {
        let mut arena = Arena::new();
        let id = arena.expr(
            Expr::IntLit {
                value: 42,
                suffix: IntSuffix::None,
            },
            loc(),
        );
        match arena.as_expr(id) {
            Some(Expr::IntLit { value, .. }) => assert_eq!(*value, 42),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_payload_slot() {
        let mut arena = Arena::new();
        let id = arena.expr(Expr::BoolLit { value: true }, loc());
        assert_eq!(arena.get(id).sema, SemaInfo::default());
        arena.get_mut(id).sema.value = Some(EvalConst::Bool(true));
        assert_eq!(arena.get(id).sema.value, Some(EvalConst::Bool(true)));
    }

    #[test]
    fn test_clone_subtree_is_deep() {
        let mut arena = Arena::new();
        let one = arena.expr(
            Expr::IntLit {
                value: 1,
                suffix: IntSuffix::None,
            },
            loc(),
        );
        let two = arena.expr(
            Expr::IntLit {
                value: 2,
                suffix: IntSuffix::None,
            },
            loc(),
        );
        let add = arena.expr(
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: one,
                rhs: two,
            },
            loc(),
        );
        let copy = arena.clone_subtree(add);
        assert_ne!(copy, add);
        let (l2, r2) = match arena.as_expr(copy) {
            Some(Expr::Binary { lhs, rhs, .. }) => (*lhs, *rhs),
            other => panic!("{:?}", other),
        };
        // No shared subtrees: children were cloned too.
        assert_ne!(l2, one);
        assert_ne!(r2, two);
        match arena.as_expr(l2) {
            Some(Expr::IntLit { value, .. }) => assert_eq!(*value, 1),
            other => panic!("{:?}", other),
        }
    }
}
