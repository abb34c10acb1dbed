//! Type system
//!
//! Canonical type registry: every structural type description maps to a
//! 32-bit [`TypeId`]; two types are equal iff their ids are equal. Class
//! and enum types are identified by their (unique, hash-suffixed when
//! instantiated) name handle; their layout lives in the semantic tables,
//! which keeps the registry acyclic — a class member refers to its type by
//! id, and any cycle goes through a pointer or reference entry.
//!
//! Also home to the C++20 conversion machinery: conversion ranks
//! (`[conv.rank]`), integer promotion (`[conv.prom]`), the usual arithmetic
//! conversions (`[conv.arith]`) and reference collapsing, plus the
//! candidate-ranking categories used by overload resolution.

use crate::strings::StrId;
use std::collections::HashMap;

/// Canonical type handle. Identity comparison is type equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Built-in primitive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    Char,
    SChar,
    UChar,
    Char8,
    Char16,
    Char32,
    WChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
    NullptrT,
}

impl Primitive {
    pub fn is_integral(self) -> bool {
        use Primitive::*;
        matches!(
            self,
            Bool | Char
                | SChar
                | UChar
                | Char8
                | Char16
                | Char32
                | WChar
                | Short
                | UShort
                | Int
                | UInt
                | Long
                | ULong
                | LongLong
                | ULongLong
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Primitive::Float | Primitive::Double | Primitive::LongDouble)
    }

    pub fn is_arithmetic(self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// char16_t, char32_t and char8_t are unsigned; plain char is treated
    /// as signed on both supported targets.
    pub fn is_signed(self) -> bool {
        use Primitive::*;
        matches!(self, Char | SChar | Short | Int | Long | LongLong)
    }

    pub fn is_unsigned(self) -> bool {
        self.is_integral() && !self.is_signed()
    }

    /// Size in bytes on x86-64 (LP64 for Linux, LLP64 difference only in
    /// `long`, which we size per the Itanium target; the Windows backend
    /// treats `long` as 4 bytes).
    pub fn size(self, long_is_8: bool) -> u64 {
        use Primitive::*;
        match self {
            Void => 0,
            Bool | Char | SChar | UChar | Char8 => 1,
            Char16 | Short | UShort => 2,
            Char32 | WChar | Int | UInt | Float => 4,
            Long | ULong => {
                if long_is_8 {
                    8
                } else {
                    4
                }
            }
            LongLong | ULongLong | Double | NullptrT => 8,
            LongDouble => 16,
        }
    }

    /// Conversion rank per `[conv.rank]`. Extended char types share the
    /// rank of their underlying width class.
    pub fn rank(self) -> u8 {
        use Primitive::*;
        match self {
            Bool => 0,
            Char | SChar | UChar | Char8 => 1,
            Char16 | Short | UShort => 2,
            Char32 | WChar | Int | UInt => 3,
            Long | ULong => 4,
            LongLong | ULongLong => 5,
            _ => 0,
        }
    }

    /// The unsigned counterpart at the same rank.
    pub fn to_unsigned(self) -> Primitive {
        use Primitive::*;
        match self {
            Char | SChar => UChar,
            Short => UShort,
            Int => UInt,
            Long => ULong,
            LongLong => ULongLong,
            other => other,
        }
    }
}

/// Reference flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    LValue,
    RValue,
}

/// Calling-convention tag on function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    #[default]
    Default,
    Vectorcall,
}

/// cv-qualifiers, stored once on the outer canonical entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Quals {
    pub is_const: bool,
    pub is_volatile: bool,
}

impl Quals {
    pub const NONE: Quals = Quals {
        is_const: false,
        is_volatile: false,
    };
    pub const CONST: Quals = Quals {
        is_const: true,
        is_volatile: false,
    };

    pub fn is_none(self) -> bool {
        !self.is_const && !self.is_volatile
    }

    /// `self` is at least as qualified as `other`.
    pub fn superset_of(self, other: Quals) -> bool {
        (self.is_const || !other.is_const) && (self.is_volatile || !other.is_volatile)
    }
}

/// Structural type description. Class/enum types are identified by name
/// handle; member lists reference back by `TypeId`, so cycles always pass
/// through an indirection entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Primitive(Primitive),
    Pointer {
        pointee: TypeId,
    },
    Reference {
        referent: TypeId,
        kind: RefKind,
    },
    Array {
        element: TypeId,
        /// `None` for unbounded `T[]`.
        len: Option<u64>,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
        conv: CallConv,
    },
    MemberPointer {
        class: StrId,
        pointee: TypeId,
    },
    Class {
        name: StrId,
    },
    Enum {
        name: StrId,
        underlying: TypeId,
    },
    /// An uninstantiated template parameter inside a stored template body.
    TemplateParam {
        name: StrId,
    },
    /// A dependent qualified name (`typename T::type`) awaiting
    /// substitution.
    Dependent {
        name: StrId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonType {
    pub kind: TypeKind,
    pub quals: Quals,
}

/// Overload-resolution conversion categories, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConvCategory {
    Exact,
    Promotion,
    Standard,
    UserDefined,
    Ellipsis,
}

/// A ranked implicit conversion: category plus tie-breakers within the
/// standard-conversion category (qualification, then derived-to-base
/// distance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConvRank {
    pub category: ConvCategory,
    pub qual_penalty: u8,
    pub base_distance: u32,
}

impl ConvRank {
    pub fn exact() -> Self {
        ConvRank {
            category: ConvCategory::Exact,
            qual_penalty: 0,
            base_distance: 0,
        }
    }

    pub fn of(category: ConvCategory) -> Self {
        ConvRank {
            category,
            qual_penalty: 0,
            base_distance: 0,
        }
    }
}

/// Append-only canonical registry.
pub struct TypeRegistry {
    types: Vec<CanonType>,
    index: HashMap<CanonType, TypeId>,
    /// `long` is 8 bytes on the Itanium target, 4 on MSVC.
    long_is_8: bool,
    /// Class layout (size, align) published by semantic analysis once a
    /// class is complete. Keyed by the class name handle.
    class_layouts: HashMap<StrId, (u64, u64)>,
    /// Direct bases per class, for derived-to-base conversion distance.
    class_bases: HashMap<StrId, Vec<StrId>>,
    // Pre-interned common types.
    cache_void: TypeId,
    cache_bool: TypeId,
    cache_int: TypeId,
}

impl TypeRegistry {
    pub fn new(long_is_8: bool) -> Self {
        let mut reg = TypeRegistry {
            types: Vec::with_capacity(256),
            index: HashMap::with_capacity(256),
            long_is_8,
            class_layouts: HashMap::new(),
            class_bases: HashMap::new(),
            cache_void: TypeId(0),
            cache_bool: TypeId(0),
            cache_int: TypeId(0),
        };
        reg.cache_void = reg.primitive(Primitive::Void);
        reg.cache_bool = reg.primitive(Primitive::Bool);
        reg.cache_int = reg.primitive(Primitive::Int);
        reg
    }

    pub fn void(&self) -> TypeId {
        self.cache_void
    }
    pub fn bool_(&self) -> TypeId {
        self.cache_bool
    }
    pub fn int(&self) -> TypeId {
        self.cache_int
    }

    /// Canonicalize; repeated lookups of the same description return the
    /// same id.
    pub fn intern(&mut self, kind: TypeKind, quals: Quals) -> TypeId {
        let canon = CanonType { kind, quals };
        if let Some(&id) = self.index.get(&canon) {
            return id;
        }
        let id = TypeId(u32::try_from(self.types.len()).expect("type registry overflow"));
        self.types.push(canon.clone());
        self.index.insert(canon, id);
        id
    }

    pub fn get(&self, id: TypeId) -> &CanonType {
        &self.types[id.index()]
    }

    pub fn primitive(&mut self, p: Primitive) -> TypeId {
        self.intern(TypeKind::Primitive(p), Quals::NONE)
    }

    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer { pointee }, Quals::NONE)
    }

    pub fn with_quals(&mut self, id: TypeId, quals: Quals) -> TypeId {
        let kind = self.get(id).kind.clone();
        self.intern(kind, quals)
    }

    /// Strip cv-qualifiers from the outer entry.
    pub fn unqualified(&mut self, id: TypeId) -> TypeId {
        let t = self.get(id);
        if t.quals.is_none() {
            id
        } else {
            let kind = t.kind.clone();
            self.intern(kind, Quals::NONE)
        }
    }

    /// Build a reference type, applying the C++20 collapsing rules when the
    /// referent is itself a reference: `T& &` = `T& &&` = `T&& &` → `T&`,
    /// `T&& &&` → `T&&`.
    pub fn reference_to(&mut self, referent: TypeId, kind: RefKind) -> TypeId {
        if let TypeKind::Reference {
            referent: inner,
            kind: inner_kind,
        } = self.get(referent).kind
        {
            let collapsed = if kind == RefKind::RValue && inner_kind == RefKind::RValue {
                RefKind::RValue
            } else {
                RefKind::LValue
            };
            return self.intern(
                TypeKind::Reference {
                    referent: inner,
                    kind: collapsed,
                },
                Quals::NONE,
            );
        }
        self.intern(TypeKind::Reference { referent, kind }, Quals::NONE)
    }

    pub fn array_of(&mut self, element: TypeId, len: Option<u64>) -> TypeId {
        self.intern(TypeKind::Array { element, len }, Quals::NONE)
    }

    pub fn function(
        &mut self,
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
        conv: CallConv,
    ) -> TypeId {
        self.intern(
            TypeKind::Function {
                ret,
                params,
                variadic,
                conv,
            },
            Quals::NONE,
        )
    }

    pub fn class(&mut self, name: StrId) -> TypeId {
        self.intern(TypeKind::Class { name }, Quals::NONE)
    }

    pub fn enum_(&mut self, name: StrId, underlying: TypeId) -> TypeId {
        self.intern(TypeKind::Enum { name, underlying }, Quals::NONE)
    }

    pub fn is_reference(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Reference { .. })
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Pointer { .. })
    }

    pub fn is_class(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Class { .. })
    }

    pub fn is_dependent(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::TemplateParam { .. } | TypeKind::Dependent { .. } => true,
            TypeKind::Pointer { pointee } => self.is_dependent(*pointee),
            TypeKind::Reference { referent, .. } => self.is_dependent(*referent),
            TypeKind::Array { element, .. } => self.is_dependent(*element),
            TypeKind::Function { ret, params, .. } => {
                self.is_dependent(*ret) || params.iter().any(|p| self.is_dependent(*p))
            }
            TypeKind::MemberPointer { pointee, .. } => self.is_dependent(*pointee),
            _ => false,
        }
    }

    /// Strip one level of reference, yielding the referent.
    pub fn deref_reference(&self, id: TypeId) -> TypeId {
        match self.get(id).kind {
            TypeKind::Reference { referent, .. } => referent,
            _ => id,
        }
    }

    pub fn primitive_of(&self, id: TypeId) -> Option<Primitive> {
        match self.get(id).kind {
            TypeKind::Primitive(p) => Some(p),
            TypeKind::Enum { underlying, .. } => self.primitive_of(underlying),
            _ => None,
        }
    }

    // ------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------

    pub fn publish_class_layout(&mut self, name: StrId, size: u64, align: u64) {
        self.class_layouts.insert(name, (size, align));
    }

    pub fn publish_class_bases(&mut self, name: StrId, bases: Vec<StrId>) {
        self.class_bases.insert(name, bases);
    }

    pub fn class_layout(&self, name: StrId) -> Option<(u64, u64)> {
        self.class_layouts.get(&name).copied()
    }

    pub fn size_of(&self, id: TypeId) -> Option<u64> {
        match &self.get(id).kind {
            TypeKind::Primitive(p) => Some(p.size(self.long_is_8)),
            TypeKind::Pointer { .. } | TypeKind::Reference { .. } | TypeKind::MemberPointer { .. } => {
                Some(8)
            }
            TypeKind::Array { element, len } => {
                let elem = self.size_of(*element)?;
                len.map(|n| elem * n)
            }
            TypeKind::Function { .. } => None,
            TypeKind::Class { name } => self.class_layouts.get(name).map(|&(s, _)| s),
            TypeKind::Enum { underlying, .. } => self.size_of(*underlying),
            TypeKind::TemplateParam { .. } | TypeKind::Dependent { .. } => None,
        }
    }

    pub fn align_of(&self, id: TypeId) -> Option<u64> {
        match &self.get(id).kind {
            TypeKind::Primitive(p) => {
                let s = p.size(self.long_is_8);
                Some(if s == 0 { 1 } else { s.min(16) })
            }
            TypeKind::Pointer { .. } | TypeKind::Reference { .. } | TypeKind::MemberPointer { .. } => {
                Some(8)
            }
            TypeKind::Array { element, .. } => self.align_of(*element),
            TypeKind::Function { .. } => None,
            TypeKind::Class { name } => self.class_layouts.get(name).map(|&(_, a)| a),
            TypeKind::Enum { underlying, .. } => self.align_of(*underlying),
            TypeKind::TemplateParam { .. } | TypeKind::Dependent { .. } => None,
        }
    }

    // ------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------

    /// Integer promotion per `[conv.prom]`: anything of rank ≤ int promotes
    /// to `int`, or to `unsigned int` only when `int` cannot represent all
    /// source values (i.e. the source is `unsigned int` itself — every
    /// narrower unsigned type fits in `int` on this target).
    pub fn promote(&mut self, id: TypeId) -> TypeId {
        let Some(p) = self.primitive_of(id) else {
            return id;
        };
        if !p.is_integral() || p.rank() > Primitive::Int.rank() {
            return id;
        }
        if p == Primitive::UInt {
            return self.primitive(Primitive::UInt);
        }
        self.primitive(Primitive::Int)
    }

    /// Usual arithmetic conversions per `[conv.arith]`, returning the
    /// common type of a binary arithmetic operation.
    pub fn usual_arithmetic(&mut self, a: TypeId, b: TypeId) -> Option<TypeId> {
        let pa = self.primitive_of(a)?;
        let pb = self.primitive_of(b)?;
        if !pa.is_arithmetic() || !pb.is_arithmetic() {
            return None;
        }
        // Any float participant dominates integrals; wider float dominates.
        if pa.is_floating() || pb.is_floating() {
            let widest = [Primitive::LongDouble, Primitive::Double, Primitive::Float]
                .into_iter()
                .find(|&f| pa == f || pb == f)
                .unwrap_or(Primitive::Double);
            return Some(self.primitive(widest));
        }
        // Integral: promote both first.
        let a = self.promote(a);
        let b = self.promote(b);
        let pa = self.primitive_of(a)?;
        let pb = self.primitive_of(b)?;
        if pa == pb {
            return Some(a);
        }
        let (hi, lo) = if pa.rank() >= pb.rank() { (pa, pb) } else { (pb, pa) };
        let result = if hi.rank() == lo.rank() {
            // Equal rank, differing signedness: unsigned wins.
            if hi.is_unsigned() { hi } else { lo }
        } else if hi.is_unsigned() || lo.is_signed() {
            // Higher rank unsigned absorbs, or both signed.
            hi
        } else {
            // Higher-rank signed vs lower-rank unsigned: the signed type can
            // represent all lower-rank unsigned values iff it is strictly
            // wider.
            let hi_size = hi.size(self.long_is_8);
            let lo_size = lo.size(self.long_is_8);
            if hi_size > lo_size { hi } else { hi.to_unsigned() }
        };
        Some(self.primitive(result))
    }

    /// Distance in base-class hops from `derived` to `base`, if reachable.
    pub fn base_distance(&self, derived: StrId, base: StrId) -> Option<u32> {
        if derived == base {
            return Some(0);
        }
        let bases = self.class_bases.get(&derived)?;
        bases
            .iter()
            .filter_map(|b| self.base_distance(*b, base))
            .min()
            .map(|d| d + 1)
    }

    /// Rank the standard (non-user-defined) conversion from `from` to `to`.
    /// `None` means no implicit standard conversion exists; overload
    /// resolution then consults user-defined conversions.
    pub fn standard_conversion(&mut self, from: TypeId, to: TypeId) -> Option<ConvRank> {
        if from == to {
            return Some(ConvRank::exact());
        }
        let from_unq = self.unqualified(from);
        let to_unq = self.unqualified(to);
        if from_unq == to_unq {
            // Qualification-only difference.
            let fq = self.get(from).quals;
            let tq = self.get(to).quals;
            if tq.superset_of(fq) {
                let mut r = ConvRank::exact();
                r.qual_penalty = 1;
                return Some(r);
            }
            return None;
        }

        // Reference binding: rank against the referent.
        if let TypeKind::Reference { referent, .. } = self.get(to).kind {
            let from_val = self.deref_reference(from);
            return self.standard_conversion(from_val, referent);
        }
        let from = self.deref_reference(from);
        let from_unq = self.unqualified(from);
        if from_unq == to_unq {
            return Some(ConvRank::exact());
        }

        // Array-to-pointer decay.
        if let TypeKind::Array { element, .. } = self.get(from_unq).kind
            && let TypeKind::Pointer { pointee } = self.get(to_unq).kind
        {
            let elem_unq = self.unqualified(element);
            let pointee_unq = self.unqualified(pointee);
            if elem_unq == pointee_unq {
                return Some(ConvRank::exact());
            }
        }

        match (self.primitive_of(from_unq), self.primitive_of(to_unq)) {
            (Some(pf), Some(pt)) if pf.is_arithmetic() && pt.is_arithmetic() => {
                let promoted = self.promote(from_unq);
                if self.primitive_of(promoted) == Some(pt) {
                    Some(ConvRank::of(ConvCategory::Promotion))
                } else {
                    Some(ConvRank::of(ConvCategory::Standard))
                }
            }
            _ => {
                // Pointer conversions.
                let fk = self.get(from_unq).kind.clone();
                let tk = self.get(to_unq).kind.clone();
                match (fk, tk) {
                    (TypeKind::Primitive(Primitive::NullptrT), TypeKind::Pointer { .. }) => {
                        Some(ConvRank::of(ConvCategory::Standard))
                    }
                    (TypeKind::Pointer { pointee: fp }, TypeKind::Pointer { pointee: tp }) => {
                        let fp_unq = self.unqualified(fp);
                        let tp_unq = self.unqualified(tp);
                        // T* -> void*
                        if matches!(self.get(tp_unq).kind, TypeKind::Primitive(Primitive::Void)) {
                            return Some(ConvRank::of(ConvCategory::Standard));
                        }
                        // Qualification conversion on the pointee.
                        if fp_unq == tp_unq {
                            let fq = self.get(fp).quals;
                            let tq = self.get(tp).quals;
                            if tq.superset_of(fq) {
                                let mut r = ConvRank::exact();
                                r.qual_penalty = 1;
                                return Some(r);
                            }
                            return None;
                        }
                        // Derived* -> Base*
                        if let (TypeKind::Class { name: d }, TypeKind::Class { name: b }) =
                            (self.get(fp_unq).kind.clone(), self.get(tp_unq).kind.clone())
                            && let Some(dist) = self.base_distance(d, b)
                        {
                            let mut r = ConvRank::of(ConvCategory::Standard);
                            r.base_distance = dist;
                            return Some(r);
                        }
                        None
                    }
                    (TypeKind::Pointer { .. }, TypeKind::Primitive(Primitive::Bool)) => {
                        Some(ConvRank::of(ConvCategory::Standard))
                    }
                    (TypeKind::Enum { underlying, .. }, TypeKind::Primitive(p))
                        if p.is_arithmetic() =>
                    {
                        // Unscoped enum to its underlying / promoted type.
                        let _ = underlying;
                        Some(ConvRank::of(ConvCategory::Standard))
                    }
                    _ => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringTable;

    fn reg() -> TypeRegistry {
        TypeRegistry::new(true)
    }

    #[test]
    fn test_intern_idempotent() {
        let mut r = reg();
        let a = r.primitive(Primitive::Int);
        let b = r.primitive(Primitive::Int);
        assert_eq!(a, b);
        let p1 = r.pointer_to(a);
        let p2 = r.pointer_to(b);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_reference_collapse() {
        let mut r = reg();
        let int = r.primitive(Primitive::Int);
        let lref = r.reference_to(int, RefKind::LValue);
        let rref = r.reference_to(int, RefKind::RValue);

        // T& & -> T&
        assert_eq!(r.reference_to(lref, RefKind::LValue), lref);
        // T&& & -> T&
        assert_eq!(r.reference_to(rref, RefKind::LValue), lref);
        // T& && -> T&
        assert_eq!(r.reference_to(lref, RefKind::RValue), lref);
        // T&& && -> T&&
        assert_eq!(r.reference_to(rref, RefKind::RValue), rref);
    }

    #[test]
    fn test_promotion_small_ints_to_int() {
        let mut r = reg();
        for p in [
            Primitive::Bool,
            Primitive::Char,
            Primitive::SChar,
            Primitive::UChar,
            Primitive::Short,
            Primitive::UShort,
        ] {
            let t = r.primitive(p);
            let promoted = r.promote(t);
            assert_eq!(r.primitive_of(promoted), Some(Primitive::Int), "{:?}", p);
        }
        let u = r.primitive(Primitive::UInt);
        let promoted = r.promote(u);
        assert_eq!(r.primitive_of(promoted), Some(Primitive::UInt));
    }

    #[test]
    fn test_usual_arithmetic_unsigned_wins_at_equal_rank() {
        let mut r = reg();
        let i = r.primitive(Primitive::Int);
        let u = r.primitive(Primitive::UInt);
        let common = r.usual_arithmetic(i, u).unwrap();
        assert_eq!(r.primitive_of(common), Some(Primitive::UInt));
    }

    #[test]
    fn test_usual_arithmetic_long_absorbs_uint() {
        // long (8 bytes) represents all unsigned int values.
        let mut r = reg();
        let l = r.primitive(Primitive::Long);
        let u = r.primitive(Primitive::UInt);
        let common = r.usual_arithmetic(l, u).unwrap();
        assert_eq!(r.primitive_of(common), Some(Primitive::Long));
    }

    #[test]
    fn test_usual_arithmetic_float_dominates() {
        let mut r = reg();
        let i = r.primitive(Primitive::Int);
        let f = r.primitive(Primitive::Float);
        let d = r.primitive(Primitive::Double);
        let c1 = r.usual_arithmetic(i, f).unwrap();
        assert_eq!(r.primitive_of(c1), Some(Primitive::Float));
        let c2 = r.usual_arithmetic(f, d).unwrap();
        assert_eq!(r.primitive_of(c2), Some(Primitive::Double));
    }

    #[test]
    fn test_char_plus_char_promotes_to_int() {
        let mut r = reg();
        let c = r.primitive(Primitive::Char);
        let common = r.usual_arithmetic(c, c).unwrap();
        assert_eq!(r.primitive_of(common), Some(Primitive::Int));
    }

    #[test]
    fn test_standard_conversion_categories() {
        let mut r = reg();
        let i = r.primitive(Primitive::Int);
        let c = r.primitive(Primitive::Char);
        let d = r.primitive(Primitive::Double);

        assert_eq!(r.standard_conversion(i, i).unwrap().category, ConvCategory::Exact);
        assert_eq!(
            r.standard_conversion(c, i).unwrap().category,
            ConvCategory::Promotion
        );
        assert_eq!(
            r.standard_conversion(i, d).unwrap().category,
            ConvCategory::Standard
        );
    }

    #[test]
    fn test_derived_to_base_pointer_distance() {
        let mut r = reg();
        let mut strings = StringTable::new();
        let base = strings.intern("Base");
        let mid = strings.intern("Mid");
        let derived = strings.intern("Derived");
        r.publish_class_bases(mid, vec![base]);
        r.publish_class_bases(derived, vec![mid]);

        let base_t = r.class(base);
        let derived_t = r.class(derived);
        let pb = r.pointer_to(base_t);
        let pd = r.pointer_to(derived_t);
        let rank = r.standard_conversion(pd, pb).unwrap();
        assert_eq!(rank.category, ConvCategory::Standard);
        assert_eq!(rank.base_distance, 2);
    }

    #[test]
    fn test_sizes() {
        let mut r = reg();
        let i = r.primitive(Primitive::Int);
        let d = r.primitive(Primitive::Double);
        let p = r.pointer_to(i);
        let a = r.array_of(i, Some(10));
        assert_eq!(r.size_of(i), Some(4));
        assert_eq!(r.size_of(d), Some(8));
        assert_eq!(r.size_of(p), Some(8));
        assert_eq!(r.size_of(a), Some(40));
    }

    #[test]
    fn test_dependent_detection() {
        let mut r = reg();
        let mut strings = StringTable::new();
        let t = strings.intern("T");
        let param = r.intern(TypeKind::TemplateParam { name: t }, Quals::NONE);
        let ptr = r.pointer_to(param);
        assert!(r.is_dependent(param));
        assert!(r.is_dependent(ptr));
        let i = r.primitive(Primitive::Int);
        assert!(!r.is_dependent(i));
    }
}
