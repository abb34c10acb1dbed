//! Linear-scan register allocation
//!
//! Values get live intervals from their definition to their last use, and
//! a single forward scan assigns them to the fixed GPR/XMM file. The
//! callee-saved GPRs survive calls; caller-saved registers (including all
//! XMMs) are only handed to intervals that do not cross a call site. When
//! a pool is exhausted the interval with the farthest next use spills to
//! an aligned stack slot sized to the value's full type width — a 32-bit
//! value spilled with a 64-bit move would corrupt its neighbor.
//!
//! A per-use preference biases values first used as a call argument toward
//! that argument's convention register when it is free.

use super::abi::{Abi, ArgLoc};
use super::emit::{Gpr, Width, Xmm};
use crate::ir::{IrFunction, Opcode, Payload, ValueId};
use crate::types::TypeRegistry;
use std::collections::HashMap;

/// Where a value lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    Gpr(Gpr),
    Xmm(Xmm),
    /// Spill slot at `[rbp + offset]` (negative), width-exact.
    Spill { offset: i32, width: Width },
    /// The address produced by an Alloca: the slot itself lives at
    /// `[rbp + offset]`; reading the value means LEA, not a load.
    LocalAddr { offset: i32 },
}

#[derive(Debug)]
pub struct Allocation {
    pub locs: HashMap<ValueId, Loc>,
    /// Total frame bytes below the saved registers (allocas + spills),
    /// 16-aligned.
    pub frame_size: u32,
    /// Callee-saved registers the prologue must preserve.
    pub callee_saved_used: Vec<Gpr>,
}

impl Allocation {
    pub fn loc_of(&self, v: ValueId) -> Loc {
        self.locs
            .get(&v)
            .copied()
            .unwrap_or(Loc::Spill {
                offset: -8,
                width: Width::W8,
            })
    }
}

/// Callee-saved pool: survives calls.
const CALLEE_SAVED: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];
/// Caller-saved pool for call-free intervals; matches the System V
/// argument registers so the preference bias can land values in place.
const CALLER_SAVED: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];
/// XMM pool for call-free float intervals; XMM0/XMM1 stay scratch.
const XMM_POOL: [Xmm; 8] = [
    Xmm(8),
    Xmm(9),
    Xmm(10),
    Xmm(11),
    Xmm(12),
    Xmm(13),
    Xmm(14),
    Xmm(15),
];

#[derive(Debug, Clone)]
struct Interval {
    value: ValueId,
    start: usize,
    end: usize,
    is_float: bool,
    width: Width,
    crosses_call: bool,
    /// Preferred ABI register from the value's first use as a call arg.
    preferred: Option<Gpr>,
}

pub fn allocate(f: &IrFunction, types: &TypeRegistry, abi: Abi) -> Allocation {
    let mut locs: HashMap<ValueId, Loc> = HashMap::new();
    let mut frame: i32 = 0;

    // Allocas claim their frame storage first; their "value" is an address
    // materialized by LEA.
    for instr in &f.instrs {
        if instr.op == Opcode::Alloca
            && let Payload::Alloca { size, align } = &instr.payload
            && let Some(r) = instr.result
        {
            let align = (*align).max(1) as i32;
            frame = round_up(frame + *size as i32, align);
            locs.insert(r, Loc::LocalAddr { offset: -frame });
        }
    }

    // Live intervals: definition index and last use.
    let mut def: HashMap<ValueId, usize> = HashMap::new();
    let mut last_use: HashMap<ValueId, usize> = HashMap::new();
    let mut call_sites: Vec<usize> = Vec::new();
    // Parameter values are defined at entry.
    for i in 0..f.params.len() {
        def.insert(ValueId(i as u32), 0);
        last_use.insert(ValueId(i as u32), 0);
    }
    for (i, instr) in f.instrs.iter().enumerate() {
        if let Some(r) = instr.result {
            def.entry(r).or_insert(i);
        }
        if matches!(instr.op, Opcode::Call | Opcode::CallIndirect | Opcode::VCall) {
            call_sites.push(i);
        }
        for u in payload_uses(&instr.payload) {
            last_use.insert(u, i);
        }
    }

    // Preference bias: a value whose next use is a call argument prefers
    // that argument's convention register.
    let mut preferred: HashMap<ValueId, Gpr> = HashMap::new();
    for instr in &f.instrs {
        if let Payload::Call { args, .. } = &instr.payload {
            let is_float = vec![false; args.len()];
            let assign = abi.assign_args(&is_float);
            for (a, loc) in args.iter().zip(assign) {
                if let ArgLoc::Gpr(g) = loc {
                    preferred.entry(*a).or_insert(g);
                }
            }
        }
    }

    let mut intervals: Vec<Interval> = Vec::new();
    for (&v, &start) in &def {
        if locs.contains_key(&v) {
            continue; // alloca
        }
        let end = last_use.get(&v).copied().unwrap_or(start);
        let instr = f.instrs.iter().find(|i| i.result == Some(v));
        let (is_float, width) = match instr.and_then(|i| i.ty) {
            Some(t) => {
                let p = types.primitive_of(t);
                let is_float = p.is_some_and(|p| p.is_floating());
                let size = types.size_of(t).unwrap_or(8).clamp(1, 8);
                (is_float, Width::from_size(size))
            }
            None => {
                // Parameters take their declared type.
                let idx = v.0 as usize;
                if let Some((_, t)) = f.params.get(idx) {
                    let p = types.primitive_of(*t);
                    let size = types.size_of(*t).unwrap_or(8).clamp(1, 8);
                    (p.is_some_and(|p| p.is_floating()), Width::from_size(size))
                } else {
                    (false, Width::W8)
                }
            }
        };
        // A value whose last use is the call itself dies there and may sit
        // in a caller-saved register; only uses beyond the call force a
        // surviving home.
        let crosses_call = call_sites.iter().any(|&c| c > start && c < end);
        intervals.push(Interval {
            value: v,
            start,
            end,
            is_float,
            width,
            crosses_call,
            preferred: preferred.get(&v).copied(),
        });
    }
    intervals.sort_by_key(|iv| (iv.start, iv.value));

    // Linear scan.
    let mut active: Vec<(Interval, Loc)> = Vec::new();
    let mut free_callee: Vec<Gpr> = CALLEE_SAVED.to_vec();
    let mut free_caller: Vec<Gpr> = CALLER_SAVED.to_vec();
    let mut free_xmm: Vec<Xmm> = XMM_POOL.to_vec();
    let mut callee_saved_used: Vec<Gpr> = Vec::new();
    let mut spill_frame = frame;

    let mut spill_slot = |iv: &Interval, spill_frame: &mut i32| -> Loc {
        let w = iv.width.bytes() as i32;
        *spill_frame = round_up(*spill_frame + w, w);
        Loc::Spill {
            offset: -*spill_frame,
            width: iv.width,
        }
    };

    for iv in intervals {
        // Expire finished intervals.
        active.retain(|(a, loc)| {
            if a.end < iv.start {
                match loc {
                    Loc::Gpr(g) => {
                        if CALLEE_SAVED.contains(g) {
                            free_callee.push(*g);
                        } else {
                            free_caller.push(*g);
                        }
                    }
                    Loc::Xmm(x) => free_xmm.push(*x),
                    _ => {}
                }
                false
            } else {
                true
            }
        });

        let loc = if iv.is_float {
            if !iv.crosses_call && !free_xmm.is_empty() {
                Loc::Xmm(free_xmm.remove(0))
            } else {
                spill_slot(&iv, &mut spill_frame)
            }
        } else if iv.crosses_call {
            if let Some(pos) = free_callee.iter().position(|_| true) {
                let g = free_callee.remove(pos);
                if !callee_saved_used.contains(&g) {
                    callee_saved_used.push(g);
                }
                Loc::Gpr(g)
            } else {
                // Pool exhausted: spill whichever of (this, farthest active)
                // has the farthest next use.
                let farthest = active
                    .iter()
                    .enumerate()
                    .filter(|(_, (a, l))| !a.is_float && matches!(l, Loc::Gpr(g) if CALLEE_SAVED.contains(g)))
                    .max_by_key(|(_, (a, _))| a.end);
                match farthest {
                    Some((idx, (a, _))) if a.end > iv.end => {
                        let (victim, vloc) = active.remove(idx);
                        let slot = spill_slot(&victim, &mut spill_frame);
                        locs.insert(victim.value, slot);
                        let got = vloc;
                        active.push((iv.clone(), got));
                        locs.insert(iv.value, got);
                        continue;
                    }
                    _ => spill_slot(&iv, &mut spill_frame),
                }
            }
        } else {
            // Call-free: caller-saved pool, honoring the ABI preference.
            let pick = iv
                .preferred
                .and_then(|p| free_caller.iter().position(|&g| g == p))
                .or_else(|| if free_caller.is_empty() { None } else { Some(0) });
            match pick {
                Some(pos) => Loc::Gpr(free_caller.remove(pos)),
                None => spill_slot(&iv, &mut spill_frame),
            }
        };
        locs.insert(iv.value, loc);
        if matches!(loc, Loc::Gpr(_) | Loc::Xmm(_)) {
            active.push((iv, loc));
        }
    }

    Allocation {
        locs,
        frame_size: round_up(spill_frame, 16) as u32,
        callee_saved_used,
    }
}

fn round_up(v: i32, align: i32) -> i32 {
    if align <= 1 {
        return v;
    }
    (v + align - 1) / align * align
}

/// Values an instruction reads.
pub fn payload_uses(p: &Payload) -> Vec<ValueId> {
    match p {
        Payload::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
        Payload::Unary { operand } | Payload::Cast { operand } => vec![*operand],
        Payload::Branch { cond, .. } => vec![*cond],
        Payload::Call { args, .. } => args.clone(),
        Payload::CallIndirect { target, args } => {
            let mut v = vec![*target];
            v.extend(args);
            v
        }
        Payload::VCall { object, args, .. } => {
            let mut v = vec![*object];
            v.extend(args);
            v
        }
        Payload::Ret { value } => value.iter().copied().collect(),
        Payload::Load { addr } => vec![*addr],
        Payload::Store { addr, value } => vec![*addr, *value],
        Payload::Lea { base, .. } => vec![*base],
        Payload::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
        Payload::ThrowValue { value, .. } => value.iter().copied().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::strings::StringTable;
    use crate::types::{Primitive, TypeRegistry};

    fn mk(types: &mut TypeRegistry) -> IrFunction {
        let mut strings = StringTable::new();
        let int = types.primitive(Primitive::Int);
        let name = strings.intern("f");
        IrFunction::new(name, name, int, SourceLoc::unknown())
    }

    #[test]
    fn test_alloca_gets_local_addr() {
        let mut types = TypeRegistry::new(true);
        let mut f = mk(&mut types);
        let int = types.primitive(Primitive::Int);
        let p = types.pointer_to(int);
        let loc = SourceLoc::unknown();
        let a = f.emit(Opcode::Alloca, Payload::Alloca { size: 4, align: 4 }, p, loc);
        let alloc = allocate(&f, &types, Abi::SysV);
        assert!(matches!(alloc.loc_of(a), Loc::LocalAddr { .. }));
    }

    #[test]
    fn test_spill_slots_are_width_exact() {
        let mut types = TypeRegistry::new(true);
        let mut f = mk(&mut types);
        let int = types.primitive(Primitive::Int);
        let loc = SourceLoc::unknown();
        // Exhaust the caller-saved pool with long-lived 4-byte values.
        let mut vals = Vec::new();
        for i in 0..10 {
            vals.push(f.emit(
                Opcode::ConstInt,
                Payload::ConstInt { value: i },
                int,
                loc,
            ));
        }
        // Keep them all alive to the end.
        for &v in &vals {
            f.emit(
                Opcode::Add,
                Payload::Binary {
                    lhs: v,
                    rhs: v,
                    is_signed: true,
                    is_float: false,
                },
                int,
                loc,
            );
        }
        let alloc = allocate(&f, &types, Abi::SysV);
        let spills: Vec<Loc> = vals
            .iter()
            .map(|&v| alloc.loc_of(v))
            .filter(|l| matches!(l, Loc::Spill { .. }))
            .collect();
        assert!(!spills.is_empty(), "pool exhaustion must spill");
        for s in spills {
            let Loc::Spill { width, offset } = s else {
                unreachable!()
            };
            assert_eq!(width, Width::W4);
            assert_eq!(offset % 4, 0, "spill slot misaligned: {}", offset);
        }
    }

    #[test]
    fn test_call_crossing_value_gets_callee_saved() {
        let mut types = TypeRegistry::new(true);
        let mut strings = StringTable::new();
        let mut f = mk(&mut types);
        let int = types.primitive(Primitive::Int);
        let loc = SourceLoc::unknown();
        let v = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 1 }, int, loc);
        let callee = strings.intern("g");
        f.emit(
            Opcode::Call,
            Payload::Call {
                callee,
                args: vec![],
                variadic_float_args: 0,
            },
            int,
            loc,
        );
        // Use v after the call: its interval crosses the call site.
        f.emit(
            Opcode::Add,
            Payload::Binary {
                lhs: v,
                rhs: v,
                is_signed: true,
                is_float: false,
            },
            int,
            loc,
        );
        let alloc = allocate(&f, &types, Abi::SysV);
        match alloc.loc_of(v) {
            Loc::Gpr(g) => assert!(CALLEE_SAVED.contains(&g), "{:?} not callee-saved", g),
            Loc::Spill { .. } => {}
            other => panic!("unexpected loc {:?}", other),
        }
        assert!(!alloc.callee_saved_used.is_empty() || matches!(alloc.loc_of(v), Loc::Spill { .. }));
    }

    #[test]
    fn test_frame_size_is_16_aligned() {
        let mut types = TypeRegistry::new(true);
        let mut f = mk(&mut types);
        let int = types.primitive(Primitive::Int);
        let p = types.pointer_to(int);
        let loc = SourceLoc::unknown();
        f.emit(Opcode::Alloca, Payload::Alloca { size: 4, align: 4 }, p, loc);
        f.emit(Opcode::Alloca, Payload::Alloca { size: 1, align: 1 }, p, loc);
        let alloc = allocate(&f, &types, Abi::SysV);
        assert_eq!(alloc.frame_size % 16, 0);
    }

    #[test]
    fn test_preference_bias_lands_arg_register() {
        let mut types = TypeRegistry::new(true);
        let mut strings = StringTable::new();
        let mut f = mk(&mut types);
        let int = types.primitive(Primitive::Int);
        let loc = SourceLoc::unknown();
        let v = f.emit(Opcode::ConstInt, Payload::ConstInt { value: 3 }, int, loc);
        let callee = strings.intern("g");
        // v is only used as the first call argument: prefer RDI.
        f.emit(
            Opcode::Call,
            Payload::Call {
                callee,
                args: vec![v],
                variadic_float_args: 0,
            },
            int,
            loc,
        );
        let alloc = allocate(&f, &types, Abi::SysV);
        assert_eq!(alloc.loc_of(v), Loc::Gpr(Gpr::Rdi));
    }
}
