//! Calling-convention lowering
//!
//! Argument and return classification for the two supported ABIs. System V
//! counts integer and floating pools independently; Microsoft x64 burns one
//! positional slot per argument regardless of class and reserves a 32-byte
//! shadow area for the callee.

use super::emit::{Gpr, Xmm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    SysV,
    Win64,
}

/// Where one argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    Gpr(Gpr),
    Xmm(Xmm),
    /// Byte offset into the outgoing stack-argument area.
    Stack(u32),
}

/// How a return value travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetClass {
    /// ≤ 8 bytes in RAX.
    IntReg,
    /// 9..16 bytes in RAX:RDX (System V only).
    IntPair,
    /// Scalar float in XMM0.
    FloatReg,
    /// Larger aggregates via hidden first argument.
    Hidden,
    Void,
}

const SYSV_INT_ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];
const WIN_INT_ARGS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];

impl Abi {
    pub fn int_arg_regs(self) -> &'static [Gpr] {
        match self {
            Abi::SysV => &SYSV_INT_ARGS,
            Abi::Win64 => &WIN_INT_ARGS,
        }
    }

    pub fn float_arg_count(self) -> usize {
        match self {
            Abi::SysV => 8,
            Abi::Win64 => 4,
        }
    }

    /// Caller-reserved shadow/home space, in bytes.
    pub fn shadow_space(self) -> u32 {
        match self {
            Abi::SysV => 0,
            Abi::Win64 => 32,
        }
    }

    /// Callers of varargs functions must set AL to the number of XMM
    /// registers used (System V only).
    pub fn needs_al_float_count(self) -> bool {
        self == Abi::SysV
    }

    /// Assign argument locations. `is_float[i]` classifies each argument;
    /// sizes > 16 would go by hidden pointer and are pre-lowered to
    /// pointer arguments before this point.
    pub fn assign_args(self, is_float: &[bool]) -> Vec<ArgLoc> {
        let mut out = Vec::with_capacity(is_float.len());
        match self {
            Abi::SysV => {
                // Independent pools.
                let mut ints = 0usize;
                let mut floats = 0usize;
                let mut stack = 0u32;
                for &f in is_float {
                    if f {
                        if floats < self.float_arg_count() {
                            out.push(ArgLoc::Xmm(Xmm(floats as u8)));
                            floats += 1;
                        } else {
                            out.push(ArgLoc::Stack(stack));
                            stack += 8;
                        }
                    } else if ints < SYSV_INT_ARGS.len() {
                        out.push(ArgLoc::Gpr(SYSV_INT_ARGS[ints]));
                        ints += 1;
                    } else {
                        out.push(ArgLoc::Stack(stack));
                        stack += 8;
                    }
                }
            }
            Abi::Win64 => {
                // One positional slot per argument: RCX⇄XMM0, RDX⇄XMM1, ...
                for (i, &f) in is_float.iter().enumerate() {
                    if i < 4 {
                        if f {
                            out.push(ArgLoc::Xmm(Xmm(i as u8)));
                        } else {
                            out.push(ArgLoc::Gpr(WIN_INT_ARGS[i]));
                        }
                    } else {
                        out.push(ArgLoc::Stack(((i as u32) - 4) * 8 + self.shadow_space()));
                    }
                }
            }
        }
        out
    }

    /// Return classification from size/float-ness.
    pub fn classify_return(self, size: u64, is_float: bool) -> RetClass {
        if size == 0 {
            return RetClass::Void;
        }
        if is_float {
            return RetClass::FloatReg;
        }
        if size <= 8 {
            return RetClass::IntReg;
        }
        match self {
            Abi::SysV if size <= 16 => RetClass::IntPair,
            _ => RetClass::Hidden,
        }
    }

    /// Bytes of outgoing stack-argument area a call with these locations
    /// needs (including shadow space).
    pub fn stack_arg_bytes(self, locs: &[ArgLoc]) -> u32 {
        let max_off = locs
            .iter()
            .filter_map(|l| match l {
                ArgLoc::Stack(o) => Some(*o + 8),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        max_off.max(self.shadow_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_integer_sequence() {
        let locs = Abi::SysV.assign_args(&[false, false, false, false, false, false, false]);
        assert_eq!(locs[0], ArgLoc::Gpr(Gpr::Rdi));
        assert_eq!(locs[1], ArgLoc::Gpr(Gpr::Rsi));
        assert_eq!(locs[2], ArgLoc::Gpr(Gpr::Rdx));
        assert_eq!(locs[3], ArgLoc::Gpr(Gpr::Rcx));
        assert_eq!(locs[4], ArgLoc::Gpr(Gpr::R8));
        assert_eq!(locs[5], ArgLoc::Gpr(Gpr::R9));
        assert_eq!(locs[6], ArgLoc::Stack(0));
    }

    #[test]
    fn test_sysv_pools_count_independently() {
        // int, float, int, float: ints take RDI/RSI, floats XMM0/XMM1.
        let locs = Abi::SysV.assign_args(&[false, true, false, true]);
        assert_eq!(locs[0], ArgLoc::Gpr(Gpr::Rdi));
        assert_eq!(locs[1], ArgLoc::Xmm(Xmm(0)));
        assert_eq!(locs[2], ArgLoc::Gpr(Gpr::Rsi));
        assert_eq!(locs[3], ArgLoc::Xmm(Xmm(1)));
    }

    #[test]
    fn test_win64_positional_slots() {
        // Same shape on Win64 shares the positional slots.
        let locs = Abi::Win64.assign_args(&[false, true, false, true]);
        assert_eq!(locs[0], ArgLoc::Gpr(Gpr::Rcx));
        assert_eq!(locs[1], ArgLoc::Xmm(Xmm(1)));
        assert_eq!(locs[2], ArgLoc::Gpr(Gpr::R8));
        assert_eq!(locs[3], ArgLoc::Xmm(Xmm(3)));
    }

    #[test]
    fn test_win64_fifth_arg_past_shadow_space() {
        let locs = Abi::Win64.assign_args(&[false; 5]);
        assert_eq!(locs[4], ArgLoc::Stack(32));
        assert_eq!(Abi::Win64.stack_arg_bytes(&locs), 40);
    }

    #[test]
    fn test_return_classification() {
        assert_eq!(Abi::SysV.classify_return(4, false), RetClass::IntReg);
        assert_eq!(Abi::SysV.classify_return(16, false), RetClass::IntPair);
        assert_eq!(Abi::SysV.classify_return(24, false), RetClass::Hidden);
        assert_eq!(Abi::Win64.classify_return(16, false), RetClass::Hidden);
        assert_eq!(Abi::SysV.classify_return(8, true), RetClass::FloatReg);
        assert_eq!(Abi::SysV.classify_return(0, false), RetClass::Void);
    }

    #[test]
    fn test_shadow_space_reserved_even_without_stack_args() {
        let locs = Abi::Win64.assign_args(&[false]);
        assert_eq!(Abi::Win64.stack_arg_bytes(&locs), 32);
        let locs = Abi::SysV.assign_args(&[false]);
        assert_eq!(Abi::SysV.stack_arg_bytes(&locs), 0);
    }
}
