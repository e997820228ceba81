//! Register descriptors and occupancy tracking.
//!
//! This module implements the RegisterFile that records, for every physical
//! register, whether it is Reserved, Free or InUse, which (DAG node, part)
//! pairs currently live in it, and the largest last-reference sequence number
//! among those users. It makes no code: spilling is driven by the instruction
//! selector, which owns the frame and the instruction list.

use super::error::CodegenError;
use crate::dag::NodeId;
use thiserror::Error;

/// Physical register number.
pub type RegId = u8;

pub const EAX: RegId = 0;
pub const EDX: RegId = 1;
pub const ECX: RegId = 2;
pub const EBX: RegId = 3;
pub const ESI: RegId = 4;
pub const EDI: RegId = 5;
/// Frame pointer.
pub const EBP: RegId = 6;
/// Stack pointer.
pub const ESP: RegId = 7;
/// Floating "stack" slots, modeled as two pseudo-registers.
pub const F0: RegId = 8;
pub const F1: RegId = 9;

pub const NUM_REGS: usize = 10;

const REG_NAMES: [&str; NUM_REGS] = [
    "eax", "edx", "ecx", "ebx", "esi", "edi", "ebp", "esp", "f0", "f1",
];

pub fn reg_name(reg: RegId) -> &'static str {
    REG_NAMES.get(reg as usize).copied().unwrap_or("?")
}

/// Bit set of physical registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegMask(u32);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);
    /// General integer registers, including the reserved ones.
    pub const GP: RegMask = RegMask(0x00ff);
    pub const FP: RegMask = RegMask(0x0300);

    pub const fn of(reg: RegId) -> Self {
        RegMask(1 << reg)
    }

    pub fn contains(self, reg: RegId) -> bool {
        self.0 & (1 << reg) != 0
    }

    pub fn with(self, reg: RegId) -> Self {
        RegMask(self.0 | (1 << reg))
    }

    pub fn without(self, reg: RegId) -> Self {
        RegMask(self.0 & !(1 << reg))
    }

    pub fn union(self, other: RegMask) -> Self {
        RegMask(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = RegId> {
        (0..NUM_REGS as RegId).filter(move |&r| self.contains(r))
    }
}

/// Allocation state of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Never allocatable (frame and stack pointer).
    Reserved,
    Free,
    InUse,
}

/// One (DAG node, part) association held by a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegUser {
    pub node: NodeId,
    /// 0 = low half (or the whole value), 1 = high half of a wide value.
    pub part: u8,
    pub last_ref: u32,
}

#[derive(Debug, Clone)]
struct RegDescriptor {
    state: RegState,
    users: Vec<RegUser>,
    max_last_ref: u32,
    /// Short-lived reservation while an instruction's operands are gathered.
    pin_count: u8,
}

impl RegDescriptor {
    fn new(state: RegState) -> Self {
        Self {
            state,
            users: Vec::new(),
            max_last_ref: 0,
            pin_count: 0,
        }
    }
}

/// Outcome of choosing a register for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegChoice {
    /// The register is Free, or all of its occupants are already dead.
    Available(RegId),
    /// Every candidate holds a live value; this one must be freed first.
    Evict(RegId),
}

impl RegChoice {
    pub fn reg(self) -> RegId {
        match self {
            RegChoice::Available(r) | RegChoice::Evict(r) => r,
        }
    }
}

/// Error types for register bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    #[error("no allocatable register among candidates {0:?}")]
    NoRegistersAvailable(RegMask),
    #[error("register {0} is reserved")]
    Reserved(RegId),
    #[error("node {node:?} part {part} is not associated with register {reg}")]
    NotAssociated { reg: RegId, node: NodeId, part: u8 },
    #[error("register {0} unpinned more often than pinned")]
    PinUnderflow(RegId),
}

impl From<RegAllocError> for CodegenError {
    fn from(err: RegAllocError) -> Self {
        CodegenError::invariant(err.to_string())
    }
}

/// Per-function register table.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: Vec<RegDescriptor>,
}

impl RegisterFile {
    pub fn new() -> Self {
        let regs = (0..NUM_REGS as RegId)
            .map(|r| {
                if r == EBP || r == ESP {
                    RegDescriptor::new(RegState::Reserved)
                } else {
                    RegDescriptor::new(RegState::Free)
                }
            })
            .collect();
        Self { regs }
    }

    /// Registers the allocator may hand out.
    pub fn allocatable(&self) -> RegMask {
        (0..NUM_REGS as RegId)
            .filter(|&r| self.regs[r as usize].state != RegState::Reserved)
            .fold(RegMask::EMPTY, RegMask::with)
    }

    pub fn state(&self, reg: RegId) -> RegState {
        self.regs[reg as usize].state
    }

    pub fn users(&self, reg: RegId) -> &[RegUser] {
        &self.regs[reg as usize].users
    }

    pub fn max_last_ref(&self, reg: RegId) -> u32 {
        self.regs[reg as usize].max_last_ref
    }

    pub fn is_pinned(&self, reg: RegId) -> bool {
        self.regs[reg as usize].pin_count > 0
    }

    fn usable(&self, candidates: RegMask) -> impl Iterator<Item = RegId> + '_ {
        candidates.iter().filter(move |&r| {
            let desc = &self.regs[r as usize];
            desc.state != RegState::Reserved && desc.pin_count == 0
        })
    }

    /// Choose a register among `candidates` for a value computed at `seq`.
    ///
    /// Free registers win, then registers whose occupants were last referenced
    /// before `seq`. Otherwise the occupied candidate with the largest
    /// last-reference is picked for eviction.
    pub fn choose(&self, candidates: RegMask, seq: u32) -> Result<RegChoice, RegAllocError> {
        if let Some(reg) = self
            .usable(candidates)
            .find(|&r| self.regs[r as usize].state == RegState::Free)
        {
            return Ok(RegChoice::Available(reg));
        }
        if let Some(reg) = self
            .usable(candidates)
            .find(|&r| self.regs[r as usize].max_last_ref < seq)
        {
            return Ok(RegChoice::Available(reg));
        }

        let mut victim: Option<RegId> = None;
        for reg in self.usable(candidates) {
            let better = match victim {
                None => true,
                Some(v) => self.regs[reg as usize].max_last_ref > self.regs[v as usize].max_last_ref,
            };
            if better {
                victim = Some(reg);
            }
        }
        victim
            .map(RegChoice::Evict)
            .ok_or(RegAllocError::NoRegistersAvailable(candidates))
    }

    /// Record that `reg` holds `part` of `node`.
    pub fn associate(
        &mut self,
        reg: RegId,
        node: NodeId,
        part: u8,
        last_ref: u32,
    ) -> Result<(), RegAllocError> {
        let desc = &mut self.regs[reg as usize];
        if desc.state == RegState::Reserved {
            return Err(RegAllocError::Reserved(reg));
        }
        if !desc.users.iter().any(|u| u.node == node && u.part == part) {
            desc.users.push(RegUser {
                node,
                part,
                last_ref,
            });
        }
        desc.max_last_ref = desc.max_last_ref.max(last_ref);
        desc.state = RegState::InUse;
        Ok(())
    }

    /// Remove one association; the register becomes Free with its last user.
    pub fn dissociate(&mut self, reg: RegId, node: NodeId, part: u8) -> Result<(), RegAllocError> {
        let desc = &mut self.regs[reg as usize];
        let before = desc.users.len();
        desc.users.retain(|u| !(u.node == node && u.part == part));
        if desc.users.len() == before {
            return Err(RegAllocError::NotAssociated { reg, node, part });
        }
        desc.max_last_ref = desc.users.iter().map(|u| u.last_ref).max().unwrap_or(0);
        if desc.users.is_empty() {
            desc.state = RegState::Free;
        }
        Ok(())
    }

    /// Drop every association of `reg`, returning the former users.
    pub fn clear(&mut self, reg: RegId) -> Vec<RegUser> {
        let desc = &mut self.regs[reg as usize];
        if desc.state == RegState::Reserved {
            return Vec::new();
        }
        desc.state = RegState::Free;
        desc.max_last_ref = 0;
        std::mem::take(&mut desc.users)
    }

    /// Find the register holding `part` of `node`.
    pub fn find(&self, node: NodeId, part: u8) -> Option<RegId> {
        self.regs
            .iter()
            .position(|d| d.users.iter().any(|u| u.node == node && u.part == part))
            .map(|idx| idx as RegId)
    }

    pub fn mark_used(&mut self, reg: RegId) {
        self.regs[reg as usize].pin_count += 1;
    }

    pub fn unmark_used(&mut self, reg: RegId) -> Result<(), RegAllocError> {
        let desc = &mut self.regs[reg as usize];
        if desc.pin_count == 0 {
            return Err(RegAllocError::PinUnderflow(reg));
        }
        desc.pin_count -= 1;
        Ok(())
    }

    /// Registers currently holding at least one value.
    pub fn in_use(&self) -> RegMask {
        (0..NUM_REGS as RegId)
            .filter(|&r| self.regs[r as usize].state == RegState::InUse)
            .fold(RegMask::EMPTY, RegMask::with)
    }

    /// Reset for a new function.
    pub fn reset(&mut self) {
        for desc in &mut self.regs {
            if desc.state != RegState::Reserved {
                desc.state = RegState::Free;
            }
            desc.users.clear();
            desc.max_last_ref = 0;
            desc.pin_count = 0;
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u32) -> NodeId {
        NodeId::from_raw(n)
    }

    #[test]
    fn test_reserved_registers_never_allocated() {
        let regs = RegisterFile::new();
        assert_eq!(regs.state(EBP), RegState::Reserved);
        assert_eq!(regs.state(ESP), RegState::Reserved);
        let choice = regs.choose(RegMask::of(EBP).with(ESP), 0);
        assert!(matches!(choice, Err(RegAllocError::NoRegistersAvailable(_))));
        assert!(!regs.allocatable().contains(ESP));
    }

    #[test]
    fn test_prefers_free_register() {
        let mut regs = RegisterFile::new();
        regs.associate(EAX, node(1), 0, 10).unwrap();
        let choice = regs.choose(RegMask::of(EAX).with(EDX), 5).unwrap();
        assert_eq!(choice, RegChoice::Available(EDX));
    }

    #[test]
    fn test_dead_occupant_is_reusable() {
        let mut regs = RegisterFile::new();
        regs.associate(EAX, node(1), 0, 3).unwrap();
        let choice = regs.choose(RegMask::of(EAX), 4).unwrap();
        assert_eq!(choice, RegChoice::Available(EAX));
    }

    #[test]
    fn test_evicts_largest_last_reference() {
        let mut regs = RegisterFile::new();
        regs.associate(EAX, node(1), 0, 20).unwrap();
        regs.associate(EDX, node(2), 0, 50).unwrap();
        regs.associate(ECX, node(3), 0, 30).unwrap();
        let mask = RegMask::of(EAX).with(EDX).with(ECX);
        assert_eq!(regs.choose(mask, 10).unwrap(), RegChoice::Evict(EDX));
    }

    #[test]
    fn test_pinned_register_is_skipped() {
        let mut regs = RegisterFile::new();
        regs.associate(EAX, node(1), 0, 20).unwrap();
        regs.associate(EDX, node(2), 0, 50).unwrap();
        regs.mark_used(EDX);
        let mask = RegMask::of(EAX).with(EDX);
        assert_eq!(regs.choose(mask, 10).unwrap(), RegChoice::Evict(EAX));
        regs.unmark_used(EDX).unwrap();
        assert_eq!(regs.unmark_used(EDX), Err(RegAllocError::PinUnderflow(EDX)));
    }

    #[test]
    fn test_wide_value_parts() {
        let mut regs = RegisterFile::new();
        regs.associate(EAX, node(4), 0, 9).unwrap();
        regs.associate(EDX, node(4), 1, 9).unwrap();
        assert_eq!(regs.find(node(4), 0), Some(EAX));
        assert_eq!(regs.find(node(4), 1), Some(EDX));

        regs.dissociate(EDX, node(4), 1).unwrap();
        assert_eq!(regs.state(EDX), RegState::Free);
        assert_eq!(regs.state(EAX), RegState::InUse);
        assert!(regs.dissociate(EDX, node(4), 1).is_err());
    }

    #[test]
    fn test_max_last_ref_tracks_users() {
        let mut regs = RegisterFile::new();
        regs.associate(EBX, node(1), 0, 7).unwrap();
        regs.associate(EBX, node(2), 0, 12).unwrap();
        assert_eq!(regs.max_last_ref(EBX), 12);
        regs.dissociate(EBX, node(2), 0).unwrap();
        assert_eq!(regs.max_last_ref(EBX), 7);
        let users = regs.clear(EBX);
        assert_eq!(users.len(), 1);
        assert_eq!(regs.state(EBX), RegState::Free);
    }
}
