//! Frame and local-storage management.
//!
//! The local-use stack mirrors the current frame layout: block markers,
//! declared locals and temporary slots, in allocation order. Locals and
//! temporaries live at negative frame-pointer offsets; the offset cursor only
//! shrinks when a block is left, so sibling blocks share their slots without
//! any liveness analysis.

use super::error::{CodegenError, CodegenResult};
use super::symbols::{Symbol, SymbolTable};
use crate::dag::NodeId;
use log::trace;

/// Offset of the first parameter above the frame pointer
/// (saved frame pointer, then return address).
pub const FIRST_PARAM_OFFSET: i32 = 8;

/// Frame slots are handed out in 4-byte units.
pub const SLOT_UNIT: u32 = 4;

pub fn round_to_slot(size: u32) -> u32 {
    size.max(1).div_ceil(SLOT_UNIT) * SLOT_UNIT
}

/// One entry of the local-use stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalUse {
    Block {
        level: u32,
        /// Cursor value when the block was entered.
        offset: u32,
    },
    Local {
        sym: Symbol,
        offset: i32,
    },
    Temp {
        offset: i32,
        size: u32,
        owner: NodeId,
        /// Last reference of the owning value; the slot is free after it.
        owner_last_ref: u32,
    },
}

/// Per-function frame layout.
#[derive(Debug, Clone)]
pub struct FrameManager {
    stack: Vec<LocalUse>,
    cursor: u32,
    max_size: u32,
    next_param: i32,
}

impl FrameManager {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            cursor: 0,
            max_size: 0,
            next_param: FIRST_PARAM_OFFSET,
        }
    }

    /// Bytes of locals and temporaries currently allocated.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Largest frame size seen so far; the frame-enter instruction reserves it.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn entries(&self) -> &[LocalUse] {
        &self.stack
    }

    fn bump(&mut self, size: u32) -> i32 {
        self.cursor += round_to_slot(size);
        self.max_size = self.max_size.max(self.cursor);
        -(self.cursor as i32)
    }

    /// Assign the next incoming-argument slot to a parameter.
    pub fn bind_param(&mut self, sym: Symbol, symbols: &mut SymbolTable) -> i32 {
        let offset = self.next_param;
        self.next_param += round_to_slot(symbols.ty(sym).size()) as i32;
        symbols.set_offset(sym, offset);
        offset
    }

    pub fn enter_block(&mut self, level: u32) {
        self.stack.push(LocalUse::Block {
            level,
            offset: self.cursor,
        });
    }

    /// Pop everything down to the marker of `level` and roll the cursor back.
    ///
    /// Temporaries whose owner is still live at `seq` survive the pop and keep
    /// the cursor from dropping below them.
    pub fn leave_block(&mut self, level: u32, seq: u32) -> CodegenResult<()> {
        let mut survivors = Vec::new();
        loop {
            let entry = self.stack.pop().ok_or_else(|| {
                CodegenError::invariant(format!("no block marker for level {level}"))
            })?;
            match entry {
                LocalUse::Block { level: l, offset } if l == level => {
                    self.cursor = offset;
                    break;
                }
                LocalUse::Block { level: l, .. } => {
                    return Err(CodegenError::invariant(format!(
                        "leaving level {level} across unclosed level {l}"
                    )));
                }
                LocalUse::Temp { owner_last_ref, .. } if owner_last_ref >= seq => {
                    survivors.push(entry);
                }
                LocalUse::Temp { .. } | LocalUse::Local { .. } => {}
            }
        }
        for entry in survivors.into_iter().rev() {
            if let LocalUse::Temp { offset, .. } = entry {
                self.cursor = self.cursor.max((-offset) as u32);
            }
            self.stack.push(entry);
        }
        trace!("leave block {level}: cursor {}", self.cursor);
        Ok(())
    }

    /// Allocate a frame slot for a declared local and record it on the symbol.
    pub fn declare_local(&mut self, sym: Symbol, symbols: &mut SymbolTable) -> i32 {
        let offset = self.bump(symbols.ty(sym).size());
        symbols.set_offset(sym, offset);
        self.stack.push(LocalUse::Local { sym, offset });
        offset
    }

    /// Find a temporary slot of at least `size` bytes for `owner`.
    ///
    /// A slot whose previous owner was last referenced before `seq` is reused;
    /// otherwise a new one is allocated.
    pub fn get_or_alloc_temp(
        &mut self,
        seq: u32,
        owner: NodeId,
        size: u32,
        owner_last_ref: u32,
    ) -> i32 {
        let size = round_to_slot(size);
        for entry in self.stack.iter_mut() {
            if let LocalUse::Temp {
                offset,
                size: slot_size,
                owner: slot_owner,
                owner_last_ref: slot_last_ref,
            } = entry
            {
                if *slot_size >= size && *slot_last_ref < seq {
                    *slot_owner = owner;
                    *slot_last_ref = owner_last_ref;
                    trace!("reuse temp slot {offset} for {owner:?}");
                    return *offset;
                }
            }
        }
        let offset = self.bump(size);
        self.stack.push(LocalUse::Temp {
            offset,
            size,
            owner,
            owner_last_ref,
        });
        trace!("new temp slot {offset} for {owner:?}");
        offset
    }

    /// Number of temporary slots currently on the stack.
    pub fn temp_count(&self) -> usize {
        self.stack
            .iter()
            .filter(|e| matches!(e, LocalUse::Temp { .. }))
            .count()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for FrameManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbols::CType;

    #[test]
    fn test_locals_rounded_to_slots() {
        let mut symbols = SymbolTable::new();
        let mut frame = FrameManager::new();
        let c = symbols.local("c", CType::Char);
        let d = symbols.local("d", CType::Double);
        frame.enter_block(1);
        assert_eq!(frame.declare_local(c, &mut symbols), -4);
        assert_eq!(frame.declare_local(d, &mut symbols), -12);
        assert_eq!(symbols.offset(d), Some(-12));
        assert_eq!(frame.max_size(), 12);
    }

    #[test]
    fn test_sibling_blocks_share_slots() {
        let mut symbols = SymbolTable::new();
        let mut frame = FrameManager::new();
        let x = symbols.local("x", CType::Int);
        let y = symbols.local("y", CType::Int);

        frame.enter_block(1);
        let ox = frame.declare_local(x, &mut symbols);
        frame.leave_block(1, 0).unwrap();
        frame.enter_block(1);
        let oy = frame.declare_local(y, &mut symbols);
        frame.leave_block(1, 0).unwrap();

        assert_eq!(ox, oy);
        assert_eq!(frame.cursor(), 0);
        assert_eq!(frame.max_size(), 4);
    }

    #[test]
    fn test_temp_reuse_after_owner_dies() {
        let mut frame = FrameManager::new();
        let a = NodeId::from_raw(1);
        let b = NodeId::from_raw(2);
        let c = NodeId::from_raw(3);

        let ta = frame.get_or_alloc_temp(1, a, 4, 3);
        // Owner `a` is still live at 2.
        let tb = frame.get_or_alloc_temp(2, b, 4, 5);
        assert_ne!(ta, tb);
        // `a` died after 3.
        let tc = frame.get_or_alloc_temp(4, c, 4, 6);
        assert_eq!(tc, ta);
        assert_eq!(frame.temp_count(), 2);
    }

    #[test]
    fn test_temp_too_small_is_not_reused() {
        let mut frame = FrameManager::new();
        let small = frame.get_or_alloc_temp(1, NodeId::from_raw(1), 4, 1);
        let big = frame.get_or_alloc_temp(5, NodeId::from_raw(2), 8, 6);
        assert_ne!(small, big);
        assert_eq!(frame.max_size(), 12);
    }

    #[test]
    fn test_live_temp_survives_block_exit() {
        let mut symbols = SymbolTable::new();
        let mut frame = FrameManager::new();
        let x = symbols.local("x", CType::Int);
        frame.enter_block(1);
        frame.declare_local(x, &mut symbols);
        let live = frame.get_or_alloc_temp(2, NodeId::from_raw(7), 4, 9);
        frame.get_or_alloc_temp(2, NodeId::from_raw(8), 4, 2);
        frame.leave_block(1, 3).unwrap();

        assert_eq!(frame.temp_count(), 1);
        assert_eq!(frame.cursor(), (-live) as u32);
    }

    #[test]
    fn test_unbalanced_leave_is_an_error() {
        let mut frame = FrameManager::new();
        assert!(frame.leave_block(1, 0).is_err());
        frame.enter_block(1);
        frame.enter_block(2);
        assert!(frame.leave_block(1, 0).is_err());
    }

    #[test]
    fn test_params_above_frame_pointer() {
        let mut symbols = SymbolTable::new();
        let mut frame = FrameManager::new();
        let a = symbols.param("a", CType::Int);
        let b = symbols.param("b", CType::LongLong);
        let c = symbols.param("c", CType::Char);
        assert_eq!(frame.bind_param(a, &mut symbols), 8);
        assert_eq!(frame.bind_param(b, &mut symbols), 12);
        assert_eq!(frame.bind_param(c, &mut symbols), 20);
    }
}
