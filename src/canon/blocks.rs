//! Basic-block formation over the IR code list.
//!
//! A block starts at every label (and after every jump) and ends at the
//! first jump, inclusive, or just before the next label. Falling into the
//! next label is recorded as the block's fallthrough successor rather than
//! as an inserted jump code, so the code list stays untouched and block
//! boundaries are plain index ranges into it.

use super::IrCode;
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::symbols::Symbol;
use hashbrown::HashMap;
use log::{debug, warn};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub label: Option<Symbol>,
    /// Code indices covered by the block.
    pub codes: Range<usize>,
    /// Unconditional successor: the jump target, or the next block on fallthrough.
    pub next: Option<BlockId>,
    /// Conditional-jump target, distinct from the fallthrough.
    pub taken: Option<BlockId>,
    pub reachable: bool,
}

impl BasicBlock {
    pub fn successors(&self) -> impl Iterator<Item = BlockId> {
        self.next.into_iter().chain(self.taken)
    }
}

/// Blocks of one function in program order.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
}

impl Cfg {
    /// Split `codes` into blocks; `exit` is where returns transfer control.
    pub fn build(codes: &[IrCode], exit: Symbol) -> CodegenResult<Self> {
        let mut ranges: Vec<(Option<Symbol>, Range<usize>)> = Vec::new();
        let mut start = 0;
        let mut label = None;
        for (idx, code) in codes.iter().enumerate() {
            if let IrCode::Label(l) = code {
                if idx > start {
                    ranges.push((label, start..idx));
                }
                start = idx;
                label = Some(*l);
            }
            if code.is_jump() {
                ranges.push((label.take(), start..idx + 1));
                start = idx + 1;
            }
        }
        if start < codes.len() || ranges.is_empty() {
            ranges.push((label, start..codes.len()));
        }

        let mut by_label: HashMap<Symbol, BlockId> = HashMap::new();
        for (idx, (label, _)) in ranges.iter().enumerate() {
            if let Some(l) = label {
                by_label.insert(*l, BlockId(idx as u32));
            }
        }
        let lookup = |l: Symbol| {
            by_label.get(&l).copied().ok_or_else(|| {
                CodegenError::invariant(format!("jump to undefined label {l}"))
            })
        };

        let count = ranges.len();
        let mut blocks = Vec::with_capacity(count);
        for (idx, (label, range)) in ranges.into_iter().enumerate() {
            let following = (idx + 1 < count).then(|| BlockId(idx as u32 + 1));
            let last = range.end.checked_sub(1).filter(|&i| i >= range.start).map(|i| &codes[i]);
            let (next, taken) = match last {
                Some(IrCode::Jump(target)) => (Some(lookup(*target)?), None),
                Some(IrCode::Return(_)) => (Some(lookup(exit)?), None),
                Some(IrCode::Branch { target, .. }) => (following, Some(lookup(*target)?)),
                _ => (following, None),
            };
            blocks.push(BasicBlock {
                label,
                codes: range,
                next,
                taken,
                reachable: true,
            });
        }
        debug!("formed {} blocks from {} codes", blocks.len(), codes.len());
        Ok(Self { blocks })
    }

    /// Mark blocks with no path from the entry; returns how many.
    pub fn prune_unreachable(&mut self) -> usize {
        for block in &mut self.blocks {
            block.reachable = false;
        }
        let mut work = vec![BlockId(0)];
        while let Some(id) = work.pop() {
            let block = &mut self.blocks[id.index()];
            if block.reachable {
                continue;
            }
            block.reachable = true;
            work.extend(block.successors());
        }
        let pruned = self.blocks.iter().filter(|b| !b.reachable).count();
        if pruned > 0 {
            warn!("pruned {pruned} unreachable blocks");
        }
        pruned
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks still reachable, in layout order.
    pub fn reachable(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(|b| b.reachable)
    }

    pub fn conditional_jumps(&self, codes: &[IrCode]) -> usize {
        self.count_reachable(codes, |c| matches!(c, IrCode::Branch { .. }))
    }

    pub fn unconditional_jumps(&self, codes: &[IrCode]) -> usize {
        self.count_reachable(codes, |c| matches!(c, IrCode::Jump(_) | IrCode::Return(_)))
    }

    fn count_reachable(&self, codes: &[IrCode], pred: impl Fn(&IrCode) -> bool) -> usize {
        self.reachable()
            .flat_map(|b| codes[b.codes.clone()].iter())
            .filter(|c| pred(c))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::LinId;
    use crate::core::symbols::SymbolTable;

    fn labels(n: usize) -> (SymbolTable, Vec<Symbol>) {
        let mut symbols = SymbolTable::new();
        let ls = (0..n).map(|_| symbols.new_label()).collect();
        (symbols, ls)
    }

    fn eval(n: u32) -> IrCode {
        IrCode::Eval(LinId(n))
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let (_, l) = labels(1);
        let codes = vec![IrCode::FrameEnter, eval(0), eval(1), IrCode::FrameExit];
        let cfg = Cfg::build(&codes, l[0]).unwrap();
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg.block(BlockId(0)).next, None);

        let codes = vec![
            IrCode::FrameEnter,
            eval(0),
            IrCode::Label(l[0]),
            IrCode::FrameExit,
        ];
        let cfg = Cfg::build(&codes, l[0]).unwrap();
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.block(BlockId(0)).next, Some(BlockId(1)));
    }

    #[test]
    fn test_branch_records_both_successors() {
        let (_, l) = labels(2);
        let (other, exit) = (l[0], l[1]);
        let codes = vec![
            IrCode::FrameEnter,
            IrCode::Branch {
                cond: LinId(0),
                target: other,
            },
            eval(1),
            IrCode::Label(other),
            eval(2),
            IrCode::Label(exit),
            IrCode::FrameExit,
        ];
        let cfg = Cfg::build(&codes, exit).unwrap();
        assert_eq!(cfg.len(), 4);
        let entry = cfg.block(BlockId(0));
        assert_eq!(entry.codes, 0..2);
        assert_eq!(entry.next, Some(BlockId(1)));
        assert_eq!(entry.taken, Some(BlockId(2)));
        assert_eq!(cfg.block(BlockId(2)).label, Some(other));
    }

    #[test]
    fn test_block_count_bounds() {
        let (_, l) = labels(3);
        let codes = vec![
            IrCode::FrameEnter,
            IrCode::Jump(l[1]),
            IrCode::Label(l[0]),
            eval(0),
            IrCode::Label(l[1]),
            IrCode::Branch {
                cond: LinId(1),
                target: l[0],
            },
            IrCode::Return(None),
            IrCode::Label(l[2]),
            IrCode::FrameExit,
        ];
        let (n, m) = (3, 3);
        let cfg = Cfg::build(&codes, l[2]).unwrap();
        assert!(cfg.len() >= n);
        assert!(cfg.len() <= n + m + 1);
        for block in cfg.blocks() {
            let Range { start, end } = block.codes.clone();
            let starts_ok = start == 0
                || matches!(codes[start], IrCode::Label(_))
                || codes[start - 1].is_jump();
            let ends_ok = codes[end - 1].is_jump()
                || end == codes.len()
                || matches!(codes[end], IrCode::Label(_));
            assert!(starts_ok && ends_ok, "bad block {block:?}");
        }
    }

    #[test]
    fn test_code_after_return_is_pruned() {
        let (_, l) = labels(1);
        let exit = l[0];
        let codes = vec![
            IrCode::FrameEnter,
            IrCode::Return(None),
            eval(0),
            IrCode::Label(exit),
            IrCode::FrameExit,
        ];
        let mut cfg = Cfg::build(&codes, exit).unwrap();
        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.prune_unreachable(), 1);
        assert!(!cfg.block(BlockId(1)).reachable);
        assert_eq!(cfg.reachable().count(), 2);
    }

    #[test]
    fn test_undefined_label_is_an_error() {
        let (_, l) = labels(2);
        let codes = vec![IrCode::Jump(l[0]), IrCode::Label(l[1])];
        assert!(Cfg::build(&codes, l[1]).is_err());
    }
}
