use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::decode::{Instruction, JumpKind};
use crate::DsoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BlockKind {
    Root,
    Conditional,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BranchKind {
    Else,
    Continue,
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ControlFlowBranch {
    pub start: u32,
    pub target: u32,
    pub kind: BranchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(usize);

#[derive(Debug, Clone, Serialize)]
pub struct ControlFlowBlock {
    pub kind: BlockKind,
    pub start: u32,
    pub end: u32,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    /// Unconditional jumps owned directly by this block, keyed by address.
    pub branches: BTreeMap<u32, ControlFlowBranch>,
    pub continue_point: Option<u32>,
}

impl ControlFlowBlock {
    fn new(kind: BlockKind, start: u32, end: u32) -> Self {
        Self {
            kind,
            start,
            end,
            parent: None,
            children: Vec::new(),
            branches: BTreeMap::new(),
            continue_point: None,
        }
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// Block arena rooted at [`ControlFlowTree::root`], plus address lookups.
#[derive(Debug, Clone, Serialize)]
pub struct ControlFlowTree {
    blocks: Vec<ControlFlowBlock>,
    blocks_at: BTreeMap<u32, Vec<BlockId>>,
    branches: BTreeMap<u32, ControlFlowBranch>,
}

impl ControlFlowTree {
    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &ControlFlowBlock {
        &self.blocks[id.0]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks starting at `addr`, outermost first.
    pub fn blocks_at(&self, addr: u32) -> &[BlockId] {
        self.blocks_at.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn branch(&self, addr: u32) -> Option<&ControlFlowBranch> {
        self.branches.get(&addr)
    }

    /// Direct child of `parent` that starts at `addr`.
    pub fn child_at(&self, parent: BlockId, addr: u32) -> Option<BlockId> {
        self.blocks_at(addr).iter().copied().find(|&id| self.block(id).parent == Some(parent))
    }

    fn enclosing_loop(&self, id: BlockId) -> Option<BlockId> {
        let mut cur = self.block(id).parent;
        while let Some(p) = cur {
            if self.block(p).kind == BlockKind::Loop {
                return Some(p);
            }
            cur = self.block(p).parent;
        }
        None
    }
}

struct Analyzer<'a> {
    instrs: &'a [Instruction],
    index: HashMap<u32, usize>,
    blocks: Vec<ControlFlowBlock>,
}

impl<'a> Analyzer<'a> {
    fn successor(&self, addr: u32) -> Option<u32> {
        let i = *self.index.get(&addr)?;
        self.instrs.get(i + 1).map(|ins| ins.addr)
    }

    fn seed(&mut self) -> Result<(), DsoError> {
        for (i, ins) in self.instrs.iter().enumerate() {
            let Some((kind, target)) = ins.jump() else { continue };
            let Some(&target_idx) = self.index.get(&target) else {
                return Err(DsoError::BranchTargetMissing { addr: ins.addr, target });
            };
            if !kind.is_conditional() || kind.is_short_circuit() {
                continue;
            }
            if target <= ins.addr {
                self.blocks.push(ControlFlowBlock::new(BlockKind::Loop, target, ins.addr));
            } else {
                // target_idx > i here, so there is an instruction before the target.
                debug_assert!(target_idx > i);
                let before = self.instrs[target_idx - 1].addr;
                self.blocks.push(ControlFlowBlock::new(BlockKind::Conditional, ins.addr, before));
            }
        }
        Ok(())
    }

    fn attach(&mut self, child: usize, parent: usize) {
        self.blocks[child].parent = Some(BlockId(parent));
        self.blocks[parent].children.push(BlockId(child));
    }

    fn nest(&mut self) -> Result<(), DsoError> {
        let mut order: Vec<usize> = (1..self.blocks.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.blocks[a], &self.blocks[b]);
            a.start.cmp(&b.start).then(b.end.cmp(&a.end))
        });
        let mut pending = order.into_iter().peekable();
        let mut open: Vec<usize> = vec![0];

        for ins in self.instrs {
            while open.len() > 1 {
                let top = open[open.len() - 1];
                if self.blocks[top].end >= ins.addr {
                    break;
                }
                open.pop();
                self.attach(top, open[open.len() - 1]);
            }

            while let Some(&next) = pending.peek() {
                if self.blocks[next].start != ins.addr {
                    break;
                }
                let top = open[open.len() - 1];
                if self.blocks[next].end > self.blocks[top].end {
                    return Err(DsoError::OverlappingBlocks {
                        start: self.blocks[next].start,
                        end: self.blocks[next].end,
                        enclosing_end: self.blocks[top].end,
                    });
                }
                open.push(next);
                pending.next();
            }

            if let Some((JumpKind::Always, target)) = ins.jump() {
                let top = open[open.len() - 1];
                self.blocks[top]
                    .branches
                    .insert(ins.addr, ControlFlowBranch { start: ins.addr, target, kind: BranchKind::Else });
            }
        }

        let last = self.instrs.last().map(|ins| ins.addr).unwrap_or(0);
        while open.len() > 1 {
            let top = open[open.len() - 1];
            if self.blocks[top].end > last {
                break;
            }
            open.pop();
            self.attach(top, open[open.len() - 1]);
        }

        if open.len() != 1 || pending.next().is_some() {
            return Err(DsoError::UnbalancedBlocks { open: open.len() });
        }
        Ok(())
    }
}

fn classify(tree: &mut ControlFlowTree, id: BlockId, successors: &HashMap<u32, u32>) {
    let block = tree.block(id);
    let kind = block.kind;
    let end = block.end;
    let parent = block.parent.map(|p| tree.block(p));
    let parent_conditional_end = parent.filter(|p| p.kind == BlockKind::Conditional).map(|p| p.end);
    let owner_loop = if kind == BlockKind::Loop { Some(id) } else { tree.enclosing_loop(id) };
    let addrs: Vec<u32> = block.branches.keys().copied().collect();

    for addr in &addrs {
        let target = tree.blocks[id.0].branches[addr].target;
        let branch_kind = if kind == BlockKind::Loop {
            if target <= end { BranchKind::Continue } else { BranchKind::Break }
        } else if let Some(lp) = owner_loop {
            let loop_exit = successors.get(&tree.block(lp).end).copied();
            if Some(target) == loop_exit {
                BranchKind::Break
            } else if *addr < end {
                BranchKind::Continue
            } else if parent_conditional_end.is_some_and(|pe| target > pe) {
                BranchKind::Continue
            } else {
                BranchKind::Else
            }
        } else {
            BranchKind::Else
        };

        if let Some(b) = tree.blocks[id.0].branches.get_mut(addr) {
            b.kind = branch_kind;
        }
        if branch_kind == BranchKind::Continue {
            if let Some(lp) = owner_loop {
                tree.blocks[lp.0].continue_point.get_or_insert(target);
            }
        }
    }

    // Continue points found above can only be matched once known; jumps the
    // first pass left as Else get one more chance against them.
    if let Some(cp) = owner_loop.and_then(|lp| tree.block(lp).continue_point) {
        for b in tree.blocks[id.0].branches.values_mut() {
            if b.kind == BranchKind::Else && b.target == cp {
                b.kind = BranchKind::Continue;
            }
        }
    }

    let children = tree.block(id).children.clone();
    for child in children {
        classify(tree, child, successors);
    }
}

pub fn analyze(instrs: &[Instruction]) -> Result<ControlFlowTree, DsoError> {
    let index: HashMap<u32, usize> = instrs.iter().enumerate().map(|(i, ins)| (ins.addr, i)).collect();
    let (first, last) = match (instrs.first(), instrs.last()) {
        (Some(f), Some(l)) => (f.addr, l.addr),
        _ => (0, 0),
    };

    let mut a = Analyzer {
        instrs,
        index,
        blocks: vec![ControlFlowBlock::new(BlockKind::Root, first, last)],
    };
    a.seed()?;
    a.nest()?;

    let successors: HashMap<u32, u32> = a
        .blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Loop)
        .filter_map(|b| a.successor(b.end).map(|s| (b.end, s)))
        .collect();

    let mut tree = ControlFlowTree { blocks: a.blocks, blocks_at: BTreeMap::new(), branches: BTreeMap::new() };
    let root = tree.root();
    classify(&mut tree, root, &successors);

    // Pre-order walk keeps outer blocks ahead of inner ones sharing a start.
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let block = tree.block(id);
        let start = block.start;
        let branches: Vec<ControlFlowBranch> = block.branches.values().copied().collect();
        let children = block.children.clone();
        tree.blocks_at.entry(start).or_default().push(id);
        for b in branches {
            tree.branches.insert(b.start, b);
        }
        stack.extend(children.into_iter().rev());
    }

    log::debug!(
        "control flow: {} blocks, {} unconditional branches",
        tree.blocks.len(),
        tree.branches.len()
    );
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::InstructionKind;
    use crate::opcode::Opcode;

    fn ins(addr: u32, size: u32, kind: InstructionKind) -> Instruction {
        let opcode = match &kind {
            InstructionKind::Jump { kind: JumpKind::Always, .. } => Opcode::JMP,
            InstructionKind::Jump { kind: JumpKind::IfNot, .. } => Opcode::JMPIFNOT,
            InstructionKind::Jump { kind: JumpKind::If, .. } => Opcode::JMPIF,
            InstructionKind::Jump { kind: JumpKind::IfNotNp, .. } => Opcode::JMPIFNOT_NP,
            _ => Opcode::BREAK,
        };
        Instruction { addr, size, opcode, kind }
    }

    fn nop(addr: u32) -> Instruction {
        ins(addr, 1, InstructionKind::DebugBreak)
    }

    fn jmp(addr: u32, kind: JumpKind, target: u32) -> Instruction {
        ins(addr, 2, InstructionKind::Jump { kind, target })
    }

    /// Fills `[from, to)` with one word instructions, skipping addresses already taken.
    fn program(mut special: Vec<Instruction>, to: u32) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut addr = 0;
        special.sort_by_key(|i| i.addr);
        let mut special = special.into_iter().peekable();
        while addr < to {
            if special.peek().is_some_and(|s| s.addr == addr) {
                let s = special.next().unwrap();
                addr = s.next_addr();
                out.push(s);
            } else {
                out.push(nop(addr));
                addr += 1;
            }
        }
        out
    }

    #[test]
    fn loop_branch_classification() {
        // Loop [40, 80]; 75 jumps back inside, 60 jumps to the loop exit.
        let p = program(
            vec![
                jmp(60, JumpKind::Always, 84),
                jmp(75, JumpKind::Always, 42),
                jmp(80, JumpKind::If, 40),
            ],
            90,
        );
        assert_eq!(p.iter().find(|i| i.addr == 80).unwrap().next_addr(), 82);
        // make the end successor 84 by widening the back branch
        let p: Vec<Instruction> = p
            .into_iter()
            .filter(|i| !(82..84).contains(&i.addr))
            .map(|mut i| {
                if i.addr == 80 {
                    i.size = 4;
                }
                i
            })
            .collect();

        let tree = analyze(&p).unwrap();
        let root = tree.block(tree.root());
        assert_eq!(root.children.len(), 1);
        let lp = tree.block(root.children[0]);
        assert_eq!((lp.kind, lp.start, lp.end), (BlockKind::Loop, 40, 80));
        assert_eq!(tree.branch(75).unwrap().kind, BranchKind::Continue);
        assert_eq!(tree.branch(60).unwrap().kind, BranchKind::Break);
        assert_eq!(lp.continue_point, Some(42));
    }

    #[test]
    fn if_else_inside_loop() {
        // 10: JMPIFNOT 20, 18: JMP 24 (else), 20..23 else body, 30: JMPIF 5
        let p = program(
            vec![
                jmp(10, JumpKind::IfNot, 20),
                jmp(18, JumpKind::Always, 24),
                jmp(30, JumpKind::If, 5),
            ],
            40,
        );
        let tree = analyze(&p).unwrap();
        let lp = tree.block(tree.block(tree.root()).children[0]);
        assert_eq!(lp.kind, BlockKind::Loop);
        let cond = tree.block(lp.children[0]);
        assert_eq!((cond.kind, cond.start, cond.end), (BlockKind::Conditional, 10, 18));
        assert!(cond.branches.contains_key(&18));
        assert_eq!(tree.branch(18).unwrap().kind, BranchKind::Else);
    }

    #[test]
    fn continue_at_end_of_nested_if() {
        // loop [2, 40]: if (a) { if (b) { ...; continue; } } with continue -> 36
        let p = program(
            vec![
                jmp(5, JumpKind::IfNot, 20),
                jmp(8, JumpKind::IfNot, 14),
                jmp(12, JumpKind::Always, 36),
                jmp(40, JumpKind::If, 2),
            ],
            50,
        );
        let tree = analyze(&p).unwrap();
        assert_eq!(tree.branch(12).unwrap().kind, BranchKind::Continue);
        let lp = tree.block(tree.block(tree.root()).children[0]);
        assert_eq!(lp.continue_point, Some(36));
    }

    #[test]
    fn second_pass_uses_discovered_continue_point() {
        // loop [0, 40]; block at 5 holds a mid-block continue to 30 (first
        // pass) and a trailing jump to 30 that only the second pass catches.
        let p = program(
            vec![
                jmp(5, JumpKind::IfNot, 20),
                jmp(10, JumpKind::Always, 30),
                jmp(18, JumpKind::Always, 30),
                jmp(40, JumpKind::If, 0),
            ],
            50,
        );
        let tree = analyze(&p).unwrap();
        assert_eq!(tree.branch(10).unwrap().kind, BranchKind::Continue);
        assert_eq!(tree.branch(18).unwrap().kind, BranchKind::Continue);
    }

    #[test]
    fn shared_start_nests_outer_first() {
        // do { if (x) {...} } while (...) where the loop body starts with the if.
        let p = program(vec![jmp(0, JumpKind::IfNot, 6), jmp(8, JumpKind::If, 0)], 12);
        let tree = analyze(&p).unwrap();
        let ids = tree.blocks_at(0);
        assert_eq!(ids.len(), 3);
        assert_eq!(tree.block(ids[0]).kind, BlockKind::Root);
        assert_eq!(tree.block(ids[1]).kind, BlockKind::Loop);
        assert_eq!(tree.block(ids[2]).kind, BlockKind::Conditional);
        assert_eq!(tree.block(ids[2]).parent, Some(ids[1]));
    }

    #[test]
    fn short_circuit_branches_make_no_blocks() {
        let p = program(vec![jmp(2, JumpKind::IfNotNp, 6)], 8);
        let tree = analyze(&p).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn missing_branch_target_is_fatal() {
        let p = program(vec![jmp(2, JumpKind::IfNot, 3)], 8);
        assert!(matches!(analyze(&p), Err(DsoError::BranchTargetMissing { addr: 2, target: 3 })));
    }

    #[test]
    fn overlapping_blocks_are_fatal() {
        let p = program(vec![jmp(2, JumpKind::IfNot, 10), jmp(6, JumpKind::IfNot, 14)], 16);
        assert!(matches!(analyze(&p), Err(DsoError::OverlappingBlocks { start: 6, .. })));
    }

    #[test]
    fn empty_stream() {
        let tree = analyze(&[]).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.block(tree.root()).children.is_empty());
    }
}
