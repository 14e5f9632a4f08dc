//! IR Optimization Framework
//!
//! Passes run on a single region (a function body or a kernel body) together
//! with the loop-nest arena the region refers to.

use super::rename::region_uses;
use super::{IrControlFlowGraph, IrInstruction, LoopNestArena};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Trait for optimization passes
pub trait OptimizationPass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a region
    fn run_on_region(
        &mut self,
        cfg: &mut IrControlFlowGraph,
        arena: &mut LoopNestArena,
    ) -> OptimizationResult;
}

/// Result of an optimization pass
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Number of instructions eliminated
    pub instructions_eliminated: usize,

    /// Number of blocks eliminated
    pub blocks_eliminated: usize,

    /// Other statistics
    pub stats: HashMap<String, usize>,
}

impl OptimizationResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.instructions_eliminated += other.instructions_eliminated;
        self.blocks_eliminated += other.blocks_eliminated;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self
    }
}

/// Dead code elimination with a set of always-live roots.
///
/// Removes assignments whose target is never read (iterating to a fixpoint),
/// blocks unreachable from the entry, and `Del` markers of variables that no
/// longer appear anywhere in the region.
pub struct DeadCodeEliminationPass {
    roots: BTreeSet<String>,
}

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self {
            roots: BTreeSet::new(),
        }
    }

    pub fn with_roots(roots: impl IntoIterator<Item = String>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    fn eliminate_unreachable_blocks(&self, cfg: &mut IrControlFlowGraph) -> usize {
        let Some(entry) = cfg.entry_block() else {
            return 0;
        };
        let mut reachable = HashSet::new();
        let mut worklist = vec![entry];
        while let Some(id) = worklist.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(block) = cfg.get_block(id) {
                worklist.extend(block.successors());
            }
        }
        let before = cfg.blocks.len();
        cfg.blocks.retain(|id, _| reachable.contains(id));
        before - cfg.blocks.len()
    }

    fn eliminate_dead_instructions(&self, cfg: &mut IrControlFlowGraph, arena: &LoopNestArena) -> usize {
        let mut eliminated = 0;
        loop {
            let mut used = region_uses(cfg, arena);
            used.extend(self.roots.iter().cloned());

            let mut removed = 0;
            for block in cfg.blocks.values_mut() {
                let original_len = block.instructions.len();
                block.instructions.retain(|inst| match inst.def() {
                    Some(dest) => used.contains(dest) || inst.has_side_effects(),
                    None => true,
                });
                removed += original_len - block.instructions.len();
            }
            eliminated += removed;
            if removed == 0 {
                break;
            }
        }
        eliminated
    }

    fn eliminate_orphan_dels(&self, cfg: &mut IrControlFlowGraph, arena: &LoopNestArena) -> usize {
        let mut live = region_uses(cfg, arena);
        for block in cfg.blocks.values() {
            live.extend(block.instructions.iter().filter_map(|i| i.def()).map(str::to_string));
        }
        let mut eliminated = 0;
        for block in cfg.blocks.values_mut() {
            let original_len = block.instructions.len();
            block.instructions.retain(|inst| match inst {
                IrInstruction::Del { var } => live.contains(var) || self.roots.contains(var),
                _ => true,
            });
            eliminated += original_len - block.instructions.len();
        }
        eliminated
    }
}

impl Default for DeadCodeEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run_on_region(
        &mut self,
        cfg: &mut IrControlFlowGraph,
        arena: &mut LoopNestArena,
    ) -> OptimizationResult {
        let blocks = self.eliminate_unreachable_blocks(cfg);
        let instructions =
            self.eliminate_dead_instructions(cfg, arena) + self.eliminate_orphan_dels(cfg, arena);
        OptimizationResult {
            modified: blocks + instructions > 0,
            instructions_eliminated: instructions,
            blocks_eliminated: blocks,
            stats: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBlockId, IrExpr, IrTerminator, IrValue};

    #[test]
    fn test_dead_code_elimination() {
        let mut cfg = IrControlFlowGraph::new();
        let orphan = cfg.create_block();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(IrInstruction::assign("dead", IrExpr::Const(IrValue::Int(1))));
        block.add_instruction(IrInstruction::assign("chain", IrExpr::Var("dead".into())));
        block.add_instruction(IrInstruction::Del { var: "chain".into() });
        block.add_instruction(IrInstruction::assign("r", IrExpr::Const(IrValue::Int(2))));
        block.set_terminator(IrTerminator::Return {
            value: Some("r".into()),
        });
        cfg.get_block_mut(orphan)
            .unwrap()
            .set_terminator(IrTerminator::Return { value: None });

        let mut arena = LoopNestArena::new();
        let mut pass = DeadCodeEliminationPass::new();
        let result = pass.run_on_region(&mut cfg, &mut arena);

        assert!(result.modified);
        assert_eq!(result.blocks_eliminated, 1);
        assert_eq!(result.instructions_eliminated, 3);
        assert_eq!(cfg.get_block(IrBlockId(0)).unwrap().instructions.len(), 1);
    }

    #[test]
    fn test_roots_are_kept() {
        let mut cfg = IrControlFlowGraph::new();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(IrInstruction::assign("p", IrExpr::Const(IrValue::Int(1))));
        block.set_terminator(IrTerminator::Return { value: None });

        let mut arena = LoopNestArena::new();
        let mut pass = DeadCodeEliminationPass::with_roots(["p".to_string()]);
        let result = pass.run_on_region(&mut cfg, &mut arena);
        assert!(!result.modified);
    }
}
