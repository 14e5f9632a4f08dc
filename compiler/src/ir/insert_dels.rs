//! Insert Dels Pass - adds `Del` lifetime markers after the last use of each
//! variable.
//!
//! ## Algorithm
//!
//! 1. Compute upward-exposed uses and definitions per block (a loop-nest
//!    instruction uses everything its bounds, params and body read)
//! 2. Solve backward liveness to a fixpoint
//! 3. In each block, for every variable referenced but not live-out, insert a
//!    `Del` right after its last reference
//! 4. At block entry, insert a `Del` for variables live-out of some
//!    predecessor but neither live-in nor referenced here
//!
//! Variables read by the terminator are never deleted in that block.

use super::optimization::{OptimizationPass, OptimizationResult};
use super::rename::loop_nest_uses;
use super::{IrBlockId, IrControlFlowGraph, IrInstruction, LoopNestArena};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Remove every `Del` marker from a region. Returns how many were removed.
pub fn remove_dels(cfg: &mut IrControlFlowGraph) -> usize {
    let mut removed = 0;
    for block in cfg.blocks.values_mut() {
        let before = block.instructions.len();
        block.instructions.retain(|inst| !inst.is_del());
        removed += before - block.instructions.len();
    }
    removed
}

pub struct InsertDelsPass {
    /// Variables that must outlive the region (never deleted)
    keep: BTreeSet<String>,
}

impl InsertDelsPass {
    pub fn new() -> Self {
        Self {
            keep: BTreeSet::new(),
        }
    }

    pub fn keeping(keep: impl IntoIterator<Item = String>) -> Self {
        Self {
            keep: keep.into_iter().collect(),
        }
    }
}

impl Default for InsertDelsPass {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for InsertDelsPass {
    fn name(&self) -> &'static str {
        "insert-dels"
    }

    fn run_on_region(
        &mut self,
        cfg: &mut IrControlFlowGraph,
        arena: &mut LoopNestArena,
    ) -> OptimizationResult {
        remove_dels(cfg);
        let inserted = insert_dels_for_region(cfg, arena, &self.keep);
        if inserted == 0 {
            return OptimizationResult::unchanged();
        }
        let mut result = OptimizationResult {
            modified: true,
            ..OptimizationResult::default()
        };
        result.stats.insert("del_instructions_inserted".to_string(), inserted);
        result
    }
}

fn instruction_refs(inst: &IrInstruction, arena: &LoopNestArena) -> (Vec<String>, Option<String>) {
    match inst {
        IrInstruction::LoopNest(id) => {
            let mut uses: Vec<String> = arena
                .get(*id)
                .map(|nest| loop_nest_uses(nest, arena).into_iter().collect())
                .unwrap_or_default();
            uses.sort();
            (uses, None)
        }
        other => (
            other.uses().into_iter().map(str::to_string).collect(),
            other.def().map(str::to_string),
        ),
    }
}

struct BlockSummary {
    upward_uses: BTreeSet<String>,
    defs: BTreeSet<String>,
    referenced: BTreeSet<String>,
}

fn summarize(cfg: &IrControlFlowGraph, arena: &LoopNestArena) -> BTreeMap<IrBlockId, BlockSummary> {
    let mut summaries = BTreeMap::new();
    for (id, block) in &cfg.blocks {
        let mut upward_uses = BTreeSet::new();
        let mut defs = BTreeSet::new();
        let mut referenced = BTreeSet::new();
        for inst in &block.instructions {
            let (uses, def) = instruction_refs(inst, arena);
            for u in uses {
                if !defs.contains(&u) {
                    upward_uses.insert(u.clone());
                }
                referenced.insert(u);
            }
            if let Some(d) = def {
                referenced.insert(d.clone());
                defs.insert(d);
            }
        }
        for u in block.terminator.uses() {
            if !defs.contains(u) {
                upward_uses.insert(u.to_string());
            }
            referenced.insert(u.to_string());
        }
        summaries.insert(
            *id,
            BlockSummary {
                upward_uses,
                defs,
                referenced,
            },
        );
    }
    summaries
}

/// Backward liveness: (live_in, live_out) per block.
fn liveness(
    cfg: &IrControlFlowGraph,
    summaries: &BTreeMap<IrBlockId, BlockSummary>,
) -> (HashMap<IrBlockId, BTreeSet<String>>, HashMap<IrBlockId, BTreeSet<String>>) {
    let mut live_in: HashMap<IrBlockId, BTreeSet<String>> =
        cfg.blocks.keys().map(|&id| (id, BTreeSet::new())).collect();
    let mut live_out = live_in.clone();

    let mut changed = true;
    while changed {
        changed = false;
        for (id, block) in cfg.blocks.iter().rev() {
            let mut out = BTreeSet::new();
            for succ in block.successors() {
                if let Some(succ_in) = live_in.get(&succ) {
                    out.extend(succ_in.iter().cloned());
                }
            }
            let summary = &summaries[id];
            let mut inn = summary.upward_uses.clone();
            inn.extend(out.difference(&summary.defs).cloned());

            if live_in[id] != inn || live_out[id] != out {
                changed = true;
                live_in.insert(*id, inn);
                live_out.insert(*id, out);
            }
        }
    }
    (live_in, live_out)
}

fn insert_dels_for_region(
    cfg: &mut IrControlFlowGraph,
    arena: &LoopNestArena,
    keep: &BTreeSet<String>,
) -> usize {
    let summaries = summarize(cfg, arena);
    let (live_in, live_out) = liveness(cfg, &summaries);
    let preds = cfg.predecessors();
    let mut inserted = 0;

    let ids: Vec<IrBlockId> = cfg.blocks.keys().copied().collect();
    for id in ids {
        let summary = &summaries[&id];
        let out = &live_out[&id];

        // Dead on entry: live out of a predecessor, not needed here
        let mut entry_dead = BTreeSet::new();
        for pred in preds.get(&id).into_iter().flatten() {
            for var in &live_out[pred] {
                if !live_in[&id].contains(var) && !summary.referenced.contains(var) && !keep.contains(var) {
                    entry_dead.insert(var.clone());
                }
            }
        }

        let Some(block) = cfg.get_block_mut(id) else { continue };
        let terminator_uses: BTreeSet<String> =
            block.terminator.uses().into_iter().map(str::to_string).collect();

        // Last reference position of each variable that dies in this block
        let mut last_ref: BTreeMap<String, usize> = BTreeMap::new();
        for (pos, inst) in block.instructions.iter().enumerate() {
            let (uses, def) = instruction_refs(inst, arena);
            for var in uses.into_iter().chain(def) {
                last_ref.insert(var, pos);
            }
        }
        let mut dels_after: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (var, pos) in last_ref {
            if out.contains(&var) || keep.contains(&var) || terminator_uses.contains(&var) {
                continue;
            }
            dels_after.entry(pos).or_default().push(var);
        }

        let old = std::mem::take(&mut block.instructions);
        let mut new_insts = Vec::with_capacity(old.len() + dels_after.len() + entry_dead.len());
        for var in entry_dead {
            new_insts.push(IrInstruction::Del { var });
            inserted += 1;
        }
        for (pos, inst) in old.into_iter().enumerate() {
            new_insts.push(inst);
            if let Some(vars) = dels_after.remove(&pos) {
                for var in vars {
                    new_insts.push(IrInstruction::Del { var });
                    inserted += 1;
                }
            }
        }
        block.instructions = new_insts;
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrExpr, IrTerminator, IrValue};

    #[test]
    fn test_del_after_last_use() {
        let mut cfg = IrControlFlowGraph::new();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(IrInstruction::assign("x", IrExpr::Const(IrValue::Int(1))));
        block.add_instruction(IrInstruction::assign("y", IrExpr::Var("x".into())));
        block.add_instruction(IrInstruction::set_item("a", vec!["y".into()], "y"));
        block.set_terminator(IrTerminator::Return { value: None });

        let mut arena = LoopNestArena::new();
        let mut pass = InsertDelsPass::keeping(["a".to_string()]);
        let result = pass.run_on_region(&mut cfg, &mut arena);
        assert!(result.modified);

        let insts = &cfg.get_block(IrBlockId(0)).unwrap().instructions;
        assert_eq!(insts[2], IrInstruction::Del { var: "x".into() });
        assert_eq!(insts[4], IrInstruction::Del { var: "y".into() });
        assert!(!insts.contains(&IrInstruction::Del { var: "a".into() }));
    }

    #[test]
    fn test_loop_carried_value_not_deleted_in_loop() {
        // bb0: i = 0 -> bb1: c = i < n ; branch bb2, bb3
        // bb2: i = i + one -> bb1 ; bb3: return
        let mut cfg = IrControlFlowGraph::new();
        let header = cfg.create_block();
        let latch = cfg.create_block();
        let exit = cfg.create_block();
        let b0 = cfg.get_block_mut(IrBlockId(0)).unwrap();
        b0.add_instruction(IrInstruction::assign("i", IrExpr::Const(IrValue::Int(0))));
        b0.set_terminator(IrTerminator::Jump { target: header });
        let b1 = cfg.get_block_mut(header).unwrap();
        b1.add_instruction(IrInstruction::assign(
            "c",
            IrExpr::Cmp {
                op: crate::ir::CompareOp::Lt,
                lhs: "i".into(),
                rhs: "n".into(),
            },
        ));
        b1.set_terminator(IrTerminator::Branch {
            condition: "c".into(),
            true_target: latch,
            false_target: exit,
        });
        let b2 = cfg.get_block_mut(latch).unwrap();
        b2.add_instruction(IrInstruction::assign(
            "i",
            IrExpr::BinOp {
                op: crate::ir::BinaryOp::Add,
                lhs: "i".into(),
                rhs: "one".into(),
            },
        ));
        b2.set_terminator(IrTerminator::Jump { target: header });
        cfg.get_block_mut(exit)
            .unwrap()
            .set_terminator(IrTerminator::Return { value: None });

        let mut arena = LoopNestArena::new();
        InsertDelsPass::new().run_on_region(&mut cfg, &mut arena);

        let latch_insts = &cfg.get_block(latch).unwrap().instructions;
        assert!(!latch_insts.iter().any(|i| *i == IrInstruction::Del { var: "i".into() }));
        // i, n and one die on the exit edge
        let exit_insts = &cfg.get_block(exit).unwrap().instructions;
        assert!(exit_insts.contains(&IrInstruction::Del { var: "i".into() }));
        assert!(exit_insts.contains(&IrInstruction::Del { var: "n".into() }));
    }

    #[test]
    fn test_remove_dels() {
        let mut cfg = IrControlFlowGraph::new();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(IrInstruction::Del { var: "x".into() });
        block.set_terminator(IrTerminator::RegionExit);
        assert_eq!(remove_dels(&mut cfg), 1);
        assert!(cfg.get_block(IrBlockId(0)).unwrap().instructions.is_empty());
    }
}
