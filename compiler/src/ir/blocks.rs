//! IR Basic Blocks
//!
//! This module defines labeled basic blocks and the control flow graph that
//! owns them. Labels are plain integers so whole graphs can be offset and
//! renumbered when a loop body is spliced into a kernel stub.

use super::{IrInstruction, IrSourceLocation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Unique identifier (label) for basic blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IrBlockId(pub u32);

impl IrBlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn offset(self, by: u32) -> Self {
        Self(self.0 + by)
    }
}

impl std::fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Terminator instructions that end a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrTerminator {
    /// Unconditional jump
    Jump { target: IrBlockId },

    /// Conditional branch on a bool variable
    Branch {
        condition: String,
        true_target: IrBlockId,
        false_target: IrBlockId,
    },

    /// Return from function
    Return { value: Option<String> },

    /// Leave the enclosing loop-nest body region
    RegionExit,

    /// Not terminated yet
    Unreachable,
}

impl IrTerminator {
    pub fn uses(&self) -> Vec<&str> {
        match self {
            IrTerminator::Branch { condition, .. } => vec![condition.as_str()],
            IrTerminator::Return { value: Some(v) } => vec![v.as_str()],
            _ => Vec::new(),
        }
    }

    fn remap_targets(&mut self, map: &impl Fn(IrBlockId) -> IrBlockId) {
        match self {
            IrTerminator::Jump { target } => *target = map(*target),
            IrTerminator::Branch {
                true_target,
                false_target,
                ..
            } => {
                *true_target = map(*true_target);
                *false_target = map(*false_target);
            }
            _ => {}
        }
    }

    pub(crate) fn rename_vars(&mut self, map: &HashMap<String, String>) {
        let name = match self {
            IrTerminator::Branch { condition, .. } => condition,
            IrTerminator::Return { value: Some(v) } => v,
            _ => return,
        };
        if let Some(new_name) = map.get(name.as_str()) {
            *name = new_name.clone();
        }
    }
}

/// A basic block in the IR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrBasicBlock {
    pub id: IrBlockId,
    pub instructions: Vec<IrInstruction>,
    pub terminator: IrTerminator,
    pub loc: IrSourceLocation,
}

impl IrBasicBlock {
    pub fn new(id: IrBlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: IrTerminator::Unreachable,
            loc: IrSourceLocation::unknown(),
        }
    }

    pub fn add_instruction(&mut self, inst: IrInstruction) {
        self.instructions.push(inst);
    }

    pub fn set_terminator(&mut self, term: IrTerminator) {
        self.terminator = term;
    }

    pub fn successors(&self) -> Vec<IrBlockId> {
        match &self.terminator {
            IrTerminator::Jump { target } => vec![*target],
            IrTerminator::Branch {
                true_target,
                false_target,
                ..
            } => vec![*true_target, *false_target],
            IrTerminator::Return { .. } | IrTerminator::RegionExit | IrTerminator::Unreachable => {
                Vec::new()
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, IrTerminator::Unreachable)
    }
}

/// Control flow graph: blocks keyed by label in ascending order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IrControlFlowGraph {
    pub blocks: BTreeMap<IrBlockId, IrBasicBlock>,
}

impl IrControlFlowGraph {
    /// Create a CFG holding a single empty block labeled 0.
    pub fn new() -> Self {
        let mut cfg = Self::default();
        cfg.blocks.insert(IrBlockId(0), IrBasicBlock::new(IrBlockId(0)));
        cfg
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Entry block: the lowest label.
    pub fn entry_block(&self) -> Option<IrBlockId> {
        self.blocks.keys().next().copied()
    }

    pub fn max_label(&self) -> Option<IrBlockId> {
        self.blocks.keys().next_back().copied()
    }

    /// Create a new empty block labeled one past the current maximum.
    pub fn create_block(&mut self) -> IrBlockId {
        let id = self
            .max_label()
            .map(|l| IrBlockId(l.0 + 1))
            .unwrap_or(IrBlockId(0));
        self.blocks.insert(id, IrBasicBlock::new(id));
        id
    }

    pub fn get_block(&self, id: IrBlockId) -> Option<&IrBasicBlock> {
        self.blocks.get(&id)
    }

    pub fn get_block_mut(&mut self, id: IrBlockId) -> Option<&mut IrBasicBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn insert_block(&mut self, block: IrBasicBlock) {
        self.blocks.insert(block.id, block);
    }

    /// Blocks whose terminator leaves the region.
    pub fn region_exits(&self) -> Vec<IrBlockId> {
        self.blocks
            .values()
            .filter(|b| matches!(b.terminator, IrTerminator::RegionExit))
            .map(|b| b.id)
            .collect()
    }

    /// Predecessor lists for every block.
    pub fn predecessors(&self) -> HashMap<IrBlockId, Vec<IrBlockId>> {
        let mut preds: HashMap<IrBlockId, Vec<IrBlockId>> =
            self.blocks.keys().map(|&id| (id, Vec::new())).collect();
        for block in self.blocks.values() {
            for succ in block.successors() {
                preds.entry(succ).or_default().push(block.id);
            }
        }
        preds
    }

    /// Add `offset` to every label, including jump and branch targets.
    pub fn add_offset_to_labels(self, offset: u32) -> Self {
        let blocks = self
            .blocks
            .into_values()
            .map(|mut block| {
                block.id = block.id.offset(offset);
                block.terminator.remap_targets(&|t| t.offset(offset));
                (block.id, block)
            })
            .collect();
        Self { blocks }
    }

    /// Renumber labels densely from 0 in reverse post-order from the entry.
    ///
    /// Blocks unreachable from the entry keep their relative order after
    /// every reachable block.
    pub fn rename_labels(self) -> Self {
        let order = self.reverse_post_order();
        let mut mapping: HashMap<IrBlockId, IrBlockId> = HashMap::new();
        for (new, old) in order.iter().enumerate() {
            mapping.insert(*old, IrBlockId(new as u32));
        }
        let mut next = order.len() as u32;
        for &old in self.blocks.keys() {
            mapping.entry(old).or_insert_with(|| {
                let id = IrBlockId(next);
                next += 1;
                id
            });
        }

        let blocks = self
            .blocks
            .into_values()
            .map(|mut block| {
                block.id = mapping[&block.id];
                block
                    .terminator
                    .remap_targets(&|t| mapping.get(&t).copied().unwrap_or(t));
                (block.id, block)
            })
            .collect();
        Self { blocks }
    }

    fn reverse_post_order(&self) -> Vec<IrBlockId> {
        let Some(entry) = self.entry_block() else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut post_order = Vec::new();
        // Iterative DFS: (block, next successor index)
        let mut stack: Vec<(IrBlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry);
        while let Some((id, idx)) = stack.pop() {
            let succs = self
                .blocks
                .get(&id)
                .map(|b| b.successors())
                .unwrap_or_default();
            if idx < succs.len() {
                stack.push((id, idx + 1));
                let succ = succs[idx];
                if self.blocks.contains_key(&succ) && visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                post_order.push(id);
            }
        }
        post_order.reverse();
        post_order
    }

    /// Rename variables in every instruction and terminator.
    pub fn rename_vars(&mut self, map: &HashMap<String, String>) {
        for block in self.blocks.values_mut() {
            for inst in &mut block.instructions {
                inst.rename_vars(map);
            }
            block.terminator.rename_vars(map);
        }
    }

    /// Verify CFG integrity
    pub fn verify(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err("CFG has no blocks".to_string());
        }
        for (id, block) in &self.blocks {
            if block.id != *id {
                return Err(format!("Block {} is stored under label {}", block.id, id));
            }
            if !block.is_terminated() {
                return Err(format!("Block {} is not properly terminated", id));
            }
            for succ in block.successors() {
                if !self.blocks.contains_key(&succ) {
                    return Err(format!(
                        "Block {} references non-existent successor {}",
                        id, succ
                    ));
                }
            }
        }
        Ok(())
    }
}
