//! Loop-nest nodes
//!
//! A loop nest is the data-parallel construct discovered by upstream analysis.
//! Nodes are stored in a per-function arena and referenced from block
//! instructions by [`LoopNestId`], so a function snapshot is a flat copy of
//! its blocks plus the arena vector rather than a walk over nested pointers.

use super::{IrControlFlowGraph, IrInstruction, IrSourceLocation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Index of a loop nest inside its function's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoopNestId(pub u32);

impl fmt::Display for LoopNestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop{}", self.0)
    }
}

/// A loop bound: either a named variable or a literal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopBound {
    Const(i64),
    Var(String),
}

impl LoopBound {
    pub fn var(name: impl Into<String>) -> Self {
        LoopBound::Var(name.into())
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            LoopBound::Var(name) => Some(name),
            LoopBound::Const(_) => None,
        }
    }
}

impl fmt::Display for LoopBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopBound::Const(c) => write!(f, "{}", c),
            LoopBound::Var(v) => write!(f, "{}", v),
        }
    }
}

/// One dimension of a loop nest: `for index in range(start, stop, step)`.
///
/// `stop` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDim {
    pub index_variable: String,
    pub start: LoopBound,
    pub stop: LoopBound,
    pub step: LoopBound,
}

impl LoopDim {
    pub fn new(index_variable: impl Into<String>, start: LoopBound, stop: LoopBound) -> Self {
        Self {
            index_variable: index_variable.into(),
            start,
            stop,
            step: LoopBound::Const(1),
        }
    }

    pub fn with_step(mut self, step: LoopBound) -> Self {
        self.step = step;
        self
    }

    /// Variables referenced by the bounds of this dimension.
    pub fn bound_vars(&self) -> impl Iterator<Item = &str> {
        [&self.start, &self.stop, &self.step]
            .into_iter()
            .filter_map(LoopBound::as_var)
    }
}

/// Data-parallel loop nest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNest {
    pub id: LoopNestId,

    /// Dimensions, outermost first
    pub dims: Vec<LoopDim>,

    /// Instructions run once before the loop (lowered in the host function)
    pub init_block: Vec<IrInstruction>,

    /// Body region; own label namespace, entry is the lowest label and the
    /// exit block ends in `RegionExit`
    pub body: IrControlFlowGraph,

    /// Loop-carried variables defined outside the body
    pub params: BTreeSet<String>,

    /// Variables written concurrently by several work-items
    pub races: BTreeSet<String>,

    /// Reduction variables detected upstream
    pub reductions: Vec<String>,

    /// Shape-rank classes per array variable
    pub shape_classes: BTreeMap<String, Vec<i64>>,

    /// Whether upstream alias analysis found potential aliasing among params
    pub has_aliases: bool,

    pub loc: IrSourceLocation,
}

impl LoopNest {
    pub fn new(dims: Vec<LoopDim>, body: IrControlFlowGraph) -> Self {
        Self {
            id: LoopNestId(u32::MAX),
            dims,
            init_block: Vec::new(),
            body,
            params: BTreeSet::new(),
            races: BTreeSet::new(),
            reductions: Vec::new(),
            shape_classes: BTreeMap::new(),
            has_aliases: false,
            loc: IrSourceLocation::unknown(),
        }
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn index_variables(&self) -> Vec<&str> {
        self.dims.iter().map(|d| d.index_variable.as_str()).collect()
    }

    /// Every variable referenced by any dimension bound.
    pub fn bound_vars(&self) -> BTreeSet<String> {
        self.dims
            .iter()
            .flat_map(|d| d.bound_vars())
            .map(str::to_string)
            .collect()
    }
}

/// Arena owning every loop nest of a function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopNestArena {
    nests: Vec<LoopNest>,
}

impl LoopNestArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a loop nest and assign its id.
    pub fn alloc(&mut self, mut nest: LoopNest) -> LoopNestId {
        let id = LoopNestId(self.nests.len() as u32);
        nest.id = id;
        self.nests.push(nest);
        id
    }

    pub fn get(&self, id: LoopNestId) -> Option<&LoopNest> {
        self.nests.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: LoopNestId) -> Option<&mut LoopNest> {
        self.nests.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.nests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopNest> {
        self.nests.iter()
    }

    /// Copy `region` (which references nests in `source`) into this arena.
    ///
    /// Every loop nest reachable from the region, including nests nested in
    /// other nests, is cloned into `self` under a fresh id and the returned
    /// region refers to the new ids. `source` is left untouched.
    pub fn import_region(
        &mut self,
        source: &LoopNestArena,
        region: &IrControlFlowGraph,
    ) -> Result<IrControlFlowGraph, String> {
        let mut copy = region.clone();
        for block in copy.blocks.values_mut() {
            self.import_instructions(source, &mut block.instructions)?;
        }
        Ok(copy)
    }

    fn import_instructions(
        &mut self,
        source: &LoopNestArena,
        instructions: &mut [IrInstruction],
    ) -> Result<(), String> {
        for inst in instructions.iter_mut() {
            if let IrInstruction::LoopNest(old_id) = inst {
                let nested = source
                    .get(*old_id)
                    .ok_or_else(|| format!("Unknown loop nest {}", old_id))?;
                let mut cloned = nested.clone();
                cloned.body = self.import_region(source, &nested.body)?;
                self.import_instructions(source, &mut cloned.init_block)?;
                *old_id = self.alloc(cloned);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBlockId, IrTerminator};

    fn region_with(inst: Option<IrInstruction>) -> IrControlFlowGraph {
        let mut cfg = IrControlFlowGraph::new();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        if let Some(inst) = inst {
            block.add_instruction(inst);
        }
        block.set_terminator(IrTerminator::RegionExit);
        cfg
    }

    #[test]
    fn test_bound_vars() {
        let nest = LoopNest::new(
            vec![
                LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n")),
                LoopDim::new("j", LoopBound::var("lo"), LoopBound::var("n")),
            ],
            region_with(None),
        );
        let vars: Vec<_> = nest.bound_vars().into_iter().collect();
        assert_eq!(vars, vec!["lo".to_string(), "n".to_string()]);
    }

    #[test]
    fn test_import_region_rehomes_nested_nests() {
        let mut source = LoopNestArena::new();
        let inner = source.alloc(LoopNest::new(
            vec![LoopDim::new("j", LoopBound::Const(0), LoopBound::Const(4))],
            region_with(None),
        ));
        let outer_body = region_with(Some(IrInstruction::LoopNest(inner)));
        let outer = source.alloc(LoopNest::new(
            vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::Const(4))],
            outer_body.clone(),
        ));

        let mut dest = LoopNestArena::new();
        let region = source.get(outer).unwrap().body.clone();
        let imported = dest.import_region(&source, &region).unwrap();

        assert_eq!(dest.len(), 1);
        let block = imported.get_block(IrBlockId(0)).unwrap();
        assert_eq!(block.instructions, vec![IrInstruction::LoopNest(LoopNestId(0))]);
        // source untouched
        assert_eq!(source.get(outer).unwrap().body, outer_body);
    }
}
