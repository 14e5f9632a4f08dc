//! IR Functions
//!
//! This module defines the function body (`IrFunction`), the descriptor that
//! carries typing information about it (`FunctionDescriptor`), and the
//! snapshot used to roll a function back after a failed lowering attempt.

use super::{IrControlFlowGraph, IrInstruction, IrSourceLocation, IrType, LoopNestArena, TypeMap};
use serde::{Deserialize, Serialize};

/// Function body: control flow graph plus the loop nests it references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrFunction {
    /// Function name
    pub name: String,

    /// Argument names, bound on entry in this order
    pub arg_names: Vec<String>,

    /// Control flow graph (function body)
    pub cfg: IrControlFlowGraph,

    /// Every loop nest referenced from `cfg` (and from nested bodies)
    pub loop_nests: LoopNestArena,

    pub loc: IrSourceLocation,
}

impl IrFunction {
    pub fn new(name: impl Into<String>, arg_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            arg_names,
            cfg: IrControlFlowGraph::new(),
            loop_nests: LoopNestArena::new(),
            loc: IrSourceLocation::unknown(),
        }
    }

    /// Verify CFG integrity, loop-nest references and region shapes.
    pub fn verify(&self) -> Result<(), String> {
        self.cfg.verify()?;
        if !self.cfg.region_exits().is_empty() {
            return Err(format!(
                "Function {} has a region exit outside of a loop nest body",
                self.name
            ));
        }
        self.verify_instructions(self.cfg.blocks.values().flat_map(|b| b.instructions.iter()))?;

        for nest in self.loop_nests.iter() {
            nest.body.verify()?;
            let exits = nest.body.region_exits();
            if exits.len() != 1 {
                return Err(format!(
                    "Loop nest {} body must have exactly one exit block, found {}",
                    nest.id,
                    exits.len()
                ));
            }
            self.verify_instructions(nest.init_block.iter())?;
            self.verify_instructions(
                nest.body.blocks.values().flat_map(|b| b.instructions.iter()),
            )?;
        }
        Ok(())
    }

    fn verify_instructions<'a>(
        &self,
        instructions: impl Iterator<Item = &'a IrInstruction>,
    ) -> Result<(), String> {
        for inst in instructions {
            if let IrInstruction::LoopNest(id) = inst {
                if self.loop_nests.get(*id).is_none() {
                    return Err(format!("{} references unknown loop nest {}", self.name, id));
                }
            }
        }
        Ok(())
    }
}

/// Typing information about a function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,

    /// Fully qualified name for diagnostics
    pub qualified_name: String,

    /// Types of every variable in the function
    pub typemap: TypeMap,

    pub arg_types: Vec<IrType>,

    pub return_type: IrType,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, typemap: TypeMap) -> Self {
        let name = name.into();
        Self {
            qualified_name: name.clone(),
            name,
            typemap,
            arg_types: Vec::new(),
            return_type: IrType::None,
        }
    }
}

/// Pristine copy of a function taken before a speculative lowering attempt.
///
/// Both halves are owned copies; compiled artifacts are never part of the IR,
/// so nothing shared is duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSnapshot {
    descriptor: FunctionDescriptor,
    function: IrFunction,
}

impl FunctionSnapshot {
    pub fn capture(descriptor: &FunctionDescriptor, function: &IrFunction) -> Self {
        Self {
            descriptor: descriptor.clone(),
            function: function.clone(),
        }
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn function(&self) -> &IrFunction {
        &self.function
    }

    /// Overwrite a (possibly partially mutated) function with the snapshot.
    pub fn restore_into(self, descriptor: &mut FunctionDescriptor, function: &mut IrFunction) {
        *descriptor = self.descriptor;
        *function = self.function;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBlockId, IrTerminator, LoopBound, LoopDim, LoopNest, LoopNestId};

    #[test]
    fn test_snapshot_restores_mutations() {
        let mut func = IrFunction::new("f", vec!["a".to_string()]);
        func.cfg
            .get_block_mut(IrBlockId(0))
            .unwrap()
            .set_terminator(IrTerminator::Return { value: None });
        let mut desc = FunctionDescriptor::new("f", TypeMap::new());

        let snapshot = FunctionSnapshot::capture(&desc, &func);
        func.cfg.create_block();
        desc.typemap.insert("x", IrType::f64());

        snapshot.restore_into(&mut desc, &mut func);
        assert_eq!(func.cfg.len(), 1);
        assert!(desc.typemap.is_empty());
    }

    #[test]
    fn test_verify_rejects_dangling_loop_nest() {
        let mut func = IrFunction::new("f", vec![]);
        let entry = func.cfg.get_block_mut(IrBlockId(0)).unwrap();
        entry.add_instruction(IrInstruction::LoopNest(LoopNestId(3)));
        entry.set_terminator(IrTerminator::Return { value: None });
        assert!(func.verify().is_err());
    }

    #[test]
    fn test_verify_requires_single_region_exit() {
        let mut func = IrFunction::new("f", vec![]);
        let mut body = IrControlFlowGraph::new();
        body.get_block_mut(IrBlockId(0))
            .unwrap()
            .set_terminator(IrTerminator::Return { value: None });
        let id = func.loop_nests.alloc(LoopNest::new(
            vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::Const(2))],
            body,
        ));
        let entry = func.cfg.get_block_mut(IrBlockId(0)).unwrap();
        entry.add_instruction(IrInstruction::LoopNest(id));
        entry.set_terminator(IrTerminator::Return { value: None });

        let err = func.verify().unwrap_err();
        assert!(err.contains("exactly one exit"));
    }
}
