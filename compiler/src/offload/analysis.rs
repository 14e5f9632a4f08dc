//! Loop-nest checks and parameter classification

use crate::error::UnsupportedConstruct;
use crate::ir::{IrControlFlowGraph, IrInstruction, LoopBound, LoopNest, LoopNestArena};
use std::collections::BTreeSet;

/// Reject loop nests the device path cannot lower.
///
/// Runs before any outlining work so unsupported nests never reach the
/// outliner or the backend.
///
/// Only constant steps can be checked here. A step held in a variable is
/// resolved by the launch sequence, which fails with
/// `ExecError::NonUnitStep` before enqueueing if the value is not 1; the
/// kernel is already compiled at that point and the queue is released.
pub fn check_supported(nest: &LoopNest) -> Result<(), UnsupportedConstruct> {
    if !nest.reductions.is_empty() {
        return Err(UnsupportedConstruct::ReductionLoopNest {
            reductions: nest.reductions.clone(),
        });
    }
    if nest.dims.is_empty() {
        return Err(UnsupportedConstruct::ZeroDimensionalLoopNest);
    }
    for dim in &nest.dims {
        if let LoopBound::Const(step) = dim.step {
            if step != 1 {
                return Err(UnsupportedConstruct::NonUnitStep {
                    index_variable: dim.index_variable.clone(),
                    step: step.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Arrays stored into anywhere in `cfg`, including nested loop nests.
pub fn setitem_targets(cfg: &IrControlFlowGraph, arena: &LoopNestArena) -> BTreeSet<String> {
    let mut targets = BTreeSet::new();
    collect_targets(cfg, arena, &mut targets);
    targets
}

fn collect_targets(cfg: &IrControlFlowGraph, arena: &LoopNestArena, targets: &mut BTreeSet<String>) {
    for block in cfg.blocks.values() {
        collect_instruction_targets(&block.instructions, arena, targets);
    }
}

fn collect_instruction_targets(
    instructions: &[IrInstruction],
    arena: &LoopNestArena,
    targets: &mut BTreeSet<String>,
) {
    for inst in instructions {
        match inst {
            IrInstruction::SetItem { target, .. } => {
                targets.insert(target.clone());
            }
            IrInstruction::LoopNest(id) => {
                if let Some(nest) = arena.get(*id) {
                    collect_instruction_targets(&nest.init_block, arena, targets);
                    collect_targets(&nest.body, arena, targets);
                }
            }
            _ => {}
        }
    }
}

/// Kernel parameters split into inputs and outputs, each sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamClassification {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl ParamClassification {
    /// Parameters in kernel order: inputs then outputs.
    pub fn ordered(&self) -> Vec<String> {
        self.inputs.iter().chain(self.outputs.iter()).cloned().collect()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
}

/// Every variable the kernel needs from the host: loop-carried params, race
/// variables and variables referenced by dimension bounds.
pub fn kernel_params(nest: &LoopNest) -> BTreeSet<String> {
    let mut params = nest.params.clone();
    params.extend(nest.races.iter().cloned());
    params.extend(nest.bound_vars());
    params
}

/// Split `params` into outputs (arrays the body stores into) and inputs.
pub fn classify_params(
    params: &BTreeSet<String>,
    body: &IrControlFlowGraph,
    arena: &LoopNestArena,
) -> ParamClassification {
    let stored = setitem_targets(body, arena);
    let (outputs, inputs): (Vec<String>, Vec<String>) =
        params.iter().cloned().partition(|p| stored.contains(p));
    ParamClassification { inputs, outputs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBlockId, IrTerminator, LoopDim};

    fn nest_with(dims: Vec<LoopDim>) -> LoopNest {
        let mut body = IrControlFlowGraph::new();
        let block = body.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(IrInstruction::set_item("out", vec!["i".into()], "v"));
        block.set_terminator(IrTerminator::RegionExit);
        LoopNest::new(dims, body)
    }

    #[test]
    fn test_reductions_are_rejected_first() {
        let mut nest = nest_with(vec![]);
        nest.reductions = vec!["acc".into()];
        assert!(matches!(
            check_supported(&nest),
            Err(UnsupportedConstruct::ReductionLoopNest { .. })
        ));
        nest.reductions.clear();
        assert_eq!(
            check_supported(&nest),
            Err(UnsupportedConstruct::ZeroDimensionalLoopNest)
        );
    }

    #[test]
    fn test_non_unit_step_is_rejected() {
        let nest = nest_with(vec![
            LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n")).with_step(LoopBound::Const(2))
        ]);
        assert!(matches!(
            check_supported(&nest),
            Err(UnsupportedConstruct::NonUnitStep { .. })
        ));

        // Variable steps are left to the launch
        let nest = nest_with(vec![
            LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n")).with_step(LoopBound::var("s"))
        ]);
        assert_eq!(check_supported(&nest), Ok(()));
    }

    #[test]
    fn test_classification_orders_inputs_then_outputs() {
        let mut nest = nest_with(vec![LoopDim::new("i", LoopBound::var("lo"), LoopBound::var("n"))]);
        nest.params = ["out", "b", "a"].iter().map(|s| s.to_string()).collect();
        let params = kernel_params(&nest);
        let classes = classify_params(&params, &nest.body, &LoopNestArena::new());

        assert_eq!(classes.inputs, vec!["a", "b", "lo", "n"]);
        assert_eq!(classes.outputs, vec!["out"]);
        assert_eq!(classes.ordered().last().map(String::as_str), Some("out"));
        assert_eq!(classes.num_inputs(), 4);
    }
}
