//! Function lowering
//!
//! Flattens an [`IrFunction`] into a [`LoweredFunction`]: one label space,
//! no nested regions. Each loop-nest instruction is routed through the
//! [`LoopNestStrategy`] passed to the [`Lowerer`]: the sequential strategy
//! expands it into counted loops, the device strategy replaces it with a
//! kernel launch sequence.

use crate::error::LoweringError;
use crate::ir::{
    FunctionDescriptor, IrBlockId, IrControlFlowGraph, IrExpr, IrFunction, IrInstruction,
    IrTerminator, IrValue, LoopBound, LoopNestId,
};
use crate::offload::launch::LaunchSequence;
use crate::offload::OffloadContext;
use log::{debug, trace};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub type LoweredLabel = u32;

/// Flat instruction of a lowered function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LoweredInst {
    Assign { target: String, value: IrExpr },
    SetItem {
        target: String,
        index: Vec<String>,
        value: String,
    },
    Del { var: String },
    /// Host-side kernel launch replacing a loop nest
    Launch(Box<LaunchSequence>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LoweredTerminator {
    Jump(LoweredLabel),
    Branch {
        condition: String,
        true_target: LoweredLabel,
        false_target: LoweredLabel,
    },
    Return(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoweredBlock {
    pub id: LoweredLabel,
    pub instructions: Vec<LoweredInst>,
    pub terminator: LoweredTerminator,
}

/// Executable form of a function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoweredFunction {
    pub name: String,
    pub arg_names: Vec<String>,
    pub entry: LoweredLabel,
    pub blocks: BTreeMap<LoweredLabel, LoweredBlock>,
}

impl LoweredFunction {
    /// A function whose single block returns immediately.
    pub fn empty(name: impl Into<String>) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            0,
            LoweredBlock {
                id: 0,
                instructions: Vec::new(),
                terminator: LoweredTerminator::Return(None),
            },
        );
        Self {
            name: name.into(),
            arg_names: Vec::new(),
            entry: 0,
            blocks,
        }
    }

    /// Launch sequences in block order.
    pub fn launches(&self) -> impl Iterator<Item = &LaunchSequence> {
        self.blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter_map(|inst| match inst {
                LoweredInst::Launch(seq) => Some(seq.as_ref()),
                _ => None,
            })
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }
}

/// How loop-nest instructions are lowered
pub enum LoopNestStrategy<'a> {
    /// Expand into nested counted loops
    Sequential,

    /// Outline into a device kernel and emit a launch sequence
    Device(&'a mut OffloadContext),
}

impl LoopNestStrategy<'_> {
    pub fn is_device(&self) -> bool {
        matches!(self, LoopNestStrategy::Device(_))
    }
}

/// Lowers one function under a fixed loop-nest strategy
pub struct Lowerer<'a> {
    strategy: LoopNestStrategy<'a>,
    blocks: BTreeMap<LoweredLabel, LoweredBlock>,
    next_label: LoweredLabel,
    next_temp: u64,
}

impl<'a> Lowerer<'a> {
    pub fn new(strategy: LoopNestStrategy<'a>) -> Self {
        Self {
            strategy,
            blocks: BTreeMap::new(),
            next_label: 0,
            next_temp: 0,
        }
    }

    pub fn sequential() -> Self {
        Self::new(LoopNestStrategy::Sequential)
    }

    /// Lower `func`. The device strategy may update loop-nest metadata of
    /// `func` in place; callers that need the original keep a snapshot.
    pub fn lower_function(
        mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
    ) -> Result<LoweredFunction, LoweringError> {
        debug!(
            "Lowering {} ({})",
            desc.qualified_name,
            if self.strategy.is_device() { "device" } else { "sequential" }
        );
        func.verify().map_err(LoweringError::InvalidIr)?;

        let cfg = func.cfg.clone();
        let entry = self.lower_region(desc, func, &cfg, None)?;

        let lowered = LoweredFunction {
            name: func.name.clone(),
            arg_names: func.arg_names.clone(),
            entry,
            blocks: self.blocks,
        };
        trace!("Lowered {}: {} blocks", lowered.name, lowered.blocks.len());
        Ok(lowered)
    }

    fn new_block(&mut self) -> LoweredLabel {
        let id = self.next_label;
        self.next_label += 1;
        self.blocks.insert(
            id,
            LoweredBlock {
                id,
                instructions: Vec::new(),
                terminator: LoweredTerminator::Return(None),
            },
        );
        id
    }

    fn temp(&mut self, base: &str) -> String {
        let id = self.next_temp;
        self.next_temp += 1;
        format!("$lower.{}.{}", base, id)
    }

    fn emit(&mut self, block: LoweredLabel, inst: LoweredInst) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.instructions.push(inst);
        }
    }

    fn terminate(&mut self, block: LoweredLabel, term: LoweredTerminator) {
        if let Some(b) = self.blocks.get_mut(&block) {
            b.terminator = term;
        }
    }

    /// Lower a region; `RegionExit` jumps to `exit_target`. Returns the
    /// label of the region's entry.
    fn lower_region(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        cfg: &IrControlFlowGraph,
        exit_target: Option<LoweredLabel>,
    ) -> Result<LoweredLabel, LoweringError> {
        let entry = cfg
            .entry_block()
            .ok_or_else(|| LoweringError::InvalidIr("empty region".to_string()))?;
        let labels: HashMap<IrBlockId, LoweredLabel> = cfg
            .blocks
            .keys()
            .map(|&id| (id, self.new_block()))
            .collect();
        let map = |id: IrBlockId| {
            labels
                .get(&id)
                .copied()
                .ok_or_else(|| LoweringError::InvalidIr(format!("jump to unknown block {}", id)))
        };

        for (id, block) in &cfg.blocks {
            let mut current = map(*id)?;
            current = self.lower_instructions(desc, func, &block.instructions, current)?;

            let term = match &block.terminator {
                IrTerminator::Jump { target } => LoweredTerminator::Jump(map(*target)?),
                IrTerminator::Branch {
                    condition,
                    true_target,
                    false_target,
                } => LoweredTerminator::Branch {
                    condition: condition.clone(),
                    true_target: map(*true_target)?,
                    false_target: map(*false_target)?,
                },
                IrTerminator::Return { value } => {
                    if exit_target.is_some() {
                        return Err(LoweringError::InvalidIr(format!(
                            "return inside loop nest body at {}",
                            id
                        )));
                    }
                    LoweredTerminator::Return(value.clone())
                }
                IrTerminator::RegionExit => match exit_target {
                    Some(target) => LoweredTerminator::Jump(target),
                    None => {
                        return Err(LoweringError::InvalidIr(format!(
                            "region exit outside of a loop nest at {}",
                            id
                        )))
                    }
                },
                IrTerminator::Unreachable => {
                    return Err(LoweringError::InvalidIr(format!("block {} is not terminated", id)))
                }
            };
            self.terminate(current, term);
        }
        map(entry)
    }

    /// Lower straight-line instructions into `current`; returns the block
    /// where lowering continues (loop nests open new blocks).
    fn lower_instructions(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        instructions: &[IrInstruction],
        mut current: LoweredLabel,
    ) -> Result<LoweredLabel, LoweringError> {
        for inst in instructions {
            match inst {
                IrInstruction::Assign { target, value, .. } => self.emit(
                    current,
                    LoweredInst::Assign {
                        target: target.clone(),
                        value: value.clone(),
                    },
                ),
                IrInstruction::SetItem {
                    target,
                    index,
                    value,
                    ..
                } => self.emit(
                    current,
                    LoweredInst::SetItem {
                        target: target.clone(),
                        index: index.clone(),
                        value: value.clone(),
                    },
                ),
                IrInstruction::Del { var } => self.emit(current, LoweredInst::Del { var: var.clone() }),
                IrInstruction::LoopNest(id) => {
                    current = self.lower_loop_nest(desc, func, *id, current)?;
                }
            }
        }
        Ok(current)
    }

    fn lower_loop_nest(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        id: LoopNestId,
        mut current: LoweredLabel,
    ) -> Result<LoweredLabel, LoweringError> {
        if !matches!(self.strategy, LoopNestStrategy::Device(_)) {
            return self.lower_sequential(desc, func, id, current);
        }

        // The init block stays on the host; bounds and inputs it defines
        // must be bound before the launch resolves them.
        let init_block = func
            .loop_nests
            .get(id)
            .map(|nest| nest.init_block.clone())
            .ok_or_else(|| LoweringError::InvalidIr(format!("unknown loop nest {}", id)))?;
        current = self.lower_instructions(desc, func, &init_block, current)?;

        if let LoopNestStrategy::Device(ctx) = &mut self.strategy {
            let launch = ctx.lower_loop_nest_to_device(desc, func, id)?;
            self.emit(current, LoweredInst::Launch(Box::new(launch)));
        }
        Ok(current)
    }

    fn bound_expr(bound: &LoopBound) -> IrExpr {
        match bound {
            LoopBound::Const(c) => IrExpr::Const(IrValue::Int(*c)),
            LoopBound::Var(v) => IrExpr::Var(v.clone()),
        }
    }

    /// Materialize a bound as a variable evaluated once before the loop.
    fn bound_var(&mut self, bound: &LoopBound, base: &str, current: LoweredLabel) -> String {
        match bound {
            LoopBound::Var(v) => v.clone(),
            LoopBound::Const(_) => {
                let name = self.temp(base);
                self.emit(
                    current,
                    LoweredInst::Assign {
                        target: name.clone(),
                        value: Self::bound_expr(bound),
                    },
                );
                name
            }
        }
    }

    fn lower_sequential(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        id: LoopNestId,
        mut current: LoweredLabel,
    ) -> Result<LoweredLabel, LoweringError> {
        let nest = func
            .loop_nests
            .get(id)
            .cloned()
            .ok_or_else(|| LoweringError::InvalidIr(format!("unknown loop nest {}", id)))?;
        debug!("Lowering {} sequentially ({} dims)", id, nest.ndims());

        current = self.lower_instructions(desc, func, &nest.init_block, current)?;

        // (header, index, step var, exit) per dimension, outermost first
        let mut levels = Vec::with_capacity(nest.dims.len());
        for dim in &nest.dims {
            let stop = self.bound_var(&dim.stop, "stop", current);
            let step = self.bound_var(&dim.step, "step", current);
            self.emit(
                current,
                LoweredInst::Assign {
                    target: dim.index_variable.clone(),
                    value: Self::bound_expr(&dim.start),
                },
            );
            let header = self.new_block();
            self.terminate(current, LoweredTerminator::Jump(header));

            let cond = self.temp("cond");
            let op = match dim.step {
                LoopBound::Const(c) if c < 0 => crate::ir::CompareOp::Gt,
                _ => crate::ir::CompareOp::Lt,
            };
            self.emit(
                header,
                LoweredInst::Assign {
                    target: cond.clone(),
                    value: IrExpr::Cmp {
                        op,
                        lhs: dim.index_variable.clone(),
                        rhs: stop,
                    },
                },
            );
            let body = self.new_block();
            let exit = self.new_block();
            self.terminate(
                header,
                LoweredTerminator::Branch {
                    condition: cond,
                    true_target: body,
                    false_target: exit,
                },
            );
            levels.push((header, dim.index_variable.clone(), step, exit));
            current = body;
        }

        let latches: Vec<LoweredLabel> = levels.iter().map(|_| self.new_block()).collect();
        let continuation = self.new_block();
        let body_exit = latches.last().copied().unwrap_or(continuation);

        let body_entry = self.lower_region(desc, func, &nest.body, Some(body_exit))?;
        self.terminate(current, LoweredTerminator::Jump(body_entry));

        for (depth, (header, index, step, exit)) in levels.iter().enumerate() {
            let latch = latches[depth];
            self.emit(
                latch,
                LoweredInst::Assign {
                    target: index.clone(),
                    value: IrExpr::BinOp {
                        op: crate::ir::BinaryOp::Add,
                        lhs: index.clone(),
                        rhs: step.clone(),
                    },
                },
            );
            self.terminate(latch, LoweredTerminator::Jump(*header));
            let after = if depth == 0 { continuation } else { latches[depth - 1] };
            self.terminate(*exit, LoweredTerminator::Jump(after));
        }

        Ok(continuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, IrType, LoopDim, ScalarType};

    #[test]
    fn test_sequential_lowering_shape() {
        let mut b = IrBuilder::new("fill");
        b.arg("a", IrType::array(ScalarType::F64, 2));
        b.arg("n", IrType::i64());
        b.begin_loop_nest();
        b.const_f64("one", 1.0);
        b.set_item("a", &["i", "j"], "one");
        b.end_loop_nest(vec![
            LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n")),
            LoopDim::new("j", LoopBound::Const(0), LoopBound::Const(3)),
        ]);
        b.ret(None);
        let (desc, mut func) = b.finish();

        let lowered = Lowerer::sequential().lower_function(&desc, &mut func).unwrap();
        assert_eq!(lowered.arg_names, vec!["a", "n"]);
        assert_eq!(lowered.launches().count(), 0);
        // entry, 2 x (header, body, exit), body region, 2 latches, continuation
        assert_eq!(lowered.blocks.len(), 1 + 6 + 1 + 2 + 1);
        let returns = lowered
            .blocks
            .values()
            .filter(|b| matches!(b.terminator, LoweredTerminator::Return(_)))
            .count();
        // every block is terminated explicitly; only the continuation returns
        assert_eq!(returns, 1);
    }

    #[test]
    fn test_region_exit_at_top_level_is_invalid() {
        let mut func = IrFunction::new("f", vec![]);
        func.cfg
            .get_block_mut(IrBlockId(0))
            .unwrap()
            .set_terminator(IrTerminator::RegionExit);
        let desc = FunctionDescriptor::new("f", Default::default());
        let err = Lowerer::sequential().lower_function(&desc, &mut func).unwrap_err();
        assert!(matches!(err, LoweringError::InvalidIr(_)));
    }
}
