//! Race-variable promotion
//!
//! A scalar written by several work-items is turned into a one-element
//! array: every assignment becomes a store to element 0 and every read a
//! load from it. The rewrite reaches nested loop nests and their init
//! blocks.

use crate::ir::rename::UniqueNames;
use crate::ir::{
    IrControlFlowGraph, IrExpr, IrInstruction, IrType, IrValue, LoopNestArena,
    LoopNestId, TypeMap,
};
use std::collections::{BTreeSet, HashMap};

/// Counts of rewritten accesses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaceRewrite {
    /// Assignments turned into indexed stores
    pub stores: usize,

    /// Reads turned into indexed loads
    pub loads: usize,
}

struct RaceRewriter<'a> {
    races: &'a BTreeSet<String>,
    typemap: &'a mut TypeMap,
    names: &'a mut UniqueNames,
    stats: RaceRewrite,
}

/// Promote every variable in `races` to a one-element array inside `cfg`.
///
/// The type map entry of each race variable is replaced by a 1-d array of
/// its scalar type.
pub fn replace_var_with_array(
    races: &BTreeSet<String>,
    cfg: &mut IrControlFlowGraph,
    arena: &mut LoopNestArena,
    typemap: &mut TypeMap,
    names: &mut UniqueNames,
) -> Result<RaceRewrite, String> {
    if races.is_empty() {
        return Ok(RaceRewrite::default());
    }
    for race in races {
        let ty = typemap
            .get(race)
            .ok_or_else(|| format!("race variable {} has no type", race))?;
        let dtype = match ty.scalar_from_0d() {
            IrType::Scalar(s) => s,
            other => return Err(format!("race variable {} has non-scalar type {}", race, other)),
        };
        typemap.insert(race.clone(), IrType::array(dtype, 1));
    }

    let mut rewriter = RaceRewriter {
        races,
        typemap,
        names,
        stats: RaceRewrite::default(),
    };
    rewriter.rewrite_region(cfg, arena);
    Ok(rewriter.stats)
}

impl RaceRewriter<'_> {
    fn element_type(&self, race: &str) -> IrType {
        match self.typemap.get(race) {
            Some(IrType::Array(arr)) => IrType::Scalar(arr.dtype),
            _ => IrType::f64(),
        }
    }

    fn zero_index(&mut self, out: &mut Vec<IrInstruction>) -> String {
        let name = self.names.fresh("$const_ind_0");
        self.typemap.insert(name.clone(), IrType::uintp());
        out.push(IrInstruction::assign(name.clone(), IrExpr::Const(IrValue::Int(0))));
        name
    }

    /// Load every race variable in `uses` into a temp; returns the renames.
    fn load_races(&mut self, uses: &[&str], out: &mut Vec<IrInstruction>) -> HashMap<String, String> {
        let mut renames = HashMap::new();
        for &name in uses {
            if !self.races.contains(name) || renames.contains_key(name) {
                continue;
            }
            let index = self.zero_index(out);
            let temp = self.names.fresh("$race_load");
            let ty = self.element_type(name);
            self.typemap.insert(temp.clone(), ty);
            out.push(IrInstruction::assign(
                temp.clone(),
                IrExpr::GetItem {
                    array: name.to_string(),
                    index: vec![index],
                },
            ));
            self.stats.loads += 1;
            renames.insert(name.to_string(), temp);
        }
        renames
    }

    fn rewrite_instructions(&mut self, instructions: Vec<IrInstruction>) -> (Vec<IrInstruction>, Vec<LoopNestId>) {
        let mut out = Vec::with_capacity(instructions.len());
        let mut nested = Vec::new();
        for inst in instructions {
            match inst {
                IrInstruction::LoopNest(id) => {
                    nested.push(id);
                    out.push(inst);
                }
                // The storage itself stays alive for the whole kernel
                IrInstruction::Del { ref var } if self.races.contains(var) => {}
                IrInstruction::Assign { target, mut value, loc } if self.races.contains(&target) => {
                    let uses: Vec<String> = value.uses().into_iter().map(str::to_string).collect();
                    let uses: Vec<&str> = uses.iter().map(String::as_str).collect();
                    let renames = self.load_races(&uses, &mut out);
                    value.rename_vars(&renames);

                    let temp = self.names.fresh("$race_val");
                    let ty = self.element_type(&target);
                    self.typemap.insert(temp.clone(), ty);
                    out.push(IrInstruction::Assign {
                        target: temp.clone(),
                        value,
                        loc,
                    });
                    let index = self.zero_index(&mut out);
                    out.push(IrInstruction::SetItem {
                        target,
                        index: vec![index],
                        value: temp,
                        loc,
                    });
                    self.stats.stores += 1;
                }
                mut other => {
                    let uses: Vec<String> = other.uses().into_iter().map(str::to_string).collect();
                    let uses: Vec<&str> = uses.iter().map(String::as_str).collect();
                    let renames = self.load_races(&uses, &mut out);
                    if let IrInstruction::SetItem { target, .. } = &other {
                        // Stores through the array itself need no load
                        if renames.contains_key(target) {
                            let target = target.clone();
                            let mut renames = renames;
                            renames.remove(&target);
                            other.rename_vars(&renames);
                            out.push(other);
                            continue;
                        }
                    }
                    other.rename_vars(&renames);
                    out.push(other);
                }
            }
        }
        (out, nested)
    }

    fn rewrite_region(&mut self, cfg: &mut IrControlFlowGraph, arena: &mut LoopNestArena) {
        let mut nested = Vec::new();
        for block in cfg.blocks.values_mut() {
            let (mut instructions, ids) = self.rewrite_instructions(std::mem::take(&mut block.instructions));
            nested.extend(ids);

            let uses: Vec<String> = block.terminator.uses().into_iter().map(str::to_string).collect();
            let uses: Vec<&str> = uses.iter().map(String::as_str).collect();
            let renames = self.load_races(&uses, &mut instructions);
            if !renames.is_empty() {
                block.terminator.rename_vars(&renames);
            }
            block.instructions = instructions;
        }
        for id in nested {
            self.rewrite_loop_nest(id, arena);
        }
    }

    fn rewrite_loop_nest(&mut self, id: LoopNestId, arena: &mut LoopNestArena) {
        let Some(nest) = arena.get_mut(id) else { return };
        let init = std::mem::take(&mut nest.init_block);
        let mut body = std::mem::take(&mut nest.body);

        let (init, init_nested) = self.rewrite_instructions(init);
        self.rewrite_region(&mut body, arena);
        for inner in init_nested {
            self.rewrite_loop_nest(inner, arena);
        }
        if let Some(nest) = arena.get_mut(id) {
            nest.init_block = init;
            nest.body = body;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, IrBlockId, IrTerminator, LoopBound, LoopDim, LoopNest};

    fn assign_const(target: &str, v: f64) -> IrInstruction {
        IrInstruction::assign(target, IrExpr::Const(IrValue::Float(v)))
    }

    #[test]
    fn test_every_store_is_rewritten_including_nested() {
        let mut arena = LoopNestArena::new();
        let mut inner_body = IrControlFlowGraph::new();
        let block = inner_body.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(assign_const("acc", 2.0));
        block.set_terminator(IrTerminator::RegionExit);
        let inner = arena.alloc(LoopNest::new(
            vec![LoopDim::new("j", LoopBound::Const(0), LoopBound::Const(4))],
            inner_body,
        ));

        let mut cfg = IrControlFlowGraph::new();
        let block = cfg.get_block_mut(IrBlockId(0)).unwrap();
        block.add_instruction(assign_const("acc", 1.0));
        block.add_instruction(IrInstruction::assign(
            "acc",
            IrExpr::BinOp {
                op: BinaryOp::Add,
                lhs: "acc".into(),
                rhs: "x".into(),
            },
        ));
        block.add_instruction(IrInstruction::LoopNest(inner));
        block.set_terminator(IrTerminator::RegionExit);

        let mut typemap = TypeMap::new();
        typemap.insert("acc", IrType::f64());
        typemap.insert("x", IrType::f64());
        let races: BTreeSet<String> = ["acc".to_string()].into_iter().collect();
        let mut names = UniqueNames::new();

        let stats = replace_var_with_array(&races, &mut cfg, &mut arena, &mut typemap, &mut names).unwrap();
        assert_eq!(stats.stores, 3);
        assert_eq!(stats.loads, 1);
        assert_eq!(typemap.get("acc"), Some(&IrType::array(crate::ir::ScalarType::F64, 1)));

        // No direct assignment to the race variable survives
        let direct = cfg
            .blocks
            .values()
            .chain(arena.iter().flat_map(|n| n.body.blocks.values()))
            .flat_map(|b| b.instructions.iter())
            .filter(|i| i.def() == Some("acc"))
            .count();
        assert_eq!(direct, 0);
    }

    #[test]
    fn test_non_scalar_race_is_an_error() {
        let mut cfg = IrControlFlowGraph::new();
        let mut typemap = TypeMap::new();
        typemap.insert("arr", IrType::array(crate::ir::ScalarType::F64, 2));
        let races: BTreeSet<String> = ["arr".to_string()].into_iter().collect();
        let result = replace_var_with_array(
            &races,
            &mut cfg,
            &mut LoopNestArena::new(),
            &mut typemap,
            &mut UniqueNames::new(),
        );
        assert!(result.is_err());
    }
}
