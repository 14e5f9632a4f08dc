//! Variable naming utilities
//!
//! Fresh-name generation, whole-region variable collection and renaming.
//! Every walk here descends into loop nests referenced from the region, so a
//! rename applied to a loop body also reaches nests nested inside it.

use super::{IrControlFlowGraph, IrInstruction, LoopBound, LoopNest, LoopNestArena, TypeMap};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Generator of globally unique variable names.
///
/// One generator is shared by every kernel produced in a compilation so that
/// renamed stub variables never collide across kernels.
#[derive(Debug, Default)]
pub struct UniqueNames {
    counter: u64,
}

impl UniqueNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce `base.N` with a counter never handed out before.
    pub fn fresh(&mut self, base: &str) -> String {
        let id = self.counter;
        self.counter += 1;
        let base = base.split('.').next().unwrap_or(base);
        format!("{}.{}", base, id)
    }

    /// Next counter value, used for kernel numbering.
    pub fn next_id(&mut self) -> u64 {
        let id = self.counter;
        self.counter += 1;
        id
    }
}

/// Every variable name read inside `cfg`, including reads inside nested loop
/// nests (bounds, params, races, init blocks and bodies).
pub fn region_uses(cfg: &IrControlFlowGraph, arena: &LoopNestArena) -> HashSet<String> {
    let mut uses = HashSet::new();
    collect_uses(cfg, arena, &mut uses);
    uses
}

fn collect_uses(cfg: &IrControlFlowGraph, arena: &LoopNestArena, uses: &mut HashSet<String>) {
    for block in cfg.blocks.values() {
        for inst in &block.instructions {
            collect_instruction_uses(inst, arena, uses);
        }
        uses.extend(block.terminator.uses().into_iter().map(str::to_string));
    }
}

fn collect_instruction_uses(inst: &IrInstruction, arena: &LoopNestArena, uses: &mut HashSet<String>) {
    match inst {
        IrInstruction::LoopNest(id) => {
            if let Some(nest) = arena.get(*id) {
                uses.extend(loop_nest_uses(nest, arena));
            }
        }
        other => uses.extend(other.uses().into_iter().map(str::to_string)),
    }
}

/// Variables a loop-nest instruction reads when seen from the enclosing region.
pub fn loop_nest_uses(nest: &LoopNest, arena: &LoopNestArena) -> HashSet<String> {
    let mut uses: HashSet<String> = nest.bound_vars().into_iter().collect();
    uses.extend(nest.params.iter().cloned());
    uses.extend(nest.races.iter().cloned());
    for inst in &nest.init_block {
        collect_instruction_uses(inst, arena, &mut uses);
    }
    collect_uses(&nest.body, arena, &mut uses);
    uses
}

/// Every variable name defined or referenced inside `cfg`, recursively.
pub fn region_names(cfg: &IrControlFlowGraph, arena: &LoopNestArena) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_names(cfg, arena, &mut names);
    names
}

fn collect_names(cfg: &IrControlFlowGraph, arena: &LoopNestArena, names: &mut BTreeSet<String>) {
    for block in cfg.blocks.values() {
        collect_instruction_names(&block.instructions, arena, names);
        names.extend(block.terminator.uses().into_iter().map(str::to_string));
    }
}

fn collect_instruction_names(
    instructions: &[IrInstruction],
    arena: &LoopNestArena,
    names: &mut BTreeSet<String>,
) {
    for inst in instructions {
        match inst {
            IrInstruction::LoopNest(id) => {
                let Some(nest) = arena.get(*id) else { continue };
                for dim in &nest.dims {
                    names.insert(dim.index_variable.clone());
                    names.extend(dim.bound_vars().map(str::to_string));
                }
                names.extend(nest.params.iter().cloned());
                names.extend(nest.races.iter().cloned());
                collect_instruction_names(&nest.init_block, arena, names);
                collect_names(&nest.body, arena, names);
            }
            IrInstruction::Del { var } => {
                names.insert(var.clone());
            }
            other => {
                names.extend(other.def().map(str::to_string));
                names.extend(other.uses().into_iter().map(str::to_string));
            }
        }
    }
}

/// Rename variables in `cfg` and in every loop nest reachable from it.
pub fn replace_var_names(
    cfg: &mut IrControlFlowGraph,
    arena: &mut LoopNestArena,
    map: &HashMap<String, String>,
) {
    if map.is_empty() {
        return;
    }
    cfg.rename_vars(map);
    let nested: Vec<_> = cfg
        .blocks
        .values()
        .flat_map(|b| b.instructions.iter())
        .filter_map(|inst| match inst {
            IrInstruction::LoopNest(id) => Some(*id),
            _ => None,
        })
        .collect();
    for id in nested {
        rename_in_loop_nest(id, arena, map);
    }
}

fn rename_in_loop_nest(id: super::LoopNestId, arena: &mut LoopNestArena, map: &HashMap<String, String>) {
    let Some(nest) = arena.get_mut(id) else { return };
    let rename = |name: &mut String| {
        if let Some(new_name) = map.get(name.as_str()) {
            *name = new_name.clone();
        }
    };
    for dim in &mut nest.dims {
        rename(&mut dim.index_variable);
        for bound in [&mut dim.start, &mut dim.stop, &mut dim.step] {
            if let LoopBound::Var(name) = bound {
                rename(name);
            }
        }
    }
    nest.params = nest
        .params
        .iter()
        .map(|p| map.get(p).cloned().unwrap_or_else(|| p.clone()))
        .collect();
    nest.races = nest
        .races
        .iter()
        .map(|p| map.get(p).cloned().unwrap_or_else(|| p.clone()))
        .collect();
    for reduction in &mut nest.reductions {
        rename(reduction);
    }
    nest.shape_classes = std::mem::take(&mut nest.shape_classes)
        .into_iter()
        .map(|(k, v)| (map.get(&k).cloned().unwrap_or(k), v))
        .collect();

    let mut init_ids = Vec::new();
    for inst in &mut nest.init_block {
        inst.rename_vars(map);
        if let IrInstruction::LoopNest(inner) = inst {
            init_ids.push(*inner);
        }
    }

    let mut body = std::mem::take(&mut nest.body);
    replace_var_names(&mut body, arena, map);
    if let Some(nest) = arena.get_mut(id) {
        nest.body = body;
    }
    for inner in init_ids {
        rename_in_loop_nest(inner, arena, map);
    }
}

/// Give every variable of a region a fresh unique name except those in
/// `keep`, copying types to the new names.
///
/// Returns the old-to-new mapping that was applied.
pub fn rename_region_vars(
    cfg: &mut IrControlFlowGraph,
    arena: &mut LoopNestArena,
    typemap: &mut TypeMap,
    keep: &BTreeSet<String>,
    names: &mut UniqueNames,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for old in region_names(cfg, arena) {
        if keep.contains(&old) {
            continue;
        }
        let new_name = names.fresh(&old);
        if let Some(ty) = typemap.get(&old).cloned() {
            typemap.insert(new_name.clone(), ty);
        }
        map.insert(old, new_name);
    }
    replace_var_names(cfg, arena, &map);
    map
}
