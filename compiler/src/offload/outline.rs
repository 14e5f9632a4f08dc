//! Kernel outlining
//!
//! Moves the body of a loop nest into a standalone kernel function.
//!
//! ## Algorithm
//!
//! 1. Copy the body (with every nest nested in it) into a fresh arena and
//!    strip its `Del` markers
//! 2. Classify parameters into inputs and outputs, then promote race
//!    variables to one-element arrays
//! 3. Legalize parameter and index names
//! 4. Build a stub: work-item bindings, sequential loops for dimensions past
//!    the third, a sentinel assignment and a return
//! 5. Rename stub temporaries, offset body labels past the stub's, split the
//!    sentinel block and splice the body in between
//! 6. Renumber labels, reinsert `Del`s, drop dead code with the parameters
//!    as roots, compile
//!
//! The host function is only touched in one place: the nest's parameter set
//! gains its bound variables and race variables. Everything else works on
//! copies.

use super::analysis::{check_supported, classify_params, kernel_params};
use super::legalize::legalize_names;
use super::races::replace_var_with_array;
use super::scheduler::{schedule_loop, KernelSchedule, ScheduleDim};
use crate::codegen::backend::{CompileFlags, CompiledKernel, KernelBackend};
use crate::error::LoweringError;
use crate::ir::dump::dump_function;
use crate::ir::insert_dels::{remove_dels, InsertDelsPass};
use crate::ir::optimization::{DeadCodeEliminationPass, OptimizationPass};
use crate::ir::rename::{region_names, rename_region_vars, replace_var_names, UniqueNames};
use crate::ir::{
    AddressSpace, BinaryOp, CompareOp, FunctionDescriptor, IrBasicBlock, IrBlockId, IrBuilder,
    IrControlFlowGraph, IrExpr, IrFunction, IrTerminator, IrType, LoopBound,
    LoopNestArena, LoopNestId, TypeMap,
};
use diagnostics::offload::OffloadDiagnostics;
use diagnostics::{Diagnostics, SourceSpan};
use log::{debug, info, trace, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const SENTINEL_BASE: &str = "__sentinel__";

/// Result of outlining one loop nest
#[derive(Debug, Clone)]
pub struct OutlinedKernel {
    pub kernel_name: String,
    pub kernel: Arc<CompiledKernel>,

    /// Finished kernel IR, kept for dumps
    pub kernel_ir: IrFunction,
    pub kernel_typemap: TypeMap,

    /// Host variables passed to the kernel: inputs then outputs
    pub host_args: Vec<String>,

    /// Legal kernel parameter names, parallel to `host_args`
    pub kernel_params: Vec<String>,

    /// Kernel parameter types with address spaces applied
    pub param_types: Vec<IrType>,
    pub addrspaces: Vec<Option<AddressSpace>>,

    /// Host arrays the kernel may write (outputs and races)
    pub modified: BTreeSet<String>,
    pub races: BTreeSet<String>,
    pub num_inputs: usize,

    pub schedule: KernelSchedule,
}

/// Scoped no-alias flag: restores the previous value when dropped.
struct NoAliasGuard<'f> {
    flags: &'f mut CompileFlags,
    previous: bool,
}

impl<'f> NoAliasGuard<'f> {
    fn set(flags: &'f mut CompileFlags, noalias: bool) -> Self {
        let previous = flags.noalias;
        flags.noalias = noalias;
        Self { flags, previous }
    }

    fn flags(&self) -> CompileFlags {
        *self.flags
    }
}

impl Drop for NoAliasGuard<'_> {
    fn drop(&mut self) {
        self.flags.noalias = self.previous;
    }
}

fn outline_err(msg: impl Into<String>) -> LoweringError {
    LoweringError::Outline(msg.into())
}

/// Outlines loop nests into kernels compiled by `backend`
pub struct KernelOutliner<'c> {
    pub backend: &'c dyn KernelBackend,
    pub names: &'c mut UniqueNames,
    pub diagnostics: &'c mut Diagnostics,
    pub flags: &'c mut CompileFlags,
    pub dump_ir: bool,
}

impl KernelOutliner<'_> {
    /// Outline loop nest `id` of `func` and compile it.
    pub fn outline(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        id: LoopNestId,
    ) -> Result<OutlinedKernel, LoweringError> {
        let nest = func
            .loop_nests
            .get(id)
            .cloned()
            .ok_or_else(|| LoweringError::InvalidIr(format!("unknown loop nest {}", id)))?;
        check_supported(&nest)?;

        let kernel_name = format!("__offload_loop_kernel_{}", self.names.next_id());
        debug!("Outlining {} of {} into {}", id, desc.qualified_name, kernel_name);

        // Bound and race variables become loop-carried params of the host nest
        let params = kernel_params(&nest);
        if let Some(host_nest) = func.loop_nests.get_mut(id) {
            host_nest.params = params.clone();
        }

        let mut typemap = desc.typemap.clone();
        let mut arena = LoopNestArena::new();
        let mut body = arena
            .import_region(&func.loop_nests, &nest.body)
            .map_err(outline_err)?;
        remove_dels(&mut body);

        let classes = classify_params(&params, &body, &arena);

        let span = SourceSpan::new(nest.loc.file_id, nest.loc.line, nest.loc.column);
        for race in &nest.races {
            warn!(
                "Variable {} used in parallel loop may be written to simultaneously by multiple workers",
                race
            );
            self.diagnostics
                .push(OffloadDiagnostics::parallel_safety(race, span));
        }
        let rewrite = replace_var_with_array(&nest.races, &mut body, &mut arena, &mut typemap, self.names)
            .map_err(outline_err)?;
        trace!("race promotion: {} stores, {} loads", rewrite.stores, rewrite.loads);

        let host_args = classes.ordered();
        let mut param_types = Vec::with_capacity(host_args.len());
        let mut addrspaces = Vec::with_capacity(host_args.len());
        for param in &host_args {
            let ty = typemap
                .get(param)
                .ok_or_else(|| outline_err(format!("parameter {} has no type", param)))?
                .scalar_from_0d();
            match ty {
                IrType::Array(arr) => {
                    param_types.push(IrType::Array(arr.in_addrspace(AddressSpace::Global)));
                    addrspaces.push(Some(AddressSpace::Global));
                }
                other => {
                    param_types.push(other);
                    addrspaces.push(None);
                }
            }
        }

        // Legalize parameters and loop indices together so they never collide
        let index_vars: Vec<String> = nest.dims.iter().map(|d| d.index_variable.clone()).collect();
        let legal = legalize_names(
            host_args.iter().chain(index_vars.iter()).map(String::as_str),
            &mut typemap,
        );
        let rename: HashMap<String, String> = legal
            .iter()
            .filter(|(old, new)| old != new)
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        replace_var_names(&mut body, &mut arena, &rename);
        let legal_name = |name: &str| legal.get(name).cloned().unwrap_or_else(|| name.to_string());
        let kernel_params: Vec<String> = host_args.iter().map(|p| legal_name(p.as_str())).collect();
        let kernel_indices: Vec<String> = index_vars.iter().map(|i| legal_name(i.as_str())).collect();

        let mut taken = region_names(&body, &arena);
        taken.extend(typemap.names().map(str::to_string));
        let sentinel = unused_name(SENTINEL_BASE, &taken);

        let (schedule, stub, stub_types) =
            build_stub(&kernel_name, &kernel_params, &param_types, &kernel_indices, &nest.dims, &legal_name, &sentinel);
        for (name, ty) in stub_types.iter() {
            typemap.insert(name.to_string(), ty.clone());
        }
        let mut stub_cfg = stub.cfg;
        let mut stub_arena = stub.loop_nests;

        let mut keep: BTreeSet<String> = kernel_params.iter().cloned().collect();
        keep.extend(kernel_indices.iter().cloned());
        keep.insert(sentinel.clone());
        rename_region_vars(&mut stub_cfg, &mut stub_arena, &mut typemap, &keep, self.names);
        if self.dump_ir {
            trace!("kernel stub before splice:\n{}", crate::ir::dump::dump_region(&stub_cfg, &stub_arena));
        }

        let cfg = splice_body(stub_cfg, body, &sentinel)?;

        let mut kernel_ir = IrFunction::new(kernel_name.clone(), kernel_params.clone());
        kernel_ir.cfg = cfg;
        kernel_ir.loop_nests = arena;
        kernel_ir.loc = nest.loc;

        let roots: Vec<String> = kernel_params.clone();
        let dels = InsertDelsPass::keeping(roots.iter().cloned())
            .run_on_region(&mut kernel_ir.cfg, &mut kernel_ir.loop_nests);
        let dce = DeadCodeEliminationPass::with_roots(roots)
            .run_on_region(&mut kernel_ir.cfg, &mut kernel_ir.loop_nests);
        trace!(
            "{}: {} dels inserted, {} dead instructions removed",
            kernel_name,
            dels.stats.get("del_instructions_inserted").copied().unwrap_or(0),
            dce.instructions_eliminated
        );
        kernel_ir.verify().map_err(outline_err)?;

        if self.dump_ir {
            info!("kernel IR:\n{}", dump_function(&kernel_ir, &typemap));
        }

        let noalias = if nest.has_aliases { self.flags.noalias } else { true };
        let kernel = {
            let guard = NoAliasGuard::set(self.flags, noalias);
            self.backend
                .compile(&kernel_ir, &typemap, &param_types, &addrspaces, guard.flags())?
        };

        let mut modified: BTreeSet<String> = classes.outputs.iter().cloned().collect();
        modified.extend(nest.races.iter().cloned());

        Ok(OutlinedKernel {
            kernel_name,
            kernel,
            kernel_ir,
            kernel_typemap: typemap,
            num_inputs: classes.num_inputs(),
            host_args,
            kernel_params,
            param_types,
            addrspaces,
            modified,
            races: nest.races.clone(),
            schedule,
        })
    }
}

/// `base`, or `base_N` for the first `N` not in `taken`.
fn unused_name(base: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn bound_symbol(bound: &LoopBound, legal_name: &dyn Fn(&str) -> String) -> String {
    match bound {
        LoopBound::Const(c) => c.to_string(),
        LoopBound::Var(v) => legal_name(v),
    }
}

/// Materialize a bound symbol (literal or variable) as a variable.
fn symbol_var(b: &mut IrBuilder, symbol: &str, temp: &str) -> String {
    match symbol.parse::<i64>() {
        Ok(value) => {
            b.const_i64(temp, value);
            temp.to_string()
        }
        Err(_) => symbol.to_string(),
    }
}

/// Build the kernel stub: prologue, sentinel assignment, return.
fn build_stub(
    kernel_name: &str,
    params: &[String],
    param_types: &[IrType],
    indices: &[String],
    dims: &[crate::ir::LoopDim],
    legal_name: &dyn Fn(&str) -> String,
    sentinel: &str,
) -> (KernelSchedule, IrFunction, TypeMap) {
    let mut b = IrBuilder::new(kernel_name);
    for (p, ty) in params.iter().zip(param_types) {
        b.arg(p.clone(), ty.clone());
    }

    // Inclusive last index of every sequential dimension, stop - 1
    let mut sched_dims = Vec::with_capacity(dims.len());
    let mut last_vars = Vec::new();
    for (k, (dim, index)) in dims.iter().zip(indices).enumerate() {
        let start = bound_symbol(&dim.start, legal_name);
        if k < super::scheduler::MAX_HARDWARE_DIMS {
            sched_dims.push(ScheduleDim::new(index.clone(), start, bound_symbol(&dim.stop, legal_name)));
            continue;
        }
        let stop = symbol_var(&mut b, &bound_symbol(&dim.stop, legal_name), &format!("$offload_stop{}", k));
        let last = format!("$offload_last{}", k);
        b.const_i64("$offload_one", 1);
        b.binop(last.clone(), IrType::i64(), BinaryOp::Sub, stop, "$offload_one");
        last_vars.push(last.clone());
        sched_dims.push(ScheduleDim::new(index.clone(), start, last));
    }
    let schedule = schedule_loop(&sched_dims, &HashMap::new());
    trace!("schedule for {}:\n{}", kernel_name, schedule.render());

    for binding in &schedule.work_items {
        b.assign(binding.index.clone(), IrType::i64(), IrExpr::GlobalId { axis: binding.axis });
    }

    // (header, latch) per sequential loop, outermost first
    let mut loops: Vec<(IrBlockId, IrBlockId, IrBlockId)> = Vec::new();
    for (k, seq) in schedule.sequential_loops.iter().enumerate() {
        let start = symbol_var(&mut b, &seq.start, &format!("$offload_start{}", k));
        b.copy(seq.index.clone(), IrType::i64(), start);
        let header = b.create_block();
        let body = b.create_block();
        let latch = b.create_block();
        let exit = b.create_block();
        b.jump(header);

        b.switch_to_block(header);
        let cond = format!("$offload_cond{}", k);
        b.compare(cond.clone(), CompareOp::Le, seq.index.clone(), seq.stop.clone());
        b.branch(cond, body, exit);

        b.switch_to_block(latch);
        b.binop(seq.index.clone(), IrType::i64(), BinaryOp::Add, seq.index.clone(), "$offload_one");
        b.jump(header);

        b.switch_to_block(body);
        loops.push((header, latch, exit));
    }

    b.const_i64(sentinel, 0);
    match loops.last() {
        Some(&(_, latch, _)) => b.jump(latch),
        None => b.ret(None),
    }

    // Each loop exit continues the enclosing loop's latch
    let ret_block = b.create_block();
    for (k, &(_, _, exit)) in loops.iter().enumerate() {
        b.switch_to_block(exit);
        match k.checked_sub(1).and_then(|outer| loops.get(outer)) {
            Some(&(_, outer_latch, _)) => b.jump(outer_latch),
            None => b.jump(ret_block),
        }
    }
    b.switch_to_block(ret_block);
    b.ret(None);

    let (desc, mut stub) = b.finish();
    if loops.is_empty() {
        // Only the entry block is reachable without sequential loops
        stub.cfg.blocks.remove(&ret_block);
    }
    (schedule, stub, desc.typemap)
}

/// Split the sentinel block of `stub` and splice `body` into the gap.
///
/// Body labels are moved past the stub's; the block after the sentinel gets
/// the label following the body's last one. Labels are renumbered densely
/// afterwards.
fn splice_body(
    stub: IrControlFlowGraph,
    body: IrControlFlowGraph,
    sentinel: &str,
) -> Result<IrControlFlowGraph, LoweringError> {
    let offset = stub.max_label().map_or(0, |l| l.0 + 1);
    let body = body.add_offset_to_labels(offset);
    let body_entry = body
        .entry_block()
        .ok_or_else(|| outline_err("loop body has no blocks"))?;
    let new_label = body.max_label().map_or(offset, |l| l.0 + 1);

    let mut cfg = stub;
    let sentinel_block = cfg
        .blocks
        .values()
        .find(|b| b.instructions.iter().any(|i| i.def() == Some(sentinel)))
        .map(|b| b.id)
        .ok_or_else(|| outline_err("kernel stub lost its sentinel"))?;

    let block = cfg
        .get_block_mut(sentinel_block)
        .ok_or_else(|| outline_err("sentinel block vanished"))?;
    let position = block
        .instructions
        .iter()
        .position(|i| i.def() == Some(sentinel))
        .ok_or_else(|| outline_err("kernel stub lost its sentinel"))?;
    let mut post = IrBasicBlock::new(IrBlockId(new_label));
    // The sentinel itself moves with the tail and is removed as dead code
    post.instructions = block.instructions.split_off(position);
    post.terminator = std::mem::replace(&mut block.terminator, IrTerminator::Jump { target: body_entry });
    post.loc = block.loc;

    for mut body_block in body.blocks.into_values() {
        if matches!(body_block.terminator, IrTerminator::RegionExit) {
            body_block.terminator = IrTerminator::Jump {
                target: IrBlockId(new_label),
            };
        }
        cfg.insert_block(body_block);
    }
    cfg.insert_block(post);
    Ok(cfg.rename_labels())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::host_device::HostDeviceBackend;
    use crate::ir::{IrInstruction, LoopDim, ScalarType};

    fn kernel_instructions(func: &IrFunction) -> Vec<&IrInstruction> {
        func.cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .collect()
    }

    fn copy_kernel(dims: Vec<LoopDim>, rank: usize) -> (FunctionDescriptor, IrFunction, LoopNestId) {
        let mut b = IrBuilder::new("copy");
        b.arg("a", IrType::array(ScalarType::F64, rank));
        b.arg("b", IrType::array(ScalarType::F64, rank));
        b.arg("n", IrType::i64());
        let idx: Vec<String> = dims.iter().map(|d| d.index_variable.clone()).collect();
        let idx: Vec<&str> = idx.iter().map(String::as_str).collect();
        b.begin_loop_nest();
        b.get_item("$v.1", ScalarType::F64, "a", &idx);
        b.set_item("b", &idx, "$v.1");
        let id = b.end_loop_nest(dims);
        b.loop_nest_mut(id).unwrap().params = ["a", "b"].iter().map(|s| s.to_string()).collect();
        b.ret(None);
        let (desc, func) = b.finish();
        (desc, func, id)
    }

    fn outline(desc: &FunctionDescriptor, func: &mut IrFunction, id: LoopNestId) -> (OutlinedKernel, Diagnostics) {
        let backend = HostDeviceBackend::new();
        let mut names = UniqueNames::new();
        let mut diagnostics = Diagnostics::new();
        let mut flags = CompileFlags::default();
        let mut outliner = KernelOutliner {
            backend: &backend,
            names: &mut names,
            diagnostics: &mut diagnostics,
            flags: &mut flags,
            dump_ir: false,
        };
        let outlined = outliner.outline(desc, func, id).unwrap();
        // The scoped no-alias flag is restored
        assert!(!flags.noalias);
        (outlined, diagnostics)
    }

    #[test]
    fn test_one_dim_kernel_signature() {
        let (desc, mut func, id) = copy_kernel(
            vec![LoopDim::new("$parfor_index.0", LoopBound::Const(0), LoopBound::var("n"))],
            1,
        );
        let (outlined, diagnostics) = outline(&desc, &mut func, id);

        assert_eq!(outlined.host_args, vec!["a", "n", "b"]);
        assert_eq!(outlined.num_inputs, 2);
        assert_eq!(outlined.addrspaces, vec![Some(AddressSpace::Global), None, Some(AddressSpace::Global)]);
        assert_eq!(outlined.schedule.hardware_dims(), 1);
        assert!(outlined.schedule.sequential_loops.is_empty());
        assert!(outlined.modified.contains("b"));
        assert!(diagnostics.is_empty());
        assert!(outlined.kernel.flags.noalias);

        // The host nest gained its bound variable; the host typemap did not change
        assert!(func.loop_nests.get(id).unwrap().params.contains("n"));
        assert!(!desc.typemap.contains("_parfor_index_0"));
        assert!(outlined.kernel_typemap.contains("_parfor_index_0"));

        // The sentinel is gone and the index is bound to the work-item id
        let insts = kernel_instructions(&outlined.kernel_ir);
        assert!(insts.iter().all(|i| i.def() != Some(SENTINEL_BASE)));
        assert!(insts.iter().any(|i| matches!(
            i,
            IrInstruction::Assign { target, value: IrExpr::GlobalId { axis: 0 }, .. } if target == "_parfor_index_0"
        )));
        assert_eq!(outlined.kernel_ir.cfg.entry_block(), Some(IrBlockId(0)));
    }

    #[test]
    fn test_four_dims_add_one_sequential_loop() {
        let dims = ["i", "j", "k", "l"]
            .iter()
            .map(|i| LoopDim::new(*i, LoopBound::Const(0), LoopBound::var("n")))
            .collect();
        let (desc, mut func, id) = copy_kernel(dims, 4);
        let (outlined, _) = outline(&desc, &mut func, id);

        assert_eq!(outlined.schedule.hardware_dims(), 3);
        assert_eq!(outlined.schedule.sequential_loops.len(), 1);
        assert_eq!(outlined.schedule.sequential_loops[0].index, "l");
        assert!(outlined.kernel_ir.verify().is_ok());
    }

    #[test]
    fn test_aliasing_nest_keeps_flag() {
        let (desc, mut func, id) = copy_kernel(
            vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))],
            1,
        );
        func.loop_nests.get_mut(id).unwrap().has_aliases = true;
        let (outlined, _) = outline(&desc, &mut func, id);
        assert!(!outlined.kernel.flags.noalias);
    }

    #[test]
    fn test_unused_name_skips_taken() {
        let taken: BTreeSet<String> = ["__sentinel__", "__sentinel___1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unused_name(SENTINEL_BASE, &taken), "__sentinel___2");
        assert_eq!(unused_name("x", &taken), "x");
    }
}
