//! Host-side launch sequence generation
//!
//! Replaces an offloaded loop nest in the host function with the operations
//! that marshal its arguments, resolve the launch range, enqueue the kernel
//! and copy modified arrays back.

use super::outline::OutlinedKernel;
use super::scheduler::MAX_HARDWARE_DIMS;
use super::shape_signature::ShapeSignature;
use crate::codegen::keep_alive::{KernelHandle, KernelKeepAlive};
use crate::error::LoweringError;
use crate::ir::{IrType, LoopBound, LoopNest};
use log::debug;
use serde::Serialize;

/// Fixed slots of an array argument: meminfo, parent, nitems, itemsize, data
pub const ARRAY_FIXED_SLOTS: usize = 5;

/// Kernel-argument slots taken by one argument of type `ty`.
///
/// A scalar takes one slot; an array of rank `r` takes `5 + 2r` (fixed
/// fields plus `r` shapes and `r` strides).
pub fn expanded_slot_count(ty: &IrType) -> usize {
    match ty.scalar_from_0d() {
        IrType::Array(arr) => ARRAY_FIXED_SLOTS + 2 * arr.ndim,
        _ => 1,
    }
}

/// Total slots for a kernel signature.
pub fn total_slot_count<'a>(types: impl IntoIterator<Item = &'a IrType>) -> usize {
    types.into_iter().map(expanded_slot_count).sum()
}

/// One kernel argument as seen from the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchArg {
    /// Host variable holding the value
    pub host_name: String,

    /// Legalized kernel parameter name
    pub kernel_name: String,

    /// Kernel-side type (address space applied, races promoted)
    pub kernel_type: IrType,

    pub slots: usize,

    /// The kernel may write the backing array; copied back after launch
    pub modified: bool,

    /// Scalar passed through a one-element array
    pub race: bool,
}

/// One hardware axis of the launch range, in host terms
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchDim {
    pub index_variable: String,
    pub start: LoopBound,
    pub stop: LoopBound,
    pub step: LoopBound,
}

/// Everything the host needs to launch one kernel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchDescriptor {
    pub kernel_name: String,
    pub args: Vec<LaunchArg>,
    pub num_inputs: usize,

    /// Exact size of the kernel-argument buffer
    pub expanded_slots: usize,

    /// First `min(D, 3)` dimensions of the loop nest
    pub ranges: Vec<LaunchDim>,

    pub signature: ShapeSignature,
}

/// Host-side launch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchOp {
    AcquireQueue,
    AllocateArgs { count: usize },
    SetArg { arg: usize },
    ResolveRange,
    Enqueue,
    CopyBack { arg: usize },
    ReleaseQueue,
}

/// Launch code replacing one loop nest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSequence {
    pub kernel: KernelHandle,
    pub descriptor: LaunchDescriptor,
    pub ops: Vec<LaunchOp>,
}

impl LaunchSequence {
    pub fn set_arg_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, LaunchOp::SetArg { .. }))
            .count()
    }

    pub fn copy_back_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, LaunchOp::CopyBack { .. }))
            .count()
    }
}

/// Generate the launch sequence for an outlined kernel and retain the
/// kernel in `keep_alive`.
pub fn generate_launch(
    outlined: &OutlinedKernel,
    nest: &LoopNest,
    signature: ShapeSignature,
    keep_alive: &KernelKeepAlive,
) -> Result<LaunchSequence, LoweringError> {
    if outlined.host_args.len() != outlined.param_types.len()
        || outlined.host_args.len() != outlined.kernel_params.len()
    {
        return Err(LoweringError::Marshal(format!(
            "{}: {} host arguments for {} kernel parameters",
            outlined.kernel_name,
            outlined.host_args.len(),
            outlined.param_types.len()
        )));
    }

    let args: Vec<LaunchArg> = outlined
        .host_args
        .iter()
        .zip(&outlined.kernel_params)
        .zip(&outlined.param_types)
        .map(|((host, kernel), ty)| LaunchArg {
            host_name: host.clone(),
            kernel_name: kernel.clone(),
            kernel_type: ty.clone(),
            slots: expanded_slot_count(ty),
            modified: outlined.modified.contains(host),
            race: outlined.races.contains(host),
        })
        .collect();

    let expanded_slots = total_slot_count(&outlined.param_types);
    if args.iter().map(|a| a.slots).sum::<usize>() != expanded_slots {
        return Err(LoweringError::Marshal(format!(
            "{}: argument slots do not add up to {}",
            outlined.kernel_name, expanded_slots
        )));
    }

    let ranges: Vec<LaunchDim> = nest
        .dims
        .iter()
        .take(MAX_HARDWARE_DIMS)
        .map(|d| LaunchDim {
            index_variable: d.index_variable.clone(),
            start: d.start.clone(),
            stop: d.stop.clone(),
            step: d.step.clone(),
        })
        .collect();

    let mut ops = Vec::with_capacity(args.len() * 2 + 5);
    ops.push(LaunchOp::AcquireQueue);
    ops.push(LaunchOp::AllocateArgs {
        count: expanded_slots,
    });
    ops.extend((0..args.len()).map(|arg| LaunchOp::SetArg { arg }));
    ops.push(LaunchOp::ResolveRange);
    ops.push(LaunchOp::Enqueue);
    ops.extend(
        args.iter()
            .enumerate()
            .filter(|(_, a)| a.modified && a.kernel_type.is_array())
            .map(|(arg, _)| LaunchOp::CopyBack { arg }),
    );
    ops.push(LaunchOp::ReleaseQueue);

    let kernel = keep_alive.retain(outlined.kernel.clone());
    debug!(
        "Launch for {}: {} args, {} slots, signature {}",
        outlined.kernel_name,
        args.len(),
        expanded_slots,
        signature
    );

    Ok(LaunchSequence {
        kernel,
        descriptor: LaunchDescriptor {
            kernel_name: outlined.kernel_name.clone(),
            args,
            num_inputs: outlined.num_inputs,
            expanded_slots,
            ranges,
            signature,
        },
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ScalarType;

    #[test]
    fn test_slot_formula() {
        assert_eq!(expanded_slot_count(&IrType::f64()), 1);
        assert_eq!(expanded_slot_count(&IrType::array(ScalarType::F64, 1)), 7);
        assert_eq!(expanded_slot_count(&IrType::array(ScalarType::I32, 3)), 11);
        // 0-d arrays are passed as scalars
        assert_eq!(expanded_slot_count(&IrType::array(ScalarType::F64, 0)), 1);

        let sig = [
            IrType::i64(),
            IrType::f64(),
            IrType::array(ScalarType::F64, 1),
            IrType::array(ScalarType::F64, 2),
        ];
        assert_eq!(total_slot_count(&sig), 2 + (5 + 2) + (5 + 4));
    }
}
