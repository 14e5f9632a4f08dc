//! Loop-nest offload
//!
//! Moves data-parallel loop nests onto a device: scheduling, outlining,
//! launch generation, and the dual-path lowerer that falls back to
//! sequential lowering when the device path fails.
//!
//! [`OffloadContext`] carries the state shared by every attempt in a
//! compilation: the backend and runtime, the kernel keep-alive registry, the
//! unique-name counter, compile flags, diagnostics and the offload report.

pub mod analysis;
pub mod dual_path;
pub mod launch;
pub mod legalize;
pub mod outline;
pub mod races;
pub mod report;
pub mod scheduler;
pub mod shape_signature;

pub use dual_path::{DualPathLowerer, LoweringOutcome, LoweringResult};
pub use launch::{LaunchOp, LaunchSequence};
pub use outline::{KernelOutliner, OutlinedKernel};
pub use report::OffloadReport;
pub use shape_signature::ShapeSignature;

use crate::codegen::backend::{CompileFlags, DeviceRuntime, KernelBackend};
use crate::codegen::interpreter::Executor;
use crate::codegen::keep_alive::KernelKeepAlive;
use crate::config::OffloadConfig;
use crate::error::LoweringError;
use crate::ir::rename::UniqueNames;
use crate::ir::{FunctionDescriptor, IrFunction, LoopNestId};
use diagnostics::Diagnostics;
use log::debug;
use std::rc::Rc;
use std::sync::Arc;

/// State shared by every offload attempt of a compilation
pub struct OffloadContext {
    config: OffloadConfig,
    backend: Rc<dyn KernelBackend>,
    runtime: Rc<dyn DeviceRuntime>,
    keep_alive: Arc<KernelKeepAlive>,
    names: UniqueNames,
    flags: CompileFlags,
    diagnostics: Diagnostics,
    report: OffloadReport,
    kernels: Vec<OutlinedKernel>,
}

impl OffloadContext {
    pub fn new(
        config: OffloadConfig,
        backend: Rc<dyn KernelBackend>,
        runtime: Rc<dyn DeviceRuntime>,
    ) -> Self {
        Self {
            config,
            backend,
            runtime,
            keep_alive: Arc::new(KernelKeepAlive::new()),
            names: UniqueNames::new(),
            flags: CompileFlags::default(),
            diagnostics: Diagnostics::new(),
            report: OffloadReport::new(),
            kernels: Vec::new(),
        }
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn runtime(&self) -> &dyn DeviceRuntime {
        self.runtime.as_ref()
    }

    pub fn keep_alive(&self) -> &KernelKeepAlive {
        &self.keep_alive
    }

    pub fn flags(&self) -> CompileFlags {
        self.flags
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn report(&self) -> &OffloadReport {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut OffloadReport {
        &mut self.report
    }

    /// Kernels outlined by attempts that were kept.
    pub fn kernels(&self) -> &[OutlinedKernel] {
        &self.kernels
    }

    /// Drop kernels recorded after the first `len` (rolled-back attempt).
    pub(crate) fn truncate_kernels(&mut self, len: usize) {
        self.kernels.truncate(len);
    }

    pub fn device_identity(&self) -> String {
        self.runtime.device_identity()
    }

    /// Executor running launch sequences on this context's device.
    pub fn executor(&self) -> Executor<'_> {
        Executor::with_device(self.runtime.as_ref(), &self.keep_alive)
    }

    /// Outline loop nest `id` of `func`, compile it and build the host-side
    /// launch sequence replacing it.
    pub fn lower_loop_nest_to_device(
        &mut self,
        desc: &FunctionDescriptor,
        func: &mut IrFunction,
        id: LoopNestId,
    ) -> Result<LaunchSequence, LoweringError> {
        let mut outliner = KernelOutliner {
            backend: self.backend.as_ref(),
            names: &mut self.names,
            diagnostics: &mut self.diagnostics,
            flags: &mut self.flags,
            dump_ir: self.config.dump_ir,
        };
        let outlined = outliner.outline(desc, func, id)?;

        let nest = func
            .loop_nests
            .get(id)
            .ok_or_else(|| LoweringError::InvalidIr(format!("unknown loop nest {}", id)))?;
        let signature = shape_signature::build_shape_signature(
            &outlined.host_args,
            outlined.num_inputs,
            &desc.typemap,
            &nest.shape_classes,
            &outlined.races,
        );
        let launch = launch::generate_launch(&outlined, nest, signature, &self.keep_alive)?;

        if self.config.offload_diagnostics {
            let device = self.runtime.device_identity();
            self.report
                .record_loop_nest(&desc.qualified_name, id, &outlined.kernel_name, &device);
        }
        debug!(
            "{} of {} lowered to a launch of {}",
            id, desc.qualified_name, outlined.kernel_name
        );
        self.kernels.push(outlined);
        Ok(launch)
    }
}
