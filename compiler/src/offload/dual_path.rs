//! Dual-path lowering
//!
//! Lowers a whole function with its loop nests routed through the device
//! path. If that attempt fails with a recoverable error, the function is
//! restored from a snapshot taken before the attempt and lowered again
//! sequentially. There is no third path: errors from the sequential retry
//! propagate unchanged.
//!
//! ```text
//!            ┌──────────────────┐  ok   ┌───────────────┐
//!  lower ──▶ │ attempting-device├──────▶│ device-lowered│
//!            └────────┬─────────┘       └───────────────┘
//!                     │ recoverable error
//!                     ▼
//!            restore snapshot ──▶ sequential ──▶ cpu-lowered
//! ```

use super::OffloadContext;
use crate::error::LoweringError;
use crate::ir::{FunctionDescriptor, FunctionSnapshot, IrFunction, IrSourceLocation};
use crate::lowering::{LoopNestStrategy, LoweredFunction, Lowerer};
use diagnostics::offload::OffloadDiagnostics;
use diagnostics::SourceSpan;
use log::warn;
use tracing::debug;

/// Terminal state of a dual-path lowering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoweringOutcome {
    /// Loop nests were replaced by kernel launches
    DeviceLowered { device: String },

    /// The device attempt failed; the function was lowered sequentially
    CpuLowered { cause: String },
}

impl LoweringOutcome {
    pub fn is_device(&self) -> bool {
        matches!(self, LoweringOutcome::DeviceLowered { .. })
    }
}

#[derive(Debug)]
pub struct LoweringResult {
    pub function: LoweredFunction,
    pub outcome: LoweringOutcome,
}

/// Result of the device attempt, before the fallback decision
#[derive(Debug)]
pub enum DeviceAttempt {
    Lowered(LoweredFunction),
    Fallback(LoweringError),
}

fn span_of(loc: IrSourceLocation) -> SourceSpan {
    SourceSpan::new(loc.file_id, loc.line, loc.column)
}

/// Lowers functions device-first with sequential fallback
pub struct DualPathLowerer<'c> {
    ctx: &'c mut OffloadContext,
}

impl<'c> DualPathLowerer<'c> {
    pub fn new(ctx: &'c mut OffloadContext) -> Self {
        Self { ctx }
    }

    /// Lower `func`, trying the device path first.
    ///
    /// On fallback `desc` and `func` are left exactly as they were on entry.
    pub fn lower(
        &mut self,
        desc: &mut FunctionDescriptor,
        func: &mut IrFunction,
    ) -> Result<LoweringResult, LoweringError> {
        let snapshot = FunctionSnapshot::capture(desc, func);
        let kernels_before = self.ctx.kernels().len();
        debug!(function = %desc.qualified_name, "attempting device lowering");

        let cause = match self.attempt_device(desc, func) {
            DeviceAttempt::Lowered(function) => {
                let device = self.ctx.device_identity();
                if self.ctx.config().offload_diagnostics {
                    self.ctx.report_mut().record_function(&desc.qualified_name, &device);
                }
                debug!(function = %desc.qualified_name, device = %device, "device lowered");
                return Ok(LoweringResult {
                    function,
                    outcome: LoweringOutcome::DeviceLowered { device },
                });
            }
            DeviceAttempt::Fallback(cause) => cause,
        };

        self.ctx.truncate_kernels(kernels_before);
        self.ctx.report_mut().discard_loops_of(&desc.qualified_name);
        snapshot.restore_into(desc, func);

        if !cause.is_recoverable() {
            debug!(function = %desc.qualified_name, "unsupported construct, not retrying");
            return Err(cause);
        }
        if !self.ctx.config().fallback_on_cpu {
            debug!(function = %desc.qualified_name, "fallback disabled");
            return Err(cause);
        }

        let device = self.ctx.device_identity();
        let debug_enabled = self.ctx.config().debug;
        let cause_text = cause.to_string();
        warn!(
            "Failed to offload loop nest in {} to {}: {}",
            desc.qualified_name, device, cause_text
        );
        if debug_enabled {
            log::debug!("device lowering failure: {:?}", cause);
        }
        self.ctx.diagnostics_mut().push(OffloadDiagnostics::offload_fallback(
            &device,
            &cause_text,
            debug_enabled,
            span_of(func.loc),
        ));
        if self.ctx.config().offload_diagnostics {
            self.ctx
                .report_mut()
                .record_fallback(&desc.qualified_name, &cause_text);
        }

        debug!(function = %desc.qualified_name, "relowering sequentially");
        let function = Lowerer::sequential().lower_function(desc, func)?;
        debug!(function = %desc.qualified_name, "cpu lowered");
        Ok(LoweringResult {
            function,
            outcome: LoweringOutcome::CpuLowered { cause: cause_text },
        })
    }

    /// Lower `func` with loop nests routed to the device.
    pub fn attempt_device(&mut self, desc: &FunctionDescriptor, func: &mut IrFunction) -> DeviceAttempt {
        match Lowerer::new(LoopNestStrategy::Device(&mut *self.ctx)).lower_function(desc, func) {
            Ok(function) => DeviceAttempt::Lowered(function),
            Err(e) => DeviceAttempt::Fallback(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::host_device::{HostDeviceBackend, HostDeviceRuntime};
    use crate::config::OffloadConfig;
    use crate::error::UnsupportedConstruct;
    use crate::ir::{IrBuilder, IrType, LoopBound, LoopDim, LoopNestId, ScalarType};
    use std::rc::Rc;

    fn copy_loop() -> (FunctionDescriptor, IrFunction) {
        let mut b = IrBuilder::new("copy");
        b.arg("a", IrType::array(ScalarType::F64, 1));
        b.arg("b", IrType::array(ScalarType::F64, 1));
        b.arg("n", IrType::i64());
        b.begin_loop_nest();
        b.get_item("$v", ScalarType::F64, "a", &["i"]);
        b.set_item("b", &["i"], "$v");
        let id = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))]);
        if let Some(nest) = b.loop_nest_mut(id) {
            nest.params = ["a", "b"].iter().map(|s| s.to_string()).collect();
        }
        b.ret(None);
        b.finish()
    }

    fn context(config: OffloadConfig, backend: HostDeviceBackend) -> OffloadContext {
        OffloadContext::new(config, Rc::new(backend), Rc::new(HostDeviceRuntime::new()))
    }

    #[test]
    fn test_device_success() {
        let config = OffloadConfig {
            offload_diagnostics: true,
            ..OffloadConfig::default()
        };
        let mut ctx = context(config, HostDeviceBackend::new());
        let (mut desc, mut func) = copy_loop();

        let result = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap();
        assert!(result.outcome.is_device());
        assert_eq!(result.function.launches().count(), 1);
        assert!(ctx.diagnostics().is_empty());
        assert_eq!(ctx.report().loops.len(), 1);
        assert_eq!(ctx.report().kernels.get("copy").map(String::as_str), Some("host:cpu:0"));
    }

    #[test]
    fn test_fallback_restores_ir() {
        let mut ctx = context(OffloadConfig::default(), HostDeviceBackend::with_failure("no device"));
        let (mut desc, mut func) = copy_loop();
        let (orig_desc, orig_func) = (desc.clone(), func.clone());

        let result = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap();
        assert!(matches!(result.outcome, LoweringOutcome::CpuLowered { .. }));
        assert!(result.function.launches().next().is_none());
        assert_eq!(desc, orig_desc);
        assert_eq!(func, orig_func);
        assert_eq!(ctx.diagnostics().len(), 1);
        assert!(ctx.kernels().is_empty());
    }

    #[test]
    fn test_fallback_disabled_propagates() {
        let config = OffloadConfig {
            fallback_on_cpu: false,
            ..OffloadConfig::default()
        };
        let mut ctx = context(config, HostDeviceBackend::with_failure("no device"));
        let (mut desc, mut func) = copy_loop();

        let err = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap_err();
        assert!(matches!(err, LoweringError::Backend(_)));
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_reduction_is_fatal() {
        let mut ctx = context(OffloadConfig::default(), HostDeviceBackend::new());
        let (mut desc, mut func) = copy_loop();
        if let Some(nest) = func.loop_nests.get_mut(LoopNestId(0)) {
            nest.reductions.push("acc".to_string());
        }

        let err = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap_err();
        assert!(matches!(
            err,
            LoweringError::Unsupported(UnsupportedConstruct::ReductionLoopNest { .. })
        ));
        assert!(ctx.diagnostics().is_empty());
    }
}
