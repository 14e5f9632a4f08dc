//! Offload report
//!
//! Records where each loop nest ended up. Filled only when offload
//! diagnostics are enabled in the configuration.

use crate::ir::LoopNestId;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt::Write;

/// One offloaded loop nest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffloadedLoop {
    pub function: String,
    pub loop_nest: LoopNestId,
    pub kernel: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffloadReport {
    pub loops: Vec<OffloadedLoop>,

    /// Device of every function lowered through the device path
    pub kernels: IndexMap<String, String>,

    /// Functions that fell back to sequential lowering, with the cause
    pub fallbacks: IndexMap<String, String>,
}

impl OffloadReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty() && self.kernels.is_empty() && self.fallbacks.is_empty()
    }

    pub fn record_loop_nest(&mut self, function: &str, loop_nest: LoopNestId, kernel: &str, device: &str) {
        self.loops.push(OffloadedLoop {
            function: function.to_string(),
            loop_nest,
            kernel: kernel.to_string(),
            device: device.to_string(),
        });
    }

    pub fn record_function(&mut self, function: &str, device: &str) {
        self.kernels.insert(function.to_string(), device.to_string());
    }

    pub fn record_fallback(&mut self, function: &str, cause: &str) {
        // A later successful attempt supersedes an old device entry
        self.kernels.shift_remove(function);
        self.fallbacks.insert(function.to_string(), cause.to_string());
    }

    /// Loop nests dropped by a rollback of `function`.
    pub fn discard_loops_of(&mut self, function: &str) {
        self.loops.retain(|l| l.function != function);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for l in &self.loops {
            let _ = writeln!(
                out,
                "{} {}: offloaded to {} as {}",
                l.function, l.loop_nest, l.device, l.kernel
            );
        }
        for (function, device) in &self.kernels {
            let _ = writeln!(out, "{}: kernel device {}", function, device);
        }
        for (function, cause) in &self.fallbacks {
            let _ = writeln!(out, "{}: sequential fallback ({})", function, cause);
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_replaces_device_entries() {
        let mut report = OffloadReport::new();
        report.record_loop_nest("f", LoopNestId(0), "__offload_loop_kernel_0", "host");
        report.record_function("f", "host");
        report.discard_loops_of("f");
        report.record_fallback("f", "boom");

        assert!(report.loops.is_empty());
        assert!(report.kernels.is_empty());
        assert_eq!(report.render(), "f: sequential fallback (boom)\n");

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["fallbacks"]["f"], "boom");
    }
}
