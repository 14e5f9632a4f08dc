//! Registry keeping compiled kernels alive.
//!
//! Launch code refers to kernels through a [`KernelHandle`]; the registry
//! holds the only strong reference across the launch boundary. Entries are
//! never evicted.

use super::backend::CompiledKernel;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Index of a kernel inside a [`KernelKeepAlive`] registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelHandle(pub usize);

/// Process-lifetime list of compiled kernels
#[derive(Debug, Default)]
pub struct KernelKeepAlive {
    kernels: Mutex<Vec<Arc<CompiledKernel>>>,
}

impl KernelKeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<CompiledKernel>>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.kernels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retain `kernel` and return the handle launch code should hold.
    pub fn retain(&self, kernel: Arc<CompiledKernel>) -> KernelHandle {
        let mut kernels = self.lock();
        kernels.push(kernel);
        KernelHandle(kernels.len() - 1)
    }

    pub fn get(&self, handle: KernelHandle) -> Option<Arc<CompiledKernel>> {
        self.lock().get(handle.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names of every retained kernel, in retention order.
    pub fn kernel_names(&self) -> Vec<String> {
        self.lock().iter().map(|k| k.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::backend::CompileFlags;
    use crate::lowering::LoweredFunction;

    fn kernel(name: &str) -> Arc<CompiledKernel> {
        Arc::new(CompiledKernel {
            name: name.to_string(),
            param_names: vec![],
            param_types: vec![],
            flags: CompileFlags::default(),
            program: LoweredFunction::empty(name),
        })
    }

    #[test]
    fn test_retain_keeps_kernel_alive() {
        let registry = KernelKeepAlive::new();
        let k = kernel("k0");
        let weak = Arc::downgrade(&k);
        let handle = registry.retain(k);

        assert!(weak.upgrade().is_some());
        assert_eq!(registry.get(handle).unwrap().name, "k0");
        assert_eq!(registry.kernel_names(), vec!["k0".to_string()]);
        assert!(registry.get(KernelHandle(5)).is_none());
    }
}
