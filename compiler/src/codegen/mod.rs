/// Code generation for offloaded kernels
///
/// This module contains the device-facing side of the lowering core:
/// - Backend and runtime traits the lowering core talks to
/// - Keep-alive registry for compiled kernels
/// - Interpreter executing lowered functions and launch sequences
/// - Host reference device implementing both traits
pub mod backend;
pub mod host_device;
pub mod interpreter;
pub mod keep_alive;

pub use backend::{CompileFlags, CompiledKernel, DeviceRuntime, KernelBackend};
pub use host_device::{HostDeviceBackend, HostDeviceRuntime};
pub use interpreter::{Executor, NdArray, Value};
pub use keep_alive::{KernelHandle, KernelKeepAlive};
