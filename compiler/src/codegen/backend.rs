//! Device backend abstraction
//!
//! Two traits describe the downstream collaborators of the lowering core:
//! [`KernelBackend`] turns a finished kernel IR into a [`CompiledKernel`],
//! and [`DeviceRuntime`] provides queues, buffers and kernel enqueue.

use super::interpreter::NdArray;
use crate::ir::{AddressSpace, IrFunction, IrType, TypeMap};
use crate::lowering::LoweredFunction;
use crate::codegen::interpreter::Value;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Flags handed to the kernel backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileFlags {
    /// Parameters are known not to alias each other
    pub noalias: bool,

    pub debuginfo: bool,
}

/// Finished kernel produced by a backend.
///
/// Shared through `Arc`; launch code only holds a registry handle to it.
#[derive(Debug)]
pub struct CompiledKernel {
    pub name: String,

    /// Legal parameter names, in launch order
    pub param_names: Vec<String>,

    /// Parameter types with address spaces applied
    pub param_types: Vec<IrType>,

    pub flags: CompileFlags,

    /// Executable form of the kernel body
    pub program: LoweredFunction,
}

/// Errors raised by a kernel backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The backend rejected the kernel
    Compilation { kernel: String, reason: String },

    /// A parameter was tagged with an address space the backend cannot use
    UnsupportedAddressSpace { arg: String, addrspace: AddressSpace },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Compilation { kernel, reason } => {
                write!(f, "failed to compile {}: {}", kernel, reason)
            }
            BackendError::UnsupportedAddressSpace { arg, addrspace } => {
                write!(f, "argument {} cannot live in {} memory", arg, addrspace)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Compiles kernel IR for a device
pub trait KernelBackend {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Compile `kernel` with the given parameter types and address-space tags.
    fn compile(
        &self,
        kernel: &IrFunction,
        typemap: &TypeMap,
        param_types: &[IrType],
        addrspaces: &[Option<AddressSpace>],
        flags: CompileFlags,
    ) -> Result<Arc<CompiledKernel>, BackendError>;
}

/// Opaque device queue reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Device-side copy of an array argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer(pub usize);

/// Errors raised by a device runtime
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    NoQueue,
    UnknownQueue(QueueHandle),
    UnknownBuffer(DeviceBuffer),
    InvalidArguments(String),
    KernelFailed(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NoQueue => write!(f, "no device queue available"),
            DeviceError::UnknownQueue(q) => write!(f, "unknown queue {}", q.0),
            DeviceError::UnknownBuffer(b) => write!(f, "unknown device buffer {}", b.0),
            DeviceError::InvalidArguments(msg) => write!(f, "invalid kernel arguments: {}", msg),
            DeviceError::KernelFailed(msg) => write!(f, "kernel failed: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// One expanded kernel-argument slot
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArgValue {
    /// Value missing on the host; tolerated for slots the kernel never reads
    None,
    MemInfo,
    Parent,
    NItems(usize),
    ItemSize(usize),
    Data(DeviceBuffer),
    Shape(usize),
    /// Stride in bytes
    Stride(isize),
    Scalar(Value),
}

/// Kernel-argument buffer pre-sized to an exact slot count
#[derive(Debug, Clone)]
pub struct KernelArgBuffer {
    capacity: usize,
    slots: Vec<KernelArgValue>,
}

impl KernelArgBuffer {
    pub fn with_exact_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: KernelArgValue) -> Result<(), DeviceError> {
        if self.slots.len() >= self.capacity {
            return Err(DeviceError::InvalidArguments(format!(
                "argument buffer overflow: capacity {}",
                self.capacity
            )));
        }
        self.slots.push(value);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether every pre-sized slot has been filled.
    pub fn is_complete(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn slots(&self) -> &[KernelArgValue] {
        &self.slots
    }
}

/// Resolved launch range: one (offset, extent) pair per hardware axis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRange {
    pub offsets: SmallVec<[i64; 3]>,
    pub extents: SmallVec<[usize; 3]>,
}

impl LaunchRange {
    pub fn ndim(&self) -> usize {
        self.extents.len()
    }

    /// Total number of work-items.
    pub fn work_items(&self) -> usize {
        self.extents.iter().product()
    }
}

/// Queue and memory operations of a device
pub trait DeviceRuntime {
    fn get_current_queue(&self) -> Result<QueueHandle, DeviceError>;

    /// Human-readable device name
    fn device_identity(&self) -> String;

    fn copy_to_device(&self, queue: QueueHandle, array: &NdArray) -> Result<DeviceBuffer, DeviceError>;

    fn copy_to_host(
        &self,
        queue: QueueHandle,
        buffer: DeviceBuffer,
        array: &NdArray,
    ) -> Result<(), DeviceError>;

    fn enqueue(
        &self,
        queue: QueueHandle,
        kernel: &CompiledKernel,
        args: &KernelArgBuffer,
        range: &LaunchRange,
    ) -> Result<(), DeviceError>;

    fn free_queue(&self, queue: QueueHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_buffer_is_exact() {
        let mut buffer = KernelArgBuffer::with_exact_capacity(2);
        buffer.push(KernelArgValue::MemInfo).unwrap();
        assert!(!buffer.is_complete());
        buffer.push(KernelArgValue::Parent).unwrap();
        assert!(buffer.is_complete());
        assert!(buffer.push(KernelArgValue::None).is_err());
    }

    #[test]
    fn test_launch_range_work_items() {
        let range = LaunchRange {
            offsets: SmallVec::from_slice(&[0, 2]),
            extents: SmallVec::from_slice(&[4, 3]),
        };
        assert_eq!(range.ndim(), 2);
        assert_eq!(range.work_items(), 12);
    }
}
