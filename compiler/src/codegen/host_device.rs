//! Reference device running kernels on the host
//!
//! `HostDeviceBackend` "compiles" a kernel by lowering its IR with the
//! sequential strategy; `HostDeviceRuntime` keeps device copies of array
//! arguments and runs the kernel once per work-item of the launch range.
//! Both can be told to fail, which is how fallback is exercised.

use super::backend::{
    BackendError, CompileFlags, CompiledKernel, DeviceBuffer, DeviceError, DeviceRuntime,
    KernelArgBuffer, KernelArgValue, KernelBackend, LaunchRange, QueueHandle,
};
use super::interpreter::{Executor, NdArray, Value};
use crate::ir::{AddressSpace, FunctionDescriptor, IrFunction, IrType, TypeMap};
use crate::lowering::Lowerer;
use crate::offload::launch::expanded_slot_count;
use log::{debug, trace};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Kernel backend lowering kernels for host execution
#[derive(Debug, Default)]
pub struct HostDeviceBackend {
    failure: Option<String>,
}

impl HostDeviceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose every compilation fails with `reason`.
    pub fn with_failure(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
        }
    }
}

impl KernelBackend for HostDeviceBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn compile(
        &self,
        kernel: &IrFunction,
        typemap: &TypeMap,
        param_types: &[IrType],
        addrspaces: &[Option<AddressSpace>],
        flags: CompileFlags,
    ) -> Result<Arc<CompiledKernel>, BackendError> {
        let failed = |reason: String| BackendError::Compilation {
            kernel: kernel.name.clone(),
            reason,
        };
        if let Some(reason) = &self.failure {
            return Err(failed(reason.clone()));
        }
        if param_types.len() != kernel.arg_names.len() || addrspaces.len() != kernel.arg_names.len() {
            return Err(failed(format!(
                "{} parameters, {} types, {} address spaces",
                kernel.arg_names.len(),
                param_types.len(),
                addrspaces.len()
            )));
        }
        for ((name, ty), space) in kernel.arg_names.iter().zip(param_types).zip(addrspaces) {
            if let (IrType::Array(_), Some(space)) = (ty, space) {
                if *space != AddressSpace::Global {
                    return Err(BackendError::UnsupportedAddressSpace {
                        arg: name.clone(),
                        addrspace: *space,
                    });
                }
            }
        }

        let mut desc = FunctionDescriptor::new(kernel.name.clone(), typemap.clone());
        desc.arg_types = param_types.to_vec();
        let mut ir = kernel.clone();
        let program = Lowerer::sequential()
            .lower_function(&desc, &mut ir)
            .map_err(|e| failed(e.to_string()))?;
        debug!(
            "host backend compiled {} ({} blocks, noalias={})",
            kernel.name,
            program.blocks.len(),
            flags.noalias
        );

        Ok(Arc::new(CompiledKernel {
            name: kernel.name.clone(),
            param_names: kernel.arg_names.clone(),
            param_types: param_types.to_vec(),
            flags,
            program,
        }))
    }
}

/// Device copy of an array's storage
#[derive(Debug)]
struct DeviceArray {
    queue: QueueHandle,
    offset: usize,
    storage: std::rc::Rc<RefCell<Vec<Value>>>,
}

/// Device runtime executing kernels on the host
#[derive(Debug)]
pub struct HostDeviceRuntime {
    identity: String,
    next_queue: Cell<u64>,
    open_queues: RefCell<BTreeSet<u64>>,
    buffers: RefCell<Vec<Option<DeviceArray>>>,
    launches: Cell<usize>,
    enqueue_failure: Option<String>,
}

impl Default for HostDeviceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDeviceRuntime {
    pub fn new() -> Self {
        Self {
            identity: "host:cpu:0".to_string(),
            next_queue: Cell::new(0),
            open_queues: RefCell::new(BTreeSet::new()),
            buffers: RefCell::new(Vec::new()),
            launches: Cell::new(0),
            enqueue_failure: None,
        }
    }

    /// Runtime whose every enqueue fails with `reason`.
    pub fn with_enqueue_failure(reason: impl Into<String>) -> Self {
        Self {
            enqueue_failure: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Queues acquired and not yet freed.
    pub fn open_queue_count(&self) -> usize {
        self.open_queues.borrow().len()
    }

    /// Kernels enqueued so far.
    pub fn launch_count(&self) -> usize {
        self.launches.get()
    }

    fn check_queue(&self, queue: QueueHandle) -> Result<(), DeviceError> {
        if self.open_queues.borrow().contains(&queue.0) {
            Ok(())
        } else {
            Err(DeviceError::UnknownQueue(queue))
        }
    }

    fn device_view(&self, buffer: DeviceBuffer, like: &NdArray) -> Result<NdArray, DeviceError> {
        let buffers = self.buffers.borrow();
        let device = buffers
            .get(buffer.0)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        NdArray::from_parts(like.dtype, like.shape(), like.strides(), device.offset, device.storage.clone())
            .map_err(|e| DeviceError::InvalidArguments(e.to_string()))
    }

    /// Rebuild the kernel's arguments from the expanded slots.
    fn decode_args(&self, kernel: &CompiledKernel, args: &KernelArgBuffer) -> Result<Vec<Value>, DeviceError> {
        let expected: usize = kernel.param_types.iter().map(expanded_slot_count).sum();
        if expected != args.len() {
            return Err(DeviceError::InvalidArguments(format!(
                "{} expects {} slots, got {}",
                kernel.name,
                expected,
                args.len()
            )));
        }

        let mut values = Vec::with_capacity(kernel.param_types.len());
        let mut slots = args.slots().iter();
        for (name, ty) in kernel.param_names.iter().zip(&kernel.param_types) {
            let count = expanded_slot_count(ty);
            let group: Vec<&KernelArgValue> = slots.by_ref().take(count).collect();
            values.push(self.decode_arg(name, ty, &group)?);
        }
        Ok(values)
    }

    fn decode_arg(&self, name: &str, ty: &IrType, group: &[&KernelArgValue]) -> Result<Value, DeviceError> {
        let bad = |what: &str| DeviceError::InvalidArguments(format!("{}: {}", name, what));
        match (ty.scalar_from_0d(), group) {
            (_, [KernelArgValue::None, ..]) => Ok(Value::None),
            (IrType::Array(arr), [KernelArgValue::MemInfo, KernelArgValue::Parent, KernelArgValue::NItems(nitems), KernelArgValue::ItemSize(itemsize), KernelArgValue::Data(buffer), rest @ ..]) => {
                if rest.len() != 2 * arr.ndim || *itemsize == 0 {
                    return Err(bad("malformed array slots"));
                }
                let mut shape: SmallVec<[usize; 4]> = SmallVec::new();
                let mut strides: SmallVec<[isize; 4]> = SmallVec::new();
                for slot in &rest[..arr.ndim] {
                    match slot {
                        KernelArgValue::Shape(d) => shape.push(*d),
                        _ => return Err(bad("expected shape slot")),
                    }
                }
                for slot in &rest[arr.ndim..] {
                    match slot {
                        KernelArgValue::Stride(s) => strides.push(*s / *itemsize as isize),
                        _ => return Err(bad("expected stride slot")),
                    }
                }
                if shape.iter().product::<usize>() != *nitems {
                    return Err(bad("nitems does not match shape"));
                }
                let buffers = self.buffers.borrow();
                let device = buffers
                    .get(buffer.0)
                    .and_then(Option::as_ref)
                    .ok_or(DeviceError::UnknownBuffer(*buffer))?;
                NdArray::from_parts(arr.dtype, &shape, &strides, device.offset, device.storage.clone())
                    .map(Value::Array)
                    .map_err(|e| bad(&e.to_string()))
            }
            (IrType::Array(_), _) => Err(bad("expected array slots")),
            (_, [KernelArgValue::Scalar(v)]) => Ok(v.clone()),
            _ => Err(bad("expected one scalar slot")),
        }
    }
}

/// Every work-item coordinate of `range`, offsets applied.
fn work_items(range: &LaunchRange) -> Vec<SmallVec<[i64; 3]>> {
    let mut items = Vec::with_capacity(range.work_items());
    if range.extents.iter().any(|&e| e == 0) {
        return items;
    }
    let mut local: SmallVec<[usize; 3]> = SmallVec::from_elem(0, range.ndim());
    loop {
        items.push(
            local
                .iter()
                .zip(&range.offsets)
                .map(|(&l, &o)| o + l as i64)
                .collect(),
        );
        let mut axis = range.ndim();
        loop {
            if axis == 0 {
                return items;
            }
            axis -= 1;
            local[axis] += 1;
            if local[axis] < range.extents[axis] {
                break;
            }
            local[axis] = 0;
        }
    }
}

impl DeviceRuntime for HostDeviceRuntime {
    fn get_current_queue(&self) -> Result<QueueHandle, DeviceError> {
        let id = self.next_queue.get();
        self.next_queue.set(id + 1);
        self.open_queues.borrow_mut().insert(id);
        trace!("acquired queue {}", id);
        Ok(QueueHandle(id))
    }

    fn device_identity(&self) -> String {
        self.identity.clone()
    }

    fn copy_to_device(&self, queue: QueueHandle, array: &NdArray) -> Result<DeviceBuffer, DeviceError> {
        self.check_queue(queue)?;
        let storage = array.storage().borrow().clone();
        let mut buffers = self.buffers.borrow_mut();
        buffers.push(Some(DeviceArray {
            queue,
            offset: array.offset(),
            storage: std::rc::Rc::new(RefCell::new(storage)),
        }));
        Ok(DeviceBuffer(buffers.len() - 1))
    }

    fn copy_to_host(&self, queue: QueueHandle, buffer: DeviceBuffer, array: &NdArray) -> Result<(), DeviceError> {
        self.check_queue(queue)?;
        let view = self.device_view(buffer, array)?;
        array
            .copy_from(&view)
            .map_err(|e| DeviceError::InvalidArguments(e.to_string()))
    }

    fn enqueue(
        &self,
        queue: QueueHandle,
        kernel: &CompiledKernel,
        args: &KernelArgBuffer,
        range: &LaunchRange,
    ) -> Result<(), DeviceError> {
        self.check_queue(queue)?;
        if let Some(reason) = &self.enqueue_failure {
            return Err(DeviceError::KernelFailed(reason.clone()));
        }
        let values = self.decode_args(kernel, args)?;
        debug!(
            "enqueue {} over {:?} (offsets {:?})",
            kernel.name, range.extents, range.offsets
        );
        for ids in work_items(range) {
            Executor::with_global_ids(&ids)
                .call(&kernel.program, values.clone())
                .map_err(|e| DeviceError::KernelFailed(format!("{}: {}", kernel.name, e)))?;
        }
        self.launches.set(self.launches.get() + 1);
        Ok(())
    }

    fn free_queue(&self, queue: QueueHandle) {
        self.open_queues.borrow_mut().remove(&queue.0);
        for slot in self.buffers.borrow_mut().iter_mut() {
            if slot.as_ref().is_some_and(|b| b.queue == queue) {
                *slot = None;
            }
        }
        trace!("freed queue {}", queue.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, ScalarType};

    #[test]
    fn test_work_items_apply_offsets() {
        let range = LaunchRange {
            offsets: SmallVec::from_slice(&[2, 0]),
            extents: SmallVec::from_slice(&[2, 3]),
        };
        let items = work_items(&range);
        assert_eq!(items.len(), 6);
        assert_eq!(items[0].as_slice(), &[2, 0]);
        assert_eq!(items[5].as_slice(), &[3, 2]);
    }

    #[test]
    fn test_backend_rejects_local_arrays() {
        let mut b = IrBuilder::new("k");
        b.arg("a", IrType::array(ScalarType::F64, 1));
        b.ret(None);
        let (desc, func) = b.finish();
        let err = HostDeviceBackend::new()
            .compile(
                &func,
                &desc.typemap,
                &desc.arg_types,
                &[Some(AddressSpace::Local)],
                CompileFlags::default(),
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedAddressSpace { .. }));
    }

    #[test]
    fn test_buffers_die_with_their_queue() {
        let runtime = HostDeviceRuntime::new();
        let queue = runtime.get_current_queue().unwrap();
        let host = NdArray::from_f64(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        let buffer = runtime.copy_to_device(queue, &host).unwrap();

        runtime.device_view(buffer, &host).unwrap().set(&[0], &Value::Float(7.0)).unwrap();
        runtime.copy_to_host(queue, buffer, &host).unwrap();
        assert_eq!(host.to_f64_vec().unwrap(), vec![7.0, 2.0, 3.0]);

        runtime.free_queue(queue);
        assert_eq!(runtime.open_queue_count(), 0);
        assert!(runtime.copy_to_host(queue, buffer, &host).is_err());
    }
}
