//! Reference executor for lowered functions
//!
//! Runs a [`LoweredFunction`] over a name-keyed environment. Used for host
//! code (including the launch sequences that replace offloaded loop nests)
//! and, through the host device, for kernel bodies.
//!
//! ## Semantics
//! - Integer arithmetic wraps; `//` and `%` round toward negative infinity
//! - `/` always produces a float
//! - Arrays are strided views over shared storage: copying a `Value::Array`
//!   aliases, `NdArray::deep_copy` does not

use super::backend::{
    DeviceBuffer, DeviceError, DeviceRuntime, KernelArgBuffer, KernelArgValue, LaunchRange,
    QueueHandle,
};
use super::keep_alive::KernelKeepAlive;
use crate::ir::{BinaryOp, CompareOp, IrExpr, IrType, IrValue, LoopBound, ScalarType, UnaryOp};
use crate::lowering::{LoweredFunction, LoweredInst, LoweredTerminator};
use crate::offload::launch::{LaunchArg, LaunchOp, LaunchSequence};
use fxhash::FxHashMap;
use log::{debug, trace};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Variable bindings of one activation
pub type Env = FxHashMap<String, Value>;

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Array(NdArray),
}

impl Value {
    pub fn as_i64(&self) -> Result<i64, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b as i64),
            Value::Int(i) => Ok(*i),
            Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            other => Err(ExecError::TypeError(format!("expected integer, got {}", other))),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b as i64 as f64),
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(ExecError::TypeError(format!("expected number, got {}", other))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            other => Err(ExecError::TypeError(format!("expected bool, got {}", other))),
        }
    }

    pub fn as_array(&self) -> Result<&NdArray, ExecError> {
        match self {
            Value::Array(arr) => Ok(arr),
            other => Err(ExecError::TypeError(format!("expected array, got {}", other))),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    /// Convert a scalar to the representation used for `dtype`.
    pub fn cast(&self, dtype: ScalarType) -> Result<Value, ExecError> {
        Ok(match dtype {
            ScalarType::Bool => Value::Bool(self.as_bool()?),
            ScalarType::I32 | ScalarType::I64 | ScalarType::Uintp => match self {
                Value::Float(f) => Value::Int(f.trunc() as i64),
                other => Value::Int(other.as_i64()?),
            },
            ScalarType::F32 | ScalarType::F64 => Value::Float(self.as_f64()?),
        })
    }

    /// Zero of `dtype`.
    pub fn zero(dtype: ScalarType) -> Value {
        match dtype {
            ScalarType::Bool => Value::Bool(false),
            ScalarType::F32 | ScalarType::F64 => Value::Float(0.0),
            _ => Value::Int(0),
        }
    }
}

impl From<&IrValue> for Value {
    fn from(v: &IrValue) -> Self {
        match v {
            IrValue::None => Value::None,
            IrValue::Bool(b) => Value::Bool(*b),
            IrValue::Int(i) => Value::Int(*i),
            IrValue::Float(f) => Value::Float(*f),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Array(arr) => write!(f, "array({}, shape={:?})", arr.dtype, arr.shape()),
        }
    }
}

/// Strided n-dimensional array over shared element storage
#[derive(Debug, Clone)]
pub struct NdArray {
    pub dtype: ScalarType,
    shape: SmallVec<[usize; 4]>,
    /// Strides in elements
    strides: SmallVec<[isize; 4]>,
    offset: usize,
    data: Rc<RefCell<Vec<Value>>>,
}

fn contiguous_strides(shape: &[usize]) -> SmallVec<[isize; 4]> {
    let mut strides: SmallVec<[isize; 4]> = SmallVec::from_elem(1, shape.len());
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1] as isize;
    }
    strides
}

impl NdArray {
    /// C-contiguous array; element values are cast to `dtype`.
    pub fn from_vec(dtype: ScalarType, shape: &[usize], data: Vec<Value>) -> Result<Self, ExecError> {
        let nitems: usize = shape.iter().product();
        if data.len() != nitems {
            return Err(ExecError::TypeError(format!(
                "{} elements do not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let data = data
            .iter()
            .map(|v| v.cast(dtype))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dtype,
            shape: SmallVec::from_slice(shape),
            strides: contiguous_strides(shape),
            offset: 0,
            data: Rc::new(RefCell::new(data)),
        })
    }

    pub fn from_f64(shape: &[usize], data: Vec<f64>) -> Result<Self, ExecError> {
        Self::from_vec(ScalarType::F64, shape, data.into_iter().map(Value::Float).collect())
    }

    pub fn zeros(dtype: ScalarType, shape: &[usize]) -> Self {
        let nitems: usize = shape.iter().product();
        Self {
            dtype,
            shape: SmallVec::from_slice(shape),
            strides: contiguous_strides(shape),
            offset: 0,
            data: Rc::new(RefCell::new(vec![Value::zero(dtype); nitems])),
        }
    }

    /// One-element 1-d array holding `value`.
    pub fn from_scalar(dtype: ScalarType, value: &Value) -> Result<Self, ExecError> {
        Self::from_vec(dtype, &[1], vec![value.clone()])
    }

    /// View over existing storage.
    pub fn from_parts(
        dtype: ScalarType,
        shape: &[usize],
        strides: &[isize],
        offset: usize,
        data: Rc<RefCell<Vec<Value>>>,
    ) -> Result<Self, ExecError> {
        if shape.len() != strides.len() {
            return Err(ExecError::TypeError(format!(
                "shape {:?} and strides {:?} differ in rank",
                shape, strides
            )));
        }
        Ok(Self {
            dtype,
            shape: SmallVec::from_slice(shape),
            strides: SmallVec::from_slice(strides),
            offset,
            data,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn nitems(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn itemsize(&self) -> usize {
        self.dtype.byte_size()
    }

    pub fn storage(&self) -> Rc<RefCell<Vec<Value>>> {
        Rc::clone(&self.data)
    }

    /// Whether both arrays view the same storage.
    pub fn shares_storage(&self, other: &NdArray) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    fn flat_index(&self, index: &[i64]) -> Result<usize, ExecError> {
        if index.len() != self.ndim() {
            return Err(ExecError::IndexOutOfBounds(format!(
                "{}-d index into {}-d array",
                index.len(),
                self.ndim()
            )));
        }
        let mut flat = self.offset as isize;
        for (axis, &i) in index.iter().enumerate() {
            let dim = self.shape[axis] as i64;
            let wrapped = if i < 0 { i + dim } else { i };
            if wrapped < 0 || wrapped >= dim {
                return Err(ExecError::IndexOutOfBounds(format!(
                    "index {} out of bounds for axis {} with size {}",
                    i, axis, dim
                )));
            }
            flat += wrapped as isize * self.strides[axis];
        }
        Ok(flat as usize)
    }

    pub fn get(&self, index: &[i64]) -> Result<Value, ExecError> {
        let flat = self.flat_index(index)?;
        self.data
            .borrow()
            .get(flat)
            .cloned()
            .ok_or_else(|| ExecError::IndexOutOfBounds(format!("element {} outside storage", flat)))
    }

    pub fn set(&self, index: &[i64], value: &Value) -> Result<(), ExecError> {
        let flat = self.flat_index(index)?;
        let value = value.cast(self.dtype)?;
        let mut data = self.data.borrow_mut();
        let slot = data
            .get_mut(flat)
            .ok_or_else(|| ExecError::IndexOutOfBounds(format!("element {} outside storage", flat)))?;
        *slot = value;
        Ok(())
    }

    /// Every logical index in C order.
    fn indices(&self) -> Vec<SmallVec<[i64; 4]>> {
        let mut out = Vec::with_capacity(self.nitems());
        if self.shape.iter().any(|&d| d == 0) {
            return out;
        }
        let mut current: SmallVec<[i64; 4]> = SmallVec::from_elem(0, self.ndim());
        loop {
            out.push(current.clone());
            let mut axis = self.ndim();
            loop {
                if axis == 0 {
                    return out;
                }
                axis -= 1;
                current[axis] += 1;
                if (current[axis] as usize) < self.shape[axis] {
                    break;
                }
                current[axis] = 0;
            }
        }
    }

    /// Elements in logical C order.
    pub fn to_vec(&self) -> Result<Vec<Value>, ExecError> {
        self.indices().iter().map(|idx| self.get(idx)).collect()
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>, ExecError> {
        self.to_vec()?.iter().map(Value::as_f64).collect()
    }

    /// Element-wise copy from an array of the same shape.
    pub fn copy_from(&self, other: &NdArray) -> Result<(), ExecError> {
        if self.shape != other.shape {
            return Err(ExecError::TypeError(format!(
                "cannot copy shape {:?} into {:?}",
                other.shape(),
                self.shape()
            )));
        }
        let values = other.to_vec()?;
        for (idx, v) in self.indices().iter().zip(values.iter()) {
            self.set(idx, v)?;
        }
        Ok(())
    }

    /// Contiguous copy with its own storage.
    pub fn deep_copy(&self) -> Result<NdArray, ExecError> {
        NdArray::from_vec(self.dtype, &self.shape, self.to_vec()?)
    }
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && match (self.to_vec(), other.to_vec()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
    }
}

/// Errors raised while executing lowered code
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    UnboundVariable(String),
    BlockNotFound(u32),
    TypeError(String),
    IndexOutOfBounds(String),
    ZeroDivision,
    /// Launch range dimension does not step by 1
    NonUnitStep { index_variable: String, step: i64 },
    /// A launch sequence ran without a device runtime
    NoDevice,
    UnknownKernel(usize),
    Marshal(String),
    Device(DeviceError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::UnboundVariable(name) => write!(f, "Unbound variable: {}", name),
            ExecError::BlockNotFound(id) => write!(f, "Block not found: {}", id),
            ExecError::TypeError(msg) => write!(f, "Type error: {}", msg),
            ExecError::IndexOutOfBounds(msg) => write!(f, "Index error: {}", msg),
            ExecError::ZeroDivision => write!(f, "Division by zero"),
            ExecError::NonUnitStep {
                index_variable,
                step,
            } => write!(f, "Launch dimension {} steps by {}", index_variable, step),
            ExecError::NoDevice => write!(f, "No device runtime available for kernel launch"),
            ExecError::UnknownKernel(handle) => write!(f, "Unknown kernel handle {}", handle),
            ExecError::Marshal(msg) => write!(f, "Argument marshaling failed: {}", msg),
            ExecError::Device(e) => write!(f, "Device error: {}", e),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for ExecError {
    fn from(e: DeviceError) -> Self {
        ExecError::Device(e)
    }
}

fn floor_div_i64(a: i64, b: i64) -> Result<i64, ExecError> {
    if b == 0 {
        return Err(ExecError::ZeroDivision);
    }
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn rem_i64(a: i64, b: i64) -> Result<i64, ExecError> {
    if b == 0 {
        return Err(ExecError::ZeroDivision);
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn eval_binop(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
    if op == BinaryOp::Div {
        let b = rhs.as_f64()?;
        if b == 0.0 {
            return Err(ExecError::ZeroDivision);
        }
        return Ok(Value::Float(lhs.as_f64()? / b));
    }
    if lhs.is_float() || rhs.is_float() {
        let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
        let r = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::FloorDiv | BinaryOp::Rem if b == 0.0 => return Err(ExecError::ZeroDivision),
            BinaryOp::FloorDiv => (a / b).floor(),
            BinaryOp::Rem => a - b * (a / b).floor(),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Div => unreachable!("handled above"),
        };
        return Ok(Value::Float(r));
    }
    let (a, b) = (lhs.as_i64()?, rhs.as_i64()?);
    let r = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::FloorDiv => floor_div_i64(a, b)?,
        BinaryOp::Rem => rem_i64(a, b)?,
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Div => unreachable!("handled above"),
    };
    Ok(Value::Int(r))
}

fn eval_unop(op: UnaryOp, operand: &Value) -> Result<Value, ExecError> {
    match (op, operand) {
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (UnaryOp::Abs, Value::Int(i)) => Ok(Value::Int(i.wrapping_abs())),
        _ => {
            let x = operand.as_f64()?;
            Ok(Value::Float(match op {
                UnaryOp::Neg => -x,
                UnaryOp::Abs => x.abs(),
                UnaryOp::Sqrt => x.sqrt(),
                UnaryOp::Exp => x.exp(),
                UnaryOp::Log => x.ln(),
                UnaryOp::Sin => x.sin(),
                UnaryOp::Cos => x.cos(),
            }))
        }
    }
}

fn eval_cmp(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, ExecError> {
    let ordering = if lhs.is_float() || rhs.is_float() {
        lhs.as_f64()?.partial_cmp(&rhs.as_f64()?)
    } else {
        Some(lhs.as_i64()?.cmp(&rhs.as_i64()?))
    };
    // NaN compares unequal to everything
    let Some(ordering) = ordering else {
        return Ok(op == CompareOp::Ne);
    };
    Ok(match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    })
}

fn lookup<'e>(env: &'e Env, name: &str) -> Result<&'e Value, ExecError> {
    env.get(name)
        .ok_or_else(|| ExecError::UnboundVariable(name.to_string()))
}

fn eval_bound(env: &Env, bound: &LoopBound) -> Result<i64, ExecError> {
    match bound {
        LoopBound::Const(c) => Ok(*c),
        LoopBound::Var(name) => lookup(env, name)?.as_i64(),
    }
}

/// Releases an acquired queue on every exit path of a launch
struct QueueGuard<'r> {
    runtime: &'r dyn DeviceRuntime,
    queue: QueueHandle,
    released: bool,
}

impl QueueGuard<'_> {
    fn release(&mut self) {
        if !self.released {
            self.runtime.free_queue(self.queue);
            self.released = true;
        }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Device copy of one launch argument
struct StagedArray {
    arg: usize,
    buffer: DeviceBuffer,
    host: NdArray,
}

/// Executes lowered functions
pub struct Executor<'a> {
    device: Option<(&'a dyn DeviceRuntime, &'a KernelKeepAlive)>,
    global_ids: SmallVec<[i64; 3]>,
}

impl<'a> Executor<'a> {
    /// Executor without a device; launch sequences fail with `NoDevice`.
    pub fn new() -> Self {
        Self {
            device: None,
            global_ids: SmallVec::new(),
        }
    }

    /// Executor able to run launch sequences on `runtime`.
    pub fn with_device(runtime: &'a dyn DeviceRuntime, keep_alive: &'a KernelKeepAlive) -> Self {
        Self {
            device: Some((runtime, keep_alive)),
            global_ids: SmallVec::new(),
        }
    }

    /// Executor for one work-item of a kernel.
    pub fn with_global_ids(ids: &[i64]) -> Self {
        Self {
            device: None,
            global_ids: SmallVec::from_slice(ids),
        }
    }

    /// Bind `args` to the function's parameters and run it.
    pub fn call(&self, func: &LoweredFunction, args: Vec<Value>) -> Result<Value, ExecError> {
        let mut env = self.bind_args(func, args)?;
        self.run(func, &mut env)
    }

    /// Like [`Executor::call`], also returning the final environment.
    pub fn call_with_env(
        &self,
        func: &LoweredFunction,
        args: Vec<Value>,
    ) -> Result<(Value, Env), ExecError> {
        let mut env = self.bind_args(func, args)?;
        let result = self.run(func, &mut env)?;
        Ok((result, env))
    }

    fn bind_args(&self, func: &LoweredFunction, args: Vec<Value>) -> Result<Env, ExecError> {
        if args.len() != func.arg_names.len() {
            return Err(ExecError::TypeError(format!(
                "{} expects {} arguments, got {}",
                func.name,
                func.arg_names.len(),
                args.len()
            )));
        }
        Ok(func.arg_names.iter().cloned().zip(args).collect())
    }

    /// Run `func` over an existing environment.
    pub fn run(&self, func: &LoweredFunction, env: &mut Env) -> Result<Value, ExecError> {
        let mut label = func.entry;
        loop {
            let block = func
                .blocks
                .get(&label)
                .ok_or(ExecError::BlockNotFound(label))?;
            for inst in &block.instructions {
                self.exec_inst(inst, env)?;
            }
            match &block.terminator {
                LoweredTerminator::Jump(target) => label = *target,
                LoweredTerminator::Branch {
                    condition,
                    true_target,
                    false_target,
                } => {
                    label = if lookup(env, condition)?.as_bool()? {
                        *true_target
                    } else {
                        *false_target
                    };
                }
                LoweredTerminator::Return(value) => {
                    return match value {
                        Some(name) => lookup(env, name).cloned(),
                        None => Ok(Value::None),
                    };
                }
            }
        }
    }

    fn exec_inst(&self, inst: &LoweredInst, env: &mut Env) -> Result<(), ExecError> {
        match inst {
            LoweredInst::Assign { target, value } => {
                let v = self.eval(value, env)?;
                env.insert(target.clone(), v);
            }
            LoweredInst::SetItem {
                target,
                index,
                value,
            } => {
                let idx = index
                    .iter()
                    .map(|i| lookup(env, i)?.as_i64())
                    .collect::<Result<SmallVec<[i64; 4]>, _>>()?;
                let v = lookup(env, value)?.clone();
                lookup(env, target)?.as_array()?.set(&idx, &v)?;
            }
            LoweredInst::Del { var } => {
                env.remove(var);
            }
            LoweredInst::Launch(seq) => self.exec_launch(seq, env)?,
        }
        Ok(())
    }

    fn eval(&self, expr: &IrExpr, env: &Env) -> Result<Value, ExecError> {
        match expr {
            IrExpr::Const(v) => Ok(Value::from(v)),
            IrExpr::Var(name) => lookup(env, name).cloned(),
            IrExpr::BinOp { op, lhs, rhs } => eval_binop(*op, lookup(env, lhs)?, lookup(env, rhs)?),
            IrExpr::UnOp { op, operand } => eval_unop(*op, lookup(env, operand)?),
            IrExpr::Cmp { op, lhs, rhs } => {
                eval_cmp(*op, lookup(env, lhs)?, lookup(env, rhs)?).map(Value::Bool)
            }
            IrExpr::GetItem { array, index } => {
                let idx = index
                    .iter()
                    .map(|i| lookup(env, i)?.as_i64())
                    .collect::<Result<SmallVec<[i64; 4]>, _>>()?;
                lookup(env, array)?.as_array()?.get(&idx)
            }
            IrExpr::GlobalId { axis } => self
                .global_ids
                .get(*axis as usize)
                .copied()
                .map(Value::Int)
                .ok_or_else(|| {
                    ExecError::TypeError(format!("no global id for axis {} outside a kernel", axis))
                }),
        }
    }

    /// Run the host side of a kernel launch.
    fn exec_launch(&self, seq: &LaunchSequence, env: &mut Env) -> Result<(), ExecError> {
        let (runtime, keep_alive) = self.device.ok_or(ExecError::NoDevice)?;
        let kernel = keep_alive
            .get(seq.kernel)
            .ok_or(ExecError::UnknownKernel(seq.kernel.0))?;
        let desc = &seq.descriptor;
        debug!("Launching {} ({} args)", desc.kernel_name, desc.args.len());

        let mut queue: Option<QueueGuard<'_>> = None;
        let mut args: Option<KernelArgBuffer> = None;
        let mut range: Option<LaunchRange> = None;
        let mut staged: Vec<StagedArray> = Vec::new();

        for op in &seq.ops {
            trace!("launch op {:?}", op);
            match op {
                LaunchOp::AcquireQueue => {
                    queue = Some(QueueGuard {
                        runtime,
                        queue: runtime.get_current_queue()?,
                        released: false,
                    });
                }
                LaunchOp::AllocateArgs { count } => {
                    args = Some(KernelArgBuffer::with_exact_capacity(*count));
                }
                LaunchOp::SetArg { arg } => {
                    let q = queue.as_ref().ok_or(ExecError::Device(DeviceError::NoQueue))?.queue;
                    let buffer = args
                        .as_mut()
                        .ok_or_else(|| ExecError::Marshal("argument buffer not allocated".into()))?;
                    let launch_arg = desc
                        .args
                        .get(*arg)
                        .ok_or_else(|| ExecError::Marshal(format!("no launch argument {}", arg)))?;
                    if let Some(array) = marshal_arg(runtime, q, launch_arg, env, buffer)? {
                        staged.push(StagedArray {
                            arg: *arg,
                            buffer: array.0,
                            host: array.1,
                        });
                    }
                }
                LaunchOp::ResolveRange => {
                    let mut r = LaunchRange::default();
                    for dim in &desc.ranges {
                        let start = eval_bound(env, &dim.start)?;
                        let stop = eval_bound(env, &dim.stop)?;
                        let step = eval_bound(env, &dim.step)?;
                        if step != 1 {
                            return Err(ExecError::NonUnitStep {
                                index_variable: dim.index_variable.clone(),
                                step,
                            });
                        }
                        r.offsets.push(start);
                        r.extents.push((stop - start).max(0) as usize);
                    }
                    range = Some(r);
                }
                LaunchOp::Enqueue => {
                    let q = queue.as_ref().ok_or(ExecError::Device(DeviceError::NoQueue))?.queue;
                    let buffer = args
                        .as_ref()
                        .ok_or_else(|| ExecError::Marshal("argument buffer not allocated".into()))?;
                    if !buffer.is_complete() {
                        return Err(ExecError::Marshal(format!(
                            "{} of {} argument slots filled",
                            buffer.len(),
                            buffer.capacity()
                        )));
                    }
                    let r = range
                        .as_ref()
                        .ok_or_else(|| ExecError::Marshal("launch range not resolved".into()))?;
                    runtime.enqueue(q, &kernel, buffer, r)?;
                }
                LaunchOp::CopyBack { arg } => {
                    let q = queue.as_ref().ok_or(ExecError::Device(DeviceError::NoQueue))?.queue;
                    let Some(stage) = staged.iter().find(|s| s.arg == *arg) else {
                        // Host value was absent; nothing to write back
                        continue;
                    };
                    runtime.copy_to_host(q, stage.buffer, &stage.host)?;
                    let launch_arg = &desc.args[*arg];
                    if launch_arg.race {
                        env.insert(launch_arg.host_name.clone(), stage.host.get(&[0])?);
                    }
                }
                LaunchOp::ReleaseQueue => {
                    if let Some(guard) = queue.as_mut() {
                        guard.release();
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Executor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Push the expanded slots of one argument. Returns the staged device copy
/// for array arguments.
fn marshal_arg(
    runtime: &dyn DeviceRuntime,
    queue: QueueHandle,
    arg: &LaunchArg,
    env: &Env,
    buffer: &mut KernelArgBuffer,
) -> Result<Option<(DeviceBuffer, NdArray)>, ExecError> {
    let Some(host) = env.get(&arg.host_name) else {
        // A race first assigned inside the loop still needs its cell
        if let (IrType::Array(at), true) = (&arg.kernel_type, arg.race) {
            trace!("{} has no host value, allocating a 1-element {} cell", arg.host_name, at.dtype);
            let cell = NdArray::zeros(at.dtype, &[1]);
            return stage_array(runtime, queue, cell, buffer).map(Some);
        }
        trace!("{} has no host value, passing {} empty slots", arg.host_name, arg.slots);
        for _ in 0..arg.slots {
            buffer.push(KernelArgValue::None)?;
        }
        return Ok(None);
    };

    let array = match (&arg.kernel_type, host) {
        (IrType::Array(_), Value::Array(arr)) => arr.clone(),
        (IrType::Array(at), scalar) if arg.race => NdArray::from_scalar(at.dtype, scalar)?,
        (IrType::Array(_), other) => {
            return Err(ExecError::Marshal(format!(
                "{} expects an array, host holds {}",
                arg.host_name, other
            )))
        }
        (_, Value::Array(arr)) if arr.ndim() == 0 => {
            buffer.push(KernelArgValue::Scalar(arr.get(&[])?))?;
            return Ok(None);
        }
        (_, Value::Array(_)) => {
            return Err(ExecError::Marshal(format!(
                "{} expects a scalar, host holds an array",
                arg.host_name
            )))
        }
        (_, scalar) => {
            buffer.push(KernelArgValue::Scalar(scalar.clone()))?;
            return Ok(None);
        }
    };
    stage_array(runtime, queue, array, buffer).map(Some)
}

/// Copy `array` to the device and push its pointer, metadata, shape and
/// byte-stride slots.
fn stage_array(
    runtime: &dyn DeviceRuntime,
    queue: QueueHandle,
    array: NdArray,
    buffer: &mut KernelArgBuffer,
) -> Result<(DeviceBuffer, NdArray), ExecError> {
    let device = runtime.copy_to_device(queue, &array)?;
    buffer.push(KernelArgValue::MemInfo)?;
    buffer.push(KernelArgValue::Parent)?;
    buffer.push(KernelArgValue::NItems(array.nitems()))?;
    buffer.push(KernelArgValue::ItemSize(array.itemsize()))?;
    buffer.push(KernelArgValue::Data(device))?;
    for &dim in array.shape() {
        buffer.push(KernelArgValue::Shape(dim))?;
    }
    for &stride in array.strides() {
        buffer.push(KernelArgValue::Stride(stride * array.itemsize() as isize))?;
    }
    Ok((device, array))
}
