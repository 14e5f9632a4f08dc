//! Shared loop-nest builders for the integration tests

#![allow(dead_code)]

use compiler::codegen::backend::KernelBackend;
use compiler::codegen::host_device::{HostDeviceBackend, HostDeviceRuntime};
use compiler::codegen::interpreter::{NdArray, Value};
use compiler::ir::{
    BinaryOp, FunctionDescriptor, IrBuilder, IrExpr, IrFunction, IrInstruction, IrType, LoopBound,
    LoopDim, ScalarType,
};
use compiler::{OffloadConfig, OffloadContext};
use std::rc::Rc;

/// `b[i] = a[i]` for `i` in `0..len`.
pub fn copy_1d(len: i64) -> (FunctionDescriptor, IrFunction) {
    let mut b = IrBuilder::new("copy");
    b.arg("a", IrType::array(ScalarType::F64, 1));
    b.arg("b", IrType::array(ScalarType::F64, 1));
    b.begin_loop_nest();
    b.get_item("$v", ScalarType::F64, "a", &["i"]);
    b.set_item("b", &["i"], "$v");
    let id = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::Const(len))]);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.params = ["a", "b"].iter().map(|s| s.to_string()).collect();
        nest.shape_classes.insert("a".to_string(), vec![0]);
        nest.shape_classes.insert("b".to_string(), vec![0]);
    }
    b.ret(None);
    b.finish()
}

/// `out[i..] = a[i..] * k + 1` over `dims` dimensions of extent `n`, with
/// `last` written by every iteration when `race` is set.
pub fn scale_offset(dims: usize, race: bool) -> (FunctionDescriptor, IrFunction) {
    let array = IrType::array(ScalarType::F64, dims);
    let indices: Vec<String> = (0..dims).map(|d| format!("i{}", d)).collect();
    let index_refs: Vec<&str> = indices.iter().map(String::as_str).collect();

    let mut b = IrBuilder::new("scale_offset");
    b.arg("a", array.clone());
    b.arg("out", array);
    b.arg("k", IrType::f64());
    b.arg("n", IrType::i64());
    b.const_f64("last", -1.0);

    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "a", &index_refs);
    b.binop("$y", IrType::f64(), BinaryOp::Mul, "$x", "k");
    b.const_f64("$one", 1.0);
    b.binop("$z", IrType::f64(), BinaryOp::Add, "$y", "$one");
    b.set_item("out", &index_refs, "$z");
    if race {
        b.copy("last", IrType::f64(), "$z");
    }
    let loop_dims = indices
        .iter()
        .map(|i| LoopDim::new(i.as_str(), LoopBound::Const(0), LoopBound::var("n")))
        .collect();
    let id = b.end_loop_nest(loop_dims);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.params = ["a", "out", "k"].iter().map(|s| s.to_string()).collect();
        if race {
            nest.races.insert("last".to_string());
        }
    }
    b.ret(Some("last"));
    b.finish()
}

/// `out[i] = a[i] + 1` for `i` in `0..m`, where `m = n` is computed by the
/// nest's init block.
pub fn init_bounded_1d() -> (FunctionDescriptor, IrFunction) {
    let mut b = IrBuilder::new("init_bounded");
    b.arg("a", IrType::array(ScalarType::F64, 1));
    b.arg("out", IrType::array(ScalarType::F64, 1));
    b.arg("n", IrType::i64());
    b.declare("m", IrType::i64());

    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "a", &["i"]);
    b.const_f64("$one", 1.0);
    b.binop("$y", IrType::f64(), BinaryOp::Add, "$x", "$one");
    b.set_item("out", &["i"], "$y");
    let id = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("m"))]);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.init_block = vec![IrInstruction::assign("m", IrExpr::Var("n".to_string()))];
        nest.params = ["a", "out"].iter().map(|s| s.to_string()).collect();
    }
    b.ret(None);
    b.finish()
}

/// Returns `last`, which is only ever assigned inside the loop.
pub fn race_defined_in_loop() -> (FunctionDescriptor, IrFunction) {
    let mut b = IrBuilder::new("last_of");
    b.arg("a", IrType::array(ScalarType::F64, 1));
    b.arg("n", IrType::i64());

    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "a", &["i"]);
    b.copy("last", IrType::f64(), "$x");
    let id = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))]);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.params = ["a"].iter().map(|s| s.to_string()).collect();
        nest.races.insert("last".to_string());
    }
    b.ret(Some("last"));
    b.finish()
}

/// 2-d copy where the inner dimension is a nested loop nest that also
/// writes the race `last`.
pub fn race_in_nested_nest() -> (FunctionDescriptor, IrFunction) {
    let array = IrType::array(ScalarType::F64, 2);
    let mut b = IrBuilder::new("nested_copy");
    b.arg("a", array.clone());
    b.arg("out", array);
    b.arg("n", IrType::i64());
    b.const_f64("last", -1.0);

    b.begin_loop_nest();
    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "a", &["i", "j"]);
    b.set_item("out", &["i", "j"], "$x");
    b.copy("last", IrType::f64(), "$x");
    let inner = b.end_loop_nest(vec![LoopDim::new("j", LoopBound::Const(0), LoopBound::var("n"))]);
    let outer = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))]);
    for id in [inner, outer] {
        if let Some(nest) = b.loop_nest_mut(id) {
            nest.params = ["a", "out"].iter().map(|s| s.to_string()).collect();
        }
    }
    if let Some(nest) = b.loop_nest_mut(outer) {
        nest.races.insert("last".to_string());
    }
    b.ret(Some("last"));
    b.finish()
}

/// `last = last + a[i]` starting from `last = 0.5`.
pub fn accumulate_race() -> (FunctionDescriptor, IrFunction) {
    let mut b = IrBuilder::new("accumulate");
    b.arg("a", IrType::array(ScalarType::F64, 1));
    b.arg("n", IrType::i64());
    b.const_f64("last", 0.5);

    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "a", &["i"]);
    b.binop("last", IrType::f64(), BinaryOp::Add, "last", "$x");
    let id = b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))]);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.params = ["a"].iter().map(|s| s.to_string()).collect();
        nest.races.insert("last".to_string());
    }
    b.ret(Some("last"));
    b.finish()
}

/// Arguments for [`scale_offset`] plus a handle on `out`.
pub fn scale_offset_args(dims: usize, n: usize) -> (Vec<Value>, NdArray) {
    let shape = vec![n; dims];
    let count: usize = shape.iter().product();
    let a = NdArray::from_f64(&shape, (0..count).map(|v| v as f64).collect()).unwrap();
    let out = NdArray::zeros(ScalarType::F64, &shape);
    let args = vec![
        Value::Array(a),
        Value::Array(out.clone()),
        Value::Float(3.0),
        Value::Int(n as i64),
    ];
    (args, out)
}

pub fn context_with(config: OffloadConfig, backend: Rc<dyn KernelBackend>) -> (OffloadContext, Rc<HostDeviceRuntime>) {
    let runtime = Rc::new(HostDeviceRuntime::new());
    let ctx = OffloadContext::new(config, backend, runtime.clone());
    (ctx, runtime)
}

pub fn host_context() -> (OffloadContext, Rc<HostDeviceRuntime>) {
    context_with(OffloadConfig::default(), Rc::new(HostDeviceBackend::new()))
}
