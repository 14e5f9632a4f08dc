//! Benchmarks for loop-nest outlining and device execution

use compiler::codegen::host_device::{HostDeviceBackend, HostDeviceRuntime};
use compiler::codegen::interpreter::{NdArray, Value};
use compiler::ir::{
    BinaryOp, FunctionDescriptor, IrBuilder, IrFunction, IrType, LoopBound, LoopDim, ScalarType,
};
use compiler::{DualPathLowerer, OffloadConfig, OffloadContext};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::rc::Rc;

fn axpy(dims: usize) -> (FunctionDescriptor, IrFunction) {
    let array = IrType::array(ScalarType::F64, dims);
    let indices: Vec<String> = (0..dims).map(|d| format!("i{}", d)).collect();
    let index_refs: Vec<&str> = indices.iter().map(String::as_str).collect();

    let mut b = IrBuilder::new("axpy");
    b.arg("x", array.clone());
    b.arg("y", array);
    b.arg("alpha", IrType::f64());
    b.arg("n", IrType::i64());
    b.begin_loop_nest();
    b.get_item("$x", ScalarType::F64, "x", &index_refs);
    b.get_item("$y", ScalarType::F64, "y", &index_refs);
    b.binop("$ax", IrType::f64(), BinaryOp::Mul, "alpha", "$x");
    b.binop("$r", IrType::f64(), BinaryOp::Add, "$ax", "$y");
    b.set_item("y", &index_refs, "$r");
    let loop_dims = indices
        .iter()
        .map(|i| LoopDim::new(i.as_str(), LoopBound::Const(0), LoopBound::var("n")))
        .collect();
    let id = b.end_loop_nest(loop_dims);
    if let Some(nest) = b.loop_nest_mut(id) {
        nest.params = ["x", "y", "alpha"].iter().map(|s| s.to_string()).collect();
    }
    b.ret(None);
    b.finish()
}

fn context() -> OffloadContext {
    OffloadContext::new(
        OffloadConfig::default(),
        Rc::new(HostDeviceBackend::new()),
        Rc::new(HostDeviceRuntime::new()),
    )
}

fn bench_outline(c: &mut Criterion) {
    let mut group = c.benchmark_group("outline");
    for dims in [1usize, 3, 5] {
        let (desc, func) = axpy(dims);
        group.bench_with_input(BenchmarkId::new("device_lowering", dims), &dims, |b, _| {
            b.iter(|| {
                let mut ctx = context();
                let (mut desc, mut func) = (desc.clone(), func.clone());
                let result = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap();
                black_box(result.function.instruction_count())
            })
        });
    }
    group.finish();
}

fn bench_fallback(c: &mut Criterion) {
    let (desc, func) = axpy(3);
    c.bench_function("fallback_rollback", |b| {
        b.iter(|| {
            let mut ctx = OffloadContext::new(
                OffloadConfig::default(),
                Rc::new(HostDeviceBackend::with_failure("bench")),
                Rc::new(HostDeviceRuntime::new()),
            );
            let (mut desc, mut func) = (desc.clone(), func.clone());
            let result = DualPathLowerer::new(&mut ctx).lower(&mut desc, &mut func).unwrap();
            black_box(result.outcome)
        })
    });
}

fn bench_launch(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch");
    for n in [16usize, 64] {
        let mut ctx = context();
        let (mut desc, mut func) = axpy(2);
        let lowered = DualPathLowerer::new(&mut ctx)
            .lower(&mut desc, &mut func)
            .unwrap()
            .function;
        group.bench_with_input(BenchmarkId::new("axpy_2d", n), &n, |b, &n| {
            b.iter(|| {
                let x = NdArray::from_f64(&[n, n], vec![1.0; n * n]).unwrap();
                let y = NdArray::zeros(ScalarType::F64, &[n, n]);
                let args = vec![
                    Value::Array(x),
                    Value::Array(y),
                    Value::Float(2.0),
                    Value::Int(n as i64),
                ];
                black_box(ctx.executor().call(&lowered, args).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_outline, bench_fallback, bench_launch);
criterion_main!(benches);
