//! offload - lower data-parallel loop nests onto a device
//!
//! # Usage
//!
//! ```bash
//! # Lower a 2-D demo loop nest and run it on the host reference device
//! offload run --dims 2 --size 4
//!
//! # Force the device path to fail and watch the sequential fallback
//! offload run --dims 3 --fail-device
//!
//! # Five dimensions: two of them become sequential loops inside the kernel
//! offload run --dims 5 --size 2 --dump-ir
//!
//! # Show the effective configuration
//! offload info --config offload.toml
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use compiler::codegen::backend::KernelBackend;
use compiler::codegen::host_device::{HostDeviceBackend, HostDeviceRuntime};
use compiler::codegen::interpreter::{Executor, NdArray, Value};
use compiler::ir::{
    BinaryOp, FunctionDescriptor, IrBuilder, IrFunction, IrType, LoopBound, LoopDim, ScalarType,
};
use compiler::lowering::Lowerer;
use compiler::{logging, DualPathLowerer, OffloadConfig, OffloadContext};
use diagnostics::ErrorFormatter;
use log::LevelFilter;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "offload")]
#[command(version = "0.1.0")]
#[command(about = "Parallel loop-nest to device-kernel lowering", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower a demo loop nest and run it on the host reference device
    Run {
        /// Number of loop dimensions (1-6)
        #[arg(long, default_value = "2")]
        dims: usize,

        /// Extent of every dimension
        #[arg(long, default_value = "4")]
        size: usize,

        /// Also write a scalar shared by every iteration
        #[arg(long)]
        race: bool,

        /// Make kernel compilation fail
        #[arg(long)]
        fail_device: bool,

        /// Propagate device failures instead of falling back
        #[arg(long)]
        no_fallback: bool,

        /// Print outlined kernel IR as JSON
        #[arg(long)]
        dump_ir: bool,

        /// Print the offload report
        #[arg(long)]
        report: bool,

        /// Print the offload report as JSON
        #[arg(long)]
        report_json: bool,

        /// Offload configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "warn")]
        log_level: LogLevel,
    },

    /// Show the effective offload configuration
    Info {
        /// Offload configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

struct RunOptions {
    dims: usize,
    size: usize,
    race: bool,
    fail_device: bool,
    dump_ir: bool,
    report_json: bool,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            dims,
            size,
            race,
            fail_device,
            no_fallback,
            dump_ir,
            report,
            report_json,
            config,
            log_level,
        } => {
            logging::init_with_level(log_level.into());
            load_config(config).and_then(|mut config| {
                if no_fallback {
                    config.fallback_on_cpu = false;
                }
                config.dump_ir |= dump_ir;
                config.offload_diagnostics |= report || report_json;
                let options = RunOptions {
                    dims,
                    size,
                    race,
                    fail_device,
                    dump_ir,
                    report_json,
                };
                run_demo(config, options)
            })
        }
        Commands::Info { config } => load_config(config).map(|config| show_info(&config)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<OffloadConfig, String> {
    match path {
        Some(path) => OffloadConfig::from_file(&path).map_err(|e| format!("{}: {}", path.display(), e)),
        None => Ok(OffloadConfig::default()),
    }
}

fn show_info(config: &OffloadConfig) {
    println!("offload {}", env!("CARGO_PKG_VERSION"));
    println!("  fallback_on_cpu:     {}", config.fallback_on_cpu);
    println!("  debug:               {}", config.debug);
    println!("  dump_ir:             {}", config.dump_ir);
    println!("  offload_diagnostics: {}", config.offload_diagnostics);
}

/// `out[i..] = a[i..] * k + 1` over a `dims`-dimensional loop nest, with an
/// optional race on `last`.
fn build_demo(dims: usize, race: bool) -> (FunctionDescriptor, IrFunction) {
    let array = IrType::array(ScalarType::F64, dims);
    let indices: Vec<String> = (0..dims).map(|d| format!("i{}", d)).collect();
    let index_refs: Vec<&str> = indices.iter().map(String::as_str).collect();

    let mut b = IrBuilder::new("scale_offset");
    b.arg("a", array.clone());
    b.arg("out", array);
    b.arg("k", IrType::f64());
    b.arg("n", IrType::i64());
    b.const_f64("last", 0.0);

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
        nest.shape_classes.insert("a".to_string(), (0..dims as i64).collect());
        nest.shape_classes.insert("out".to_string(), (0..dims as i64).collect());
    }
    b.ret(Some("last"));
    b.finish()
}

fn demo_args(dims: usize, size: usize) -> Result<(Vec<Value>, NdArray), String> {
    let shape = vec![size; dims];
    let count: usize = shape.iter().product();
    let a = NdArray::from_f64(&shape, (0..count).map(|v| v as f64).collect()).map_err(|e| e.to_string())?;
    let out = NdArray::zeros(ScalarType::F64, &shape);
    let args = vec![
        Value::Array(a),
        Value::Array(out.clone()),
        Value::Float(2.0),
        Value::Int(size as i64),
    ];
    Ok((args, out))
}

fn run_demo(config: OffloadConfig, options: RunOptions) -> Result<(), String> {
    if options.dims == 0 || options.dims > 6 {
        return Err(format!("--dims must be between 1 and 6, got {}", options.dims));
    }
    let (mut desc, mut func) = build_demo(options.dims, options.race);
    let reference = Lowerer::sequential()
        .lower_function(&desc, &mut func.clone())
        .map_err(|e| e.to_string())?;

    let backend: Rc<dyn KernelBackend> = if options.fail_device {
        Rc::new(HostDeviceBackend::with_failure("device compilation disabled by --fail-device"))
    } else {
        Rc::new(HostDeviceBackend::new())
    };
    let mut ctx = OffloadContext::new(config, backend, Rc::new(HostDeviceRuntime::new()));
    let result = DualPathLowerer::new(&mut ctx)
        .lower(&mut desc, &mut func)
        .map_err(|e| e.to_string())?;

    if !ctx.diagnostics().is_empty() {
        eprint!("{}", ErrorFormatter::new().format_diagnostics(ctx.diagnostics()));
    }
    println!("{}: {:?}", desc.qualified_name, result.outcome);

    if options.dump_ir {
        for kernel in ctx.kernels() {
            let json = serde_json::to_string_pretty(&kernel.kernel_ir).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }

    let (args, out) = demo_args(options.dims, options.size)?;
    let last = ctx
        .executor()
        .call(&result.function, args)
        .map_err(|e| e.to_string())?;

    let (ref_args, ref_out) = demo_args(options.dims, options.size)?;
    Executor::new()
        .call(&reference, ref_args)
        .map_err(|e| e.to_string())?;

    let values = out.to_f64_vec().map_err(|e| e.to_string())?;
    let expected = ref_out.to_f64_vec().map_err(|e| e.to_string())?;
    println!("{} elements, matches sequential: {}", values.len(), values == expected);
    if options.race {
        println!("last = {}", last);
    }

    if options.report_json {
        println!("{}", ctx.report().to_json().map_err(|e| e.to_string())?);
    } else if ctx.config().offload_diagnostics {
        print!("{}", ctx.report().render());
    }
    Ok(())
}
