pub mod ir;
pub mod error;
pub mod config;
pub mod logging;
pub mod lowering;
pub mod offload;
pub mod codegen;

pub use config::OffloadConfig;
pub use error::{LoweringError, UnsupportedConstruct};
pub use offload::{DualPathLowerer, LoweringOutcome, LoweringResult, OffloadContext};
