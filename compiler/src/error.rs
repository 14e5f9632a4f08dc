//! Error types for loop-nest lowering
//!
//! Errors fall into two groups. Unsupported constructs are fatal and never
//! retried. Everything else raised while taking the device path is
//! recoverable: the dual-path lowerer discards the attempt and falls back to
//! sequential lowering.

use crate::codegen::backend::BackendError;
use crate::codegen::interpreter::ExecError;
use std::fmt;

/// Constructs the device path refuses to handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedConstruct {
    /// Loop nest carries reduction variables
    ReductionLoopNest { reductions: Vec<String> },

    /// A dimension steps by something other than 1
    NonUnitStep { index_variable: String, step: String },

    /// Loop nest has no parallel dimensions
    ZeroDimensionalLoopNest,

    /// Argument cannot be placed in the requested address space
    UnsupportedAddressSpace { arg: String, addrspace: String },
}

impl fmt::Display for UnsupportedConstruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedConstruct::ReductionLoopNest { reductions } => write!(
                f,
                "Reductions are not yet supported on device (reduction variables: {})",
                reductions.join(", ")
            ),
            UnsupportedConstruct::NonUnitStep {
                index_variable,
                step,
            } => write!(
                f,
                "Loop step must be 1 on device, dimension {} steps by {}",
                index_variable, step
            ),
            UnsupportedConstruct::ZeroDimensionalLoopNest => {
                write!(f, "Loop nest has no parallel dimensions")
            }
            UnsupportedConstruct::UnsupportedAddressSpace { arg, addrspace } => write!(
                f,
                "Argument {} cannot be passed in address space {}",
                arg, addrspace
            ),
        }
    }
}

/// Errors raised while lowering a function
#[derive(Debug)]
pub enum LoweringError {
    /// Construct the device path does not support (fatal)
    Unsupported(UnsupportedConstruct),

    /// Kernel outlining failed
    Outline(String),

    /// Kernel backend failed to compile the outlined kernel
    Backend(BackendError),

    /// Kernel arguments could not be marshaled
    Marshal(String),

    /// Input IR violates a structural invariant
    InvalidIr(String),

    /// Execution of lowered code failed
    Exec(ExecError),
}

impl LoweringError {
    /// Whether the dual-path lowerer may recover by falling back.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LoweringError::Unsupported(_))
    }
}

impl fmt::Display for LoweringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoweringError::Unsupported(c) => write!(f, "Unsupported construct: {}", c),
            LoweringError::Outline(msg) => write!(f, "Kernel outlining failed: {}", msg),
            LoweringError::Backend(e) => write!(f, "Kernel compilation failed: {}", e),
            LoweringError::Marshal(msg) => write!(f, "Argument marshaling failed: {}", msg),
            LoweringError::InvalidIr(msg) => write!(f, "Invalid IR: {}", msg),
            LoweringError::Exec(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl std::error::Error for LoweringError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoweringError::Backend(e) => Some(e),
            LoweringError::Exec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UnsupportedConstruct> for LoweringError {
    fn from(c: UnsupportedConstruct) -> Self {
        LoweringError::Unsupported(c)
    }
}

impl From<BackendError> for LoweringError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::UnsupportedAddressSpace { arg, addrspace } => {
                LoweringError::Unsupported(UnsupportedConstruct::UnsupportedAddressSpace {
                    arg,
                    addrspace: addrspace.to_string(),
                })
            }
            other => LoweringError::Backend(other),
        }
    }
}

impl From<ExecError> for LoweringError {
    fn from(e: ExecError) -> Self {
        LoweringError::Exec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_is_fatal() {
        let err = LoweringError::from(UnsupportedConstruct::ZeroDimensionalLoopNest);
        assert!(!err.is_recoverable());
        assert!(LoweringError::Outline("x".into()).is_recoverable());
        assert!(LoweringError::Marshal("x".into()).is_recoverable());
    }

    #[test]
    fn test_reduction_message_names_variables() {
        let err = UnsupportedConstruct::ReductionLoopNest {
            reductions: vec!["acc".into(), "total".into()],
        };
        assert!(err.to_string().contains("acc, total"));
    }

    #[test]
    fn test_addrspace_rejection_is_unsupported() {
        let err = LoweringError::from(BackendError::UnsupportedAddressSpace {
            arg: "a".into(),
            addrspace: crate::ir::AddressSpace::Local,
        });
        assert!(!err.is_recoverable());

        let err = LoweringError::from(BackendError::Compilation {
            kernel: "k".into(),
            reason: "boom".into(),
        });
        assert!(err.is_recoverable());
    }
}
