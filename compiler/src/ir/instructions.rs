//! IR Instructions
//!
//! Defines the instruction set of the named-variable IR. Expressions only read
//! variables by name; instructions are the only place a variable is written.

use super::{IrSourceLocation, LoopNestId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Constant values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::None => write!(f, "None"),
            IrValue::Bool(b) => write!(f, "{}", b),
            IrValue::Int(i) => write!(f, "{}", i),
            IrValue::Float(x) => write!(f, "{:?}", x),
        }
    }
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// True division (always produces a float)
    Div,
    FloorDiv,
    Rem,
    Min,
    Max,
}

/// Unary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
}

/// Comparison operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrExpr {
    /// Constant value
    Const(IrValue),

    /// Read another variable
    Var(String),

    /// Binary arithmetic
    BinOp {
        op: BinaryOp,
        lhs: String,
        rhs: String,
    },

    /// Unary arithmetic / math intrinsic
    UnOp { op: UnaryOp, operand: String },

    /// Comparison producing a bool
    Cmp {
        op: CompareOp,
        lhs: String,
        rhs: String,
    },

    /// Read `array[index...]`
    GetItem { array: String, index: Vec<String> },

    /// Work-item coordinate along a hardware axis (0, 1 or 2)
    GlobalId { axis: u32 },
}

impl IrExpr {
    /// Variables read by this expression, in operand order.
    pub fn uses(&self) -> Vec<&str> {
        match self {
            IrExpr::Const(_) | IrExpr::GlobalId { .. } => Vec::new(),
            IrExpr::Var(name) => vec![name.as_str()],
            IrExpr::BinOp { lhs, rhs, .. } | IrExpr::Cmp { lhs, rhs, .. } => {
                vec![lhs.as_str(), rhs.as_str()]
            }
            IrExpr::UnOp { operand, .. } => vec![operand.as_str()],
            IrExpr::GetItem { array, index } => {
                let mut uses = vec![array.as_str()];
                uses.extend(index.iter().map(String::as_str));
                uses
            }
        }
    }

    pub(crate) fn rename_vars(&mut self, map: &HashMap<String, String>) {
        let rename = |name: &mut String| {
            if let Some(new_name) = map.get(name.as_str()) {
                *name = new_name.clone();
            }
        };
        match self {
            IrExpr::Const(_) | IrExpr::GlobalId { .. } => {}
            IrExpr::Var(name) => rename(name),
            IrExpr::BinOp { lhs, rhs, .. } | IrExpr::Cmp { lhs, rhs, .. } => {
                rename(lhs);
                rename(rhs);
            }
            IrExpr::UnOp { operand, .. } => rename(operand),
            IrExpr::GetItem { array, index } => {
                rename(array);
                index.iter_mut().for_each(rename);
            }
        }
    }
}

/// IR instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrInstruction {
    /// `target = value`
    Assign {
        target: String,
        value: IrExpr,
        loc: IrSourceLocation,
    },

    /// `target[index...] = value`
    SetItem {
        target: String,
        index: Vec<String>,
        value: String,
        loc: IrSourceLocation,
    },

    /// Lifetime end of a variable (destructor/cleanup marker)
    Del { var: String },

    /// Data-parallel loop nest stored in the function's arena
    LoopNest(LoopNestId),
}

impl IrInstruction {
    pub fn assign(target: impl Into<String>, value: IrExpr) -> Self {
        IrInstruction::Assign {
            target: target.into(),
            value,
            loc: IrSourceLocation::unknown(),
        }
    }

    pub fn set_item(target: impl Into<String>, index: Vec<String>, value: impl Into<String>) -> Self {
        IrInstruction::SetItem {
            target: target.into(),
            index,
            value: value.into(),
            loc: IrSourceLocation::unknown(),
        }
    }

    /// Variable written by this instruction, if any.
    ///
    /// `SetItem` mutates an existing array and does not define a variable.
    pub fn def(&self) -> Option<&str> {
        match self {
            IrInstruction::Assign { target, .. } => Some(target.as_str()),
            _ => None,
        }
    }

    /// Variables read by this instruction.
    ///
    /// Loop nests report nothing here; their uses live in the arena and are
    /// resolved by passes that have access to it.
    pub fn uses(&self) -> Vec<&str> {
        match self {
            IrInstruction::Assign { value, .. } => value.uses(),
            IrInstruction::SetItem {
                target,
                index,
                value,
                ..
            } => {
                let mut uses = vec![target.as_str()];
                uses.extend(index.iter().map(String::as_str));
                uses.push(value.as_str());
                uses
            }
            IrInstruction::Del { .. } | IrInstruction::LoopNest(_) => Vec::new(),
        }
    }

    /// Whether removing this instruction could change observable behavior.
    pub fn has_side_effects(&self) -> bool {
        !matches!(self, IrInstruction::Assign { .. })
    }

    pub fn is_del(&self) -> bool {
        matches!(self, IrInstruction::Del { .. })
    }

    /// Rename every variable occurrence (reads and writes) found in `map`.
    pub fn rename_vars(&mut self, map: &HashMap<String, String>) {
        let rename = |name: &mut String| {
            if let Some(new_name) = map.get(name.as_str()) {
                *name = new_name.clone();
            }
        };
        match self {
            IrInstruction::Assign { target, value, .. } => {
                rename(target);
                value.rename_vars(map);
            }
            IrInstruction::SetItem {
                target,
                index,
                value,
                ..
            } => {
                rename(target);
                index.iter_mut().for_each(rename);
                rename(value);
            }
            IrInstruction::Del { var } => rename(var),
            IrInstruction::LoopNest(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setitem_uses_and_def() {
        let inst = IrInstruction::set_item("b", vec!["i".to_string()], "v");
        assert_eq!(inst.def(), None);
        assert_eq!(inst.uses(), vec!["b", "i", "v"]);
        assert!(inst.has_side_effects());
    }

    #[test]
    fn test_rename_vars() {
        let mut inst = IrInstruction::assign(
            "$t.1",
            IrExpr::GetItem {
                array: "a".to_string(),
                index: vec!["$idx.0".to_string()],
            },
        );
        let mut map = HashMap::new();
        map.insert("$idx.0".to_string(), "_idx_0".to_string());
        map.insert("$t.1".to_string(), "t_1".to_string());
        inst.rename_vars(&map);

        assert_eq!(inst.def(), Some("t_1"));
        assert_eq!(inst.uses(), vec!["a", "_idx_0"]);
    }
}
