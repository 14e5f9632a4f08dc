//! IR Dump Utility
//!
//! Pretty-prints functions and regions in a human-readable format.
//! Useful for debugging the outlining and splice steps.

use super::{
    BinaryOp, CompareOp, IrControlFlowGraph, IrExpr, IrFunction, IrInstruction, IrTerminator,
    LoopNestArena, TypeMap, UnaryOp,
};
use std::fmt::{self, Write};

/// Dump a single function to a string.
pub fn dump_function(func: &IrFunction, typemap: &TypeMap) -> String {
    let mut out = String::new();
    let _ = write_function(&mut out, func, typemap);
    out
}

/// Dump a region (loop body or kernel body) to a string.
pub fn dump_region(cfg: &IrControlFlowGraph, arena: &LoopNestArena) -> String {
    let mut out = String::new();
    let _ = write_region(&mut out, cfg, arena, 0);
    out
}

fn write_function(out: &mut String, func: &IrFunction, typemap: &TypeMap) -> fmt::Result {
    let params: Vec<String> = func
        .arg_names
        .iter()
        .map(|name| match typemap.get(name) {
            Some(ty) => format!("{}: {}", name, ty),
            None => name.clone(),
        })
        .collect();
    writeln!(out, "fn {}({}) {{", func.name, params.join(", "))?;
    write_region(out, &func.cfg, &func.loop_nests, 0)?;
    writeln!(out, "}}")
}

fn write_region(
    out: &mut String,
    cfg: &IrControlFlowGraph,
    arena: &LoopNestArena,
    depth: usize,
) -> fmt::Result {
    let pad = "    ".repeat(depth);
    for (id, block) in &cfg.blocks {
        writeln!(out, "{}{}:", pad, id)?;
        for inst in &block.instructions {
            write_instruction(out, inst, arena, depth + 1)?;
        }
        writeln!(out, "{}    {}", pad, dump_terminator(&block.terminator))?;
    }
    Ok(())
}

fn write_instruction(
    out: &mut String,
    inst: &IrInstruction,
    arena: &LoopNestArena,
    depth: usize,
) -> fmt::Result {
    let pad = "    ".repeat(depth);
    match inst {
        IrInstruction::Assign { target, value, .. } => {
            writeln!(out, "{}{} = {}", pad, target, dump_expr(value))
        }
        IrInstruction::SetItem {
            target,
            index,
            value,
            ..
        } => writeln!(out, "{}{}[{}] = {}", pad, target, index.join(", "), value),
        IrInstruction::Del { var } => writeln!(out, "{}del {}", pad, var),
        IrInstruction::LoopNest(id) => {
            let Some(nest) = arena.get(*id) else {
                return writeln!(out, "{}<missing {}>", pad, id);
            };
            let dims: Vec<String> = nest
                .dims
                .iter()
                .map(|d| format!("{} in {}..{} step {}", d.index_variable, d.start, d.stop, d.step))
                .collect();
            let params: Vec<&str> = nest.params.iter().map(String::as_str).collect();
            writeln!(
                out,
                "{}{}: parallel for ({}) params {{{}}}",
                pad,
                id,
                dims.join(", "),
                params.join(", ")
            )?;
            if !nest.races.is_empty() {
                let races: Vec<&str> = nest.races.iter().map(String::as_str).collect();
                writeln!(out, "{}    races {{{}}}", pad, races.join(", "))?;
            }
            for init in &nest.init_block {
                write_instruction(out, init, arena, depth + 1)?;
            }
            write_region(out, &nest.body, arena, depth + 1)
        }
    }
}

/// Dump an expression to a string.
pub fn dump_expr(expr: &IrExpr) -> String {
    match expr {
        IrExpr::Const(v) => v.to_string(),
        IrExpr::Var(name) => name.clone(),
        IrExpr::BinOp { op, lhs, rhs } => format!("{} {} {}", lhs, dump_binop(*op), rhs),
        IrExpr::UnOp { op, operand } => format!("{}({})", dump_unop(*op), operand),
        IrExpr::Cmp { op, lhs, rhs } => format!("{} {} {}", lhs, dump_cmp(*op), rhs),
        IrExpr::GetItem { array, index } => format!("{}[{}]", array, index.join(", ")),
        IrExpr::GlobalId { axis } => format!("get_global_id({})", axis),
    }
}

fn dump_binop(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::FloorDiv => "//",
        BinaryOp::Rem => "%",
        BinaryOp::Min => "min",
        BinaryOp::Max => "max",
    }
}

fn dump_unop(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Abs => "abs",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Exp => "exp",
        UnaryOp::Log => "log",
        UnaryOp::Sin => "sin",
        UnaryOp::Cos => "cos",
    }
}

fn dump_cmp(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
    }
}

/// Dump a terminator to a string.
pub fn dump_terminator(term: &IrTerminator) -> String {
    match term {
        IrTerminator::Jump { target } => format!("jump {}", target),
        IrTerminator::Branch {
            condition,
            true_target,
            false_target,
        } => format!("branch {}, {}, {}", condition, true_target, false_target),
        IrTerminator::Return { value: Some(v) } => format!("return {}", v),
        IrTerminator::Return { value: None } => "return".to_string(),
        IrTerminator::RegionExit => "exit".to_string(),
        IrTerminator::Unreachable => "unreachable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, IrType, LoopBound, LoopDim, ScalarType};

    #[test]
    fn test_dump_function_with_loop_nest() {
        let mut b = IrBuilder::new("copy");
        b.arg("a", IrType::array(ScalarType::F64, 1));
        b.begin_loop_nest();
        b.get_item("v", ScalarType::F64, "a", &["i"]);
        b.set_item("a", &["i"], "v");
        b.end_loop_nest(vec![LoopDim::new("i", LoopBound::Const(0), LoopBound::var("n"))]);
        b.ret(None);
        let (desc, func) = b.finish();

        let text = dump_function(&func, &desc.typemap);
        assert!(text.starts_with("fn copy(a: array(float64, 1d)) {"));
        assert!(text.contains("loop0: parallel for (i in 0..n step 1)"));
        assert!(text.contains("v = a[i]"));
        assert!(text.contains("exit"));
        assert!(text.trim_end().ends_with('}'));
    }
}
