//! IR Builder
//!
//! This module provides a builder interface for constructing IR functions in a
//! convenient way. The builder keeps a stack of open regions: the function
//! body at the bottom, and one region per loop nest currently being built.

use tracing::debug;

use super::{
    BinaryOp, CompareOp, FunctionDescriptor, IrBlockId, IrControlFlowGraph, IrExpr,
    IrFunction, IrInstruction, IrSourceLocation, IrTerminator, IrType, IrValue, LoopDim,
    LoopNest, LoopNestId, ScalarType, TypeMap, UnaryOp,
};

struct OpenRegion {
    cfg: IrControlFlowGraph,
    current_block: IrBlockId,
}

/// Builder for constructing an IR function together with its type map
pub struct IrBuilder {
    function: IrFunction,
    typemap: TypeMap,
    arg_types: Vec<IrType>,
    return_type: IrType,
    /// Bottom entry is the function body itself
    regions: Vec<OpenRegion>,
    current_source_location: IrSourceLocation,
}

impl IrBuilder {
    /// Start building a function with an empty entry block labeled 0.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            function: IrFunction::new(name, Vec::new()),
            typemap: TypeMap::new(),
            arg_types: Vec::new(),
            return_type: IrType::None,
            regions: vec![OpenRegion {
                cfg: IrControlFlowGraph::new(),
                current_block: IrBlockId(0),
            }],
            current_source_location: IrSourceLocation::unknown(),
        }
    }

    /// Set the current source location for debugging
    pub fn set_source_location(&mut self, loc: IrSourceLocation) {
        self.current_source_location = loc;
    }

    // === Declarations ===

    /// Add a function argument.
    pub fn arg(&mut self, name: impl Into<String>, ty: IrType) -> &mut Self {
        let name = name.into();
        self.typemap.insert(name.clone(), ty.clone());
        self.function.arg_names.push(name);
        self.arg_types.push(ty);
        self
    }

    pub fn set_return_type(&mut self, ty: IrType) {
        self.return_type = ty;
    }

    /// Record the type of a variable without emitting anything.
    pub fn declare(&mut self, name: impl Into<String>, ty: IrType) {
        self.typemap.insert(name, ty);
    }

    pub fn typemap(&self) -> &TypeMap {
        &self.typemap
    }

    // === Blocks ===

    fn region(&mut self) -> &mut OpenRegion {
        // The function body region is never popped
        let last = self.regions.len() - 1;
        &mut self.regions[last]
    }

    pub fn create_block(&mut self) -> IrBlockId {
        self.region().cfg.create_block()
    }

    pub fn switch_to_block(&mut self, id: IrBlockId) {
        self.region().current_block = id;
    }

    pub fn current_block(&self) -> IrBlockId {
        self.regions[self.regions.len() - 1].current_block
    }

    fn push(&mut self, inst: IrInstruction) {
        let region = self.region();
        let current = region.current_block;
        if let Some(block) = region.cfg.get_block_mut(current) {
            block.add_instruction(inst);
        }
    }

    fn terminate(&mut self, term: IrTerminator) {
        let region = self.region();
        let current = region.current_block;
        if let Some(block) = region.cfg.get_block_mut(current) {
            block.set_terminator(term);
        }
    }

    // === Instructions ===

    pub fn assign(&mut self, target: impl Into<String>, ty: IrType, value: IrExpr) {
        let target = target.into();
        self.typemap.insert(target.clone(), ty);
        let loc = self.current_source_location;
        self.push(IrInstruction::Assign { target, value, loc });
    }

    pub fn const_f64(&mut self, target: impl Into<String>, value: f64) {
        self.assign(target, IrType::f64(), IrExpr::Const(IrValue::Float(value)));
    }

    pub fn const_i64(&mut self, target: impl Into<String>, value: i64) {
        self.assign(target, IrType::i64(), IrExpr::Const(IrValue::Int(value)));
    }

    pub fn copy(&mut self, target: impl Into<String>, ty: IrType, src: impl Into<String>) {
        self.assign(target, ty, IrExpr::Var(src.into()));
    }

    pub fn binop(
        &mut self,
        target: impl Into<String>,
        ty: IrType,
        op: BinaryOp,
        lhs: impl Into<String>,
        rhs: impl Into<String>,
    ) {
        self.assign(
            target,
            ty,
            IrExpr::BinOp {
                op,
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
        );
    }

    pub fn unop(&mut self, target: impl Into<String>, ty: IrType, op: UnaryOp, operand: impl Into<String>) {
        self.assign(
            target,
            ty,
            IrExpr::UnOp {
                op,
                operand: operand.into(),
            },
        );
    }

    pub fn compare(
        &mut self,
        target: impl Into<String>,
        op: CompareOp,
        lhs: impl Into<String>,
        rhs: impl Into<String>,
    ) {
        self.assign(
            target,
            IrType::bool(),
            IrExpr::Cmp {
                op,
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
        );
    }

    pub fn get_item(&mut self, target: impl Into<String>, dtype: ScalarType, array: impl Into<String>, index: &[&str]) {
        self.assign(
            target,
            IrType::Scalar(dtype),
            IrExpr::GetItem {
                array: array.into(),
                index: index.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn set_item(&mut self, array: impl Into<String>, index: &[&str], value: impl Into<String>) {
        let loc = self.current_source_location;
        self.push(IrInstruction::SetItem {
            target: array.into(),
            index: index.iter().map(|s| s.to_string()).collect(),
            value: value.into(),
            loc,
        });
    }

    pub fn del(&mut self, var: impl Into<String>) {
        self.push(IrInstruction::Del { var: var.into() });
    }

    // === Terminators ===

    pub fn jump(&mut self, target: IrBlockId) {
        self.terminate(IrTerminator::Jump { target });
    }

    pub fn branch(&mut self, condition: impl Into<String>, true_target: IrBlockId, false_target: IrBlockId) {
        self.terminate(IrTerminator::Branch {
            condition: condition.into(),
            true_target,
            false_target,
        });
    }

    pub fn ret(&mut self, value: Option<&str>) {
        self.terminate(IrTerminator::Return {
            value: value.map(str::to_string),
        });
    }

    // === Loop nests ===

    /// Open a new loop-nest body region; subsequent instructions go into it.
    pub fn begin_loop_nest(&mut self) {
        self.regions.push(OpenRegion {
            cfg: IrControlFlowGraph::new(),
            current_block: IrBlockId(0),
        });
    }

    /// Close the innermost body region and emit the loop nest into the
    /// enclosing region's current block.
    ///
    /// The current block of the body becomes its exit block. Index variables
    /// without a declared type are typed as `int64`.
    pub fn end_loop_nest(&mut self, dims: Vec<LoopDim>) -> LoopNestId {
        assert!(self.regions.len() > 1, "end_loop_nest without begin_loop_nest");
        self.terminate(IrTerminator::RegionExit);
        let body = match self.regions.pop() {
            Some(region) => region.cfg,
            None => IrControlFlowGraph::new(),
        };

        for dim in &dims {
            if !self.typemap.contains(&dim.index_variable) {
                self.typemap.insert(dim.index_variable.clone(), IrType::i64());
            }
        }

        let mut nest = LoopNest::new(dims, body);
        nest.loc = self.current_source_location;
        let id = self.function.loop_nests.alloc(nest);
        debug!("IrBuilder: created loop nest {} in {}", id, self.function.name);
        self.push(IrInstruction::LoopNest(id));
        id
    }

    /// Access a loop nest created by this builder (to attach analysis facts).
    pub fn loop_nest_mut(&mut self, id: LoopNestId) -> Option<&mut LoopNest> {
        self.function.loop_nests.get_mut(id)
    }

    /// Finish the function, returning its descriptor and body.
    pub fn finish(mut self) -> (FunctionDescriptor, IrFunction) {
        while self.regions.len() > 1 {
            // Unbalanced loop nests are dropped rather than emitted half-built
            self.regions.pop();
        }
        if let Some(region) = self.regions.pop() {
            self.function.cfg = region.cfg;
        }
        let mut descriptor = FunctionDescriptor::new(self.function.name.clone(), self.typemap);
        descriptor.arg_types = self.arg_types;
        descriptor.return_type = self.return_type;
        (descriptor, self.function)
    }
}
