//! Embedded in-memory backend: typed IR straight to LLVM, no C compiler.
//!
//! Each kernel gets its own context and execution engine. Both are leaked:
//! the code must stay mapped for as long as any cache or kernel refers to
//! it, and MCJIT offers no way to free one function at a time.
//!
//! Math calls always go through the bridge table; reserved geometry names
//! are computed by a runtime helper reading the ND descriptor.

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::intrinsics::Intrinsic;
use inkwell::module::{Linkage, Module};
use inkwell::targets::{InitializationConfig, Target};
use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, PointerType};
use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate, OptimizationLevel};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use veckern::expr::types::{Const, promote};
use veckern::expr::{BinaryOp, UnaryOp};
use veckern::{DType, IrBlock, IrExpr, IrProgram, IrStmtKind, MathFunc, Reserved, TypedExpr, TypedKind};

use super::compiled::{Backend, CodeOwner, KernelFn, LoadedKernel};
use super::error::{FailureClass, JitError};
use crate::bridge::{BRIDGE, SlotKind, symbol_name};
use crate::codegen::{CodegenOptions, LoweringMode, LoweringTrace, is_synthesized};
use crate::nd::{reserved_code, reserved_from_descriptor};
use crate::value::Scalar;

static NATIVE_TARGET: Lazy<Result<(), String>> =
    Lazy::new(|| Target::initialize_native(&InitializationConfig::default()));

const RESERVED_HELPER: &str = "veckern_nd_reserved";

type Value = BasicValueEnum<'static>;
type Block = BasicBlock<'static>;

fn failed(what: impl std::fmt::Display) -> JitError {
    JitError::build(FailureClass::CompileFailed, what.to_string())
}

/// Compile `ir` in memory and return a callable kernel.
pub(crate) fn compile(
    key: u64,
    ir: &IrProgram,
    output: DType,
    options: &CodegenOptions,
) -> Result<LoadedKernel, JitError> {
    NATIVE_TARGET.clone().map_err(failed)?;

    let context: &'static Context = Box::leak(Box::new(Context::create()));
    let mut lowering = Lowering::new(context, ir, output, options);
    lowering.emit_kernel()?;
    lowering
        .module
        .verify()
        .map_err(|e| failed(e.to_string()).with_context(ir.name.clone()))?;

    let engine = lowering
        .module
        .create_jit_execution_engine(OptimizationLevel::Default)
        .map_err(|e| failed(e.to_string()))?;
    for (function, address) in &lowering.mappings {
        engine.add_global_mapping(function, *address);
    }
    let address = engine
        .get_function_address(&options.entry_symbol)
        .map_err(|e| failed(e.to_string()))?;
    // SAFETY: the entry function was emitted with the `KernelFn` signature.
    let func = unsafe { std::mem::transmute::<usize, KernelFn>(address) };
    std::mem::forget(engine);

    Ok(LoadedKernel {
        func,
        key,
        backend: Backend::Embedded,
        nd_descriptor: ir.params.iter().any(|(n, _)| is_synthesized(n, options)),
        trace: LoweringTrace {
            mode: LoweringMode::Scalar,
            op: None,
            reason: Some("embedded backend lowers per element"),
        },
        _owner: CodeOwner::Leaked,
    })
}

// ============================================================================
// Lowering
// ============================================================================

struct LoopTargets {
    next: Block,
    exit: Block,
}

struct Lowering<'a> {
    context: &'static Context,
    module: Module<'static>,
    builder: Builder<'static>,
    ir: &'a IrProgram,
    output: DType,
    options: &'a CodegenOptions,
    function: Option<FunctionValue<'static>>,
    /// Block holding every `alloca`
    setup: Option<Block>,
    vars: FxHashMap<String, (PointerValue<'static>, DType)>,
    declared: FxHashMap<String, FunctionValue<'static>>,
    mappings: Vec<(FunctionValue<'static>, usize)>,
    loops: Vec<LoopTargets>,
    ret_slot: Option<PointerValue<'static>>,
    epilogue: Option<Block>,
}

impl<'a> Lowering<'a> {
    fn new(
        context: &'static Context,
        ir: &'a IrProgram,
        output: DType,
        options: &'a CodegenOptions,
    ) -> Self {
        Lowering {
            context,
            module: context.create_module(&ir.name),
            builder: context.create_builder(),
            ir,
            output,
            options,
            function: None,
            setup: None,
            vars: FxHashMap::default(),
            declared: FxHashMap::default(),
            mappings: Vec::new(),
            loops: Vec::new(),
            ret_slot: None,
            epilogue: None,
        }
    }

    fn ty(&self, dtype: DType) -> BasicTypeEnum<'static> {
        let c = self.context;
        match dtype {
            DType::Bool | DType::I8 | DType::U8 => c.i8_type().into(),
            DType::I16 | DType::U16 => c.i16_type().into(),
            DType::I32 | DType::U32 => c.i32_type().into(),
            DType::I64 | DType::U64 => c.i64_type().into(),
            DType::F32 => c.f32_type().into(),
            DType::F64 => c.f64_type().into(),
        }
    }

    fn ptr_type(&self) -> PointerType<'static> {
        self.context.i8_type().ptr_type(AddressSpace::default())
    }

    fn block(&self, name: &str) -> Result<Block, JitError> {
        let function = self.function.ok_or_else(|| failed("no current function"))?;
        Ok(self.context.append_basic_block(function, name))
    }

    fn terminated(&self) -> bool {
        self.builder
            .get_insert_block()
            .and_then(|b| b.get_terminator())
            .is_some()
    }

    fn branch(&self, target: Block) -> Result<(), JitError> {
        if !self.terminated() {
            self.builder
                .build_unconditional_branch(target)
                .map_err(failed)?;
        }
        Ok(())
    }

    /// Continue emission in an unreachable block after a jump.
    fn resume(&self) -> Result<(), JitError> {
        let dead = self.block("dead")?;
        self.builder.position_at_end(dead);
        Ok(())
    }

    /// Stack slot in the setup block, so loops never grow the stack.
    fn alloca(&self, dtype: DType, name: &str) -> Result<PointerValue<'static>, JitError> {
        let setup = self.setup.ok_or_else(|| failed("no setup block"))?;
        let b = self.context.create_builder();
        match setup.get_first_instruction() {
            Some(first) => b.position_before(&first),
            None => b.position_at_end(setup),
        }
        b.build_alloca(self.ty(dtype), name).map_err(failed)
    }

    fn load(&self, dtype: DType, ptr: PointerValue<'static>, name: &str) -> Result<Value, JitError> {
        self.builder
            .build_load(self.ty(dtype), ptr, name)
            .map_err(failed)
    }

    fn store(&self, ptr: PointerValue<'static>, value: Value) -> Result<(), JitError> {
        self.builder.build_store(ptr, value).map_err(failed)?;
        Ok(())
    }

    /// `base[index]` for an array of pointers.
    fn pointer_at(&self, base: PointerValue<'static>, index: u64) -> Result<PointerValue<'static>, JitError> {
        let i = self.context.i64_type().const_int(index, false);
        // SAFETY: the caller passes at least `index + 1` pointers.
        let slot = unsafe {
            self.builder
                .build_in_bounds_gep(self.ptr_type(), base, &[i], "slot")
                .map_err(failed)?
        };
        Ok(self
            .builder
            .build_load(self.ptr_type(), slot, "ptr")
            .map_err(failed)?
            .into_pointer_value())
    }

    fn element(
        &self,
        base: PointerValue<'static>,
        dtype: DType,
        index: IntValue<'static>,
    ) -> Result<PointerValue<'static>, JitError> {
        // SAFETY: the caller guarantees `nitems` valid elements.
        unsafe {
            self.builder
                .build_in_bounds_gep(self.ty(dtype), base, &[index], "elem")
                .map_err(failed)
        }
    }

    fn declare(
        &mut self,
        name: &str,
        ret: BasicTypeEnum<'static>,
        params: &[BasicMetadataTypeEnum<'static>],
        address: usize,
    ) -> FunctionValue<'static> {
        if let Some(f) = self.declared.get(name) {
            return *f;
        }
        let fn_type = ret.fn_type(params, false);
        let f = self.module.add_function(name, fn_type, Some(Linkage::External));
        self.declared.insert(name.to_string(), f);
        self.mappings.push((f, address));
        f
    }

    fn call(&self, f: FunctionValue<'static>, args: &[Value], name: &str) -> Result<Value, JitError> {
        let args: Vec<_> = args.iter().map(|a| (*a).into()).collect();
        self.builder
            .build_call(f, &args, name)
            .map_err(failed)?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| failed(format!("call to {name} produced no value")))
    }

    // ------------------------------------------------------------------------
    // Kernel skeleton
    // ------------------------------------------------------------------------

    fn emit_kernel(&mut self) -> Result<(), JitError> {
        let c = self.context;
        let i64t = c.i64_type();
        let i32t = c.i32_type();
        let ptr = self.ptr_type();
        let fn_type = i32t.fn_type(&[ptr.into(), ptr.into(), i64t.into()], false);
        let function = self
            .module
            .add_function(&self.options.entry_symbol, fn_type, None);
        self.function = Some(function);

        let entry = self.block("entry")?;
        let bad = self.block("bad_args")?;
        let setup = self.block("setup")?;
        let head = self.block("item.head")?;
        let body = self.block("item.body")?;
        let epilogue = self.block("item.done")?;
        let exit = self.block("exit")?;
        self.setup = Some(setup);
        self.epilogue = Some(epilogue);

        let param = |i: u32| {
            function
                .get_nth_param(i)
                .ok_or_else(|| failed("entry point parameter missing"))
        };
        let inputs = param(0)?.into_pointer_value();
        let out = param(1)?.into_pointer_value();
        let nitems = param(2)?.into_int_value();

        self.builder.position_at_end(bad);
        self.builder
            .build_return(Some(&i32t.const_int(u64::MAX, true)))
            .map_err(failed)?;

        // invalid arguments
        self.builder.position_at_end(entry);
        let b = &self.builder;
        let null_in = b.build_is_null(inputs, "null_in").map_err(failed)?;
        let null_out = b.build_is_null(out, "null_out").map_err(failed)?;
        let negative = b
            .build_int_compare(IntPredicate::SLT, nitems, i64t.const_zero(), "neg_n")
            .map_err(failed)?;
        let any = b.build_or(null_in, null_out, "bad").map_err(failed)?;
        let any = b.build_or(any, negative, "bad").map_err(failed)?;
        b.build_conditional_branch(any, bad, setup).map_err(failed)?;

        // input pointers, the ND descriptor and stack slots
        self.builder.position_at_end(setup);
        let idx_slot = self.builder.build_alloca(i64t, "idx").map_err(failed)?;
        let ret_slot = self
            .builder
            .build_alloca(self.ty(self.output), "ret")
            .map_err(failed)?;
        self.ret_slot = Some(ret_slot);

        let ir = self.ir;
        let mut missing = c.bool_type().const_zero();
        let mut sources = Vec::with_capacity(ir.params.len());
        let mut descriptor = None;
        if ir.params.iter().any(|(n, _)| is_synthesized(n, self.options)) {
            let desc = self.pointer_at(inputs, ir.params.len() as u64)?;
            let null = self.builder.build_is_null(desc, "null_desc").map_err(failed)?;
            missing = self.builder.build_or(missing, null, "missing").map_err(failed)?;
            descriptor = Some(desc);
        }
        for (i, (name, dtype)) in ir.params.iter().enumerate() {
            let slot = self.builder.build_alloca(self.ty(*dtype), name).map_err(failed)?;
            self.vars.insert(name.clone(), (slot, *dtype));
            if is_synthesized(name, self.options) {
                sources.push(None);
                continue;
            }
            let p = self.pointer_at(inputs, i as u64)?;
            let null = self.builder.build_is_null(p, "null_param").map_err(failed)?;
            missing = self.builder.build_or(missing, null, "missing").map_err(failed)?;
            sources.push(Some(p));
        }
        for (name, dtype) in &ir.locals {
            let slot = self.builder.build_alloca(self.ty(*dtype), name).map_err(failed)?;
            self.vars.insert(name.clone(), (slot, *dtype));
        }
        self.store(idx_slot, i64t.const_zero().into())?;
        self.builder
            .build_conditional_branch(missing, bad, head)
            .map_err(failed)?;

        // item loop
        self.builder.position_at_end(head);
        let idx = self.load(DType::I64, idx_slot, "i")?.into_int_value();
        let more = self
            .builder
            .build_int_compare(IntPredicate::SLT, idx, nitems, "more")
            .map_err(failed)?;
        self.builder
            .build_conditional_branch(more, body, exit)
            .map_err(failed)?;

        self.builder.position_at_end(body);
        for ((name, dtype), source) in ir.params.iter().zip(&sources) {
            let (slot, _) = self.vars[name];
            let value = match (source, Reserved::parse(name), descriptor) {
                (Some(base), _, _) => {
                    let p = self.element(*base, *dtype, idx)?;
                    self.load(*dtype, p, name)?
                }
                (None, Some(reserved), Some(desc)) => {
                    let v = self.reserved(desc, reserved, idx)?;
                    self.cast(v, DType::I64, *dtype)?
                }
                _ => return Err(failed(format!("no source for parameter '{name}'"))),
            };
            self.store(slot, value)?;
        }
        for (name, dtype) in &ir.locals {
            let (slot, _) = self.vars[name];
            let zero = self.constant(Scalar::zero(*dtype));
            self.store(slot, zero)?;
        }
        let zero = self.constant(Scalar::zero(self.output));
        self.store(ret_slot, zero)?;
        self.statements(&ir.block)?;
        self.branch(epilogue)?;

        self.builder.position_at_end(epilogue);
        let value = self.load(self.output, ret_slot, "result")?;
        let dst = self.element(out, self.output, idx)?;
        self.store(dst, value)?;
        let next = self
            .builder
            .build_int_add(idx, i64t.const_int(1, false), "next")
            .map_err(failed)?;
        self.store(idx_slot, next.into())?;
        self.builder.build_unconditional_branch(head).map_err(failed)?;

        self.builder.position_at_end(exit);
        self.builder
            .build_return(Some(&i32t.const_zero()))
            .map_err(failed)?;
        Ok(())
    }

    fn reserved(
        &mut self,
        desc: PointerValue<'static>,
        reserved: Reserved,
        idx: IntValue<'static>,
    ) -> Result<Value, JitError> {
        let c = self.context;
        let helper = self.declare(
            RESERVED_HELPER,
            c.i64_type().into(),
            &[self.ptr_type().into(), c.i32_type().into(), c.i64_type().into()],
            reserved_from_descriptor as usize,
        );
        let code = c.i32_type().const_int(reserved_code(reserved) as u64, false);
        self.call(helper, &[desc.into(), code.into(), idx.into()], "reserved")
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    fn statements(&mut self, block: &IrBlock) -> Result<(), JitError> {
        for stmt in block {
            match &stmt.kind {
                IrStmtKind::Assign { name, value } => {
                    let v = self.expr(value)?;
                    let (slot, dtype) = *self
                        .vars
                        .get(name)
                        .ok_or_else(|| failed(format!("unknown local '{name}'")))?;
                    let v = self.cast(v, value.dtype, dtype)?;
                    self.store(slot, v)?;
                }
                IrStmtKind::Return(value) => {
                    let v = self.expr(value)?;
                    let v = self.cast(v, value.dtype, self.output)?;
                    let slot = self.ret_slot.ok_or_else(|| failed("no return slot"))?;
                    self.store(slot, v)?;
                    let epilogue = self.epilogue.ok_or_else(|| failed("no epilogue"))?;
                    self.branch(epilogue)?;
                    self.resume()?;
                }
                IrStmtKind::If {
                    cond,
                    then_block,
                    elifs,
                    else_block,
                } => {
                    let merge = self.block("if.end")?;
                    let branches = std::iter::once((cond, then_block))
                        .chain(elifs.iter().map(|b| (&b.cond, &b.block)));
                    for (cond, body) in branches {
                        let taken = self.condition(cond)?;
                        let then_bb = self.block("if.then")?;
                        let else_bb = self.block("if.else")?;
                        self.builder
                            .build_conditional_branch(taken, then_bb, else_bb)
                            .map_err(failed)?;
                        self.builder.position_at_end(then_bb);
                        self.statements(body)?;
                        self.branch(merge)?;
                        self.builder.position_at_end(else_bb);
                    }
                    if let Some(body) = else_block {
                        self.statements(body)?;
                    }
                    self.branch(merge)?;
                    self.builder.position_at_end(merge);
                }
                IrStmtKind::For {
                    var,
                    start,
                    limit,
                    step,
                    body,
                } => self.for_loop(var, *start, limit, *step, body)?,
                IrStmtKind::Break => {
                    let exit = self.loops.last().map(|l| l.exit).ok_or_else(|| failed("break outside loop"))?;
                    self.branch(exit)?;
                    self.resume()?;
                }
                IrStmtKind::Continue => {
                    let next = self.loops.last().map(|l| l.next).ok_or_else(|| failed("continue outside loop"))?;
                    self.branch(next)?;
                    self.resume()?;
                }
            }
        }
        Ok(())
    }

    fn for_loop(
        &mut self,
        var: &str,
        start: i64,
        limit: &IrExpr,
        step: i64,
        body: &IrBlock,
    ) -> Result<(), JitError> {
        let i64t = self.context.i64_type();
        let stop = self.expr(limit)?;
        let stop = self.cast(stop, limit.dtype, DType::I64)?.into_int_value();
        if step == 0 {
            return Ok(());
        }
        let (var_slot, var_dtype) = *self
            .vars
            .get(var)
            .ok_or_else(|| failed(format!("unknown loop variable '{var}'")))?;
        let iv = self.alloca(DType::I64, "iv")?;
        self.store(iv, i64t.const_int(start as u64, true).into())?;

        let head = self.block("for.head")?;
        let body_bb = self.block("for.body")?;
        let next = self.block("for.next")?;
        let exit = self.block("for.end")?;
        self.branch(head)?;

        self.builder.position_at_end(head);
        let i = self.load(DType::I64, iv, "iv")?.into_int_value();
        let pred = if step > 0 { IntPredicate::SLT } else { IntPredicate::SGT };
        let more = self
            .builder
            .build_int_compare(pred, i, stop, "for.more")
            .map_err(failed)?;
        self.builder
            .build_conditional_branch(more, body_bb, exit)
            .map_err(failed)?;

        self.builder.position_at_end(body_bb);
        let v = self.cast(i.into(), DType::I64, var_dtype)?;
        self.store(var_slot, v)?;
        self.loops.push(LoopTargets { next, exit });
        let lowered = self.statements(body);
        self.loops.pop();
        lowered?;
        self.branch(next)?;

        self.builder.position_at_end(next);
        let i = self.load(DType::I64, iv, "iv")?.into_int_value();
        let stepped = self
            .builder
            .build_int_add(i, i64t.const_int(step as u64, true), "iv.next")
            .map_err(failed)?;
        self.store(iv, stepped.into())?;
        self.builder.build_unconditional_branch(head).map_err(failed)?;

        self.builder.position_at_end(exit);
        Ok(())
    }

    fn condition(&mut self, cond: &IrExpr) -> Result<IntValue<'static>, JitError> {
        let v = self.expr(cond)?;
        self.truthy(v, cond.dtype)
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn expr(&mut self, expr: &IrExpr) -> Result<Value, JitError> {
        self.typed(&expr.typed)
    }

    fn constant(&self, value: Scalar) -> Value {
        let c = self.context;
        let int = |dtype: DType, bits: u64| self.ty(dtype).into_int_type().const_int(bits, false).into();
        match value {
            Scalar::Bool(b) => int(DType::Bool, u64::from(b)),
            Scalar::I8(v) => int(DType::I8, v as u64),
            Scalar::I16(v) => int(DType::I16, v as u64),
            Scalar::I32(v) => int(DType::I32, v as u64),
            Scalar::I64(v) => int(DType::I64, v as u64),
            Scalar::U8(v) => int(DType::U8, u64::from(v)),
            Scalar::U16(v) => int(DType::U16, u64::from(v)),
            Scalar::U32(v) => int(DType::U32, u64::from(v)),
            Scalar::U64(v) => int(DType::U64, v),
            Scalar::F32(v) => c.f32_type().const_float(f64::from(v)).into(),
            Scalar::F64(v) => c.f64_type().const_float(v).into(),
        }
    }

    fn typed(&mut self, expr: &TypedExpr) -> Result<Value, JitError> {
        let dtype = expr.dtype;
        match &expr.kind {
            TypedKind::Const(Const::Bool(b)) => Ok(self.constant(Scalar::Bool(*b).cast(dtype))),
            TypedKind::Const(Const::Int(v)) => Ok(self.constant(Scalar::from_u64(*v, dtype))),
            TypedKind::Const(Const::Float(v)) => Ok(self.constant(Scalar::from_f64(*v, dtype))),
            TypedKind::Var(name) => {
                let (slot, var_dtype) = *self
                    .vars
                    .get(name)
                    .ok_or_else(|| failed(format!("unknown variable '{name}'")))?;
                let v = self.load(var_dtype, slot, name)?;
                self.cast(v, var_dtype, dtype)
            }
            TypedKind::Cast(inner) => {
                let v = self.typed(inner)?;
                self.cast(v, inner.dtype, dtype)
            }
            TypedKind::Unary { op, operand } => self.unary(dtype, *op, operand),
            TypedKind::Binary { op, lhs, rhs } => self.binary(dtype, *op, lhs, rhs),
            TypedKind::Call { func, args } => self.math(dtype, *func, args),
            TypedKind::Where {
                cond,
                then,
                otherwise,
            } => {
                let c = self.typed(cond)?;
                let c = self.truthy(c, cond.dtype)?;
                let a = self.typed(then)?;
                let a = self.cast(a, then.dtype, dtype)?;
                let b = self.typed(otherwise)?;
                let b = self.cast(b, otherwise.dtype, dtype)?;
                self.builder.build_select(c, a, b, "where").map_err(failed)
            }
        }
    }

    fn unary(&mut self, dtype: DType, op: UnaryOp, operand: &TypedExpr) -> Result<Value, JitError> {
        let v = self.typed(operand)?;
        let b = &self.builder;
        match op {
            UnaryOp::Pos => self.cast(v, operand.dtype, dtype),
            UnaryOp::Neg => {
                let v = self.cast(v, operand.dtype, dtype)?;
                if dtype.is_float() {
                    Ok(b.build_float_neg(v.into_float_value(), "neg").map_err(failed)?.into())
                } else {
                    Ok(b.build_int_neg(v.into_int_value(), "neg").map_err(failed)?.into())
                }
            }
            UnaryOp::Not => {
                let t = self.truthy(v, operand.dtype)?;
                let f = b.build_not(t, "not").map_err(failed)?;
                let v = self.widen_bool(f)?;
                self.cast(v, DType::Bool, dtype)
            }
            UnaryOp::BitNot => {
                if !operand.dtype.is_integral() {
                    return Err(JitError::codegen("bitwise '~' requires an integer operand"));
                }
                let v = self.cast(v, operand.dtype, dtype)?;
                Ok(b.build_not(v.into_int_value(), "bitnot").map_err(failed)?.into())
            }
        }
    }

    fn binary(
        &mut self,
        dtype: DType,
        op: BinaryOp,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
    ) -> Result<Value, JitError> {
        if matches!(op, BinaryOp::Mod | BinaryOp::Pow | BinaryOp::FloorDiv) {
            return Err(JitError::codegen(format!(
                "operator '{}' is not supported by the compiled backend",
                op.symbol()
            )));
        }
        if op.is_bitwise() && !(lhs.dtype.is_integral() && rhs.dtype.is_integral()) {
            return Err(JitError::codegen(format!(
                "bitwise operator '{}' requires integer operands",
                op.symbol()
            )));
        }
        let a = self.typed(lhs)?;
        let b = self.typed(rhs)?;

        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let x = self.truthy(a, lhs.dtype)?;
            let y = self.truthy(b, rhs.dtype)?;
            let r = if op == BinaryOp::And {
                self.builder.build_and(x, y, "and")
            } else {
                self.builder.build_or(x, y, "or")
            }
            .map_err(failed)?;
            let r = self.widen_bool(r)?;
            return self.cast(r, DType::Bool, dtype);
        }

        if op.is_comparison() {
            let common = if lhs.dtype == rhs.dtype {
                lhs.dtype
            } else {
                promote(lhs.dtype, rhs.dtype)
            };
            let a = self.cast(a, lhs.dtype, common)?;
            let b = self.cast(b, rhs.dtype, common)?;
            let r = self.compare(op, common, a, b)?;
            let r = self.widen_bool(r)?;
            return self.cast(r, DType::Bool, dtype);
        }

        if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            let width = self.ty(lhs.dtype).into_int_type();
            let mask = u64::from(lhs.dtype.bits() - 1);
            let count = self.cast(b, rhs.dtype, DType::U64)?.into_int_value();
            let count = self
                .builder
                .build_int_truncate_or_bit_cast(count, width, "count")
                .map_err(failed)?;
            let count = self
                .builder
                .build_and(count, width.const_int(mask, false), "count")
                .map_err(failed)?;
            let a = a.into_int_value();
            let r = if op == BinaryOp::Shl {
                self.builder.build_left_shift(a, count, "shl")
            } else {
                self.builder
                    .build_right_shift(a, count, lhs.dtype.is_signed_int(), "shr")
            }
            .map_err(failed)?;
            return self.cast(r.into(), lhs.dtype, dtype);
        }

        let a = self.cast(a, lhs.dtype, dtype)?;
        let b = self.cast(b, rhs.dtype, dtype)?;
        let bl = &self.builder;
        if dtype.is_float() {
            let (x, y) = (a.into_float_value(), b.into_float_value());
            let r = match op {
                BinaryOp::Add => bl.build_float_add(x, y, "add"),
                BinaryOp::Sub => bl.build_float_sub(x, y, "sub"),
                BinaryOp::Mul => bl.build_float_mul(x, y, "mul"),
                BinaryOp::Div => bl.build_float_div(x, y, "div"),
                other => return Err(JitError::codegen(format!("operator '{}' on floats", other.symbol()))),
            }
            .map_err(failed)?;
            return Ok(r.into());
        }
        let (x, y) = (a.into_int_value(), b.into_int_value());
        let r = match op {
            BinaryOp::Add => bl.build_int_add(x, y, "add"),
            BinaryOp::Sub => bl.build_int_sub(x, y, "sub"),
            BinaryOp::Mul => bl.build_int_mul(x, y, "mul"),
            BinaryOp::BitAnd => bl.build_and(x, y, "band"),
            BinaryOp::BitOr => bl.build_or(x, y, "bor"),
            BinaryOp::BitXor => bl.build_xor(x, y, "bxor"),
            BinaryOp::Div => {
                // integer division by zero yields 0 instead of trapping
                let zero = x.get_type().const_zero();
                let is_zero = bl
                    .build_int_compare(IntPredicate::EQ, y, zero, "div.zero")
                    .map_err(failed)?;
                let one = x.get_type().const_int(1, false);
                let safe = bl
                    .build_select(is_zero, one, y, "div.rhs")
                    .map_err(failed)?
                    .into_int_value();
                let q = if dtype.is_signed_int() {
                    bl.build_int_signed_div(x, safe, "div")
                } else {
                    bl.build_int_unsigned_div(x, safe, "div")
                }
                .map_err(failed)?;
                return bl
                    .build_select(is_zero, zero, q, "div")
                    .map_err(failed);
            }
            other => return Err(JitError::codegen(format!("operator '{}' on integers", other.symbol()))),
        }
        .map_err(failed)?;
        Ok(r.into())
    }

    fn compare(&self, op: BinaryOp, dtype: DType, a: Value, b: Value) -> Result<IntValue<'static>, JitError> {
        let bl = &self.builder;
        if dtype.is_float() {
            let pred = match op {
                BinaryOp::Eq => FloatPredicate::OEQ,
                BinaryOp::Ne => FloatPredicate::UNE,
                BinaryOp::Lt => FloatPredicate::OLT,
                BinaryOp::Le => FloatPredicate::OLE,
                BinaryOp::Gt => FloatPredicate::OGT,
                _ => FloatPredicate::OGE,
            };
            return bl
                .build_float_compare(pred, a.into_float_value(), b.into_float_value(), "cmp")
                .map_err(failed);
        }
        let signed = dtype.is_signed_int();
        let pred = match (op, signed) {
            (BinaryOp::Eq, _) => IntPredicate::EQ,
            (BinaryOp::Ne, _) => IntPredicate::NE,
            (BinaryOp::Lt, true) => IntPredicate::SLT,
            (BinaryOp::Lt, false) => IntPredicate::ULT,
            (BinaryOp::Le, true) => IntPredicate::SLE,
            (BinaryOp::Le, false) => IntPredicate::ULE,
            (BinaryOp::Gt, true) => IntPredicate::SGT,
            (BinaryOp::Gt, false) => IntPredicate::UGT,
            (_, true) => IntPredicate::SGE,
            (_, false) => IntPredicate::UGE,
        };
        bl.build_int_compare(pred, a.into_int_value(), b.into_int_value(), "cmp")
            .map_err(failed)
    }

    fn math(&mut self, dtype: DType, func: MathFunc, args: &[TypedExpr]) -> Result<Value, JitError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.typed(arg)?;
            values.push(self.cast(v, arg.dtype, dtype)?);
        }
        let first = *values
            .first()
            .ok_or_else(|| JitError::codegen(format!("{}() needs an argument", func.name())))?;

        if func == MathFunc::Abs && !dtype.is_float() {
            if !dtype.is_signed_int() {
                return Ok(first);
            }
            let x = first.into_int_value();
            let b = &self.builder;
            let negative = b
                .build_int_compare(IntPredicate::SLT, x, x.get_type().const_zero(), "abs.neg")
                .map_err(failed)?;
            let flipped = b.build_int_neg(x, "abs.flip").map_err(failed)?;
            return b.build_select(negative, flipped, x, "abs").map_err(failed);
        }
        if !dtype.is_float() {
            return Err(JitError::codegen(format!("{}() on non-float type {dtype}", func.name())));
        }

        let kind = if dtype == DType::F32 {
            SlotKind::ScalarF32
        } else {
            SlotKind::ScalarF64
        };
        let fty = self.ty(dtype);
        let params: Vec<BasicMetadataTypeEnum<'static>> =
            (0..func.arity()).map(|_| fty.into()).collect();
        let f = self.declare(
            &symbol_name(func, kind),
            fty,
            &params,
            BRIDGE.address(func, kind),
        );
        self.call(f, &values, func.name())
    }

    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    /// `value != 0` as `i1`; NaN counts as true.
    fn truthy(&self, value: Value, dtype: DType) -> Result<IntValue<'static>, JitError> {
        if dtype.is_float() {
            let v = value.into_float_value();
            self.builder
                .build_float_compare(FloatPredicate::UNE, v, v.get_type().const_zero(), "truthy")
                .map_err(failed)
        } else {
            let v = value.into_int_value();
            self.builder
                .build_int_compare(IntPredicate::NE, v, v.get_type().const_zero(), "truthy")
                .map_err(failed)
        }
    }

    fn widen_bool(&self, bit: IntValue<'static>) -> Result<Value, JitError> {
        Ok(self
            .builder
            .build_int_z_extend(bit, self.context.i8_type(), "bool")
            .map_err(failed)?
            .into())
    }

    /// Convert with the same rules as the generated C cast macros.
    fn cast(&self, value: Value, from: DType, to: DType) -> Result<Value, JitError> {
        if from == to {
            return Ok(value);
        }
        if to == DType::Bool {
            let t = self.truthy(value, from)?;
            return self.widen_bool(t);
        }
        let b = &self.builder;
        let target = self.ty(to);
        let r: Value = match (from.is_float(), to.is_float()) {
            (true, true) => {
                let v = value.into_float_value();
                let t = target.into_float_type();
                if to.bits() > from.bits() {
                    b.build_float_ext(v, t, "fext").map_err(failed)?.into()
                } else {
                    b.build_float_trunc(v, t, "ftrunc").map_err(failed)?.into()
                }
            }
            (false, true) => {
                let v = value.into_int_value();
                let t = target.into_float_type();
                if from.is_signed_int() {
                    b.build_signed_int_to_float(v, t, "sitofp").map_err(failed)?.into()
                } else {
                    b.build_unsigned_int_to_float(v, t, "uitofp").map_err(failed)?.into()
                }
            }
            (true, false) => {
                // saturating, NaN -> 0
                let name = if to.is_signed_int() {
                    "llvm.fptosi.sat"
                } else {
                    "llvm.fptoui.sat"
                };
                let intrinsic =
                    Intrinsic::find(name).ok_or_else(|| failed(format!("missing intrinsic {name}")))?;
                let decl = intrinsic
                    .get_declaration(&self.module, &[target, self.ty(from)])
                    .ok_or_else(|| failed(format!("cannot declare {name}")))?;
                self.call(decl, &[value], "fptoint")?
            }
            (false, false) => {
                let v = value.into_int_value();
                let t = target.into_int_type();
                let (fb, tb) = (v.get_type().get_bit_width(), t.get_bit_width());
                if tb > fb {
                    if from.is_signed_int() {
                        b.build_int_s_extend(v, t, "sext").map_err(failed)?.into()
                    } else {
                        b.build_int_z_extend(v, t, "zext").map_err(failed)?.into()
                    }
                } else if tb < fb {
                    b.build_int_truncate(v, t, "trunc").map_err(failed)?.into()
                } else {
                    v.into()
                }
            }
        };
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use veckern::{DefaultResolver, build_ir, parse};

    fn kernel(src: &str, params: &[(&str, DType)], output: DType) -> LoadedKernel {
        let program = parse(src).unwrap();
        let params: Vec<(String, DType)> =
            params.iter().map(|(n, d)| (n.to_string(), *d)).collect();
        let ir = build_ir(&program, &params, &mut DefaultResolver).unwrap();
        compile(1, &ir, output, &CodegenOptions::default()).unwrap()
    }

    #[test]
    fn test_cast_chain() {
        let k = kernel(
            "def k(x):\n    return float(int(x)) + bool(x)\n",
            &[("x", DType::F64)],
            DType::F64,
        );
        let x = [0.0, 0.2, 1.0, 1.9, 2.0, 3.2];
        let mut out = [0.0f64; 6];
        let inputs = [x.as_ptr() as *const c_void];
        let rc = unsafe { k.call(&inputs, out.as_mut_ptr() as *mut c_void, 6) };
        assert_eq!(rc, 0);
        assert_eq!(out, [0.0, 1.0, 2.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_loop_and_math() {
        let k = kernel(
            "# me:dialect=element\ndef k(x):\n    acc = 0.0\n    for i in range(4):\n        if i >= x:\n            break\n        acc = acc + sqrt(i * 1.0)\n    return acc\n",
            &[("x", DType::F64)],
            DType::F64,
        );
        let x = [0.0, 1.0, 3.0];
        let mut out = [0.0f64; 3];
        let inputs = [x.as_ptr() as *const c_void];
        unsafe { k.call(&inputs, out.as_mut_ptr() as *mut c_void, 3) };
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 1.0 + 2f64.sqrt());
    }

    #[test]
    fn test_saturating_int_output() {
        let k = kernel("def k(x):\n    return x * 2\n", &[("x", DType::F64)], DType::I8);
        let x = [100.0, -100.0, f64::NAN];
        let mut out = [0i8; 3];
        let inputs = [x.as_ptr() as *const c_void];
        unsafe { k.call(&inputs, out.as_mut_ptr() as *mut c_void, 3) };
        assert_eq!(out, [127, -128, 0]);
    }

    #[test]
    fn test_reserved_index() {
        let k = kernel(
            "def k(x):\n    return x + _i0\n",
            &[("x", DType::I64), ("_i0", DType::I64)],
            DType::I64,
        );
        let nd = crate::nd::NdContext::linear(4);
        let desc = nd.descriptor();
        let x = [10i64; 4];
        let mut out = [0i64; 4];
        let inputs = [
            x.as_ptr() as *const c_void,
            std::ptr::null(),
            desc.as_ptr() as *const c_void,
        ];
        let rc = unsafe { k.call(&inputs, out.as_mut_ptr() as *mut c_void, 4) };
        assert_eq!(rc, 0);
        assert_eq!(out, [10, 11, 12, 13]);
    }

    #[test]
    fn test_rejects_modulo() {
        let program = parse("def k(x):\n    return x % 2\n").unwrap();
        let ir = build_ir(&program, &[("x".to_string(), DType::I64)], &mut DefaultResolver).unwrap();
        let err = compile(1, &ir, DType::I64, &CodegenOptions::default()).unwrap_err();
        assert_eq!(err.kind, super::super::error::JitErrorKind::Codegen);
    }
}
