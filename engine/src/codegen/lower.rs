//! Statement lowering for the per-element kernel loop.

use veckern::{DType, IrBlock, IrExpr, IrProgram, IrStmtKind};

use super::emit::{CodeBuf, ExprEmitter, cast_expr};
use super::nd::{self, NdUse};
use super::{CodegenError, CodegenOptions};

pub(crate) struct KernelWriter<'a> {
    ir: &'a IrProgram,
    output: DType,
    options: &'a CodegenOptions,
    pub buf: CodeBuf,
    pub emitter: ExprEmitter,
    loops: usize,
}

impl<'a> KernelWriter<'a> {
    pub fn new(ir: &'a IrProgram, output: DType, options: &'a CodegenOptions) -> Self {
        KernelWriter {
            ir,
            output,
            options,
            buf: CodeBuf::new(),
            emitter: ExprEmitter::new(options.math_bridge),
            loops: 0,
        }
    }

    fn expr(&mut self, expr: &IrExpr) -> Result<String, CodegenError> {
        self.emitter
            .emit(&expr.typed)
            .map_err(|msg| CodegenError::new(expr.line, expr.column, msg))
    }

    /// Per-item loop: load inputs, synthesize reserved names, run the body.
    pub fn write_element_loop(&mut self, nd_use: &NdUse) -> Result<(), CodegenError> {
        let ir = self.ir;
        let out_ty = self.output.c_type();
        self.buf
            .open("for (int64_t __me_idx = 0; __me_idx < __me_nitems; __me_idx++) {");
        for (i, (name, dtype)) in ir.params.iter().enumerate() {
            if nd::synthesized(name, self.options).is_none() {
                self.buf
                    .line(format!("{} {name} = __me_in{i}[__me_idx];", dtype.c_type()));
            }
        }
        nd::write_item(&mut self.buf, nd_use);
        for (name, dtype) in &ir.locals {
            let ty = dtype.c_type();
            self.buf.line(format!("{ty} {name} = ({ty})0;"));
        }
        self.buf.line(format!("{out_ty} __me_ret = ({out_ty})0;"));
        self.write_block(&ir.block)?;
        self.buf.line("__me_return_idx:");
        self.buf.line("__me_dst[__me_idx] = __me_ret;");
        self.buf.close("}");
        Ok(())
    }

    fn write_block(&mut self, block: &IrBlock) -> Result<(), CodegenError> {
        for stmt in block {
            match &stmt.kind {
                IrStmtKind::Assign { name, value } => {
                    let text = self.expr(value)?;
                    self.buf.line(format!("{name} = {text};"));
                }
                IrStmtKind::Return(value) => {
                    let text = self.expr(value)?;
                    let stored = cast_expr(value.dtype, self.output, &text);
                    self.buf.line(format!("__me_ret = {stored};"));
                    self.buf.line("goto __me_return_idx;");
                }
                IrStmtKind::If {
                    cond,
                    then_block,
                    elifs,
                    else_block,
                } => {
                    let c = self.condition(cond)?;
                    self.buf.open(format!("if ({c}) {{"));
                    self.write_block(then_block)?;
                    for branch in elifs {
                        let c = self.condition(&branch.cond)?;
                        self.buf.close(format!("}} else if ({c}) {{"));
                        self.buf.indent();
                        self.write_block(&branch.block)?;
                    }
                    if let Some(block) = else_block {
                        self.buf.close("} else {");
                        self.buf.indent();
                        self.write_block(block)?;
                    }
                    self.buf.close("}");
                }
                IrStmtKind::For {
                    var,
                    start,
                    limit,
                    step,
                    body,
                } => {
                    let n = self.loops;
                    self.loops += 1;
                    let limit_text = self.expr(limit)?;
                    let stop = cast_expr(limit.dtype, DType::I64, &limit_text);
                    let var_ty = self
                        .ir
                        .locals
                        .iter()
                        .find(|(name, _)| name == var)
                        .map_or(DType::I64, |(_, dt)| *dt)
                        .c_type();
                    self.buf.open("{");
                    self.buf.line(format!("int64_t __me_start{n} = {start}LL;"));
                    self.buf.line(format!("int64_t __me_stop{n} = {stop};"));
                    self.buf.line(format!("int64_t __me_step{n} = {step}LL;"));
                    self.buf.open(format!("if (__me_step{n} != 0) {{"));
                    self.buf.open(format!(
                        "for (int64_t __me_iv{n} = __me_start{n}; \
                         __me_step{n} > 0 ? __me_iv{n} < __me_stop{n} : __me_iv{n} > __me_stop{n}; \
                         __me_iv{n} += __me_step{n}) {{"
                    ));
                    self.buf.line(format!("{var} = ({var_ty})__me_iv{n};"));
                    self.write_block(body)?;
                    self.buf.close("}");
                    self.buf.close("}");
                    self.buf.close("}");
                }
                IrStmtKind::Break => self.buf.line("break;"),
                IrStmtKind::Continue => self.buf.line("continue;"),
            }
        }
        Ok(())
    }

    fn condition(&mut self, cond: &IrExpr) -> Result<String, CodegenError> {
        let text = self.expr(cond)?;
        let ty = cond.dtype.c_type();
        Ok(format!("({text}) != ({ty})0"))
    }
}
