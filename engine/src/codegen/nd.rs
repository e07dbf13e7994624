//! Synthesis of reserved geometry names from the ND descriptor.

use std::collections::BTreeSet;

use veckern::Reserved;
use veckern::expr::MAX_DIMS;

use super::CodegenOptions;
use super::emit::CodeBuf;

/// Reserved names a kernel materializes instead of loading from inputs.
#[derive(Debug, Clone, Default)]
pub(crate) struct NdUse {
    ndim: bool,
    flat: bool,
    indices: BTreeSet<usize>,
    extents: BTreeSet<usize>,
}

impl NdUse {
    pub fn is_empty(&self) -> bool {
        !self.ndim && !self.flat && self.indices.is_empty() && self.extents.is_empty()
    }

    fn add(&mut self, reserved: Reserved) {
        match reserved {
            Reserved::NDim => self.ndim = true,
            Reserved::FlatIdx => self.flat = true,
            Reserved::Index(d) => {
                self.indices.insert(d);
            }
            Reserved::Extent(d) => {
                self.extents.insert(d);
            }
        }
    }

    fn needs_coords(&self) -> bool {
        self.flat || !self.indices.is_empty()
    }
}

/// The reserved symbol `name` stands for when `options` let codegen supply it.
pub(crate) fn synthesized(name: &str, options: &CodegenOptions) -> Option<Reserved> {
    let reserved = Reserved::parse(name)?;
    let enabled = if reserved.is_per_dimension() {
        options.nd_synth
    } else {
        options.index_vars_synth
    };
    enabled.then_some(reserved)
}

pub(crate) fn collect<'a>(
    params: impl IntoIterator<Item = &'a str>,
    options: &CodegenOptions,
) -> NdUse {
    let mut used = NdUse::default();
    for name in params {
        if let Some(reserved) = synthesized(name, options) {
            used.add(reserved);
        }
    }
    used
}

/// Validate the descriptor at `inputs[slot]` and hoist per-call values.
pub(crate) fn write_setup(buf: &mut CodeBuf, used: &NdUse, slot: usize) {
    buf.line(format!(
        "const int64_t *__me_nd = (const int64_t *)__me_inputs[{slot}];"
    ));
    buf.line("int64_t __me_ndim;");
    buf.line("if (!__me_nd) return -1;");
    buf.line("__me_ndim = __me_nd[0];");
    buf.line(format!("if (__me_ndim < 1 || __me_ndim > {MAX_DIMS}) return -1;"));
    buf.line("const int64_t *__me_shape = __me_nd + 1;");
    buf.line(format!("const int64_t *__me_bstart = __me_nd + {};", 1 + MAX_DIMS));
    buf.line(format!(
        "const int64_t *__me_bshape = __me_nd + {};",
        1 + 2 * MAX_DIMS
    ));
    if used.ndim {
        buf.line("const int64_t _ndim = __me_ndim;");
    }
    for d in &used.extents {
        buf.line(format!(
            "const int64_t _n{d} = {d} < __me_ndim ? __me_shape[{d}] : 1;"
        ));
    }
    if used.flat {
        // A block spanning every trailing dimension is one contiguous run.
        buf.line("int __me_contig = 1;");
        buf.line("int64_t __me_flat_base = 0;");
        buf.open("for (int64_t __me_d = 0; __me_d < __me_ndim; __me_d++) {");
        buf.line("__me_flat_base = __me_flat_base * __me_shape[__me_d] + __me_bstart[__me_d];");
        buf.open(
            "if (__me_d > 0 && (__me_bstart[__me_d] != 0 || __me_bshape[__me_d] != __me_shape[__me_d])) {",
        );
        buf.line("__me_contig = 0;");
        buf.close("}");
        buf.close("}");
    }
}

/// Declare the per-item reserved names inside the element loop.
pub(crate) fn write_item(buf: &mut CodeBuf, used: &NdUse) {
    if !used.needs_coords() {
        return;
    }
    let coords_always = !used.indices.is_empty();
    buf.line(format!("int64_t __me_coord[{MAX_DIMS}] = {{0}};"));
    if coords_always {
        buf.open("{");
    } else {
        buf.open("if (!__me_contig) {");
    }
    buf.line("int64_t __me_rem = __me_idx;");
    buf.open("for (int64_t __me_d = __me_ndim - 1; __me_d >= 0; __me_d--) {");
    buf.line("int64_t __me_ext = __me_bshape[__me_d];");
    buf.line("int64_t __me_local = 0;");
    buf.open("if (__me_ext > 0) {");
    buf.line("__me_local = __me_rem % __me_ext;");
    buf.line("__me_rem /= __me_ext;");
    buf.close("}");
    buf.line("__me_coord[__me_d] = __me_bstart[__me_d] + __me_local;");
    buf.close("}");
    buf.close("}");
    for d in &used.indices {
        buf.line(format!("int64_t _i{d} = __me_coord[{d}];"));
    }
    if used.flat {
        buf.line("int64_t _flat_idx = __me_flat_base + __me_idx;");
        buf.open("if (!__me_contig) {");
        buf.line("_flat_idx = 0;");
        buf.open("for (int64_t __me_d = 0; __me_d < __me_ndim; __me_d++) {");
        buf.line("_flat_idx = _flat_idx * __me_shape[__me_d] + __me_coord[__me_d];");
        buf.close("}");
        buf.close("}");
    }
}
