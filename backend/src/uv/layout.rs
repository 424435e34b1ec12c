//! Axis-order mapping between an in-memory cube layout and file order.
//!
//! A UV file stores each cube with the descriptor's first axis varying
//! fastest. Sources deliver cubes in their own order, so an [`AxisPlan`]
//! precomputes, once per scan, the source offset of every file-order element.
//! Writing a sample is then a single gather pass.

use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::models::{CubeLayout, UvDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisPlan {
    source_len: usize,
    gather: Vec<usize>,
}

impl AxisPlan {
    /// Plan from `source` layout into the file order of `descriptor`.
    pub fn to_file_order(source: &CubeLayout, descriptor: &UvDescriptor) -> PipelineResult<Self> {
        Self::between(source, &CubeLayout::file_order(descriptor))
    }

    /// Plan from `source` into an arbitrary `target` layout.
    ///
    /// Every non-singleton axis of either layout must appear in the other
    /// with the same length; singleton axes may be omitted on either side.
    pub fn between(source: &CubeLayout, target: &CubeLayout) -> PipelineResult<Self> {
        let source_strides = c_order_strides(source);

        for (kind, len) in &source.axes {
            if *len != 1 && target.axis_len(*kind).is_none() {
                return Err(mismatch(format!(
                    "source axis {} (length {}) has no counterpart in the descriptor",
                    kind.ctype(),
                    len
                )));
            }
        }

        let mut dims = Vec::with_capacity(target.axes.len());
        let mut strides = Vec::with_capacity(target.axes.len());
        for (kind, len) in &target.axes {
            match source.axes.iter().position(|(k, _)| k == kind) {
                Some(pos) => {
                    let source_len = source.axes[pos].1;
                    if source_len != *len {
                        return Err(mismatch(format!(
                            "axis {} has length {} in source but {} in descriptor",
                            kind.ctype(),
                            source_len,
                            len
                        )));
                    }
                    strides.push(source_strides[pos]);
                }
                None if *len == 1 => strides.push(0),
                None => {
                    return Err(mismatch(format!(
                        "descriptor axis {} (length {}) missing from source",
                        kind.ctype(),
                        len
                    )))
                }
            }
            dims.push(*len);
        }

        let total: usize = dims.iter().product();
        let mut gather = Vec::with_capacity(total);
        let mut index = vec![0usize; dims.len()];
        for _ in 0..total {
            gather.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
            for d in (0..dims.len()).rev() {
                index[d] += 1;
                if index[d] < dims[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        Ok(Self {
            source_len: source.len(),
            gather,
        })
    }

    /// Number of values a source cube must hold.
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Number of values produced per cube.
    pub fn len(&self) -> usize {
        self.gather.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gather.is_empty()
    }

    /// Verify that a cube of `len` values fits this plan.
    pub fn check_len(&self, len: usize) -> PipelineResult<()> {
        if len != self.source_len {
            return Err(mismatch(format!(
                "cube holds {} values, axis product is {}",
                len, self.source_len
            )));
        }
        Ok(())
    }

    /// Reorder `values` into `out` (cleared first).
    pub fn apply(&self, values: &[f32], out: &mut Vec<f32>) -> PipelineResult<()> {
        self.check_len(values.len())?;
        out.clear();
        out.extend(self.gather.iter().map(|&i| values[i]));
        Ok(())
    }
}

fn c_order_strides(layout: &CubeLayout) -> Vec<usize> {
    let mut strides = vec![1usize; layout.axes.len()];
    for i in (0..layout.axes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * layout.axes[i + 1].1;
    }
    strides
}

fn mismatch(message: String) -> PipelineError {
    PipelineError::shape_mismatch(message).with_context(ErrorContext::new("plan_axis_order"))
}
