use super::{accumulate_ldj, FlowLayer};
use crate::common::*;

/// Maps pixel intensities in `[0, 1]` to the real line,
/// `y = logit(alpha + (1 - 2 alpha) x)`.
#[derive(Debug, Clone)]
pub struct LogitTransform {
    alpha: f64,
}

impl Default for LogitTransform {
    fn default() -> Self {
        Self { alpha: 1e-6 }
    }
}

impl LogitTransform {
    fn shrink(&self, xs: &Tensor) -> Tensor {
        xs * (1.0 - 2.0 * self.alpha) + self.alpha
    }

    /// Per-sample log-determinant evaluated at the pixel-domain input.
    pub fn log_det(&self, xs: &Tensor) -> Tensor {
        let batch_size = xs.size()[0];
        let ss = self.shrink(xs);
        let ldj = -(&ss - &ss * &ss).log() + (1.0 - 2.0 * self.alpha).ln();
        ldj.view([batch_size, -1]).sum_dim_intlist(&[1], false, Kind::Float)
    }
}

impl FlowLayer for LogitTransform {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        _train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if reverse {
            let ys = (xs.sigmoid() - self.alpha) / (1.0 - 2.0 * self.alpha);
            let sldj = accumulate_ldj(sldj, reverse, || self.log_det(&ys));
            Ok((ys, sldj))
        } else {
            let ss = self.shrink(xs);
            let ys = ss.log() - (-&ss + 1.0).log();
            let sldj = accumulate_ldj(sldj, reverse, || self.log_det(xs));
            Ok((ys, sldj))
        }
    }
}
