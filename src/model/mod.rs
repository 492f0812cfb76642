mod act_norm;
mod batch_norm;
mod conditioner;
mod conv;
mod coupling;
mod discriminator;
mod flow_step;
mod glow;
mod inv_conv;
mod logit;
mod loss;
mod squeeze;

pub use act_norm::*;
pub use batch_norm::*;
pub use conditioner::*;
pub use conv::*;
pub use coupling::*;
pub use discriminator::*;
pub use flow_step::*;
pub use glow::*;
pub use inv_conv::*;
pub use logit::*;
pub use loss::*;
pub use squeeze::*;

#[cfg(test)]
pub(crate) use flow_step::tests::randomize_coupling_outputs;

use crate::common::*;

/// An invertible transform that keeps track of the summed log-determinant
/// of its Jacobian.
///
/// The accumulator `sldj` holds one value per batch element. Passing `None`
/// disables log-determinant tracking, and `None` is returned in that case.
/// In reverse mode the layer computes its inverse and subtracts the same
/// contribution that the forward mode adds.
pub trait FlowLayer {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)>;

    fn forward_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.flow_t(xs, sldj, false, train)
    }

    fn inverse_t(
        &mut self,
        zs: &Tensor,
        sldj: Option<Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        self.flow_t(zs, sldj, true, train)
    }
}

/// Adds (forward) or subtracts (reverse) a log-determinant contribution.
///
/// The contribution is evaluated lazily so that it costs nothing when
/// tracking is disabled.
pub(crate) fn accumulate_ldj(
    sldj: Option<Tensor>,
    reverse: bool,
    ldj: impl FnOnce() -> Tensor,
) -> Option<Tensor> {
    sldj.map(|sldj| {
        let ldj = ldj();
        if reverse {
            sldj - ldj
        } else {
            sldj + ldj
        }
    })
}
