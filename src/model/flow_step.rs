use super::{
    act_norm::{ActNorm, ActNormInit},
    conditioner::NormKind,
    coupling::{Coupling, CouplingInit},
    inv_conv::{InvConv, InvConvInit},
    FlowLayer,
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct FlowStepInit {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub norm: NormKind,
    pub activation: Activation,
}

impl FlowStepInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<FlowStep> {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            norm,
            activation,
        } = self;

        Ok(FlowStep {
            norm: ActNormInit::default().build(path / "norm", in_channels)?,
            conv: InvConvInit::default().build(path / "conv", in_channels)?,
            coupling: CouplingInit {
                in_channels,
                mid_channels,
                norm,
                activation,
            }
            .build(path / "coupling")?,
        })
    }
}

/// ActNorm, then invertible 1x1 convolution, then affine coupling.
#[derive(Debug)]
pub struct FlowStep {
    norm: ActNorm,
    conv: InvConv,
    coupling: Coupling,
}

impl FlowLayer for FlowStep {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let Self {
            ref mut norm,
            ref mut conv,
            ref mut coupling,
        } = *self;

        if reverse {
            let (xs, sldj) = coupling.flow_t(xs, sldj, true, train)?;
            let (xs, sldj) = conv.flow_t(&xs, sldj, true, train)?;
            norm.flow_t(&xs, sldj, true, train)
        } else {
            let (xs, sldj) = norm.flow_t(xs, sldj, false, train)?;
            let (xs, sldj) = conv.flow_t(&xs, sldj, false, train)?;
            coupling.flow_t(&xs, sldj, false, train)
        }
    }
}
