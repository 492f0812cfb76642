use super::{
    act_norm::{ActNorm, ActNormInit},
    batch_norm::{BatchNorm2D, BatchNorm2DInit},
    conv::{Conv2D, Conv2DInit},
};
use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    ActNorm,
    BatchNorm,
}

impl Default for NormKind {
    fn default() -> Self {
        Self::ActNorm
    }
}

impl NormKind {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: usize) -> Result<Norm> {
        let norm = match self {
            Self::ActNorm => Norm::ActNorm(ActNormInit::default().build(path, out_dim)?),
            Self::BatchNorm => Norm::BatchNorm(BatchNorm2DInit::default().build(path, out_dim)?),
        };
        Ok(norm)
    }
}

#[derive(Debug)]
pub enum Norm {
    ActNorm(ActNorm),
    BatchNorm(BatchNorm2D),
}

impl Norm {
    pub fn forward_t(&mut self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::ActNorm(norm) => norm.normalize_t(xs, train),
            Self::BatchNorm(norm) => norm.forward_t(xs, train),
        }
    }
}

/// Conv net computing the coupling scale and translation from the
/// unchanged half of the channels.
#[derive(Debug, Clone)]
pub struct ConditionerInit {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub norm: NormKind,
    pub activation: Activation,
}

impl ConditionerInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Conditioner> {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            out_channels,
            norm,
            activation,
        } = self;

        let hidden_conv = |ksize| Conv2DInit {
            bias: false,
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: 0.05,
            },
            ..Conv2DInit::new(ksize)
        };

        let in_norm = norm.build(path / "in_norm", in_channels)?;
        let in_conv = hidden_conv(3).build(path / "in_conv", in_channels, mid_channels)?;
        let mid_conv1 = hidden_conv(3).build(path / "mid_conv1", mid_channels, mid_channels)?;
        let mid_norm = norm.build(path / "mid_norm", mid_channels)?;
        let mid_conv2 = hidden_conv(1).build(path / "mid_conv2", mid_channels, mid_channels)?;
        let out_norm = norm.build(path / "out_norm", mid_channels)?;

        // zero output makes the enclosing coupling start as the identity
        let out_conv = Conv2DInit::zeros(3).build(path / "out_conv", mid_channels, out_channels)?;

        Ok(Conditioner {
            in_norm,
            in_conv,
            mid_conv1,
            mid_norm,
            mid_conv2,
            out_norm,
            out_conv,
            activation,
        })
    }
}

#[derive(Debug)]
pub struct Conditioner {
    in_norm: Norm,
    in_conv: Conv2D,
    mid_conv1: Conv2D,
    mid_norm: Norm,
    mid_conv2: Conv2D,
    out_norm: Norm,
    out_conv: Conv2D,
    activation: Activation,
}

impl Conditioner {
    pub fn forward_t(&mut self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref mut in_norm,
            ref in_conv,
            ref mid_conv1,
            ref mut mid_norm,
            ref mid_conv2,
            ref mut out_norm,
            ref out_conv,
            activation,
        } = *self;

        let xs = in_norm.forward_t(xs, train)?;
        let xs = activation.forward(&in_conv.forward(&xs));

        let xs = mid_conv1.forward(&xs);
        let xs = activation.forward(&mid_norm.forward_t(&xs, train)?);

        let xs = mid_conv2.forward(&xs);
        let xs = activation.forward(&out_norm.forward_t(&xs, train)?);

        Ok(out_conv.forward(&xs))
    }
}
