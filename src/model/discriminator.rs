use super::{
    batch_norm::{BatchNorm2D, BatchNorm2DInit},
    conv::{Conv2D, Conv2DInit},
};
use crate::common::*;

/// Upper bound of the density ratio estimate `exp(logit)`.
pub const MAX_DENSITY_RATIO: f64 = 200.0;

#[derive(Debug, Clone)]
pub struct DiscriminatorInit<const DEPTH: usize> {
    pub input_channels: usize,
    pub image_size: usize,
    pub channels: [usize; DEPTH],
    pub leaky_slope: f64,
    pub dropout: f64,
    pub bn_eps: f64,
}

impl DiscriminatorInit<4> {
    pub fn new(input_channels: usize, image_size: usize) -> Self {
        Self {
            input_channels,
            image_size,
            channels: [16, 32, 64, 128],
            leaky_slope: 0.2,
            dropout: 0.25,
            bn_eps: 0.8,
        }
    }
}

impl<const DEPTH: usize> DiscriminatorInit<DEPTH> {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Discriminator> {
        ensure!(DEPTH > 0, "zero depth is not allowed");

        let path = path.borrow();
        let Self {
            input_channels,
            image_size,
            channels,
            leaky_slope,
            dropout,
            bn_eps,
        } = self;

        let down_factor = 1 << DEPTH;
        ensure!(
            image_size >= down_factor && image_size % down_factor == 0,
            "image size must be a multiple of {}, but get {}",
            down_factor,
            image_size
        );
        ensure!(
            (0.0..1.0).contains(&dropout),
            "dropout must be in range [0, 1), but get {}",
            dropout
        );

        let blocks: Vec<_> = iter::once(input_channels)
            .chain(channels.iter().cloned())
            .zip(channels.iter().cloned())
            .enumerate()
            .map(|(index, (in_c, out_c))| -> Result<_> {
                let block_path = path / format!("block_{}", index);

                let conv = Conv2DInit {
                    stride: 2,
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: 0.02,
                    },
                    ..Conv2DInit::new(3)
                }
                .build(&block_path / "conv", in_c, out_c)?;

                // the first block is not normalized
                let norm = (index > 0)
                    .then(|| {
                        BatchNorm2DInit {
                            eps: bn_eps,
                            ws_init: nn::Init::Randn {
                                mean: 1.0,
                                stdev: 0.02,
                            },
                            ..Default::default()
                        }
                        .build(&block_path / "norm", out_c)
                    })
                    .transpose()?;

                Ok(DiscriminatorBlock { conv, norm })
            })
            .try_collect()?;

        let last_channels = channels[DEPTH - 1];
        let last_size = image_size / down_factor;
        let head = nn::linear(
            path / "head",
            (last_channels * last_size * last_size) as i64,
            1,
            Default::default(),
        );

        Ok(Discriminator {
            input_channels: input_channels as i64,
            image_size: image_size as i64,
            blocks,
            head,
            leaky_slope,
            dropout,
        })
    }
}

#[derive(Debug)]
struct DiscriminatorBlock {
    conv: Conv2D,
    norm: Option<BatchNorm2D>,
}

/// Convolutional classifier telling real images from flow samples.
///
/// The same backbone yields a realism probability used for training and a
/// density ratio estimate `pq` used for rejection sampling.
#[derive(Debug)]
pub struct Discriminator {
    input_channels: i64,
    image_size: i64,
    blocks: Vec<DiscriminatorBlock>,
    head: nn::Linear,
    leaky_slope: f64,
    dropout: f64,
}

impl Discriminator {
    /// Raw head output of shape `(B,)` for images with values in `[0, 1]`.
    pub fn logits_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            input_channels,
            image_size,
            ref mut blocks,
            ref head,
            leaky_slope,
            dropout,
        } = *self;

        let (batch_size, c, h, w) = input.size4()?;
        ensure!(
            c == input_channels && h == image_size && w == image_size,
            "discriminator expects shape [_, {}, {}, {}], but get {:?}",
            input_channels,
            image_size,
            image_size,
            input.size()
        );

        let xs = input * 2.0 - 1.0;
        let xs = blocks.iter_mut().try_fold(xs, |xs, block| -> Result<_> {
            let xs = block.conv.forward(&xs);
            let xs = xs.maximum(&(&xs * leaky_slope));
            let xs = xs.feature_dropout(dropout, train);
            let xs = match &mut block.norm {
                Some(norm) => norm.forward_t(&xs, train)?,
                None => xs,
            };
            Ok(xs)
        })?;

        let logits = head.forward(&xs.view([batch_size, -1]));
        Ok(logits.view([batch_size]))
    }

    /// Probability that each image is real.
    pub fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.logits_t(input, train)?.sigmoid())
    }

    /// Density ratio estimate `pq = min(exp(logit), 200)` in inference mode.
    pub fn density_ratio(&mut self, input: &Tensor) -> Result<Tensor> {
        let logits = tch::no_grad(|| self.logits_t(input, false))?;
        Ok(logits.exp().clamp_max(MAX_DENSITY_RATIO))
    }
}
