use super::{
    conditioner::NormKind,
    flow_step::{FlowStep, FlowStepInit},
    logit::LogitTransform,
    squeeze::{squeeze, unsqueeze},
    FlowLayer,
};
use crate::common::*;

/// Shape of one level of the multi-scale flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelLayout {
    /// Number of levels from this one down to the terminal level,
    /// inclusive. The finest level has depth `num_levels`, the terminal
    /// level has depth 1.
    pub depth: usize,
    /// Channel count seen by the steps of this level.
    pub channels: usize,
    pub num_steps: usize,
    /// Whether the output is squeezed before entering the next level.
    pub squeeze: bool,
}

#[derive(Debug, Clone)]
pub struct GlowInit {
    /// Channels of the pixel-domain input.
    pub in_channels: usize,
    /// Width of the hidden layers of the coupling networks.
    pub mid_channels: usize,
    pub num_levels: usize,
    pub num_steps: usize,
    pub norm: NormKind,
    pub activation: Activation,
}

impl GlowInit {
    /// The number of levels that brings an `image_size` x `image_size`
    /// input down to 2 x 2 pixels, i.e. `log2(image_size) - 1`.
    pub fn num_levels_for_size(image_size: usize) -> Result<usize> {
        ensure!(
            image_size >= 4 && image_size.is_power_of_two(),
            "image size must be a power of two no less than 4, but get {}",
            image_size
        );
        Ok(image_size.trailing_zeros() as usize - 1)
    }

    /// Levels in the order the forward pass visits them.
    pub fn level_table(&self) -> Vec<LevelLayout> {
        let Self {
            in_channels,
            num_levels,
            num_steps,
            ..
        } = *self;

        // the wrapper squeezes once before the first level
        let first_channels = in_channels * 4;

        (0..num_levels)
            .scan(first_channels, |channels, index| {
                let depth = num_levels - index;
                let layout = LevelLayout {
                    depth,
                    channels: *channels,
                    num_steps,
                    squeeze: depth > 1,
                };
                *channels *= 4;
                Some(layout)
            })
            .collect()
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Glow> {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            num_levels,
            num_steps,
            norm,
            activation,
        } = self;

        ensure!(in_channels > 0, "in_channels must be positive");
        ensure!(mid_channels > 0, "mid_channels must be positive");
        ensure!(num_levels > 0, "num_levels must be positive");
        ensure!(num_steps > 0, "num_steps must be positive");

        let flows_path = path / "flows";
        let levels: Vec<_> = self
            .level_table()
            .into_iter()
            .enumerate()
            .map(|(level_index, layout)| -> Result<_> {
                let level_path = &flows_path / format!("level_{}", level_index);
                let steps: Vec<_> = (0..layout.num_steps)
                    .map(|step_index| {
                        FlowStepInit {
                            in_channels: layout.channels,
                            mid_channels,
                            norm,
                            activation,
                        }
                        .build(&level_path / format!("step_{}", step_index))
                    })
                    .try_collect()?;
                Ok(FlowLevel { layout, steps })
            })
            .try_collect()?;

        Ok(Glow {
            in_channels: in_channels as i64,
            logit: LogitTransform::default(),
            flows: MultiScaleFlow { levels },
        })
    }
}

#[derive(Debug)]
pub struct FlowLevel {
    layout: LevelLayout,
    steps: Vec<FlowStep>,
}

/// The stack of flow levels. Each level runs its steps and squeezes its
/// output for the next one, except the terminal level.
#[derive(Debug)]
pub struct MultiScaleFlow {
    levels: Vec<FlowLevel>,
}

impl FlowLayer for MultiScaleFlow {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if reverse {
            self.levels.iter_mut().rev().try_fold(
                (xs.shallow_clone(), sldj),
                |(xs, sldj), level| {
                    let xs = if level.layout.squeeze {
                        unsqueeze(&xs)?
                    } else {
                        xs
                    };
                    level
                        .steps
                        .iter_mut()
                        .rev()
                        .try_fold((xs, sldj), |(xs, sldj), step| {
                            step.flow_t(&xs, sldj, true, train)
                        })
                },
            )
        } else {
            self.levels.iter_mut().try_fold(
                (xs.shallow_clone(), sldj),
                |(xs, sldj), level| {
                    let (xs, sldj) = level
                        .steps
                        .iter_mut()
                        .try_fold((xs, sldj), |(xs, sldj), step| {
                            step.flow_t(&xs, sldj, false, train)
                        })?;
                    let xs = if level.layout.squeeze {
                        squeeze(&xs)?
                    } else {
                        xs
                    };
                    Ok((xs, sldj))
                },
            )
        }
    }
}

/// Glow model over images with pixel values in `[0, 1]`.
///
/// The forward direction maps images to latents: logit transform, one
/// squeeze, then the level stack. The reverse direction maps latents
/// back to images.
#[derive(Debug)]
pub struct Glow {
    in_channels: i64,
    logit: LogitTransform,
    flows: MultiScaleFlow,
}

impl Glow {
    pub fn in_channels(&self) -> usize {
        self.in_channels as usize
    }

    /// Latent shape `(C, H, W)` of an `image_size` x `image_size` image.
    pub fn latent_shape(&self, image_size: usize) -> Result<[i64; 3]> {
        let num_levels = self.flows.levels.len();
        let num_squeezes = num_levels as u32;
        let image_size = image_size as i64;
        let divisor = 2i64.pow(num_squeezes);

        ensure!(
            image_size > 0 && image_size % divisor == 0,
            "image size {} is not divisible by {}, required by {} levels",
            image_size,
            divisor,
            num_levels
        );

        Ok([
            self.in_channels * divisor * divisor,
            image_size / divisor,
            image_size / divisor,
        ])
    }

    /// Draws `batch_size` images by decoding standard normal latents.
    pub fn sample(&mut self, batch_size: usize, image_size: usize, device: Device) -> Result<Tensor> {
        let [c, h, w] = self.latent_shape(image_size)?;
        tch::no_grad(|| {
            let zs = Tensor::randn(&[batch_size as i64, c, h, w], (Kind::Float, device));
            let (xs, _) = self.inverse_t(&zs, None, false)?;
            Ok(xs)
        })
    }
}

impl FlowLayer for Glow {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let Self {
            in_channels,
            ref mut logit,
            ref mut flows,
        } = *self;

        if reverse {
            let (xs, sldj) = flows.flow_t(xs, sldj, true, train)?;
            let xs = unsqueeze(&xs)?;
            logit.flow_t(&xs, sldj, true, train)
        } else {
            let (_b, c, _h, _w) = xs.size4()?;
            ensure!(
                c == in_channels,
                "Glow expects {} input channels, but get input shape {:?}",
                in_channels,
                xs.size()
            );

            let (xs, sldj) = logit.flow_t(xs, sldj, false, train)?;
            let xs = squeeze(&xs)?;
            flows.flow_t(&xs, sldj, false, train)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::randomize_coupling_outputs;

    fn glow_init(num_levels: usize, num_steps: usize, norm: NormKind) -> GlowInit {
        GlowInit {
            in_channels: 1,
            mid_channels: 8,
            num_levels,
            num_steps,
            norm,
            activation: Activation::Relu,
        }
    }

    #[test]
    fn num_levels_for_size_test() -> Result<()> {
        ensure!(GlowInit::num_levels_for_size(32)? == 4);
        ensure!(GlowInit::num_levels_for_size(8)? == 2);
        ensure!(GlowInit::num_levels_for_size(4)? == 1);
        ensure!(GlowInit::num_levels_for_size(28).is_err());
        ensure!(GlowInit::num_levels_for_size(2).is_err());
        Ok(())
    }

    #[test]
    fn level_table_test() -> Result<()> {
        let table = glow_init(3, 2, NormKind::ActNorm).level_table();
        let expect = vec![
            LevelLayout {
                depth: 3,
                channels: 4,
                num_steps: 2,
                squeeze: true,
            },
            LevelLayout {
                depth: 2,
                channels: 16,
                num_steps: 2,
                squeeze: true,
            },
            LevelLayout {
                depth: 1,
                channels: 64,
                num_steps: 2,
                squeeze: false,
            },
        ];
        ensure!(table == expect, "unexpected level table {:?}", table);
        Ok(())
    }

    #[test]
    fn glow_round_trip_test() -> Result<()> {
        for &norm in &[NormKind::ActNorm, NormKind::BatchNorm] {
            let vs = nn::VarStore::new(Device::Cpu);
            let mut glow = glow_init(2, 2, norm).build(&vs.root())?;

            let input = Tensor::rand(&[4, 1, 8, 8], FLOAT_CPU) * 0.9 + 0.05;
            glow.forward_t(&input, None, true)?;
            randomize_coupling_outputs(&vs);

            let zeros = Tensor::zeros(&[4], FLOAT_CPU);
            let (latent, sldj) = glow.forward_t(&input, Some(zeros), false)?;
            let sldj = sldj.unwrap();
            ensure!(latent.size() == vec![4, 16, 2, 2], "incorrect latent shape");
            ensure!(bool::from(sldj.isfinite().all()));

            let (recon, sldj_back) = glow.inverse_t(&latent, Some(sldj.copy()), false)?;
            let sldj_back = sldj_back.unwrap();
            ensure!(recon.allclose(&input, 1e-3, 1e-4, false), "reconstruction mismatch");

            let scale = f64::from(sldj.abs().max()).max(1.0);
            ensure!(
                f64::from(sldj_back.abs().max()) / scale < 1e-4,
                "log-determinant does not return to zero"
            );
        }
        Ok(())
    }

    #[test]
    fn glow_inverse_then_forward_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut glow = glow_init(2, 1, NormKind::ActNorm).build(&vs.root())?;

        let input = Tensor::rand(&[4, 1, 8, 8], FLOAT_CPU) * 0.9 + 0.05;
        glow.forward_t(&input, None, true)?;
        randomize_coupling_outputs(&vs);

        let (latent, _) = glow.forward_t(&input, None, false)?;
        let (image, _) = glow.inverse_t(&latent, None, false)?;
        let (recon, _) = glow.forward_t(&image, None, false)?;
        ensure!(recon.allclose(&latent, 1e-3, 1e-3, false), "latent reconstruction mismatch");

        Ok(())
    }

    #[test]
    fn glow_log_det_additivity_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut glow = glow_init(2, 2, NormKind::ActNorm).build(&vs.root())?;

        let input = Tensor::rand(&[3, 1, 8, 8], FLOAT_CPU) * 0.8 + 0.1;
        glow.forward_t(&input, None, true)?;
        randomize_coupling_outputs(&vs);

        let zeros = || Some(Tensor::zeros(&[3], FLOAT_CPU));
        let (_latent, total) = glow.forward_t(&input, zeros(), false)?;

        // replay every layer in isolation and sum the contributions
        let (xs, logit_ldj) = glow.logit.forward_t(&input, zeros(), false)?;
        let mut expect = logit_ldj.unwrap();
        let mut xs = squeeze(&xs)?;
        for level in glow.flows.levels.iter_mut() {
            for step in level.steps.iter_mut() {
                let (ys, ldj) = step.forward_t(&xs, zeros(), false)?;
                expect = expect + ldj.unwrap();
                xs = ys;
            }
            if level.layout.squeeze {
                xs = squeeze(&xs)?;
            }
        }

        ensure!(
            total.unwrap().allclose(&expect, 1e-5, 1e-2, false),
            "model log-determinant is not the sum of its layers"
        );
        Ok(())
    }

    #[test]
    fn glow_constant_image_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut glow = glow_init(3, 1, NormKind::ActNorm).build(&vs.root())?;

        let input = Tensor::full(&[8, 1, 32, 32], 0.5, FLOAT_CPU);
        let zeros = Tensor::zeros(&[8], FLOAT_CPU);
        let (latent, sldj) = glow.forward_t(&input, Some(zeros), false)?;

        ensure!(latent.size() == vec![8, 64, 4, 4], "incorrect latent shape");
        ensure!(bool::from(sldj.unwrap().isfinite().all()), "log-determinant is not finite");

        let (recon, _) = glow.inverse_t(&latent, None, false)?;
        ensure!(recon.allclose(&input, 1e-4, 1e-4, false), "reconstruction mismatch");

        Ok(())
    }

    #[test]
    fn glow_sample_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut glow = glow_init(3, 1, NormKind::ActNorm).build(&vs.root())?;

        ensure!(glow.latent_shape(16)? == [64, 2, 2]);
        ensure!(glow.latent_shape(12).is_err());

        let images = glow.sample(5, 16, Device::Cpu)?;
        ensure!(images.size() == vec![5, 1, 16, 16], "incorrect sample shape");
        ensure!(bool::from(images.ge(-1e-5).all()) && bool::from(images.le(1.0 + 1e-5).all()));

        Ok(())
    }

    #[test]
    fn glow_rejects_odd_size_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut glow = glow_init(2, 1, NormKind::ActNorm).build(&vs.root())?;

        let input = Tensor::rand(&[2, 1, 6, 6], FLOAT_CPU);
        ensure!(glow.forward_t(&input, None, false).is_err());

        Ok(())
    }
}
