use crate::{
    common::*,
    model::{Discriminator, Glow},
};

/// Running state of discriminator rejection sampling.
///
/// `max_ratio` is the largest density ratio estimate seen so far. It only
/// grows, and it is updated before the acceptance probability of the
/// proposal that raised it is computed.
#[derive(Debug, Clone)]
pub struct DrsSession {
    eps_drs: f64,
    gamma_drs: f64,
    max_ratio: f64,
    num_proposals: usize,
    num_accepted: usize,
}

impl DrsSession {
    pub fn new(eps_drs: f64, gamma_drs: f64) -> Result<Self> {
        ensure!(
            eps_drs.is_finite() && eps_drs >= 0.0,
            "eps_drs must be finite and non-negative, but get {}",
            eps_drs
        );
        ensure!(
            gamma_drs.is_finite(),
            "gamma_drs must be finite, but get {}",
            gamma_drs
        );

        Ok(Self {
            eps_drs,
            gamma_drs,
            max_ratio: 0.0,
            num_proposals: 0,
            num_accepted: 0,
        })
    }

    pub fn max_ratio(&self) -> f64 {
        self.max_ratio
    }

    pub fn num_proposals(&self) -> usize {
        self.num_proposals
    }

    pub fn num_accepted(&self) -> usize {
        self.num_accepted
    }

    /// Accepted over proposed, or `None` before the first proposal.
    pub fn acceptance_rate(&self) -> Option<f64> {
        (self.num_proposals > 0).then(|| self.num_accepted as f64 / self.num_proposals as f64)
    }

    /// Raises the running maximum. Non-finite values are ignored.
    pub fn observe(&mut self, pq: f64) {
        if pq.is_finite() && pq > self.max_ratio {
            self.max_ratio = pq;
        }
    }

    /// `sigmoid(log pq - log M - log(1 - (pq / M) e^eps) - gamma)`, always
    /// in `[0, 1]`.
    ///
    /// Proposals close enough to the maximum to make the log argument
    /// non-positive are always accepted. Non-positive or non-finite `pq`
    /// is never accepted.
    pub fn acceptance_probability(&self, pq: f64) -> f64 {
        let Self {
            eps_drs,
            gamma_drs,
            max_ratio,
            ..
        } = *self;

        if !(pq.is_finite() && pq > 0.0 && max_ratio > 0.0) {
            return 0.0;
        }

        let rest = 1.0 - (pq / max_ratio) * eps_drs.exp();
        if rest <= 0.0 {
            return 1.0;
        }

        let logit = pq.ln() - max_ratio.ln() - rest.ln() - gamma_drs;
        let prob = 1.0 / (1.0 + (-logit).exp());

        if prob.is_nan() {
            0.0
        } else {
            prob.clamp(0.0, 1.0)
        }
    }

    /// Runs one proposal with density ratio `pq` against the uniform
    /// `threshold` and returns whether it is accepted.
    pub fn propose(&mut self, pq: f64, threshold: f64) -> bool {
        self.observe(pq);
        self.num_proposals += 1;

        let accepted = threshold < self.acceptance_probability(pq);
        if accepted {
            self.num_accepted += 1;
        }
        accepted
    }
}

#[derive(Debug, Clone)]
pub struct RejectionSamplerInit {
    pub eps_drs: f64,
    pub gamma_drs: f64,
    /// Rejected proposals tolerated in a row before giving up on an image.
    pub max_retries: usize,
    pub calibration_steps: usize,
    pub calibration_batch_size: usize,
    /// Side length of the images produced by the flow.
    pub image_size: usize,
    /// Pixels cropped from every side of accepted images.
    pub padding: usize,
    pub seed: Option<u64>,
}

impl Default for RejectionSamplerInit {
    fn default() -> Self {
        Self {
            eps_drs: 1e-3,
            gamma_drs: -3.0,
            max_retries: 10_000,
            calibration_steps: 100,
            calibration_batch_size: 256,
            image_size: 32,
            padding: 2,
            seed: None,
        }
    }
}

impl RejectionSamplerInit {
    pub fn build<'a>(
        self,
        flow: &'a mut Glow,
        discriminator: &'a mut Discriminator,
        device: Device,
    ) -> Result<RejectionSampler<'a>> {
        let Self {
            eps_drs,
            gamma_drs,
            max_retries,
            calibration_steps,
            calibration_batch_size,
            image_size,
            padding,
            seed,
        } = self;

        ensure!(
            image_size > padding * 2,
            "padding {} leaves nothing of image size {}",
            padding,
            image_size
        );
        ensure!(
            calibration_batch_size > 0,
            "calibration_batch_size must be positive"
        );

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(RejectionSampler {
            flow,
            discriminator,
            session: DrsSession::new(eps_drs, gamma_drs)?,
            device,
            rng,
            max_retries,
            calibration_steps,
            calibration_batch_size,
            image_size,
            padding: padding as i64,
        })
    }
}

/// Result of a sampling run.
#[derive(Debug)]
pub struct DrsOutput {
    /// Accepted images of shape `(N, C, H, W)` with the padding cropped.
    pub images: Tensor,
    pub num_proposals: usize,
    pub num_accepted: usize,
}

/// Filters flow samples by the density ratio estimated by a discriminator.
#[derive(Debug)]
pub struct RejectionSampler<'a> {
    flow: &'a mut Glow,
    discriminator: &'a mut Discriminator,
    session: DrsSession,
    device: Device,
    rng: StdRng,
    max_retries: usize,
    calibration_steps: usize,
    calibration_batch_size: usize,
    image_size: usize,
    padding: i64,
}

impl<'a> RejectionSampler<'a> {
    pub fn session(&self) -> &DrsSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut DrsSession {
        &mut self.session
    }

    fn density_ratios(&mut self, batch_size: usize) -> Result<(Tensor, Vec<f64>)> {
        let images = self.flow.sample(batch_size, self.image_size, self.device)?;
        let pq = self.discriminator.density_ratio(&images)?;
        let pq: Vec<f64> = Vec::<f32>::from(&pq.to_device(Device::Cpu))
            .into_iter()
            .map(|pq| pq as f64)
            .collect();
        Ok((images, pq))
    }

    /// Estimates the maximum density ratio from unfiltered flow samples.
    pub fn calibrate(&mut self) -> Result<f64> {
        for step in 0..self.calibration_steps {
            let (_images, pq) = self.density_ratios(self.calibration_batch_size)?;
            pq.into_iter().for_each(|pq| self.session.observe(pq));
            debug!(
                "calibration step {}/{}, max ratio {}",
                step + 1,
                self.calibration_steps,
                self.session.max_ratio()
            );
        }

        info!("calibrated max density ratio {}", self.session.max_ratio());
        Ok(self.session.max_ratio())
    }

    /// Proposes flow samples one by one until one is accepted.
    pub fn sample_one(&mut self) -> Result<Tensor> {
        for _ in 0..=self.max_retries {
            let (image, pq) = self.density_ratios(1)?;
            let threshold: f64 = self.rng.gen();

            if self.session.propose(pq[0], threshold) {
                return Ok(self.crop(&image));
            }
        }

        bail!(
            "no proposal is accepted after {} retries, max ratio {}",
            self.max_retries,
            self.session.max_ratio()
        )
    }

    /// Draws `num_samples` accepted images.
    pub fn sample(&mut self, num_samples: usize) -> Result<DrsOutput> {
        let start_proposals = self.session.num_proposals();
        let start_accepted = self.session.num_accepted();

        let images: Vec<_> = (0..num_samples)
            .map(|index| -> Result<_> {
                let image = self.sample_one()?;
                info!(
                    "sample {}/{}, max ratio {:.4}, acceptance rate {:.4}",
                    index + 1,
                    num_samples,
                    self.session.max_ratio(),
                    self.session.acceptance_rate().unwrap_or(0.0)
                );
                Ok(image)
            })
            .try_collect()?;

        let images = if images.is_empty() {
            let [c, h, w] = self.cropped_shape();
            Tensor::zeros(&[0, c, h, w], (Kind::Float, self.device))
        } else {
            Tensor::cat(&images, 0)
        };

        Ok(DrsOutput {
            images,
            num_proposals: self.session.num_proposals() - start_proposals,
            num_accepted: self.session.num_accepted() - start_accepted,
        })
    }

    fn crop(&self, images: &Tensor) -> Tensor {
        let padding = self.padding;
        let size = self.image_size as i64 - padding * 2;
        images.narrow(2, padding, size).narrow(3, padding, size)
    }

    fn cropped_shape(&self) -> [i64; 3] {
        let size = self.image_size as i64 - self.padding * 2;
        [self.flow.in_channels() as i64, size, size]
    }
}

/// Writes images of shape `(N, C, H, W)` with values in `[0, 1]` as
/// `<dir>/<offset + index>.png`.
pub fn save_images(images: &Tensor, dir: impl AsRef<Path>, offset: usize) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let images = (images.to_device(Device::Cpu) * 255.0)
        .round()
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8);
    let (num_images, _c, _h, _w) = images.size4()?;

    (0..num_images)
        .map(|index| -> Result<_> {
            let path = dir.join(format!("{}.png", offset + index as usize));
            tch::vision::image::save(&images.get(index), &path)
                .with_context(|| format!("unable to save image {}", path.display()))?;
            Ok(path)
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscriminatorInit, GlowInit, NormKind};

    #[test]
    fn acceptance_probability_test() -> Result<()> {
        let mut session = DrsSession::new(1e-3, -3.0)?;
        session.observe(10.0);

        let high = session.acceptance_probability(10.0);
        let low = session.acceptance_probability(1.0);
        ensure!(high > low, "p({}) = {} is not above p({}) = {}", 10.0, high, 1.0, low);
        ensure!(high == 1.0);

        // sigmoid(ln 0.1 - ln(1 - 0.1 e^eps) + 3)
        let expect = {
            let logit = 0.1f64.ln() - (1.0 - 0.1 * 1e-3f64.exp()).ln() + 3.0;
            1.0 / (1.0 + (-logit).exp())
        };
        approx::assert_abs_diff_eq!(low, expect, epsilon = 1e-9);

        ensure!(session.acceptance_probability(0.0) == 0.0);
        ensure!(session.acceptance_probability(f64::NAN) == 0.0);
        ensure!(session.acceptance_probability(f64::INFINITY) == 0.0);

        Ok(())
    }

    #[test]
    fn acceptance_probability_is_bounded_test() -> Result<()> {
        let mut session = DrsSession::new(1e-3, -3.0)?;
        session.observe(10.0);
        let mut rng = StdRng::seed_from_u64(7);

        for index in 0..10_000 {
            // cover both ends of [0, M] exactly
            let pq = match index {
                0 => 0.0,
                1 => 10.0,
                _ => rng.gen_range(0.0..=10.0),
            };
            let prob = session.acceptance_probability(pq);
            ensure!(prob.is_finite(), "p({}) is not finite", pq);
            ensure!((0.0..=1.0).contains(&prob), "p({}) = {} is out of range", pq, prob);

            let threshold: f64 = rng.gen();
            session.propose(pq, threshold);
        }

        ensure!(session.num_proposals() == 10_000);
        ensure!(session.num_accepted() <= session.num_proposals());

        Ok(())
    }

    #[test]
    fn max_ratio_is_monotonic_test() -> Result<()> {
        let mut session = DrsSession::new(1e-3, -3.0)?;
        let mut rng = StdRng::seed_from_u64(11);
        let mut prev = session.max_ratio();

        for _ in 0..1000 {
            let pq: f64 = rng.gen_range(0.0..200.0);
            session.propose(pq, rng.gen());
            ensure!(session.max_ratio() >= prev);
            ensure!(session.max_ratio() >= pq);
            prev = session.max_ratio();
        }

        session.observe(f64::NAN);
        ensure!(session.max_ratio() == prev);

        Ok(())
    }

    #[test]
    fn new_maximum_is_accepted_test() -> Result<()> {
        let mut session = DrsSession::new(1e-3, -3.0)?;
        session.observe(5.0);

        // the proposal that raises the maximum is scored against it
        ensure!(session.propose(8.0, 0.999_999));
        ensure!(session.max_ratio() == 8.0);
        ensure!(session.acceptance_rate() == Some(1.0));

        Ok(())
    }

    fn tiny_models(vs: &nn::VarStore) -> Result<(Glow, Discriminator)> {
        let root = vs.root();
        let flow = GlowInit {
            in_channels: 1,
            mid_channels: 4,
            num_levels: 2,
            num_steps: 1,
            norm: NormKind::ActNorm,
            activation: Activation::Relu,
        }
        .build(&root / "flow")?;
        let discriminator = DiscriminatorInit {
            input_channels: 1,
            image_size: 8,
            channels: [4, 8],
            leaky_slope: 0.2,
            dropout: 0.25,
            bn_eps: 0.8,
        }
        .build(&root / "discriminator")?;
        Ok((flow, discriminator))
    }

    fn tiny_sampler_init() -> RejectionSamplerInit {
        RejectionSamplerInit {
            max_retries: 1000,
            calibration_steps: 2,
            calibration_batch_size: 4,
            image_size: 8,
            padding: 2,
            seed: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn rejection_sampler_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let (mut flow, mut discriminator) = tiny_models(&vs)?;
        let mut sampler = tiny_sampler_init().build(&mut flow, &mut discriminator, Device::Cpu)?;

        let max_ratio = sampler.calibrate()?;
        ensure!(max_ratio > 0.0);

        let DrsOutput {
            images,
            num_proposals,
            num_accepted,
        } = sampler.sample(3)?;
        ensure!(images.size() == vec![3, 1, 4, 4], "incorrect sample shape");
        ensure!(num_accepted == 3);
        ensure!(num_proposals >= num_accepted);
        ensure!(sampler.session().max_ratio() >= max_ratio);

        let empty = sampler.sample(0)?;
        ensure!(empty.images.size() == vec![0, 1, 4, 4]);

        Ok(())
    }

    #[test]
    fn crop_keeps_center_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let (mut flow, mut discriminator) = tiny_models(&vs)?;
        let sampler = tiny_sampler_init().build(&mut flow, &mut discriminator, Device::Cpu)?;

        // 8x8 images with padding 2 around a 4x4 center
        let center = Tensor::arange(32i64, FLOAT_CPU).view([2, 1, 4, 4]) + 1.0;
        let padded = Tensor::zeros(&[2, 1, 8, 8], FLOAT_CPU);
        padded.narrow(2, 2, 4).narrow(3, 2, 4).copy_(&center);

        let cropped = sampler.crop(&padded);
        ensure!(cropped.size() == vec![2, 1, 4, 4]);
        ensure!(cropped.equal(&center), "crop must return the unpadded center");

        Ok(())
    }

    #[test]
    fn rejection_sampler_gives_up_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let (mut flow, mut discriminator) = tiny_models(&vs)?;
        let mut sampler = RejectionSamplerInit {
            gamma_drs: 100.0,
            max_retries: 5,
            ..tiny_sampler_init()
        }
        .build(&mut flow, &mut discriminator, Device::Cpu)?;

        // a maximum far above any clamped ratio rejects every proposal
        sampler.session_mut().observe(1e6);
        ensure!(sampler.sample_one().is_err());
        ensure!(sampler.session().num_proposals() == 6);
        ensure!(sampler.session().num_accepted() == 0);

        Ok(())
    }

    #[test]
    fn save_images_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = Tensor::rand(&[2, 1, 4, 4], FLOAT_CPU);
        let paths = save_images(&images, dir.path(), 10)?;
        ensure!(paths == vec![dir.path().join("10.png"), dir.path().join("11.png")]);
        ensure!(paths.iter().all(|path| path.exists()));
        Ok(())
    }
}
