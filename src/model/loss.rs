use crate::common::*;

/// Per-batch likelihood statistics of a flow.
#[derive(Debug)]
pub struct NllOutput {
    /// Mean negative log-likelihood in nats, differentiable.
    pub nll: Tensor,
    /// Mean bits per dimension, differentiable.
    pub bits_per_dim: Tensor,
}

/// Negative log-likelihood of discretized data under a flow with a
/// standard normal prior.
#[derive(Debug, Clone)]
pub struct NllLossInit {
    /// Number of discrete levels per input element.
    pub num_levels: usize,
}

impl Default for NllLossInit {
    fn default() -> Self {
        Self { num_levels: 256 }
    }
}

impl NllLossInit {
    pub fn build(self) -> Result<NllLoss> {
        let Self { num_levels } = self;
        ensure!(num_levels > 1, "num_levels must be greater than 1");
        Ok(NllLoss {
            log_k: (num_levels as f64).ln(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NllLoss {
    log_k: f64,
}

impl NllLoss {
    /// Computes the loss from latents `zs` and the per-sample summed
    /// log-determinant `sldj` of shape `(B,)`.
    pub fn forward(&self, zs: &Tensor, sldj: &Tensor) -> Result<NllOutput> {
        let batch_size = zs.size()[0];
        ensure!(
            sldj.size() == vec![batch_size],
            "expect log-determinant of shape [{}], but get {:?}",
            batch_size,
            sldj.size()
        );

        let num_dims = zs.numel() as i64 / batch_size;

        let prior_ll = (zs * zs * -0.5 - 0.5 * (2.0 * std::f64::consts::PI).ln())
            .view([batch_size, -1])
            .sum_dim_intlist(&[1], false, Kind::Float)
            - self.log_k * num_dims as f64;
        let nll = -(prior_ll + sldj).mean(Kind::Float);
        let bits_per_dim = &nll / (num_dims as f64 * std::f64::consts::LN_2);

        Ok(NllOutput { nll, bits_per_dim })
    }
}

/// Binary cross entropy of discriminator logits against a constant
/// target, 1 for real images and 0 for generated ones.
pub fn discriminator_loss(logits: &Tensor, is_real: bool) -> Tensor {
    let target = if is_real {
        logits.ones_like()
    } else {
        logits.zeros_like()
    };
    logits.binary_cross_entropy_with_logits::<Tensor>(&target, None, None, Reduction::Mean)
}
