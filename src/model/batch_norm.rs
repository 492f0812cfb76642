use crate::common::*;

#[cfg(debug_assertions)]
static SMALL_VARIANCE_WARN: Once = Once::new();

#[derive(Debug, Clone)]
pub struct BatchNorm2DInit {
    pub cudnn_enabled: bool,
    pub eps: f64,
    pub momentum: f64,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Default for BatchNorm2DInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: 1e-5,
            momentum: 0.1,
            ws_init: nn::Init::Const(1.0),
            bs_init: nn::Init::Const(0.0),
        }
    }
}

impl BatchNorm2DInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: usize) -> Result<BatchNorm2D> {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            ws_init,
            bs_init,
        } = self;

        ensure!(eps > 0.0, "eps must be positive, but get {}", eps);
        ensure!(
            (0.0..=1.0).contains(&momentum),
            "momentum must be in range [0, 1], but get {}",
            momentum
        );

        let out_dim = out_dim as i64;

        Ok(BatchNorm2D {
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            ws: path.var("weight", &[out_dim], ws_init),
            bs: path.var("bias", &[out_dim], bs_init),
            cudnn_enabled,
            eps,
            momentum,
        })
    }
}

/// Batch normalization over `(B, C, H, W)` inputs that keeps running
/// statistics for inference mode.
#[derive(Debug)]
pub struct BatchNorm2D {
    running_mean: Tensor,
    running_var: Tensor,
    ws: Tensor,
    bs: Tensor,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl BatchNorm2D {
    pub fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            cudnn_enabled,
            eps,
            momentum,
        } = *self;

        ensure!(
            input.dim() == 4,
            "expected an input tensor with 4 dims, got {:?}",
            input.size()
        );

        let output = Tensor::batch_norm(
            input,
            Some(ws),
            Some(bs),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        );

        #[cfg(debug_assertions)]
        {
            let has_small_var = bool::from(running_var.abs().le(1e-15).any());

            if has_small_var {
                SMALL_VARIANCE_WARN.call_once(|| {
                    warn!(
                        "running variance {} is too small",
                        f64::from(running_var.abs().min())
                    );
                });
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_norm_normalizes_in_training_mode_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = BatchNorm2DInit::default().build(&root / "bn", 3)?;

        let input = Tensor::randn(&[16, 3, 4, 4], FLOAT_CPU) * 5.0 + 2.0;
        let output = norm.forward_t(&input, true)?;

        let mean = output.mean_dim(&[0, 2, 3], false, Kind::Float);
        ensure!(
            f64::from(mean.abs().max()) < 1e-4,
            "batch-normalized output must be centered"
        );

        Ok(())
    }

    #[test]
    fn batch_norm_rejects_bad_rank_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = BatchNorm2DInit::default().build(&root / "bn", 3)?;

        let input = Tensor::randn(&[16, 3], FLOAT_CPU);
        ensure!(norm.forward_t(&input, true).is_err());

        Ok(())
    }
}
