use super::{accumulate_ldj, FlowLayer};
use crate::common::*;

#[cfg(debug_assertions)]
static DEGENERATE_BATCH_WARN: Once = Once::new();

#[derive(Debug, Clone)]
pub struct ActNormInit {
    pub scale: f64,
    pub eps: f64,
}

impl Default for ActNormInit {
    fn default() -> Self {
        Self {
            scale: 1.0,
            eps: 1e-6,
        }
    }
}

impl ActNormInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, num_features: usize) -> Result<ActNorm> {
        let path = path.borrow();
        let Self { scale, eps } = self;

        ensure!(num_features > 0, "num_features must be positive");
        ensure!(scale > 0.0, "scale must be positive, but get {}", scale);
        ensure!(eps > 0.0, "eps must be positive, but get {}", eps);

        let c = num_features as i64;

        Ok(ActNorm {
            bias: path.var("bias", &[1, c, 1, 1], nn::Init::Const(0.0)),
            logs: path.var("logs", &[1, c, 1, 1], nn::Init::Const(0.0)),
            initialized: path.zeros_no_train("initialized", &[1]),
            known_initialized: false,
            scale,
            eps,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActNormState {
    Uninitialized,
    Initialized,
}

/// Per-channel affine normalization `y = (x + bias) * exp(logs)` whose
/// parameters are initialized from the statistics of the first training
/// batch.
///
/// The initialization flag lives in the var store next to the parameters,
/// so it is saved and restored together with them. Once the flag is seen
/// set, it is remembered on the host and the tensor is not read again.
#[derive(Debug)]
pub struct ActNorm {
    bias: Tensor,
    logs: Tensor,
    initialized: Tensor,
    known_initialized: bool,
    scale: f64,
    eps: f64,
}

impl ActNorm {
    pub fn state(&self) -> ActNormState {
        if self.known_initialized || f64::from(self.initialized.sum(Kind::Float)) > 0.0 {
            ActNormState::Initialized
        } else {
            ActNormState::Uninitialized
        }
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn logs(&self) -> &Tensor {
        &self.logs
    }

    /// Log-determinant of this layer for a `height` x `width` input.
    pub fn log_det(&self, height: i64, width: i64) -> Tensor {
        self.logs.sum(Kind::Float) * (height * width) as f64
    }

    fn initialize(&mut self, xs: &Tensor) {
        let Self {
            ref mut bias,
            ref mut logs,
            ref mut initialized,
            ref mut known_initialized,
            scale,
            eps,
        } = *self;

        tch::no_grad(|| {
            let new_bias = -xs.mean_dim(&[0, 2, 3], true, Kind::Float);
            let centered = xs + &new_bias;
            let var = (&centered * &centered).mean_dim(&[0, 2, 3], true, Kind::Float);
            let new_logs = ((var.sqrt() + eps).reciprocal() * scale).log();

            #[cfg(debug_assertions)]
            {
                if bool::from(var.le(1e-12).any()) {
                    DEGENERATE_BATCH_WARN.call_once(|| {
                        warn!("ActNorm is initialized from a batch with near-zero variance");
                    });
                }
            }

            bias.copy_(&new_bias);
            logs.copy_(&new_logs);
            let _ = initialized.fill_(1.0);
        });
        *known_initialized = true;
    }

    /// Applies the forward transform without log-determinant tracking.
    pub fn normalize_t(&mut self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (ys, _) = self.flow_t(xs, None, false, train)?;
        Ok(ys)
    }
}

impl FlowLayer for ActNorm {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_b, c, h, w) = xs.size4()?;
        let num_features = self.bias.size()[1];
        ensure!(
            c == num_features,
            "ActNorm expects {} channels, but get input shape {:?}",
            num_features,
            xs.size()
        );

        if train && !reverse && !self.known_initialized {
            match self.state() {
                ActNormState::Uninitialized => self.initialize(xs),
                ActNormState::Initialized => self.known_initialized = true,
            }
        }

        let ys = if reverse {
            xs * (-&self.logs).exp() - &self.bias
        } else {
            (xs + &self.bias) * self.logs.exp()
        };
        let sldj = accumulate_ldj(sldj, reverse, || self.log_det(h, w));

        Ok((ys, sldj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn act_norm_data_dependent_init_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 3)?;
        ensure!(norm.state() == ActNormState::Uninitialized);

        let input = Tensor::randn(&[32, 3, 6, 6], FLOAT_CPU) * 3.0 + 1.5;
        let output = norm.normalize_t(&input, true)?;
        ensure!(norm.state() == ActNormState::Initialized);

        let mean = output.mean_dim(&[0, 2, 3], false, Kind::Float);
        let var = (&output * &output).mean_dim(&[0, 2, 3], false, Kind::Float);
        ensure!(f64::from(mean.abs().max()) < 1e-4, "output is not centered");
        ensure!(
            f64::from((var - 1.0).abs().max()) < 1e-3,
            "output does not have unit variance"
        );

        Ok(())
    }

    #[test]
    fn act_norm_initializes_once_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 4)?;

        let first = Tensor::randn(&[8, 4, 5, 5], FLOAT_CPU) * 2.0 - 1.0;
        let second = Tensor::randn(&[8, 4, 5, 5], FLOAT_CPU) * 7.0 + 3.0;

        norm.normalize_t(&first, true)?;
        let bias = norm.bias().copy();
        let logs = norm.logs().copy();

        let expect_bias = -first.mean_dim(&[0, 2, 3], true, Kind::Float);
        ensure!(bias.allclose(&expect_bias, 1e-5, 1e-5, false));

        norm.normalize_t(&second, true)?;
        ensure!(norm.bias().equal(&bias), "bias changed after the first batch");
        ensure!(norm.logs().equal(&logs), "logs changed after the first batch");

        Ok(())
    }

    #[test]
    fn act_norm_state_from_var_store_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 2)?;

        // parameters restored from elsewhere with the flag set
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                match name.as_str() {
                    "norm.initialized" => {
                        let _ = var.fill_(1.0);
                    }
                    "norm.bias" => {
                        let _ = var.fill_(0.25);
                    }
                    _ => {}
                }
            }
        });
        ensure!(norm.state() == ActNormState::Initialized);

        let input = Tensor::randn(&[4, 2, 3, 3], FLOAT_CPU) * 5.0;
        norm.normalize_t(&input, true)?;
        ensure!(
            bool::from(norm.bias().eq(0.25).all()),
            "restored parameters must not be re-initialized"
        );

        // the flag is remembered after it was seen once
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if name == "norm.initialized" {
                    let _ = var.fill_(0.0);
                }
            }
        });
        ensure!(norm.state() == ActNormState::Initialized);
        norm.normalize_t(&input, true)?;
        ensure!(bool::from(norm.bias().eq(0.25).all()));

        Ok(())
    }

    #[test]
    fn act_norm_skips_init_in_inference_mode_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 2)?;

        let input = Tensor::randn(&[4, 2, 3, 3], FLOAT_CPU) + 5.0;
        let output = norm.normalize_t(&input, false)?;

        ensure!(norm.state() == ActNormState::Uninitialized);
        ensure!(output.equal(&input), "uninitialized ActNorm must be identity");

        Ok(())
    }

    #[test]
    fn act_norm_inverse_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 3)?;

        let input = Tensor::randn(&[6, 3, 4, 4], FLOAT_CPU) * 2.0 + 0.5;
        let sldj = Tensor::zeros(&[6], FLOAT_CPU);
        let (output, sldj) = norm.forward_t(&input, Some(sldj), true)?;
        let sldj = sldj.unwrap();

        let expect = f64::from(norm.logs().sum(Kind::Float)) * 16.0;
        approx::assert_abs_diff_eq!(f64::from(sldj.get(0)), expect, epsilon = 1e-3);

        let (recon, sldj) = norm.inverse_t(&output, Some(sldj), false)?;
        ensure!(recon.allclose(&input, 1e-4, 1e-4, false));
        ensure!(f64::from(sldj.unwrap().abs().max()) < 1e-3);

        Ok(())
    }

    #[test]
    fn act_norm_without_accumulator_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut norm = ActNormInit::default().build(&root / "norm", 3)?;

        let input = Tensor::randn(&[2, 3, 4, 4], FLOAT_CPU);
        let (_output, sldj) = norm.forward_t(&input, None, true)?;
        ensure!(sldj.is_none());

        Ok(())
    }
}
