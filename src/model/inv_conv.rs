use super::{accumulate_ldj, FlowLayer};
use crate::common::*;

#[derive(Debug, Clone, Default)]
pub struct InvConvInit {}

impl InvConvInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, num_channels: usize) -> Result<InvConv> {
        let path = path.borrow();
        ensure!(num_channels > 0, "num_channels must be positive");

        let c = num_channels as i64;

        // random orthogonal matrix from the QR decomposition of a Gaussian one
        let weight = tch::no_grad(|| {
            let gaussian = Tensor::randn(&[c, c], (Kind::Double, Device::Cpu));
            let (q, _r) = gaussian.qr(true);
            path.var_copy("weight", &q.to_kind(Kind::Float))
        });

        Ok(InvConv { weight })
    }
}

/// Invertible 1x1 convolution mixing the channels of every pixel with a
/// learned square matrix.
///
/// A singular weight matrix cannot be inverted. The orthogonal
/// initialization avoids it, but nothing prevents training from drifting
/// towards it.
#[derive(Debug)]
pub struct InvConv {
    weight: Tensor,
}

impl InvConv {
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// `log|det(W)|` of the forward weight matrix.
    pub fn log_abs_det(&self) -> Tensor {
        let (_sign, log_abs_det) = self.weight.slogdet();
        log_abs_det
    }

    /// Log-determinant of this layer for a `height` x `width` input.
    pub fn log_det(&self, height: i64, width: i64) -> Tensor {
        self.log_abs_det() * (height * width) as f64
    }

    fn kernel(&self, reverse: bool) -> Tensor {
        let weight = &self.weight;
        let c = weight.size()[0];

        let matrix = if reverse {
            // invert in double precision to keep the reverse pass accurate
            weight.to_kind(Kind::Double).inverse().to_kind(weight.kind())
        } else {
            weight.shallow_clone()
        };
        matrix.view([c, c, 1, 1])
    }
}

impl FlowLayer for InvConv {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        _train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_b, c, h, w) = xs.size4()?;
        let num_channels = self.weight.size()[0];
        ensure!(
            c == num_channels,
            "InvConv expects {} channels, but get input shape {:?}",
            num_channels,
            xs.size()
        );

        let kernel = self.kernel(reverse);
        let ys = xs.conv2d(&kernel, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1);
        let sldj = accumulate_ldj(sldj, reverse, || self.log_det(h, w));

        Ok((ys, sldj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_conv_orthogonal_init_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let conv = InvConvInit::default().build(&root / "conv", 6)?;

        let weight = conv.weight();
        let gram = weight.matmul(&weight.tr());
        let eye = Tensor::eye(6, FLOAT_CPU);
        ensure!(gram.allclose(&eye, 1e-4, 1e-4, false), "weight is not orthogonal");
        ensure!(f64::from(conv.log_abs_det()).abs() < 1e-4);

        Ok(())
    }

    #[test]
    fn inv_conv_log_det_consistency_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut conv = InvConvInit::default().build(&root / "conv", 4)?;

        // move away from an orthogonal matrix so that log|det| is not zero
        tch::no_grad(|| {
            let mut weight = conv.weight().shallow_clone();
            let perturbed = conv.weight() * 1.5 + Tensor::eye(4, FLOAT_CPU) * 0.3;
            weight.copy_(&perturbed);
        });
        let expect = f64::from(conv.log_abs_det()) * 25.0;
        ensure!(expect.abs() > 1.0);

        let input = Tensor::randn(&[3, 4, 5, 5], FLOAT_CPU);
        let zeros = Tensor::zeros(&[3], FLOAT_CPU);

        let (output, fwd) = conv.forward_t(&input, Some(zeros.copy()), false)?;
        let (recon, inv) = conv.inverse_t(&output, Some(zeros), false)?;
        let fwd = f64::from(fwd.unwrap().get(0));
        let inv = f64::from(inv.unwrap().get(0));

        approx::assert_abs_diff_eq!(fwd, expect, epsilon = 1e-4);
        approx::assert_abs_diff_eq!(inv, -expect, epsilon = 1e-4);
        ensure!(recon.allclose(&input, 1e-4, 1e-4, false), "reconstruction mismatch");

        Ok(())
    }

    #[test]
    fn inv_conv_rejects_channel_mismatch_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut conv = InvConvInit::default().build(&root / "conv", 4)?;

        let input = Tensor::randn(&[1, 3, 2, 2], FLOAT_CPU);
        ensure!(conv.forward_t(&input, None, false).is_err());

        Ok(())
    }
}
