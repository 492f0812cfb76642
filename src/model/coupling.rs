use super::{
    accumulate_ldj,
    conditioner::{Conditioner, ConditionerInit, NormKind},
    FlowLayer,
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct CouplingInit {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub norm: NormKind,
    pub activation: Activation,
}

impl CouplingInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Coupling> {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            norm,
            activation,
        } = self;

        ensure!(
            in_channels >= 2 && in_channels % 2 == 0,
            "affine coupling requires an even number of channels, but get {}",
            in_channels
        );
        let half = in_channels / 2;

        let conditioner = ConditionerInit {
            in_channels: half,
            mid_channels,
            out_channels: in_channels,
            norm,
            activation,
        }
        .build(path / "nn")?;
        let scale = path.var("scale", &[half as i64, 1, 1], nn::Init::Const(1.0));

        Ok(Coupling {
            in_channels: in_channels as i64,
            conditioner,
            scale,
        })
    }
}

/// Affine coupling layer: the first half of the channels is scaled and
/// shifted by amounts predicted from the second half, which passes
/// through unchanged.
#[derive(Debug)]
pub struct Coupling {
    in_channels: i64,
    conditioner: Conditioner,
    scale: Tensor,
}

impl Coupling {
    /// Computes the bounded log-scale `s` and the translation `t` from the
    /// unchanged half.
    fn scale_translate(&mut self, x_id: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let st = self.conditioner.forward_t(x_id, train)?;
        let (b, c, h, w) = st.size4()?;

        // channels are interleaved as s0, t0, s1, t1, ...
        let st = st.view([b, c / 2, 2, h * w]);
        let s = st.select(2, 0).reshape(&[b, c / 2, h, w]);
        let t = st.select(2, 1).reshape(&[b, c / 2, h, w]);
        let s = &self.scale * s.tanh();

        Ok((s, t))
    }
}

impl FlowLayer for Coupling {
    fn flow_t(
        &mut self,
        xs: &Tensor,
        sldj: Option<Tensor>,
        reverse: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_b, c, _h, _w) = xs.size4()?;
        ensure!(
            c == self.in_channels,
            "coupling expects {} channels, but get input shape {:?}",
            self.in_channels,
            xs.size()
        );

        let half = c / 2;
        let x_change = xs.narrow(1, 0, half);
        let x_id = xs.narrow(1, half, half);

        let (s, t) = self.scale_translate(&x_id, train)?;
        let x_change = if reverse {
            &x_change * (-&s).exp() - &t
        } else {
            (&x_change + &t) * s.exp()
        };
        let sldj = accumulate_ldj(sldj, reverse, || {
            s.flatten(1, -1).sum_dim_intlist(&[1], false, Kind::Float)
        });

        let ys = Tensor::cat(&[x_change, x_id], 1);
        Ok((ys, sldj))
    }
}
