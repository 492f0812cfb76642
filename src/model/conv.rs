use crate::common::*;

#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Conv2DInit {
    pub fn new(ksize: usize) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            bias: true,
            ws_init: nn::Init::KaimingUniform,
            bs_init: nn::Init::Const(0.0),
        }
    }

    /// A convolution whose output is exactly zero until it is trained.
    pub fn zeros(ksize: usize) -> Self {
        Self {
            ws_init: nn::Init::Const(0.0),
            bs_init: nn::Init::Const(0.0),
            ..Self::new(ksize)
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Conv2D> {
        let Self {
            ksize,
            stride,
            padding,
            bias,
            ws_init,
            bs_init,
        } = self;

        ensure!(ksize > 0, "kernel size must be positive");
        ensure!(stride > 0, "stride must be positive");
        ensure!(
            in_dim > 0 && out_dim > 0,
            "channel sizes must be positive, but get in_dim = {}, out_dim = {}",
            in_dim,
            out_dim
        );

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;

        let bias = bias.then(|| path.var("bias", &[out_dim], bs_init));
        let weight = path.var("weight", &[out_dim, in_dim, ksize, ksize], ws_init);

        Ok(Conv2D {
            stride: vec![stride as i64; 2],
            padding: vec![padding as i64; 2],
            weight,
            bias,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    stride: Vec<i64>,
    padding: Vec<i64>,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Conv2D {
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let Self {
            ref stride,
            ref padding,
            ref weight,
            ref bias,
        } = *self;

        input.convolution(
            weight,
            bias.as_ref(),
            stride,
            padding,
            &[1, 1],
            false, // transposed
            &[0, 0],
            1,
        )
    }
}
