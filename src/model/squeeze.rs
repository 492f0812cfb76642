use crate::common::*;

/// Trades spatial extent for channels: every 2x2 patch of a channel
/// becomes four channels of a single pixel, `(B, C, H, W) -> (B, 4C, H/2, W/2)`.
///
/// The result keeps channel `c` of the input at output channels
/// `4c..4c + 4`, ordered by row offset then column offset.
pub fn squeeze(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    ensure!(
        h % 2 == 0 && w % 2 == 0,
        "squeeze requires even spatial dimensions, but get input shape {:?}",
        xs.size()
    );

    let ys = xs
        .reshape(&[b, c, h / 2, 2, w / 2, 2])
        .permute(&[0, 1, 3, 5, 2, 4])
        .contiguous()
        .view([b, c * 4, h / 2, w / 2]);
    Ok(ys)
}

/// Inverse of [squeeze], `(B, 4C, H, W) -> (B, C, 2H, 2W)`.
pub fn unsqueeze(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    ensure!(
        c % 4 == 0,
        "unsqueeze requires the channel size to be a multiple of 4, but get input shape {:?}",
        xs.size()
    );

    let ys = xs
        .reshape(&[b, c / 4, 2, 2, h, w])
        .permute(&[0, 1, 4, 2, 5, 3])
        .contiguous()
        .view([b, c / 4, h * 2, w * 2]);
    Ok(ys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeeze_shape_test() -> Result<()> {
        let input = Tensor::rand(&[3, 2, 8, 6], FLOAT_CPU);
        let output = squeeze(&input)?;
        ensure!(output.size() == vec![3, 8, 4, 3], "incorrect output shape");
        Ok(())
    }

    #[test]
    fn squeeze_layout_test() -> Result<()> {
        // one channel, a single 2x2 patch
        let input = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0]).view([1, 1, 2, 2]);
        let output = squeeze(&input)?;
        let values = Vec::<f32>::from(&output.flatten(0, -1));
        ensure!(values == vec![1.0, 2.0, 3.0, 4.0], "unexpected layout {:?}", values);
        Ok(())
    }

    #[test]
    fn squeeze_bijection_test() -> Result<()> {
        for &(c, h, w) in &[(1, 2, 2), (3, 4, 6), (4, 16, 16), (16, 8, 2)] {
            let input = Tensor::randn(&[2, c, h, w], FLOAT_CPU);
            let recon = unsqueeze(&squeeze(&input)?)?;
            ensure!(recon.equal(&input), "unsqueeze(squeeze(x)) != x for {:?}", input.size());

            let squeezed = Tensor::randn(&[2, c * 4, h, w], FLOAT_CPU);
            let recon = squeeze(&unsqueeze(&squeezed)?)?;
            ensure!(recon.equal(&squeezed), "squeeze(unsqueeze(x)) != x");
        }
        Ok(())
    }

    #[test]
    fn squeeze_rejects_odd_size_test() -> Result<()> {
        ensure!(squeeze(&Tensor::rand(&[1, 1, 3, 4], FLOAT_CPU)).is_err());
        ensure!(squeeze(&Tensor::rand(&[1, 1, 4, 5], FLOAT_CPU)).is_err());
        ensure!(unsqueeze(&Tensor::rand(&[1, 6, 4, 4], FLOAT_CPU)).is_err());
        Ok(())
    }
}
