use crate::common::*;

/// Adds uniform noise to images quantized to 256 levels,
/// `x = (x * 255 + u) / 256` with `u ~ U[0, 1)`.
pub fn dequantize(images: &Tensor) -> Tensor {
    let noise = images.rand_like();
    (images * 255.0 + noise) / 256.0
}

#[derive(Debug, Clone)]
pub struct ImageDatasetInit<P>
where
    P: AsRef<Path>,
{
    /// Directory holding the MNIST idx files.
    pub dir: P,
    pub raw_image_size: usize,
    pub image_channels: usize,
    /// Zero padding added to every side.
    pub padding: usize,
}

impl<P> ImageDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub fn load(self) -> Result<ImageDataset> {
        let Self {
            dir,
            raw_image_size,
            image_channels,
            padding,
        } = self;
        let dir = dir.as_ref();

        let mnist = tch::vision::mnist::load_dir(dir)
            .with_context(|| format!("unable to load MNIST from {}", dir.display()))?;

        let dataset = ImageDataset::from_tensors(
            &unflatten_images(&mnist.train_images, image_channels, raw_image_size)?,
            &unflatten_images(&mnist.test_images, image_channels, raw_image_size)?,
            padding,
        )?;
        info!(
            "loaded {} training and {} test images from {}",
            dataset.num_train(),
            dataset.num_test(),
            dir.display()
        );

        Ok(dataset)
    }
}

/// Reshapes `(N, C * H * W)` rows into `(N, C, H, W)` square images.
fn unflatten_images(images: &Tensor, channels: usize, size: usize) -> Result<Tensor> {
    let (_, row_len) = images.size2()?;
    let (channels, size) = (channels as i64, size as i64);
    ensure!(
        row_len == channels * size * size,
        "the dataset stores {} values per image, but {} channels of {}x{} are configured",
        row_len,
        channels,
        size,
        size
    );
    Ok(images.view([-1, channels, size, size]))
}

/// Train and test splits of square images with values in `[0, 1]`, kept on
/// the CPU.
#[derive(Debug)]
pub struct ImageDataset {
    train_images: Tensor,
    test_images: Tensor,
    image_size: usize,
}

impl ImageDataset {
    /// Builds a dataset from `(N, C, H, W)` image tensors, zero-padding them
    /// by `padding` pixels on every side.
    pub fn from_tensors(train_images: &Tensor, test_images: &Tensor, padding: usize) -> Result<Self> {
        let (_, train_c, train_h, train_w) = train_images.size4()?;
        let (_, test_c, test_h, test_w) = test_images.size4()?;
        ensure!(
            (train_c, train_h, train_w) == (test_c, test_h, test_w),
            "train and test images have different shapes"
        );
        ensure!(train_h == train_w, "images must be square");

        let pad = |images: &Tensor| {
            let p = padding as i64;
            images
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .constant_pad_nd(&[p, p, p, p])
        };

        Ok(Self {
            train_images: pad(train_images),
            test_images: pad(test_images),
            image_size: train_h as usize + padding * 2,
        })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn image_channels(&self) -> usize {
        self.train_images.size()[1] as usize
    }

    pub fn num_train(&self) -> usize {
        self.train_images.size()[0] as usize
    }

    pub fn num_test(&self) -> usize {
        self.test_images.size()[0] as usize
    }

    /// Training batches in a fresh random order. The last batch may be
    /// smaller.
    pub fn train_batches(&self, batch_size: usize) -> impl Iterator<Item = Tensor> + '_ {
        let order = Tensor::randperm(self.num_train() as i64, (Kind::Int64, Device::Cpu));
        batches(&self.train_images, Some(order), batch_size)
    }

    pub fn test_batches(&self, batch_size: usize) -> impl Iterator<Item = Tensor> + '_ {
        batches(&self.test_images, None, batch_size)
    }
}

fn batches(
    images: &Tensor,
    order: Option<Tensor>,
    batch_size: usize,
) -> impl Iterator<Item = Tensor> + '_ {
    let num_images = images.size()[0];
    let batch_size = batch_size as i64;

    (0..num_images)
        .step_by(batch_size as usize)
        .map(move |start| {
            let len = batch_size.min(num_images - start);
            match &order {
                Some(order) => images.index_select(0, &order.narrow(0, start, len)),
                None => images.narrow(0, start, len),
            }
        })
}
