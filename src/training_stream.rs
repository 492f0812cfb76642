use crate::{
    common::*,
    dataset::{dequantize, ImageDataset},
    message::TrainingMessage,
};

#[derive(Debug, Clone)]
pub struct TrainingStreamInit {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: Device,
}

impl TrainingStreamInit {
    /// Dequantized training batches for every epoch, each epoch followed by
    /// the test batches.
    pub fn build(self, dataset: &ImageDataset) -> Result<impl Stream<Item = TrainingMessage> + '_> {
        let Self {
            batch_size,
            num_epochs,
            device,
        } = self;
        ensure!(batch_size > 0, "batch_size must be positive");

        let load = move |images: Tensor| dequantize(&images.to_device(device));

        let stream = stream::iter(0..num_epochs).flat_map(move |epoch| {
            let train = dataset
                .train_batches(batch_size)
                .enumerate()
                .map(move |(batch_index, images)| TrainingMessage::Batch {
                    epoch,
                    batch_index,
                    images: load(images),
                });
            let test = iter::once_with(move || TrainingMessage::Evaluate {
                epoch,
                batches: dataset.test_batches(batch_size).map(load).collect(),
            });

            stream::iter(train.chain(test))
        });

        Ok(stream)
    }
}
