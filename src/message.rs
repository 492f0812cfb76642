use crate::common::*;

#[derive(Debug)]
pub enum TrainingMessage {
    /// A dequantized training batch.
    Batch {
        epoch: usize,
        batch_index: usize,
        images: Tensor,
    },
    /// Dequantized test batches, sent after the last batch of an epoch.
    Evaluate { epoch: usize, batches: Vec<Tensor> },
}

#[derive(Debug)]
pub enum LogMessage {
    FlowLoss {
        step: usize,
        learning_rate: f64,
        nll: f64,
        bits_per_dim: f64,
    },
    FlowEval {
        epoch: usize,
        nll: f64,
        bits_per_dim: f64,
    },
    DiscriminatorLoss {
        step: usize,
        learning_rate: f64,
        real_loss: f64,
        fake_loss: f64,
        loss: f64,
    },
    DiscriminatorEval {
        epoch: usize,
        real_loss: f64,
        fake_loss: f64,
        loss: f64,
    },
    /// Images of shape `[C, H, W]` with values in `[0, 1]`.
    Image {
        step: usize,
        tag: String,
        images: Vec<Tensor>,
    },
}
