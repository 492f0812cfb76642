use crate::{common::*, model::NormKind};
use tch_goodies::lr_schedule;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: Dataset,
    pub model: Model,
    pub train: Training,
    pub discriminator_train: DiscriminatorTraining,
    pub logging: Logging,
    pub sampling: Sampling,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = json5::from_str(
            &fs::read_to_string(path)
                .with_context(|| format!("unable to read config file {}", path.display()))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let image_size = self.dataset.image_size();
        ensure!(
            image_size >= 4 && image_size.is_power_of_two(),
            "padded image size must be a power of two no less than 4, but get {}",
            image_size
        );
        ensure!(
            self.train.lr_gamma.raw() > 0.0 && self.train.lr_gamma.raw() <= 1.0,
            "train.lr_gamma must be in range (0, 1]"
        );
        ensure!(
            self.discriminator_train.lr_gamma.raw() > 0.0
                && self.discriminator_train.lr_gamma.raw() <= 1.0,
            "discriminator_train.lr_gamma must be in range (0, 1]"
        );
        ensure!(
            self.train.learning_rate.raw() > 0.0
                && self.discriminator_train.learning_rate.raw() > 0.0,
            "learning rates must be positive"
        );
        ensure!(
            milestones_are_valid(&self.train.lr_milestones)
                && milestones_are_valid(&self.discriminator_train.lr_milestones),
            "learning rate milestones must be distinct positive epochs"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Directory holding the MNIST idx files.
    pub dataset_dir: PathBuf,
    /// Side length of the stored images.
    pub raw_image_size: NonZeroUsize,
    /// Zero padding added to every side before training.
    pub padding: usize,
    pub image_channels: NonZeroUsize,
}

impl Dataset {
    /// Side length of the padded images seen by the models.
    pub fn image_size(&self) -> usize {
        self.raw_image_size.get() + self.padding * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub mid_channels: NonZeroUsize,
    pub num_steps: NonZeroUsize,
    #[serde(default)]
    pub norm: NormKind,
    #[serde(default = "default_activation")]
    pub activation: Activation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    pub batch_size: NonZeroUsize,
    pub num_epochs: NonZeroUsize,
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub learning_rate: R64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: R64,
    /// Epochs at which the learning rate is multiplied by `lr_gamma`.
    #[serde(default)]
    pub lr_milestones: Vec<usize>,
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: R64,
    pub save_checkpoint_epochs: Option<NonZeroUsize>,
    pub log_images_epochs: Option<NonZeroUsize>,
}

impl Training {
    pub fn lr_schedule(&self) -> lr_schedule::Config {
        step_wise_schedule(self.learning_rate, &self.lr_milestones, self.lr_gamma)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscriminatorTraining {
    pub batch_size: NonZeroUsize,
    pub num_epochs: NonZeroUsize,
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub learning_rate: R64,
    #[serde(default)]
    pub lr_milestones: Vec<usize>,
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: R64,
    /// Flow checkpoint that generates the fake images.
    pub flow_checkpoint: PathBuf,
    pub save_checkpoint_epochs: Option<NonZeroUsize>,
}

impl DiscriminatorTraining {
    pub fn lr_schedule(&self) -> lr_schedule::Config {
        step_wise_schedule(self.learning_rate, &self.lr_milestones, self.lr_gamma)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sampling {
    pub num_samples: usize,
    pub output_dir: PathBuf,
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub flow_checkpoint: PathBuf,
    pub discriminator_checkpoint: PathBuf,
    #[serde(default = "default_eps_drs")]
    pub eps_drs: R64,
    #[serde(default = "default_gamma_drs")]
    pub gamma_drs: R64,
    pub max_retries: usize,
    pub calibration_steps: usize,
    pub calibration_batch_size: NonZeroUsize,
    pub seed: Option<u64>,
}

fn milestones_are_valid(milestones: &[usize]) -> bool {
    milestones.iter().all(|&epoch| epoch > 0)
        && milestones.iter().sorted().dedup().count() == milestones.len()
}

/// Schedule stepped once per epoch: `learning_rate` from epoch 0, multiplied
/// by `gamma` at every milestone.
fn step_wise_schedule(learning_rate: R64, milestones: &[usize], gamma: R64) -> lr_schedule::Config {
    let steps = iter::once((0, learning_rate))
        .chain(
            milestones
                .iter()
                .cloned()
                .sorted()
                .enumerate()
                .map(|(index, epoch)| (epoch, learning_rate * gamma.powi(index as i32 + 1))),
        )
        .collect();
    lr_schedule::Config::StepWise { steps }
}

fn default_activation() -> Activation {
    Activation::Relu
}

fn default_weight_decay() -> R64 {
    r64(0.0)
}

fn default_lr_gamma() -> R64 {
    r64(0.5)
}

fn default_eps_drs() -> R64 {
    r64(1e-3)
}

fn default_gamma_drs() -> R64 {
    r64(-3.0)
}
