pub mod checkpoint;
pub mod common;
pub mod config;
pub mod dataset;
pub mod logging;
pub mod message;
pub mod model;
pub mod sampler;
pub mod train;
pub mod training_stream;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::{
    common::*,
    dataset::ImageDatasetInit,
    model::Glow,
    sampler::{DrsOutput, RejectionSamplerInit},
    training_stream::TrainingStreamInit,
};

type TrainingWorker = fn(
    Arc<config::Config>,
    PathBuf,
    mpsc::Receiver<message::TrainingMessage>,
    mpsc::Sender<message::LogMessage>,
) -> Result<()>;

/// Trains the flow by maximum likelihood.
pub async fn train_flow(config: config::Config) -> Result<()> {
    let batch_size = config.train.batch_size.get();
    let num_epochs = config.train.num_epochs.get();
    let device = config.train.device;

    run_training(
        config,
        TrainingStreamInit {
            batch_size,
            num_epochs,
            device,
        },
        |config, checkpoint_dir, train_rx, log_tx| {
            train::flow_training_worker(config, checkpoint_dir, train_rx, log_tx)
        },
    )
    .await
}

/// Trains the discriminator against samples of a trained flow.
pub async fn train_discriminator(config: config::Config) -> Result<()> {
    let batch_size = config.discriminator_train.batch_size.get();
    let num_epochs = config.discriminator_train.num_epochs.get();
    let device = config.discriminator_train.device;

    run_training(
        config,
        TrainingStreamInit {
            batch_size,
            num_epochs,
            device,
        },
        |config, checkpoint_dir, train_rx, log_tx| {
            train::discriminator_training_worker(config, checkpoint_dir, train_rx, log_tx)
        },
    )
    .await
}

async fn run_training(
    config: config::Config,
    stream_init: TrainingStreamInit,
    worker: TrainingWorker,
) -> Result<()> {
    // data logging
    let start_time = Local::now();
    let log_dir = config
        .logging
        .log_dir
        .join(format!("{}", start_time.format(FILE_STRFTIME)));
    let checkpoint_dir = log_dir.join("checkpoints");

    tokio::fs::create_dir_all(&checkpoint_dir).await?;
    info!("logging to {}", log_dir.display());

    let config = Arc::new(config);
    let (train_tx, train_rx) = tokio::sync::mpsc::channel(2);
    let (log_tx, log_rx) = tokio::sync::mpsc::channel(16);

    // data stream to channel worker
    let data_fut = {
        let config = config.clone();

        tokio::task::spawn(async move {
            // load dataset
            let dataset = ImageDatasetInit {
                dir: &config.dataset.dataset_dir,
                raw_image_size: config.dataset.raw_image_size.get(),
                image_channels: config.dataset.image_channels.get(),
                padding: config.dataset.padding,
            }
            .load()?;
            ensure!(
                dataset.image_size() == config.dataset.image_size()
                    && dataset.image_channels() == config.dataset.image_channels.get(),
                "the dataset has {} channels of size {}, but the configuration expects {} channels of size {}",
                dataset.image_channels(),
                dataset.image_size(),
                config.dataset.image_channels.get(),
                config.dataset.image_size()
            );

            let mut stream = stream_init.build(&dataset)?;

            while let Some(msg) = stream.next().await {
                let result = train_tx.send(msg).await;
                if result.is_err() {
                    break;
                }
            }

            Fallible::Ok(())
        })
        .map(|result| Fallible::Ok(result??))
    };

    // training worker
    let train_fut = {
        let config = config.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            worker(config, checkpoint_dir, train_rx, log_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    let log_fut = {
        let log_dir = log_dir.clone();

        tokio::task::spawn(logging::logging_worker(log_dir, log_rx))
            .map(|result| Fallible::Ok(result??))
    };

    // run all tasks
    futures::try_join!(data_fut, train_fut, log_fut)?;

    Ok(())
}

/// Draws images from the flow filtered by discriminator rejection sampling
/// and writes them as PNG files.
pub async fn generate(config: config::Config) -> Result<()> {
    let config = Arc::new(config);

    tokio::task::spawn_blocking(move || -> Result<()> {
        let config::Sampling {
            num_samples,
            ref output_dir,
            device,
            ref flow_checkpoint,
            ref discriminator_checkpoint,
            eps_drs,
            gamma_drs,
            max_retries,
            calibration_steps,
            calibration_batch_size,
            seed,
        } = config.sampling;

        let mut flow_vs = nn::VarStore::new(device);
        let mut flow: Glow = train::flow_init(&config)?.build(&flow_vs.root() / "flow")?;
        checkpoint::load_checkpoint(&mut flow_vs, flow_checkpoint)?;
        flow_vs.freeze();

        let mut discriminator_vs = nn::VarStore::new(device);
        let mut discriminator =
            train::discriminator_init(&config).build(&discriminator_vs.root() / "discriminator")?;
        checkpoint::load_checkpoint(&mut discriminator_vs, discriminator_checkpoint)?;
        discriminator_vs.freeze();

        let mut sampler = RejectionSamplerInit {
            eps_drs: eps_drs.raw(),
            gamma_drs: gamma_drs.raw(),
            max_retries,
            calibration_steps,
            calibration_batch_size: calibration_batch_size.get(),
            image_size: config.dataset.image_size(),
            padding: config.dataset.padding,
            seed,
        }
        .build(&mut flow, &mut discriminator, device)?;

        sampler.calibrate()?;
        let DrsOutput {
            images,
            num_proposals,
            num_accepted,
        } = sampler.sample(num_samples)?;

        let paths = sampler::save_images(&images, output_dir, 0)?;
        info!(
            "saved {} images to {}, {} proposals, acceptance rate {:.4}",
            paths.len(),
            output_dir.display(),
            num_proposals,
            if num_proposals > 0 {
                num_accepted as f64 / num_proposals as f64
            } else {
                0.0
            }
        );

        Ok(())
    })
    .await??;

    Ok(())
}
