use crate::{
    checkpoint::{self, CheckpointKind},
    common::*,
    config, message as msg,
    model::{
        discriminator_loss, Discriminator, DiscriminatorInit, FlowLayer, Glow, GlowInit,
        NllLoss, NllLossInit, NllOutput,
    },
};
use tch_goodies::lr_schedule::LrScheduler;
use train::utils::RateCounter;

const NUM_LOG_IMAGES: usize = 16;

pub fn flow_init(config: &config::Config) -> Result<GlowInit> {
    let config::Config {
        ref dataset,
        ref model,
        ..
    } = *config;

    Ok(GlowInit {
        in_channels: dataset.image_channels.get(),
        mid_channels: model.mid_channels.get(),
        num_levels: GlowInit::num_levels_for_size(dataset.image_size())?,
        num_steps: model.num_steps.get(),
        norm: model.norm,
        activation: model.activation,
    })
}

pub fn discriminator_init(config: &config::Config) -> DiscriminatorInit<4> {
    DiscriminatorInit::new(
        config.dataset.image_channels.get(),
        config.dataset.image_size(),
    )
}

pub fn flow_training_worker(
    config: Arc<config::Config>,
    checkpoint_dir: impl AsRef<Path>,
    mut train_rx: mpsc::Receiver<msg::TrainingMessage>,
    log_tx: mpsc::Sender<msg::LogMessage>,
) -> Result<()> {
    let checkpoint_dir = checkpoint_dir.as_ref();
    let config::Training {
        device,
        weight_decay,
        save_checkpoint_epochs,
        log_images_epochs,
        ..
    } = config.train;
    let image_size = config.dataset.image_size();

    let vs = nn::VarStore::new(device);
    let mut flow = flow_init(&config)?.build(&vs.root() / "flow")?;
    let loss_fn = NllLossInit::default().build()?;

    // the scheduler steps once per epoch
    let mut lr_scheduler = LrScheduler::new(&config.train.lr_schedule(), 0)?;
    let mut lr = lr_scheduler.next();
    let mut lr_epoch = 0;
    let mut opt = nn::adam(0.9, 0.999, weight_decay.raw()).build(&vs, lr)?;

    let mut train_step = 0;
    let mut best_bits_per_dim: Option<f64> = None;
    let mut rate_counter = RateCounter::with_second_intertal();

    while let Some(msg) = train_rx.blocking_recv() {
        match msg {
            msg::TrainingMessage::Batch {
                epoch,
                batch_index,
                images,
            } => {
                if epoch > lr_epoch {
                    while lr_epoch < epoch {
                        lr = lr_scheduler.next();
                        lr_epoch += 1;
                    }
                    opt.set_lr(lr);
                    info!("epoch {}: learning rate is set to {}", epoch, lr);
                }

                let batch_size = images.size()[0];
                let sldj = Tensor::zeros(&[batch_size], (Kind::Float, device));
                let (zs, sldj) = flow.forward_t(&images, Some(sldj), true)?;
                let sldj = sldj.ok_or_else(|| format_err!("the flow drops the log-determinant"))?;
                let NllOutput { nll, bits_per_dim } = loss_fn.forward(&zs, &sldj)?;

                ensure!(
                    nll.is_all_finite(),
                    "non-finite loss at epoch {}, batch {}",
                    epoch,
                    batch_index
                );
                opt.backward_step(&nll);

                let nll = f64::from(&nll);
                let bits_per_dim = f64::from(&bits_per_dim);

                let msg = msg::LogMessage::FlowLoss {
                    step: train_step,
                    learning_rate: lr,
                    nll,
                    bits_per_dim,
                };
                if log_tx.blocking_send(msg).is_err() {
                    break;
                }

                rate_counter.add(1.0);
                if let Some(batch_rate) = rate_counter.rate() {
                    info!(
                        "epoch: {}\tstep: {}\tbpd: {:.4}\t{:.2} batch/s\t{:.2} sample/s",
                        epoch,
                        train_step,
                        bits_per_dim,
                        batch_rate,
                        batch_rate * batch_size as f64
                    );
                }

                train_step += 1;
            }
            msg::TrainingMessage::Evaluate { epoch, batches } => {
                let (nll, bits_per_dim) = evaluate_flow(&mut flow, &loss_fn, &batches, device)?;
                info!(
                    "epoch: {}\ttest nll: {:.4}\ttest bpd: {:.4}",
                    epoch, nll, bits_per_dim
                );

                let msg = msg::LogMessage::FlowEval {
                    epoch,
                    nll,
                    bits_per_dim,
                };
                if log_tx.blocking_send(msg).is_err() {
                    break;
                }

                if improves_on(best_bits_per_dim, bits_per_dim) {
                    best_bits_per_dim = Some(bits_per_dim);
                    let path = checkpoint::save_best_checkpoint(
                        &vs,
                        checkpoint_dir,
                        CheckpointKind::Flow,
                    )?;
                    info!("best test bpd {:.4}, saved {}", bits_per_dim, path.display());
                }

                if let Some(epochs) = save_checkpoint_epochs {
                    if (epoch + 1) % epochs.get() == 0 {
                        checkpoint::save_checkpoint(
                            &vs,
                            checkpoint_dir,
                            CheckpointKind::Flow,
                            epoch + 1,
                        )?;
                    }
                }

                if let Some(epochs) = log_images_epochs {
                    if (epoch + 1) % epochs.get() == 0 {
                        let images = flow.sample(NUM_LOG_IMAGES, image_size, device)?;
                        let msg = msg::LogMessage::Image {
                            step: epoch,
                            tag: "flow/samples".into(),
                            images: image_list(&images),
                        };
                        if log_tx.blocking_send(msg).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Mean test NLL and bits per dimension, weighted by batch size.
fn evaluate_flow(
    flow: &mut Glow,
    loss_fn: &NllLoss,
    batches: &[Tensor],
    device: Device,
) -> Result<(f64, f64)> {
    tch::no_grad(|| {
        let (count, nll_sum, bpd_sum) = batches.iter().try_fold(
            (0i64, 0.0, 0.0),
            |(count, nll_sum, bpd_sum), images| -> Result<_> {
                let batch_size = images.size()[0];
                let sldj = Tensor::zeros(&[batch_size], (Kind::Float, device));
                let (zs, sldj) = flow.forward_t(images, Some(sldj), false)?;
                let sldj =
                    sldj.ok_or_else(|| format_err!("the flow drops the log-determinant"))?;
                let NllOutput { nll, bits_per_dim } = loss_fn.forward(&zs, &sldj)?;

                let weight = batch_size as f64;
                Ok((
                    count + batch_size,
                    nll_sum + f64::from(nll) * weight,
                    bpd_sum + f64::from(bits_per_dim) * weight,
                ))
            },
        )?;
        ensure!(count > 0, "empty test split");

        Ok((nll_sum / count as f64, bpd_sum / count as f64))
    })
}

pub fn discriminator_training_worker(
    config: Arc<config::Config>,
    checkpoint_dir: impl AsRef<Path>,
    mut train_rx: mpsc::Receiver<msg::TrainingMessage>,
    log_tx: mpsc::Sender<msg::LogMessage>,
) -> Result<()> {
    let checkpoint_dir = checkpoint_dir.as_ref();
    let config::DiscriminatorTraining {
        device,
        ref flow_checkpoint,
        save_checkpoint_epochs,
        ..
    } = config.discriminator_train;
    let image_size = config.dataset.image_size();

    // frozen flow that generates the fake images
    let mut flow = {
        let mut vs = nn::VarStore::new(device);
        let flow = flow_init(&config)?.build(&vs.root() / "flow")?;
        checkpoint::load_checkpoint(&mut vs, flow_checkpoint)?;
        vs.freeze();
        flow
    };

    let vs = nn::VarStore::new(device);
    let mut discriminator = discriminator_init(&config).build(&vs.root() / "discriminator")?;

    let mut lr_scheduler = LrScheduler::new(&config.discriminator_train.lr_schedule(), 0)?;
    let mut lr = lr_scheduler.next();
    let mut lr_epoch = 0;
    let mut opt = nn::adam(0.9, 0.999, 0.0).build(&vs, lr)?;

    let mut train_step = 0;
    let mut best_loss: Option<f64> = None;
    let mut rate_counter = RateCounter::with_second_intertal();

    while let Some(msg) = train_rx.blocking_recv() {
        match msg {
            msg::TrainingMessage::Batch {
                epoch,
                batch_index,
                images: real,
            } => {
                if epoch > lr_epoch {
                    while lr_epoch < epoch {
                        lr = lr_scheduler.next();
                        lr_epoch += 1;
                    }
                    opt.set_lr(lr);
                    info!("epoch {}: learning rate is set to {}", epoch, lr);
                }

                let batch_size = real.size()[0] as usize;
                let fake = flow.sample(batch_size, image_size, device)?;

                let real_loss = discriminator_loss(&discriminator.logits_t(&real, true)?, true);
                let fake_loss = discriminator_loss(&discriminator.logits_t(&fake, true)?, false);
                let loss = (&real_loss + &fake_loss) / 2.0;

                ensure!(
                    loss.is_all_finite(),
                    "non-finite loss at epoch {}, batch {}",
                    epoch,
                    batch_index
                );
                opt.backward_step(&loss);

                let msg = msg::LogMessage::DiscriminatorLoss {
                    step: train_step,
                    learning_rate: lr,
                    real_loss: f64::from(real_loss),
                    fake_loss: f64::from(fake_loss),
                    loss: f64::from(&loss),
                };
                if log_tx.blocking_send(msg).is_err() {
                    break;
                }

                rate_counter.add(1.0);
                if let Some(batch_rate) = rate_counter.rate() {
                    info!(
                        "epoch: {}\tstep: {}\tloss: {:.4}\t{:.2} batch/s",
                        epoch,
                        train_step,
                        f64::from(loss),
                        batch_rate
                    );
                }

                train_step += 1;
            }
            msg::TrainingMessage::Evaluate { epoch, batches } => {
                let (real_loss, fake_loss, loss) = evaluate_discriminator(
                    &mut discriminator,
                    &mut flow,
                    &batches,
                    image_size,
                    device,
                )?;
                info!(
                    "epoch: {}\ttest real loss: {:.4}\ttest fake loss: {:.4}\ttest loss: {:.4}",
                    epoch, real_loss, fake_loss, loss
                );

                let msg = msg::LogMessage::DiscriminatorEval {
                    epoch,
                    real_loss,
                    fake_loss,
                    loss,
                };
                if log_tx.blocking_send(msg).is_err() {
                    break;
                }

                if improves_on(best_loss, loss) {
                    best_loss = Some(loss);
                    let path = checkpoint::save_best_checkpoint(
                        &vs,
                        checkpoint_dir,
                        CheckpointKind::Discriminator,
                    )?;
                    info!("best test loss {:.4}, saved {}", loss, path.display());
                }

                if let Some(epochs) = save_checkpoint_epochs {
                    if (epoch + 1) % epochs.get() == 0 {
                        checkpoint::save_checkpoint(
                            &vs,
                            checkpoint_dir,
                            CheckpointKind::Discriminator,
                            epoch + 1,
                        )?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Mean test losses on real images and on as many flow samples, weighted
/// by batch size.
fn evaluate_discriminator(
    discriminator: &mut Discriminator,
    flow: &mut Glow,
    batches: &[Tensor],
    image_size: usize,
    device: Device,
) -> Result<(f64, f64, f64)> {
    tch::no_grad(|| {
        let (count, real_sum, fake_sum) = batches.iter().try_fold(
            (0i64, 0.0, 0.0),
            |(count, real_sum, fake_sum), real| -> Result<_> {
                let batch_size = real.size()[0];
                let fake = flow.sample(batch_size as usize, image_size, device)?;

                let real_loss = discriminator_loss(&discriminator.logits_t(real, false)?, true);
                let fake_loss = discriminator_loss(&discriminator.logits_t(&fake, false)?, false);

                let weight = batch_size as f64;
                Ok((
                    count + batch_size,
                    real_sum + f64::from(real_loss) * weight,
                    fake_sum + f64::from(fake_loss) * weight,
                ))
            },
        )?;
        ensure!(count > 0, "empty test split");

        let real_loss = real_sum / count as f64;
        let fake_loss = fake_sum / count as f64;
        Ok((real_loss, fake_loss, (real_loss + fake_loss) / 2.0))
    })
}

/// A test score replaces the best one when it is no worse.
fn improves_on(best: Option<f64>, value: f64) -> bool {
    best.map_or(true, |best| value <= best)
}

/// Splits a `(N, C, H, W)` batch into CPU images for the event writer.
fn image_list(images: &Tensor) -> Vec<Tensor> {
    let images = images.to_device(Device::Cpu).clamp(0.0, 1.0);
    (0..images.size()[0]).map(|index| images.get(index)).collect()
}
