use crate::{common::*, message as msg};

pub async fn logging_worker(
    log_dir: impl AsRef<Path>,
    mut log_rx: mpsc::Receiver<msg::LogMessage>,
) -> Result<()> {
    let event_dir = log_dir.as_ref().join("events");
    tokio::fs::create_dir_all(&event_dir).await?;

    let mut event_writer = {
        let event_path_prefix = event_dir
            .join("glow-drs")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

        EventWriterInit::default()
            .from_prefix_async(event_path_prefix, None)
            .await?
    };

    while let Some(msg) = log_rx.recv().await {
        match msg {
            msg::LogMessage::FlowLoss {
                step,
                learning_rate,
                nll,
                bits_per_dim,
            } => {
                let step = step as i64;
                event_writer
                    .write_scalar_async("flow/train_nll", step, nll as f32)
                    .await?;
                event_writer
                    .write_scalar_async("flow/train_bits_per_dim", step, bits_per_dim as f32)
                    .await?;
                event_writer
                    .write_scalar_async("params/flow_learning_rate", step, learning_rate as f32)
                    .await?;
            }
            msg::LogMessage::FlowEval {
                epoch,
                nll,
                bits_per_dim,
            } => {
                let epoch = epoch as i64;
                event_writer
                    .write_scalar_async("flow/test_nll", epoch, nll as f32)
                    .await?;
                event_writer
                    .write_scalar_async("flow/test_bits_per_dim", epoch, bits_per_dim as f32)
                    .await?;
            }
            msg::LogMessage::DiscriminatorLoss {
                step,
                learning_rate,
                real_loss,
                fake_loss,
                loss,
            } => {
                let step = step as i64;
                event_writer
                    .write_scalar_async("discriminator/train_real_loss", step, real_loss as f32)
                    .await?;
                event_writer
                    .write_scalar_async("discriminator/train_fake_loss", step, fake_loss as f32)
                    .await?;
                event_writer
                    .write_scalar_async("discriminator/train_loss", step, loss as f32)
                    .await?;
                event_writer
                    .write_scalar_async(
                        "params/discriminator_learning_rate",
                        step,
                        learning_rate as f32,
                    )
                    .await?;
            }
            msg::LogMessage::DiscriminatorEval {
                epoch,
                real_loss,
                fake_loss,
                loss,
            } => {
                let epoch = epoch as i64;
                event_writer
                    .write_scalar_async("discriminator/test_real_loss", epoch, real_loss as f32)
                    .await?;
                event_writer
                    .write_scalar_async("discriminator/test_fake_loss", epoch, fake_loss as f32)
                    .await?;
                event_writer
                    .write_scalar_async("discriminator/test_loss", epoch, loss as f32)
                    .await?;
            }
            msg::LogMessage::Image { step, tag, images } => {
                event_writer
                    .write_image_list_async(tag, step as i64, images)
                    .await?;
            }
        }
    }

    Ok(())
}
