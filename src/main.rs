use anyhow::Result;
use glow_drs::config;
use std::{env, path::PathBuf};
use structopt::StructOpt;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Glow normalizing flow with discriminator rejection sampling.
pub enum Args {
    /// Train the flow by maximum likelihood.
    TrainFlow {
        #[structopt(long, default_value = "config.json5")]
        config: PathBuf,
    },
    /// Train the discriminator against samples of a trained flow.
    TrainDiscriminator {
        #[structopt(long, default_value = "config.json5")]
        config: PathBuf,
    },
    /// Generate images with discriminator rejection sampling.
    Generate {
        #[structopt(long, default_value = "config.json5")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse config
    match Args::from_args() {
        Args::TrainFlow { config } => {
            let config = config::Config::load(&config)?;
            glow_drs::train_flow(config).await?;
        }
        Args::TrainDiscriminator { config } => {
            let config = config::Config::load(&config)?;
            glow_drs::train_discriminator(config).await?;
        }
        Args::Generate { config } => {
            let config = config::Config::load(&config)?;
            glow_drs::generate(config).await?;
        }
    }

    Ok(())
}
