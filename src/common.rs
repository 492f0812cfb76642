pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::Local;
pub use futures::{
    future::FutureExt,
    stream::{self, Stream, StreamExt},
};
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::HashMap,
    fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Once},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, Module, OptimizerConfig},
    Device, Kind, Reduction, Tensor,
};
pub use tch_act::Activation;
pub use tch_goodies::TensorExt;
pub use tfrecord::EventWriterInit;
pub use tokio::sync::mpsc;
pub use tracing::{debug, info, warn};

pub type Fallible<T> = Result<T>;
