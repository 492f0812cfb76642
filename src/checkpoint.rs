use crate::{common::*, FILE_STRFTIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Flow,
    Discriminator,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Discriminator => "discriminator",
        }
    }

    /// File name of the best checkpoint, e.g. `flow_best.ckpt`.
    pub fn best_file_name(&self) -> String {
        format!("{}_best.ckpt", self.as_str())
    }
}

/// Save parameters to a time-stamped checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: impl AsRef<Path>,
    kind: CheckpointKind,
    step: usize,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{}_{:06}.ckpt",
        kind.as_str(),
        Local::now().format(FILE_STRFTIME),
        step,
    );
    let path = checkpoint_dir.as_ref().join(filename);
    vs.save(&path)
        .with_context(|| format!("unable to save checkpoint {}", path.display()))?;
    Ok(path)
}

/// Save parameters to `<kind>_best.ckpt`, replacing the previous one.
pub fn save_best_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: impl AsRef<Path>,
    kind: CheckpointKind,
) -> Result<PathBuf> {
    let path = checkpoint_dir.as_ref().join(kind.best_file_name());
    vs.save(&path)
        .with_context(|| format!("unable to save checkpoint {}", path.display()))?;
    Ok(path)
}

/// Load a checkpoint into a constructed model.
///
/// The variable names and shapes in the file must match the store exactly.
/// Nothing is loaded if they do not.
pub fn load_checkpoint(vs: &mut nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let saved: HashMap<String, Vec<i64>> = Tensor::load_multi(path)
        .with_context(|| format!("unable to read checkpoint {}", path.display()))?
        .into_iter()
        .map(|(name, tensor)| (name, tensor.size()))
        .collect();
    let expected: HashMap<String, Vec<i64>> = vs
        .variables()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.size()))
        .collect();

    let missing: Vec<_> = expected
        .keys()
        .filter(|name| !saved.contains_key(*name))
        .sorted()
        .collect();
    let unexpected: Vec<_> = saved
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .sorted()
        .collect();
    let reshaped: Vec<_> = expected
        .iter()
        .filter_map(|(name, shape)| {
            let saved_shape = saved.get(name)?;
            (saved_shape != shape).then(|| {
                format!(
                    "{} (model {:?}, checkpoint {:?})",
                    name, shape, saved_shape
                )
            })
        })
        .sorted()
        .collect();

    if !(missing.is_empty() && unexpected.is_empty() && reshaped.is_empty()) {
        bail!(
            "checkpoint {} does not match the model: missing {:?}, unexpected {:?}, reshaped {:?}",
            path.display(),
            missing,
            unexpected,
            reshaped
        );
    }

    vs.load(path)
        .with_context(|| format!("unable to load checkpoint {}", path.display()))?;
    debug!("loaded checkpoint {}", path.display());

    Ok(())
}
