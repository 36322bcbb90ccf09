use crate::error::GanError;
use crate::model::{Discriminator, Generator};
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::record::CompactRecorder;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const RECORD_EXTENSION: &str = "mpk";

/// `(epoch, iteration)` key of a generator/discriminator snapshot pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointId {
    pub epoch: usize,
    pub iteration: usize,
}

impl CheckpointId {
    pub fn new(epoch: usize, iteration: usize) -> Self {
        Self { epoch, iteration }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}_{}", self.epoch, self.iteration)
    }
}

impl FromStr for CheckpointId {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GanError::InvalidCheckpointId(s.to_string());
        let (epoch, iteration) = s.trim().split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            epoch: epoch.parse().map_err(|_| invalid())?,
            iteration: iteration.parse().map_err(|_| invalid())?,
        })
    }
}

/// Which earlier snapshot pairs to delete once a new pair is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Epochs up to this number are never pruned.
    pub keep_first: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { keep_first: 2 }
    }
}

impl RetentionPolicy {
    /// Epochs whose pairs are deleted after `epoch` has been saved.
    ///
    /// Once `epoch` passes `keep_first`, every earlier epoch goes and only
    /// the newest pair stays on disk.
    pub fn prune_epochs(&self, epoch: usize) -> Vec<usize> {
        if epoch > self.keep_first {
            (1..epoch).collect()
        } else {
            Vec::new()
        }
    }
}

/// Writes, discovers and restores snapshot pairs under the model directory.
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    retention: RetentionPolicy,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record path without extension; the recorder appends it.
    fn stem(&self, id: CheckpointId, half: char) -> PathBuf {
        self.dir.join(format!("{id}_{half}"))
    }

    fn file(&self, id: CheckpointId, half: char) -> PathBuf {
        self.stem(id, half).with_extension(RECORD_EXTENSION)
    }

    /// Save both networks, then apply the retention policy.
    pub fn save<B: Backend>(
        &self,
        generator: &Generator<B>,
        discriminator: &Discriminator<B>,
        epoch: usize,
        iteration: usize,
    ) -> Result<CheckpointId> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let id = CheckpointId::new(epoch, iteration);
        let recorder = CompactRecorder::new();
        generator
            .clone()
            .save_file(self.stem(id, 'G'), &recorder)
            .with_context(|| format!("failed to save generator checkpoint {id}"))?;
        discriminator
            .clone()
            .save_file(self.stem(id, 'D'), &recorder)
            .with_context(|| format!("failed to save discriminator checkpoint {id}"))?;
        tracing::info!("saved checkpoint {id} into {}", self.dir.display());

        self.prune(epoch)?;
        Ok(id)
    }

    /// Delete the pairs the retention policy releases; absent files are ignored.
    pub fn prune(&self, epoch: usize) -> Result<()> {
        for old in self.retention.prune_epochs(epoch) {
            let pattern = format!("{}/{:03}_*.{RECORD_EXTENSION}", self.dir.display(), old);
            for path in glob::glob(&pattern)?.filter_map(Result::ok) {
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::debug!("removed {}", path.display()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to remove {}", path.display()))
                    }
                }
            }
        }
        Ok(())
    }

    /// Every saved id with a generator half, sorted by file name.
    pub fn list(&self) -> Result<Vec<CheckpointId>> {
        let pattern = format!("{}/*_G.{RECORD_EXTENSION}", self.dir.display());
        let mut names: Vec<String> = glob::glob(&pattern)?
            .filter_map(Result::ok)
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names
            .iter()
            .filter_map(|name| name.strip_suffix(&format!("_G.{RECORD_EXTENSION}")))
            .filter_map(|stem| stem.parse().ok())
            .collect())
    }

    /// The explicit id, or the lexicographically last saved one.
    pub fn resolve(&self, id: Option<&str>) -> Result<CheckpointId> {
        if let Some(id) = id {
            return Ok(id.parse()?);
        }
        self.list()?
            .pop()
            .ok_or_else(|| GanError::NoCheckpoint(self.dir.clone()).into())
    }

    /// Restore both networks; a missing half is fatal.
    pub fn load<B: Backend>(
        &self,
        generator: Generator<B>,
        discriminator: Discriminator<B>,
        id: CheckpointId,
        device: &B::Device,
    ) -> Result<(Generator<B>, Discriminator<B>)> {
        for half in ['G', 'D'] {
            let path = self.file(id, half);
            if !path.exists() {
                return Err(GanError::IncompleteCheckpoint {
                    id: id.to_string(),
                    missing: path,
                }
                .into());
            }
        }

        let recorder = CompactRecorder::new();
        let generator = generator
            .load_file(self.stem(id, 'G'), &recorder, device)
            .with_context(|| format!("failed to load generator checkpoint {id}"))?;
        let discriminator = discriminator
            .load_file(self.stem(id, 'D'), &recorder, device)
            .with_context(|| format!("failed to load discriminator checkpoint {id}"))?;
        tracing::info!("loaded checkpoint {id} from {}", self.dir.display());
        Ok((generator, discriminator))
    }
}
