pub mod discriminator_step;
pub mod generator_step;
pub mod schedule;
pub mod terms;

use crate::checkpoint::CheckpointManager;
use crate::data::{AttributeBatch, AttributeDataset};
use crate::error::GanError;
use crate::ledger::LossLedger;
use crate::model::{
    Discriminator, FeatureExtractor, FeatureExtractorConfig, Generator, LossConfig, ModelConfig,
};
use crate::options::{AdversarialScheme, GanOptions};
use crate::visualize::{SampleVisualizer, StylePolicy, VisualizerSettings};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use discriminator_step::{DiscriminatorReport, DiscriminatorStep};
use generator_step::{GeneratorReport, GeneratorStep};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use schedule::{format_elapsed, permute_rows, should_emit, split_batch, target_permutation, LrSchedule};
use std::path::{Path, PathBuf};
use std::time::Instant;
use terms::{build_generator_terms, GeneratorLossTerm};

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub data_dir: String,
    #[config(default = "Vec::new()")]
    pub gan_options: Vec<String>,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 10)]
    pub num_epochs_decay: usize,
    #[config(default = 1)]
    pub d_train_repeat: usize,
    #[config(default = 1e-4)]
    pub g_lr: f64,
    #[config(default = 1e-4)]
    pub d_lr: f64,
    #[config(default = 0.5)]
    pub beta1: f64,
    #[config(default = 0.999)]
    pub beta2: f64,
    #[config(default = 10)]
    pub log_step: usize,
    #[config(default = 500)]
    pub sample_step: usize,
    #[config(default = 5)]
    pub style_debug: usize,
    #[config(default = 5)]
    pub style_label_debug: usize,
    pub iter_style: Option<usize>,
    #[config(default = 1)]
    pub iter_test: usize,
    #[config(default = false)]
    pub no_labelcum: bool,
    pub pretrained_model: Option<String>,
    pub perceptual_weights: Option<String>,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn visualizer_settings(&self) -> VisualizerSettings {
        VisualizerSettings {
            style_debug: self.style_debug,
            iter_style: self.iter_style,
            no_labelcum: self.no_labelcum,
        }
    }
}

/// Directory layout of one experiment.
#[derive(Clone, Debug)]
pub struct ExperimentLayout {
    pub root: PathBuf,
    pub models: PathBuf,
    pub samples: PathBuf,
}

impl ExperimentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            models: root.join("models"),
            samples: root.join("samples"),
            root,
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.root, &self.models, &self.samples] {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// What one training iteration did.
#[derive(Clone, Debug)]
pub struct IterationReport<B: Backend> {
    pub discriminator: DiscriminatorReport<B>,
    pub generator: Option<GeneratorReport>,
}

type GeneratorOptimizer<B> = OptimizerAdaptor<Adam, Generator<B>, B>;
type DiscriminatorOptimizer<B> = OptimizerAdaptor<Adam, Discriminator<B>, B>;

/// Drives the epoch/iteration loop and owns every piece of mutable training state.
pub struct GanTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    options: GanOptions,
    layout: ExperimentLayout,
    generator: Generator<B>,
    discriminator: Discriminator<B>,
    perceptual: Option<FeatureExtractor<B>>,
    g_optimizer: GeneratorOptimizer<B>,
    d_optimizer: DiscriminatorOptimizer<B>,
    terms: Vec<Box<dyn GeneratorLossTerm<B>>>,
    schedule: LrSchedule,
    checkpoints: CheckpointManager,
    ledger: LossLedger,
    rng: StdRng,
    device: B::Device,
}

impl<B: AutodiffBackend> GanTrainer<B> {
    /// Build the networks selected by the configured options.
    pub fn new(config: TrainingConfig, layout: ExperimentLayout, device: B::Device) -> Result<Self> {
        let options = GanOptions::from_tokens(&config.gan_options)?;
        config.model.validate(&options)?;
        B::seed(&device, config.seed);
        let generator = config.model.init_generator::<B>(&options, &device);
        let discriminator = config.model.init_discriminator::<B>(&device);
        Self::with_networks(config, layout, generator, discriminator, device)
    }

    /// Train externally built networks, after checking they fit the configuration.
    pub fn with_networks(
        config: TrainingConfig,
        layout: ExperimentLayout,
        generator: Generator<B>,
        discriminator: Discriminator<B>,
        device: B::Device,
    ) -> Result<Self> {
        let options = GanOptions::from_tokens(&config.gan_options)?;
        config.model.validate(&options)?;
        if discriminator.num_branches() < config.model.d_branches {
            return Err(GanError::MissingClassifierBranches {
                expected: config.model.d_branches,
                found: discriminator.num_branches(),
            }
            .into());
        }
        if generator.kind() != options.generator_kind() {
            return Err(GanError::InvalidModel(format!(
                "options select the {} generator, got {}",
                options.generator_kind().name(),
                generator.kind().name()
            ))
            .into());
        }
        if options.attention && !generator.emits_attention() {
            return Err(GanError::UnsupportedVariant {
                variant: generator.kind().name(),
                capability: "emit attention masks without an attention head",
            }
            .into());
        }

        log_networks(&generator, &discriminator);

        let perceptual = if options.uses_perceptual() {
            let weights = config
                .perceptual_weights
                .as_deref()
                .ok_or_else(|| GanError::PerceptualWeights {
                    path: PathBuf::new(),
                    reason: "perceptual losses enabled but no perceptual_weights configured".to_string(),
                })?;
            Some(FeatureExtractorConfig::new().load::<B>(Path::new(weights), &device)?)
        } else {
            None
        };

        let adam = AdamConfig::new()
            .with_beta_1(config.beta1 as f32)
            .with_beta_2(config.beta2 as f32);
        let g_optimizer = adam.init::<B, Generator<B>>();
        let d_optimizer = adam.init::<B, Discriminator<B>>();

        let terms = build_generator_terms::<B>(&options, &config.loss);
        let schedule = LrSchedule::new(config.g_lr, config.d_lr, config.num_epochs_decay);
        let checkpoints = CheckpointManager::new(&layout.models);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            options,
            layout,
            generator,
            discriminator,
            perceptual,
            g_optimizer,
            d_optimizer,
            terms,
            schedule,
            checkpoints,
            ledger: LossLedger::new(),
            rng,
            device,
        })
    }

    pub fn options(&self) -> &GanOptions {
        &self.options
    }

    pub fn ledger(&self) -> &LossLedger {
        &self.ledger
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator<B> {
        &self.discriminator
    }

    /// One discriminator update, then a generator update when it is due.
    pub fn train_iteration(&mut self, batch: &AttributeBatch<B>, iteration: usize) -> Result<IterationReport<B>> {
        self.ledger.begin_iteration();
        let size = batch.len();
        let relativistic = self.options.scheme == AdversarialScheme::Relativistic;
        let (d_half, g_half) = split_batch(size, relativistic);

        let g_real = batch.images.clone().slice_dim(0, g_half.clone());
        let g_labels = batch.labels.clone().slice_dim(0, g_half.clone());
        let permutation = target_permutation(g_half.len(), &mut self.rng);
        let g_targets = permute_rows(g_labels.clone(), &permutation);

        let d_step = DiscriminatorStep {
            options: &self.options,
            loss: &self.config.loss,
        };
        let (discriminator, d_report) = d_step.run(
            &self.generator,
            self.discriminator.clone(),
            &mut self.d_optimizer,
            self.schedule.d_lr,
            batch.images.clone().slice_dim(0, d_half.clone()),
            batch.labels.clone().slice_dim(0, d_half),
            &mut self.rng,
            &mut self.ledger,
        )?;
        self.discriminator = discriminator;

        let repeat = self.config.d_train_repeat.max(1);
        let g_report = if (iteration + 1) % repeat == 0 {
            let g_step = GeneratorStep {
                options: &self.options,
                terms: &self.terms,
                perceptual: self.perceptual.as_ref(),
            };
            let (generator, report) = g_step.run(
                self.generator.clone(),
                &self.discriminator,
                &mut self.g_optimizer,
                self.schedule.g_lr,
                g_real,
                g_labels,
                g_targets,
                &mut self.ledger,
            )?;
            self.generator = generator;
            Some(report)
        } else {
            None
        };

        Ok(IterationReport {
            discriminator: d_report,
            generator: g_report,
        })
    }

    /// Fixed debug batch: the first `max(1, 16 / batch_size) + 1` batches.
    fn fixed_batch(&self, data: &AttributeDataset) -> Result<Tensor<B::InnerBackend, 4>> {
        let batch_size = self.config.batch_size.max(1);
        let count = ((16 / batch_size).max(1) + 1).min(data.num_batches(batch_size));
        let images = (0..count)
            .map(|index| {
                data.batch::<B::InnerBackend>(index, batch_size, &self.device)
                    .map(|batch| batch.images)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(images, 0))
    }

    /// Render the debug grids of the current networks.
    pub fn save_samples(&self, real: Tensor<B::InnerBackend, 4>, path: &Path) -> Result<Vec<PathBuf>> {
        let generator = self.generator.valid();
        let discriminator = self.discriminator.valid();
        let visualizer = SampleVisualizer::new(
            &generator,
            &discriminator,
            &self.options,
            self.config.visualizer_settings(),
        );
        visualizer.save_fake_output(real, path, StylePolicy::Random, true, false)
    }

    /// Restore the configured checkpoint and return the epoch to resume from.
    fn resume(&mut self) -> Result<usize> {
        let Some(name) = self.config.pretrained_model.clone() else {
            return Ok(0);
        };
        let id = self.checkpoints.resolve(Some(name.as_str()))?;
        let (generator, discriminator) = self.checkpoints.load(
            self.generator.clone(),
            self.discriminator.clone(),
            id,
            &self.device,
        )?;
        self.generator = generator;
        self.discriminator = discriminator;
        self.schedule.replay(id.epoch);
        tracing::info!("resuming from checkpoint {id} at epoch {}", id.epoch);
        Ok(id.epoch)
    }

    /// Run every remaining epoch over `data`.
    pub fn train(&mut self, data: &mut AttributeDataset) -> Result<()> {
        if data.is_empty() {
            return Err(GanError::EmptyDataset(PathBuf::from(&self.config.data_dir)).into());
        }
        self.layout.create()?;
        self.config
            .save(self.layout.root.join("config.json"))
            .context("failed to save config.json")?;

        let fixed = self.fixed_batch(data)?;
        let start = self.resume()?;
        let batch_size = self.config.batch_size.max(1);
        let last = data.num_batches(batch_size);
        let effective = if self.options.scheme == AdversarialScheme::Relativistic {
            batch_size / 2
        } else {
            batch_size
        };
        tracing::info!(
            "---> batch size: {}, img: {}, GAN_options: [{}]",
            effective,
            self.config.model.image_size,
            self.options.tokens().join(", ")
        );
        tracing::info!("debug log: {}", self.layout.log_file().display());
        let started = Instant::now();

        for epoch in start..self.config.num_epochs {
            self.ledger = LossLedger::new();
            let bar = ProgressBar::new(last as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("Epoch {prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
                    .progress_chars("##-"),
            );
            bar.set_prefix(format!("{}/{}", epoch, self.config.num_epochs));

            for iteration in 0..last {
                let batch = data.batch::<B>(iteration, batch_size, &self.device)?;
                self.train_iteration(&batch, iteration)?;

                if should_emit(self.config.log_step, iteration, epoch, last) {
                    bar.set_message(self.ledger.summary());
                    tracing::debug!("[{}/{}] {}", iteration + 1, last, self.ledger.summary());
                }
                if should_emit(self.config.sample_step, iteration, epoch, last) {
                    self.save_samples(fixed.clone(), &self.layout.samples.join("current_fake.png"))?;
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            let name = format!("{:03}_{}_fake.png", epoch + 1, last);
            self.save_samples(fixed.clone(), &self.layout.samples.join(name))?;
            self.checkpoints
                .save(&self.generator, &self.discriminator, epoch + 1, last)?;
            tracing::info!(
                "elapsed [{}], epoch {}/{} | Train, {}",
                format_elapsed(started.elapsed()),
                epoch,
                self.config.num_epochs,
                self.ledger.epoch_summary()
            );

            data.shuffle(epoch as u64);
            if self.schedule.end_epoch(epoch) {
                tracing::info!(
                    "decay learning rate to g_lr: {}, d_lr: {}",
                    self.schedule.g_lr,
                    self.schedule.d_lr
                );
            }
        }
        Ok(())
    }
}

/// Parameter counts of both networks and of the generator's optional submodules.
fn log_networks<B: Backend>(generator: &Generator<B>, discriminator: &Discriminator<B>) {
    tracing::info!(
        "generator ({}): {} parameters",
        generator.kind().name(),
        generator.num_params()
    );
    for (name, count) in generator.submodule_params() {
        tracing::info!("  {name}: {count} parameters");
    }
    tracing::info!(
        "discriminator ({} branches): {} parameters",
        discriminator.num_branches(),
        discriminator.num_params()
    );
}
