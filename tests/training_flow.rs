use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, MultiGradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use stargan_burn::data::{AttributeDataset, DataMode};
use stargan_burn::ledger::LossLedger;
use stargan_burn::model::{Discriminator, Generator, LossConfig, ModelConfig};
use stargan_burn::options::GanOptions;
use stargan_burn::training::discriminator_step::DiscriminatorStep;
use stargan_burn::training::generator_step::GeneratorStep;
use stargan_burn::training::schedule::{permute_rows, target_permutation};
use stargan_burn::training::terms::build_generator_terms;
use stargan_burn::training::{ExperimentLayout, GanTrainer, TrainingConfig};
use stargan_burn::GanError;
use std::path::Path;

type TestBackend = Autodiff<NdArray<f32>>;

const LABELS: [[u8; 3]; 4] = [[1, 0, 0], [0, 1, 0], [0, 0, 1], [1, 1, 0]];

fn write_dataset(dir: &Path) {
    let mut listing = String::from("Black_Hair Blond_Hair Male\n");
    let mut test_listing = listing.clone();
    for (idx, labels) in LABELS.iter().enumerate() {
        let name = format!("img_{idx}.png");
        let img = RgbImage::from_fn(8, 8, |x, y| {
            Rgb([(x * 30) as u8, (y * 30) as u8, (idx * 60) as u8])
        });
        img.save(dir.join(&name)).unwrap();
        let line = format!(
            "{name} {}\n",
            labels.iter().map(|v| if *v == 1 { "1" } else { "-1" }).collect::<Vec<_>>().join(" ")
        );
        listing.push_str(&line);
        test_listing.push_str(&line);
    }
    std::fs::write(dir.join("train.txt"), listing).unwrap();
    std::fs::write(dir.join("test.txt"), test_listing).unwrap();
}

fn tiny_model() -> ModelConfig {
    ModelConfig::new(8, 3)
        .with_g_conv_dim(4)
        .with_g_repeat_num(1)
        .with_d_conv_dim(4)
        .with_d_repeat_num(2)
        .with_style_dim(2)
        .with_adain_hidden(4)
}

fn tiny_config(data_dir: &Path, options: &[&str]) -> TrainingConfig {
    TrainingConfig::new(tiny_model(), LossConfig::new(), data_dir.display().to_string())
        .with_gan_options(options.iter().map(|token| token.to_string()).collect())
        .with_batch_size(4)
        .with_num_epochs(1)
        .with_log_step(1)
        .with_sample_step(1000)
        .with_style_debug(2)
}

fn trainer(dir: &Path, options: &[&str]) -> (GanTrainer<TestBackend>, AttributeDataset) {
    write_dataset(dir);
    let config = tiny_config(dir, options);
    let data = AttributeDataset::load(dir, DataMode::Train, 8).unwrap();
    let trainer =
        GanTrainer::<TestBackend>::new(config, ExperimentLayout::new(dir.join("run")), Default::default()).unwrap();
    (trainer, data)
}

fn ledger_keys(trainer: &GanTrainer<TestBackend>) -> Vec<String> {
    trainer.ledger().keys().map(str::to_string).collect()
}

#[test]
fn standard_iteration_records_every_base_loss() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trainer, data) = trainer(dir.path(), &[]);
    let batch = data.batch::<TestBackend>(0, 4, &Default::default()).unwrap();

    let report = trainer.train_iteration(&batch, 0).unwrap();

    assert_eq!(report.discriminator.optimizer_steps, 2);
    let generator = report.generator.expect("generator update due on every iteration");
    assert_eq!(generator.optimizer_steps, 1);
    assert!(generator.loss.is_finite());
    assert_eq!(ledger_keys(&trainer), vec!["Dcls", "Dgp", "Dsrc", "Gcls", "Grec", "Gsrc"]);
    assert!(trainer.ledger().current().values().all(|value| value.is_finite()));
}

#[test]
fn hinge_skips_the_gradient_penalty_step() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trainer, data) = trainer(dir.path(), &["HINGE"]);
    let batch = data.batch::<TestBackend>(0, 4, &Default::default()).unwrap();

    let report = trainer.train_iteration(&batch, 0).unwrap();

    assert_eq!(report.discriminator.optimizer_steps, 1);
    assert_eq!(report.generator.map(|g| g.optimizer_steps), Some(1));
    assert!(!ledger_keys(&trainer).contains(&"Dgp".to_string()));
}

#[test]
fn generator_steps_once_for_every_option_set() {
    let option_sets: [&[&str]; 5] = [
        &["RaGAN"],
        &["L1_LOSS", "Attention"],
        &["AdaIn"],
        &["AdaIn", "Stochastic", "style_labels", "rec_style"],
        &["DRITZ", "Stochastic", "content_loss"],
    ];
    for options in option_sets {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, data) = trainer(dir.path(), options);
        let batch = data.batch::<TestBackend>(0, 4, &Default::default()).unwrap();

        let report = trainer.train_iteration(&batch, 0).unwrap();

        assert_eq!(report.generator.map(|g| g.optimizer_steps), Some(1), "options {options:?}");
        assert!(
            trainer.ledger().current().values().all(|value| value.is_finite()),
            "options {options:?}"
        );
    }
}

#[test]
fn attention_and_style_terms_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trainer, data) = trainer(dir.path(), &["Attention", "AdaIn", "Stochastic", "rec_style"]);
    let batch = data.batch::<TestBackend>(0, 4, &Default::default()).unwrap();

    trainer.train_iteration(&batch, 0).unwrap();

    let keys = ledger_keys(&trainer);
    for key in ["Gatm", "Gats", "Gsty", "Gstyr"] {
        assert!(keys.contains(&key.to_string()), "missing {key} in {keys:?}");
    }
}

#[test]
fn single_sample_batch_targets_its_own_labels() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trainer, data) = trainer(dir.path(), &[]);
    let batch = data.batch::<TestBackend>(1, 1, &Default::default()).unwrap();

    let report = trainer.train_iteration(&batch, 0).unwrap();

    let fake = report.discriminator.fake_labels.to_data().to_vec::<f32>().unwrap();
    let real = batch.labels.to_data().to_vec::<f32>().unwrap();
    assert_eq!(fake, real);
    assert_eq!(real, vec![0.0, 1.0, 0.0]);
}

#[test]
fn generator_waits_for_discriminator_repeats() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = tiny_config(dir.path(), &[]).with_d_train_repeat(2);
    let data = AttributeDataset::load(dir.path(), DataMode::Train, 8).unwrap();
    let mut trainer =
        GanTrainer::<TestBackend>::new(config, ExperimentLayout::new(dir.path().join("run")), Default::default())
            .unwrap();
    let batch = data.batch::<TestBackend>(0, 4, &Default::default()).unwrap();

    assert!(trainer.train_iteration(&batch, 0).unwrap().generator.is_none());
    assert!(trainer.train_iteration(&batch, 1).unwrap().generator.is_some());
}

#[test]
fn discriminator_with_too_few_branches_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = tiny_config(dir.path(), &[]);
    let options = stargan_burn::options::GanOptions::from_tokens(&config.gan_options).unwrap();
    let generator = config.model.init_generator::<TestBackend>(&options, &device);
    let discriminator = config.model.init_discriminator::<TestBackend>(&device);
    let mut config = config;
    config.model.d_branches = 2;

    let err = GanTrainer::with_networks(
        config,
        ExperimentLayout::new(dir.path().join("run")),
        generator,
        discriminator,
        device,
    )
    .err()
    .expect("branch mismatch must be rejected");

    assert!(matches!(
        err.downcast_ref::<GanError>(),
        Some(GanError::MissingClassifierBranches { expected: 2, found: 1 })
    ));
}

#[test]
fn perceptual_options_require_weights() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = tiny_config(dir.path(), &["Perceptual"]);

    let err = GanTrainer::<TestBackend>::new(config, ExperimentLayout::new(dir.path().join("run")), Default::default())
        .err()
        .expect("perceptual loss without weights must fail");

    assert!(matches!(err.downcast_ref::<GanError>(), Some(GanError::PerceptualWeights { .. })));
}

#[test]
fn full_run_writes_checkpoints_and_samples() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = tiny_config(dir.path(), &[]).with_batch_size(2).with_num_epochs(3);
    let run = dir.path().join("run");
    let mut data = AttributeDataset::load(dir.path(), DataMode::Train, 8).unwrap();
    let mut trainer = GanTrainer::<TestBackend>::new(config, ExperimentLayout::new(&run), Default::default()).unwrap();

    trainer.train(&mut data).unwrap();

    assert!(run.join("config.json").exists());
    assert!(run.join("samples/current_fake.png").exists());
    for epoch in 1..=3 {
        assert!(run.join(format!("samples/{epoch:03}_2_fake.png")).exists());
    }
    let mut models: Vec<String> = std::fs::read_dir(run.join("models"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    models.sort();
    assert_eq!(models, vec!["003_2_D.mpk", "003_2_G.mpk"]);
    assert!(trainer.ledger().history("Dsrc").is_some_and(|history| history.len() == 2));
}

#[test]
fn resumed_run_continues_after_the_checkpoint_epoch() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let run = dir.path().join("run");
    let mut data = AttributeDataset::load(dir.path(), DataMode::Train, 8).unwrap();

    let first = tiny_config(dir.path(), &[]).with_num_epochs(1);
    GanTrainer::<TestBackend>::new(first, ExperimentLayout::new(&run), Default::default())
        .unwrap()
        .train(&mut data)
        .unwrap();
    assert!(run.join("models/001_1_G.mpk").exists());

    let resumed = tiny_config(dir.path(), &[])
        .with_num_epochs(2)
        .with_pretrained_model(Some("001_1".to_string()));
    GanTrainer::<TestBackend>::new(resumed, ExperimentLayout::new(&run), Default::default())
        .unwrap()
        .train(&mut data)
        .unwrap();

    assert!(run.join("samples/002_1_fake.png").exists());
    assert!(run.join("models/001_1_G.mpk").exists());
    assert!(run.join("models/002_1_G.mpk").exists());
}

/// Forwards to an inner optimizer and counts every update it applies.
#[derive(Clone)]
struct CountingOptimizer<O> {
    inner: O,
    steps: usize,
}

impl<O> CountingOptimizer<O> {
    fn new(inner: O) -> Self {
        Self { inner, steps: 0 }
    }
}

impl<M, B, O> Optimizer<M, B> for CountingOptimizer<O>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
    O: Optimizer<M, B>,
{
    type Record = O::Record;

    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        self.steps += 1;
        self.inner.step(lr, module, grads)
    }

    fn step_multi(&mut self, lr: f64, module: M, grads: MultiGradientsParams) -> M {
        self.steps += 1;
        self.inner.step_multi(lr, module, grads)
    }

    fn to_record(&self) -> Self::Record {
        self.inner.to_record()
    }

    fn load_record(self, record: Self::Record) -> Self {
        Self {
            inner: self.inner.load_record(record),
            steps: self.steps,
        }
    }
}

#[test]
fn optimizers_see_the_expected_number_of_updates() {
    let option_sets: [(&[&str], usize); 5] = [
        (&[], 2),
        (&["HINGE"], 1),
        (&["RaGAN", "L1_LOSS"], 2),
        (&["AdaIn", "Stochastic", "rec_style", "content_loss", "Attention", "L1_LOSS"], 2),
        (&["DRITZ", "Stochastic", "style_labels", "HINGE"], 1),
    ];
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let data = AttributeDataset::load(dir.path(), DataMode::Train, 8).unwrap();
    let device = Default::default();
    let batch = data.batch::<TestBackend>(0, 4, &device).unwrap();
    let model = tiny_model();
    let loss = LossConfig::new();

    for (tokens, expected_d_steps) in option_sets {
        let options = GanOptions::from_tokens(tokens).unwrap();
        let generator: Generator<TestBackend> = model.init_generator(&options, &device);
        let discriminator: Discriminator<TestBackend> = model.init_discriminator(&device);
        let mut d_optimizer = CountingOptimizer::new(AdamConfig::new().init::<TestBackend, Discriminator<TestBackend>>());
        let mut g_optimizer = CountingOptimizer::new(AdamConfig::new().init::<TestBackend, Generator<TestBackend>>());
        let mut ledger = LossLedger::new();
        let mut rng = StdRng::seed_from_u64(7);

        let d_step = DiscriminatorStep {
            options: &options,
            loss: &loss,
        };
        let (discriminator, d_report) = d_step
            .run(
                &generator,
                discriminator,
                &mut d_optimizer,
                1e-4,
                batch.images.clone(),
                batch.labels.clone(),
                &mut rng,
                &mut ledger,
            )
            .unwrap();
        assert_eq!(d_optimizer.steps, expected_d_steps, "options {tokens:?}");
        assert_eq!(d_report.optimizer_steps, d_optimizer.steps, "options {tokens:?}");

        let terms = build_generator_terms::<TestBackend>(&options, &loss);
        let targets = permute_rows(batch.labels.clone(), &target_permutation(batch.len(), &mut rng));
        let g_step = GeneratorStep {
            options: &options,
            terms: &terms,
            perceptual: None,
        };
        let (_, g_report) = g_step
            .run(
                generator,
                &discriminator,
                &mut g_optimizer,
                1e-4,
                batch.images.clone(),
                batch.labels.clone(),
                targets,
                &mut ledger,
            )
            .unwrap();
        assert_eq!(g_optimizer.steps, 1, "options {tokens:?}");
        assert_eq!(g_report.optimizer_steps, g_optimizer.steps, "options {tokens:?}");
    }
}
