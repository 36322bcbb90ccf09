#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::config::Config;
use burn_cuda::{Cuda, CudaDevice};
use clap::Parser;
use stargan_burn::checkpoint::CheckpointManager;
use stargan_burn::data::{AttributeDataset, DataMode};
use stargan_burn::options::GanOptions;
use stargan_burn::training::{ExperimentLayout, TrainingConfig};
use stargan_burn::visualize::{SampleVisualizer, StylePolicy};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(about = "Translate test or demo images with a trained checkpoint")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    /// Checkpoint id `EEE_I`; the latest one when omitted.
    #[arg(long)]
    checkpoint: Option<String>,
    /// Render every image of this directory instead of the test split.
    #[arg(long)]
    demo_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    gif: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let layout = ExperimentLayout::new(&args.experiment_dir);
    let config_path = layout.root.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let options = GanOptions::from_tokens(&config.gan_options)?;
    config.model.validate(&options)?;

    type Backend = Cuda<f32, i32>;
    let device = CudaDevice::default();

    let checkpoints = CheckpointManager::new(&layout.models);
    let id = checkpoints.resolve(args.checkpoint.as_deref())?;
    let (generator, discriminator) = checkpoints.load(
        config.model.init_generator::<Backend>(&options, &device),
        config.model.init_discriminator::<Backend>(&device),
        id,
        &device,
    )?;
    let visualizer = SampleVisualizer::new(&generator, &discriminator, &options, config.visualizer_settings());

    match &args.demo_dir {
        Some(demo_dir) => {
            let batch_size = if options.stochastic { 1 } else { config.batch_size };
            let data = AttributeDataset::from_image_dir(demo_dir, config.model.c_dim, config.model.image_size)?;
            for index in 0..data.num_batches(batch_size) {
                let batch = data.batch::<Backend>(index, batch_size, &device)?;
                let path = layout.samples.join(format!("{id}_fake_val_DEMO_{:03}.png", index + 1));
                let written = visualizer.save_fake_output(batch.images, &path, StylePolicy::Random, false, true)?;
                report(&written);
            }
        }
        None => {
            let data = AttributeDataset::load(Path::new(&config.data_dir), DataMode::Test, config.model.image_size)?;
            let folder = layout.samples.join(format!("{id}_test"));
            let suffix = if config.no_labelcum { "_NO_Label_Cum" } else { "" };
            let batches = config.iter_test.min(data.num_batches(config.batch_size));
            for index in 0..batches {
                let batch = data.batch::<Backend>(index, config.batch_size, &device)?;
                let path = folder.join(format!("test_{}_fake{suffix}.png", index + 1));
                for policy in (0..config.style_label_debug).filter_map(StylePolicy::from_index) {
                    let written =
                        visualizer.save_fake_output(batch.images.clone(), &path, policy, false, args.gif)?;
                    report(&written);
                }
                tracing::info!("translated test images and saved into {}", path.display());
            }
        }
    }
    Ok(())
}

fn report(written: &[PathBuf]) {
    for path in written {
        tracing::debug!("wrote {}", path.display());
    }
}
