#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use stargan_burn::data::{AttributeDataset, DataMode};
use stargan_burn::model::{GeneratorKind, ModelConfig};
use stargan_burn::options::GanOptions;
use stargan_burn::training::{ExperimentLayout, GanTrainer, TrainingConfig};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train an attribute translation GAN with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Checkpoint id `EEE_I` to resume from.
    #[arg(long)]
    pretrained_model: Option<String>,
    /// Comma-separated GAN option tokens, replacing the configured ones.
    #[arg(long, value_delimiter = ',')]
    gan_options: Option<Vec<String>>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(id) = args.pretrained_model {
        config.pretrained_model = Some(id);
    }
    if let Some(tokens) = args.gan_options {
        config.gan_options = tokens;
    }

    let layout = ExperimentLayout::new(&args.experiment_dir);
    layout.create()?;
    init_logging(&layout.log_file())?;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = burn::backend::wgpu::WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    let options = GanOptions::from_tokens(&config.gan_options)?;
    adjust_batch_size_for_wgpu(&mut config, &options, max_storage_buffer_binding_size)?;

    let mut data = AttributeDataset::load(Path::new(&config.data_dir), DataMode::Train, config.model.image_size)?;
    let mut trainer = GanTrainer::<AutodiffBackend>::new(config, layout, device)?;
    trainer.train(&mut data)?;
    Ok(())
}

/// Log to stdout and, without colours, to the experiment's `log.txt`.
fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open {}", log_file.display()))?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    options: &GanOptions,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes =
        estimate_max_conv_workspace_elems(&config.model, options).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce image_size or model dims."
        ));
    }

    if config.batch_size > max_batch {
        tracing::warn!(
            "wgpu max storage buffer size {} bytes; estimated max conv workspace per sample {} bytes. lowering batch_size from {} to {}.",
            max_storage_buffer_binding_size,
            per_sample_bytes,
            config.batch_size,
            max_batch
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

/// Largest im2col buffer of a single sample over every convolution.
fn estimate_max_conv_workspace_elems(model: &ModelConfig, options: &GanOptions) -> u64 {
    let size = model.image_size as u64;
    let dim = model.g_conv_dim as u64;
    let c_dim = model.c_dim as u64;
    let style = if options.generator_kind().uses_style() {
        c_dim * model.style_dim as u64
    } else {
        0
    };
    let stem_in = match options.generator_kind() {
        GeneratorKind::Plain => 3 + c_dim,
        GeneratorKind::DritZ => 3 + c_dim + style,
        _ => 3,
    };

    // (input channels, output side, kernel area)
    let mut layers = vec![
        (stem_in, size, 49),
        (dim, size / 2, 16),
        (dim * 2, size / 4, 16),
        (dim * 4, size / 4, 9),
        (dim * 2, size / 2, 16),
        (dim, size, 16),
        (dim, size, 49),
    ];

    let mut disc_size = size;
    let mut disc_in = 3u64;
    let mut disc_out = model.d_conv_dim as u64;
    for _ in 0..model.d_repeat_num {
        disc_size /= 2;
        layers.push((disc_in, disc_size, 16));
        disc_in = disc_out;
        disc_out *= 2;
    }

    layers
        .into_iter()
        .map(|(channels, side, kernel_area)| channels * side * side * kernel_area)
        .max()
        .unwrap_or_default()
}
