pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod perceptual;

use crate::error::GanError;
use crate::options::GanOptions;
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig, DiscriminatorOutput};
pub use generator::{Generator, GeneratorConfig, GeneratorKind, GeneratorOutput};
pub use perceptual::{FeatureExtractor, FeatureExtractorConfig};

/// Hyperparameters for the generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_size: usize,
    pub c_dim: usize,
    #[config(default = 64)]
    pub g_conv_dim: usize,
    #[config(default = 6)]
    pub g_repeat_num: usize,
    #[config(default = 64)]
    pub d_conv_dim: usize,
    #[config(default = 6)]
    pub d_repeat_num: usize,
    #[config(default = 1)]
    pub d_branches: usize,
    #[config(default = 8)]
    pub style_dim: usize,
    #[config(default = 256)]
    pub adain_hidden: usize,
}

/// Weighting for each loss term used during training.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub lambda_cls: f64,
    #[config(default = 10.0)]
    pub lambda_gp: f64,
    #[config(default = 10.0)]
    pub lambda_rec: f64,
    #[config(default = 1.0)]
    pub lambda_l1: f64,
    #[config(default = 1.0)]
    pub lambda_l1perceptual: f64,
    #[config(default = 0.1)]
    pub lambda_mask: f64,
    #[config(default = 1e-5)]
    pub lambda_mask_smooth: f64,
    #[config(default = 1.0)]
    pub lambda_content: f64,
    #[config(default = 1.0)]
    pub lambda_style: f64,
    #[config(default = 1.0)]
    pub lambda_perceptual: f64,
}

impl ModelConfig {
    pub fn generator_config(&self, options: &GanOptions) -> GeneratorConfig {
        GeneratorConfig::new(self.c_dim)
            .with_conv_dim(self.g_conv_dim)
            .with_repeat_num(self.g_repeat_num)
            .with_style_dim(self.style_dim)
            .with_adain_hidden(self.adain_hidden)
            .with_attention(options.attention)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.image_size, self.c_dim)
            .with_conv_dim(self.d_conv_dim)
            .with_repeat_num(self.d_repeat_num)
            .with_branches(self.d_branches)
    }

    /// Reject option/architecture combinations before any layer is built.
    pub fn validate(&self, options: &GanOptions) -> Result<(), GanError> {
        if self.c_dim == 0 {
            return Err(GanError::InvalidModel("c_dim must be positive".into()));
        }
        if self.d_branches == 0 {
            return Err(GanError::MissingClassifierBranches {
                expected: 1,
                found: 0,
            });
        }
        let patch = u32::try_from(self.d_repeat_num)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift));
        match patch {
            Some(patch) if self.d_repeat_num > 0 && self.image_size % patch == 0 => {}
            _ => {
                return Err(GanError::InvalidModel(format!(
                    "image_size {} must be divisible by 2^{} (d_repeat_num)",
                    self.image_size, self.d_repeat_num
                )))
            }
        }
        if self.image_size % 4 != 0 {
            return Err(GanError::InvalidModel(format!(
                "image_size {} must be divisible by 4",
                self.image_size
            )));
        }

        let kind = options.generator_kind();
        if options.dritz && !options.stochastic {
            return Err(GanError::MissingDependency {
                flag: "DRITZ",
                requires: "Stochastic",
            });
        }
        if options.stochastic && !kind.uses_style() {
            return Err(GanError::UnsupportedVariant {
                variant: kind.name(),
                capability: "produce or consume style codes (Stochastic needs AdaIn or DRITZ)",
            });
        }
        if kind.uses_style() && self.image_size % 8 != 0 {
            return Err(GanError::InvalidModel(format!(
                "style encoder needs image_size divisible by 8, got {}",
                self.image_size
            )));
        }
        Ok(())
    }

    /// Build the generator variant selected by the options.
    pub fn init_generator<B: Backend>(&self, options: &GanOptions, device: &B::Device) -> Generator<B> {
        self.generator_config(options)
            .init(options.generator_kind(), device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config().init(device)
    }
}
