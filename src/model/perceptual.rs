use crate::error::GanError;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::activation::relu;
use std::path::Path;

/// Small VGG-style feature pyramid used as a frozen perceptual metric.
#[derive(Config, Debug)]
pub struct FeatureExtractorConfig {
    #[config(default = 16)]
    pub base_dim: usize,
}

#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stages: Vec<Vec<Conv2d<B>>>,
}

impl FeatureExtractorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeatureExtractor<B> {
        let d = self.base_dim;
        let stages = vec![
            vec![conv(3, d, 1, device), conv(d, d, 1, device)],
            vec![conv(d, d * 2, 2, device), conv(d * 2, d * 2, 1, device)],
            vec![conv(d * 2, d * 4, 2, device), conv(d * 4, d * 4, 1, device)],
        ];
        FeatureExtractor { stages }
    }

    /// Build the extractor and load its pretrained weights.
    ///
    /// The extractor is never optimized: gradients still flow through it into
    /// the generator, but its own parameters are marked as not requiring grad.
    pub fn load<B: Backend>(&self, weights: &Path, device: &B::Device) -> Result<FeatureExtractor<B>, GanError> {
        let record_path = weights.with_extension("mpk");
        if !weights.exists() && !record_path.exists() {
            return Err(GanError::PerceptualWeights {
                path: weights.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }
        let extractor = self
            .init::<B>(device)
            .load_file(weights.with_extension(""), &CompactRecorder::new(), device)
            .map_err(|err| GanError::PerceptualWeights {
                path: weights.to_path_buf(),
                reason: err.to_string(),
            })?;
        tracing::info!("loaded perceptual weights from {}", weights.display());
        Ok(extractor.no_grad())
    }
}

impl<B: Backend> FeatureExtractor<B> {
    /// Activations after every stage.
    pub fn features(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = images;
        let mut out = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            for conv in stage {
                x = relu(conv.forward(x));
            }
            out.push(x.clone());
        }
        out
    }

    /// Mean absolute feature difference averaged over stages.
    pub fn distance(&self, a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
        let fa = self.features(a);
        let fb = self.features(b);
        let stages = fa.len() as f64;
        fa.into_iter()
            .zip(fb)
            .map(|(x, y)| x.sub(y).abs().mean())
            .reduce(|acc, value| acc.add(value))
            .map(|total| total.div_scalar(stages))
            .unwrap_or_else(|| Tensor::zeros([1], &self.devices()[0]))
    }
}

fn conv<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn missing_weights_are_fatal() {
        let device = Default::default();
        let result = FeatureExtractorConfig::new()
            .load::<TestBackend>(Path::new("/nonexistent/perceptual"), &device);
        assert!(matches!(result, Err(GanError::PerceptualWeights { .. })));
    }

    #[test]
    fn distance_is_zero_for_identical_inputs() {
        let device = Default::default();
        let extractor = FeatureExtractorConfig::new().with_base_dim(2).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let d = extractor.distance(x.clone(), x).into_scalar();
        assert_eq!(d, 0.0);
    }

    #[test]
    fn saved_weights_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = FeatureExtractorConfig::new().with_base_dim(2);
        let path = dir.path().join("perceptual");
        config
            .init::<TestBackend>(&device)
            .save_file(path.clone(), &CompactRecorder::new())
            .unwrap();
        assert!(config.load::<TestBackend>(&path, &device).is_ok());
    }
}
