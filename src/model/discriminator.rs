use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the PatchGAN discriminator with classification heads.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub image_size: usize,
    pub c_dim: usize,
    #[config(default = 64)]
    pub conv_dim: usize,
    #[config(default = 6)]
    pub repeat_num: usize,
    #[config(default = 1)]
    pub branches: usize,
}

/// Patch source scores plus one set of attribute logits per branch.
#[derive(Clone, Debug)]
pub struct DiscriminatorOutput<B: Backend> {
    pub source: Tensor<B, 4>,
    pub classes: Vec<Tensor<B, 2>>,
}

/// Shared trunk with a patch real/fake head and an ensemble of attribute heads.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    conv_src: Conv2d<B>,
    conv_cls: Vec<Conv2d<B>>,
}

impl DiscriminatorConfig {
    /// Output side length of the trunk.
    pub fn feature_size(&self) -> usize {
        self.image_size >> self.repeat_num
    }

    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let mut convs = Vec::with_capacity(self.repeat_num);
        let mut channels = self.conv_dim;
        convs.push(conv(3, channels, 4, 2, 1, true, device));
        for _ in 1..self.repeat_num {
            convs.push(conv(channels, channels * 2, 4, 2, 1, true, device));
            channels *= 2;
        }

        let kernel = self.feature_size().max(1);
        let conv_src = conv(channels, 1, 3, 1, 1, false, device);
        let conv_cls = (0..self.branches)
            .map(|_| conv(channels, self.c_dim, kernel, 1, 0, false, device))
            .collect();

        Discriminator {
            convs,
            conv_src,
            conv_cls,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning the patch source map and the per-branch logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> DiscriminatorOutput<B> {
        let mut x = images;
        for conv in &self.convs {
            x = leaky_relu(conv.forward(x), 0.01);
        }

        let source = self.conv_src.forward(x.clone());
        let classes = self
            .conv_cls
            .iter()
            .map(|head| {
                let logits = head.forward(x.clone());
                let [batch, classes, _, _] = logits.dims();
                logits.reshape([batch, classes])
            })
            .collect();
        DiscriminatorOutput { source, classes }
    }

    /// Number of attribute classification heads.
    pub fn num_branches(&self) -> usize {
        self.conv_cls.len()
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn heads_have_expected_shapes() {
        let device = Default::default();
        let disc = DiscriminatorConfig::new(16, 5)
            .with_conv_dim(4)
            .with_repeat_num(2)
            .with_branches(3)
            .init::<TestBackend>(&device);
        let out = disc.forward(Tensor::zeros([2, 3, 16, 16], &device));
        assert_eq!(out.source.dims(), [2, 1, 4, 4]);
        assert_eq!(out.classes.len(), 3);
        for logits in out.classes {
            assert_eq!(logits.dims(), [2, 5]);
        }
        assert_eq!(disc.num_branches(), 3);
    }
}
