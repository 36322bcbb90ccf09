use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Per-channel scale and shift applied by adaptive instance norm.
#[derive(Clone, Debug)]
pub struct AdaInParams<B: Backend> {
    pub scale: Tensor<B, 2>,
    pub shift: Tensor<B, 2>,
}

/// Instance-normalize `x` and modulate it with externally produced params.
pub fn adaptive_instance_norm<B: Backend>(
    x: Tensor<B, 4>,
    params: &AdaInParams<B>,
    epsilon: f64,
) -> Tensor<B, 4> {
    let mean = x.clone().mean_dims(&[2, 3]);
    let var = x.clone().sub(mean.clone()).square().mean_dims(&[2, 3]);
    let norm = (x - mean).div((var + epsilon).sqrt());

    let [batch, channels, _, _] = norm.dims();
    let scale = params.scale.clone().reshape([batch, channels, 1, 1]);
    let shift = params.shift.clone().reshape([batch, channels, 1, 1]);
    norm.mul(scale).add(shift)
}

/// Two 3x3 convolutions with a skip connection.
///
/// Normalization is affine instance norm unless AdaIn params are supplied,
/// in which case the block's own norm layers are bypassed.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv3x3(channels, device),
            norm1: InstanceNormConfig::new(channels).with_affine(true).init(device),
            conv2: conv3x3(channels, device),
            norm2: InstanceNormConfig::new(channels).with_affine(true).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, adain: Option<&[AdaInParams<B>; 2]>) -> Tensor<B, 4> {
        let mut h = self.conv1.forward(x.clone());
        h = match adain {
            Some([first, _]) => adaptive_instance_norm(h, first, 1e-5),
            None => self.norm1.forward(h),
        };
        h = relu(h);
        h = self.conv2.forward(h);
        h = match adain {
            Some([_, second]) => adaptive_instance_norm(h, second, 1e-5),
            None => self.norm2.forward(h),
        };
        x.add(h)
    }
}

/// Repeat a `[B, C]` code over a `[H, W]` grid.
pub fn tile<B: Backend>(code: Tensor<B, 2>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, channels] = code.dims();
    code.reshape([batch, channels, 1, 1])
        .repeat(&[1, 1, height, width])
}

fn conv3x3<B: Backend>(channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels, channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}
