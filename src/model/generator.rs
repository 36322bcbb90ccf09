use crate::error::GanError;
use crate::model::layers::{tile, AdaInParams, ResidualBlock};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu, sigmoid};
use burn::tensor::Distribution;

/// The closed set of generator architectures, selected once from the options.
#[derive(Module, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Target label tiled and concatenated to the input image.
    Plain,
    /// Residual blocks modulated by AdaIn params computed from the label.
    AdaInLabel,
    /// AdaIn params computed from the label and a style code.
    AdaInStochastic,
    /// Label and style tiled onto the content code and fused at the bottleneck.
    Drit,
    /// Label and style tiled onto the input image.
    DritZ,
}

impl GeneratorKind {
    pub fn name(self) -> &'static str {
        match self {
            GeneratorKind::Plain => "Plain",
            GeneratorKind::AdaInLabel => "AdaInLabel",
            GeneratorKind::AdaInStochastic => "AdaInStochastic",
            GeneratorKind::Drit => "Drit",
            GeneratorKind::DritZ => "DritZ",
        }
    }

    /// Variants that consume a style code and can extract one from an image.
    pub fn uses_style(self) -> bool {
        matches!(
            self,
            GeneratorKind::AdaInStochastic | GeneratorKind::Drit | GeneratorKind::DritZ
        )
    }
}

/// Configuration for the attribute-conditioned encoder/decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub c_dim: usize,
    #[config(default = 64)]
    pub conv_dim: usize,
    #[config(default = 6)]
    pub repeat_num: usize,
    #[config(default = 8)]
    pub style_dim: usize,
    #[config(default = 256)]
    pub adain_hidden: usize,
    #[config(default = false)]
    pub attention: bool,
}

/// Forward outputs; optional parts depend on the variant and on the request.
#[derive(Clone, Debug)]
pub struct GeneratorOutput<B: Backend> {
    pub image: Tensor<B, 4>,
    pub attention: Option<Tensor<B, 4>>,
    pub content: Option<Tensor<B, 4>>,
}

/// MLP mapping a conditioning code to AdaIn params for every residual block.
#[derive(Module, Debug)]
pub struct AdaInMlp<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    #[module(ignore)]
    blocks: usize,
    #[module(ignore)]
    channels: usize,
}

impl<B: Backend> AdaInMlp<B> {
    fn new(input: usize, hidden: usize, blocks: usize, channels: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(input, hidden).init(device),
            fc2: LinearConfig::new(hidden, blocks * 4 * channels).init(device),
            blocks,
            channels,
        }
    }

    fn forward(&self, code: Tensor<B, 2>) -> Vec<[AdaInParams<B>; 2]> {
        let out = self.fc2.forward(relu(self.fc1.forward(code)));
        let ch = self.channels;
        (0..self.blocks)
            .map(|block| {
                let base = block * 4 * ch;
                let part = |idx: usize| out.clone().slice_dim(1, (base + idx * ch)..(base + (idx + 1) * ch));
                [
                    AdaInParams {
                        scale: part(0).add_scalar(1.0),
                        shift: part(1),
                    },
                    AdaInParams {
                        scale: part(2).add_scalar(1.0),
                        shift: part(3),
                    },
                ]
            })
            .collect()
    }
}

/// Convolutional encoder from an image to a `[B, c_dim, style_dim]` code.
#[derive(Module, Debug)]
pub struct StyleEncoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    fc: Linear<B>,
    #[module(ignore)]
    c_dim: usize,
    #[module(ignore)]
    style_dim: usize,
}

impl<B: Backend> StyleEncoder<B> {
    fn new(conv_dim: usize, c_dim: usize, style_dim: usize, device: &B::Device) -> Self {
        let convs = vec![
            down_conv(3, conv_dim, device),
            down_conv(conv_dim, conv_dim * 2, device),
            down_conv(conv_dim * 2, conv_dim * 4, device),
        ];
        Self {
            convs,
            fc: LinearConfig::new(conv_dim * 4, c_dim * style_dim).init(device),
            c_dim,
            style_dim,
        }
    }

    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let mut x = images;
        for conv in &self.convs {
            x = leaky_relu(conv.forward(x), 0.2);
        }
        let [batch, channels, _, _] = x.dims();
        let pooled = x.mean_dims(&[2, 3]).reshape([batch, channels]);
        self.fc
            .forward(pooled)
            .reshape([batch, self.c_dim, self.style_dim])
    }
}

/// Encoder / residual bottleneck / decoder generator with optional attention head.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: InstanceNorm<B>,
    down: Vec<Conv2d<B>>,
    down_norms: Vec<InstanceNorm<B>>,
    fuse: Option<Conv2d<B>>,
    blocks: Vec<ResidualBlock<B>>,
    up: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    to_image: Conv2d<B>,
    to_mask: Option<Conv2d<B>>,
    adain_mlp: Option<AdaInMlp<B>>,
    style_encoder: Option<StyleEncoder<B>>,
    #[module(ignore)]
    kind: GeneratorKind,
    #[module(ignore)]
    c_dim: usize,
    #[module(ignore)]
    style_dim: usize,
}

impl GeneratorConfig {
    /// Initialize the layers of the requested variant on the given device.
    pub fn init<B: Backend>(&self, kind: GeneratorKind, device: &B::Device) -> Generator<B> {
        let dim = self.conv_dim;
        let bottleneck = dim * 4;
        let style_width = self.c_dim * self.style_dim;

        let in_channels = match kind {
            GeneratorKind::Plain => 3 + self.c_dim,
            GeneratorKind::DritZ => 3 + self.c_dim + style_width,
            _ => 3,
        };

        let stem = Conv2dConfig::new([in_channels, dim], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let down = vec![
            down_conv(dim, dim * 2, device),
            down_conv(dim * 2, bottleneck, device),
        ];
        let down_norms = vec![instance_norm(dim * 2, device), instance_norm(bottleneck, device)];

        let fuse = (kind == GeneratorKind::Drit).then(|| {
            Conv2dConfig::new([bottleneck + self.c_dim + style_width, bottleneck], [1, 1])
                .init(device)
        });

        let blocks = (0..self.repeat_num)
            .map(|_| ResidualBlock::new(bottleneck, device))
            .collect();

        let up = vec![
            up_conv(bottleneck, dim * 2, device),
            up_conv(dim * 2, dim, device),
        ];
        let up_norms = vec![instance_norm(dim * 2, device), instance_norm(dim, device)];

        let to_image = head(dim, 3, device);
        let to_mask = self.attention.then(|| head(dim, 1, device));

        let adain_mlp = match kind {
            GeneratorKind::AdaInLabel => Some(AdaInMlp::new(
                self.c_dim,
                self.adain_hidden,
                self.repeat_num,
                bottleneck,
                device,
            )),
            GeneratorKind::AdaInStochastic => Some(AdaInMlp::new(
                self.c_dim + style_width,
                self.adain_hidden,
                self.repeat_num,
                bottleneck,
                device,
            )),
            _ => None,
        };
        let style_encoder = kind
            .uses_style()
            .then(|| StyleEncoder::new(dim, self.c_dim, self.style_dim, device));

        Generator {
            stem,
            stem_norm: instance_norm(dim, device),
            down,
            down_norms,
            fuse,
            blocks,
            up,
            up_norms,
            to_image,
            to_mask,
            adain_mlp,
            style_encoder,
            kind,
            c_dim: self.c_dim,
            style_dim: self.style_dim,
        }
    }
}

impl<B: Backend> Generator<B> {
    pub fn kind(&self) -> GeneratorKind {
        self.kind
    }

    /// Number of attribute classes the generator is conditioned on.
    pub fn c_dim(&self) -> usize {
        self.c_dim
    }

    pub fn emits_attention(&self) -> bool {
        self.to_mask.is_some()
    }

    /// Parameter counts of the optional conditioning and attention submodules present.
    pub fn submodule_params(&self) -> Vec<(&'static str, usize)> {
        let mut counts = Vec::new();
        if let Some(mlp) = &self.adain_mlp {
            counts.push(("adain_mlp", mlp.num_params()));
        }
        if let Some(encoder) = &self.style_encoder {
            counts.push(("style_encoder", encoder.num_params()));
        }
        if let Some(head) = &self.to_mask {
            counts.push(("attention_head", head.num_params()));
        }
        counts
    }

    /// Translate `images` toward `target`.
    ///
    /// Style-consuming variants substitute a zero code when `style` is None.
    /// The content code is only returned when `with_content` is set.
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        target: Tensor<B, 2>,
        style: Option<Tensor<B, 3>>,
        with_content: bool,
    ) -> GeneratorOutput<B> {
        let style = self.resolve_style(style, &images);
        let content = self.encode(images.clone(), &target, style.as_ref());

        let mut x = content.clone();
        if let Some(fuse) = &self.fuse {
            let [_, _, height, width] = x.dims();
            let code = self.condition_code(&target, style.as_ref());
            x = relu(fuse.forward(Tensor::cat(vec![x, tile(code, height, width)], 1)));
        }

        let adain = self.adain_mlp.as_ref().map(|mlp| {
            let code = match self.kind {
                GeneratorKind::AdaInStochastic => self.condition_code(&target, style.as_ref()),
                _ => target.clone(),
            };
            mlp.forward(code)
        });
        for (idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(x, adain.as_ref().map(|params| &params[idx]));
        }

        for (conv, norm) in self.up.iter().zip(self.up_norms.iter()) {
            x = relu(norm.forward(conv.forward(x)));
        }

        let color = self.to_image.forward(x.clone()).tanh();
        let (image, attention) = match &self.to_mask {
            Some(mask_head) => {
                // Mask 1 keeps the input pixel, 0 takes the generated color.
                let mask = sigmoid(mask_head.forward(x));
                let keep = mask.clone().mul(images);
                let change = mask.clone().neg().add_scalar(1.0).mul(color);
                (keep.add(change), Some(mask))
            }
            None => (color, None),
        };

        GeneratorOutput {
            image,
            attention,
            content: with_content.then_some(content),
        }
    }

    /// Content code only, without decoding.
    pub fn content(&self, images: Tensor<B, 4>, target: Tensor<B, 2>) -> Tensor<B, 4> {
        let style = self.resolve_style(None, &images);
        self.encode(images, &target, style.as_ref())
    }

    /// Draw a style code from the standard normal prior.
    pub fn random_style(&self, images: &Tensor<B, 4>) -> Tensor<B, 3> {
        let batch = images.dims()[0];
        Tensor::random(
            [batch, self.c_dim, self.style_dim],
            Distribution::Normal(0.0, 1.0),
            &images.device(),
        )
    }

    /// Extract the style code implied by `images`.
    pub fn get_style(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 3>, GanError> {
        self.style_encoder
            .as_ref()
            .map(|encoder| encoder.forward(images))
            .ok_or(GanError::MissingStyleEncoder)
    }

    fn resolve_style(&self, style: Option<Tensor<B, 3>>, images: &Tensor<B, 4>) -> Option<Tensor<B, 3>> {
        if !self.kind.uses_style() {
            return None;
        }
        Some(style.unwrap_or_else(|| {
            let batch = images.dims()[0];
            Tensor::zeros([batch, self.c_dim, self.style_dim], &images.device())
        }))
    }

    fn condition_code(&self, target: &Tensor<B, 2>, style: Option<&Tensor<B, 3>>) -> Tensor<B, 2> {
        match style {
            Some(style) => {
                let [batch, classes, dim] = style.dims();
                let flat = style.clone().reshape([batch, classes * dim]);
                Tensor::cat(vec![target.clone(), flat], 1)
            }
            None => target.clone(),
        }
    }

    fn encode(&self, images: Tensor<B, 4>, target: &Tensor<B, 2>, style: Option<&Tensor<B, 3>>) -> Tensor<B, 4> {
        let [_, _, height, width] = images.dims();
        let input = match self.kind {
            GeneratorKind::Plain => Tensor::cat(vec![images, tile(target.clone(), height, width)], 1),
            GeneratorKind::DritZ => {
                let code = self.condition_code(target, style);
                Tensor::cat(vec![images, tile(code, height, width)], 1)
            }
            _ => images,
        };

        let mut x = relu(self.stem_norm.forward(self.stem.forward(input)));
        for (conv, norm) in self.down.iter().zip(self.down_norms.iter()) {
            x = relu(norm.forward(conv.forward(x)));
        }
        x
    }
}

fn instance_norm<B: Backend>(channels: usize, device: &B::Device) -> InstanceNorm<B> {
    InstanceNormConfig::new(channels).with_affine(true).init(device)
}

fn down_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn up_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(false)
        .init(device)
}

fn head<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [7, 7])
        .with_padding(PaddingConfig2d::Explicit(3, 3))
        .with_bias(false)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(attention: bool) -> GeneratorConfig {
        GeneratorConfig::new(3)
            .with_conv_dim(4)
            .with_repeat_num(1)
            .with_style_dim(2)
            .with_adain_hidden(8)
            .with_attention(attention)
    }

    fn inputs(device: &<TestBackend as Backend>::Device) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 2>) {
        let images = Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device);
        let labels = Tensor::from_floats([[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]], device);
        (images, labels)
    }

    #[test]
    fn every_variant_preserves_image_shape() {
        let device = Default::default();
        let (images, labels) = inputs(&device);
        for kind in [
            GeneratorKind::Plain,
            GeneratorKind::AdaInLabel,
            GeneratorKind::AdaInStochastic,
            GeneratorKind::Drit,
            GeneratorKind::DritZ,
        ] {
            let generator = config(false).init::<TestBackend>(kind, &device);
            let style = generator.random_style(&images);
            let out = generator.forward(images.clone(), labels.clone(), Some(style), true);
            assert_eq!(out.image.dims(), [2, 3, 8, 8], "{}", kind.name());
            assert_eq!(out.content.map(|c| c.dims()), Some([2, 16, 2, 2]));
            assert!(out.attention.is_none());
        }
    }

    #[test]
    fn attention_head_emits_unit_interval_mask() {
        let device = Default::default();
        let (images, labels) = inputs(&device);
        let generator = config(true).init::<TestBackend>(GeneratorKind::Plain, &device);
        let out = generator.forward(images, labels, None, false);
        let mask = out.attention.expect("attention mask");
        assert_eq!(mask.dims(), [2, 1, 8, 8]);
        let values = mask.to_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(out.content.is_none());
    }

    #[test]
    fn style_extraction_requires_encoder() {
        let device = Default::default();
        let (images, _) = inputs(&device);
        let plain = config(false).init::<TestBackend>(GeneratorKind::Plain, &device);
        assert!(matches!(plain.get_style(images.clone()), Err(GanError::MissingStyleEncoder)));

        let drit = config(false).init::<TestBackend>(GeneratorKind::Drit, &device);
        assert_eq!(drit.get_style(images).unwrap().dims(), [2, 3, 2]);
    }

    #[test]
    fn submodule_counts_follow_the_variant() {
        let device = Default::default();
        let plain = config(false).init::<TestBackend>(GeneratorKind::Plain, &device);
        assert!(plain.submodule_params().is_empty());

        let stochastic = config(true).init::<TestBackend>(GeneratorKind::AdaInStochastic, &device);
        let counts = stochastic.submodule_params();
        let names: Vec<_> = counts.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["adain_mlp", "style_encoder", "attention_head"]);
        assert!(counts.iter().all(|(_, count)| *count > 0));
        let attention_head = 4 * 7 * 7;
        assert_eq!(counts[2].1, attention_head);
        assert!(counts.iter().map(|(_, count)| count).sum::<usize>() < stochastic.num_params());
    }
}
