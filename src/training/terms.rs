use crate::error::GanError;
use crate::losses::{classification, generator_adversarial, l1, mse, smoothness, stop_gradient};
use crate::model::{DiscriminatorOutput, FeatureExtractor, Generator, GeneratorOutput, LossConfig};
use crate::options::{AdversarialScheme, GanOptions};
use burn::prelude::*;
use std::path::PathBuf;

/// Weight applied to the pixel reconstruction term when a perceptual term carries it.
const PERCEPTUAL_PIXEL_SHARE: f64 = 0.01;

/// Everything one generator update computed before the losses are taken.
pub struct GeneratorPass<'a, B: Backend> {
    pub generator: &'a Generator<B>,
    pub perceptual: Option<&'a FeatureExtractor<B>>,
    pub real: Tensor<B, 4>,
    pub real_labels: Tensor<B, 2>,
    pub target_labels: Tensor<B, 2>,
    pub fake: GeneratorOutput<B>,
    pub rec: GeneratorOutput<B>,
    /// Discriminator verdict on the fake images.
    pub judged: DiscriminatorOutput<B>,
    /// Source scores of the real images, only for the relativistic scheme.
    pub real_source: Option<Tensor<B, 4>>,
    pub style_fake: Option<Tensor<B, 3>>,
    pub style_rec: Option<Tensor<B, 3>>,
}

impl<B: Backend> GeneratorPass<'_, B> {
    fn perceptual(&self) -> Result<&FeatureExtractor<B>, GanError> {
        self.perceptual.ok_or_else(|| GanError::PerceptualWeights {
            path: PathBuf::new(),
            reason: "feature extractor was not loaded".to_string(),
        })
    }
}

/// A named, already weighted scalar contribution to the generator objective.
pub struct WeightedLoss<B: Backend> {
    pub name: &'static str,
    pub value: Tensor<B, 1>,
}

impl<B: Backend> WeightedLoss<B> {
    fn new(name: &'static str, value: Tensor<B, 1>) -> Self {
        Self { name, value }
    }
}

/// One optional part of the generator objective.
///
/// Each term documents which of its operands are cut from the gradient graph.
pub trait GeneratorLossTerm<B: Backend> {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError>;
}

/// `Gsrc`: the fake images should be judged real.
pub struct AdversarialTerm {
    pub scheme: AdversarialScheme,
}

impl<B: Backend> GeneratorLossTerm<B> for AdversarialTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let loss = generator_adversarial(self.scheme, pass.judged.source.clone(), pass.real_source.clone());
        Ok(vec![WeightedLoss::new("Gsrc", loss)])
    }
}

/// `Gcls`: the fake images should be classified as the target labels.
pub struct ClassificationTerm {
    pub lambda_cls: f64,
}

impl<B: Backend> GeneratorLossTerm<B> for ClassificationTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let loss = classification(&pass.judged.classes, pass.target_labels.clone()).mul_scalar(self.lambda_cls);
        Ok(vec![WeightedLoss::new("Gcls", loss)])
    }
}

/// `Grec` and optionally `Grecp`: the cycle back to the real labels recovers the input.
pub struct ReconstructionTerm {
    pub lambda_rec: f64,
    pub lambda_perceptual: f64,
    pub perceptual: bool,
}

impl<B: Backend> GeneratorLossTerm<B> for ReconstructionTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let pixel = l1(pass.rec.image.clone(), pass.real.clone());
        if !self.perceptual {
            return Ok(vec![WeightedLoss::new("Grec", pixel.mul_scalar(self.lambda_rec))]);
        }
        let features = pass
            .perceptual()?
            .distance(pass.real.clone(), pass.rec.image.clone())
            .mul_scalar(self.lambda_perceptual);
        let pixel = pixel.mul_scalar(PERCEPTUAL_PIXEL_SHARE * self.lambda_perceptual * self.lambda_rec);
        Ok(vec![
            WeightedLoss::new("Grecp", features),
            WeightedLoss::new("Grec", pixel),
        ])
    }
}

/// `Grec1`: fake stays close to real, and rec stays close to the fake.
///
/// The fake operand of the second comparison is gradient-stopped; the first
/// comparison is not.
pub struct BackgroundTerm {
    pub lambda_l1: f64,
}

impl<B: Backend> GeneratorLossTerm<B> for BackgroundTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let forward = l1(pass.fake.image.clone(), pass.real.clone());
        let back = l1(pass.rec.image.clone(), stop_gradient(pass.fake.image.clone()));
        Ok(vec![WeightedLoss::new("Grec1", forward.add(back).mul_scalar(self.lambda_l1))])
    }
}

/// `Grec1p`: the perceptual form of the background term, with no gradient stop.
pub struct PerceptualBackgroundTerm {
    pub lambda_l1perceptual: f64,
}

impl<B: Backend> GeneratorLossTerm<B> for PerceptualBackgroundTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let extractor = pass.perceptual()?;
        let loss = extractor
            .distance(pass.fake.image.clone(), pass.real.clone())
            .add(extractor.distance(pass.rec.image.clone(), pass.fake.image.clone()));
        Ok(vec![WeightedLoss::new("Grec1p", loss.mul_scalar(self.lambda_l1perceptual))])
    }
}

/// `Gatm` and `Gats`: small and smooth attention masks on both passes.
pub struct AttentionTerm {
    pub lambda_mask: f64,
    pub lambda_mask_smooth: f64,
}

impl<B: Backend> GeneratorLossTerm<B> for AttentionTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let (Some(fake_mask), Some(rec_mask)) = (&pass.fake.attention, &pass.rec.attention) else {
            return Ok(Vec::new());
        };
        let mean = rec_mask.clone().mean().add(fake_mask.clone().mean());
        let smooth = smoothness(rec_mask.clone()).add(smoothness(fake_mask.clone()));
        Ok(vec![
            WeightedLoss::new("Gatm", mean.mul_scalar(self.lambda_mask)),
            WeightedLoss::new("Gats", smooth.mul_scalar(self.lambda_mask_smooth)),
        ])
    }
}

/// `Gcon`: the reconstruction's content code matches the gradient-stopped forward code.
pub struct ContentTerm {
    pub lambda_content: f64,
}

impl<B: Backend> GeneratorLossTerm<B> for ContentTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let (Some(fake_content), Some(rec_content)) = (&pass.fake.content, &pass.rec.content) else {
            return Ok(Vec::new());
        };
        let loss = l1(rec_content.clone(), stop_gradient(fake_content.clone()));
        Ok(vec![WeightedLoss::new("Gcon", loss.mul_scalar(self.lambda_content))])
    }
}

/// `Gsty`, `Gstyr` and `Gconr`: style codes survive translation.
///
/// The fed-in forward style keeps its gradient; the return style and the
/// forward content code are gradient-stopped.
pub struct StyleTerm {
    pub lambda_style: f64,
    pub lambda_content: f64,
    pub squared: bool,
    pub rec_style: bool,
    pub rec_content: bool,
}

impl StyleTerm {
    fn criterion<B: Backend>(&self, output: Tensor<B, 3>, target: Tensor<B, 3>) -> Tensor<B, 1> {
        if self.squared {
            mse(output, target)
        } else {
            l1(output, target)
        }
    }
}

impl<B: Backend> GeneratorLossTerm<B> for StyleTerm {
    fn compute(&self, pass: &GeneratorPass<'_, B>) -> Result<Vec<WeightedLoss<B>>, GanError> {
        let Some(style_fake) = &pass.style_fake else {
            return Ok(Vec::new());
        };
        let extracted = pass.generator.get_style(pass.fake.image.clone())?;
        let mut losses = vec![WeightedLoss::new(
            "Gsty",
            self.criterion(extracted, style_fake.clone()).mul_scalar(self.lambda_style),
        )];

        if let (true, Some(style_rec)) = (self.rec_style, &pass.style_rec) {
            let extracted = pass.generator.get_style(pass.rec.image.clone())?;
            let loss = self.criterion(extracted, stop_gradient(style_rec.clone()));
            losses.push(WeightedLoss::new("Gstyr", loss.mul_scalar(self.lambda_style)));

            if let (true, Some(fake_content)) = (self.rec_content, &pass.fake.content) {
                let content = pass
                    .generator
                    .content(pass.rec.image.clone(), pass.real_labels.clone());
                let loss = l1(content, stop_gradient(fake_content.clone()));
                losses.push(WeightedLoss::new("Gconr", loss.mul_scalar(self.lambda_content)));
            }
        }
        Ok(losses)
    }
}

/// The ordered list of active terms, fixed once from the options.
pub fn build_generator_terms<B: Backend>(
    options: &GanOptions,
    loss: &LossConfig,
) -> Vec<Box<dyn GeneratorLossTerm<B>>> {
    let mut terms: Vec<Box<dyn GeneratorLossTerm<B>>> = vec![
        Box::new(AdversarialTerm {
            scheme: options.scheme,
        }),
        Box::new(ClassificationTerm {
            lambda_cls: loss.lambda_cls,
        }),
        Box::new(ReconstructionTerm {
            lambda_rec: loss.lambda_rec,
            lambda_perceptual: loss.lambda_perceptual,
            perceptual: options.perceptual,
        }),
    ];
    if options.l1_loss {
        terms.push(Box::new(BackgroundTerm {
            lambda_l1: loss.lambda_l1,
        }));
    }
    if options.l1_perceptual {
        terms.push(Box::new(PerceptualBackgroundTerm {
            lambda_l1perceptual: loss.lambda_l1perceptual,
        }));
    }
    if options.attention {
        terms.push(Box::new(AttentionTerm {
            lambda_mask: loss.lambda_mask,
            lambda_mask_smooth: loss.lambda_mask_smooth,
        }));
    }
    if options.content_loss {
        terms.push(Box::new(ContentTerm {
            lambda_content: loss.lambda_content,
        }));
    }
    if options.stochastic {
        terms.push(Box::new(StyleTerm {
            lambda_style: loss.lambda_style,
            lambda_content: loss.lambda_content,
            squared: options.mse_style,
            rec_style: options.rec_style,
            rec_content: options.content_loss,
        }));
    }
    terms
}
