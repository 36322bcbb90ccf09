use crate::ledger::{record_scalar, LossLedger};
use crate::model::{Discriminator, FeatureExtractor, Generator};
use crate::options::{AdversarialScheme, GanOptions};
use crate::training::terms::{GeneratorLossTerm, GeneratorPass};
use anyhow::{anyhow, Result};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

#[derive(Clone, Copy, Debug)]
pub struct GeneratorReport {
    pub optimizer_steps: usize,
    /// Sum of every active term.
    pub loss: f64,
}

/// Forward and cycle translation, ordered loss terms, one backward, one step.
pub struct GeneratorStep<'a, B: Backend> {
    pub options: &'a GanOptions,
    pub terms: &'a [Box<dyn GeneratorLossTerm<B>>],
    pub perceptual: Option<&'a FeatureExtractor<B>>,
}

impl<B: AutodiffBackend> GeneratorStep<'_, B> {
    pub fn run<O>(
        &self,
        generator: Generator<B>,
        discriminator: &Discriminator<B>,
        optimizer: &mut O,
        lr: f64,
        real: Tensor<B, 4>,
        real_labels: Tensor<B, 2>,
        target_labels: Tensor<B, 2>,
        ledger: &mut LossLedger,
    ) -> Result<(Generator<B>, GeneratorReport)>
    where
        O: Optimizer<Generator<B>, B>,
    {
        let (style_fake, style_rec) = if self.options.stochastic {
            let mut style_fake = generator.random_style(&real);
            let mut style_rec = generator.random_style(&real);
            if self.options.style_labels {
                style_fake = style_fake.mul(target_labels.clone().unsqueeze_dim::<3>(2));
                style_rec = style_rec.mul(real_labels.clone().unsqueeze_dim::<3>(2));
            }
            (Some(style_fake), Some(style_rec))
        } else {
            (None, None)
        };

        let with_content = self.options.content_loss;
        let fake = generator.forward(real.clone(), target_labels.clone(), style_fake.clone(), with_content);
        let rec = generator.forward(fake.image.clone(), real_labels.clone(), style_rec.clone(), with_content);
        let judged = discriminator.forward(fake.image.clone());
        let real_source = (self.options.scheme == AdversarialScheme::Relativistic)
            .then(|| discriminator.forward(real.clone()).source.detach());

        let pass = GeneratorPass {
            generator: &generator,
            perceptual: self.perceptual,
            real,
            real_labels,
            target_labels,
            fake,
            rec,
            judged,
            real_source,
            style_fake,
            style_rec,
        };

        let mut total: Option<Tensor<B, 1>> = None;
        let mut value = 0.0;
        for term in self.terms {
            for loss in term.compute(&pass)? {
                value += record_scalar(ledger, loss.name, &loss.value)?;
                total = Some(match total {
                    Some(total) => total.add(loss.value),
                    None => loss.value,
                });
            }
        }
        let total = total.ok_or_else(|| anyhow!("generator objective has no active terms"))?;
        drop(pass);

        let grads = GradientsParams::from_grads(total.backward(), &generator);
        let generator = optimizer.step(lr, generator, grads);
        Ok((
            generator,
            GeneratorReport {
                optimizer_steps: 1,
                loss: value,
            },
        ))
    }
}
