use crate::ledger::{record_scalar, LossLedger};
use crate::losses::{classification, discriminator_adversarial, gradient_penalty, stop_gradient};
use crate::model::{Discriminator, Generator, LossConfig};
use crate::options::GanOptions;
use crate::training::schedule::{permute_rows, target_permutation};
use anyhow::Result;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;

/// Outcome of one discriminator update.
#[derive(Clone, Debug)]
pub struct DiscriminatorReport<B: Backend> {
    /// Target labels the fake images were generated for.
    pub fake_labels: Tensor<B, 2>,
    pub optimizer_steps: usize,
}

/// Adversarial + classification step, then an isolated gradient-penalty step.
pub struct DiscriminatorStep<'a> {
    pub options: &'a GanOptions,
    pub loss: &'a LossConfig,
}

impl DiscriminatorStep<'_> {
    pub fn run<B, O>(
        &self,
        generator: &Generator<B>,
        discriminator: Discriminator<B>,
        optimizer: &mut O,
        lr: f64,
        real: Tensor<B, 4>,
        real_labels: Tensor<B, 2>,
        rng: &mut impl Rng,
        ledger: &mut LossLedger,
    ) -> Result<(Discriminator<B>, DiscriminatorReport<B>)>
    where
        B: AutodiffBackend,
        O: Optimizer<Discriminator<B>, B>,
    {
        let permutation = target_permutation(real_labels.dims()[0], rng);
        let fake_labels = permute_rows(real_labels.clone(), &permutation);

        let style = self.options.stochastic.then(|| {
            let style = generator.random_style(&real);
            if self.options.style_labels {
                style.mul(fake_labels.clone().unsqueeze_dim::<3>(2))
            } else {
                style
            }
        });
        let fake = stop_gradient(
            generator
                .forward(real.clone(), fake_labels.clone(), style, false)
                .image,
        );

        let real_out = discriminator.forward(real.clone());
        let fake_source = discriminator.forward(fake.clone()).source;
        let d_src = discriminator_adversarial(self.options.scheme, real_out.source, fake_source);
        let d_cls = classification(&real_out.classes, real_labels).mul_scalar(self.loss.lambda_cls);
        record_scalar(ledger, "Dsrc", &d_src)?;
        record_scalar(ledger, "Dcls", &d_cls)?;

        let grads = d_src.add(d_cls).backward();
        let grads = GradientsParams::from_grads(grads, &discriminator);
        let mut discriminator = optimizer.step(lr, discriminator, grads);
        let mut optimizer_steps = 1;

        if self.options.scheme.uses_gradient_penalty() {
            // Evaluated against the discriminator that was just updated.
            let d_gp = gradient_penalty(&discriminator, real, fake).mul_scalar(self.loss.lambda_gp);
            record_scalar(ledger, "Dgp", &d_gp)?;
            let grads = GradientsParams::from_grads(d_gp.backward(), &discriminator);
            discriminator = optimizer.step(lr, discriminator, grads);
            optimizer_steps += 1;
        }

        Ok((
            discriminator,
            DiscriminatorReport {
                fake_labels,
                optimizer_steps,
            },
        ))
    }
}
