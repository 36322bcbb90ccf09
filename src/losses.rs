use crate::model::{Discriminator, DiscriminatorOutput};
use crate::options::AdversarialScheme;
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid, softplus};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

/// Finite-difference step used to differentiate the critic along its input gradient.
pub const GP_PROBE_STEP: f64 = 1e-2;

/// Discriminator-side real/fake loss.
pub fn discriminator_adversarial<B: Backend>(
    scheme: AdversarialScheme,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    match scheme {
        AdversarialScheme::Standard => {
            softplus(real.neg(), 1.0).mean().add(softplus(fake, 1.0).mean())
        }
        AdversarialScheme::Relativistic => {
            let real_mean = batch_mean(&real);
            let fake_mean = batch_mean(&fake);
            softplus(real.sub(fake_mean).neg(), 1.0)
                .mean()
                .add(softplus(fake.sub(real_mean), 1.0).mean())
        }
        AdversarialScheme::Hinge => relu(real.neg().add_scalar(1.0))
            .mean()
            .add(relu(fake.add_scalar(1.0)).mean()),
    }
}

/// Generator-side loss: the fake scores are pushed toward "real".
///
/// The relativistic scheme also needs the real scores of the same samples.
pub fn generator_adversarial<B: Backend>(
    scheme: AdversarialScheme,
    fake: Tensor<B, 4>,
    real: Option<Tensor<B, 4>>,
) -> Tensor<B, 1> {
    match (scheme, real) {
        (AdversarialScheme::Relativistic, Some(real)) => {
            let real_mean = batch_mean(&real);
            let fake_mean = batch_mean(&fake);
            softplus(fake.sub(real_mean).neg(), 1.0)
                .mean()
                .add(softplus(real.sub(fake_mean), 1.0).mean())
        }
        (AdversarialScheme::Hinge, _) => fake.mean().neg(),
        _ => softplus(fake.neg(), 1.0).mean(),
    }
}

fn batch_mean<B: Backend>(scores: &Tensor<B, 4>) -> Tensor<B, 4> {
    scores.clone().mean().reshape([1, 1, 1, 1])
}

/// Binary cross entropy on logits, summed over attributes and averaged over the batch.
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let loss = softplus(logits.clone(), 1.0).sub(logits.mul(labels));
    loss.sum().div_scalar(batch.max(1) as f64)
}

/// Attribute classification loss averaged across discriminator branches.
pub fn classification<B: Backend>(classes: &[Tensor<B, 2>], labels: Tensor<B, 2>) -> Tensor<B, 1> {
    let branches = classes.len().max(1) as f64;
    let device = labels.device();
    classes
        .iter()
        .map(|logits| bce_with_logits(logits.clone(), labels.clone()))
        .reduce(|acc, loss| acc.add(loss))
        .map(|total| total.div_scalar(branches))
        .unwrap_or_else(|| Tensor::zeros([1], &device))
}

/// Hard attribute predictions: branch sigmoids are averaged, then thresholded at 0.5.
pub fn predict_labels<B: Backend>(output: &DiscriminatorOutput<B>) -> Option<Tensor<B, 2>> {
    let branches = output.classes.len() as f64;
    output
        .classes
        .iter()
        .map(|logits| sigmoid(logits.clone()))
        .reduce(|acc, prob| acc.add(prob))
        .map(|total| total.div_scalar(branches).greater_elem(0.5).float())
}

pub fn l1<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    a.sub(b).abs().mean()
}

pub fn mse<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    a.sub(b).square().mean()
}

/// Total-variation style smoothness of a `[B, C, H, W]` map.
pub fn smoothness<B: Backend>(mask: Tensor<B, 4>) -> Tensor<B, 1> {
    let [_, _, height, width] = mask.dims();
    let device = mask.device();
    let mut total = Tensor::zeros([1], &device);
    if height > 1 {
        let dh = mask.clone().slice_dim(2, 1..height).sub(mask.clone().slice_dim(2, 0..height - 1));
        total = total.add(dh.abs().sum());
    }
    if width > 1 {
        let dw = mask.clone().slice_dim(3, 1..width).sub(mask.slice_dim(3, 0..width - 1));
        total = total.add(dw.abs().sum());
    }
    total
}

/// Cut `value` out of the gradient graph before it enters a loss term.
pub fn stop_gradient<B: Backend, const D: usize>(value: Tensor<B, D>) -> Tensor<B, D> {
    value.detach()
}

/// Gradient penalty `mean((|grad_x D(x_hat)| - 1)^2)` on random real/fake interpolates.
///
/// Autodiff here is first order, so the gradient norm is evaluated as the
/// central directional derivative of the critic along its own (detached)
/// unit input-gradient direction. Gradients of the result reach only the
/// discriminator parameters.
pub fn gradient_penalty<B: AutodiffBackend>(
    disc: &Discriminator<B>,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let [batch, channels, height, width] = real.dims();
    let device = real.device();
    let alpha = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Uniform(0.0, 1.0), &device);
    let interpolated = alpha
        .clone()
        .mul(real.detach())
        .add(alpha.neg().add_scalar(1.0).mul(fake.detach()))
        .detach();

    let probe = interpolated.clone().require_grad();
    let grads = critic_score(disc, probe.clone()).sum().backward();
    let direction = match probe.grad(&grads) {
        Some(grad) => Tensor::<B, 4>::from_inner(grad),
        None => Tensor::ones([batch, channels, height, width], &device),
    };
    let norm = direction
        .clone()
        .square()
        .sum_dims(&[1, 2, 3])
        .sqrt()
        .add_scalar(1e-12);
    let unit = direction.div(norm).mul_scalar(GP_PROBE_STEP).detach();

    let ahead = critic_score(disc, interpolated.clone().add(unit.clone()));
    let behind = critic_score(disc, interpolated.sub(unit));
    let slope = ahead.sub(behind).div_scalar(2.0 * GP_PROBE_STEP);
    slope.sub_scalar(1.0).square().mean()
}

/// Per-sample sum of the patch source map, shape `[B, 1, 1, 1]`.
fn critic_score<B: Backend>(disc: &Discriminator<B>, images: Tensor<B, 4>) -> Tensor<B, 4> {
    disc.forward(images).source.sum_dims(&[1, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiscriminatorConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<NdArray<f32>>;

    fn scores(values: [f32; 2], device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values, device).reshape([2, 1, 1, 1])
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn hinge_generator_loss_is_negative_mean() {
        let device = Default::default();
        let fake = scores([1.0, 3.0], &device);
        let loss = scalar(generator_adversarial(AdversarialScheme::Hinge, fake, None));
        assert!((loss + 2.0).abs() < 1e-6);
    }

    #[test]
    fn hinge_discriminator_loss_vanishes_outside_margin() {
        let device = Default::default();
        let loss = discriminator_adversarial(
            AdversarialScheme::Hinge,
            scores([2.0, 1.5], &device),
            scores([-1.0, -4.0], &device),
        );
        assert!(scalar(loss).abs() < 1e-6);
    }

    #[test]
    fn standard_loss_prefers_separated_scores() {
        let device = Default::default();
        let good = discriminator_adversarial(
            AdversarialScheme::Standard,
            scores([4.0, 4.0], &device),
            scores([-4.0, -4.0], &device),
        );
        let bad = discriminator_adversarial(
            AdversarialScheme::Standard,
            scores([-4.0, -4.0], &device),
            scores([4.0, 4.0], &device),
        );
        assert!(scalar(good) < scalar(bad));
    }

    #[test]
    fn relativistic_loss_only_depends_on_score_gap() {
        let device = Default::default();
        let base = discriminator_adversarial(
            AdversarialScheme::Relativistic,
            scores([1.0, 2.0], &device),
            scores([0.0, 0.5], &device),
        );
        let shifted = discriminator_adversarial(
            AdversarialScheme::Relativistic,
            scores([11.0, 12.0], &device),
            scores([10.0, 10.5], &device),
        );
        assert!((scalar(base) - scalar(shifted)).abs() < 1e-5);
    }

    #[test]
    fn classification_averages_branches() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0]], &device);
        let confident = Tensor::<TestBackend, 2>::from_floats([[20.0, -20.0]], &device);
        let wrong = Tensor::<TestBackend, 2>::from_floats([[-20.0, 20.0]], &device);
        let single = scalar(classification(&[wrong.clone()], labels.clone()));
        let mixed = scalar(classification(&[confident, wrong], labels));
        assert!((mixed - single / 2.0).abs() < 1e-3);
    }

    #[test]
    fn predictions_threshold_averaged_sigmoids() {
        let device = Default::default();
        let output = DiscriminatorOutput {
            source: Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &device),
            classes: vec![
                Tensor::from_floats([[3.0, -3.0, 2.0]], &device),
                Tensor::from_floats([[3.0, -3.0, -6.0]], &device),
            ],
        };
        let labels = predict_labels(&output).unwrap().to_data().to_vec::<f32>().unwrap();
        assert_eq!(labels, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn smoothness_is_zero_for_constant_mask() {
        let device = Default::default();
        let mask = Tensor::<TestBackend, 4>::ones([2, 1, 4, 4], &device);
        assert_eq!(scalar(smoothness(mask)), 0.0);

        let ramp = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0], &device).reshape([1, 1, 1, 3]);
        assert!((scalar(smoothness(ramp)) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn gradient_penalty_is_finite_and_reaches_discriminator() {
        let device = Default::default();
        let disc = DiscriminatorConfig::new(8, 2)
            .with_conv_dim(4)
            .with_repeat_num(2)
            .init::<TestAutodiff>(&device);
        let real = Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);
        let fake = Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);
        let penalty = gradient_penalty(&disc, real, fake);
        let value: f32 = penalty.clone().into_scalar();
        assert!(value.is_finite() && value >= 0.0);

        let grads = penalty.backward();
        let params = burn::optim::GradientsParams::from_grads(grads, &disc);
        assert!(!params.is_empty());
    }
}
