use crate::error::GanError;
use crate::model::GeneratorKind;
use std::collections::BTreeSet;

/// Rule used to turn discriminator scores into a real/fake loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdversarialScheme {
    Standard,
    Relativistic,
    Hinge,
}

impl AdversarialScheme {
    /// Whether the discriminator takes a separate gradient-penalty step.
    pub fn uses_gradient_penalty(self) -> bool {
        !matches!(self, AdversarialScheme::Hinge)
    }
}

/// The GAN option tokens resolved once into booleans.
///
/// Membership is order independent; parsing rejects unknown tokens and
/// impossible combinations so that the update steps never have to re-check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GanOptions {
    pub adain: bool,
    pub stochastic: bool,
    pub drit: bool,
    pub dritz: bool,
    pub scheme: AdversarialScheme,
    pub perceptual: bool,
    pub l1_perceptual: bool,
    pub l1_loss: bool,
    pub attention: bool,
    pub content_loss: bool,
    pub style_labels: bool,
    pub rec_style: bool,
    pub mse_style: bool,
}

const KNOWN_FLAGS: [&str; 14] = [
    "AdaIn",
    "Stochastic",
    "DRIT",
    "DRITZ",
    "RaGAN",
    "HINGE",
    "Perceptual",
    "L1_Perceptual",
    "L1_LOSS",
    "Attention",
    "content_loss",
    "style_labels",
    "rec_style",
    "mse_style",
];

impl Default for GanOptions {
    fn default() -> Self {
        Self {
            adain: false,
            stochastic: false,
            drit: false,
            dritz: false,
            scheme: AdversarialScheme::Standard,
            perceptual: false,
            l1_perceptual: false,
            l1_loss: false,
            attention: false,
            content_loss: false,
            style_labels: false,
            rec_style: false,
            mse_style: false,
        }
    }
}

impl GanOptions {
    /// Resolve a collection of option tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, GanError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            match KNOWN_FLAGS.iter().find(|known| **known == token) {
                Some(known) => {
                    set.insert(*known);
                }
                None => return Err(GanError::UnknownFlag(token.to_string())),
            }
        }

        let has = |flag: &str| set.contains(flag);
        let scheme = match (has("RaGAN"), has("HINGE")) {
            (true, true) => return Err(GanError::ConflictingFlags("RaGAN", "HINGE")),
            (true, false) => AdversarialScheme::Relativistic,
            (false, true) => AdversarialScheme::Hinge,
            (false, false) => AdversarialScheme::Standard,
        };
        if has("DRIT") && !has("AdaIn") {
            return Err(GanError::MissingDependency {
                flag: "DRIT",
                requires: "AdaIn",
            });
        }

        let stochastic = has("Stochastic");
        for flag in ["style_labels", "rec_style", "mse_style"] {
            if has(flag) && !stochastic {
                tracing::warn!("GAN option {flag} ignored without Stochastic");
            }
        }

        Ok(Self {
            adain: has("AdaIn"),
            stochastic,
            drit: has("DRIT"),
            dritz: has("DRITZ"),
            scheme,
            perceptual: has("Perceptual"),
            l1_perceptual: has("L1_Perceptual"),
            l1_loss: has("L1_LOSS"),
            attention: has("Attention"),
            content_loss: has("content_loss"),
            style_labels: stochastic && has("style_labels"),
            rec_style: stochastic && has("rec_style"),
            mse_style: stochastic && has("mse_style"),
        })
    }

    /// Generator variant implied by the architecture options.
    pub fn generator_kind(&self) -> GeneratorKind {
        match (self.adain, self.stochastic, self.drit, self.dritz) {
            (true, false, _, _) => GeneratorKind::AdaInLabel,
            (true, true, false, _) => GeneratorKind::AdaInStochastic,
            (true, true, true, _) => GeneratorKind::Drit,
            (false, _, _, true) => GeneratorKind::DritZ,
            _ => GeneratorKind::Plain,
        }
    }

    /// A frozen perceptual feature extractor is required.
    pub fn uses_perceptual(&self) -> bool {
        self.perceptual || self.l1_perceptual
    }

    /// Active tokens, sorted, for the run header.
    pub fn tokens(&self) -> Vec<&'static str> {
        let mut tokens = Vec::new();
        let pairs = [
            (self.adain, "AdaIn"),
            (self.stochastic, "Stochastic"),
            (self.drit, "DRIT"),
            (self.dritz, "DRITZ"),
            (self.scheme == AdversarialScheme::Relativistic, "RaGAN"),
            (self.scheme == AdversarialScheme::Hinge, "HINGE"),
            (self.perceptual, "Perceptual"),
            (self.l1_perceptual, "L1_Perceptual"),
            (self.l1_loss, "L1_LOSS"),
            (self.attention, "Attention"),
            (self.content_loss, "content_loss"),
            (self.style_labels, "style_labels"),
            (self.rec_style, "rec_style"),
            (self.mse_style, "mse_style"),
        ];
        for (enabled, token) in pairs {
            if enabled {
                tokens.push(token);
            }
        }
        tokens.sort_unstable();
        tokens
    }
}
