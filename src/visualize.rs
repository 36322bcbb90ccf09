use crate::losses::predict_labels;
use crate::model::{Discriminator, Generator};
use crate::options::GanOptions;
use crate::utils::{column_grid, mask_to_images, merge_images, save_image, tensor_to_images, write_gif};
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use std::path::{Path, PathBuf};

/// How the style code varies across the repeats of one sample in a style sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StylePolicy {
    /// A fresh random code per repeat.
    Random,
    /// Repeat 0's code everywhere, label weight ramps by `0.2 * j`.
    CopyFirst,
    /// Zero code, label weight ramps by `0.2 * j`.
    ZeroCode,
    /// Random code scaled per class by the target vector.
    LabelScaled,
    /// Codes extracted from the neighbouring samples of the batch.
    NeighborWindow,
}

impl StylePolicy {
    pub const ALL: [StylePolicy; 5] = [
        StylePolicy::Random,
        StylePolicy::CopyFirst,
        StylePolicy::ZeroCode,
        StylePolicy::LabelScaled,
        StylePolicy::NeighborWindow,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|policy| *policy == self).unwrap_or_default()
    }
}

/// One-hot target `e_k` repeated over the batch, for every class `k`.
pub fn target_debug_list<B: Backend>(batch: usize, c_dim: usize, device: &B::Device) -> Vec<Tensor<B, 2>> {
    (0..c_dim)
        .map(|class| {
            let mut values = vec![0.0f32; batch * c_dim];
            for row in 0..batch {
                values[row * c_dim + class] = 1.0;
            }
            Tensor::from_data(TensorData::new(values, [batch, c_dim]), device)
        })
        .collect()
}

/// Batch indices `idx + j - repeats / 2` for `j in 0..repeats`, wrapped around the batch.
pub fn neighbor_window(idx: usize, repeats: usize, batch: usize) -> Vec<usize> {
    let half = (repeats / 2) as i64;
    (0..repeats as i64)
        .map(|j| (idx as i64 + j - half).rem_euclid(batch.max(1) as i64) as usize)
        .collect()
}

#[derive(Clone, Copy, Debug)]
pub struct VisualizerSettings {
    /// Repeats per sample in a style sweep.
    pub style_debug: usize,
    /// Last sample index swept; the whole batch when `None`.
    pub iter_style: Option<usize>,
    pub no_labelcum: bool,
}

/// Translated columns plus the aligned attention columns when masks exist.
pub struct Translation<B: Backend> {
    pub columns: Vec<Tensor<B, 4>>,
    pub attention: Option<Vec<Tensor<B, 4>>>,
}

/// Qualitative grids: attribute translations, attention masks and style sweeps.
pub struct SampleVisualizer<'a, B: Backend> {
    generator: &'a Generator<B>,
    discriminator: &'a Discriminator<B>,
    options: &'a GanOptions,
    settings: VisualizerSettings,
}

impl<'a, B: Backend> SampleVisualizer<'a, B> {
    pub fn new(
        generator: &'a Generator<B>,
        discriminator: &'a Discriminator<B>,
        options: &'a GanOptions,
        settings: VisualizerSettings,
    ) -> Self {
        Self {
            generator,
            discriminator,
            options,
            settings,
        }
    }

    /// Predicted attributes that targets are OR-combined with.
    fn accumulated_labels(&self, real: &Tensor<B, 4>) -> Option<Tensor<B, 2>> {
        if self.settings.no_labelcum {
            return None;
        }
        predict_labels(&self.discriminator.forward(real.clone()))
    }

    fn accumulate(target: Tensor<B, 2>, predicted: Option<&Tensor<B, 2>>) -> Tensor<B, 2> {
        match predicted {
            Some(predicted) => target.add(predicted.clone()).clamp_max(1.0),
            None => target,
        }
    }

    /// The original images followed by one translation per debug target.
    pub fn translate(&self, real: Tensor<B, 4>) -> Translation<B> {
        let device = real.device();
        let batch = real.dims()[0];
        let predicted = self.accumulated_labels(&real);

        let mut columns = vec![real.clone()];
        let mut attention = self
            .generator
            .emits_attention()
            .then(|| vec![real.clone().add_scalar(1.0).div_scalar(2.0)]);
        for target in target_debug_list::<B>(batch, self.generator.c_dim(), &device) {
            let target = Self::accumulate(target, predicted.as_ref());
            let style = self
                .options
                .stochastic
                .then(|| self.generator.random_style(&real));
            let out = self.generator.forward(real.clone(), target, style, false);
            columns.push(out.image);
            if let (Some(masks), Some(mask)) = (attention.as_mut(), out.attention) {
                masks.push(mask);
            }
        }
        Translation { columns, attention }
    }

    /// Hold the sample and its labels fixed and vary only the style code.
    pub fn style_sweep(&self, real: &Tensor<B, 4>, idx: usize, policy: StylePolicy) -> Result<Translation<B>> {
        let device = real.device();
        let repeats = self.settings.style_debug.max(1);
        let sample = real.clone().slice_dim(0, idx..idx + 1).repeat_dim(0, repeats);
        let predicted = self
            .accumulated_labels(real)
            .map(|labels| labels.slice_dim(0, idx..idx + 1).repeat_dim(0, repeats));

        let mut columns = vec![sample.clone()];
        let mut attention = self
            .generator
            .emits_attention()
            .then(|| vec![sample.clone().add_scalar(1.0).div_scalar(2.0)]);
        for target in target_debug_list::<B>(repeats, self.generator.c_dim(), &device) {
            let (labels, style) = self.sweep_condition(real, &sample, target, predicted.as_ref(), idx, policy)?;
            let out = self.generator.forward(sample.clone(), labels, Some(style), false);
            columns.push(out.image);
            if let (Some(masks), Some(mask)) = (attention.as_mut(), out.attention) {
                masks.push(mask);
            }
        }
        Ok(Translation { columns, attention })
    }

    /// Labels and style code fed to the generator for one target of a sweep.
    fn sweep_condition(
        &self,
        real: &Tensor<B, 4>,
        sample: &Tensor<B, 4>,
        target: Tensor<B, 2>,
        predicted: Option<&Tensor<B, 2>>,
        idx: usize,
        policy: StylePolicy,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 3>)> {
        let device = real.device();
        let batch = real.dims()[0];
        let repeats = sample.dims()[0];
        let labels = Self::accumulate(target.clone(), predicted);
        let style = self.generator.random_style(sample);
        Ok(match policy {
            StylePolicy::Random => (labels, style),
            StylePolicy::CopyFirst => (
                labels.mul(label_ramp::<B>(repeats, &device)),
                style.slice_dim(0, 0..1).repeat_dim(0, repeats),
            ),
            StylePolicy::ZeroCode => (labels.mul(label_ramp::<B>(repeats, &device)), style.zeros_like()),
            StylePolicy::LabelScaled => (labels, style.mul(target.unsqueeze_dim::<3>(2))),
            StylePolicy::NeighborWindow => {
                let window: Vec<i64> = neighbor_window(idx, repeats, batch)
                    .into_iter()
                    .map(|i| i as i64)
                    .collect();
                let window = Tensor::<B, 1, Int>::from_data(TensorData::new(window, [repeats]), &device);
                (labels, self.generator.get_style(real.clone().select(0, window))?)
            }
        })
    }

    /// Render the translation grid (for `Random`) and, under Stochastic, the style sweeps.
    ///
    /// During training every sweep overwrites one `*_style` file. Otherwise each
    /// sample gets `<stem:style>/<policy>_<idx>.png`, with attention grids under
    /// `<stem:style_attn>/`. Returns the written paths.
    pub fn save_fake_output(
        &self,
        real: Tensor<B, 4>,
        save_path: &Path,
        policy: StylePolicy,
        training: bool,
        gif: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        if policy == StylePolicy::Random {
            let translation = self.translate(real.clone());
            let attn_path = with_tag(save_path, "fake_attn");
            written.extend(save_translation(&translation, save_path, &attn_path, gif)?);
        }

        if self.options.stochastic {
            let batch = real.dims()[0];
            for idx in 0..batch {
                let (path, attn_path) = if training {
                    (with_tag(save_path, "style"), with_tag(save_path, "style_attn"))
                } else {
                    let file = format!("{}_{:03}.png", policy.index(), idx);
                    (
                        with_tag(&save_path.with_extension(""), "style").join(&file),
                        with_tag(&save_path.with_extension(""), "style_attn").join(&file),
                    )
                };
                let sweep = self.style_sweep(&real, idx, policy)?;
                written.extend(save_translation(&sweep, &path, &attn_path, gif)?);
                if Some(idx) == self.settings.iter_style {
                    break;
                }
            }
        }
        Ok(written)
    }
}

/// Per-repeat label weights `0.2 * j`, shape `[repeats, 1]`.
fn label_ramp<B: Backend>(repeats: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(
        TensorData::new(
            (0..repeats).map(|j| 0.2 * j as f32).collect::<Vec<_>>(),
            [repeats, 1],
        ),
        device,
    )
}

/// Replace `fake` in the file name with `tag`, or append `_tag` to the stem.
fn with_tag(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = if stem.contains("fake") {
        stem.replace("fake", tag)
    } else {
        format!("{stem}_{tag}")
    };
    match path.extension() {
        Some(ext) => path.with_file_name(format!("{stem}.{}", ext.to_string_lossy())),
        None => path.with_file_name(stem),
    }
}

fn save_translation<B: Backend>(
    translation: &Translation<B>,
    path: &Path,
    attn_path: &Path,
    gif: bool,
) -> Result<Vec<PathBuf>> {
    let columns = translation
        .columns
        .iter()
        .map(|column| tensor_to_images(column.clone()))
        .collect::<Result<Vec<_>>>()?;
    save_image(&column_grid(&columns)?, path)?;
    let mut written = vec![path.to_path_buf()];

    if gif {
        let frames = columns
            .iter()
            .skip(1)
            .map(|column| merge_images(column, column.len(), 1))
            .collect::<Result<Vec<_>>>()?;
        let gif_path = path.with_extension("gif");
        write_gif(&frames, &gif_path).with_context(|| format!("failed to write {}", gif_path.display()))?;
        written.push(gif_path);
    }

    if let Some(attention) = &translation.attention {
        let masks = attention
            .iter()
            .map(|column| mask_to_images(column.clone()))
            .collect::<Result<Vec<_>>>()?;
        save_image(&column_grid(&masks)?, attn_path)?;
        written.push(attn_path.to_path_buf());
    }
    Ok(written)
}
