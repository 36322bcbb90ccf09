use burn::prelude::*;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::Rng;

/// Index permutation used to draw target labels from the batch's own labels.
///
/// A single sample keeps its label since no other label exists to swap with.
pub fn target_permutation(batch: usize, rng: &mut impl Rng) -> Vec<usize> {
    match batch {
        0 => Vec::new(),
        1 => vec![0],
        2 => vec![1, 0],
        _ => {
            let mut indices: Vec<usize> = (0..batch).collect();
            indices.shuffle(rng);
            indices
        }
    }
}

/// Reorder the rows of `labels` by `permutation`, detached from any graph.
pub fn permute_rows<B: Backend>(labels: Tensor<B, 2>, permutation: &[usize]) -> Tensor<B, 2> {
    if permutation.is_empty() {
        return labels.detach();
    }
    let indices: Vec<i64> = permutation.iter().map(|&idx| idx as i64).collect();
    let indices = Tensor::<B, 1, Int>::from_data(
        TensorData::new(indices, [permutation.len()]),
        &labels.device(),
    );
    labels.select(0, indices).detach()
}

/// Both rates decay by 10x every `period` completed epochs, without floor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LrSchedule {
    pub g_lr: f64,
    pub d_lr: f64,
    period: usize,
}

impl LrSchedule {
    pub fn new(g_lr: f64, d_lr: f64, period: usize) -> Self {
        Self { g_lr, d_lr, period }
    }

    /// Apply the end-of-epoch rule for epoch `epoch` (0-based); returns true on decay.
    pub fn end_epoch(&mut self, epoch: usize) -> bool {
        if self.period == 0 || (epoch + 1) % self.period != 0 {
            return false;
        }
        self.g_lr /= 10.0;
        self.d_lr /= 10.0;
        true
    }

    /// Fast-forward through every epoch strictly before `start`.
    pub fn replay(&mut self, start: usize) {
        for epoch in 0..start {
            if self.end_epoch(epoch) {
                tracing::info!("decay learning rate to g_lr: {}, d_lr: {}", self.g_lr, self.d_lr);
            }
        }
    }
}

/// Wall-clock time as `H:MM:SS`.
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Log/sample trigger: every `period` iterations, the last one, and the first of the run.
pub fn should_emit(period: usize, iteration: usize, epoch: usize, last: usize) -> bool {
    let step = iteration + 1;
    (period > 0 && step % period == 0) || step == last || (iteration == 0 && epoch == 0)
}

/// Half ranges for the discriminator and generator; the whole batch twice otherwise.
pub fn split_batch(batch: usize, relativistic: bool) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    if relativistic && batch >= 2 {
        let half = batch / 2;
        (0..half, half..batch)
    } else {
        (0..batch, 0..batch)
    }
}
