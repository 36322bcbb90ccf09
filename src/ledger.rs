use crate::error::GanError;
use burn::prelude::*;
use std::collections::BTreeMap;

/// Named loss scalars: the latest value of each term plus its per-epoch history.
///
/// Keys are created on first write; a fresh ledger is used for every epoch.
#[derive(Debug, Default, Clone)]
pub struct LossLedger {
    current: BTreeMap<String, f64>,
    history: BTreeMap<String, Vec<f64>>,
}

impl LossLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous iteration's values; the epoch history is kept.
    pub fn begin_iteration(&mut self) {
        self.current.clear();
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.current.insert(name.to_string(), value);
        self.history.entry(name.to_string()).or_default().push(value);
    }

    pub fn current(&self) -> &BTreeMap<String, f64> {
        &self.current
    }

    pub fn history(&self, name: &str) -> Option<&[f64]> {
        self.history.get(name).map(Vec::as_slice)
    }

    /// Every key written so far this epoch.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.history.keys().map(String::as_str)
    }

    pub fn epoch_means(&self) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (name.clone(), values.iter().sum::<f64>() / values.len() as f64))
            .collect()
    }

    /// Compact `name: value` line of the current iteration.
    pub fn summary(&self) -> String {
        format_values(&self.current)
    }

    /// Compact `name: value` line of the epoch means.
    pub fn epoch_summary(&self) -> String {
        format_values(&self.epoch_means())
    }
}

fn format_values(values: &BTreeMap<String, f64>) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name}: {value:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read a scalar loss, reject non-finite values and record it under `name`.
pub fn record_scalar<B: Backend>(
    ledger: &mut LossLedger,
    name: &str,
    loss: &Tensor<B, 1>,
) -> Result<f64, GanError> {
    let value = loss.clone().into_scalar().elem::<f64>();
    if !value.is_finite() {
        return Err(GanError::NonFiniteLoss {
            name: name.to_string(),
            value,
        });
    }
    ledger.record(name, value);
    Ok(value)
}
