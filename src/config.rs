//! Run-scoped tuning parameters. All fields are typed and defaulted; callers
//! pass overrides through one flat string map at a single boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Thresholds and window boundaries for one analysis or aggregation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Expected fraction of the population that is anomalous.
    pub contamination: f64,
    /// Hour at which the dorm/network night window opens.
    pub night_start_hour: u32,
    /// Hour at which the campus-gate night window opens (earlier than dorms).
    pub gate_night_start_hour: u32,
    /// Monthly canteen amount below which a month counts as low consumption.
    pub low_consumption_floor: f64,
    /// Positivity axis cutoffs.
    pub positivity_high: f64,
    pub positivity_low: f64,
    /// Intensity axis cutoffs (cohort-relative factors).
    pub intensity_high: f64,
    pub intensity_low: f64,
    /// Radicalism axis cutoffs.
    pub radicalism_high: f64,
    pub radicalism_low: f64,
    /// Base monthly amount for distress tier boundaries.
    pub poverty_base_threshold: f64,
    /// Monthly consumption slope below which the trend is flagged.
    pub poverty_trend_threshold: f64,
    /// Daily-aggregate hour windows, fixed per deployment.
    pub windows: AggregationWindows,
}

/// Night / late-night hour windows used by the daily aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationWindows {
    pub night_start: u32,
    pub night_end: u32,
    pub late_night_start: u32,
    pub late_night_end: u32,
}

impl Default for AggregationWindows {
    fn default() -> Self {
        Self {
            night_start: 22,
            night_end: 23,
            late_night_start: 0,
            late_night_end: 5,
        }
    }
}

impl AggregationWindows {
    pub fn is_night(&self, hour: u32) -> bool {
        hour >= self.night_start && hour <= self.night_end
    }

    pub fn is_late_night(&self, hour: u32) -> bool {
        hour >= self.late_night_start && hour <= self.late_night_end
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            contamination: 0.15,
            night_start_hour: 23,
            gate_night_start_hour: 21,
            low_consumption_floor: 300.0,
            positivity_high: 4.0,
            positivity_low: -2.0,
            intensity_high: 1.2,
            intensity_low: 0.8,
            radicalism_high: 4.0,
            radicalism_low: 1.5,
            poverty_base_threshold: 300.0,
            poverty_trend_threshold: -50.0,
            windows: AggregationWindows::default(),
        }
    }
}

impl AnalysisConfig {
    /// Apply a flat map of named overrides. Unknown keys are ignored; values
    /// that fail to parse keep the field's default and log a warning. This is
    /// the only place raw parameter strings are interpreted.
    pub fn apply_overrides(mut self, params: &HashMap<String, String>) -> Self {
        for (key, raw) in params {
            match key.as_str() {
                "contamination" => Self::set_f64(&mut self.contamination, key, raw),
                "night_start" => Self::set_u32(&mut self.night_start_hour, key, raw),
                "gate_night_start" => Self::set_u32(&mut self.gate_night_start_hour, key, raw),
                "low_consumption_floor" => Self::set_f64(&mut self.low_consumption_floor, key, raw),
                "positivity_high" => Self::set_f64(&mut self.positivity_high, key, raw),
                "positivity_low" => Self::set_f64(&mut self.positivity_low, key, raw),
                "intensity_high" => Self::set_f64(&mut self.intensity_high, key, raw),
                "intensity_low" => Self::set_f64(&mut self.intensity_low, key, raw),
                "radicalism_high" => Self::set_f64(&mut self.radicalism_high, key, raw),
                "radicalism_low" => Self::set_f64(&mut self.radicalism_low, key, raw),
                "poverty_threshold" => Self::set_f64(&mut self.poverty_base_threshold, key, raw),
                "trend_threshold" => Self::set_f64(&mut self.poverty_trend_threshold, key, raw),
                _ => {}
            }
        }
        self
    }

    fn set_f64(slot: &mut f64, key: &str, raw: &str) {
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => *slot = v,
            _ => warn!(key, value = raw, "ignoring unparsable override"),
        }
    }

    fn set_u32(slot: &mut u32, key: &str, raw: &str) {
        match raw.trim().parse::<u32>() {
            Ok(v) if v < 24 => *slot = v,
            _ => warn!(key, value = raw, "ignoring unparsable override"),
        }
    }
}
