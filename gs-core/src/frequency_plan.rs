//! Read-only frequency plan lookup: plan ID to channels, duty-cycle bands,
//! dwell-time limits and the data-rate index table.
//!
//! Channel/data-rate shapes follow the familiar `ChannelDetails`/
//! `Modulation::{Lora,Fsk}` split, generalized from a per-region `Band`
//! trait to a data-driven table, since this server needs to hold many plans
//! side by side rather than monomorphize one region per build.

use crate::modulation::Modulation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub frequency_hz: u32,
    pub min_data_rate: u8,
    pub max_data_rate: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RxWindowParams {
    pub data_rate: u8,
    pub frequency_hz: u32,
}

/// A regulatory sub-band: a contiguous frequency range with its own duty
/// cycle budget, e.g. the EU868 1% bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubBand {
    pub lo_hz: u32,
    pub hi_hz: u32,
    /// Fraction of time, trailing-window, permitted to transmit. 0.01 = 1%.
    pub duty_cycle_fraction: f64,
}

impl SubBand {
    pub fn contains(&self, freq_hz: u32) -> bool {
        freq_hz >= self.lo_hz && freq_hz <= self.hi_hz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyPlan {
    pub id: String,
    pub uplink_channels: Vec<Channel>,
    pub downlink_channels: Vec<Channel>,
    pub rx2_default: RxWindowParams,
    pub dwell_time_uplink_ms: u32,
    pub dwell_time_downlink_ms: u32,
    pub sub_bands: Vec<SubBand>,
    pub data_rate_table: Vec<Modulation>,
    pub max_eirp_dbm: f32,
}

impl FrequencyPlan {
    pub fn modulation_for(&self, data_rate: u8) -> Option<Modulation> {
        self.data_rate_table.get(data_rate as usize).copied()
    }

    pub fn sub_band_for(&self, freq_hz: u32) -> Option<&SubBand> {
        self.sub_bands.iter().find(|b| b.contains(freq_hz))
    }

    pub fn duty_cycle_limit(&self, freq_hz: u32) -> Option<f64> {
        self.sub_band_for(freq_hz).map(|b| b.duty_cycle_fraction)
    }

    pub fn dwell_limit(&self, direction: Direction) -> Duration {
        let ms = match direction {
            Direction::Uplink => self.dwell_time_uplink_ms,
            Direction::Downlink => self.dwell_time_downlink_ms,
        };
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrequencyPlanError {
    #[error("unknown frequency plan id: {0}")]
    NotFound(String),
}

/// Immutable, lock-free lookup store. Loaded once at process start and held
/// behind an `Arc` by callers — no interior mutability is needed since plans
/// never change after load.
#[derive(Debug, Clone)]
pub struct FrequencyPlanStore {
    plans: HashMap<String, FrequencyPlan>,
}

impl FrequencyPlanStore {
    pub fn new(plans: Vec<FrequencyPlan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&FrequencyPlan, FrequencyPlanError> {
        self.plans.get(id).ok_or_else(|| FrequencyPlanError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plans.contains_key(id)
    }

    /// Built-in bank of well-known plans, standing in for the external
    /// frequency-plan store this crate is a read-only client of.
    pub fn with_defaults() -> Self {
        Self::new(vec![eu_863_870(), us_902_928()])
    }
}

pub const EU_863_870: &str = "EU_863_870";
pub const US_902_928: &str = "US_902_928";

pub fn eu_863_870() -> FrequencyPlan {
    let data_rate_table = vec![
        Modulation::Lora { spreading_factor: 12, bandwidth_hz: 125_000 }, // DR0
        Modulation::Lora { spreading_factor: 11, bandwidth_hz: 125_000 }, // DR1
        Modulation::Lora { spreading_factor: 10, bandwidth_hz: 125_000 }, // DR2
        Modulation::Lora { spreading_factor: 9, bandwidth_hz: 125_000 },  // DR3
        Modulation::Lora { spreading_factor: 8, bandwidth_hz: 125_000 },  // DR4
        Modulation::Lora { spreading_factor: 7, bandwidth_hz: 125_000 },  // DR5
        Modulation::Lora { spreading_factor: 7, bandwidth_hz: 250_000 },  // DR6
        Modulation::Fsk { bitrate_bps: 50_000 },                         // DR7
    ];
    FrequencyPlan {
        id: EU_863_870.to_string(),
        uplink_channels: vec![
            Channel { frequency_hz: 868_100_000, min_data_rate: 0, max_data_rate: 5 },
            Channel { frequency_hz: 868_300_000, min_data_rate: 0, max_data_rate: 5 },
            Channel { frequency_hz: 868_500_000, min_data_rate: 0, max_data_rate: 5 },
        ],
        downlink_channels: vec![
            Channel { frequency_hz: 868_100_000, min_data_rate: 0, max_data_rate: 5 },
            Channel { frequency_hz: 868_300_000, min_data_rate: 0, max_data_rate: 5 },
            Channel { frequency_hz: 868_500_000, min_data_rate: 0, max_data_rate: 5 },
        ],
        rx2_default: RxWindowParams { data_rate: 0, frequency_hz: 869_525_000 },
        dwell_time_uplink_ms: 0,
        dwell_time_downlink_ms: 0,
        sub_bands: vec![
            SubBand { lo_hz: 863_000_000, hi_hz: 868_000_000, duty_cycle_fraction: 0.01 },
            SubBand { lo_hz: 868_000_000, hi_hz: 868_600_000, duty_cycle_fraction: 0.01 },
            SubBand { lo_hz: 868_700_000, hi_hz: 869_200_000, duty_cycle_fraction: 0.001 },
            SubBand { lo_hz: 869_400_000, hi_hz: 869_650_000, duty_cycle_fraction: 0.1 },
            SubBand { lo_hz: 869_700_000, hi_hz: 870_000_000, duty_cycle_fraction: 0.01 },
        ],
        data_rate_table,
        max_eirp_dbm: 16.0,
    }
}

pub fn us_902_928() -> FrequencyPlan {
    let data_rate_table = vec![
        Modulation::Lora { spreading_factor: 10, bandwidth_hz: 125_000 }, // DR0
        Modulation::Lora { spreading_factor: 9, bandwidth_hz: 125_000 },  // DR1
        Modulation::Lora { spreading_factor: 8, bandwidth_hz: 125_000 },  // DR2
        Modulation::Lora { spreading_factor: 7, bandwidth_hz: 125_000 },  // DR3
        Modulation::Lora { spreading_factor: 8, bandwidth_hz: 500_000 },  // DR4
    ];
    FrequencyPlan {
        id: US_902_928.to_string(),
        uplink_channels: (0..8)
            .map(|i| Channel { frequency_hz: 902_300_000 + i * 200_000, min_data_rate: 0, max_data_rate: 3 })
            .collect(),
        downlink_channels: (0..8)
            .map(|i| Channel { frequency_hz: 923_300_000 + i * 600_000, min_data_rate: 8, max_data_rate: 13 })
            .collect(),
        rx2_default: RxWindowParams { data_rate: 8, frequency_hz: 923_300_000 },
        dwell_time_uplink_ms: 400,
        dwell_time_downlink_ms: 400,
        // US915 has no duty-cycle restriction; dutyless is modeled as 100%.
        sub_bands: vec![SubBand { lo_hz: 902_000_000, hi_hz: 928_000_000, duty_cycle_fraction: 1.0 }],
        data_rate_table,
        max_eirp_dbm: 30.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_plan() {
        let store = FrequencyPlanStore::with_defaults();
        let plan = store.get(EU_863_870).unwrap();
        assert_eq!(plan.uplink_channels.len(), 3);
    }

    #[test]
    fn unknown_plan_is_not_found() {
        let store = FrequencyPlanStore::with_defaults();
        assert!(store.get("nope").is_err());
    }

    #[test]
    fn sub_band_duty_cycle_for_g3_band() {
        let plan = eu_863_870();
        let limit = plan.duty_cycle_limit(869_525_000).unwrap();
        assert!((limit - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn frequency_outside_any_sub_band_has_no_limit() {
        let plan = eu_863_870();
        assert!(plan.duty_cycle_limit(900_000_000).is_none());
    }
}
