// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Energy ledgers for the asset strategies. Each asset kind keeps its own
//! state type: consumption tracks a per-slot requirement that shrinks as
//! energy is bought, production tracks a per-slot availability that shrinks
//! as energy is sold, and storage tracks a single charge level shared by all
//! open slots. Ledger quantities must never go negative beyond the floating
//! point tolerance; a violation is a simulation bug and asserts fatally
//! instead of returning an error.

mod consumption;
mod production;
mod smart_meter;
mod storage;

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};

use gridion_types::time::{TimeSlot, format_time_slot, parse_time_slot};

pub use consumption::ConsumptionState;
pub use production::ProductionState;
pub use smart_meter::SmartMeterState;
pub use storage::{EnergyOrigin, StorageState};

/// Snapshot and pruning contract shared by every ledger.
///
/// `restore_state(get_state())` must be an identity on the serialized shape,
/// including the formatting of the time-slot keys.
pub trait StateInterface {
    /// Serialize the ledger for a pause/resume snapshot.
    fn get_state(&self) -> Value;

    /// Apply a snapshot previously produced by [`StateInterface::get_state`].
    fn restore_state(&mut self, state: &Value) -> Result<()>;

    /// Drop per-slot entries older than `horizon`. The caller derives the
    /// horizon from the market retention settings, so settlement-enabled
    /// runs keep enough history for late settlement trades.
    fn delete_past_state_values(&mut self, horizon: TimeSlot);

    /// Reduced view of the ledger for per-slot result reporting.
    fn get_results_dict(&self, time_slot: TimeSlot) -> Value;
}

/// Serialize a slot-keyed map with ISO-like string keys.
pub(crate) fn slot_map_to_json(map: &BTreeMap<TimeSlot, f64>) -> Value {
    let mut out = Map::new();
    for (slot, value) in map {
        out.insert(format_time_slot(*slot), json!(value));
    }
    Value::Object(out)
}

/// Merge a serialized slot-keyed map back into `map`.
pub(crate) fn json_into_slot_map(value: &Value, map: &mut BTreeMap<TimeSlot, f64>) -> Result<()> {
    let Some(entries) = value.as_object() else {
        bail!("expected an object of time-slot keys, got {value}");
    };
    for (key, entry) in entries {
        let slot = parse_time_slot(key)?;
        let number = entry
            .as_f64()
            .with_context(|| format!("non-numeric ledger value for {key}"))?;
        map.insert(slot, number);
    }
    Ok(())
}

pub(crate) fn require_field<'v>(state: &'v Value, field: &str) -> Result<&'v Value> {
    state
        .get(field)
        .with_context(|| format!("snapshot is missing the `{field}` field"))
}

/// Shared measurement bookkeeping for consuming and producing assets.
///
/// Once an actual measurement for a slot arrives, the deviation from the
/// traded forecast decides the settlement side: a positive deviation has to
/// be bought back (settlement bid), a negative one can be re-sold
/// (settlement offer).
#[derive(Debug, Default, Clone)]
pub struct ProsumptionState {
    energy_measurement_kwh: BTreeMap<TimeSlot, f64>,
    forecast_measurement_deviation_kwh: BTreeMap<TimeSlot, f64>,
    unsettled_deviation_kwh: BTreeMap<TimeSlot, f64>,
}

impl ProsumptionState {
    /// Record the metered energy for `time_slot` together with its signed
    /// deviation from the traded amount. A positive deviation has to be
    /// bought back in settlement, a negative one can be re-sold; consuming
    /// and producing assets therefore compute the sign oppositely.
    pub fn set_energy_measurement_kwh(
        &mut self,
        measured_kwh: f64,
        deviation_kwh: f64,
        time_slot: TimeSlot,
    ) {
        self.energy_measurement_kwh.insert(time_slot, measured_kwh);
        self.forecast_measurement_deviation_kwh
            .insert(time_slot, deviation_kwh);
        self.unsettled_deviation_kwh
            .insert(time_slot, deviation_kwh.abs());
    }

    pub fn get_energy_measurement_kwh(&self, time_slot: TimeSlot) -> Option<f64> {
        self.energy_measurement_kwh.get(&time_slot).copied()
    }

    pub fn get_forecast_measurement_deviation_kwh(&self, time_slot: TimeSlot) -> Option<f64> {
        self.forecast_measurement_deviation_kwh
            .get(&time_slot)
            .copied()
    }

    pub fn can_post_settlement_bid(&self, time_slot: TimeSlot) -> bool {
        self.forecast_measurement_deviation_kwh
            .get(&time_slot)
            .is_some_and(|deviation| *deviation > 0.0)
    }

    pub fn can_post_settlement_offer(&self, time_slot: TimeSlot) -> bool {
        self.forecast_measurement_deviation_kwh
            .get(&time_slot)
            .is_some_and(|deviation| *deviation < 0.0)
    }

    pub fn get_unsettled_deviation_kwh(&self, time_slot: TimeSlot) -> Option<f64> {
        self.unsettled_deviation_kwh.get(&time_slot).copied()
    }

    /// Unsettled deviation carrying the sign of the original forecast error.
    pub fn get_signed_unsettled_deviation_kwh(&self, time_slot: TimeSlot) -> Option<f64> {
        let unsettled = self.unsettled_deviation_kwh.get(&time_slot)?;
        let deviation = self.forecast_measurement_deviation_kwh.get(&time_slot)?;
        if *unsettled == 0.0 || *deviation == 0.0 {
            return None;
        }
        Some(unsettled.copysign(*deviation))
    }

    /// Shrink the unsettled deviation after a settlement trade.
    pub fn decrement_unsettled_deviation(&mut self, settled_energy_kwh: f64, time_slot: TimeSlot) {
        let remaining = self
            .unsettled_deviation_kwh
            .entry(time_slot)
            .or_insert(0.0);
        *remaining -= settled_energy_kwh;
        assert!(
            *remaining >= -gridion_types::FLOATING_POINT_TOLERANCE,
            "unsettled energy deviation fell below zero ({remaining})"
        );
    }

    pub(crate) fn get_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        state.insert(
            "energy_measurement_kWh".into(),
            slot_map_to_json(&self.energy_measurement_kwh),
        );
        state.insert(
            "forecast_measurement_deviation_kWh".into(),
            slot_map_to_json(&self.forecast_measurement_deviation_kwh),
        );
        state.insert(
            "unsettled_deviation_kWh".into(),
            slot_map_to_json(&self.unsettled_deviation_kwh),
        );
        state
    }

    pub(crate) fn restore_state(&mut self, state: &Value) -> Result<()> {
        json_into_slot_map(
            require_field(state, "energy_measurement_kWh")?,
            &mut self.energy_measurement_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "forecast_measurement_deviation_kWh")?,
            &mut self.forecast_measurement_deviation_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "unsettled_deviation_kWh")?,
            &mut self.unsettled_deviation_kwh,
        )?;
        Ok(())
    }

    pub(crate) fn delete_past_state_values(&mut self, horizon: TimeSlot) {
        self.energy_measurement_kwh.retain(|slot, _| *slot >= horizon);
        self.forecast_measurement_deviation_kwh
            .retain(|slot, _| *slot >= horizon);
        self.unsettled_deviation_kwh.retain(|slot, _| *slot >= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn slot(hour: u32) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn measurement_deviation_decides_settlement_side() {
        let mut state = ProsumptionState::default();
        state.set_energy_measurement_kwh(1.5, 0.5, slot(8));
        assert!(state.can_post_settlement_bid(slot(8)));
        assert!(!state.can_post_settlement_offer(slot(8)));
        assert_eq!(state.get_unsettled_deviation_kwh(slot(8)), Some(0.5));
        assert_eq!(state.get_signed_unsettled_deviation_kwh(slot(8)), Some(0.5));

        state.set_energy_measurement_kwh(0.2, -0.8, slot(9));
        assert!(state.can_post_settlement_offer(slot(9)));
        let signed = state.get_signed_unsettled_deviation_kwh(slot(9)).unwrap();
        assert!((signed + 0.8).abs() < 1e-12);
    }

    #[test]
    fn unsettled_deviation_shrinks_with_settlement_trades() {
        let mut state = ProsumptionState::default();
        state.set_energy_measurement_kwh(2.0, 1.0, slot(10));
        state.decrement_unsettled_deviation(0.4, slot(10));
        assert!((state.get_unsettled_deviation_kwh(slot(10)).unwrap() - 0.6).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "fell below zero")]
    fn over_settling_asserts() {
        let mut state = ProsumptionState::default();
        state.set_energy_measurement_kwh(2.0, 1.0, slot(10));
        state.decrement_unsettled_deviation(1.5, slot(10));
    }

    #[test]
    fn slot_maps_round_trip_through_json() {
        let mut map = BTreeMap::new();
        map.insert(slot(8), 1.25);
        map.insert(slot(8) + Duration::minutes(15), 0.0);
        let encoded = slot_map_to_json(&map);
        let mut decoded = BTreeMap::new();
        json_into_slot_map(&encoded, &mut decoded).unwrap();
        assert_eq!(map, decoded);
        assert_eq!(slot_map_to_json(&decoded), encoded);
    }

    #[test]
    fn pruning_respects_the_horizon() {
        let mut state = ProsumptionState::default();
        state.set_energy_measurement_kwh(1.0, 1.0, slot(8));
        state.set_energy_measurement_kwh(1.0, 1.0, slot(12));
        state.delete_past_state_values(slot(10));
        assert!(state.get_energy_measurement_kwh(slot(8)).is_none());
        assert!(state.get_energy_measurement_kwh(slot(12)).is_some());
    }
}
