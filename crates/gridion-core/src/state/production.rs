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

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};

use gridion_types::FLOATING_POINT_TOLERANCE;
use gridion_types::time::TimeSlot;

use super::{ProsumptionState, StateInterface, json_into_slot_map, require_field, slot_map_to_json};

/// Ledger for producing assets, mirroring [`super::ConsumptionState`]:
/// `energy_production_forecast_kwh` is the immutable forecast and
/// `available_energy_kwh` shrinks as energy is sold. Kept in kWh.
#[derive(Debug, Default, Clone)]
pub struct ProductionState {
    prosumption: ProsumptionState,
    available_energy_kwh: BTreeMap<TimeSlot, f64>,
    energy_production_forecast_kwh: BTreeMap<TimeSlot, f64>,
}

impl ProductionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prosumption(&self) -> &ProsumptionState {
        &self.prosumption
    }

    pub fn prosumption_mut(&mut self) -> &mut ProsumptionState {
        &mut self.prosumption
    }

    /// Set the production forecast and the available energy for a slot.
    /// Write-once unless `overwrite`, so partially-sold slots survive a
    /// repeated market cycle.
    pub fn set_available_energy(&mut self, energy_kwh: f64, time_slot: TimeSlot, overwrite: bool) {
        if !overwrite && self.energy_production_forecast_kwh.contains_key(&time_slot) {
            return;
        }
        assert!(energy_kwh >= 0.0, "negative production forecast ({energy_kwh})");
        self.energy_production_forecast_kwh.insert(time_slot, energy_kwh);
        self.available_energy_kwh.insert(time_slot, energy_kwh);
    }

    pub fn get_available_energy_kwh(&self, time_slot: TimeSlot) -> f64 {
        let available = self
            .available_energy_kwh
            .get(&time_slot)
            .copied()
            .unwrap_or(0.0);
        assert!(available >= -FLOATING_POINT_TOLERANCE);
        available
    }

    pub fn get_energy_production_forecast_kwh(&self, time_slot: TimeSlot) -> f64 {
        self.energy_production_forecast_kwh
            .get(&time_slot)
            .copied()
            .unwrap_or(0.0)
    }

    /// Shrink the available energy after a sale. Selling more than the slot
    /// has is a simulation bug and asserts.
    pub fn decrement_available_energy(
        &mut self,
        sold_energy_kwh: f64,
        time_slot: TimeSlot,
        owner_name: &str,
    ) {
        let available = self.available_energy_kwh.entry(time_slot).or_insert(0.0);
        *available -= sold_energy_kwh;
        assert!(
            *available >= -FLOATING_POINT_TOLERANCE,
            "available energy for asset {owner_name} fell below zero ({available})"
        );
    }
}

impl StateInterface for ProductionState {
    fn get_state(&self) -> Value {
        let mut state = self.prosumption.get_state();
        state.insert(
            "available_energy_kWh".into(),
            slot_map_to_json(&self.available_energy_kwh),
        );
        state.insert(
            "energy_production_forecast_kWh".into(),
            slot_map_to_json(&self.energy_production_forecast_kwh),
        );
        Value::Object(state)
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        self.prosumption.restore_state(state)?;
        json_into_slot_map(
            require_field(state, "available_energy_kWh")?,
            &mut self.available_energy_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "energy_production_forecast_kWh")?,
            &mut self.energy_production_forecast_kwh,
        )?;
        Ok(())
    }

    fn delete_past_state_values(&mut self, horizon: TimeSlot) {
        self.prosumption.delete_past_state_values(horizon);
        self.available_energy_kwh.retain(|slot, _| *slot >= horizon);
        self.energy_production_forecast_kwh
            .retain(|slot, _| *slot >= horizon);
    }

    fn get_results_dict(&self, time_slot: TimeSlot) -> Value {
        json!({
            "available_energy_kWh": self.get_available_energy_kwh(time_slot),
            "energy_production_forecast_kWh":
                self.get_energy_production_forecast_kwh(time_slot),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn slot(hour: u32, minute: u32) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn selling_shrinks_availability_but_not_the_forecast() {
        let mut state = ProductionState::new();
        state.set_available_energy(3.2, slot(12, 0), false);
        state.decrement_available_energy(1.0, slot(12, 0), "pv");
        assert!((state.get_available_energy_kwh(slot(12, 0)) - 2.2).abs() < 1e-9);
        assert!((state.get_energy_production_forecast_kwh(slot(12, 0)) - 3.2).abs() < 1e-9);
    }

    #[test]
    fn forecast_is_write_once_without_overwrite() {
        let mut state = ProductionState::new();
        state.set_available_energy(3.2, slot(12, 0), false);
        state.decrement_available_energy(1.0, slot(12, 0), "pv");
        state.set_available_energy(3.2, slot(12, 0), false);
        assert!((state.get_available_energy_kwh(slot(12, 0)) - 2.2).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "fell below zero")]
    fn over_selling_asserts() {
        let mut state = ProductionState::new();
        state.set_available_energy(1.0, slot(12, 0), false);
        state.decrement_available_energy(1.5, slot(12, 0), "pv");
    }

    #[test]
    fn state_round_trips() {
        let mut state = ProductionState::new();
        state.set_available_energy(3.2, slot(12, 0), false);
        state.set_available_energy(2.8, slot(12, 15), false);
        state.decrement_available_energy(0.5, slot(12, 0), "pv");

        let snapshot = state.get_state();
        let mut restored = ProductionState::new();
        restored.restore_state(&snapshot).unwrap();
        assert_eq!(restored.get_state(), snapshot);
    }
}
