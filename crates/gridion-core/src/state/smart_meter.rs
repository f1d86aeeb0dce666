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

use anyhow::Result;
use serde_json::{Value, json};

use gridion_types::time::TimeSlot;

use super::{ConsumptionState, ProductionState, StateInterface};

/// Ledger for smart meter assets, which can report consumption or
/// production per slot but never both at once.
#[derive(Debug, Default, Clone)]
pub struct SmartMeterState {
    consumption: ConsumptionState,
    production: ProductionState,
}

impl SmartMeterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumption(&self) -> &ConsumptionState {
        &self.consumption
    }

    pub fn consumption_mut(&mut self) -> &mut ConsumptionState {
        &mut self.consumption
    }

    pub fn production(&self) -> &ProductionState {
        &self.production
    }

    pub fn production_mut(&mut self) -> &mut ProductionState {
        &mut self.production
    }

    /// Net energy at the slot in kWh: negative for production, positive for
    /// consumption. Reporting both sides at once is a simulation bug.
    pub fn get_energy_at_market_slot(&self, time_slot: TimeSlot) -> f64 {
        let produced_kwh = -self
            .production
            .get_energy_production_forecast_kwh(time_slot)
            .abs();
        let consumed_kwh = self.consumption.get_desired_energy_wh(time_slot) / 1000.0;
        assert!(
            produced_kwh == 0.0 || consumed_kwh == 0.0,
            "smart meter reported both produced and consumed energy at slot {time_slot}"
        );
        if produced_kwh != 0.0 { produced_kwh } else { consumed_kwh }
    }
}

impl StateInterface for SmartMeterState {
    fn get_state(&self) -> Value {
        json!({
            "consumption": self.consumption.get_state(),
            "production": self.production.get_state(),
        })
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        self.consumption
            .restore_state(super::require_field(state, "consumption")?)?;
        self.production
            .restore_state(super::require_field(state, "production")?)?;
        Ok(())
    }

    fn delete_past_state_values(&mut self, horizon: TimeSlot) {
        self.consumption.delete_past_state_values(horizon);
        self.production.delete_past_state_values(horizon);
    }

    fn get_results_dict(&self, time_slot: TimeSlot) -> Value {
        json!({
            "consumption": self.consumption.get_results_dict(time_slot),
            "production": self.production.get_results_dict(time_slot),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn slot(hour: u32) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn net_energy_is_signed_by_direction() {
        let mut state = SmartMeterState::new();
        state.consumption_mut().set_desired_energy(500.0, slot(8), false);
        state.production_mut().set_available_energy(1.2, slot(13), false);

        assert!((state.get_energy_at_market_slot(slot(8)) - 0.5).abs() < 1e-9);
        assert!((state.get_energy_at_market_slot(slot(13)) + 1.2).abs() < 1e-9);
        assert_eq!(state.get_energy_at_market_slot(slot(20)), 0.0);
    }

    #[test]
    #[should_panic(expected = "both produced and consumed")]
    fn both_directions_in_one_slot_assert() {
        let mut state = SmartMeterState::new();
        state.consumption_mut().set_desired_energy(500.0, slot(8), false);
        state.production_mut().set_available_energy(1.2, slot(8), false);
        state.get_energy_at_market_slot(slot(8));
    }

    #[test]
    fn state_round_trips() {
        let mut state = SmartMeterState::new();
        state.consumption_mut().set_desired_energy(500.0, slot(8), false);
        state.production_mut().set_available_energy(1.2, slot(13), false);

        let snapshot = state.get_state();
        let mut restored = SmartMeterState::new();
        restored.restore_state(&snapshot).unwrap();
        assert_eq!(restored.get_state(), snapshot);
    }
}
