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

use anyhow::{Context, Result};
use serde_json::{Value, json};

use gridion_types::FLOATING_POINT_TOLERANCE;
use gridion_types::time::TimeSlot;

use super::{ProsumptionState, StateInterface, json_into_slot_map, require_field, slot_map_to_json};

/// Ledger for consuming assets.
///
/// `desired_energy_wh` is the forecast demand per slot and stays immutable
/// once set; `energy_requirement_wh` starts equal to it and shrinks as
/// energy is bought. Both are kept in Wh.
#[derive(Debug, Default, Clone)]
pub struct ConsumptionState {
    prosumption: ProsumptionState,
    desired_energy_wh: BTreeMap<TimeSlot, f64>,
    energy_requirement_wh: BTreeMap<TimeSlot, f64>,
    total_energy_demanded_wh: f64,
}

impl ConsumptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prosumption(&self) -> &ProsumptionState {
        &self.prosumption
    }

    pub fn prosumption_mut(&mut self) -> &mut ProsumptionState {
        &mut self.prosumption
    }

    /// Set both the desired energy and the open requirement for a slot.
    /// Without `overwrite` the call is a no-op for slots already tracked, so
    /// a repeated market cycle cannot reset a partially-bought slot.
    pub fn set_desired_energy(&mut self, energy_wh: f64, time_slot: TimeSlot, overwrite: bool) {
        if !overwrite && self.energy_requirement_wh.contains_key(&time_slot) {
            return;
        }
        self.energy_requirement_wh.insert(time_slot, energy_wh);
        self.desired_energy_wh.insert(time_slot, energy_wh);
    }

    pub fn get_energy_requirement_wh(&self, time_slot: TimeSlot) -> f64 {
        self.energy_requirement_wh
            .get(&time_slot)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn get_desired_energy_wh(&self, time_slot: TimeSlot) -> f64 {
        self.desired_energy_wh.get(&time_slot).copied().unwrap_or(0.0)
    }

    /// Accumulate the lifetime demand counter from the slot's forecast.
    pub fn update_total_demanded_energy(&mut self, time_slot: TimeSlot) {
        self.total_energy_demanded_wh += self.get_desired_energy_wh(time_slot);
    }

    pub fn total_energy_demanded_wh(&self) -> f64 {
        self.total_energy_demanded_wh
    }

    pub fn can_buy_more_energy(&self, time_slot: TimeSlot) -> bool {
        self.energy_requirement_wh
            .get(&time_slot)
            .is_some_and(|required| *required > FLOATING_POINT_TOLERANCE)
    }

    /// Cap an offered amount to the slot's remaining requirement.
    pub fn calculate_energy_to_accept(&self, offer_energy_wh: f64, time_slot: TimeSlot) -> f64 {
        offer_energy_wh.min(self.get_energy_requirement_wh(time_slot))
    }

    /// Shrink the requirement after a purchase. Buying more than the slot
    /// requires is a simulation bug and asserts.
    pub fn decrement_energy_requirement(
        &mut self,
        purchased_energy_wh: f64,
        time_slot: TimeSlot,
        owner_name: &str,
    ) {
        let required = self.energy_requirement_wh.entry(time_slot).or_insert(0.0);
        *required -= purchased_energy_wh;
        assert!(
            *required >= -FLOATING_POINT_TOLERANCE,
            "energy requirement for asset {owner_name} fell below zero ({required})"
        );
    }
}

impl StateInterface for ConsumptionState {
    fn get_state(&self) -> Value {
        let mut state = self.prosumption.get_state();
        state.insert(
            "desired_energy_Wh".into(),
            slot_map_to_json(&self.desired_energy_wh),
        );
        state.insert(
            "energy_requirement_Wh".into(),
            slot_map_to_json(&self.energy_requirement_wh),
        );
        state.insert(
            "total_energy_demanded_Wh".into(),
            json!(self.total_energy_demanded_wh),
        );
        Value::Object(state)
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        self.prosumption.restore_state(state)?;
        json_into_slot_map(
            require_field(state, "desired_energy_Wh")?,
            &mut self.desired_energy_wh,
        )?;
        json_into_slot_map(
            require_field(state, "energy_requirement_Wh")?,
            &mut self.energy_requirement_wh,
        )?;
        self.total_energy_demanded_wh = require_field(state, "total_energy_demanded_Wh")?
            .as_f64()
            .context("total_energy_demanded_Wh is not numeric")?;
        Ok(())
    }

    fn delete_past_state_values(&mut self, horizon: TimeSlot) {
        self.prosumption.delete_past_state_values(horizon);
        self.desired_energy_wh.retain(|slot, _| *slot >= horizon);
        self.energy_requirement_wh.retain(|slot, _| *slot >= horizon);
    }

    fn get_results_dict(&self, time_slot: TimeSlot) -> Value {
        json!({
            "energy_requirement_kWh": self.get_energy_requirement_wh(time_slot) / 1000.0,
            "total_energy_demanded_kWh": self.total_energy_demanded_wh / 1000.0,
        })
    }
}
