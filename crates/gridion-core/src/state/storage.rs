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

//! Storage ledger. Unlike consumption and production, the battery has a
//! single charge level shared by every open market slot, so the sellable and
//! buyable amounts are clamped from one pool that all slots draw from.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use gridion_types::time::TimeSlot;
use gridion_types::{FLOATING_POINT_TOLERANCE, convert_kw_to_kwh, limit_float_precision};

use super::{StateInterface, json_into_slot_map, require_field, slot_map_to_json};

/// Provenance of a charged energy batch. Local means bought from a sibling
/// inside the home area, external from anywhere further up the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyOrigin {
    Local,
    External,
    Unknown,
}

/// One charged batch in the first-in first-out provenance queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OriginBatch {
    pub origin: EnergyOrigin,
    pub value: f64,
}

/// Per-slot share of discharged energy by origin, kept for reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct OriginShares {
    pub local: f64,
    pub external: f64,
    pub unknown: f64,
}

impl OriginShares {
    fn add(&mut self, origin: EnergyOrigin, value: f64) {
        match origin {
            EnergyOrigin::Local => self.local += value,
            EnergyOrigin::External => self.external += value,
            EnergyOrigin::Unknown => self.unknown += value,
        }
    }
}

/// Ledger for a storage asset.
///
/// Four per-slot maps track the commitments: `pledged_*` is traded energy,
/// `offered_*` is posted but not yet traded. `used_storage` only changes at
/// slot boundaries, when [`StorageState::market_cycle`] applies the expired
/// slot's pledges.
#[derive(Debug, Clone)]
pub struct StorageState {
    capacity: f64,
    max_abs_battery_power_kw: f64,
    initial_soc_percent: f64,
    initial_capacity_kwh: f64,
    min_allowed_soc_ratio: f64,

    pledged_sell_kwh: BTreeMap<TimeSlot, f64>,
    offered_sell_kwh: BTreeMap<TimeSlot, f64>,
    pledged_buy_kwh: BTreeMap<TimeSlot, f64>,
    offered_buy_kwh: BTreeMap<TimeSlot, f64>,

    charge_history_percent: BTreeMap<TimeSlot, f64>,
    charge_history_kwh: BTreeMap<TimeSlot, f64>,
    offered_history: BTreeMap<TimeSlot, f64>,
    energy_to_buy_kwh: BTreeMap<TimeSlot, f64>,
    energy_to_sell_kwh: BTreeMap<TimeSlot, f64>,
    time_series_ess_share: BTreeMap<TimeSlot, OriginShares>,

    used_storage: f64,
    battery_energy_per_slot: f64,
    used_storage_share: VecDeque<OriginBatch>,
    current_market_slot: Option<TimeSlot>,
}

fn slot_value(map: &BTreeMap<TimeSlot, f64>, time_slot: TimeSlot) -> f64 {
    map.get(&time_slot).copied().unwrap_or(0.0)
}

impl StorageState {
    pub fn new(
        capacity_kwh: f64,
        max_abs_battery_power_kw: f64,
        initial_soc_percent: f64,
        min_allowed_soc_percent: f64,
        initial_energy_origin: EnergyOrigin,
    ) -> Self {
        let initial_capacity_kwh = capacity_kwh * initial_soc_percent / 100.0;
        Self {
            capacity: capacity_kwh,
            max_abs_battery_power_kw,
            initial_soc_percent,
            initial_capacity_kwh,
            min_allowed_soc_ratio: min_allowed_soc_percent / 100.0,
            pledged_sell_kwh: BTreeMap::new(),
            offered_sell_kwh: BTreeMap::new(),
            pledged_buy_kwh: BTreeMap::new(),
            offered_buy_kwh: BTreeMap::new(),
            charge_history_percent: BTreeMap::new(),
            charge_history_kwh: BTreeMap::new(),
            offered_history: BTreeMap::new(),
            energy_to_buy_kwh: BTreeMap::new(),
            energy_to_sell_kwh: BTreeMap::new(),
            time_series_ess_share: BTreeMap::new(),
            used_storage: initial_capacity_kwh,
            battery_energy_per_slot: 0.0,
            used_storage_share: VecDeque::from([OriginBatch {
                origin: initial_energy_origin,
                value: initial_capacity_kwh,
            }]),
            current_market_slot: None,
        }
    }

    /// Derive the per-slot energy budget from the power rating.
    pub fn activate(&mut self, slot_length_minutes: u32, current_time_slot: TimeSlot) {
        self.battery_energy_per_slot =
            convert_kw_to_kwh(self.max_abs_battery_power_kw, slot_length_minutes);
        self.current_market_slot = Some(current_time_slot);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn used_storage(&self) -> f64 {
        self.used_storage
    }

    pub fn battery_energy_per_slot(&self) -> f64 {
        self.battery_energy_per_slot
    }

    pub fn pledged_sell_kwh(&self, time_slot: TimeSlot) -> f64 {
        slot_value(&self.pledged_sell_kwh, time_slot)
    }

    pub fn offered_sell_kwh(&self, time_slot: TimeSlot) -> f64 {
        slot_value(&self.offered_sell_kwh, time_slot)
    }

    pub fn pledged_buy_kwh(&self, time_slot: TimeSlot) -> f64 {
        slot_value(&self.pledged_buy_kwh, time_slot)
    }

    pub fn offered_buy_kwh(&self, time_slot: TimeSlot) -> f64 {
        slot_value(&self.offered_buy_kwh, time_slot)
    }

    pub fn used_storage_share(&self) -> impl Iterator<Item = &OriginBatch> {
        self.used_storage_share.iter()
    }

    pub fn origin_shares(&self, time_slot: TimeSlot) -> OriginShares {
        self.time_series_ess_share
            .get(&time_slot)
            .copied()
            .unwrap_or_default()
    }

    /// Capacity neither stored nor promised for the slot.
    pub fn free_storage(&self, time_slot: TimeSlot) -> f64 {
        let in_use = self.used_storage - self.pledged_sell_kwh(time_slot)
            + self.pledged_buy_kwh(time_slot);
        self.capacity - in_use
    }

    fn max_offer_energy_kwh(&self, time_slot: TimeSlot) -> f64 {
        let energy_kwh = self.battery_energy_per_slot
            - self.pledged_sell_kwh(time_slot)
            - self.offered_sell_kwh(time_slot);
        assert!(energy_kwh >= -FLOATING_POINT_TOLERANCE);
        energy_kwh
    }

    fn max_buy_energy_kwh(&self, time_slot: TimeSlot) -> f64 {
        let energy_kwh = self.battery_energy_per_slot
            - self.pledged_buy_kwh(time_slot)
            - self.offered_buy_kwh(time_slot);
        assert!(energy_kwh >= -FLOATING_POINT_TOLERANCE);
        energy_kwh
    }

    fn has_battery_reached_max_discharge_power(&self, energy: f64, time_slot: TimeSlot) -> bool {
        let energy_balance_kwh = (energy
            + self.pledged_sell_kwh(time_slot)
            + self.offered_sell_kwh(time_slot)
            - self.pledged_buy_kwh(time_slot)
            - self.offered_buy_kwh(time_slot))
        .abs();
        energy_balance_kwh - self.battery_energy_per_slot > FLOATING_POINT_TOLERANCE
    }

    fn has_battery_reached_max_charge_power(&self, energy: f64, time_slot: TimeSlot) -> bool {
        let energy_balance_kwh = (energy
            + self.pledged_buy_kwh(time_slot)
            + self.offered_buy_kwh(time_slot)
            - self.pledged_sell_kwh(time_slot)
            - self.offered_sell_kwh(time_slot))
        .abs();
        energy_balance_kwh - self.battery_energy_per_slot > FLOATING_POINT_TOLERANCE
    }

    /// Distribute the sellable pool over `market_slots`.
    ///
    /// The pool is the stored energy minus everything already pledged or
    /// offered for open slots and minus the minimum state-of-charge floor.
    /// Earlier slots in the list consume the pool first; each slot is also
    /// capped by its remaining power budget.
    fn clamp_energy_to_sell_kwh(&mut self, market_slots: &[TimeSlot]) {
        let current = self
            .current_market_slot
            .expect("storage ledger used before activation");
        let mut accumulated_pledged = 0.0;
        let mut accumulated_offered = 0.0;
        for (time_slot, offered_sell_energy) in &self.offered_sell_kwh {
            if *time_slot >= current {
                accumulated_pledged += slot_value(&self.pledged_sell_kwh, *time_slot);
                accumulated_offered += offered_sell_energy;
            }
        }

        let mut available_for_all_slots = self.used_storage
            - accumulated_pledged
            - accumulated_offered
            - self.min_allowed_soc_ratio * self.capacity;

        for time_slot in market_slots {
            if available_for_all_slots < -FLOATING_POINT_TOLERANCE {
                break;
            }
            let clamped = limit_float_precision(
                available_for_all_slots
                    .min(self.max_offer_energy_kwh(*time_slot))
                    .min(self.battery_energy_per_slot),
            );
            self.energy_to_sell_kwh.insert(*time_slot, clamped);
            available_for_all_slots -= clamped;
        }
    }

    /// Buy-side mirror of [`Self::clamp_energy_to_sell_kwh`]: the pool is
    /// the free headroom up to capacity, and each slot's amount is clamped
    /// to zero from below.
    fn clamp_energy_to_buy_kwh(&mut self, market_slots: &[TimeSlot]) {
        let current = self
            .current_market_slot
            .expect("storage ledger used before activation");
        let mut accumulated_bought = 0.0;
        let mut accumulated_sought = 0.0;
        for (time_slot, offered_buy_energy) in &self.offered_buy_kwh {
            if *time_slot >= current {
                accumulated_bought += slot_value(&self.pledged_buy_kwh, *time_slot);
                accumulated_sought += offered_buy_energy;
            }
        }

        let mut available_for_all_slots = limit_float_precision(
            self.capacity - self.used_storage - accumulated_bought - accumulated_sought,
        );

        for time_slot in market_slots {
            if available_for_all_slots < -FLOATING_POINT_TOLERANCE {
                break;
            }
            let clamped = limit_float_precision(
                available_for_all_slots
                    .min(self.max_buy_energy_kwh(*time_slot))
                    .min(self.battery_energy_per_slot),
            )
            .max(0.0);
            self.energy_to_buy_kwh.insert(*time_slot, clamped);
            available_for_all_slots -= clamped;
        }
    }

    /// Audit the ledger after a mutation burst. Violations are fatal.
    pub fn check_state(&mut self, time_slot: TimeSlot) {
        self.clamp_energy_to_sell_kwh(&[time_slot]);
        self.clamp_energy_to_buy_kwh(&[time_slot]);
        self.calculate_and_update_soc(time_slot);

        let charge = if self.capacity > 0.0 {
            limit_float_precision(self.used_storage / self.capacity)
        } else {
            0.0
        };
        let max_value = self.capacity - self.min_allowed_soc_ratio * self.capacity;
        assert!(
            self.min_allowed_soc_ratio <= charge
                || (self.min_allowed_soc_ratio - charge).abs()
                    <= 1e-6 * self.min_allowed_soc_ratio.abs().max(charge.abs()),
            "battery charge ({charge}) less than min soc ({})",
            self.min_allowed_soc_ratio
        );
        assert!(
            limit_float_precision(self.used_storage) <= self.capacity
                || (self.used_storage - self.capacity).abs()
                    <= 1e-6 * self.used_storage.abs().max(self.capacity.abs()),
            "battery used storage ({}) surpassed the capacity ({})",
            self.used_storage,
            self.capacity
        );

        for map in [
            &self.offered_sell_kwh,
            &self.pledged_sell_kwh,
            &self.pledged_buy_kwh,
            &self.offered_buy_kwh,
        ] {
            let value = limit_float_precision(slot_value(map, time_slot));
            assert!(
                (0.0..=max_value).contains(&value),
                "per-slot commitment ({value}) outside [0, {max_value}]"
            );
        }
    }

    fn calculate_and_update_soc(&mut self, time_slot: TimeSlot) {
        if self.capacity > 0.0 {
            self.charge_history_percent
                .insert(time_slot, 100.0 * self.used_storage / self.capacity);
        }
        self.charge_history_kwh.insert(time_slot, self.used_storage);
    }

    /// Seed per-slot defaults so later arithmetic never misses a key.
    pub fn add_default_values_to_state_profiles(&mut self, time_slots: &[TimeSlot]) {
        for time_slot in time_slots {
            self.pledged_sell_kwh.entry(*time_slot).or_insert(0.0);
            self.pledged_buy_kwh.entry(*time_slot).or_insert(0.0);
            self.offered_sell_kwh.entry(*time_slot).or_insert(0.0);
            self.offered_buy_kwh.entry(*time_slot).or_insert(0.0);
            self.charge_history_percent
                .entry(*time_slot)
                .or_insert(self.initial_soc_percent);
            self.charge_history_kwh
                .entry(*time_slot)
                .or_insert(self.initial_capacity_kwh);
            self.energy_to_buy_kwh.entry(*time_slot).or_insert(0.0);
            self.energy_to_sell_kwh.entry(*time_slot).or_insert(0.0);
            self.offered_history.entry(*time_slot).or_insert(0.0);
            self.time_series_ess_share
                .entry(*time_slot)
                .or_insert_with(OriginShares::default);
        }
    }

    /// Apply the expired slot's pledged flows to the charge level and
    /// re-clamp the open slots. `past_time_slot` is `None` on the very
    /// first cycle, when no slot has completed yet.
    pub fn market_cycle(
        &mut self,
        past_time_slot: Option<TimeSlot>,
        current_time_slot: TimeSlot,
        future_time_slots: &[TimeSlot],
    ) {
        self.current_market_slot = Some(current_time_slot);
        if !future_time_slots.is_empty() {
            // Orders posted while this slot was still a future market are
            // deleted on promotion to spot, so their commitments reset.
            self.offered_buy_kwh.insert(current_time_slot, 0.0);
            self.offered_sell_kwh.insert(current_time_slot, 0.0);
        }
        let mut all_slots = Vec::with_capacity(future_time_slots.len() + 1);
        all_slots.push(current_time_slot);
        all_slots.extend_from_slice(future_time_slots);
        self.add_default_values_to_state_profiles(&all_slots);

        if let Some(past) = past_time_slot {
            self.used_storage -= slot_value(&self.pledged_sell_kwh, past);
            self.used_storage += slot_value(&self.pledged_buy_kwh, past);
        }

        self.clamp_energy_to_sell_kwh(&all_slots);
        self.clamp_energy_to_buy_kwh(&all_slots);
        self.calculate_and_update_soc(current_time_slot);

        self.offered_history
            .insert(current_time_slot, self.offered_sell_kwh(current_time_slot));

        if let Some(past) = past_time_slot {
            let shares = self.time_series_ess_share.entry(past).or_default();
            for batch in &self.used_storage_share {
                shares.add(batch.origin, batch.value);
            }
        }
    }

    /// Track a posted bid's energy as a buy commitment.
    pub fn register_energy_from_posted_bid(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.offered_buy_kwh.entry(time_slot).or_insert(0.0) += energy;
        self.clamp_energy_to_buy_kwh(&[time_slot]);
    }

    /// Track a posted offer's energy as a sell commitment.
    pub fn register_energy_from_posted_offer(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.offered_sell_kwh.entry(time_slot).or_insert(0.0) += energy;
        self.clamp_energy_to_sell_kwh(&[time_slot]);
    }

    /// Overwrite the sell commitment, used when open offers are replaced.
    pub fn reset_offered_sell_energy(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        self.offered_sell_kwh.insert(time_slot, energy);
        self.clamp_energy_to_sell_kwh(&[time_slot]);
    }

    /// Overwrite the buy commitment, used when open bids are replaced.
    pub fn reset_offered_buy_energy(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        self.offered_buy_kwh.insert(time_slot, energy);
        self.clamp_energy_to_buy_kwh(&[time_slot]);
    }

    /// Release a deleted offer's energy back to the sellable pool.
    pub fn remove_energy_from_deleted_offer(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.offered_sell_kwh.entry(time_slot).or_insert(0.0) -= energy;
        self.clamp_energy_to_sell_kwh(&[time_slot]);
    }

    /// Book a purchase made by directly accepting an offer. One-sided
    /// markets carry no bid, so there is no `offered_buy` to release.
    pub fn register_energy_from_one_sided_market_accept_offer(
        &mut self,
        energy: f64,
        time_slot: TimeSlot,
        energy_origin: EnergyOrigin,
    ) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.pledged_buy_kwh.entry(time_slot).or_insert(0.0) += energy;
        self.track_energy_bought_type(energy, energy_origin);
        self.clamp_energy_to_buy_kwh(&[time_slot]);
    }

    /// Book a traded bid: the commitment moves from offered to pledged.
    pub fn register_energy_from_bid_trade(
        &mut self,
        energy: f64,
        time_slot: TimeSlot,
        energy_origin: EnergyOrigin,
    ) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.pledged_buy_kwh.entry(time_slot).or_insert(0.0) += energy;
        *self.offered_buy_kwh.entry(time_slot).or_insert(0.0) -= energy;
        self.track_energy_bought_type(energy, energy_origin);
        self.clamp_energy_to_buy_kwh(&[time_slot]);
    }

    /// Book a traded offer: the commitment moves from offered to pledged
    /// and the provenance queue shrinks front-first.
    pub fn register_energy_from_offer_trade(&mut self, energy: f64, time_slot: TimeSlot) {
        assert!(energy >= -FLOATING_POINT_TOLERANCE);
        *self.pledged_sell_kwh.entry(time_slot).or_insert(0.0) += energy;
        *self.offered_sell_kwh.entry(time_slot).or_insert(0.0) -= energy;
        self.track_energy_sell_type(energy);
        self.clamp_energy_to_sell_kwh(&[time_slot]);
    }

    fn track_energy_bought_type(&mut self, energy: f64, energy_origin: EnergyOrigin) {
        self.used_storage_share.push_back(OriginBatch {
            origin: energy_origin,
            value: energy,
        });
    }

    // Discharged energy is attributed to charge batches first-in first-out.
    fn track_energy_sell_type(&mut self, mut energy: f64) {
        while limit_float_precision(energy) > 0.0 && !self.used_storage_share.is_empty() {
            let front = self.used_storage_share[0];
            if energy >= front.value {
                energy -= front.value;
                self.used_storage_share.pop_front();
            } else {
                self.used_storage_share[0].value = front.value - energy;
                energy = 0.0;
            }
        }
    }

    /// Energy the storage can still bid for in the slot, zero when the
    /// charge power budget is exhausted.
    pub fn get_available_energy_to_buy_kwh(&mut self, time_slot: TimeSlot) -> f64 {
        if self.free_storage(time_slot) == 0.0 {
            return 0.0;
        }
        self.clamp_energy_to_buy_kwh(&[time_slot]);
        let energy_kwh = slot_value(&self.energy_to_buy_kwh, time_slot);
        if self.has_battery_reached_max_charge_power(energy_kwh.abs(), time_slot) {
            return 0.0;
        }
        assert!(energy_kwh > -FLOATING_POINT_TOLERANCE);
        energy_kwh
    }

    /// Energy the storage can still offer in the slot, zero when the
    /// discharge power budget is exhausted.
    pub fn get_available_energy_to_sell_kwh(&mut self, time_slot: TimeSlot) -> f64 {
        if self.used_storage == 0.0 {
            return 0.0;
        }
        self.clamp_energy_to_sell_kwh(&[time_slot]);
        let energy_kwh = slot_value(&self.energy_to_sell_kwh, time_slot);
        if self.has_battery_reached_max_discharge_power(energy_kwh, time_slot) {
            return 0.0;
        }
        assert!(energy_kwh >= -FLOATING_POINT_TOLERANCE);
        energy_kwh
    }

    /// State of charge as a ratio in [0, 1].
    pub fn get_soc_level(&self, time_slot: TimeSlot) -> f64 {
        match self.charge_history_percent.get(&time_slot) {
            Some(percent) => percent / 100.0,
            None if self.capacity > 0.0 => self.used_storage / self.capacity,
            None => 0.0,
        }
    }

    pub fn to_dict(&self, time_slot: TimeSlot) -> Value {
        json!({
            "energy_to_sell": slot_value(&self.energy_to_sell_kwh, time_slot),
            "energy_active_in_bids": self.offered_buy_kwh(time_slot),
            "energy_to_buy": slot_value(&self.energy_to_buy_kwh, time_slot),
            "energy_active_in_offers": self.offered_sell_kwh(time_slot),
            "free_storage": self.free_storage(time_slot),
            "used_storage": self.used_storage,
        })
    }
}

impl StateInterface for StorageState {
    fn get_state(&self) -> Value {
        json!({
            "pledged_sell_kWh": slot_map_to_json(&self.pledged_sell_kwh),
            "offered_sell_kWh": slot_map_to_json(&self.offered_sell_kwh),
            "pledged_buy_kWh": slot_map_to_json(&self.pledged_buy_kwh),
            "offered_buy_kWh": slot_map_to_json(&self.offered_buy_kwh),
            "charge_history": slot_map_to_json(&self.charge_history_percent),
            "charge_history_kWh": slot_map_to_json(&self.charge_history_kwh),
            "offered_history": slot_map_to_json(&self.offered_history),
            "energy_to_buy_dict": slot_map_to_json(&self.energy_to_buy_kwh),
            "energy_to_sell_dict": slot_map_to_json(&self.energy_to_sell_kwh),
            "used_storage": self.used_storage,
            "battery_energy_per_slot": self.battery_energy_per_slot,
        })
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        json_into_slot_map(
            require_field(state, "pledged_sell_kWh")?,
            &mut self.pledged_sell_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "offered_sell_kWh")?,
            &mut self.offered_sell_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "pledged_buy_kWh")?,
            &mut self.pledged_buy_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "offered_buy_kWh")?,
            &mut self.offered_buy_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "charge_history")?,
            &mut self.charge_history_percent,
        )?;
        json_into_slot_map(
            require_field(state, "charge_history_kWh")?,
            &mut self.charge_history_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "offered_history")?,
            &mut self.offered_history,
        )?;
        json_into_slot_map(
            require_field(state, "energy_to_buy_dict")?,
            &mut self.energy_to_buy_kwh,
        )?;
        json_into_slot_map(
            require_field(state, "energy_to_sell_dict")?,
            &mut self.energy_to_sell_kwh,
        )?;
        self.used_storage = require_field(state, "used_storage")?
            .as_f64()
            .context("used_storage is not numeric")?;
        self.battery_energy_per_slot = require_field(state, "battery_energy_per_slot")?
            .as_f64()
            .context("battery_energy_per_slot is not numeric")?;
        Ok(())
    }

    fn delete_past_state_values(&mut self, horizon: TimeSlot) {
        let retain = |slot: &TimeSlot, _: &mut f64| *slot >= horizon;
        self.pledged_sell_kwh.retain(retain);
        self.offered_sell_kwh.retain(retain);
        self.pledged_buy_kwh.retain(retain);
        self.offered_buy_kwh.retain(retain);
        self.charge_history_percent.retain(retain);
        self.charge_history_kwh.retain(retain);
        self.offered_history.retain(retain);
        self.energy_to_buy_kwh.retain(retain);
        self.energy_to_sell_kwh.retain(retain);
        self.time_series_ess_share.retain(|slot, _| *slot >= horizon);
    }

    fn get_results_dict(&self, time_slot: TimeSlot) -> Value {
        json!({
            "soc_history_%": self.charge_history_percent.get(&time_slot).copied().unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn slot(hour: u32, minute: u32) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    fn active_storage(
        capacity: f64,
        power_kw: f64,
        initial_soc: f64,
        min_soc: f64,
    ) -> StorageState {
        let mut state = StorageState::new(capacity, power_kw, initial_soc, min_soc, EnergyOrigin::External);
        state.activate(15, slot(8, 0));
        state.market_cycle(None, slot(8, 0), &[]);
        state
    }

    #[test]
    fn sellable_pool_respects_the_soc_floor() {
        // 100 kWh at 99 % with a 10 % floor leaves 89 kWh to sell.
        let mut state = active_storage(100.0, 400.0, 99.0, 10.0);
        let sellable = state.get_available_energy_to_sell_kwh(slot(8, 0));
        assert!((sellable - 89.0).abs() < 1e-9, "sellable was {sellable}");
    }

    #[test]
    fn sellable_pool_is_capped_by_the_power_budget() {
        // 10 kW over 15 minutes budgets 2.5 kWh per slot.
        let mut state = active_storage(100.0, 10.0, 99.0, 10.0);
        let sellable = state.get_available_energy_to_sell_kwh(slot(8, 0));
        assert!((sellable - 2.5).abs() < 1e-9, "sellable was {sellable}");
    }

    #[test]
    fn pool_is_shared_across_open_slots() {
        let mut state = StorageState::new(10.0, 40.0, 50.0, 10.0, EnergyOrigin::External);
        state.activate(15, slot(8, 0));
        let future: Vec<TimeSlot> = (1..4)
            .map(|i| slot(8, 0) + Duration::minutes(15 * i))
            .collect();
        state.market_cycle(None, slot(8, 0), &future);
        // Pool is 5 - 1 = 4 kWh; the per-slot budget of 10 kWh never binds,
        // so the first slot takes everything.
        assert!((state.get_available_energy_to_sell_kwh(slot(8, 0)) - 4.0).abs() < 1e-9);
        state.register_energy_from_posted_offer(4.0, slot(8, 0));
        assert!(state.get_available_energy_to_sell_kwh(future[0]).abs() < 1e-9);
    }

    #[test]
    fn offer_trade_moves_commitment_and_market_cycle_discharges() {
        let mut state = active_storage(100.0, 400.0, 50.0, 10.0);
        state.register_energy_from_posted_offer(5.0, slot(8, 0));
        assert!((state.offered_sell_kwh(slot(8, 0)) - 5.0).abs() < 1e-9);

        state.register_energy_from_offer_trade(5.0, slot(8, 0));
        assert!(state.offered_sell_kwh(slot(8, 0)).abs() < 1e-9);
        assert!((state.pledged_sell_kwh(slot(8, 0)) - 5.0).abs() < 1e-9);
        // The charge level only moves at the slot boundary.
        assert!((state.used_storage() - 50.0).abs() < 1e-9);

        state.market_cycle(Some(slot(8, 0)), slot(8, 15), &[]);
        assert!((state.used_storage() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn bid_trade_charges_at_the_slot_boundary() {
        let mut state = active_storage(100.0, 400.0, 50.0, 10.0);
        state.register_energy_from_posted_bid(3.0, slot(8, 0));
        state.register_energy_from_bid_trade(3.0, slot(8, 0), EnergyOrigin::Local);
        assert!(state.offered_buy_kwh(slot(8, 0)).abs() < 1e-9);
        assert!((state.pledged_buy_kwh(slot(8, 0)) - 3.0).abs() < 1e-9);

        state.market_cycle(Some(slot(8, 0)), slot(8, 15), &[]);
        assert!((state.used_storage() - 53.0).abs() < 1e-9);
    }

    #[test]
    fn storage_conservation_across_cycles() {
        let mut state = active_storage(100.0, 400.0, 50.0, 10.0);
        let initial = state.used_storage();
        let mut pledged_buy = 0.0;
        let mut pledged_sell = 0.0;

        for i in 0..4u32 {
            let current = slot(8, 0) + Duration::minutes(15 * i64::from(i));
            let next = current + Duration::minutes(15);
            if i % 2 == 0 {
                state.register_energy_from_posted_offer(2.0, current);
                state.register_energy_from_offer_trade(2.0, current);
                pledged_sell += 2.0;
            } else {
                state.register_energy_from_posted_bid(1.5, current);
                state.register_energy_from_bid_trade(1.5, current, EnergyOrigin::External);
                pledged_buy += 1.5;
            }
            state.market_cycle(Some(current), next, &[]);
            state.check_state(next);
        }
        assert!((state.used_storage() - (initial + pledged_buy - pledged_sell)).abs() < 1e-9);
    }

    #[test]
    fn origin_queue_consumes_front_first() {
        let mut state = active_storage(100.0, 400.0, 10.0, 0.0);
        // Queue: [External 10] then two charges.
        state.register_energy_from_bid_trade(4.0, slot(8, 0), EnergyOrigin::Local);
        state.register_energy_from_bid_trade(2.0, slot(8, 0), EnergyOrigin::Unknown);

        // Selling 12 kWh eats the whole external batch and part of the local.
        state.register_energy_from_posted_offer(12.0, slot(8, 0));
        state.register_energy_from_offer_trade(12.0, slot(8, 0));

        let queue: Vec<OriginBatch> = state.used_storage_share().copied().collect();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].origin, EnergyOrigin::Local);
        assert!((queue[0].value - 2.0).abs() < 1e-9);
        assert_eq!(queue[1].origin, EnergyOrigin::Unknown);
        assert!((queue[1].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn discharged_origin_shares_accumulate_per_slot() {
        let mut state = active_storage(100.0, 400.0, 10.0, 0.0);
        state.register_energy_from_bid_trade(4.0, slot(8, 0), EnergyOrigin::Local);
        state.market_cycle(Some(slot(8, 0)), slot(8, 15), &[]);
        let shares = state.origin_shares(slot(8, 0));
        assert!((shares.external - 10.0).abs() < 1e-9);
        assert!((shares.local - 4.0).abs() < 1e-9);
    }

    #[test]
    fn power_guard_considers_the_net_balance() {
        // 2.5 kWh budget per slot.
        let mut state = active_storage(100.0, 10.0, 50.0, 10.0);
        state.register_energy_from_posted_bid(2.0, slot(8, 0));
        // Selling 2 kWh nets out against the posted buy, so it is allowed.
        assert!(!state.has_battery_reached_max_discharge_power(2.0, slot(8, 0)));
        // Without the opposite commitment this would exceed the budget.
        assert!(state.has_battery_reached_max_discharge_power(5.0, slot(8, 0)));
    }

    #[test]
    fn full_battery_cannot_buy() {
        let mut state = active_storage(100.0, 400.0, 100.0, 10.0);
        assert_eq!(state.get_available_energy_to_buy_kwh(slot(8, 0)), 0.0);
    }

    #[test]
    fn state_round_trips() {
        let mut state = active_storage(100.0, 10.0, 50.0, 10.0);
        state.register_energy_from_posted_offer(1.0, slot(8, 0));
        state.register_energy_from_posted_bid(0.5, slot(8, 0));
        state.check_state(slot(8, 0));

        let snapshot = state.get_state();
        let mut restored = StorageState::new(100.0, 10.0, 50.0, 10.0, EnergyOrigin::External);
        restored.restore_state(&snapshot).unwrap();
        assert_eq!(restored.get_state(), snapshot);
    }

    #[test]
    #[should_panic(expected = "surpassed the capacity")]
    fn overcharge_is_fatal() {
        let mut state = active_storage(10.0, 400.0, 90.0, 0.0);
        state.register_energy_from_one_sided_market_accept_offer(
            5.0,
            slot(8, 0),
            EnergyOrigin::External,
        );
        state.market_cycle(Some(slot(8, 0)), slot(8, 15), &[]);
        state.check_state(slot(8, 15));
    }
}
