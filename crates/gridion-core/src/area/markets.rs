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

//! Per-area market containers. Every interior area owns one `MarketSet`:
//! the current markets per kind, keyed by time slot, plus the rotated past
//! markets kept for settlement and analysis.

use std::collections::BTreeMap;

use tracing::debug;

use gridion_types::time::TimeSlot;
use gridion_types::{MarketId, MarketKind, SimulationConfig};

use crate::market::{GridFee, Market};

#[derive(Debug, Default)]
pub struct MarketSet {
    pub spot: BTreeMap<TimeSlot, Market>,
    pub past_spot: BTreeMap<TimeSlot, Market>,
    pub balancing: BTreeMap<TimeSlot, Market>,
    pub past_balancing: BTreeMap<TimeSlot, Market>,
    pub settlement: BTreeMap<TimeSlot, Market>,
    pub past_settlement: BTreeMap<TimeSlot, Market>,
    pub future: BTreeMap<TimeSlot, Market>,
}

impl MarketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current spot market, once the first cycle ran.
    pub fn spot_market(&self) -> Option<&Market> {
        self.spot.values().next_back()
    }

    pub fn spot_market_mut(&mut self) -> Option<&mut Market> {
        self.spot.values_mut().next_back()
    }

    pub fn settlement_market_mut(&mut self, time_slot: TimeSlot) -> Option<&mut Market> {
        self.settlement.get_mut(&time_slot)
    }

    pub fn future_market_mut(&mut self, time_slot: TimeSlot) -> Option<&mut Market> {
        self.future.get_mut(&time_slot)
    }

    /// Look an active market up by id, across all kinds.
    pub fn market_by_id_mut(&mut self, market_id: MarketId) -> Option<&mut Market> {
        self.active_markets_mut().find(|market| market.id() == market_id)
    }

    pub fn active_markets_mut(&mut self) -> impl Iterator<Item = &mut Market> {
        self.spot
            .values_mut()
            .chain(self.balancing.values_mut())
            .chain(self.settlement.values_mut())
            .chain(self.future.values_mut())
    }

    /// Create the spot market for `time_slot` if it does not exist yet.
    /// Returns whether a market was created, feeding the area's `changed`
    /// flag for the cycle's event broadcast.
    pub fn create_new_spot_market(&mut self, time_slot: TimeSlot, grid_fee: GridFee) -> bool {
        if self.spot.contains_key(&time_slot) {
            return false;
        }
        let market = Market::new(MarketKind::Spot, time_slot, grid_fee);
        debug!(market = %market.id(), slot = %time_slot, "spot market created");
        self.spot.insert(time_slot, market);
        true
    }

    /// Balancing twin of [`MarketSet::create_new_spot_market`].
    pub fn create_new_balancing_market(&mut self, time_slot: TimeSlot, grid_fee: GridFee) -> bool {
        if self.balancing.contains_key(&time_slot) {
            return false;
        }
        self.balancing
            .insert(time_slot, Market::new(MarketKind::Balancing, time_slot, grid_fee));
        true
    }

    /// One future market per upcoming slot; slots promoted to spot are
    /// dropped by rotation, not here.
    pub fn create_future_markets(&mut self, future_slots: &[TimeSlot], grid_fee: GridFee) {
        for slot in future_slots {
            self.future
                .entry(*slot)
                .or_insert_with(|| Market::new(MarketKind::Future, *slot, grid_fee));
        }
    }

    /// Move expired markets to the past maps, exactly once per market, and
    /// freeze them. For each freshly expired spot slot a settlement market
    /// opens when settlement is enabled. Future markets for slots that are
    /// no longer in the future are dropped; their orders never carry over.
    pub fn rotate(&mut self, current_time_slot: TimeSlot, config: &SimulationConfig, grid_fee: GridFee) {
        let expired: Vec<TimeSlot> = self
            .spot
            .range(..current_time_slot)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired {
            let mut market = self.spot.remove(&slot).expect("slot listed but missing");
            market.set_readonly();
            debug!(market = %market.id(), slot = %slot, "spot market rotated to past");
            self.past_spot.insert(slot, market);
            if config.enable_settlement_markets {
                self.settlement
                    .entry(slot)
                    .or_insert_with(|| Market::new(MarketKind::Settlement, slot, grid_fee));
            }
        }

        let expired_balancing: Vec<TimeSlot> = self
            .balancing
            .range(..current_time_slot)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired_balancing {
            let mut market = self.balancing.remove(&slot).expect("slot listed but missing");
            market.set_readonly();
            self.past_balancing.insert(slot, market);
        }

        // Settlement markets close once their slot falls behind the
        // retention horizon, the configured age past the slot's end.
        let settlement_horizon = config.past_market_horizon(current_time_slot);
        let expired_settlement: Vec<TimeSlot> = self
            .settlement
            .range(..settlement_horizon)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired_settlement {
            let mut market = self.settlement.remove(&slot).expect("slot listed but missing");
            market.set_readonly();
            self.past_settlement.insert(slot, market);
        }

        self.future.retain(|slot, _| *slot > current_time_slot);

        if !config.retain_past_markets {
            let horizon = config.past_market_horizon(current_time_slot);
            self.past_spot.retain(|slot, _| *slot >= horizon);
            self.past_balancing.retain(|slot, _| *slot >= horizon);
            self.past_settlement.retain(|slot, _| *slot >= horizon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn slot(minutes: i64) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn config() -> SimulationConfig {
        SimulationConfig::default()
    }

    #[test]
    fn spot_market_is_created_once_per_slot() {
        let mut markets = MarketSet::new();
        assert!(markets.create_new_spot_market(slot(0), GridFee::Constant(0.0)));
        assert!(!markets.create_new_spot_market(slot(0), GridFee::Constant(0.0)));
        assert!(markets.create_new_spot_market(slot(15), GridFee::Constant(0.0)));
    }

    #[test]
    fn rotation_moves_each_market_exactly_once_and_freezes_it() {
        let mut markets = MarketSet::new();
        let mut config = config();
        config.retain_past_markets = true;
        markets.create_new_spot_market(slot(0), GridFee::Constant(0.0));
        markets.create_new_spot_market(slot(15), GridFee::Constant(0.0));

        markets.rotate(slot(15), &config, GridFee::Constant(0.0));
        assert_eq!(markets.spot.len(), 1);
        assert_eq!(markets.past_spot.len(), 1);
        assert!(markets.past_spot[&slot(0)].is_readonly());

        // Rotating again must not touch the already-rotated market.
        markets.rotate(slot(15), &config, GridFee::Constant(0.0));
        assert_eq!(markets.past_spot.len(), 1);
    }

    #[test]
    fn rotation_opens_a_settlement_market_for_the_expired_slot() {
        let mut markets = MarketSet::new();
        let mut config = config();
        config.enable_settlement_markets = true;
        config.retain_past_markets = true;
        markets.create_new_spot_market(slot(0), GridFee::Constant(0.0));

        markets.rotate(slot(15), &config, GridFee::Constant(0.0));
        assert!(markets.settlement.contains_key(&slot(0)));
        assert!(!markets.settlement[&slot(0)].is_readonly());
    }

    #[test]
    fn old_settlement_markets_close_after_max_age() {
        let mut markets = MarketSet::new();
        let mut config = config();
        config.enable_settlement_markets = true;
        config.retain_past_markets = true;
        config.settlement_market_max_age_hours = 1;
        markets.create_new_spot_market(slot(0), GridFee::Constant(0.0));
        markets.rotate(slot(15), &config, GridFee::Constant(0.0));

        markets.rotate(slot(15 + 60), &config, GridFee::Constant(0.0));
        assert!(markets.settlement.contains_key(&slot(0)));
        markets.rotate(slot(30 + 60), &config, GridFee::Constant(0.0));
        assert!(!markets.settlement.contains_key(&slot(0)));
        assert!(markets.past_settlement.contains_key(&slot(0)));
    }

    #[test]
    fn past_markets_are_deleted_unless_retained() {
        let mut markets = MarketSet::new();
        let config = config();
        markets.create_new_spot_market(slot(0), GridFee::Constant(0.0));
        markets.create_new_spot_market(slot(15), GridFee::Constant(0.0));
        markets.rotate(slot(15), &config, GridFee::Constant(0.0));
        markets.rotate(slot(30), &config, GridFee::Constant(0.0));
        // Without retention only slots at or past the horizon survive.
        assert!(markets.past_spot.len() <= 1);
    }

    #[test]
    fn promoted_future_slots_are_dropped() {
        let mut markets = MarketSet::new();
        let config = config();
        markets.create_future_markets(&[slot(15), slot(30)], GridFee::Constant(0.0));
        markets.create_new_spot_market(slot(15), GridFee::Constant(0.0));
        markets.rotate(slot(15), &config, GridFee::Constant(0.0));
        assert!(!markets.future.contains_key(&slot(15)));
        assert!(markets.future.contains_key(&slot(30)));
    }
}
