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

//! Simulation-wide configuration. One `SimulationConfig` instance is shared
//! by every area in a run; areas resolve it through their parent instead of
//! reading process-wide globals, which keeps concurrent test runs
//! independent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::time::TimeSlot;

/// Which of the two mutually exclusive grid-fee models a run uses.
///
/// Every area carries both a constant and a percentage fee field, but only
/// the one selected here is ever active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    /// Flat surcharge in cents/kWh, summed along the path to the root.
    #[default]
    Constant,
    /// Percentage applied to the trade rate at the point of application.
    Percentage,
}

/// Spot market flavour for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotMarketType {
    /// Sellers post offers, buyers accept them directly.
    OneSided,
    /// Offers and bids are matched pay-as-bid by the interior areas.
    #[default]
    TwoSided,
}

/// Event dispatch order between a parent area and its children within one
/// tick. Must be identical for every area of a run; mixing orders breaks
/// fee forwarding because a child may read a parent's stale market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    #[default]
    TopDown,
    BottomUp,
}

/// The four market kinds an interior area may operate per time slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Balancing,
    Settlement,
    Future,
}

/// Central configuration shared by the whole area tree. Scenario files may
/// set any subset of the fields; the rest fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// First simulated instant; slot keys are derived from it.
    pub start_date: DateTime<Utc>,
    /// Market slot length in minutes.
    pub slot_length_minutes: u32,
    /// Tick length in seconds; `slot_length` must be a whole number of ticks.
    pub tick_length_seconds: u32,
    /// Total simulated duration in minutes.
    pub duration_minutes: u32,
    pub grid_fee_type: FeeType,
    pub spot_market_type: SpotMarketType,
    pub dispatch_order: DispatchOrder,
    /// Run the matching pass before refreshing the cached market view on
    /// each tick (external-matcher ordering) instead of after.
    pub match_before_market_update: bool,
    pub enable_settlement_markets: bool,
    /// Age limit of settlement markets, in hours. Also bounds the past
    /// market retention window when settlement markets are enabled.
    pub settlement_market_max_age_hours: u32,
    pub enable_balancing_markets: bool,
    /// Assets eligible for the balancing market, by area name. Balancing
    /// markets are only created while this registry is non-empty.
    pub balancing_device_registry: HashSet<String>,
    pub enable_future_markets: bool,
    /// How far ahead of the current slot future markets reach, in hours.
    pub future_market_duration_hours: u32,
    /// Keep past markets and past ledger entries instead of pruning them.
    /// Used by analysis tooling; increases memory use linearly with time.
    pub retain_past_markets: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_date: DateTime::UNIX_EPOCH,
            slot_length_minutes: 15,
            tick_length_seconds: 15,
            duration_minutes: 60 * 24,
            grid_fee_type: FeeType::Constant,
            spot_market_type: SpotMarketType::TwoSided,
            dispatch_order: DispatchOrder::TopDown,
            match_before_market_update: false,
            enable_settlement_markets: false,
            settlement_market_max_age_hours: 1,
            enable_balancing_markets: false,
            balancing_device_registry: HashSet::new(),
            enable_future_markets: false,
            future_market_duration_hours: 1,
            retain_past_markets: false,
        }
    }
}

impl SimulationConfig {
    /// Number of ticks that make up one market slot.
    pub fn ticks_per_slot(&self) -> u32 {
        (self.slot_length_minutes * 60) / self.tick_length_seconds
    }

    /// Simulated time after `current_tick` ticks have passed.
    pub fn tick_time(&self, current_tick: u32) -> DateTime<Utc> {
        self.start_date + Duration::seconds(i64::from(self.tick_length_seconds * current_tick))
    }

    /// Start of the slot that contains `current_tick`.
    pub fn slot_at_tick(&self, current_tick: u32) -> TimeSlot {
        let tick_at_slot_start = current_tick - current_tick % self.ticks_per_slot();
        self.tick_time(tick_at_slot_start)
    }

    /// Start times of the future-market slots that follow `current_slot`.
    pub fn future_market_slots(&self, current_slot: TimeSlot) -> Vec<TimeSlot> {
        if !self.enable_future_markets {
            return Vec::new();
        }
        let slot_count = self.future_market_duration_hours * 60 / self.slot_length_minutes;
        (1..=slot_count)
            .map(|i| current_slot + Duration::minutes(i64::from(i * self.slot_length_minutes)))
            .collect()
    }

    /// True while `time_slot` falls inside the simulated duration.
    pub fn is_slot_in_duration(&self, time_slot: TimeSlot) -> bool {
        time_slot >= self.start_date
            && time_slot < self.start_date + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Retention horizon for past markets, order books and ledger entries:
    /// slots strictly before the returned instant may be pruned. With
    /// settlement enabled a slot stays live for the configured age after its
    /// delivery window has ended, so deviations can still settle.
    pub fn past_market_horizon(&self, current_slot: TimeSlot) -> TimeSlot {
        if self.enable_settlement_markets {
            current_slot
                - Duration::hours(i64::from(self.settlement_market_max_age_hours))
                - Duration::minutes(i64::from(self.slot_length_minutes))
        } else {
            current_slot - Duration::minutes(i64::from(self.slot_length_minutes))
        }
    }
}
