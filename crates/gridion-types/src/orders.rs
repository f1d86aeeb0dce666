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

//! Order and trade data classes exchanged between strategies and markets.
//! Prices are totals in cents for the full energy amount; energy is in kWh.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::TimeSlot;

/// Identifier of a single order or trade.
pub type OrderId = Uuid;

/// Identifier of one market instance (one kind, one time slot, one area).
pub type MarketId = Uuid;

/// Identity of the trading party an order belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderDetails {
    pub name: String,
    pub uuid: Uuid,
}

impl TraderDetails {
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
        }
    }
}

/// A sell-side order, valid in one market and one time slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OrderId,
    /// Total price in cents for the full energy amount.
    pub price: f64,
    /// Offered energy in kWh.
    pub energy: f64,
    pub seller: TraderDetails,
    pub time_slot: TimeSlot,
}

impl Offer {
    /// Price per kWh.
    pub fn energy_rate(&self) -> f64 {
        self.price / self.energy
    }
}

/// A buy-side order, valid in one market and one time slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: OrderId,
    /// Total price in cents for the full energy amount.
    pub price: f64,
    /// Requested energy in kWh.
    pub energy: f64,
    pub buyer: TraderDetails,
    pub time_slot: TimeSlot,
}

impl Bid {
    /// Price per kWh.
    pub fn energy_rate(&self) -> f64 {
        self.price / self.energy
    }
}

/// An executed trade. `offer`/`bid` hold the matched order as it existed at
/// execution time (after any split).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: OrderId,
    pub time_slot: TimeSlot,
    pub seller: TraderDetails,
    pub buyer: TraderDetails,
    /// Traded energy in kWh.
    pub traded_energy: f64,
    /// Total trade price in cents, grid fees included.
    pub trade_price: f64,
    /// Grid-fee share of the trade price, in cents.
    pub fee_price: f64,
    pub offer: Option<Offer>,
    pub bid: Option<Bid>,
}

impl Trade {
    /// Trade price per kWh.
    pub fn trade_rate(&self) -> f64 {
        self.trade_price / self.traded_energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn trader(name: &str) -> TraderDetails {
        TraderDetails::new(name, Uuid::new_v4())
    }

    #[test]
    fn test_offer_energy_rate() {
        let offer = Offer {
            id: Uuid::new_v4(),
            price: 30.0,
            energy: 2.0,
            seller: trader("pv"),
            time_slot: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        };
        assert_eq!(offer.energy_rate(), 15.0);
    }

    #[test]
    fn test_trade_rate() {
        let trade = Trade {
            id: Uuid::new_v4(),
            time_slot: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
            seller: trader("pv"),
            buyer: trader("load"),
            traded_energy: 0.5,
            trade_price: 10.0,
            fee_price: 0.0,
            offer: None,
            bid: None,
        };
        assert_eq!(trade.trade_rate(), 20.0);
    }
}
