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

pub mod config;
pub mod orders;
pub mod time;

// Re-export common types for convenience
pub use config::{DispatchOrder, FeeType, MarketKind, SimulationConfig, SpotMarketType};
pub use orders::{Bid, MarketId, Offer, OrderId, Trade, TraderDetails};
pub use time::{TimeSlot, format_time_slot, parse_time_slot};

/// Tolerance applied to every energy comparison. Two energy values closer
/// than this are considered equal; ledger invariants allow transient values
/// down to `-FLOATING_POINT_TOLERANCE`.
pub const FLOATING_POINT_TOLERANCE: f64 = 0.00001;

/// Round away accumulated floating point noise (13 significant decimals).
pub fn limit_float_precision(value: f64) -> f64 {
    (value * 1e13).round() / 1e13
}

/// Convert a power rating in kW to the energy in kWh it delivers over one
/// market slot of the given length.
pub fn convert_kw_to_kwh(power_kw: f64, slot_length_minutes: u32) -> f64 {
    power_kw * f64::from(slot_length_minutes) / 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_float_precision() {
        let noisy = 0.1 + 0.2;
        assert_eq!(limit_float_precision(noisy), 0.3);
    }

    #[test]
    fn test_convert_kw_to_kwh() {
        assert_eq!(convert_kw_to_kwh(5.0, 15), 1.25);
        assert_eq!(convert_kw_to_kwh(5.0, 60), 5.0);
    }
}
