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

use chrono::Timelike;
use serde_json::Value;
use tracing::debug;

use gridion_types::time::TimeSlot;
use gridion_types::{FLOATING_POINT_TOLERANCE, MarketId, Trade, convert_kw_to_kwh};

use crate::commands::ExternalCommand;
use crate::state::{ProductionState, StateInterface};

use super::{StrategyBase, StrategyContext, TradingStrategy};

/// Hourly production factor of a panel at a given latitude-agnostic default:
/// zero at night, ramping towards a noon peak.
const DEFAULT_HOURLY_FACTOR: [f64; 24] = [
    0.0, 0.0, 0.0, 0.0, 0.0, 0.02, 0.08, 0.18, 0.35, 0.55, 0.75, 0.92, 1.0, 0.95, 0.82, 0.65,
    0.45, 0.25, 0.1, 0.03, 0.0, 0.0, 0.0, 0.0,
];

/// A producing asset selling its forecast energy. It keeps one open offer
/// whose rate ramps downwards from `initial_selling_rate` to
/// `final_selling_rate` over the slot.
#[derive(Debug)]
pub struct PvStrategy {
    base: StrategyBase,
    capacity_kw: f64,
    /// Per-hour share of the nameplate capacity; defaults to a daylight curve.
    hourly_factor: Option<Vec<f64>>,
    initial_selling_rate: f64,
    final_selling_rate: f64,
    state: ProductionState,
}

impl PvStrategy {
    pub fn new(
        capacity_kw: f64,
        hourly_factor: Option<Vec<f64>>,
        initial_selling_rate: f64,
        final_selling_rate: f64,
    ) -> Self {
        Self {
            base: StrategyBase::new(),
            capacity_kw,
            hourly_factor,
            initial_selling_rate,
            final_selling_rate,
            state: ProductionState::new(),
        }
    }

    pub fn state(&self) -> &ProductionState {
        &self.state
    }

    fn forecast_kwh(&self, time_slot: TimeSlot, slot_length_minutes: u32) -> f64 {
        let hour = time_slot.hour() as usize;
        let factor = match &self.hourly_factor {
            Some(profile) => profile.get(hour).copied().unwrap_or(0.0),
            None => DEFAULT_HOURLY_FACTOR[hour],
        };
        convert_kw_to_kwh(self.capacity_kw * factor, slot_length_minutes)
    }

    fn seed_slots(&mut self, ctx: &StrategyContext<'_>) {
        let slot_length = ctx.config.slot_length_minutes;
        let forecast = self.forecast_kwh(ctx.current_slot, slot_length);
        self.state
            .set_available_energy(forecast, ctx.current_slot, false);
        for slot in ctx.config.future_market_slots(ctx.current_slot) {
            let forecast = self.forecast_kwh(slot, slot_length);
            self.state.set_available_energy(forecast, slot, false);
        }
    }

    /// Keep a single open offer for the remaining unsold energy, at the
    /// current (decreasing) ramp rate.
    fn update_spot_offer(&mut self, ctx: &mut StrategyContext<'_>) {
        // Selling rate ramps downwards as the slot progresses.
        let rate = ctx.ramp_rate(self.initial_selling_rate, self.final_selling_rate);
        let slot = ctx.current_slot;
        let available_kwh = self.state.get_available_energy_kwh(slot);
        if available_kwh <= FLOATING_POINT_TOLERANCE {
            return;
        }
        let Some(market) = ctx.markets.spot_market_mut() else {
            return;
        };
        if !self.base.offers.can_offer_be_posted(
            available_kwh,
            rate * available_kwh,
            available_kwh,
            market.id(),
            true,
            None,
        ) {
            return;
        }
        self.base
            .post_offer(market, ctx.owner, rate * available_kwh, available_kwh, true);
    }

    /// Sell back over-produced energy on the settlement market.
    fn update_settlement_orders(&mut self, ctx: &mut StrategyContext<'_>) {
        let slots: Vec<TimeSlot> = ctx.markets.settlement.keys().copied().collect();
        for slot in slots {
            if !self.state.prosumption().can_post_settlement_offer(slot) {
                continue;
            }
            let Some(energy_kwh) = self.state.prosumption().get_unsettled_deviation_kwh(slot)
            else {
                continue;
            };
            let Some(market) = ctx.markets.settlement_market_mut(slot) else {
                continue;
            };
            self.base.post_offer(
                market,
                ctx.owner,
                self.final_selling_rate * energy_kwh,
                energy_kwh,
                true,
            );
        }
    }

    fn apply_commands(&mut self, ctx: &mut StrategyContext<'_>) {
        for command in self.base.pending_commands.drain() {
            match command {
                ExternalCommand::SetProductionForecast {
                    energy_kwh,
                    time_slot,
                } => {
                    let slot = time_slot.unwrap_or(ctx.current_slot);
                    self.state.set_available_energy(energy_kwh, slot, true);
                }
                ExternalCommand::SetEnergyMeasurement {
                    energy_kwh,
                    time_slot,
                } => {
                    let sold_kwh = self.state.get_energy_production_forecast_kwh(time_slot)
                        - self.state.get_available_energy_kwh(time_slot);
                    // A positive deviation means more was produced than sold.
                    self.state.prosumption_mut().set_energy_measurement_kwh(
                        energy_kwh,
                        sold_kwh - energy_kwh,
                        time_slot,
                    );
                }
                ExternalCommand::PostOffer { price, energy } => {
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        self.base.post_offer(market, ctx.owner, price, energy, false);
                    }
                }
                ExternalCommand::DeletePostedOffers => {
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        self.base.delete_open_offers(market);
                    }
                }
                other => debug!(?other, "command not applicable to a pv"),
            }
        }
    }
}

impl TradingStrategy for PvStrategy {
    fn base(&self) -> &StrategyBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StrategyBase {
        &mut self.base
    }

    fn event_activate(&mut self, ctx: &mut StrategyContext<'_>) {
        self.seed_slots(ctx);
    }

    fn event_market_cycle(&mut self, ctx: &mut StrategyContext<'_>) {
        self.seed_slots(ctx);
        self.update_spot_offer(ctx);
        if !ctx.config.retain_past_markets {
            self.state
                .delete_past_state_values(ctx.config.past_market_horizon(ctx.current_slot));
        }
    }

    fn event_tick(&mut self, ctx: &mut StrategyContext<'_>) {
        self.apply_commands(ctx);
        self.update_spot_offer(ctx);
        if ctx.config.enable_settlement_markets {
            self.update_settlement_orders(ctx);
        }
    }

    fn event_offer_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        market_id: MarketId,
        trade: &Trade,
    ) {
        if trade.seller.name != ctx.owner.name {
            return;
        }
        let is_settlement = ctx
            .markets
            .settlement
            .values()
            .any(|market| market.id() == market_id);
        if is_settlement {
            self.state
                .prosumption_mut()
                .decrement_unsettled_deviation(trade.traded_energy, trade.time_slot);
        } else {
            self.state
                .decrement_available_energy(trade.traded_energy, trade.time_slot, &ctx.owner.name);
        }
    }

    fn get_state(&self) -> Value {
        self.state.get_state()
    }

    fn restore_state(&mut self, state: &Value) -> anyhow::Result<()> {
        self.state.restore_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn forecast_peaks_at_noon_and_sleeps_at_night() {
        let pv = PvStrategy::new(4.0, None, 30.0, 5.0);
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!((pv.forecast_kwh(noon, 15) - 1.0).abs() < 1e-9);
        assert_eq!(pv.forecast_kwh(midnight, 15), 0.0);
    }

    #[test]
    fn custom_profile_overrides_the_default_curve() {
        let profile = vec![0.5; 24];
        let pv = PvStrategy::new(4.0, Some(profile), 30.0, 5.0);
        let midnight = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!((pv.forecast_kwh(midnight, 60) - 2.0).abs() < 1e-9);
    }
}
