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
use gridion_types::{MarketId, SpotMarketType, Trade, convert_kw_to_kwh};

use crate::commands::ExternalCommand;
use crate::state::{SmartMeterState, StateInterface};

use super::{StrategyBase, StrategyContext, TradingStrategy};

/// A household meter behind which both consumption and production happen.
/// Each slot it reads its net profile: a positive value is bought like a
/// load, a negative value is sold like a generator.
#[derive(Debug)]
pub struct SmartMeterStrategy {
    base: StrategyBase,
    /// Net power per hour of day in kW, positive towards consumption.
    net_power_profile_kw: Vec<f64>,
    initial_buying_rate: f64,
    final_buying_rate: f64,
    initial_selling_rate: f64,
    final_selling_rate: f64,
    state: SmartMeterState,
}

impl SmartMeterStrategy {
    pub fn new(
        net_power_profile_kw: Vec<f64>,
        initial_buying_rate: f64,
        final_buying_rate: f64,
        initial_selling_rate: f64,
        final_selling_rate: f64,
    ) -> Self {
        Self {
            base: StrategyBase::new(),
            net_power_profile_kw,
            initial_buying_rate,
            final_buying_rate,
            initial_selling_rate,
            final_selling_rate,
            state: SmartMeterState::new(),
        }
    }

    pub fn state(&self) -> &SmartMeterState {
        &self.state
    }

    fn net_energy_kwh(&self, time_slot: TimeSlot, slot_length_minutes: u32) -> f64 {
        let power_kw = self
            .net_power_profile_kw
            .get(time_slot.hour() as usize)
            .copied()
            .unwrap_or(0.0);
        convert_kw_to_kwh(power_kw, slot_length_minutes)
    }

    /// A slot is either consuming or producing, never both.
    fn seed_slot(&mut self, time_slot: TimeSlot, slot_length_minutes: u32) {
        let net_kwh = self.net_energy_kwh(time_slot, slot_length_minutes);
        if net_kwh >= 0.0 {
            self.state
                .consumption_mut()
                .set_desired_energy(net_kwh * 1000.0, time_slot, false);
            self.state
                .production_mut()
                .set_available_energy(0.0, time_slot, false);
        } else {
            self.state
                .consumption_mut()
                .set_desired_energy(0.0, time_slot, false);
            self.state
                .production_mut()
                .set_available_energy(-net_kwh, time_slot, false);
        }
    }

    fn seed_slots(&mut self, ctx: &StrategyContext<'_>) {
        let slot_length = ctx.config.slot_length_minutes;
        self.seed_slot(ctx.current_slot, slot_length);
        self.state
            .consumption_mut()
            .update_total_demanded_energy(ctx.current_slot);
        for slot in ctx.config.future_market_slots(ctx.current_slot) {
            self.seed_slot(slot, slot_length);
        }
    }

    fn update_spot_orders(&mut self, ctx: &mut StrategyContext<'_>) {
        let slot = ctx.current_slot;
        let required_kwh = self.state.consumption().get_energy_requirement_wh(slot) / 1000.0;
        let available_kwh = self.state.production().get_available_energy_kwh(slot);

        if required_kwh > 0.0 && ctx.config.spot_market_type == SpotMarketType::TwoSided {
            let rate = ctx.ramp_rate(self.initial_buying_rate, self.final_buying_rate);
            if let Some(market) = ctx.markets.spot_market_mut() {
                self.base
                    .post_bid(market, ctx.owner, rate * required_kwh, required_kwh, true);
            }
        }
        if available_kwh > 0.0 {
            let rate = ctx.ramp_rate(self.initial_selling_rate, self.final_selling_rate);
            if let Some(market) = ctx.markets.spot_market_mut() {
                self.base.post_offer(
                    market,
                    ctx.owner,
                    rate * available_kwh,
                    available_kwh,
                    true,
                );
            }
        }
    }

    /// One-sided trading of the consumption share.
    fn accept_affordable_offers(&mut self, ctx: &mut StrategyContext<'_>) {
        let acceptable_rate = ctx.ramp_rate(self.initial_buying_rate, self.final_buying_rate);
        let slot = ctx.current_slot;
        let owner = ctx.owner.clone();
        let Some(market) = ctx.markets.spot_market_mut() else {
            return;
        };
        let mut candidates: Vec<_> = market
            .offers()
            .values()
            .filter(|offer| offer.seller.name != owner.name)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.energy_rate().total_cmp(&b.energy_rate()));

        for offer in candidates {
            if !self.state.consumption().can_buy_more_energy(slot) {
                break;
            }
            if offer.energy_rate() > acceptable_rate {
                break;
            }
            let energy_wh = self
                .state
                .consumption()
                .calculate_energy_to_accept(offer.energy * 1000.0, slot);
            let Some(trade) =
                self.base
                    .accept_offer(market, &owner, offer.id, Some(energy_wh / 1000.0))
            else {
                continue;
            };
            self.state.consumption_mut().decrement_energy_requirement(
                trade.traded_energy * 1000.0,
                slot,
                &owner.name,
            );
        }
    }

    fn apply_commands(&mut self, _ctx: &mut StrategyContext<'_>) {
        for command in self.base.pending_commands.drain() {
            match command {
                ExternalCommand::SetEnergyMeasurement {
                    energy_kwh,
                    time_slot,
                } => {
                    // A positive net measurement settles on the consumption
                    // side, a negative one on the production side.
                    if energy_kwh >= 0.0 {
                        let bought_kwh = (self
                            .state
                            .consumption()
                            .get_desired_energy_wh(time_slot)
                            - self.state.consumption().get_energy_requirement_wh(time_slot))
                            / 1000.0;
                        self.state
                            .consumption_mut()
                            .prosumption_mut()
                            .set_energy_measurement_kwh(
                                energy_kwh,
                                energy_kwh - bought_kwh,
                                time_slot,
                            );
                    } else {
                        let sold_kwh = self
                            .state
                            .production()
                            .get_energy_production_forecast_kwh(time_slot)
                            - self.state.production().get_available_energy_kwh(time_slot);
                        self.state
                            .production_mut()
                            .prosumption_mut()
                            .set_energy_measurement_kwh(
                                -energy_kwh,
                                sold_kwh + energy_kwh,
                                time_slot,
                            );
                    }
                }
                other => debug!(?other, "command not applicable to a smart meter"),
            }
        }
    }
}

impl TradingStrategy for SmartMeterStrategy {
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
        self.update_spot_orders(ctx);
        if !ctx.config.retain_past_markets {
            let horizon = ctx.config.past_market_horizon(ctx.current_slot);
            self.state.delete_past_state_values(horizon);
        }
    }

    fn event_tick(&mut self, ctx: &mut StrategyContext<'_>) {
        self.apply_commands(ctx);
        self.update_spot_orders(ctx);
        if ctx.config.spot_market_type == SpotMarketType::OneSided {
            self.accept_affordable_offers(ctx);
        }
    }

    fn event_offer_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _market_id: MarketId,
        trade: &Trade,
    ) {
        if trade.seller.name != ctx.owner.name {
            return;
        }
        self.state.production_mut().decrement_available_energy(
            trade.traded_energy,
            trade.time_slot,
            &ctx.owner.name,
        );
    }

    fn event_bid_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _market_id: MarketId,
        trade: &Trade,
    ) {
        let Some(bid) = &trade.bid else {
            return;
        };
        if bid.buyer.name != ctx.owner.name {
            return;
        }
        self.state.consumption_mut().decrement_energy_requirement(
            trade.traded_energy * 1000.0,
            trade.time_slot,
            &ctx.owner.name,
        );
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

    fn meter_with_profile(consuming_kw: f64, producing_kw: f64) -> SmartMeterStrategy {
        let mut profile = vec![consuming_kw; 24];
        profile[12] = -producing_kw;
        SmartMeterStrategy::new(profile, 10.0, 30.0, 30.0, 5.0)
    }

    #[test]
    fn positive_profile_hours_become_consumption() {
        let mut meter = meter_with_profile(2.0, 3.0);
        let slot = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        meter.seed_slot(slot, 15);
        assert!((meter.state.consumption().get_energy_requirement_wh(slot) - 500.0).abs() < 1e-9);
        assert_eq!(meter.state.production().get_available_energy_kwh(slot), 0.0);
    }

    #[test]
    fn negative_profile_hours_become_production() {
        let mut meter = meter_with_profile(2.0, 3.0);
        let slot = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        meter.seed_slot(slot, 15);
        assert_eq!(meter.state.consumption().get_energy_requirement_wh(slot), 0.0);
        assert!((meter.state.production().get_available_energy_kwh(slot) - 0.75).abs() < 1e-9);
    }
}
