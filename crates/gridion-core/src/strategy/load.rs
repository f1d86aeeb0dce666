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

use gridion_types::SpotMarketType;
use gridion_types::time::TimeSlot;
use gridion_types::{MarketId, Trade};

use crate::commands::ExternalCommand;
use crate::state::{ConsumptionState, StateInterface};

use super::{StrategyBase, StrategyContext, TradingStrategy};

/// A consuming asset with a flat power draw during its active hours.
///
/// In two-sided markets it keeps one open bid whose rate ramps from
/// `initial_buying_rate` to `final_buying_rate` over the slot. In one-sided
/// markets it accepts offers priced at or below the current ramp rate.
#[derive(Debug)]
pub struct LoadStrategy {
    base: StrategyBase,
    avg_power_w: f64,
    /// Hours of day during which the load draws power; `None` means always.
    hrs_of_day: Option<Vec<u32>>,
    initial_buying_rate: f64,
    final_buying_rate: f64,
    state: ConsumptionState,
}

impl LoadStrategy {
    pub fn new(
        avg_power_w: f64,
        hrs_of_day: Option<Vec<u32>>,
        initial_buying_rate: f64,
        final_buying_rate: f64,
    ) -> Self {
        Self {
            base: StrategyBase::new(),
            avg_power_w,
            hrs_of_day,
            initial_buying_rate,
            final_buying_rate,
            state: ConsumptionState::new(),
        }
    }

    pub fn state(&self) -> &ConsumptionState {
        &self.state
    }

    fn desired_energy_wh(&self, time_slot: TimeSlot, slot_length_minutes: u32) -> f64 {
        let active = self
            .hrs_of_day
            .as_ref()
            .is_none_or(|hours| hours.contains(&time_slot.hour()));
        if active {
            self.avg_power_w * f64::from(slot_length_minutes) / 60.0
        } else {
            0.0
        }
    }

    fn seed_slots(&mut self, ctx: &StrategyContext<'_>) {
        let slot_length = ctx.config.slot_length_minutes;
        let energy = self.desired_energy_wh(ctx.current_slot, slot_length);
        self.state.set_desired_energy(energy, ctx.current_slot, false);
        self.state.update_total_demanded_energy(ctx.current_slot);
        for slot in ctx.config.future_market_slots(ctx.current_slot) {
            let energy = self.desired_energy_wh(slot, slot_length);
            self.state.set_desired_energy(energy, slot, false);
        }
    }

    fn required_energy_kwh(&self, time_slot: TimeSlot) -> f64 {
        self.state.get_energy_requirement_wh(time_slot) / 1000.0
    }

    /// Keep a single open bid for the remaining requirement.
    fn update_spot_bid(&mut self, ctx: &mut StrategyContext<'_>) {
        let rate = ctx.ramp_rate(self.initial_buying_rate, self.final_buying_rate);
        let slot = ctx.current_slot;
        let energy_kwh = self.required_energy_kwh(slot);
        let Some(market) = ctx.markets.spot_market_mut() else {
            return;
        };
        if !self.state.can_buy_more_energy(slot) {
            return;
        }
        if !self
            .base
            .bids
            .can_bid_be_posted(energy_kwh, rate * energy_kwh, energy_kwh, market.id(), true, None)
        {
            return;
        }
        self.base
            .post_bid(market, ctx.owner, rate * energy_kwh, energy_kwh, true);
    }

    /// One-sided trading: accept the cheapest affordable offers until the
    /// slot requirement is covered.
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
            if !self.state.can_buy_more_energy(slot) {
                break;
            }
            if offer.energy_rate() > acceptable_rate {
                break;
            }
            let energy_wh = self
                .state
                .calculate_energy_to_accept(offer.energy * 1000.0, slot);
            let Some(trade) =
                self.base
                    .accept_offer(market, &owner, offer.id, Some(energy_wh / 1000.0))
            else {
                continue;
            };
            self.state
                .decrement_energy_requirement(trade.traded_energy * 1000.0, slot, &owner.name);
        }
    }

    /// Buy back under-bought energy on the settlement market.
    fn update_settlement_orders(&mut self, ctx: &mut StrategyContext<'_>) {
        let slots: Vec<TimeSlot> = ctx.markets.settlement.keys().copied().collect();
        for slot in slots {
            if !self.state.prosumption().can_post_settlement_bid(slot) {
                continue;
            }
            let Some(energy_kwh) = self.state.prosumption().get_unsettled_deviation_kwh(slot)
            else {
                continue;
            };
            let Some(market) = ctx.markets.settlement_market_mut(slot) else {
                continue;
            };
            self.base.post_bid(
                market,
                ctx.owner,
                self.final_buying_rate * energy_kwh,
                energy_kwh,
                true,
            );
        }
    }

    fn apply_commands(&mut self, ctx: &mut StrategyContext<'_>) {
        for command in self.base.pending_commands.drain() {
            match command {
                ExternalCommand::SetDesiredEnergy {
                    energy_wh,
                    time_slot,
                } => {
                    let slot = time_slot.unwrap_or(ctx.current_slot);
                    self.state.set_desired_energy(energy_wh, slot, true);
                }
                ExternalCommand::SetEnergyMeasurement {
                    energy_kwh,
                    time_slot,
                } => {
                    let bought_kwh = (self.state.get_desired_energy_wh(time_slot)
                        - self.state.get_energy_requirement_wh(time_slot))
                        / 1000.0;
                    self.state.prosumption_mut().set_energy_measurement_kwh(
                        energy_kwh,
                        energy_kwh - bought_kwh,
                        time_slot,
                    );
                }
                ExternalCommand::PostBid { price, energy } => {
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        self.base.post_bid(market, ctx.owner, price, energy, false);
                    }
                }
                ExternalCommand::DeletePostedBids => {
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        self.base.delete_posted_bids(market);
                    }
                }
                other => debug!(?other, "command not applicable to a load"),
            }
        }
    }
}

impl TradingStrategy for LoadStrategy {
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
        if ctx.config.spot_market_type == SpotMarketType::TwoSided {
            self.update_spot_bid(ctx);
        }
        if !ctx.config.retain_past_markets {
            self.state
                .delete_past_state_values(ctx.config.past_market_horizon(ctx.current_slot));
        }
    }

    fn event_tick(&mut self, ctx: &mut StrategyContext<'_>) {
        self.apply_commands(ctx);
        match ctx.config.spot_market_type {
            SpotMarketType::OneSided => self.accept_affordable_offers(ctx),
            SpotMarketType::TwoSided => self.update_spot_bid(ctx),
        }
        if ctx.config.enable_settlement_markets {
            self.update_settlement_orders(ctx);
        }
    }

    fn event_bid_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        market_id: MarketId,
        trade: &Trade,
    ) {
        let Some(bid) = &trade.bid else {
            return;
        };
        if bid.buyer.name != ctx.owner.name {
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
            self.state.decrement_energy_requirement(
                trade.traded_energy * 1000.0,
                trade.time_slot,
                &ctx.owner.name,
            );
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
    fn slot_requirement_follows_the_power_draw() {
        // 620 W over a 15 minute slot is 155 Wh.
        let load = LoadStrategy::new(620.0, None, 10.0, 30.0);
        let slot = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        assert!((load.desired_energy_wh(slot, 15) - 155.0).abs() < 1e-9);
    }

    #[test]
    fn inactive_hours_require_nothing() {
        let load = LoadStrategy::new(620.0, Some(vec![18, 19, 20]), 10.0, 30.0);
        let morning = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2025, 6, 1, 19, 0, 0).unwrap();
        assert_eq!(load.desired_energy_wh(morning, 15), 0.0);
        assert!((load.desired_energy_wh(evening, 15) - 155.0).abs() < 1e-9);
    }
}
