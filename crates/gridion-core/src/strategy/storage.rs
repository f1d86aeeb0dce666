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

use serde_json::Value;
use tracing::debug;

use gridion_types::time::TimeSlot;
use gridion_types::{FLOATING_POINT_TOLERANCE, MarketId, SpotMarketType, Trade};

use crate::commands::ExternalCommand;
use crate::state::{EnergyOrigin, StateInterface, StorageState};

use super::{StrategyBase, StrategyContext, TradingStrategy};

/// A battery trading on both sides of the market: it offers its stored
/// energy at rates ramping down from `initial_selling_rate` and bids for
/// free capacity at rates ramping up to `final_buying_rate`.
#[derive(Debug)]
pub struct StorageStrategy {
    base: StrategyBase,
    initial_selling_rate: f64,
    final_selling_rate: f64,
    initial_buying_rate: f64,
    final_buying_rate: f64,
    state: StorageState,
    previous_slot: Option<TimeSlot>,
}

impl StorageStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capacity_kwh: f64,
        max_abs_battery_power_kw: f64,
        initial_soc_percent: f64,
        min_allowed_soc_percent: f64,
        initial_selling_rate: f64,
        final_selling_rate: f64,
        initial_buying_rate: f64,
        final_buying_rate: f64,
    ) -> Self {
        Self {
            base: StrategyBase::new(),
            initial_selling_rate,
            final_selling_rate,
            initial_buying_rate,
            final_buying_rate,
            state: StorageState::new(
                capacity_kwh,
                max_abs_battery_power_kw,
                initial_soc_percent,
                min_allowed_soc_percent,
                EnergyOrigin::Unknown,
            ),
            previous_slot: None,
        }
    }

    pub fn state(&self) -> &StorageState {
        &self.state
    }

    fn energy_origin(&self, ctx: &StrategyContext<'_>, counterpart: &str) -> EnergyOrigin {
        if ctx.sibling_names.iter().any(|name| name == counterpart) {
            EnergyOrigin::Local
        } else {
            EnergyOrigin::External
        }
    }

    /// Replace the open sell offer with one covering the currently
    /// sellable energy at the ramped rate.
    fn update_sell_offer(&mut self, ctx: &mut StrategyContext<'_>) {
        let rate = ctx.ramp_rate(self.initial_selling_rate, self.final_selling_rate);
        let slot = ctx.current_slot;
        let Some(market) = ctx.markets.spot_market_mut() else {
            return;
        };
        let released = self.base.delete_open_offers(market);
        if released > FLOATING_POINT_TOLERANCE {
            self.state.remove_energy_from_deleted_offer(released, slot);
        }
        let energy_kwh = self.state.get_available_energy_to_sell_kwh(slot);
        if energy_kwh <= FLOATING_POINT_TOLERANCE {
            return;
        }
        if self
            .base
            .post_offer(market, ctx.owner, rate * energy_kwh, energy_kwh, false)
            .is_some()
        {
            self.state.register_energy_from_posted_offer(energy_kwh, slot);
        }
    }

    /// Replace the open buy bid with one covering the currently buyable
    /// energy at the ramped rate. Two-sided markets only.
    fn update_buy_bid(&mut self, ctx: &mut StrategyContext<'_>) {
        let rate = ctx.ramp_rate(self.initial_buying_rate, self.final_buying_rate);
        let slot = ctx.current_slot;
        let Some(market) = ctx.markets.spot_market_mut() else {
            return;
        };
        self.base.delete_posted_bids(market);
        self.state.reset_offered_buy_energy(0.0, slot);
        let energy_kwh = self.state.get_available_energy_to_buy_kwh(slot);
        if energy_kwh <= FLOATING_POINT_TOLERANCE {
            return;
        }
        if self
            .base
            .post_bid(market, ctx.owner, rate * energy_kwh, energy_kwh, false)
            .is_some()
        {
            self.state.register_energy_from_posted_bid(energy_kwh, slot);
        }
    }

    /// One-sided trading: buy the cheapest offers that undercut the
    /// current buying ramp, up to the battery's charge budget.
    fn buy_cheap_offers(&mut self, ctx: &mut StrategyContext<'_>) {
        let acceptable_rate = ctx.ramp_rate(self.initial_buying_rate, self.final_buying_rate);
        let slot = ctx.current_slot;
        let owner = ctx.owner.clone();
        let sellers: Vec<_> = {
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
            candidates
        };

        for offer in sellers {
            if offer.energy_rate() > acceptable_rate {
                break;
            }
            let buyable = self.state.get_available_energy_to_buy_kwh(slot);
            if buyable <= FLOATING_POINT_TOLERANCE {
                break;
            }
            let energy = offer.energy.min(buyable);
            let origin = self.energy_origin(ctx, &offer.seller.name);
            let Some(market) = ctx.markets.spot_market_mut() else {
                return;
            };
            if let Some(trade) = self.base.accept_offer(market, &owner, offer.id, Some(energy)) {
                self.state.register_energy_from_one_sided_market_accept_offer(
                    trade.traded_energy,
                    slot,
                    origin,
                );
            }
        }
    }

    fn apply_commands(&mut self, ctx: &mut StrategyContext<'_>) {
        for command in self.base.pending_commands.drain() {
            match command {
                ExternalCommand::PostOffer { price, energy } => {
                    let slot = ctx.current_slot;
                    if let Some(market) = ctx.markets.spot_market_mut()
                        && self
                            .base
                            .post_offer(market, ctx.owner, price, energy, false)
                            .is_some()
                    {
                        self.state.register_energy_from_posted_offer(energy, slot);
                    }
                }
                ExternalCommand::PostBid { price, energy } => {
                    let slot = ctx.current_slot;
                    if let Some(market) = ctx.markets.spot_market_mut()
                        && self
                            .base
                            .post_bid(market, ctx.owner, price, energy, false)
                            .is_some()
                    {
                        self.state.register_energy_from_posted_bid(energy, slot);
                    }
                }
                ExternalCommand::DeletePostedOffers => {
                    let slot = ctx.current_slot;
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        let released = self.base.delete_open_offers(market);
                        self.state.remove_energy_from_deleted_offer(released, slot);
                    }
                }
                ExternalCommand::DeletePostedBids => {
                    let slot = ctx.current_slot;
                    if let Some(market) = ctx.markets.spot_market_mut() {
                        self.base.delete_posted_bids(market);
                        self.state.reset_offered_buy_energy(0.0, slot);
                    }
                }
                other => debug!(?other, "command not applicable to a storage"),
            }
        }
    }
}

impl TradingStrategy for StorageStrategy {
    fn base(&self) -> &StrategyBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StrategyBase {
        &mut self.base
    }

    fn event_activate(&mut self, ctx: &mut StrategyContext<'_>) {
        self.state
            .activate(ctx.config.slot_length_minutes, ctx.current_slot);
        let mut slots = vec![ctx.current_slot];
        slots.extend(ctx.config.future_market_slots(ctx.current_slot));
        self.state.add_default_values_to_state_profiles(&slots);
        self.previous_slot = Some(ctx.current_slot);
    }

    fn event_market_cycle(&mut self, ctx: &mut StrategyContext<'_>) {
        let future_slots = ctx.config.future_market_slots(ctx.current_slot);
        let past = self.previous_slot.filter(|slot| *slot != ctx.current_slot);
        self.state.market_cycle(past, ctx.current_slot, &future_slots);
        self.state.check_state(ctx.current_slot);
        self.previous_slot = Some(ctx.current_slot);

        self.update_sell_offer(ctx);
        if ctx.config.spot_market_type == SpotMarketType::TwoSided {
            self.update_buy_bid(ctx);
        }
        if !ctx.config.retain_past_markets {
            self.state
                .delete_past_state_values(ctx.config.past_market_horizon(ctx.current_slot));
        }
    }

    fn event_tick(&mut self, ctx: &mut StrategyContext<'_>) {
        self.apply_commands(ctx);
        self.update_sell_offer(ctx);
        match ctx.config.spot_market_type {
            SpotMarketType::OneSided => self.buy_cheap_offers(ctx),
            SpotMarketType::TwoSided => self.update_buy_bid(ctx),
        }
        // External commands bypass the clamp gates; audit every tick so a
        // divergence never survives past the tick it was introduced in.
        self.state.check_state(ctx.current_slot);
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
        self.state
            .register_energy_from_offer_trade(trade.traded_energy, trade.time_slot);
    }

    fn event_bid_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        _market_id: MarketId,
        trade: &Trade,
    ) {
        if trade.buyer.name != ctx.owner.name {
            return;
        }
        let origin = self.energy_origin(ctx, &trade.seller.name);
        self.state
            .register_energy_from_bid_trade(trade.traded_energy, trade.time_slot, origin);
    }

    fn event_deactivate(&mut self, ctx: &mut StrategyContext<'_>) {
        // Finalise the charge history for the last slot.
        self.state.check_state(ctx.current_slot);
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
    use gridion_types::TraderDetails;
    use uuid::Uuid;

    #[test]
    fn counterparties_in_the_same_area_count_as_local() {
        let strategy = StorageStrategy::new(100.0, 10.0, 50.0, 10.0, 30.0, 20.0, 10.0, 25.0);
        let config = gridion_types::SimulationConfig::default();
        let owner = TraderDetails::new("battery", Uuid::new_v4());
        let mut markets = crate::area::markets::MarketSet::new();
        let siblings = vec!["pv".to_owned(), "load".to_owned()];
        let ctx = StrategyContext {
            config: &config,
            owner: &owner,
            markets: &mut markets,
            current_slot: config.start_date,
            tick_in_slot: 0,
            sibling_names: &siblings,
        };
        assert_eq!(strategy.energy_origin(&ctx, "pv"), EnergyOrigin::Local);
        assert_eq!(strategy.energy_origin(&ctx, "grid"), EnergyOrigin::External);
    }

    #[test]
    #[should_panic(expected = "per-slot commitment")]
    fn an_oversized_external_bid_is_caught_on_the_same_tick() {
        let mut strategy = StorageStrategy::new(100.0, 400.0, 50.0, 10.0, 30.0, 20.0, 10.0, 25.0);
        let mut config = gridion_types::SimulationConfig::default();
        config.spot_market_type = SpotMarketType::OneSided;
        let owner = TraderDetails::new("battery", Uuid::new_v4());
        let mut markets = crate::area::markets::MarketSet::new();
        markets.create_new_spot_market(config.start_date, crate::market::GridFee::Constant(0.0));
        let siblings: Vec<String> = Vec::new();
        let sender = strategy.base.pending_commands.sender();
        let mut ctx = StrategyContext {
            config: &config,
            owner: &owner,
            markets: &mut markets,
            current_slot: config.start_date,
            tick_in_slot: 0,
            sibling_names: &siblings,
        };
        strategy.event_activate(&mut ctx);

        // Posted past the clamp gates; the per-tick audit must trip on it.
        sender.send(ExternalCommand::PostBid {
            price: 10.0,
            energy: 500.0,
        });
        strategy.event_tick(&mut ctx);
    }
}
