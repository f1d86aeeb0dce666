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

//! Asset trading strategies. A strategy lives on a leaf area and trades in
//! its parent's markets: it reacts to activation, ticks and market cycles,
//! and to the market events the parent relays back down. The asset set is
//! closed, so the strategies are one enum rather than trait objects.
//!
//! Market calls made from strategies are fallible by contract; a failed
//! call is logged and swallowed so the strategy can retry on the next tick
//! with fresh ledger values.

mod load;
mod pv;
mod smart_meter;
mod storage;

use serde_json::Value;
use tracing::{debug, warn};

use gridion_types::time::TimeSlot;
use gridion_types::{MarketId, Offer, SimulationConfig, Trade, TraderDetails};

use crate::area::markets::MarketSet;
use crate::commands::PendingCommands;
use crate::events::MarketEvent;
use crate::market::Market;
use crate::orders::{BidBook, OfferBook};

pub use load::LoadStrategy;
pub use pv::PvStrategy;
pub use smart_meter::SmartMeterStrategy;
pub use storage::StorageStrategy;

/// Everything a strategy may touch while handling one event: the shared
/// configuration, its own identity, and its parent area's markets.
pub struct StrategyContext<'a> {
    pub config: &'a SimulationConfig,
    pub owner: &'a TraderDetails,
    pub markets: &'a mut MarketSet,
    pub current_slot: TimeSlot,
    /// Tick index within the current slot, `0..ticks_per_slot`.
    pub tick_in_slot: u32,
    /// Names of the other assets on the same parent, used to classify a
    /// trading partner as local or external.
    pub sibling_names: &'a [String],
}

impl StrategyContext<'_> {
    /// Linear rate ramp over the slot: starts at `initial` on the first
    /// tick and reaches `final_rate` on the last one.
    pub fn ramp_rate(&self, initial: f64, final_rate: f64) -> f64 {
        let ticks = self.config.ticks_per_slot();
        if ticks <= 1 {
            return final_rate;
        }
        let fraction = f64::from(self.tick_in_slot.min(ticks - 1)) / f64::from(ticks - 1);
        initial + (final_rate - initial) * fraction
    }
}

/// Bookkeeping shared by every asset strategy.
#[derive(Debug, Default)]
pub struct StrategyBase {
    pub offers: OfferBook,
    pub bids: BidBook,
    pub pending_commands: PendingCommands,
}

impl StrategyBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete this strategy's open offers in the market. Returns the total
    /// energy released.
    pub fn delete_open_offers(&mut self, market: &mut Market) -> f64 {
        let mut released = 0.0;
        for offer in self.offers.open_in_market(market.id(), None) {
            match market.delete_offer(offer.id) {
                Ok(deleted) => {
                    self.offers.remove(deleted.id);
                    released += deleted.energy;
                }
                Err(err) => debug!(offer = %offer.id, %err, "open offer already gone"),
            }
        }
        released
    }

    pub fn delete_posted_bids(&mut self, market: &mut Market) {
        for bid in self.bids.get_posted_bids(market.id(), None) {
            if let Err(err) = market.delete_bid(bid.id) {
                debug!(bid = %bid.id, %err, "posted bid already gone");
            }
        }
        self.bids.remove_bid_from_pending(market.id(), None);
    }

    /// Post an offer, optionally replacing the open ones first. A market
    /// rejection is logged and answered with `None`.
    pub fn post_offer(
        &mut self,
        market: &mut Market,
        owner: &TraderDetails,
        price: f64,
        energy: f64,
        replace_existing: bool,
    ) -> Option<Offer> {
        if replace_existing {
            self.delete_open_offers(market);
        }
        match market.offer(price, energy, owner.clone(), None) {
            Ok(offer) => {
                self.offers.post(offer.clone(), market.id());
                Some(offer)
            }
            Err(err) => {
                warn!(owner = %owner.name, %err, "offer rejected");
                None
            }
        }
    }

    /// Post a bid, optionally replacing the pending ones first.
    pub fn post_bid(
        &mut self,
        market: &mut Market,
        owner: &TraderDetails,
        price: f64,
        energy: f64,
        replace_existing: bool,
    ) -> Option<gridion_types::Bid> {
        if replace_existing {
            self.delete_posted_bids(market);
        }
        match market.bid(price, energy, owner.clone(), None) {
            Ok(bid) => {
                self.bids.add_bid_to_posted(market.id(), bid.clone());
                Some(bid)
            }
            Err(err) => {
                warn!(owner = %owner.name, %err, "bid rejected");
                None
            }
        }
    }

    /// Accept another trader's offer, fully or partially. Losing the race
    /// for the offer is expected and returns `None`.
    pub fn accept_offer(
        &mut self,
        market: &mut Market,
        owner: &TraderDetails,
        offer_id: gridion_types::OrderId,
        energy: Option<f64>,
    ) -> Option<Trade> {
        match market.accept_offer(offer_id, owner.clone(), energy, None) {
            Ok(trade) => {
                if let Some(offer) = &trade.offer {
                    self.offers.bought_offer(offer.clone(), market.id());
                }
                Some(trade)
            }
            Err(err) => {
                debug!(owner = %owner.name, %offer_id, %err, "accept failed");
                None
            }
        }
    }

    /// Energy this strategy has traded in a market, on either side.
    pub fn energy_traded(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.offers.sold_offer_energy(market_id, time_slot)
            + self.bids.traded_bid_energy(market_id, time_slot)
    }
}

/// Event interface every asset strategy implements. Default handlers are
/// no-ops so each asset only spells out the events it cares about.
pub trait TradingStrategy {
    fn base(&self) -> &StrategyBase;
    fn base_mut(&mut self) -> &mut StrategyBase;

    fn event_activate(&mut self, _ctx: &mut StrategyContext<'_>) {}
    fn event_market_cycle(&mut self, _ctx: &mut StrategyContext<'_>) {}
    fn event_tick(&mut self, _ctx: &mut StrategyContext<'_>) {}
    fn event_offer_traded(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _market_id: MarketId,
        _trade: &Trade,
    ) {
    }
    fn event_bid_traded(
        &mut self,
        _ctx: &mut StrategyContext<'_>,
        _market_id: MarketId,
        _trade: &Trade,
    ) {
    }
    fn event_deactivate(&mut self, _ctx: &mut StrategyContext<'_>) {}

    fn get_state(&self) -> Value;
    fn restore_state(&mut self, state: &Value) -> anyhow::Result<()>;
}

/// The closed set of tradable assets.
#[derive(Debug)]
pub enum AssetStrategy {
    Load(LoadStrategy),
    Pv(PvStrategy),
    Storage(StorageStrategy),
    SmartMeter(SmartMeterStrategy),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            AssetStrategy::Load($inner) => $body,
            AssetStrategy::Pv($inner) => $body,
            AssetStrategy::Storage($inner) => $body,
            AssetStrategy::SmartMeter($inner) => $body,
        }
    };
}

impl TradingStrategy for AssetStrategy {
    fn base(&self) -> &StrategyBase {
        delegate!(self, s => s.base())
    }

    fn base_mut(&mut self) -> &mut StrategyBase {
        delegate!(self, s => s.base_mut())
    }

    fn event_activate(&mut self, ctx: &mut StrategyContext<'_>) {
        delegate!(self, s => s.event_activate(ctx));
    }

    fn event_market_cycle(&mut self, ctx: &mut StrategyContext<'_>) {
        delegate!(self, s => s.event_market_cycle(ctx));
    }

    fn event_tick(&mut self, ctx: &mut StrategyContext<'_>) {
        delegate!(self, s => s.event_tick(ctx));
    }

    fn event_offer_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        market_id: MarketId,
        trade: &Trade,
    ) {
        delegate!(self, s => s.event_offer_traded(ctx, market_id, trade));
    }

    fn event_bid_traded(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        market_id: MarketId,
        trade: &Trade,
    ) {
        delegate!(self, s => s.event_bid_traded(ctx, market_id, trade));
    }

    fn event_deactivate(&mut self, ctx: &mut StrategyContext<'_>) {
        delegate!(self, s => s.event_deactivate(ctx));
    }

    fn get_state(&self) -> Value {
        delegate!(self, s => s.get_state())
    }

    fn restore_state(&mut self, state: &Value) -> anyhow::Result<()> {
        delegate!(self, s => s.restore_state(state))
    }
}

impl AssetStrategy {
    /// Route a market event: first the order books mirror it for orders
    /// this strategy owns, then the asset-specific handler runs.
    pub fn on_market_event(&mut self, ctx: &mut StrategyContext<'_>, event: &MarketEvent) {
        match event {
            MarketEvent::OfferTraded { market_id, trade } => {
                if trade.seller.name == ctx.owner.name {
                    self.base_mut().offers.on_trade(*market_id, trade);
                }
                self.event_offer_traded(ctx, *market_id, trade);
            }
            MarketEvent::OfferSplit {
                market_id,
                original,
                accepted,
                residual,
            } => {
                if original.seller.name == ctx.owner.name {
                    self.base_mut()
                        .offers
                        .on_offer_split(original, accepted, residual, *market_id);
                }
            }
            MarketEvent::BidTraded { market_id, trade } => {
                if let Some(bid) = &trade.bid
                    && bid.buyer.name == ctx.owner.name
                {
                    self.base_mut().bids.add_bid_to_bought(bid.clone(), *market_id);
                }
                self.event_bid_traded(ctx, *market_id, trade);
            }
            MarketEvent::BidSplit {
                market_id,
                original,
                accepted,
                residual,
            } => {
                // `accepted` reuses the original id, so swap it in place.
                if accepted.buyer.name == ctx.owner.name {
                    let base = self.base_mut();
                    base.bids.replace_bid(original.id, accepted.clone(), *market_id);
                    base.bids.add_bid_to_posted(*market_id, residual.clone());
                }
            }
            // Deletions are booked at the call site that requested them.
            MarketEvent::OfferDeleted { .. } | MarketEvent::BidDeleted { .. } => {}
        }
    }

    /// Prune the order books at a market cycle, honouring the global
    /// retention flag. The horizon keeps entries for any slot whose
    /// settlement market is still open, so replacement can find them.
    pub fn prune_books(&mut self, ctx: &StrategyContext<'_>) {
        if ctx.config.retain_past_markets {
            return;
        }
        let horizon = ctx.config.past_market_horizon(ctx.current_slot);
        let base = self.base_mut();
        base.offers.delete_past_markets_offers(horizon);
        base.bids.delete_past_markets_bids(horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn context_parts() -> (SimulationConfig, TraderDetails, MarketSet) {
        (
            SimulationConfig::default(),
            TraderDetails::new("asset", Uuid::new_v4()),
            MarketSet::new(),
        )
    }

    #[test]
    fn ramp_rate_spans_initial_to_final() {
        let (config, owner, mut markets) = context_parts();
        let slot = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let mut ctx = StrategyContext {
            config: &config,
            owner: &owner,
            markets: &mut markets,
            current_slot: slot,
            tick_in_slot: 0,
            sibling_names: &[],
        };
        assert_eq!(ctx.ramp_rate(10.0, 30.0), 10.0);
        ctx.tick_in_slot = 59;
        assert_eq!(ctx.ramp_rate(10.0, 30.0), 30.0);
        ctx.tick_in_slot = 30;
        let halfway = ctx.ramp_rate(30.0, 10.0);
        assert!(halfway < 30.0 && halfway > 10.0);
    }
}
