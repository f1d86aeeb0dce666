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

//! One market instance: one area, one kind, one time slot. Offers can be
//! accepted directly (one-sided trading) or matched against bids pay-as-bid
//! (two-sided trading). Mutations queue [`MarketEvent`]s which the owning
//! area drains and delivers to its children after each dispatch pass.

use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use gridion_types::time::TimeSlot;
use gridion_types::{
    Bid, FLOATING_POINT_TOLERANCE, MarketId, MarketKind, Offer, OrderId, Trade, TraderDetails,
};

use crate::error::MarketError;
use crate::events::MarketEvent;

type Result<T> = std::result::Result<T, MarketError>;

/// Grid fee applied by the market's area. A constant fee is cents per kWh;
/// a percentage fee scales the order rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GridFee {
    Constant(f64),
    Percentage(f64),
}

impl GridFee {
    /// Mark up an incoming offer rate with this market's fee.
    fn update_incoming_offer_rate(&self, rate: f64) -> f64 {
        match self {
            Self::Constant(fee) => rate + fee,
            Self::Percentage(percent) => rate * (1.0 + percent / 100.0),
        }
    }

    /// Mark down an incoming bid rate with this market's fee.
    fn update_incoming_bid_rate(&self, rate: f64) -> f64 {
        match self {
            Self::Constant(fee) => rate - fee,
            Self::Percentage(percent) => rate * (1.0 - percent / 100.0),
        }
    }

    /// Fee share of a trade, in cents.
    fn trade_fee(&self, energy: f64, trade_price: f64) -> f64 {
        match self {
            Self::Constant(fee) => fee * energy,
            Self::Percentage(percent) => percent / 100.0 * trade_price,
        }
    }
}

/// Aggregated per-market trade statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarketStats {
    pub accumulated_trade_energy: f64,
    pub accumulated_trade_price: f64,
    pub accumulated_fees: f64,
    pub trade_count: usize,
}

impl MarketStats {
    pub fn avg_trade_rate(&self) -> f64 {
        if self.accumulated_trade_energy == 0.0 {
            0.0
        } else {
            self.accumulated_trade_price / self.accumulated_trade_energy
        }
    }
}

#[derive(Debug)]
pub struct Market {
    id: MarketId,
    kind: MarketKind,
    time_slot: TimeSlot,
    grid_fee: GridFee,
    readonly: bool,
    offers: HashMap<OrderId, Offer>,
    bids: HashMap<OrderId, Bid>,
    trades: Vec<Trade>,
    stats: MarketStats,
    pending_events: Vec<MarketEvent>,
}

impl Market {
    pub fn new(kind: MarketKind, time_slot: TimeSlot, grid_fee: GridFee) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            time_slot,
            grid_fee,
            readonly: false,
            offers: HashMap::new(),
            bids: HashMap::new(),
            trades: Vec::new(),
            stats: MarketStats::default(),
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> MarketId {
        self.id
    }

    pub fn kind(&self) -> MarketKind {
        self.kind
    }

    pub fn time_slot(&self) -> TimeSlot {
        self.time_slot
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Freeze the market. Called exactly once, on rotation to past.
    pub fn set_readonly(&mut self) {
        self.readonly = true;
    }

    pub fn offers(&self) -> &HashMap<OrderId, Offer> {
        &self.offers
    }

    pub fn bids(&self) -> &HashMap<OrderId, Bid> {
        &self.bids
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn stats(&self) -> MarketStats {
        self.stats
    }

    /// Take the queued notifications; the owning area delivers them.
    pub fn drain_events(&mut self) -> Vec<MarketEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MarketError::ReadOnly);
        }
        Ok(())
    }

    /// Post a sell order. The price is marked up with the market's grid
    /// fee; a price that turns negative after fees is rejected.
    pub fn offer(
        &mut self,
        price: f64,
        energy: f64,
        seller: TraderDetails,
        time_slot: Option<TimeSlot>,
    ) -> Result<Offer> {
        self.ensure_writable()?;
        if energy <= 0.0 {
            return Err(MarketError::InvalidOrder(format!(
                "offer energy must be positive, got {energy}"
            )));
        }
        let rate = self.grid_fee.update_incoming_offer_rate(price / energy);
        let price = rate * energy;
        if price < 0.0 {
            return Err(MarketError::InvalidOrder(
                "negative offer price after fees".into(),
            ));
        }
        let offer = Offer {
            id: Uuid::new_v4(),
            price,
            energy,
            seller,
            time_slot: time_slot.unwrap_or(self.time_slot),
        };
        debug!(market = %self.id, slot = %offer.time_slot, seller = %offer.seller.name,
               energy = offer.energy, price = offer.price, "offer posted");
        self.offers.insert(offer.id, offer.clone());
        Ok(offer)
    }

    // Re-insertion path used by splits; keeps the id and skips fee markup.
    fn insert_offer(
        &mut self,
        id: OrderId,
        price: f64,
        energy: f64,
        seller: TraderDetails,
        time_slot: TimeSlot,
    ) -> Offer {
        let offer = Offer {
            id,
            price,
            energy,
            seller,
            time_slot,
        };
        self.offers.insert(offer.id, offer.clone());
        offer
    }

    pub fn delete_offer(&mut self, offer_id: OrderId) -> Result<Offer> {
        self.ensure_writable()?;
        let offer = self
            .offers
            .remove(&offer_id)
            .ok_or(MarketError::OfferNotFound(offer_id))?;
        debug!(market = %self.id, %offer_id, "offer deleted");
        self.pending_events.push(MarketEvent::OfferDeleted {
            market_id: self.id,
            offer: offer.clone(),
        });
        Ok(offer)
    }

    /// Post a buy order. The price is marked down with the market's grid
    /// fee, so the seller side sees the rate net of this area's fee.
    pub fn bid(
        &mut self,
        price: f64,
        energy: f64,
        buyer: TraderDetails,
        time_slot: Option<TimeSlot>,
    ) -> Result<Bid> {
        self.ensure_writable()?;
        if energy <= 0.0 {
            return Err(MarketError::InvalidOrder(format!(
                "bid energy must be positive, got {energy}"
            )));
        }
        let rate = self.grid_fee.update_incoming_bid_rate(price / energy);
        let price = rate * energy;
        if price < 0.0 {
            return Err(MarketError::InvalidOrder(
                "negative bid price after fees".into(),
            ));
        }
        let bid = Bid {
            id: Uuid::new_v4(),
            price,
            energy,
            buyer,
            time_slot: time_slot.unwrap_or(self.time_slot),
        };
        debug!(market = %self.id, slot = %bid.time_slot, buyer = %bid.buyer.name,
               energy = bid.energy, price = bid.price, "bid posted");
        self.bids.insert(bid.id, bid.clone());
        Ok(bid)
    }

    pub fn delete_bid(&mut self, bid_id: OrderId) -> Result<Bid> {
        self.ensure_writable()?;
        let bid = self
            .bids
            .remove(&bid_id)
            .ok_or(MarketError::BidNotFound(bid_id))?;
        debug!(market = %self.id, %bid_id, "bid deleted");
        self.pending_events.push(MarketEvent::BidDeleted {
            market_id: self.id,
            bid: bid.clone(),
        });
        Ok(bid)
    }

    /// Split an offer: the accepted part keeps the original id, the
    /// residual gets a fresh one. Both re-enter the book; the caller
    /// removes the accepted part again when it trades.
    fn split_offer(&mut self, original: &Offer, energy: f64) -> (Offer, Offer) {
        self.offers.remove(&original.id);
        let portion = energy / original.energy;
        let accepted = self.insert_offer(
            original.id,
            original.price * portion,
            energy,
            original.seller.clone(),
            original.time_slot,
        );
        let residual = self.insert_offer(
            Uuid::new_v4(),
            original.price * (1.0 - portion),
            original.energy - energy,
            original.seller.clone(),
            original.time_slot,
        );
        debug!(market = %self.id, original = %original.id, residual = %residual.id,
               accepted_energy = accepted.energy, residual_energy = residual.energy,
               "offer split");
        self.pending_events.push(MarketEvent::OfferSplit {
            market_id: self.id,
            original: original.clone(),
            accepted: accepted.clone(),
            residual: residual.clone(),
        });
        (accepted, residual)
    }

    fn split_bid(&mut self, original: &Bid, energy: f64) -> (Bid, Bid) {
        self.bids.remove(&original.id);
        let portion = energy / original.energy;
        let accepted = Bid {
            id: original.id,
            price: original.price * portion,
            energy,
            buyer: original.buyer.clone(),
            time_slot: original.time_slot,
        };
        let residual = Bid {
            id: Uuid::new_v4(),
            price: original.price * (1.0 - portion),
            energy: original.energy - energy,
            buyer: original.buyer.clone(),
            time_slot: original.time_slot,
        };
        self.bids.insert(accepted.id, accepted.clone());
        self.bids.insert(residual.id, residual.clone());
        debug!(market = %self.id, original = %original.id, residual = %residual.id,
               "bid split");
        self.pending_events.push(MarketEvent::BidSplit {
            market_id: self.id,
            original: original.clone(),
            accepted: accepted.clone(),
            residual: residual.clone(),
        });
        (accepted, residual)
    }

    /// Accept an offer, fully or partially. `energy` of `None` (or within
    /// 1e-8 of the offered amount) accepts the whole offer; less splits it
    /// first. `trade_rate` defaults to the offer rate.
    pub fn accept_offer(
        &mut self,
        offer_id: OrderId,
        buyer: TraderDetails,
        energy: Option<f64>,
        trade_rate: Option<f64>,
    ) -> Result<Trade> {
        self.ensure_writable()?;
        let offer = self
            .offers
            .get(&offer_id)
            .cloned()
            .ok_or(MarketError::OfferNotFound(offer_id))?;

        let energy = match energy {
            Some(e) if (e - offer.energy).abs() > 1e-8 => e,
            _ => offer.energy,
        };
        if energy <= 0.0 {
            return Err(MarketError::InvalidOrder("traded energy must be positive".into()));
        }
        if energy > offer.energy {
            return Err(MarketError::InvalidOrder(format!(
                "traded energy ({energy}) exceeds offered energy ({})",
                offer.energy
            )));
        }
        let trade_rate = trade_rate.unwrap_or_else(|| offer.energy_rate());

        let accepted = if energy < offer.energy {
            let (accepted, _residual) = self.split_offer(&offer, energy);
            accepted
        } else {
            offer
        };
        self.offers.remove(&accepted.id);

        let trade_price = energy * trade_rate;
        let fee_price = self.grid_fee.trade_fee(energy, trade_price);
        let trade = Trade {
            id: Uuid::new_v4(),
            time_slot: accepted.time_slot,
            seller: accepted.seller.clone(),
            buyer,
            traded_energy: energy,
            trade_price,
            fee_price,
            offer: Some(accepted),
            bid: None,
        };
        self.record_trade(&trade);
        info!(market = %self.id, slot = %trade.time_slot, seller = %trade.seller.name,
              buyer = %trade.buyer.name, energy = trade.traded_energy,
              price = trade.trade_price, "offer traded");
        self.pending_events.push(MarketEvent::OfferTraded {
            market_id: self.id,
            trade: trade.clone(),
        });
        Ok(trade)
    }

    /// Accept a bid, splitting first on partial amounts. The bid-side twin
    /// of [`Market::accept_offer`]. `track_stats` is false when the trade
    /// was already counted through the paired offer acceptance.
    fn accept_bid_internal(
        &mut self,
        bid_id: OrderId,
        seller: TraderDetails,
        energy: Option<f64>,
        trade_rate: Option<f64>,
        track_stats: bool,
    ) -> Result<Trade> {
        self.ensure_writable()?;
        let bid = self
            .bids
            .get(&bid_id)
            .cloned()
            .ok_or(MarketError::BidNotFound(bid_id))?;

        let energy = match energy {
            Some(e) if (e - bid.energy).abs() > 1e-8 => e,
            _ => bid.energy,
        };
        if energy <= 0.0 {
            return Err(MarketError::InvalidOrder("traded energy must be positive".into()));
        }
        if energy > bid.energy {
            return Err(MarketError::InvalidOrder(format!(
                "traded energy ({energy}) exceeds bid energy ({})",
                bid.energy
            )));
        }
        let trade_rate = trade_rate.unwrap_or_else(|| bid.energy_rate());

        let accepted = if energy < bid.energy {
            let (accepted, _residual) = self.split_bid(&bid, energy);
            accepted
        } else {
            bid
        };
        self.bids.remove(&accepted.id);

        let trade_price = energy * trade_rate;
        let fee_price = self.grid_fee.trade_fee(energy, trade_price);
        let trade = Trade {
            id: Uuid::new_v4(),
            time_slot: accepted.time_slot,
            seller,
            buyer: accepted.buyer.clone(),
            traded_energy: energy,
            trade_price,
            fee_price,
            offer: None,
            bid: Some(accepted),
        };
        if track_stats {
            self.record_trade(&trade);
        }
        info!(market = %self.id, slot = %trade.time_slot, seller = %trade.seller.name,
              buyer = %trade.buyer.name, energy = trade.traded_energy,
              price = trade.trade_price, "bid traded");
        self.pending_events.push(MarketEvent::BidTraded {
            market_id: self.id,
            trade: trade.clone(),
        });
        Ok(trade)
    }

    pub fn accept_bid(
        &mut self,
        bid_id: OrderId,
        seller: TraderDetails,
        energy: Option<f64>,
        trade_rate: Option<f64>,
    ) -> Result<Trade> {
        self.accept_bid_internal(bid_id, seller, energy, trade_rate, true)
    }

    fn record_trade(&mut self, trade: &Trade) {
        self.stats.accumulated_trade_energy += trade.traded_energy;
        self.stats.accumulated_trade_price += trade.trade_price;
        self.stats.accumulated_fees += trade.fee_price;
        self.stats.trade_count += 1;
        self.trades.push(trade.clone());
    }

    /// Cheapest offer and priciest bid that still cross, ignoring
    /// self-trades. `None` when the book no longer clears.
    fn best_crossing_pair(&self) -> Option<(OrderId, OrderId)> {
        let mut offers: Vec<&Offer> = self.offers.values().collect();
        offers.sort_by(|a, b| a.energy_rate().total_cmp(&b.energy_rate()));
        let mut bids: Vec<&Bid> = self.bids.values().collect();
        bids.sort_by(|a, b| b.energy_rate().total_cmp(&a.energy_rate()));

        for bid in &bids {
            for offer in &offers {
                if offer.seller.name == bid.buyer.name {
                    continue;
                }
                if offer.energy_rate() - bid.energy_rate() <= FLOATING_POINT_TOLERANCE {
                    return Some((bid.id, offer.id));
                }
            }
        }
        None
    }

    /// Pay-as-bid clearing pass: repeatedly trade the best crossing
    /// bid/offer pair at the bid's rate until the book no longer crosses.
    /// Returns whether any trade happened.
    pub fn match_pay_as_bid(&mut self) -> Result<bool> {
        self.ensure_writable()?;
        let mut were_trades_performed = false;
        while let Some((bid_id, offer_id)) = self.best_crossing_pair() {
            let bid = self.bids[&bid_id].clone();
            let offer = self.offers[&offer_id].clone();
            let selected_energy = bid.energy.min(offer.energy);
            let clearing_rate = bid.energy_rate();

            self.accept_offer(
                offer_id,
                bid.buyer.clone(),
                Some(selected_energy),
                Some(clearing_rate),
            )?;
            self.accept_bid_internal(
                bid_id,
                offer.seller.clone(),
                Some(selected_energy),
                Some(clearing_rate),
                false,
            )?;
            were_trades_performed = true;
        }
        Ok(were_trades_performed)
    }
}
