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

//! Per-strategy order bookkeeping. Strategies never query the market to
//! learn which of their orders are still open; the books mirror every
//! posting, split and trade as the events arrive.

use std::collections::HashMap;

use tracing::warn;

use gridion_types::time::TimeSlot;
use gridion_types::{Bid, FLOATING_POINT_TOLERANCE, MarketId, Offer, OrderId, Trade};

/// Tracks a strategy's own offers plus the offers it accepted as a buyer.
///
/// `posted` holds every offer sent to a market, `sold` the traded ones per
/// market. An offer is open while posted and not sold. `split` maps the id
/// of an offer that was split to its accepted part; the id survives the
/// split, so the map also guards `post` against re-inserting it.
#[derive(Debug, Default)]
pub struct OfferBook {
    posted: HashMap<OrderId, (Offer, MarketId)>,
    sold: HashMap<MarketId, Vec<Offer>>,
    bought: HashMap<OrderId, (Offer, MarketId)>,
    split: HashMap<OrderId, Offer>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// All open offers across markets.
    pub fn open(&self) -> impl Iterator<Item = (&Offer, MarketId)> {
        self.posted.iter().filter_map(|(id, (offer, market_id))| {
            let sold_here = self
                .sold
                .get(market_id)
                .is_some_and(|sold| sold.iter().any(|o| o.id == *id));
            (!sold_here).then_some((offer, *market_id))
        })
    }

    pub fn open_in_market(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> Vec<Offer> {
        self.open()
            .filter(|(offer, market)| {
                *market == market_id && time_slot.is_none_or(|slot| offer.time_slot == slot)
            })
            .map(|(offer, _)| offer.clone())
            .collect()
    }

    pub fn posted_in_market(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> Vec<Offer> {
        self.posted
            .values()
            .filter(|(offer, market)| {
                *market == market_id && time_slot.is_none_or(|slot| offer.time_slot == slot)
            })
            .map(|(offer, _)| offer.clone())
            .collect()
    }

    pub fn sold_in_market(&self, market_id: MarketId) -> &[Offer] {
        self.sold.get(&market_id).map_or(&[], Vec::as_slice)
    }

    pub fn open_offer_energy(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.open_in_market(market_id, time_slot)
            .iter()
            .map(|offer| offer.energy)
            .sum()
    }

    pub fn posted_offer_energy(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.posted_in_market(market_id, time_slot)
            .iter()
            .map(|offer| offer.energy)
            .sum()
    }

    pub fn sold_offer_energy(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.sold_in_market(market_id)
            .iter()
            .filter(|offer| time_slot.is_none_or(|slot| offer.time_slot == slot))
            .map(|offer| offer.energy)
            .sum()
    }

    pub fn sold_offer_price(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.sold_in_market(market_id)
            .iter()
            .filter(|offer| time_slot.is_none_or(|slot| offer.time_slot == slot))
            .map(|offer| offer.price)
            .sum()
    }

    pub fn is_offer_posted(&self, market_id: MarketId, offer_id: OrderId) -> bool {
        self.posted
            .get(&offer_id)
            .is_some_and(|(_, market)| *market == market_id)
    }

    /// Feasibility gate for a new offer. With `replace_existing` the open
    /// offers do not count against the available energy, since posting will
    /// replace them.
    pub fn can_offer_be_posted(
        &self,
        offer_energy: f64,
        offer_price: f64,
        available_energy: f64,
        market_id: MarketId,
        replace_existing: bool,
        time_slot: Option<TimeSlot>,
    ) -> bool {
        let posted_energy = if replace_existing {
            0.0
        } else {
            self.posted_offer_energy(market_id, time_slot)
        };
        let total_posted_energy = offer_energy + posted_energy;
        (total_posted_energy - available_energy) < FLOATING_POINT_TOLERANCE && offer_price >= 0.0
    }

    /// Record a posted offer. Ids already seen in a split are not re-posted:
    /// the accepted part of a split keeps the original id but is traded.
    pub fn post(&mut self, offer: Offer, market_id: MarketId) {
        if !self.split.contains_key(&offer.id) {
            self.posted.insert(offer.id, (offer, market_id));
        }
    }

    /// Forget a posted offer. Returns false if the offer is unknown or has
    /// already been sold; a sold offer is restored to `posted`, since the
    /// delete raced against a trade and the trade won.
    pub fn remove(&mut self, offer_id: OrderId) -> bool {
        let Some((offer, market_id)) = self.posted.remove(&offer_id) else {
            return false;
        };
        let sold_here = self
            .sold
            .get(&market_id)
            .is_some_and(|sold| sold.iter().any(|o| o.id == offer_id));
        if sold_here {
            warn!(%offer_id, "offer already sold, cannot remove it");
            self.posted.insert(offer_id, (offer, market_id));
            return false;
        }
        true
    }

    pub fn replace(&mut self, old_offer_id: OrderId, new_offer: Offer, market_id: MarketId) {
        if self.remove(old_offer_id) {
            self.post(new_offer, market_id);
        }
    }

    pub fn bought_offer(&mut self, offer: Offer, market_id: MarketId) {
        self.bought.insert(offer.id, (offer, market_id));
    }

    pub fn sold_offer(&mut self, offer: Offer, market_id: MarketId) {
        self.sold.entry(market_id).or_default().push(offer);
    }

    /// Book a trade in which this strategy was the seller.
    pub fn on_trade(&mut self, market_id: MarketId, trade: &Trade) {
        let Some(offer) = &trade.offer else {
            return;
        };
        // A split leaves a stub under the original id; drop it before the
        // accepted part is recorded as sold.
        if self.split.contains_key(&offer.id) && self.posted.contains_key(&offer.id) {
            self.remove(offer.id);
        }
        self.sold_offer(offer.clone(), market_id);
    }

    /// Book a split of one of this strategy's offers: the residual becomes
    /// a fresh posted offer and the accepted part replaces the original if
    /// it is still open.
    pub fn on_offer_split(
        &mut self,
        original: &Offer,
        accepted: &Offer,
        residual: &Offer,
        market_id: MarketId,
    ) {
        self.split.insert(original.id, accepted.clone());
        self.post(residual.clone(), market_id);
        if self.posted.contains_key(&original.id) {
            self.replace(original.id, accepted.clone(), market_id);
        }
    }

    /// Drop bookkeeping for slots at or before the horizon. The split map
    /// is cleared wholesale; its entries only matter within the market they
    /// split in.
    pub fn delete_past_markets_offers(&mut self, horizon: TimeSlot) {
        self.posted.retain(|_, (offer, _)| offer.time_slot > horizon);
        self.bought.retain(|_, (offer, _)| offer.time_slot > horizon);
        for sold in self.sold.values_mut() {
            sold.retain(|offer| offer.time_slot > horizon);
        }
        self.sold.retain(|_, sold| !sold.is_empty());
        self.split.clear();
    }
}

/// Tracks a strategy's own bids, posted and traded, per market.
#[derive(Debug, Default)]
pub struct BidBook {
    posted: HashMap<MarketId, Vec<Bid>>,
    traded: HashMap<MarketId, Vec<Bid>>,
}

impl BidBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_posted_bids(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> Vec<Bid> {
        self.posted
            .get(&market_id)
            .into_iter()
            .flatten()
            .filter(|bid| time_slot.is_none_or(|slot| bid.time_slot == slot))
            .cloned()
            .collect()
    }

    pub fn are_bids_posted(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> bool {
        !self.get_posted_bids(market_id, time_slot).is_empty()
    }

    pub fn is_bid_posted(&self, market_id: MarketId, bid_id: OrderId) -> bool {
        self.posted
            .get(&market_id)
            .is_some_and(|bids| bids.iter().any(|bid| bid.id == bid_id))
    }

    pub fn posted_bid_energy(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.get_posted_bids(market_id, time_slot)
            .iter()
            .map(|bid| bid.energy)
            .sum()
    }

    pub fn traded_bid_energy(&self, market_id: MarketId, time_slot: Option<TimeSlot>) -> f64 {
        self.traded
            .get(&market_id)
            .into_iter()
            .flatten()
            .filter(|bid| time_slot.is_none_or(|slot| bid.time_slot == slot))
            .map(|bid| bid.energy)
            .sum()
    }

    /// Feasibility gate for a new bid, the buy-side twin of
    /// [`OfferBook::can_offer_be_posted`].
    pub fn can_bid_be_posted(
        &self,
        bid_energy: f64,
        bid_price: f64,
        required_energy_kwh: f64,
        market_id: MarketId,
        replace_existing: bool,
        time_slot: Option<TimeSlot>,
    ) -> bool {
        let posted_energy = if replace_existing {
            0.0
        } else {
            self.posted_bid_energy(market_id, time_slot)
        };
        bid_energy + posted_energy <= required_energy_kwh && bid_price >= 0.0
    }

    pub fn add_bid_to_posted(&mut self, market_id: MarketId, bid: Bid) {
        self.posted.entry(market_id).or_default().push(bid);
    }

    /// Move a bid from posted to traded.
    pub fn add_bid_to_bought(&mut self, bid: Bid, market_id: MarketId) {
        self.remove_bid_from_pending(market_id, Some(bid.id));
        self.traded.entry(market_id).or_default().push(bid);
    }

    /// Forget pending bids, either one by id or all in the market. Returns
    /// the ids that were removed.
    pub fn remove_bid_from_pending(
        &mut self,
        market_id: MarketId,
        bid_id: Option<OrderId>,
    ) -> Vec<OrderId> {
        let Some(bids) = self.posted.get_mut(&market_id) else {
            return Vec::new();
        };
        let removed: Vec<OrderId> = bids
            .iter()
            .filter(|bid| bid_id.is_none_or(|id| bid.id == id))
            .map(|bid| bid.id)
            .collect();
        bids.retain(|bid| !removed.contains(&bid.id));
        removed
    }

    pub fn replace_bid(&mut self, old_bid_id: OrderId, new_bid: Bid, market_id: MarketId) {
        self.remove_bid_from_pending(market_id, Some(old_bid_id));
        self.add_bid_to_posted(market_id, new_bid);
    }

    pub fn delete_past_markets_bids(&mut self, horizon: TimeSlot) {
        for bids in self.posted.values_mut() {
            bids.retain(|bid| bid.time_slot > horizon);
        }
        for bids in self.traded.values_mut() {
            bids.retain(|bid| bid.time_slot > horizon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use gridion_types::TraderDetails;
    use uuid::Uuid;

    fn slot(hour: u32) -> TimeSlot {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    fn offer(price: f64, energy: f64, time_slot: TimeSlot) -> Offer {
        Offer {
            id: Uuid::new_v4(),
            price,
            energy,
            seller: TraderDetails::new("pv", Uuid::new_v4()),
            time_slot,
        }
    }

    fn bid(price: f64, energy: f64, time_slot: TimeSlot) -> Bid {
        Bid {
            id: Uuid::new_v4(),
            price,
            energy,
            buyer: TraderDetails::new("load", Uuid::new_v4()),
            time_slot,
        }
    }

    fn trade_for(offer: &Offer) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            time_slot: offer.time_slot,
            seller: offer.seller.clone(),
            buyer: TraderDetails::new("load", Uuid::new_v4()),
            traded_energy: offer.energy,
            trade_price: offer.price,
            fee_price: 0.0,
            offer: Some(offer.clone()),
            bid: None,
        }
    }

    #[test]
    fn open_excludes_sold_offers() {
        let market_id = Uuid::new_v4();
        let mut book = OfferBook::new();
        let first = offer(10.0, 1.0, slot(8));
        let second = offer(12.0, 2.0, slot(8));
        book.post(first.clone(), market_id);
        book.post(second.clone(), market_id);

        book.on_trade(market_id, &trade_for(&first));
        let open = book.open_in_market(market_id, None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second.id);
        assert!((book.posted_offer_energy(market_id, None) - 3.0).abs() < 1e-9);
        assert!((book.open_offer_energy(market_id, None) - 2.0).abs() < 1e-9);
        assert!((book.sold_offer_energy(market_id, None) - 1.0).abs() < 1e-9);
        assert!((book.sold_offer_price(market_id, None) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn remove_is_idempotent_and_restores_sold_offers() {
        let market_id = Uuid::new_v4();
        let mut book = OfferBook::new();
        let own = offer(10.0, 1.0, slot(8));
        book.post(own.clone(), market_id);

        assert!(book.remove(own.id));
        assert!(!book.remove(own.id));

        // A sold offer cannot be removed; the posted entry is restored so
        // the books stay consistent with the market's trade record.
        book.post(own.clone(), market_id);
        book.on_trade(market_id, &trade_for(&own));
        assert!(!book.remove(own.id));
        assert!(book.is_offer_posted(market_id, own.id));
    }

    #[test]
    fn split_leaves_residual_posted_and_accepted_sold() {
        let market_id = Uuid::new_v4();
        let mut book = OfferBook::new();
        let original = offer(10.0, 1.0, slot(8));
        book.post(original.clone(), market_id);

        // Partial accept of 0.4 kWh: the accepted part keeps the id.
        let accepted = Offer {
            price: 4.0,
            energy: 0.4,
            ..original.clone()
        };
        let residual = offer(6.0, 0.6, slot(8));
        book.on_offer_split(&original, &accepted, &residual, market_id);
        book.on_trade(market_id, &trade_for(&accepted));

        let open = book.open_in_market(market_id, None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, residual.id);
        let sold = book.sold_in_market(market_id);
        assert_eq!(sold.len(), 1);
        assert_eq!(sold[0].id, original.id);
        assert!((sold[0].energy - 0.4).abs() < 1e-9);
    }

    #[test]
    fn replace_existing_ignores_open_energy_in_the_gate() {
        let market_id = Uuid::new_v4();
        let mut book = OfferBook::new();
        book.post(offer(10.0, 3.0, slot(8)), market_id);

        assert!(!book.can_offer_be_posted(2.5, 10.0, 5.0, market_id, false, None));
        assert!(book.can_offer_be_posted(2.5, 10.0, 5.0, market_id, true, None));
        assert!(book.can_offer_be_posted(2.0, 10.0, 5.0, market_id, false, None));
        assert!(!book.can_offer_be_posted(2.0, -1.0, 5.0, market_id, false, None));
    }

    #[test]
    fn past_markets_are_pruned() {
        let market_id = Uuid::new_v4();
        let mut book = OfferBook::new();
        let past = offer(10.0, 1.0, slot(8));
        let future = offer(10.0, 1.0, slot(8) + Duration::minutes(15));
        book.post(past.clone(), market_id);
        book.post(future.clone(), market_id);

        book.delete_past_markets_offers(slot(8));
        assert!(!book.is_offer_posted(market_id, past.id));
        assert!(book.is_offer_posted(market_id, future.id));
    }

    #[test]
    fn pruning_drops_sold_entries_with_their_market() {
        let old_market = Uuid::new_v4();
        let live_market = Uuid::new_v4();
        let mut book = OfferBook::new();
        book.sold_offer(offer(10.0, 1.0, slot(8)), old_market);
        book.sold_offer(offer(10.0, 2.0, slot(8) + Duration::minutes(15)), live_market);

        book.delete_past_markets_offers(slot(8));
        assert_eq!(book.sold_offer_energy(old_market, None), 0.0);
        assert_eq!(book.sold_offer_energy(live_market, None), 2.0);
    }

    #[test]
    fn bid_book_moves_traded_bids_out_of_pending() {
        let market_id = Uuid::new_v4();
        let mut book = BidBook::new();
        let own = bid(10.0, 1.0, slot(8));
        book.add_bid_to_posted(market_id, own.clone());
        assert!(book.is_bid_posted(market_id, own.id));

        book.add_bid_to_bought(own.clone(), market_id);
        assert!(!book.is_bid_posted(market_id, own.id));
        assert!((book.traded_bid_energy(market_id, None) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bid_gate_respects_required_energy() {
        let market_id = Uuid::new_v4();
        let mut book = BidBook::new();
        book.add_bid_to_posted(market_id, bid(10.0, 1.0, slot(8)));

        assert!(!book.can_bid_be_posted(0.5, 10.0, 1.2, market_id, false, None));
        assert!(book.can_bid_be_posted(0.5, 10.0, 1.2, market_id, true, None));
        assert!(book.can_bid_be_posted(0.2, 10.0, 1.2, market_id, false, None));
    }
}
