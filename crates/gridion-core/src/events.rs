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

//! Market events produced while orders execute. A market queues these as it
//! mutates; the owning area drains the queue after each dispatch pass and
//! delivers them to the strategies of its children. Delivery order between
//! children is unspecified by design (children never observe each other
//! mid-tick).

use gridion_types::{Bid, MarketId, Offer, Trade};

/// Notification emitted by a market instance.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    OfferTraded {
        market_id: MarketId,
        trade: Trade,
    },
    /// An offer was partially accepted. `accepted` keeps the original order
    /// id with the accepted energy portion; `residual` is a fresh order for
    /// the remainder.
    OfferSplit {
        market_id: MarketId,
        original: Offer,
        accepted: Offer,
        residual: Offer,
    },
    OfferDeleted {
        market_id: MarketId,
        offer: Offer,
    },
    BidTraded {
        market_id: MarketId,
        trade: Trade,
    },
    BidSplit {
        market_id: MarketId,
        original: Bid,
        accepted: Bid,
        residual: Bid,
    },
    BidDeleted {
        market_id: MarketId,
        bid: Bid,
    },
}
