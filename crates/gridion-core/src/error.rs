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

//! Error types of the engine.
//!
//! Two recoverable classes live here: tree/configuration rejections
//! (`AreaError`) and market-call failures (`MarketError`). Market failures
//! are transient by contract; strategies log them and retry on the next tick
//! with fresh ledger values. Ledger invariant violations are *not* errors —
//! they are fatal assertions, because a ledger that disagrees with the
//! market cannot be recovered from.

use gridion_types::{OrderId, TimeSlot};
use thiserror::Error;

/// Rejections raised while building or reconfiguring the area tree. These
/// are reported before any state is mutated; a rejected operation never
/// partially applies.
#[derive(Debug, Error)]
pub enum AreaError {
    #[error("area name '{0}' is not unique inside its parent area")]
    DuplicateName(String),

    #[error("area '{0}' has both a strategy and children")]
    StrategyWithChildren(String),

    #[error("strategy on area '{0}' without a parent")]
    MissingParent(String),

    #[error("invalid grid fee configuration for area '{area}': {reason}")]
    InvalidFees { area: String, reason: String },

    #[error("unknown area handle")]
    UnknownArea,
}

/// Failures of calls into a market instance. The "already gone" variants
/// are the expected losers of the race between a cancellation request and a
/// concurrent trade; callers treat them as a no-op and retry next tick.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("offer {0} is no longer in the market")]
    OfferNotFound(OrderId),

    #[error("bid {0} is no longer in the market")]
    BidNotFound(OrderId),

    #[error("market is read-only (already rotated to past)")]
    ReadOnly,

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("no market for time slot {0}")]
    MarketNotFound(TimeSlot),
}
