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

//! GridION engine: the area tree, its time-sliced markets and the per-asset
//! trading strategies with their energy ledgers and order bookkeeping.

pub mod area;
pub mod commands;
pub mod error;
pub mod events;
pub mod market;
pub mod orders;
pub mod state;
pub mod strategy;

pub use area::{AreaId, AreaReconfigure, AreaTree};
pub use commands::{CommandSender, ExternalCommand, PendingCommands};
pub use error::{AreaError, MarketError};
pub use events::MarketEvent;
pub use market::{GridFee, Market, MarketStats};
pub use orders::{BidBook, OfferBook};
pub use state::{
    ConsumptionState, EnergyOrigin, ProductionState, SmartMeterState, StateInterface, StorageState,
};
pub use strategy::{
    AssetStrategy, LoadStrategy, PvStrategy, SmartMeterStrategy, StorageStrategy, StrategyContext,
    TradingStrategy,
};
