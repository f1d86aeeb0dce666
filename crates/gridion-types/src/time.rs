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

//! Time-slot handling. Markets and ledgers are keyed by the start time of a
//! fixed-duration market slot. State snapshots serialize slot keys as
//! ISO-like strings that must round-trip exactly.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Start time of a market slot, in simulated time.
pub type TimeSlot = DateTime<Utc>;

const TIME_SLOT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format a time slot as the canonical string key used in state snapshots.
pub fn format_time_slot(time_slot: TimeSlot) -> String {
    time_slot.format(TIME_SLOT_FORMAT).to_string()
}

/// Parse a state-snapshot key back into a time slot.
pub fn parse_time_slot(value: &str) -> Result<TimeSlot> {
    let naive = NaiveDateTime::parse_from_str(value, TIME_SLOT_FORMAT)
        .with_context(|| format!("invalid time slot key: {value}"))?;
    Ok(naive.and_utc())
}
