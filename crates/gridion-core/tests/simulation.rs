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

//! End-to-end simulation tests: whole area trees running the slot/tick
//! loop the driver binary runs, checked against the ledger invariants.

use chrono::{Duration, TimeZone, Utc};

use gridion_core::area::{AreaId, AreaTree};
use gridion_core::commands::ExternalCommand;
use gridion_core::strategy::{AssetStrategy, LoadStrategy, PvStrategy, StorageStrategy};
use gridion_types::{SimulationConfig, SpotMarketType, TimeSlot};

fn noon_config() -> SimulationConfig {
    SimulationConfig {
        start_date: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        slot_length_minutes: 15,
        tick_length_seconds: 60,
        duration_minutes: 45,
        ..SimulationConfig::default()
    }
}

fn load() -> AssetStrategy {
    AssetStrategy::Load(LoadStrategy::new(620.0, None, 10.0, 30.0))
}

fn pv() -> AssetStrategy {
    AssetStrategy::Pv(PvStrategy::new(4.0, None, 30.0, 5.0))
}

fn storage() -> AssetStrategy {
    AssetStrategy::Storage(StorageStrategy::new(
        100.0, 400.0, 99.0, 10.0, 30.0, 20.0, 10.0, 25.0,
    ))
}

/// Runs the same loop as the driver binary: market cycle at each slot
/// boundary, then tick/advance for every tick of the slot.
fn run_slots(tree: &mut AreaTree, slots: u32) {
    let ticks_per_slot = tree.config().ticks_per_slot();
    for _ in 0..slots {
        tree.cycle_markets(true, true, false);
        for _ in 0..ticks_per_slot {
            tree.tick_and_dispatch();
            tree.execute_actions_after_tick_event();
        }
    }
}

fn load_requirement_wh(tree: &AreaTree, area: AreaId, slot: TimeSlot) -> f64 {
    match tree.strategy(area).unwrap().unwrap() {
        AssetStrategy::Load(strategy) => strategy.state().get_energy_requirement_wh(slot),
        _ => panic!("not a load"),
    }
}

#[test]
fn two_sided_run_clears_the_load_requirement() {
    let mut tree = AreaTree::new(noon_config());
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let load_id = tree.add_asset(root, "load", load()).unwrap();
    tree.add_asset(root, "pv", pv()).unwrap();
    tree.activate();

    let first_slot = tree.config().start_date;
    run_slots(&mut tree, 1);

    // 620 W over 15 minutes is 155 Wh, fully covered by the pv's noon kWh.
    assert_eq!(load_requirement_wh(&tree, load_id, first_slot), 0.0);
    let spot = tree.markets(root).unwrap().unwrap().spot_market().unwrap();
    let traded: f64 = spot
        .trades()
        .iter()
        .map(|trade| trade.traded_energy)
        .sum();
    assert!((traded - 0.155).abs() < 1e-9);
}

#[test]
fn orders_reposted_at_a_slot_boundary_remain_replaceable() {
    let mut tree = AreaTree::new(noon_config());
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let load_id = tree.add_asset(root, "load", load()).unwrap();
    tree.add_asset(root, "pv", pv()).unwrap();
    tree.activate();

    let start = tree.config().start_date;
    run_slots(&mut tree, 3);

    // If the books were pruned after the cycle handler reposts, each
    // boundary bid would be orphaned in the market, duplicated on the next
    // tick and over-bought. Every slot must land exactly at zero.
    for slot_index in 0..3 {
        let slot = start + Duration::minutes(15 * slot_index);
        assert_eq!(load_requirement_wh(&tree, load_id, slot), 0.0);
    }
}

#[test]
fn one_sided_run_lets_the_load_accept_offers() {
    let mut tree = AreaTree::new(SimulationConfig {
        spot_market_type: SpotMarketType::OneSided,
        ..noon_config()
    });
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let load_id = tree.add_asset(root, "load", load()).unwrap();
    tree.add_asset(root, "pv", pv()).unwrap();
    tree.activate();

    let first_slot = tree.config().start_date;
    run_slots(&mut tree, 1);

    assert_eq!(load_requirement_wh(&tree, load_id, first_slot), 0.0);
    let spot = tree.markets(root).unwrap().unwrap().spot_market().unwrap();
    assert!(!spot.trades().is_empty());
    for trade in spot.trades() {
        assert_eq!(trade.seller.name, "pv");
        assert_eq!(trade.buyer.name, "load");
        // One-sided trades come from accepted offers, never from bids.
        assert!(trade.bid.is_none());
    }
}

#[test]
fn storage_offers_its_sellable_pool_on_the_first_slot() {
    let mut tree = AreaTree::new(noon_config());
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let storage_id = tree.add_asset(root, "battery", storage()).unwrap();
    tree.activate();

    let first_slot = tree.config().start_date;
    tree.cycle_markets(true, true, false);

    // Capacity 100 kWh at 99 % SOC with a 10 % floor leaves 89 kWh to
    // sell, within the 400 kW power budget.
    let offered = match tree.strategy(storage_id).unwrap().unwrap() {
        AssetStrategy::Storage(strategy) => strategy.state().offered_sell_kwh(first_slot),
        _ => panic!("not a storage"),
    };
    assert!((offered - 89.0).abs() < 1e-9);
    let spot = tree.markets(root).unwrap().unwrap().spot_market().unwrap();
    let posted: f64 = spot.offers().values().map(|offer| offer.energy).sum();
    assert!((posted - 89.0).abs() < 1e-9);
}

#[test]
fn storage_charge_stays_within_its_bounds_across_a_run() {
    let mut tree = AreaTree::new(noon_config());
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let storage_id = tree.add_asset(root, "battery", storage()).unwrap();
    tree.add_asset(root, "load", load()).unwrap();
    tree.add_asset(root, "pv", pv()).unwrap();
    tree.activate();

    // check_state runs every market cycle and asserts the invariants; the
    // run completing is the main assertion here.
    run_slots(&mut tree, 3);

    let state = match tree.strategy(storage_id).unwrap().unwrap() {
        AssetStrategy::Storage(strategy) => strategy.state(),
        _ => panic!("not a storage"),
    };
    assert!(state.used_storage() <= state.capacity() + 1e-9);
    assert!(state.used_storage() >= 10.0 - 1e-9);
}

#[test]
fn rotation_moves_each_spot_market_to_past_exactly_once() {
    let mut tree = AreaTree::new(SimulationConfig {
        retain_past_markets: true,
        ..noon_config()
    });
    let root = tree.add_area(None, "grid", None, None).unwrap();
    tree.add_asset(root, "load", load()).unwrap();
    tree.activate();

    run_slots(&mut tree, 3);
    // Rotate the last finished slot as well.
    tree.cycle_markets(true, true, false);

    let markets = tree.markets(root).unwrap().unwrap();
    assert_eq!(markets.past_spot.len(), 3);
    assert_eq!(markets.spot.len(), 1);
    for market in markets.past_spot.values() {
        assert!(market.is_readonly());
    }
}

#[test]
fn measured_deviation_turns_into_a_settlement_bid() {
    let mut tree = AreaTree::new(SimulationConfig {
        enable_settlement_markets: true,
        settlement_market_max_age_hours: 1,
        // Midnight start: the pv is dark, so the load buys nothing and the
        // whole measurement becomes deviation.
        start_date: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        slot_length_minutes: 15,
        tick_length_seconds: 300,
        duration_minutes: 45,
        ..SimulationConfig::default()
    });
    let root = tree.add_area(None, "grid", None, None).unwrap();
    let load_id = tree.add_asset(root, "load", load()).unwrap();
    tree.add_asset(root, "pv", pv()).unwrap();
    tree.activate();

    let first_slot = tree.config().start_date;
    run_slots(&mut tree, 1);

    // The meter reports 0.5 kWh consumed in a slot where nothing was
    // bought.
    let sender = tree.command_sender(load_id).unwrap();
    sender.send(ExternalCommand::SetEnergyMeasurement {
        energy_kwh: 0.5,
        time_slot: first_slot,
    });

    run_slots(&mut tree, 1);

    let markets = tree.markets(root).unwrap().unwrap();
    let settlement = markets
        .settlement
        .get(&first_slot)
        .expect("settlement market for the rotated slot");
    let bid_energy: f64 = settlement.bids().values().map(|bid| bid.energy).sum();
    assert!((bid_energy - 0.5).abs() < 1e-9);
}

#[test]
fn full_tree_snapshot_round_trips_after_a_run() {
    let mut tree = AreaTree::new(noon_config());
    let root = tree.add_area(None, "grid", Some(1.0), None).unwrap();
    let house = tree.add_area(Some(root), "house", Some(2.0), None).unwrap();
    tree.add_asset(house, "load", load()).unwrap();
    tree.add_asset(house, "pv", pv()).unwrap();
    tree.add_asset(house, "battery", storage()).unwrap();
    tree.activate();

    run_slots(&mut tree, 2);

    let snapshot = tree.get_state();
    tree.restore_state(&snapshot).unwrap();
    assert_eq!(tree.get_state(), snapshot);
}
