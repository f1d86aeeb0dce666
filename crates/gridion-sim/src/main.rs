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

mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use gridion_core::area::AreaTree;
use gridion_types::format_time_slot;

/// GridION - hierarchical local energy market simulator
#[derive(Debug, Parser)]
#[command(name = "gridion", version)]
struct Cli {
    /// Path to the TOML scenario file
    scenario: PathBuf,

    /// Snapshot the tree state after the run, restore it and verify that
    /// the round trip is lossless, then print the snapshot to stdout
    #[arg(long)]
    snapshot: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with env filter support
    // Respects RUST_LOG environment variable
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let scenario = config::ScenarioConfig::load(&cli.scenario)?;
    let mut tree = scenario.build_tree()?;
    tree.activate();

    run(&mut tree)?;

    if cli.snapshot {
        let snapshot = tree.get_state();
        tree.restore_state(&snapshot)?;
        anyhow::ensure!(
            tree.get_state() == snapshot,
            "state snapshot did not round-trip"
        );
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    tree.deactivate();
    info!("simulation finished");
    Ok(())
}

fn run(tree: &mut AreaTree) -> Result<()> {
    let config = tree.config().clone();
    let ticks_per_slot = config.ticks_per_slot();
    let total_ticks = config.duration_minutes * 60 / config.tick_length_seconds;
    info!(
        total_ticks,
        ticks_per_slot,
        start = %format_time_slot(config.start_date),
        "starting simulation"
    );

    for tick in 0..total_ticks {
        if tick % ticks_per_slot == 0 {
            tree.cycle_markets(true, true, false);
        }
        tree.tick_and_dispatch();
        tree.execute_actions_after_tick_event();
        if (tick + 1) % ticks_per_slot == 0 {
            log_slot_summary(tree, config.slot_at_tick(tick));
        }
    }
    Ok(())
}

/// Per-slot trade summary of every market-operating area.
fn log_slot_summary(tree: &AreaTree, time_slot: gridion_types::TimeSlot) {
    for area in tree.areas() {
        let Ok(Some(markets)) = tree.markets(area) else {
            continue;
        };
        let Some(spot) = markets.spot.get(&time_slot) else {
            continue;
        };
        let stats = spot.stats();
        let name = tree.name(area).unwrap_or("?");
        info!(
            area = %name,
            slot = %format_time_slot(time_slot),
            trades = stats.trade_count,
            energy_kwh = format!("{:.4}", stats.accumulated_trade_energy),
            avg_rate = format!("{:.2}", stats.avg_trade_rate()),
            fees = format!("{:.4}", stats.accumulated_fees),
            "slot cleared"
        );
    }
}
