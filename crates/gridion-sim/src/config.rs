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

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use gridion_core::area::{AreaId, AreaTree};
use gridion_core::strategy::{
    AssetStrategy, LoadStrategy, PvStrategy, SmartMeterStrategy, StorageStrategy,
};
use gridion_types::SimulationConfig;

/// A whole scenario: the global simulation settings plus the area tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    pub area: AreaConfig,
}

/// One node of the scenario tree. A node either carries a strategy (leaf
/// asset) or children (interior area); carrying both is rejected when the
/// tree is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    #[serde(default)]
    pub grid_fee_constant: Option<f64>,
    #[serde(default)]
    pub grid_fee_percentage: Option<f64>,
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub children: Vec<AreaConfig>,
}

/// Per-asset strategy parameters, tagged by asset type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Load {
        avg_power_w: f64,
        #[serde(default)]
        hrs_of_day: Option<Vec<u32>>,
        initial_buying_rate: f64,
        final_buying_rate: f64,
    },
    Pv {
        capacity_kw: f64,
        #[serde(default)]
        hourly_factor: Option<Vec<f64>>,
        initial_selling_rate: f64,
        final_selling_rate: f64,
    },
    Storage {
        capacity_kwh: f64,
        max_abs_battery_power_kw: f64,
        initial_soc_percent: f64,
        min_allowed_soc_percent: f64,
        initial_selling_rate: f64,
        final_selling_rate: f64,
        initial_buying_rate: f64,
        final_buying_rate: f64,
    },
    SmartMeter {
        net_power_profile_kw: Vec<f64>,
        initial_buying_rate: f64,
        final_buying_rate: f64,
        initial_selling_rate: f64,
        final_selling_rate: f64,
    },
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        let scenario: ScenarioConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse scenario file {}", path.display()))?;
        info!(
            scenario = %path.display(),
            slot_length_minutes = scenario.simulation.slot_length_minutes,
            duration_minutes = scenario.simulation.duration_minutes,
            "scenario loaded"
        );
        Ok(scenario)
    }

    /// Build the area tree the scenario describes. Tree rejections
    /// (duplicate names, misplaced strategies, bad fees) surface here.
    pub fn build_tree(&self) -> Result<AreaTree> {
        let mut tree = AreaTree::new(self.simulation.clone());
        add_node(&mut tree, None, &self.area)?;
        Ok(tree)
    }
}

fn add_node(tree: &mut AreaTree, parent: Option<AreaId>, config: &AreaConfig) -> Result<()> {
    match &config.strategy {
        Some(strategy) => {
            let parent = parent
                .with_context(|| format!("asset '{}' cannot be the root area", config.name))?;
            if !config.children.is_empty() {
                anyhow::bail!("asset '{}' cannot have children", config.name);
            }
            tree.add_asset(parent, &config.name, build_strategy(strategy))
                .with_context(|| format!("adding asset '{}'", config.name))?;
        }
        None => {
            let id = tree
                .add_area(
                    parent,
                    &config.name,
                    config.grid_fee_constant,
                    config.grid_fee_percentage,
                )
                .with_context(|| format!("adding area '{}'", config.name))?;
            for child in &config.children {
                add_node(tree, Some(id), child)?;
            }
        }
    }
    Ok(())
}

fn build_strategy(config: &StrategyConfig) -> AssetStrategy {
    match config {
        StrategyConfig::Load {
            avg_power_w,
            hrs_of_day,
            initial_buying_rate,
            final_buying_rate,
        } => AssetStrategy::Load(LoadStrategy::new(
            *avg_power_w,
            hrs_of_day.clone(),
            *initial_buying_rate,
            *final_buying_rate,
        )),
        StrategyConfig::Pv {
            capacity_kw,
            hourly_factor,
            initial_selling_rate,
            final_selling_rate,
        } => AssetStrategy::Pv(PvStrategy::new(
            *capacity_kw,
            hourly_factor.clone(),
            *initial_selling_rate,
            *final_selling_rate,
        )),
        StrategyConfig::Storage {
            capacity_kwh,
            max_abs_battery_power_kw,
            initial_soc_percent,
            min_allowed_soc_percent,
            initial_selling_rate,
            final_selling_rate,
            initial_buying_rate,
            final_buying_rate,
        } => AssetStrategy::Storage(StorageStrategy::new(
            *capacity_kwh,
            *max_abs_battery_power_kw,
            *initial_soc_percent,
            *min_allowed_soc_percent,
            *initial_selling_rate,
            *final_selling_rate,
            *initial_buying_rate,
            *final_buying_rate,
        )),
        StrategyConfig::SmartMeter {
            net_power_profile_kw,
            initial_buying_rate,
            final_buying_rate,
            initial_selling_rate,
            final_selling_rate,
        } => AssetStrategy::SmartMeter(SmartMeterStrategy::new(
            net_power_profile_kw.clone(),
            *initial_buying_rate,
            *final_buying_rate,
            *initial_selling_rate,
            *final_selling_rate,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCENARIO: &str = r#"
[simulation]
start_date = "2025-06-01T12:00:00Z"
slot_length_minutes = 15
tick_length_seconds = 15
duration_minutes = 60

[area]
name = "Grid"
grid_fee_constant = 1.0

[[area.children]]
name = "House"
grid_fee_constant = 2.0

[[area.children.children]]
name = "General Load"
[area.children.children.strategy]
type = "load"
avg_power_w = 620.0
initial_buying_rate = 10.0
final_buying_rate = 30.0

[[area.children.children]]
name = "Rooftop PV"
[area.children.children.strategy]
type = "pv"
capacity_kw = 4.0
initial_selling_rate = 30.0
final_selling_rate = 5.0
"#;

    #[test]
    fn scenario_parses_and_builds_the_tree() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();
        let scenario = ScenarioConfig::load(file.path()).unwrap();
        assert_eq!(scenario.simulation.slot_length_minutes, 15);
        assert_eq!(scenario.area.children.len(), 1);

        let tree = scenario.build_tree().unwrap();
        let root = tree.root().unwrap();
        assert_eq!(tree.name(root).unwrap(), "Grid");
        let house = tree.find_by_name("House").unwrap();
        assert_eq!(tree.children(house).unwrap().len(), 2);
    }

    #[test]
    fn partial_simulation_section_falls_back_to_defaults() {
        let scenario: ScenarioConfig = toml::from_str(
            r#"
[simulation]
duration_minutes = 30

[area]
name = "Grid"
"#,
        )
        .unwrap();
        assert_eq!(scenario.simulation.duration_minutes, 30);
        assert_eq!(scenario.simulation.slot_length_minutes, 15);
    }

    #[test]
    fn duplicate_sibling_names_are_rejected_at_build() {
        let scenario: ScenarioConfig = toml::from_str(
            r#"
[area]
name = "Grid"

[[area.children]]
name = "House"

[[area.children]]
name = "House"
"#,
        )
        .unwrap();
        assert!(scenario.build_tree().is_err());
    }
}
