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

//! The area tree. Interior areas operate markets, leaf areas host one
//! trading strategy each and trade in their parent's markets. The tree is
//! an arena: nodes live in one vector and refer to each other by handle,
//! which keeps parent/child traversal free of ownership cycles.

pub mod markets;

use anyhow::{Context, bail};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gridion_types::{DispatchOrder, FeeType, SimulationConfig, SpotMarketType, TraderDetails};

use crate::error::AreaError;
use crate::events::MarketEvent;
use crate::market::GridFee;
use crate::strategy::{AssetStrategy, StrategyContext, TradingStrategy};

use markets::MarketSet;

/// Handle into the area arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaId(usize);

/// Runtime fee update. Validated as a whole before anything is mutated.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaReconfigure {
    pub grid_fee_constant: Option<f64>,
    pub grid_fee_percentage: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Inactive,
    Active,
    Deactivated,
}

#[derive(Debug)]
struct AreaNode {
    name: String,
    uuid: Uuid,
    slug: String,
    parent: Option<AreaId>,
    children: Vec<AreaId>,
    grid_fee_constant: Option<f64>,
    grid_fee_percentage: Option<f64>,
    /// Present on interior areas once activated.
    markets: Option<MarketSet>,
    strategy: Option<AssetStrategy>,
    current_tick: u32,
    stage: Lifecycle,
}

/// The whole simulated grid: configuration plus the arena of areas.
#[derive(Debug)]
pub struct AreaTree {
    config: SimulationConfig,
    nodes: Vec<AreaNode>,
}

fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn validate_fees(
    name: &str,
    constant: Option<f64>,
    percentage: Option<f64>,
) -> Result<(), AreaError> {
    if constant.is_some() && percentage.is_some() {
        return Err(AreaError::InvalidFees {
            area: name.to_owned(),
            reason: "both constant and percentage fees set".to_owned(),
        });
    }
    if constant.is_some_and(|fee| fee < 0.0) || percentage.is_some_and(|fee| fee < 0.0) {
        return Err(AreaError::InvalidFees {
            area: name.to_owned(),
            reason: "negative fee".to_owned(),
        });
    }
    if percentage.is_some_and(|fee| fee > 100.0) {
        return Err(AreaError::InvalidFees {
            area: name.to_owned(),
            reason: "percentage fee above 100".to_owned(),
        });
    }
    Ok(())
}

impl AreaTree {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn root(&self) -> Option<AreaId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(AreaId(0))
        }
    }

    /// All areas, in insertion order (parents before their children).
    pub fn areas(&self) -> impl Iterator<Item = AreaId> + use<> {
        (0..self.nodes.len()).map(AreaId)
    }

    pub fn name(&self, area: AreaId) -> Result<&str, AreaError> {
        Ok(&self.node(area)?.name)
    }

    pub fn children(&self, area: AreaId) -> Result<&[AreaId], AreaError> {
        Ok(&self.node(area)?.children)
    }

    pub fn markets(&self, area: AreaId) -> Result<Option<&MarketSet>, AreaError> {
        Ok(self.node(area)?.markets.as_ref())
    }

    pub fn strategy(&self, area: AreaId) -> Result<Option<&AssetStrategy>, AreaError> {
        Ok(self.node(area)?.strategy.as_ref())
    }

    pub fn find_by_name(&self, name: &str) -> Option<AreaId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(AreaId)
    }

    fn node(&self, area: AreaId) -> Result<&AreaNode, AreaError> {
        self.nodes.get(area.0).ok_or(AreaError::UnknownArea)
    }

    fn node_mut(&mut self, area: AreaId) -> Result<&mut AreaNode, AreaError> {
        self.nodes.get_mut(area.0).ok_or(AreaError::UnknownArea)
    }

    /// Add an interior (market-operating) area. The first area added
    /// becomes the root and must not name a parent.
    pub fn add_area(
        &mut self,
        parent: Option<AreaId>,
        name: &str,
        grid_fee_constant: Option<f64>,
        grid_fee_percentage: Option<f64>,
    ) -> Result<AreaId, AreaError> {
        validate_fees(name, grid_fee_constant, grid_fee_percentage)?;
        self.validate_placement(parent, name)?;
        let id = AreaId(self.nodes.len());
        self.nodes.push(AreaNode {
            name: name.to_owned(),
            uuid: Uuid::new_v4(),
            slug: slugify(name),
            parent,
            children: Vec::new(),
            grid_fee_constant,
            grid_fee_percentage,
            markets: None,
            strategy: None,
            current_tick: 0,
            stage: Lifecycle::Inactive,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        Ok(id)
    }

    /// Add a leaf area hosting one asset strategy. Assets trade in their
    /// parent's markets, so a parent is mandatory.
    pub fn add_asset(
        &mut self,
        parent: AreaId,
        name: &str,
        strategy: AssetStrategy,
    ) -> Result<AreaId, AreaError> {
        self.node(parent)?;
        if self.nodes[parent.0].strategy.is_some() {
            return Err(AreaError::StrategyWithChildren(
                self.nodes[parent.0].name.clone(),
            ));
        }
        self.validate_placement(Some(parent), name)?;
        let id = AreaId(self.nodes.len());
        self.nodes.push(AreaNode {
            name: name.to_owned(),
            uuid: Uuid::new_v4(),
            slug: slugify(name),
            parent: Some(parent),
            children: Vec::new(),
            grid_fee_constant: None,
            grid_fee_percentage: None,
            markets: None,
            strategy: Some(strategy),
            current_tick: 0,
            stage: Lifecycle::Inactive,
        });
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    fn validate_placement(&self, parent: Option<AreaId>, name: &str) -> Result<(), AreaError> {
        match parent {
            Some(parent) => {
                let parent_node = self.node(parent)?;
                if parent_node.strategy.is_some() {
                    return Err(AreaError::StrategyWithChildren(parent_node.name.clone()));
                }
                let duplicate = parent_node
                    .children
                    .iter()
                    .any(|child| self.nodes[child.0].name == name);
                if duplicate {
                    return Err(AreaError::DuplicateName(name.to_owned()));
                }
            }
            None => {
                if !self.nodes.is_empty() {
                    return Err(AreaError::MissingParent(name.to_owned()));
                }
            }
        }
        Ok(())
    }

    /// The fee model an area's markets apply, selected by the global fee
    /// type. Areas without an explicit fee trade fee-free.
    fn effective_grid_fee(&self, area: AreaId) -> GridFee {
        let node = &self.nodes[area.0];
        match self.config.grid_fee_type {
            FeeType::Constant => GridFee::Constant(node.grid_fee_constant.unwrap_or(0.0)),
            FeeType::Percentage => GridFee::Percentage(node.grid_fee_percentage.unwrap_or(0.0)),
        }
    }

    /// Sum of the constant fees of every market-operating area from `area`
    /// up to the root. Percentage fees apply inside each market and are
    /// never summed along the path.
    pub fn get_path_to_root_fees(&self, area: AreaId) -> Result<f64, AreaError> {
        let mut total = 0.0;
        let mut cursor = Some(area);
        while let Some(id) = cursor {
            let node = self.node(id)?;
            if !node.children.is_empty() || node.markets.is_some() {
                total += node.grid_fee_constant.unwrap_or(0.0);
            }
            cursor = node.parent;
        }
        Ok(total)
    }

    /// Update an area's fees at runtime. The whole update is validated
    /// first; a rejected reconfiguration leaves the area untouched.
    pub fn area_reconfigure_event(
        &mut self,
        area: AreaId,
        reconfigure: AreaReconfigure,
    ) -> Result<(), AreaError> {
        let node = self.node(area)?;
        let constant = reconfigure.grid_fee_constant.or(node.grid_fee_constant);
        let percentage = reconfigure
            .grid_fee_percentage
            .or(node.grid_fee_percentage);
        // A reconfiguration may switch the model, so a new constant fee
        // displaces an old percentage fee and vice versa.
        let (constant, percentage) = match (
            reconfigure.grid_fee_constant,
            reconfigure.grid_fee_percentage,
        ) {
            (Some(_), None) => (constant, None),
            (None, Some(_)) => (None, percentage),
            _ => (constant, percentage),
        };
        if let Err(err) = validate_fees(&node.name, constant, percentage) {
            warn!(area = %node.name, %err, "reconfiguration rejected");
            return Err(err);
        }
        let node = self.node_mut(area)?;
        node.grid_fee_constant = constant;
        node.grid_fee_percentage = percentage;
        info!(area = %node.name, ?constant, ?percentage, "area fees reconfigured");
        Ok(())
    }

    /// Activate the whole tree: interior areas open their first markets,
    /// every strategy receives the activation event. Markets are cycled
    /// without triggering the market-cycle event, matching the contract
    /// that activation is observable exactly once.
    pub fn activate(&mut self) {
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            if node.stage != Lifecycle::Inactive {
                continue;
            }
            node.stage = Lifecycle::Active;
            if !node.children.is_empty() {
                node.markets = Some(MarketSet::new());
            }
        }
        self.cycle_markets(false, false, false);
        for index in 0..self.nodes.len() {
            let area = AreaId(index);
            if self.nodes[index].strategy.is_none() {
                continue;
            }
            self.with_strategy(area, |strategy, ctx| strategy.event_activate(ctx));
        }
        info!(areas = self.nodes.len(), "area tree activated");
    }

    /// One market cycle over the whole tree: rotate expired markets, open
    /// the new slot's markets, then broadcast the cycle to the strategies
    /// of every area whose markets changed.
    pub fn cycle_markets(&mut self, trigger_event: bool, market_cycle: bool, deactivate: bool) {
        for index in 0..self.nodes.len() {
            let area = AreaId(index);
            if self.nodes[index].stage != Lifecycle::Active
                || self.nodes[index].markets.is_none()
            {
                continue;
            }
            let current_slot = self.config.slot_at_tick(self.nodes[index].current_tick);
            let grid_fee = self.effective_grid_fee(area);
            let future_slots = self.config.future_market_slots(current_slot);
            let balancing_enabled = self.config.enable_balancing_markets
                && !self.config.balancing_device_registry.is_empty();

            let node = &mut self.nodes[index];
            let Some(markets) = node.markets.as_mut() else {
                continue;
            };
            markets.rotate(current_slot, &self.config, grid_fee);
            let mut changed = markets.create_new_spot_market(current_slot, grid_fee);
            if balancing_enabled {
                // Balancing availability is tracked separately so a
                // balancing-only change still triggers the broadcast.
                let changed_balancing =
                    markets.create_new_balancing_market(current_slot, grid_fee);
                changed = changed || changed_balancing;
            }
            markets.create_future_markets(&future_slots, grid_fee);

            if !changed && !market_cycle && !deactivate {
                continue;
            }
            if trigger_event || deactivate {
                for child in self.nodes[index].children.clone() {
                    if self.nodes[child.0].strategy.is_none() {
                        continue;
                    }
                    self.with_strategy(child, |strategy, ctx| {
                        if deactivate {
                            strategy.event_deactivate(ctx);
                        } else {
                            // Prune first: the cycle handler posts orders
                            // for the slot that just opened, and those must
                            // stay in the books for later replacement.
                            strategy.prune_books(ctx);
                            strategy.event_market_cycle(ctx);
                        }
                    });
                }
                self.dispatch_market_events(area);
            }
        }
    }

    /// One tick of a single interior area: relay the tick to its asset
    /// children and run the pay-as-bid pass in two-sided mode. Whether
    /// matching runs before or after the children's order updates is a
    /// configuration switch.
    fn tick(&mut self, area: AreaId) {
        if self.nodes[area.0].markets.is_none() {
            return;
        }
        if self.config.match_before_market_update {
            self.match_spot_market(area);
        }
        for child in self.nodes[area.0].children.clone() {
            if self.nodes[child.0].strategy.is_none() {
                continue;
            }
            self.with_strategy(child, |strategy, ctx| strategy.event_tick(ctx));
            // One-sided accepts trade immediately; relay before the next
            // sibling acts on a stale book.
            self.dispatch_market_events(area);
        }
        if !self.config.match_before_market_update {
            self.match_spot_market(area);
        }
    }

    fn match_spot_market(&mut self, area: AreaId) {
        if self.config.spot_market_type != SpotMarketType::TwoSided {
            return;
        }
        let name = self.nodes[area.0].name.clone();
        let Some(markets) = self.nodes[area.0].markets.as_mut() else {
            return;
        };
        let mut matched = false;
        if let Some(spot) = markets.spot_market_mut() {
            match spot.match_pay_as_bid() {
                Ok(did_match) => matched = did_match,
                Err(err) => debug!(area = %name, %err, "matching skipped"),
            }
        }
        for market in markets.settlement.values_mut() {
            if let Ok(did_match) = market.match_pay_as_bid() {
                matched = matched || did_match;
            }
        }
        if matched {
            self.dispatch_market_events(area);
        }
    }

    /// Walk the tree and tick every interior area, honouring the global
    /// dispatch order: top-down ticks a parent before its children,
    /// bottom-up the reverse.
    pub fn tick_and_dispatch(&mut self) {
        let Some(root) = self.root() else { return };
        self.tick_recursive(root);
    }

    fn tick_recursive(&mut self, area: AreaId) {
        let interior_children: Vec<AreaId> = self.nodes[area.0]
            .children
            .iter()
            .copied()
            .filter(|child| !self.nodes[child.0].children.is_empty())
            .collect();
        match self.config.dispatch_order {
            DispatchOrder::TopDown => {
                self.tick(area);
                for child in interior_children {
                    self.tick_recursive(child);
                }
            }
            DispatchOrder::BottomUp => {
                for child in interior_children {
                    self.tick_recursive(child);
                }
                self.tick(area);
            }
        }
    }

    /// Post-tick bookkeeping: every area's clock advances by one tick.
    pub fn execute_actions_after_tick_event(&mut self) {
        for node in &mut self.nodes {
            if node.stage == Lifecycle::Active {
                node.current_tick += 1;
            }
        }
    }

    /// Final market cycle plus strategy teardown. Safe to call once; a
    /// deactivated tree ignores further lifecycle calls.
    pub fn deactivate(&mut self) {
        self.cycle_markets(true, true, true);
        for node in &mut self.nodes {
            if node.stage == Lifecycle::Active {
                node.stage = Lifecycle::Deactivated;
            }
        }
        info!("area tree deactivated");
    }

    /// Drain the pending events of an area's markets and relay each one to
    /// every asset child. Event handlers only mutate ledgers and order
    /// books, so one drain pass cannot produce new events; the loop covers
    /// events raised while a previous batch was being delivered.
    fn dispatch_market_events(&mut self, area: AreaId) {
        loop {
            let events: Vec<MarketEvent> = {
                let Some(markets) = self.nodes[area.0].markets.as_mut() else {
                    return;
                };
                markets
                    .active_markets_mut()
                    .flat_map(|market| market.drain_events())
                    .collect()
            };
            if events.is_empty() {
                return;
            }
            for child in self.nodes[area.0].children.clone() {
                if self.nodes[child.0].strategy.is_none() {
                    continue;
                }
                self.with_strategy(child, |strategy, ctx| {
                    for event in &events {
                        strategy.on_market_event(ctx, event);
                    }
                });
            }
        }
    }

    /// Run `f` on a leaf's strategy with a context borrowing its parent's
    /// markets. The strategy is taken out of the arena for the call so the
    /// parent node can be borrowed mutably alongside it.
    fn with_strategy(
        &mut self,
        area: AreaId,
        f: impl FnOnce(&mut AssetStrategy, &mut StrategyContext<'_>),
    ) {
        let Some(parent) = self.nodes[area.0].parent else {
            warn!(area = %self.nodes[area.0].name, "strategy without a parent area");
            return;
        };
        let Some(mut strategy) = self.nodes[area.0].strategy.take() else {
            return;
        };
        let owner = TraderDetails::new(self.nodes[area.0].name.clone(), self.nodes[area.0].uuid);
        let sibling_names: Vec<String> = self.nodes[parent.0]
            .children
            .iter()
            .filter(|child| child.0 != area.0)
            .map(|child| self.nodes[child.0].name.clone())
            .collect();
        let current_tick = self.nodes[area.0].current_tick;
        let current_slot = self.config.slot_at_tick(current_tick);
        let tick_in_slot = current_tick % self.config.ticks_per_slot();

        if let Some(markets) = self.nodes[parent.0].markets.as_mut() {
            let mut ctx = StrategyContext {
                config: &self.config,
                owner: &owner,
                markets,
                current_slot,
                tick_in_slot,
                sibling_names: &sibling_names,
            };
            f(&mut strategy, &mut ctx);
        }
        self.nodes[area.0].strategy = Some(strategy);
    }

    /// Snapshot of the whole tree: one nested object per area with its
    /// clock and, for leaves, the strategy's ledger state.
    pub fn get_state(&self) -> Value {
        match self.root() {
            Some(root) => self.area_state(root),
            None => Value::Null,
        }
    }

    fn area_state(&self, area: AreaId) -> Value {
        let node = &self.nodes[area.0];
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|child| self.area_state(*child))
            .collect();
        let mut state = json!({
            "name": node.name,
            "slug": node.slug,
            "current_tick": node.current_tick,
        });
        if let Some(strategy) = &node.strategy {
            state["strategy"] = strategy.get_state();
        }
        if !children.is_empty() {
            state["children"] = Value::Array(children);
        }
        state
    }

    /// Restore a snapshot produced by [`AreaTree::get_state`]. The tree
    /// shape must match; areas are paired by name.
    pub fn restore_state(&mut self, state: &Value) -> anyhow::Result<()> {
        let Some(root) = self.root() else {
            bail!("cannot restore into an empty tree");
        };
        self.restore_area_state(root, state)
    }

    fn restore_area_state(&mut self, area: AreaId, state: &Value) -> anyhow::Result<()> {
        let name = state
            .get("name")
            .and_then(Value::as_str)
            .context("area snapshot without a name")?;
        if name != self.nodes[area.0].name {
            bail!(
                "snapshot area '{name}' does not match tree area '{}'",
                self.nodes[area.0].name
            );
        }
        self.nodes[area.0].current_tick = state
            .get("current_tick")
            .and_then(Value::as_u64)
            .context("area snapshot without current_tick")? as u32;
        if let Some(strategy_state) = state.get("strategy") {
            let mut strategy = self.nodes[area.0]
                .strategy
                .take()
                .with_context(|| format!("snapshot has strategy state for plain area '{name}'"))?;
            let restored = strategy.restore_state(strategy_state);
            self.nodes[area.0].strategy = Some(strategy);
            restored.with_context(|| format!("restoring strategy of '{name}'"))?;
        }
        let empty = Vec::new();
        let snapshot_children = state
            .get("children")
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let children = self.nodes[area.0].children.clone();
        if snapshot_children.len() != children.len() {
            bail!("snapshot child count mismatch under '{name}'");
        }
        for (child, child_state) in children.into_iter().zip(snapshot_children) {
            self.restore_area_state(child, child_state)?;
        }
        Ok(())
    }

    /// Queue handle for submitting out-of-band commands to a leaf's
    /// strategy. Commands apply at the start of the strategy's next tick.
    pub fn command_sender(&self, area: AreaId) -> Result<crate::commands::CommandSender, AreaError> {
        let node = self.node(area)?;
        match &node.strategy {
            Some(strategy) => Ok(strategy.base().pending_commands.sender()),
            None => Err(AreaError::UnknownArea),
        }
    }
}
