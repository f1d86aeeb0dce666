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

//! Bridge for commands submitted from outside the simulation loop. Each
//! strategy owns an unbounded channel; whatever arrived since the last tick
//! is drained first-in first-out at the start of the strategy's own tick,
//! before any order posting for that tick.

use crossbeam_channel::{Receiver, Sender, unbounded};

use gridion_types::time::TimeSlot;

/// A command addressed to one strategy. Slot-less variants apply to the
/// strategy's current spot market slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalCommand {
    /// Override the consumption requirement, in Wh.
    SetDesiredEnergy {
        energy_wh: f64,
        time_slot: Option<TimeSlot>,
    },
    /// Override the production forecast, in kWh.
    SetProductionForecast {
        energy_kwh: f64,
        time_slot: Option<TimeSlot>,
    },
    /// Record the metered energy for a completed slot, feeding the
    /// settlement deviation.
    SetEnergyMeasurement {
        energy_kwh: f64,
        time_slot: TimeSlot,
    },
    /// Post an offer with an explicit price, bypassing the rate ramp.
    PostOffer { price: f64, energy: f64 },
    /// Post a bid with an explicit price, bypassing the rate ramp.
    PostBid { price: f64, energy: f64 },
    DeletePostedOffers,
    DeletePostedBids,
}

/// Submission handle, cloneable across threads.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<ExternalCommand>,
}

impl CommandSender {
    /// Queue a command. Sending never blocks; the queue is unbounded and
    /// the receiver lives as long as the strategy.
    pub fn send(&self, command: ExternalCommand) {
        // The strategy, and with it the receiver, outlives every sender in
        // an active simulation, so a send failure only means shutdown.
        let _ = self.tx.send(command);
    }
}

/// Receiving half owned by the strategy.
#[derive(Debug)]
pub struct PendingCommands {
    rx: Receiver<ExternalCommand>,
    tx: Sender<ExternalCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { rx, tx }
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<ExternalCommand> {
        self.rx.try_iter().collect()
    }
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_drain_in_submission_order() {
        let pending = PendingCommands::new();
        let sender = pending.sender();
        sender.send(ExternalCommand::SetDesiredEnergy {
            energy_wh: 100.0,
            time_slot: None,
        });
        sender.send(ExternalCommand::DeletePostedBids);

        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], ExternalCommand::SetDesiredEnergy { .. }));
        assert!(matches!(drained[1], ExternalCommand::DeletePostedBids));
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn senders_can_be_cloned_across_threads() {
        let pending = PendingCommands::new();
        let sender = pending.sender();
        let handle = std::thread::spawn(move || {
            sender.send(ExternalCommand::PostOffer {
                price: 10.0,
                energy: 1.0,
            });
        });
        handle.join().unwrap();
        assert_eq!(pending.drain().len(), 1);
    }
}
