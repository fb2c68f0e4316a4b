//! Membership policy: hysteresis, minimum holding periods and add/remove caps.
//!
//! Resolution order for one rebalance date:
//!
//! 1. core set: the preselected candidates
//! 2. buffer retention: held assets ranked at or above `buffer_rank`
//! 3. minimum-holding protection for held assets still in the ranking
//! 4. cap trimming of additions and removals
//!
//! Protection wins over the removal cap. Held assets that dropped out of the
//! ranking entirely (ineligible or delisted) cannot be kept, so they are removed
//! even when that exceeds `max_removed_assets`; the excess is recorded as a
//! [`ConstraintOverride`] on the decision.

use crate::config::MembershipConfig;
use crate::preselection::RankedCandidates;
use crate::types::ConstraintOverride;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// What the policy needs to know about a current holding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingInfo {
    /// Executed rebalances the asset has been part of the universe for.
    pub periods_held: usize,
}

/// Resolved asset set for one rebalance date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MembershipDecision {
    /// Final universe handed to the allocator, alphabetical.
    pub universe: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Held assets kept only because of the buffer zone.
    pub retained_by_buffer: Vec<String>,
    /// Held assets kept only because of the minimum holding period.
    pub protected: Vec<String>,
    /// Held assets kept because the removal cap was reached.
    pub retained_by_cap: Vec<String>,
    /// Candidates not added because the addition cap was reached.
    pub deferred: Vec<String>,
    pub overrides: Vec<ConstraintOverride>,
}

impl MembershipDecision {
    pub fn contains(&self, symbol: &str) -> bool {
        self.universe.binary_search_by(|s| s.as_str().cmp(symbol)).is_ok()
    }

    /// One-line count of every outcome, for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} assets, +{} -{}, buffer {}, protected {}, deferred {}, retained by cap {}",
            self.universe.len(),
            self.added.len(),
            self.removed.len(),
            self.retained_by_buffer.len(),
            self.protected.len(),
            self.deferred.len(),
            self.retained_by_cap.len()
        )
    }
}

#[derive(Debug, Clone)]
pub struct MembershipPolicy {
    config: MembershipConfig,
}

impl MembershipPolicy {
    pub fn new(config: MembershipConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Resolve the universe from prior holdings and the current ranking.
    pub fn decide(
        &self,
        prior: &BTreeMap<String, HoldingInfo>,
        candidates: &RankedCandidates,
    ) -> MembershipDecision {
        let rank: HashMap<&str, usize> = candidates
            .ranking
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i + 1))
            .collect();

        let mut target: BTreeSet<String> = candidates.selected.iter().cloned().collect();
        let mut retained_by_buffer = Vec::new();
        let mut protected = Vec::new();

        for (symbol, info) in prior {
            if target.contains(symbol) {
                continue;
            }
            let Some(&r) = rank.get(symbol.as_str()) else {
                continue;
            };
            if self.config.buffer_rank.is_some_and(|buffer| r <= buffer) {
                retained_by_buffer.push(symbol.clone());
                target.insert(symbol.clone());
            } else if info.periods_held < self.config.min_holding_periods {
                protected.push(symbol.clone());
                target.insert(symbol.clone());
            }
        }

        let mut added: Vec<String> = target
            .iter()
            .filter(|s| !prior.contains_key(*s))
            .cloned()
            .collect();
        let mut removed: Vec<String> = prior
            .keys()
            .filter(|s| !target.contains(*s))
            .cloned()
            .collect();

        let mut deferred = Vec::new();
        if let Some(max_new) = self.config.max_new_assets {
            if added.len() > max_new {
                added.sort_by_key(|s| (rank.get(s.as_str()).copied().unwrap_or(usize::MAX), s.clone()));
                deferred = added.split_off(max_new);
                for s in &deferred {
                    target.remove(s);
                }
                deferred.sort();
                added.sort();
            }
        }

        let mut retained_by_cap = Vec::new();
        let mut overrides = Vec::new();
        if let Some(max_removed) = self.config.max_removed_assets {
            if removed.len() > max_removed {
                let (mut forced, mut optional): (Vec<String>, Vec<String>) = removed
                    .into_iter()
                    .partition(|s| !rank.contains_key(s.as_str()));
                forced.sort();

                if forced.len() > max_removed {
                    warn!(
                        "Removing {} assets absent from the ranking exceeds max_removed_assets {}",
                        forced.len(),
                        max_removed
                    );
                    overrides.push(ConstraintOverride {
                        rule: "max_removed_assets".to_string(),
                        symbols: forced.clone(),
                        detail: format!(
                            "{} held assets left the candidate ranking and were removed despite a cap of {}",
                            forced.len(),
                            max_removed
                        ),
                    });
                }

                // Worst rank goes first
                optional.sort_by(|a, b| rank[b.as_str()].cmp(&rank[a.as_str()]).then_with(|| a.cmp(b)));
                let budget = max_removed.saturating_sub(forced.len());
                retained_by_cap = optional.split_off(budget.min(optional.len()));
                for s in &retained_by_cap {
                    target.insert(s.clone());
                }
                retained_by_cap.sort();

                removed = forced;
                removed.extend(optional);
                removed.sort();
            }
        }

        let decision = MembershipDecision {
            universe: target.into_iter().collect(),
            added,
            removed,
            retained_by_buffer,
            protected,
            retained_by_cap,
            deferred,
            overrides,
        };
        debug!("Membership: {}", decision.summary());
        decision
    }
}
