//! Progression effects of a verified pass.
//!
//! The first pass of a challenge awards XP and coins, may cross one or more
//! level thresholds, and produces the records the profile collaborator
//! persists. Passing an already-completed challenge changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Challenge;

/// Reward defaults and level curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionPolicy {
    /// XP for challenges without an explicit reward.
    pub default_xp_reward: u32,
    /// Coins for challenges without an explicit reward.
    pub default_coins_reward: u32,
    /// XP needed to reach level 2.
    pub initial_level_threshold: u64,
    /// Added to the threshold each time it is crossed.
    pub level_step: u64,
}

impl Default for ProgressionPolicy {
    fn default() -> Self {
        Self {
            default_xp_reward: 50,
            default_coins_reward: 10,
            initial_level_threshold: 100,
            level_step: 100,
        }
    }
}

impl ProgressionPolicy {
    /// XP threshold for leaving `level`.
    #[must_use]
    pub fn threshold_for(&self, level: u32) -> u64 {
        let steps = u64::from(level.saturating_sub(1));
        self.initial_level_threshold
            .saturating_add(steps.saturating_mul(self.level_step))
    }
}

/// Local mirror of the learner's economy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Economy {
    /// Total XP.
    pub xp: u64,
    /// Coin balance.
    pub coins: u64,
    /// Current level, starting at 1.
    pub level: u32,
    /// XP at which the next level is reached.
    pub next_level_xp: u64,
}

impl Economy {
    /// A fresh learner.
    #[must_use]
    pub fn new(policy: &ProgressionPolicy) -> Self {
        Self {
            xp: 0,
            coins: 0,
            level: 1,
            next_level_xp: policy.initial_level_threshold,
        }
    }
}

// ============================================================================
// Persisted records
// ============================================================================

/// Status of a per-challenge progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// The challenge was passed.
    Completed,
}

/// Per-(learner, challenge) progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Challenge id.
    pub challenge_id: String,
    /// Status.
    pub status: ProgressStatus,
    /// Stars earned.
    pub stars: u8,
    /// The passing source.
    pub submitted_source: String,
    /// Sandbox time of the passing submission.
    pub execution_time_ms: u64,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Rewards listed in a history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResults {
    /// Challenge id.
    pub challenge_id: String,
    /// Stars earned.
    pub stars: u8,
    /// XP awarded.
    pub xp: u32,
    /// Coins awarded.
    pub coins: u32,
}

/// An append-only attempt history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Always `"challenge"` for entries written by the engine.
    pub mode: String,
    /// Rewards.
    pub results: HistoryResults,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A partial profile update with absolute values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    /// New coin balance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coins: Option<u64>,
    /// New XP total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xp: Option<u64>,
    /// New level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    /// Full completed set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_challenge_ids: Option<Vec<String>>,
}

/// The learner profile as the collaborator stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Coin balance.
    #[serde(default)]
    pub coins: u64,
    /// XP total.
    #[serde(default)]
    pub xp: u64,
    /// Level; 0 means unset and is read as 1.
    #[serde(default)]
    pub level: u32,
    /// Completed challenge ids.
    #[serde(default)]
    pub completed_challenge_ids: Vec<String>,
    /// Progress records by challenge id.
    #[serde(default)]
    pub progress: BTreeMap<String, ProgressRecord>,
    /// Attempt history, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

impl Profile {
    /// Applies a patch in place.
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(coins) = patch.coins {
            self.coins = coins;
        }
        if let Some(xp) = patch.xp {
            self.xp = xp;
        }
        if let Some(level) = patch.level {
            self.level = level;
        }
        if let Some(ids) = &patch.completed_challenge_ids {
            self.completed_challenge_ids.clone_from(ids);
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// What a first-time pass changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionDelta {
    /// Challenge id.
    pub challenge_id: String,
    /// Stars earned.
    pub stars: u8,
    /// XP awarded.
    pub xp_gained: u32,
    /// Coins awarded.
    pub coins_gained: u32,
    /// Number of levels crossed.
    pub levels_gained: u32,
    /// Counters after the update.
    pub economy: Economy,
}

/// Everything to persist for one first-time pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressionUpdate {
    /// In-memory effect.
    pub delta: ProgressionDelta,
    /// Profile counters.
    pub patch: ProfilePatch,
    /// Progress record.
    pub progress: ProgressRecord,
    /// History entry.
    pub history: HistoryRecord,
}

/// Completed set, star map and economy mirror for one learner.
#[derive(Debug, Clone)]
pub struct Progression {
    policy: ProgressionPolicy,
    economy: Economy,
    completed: BTreeSet<String>,
    stars: BTreeMap<String, u8>,
}

impl Progression {
    /// A fresh learner.
    #[must_use]
    pub fn new(policy: ProgressionPolicy) -> Self {
        Self {
            economy: Economy::new(&policy),
            policy,
            completed: BTreeSet::new(),
            stars: BTreeMap::new(),
        }
    }

    /// Mirrors a stored profile.
    #[must_use]
    pub fn from_profile(policy: ProgressionPolicy, profile: &Profile) -> Self {
        let level = profile.level.max(1);
        let mut progression = Self {
            economy: Economy {
                xp: profile.xp,
                coins: profile.coins,
                level,
                next_level_xp: policy.threshold_for(level),
            },
            policy,
            completed: profile.completed_challenge_ids.iter().cloned().collect(),
            stars: profile
                .progress
                .values()
                .map(|p| (p.challenge_id.clone(), p.stars))
                .collect(),
        };
        progression.level_up();
        progression
    }

    /// Economy counters.
    #[must_use]
    pub const fn economy(&self) -> Economy {
        self.economy
    }

    /// Returns `true` if `challenge_id` was already completed.
    #[must_use]
    pub fn is_completed(&self, challenge_id: &str) -> bool {
        self.completed.contains(challenge_id)
    }

    /// Completed challenge ids.
    #[must_use]
    pub const fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    /// Stars per completed challenge.
    #[must_use]
    pub const fn stars(&self) -> &BTreeMap<String, u8> {
        &self.stars
    }

    /// Records a verified pass.
    ///
    /// Returns `None` if the challenge was already completed; nothing changes
    /// in that case.
    pub fn record_pass(
        &mut self,
        challenge: &Challenge,
        stars: u8,
        source: &str,
        execution_time_ms: u64,
    ) -> Option<ProgressionUpdate> {
        if self.completed.contains(&challenge.id) {
            return None;
        }

        let xp = challenge.xp_reward.unwrap_or(self.policy.default_xp_reward);
        let coins = challenge
            .coins_reward
            .unwrap_or(self.policy.default_coins_reward);

        self.economy.xp = self.economy.xp.saturating_add(u64::from(xp));
        self.economy.coins = self.economy.coins.saturating_add(u64::from(coins));
        let levels_gained = self.level_up();

        self.completed.insert(challenge.id.clone());
        self.stars.insert(challenge.id.clone(), stars);

        let now = Utc::now();
        Some(ProgressionUpdate {
            delta: ProgressionDelta {
                challenge_id: challenge.id.clone(),
                stars,
                xp_gained: xp,
                coins_gained: coins,
                levels_gained,
                economy: self.economy,
            },
            patch: ProfilePatch {
                coins: Some(self.economy.coins),
                xp: Some(self.economy.xp),
                level: Some(self.economy.level),
                completed_challenge_ids: Some(self.completed.iter().cloned().collect()),
            },
            progress: ProgressRecord {
                challenge_id: challenge.id.clone(),
                status: ProgressStatus::Completed,
                stars,
                submitted_source: source.to_string(),
                execution_time_ms,
                timestamp: now,
            },
            history: HistoryRecord {
                mode: "challenge".to_string(),
                results: HistoryResults {
                    challenge_id: challenge.id.clone(),
                    stars,
                    xp,
                    coins,
                },
                timestamp: now,
            },
        })
    }

    fn level_up(&mut self) -> u32 {
        let mut gained = 0;
        while self.policy.level_step > 0 && self.economy.xp >= self.economy.next_level_xp {
            self.economy.level = self.economy.level.saturating_add(1);
            self.economy.next_level_xp = self
                .economy
                .next_level_xp
                .saturating_add(self.policy.level_step);
            gained += 1;
        }
        gained
    }
}
