use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VoteError;

/// Joins the names of a two-food pack.
pub const PACK_NAME_SEPARATOR: &str = " + ";

/// Largest number of foods a single pack may bundle.
pub const MAX_FOODS_PER_PACK: usize = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MenuStatus {
    Idle,
    Voting,
    Closed,
    AdminSet,
}

impl std::fmt::Display for MenuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MenuStatus::Idle => "idle",
            MenuStatus::Voting => "voting",
            MenuStatus::Closed => "closed",
            MenuStatus::AdminSet => "admin_set",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MenuStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(MenuStatus::Idle),
            "voting" => Ok(MenuStatus::Voting),
            "closed" => Ok(MenuStatus::Closed),
            "admin_set" => Ok(MenuStatus::AdminSet),
            _ => Err(anyhow::anyhow!("Unknown menu status: {s}")),
        }
    }
}

/// A votable bundle of one or two foods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pack {
    pub food_ids: Vec<i32>,
    pub display_name: String,
    pub vote_count: u32,
}

/// The voting record of one calendar date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyMenuState {
    pub date: NaiveDate,
    pub status: MenuStatus,
    pub vote_options: Vec<Pack>,
    /// user id -> index into `vote_options`
    pub voted_users: BTreeMap<String, usize>,
    pub winning_food_id: Option<i32>,
    pub admin_set_food_id: Option<i32>,
    pub is_visible: bool,
    /// Bumped by the store on every successful write.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot written when voting for a date closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyResult {
    pub date: NaiveDate,
    pub winning_food_id: i32,
    pub winning_food_ids: Vec<i32>,
    pub winning_food_name: String,
    pub total_votes: u32,
    pub vote_options: Vec<Pack>,
    pub created_at: DateTime<Utc>,
}

/// What a successful `cast_vote` did to the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteChange {
    Cast,
    Changed { from: usize },
    Unchanged,
}

impl VoteChange {
    pub fn label(&self) -> &'static str {
        match self {
            VoteChange::Cast => "cast",
            VoteChange::Changed { .. } => "changed",
            VoteChange::Unchanged => "unchanged",
        }
    }
}

/// Requested pack as sent by the admin UI: just the food ids.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackRequest {
    pub food_ids: Vec<i32>,
}

#[derive(Debug, Deserialize)]
pub struct StartVotingRequest {
    pub packs: Vec<PackRequest>,
}

/// `pack_index` is signed so that negative input reaches validation instead of
/// failing deserialization.
#[derive(Debug, Deserialize)]
pub struct CastVoteRequest {
    pub user_id: String,
    pub pack_index: i64,
}

#[derive(Debug, Deserialize)]
pub struct CancelVoteRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminSetFoodRequest {
    pub food_id: i32,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub limit: Option<i64>,
}

/// Check the shape of requested packs before any catalog lookup.
pub fn validate_pack_requests(packs: &[PackRequest]) -> Result<(), VoteError> {
    if packs.is_empty() {
        return Err(VoteError::validation("At least one pack is required"));
    }

    let mut seen: BTreeSet<Vec<i32>> = BTreeSet::new();
    for (i, pack) in packs.iter().enumerate() {
        if pack.food_ids.is_empty() || pack.food_ids.len() > MAX_FOODS_PER_PACK {
            return Err(VoteError::validation(format!(
                "Pack {i} must contain 1 to {MAX_FOODS_PER_PACK} foods"
            )));
        }
        let mut key = pack.food_ids.clone();
        key.sort_unstable();
        if key.windows(2).any(|w| w[0] == w[1]) {
            return Err(VoteError::validation(format!(
                "Pack {i} lists the same food twice"
            )));
        }
        if !seen.insert(key) {
            return Err(VoteError::validation(format!("Pack {i} is a duplicate")));
        }
    }
    Ok(())
}

/// Every distinct food id referenced by the requested packs, sorted.
pub fn referenced_food_ids(packs: &[PackRequest]) -> Vec<i32> {
    packs
        .iter()
        .flat_map(|p| p.food_ids.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Turn requested packs into zero-count packs with display names.
/// Fails with `NotFound` naming every id absent from `names`.
pub fn build_packs(
    packs: &[PackRequest],
    names: &HashMap<i32, String>,
) -> Result<Vec<Pack>, VoteError> {
    let missing: Vec<String> = referenced_food_ids(packs)
        .into_iter()
        .filter(|id| !names.contains_key(id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(VoteError::not_found(format!(
            "Unknown food ids: {}",
            missing.join(", ")
        )));
    }

    Ok(packs
        .iter()
        .map(|p| Pack {
            food_ids: p.food_ids.clone(),
            display_name: p
                .food_ids
                .iter()
                .map(|id| names[id].as_str())
                .collect::<Vec<_>>()
                .join(PACK_NAME_SEPARATOR),
            vote_count: 0,
        })
        .collect())
}

impl DailyMenuState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            status: MenuStatus::Idle,
            vote_options: Vec::new(),
            voted_users: BTreeMap::new(),
            winning_food_id: None,
            admin_set_food_id: None,
            is_visible: true,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn total_votes(&self) -> u32 {
        self.vote_options.iter().map(|p| p.vote_count).sum()
    }

    pub fn ensure_visible(&self) -> Result<(), VoteError> {
        if !self.is_visible {
            return Err(VoteError::validation(format!(
                "Voting for {} is disabled",
                self.date
            )));
        }
        Ok(())
    }

    fn ensure_voting(&self) -> Result<(), VoteError> {
        if self.status != MenuStatus::Voting {
            return Err(VoteError::validation(format!(
                "Voting for {} is not open (status: {})",
                self.date, self.status
            )));
        }
        Ok(())
    }

    /// Replace any previous round with fresh packs. Votes do not carry over.
    pub fn start_voting(&mut self, packs: Vec<Pack>) -> Result<(), VoteError> {
        self.ensure_visible()?;
        if packs.is_empty() {
            return Err(VoteError::validation("At least one pack is required"));
        }
        self.status = MenuStatus::Voting;
        self.vote_options = packs;
        self.voted_users.clear();
        self.winning_food_id = None;
        self.admin_set_food_id = None;
        Ok(())
    }

    pub fn cast_vote(&mut self, user_id: &str, pack_index: i64) -> Result<VoteChange, VoteError> {
        self.ensure_visible()?;
        self.ensure_voting()?;
        if user_id.trim().is_empty() {
            return Err(VoteError::validation("user_id is required"));
        }
        let index = usize::try_from(pack_index)
            .ok()
            .filter(|i| *i < self.vote_options.len())
            .ok_or_else(|| {
                VoteError::validation(format!(
                    "Pack index {pack_index} is out of range (0..{})",
                    self.vote_options.len()
                ))
            })?;

        let change = match self.voted_users.get(user_id).copied() {
            Some(previous) if previous == index => return Ok(VoteChange::Unchanged),
            Some(previous) => {
                if let Some(pack) = self.vote_options.get_mut(previous) {
                    pack.vote_count = pack.vote_count.saturating_sub(1);
                }
                VoteChange::Changed { from: previous }
            }
            None => VoteChange::Cast,
        };

        self.vote_options[index].vote_count += 1;
        self.voted_users.insert(user_id.to_string(), index);
        Ok(change)
    }

    /// Withdraw a user's vote; returns the index it was cast for.
    pub fn cancel_vote(&mut self, user_id: &str) -> Result<usize, VoteError> {
        self.ensure_visible()?;
        self.ensure_voting()?;
        let previous = self
            .voted_users
            .remove(user_id)
            .ok_or_else(|| VoteError::validation(format!("User {user_id} has not voted")))?;
        if let Some(pack) = self.vote_options.get_mut(previous) {
            pack.vote_count = pack.vote_count.saturating_sub(1);
        }
        Ok(previous)
    }

    /// Close the round. Ties go to the pack listed first.
    pub fn close(&mut self) -> Result<DailyResult, VoteError> {
        self.ensure_voting()?;

        let mut winner: Option<&Pack> = None;
        for pack in &self.vote_options {
            if winner.map_or(true, |w| pack.vote_count > w.vote_count) {
                winner = Some(pack);
            }
        }
        let winner = winner
            .filter(|p| !p.food_ids.is_empty())
            .cloned()
            .ok_or_else(|| VoteError::validation("No packs to choose a winner from"))?;

        self.status = MenuStatus::Closed;
        self.winning_food_id = Some(winner.food_ids[0]);

        Ok(DailyResult {
            date: self.date,
            winning_food_id: winner.food_ids[0],
            winning_food_ids: winner.food_ids,
            winning_food_name: winner.display_name,
            total_votes: self.total_votes(),
            vote_options: self.vote_options.clone(),
            created_at: Utc::now(),
        })
    }

    pub fn admin_set(&mut self, food_id: i32) -> Result<(), VoteError> {
        self.ensure_visible()?;
        self.status = MenuStatus::AdminSet;
        self.admin_set_food_id = Some(food_id);
        self.winning_food_id = None;
        self.vote_options.clear();
        self.voted_users.clear();
        Ok(())
    }

    pub fn set_visibility(&mut self, visible: bool) {
        self.is_visible = visible;
    }

    /// Checks the tally invariants; used when loading rows from storage.
    pub fn check_consistency(&self) -> anyhow::Result<()> {
        for (user, index) in &self.voted_users {
            if *index >= self.vote_options.len() {
                anyhow::bail!(
                    "Stored vote of {user} on {} points at missing pack {index}",
                    self.date
                );
            }
        }
        for pack in &self.vote_options {
            if pack.food_ids.is_empty() || pack.food_ids.len() > MAX_FOODS_PER_PACK {
                anyhow::bail!("Stored pack '{}' on {} is malformed", pack.display_name, self.date);
            }
        }
        // Each voter is counted in exactly one pack
        let counted = u64::from(self.total_votes());
        if counted != self.voted_users.len() as u64 {
            anyhow::bail!(
                "Stored tally on {} counts {counted} vote(s) for {} voter(s)",
                self.date,
                self.voted_users.len()
            );
        }
        Ok(())
    }
}
