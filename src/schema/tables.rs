//! Replicated row types of the tank module.

use super::Row;
use crate::types::{Identity, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One row per identity that has ever connected. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub identity: Identity,
    pub name: Option<String>,
    /// True iff a live connection exists for this identity.
    pub online: bool,
    pub last_seen: Timestamp,
}

impl User {
    /// The display name, or the first eight hex characters of the identity.
    pub fn name_or_identity(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.identity.short(),
        }
    }
}

impl Row for User {
    type Key = Identity;
    const TABLE: &'static str = "users";

    fn primary_key(&self) -> Identity {
        self.identity
    }
}

/// Tag selecting which stat block a part carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartKind {
    Turret,
    Chassis,
    Engine,
}

/// Kind-specific fields of a tank part. Each kind lives in its own table.
pub trait PartStats:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: PartKind;
    const TABLE: &'static str;
}

/// Turret stats: percent chance to hit a target at close range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurretStats {
    pub attack_percentage: i32,
}

impl PartStats for TurretStats {
    const KIND: PartKind = PartKind::Turret;
    const TABLE: &'static str = "turrets";
}

/// Chassis stats: how many armor points the body supports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChassisStats {
    pub armor_points_allowed: i32,
}

impl PartStats for ChassisStats {
    const KIND: PartKind = PartKind::Chassis;
    const TABLE: &'static str = "chassis";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub speed: i32,
}

impl PartStats for EngineStats {
    const KIND: PartKind = PartKind::Engine;
    const TABLE: &'static str = "engines";
}

/// A tank part: shared shape plus a kind-specific stat block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part<S> {
    /// Assigned by the host when inserted as 0.
    pub id: u32,
    pub name: String,
    /// Armor points it costs to equip.
    pub armor_points_cost: i32,
    pub stats: S,
}

impl<S: PartStats> Part<S> {
    pub fn new(name: impl Into<String>, armor_points_cost: i32, stats: S) -> Self {
        Self {
            id: 0,
            name: name.into(),
            armor_points_cost,
            stats,
        }
    }

    pub fn kind(&self) -> PartKind {
        S::KIND
    }
}

impl<S: PartStats> Row for Part<S> {
    type Key = u32;
    const TABLE: &'static str = S::TABLE;
    const AUTO_INC: bool = true;

    fn primary_key(&self) -> u32 {
        self.id
    }

    fn auto_inc_key(&self) -> Option<u64> {
        (self.id != 0).then(|| u64::from(self.id))
    }

    fn set_auto_inc(&mut self, next: u64) -> bool {
        match u32::try_from(next) {
            Ok(id) => {
                self.id = id;
                true
            }
            Err(_) => false,
        }
    }
}

pub type Turret = Part<TurretStats>;
pub type Chassis = Part<ChassisStats>;
pub type Engine = Part<EngineStats>;

/// A player's tank. Part ids are plain values; only `create_tank` checks them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tank {
    /// Assigned by the host when inserted as 0.
    pub id: u64,
    pub owning_player: Identity,
    pub chassis_id: u32,
    pub turret_id: u32,
    pub engine_id: u32,
    /// Chassis allowance minus part costs; the tank's health.
    pub remaining_armor_points: i32,
    pub created: Timestamp,
    pub last_updated: Timestamp,
}

impl Row for Tank {
    type Key = u64;
    const TABLE: &'static str = "tanks";
    const AUTO_INC: bool = true;

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn auto_inc_key(&self) -> Option<u64> {
        (self.id != 0).then_some(self.id)
    }

    fn set_auto_inc(&mut self, next: u64) -> bool {
        self.id = next;
        true
    }
}
