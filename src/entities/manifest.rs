use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::store::{Entity, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ManifestStatus {
    Open,
    Confirmed,
    Dispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemberState {
    Staged,
    Scanned,
    Held,
    Dispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ManifestTrigger {
    BatchSize,
    Cutoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMember {
    pub order_id: Uuid,
    pub saylogix_number: String,
    pub tracking_number: String,
    pub city: String,
    pub state: MemberState,
    pub scanned_at: Option<DateTime<Utc>>,
}

impl ManifestMember {
    /// A member is identified on the dock by either its tracking or internal number.
    pub fn matches_code(&self, code: &str) -> bool {
        let code = code.trim();
        code.eq_ignore_ascii_case(&self.tracking_number)
            || code.eq_ignore_ascii_case(&self.saylogix_number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: Uuid,
    pub manifest_number: String,
    pub courier: String,
    pub status: ManifestStatus,
    pub trigger: ManifestTrigger,
    pub members: Vec<ManifestMember>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn member_mut(&mut self, order_id: Uuid) -> Option<&mut ManifestMember> {
        self.members.iter_mut().find(|m| m.order_id == order_id)
    }

    pub fn all_scanned(&self) -> bool {
        !self.members.is_empty()
            && self
                .members
                .iter()
                .all(|m| matches!(m.state, MemberState::Scanned | MemberState::Dispatched))
    }

    pub fn remaining_scans(&self) -> usize {
        self.members
            .iter()
            .filter(|m| matches!(m.state, MemberState::Staged | MemberState::Held))
            .count()
    }

    pub fn order_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.order_id).collect()
    }
}

impl Entity for Manifest {
    const ENTITY_TYPE: EntityType = EntityType::Manifest;

    fn id(&self) -> Uuid {
        self.id
    }
}
