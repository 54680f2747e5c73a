//! Admin-managed allow/deny list entries.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use stormforge_core::targets::{parse_target, ListKind};
use stormforge_core::types::{DbId, Timestamp};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub id: DbId,
    pub kind: ListKind,
    pub cidr: IpNetwork,
    pub description: Option<String>,
    pub created_by: Option<DbId>,
    pub created_at: Timestamp,
}

/// DTO for adding an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTargetEntry {
    pub kind: ListKind,
    pub cidr: IpNetwork,
    pub description: Option<String>,
    pub created_by: Option<DbId>,
}

/// Raw `target_entries` row. `kind` and `cidr` are stored as text.
#[derive(Debug, Clone, FromRow)]
pub struct TargetEntryRow {
    pub id: DbId,
    pub kind: String,
    pub cidr: String,
    pub description: Option<String>,
    pub created_by: Option<DbId>,
    pub created_at: Timestamp,
}

impl TryFrom<TargetEntryRow> for TargetEntry {
    type Error = StoreError;

    fn try_from(row: TargetEntryRow) -> Result<Self, Self::Error> {
        let kind = ListKind::from_name(&row.kind)
            .ok_or_else(|| StoreError::InvalidRecord(format!("unknown list kind '{}'", row.kind)))?;
        let cidr = parse_target(&row.cidr).map_err(StoreError::InvalidRecord)?;
        Ok(TargetEntry {
            id: row.id,
            kind,
            cidr,
            description: row.description,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}
