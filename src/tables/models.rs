use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Occupancy state of a dining table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Empty,
    Reserved,
    Occupied,
    InUse,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Empty => "empty",
            TableState::Reserved => "reserved",
            TableState::Occupied => "occupied",
            TableState::InUse => "in_use",
        }
    }

    /// Whether a booking currently holds the table
    pub fn is_held(&self) -> bool {
        !matches!(self, TableState::Empty)
    }
}

impl Default for TableState {
    fn default() -> Self {
        TableState::Empty
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A physical table on one of the floors
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Table {
    #[schema(example = 3)]
    pub id: i32,
    #[schema(example = 1)]
    pub floor: i32,
    pub state: TableState,
    /// Bill currently holding the table, if any
    pub holder_bill_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Request DTO for a conditional state change
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetTableStateRequest {
    /// State the caller believes the table is in
    pub expected: TableState,
    pub state: TableState,
}

/// Query parameters for table listing
#[derive(Debug, Deserialize)]
pub struct TableListQuery {
    pub floor: Option<i32>,
    pub state: Option<TableState>,
}
