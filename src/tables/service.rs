// Table Inventory Manager
// Validates table selections and claims/releases tables through the store's
// conditional updates. No table state is ever written from a prior read.

use std::collections::HashSet;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::policy::PolicyEngine;
use crate::store::{BookingStore, StoreError};
use crate::tables::{Table, TableState};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("{required} table(s) are needed for this party, {given} selected")]
    WrongCount { required: i32, given: usize },

    #[error("Table {0} was selected twice")]
    Duplicate(i32),

    #[error("Table {0} does not exist")]
    NotFound(i32),

    #[error("Table {id} is already {state}")]
    Unavailable { id: i32, state: TableState },

    #[error("Table {id} is {actual}, not {expected}")]
    StateChanged {
        id: i32,
        expected: TableState,
        actual: TableState,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TableError> for ApiError {
    fn from(error: TableError) -> Self {
        match error {
            TableError::WrongCount { .. } | TableError::Duplicate(_) => ApiError::rejected(error.to_string()),
            TableError::NotFound(id) => ApiError::not_found("Table", id),
            TableError::Unavailable { .. } | TableError::StateChanged { .. } => ApiError::Conflict {
                message: error.to_string(),
            },
            TableError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for TableError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

pub struct TableInventory {
    store: Arc<dyn BookingStore>,
    policy: PolicyEngine,
}

impl TableInventory {
    pub fn new(store: Arc<dyn BookingStore>, policy: PolicyEngine) -> Self {
        Self { store, policy }
    }

    pub async fn list(&self, floor: Option<i32>, state: Option<TableState>) -> Result<Vec<Table>, TableError> {
        Ok(self.store.list_tables(floor, state).await?)
    }

    /// Check a selection before anything is written: right number of tables
    /// for the party, no repeats, all present and free. Tables already held by
    /// `holder` count as free.
    pub async fn validate_selection(
        &self,
        num_people: i32,
        table_ids: &[i32],
        holder: Option<Uuid>,
    ) -> Result<Vec<Table>, TableError> {
        let required = self.policy.required_tables(num_people);
        if table_ids.len() != required as usize {
            return Err(TableError::WrongCount {
                required,
                given: table_ids.len(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(id) = table_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(TableError::Duplicate(*id));
        }

        let tables = self.store.find_tables(table_ids).await?;
        for id in table_ids {
            let table = tables.iter().find(|t| t.id == *id).ok_or(TableError::NotFound(*id))?;
            let held_by_holder = holder.is_some() && table.holder_bill_id == holder;
            if table.state != TableState::Empty && !held_by_holder {
                debug!("Table {} unavailable ({})", id, table.state);
                return Err(TableError::Unavailable {
                    id: *id,
                    state: table.state,
                });
            }
        }
        Ok(tables)
    }

    /// Claim tables for a bill, all or none
    pub async fn allocate(&self, bill_id: Uuid, table_ids: &[i32]) -> Result<(), TableError> {
        self.store.allocate_tables(bill_id, table_ids).await?;
        info!("Tables {:?} allocated to bill {}", table_ids, bill_id);
        Ok(())
    }

    /// Release whatever the bill still holds; a second call is a no-op
    pub async fn release(&self, bill_id: Uuid) -> Result<u64, TableError> {
        let released = self.store.release_tables(bill_id).await?;
        info!("Released {} table(s) held by bill {}", released, bill_id);
        Ok(released)
    }

    /// Staff override of a single table, guarded on its current state
    pub async fn set_state(&self, id: i32, expected: TableState, new: TableState) -> Result<Table, TableError> {
        match self.store.set_table_state(id, expected, new).await {
            Ok(Some(table)) => {
                info!("Table {} moved {} -> {}", id, expected, new);
                return Ok(table);
            }
            Ok(None) => {}
            Err(StoreError::NotFound(_)) => return Err(TableError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }

        let current = self.store.find_tables(&[id]).await?;
        match current.first() {
            Some(table) => Err(TableError::StateChanged {
                id,
                expected,
                actual: table.state,
            }),
            None => Err(TableError::NotFound(id)),
        }
    }
}
