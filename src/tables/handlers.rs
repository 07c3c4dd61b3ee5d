// HTTP handlers for table inventory endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::auth::AuthenticatedUser;
use crate::tables::{SetTableStateRequest, Table, TableError, TableListQuery};
use crate::AppState;

/// Handler for GET /api/tables
/// Lists tables, optionally filtered by floor and state
#[utoipa::path(
    get,
    path = "/api/tables",
    params(
        ("floor" = Option<i32>, Query, description = "Floor number"),
        ("state" = Option<String>, Query, description = "empty, reserved, occupied or in_use")
    ),
    responses((status = 200, description = "Tables", body = Vec<Table>)),
    tag = "tables"
)]
pub async fn list_tables_handler(
    State(state): State<AppState>,
    Query(query): Query<TableListQuery>,
) -> Result<Json<Vec<Table>>, TableError> {
    let tables = state.tables.list(query.floor, query.state).await?;
    Ok(Json(tables))
}

/// Handler for PATCH /api/tables/:id/state
/// Conditional state change; fails with 409 if the table is no longer in `expected`
#[utoipa::path(
    patch,
    path = "/api/tables/{id}/state",
    params(("id" = i32, Path, description = "Table ID")),
    request_body = SetTableStateRequest,
    responses(
        (status = 200, description = "Table updated", body = Table),
        (status = 404, description = "Table not found"),
        (status = 409, description = "Table state changed meanwhile")
    ),
    security(("bearer_auth" = [])),
    tag = "tables"
)]
pub async fn set_table_state_handler(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<i32>,
    Json(request): Json<SetTableStateRequest>,
) -> Result<Json<Table>, TableError> {
    let table = state.tables.set_state(id, request.expected, request.state).await?;
    Ok(Json(table))
}
