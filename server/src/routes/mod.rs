//! Route table. `health` is public; the sync surface checks [`AuthUser`](crate::auth::AuthUser)
//! per handler.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

pub fn create_routes() -> Router<AppState> {
    health::routes().merge(sync::routes())
}
