use std::sync::Arc;

use queue::Queue;
use state::StateStore;

/// Shared state handed to every route. Deliberately narrower than `gitfix-core::Deployment` -
/// the HTTP surface only ever reads from the State Store and writes to the Queue (§4.9: "The Live
/// Stream API reads from State Store only").
#[derive(Clone)]
pub struct AppState {
    pub db: db::DBService,
    pub state: Arc<StateStore>,
    pub queue: Arc<Queue>,
}

impl AppState {
    pub fn new(db: db::DBService, state: Arc<StateStore>, queue: Arc<Queue>) -> Self {
        AppState { db, state, queue }
    }
}
