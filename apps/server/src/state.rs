use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use confab_session::SessionManager;
use confab_storage::ProjectStore;
use confab_tickets::TicketStore;

use crate::config::Config;

/// Shared handles injected into every request handler. The manager, ticket
/// store, and worker pool are the only process-wide singletons; all are
/// created in `main` and passed down explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub tickets: Arc<TicketStore>,
    pub store: Arc<dyn ProjectStore>,
    pub connections: Arc<AtomicUsize>,
}
