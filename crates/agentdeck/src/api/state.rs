//! Application state shared across handlers.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::capture::CaptureService;
use crate::gateway::GatewayHandle;
use crate::replay::ReplayRegistry;

/// Everything the HTTP boundary needs, wired once at startup.
///
/// One instance exists per process; initialization is idempotent in
/// the sense that the components it holds (connection, bus, buffers)
/// are owned here rather than in any ambient global.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub replay: Arc<ReplayRegistry>,
    pub capture: Arc<CaptureService>,
    pub gateway: GatewayHandle,
}
