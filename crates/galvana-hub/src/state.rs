// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide service handles, passed around as `Arc<AppState>` rather
//! than reached for as module-level singletons — each has explicit
//! construction here and an explicit shutdown token threaded through it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::AuthOracle;
use crate::backpressure::BackpressureMonitor;
use crate::bus::FrameBus;
use crate::config::HubConfig;
use crate::connection::ConnectionManager;
use crate::record_store::RecordStore;
use crate::service::InstrumentService;

pub struct AppState {
    pub service: Arc<InstrumentService>,
    pub bus: Arc<dyn FrameBus>,
    pub record_store: Arc<dyn RecordStore>,
    pub auth: Arc<dyn AuthOracle>,
    pub connections: Arc<ConnectionManager>,
    pub backpressure: Arc<BackpressureMonitor>,
    pub config: HubConfig,
    pub shutdown: CancellationToken,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Arc<InstrumentService>,
        bus: Arc<dyn FrameBus>,
        record_store: Arc<dyn RecordStore>,
        auth: Arc<dyn AuthOracle>,
        config: HubConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(config.max_connections_per_principal));
        Self {
            service,
            bus,
            record_store,
            auth,
            connections,
            backpressure: Arc::new(BackpressureMonitor::new()),
            config,
            shutdown,
        }
    }
}
