//! The four long-lived coordination services.
//!
//! - [`EvalLogReceiver`]: workers push evaluation history and run metadata (base port)
//! - [`StateSyncher`]: polls every worker for status on an interval (binds P+2)
//! - [`ExpResetter`]: two-phase reset of an experiment on its worker and here (P+4)
//! - [`RunDeployer`]: pushes a run's launch files to a worker (P+6)
//!
//! Each listener handles one connection at a time, including any secondary
//! connection it opens, before accepting the next.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::meta::MetaStore;
use crate::net::Outbound;
use crate::trust::TrustGate;

pub mod deploy;
pub mod eval_log;
pub mod reset;
pub mod state_sync;

pub use deploy::RunDeployer;
pub use eval_log::EvalLogReceiver;
pub use reset::ExpResetter;
pub use state_sync::{StateSyncher, SyncReport};

/// Read-only configuration plus the shared metadata store.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<ServerConfig>,
    pub store: MetaStore,
    pub gate: TrustGate,
}

impl ServiceContext {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let store = MetaStore::new(config.runs_dir.clone(), config.workers_meta_dir.clone());
        let gate = TrustGate::new(config.trusted.clone(), config.untrusted_policy);
        Self {
            config,
            store,
            gate,
        }
    }

    /// Outbound connector for a service whose pinned source address is `local`.
    pub(crate) fn outbound(&self, local: SocketAddr) -> Outbound {
        let local = self.config.pin_outbound_ports.then_some(local);
        Outbound::new(local, self.config.connect_timeout)
    }
}
