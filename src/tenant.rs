use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;

/// One engine per marketplace. The marketplace is the database name a client
/// connects to; each gets its own WAL file, sweeper and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: EngineSettings) -> Self {
        Self::with_clock(data_dir, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(data_dir: PathBuf, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            clock,
        }
    }

    /// Get or lazily open the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Only a safe subset of the name reaches the filesystem.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        // The entry lock makes concurrent first connections share one engine.
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            self.clock.clone(),
            self.settings.policy.clone(),
        )?);

        if let Some(period) = self.settings.sweep_interval {
            tokio::spawn(reaper::run_sweeper(engine.clone(), period));
        }
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).increment(1.0);
        info!("tenant {tenant} opened");
        Ok(engine)
    }
}
