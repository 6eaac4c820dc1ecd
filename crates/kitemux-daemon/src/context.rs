//! State shared between the reactor, the blocking workers and callers.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rand::RngExt;
use tracing::warn;

use kitemux_core::{KiteTable, ManagerConfig, Result, SharedState};

use crate::frontend::{FeFlags, FrontendTable};
use crate::jobs::JobPile;

/// Timestamps guarding how often the expensive checks run.
#[derive(Debug, Default)]
pub struct Housekeeping {
    pub last_world_update: Option<Instant>,
    pub last_dns_update: Option<Instant>,
}

#[derive(Debug)]
pub struct Context {
    pub config: ManagerConfig,
    pub state: SharedState,
    pub jobs: JobPile,
    /// Random slack added to housekeeping deadlines so many clients do not
    /// check in at the same moment.
    pub fudge: Duration,
    frontends: Mutex<FrontendTable>,
    kites: RwLock<KiteTable>,
    housekeeping: Mutex<Housekeeping>,
}

impl Context {
    /// Build tables sized from `config` and load its kites. Frontends are
    /// added separately since they need resolving.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let mut kites = KiteTable::with_capacity(config.max_kites);
        for kite in &config.kites {
            kites.insert(kite)?;
        }
        let min_secs = config.housekeeping_interval_min_secs.max(1);
        let fudge = Duration::from_secs(2 * rand::rng().random_range(0..min_secs));

        Ok(Self {
            state: SharedState::new(),
            jobs: JobPile::with_capacity(config.max_conns + config.max_tunnels),
            fudge,
            frontends: Mutex::new(FrontendTable::with_capacity(config.max_tunnels)),
            kites: RwLock::new(kites),
            housekeeping: Mutex::new(Housekeeping::default()),
            config,
        })
    }

    /// Resolve and add every frontend listed in the configuration. Lookup
    /// failures are logged and skipped.
    pub async fn add_configured_frontends(&self) -> Result<usize> {
        let mut added = 0;
        for spec in &self.config.frontends {
            let flags = if spec.nailed_up {
                FeFlags::NAILED_UP
            } else {
                FeFlags::empty()
            };
            match crate::frontend::add_frontend(&self.frontends, &spec.host, spec.port, flags)
                .await
            {
                Ok(n) => added += n,
                Err(kitemux_core::Error::Io(e)) => {
                    warn!(host = %spec.host, error = %e, "Failed to resolve front-end");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    pub fn frontends(&self) -> MutexGuard<'_, FrontendTable> {
        self.frontends.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kites(&self) -> RwLockReadGuard<'_, KiteTable> {
        self.kites.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kites_mut(&self) -> RwLockWriteGuard<'_, KiteTable> {
        self.kites.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn housekeeping(&self) -> MutexGuard<'_, Housekeeping> {
        self.housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kitemux_core::Kite;

    #[test]
    fn tables_sized_from_config() {
        let config = ManagerConfig {
            max_tunnels: 3,
            kites: vec![Kite::parse_spec("http:x.example.com::s:localhost:8080").unwrap()],
            ..ManagerConfig::default()
        }
        .validate()
        .unwrap();
        let ctx = Context::new(config).unwrap();
        assert_eq!(ctx.frontends().capacity(), 3);
        assert_eq!(ctx.kites().len(), 1);
        assert_eq!(ctx.jobs.capacity(), 3 + ctx.config.max_conns);
        assert!(ctx.fudge < Duration::from_secs(2 * ctx.config.housekeeping_interval_min_secs));
    }
}
