//! Deterministic stand-ins for real unsubscribe pages.
//!
//! A [`Simulation`] serves a sandboxed asset tree on an ephemeral loopback
//! port and records the outcome of the last decisive request. The site's
//! behaviour comes from a [`RoutingPolicy`]; variants are picked by name from
//! the [`registry`].

pub mod policy;
pub mod registry;
pub mod sandbox;
pub mod scoreboard;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

pub use policy::{
    OptOutRule, Page, PreferenceCenter, QueryParams, Route, RoutingPolicy, SingleStep, StaticSite,
};
pub use registry::{build, names};
pub use sandbox::{AssetRoot, RouteError};
pub use scoreboard::Scoreboard;

use crate::config::default_asset_dir;
use crate::errors::{UnsubError, UnsubResult};
use crate::types::SimulationStatus;
use server::{SimServer, SiteState};

/// Outcome written by the server thread and read in `finish()`.
/// Last write wins.
#[derive(Debug, Clone, Default)]
pub struct StatusSlot(Arc<Mutex<SimulationStatus>>);

impl StatusSlot {
    pub fn get(&self) -> SimulationStatus {
        *self.0.lock()
    }

    pub fn set(&self, status: SimulationStatus) {
        *self.0.lock() = status;
    }
}

/// One simulated website, used for exactly one run.
pub struct Simulation {
    name: String,
    policy: Arc<dyn RoutingPolicy>,
    asset_dir: PathBuf,
    status: StatusSlot,
    server: Option<SimServer>,
}

impl Simulation {
    pub fn new(name: impl Into<String>, policy: impl RoutingPolicy + 'static) -> Self {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
            asset_dir: default_asset_dir(),
            status: StatusSlot::default(),
            server: None,
        }
    }

    pub fn with_asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.asset_dir = dir.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port of the running server, if started.
    pub fn port(&self) -> Option<u16> {
        self.server.as_ref().map(SimServer::port)
    }

    /// Binds an OS-assigned loopback port and returns the site's base URL.
    pub fn start(&mut self) -> UnsubResult<String> {
        if self.server.is_some() {
            return Err(UnsubError::Simulation(format!(
                "simulation {} already started",
                self.name
            )));
        }
        let site = SiteState {
            policy: self.policy.clone(),
            assets: AssetRoot::new(&self.asset_dir)?,
            status: self.status.clone(),
        };
        let server = SimServer::spawn(site)?;
        let url = server.url();
        tracing::info!(simulation = %self.name, %url, "simulation started");
        self.server = Some(server);
        Ok(url)
    }

    /// Tears the server down and reports the final outcome. Call only once
    /// all browser activity against the site has stopped.
    pub fn finish(mut self) -> SimulationStatus {
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        let status = self.policy.final_status(self.status.get());
        tracing::info!(simulation = %self.name, %status, "simulation finished");
        status
    }
}
