// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Publishes routed paths to a service registry while the endpoint listens.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tern::plugin::{AfterListen, AfterRegRouter, BeforeCloseEndpoint};
use tern::router::{HandlerInfo, HandlerKind};
use tern::{Endpoint, Hooks, Plugin, Status};
use tracing::{debug, info, warn};

use crate::errors::RegistryError;

/// Service discovery backend.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, service: &str, addr: &str) -> Result<(), RegistryError>;
    async fn deregister(&self, service: &str, addr: &str) -> Result<(), RegistryError>;
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry::default()
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    /// Addresses serving `service`, sorted.
    pub fn lookup(&self, service: &str) -> Vec<String> {
        self.services
            .lock()
            .get(service)
            .map(|addrs| addrs.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &str, addr: &str) -> Result<(), RegistryError> {
        let mut services = self.services.lock();
        if !services
            .entry(service.to_string())
            .or_default()
            .insert(addr.to_string())
        {
            return Err(RegistryError::AlreadyRegistered(
                service.to_string(),
                addr.to_string(),
            ));
        }
        Ok(())
    }

    async fn deregister(&self, service: &str, addr: &str) -> Result<(), RegistryError> {
        let mut services = self.services.lock();
        let Some(addrs) = services.get_mut(service) else {
            return Err(RegistryError::NotRegistered(service.to_string(), addr.to_string()));
        };
        if !addrs.remove(addr) {
            return Err(RegistryError::NotRegistered(service.to_string(), addr.to_string()));
        }
        if addrs.is_empty() {
            services.remove(service);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RegistrationState {
    services: BTreeSet<String>,
    addr: Option<String>,
}

pub struct ServiceRegistration {
    registry: Arc<dyn Registry>,
    advertise: Option<String>,
    state: Mutex<RegistrationState>,
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServiceRegistration")
            .field("advertise", &self.advertise)
            .field("services", &state.services)
            .field("addr", &state.addr)
            .finish()
    }
}

impl ServiceRegistration {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        ServiceRegistration {
            registry,
            advertise: None,
            state: Mutex::new(RegistrationState::default()),
        }
    }

    /// Publish `addr` instead of the listen address.
    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise = Some(addr.into());
        self
    }

    /// Paths collected so far, sorted.
    pub fn services(&self) -> Vec<String> {
        self.state.lock().services.iter().cloned().collect()
    }
}

impl Plugin for ServiceRegistration {
    fn name(&self) -> &str {
        "service-registration"
    }

    fn register(self: Arc<Self>, hooks: &mut Hooks) {
        hooks
            .after_reg_router(self.clone())
            .after_listen(self.clone())
            .before_close_endpoint(self);
    }
}

impl AfterRegRouter for ServiceRegistration {
    fn after_reg_router(&self, handler: &HandlerInfo) -> Result<(), Status> {
        if matches!(handler.kind(), HandlerKind::UnknownCall | HandlerKind::UnknownPush) {
            return Ok(());
        }
        self.state.lock().services.insert(handler.name().to_string());
        Ok(())
    }
}

#[async_trait]
impl AfterListen for ServiceRegistration {
    async fn after_listen(&self, addr: &str) -> Result<(), Status> {
        let addr = self.advertise.clone().unwrap_or_else(|| addr.to_string());
        let services: Vec<String> = {
            let mut state = self.state.lock();
            state.addr = Some(addr.clone());
            state.services.iter().cloned().collect()
        };
        for service in &services {
            self.registry.register(service, &addr).await?;
            debug!(%service, %addr, "service registered");
        }
        info!(%addr, count = services.len(), "services registered");
        Ok(())
    }
}

#[async_trait]
impl BeforeCloseEndpoint for ServiceRegistration {
    async fn before_close_endpoint(&self, _endpoint: &Endpoint) -> Result<(), Status> {
        let (addr, services) = {
            let mut state = self.state.lock();
            let Some(addr) = state.addr.take() else {
                return Ok(());
            };
            (addr, state.services.iter().cloned().collect::<Vec<_>>())
        };
        for service in &services {
            // keep going, the endpoint is closing anyway
            if let Err(e) = self.registry.deregister(service, &addr).await {
                warn!(%service, %addr, error = %e, "deregister failed");
            }
        }
        info!(%addr, count = services.len(), "services deregistered");
        Ok(())
    }
}
