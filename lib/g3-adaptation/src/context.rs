/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;
use arcstr::ArcStr;
use log::{debug, info};

use g3_async_job::{JobHandle, Scheduler, WeakScheduler};

use crate::config::IcapServiceConfig;
use crate::ecap::{EcapService, LocalAdapterService};
use crate::icap::IcapService;
use crate::icap::transport::IcapTransport;
use crate::{AdaptationMessage, InitiateHandle, Initiator};

/// A service an initiator may send messages to.
#[derive(Clone, Debug)]
pub enum AdaptationService {
    Icap(IcapService),
    Ecap(EcapService),
}

impl AdaptationService {
    pub fn name(&self) -> &str {
        match self {
            AdaptationService::Icap(s) => s.name(),
            AdaptationService::Ecap(s) => s.name(),
        }
    }

    /// Whether the virgin message may be used when the service fails.
    pub fn bypass(&self) -> bool {
        match self {
            AdaptationService::Icap(s) => s.config().bypass(),
            AdaptationService::Ecap(s) => s.bypass(),
        }
    }

    /// Local adapters are always up.
    pub fn up(&self) -> bool {
        match self {
            AdaptationService::Icap(s) => s.up(),
            AdaptationService::Ecap(_) => true,
        }
    }

    /// Start an adaptation of the virgin message. `None` means the event
    /// loop is gone.
    pub fn start_xaction<I: Initiator>(
        &self,
        initiator: &JobHandle<I>,
        virgin: AdaptationMessage,
    ) -> Option<InitiateHandle> {
        match self {
            AdaptationService::Icap(s) => s.start_xaction(initiator, virgin),
            AdaptationService::Ecap(s) => s.start_xaction(initiator, virgin),
        }
    }

    fn detach(&self) {
        if let AdaptationService::Icap(s) = self {
            s.detach();
        }
    }
}

/// All configured adaptation services of one event loop, by name.
///
/// Services are added and removed explicitly. Removed ICAP services are
/// detached: transactions in flight finish, new ones are refused.
pub struct AdaptationContext {
    sched: WeakScheduler,
    transport: Rc<dyn IcapTransport>,
    services: HashMap<ArcStr, AdaptationService>,
}

impl AdaptationContext {
    pub fn new(sched: &Scheduler, transport: Rc<dyn IcapTransport>) -> Self {
        AdaptationContext {
            sched: sched.downgrade(),
            transport,
            services: HashMap::new(),
        }
    }

    fn check_new_name(&self, name: &str) -> anyhow::Result<ArcStr> {
        if name.is_empty() {
            return Err(anyhow!("empty service name"));
        }
        if self.services.contains_key(name) {
            return Err(anyhow!("duplicate adaptation service {name}"));
        }
        Ok(ArcStr::from(name))
    }

    fn scheduler(&self) -> anyhow::Result<Scheduler> {
        self.sched
            .upgrade()
            .ok_or_else(|| anyhow!("event loop is gone"))
    }

    pub fn add_icap_service(
        &mut self,
        name: &str,
        config: IcapServiceConfig,
    ) -> anyhow::Result<IcapService> {
        let name = self.check_new_name(name)?;
        let sched = self.scheduler()?;
        info!(
            "adding ICAP {} service {name} at {}",
            config.method(),
            config.url()
        );
        let service = IcapService::new(name.clone(), config, &sched, self.transport.clone());
        self.services
            .insert(name, AdaptationService::Icap(service.clone()));
        Ok(service)
    }

    pub fn add_ecap_service(
        &mut self,
        name: &str,
        adapter: Rc<dyn LocalAdapterService>,
        bypass: bool,
    ) -> anyhow::Result<EcapService> {
        let name = self.check_new_name(name)?;
        let sched = self.scheduler()?;
        info!("adding eCAP service {name} at {}", adapter.uri());
        let service = EcapService::new(name.clone(), adapter, bypass, &sched);
        self.services
            .insert(name, AdaptationService::Ecap(service.clone()));
        Ok(service)
    }

    pub fn get(&self, name: &str) -> Option<&AdaptationService> {
        self.services.get(name)
    }

    pub fn icap_service(&self, name: &str) -> Option<IcapService> {
        match self.services.get(name)? {
            AdaptationService::Icap(s) => Some(s.clone()),
            AdaptationService::Ecap(_) => None,
        }
    }

    pub fn ecap_service(&self, name: &str) -> Option<EcapService> {
        match self.services.get(name)? {
            AdaptationService::Ecap(s) => Some(s.clone()),
            AdaptationService::Icap(_) => None,
        }
    }

    pub fn remove_service(&mut self, name: &str) -> bool {
        match self.services.remove(name) {
            Some(service) => {
                debug!("removing adaptation service {name}");
                service.detach();
                true
            }
            None => false,
        }
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|k| k.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Remove and detach every service.
    pub fn teardown(&mut self) {
        if self.services.is_empty() {
            return;
        }
        debug!("tearing down {} adaptation services", self.services.len());
        for (_, service) in self.services.drain() {
            service.detach();
        }
    }
}

impl Drop for AdaptationContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
