/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use arcstr::ArcStr;
use chrono::Utc;
use log::{debug, info, warn};

use g3_async_job::{AsyncCall, CallCanceller, JobHandle, Scheduler, WeakScheduler};

use super::options::{IcapServiceOptions, OptXact, TransferKind};
use super::transport::{IcapConnection, IcapTransport};
use crate::config::IcapServiceConfig;
use crate::{AdaptationMessage, InitiateCore, InitiateHandle, Initiator};

mod failure;
use failure::FailureCounter;

mod rep;
use rep::IcapServiceRep;

/// How long an OPTIONS transaction is expected to take.
const OPTIONS_FETCH_WAIT: Duration = Duration::from_secs(20);
/// Minimum gap between two OPTIONS fetches.
const MIN_UPDATE_GAP: Duration = Duration::from_secs(30);

struct ServiceState {
    rep: Option<JobHandle<IcapServiceRep>>,
    options: Option<IcapServiceOptions>,
    last_update: Option<Instant>,
    failures: FailureCounter,
    suspended: Option<&'static str>,
    fetching: bool,
    update_timer: Option<CallCanceller>,
    notify_scheduled: bool,
    notifying: bool,
    detached: bool,
    announced_up: bool,
    /// Waiting for the service to become usable.
    clients: Vec<AsyncCall>,
    /// Waiting for a connection slot.
    slot_waiters: VecDeque<AsyncCall>,
    all_waiters: usize,
    busy: usize,
    idle: VecDeque<Box<dyn IcapConnection>>,
    max_connections: Option<usize>,
    overload_reported: bool,
}

struct ServiceShared {
    name: ArcStr,
    config: IcapServiceConfig,
    sched: WeakScheduler,
    transport: Rc<dyn IcapTransport>,
    state: RefCell<ServiceState>,
}

/// One configured ICAP service.
///
/// Clones share the same state. The service keeps its OPTIONS fresh through
/// a companion job, pools connections and suspends itself after too many
/// failures.
#[derive(Clone)]
pub struct IcapService {
    shared: Rc<ServiceShared>,
}

impl fmt::Debug for IcapService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IcapService({} {})", self.shared.name, self.status())
    }
}

impl IcapService {
    pub fn new(
        name: ArcStr,
        config: IcapServiceConfig,
        sched: &Scheduler,
        transport: Rc<dyn IcapTransport>,
    ) -> Self {
        let failures = FailureCounter::new(config.oldest_service_failure);
        let max_connections = config.max_connections;
        let service = IcapService {
            shared: Rc::new(ServiceShared {
                name,
                config,
                sched: sched.downgrade(),
                transport,
                state: RefCell::new(ServiceState {
                    rep: None,
                    options: None,
                    last_update: None,
                    failures,
                    suspended: None,
                    fetching: false,
                    update_timer: None,
                    notify_scheduled: false,
                    notifying: false,
                    detached: false,
                    announced_up: false,
                    clients: Vec::new(),
                    slot_waiters: VecDeque::new(),
                    all_waiters: 0,
                    busy: 0,
                    idle: VecDeque::new(),
                    max_connections,
                    overload_reported: false,
                }),
            }),
        };
        let rep = sched.start_job(IcapServiceRep::new(service.clone()));
        service.shared.state.borrow_mut().rep = Some(rep);
        service
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn config(&self) -> &IcapServiceConfig {
        &self.shared.config
    }

    pub(crate) fn transport(&self) -> Rc<dyn IcapTransport> {
        self.shared.transport.clone()
    }

    pub fn ptr_eq(&self, other: &IcapService) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    fn now(&self) -> Instant {
        self.shared
            .sched
            .upgrade()
            .map(|s| s.now())
            .unwrap_or_else(Instant::now)
    }

    /// Whether an OPTIONS fetch has ever completed, successfully or not.
    pub fn probed(&self) -> bool {
        self.shared.state.borrow().last_update.is_some()
    }

    fn has_options_in(&self, state: &ServiceState) -> bool {
        state
            .options
            .as_ref()
            .is_some_and(|o| o.valid() && o.fresh(self.now()))
    }

    /// Valid and fresh options are known.
    pub fn has_options(&self) -> bool {
        let state = self.shared.state.borrow();
        self.has_options_in(&state)
    }

    pub fn up(&self) -> bool {
        let state = self.shared.state.borrow();
        !state.detached && state.suspended.is_none() && self.has_options_in(&state)
    }

    /// Probed, but not usable.
    pub fn broken(&self) -> bool {
        self.probed() && !self.up()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.borrow().suspended.is_some()
    }

    pub fn is_detached(&self) -> bool {
        self.shared.state.borrow().detached
    }

    /// The preview size to use for a message with this URL path, if any.
    pub fn wants_preview(&self, url_path: &str) -> Option<usize> {
        let state = self.shared.state.borrow();
        let options = state.options.as_ref()?;
        let size = options.preview_size()?;
        match options.transfer_kind(url_path) {
            TransferKind::Preview => Some(size),
            TransferKind::Ignore | TransferKind::Complete => None,
        }
    }

    pub fn allows_204(&self) -> bool {
        self.shared.config.allow_204
            && self
                .shared
                .state
                .borrow()
                .options
                .as_ref()
                .is_some_and(|o| o.allow_204())
    }

    pub fn allows_206(&self) -> bool {
        self.shared.config.allow_206
            && self
                .shared
                .state
                .borrow()
                .options
                .as_ref()
                .is_some_and(|o| o.allow_206())
    }

    /// Free connection slots, `None` if there is no limit.
    fn available_connections(&self, state: &mut ServiceState) -> Option<usize> {
        let max = state.max_connections?;
        let available = max.saturating_sub(state.busy);
        if available == 0 && !state.overload_reported {
            warn!(
                "ICAP service {} is over its connection limit {max}",
                self.shared.name
            );
            state.overload_reported = true;
        }
        Some(available)
    }

    /// A new transaction may start without waiting.
    pub fn available_for_new(&self) -> bool {
        let mut state = self.shared.state.borrow_mut();
        match self.available_connections(&mut state) {
            Some(available) => available > state.all_waiters,
            None => true,
        }
    }

    /// A transaction that already waited may proceed.
    pub fn available_for_old(&self) -> bool {
        let mut state = self.shared.state.borrow_mut();
        self.available_connections(&mut state) != Some(0)
    }

    fn excess_connections(state: &ServiceState) -> usize {
        let Some(max) = state.max_connections else {
            return 0;
        };
        let existing = state.busy + state.idle.len();
        existing.saturating_sub(max)
    }

    fn close_idle(state: &mut ServiceState, n: usize) {
        for _ in 0..n {
            match state.idle.pop_front() {
                Some(mut conn) => conn.close(false),
                None => break,
            }
        }
    }

    /// Take a connection slot, with an idle connection if one may be used.
    pub(crate) fn get_connection(&self, retriable: bool) -> Option<Box<dyn IcapConnection>> {
        let mut state = self.shared.state.borrow_mut();
        let conn = if retriable {
            let mut found = None;
            while let Some(conn) = state.idle.pop_back() {
                if conn.is_open() {
                    found = Some(conn);
                    break;
                }
            }
            found
        } else {
            // a transaction that cannot retry gets a fresh connection, and
            // one idle connection goes away to keep the total in check
            IcapService::close_idle(&mut state, 1);
            None
        };
        state.busy += 1;
        conn
    }

    /// Return a connection slot.
    pub(crate) fn put_connection(
        &self,
        mut conn: Box<dyn IcapConnection>,
        reusable: bool,
        reset: bool,
    ) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.busy = state.busy.saturating_sub(1);
            if reusable && conn.is_open() && !state.detached && IcapService::excess_connections(&state) == 0 {
                debug!(
                    "pushing pconn {} to ICAP service {}",
                    conn.id(),
                    self.shared.name
                );
                state.idle.push_back(conn);
            } else {
                debug!(
                    "closing connection {} to ICAP service {}, reset: {reset}",
                    conn.id(),
                    self.shared.name
                );
                conn.close(reset);
            }
        }
        self.busy_checkpoint();
    }

    /// Return a slot whose connection was never established.
    pub(crate) fn note_connection_failed(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.busy = state.busy.saturating_sub(1);
        }
        self.busy_checkpoint();
    }

    pub fn busy_connections(&self) -> usize {
        self.shared.state.borrow().busy
    }

    pub fn idle_connections(&self) -> usize {
        self.shared.state.borrow().idle.len()
    }

    /// Wake as many slot waiters as there are free slots.
    fn busy_checkpoint(&self) {
        let mut calls = Vec::new();
        {
            let mut state = self.shared.state.borrow_mut();
            // waiters that gave up already told us through note_gone_waiter
            state.slot_waiters.retain(|c| !c.is_cancelled());
            if state.slot_waiters.is_empty() {
                return;
            }
            let mut freed = match self.available_connections(&mut state) {
                None => state.slot_waiters.len(),
                Some(available) => {
                    let notified = state.all_waiters.saturating_sub(state.slot_waiters.len());
                    available.saturating_sub(notified)
                }
            };
            while freed > 0 {
                let Some(call) = state.slot_waiters.pop_front() else {
                    break;
                };
                calls.push(call);
                freed -= 1;
            }
        }
        for call in calls {
            self.shared.sched.schedule(call);
        }
    }

    /// Call back once a connection slot may be free. Waiters that already
    /// waited once go first.
    pub(crate) fn call_when_available(&self, call: AsyncCall, priority: bool) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.all_waiters += 1;
            if priority {
                state.slot_waiters.push_front(call);
            } else {
                state.slot_waiters.push_back(call);
            }
        }
        self.busy_checkpoint();
    }

    /// A notified slot waiter is done waiting.
    pub(crate) fn note_gone_waiter(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            state.all_waiters = state.all_waiters.saturating_sub(1);
        }
        self.busy_checkpoint();
    }

    /// Missing or stale options are fetched on demand, but not more often
    /// than [`MIN_UPDATE_GAP`]. A suspended service waits for its scheduled
    /// update.
    fn need_new_options(&self, state: &ServiceState, now: Instant) -> bool {
        if state.detached || state.suspended.is_some() || self.has_options_in(state) {
            return false;
        }
        match state.last_update {
            Some(last) => now >= last + MIN_UPDATE_GAP,
            None => true,
        }
    }

    /// Call back once the service state is known, fetching OPTIONS first if
    /// needed.
    pub(crate) fn call_when_ready(&self, call: AsyncCall) {
        if self.is_detached() {
            // the companion job may be gone already
            self.shared.sched.schedule(call);
            return;
        }
        let now = self.now();
        let (fetch, busy) = {
            let mut state = self.shared.state.borrow_mut();
            state.clients.push(call);
            let busy = state.fetching || state.notifying;
            (self.need_new_options(&state, now), busy)
        };
        if busy {
            return;
        }
        if fetch {
            self.start_getting_options();
        } else {
            self.schedule_notification();
        }
    }

    fn schedule_notification(&self) {
        let rep = {
            let mut state = self.shared.state.borrow_mut();
            if state.notify_scheduled {
                return;
            }
            state.notify_scheduled = true;
            state.rep.clone()
        };
        if let Some(rep) = rep {
            rep.call("ServiceRep::noteTimeToNotify", |r, _ctx| {
                r.service().note_time_to_notify();
                Ok(())
            });
        }
    }

    fn note_time_to_notify(&self) {
        let clients = {
            let mut state = self.shared.state.borrow_mut();
            state.notify_scheduled = false;
            state.notifying = true;
            std::mem::take(&mut state.clients)
        };
        debug!(
            "ICAP service {} notifies {} clients",
            self.shared.name,
            clients.len()
        );
        for call in clients.into_iter().rev() {
            self.shared.sched.schedule(call);
        }
        self.shared.state.borrow_mut().notifying = false;
    }

    fn start_getting_options(&self) {
        let Some(sched) = self.shared.sched.upgrade() else {
            return;
        };
        let rep = {
            let mut state = self.shared.state.borrow_mut();
            if state.fetching {
                return;
            }
            let Some(rep) = state.rep.clone() else {
                return;
            };
            state.fetching = true;
            rep
        };
        debug!("ICAP service {} will fetch OPTIONS", self.shared.name);
        sched.start_job(OptXact::new(self.clone(), InitiateCore::for_initiator(&rep)));
    }

    fn note_options_fetched(&self, options: Option<IcapServiceOptions>) {
        self.shared.state.borrow_mut().fetching = false;
        self.handle_new_options(options);
    }

    fn handle_new_options(&self, options: Option<IcapServiceOptions>) {
        self.change_options(options);
        debug!("got new options and is now {}", self.status());

        let when = self.options_fetch_time();
        self.schedule_update(when);

        {
            let mut state = self.shared.state.borrow_mut();
            let from_options = state.options.as_ref().and_then(|o| o.max_connections());
            // the local limit takes precedence over what the service says
            state.max_connections = self.shared.config.max_connections.or(from_options);
            state.overload_reported = false;
            let excess = IcapService::excess_connections(&state);
            if excess > 0 {
                let n = excess.min(state.idle.len());
                IcapService::close_idle(&mut state, n);
            }
        }
        self.busy_checkpoint();
        self.schedule_notification();
    }

    fn change_options(&self, options: Option<IcapServiceOptions>) {
        let now = self.now();
        {
            let mut state = self.shared.state.borrow_mut();
            state.options = options;
            state.failures.clear();
            state.suspended = None;
            state.last_update = Some(now);
        }
        self.check_options();
        self.announce_status_change("down after an options fetch failure", true);
    }

    fn check_options(&self) {
        let state = self.shared.state.borrow();
        let Some(options) = &state.options else {
            warn!("failed to fetch OPTIONS from ICAP service {}", self.shared.name);
            return;
        };
        if let Some(e) = options.error() {
            warn!(
                "unusable OPTIONS response from ICAP service {}: {e}",
                self.shared.name
            );
            return;
        }

        let method = self.shared.config.method();
        if !options.methods().is_empty() && !options.methods().contains(&method) {
            warn!(
                "ICAP service {} does not list {method} in its supported methods",
                self.shared.name
            );
        }

        if let Some(date) = options.date() {
            let skew = (Utc::now() - date).abs();
            if skew.to_std().is_ok_and(|skew| skew > options.ttl()) {
                warn!(
                    "ICAP service {} clock is skewed by {}s, more than its OPTIONS TTL",
                    self.shared.name,
                    skew.num_seconds()
                );
            }
        }
    }

    fn options_fetch_time(&self) -> Instant {
        let now = self.now();
        let state = self.shared.state.borrow();
        match &state.options {
            Some(o) if o.valid() => {
                if o.ttl() <= OPTIONS_FETCH_WAIT {
                    now
                } else {
                    o.expire() - OPTIONS_FETCH_WAIT
                }
            }
            _ => now + self.shared.config.service_revival_delay,
        }
    }

    fn schedule_update(&self, when: Instant) {
        let now = self.now();
        let Some(sched) = self.shared.sched.upgrade() else {
            return;
        };
        let mut state = self.shared.state.borrow_mut();
        if let Some(t) = state.update_timer.take() {
            t.cancel("rescheduled");
        }
        let Some(rep) = state.rep.clone() else {
            return;
        };

        let mut when = when.max(now);
        if let Some(last) = state.last_update {
            when = when.max(last + MIN_UPDATE_GAP);
        }
        let delay = when - now;
        debug!(
            "ICAP service {} will fetch OPTIONS in {}s",
            self.shared.name,
            delay.as_secs()
        );
        let call = rep.async_call("ServiceRep::noteTimeToUpdate", |r, _ctx| {
            r.service().note_time_to_update();
            Ok(())
        });
        state.update_timer = Some(sched.schedule_timer(delay, call));
    }

    fn note_time_to_update(&self) {
        let skip = {
            let mut state = self.shared.state.borrow_mut();
            state.update_timer = None;
            state.detached || state.fetching
        };
        if skip {
            debug!("ICAP service {} ignores OPTIONS update", self.shared.name);
            return;
        }
        debug!("ICAP service {} performs a regular OPTIONS update", self.shared.name);
        self.start_getting_options();
    }

    /// Count a failed transaction and suspend the service if there are too
    /// many of them.
    pub(crate) fn note_failure(&self) {
        let now = self.now();
        let failures = {
            let mut state = self.shared.state.borrow_mut();
            let failures = state.failures.count(now);
            if state.suspended.is_some() {
                return;
            }
            failures
        };
        debug!(
            "ICAP service {} failures: {failures}, limit {:?}",
            self.shared.name, self.shared.config.service_failure_limit
        );
        if let Some(limit) = self.shared.config.service_failure_limit {
            if failures > limit {
                self.suspend("too many failures");
            }
        }
    }

    fn suspend(&self, reason: &'static str) {
        {
            let mut state = self.shared.state.borrow_mut();
            if let Some(current) = state.suspended {
                debug!(
                    "keeping ICAP service {} suspended for {current}, also for {reason}",
                    self.shared.name
                );
                return;
            }
            state.suspended = Some(reason);
        }
        info!("suspending ICAP service {} for {reason}", self.shared.name);
        self.schedule_update(self.now() + self.shared.config.service_revival_delay);
        self.announce_status_change("suspended", true);
    }

    fn announce_status_change(&self, down_phrase: &str, important: bool) {
        let up = self.up();
        let mut state = self.shared.state.borrow_mut();
        if state.announced_up == up {
            return;
        }
        let what = if self.shared.config.bypass() {
            "optional"
        } else {
            "essential"
        };
        let phrase = if state.announced_up { down_phrase } else { "up" };
        state.announced_up = up;
        drop(state);
        let status = self.status();
        if important {
            info!(
                "{what} ICAP service is {phrase}: {} {status}",
                self.shared.config.url()
            );
        } else {
            debug!(
                "{what} ICAP service is {phrase}: {} {status}",
                self.shared.config.url()
            );
        }
    }

    /// Stop using the service. In-flight transactions finish on their own.
    pub fn detach(&self) {
        let rep = {
            let mut state = self.shared.state.borrow_mut();
            if state.detached {
                return;
            }
            debug!("detaching ICAP service {}", self.shared.name);
            state.detached = true;
            if let Some(t) = state.update_timer.take() {
                t.cancel("detached");
            }
            let n = state.idle.len();
            IcapService::close_idle(&mut state, n);
            state.rep.clone()
        };
        // waiters learn the service is gone
        self.schedule_notification();
        if let Some(rep) = rep {
            rep.call("ServiceRep::noteDetached", |_r, _ctx| Ok(()));
        }
    }

    /// Start adapting the virgin message on behalf of the initiator.
    pub fn start_xaction<I: Initiator>(
        &self,
        initiator: &JobHandle<I>,
        virgin: AdaptationMessage,
    ) -> Option<InitiateHandle> {
        let sched = self.shared.sched.upgrade()?;
        let launcher = super::launcher::IcapLauncher::new(
            self.clone(),
            virgin,
            InitiateCore::for_initiator(initiator),
        );
        Some(InitiateHandle::new(sched.start_job(launcher)))
    }

    pub fn status(&self) -> String {
        let up = self.up();
        let state = self.shared.state.borrow();
        let mut s = String::from("[");
        s.push_str(if up { "up" } else { "down" });
        if state.detached {
            s.push_str(",detached");
        }
        if let Some(reason) = state.suspended {
            s.push_str(",susp(");
            s.push_str(reason);
            s.push(')');
        }
        if state.fetching {
            s.push_str(",fetch");
        }
        if state.notifying || state.notify_scheduled {
            s.push_str(",notif");
        }
        match &state.options {
            None => {
                if state.last_update.is_some() {
                    s.push_str(",!opt");
                }
            }
            Some(o) if !o.valid() => s.push_str(",!valid"),
            Some(o) if !o.fresh(self.now()) => s.push_str(",stale"),
            Some(_) => {}
        }
        if state.busy > 0 || !state.idle.is_empty() {
            s.push_str(&format!(",conns {}/{}", state.busy, state.idle.len()));
        }
        if !state.slot_waiters.is_empty() {
            s.push_str(&format!(",waiters {}", state.slot_waiters.len()));
        }
        s.push(']');
        s
    }
}

#[cfg(test)]
mod tests;
