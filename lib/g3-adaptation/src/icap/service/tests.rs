/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use arcstr::ArcStr;
use url::Url;

use g3_async_job::{EventLoop, Job, JobContext};

use super::*;
use crate::config::IcapMethod;
use crate::icap::transport::mock::{ConnectPlan, MockTransport};

const OPTIONS_REPLY: &[u8] = b"ICAP/1.0 200 OK\r\n\
    Methods: REQMOD\r\n\
    ISTag: \"t1\"\r\n\
    Options-TTL: 3600\r\n\
    Preview: 4\r\n\
    Allow: 204\r\n\
    Connection: close\r\n\
    Encapsulated: null-body=0\r\n\r\n";

/// Waits for the service to be ready, counting notifications.
struct ReadyWaiter {
    service: IcapService,
    ready: Rc<Cell<usize>>,
}

impl Job for ReadyWaiter {
    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let call = ctx
            .handle::<Self>()
            .async_call("ReadyWaiter::noteReady", |w: &mut Self, _ctx| {
                w.ready.set(w.ready.get() + 1);
                Ok(())
            });
        self.service.call_when_ready(call);
        Ok(())
    }

    fn done_all(&self) -> bool {
        false
    }
}

/// Waits for a free connection slot, then gives it back at once.
struct SlotWaiter {
    service: IcapService,
    notified: Rc<Cell<usize>>,
}

impl Job for SlotWaiter {
    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let call = ctx
            .handle::<Self>()
            .async_call("SlotWaiter::noteAvailable", |w: &mut Self, _ctx| {
                w.notified.set(w.notified.get() + 1);
                w.service.note_gone_waiter();
                Ok(())
            });
        self.service.call_when_available(call, false);
        Ok(())
    }

    fn done_all(&self) -> bool {
        false
    }
}

fn new_service<F>(ev: &EventLoop, transport: &MockTransport, f: F) -> IcapService
where
    F: FnOnce(&mut IcapServiceConfig),
{
    let url = Url::parse("icap://127.0.0.1/reqmod").unwrap();
    let mut config = IcapServiceConfig::new(IcapMethod::Reqmod, url).unwrap();
    f(&mut config);
    IcapService::new(
        ArcStr::from("test"),
        config,
        ev.scheduler(),
        Rc::new(transport.clone()),
    )
}

fn wait_ready(ev: &EventLoop, service: &IcapService) -> Rc<Cell<usize>> {
    let ready = Rc::new(Cell::new(0));
    ev.scheduler().start_job(ReadyWaiter {
        service: service.clone(),
        ready: ready.clone(),
    });
    ready
}

/// Get the service up through its first OPTIONS fetch on connection 0.
fn bring_up(ev: &EventLoop, transport: &MockTransport, service: &IcapService) {
    let ready = wait_ready(ev, service);
    ev.run_until_idle();
    transport.push(0, OPTIONS_REPLY);
    ev.run_until_idle();
    assert_eq!(ready.get(), 1);
    assert!(service.up());
}

#[test]
fn options_fetched_once() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |_| {});
    assert!(!service.probed());
    assert!(!service.broken());

    let first = wait_ready(&ev, &service);
    let second = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(transport.connections(), 1);
    let request = transport.take_written(0);
    assert!(request.starts_with(b"OPTIONS icap://127.0.0.1/reqmod ICAP/1.0\r\n"));
    assert!(request.ends_with(b"Allow: 204\r\n\r\n"));
    assert_eq!(first.get(), 0);

    transport.push(0, OPTIONS_REPLY);
    ev.run_until_idle();
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 1);
    assert!(service.up());
    assert!(service.has_options());
    assert_eq!(service.wants_preview("/index.html"), Some(4));
    assert!(service.allows_204());
    assert!(!transport.is_open(0));

    // a ready service notifies without fetching again
    let third = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(third.get(), 1);
    assert_eq!(transport.connections(), 1);
}

#[test]
fn options_refreshed_before_expiry() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |_| {});
    bring_up(&ev, &transport, &service);

    ev.advance_and_run(Duration::from_secs(3600 - 21));
    assert_eq!(transport.connections(), 1);
    ev.advance_and_run(Duration::from_secs(1));
    assert_eq!(transport.connections(), 2);
    assert!(transport.take_written(1).starts_with(b"OPTIONS "));
    // the old options are still in use meanwhile
    assert!(service.up());

    transport.push(1, OPTIONS_REPLY);
    ev.run_until_idle();
    ev.advance_and_run(Duration::from_secs(3600 - 21));
    assert!(service.up());
    assert_eq!(transport.connections(), 2);
}

#[test]
fn failed_fetch_breaks_service() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    transport.plan(&[ConnectPlan::Refuse]);
    let service = new_service(&ev, &transport, |c| {
        c.set_service_revival_delay(Duration::from_secs(60))
    });

    let ready = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(ready.get(), 1);
    assert!(service.probed());
    assert!(service.broken());
    assert!(service.status().contains("!opt"));

    // retried after the revival delay
    ev.advance_and_run(Duration::from_secs(60));
    assert_eq!(transport.connect_attempts(), 2);
    transport.push(0, OPTIONS_REPLY);
    ev.run_until_idle();
    assert!(service.up());
}

#[test]
fn suspended_after_failures() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |c| {
        c.set_service_failure_limit(Some(1));
        c.set_service_revival_delay(Duration::from_secs(60));
    });
    bring_up(&ev, &transport, &service);

    service.note_failure();
    assert!(service.up());
    service.note_failure();
    assert!(service.is_suspended());
    assert!(!service.up());
    assert!(service.broken());

    // no fetch before the revival delay, even with a waiter
    let ready = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(ready.get(), 1);
    assert_eq!(transport.connections(), 1);

    ev.advance_and_run(Duration::from_secs(60));
    assert_eq!(transport.connections(), 2);
    transport.push(1, OPTIONS_REPLY);
    ev.run_until_idle();
    assert!(!service.is_suspended());
    assert!(service.up());
}

#[test]
fn broken_service_fetches_on_demand() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |_| {});
    bring_up(&ev, &transport, &service);

    // the regular update fails and leaves the service without options
    transport.plan(&[ConnectPlan::Refuse]);
    ev.advance_and_run(Duration::from_secs(3600 - 20));
    assert_eq!(transport.connect_attempts(), 2);
    assert!(service.broken());
    assert!(!service.is_suspended());

    // too soon after the last fetch
    let early = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(early.get(), 1);
    assert_eq!(transport.connect_attempts(), 2);

    // a waiter does not have to wait for the revival delay
    ev.advance_and_run(MIN_UPDATE_GAP);
    assert_eq!(transport.connect_attempts(), 2);
    let late = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(late.get(), 0);
    transport.push(1, OPTIONS_REPLY);
    ev.run_until_idle();
    assert_eq!(late.get(), 1);
    assert!(service.up());
}

#[test]
fn unlimited_failures_never_suspend() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |c| c.set_service_failure_limit(None));
    bring_up(&ev, &transport, &service);

    for _ in 0..100 {
        service.note_failure();
    }
    assert!(service.up());
}

#[test]
fn slot_waiters() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |c| c.set_max_connections(1));
    bring_up(&ev, &transport, &service);
    assert!(service.available_for_new());

    assert!(service.get_connection(false).is_none());
    assert_eq!(service.busy_connections(), 1);
    assert!(!service.available_for_new());
    assert!(!service.available_for_old());

    let notified = Rc::new(Cell::new(0));
    ev.scheduler().start_job(SlotWaiter {
        service: service.clone(),
        notified: notified.clone(),
    });
    ev.run_until_idle();
    assert_eq!(notified.get(), 0);
    assert!(service.status().contains("waiters 1"));

    service.note_connection_failed();
    // a notified waiter still holds its claim on the free slot
    assert!(!service.available_for_new());
    assert!(service.available_for_old());
    ev.run_until_idle();
    assert_eq!(notified.get(), 1);
    assert!(service.available_for_new());
}

#[test]
fn detach() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, |_| {});
    bring_up(&ev, &transport, &service);
    let jobs = ev.job_count();

    service.detach();
    assert!(service.is_detached());
    assert!(!service.up());
    ev.run_until_idle();
    // the companion job is gone
    assert_eq!(ev.job_count(), jobs - 1);

    // waiters learn the state right away, without a fetch
    let ready = wait_ready(&ev, &service);
    ev.run_until_idle();
    assert_eq!(ready.get(), 1);
    assert_eq!(transport.connections(), 1);
}
