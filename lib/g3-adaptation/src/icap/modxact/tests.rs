/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::rc::Rc;

use arcstr::ArcStr;
use bytes::{Buf, Bytes};
use http::{HeaderValue, Method, header};
use url::Url;

use g3_async_job::{EventLoop, Job, JobContext};
use g3_body_pipe::{BodyConsumer, BodyPipe, BodyProducer};
use g3_http::{HttpHead, HttpProtocol};

use crate::config::{IcapMethod, IcapServiceConfig};
use crate::icap::IcapService;
use crate::icap::transport::mock::{ConnectPlan, MockTransport};
use crate::{AdaptationAnswer, AdaptationMessage, AdaptationOutcome, InitiateHandle, Initiator};

#[derive(Default)]
struct Record {
    outcome: Option<AdaptationOutcome>,
    head: Option<HttpHead>,
    cause: Option<Rc<HttpHead>>,
    body: Vec<u8>,
    body_ended: bool,
    body_aborted: bool,
    aborts: Vec<bool>,
    virgin: Option<BodyPipe>,
}

/// Plays the HTTP side: produces the virgin body and consumes the answer.
struct Client {
    service: IcapService,
    head: HttpHead,
    cause: Option<Rc<HttpHead>>,
    virgin_body: Option<VirginBody>,
    pending: Bytes,
    adapted: Option<BodyPipe>,
    xact: Option<InitiateHandle>,
    record: Rc<RefCell<Record>>,
}

impl Job for Client {
    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let handle = ctx.handle::<Self>();
        let mut message = AdaptationMessage::new(self.head.clone(), None);
        message.cause = self.cause.clone();
        if let Some(body) = self.virgin_body.take() {
            let pipe = BodyPipe::new(&handle);
            if body.size_known {
                pipe.set_body_size(body.data.len() as u64);
            }
            self.pending = body.data;
            self.produce(&pipe);
            self.record.borrow_mut().virgin = Some(pipe.clone());
            message.body = Some(pipe);
        }
        self.xact = self.service.start_xaction(&handle, message);
        assert!(self.xact.is_some());
        Ok(())
    }

    fn done_all(&self) -> bool {
        false
    }
}

impl BodyProducer for Client {
    fn note_more_body_space_available(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.produce(pipe);
        Ok(())
    }

    fn note_body_consumer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.pending.clear();
        pipe.clear_producer(false);
        Ok(())
    }
}

impl Client {
    /// Put as much of the virgin body as fits. Without a known size the
    /// end is only marked once everything is in.
    fn produce(&mut self, pipe: &BodyPipe) {
        if pipe.production_ended() {
            return;
        }
        let n = pipe.put_more_data(&self.pending);
        self.pending.advance(n);
        if self.pending.is_empty() && !pipe.body_size_known() {
            pipe.clear_producer(true);
        }
    }

    fn finish_adapted(&mut self, pipe: &BodyPipe) {
        pipe.get_more_data(&mut self.record.borrow_mut().body);
        pipe.clear_consumer();
        self.adapted = None;
    }
}

impl BodyConsumer for Client {
    fn note_more_body_data_available(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        pipe.get_more_data(&mut self.record.borrow_mut().body);
        Ok(())
    }

    fn note_body_production_ended(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.record.borrow_mut().body_ended = true;
        self.finish_adapted(pipe);
        Ok(())
    }

    fn note_body_producer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.record.borrow_mut().body_aborted = true;
        self.finish_adapted(pipe);
        Ok(())
    }
}

impl Initiator for Client {
    fn note_adaptation_answer(
        &mut self,
        ctx: &mut JobContext<'_>,
        answer: AdaptationAnswer,
    ) -> anyhow::Result<()> {
        self.xact = None;
        let AdaptationAnswer::Forward { message, outcome } = answer else {
            panic!("unexpected block answer");
        };
        let mut record = self.record.borrow_mut();
        record.outcome = Some(outcome);
        record.head = Some(message.head);
        record.cause = message.cause;
        match message.body {
            Some(pipe) => {
                assert!(pipe.set_consumer_if_not_late(&ctx.handle::<Self>()));
                self.adapted = Some(pipe);
            }
            None => record.body_ended = true,
        }
        Ok(())
    }

    fn note_adaptation_query_abort(
        &mut self,
        _ctx: &mut JobContext<'_>,
        is_final: bool,
    ) -> anyhow::Result<()> {
        self.xact = None;
        self.record.borrow_mut().aborts.push(is_final);
        Ok(())
    }
}

struct VirginBody {
    data: Bytes,
    size_known: bool,
}

impl VirginBody {
    fn with_size(data: Vec<u8>) -> Self {
        VirginBody {
            data: Bytes::from(data),
            size_known: true,
        }
    }

    fn without_size(data: Vec<u8>) -> Self {
        VirginBody {
            data: Bytes::from(data),
            size_known: false,
        }
    }
}

fn new_service<F>(ev: &EventLoop, transport: &MockTransport, method: IcapMethod, f: F) -> IcapService
where
    F: FnOnce(&mut IcapServiceConfig),
{
    let url = format!("icap://127.0.0.1/{}", method.as_str().to_lowercase());
    let mut config = IcapServiceConfig::new(method, Url::parse(&url).unwrap()).unwrap();
    f(&mut config);
    IcapService::new(
        ArcStr::from("test"),
        config,
        ev.scheduler(),
        Rc::new(transport.clone()),
    )
}

fn options_reply(method: IcapMethod) -> Vec<u8> {
    options_reply_allowing(method, "204")
}

fn options_reply_allowing(method: IcapMethod, allow: &str) -> Vec<u8> {
    format!(
        "ICAP/1.0 200 OK\r\n\
         Methods: {method}\r\n\
         ISTag: \"t1\"\r\n\
         Options-TTL: 3600\r\n\
         Preview: 4\r\n\
         Allow: {allow}\r\n\
         Connection: close\r\n\
         Encapsulated: null-body=0\r\n\r\n"
    )
    .into_bytes()
}

fn post_request(size: usize) -> HttpHead {
    let mut head = HttpHead::new_request(
        Method::POST,
        "http://example.net/upload",
        HttpProtocol::Http11,
    );
    head.headers_mut()
        .insert(header::HOST, HeaderValue::from_static("example.net"));
    head.headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    head
}

fn chunked_post_request() -> HttpHead {
    let mut head = HttpHead::new_request(
        Method::POST,
        "http://example.net/upload",
        HttpProtocol::Http11,
    );
    head.headers_mut()
        .insert(header::HOST, HeaderValue::from_static("example.net"));
    head.headers_mut()
        .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    head
}

fn get_request() -> HttpHead {
    let mut head = HttpHead::new_request(
        Method::GET,
        "http://example.net/index.html",
        HttpProtocol::Http11,
    );
    head.headers_mut()
        .insert(header::HOST, HeaderValue::from_static("example.net"));
    head
}

fn start_client(
    ev: &EventLoop,
    service: &IcapService,
    head: HttpHead,
    cause: Option<HttpHead>,
    body: Option<Vec<u8>>,
) -> Rc<RefCell<Record>> {
    start_client_with(ev, service, head, cause, body.map(VirginBody::with_size))
}

fn start_client_with(
    ev: &EventLoop,
    service: &IcapService,
    head: HttpHead,
    cause: Option<HttpHead>,
    body: Option<VirginBody>,
) -> Rc<RefCell<Record>> {
    let record = Rc::new(RefCell::new(Record::default()));
    ev.scheduler().start_job(Client {
        service: service.clone(),
        head,
        cause: cause.map(Rc::new),
        virgin_body: body,
        pending: Bytes::new(),
        adapted: None,
        xact: None,
        record: record.clone(),
    });
    record
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|w| *w == needle)
        .count()
}

/// The chunked body following the ICAP head and the encapsulated HTTP head.
fn encapsulated_body(request: &[u8]) -> &[u8] {
    let mut rest = request;
    for _ in 0..2 {
        let p = rest.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        rest = &rest[p + 4..];
    }
    rest
}

fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let p = data.windows(2).position(|w| w == b"\r\n").unwrap();
        let line = std::str::from_utf8(&data[..p]).unwrap();
        let size = usize::from_str_radix(line.split(';').next().unwrap().trim(), 16).unwrap();
        data = &data[p + 2..];
        if size == 0 {
            assert_eq!(data, b"\r\n");
            return body;
        }
        body.extend_from_slice(&data[..size]);
        assert_eq!(&data[size..size + 2], b"\r\n");
        data = &data[size + 2..];
    }
}

/// A 200 answer carrying only the adapted request head.
fn adapted_without_body() -> Vec<u8> {
    let adapted_head = b"POST /upload HTTP/1.1\r\nHost: example.net\r\nContent-Length: 0\r\n\r\n";
    let mut reply = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"t1\"\r\nEncapsulated: req-hdr=0, null-body={}\r\n\r\n",
        adapted_head.len()
    )
    .into_bytes();
    reply.extend_from_slice(adapted_head);
    reply
}

const NO_CONTENT: &[u8] = b"ICAP/1.0 204 No Content\r\nISTag: \"t1\"\r\nEncapsulated: null-body=0\r\n\r\n";

/// Bring the first transaction up to the paused preview of a 10000-byte
/// POST body.
fn paused_after_preview(
    ev: &EventLoop,
    transport: &MockTransport,
    service: &IcapService,
) -> Rc<RefCell<Record>> {
    let record = start_client(ev, service, post_request(10000), None, Some(vec![b'a'; 10000]));
    ev.run_until_idle();
    assert_eq!(transport.connections(), 1);
    let options = transport.take_written(0);
    assert!(options.starts_with(b"OPTIONS icap://127.0.0.1/reqmod ICAP/1.0\r\n"));

    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();
    assert!(service.up());
    assert!(!transport.is_open(0));
    assert_eq!(transport.connections(), 2);

    let request = transport.take_written(1);
    assert!(request.starts_with(b"REQMOD icap://127.0.0.1/reqmod ICAP/1.0\r\n"));
    assert_eq!(count(&request, b"Preview: 4\r\n"), 1);
    assert_eq!(count(&request, b"Allow: 204\r\n"), 1);
    assert_eq!(count(&request, b"Encapsulated: req-hdr=0, req-body="), 1);
    assert!(request.ends_with(b"\r\n\r\n4\r\naaaa\r\n0\r\n\r\n"));
    assert!(transport.has_pending_read(1));
    record
}

#[test]
fn continue_after_preview() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});
    let record = paused_after_preview(&ev, &transport, &service);

    transport.push(1, b"ICAP/1.0 100 Continue\r\n\r\n");
    ev.run_until_idle();
    let mut expected = format!("{:x}\r\n", 9996).into_bytes();
    expected.extend_from_slice(&[b'a'; 9996]);
    expected.extend_from_slice(b"\r\n0\r\n\r\n");
    assert_eq!(transport.take_written(1), expected);
    assert!(record.borrow().outcome.is_none());

    let adapted_head = b"POST /upload HTTP/1.1\r\nHost: example.net\r\n\r\n";
    let mut reply = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"t1\"\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
        adapted_head.len()
    )
    .into_bytes();
    reply.extend_from_slice(adapted_head);
    reply.extend_from_slice(b"1f4\r\n");
    reply.extend_from_slice(&[b'b'; 500]);
    reply.extend_from_slice(b"\r\n0\r\n\r\n");
    transport.push(1, &reply);
    ev.run_until_idle();

    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    let head = record.head.as_ref().unwrap();
    assert_eq!(head.method(), Some(&Method::POST));
    assert!(record.body_ended);
    assert!(!record.body_aborted);
    assert_eq!(record.body, vec![b'b'; 500]);
    assert!(record.aborts.is_empty());
    let virgin = record.virgin.as_ref().unwrap();
    assert_eq!(virgin.consumed_size(), 10000);
    assert!(virgin.exhausted());

    // the connection went back to the pool
    assert!(transport.is_open(1));
    assert_eq!(service.idle_connections(), 1);
    assert_eq!(service.busy_connections(), 0);
    // the client and the service companion are all that is left
    assert_eq!(ev.job_count(), 2);
}

#[test]
fn no_content_after_preview_echoes_virgin() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});
    let record = paused_after_preview(&ev, &transport, &service);

    transport.push(1, NO_CONTENT);
    ev.run_until_idle();
    // nothing more is sent after a 204
    assert!(transport.take_written(1).is_empty());

    {
        let record = record.borrow();
        assert_eq!(record.outcome, Some(AdaptationOutcome::Unmodified));
        assert_eq!(record.head.as_ref().unwrap().content_length(), Some(10000));
        assert!(record.body_ended);
        assert_eq!(record.body, vec![b'a'; 10000]);
    }
    assert_eq!(service.idle_connections(), 1);

    // a second transaction reuses the idle connection
    let second = start_client(&ev, &service, get_request(), None, None);
    ev.run_until_idle();
    assert_eq!(transport.connect_attempts(), 2);
    let request = transport.take_written(1);
    assert!(request.starts_with(b"REQMOD "));
    assert_eq!(count(&request, b"Encapsulated: req-hdr=0, null-body="), 1);
    assert_eq!(count(&request, b"Preview: 0\r\n"), 1);

    transport.push(1, NO_CONTENT);
    ev.run_until_idle();
    let second = second.borrow();
    assert_eq!(second.outcome, Some(AdaptationOutcome::Unmodified));
    assert!(second.body.is_empty());
    assert!(second.body_ended);
}

#[test]
fn bypass_after_retry() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    transport.plan(&[ConnectPlan::Accept, ConnectPlan::Refuse, ConnectPlan::Refuse]);
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |c| c.set_bypass(true));

    let record = start_client(&ev, &service, post_request(1000), None, Some(vec![b'x'; 1000]));
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    assert_eq!(transport.connect_attempts(), 3);
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Bypassed));
    assert_eq!(record.body, vec![b'x'; 1000]);
    assert!(record.body_ended);
    assert!(record.aborts.is_empty());
    assert_eq!(service.busy_connections(), 0);
}

#[test]
fn final_abort_after_retry() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    transport.plan(&[ConnectPlan::Accept, ConnectPlan::Refuse, ConnectPlan::Refuse]);
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let record = start_client(&ev, &service, post_request(1000), None, Some(vec![b'x'; 1000]));
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    // one OPTIONS fetch, then the first try and a single retry
    assert_eq!(transport.connect_attempts(), 3);
    let record = record.borrow();
    assert!(record.outcome.is_none());
    assert_eq!(record.aborts, [true]);
    assert_eq!(ev.job_count(), 2);
}

#[test]
fn broken_service_fails_fast() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    transport.plan(&[ConnectPlan::Refuse]);
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let record = start_client(&ev, &service, get_request(), None, None);
    ev.run_until_idle();
    assert!(service.broken());
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(record.borrow().aborts, [true]);
}

#[test]
fn respmod_replaces_response() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Respmod, |c| {
        c.set_send_client_ip(true)
    });

    let mut response = HttpHead::new_response(HttpProtocol::Http11, 200, "OK");
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    let record = start_client(&ev, &service, response, Some(get_request()), None);
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Respmod));
    ev.run_until_idle();

    let request = transport.take_written(1);
    assert!(request.starts_with(b"RESPMOD "));
    assert_eq!(count(&request, b"req-hdr=0, res-hdr="), 1);
    assert_eq!(count(&request, b"null-body="), 1);
    assert_eq!(count(&request, b"Preview: 0\r\n"), 1);
    // hop-by-hop fields stay out of the encapsulated heads
    assert_eq!(count(&request, b"Connection:"), 0);
    // no client address to send
    assert_eq!(count(&request, b"X-Client-IP"), 0);

    let req_head = b"GET /index.html HTTP/1.1\r\nHost: example.net\r\n\r\n";
    let res_head = b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\n\r\n";
    let mut reply = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"t1\"\r\nEncapsulated: req-hdr=0, res-hdr={}, res-body={}\r\n\r\n",
        req_head.len(),
        req_head.len() + res_head.len()
    )
    .into_bytes();
    reply.extend_from_slice(req_head);
    reply.extend_from_slice(res_head);
    reply.extend_from_slice(b"5\r\nhello\r\n0\r\n\r\n");
    transport.push(1, &reply);
    ev.run_until_idle();

    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    assert_eq!(record.head.as_ref().unwrap().status_code(), Some(403));
    let cause = record.cause.as_ref().unwrap();
    assert_eq!(cause.method(), Some(&Method::GET));
    assert_eq!(record.body, b"hello");
    assert!(record.body_ended);
}

#[test]
fn unexpected_continue_aborts() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let record = start_client(&ev, &service, get_request(), None, None);
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();
    assert!(!transport.take_written(1).is_empty());

    // the whole (empty) body was in the preview already
    transport.push(1, b"ICAP/1.0 100 Continue\r\n\r\n");
    ev.run_until_idle();
    assert_eq!(record.borrow().aborts, [true]);
    assert!(!transport.is_open(1));
    assert!(transport.was_reset(1));
    assert_eq!(service.idle_connections(), 0);
}

#[test]
fn waits_for_free_slot() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |c| c.set_max_connections(1));

    let first = start_client(&ev, &service, get_request(), None, None);
    let second = start_client(&ev, &service, get_request(), None, None);
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    // only one transaction got the slot
    assert_eq!(transport.connections(), 2);
    assert_eq!(service.busy_connections(), 1);
    assert_eq!(count(&transport.take_written(1), b"REQMOD "), 1);

    transport.push(1, NO_CONTENT);
    ev.run_until_idle();
    // the waiter took over the pooled connection
    assert_eq!(transport.connections(), 2);
    assert_eq!(count(&transport.take_written(1), b"REQMOD "), 1);
    transport.push(1, NO_CONTENT);
    ev.run_until_idle();

    for record in [first, second] {
        assert_eq!(record.borrow().outcome, Some(AdaptationOutcome::Unmodified));
    }
    assert_eq!(service.busy_connections(), 0);
}

#[test]
fn truncated_body_aborts_producer() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});
    let record = paused_after_preview(&ev, &transport, &service);

    let adapted_head = b"POST /upload HTTP/1.1\r\nHost: example.net\r\n\r\n";
    let mut reply = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"t1\"\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
        adapted_head.len()
    )
    .into_bytes();
    reply.extend_from_slice(adapted_head);
    reply.extend_from_slice(b"a\r\n01234");
    transport.push(1, &reply);
    ev.run_until_idle();
    assert_eq!(record.borrow().outcome, Some(AdaptationOutcome::Adapted));

    transport.push_eof(1);
    ev.run_until_idle();
    let record = record.borrow();
    assert_eq!(record.body, b"01234");
    assert!(record.body_aborted);
    assert!(!record.body_ended);
}

#[test]
fn unknown_size_body_is_sent_whole() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let data = vec![b'u'; 100_000];
    let record = start_client_with(
        &ev,
        &service,
        chunked_post_request(),
        None,
        Some(VirginBody::without_size(data.clone())),
    );
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    let request = transport.take_written(1);
    assert!(request.starts_with(b"REQMOD "));
    // neither a preview nor a 204 is possible without a known size
    assert_eq!(count(&request, b"Preview:"), 0);
    assert_eq!(count(&request, b"Allow:"), 0);
    assert_eq!(count(&request, b"Encapsulated: req-hdr=0, req-body="), 1);
    assert_eq!(dechunk(encapsulated_body(&request)), data);
    assert_eq!(
        record.borrow().virgin.as_ref().unwrap().consumed_size(),
        100_000
    );

    transport.push(1, &adapted_without_body());
    ev.run_until_idle();
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    assert!(record.body_ended);
    assert!(record.aborts.is_empty());
}

#[test]
fn large_body_keeps_preview_without_204() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let size = BodyPipe::MAX_CAPACITY + 1000;
    let record = start_client(&ev, &service, post_request(size), None, Some(vec![b'a'; size]));
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    let request = transport.take_written(1);
    assert_eq!(count(&request, b"Preview: 4\r\n"), 1);
    // the body cannot be kept whole for a 204 after the preview
    assert_eq!(count(&request, b"Allow:"), 0);
    assert!(request.ends_with(b"\r\n\r\n4\r\naaaa\r\n0\r\n\r\n"));

    transport.push(1, b"ICAP/1.0 100 Continue\r\n\r\n");
    ev.run_until_idle();
    assert_eq!(dechunk(&transport.take_written(1)), vec![b'a'; size - 4]);
    assert_eq!(
        record.borrow().virgin.as_ref().unwrap().consumed_size(),
        size as u64
    );

    transport.push(1, &adapted_without_body());
    ev.run_until_idle();
    assert_eq!(record.borrow().outcome, Some(AdaptationOutcome::Adapted));
}

#[test]
fn large_body_after_retry() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    transport.plan(&[ConnectPlan::Accept, ConnectPlan::Refuse]);
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |c| c.set_bypass(true));

    let size = 3 * BodyPipe::MAX_CAPACITY;
    let record = start_client(&ev, &service, post_request(size), None, Some(vec![b'r'; size]));
    ev.run_until_idle();
    transport.push(0, &options_reply(IcapMethod::Reqmod));
    ev.run_until_idle();

    // the refused first try kept the whole body for the retry
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(transport.connections(), 2);
    let virgin = record.borrow().virgin.clone().unwrap();
    assert_eq!(virgin.consumed_size(), 0);
    assert_eq!(virgin.buffered_size(), BodyPipe::MAX_CAPACITY);
    let request = transport.take_written(1);
    assert!(request.ends_with(b"\r\n\r\n4\r\nrrrr\r\n0\r\n\r\n"));

    // once the full pipe is consumed nothing can be bypassed any more
    transport.push(1, b"ICAP/1.0 100 Continue\r\n\r\n");
    ev.run_until_idle();
    assert_eq!(dechunk(&transport.take_written(1)), vec![b'r'; size - 4]);
    assert_eq!(virgin.consumed_size(), size as u64);

    transport.push(1, &adapted_without_body());
    ev.run_until_idle();
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    assert!(record.aborts.is_empty());
}

#[test]
fn partial_content_uses_virgin_tail() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |_| {});

    let mut data = b"abcd".to_vec();
    data.extend_from_slice(&[b'x'; 996]);
    let record = start_client(&ev, &service, post_request(1000), None, Some(data));
    ev.run_until_idle();
    transport.push(0, &options_reply_allowing(IcapMethod::Reqmod, "204, 206"));
    ev.run_until_idle();

    let request = transport.take_written(1);
    assert_eq!(count(&request, b"Allow: 204, 206\r\n"), 1);
    assert!(request.ends_with(b"\r\n\r\n4\r\nabcd\r\n0\r\n\r\n"));

    let adapted_head = b"POST /upload HTTP/1.1\r\nHost: example.net\r\n\r\n";
    let mut reply = format!(
        "ICAP/1.0 206 Partial Content\r\nISTag: \"t1\"\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
        adapted_head.len()
    )
    .into_bytes();
    reply.extend_from_slice(adapted_head);
    reply.extend_from_slice(b"4\r\nABCD\r\n0; use-original-body=4\r\n\r\n");
    transport.push(1, &reply);
    ev.run_until_idle();
    // a partial answer ends the preview
    assert!(transport.take_written(1).is_empty());

    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    assert!(record.body_ended);
    assert!(!record.body_aborted);
    let mut expected = b"ABCD".to_vec();
    expected.extend_from_slice(&[b'x'; 996]);
    assert_eq!(record.body, expected);
    assert!(record.aborts.is_empty());
    assert_eq!(service.idle_connections(), 1);
}

#[test]
fn partial_content_needs_permission() {
    let ev = EventLoop::with_manual_clock();
    let transport = MockTransport::new();
    let service = new_service(&ev, &transport, IcapMethod::Reqmod, |c| c.set_allow_206(false));

    let record = start_client(&ev, &service, post_request(1000), None, Some(vec![b'a'; 1000]));
    ev.run_until_idle();
    transport.push(0, &options_reply_allowing(IcapMethod::Reqmod, "204, 206"));
    ev.run_until_idle();
    let request = transport.take_written(1);
    assert_eq!(count(&request, b"Allow: 204\r\n"), 1);

    transport.push(
        1,
        b"ICAP/1.0 206 Partial Content\r\nISTag: \"t1\"\r\nEncapsulated: null-body=0\r\n\r\n",
    );
    ev.run_until_idle();
    let record = record.borrow();
    assert!(record.outcome.is_none());
    assert_eq!(record.aborts, [true]);
}
