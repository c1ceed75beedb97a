/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use http::{HeaderValue, Method, header};

use g3_async_job::{EventLoop, Job, JobContext};
use g3_body_pipe::{BodyConsumer, BodyPipe, BodyProducer};
use g3_http::HttpProtocol;

use super::*;
use crate::{AdaptationAnswer, AdaptationOutcome};

#[derive(Clone, Copy)]
enum Behavior {
    Pass,
    Upper,
    Replace,
    Block,
    Fail,
}

struct TestAdapter {
    behavior: Behavior,
}

impl LocalAdapterService for TestAdapter {
    fn uri(&self) -> &str {
        "ecap://test/adapter"
    }

    fn make_xaction(&self) -> Box<dyn LocalAdapterXaction> {
        Box::new(TestXaction {
            behavior: self.behavior,
        })
    }
}

struct TestXaction {
    behavior: Behavior,
}

impl LocalAdapterXaction for TestXaction {
    fn start(
        &mut self,
        virgin: &HttpHead,
        _cause: Option<&HttpHead>,
    ) -> anyhow::Result<AdapterDecision> {
        match self.behavior {
            Behavior::Pass => Ok(AdapterDecision::UseVirgin),
            Behavior::Upper => {
                let mut head = virgin.clone();
                head.headers_mut()
                    .insert("x-adapted", HeaderValue::from_static("upper"));
                head.headers_mut().remove(header::CONTENT_LENGTH);
                Ok(AdapterDecision::UseAdapted {
                    head,
                    has_body: true,
                })
            }
            Behavior::Replace => {
                let mut head = HttpHead::new_response(HttpProtocol::Http11, 403, "Forbidden");
                head.headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                Ok(AdapterDecision::UseAdapted {
                    head,
                    has_body: false,
                })
            }
            Behavior::Block => Ok(AdapterDecision::Block),
            Behavior::Fail => Err(anyhow!("adapter is broken")),
        }
    }

    fn adapt_body(&mut self, data: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        out.extend(data.iter().map(|b| b.to_ascii_uppercase()));
        Ok(())
    }

    fn finish_body(&mut self, at_end: bool, out: &mut Vec<u8>) -> anyhow::Result<()> {
        if at_end {
            out.extend_from_slice(b"!");
        }
        Ok(())
    }
}

#[derive(Default)]
struct Record {
    outcome: Option<AdaptationOutcome>,
    head: Option<HttpHead>,
    blocked_by: Option<String>,
    body: Vec<u8>,
    body_ended: bool,
    aborts: Vec<bool>,
}

struct Client {
    service: EcapService,
    head: HttpHead,
    pending: Vec<u8>,
    virgin_pipe: Option<BodyPipe>,
    adapted: Option<BodyPipe>,
    record: Rc<RefCell<Record>>,
}

impl Client {
    fn produce(&mut self) {
        if let Some(pipe) = &self.virgin_pipe {
            if !pipe.production_ended() {
                let n = pipe.put_more_data(&self.pending);
                self.pending.drain(..n);
            }
        }
    }
}

impl Job for Client {
    fn start(&mut self, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        let handle = ctx.handle::<Self>();
        let mut message = AdaptationMessage::new(self.head.clone(), None);
        if !self.pending.is_empty() {
            let pipe = BodyPipe::new(&handle);
            pipe.set_body_size(self.pending.len() as u64);
            message.body = Some(pipe.clone());
            self.virgin_pipe = Some(pipe);
            self.produce();
        }
        assert!(self.service.start_xaction(&handle, message).is_some());
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
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        self.produce();
        Ok(())
    }

    fn note_body_consumer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        Ok(())
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
        pipe.get_more_data(&mut self.record.borrow_mut().body);
        self.record.borrow_mut().body_ended = true;
        pipe.clear_consumer();
        self.adapted = None;
        Ok(())
    }

    fn note_body_producer_aborted(
        &mut self,
        _ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()> {
        pipe.clear_consumer();
        self.adapted = None;
        Ok(())
    }
}

impl Initiator for Client {
    fn note_adaptation_answer(
        &mut self,
        ctx: &mut JobContext<'_>,
        answer: AdaptationAnswer,
    ) -> anyhow::Result<()> {
        let mut record = self.record.borrow_mut();
        match answer {
            AdaptationAnswer::Forward { message, outcome } => {
                record.outcome = Some(outcome);
                record.head = Some(message.head);
                match message.body {
                    Some(pipe) => {
                        assert!(pipe.set_consumer_if_not_late(&ctx.handle::<Self>()));
                        self.adapted = Some(pipe);
                    }
                    None => record.body_ended = true,
                }
            }
            AdaptationAnswer::Block { service } => record.blocked_by = Some(service.to_string()),
        }
        Ok(())
    }

    fn note_adaptation_query_abort(
        &mut self,
        _ctx: &mut JobContext<'_>,
        is_final: bool,
    ) -> anyhow::Result<()> {
        self.record.borrow_mut().aborts.push(is_final);
        Ok(())
    }
}

fn post_request(size: usize) -> HttpHead {
    let mut head = HttpHead::new_request(
        Method::POST,
        "http://example.net/upload",
        HttpProtocol::Http11,
    );
    head.headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    head
}

fn run(behavior: Behavior, bypass: bool, body: Vec<u8>) -> (EventLoop, Rc<RefCell<Record>>) {
    let ev = EventLoop::with_manual_clock();
    let service = EcapService::new(
        ArcStr::from("local"),
        Rc::new(TestAdapter { behavior }),
        bypass,
        ev.scheduler(),
    );
    let record = Rc::new(RefCell::new(Record::default()));
    ev.scheduler().start_job(Client {
        service,
        head: post_request(body.len()),
        pending: body,
        virgin_pipe: None,
        adapted: None,
        record: record.clone(),
    });
    ev.run_until_idle();
    (ev, record)
}

#[test]
fn use_virgin() {
    let (ev, record) = run(Behavior::Pass, false, vec![b'a'; 100]);
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Unmodified));
    assert_eq!(record.body, vec![b'a'; 100]);
    assert!(record.body_ended);
    assert_eq!(ev.job_count(), 1);
}

#[test]
fn use_adapted_body() {
    let (ev, record) = run(Behavior::Upper, false, b"hello world".to_vec());
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    let head = record.head.as_ref().unwrap();
    assert_eq!(head.header_str("x-adapted"), Some("upper"));
    assert_eq!(record.body, b"HELLO WORLD!");
    assert!(record.body_ended);
    assert_eq!(ev.job_count(), 1);
}

#[test]
fn adapted_body_flow_control() {
    let body: Vec<u8> = (0..200_000).map(|i| b'a' + (i % 26) as u8).collect();
    let (ev, record) = run(Behavior::Upper, false, body.clone());
    let record = record.borrow();
    let mut expected = body.to_ascii_uppercase();
    expected.push(b'!');
    assert_eq!(record.body.len(), expected.len());
    assert!(record.body == expected);
    assert!(record.body_ended);
    assert_eq!(ev.job_count(), 1);
}

#[test]
fn use_adapted_without_body() {
    let (ev, record) = run(Behavior::Replace, false, vec![b'a'; 100]);
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Adapted));
    assert_eq!(record.head.as_ref().unwrap().status_code(), Some(403));
    assert!(record.body.is_empty());
    assert!(record.body_ended);
    assert_eq!(ev.job_count(), 1);
}

#[test]
fn block() {
    let (ev, record) = run(Behavior::Block, false, vec![b'a'; 100]);
    let record = record.borrow();
    assert_eq!(record.blocked_by.as_deref(), Some("local"));
    assert!(record.outcome.is_none());
    assert!(record.aborts.is_empty());
    assert_eq!(ev.job_count(), 1);
}

#[test]
fn failure_with_bypass() {
    let (_ev, record) = run(Behavior::Fail, true, vec![b'a'; 100]);
    let record = record.borrow();
    assert_eq!(record.outcome, Some(AdaptationOutcome::Bypassed));
    assert_eq!(record.body, vec![b'a'; 100]);
    assert!(record.aborts.is_empty());
}

#[test]
fn failure_without_bypass() {
    let (ev, record) = run(Behavior::Fail, false, vec![b'a'; 100]);
    let record = record.borrow();
    assert!(record.outcome.is_none());
    assert_eq!(record.aborts, [true]);
    assert_eq!(ev.job_count(), 1);
}
