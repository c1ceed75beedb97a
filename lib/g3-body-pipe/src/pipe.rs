/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::cell::{RefCell, RefMut};
use std::fmt::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};

use g3_async_job::{AsyncCall, JobHandle, JobId, WeakScheduler};

use crate::party::{ConsumerLink, ProducerLink};
use crate::{BodyConsumer, BodyPipeCheckout, BodyProducer};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct PipeInner {
    id: u64,
    sched: WeakScheduler,
    body_size: Option<u64>,
    put_size: u64,
    get_size: u64,
    pub(crate) buf: BytesMut,
    producer: Option<Rc<dyn ProducerLink>>,
    consumer: Option<Rc<dyn ConsumerLink>>,
    must_auto_consume: bool,
    aborted_consumption: bool,
    aborted_production: bool,
    pub(crate) checked_out: bool,
    consumer_calls_pending: u32,
    consumer_calls_to_skip: u32,
}

impl PipeInner {
    fn may_need_more_data(&self) -> bool {
        match self.body_size {
            Some(size) => self.put_size < size,
            None => true,
        }
    }

    fn expect_more_after(&self, offset: u64) -> bool {
        offset < self.put_size || (self.producer.is_some() && self.may_need_more_data())
    }

    pub(crate) fn space_size(&self) -> usize {
        BodyPipe::MAX_CAPACITY.saturating_sub(self.buf.len())
    }

    pub(crate) fn unproduced_size(&self) -> Option<u64> {
        self.body_size.map(|size| size - self.put_size)
    }

    fn skip_consumer_call(&mut self) -> bool {
        if self.consumer_calls_pending > 0 {
            self.consumer_calls_pending -= 1;
        }
        if self.consumer_calls_to_skip > 0 {
            self.consumer_calls_to_skip -= 1;
            true
        } else {
            false
        }
    }

    fn status(&self) -> String {
        let mut s = String::with_capacity(64);
        let _ = write!(s, "[{}<={}", self.get_size, self.put_size);
        match self.body_size {
            Some(size) => {
                let _ = write!(s, "<={size}");
            }
            None => s.push_str("<=?"),
        }
        let _ = write!(s, " {}+{}", self.buf.len(), self.space_size());
        let _ = write!(s, " pipe{}", self.id);
        if let Some(p) = &self.producer {
            let _ = write!(s, " prod{}", p.job_id());
        }
        if let Some(c) = &self.consumer {
            let _ = write!(s, " cons{}", c.job_id());
        }
        if self.must_auto_consume {
            s.push_str(" A");
        }
        if self.aborted_consumption {
            s.push_str(" !C");
        }
        if self.aborted_production {
            s.push_str(" !P");
        }
        if self.checked_out {
            s.push_str(" L");
        }
        s.push(']');
        s
    }
}

impl Drop for PipeInner {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if let Some(p) = &self.producer {
            assert!(
                !p.valid(),
                "body pipe{} destroyed with live producer {}",
                self.id,
                p.job_id()
            );
        }
        if let Some(c) = &self.consumer {
            assert!(
                !c.valid(),
                "body pipe{} destroyed with live consumer {}",
                self.id,
                c.job_id()
            );
        }
    }
}

/// A bounded single producer single consumer byte stream between two jobs.
///
/// The handle is cheap to clone; all clones refer to the same pipe.
#[derive(Clone)]
pub struct BodyPipe {
    inner: Rc<RefCell<PipeInner>>,
}

impl BodyPipe {
    pub const MAX_CAPACITY: usize = 64 * 1024;

    /// Create a pipe produced by the given job.
    pub fn new<P: BodyProducer>(producer: &JobHandle<P>) -> Self {
        let id = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
        let inner = PipeInner {
            id,
            sched: producer.weak_scheduler().clone(),
            body_size: None,
            put_size: 0,
            get_size: 0,
            buf: BytesMut::with_capacity(4096),
            producer: Some(Rc::new(producer.clone())),
            consumer: None,
            must_auto_consume: false,
            aborted_consumption: false,
            aborted_production: false,
            checked_out: false,
            consumer_calls_pending: 0,
            consumer_calls_to_skip: 0,
        };
        debug!("created body pipe{id} for producer {}", producer.id());
        BodyPipe {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub(crate) fn inner_mut(&self) -> RefMut<'_, PipeInner> {
        self.inner.borrow_mut()
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn ptr_eq(&self, other: &BodyPipe) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_body_size(&self, size: u64) {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.body_size.is_none(), "body size is already set");
        assert!(
            inner.put_size <= size,
            "body size {size} is less than the produced size {}",
            inner.put_size
        );
        inner.body_size = Some(size);
        debug!("set body size {}", inner.status());
        let done = inner.put_size == size;
        drop(inner);
        // the body may already be complete
        if done {
            self.clear_producer(true);
        }
    }

    pub fn body_size(&self) -> Option<u64> {
        self.inner.borrow().body_size
    }

    pub fn body_size_known(&self) -> bool {
        self.inner.borrow().body_size.is_some()
    }

    pub fn produced_size(&self) -> u64 {
        self.inner.borrow().put_size
    }

    pub fn consumed_size(&self) -> u64 {
        self.inner.borrow().get_size
    }

    /// Bytes produced but not yet consumed.
    pub fn buffered_size(&self) -> usize {
        self.inner.borrow().buf.len()
    }

    pub fn space_size(&self) -> usize {
        self.inner.borrow().space_size()
    }

    pub fn has_content(&self) -> bool {
        !self.inner.borrow().buf.is_empty()
    }

    /// Bytes the producer still owes, if the body size is known.
    pub fn unproduced_size(&self) -> Option<u64> {
        self.inner.borrow().unproduced_size()
    }

    pub fn may_need_more_data(&self) -> bool {
        self.inner.borrow().may_need_more_data()
    }

    pub fn production_ended(&self) -> bool {
        self.inner.borrow().producer.is_none()
    }

    pub fn production_aborted(&self) -> bool {
        self.inner.borrow().aborted_production
    }

    pub fn consumption_aborted(&self) -> bool {
        self.inner.borrow().aborted_consumption
    }

    /// Whether there is or will be data at or after the given body offset.
    pub fn expect_more_after(&self, offset: u64) -> bool {
        self.inner.borrow().expect_more_after(offset)
    }

    /// No more data will ever become available to the consumer.
    pub fn exhausted(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.expect_more_after(inner.get_size)
    }

    pub fn still_producing(&self, id: JobId) -> bool {
        self.inner
            .borrow()
            .producer
            .as_ref()
            .is_some_and(|p| p.job_id() == id)
    }

    pub fn still_consuming(&self, id: JobId) -> bool {
        self.inner
            .borrow()
            .consumer
            .as_ref()
            .is_some_and(|c| c.job_id() == id)
    }

    pub fn status(&self) -> String {
        self.inner.borrow().status()
    }

    /* producer side */

    /// Append as much of `data` as fits; partial appends are normal.
    pub fn put_more_data(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.checked_out, "put into checked out pipe{}", inner.id);
        assert!(
            inner.producer.is_some(),
            "put into pipe{} after its producer was cleared",
            inner.id
        );

        let mut size = data.len().min(inner.space_size());
        if let Some(left) = inner.unproduced_size() {
            size = size.min(usize::try_from(left).unwrap_or(usize::MAX));
        }
        if size == 0 {
            return 0;
        }
        inner.buf.put_slice(&data[..size]);
        self.post_append(inner, size);
        size
    }

    pub(crate) fn post_append(&self, mut inner: RefMut<'_, PipeInner>, size: usize) {
        assert!(!inner.checked_out);
        inner.put_size += size as u64;
        trace!("added {size} bytes {}", inner.status());
        self.schedule_body_data_notification(&mut inner);

        if !inner.may_need_more_data() {
            drop(inner);
            self.clear_producer(true);
        }
    }

    /// Producer is done. `at_eof` is false when it gives up early.
    pub fn clear_producer(&self, at_eof: bool) {
        let mut inner = self.inner.borrow_mut();
        if inner.producer.take().is_none() {
            return;
        }
        debug!("clearing producer {}", inner.status());
        if at_eof {
            match inner.body_size {
                None => inner.body_size = Some(inner.put_size),
                Some(size) if size != inner.put_size => {
                    debug!("aborting on premature eof {}", inner.status());
                }
                _ => {}
            }
        } else {
            inner.aborted_production = true;
        }
        self.schedule_body_end_notification(&mut inner);
    }

    /* consumer side */

    /// Attach the consumer unless some data has already been consumed.
    pub fn set_consumer_if_not_late<C: BodyConsumer>(&self, consumer: &JobHandle<C>) -> bool {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.consumer.is_none(),
            "pipe{} already has a consumer",
            inner.id
        );
        if inner.get_size > 0 {
            assert!(inner.must_auto_consume);
            debug!("too late to consume {}", inner.status());
            return false;
        }
        assert!(!inner.aborted_consumption);

        inner.consumer = Some(Rc::new(consumer.clone()));
        debug!("set consumer {}", inner.status());
        if !inner.buf.is_empty() {
            self.schedule_body_data_notification(&mut inner);
        }
        if inner.producer.is_none() {
            self.schedule_body_end_notification(&mut inner);
        }
        true
    }

    /// Consumer is done. Leaving unconsumed data behind aborts the producer.
    pub fn clear_consumer(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.consumer.take().is_none() {
            return;
        }
        debug!("clearing consumer {}", inner.status());
        inner.consumer_calls_to_skip = inner.consumer_calls_pending;
        if inner.get_size > 0 && inner.expect_more_after(inner.get_size) {
            debug!("aborting consumption {}", inner.status());
            inner.aborted_consumption = true;
            self.schedule_pipe_call(
                &inner,
                "BodyProducer::noteBodyConsumerAborted",
                BodyPipe::tell_body_consumer_aborted,
            );
        }
    }

    /// Copy all buffered bytes out and consume them.
    pub fn get_more_data<B: BufMut>(&self, out: &mut B) -> usize {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.checked_out, "get from checked out pipe{}", inner.id);
        let size = inner.buf.len().min(out.remaining_mut());
        if size == 0 {
            return 0;
        }
        out.put_slice(&inner.buf[..size]);
        inner.buf.advance(size);
        self.post_consume(&mut inner, size);
        size
    }

    /// Discard `size` bytes from the front of the buffer.
    pub fn consume(&self, size: usize) {
        if size == 0 {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.checked_out, "consume from checked out pipe{}", inner.id);
        assert!(
            size <= inner.buf.len(),
            "consume {size} bytes but only {} buffered",
            inner.buf.len()
        );
        inner.buf.advance(size);
        self.post_consume(&mut inner, size);
    }

    pub(crate) fn post_consume(&self, inner: &mut PipeInner, size: usize) {
        assert!(!inner.checked_out);
        inner.get_size += size as u64;
        trace!("consumed {size} bytes {}", inner.status());
        if inner.may_need_more_data() {
            self.schedule_pipe_call(
                inner,
                "BodyProducer::noteMoreBodySpaceAvailable",
                BodyPipe::tell_more_body_space_available,
            );
        }
    }

    /// Drain the pipe by itself as no consumer is going to attach.
    pub fn enable_auto_consumption(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.must_auto_consume {
            return;
        }
        debug!("enabling auto consumption {}", inner.status());
        inner.must_auto_consume = true;
        if inner.consumer.is_none() && !inner.buf.is_empty() {
            self.schedule_body_data_notification(&mut inner);
        }
    }

    /// Read-only access to the buffered bytes.
    pub fn with_content<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let inner = self.inner.borrow();
        f(&inner.buf)
    }

    /// Copy up to `max` buffered bytes starting at the absolute body offset.
    pub fn copy_content(&self, offset: u64, max: usize) -> Bytes {
        let inner = self.inner.borrow();
        assert!(
            offset >= inner.get_size && offset <= inner.put_size,
            "offset {offset} is outside of the buffered range {}",
            inner.status()
        );
        let start = (offset - inner.get_size) as usize;
        let end = inner.buf.len().min(start.saturating_add(max));
        Bytes::copy_from_slice(&inner.buf[start..end])
    }

    /// Exclusive raw buffer access, see [`BodyPipeCheckout`].
    pub fn checkout(&self) -> BodyPipeCheckout {
        BodyPipeCheckout::new(self.clone())
    }

    /* notifications */

    fn schedule_pipe_call(&self, inner: &PipeInner, name: &'static str, tell: fn(&BodyPipe)) {
        let pipe = self.clone();
        inner
            .sched
            .schedule(AsyncCall::new(name, move || tell(&pipe)));
    }

    fn schedule_body_data_notification(&self, inner: &mut PipeInner) {
        if inner.consumer.is_some() || inner.must_auto_consume {
            inner.consumer_calls_pending += 1;
            self.schedule_pipe_call(
                inner,
                "BodyConsumer::noteMoreBodyDataAvailable",
                BodyPipe::tell_more_body_data_available,
            );
        }
    }

    fn schedule_body_end_notification(&self, inner: &mut PipeInner) {
        if inner.consumer.is_some() || inner.must_auto_consume {
            inner.consumer_calls_pending += 1;
            if !inner.aborted_production && inner.body_size == Some(inner.put_size) {
                self.schedule_pipe_call(
                    inner,
                    "BodyConsumer::noteBodyProductionEnded",
                    BodyPipe::tell_body_production_ended,
                );
            } else {
                self.schedule_pipe_call(
                    inner,
                    "BodyConsumer::noteBodyProducerAborted",
                    BodyPipe::tell_body_producer_aborted,
                );
            }
        }
    }

    fn tell_more_body_space_available(&self) {
        let producer = self.inner.borrow().producer.clone();
        if let Some(p) = producer {
            p.more_body_space_available(self);
        }
    }

    fn tell_body_consumer_aborted(&self) {
        let producer = self.inner.borrow().producer.clone();
        if let Some(p) = producer {
            p.body_consumer_aborted(self);
        }
    }

    fn current_consumer(&self) -> Option<Rc<dyn ConsumerLink>> {
        let mut inner = self.inner.borrow_mut();
        if inner.skip_consumer_call() {
            return None;
        }
        inner.consumer.clone()
    }

    fn tell_more_body_data_available(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.skip_consumer_call() {
            return;
        }
        match inner.consumer.clone() {
            Some(c) => {
                drop(inner);
                c.more_body_data_available(self);
            }
            None => {
                if inner.must_auto_consume && !inner.checked_out && !inner.buf.is_empty() {
                    let size = inner.buf.len();
                    inner.buf.advance(size);
                    self.post_consume(&mut inner, size);
                }
            }
        }
    }

    fn tell_body_production_ended(&self) {
        if let Some(c) = self.current_consumer() {
            c.body_production_ended(self);
        }
    }

    fn tell_body_producer_aborted(&self) {
        if let Some(c) = self.current_consumer() {
            c.body_producer_aborted(self);
        }
    }
}
