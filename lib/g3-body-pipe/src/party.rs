/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use g3_async_job::{Job, JobContext, JobHandle, JobId};

use crate::BodyPipe;

/// The job filling a pipe.
pub trait BodyProducer: Job {
    fn note_more_body_space_available(
        &mut self,
        ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()>;

    fn note_body_consumer_aborted(
        &mut self,
        ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()>;
}

/// The job draining a pipe.
pub trait BodyConsumer: Job {
    fn note_more_body_data_available(
        &mut self,
        ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()>;

    fn note_body_production_ended(
        &mut self,
        ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()>;

    fn note_body_producer_aborted(
        &mut self,
        ctx: &mut JobContext<'_>,
        pipe: &BodyPipe,
    ) -> anyhow::Result<()>;
}

pub(crate) trait ProducerLink {
    fn job_id(&self) -> JobId;
    fn valid(&self) -> bool;
    fn more_body_space_available(&self, pipe: &BodyPipe);
    fn body_consumer_aborted(&self, pipe: &BodyPipe);
}

pub(crate) trait ConsumerLink {
    fn job_id(&self) -> JobId;
    fn valid(&self) -> bool;
    fn more_body_data_available(&self, pipe: &BodyPipe);
    fn body_production_ended(&self, pipe: &BodyPipe);
    fn body_producer_aborted(&self, pipe: &BodyPipe);
}

impl<P: BodyProducer> ProducerLink for JobHandle<P> {
    fn job_id(&self) -> JobId {
        self.id()
    }

    fn valid(&self) -> bool {
        JobHandle::valid(self)
    }

    fn more_body_space_available(&self, pipe: &BodyPipe) {
        let pipe = pipe.clone();
        self.dial("BodyProducer::noteMoreBodySpaceAvailable", move |job, ctx| {
            job.note_more_body_space_available(ctx, &pipe)
        });
    }

    fn body_consumer_aborted(&self, pipe: &BodyPipe) {
        let pipe = pipe.clone();
        self.dial("BodyProducer::noteBodyConsumerAborted", move |job, ctx| {
            job.note_body_consumer_aborted(ctx, &pipe)
        });
    }
}

impl<C: BodyConsumer> ConsumerLink for JobHandle<C> {
    fn job_id(&self) -> JobId {
        self.id()
    }

    fn valid(&self) -> bool {
        JobHandle::valid(self)
    }

    fn more_body_data_available(&self, pipe: &BodyPipe) {
        let pipe = pipe.clone();
        self.dial("BodyConsumer::noteMoreBodyDataAvailable", move |job, ctx| {
            job.note_more_body_data_available(ctx, &pipe)
        });
    }

    fn body_production_ended(&self, pipe: &BodyPipe) {
        let pipe = pipe.clone();
        self.dial("BodyConsumer::noteBodyProductionEnded", move |job, ctx| {
            job.note_body_production_ended(ctx, &pipe)
        });
    }

    fn body_producer_aborted(&self, pipe: &BodyPipe) {
        let pipe = pipe.clone();
        self.dial("BodyConsumer::noteBodyProducerAborted", move |job, ctx| {
            job.note_body_producer_aborted(ctx, &pipe)
        });
    }
}
