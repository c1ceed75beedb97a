/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use bytes::{BufMut, BytesMut};
use log::warn;

use crate::BodyPipe;

/// Exclusive access to the pipe buffer for in-place decoding.
///
/// While checked out the pipe refuses ordinary puts and gets. The size
/// change is accounted for, and notifications are sent, at check in.
pub struct BodyPipeCheckout {
    pipe: BodyPipe,
    buf: BytesMut,
    checked_out_size: usize,
    unproduced: Option<u64>,
    checked_in: bool,
}

impl BodyPipeCheckout {
    pub(crate) fn new(pipe: BodyPipe) -> Self {
        let (buf, unproduced) = {
            let mut inner = pipe.inner_mut();
            assert!(!inner.checked_out, "pipe is already checked out");
            inner.checked_out = true;
            (std::mem::take(&mut inner.buf), inner.unproduced_size())
        };
        let checked_out_size = buf.len();
        BodyPipeCheckout {
            pipe,
            buf,
            checked_out_size,
            unproduced,
            checked_in: false,
        }
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// How many more bytes may be appended.
    pub fn space_size(&self) -> usize {
        let space = BodyPipe::MAX_CAPACITY.saturating_sub(self.buf.len());
        match self.unproduced {
            Some(left) => {
                let added = self.buf.len().saturating_sub(self.checked_out_size) as u64;
                let left = left.saturating_sub(added);
                space.min(usize::try_from(left).unwrap_or(usize::MAX))
            }
            None => space,
        }
    }

    /// Append what fits and return how much that was.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let size = data.len().min(self.space_size());
        self.buf.put_slice(&data[..size]);
        size
    }

    pub fn check_in(mut self) {
        self.do_check_in();
    }

    /// Give the buffer back, asserting it was not changed.
    pub fn undo(mut self) {
        assert_eq!(self.buf.len(), self.checked_out_size);
        self.do_check_in();
    }

    fn do_check_in(&mut self) {
        if self.checked_in {
            return;
        }
        self.checked_in = true;

        let mut inner = self.pipe.inner_mut();
        inner.buf = std::mem::take(&mut self.buf);
        inner.checked_out = false;
        let current = inner.buf.len();
        if current < self.checked_out_size {
            self.pipe
                .post_consume(&mut inner, self.checked_out_size - current);
        } else if current > self.checked_out_size {
            self.pipe
                .post_append(inner, current - self.checked_out_size);
        }
    }
}

impl Drop for BodyPipeCheckout {
    fn drop(&mut self) {
        if self.checked_in {
            return;
        }
        if self.buf.len() > self.checked_out_size {
            self.buf.truncate(self.checked_out_size);
        } else if self.buf.len() < self.checked_out_size {
            warn!(
                "body pipe{} checkout dropped after consuming, checking in",
                self.pipe.id()
            );
        }
        self.do_check_in();
    }
}
