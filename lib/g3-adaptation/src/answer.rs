/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;

use arcstr::ArcStr;

use crate::AdaptationMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptationOutcome {
    /// The service produced a new message.
    Adapted,
    /// The service asked to use the virgin message.
    Unmodified,
    /// The service failed and the virgin message is used instead.
    Bypassed,
}

impl AdaptationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationOutcome::Adapted => "adapted",
            AdaptationOutcome::Unmodified => "unmodified",
            AdaptationOutcome::Bypassed => "bypassed",
        }
    }
}

impl fmt::Display for AdaptationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished adaptation tells its initiator.
pub enum AdaptationAnswer {
    Forward {
        message: AdaptationMessage,
        outcome: AdaptationOutcome,
    },
    Block {
        service: ArcStr,
    },
}

impl AdaptationAnswer {
    pub fn is_forward(&self) -> bool {
        matches!(self, AdaptationAnswer::Forward { .. })
    }
}

impl fmt::Debug for AdaptationAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptationAnswer::Forward { message, outcome } => f
                .debug_struct("Forward")
                .field("head", message.head.start_line())
                .field("has_body", &message.body.is_some())
                .field("outcome", outcome)
                .finish(),
            AdaptationAnswer::Block { service } => {
                f.debug_struct("Block").field("service", service).finish()
            }
        }
    }
}
