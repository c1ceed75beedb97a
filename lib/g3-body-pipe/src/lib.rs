/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

mod party;
pub use party::{BodyConsumer, BodyProducer};

mod pipe;
pub use pipe::BodyPipe;

mod checkout;
pub use checkout::BodyPipeCheckout;
