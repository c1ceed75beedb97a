/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! ICAP client side: services, their OPTIONS state and the REQMOD/RESPMOD
//! transactions sent to them.

mod reason;
pub use reason::IcapErrorReason;

mod error;
pub use error::{IcapTransportError, IcapXactError};

mod encapsulated;
pub use encapsulated::{IcapBodyKind, IcapEncapsulated, IcapEncapsulatedError};

mod serialize;

pub mod transport;

pub mod options;
pub use options::{IcapOptionsParseError, IcapServiceOptions, TransferKind};

mod service;
pub use service::IcapService;

mod xaction;

mod modxact;

mod launcher;
