// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod bus;
mod spool;

pub use bus::EventBus;
pub use spool::{CancelRequest, InboundRequest, RequestSpool};
