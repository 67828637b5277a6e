// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod application_catalog;
pub mod event_stream;
pub mod job_state_store;
pub mod object_store;
pub mod script_generator;

pub use application_catalog::ApplicationCatalogPort;
pub use event_stream::EventPublisherPort;
pub use job_state_store::{JobStateStorePort, PersistedJobState};
pub use object_store::{ObjectReader, ObjectStorePort, ObjectWriter};
pub use script_generator::ScriptGeneratorPort;
