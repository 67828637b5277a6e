// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod catalog;
mod object_store;

pub use catalog::FileApplicationCatalog;
pub use object_store::LocalObjectStore;
