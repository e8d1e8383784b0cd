pub mod bulk_deleter;
pub mod bulk_processor;
pub mod cache_mirror;
pub mod query_paginator;
pub mod roster_manager;
pub mod version_manager;
