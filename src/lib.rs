//! Weekly sales-activity pipeline.
//!
//! Ingests calendar events for a team of sales agents, deduplicates them
//! per ISO week, and classifies each event as a sales or non-sales
//! activity through an external text-classification service. Manager
//! corrections feed back into the instructions used for later
//! classification runs.
//!
//! Host applications (HTTP routes, timers, CLIs) drive the crate through
//! [`pipeline::Pipeline`]; everything network- or UI-facing stays on the
//! host side.

pub mod config;
pub mod feedback;
pub mod ingest;
pub mod oracle;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod weeks;
