//! Client-side runtime: community manager, contact cache, retry queue,
//! message pipeline and group fan-out.

pub mod community;
pub mod config;
pub mod contact_cache;
pub mod delivery_report;
pub mod errors;
pub mod events;
pub mod group;
pub mod member_cache;
pub mod pipeline;
pub mod relay_client;
pub mod retry_queue;
pub mod runtime;
