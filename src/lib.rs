//! A self-contained crawling runtime: an autoscaled task pool, a durable
//! request queue, a rotating session pool, and a statistics aggregator,
//! wired together by [`crawler::CrawlerRuntime`].
//!
//! Collaborators (`RequestQueueClient`, `KeyValueStore`, `Dataset`,
//! `ProxyConfiguration`) are named traits in [`storage`] and [`proxy`];
//! concrete cloud/HTTP backends are out of scope here, but the
//! in-memory and on-disk implementations in [`storage`] are enough to run
//! a crawl end to end.

pub mod autoscaled_pool;
pub mod config;
pub mod cookie;
pub mod crawler;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod percentiles;
pub mod proxy;
pub mod request;
pub mod request_queue;
pub mod router;
pub mod session;
pub mod session_pool;
pub mod snapshotter;
pub mod statistics;
pub mod storage;
pub mod system_status;
pub mod utils;

pub use config::CrawlerConfig;
pub use crawler::CrawlerRuntime;
pub use errors::{ConfigError, CrawlError, CrawlerError, QueueError, SessionPoolError};
pub use request::Request;
pub use router::{HandlerContext, HandlerResult, Router};
