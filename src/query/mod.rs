//! Unified session read API and live subscription.

pub mod subscribe;
pub mod tree;

mod service;

pub use service::{
    ExportFormat, SearchField, SessionDetails, SessionQuery, StatisticsSummary,
};
pub use subscribe::{SubscribeCallbacks, SubscriptionCoordinator};
pub use tree::{FlatNode, SessionTree};
