//! Core trait definitions

mod broker;

pub use broker::{BrokerClient, PublishToken, SubscriptionSet};
