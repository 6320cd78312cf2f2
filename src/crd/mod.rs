//! Custom Resource Definitions owned by the intents operator.

mod intents;
mod types;

pub use intents::{
    BackendStatus, Call, CallType, ClientIntents, ClientIntentsSpec, ClientIntentsStatus,
    HttpMethod, HttpResource, KafkaOperation, KafkaTopic, ServiceRef,
};
pub use types::{Condition, ConditionStatus};
