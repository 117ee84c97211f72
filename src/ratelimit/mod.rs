//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod group;
mod identity;
mod registry;
mod rules;

pub use bucket::TokenBucket;
pub use clock::{Clock, SystemClock};
pub use group::{Admission, Policy, PolicyGroup};
pub use identity::{ClientIdentity, UNKNOWN_CLIENT};
pub use registry::LimiterRegistry;
pub use rules::{DispatchRule, DispatchTable, PathPattern, PolicyConfig, RuleConfig};

#[cfg(test)]
pub(crate) use clock::ManualClock;
