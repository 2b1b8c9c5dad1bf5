//! Points accounting and earned-time redemption for screen-time rewards.
//!
//! Children accrue points in learning apps and spend them on windows of
//! unblocked time in reward apps. [`rewards::RewardsService`] owns every
//! component for one device; [`sync`] keeps several devices in agreement.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod platform;
pub mod rewards;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RewardsConfig;
pub use error::{ExemptionError, FailureKind, LedgerError, PersistenceError, RedemptionError};
pub use ids::{AppId, ChildId, DeviceId, SessionId};
pub use rewards::RewardsService;
pub use store::{JsonFileStore, MemoryStore, Store};
