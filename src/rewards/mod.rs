pub mod accrual;
pub mod audit;
pub mod enforcement;
pub mod events;
pub mod exemption;
pub mod ledger;
pub mod redemption;
pub mod service;
pub mod window;

pub use accrual::{AccrualEngine, UsageSession};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use enforcement::{
    AppSet, BlockingEnforcer, CapabilityHandle, LocalCapability, LoggingEnforcer,
    MirroredCapability, RecordingEnforcer,
};
pub use events::ActivityEvent;
pub use exemption::{ExemptionEvent, ExemptionManager, ExpireCallback};
pub use ledger::{EntryKind, Ledger, LedgerEntry, LedgerEvent};
pub use redemption::{Redemption, RedemptionService};
pub use service::RewardsService;
pub use window::{EarnedTimeWindow, StackingPolicy, WindowRecord};
