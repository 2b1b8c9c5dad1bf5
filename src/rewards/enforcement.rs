//! Outbound blocking seam.
//!
//! The platform blocking primitive is external. Only capabilities minted on
//! this device can be handed to it: a [`MirroredCapability`] describes an app
//! seen on another device and cannot be placed in an [`AppSet`].

use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::info;

use crate::ids::{AppId, ChildId, DeviceId};

/// Blocking capability minted on this device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalCapability {
    app_id: AppId,
}

impl LocalCapability {
    pub fn new(app_id: AppId) -> Self {
        Self { app_id }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }
}

/// Copy of a capability that belongs to another device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MirroredCapability {
    pub app_id: AppId,
    pub origin_device: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityHandle {
    Local(LocalCapability),
    Mirrored(MirroredCapability),
}

impl CapabilityHandle {
    pub fn app_id(&self) -> &AppId {
        match self {
            Self::Local(cap) => cap.app_id(),
            Self::Mirrored(cap) => &cap.app_id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// Apps handed to the enforcer; only ever local capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSet(BTreeSet<LocalCapability>);

impl AppSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the local handles, drop mirrored ones
    pub fn from_handles<'a>(handles: impl IntoIterator<Item = &'a CapabilityHandle>) -> Self {
        Self(
            handles
                .into_iter()
                .filter_map(|handle| match handle {
                    CapabilityHandle::Local(cap) => Some(cap.clone()),
                    CapabilityHandle::Mirrored(_) => None,
                })
                .collect(),
        )
    }

    pub fn insert(&mut self, capability: LocalCapability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, app_id: &AppId) -> bool {
        self.0.iter().any(|cap| cap.app_id() == app_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalCapability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Platform blocking primitive; calls are fire-and-forget
pub trait BlockingEnforcer: Send + Sync {
    fn lift_enforcement(&self, child_id: &ChildId, apps: &AppSet);

    fn reapply_enforcement(&self, child_id: &ChildId, apps: &AppSet);
}

/// Enforcer that only logs; used when no platform primitive is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEnforcer;

impl BlockingEnforcer for LoggingEnforcer {
    fn lift_enforcement(&self, child_id: &ChildId, apps: &AppSet) {
        info!("Lifting enforcement for {} ({} apps)", child_id, apps.len());
    }

    fn reapply_enforcement(&self, child_id: &ChildId, apps: &AppSet) {
        info!("Reapplying enforcement for {} ({} apps)", child_id, apps.len());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementCall {
    Lift(ChildId),
    Reapply(ChildId),
}

/// Enforcer that remembers every call
#[derive(Debug, Default)]
pub struct RecordingEnforcer {
    calls: Mutex<Vec<EnforcementCall>>,
}

impl RecordingEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EnforcementCall> {
        self.calls.lock().clone()
    }

    /// Whether the most recent call for the child lifted enforcement
    pub fn is_lifted(&self, child_id: &ChildId) -> bool {
        self.calls
            .lock()
            .iter()
            .rev()
            .find_map(|call| match call {
                EnforcementCall::Lift(c) if c == child_id => Some(true),
                EnforcementCall::Reapply(c) if c == child_id => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

impl BlockingEnforcer for RecordingEnforcer {
    fn lift_enforcement(&self, child_id: &ChildId, _apps: &AppSet) {
        self.calls.lock().push(EnforcementCall::Lift(child_id.clone()));
    }

    fn reapply_enforcement(&self, child_id: &ChildId, _apps: &AppSet) {
        self.calls
            .lock()
            .push(EnforcementCall::Reapply(child_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_set_drops_mirrored_handles() {
        let handles = vec![
            CapabilityHandle::Local(LocalCapability::new(AppId::new("app:game"))),
            CapabilityHandle::Mirrored(MirroredCapability {
                app_id: AppId::new("app:video"),
                origin_device: DeviceId::new("other-tablet"),
            }),
        ];

        let apps = AppSet::from_handles(&handles);

        assert_eq!(apps.len(), 1);
        assert!(apps.contains(&AppId::new("app:game")));
        assert!(!apps.contains(&AppId::new("app:video")));
    }

    #[test]
    fn test_recording_enforcer_tracks_last_state() {
        let enforcer = RecordingEnforcer::new();
        let kid = ChildId::new("kid1");
        let apps = AppSet::new();

        assert!(!enforcer.is_lifted(&kid));
        enforcer.lift_enforcement(&kid, &apps);
        assert!(enforcer.is_lifted(&kid));
        enforcer.reapply_enforcement(&kid, &apps);
        assert!(!enforcer.is_lifted(&kid));
        assert_eq!(enforcer.calls().len(), 2);
    }
}
