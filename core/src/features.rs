use std::collections::{BTreeMap, BTreeSet};

use crate::error::RegistryError;

/// Host-invoked request methods. Receiving one is itself proof of support.
pub const PASSIVE_FEATURES: [&str; 12] = [
    "tools/list",
    "tools/call",
    "resources/list",
    "resources/read",
    "resources/templates/list",
    "resources/subscribe",
    "resources/unsubscribe",
    "prompts/list",
    "prompts/get",
    "roots/list",
    "completion/complete",
    "logging/setLevel",
];

/// Server-initiated notifications and requests, plus host notifications that
/// can only be observed.
pub const ACTIVE_FEATURES: [&str; 13] = [
    "notifications/progress",
    "notifications/message",
    "notifications/cancelled",
    "notifications/initialized",
    "notifications/resources/list_changed",
    "notifications/resources/updated",
    "notifications/tools/list_changed",
    "notifications/prompts/list_changed",
    "notifications/roots/list_changed",
    "sampling/createMessage",
    "elicitation/create",
    "ping",
    "pong",
];

/// Notification -> the inbound call a conforming host makes in reaction.
pub const EVENT_CALLBACKS: [(&str, &str); 4] = [
    ("notifications/resources/list_changed", "resources/list"),
    ("notifications/prompts/list_changed", "prompts/list"),
    ("notifications/tools/list_changed", "tools/list"),
    ("notifications/resources/updated", "resources/read"),
];

/// Survive a reset: every working host has already proven these.
pub const RESET_PROTECTED: [&str; 3] = ["notifications/initialized", "tools/list", "tools/call"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Passive,
    Active,
}

impl FeatureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKind::Passive => "passive",
            FeatureKind::Active => "active",
        }
    }
}

/// Immutable feature catalog shared (behind an `Arc`) by every session.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    passive: Vec<String>,
    active: Vec<String>,
    callbacks: BTreeMap<String, String>,
    protected: BTreeSet<String>,
}

impl FeatureRegistry {
    pub fn new<P, A, C, R>(
        passive: P,
        active: A,
        callbacks: C,
        protected: R,
    ) -> Result<Self, RegistryError>
    where
        P: IntoIterator,
        P::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
        C: IntoIterator<Item = (String, String)>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let passive: Vec<String> = passive.into_iter().map(Into::into).collect();
        let active: Vec<String> = active.into_iter().map(Into::into).collect();

        let mut seen = BTreeSet::new();
        for id in &passive {
            if !seen.insert(id.as_str()) {
                return Err(RegistryError::Duplicate(id.clone()));
            }
        }
        let passive_set = seen.clone();
        for id in &active {
            if passive_set.contains(id.as_str()) {
                return Err(RegistryError::Overlap(id.clone()));
            }
            if !seen.insert(id.as_str()) {
                return Err(RegistryError::Duplicate(id.clone()));
            }
        }

        let mut callback_map = BTreeMap::new();
        for (event, target) in callbacks {
            if !active.contains(&event) {
                return Err(RegistryError::CallbackSourceNotActive(event));
            }
            if !passive.contains(&target) {
                return Err(RegistryError::CallbackTargetNotPassive { event, target });
            }
            callback_map.insert(event, target);
        }

        let mut protected_set = BTreeSet::new();
        for id in protected {
            let id: String = id.into();
            if !seen.contains(id.as_str()) {
                return Err(RegistryError::UnknownProtected(id));
            }
            protected_set.insert(id);
        }

        Ok(Self {
            passive,
            active,
            callbacks: callback_map,
            protected: protected_set,
        })
    }

    /// The MCP catalog this harness scores hosts against.
    pub fn mcp() -> Self {
        Self::new(
            PASSIVE_FEATURES,
            ACTIVE_FEATURES,
            EVENT_CALLBACKS
                .iter()
                .map(|(event, target)| (event.to_string(), target.to_string())),
            RESET_PROTECTED,
        )
        .unwrap_or_else(|err| unreachable!("built-in feature catalog is inconsistent: {err}"))
    }

    /// Every id, passive first, in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.passive
            .iter()
            .chain(self.active.iter())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.passive.len() + self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn passive(&self) -> &[String] {
        &self.passive
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn contains(&self, id: &str) -> bool {
        self.kind(id).is_some()
    }

    pub fn kind(&self, id: &str) -> Option<FeatureKind> {
        if self.passive.iter().any(|p| p == id) {
            Some(FeatureKind::Passive)
        } else if self.active.iter().any(|a| a == id) {
            Some(FeatureKind::Active)
        } else {
            None
        }
    }

    pub fn expected_callback(&self, event_type: &str) -> Option<&str> {
        self.callbacks.get(event_type).map(String::as_str)
    }

    pub fn callback_events(&self) -> impl Iterator<Item = (&str, &str)> {
        self.callbacks
            .iter()
            .map(|(event, target)| (event.as_str(), target.as_str()))
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.protected.contains(id)
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::mcp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_catalog_is_disjoint_and_complete() {
        let registry = FeatureRegistry::mcp();
        assert_eq!(registry.len(), PASSIVE_FEATURES.len() + ACTIVE_FEATURES.len());
        assert_eq!(registry.kind("tools/list"), Some(FeatureKind::Passive));
        assert_eq!(registry.kind("ping"), Some(FeatureKind::Active));
        assert_eq!(registry.kind("initialize"), None);
    }

    #[test]
    fn callback_map_points_from_active_to_passive() {
        let registry = FeatureRegistry::mcp();
        for (event, target) in registry.callback_events() {
            assert_eq!(registry.kind(event), Some(FeatureKind::Active));
            assert_eq!(registry.kind(target), Some(FeatureKind::Passive));
        }
        assert_eq!(
            registry.expected_callback("notifications/resources/list_changed"),
            Some("resources/list")
        );
        assert_eq!(registry.expected_callback("ping"), None);
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = FeatureRegistry::new(
            ["ping"],
            ["ping"],
            Vec::<(String, String)>::new(),
            Vec::<String>::new(),
        )
        .expect_err("overlap must be rejected");
        assert_eq!(err, RegistryError::Overlap("ping".to_string()));
    }

    #[test]
    fn callback_to_active_target_is_rejected() {
        let err = FeatureRegistry::new(
            ["tools/list"],
            ["notifications/tools/list_changed", "ping"],
            vec![(
                "notifications/tools/list_changed".to_string(),
                "ping".to_string(),
            )],
            Vec::<String>::new(),
        )
        .expect_err("callback target must be passive");
        assert!(matches!(err, RegistryError::CallbackTargetNotPassive { .. }));
    }

    #[test]
    fn protected_ids_must_exist() {
        let err = FeatureRegistry::new(
            ["tools/list"],
            Vec::<String>::new(),
            Vec::<(String, String)>::new(),
            ["initialize"],
        )
        .expect_err("unknown protected id");
        assert_eq!(err, RegistryError::UnknownProtected("initialize".to_string()));
    }
}
