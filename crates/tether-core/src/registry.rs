use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tether_models::gateway::is_reserved_event;
use tether_models::{ParameterSpec, Subscription};
use tether_util::validation::validate_event_name;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub event_name: String,
    #[serde(default)]
    pub replicable: bool,
    #[serde(default)]
    pub include_sender: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Vec<ParameterSpec>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    pub event_name: Option<String>,
    pub replicable: Option<bool>,
    pub include_sender: Option<bool>,
    pub description: Option<String>,
    pub parameters: Option<Vec<ParameterSpec>>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Subscription>,
    by_event: HashMap<String, String>,
}

/// Process-local subscription table: event name -> replication policy +
/// optional parameter schema. Both maps mutate under one write guard, so
/// the event-name index can never be observed out of step with the id map.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

fn validate_name(event_name: &str) -> Result<(), CoreError> {
    validate_event_name(event_name).map_err(|e| CoreError::BadRequest(e.to_string()))?;
    if is_reserved_event(event_name) {
        return Err(CoreError::BadRequest(format!(
            "'{event_name}' is a reserved event name"
        )));
    }
    Ok(())
}

fn validate_parameters(specs: &[ParameterSpec]) -> Result<(), CoreError> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if spec.name.is_empty() {
            return Err(CoreError::BadRequest("parameter name is empty".into()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(CoreError::BadRequest(format!(
                "duplicate parameter '{}'",
                spec.name
            )));
        }
        if let Some(pattern) = &spec.pattern {
            Regex::new(pattern).map_err(|e| {
                CoreError::BadRequest(format!(
                    "invalid pattern for parameter '{}': {e}",
                    spec.name
                ))
            })?;
        }
    }
    Ok(())
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by event name. Returns the stored subscription and whether an
    /// existing entry was replaced — duplicates never coexist.
    pub fn create(&self, spec: NewSubscription) -> Result<(Subscription, bool), CoreError> {
        validate_name(&spec.event_name)?;
        if let Some(params) = &spec.parameters {
            validate_parameters(params)?;
        }
        let now = Utc::now();
        let sub = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            event_name: spec.event_name,
            replicable: spec.replicable,
            include_sender: spec.include_sender,
            description: spec.description,
            parameters: spec.parameters,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let replaced = inner
            .by_event
            .remove(&sub.event_name)
            .and_then(|old_id| inner.by_id.remove(&old_id))
            .is_some();
        inner.by_event.insert(sub.event_name.clone(), sub.id.clone());
        inner.by_id.insert(sub.id.clone(), sub.clone());
        Ok((sub, replaced))
    }

    /// Partial update. Renaming re-indexes atomically; renaming onto an
    /// occupied event name evicts the occupant, matching create semantics.
    pub fn update(&self, id: &str, patch: SubscriptionUpdate) -> Result<Subscription, CoreError> {
        if let Some(name) = &patch.event_name {
            validate_name(name)?;
        }
        if let Some(params) = &patch.parameters {
            validate_parameters(params)?;
        }

        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let Some(mut sub) = inner.by_id.get(id).cloned() else {
            return Err(CoreError::NotFound);
        };

        if let Some(name) = patch.event_name {
            if name != sub.event_name {
                if let Some(occupant) = inner.by_event.remove(&name) {
                    inner.by_id.remove(&occupant);
                }
                inner.by_event.remove(&sub.event_name);
                inner.by_event.insert(name.clone(), sub.id.clone());
                sub.event_name = name;
            }
        }
        if let Some(replicable) = patch.replicable {
            sub.replicable = replicable;
        }
        if let Some(include_sender) = patch.include_sender {
            sub.include_sender = include_sender;
        }
        if let Some(description) = patch.description {
            sub.description = Some(description);
        }
        if let Some(parameters) = patch.parameters {
            sub.parameters = Some(parameters);
        }
        sub.updated_at = Utc::now();
        inner.by_id.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    pub fn delete(&self, id: &str) -> Result<Subscription, CoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let Some(sub) = inner.by_id.remove(id) else {
            return Err(CoreError::NotFound);
        };
        if inner.by_event.get(&sub.event_name) == Some(&sub.id) {
            inner.by_event.remove(&sub.event_name);
        }
        Ok(sub)
    }

    pub fn delete_all(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let count = inner.by_id.len();
        inner.by_id.clear();
        inner.by_event.clear();
        count
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.by_id.get(id).cloned()
    }

    pub fn get_by_event_name(&self, event_name: &str) -> Option<Subscription> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .by_event
            .get(event_name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Zero or one element, by construction.
    pub fn list_by_event_name(&self, event_name: &str) -> Vec<Subscription> {
        self.get_by_event_name(event_name).into_iter().collect()
    }

    pub fn list_all(&self) -> Vec<Subscription> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut subs: Vec<Subscription> = inner.by_id.values().cloned().collect();
        subs.sort_by(|a, b| a.event_name.cmp(&b.event_name));
        subs
    }
}
