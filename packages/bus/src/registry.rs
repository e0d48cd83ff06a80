//! ACGS-Bus: Agent Registry
//!
//! Maps agent id to capabilities, status and liveness, scoped per tenant.
//! Registration is idempotent on `(tenant, id)`; reserved ids are
//! rejected; `last_seen` never moves backwards. A background task evicts
//! agents that miss their liveness window and reports each eviction as an
//! INFO security event.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

use crate::error::BusError;

/// Ids that can never be registered.
const RESERVED_IDS: &[&str] = &["", "anonymous"];

/// Agent liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Active,
    Inactive,
    Suspended,
}

/// What an agent submits to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type: "worker".to_string(),
            capabilities: BTreeSet::new(),
            metadata: HashMap::new(),
            tenant_id: None,
        }
    }

    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Registered agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub metadata: HashMap<String, String>,
    pub tenant_id: Option<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentInfo {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub tenant: Option<String>,
    pub status: Option<AgentStatus>,
    pub capability: Option<String>,
}

/// Tenant-scoped agent registry.
pub struct AgentRegistry {
    // Tenant key -> agent id -> info. A single reader-preferring lock;
    // writes never suspend while holding it.
    tenants: RwLock<HashMap<String, HashMap<String, AgentInfo>>>,
    events: Arc<dyn EventSink>,
}

fn tenant_key(tenant: Option<&str>) -> String {
    tenant.unwrap_or("").to_string()
}

impl AgentRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register an agent. Idempotent on `(tenant, id)`: re-registering
    /// refreshes mutable fields and liveness; identical registrations
    /// leave the registry unchanged apart from `last_seen`.
    pub fn register(&self, registration: AgentRegistration) -> Result<AgentInfo, BusError> {
        if RESERVED_IDS.contains(&registration.id.as_str()) {
            return Err(BusError::Validation(format!(
                "agent id {:?} is reserved",
                registration.id
            )));
        }

        let now = Utc::now();
        let key = tenant_key(registration.tenant_id.as_deref());
        let mut tenants = self.tenants.write();
        let agents = tenants.entry(key).or_default();

        let info = match agents.get_mut(&registration.id) {
            Some(existing) => {
                existing.name = registration.name;
                existing.agent_type = registration.agent_type;
                existing.capabilities = registration.capabilities;
                existing.metadata = registration.metadata;
                existing.status = AgentStatus::Active;
                existing.last_seen = existing.last_seen.max(now);
                existing.clone()
            }
            None => {
                let info = AgentInfo {
                    id: registration.id.clone(),
                    name: registration.name,
                    agent_type: registration.agent_type,
                    capabilities: registration.capabilities,
                    metadata: registration.metadata,
                    tenant_id: registration.tenant_id,
                    status: AgentStatus::Active,
                    registered_at: now,
                    last_seen: now,
                };
                tracing::info!(agent_id = %info.id, name = %info.name, "agent registered");
                agents.insert(registration.id, info.clone());
                info
            }
        };
        Ok(info)
    }

    pub fn unregister(&self, tenant: Option<&str>, id: &str) -> Result<AgentInfo, BusError> {
        let mut tenants = self.tenants.write();
        tenants
            .get_mut(&tenant_key(tenant))
            .and_then(|agents| agents.remove(id))
            .ok_or_else(|| BusError::AgentNotRegistered(id.to_string()))
    }

    pub fn get(&self, tenant: Option<&str>, id: &str) -> Option<AgentInfo> {
        self.tenants
            .read()
            .get(&tenant_key(tenant))
            .and_then(|agents| agents.get(id))
            .cloned()
    }

    pub fn list(&self, filter: &AgentFilter) -> Vec<AgentInfo> {
        let tenants = self.tenants.read();
        let mut out = Vec::new();
        for (key, agents) in tenants.iter() {
            if let Some(tenant) = &filter.tenant {
                if key != tenant {
                    continue;
                }
            }
            for info in agents.values() {
                if let Some(status) = filter.status {
                    if info.status != status {
                        continue;
                    }
                }
                if let Some(capability) = &filter.capability {
                    if !info.has_capability(capability) {
                        continue;
                    }
                }
                out.push(info.clone());
            }
        }
        out
    }

    /// Refresh liveness. `last_seen` is monotone non-decreasing.
    pub fn heartbeat(&self, tenant: Option<&str>, id: &str) -> Result<(), BusError> {
        let now = Utc::now();
        let mut tenants = self.tenants.write();
        let info = tenants
            .get_mut(&tenant_key(tenant))
            .and_then(|agents| agents.get_mut(id))
            .ok_or_else(|| BusError::AgentNotRegistered(id.to_string()))?;
        info.last_seen = info.last_seen.max(now);
        info.status = AgentStatus::Active;
        Ok(())
    }

    /// Merge metadata. Only the owning agent calls this.
    pub fn update_metadata(
        &self,
        tenant: Option<&str>,
        id: &str,
        updates: HashMap<String, String>,
    ) -> Result<AgentInfo, BusError> {
        let mut tenants = self.tenants.write();
        let info = tenants
            .get_mut(&tenant_key(tenant))
            .and_then(|agents| agents.get_mut(id))
            .ok_or_else(|| BusError::AgentNotRegistered(id.to_string()))?;
        info.metadata.extend(updates);
        info.last_seen = info.last_seen.max(Utc::now());
        Ok(info.clone())
    }

    pub fn count(&self) -> usize {
        self.tenants.read().values().map(|a| a.len()).sum()
    }

    /// Remove agents whose `last_seen` is older than the window. Each
    /// eviction emits an INFO security event.
    pub fn evict_stale(&self, window: Duration) -> Vec<AgentInfo> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut evicted = Vec::new();
        {
            let mut tenants = self.tenants.write();
            for agents in tenants.values_mut() {
                let stale: Vec<String> = agents
                    .values()
                    .filter(|info| info.last_seen < cutoff)
                    .map(|info| info.id.clone())
                    .collect();
                for id in stale {
                    if let Some(info) = agents.remove(&id) {
                        evicted.push(info);
                    }
                }
            }
        }
        for info in &evicted {
            tracing::info!(agent_id = %info.id, "agent evicted after missed heartbeats");
            let mut event = SecurityEvent::new(
                event_types::AGENT_EVICTED,
                SecuritySeverity::Info,
                format!("agent {} evicted after liveness window", info.id),
                "agent-registry",
            )
            .with_agent(info.id.clone());
            if let Some(tenant) = &info.tenant_id {
                event = event.with_tenant(tenant.clone());
            }
            self.events.emit(event);
        }
        evicted
    }

    /// Background eviction loop.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        window: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.evict_stale(window);
            }
        })
    }
}
