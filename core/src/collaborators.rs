/*!
# Collaborators Module

This module defines the narrow contracts between the automation engine and
the systems it orchestrates.

The engine never fetches, parses or persists anything itself. It drives:
- A `LeadFetcher` that turns task parameters into a batch of leads
- A `LeadStore` used to de-duplicate and persist accepted leads
- An optional `WebsiteAnalyzer` that enriches stored leads

The module includes:
- The `Lead` record with its identity key and quality predicate
- The three collaborator traits
- An in-memory store implementation used by tests and the CLI simulator

Fetcher failures are the errors the retry executor absorbs; store lookups
must not fail for "not found", only for genuine I/O problems.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LeadFlowError, Result};

/// A single business lead returned by a fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    /// Business name
    pub name: String,

    /// Postal address, part of the lead's identity
    pub address: String,

    /// Website, when one was found
    pub website: Option<String>,

    /// How complete the contact details are, 0-100
    pub contact_completeness: u8,

    /// Source-specific payload the engine does not interpret
    #[serde(default)]
    pub extra: Value,
}

impl Lead {
    /// Create a lead with no website and empty contact details
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            website: None,
            contact_completeness: 0,
            extra: Value::Null,
        }
    }

    /// Set the website
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    /// Set the contact completeness score
    pub fn with_completeness(mut self, completeness: u8) -> Self {
        self.contact_completeness = completeness;
        self
    }

    /// Quality gate applied before a lead is stored
    pub fn passes_quality(&self, min_completeness: u8) -> bool {
        self.contact_completeness >= min_completeness
    }

    /// Identity key used for de-duplication, case-insensitive
    pub fn key(&self) -> LeadKey {
        LeadKey {
            name: self.name.trim().to_lowercase(),
            address: self.address.trim().to_lowercase(),
        }
    }
}

/// De-duplication identity of a lead
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeadKey {
    pub name: String,
    pub address: String,
}

/// Fetch collaborator: turns task parameters into a batch of leads.
///
/// This is the operation the retry executor retries; transient failures
/// should surface as `LeadFlowError::Fetch`.
#[async_trait]
pub trait LeadFetcher: Send + Sync + 'static {
    async fn fetch(&self, params: &Value) -> Result<Vec<Lead>>;
}

/// Storage collaborator used to de-duplicate and persist leads.
#[async_trait]
pub trait LeadStore: Send + Sync + 'static {
    /// Whether a lead with this identity is already known.
    /// Must return `Ok(false)` for unknown keys, never an error.
    async fn exists(&self, key: &LeadKey) -> Result<bool>;

    /// Persist a lead, returning its storage id
    async fn store(&self, lead: &Lead) -> Result<String>;

    /// Attach a website analysis payload to a stored lead
    async fn attach_analysis(&self, lead_id: &str, analysis: Value) -> Result<()>;
}

/// Enrichment collaborator, gated by the engine's `auto_analyze` setting.
#[async_trait]
pub trait WebsiteAnalyzer: Send + Sync + 'static {
    async fn analyze(&self, website: &str) -> Result<Value>;
}

/// In-memory implementation of the `LeadStore` trait.
///
/// Used by the CLI simulator and in tests; a real deployment would back this
/// with a database.
#[derive(Default)]
pub struct InMemoryLeadStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    by_key: HashMap<LeadKey, String>,
    by_id: HashMap<String, StoredLead>,
}

struct StoredLead {
    lead: Lead,
    analysis: Option<Value>,
}

impl InMemoryLeadStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored leads
    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fetch a stored lead and its analysis by id
    pub async fn get(&self, lead_id: &str) -> Option<(Lead, Option<Value>)> {
        let inner = self.inner.lock().await;
        inner
            .by_id
            .get(lead_id)
            .map(|stored| (stored.lead.clone(), stored.analysis.clone()))
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn exists(&self, key: &LeadKey) -> Result<bool> {
        Ok(self.inner.lock().await.by_key.contains_key(key))
    }

    async fn store(&self, lead: &Lead) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4().to_string();
        inner.by_key.insert(lead.key(), id.clone());
        inner.by_id.insert(
            id.clone(),
            StoredLead {
                lead: lead.clone(),
                analysis: None,
            },
        );
        Ok(id)
    }

    async fn attach_analysis(&self, lead_id: &str, analysis: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .by_id
            .get_mut(lead_id)
            .ok_or_else(|| LeadFlowError::Storage(format!("unknown lead id: {lead_id}")))?;
        stored.analysis = Some(analysis);
        Ok(())
    }
}
