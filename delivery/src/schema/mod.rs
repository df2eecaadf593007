//! Schema validation gate for the publish path
//!
//! Payloads are checked against the latest registered schema for their
//! topic before any delivery work happens. Schemas are fetched through
//! the [`SchemaRegistry`] trait and cached locally; exact versions are
//! immutable once fetched, the latest pointer refreshes on a TTL. When
//! the registry is unreachable the validator falls back per
//! [`FallbackPolicy`].

mod document;
mod registry;

pub use document::{CompatibilityMode, SchemaDocument, SchemaType};
pub use registry::{MemorySchemaRegistry, RegisteredSchema, SchemaRegistry, VersionSpec};

use crate::error::{DeliveryError, Result};
use crate::metrics::Metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Behavior when the registry is unreachable and the cache cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Serve stale cache entries, and let payloads through unvalidated
    /// when there is no cached schema at all
    FailOpen,
    /// Propagate the registry error; nothing is published unvalidated
    #[default]
    FailClosed,
}

/// Validator tuning
#[derive(Debug, Clone)]
pub struct SchemaValidatorConfig {
    /// Compatibility rule enforced at registration
    pub compatibility: CompatibilityMode,
    /// How long the latest-version pointer stays fresh
    pub cache_ttl: Duration,
    /// Registry-unavailable behavior
    pub fallback: FallbackPolicy,
}

impl Default for SchemaValidatorConfig {
    fn default() -> Self {
        Self {
            compatibility: CompatibilityMode::Backward,
            cache_ttl: Duration::from_secs(300),
            fallback: FallbackPolicy::FailClosed,
        }
    }
}

/// Result of validating one payload
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Whether the payload conforms
    pub is_valid: bool,
    /// First violation found, when invalid
    pub reason: Option<String>,
}

impl ValidationOutcome {
    fn valid() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
        }
    }
}

/// A registry schema compiled for repeated validation
#[derive(Debug)]
pub struct CompiledSchema {
    /// The registry record this was compiled from
    pub record: RegisteredSchema,
    /// Structural validator, present for JSON schemas only
    pub document: Option<SchemaDocument>,
}

impl CompiledSchema {
    fn compile(record: RegisteredSchema) -> Result<Self> {
        let document = match record.schema_type {
            SchemaType::Json => Some(SchemaDocument::compile(&record.schema)?),
            // Binary formats carry their structure in the payload; the
            // gate only checks presence
            SchemaType::Avro | SchemaType::Protobuf => None,
        };
        Ok(Self { record, document })
    }
}

struct LatestEntry {
    schema: Arc<CompiledSchema>,
    fetched_at: Instant,
}

/// Cache-backed validation front for a [`SchemaRegistry`]
pub struct SchemaValidator {
    registry: Arc<dyn SchemaRegistry>,
    config: SchemaValidatorConfig,
    latest: RwLock<HashMap<String, LatestEntry>>,
    by_version: RwLock<HashMap<(String, u32), Arc<CompiledSchema>>>,
}

impl SchemaValidator {
    /// Create a validator with default config
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self::with_config(registry, SchemaValidatorConfig::default())
    }

    /// Create a validator with explicit config
    pub fn with_config(registry: Arc<dyn SchemaRegistry>, config: SchemaValidatorConfig) -> Self {
        Self {
            registry,
            config,
            latest: RwLock::new(HashMap::new()),
            by_version: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new schema version for `subject`
    ///
    /// The schema is checked against the subject's current latest version
    /// under the configured [`CompatibilityMode`] before it is stored; a
    /// rejected registration leaves the subject's version history
    /// untouched. Returns the schema id.
    pub async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        schema_type: &str,
    ) -> Result<u32> {
        let schema_type: SchemaType = schema_type.parse()?;

        let candidate = match schema_type {
            SchemaType::Json => Some(SchemaDocument::compile(schema)?),
            SchemaType::Avro | SchemaType::Protobuf => None,
        };

        if self.config.compatibility != CompatibilityMode::None {
            // Check against the true latest, not the cached one
            if let Some(previous) = self.registry.get(subject, VersionSpec::Latest).await? {
                if previous.schema_type != schema_type {
                    return Err(DeliveryError::Compatibility(format!(
                        "subject '{subject}' is {}, cannot register {schema_type}",
                        previous.schema_type
                    )));
                }
                if let Some(candidate) = &candidate {
                    let previous_doc = SchemaDocument::compile(&previous.schema)?;
                    candidate
                        .compatible_with(&previous_doc, self.config.compatibility)
                        .map_err(DeliveryError::Compatibility)?;
                }
            }
        }

        let schema_id = self
            .registry
            .register(subject, schema.to_string(), schema_type)
            .await?;
        self.invalidate(subject);
        Ok(schema_id)
    }

    /// Validate a payload against the latest schema for `subject`
    ///
    /// Subjects without a registered schema pass unvalidated. Registry
    /// errors surface per the configured [`FallbackPolicy`].
    pub async fn validate_event(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> Result<ValidationOutcome> {
        let schema = match self.get_schema(subject, VersionSpec::Latest).await {
            Ok(schema) => schema,
            Err(e) if self.config.fallback == FallbackPolicy::FailOpen => {
                tracing::warn!(
                    subject = %subject,
                    error = %e,
                    "schema registry unavailable, failing open"
                );
                return Ok(ValidationOutcome::valid());
            }
            Err(e) => return Err(e),
        };

        let Some(schema) = schema else {
            tracing::debug!(subject = %subject, "no schema registered, skipping validation");
            return Ok(ValidationOutcome::valid());
        };

        match &schema.document {
            Some(document) => {
                let value: serde_json::Value = match serde_json::from_slice(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        return Ok(ValidationOutcome::invalid(format!(
                            "payload is not valid JSON: {e}"
                        )));
                    }
                };
                match document.check(&value) {
                    Ok(()) => Ok(ValidationOutcome::valid()),
                    Err(reason) => Ok(ValidationOutcome::invalid(reason)),
                }
            }
            None => {
                if payload.is_empty() {
                    Ok(ValidationOutcome::invalid(format!(
                        "empty payload for {} subject '{subject}'",
                        schema.record.schema_type
                    )))
                } else {
                    Ok(ValidationOutcome::valid())
                }
            }
        }
    }

    /// Fetch a compiled schema, serving from cache where possible
    ///
    /// Exact versions are cached indefinitely. The latest pointer is
    /// cached for the configured TTL; under [`FallbackPolicy::FailOpen`]
    /// a stale latest entry is served when the registry errors.
    pub async fn get_schema(
        &self,
        subject: &str,
        version: VersionSpec,
    ) -> Result<Option<Arc<CompiledSchema>>> {
        match version {
            VersionSpec::Exact(n) => self.get_exact(subject, n).await,
            VersionSpec::Latest => self.get_latest(subject).await,
        }
    }

    async fn get_exact(&self, subject: &str, version: u32) -> Result<Option<Arc<CompiledSchema>>> {
        let key = (subject.to_string(), version);
        if let Some(hit) = self.by_version.read().get(&key) {
            if let Some(m) = Metrics::get() {
                m.schema_cache_hits.inc();
            }
            return Ok(Some(Arc::clone(hit)));
        }

        if let Some(m) = Metrics::get() {
            m.schema_cache_misses.inc();
        }
        let Some(record) = self.registry.get(subject, VersionSpec::Exact(version)).await? else {
            return Ok(None);
        };
        let compiled = Arc::new(CompiledSchema::compile(record)?);
        self.by_version.write().insert(key, Arc::clone(&compiled));
        Ok(Some(compiled))
    }

    async fn get_latest(&self, subject: &str) -> Result<Option<Arc<CompiledSchema>>> {
        if let Some(entry) = self.latest.read().get(subject) {
            if entry.fetched_at.elapsed() < self.config.cache_ttl {
                if let Some(m) = Metrics::get() {
                    m.schema_cache_hits.inc();
                }
                return Ok(Some(Arc::clone(&entry.schema)));
            }
        }

        if let Some(m) = Metrics::get() {
            m.schema_cache_misses.inc();
        }
        match self.registry.get(subject, VersionSpec::Latest).await {
            Ok(Some(record)) => {
                let compiled = Arc::new(CompiledSchema::compile(record)?);
                self.latest.write().insert(
                    subject.to_string(),
                    LatestEntry {
                        schema: Arc::clone(&compiled),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(Some(compiled))
            }
            Ok(None) => {
                // A vanished subject should not keep serving stale
                self.latest.write().remove(subject);
                Ok(None)
            }
            Err(e) => {
                if self.config.fallback == FallbackPolicy::FailOpen {
                    if let Some(entry) = self.latest.read().get(subject) {
                        tracing::warn!(
                            subject = %subject,
                            stale_for_secs = entry.fetched_at.elapsed().as_secs(),
                            error = %e,
                            "serving stale schema, registry unavailable"
                        );
                        return Ok(Some(Arc::clone(&entry.schema)));
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the cached latest pointer for `subject`
    ///
    /// Exact-version entries are immutable and stay cached.
    pub fn invalidate(&self, subject: &str) {
        self.latest.write().remove(subject);
    }

    /// Drop every cached latest pointer
    pub fn invalidate_all(&self) {
        self.latest.write().clear();
    }
}
