//! Schema registry abstraction and the in-memory implementation

use crate::error::Result;
use crate::schema::document::SchemaType;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Which version of a subject to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    /// The most recently registered version
    Latest,
    /// A specific version number (1-based)
    Exact(u32),
}

/// A schema as stored registry-side
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredSchema {
    /// Subject the schema is registered under (typically the topic name)
    pub subject: String,
    /// Version within the subject, starting at 1
    pub version: u32,
    /// Globally unique schema id
    pub schema_id: u32,
    /// Serialization format
    pub schema_type: SchemaType,
    /// Schema source text
    pub schema: String,
}

/// Backend-side schema storage
///
/// The validator sits in front of this trait with a local cache;
/// implementations only need durable versioned storage. Compatibility
/// checking happens validator-side before `register` is called.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Store a new schema version under `subject`, returning its id
    ///
    /// Registering a schema byte-identical to an existing version of the
    /// subject returns the existing id without creating a new version.
    async fn register(
        &self,
        subject: &str,
        schema: String,
        schema_type: SchemaType,
    ) -> Result<u32>;

    /// Fetch a schema version, `Ok(None)` when subject or version is absent
    async fn get(&self, subject: &str, version: VersionSpec)
        -> Result<Option<RegisteredSchema>>;

    /// Version numbers registered under `subject`, ascending
    async fn versions(&self, subject: &str) -> Result<Vec<u32>>;

    /// Most recent version number under `subject`, if any
    async fn latest_version(&self, subject: &str) -> Result<Option<u32>> {
        Ok(self.versions(subject).await?.last().copied())
    }
}

/// In-process registry backed by a `HashMap`
///
/// The default for tests and single-process deployments. Shares the
/// versioning semantics of a remote registry so the validator cannot
/// tell the difference.
#[derive(Default)]
pub struct MemorySchemaRegistry {
    subjects: RwLock<HashMap<String, Vec<Arc<RegisteredSchema>>>>,
    next_id: AtomicU32,
}

impl MemorySchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Number of versions stored under `subject`
    pub fn version_count(&self, subject: &str) -> usize {
        self.subjects
            .read()
            .get(subject)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn register(
        &self,
        subject: &str,
        schema: String,
        schema_type: SchemaType,
    ) -> Result<u32> {
        let mut subjects = self.subjects.write();
        let versions = subjects.entry(subject.to_string()).or_default();

        if let Some(existing) = versions
            .iter()
            .find(|v| v.schema == schema && v.schema_type == schema_type)
        {
            return Ok(existing.schema_id);
        }

        let schema_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let version = versions.len() as u32 + 1;
        versions.push(Arc::new(RegisteredSchema {
            subject: subject.to_string(),
            version,
            schema_id,
            schema_type,
            schema,
        }));

        tracing::debug!(
            subject = %subject,
            version = version,
            schema_id = schema_id,
            schema_type = %schema_type,
            "schema registered"
        );

        Ok(schema_id)
    }

    async fn get(
        &self,
        subject: &str,
        version: VersionSpec,
    ) -> Result<Option<RegisteredSchema>> {
        let subjects = self.subjects.read();
        let Some(versions) = subjects.get(subject) else {
            return Ok(None);
        };

        let found = match version {
            VersionSpec::Latest => versions.last(),
            VersionSpec::Exact(n) => versions.iter().find(|v| v.version == n),
        };

        Ok(found.map(|arc| (**arc).clone()))
    }

    async fn versions(&self, subject: &str) -> Result<Vec<u32>> {
        Ok(self
            .subjects
            .read()
            .get(subject)
            .map(|v| v.iter().map(|s| s.version).collect())
            .unwrap_or_default())
    }
}

/// Registry wrapper that fails every call, for fallback-policy tests
#[cfg(test)]
pub(crate) struct UnavailableRegistry;

#[cfg(test)]
#[async_trait]
impl SchemaRegistry for UnavailableRegistry {
    async fn register(&self, _: &str, _: String, _: SchemaType) -> Result<u32> {
        Err(crate::error::DeliveryError::Transient(
            "registry unreachable".into(),
        ))
    }

    async fn get(&self, _: &str, _: VersionSpec) -> Result<Option<RegisteredSchema>> {
        Err(crate::error::DeliveryError::Transient(
            "registry unreachable".into(),
        ))
    }

    async fn versions(&self, _: &str) -> Result<Vec<u32>> {
        Err(crate::error::DeliveryError::Transient(
            "registry unreachable".into(),
        ))
    }
}
