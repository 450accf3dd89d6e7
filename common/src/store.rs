use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::metadata::SegmentMetadata;

/// Reintentos del bucle de compare-and-set antes de rendirse.
pub const MAX_CAS_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store no disponible: {0}")]
    Unavailable(String),

    #[error("segmento {table}/{segment} no existe")]
    SegmentNotFound { table: String, segment: String },

    #[error("conflicto de CAS persistente en {table}/{segment}")]
    Conflict { table: String, segment: String },
}

/// Registro con su versión, para compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied(u64),
    Conflict(u64),
}

/// Metadata store externo: KV linealizable con compare-and-set sobre la
/// lista de optimizaciones de cada segmento.
pub trait MetadataStore: Send + Sync {
    fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    fn list_segments(&self, table: &str) -> Result<Vec<Versioned<SegmentMetadata>>, StoreError>;

    fn get_segment(
        &self,
        table: &str,
        segment: &str,
    ) -> Result<Option<Versioned<SegmentMetadata>>, StoreError>;

    /// Crea el registro si no existe. Devuelve false si ya estaba.
    fn put_segment_if_absent(&self, metadata: SegmentMetadata) -> Result<bool, StoreError>;

    fn compare_and_set_optimizations(
        &self,
        table: &str,
        segment: &str,
        expected_version: u64,
        optimizations: Vec<String>,
    ) -> Result<CasOutcome, StoreError>;
}

/// Agrega `tag` a las optimizaciones del segmento con un bucle de CAS.
/// Si el tag ya está no escribe nada. Devuelve true si lo agregó.
pub fn record_optimization(
    store: &dyn MetadataStore,
    table: &str,
    segment: &str,
    tag: &str,
) -> Result<bool, StoreError> {
    for attempt in 0..MAX_CAS_RETRIES {
        let current = store
            .get_segment(table, segment)?
            .ok_or_else(|| StoreError::SegmentNotFound {
                table: table.to_string(),
                segment: segment.to_string(),
            })?;

        let mut meta = current.value;
        if !meta.add_optimization(tag) {
            return Ok(false);
        }

        match store.compare_and_set_optimizations(
            table,
            segment,
            current.version,
            meta.optimizations,
        )? {
            CasOutcome::Applied(_) => return Ok(true),
            CasOutcome::Conflict(seen) => {
                debug!(
                    "CAS en conflicto para {}/{} (esperaba v{}, hay v{}), intento {}",
                    table, segment, current.version, seen, attempt
                );
            }
        }
    }

    Err(StoreError::Conflict {
        table: table.to_string(),
        segment: segment.to_string(),
    })
}

/// Implementación en memoria que usa el master.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    // tabla -> segmento -> registro versionado
    tables: Mutex<HashMap<String, BTreeMap<String, Versioned<SegmentMetadata>>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Versioned<SegmentMetadata>>>>,
        StoreError,
    > {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("lock envenenado".to_string()))
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.lock()?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn list_segments(&self, table: &str) -> Result<Vec<Versioned<SegmentMetadata>>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .get(table)
            .map(|segments| segments.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_segment(
        &self,
        table: &str,
        segment: &str,
    ) -> Result<Option<Versioned<SegmentMetadata>>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.get(table).and_then(|s| s.get(segment)).cloned())
    }

    fn put_segment_if_absent(&self, metadata: SegmentMetadata) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let segments = tables.entry(metadata.table_name.clone()).or_default();
        if segments.contains_key(&metadata.segment_name) {
            return Ok(false);
        }
        segments.insert(
            metadata.segment_name.clone(),
            Versioned {
                version: 1,
                value: metadata,
            },
        );
        Ok(true)
    }

    fn compare_and_set_optimizations(
        &self,
        table: &str,
        segment: &str,
        expected_version: u64,
        optimizations: Vec<String>,
    ) -> Result<CasOutcome, StoreError> {
        let mut tables = self.lock()?;
        let record = tables
            .get_mut(table)
            .and_then(|s| s.get_mut(segment))
            .ok_or_else(|| StoreError::SegmentNotFound {
                table: table.to_string(),
                segment: segment.to_string(),
            })?;

        if record.version != expected_version {
            return Ok(CasOutcome::Conflict(record.version));
        }

        record.value.optimizations = optimizations;
        record.version += 1;
        Ok(CasOutcome::Applied(record.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::OPTIMIZATION_RAW_INDEX;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store_with(segments: &[&str]) -> InMemoryMetadataStore {
        let store = InMemoryMetadataStore::new();
        for s in segments {
            store
                .put_segment_if_absent(SegmentMetadata::new("airlines", *s))
                .unwrap();
        }
        store
    }

    #[test]
    fn put_segment_if_absent_no_pisa() {
        let store = store_with(&["s0"]);
        let mut again = SegmentMetadata::new("airlines", "s0");
        again.total_docs = 99;
        assert!(!store.put_segment_if_absent(again).unwrap());

        let seg = store.get_segment("airlines", "s0").unwrap().unwrap();
        assert_eq!(seg.version, 1);
        assert_eq!(seg.value.total_docs, 0);
    }

    #[test]
    fn cas_rejects_stale_version() {
        let store = store_with(&["s0"]);
        let tags = vec!["X".to_string()];

        assert_eq!(
            store
                .compare_and_set_optimizations("airlines", "s0", 1, tags.clone())
                .unwrap(),
            CasOutcome::Applied(2)
        );
        assert_eq!(
            store
                .compare_and_set_optimizations("airlines", "s0", 1, tags)
                .unwrap(),
            CasOutcome::Conflict(2)
        );
    }

    #[test]
    fn record_optimization_es_idempotente() {
        let store = store_with(&["s0"]);

        assert!(record_optimization(&store, "airlines", "s0", OPTIMIZATION_RAW_INDEX).unwrap());
        assert!(!record_optimization(&store, "airlines", "s0", OPTIMIZATION_RAW_INDEX).unwrap());

        let seg = store.get_segment("airlines", "s0").unwrap().unwrap();
        assert_eq!(seg.value.optimizations, vec![OPTIMIZATION_RAW_INDEX.to_string()]);
        assert_eq!(seg.version, 2);
    }

    #[test]
    fn record_optimization_on_unknown_segment_fails() {
        let store = store_with(&[]);
        assert!(matches!(
            record_optimization(&store, "airlines", "ghost", OPTIMIZATION_RAW_INDEX),
            Err(StoreError::SegmentNotFound { .. })
        ));
    }

    /// Store que simula un escritor concurrente: los primeros N CAS chocan.
    struct Contended {
        inner: InMemoryMetadataStore,
        conflicts_left: AtomicU32,
    }

    impl MetadataStore for Contended {
        fn list_tables(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_tables()
        }
        fn list_segments(
            &self,
            table: &str,
        ) -> Result<Vec<Versioned<SegmentMetadata>>, StoreError> {
            self.inner.list_segments(table)
        }
        fn get_segment(
            &self,
            table: &str,
            segment: &str,
        ) -> Result<Option<Versioned<SegmentMetadata>>, StoreError> {
            self.inner.get_segment(table, segment)
        }
        fn put_segment_if_absent(&self, metadata: SegmentMetadata) -> Result<bool, StoreError> {
            self.inner.put_segment_if_absent(metadata)
        }
        fn compare_and_set_optimizations(
            &self,
            table: &str,
            segment: &str,
            expected_version: u64,
            optimizations: Vec<String>,
        ) -> Result<CasOutcome, StoreError> {
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                return Ok(CasOutcome::Conflict(expected_version + 1));
            }
            self.inner
                .compare_and_set_optimizations(table, segment, expected_version, optimizations)
        }
    }

    #[test]
    fn record_optimization_retries_conflicts() {
        let store = Contended {
            inner: store_with(&["s0"]),
            conflicts_left: AtomicU32::new(2),
        };
        assert!(record_optimization(&store, "airlines", "s0", OPTIMIZATION_RAW_INDEX).unwrap());

        let hopeless = Contended {
            inner: store_with(&["s0"]),
            conflicts_left: AtomicU32::new(MAX_CAS_RETRIES),
        };
        assert!(matches!(
            record_optimization(&hopeless, "airlines", "s0", OPTIMIZATION_RAW_INDEX),
            Err(StoreError::Conflict { .. })
        ));
    }
}
