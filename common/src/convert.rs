use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::column::ColumnError;
use crate::metadata::OPTIMIZATION_RAW_INDEX;
use crate::segment_store::{SegmentError, SegmentStore, DEFAULT_STAGING_GRACE};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("no se pudo decodificar la columna {column}: {source}")]
    Decode {
        column: String,
        #[source]
        source: ColumnError,
    },

    #[error("la columna {column} tiene {found} filas, el segmento tiene {expected}")]
    RowCountMismatch {
        column: String,
        expected: u64,
        found: usize,
    },
}

/// Resultado de convertir un segmento.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionOutcome {
    /// El segmento ya tenía el tag: no se tocó nada.
    AlreadyApplied,
    Converted {
        /// Columnas pedidas que pasaron de diccionario a raw.
        converted: Vec<String>,
        /// Columnas pedidas que ya eran raw.
        untouched: Vec<String>,
        /// Columnas pedidas que el segmento no tiene.
        missing: Vec<String>,
    },
}

/// Convierte columnas con diccionario a raw dentro de un segmento y publica
/// el resultado de forma atómica.
#[derive(Debug, Clone)]
pub struct ConvertToRawIndexExecutor {
    store: SegmentStore,
    /// Stagings más jóvenes que esto pueden ser de otro intento vivo.
    staging_grace: Duration,
}

impl ConvertToRawIndexExecutor {
    pub fn new(store: SegmentStore) -> Self {
        Self {
            store,
            staging_grace: DEFAULT_STAGING_GRACE,
        }
    }

    pub fn with_staging_grace(mut self, grace: Duration) -> Self {
        self.staging_grace = grace;
        self
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn convert(
        &self,
        table: &str,
        segment: &str,
        columns: &[String],
    ) -> Result<ConversionOutcome, ConvertError> {
        self.store
            .discard_stale_staging(table, segment, self.staging_grace)?;

        let handle = self.store.open(table, segment)?;
        if handle.metadata().has_optimization(OPTIMIZATION_RAW_INDEX) {
            info!(
                "segmento {}/{} ya tiene {}, nada que hacer",
                table, segment, OPTIMIZATION_RAW_INDEX
            );
            return Ok(ConversionOutcome::AlreadyApplied);
        }

        let requested: BTreeSet<&str> = columns.iter().map(|c| c.as_str()).collect();
        let stored = handle.stored_columns()?;
        let total_docs = handle.metadata().total_docs;

        // si algo falla antes de publicar, el Drop de `staged` lo borra
        let staged = self.store.stage_over(&handle)?;
        let mut metadata = handle.metadata().clone();
        let mut converted = Vec::new();
        let mut untouched = Vec::new();

        for column in &stored {
            if !requested.contains(column.as_str()) {
                staged.copy_column_from(&handle, column)?;
                continue;
            }

            let store = handle.read_column(column)?;
            if store.has_dictionary() {
                let raw = store.to_raw().map_err(|source| ConvertError::Decode {
                    column: column.clone(),
                    source,
                })?;
                if raw.num_rows() as u64 != total_docs {
                    return Err(ConvertError::RowCountMismatch {
                        column: column.clone(),
                        expected: total_docs,
                        found: raw.num_rows(),
                    });
                }
                staged.write_column(column, &raw)?;
                converted.push(column.clone());
            } else {
                staged.copy_column_from(&handle, column)?;
                untouched.push(column.clone());
            }

            if let Some(meta) = metadata.columns.get_mut(column) {
                meta.has_dictionary = false;
            }
        }

        let missing: Vec<String> = requested
            .iter()
            .filter(|c| !stored.iter().any(|s| s == *c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            warn!(
                "segmento {}/{} no tiene las columnas {:?}, se ignoran",
                table, segment, missing
            );
        }

        metadata.add_optimization(OPTIMIZATION_RAW_INDEX);
        staged.write_metadata(&metadata)?;

        match self.store.publish(staged) {
            Ok(version) => {
                info!(
                    "segmento {}/{} convertido a raw en {} (convertidas={:?}, ya raw={:?})",
                    table, segment, version, converted, untouched
                );
                Ok(ConversionOutcome::Converted {
                    converted,
                    untouched,
                    missing,
                })
            }
            Err(SegmentError::StaleBase { base, visible }) => {
                // otro intento publicó primero; si dejó el tag, estamos bien
                let now = self.store.open(table, segment)?;
                if now.metadata().has_optimization(OPTIMIZATION_RAW_INDEX) {
                    info!(
                        "segmento {}/{} convertido por otro intento mientras tanto ({})",
                        table, segment, visible
                    );
                    Ok(ConversionOutcome::AlreadyApplied)
                } else {
                    Err(SegmentError::StaleBase { base, visible }.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnStore, ColumnValues, DataType};
    use crate::metadata::{ColumnMetadata, SegmentMetadata};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::{env, fs, thread};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("convert_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn airline_values() -> BTreeMap<String, ColumnValues> {
        let mut cols = BTreeMap::new();
        cols.insert("ArrDelay".to_string(), ColumnValues::Int(vec![5, -3, 5, 0]));
        cols.insert("DepDelay".to_string(), ColumnValues::Double(vec![1.25, f64::NAN, -0.0, 1.25]));
        cols.insert("Carrier".to_string(), ColumnValues::String(vec!["AA".into(), "DL".into(), "AA".into(), "UA".into()]));
        cols.insert("Distance".to_string(), ColumnValues::Long(vec![300, 1200, 300, 9000]));
        cols.insert("Ratio".to_string(), ColumnValues::Float(vec![0.5, 0.25, 0.5, f32::MAX]));
        cols.insert("Payload".to_string(), ColumnValues::Bytes(vec![vec![1], vec![], vec![1], vec![0xde, 0xad]]));
        cols
    }

    /// Crea un segmento con todas las columnas en diccionario salvo `raw`.
    fn make_segment(store: &SegmentStore, segment: &str, raw: &[&str]) -> SegmentMetadata {
        let mut meta = SegmentMetadata::new("airlines", segment);
        meta.total_docs = 4;
        meta.custom.insert("segment.index.version".into(), "v3".into());
        let mut columns = BTreeMap::new();
        for (name, values) in airline_values() {
            let is_raw = raw.contains(&name.as_str());
            let store = if is_raw {
                ColumnStore::raw(values.clone())
            } else {
                ColumnStore::dictionary_encode(&values)
            };
            meta.columns.insert(
                name.clone(),
                ColumnMetadata {
                    data_type: values.data_type(),
                    has_dictionary: !is_raw,
                },
            );
            columns.insert(name, store);
        }
        store.create_segment(&meta, &columns).unwrap();
        meta
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn converts_requested_columns_only() {
        let store = SegmentStore::new(temp_dir("basic"));
        let before = make_segment(&store, "s0", &["Distance"]);
        let exec = ConvertToRawIndexExecutor::new(store.clone());

        let outcome = exec
            .convert("airlines", "s0", &cols(&["ArrDelay", "DepDelay", "Distance", "Nope"]))
            .unwrap();
        assert_eq!(
            outcome,
            ConversionOutcome::Converted {
                converted: cols(&["ArrDelay", "DepDelay"]),
                untouched: cols(&["Distance"]),
                missing: cols(&["Nope"]),
            }
        );

        let handle = store.open("airlines", "s0").unwrap();
        let meta = handle.metadata();
        assert_eq!(meta.optimizations, cols(&[OPTIMIZATION_RAW_INDEX]));
        assert_eq!(meta.has_dictionary("ArrDelay"), Some(false));
        assert_eq!(meta.has_dictionary("DepDelay"), Some(false));
        assert_eq!(meta.has_dictionary("Distance"), Some(false));
        assert_eq!(meta.has_dictionary("Carrier"), Some(true));
        assert_eq!(meta.has_dictionary("Ratio"), Some(true));

        // el resto de la metadata no cambia
        assert_eq!(meta.custom, before.custom);
        assert_eq!(meta.creation_time, before.creation_time);
        assert_eq!(meta.total_docs, before.total_docs);

        assert!(!handle.read_column("ArrDelay").unwrap().has_dictionary());
        assert!(handle.read_column("Carrier").unwrap().has_dictionary());
    }

    #[test]
    fn valores_identicos_para_todos_los_tipos() {
        let store = SegmentStore::new(temp_dir("roundtrip"));
        make_segment(&store, "s0", &[]);
        let before = store.open("airlines", "s0").unwrap();
        let all: Vec<String> = airline_values().keys().cloned().collect();

        ConvertToRawIndexExecutor::new(store.clone())
            .convert("airlines", "s0", &all)
            .unwrap();

        let after = store.open("airlines", "s0").unwrap();
        for name in &all {
            let old = before.read_column(name).unwrap().read_all().unwrap();
            let new_store = after.read_column(name).unwrap();
            assert!(!new_store.has_dictionary());
            assert!(new_store.read_all().unwrap().bit_eq(&old), "columna {}", name);
        }
    }

    #[test]
    fn already_converted_is_a_noop() {
        let store = SegmentStore::new(temp_dir("idempotent"));
        make_segment(&store, "s0", &[]);
        let exec = ConvertToRawIndexExecutor::new(store.clone());
        let wanted = cols(&["ArrDelay", "Carrier"]);

        exec.convert("airlines", "s0", &wanted).unwrap();
        let first = store.open("airlines", "s0").unwrap();
        let bytes: Vec<Vec<u8>> = first
            .stored_columns()
            .unwrap()
            .iter()
            .map(|c| first.read_column_bytes(c).unwrap())
            .collect();

        assert_eq!(
            exec.convert("airlines", "s0", &wanted).unwrap(),
            ConversionOutcome::AlreadyApplied
        );
        // incluso pidiendo otras columnas
        assert_eq!(
            exec.convert("airlines", "s0", &cols(&["Ratio"])).unwrap(),
            ConversionOutcome::AlreadyApplied
        );

        let second = store.open("airlines", "s0").unwrap();
        assert_eq!(second.version(), first.version());
        assert_eq!(second.metadata().optimizations, cols(&[OPTIMIZATION_RAW_INDEX]));
        let bytes_after: Vec<Vec<u8>> = second
            .stored_columns()
            .unwrap()
            .iter()
            .map(|c| second.read_column_bytes(c).unwrap())
            .collect();
        assert_eq!(bytes, bytes_after);
    }

    #[test]
    fn corrupt_dictionary_leaves_segment_untouched() {
        let store = SegmentStore::new(temp_dir("corrupt"));
        let mut meta = SegmentMetadata::new("airlines", "s0");
        meta.total_docs = 2;
        meta.columns.insert(
            "ArrDelay".into(),
            ColumnMetadata {
                data_type: DataType::Int,
                has_dictionary: true,
            },
        );
        let mut columns = BTreeMap::new();
        columns.insert(
            "ArrDelay".to_string(),
            ColumnStore::Dictionary {
                dictionary: ColumnValues::Int(vec![7]),
                codes: vec![0, 3],
            },
        );
        store.create_segment(&meta, &columns).unwrap();

        let err = ConvertToRawIndexExecutor::new(store.clone())
            .convert("airlines", "s0", &cols(&["ArrDelay"]))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Decode { .. }));

        let handle = store.open("airlines", "s0").unwrap();
        assert_eq!(handle.version(), "v1");
        assert!(handle.metadata().optimizations.is_empty());

        // no quedan stagings
        let leftovers = fs::read_dir(store.segment_dir("airlines", "s0"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn missing_segment_is_an_error() {
        let store = SegmentStore::new(temp_dir("missing"));
        let err = ConvertToRawIndexExecutor::new(store)
            .convert("airlines", "ghost", &cols(&["ArrDelay"]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertError::Segment(SegmentError::NotFound { .. })
        ));
    }

    #[test]
    fn lector_concurrente_nunca_ve_mezcla() {
        let store = SegmentStore::new(temp_dir("visibility"));
        make_segment(&store, "s0", &[]);
        let wanted = cols(&["ArrDelay", "DepDelay", "Carrier"]);

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let store = store.clone();
            let done = done.clone();
            let wanted = wanted.clone();
            thread::spawn(move || {
                let mut observed = 0;
                while !done.load(Ordering::SeqCst) || observed == 0 {
                    let handle = match store.open("airlines", "s0") {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    let encodings: Vec<bool> = match wanted
                        .iter()
                        .map(|c| handle.read_column(c).map(|s| s.has_dictionary()))
                        .collect::<Result<Vec<_>, _>>()
                    {
                        Ok(e) => e,
                        // la versión fijada pudo haberse reclamado
                        Err(_) => continue,
                    };
                    assert!(
                        encodings.iter().all(|d| *d) || encodings.iter().all(|d| !*d),
                        "mezcla observada: {:?}",
                        encodings
                    );
                    let meta_flags: Vec<bool> = wanted
                        .iter()
                        .map(|c| handle.metadata().has_dictionary(c).unwrap())
                        .collect();
                    assert_eq!(meta_flags, encodings);
                    observed += 1;
                }
                observed
            })
        };

        ConvertToRawIndexExecutor::new(store.clone())
            .convert("airlines", "s0", &wanted)
            .unwrap();
        done.store(true, Ordering::SeqCst);

        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn intento_concurrente_que_pierde_la_carrera_da_exito() {
        let store = SegmentStore::new(temp_dir("race"));
        make_segment(&store, "s0", &[]);
        let exec = ConvertToRawIndexExecutor::new(store.clone());

        // el "otro" intento abrió la versión vieja antes de que publiquemos
        let stale = store.open("airlines", "s0").unwrap();

        exec.convert("airlines", "s0", &cols(&["ArrDelay"])).unwrap();

        let staged = store.stage_over(&stale).unwrap();
        staged.write_metadata(stale.metadata()).unwrap();
        assert!(matches!(
            store.publish(staged),
            Err(SegmentError::StaleBase { .. })
        ));
        assert_eq!(
            store.open("airlines", "s0").unwrap().metadata().optimizations,
            cols(&[OPTIMIZATION_RAW_INDEX])
        );
    }

    #[test]
    fn staging_reciente_de_otro_intento_no_se_borra() {
        let store = SegmentStore::new(temp_dir("fresh_staging"));
        make_segment(&store, "s0", &[]);

        // otro intento vivo con su staging a medio escribir
        let other = store.stage("airlines", "s0").unwrap();
        let other_dir = other.dir().to_path_buf();

        ConvertToRawIndexExecutor::new(store.clone())
            .convert("airlines", "s0", &cols(&["ArrDelay"]))
            .unwrap();
        assert!(other_dir.exists());
        drop(other);

        // una huella vieja de un crash sí se limpia
        let leftover = store.stage("airlines", "s0").unwrap();
        let leftover_dir = leftover.dir().to_path_buf();
        std::mem::forget(leftover);
        ConvertToRawIndexExecutor::new(store.clone())
            .with_staging_grace(Duration::ZERO)
            .convert("airlines", "s0", &cols(&["ArrDelay"]))
            .unwrap();
        assert!(!leftover_dir.exists());
    }

    #[test]
    fn conversiones_concurrentes_dejan_el_segmento_legible() {
        let store = SegmentStore::new(temp_dir("concurrent_converts"));
        let expected = airline_values();

        for round in 0..10 {
            let segment = format!("s{}", round);
            make_segment(&store, &segment, &[]);

            let barrier = Arc::new(Barrier::new(4));
            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let exec = ConvertToRawIndexExecutor::new(store.clone())
                        .with_staging_grace(Duration::ZERO);
                    let barrier = barrier.clone();
                    let segment = segment.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        exec.convert("airlines", &segment, &cols(&["ArrDelay", "Carrier"]))
                    })
                })
                .collect();
            let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

            // quien pierde puede fallar, pero nunca deja una versión rota
            let handle = store.open("airlines", &segment).unwrap();
            for (name, values) in &expected {
                let read = handle.read_column(name).unwrap().read_all().unwrap();
                assert!(read.bit_eq(values), "columna {}", name);
            }
            if results.iter().any(|r| matches!(r, Ok(ConversionOutcome::Converted { .. }))) {
                assert!(handle.metadata().has_optimization(OPTIMIZATION_RAW_INDEX));
            }
        }
    }
}
