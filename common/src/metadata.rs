use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::column::DataType;

pub type TableName = String;
pub type SegmentName = String;

/// Tag de optimización que deja la conversión diccionario -> raw.
pub const OPTIMIZATION_RAW_INDEX: &str = "RAW_INDEX";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub data_type: DataType,
    pub has_dictionary: bool,
}

/// Metadata de un segmento. Se guarda como `metadata.json` dentro de cada
/// versión del segmento y también en el metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub table_name: TableName,
    pub segment_name: SegmentName,
    pub total_docs: u64,
    pub creation_time: DateTime<Utc>,

    /// Columnas del schema, por nombre.
    pub columns: BTreeMap<String, ColumnMetadata>,

    /// Optimizaciones aplicadas, en orden; cada tag aparece a lo sumo una vez.
    #[serde(default)]
    pub optimizations: Vec<String>,

    /// Campos que este sistema no interpreta pero debe conservar.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl SegmentMetadata {
    pub fn new(table_name: impl Into<String>, segment_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            segment_name: segment_name.into(),
            total_docs: 0,
            creation_time: Utc::now(),
            columns: BTreeMap::new(),
            optimizations: Vec::new(),
            custom: BTreeMap::new(),
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    /// `None` si la columna no existe en el schema del segmento.
    pub fn has_dictionary(&self, column: &str) -> Option<bool> {
        self.columns.get(column).map(|c| c.has_dictionary)
    }

    pub fn has_optimization(&self, tag: &str) -> bool {
        self.optimizations.iter().any(|t| t == tag)
    }

    /// Agrega el tag si no estaba. Devuelve true si hubo cambio.
    pub fn add_optimization(&mut self, tag: &str) -> bool {
        if self.has_optimization(tag) {
            return false;
        }
        self.optimizations.push(tag.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_optimization_no_duplica_tags() {
        let mut meta = SegmentMetadata::new("t", "s0");
        assert!(meta.add_optimization(OPTIMIZATION_RAW_INDEX));
        assert!(!meta.add_optimization(OPTIMIZATION_RAW_INDEX));
        assert_eq!(meta.optimizations, vec![OPTIMIZATION_RAW_INDEX.to_string()]);
    }

    #[test]
    fn has_dictionary_distinguishes_missing_columns() {
        let mut meta = SegmentMetadata::new("t", "s0");
        meta.columns.insert(
            "ArrDelay".into(),
            ColumnMetadata {
                data_type: DataType::Int,
                has_dictionary: true,
            },
        );
        assert_eq!(meta.has_dictionary("ArrDelay"), Some(true));
        assert_eq!(meta.has_dictionary("Nope"), None);
    }

    #[test]
    fn metadata_json_sin_optimizaciones_se_lee() {
        let json = r#"{
            "table_name": "t",
            "segment_name": "s0",
            "total_docs": 3,
            "creation_time": "2024-01-01T00:00:00Z",
            "columns": {"c": {"data_type": "DOUBLE", "has_dictionary": true}}
        }"#;
        let meta: SegmentMetadata = serde_json::from_str(json).unwrap();
        assert!(meta.optimizations.is_empty());
        assert!(meta.custom.is_empty());
        assert_eq!(meta.columns["c"].data_type, DataType::Double);
    }
}
