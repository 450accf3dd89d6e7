use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Cabecera de los archivos de columna: magic + versión del formato.
const COLUMN_FILE_MAGIC: &[u8; 4] = b"SGCL";
const COLUMN_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ColumnError {
    #[error("código {code} fuera de rango en la fila {row} (cardinalidad {cardinality})")]
    CodeOutOfRange {
        row: usize,
        code: u32,
        cardinality: usize,
    },

    #[error("archivo de columna inválido: magic {found:?}")]
    BadMagic { found: Vec<u8> },

    #[error("versión de formato de columna no soportada: {found}")]
    UnsupportedVersion { found: u32 },

    #[error("error codificando columna: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
}

/// Valores de una columna, ya decodificados, en orden de fila.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValues {
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
    Bytes(Vec<Vec<u8>>),
}

impl ColumnValues {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnValues::Int(_) => DataType::Int,
            ColumnValues::Long(_) => DataType::Long,
            ColumnValues::Float(_) => DataType::Float,
            ColumnValues::Double(_) => DataType::Double,
            ColumnValues::String(_) => DataType::String,
            ColumnValues::Bytes(_) => DataType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int(v) => v.len(),
            ColumnValues::Long(v) => v.len(),
            ColumnValues::Float(v) => v.len(),
            ColumnValues::Double(v) => v.len(),
            ColumnValues::String(v) => v.len(),
            ColumnValues::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Igualdad bit a bit: a diferencia de `==`, trata NaN == NaN y
    /// distingue 0.0 de -0.0.
    pub fn bit_eq(&self, other: &ColumnValues) -> bool {
        match (self, other) {
            (ColumnValues::Float(a), ColumnValues::Float(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ColumnValues::Double(a), ColumnValues::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }

    /// Resuelve cada código contra este diccionario.
    fn gather(&self, codes: &[u32]) -> Result<ColumnValues, ColumnError> {
        Ok(match self {
            ColumnValues::Int(d) => ColumnValues::Int(gather(d, codes)?),
            ColumnValues::Long(d) => ColumnValues::Long(gather(d, codes)?),
            ColumnValues::Float(d) => ColumnValues::Float(gather(d, codes)?),
            ColumnValues::Double(d) => ColumnValues::Double(gather(d, codes)?),
            ColumnValues::String(d) => ColumnValues::String(gather(d, codes)?),
            ColumnValues::Bytes(d) => ColumnValues::Bytes(gather(d, codes)?),
        })
    }
}

fn gather<T: Clone>(dictionary: &[T], codes: &[u32]) -> Result<Vec<T>, ColumnError> {
    codes
        .iter()
        .enumerate()
        .map(|(row, &code)| {
            dictionary
                .get(code as usize)
                .cloned()
                .ok_or(ColumnError::CodeOutOfRange {
                    row,
                    code,
                    cardinality: dictionary.len(),
                })
        })
        .collect()
}

/// Construye (diccionario ordenado, códigos) usando `key` como orden total.
fn encode_with<T: Clone, K: Ord>(values: &[T], key: impl Fn(&T) -> K) -> (Vec<T>, Vec<u32>) {
    let mut uniques: BTreeMap<K, T> = BTreeMap::new();
    for v in values {
        uniques.entry(key(v)).or_insert_with(|| v.clone());
    }

    let index: BTreeMap<&K, u32> = uniques
        .keys()
        .enumerate()
        .map(|(i, k)| (k, i as u32))
        .collect();
    let codes = values.iter().map(|v| index[&key(v)]).collect();
    let dictionary = uniques.values().cloned().collect();

    (dictionary, codes)
}

// mismo orden que f32::total_cmp, pero como clave entera
fn f32_key(x: &f32) -> i32 {
    let bits = x.to_bits() as i32;
    bits ^ ((((bits >> 31) as u32) >> 1) as i32)
}

fn f64_key(x: &f64) -> i64 {
    let bits = x.to_bits() as i64;
    bits ^ ((((bits >> 63) as u64) >> 1) as i64)
}

/// Representación física de una columna dentro de un segmento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnStore {
    Dictionary {
        dictionary: ColumnValues,
        codes: Vec<u32>,
    },
    Raw {
        values: ColumnValues,
    },
}

impl ColumnStore {
    pub fn raw(values: ColumnValues) -> Self {
        ColumnStore::Raw { values }
    }

    /// Codifica con diccionario ordenado y sin duplicados.
    pub fn dictionary_encode(values: &ColumnValues) -> Self {
        let (dictionary, codes) = match values {
            ColumnValues::Int(v) => {
                let (d, c) = encode_with(v, |x| *x);
                (ColumnValues::Int(d), c)
            }
            ColumnValues::Long(v) => {
                let (d, c) = encode_with(v, |x| *x);
                (ColumnValues::Long(d), c)
            }
            ColumnValues::Float(v) => {
                let (d, c) = encode_with(v, f32_key);
                (ColumnValues::Float(d), c)
            }
            ColumnValues::Double(v) => {
                let (d, c) = encode_with(v, f64_key);
                (ColumnValues::Double(d), c)
            }
            ColumnValues::String(v) => {
                let (d, c) = encode_with(v, |x| x.clone());
                (ColumnValues::String(d), c)
            }
            ColumnValues::Bytes(v) => {
                let (d, c) = encode_with(v, |x| x.clone());
                (ColumnValues::Bytes(d), c)
            }
        };
        ColumnStore::Dictionary { dictionary, codes }
    }

    pub fn has_dictionary(&self) -> bool {
        matches!(self, ColumnStore::Dictionary { .. })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ColumnStore::Dictionary { dictionary, .. } => dictionary.data_type(),
            ColumnStore::Raw { values } => values.data_type(),
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            ColumnStore::Dictionary { codes, .. } => codes.len(),
            ColumnStore::Raw { values } => values.len(),
        }
    }

    /// Lectura de todas las filas, tal como las vería un lector.
    pub fn read_all(&self) -> Result<ColumnValues, ColumnError> {
        match self {
            ColumnStore::Dictionary { dictionary, codes } => dictionary.gather(codes),
            ColumnStore::Raw { values } => Ok(values.clone()),
        }
    }

    /// Versión raw de esta columna. Para columnas que ya son raw es un clon.
    pub fn to_raw(&self) -> Result<ColumnStore, ColumnError> {
        Ok(ColumnStore::Raw {
            values: self.read_all()?,
        })
    }

    /// Extensión del archivo en disco: "dict" o "raw".
    pub fn file_extension(&self) -> &'static str {
        if self.has_dictionary() {
            DICT_EXTENSION
        } else {
            RAW_EXTENSION
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ColumnError> {
        let mut out = Vec::with_capacity(8 + self.num_rows() * 4);
        out.extend_from_slice(COLUMN_FILE_MAGIC);
        out.extend_from_slice(&COLUMN_FILE_VERSION.to_le_bytes());
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ColumnError> {
        if bytes.len() < 8 || &bytes[..4] != COLUMN_FILE_MAGIC {
            return Err(ColumnError::BadMagic {
                found: bytes.iter().take(4).copied().collect(),
            });
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != COLUMN_FILE_VERSION {
            return Err(ColumnError::UnsupportedVersion { found: version });
        }
        Ok(bincode::deserialize(&bytes[8..])?)
    }
}

pub const DICT_EXTENSION: &str = "dict";
pub const RAW_EXTENSION: &str = "raw";
