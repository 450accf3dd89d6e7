//! Almacenamiento de segmentos en disco con versiones por directorio.
//!
//! ```text
//! <root>/<tabla>/<segmento>/CURRENT                 -> "v2"
//! <root>/<tabla>/<segmento>/v2/metadata.json
//! <root>/<tabla>/<segmento>/v2/columns/<col>.dict | <col>.raw
//! <root>/<tabla>/<segmento>/.staging-<uuid>/       (invisible para lectores)
//! ```
//!
//! Un lector lee `CURRENT` una sola vez y queda fijado a esa versión.
//! Publicar es renombrar el staging a `v<N+1>` y luego reemplazar `CURRENT`
//! con un rename atómico: ese rename es el único paso visible.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::column::{ColumnError, ColumnStore, DICT_EXTENSION, RAW_EXTENSION};
use crate::metadata::SegmentMetadata;

pub const CURRENT_FILE: &str = "CURRENT";
const CURRENT_TMP_FILE: &str = "CURRENT.tmp";
const PUBLISH_LOCK_FILE: &str = "PUBLISH.lock";
pub const METADATA_FILE: &str = "metadata.json";
const COLUMNS_DIR: &str = "columns";
const STAGING_PREFIX: &str = ".staging-";

/// Un lock de publicación más viejo que esto se considera abandonado.
const STALE_PUBLISH_LOCK: Duration = Duration::from_secs(60);

/// Edad mínima de un staging para darlo por abandonado. Igual al lease por
/// defecto del master: un intento más lento ya perdió su sub-tarea.
pub const DEFAULT_STAGING_GRACE: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("segmento {table}/{segment} no existe")]
    NotFound { table: String, segment: String },

    #[error("metadata inválida en {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("columna {column}: {source}")]
    Column {
        column: String,
        #[source]
        source: ColumnError,
    },

    #[error("columna {0} no existe en el segmento")]
    ColumnNotFound(String),

    #[error("nombre inválido: {0:?}")]
    InvalidName(String),

    #[error("versión inválida en CURRENT: {0:?}")]
    InvalidVersion(String),

    #[error("otra publicación en curso sobre {0}")]
    PublishInProgress(PathBuf),

    #[error("staging incompleto o borrado: {0}")]
    IncompleteStaging(PathBuf),

    #[error("la versión visible cambió durante la conversión (base {base}, visible {visible})")]
    StaleBase { base: String, visible: String },
}

fn ctx<T>(res: io::Result<T>, path: &Path) -> Result<T, SegmentError> {
    res.map_err(|source| SegmentError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn check_name(name: &str) -> Result<(), SegmentError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(SegmentError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn parse_version(name: &str) -> Option<u64> {
    name.strip_prefix('v').and_then(|n| n.parse::<u64>().ok())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), SegmentError> {
    let mut file = ctx(File::create(path), path)?;
    ctx(file.write_all(bytes), path)?;
    ctx(file.sync_all(), path)
}

/// Hace cuánto se tocó por última vez un staging (directorio, columnas o
/// metadata). `None` si ya no existe.
fn staging_age(dir: &Path) -> Option<Duration> {
    let latest = [dir.to_path_buf(), dir.join(COLUMNS_DIR), dir.join(METADATA_FILE)]
        .iter()
        .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok())
        .max()?;
    Some(SystemTime::now().duration_since(latest).unwrap_or_default())
}

/// Un staging se puede publicar si tiene metadata y un archivo por cada
/// columna que ésta declara.
fn verify_staging(dir: &Path) -> Result<(), SegmentError> {
    let meta_path = dir.join(METADATA_FILE);
    let raw = match fs::read(&meta_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SegmentError::IncompleteStaging(dir.to_path_buf()))
        }
        Err(e) => {
            return Err(SegmentError::Io {
                path: meta_path,
                source: e,
            })
        }
    };
    let metadata: SegmentMetadata =
        serde_json::from_slice(&raw).map_err(|source| SegmentError::Metadata {
            path: meta_path.clone(),
            source,
        })?;

    let columns = dir.join(COLUMNS_DIR);
    for name in metadata.columns.keys() {
        let present = [DICT_EXTENSION, RAW_EXTENSION]
            .iter()
            .any(|ext| columns.join(format!("{}.{}", name, ext)).is_file());
        if !present {
            return Err(SegmentError::IncompleteStaging(dir.to_path_buf()));
        }
    }
    Ok(())
}

fn sync_dir(dir: &Path) {
    // no todos los sistemas permiten fsync sobre directorios
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_dir(&self, table: &str, segment: &str) -> PathBuf {
        self.root.join(table).join(segment)
    }

    fn current_version(&self, table: &str, segment: &str) -> Result<Option<String>, SegmentError> {
        let path = self.segment_dir(table, segment).join(CURRENT_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => {
                let version = s.trim().to_string();
                if parse_version(&version).is_none() {
                    return Err(SegmentError::InvalidVersion(version));
                }
                Ok(Some(version))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SegmentError::Io { path, source: e }),
        }
    }

    /// Escribe un segmento nuevo (o una versión nueva completa de uno existente).
    pub fn create_segment(
        &self,
        metadata: &SegmentMetadata,
        columns: &BTreeMap<String, ColumnStore>,
    ) -> Result<String, SegmentError> {
        let staged = self.stage(&metadata.table_name, &metadata.segment_name)?;
        for (name, store) in columns {
            staged.write_column(name, store)?;
        }
        staged.write_metadata(metadata)?;
        self.publish(staged)
    }

    /// Abre la versión visible en este momento y queda fijado a ella.
    pub fn open(&self, table: &str, segment: &str) -> Result<SegmentHandle, SegmentError> {
        check_name(table)?;
        check_name(segment)?;

        let version = self
            .current_version(table, segment)?
            .ok_or_else(|| SegmentError::NotFound {
                table: table.to_string(),
                segment: segment.to_string(),
            })?;
        let dir = self.segment_dir(table, segment).join(&version);

        let meta_path = dir.join(METADATA_FILE);
        let raw = ctx(fs::read(&meta_path), &meta_path)?;
        let metadata: SegmentMetadata =
            serde_json::from_slice(&raw).map_err(|source| SegmentError::Metadata {
                path: meta_path.clone(),
                source,
            })?;

        Ok(SegmentHandle {
            table: table.to_string(),
            segment: segment.to_string(),
            dir,
            version,
            metadata,
        })
    }

    /// Crea un directorio de staging invisible para los lectores, basado en
    /// la versión visible en este momento.
    pub fn stage(&self, table: &str, segment: &str) -> Result<StagedSegment, SegmentError> {
        check_name(table)?;
        check_name(segment)?;
        let base_version = self.current_version(table, segment)?;
        self.stage_with_base(table, segment, base_version)
    }

    /// Staging basado en la versión que ya tiene abierta `handle`.
    pub fn stage_over(&self, handle: &SegmentHandle) -> Result<StagedSegment, SegmentError> {
        self.stage_with_base(&handle.table, &handle.segment, Some(handle.version.clone()))
    }

    fn stage_with_base(
        &self,
        table: &str,
        segment: &str,
        base_version: Option<String>,
    ) -> Result<StagedSegment, SegmentError> {
        let dir = self
            .segment_dir(table, segment)
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        let columns = dir.join(COLUMNS_DIR);
        ctx(fs::create_dir_all(&columns), &columns)?;

        Ok(StagedSegment {
            table: table.to_string(),
            segment: segment.to_string(),
            dir,
            base_version,
            published: false,
        })
    }

    /// Publica el staging. Falla con `StaleBase` si la versión visible ya no
    /// es la que había cuando se creó el staging.
    pub fn publish(&self, mut staged: StagedSegment) -> Result<String, SegmentError> {
        let seg_dir = self.segment_dir(&staged.table, &staged.segment);
        sync_dir(&staged.dir.join(COLUMNS_DIR));
        sync_dir(&staged.dir);

        let _lock = PublishLock::acquire(&seg_dir)?;

        let visible = self.current_version(&staged.table, &staged.segment)?;
        if visible != staged.base_version {
            return Err(SegmentError::StaleBase {
                base: staged.base_version.clone().unwrap_or_default(),
                visible: visible.unwrap_or_default(),
            });
        }

        // un discard pudo borrarlo antes de que tomáramos el lock
        verify_staging(&staged.dir)?;

        let next = self.max_version_on_disk(&seg_dir)? + 1;
        let version = format!("v{}", next);
        let target = seg_dir.join(&version);
        ctx(fs::rename(&staged.dir, &target), &target)?;
        staged.published = true;

        let tmp = seg_dir.join(CURRENT_TMP_FILE);
        write_synced(&tmp, version.as_bytes())?;
        let current = seg_dir.join(CURRENT_FILE);
        ctx(fs::rename(&tmp, &current), &current)?;
        sync_dir(&seg_dir);

        info!(
            "segmento {}/{} publicado como {} (antes {:?})",
            staged.table, staged.segment, version, visible
        );

        self.reclaim_old_versions(&seg_dir, &version, visible.as_deref());
        Ok(version)
    }

    fn max_version_on_disk(&self, seg_dir: &Path) -> Result<u64, SegmentError> {
        let entries = match fs::read_dir(seg_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(SegmentError::Io {
                    path: seg_dir.to_path_buf(),
                    source: e,
                })
            }
        };
        Ok(entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(parse_version))
            .max()
            .unwrap_or(0))
    }

    /// Deja la versión actual y la anterior; borra el resto.
    fn reclaim_old_versions(&self, seg_dir: &Path, current: &str, previous: Option<&str>) {
        let Ok(entries) = fs::read_dir(seg_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_version(&name).is_none() || name == current || Some(name.as_str()) == previous
            {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!("versión vieja {} reclamada en {}", name, seg_dir.display()),
                Err(e) => warn!("no se pudo borrar {}: {}", entry.path().display(), e),
            }
        }
    }

    /// Borra stagings que dejaron intentos anteriores (crash o error) y que
    /// nadie toca hace al menos `older_than`. Corre con el lock de
    /// publicación tomado; si hay una publicación en curso no borra nada.
    pub fn discard_stale_staging(
        &self,
        table: &str,
        segment: &str,
        older_than: Duration,
    ) -> Result<usize, SegmentError> {
        let seg_dir = self.segment_dir(table, segment);
        if !seg_dir.is_dir() {
            return Ok(0);
        }

        let _lock = match PublishLock::acquire(&seg_dir) {
            Ok(lock) => lock,
            Err(SegmentError::PublishInProgress(_)) => {
                debug!("publicación en curso en {}/{}, no descarto stagings", table, segment);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let entries = ctx(fs::read_dir(&seg_dir), &seg_dir)?;
        let mut removed = 0;
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let path = entry.path();
            match staging_age(&path) {
                Some(age) if age >= older_than => match fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    // su dueño lo descartó al mismo tiempo
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SegmentError::Io { path, source: e }),
                },
                Some(age) => debug!("staging {} en uso (hace {:?}), se deja", path.display(), age),
                None => {}
            }
        }
        if removed > 0 {
            info!("{} staging(s) viejos descartados en {}/{}", removed, table, segment);
        }
        Ok(removed)
    }

    /// Metadata de todos los segmentos visibles bajo la raíz.
    pub fn scan(&self) -> Result<Vec<SegmentMetadata>, SegmentError> {
        let mut out = Vec::new();
        let tables = match fs::read_dir(&self.root) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(SegmentError::Io {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };

        for table in tables.flatten() {
            if !table.path().is_dir() {
                continue;
            }
            let table_name = table.file_name().to_string_lossy().to_string();
            let segments = ctx(fs::read_dir(table.path()), &table.path())?;
            for segment in segments.flatten() {
                let segment_name = segment.file_name().to_string_lossy().to_string();
                if !segment.path().join(CURRENT_FILE).is_file() {
                    continue;
                }
                match self.open(&table_name, &segment_name) {
                    Ok(handle) => out.push(handle.metadata),
                    Err(e) => warn!("ignorando segmento {}/{}: {}", table_name, segment_name, e),
                }
            }
        }

        out.sort_by(|a, b| {
            (&a.table_name, &a.segment_name).cmp(&(&b.table_name, &b.segment_name))
        });
        Ok(out)
    }
}

/// Vista de una versión concreta de un segmento.
#[derive(Debug)]
pub struct SegmentHandle {
    table: String,
    segment: String,
    dir: PathBuf,
    version: String,
    metadata: SegmentMetadata,
}

impl SegmentHandle {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    /// Ruta del archivo de la columna, sea .dict o .raw.
    pub fn column_path(&self, column: &str) -> Result<PathBuf, SegmentError> {
        check_name(column)?;
        let base = self.dir.join(COLUMNS_DIR);
        for ext in [DICT_EXTENSION, RAW_EXTENSION] {
            let path = base.join(format!("{}.{}", column, ext));
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(SegmentError::ColumnNotFound(column.to_string()))
    }

    pub fn read_column_bytes(&self, column: &str) -> Result<Vec<u8>, SegmentError> {
        let path = self.column_path(column)?;
        ctx(fs::read(&path), &path)
    }

    pub fn read_column(&self, column: &str) -> Result<ColumnStore, SegmentError> {
        let bytes = self.read_column_bytes(column)?;
        ColumnStore::from_bytes(&bytes).map_err(|source| SegmentError::Column {
            column: column.to_string(),
            source,
        })
    }

    /// Nombres de columnas con archivo en esta versión.
    pub fn stored_columns(&self) -> Result<Vec<String>, SegmentError> {
        let base = self.dir.join(COLUMNS_DIR);
        let mut names: Vec<String> = ctx(fs::read_dir(&base), &base)?
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.to_string())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Versión en construcción. Si se descarta sin publicar, se borra del disco.
#[derive(Debug)]
pub struct StagedSegment {
    table: String,
    segment: String,
    dir: PathBuf,
    base_version: Option<String>,
    published: bool,
}

impl StagedSegment {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_version(&self) -> Option<&str> {
        self.base_version.as_deref()
    }

    pub fn write_column(&self, column: &str, store: &ColumnStore) -> Result<(), SegmentError> {
        check_name(column)?;
        let bytes = store.to_bytes().map_err(|source| SegmentError::Column {
            column: column.to_string(),
            source,
        })?;
        let path = self
            .dir
            .join(COLUMNS_DIR)
            .join(format!("{}.{}", column, store.file_extension()));
        write_synced(&path, &bytes)
    }

    /// Copia byte a byte el archivo de la columna desde otra versión.
    pub fn copy_column_from(&self, source: &SegmentHandle, column: &str) -> Result<(), SegmentError> {
        let from = source.column_path(column)?;
        let file_name = from
            .file_name()
            .ok_or_else(|| SegmentError::ColumnNotFound(column.to_string()))?;
        let to = self.dir.join(COLUMNS_DIR).join(file_name);
        ctx(fs::copy(&from, &to), &to)?;
        let file = ctx(OpenOptions::new().write(true).open(&to), &to)?;
        ctx(file.sync_all(), &to)
    }

    pub fn write_metadata(&self, metadata: &SegmentMetadata) -> Result<(), SegmentError> {
        let path = self.dir.join(METADATA_FILE);
        let bytes =
            serde_json::to_vec_pretty(metadata).map_err(|source| SegmentError::Metadata {
                path: path.clone(),
                source,
            })?;
        write_synced(&path, &bytes)
    }
}

impl Drop for StagedSegment {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("no se pudo descartar staging {}: {}", self.dir.display(), e);
                }
            } else {
                debug!("staging descartado: {}", self.dir.display());
            }
        }
    }
}

/// Lock de archivo que sólo se toma alrededor del swap de `CURRENT`.
struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    fn acquire(seg_dir: &Path) -> Result<Self, SegmentError> {
        ctx(fs::create_dir_all(seg_dir), seg_dir)?;
        let path = seg_dir.join(PUBLISH_LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let age = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| SystemTime::now().duration_since(t).ok());
                    match age {
                        Some(age) if age > STALE_PUBLISH_LOCK => {
                            warn!("lock de publicación abandonado en {}, lo tomo", path.display());
                            let _ = fs::remove_file(&path);
                        }
                        _ => return Err(SegmentError::PublishInProgress(seg_dir.to_path_buf())),
                    }
                }
                Err(e) => return Err(SegmentError::Io { path, source: e }),
            }
        }
        Err(SegmentError::PublishInProgress(seg_dir.to_path_buf()))
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
