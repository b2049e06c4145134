//! Backing store for assembled channel time series.
//!
//! The ingest pipeline only sees the [`SampleStore`] / [`SampleArray`] traits:
//! a store is a tree of named groups holding extensible 1-D arrays of signed
//! 16-bit samples, every node carrying string-keyed attributes. Nodes are
//! addressed by `/`-separated paths relative to the session root (`""`).
//!
//! Two implementations ship with the crate:
//! * [`FileStore`]: a directory per session, a sub-directory per group, a
//!   raw little-endian `.i16` file plus a `.json` attribute sidecar per array.
//! * [`MemoryStore`]: shared in-process maps; clones see the same data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;

const SAMPLE_BYTES: u64 = 2;
const DATA_EXT: &str = "i16";
const ATTR_EXT: &str = "json";
const GROUP_ATTR_FILE: &str = "attributes.json";

/// Attribute value attached to a group or array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    FloatList(Vec<f64>),
    TextList(Vec<String>),
}

macro_rules! attr_from {
    ($variant:ident, $target:ty: $($t:ty),+) => {
        $(impl From<$t> for AttrValue {
            fn from(v: $t) -> Self {
                AttrValue::$variant(v as $target)
            }
        })+
    };
}

attr_from!(Unsigned, u64: u8, u16, u32, u64);
attr_from!(Signed, i64: i32, i64);
attr_from!(Float, f64: f64);

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// Container of groups and arrays for one ingestion session.
pub trait SampleStore: Send {
    /// Create an empty group. The parent group must already exist.
    fn create_group(&mut self, path: &str) -> Result<(), StoreError>;

    /// Create an empty (length 0) sample array. The parent group must exist.
    fn create_array(&mut self, path: &str) -> Result<Box<dyn SampleArray>, StoreError>;

    /// Set an attribute on a group; `""` is the session root.
    fn set_attribute(&mut self, path: &str, key: &str, value: AttrValue)
        -> Result<(), StoreError>;
}

/// One extensible array of signed 16-bit samples.
pub trait SampleArray: Send {
    fn path(&self) -> &str;

    /// Current logical length in samples.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the array to `new_len` samples. Never shrinks; a smaller
    /// `new_len` is a no-op. The new region reads as zero.
    fn extend(&mut self, new_len: u64) -> Result<(), StoreError>;

    /// Write `samples` starting at `offset`; the range must lie inside
    /// the current length.
    fn write(&mut self, offset: u64, samples: &[i16]) -> Result<(), StoreError>;

    fn set_attribute(&mut self, key: &str, value: AttrValue) -> Result<(), StoreError>;

    /// Persist buffered attributes.
    fn flush(&mut self) -> Result<(), StoreError>;
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

fn out_of_bounds(path: &str, offset: u64, count: usize, len: u64) -> Result<(), StoreError> {
    if offset.checked_add(count as u64).map_or(true, |end| end > len) {
        return Err(StoreError::OutOfBounds {
            name: path.to_string(),
            offset,
            count,
            len,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Directory-backed store.
pub struct FileStore {
    root: PathBuf,
    group_attrs: BTreeMap<String, BTreeMap<String, AttrValue>>,
}

impl FileStore {
    /// Create a new store rooted at `root`. Fails if `root` already exists.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if root.exists() {
            return Err(StoreError::AlreadyExists(root.display().to_string()));
        }
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        let mut group_attrs = BTreeMap::new();
        group_attrs.insert(String::new(), BTreeMap::new());
        Ok(Self { root, group_attrs })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn require_parent(&self, path: &str) -> Result<(), StoreError> {
        let (parent, _) = split_parent(path);
        if self.group_attrs.contains_key(parent) {
            Ok(())
        } else {
            Err(StoreError::MissingParent(parent.to_string()))
        }
    }
}

impl SampleStore for FileStore {
    fn create_group(&mut self, path: &str) -> Result<(), StoreError> {
        if self.group_attrs.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        self.require_parent(path)?;
        let dir = self.group_dir(path);
        fs::create_dir(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        self.group_attrs.insert(path.to_string(), BTreeMap::new());
        Ok(())
    }

    fn create_array(&mut self, path: &str) -> Result<Box<dyn SampleArray>, StoreError> {
        self.require_parent(path)?;
        let data_path = self.root.join(format!("{path}.{DATA_EXT}"));
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.to_string()),
                _ => StoreError::Io { path: data_path.clone(), source },
            })?;
        let attr_path = self.root.join(format!("{path}.{ATTR_EXT}"));
        Ok(Box::new(FileArray {
            path: path.to_string(),
            file,
            data_path,
            attr_path,
            len: 0,
            attrs: BTreeMap::new(),
            dirty: true,
        }))
    }

    fn set_attribute(
        &mut self,
        path: &str,
        key: &str,
        value: AttrValue,
    ) -> Result<(), StoreError> {
        let dir = self.group_dir(path);
        let attrs = self
            .group_attrs
            .get_mut(path)
            .ok_or_else(|| StoreError::MissingParent(path.to_string()))?;
        attrs.insert(key.to_string(), value);
        write_attributes(&dir.join(GROUP_ATTR_FILE), attrs)
    }
}

fn write_attributes(
    path: &Path,
    attrs: &BTreeMap<String, AttrValue>,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(attrs).map_err(|source| StoreError::Attributes {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| StoreError::Io { path: path.to_path_buf(), source })
}

/// Array stored as `<name>.i16` with a `<name>.json` attribute sidecar.
/// Attributes are buffered and written on [`SampleArray::flush`] and drop.
struct FileArray {
    path: String,
    file: File,
    data_path: PathBuf,
    attr_path: PathBuf,
    len: u64,
    attrs: BTreeMap<String, AttrValue>,
    dirty: bool,
}

impl FileArray {
    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io { path: self.data_path.clone(), source }
    }
}

impl SampleArray for FileArray {
    fn path(&self) -> &str {
        &self.path
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn extend(&mut self, new_len: u64) -> Result<(), StoreError> {
        if new_len <= self.len {
            return Ok(());
        }
        let bytes = new_len
            .checked_mul(SAMPLE_BYTES)
            .ok_or_else(|| StoreError::Exhausted {
                name: self.path.clone(),
                requested: new_len,
                limit: u64::MAX / SAMPLE_BYTES,
            })?;
        self.file.set_len(bytes).map_err(|e| self.io_err(e))?;
        self.len = new_len;
        Ok(())
    }

    fn write(&mut self, offset: u64, samples: &[i16]) -> Result<(), StoreError> {
        out_of_bounds(&self.path, offset, samples.len(), self.len)?;
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.file
            .seek(SeekFrom::Start(offset * SAMPLE_BYTES))
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(&bytes).map_err(|e| self.io_err(e))
    }

    fn set_attribute(&mut self, key: &str, value: AttrValue) -> Result<(), StoreError> {
        self.attrs.insert(key.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.file.flush().map_err(|e| self.io_err(e))?;
        if self.dirty {
            write_attributes(&self.attr_path, &self.attrs)?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for FileArray {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(array = %self.path, err = %e, "failed to flush array on close");
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryArrayData {
    samples: Vec<i16>,
    attrs: BTreeMap<String, AttrValue>,
}

struct MemoryInner {
    groups: BTreeMap<String, BTreeMap<String, AttrValue>>,
    arrays: BTreeMap<String, MemoryArrayData>,
    max_len: Option<u64>,
    reject_writes: bool,
}

/// In-process store. Cloning yields another handle onto the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(inner: &Mutex<MemoryInner>) -> MutexGuard<'_, MemoryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(String::new(), BTreeMap::new());
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                groups,
                arrays: BTreeMap::new(),
                max_len: None,
                reject_writes: false,
            })),
        }
    }

    /// Refuse to extend any array past `max_len` samples.
    pub fn with_max_len(self, max_len: u64) -> Self {
        lock(&self.inner).max_len = Some(max_len);
        self
    }

    /// Make every subsequent array write fail (or succeed again).
    pub fn set_reject_writes(&self, reject: bool) {
        lock(&self.inner).reject_writes = reject;
    }

    pub fn samples(&self, path: &str) -> Option<Vec<i16>> {
        lock(&self.inner).arrays.get(path).map(|a| a.samples.clone())
    }

    pub fn array_len(&self, path: &str) -> Option<u64> {
        lock(&self.inner).arrays.get(path).map(|a| a.samples.len() as u64)
    }

    pub fn array_paths(&self) -> Vec<String> {
        lock(&self.inner).arrays.keys().cloned().collect()
    }

    pub fn has_group(&self, path: &str) -> bool {
        lock(&self.inner).groups.contains_key(path)
    }

    /// Attribute of an array or group at `path`.
    pub fn attribute(&self, path: &str, key: &str) -> Option<AttrValue> {
        let inner = lock(&self.inner);
        inner
            .arrays
            .get(path)
            .map(|a| &a.attrs)
            .or_else(|| inner.groups.get(path))
            .and_then(|attrs| attrs.get(key).cloned())
    }
}

impl SampleStore for MemoryStore {
    fn create_group(&mut self, path: &str) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if inner.groups.contains_key(path) || inner.arrays.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        let (parent, _) = split_parent(path);
        if !inner.groups.contains_key(parent) {
            return Err(StoreError::MissingParent(parent.to_string()));
        }
        inner.groups.insert(path.to_string(), BTreeMap::new());
        Ok(())
    }

    fn create_array(&mut self, path: &str) -> Result<Box<dyn SampleArray>, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.groups.contains_key(path) || inner.arrays.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        let (parent, _) = split_parent(path);
        if !inner.groups.contains_key(parent) {
            return Err(StoreError::MissingParent(parent.to_string()));
        }
        inner.arrays.insert(path.to_string(), MemoryArrayData::default());
        Ok(Box::new(MemoryArray {
            path: path.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn set_attribute(
        &mut self,
        path: &str,
        key: &str,
        value: AttrValue,
    ) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        let attrs = inner
            .groups
            .get_mut(path)
            .ok_or_else(|| StoreError::MissingParent(path.to_string()))?;
        attrs.insert(key.to_string(), value);
        Ok(())
    }
}

struct MemoryArray {
    path: String,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryArray {
    fn with_data<R>(
        &self,
        f: impl FnOnce(&mut MemoryArrayData, Option<u64>, bool) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut inner = lock(&self.inner);
        let (max_len, reject) = (inner.max_len, inner.reject_writes);
        match inner.arrays.get_mut(&self.path) {
            Some(data) => f(data, max_len, reject),
            None => Err(StoreError::MissingParent(self.path.clone())),
        }
    }
}

impl SampleArray for MemoryArray {
    fn path(&self) -> &str {
        &self.path
    }

    fn len(&self) -> u64 {
        lock(&self.inner)
            .arrays
            .get(&self.path)
            .map_or(0, |a| a.samples.len() as u64)
    }

    fn extend(&mut self, new_len: u64) -> Result<(), StoreError> {
        let name = self.path.clone();
        self.with_data(|data, max_len, _| {
            if new_len <= data.samples.len() as u64 {
                return Ok(());
            }
            if let Some(limit) = max_len.filter(|&limit| new_len > limit) {
                return Err(StoreError::Exhausted { name, requested: new_len, limit });
            }
            let have = data.samples.len();
            let exhausted = |limit: u64| StoreError::Exhausted {
                name: name.clone(),
                requested: new_len,
                limit,
            };
            let target = usize::try_from(new_len).map_err(|_| exhausted(usize::MAX as u64))?;
            data.samples.try_reserve_exact(target - have).map_err(|_| exhausted(have as u64))?;
            data.samples.resize(target, 0);
            Ok(())
        })
    }

    fn write(&mut self, offset: u64, samples: &[i16]) -> Result<(), StoreError> {
        let name = self.path.clone();
        self.with_data(|data, _, reject| {
            if reject {
                return Err(StoreError::WriteRejected(name));
            }
            out_of_bounds(&name, offset, samples.len(), data.samples.len() as u64)?;
            let start = offset as usize;
            data.samples[start..start + samples.len()].copy_from_slice(samples);
            Ok(())
        })
    }

    fn set_attribute(&mut self, key: &str, value: AttrValue) -> Result<(), StoreError> {
        self.with_data(|data, _, _| {
            data.attrs.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
