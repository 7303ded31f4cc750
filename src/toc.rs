//! Table-of-contents fetch with cache coalescing: parameters and log
//! variables are both enumerated the same way, so this module is generic
//! over the decoded item type.
//!
//! The cache is deliberately trait-based rather than an inheritance
//! hierarchy, with coalescing layered on top as a decorator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::error::{Error, Result};

/// The wire type of a single parameter or log variable.
///
/// Codes mirror the parameter service's type byte (nibble-width, so they
/// pack alongside a read-only flag in the high bits of a TOC descriptor, and
/// alongside a second type nibble in a log block's `CREATE_BLOCK_V2` entry
/// encoding).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VariableType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl VariableType {
    /// The number of bytes one value of this type occupies on the wire.
    pub fn byte_len(&self) -> usize {
        match self {
            VariableType::Int8 | VariableType::Uint8 => 1,
            VariableType::Int16 | VariableType::Uint16 | VariableType::Float16 => 2,
            VariableType::Int32 | VariableType::Uint32 | VariableType::Float32 => 4,
            VariableType::Int64 | VariableType::Uint64 | VariableType::Float64 => 8,
        }
    }

    /// The 4-bit wire code for this type.
    pub fn code(&self) -> u8 {
        match self {
            VariableType::Int8 => 0x00,
            VariableType::Int16 => 0x01,
            VariableType::Int32 => 0x02,
            VariableType::Int64 => 0x03,
            VariableType::Float16 => 0x05,
            VariableType::Float32 => 0x06,
            VariableType::Float64 => 0x07,
            VariableType::Uint8 => 0x08,
            VariableType::Uint16 => 0x09,
            VariableType::Uint32 => 0x0A,
            VariableType::Uint64 => 0x0B,
        }
    }

    /// Parses a 4-bit wire code, rejecting the one gap (`0x04`) and anything
    /// outside the nibble range.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => VariableType::Int8,
            0x01 => VariableType::Int16,
            0x02 => VariableType::Int32,
            0x03 => VariableType::Int64,
            0x05 => VariableType::Float16,
            0x06 => VariableType::Float32,
            0x07 => VariableType::Float64,
            0x08 => VariableType::Uint8,
            0x09 => VariableType::Uint16,
            0x0A => VariableType::Uint32,
            0x0B => VariableType::Uint64,
            other => {
                return Err(Error::InvalidResponse(format!(
                    "{:#x} is not a known variable type code",
                    other
                )))
            }
        })
    }

    /// Decodes one value of this type from `reader`.
    pub fn decode_value(&self, reader: &mut ByteReader<'_>) -> Result<Value> {
        Ok(match self {
            VariableType::Int8 => Value::Int8(reader.read_i8()?),
            VariableType::Int16 => Value::Int16(reader.read_i16_le()?),
            VariableType::Int32 => Value::Int32(reader.read_i32_le()?),
            VariableType::Int64 => Value::Int64(reader.read_i64_le()?),
            VariableType::Float16 => Value::Float32(reader.read_f16_le()?),
            VariableType::Float32 => Value::Float32(reader.read_f32_le()?),
            VariableType::Float64 => Value::Float64(reader.read_f64_le()?),
            VariableType::Uint8 => Value::Uint8(reader.read_u8()?),
            VariableType::Uint16 => Value::Uint16(reader.read_u16_le()?),
            VariableType::Uint32 => Value::Uint32(reader.read_u32_le()?),
            VariableType::Uint64 => Value::Uint64(reader.read_u64_le()?),
        })
    }
}

/// A single decoded parameter or log-variable value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
}

/// A single parameter or log-variable descriptor: firmware
/// ID, wire type, dotted `group.name`, and whether the firmware marked it
/// read-only. Log variables never set the read-only bit, so it's always
/// `false` for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocItem {
    pub id: u16,
    pub var_type: VariableType,
    pub group: String,
    pub name: String,
    pub read_only: bool,
}

impl TocItem {
    /// The fully-qualified `group.name` used to address this item by name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

impl ToBytes for TocItem {
    /// Encodes as `<type|read_only><group>\0<name>\0`, matching the
    /// firmware's own TOC descriptor layout so cache files round-trip
    /// exactly what a fresh fetch would have produced.
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        let flag = if self.read_only { 0x40 } else { 0x00 };
        writer.write_u8(self.var_type.code() | flag);
        writer.write_bytes(self.group.as_bytes());
        writer.write_u8(0);
        writer.write_bytes(self.name.as_bytes());
        writer.write_u8(0);
        Ok(())
    }
}

impl FromBytes for TocItem {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self> {
        // `id` is assigned by the caller (it's the fetch index, not part of
        // the wire payload); this low-level decode always produces id 0 and
        // the caller that owns the index patches it in, mirroring
        // `VariableSpecification.from_bytes(data, id=index)` upstream.
        let header = reader.read_u8()?;
        let var_type = VariableType::from_code(header & 0x0F)?;
        let read_only = header & 0x40 != 0;
        let rest = reader.read_rest();
        let mut parts = rest.splitn(3, |&b| b == 0);
        let group = parts
            .next()
            .ok_or_else(|| Error::InvalidResponse("missing toc group".into()))?;
        let name = parts
            .next()
            .ok_or_else(|| Error::InvalidResponse("missing toc name".into()))?;
        Ok(TocItem {
            id: 0,
            var_type,
            group: String::from_utf8_lossy(group).into_owned(),
            name: String::from_utf8_lossy(name).into_owned(),
            read_only,
        })
    }
}

/// Whether a cache lookup found the entry.
pub enum Lookup<T> {
    Found(T),
    Missing,
}

/// A keyed store of encoded TOC entries, namespaced so parameters and log
/// variables (or different device families) don't collide.
pub trait Cache: Send + Sync {
    fn find(
        &self,
        namespace: &str,
        hash: u32,
    ) -> impl std::future::Future<Output = Result<Lookup<Vec<Vec<u8>>>>> + Send;
    fn has(&self, namespace: &str, hash: u32) -> impl std::future::Future<Output = Result<bool>> + Send;
    fn store(
        &self,
        namespace: &str,
        hash: u32,
        items: Vec<Vec<u8>>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Decorates an inner [`Cache`] with a fixed namespace prefix, composing by
/// delegation instead of inheritance.
pub struct NamespacedCache<C> {
    inner: C,
    prefix: String,
}

impl<C: Cache> NamespacedCache<C> {
    pub fn new(inner: C, prefix: impl Into<String>) -> Self {
        NamespacedCache {
            inner,
            prefix: prefix.into(),
        }
    }

    fn namespaced(&self, namespace: &str) -> String {
        format!("{}/{}", self.prefix, namespace)
    }
}

impl<C: Cache> Cache for NamespacedCache<C> {
    async fn find(&self, namespace: &str, hash: u32) -> Result<Lookup<Vec<Vec<u8>>>> {
        self.inner.find(&self.namespaced(namespace), hash).await
    }

    async fn has(&self, namespace: &str, hash: u32) -> Result<bool> {
        self.inner.has(&self.namespaced(namespace), hash).await
    }

    async fn store(&self, namespace: &str, hash: u32, items: Vec<Vec<u8>>) -> Result<()> {
        self.inner.store(&self.namespaced(namespace), hash, items).await
    }
}

/// An in-memory [`Cache`], used in tests and as a process-lifetime cache
/// when no filesystem persistence is wanted.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, u32), Vec<Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    async fn find(&self, namespace: &str, hash: u32) -> Result<Lookup<Vec<Vec<u8>>>> {
        let key = (namespace.to_string(), hash);
        match self.entries.lock().await.get(&key) {
            Some(items) => Ok(Lookup::Found(items.clone())),
            None => Ok(Lookup::Missing),
        }
    }

    async fn has(&self, namespace: &str, hash: u32) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .await
            .contains_key(&(namespace.to_string(), hash)))
    }

    async fn store(&self, namespace: &str, hash: u32, items: Vec<Vec<u8>>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert((namespace.to_string(), hash), items);
        Ok(())
    }
}

/// File format version byte for the filesystem cache.
const CACHE_FILE_VERSION: u8 = 0x01;

/// A [`Cache`] backed by one file per `(namespace, hash)` pair under a root
/// directory, each file holding a version byte followed by
/// `<length:u16-LE><payload>` records.
pub struct FilesystemCache {
    root: PathBuf,
}

impl FilesystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemCache { root: root.into() }
    }

    fn path_for(&self, namespace: &str, hash: u32) -> PathBuf {
        self.root.join(format!("{}-{:08x}.toc", namespace, hash))
    }

    fn encode_file(items: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = vec![CACHE_FILE_VERSION];
        for item in items {
            let mut w = ByteWriter::new(&mut buf);
            w.write_u16_le(item.len() as u16);
            buf.extend_from_slice(item);
        }
        buf
    }

    fn decode_file(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut r = ByteReader::new(bytes);
        let version = r.read_u8()?;
        if version != CACHE_FILE_VERSION {
            return Err(Error::InvalidResponse(format!(
                "unsupported toc cache file version {}",
                version
            )));
        }
        let mut items = Vec::new();
        while !r.is_empty() {
            let len = r.read_u16_le()? as usize;
            items.push(r.read_bytes(len)?.to_vec());
        }
        Ok(items)
    }
}

impl Cache for FilesystemCache {
    async fn find(&self, namespace: &str, hash: u32) -> Result<Lookup<Vec<Vec<u8>>>> {
        let path = self.path_for(namespace, hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Lookup::Found(Self::decode_file(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Lookup::Missing),
            Err(e) => Err(Error::InvalidResponse(format!("toc cache read failed: {}", e))),
        }
    }

    async fn has(&self, namespace: &str, hash: u32) -> Result<bool> {
        Ok(tokio::fs::metadata(self.path_for(namespace, hash))
            .await
            .is_ok())
    }

    async fn store(&self, namespace: &str, hash: u32, items: Vec<Vec<u8>>) -> Result<()> {
        if let Some(parent) = self.path_for(namespace, hash).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(self.path_for(namespace, hash), Self::encode_file(&items))
            .await
            .map_err(|e| Error::InvalidResponse(format!("toc cache write failed: {}", e)))
    }
}

/// A per-cache, per-hash lock so concurrent connections to identical
/// firmware coalesce into a single fetch.
#[derive(Default)]
pub struct FetchLocks {
    locks: Mutex<HashMap<(String, u32), Arc<Mutex<()>>>>,
}

impl FetchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, namespace: &str, hash: u32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry((namespace.to_string(), hash))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Fetches and decodes a TOC, consulting `cache` first and coalescing
/// concurrent fetches for the same `(namespace, hash)` via `locks`.
///
/// `query_count_and_hash` and `fetch_item` are the two callbacks into the
/// device's actual request/response machinery (typically built on
/// [`crate::crtp::device::Device::run_command`]); this function only
/// implements the caching and coalescing policy around them.
pub async fn fetch<T, C, F, FutCount, G, FutItem>(
    namespace: &str,
    cache: &C,
    locks: &FetchLocks,
    query_count_and_hash: F,
    fetch_item: G,
) -> Result<Vec<T>>
where
    T: FromBytes + ToBytes,
    C: Cache,
    F: FnOnce() -> FutCount,
    FutCount: std::future::Future<Output = Result<(u16, u32)>>,
    G: Fn(u16) -> FutItem,
    FutItem: std::future::Future<Output = Result<T>>,
{
    let (item_count, hash) = query_count_and_hash().await?;

    let lock = locks.lock_for(namespace, hash).await;
    let _guard = lock.lock().await;

    if let Lookup::Found(encoded) = cache.find(namespace, hash).await? {
        return encoded
            .iter()
            .map(|bytes| T::from_bytes(&mut ByteReader::new(bytes)))
            .collect();
    }

    let mut items = Vec::with_capacity(item_count as usize);
    let mut encoded = Vec::with_capacity(item_count as usize);
    for id in 0..item_count {
        let item = fetch_item(id).await?;
        let mut bytes = Vec::new();
        item.to_bytes(&mut ByteWriter::new(&mut bytes))?;
        encoded.push(bytes);
        items.push(item);
    }
    cache.store(namespace, hash, encoded).await?;
    Ok(items)
}
