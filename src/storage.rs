//! A read-only zarrs store serving the keys of a reference set.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use zarrs::storage::{
    ListableStorageTraits, MaybeBytes, MaybeBytesIterator, ReadableStorageTraits, StorageError,
    StoreKey, StoreKeys, StoreKeysPrefixes, StorePrefix,
    byte_range::{ByteRange, ByteRangeIterator},
};

use crate::reference::{ChunkRef, ReferenceSet, chunk_key, parse_chunk_key};
use crate::store::{consolidate, read_store};

/// A read-only zarr V2 hierarchy backed by a reference store.
///
/// Metadata is served from the consolidated `.zmetadata` document;
/// chunks are served inline or read from the referenced local files.
pub struct ReferenceStore {
    refs: ReferenceSet,
    /// Metadata documents by store key.
    metadata: BTreeMap<String, Bytes>,
}

impl ReferenceStore {
    /// Load the reference store at `path`.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let refs = read_store(path)?;
        Self::new(refs)
    }

    pub fn new(refs: ReferenceSet) -> crate::Result<Self> {
        let meta = consolidate(&refs, 1)?;
        let metadata = meta
            .metadata
            .into_iter()
            .map(|(k, v)| Ok((k, Bytes::from_owner(serde_json::to_vec(&v)?))))
            .collect::<crate::Result<_>>()?;
        Ok(Self { refs, metadata })
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.refs
    }

    /// Find the chunk reference for a chunk key, e.g. `temperature/0.1.2`.
    ///
    /// Returns None if the key is not a chunk key of any array.
    fn lookup_chunk(&self, key: &StoreKey) -> Option<&ChunkRef> {
        let (array_path, chunk) = key.as_str().rsplit_once('/')?;
        let arr = self.refs.arrays.get(array_path)?;
        let separator = arr.metadata.dimension_separator.as_str();
        let indices = parse_chunk_key(chunk, separator, arr.metadata.shape.len())?;
        let grid = arr.metadata.chunk_grid_shape();
        let idx = crate::reference::ravel(&indices, &grid)?;
        arr.chunks.get(idx as usize)
    }

    fn read_chunk(chunk: &ChunkRef) -> Result<MaybeBytes, StorageError> {
        match chunk {
            ChunkRef::Missing => Ok(None),
            ChunkRef::Inline(b) => Ok(Some(b.clone())),
            ChunkRef::Remote { path, offset, size } => {
                let read = || -> std::io::Result<Vec<u8>> {
                    let mut f = File::open(path)?;
                    f.seek(SeekFrom::Start(*offset))?;
                    let mut buf = vec![0u8; *size as usize];
                    f.read_exact(&mut buf)?;
                    Ok(buf)
                };
                let buf = read().map_err(|e| {
                    StorageError::Other(format!(
                        "could not read {size} bytes at {offset} of {path}: {e}"
                    ))
                })?;
                Ok(Some(Bytes::from_owner(buf)))
            }
        }
    }

    /// Every key in the store, sorted.
    fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.metadata.keys().cloned().collect();
        for (array_path, arr) in &self.refs.arrays {
            let separator = arr.metadata.dimension_separator.as_str();
            keys.extend(
                arr.present_chunks()
                    .map(|(idx, _)| format!("{array_path}/{}", chunk_key(&idx, separator))),
            );
        }
        keys.sort();
        keys
    }
}

fn to_store_keys(keys: impl IntoIterator<Item = String>) -> Result<StoreKeys, StorageError> {
    keys.into_iter()
        .map(|k| StoreKey::new(k).map_err(|e| StorageError::Other(e.to_string())))
        .collect()
}

impl ReadableStorageTraits for ReferenceStore {
    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        if let Some(b) = self.metadata.get(key.as_str()) {
            return Ok(Some(b.len() as u64));
        }
        Ok(self.lookup_chunk(key).and_then(ChunkRef::size))
    }

    fn supports_get_partial(&self) -> bool {
        false
    }

    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        if let Some(b) = self.metadata.get(key.as_str()) {
            return Ok(Some(b.clone()));
        }
        match self.lookup_chunk(key) {
            Some(chunk) => Self::read_chunk(chunk),
            None => Ok(None),
        }
    }

    fn get_partial_many<'a>(
        &'a self,
        _key: &StoreKey,
        _byte_ranges: ByteRangeIterator<'a>,
    ) -> Result<MaybeBytesIterator<'a>, StorageError> {
        Err(StorageError::Unsupported(
            "get_partial_many not supported".into(),
        ))
    }

    fn get_partial(
        &self,
        _key: &StoreKey,
        _byte_range: ByteRange,
    ) -> Result<MaybeBytes, StorageError> {
        Err(StorageError::Unsupported(
            "get_partial not supported".into(),
        ))
    }
}

impl ListableStorageTraits for ReferenceStore {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        to_store_keys(self.all_keys())
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        let p = prefix.as_str();
        to_store_keys(self.all_keys().into_iter().filter(|k| k.starts_with(p)))
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        let p = prefix.as_str();
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        for k in self.all_keys() {
            let Some(rest) = k.strip_prefix(p) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    let child = format!("{p}{child}/");
                    if prefixes.last() != Some(&child) {
                        prefixes.push(child);
                    }
                }
                None => keys.push(k),
            }
        }
        prefixes.dedup();
        let prefixes = prefixes
            .into_iter()
            .map(|s| StorePrefix::new(s).map_err(|e| StorageError::Other(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreKeysPrefixes::new(to_store_keys(keys)?, prefixes))
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        let mut total = 0;
        for key in self.list_prefix(prefix)? {
            total += self.size_key(&key)?.unwrap_or(0);
        }
        Ok(total)
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.size_prefix(&StorePrefix::root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ArrayMetadataV2, Attributes};
    use crate::reference::ArrayRefs;

    fn store_with_file(dir: &Path) -> ReferenceStore {
        let data_path = dir.join("data.bin");
        std::fs::write(&data_path, b"headerABCDEFGH").unwrap();
        let mut refs = ReferenceSet::new();
        let mut arr = ArrayRefs::new(
            ArrayMetadataV2::new(vec![16], vec![8], "|u1"),
            Attributes::new(),
        );
        arr.chunks[0] = ChunkRef::Remote {
            path: data_path.to_string_lossy().into_owned(),
            offset: 6,
            size: 8,
        };
        refs.arrays.insert("bytes".into(), arr);
        ReferenceStore::new(refs).unwrap()
    }

    #[test]
    fn serves_metadata_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_file(dir.path());

        let zarray = store
            .get(&StoreKey::new("bytes/.zarray").unwrap())
            .unwrap()
            .unwrap();
        let meta: ArrayMetadataV2 = serde_json::from_slice(&zarray).unwrap();
        assert_eq!(meta.shape, vec![16]);

        let chunk = store.get(&StoreKey::new("bytes/0").unwrap()).unwrap();
        assert_eq!(chunk.as_deref(), Some(b"ABCDEFGH".as_slice()));
        assert_eq!(
            store.size_key(&StoreKey::new("bytes/0").unwrap()).unwrap(),
            Some(8)
        );
        // missing chunk and out-of-grid chunk
        assert!(store.get(&StoreKey::new("bytes/1").unwrap()).unwrap().is_none());
        assert!(store.get(&StoreKey::new("bytes/2").unwrap()).unwrap().is_none());
    }

    #[test]
    fn lists_keys_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_file(dir.path());
        let keys: Vec<String> = store
            .list()
            .unwrap()
            .iter()
            .map(|k| k.as_str().to_owned())
            .collect();
        assert_eq!(
            keys,
            vec![".zattrs", ".zgroup", "bytes/.zarray", "bytes/.zattrs", "bytes/0"]
        );
        let listing = store.list_dir(&StorePrefix::root()).unwrap();
        assert_eq!(listing.keys().len(), 2);
        assert_eq!(listing.prefixes().len(), 1);
    }
}
