//! Resolved view of one key.

use bytes::Bytes;

use crate::extract::{FileLookup, KeyLookup};
use crate::metadata::Metadata;
use crate::storage::{StorageError, StorageResult, Version};

/// What a branch holds for one key: a normal key with data and metadata, or
/// a directory's master metadata. Absence is `None` one level up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub data: Option<Bytes>,
    pub metadata: Metadata,
    pub metadata_raw: Bytes,
    pub data_version: Option<Version>,
    pub metadata_version: Version,
    /// where the metadata in effect was found
    pub metadata_path: String,
}

impl StoreInfo {
    pub fn is_normal_key(&self) -> bool {
        self.data.is_some() && self.data_version.is_some()
    }

    pub fn is_master_metadata(&self) -> bool {
        !self.is_normal_key()
    }

    /// Classify an extractor result.
    ///
    /// Damage in the tree is an error. A plain key without data, or with no
    /// metadata at all, resolves to `None`.
    pub fn from_lookup(lookup: KeyLookup) -> StorageResult<Option<Self>> {
        let (metadata_path, metadata_id, metadata_raw) = match lookup.metadata {
            FileLookup::Present { path, id, content } => (path, id, content),
            FileLookup::Missing => return Ok(None),
            FileLookup::Unreadable { path, error } => {
                return Err(StorageError::CorruptedData {
                    path: path.into(),
                    reason: error,
                })
            }
        };

        let metadata = Metadata::parse(&metadata_raw).map_err(|e| StorageError::CorruptedData {
            path: metadata_path.clone().into(),
            reason: e.to_string(),
        })?;

        let (data, data_version) = match lookup.data {
            FileLookup::Present { id, content, .. } => (Some(content), Some(Version::from(id))),
            FileLookup::Missing if lookup.key.is_directory() => (None, None),
            FileLookup::Missing => return Ok(None),
            FileLookup::Unreadable { path, error } => {
                return Err(StorageError::CorruptedData {
                    path: path.into(),
                    reason: error,
                })
            }
        };

        Ok(Some(Self {
            data,
            metadata,
            metadata_raw,
            data_version,
            metadata_version: Version::from(metadata_id),
            metadata_path,
        }))
    }

    /// the version a writer has to present to change this entry
    pub fn version(&self) -> &Version {
        self.data_version.as_ref().unwrap_or(&self.metadata_version)
    }
}
