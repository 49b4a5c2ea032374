//! File-system directory.
//!
//! Layout:
//!
//! ```text
//! <root>/version.<id>          JSON version
//! <root>/segment_<id>.seg      JSON segment body + u32 LE crc32 footer
//! ```
//!
//! Files are written to a temporary file in the same directory and renamed
//! into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{IrisError, Result};
use crate::index::directory::Directory;
use crate::index::document::StoredDoc;
use crate::index::segment::{BuiltSegment, SegmentId, SegmentInfo};
use crate::index::version::{Version, VersionId};

const VERSION_PREFIX: &str = "version.";
const FOOTER_LEN: usize = 4;

#[derive(Serialize, Deserialize)]
struct SegmentFile {
    info: SegmentInfo,
    docs: Vec<StoredDoc>,
}

#[derive(Debug, Clone)]
pub struct FileDirectory {
    root: PathBuf,
}

impl FileDirectory {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_path(&self, id: VersionId) -> PathBuf {
        self.root.join(format!("{VERSION_PREFIX}{id}"))
    }

    pub fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.root.join(format!("segment_{:06}.seg", id.local()))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| IrisError::Io(e.error))?;
        Ok(())
    }
}

impl Directory for FileDirectory {
    fn list_versions(&self) -> Result<Vec<VersionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(VERSION_PREFIX)) else {
                continue;
            };
            if let Ok(id) = suffix.parse::<i64>() {
                ids.push(VersionId(id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_version(&self, id: VersionId) -> Result<Version> {
        let path = self.version_path(id);
        if !path.exists() {
            return Err(IrisError::not_found(format!("version {id}")));
        }
        let json = fs::read_to_string(&path)?;
        Version::from_json(&json)
    }

    fn load_segment(&self, id: SegmentId) -> Result<BuiltSegment> {
        let path = self.segment_path(id);
        if !path.exists() {
            return Err(IrisError::not_found(format!("segment {id}")));
        }
        let bytes = fs::read(&path)?;
        if bytes.len() < FOOTER_LEN {
            return Err(IrisError::corruption(format!(
                "segment file {} is truncated",
                path.display()
            )));
        }
        let (body, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);
        let expected = LittleEndian::read_u32(footer);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(IrisError::corruption(format!(
                "checksum mismatch in {}: expected {expected:08x}, found {actual:08x}",
                path.display()
            )));
        }
        let file: SegmentFile = serde_json::from_slice(body)?;
        if file.info.segment_id != id {
            return Err(IrisError::corruption(format!(
                "segment file {} holds segment {}",
                path.display(),
                file.info.segment_id
            )));
        }
        Ok(BuiltSegment::new(id, file.docs))
    }

    fn store_version(&self, version: &Version) -> Result<()> {
        if !version.is_valid() {
            return Err(IrisError::invalid_argument(
                "cannot store a version without an id",
            ));
        }
        let json = version.to_json()?;
        self.write_atomic(&self.version_path(version.version_id), json.as_bytes())
    }

    fn store_segment(&self, segment: &BuiltSegment) -> Result<()> {
        if !segment.id().is_on_disk() {
            return Err(IrisError::invalid_argument(format!(
                "segment {} is not an on-disk segment",
                segment.id()
            )));
        }
        let file = SegmentFile {
            info: segment.info().clone(),
            docs: segment.docs().to_vec(),
        };
        let mut bytes = serde_json::to_vec(&file)?;
        let crc = crc32fast::hash(&bytes);
        bytes.write_u32::<LittleEndian>(crc)?;
        self.write_atomic(&self.segment_path(segment.id()), &bytes)
    }
}
