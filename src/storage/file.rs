//! JSON catalog files.
//!
//! A catalog file is rewritten as a whole: the new contents go to a temporary
//! file in the same directory, which then replaces the target in one rename.

use super::memory::CatalogState;
use crate::core::{AgingError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const CATALOG_FORMAT_VERSION: u32 = 1;

pub fn read_catalog(path: &Path) -> Result<CatalogState> {
    let file = File::open(path)?;
    let state: CatalogState = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
        AgingError::Persistence(format!("parse catalog {}: {}", path.display(), err))
    })?;

    if state.version != CATALOG_FORMAT_VERSION {
        return Err(AgingError::Persistence(format!(
            "catalog {} has format version {}, expected {}",
            path.display(),
            state.version,
            CATALOG_FORMAT_VERSION
        )));
    }
    for policy in &state.policies {
        policy.validate()?;
    }

    log::info!(
        "loaded catalog {} ({} policies, {} copies)",
        path.display(),
        state.policies.len(),
        state.copies.len()
    );
    Ok(state)
}

pub fn write_catalog(path: &Path, state: &CatalogState) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, state).map_err(|err| {
            AgingError::Persistence(format!("serialize catalog: {}", err))
        })?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| AgingError::Persistence(format!("replace {}: {}", path.display(), err)))?;

    log::debug!("wrote catalog {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CopyId, Job, JobId};
    use crate::policy::{RetentionPolicy, StorageCopy, StoragePolicy};
    use crate::storage::CopyRecord;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_catalog_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");

        let mut state = CatalogState::default();
        state.policies.push(
            StoragePolicy::new(1, "gold")
                .with_copy(StorageCopy::new(1, "primary", 0, RetentionPolicy::new(7, 2))),
        );
        let mut record = CopyRecord::default();
        record
            .jobs
            .push(Job::full(1, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        record.replicated.insert(JobId(1));
        state.copies.insert(CopyId(1), record);

        write_catalog(&path, &state).unwrap();
        assert_eq!(read_catalog(&path).unwrap(), state);

        // Overwriting leaves exactly one file behind.
        write_catalog(&path, &CatalogState::default()).unwrap();
        assert!(read_catalog(&path).unwrap().policies.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"version": 7}"#).unwrap();
        assert!(matches!(read_catalog(&path), Err(AgingError::Persistence(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = read_catalog(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.is_transient());
    }
}
