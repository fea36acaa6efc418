//! Run identifiers and file locations.
//!
//! Every run gets a short identifier: its unix timestamp written in base 36.
//! Identifiers of the same length sort in creation order at one-second
//! resolution, and [`decode_uuid`] recovers the exact timestamp.

use std::fmt::Display;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Local, TimeZone};

use crate::config::{DataConfig, FolderStructure};
use crate::error::{LabsweepError, Result, StorageError};

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// File extension of container files (Arrow IPC stream).
pub const FILE_EXTENSION: &str = "arrows";

/// Encode a unix timestamp into its base-36 identifier.
pub fn encode_uuid(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let base = ALPHABET.len() as u64;
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % base) as usize]);
        value /= base;
    }
    digits.reverse();
    // ALPHABET is ASCII
    digits.into_iter().map(char::from).collect()
}

/// Decode an identifier back into the unix timestamp. Case-insensitive.
pub fn decode_uuid(id: &str) -> Result<u64> {
    if id.is_empty() {
        return Err(LabsweepError::InvalidIdentifier(id.to_string()));
    }
    let base = ALPHABET.len() as u64;
    id.chars().try_fold(0u64, |acc, c| {
        let upper = c.to_ascii_uppercase();
        let digit = ALPHABET
            .iter()
            .position(|&a| char::from(a) == upper)
            .ok_or_else(|| LabsweepError::InvalidIdentifier(id.to_string()))?;
        acc.checked_mul(base)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| LabsweepError::InvalidIdentifier(id.to_string()))
    })
}

fn sanitize(part: &str) -> String {
    part.trim().replace(' ', "_")
}

/// Location of one run's folder and container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPath {
    pub unix_timestamp: u64,
    pub uuid: String,
    /// Folder relative to the data directory
    pub rel_folder: PathBuf,
    pub folder: PathBuf,
    /// File stem, shared by the container file and the run log
    pub stem: String,
    pub file_name: String,
    pub file_path: PathBuf,
}

impl RunPath {
    /// Path for a run called `name` starting now.
    pub fn new(config: &DataConfig, name: &str) -> Self {
        Self::at(config, name, &Local::now())
    }

    /// Path for a run called `name` started at `timestamp`.
    pub fn at<Tz: TimeZone>(config: &DataConfig, name: &str, timestamp: &DateTime<Tz>) -> Self
    where
        Tz::Offset: Display,
    {
        let unix_timestamp = u64::try_from(timestamp.timestamp()).unwrap_or(0);
        let uuid = encode_uuid(unix_timestamp);
        let suffix = if name.is_empty() {
            String::new()
        } else {
            format!("_{name}")
        };

        let (stem, rel_folder) = match config.folder_structure {
            FolderStructure::Dated => {
                let stem = format!("{}{suffix}", timestamp.format("%H%M%S"));
                let rel = PathBuf::from(timestamp.format("%Y%m%d").to_string()).join(&stem);
                (stem, rel)
            }
            FolderStructure::Flat => {
                let stem = format!("{uuid}{suffix}");
                let rel = PathBuf::from(sanitize(&config.run_id).to_uppercase())
                    .join(sanitize(&config.user))
                    .join(&stem);
                (stem, rel)
            }
        };

        let folder = config.data_dir.join(&rel_folder);
        let file_name = format!("{stem}.{FILE_EXTENSION}");
        Self {
            unix_timestamp,
            uuid,
            file_path: folder.join(&file_name),
            rel_folder,
            folder,
            stem,
            file_name,
        }
    }

    /// Create the run folder. Fails with [`StorageError::RunExists`] when the
    /// folder is already there, so a run never lands on an earlier one.
    pub fn mkdirs(&self) -> Result<()> {
        if let Some(parent) = self.folder.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::create_dir(&self.folder) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StorageError::RunExists(self.folder.display().to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.folder.join(format!("{}.log", self.stem))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.folder.join("run.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_encode_known_values() {
        assert_eq!(encode_uuid(0), "0");
        assert_eq!(encode_uuid(35), "Z");
        assert_eq!(encode_uuid(36), "10");
        assert_eq!(encode_uuid(1_500_000_000), "OT27EO");
    }

    #[test]
    fn test_round_trip_over_range() {
        for t in (0..2_000_000_000u64).step_by(7_654_321) {
            assert_eq!(decode_uuid(&encode_uuid(t)).unwrap(), t);
        }
        assert_eq!(decode_uuid(&encode_uuid(u64::MAX)).unwrap(), u64::MAX);
    }

    #[test]
    fn test_decode_is_case_insensitive_and_strict() {
        assert_eq!(decode_uuid("ot27eo").unwrap(), 1_500_000_000);
        assert!(decode_uuid("").is_err());
        assert!(decode_uuid("AB-C").is_err());
        assert!(decode_uuid("Ä").is_err());
        // One digit more than u64 can hold.
        assert!(decode_uuid("ZZZZZZZZZZZZZZ").is_err());
    }

    #[test]
    fn test_identifiers_sort_in_creation_order() {
        let ids: Vec<String> = (1_600_000_000u64..1_600_000_100).map(encode_uuid).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_dated_layout() {
        let cfg = DataConfig::new("/data");
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let run = RunPath::at(&cfg, "2D_iv", &ts);
        assert_eq!(run.stem, "140507_2D_iv");
        assert_eq!(run.rel_folder, PathBuf::from("20240309/140507_2D_iv"));
        assert_eq!(
            run.file_path,
            PathBuf::from("/data/20240309/140507_2D_iv/140507_2D_iv.arrows")
        );
        assert_eq!(decode_uuid(&run.uuid).unwrap(), ts.timestamp() as u64);
    }

    #[test]
    fn test_flat_layout_sanitizes_names() {
        let cfg = DataConfig::new("/data").with_flat_layout(" cool down 3 ", "Ada Lovelace");
        let ts = Utc.timestamp_opt(1_500_000_000, 0).unwrap();
        let run = RunPath::at(&cfg, "scan", &ts);
        assert_eq!(run.uuid, "OT27EO");
        assert_eq!(
            run.rel_folder,
            PathBuf::from("COOL_DOWN_3/Ada_Lovelace/OT27EO_scan")
        );
        assert_eq!(run.file_name, "OT27EO_scan.arrows");
        assert_eq!(run.log_path(), PathBuf::from("/data/COOL_DOWN_3/Ada_Lovelace/OT27EO_scan/OT27EO_scan.log"));
    }

    #[test]
    fn test_mkdirs_refuses_existing_folder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = DataConfig::new(tmp.path());
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let run = RunPath::at(&cfg, "1D_iv", &ts);
        run.mkdirs().unwrap();
        assert!(run.folder.is_dir());

        let again = RunPath::at(&cfg, "1D_iv", &ts);
        assert!(matches!(
            again.mkdirs(),
            Err(LabsweepError::Storage(StorageError::RunExists(_)))
        ));
        // A different name in the same second is a different folder.
        RunPath::at(&cfg, "1D_cv", &ts).mkdirs().unwrap();
    }
}
