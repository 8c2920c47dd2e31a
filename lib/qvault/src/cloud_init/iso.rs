// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cloud-init container: a small named-entry store persisted as a FAT
//! volume labelled `cidata`, which cloud-init's NoCloud datasource reads on
//! first boot.
//!
//! Serialization is deterministic: entries are written in name order, the
//! volume ID is fixed, and every timestamp is the FAT epoch. Writing the same
//! entries twice yields byte-identical volumes.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use camino::Utf8Path;
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use tracing::debug;

use super::CloudInitError;

/// The label cloud-init looks for when searching for a NoCloud volume.
const VOLUME_LABEL: [u8; 11] = *b"cidata     ";

const VOLUME_ID: u32 = 0x0c1d_a7a0;

/// The maximum size of volume this module creates. Keeping this small (at
/// most 4084 sectors) guarantees the volume is FAT12, whose overhead is easy
/// to compute up front.
const MAX_VOLUME_BYTES: usize = 1 << 20;

/// This module assumes each FAT cluster is one sector in size.
const BYTES_PER_SECTOR: usize = 512;

const BYTES_PER_DIRECTORY_ENTRY: usize = 32;
const ROOT_DIRECTORY_ENTRIES: usize = 512;
const TABLES_PER_VOLUME: usize = 2;

/// `fatfs` refuses to format volumes smaller than this.
const MIN_VOLUME_SECTORS: usize = 42;

const fn sectors_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(BYTES_PER_SECTOR)
}

/// Sectors used by the boot sector, both allocation tables and the root
/// directory region. The table size is computed as though every sector in the
/// largest permitted volume were addressable, which is an upper bound.
const fn overhead_sectors() -> usize {
    let dir_entry_sectors =
        sectors_for_bytes(ROOT_DIRECTORY_ENTRIES * BYTES_PER_DIRECTORY_ENTRY);
    let max_sectors = sectors_for_bytes(MAX_VOLUME_BYTES);

    // FAT12 tables use 12 bits per cluster entry.
    let table_bytes = (max_sectors * 12).div_ceil(8);
    let sectors_per_table = sectors_for_bytes(table_bytes);

    1 + sectors_per_table * TABLES_PER_VOLUME + dir_entry_sectors
}

const fn usable_sectors() -> usize {
    sectors_for_bytes(MAX_VOLUME_BYTES) - overhead_sectors()
}

/// Pins every timestamp `fatfs` records to the FAT epoch.
#[derive(Debug)]
struct EpochTime;

static EPOCH_TIME: EpochTime = EpochTime;

impl fatfs::TimeProvider for EpochTime {
    fn get_current_date(&self) -> fatfs::Date {
        fatfs::Date { year: 1980, month: 1, day: 1 }
    }

    fn get_current_date_time(&self) -> fatfs::DateTime {
        fatfs::DateTime {
            date: self.get_current_date(),
            time: fatfs::Time { hour: 0, min: 0, sec: 0, millis: 0 },
        }
    }
}

fn fs_options() -> FsOptions {
    FsOptions::new().update_accessed_date(false).time_provider(&EPOCH_TIME)
}

/// A set of cloud-init documents keyed by file name (`meta-data`,
/// `network-config`, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInitIso {
    entries: BTreeMap<String, String>,
}

impl CloudInitIso {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Like [`CloudInitIso::get`], but a missing entry is an error.
    pub fn at(&self, name: &str) -> Result<&str, CloudInitError> {
        self.get(name)
            .ok_or_else(|| CloudInitError::MissingConfig(name.to_owned()))
    }

    pub fn set(&mut self, name: impl Into<String>, contents: impl Into<String>) {
        self.entries.insert(name.into(), contents.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Loads the container stored at `path`.
    pub fn read_from(path: &Utf8Path) -> Result<Self, CloudInitError> {
        let bytes = std::fs::read(path).map_err(|source| CloudInitError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::from_bytes(bytes).map_err(|e| match e {
            CloudInitError::ConfigFormat(reason) => {
                CloudInitError::ConfigFormat(format!("{path}: {reason}"))
            }
            e => e,
        })
    }

    /// Decodes a container from the raw bytes of its FAT volume. Only files in
    /// the volume's root directory are entries; anything else is ignored.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CloudInitError> {
        let malformed =
            |what: &str, e: std::io::Error| CloudInitError::ConfigFormat(format!("{what}: {e}"));

        let fs = FileSystem::new(Cursor::new(bytes), fs_options())
            .map_err(|e| malformed("not a FAT volume", e))?;

        let mut entries = BTreeMap::new();
        {
            let root_dir = fs.root_dir();
            for entry in root_dir.iter() {
                let entry =
                    entry.map_err(|e| malformed("reading root directory", e))?;
                if !entry.is_file() {
                    continue;
                }

                let name = entry.file_name();
                let mut contents = String::new();
                entry
                    .to_file()
                    .read_to_string(&mut contents)
                    .map_err(|e| malformed(&format!("reading entry {name}"), e))?;

                entries.insert(name, contents);
            }
        }

        Ok(Self { entries })
    }

    /// Encodes the container as a FAT volume.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CloudInitError> {
        let file_sectors: usize = self
            .entries
            .values()
            .map(|contents| sectors_for_bytes(contents.len()))
            .sum();

        if file_sectors > usable_sectors() {
            return Err(CloudInitError::TooLarge {
                required: file_sectors,
                available: usable_sectors(),
            });
        }

        let sectors = MIN_VOLUME_SECTORS.max(file_sectors + overhead_sectors());

        // Some guests require the sector count to be a multiple of the
        // sectors-per-track value, so put every sector on one track.
        let sectors_per_track: u16 = sectors.try_into().map_err(|_| {
            CloudInitError::TooLarge {
                required: file_sectors,
                available: usable_sectors(),
            }
        })?;

        let mut disk = Cursor::new(vec![0; sectors * BYTES_PER_SECTOR]);
        fatfs::format_volume(
            &mut disk,
            FormatVolumeOptions::new()
                .bytes_per_sector(BYTES_PER_SECTOR as u16)
                .bytes_per_cluster(BYTES_PER_SECTOR as u32)
                .sectors_per_track(sectors_per_track)
                .fat_type(fatfs::FatType::Fat12)
                .volume_id(VOLUME_ID)
                .volume_label(VOLUME_LABEL),
        )
        .map_err(CloudInitError::Fat)?;

        {
            let fs = FileSystem::new(&mut disk, fs_options())
                .map_err(CloudInitError::Fat)?;
            let root_dir = fs.root_dir();
            for (name, contents) in &self.entries {
                root_dir
                    .create_file(name)
                    .and_then(|mut file| file.write_all(contents.as_bytes()))
                    .map_err(CloudInitError::Fat)?;
            }
        }

        Ok(disk.into_inner())
    }

    /// Persists the container to `path`, replacing any existing file. The new
    /// volume is written next to `path` and renamed over it, so readers never
    /// observe a partially-written container.
    pub fn write_to(&self, path: &Utf8Path) -> Result<(), CloudInitError> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };

        let io_err =
            |source| CloudInitError::Io { path: path.to_owned(), source };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!(%path, bytes = bytes.len(), "wrote cloud-init container");
        Ok(())
    }
}
