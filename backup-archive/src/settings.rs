// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Backup bookkeeping kept in the local store: the media root key, the upload era,
//! the last export and the app versions an import came from.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::aead::{OsRng, rand_core::RngCore};
use rusqlite::Connection;
use serde::Serialize;

use crate::{crypto::MediaRootBackupKey, error::BackupError, kv::KeyValueStore};

const MEDIA_ROOT_KEY: &str = "mediaRootBackupKey";
const UPLOAD_ERA: &str = "uploadEra";
const FIRST_APP_VERSION: &str = "firstAppVersion";
const LAST_BACKUP_TIME: &str = "lastBackupTimeMs";
const LAST_BACKUP_SIZE: &str = "lastBackupSizeBytes";
const RESTORED_FIRST_APP_VERSION: &str = "restoredFirstAppVersion";
const RESTORED_CURRENT_APP_VERSION: &str = "restoredCurrentAppVersion";

/// Time and size of the most recent successful export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastBackup {
    pub time_ms: i64,
    pub size_bytes: i64,
}

/// App versions recorded in the header of the restored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredAppVersions {
    pub first: String,
    pub current: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BackupSettingsStore {
    kv: KeyValueStore,
}

impl Default for BackupSettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupSettingsStore {
    pub const fn new() -> Self {
        Self {
            kv: KeyValueStore::new("BackupSettings"),
        }
    }

    pub fn media_root_backup_key(
        &self,
        conn: &Connection,
    ) -> Result<Option<MediaRootBackupKey>, BackupError> {
        match self.kv.get_bytes(conn, MEDIA_ROOT_KEY)? {
            Some(bytes) => Ok(Some(MediaRootBackupKey::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_media_root_backup_key(
        &self,
        conn: &Connection,
        key: &MediaRootBackupKey,
    ) -> rusqlite::Result<()> {
        self.kv.set_bytes(conn, MEDIA_ROOT_KEY, key.as_bytes())
    }

    /// The stored media root key, generating and storing one on first use.
    pub fn get_or_create_media_root_backup_key(
        &self,
        conn: &Connection,
    ) -> Result<MediaRootBackupKey, BackupError> {
        if let Some(key) = self.media_root_backup_key(conn)? {
            return Ok(key);
        }
        let key = MediaRootBackupKey::generate();
        self.set_media_root_backup_key(conn, &key)?;
        Ok(key)
    }

    /// The current upload era, generating one on first use.
    pub fn get_or_create_upload_era(&self, conn: &Connection) -> rusqlite::Result<String> {
        if let Some(era) = self.kv.get_string(conn, UPLOAD_ERA)? {
            return Ok(era);
        }
        let era = new_upload_era();
        self.kv.set_string(conn, UPLOAD_ERA, &era)?;
        Ok(era)
    }

    /// Start a new upload era, e.g. after the media root key changed.
    pub fn rotate_upload_era(&self, conn: &Connection) -> rusqlite::Result<String> {
        let era = new_upload_era();
        self.kv.set_string(conn, UPLOAD_ERA, &era)?;
        Ok(era)
    }

    /// The first app version that wrote to this store, recording `current` if unset.
    pub fn get_or_set_first_app_version(
        &self,
        conn: &Connection,
        current: &str,
    ) -> rusqlite::Result<String> {
        if let Some(version) = self.kv.get_string(conn, FIRST_APP_VERSION)? {
            return Ok(version);
        }
        self.kv.set_string(conn, FIRST_APP_VERSION, current)?;
        Ok(current.to_string())
    }

    pub fn set_last_backup(&self, conn: &Connection, last: LastBackup) -> rusqlite::Result<()> {
        self.kv.set_i64(conn, LAST_BACKUP_TIME, last.time_ms)?;
        self.kv.set_i64(conn, LAST_BACKUP_SIZE, last.size_bytes)
    }

    pub fn last_backup(&self, conn: &Connection) -> rusqlite::Result<Option<LastBackup>> {
        let time = self.kv.get_i64(conn, LAST_BACKUP_TIME)?;
        let size = self.kv.get_i64(conn, LAST_BACKUP_SIZE)?;
        Ok(time.zip(size).map(|(time_ms, size_bytes)| LastBackup { time_ms, size_bytes }))
    }

    pub fn set_restored_app_versions(
        &self,
        conn: &Connection,
        versions: &RestoredAppVersions,
    ) -> rusqlite::Result<()> {
        self.kv.set_string(conn, RESTORED_FIRST_APP_VERSION, &versions.first)?;
        self.kv.set_string(conn, RESTORED_CURRENT_APP_VERSION, &versions.current)
    }

    pub fn restored_app_versions(
        &self,
        conn: &Connection,
    ) -> rusqlite::Result<Option<RestoredAppVersions>> {
        let first = self.kv.get_string(conn, RESTORED_FIRST_APP_VERSION)?;
        let current = self.kv.get_string(conn, RESTORED_CURRENT_APP_VERSION)?;
        Ok(first
            .zip(current)
            .map(|(first, current)| RestoredAppVersions { first, current }))
    }
}

fn new_upload_era() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("db");
        KeyValueStore::ensure_schema(&conn).expect("schema");
        conn
    }

    #[test]
    fn media_root_key_and_era_are_created_once() {
        let conn = conn();
        let store = BackupSettingsStore::new();
        let key = store.get_or_create_media_root_backup_key(&conn).expect("key");
        assert_eq!(store.get_or_create_media_root_backup_key(&conn).expect("key"), key);

        let era = store.get_or_create_upload_era(&conn).expect("era");
        assert_eq!(store.get_or_create_upload_era(&conn).expect("era"), era);
        assert_ne!(store.rotate_upload_era(&conn).expect("rotate"), era);
    }

    #[test]
    fn bookkeeping_round_trips() {
        let conn = conn();
        let store = BackupSettingsStore::new();
        assert!(store.last_backup(&conn).expect("read").is_none());
        let last = LastBackup {
            time_ms: 1_700_000_000_000,
            size_bytes: 4096,
        };
        store.set_last_backup(&conn, last).expect("write");
        assert_eq!(store.last_backup(&conn).expect("read"), Some(last));

        assert_eq!(store.get_or_set_first_app_version(&conn, "1.0").expect("v"), "1.0");
        assert_eq!(store.get_or_set_first_app_version(&conn, "2.0").expect("v"), "1.0");

        let versions = RestoredAppVersions {
            first: "0.9".into(),
            current: "1.2".into(),
        };
        store.set_restored_app_versions(&conn, &versions).expect("write");
        assert_eq!(store.restored_app_versions(&conn).expect("read"), Some(versions));
    }
}
