// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Structural validation of an archive file.
//!
//! Reads the whole stream (decrypting when a key is given), checks the version and
//! decodes every frame. A record that decodes but re-encodes shorter than it was
//! read carries fields this build does not know; those are reported as unknown
//! fields rather than failures.
//!
//! The length comparison cannot tell unknown fields from other bytes the decoder
//! drops: a writer that explicitly encodes default scalars (an empty `bytes`, a
//! zero integer) produces a valid record that is reported the same way. Archives
//! written by [`crate::stream::FrameWriter`] are always canonical, so this only
//! affects archives from other writers.

use std::path::Path;

use prost::Message;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    SUPPORTED_BACKUP_VERSION,
    crypto::ArchiveKey,
    error::{BackupError, ValidationError},
    proto::FrameKind,
    stream::open_archive_file,
};

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub version: u64,
    pub backup_time_ms: u64,
    pub frame_count: u64,
    /// Record kinds carrying unrecognized fields, e.g. `frame.chat_item`.
    pub unknown_fields: Vec<String>,
}

fn io_error(e: &BackupError) -> ValidationError {
    match e {
        BackupError::Io { .. } => ValidationError::ValidationIo {
            message: e.to_string(),
        },
        _ => ValidationError::ValidationFailed {
            message: e.to_string(),
            unknown_fields: Vec::new(),
        },
    }
}

fn note_unknown(fields: &mut Vec<String>, field: String) {
    if !fields.contains(&field) {
        fields.push(field);
    }
}

/// Read and check every record of the archive at `path`.
///
/// `header_len` bytes of metadata header are skipped before decrypting.
pub fn validate_archive_file(
    path: &Path,
    key: Option<&ArchiveKey>,
    header_len: u64,
) -> Result<ValidationReport, ValidationError> {
    let mut opened = open_archive_file(path, key, header_len).map_err(|e| io_error(&e))?;
    let reader = &mut opened.reader;
    let mut unknown_fields = Vec::new();

    let failed = |message: String, unknown_fields: &Vec<String>| ValidationError::ValidationFailed {
        message,
        unknown_fields: unknown_fields.clone(),
    };

    let info = reader
        .read_backup_info()
        .map_err(|e| failed(e.to_string(), &unknown_fields))?;
    if info.version != SUPPORTED_BACKUP_VERSION {
        return Err(failed(
            format!(
                "unsupported backup version {} (supported: {SUPPORTED_BACKUP_VERSION})",
                info.version
            ),
            &unknown_fields,
        ));
    }
    if info.encoded_len() < reader.last_frame_len() {
        note_unknown(&mut unknown_fields, "backup_info".to_string());
    }

    let mut frame_count = 0u64;
    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                return Err(failed(
                    format!("frame {}: {e}", reader.frames_read()),
                    &unknown_fields,
                ));
            }
        };
        frame_count += 1;
        let kind = frame.kind();
        if kind == FrameKind::Unknown {
            note_unknown(&mut unknown_fields, "frame.item".to_string());
        } else if frame.encoded_len() < reader.last_frame_len() {
            note_unknown(&mut unknown_fields, format!("frame.{kind}"));
        }
    }

    debug!(frame_count, path = %path.display(), "archive validated");
    if unknown_fields.is_empty() {
        Ok(ValidationReport {
            version: info.version,
            backup_time_ms: info.backup_time_ms,
            frame_count,
            unknown_fields,
        })
    } else {
        warn!(fields = ?unknown_fields, "archive contains unknown fields");
        Err(ValidationError::UnknownFields {
            fields: unknown_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archiver::FrameSink,
        crypto::ArchiveKey,
        proto::{BackupInfo, Frame, StickerPack, frame},
        stream::{FrameWriter, create_archive_file},
    };

    fn write_archive(path: &Path, key: Option<&ArchiveKey>, version: u64, frames: &[Frame]) {
        let output = create_archive_file(path, key, None).expect("create");
        let mut writer = FrameWriter::new(output);
        writer
            .write_backup_info(&BackupInfo {
                version,
                ..BackupInfo::default()
            })
            .expect("info");
        for frame in frames {
            writer.write_frame(frame).expect("frame");
        }
        writer.into_inner().finish().expect("finish");
    }

    fn sticker() -> Frame {
        Frame::new(frame::Item::StickerPack(StickerPack {
            pack_id: vec![1; 16],
            pack_key: vec![2; 32],
        }))
    }

    #[test]
    fn valid_encrypted_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        let key = ArchiveKey::generate();
        write_archive(&path, Some(&key), 1, &[sticker(), sticker()]);
        let report = validate_archive_file(&path, Some(&key), 0).expect("valid");
        assert_eq!(report.frame_count, 2);
        assert!(report.unknown_fields.is_empty());
    }

    #[test]
    fn wrong_key_and_version_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        let key = ArchiveKey::generate();
        write_archive(&path, Some(&key), 1, &[sticker()]);
        let err = validate_archive_file(&path, Some(&ArchiveKey::generate()), 0).expect_err("key");
        assert!(matches!(err, ValidationError::ValidationFailed { .. }));

        write_archive(&path, None, 2, &[]);
        let err = validate_archive_file(&path, None, 0).expect_err("version");
        assert!(matches!(err, ValidationError::ValidationFailed { message, .. } if message.contains("version 2")));

        let err = validate_archive_file(&dir.path().join("missing.bin"), None, 0).expect_err("io");
        assert!(matches!(err, ValidationError::ValidationIo { .. }));
    }

    #[test]
    fn explicit_default_field_is_reported_as_unknown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        let mut bytes = BackupInfo {
            version: 1,
            ..BackupInfo::default()
        }
        .encode_length_delimited_to_vec();
        // sticker pack with pack_id written out as an empty field
        let mut pack = vec![0x0a, 0x00, 0x12, 0x20];
        pack.extend_from_slice(&[2; 32]);
        let mut frame = vec![0x2a, u8::try_from(pack.len()).expect("short")];
        frame.extend_from_slice(&pack);
        bytes.push(u8::try_from(frame.len()).expect("short"));
        bytes.extend_from_slice(&frame);
        std::fs::write(&path, &bytes).expect("write");

        let err = validate_archive_file(&path, None, 0).expect_err("non-canonical");
        assert_eq!(
            err,
            ValidationError::UnknownFields {
                fields: vec!["frame.sticker_pack".to_string()]
            }
        );
    }

    #[test]
    fn empty_frame_is_unknown_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.bin");
        write_archive(&path, None, 1, &[sticker(), Frame::default(), sticker()]);
        let err = validate_archive_file(&path, None, 0).expect_err("unknown");
        assert_eq!(
            err,
            ValidationError::UnknownFields {
                fields: vec!["frame.item".to_string()]
            }
        );
    }
}
