// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Length-delimited frame streams over plaintext or encrypted files.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, atomic::AtomicU64},
};

use prost::Message;
use snafu::prelude::*;

use crate::{
    accounting::CountingReader,
    archiver::FrameSink,
    config::MAX_FRAME_LEN,
    crypto::{ArchiveKey, DecryptingReader, DecryptionFailed, EncryptingWriter},
    error::{BackupError, DecodeSnafu, FrameReadError, IoSnafu},
    proto::{BackupInfo, Frame},
};

// ============================================================================
// Writing
// ============================================================================

/// Plaintext or encrypted destination of an archive.
pub enum ArchiveOutput<W: Write> {
    Plaintext(W),
    Encrypted(EncryptingWriter<W>),
}

impl<W: Write> ArchiveOutput<W> {
    /// Encrypted output. `header` (a serialized metadata header) is written verbatim
    /// before the ciphertext.
    pub fn encrypted(mut inner: W, key: &ArchiveKey, header: Option<&[u8]>) -> io::Result<Self> {
        if let Some(header) = header {
            inner.write_all(header)?;
        }
        Ok(Self::Encrypted(EncryptingWriter::new(inner, key)?))
    }

    /// Seal the stream and return the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plaintext(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Self::Encrypted(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for ArchiveOutput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plaintext(w) => w.write(buf),
            Self::Encrypted(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plaintext(w) => w.flush(),
            Self::Encrypted(w) => w.flush(),
        }
    }
}

/// Create `path` for writing an archive.
pub fn create_archive_file(
    path: &Path,
    key: Option<&ArchiveKey>,
    header: Option<&[u8]>,
) -> Result<ArchiveOutput<BufWriter<File>>, BackupError> {
    let file = File::create(path).context(IoSnafu { path })?;
    let inner = BufWriter::new(file);
    match key {
        Some(key) => ArchiveOutput::encrypted(inner, key, header).context(IoSnafu { path }),
        None => Ok(ArchiveOutput::Plaintext(inner)),
    }
}

/// Writes length-delimited messages.
pub struct FrameWriter<W: Write> {
    inner: W,
    frames_written: u64,
    bytes_written: u64,
    buf: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames_written: 0,
            bytes_written: 0,
            buf: Vec::new(),
        }
    }

    pub fn write_backup_info(&mut self, info: &BackupInfo) -> io::Result<()> {
        self.write_message(info)
    }

    fn write_message<M: Message>(&mut self, message: &M) -> io::Result<()> {
        self.buf.clear();
        message
            .encode_length_delimited(&mut self.buf)
            .map_err(io::Error::other)?;
        self.inner.write_all(&self.buf)?;
        self.bytes_written += self.buf.len() as u64;
        Ok(())
    }

    /// Frames written, not counting the backup info record.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameSink for FrameWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.write_message(frame)?;
        self.frames_written += 1;
        Ok(())
    }
}

// ============================================================================
// Reading
// ============================================================================

fn map_read_error(e: io::Error) -> FrameReadError {
    match DecryptionFailed::from_io(&e) {
        Some(failure) => FrameReadError::Decryption {
            message: failure.reason.clone(),
        },
        None => FrameReadError::ReadIo { source: e },
    }
}

/// Reads length-delimited messages.
pub struct FrameReader<R: BufRead> {
    inner: R,
    frames_read: u64,
    last_frame_len: usize,
    buf: Vec<u8>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            frames_read: 0,
            last_frame_len: 0,
            buf: Vec::new(),
        }
    }

    /// Read the leading backup info record.
    pub fn read_backup_info(&mut self) -> Result<BackupInfo, FrameReadError> {
        if !self.read_raw()? {
            return Err(FrameReadError::MissingBackupInfo);
        }
        BackupInfo::decode(self.buf.as_slice()).context(DecodeSnafu)
    }

    /// Next frame, or `None` at the end of the stream.
    ///
    /// A [`FrameReadError::Decode`] leaves the reader positioned after the bad
    /// frame; any other error ends the stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        if !self.read_raw()? {
            return Ok(None);
        }
        self.frames_read += 1;
        Frame::decode(self.buf.as_slice())
            .map(Some)
            .context(DecodeSnafu)
    }

    /// True if at least one more byte is available.
    pub fn has_more(&mut self) -> Result<bool, FrameReadError> {
        let available = self.inner.fill_buf().map_err(map_read_error)?;
        Ok(!available.is_empty())
    }

    /// Frames read so far, including undecodable ones.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Encoded length of the most recent record, without its length prefix.
    pub fn last_frame_len(&self) -> usize {
        self.last_frame_len
    }

    // false on a clean end of stream
    fn read_raw(&mut self) -> Result<bool, FrameReadError> {
        let Some(len) = self.read_length()? else {
            return Ok(false);
        };
        ensure!(
            len <= MAX_FRAME_LEN,
            crate::error::FrameTooLargeSnafu {
                len,
                max: MAX_FRAME_LEN
            }
        );
        self.buf.clear();
        let actual = (&mut self.inner)
            .take(len)
            .read_to_end(&mut self.buf)
            .map_err(map_read_error)? as u64;
        ensure!(
            actual == len,
            crate::error::TruncatedSnafu {
                expected: len,
                actual
            }
        );
        self.last_frame_len = self.buf.len();
        Ok(true)
    }

    fn read_length(&mut self) -> Result<Option<u64>, FrameReadError> {
        let mut value: u64 = 0;
        for index in 0..10 {
            let mut byte = [0u8; 1];
            let n = loop {
                match self.inner.read(&mut byte) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(map_read_error(e)),
                }
            };
            if n == 0 {
                if index == 0 {
                    return Ok(None);
                }
                return Err(FrameReadError::Truncated {
                    expected: index + 1,
                    actual: index,
                });
            }
            value |= u64::from(byte[0] & 0x7f) << (7 * index);
            if byte[0] & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(FrameReadError::FrameTooLarge {
            len: value,
            max: MAX_FRAME_LEN,
        })
    }
}

/// An archive file opened for reading.
pub struct OpenedArchive {
    pub reader: FrameReader<Box<dyn BufRead + Send>>,
    /// Raw file bytes consumed so far, including the skipped header.
    pub bytes_read: Arc<AtomicU64>,
    pub file_len: u64,
}

/// Open `path` for reading. With a key, the first `header_len` bytes (the metadata
/// header) are skipped and the rest is decrypted.
pub fn open_archive_file(
    path: &Path,
    key: Option<&ArchiveKey>,
    header_len: u64,
) -> Result<OpenedArchive, BackupError> {
    let mut file = File::open(path).context(IoSnafu { path })?;
    let file_len = file.metadata().context(IoSnafu { path })?.len();
    if header_len > 0 {
        file.seek(SeekFrom::Start(header_len))
            .context(IoSnafu { path })?;
    }
    let counting = CountingReader::new(BufReader::new(file));
    let bytes_read = counting.counter();
    bytes_read.fetch_add(header_len, std::sync::atomic::Ordering::Relaxed);
    let inner: Box<dyn BufRead + Send> = match key {
        Some(key) => {
            let decrypting = DecryptingReader::new(counting, key).map_err(|e| {
                BackupError::FrameRead {
                    source: map_read_error(e),
                }
            })?;
            Box::new(BufReader::new(decrypting))
        }
        None => Box::new(BufReader::new(counting)),
    };
    Ok(OpenedArchive {
        reader: FrameReader::new(inner),
        bytes_read,
        file_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{StickerPack, frame};

    fn sticker(n: u8) -> Frame {
        Frame::new(frame::Item::StickerPack(StickerPack {
            pack_id: vec![n; 16],
            pack_key: vec![n; 32],
        }))
    }

    fn info() -> BackupInfo {
        BackupInfo {
            version: 1,
            backup_time_ms: 42,
            ..BackupInfo::default()
        }
    }

    fn write_plain(frames: &[Frame]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_backup_info(&info()).expect("info");
        for frame in frames {
            writer.write_frame(frame).expect("frame");
        }
        assert_eq!(writer.frames_written(), frames.len() as u64);
        writer.into_inner()
    }

    #[test]
    fn reads_back_frames_in_order() {
        let bytes = write_plain(&[sticker(1), sticker(2)]);
        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_backup_info().expect("info").backup_time_ms, 42);
        assert_eq!(reader.read_frame().expect("read"), Some(sticker(1)));
        assert!(reader.has_more().expect("more"));
        assert_eq!(reader.read_frame().expect("read"), Some(sticker(2)));
        assert!(!reader.has_more().expect("more"));
        assert_eq!(reader.read_frame().expect("read"), None);
        assert_eq!(reader.frames_read(), 2);
    }

    #[test]
    fn undecodable_frame_is_skippable() {
        let mut bytes = write_plain(&[]);
        // a frame of one invalid byte (field 0 is never valid)
        bytes.extend_from_slice(&[1, 0x00]);
        bytes.extend_from_slice(&sticker(3).encode_length_delimited_to_vec());
        let mut reader = FrameReader::new(bytes.as_slice());
        reader.read_backup_info().expect("info");
        let err = reader.read_frame().expect_err("bad frame");
        assert!(err.is_skippable());
        assert_eq!(reader.read_frame().expect("read"), Some(sticker(3)));
    }

    #[test]
    fn truncated_frame_is_fatal() {
        let bytes = write_plain(&[sticker(1)]);
        let cut = &bytes[..bytes.len() - 3];
        let mut reader = FrameReader::new(cut);
        reader.read_backup_info().expect("info");
        let err = reader.read_frame().expect_err("truncated");
        assert!(matches!(err, FrameReadError::Truncated { .. }));
        assert!(!err.is_skippable());
    }

    #[test]
    fn empty_stream_has_no_backup_info() {
        let mut reader = FrameReader::new(&[][..]);
        assert!(matches!(
            reader.read_backup_info(),
            Err(FrameReadError::MissingBackupInfo)
        ));
    }

    #[test]
    fn encrypted_file_round_trip_with_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backup.bin");
        let key = ArchiveKey::generate();
        let header = crate::header::serialize_header(b"nonce-metadata").expect("header");

        let output = create_archive_file(&path, Some(&key), Some(&header)).expect("create");
        let mut writer = FrameWriter::new(output);
        writer.write_backup_info(&info()).expect("info");
        writer.write_frame(&sticker(9)).expect("frame");
        writer.into_inner().finish().expect("finish");

        let raw = std::fs::read(&path).expect("read");
        assert!(raw.starts_with(&header));

        let mut opened =
            open_archive_file(&path, Some(&key), header.len() as u64).expect("open");
        assert_eq!(opened.reader.read_backup_info().expect("info").version, 1);
        assert_eq!(opened.reader.read_frame().expect("frame"), Some(sticker(9)));
        assert_eq!(opened.reader.read_frame().expect("end"), None);
        assert_eq!(
            opened.bytes_read.load(std::sync::atomic::Ordering::Relaxed),
            opened.file_len
        );

        let wrong = ArchiveKey::generate();
        let mut opened = open_archive_file(&path, Some(&wrong), header.len() as u64).expect("open");
        assert!(matches!(
            opened.reader.read_backup_info(),
            Err(FrameReadError::Decryption { .. })
        ));
    }
}
