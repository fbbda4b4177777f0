// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Key material, key derivation and archive encryption.
//!
//! Keys are derived with HKDF-SHA256:
//!
//! - backup id: `HKDF(ikm = backup key, info = label || account id)`, 16 bytes
//! - service password: `HKDF(ikm = backup key, info = label || backup id)`
//! - remote archive key: `HKDF(ikm = backup key || token?, salt = backup id, info = label)`
//! - device transfer key: `HKDF(ikm = ephemeral key, salt = account id, info = label)`
//!
//! The archive body is a chunked ChaCha20-Poly1305 stream:
//!
//! ```text
//! [7-byte random nonce prefix] ([u32 BE ciphertext length][ciphertext + tag])+
//! ```
//!
//! Segment `i` uses nonce `prefix || u32 BE i || last flag`, so reordering,
//! truncation at a segment boundary and trailing data are all detected.

use std::{
    fmt,
    io::{self, Read, Write},
};

use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce,
    aead::{Aead, OsRng, Payload, rand_core::RngCore},
};
use hkdf::Hkdf;
use sha2::Sha256;
use snafu::prelude::*;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    config::{
        AEAD_SEGMENT_LEN, KDF_ARCHIVE_KEY_INFO, KDF_BACKUP_ID_INFO, KDF_DEVICE_TRANSFER_INFO,
        KDF_SVR_PASSWORD_INFO,
    },
    context::AccountId,
    forward_secrecy::KeyDerivationError,
};

const KEY_LEN: usize = 32;
const BACKUP_ID_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
const STREAM_AAD: &[u8] = b"backup-archive/v1/stream";

// 32-byte secrets: zeroized on drop, redacted in Debug output.
macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; KEY_LEN]);

        impl $name {
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyDerivationError> {
                let key: [u8; KEY_LEN] =
                    bytes
                        .try_into()
                        .map_err(|_| KeyDerivationError::InvalidKeyMaterial {
                            message: format!(
                                "{} must be {KEY_LEN} bytes, got {}",
                                stringify!($name),
                                bytes.len()
                            ),
                        })?;
                Ok(Self(key))
            }

            /// Random key from the OS rng.
            pub fn generate() -> Self {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                Self(key)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

secret_key!(
    /// Long-term account backup key.
    BackupKey
);
secret_key!(
    /// Key for attachment encryption, carried inside the archive header frame.
    MediaRootBackupKey
);
secret_key!(
    /// Short-lived token from the secret recovery service.
    ForwardSecrecyToken
);
secret_key!(
    /// One-time key shared between devices during a device transfer.
    EphemeralBackupKey
);
secret_key!(
    /// Derived key for one archive. Never persisted.
    ArchiveKey
);

/// Identifies a backup chain on the secret recovery service and in the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackupId([u8; BACKUP_ID_LEN]);

impl BackupId {
    pub fn as_bytes(&self) -> &[u8; BACKUP_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, KeyDerivationError> {
        let bytes = hex::decode(text).map_err(|e| KeyDerivationError::InvalidKeyMaterial {
            message: format!("backup id: {e}"),
        })?;
        let id: [u8; BACKUP_ID_LEN] =
            bytes
                .try_into()
                .map_err(|_| KeyDerivationError::InvalidKeyMaterial {
                    message: "backup id must be 16 bytes".to_string(),
                })?;
        Ok(Self(id))
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupId({})", self.to_hex())
    }
}

fn hkdf_expand<const N: usize>(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[&[u8]],
) -> Result<Zeroizing<[u8; N]>, KeyDerivationError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut out = Zeroizing::new([0u8; N]);
    hk.expand_multi_info(info, out.as_mut_slice())
        .map_err(|e| KeyDerivationError::InvalidKeyMaterial {
            message: format!("hkdf expand: {e}"),
        })?;
    Ok(out)
}

pub fn derive_backup_id(
    backup_key: &BackupKey,
    account: &AccountId,
) -> Result<BackupId, KeyDerivationError> {
    let out = hkdf_expand::<BACKUP_ID_LEN>(
        backup_key.as_bytes(),
        None,
        &[KDF_BACKUP_ID_INFO, account.as_bytes()],
    )?;
    Ok(BackupId(*out))
}

/// Password presented to the secret recovery service for this backup chain.
pub fn derive_svr_password(
    backup_key: &BackupKey,
    backup_id: &BackupId,
) -> Result<Zeroizing<Vec<u8>>, KeyDerivationError> {
    let out = hkdf_expand::<KEY_LEN>(
        backup_key.as_bytes(),
        None,
        &[KDF_SVR_PASSWORD_INFO, backup_id.as_bytes()],
    )?;
    Ok(Zeroizing::new(out.to_vec()))
}

/// Archive key for a remote backup. Without a token the key depends only on the
/// backup key (new chain, nothing stored on the service yet).
pub fn derive_archive_key(
    backup_key: &BackupKey,
    backup_id: &BackupId,
    token: Option<&ForwardSecrecyToken>,
) -> Result<ArchiveKey, KeyDerivationError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(2 * KEY_LEN));
    ikm.extend_from_slice(backup_key.as_bytes());
    if let Some(token) = token {
        ikm.extend_from_slice(token.as_bytes());
    }
    let out = hkdf_expand::<KEY_LEN>(&ikm, Some(backup_id.as_bytes()), &[KDF_ARCHIVE_KEY_INFO])?;
    Ok(ArchiveKey(*out))
}

/// Archive key for a device transfer.
pub fn derive_device_transfer_key(
    ephemeral: &EphemeralBackupKey,
    account: &AccountId,
) -> Result<ArchiveKey, KeyDerivationError> {
    let out = hkdf_expand::<KEY_LEN>(
        ephemeral.as_bytes(),
        Some(account.as_bytes()),
        &[KDF_DEVICE_TRANSFER_INFO],
    )?;
    Ok(ArchiveKey(*out))
}

/// Authentication failure in the encrypted stream. Travels inside an
/// [`io::Error`] of kind `InvalidData` so the stream can sit behind `Read`.
#[derive(Debug, Snafu)]
#[snafu(display("archive authentication failed: {reason}"))]
pub struct DecryptionFailed {
    pub reason: String,
}

impl DecryptionFailed {
    /// Recover the failure from an io error produced by [`DecryptingReader`].
    pub fn from_io(err: &io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }
}

fn decryption_failed(reason: impl Into<String>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        DecryptionFailed {
            reason: reason.into(),
        },
    )
}

fn segment_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    bytes[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    bytes[11] = u8::from(last);
    Nonce::clone_from_slice(&bytes)
}

fn new_cipher(key: &ArchiveKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Encrypts everything written to it. Call [`EncryptingWriter::finish`] to seal the
/// final segment; a stream dropped without `finish` fails authentication when read.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buf: Zeroizing<Vec<u8>>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, key: &ArchiveKey) -> io::Result<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        inner.write_all(&prefix)?;
        Ok(Self {
            inner,
            cipher: new_cipher(key),
            prefix,
            counter: 0,
            buf: Zeroizing::new(Vec::with_capacity(AEAD_SEGMENT_LEN)),
        })
    }

    fn seal(&mut self, len: usize, last: bool) -> io::Result<()> {
        let nonce = segment_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &self.buf[..len],
                    aad: STREAM_AAD,
                },
            )
            .map_err(|_| io::Error::other("segment encryption failed"))?;
        let ct_len = u32::try_from(ciphertext.len())
            .map_err(|_| io::Error::other("segment too large"))?;
        self.inner.write_all(&ct_len.to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buf.drain(..len);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("segment counter overflow"))?;
        Ok(())
    }

    /// Seal the final segment and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let len = self.buf.len();
        self.seal(len, true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // keep at least one byte buffered so the final segment is never empty
        // unless the whole stream is
        while self.buf.len() > AEAD_SEGMENT_LEN {
            self.seal(AEAD_SEGMENT_LEN, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts a stream produced by [`EncryptingWriter`].
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    plain: Zeroizing<Vec<u8>>,
    pos: usize,
    finished: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(mut inner: R, key: &ArchiveKey) -> io::Result<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        if read_full(&mut inner, &mut prefix)? < NONCE_PREFIX_LEN {
            return Err(decryption_failed("archive too short"));
        }
        Ok(Self {
            inner,
            cipher: new_cipher(key),
            prefix,
            counter: 0,
            plain: Zeroizing::new(Vec::new()),
            pos: 0,
            finished: false,
        })
    }

    fn open(&self, ciphertext: &[u8], last: bool) -> Option<Vec<u8>> {
        let nonce = segment_nonce(&self.prefix, self.counter, last);
        self.cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad: STREAM_AAD,
                },
            )
            .ok()
    }

    fn next_segment(&mut self) -> io::Result<()> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.inner, &mut len_buf)? {
            4 => {}
            0 => return Err(decryption_failed("archive truncated before final segment")),
            _ => return Err(decryption_failed("archive truncated in segment length")),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(TAG_LEN..=AEAD_SEGMENT_LEN + TAG_LEN).contains(&len) {
            return Err(decryption_failed(format!(
                "segment {} has invalid length {len}",
                self.counter
            )));
        }
        let mut ciphertext = vec![0u8; len];
        if read_full(&mut self.inner, &mut ciphertext)? < len {
            return Err(decryption_failed("archive truncated inside segment"));
        }
        let (plain, last) = if let Some(plain) = self.open(&ciphertext, false) {
            (plain, false)
        } else if let Some(plain) = self.open(&ciphertext, true) {
            (plain, true)
        } else {
            return Err(decryption_failed(format!(
                "segment {} failed authentication",
                self.counter
            )));
        };
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| decryption_failed("segment counter overflow"))?;
        if last {
            let mut probe = [0u8; 1];
            if read_full(&mut self.inner, &mut probe)? != 0 {
                return Err(decryption_failed("trailing data after final segment"));
            }
            self.finished = true;
        }
        self.plain = Zeroizing::new(plain);
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.plain.len() {
                let n = buf.len().min(self.plain.len() - self.pos);
                buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.next_segment()?;
        }
    }
}

// read until `buf` is full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(key: &ArchiveKey, plain: &[u8]) -> Vec<u8> {
        let mut writer = EncryptingWriter::new(Vec::new(), key).expect("writer");
        writer.write_all(plain).expect("write");
        writer.finish().expect("finish")
    }

    fn decrypt(key: &ArchiveKey, cipher: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = DecryptingReader::new(cipher, key)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    fn is_auth_failure(err: &io::Error) -> bool {
        DecryptionFailed::from_io(err).is_some()
    }

    #[test]
    fn stream_round_trip_across_segments() {
        let key = ArchiveKey::generate();
        for len in [0, 10, AEAD_SEGMENT_LEN, 2 * AEAD_SEGMENT_LEN + 17] {
            #[allow(clippy::cast_possible_truncation)]
            let plain: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let sealed = encrypt(&key, &plain);
            assert_eq!(decrypt(&key, &sealed).expect("decrypt"), plain, "len {len}");
        }
    }

    #[test]
    fn tampered_byte_fails_authentication() {
        let key = ArchiveKey::generate();
        let mut sealed = encrypt(&key, b"hello archive");
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        let err = decrypt(&key, &sealed).expect_err("tampered");
        assert!(is_auth_failure(&err));
    }

    #[test]
    fn dropping_final_segment_is_detected() {
        let key = ArchiveKey::generate();
        let plain = vec![5u8; AEAD_SEGMENT_LEN + 100];
        let sealed = encrypt(&key, &plain);
        // prefix + first full segment only
        let first_segment_end = NONCE_PREFIX_LEN + 4 + AEAD_SEGMENT_LEN + TAG_LEN;
        let err = decrypt(&key, &sealed[..first_segment_end]).expect_err("truncated");
        assert!(is_auth_failure(&err));
    }

    #[test]
    fn trailing_data_is_detected() {
        let key = ArchiveKey::generate();
        let mut sealed = encrypt(&key, b"payload");
        sealed.push(0);
        assert!(is_auth_failure(&decrypt(&key, &sealed).expect_err("trailing")));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(&ArchiveKey::generate(), b"payload");
        let err = decrypt(&ArchiveKey::generate(), &sealed).expect_err("wrong key");
        assert!(is_auth_failure(&err));
    }

    #[test]
    fn archive_key_depends_on_token() {
        let backup_key = BackupKey::from_bytes(&[3u8; 32]).expect("key");
        let account = AccountId::new("acct-1");
        let id = derive_backup_id(&backup_key, &account).expect("id");
        assert_eq!(id, derive_backup_id(&backup_key, &account).expect("id"));
        assert_ne!(
            id,
            derive_backup_id(&backup_key, &AccountId::new("acct-2")).expect("id")
        );

        let token = ForwardSecrecyToken::from_bytes(&[9u8; 32]).expect("token");
        let with_token = derive_archive_key(&backup_key, &id, Some(&token)).expect("key");
        let without = derive_archive_key(&backup_key, &id, None).expect("key");
        assert_ne!(with_token, without);
        assert_eq!(
            with_token,
            derive_archive_key(&backup_key, &id, Some(&token)).expect("key")
        );
    }

    #[test]
    fn key_length_is_checked() {
        assert!(BackupKey::from_bytes(&[0u8; 31]).is_err());
        let debug = format!("{:?}", BackupKey::generate());
        assert_eq!(debug, "BackupKey(<redacted>)");
    }

    #[test]
    fn backup_id_hex_round_trip() {
        let id = derive_backup_id(&BackupKey::generate(), &AccountId::new("a")).expect("id");
        assert_eq!(BackupId::from_hex(&id.to_hex()).expect("hex"), id);
    }
}
