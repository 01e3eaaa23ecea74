//! Current-generation container (KDBX 3.1 and 4.x)
//!
//! Read path: signature and header, key derivation, body decryption,
//! integrity verification (stream-start bytes for 3.1, header hash and HMAC
//! blocks for 4.x), decompression, then the XML document. Write path mirrors
//! it with fresh seeds, IV and inner stream key on every save.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::hashed_block::{self, DEFAULT_BLOCK_SIZE};
use super::header::{
    is_v4, InnerBinary, InnerHeader, OuterHeader, MASTER_SEED_LEN, STREAM_START_LEN, VERSION_3_1, VERSION_4,
    VERSION_4_1,
};
use super::hmac_block::{self, HEADER_BLOCK_INDEX};
use super::{xml, OpenOptions};
use crate::context::EngineContext;
use crate::crypto::kdf::aes::AES_KDF_UUID;
use crate::crypto::{
    final_key, hmac_base_key, sha256, CipherEngine, CipherMode, InnerStream, InnerStreamKind,
    KdfParameters, MasterCredential, SecureBytes,
};
use crate::error::{DatabaseError, Result};
use crate::tree::{BinaryPool, Compression, CryptoSettings, Database, Entry};

/// Lowest envelope version able to hold everything in `db` when it is
/// saved with `kdf`.
pub fn minimum_version(db: &Database, kdf: &KdfParameters) -> u32 {
    let entry_needs_4_1 = |e: &Entry| !e.quality_check || e.custom_data.has_timestamps() || e.previous_parent.is_some();
    let needs_4_1 = db
        .groups()
        .any(|g| !g.tags.is_empty() || g.custom_data.has_timestamps() || g.previous_parent.is_some())
        || db
            .entries()
            .any(|e| entry_needs_4_1(e) || e.history.iter().any(entry_needs_4_1))
        || db.meta.custom_data.has_timestamps()
        || db
            .meta
            .custom_icons
            .iter()
            .any(|icon| !icon.name.is_empty() || icon.last_modification.is_some());
    if needs_4_1 {
        return VERSION_4_1;
    }

    let needs_4 = kdf.uuid().map_or(true, |uuid| uuid != AES_KDF_UUID)
        || !db.crypto.public_custom_data.is_empty()
        || !db.meta.custom_data.is_empty()
        || db.groups().any(|g| !g.custom_data.is_empty())
        || db
            .entries()
            .any(|e| !e.custom_data.is_empty() || e.history.iter().any(|h| !h.custom_data.is_empty()));
    if needs_4 {
        VERSION_4
    } else {
        VERSION_3_1
    }
}

fn decompress(compression: Compression, data: SecureBytes) -> Result<SecureBytes> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut out = Vec::with_capacity(data.len() * 2);
            GzDecoder::new(&data[..])
                .read_to_end(&mut out)
                .map_err(|e| DatabaseError::MalformedStream(format!("gzip: {}", e)))?;
            Ok(SecureBytes::new(out))
        }
    }
}

fn compress(compression: Compression, data: SecureBytes) -> Result<SecureBytes> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&data)?;
            Ok(SecureBytes::new(encoder.finish()?))
        }
    }
}

/// Decrypts a 3.1 body and checks its stream-start bytes.
///
/// A mismatch means the key is wrong. A padding failure once the start
/// bytes matched means the body itself is damaged.
fn decrypt_v3(
    cipher: &dyn CipherEngine,
    key: &[u8],
    iv: &[u8],
    body: &[u8],
    expected_start: &[u8],
) -> Result<SecureBytes> {
    let mut transform = cipher.cipher(CipherMode::Decrypt, key, iv)?;
    let mut plain = Zeroizing::new(transform.update(body)?);
    let checked_early = plain.len() >= STREAM_START_LEN;
    if checked_early && plain[..STREAM_START_LEN] != *expected_start {
        return Err(DatabaseError::InvalidCredentials);
    }
    match transform.finish() {
        Ok(tail) => plain.extend_from_slice(&tail),
        Err(_) if !checked_early => return Err(DatabaseError::InvalidCredentials),
        Err(e) => return Err(e),
    }
    if plain.len() < STREAM_START_LEN || plain[..STREAM_START_LEN] != *expected_start {
        return Err(DatabaseError::InvalidCredentials);
    }
    Ok(SecureBytes::new(std::mem::take(&mut *plain)))
}

pub fn read(data: &[u8], credential: &MasterCredential, options: &OpenOptions, ctx: &EngineContext) -> Result<Database> {
    ctx.checkpoint("header")?;
    let (header, header_len) = OuterHeader::read(data)?;
    let header_bytes = &data[..header_len];
    let body = &data[header_len..];
    let v4 = is_v4(header.version);
    let cipher = ctx.ciphers().get(&header.cipher)?;
    let kdf = ctx.kdfs().get(&header.kdf.uuid()?)?;
    debug!(
        cipher = cipher.name(),
        kdf = kdf.name(),
        compression = ?header.compression,
        "container header parsed"
    );

    ctx.checkpoint("derive")?;
    let composite = credential.composite_key(header.kdf.seed().unwrap_or_default())?;
    let transformed = kdf.transform(&composite, &header.kdf)?;
    let key = final_key(&header.master_seed, &transformed);

    ctx.checkpoint("decrypt")?;
    let (inner_stream, inner_key, inner_binaries, xml_bytes) = if v4 {
        if body.len() < 64 {
            return Err(DatabaseError::MalformedStream("обрезан хеш заголовка".into()));
        }
        let (stored_hash, rest) = body.split_at(32);
        if hmac_block::header_hash(header_bytes)[..] != *stored_hash {
            return Err(DatabaseError::IntegrityCheckFailed(HEADER_BLOCK_INDEX));
        }
        let hmac_key = hmac_base_key(&header.master_seed, &transformed);
        let (stored_mac, blocks) = rest.split_at(32);
        if hmac_block::header_mac(header_bytes, &hmac_key)?[..] != *stored_mac {
            return Err(DatabaseError::InvalidCredentials);
        }
        let encrypted = hmac_block::decode(blocks, &hmac_key)?;
        let plain = SecureBytes::new(cipher.decrypt_all(&key, &header.encryption_iv, &encrypted)?);
        let payload = decompress(header.compression, plain)?;
        let (inner, offset) = InnerHeader::read(&payload)?;
        debug!(binaries = inner.binaries.len(), "inner header read");
        (
            inner.inner_stream,
            inner.inner_stream_key,
            inner.binaries,
            SecureBytes::new(payload[offset..].to_vec()),
        )
    } else {
        let plain = decrypt_v3(
            cipher.as_ref(),
            &key,
            &header.encryption_iv,
            body,
            &header.stream_start_bytes,
        )?;
        let blocks = hashed_block::decode(&plain[STREAM_START_LEN..])?;
        let payload = decompress(header.compression, SecureBytes::new(blocks))?;
        (
            header.inner_stream,
            header.inner_stream_key.clone(),
            Vec::new(),
            payload,
        )
    };

    ctx.checkpoint("document")?;
    let mut stream = InnerStream::new(inner_stream, &inner_key)?;
    let mut pool = BinaryPool::new();
    let mut refs = Vec::with_capacity(inner_binaries.len());
    for binary in &inner_binaries {
        refs.push(pool.register_unreferenced(&binary.data, binary.protected, ctx)?);
    }
    let parsed = xml::read_document(&xml_bytes, &mut stream, pool, &refs, options.duplicate_ids, ctx)?;
    if let Some(stored) = parsed.header_hash.as_deref().filter(|_| !v4) {
        if sha256(header_bytes)[..] != *stored {
            return Err(DatabaseError::IntegrityCheckFailed(HEADER_BLOCK_INDEX));
        }
    }

    let mut db = parsed.database;
    db.crypto = CryptoSettings {
        cipher: header.cipher,
        kdf: header.kdf,
        compression: header.compression,
        inner_stream,
        version: header.version,
        public_custom_data: header.public_custom_data,
    };
    db.set_read_only(options.read_only);
    info!(
        version = %format!("{:#010x}", header.version),
        groups = db.group_count(),
        entries = db.entry_count(),
        "database opened"
    );
    Ok(db)
}

/// Encodes `db` with the cipher, KDF and compression of `crypto`.
pub fn write(
    db: &Database,
    crypto: &CryptoSettings,
    credential: &MasterCredential,
    ctx: &EngineContext,
) -> Result<Vec<u8>> {
    let cipher = ctx.ciphers().get(&crypto.cipher)?;
    let kdf_engine = ctx.kdfs().get(&crypto.kdf.uuid()?)?;
    let mut kdf = crypto.kdf.clone();
    kdf_engine.randomize(&mut kdf);
    kdf_engine.validate(&kdf)?;

    let version = minimum_version(db, &kdf);
    let v4 = is_v4(version);
    let stream_kind = if v4 {
        InnerStreamKind::ChaCha20
    } else {
        InnerStreamKind::Salsa20
    };
    debug!(
        version = %format!("{:#010x}", version),
        cipher = cipher.name(),
        kdf = kdf_engine.name(),
        "writing container"
    );

    ctx.checkpoint("derive")?;
    let master_seed = SecureBytes::random(MASTER_SEED_LEN);
    let iv = SecureBytes::random(cipher.iv_len());
    let stream_key = SecureBytes::random(stream_kind.key_len());
    let stream_start = SecureBytes::random(STREAM_START_LEN);
    let composite = credential.composite_key(kdf.seed().unwrap_or_default())?;
    let transformed = kdf_engine.transform(&composite, &kdf)?;
    let key = final_key(&master_seed, &transformed);

    let header = OuterHeader {
        version,
        cipher: crypto.cipher,
        compression: crypto.compression,
        master_seed: master_seed.to_vec(),
        encryption_iv: iv.to_vec(),
        kdf,
        public_custom_data: if v4 {
            crypto.public_custom_data.clone()
        } else {
            Default::default()
        },
        comment: Vec::new(),
        inner_stream: if v4 { InnerStreamKind::None } else { stream_kind },
        inner_stream_key: if v4 { Vec::new() } else { stream_key.to_vec() },
        stream_start_bytes: if v4 { Vec::new() } else { stream_start.to_vec() },
    };
    let header_bytes = header.write()?;

    ctx.checkpoint("document")?;
    let mut stream = InnerStream::new(stream_kind, &stream_key)?;
    let binary_order: Vec<u32> = db.binaries.keys().copied().collect();
    let mut out = header_bytes.clone();

    if v4 {
        let document = SecureBytes::new(xml::write_document(db, version, &mut stream, &binary_order, None)?);
        let mut binaries = Vec::with_capacity(binary_order.len());
        for key in &binary_order {
            binaries.push(InnerBinary {
                protected: db.binaries.get(key).map_or(false, |b| b.is_protected()),
                data: db.binaries.data(key)?.to_vec(),
            });
        }
        let inner = InnerHeader {
            inner_stream: stream_kind,
            inner_stream_key: stream_key.to_vec(),
            binaries,
        };
        let payload = SecureBytes::concat(&[inner.write()?.as_slice(), &document[..]]);
        let payload = compress(crypto.compression, payload)?;

        ctx.checkpoint("encrypt")?;
        let encrypted = cipher.encrypt_all(&key, &iv, &payload)?;
        let hmac_key = hmac_base_key(&master_seed, &transformed);
        out.extend_from_slice(&hmac_block::header_hash(&header_bytes));
        out.extend_from_slice(&hmac_block::header_mac(&header_bytes, &hmac_key)?);
        out.extend_from_slice(&hmac_block::encode(&encrypted, &hmac_key, DEFAULT_BLOCK_SIZE)?);
    } else {
        let hash = sha256(&header_bytes);
        let document = SecureBytes::new(xml::write_document(
            db,
            version,
            &mut stream,
            &binary_order,
            Some(&hash),
        )?);
        let payload = compress(crypto.compression, document)?;
        let blocks = hashed_block::encode(&payload, DEFAULT_BLOCK_SIZE)?;
        let plain = SecureBytes::concat(&[&stream_start[..], &blocks[..]]);

        ctx.checkpoint("encrypt")?;
        out.extend_from_slice(&cipher.encrypt_all(&key, &iv, &plain)?);
    }

    info!(bytes = out.len(), "database encoded");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::engine::{AES256_UUID, CHACHA20_UUID, TWOFISH_UUID};
    use crate::crypto::kdf::aes;
    use crate::crypto::kdf::argon::{self, Argon2Variant};
    use crate::format::DuplicateIdPolicy;
    use crate::tree::Group;

    fn tiny_aes() -> KdfParameters {
        aes::parameters(6)
    }

    fn sample() -> Database {
        let ctx = EngineContext::default();
        let mut db = Database::new("Root");
        db.crypto.kdf = tiny_aes();
        let root = db.root_id();
        let mut entry = Entry::new();
        entry.set_title("Example");
        entry.set_username("user");
        entry.set_password("pass");
        let id = db.add_entry(&root, entry).unwrap();
        db.add_attachment(&id, "a.bin", &[1, 2, 3, 4], true, &ctx).unwrap();
        db
    }

    fn reopen(bytes: &[u8], password: &str) -> Result<Database> {
        read(
            bytes,
            &MasterCredential::password(password),
            &OpenOptions::default(),
            &EngineContext::default(),
        )
    }

    #[test]
    fn test_plain_database_is_version_3_1() {
        let db = sample();
        assert_eq!(minimum_version(&db, &db.crypto.kdf), VERSION_3_1);

        let argon = argon::parameters(Argon2Variant::D, 1, 8 * 1024, 1);
        assert_eq!(minimum_version(&db, &argon), VERSION_4);
    }

    #[test]
    fn test_tags_and_custom_data_raise_version() {
        let mut db = sample();
        let root = db.root_id();
        db.meta.custom_data.set("plugin", "on", None);
        assert_eq!(minimum_version(&db, &tiny_aes()), VERSION_4);

        db.group_mut(&root).unwrap().tags.push("work".into());
        assert_eq!(minimum_version(&db, &tiny_aes()), VERSION_4_1);
    }

    #[test]
    fn test_round_trip_every_cipher_and_version() {
        let ctx = EngineContext::default();
        for cipher in [AES256_UUID, TWOFISH_UUID, CHACHA20_UUID] {
            for kdf in [tiny_aes(), argon::parameters(Argon2Variant::Id, 1, 8 * 1024, 1)] {
                for compression in [Compression::None, Compression::Gzip] {
                    let db = sample();
                    let mut crypto = db.crypto.clone();
                    crypto.cipher = cipher;
                    crypto.kdf = kdf.clone();
                    crypto.compression = compression;
                    let bytes = write(&db, &crypto, &MasterCredential::password("pw"), &ctx).unwrap();

                    let back = reopen(&bytes, "pw").unwrap();
                    assert_eq!(back.crypto.cipher, cipher);
                    assert_eq!(back.crypto.compression, compression);
                    let entry = back.entries().next().unwrap();
                    assert_eq!(entry.password(), "pass");
                    let attachment = entry.attachment("a.bin").unwrap();
                    assert_eq!(&*back.binaries.data(&attachment.binary).unwrap(), &[1, 2, 3, 4]);
                }
            }
        }
    }

    #[test]
    fn test_wrong_password_is_a_credential_error() {
        let db = sample();
        let ctx = EngineContext::default();
        let v3 = write(&db, &db.crypto, &MasterCredential::password("right"), &ctx).unwrap();
        assert!(matches!(reopen(&v3, "wrong"), Err(DatabaseError::InvalidCredentials)));

        let mut crypto = db.crypto.clone();
        crypto.kdf = argon::parameters(Argon2Variant::D, 1, 8 * 1024, 1);
        let v4 = write(&db, &crypto, &MasterCredential::password("right"), &ctx).unwrap();
        assert!(matches!(reopen(&v4, "wrong"), Err(DatabaseError::InvalidCredentials)));
    }

    #[test]
    fn test_tampered_v4_header_fails_integrity() {
        let db = sample();
        let mut crypto = db.crypto.clone();
        crypto.kdf = argon::parameters(Argon2Variant::D, 1, 8 * 1024, 1);
        let mut bytes = write(&db, &crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        // Last byte of the end-of-header marker: parses fine, hashes differently.
        let (_, header_len) = OuterHeader::read(&bytes).unwrap();
        bytes[header_len - 1] ^= 0xFF;
        assert!(matches!(
            reopen(&bytes, "pw"),
            Err(DatabaseError::IntegrityCheckFailed(HEADER_BLOCK_INDEX))
        ));
    }

    #[test]
    fn test_fresh_seeds_on_every_save() {
        let db = sample();
        let ctx = EngineContext::default();
        let a = write(&db, &db.crypto, &MasterCredential::password("pw"), &ctx).unwrap();
        let b = write(&db, &db.crypto, &MasterCredential::password("pw"), &ctx).unwrap();
        let (ha, _) = OuterHeader::read(&a).unwrap();
        let (hb, _) = OuterHeader::read(&b).unwrap();
        assert_ne!(ha.master_seed, hb.master_seed);
        assert_ne!(ha.encryption_iv, hb.encryption_iv);
    }

    #[test]
    fn test_cancelled_context_stops_before_derivation() {
        let db = sample();
        let bytes = write(&db, &db.crypto, &MasterCredential::password("pw"), &EngineContext::default()).unwrap();
        let ctx = EngineContext::default();
        ctx.cancel_token().cancel();
        let result = read(&bytes, &MasterCredential::password("pw"), &OpenOptions::default(), &ctx);
        assert!(matches!(result, Err(DatabaseError::Cancelled)));
    }

    #[test]
    fn test_duplicate_group_ids_follow_policy() {
        let ctx = EngineContext::default();
        let mut db = sample();
        let root = db.root_id();
        let a = db.add_group(&root, Group::new("A")).unwrap();
        let b = db.add_group(&root, Group::new("B")).unwrap();

        // Rewrite the serialized document so two groups share an id.
        let mut stream = InnerStream::new(InnerStreamKind::None, &[]).unwrap();
        let order: Vec<u32> = db.binaries.keys().copied().collect();
        let xml_bytes = xml::write_document(&db, VERSION_4, &mut stream, &order, None).unwrap();
        let text = String::from_utf8(xml_bytes).unwrap();
        let a_uuid = crate::format::xml::format_uuid(&a.as_uuid().unwrap());
        let b_uuid = crate::format::xml::format_uuid(&b.as_uuid().unwrap());
        let clashing = text.replace(&a_uuid, &b_uuid);

        let pool = || {
            let mut pool = BinaryPool::new();
            let key = pool.register_unreferenced(&[1, 2, 3, 4], true, &ctx).unwrap();
            (pool, vec![key])
        };
        let (p, refs) = pool();
        let mut stream = InnerStream::new(InnerStreamKind::None, &[]).unwrap();
        let failed = xml::read_document(clashing.as_bytes(), &mut stream, p, &refs, DuplicateIdPolicy::Fail, &ctx);
        assert!(matches!(failed, Err(DatabaseError::DuplicateIdentifier { .. })));

        let (p, refs) = pool();
        let mut stream = InnerStream::new(InnerStreamKind::None, &[]).unwrap();
        let fixed = xml::read_document(clashing.as_bytes(), &mut stream, p, &refs, DuplicateIdPolicy::Fix, &ctx)
            .unwrap()
            .database;
        assert_eq!(fixed.group_count(), db.group_count());
    }
}
