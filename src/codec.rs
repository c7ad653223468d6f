//! Record framing: `header | key | value | crc32` (§4.1).

use crc::{Crc, CRC_32_ISCSI};
use integer_encoding::VarInt;

use crate::consts::{CRC_SIZE, MAX_KEY_SIZE};
use crate::crypto::{apply_keystream, DataKey};
use crate::err::VLogError;
use crate::types::{Entry, EntryMeta};

/// Castagnoli CRC32, matching the disk format's checksum polynomial (§4.1, §6).
static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug)]
pub struct Header {
    pub klen: u32,
    pub vlen: u32,
    pub expires_at: u64,
    pub meta: u8,
    pub user_meta: u8,
}

/// Failure while decoding a single record. Distinct from [`VLogError`] because
/// callers react differently depending on context: [`super::vlog::log_file::LogFile::iterate`]
/// folds every variant into a `Truncate` at the pre-record offset, while a
/// direct [`super::vlog::value_log::ValueLog::read`] surfaces `ChecksumMismatch`
/// to its caller verbatim.
#[derive(Debug)]
pub enum DecodeError {
    ShortRead,
    KeyTooLarge(usize),
    ChecksumMismatch,
}

pub fn encode_header(buf: &mut Vec<u8>, header: &Header) {
    let mut tmp = [0u8; 10];
    let n = header.klen.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
    let n = header.vlen.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
    let n = header.expires_at.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
    buf.push(header.meta);
    buf.push(header.user_meta);
}

pub fn decode_header(buf: &[u8]) -> Option<(Header, usize)> {
    let (klen, n1) = u32::decode_var(buf)?;
    let (vlen, n2) = u32::decode_var(buf.get(n1..)?)?;
    let (expires_at, n3) = u64::decode_var(buf.get(n1 + n2..)?)?;
    let consumed = n1 + n2 + n3;
    let meta = *buf.get(consumed)?;
    let user_meta = *buf.get(consumed + 1)?;
    Some((
        Header {
            klen,
            vlen,
            expires_at,
            meta,
            user_meta,
        },
        consumed + 2,
    ))
}

/// Encodes `entry` as it would sit on disk at `file_offset`, appending it to
/// `out`. Returns the number of bytes written. The key/value region is
/// encrypted in place (post-header) if `cipher` is `Some`; the CRC is always
/// computed over the final on-disk bytes, so it validates storage integrity
/// whether or not encryption is enabled.
pub fn encode_entry(
    out: &mut Vec<u8>,
    entry: &Entry,
    file_offset: u32,
    cipher: Option<(&DataKey, &[u8; 12])>,
) -> Result<usize, VLogError> {
    if entry.key.len() as u64 >= MAX_KEY_SIZE {
        return Err(VLogError::KeyTooLarge {
            len: entry.key.len(),
        });
    }

    let start = out.len();
    let header = Header {
        klen: entry.key.len() as u32,
        vlen: entry.value.len() as u32,
        expires_at: entry.expires_at,
        meta: entry.meta.bits(),
        user_meta: entry.user_meta,
    };
    encode_header(out, &header);
    let header_len = out.len() - start;

    let kv_start = out.len();
    out.extend_from_slice(&entry.key);
    out.extend_from_slice(&entry.value);

    if let Some((data_key, base_iv)) = cipher {
        let kv_offset = file_offset + header_len as u32;
        apply_keystream(data_key, base_iv, kv_offset, &mut out[kv_start..])?;
    }

    let crc = CASTAGNOLI.checksum(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());

    Ok(out.len() - start)
}

/// A decoded record plus the total number of on-disk bytes it occupied
/// (header + key + value + crc).
pub struct DecodedRecord {
    pub entry: Entry,
    pub record_len: usize,
}

/// Decodes the record starting at `buf[0..]`, which represents the bytes at
/// `file_offset` in the owning file. `buf` may (and for iteration, usually
/// does) extend past the end of this one record.
pub fn decode_entry(
    buf: &[u8],
    file_offset: u32,
    verify_crc: bool,
    cipher: Option<(&DataKey, &[u8; 12])>,
) -> Result<DecodedRecord, DecodeError> {
    let (header, header_len) = decode_header(buf).ok_or(DecodeError::ShortRead)?;
    if header.klen as u64 >= MAX_KEY_SIZE {
        return Err(DecodeError::KeyTooLarge(header.klen as usize));
    }

    let kv_len = header.klen as usize + header.vlen as usize;
    let record_len = header_len + kv_len + CRC_SIZE;
    if buf.len() < record_len {
        return Err(DecodeError::ShortRead);
    }

    let stored_crc = u32::from_le_bytes(buf[header_len + kv_len..record_len].try_into().unwrap());
    if verify_crc {
        let computed = CASTAGNOLI.checksum(&buf[..header_len + kv_len]);
        if computed != stored_crc {
            return Err(DecodeError::ChecksumMismatch);
        }
    }

    let mut kv = buf[header_len..header_len + kv_len].to_vec();
    if let Some((data_key, base_iv)) = cipher {
        let kv_offset = file_offset + header_len as u32;
        apply_keystream(data_key, base_iv, kv_offset, &mut kv)
            .map_err(|_| DecodeError::ChecksumMismatch)?;
    }

    let value = kv.split_off(header.klen as usize);
    let key = kv;

    let entry = Entry {
        key,
        value,
        user_meta: header.user_meta,
        meta: EntryMeta::from_bits_truncate(header.meta),
        expires_at: header.expires_at,
        offset: file_offset,
        header_len: header_len as u32,
    };

    Ok(DecodedRecord { entry, record_len })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        Entry::new("samplekey", "sampleval")
            .with_meta(EntryMeta::VALUE_POINTER)
            .with_user_meta(7)
            .with_expires_at(42)
    }

    #[test]
    fn round_trip_no_encryption() {
        let entry = sample_entry();
        let mut buf = Vec::new();
        let written = encode_entry(&mut buf, &entry, 20, None).unwrap();
        assert_eq!(written, buf.len());

        let decoded = decode_entry(&buf, 20, true, None).unwrap();
        assert_eq!(decoded.entry.key, entry.key);
        assert_eq!(decoded.entry.value, entry.value);
        assert_eq!(decoded.entry.meta, entry.meta);
        assert_eq!(decoded.entry.user_meta, entry.user_meta);
        assert_eq!(decoded.entry.expires_at, entry.expires_at);
        assert_eq!(decoded.record_len, buf.len());
    }

    #[test]
    fn round_trip_with_encryption() {
        let entry = sample_entry();
        let data_key = DataKey {
            key_id: 1,
            data: [7u8; 32],
        };
        let base_iv = [9u8; 12];

        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry, 20, Some((&data_key, &base_iv))).unwrap();

        let decoded = decode_entry(&buf, 20, true, Some((&data_key, &base_iv))).unwrap();
        assert_eq!(decoded.entry.key, entry.key);
        assert_eq!(decoded.entry.value, entry.value);
    }

    #[test]
    fn tampered_byte_fails_checksum() {
        let entry = sample_entry();
        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry, 20, None).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;

        let err = decode_entry(&buf, 20, true, None).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch));
    }

    #[test]
    fn short_buffer_is_short_read() {
        let entry = sample_entry();
        let mut buf = Vec::new();
        encode_entry(&mut buf, &entry, 20, None).unwrap();
        buf.truncate(buf.len() - 2);

        let err = decode_entry(&buf, 20, true, None).unwrap_err();
        assert!(matches!(err, DecodeError::ShortRead));
    }

    #[test]
    fn key_too_large_is_rejected_on_encode() {
        let huge_key = vec![0u8; MAX_KEY_SIZE as usize];
        let entry = Entry::new(huge_key, "v");
        let mut buf = Vec::new();
        let err = encode_entry(&mut buf, &entry, 20, None).unwrap_err();
        assert!(matches!(err, VLogError::KeyTooLarge { .. }));
    }
}
