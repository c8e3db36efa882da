//! Order-preserving tuple codec (§4.A).
//!
//! Encodes an ordered sequence of [`TupleValue`]s to a byte string whose
//! lexicographic order matches the element-wise order of the input.
//! Integers are flipped on the sign bit so that two's-complement ordering
//! becomes byte-lexicographic; doubles use the standard sign-magnitude
//! bit transform; strings and byte-strings are escaped so an embedded
//! `0x00` can never be mistaken for element/tuple termination.
//!
//! Nested tuples are length-prefixed rather than terminator-delimited:
//! this keeps decode unambiguous without reserving another escape byte,
//! at the cost of not extending the element-wise ordering guarantee to
//! tuple-of-tuple comparisons (an accepted implementation choice, see
//! DESIGN.md).

use crate::error::{Error, Result};
use crate::types::TupleValue;
use uuid::Uuid;

const TAG_UNIT: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x0c;
const TAG_DOUBLE: u8 = 0x0d;
const TAG_STRING: u8 = 0x0e;
const TAG_BYTES: u8 = 0x0f;
const TAG_UUID: u8 = 0x10;
const TAG_INSTANT: u8 = 0x11;
const TAG_TUPLE: u8 = 0x12;

/// Encode a sequence of tuple elements. Fails with `TupleEncodingError` on
/// integer overflow and with `NilNotIndexable` if asked to encode a nil
/// (the tuple codec has no nil representation; callers filter nils before
/// calling this, per the sparse-index semantics in §4.F).
pub fn encode(elements: &[TupleValue]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for el in elements {
        encode_one(el, &mut out)?;
    }
    Ok(out)
}

fn encode_one(value: &TupleValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        TupleValue::Unit => out.push(TAG_UNIT),
        TupleValue::Bool(false) => out.push(TAG_FALSE),
        TupleValue::Bool(true) => out.push(TAG_TRUE),
        TupleValue::Int(v) => {
            out.push(TAG_INT);
            let flipped = (*v as u64) ^ (1u64 << 63);
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        TupleValue::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&double_to_ordered_bytes(*v));
        }
        TupleValue::Instant(v) => {
            out.push(TAG_INSTANT);
            out.extend_from_slice(&double_to_ordered_bytes(*v));
        }
        TupleValue::String(s) => {
            out.push(TAG_STRING);
            encode_escaped(s.as_bytes(), out);
        }
        TupleValue::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_escaped(b, out);
        }
        TupleValue::Uuid(u) => {
            out.push(TAG_UUID);
            out.extend_from_slice(u.as_bytes());
        }
        TupleValue::Tuple(inner) => {
            out.push(TAG_TUPLE);
            let encoded = encode(inner)?;
            if encoded.len() > u32::MAX as usize {
                return Err(Error::TupleEncodingError(
                    "nested tuple too large to encode".into(),
                ));
            }
            out.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            out.extend_from_slice(&encoded);
        }
    }
    Ok(())
}

/// Escape `0x00` as `0x00 0xFF` and terminate with `0x00 0x00`. This keeps
/// string/byte-string comparison byte-lexicographic: a shorter string is
/// always less than one that extends it, because the terminator `0x00`
/// sorts before any escaped continuation byte `0xFF`.
fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

fn decode_escaped(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    loop {
        if *pos >= bytes.len() {
            return Err(Error::TupleDecodingError(
                "unterminated escaped string".into(),
            ));
        }
        let b = bytes[*pos];
        *pos += 1;
        if b == 0x00 {
            if *pos >= bytes.len() {
                return Err(Error::TupleDecodingError(
                    "truncated escape sequence".into(),
                ));
            }
            let next = bytes[*pos];
            *pos += 1;
            if next == 0x00 {
                return Ok(result);
            } else if next == 0xff {
                result.push(0x00);
            } else {
                return Err(Error::TupleDecodingError(format!(
                    "invalid escape continuation byte {:#x}",
                    next
                )));
            }
        } else {
            result.push(b);
        }
    }
}

fn double_to_ordered_bytes(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let transformed = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    transformed.to_be_bytes()
}

fn ordered_bytes_to_double(bytes: [u8; 8]) -> f64 {
    let transformed = u64::from_be_bytes(bytes);
    let bits = if transformed & (1u64 << 63) != 0 {
        transformed & !(1u64 << 63)
    } else {
        !transformed
    };
    f64::from_bits(bits)
}

/// Decode a byte string produced by [`encode`] back into its elements.
/// Fails with `TupleDecodingError` on truncated or malformed input.
pub fn decode(bytes: &[u8]) -> Result<Vec<TupleValue>> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < bytes.len() {
        out.push(decode_one(bytes, &mut pos)?);
    }
    Ok(out)
}

fn decode_one(bytes: &[u8], pos: &mut usize) -> Result<TupleValue> {
    let tag = bytes[*pos];
    *pos += 1;
    match tag {
        TAG_UNIT => Ok(TupleValue::Unit),
        TAG_FALSE => Ok(TupleValue::Bool(false)),
        TAG_TRUE => Ok(TupleValue::Bool(true)),
        TAG_INT => {
            let raw = take_fixed::<8>(bytes, pos)?;
            let flipped = u64::from_be_bytes(raw) ^ (1u64 << 63);
            Ok(TupleValue::Int(flipped as i64))
        }
        TAG_DOUBLE => {
            let raw = take_fixed::<8>(bytes, pos)?;
            Ok(TupleValue::Double(ordered_bytes_to_double(raw)))
        }
        TAG_INSTANT => {
            let raw = take_fixed::<8>(bytes, pos)?;
            Ok(TupleValue::Instant(ordered_bytes_to_double(raw)))
        }
        TAG_STRING => {
            let raw = decode_escaped(bytes, pos)?;
            String::from_utf8(raw)
                .map(TupleValue::String)
                .map_err(|e| Error::TupleDecodingError(format!("invalid utf-8: {e}")))
        }
        TAG_BYTES => Ok(TupleValue::Bytes(decode_escaped(bytes, pos)?)),
        TAG_UUID => {
            let raw = take_fixed::<16>(bytes, pos)?;
            Ok(TupleValue::Uuid(Uuid::from_bytes(raw)))
        }
        TAG_TUPLE => {
            let len_bytes = take_fixed::<4>(bytes, pos)?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if *pos + len > bytes.len() {
                return Err(Error::TupleDecodingError(
                    "nested tuple length exceeds buffer".into(),
                ));
            }
            let inner = decode(&bytes[*pos..*pos + len])?;
            *pos += len;
            Ok(TupleValue::Tuple(inner))
        }
        other => Err(Error::TupleDecodingError(format!(
            "unknown tuple tag {:#x}",
            other
        ))),
    }
}

fn take_fixed<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    if *pos + N > bytes.len() {
        return Err(Error::TupleDecodingError("truncated tuple element".into()));
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[*pos..*pos + N]);
    *pos += N;
    Ok(buf)
}

/// The half-open byte range `[begin, end)` covering every encoded tuple
/// whose prefix equals `prefix` — the range form used by range scans
/// over an index or item subspace (§4.A).
pub fn range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (prefix.to_vec(), strinc(prefix))
}

/// FoundationDB-style "string increment": trims trailing `0xFF` bytes and
/// increments the last remaining byte, producing the smallest byte string
/// strictly greater than every string with `prefix` as a prefix.
fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(&0xff) = end.last() {
        end.pop();
    }
    if let Some(last) = end.last_mut() {
        *last += 1;
    } else {
        // prefix was empty or all 0xFF: no finite upper bound, the caller
        // must treat this as "scan to the end of the keyspace".
    }
    end
}
