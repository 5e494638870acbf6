//! CID extraction: finds IPFS content identifiers in free-form chat text.
//!
//! Text is split into maximal runs of ASCII alphanumerics; every other
//! character is a boundary. Each run is then validated as a whole, so a
//! CID-shaped substring of a longer token never matches, while CIDs inside
//! gateway URLs (`/ipfs/<cid>/...`, `<cid>.ipfs.dweb.link`) do.
//!
//! Accepted forms:
//! - CIDv0: 46 base58btc chars starting `Qm`, decoding to a sha2-256 multihash.
//! - CIDv1: multibase `b` (base32 lower) or `z` (base58btc); decoded bytes are
//!   version `0x01`, a known content codec, then a complete multihash.
//!
//! Tokens longer than any real CID are rejected before decoding.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PinError, Result};

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

const CIDV0_LEN: usize = 46;
const SHA2_256: u8 = 0x12;
const SHA2_256_LEN: u8 = 0x20;
/// Shortest multibase token worth decoding (prefix + version + codec + tiny multihash).
const CIDV1_MIN_LEN: usize = 10;
/// Longest token decoded. A base32 CIDv1 with a 64-byte digest is about 115 chars.
const MAX_TOKEN_LEN: usize = 128;

/// Content codecs accepted in a CIDv1.
const KNOWN_CODECS: &[u64] = &[
    0x51,   // cbor
    0x55,   // raw
    0x70,   // dag-pb
    0x71,   // dag-cbor
    0x72,   // libp2p-key
    0x78,   // git-raw
    0x85,   // dag-jose
    0x0129, // dag-json
    0x0200, // json
];

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9A-Za-z]+").expect("token regex should compile"));

/// A syntactically valid content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    /// Validate a single operator-supplied string. Surrounding whitespace is
    /// ignored; anything else that is not exactly one CID is rejected.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if is_valid(trimmed) {
            Ok(Cid(trimmed.to_string()))
        } else {
            Err(PinError::InvalidCid {
                input: input.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn version(&self) -> u8 {
        if self.0.len() == CIDV0_LEN && self.0.starts_with("Qm") {
            0
        } else {
            1
        }
    }

    /// Wrap a string already known to be a CID (read back from the store).
    pub(crate) fn from_trusted(s: String) -> Self {
        Cid(s)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extract every distinct CID from `text`, in order of first appearance.
pub fn extract(text: &str) -> Vec<Cid> {
    let mut seen = HashSet::new();
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|token| is_valid(token))
        .filter(|token| seen.insert(*token))
        .map(|token| Cid(token.to_string()))
        .collect()
}

/// Whether `token` (with no surrounding text) is a CIDv0 or CIDv1.
pub fn is_valid(token: &str) -> bool {
    if token.len() == CIDV0_LEN && token.starts_with("Qm") {
        return is_cidv0(token);
    }
    if token.len() < CIDV1_MIN_LEN || token.len() > MAX_TOKEN_LEN {
        return false;
    }
    let decoded = match token.as_bytes()[0] {
        b'b' => decode_base32(&token[1..]),
        b'z' => decode_base58(&token[1..]),
        _ => None,
    };
    decoded.is_some_and(|bytes| is_cidv1_bytes(&bytes))
}

fn is_cidv0(token: &str) -> bool {
    decode_base58(token).is_some_and(|bytes| {
        bytes.len() == 34 && bytes[0] == SHA2_256 && bytes[1] == SHA2_256_LEN
    })
}

fn is_cidv1_bytes(bytes: &[u8]) -> bool {
    if bytes.first() != Some(&0x01) {
        return false;
    }
    let Some((codec, pos)) = read_varint(bytes, 1) else {
        return false;
    };
    if !KNOWN_CODECS.contains(&codec) {
        return false;
    }
    let Some((_hash_code, pos)) = read_varint(bytes, pos) else {
        return false;
    };
    let Some((digest_len, pos)) = read_varint(bytes, pos) else {
        return false;
    };
    digest_len > 0 && (bytes.len() - pos) as u64 == digest_len
}

/// Unsigned LEB128 as used by multiformats (at most 9 bytes).
fn read_varint(bytes: &[u8], mut pos: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..9 {
        let byte = *bytes.get(pos)?;
        pos += 1;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, pos));
        }
    }
    None
}

fn decode_base58(s: &str) -> Option<Vec<u8>> {
    // Little-endian big number, reversed at the end.
    let mut out: Vec<u8> = Vec::with_capacity(s.len());
    for c in s.bytes() {
        let mut carry = BASE58_ALPHABET.iter().position(|&a| a == c)? as u32;
        for byte in out.iter_mut() {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            out.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_zeros = s.bytes().take_while(|&c| c == b'1').count();
    let mut bytes = vec![0u8; leading_zeros];
    bytes.extend(out.iter().rev());
    Some(bytes)
}

/// RFC 4648 base32, lowercase, unpadded. Non-canonical trailing bits reject.
fn decode_base32(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for c in s.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = ((buffer << 5) | value) & 0xffff;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    if bits >= 5 || buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V0_README: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    const V0_HELLO: &str = "QmT78zSuBmuS4z925WZfrqQ1qHaJ56DQaTfyMUF7F8ff5o";
    const V1_DAG_PB: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
    const V1_RAW: &str = "bafkreifzjut3te2nhyekklss27nh3k72ysco7y32koao5eei66wof36n5e";
    const V1_BASE58: &str = "zdj7WWeQ43G6JJvLWQWZpyHuAMq6uYWRjkBXFad11vE2LHhQ7";

    fn strs(cids: &[Cid]) -> Vec<&str> {
        cids.iter().map(Cid::as_str).collect()
    }

    #[test]
    fn recognizes_known_cids() {
        for cid in [V0_README, V0_HELLO, V1_DAG_PB, V1_RAW, V1_BASE58] {
            assert!(is_valid(cid), "{cid} should be valid");
        }
    }

    #[test]
    fn rejects_truncated_and_extended_tokens() {
        assert!(!is_valid(&V0_README[..45]));
        assert!(!is_valid(&format!("{V0_README}x")));
        assert!(!is_valid(&V1_DAG_PB[..V1_DAG_PB.len() - 1]));
        // One extra zero-valued base32 char decodes to the same bytes; still rejected.
        assert!(!is_valid(&format!("{V1_DAG_PB}a")));
    }

    #[test]
    fn rejects_plain_words_and_bad_alphabet() {
        for word in ["because", "bafybeig", "zebra", "hello", ""] {
            assert!(!is_valid(word), "{word} should be invalid");
        }
        // '0' and 'l' are not base58 characters.
        let bad = format!("Qm0{}", &V0_README[3..]);
        assert!(!is_valid(&bad));
        // A 46-char Qm string that decodes outside the sha2-256 prefix.
        assert!(!is_valid("Qm11111111111111111111111111111111111111111111"));
    }

    fn encode_base32(bytes: &[u8]) -> String {
        let mut out = String::from("b");
        let mut buffer: u32 = 0;
        let mut bits = 0;
        for &byte in bytes {
            buffer = ((buffer << 8) | u32::from(byte)) & 0xffff;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }

    #[test]
    fn cidv1_codec_must_be_known() {
        let mut bytes = decode_base32(&V1_RAW[1..]).unwrap();
        assert_eq!(bytes[1], 0x55);
        assert_eq!(encode_base32(&bytes), V1_RAW);

        bytes[1] = 0x71;
        assert!(is_valid(&encode_base32(&bytes)));
        bytes[1] = 0x20;
        assert!(!is_valid(&encode_base32(&bytes)));
    }

    #[test]
    fn overlong_tokens_are_not_decoded() {
        let long = format!("z{}", "2".repeat(MAX_TOKEN_LEN));
        assert!(!is_valid(&long));
        let hostile = format!("{} {V0_HELLO}", "Qm".repeat(50_000));
        assert_eq!(strs(&extract(&hostile)), vec![V0_HELLO]);
    }

    #[test]
    fn extracts_from_surrounding_text() {
        let text = format!(
            "check https://ipfs.io/ipfs/{V0_README}/readme and {V1_DAG_PB}.ipfs.dweb.link, ok?"
        );
        assert_eq!(strs(&extract(&text)), vec![V0_README, V1_DAG_PB]);
    }

    #[test]
    fn ignores_cid_inside_longer_token() {
        let text = format!("x{V0_HELLO} {V1_RAW}7 abc{V1_DAG_PB}");
        assert!(extract(&text).is_empty());
    }

    #[test]
    fn duplicates_collapse_in_first_seen_order() {
        let text = format!("{V1_RAW} {V0_HELLO}\n({V1_RAW}) \"{V0_HELLO}\"");
        assert_eq!(strs(&extract(&text)), vec![V1_RAW, V0_HELLO]);
    }

    #[test]
    fn empty_and_cidless_text() {
        assert!(extract("").is_empty());
        assert!(extract("no content ids here, just words 12345").is_empty());
    }

    #[test]
    fn parse_trims_and_rejects() {
        let cid = Cid::parse(&format!("  {V0_HELLO}\n")).unwrap();
        assert_eq!(cid.as_str(), V0_HELLO);
        assert_eq!(cid.version(), 0);
        assert_eq!(Cid::parse(V1_RAW).unwrap().version(), 1);

        let err = Cid::parse("./some/file.txt").unwrap_err();
        assert!(matches!(err, PinError::InvalidCid { .. }));
        assert!(Cid::parse(&format!("{V0_HELLO} {V1_RAW}")).is_err());
    }
}
