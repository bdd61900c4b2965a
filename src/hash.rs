//! Deterministic content hashing.
//!
//! Every hash handled by this crate is rendered as `"{algorithm}:{hex}"`.
//! In-memory values are hashed through their canonical JSON encoding, which
//! makes the digest depend on structure only: two values that compare equal
//! after serialization hash to the same string, regardless of map ordering.

use std::fmt::{self, Display};
use std::fs::File;
use std::io::Read;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;

use crate::error::{IoContext, ReproError, Result};

/// Default chunk size used when streaming files through a hasher.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
        HashAlgorithm::Blake3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::default()),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self> {
        HashAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| ReproError::engine(format!("Unsupported hash algorithm '{s}'")))
    }
}

/// Incremental hasher over one of the supported algorithms.
enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(bytes),
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
            Hasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => to_hex(&h.finalize()),
            Hasher::Sha1(h) => to_hex(&h.finalize()),
            Hasher::Sha256(h) => to_hex(&h.finalize()),
            Hasher::Sha512(h) => to_hex(&h.finalize()),
            Hasher::Blake3(h) => to_hex(h.finalize().as_bytes()),
        }
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = String::with_capacity(bytes.len() * 2);

    for &byte in bytes {
        acc.push(HEX[(byte >> 4) as usize] as char);
        acc.push(HEX[(byte & 0xF) as usize] as char);
    }

    acc
}

fn render(algorithm: HashAlgorithm, hex: String) -> String {
    format!("{algorithm}:{hex}")
}

/// Hash raw bytes.
pub fn hash_bytes(bytes: impl AsRef<[u8]>, algorithm: HashAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(bytes.as_ref());
    render(algorithm, hasher.finalize_hex())
}

/// Hash any serializable value by its canonical JSON encoding.
pub fn hash_value<T>(value: &T, algorithm: HashAlgorithm) -> Result<String>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value)?;
    Ok(hash_bytes(to_canonical_json(&value), algorithm))
}

/// Stream a file through the hasher in `block_size` chunks.
pub fn hash_file(
    path: impl AsRef<Utf8Path>,
    algorithm: HashAlgorithm,
    block_size: usize,
) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path).at(path)?;
    hash_reader(file, algorithm, block_size).at(path)
}

/// Stream any reader through the hasher in `block_size` chunks.
pub fn hash_reader(
    mut reader: impl Read,
    algorithm: HashAlgorithm,
    block_size: usize,
) -> std::io::Result<String> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; block_size.max(1)];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(render(algorithm, hasher.finalize_hex()))
}

/// Split `"{algorithm}:{hex}"` into its parts.
pub fn split_hash(hash: &str) -> Result<(HashAlgorithm, &str)> {
    let (algorithm, hex) = hash
        .split_once(':')
        .ok_or_else(|| ReproError::engine(format!("Malformed hash '{hash}'")))?;

    Ok((algorithm.parse()?, hex))
}

/// Serialize a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // a JSON string literal is just the escaped string
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let val = json!({ "z": [ { "y": "yes" }, null ], "a": { "x": 10 } });
        assert_eq!(
            to_canonical_json(&val),
            "{\"a\":{\"x\":10},\"z\":[{\"y\":\"yes\"},null]}"
        );
    }

    #[test]
    fn structurally_equal_values_hash_equal() {
        let a = json!({ "b": 2, "a": [1, 2, 3] });
        let b: Value = serde_json::from_str(r#"{"a":[1,2,3],"b":2}"#).unwrap();

        let ha = hash_value(&a, HashAlgorithm::Sha256).unwrap();
        let hb = hash_value(&b, HashAlgorithm::Sha256).unwrap();
        assert_eq!(ha, hb);
        assert!(ha.starts_with("sha256:"));
    }

    #[test]
    fn different_values_hash_differently() {
        let ha = hash_value(&json!([1, 2]), HashAlgorithm::Blake3).unwrap();
        let hb = hash_value(&json!([2, 1]), HashAlgorithm::Blake3).unwrap();
        assert_ne!(ha, hb);
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            hash_bytes("abc", HashAlgorithm::Sha1),
            "sha1:a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_bytes("abc", HashAlgorithm::Md5),
            "md5:900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_bytes("abc", HashAlgorithm::Sha256),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_hash_matches_byte_hash_for_any_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("blob.bin");
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let expected = hash_bytes(&data, HashAlgorithm::Sha512);
        for block_size in [1, 7, 4096, 1 << 20] {
            let actual = hash_file(&path, HashAlgorithm::Sha512, block_size).unwrap();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "crc32".parse::<HashAlgorithm>().unwrap_err();
        assert!(matches!(err, ReproError::Engine(_)));
        assert!(split_hash("crc32:abcd").is_err());
        assert!(split_hash("no-separator").is_err());
    }

    #[test]
    fn split_roundtrip() {
        let hash = hash_bytes("x", HashAlgorithm::Blake3);
        let (alg, hex) = split_hash(&hash).unwrap();
        assert_eq!(alg, HashAlgorithm::Blake3);
        assert_eq!(hex.len(), 64);
    }
}
