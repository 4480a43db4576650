use base64::Engine as _;
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use serde_bencode::value::Value;
use std::collections::{BTreeMap, HashMap};

/// Info-dict keys copied into the record untouched.
pub const PASSTHROUGH_FIELDS: &[&str] = &[
    "private",
    "source",
    "profiles",
    "file-duration",
    "file-media",
    "pieces",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub name: String,
    pub size: u64,
    /// Largest first.
    pub files: Vec<FileEntry>,
    /// Present entries of [`PASSTHROUGH_FIELDS`], verbatim.
    pub extras: BTreeMap<String, Value>,
}

impl TorrentMetadata {
    pub fn is_private(&self) -> bool {
        matches!(self.extras.get("private"), Some(Value::Int(1)))
    }
}

/// Decodes a raw bencoded info dictionary and normalizes it.
pub fn from_info_bytes(raw: &[u8]) -> Option<TorrentMetadata> {
    let value: Value = serde_bencode::from_bytes(raw).ok()?;
    normalize(&value)
}

/// Builds the record for an info dictionary. `None` when it has no name.
pub fn normalize(info: &Value) -> Option<TorrentMetadata> {
    let Value::Dict(info) = info else {
        return None;
    };

    let name = bytes_field(info, b"utf-8.name").or_else(|| bytes_field(info, b"name"))?;
    let name = String::from_utf8_lossy(name).into_owned();

    let (size, files) = match info.get(&b"files"[..]) {
        Some(Value::List(entries)) => {
            let mut files: Vec<FileEntry> = entries.iter().filter_map(file_entry).collect();
            let total = files.iter().map(|f| f.size).sum();
            files.sort_by(|a, b| b.size.cmp(&a.size));
            (total, files)
        }
        _ => {
            let length = length_field(info);
            let file = FileEntry {
                path: name.clone(),
                size: length,
            };
            (length, vec![file])
        }
    };

    let extras = PASSTHROUGH_FIELDS
        .iter()
        .filter_map(|key| {
            info.get(key.as_bytes())
                .map(|v| (key.to_string(), v.clone()))
        })
        .collect();

    Some(TorrentMetadata {
        name,
        size,
        files,
        extras,
    })
}

fn file_entry(entry: &Value) -> Option<FileEntry> {
    let Value::Dict(entry) = entry else {
        return None;
    };
    let path = match entry.get(&b"path"[..]) {
        Some(Value::List(segments)) => segments
            .iter()
            .filter_map(|s| match s {
                Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        _ => String::new(),
    };
    Some(FileEntry {
        path,
        size: length_field(entry),
    })
}

fn bytes_field<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key)? {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

// Missing or negative lengths count as zero.
fn length_field(dict: &HashMap<Vec<u8>, Value>) -> u64 {
    match dict.get(&b"length"[..]) {
        Some(Value::Int(n)) => u64::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

/// JSON view of a bencode value: UTF-8 byte strings become strings, anything
/// else base64.
pub fn bencode_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
        },
        Value::List(items) => serde_json::Value::Array(items.iter().map(bencode_to_json).collect()),
        Value::Dict(entries) => {
            let map: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), bencode_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

// Extras sit next to the fixed fields, the way the record is usually consumed.
impl Serialize for TorrentMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3 + self.extras.len()))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("size", &self.size)?;
        map.serialize_entry("files", &self.files)?;
        for (key, value) in &self.extras {
            map.serialize_entry(key, &bencode_to_json(value))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn file(path: &[&str], length: i64) -> Value {
        dict(vec![
            ("path", Value::List(path.iter().map(|s| bytes(s)).collect())),
            ("length", Value::Int(length)),
        ])
    }

    #[test]
    fn multi_file_sorted_by_size_descending() {
        let info = dict(vec![
            ("name", bytes("X")),
            (
                "files",
                Value::List(vec![file(&["a", "b.txt"], 10), file(&["c.txt"], 30)]),
            ),
        ]);
        let meta = normalize(&info).unwrap();
        assert_eq!(meta.name, "X");
        assert_eq!(meta.size, 40);
        assert_eq!(
            meta.files,
            vec![
                FileEntry {
                    path: "c.txt".into(),
                    size: 30
                },
                FileEntry {
                    path: "a/b.txt".into(),
                    size: 10
                },
            ]
        );
    }

    #[test]
    fn single_file_uses_name_and_length() {
        let info = dict(vec![("name", bytes("Y")), ("length", Value::Int(5))]);
        let meta = normalize(&info).unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(
            meta.files,
            vec![FileEntry {
                path: "Y".into(),
                size: 5
            }]
        );
    }

    #[test]
    fn missing_name_yields_nothing() {
        let info = dict(vec![("length", Value::Int(5))]);
        assert!(normalize(&info).is_none());
        assert!(normalize(&Value::Int(3)).is_none());
    }

    #[test]
    fn utf8_name_wins_over_name() {
        let info = dict(vec![
            ("name", bytes("legacy")),
            ("utf-8.name", bytes("unicode ✓")),
            ("length", Value::Int(1)),
        ]);
        assert_eq!(normalize(&info).unwrap().name, "unicode ✓");
    }

    #[test]
    fn equal_sizes_keep_listed_order() {
        let info = dict(vec![
            ("name", bytes("Z")),
            (
                "files",
                Value::List(vec![file(&["first"], 4), file(&["second"], 4), file(&["big"], 9)]),
            ),
        ]);
        let paths: Vec<String> = normalize(&info)
            .unwrap()
            .files
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["big", "first", "second"]);
    }

    #[test]
    fn passthrough_fields_are_copied_verbatim() {
        let pieces = Value::Bytes(vec![0xff, 0x00, 0x10]);
        let info = dict(vec![
            ("name", bytes("P")),
            ("length", Value::Int(2)),
            ("private", Value::Int(1)),
            ("source", bytes("tracker")),
            ("pieces", pieces.clone()),
            ("piece length", Value::Int(16384)),
        ]);
        let meta = normalize(&info).unwrap();
        assert!(meta.is_private());
        assert_eq!(meta.extras.get("pieces"), Some(&pieces));
        assert_eq!(meta.extras.get("source"), Some(&bytes("tracker")));
        assert!(!meta.extras.contains_key("piece length"));
    }

    #[test]
    fn negative_or_missing_lengths_count_as_zero() {
        let info = dict(vec![
            ("name", bytes("N")),
            (
                "files",
                Value::List(vec![
                    file(&["neg"], -5),
                    dict(vec![("path", Value::List(vec![bytes("nolen")]))]),
                ]),
            ),
        ]);
        let meta = normalize(&info).unwrap();
        assert_eq!(meta.size, 0);
        assert_eq!(meta.files.len(), 2);
    }

    #[test]
    fn decodes_raw_info_bytes() {
        let meta = from_info_bytes(b"d6:lengthi12e4:name5:hello12:piece lengthi16384ee").unwrap();
        assert_eq!(meta.name, "hello");
        assert_eq!(meta.size, 12);
        assert!(from_info_bytes(b"garbage").is_none());
    }

    #[test]
    fn json_view_flattens_extras() {
        let info = dict(vec![
            ("name", bytes("J")),
            ("length", Value::Int(3)),
            ("pieces", Value::Bytes(vec![0xff, 0xfe])),
        ]);
        let json = serde_json::to_value(normalize(&info).unwrap()).unwrap();
        assert_eq!(json["name"], "J");
        assert_eq!(json["size"], 3);
        assert_eq!(json["files"][0]["path"], "J");
        assert_eq!(json["pieces"], "//4=");
    }
}
