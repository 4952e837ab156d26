//! NSKeyedArchiver graph codec
//!
//! Archives are plists shaped as `{$archiver, $top, $objects}` where every
//! indirect reference is a `CF$UID` index into the flat `$objects` list.
//! Decoding walks the graph depth-first, memoizing resolved indices so
//! shared references resolve once and reference cycles terminate.
//! Malformed references degrade to warnings and partial output rather than
//! errors.

use std::collections::{HashMap, HashSet};

use plist::Value;
use tracing::warn;

use crate::RemoteXpcError;

const NULL_MARKER: &str = "$null";

/// Decodes an archive from binary plist bytes
pub fn from_bytes(bytes: &[u8]) -> Result<Value, RemoteXpcError> {
    let archive: Value = plist::from_bytes(bytes)?;
    decode(&archive)
}

/// Decodes an archive plist into a native value tree
pub fn decode(archive: &Value) -> Result<Value, RemoteXpcError> {
    let dict = archive
        .as_dictionary()
        .ok_or_else(|| RemoteXpcError::ArchiverDecodeError("archive is not a dictionary".into()))?;

    match dict.get("$archiver").and_then(|x| x.as_string()) {
        Some("NSKeyedArchiver") => {}
        other => {
            return Err(RemoteXpcError::ArchiverDecodeError(format!(
                "unsupported archiver {other:?}"
            )));
        }
    }

    let objects = dict
        .get("$objects")
        .and_then(|x| x.as_array())
        .ok_or_else(|| RemoteXpcError::ArchiverDecodeError("archive has no $objects".into()))?;

    let root = match dict
        .get("$top")
        .and_then(|x| x.as_dictionary())
        .and_then(|x| x.get("root"))
    {
        Some(Value::Uid(uid)) => uid.get(),
        _ => {
            // by convention the first real object is the root
            warn!("Archive has no $top.root, assuming object index 1");
            1
        }
    };

    let mut decoder = Decoder {
        objects,
        memo: HashMap::new(),
        in_progress: HashSet::new(),
    };
    Ok(decoder.resolve(root))
}

struct Decoder<'a> {
    objects: &'a [Value],
    memo: HashMap<u64, Value>,
    in_progress: HashSet<u64>,
}

impl Decoder<'_> {
    fn resolve(&mut self, index: u64) -> Value {
        if let Some(v) = self.memo.get(&index) {
            return v.clone();
        }
        if self.in_progress.contains(&index) {
            warn!("Archive contains a reference cycle at index {index}");
            return Value::String(NULL_MARKER.into());
        }

        let Some(object) = self.objects.get(index as usize) else {
            warn!("Archive reference {index} is out of bounds, returning partial data");
            return Value::String(NULL_MARKER.into());
        };

        self.in_progress.insert(index);
        let resolved = self.resolve_value(object.clone());
        self.in_progress.remove(&index);
        self.memo.insert(index, resolved.clone());
        resolved
    }

    fn resolve_value(&mut self, value: Value) -> Value {
        match value {
            Value::Uid(uid) => self.resolve(uid.get()),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Dictionary(dict) => self.resolve_dictionary(dict),
            other => other,
        }
    }

    fn resolve_dictionary(&mut self, dict: plist::Dictionary) -> Value {
        let keys = dict.get("NS.keys").and_then(|x| x.as_array()).cloned();
        let objects = dict.get("NS.objects").and_then(|x| x.as_array()).cloned();

        match (keys, objects) {
            // keyed container: an NSDictionary
            (Some(keys), Some(objects)) => {
                let mut out = plist::Dictionary::new();
                for (k, v) in keys.iter().zip(objects.iter()) {
                    let key = match self.resolve_value(k.clone()) {
                        Value::String(s) => s,
                        other => format!("{other:?}"),
                    };
                    out.insert(key, self.resolve_value(v.clone()));
                }
                Value::Dictionary(out)
            }
            // ordered container: an NSArray or NSSet
            (None, Some(objects)) => Value::Array(
                objects
                    .into_iter()
                    .map(|v| self.resolve_value(v))
                    .collect(),
            ),
            _ => {
                if let Some(s) = dict.get("NS.string").and_then(|x| x.as_string()) {
                    return Value::String(s.to_string());
                }
                // plain object: chase fields, drop the class reference
                let mut out = plist::Dictionary::new();
                for (k, v) in dict {
                    if k == "$class" {
                        continue;
                    }
                    out.insert(k, self.resolve_value(v));
                }
                Value::Dictionary(out)
            }
        }
    }
}

/// Encodes a native value tree as an archive
pub fn encode(value: Value) -> Value {
    let mut encoder = Encoder {
        objects: vec![Value::String(NULL_MARKER.into())],
        classes: HashMap::new(),
    };
    let root = encoder.add(value);

    let mut top = plist::Dictionary::new();
    top.insert("root".into(), Value::Uid(plist::Uid::new(root)));

    let mut archive = plist::Dictionary::new();
    archive.insert("$version".into(), 100000.into());
    archive.insert("$archiver".into(), "NSKeyedArchiver".into());
    archive.insert("$top".into(), Value::Dictionary(top));
    archive.insert("$objects".into(), Value::Array(encoder.objects));
    Value::Dictionary(archive)
}

/// Encodes a native value tree as binary plist bytes
pub fn to_bytes(value: Value) -> Result<Vec<u8>, RemoteXpcError> {
    let archive = encode(value);
    let mut buf = Vec::new();
    archive.to_writer_binary(&mut buf)?;
    Ok(buf)
}

struct Encoder {
    objects: Vec<Value>,
    classes: HashMap<&'static str, u64>,
}

impl Encoder {
    fn add(&mut self, value: Value) -> u64 {
        match value {
            Value::Dictionary(dict) => {
                let index = self.reserve();
                let mut keys = Vec::new();
                let mut objects = Vec::new();
                for (k, v) in dict {
                    keys.push(Value::Uid(plist::Uid::new(self.add(Value::String(k)))));
                    objects.push(Value::Uid(plist::Uid::new(self.add(v))));
                }
                let class = self.class(
                    "NSDictionary",
                    &["NSDictionary", "NSObject"],
                );

                let mut out = plist::Dictionary::new();
                out.insert("NS.keys".into(), Value::Array(keys));
                out.insert("NS.objects".into(), Value::Array(objects));
                out.insert("$class".into(), Value::Uid(plist::Uid::new(class)));
                self.objects[index as usize] = Value::Dictionary(out);
                index
            }
            Value::Array(items) => {
                let index = self.reserve();
                let objects = items
                    .into_iter()
                    .map(|v| Value::Uid(plist::Uid::new(self.add(v))))
                    .collect();
                let class = self.class("NSArray", &["NSArray", "NSObject"]);

                let mut out = plist::Dictionary::new();
                out.insert("NS.objects".into(), Value::Array(objects));
                out.insert("$class".into(), Value::Uid(plist::Uid::new(class)));
                self.objects[index as usize] = Value::Dictionary(out);
                index
            }
            other => {
                self.objects.push(other);
                (self.objects.len() - 1) as u64
            }
        }
    }

    fn reserve(&mut self) -> u64 {
        self.objects.push(Value::String(NULL_MARKER.into()));
        (self.objects.len() - 1) as u64
    }

    fn class(&mut self, name: &'static str, classes: &[&str]) -> u64 {
        if let Some(&index) = self.classes.get(name) {
            return index;
        }
        let mut entry = plist::Dictionary::new();
        entry.insert("$classname".into(), name.into());
        entry.insert(
            "$classes".into(),
            Value::Array(classes.iter().map(|c| (*c).into()).collect()),
        );
        self.objects.push(Value::Dictionary(entry));
        let index = (self.objects.len() - 1) as u64;
        self.classes.insert(name, index);
        index
    }
}
