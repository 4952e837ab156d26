//! Tolerant plist parsing and emission
//!
//! Devices occasionally prefix plist payloads with stray bytes, repeat the
//! XML declaration, or splice U+FFFD replacement runs into the body. The
//! recovery path here cleans those up before handing the bytes to the plist
//! parser. Recoveries are logged at debug level and never fatal on their own.

use tracing::debug;

use crate::RemoteXpcError;

const XML_MARKER: &[u8] = b"<?xml";
const PLIST_MARKER: &[u8] = b"<plist";
const BPLIST_MARKER: &[u8] = b"bplist";

/// Returns true when the buffer starts a binary plist
///
/// The `bplist` magic (optionally prefixed, e.g. by an `I` from a partial
/// frame) must appear within the first nine bytes.
pub fn is_binary_plist(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(9)];
    window
        .windows(BPLIST_MARKER.len())
        .any(|w| w == BPLIST_MARKER)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strips leading garbage up to the first plist marker
///
/// Returns the cleaned slice, or the input unchanged when no marker exists.
fn strip_leading_garbage(bytes: &[u8]) -> &[u8] {
    let start = [XML_MARKER, PLIST_MARKER, BPLIST_MARKER]
        .iter()
        .filter_map(|m| find(bytes, m))
        .min();
    match start {
        Some(0) | None => bytes,
        Some(n) => {
            debug!("Discarding {n} bytes of leading garbage before plist");
            &bytes[n..]
        }
    }
}

/// Collapses repeated XML declarations down to the first
fn collapse_declarations(body: &[u8]) -> Vec<u8> {
    let Some(first) = find(body, XML_MARKER) else {
        return body.to_vec();
    };
    let after_first = match find(&body[first..], b"?>") {
        Some(end) => first + end + 2,
        None => return body.to_vec(),
    };

    let mut out = body[..after_first].to_vec();
    let mut rest = &body[after_first..];
    while let Some(decl) = find(rest, XML_MARKER) {
        out.extend_from_slice(&rest[..decl]);
        match find(&rest[decl..], b"?>") {
            Some(end) => {
                debug!("Collapsing duplicate XML declaration");
                rest = &rest[decl + end + 2..];
            }
            None => {
                rest = &rest[decl + XML_MARKER.len()..];
            }
        }
    }
    out.extend_from_slice(rest);
    out
}

/// Cuts U+FFFD replacement runs back to the nearest enclosing tag boundary
fn trim_replacement_runs(body: Vec<u8>) -> Vec<u8> {
    const FFFD: &[u8] = "\u{FFFD}".as_bytes();
    if find(&body, FFFD).is_none() {
        return body;
    }

    debug!("Plist body contains U+FFFD replacement characters, trimming at tag boundaries");
    let text = String::from_utf8_lossy(&body);
    let mut out = String::with_capacity(text.len());
    for segment in text.split('\u{FFFD}') {
        // keep only up to the last complete tag of the preceding segment
        // and from the first tag open of the following one
        if out.is_empty() {
            match segment.rfind('>') {
                Some(p) => out.push_str(&segment[..=p]),
                None => out.push_str(segment),
            }
        } else {
            match segment.find('<') {
                Some(p) => out.push_str(&segment[p..]),
                None => {}
            }
        }
    }
    out.into_bytes()
}

/// Parses a plist from possibly-dirty bytes
///
/// Binary plists are detected and delegated to the binary decoder; XML
/// bodies run through the recovery pipeline first.
pub fn from_bytes_tolerant(bytes: &[u8]) -> Result<plist::Value, RemoteXpcError> {
    let bytes = strip_leading_garbage(bytes);

    if is_binary_plist(bytes) {
        let start = find(bytes, BPLIST_MARKER).unwrap_or(0);
        return Ok(plist::from_bytes(&bytes[start..])?);
    }

    match plist::from_bytes(bytes) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            let cleaned = trim_replacement_runs(collapse_declarations(bytes));
            match plist::from_bytes(&cleaned) {
                Ok(v) => {
                    debug!("Plist parsed after recovery pass");
                    Ok(v)
                }
                Err(_) => Err(first_err.into()),
            }
        }
    }
}

/// Emits a value as an XML plist
///
/// Dictionary keys keep insertion order; binary data is emitted as
/// unwrapped base64 and strings are XML-escaped, both courtesy of the
/// plist serializer.
pub fn to_xml_bytes(value: &plist::Value) -> Result<Vec<u8>, RemoteXpcError> {
    let mut buf = Vec::new();
    value.to_writer_xml(&mut buf)?;
    Ok(buf)
}
