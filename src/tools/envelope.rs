// Response Envelope & PACK Form
// Every tool answers `{ok, tool, target?, meta, ...payload}`; errors carry
// `{code, message, hint, client_action}`. The compact PACK1 form is derived
// deterministically from the JSON envelope (sorted keys, URL-encoded
// values), so the two forms always agree and tests can assert equivalence.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::SariError;
use crate::observability::MetricsSnapshot;

/// Stabilization block attached to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stabilization {
    pub budget_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_next_action: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reason_codes: Vec<String>,
    pub metrics_snapshot: MetricsSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub next_calls: Vec<String>,
}

impl Stabilization {
    pub fn ok() -> Self {
        Self {
            budget_state: "ok".to_string(),
            metrics_snapshot: crate::observability::metrics_snapshot(),
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, code: &str, message: impl Into<String>) -> Self {
        self.reason_codes.push(code.to_string());
        self.warnings.push(message.into());
        self
    }
}

/// Successful envelope. `payload` fields are merged at the top level.
pub fn ok_envelope(
    tool: &str,
    target: Option<&str>,
    payload: Value,
    stabilization: Stabilization,
) -> Value {
    let mut envelope = Map::new();
    envelope.insert("ok".to_string(), Value::Bool(true));
    envelope.insert("tool".to_string(), Value::String(tool.to_string()));
    if let Some(target) = target {
        envelope.insert("target".to_string(), Value::String(target.to_string()));
    }
    if let Value::Object(fields) = payload {
        for (key, value) in fields {
            envelope.insert(key, value);
        }
    }
    let mut meta = envelope
        .remove("meta")
        .and_then(|m| match m {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default();
    meta.insert(
        "stabilization".to_string(),
        serde_json::to_value(&stabilization).unwrap_or(Value::Null),
    );
    envelope.insert("meta".to_string(), Value::Object(meta));
    Value::Object(envelope)
}

/// Error envelope.
pub fn err_envelope(tool: &str, error: &SariError, stabilization: Stabilization) -> Value {
    let mut stabilization = stabilization;
    stabilization
        .reason_codes
        .push(error.code.as_str().to_string());
    json!({
        "ok": false,
        "tool": tool,
        "error": {
            "code": error.code.as_str(),
            "message": error.message,
            "hint": error.hint,
            "client_action": error.client_action,
        },
        "meta": { "stabilization": stabilization },
    })
}

/// Percent-encode everything outside RFC 3986 unreserved.
fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn url_decode(raw: &str) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Derive the line-framed PACK1 form from a JSON envelope.
///
/// Header: `PACK1 <tool> key=value ...` (scalar top-level fields, sorted).
/// Body: one `type:payload` line per array element (arrays keep their
/// field name as the type) and one per non-scalar field.
pub fn to_pack(envelope: &Value) -> String {
    let Value::Object(fields) = envelope else {
        return "PACK1 invalid".to_string();
    };
    let tool = fields
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let mut header_pairs: Vec<(String, String)> = Vec::new();
    let mut lines: Vec<String> = Vec::new();

    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    for key in keys {
        if key == "tool" {
            continue;
        }
        let value = &fields[key.as_str()];
        match value {
            Value::Null => {}
            Value::Bool(_) | Value::Number(_) => {
                header_pairs.push((key.clone(), value.to_string()));
            }
            Value::String(s) => header_pairs.push((key.clone(), url_encode(s))),
            Value::Array(items) => {
                let singular = key.trim_end_matches('s');
                for item in items {
                    lines.push(format!(
                        "{singular}:{}",
                        url_encode(&serde_json::to_string(item).unwrap_or_default())
                    ));
                }
            }
            Value::Object(_) => {
                lines.push(format!(
                    "{key}:{}",
                    url_encode(&serde_json::to_string(value).unwrap_or_default())
                ));
            }
        }
    }

    let header = std::iter::once(format!("PACK1 {tool}"))
        .chain(header_pairs.iter().map(|(k, v)| format!("{k}={v}")))
        .collect::<Vec<_>>()
        .join(" ");
    std::iter::once(header)
        .chain(lines)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode a PACK1 document back into the JSON fields it was derived from.
/// Used by tests to assert PACK/JSON equivalence.
pub fn from_pack(pack: &str) -> Option<Value> {
    let mut lines = pack.lines();
    let header = lines.next()?;
    let mut parts = header.split(' ');
    if parts.next()? != "PACK1" {
        return None;
    }
    let tool = parts.next()?;

    let mut fields = Map::new();
    fields.insert("tool".to_string(), Value::String(tool.to_string()));
    for pair in parts {
        let (key, raw) = pair.split_once('=')?;
        let decoded = url_decode(raw);
        let value = serde_json::from_str::<Value>(&decoded)
            .ok()
            .filter(|v| v.is_boolean() || v.is_number())
            .unwrap_or(Value::String(decoded));
        fields.insert(key.to_string(), value);
    }
    for line in lines {
        let (kind, raw) = line.split_once(':')?;
        let item: Value = serde_json::from_str(&url_decode(raw)).ok()?;
        if let Some(Value::Array(existing)) = fields.get_mut(&format!("{kind}s")) {
            existing.push(item);
        } else if kind == "meta" {
            fields.insert(kind.to_string(), item);
        } else {
            fields.insert(format!("{kind}s"), Value::Array(vec![item]));
        }
    }
    Some(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ok_envelope_shape() {
        let envelope = ok_envelope(
            "search",
            Some("login"),
            json!({"matches": [{"path": "a.py"}], "meta": {"total": 1}}),
            Stabilization::ok(),
        );
        assert_eq!(envelope["ok"], json!(true));
        assert_eq!(envelope["tool"], json!("search"));
        assert_eq!(envelope["target"], json!("login"));
        assert_eq!(envelope["meta"]["total"], json!(1));
        assert_eq!(
            envelope["meta"]["stabilization"]["budget_state"],
            json!("ok")
        );
    }

    #[test]
    fn test_err_envelope_carries_code_and_reason() {
        let error = SariError::new(ErrorCode::SearchRefRequired, "read requires a candidate ref")
            .with_hint("run search first");
        let envelope = err_envelope("read", &error, Stabilization::ok());
        assert_eq!(envelope["ok"], json!(false));
        assert_eq!(envelope["error"]["code"], json!("SEARCH_REF_REQUIRED"));
        let codes = envelope["meta"]["stabilization"]["reason_codes"]
            .as_array()
            .expect("reason codes");
        assert!(codes.contains(&json!("SEARCH_REF_REQUIRED")));
    }

    #[test]
    fn test_pack_round_trip_preserves_fields() {
        let envelope = ok_envelope(
            "search",
            None,
            json!({
                "matches": [
                    {"path": "00112233aabbccdd/a.py", "score": 1.5},
                    {"path": "00112233aabbccdd/b py.py", "score": 0.5},
                ],
            }),
            Stabilization::ok(),
        );
        let pack = to_pack(&envelope);
        assert!(pack.starts_with("PACK1 search "));
        assert!(pack.lines().count() >= 3);

        let decoded = from_pack(&pack).expect("decodable");
        assert_eq!(decoded["tool"], json!("search"));
        assert_eq!(decoded["ok"], json!(true));
        let matches = decoded["matches"].as_array().expect("matches");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["path"], envelope["matches"][0]["path"]);
        // Values with spaces survive the URL encoding.
        assert_eq!(matches[1]["path"], json!("00112233aabbccdd/b py.py"));
    }

    #[test]
    fn test_pack_is_deterministic() {
        let envelope = ok_envelope("status", None, json!({"b": 1, "a": 2}), Stabilization::ok());
        assert_eq!(to_pack(&envelope), to_pack(&envelope));
    }

    #[test]
    fn test_url_encoding_round_trip() {
        let raw = "a b/c%d\nê";
        assert_eq!(url_decode(&url_encode(raw)), raw);
    }
}
