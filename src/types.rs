use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The `data` half of a compiled script payload.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Metadata {
    pub fn from_value(value: &Value) -> Self {
        let mut meta = Metadata::default();
        for (k, v) in value.pairs().unwrap_or_default() {
            match k.as_str() {
                Some("version") => meta.version = v.as_int(),
                Some("key") => meta.key = v.as_str().map(String::from),
                _ => {}
            }
        }
        meta
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a directory-wide decompile run.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub decompiled: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed: Vec<FailedFile>,
    /// Files not started: the run was cancelled or the output already existed.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ExtractStats {
    pub files: usize,
    pub dialogue: usize,
    pub strings: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub written: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_from_payload_dict() {
        let data = Value::dict(vec![
            (Value::Str("version".into()), Value::Int(5_003_000)),
            (Value::Str("key".into()), Value::Str("unlocked".into())),
            (Value::Str("extra".into()), Value::None),
        ]);
        assert_eq!(
            Metadata::from_value(&data),
            Metadata {
                version: Some(5_003_000),
                key: Some("unlocked".into()),
            }
        );
        assert_eq!(Metadata::from_value(&Value::None), Metadata::default());
    }

    #[test]
    fn test_report_json_omits_empty_lists() {
        let report = BatchReport {
            decompiled: vec![PathBuf::from("game/script.rpyc")],
            ..BatchReport::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"decompiled":["game/script.rpyc"]}"#);
    }
}
