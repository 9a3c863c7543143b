use std::path::Path;

use serde_json::{Map, Value};

use super::CandidateRecord;
use crate::edits::EditSpec;
use crate::regions::EllipseRegion;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Everything needed to reproduce or audit one candidate.
pub struct CandidateReceipt<'a> {
    pub job_id: &'a str,
    pub edit: &'a EditSpec,
    pub candidate: &'a CandidateRecord,
    pub region: &'a EllipseRegion,
    pub provider: &'a str,
    pub provider_request: &'a Map<String, Value>,
    pub warnings: &'a [String],
}

pub fn build_receipt(receipt: &CandidateReceipt<'_>, image_path: &Path, receipt_path: &Path) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "job_id".to_string(),
        Value::String(receipt.job_id.to_string()),
    );
    root.insert(
        "edit".to_string(),
        serde_json::to_value(receipt.edit).unwrap_or(Value::Null),
    );
    root.insert(
        "candidate".to_string(),
        serde_json::to_value(receipt.candidate).unwrap_or(Value::Null),
    );
    root.insert(
        "region".to_string(),
        serde_json::to_value(receipt.region).unwrap_or(Value::Null),
    );
    root.insert(
        "provider".to_string(),
        Value::String(receipt.provider.to_string()),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(receipt.provider_request.clone())),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(receipt.warnings.iter().cloned().map(Value::String).collect()),
    );

    let mut artifacts = Map::new();
    artifacts.insert(
        "image_path".to_string(),
        Value::String(image_path.to_string_lossy().to_string()),
    );
    artifacts.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    root.insert("artifacts".to_string(), Value::Object(artifacts));
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Drops inline image payloads so receipts stay small and readable.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => {
            if text.starts_with("data:") {
                Value::String("<omitted>".to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image_bytes" | "data" | "inlinedata" | "inline_data"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
