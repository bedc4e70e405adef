// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::Tool;

/// Default number of lines returned when the caller does not specify a
/// limit; the model paginates with offset + limit for more.
const DEFAULT_LINE_LIMIT: usize = 400;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Returns up to 400 lines by default; \
         use offset (1-indexed) and limit to paginate large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 400)"
                }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    fn required_permissions(&self) -> &[&str] {
        &["fs.read"]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Value) -> anyhow::Result<String> {
        let path = args["file_path"]
            .as_str()
            .context("missing required parameter 'file_path'")?;
        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"].as_u64().unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}"))?;

        let all: Vec<&str> = text.lines().collect();
        let total = all.len();
        let start = offset - 1;
        let selected: Vec<&str> = all.iter().skip(start).take(limit).copied().collect();
        let shown = selected.len();
        let mut out = selected.join("\n");
        if start + shown < total {
            out.push_str(&format!(
                "\n[... {} more lines; use offset={} to continue]",
                total - start - shown,
                start + shown + 1
            ));
        }
        Ok(out)
    }
}
