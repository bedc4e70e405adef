// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::Tool;

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content. \
         Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    fn required_permissions(&self) -> &[&str] {
        &["fs.write"]
    }

    async fn execute(&self, args: &Value) -> anyhow::Result<String> {
        let path = args["file_path"]
            .as_str()
            .context("missing required parameter 'file_path'")?;
        let content = args["content"]
            .as_str()
            .context("missing required parameter 'content'")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create directory {}", parent.display()))?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("cannot write {path}"))?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }
}
