// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::Tool;

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text snippet in a file. old_str must match the \
         file exactly and unambiguously; use a longer snippet when the \
         match is not unique."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "old_str": { "type": "string" },
                "new_str": { "type": "string" }
            },
            "required": ["file_path", "old_str", "new_str"],
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
        let old_str = args["old_str"]
            .as_str()
            .context("missing required parameter 'old_str'")?;
        let new_str = args["new_str"]
            .as_str()
            .context("missing required parameter 'new_str'")?;
        if old_str.is_empty() {
            bail!("old_str must not be empty");
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}"))?;

        let matches = text.matches(old_str).count();
        if matches == 0 {
            bail!("old_str not found in {path}");
        }
        if matches > 1 {
            bail!("old_str matches {matches} locations in {path}; provide a longer unique snippet");
        }

        let updated = text.replacen(old_str, new_str, 1);
        tokio::fs::write(path, updated)
            .await
            .with_context(|| format!("cannot write {path}"))?;
        Ok(format!("Edited {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file(content: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn replaces_unique_snippet() {
        let f = tmp_file("fn main() { old(); }\n");
        EditFileTool
            .execute(&json!({
                "file_path": f.path(),
                "old_str": "old();",
                "new_str": "new();"
            }))
            .await
            .unwrap();
        let text = std::fs::read_to_string(f.path()).unwrap();
        assert_eq!(text, "fn main() { new(); }\n");
    }

    #[tokio::test]
    async fn ambiguous_match_is_rejected() {
        let f = tmp_file("x();\nx();\n");
        let err = EditFileTool
            .execute(&json!({
                "file_path": f.path(),
                "old_str": "x();",
                "new_str": "y();"
            }))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("2 locations"));
    }

    #[tokio::test]
    async fn missing_snippet_is_rejected() {
        let f = tmp_file("nothing here\n");
        let err = EditFileTool
            .execute(&json!({
                "file_path": f.path(),
                "old_str": "absent",
                "new_str": "whatever"
            }))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }
}
