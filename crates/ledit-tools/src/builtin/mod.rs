// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod edit_file;
mod list_dir;
mod read_file;
mod shell_command;
mod write_file;

pub use edit_file::EditFileTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use shell_command::ShellCommandTool;
pub use write_file::WriteFileTool;

use crate::ToolRegistry;

/// Register the standard tool set.
pub fn register_builtin(registry: &mut ToolRegistry) {
    registry.register(ReadFileTool);
    registry.register(WriteFileTool);
    registry.register(EditFileTool);
    registry.register(ShellCommandTool);
    registry.register(ListDirTool);
}
