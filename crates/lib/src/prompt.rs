//! System prompt for the reasoning backend, built once at startup from the workspace:
//! AGENTS.md (behavior), SOUL.md (persona), memory/MEMORY.md (long-term memory) and the skill list.
//! The date line is separate and rendered per call.

use crate::skills::{compact_skill_list, Skill};
use std::fs;
use std::path::Path;

fn read_non_empty(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Load a workspace file such as AGENTS.md. None when absent or empty.
pub fn load_workspace_file(workspace_dir: Option<&Path>, name: &str) -> Option<String> {
    read_non_empty(&workspace_dir?.join(name))
}

/// Long-term memory blob (`memory/MEMORY.md`).
pub fn load_memory_context(workspace_dir: Option<&Path>) -> Option<String> {
    read_non_empty(&workspace_dir?.join("memory").join("MEMORY.md"))
}

/// "Today's date: YYYY-MM-DD" for `now`.
pub fn date_line<Tz: chrono::TimeZone>(now: &chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("Today's date: {}", now.format("%Y-%m-%d"))
}

/// Date line for the current local day followed by the static `system_prompt`.
pub fn with_current_date(system_prompt: &str) -> String {
    let date = date_line(&chrono::Local::now());
    if system_prompt.is_empty() {
        date
    } else {
        format!("{}\n\n{}", date, system_prompt)
    }
}

/// Build the static part of the system prompt.
pub fn build_system_prompt(workspace_dir: Option<&Path>, skills: &[Skill]) -> String {
    let mut out = String::new();
    for name in ["AGENTS.md", "SOUL.md"] {
        if let Some(ctx) = load_workspace_file(workspace_dir, name) {
            out.push_str(&ctx);
            out.push_str("\n\n");
        }
    }
    if let Some(memory) = load_memory_context(workspace_dir) {
        out.push_str("## Long-term memory\n\n");
        out.push_str(&memory);
        out.push_str("\n\n");
    }
    out.push_str(&compact_skill_list(skills));
    out.trim_end().to_string()
}
