//! Skill registry: each skill is a directory with SKILL.md (YAML frontmatter + markdown).
//!
//! Only name and description are read here; the list is handed to the backend's system
//! prompt and never inspected by the gateway core. Skills with `metadata.requires.bins`
//! are only loaded when all listed binaries are on PATH.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A loaded skill registration.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    metadata: Option<SkillMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct SkillMetadata {
    #[serde(default)]
    requires: Option<Requires>,
}

#[derive(Debug, Default, Deserialize)]
struct Requires {
    #[serde(default)]
    bins: Option<Vec<String>>,
}

/// Load skills from `<dir>/<skill>/SKILL.md`, sorted by name. A missing directory yields no skills.
pub fn load_skills(dir: &Path) -> Result<Vec<Skill>> {
    let mut out = Vec::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(_) => return Ok(out),
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        let skill_md = path.join("SKILL.md");
        if !path.is_dir() || !skill_md.exists() {
            continue;
        }
        let content = match std::fs::read_to_string(&skill_md) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("skills: reading {}: {}", skill_md.display(), e);
                continue;
            }
        };
        let (name, description, bins) = parse_frontmatter(&content, &path);
        if let Some(bins) = bins.filter(|b| !b.is_empty()) {
            if !bins.iter().all(|b| bin_on_path(b)) {
                log::debug!("skills: skipping {}: required bins {:?} not all on PATH", name, bins);
                continue;
            }
        }
        out.push(Skill {
            name,
            description,
            path,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Name + description per skill, for the system prompt.
pub fn compact_skill_list(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Available skills\n\n");
    for s in skills {
        out.push_str("- **");
        out.push_str(&s.name);
        out.push_str("**: ");
        out.push_str(if s.description.trim().is_empty() {
            "(no description)"
        } else {
            s.description.trim()
        });
        out.push('\n');
    }
    out
}

fn parse_frontmatter(content: &str, dir: &Path) -> (String, String, Option<Vec<String>>) {
    let mut name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let mut description = String::new();
    let mut bins = None;
    let Some(rest) = content.trim_start().strip_prefix("---") else {
        return (name, description, bins);
    };
    let Some(end) = rest.find("\n---") else {
        return (name, description, bins);
    };
    match serde_yaml::from_str::<SkillFrontmatter>(rest[..end].trim()) {
        Ok(fm) => {
            if let Some(n) = fm.name.filter(|n| !n.trim().is_empty()) {
                name = n;
            }
            description = fm.description.unwrap_or_default();
            bins = fm.metadata.and_then(|m| m.requires).and_then(|r| r.bins);
        }
        Err(e) => log::warn!("skills: bad frontmatter in {}: {}", dir.display(), e),
    }
    (name, description, bins)
}

/// Returns true if the given binary name is found on PATH (or has path separators and exists).
fn bin_on_path(bin: &str) -> bool {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(bin).is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(bin).is_file())
}
