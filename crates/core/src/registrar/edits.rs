//! Text edits on launcher files.
//!
//! The files are edited textually so comments and unknown keys survive.
//! Every edit returns `None` when the content already has what it would add.

use std::collections::HashSet;
use std::fmt::Write;

use crate::job::InstallJob;

const OWNERSHIP_SECTION: &str = "AdditionalApps:";
const TOKEN_SECTION: &str = "AppTokens:";

/// Adds `app_id` to the `AdditionalApps:` list, creating the section if needed.
pub fn add_owned_app(content: &str, app_id: &str, display_name: &str) -> Option<String> {
    let entry = format!("- {}", app_id);
    if content.lines().any(|line| line.trim() == entry) {
        return None;
    }

    let comment = display_name.replace('\n', " ");
    let addition = format!("# {}\n{}\n", comment.trim(), entry);

    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == OWNERSHIP_SECTION {
            let mut result = String::with_capacity(content.len() + addition.len() + 1);
            result.push_str(&content[..offset]);
            if !line.ends_with('\n') {
                result.push('\n');
            }
            result.push_str(&addition);
            result.push_str(&content[offset..]);
            return Some(result);
        }
    }

    let mut result = content.to_string();
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    if !result.is_empty() {
        result.push('\n');
    }
    result.push_str(OWNERSHIP_SECTION);
    result.push('\n');
    result.push_str(&addition);
    Some(result)
}

/// Adds `app_id: token` under `AppTokens:`, creating the section if needed.
pub fn add_app_token(content: &str, app_id: &str, token: &str) -> Option<String> {
    let key = format!("{}:", app_id);
    let mut in_section = false;
    let mut offset = 0;
    let mut insert_at = None;
    for line in content.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim();
        if line.trim_end() == TOKEN_SECTION {
            in_section = true;
            insert_at = Some((offset, line.ends_with('\n')));
            continue;
        }
        if in_section {
            if !line.starts_with([' ', '\t']) && !trimmed.is_empty() {
                in_section = false;
            } else if trimmed.starts_with(&key) {
                return None;
            }
        }
    }

    let entry = format!("  {} {}\n", key, token.trim());
    match insert_at {
        Some((pos, has_newline)) => {
            let prefix = if has_newline { "" } else { "\n" };
            Some(splice(content, pos, &format!("{}{}", prefix, entry)))
        }
        None => {
            let mut result = content.to_string();
            if !result.is_empty() && !result.ends_with('\n') {
                result.push('\n');
            }
            result.push_str(TOKEN_SECTION);
            result.push('\n');
            result.push_str(&entry);
            Some(result)
        }
    }
}

/// Depot ids that already have a block under `"depots"`.
pub fn existing_depot_ids(content: &str) -> HashSet<String> {
    let mut ids = HashSet::new();
    let mut in_depots = false;
    let mut depth = 0i32;

    for line in content.lines() {
        let trimmed = line.trim();
        if !in_depots {
            if trimmed.eq_ignore_ascii_case("\"depots\"") {
                in_depots = true;
                depth = 0;
            }
            continue;
        }
        match trimmed {
            "{" => depth += 1,
            "}" => {
                depth -= 1;
                if depth <= 0 {
                    in_depots = false;
                }
            }
            _ if depth == 1 => {
                if let Some(id) = quoted(trimmed).filter(|id| id.chars().all(|c| c.is_ascii_digit())) {
                    ids.insert(id.to_string());
                }
            }
            _ => {}
        }
    }
    ids
}

/// Adds `DecryptionKey` entries for depots not yet in the key store.
///
/// Missing `"depots"` or `"Steam"` sections are created inside the
/// `InstallConfigStore > Software > Valve > Steam` nesting.
pub fn add_decryption_keys(content: &str, keys: &[(String, String)]) -> Option<String> {
    let existing = existing_depot_ids(content);
    let mut seen = HashSet::new();
    let fresh: Vec<&(String, String)> = keys
        .iter()
        .filter(|(id, _)| !existing.contains(id) && seen.insert(id.clone()))
        .collect();
    if fresh.is_empty() {
        return None;
    }

    let mut entries = String::new();
    for (depot_id, key) in fresh {
        let _ = write!(
            entries,
            "\t\t\t\t\t\"{}\"\n\t\t\t\t\t{{\n\t\t\t\t\t\t\"DecryptionKey\"\t\t\"{}\"\n\t\t\t\t\t}}\n",
            depot_id, key
        );
    }

    if let Some(pos) = body_start(content, "\"depots\"") {
        return Some(splice(content, pos, &entries));
    }
    let depots = format!("\t\t\t\t\"depots\"\n\t\t\t\t{{\n{}\t\t\t\t}}\n", entries);
    if let Some(pos) = body_start(content, "\"Steam\"") {
        return Some(splice(content, pos, &depots));
    }
    let nested = format!(
        "\t\"Software\"\n\t{{\n\t\t\"Valve\"\n\t\t{{\n\t\t\t\"Steam\"\n\t\t\t{{\n{}\t\t\t}}\n\t\t}}\n\t}}\n",
        depots
    );
    if let Some(pos) = body_start(content, "\"InstallConfigStore\"") {
        return Some(splice(content, pos, &nested));
    }

    let mut result = content.to_string();
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    let _ = write!(result, "\"InstallConfigStore\"\n{{\n{}}}\n", nested);
    Some(result)
}

/// The `appmanifest_<id>.acf` contents for an installed job.
pub fn render_app_manifest(job: &InstallJob) -> String {
    let mut depots = String::new();
    for item in &job.depot_items {
        let _ = write!(
            depots,
            "\t\t\"{}\"\n\t\t{{\n\t\t\t\"manifest\"\t\t\"{}\"\n\t\t\t\"size\"\t\t\"{}\"\n\t\t}}\n",
            item.depot_id, item.manifest_id, item.size_bytes
        );
    }

    format!(
        "\"AppState\"\n{{\n\
         \t\"appid\"\t\t\"{app_id}\"\n\
         \t\"Universe\"\t\t\"1\"\n\
         \t\"name\"\t\t\"{name}\"\n\
         \t\"StateFlags\"\t\t\"4\"\n\
         \t\"installdir\"\t\t\"{folder}\"\n\
         \t\"SizeOnDisk\"\t\t\"{size}\"\n\
         \t\"buildid\"\t\t\"0\"\n\
         \t\"InstalledDepots\"\n\t{{\n{depots}\t}}\n\
         \t\"UserConfig\"\n\t{{\n\
         \t\t\"platform_override_dest\"\t\t\"linux\"\n\
         \t\t\"platform_override_source\"\t\t\"windows\"\n\t}}\n\
         \t\"MountedConfig\"\n\t{{\n\
         \t\t\"platform_override_dest\"\t\t\"linux\"\n\
         \t\t\"platform_override_source\"\t\t\"windows\"\n\t}}\n\
         }}\n",
        app_id = job.app_id,
        name = vdf_escape(&job.display_name),
        folder = vdf_escape(&job.install_folder),
        size = job.declared_bytes(),
        depots = depots,
    )
}

/// Position just past the opening brace (and line break) after `key`.
fn body_start(content: &str, key: &str) -> Option<usize> {
    let key_pos = content.find(key)?;
    let brace = key_pos + content[key_pos..].find('{')?;
    let mut pos = brace + 1;
    let rest = content[pos..].as_bytes();
    if rest.first() == Some(&b'\r') {
        pos += 1;
    }
    if content.as_bytes().get(pos) == Some(&b'\n') {
        pos += 1;
    }
    Some(pos)
}

fn splice(content: &str, pos: usize, insert: &str) -> String {
    let mut result = String::with_capacity(content.len() + insert.len());
    result.push_str(&content[..pos]);
    result.push_str(insert);
    result.push_str(&content[pos..]);
    result
}

fn quoted(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn vdf_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
