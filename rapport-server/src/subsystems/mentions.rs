//! Mention markup and name-usage detection over raw message content.

use std::sync::OnceLock;

use regex::Regex;

/// Display names shorter than this are too ambiguous to count as name usage
const MIN_NAME_LEN: usize = 3;

fn mention_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?(\d+)>").ok()).as_ref()
}

/// User ids referenced by `<@id>` / `<@!id>` markup, in order of first appearance.
pub fn mention_ids(content: &str) -> Vec<String> {
    let Some(re) = mention_regex() else {
        return Vec::new();
    };
    let mut ids: Vec<String> = Vec::new();
    for caps in re.captures_iter(content) {
        let id = &caps[1];
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

pub fn has_mention(content: &str) -> bool {
    mention_regex().is_some_and(|re| re.is_match(content))
}

/// Merge client-resolved mention ids with markup parsed from `content`.
pub fn collect_mentions(explicit: &[String], content: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in explicit.iter().cloned().chain(mention_ids(content)) {
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Case-insensitive check for `name` appearing as a whole word in `content`.
pub fn uses_name(content: &str, name: &str) -> bool {
    let name = name.trim().to_lowercase();
    if name.chars().count() < MIN_NAME_LEN {
        return false;
    }
    let haystack = content.to_lowercase();
    haystack.match_indices(&name).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
