//! 路径访问控制：允许/拒绝列表与通配符匹配。
//!
//! 拒绝列表优先；允许列表为空时放行所有未被拒绝的路径。
//! 不含通配符的模式按路径段前缀匹配，`*` 匹配任意字符序列（可跨段），`?` 匹配单个字符。

#[derive(Clone, Debug, Default)]
pub struct PathAcl {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl PathAcl {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self {
            allow: allow.iter().map(|pattern| normalize(pattern)).collect(),
            deny: deny.iter().map(|pattern| normalize(pattern)).collect(),
        }
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize(path);
        if self
            .deny
            .iter()
            .any(|pattern| pattern_matches(&path, pattern))
        {
            return false;
        }
        self.allow.is_empty()
            || self
                .allow
                .iter()
                .any(|pattern| pattern_matches(&path, pattern))
    }
}

/// 拆分逗号分隔的模式列表。
pub fn parse_pattern_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|pattern| !pattern.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

fn pattern_matches(path: &str, pattern: &str) -> bool {
    if pattern.contains('*') {
        return wildcard_matches(path, pattern);
    }
    if pattern == "/" {
        return true;
    }
    match match_at(path, pattern) {
        Some(end) => end == path.len() || path[end..].starts_with('/'),
        None => false,
    }
}

// 首段锚定在开头，其余片段依次向后查找，结尾不锚定。
fn wildcard_matches(path: &str, pattern: &str) -> bool {
    let mut fragments = pattern.split('*');
    let first = fragments.next().unwrap_or_default();
    let Some(mut offset) = match_at(path, first) else {
        return false;
    };
    for fragment in fragments.filter(|fragment| !fragment.is_empty()) {
        match find_fragment(&path[offset..], fragment) {
            Some(end) => offset += end,
            None => return false,
        }
    }
    true
}

/// 在 `text` 开头匹配 `fragment`，返回消耗的字节数。
fn match_at(text: &str, fragment: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    let mut consumed = 0;
    for expected in fragment.chars() {
        let (index, actual) = chars.next()?;
        if expected != '?' && expected != actual {
            return None;
        }
        consumed = index + actual.len_utf8();
    }
    Some(consumed)
}

fn find_fragment(text: &str, fragment: &str) -> Option<usize> {
    text.char_indices()
        .find_map(|(start, _)| match_at(&text[start..], fragment).map(|len| start + len))
}

#[cfg(test)]
mod tests {
    use super::{PathAcl, parse_pattern_list};

    fn acl(allow: &[&str], deny: &[&str]) -> PathAcl {
        PathAcl::new(
            allow.iter().map(|s| s.to_string()).collect(),
            deny.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn empty_lists_allow_everything() {
        let acl = PathAcl::default();
        assert!(acl.is_allowed("/"));
        assert!(acl.is_allowed("/any/thing"));
    }

    #[test]
    fn deny_overrides_allow() {
        let acl = acl(&["/docs"], &["/docs/secret"]);
        assert!(acl.is_allowed("/docs/readme.md"));
        assert!(!acl.is_allowed("/docs/secret"));
        assert!(!acl.is_allowed("/docs/secret/key.pem"));
        assert!(!acl.is_allowed("/other"));
    }

    #[test]
    fn plain_patterns_match_whole_segments() {
        let acl = acl(&[], &["/private"]);
        assert!(!acl.is_allowed("/private"));
        assert!(!acl.is_allowed("/private/x"));
        assert!(acl.is_allowed("/private2"));
        assert!(acl.is_allowed("/privateer/x"));
    }

    #[test]
    fn star_spans_segments() {
        let star = acl(&[], &["/private/*"]);
        assert!(!star.is_allowed("/private/x"));
        assert!(!star.is_allowed("/private/x/y"));
        assert!(star.is_allowed("/public/x"));

        let nested = acl(&[], &["/foo/*/bar"]);
        assert!(!nested.is_allowed("/foo/x/bar"));
        assert!(!nested.is_allowed("/foo/x/y/bar"));
        assert!(nested.is_allowed("/foo/bar"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let acl = acl(&[], &["/file?.txt"]);
        assert!(!acl.is_allowed("/file1.txt"));
        assert!(!acl.is_allowed("/fileé.txt"));
        assert!(acl.is_allowed("/file.txt"));
        assert!(acl.is_allowed("/file12.txt"));
    }

    #[test]
    fn candidate_paths_are_normalised() {
        let acl = acl(&[], &["/private"]);
        assert!(!acl.is_allowed("private/x"));
        assert!(!acl.is_allowed("/public/../private/x"));
        assert!(!acl.is_allowed("\\private\\x"));
        assert!(!acl.is_allowed("//private//"));
    }

    #[test]
    fn allow_root_pattern_permits_everything() {
        let acl = acl(&["/"], &[]);
        assert!(acl.is_allowed("/"));
        assert!(acl.is_allowed("/deep/path"));
    }

    #[test]
    fn parses_comma_separated_lists() {
        assert_eq!(
            parse_pattern_list(Some(" /a, /b/* ,,")),
            vec!["/a".to_string(), "/b/*".to_string()]
        );
        assert!(parse_pattern_list(None).is_empty());
    }
}
