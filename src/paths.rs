//! Helpers for the `/`-delimited paths that name znodes.

use crate::error::ErrorKind;

/// Prefix marking a node created with protection. The protection token follows it.
const PROTECTED_PREFIX: &str = "_c_";

/// Width of the suffix the ensemble appends to sequential nodes.
const SEQUENCE_DIGITS: usize = 10;

/// Checks that `path` names a znode.
///
/// Paths are absolute, have no empty, `.` or `..` segments, and do not end in `/` unless they are
/// the root.
pub fn validate(path: &str) -> Result<(), ErrorKind> {
    let bad = |why: &str| Err(ErrorKind::BadArguments(format!("path {:?} {}", path, why)));

    if !path.starts_with('/') {
        return bad("is not absolute");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return bad("ends with '/'");
    }
    if path.contains('\0') {
        return bad("contains a NUL character");
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return bad("contains an empty segment"),
            "." | ".." => return bad("contains a relative segment"),
            _ => {}
        }
    }
    Ok(())
}

/// The parent of `path`. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// The last segment of `path`.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Appends `child` to `parent`.
pub fn join(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Every proper ancestor of `path` except the root, outermost first.
///
/// ```
/// assert_eq!(tokio_curator::paths::ancestors("/a/b/c"), vec!["/a", "/a/b"]);
/// ```
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/')
        .map(|(i, _)| &path[..i])
        .filter(|p| !p.is_empty())
        .collect()
}

/// `path` with the protection token prepended to its last segment.
pub fn protected_path(path: &str, token: &str) -> String {
    join(
        parent(path),
        &format!("{}{}-{}", PROTECTED_PREFIX, token, node_name(path)),
    )
}

/// The child that was created with protection `token`, if any.
pub fn find_protected_child<'a>(children: &'a [String], token: &str) -> Option<&'a str> {
    let prefix = format!("{}{}-", PROTECTED_PREFIX, token);
    children
        .iter()
        .map(String::as_str)
        .find(|child| child.starts_with(&prefix))
}

/// The sequence number the ensemble appended to a sequential node's name.
pub fn sequence_of(name: &str) -> Option<u64> {
    let name = node_name(name);
    if name.len() < SEQUENCE_DIGITS {
        return None;
    }
    let suffix = &name[name.len() - SEQUENCE_DIGITS..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        for ok in ["/", "/a", "/a/b", "/a.b/_c-d", "/curator/test01"] {
            assert_eq!(validate(ok), Ok(()), "{}", ok);
        }
        for bad in ["", "a", "/a/", "//a", "/a//b", "/a/./b", "/..", "/a\0"] {
            assert!(
                matches!(validate(bad), Err(ErrorKind::BadArguments(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn structure() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(node_name("/a/b"), "b");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(ancestors("/a"), Vec::<&str>::new());
        assert_eq!(ancestors("/a/b/c"), vec!["/a", "/a/b"]);
    }

    #[test]
    fn protection() {
        let p = protected_path("/locks/lock-", "1234");
        assert_eq!(p, "/locks/_c_1234-lock-");

        let children = vec![
            "other".to_string(),
            "_c_9999-lock-0000000001".to_string(),
            "_c_1234-lock-0000000002".to_string(),
        ];
        assert_eq!(
            find_protected_child(&children, "1234"),
            Some("_c_1234-lock-0000000002")
        );
        assert_eq!(find_protected_child(&children, "42"), None);
    }

    #[test]
    fn sequences() {
        assert_eq!(sequence_of("/q/item-0000000012"), Some(12));
        assert_eq!(sequence_of("item-0000000000"), Some(0));
        assert_eq!(sequence_of("item-12"), None);
        assert_eq!(sequence_of("/q/item-00000x0012"), None);
    }
}
