//! Client path validation and chroot rewriting.

use crate::error::{Result, ZkError};

/// Validate a client path before it is sent anywhere.
///
/// Paths must be absolute, must not end with `/` (except the root, or a
/// sequential create where the server appends the suffix), and may not
/// contain empty or relative segments or control/noncharacter code
/// points.
pub fn validate_path(path: &str, sequential: bool) -> Result<()> {
    let invalid = |reason: &'static str| {
        Err(ZkError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return invalid("path is empty");
    }
    if !path.starts_with('/') {
        return invalid("path must start with '/'");
    }
    if path == "/" {
        return Ok(());
    }

    let trimmed = match path.strip_suffix('/') {
        Some(rest) if sequential => rest,
        Some(_) => return invalid("path must not end with '/'"),
        None => path,
    };

    for segment in trimmed[1..].split('/') {
        if segment.is_empty() {
            return invalid("empty segment");
        }
        if segment == "." || segment == ".." {
            return invalid("relative path segment");
        }
        if segment.chars().any(is_forbidden_char) {
            return invalid("forbidden character");
        }
    }
    Ok(())
}

fn is_forbidden_char(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
        || matches!(c, '\u{fdd0}'..='\u{fdef}')
        || (c as u32) & 0xfffe == 0xfffe
}

/// Prefix a client path with the session chroot.
///
/// The result never carries a trailing slash: the root path maps to the
/// chroot itself.
pub fn prepend_chroot(chroot: Option<&str>, client_path: &str) -> String {
    match chroot {
        None | Some("") => client_path.to_string(),
        Some(chroot) if client_path == "/" => chroot.to_string(),
        Some(chroot) => format!("{chroot}{client_path}"),
    }
}

/// Strip the session chroot from a server-side path.
///
/// Idempotent: a path that does not carry the prefix comes back
/// unchanged.
pub fn strip_chroot(chroot: Option<&str>, server_path: &str) -> String {
    match chroot {
        None | Some("") => server_path.to_string(),
        Some(chroot) => match server_path.strip_prefix(chroot) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => server_path.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(path: &str) {
        assert!(validate_path(path, false).is_ok(), "expected {path:?} valid");
    }

    fn bad(path: &str) {
        assert!(
            matches!(validate_path(path, false), Err(ZkError::InvalidPath { .. })),
            "expected {path:?} invalid"
        );
    }

    #[test]
    fn valid_paths() {
        ok("/");
        ok("/a");
        ok("/a/b/c");
        ok("/node-1_x.y");
    }

    #[test]
    fn invalid_paths() {
        bad("");
        bad("relative");
        bad("/a/");
        bad("//b");
        bad("/a//b");
        bad("/a/./b");
        bad("/a/../b");
        bad("/a\u{0}b");
        bad("/a\u{1f}");
        bad("/a\u{7f}");
        bad("/a\u{9f}");
        bad("/a\u{fdd0}");
        bad("/a\u{ffff}b");
    }

    #[test]
    fn sequential_may_end_with_slash() {
        assert!(validate_path("/queue/item-", true).is_ok());
        assert!(validate_path("/queue/", true).is_ok());
        assert!(validate_path("/queue/", false).is_err());
    }

    #[test]
    fn chroot_prepend() {
        assert_eq!(prepend_chroot(None, "/x"), "/x");
        assert_eq!(prepend_chroot(Some("/app"), "/x"), "/app/x");
        assert_eq!(prepend_chroot(Some("/app"), "/"), "/app");
    }

    #[test]
    fn chroot_strip() {
        assert_eq!(strip_chroot(Some("/app"), "/app/x"), "/x");
        assert_eq!(strip_chroot(Some("/app"), "/app"), "/");
        assert_eq!(strip_chroot(None, "/x"), "/x");
        // Prefix absent: unchanged.
        assert_eq!(strip_chroot(Some("/app"), "/other/x"), "/other/x");
        // Prefix must end on a segment boundary.
        assert_eq!(strip_chroot(Some("/app"), "/apple/x"), "/apple/x");
    }

    #[test]
    fn chroot_roundtrip() {
        for chroot in [None, Some("/app"), Some("/a/b")] {
            for path in ["/", "/x", "/x/y-1"] {
                let full = prepend_chroot(chroot, path);
                assert_eq!(strip_chroot(chroot, &full), path);
            }
        }
    }
}
