//! Percent-decoding, path canonicalization, and filesystem resolution:
//! turning a request's raw URL into an absolute path under the document
//! root with `../` escapes rejected rather than silently absorbed.

use std::path::{Path, PathBuf};

/// Percent-decodes `%XX` escapes in place. Invalid escapes (not two hex
/// digits) pass through the `%` literally, the same tolerance thttpd's
/// `strdecode` shows.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Canonicalizes a decoded URL path: collapses `//`, strips leading `./`
/// and interior `/./`, and resolves `../` by popping the preceding
/// component off a component stack. Unlike thttpd's C `de_dotdot` (which
/// just deletes a `../` that has nothing to pop against), a `../` with an
/// empty stack is pushed onto the stack as-is, so the caller can detect
/// and reject the escape with [`escapes_root`] instead of having it
/// silently disappear.
pub fn de_dotdot(input: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for component in input.split('/') {
        match component {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&top) if top != ".." => {
                    stack.pop();
                }
                _ => stack.push(".."),
            },
            c => stack.push(c),
        }
    }
    stack.join("/")
}

/// A canonicalized path that is exactly `..` or begins with `../` still
/// carries an unresolved escape above the root and must be rejected with
/// 400. (A leading `/` cannot occur here since [`de_dotdot`] never
/// reintroduces one.)
pub fn escapes_root(canonicalized: &str) -> bool {
    canonicalized.starts_with('/') || canonicalized == ".." || canonicalized.starts_with("../")
}

/// Joins a decoded, canonicalized URL path onto a document root, asserting
/// the result remains inside the root even after symlink resolution (when
/// `symlink_check` is set) — this is the boundary that keeps a cleverly
/// constructed path from walking a symlink outside the site.
pub fn resolve_under_root(root: &Path, url_path: &str, symlink_check: bool) -> Option<PathBuf> {
    let trimmed = url_path.trim_start_matches('/');
    let candidate = if trimmed.is_empty() {
        root.to_path_buf()
    } else {
        root.join(trimmed)
    };

    if !symlink_check {
        return Some(candidate);
    }

    let root_canon = root.canonicalize().ok()?;
    let mut check = candidate.clone();
    loop {
        if let Ok(canon) = check.canonicalize() {
            return if canon.starts_with(&root_canon) {
                Some(candidate)
            } else {
                None
            };
        }
        if !check.pop() {
            return Some(candidate);
        }
    }
}

/// Expands a leading `~user` into `<home>/<postfix>` and reports that the
/// request is tilde-mapped (which disables virtual-host prefixing for the
/// rest of resolution).
pub fn expand_tilde(url_path: &str, postfix: &str) -> Option<(String, String)> {
    let rest = url_path.strip_prefix('~')?;
    let (user, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if user.is_empty() {
        return None;
    }
    let home = lookup_home_dir(user)?;
    let mapped = format!("{}/{}{}", home, postfix.trim_matches('/'), tail);
    Some((mapped, user.to_string()))
}

#[cfg(unix)]
fn lookup_home_dir(user: &str) -> Option<String> {
    use std::ffi::CString;
    let cuser = CString::new(user).ok()?;
    unsafe {
        let pw = libc::getpwnam(cuser.as_ptr());
        if pw.is_null() {
            return None;
        }
        let dir = std::ffi::CStr::from_ptr((*pw).pw_dir);
        Some(dir.to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
fn lookup_home_dir(_user: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_double_slash() {
        assert_eq!(de_dotdot("/a//b///c"), "a/b/c");
    }

    #[test]
    fn strips_leading_dot_slash() {
        assert_eq!(de_dotdot("./a/./b"), "a/b");
    }

    #[test]
    fn collapses_parent_refs() {
        assert_eq!(de_dotdot("a/b/../c"), "a/c");
    }

    #[test]
    fn trailing_dotdot() {
        assert_eq!(de_dotdot("a/b/.."), "a");
    }

    #[test]
    fn traversal_escape_is_rejected() {
        let decoded = percent_decode("/%2e%2e/%2e%2e/etc/passwd");
        assert_eq!(decoded, "/../../etc/passwd");
        let canon = de_dotdot(&decoded);
        assert!(escapes_root(&canon));
    }

    #[test]
    fn ordinary_path_is_not_rejected() {
        let canon = de_dotdot("/etc/passwd");
        assert!(!escapes_root(&canon));
    }

    #[test]
    fn percent_decode_handles_escapes() {
        assert_eq!(percent_decode("%2e%2e%2fpasswd"), "../passwd");
        assert_eq!(percent_decode("100%"), "100%");
    }
}
