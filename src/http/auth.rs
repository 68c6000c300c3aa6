//! HTTP Basic authentication against an htpasswd-style file: lines of
//! `user:salted-crypt-hash`. A one-entry cache keyed on
//! `(auth file path, file mtime, username)` avoids rereading the file on
//! every request from the same authenticated client, mirroring thttpd's
//! single-slot credential cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub struct AuthCache {
    entry: Option<CachedAuth>,
}

struct CachedAuth {
    file: PathBuf,
    mtime: SystemTime,
    user: String,
    hash: String,
}

impl AuthCache {
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Looks up `user` in `auth_file`, consulting the cache first. Returns
    /// the stored password hash (still in its crypt form; comparing the
    /// supplied password against it is the caller's job) if the user is
    /// found.
    pub fn lookup(&mut self, auth_file: &Path, user: &str) -> Option<String> {
        let mtime = fs::metadata(auth_file).ok()?.modified().ok()?;

        if let Some(cached) = &self.entry {
            if cached.file == auth_file && cached.mtime == mtime && cached.user == user {
                return Some(cached.hash.clone());
            }
        }

        let text = fs::read_to_string(auth_file).ok()?;
        for line in text.lines() {
            if let Some((u, hash)) = line.split_once(':') {
                if u == user {
                    self.entry = Some(CachedAuth {
                        file: auth_file.to_path_buf(),
                        mtime,
                        user: user.to_string(),
                        hash: hash.to_string(),
                    });
                    return Some(hash.to_string());
                }
            }
        }
        None
    }
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
extern "C" {
    fn crypt(key: *const libc::c_char, salt: *const libc::c_char) -> *mut libc::c_char;
}

/// Verifies `password` against `stored_hash` (a `.htpasswd`-form
/// crypt(3) digest) by re-hashing with the stored hash as the salt and
/// comparing the results. `crypt` is single-threaded-unsafe (it returns a
/// pointer into static storage) so the call is confined to this one
/// function and the result copied out immediately.
#[cfg(unix)]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(key) = std::ffi::CString::new(password) else { return false };
    let Ok(salt) = std::ffi::CString::new(stored_hash) else { return false };
    let computed = unsafe {
        let result = crypt(key.as_ptr(), salt.as_ptr());
        if result.is_null() {
            return false;
        }
        std::ffi::CStr::from_ptr(result).to_string_lossy().into_owned()
    };
    computed == stored_hash
}

#[cfg(not(unix))]
pub fn verify_password(_password: &str, _stored_hash: &str) -> bool {
    false
}

/// Decodes a `Basic <base64>` `Authorization` header value into
/// `(user, password)`.
pub fn decode_basic_credentials(header_value: &str) -> Option<(String, String)> {
    let b64 = header_value.strip_prefix("Basic ")?.trim();
    let decoded = base64_decode(b64)?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

const B64_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let mut val: u32 = 0;
    let mut bits = 0;
    let mut out = Vec::new();
    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        let idx = B64_ALPHABET.iter().position(|&b| b == c)? as u32;
        val = (val << 6) | idx;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((val >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn decodes_basic_header() {
        // "alice:wonderland" base64-encoded
        let header = "Basic YWxpY2U6d29uZGVybGFuZA==";
        let (user, pass) = decode_basic_credentials(header).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "wonderland");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(decode_basic_credentials("Bearer abcdef").is_none());
    }

    #[test]
    fn lookup_finds_and_caches_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("htpasswd");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "alice:$1$salt$hashhashhash").unwrap();
        drop(f);

        let mut cache = AuthCache::new();
        let hash = cache.lookup(&path, "alice").unwrap();
        assert_eq!(hash, "$1$salt$hashhashhash");
        // second lookup should hit the cache (same mtime).
        assert_eq!(cache.lookup(&path, "alice").unwrap(), hash);
        assert!(cache.lookup(&path, "bob").is_none());
    }
}
