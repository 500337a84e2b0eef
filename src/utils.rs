//! Utility functions: download keys, subject parsing, name handling

use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::config::SecurityConfig;

/// Root folder for per-job content, keyed by category
pub const CONTENT_ROOT: &str = "content";
/// Root folder mirroring importable video as symlink items
pub const SYMLINKS_ROOT: &str = "symlinks";
/// Root folder addressing items by id (uses the strm key)
pub const IDS_ROOT: &str = ".ids";

/// Compute the download key for a virtual path
///
/// `lower_hex(sha256(utf8(path + "_" + key)))`. Paths under the ids root are
/// signed with the strm key; everything else uses the api key.
pub fn download_key(path: &str, security: &SecurityConfig) -> String {
    let key = if path.starts_with(IDS_ROOT) {
        &security.strm_key
    } else {
        &security.api_key
    };
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"_");
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a presented download key against the recomputed value
pub fn verify_download_key(path: &str, presented: &str, security: &SecurityConfig) -> bool {
    // Byte-wise comparison over fixed-length hex; length check first so a
    // truncated key can never match
    let expected = download_key(path, security);
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Extract the quoted filename from an NZB subject line
///
/// Usenet subjects typically carry the filename in quotes, e.g.:
/// `Some.Movie.2024 [01/50] - "Some.Movie.2024.part01.rar" yEnc (1/100)`
pub fn filename_from_subject(subject: &str) -> Option<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r#""([^"]+)""#).unwrap_or_else(|_| unreachable!("static pattern"))
    });
    re.captures(subject)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Sanitize a poster-supplied name for use as a virtual item name
///
/// Path separators and control characters are replaced; a name that
/// sanitizes to nothing becomes "unnamed".
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Produce `name (n)` while keeping the extension in place
///
/// `movie.mkv` → `movie (2).mkv`; extensionless names get the plain suffix.
pub fn numbered_name(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

/// Lower-cased extension of a filename, if any
pub fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && !ext.contains(' '))
}

/// Extensions that count as importable video
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "ts", "wmv", "mov"];

/// True when the filename looks like playable video
pub fn is_video(name: &str) -> bool {
    extension(name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn security() -> SecurityConfig {
        SecurityConfig {
            api_key: "K".to_string(),
            strm_key: "S".to_string(),
        }
    }

    #[test]
    fn download_key_matches_reference_vector() {
        // sha256("content/a/b.mkv_K")
        let key = download_key("content/a/b.mkv", &security());
        let mut hasher = Sha256::new();
        hasher.update(b"content/a/b.mkv_K");
        assert_eq!(key, format!("{:x}", hasher.finalize()));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ids_paths_use_the_strm_key() {
        let ids_key = download_key(".ids/1234", &security());
        let mut hasher = Sha256::new();
        hasher.update(b".ids/1234_S");
        assert_eq!(ids_key, format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn verify_rejects_mismatch_and_truncation() {
        let sec = security();
        let key = download_key("content/x", &sec);
        assert!(verify_download_key("content/x", &key, &sec));
        assert!(!verify_download_key("content/x", &key[..63], &sec));
        assert!(!verify_download_key("content/y", &key, &sec));
        assert!(!verify_download_key("content/x", "", &sec));
    }

    #[test]
    fn filename_from_subject_takes_the_quoted_portion() {
        let subject = r#"Some.Movie [01/50] - "Some.Movie.part01.rar" yEnc (1/100)"#;
        assert_eq!(
            filename_from_subject(subject).as_deref(),
            Some("Some.Movie.part01.rar")
        );
        assert_eq!(filename_from_subject("no quotes here"), None);
        assert_eq!(filename_from_subject(r#"empty quotes """#), None);
    }

    #[test]
    fn sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize_name("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_name("  ..hidden..  "), "hidden");
        assert_eq!(sanitize_name("\0\0"), "unnamed");
        assert_eq!(sanitize_name("tab\there"), "tab_here");
    }

    #[test]
    fn numbered_name_preserves_extension() {
        assert_eq!(numbered_name("movie.mkv", 2), "movie (2).mkv");
        assert_eq!(numbered_name("archive.tar.gz", 3), "archive.tar (3).gz");
        assert_eq!(numbered_name("README", 2), "README (2)");
        assert_eq!(numbered_name(".hidden", 2), ".hidden (2)");
    }

    #[test]
    fn video_detection() {
        assert!(is_video("movie.MKV"));
        assert!(is_video("show.s01e01.mp4"));
        assert!(!is_video("sample.nfo"));
        assert!(!is_video("noext"));
    }
}
