//! File classification heuristics
//!
//! Resolved files are grouped `{rar, 7z, multipart-mkv, other}` by filename
//! patterns; par2 descriptors are recognized earlier and never registered.

use std::sync::OnceLock;

/// How a resolved file participates in processing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Parity descriptor (consumed for metadata, never registered)
    Par2,
    /// RAR volume within a set; `volume` orders the set
    Rar {
        /// Set key (volumes of one archive share it)
        set: String,
        /// Volume ordinal within the set
        volume: u32,
    },
    /// 7z volume within a set
    SevenZip {
        /// Set key
        set: String,
        /// Volume ordinal within the set
        volume: u32,
    },
    /// `.mkv.001`-style split video
    MultipartMkv {
        /// Set key (the `.mkv` base name)
        set: String,
        /// Volume ordinal within the set
        volume: u32,
    },
    /// Anything else; registered as a plain file
    Other,
}

/// Classify a resolved filename
pub fn classify(name: &str) -> FileKind {
    let lower = name.to_ascii_lowercase();

    if lower.ends_with(".par2") {
        return FileKind::Par2;
    }

    // movie.part01.rar / movie.part001.rar
    if let Some(caps) = part_rar_re().captures(&lower) {
        let set = name[..caps.get(0).map_or(0, |m| m.start())].to_string();
        let volume: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);
        return FileKind::Rar { set, volume };
    }

    // movie.rar (first volume of old-style sets)
    if let Some(stem) = lower.strip_suffix(".rar") {
        return FileKind::Rar {
            set: name[..stem.len()].to_string(),
            volume: 1,
        };
    }

    // movie.r00, movie.r01, ... (old-style continuation volumes)
    if let Some(caps) = rnn_re().captures(&lower) {
        let set = name[..caps.get(0).map_or(0, |m| m.start())].to_string();
        let volume: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        return FileKind::Rar {
            set,
            volume: volume + 2,
        };
    }

    // archive.7z.001, archive.7z.002, ...
    if let Some(caps) = sevenz_vol_re().captures(&lower) {
        let set = name[..caps.get(0).map_or(0, |m| m.start())].to_string();
        let volume: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);
        return FileKind::SevenZip { set, volume };
    }

    // archive.7z
    if let Some(stem) = lower.strip_suffix(".7z") {
        return FileKind::SevenZip {
            set: name[..stem.len()].to_string(),
            volume: 1,
        };
    }

    // movie.mkv.001, movie.mkv.002, ...
    if let Some(caps) = mkv_vol_re().captures(&lower) {
        let set = name[..caps.get(0).map_or(0, |m| m.start()) + 4].to_string();
        let volume: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);
        return FileKind::MultipartMkv { set, volume };
    }

    FileKind::Other
}

/// True when a name looks machine-generated rather than descriptive
///
/// Used to decide whether a PAR2 descriptor name or the mount folder's name
/// should replace it.
pub fn is_probably_obfuscated(name: &str) -> bool {
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    if stem.len() < 16 {
        return false;
    }
    // Long run of one character class with no separators reads as random
    let has_separators = stem.contains(['.', ' ', '-', '_']);
    let hexish = stem.chars().all(|c| c.is_ascii_hexdigit());
    let base64ish = stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '=');
    !has_separators && (hexish || (base64ish && stem.len() >= 24))
}

fn part_rar_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\.part(\d{1,4})\.rar$").unwrap_or_else(|_| unreachable!())
    })
}

fn rnn_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\.r(\d{2,3})$").unwrap_or_else(|_| unreachable!()))
}

fn sevenz_vol_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\.7z\.(\d{1,4})$").unwrap_or_else(|_| unreachable!()))
}

fn mkv_vol_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\.mkv\.(\d{1,4})$").unwrap_or_else(|_| unreachable!()))
}
