use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a forward-slash relative sync path under the local sync root.
pub fn local_path_for(root: &Path, rel_path: &str) -> Result<PathBuf, PathError> {
    if rel_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Relative name of the partial file a download streams into.
pub fn download_tmp_name(rel_path: &str) -> String {
    match rel_path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{stem}.{ext}.partial")
        }
        _ => format!("{rel_path}.partial"),
    }
}

/// Name for the renamed-away local copy when both sides changed. The tag
/// goes before the extension so the copy keeps its file type association.
pub fn conflict_file_name(rel_path: &str, stamp: i64) -> String {
    let (parent, name) = match rel_path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, rel_path),
    };

    let tagged = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_conflict-{stamp}.{ext}"),
        _ => format!("{name}_conflict-{stamp}"),
    };

    match parent {
        Some(parent) => format!("{parent}/{tagged}"),
        None => tagged,
    }
}

pub fn parent_path(rel_path: &str) -> Option<&str> {
    rel_path
        .trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
}

/// 64-bit Jenkins hash of the UTF-8 path, primary key of the metadata table.
/// Must stay bit-compatible with existing journals.
pub fn path_hash(path: &str) -> i64 {
    jhash64(path.as_bytes(), 0) as i64
}

fn jhash64(key: &[u8], initval: u64) -> u64 {
    let mut a = initval;
    let mut b = initval;
    let mut c: u64 = 0x9e37_79b9_7f4a_7c13;

    let mut blocks = key.chunks_exact(24);
    for block in &mut blocks {
        a = a.wrapping_add(word(&block[0..8]));
        b = b.wrapping_add(word(&block[8..16]));
        c = c.wrapping_add(word(&block[16..24]));
        mix64(&mut a, &mut b, &mut c);
    }

    let tail = blocks.remainder();
    c = c.wrapping_add(key.len() as u64);
    if !tail.is_empty() {
        a = a.wrapping_add(word(&tail[..tail.len().min(8)]));
    }
    if tail.len() > 8 {
        b = b.wrapping_add(word(&tail[8..tail.len().min(16)]));
    }
    if tail.len() > 16 {
        // the low byte of c is reserved for the length
        c = c.wrapping_add(word(&tail[16..]) << 8);
    }
    mix64(&mut a, &mut b, &mut c);
    c
}

fn word(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(out)
}

fn mix64(a: &mut u64, b: &mut u64, c: &mut u64) {
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 43);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 9);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 8);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 38);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 23);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 5);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 35);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 49);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 11);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 12);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 18);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 22);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_path_under_root() {
        let root = PathBuf::from("/sync");
        let mapped = local_path_for(&root, "Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/sync/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
    }

    #[test]
    fn tmp_name_keeps_extension_visible() {
        assert_eq!(download_tmp_name("Docs/A.txt"), "Docs/A.txt.partial");
        assert_eq!(download_tmp_name("Docs/README"), "Docs/README.partial");
    }

    #[test]
    fn conflict_name_tags_before_the_extension() {
        assert_eq!(
            conflict_file_name("Docs/A.txt", 17),
            "Docs/A_conflict-17.txt"
        );
        assert_eq!(conflict_file_name("README", 17), "README_conflict-17");
        assert_eq!(
            conflict_file_name("Docs/.hidden", 17),
            "Docs/.hidden_conflict-17"
        );
    }

    #[test]
    fn parent_of_nested_path() {
        assert_eq!(parent_path("Docs/Sub/A.txt"), Some("Docs/Sub"));
        assert_eq!(parent_path("A.txt"), None);
    }

    #[test]
    fn path_hash_is_stable_and_distinguishes_paths() {
        let a = path_hash("Docs/A.txt");
        assert_eq!(a, path_hash("Docs/A.txt"));
        assert_ne!(a, path_hash("Docs/B.txt"));
        assert_ne!(a, path_hash("docs/a.txt"));
        // long paths exercise the 24-byte block loop
        let long = "very/long/directory/name/with/many/components/file.bin";
        assert_eq!(path_hash(long), path_hash(long));
        assert_ne!(path_hash(long), a);
    }
}
