// Cross-platform shared memory path abstraction
//
// Linux: /dev/shm/softcam (tmpfs - RAM-backed)
// macOS: /tmp/softcam (no /dev/shm)
// Windows: %TEMP%\softcam

use std::path::{Path, PathBuf};

/// Get the default base directory for softcam shared memory
///
/// - Linux: `/dev/shm/softcam` (tmpfs, never touches disk)
/// - macOS: `/tmp/softcam`
/// - Windows: `%TEMP%\softcam`
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/softcam")
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/tmp/softcam")
    }

    #[cfg(target_os = "windows")]
    {
        std::env::temp_dir().join("softcam")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("/tmp/softcam")
    }
}

/// Convert a region name into a safe file name
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// Path of the backing file for the region `name` under `base`
pub fn region_path(base: &Path, name: &str) -> PathBuf {
    base.join(format!("softcam_{}.fb", sanitize_name(name)))
}

/// Path of the lock file guarding replacement and unlinking of region `name`
pub fn lock_path(base: &Path, name: &str) -> PathBuf {
    base.join(format!("softcam_{}.lock", sanitize_name(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_path_stays_in_base() {
        let base = shm_base_dir();
        assert!(!base.as_os_str().is_empty());

        let path = region_path(&base, "../../etc/passwd");
        assert!(path.starts_with(&base));
        assert_eq!(path.parent(), Some(base.as_path()));
        assert_ne!(lock_path(&base, "cam"), region_path(&base, "cam"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("softcam"), "softcam");
        assert_eq!(sanitize_name("cam/0:main"), "cam_0_main");
        assert_eq!(sanitize_name("a b"), "a_b");
    }
}
