//! Host layout and defaults.
//!
//! Settings come from an env-style file (`/etc/firecracker.env` by default)
//! and are then overridden by process environment variables with the same
//! keys.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fcm_core::VmName;

use crate::ExecutorError;

/// Default settings file.
pub const DEFAULT_ENV_FILE: &str = "/etc/firecracker.env";

/// Kernel file name patterns offered by [`Settings::list_kernels`].
const KERNEL_PREFIXES: [&str; 4] = ["vmlinux", "bzImage", "kernel", "Image"];

/// Base image extensions offered by [`Settings::list_images`].
const IMAGE_EXTENSIONS: [&str; 6] = ["ext4", "ext3", "ext2", "img", "qcow2", "raw"];

/// Every key [`Settings::apply`] understands.
pub const KEYS: [&str; 19] = [
    "FIRECRACKER_BIN",
    "KERNEL_PATH",
    "IMAGES_PATH",
    "ROOTFS_PATH",
    "SOCKET_PATH_PREFIX",
    "CACHE_DIR",
    "SUPERVISOR_CONF_DIR",
    "LOG_DIR",
    "TAP_PREFIX",
    "USE_SUDO",
    "MMDS_ADDRESS",
    "BOOT_ARGS",
    "READY_TIMEOUT_SECS",
    "COMMAND_TIMEOUT_SECS",
    "KERNEL",
    "IMAGE",
    "ROOTFS_SIZE",
    "CPUS",
    "MEMORY",
];

/// Values used by `create` when the caller leaves a field out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateDefaults {
    pub kernel: Option<String>,
    pub image: Option<String>,
    pub rootfs_size: Option<String>,
    pub cpus: Option<u8>,
    pub memory: Option<u32>,
}

/// Host paths, tool options and timeouts.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Settings {
    pub firecracker_bin: PathBuf,
    pub kernel_dir: PathBuf,
    pub images_dir: PathBuf,
    pub rootfs_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub supervisor_conf_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tap_prefix: String,
    /// Prefix privileged host commands with `sudo -n`.
    pub use_sudo: bool,
    pub mmds_address: Ipv4Addr,
    pub boot_args: String,
    /// Upper bound for the API socket to come up.
    pub ready_timeout: Duration,
    /// Upper bound for any external command or API call.
    pub command_timeout: Duration,
    pub defaults: CreateDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        let base = PathBuf::from("/var/lib/firecracker");
        Self {
            firecracker_bin: PathBuf::from("/usr/sbin/firecracker"),
            kernel_dir: base.join("kernels"),
            images_dir: base.join("images"),
            rootfs_dir: base.join("rootfs"),
            socket_dir: PathBuf::from("/var/run/firecracker"),
            cache_dir: base.join("cache"),
            supervisor_conf_dir: PathBuf::from("/etc/supervisor/conf.d"),
            log_dir: PathBuf::from("/var/log"),
            tap_prefix: "tap".to_owned(),
            use_sudo: true,
            mmds_address: Ipv4Addr::new(169, 254, 169, 254),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_owned(),
            ready_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            defaults: CreateDefaults::default(),
        }
    }
}

/// Parses `KEY=VALUE` lines. Blank lines and `#` comments, including
/// trailing ones, are dropped; surrounding quotes are removed.
#[must_use]
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.split('#').next().unwrap_or_default().trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_owned(), value.to_owned()))
        })
        .collect()
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, ExecutorError> {
    value
        .parse()
        .map_err(|_| ExecutorError::Validation(format!("{key}: '{value}' is not a valid number")))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

impl Settings {
    /// Loads settings from `env_file` (if it exists) and the process
    /// environment.
    ///
    /// A missing default file is fine; a missing file passed explicitly is not.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Validation`] for malformed values and
    /// [`ExecutorError::Io`] if an explicit file cannot be read.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ExecutorError> {
        let mut settings = Self::default();
        let (path, required) = match env_file {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_ENV_FILE), false),
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                settings.apply_all(parse_env_file(&text))?;
                tracing::debug!(file = %path.display(), "settings file loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {}
            Err(e) => return Err(e.into()),
        }
        let overrides = KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_owned(), v)));
        settings.apply_all(overrides)?;
        Ok(settings)
    }

    /// Applies every pair in order.
    ///
    /// # Errors
    /// Stops at the first malformed value.
    pub fn apply_all<I>(&mut self, pairs: I) -> Result<(), ExecutorError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in pairs {
            self.apply(&key, &value)?;
        }
        Ok(())
    }

    /// Sets the field named by `key`. Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Validation`] if `value` does not parse.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ExecutorError> {
        let value = value.trim();
        match key {
            "FIRECRACKER_BIN" => self.firecracker_bin = PathBuf::from(value),
            "KERNEL_PATH" => self.kernel_dir = PathBuf::from(value),
            "IMAGES_PATH" => self.images_dir = PathBuf::from(value),
            "ROOTFS_PATH" => self.rootfs_dir = PathBuf::from(value),
            "SOCKET_PATH_PREFIX" => self.socket_dir = PathBuf::from(value),
            "CACHE_DIR" => self.cache_dir = PathBuf::from(value),
            "SUPERVISOR_CONF_DIR" => self.supervisor_conf_dir = PathBuf::from(value),
            "LOG_DIR" => self.log_dir = PathBuf::from(value),
            "TAP_PREFIX" => {
                if value.is_empty() || value.len() > 10 || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                    return Err(ExecutorError::Validation(format!(
                        "TAP_PREFIX: '{value}' must be 1-10 letters, digits, '-' or '_'"
                    )));
                }
                self.tap_prefix = value.to_owned();
            }
            "USE_SUDO" => {
                self.use_sudo = match value.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => {
                        return Err(ExecutorError::Validation(format!(
                            "USE_SUDO: '{value}' is not a boolean"
                        )))
                    }
                };
            }
            "MMDS_ADDRESS" => {
                self.mmds_address = value.parse().map_err(|_| {
                    ExecutorError::Validation(format!("MMDS_ADDRESS: '{value}' is not an IPv4 address"))
                })?;
            }
            "BOOT_ARGS" => self.boot_args = value.to_owned(),
            "READY_TIMEOUT_SECS" => self.ready_timeout = Duration::from_secs(number(key, value)?),
            "COMMAND_TIMEOUT_SECS" => self.command_timeout = Duration::from_secs(number(key, value)?),
            "KERNEL" => self.defaults.kernel = non_empty(value),
            "IMAGE" => self.defaults.image = non_empty(value),
            "ROOTFS_SIZE" => self.defaults.rootfs_size = non_empty(value),
            "CPUS" => self.defaults.cpus = Some(number(key, value)?),
            "MEMORY" => self.defaults.memory = Some(number(key, value)?),
            other => tracing::debug!(key = %other, "ignoring unknown setting"),
        }
        Ok(())
    }

    /// API socket of `name`.
    #[must_use]
    pub fn socket_path(&self, name: &VmName) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    /// Rootfs file built for `name`.
    #[must_use]
    pub fn rootfs_target(&self, name: &VmName) -> PathBuf {
        self.rootfs_dir.join(format!("{name}.ext4"))
    }

    /// Lock file serializing TAP allocation across processes.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(".tap.lock")
    }

    /// Maps a kernel file name into the kernel directory. Absolute paths are
    /// taken as-is.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Validation`] if the file does not exist.
    pub fn resolve_kernel(&self, kernel: &str) -> Result<PathBuf, ExecutorError> {
        let path = if Path::new(kernel).is_absolute() {
            PathBuf::from(kernel)
        } else {
            self.kernel_dir.join(kernel)
        };
        if path.is_file() {
            Ok(path)
        } else {
            Err(ExecutorError::Validation(format!("kernel {} does not exist", path.display())))
        }
    }

    /// Base image `image` inside the images directory.
    #[must_use]
    pub fn image_path(&self, image: &str) -> PathBuf {
        self.images_dir.join(image)
    }

    /// Kernel files in the kernel directory, sorted.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the directory cannot be read.
    pub fn list_kernels(&self) -> Result<Vec<String>, ExecutorError> {
        list_files(&self.kernel_dir, |name| KERNEL_PREFIXES.iter().any(|p| name.starts_with(p)))
    }

    /// Base images in the images directory, sorted.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the directory cannot be read.
    pub fn list_images(&self) -> Result<Vec<String>, ExecutorError> {
        list_files(&self.images_dir, |name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext))
        })
    }
}

fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<String>, ExecutorError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecutorError::Validation(format!("directory {} does not exist", dir.display())))
        }
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if keep(name) {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_comments_and_quotes() {
        let text = "\
# firecracker host settings
KERNEL_PATH=/srv/kernels   # local kernels
IMAGES_PATH=\"/srv/images\"

CPUS=2
MEMORY = 1024
not a pair
";
        assert_eq!(
            parse_env_file(text),
            vec![
                ("KERNEL_PATH".to_owned(), "/srv/kernels".to_owned()),
                ("IMAGES_PATH".to_owned(), "/srv/images".to_owned()),
                ("CPUS".to_owned(), "2".to_owned()),
                ("MEMORY".to_owned(), "1024".to_owned()),
            ]
        );
    }

    #[test]
    fn apply_overrides_paths_and_defaults() {
        let mut s = Settings::default();
        let pairs = parse_env_file("SOCKET_PATH_PREFIX=/tmp/fc\nCPUS=4\nMEMORY=2048\nIMAGE=base.ext4\nUSE_SUDO=no\n");
        if let Err(e) = s.apply_all(pairs) {
            panic!("valid settings must apply: {e}");
        }
        assert_eq!(s.socket_dir, PathBuf::from("/tmp/fc"));
        assert_eq!(s.defaults.cpus, Some(4));
        assert_eq!(s.defaults.memory, Some(2048));
        assert_eq!(s.defaults.image.as_deref(), Some("base.ext4"));
        assert!(!s.use_sudo);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut s = Settings::default();
        assert!(matches!(s.apply("CPUS", "many"), Err(ExecutorError::Validation(_))));
        assert!(matches!(s.apply("READY_TIMEOUT_SECS", "-1"), Err(ExecutorError::Validation(_))));
        assert!(s.apply("TAP_PREFIX", "bad/prefix").is_err());
        assert!(s.apply("SOMETHING_ELSE", "x").is_ok(), "unknown keys are ignored");
    }

    #[test]
    fn derived_paths() {
        let s = Settings::default();
        let name = match VmName::new("t1") {
            Ok(n) => n,
            Err(e) => panic!("name: {e}"),
        };
        assert_eq!(s.socket_path(&name), PathBuf::from("/var/run/firecracker/t1.sock"));
        assert_eq!(s.rootfs_target(&name), PathBuf::from("/var/lib/firecracker/rootfs/t1.ext4"));
        assert_eq!(s.lock_path(), PathBuf::from("/var/lib/firecracker/cache/.tap.lock"));
    }

    #[test]
    fn listing_filters_by_pattern() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        for f in ["vmlinux-6.1", "bzImage", "notes.md", "base.ext4", "disk.qcow2", "readme"] {
            if let Err(e) = std::fs::write(dir.path().join(f), b"") {
                panic!("write {f}: {e}");
            }
        }
        let mut s = Settings::default();
        s.kernel_dir = dir.path().to_path_buf();
        s.images_dir = dir.path().to_path_buf();

        assert!(matches!(s.list_kernels(), Ok(ref k) if k == &["bzImage", "vmlinux-6.1"]));
        assert!(matches!(s.list_images(), Ok(ref i) if i == &["base.ext4", "disk.qcow2"]));
        assert!(s.resolve_kernel("vmlinux-6.1").is_ok());
        assert!(matches!(s.resolve_kernel("vmlinux-missing"), Err(ExecutorError::Validation(_))));
    }
}
