//! Boot configuration, resolved once at startup from the command line flags,
//! the kernel command line and `/etc/uinit.flags`.
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::cmdline::{split_args, Cmdline};

pub const DEFAULT_NETBOOT_INIT_PATH: &str = "/sbin/init";
pub const DEFAULT_PATH_ENV: &str = "/ubin:/usr/sbin:/usr/bin:/sbin:/bin:/bbin:/buildbin";

const SYSTEMD_FLAG: &str = "systemd";
const ROOTFS_NETBOOT_FLAG: &str = "rootfs_netboot";
const ROOTFS_NETBOOT_INIT_PATH_FLAG: &str = "rootfs_netboot_init_path";
const NOHWRNG_FLAG: &str = "uroot.nohwrng";

/// Command line options of the init binary.
#[derive(Parser, Debug, Default, Clone, PartialEq, Eq)]
#[clap(version, about)]
pub struct Opts {
    /// Enable debug logging, including the commands that are run
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// Test mode: don't try to set the controlling tty
    #[clap(long)]
    pub test: bool,
    /// URL of a squashfs root filesystem image to boot
    #[clap(long = "rootfs_url", alias = "rootfs-url")]
    pub rootfs_url: Option<String>,
    /// Mirror log output to this file
    #[clap(long)]
    pub log: Option<PathBuf>,
    /// Kernel parameters the kernel passed on without interpreting them
    #[clap(hide = true)]
    pub rest: Vec<String>,
}

/// Rewrites single-dash long flags (`-test`, `-rootfs_url=x`) to their
/// double-dash form. Single letter flags such as `-v` are left alone.
pub fn normalize_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    let mut args = args.into_iter();
    let mut normalized: Vec<OsString> = args.next().into_iter().collect();
    for arg in args {
        let rewritten = arg.to_str().and_then(|s| {
            let name = s.strip_prefix('-')?;
            let flag = name.split('=').next().unwrap_or(name);
            if name.starts_with('-') || flag.chars().count() < 2 {
                None
            } else {
                Some(OsString::from(format!("-{}", s)))
            }
        });
        normalized.push(rewritten.unwrap_or(arg));
    }
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("strconv.ParseBool: parsing {0:?}: invalid syntax")]
pub struct ParseBoolError(String);

/// Boolean parsing that accepts exactly the spellings kernel command lines use:
/// `1 t T TRUE true True 0 f F FALSE false False`.
pub fn parse_bool(s: &str) -> Result<bool, ParseBoolError> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ParseBoolError(s.to_string())),
    }
}

/// Filesystem locations touched during boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPaths {
    pub root: PathBuf,
    pub rootfs_tmp: PathBuf,
    pub rootfs: PathBuf,
    pub uinit_flags: PathBuf,
    pub modules: PathBuf,
    pub cmdline: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self::under("/")
    }
}

impl BootPaths {
    /// All locations relative to `root` instead of `/`.
    pub fn under<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        BootPaths {
            root: root.to_path_buf(),
            rootfs_tmp: root.join("rootfs_tmp"),
            rootfs: root.join("rootfs"),
            uinit_flags: root.join("etc/uinit.flags"),
            modules: root.join("lib/modules"),
            cmdline: root.join("proc/cmdline"),
        }
    }

    /// `path` is an absolute path on the booted system.
    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub verbose: bool,
    pub test_mode: bool,
    pub rootfs_url: Option<String>,
    pub systemd: bool,
    pub rootfs_netboot: bool,
    pub rootfs_netboot_init_path: PathBuf,
    pub uinit_args: Vec<String>,
    pub nohwrng: bool,
}

impl BootConfig {
    pub fn resolve(opts: &Opts, cmdline: &Cmdline, uinit_flags: Option<&str>) -> Self {
        let init_flags = cmdline.init_flags();

        let systemd = bool_flag(&init_flags, cmdline, SYSTEMD_FLAG);
        log::info!("systemdEnabled: {}", systemd);
        let rootfs_netboot = bool_flag(&init_flags, cmdline, ROOTFS_NETBOOT_FLAG);
        log::info!("rootfsNetbootEnabled: {}", rootfs_netboot);

        let rootfs_netboot_init_path = lookup(&init_flags, cmdline, ROOTFS_NETBOOT_INIT_PATH_FLAG)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_NETBOOT_INIT_PATH)
            .into();

        let nohwrng = cmdline.contains_flag(NOHWRNG_FLAG);
        if nohwrng {
            log::warn!(
                "Deprecation warning: use UROOT_NOHWRNG=1 on kernel cmdline instead of uroot.nohwrng"
            );
        }

        let mut uinit_args = cmdline.uinit_args();
        if let Some(contents) = uinit_flags {
            uinit_args.extend(split_args(contents));
        }

        BootConfig {
            verbose: opts.verbose,
            test_mode: opts.test,
            rootfs_url: opts.rootfs_url.clone().filter(|url| !url.is_empty()),
            systemd,
            rootfs_netboot,
            rootfs_netboot_init_path,
            uinit_args,
            nohwrng,
        }
    }

    /// Environment handed to every spawned command.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("PATH".to_string(), DEFAULT_PATH_ENV.to_string()),
            ("HOME".to_string(), "/".to_string()),
            ("TERM".to_string(), "linux".to_string()),
        ];
        if self.nohwrng {
            env.push(("UROOT_NOHWRNG".to_string(), "1".to_string()));
        }
        env
    }
}

fn lookup<'a>(init_flags: &'a HashMap<String, String>, cmdline: &'a Cmdline, key: &str) -> Option<&'a str> {
    init_flags
        .get(key)
        .map(String::as_str)
        .or_else(|| cmdline.flag(key))
}

// A flag that is missing or does not parse resolves to false.
fn bool_flag(init_flags: &HashMap<String, String>, cmdline: &Cmdline, key: &str) -> bool {
    match lookup(init_flags, cmdline, key) {
        None => false,
        Some(value) => match parse_bool(value) {
            Ok(enabled) => enabled,
            Err(e) => {
                log::warn!("{} present but not a boolean: {}", key, e);
                false
            }
        },
    }
}
