//! Fetching a squashfs root filesystem over the network and mounting it.
//!
//! The pipeline is a chain of stages. Each one either hands its result to the
//! next or ends the attempt with a [`Skip`] naming the cause. A skip is never
//! fatal: boot continues with the local init candidates.
pub mod fetch;
pub mod tftp;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use reqwest::Url;

use crate::config::{BootConfig, BootPaths};
use crate::syscall::{Syscall, SyscallError};
use fetch::{FetchError, Schemes};

/// Extra room on the staging tmpfs beyond the image itself.
pub const STAGING_SLACK: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Skip {
    #[error("rootfs URL not specified")]
    NotConfigured,
    #[error("error parsing rootfs URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to get size of {url}")]
    SizeQuery {
        url: Url,
        #[source]
        source: FetchError,
    },
    #[error("uroot.initflags doesn't have 'rootfs_netboot=1' in it")]
    NotEnabled,
    #[error("failed to create {path:?}")]
    StagingDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error mounting tmpfs of size {size} bytes")]
    StagingMount {
        size: u64,
        #[source]
        source: SyscallError,
    },
    #[error("failed to download {url}")]
    Download {
        url: Url,
        #[source]
        source: FetchError,
    },
    #[error("failed to write {url} to {path:?}")]
    Write {
        url: Url,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error setting loop device for {image:?}")]
    LoopAttach {
        image: PathBuf,
        #[source]
        source: SyscallError,
    },
    #[error("error mounting rootfs image {image:?} on {target:?}")]
    RootfsMount {
        image: PathBuf,
        target: PathBuf,
        #[source]
        source: SyscallError,
    },
}

impl Skip {
    /// Skips that only mean netboot was not asked for.
    pub fn is_expected(&self) -> bool {
        matches!(self, Skip::NotConfigured | Skip::NotEnabled)
    }
}

/// A rootfs image that was fetched, attached and mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedRootfs {
    pub url: Url,
    pub image: PathBuf,
    pub loop_device: PathBuf,
    pub mount_point: PathBuf,
}

#[derive(Debug)]
pub enum Outcome {
    Proceed(MountedRootfs),
    Skip(Skip),
}

impl Outcome {
    pub fn mounted(&self) -> Option<&MountedRootfs> {
        match self {
            Outcome::Proceed(mounted) => Some(mounted),
            Outcome::Skip(_) => None,
        }
    }
}

pub struct Netboot<'a> {
    config: &'a BootConfig,
    paths: &'a BootPaths,
    syscall: &'a dyn Syscall,
    schemes: &'a Schemes,
}

impl<'a> Netboot<'a> {
    pub fn new(
        config: &'a BootConfig,
        paths: &'a BootPaths,
        syscall: &'a dyn Syscall,
        schemes: &'a Schemes,
    ) -> Self {
        Self {
            config,
            paths,
            syscall,
            schemes,
        }
    }

    /// Runs every stage and logs how the attempt ended.
    pub fn run(&self) -> Outcome {
        match self.attempt() {
            Ok(mounted) => {
                log::info!("netboot of {} finishing!", mounted.url);
                Outcome::Proceed(mounted)
            }
            Err(skip) => {
                if skip.is_expected() {
                    log::info!("skipping netboot: {}", skip);
                } else {
                    log::warn!("skipping netboot: {}", display_chain(&skip));
                }
                Outcome::Skip(skip)
            }
        }
    }

    fn attempt(&self) -> Result<MountedRootfs, Skip> {
        let url = self.parse_url(self.configured_url()?)?;
        let size = self.query_size(&url)?;
        self.check_enabled()?;
        self.stage(size)?;
        let image = self.download(&url)?;
        let loop_device = self.attach(&image)?;
        self.mount_rootfs(&image, &loop_device)?;

        Ok(MountedRootfs {
            url,
            image,
            loop_device,
            mount_point: self.paths.rootfs.clone(),
        })
    }

    fn configured_url(&self) -> Result<&'a str, Skip> {
        self.config.rootfs_url.as_deref().ok_or(Skip::NotConfigured)
    }

    fn parse_url(&self, raw: &str) -> Result<Url, Skip> {
        log::info!("rootfs URL: {}", raw);
        let url = Url::parse(raw).map_err(|e| Skip::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        log::debug!("parsed URL: {:?}", url);
        Ok(url)
    }

    fn query_size(&self, url: &Url) -> Result<u64, Skip> {
        let size = self.schemes.size(url).map_err(|source| Skip::SizeQuery {
            url: url.clone(),
            source,
        })?;
        log::info!("size of {} is {}", url, size);
        Ok(size)
    }

    // Mounting a remote root must be asked for explicitly.
    fn check_enabled(&self) -> Result<(), Skip> {
        if self.config.rootfs_netboot {
            Ok(())
        } else {
            Err(Skip::NotEnabled)
        }
    }

    fn stage(&self, image_size: u64) -> Result<(), Skip> {
        for dir in [&self.paths.rootfs_tmp, &self.paths.rootfs] {
            fs::create_dir_all(dir).map_err(|source| Skip::StagingDir {
                path: dir.clone(),
                source,
            })?;
        }

        let size = image_size.saturating_add(STAGING_SLACK);
        self.syscall
            .mount(
                Some(Path::new("tmpfs")),
                &self.paths.rootfs_tmp,
                Some("tmpfs"),
                MsFlags::empty(),
                Some(format!("size={}", size).as_str()),
            )
            .map_err(|source| Skip::StagingMount { size, source })
    }

    fn download(&self, url: &Url) -> Result<PathBuf, Skip> {
        let name = image_file_name(url).ok_or_else(|| Skip::Download {
            url: url.clone(),
            source: FetchError::InvalidPath(url.clone()),
        })?;
        let path = self.paths.rootfs_tmp.join(name);

        let mut reader = self.schemes.fetch(url).map_err(|source| Skip::Download {
            url: url.clone(),
            source,
        })?;
        let write_err = |source| Skip::Write {
            url: url.clone(),
            path: path.clone(),
            source,
        };
        let mut file = File::create(&path).map_err(write_err)?;
        let written = io::copy(&mut reader, &mut file).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        log::debug!("wrote {} bytes to {:?}", written, path);
        Ok(path)
    }

    fn attach(&self, image: &Path) -> Result<PathBuf, Skip> {
        self.syscall
            .attach_loop(image)
            .map_err(|source| Skip::LoopAttach {
                image: image.to_path_buf(),
                source,
            })
    }

    fn mount_rootfs(&self, image: &Path, loop_device: &Path) -> Result<(), Skip> {
        self.syscall
            .mount(
                Some(loop_device),
                &self.paths.rootfs,
                Some("squashfs"),
                MsFlags::empty(),
                None,
            )
            .map_err(|source| Skip::RootfsMount {
                image: image.to_path_buf(),
                target: self.paths.rootfs.clone(),
                source,
            })
    }
}

/// Last path segment of the URL, the name the image is staged under.
fn image_file_name(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .filter(|name| *name != "." && *name != "..")
        .map(str::to_string)
}

fn display_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use nix::errno::Errno;

    struct Setup {
        _dir: tempfile::TempDir,
        paths: BootPaths,
        image: PathBuf,
        syscall: TestHelperSyscall,
        schemes: Schemes,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let paths = BootPaths::under(dir.path().join("root"));
        let image = dir.path().join("srv/root.sqfs");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, vec![0x68u8; 3000]).unwrap();
        Setup {
            _dir: dir,
            paths,
            image,
            syscall: TestHelperSyscall::default(),
            schemes: Schemes::with_defaults(),
        }
    }

    fn config(url: Option<String>, enabled: bool) -> BootConfig {
        let mut config = BootConfig::resolve(
            &Default::default(),
            &crate::cmdline::Cmdline::default(),
            None,
        );
        config.rootfs_url = url;
        config.rootfs_netboot = enabled;
        config
    }

    fn file_url(path: &Path) -> Option<String> {
        Some(Url::from_file_path(path).unwrap().to_string())
    }

    #[test]
    fn test_not_configured() {
        let s = setup();
        let config = config(None, true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(outcome, Outcome::Skip(Skip::NotConfigured)));
        assert!(s.syscall.get_mount_args().is_empty());
    }

    #[test]
    fn test_invalid_url() {
        let s = setup();
        let config = config(Some("not a url".to_string()), true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(outcome, Outcome::Skip(Skip::InvalidUrl { .. })));
    }

    #[test]
    fn test_unregistered_scheme() {
        let s = setup();
        let config = config(Some("ftp://10.0.2.2/root.sqfs".to_string()), true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(
            outcome,
            Outcome::Skip(Skip::SizeQuery {
                source: FetchError::UnsupportedScheme(_),
                ..
            })
        ));
    }

    #[test]
    fn test_not_enabled_stops_after_size_query() {
        let s = setup();
        let config = config(file_url(&s.image), false);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(outcome, Outcome::Skip(Skip::NotEnabled)));
        assert!(s.syscall.get_mount_args().is_empty());
        assert!(s.syscall.get_attach_loop_args().is_empty());
        assert!(!s.paths.rootfs_tmp.exists());
    }

    #[test]
    fn test_full_pipeline() {
        let s = setup();
        let config = config(file_url(&s.image), true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();

        let staged = s.paths.rootfs_tmp.join("root.sqfs");
        let mounted = outcome.mounted().expect("netboot should complete");
        assert_eq!(mounted.image, staged);
        assert_eq!(mounted.loop_device, PathBuf::from("/dev/loop0"));
        assert_eq!(mounted.mount_point, s.paths.rootfs);
        assert_eq!(fs::read(&staged).unwrap(), vec![0x68u8; 3000]);

        let mounts = s.syscall.get_mount_args();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].target, s.paths.rootfs_tmp);
        assert_eq!(mounts[0].fstype.as_deref(), Some("tmpfs"));
        assert_eq!(
            mounts[0].data.as_deref(),
            Some(format!("size={}", 3000 + STAGING_SLACK).as_str())
        );
        assert_eq!(mounts[1].source, Some(PathBuf::from("/dev/loop0")));
        assert_eq!(mounts[1].target, s.paths.rootfs);
        assert_eq!(mounts[1].fstype.as_deref(), Some("squashfs"));
        assert_eq!(s.syscall.get_attach_loop_args(), vec![staged]);
    }

    #[test]
    fn test_staging_mount_failure_skips() {
        let s = setup();
        s.syscall.fail_mount(&s.paths.rootfs_tmp, Errno::ENOMEM);
        let config = config(file_url(&s.image), true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(
            outcome,
            Outcome::Skip(Skip::StagingMount { size, .. }) if size == 3000 + STAGING_SLACK
        ));
        assert!(s.syscall.get_attach_loop_args().is_empty());
    }

    #[test]
    fn test_loop_failure_skips() {
        let s = setup();
        s.syscall.set_loop_device(Err(Errno::EBUSY));
        let config = config(file_url(&s.image), true);
        let outcome = Netboot::new(&config, &s.paths, &s.syscall, &s.schemes).run();
        assert!(matches!(outcome, Outcome::Skip(Skip::LoopAttach { .. })));
        assert_eq!(s.syscall.get_mount_args().len(), 1);
    }

    #[test]
    fn test_image_file_name() {
        let name = |u: &str| image_file_name(&Url::parse(u).unwrap());
        assert_eq!(name("http://h/a/b/root.sqfs"), Some("root.sqfs".to_string()));
        assert_eq!(name("http://h/a/rootfs/"), Some("rootfs".to_string()));
        assert_eq!(name("http://h/"), None);
    }
}
