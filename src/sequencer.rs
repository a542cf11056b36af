//! The PID 1 boot sequence.
//!
//! Every state runs to completion and hands over to the next one; no failure
//! short-circuits the sequence. The only branch is whether a netboot is
//! attempted at all.
use std::fs;
use std::path::PathBuf;

use nix::sched::CloneFlags;

use crate::cmdline::Cmdline;
use crate::config::{BootConfig, BootPaths, Opts};
use crate::modules;
use crate::netboot::fetch::Schemes;
use crate::netboot::{MountedRootfs, Netboot};
use crate::process::{run_commands, wait_orphans, InitCommand};
use crate::rootfs;
use crate::syscall::Syscall;

const UINIT_PATHS: [&str; 3] = ["/bbin/uinit", "/bin/uinit", "/buildbin/uinit"];
const SHELL_PATHS: [&str; 2] = ["/bin/defaultsh", "/bin/sh"];
const INITO_PATH: &str = "/inito";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Init,
    EnvironmentSetup,
    ModuleLoad,
    NetbootAttempt,
    ExecChain,
    ReapOrphans,
    Quiesce,
    Exit,
}

/// What happened during one run of the sequence.
#[derive(Debug, Default)]
pub struct BootReport {
    pub states: Vec<BootState>,
    pub config: Option<BootConfig>,
    pub netboot: Option<MountedRootfs>,
    pub started: Option<InitCommand>,
    pub reaped: usize,
}

pub struct BootSequencer {
    opts: Opts,
    paths: BootPaths,
    syscall: Box<dyn Syscall>,
    schemes: Schemes,
}

impl BootSequencer {
    pub fn new(opts: Opts, paths: BootPaths, syscall: Box<dyn Syscall>) -> Self {
        Self {
            opts,
            paths,
            syscall,
            schemes: Schemes::with_defaults(),
        }
    }

    pub fn with_schemes(mut self, schemes: Schemes) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn syscall(&self) -> &dyn Syscall {
        self.syscall.as_ref()
    }

    /// Builds the boot configuration from the options, the kernel command
    /// line and the uinit flags file. The kernel command line is only
    /// readable once `/proc` is mounted.
    pub fn resolve_config(&self) -> BootConfig {
        let cmdline = Cmdline::read(&self.paths.cmdline).unwrap_or_else(|e| {
            log::warn!("{:#}", e);
            Cmdline::default()
        });
        let uinit_flags = fs::read_to_string(&self.paths.uinit_flags).ok();
        BootConfig::resolve(&self.opts, &cmdline, uinit_flags.as_deref())
    }

    /// Candidates in priority order. A netbooted rootfs brings its own init,
    /// which goes first.
    pub fn init_commands(
        &self,
        config: &BootConfig,
        netbooted: Option<&MountedRootfs>,
    ) -> Vec<InitCommand> {
        let tty_control = !config.test_mode;
        let mut cmds = Vec::new();

        if let Some(mounted) = netbooted {
            // systemd refuses to run unless it is PID 1 of the initial namespace.
            let flags = if config.systemd {
                CloneFlags::empty()
            } else {
                CloneFlags::CLONE_NEWPID
            };
            cmds.push(
                InitCommand::new(&config.rootfs_netboot_init_path)
                    .chroot(&mounted.mount_point)
                    .clone_flags(flags)
                    .tty_control(tty_control),
            );
        }

        cmds.push(
            InitCommand::new(self.paths.resolve(INITO_PATH))
                .clone_flags(CloneFlags::CLONE_NEWPID)
                .tty_control(tty_control),
        );
        for uinit in UINIT_PATHS {
            cmds.push(
                InitCommand::new(self.paths.resolve(uinit))
                    .tty_control(tty_control)
                    .args(config.uinit_args.clone()),
            );
        }
        for shell in SHELL_PATHS {
            cmds.push(InitCommand::new(self.paths.resolve(shell)).tty_control(tty_control));
        }

        cmds
    }

    pub fn run(&self) -> BootReport {
        let mut report = BootReport::default();
        let mut config: Option<BootConfig> = None;
        let mut state = BootState::Init;

        loop {
            log::debug!("entering {:?}", state);
            report.states.push(state);
            state = match state {
                BootState::Init => {
                    if self.opts.verbose {
                        log::info!("verbose mode enabled");
                    } else {
                        log::info!("verbose mode disabled");
                    }
                    if !self.opts.rest.is_empty() {
                        log::debug!("ignoring arguments {:?}", self.opts.rest);
                    }
                    BootState::EnvironmentSetup
                }
                BootState::EnvironmentSetup => {
                    let failures = rootfs::create_rootfs(self.syscall(), &self.paths.root);
                    if failures > 0 {
                        log::warn!("{} entries of the base filesystem could not be created", failures);
                    }
                    rootfs::net_init(self.syscall());
                    config = Some(self.resolve_config());
                    BootState::ModuleLoad
                }
                BootState::Exit => {
                    log::info!("Exiting...");
                    break;
                }
                later => {
                    let config = config.get_or_insert_with(|| self.resolve_config());
                    self.step(later, config, &mut report)
                }
            };
        }

        report.config = config;
        report
    }

    // States that run with a resolved configuration.
    fn step(&self, state: BootState, config: &BootConfig, report: &mut BootReport) -> BootState {
        match state {
            BootState::ModuleLoad => {
                log::debug!("{:?}", config);
                match modules::install_all(self.syscall(), &self.paths.modules) {
                    Ok(loaded) => log::debug!("loaded {} modules", loaded),
                    Err(e) => log::warn!("{}", e),
                }
                log_mounts();
                if config.rootfs_url.is_some() {
                    BootState::NetbootAttempt
                } else {
                    log::info!("rootfs URL not specified");
                    BootState::ExecChain
                }
            }
            BootState::NetbootAttempt => {
                let netboot = Netboot::new(config, &self.paths, self.syscall(), &self.schemes);
                report.netboot = netboot.run().mounted().cloned();
                BootState::ExecChain
            }
            BootState::ExecChain => {
                let cmds = self.init_commands(config, report.netboot.as_ref());
                let env = config.child_env();
                match run_commands(self.syscall(), &cmds, &env) {
                    Some(cmd) => report.started = Some(cmd.clone()),
                    None => log::warn!(
                        "No suitable executable found in {:?}",
                        cmds.iter().map(|c| c.host_path()).collect::<Vec<PathBuf>>()
                    ),
                }
                BootState::ReapOrphans
            }
            BootState::ReapOrphans => {
                log::info!("Waiting for orphaned children");
                report.reaped = wait_orphans(self.syscall());
                log::info!("All commands exited");
                BootState::Quiesce
            }
            BootState::Quiesce => {
                log::info!("Syncing filesystems");
                if let Err(e) = self.syscall.sync() {
                    log::warn!("{}", e);
                }
                BootState::Exit
            }
            BootState::Init | BootState::EnvironmentSetup | BootState::Exit => {
                log::error!("{:?} reached out of order", state);
                BootState::Exit
            }
        }
    }
}

fn log_mounts() {
    match blockdev::mounts::mount_table() {
        Ok(mounts) => {
            let table = mounts
                .iter()
                .map(|m| {
                    format!(
                        "{} {} {}",
                        m.mount_source.as_deref().unwrap_or("none"),
                        m.mount_point.display(),
                        m.fs_type
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            log::info!("mounts:\n{}", table);
        }
        Err(e) => log::warn!("Could not read the mount table: {}", e),
    }
}
