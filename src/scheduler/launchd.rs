//! Per-user launchd agent.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ScheduledUnit, UnitScheduler};
use crate::command::{CommandRunner, Invocation};
use crate::error::{DeviceTrustError, Result};
use crate::identity::UserAccount;

const AGENT_BINARY: &str = "okta-device-trust";

/// Installs [`ScheduledUnit`]s as launch agents of the console user.
///
/// The job's executable is copied into `~/Library/Okta/` and the property
/// list is written to `~/Library/LaunchAgents/<label>.plist`.
pub struct LaunchAgentScheduler {
    runner: Arc<dyn CommandRunner>,
    account: UserAccount,
}

impl LaunchAgentScheduler {
    /// Scheduler for `account`'s launch agents.
    pub fn new(runner: Arc<dyn CommandRunner>, account: UserAccount) -> Self {
        Self { runner, account }
    }

    /// Where the job's executable is installed.
    pub fn installed_program(&self) -> PathBuf {
        self.account.agent_dir().join(AGENT_BINARY)
    }

    /// Property list path for the unit named `label`.
    pub fn plist_path(&self, label: &str) -> PathBuf {
        self.account
            .launch_agents_dir()
            .join(format!("{}.plist", label))
    }

    fn launchctl(&self, args: &[&str]) -> Invocation {
        Invocation::new("launchctl")
            .args(args.iter().copied())
            .as_user(self.account.run_as())
    }

    fn install_program(&self, source: &Path) -> Result<PathBuf> {
        let agent_dir = self.account.agent_dir();
        fs::create_dir_all(&agent_dir)?;
        self.account.take_ownership(&agent_dir)?;

        let target = self.installed_program();
        if source != target {
            remove_if_present(&target)?;
            fs::copy(source, &target).map_err(|e| {
                DeviceTrustError::scheduler_install(format!(
                    "failed to copy {} to {}: {e}",
                    source.display(),
                    target.display()
                ))
            })?;
        }
        set_mode(&target, 0o500)?;
        self.account.take_ownership(&target)?;
        Ok(target)
    }

    fn unload_existing(&self, plist: &Path) -> Result<()> {
        if !plist.exists() {
            return Ok(());
        }
        tracing::debug!("unloading existing agent {}", plist.display());
        let path = plist.to_string_lossy();
        match self.runner.run(&self.launchctl(&["unload", &*path])) {
            Ok(output) if !output.is_success() => {
                tracing::debug!("launchctl unload: {}", output.describe_failure())
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("launchctl unload: {}", e),
        }
        remove_if_present(plist)
    }
}

impl UnitScheduler for LaunchAgentScheduler {
    fn install(&self, unit: &ScheduledUnit) -> Result<()> {
        tracing::info!("Installing the Okta launch agent.");
        let program = self.install_program(&unit.program)?;

        let plist = self.plist_path(&unit.label);
        self.unload_existing(&plist)?;

        let agents_dir = self.account.launch_agents_dir();
        fs::create_dir_all(&agents_dir)?;
        fs::write(&plist, unit.to_plist(&program.to_string_lossy()))?;
        set_mode(&plist, 0o644)?;
        self.account.take_ownership(&plist)?;

        let path = plist.to_string_lossy();
        let output = self.runner.run(&self.launchctl(&["load", &*path]))?;
        if !output.is_success() {
            return Err(DeviceTrustError::scheduler_install(format!(
                "launchctl load {} failed ({})",
                plist.display(),
                output.describe_failure()
            )));
        }
        tracing::info!("Launch agent {} loaded.", unit.label);
        Ok(())
    }

    fn remove(&self, label: &str) -> Result<()> {
        tracing::info!("Clean the Okta launch agent and files.");
        match self.runner.run(&self.launchctl(&["remove", label])) {
            Ok(output) if !output.is_success() => {
                tracing::debug!("launchctl remove: {}", output.describe_failure())
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("launchctl remove: {}", e),
        }

        match fs::remove_dir_all(self.account.agent_dir()) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        remove_if_present(&self.plist_path(label))
    }

    fn is_installed(&self, label: &str) -> bool {
        self.plist_path(label).exists()
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
