//! Device and console user identity.
//!
//! The identity is resolved once at process start and shared read-only with
//! every component. It is never persisted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{CommandRunner, Invocation, RunAs};
use crate::error::{DeviceTrustError, Result};

/// Immutable description of the device and the user being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hardware UUID of the machine.
    pub hardware_uuid: String,
    /// Human-readable computer name.
    pub display_name: String,
    /// Login name of the console user.
    pub os_user: String,
    /// Operating system version.
    pub os_version: OsVersion,
}

/// Operating system version triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl OsVersion {
    /// Create a version triple.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `"14.2.1"`-style versions; missing components are zero.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.trim().split('.');
        let mut next = |name: &str| -> Result<u32> {
            match parts.next() {
                None | Some("") => Ok(0),
                Some(p) => p.parse().map_err(|_| {
                    DeviceTrustError::config(format!("invalid OS {} version in '{}'", name, raw.trim()))
                }),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if major == 0 {
            return Err(DeviceTrustError::config(format!(
                "invalid OS version '{}'",
                raw.trim()
            )));
        }
        Ok(Self::new(major, minor, patch))
    }

    /// Underscore-separated form used in the user agent (`14_2_1`).
    pub fn underscored(&self) -> String {
        format!("{}_{}_{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Password database entry of the console user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

impl UserAccount {
    /// Look up an account in the password database.
    #[cfg(unix)]
    pub fn lookup(name: &str) -> Result<Self> {
        use std::ffi::{CStr, CString};

        let c_name = CString::new(name)
            .map_err(|_| DeviceTrustError::no_interactive_user(name))?;
        // SAFETY: getpwnam returns a pointer into static storage or null. The
        // fields are copied out before any other password database call.
        unsafe {
            let entry = libc::getpwnam(c_name.as_ptr());
            if entry.is_null() {
                return Err(DeviceTrustError::no_interactive_user(name));
            }
            let home = CStr::from_ptr((*entry).pw_dir).to_string_lossy().into_owned();
            Ok(Self {
                name: name.to_string(),
                uid: (*entry).pw_uid,
                gid: (*entry).pw_gid,
                home: PathBuf::from(home),
            })
        }
    }

    /// Look up an account in the password database.
    #[cfg(not(unix))]
    pub fn lookup(name: &str) -> Result<Self> {
        Err(DeviceTrustError::no_interactive_user(name))
    }

    /// Context used to run commands on behalf of this user.
    pub fn run_as(&self) -> RunAs {
        RunAs {
            name: self.name.clone(),
            uid: self.uid,
        }
    }

    /// Hand ownership of a path to this user.
    #[cfg(unix)]
    pub fn take_ownership(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))?;
        Ok(())
    }

    /// Hand ownership of a path to this user.
    #[cfg(not(unix))]
    pub fn take_ownership(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// `~/Library/Keychains`.
    pub fn keychains_dir(&self) -> PathBuf {
        self.home.join("Library").join("Keychains")
    }

    /// `~/Library/LaunchAgents`.
    pub fn launch_agents_dir(&self) -> PathBuf {
        self.home.join("Library").join("LaunchAgents")
    }

    /// `~/Library/Okta`.
    pub fn agent_dir(&self) -> PathBuf {
        self.home.join("Library").join("Okta")
    }
}

type AccountLookup = fn(&str) -> Result<UserAccount>;

/// Resolves the [`DeviceIdentity`] of the current run.
pub struct IdentityResolver {
    runner: Arc<dyn CommandRunner>,
    lookup: AccountLookup,
}

impl IdentityResolver {
    /// Create a resolver using the system password database.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            lookup: UserAccount::lookup,
        }
    }

    /// Create a resolver with a custom account lookup.
    pub fn with_account_lookup(runner: Arc<dyn CommandRunner>, lookup: AccountLookup) -> Self {
        Self { runner, lookup }
    }

    /// Resolve the device identity and the console user's account.
    ///
    /// Fails with [`DeviceTrustError::NoInteractiveUser`] when nobody is
    /// logged in at the console.
    pub fn resolve(&self) -> Result<(DeviceIdentity, UserAccount)> {
        let os_user = self.console_user()?;
        let account = (self.lookup)(&os_user)?;

        let profile = self.output(Invocation::new("system_profiler").arg("SPHardwareDataType"))?;
        let hardware_uuid = parse_hardware_uuid(&profile)
            .ok_or_else(|| DeviceTrustError::config("hardware UUID not reported by system_profiler"))?;

        let display_name = self
            .output(Invocation::new("scutil").args(["--get", "ComputerName"]))?
            .trim()
            .to_string();

        let os_version =
            OsVersion::parse(&self.output(Invocation::new("sw_vers").arg("-productVersion"))?)?;

        let identity = DeviceIdentity {
            hardware_uuid,
            display_name,
            os_user,
            os_version,
        };
        tracing::debug!(
            "device {} ({}) user {} macOS {}",
            identity.hardware_uuid,
            identity.display_name,
            identity.os_user,
            identity.os_version
        );

        Ok((identity, account))
    }

    fn console_user(&self) -> Result<String> {
        let owner = self.output(Invocation::new("stat").args(["-f", "%Su", "/dev/console"]))?;
        let owner = owner.trim();
        if is_interactive_user(owner) {
            Ok(owner.to_string())
        } else {
            Err(DeviceTrustError::no_interactive_user(owner))
        }
    }

    fn output(&self, invocation: Invocation) -> Result<String> {
        Ok(self.runner.run_checked(&invocation)?.stdout)
    }
}

/// True for a real logged-in console user.
pub fn is_interactive_user(owner: &str) -> bool {
    !matches!(owner, "" | "loginwindow" | "root")
}

/// Extract the value of the `Hardware UUID:` line.
pub fn parse_hardware_uuid(profile: &str) -> Option<String> {
    profile.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Hardware UUID:")
            .map(|rest| rest.trim().to_string())
            .filter(|uuid| !uuid.is_empty())
    })
}
