// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Okta Device Trust registration tool.
//!
//! Run by an MDM policy as root (or by the user) to provision the device
//! credential, and by the installed launch agent to renew it.
//!
//! # Usage
//!
//! ```text
//! okta-device-trust [OPTIONS] [WORD]...
//!
//! Words (case-insensitive, others are ignored):
//!   uninstall   Remove the keychain, credential, preferences and agent
//!   renew       Renew the credential if it is close to expiry
//!   verbose     Log at debug level
//!
//! Options:
//!   -c, --config <PATH>              Settings file
//!       --org-url <URL>              Organization URL
//!       --org-token <TOKEN>          One-time registration token
//!       --access-partitions <LIST>   Comma-separated partition allow-list
//!   -v, --verbose                    Log at debug level
//! ```
//!
//! Extra positional parameters added by MDM tools are accepted and ignored.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use okta_device_trust::command::{CommandRunner, SystemCommandRunner};
use okta_device_trust::config::{parse_partition_list, AGENT_LABEL};
use okta_device_trust::identity::IdentityResolver;
use okta_device_trust::logging::{self, LogOptions};
use okta_device_trust::preferences::IdentityPreferences;
use okta_device_trust::renewal::RenewalPolicy;
use okta_device_trust::scheduler::LaunchAgentScheduler;
use okta_device_trust::settings::{Settings, SettingsLoader};
use okta_device_trust::store::{CredentialManager, KeychainStore};
use okta_device_trust::{DeviceTrustConfig, Provisioner, RenewalOutcome, Result, Teardown};

/// Okta Device Trust registration tool
#[derive(Parser, Debug)]
#[command(name = "okta-device-trust")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Register this Mac with Okta Device Trust", long_about = None)]
struct Cli {
    /// Action words: uninstall, renew, verbose
    #[arg(value_name = "WORD")]
    words: Vec<String>,

    /// Path to settings file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Organization URL
    #[arg(long, value_name = "URL")]
    org_url: Option<String>,

    /// One-time registration token
    #[arg(long, value_name = "TOKEN")]
    org_token: Option<String>,

    /// Comma-separated access partition allow-list
    #[arg(long, value_name = "LIST")]
    access_partitions: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Provision,
    Renew,
    Uninstall,
}

/// Pick the action and verbosity from positional words.
///
/// `uninstall` wins over `renew`.
fn classify(words: &[String]) -> (Action, bool) {
    let mut action = Action::Provision;
    let mut verbose = false;
    for word in words {
        match word.to_lowercase().as_str() {
            "uninstall" => action = Action::Uninstall,
            "renew" if action != Action::Uninstall => action = Action::Renew,
            "verbose" => verbose = true,
            _ => {}
        }
    }
    (action, verbose)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (action, verbose_word) = classify(&cli.words);

    if let Err(e) = logging::init(LogOptions {
        verbose: cli.verbose || verbose_word,
    }) {
        eprintln!("{}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli, action)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Okta Device Trust returning ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let loader = match &cli.config {
        Some(path) => SettingsLoader::new().with_path(path),
        None => SettingsLoader::new(),
    };
    let mut settings = loader.load()?;

    if let Some(url) = &cli.org_url {
        settings.org.url = Some(url.clone());
    }
    if let Some(token) = &cli.org_token {
        settings.org.token = Some(token.clone());
    }
    if let Some(list) = &cli.access_partitions {
        settings.keychain.access_partitions = Some(parse_partition_list(list));
    }
    Ok(settings)
}

/// Configuration for an uninstall run, or `None` when there is no usable
/// organization URL and teardown has to skip the preference reset.
fn uninstall_config(settings: Settings) -> Option<DeviceTrustConfig> {
    settings.org.url.as_ref()?;
    match settings.into_config() {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Ignoring invalid configuration for uninstall: {}", e);
            None
        }
    }
}

async fn run(cli: &Cli, action: Action) -> Result<()> {
    let settings = load_settings(cli)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let (identity, account) = IdentityResolver::new(runner.clone()).resolve()?;
    tracing::info!("Registering trusted device with Okta, for user : {}", identity.os_user);
    tracing::info!("Using home directory : {}", account.home.display());

    let store = KeychainStore::new(runner.clone(), account.clone());
    let preferences = IdentityPreferences::new(runner.clone(), account.clone());
    let scheduler = LaunchAgentScheduler::new(runner, account);

    let config = if action == Action::Uninstall {
        match uninstall_config(settings) {
            Some(config) => config,
            None => {
                let credentials = CredentialManager::new(store);
                Teardown::new(&credentials, &preferences).uninstall(&scheduler, AGENT_LABEL)?;
                tracing::info!("Device Trust uninstall completed successfully.");
                return Ok(());
            }
        }
    } else {
        settings.into_config()?
    };
    let credentials =
        CredentialManager::with_policy(store, RenewalPolicy::new(config.renewal_window));
    let provisioner = Provisioner::new(
        config,
        identity,
        credentials,
        Box::new(preferences),
        Box::new(scheduler),
        std::env::current_exe()?,
    )?;

    match action {
        Action::Provision => provisioner.provision().await,
        Action::Renew => {
            match provisioner.renew_if_needed().await? {
                RenewalOutcome::Renewed { fingerprint } => {
                    tracing::info!("Successfully renewed expiring Okta certificate ({}).", fingerprint)
                }
                RenewalOutcome::NotDue => tracing::info!("Okta certificate does not require renewal."),
                RenewalOutcome::NoStore | RenewalOutcome::NoCredential => {
                    tracing::info!("Skipping Okta certificate renewal.")
                }
            }
            Ok(())
        }
        Action::Uninstall => {
            provisioner.uninstall().await?;
            tracing::info!("Device Trust uninstall completed successfully.");
            Ok(())
        }
    }
}
