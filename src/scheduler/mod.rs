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

//! Scheduled renewal runs.
//!
//! The renewal check is run by the OS scheduler rather than a resident
//! process. A [`ScheduledUnit`] describes the job; a [`UnitScheduler`]
//! installs exactly one copy of it per user.

mod launchd;

pub use launchd::LaunchAgentScheduler;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{DeviceTrustConfig, AGENT_LABEL};
use crate::error::Result;

/// Scheduling class of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    /// Runs with the responsiveness of a foreground application.
    Interactive,
    /// Ordinary background job.
    Background,
}

impl ProcessType {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Interactive => "Interactive",
            ProcessType::Background => "Background",
        }
    }
}

/// A periodic job definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledUnit {
    /// Unique job label.
    pub label: String,
    /// Executable to install and run.
    pub program: PathBuf,
    /// Arguments passed after the program.
    pub arguments: Vec<String>,
    /// Interval between runs.
    pub interval: Duration,
    /// Run once as soon as the job is loaded.
    pub run_at_load: bool,
    /// Scheduling priority adjustment.
    pub nice: i32,
    /// Scheduling class.
    pub process_type: ProcessType,
}

impl ScheduledUnit {
    /// The daily renewal check for `config`, running `program`.
    ///
    /// The organization and the partition allow-list are passed as
    /// structured arguments; the token is never written to the job.
    pub fn renewal_check(config: &DeviceTrustConfig, program: PathBuf) -> Self {
        let org_url = config.org_url.as_str().trim_end_matches('/').to_string();
        Self {
            label: AGENT_LABEL.to_string(),
            program,
            arguments: vec![
                "renew".to_string(),
                "--org-url".to_string(),
                org_url,
                "--access-partitions".to_string(),
                config.access_partition_list(),
            ],
            interval: config.check_interval,
            run_at_load: true,
            nice: -20,
            process_type: ProcessType::Interactive,
        }
    }

    /// Render as a launchd property list, running `program`.
    pub fn to_plist(&self, program: &str) -> String {
        let mut xml = String::from(concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" ",
            "\"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
            "<plist version=\"1.0\">\n",
            "<dict>\n",
        ));

        push_key(&mut xml, "Label");
        xml.push_str(&format!("\t<string>{}</string>\n", escape_xml(&self.label)));

        push_key(&mut xml, "ProgramArguments");
        xml.push_str("\t<array>\n");
        for arg in std::iter::once(program).chain(self.arguments.iter().map(String::as_str)) {
            xml.push_str(&format!("\t\t<string>{}</string>\n", escape_xml(arg)));
        }
        xml.push_str("\t</array>\n");

        push_key(&mut xml, "RunAtLoad");
        xml.push_str(if self.run_at_load { "\t<true/>\n" } else { "\t<false/>\n" });

        push_key(&mut xml, "StartInterval");
        xml.push_str(&format!("\t<integer>{}</integer>\n", self.interval.as_secs()));

        push_key(&mut xml, "Nice");
        xml.push_str(&format!("\t<integer>{}</integer>\n", self.nice));

        push_key(&mut xml, "ProcessType");
        xml.push_str(&format!("\t<string>{}</string>\n", self.process_type.as_str()));

        xml.push_str("</dict>\n</plist>\n");
        xml
    }
}

fn push_key(xml: &mut String, key: &str) {
    xml.push_str(&format!("\t<key>{}</key>\n", key));
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Installs and removes [`ScheduledUnit`]s.
pub trait UnitScheduler {
    /// Install `unit`, replacing any previous definition with the same label.
    fn install(&self, unit: &ScheduledUnit) -> Result<()>;

    /// Remove the unit named `label` and its backing files. Absence is not
    /// an error.
    fn remove(&self, label: &str) -> Result<()>;

    /// True if a definition named `label` is present.
    fn is_installed(&self, label: &str) -> bool;
}
