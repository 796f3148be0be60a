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

//! Logging setup.
//!
//! Events go to stdout and to the system log. The system log copy is what
//! administrators see for runs started by the scheduler, where stdout is
//! discarded.
//!
//! The default level is `info`, or `debug` with `verbose`. `RUST_LOG`
//! overrides both:
//!
//! ```text
//! RUST_LOG=okta_device_trust=trace okta-device-trust --org-url acme.okta.com
//! ```

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{DeviceTrustError, Result};

const MESSAGE_PREFIX: &str = "Okta: ";

/// Logging options taken from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Log at debug level.
    pub verbose: bool,
}

impl LogOptions {
    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init(options: LogOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stdout),
        )
        .with(SyslogLayer::system())
        .try_init()
        .map_err(|e| DeviceTrustError::config(format!("failed to initialize logging: {e}")))
}

type Sink = Arc<dyn Fn(Priority, &str) + Send + Sync>;

/// System log priority of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// `LOG_ERR`
    Error,
    /// `LOG_WARNING`
    Warning,
    /// `LOG_INFO`
    Info,
    /// `LOG_DEBUG`
    Debug,
}

impl From<&Level> for Priority {
    fn from(level: &Level) -> Self {
        match *level {
            Level::ERROR => Priority::Error,
            Level::WARN => Priority::Warning,
            Level::INFO => Priority::Info,
            _ => Priority::Debug,
        }
    }
}

#[cfg(unix)]
impl Priority {
    fn as_raw(self) -> libc::c_int {
        match self {
            Priority::Error => libc::LOG_ERR,
            Priority::Warning => libc::LOG_WARNING,
            Priority::Info => libc::LOG_INFO,
            Priority::Debug => libc::LOG_DEBUG,
        }
    }
}

/// Layer forwarding events to the system log.
pub struct SyslogLayer {
    sink: Sink,
}

impl SyslogLayer {
    /// Layer writing through `syslog(3)`.
    pub fn system() -> Self {
        #[cfg(unix)]
        open_syslog();
        Self::with_sink(write_syslog)
    }

    /// Layer handing each formatted record to `sink`.
    pub fn with_sink<F>(sink: F) -> Self
    where
        F: Fn(Priority, &str) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = format!("{}{}", MESSAGE_PREFIX, visitor.finish());
        (self.sink)(Priority::from(event.metadata().level()), &record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(unix)]
fn open_syslog() {
    static IDENT: &[u8] = b"okta_device_registration\0";
    // SAFETY: IDENT is NUL-terminated and lives for the whole process.
    unsafe {
        libc::openlog(
            IDENT.as_ptr().cast(),
            libc::LOG_PID | libc::LOG_NDELAY,
            libc::LOG_USER,
        );
    }
}

#[cfg(unix)]
fn write_syslog(priority: Priority, record: &str) {
    let Ok(record) = std::ffi::CString::new(record.replace('\0', " ")) else {
        return;
    };
    static FORMAT: &[u8] = b"%s\0";
    // SAFETY: both pointers are valid NUL-terminated strings for the call.
    unsafe {
        libc::syslog(priority.as_raw(), FORMAT.as_ptr().cast(), record.as_ptr());
    }
}

#[cfg(not(unix))]
fn write_syslog(_priority: Priority, _record: &str) {}
