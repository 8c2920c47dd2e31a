// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Best-effort discovery of the hypervisor's version.
//!
//! The version string is advisory (it ends up in logs and `version` output),
//! so failing to determine it is never an error: the probe logs what went
//! wrong and reports `<tag>-unknown` instead.

use std::ffi::OsString;

use regex::Regex;
use tracing::{debug, error};

/// Runs a hypervisor binary's version subcommand and parses its output.
#[derive(Clone, Debug)]
pub struct VersionProbe {
    program: OsString,
    args: Vec<OsString>,

    /// The product name the version banner starts with, e.g. `QEMU`.
    product: String,

    /// The prefix of the returned version tag, e.g. `qemu`.
    tag: String,
}

impl VersionProbe {
    /// Creates a probe for `<system_prefix>-system-<host_arch> --version`,
    /// e.g. `qemu-system-x86_64 --version`.
    pub fn for_host(system_prefix: &str, host_arch: &str) -> Self {
        Self::new(format!("{system_prefix}-system-{host_arch}"))
            .args(["--version"])
    }

    /// Creates a probe that runs `program` with no arguments and expects a
    /// QEMU version banner.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            product: "QEMU".to_owned(),
            tag: "qemu".to_owned(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn product(mut self, product: &str, tag: &str) -> Self {
        self.product = product.to_owned();
        self.tag = tag.to_owned();
        self
    }

    /// The value returned when the version can't be determined.
    pub fn unknown(&self) -> String {
        format!("{}-unknown", self.tag)
    }

    /// Runs the version command to completion and yields `<tag>-X.Y.Z`, or
    /// `<tag>-unknown` if the command couldn't be run, failed, or printed
    /// something unexpected.
    pub fn version_string(&self) -> String {
        debug!(program = ?self.program, args = ?self.args, "probing hypervisor version");

        let output = match std::process::Command::new(&self.program)
            .args(&self.args)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                error!(
                    program = ?self.program,
                    error = %e,
                    "{} failed to start",
                    self.product
                );
                return self.unknown();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                program = ?self.program,
                error_code = output.status.code(),
                %stdout,
                %stderr,
                "{} version command failed",
                self.product
            );
            return self.unknown();
        }

        match self.parse(&stdout) {
            Some(version) => format!("{}-{version}", self.tag),
            None => {
                error!(
                    %stdout,
                    "failed to parse {} version output",
                    self.product
                );
                self.unknown()
            }
        }
    }

    /// Extracts the version number from a banner of the form
    /// `<product> emulator version X.Y.Z`.
    fn parse(&self, stdout: &str) -> Option<String> {
        let pattern = format!(
            r"^{} emulator version ([\d.]+)",
            regex::escape(&self.product)
        );

        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                error!(%pattern, error = %e, "invalid version pattern");
                return None;
            }
        };

        re.captures(stdout)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
    }
}
