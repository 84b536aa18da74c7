use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Channel through which a driver talks to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionMethod {
    /// In-process library calls.
    Internal,
    /// Commands spawned on this machine.
    LocalShell,
    /// Commands tunneled through a remote shell to the server host.
    RemoteShell,
}

impl SubmissionMethod {
    /// Derives the submission method from a configured server value.
    ///
    /// No server selects [`SubmissionMethod::Internal`], `local` (in any letter case) selects
    /// [`SubmissionMethod::LocalShell`] and every other value is a host name reached through
    /// [`SubmissionMethod::RemoteShell`]. The value is not trimmed.
    pub fn resolve(server: Option<&str>) -> SubmissionMethod {
        match server {
            None | Some("") => SubmissionMethod::Internal,
            Some(server) if server.eq_ignore_ascii_case("local") => SubmissionMethod::LocalShell,
            Some(_) => SubmissionMethod::RemoteShell,
        }
    }
}

impl Display for SubmissionMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubmissionMethod::Internal => "internal",
            SubmissionMethod::LocalShell => "local shell",
            SubmissionMethod::RemoteShell => "remote shell",
        };
        f.write_str(name)
    }
}
