//! Best-effort collection of Vault logs from cluster nodes.
//!
//! Nothing here fails a run: every problem is logged as a warning.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::gateway::RemoteExecutor;
use crate::host::Host;

/// Remote log files and the local name each is saved under.
pub const LOG_FILES: [(&str, &str); 3] = [
    ("/opt/vault/log/vault-stdout.log", "vault-stdout.log"),
    ("/opt/vault/log/vault-error.log", "vault-error.log"),
    ("/var/log/syslog", "syslog"),
];

/// Fetch [`LOG_FILES`] from every host into `<logs_dir>/<scenario>/<host>/`.
///
/// Returns the files that were written.
pub async fn collect_logs(
    executor: &dyn RemoteExecutor,
    hosts: &[&Host],
    logs_dir: &Path,
    scenario: &str,
) -> Vec<PathBuf> {
    let mut written = Vec::new();

    for host in hosts {
        let dest = logs_dir.join(scenario).join(&host.hostname);
        if let Err(e) = std::fs::create_dir_all(&dest) {
            warn!(dir = %dest.display(), error = %e, "Error creating log directory");
            continue;
        }

        for (remote, local) in LOG_FILES {
            let contents = match executor.run(host, &format!("cat {remote}")).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(host = %host.hostname, file = remote, error = %e, "Error getting log file from instance");
                    continue;
                }
            };

            let path = dest.join(local);
            info!(path = %path.display(), "Writing log file");
            match std::fs::write(&path, contents) {
                Ok(()) => written.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "Error writing log file"),
            }
        }
    }

    written
}
