//! Throwaway ssh key pairs via `ssh-keygen`.

use std::path::Path;

use tokio::process::Command;

use super::run_tool;
use crate::error::{HarnessError, Result};
use crate::host::KeyPair;

/// Generate an RSA key pair under `dir` and load it.
///
/// # Errors
/// Fails if ssh-keygen fails or the key files cannot be read.
pub async fn generate_key_pair(program: &str, dir: &Path, comment: &str) -> Result<KeyPair> {
    let private_key = dir.join("id_rsa");

    run_tool(
        "ssh-keygen",
        Command::new(program)
            .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-C", comment, "-f"])
            .arg(&private_key),
    )
    .await?;

    KeyPair::from_files(&private_key).map_err(|e| HarnessError::Tool {
        tool: "ssh-keygen",
        message: format!("cannot read generated key: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::fake_tool;

    #[tokio::test]
    async fn test_loads_generated_files() {
        let bin = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        // The last argument is the -f path.
        let keygen = fake_tool(
            bin.path(),
            "ssh-keygen",
            r#"for last; do :; done
echo PRIVATE > "$last"
echo "ssh-rsa PUB terratest" > "$last.pub""#,
        );

        let pair = generate_key_pair(&keygen, out.path(), "terratest").await.unwrap();
        assert_eq!(pair.public_key, "ssh-rsa PUB terratest");
        assert_eq!(pair.private_key.trim(), "PRIVATE");
    }
}
