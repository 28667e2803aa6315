//! Out-of-band recovery tool generator.
//!
//! Emits a dependency-light shell script embedding a full snapshot of the
//! current trusted source. The script is the safety valve for the case the
//! validator and writer failed to prevent in practice: a candidate that
//! passes every gate but is still broken at runtime. Operators must generate
//! it *before* attempting an update; it is never refreshed automatically.

use crate::config::WardenConfig;
use crate::error::WardenResult;
use crate::update::writer::{AtomicWriter, ElevatedMover};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub const RESCUE_FILE_NAME: &str = "warden-rescue.sh";

/// Builds and writes the standalone rescue script.
#[derive(Debug, Clone)]
pub struct RescueGenerator {
    artifact_path: PathBuf,
    service_unit: String,
    credential_field: String,
    default_credential: String,
}

impl RescueGenerator {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            artifact_path: config.agent.artifact_path.clone(),
            service_unit: config.agent.service_unit.clone(),
            credential_field: config.agent.credential_field.clone(),
            default_credential: config.agent.default_credential.clone(),
        }
    }

    /// Well-known location of the generated tool: next to the artifact.
    pub fn rescue_path(&self) -> PathBuf {
        self.artifact_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join(RESCUE_FILE_NAME)
    }

    /// Snapshot `trusted_source` into the rescue script and write it.
    pub fn generate<M: ElevatedMover>(
        &self,
        trusted_source: &str,
        writer: &AtomicWriter<M>,
    ) -> WardenResult<PathBuf> {
        let script = self.render(trusted_source);
        let path = self.rescue_path();
        writer.write(&path, &script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            {
                warn!(
                    "could not mark rescue tool executable at {}: {err}",
                    path.display()
                );
            }
        }

        info!("rescue tool written to {}", path.display());
        Ok(path)
    }

    /// Render the script text around a base64 copy of the trusted source.
    ///
    /// Base64 keeps the payload inert inside the heredoc regardless of what
    /// quoting the source itself contains.
    fn render(&self, trusted_source: &str) -> String {
        let payload = BASE64.encode(trusted_source.as_bytes());
        format!(
            r#"#!/bin/sh
# Warden rescue kit. Standalone: works even when the agent is down.
set -u

MAIN_FILE="{artifact}"
SERVICE="{unit}"
FIELD="{field}"
DEFAULT_CREDENTIAL="{credential}"
PAYLOAD="{payload}"

restart_service() {{
    if [ "$(id -u)" -eq 0 ]; then
        systemctl restart "$SERVICE"
    else
        sudo systemctl restart "$SERVICE"
    fi
}}

reset_credential() {{
    [ -f "$MAIN_FILE" ] || {{ echo "missing $MAIN_FILE" >&2; exit 1; }}
    sed -i "s/${{FIELD}}[[:space:]]*=[[:space:]]*\"[^\"]*\"/${{FIELD}} = \"${{DEFAULT_CREDENTIAL}}\"/" "$MAIN_FILE"
    echo "credential reset to default; restarting $SERVICE"
    restart_service
}}

factory_reset() {{
    printf '%s' "$PAYLOAD" | base64 -d > "$MAIN_FILE" || {{ echo "restore failed" >&2; exit 1; }}
    echo "restored last known good source; restarting $SERVICE"
    restart_service
}}

case "${{1:-}}" in
    reset-credential) reset_credential ;;
    factory-reset) factory_reset ;;
    *)
        echo "usage: $0 reset-credential | factory-reset" >&2
        exit 2
        ;;
esac
"#,
            artifact = self.artifact_path.display(),
            unit = self.service_unit,
            field = self.credential_field,
            credential = self.default_credential,
            payload = payload,
        )
    }
}
