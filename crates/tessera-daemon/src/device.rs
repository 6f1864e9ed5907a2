//! Host-provisioned device identity.
//!
//! The fingerprint is 32 random bytes written once to `device.id` (hex) in
//! the data directory. Losing the file changes the fingerprint, which makes a
//! passphrase-derived master key underivable and the local fallback key
//! unrecoverable.

use std::path::Path;

use anyhow::Context;
use rand::RngCore;
use tessera_store::StaticDeviceIdentity;
use tracing::info;

const DEVICE_ID_FILE: &str = "device.id";

/// Load the device fingerprint from `data_dir`, creating it on first start.
pub fn load_or_create(data_dir: &Path) -> anyhow::Result<StaticDeviceIdentity> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("device id is not hex")?;
        let fingerprint: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("device id must be 32 bytes"))?;
        return Ok(StaticDeviceIdentity::new(fingerprint));
    }

    let mut fingerprint = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut fingerprint);
    std::fs::write(&path, hex::encode(fingerprint))
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Created device identity");
    Ok(StaticDeviceIdentity::new(fingerprint))
}
