//! Device-identity collaborator.
//!
//! The fingerprint binds derived keys to a device. It is salt or binding
//! input only and never serves as key material on its own.

/// Source of the stable per-device fingerprint.
pub trait DeviceIdentity: Send + Sync {
    /// A stable 32-byte fingerprint of this device.
    fn fingerprint(&self) -> [u8; 32];
}

/// A fixed fingerprint supplied by the host at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticDeviceIdentity {
    fingerprint: [u8; 32],
}

impl StaticDeviceIdentity {
    /// Wrap a pre-computed fingerprint.
    pub fn new(fingerprint: [u8; 32]) -> Self {
        Self { fingerprint }
    }
}

impl DeviceIdentity for StaticDeviceIdentity {
    fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity_is_stable() {
        let id = StaticDeviceIdentity::new([9; 32]);
        assert_eq!(id.fingerprint(), id.fingerprint());
        assert_eq!(id.fingerprint(), [9; 32]);
    }
}
