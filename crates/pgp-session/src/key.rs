use serde::{Deserialize, Serialize};

/// A snapshot of one key in the keyring.
///
/// It holds no reference to the engine: it does not change when
/// the keyring does.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// The primary key's fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// The primary user ID's email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// The primary user ID's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The key has been revoked.
    pub revoked: bool,
    /// The key has expired.
    pub expired: bool,
    /// The key has been disabled.
    pub disabled: bool,
    /// The key is invalid.
    pub invalid: bool,
    /// The key can be used for encryption.
    pub can_encrypt: bool,
    /// The key is a secret key.
    pub secret: bool,
}

impl KeyRecord {
    /// Reports whether the key can be used as an encryption
    /// recipient right now.
    pub fn is_usable_recipient(&self) -> bool {
        self.can_encrypt && !(self.revoked || self.expired || self.disabled || self.invalid)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_missing_fields_are_omitted() {
        let record = KeyRecord {
            fingerprint: Some("A64E809A524210FEDB60125260354C83F789A9E5".into()),
            can_encrypt: true,
            ..Default::default()
        };
        let got = serde_json::to_value(&record).expect("should serialize");
        assert_eq!(
            got,
            json!({
                "fingerprint": "A64E809A524210FEDB60125260354C83F789A9E5",
                "revoked": false,
                "expired": false,
                "disabled": false,
                "invalid": false,
                "can_encrypt": true,
                "secret": false,
            })
        );
    }

    #[test]
    fn test_usable_recipient() {
        let ok = KeyRecord {
            can_encrypt: true,
            ..Default::default()
        };
        assert!(ok.is_usable_recipient());
        assert!(
            !KeyRecord {
                expired: true,
                ..ok.clone()
            }
            .is_usable_recipient()
        );
        assert!(!KeyRecord::default().is_usable_recipient());
    }
}
