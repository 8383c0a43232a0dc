// Canonical remote identity
// Maps provider-specific addresses onto the key used to dedup conversations

use once_cell::sync::Lazy;
use regex::Regex;

// user[:device]@server
static ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<user>[^@:\s]+)(?::\d+)?@(?P<server>[^@\s]+)$").expect("static pattern is valid")
});

const GROUP_SERVER: &str = "g.us";
const BROADCAST_SERVER: &str = "broadcast";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity {
    pub key: String,
    pub is_group: bool,
}

impl RemoteIdentity {
    /// Resolve an address such as `5511999990000@s.whatsapp.net`.
    ///
    /// Returns `None` for empty and broadcast addresses. A bare handle with
    /// no server part is accepted as-is.
    pub fn resolve(address: &str) -> Option<Self> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }

        if let Some(caps) = ADDRESS.captures(address) {
            let server = caps.name("server").map(|m| m.as_str()).unwrap_or_default();
            if server == BROADCAST_SERVER {
                return None;
            }
            let user = caps.name("user").map(|m| m.as_str()).unwrap_or_default();
            return Some(RemoteIdentity {
                key: user.to_string(),
                is_group: server == GROUP_SERVER,
            });
        }

        if address.contains('@') || address.chars().any(char::is_whitespace) {
            return None;
        }
        Some(RemoteIdentity { key: address.to_string(), is_group: false })
    }

    /// Phone number shown for the contact; groups have none.
    pub fn phone(&self) -> Option<&str> {
        (!self.is_group).then_some(self.key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_addresses_share_one_identity() {
        let plain = RemoteIdentity::resolve("5511999990000@s.whatsapp.net").unwrap();
        let device = RemoteIdentity::resolve("5511999990000:12@s.whatsapp.net").unwrap();
        let legacy = RemoteIdentity::resolve("5511999990000@c.us").unwrap();

        assert_eq!(plain.key, "5511999990000");
        assert_eq!(plain, device);
        assert_eq!(plain, legacy);
        assert!(!plain.is_group);
        assert_eq!(plain.phone(), Some("5511999990000"));
    }

    #[test]
    fn test_group_is_tagged() {
        let group = RemoteIdentity::resolve("120363025246125888@g.us").unwrap();
        assert_eq!(group.key, "120363025246125888");
        assert!(group.is_group);
        assert_eq!(group.phone(), None);
    }

    #[test]
    fn test_unresolvable_addresses() {
        assert!(RemoteIdentity::resolve("").is_none());
        assert!(RemoteIdentity::resolve("   ").is_none());
        assert!(RemoteIdentity::resolve("status@broadcast").is_none());
        assert!(RemoteIdentity::resolve("@s.whatsapp.net").is_none());
        assert!(RemoteIdentity::resolve("a@b@c").is_none());
    }

    #[test]
    fn test_bare_handle_is_accepted() {
        let bare = RemoteIdentity::resolve("5511988887777").unwrap();
        assert_eq!(bare.key, "5511988887777");
    }
}
