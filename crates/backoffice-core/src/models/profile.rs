use serde::{Deserialize, Serialize};

/// A postal address attached to a profile. The session manager never
/// inspects its fields; it is round-tripped exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub serde_json::Value);

/// The signed-in operator's profile, cached under the `profile` storage key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Profile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(rename = "addressDTOs", default)]
    #[cfg_attr(feature = "ts", ts(type = "Array<Record<string, unknown>>"))]
    pub address_dtos: Vec<Address>,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self == &Profile::default()
    }

    /// Name to show in the shell header: full name, then username, then email.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.username.as_deref().filter(|s| !s.is_empty()))
            .or(self.email.as_deref())
            .unwrap_or("")
    }
}
