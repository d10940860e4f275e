use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// A registered VPN user, keyed by the address it connects from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub real_address: IpAddr,
    pub virtual_address: IpAddr,
    pub common_name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(real_address: IpAddr, virtual_address: IpAddr, common_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            real_address,
            virtual_address,
            common_name: common_name.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Read access to registered identities, by real address.
pub trait IdentityLookup {
    fn lookup(&self, real_address: &IpAddr) -> Option<&UserRecord>;
}

/// On-disk layouts accepted when reading the registry file.
///
/// Older deployments stored an object keyed by real address; it is read
/// transparently and rewritten as a list on the next mutation.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RegistryDocument {
    List(Vec<UserRecord>),
    Keyed(BTreeMap<String, KeyedUser>),
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyedUser {
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub virtual_ip: IpAddr,
    pub real_ip: IpAddr,
    pub common_name: String,
}

impl RegistryDocument {
    pub(crate) fn into_records(self) -> Vec<UserRecord> {
        match self {
            RegistryDocument::List(records) => records,
            RegistryDocument::Keyed(map) => map
                .into_values()
                .map(|u| UserRecord {
                    id: u.uuid,
                    real_address: u.real_ip,
                    virtual_address: u.virtual_ip,
                    common_name: u.common_name,
                    created_at: Utc::now(),
                })
                .collect(),
        }
    }
}
