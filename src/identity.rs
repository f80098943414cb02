//! Client boundary to the Identity Server (gateway identity/credentials),
//! which lives outside this crate. The gateway server only ever talks to it
//! through this trait, so a real RPC client can be dropped in without
//! touching the rest of the crate.

use crate::error::Result;
use crate::message::{GatewayIdentity, Location};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct GatewayRecord {
    pub identity: GatewayIdentity,
    pub api_key: String,
    pub location_public: bool,
    pub update_location_from_status: bool,
    pub frequency_plan_id: String,
    pub antenna_location: Option<Location>,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Authenticate a gateway by identity + credential (API key, or for
    /// EUI-only protocols, an empty credential). Returns the gateway's
    /// record on success.
    async fn authenticate(&self, identity: &GatewayIdentity, credential: &str) -> Result<GatewayRecord>;

    /// Look up a gateway record without authenticating (used for EUI-only
    /// policy checks and location enrichment).
    async fn lookup(&self, identity: &GatewayIdentity) -> Result<GatewayRecord>;

    /// Overwrite the stored antenna location for a gateway, as driven by
    /// `UpdateLocationFromStatus`.
    async fn update_location(&self, identity: &GatewayIdentity, location: Location) -> Result<()>;
}

/// In-memory stand-in identity provider, used by tests and as the default
/// when no real Identity Server is configured.
#[derive(Default)]
pub struct InMemoryIdentityClient {
    records: RwLock<HashMap<GatewayIdentity, GatewayRecord>>,
    require_registered: bool,
}

impl InMemoryIdentityClient {
    pub fn new(require_registered: bool) -> Self {
        Self { records: RwLock::new(HashMap::new()), require_registered }
    }

    pub fn register(&self, record: GatewayRecord) {
        self.records.write().unwrap().insert(record.identity.clone(), record);
    }
}

#[async_trait]
impl IdentityClient for InMemoryIdentityClient {
    async fn authenticate(&self, identity: &GatewayIdentity, credential: &str) -> Result<GatewayRecord> {
        let records = self.records.read().unwrap();
        match records.get(identity) {
            Some(record) if record.api_key == credential => Ok(record.clone()),
            Some(_) => Err(crate::error::Error::Unauthenticated),
            None if matches!(identity, GatewayIdentity::Eui(_)) && !self.require_registered => {
                Ok(GatewayRecord {
                    identity: identity.clone(),
                    api_key: String::new(),
                    location_public: false,
                    update_location_from_status: false,
                    frequency_plan_id: gs_core::frequency_plan::EU_863_870.to_string(),
                    antenna_location: None,
                })
            }
            None => Err(crate::error::Error::NotFound(identity.to_string())),
        }
    }

    async fn lookup(&self, identity: &GatewayIdentity) -> Result<GatewayRecord> {
        self.records
            .read()
            .unwrap()
            .get(identity)
            .cloned()
            .ok_or_else(|| crate::error::Error::NotFound(identity.to_string()))
    }

    async fn update_location(&self, identity: &GatewayIdentity, location: Location) -> Result<()> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(identity) {
            Some(record) => {
                record.antenna_location = Some(location);
                Ok(())
            }
            None => Err(crate::error::Error::NotFound(identity.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn unregistered_eui_gateway_auto_provisions_when_not_required() {
        let client = InMemoryIdentityClient::new(false);
        let identity = GatewayIdentity::Eui([1, 2, 3, 4, 5, 6, 7, 8]);
        let record = client.authenticate(&identity, "").await.unwrap();
        assert_eq!(record.frequency_plan_id, gs_core::frequency_plan::EU_863_870);
        assert!(!record.location_public);
    }

    #[tokio::test]
    async fn unregistered_eui_gateway_is_rejected_when_required() {
        let client = InMemoryIdentityClient::new(true);
        let identity = GatewayIdentity::Eui([1, 2, 3, 4, 5, 6, 7, 8]);
        let err = client.authenticate(&identity, "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn string_identity_always_requires_registration() {
        let client = InMemoryIdentityClient::new(false);
        let identity = GatewayIdentity::Id("gw-1".to_string());
        let err = client.authenticate(&identity, "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn update_location_persists_for_later_lookups() {
        let client = InMemoryIdentityClient::new(true);
        let identity = GatewayIdentity::Id("gw-1".to_string());
        client.register(GatewayRecord {
            identity: identity.clone(),
            api_key: "key".to_string(),
            location_public: true,
            update_location_from_status: true,
            frequency_plan_id: gs_core::frequency_plan::EU_863_870.to_string(),
            antenna_location: None,
        });
        let location = Location { latitude: 1.0, longitude: 2.0, altitude_m: 3.0 };
        client.update_location(&identity, location).await.unwrap();
        let record = client.lookup(&identity).await.unwrap();
        assert_eq!(record.antenna_location, Some(location));
    }
}
