//! Exchange Client Factory
//!
//! Builds one exchange client per tenant from that tenant's own credentials.
//! Clients are never cached or shared: a configuration change produces a new
//! client for the restarted session.
//!
//! With a [`CredentialCipher`] configured, stored credentials are decrypted
//! here; a value that does not decrypt is a credential error for that tenant.

use crate::application::actors::orchestrator::ExchangeClientFactory;
use crate::domain::entities::tenant::TenantConfig;
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::infrastructure::binance_client::BinanceFuturesClient;
use crate::infrastructure::credential_cipher::CredentialCipher;
use std::sync::Arc;
use tracing::debug;

pub struct BinanceClientFactory {
    testnet: bool,
    cipher: Option<CredentialCipher>,
}

impl BinanceClientFactory {
    pub fn new(testnet: bool) -> Self {
        Self {
            testnet,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn is_testnet(&self) -> bool {
        self.testnet
    }
}

impl ExchangeClientFactory for BinanceClientFactory {
    fn create(&self, tenant: &TenantConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        let credentials = tenant
            .credentials
            .clone()
            .filter(|c| c.is_complete())
            .ok_or_else(|| {
                ExchangeError::Authentication(format!(
                    "Tenant {} has no API credentials",
                    tenant.tenant_id
                ))
            })?;
        let credentials = match &self.cipher {
            Some(cipher) => cipher.decrypt_credentials(&credentials).map_err(|e| {
                ExchangeError::Authentication(format!("Tenant {}: {}", tenant.tenant_id, e))
            })?,
            None => credentials,
        };

        let client = BinanceFuturesClient::new(credentials, self.testnet)?;
        debug!(
            "Created Binance futures client for tenant {} (testnet: {})",
            tenant.tenant_id, self.testnet
        );
        Ok(Arc::new(client))
    }
}
