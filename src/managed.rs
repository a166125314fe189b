//! Managed storage account contract.
//!
//! When enabled, the operator mints a container SAS URL for captures that
//! do not name a blob secret, and stores it in a secret it owns.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::Secret;
use crate::constants::{
    BLOB_SECRET_KEY, CAPTURE_NAME_LABEL_KEY, MANAGED_SECRET_PREFIX,
};
use crate::domain::CaptureRequest;

/// Issues upload URLs against an operator-managed storage account.
#[async_trait]
pub trait SasUrlIssuer: Send + Sync {
    /// Container holding captures from `namespace`.
    fn container_name(&self, namespace: &str) -> String;

    /// Create a container SAS URL valid for `validity`.
    async fn create_container_sas_url(
        &self,
        namespace: &str,
        validity: Duration,
    ) -> anyhow::Result<String>;
}

/// Name of the secret the operator provisions for `capture_name`.
pub fn managed_secret_name(capture_name: &str) -> String {
    format!("{}{}", MANAGED_SECRET_PREFIX, capture_name)
}

pub(crate) fn managed_secret(capture: &CaptureRequest, sas_url: &str) -> Secret {
    Secret {
        name: managed_secret_name(&capture.name),
        namespace: capture.namespace.clone(),
        labels: BTreeMap::from([(
            CAPTURE_NAME_LABEL_KEY.to_string(),
            capture.name.clone(),
        )]),
        data: BTreeMap::from([(
            BLOB_SECRET_KEY.to_string(),
            sas_url.as_bytes().to_vec(),
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_secret_name() {
        assert_eq!(managed_secret_name("cap"), "managed-cap");
    }
}
