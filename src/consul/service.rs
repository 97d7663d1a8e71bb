//! Service registration with active/standby tags and a sealed-state TTL
//! check.

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{CheckStatus, ServiceCheck, ServiceRegistration};
use super::{ConsulBackend, ServiceSettings};
use crate::error::{PhysicalError, Result};
use crate::store::{ServiceDiscovery, StatusFn};

/// Host and port advertised for this node.
pub(crate) fn advertise_addr(settings: &ServiceSettings, redirect_addr: &str) -> Result<(String, u16)> {
    let url = Url::parse(redirect_addr)
        .map_err(|e| PhysicalError::Config(format!("invalid redirect address {redirect_addr:?}: {e}")))?;
    let host = match &settings.address {
        Some(address) => address.clone(),
        None => url
            .host_str()
            .ok_or_else(|| PhysicalError::Config(format!("redirect address {redirect_addr:?} has no host")))?
            .to_string(),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| PhysicalError::Config(format!("redirect address {redirect_addr:?} has no port")))?;
    Ok((host, port))
}

fn registration(
    settings: &ServiceSettings,
    host: &str,
    port: u16,
    active: bool,
) -> ServiceRegistration {
    let id = format!("{}:{}:{}", settings.name, host, port);
    let mut tags = vec![if active { "active" } else { "standby" }.to_string()];
    tags.extend(settings.tags.iter().cloned());
    ServiceRegistration {
        check: ServiceCheck {
            check_id: format!("{id}:vault-sealed-check"),
            name: "Vault Sealed Status".to_string(),
            ttl: format!("{}ms", settings.check_timeout.as_millis()),
            notes: "Vault service is healthy when Vault is in an unsealed status and can become an active Vault server".to_string(),
        },
        id,
        name: settings.name.clone(),
        tags,
        address: host.to_string(),
        port,
    }
}

#[async_trait]
impl ServiceDiscovery for ConsulBackend {
    fn notify_active_state_change(&self) -> Result<()> {
        self.state_changed.notify_one();
        Ok(())
    }

    fn notify_sealed_state_change(&self) -> Result<()> {
        self.state_changed.notify_one();
        Ok(())
    }

    async fn run_service_discovery(
        &self,
        shutdown: CancellationToken,
        redirect_addr: String,
        is_active: StatusFn,
        is_sealed: StatusFn,
    ) -> Result<()> {
        if self.service.disable_registration {
            shutdown.cancelled().await;
            return Ok(());
        }
        let (host, port) = advertise_addr(&self.service, &redirect_addr)?;
        // Refresh the TTL check well before it expires.
        let interval = self.service.check_timeout * 2 / 3;

        let mut registered: Option<(String, bool)> = None;
        loop {
            let active = is_active();
            if registered.as_ref().map(|(_, a)| *a) != Some(active) {
                let reg = registration(&self.service, &host, port, active);
                match self.api.service_register(&reg).await {
                    Ok(()) => {
                        info!(service_id = %reg.id, active, "registered service with consul");
                        registered = Some((reg.id, active));
                    }
                    Err(e) => warn!(error = %e, "service registration failed"),
                }
            }

            if let Some((id, _)) = &registered {
                let check_id = format!("{id}:vault-sealed-check");
                let (status, output) = if is_sealed() {
                    (CheckStatus::Critical, "Vault Sealed")
                } else {
                    (CheckStatus::Passing, "Vault Unsealed")
                };
                if let Err(e) = self.api.check_update(&check_id, status, output).await {
                    warn!(error = %e, "check update failed, will re-register");
                    registered = None;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.state_changed.notified() => debug!("service state changed"),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if let Some((id, _)) = registered {
            if let Err(e) = self.api.service_deregister(&id).await {
                warn!(service_id = %id, error = %e, "service deregistration failed");
            }
        }
        Ok(())
    }
}
