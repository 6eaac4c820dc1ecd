//! Dynamic DNS updates.
//!
//! Each kite's domain is pointed at the wanted, connected frontends with a
//! signed GET against the configured URL template.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use kitemux_core::Status;
use kitemux_core::sign::{sign, time_salt};

use crate::context::Context;
use crate::selector::{DDNS_UPDATE_INTERVAL_MIN, ddns_plan, mark_published};

/// Length of DDNS request signatures, salt included.
const DDNS_SIGNATURE_LEN: usize = 100;
const DDNS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum DdnsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Update refused: {0}")]
    Refused(String),
}

/// Fill the `%s` slots of `template` with domain, addresses and signature.
pub fn expand_url(template: &str, domain: &str, addresses: &str, signature: &str) -> String {
    let mut values = [domain, addresses, signature].into_iter();
    let mut parts = template.split("%s");
    let mut url = parts.next().unwrap_or_default().to_string();
    for part in parts {
        url.push_str(values.next().unwrap_or_default());
        url.push_str(part);
    }
    url
}

/// Whether a DDNS response body reports success.
pub fn accepted(body: &str) -> bool {
    let body = body.trim_start().to_ascii_lowercase();
    body.starts_with("nochg") || body.starts_with("good")
}

fn build_client() -> Result<reqwest::Client, DdnsError> {
    // reqwest is built without a default crypto provider; an Err here only
    // means one is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(reqwest::Client::builder()
        .timeout(DDNS_REQUEST_TIMEOUT)
        .build()?)
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<(), DdnsError> {
    let body = client.get(url).send().await?.text().await?;
    if accepted(&body) {
        Ok(())
    } else {
        Err(DdnsError::Refused(body.chars().take(7).collect()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Push the current frontend addresses to DNS if they changed.
///
/// Rate limited to one pass per [`DDNS_UPDATE_INTERVAL_MIN`]. Returns the
/// number of failed updates.
pub async fn update_dns(ctx: &Context) -> usize {
    let Some(template) = ctx.config.dynamic_dns_url.as_deref() else {
        return 0;
    };
    let started = Instant::now();
    let recent = ctx
        .housekeeping()
        .last_dns_update
        .is_some_and(|t| started.saturating_duration_since(t) < DDNS_UPDATE_INTERVAL_MIN);
    if recent {
        return 0;
    }
    let force = ctx.state.force_update();
    let Some(plan) = ddns_plan(&ctx.frontends(), force) else {
        return 0;
    };
    let kites: Vec<(String, String)> = ctx
        .kites()
        .iter()
        .map(|(_, k)| (k.public_domain.clone(), k.secret.clone()))
        .collect();

    let client = match build_client() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "DDNS: Failed to build HTTP client");
            return kites.len().max(1);
        }
    };

    let mut failures = 0;
    for (domain, secret) in &kites {
        ctx.state.set_status(Status::UpdatingDns);
        let payload = format!("{domain}:{}", plan.addresses);
        let signature = sign(secret, &payload, &time_salt(unix_now()), DDNS_SIGNATURE_LEN);
        let url = expand_url(template, domain, &plan.addresses, &signature);
        match fetch(&client, &url).await {
            Ok(()) => {
                info!(domain = %domain, addresses = %plan.addresses, "DDNS: Update OK");
                mark_published(&mut ctx.frontends(), &plan.members, Instant::now());
            }
            Err(DdnsError::Refused(result)) => {
                error!(domain = %domain, url = %url, result = %result, "DDNS: Update failed");
                failures += 1;
            }
            Err(e) => {
                error!(url = %url, error = %e, "DDNS: No response");
                failures += 1;
            }
        }
    }

    ctx.housekeeping().last_dns_update = Some(Instant::now());
    failures
}
