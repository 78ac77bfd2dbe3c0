//! External IPv6 address lookup, logged for diagnosing farm connectivity.

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

/// Request timeout of the lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Lookup returned HTTP {0}")]
    HttpStatus(u16),
}

/// Ask `url` for this host's public address over IPv6 only.
pub async fn external_ipv6_address(url: &str) -> Result<String, LookupError> {
    let client = reqwest::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        .build()?;
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/plain")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(LookupError::HttpStatus(response.status().as_u16()));
    }
    Ok(response.text().await?.trim().to_string())
}

/// Log the external IPv6 address. Failures are warnings only.
pub async fn log_external_ipv6_address(url: &str) {
    match external_ipv6_address(url).await {
        Ok(address) => tracing::info!(address = %address, "External IPv6 address"),
        Err(e) => tracing::warn!(url, error = %e, "Failed to get external IPv6 address"),
    }
}
