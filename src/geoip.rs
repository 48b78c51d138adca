//! GeoIP enrichment seam
//!
//! Lookups themselves live outside the store; whatever performs them plugs
//! in through [`GeoResolver`] and results land in `geoip_cache`/`asn_cache`.

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::Result;
use crate::model::IpGeolocation;

/// Resolves a public address to its location and network owner.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Option<IpGeolocation>;
}

/// Check if an IP address is private/local
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Resolve every public IP in `ips` that has no cached geolocation yet and
/// store the answers. Returns how many addresses were newly cached.
pub async fn enrich_missing(db: &Database, resolver: &dyn GeoResolver, ips: &[String]) -> Result<usize> {
    let mut saved = 0;
    let unique: BTreeSet<&str> = ips.iter().map(String::as_str).collect();

    for raw in unique {
        let Ok(ip) = raw.parse::<IpAddr>() else {
            debug!(ip = raw, "Skipping unparsable address");
            continue;
        };
        if is_private_ip(&ip) || db.get_ip_geolocation(raw).await?.is_some() {
            continue;
        }
        let Some(geo) = resolver.lookup(ip).await else {
            warn!(ip = raw, "GeoIP lookup returned nothing");
            continue;
        };

        db.save_ip_geolocation(raw, &geo).await?;
        if !geo.asn.is_empty() {
            db.update_asn_info(raw, &geo.asn, &geo.as_name).await?;
        }
        saved += 1;
    }
    Ok(saved)
}
