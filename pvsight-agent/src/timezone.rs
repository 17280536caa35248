//! Process-wide time zone resolution.

use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::bus::{PropertyBus, RawValue};
use crate::discovery::{SETTINGS_SERVICE, paths};

/// Parse an IANA zone name. A leading `:` (as `TZ` allows) is ignored.
///
/// POSIX rule strings such as `CET-1CEST,M3.5.0,M10.5.0/3` carry no zone
/// name and are skipped with a warning.
fn parse_zone(source: &str, name: &str) -> Option<Tz> {
    let name = name.trim();
    let name = name.strip_prefix(':').unwrap_or(name);
    match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) if looks_like_posix_rule(name) => {
            warn!(source, name, "POSIX time zone rules are not supported; set an IANA name");
            None
        }
        Err(e) => {
            warn!(source, name, error = %e, "Ignoring unknown time zone");
            None
        }
    }
}

fn looks_like_posix_rule(name: &str) -> bool {
    name.contains(',') || (!name.contains('/') && name.chars().any(|c| c.is_ascii_digit()))
}

/// Resolve the time zone snapshots are stamped in.
///
/// Tries the configured name, then `TZ`, then the bus settings service,
/// and falls back to UTC.
pub async fn resolve_timezone(configured: Option<&str>, bus: &dyn PropertyBus) -> Tz {
    let env = std::env::var("TZ").ok();
    resolve_with_env(configured, env.as_deref(), bus).await
}

async fn resolve_with_env(
    configured: Option<&str>,
    env: Option<&str>,
    bus: &dyn PropertyBus,
) -> Tz {
    let candidates = [("config", configured), ("TZ", env)];
    for (source, name) in candidates {
        if let Some(tz) = name.filter(|n| !n.is_empty()).and_then(|n| parse_zone(source, n)) {
            info!(timezone = %tz, source, "Using time zone");
            return tz;
        }
    }

    match bus.get_value(SETTINGS_SERVICE, paths::TIME_ZONE).await {
        Ok(RawValue::String(name)) if !name.is_empty() => {
            if let Some(tz) = parse_zone("settings", &name) {
                info!(timezone = %tz, source = "settings", "Using time zone");
                return tz;
            }
        }
        Ok(other) => debug!(value = %other, "Settings time zone is not a name"),
        Err(e) => debug!(error = %e, "Settings time zone unavailable"),
    }

    info!("Using time zone UTC");
    Tz::UTC
}
