use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use url::{form_urlencoded, Url};

use crate::models::{OutputProfile, OutputTarget};

use super::error::{BuildError, BuildResult};

/// Destination URL for `target` with transport parameters merged in.
///
/// Parameters already present in the URL are kept, except `overrun_nonfatal`
/// which an explicit target override always sets. Only `udp://` URLs are
/// enriched; anything else passes through untouched. The resulting query is
/// sorted by key, so resolving an already-resolved URL is a no-op.
pub fn resolve_url(profile: &OutputProfile, target: &OutputTarget) -> BuildResult<String> {
    let raw = target.target_url.trim();
    if raw.is_empty() {
        return Err(BuildError::InvalidTarget(format!(
            "target {} ({:?}) has an empty url",
            target.id, target.name
        )));
    }

    let parsed = match Url::parse(raw) {
        Ok(url) if url.scheme() == "udp" => url,
        _ => return Ok(raw.to_string()),
    };

    let (rest, fragment) = match raw.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (raw, None),
    };
    let (base, query) = rest.split_once('?').unwrap_or((rest, ""));

    let mut params: BTreeMap<String, String> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    if let Some(pkt_size) = target.pkt_size.or(profile.default_pkt_size) {
        if pkt_size > 0 {
            params
                .entry("pkt_size".into())
                .or_insert_with(|| pkt_size.to_string());
        }
    }

    match target.overrun_nonfatal {
        Some(value) => {
            params.insert("overrun_nonfatal".into(), flag(value).into());
        }
        None if profile.default_overrun_nonfatal => {
            params
                .entry("overrun_nonfatal".into())
                .or_insert_with(|| flag(true).into());
        }
        None => {}
    }

    if let Some(fifo_size) = target.fifo_size {
        params
            .entry("fifo_size".into())
            .or_insert_with(|| fifo_size.to_string());
    }
    if let Some(buffer_size) = target.buffer_size {
        params
            .entry("buffer_size".into())
            .or_insert_with(|| buffer_size.to_string());
    }

    if let Some(ttl) = target.ttl.or(profile.default_ttl) {
        if ttl > 0 && parsed.host_str().is_some_and(is_multicast_host) {
            params.entry("ttl".into()).or_insert_with(|| ttl.to_string());
        }
    }

    let mut resolved = base.to_string();
    if !params.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        resolved.push('?');
        resolved.push_str(&query);
    }
    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    Ok(resolved)
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn is_multicast_host(host: &str) -> bool {
    host.parse::<Ipv4Addr>()
        .map(|addr| addr.is_multicast())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> OutputProfile {
        let mut profile = OutputProfile::default_copy();
        profile.default_ttl = Some(16);
        profile
    }

    fn target(url: &str) -> OutputTarget {
        OutputTarget::new(1, 1, url)
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = resolve_url(&profile(), &target("   ")).unwrap_err();
        assert!(matches!(err, BuildError::InvalidTarget(_)));
    }

    #[test]
    fn non_udp_urls_pass_through() {
        let url = "srt://10.0.0.1:9000?mode=caller";
        assert_eq!(resolve_url(&profile(), &target(url)).unwrap(), url);
    }

    #[test]
    fn multicast_destination_gains_profile_defaults() {
        let resolved = resolve_url(&profile(), &target("udp://230.1.1.1:5000")).unwrap();
        assert_eq!(
            resolved,
            "udp://230.1.1.1:5000?overrun_nonfatal=1&pkt_size=1316&ttl=16"
        );
    }

    #[test]
    fn unicast_destination_never_gets_ttl() {
        let resolved = resolve_url(&profile(), &target("udp://10.0.0.1:5000")).unwrap();
        assert_eq!(resolved, "udp://10.0.0.1:5000?overrun_nonfatal=1&pkt_size=1316");
    }

    #[test]
    fn existing_parameters_win_over_defaults() {
        let mut target = target("udp://239.1.1.1:5000?pkt_size=188&ttl=4");
        target.fifo_size = Some(5000);
        let resolved = resolve_url(&profile(), &target).unwrap();
        assert_eq!(
            resolved,
            "udp://239.1.1.1:5000?fifo_size=5000&overrun_nonfatal=1&pkt_size=188&ttl=4"
        );
    }

    #[test]
    fn explicit_overrun_override_replaces_url_value() {
        let mut target = target("udp://10.0.0.1:5000?overrun_nonfatal=1");
        target.overrun_nonfatal = Some(false);
        let resolved = resolve_url(&profile(), &target).unwrap();
        assert!(resolved.contains("overrun_nonfatal=0"));
    }

    #[test]
    fn resolving_twice_is_stable() {
        let mut target = target("udp://@239.0.0.1:5000?localaddr=10.0.0.5");
        target.buffer_size = Some(65536);
        target.overrun_nonfatal = Some(true);
        let once = resolve_url(&profile(), &target).unwrap();
        target.target_url = once.clone();
        let twice = resolve_url(&profile(), &target).unwrap();
        assert_eq!(once, twice);
        assert!(once.starts_with("udp://@239.0.0.1:5000?"));
    }
}
