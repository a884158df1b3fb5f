//! SSRF and eclipse defense.
//!
//! Every outbound target passes through here: mirror URLs are checked at
//! the string level before any fetch, and peer multiaddresses are checked
//! at the address level before any dial. Both checks share one notion of
//! a blocked IP so the two layers cannot drift apart.

use std::net::IpAddr;

use crate::types::Multiaddr;

/// Path fragments a Debian-family repository URL must carry.
const REPO_PATH_FRAGMENTS: &[&str] = &["/dists/", "/pool/", "/debian/", "/ubuntu/", "/linuxmint/"];

/// Domains of well-known mirror operators, matched by suffix.
const KNOWN_MIRROR_SUFFIXES: &[&str] = &[
    "debian.org",
    "debian.net",
    "ubuntu.com",
    "linuxmint.com",
    "raspbian.org",
];

/// Generic mirror-style hostname prefixes (`mirror.kernel.org`,
/// `ftp.de.debian.org`, `archive.ubuntu.com`, ...).
const MIRROR_HOST_PREFIXES: &[&str] = &[
    "mirror", "ftp.", "deb.", "archive.", "security.", "packages.", "apt.",
];

/// Hostnames that reach cloud instance metadata services.
const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "metadata.internal"];

/// True when `ip` must never be dialed or fetched from: loopback,
/// private, link-local, ULA or unspecified ranges.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(&IpAddr::V4(mapped));
            }
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (seg0 & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg0 & 0xffc0) == 0xfe80
        }
    }
}

/// Extract the host from an URL that already carries a scheme. Strips
/// userinfo and port, unwraps bracketed IPv6 literals.
fn host_of(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // `http://user@host/` tricks naive checks; keep only the real host.
    let host_port = authority.rsplit('@').next()?;
    if host_port.is_empty() {
        return None;
    }
    if let Some(bracketed) = host_port.strip_prefix('[') {
        return bracketed.split(']').next();
    }
    Some(host_port.split(':').next().unwrap_or(host_port))
}

fn host_is_blocked(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    if METADATA_HOSTS.contains(&host) {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_blocked_ip(&ip);
    }
    false
}

fn is_known_mirror_host(host: &str) -> bool {
    KNOWN_MIRROR_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
        || MIRROR_HOST_PREFIXES
            .iter()
            .any(|prefix| host.starts_with(prefix))
}

fn matches_extra_host(host: &str, extra_hosts: &[String]) -> bool {
    extra_hosts.iter().any(|extra| {
        let extra = extra.trim().to_ascii_lowercase();
        !extra.is_empty() && (host == extra || host.ends_with(&format!(".{extra}")))
    })
}

/// Whether `url` is an acceptable mirror target: not a private or
/// metadata address, shaped like a Debian repository path, and pointing
/// at a known mirror host or one of `extra_hosts`.
pub fn is_allowed_mirror_url(url: &str, extra_hosts: &[String]) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return false;
    }
    let Some(host) = host_of(&lower) else {
        return false;
    };
    if host_is_blocked(host) {
        return false;
    }
    if !REPO_PATH_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
    {
        return false;
    }
    is_known_mirror_host(host) || matches_extra_host(host, extra_hosts)
}

/// Whether `url` points a repository path at a loopback host. Loopback
/// mirrors are rejected by [`is_allowed_mirror_url`]; deployments that
/// chain to a mirror on the same machine opt back in with an explicit
/// configuration flag, which this check backs.
pub fn is_loopback_mirror_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return false;
    }
    let Some(host) = host_of(&lower) else {
        return false;
    };
    let loopback = host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
    loopback
        && REPO_PATH_FRAGMENTS
            .iter()
            .any(|fragment| lower.contains(fragment))
}

/// Whether a CONNECT `host:port` target is acceptable. Only ports 80 and
/// 443 are ever tunneled.
pub fn is_allowed_connect_target(host_port: &str, extra_hosts: &[String]) -> bool {
    let lower = host_port.trim().to_ascii_lowercase();
    let (host, port) = match lower.rsplit_once(':') {
        Some((h, p)) => (h.trim_matches(['[', ']']), p),
        None => return false,
    };
    let Ok(port) = port.parse::<u16>() else {
        return false;
    };
    if port != 80 && port != 443 {
        return false;
    }
    if host.is_empty() || host_is_blocked(host) {
        return false;
    }
    is_known_mirror_host(host) || matches_extra_host(host, extra_hosts)
}

/// Whether a provider-advertised multiaddress must be discarded. DHT
/// records steering peers to private addresses are the eclipse-attack
/// vector; addresses without an IP component resolve later and pass.
pub fn is_blocked_peer_addr(addr: &Multiaddr) -> bool {
    match addr.ip() {
        Some(ip) => is_blocked_ip(&ip),
        None => false,
    }
}

/// The subset of `addrs` that may be dialed.
pub fn filter_blocked_addrs(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    addrs
        .into_iter()
        .filter(|addr| !is_blocked_peer_addr(addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_extra() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn allows_known_mirrors() {
        for url in [
            "http://deb.debian.org/debian/pool/main/h/hello/hello_2.10.deb",
            "http://archive.ubuntu.com/ubuntu/dists/noble/Release",
            "https://security.debian.org/debian-security/pool/updates/a/a.deb",
            "http://mirror.example.com/pool/x/x.deb",
            "http://packages.linuxmint.com/pool/main/m/mint/mint.deb",
        ] {
            assert!(is_allowed_mirror_url(url, &no_extra()), "{url}");
        }
    }

    #[test]
    fn blocks_private_loopback_and_metadata_targets() {
        for url in [
            "http://127.0.0.1/debian/pool/a.deb",
            "http://localhost/debian/pool/a.deb",
            "http://10.1.2.3/ubuntu/pool/a.deb",
            "http://192.168.1.10/debian/dists/Release",
            "http://172.16.9.9/debian/pool/a.deb",
            "http://169.254.169.254/debian/pool/a.deb",
            "http://0.0.0.0/debian/pool/a.deb",
            "http://[::1]/debian/pool/a.deb",
            "http://[fd00::1]/debian/pool/a.deb",
            "http://[fe80::1]/debian/pool/a.deb",
            "http://metadata.google.internal/debian/pool/a.deb",
        ] {
            assert!(!is_allowed_mirror_url(url, &no_extra()), "{url}");
        }
    }

    #[test]
    fn userinfo_cannot_smuggle_a_blocked_host() {
        assert!(!is_allowed_mirror_url(
            "http://deb.debian.org@127.0.0.1/debian/pool/a.deb",
            &no_extra()
        ));
    }

    #[test]
    fn requires_repo_path_fragment() {
        assert!(!is_allowed_mirror_url(
            "http://deb.debian.org/index.html",
            &no_extra()
        ));
        assert!(!is_allowed_mirror_url(
            "http://deb.debian.org/",
            &no_extra()
        ));
    }

    #[test]
    fn requires_scheme() {
        assert!(!is_allowed_mirror_url(
            "ftp://deb.debian.org/debian/pool/a.deb",
            &no_extra()
        ));
        assert!(!is_allowed_mirror_url("", &no_extra()));
    }

    #[test]
    fn extra_hosts_extend_the_allowlist() {
        let extra = vec!["internal-apt.example.net".to_owned()];
        assert!(is_allowed_mirror_url(
            "http://internal-apt.example.net/debian/pool/a.deb",
            &extra
        ));
        // Suffix match covers subdomains.
        assert!(is_allowed_mirror_url(
            "http://eu.internal-apt.example.net/debian/pool/a.deb",
            &extra
        ));
        assert!(!is_allowed_mirror_url(
            "http://other.example.net/debian/pool/a.deb",
            &extra
        ));
    }

    #[test]
    fn loopback_mirror_opt_in_check() {
        assert!(is_loopback_mirror_url(
            "http://127.0.0.1:3142/debian/pool/a.deb"
        ));
        assert!(is_loopback_mirror_url("http://localhost/ubuntu/dists/x"));
        // Still requires a repository path.
        assert!(!is_loopback_mirror_url("http://127.0.0.1/etc/passwd"));
        // And never admits non-loopback hosts.
        assert!(!is_loopback_mirror_url(
            "http://10.0.0.1/debian/pool/a.deb"
        ));
    }

    #[test]
    fn connect_targets_are_port_restricted() {
        assert!(is_allowed_connect_target("deb.debian.org:443", &no_extra()));
        assert!(is_allowed_connect_target("deb.debian.org:80", &no_extra()));
        assert!(!is_allowed_connect_target(
            "deb.debian.org:8080",
            &no_extra()
        ));
        assert!(!is_allowed_connect_target("deb.debian.org", &no_extra()));
        assert!(!is_allowed_connect_target("127.0.0.1:80", &no_extra()));
    }

    #[test]
    fn peer_addr_filtering() {
        let blocked = [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip4/10.0.0.5/tcp/4001",
            "/ip4/192.168.0.2/tcp/4001",
            "/ip4/169.254.0.9/tcp/4001",
            "/ip4/0.0.0.0/tcp/4001",
            "/ip6/::1/tcp/4001",
            "/ip6/fd00::1/tcp/4001",
            "/ip6/fe80::1/tcp/4001",
        ];
        for raw in blocked {
            assert!(is_blocked_peer_addr(&Multiaddr::parse(raw)), "{raw}");
        }
        let allowed = [
            "/ip4/203.0.113.9/tcp/4001",
            "/ip6/2001:db8::1/tcp/4001",
            "/dns4/peer.example.org/tcp/4001",
        ];
        for raw in allowed {
            assert!(!is_blocked_peer_addr(&Multiaddr::parse(raw)), "{raw}");
        }
    }

    #[test]
    fn filter_keeps_only_dialable_addrs() {
        let addrs = vec![
            Multiaddr::parse("/ip4/127.0.0.1/tcp/4001"),
            Multiaddr::parse("/ip4/203.0.113.9/tcp/4001"),
            Multiaddr::parse("/dns4/peer.example.org/tcp/4001"),
        ];
        let kept = filter_blocked_addrs(addrs);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|a| a.ip() != Some("127.0.0.1".parse().unwrap())));
    }
}
