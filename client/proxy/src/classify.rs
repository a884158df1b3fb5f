//! Request classification and target URL extraction.

use http::Uri;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestClass {
    /// A `.deb` download.
    Package,
    /// A `Packages` / `Sources` index file.
    Index,
    /// A `Release` / `InRelease` file.
    Release,
    /// Anything else; passed through untouched.
    Unknown,
}

/// Classify a target URL by lowercase suffix/substring checks.
pub fn classify(url: &str) -> RequestClass {
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    if path.ends_with(".deb") {
        return RequestClass::Package;
    }
    if path.contains("/packages") || path.contains("/sources") {
        return RequestClass::Index;
    }
    if path.ends_with("/release") || path.ends_with("/inrelease") {
        return RequestClass::Release;
    }
    RequestClass::Unknown
}

/// Reconstruct the upstream target from the request URI.
///
/// APT clients reach us two ways: proxy-style with an absolute-form URI
/// (`GET http://mirror/...`), or mirror-style with the target folded
/// into the path (`GET /mirror.example.com/pool/...`, with or without an
/// explicit scheme). Bare `host/path` forms are prefixed `http://` for
/// APT-client compatibility; a path without any `/` has no target.
pub fn extract_target_url(uri: &Uri) -> Result<String, &'static str> {
    // Absolute-form: the authority rides on the URI itself.
    if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
        let path = uri.path();
        return Ok(format!("{scheme}://{authority}{path}"));
    }

    let Some(rest) = uri.path().strip_prefix('/') else {
        return Err("no target in request path");
    };
    if rest.is_empty() {
        return Err("no target in request path");
    }
    if rest.starts_with("http://") || rest.starts_with("https://") {
        return Ok(rest.to_owned());
    }
    if rest.contains('/') {
        return Ok(format!("http://{rest}"));
    }
    Err("target must contain a host and path")
}

/// Whether a proxied index body should be handed to the `Packages`
/// parser: top-level `Packages` files only, no translations, no
/// compressed variants.
pub fn should_ingest_index(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    path.ends_with("/packages") && !path.contains("/translation")
}

/// The `host/path` form used for index lookups.
pub fn lookup_path(url: &str) -> &str {
    url.trim_start_matches("http://")
        .trim_start_matches("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_the_four_classes() {
        assert_eq!(
            classify("http://m/debian/pool/main/h/hello/hello_2.10_amd64.deb"),
            RequestClass::Package
        );
        assert_eq!(
            classify("http://m/debian/dists/stable/main/binary-amd64/Packages"),
            RequestClass::Index
        );
        assert_eq!(
            classify("http://m/debian/dists/stable/main/source/Sources"),
            RequestClass::Index
        );
        assert_eq!(
            classify("http://m/debian/dists/stable/Release"),
            RequestClass::Release
        );
        assert_eq!(
            classify("http://m/debian/dists/stable/InRelease"),
            RequestClass::Release
        );
        assert_eq!(classify("http://m/debian/some/other/file"), RequestClass::Unknown);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("http://m/POOL/X.DEB"), RequestClass::Package);
        assert_eq!(classify("http://m/dists/x/InRelease"), RequestClass::Release);
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn extract_accepts_explicit_schemes() {
        assert_eq!(
            extract_target_url(&uri("/http://mirror.example.com/pool/a.deb")).unwrap(),
            "http://mirror.example.com/pool/a.deb"
        );
        assert_eq!(
            extract_target_url(&uri("/https://mirror.example.com/pool/a.deb")).unwrap(),
            "https://mirror.example.com/pool/a.deb"
        );
    }

    #[test]
    fn extract_prefixes_bare_host_paths() {
        assert_eq!(
            extract_target_url(&uri("/mirror.example.com/pool/a.deb")).unwrap(),
            "http://mirror.example.com/pool/a.deb"
        );
    }

    #[test]
    fn extract_handles_absolute_form() {
        assert_eq!(
            extract_target_url(&uri("http://mirror.example.com/pool/a.deb")).unwrap(),
            "http://mirror.example.com/pool/a.deb"
        );
    }

    #[test]
    fn extract_rejects_targets_without_a_path() {
        assert!(extract_target_url(&uri("/")).is_err());
        assert!(extract_target_url(&uri("/just-a-host")).is_err());
    }

    #[test]
    fn ingest_filter_excludes_translations_and_compressed() {
        assert!(should_ingest_index(
            "http://m/debian/dists/stable/main/binary-amd64/Packages"
        ));
        assert!(!should_ingest_index(
            "http://m/debian/dists/stable/main/i18n/Translation-en/Packages"
        ));
        assert!(!should_ingest_index(
            "http://m/debian/dists/stable/main/binary-amd64/Packages.gz"
        ));
    }

    #[test]
    fn lookup_path_strips_scheme() {
        assert_eq!(
            lookup_path("http://mirror.example.com/pool/a.deb"),
            "mirror.example.com/pool/a.deb"
        );
    }
}
