//! Canonical URL normalization, shared by the article processor (A) and
//! feed discovery (F). Grounded on `url_normalizer.py`.

use url::Url;

const TRACKING_PREFIXES: &[&str] = &["utm_", "mc_"];
const TRACKING_EXACT: &[&str] = &["fbclid", "gclid", "_ga", "_gid", "ref"];

/// Lowercase scheme to https, strip a leading `www.`, drop default ports,
/// lowercase host, drop fragment, drop trailing slash (except root), strip
/// tracking query parameters and any parameter with an empty value.
///
/// Idempotent: `normalize(normalize(u)) == normalize(u)` (§8 property 6).
/// On parse failure, falls back to the trimmed, lowercased original rather
/// than erroring, since A must never fail a batch over a malformed URL.
pub fn normalize(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.scheme() == "http" {
                let _ = url.set_scheme("https");
            }
            if let Some(host) = url.host_str() {
                let host = host.to_lowercase();
                let stripped = host.strip_prefix("www.").unwrap_or(&host).to_string();
                let _ = url.set_host(Some(&stripped));
            }
            if is_default_port(&url) {
                let _ = url.set_port(None);
            }
            url.set_fragment(None);

            let retained: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, v)| !v.is_empty() && !is_tracking_param(k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if retained.is_empty() {
                url.set_query(None);
            } else {
                let qs = retained
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&");
                url.set_query(Some(&qs));
            }

            let mut s = url.to_string();
            if s.ends_with('/') && url.path() != "/" {
                s.pop();
            } else if url.path() == "/" && url.query().is_none() {
                // keep root slash
            }
            s
        }
        Err(_) => raw.trim().to_lowercase(),
    }
}

fn is_default_port(url: &Url) -> bool {
    matches!(
        (url.scheme(), url.port()),
        ("https", Some(443)) | ("http", Some(80))
    )
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_lowercase();
    TRACKING_EXACT.contains(&key.as_str())
        || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_www_and_tracking_params() {
        let n = normalize("http://www.example.com/p/?utm_source=x&id=1");
        assert_eq!(n, "https://example.com/p?id=1");
    }

    #[test]
    fn is_idempotent() {
        let once = normalize("http://WWW.Example.com:80/a/b/?fbclid=1&x=");
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn keeps_root_slash() {
        assert_eq!(normalize("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn falls_back_on_parse_failure() {
        assert_eq!(normalize("  Not A URL  "), "not a url");
    }
}
