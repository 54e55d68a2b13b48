//! HTML sanitizer (N). Grounded on `html_cleaner.py`: a fixed tag/attribute
//! allowlist, trusted-iframe-only embeds, `<pre>` preserved verbatim, and a
//! handful of regex passes `ammonia` doesn't do for us (style/href scheme
//! stripping, inline-tag spacing).

use ammonia::Builder;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

const TRUSTED_IFRAME_DOMAINS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "youtu.be",
    "vimeo.com",
    "player.vimeo.com",
    "open.spotify.com",
    "embed.music.apple.com",
    "soundcloud.com",
    "w.soundcloud.com",
];

const ALLOWED_TAGS: &[&str] = &[
    "a", "abbr", "address", "article", "aside", "audio", "b", "blockquote", "br", "cite", "code",
    "dd", "details", "div", "dl", "dt", "em", "figcaption", "figure", "footer", "h1", "h2", "h3",
    "h4", "h5", "h6", "header", "hr", "i", "iframe", "img", "li", "main", "mark", "nav", "ol", "p",
    "pre", "q", "s", "section", "small", "source", "span", "strong", "sub", "summary", "sup",
    "svg", "table", "tbody", "td", "th", "thead", "time", "track", "tr", "u", "ul", "video",
];

static PRE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<pre\b[^>]*>.*?</pre>").unwrap());
static DANGEROUS_STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript|expression|behavior|@import").unwrap());
static DANGEROUS_SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^\s*(javascript|data|vbscript):"#).unwrap());
static INLINE_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(a|strong|b|em|i|u|s|sub|sup|code|mark|cite|q|abbr|time|small)>").unwrap()
});
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

fn builder() -> Builder<'static> {
    let mut b = Builder::default();
    b.tags(ALLOWED_TAGS.iter().copied().collect::<HashSet<_>>());
    b.add_generic_attributes(["class", "title"]);
    b.link_rel(Some("noopener noreferrer"));
    b.add_tag_attributes("a", ["href", "title"]);
    b.add_tag_attributes("img", ["src", "alt", "title", "width", "height", "loading"]);
    b.add_tag_attributes(
        "video",
        ["src", "poster", "width", "height", "controls", "autoplay", "loop", "muted"],
    );
    b.add_tag_attributes("audio", ["src", "controls", "autoplay", "loop", "muted"]);
    b.add_tag_attributes("source", ["src", "type", "media"]);
    b.add_tag_attributes("track", ["src", "kind", "srclang", "label", "default"]);
    b.add_tag_attributes("svg", ["width", "height", "viewBox", "xmlns"]);
    b.add_tag_attributes(
        "iframe",
        [
            "src",
            "width",
            "height",
            "allowfullscreen",
            "allow",
            "frameborder",
            "scrolling",
            "referrerpolicy",
            "loading",
        ],
    );
    b.add_tag_attributes("blockquote", ["cite"]);
    b.add_tag_attributes("code", ["class"]);
    b.add_tag_attributes("pre", ["class"]);
    b.add_tag_attributes("td", ["colspan", "rowspan"]);
    b.add_tag_attributes("th", ["colspan", "rowspan", "scope"]);
    b.add_tag_attributes("time", ["datetime"]);
    b.add_tag_attributes("figure", ["class"]);
    b.add_tag_attributes("figcaption", ["class"]);
    b.url_schemes(["http", "https", "mailto"].iter().copied().collect());
    // script/style/noscript/object/embed/form/input/button are excluded by
    // not appearing in `ALLOWED_TAGS`; ammonia strips their content too,
    // which is fine since we never rely on it for user-visible text.
    b
}

fn is_trusted_iframe_src(src: &str) -> bool {
    url::Url::parse(src)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .map(|host| {
            TRUSTED_IFRAME_DOMAINS
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        })
        .unwrap_or(false)
}

/// Sanitize raw HTML, returning (safe_html, plain_text). Sanitizing the
/// output of sanitization is a no-op (§8 property 7 / round-trip law).
pub fn sanitize(input: &str) -> (String, String) {
    let mut pre_blocks = Vec::new();
    let extracted = PRE_BLOCK_RE.replace_all(input, |caps: &regex::Captures| {
        let idx = pre_blocks.len();
        pre_blocks.push(caps[0].to_string());
        format!("\u{0}PRE_BLOCK_{idx}\u{0}")
    });

    let cleaned = builder().clean(&extracted).to_string();

    // ammonia already strips untrusted iframes by src scheme in some cases,
    // but trust-domain filtering is ours: decompose any iframe whose src
    // isn't on the trusted list.
    let cleaned = strip_untrusted_iframes(&cleaned);
    let cleaned = strip_dangerous_attrs(&cleaned);

    let spaced = INLINE_TAG_RE.replace_all(&cleaned, "$0 ");
    let normalized = WHITESPACE_RE.replace_all(&spaced, " ").trim().to_string();

    let mut restored = normalized;
    for (idx, block) in pre_blocks.iter().enumerate() {
        restored = restored.replace(&format!("\u{0}PRE_BLOCK_{idx}\u{0}"), block);
    }

    let plain_text = plain_text_projection(&restored);
    (restored, plain_text)
}

fn strip_untrusted_iframes(html: &str) -> String {
    static IFRAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?is)<iframe\b[^>]*\bsrc="([^"]*)"[^>]*>.*?</iframe>"#).unwrap());
    IFRAME_RE
        .replace_all(html, |caps: &regex::Captures| {
            if is_trusted_iframe_src(&caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .to_string()
}

fn strip_dangerous_attrs(html: &str) -> String {
    static STYLE_ATTR_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?is)style="([^"]*)""#).unwrap());
    static HREF_SRC_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?is)(href|src)="([^"]*)""#).unwrap());

    let html = STYLE_ATTR_RE.replace_all(html, |caps: &regex::Captures| {
        if DANGEROUS_STYLE_RE.is_match(&caps[1]) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    HREF_SRC_RE
        .replace_all(&html, |caps: &regex::Captures| {
            if DANGEROUS_SCHEME_RE.is_match(&caps[2]) {
                format!(r#"{}="""#, &caps[1])
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

fn plain_text_projection(html: &str) -> String {
    static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
    let text = TAG_RE.replace_all(html, " ");
    WHITESPACE_RE
        .replace_all(text.trim(), " ")
        .replace('\n', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_tags() {
        let (safe, _) = sanitize("<p>hi</p><script>alert(1)</script>");
        assert!(!safe.contains("script"));
        assert!(safe.contains("hi"));
    }

    #[test]
    fn preserves_pre_block_whitespace() {
        let input = "<pre>  line1\n    line2</pre>";
        let (safe, _) = sanitize(input);
        assert!(safe.contains("  line1\n    line2"));
    }

    #[test]
    fn drops_untrusted_iframe() {
        let (safe, _) = sanitize(r#"<iframe src="https://evil.example/x"></iframe>"#);
        assert!(!safe.contains("iframe"));
    }

    #[test]
    fn keeps_trusted_iframe() {
        let (safe, _) =
            sanitize(r#"<iframe src="https://www.youtube.com/embed/abc"></iframe>"#);
        assert!(safe.contains("iframe"));
    }

    #[test]
    fn strips_javascript_href() {
        let (safe, _) = sanitize(r#"<a href="javascript:alert(1)">x</a>"#);
        assert!(!safe.contains("javascript:"));
    }

    #[test]
    fn is_idempotent() {
        let (once, _) = sanitize("<p>Hello <b>world</b></p><script>bad()</script>");
        let (twice, _) = sanitize(&once);
        assert_eq!(once, twice);
    }
}
