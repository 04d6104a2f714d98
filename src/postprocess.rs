//! Rewrites applied to each streamed answer fragment before display.
//!
//! Rules run in a fixed order:
//!
//! 1. escape `~` as `\~` so markdown does not render strikethrough
//! 2. prefix 4-digit extensions after a phone marker with the office code
//! 3. repair `or. kr` / `go. kr` into `or.kr` / `go.kr`
//! 4. promote a bare `www.` host, or a bare `*.go.kr` / `*.or.kr` host,
//!    to `https://`
//! 5. surround every `http(s)://` URL with whitespace
//!
//! Steps 3 and 4 must run before step 5 so that the repaired and promoted
//! URLs get spaced too. Every step is idempotent.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{PostprocessConfig, PromptConfig};

const URL_TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?'];

#[derive(Debug, Clone)]
pub struct Postprocessor {
    phone_prefix: Option<String>,
    phone: Regex,
    domain: Regex,
    www: Regex,
    host: Regex,
    url: Regex,
}

impl Postprocessor {
    pub fn new(config: &PostprocessConfig, prompt: &PromptConfig) -> Result<Self> {
        let office_code = prompt.office_code.trim();
        let phone_prefix = (config.phone_prefix && !office_code.is_empty())
            .then(|| office_code.to_string());

        Ok(Self {
            phone_prefix,
            phone: Regex::new(r"(☎|전화|내선|\b(?i:tel|ext)\.?)[ \t]*:?[ \t]*(\d{4})")
                .context("phone pattern")?,
            domain: Regex::new(r"\b(or|go)\.\s+kr").context("domain pattern")?,
            www: Regex::new(r"(^|[^/A-Za-z0-9.\-])www\.").context("www pattern")?,
            host: Regex::new(r"(^|[^/@A-Za-z0-9.\-])((?:[A-Za-z0-9\-]+\.)+(?:go|or)\.kr)")
                .context("host pattern")?,
            url: Regex::new(r"https?://[A-Za-z0-9\-._:/?#@!$&*+,;=%]+").context("url pattern")?,
        })
    }

    pub fn apply(&self, fragment: &str) -> String {
        let text = escape_tilde(fragment);
        let text = match &self.phone_prefix {
            Some(code) => self.prefix_extensions(&text, code),
            None => text,
        };
        let text = self.domain.replace_all(&text, "$1.kr");
        let text = self.www.replace_all(&text, "${1}https://www.");
        let text = self.host.replace_all(&text, "${1}https://$2");
        self.space_urls(&text)
    }

    fn prefix_extensions(&self, text: &str, code: &str) -> String {
        let mut out = String::with_capacity(text.len() + 16);
        let mut last = 0;
        for caps in self.phone.captures_iter(text) {
            let Some(digits) = caps.get(2) else { continue };
            // Part of a longer number such as 2000-1234 or 20001.
            let next = text[digits.end()..].chars().next();
            if matches!(next, Some(c) if c.is_ascii_digit() || c == '-') {
                continue;
            }
            out.push_str(&text[last..digits.start()]);
            out.push_str(code);
            out.push('-');
            out.push_str(digits.as_str());
            last = digits.end();
        }
        out.push_str(&text[last..]);
        out
    }

    fn space_urls(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 8);
        let mut last = 0;
        for m in self.url.find_iter(text) {
            let url = m.as_str().trim_end_matches(URL_TRAILING_PUNCT);
            let end = m.start() + url.len();

            out.push_str(&text[last..m.start()]);
            if !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push_str(url);
            if !text[end..].starts_with(char::is_whitespace) {
                out.push(' ');
            }
            last = end;
        }
        out.push_str(&text[last..]);
        out
    }
}

fn escape_tilde(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev = None;
    for c in text.chars() {
        if c == '~' && prev != Some('\\') {
            out.push('\\');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp() -> Postprocessor {
        Postprocessor::new(&PostprocessConfig::default(), &PromptConfig::default()).unwrap()
    }

    #[test]
    fn extension_gets_office_code() {
        assert_eq!(pp().apply("내선 2000"), "내선 053-667-2000");
        assert_eq!(pp().apply("문의: ☎2000번"), "문의: ☎053-667-2000번");
        assert_eq!(pp().apply("전화: 2001)"), "전화: 053-667-2001)");
        assert_eq!(pp().apply("Tel. 2002"), "Tel. 053-667-2002");
    }

    #[test]
    fn full_numbers_are_left_alone() {
        let pp = pp();
        assert_eq!(pp.apply("전화 053-667-2000"), "전화 053-667-2000");
        assert_eq!(pp.apply("내선 2000-1234"), "내선 2000-1234");
        assert_eq!(pp.apply("내선 20001"), "내선 20001");
        assert_eq!(pp.apply("hotel 2000"), "hotel 2000");
        assert_eq!(pp.apply("2020년 기준"), "2020년 기준");
    }

    #[test]
    fn prefix_is_idempotent() {
        let pp = pp();
        let once = pp.apply("내선 2000");
        assert_eq!(pp.apply(&once), once);
    }

    #[test]
    fn phone_prefix_can_be_disabled() {
        let config = PostprocessConfig {
            phone_prefix: false,
        };
        let pp = Postprocessor::new(&config, &PromptConfig::default()).unwrap();
        assert_eq!(pp.apply("내선 2000"), "내선 2000");
    }

    #[test]
    fn tilde_is_escaped_once() {
        let pp = pp();
        assert_eq!(pp.apply("9시~18시"), "9시\\~18시");
        assert_eq!(pp.apply("9시\\~18시"), "9시\\~18시");
    }

    #[test]
    fn spaced_url_is_unchanged() {
        let input = " https://example.go.kr ";
        assert_eq!(pp().apply(input), input);
    }

    #[test]
    fn broken_domain_is_repaired_and_spaced() {
        assert_eq!(
            pp().apply("주소는https://example.go. kr입니다"),
            "주소는 https://example.go.kr 입니다"
        );
    }

    #[test]
    fn broken_bare_domain_becomes_a_link() {
        let pp = pp();
        assert_eq!(pp.apply("example.go. kr"), " https://example.go.kr ");
        assert_eq!(
            pp.apply("주소는 example.go. kr 입니다"),
            "주소는 https://example.go.kr 입니다"
        );
        assert_eq!(pp.apply("welfare.dalseo.or.kr/main"), " https://welfare.dalseo.or.kr/main ");
    }

    #[test]
    fn promoted_hosts_are_stable() {
        let pp = pp();
        let once = pp.apply("주소: www.example.go.kr, 메일 help@example.go.kr");
        assert_eq!(once, "주소: https://www.example.go.kr , 메일 help@example.go.kr");
        assert_eq!(pp.apply(&once), once);
    }

    #[test]
    fn bare_www_is_promoted() {
        assert_eq!(
            pp().apply("홈페이지(www.example.kr)"),
            "홈페이지( https://www.example.kr )"
        );
        assert_eq!(pp().apply("www.example.kr"), " https://www.example.kr ");
    }

    #[test]
    fn www_inside_url_is_not_promoted_twice() {
        let pp = pp();
        let out = pp.apply("https://www.example.kr");
        assert_eq!(out, " https://www.example.kr ");
        assert_eq!(pp.apply(&out), out);
    }

    #[test]
    fn trailing_punctuation_stays_outside_the_url() {
        assert_eq!(
            pp().apply("see https://example.or.kr."),
            "see https://example.or.kr ."
        );
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(pp().apply("안녕하세요"), "안녕하세요");
        assert_eq!(pp().apply(""), "");
    }
}
