//! Byte-pattern matching over a connection's leading bytes.
//!
//! # Responsibilities
//! - Recognize the HTTP/2 client preface
//! - Recognize gRPC by the `content-type` of the first HTTP/2 header block
//! - Recognize a well-formed HTTP/1.x request line
//! - Combine rules in declaration order into a classification
//!
//! # Design Decisions
//! - Matchers are pure functions of the buffered prefix
//! - Three-valued results: a matcher may ask for more bytes
//! - An undecided earlier rule blocks later rules (first declared wins)
//! - No regex: each matcher is a single forward scan

use std::fmt;
use std::sync::Arc;

use crate::mux::hpack;
use crate::mux::Protocol;

/// HTTP/2 client connection preface (RFC 9113 §3.4).
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// gRPC content types recognized by the default header-field rule.
pub const GRPC_CONTENT_TYPES: [&str; 2] = ["application/grpc", "application/grpc+proto"];

/// Longest HTTP method token accepted by [`Http1Matcher`].
const MAX_METHOD_LEN: usize = 32;

/// Outcome of one matcher over the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The prefix satisfies the predicate.
    Match,
    /// The prefix can never satisfy the predicate.
    NoMatch,
    /// More bytes are needed to decide.
    Incomplete,
}

/// Trait for predicates over a connection's leading bytes.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Evaluate the predicate against the buffered prefix.
    fn check(&self, prefix: &[u8]) -> MatchResult;
}

/// Matches a fixed byte prefix.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefix: Vec<u8>,
}

impl PrefixMatcher {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Matches connections opening with the HTTP/2 client preface.
    pub fn http2_preface() -> Self {
        Self::new(HTTP2_PREFACE)
    }
}

impl Matcher for PrefixMatcher {
    fn check(&self, prefix: &[u8]) -> MatchResult {
        let n = prefix.len().min(self.prefix.len());
        if prefix[..n] != self.prefix[..n] {
            MatchResult::NoMatch
        } else if n < self.prefix.len() {
            MatchResult::Incomplete
        } else {
            MatchResult::Match
        }
    }
}

/// Matches everything. Useful as a trailing catch-all rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMatcher;

impl Matcher for AnyMatcher {
    fn check(&self, _prefix: &[u8]) -> MatchResult {
        MatchResult::Match
    }
}

/// Matches an HTTP/1.x request line: `method SP target SP HTTP/1.x CRLF`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1Matcher;

impl Matcher for Http1Matcher {
    fn check(&self, prefix: &[u8]) -> MatchResult {
        let line_end = prefix.iter().position(|&b| b == b'\n');
        let line = match line_end {
            Some(end) => &prefix[..end],
            None => prefix,
        };

        // Method token.
        let method_len = line.iter().take_while(|&&b| is_tchar(b)).count();
        if method_len > MAX_METHOD_LEN {
            return MatchResult::NoMatch;
        }
        if method_len == line.len() {
            return if line_end.is_some() {
                MatchResult::NoMatch
            } else {
                MatchResult::Incomplete
            };
        }
        if method_len == 0 || line[method_len] != b' ' {
            return MatchResult::NoMatch;
        }

        // Request target: visible ASCII up to the next space.
        let rest = &line[method_len + 1..];
        let target_len = rest.iter().take_while(|&&b| b.is_ascii_graphic()).count();
        if target_len == rest.len() {
            return if line_end.is_some() {
                MatchResult::NoMatch
            } else {
                MatchResult::Incomplete
            };
        }
        if target_len == 0 || rest[target_len] != b' ' {
            return MatchResult::NoMatch;
        }

        // Version: HTTP/1.<digit>, optionally followed by CR.
        let version = &rest[target_len + 1..];
        let expected = b"HTTP/1.";
        let n = version.len().min(expected.len());
        if version[..n] != expected[..n] {
            return MatchResult::NoMatch;
        }
        let tail = version.get(expected.len()..).unwrap_or_default();
        let tail_ok = match tail {
            [] => true,
            [d] => d.is_ascii_digit(),
            [d, b'\r'] => d.is_ascii_digit(),
            _ => false,
        };
        if !tail_ok {
            return MatchResult::NoMatch;
        }

        let complete = matches!(tail, [_] | [_, b'\r']);
        if line_end.is_some() && complete {
            MatchResult::Match
        } else if line_end.is_some() {
            MatchResult::NoMatch
        } else {
            MatchResult::Incomplete
        }
    }
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Matches an HTTP/2 connection whose first header block carries a header
/// field with one of the given values.
#[derive(Debug, Clone)]
pub struct Http2HeaderMatcher {
    name: Vec<u8>,
    values: Vec<Vec<u8>>,
}

impl Http2HeaderMatcher {
    /// Create a matcher for `name` (case-insensitive) equal to any of `values`.
    pub fn new<I, V>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        Self {
            name: name.to_ascii_lowercase().into_bytes(),
            values: values
                .into_iter()
                .map(|v| v.as_ref().as_bytes().to_vec())
                .collect(),
        }
    }

    /// Matches gRPC requests by `content-type`.
    pub fn grpc() -> Self {
        Self::new("content-type", GRPC_CONTENT_TYPES)
    }
}

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

impl Matcher for Http2HeaderMatcher {
    fn check(&self, prefix: &[u8]) -> MatchResult {
        match PrefixMatcher::http2_preface().check(prefix) {
            MatchResult::Match => {}
            other => return other,
        }

        let mut pos = HTTP2_PREFACE.len();
        let mut block: Option<Vec<u8>> = None;

        loop {
            let Some(header) = prefix.get(pos..pos + FRAME_HEADER_LEN) else {
                return MatchResult::Incomplete;
            };
            let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
            let kind = header[3];
            let flags = header[4];
            let start = pos + FRAME_HEADER_LEN;
            let Some(payload) = prefix.get(start..start + len) else {
                return MatchResult::Incomplete;
            };
            pos = start + len;

            let fragment = match (kind, block.is_some()) {
                (FRAME_HEADERS, false) => match header_fragment(payload, flags) {
                    Some(fragment) => fragment,
                    None => return MatchResult::NoMatch,
                },
                (FRAME_CONTINUATION, true) => payload,
                // A header block must not be interleaved with other frames.
                (_, true) => return MatchResult::NoMatch,
                (FRAME_CONTINUATION, false) => return MatchResult::NoMatch,
                _ => continue,
            };

            let buf = block.get_or_insert_with(Vec::new);
            buf.extend_from_slice(fragment);
            if flags & FLAG_END_HEADERS == 0 {
                continue;
            }

            let fields = match hpack::Decoder::default().decode(buf) {
                Ok(fields) => fields,
                Err(_) => return MatchResult::NoMatch,
            };
            let found = fields.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case(&self.name) && self.values.iter().any(|v| v == value)
            });
            return if found {
                MatchResult::Match
            } else {
                MatchResult::NoMatch
            };
        }
    }
}

/// Strip padding and priority fields from a HEADERS payload.
fn header_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut end = payload.len();
    if flags & FLAG_PADDED != 0 {
        let pad = *payload.first()? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    if start > end {
        return None;
    }
    Some(&payload[start..end])
}

/// A matcher paired with the protocol it selects.
#[derive(Debug, Clone)]
pub struct MatchRule {
    matcher: Arc<dyn Matcher>,
    protocol: Protocol,
}

impl MatchRule {
    pub fn new(matcher: impl Matcher + 'static, protocol: Protocol) -> Self {
        Self {
            matcher: Arc::new(matcher),
            protocol,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn check(&self, prefix: &[u8]) -> MatchResult {
        self.matcher.check(prefix)
    }
}

/// Result of running a [`RuleSet`] over a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched(Protocol),
    Unmatched,
    /// An earlier rule needs more bytes before any decision is possible.
    Undecided,
}

/// Ordered list of rules. The first rule to match wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<MatchRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `[HTTP/2 preface → rpc, HTTP/1 request line → http]`.
    pub fn preface_default() -> Self {
        Self::new()
            .rule(PrefixMatcher::http2_preface(), Protocol::Rpc)
            .rule(Http1Matcher, Protocol::Http)
    }

    /// `[HTTP/2 + gRPC content-type → rpc, HTTP/1 request line → http]`.
    pub fn content_type_default<I, V>(content_types: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        Self::new()
            .rule(Http2HeaderMatcher::new("content-type", content_types), Protocol::Rpc)
            .rule(Http1Matcher, Protocol::Http)
    }

    /// Append a rule.
    pub fn rule(mut self, matcher: impl Matcher + 'static, protocol: Protocol) -> Self {
        self.rules.push(MatchRule::new(matcher, protocol));
        self
    }

    /// Drop every rule whose protocol is not in `enabled`.
    pub fn retain_protocols(&mut self, enabled: &[Protocol]) {
        self.rules.retain(|r| enabled.contains(&r.protocol));
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify `prefix`. When `exhausted` is set no more bytes will arrive,
    /// so an incomplete rule counts as a miss.
    pub fn classify(&self, prefix: &[u8], exhausted: bool) -> Classification {
        for rule in &self.rules {
            match rule.check(prefix) {
                MatchResult::Match => return Classification::Matched(rule.protocol),
                MatchResult::NoMatch => continue,
                MatchResult::Incomplete if exhausted => continue,
                MatchResult::Incomplete => return Classification::Undecided,
            }
        }
        Classification::Unmatched
    }
}
