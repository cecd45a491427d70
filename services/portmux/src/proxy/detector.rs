//! Protocol detection from the leading bytes of a connection.
//!
//! The detector reads from the client into a caller-owned buffer, bounded by
//! a byte budget and a deadline, and tests registered signature matchers
//! against everything read so far. Nothing is consumed: the caller replays
//! the buffer to the chosen backend before piping.
//!
//! Matchers are consulted in registration order and the first one that has
//! not rejected the bytes decides. A matcher that needs more bytes holds the
//! decision until the budget, the deadline, or client EOF forces a final pass.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::ConfigError;

/// Default timeout for protocol detection.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default maximum bytes buffered while detecting.
pub const DEFAULT_MAX_DETECT_BYTES: usize = 8192;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"TRACE ",
    b"CONNECT ",
    b"PATCH ",
];

const MQTT_PROTOCOL_NAMES: [&[u8]; 2] = [b"\x00\x04MQTT", b"\x00\x06MQIsdp"];

/// Verdict of a single rule against the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    NoMatch,
    /// Undecided until more bytes arrive.
    NeedMore,
}

/// A byte-level signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRule {
    /// Fixed magic-byte prefix.
    Prefix(Vec<u8>),
    /// Case-insensitive ASCII token anywhere in the buffered bytes.
    Token(String),
    /// HTTP/1.x request line.
    Http,
    /// HTTP upgrade request to WebSocket.
    WebSocket,
    /// TLS handshake record (passthrough only).
    Tls,
    /// MQTT CONNECT packet.
    Mqtt,
}

impl SignatureRule {
    /// Built-in rule for a well-known protocol name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(SignatureRule::Http),
            "websocket" => Some(SignatureRule::WebSocket),
            "tls" => Some(SignatureRule::Tls),
            "mqtt" => Some(SignatureRule::Mqtt),
            _ => None,
        }
    }

    /// Evaluate the rule against the bytes buffered so far.
    pub fn evaluate(&self, data: &[u8]) -> MatchOutcome {
        match self {
            SignatureRule::Prefix(magic) => prefix_outcome(data, magic, false),
            SignatureRule::Token(token) => {
                if contains_ignore_case(data, token.as_bytes()) {
                    MatchOutcome::Match
                } else {
                    MatchOutcome::NeedMore
                }
            }
            SignatureRule::Http => any_prefix_outcome(data, &HTTP_METHODS, true),
            SignatureRule::WebSocket => evaluate_websocket(data),
            SignatureRule::Tls => evaluate_tls(data),
            SignatureRule::Mqtt => evaluate_mqtt(data),
        }
    }
}

/// Pairs a protocol identifier with a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatcher {
    protocol: String,
    rule: SignatureRule,
}

impl SignatureMatcher {
    /// Create a new matcher.
    pub fn new(protocol: impl Into<String>, rule: SignatureRule) -> Result<Self, ConfigError> {
        let protocol: String = protocol.into();
        let protocol = protocol.trim().to_string();

        let invalid = |detail: &str| ConfigError::InvalidDetector {
            protocol: protocol.clone(),
            detail: detail.to_string(),
        };

        if protocol.is_empty() {
            return Err(invalid("protocol identifier must not be empty"));
        }
        match &rule {
            SignatureRule::Prefix(magic) if magic.is_empty() => {
                return Err(invalid("prefix must not be empty"));
            }
            SignatureRule::Token(token) if token.is_empty() => {
                return Err(invalid("token must not be empty"));
            }
            SignatureRule::Token(token) if !token.is_ascii() => {
                return Err(invalid("token must be ASCII"));
            }
            _ => {}
        }

        Ok(Self { protocol, rule })
    }

    /// Matcher for a built-in protocol, named after it.
    pub fn builtin(name: &str) -> Option<Self> {
        SignatureRule::builtin(name).map(|rule| Self {
            protocol: name.trim().to_ascii_lowercase(),
            rule,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn rule(&self) -> &SignatureRule {
        &self.rule
    }
}

/// Result of protocol detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A matcher claimed the connection.
    Matched(String),
    /// Every matcher rejected the bytes, the budget filled, or the client
    /// stopped sending.
    Unknown,
    /// The deadline passed with no match.
    TimedOut,
    /// Reading from the client failed. No classification is attempted on
    /// the bytes read so far.
    Aborted,
}

/// Configuration for protocol detection.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Maximum time to wait for a decision.
    pub timeout: Duration,
    /// Maximum bytes to buffer.
    pub max_bytes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DETECT_TIMEOUT,
            max_bytes: DEFAULT_MAX_DETECT_BYTES,
        }
    }
}

/// Outcome of one ordered pass over the matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    Matched(&'a str),
    Unknown,
    Pending,
}

/// Ordered set of signature matchers plus detection bounds.
#[derive(Debug, Clone, Default)]
pub struct ProtocolDetector {
    matchers: Vec<SignatureMatcher>,
    config: DetectorConfig,
    fallback: Option<String>,
}

impl ProtocolDetector {
    /// Create a detector with no matchers.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            matchers: Vec::new(),
            config,
            fallback: None,
        }
    }

    /// Register a matcher after all existing ones.
    pub fn register(&mut self, matcher: SignatureMatcher) {
        debug!(protocol = %matcher.protocol, rule = ?matcher.rule, "Signature registered");
        self.matchers.push(matcher);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_matcher(mut self, matcher: SignatureMatcher) -> Self {
        self.register(matcher);
        self
    }

    /// Protocol to route connections to when no signature matched.
    ///
    /// Applies to `Unknown` only; a timed-out detection still closes.
    pub fn with_fallback(mut self, protocol: impl Into<String>) -> Self {
        self.fallback = Some(protocol.into());
        self
    }

    pub fn fallback_protocol(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn matchers(&self) -> &[SignatureMatcher] {
        &self.matchers
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run one ordered pass over the matchers.
    ///
    /// With `exhausted` set, undecided matchers count as rejections.
    pub fn classify(&self, data: &[u8], exhausted: bool) -> Classification<'_> {
        for matcher in &self.matchers {
            match matcher.rule.evaluate(data) {
                MatchOutcome::Match => return Classification::Matched(&matcher.protocol),
                MatchOutcome::NoMatch => continue,
                MatchOutcome::NeedMore if exhausted => continue,
                MatchOutcome::NeedMore => return Classification::Pending,
            }
        }
        Classification::Unknown
    }

    /// Detect the protocol of `stream`, reading into `buffer`.
    ///
    /// The buffer is cleared first. On return it holds every byte read, in
    /// order, whatever the result. The caller must forward these bytes to
    /// the backend.
    pub async fn detect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> Detection {
        buffer.clear();
        let deadline = Instant::now() + self.config.timeout;
        let max_bytes = self.config.max_bytes.max(1);

        loop {
            match self.classify(buffer, false) {
                Classification::Matched(protocol) => {
                    return Detection::Matched(protocol.to_string())
                }
                Classification::Unknown => return Detection::Unknown,
                Classification::Pending => {}
            }

            if buffer.len() >= max_bytes {
                debug!(bytes = buffer.len(), "Detection byte budget exhausted");
                return self.final_pass(buffer);
            }

            let start = buffer.len();
            buffer.resize(max_bytes, 0);
            let read_result = timeout_at(deadline, stream.read(&mut buffer[start..])).await;

            match read_result {
                Ok(Ok(0)) => {
                    buffer.truncate(start);
                    debug!(bytes = start, "Client closed during detection");
                    return self.final_pass(buffer);
                }
                Ok(Ok(n)) => {
                    buffer.truncate(start + n);
                    trace!(read = n, total = buffer.len(), "Detection read");
                }
                Ok(Err(e)) => {
                    buffer.truncate(start);
                    debug!(error = %e, bytes = start, "Read error during detection");
                    return Detection::Aborted;
                }
                Err(_) => {
                    buffer.truncate(start);
                    debug!(bytes = start, "Detection timeout");
                    return match self.classify(buffer, true) {
                        Classification::Matched(protocol) => {
                            Detection::Matched(protocol.to_string())
                        }
                        _ => Detection::TimedOut,
                    };
                }
            }
        }
    }

    fn final_pass(&self, buffer: &[u8]) -> Detection {
        match self.classify(buffer, true) {
            Classification::Matched(protocol) => Detection::Matched(protocol.to_string()),
            _ => Detection::Unknown,
        }
    }
}

fn prefix_outcome(data: &[u8], pattern: &[u8], ignore_case: bool) -> MatchOutcome {
    let eq = |a: &[u8], b: &[u8]| {
        if ignore_case {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    };

    if data.len() >= pattern.len() {
        if eq(&data[..pattern.len()], pattern) {
            MatchOutcome::Match
        } else {
            MatchOutcome::NoMatch
        }
    } else if eq(data, &pattern[..data.len()]) {
        MatchOutcome::NeedMore
    } else {
        MatchOutcome::NoMatch
    }
}

fn any_prefix_outcome(data: &[u8], patterns: &[&[u8]], ignore_case: bool) -> MatchOutcome {
    let mut outcome = MatchOutcome::NoMatch;
    for pattern in patterns {
        match prefix_outcome(data, pattern, ignore_case) {
            MatchOutcome::Match => return MatchOutcome::Match,
            MatchOutcome::NeedMore => outcome = MatchOutcome::NeedMore,
            MatchOutcome::NoMatch => {}
        }
    }
    outcome
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `GET` request whose header block carries the upgrade handshake.
fn evaluate_websocket(data: &[u8]) -> MatchOutcome {
    match prefix_outcome(data, b"GET ", true) {
        MatchOutcome::Match => {}
        other => return other,
    }

    let Some(end) = find(data, b"\r\n\r\n") else {
        return MatchOutcome::NeedMore;
    };

    let headers = &data[..end];
    let is_upgrade = [&b"upgrade"[..], b"websocket", b"sec-websocket-key"]
        .iter()
        .all(|token| contains_ignore_case(headers, token));

    if is_upgrade {
        MatchOutcome::Match
    } else {
        MatchOutcome::NoMatch
    }
}

/// TLS record header: handshake type, major version 3, minor 0 through 4.
fn evaluate_tls(data: &[u8]) -> MatchOutcome {
    if data.is_empty() {
        return MatchOutcome::NeedMore;
    }
    if data[0] != 0x16 {
        return MatchOutcome::NoMatch;
    }
    if data.len() < 2 {
        return MatchOutcome::NeedMore;
    }
    if data[1] != 0x03 {
        return MatchOutcome::NoMatch;
    }
    if data.len() < 3 {
        return MatchOutcome::NeedMore;
    }
    if data[2] <= 0x04 {
        MatchOutcome::Match
    } else {
        MatchOutcome::NoMatch
    }
}

/// MQTT fixed header (CONNECT, remaining length) followed by the protocol
/// name of 3.1 or 3.1.1/5.
fn evaluate_mqtt(data: &[u8]) -> MatchOutcome {
    if data.is_empty() {
        return MatchOutcome::NeedMore;
    }
    if data[0] != 0x10 {
        return MatchOutcome::NoMatch;
    }

    // Remaining length is a varint of at most four bytes.
    let mut pos = 1;
    loop {
        if pos >= data.len() {
            return MatchOutcome::NeedMore;
        }
        let byte = data[pos];
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
        if pos > 4 {
            return MatchOutcome::NoMatch;
        }
    }

    any_prefix_outcome(&data[pos..], &MQTT_PROTOCOL_NAMES, false)
}
