#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! Implements the Terminal Negotiation Filter (C1, `spec.md` §4.1): a
//! streaming parser over the upstream byte protocol that recognizes the
//! `IAC`-escaped framing of a line-mode terminal protocol, answers exactly
//! one subnegotiation (`NEW_ENVIRON`, injecting the real client IP address),
//! and forwards everything else untouched.
//!
//! # Design
//!
//! [`TerminalFilter`] is a small state machine holding a scratch buffer of
//! not-yet-classifiable bytes (a partial `IAC` sequence, or an unterminated
//! subnegotiation) and a `negotiated` flag. [`TerminalFilter::process`] is
//! called once per chunk read from the upstream socket and returns a
//! [`FilterOutcome`] splitting the chunk into bytes to write back upstream
//! (negotiation replies) and bytes to forward to the client (or buffer).
//!
//! # Invariants
//!
//! - Non-`IAC` bytes are always forwarded verbatim (P5 in `spec.md` §8).
//! - The scratch buffer holds at most one in-flight subnegotiation plus a
//!   single trailing partial `IAC` sequence; there is deliberately no size
//!   cap beyond that, since an unterminated subnegotiation is a non-fatal
//!   condition the upstream alone can resolve (§4.1 "Failure").
//! - [`build_is_reply`] and the parser in [`parse_send_payload`] agree on
//!   the escape rule, so building then parsing a reply round-trips (P6).

use tracing::trace;

/// Telnet-style framing constants (`spec.md` §4.1).
const IAC: u8 = 0xFF;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// The only option this filter answers.
const NEW_ENVIRON: u8 = 39;

/// `NEW_ENVIRON` sub-option constants.
const IS: u8 = 0;
const SEND: u8 = 1;
const INFO: u8 = 2;
const VAR: u8 = 0;
const VALUE: u8 = 1;
const ESC: u8 = 2;
const USERVAR: u8 = 3;

const IPADDRESS: &[u8] = b"IPADDRESS";

/// Result of processing one chunk of upstream bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Bytes to write back to the upstream socket (negotiation replies).
    pub to_upstream: Vec<u8>,
    /// Bytes to forward to the attached client, or buffer if absent.
    pub to_client: Vec<u8>,
}

impl FilterOutcome {
    fn is_empty(&self) -> bool {
        self.to_upstream.is_empty() && self.to_client.is_empty()
    }
}

/// Per-session instance of the Terminal Negotiation Filter.
///
/// Owns the reassembly scratch buffer and the "negotiated" flag from the
/// `Session` data model (`spec.md` §3).
#[derive(Debug, Default)]
pub struct TerminalFilter {
    pending: Vec<u8>,
    negotiated: bool,
}

impl TerminalFilter {
    /// Creates a fresh filter for a new session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `NEW_ENVIRON` negotiation (`IAC DO NEW_ENVIRON`) has already
    /// been answered on this session.
    #[must_use]
    pub fn negotiated(&self) -> bool {
        self.negotiated
    }

    /// Processes one chunk of bytes read from the upstream socket.
    ///
    /// `client_ip` is the session's current client IP in dotted/colon ASCII
    /// form, used to answer any `SEND` request discovered in this chunk.
    pub fn process(&mut self, chunk: &[u8], client_ip: &str) -> FilterOutcome {
        self.pending.extend_from_slice(chunk);
        let mut outcome = FilterOutcome::default();
        let mut i = 0;

        loop {
            let buf = &self.pending[i..];
            if buf.is_empty() {
                break;
            }
            if buf[0] != IAC {
                let run = buf.iter().position(|&b| b == IAC).unwrap_or(buf.len());
                outcome.to_client.extend_from_slice(&buf[..run]);
                i += run;
                continue;
            }

            // buf[0] == IAC
            if buf.len() < 2 {
                break; // partial trailing IAC; wait for more data
            }
            match buf[1] {
                IAC => {
                    outcome.to_client.push(IAC);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    if buf.len() < 3 {
                        break; // partial negotiation; wait for more data
                    }
                    let (cmd, option) = (buf[1], buf[2]);
                    if cmd == DO && option == NEW_ENVIRON {
                        outcome.to_upstream.extend_from_slice(&[IAC, WILL, NEW_ENVIRON]);
                        self.negotiated = true;
                        trace!("filter: answered IAC DO NEW_ENVIRON with IAC WILL NEW_ENVIRON");
                    } else {
                        outcome.to_client.extend_from_slice(&buf[..3]);
                    }
                    i += 3;
                }
                SB => {
                    if buf.len() < 3 {
                        break; // not even the option byte yet
                    }
                    match find_subneg_terminator(&buf[2..]) {
                        Some(term_offset) => {
                            let option = buf[2];
                            let total_len = 2 + term_offset + 2; // IAC SB .. IAC SE
                            if option == NEW_ENVIRON {
                                let raw_payload = &buf[3..2 + term_offset];
                                let payload = unescape_iac_doubling(raw_payload);
                                if let Some(reply) = handle_new_environ(&payload, client_ip) {
                                    outcome.to_upstream.extend_from_slice(&reply);
                                }
                            } else {
                                outcome.to_client.extend_from_slice(&buf[..total_len]);
                            }
                            i += total_len;
                        }
                        None => break, // unterminated subnegotiation; keep buffering
                    }
                }
                other => {
                    outcome.to_client.extend_from_slice(&[IAC, other]);
                    i += 2;
                }
            }
        }

        self.pending.drain(..i);
        outcome
    }

    /// Builds the unsolicited `NEW_ENVIRON INFO` update sent when a
    /// reattaching client's IP differs from the one last announced, but
    /// only once negotiation has already happened (`spec.md` §4.1, §4.5).
    #[must_use]
    pub fn build_ip_change_announcement(&self, new_ip: &str) -> Option<Vec<u8>> {
        self.negotiated.then(|| build_new_environ_reply(INFO, new_ip))
    }
}

/// Scans `data` (the bytes immediately following `IAC SB`, option byte
/// included) for the `IAC SE` terminator, treating an `IAC IAC` pair inside
/// the payload as an escaped literal `0xFF` rather than a candidate
/// terminator. Returns the offset of the terminating `IAC` within `data`.
fn find_subneg_terminator(data: &[u8]) -> Option<usize> {
    let mut j = 0;
    while j + 1 < data.len() {
        if data[j] == IAC {
            match data[j + 1] {
                IAC => j += 2,
                SE => return Some(j),
                _ => j += 1, // unexpected IAC <cmd> inside payload; best-effort skip
            }
        } else {
            j += 1;
        }
    }
    None
}

/// Undoes the telnet-level `IAC IAC` doubling within a subnegotiation
/// payload, yielding the logical bytes the `NEW_ENVIRON` grammar operates
/// on.
fn unescape_iac_doubling(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == IAC && i + 1 < raw.len() && raw[i + 1] == IAC {
            out.push(IAC);
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

/// Handles an unescaped `NEW_ENVIRON` subnegotiation payload (option byte
/// plus sub-option data), returning an `IAC SB NEW_ENVIRON ...` reply to
/// write upstream if one is warranted.
fn handle_new_environ(payload: &[u8], client_ip: &str) -> Option<Vec<u8>> {
    let (&sub_option, rest) = payload.split_first()?;
    if sub_option != SEND {
        return None; // only SEND requests warrant a reply from this filter
    }
    let (is_empty, names) = parse_send_payload(rest);
    let wants_ip = is_empty || names.iter().any(|name| name == IPADDRESS);
    wants_ip.then(|| build_new_environ_reply(IS, client_ip))
}

/// Parses a `SEND` sub-option payload (everything after the `SEND` byte)
/// into the list of requested variable names, per the grammar in
/// `spec.md` §4.1: `(VAR name | USERVAR name)*`, where a name runs until
/// the next marker and `ESC <b>` escapes a literal byte `b` within it.
///
/// Returns `(payload_was_empty, names)`; an empty payload means "send
/// everything" per the spec.
fn parse_send_payload(payload: &[u8]) -> (bool, Vec<Vec<u8>>) {
    if payload.is_empty() {
        return (true, Vec::new());
    }
    let mut names = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut i = 0;
    while i < payload.len() {
        match payload[i] {
            VAR | USERVAR => {
                if let Some(name) = current.take() {
                    names.push(name);
                }
                current = Some(Vec::new());
                i += 1;
            }
            ESC if i + 1 < payload.len() => {
                if let Some(name) = current.as_mut() {
                    name.push(payload[i + 1]);
                }
                i += 2;
            }
            byte => {
                if let Some(name) = current.as_mut() {
                    name.push(byte);
                }
                i += 1;
            }
        }
    }
    if let Some(name) = current.take() {
        names.push(name);
    }
    (false, names)
}

/// Writes `raw` into `out`, escaping each byte per the rule in
/// `spec.md` §4.1: `IAC` (`0xFF`) becomes `IAC IAC`; `VAR`/`VALUE`/`ESC`/
/// `USERVAR` (`0`..`3`) become `ESC <byte>`; everything else passes
/// through unchanged.
fn push_escaped(out: &mut Vec<u8>, raw: &[u8]) {
    for &b in raw {
        match b {
            IAC => out.extend_from_slice(&[IAC, IAC]),
            VAR | VALUE | ESC | USERVAR => out.extend_from_slice(&[ESC, b]),
            _ => out.push(b),
        }
    }
}

/// Builds a full `NEW_ENVIRON` reply subnegotiation:
/// `IAC SB NEW_ENVIRON <kind> VAR "IPADDRESS" VALUE <ip> IAC SE`, where
/// `<kind>` is [`IS`] for a `SEND` answer or [`INFO`] for an unsolicited
/// update.
#[must_use]
fn build_new_environ_reply(kind: u8, ip: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + ip.len());
    out.extend_from_slice(&[IAC, SB, NEW_ENVIRON, kind, VAR]);
    push_escaped(&mut out, IPADDRESS);
    out.push(VALUE);
    push_escaped(&mut out, ip.as_bytes());
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// Builds a `NEW_ENVIRON IS` reply directly, exposed for callers (and
/// tests) that need the reply bytes without going through [`TerminalFilter`].
#[must_use]
pub fn build_is_reply(ip: &str) -> Vec<u8> {
    build_new_environ_reply(IS, ip)
}

/// Parses a previously-built `NEW_ENVIRON IS`/`INFO` reply's payload (the
/// bytes between the sub-option kind byte and the terminator, i.e. what
/// [`build_new_environ_reply`] writes after `kind`) back into
/// `(name, value)`. Used by the property test for P6 (escape round-trip).
#[must_use]
pub fn parse_is_reply_payload(payload: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let (&marker, rest) = payload.split_first()?;
    if marker != VAR {
        return None;
    }
    let mut name = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            VALUE => {
                let mut value = Vec::new();
                let mut k = i + 1;
                while k < rest.len() {
                    if rest[k] == ESC && k + 1 < rest.len() {
                        value.push(rest[k + 1]);
                        k += 2;
                    } else {
                        value.push(rest[k]);
                        k += 1;
                    }
                }
                return Some((name, value));
            }
            ESC if i + 1 < rest.len() => {
                name.push(rest[i + 1]);
                i += 2;
            }
            byte => {
                name.push(byte);
                i += 1;
            }
        }
    }
    None
}
