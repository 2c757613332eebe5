//! Message identity and header parsing: turns a raw header blob into the
//! normalized sender/subject/date/Message-ID fields the rest of the pipeline
//! keys on.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Parsed view over an RFC 5322 header block. Only the headers the
/// classifier and persistence layer care about are kept.
#[derive(Debug, Clone, Default)]
pub struct ParsedIdentity {
    pub message_id: String,
    pub message_id_synthesized: bool,
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub has_list_unsubscribe: bool,
    /// IP addresses pulled from `Received:` trace headers, outermost hop first.
    pub received_ips: Vec<String>,
    /// `true` only when the `Authentication-Results` header reports `pass`
    /// for SPF, DKIM, and DMARC. A missing header or any non-`pass` result
    /// counts as unauthenticated.
    pub auth_passed: bool,
}

/// Parse a raw header blob (as returned by `BODY.PEEK[HEADER]`) into a
/// `ParsedIdentity`. Header folding (continuation lines starting with
/// whitespace) is unfolded before field extraction.
pub fn parse_headers(raw: &[u8]) -> ParsedIdentity {
    let text = String::from_utf8_lossy(raw);
    let unfolded = unfold_headers(&text);
    let fields = split_fields(&unfolded);

    let message_id_raw = fields.get("message-id").cloned();
    let from_raw = fields.get("from").cloned().unwrap_or_default();
    let subject = fields.get("subject").cloned().unwrap_or_default();
    let date_raw = fields.get("date").cloned().unwrap_or_default();
    let has_list_unsubscribe = fields.contains_key("list-unsubscribe");

    let (sender, sender_domain) = parse_sender(&from_raw);
    let date = parse_date(&date_raw).unwrap_or_else(Utc::now);
    let received_ips = extract_received_ips(&unfolded);
    let auth_results_raw = fields.get("authentication-results").cloned().unwrap_or_default();
    let auth_passed = parse_auth_results(&auth_results_raw);

    let (message_id, synthesized) = match message_id_raw {
        Some(id) if !id.trim().is_empty() => (normalize_message_id(&id), false),
        _ => (synthesize_message_id(&sender, &subject, &date_raw), true),
    };

    ParsedIdentity {
        message_id,
        message_id_synthesized: synthesized,
        sender,
        sender_domain,
        subject,
        date,
        has_list_unsubscribe,
        received_ips,
        auth_passed,
    }
}

/// `Authentication-Results` is a single header with semicolon-separated
/// `method=result` clauses, e.g. `mx.example.com; spf=pass smtp.mailfrom=...;
/// dkim=pass header.d=...; dmarc=pass`. A message only counts as
/// authenticated when all three methods report `pass`.
fn parse_auth_results(raw: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    let lower = raw.to_lowercase();
    ["spf=pass", "dkim=pass", "dmarc=pass"]
        .iter()
        .all(|needle| lower.contains(needle))
}

/// RFC 2822 continuation lines begin with a space or tab; join them onto the
/// previous logical line before splitting on `:`.
fn unfold_headers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            out.push(' ');
            out.push_str(line.trim_start());
        } else {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
    }
    out
}

fn split_fields(unfolded: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in unfolded.lines() {
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_lowercase();
            let value = line[idx + 1..].trim().to_string();
            // First occurrence wins, matching how mail clients treat duplicate headers.
            fields.entry(name).or_insert(value);
        }
    }
    fields
}

/// Parse `"Name" <user@domain>` or a bare `user@domain` into
/// `(lowercased_email, lowercased_domain)`.
fn parse_sender(from: &str) -> (String, String) {
    let email = if let (Some(start), Some(end)) = (from.find('<'), from.find('>')) {
        from[start + 1..end].trim().to_string()
    } else {
        from.trim().trim_matches('"').to_string()
    };
    let email = email.to_lowercase();
    let domain = email.split('@').nth(1).unwrap_or("").to_string();
    (email, domain)
}

fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .ok()
}

/// Deterministic fallback identity for messages a provider delivered without
/// a `Message-ID` header (seen in the wild from some bulk senders). Stable
/// across re-fetches of the same message so idempotency holds.
pub fn synthesize_message_id(sender: &str, subject: &str, date_raw: &str) -> String {
    let key = format!("{}|{}|{}", sender, subject, date_raw);
    let digest = md5::compute(key.as_bytes());
    format!("<generated.{:x}@local>", digest)
}

fn normalize_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        trimmed.to_string()
    } else {
        format!("<{}>", trimmed)
    }
}

/// Pull every IPv4 literal out of `Received:` trace headers plus the
/// `X-Originating-IP`/`X-Sender-IP` headers some providers add, bottom-up
/// (the `Received` chain is stored top-down, most-recent hop first, so the
/// chain is walked in reverse to prefer the oldest, outermost hop first).
/// RFC1918 and loopback addresses are dropped: they identify internal relays,
/// not the sender, and would only ever point Tier 2's GeoIP lookup at the
/// recipient's own network.
fn extract_received_ips(unfolded: &str) -> Vec<String> {
    let mut ips = Vec::new();
    let mut push_candidates = |line: &str| {
        for token in line.split(|c: char| !c.is_ascii_alphanumeric() && c != '.') {
            if is_ipv4_literal(token) && !is_private_or_loopback(token) && !ips.contains(&token.to_string()) {
                ips.push(token.to_string());
            }
        }
    };

    let received_lines: Vec<&str> = unfolded
        .lines()
        .filter(|line| line.to_lowercase().starts_with("received:"))
        .collect();
    for line in received_lines.iter().rev() {
        push_candidates(line);
    }

    for line in unfolded.lines() {
        let lower = line.to_lowercase();
        if lower.starts_with("x-originating-ip:") || lower.starts_with("x-sender-ip:") {
            push_candidates(line);
        }
    }

    ips
}

fn is_ipv4_literal(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}

/// RFC1918 private ranges (`10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16`)
/// and the loopback range (`127.0.0.0/8`): never useful as a Tier 2 signal.
fn is_private_or_loopback(ip: &str) -> bool {
    let octets: Vec<u8> = ip.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 {
        return false;
    }
    match octets[0] {
        10 | 127 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}
