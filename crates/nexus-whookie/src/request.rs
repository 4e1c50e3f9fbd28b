//! HTTP request-line parsing.
//!
//! The control plane speaks a narrow dialect: `GET` only, and the path is
//! split on the first `&` (or `?`) into a hook tag plus `k=v&k=v` options.
//! Keys and values are percent-decoded. A path must be absolute and must not
//! contain `..`.

use std::collections::BTreeMap;

use nexus_common::url::percent_decode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// `(tag, options)`
    Ok(String, BTreeMap<String, String>),
    /// 400-class problem with a reason
    Bad(&'static str),
}

/// Parse the request target of a `GET <target> HTTP/1.x` line.
pub fn parse_target(target: &str) -> ParseOutcome {
    if !target.starts_with('/') {
        return ParseOutcome::Bad("path must be absolute");
    }
    if target.contains("..") {
        return ParseOutcome::Bad("path must not contain ..");
    }

    let split_at = target.find(['&', '?']);
    let (raw_tag, raw_opts) = match split_at {
        Some(i) => (&target[..i], &target[i + 1..]),
        None => (target, ""),
    };

    let mut tag = percent_decode(raw_tag);
    // normalize a trailing slash so "/about/" matches "/about"
    if tag.len() > 1 && tag.ends_with('/') {
        tag.pop();
    }

    let mut opts = BTreeMap::new();
    for kv in raw_opts.split('&') {
        if kv.is_empty() {
            continue;
        }
        let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
        opts.insert(percent_decode(k), percent_decode(v));
    }

    ParseOutcome::Ok(tag, opts)
}

/// Parse a full request line, verifying the method.
pub fn parse_request_line(line: &str) -> ParseOutcome {
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    if method != "GET" {
        return ParseOutcome::Bad("only GET is supported");
    }
    if target.is_empty() {
        return ParseOutcome::Bad("missing request target");
    }
    parse_target(target)
}
