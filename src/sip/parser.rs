// SIP message parser
//
// nom combinators handle the start line; header lines are framed by hand so
// both CRLF and bare-LF terminated messages parse (some UAs send the latter).

use nom::{
    bytes::complete::take_while1,
    character::complete::{digit1, space1},
    combinator::rest,
    IResult,
};
use std::fmt;

use super::message::{Header, Headers, Method, SipMessage, SipRequest, SipResponse};
use super::uri::SipUri;

/// Parse error with descriptive messages
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

/// Parse a SIP message from raw datagram bytes.
///
/// The first line decides request vs response ("SIP/" prefix). Requests are
/// additionally validated to carry Call-ID, From, To, CSeq, and Via.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, ParseError> {
    if input.is_empty() {
        return Err(ParseError::new("empty input"));
    }

    if input.starts_with(b"SIP/") {
        parse_response(input)
    } else {
        parse_request(input)
    }
}

/// nom parser: METHOD SP Request-URI SP SIP-Version
fn request_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, method) = take_while1(|c: char| c.is_ascii_alphabetic())(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_while1(|c: char| !c.is_whitespace())(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = rest(input)?;
    Ok((input, (method, uri, version)))
}

/// nom parser: SIP-Version SP Status-Code SP Reason-Phrase
fn status_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, version) = take_while1(|c: char| !c.is_whitespace())(input)?;
    let (input, _) = space1(input)?;
    let (input, code) = digit1(input)?;
    let (input, reason) = rest(input.trim_start())?;
    Ok((input, (version, code, reason)))
}

/// Take one line off the input. Accepts CRLF and bare LF terminators.
fn next_line(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let nl = input.iter().position(|&b| b == b'\n')?;
    let line = if nl > 0 && input[nl - 1] == b'\r' {
        &input[..nl - 1]
    } else {
        &input[..nl]
    };
    Some((line, &input[nl + 1..]))
}

fn line_to_str(line: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(line).map_err(|_| ParseError::new("invalid UTF-8 in header section"))
}

/// Split the message into (start line, raw header fields, body bytes).
/// Folded continuation lines (leading SP/HT) append to the previous field.
fn split_message(input: &[u8]) -> Result<(String, Vec<(String, String)>, &[u8]), ParseError> {
    let (start, mut remaining) =
        next_line(input).ok_or_else(|| ParseError::new("missing line terminator"))?;
    let start = line_to_str(start)?.to_string();

    let mut fields: Vec<(String, String)> = Vec::new();
    loop {
        let (line, rest) = next_line(remaining)
            .ok_or_else(|| ParseError::new("message truncated before end of headers"))?;
        remaining = rest;
        if line.is_empty() {
            return Ok((start, fields, remaining));
        }
        let line = line_to_str(line)?;
        if line.starts_with(' ') || line.starts_with('\t') {
            match fields.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(ParseError::new("continuation line before first header")),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("header line missing colon: {}", line)))?;
        fields.push((name.to_string(), value.to_string()));
    }
}

fn build_headers(fields: &[(String, String)]) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for (name, value) in fields {
        for header in Header::parse_field(name, value)? {
            headers.push(header);
        }
    }
    Ok(headers)
}

/// Extract the body according to Content-Length, or take the remainder when
/// the header is absent.
fn frame_body(remaining: &[u8], headers: &Headers) -> Result<Vec<u8>, ParseError> {
    match headers.content_length() {
        Some(0) => Ok(Vec::new()),
        Some(len) => {
            if remaining.len() < len {
                Err(ParseError::new(format!(
                    "body too short: expected {} bytes, got {}",
                    len,
                    remaining.len()
                )))
            } else {
                Ok(remaining[..len].to_vec())
            }
        }
        None => Ok(remaining.to_vec()),
    }
}

fn parse_request(input: &[u8]) -> Result<SipMessage, ParseError> {
    let (start, fields, remaining) = split_message(input)?;

    let (_, (method_str, uri_str, version)) = request_line(&start)
        .map_err(|_| ParseError::new(format!("invalid request line: {}", start)))?;
    if !version.starts_with("SIP/") {
        return Err(ParseError::new(format!("invalid SIP version: {}", version)));
    }

    let method = Method::from_token(method_str);
    let uri = SipUri::parse(uri_str)?;
    let headers = build_headers(&fields)?;

    for (name, present) in [
        ("Call-ID", headers.call_id().is_some()),
        ("From", headers.from_header().is_some()),
        ("To", headers.to_header().is_some()),
        ("CSeq", headers.cseq().is_some()),
        ("Via", headers.top_via().is_some()),
    ] {
        if !present {
            return Err(ParseError::new(format!("request missing {} header", name)));
        }
    }

    let body = frame_body(remaining, &headers)?;

    Ok(SipMessage::Request(SipRequest {
        method,
        uri,
        headers,
        body,
    }))
}

fn parse_response(input: &[u8]) -> Result<SipMessage, ParseError> {
    let (start, fields, remaining) = split_message(input)?;

    let (_, (version, code_str, reason)) = status_line(&start)
        .map_err(|_| ParseError::new(format!("invalid status line: {}", start)))?;
    if !version.starts_with("SIP/") {
        return Err(ParseError::new(format!("invalid SIP version: {}", version)));
    }
    let status: u16 = code_str
        .parse()
        .map_err(|_| ParseError::new(format!("invalid status code: {}", code_str)))?;
    if !(100..700).contains(&status) {
        return Err(ParseError::new(format!("status code out of range: {}", status)));
    }

    let headers = build_headers(&fields)?;
    let body = frame_body(remaining, &headers)?;

    Ok(SipMessage::Response(SipResponse {
        status,
        reason: reason.trim().to_string(),
        headers,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse_request_ok(input: &[u8]) -> SipRequest {
        match parse_sip_message(input).unwrap() {
            SipMessage::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn parse_response_ok(input: &[u8]) -> SipResponse {
        match parse_sip_message(input).unwrap() {
            SipMessage::Response(resp) => resp,
            other => panic!("expected response, got {:?}", other),
        }
    }

    const BASE_REGISTER: &[u8] = b"REGISTER sip:proxy.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776\r\n\
        From: <sip:alice@example.com>;tag=1234\r\n\
        To: <sip:alice@example.com>\r\n\
        Call-ID: abc123@10.0.0.1\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:alice@10.0.0.1:5060>\r\n\
        \r\n";

    #[test]
    fn parse_register_request() {
        let req = parse_request_ok(BASE_REGISTER);
        assert_eq!(req.method, Method::Register);
        assert_eq!(req.uri.host, "proxy.example.com");
        assert_eq!(req.headers.call_id(), Some("abc123@10.0.0.1"));
        assert_eq!(req.headers.top_via().unwrap().branch(), Some("z9hG4bK776"));
        assert_eq!(req.headers.cseq().unwrap().seq, 1);
        assert!(req.body.is_empty());
    }

    #[test]
    fn parse_accepts_lf_only_line_endings() {
        let input = b"INVITE sip:bob@example.com SIP/2.0\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKx\n\
            From: <sip:alice@example.com>;tag=1\n\
            To: <sip:bob@example.com>\n\
            Call-ID: lf-test\n\
            CSeq: 1 INVITE\n\
            \n";
        let req = parse_request_ok(input);
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.headers.call_id(), Some("lf-test"));
    }

    #[test]
    fn parse_expands_compact_header_names() {
        let input = b"INVITE sip:bob@example.com SIP/2.0\r\n\
            v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKc\r\n\
            f: <sip:alice@example.com>;tag=1\r\n\
            t: <sip:bob@example.com>\r\n\
            i: compact-test\r\n\
            CSeq: 1 INVITE\r\n\
            m: <sip:alice@10.0.0.1:5060>\r\n\
            l: 0\r\n\
            \r\n";
        let req = parse_request_ok(input);
        assert_eq!(req.headers.call_id(), Some("compact-test"));
        assert!(req.headers.top_via().is_some());
        assert_eq!(req.headers.contacts().count(), 1);
        assert_eq!(req.headers.content_length(), Some(0));
    }

    #[test]
    fn parse_normalizes_comma_separated_vias_into_stack_order() {
        let input = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP p1:5060;branch=z9hG4bKa, SIP/2.0/UDP p2:5060;branch=z9hG4bKb\r\n\
            Via: SIP/2.0/UDP p3:5060;branch=z9hG4bKc\r\n\
            \r\n";
        let resp = parse_response_ok(input);
        let hosts: Vec<String> = resp.headers.vias().map(|v| v.host.clone()).collect();
        assert_eq!(hosts, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn parse_folded_header_continuation() {
        let input = b"SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            Subject: first part\r\n\
            \tsecond part\r\n\
            \r\n";
        let resp = parse_response_ok(input);
        assert_eq!(resp.headers.other("Subject"), Some("first part second part"));
    }

    #[test]
    fn parse_request_with_sdp_body() {
        let body = b"v=0\r\no=- 0 0 IN IP4 10.0.0.1\r\n";
        let mut input = format!(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKs\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: sdp-test\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: {}\r\n\
             \r\n",
            body.len()
        )
        .into_bytes();
        input.extend_from_slice(body);
        let req = parse_request_ok(&input);
        assert_eq!(req.body, body.to_vec());
    }

    #[test]
    fn parse_response_status_and_reason() {
        let input = b"SIP/2.0 481 Call/Transaction Does Not Exist\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            \r\n";
        let resp = parse_response_ok(input);
        assert_eq!(resp.status, 481);
        assert_eq!(resp.reason, "Call/Transaction Does Not Exist");
    }

    #[test]
    fn parse_response_does_not_require_request_headers() {
        // Responses are routed on the Via stack alone; a response missing
        // From/To still parses so that it can be dropped with context.
        let input = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            \r\n";
        let resp = parse_response_ok(input);
        assert_eq!(resp.status, 200);
    }

    // --- Error cases ---

    #[test]
    fn parse_empty_input_fails() {
        let err = parse_sip_message(b"").unwrap_err();
        assert!(err.message.contains("empty input"));
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_sip_message(b"this is not a SIP message\r\n\r\n").is_err());
    }

    #[test]
    fn parse_request_missing_required_headers_fails() {
        let input = b"INVITE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:bob@example.com>\r\n\
            CSeq: 1 INVITE\r\n\
            \r\n";
        let err = parse_sip_message(input).unwrap_err();
        assert!(err.message.contains("Call-ID"), "got: {}", err.message);
    }

    #[test]
    fn parse_request_missing_via_fails() {
        let input = b"BYE sip:bob@example.com SIP/2.0\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:bob@example.com>;tag=2\r\n\
            Call-ID: x\r\n\
            CSeq: 2 BYE\r\n\
            \r\n";
        let err = parse_sip_message(input).unwrap_err();
        assert!(err.message.contains("Via"), "got: {}", err.message);
    }

    #[test]
    fn parse_truncated_request_fails() {
        let input = b"INVITE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1:5060";
        assert!(parse_sip_message(input).is_err());
    }

    #[test]
    fn parse_non_numeric_max_forwards_fails() {
        let input = b"INVITE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: x\r\n\
            CSeq: 1 INVITE\r\n\
            Max-Forwards: many\r\n\
            \r\n";
        let err = parse_sip_message(input).unwrap_err();
        assert!(err.message.contains("Max-Forwards"), "got: {}", err.message);
    }

    #[test]
    fn parse_non_numeric_content_length_fails() {
        let input = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            Content-Length: abc\r\n\
            \r\n";
        assert!(parse_sip_message(input).is_err());
    }

    #[test]
    fn parse_body_shorter_than_content_length_fails() {
        let input = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            Content-Length: 100\r\n\
            \r\n\
            short";
        let err = parse_sip_message(input).unwrap_err();
        assert!(err.message.contains("body too short"));
    }

    #[test]
    fn parse_invalid_status_code_fails() {
        assert!(parse_sip_message(b"SIP/2.0 abc Bad\r\n\r\n").is_err());
        assert!(parse_sip_message(b"SIP/2.0 999 Out Of Range\r\n\r\n").is_err());
    }

    #[test]
    fn parse_request_with_bad_uri_fails() {
        let input = b"INVITE bob SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
            \r\n";
        assert!(parse_sip_message(input).is_err());
    }

    // --- Property tests ---

    const KNOWN_METHODS: &[&[u8]] = &[
        b"REGISTER", b"INVITE", b"ACK", b"BYE", b"CANCEL", b"OPTIONS", b"MESSAGE",
        b"UPDATE", b"PRACK", b"REFER", b"NOTIFY", b"SUBSCRIBE",
    ];

    fn starts_with_sip_method(data: &[u8]) -> bool {
        KNOWN_METHODS.iter().any(|m| data.starts_with(m))
    }

    proptest! {
        /// Random bytes that do not resemble SIP must produce a parse error,
        /// never a panic or a bogus message.
        #[test]
        fn prop_random_bytes_return_error(
            data in proptest::collection::vec(any::<u8>(), 0..120)
        ) {
            prop_assume!(!data.starts_with(b"SIP/"));
            prop_assume!(!starts_with_sip_method(&data));
            prop_assert!(parse_sip_message(&data).is_err());
        }

        /// Requests cut off mid-header must produce a parse error.
        #[test]
        fn prop_truncated_request_returns_error(
            method in prop_oneof![
                Just("REGISTER"), Just("INVITE"), Just("BYE"), Just("OPTIONS"),
            ],
            user in "[a-z]{1,8}",
        ) {
            let mut data = format!("{} sip:{}@example.com SIP/2.0\r\n", method, user).into_bytes();
            data.extend_from_slice(b"Via: SIP/2.0/UDP 10.0.0.1:5060");
            prop_assert!(parse_sip_message(&data).is_err());
        }

        /// Well-formed minimal requests always parse.
        #[test]
        fn prop_wellformed_request_parses(
            user in "[a-z][a-z0-9]{0,7}",
            call_id in "[a-z0-9]{4,16}",
            seq in 1u32..1000,
        ) {
            let input = format!(
                "INVITE sip:{}@example.com SIP/2.0\r\n\
                 Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKp\r\n\
                 From: <sip:caller@example.com>;tag=t1\r\n\
                 To: <sip:{}@example.com>\r\n\
                 Call-ID: {}\r\n\
                 CSeq: {} INVITE\r\n\
                 \r\n",
                user, user, call_id, seq
            );
            let msg = parse_sip_message(input.as_bytes()).unwrap();
            match msg {
                SipMessage::Request(req) => {
                    prop_assert_eq!(req.headers.call_id(), Some(call_id.as_str()));
                    prop_assert_eq!(req.headers.cseq().unwrap().seq, seq);
                }
                _ => prop_assert!(false, "expected request"),
            }
        }
    }
}
