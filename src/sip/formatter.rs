// SIP message formatter
//
// Emits headers in a fixed, RFC-acceptable order: Via first (routing), then
// Record-Route, Route, From, To, Call-ID, CSeq, Max-Forwards, Contact, the
// remaining headers in arrival order, and Content-Length last. Content-Length
// is always recomputed from the body being serialized.

use super::message::{Header, Headers, SipMessage, SipRequest, SipResponse};

/// Format a SipMessage into wire bytes.
pub fn format_sip_message(msg: &SipMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    format_into(&mut buf, msg);
    buf
}

/// Format a SipMessage into an existing buffer (reused by the hot path).
pub fn format_into(buf: &mut Vec<u8>, msg: &SipMessage) {
    match msg {
        SipMessage::Request(req) => format_request(buf, req),
        SipMessage::Response(resp) => format_response(buf, resp),
    }
}

fn format_request(buf: &mut Vec<u8>, req: &SipRequest) {
    buf.extend_from_slice(req.method.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.uri.to_string().as_bytes());
    buf.extend_from_slice(b" SIP/2.0\r\n");
    format_headers_and_body(buf, &req.headers, &req.body);
}

fn format_response(buf: &mut Vec<u8>, resp: &SipResponse) {
    buf.extend_from_slice(b"SIP/2.0 ");
    buf.extend_from_slice(resp.status.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(resp.reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    format_headers_and_body(buf, &resp.headers, &resp.body);
}

fn write_header(buf: &mut Vec<u8>, header: &Header) {
    buf.extend_from_slice(header.name().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(header.value_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn format_headers_and_body(buf: &mut Vec<u8>, headers: &Headers, body: &[u8]) {
    let entries = headers.entries();

    for h in entries.iter().filter(|h| matches!(h, Header::Via(_))) {
        write_header(buf, h);
    }
    for h in entries.iter().filter(|h| matches!(h, Header::RecordRoute(_))) {
        write_header(buf, h);
    }
    for h in entries.iter().filter(|h| matches!(h, Header::Route(_))) {
        write_header(buf, h);
    }
    for h in entries.iter().filter(|h| {
        matches!(
            h,
            Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_) | Header::MaxForwards(_)
        )
    }) {
        write_header(buf, h);
    }
    for h in entries.iter().filter(|h| matches!(h, Header::Contact(_))) {
        write_header(buf, h);
    }
    for h in entries.iter().filter(|h| {
        matches!(h, Header::Expires(_) | Header::Other(_, _))
    }) {
        write_header(buf, h);
    }

    // Content-Length reflects the body actually being sent, never the
    // value that arrived.
    buf.extend_from_slice(b"Content-Length: ");
    buf.extend_from_slice(body.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(body);
}
