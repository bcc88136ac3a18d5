// Routing and forwarding engine.
//
// Requests: classify (initial / in-dialog / ACK / CANCEL), pick the target,
// push our Via, consume Route, rewrite for NAT, forward. Responses: pop our
// Via, route by the next hop's Via (or the dialog's caller for final INVITE
// responses), retire per-call state. Every terminal event feeds the CDR
// recorder exactly once; retransmissions find the state already gone and
// produce no further side effects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::auth::DigestAuthenticator;
use crate::cdr::{CallState, CdrRecorder, RecordType};
use crate::config::{Config, SharedConfig};
use crate::dialog::{BranchTable, DialogState, DialogTable, PendingTable};
use crate::registrar::{Binding, Registrar};
use crate::sip::formatter::format_sip_message;
use crate::sip::message::{
    Header, Headers, Method, NameAddr, SipMessage, SipRequest, SipResponse, Via,
};
use crate::sip::parser::{parse_sip_message, ParseError};
use crate::sip::uri::SipUri;
use crate::timer;
use crate::transport::{SendErrorKind, SipTransport};

const ALLOW: &str =
    "INVITE, ACK, CANCEL, BYE, OPTIONS, PRACK, UPDATE, REFER, NOTIFY, SUBSCRIBE, MESSAGE, REGISTER";
const SERVER_HEADER: &str = concat!("ims-sip-proxy/", env!("CARGO_PKG_VERSION"));

/// Response codes that terminate a forwarding path: never propagated further
/// up a chain we initiated.
const END_OF_PATH: &[u16] = &[482, 483, 502, 503, 504];

/// The proxy engine. Owns every per-call table; nothing here is global.
pub struct ProxyCore {
    transport: Arc<dyn SipTransport>,
    config: Arc<SharedConfig>,
    auth: DigestAuthenticator,
    /// Consecutive failed-auth counter per source, reset on success and at
    /// each sweep window. A future policy hook may blacklist on it; the
    /// core only counts and logs.
    auth_failures: dashmap::DashMap<std::net::IpAddr, u32>,
    registrar: Registrar,
    dialogs: DialogTable,
    pending: PendingTable,
    branches: BranchTable,
    cdr: Arc<CdrRecorder>,
}

impl ProxyCore {
    pub fn new(
        transport: Arc<dyn SipTransport>,
        config: Arc<SharedConfig>,
        cdr: Arc<CdrRecorder>,
    ) -> Self {
        ProxyCore {
            transport,
            config,
            auth: DigestAuthenticator::new(),
            auth_failures: dashmap::DashMap::new(),
            registrar: Registrar::new(),
            dialogs: DialogTable::new(),
            pending: PendingTable::new(),
            branches: BranchTable::new(),
            cdr,
        }
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn cdr(&self) -> &CdrRecorder {
        &self.cdr
    }

    /// Entry point for every received datagram.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        // UA keepalives: empty or CRLF-only payloads.
        if data.iter().all(|b| matches!(b, b'\r' | b'\n' | b' ')) {
            return;
        }

        match parse_sip_message(data) {
            Ok(SipMessage::Request(req)) => {
                tracing::info!(
                    tag = "RX",
                    method = %req.method,
                    uri = %req.uri,
                    from = %from,
                    call_id = req.headers.call_id().unwrap_or("<none>"),
                );
                self.handle_request(req, from).await;
            }
            Ok(SipMessage::Response(resp)) => {
                tracing::info!(
                    tag = "RX",
                    status = resp.status,
                    from = %from,
                    call_id = resp.headers.call_id().unwrap_or("<none>"),
                );
                self.handle_response(resp, from).await;
            }
            Err(e) => self.handle_parse_failure(data, from, e).await,
        }
    }

    /// Malformed requests get a best-effort 400 when enough of the header
    /// section survived to route one; malformed responses are dropped.
    async fn handle_parse_failure(&self, data: &[u8], from: SocketAddr, err: ParseError) {
        if data.starts_with(b"SIP/") {
            tracing::debug!(tag = "DROP", from = %from, reason = %err, "unparseable response");
            return;
        }
        tracing::warn!(tag = "DROP", from = %from, reason = %err, "unparseable request");

        let headers = salvage_headers(data);
        if headers.top_via().is_none() {
            return;
        }
        let resp = SipResponse {
            status: 400,
            reason: "Bad Request".to_string(),
            headers,
            body: Vec::new(),
        };
        self.send_response(resp, from).await;
    }

    async fn handle_request(&self, mut req: SipRequest, from: SocketAddr) {
        let cfg = self.config.load();

        // NAT bookkeeping on the peer's own Via so responses can route back
        // through the same hole.
        if let Some((host, port)) = nat_endpoint(&cfg, from) {
            if let Some(via) = req.headers.top_via_mut() {
                via.set_param("received", Some(&host));
                via.set_param("rport", Some(&port.to_string()));
            }
        }

        match req.method.clone() {
            Method::Register => self.handle_register(req, from, &cfg).await,
            Method::Options => self.handle_options(req, from, &cfg).await,
            Method::Ack => self.handle_ack(req, from, &cfg).await,
            Method::Invite
            | Method::Bye
            | Method::Cancel
            | Method::Message
            | Method::Update
            | Method::Prack
            | Method::Refer
            | Method::Notify
            | Method::Subscribe => self.forward_request(req, from, &cfg).await,
            Method::Other(name) => {
                tracing::debug!(tag = "DROP", method = %name, "unsupported method");
                let resp = build_response(&req, 405, "Method Not Allowed");
                self.send_response(resp, from).await;
            }
        }
    }

    // --- REGISTER ---

    async fn handle_register(&self, req: SipRequest, from: SocketAddr, cfg: &Config) {
        // Auth is enforced whenever users are configured. The 401 exchange
        // is part of the normal flow and never reaches the CDR.
        if !cfg.users.is_empty() {
            if !self.auth.verify(&req, &cfg.users, &cfg.server_ip) {
                let failures = {
                    let mut count = self.auth_failures.entry(from.ip()).or_insert(0);
                    *count += 1;
                    *count
                };
                if req.headers.other("Authorization").is_some() {
                    tracing::warn!(tag = "DROP", from = %from, failures, "authentication failed");
                }
                let mut resp = build_response(&req, 401, "Unauthorized");
                resp.headers.push(Header::Other(
                    "WWW-Authenticate".to_string(),
                    self.auth.create_challenge(&cfg.server_ip),
                ));
                self.send_response(resp, from).await;
                return;
            }
            self.auth_failures.remove(&from.ip());
        }

        let aor = match req.headers.to_header() {
            Some(to) => to.uri.aor(),
            None => {
                let resp = build_response(&req, 400, "Bad Request");
                self.send_response(resp, from).await;
                return;
            }
        };

        let call_id = req.headers.call_id().unwrap_or("").to_string();
        let cseq = req
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let user_agent = req.headers.other("User-Agent").unwrap_or("").to_string();
        let nat = nat_endpoint(cfg, from);
        let header_expires = req.headers.expires();
        let now = Instant::now();

        let mut removals = 0usize;
        let mut upserts = 0usize;
        let mut last_contact = String::new();
        let mut effective_expires = 0u32;

        for contact in req.headers.contacts() {
            let mut contact_uri = contact.uri.clone();
            if let Some((ref host, port)) = nat {
                contact_uri.set_host_port(host, port);
            }

            let requested = contact
                .param("expires")
                .and_then(|v| v.parse::<u32>().ok())
                .or(header_expires)
                .unwrap_or(3600);

            if requested == 0 {
                if self.registrar.remove(&aor, &contact_uri, from) {
                    removals += 1;
                }
                last_contact = contact_uri.to_string();
            } else {
                effective_expires = requested.min(cfg.registration_expires);
                last_contact = contact_uri.to_string();
                self.registrar.upsert(
                    &aor,
                    Binding {
                        contact: contact_uri,
                        source: from,
                        expires_at: now + std::time::Duration::from_secs(u64::from(effective_expires)),
                        call_id: call_id.clone(),
                        cseq: cseq.clone(),
                        user_agent: user_agent.clone(),
                    },
                );
                upserts += 1;
            }
        }

        // 200 OK listing every remaining binding with its remaining expiry.
        let mut resp = build_response(&req, 200, "OK");
        for binding in self.registrar.active_bindings(&aor, now) {
            let mut entry = NameAddr::from_uri(binding.contact.clone());
            entry.set_param("expires", Some(&binding.remaining(now).as_secs().to_string()));
            resp.headers.push(Header::Contact(entry));
        }
        tracing::info!(
            tag = "TX",
            status = 200,
            aor = %aor,
            upserts,
            removals,
            to = %from,
            "registration updated"
        );
        self.send_response(resp, from).await;

        if upserts == 0 && removals > 0 {
            self.cdr
                .record_unregister(&call_id, &aor, from, &last_contact, &user_agent, &cseq);
        } else {
            self.cdr.record_register(
                &call_id,
                &aor,
                from,
                &last_contact,
                effective_expires,
                &user_agent,
                &cseq,
            );
        }
    }

    // --- OPTIONS ---

    /// OPTIONS addressed to the proxy itself is answered directly; OPTIONS
    /// addressed to a registered user forwards like MESSAGE; an unknown
    /// user gets 404.
    async fn handle_options(&self, req: SipRequest, from: SocketAddr, cfg: &Config) {
        let call_id = req.headers.call_id().unwrap_or("").to_string();
        let cseq = req
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_default();

        if req.uri.user.is_none() {
            let mut resp = build_response(&req, 200, "OK");
            resp.headers
                .push(Header::Other("Accept".to_string(), "application/sdp".to_string()));
            resp.headers.push(Header::Other(
                "Supported".to_string(),
                "100rel, timer, path".to_string(),
            ));
            self.send_response(resp, from).await;
            let caller_uri = header_uri_string(req.headers.from_header());
            let callee_uri = header_uri_string(req.headers.to_header());
            self.cdr
                .record_options(&call_id, &caller_uri, &callee_uri, from, &cseq);
            return;
        }

        let aor = req.uri.aor();
        if self.registrar.lookup(&aor, Instant::now()).is_some() {
            self.forward_request(req, from, cfg).await;
            return;
        }

        let resp = build_response(&req, 404, "Not Found");
        self.send_response(resp, from).await;
        let caller_uri = header_uri_string(req.headers.from_header());
        let callee_uri = header_uri_string(req.headers.to_header());
        self.cdr.record_or_update(&call_id, RecordType::Options, |r| {
            r.state = CallState::Failed.as_str().to_string();
            r.status_code = "404".to_string();
            r.reason = "Not Found".to_string();
            r.caller_uri = caller_uri;
            r.callee_uri = callee_uri;
            r.caller_endpoint = from.to_string();
            r.cseq = cseq;
        });
        self.cdr.flush(&call_id, false);
    }

    // --- ACK ---

    /// Stateless proxy rule: no Via is ever added to an ACK.
    ///
    /// 2xx-ACK (dialog present) routes by the Route set and keeps the
    /// Request-URI the UAC produced. Non-2xx-ACK (dialog gone) must reach
    /// the same target as the original INVITE so the downstream transaction
    /// terminates and 4xx retransmissions stop.
    async fn handle_ack(&self, mut req: SipRequest, from: SocketAddr, cfg: &Config) {
        let call_id = req.headers.call_id().unwrap_or("").to_string();
        if !decrement_max_forwards(&mut req.headers, cfg.max_forwards) {
            // No response is ever sent to an ACK; an exhausted one just stops.
            tracing::debug!(tag = "DROP", call_id = %call_id, "ACK Max-Forwards exhausted");
            return;
        }

        if self.dialogs.contains(&call_id) {
            self.dialogs.touch(&call_id);
            strip_own_route(&mut req.headers, cfg);

            let mut dest = match req.headers.top_route() {
                Some(route) => route.uri.socket_addr(),
                None => req.uri.socket_addr(),
            };
            if dest.map(|d| is_self_addr(cfg, d)).unwrap_or(true) {
                dest = self.dialogs.get(&call_id).map(|d| d.callee);
            }
            let Some(dest) = dest else {
                tracing::debug!(tag = "DROP", call_id = %call_id, "2xx-ACK has no routable target");
                return;
            };
            self.pending.insert(&call_id, from);
            tracing::info!(tag = "FWD", method = "ACK", call_id = %call_id, dest = %dest);
            self.send_request(req, dest, from).await;
        } else {
            // Non-2xx ACK: restore the forwarded INVITE's target from the
            // registrar when the UAC echoed our own address back.
            if is_self_uri(cfg, &req.uri) || req.uri.socket_addr().is_none() {
                let aor = req
                    .headers
                    .to_header()
                    .map(|to| to.uri.aor())
                    .unwrap_or_default();
                match self.registrar.lookup(&aor, Instant::now()) {
                    Some(binding) => req.uri = binding.contact.without_params(),
                    None => {
                        tracing::debug!(tag = "DROP", call_id = %call_id, "non-2xx-ACK target unknown");
                        return;
                    }
                }
            }
            let Some(dest) = req.uri.socket_addr() else {
                tracing::debug!(tag = "DROP", call_id = %call_id, "non-2xx-ACK target unresolvable");
                return;
            };
            tracing::info!(tag = "FWD", method = "ACK", call_id = %call_id, dest = %dest, "non-2xx ACK");
            self.send_request(req, dest, from).await;
        }
    }

    // --- Request forwarding ---

    async fn forward_request(&self, mut req: SipRequest, from: SocketAddr, cfg: &Config) {
        let call_id = req.headers.call_id().unwrap_or("").to_string();

        if !decrement_max_forwards(&mut req.headers, cfg.max_forwards) {
            tracing::warn!(tag = "DROP", call_id = %call_id, "Max-Forwards exhausted");
            let resp = build_response(&req, 483, "Too Many Hops");
            self.send_response(resp, from).await;
            return;
        }

        // Loop: our own Via already on the stack means we forwarded this
        // request before.
        if req
            .headers
            .vias()
            .any(|v| v.sent_by_matches(&cfg.server_ip, cfg.server_port))
        {
            tracing::warn!(tag = "DROP", call_id = %call_id, "via loop detected");
            let resp = build_response(&req, 482, "Loop Detected");
            self.send_response(resp, from).await;
            if req.method == Method::Invite {
                self.cdr.record_call_fail(&call_id, 482, "Loop Detected");
            }
            return;
        }

        let initial = req.is_initial()
            && matches!(req.method, Method::Invite | Method::Message | Method::Options);

        if initial {
            self.forward_initial_request(req, from, cfg).await
        } else {
            self.forward_in_dialog_request(req, from, cfg).await
        }
    }

    async fn forward_initial_request(&self, mut req: SipRequest, from: SocketAddr, cfg: &Config) {
        let call_id = req.headers.call_id().unwrap_or("").to_string();
        let cseq = req
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let caller_uri = header_uri_string(req.headers.from_header());
        let callee_uri = header_uri_string(req.headers.to_header());
        let user_agent = req.headers.other("User-Agent").unwrap_or("").to_string();

        // A duplicate initial INVITE for a live dialog is a retransmission;
        // answer 100 so the UAC stops retrying, touch nothing else.
        if req.method == Method::Invite && self.dialogs.contains(&call_id) {
            tracing::debug!(tag = "DIALOG", call_id = %call_id, "duplicate initial INVITE");
            let resp = build_response(&req, 100, "Trying");
            self.send_response(resp, from).await;
            return;
        }

        // The UA's own Route set does not apply once we retarget.
        req.headers.remove_routes();

        let aor = req.uri.aor();
        let Some(binding) = self.registrar.lookup(&aor, Instant::now()) else {
            tracing::warn!(tag = "DROP", call_id = %call_id, aor = %aor, "no binding for target");
            let resp = build_response(&req, 480, "Temporarily Unavailable");
            self.send_response(resp, from).await;
            match req.method {
                Method::Invite => {
                    self.cdr.record_call_start(
                        &call_id, &caller_uri, &callee_uri, from, None, &user_agent, &cseq,
                    );
                    self.cdr
                        .record_call_fail(&call_id, 480, "Temporarily Unavailable");
                }
                Method::Message => {
                    let key = format!("{}:{}", call_id, cseq);
                    let (c, d) = (caller_uri.clone(), callee_uri.clone());
                    self.cdr.record_or_update(&key, RecordType::Message, |r| {
                        r.state = CallState::Failed.as_str().to_string();
                        r.call_id = call_id.clone();
                        r.status_code = "480".to_string();
                        r.reason = "Temporarily Unavailable".to_string();
                        r.caller_uri = c;
                        r.callee_uri = d;
                        r.caller_endpoint = from.to_string();
                        r.cseq = cseq.clone();
                    });
                    self.cdr.flush(&key, false);
                }
                _ => {}
            }
            return;
        };

        // Retarget to the chosen contact and stamp the forwarding path.
        req.uri = binding.contact.without_params();
        let dest = binding.contact.socket_addr().unwrap_or(binding.source);

        let branch = new_branch();
        let mut via = Via::new("UDP", &cfg.server_ip, cfg.server_port);
        via.set_param("branch", Some(&branch));
        via.set_param("rport", None);
        req.headers.push_top_via(via);

        // We rewrote the Request-URI, so we must stay on the path.
        let mut rr_uri = SipUri::parse(&format!("sip:{}:{}", cfg.server_ip, cfg.server_port))
            .expect("server identity URI");
        rr_uri.set_param("lr", None);
        req.headers.push_top_record_route(NameAddr::from_uri(rr_uri));

        self.pending.insert(&call_id, from);
        if req.method == Method::Invite {
            self.dialogs.insert(&call_id, from, dest);
            self.branches.insert(&call_id, &branch);
        }

        let method = req.method.clone();
        tracing::info!(tag = "FWD", method = %method, call_id = %call_id, dest = %dest, branch = %branch);
        if self.send_request(req, dest, from).await {
            match method {
                Method::Invite => {
                    self.cdr.record_call_start(
                        &call_id,
                        &caller_uri,
                        &callee_uri,
                        from,
                        Some(dest),
                        &user_agent,
                        &cseq,
                    );
                }
                Method::Message => {
                    self.cdr
                        .record_message(&call_id, &cseq, &caller_uri, &callee_uri, from, &user_agent);
                }
                _ => {}
            }
        }
    }

    async fn forward_in_dialog_request(&self, mut req: SipRequest, from: SocketAddr, cfg: &Config) {
        let call_id = req.headers.call_id().unwrap_or("").to_string();
        self.dialogs.touch(&call_id);

        strip_own_route(&mut req.headers, cfg);

        // CANCEL hits the downstream INVITE transaction only when its
        // Request-URI and top-Via branch match the forwarded INVITE.
        if req.method == Method::Cancel && is_self_uri(cfg, &req.uri) {
            let aor = req
                .headers
                .to_header()
                .map(|to| to.uri.aor())
                .unwrap_or_default();
            if let Some(binding) = self.registrar.lookup(&aor, Instant::now()) {
                req.uri = binding.contact.without_params();
            }
        }

        let mut dest = match req.headers.top_route() {
            Some(route) => route.uri.socket_addr(),
            None => req.uri.socket_addr(),
        };

        // A target that points back at us needs dialog memory to resolve.
        if dest.map(|d| is_self_addr(cfg, d)).unwrap_or(true) {
            dest = self.dialogs.get(&call_id).map(|dialog| {
                if dialog.caller == from {
                    dialog.callee
                } else {
                    dialog.caller
                }
            });
        }
        let Some(dest) = dest else {
            tracing::warn!(tag = "DROP", call_id = %call_id, method = %req.method, "no next hop");
            let resp = build_response(&req, 502, "Bad Gateway");
            self.send_response(resp, from).await;
            return;
        };

        let branch = if req.method == Method::Cancel {
            self.branches.get(&call_id).unwrap_or_else(new_branch)
        } else {
            new_branch()
        };
        let mut via = Via::new("UDP", &cfg.server_ip, cfg.server_port);
        via.set_param("branch", Some(&branch));
        via.set_param("rport", None);
        req.headers.push_top_via(via);

        self.pending.insert(&call_id, from);

        let method = req.method.clone();
        let cseq = req
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let caller_uri = header_uri_string(req.headers.from_header());
        let callee_uri = header_uri_string(req.headers.to_header());
        let user_agent = req.headers.other("User-Agent").unwrap_or("").to_string();

        tracing::info!(tag = "FWD", method = %method, call_id = %call_id, dest = %dest, branch = %branch);
        if self.send_request(req, dest, from).await {
            match method {
                Method::Bye => {
                    // Only the first BYE still finds the dialog; the CDR
                    // for a retransmission is suppressed here.
                    if self.dialogs.contains(&call_id) {
                        self.dialogs.set_state(&call_id, DialogState::Terminating);
                        self.cdr.record_call_end(&call_id, "Normal");
                    }
                }
                Method::Cancel => {
                    if self.dialogs.contains(&call_id) {
                        self.cdr.record_call_cancel(&call_id);
                    }
                }
                Method::Message => {
                    self.cdr
                        .record_message(&call_id, &cseq, &caller_uri, &callee_uri, from, &user_agent);
                }
                _ => {}
            }
        }
    }

    /// Send a forwarded request downstream. On failure, synthesize the
    /// method-appropriate response toward the requester and clean up call
    /// state so retransmissions cannot double-report. Returns true when the
    /// datagram left the socket.
    async fn send_request(&self, req: SipRequest, dest: SocketAddr, from: SocketAddr) -> bool {
        let method = req.method.clone();
        let call_id = req.headers.call_id().unwrap_or("").to_string();
        let data = format_sip_message(&SipMessage::Request(req.clone()));
        let failure = match self.transport.send_to(&data, dest).await {
            Ok(()) => return true,
            Err(f) => f,
        };

        match failure.kind {
            SendErrorKind::Unreachable => {
                tracing::warn!(tag = "NETWORK", dest = %dest, error = %failure, "target unreachable");
            }
            SendErrorKind::Other => {
                tracing::error!(tag = "NETWORK", dest = %dest, error = %failure, "send failed");
            }
        }

        let (status, reason): (u16, &str) = match failure.kind {
            SendErrorKind::Unreachable => match method {
                Method::Invite | Method::Message | Method::Options | Method::Register => {
                    (480, "Temporarily Unavailable")
                }
                Method::Bye => (408, "Request Timeout"),
                Method::Ack | Method::Cancel => {
                    // Nothing answers an ACK; a CANCEL toward a dead leg has
                    // no transaction left to cancel.
                    self.cleanup_call(&call_id);
                    return false;
                }
                _ => (503, "Service Unavailable"),
            },
            SendErrorKind::Other => (502, "Bad Gateway"),
        };

        let had_dialog = self.dialogs.contains(&call_id);
        let caller_uri = header_uri_string(req.headers.from_header());
        let callee_uri = header_uri_string(req.headers.to_header());
        let user_agent = req.headers.other("User-Agent").unwrap_or("").to_string();
        let cseq = req
            .headers
            .cseq()
            .map(|c| c.to_string())
            .unwrap_or_default();

        // The request carries our pushed Via; the synthesized response must
        // look like it came back through us, so drop it first.
        let cfg = self.config.load();
        let mut reply_to = req;
        if reply_to
            .headers
            .top_via()
            .map(|v| v.sent_by_matches(&cfg.server_ip, cfg.server_port))
            .unwrap_or(false)
        {
            reply_to.headers.pop_top_via();
        }
        let resp = build_response(&reply_to, status, reason);
        self.send_response(resp, from).await;

        match method {
            Method::Invite => {
                self.cdr.record_call_start(
                    &call_id, &caller_uri, &callee_uri, from, Some(dest), &user_agent, &cseq,
                );
                self.cdr.record_call_fail(&call_id, status, reason);
            }
            Method::Bye if had_dialog => {
                self.cdr.record_call_end(&call_id, "Timeout");
            }
            _ => {}
        }
        self.cleanup_call(&call_id);
        false
    }

    // --- Response forwarding ---

    async fn handle_response(&self, mut resp: SipResponse, from: SocketAddr) {
        let cfg = self.config.load();
        let call_id = resp.headers.call_id().unwrap_or("").to_string();
        let status = resp.status;

        let ours = resp
            .headers
            .top_via()
            .map(|v| v.sent_by_matches(&cfg.server_ip, cfg.server_port))
            .unwrap_or(false);
        if !ours {
            tracing::debug!(tag = "DROP", status, from = %from, "response top Via is not ours");
            return;
        }

        // End-of-path errors stop here instead of echoing up the chain.
        if END_OF_PATH.contains(&status) {
            tracing::warn!(tag = "DROP", status, call_id = %call_id, "end-of-path error response");
            return;
        }

        resp.headers.pop_top_via();
        let Some(next_via) = resp.headers.top_via() else {
            tracing::debug!(tag = "DROP", status, call_id = %call_id, "response has no remaining Via");
            return;
        };

        // Route by the next Via, honoring received/rport. Endpoints that
        // are not literal addresses (or are off-net without NAT markers)
        // fall back to the pending-request origin.
        let (via_host, via_port) = next_via.effective_endpoint();
        let mut dest: Option<SocketAddr> = format!("{}:{}", via_host, via_port).parse().ok();
        match dest {
            Some(addr) => {
                if !cfg.is_local_peer(addr.ip()) {
                    if let Some(origin) = self.pending.get(&call_id) {
                        dest = Some(origin);
                    }
                }
            }
            None => dest = self.pending.get(&call_id),
        }

        let cseq_method = resp.headers.cseq().map(|c| c.method.clone());
        let is_invite_response = cseq_method == Some(Method::Invite);

        // Dialog memory beats Via analysis for final INVITE responses: the
        // caller's Via may not be reachable post-NAT.
        if is_invite_response && status >= 200 {
            if let Some(dialog) = self.dialogs.get(&call_id) {
                dest = Some(dialog.caller);
            }
        }

        let Some(dest) = dest else {
            tracing::debug!(tag = "DROP", status, call_id = %call_id, "response target unresolvable");
            return;
        };
        if is_self_addr(&cfg, dest) {
            tracing::debug!(tag = "DROP", status, call_id = %call_id, "response would loop to self");
            return;
        }

        // State transitions and CDR milestones, exactly once per logical
        // event: retransmissions find the dialog gone and fall through.
        if is_invite_response {
            match status {
                180 | 183 => {
                    if self.dialogs.contains(&call_id) {
                        self.cdr.record_call_ringing(&call_id);
                        self.dialogs.touch(&call_id);
                    }
                }
                200..=299 => {
                    if self.dialogs.set_state(&call_id, DialogState::Confirmed) {
                        self.cdr.record_call_answer(&call_id, from);
                        tracing::info!(tag = "DIALOG", call_id = %call_id, state = "confirmed");
                    }
                }
                401 | 407 => {
                    // Challenge dance, not a failure: clear the half-open
                    // dialog so the authenticated retry starts clean.
                    self.cleanup_call(&call_id);
                }
                400..=699 => {
                    if self.dialogs.contains(&call_id) {
                        self.cdr.record_call_fail(&call_id, status, &resp.reason);
                        self.cleanup_call(&call_id);
                        tracing::info!(tag = "DIALOG", call_id = %call_id, status, state = "failed");
                    }
                }
                _ => {}
            }
        } else if status == 200 {
            match cseq_method {
                Some(Method::Bye) | Some(Method::Cancel) => {
                    if self.dialogs.remove(&call_id).is_some() {
                        tracing::info!(tag = "DIALOG", call_id = %call_id, state = "removed");
                    }
                    self.cdr.flush(&call_id, false);
                    self.pending.remove(&call_id);
                    self.branches.remove(&call_id);
                }
                _ => {}
            }
        }

        // The pending-request entry has served its purpose once a final
        // response passes through; retransmissions route via dialog memory
        // or the Via stack.
        if status >= 200 {
            self.pending.remove(&call_id);
        }

        tracing::info!(tag = "FWD", status, call_id = %call_id, dest = %dest);
        let data = format_sip_message(&SipMessage::Response(resp));
        if let Err(e) = self.transport.send_to(&data, dest).await {
            tracing::warn!(tag = "NETWORK", dest = %dest, error = %e, "response forward failed");
        }
    }

    /// Drop every per-call shortcut for this Call-ID.
    fn cleanup_call(&self, call_id: &str) {
        self.dialogs.remove(call_id);
        self.pending.remove(call_id);
        self.branches.remove(call_id);
    }

    async fn send_response(&self, resp: SipResponse, dest: SocketAddr) {
        tracing::info!(tag = "TX", status = resp.status, dest = %dest);
        let data = format_sip_message(&SipMessage::Response(resp));
        if let Err(e) = self.transport.send_to(&data, dest).await {
            tracing::warn!(tag = "NETWORK", dest = %dest, error = %e, "response send failed");
        }
    }

    // --- Timer sweep ---

    /// One pass of the periodic sweep: expired registrations, stale
    /// dialogs (timeout CDRs), aged pending requests and invite branches,
    /// old CDR tombstones, old nonces.
    pub fn sweep_once(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let expired = self.registrar.sweep_expired(now);
        if expired > 0 {
            tracing::info!(tag = "TIMER-REG", expired, "expired bindings removed");
        }

        for (call_id, _) in self.dialogs.sweep_idle(timer::DIALOG_TIMEOUT, now) {
            tracing::warn!(tag = "TIMER-DIALOG", call_id = %call_id, "stale dialog removed");
            if !self.cdr.is_flushed(&call_id) {
                self.cdr.record_call_timeout(&call_id);
            }
            self.pending.remove(&call_id);
            self.branches.remove(&call_id);
        }

        let pending = self.pending.sweep_older_than(timer::PENDING_CLEANUP, now);
        if pending > 0 {
            tracing::debug!(tag = "TIMER-PENDING", removed = pending);
        }

        let branches = self.branches.sweep_older_than(timer::BRANCH_CLEANUP, now);
        if branches > 0 {
            tracing::debug!(tag = "TIMER-BRANCH", removed = branches);
        }

        let tombstones = self.cdr.sweep_flushed(timer::FLUSHED_MAX_AGE, now);
        if tombstones > 0 {
            tracing::debug!(tag = "TIMER-CDR", removed = tombstones);
        }

        self.auth.sweep_nonces();
        self.auth_failures.clear();
    }
}

// --- Free helpers ---

/// Where a peer's addresses should be rewritten to, or None for local peers
/// that need no correction. The force-local testing flag collapses every
/// peer to loopback and wins over the local-network list.
fn nat_endpoint(cfg: &Config, from: SocketAddr) -> Option<(String, u16)> {
    if cfg.force_local_addr {
        return Some(("127.0.0.1".to_string(), from.port()));
    }
    if cfg.is_local_peer(from.ip()) {
        None
    } else {
        Some((from.ip().to_string(), from.port()))
    }
}

fn is_self_uri(cfg: &Config, uri: &SipUri) -> bool {
    let (host, port) = uri.host_port();
    host == cfg.server_ip && port == cfg.server_port
}

fn is_self_addr(cfg: &Config, addr: SocketAddr) -> bool {
    addr.ip().to_string() == cfg.server_ip && addr.port() == cfg.server_port
}

/// Consume our own top Route entry (loose routing) if present.
fn strip_own_route(headers: &mut Headers, cfg: &Config) {
    let ours = headers
        .top_route()
        .map(|r| {
            let (host, port) = r.uri.host_port();
            host == cfg.server_ip && port == cfg.server_port && r.uri.has_param("lr")
        })
        .unwrap_or(false);
    if ours {
        headers.pop_top_route();
    }
}

/// Decrement Max-Forwards (defaulting when absent). False means the request
/// must be rejected with 483.
fn decrement_max_forwards(headers: &mut Headers, default: u32) -> bool {
    let current = headers.max_forwards().unwrap_or(default);
    if current <= 1 {
        return false;
    }
    headers.set_max_forwards(current - 1);
    true
}

fn header_uri_string(header: Option<&NameAddr>) -> String {
    header.map(|h| h.uri.to_string()).unwrap_or_default()
}

/// Build a response to a request: Via stack copied in order, From/To/
/// Call-ID/CSeq echoed, a To tag added on final responses that lack one.
fn build_response(req: &SipRequest, status: u16, reason: &str) -> SipResponse {
    let mut headers = Headers::new();
    for via in req.headers.vias() {
        headers.push(Header::Via(via.clone()));
    }
    if let Some(from) = req.headers.from_header() {
        headers.push(Header::From(from.clone()));
    }
    if let Some(to) = req.headers.to_header() {
        let mut to = to.clone();
        if status >= 200 && to.tag().is_none() {
            to.set_param("tag", Some(&gen_tag()));
        }
        headers.push(Header::To(to));
    }
    if let Some(call_id) = req.headers.call_id() {
        headers.push(Header::CallId(call_id.to_string()));
    }
    if let Some(cseq) = req.headers.cseq() {
        headers.push(Header::CSeq(cseq.clone()));
    }
    headers.push(Header::Other("Server".to_string(), SERVER_HEADER.to_string()));
    headers.push(Header::Other("Allow".to_string(), ALLOW.to_string()));
    headers.push(Header::Other("Date".to_string(), sip_date()));
    SipResponse {
        status,
        reason: reason.to_string(),
        headers,
        body: Vec::new(),
    }
}

/// Salvage routable headers out of an unparseable request for the 400.
fn salvage_headers(data: &[u8]) -> Headers {
    let mut headers = Headers::new();
    let text = String::from_utf8_lossy(data);
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if ["Via", "From", "To", "Call-ID", "CSeq"]
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            if let Ok(parsed) = Header::parse_field(name, value) {
                for h in parsed {
                    headers.push(h);
                }
            }
        }
    }
    headers
}

/// RFC 1123 date for the Date header.
fn sip_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn gen_tag() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fresh Via branch with the RFC 3261 magic cookie.
fn new_branch() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("z9hG4bK-{}", suffix)
}
