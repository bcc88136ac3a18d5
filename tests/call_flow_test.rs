// End-to-end flows over real UDP sockets: two UAs and the proxy on
// ephemeral loopback ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;

use ims_sip_proxy::cdr::CdrRecorder;
use ims_sip_proxy::config::{Config, SharedConfig};
use ims_sip_proxy::proxy::ProxyCore;
use ims_sip_proxy::sip::message::{SipMessage, SipRequest, SipResponse};
use ims_sip_proxy::sip::parser::parse_sip_message;
use ims_sip_proxy::transport::UdpTransport;

struct ProxyUnderTest {
    addr: SocketAddr,
    cdr_dir: TempDir,
}

async fn spawn_proxy() -> ProxyUnderTest {
    let transport = Arc::new(
        UdpTransport::bind("127.0.0.1".parse().unwrap(), 0)
            .await
            .expect("proxy bind"),
    );
    let addr = transport.local_addr().unwrap();

    let mut cfg = Config::default();
    cfg.server_ip = "127.0.0.1".to_string();
    cfg.server_port = addr.port();
    cfg.local_networks = vec!["127.0.0.1".to_string()];

    let cdr_dir = TempDir::new().unwrap();
    let cdr = Arc::new(CdrRecorder::new(cdr_dir.path(), true));
    let core = Arc::new(ProxyCore::new(
        transport.clone(),
        Arc::new(SharedConfig::new(cfg)),
        cdr,
    ));

    tokio::spawn(async move {
        loop {
            match transport.recv_from().await {
                Ok((data, from)) => core.handle_datagram(&data, from).await,
                Err(_) => break,
            }
        }
    });

    ProxyUnderTest { addr, cdr_dir }
}

struct TestUa {
    socket: UdpSocket,
    addr: SocketAddr,
    proxy: SocketAddr,
}

impl TestUa {
    async fn new(proxy: SocketAddr) -> TestUa {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        TestUa { socket, addr, proxy }
    }

    async fn send(&self, data: &[u8]) {
        self.socket.send_to(data, self.proxy).await.unwrap();
    }

    async fn recv(&self) -> SipMessage {
        let mut buf = vec![0u8; 65535];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv failed");
        parse_sip_message(&buf[..len]).expect("peer sent unparseable SIP")
    }

    async fn recv_response(&self) -> SipResponse {
        match self.recv().await {
            SipMessage::Response(resp) => resp,
            SipMessage::Request(req) => panic!("expected response, got {} request", req.method),
        }
    }

    async fn recv_request(&self) -> SipRequest {
        match self.recv().await {
            SipMessage::Request(req) => req,
            SipMessage::Response(resp) => panic!("expected request, got {} response", resp.status),
        }
    }

    fn register_msg(&self, user: &str, call_id: &str, cseq: u32) -> Vec<u8> {
        format!(
            "REGISTER sip:127.0.0.1:{pport} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-{user}-reg{cseq}\r\n\
             From: <sip:{user}@127.0.0.1>;tag=reg{user}\r\n\
             To: <sip:{user}@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} REGISTER\r\n\
             Contact: <sip:{user}@{me}>\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            pport = self.proxy.port(),
            me = self.addr,
            user = user,
            call_id = call_id,
            cseq = cseq,
        )
        .into_bytes()
    }

    async fn register(&self, user: &str) {
        self.send(&self.register_msg(user, &format!("reg-{}", user), 1))
            .await;
        let resp = self.recv_response().await;
        assert_eq!(resp.status, 200, "REGISTER should succeed");
    }
}

fn invite_msg(ua: &TestUa, callee: &str, call_id: &str) -> Vec<u8> {
    format!(
        "INVITE sip:{callee}@127.0.0.1:{pport} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {me};branch=z9hG4bK-inv-{call_id}\r\n\
         From: <sip:1001@127.0.0.1>;tag=alice\r\n\
         To: <sip:{callee}@127.0.0.1>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:1001@{me}>\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        pport = ua.proxy.port(),
        me = ua.addr,
        callee = callee,
        call_id = call_id,
    )
    .into_bytes()
}

/// Response a UAS would send: echo the Via stack and identity headers.
fn uas_response(req: &SipRequest, status: u16, reason: &str, to_tag: Option<&str>, contact: Option<SocketAddr>) -> Vec<u8> {
    let mut out = format!("SIP/2.0 {} {}\r\n", status, reason);
    for via in req.headers.vias() {
        out.push_str(&format!("Via: {}\r\n", via));
    }
    if let Some(from) = req.headers.from_header() {
        out.push_str(&format!("From: {}\r\n", from));
    }
    if let Some(to) = req.headers.to_header() {
        match (to.tag(), to_tag) {
            (None, Some(tag)) => out.push_str(&format!("To: {};tag={}\r\n", to, tag)),
            _ => out.push_str(&format!("To: {}\r\n", to)),
        }
    }
    if let Some(call_id) = req.headers.call_id() {
        out.push_str(&format!("Call-ID: {}\r\n", call_id));
    }
    if let Some(cseq) = req.headers.cseq() {
        out.push_str(&format!("CSeq: {}\r\n", cseq));
    }
    if let Some(contact) = contact {
        out.push_str(&format!("Contact: <sip:1002@{}>\r\n", contact));
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    out.into_bytes()
}

fn cdr_rows(proxy: &ProxyUnderTest) -> Vec<String> {
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let path = proxy
        .cdr_dir
        .path()
        .join(&date)
        .join(format!("cdr_{}.csv", date));
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .skip(1)
        .map(|l| l.to_string())
        .collect()
}

#[tokio::test]
async fn register_then_complete_call() {
    let proxy = spawn_proxy().await;
    let alice = TestUa::new(proxy.addr).await;
    let bob = TestUa::new(proxy.addr).await;

    alice.register("1001").await;
    bob.register("1002").await;

    // Alice calls Bob through the proxy.
    alice.send(&invite_msg(&alice, "1002", "e2e-call")).await;

    let invite = bob.recv_request().await;
    assert_eq!(invite.uri.host, "127.0.0.1");
    assert_eq!(invite.uri.port, Some(bob.addr.port()));
    let top = invite.headers.top_via().unwrap();
    assert_eq!(top.host, "127.0.0.1");
    assert_eq!(top.port, Some(proxy.addr.port()));
    assert!(invite.headers.record_routes().next().is_some());

    bob.send(&uas_response(&invite, 180, "Ringing", Some("bob"), None))
        .await;
    let ringing = alice.recv_response().await;
    assert_eq!(ringing.status, 180);

    bob.send(&uas_response(&invite, 200, "OK", Some("bob"), Some(bob.addr)))
        .await;
    let ok = alice.recv_response().await;
    assert_eq!(ok.status, 200);
    // Our Via is gone; Alice's own Via is on top again.
    assert_eq!(ok.headers.top_via().unwrap().port, Some(alice.addr.port()));

    // ACK through the recorded route.
    let ack = format!(
        "ACK sip:1002@{bob} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {me};branch=z9hG4bK-ack-e2e\r\n\
         Route: <sip:127.0.0.1:{pport};lr>\r\n\
         From: <sip:1001@127.0.0.1>;tag=alice\r\n\
         To: <sip:1002@127.0.0.1>;tag=bob\r\n\
         Call-ID: e2e-call\r\n\
         CSeq: 1 ACK\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        bob = bob.addr,
        me = alice.addr,
        pport = proxy.addr.port(),
    );
    alice.send(ack.as_bytes()).await;
    let fwd_ack = bob.recv_request().await;
    // Stateless ACK rule: our Via is absent.
    assert_eq!(fwd_ack.headers.via_count(), 1);
    assert_eq!(fwd_ack.headers.top_via().unwrap().port, Some(alice.addr.port()));

    // Hold the call briefly, then hang up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let bye = format!(
        "BYE sip:1002@{bob} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {me};branch=z9hG4bK-bye-e2e\r\n\
         Route: <sip:127.0.0.1:{pport};lr>\r\n\
         From: <sip:1001@127.0.0.1>;tag=alice\r\n\
         To: <sip:1002@127.0.0.1>;tag=bob\r\n\
         Call-ID: e2e-call\r\n\
         CSeq: 2 BYE\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        bob = bob.addr,
        me = alice.addr,
        pport = proxy.addr.port(),
    );
    alice.send(bye.as_bytes()).await;
    let fwd_bye = bob.recv_request().await;
    assert_eq!(fwd_bye.headers.via_count(), 2, "proxy Via added to BYE");

    bob.send(&uas_response(&fwd_bye, 200, "OK", None, None)).await;
    let bye_ok = alice.recv_response().await;
    assert_eq!(bye_ok.status, 200);

    // One merged CDR row for the whole call.
    let rows = cdr_rows(&proxy);
    let call_rows: Vec<_> = rows.iter().filter(|r| r.contains("e2e-call")).collect();
    assert_eq!(call_rows.len(), 1, "rows: {:?}", rows);
    assert!(call_rows[0].contains("ENDED"));
    assert!(call_rows[0].contains("1001"));
    assert!(call_rows[0].contains("1002"));
}

#[tokio::test]
async fn invite_to_unknown_user_returns_480() {
    let proxy = spawn_proxy().await;
    let alice = TestUa::new(proxy.addr).await;

    alice.register("1001").await;
    alice.send(&invite_msg(&alice, "1002", "e2e-noroute")).await;

    let resp = alice.recv_response().await;
    assert_eq!(resp.status, 480);

    let rows = cdr_rows(&proxy);
    let call_rows: Vec<_> = rows.iter().filter(|r| r.contains("e2e-noroute")).collect();
    assert_eq!(call_rows.len(), 1);
    assert!(call_rows[0].contains("FAILED"));
    assert!(call_rows[0].contains("480"));
}

#[tokio::test]
async fn options_health_check_answered_by_proxy() {
    let proxy = spawn_proxy().await;
    let ua = TestUa::new(proxy.addr).await;

    let options = format!(
        "OPTIONS sip:127.0.0.1:{pport} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {me};branch=z9hG4bK-opt-e2e\r\n\
         From: <sip:1001@127.0.0.1>;tag=opt\r\n\
         To: <sip:127.0.0.1>\r\n\
         Call-ID: e2e-options\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
        pport = proxy.addr.port(),
        me = ua.addr,
    );
    ua.send(options.as_bytes()).await;

    let resp = ua.recv_response().await;
    assert_eq!(resp.status, 200);
    assert!(resp.headers.other("Allow").unwrap().contains("REGISTER"));
}

#[tokio::test]
async fn busy_callee_returns_486_to_caller() {
    let proxy = spawn_proxy().await;
    let alice = TestUa::new(proxy.addr).await;
    let bob = TestUa::new(proxy.addr).await;

    alice.register("1001").await;
    bob.register("1002").await;

    alice.send(&invite_msg(&alice, "1002", "e2e-busy")).await;
    let invite = bob.recv_request().await;

    bob.send(&uas_response(&invite, 486, "Busy Here", Some("bob"), None))
        .await;
    let resp = alice.recv_response().await;
    assert_eq!(resp.status, 486);

    let rows = cdr_rows(&proxy);
    let call_rows: Vec<_> = rows.iter().filter(|r| r.contains("e2e-busy")).collect();
    assert_eq!(call_rows.len(), 1);
    assert!(call_rows[0].contains("FAILED"));
    assert!(call_rows[0].contains("486"));
}
