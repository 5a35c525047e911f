//! Wire protocol integration tests over loopback TCP
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
//! Implementation: Requests are sent over real sockets to a running server

use snow_owl_finger::accounts::StaticAccounts;
use snow_owl_finger::file_server::FileServer;
use snow_owl_finger::{
    AddressFamily, AliasMap, AliasStore, FingerContext, FingerServer, ListenSocket, UserResolver,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn context(resolver: UserResolver) -> FingerContext {
    FingerContext {
        resolver,
        file_server: FileServer::default(),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
    }
}

fn homes_resolver(homes: &Path, aliases: &str) -> UserResolver {
    let store = AliasStore::new(None);
    store.replace(AliasMap::parse(aliases));
    UserResolver::new(Arc::new(store)).with_homes_dir(Some(homes.to_path_buf()))
}

fn start(context: FingerContext) -> TestServer {
    let socket = ListenSocket::bind(AddressFamily::Tcp4, Some(Ipv4Addr::LOCALHOST.into()), 0).unwrap();
    let server = FingerServer::new(context, vec![socket]);
    let addr = server.local_addrs()[0];
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run_until(std::future::pending::<String>()));
    TestServer { addr, shutdown }
}

async fn finger(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

fn make_home(root: &Path, user: &str, plan: Option<&str>) {
    let home = root.join(user);
    std::fs::create_dir_all(&home).unwrap();
    if let Some(plan) = plan {
        std::fs::write(home.join(".plan"), plan).unwrap();
    }
}

#[tokio::test]
async fn test_crlf_request_gets_crlf_lines() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("first\nsecond"));
    let server = start(context(homes_resolver(homes.path(), "")));

    let response = finger(server.addr, b"alice\r\n").await;
    assert_eq!(response, b"User: alice\r\nPlan:\r\nfirst\r\nsecond\r\n");
}

#[tokio::test]
async fn test_lf_request_gets_bare_lf_lines() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("first\r\nsecond\r\n"));
    let server = start(context(homes_resolver(homes.path(), "")));

    let response = finger(server.addr, b"alice\n").await;
    assert_eq!(response, b"User: alice\nPlan:\nfirst\nsecond\n");
    assert!(!response.contains(&b'\r'));
}

#[tokio::test]
async fn test_exactly_one_blank_line_between_users() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("a plan\n"));
    make_home(homes.path(), "bob", Some("b plan\n"));
    let server = start(context(homes_resolver(homes.path(), "")));

    let response = String::from_utf8(finger(server.addr, b"alice bob\r\n").await).unwrap();
    assert_eq!(
        response,
        "User: alice\r\nPlan: a plan\r\n\r\nUser: bob\r\nPlan: b plan\r\n"
    );
    assert!(!response.starts_with("\r\n"));
    assert!(!response.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn test_separator_names_match_unknown_users() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("hello\n"));
    let server = start(context(homes_resolver(homes.path(), "")));

    let unknown = finger(server.addr, b"nobody-here\n").await;
    assert_eq!(unknown, b"\"nobody-here\": no such user\n");

    for name in ["../alice", "alice/.plan", "a\\lice"] {
        let request = format!("{name}\n");
        let response = String::from_utf8(finger(server.addr, request.as_bytes()).await).unwrap();
        assert_eq!(response, format!("{:?}: no such user\n", name));
    }
}

#[tokio::test]
async fn test_unterminated_500_octets_gets_nothing() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("hello\n"));
    let server = start(context(homes_resolver(homes.path(), "")));

    let response = finger(server.addr, &[b'a'; 500]).await;
    assert!(response.is_empty());
}

#[tokio::test]
async fn test_listing_requests_are_denied() {
    let homes = TempDir::new().unwrap();
    let server = start(context(homes_resolver(homes.path(), "")));

    assert_eq!(finger(server.addr, b"\r\n").await, b"Local user listing denied.\r\n");
    assert_eq!(finger(server.addr, b"\n").await, b"Local user listing denied.\n");
    assert_eq!(
        finger(server.addr, b"/W\r\n").await,
        b"Local user long listing denied.\r\n"
    );
}

#[tokio::test]
async fn test_long_flag_is_not_a_username() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("hello\n"));
    let server = start(context(homes_resolver(homes.path(), "")));

    assert_eq!(
        finger(server.addr, b"/w alice\n").await,
        b"User: alice\nPlan: hello\n"
    );
}

/// NIST 800-53: AC-3 - A file owned by another account is never served
#[tokio::test]
async fn test_owner_mismatch_serves_nothing() {
    let homes = TempDir::new().unwrap();
    make_home(homes.path(), "alice", Some("top secret\n"));
    let owner = std::fs::metadata(homes.path().join("alice/.plan")).unwrap().uid();
    let claimed_uid = owner.wrapping_add(1).max(1);

    let accounts =
        StaticAccounts::new().with_account("alice", claimed_uid, homes.path().join("alice"));
    let resolver = homes_resolver(homes.path(), "").with_accounts(Arc::new(accounts), 1);
    let server = start(context(resolver));

    let response = String::from_utf8(finger(server.addr, b"alice\n").await).unwrap();
    assert!(response.starts_with("User: alice\n"));
    assert!(!response.contains("top secret"));
}

#[tokio::test]
async fn test_static_alias_reached_through_chain() {
    let homes = TempDir::new().unwrap();
    let static_file = homes.path().join("static.txt");
    std::fs::write(&static_file, "served as-is\n").unwrap();
    let aliases = format!("alice:{}\nbob:alice\n", static_file.display());
    let server = start(context(homes_resolver(homes.path(), &aliases)));

    assert_eq!(finger(server.addr, b"bob\n").await, b"served as-is\n");
}
