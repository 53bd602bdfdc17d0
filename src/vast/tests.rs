//! Unit tests for the marketplace client and its payload decoding.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{VastClient, creation_body, decode_created, decode_offers, decode_status, search_query};
use crate::provider::{
    DeploymentTemplate, Endpoint, InstanceId, InstanceStatus, OfferFilter, Provider, ProviderError,
};
use crate::test_support::offer;

#[test]
fn decodes_offer_list() {
    let body = r#"{"offers":[
        {"id":41,"gpu_name":"RTX 3060","num_gpus":2,"disk_space":58.5,"dph_total":0.21,
         "rentable":true,"min_bid":0.18,"verification":"verified","cuda_max_good":12.2},
        {"id":42,"gpu_name":"RTX A4000","dph_total":0.33}
    ]}"#;

    let offers = decode_offers(body).unwrap_or_else(|err| panic!("decode offers: {err}"));

    assert_eq!(offers.len(), 2);
    let first = offers.first().unwrap_or_else(|| panic!("first offer"));
    assert_eq!(first.id, 41);
    assert_eq!(first.num_gpus, 2);
    assert_eq!(first.min_bid, Some(0.18));
    assert_eq!(first.verification.as_deref(), Some("verified"));
    let second = offers.get(1).unwrap_or_else(|| panic!("second offer"));
    assert!(!second.rentable);
    assert_eq!(second.min_bid, None);
}

#[rstest]
#[case::not_json("<html>bad gateway</html>")]
#[case::missing_price(r#"{"offers":[{"id":1,"gpu_name":"RTX 3060"}]}"#)]
fn malformed_offer_list_is_rejected(#[case] body: &str) {
    let err = decode_offers(body).expect_err("payload is malformed");
    assert!(matches!(err, ProviderError::Rejected { status: None, .. }));
}

#[test]
fn decodes_new_contract_identifier() {
    let id = decode_created(r#"{"success":true,"new_contract":7654321}"#)
        .unwrap_or_else(|err| panic!("decode created: {err}"));
    assert_eq!(id, InstanceId(7_654_321));
}

#[test]
fn creation_response_without_contract_is_rejected() {
    let err = decode_created(r#"{"success":false,"msg":"offer unavailable"}"#)
        .expect_err("contract id is mandatory");
    assert!(err.to_string().contains("new_contract"), "{err}");
    assert!(!err.is_transient());
}

#[rstest]
#[case::null_status(r#"{"instances":{"actual_status":null}}"#, InstanceStatus::Created)]
#[case::loading(r#"{"instances":{"actual_status":"loading"}}"#, InstanceStatus::Loading)]
#[case::exited(r#"{"instances":{"actual_status":"exited"}}"#, InstanceStatus::Unknown)]
#[case::loading_with_null_connection_fields(
    r#"{"instances":{"actual_status":"loading","ports":null,"ssh_host":null}}"#,
    InstanceStatus::Loading
)]
#[case::created_with_unassigned_port(
    r#"{"instances":{"actual_status":"created","ssh_port":"pending","ports":{"22/tcp":null}}}"#,
    InstanceStatus::Created
)]
fn pending_instances_have_no_endpoint(#[case] body: &str, #[case] expected: InstanceStatus) {
    let report = decode_status(body).unwrap_or_else(|err| panic!("decode status: {err}"));
    assert_eq!(report.status, expected);
    assert_eq!(report.endpoint, None);
}

#[rstest]
#[case::proxy(
    r#"{"instances":{"actual_status":"running","ssh_host":"ssh5.vast.ai","ssh_port":31022,
        "public_ipaddr":"203.0.113.9","ports":{"22/tcp":[{"HostIp":"0.0.0.0","HostPort":"40100"}]}}}"#,
    "ssh5.vast.ai",
    31_022
)]
#[case::direct(
    r#"{"instances":{"actual_status":"running","ssh_host":"","public_ipaddr":"203.0.113.9",
        "ports":{"22/tcp":[{"HostIp":"0.0.0.0","HostPort":"40100"}],"8080/tcp":null}}}"#,
    "203.0.113.9",
    40_100
)]
fn running_instance_resolves_endpoint(#[case] body: &str, #[case] host: &str, #[case] port: u16) {
    let report = decode_status(body).unwrap_or_else(|err| panic!("decode status: {err}"));
    assert!(report.is_ready());
    assert_eq!(
        report.endpoint,
        Some(Endpoint {
            host: host.to_owned(),
            port,
        })
    );
}

#[rstest]
#[case::no_fields(r#"{"instances":{"actual_status":"running"}}"#)]
#[case::null_ports(r#"{"instances":{"actual_status":"running","ports":null,"ssh_host":null}}"#)]
fn running_instance_without_binding_is_not_ready(#[case] body: &str) {
    let report = decode_status(body).unwrap_or_else(|err| panic!("decode status: {err}"));
    assert_eq!(report.status, InstanceStatus::Running);
    assert!(!report.is_ready());
}

#[rstest]
#[case::no_record(r#"{"instances":null}"#)]
#[case::bad_port(
    r#"{"instances":{"actual_status":"running","public_ipaddr":"203.0.113.9",
        "ports":{"22/tcp":[{"HostPort":"ssh"}]}}}"#
)]
fn malformed_status_is_rejected(#[case] body: &str) {
    let err = decode_status(body).expect_err("payload is malformed");
    assert!(matches!(err, ProviderError::Rejected { .. }));
}

#[rstest]
#[case::any(false)]
#[case::verified(true)]
fn search_query_expresses_structural_constraints(#[case] verified_only: bool) {
    let filter = OfferFilter {
        min_disk_gb: 40,
        verified_only,
        limit: 10,
    };

    let query = search_query(&filter);

    assert_eq!(query["rentable"]["eq"], true);
    assert_eq!(query["disk_space"]["gte"], 40);
    assert_eq!(query["gpu_display_active"]["eq"], true);
    assert_eq!(query.get("verification").is_some(), verified_only);
}

#[test]
fn creation_body_carries_template_and_bid() {
    let template = DeploymentTemplate {
        template_id: Some(246_282),
        template_hash_id: Some(String::from("5ba61f6f")),
        image: String::from("vastai/linux-desktop:latest"),
        ports: vec![1111, 6100],
        env: BTreeMap::from([(String::from("DATA_DIRECTORY"), String::from("/workspace/"))]),
        onstart: String::from("entrypoint.sh"),
        runtype: String::from("ssh_direc ssh_proxy"),
        disk_gb: 32,
        min_duration_secs: 259_200,
    };

    let body = creation_body(&offer(9, "RTX 3060", 0.2), &template);

    assert_eq!(body["template_id"], 246_282);
    assert_eq!(body["client_id"], "me");
    assert_eq!(body["env"]["-p 1111:1111"], "1");
    assert_eq!(body["env"]["-p 6100:6100"], "1");
    assert_eq!(body["env"]["DATA_DIRECTORY"], "/workspace/");
    assert_eq!(body["disk"], 32);
    assert_eq!(body["last_known_min_bid"], 0.2);
    assert_eq!(body["min_duration"], 259_200);
}

#[test]
fn creation_body_omits_absent_template_reference() {
    let body = creation_body(&offer(9, "RTX 3060", 0.2), &DeploymentTemplate::default());
    assert!(body.get("template_id").is_none());
    assert!(body.get("template_hash_id").is_none());
}

/// Single-use HTTP server answering each connection with the next canned
/// response and recording the raw request.
struct CannedServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedServer {
    async fn start(responses: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("local addr: {err}"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            for (code, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                recorded
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(request);
                let response = format!(
                    "HTTP/1.1 {code} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        Self {
            base_url: format!("http://{addr}/api/v0/"),
            requests,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn client(&self) -> VastClient {
        VastClient::new(self.base_url.clone(), "secret-key", Duration::from_secs(5))
            .unwrap_or_else(|err| panic!("client: {err}"))
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let Ok(read) = stream.read(&mut chunk).await else {
            break;
        };
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(chunk.get(..read).unwrap_or_default());
        let text = String::from_utf8_lossy(&buffer).into_owned();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text
                .get(..head_end)
                .unwrap_or_default()
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buffer.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[tokio::test]
async fn search_sends_authenticated_ordered_query() {
    let server = CannedServer::start(vec![(
        200,
        r#"{"offers":[{"id":1,"dph_total":0.1},{"id":2,"dph_total":0.2},{"id":3,"dph_total":0.3}]}"#,
    )])
    .await;
    let filter = OfferFilter {
        limit: 2,
        ..OfferFilter::default()
    };

    let offers = server
        .client()
        .search_offers(&filter)
        .await
        .unwrap_or_else(|err| panic!("search: {err}"));

    assert_eq!(offers.len(), 2);
    let requests = server.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
    assert!(request.starts_with("GET /api/v0/bundles?q="), "{request}");
    assert!(request.contains("order=dph_total"), "{request}");
    assert!(request.contains("type=on-demand"), "{request}");
    assert!(request.contains("limit=2"), "{request}");
    assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-key"));
}

#[tokio::test]
async fn non_success_status_is_rejected_with_body() {
    let server = CannedServer::start(vec![(400, r#"{"error":"invalid_args"}"#)]).await;

    let err = server
        .client()
        .create_instance(&offer(5, "RTX 3060", 0.2), &DeploymentTemplate::default())
        .await
        .expect_err("400 must be rejected");

    assert_eq!(
        err,
        ProviderError::Rejected {
            operation: String::from("create_instance"),
            status: Some(400),
            message: String::from(r#"{"error":"invalid_args"}"#),
        }
    );
    let requests = server.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
    assert!(request.starts_with("PUT /api/v0/asks/5/"), "{request}");
    assert!(request.contains(r#""client_id":"me""#), "{request}");
}

#[tokio::test]
async fn status_and_registration_round_trip() {
    let server = CannedServer::start(vec![
        (
            200,
            r#"{"instances":{"actual_status":"running","ssh_host":"ssh1.vast.ai","ssh_port":2200}}"#,
        ),
        (200, r#"{"success":true}"#),
    ])
    .await;
    let client = server.client();

    let report = client
        .instance_status(InstanceId(77))
        .await
        .unwrap_or_else(|err| panic!("status: {err}"));
    client
        .register_public_key("ssh-ed25519 AAAA fleet")
        .await
        .unwrap_or_else(|err| panic!("register: {err}"));

    assert!(report.is_ready());
    let requests = server.requests();
    assert!(requests.first().is_some_and(|r| r.starts_with("GET /api/v0/instances/77/")));
    assert!(requests.get(1).is_some_and(|r| r.starts_with("PUT /api/v0/users/current/")
        && r.contains(r#""ssh_key":"ssh-ed25519 AAAA fleet""#)));
}

#[tokio::test]
async fn unreachable_api_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    drop(listener);
    let client = VastClient::new(format!("http://{addr}"), "key", Duration::from_secs(2))
        .unwrap_or_else(|err| panic!("client: {err}"));

    let err = client
        .instance_status(InstanceId(1))
        .await
        .expect_err("nothing is listening");

    assert!(err.is_transient(), "{err}");
}
