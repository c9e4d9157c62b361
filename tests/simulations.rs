use std::io::{Read, Write};
use std::net::TcpStream;

use reqwest::StatusCode;

use unsub_agent::SimulationStatus;
use unsub_agent::simulation::{self, Simulation};

fn started(name: &str) -> (Simulation, String) {
    let mut sim = simulation::build(name).unwrap();
    let url = sim.start().unwrap();
    (sim, url)
}

async fn get(base: &str, path_and_query: &str) -> (StatusCode, String) {
    let url = format!("{}{}", base.trim_end_matches('/'), path_and_query);
    let response = reqwest::get(&url).await.unwrap();
    let status = response.status();
    (status, response.text().await.unwrap())
}

async fn finish(sim: Simulation) -> SimulationStatus {
    tokio::task::spawn_blocking(move || sim.finish()).await.unwrap()
}

/// Sends the request line untouched; HTTP clients normalize `..` away.
fn raw_get(port: u16, target: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    write!(
        stream,
        "GET {target} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[tokio::test]
async fn serves_on_a_loopback_ephemeral_port() {
    let (sim, url) = started("click_to_unsub");
    assert!(url.starts_with("http://127.0.0.1:"));
    assert_ne!(sim.port(), Some(0));
    let (status, body) = get(&url, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("/unsubscribe"));
    finish(sim).await;
}

#[tokio::test]
async fn no_decisive_request_means_failure() {
    let (sim, url) = started("click_to_unsub");
    get(&url, "/").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);
}

#[tokio::test]
async fn static_site_succeeds_without_any_action() {
    let (sim, url) = started("simple_1");
    let (_, body) = get(&url, "/").await;
    assert!(body.contains("unsubscribed"));
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn clicking_unsubscribe_succeeds() {
    let (sim, url) = started("click_to_unsub");
    let (status, body) = get(&url, "/unsubscribe").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("unsubscribed"));
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn last_decisive_request_wins() {
    let (sim, url) = started("bryant_park");
    get(&url, "/unsubscribe").await;
    get(&url, "/staysubscribed").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("bryant_park");
    get(&url, "/staysubscribed").await;
    get(&url, "/unsubscribe").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn enter_email_serves_its_script_and_records_the_verdict() {
    let (sim, url) = started("enter_email");
    let response = reqwest::get(format!("{url}enter_email.js")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/javascript"));
    assert!(response.text().await.unwrap().contains("annabelle.lee@gmail.com"));
    get(&url, "/updated_failure").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("enter_email");
    get(&url, "/updated_success").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn goldbelly_needs_the_unsubscribed_flag() {
    let (sim, url) = started("goldbelly");
    let (_, index) = get(&url, "/").await;
    assert!(index.contains("user[unsubscribed]"));
    get(&url, "/email_preferences?user%5Bunsubscribed%5D=false").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("goldbelly");
    let (status, body) = get(&url, "/email_preferences?user%5Bunsubscribed%5D=true").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Preferences updated"));
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn wandering_to_the_homepage_is_failure() {
    let (sim, url) = started("goldbelly");
    get(&url, "/email_preferences?user%5Bunsubscribed%5D=true").await;
    let (status, body) = get(&url, "/homepage").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("goldbelly"));
    assert_eq!(finish(sim).await, SimulationStatus::Failure);
}

#[tokio::test]
async fn honeywell_requires_unsubscribe_all() {
    let (sim, url) = started("honeywell");
    get(&url, "/update_preferences").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("honeywell");
    get(&url, "/update_preferences?items%5Btips%5D=tips&items%5Bunsuball%5D=unsuball").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn peco_requires_every_category_cleared() {
    let (sim, url) = started("peco");
    get(&url, "/update_preferences?19=on&26=on").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("peco");
    get(&url, "/update_preferences?19=&26=").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[tokio::test]
async fn fandango_accepts_either_path_out() {
    let (sim, url) = started("fandango");
    get(&url, "/update_preferences?email=a%40b.c&sub3=on").await;
    assert_eq!(finish(sim).await, SimulationStatus::Failure);

    let (sim, url) = started("fandango");
    get(&url, "/update_preferences?email=a%40b.c").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);

    let (sim, url) = started("fandango");
    get(&url, "/unsubscribe_all").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);

    let (sim, url) = started("fandango");
    get(&url, "/unsubscribe_all").await;
    let (status, body) = get(&url, "/homepage").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("404"));
    assert_eq!(finish(sim).await, SimulationStatus::Failure);
}

#[tokio::test]
async fn missing_pages_get_the_404_page() {
    let (sim, url) = started("click_to_unsub");
    let (status, body) = get(&url, "/no/such/page.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("404"));
    finish(sim).await;
}

#[tokio::test]
async fn directories_serve_their_index() {
    let (sim, url) = started("simple_1");
    let (status, body) = get(&url, "/peco/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("PECO"));
    finish(sim).await;
}

#[tokio::test]
async fn encoded_paths_are_decoded_before_routing() {
    let (sim, url) = started("simple_1");
    let (status, body) = get(&url, "/peco%2Findex.html").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("PECO"));
    finish(sim).await;

    let (sim, url) = started("click_to_unsub");
    get(&url, "/un%73ubscribe").await;
    assert_eq!(finish(sim).await, SimulationStatus::Success);
}

#[test]
fn encoded_traversal_is_still_refused() {
    let (sim, _) = started("click_to_unsub");
    let port = sim.port().unwrap();
    let response = raw_get(port, "/%2e%2e/Cargo.toml");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    let response = raw_get(port, "/..%2F..%2Fetc%2Fpasswd");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    sim.finish();
}

#[test]
fn traversal_out_of_the_asset_root_is_refused() {
    let (sim, _) = started("click_to_unsub");
    let port = sim.port().unwrap();
    let response = raw_get(port, "/../Cargo.toml");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    assert!(!response.contains("[package]"));
    let response = raw_get(port, "/../../../../etc/passwd");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    assert_eq!(sim.finish(), SimulationStatus::Failure);
}

#[test]
fn variant_pages_may_climb_to_the_shared_root() {
    let (sim, _) = started("goldbelly");
    let port = sim.port().unwrap();
    let response = raw_get(port, "/../updated.html");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("Preferences updated"));
    let response = raw_get(port, "/../../Cargo.toml");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    sim.finish();
}

#[test]
fn every_response_closes_its_connection() {
    let (sim, _) = started("simple_1");
    let response = raw_get(sim.port().unwrap(), "/").to_ascii_lowercase();
    assert!(response.contains("connection: close"));
    sim.finish();
}

#[test]
fn finish_releases_the_port() {
    let (sim, _) = started("simple_1");
    let port = sim.port().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).is_ok());
    sim.finish();
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}

#[test]
fn starting_twice_is_an_error() {
    let (mut sim, _) = started("peco");
    assert!(sim.start().is_err());
    sim.finish();
}

#[test]
fn dropping_an_unfinished_simulation_stops_its_server() {
    let (sim, _) = started("honeywell");
    let port = sim.port().unwrap();
    drop(sim);
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}
